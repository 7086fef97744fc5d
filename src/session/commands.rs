// SPDX-License-Identifier: BSD-3-Clause

//! FTP command handlers, one per entry in the dispatch table, grounded in
//! `FtpSession`'s per-command methods (`ABOR`, `ALLO`, ... `USER`).

use crate::dirent::XferDirMode;
use crate::path_resolver;
use crate::sock_addr::SockAddr;

use super::transfer::XferFileMode;
use super::{Session, State};

const FEAT_TEXT: &str = "211-\r\n\
 MDTM\r\n\
 MLST Type{t};Size{s};Modify{m};Perm{p};UNIX.mode{u};\r\n\
 PASV\r\n\
 SIZE\r\n\
 TVFS\r\n\
 UTF8\r\n\
\r\n\
211 End\r\n";

const HELP_TEXT: &str = "214-\r\n\
The following commands are recognized\r\n\
 ABOR ALLO APPE CDUP CWD DELE FEAT HELP LIST MDTM MKD MLSD MLST MODE\r\n\
 NLST NOOP OPTS PASS PASV PORT PWD QUIT REST RETR RMD RNFR RNTO SITE\r\n\
 SIZE STAT STOR STOU STRU SYST TYPE USER XCUP XCWD XMKD XPWD XRMD\r\n\
214 End\r\n";

const SITE_HELP_TEXT: &str = "211-\r\n\
 Show this help: SITE HELP\r\n\
 Set username: SITE USER <NAME>\r\n\
 Set password: SITE PASS <PASS>\r\n\
 Set port: SITE PORT <PORT>\r\n\
 Save config: SITE SAVE\r\n\
211 End\r\n";

const FTPDCONFIG: &str = "ftpd.conf";

impl Session {
    pub(super) fn cmd_abor(&mut self, _args: &str) {
        if self.state == State::Command {
            self.send_response("225 No transfer to abort\r\n");
            return;
        }
        self.send_response("225 Aborted\r\n");
        self.send_response("425 Transfer aborted\r\n");
        self.set_state(State::Command, true, true);
    }

    pub(super) fn cmd_allo(&mut self, _args: &str) {
        self.send_response("202 Superfluous command\r\n");
        self.set_state(State::Command, false, false);
    }

    pub(super) fn cmd_appe(&mut self, args: &str) {
        if !self.authorized() {
            self.set_state(State::Command, false, false);
            self.send_response("530 Not logged in\r\n");
            return;
        }
        self.xfer_file(args, XferFileMode::Appe);
    }

    pub(super) fn cmd_cdup(&mut self, _args: &str) {
        self.set_state(State::Command, false, false);
        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }
        if !self.change_dir("..") {
            self.send_response("550 Failed to change directory\r\n");
            return;
        }
        self.send_response("200 OK\r\n");
    }

    pub(super) fn cmd_cwd(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }
        if !self.change_dir(args) {
            self.send_response("550 Failed to change directory\r\n");
            return;
        }
        self.send_response("200 OK\r\n");
    }

    pub(super) fn cmd_dele(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }
        let Some(path) = path_resolver::build_resolved_path(&self.cwd, args) else {
            self.send_response("553 Failed to resolve path\r\n");
            return;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => self.send_response("250 OK\r\n"),
            Err(e) => self.send_response(&format!("550 {e}\r\n")),
        }
    }

    pub(super) fn cmd_feat(&mut self, _args: &str) {
        self.set_state(State::Command, false, false);
        let star = |b: bool| if b { "*" } else { "" };
        let response = FEAT_TEXT
            .replace("{t}", star(self.mlst_facts.type_))
            .replace("{s}", star(self.mlst_facts.size))
            .replace("{m}", star(self.mlst_facts.modify))
            .replace("{p}", star(self.mlst_facts.perm))
            .replace("{u}", star(self.mlst_facts.unix_mode));
        self.send_response(&response);
    }

    pub(super) fn cmd_help(&mut self, _args: &str) {
        self.set_state(State::Command, false, false);
        self.send_response(HELP_TEXT);
    }

    pub(super) fn cmd_list(&mut self, args: &str) {
        if !self.authorized() {
            self.set_state(State::Command, false, false);
            self.send_response("530 Not logged in\r\n");
            return;
        }
        self.xfer_dir(args, XferDirMode::List, true);
    }

    pub(super) fn cmd_mdtm(&mut self, _args: &str) {
        self.set_state(State::Command, false, false);
        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }
        self.send_response("502 Command not implemented\r\n");
    }

    pub(super) fn cmd_mkd(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }
        let Some(path) = path_resolver::build_resolved_path(&self.cwd, args) else {
            self.send_response("553 Failed to resolve path\r\n");
            return;
        };
        match std::fs::create_dir(&path) {
            Ok(()) => self.send_response("250 OK\r\n"),
            Err(e) => self.send_response(&format!("550 {e}\r\n")),
        }
    }

    pub(super) fn cmd_mlsd(&mut self, args: &str) {
        if !self.authorized() {
            self.set_state(State::Command, false, false);
            self.send_response("530 Not logged in\r\n");
            return;
        }
        self.xfer_dir(args, XferDirMode::Mlsd, false);
    }

    pub(super) fn cmd_mlst(&mut self, args: &str) {
        if !self.authorized() {
            self.set_state(State::Command, false, false);
            self.send_response("530 Not logged in\r\n");
            return;
        }
        self.xfer_dir(args, XferDirMode::Mlst, false);
    }

    pub(super) fn cmd_mode(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        if args.eq_ignore_ascii_case("S") {
            self.send_response("200 OK\r\n");
            return;
        }
        self.send_response("504 Unavailable\r\n");
    }

    pub(super) fn cmd_nlst(&mut self, args: &str) {
        if !self.authorized() {
            self.set_state(State::Command, false, false);
            self.send_response("530 Not logged in\r\n");
            return;
        }
        self.xfer_dir(args, XferDirMode::Nlst, false);
    }

    pub(super) fn cmd_noop(&mut self, _args: &str) {
        self.send_response("200 OK\r\n");
    }

    pub(super) fn cmd_opts(&mut self, args: &str) {
        self.set_state(State::Command, false, false);

        if args.eq_ignore_ascii_case("UTF8")
            || args.eq_ignore_ascii_case("UTF8 ON")
            || args.eq_ignore_ascii_case("UTF8 NLST")
        {
            self.send_response("200 OK\r\n");
            return;
        }

        if args.len() >= 5 && args[..5].eq_ignore_ascii_case("MLST ") {
            let mut facts = crate::dirent::MlstFacts {
                type_: false,
                size: false,
                modify: false,
                perm: false,
                unix_mode: false,
            };

            for part in args[5..].split(';') {
                let part = part.trim();
                if part.eq_ignore_ascii_case("Type") {
                    facts.type_ = true;
                } else if part.eq_ignore_ascii_case("Size") {
                    facts.size = true;
                } else if part.eq_ignore_ascii_case("Modify") {
                    facts.modify = true;
                } else if part.eq_ignore_ascii_case("Perm") {
                    facts.perm = true;
                } else if part.eq_ignore_ascii_case("UNIX.mode") {
                    facts.unix_mode = true;
                }
            }

            self.mlst_facts = facts;

            let any = facts.type_ || facts.size || facts.modify || facts.perm || facts.unix_mode;
            let mut response = String::from("200 MLST OPTS");
            if any {
                response.push(' ');
            }
            if facts.type_ {
                response.push_str("Type;");
            }
            if facts.size {
                response.push_str("Size;");
            }
            if facts.modify {
                response.push_str("Modify;");
            }
            if facts.perm {
                response.push_str("Perm;");
            }
            if facts.unix_mode {
                response.push_str("UNIX.mode;");
            }
            response.push_str("\r\n");
            self.send_response(&response);
            return;
        }

        self.send_response("504 Invalid argument\r\n");
    }

    pub(super) fn cmd_pass(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        self.authorized_pass = false;

        let (user, pass) = {
            let cfg = self.config.lock().unwrap();
            (cfg.user().to_string(), cfg.pass().to_string())
        };

        if !user.is_empty() && !self.authorized_user {
            self.send_response("430 User not authorized\r\n");
            return;
        }

        if pass.is_empty() || pass == args {
            self.authorized_pass = true;
            self.send_response("230 OK\r\n");
            return;
        }

        self.send_response("430 Invalid password\r\n");
    }

    pub(super) fn cmd_pasv(&mut self, _args: &str) {
        if !self.authorized() {
            self.set_state(State::Command, false, false);
            self.send_response("530 Not logged in\r\n");
            return;
        }

        self.set_state(State::Command, true, true);
        self.pasv = false;
        self.port = false;

        let mut sock = match crate::socket::Socket::create() {
            Ok(s) => s,
            Err(_) => {
                self.send_response("451 Failed to create listening socket\r\n");
                return;
            }
        };
        let _ = sock.set_recv_buffer_size(super::SOCK_BUFFERSIZE);
        let _ = sock.set_send_buffer_size(super::SOCK_BUFFERSIZE);

        let mut addr = self
            .command_socket
            .as_ref()
            .map(|s| s.borrow().sock_name())
            .unwrap_or(SockAddr::ANY);
        addr.set_port(0);

        if sock.bind(addr).is_err() {
            self.send_response("451 Failed to bind address\r\n");
            return;
        }
        if sock.listen(1).is_err() {
            self.send_response("451 Failed to listen on socket\r\n");
            return;
        }
        if sock.set_nonblocking(true).is_err() {
            self.send_response("451 Failed to set non-blocking\r\n");
            return;
        }

        let bound = sock.sock_name();
        self.pasv_socket = Some(sock);
        self.pasv = true;
        self.send_response(&format!(
            "227 Entering Passive Mode ({}).\r\n",
            bound.to_pasv_tuple()
        ));
    }

    pub(super) fn cmd_port(&mut self, args: &str) {
        if !self.authorized() {
            self.set_state(State::Command, false, false);
            self.send_response("530 Not logged in\r\n");
            return;
        }

        self.set_state(State::Command, true, true);
        self.pasv = false;
        self.port = false;

        match parse_port_arg(args) {
            Some(addr) => {
                self.port_addr = addr;
                self.port = true;
                self.send_response("200 OK\r\n");
            }
            None => self.send_response("501 Invalid argument\r\n"),
        }
    }

    pub(super) fn cmd_pwd(&mut self, _args: &str) {
        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }
        let response = format!("257 \"{}\"\r\n", encode_quoted(&self.cwd));
        self.send_response(&response);
    }

    pub(super) fn cmd_quit(&mut self, _args: &str) {
        self.send_response("221 Disconnecting\r\n");
        self.close_command();
    }

    pub(super) fn cmd_rest(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }

        match args.parse::<u64>() {
            Ok(pos) if args.bytes().all(|b| b.is_ascii_digit()) && !args.is_empty() => {
                self.restart_position = pos;
                self.send_response("200 OK\r\n");
            }
            _ => self.send_response("504 Invalid argument\r\n"),
        }
    }

    pub(super) fn cmd_retr(&mut self, args: &str) {
        if !self.authorized() {
            self.set_state(State::Command, false, false);
            self.send_response("530 Not logged in\r\n");
            return;
        }
        self.xfer_file(args, XferFileMode::Retr);
    }

    pub(super) fn cmd_rmd(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }
        let Some(path) = path_resolver::build_resolved_path(&self.cwd, args) else {
            self.send_response("553 Failed to resolve path\r\n");
            return;
        };
        match std::fs::remove_dir(&path) {
            Ok(()) => self.send_response("250 OK\r\n"),
            Err(e) => self.send_response(&format!("550 {e}\r\n")),
        }
    }

    pub(super) fn cmd_rnfr(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }
        let Some(path) = path_resolver::build_resolved_path(&self.cwd, args) else {
            self.send_response("553 Failed to resolve path\r\n");
            return;
        };
        if std::fs::symlink_metadata(&path).is_err() {
            self.send_response("450 No such file or directory\r\n");
            return;
        }
        self.rename = Some(path);
        self.send_response("350 OK\r\n");
    }

    pub(super) fn cmd_rnto(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }

        let Some(from) = self.rename.take() else {
            self.send_response("503 Bad sequence of commands\r\n");
            return;
        };

        let Some(to) = path_resolver::build_resolved_path(&self.cwd, args) else {
            self.send_response("554 Failed to resolve path\r\n");
            return;
        };

        match std::fs::rename(&from, &to) {
            Ok(()) => self.send_response("250 OK\r\n"),
            Err(e) => self.send_response(&format!("550 {e}\r\n")),
        }
    }

    pub(super) fn cmd_site(&mut self, args: &str) {
        self.set_state(State::Command, false, false);

        let (cmd, arg) = match args.find(' ') {
            Some(pos) => (&args[..pos], args[pos + 1..].trim()),
            None => (args, ""),
        };

        if cmd.eq_ignore_ascii_case("HELP") {
            self.send_response(SITE_HELP_TEXT);
            return;
        }

        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }

        if cmd.eq_ignore_ascii_case("USER") {
            self.config.lock().unwrap().set_user(arg.to_string());
            self.send_response("200 OK\r\n");
        } else if cmd.eq_ignore_ascii_case("PASS") {
            self.config.lock().unwrap().set_pass(arg.to_string());
            self.send_response("200 OK\r\n");
        } else if cmd.eq_ignore_ascii_case("PORT") {
            let ok = self.config.lock().unwrap().set_port_str(arg);
            if !ok {
                self.send_response("550 Invalid port\r\n");
            } else {
                self.send_response("200 OK\r\n");
            }
        } else if cmd.eq_ignore_ascii_case("SAVE") {
            let result = self.config.lock().unwrap().save(FTPDCONFIG);
            match result {
                Ok(()) => self.send_response("200 OK\r\n"),
                Err(e) => self.send_response(&format!("550 {e}\r\n")),
            }
        } else {
            self.send_response("550 Invalid command\r\n");
        }
    }

    pub(super) fn cmd_size(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        if !self.authorized() {
            self.send_response("530 Not logged in\r\n");
            return;
        }
        let Some(path) = path_resolver::build_resolved_path(&self.cwd, args) else {
            self.send_response("553 Failed to resolve path\r\n");
            return;
        };
        match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => {
                self.send_response(&format!("213 {}\r\n", meta.len()));
            }
            Ok(_) => self.send_response("550 Not a file\r\n"),
            Err(e) => self.send_response(&format!("550 {e}\r\n")),
        }
    }

    pub(super) fn cmd_stat(&mut self, args: &str) {
        if self.state == State::DataConnect {
            self.send_response(
                "211-FTP server status\r\n Waiting for data connection\r\n211 End\r\n",
            );
            return;
        }
        if self.state == State::DataTransfer {
            self.send_response(&format!(
                "211-FTP server status\r\n Transferred {} bytes\r\n211 End\r\n",
                self.file_position
            ));
            return;
        }
        if args.is_empty() {
            self.send_response("211-FTP server status\r\n Ready\r\n211 End\r\n");
            return;
        }
        if !self.authorized() {
            self.set_state(State::Command, false, false);
            self.send_response("530 Not logged in\r\n");
            return;
        }
        self.xfer_dir(args, XferDirMode::Stat, false);
    }

    pub(super) fn cmd_stor(&mut self, args: &str) {
        if !self.authorized() {
            self.set_state(State::Command, false, false);
            self.send_response("530 Not logged in\r\n");
            return;
        }
        self.xfer_file(args, XferFileMode::Stor);
    }

    pub(super) fn cmd_stou(&mut self, _args: &str) {
        self.set_state(State::Command, false, false);
        self.send_response("502 Command not implemented\r\n");
    }

    pub(super) fn cmd_stru(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        if args.eq_ignore_ascii_case("F") {
            self.send_response("200 OK\r\n");
            return;
        }
        self.send_response("504 Unavailable\r\n");
    }

    pub(super) fn cmd_syst(&mut self, _args: &str) {
        self.set_state(State::Command, false, false);
        self.send_response("215 UNIX Type: L8\r\n");
    }

    pub(super) fn cmd_type(&mut self, _args: &str) {
        self.set_state(State::Command, false, false);
        self.send_response("200 OK\r\n");
    }

    pub(super) fn cmd_user(&mut self, args: &str) {
        self.set_state(State::Command, false, false);
        self.authorized_user = false;

        let (user, pass) = {
            let cfg = self.config.lock().unwrap();
            (cfg.user().to_string(), cfg.pass().to_string())
        };

        if user.is_empty() || user == args {
            self.authorized_user = true;
            if pass.is_empty() {
                self.send_response("230 OK\r\n");
            } else {
                self.send_response("331 Need password\r\n");
            }
            return;
        }

        self.send_response("430 Invalid user\r\n");
    }
}

fn encode_quoted(path: &str) -> String {
    path.replace('"', "\"\"")
}

/// Parse the `a,b,c,d,p1,p2` argument of a `PORT` command.
fn parse_port_arg(args: &str) -> Option<SockAddr> {
    let parts: Vec<&str> = args.split(',').collect();
    if parts.len() != 6 {
        return None;
    }

    let octet = |s: &str| s.parse::<u8>().ok();
    let a = octet(parts[0])?;
    let b = octet(parts[1])?;
    let c = octet(parts[2])?;
    let d = octet(parts[3])?;
    let p1 = octet(parts[4])? as u16;
    let p2 = octet(parts[5])? as u16;

    let addr = std::net::Ipv4Addr::new(a, b, c, d);
    let port = (p1 << 8) | p2;
    Some(SockAddr::new(addr, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_arg_accepts_well_formed_tuple() {
        let addr = parse_port_arg("192,168,1,2,31,145").unwrap();
        assert_eq!(addr.port(), 0x1F91);
    }

    #[test]
    fn parse_port_arg_rejects_wrong_field_count() {
        assert!(parse_port_arg("192,168,1,2,31").is_none());
    }

    #[test]
    fn parse_port_arg_rejects_out_of_range_octet() {
        assert!(parse_port_arg("192,168,1,2,999,1").is_none());
    }

    #[test]
    fn encode_quoted_doubles_embedded_quotes() {
        assert_eq!(encode_quoted("a\"b"), "a\"\"b");
    }
}
