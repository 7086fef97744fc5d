// SPDX-License-Identifier: BSD-3-Clause

//! Per-connection session state machine: command framing, dispatch, the
//! `COMMAND -> DATA_CONNECT -> DATA_TRANSFER` lifecycle, and response
//! writing. Grounded in `FtpSession`.

mod commands;
mod transfer;

use std::cell::RefCell;
use std::fs::{File, ReadDir};
use std::rc::Rc;
use std::time::Duration;

use log::{debug, error, info, trace};

use crate::config::SharedConfig;
use crate::dirent::{MlstFacts, XferDirMode};
use crate::sock_addr::SockAddr;
use crate::socket::{PollEvents, PollResult, Socket};

const SOCK_BUFFERSIZE: usize = 65536;
const COMMAND_BUFFERSIZE: usize = 4096;
const RESPONSE_BUFFERSIZE: usize = 4096;
const XFER_BUFFERSIZE: usize = 65536;

/// Telnet Data Mark byte, used to resynchronize the command stream after an
/// out-of-band ABOR/IP sequence.
const TELNET_DATA_MARK: u8 = 0xF2;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum State {
    Command,
    DataConnect,
    DataTransfer,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Transfer {
    List,
    Retrieve,
    Store,
}

/// A command socket kept alive only long enough to drain a half-close.
struct PendingClose {
    socket: Rc<RefCell<Socket>>,
}

pub struct Session {
    command_socket: Option<Rc<RefCell<Socket>>>,
    pasv_socket: Option<Socket>,
    data_socket: Option<Rc<RefCell<Socket>>>,
    pending_close: Vec<PendingClose>,

    config: SharedConfig,

    state: State,
    command_buffer: crate::io_buffer::IoBuffer,
    response_buffer: crate::io_buffer::IoBuffer,
    xfer_buffer: crate::io_buffer::IoBuffer,
    urgent: bool,

    cwd: String,
    lwd: String,
    rename: Option<String>,

    pasv: bool,
    port: bool,
    port_addr: SockAddr,

    authorized_user: bool,
    authorized_pass: bool,

    restart_position: u64,
    file_position: u64,
    file_size: u64,

    recv: bool,
    send: bool,
    transfer: Option<Transfer>,

    file: Option<File>,
    dir: Option<ReadDir>,
    dev_zero: bool,

    xfer_dir_mode: Option<XferDirMode>,
    mlst_facts: MlstFacts,

    dead: bool,
}

/// Static, alphabetically-sorted command dispatch table. Binary-searched
/// case-insensitively, mirroring `FtpSession::handlers`' `lower_bound` use.
type Handler = fn(&mut Session, &str);

const HANDLERS: &[(&str, Handler)] = &[
    ("ABOR", Session::cmd_abor),
    ("ALLO", Session::cmd_allo),
    ("APPE", Session::cmd_appe),
    ("CDUP", Session::cmd_cdup),
    ("CWD", Session::cmd_cwd),
    ("DELE", Session::cmd_dele),
    ("FEAT", Session::cmd_feat),
    ("HELP", Session::cmd_help),
    ("LIST", Session::cmd_list),
    ("MDTM", Session::cmd_mdtm),
    ("MKD", Session::cmd_mkd),
    ("MLSD", Session::cmd_mlsd),
    ("MLST", Session::cmd_mlst),
    ("MODE", Session::cmd_mode),
    ("NLST", Session::cmd_nlst),
    ("NOOP", Session::cmd_noop),
    ("OPTS", Session::cmd_opts),
    ("PASS", Session::cmd_pass),
    ("PASV", Session::cmd_pasv),
    ("PORT", Session::cmd_port),
    ("PWD", Session::cmd_pwd),
    ("QUIT", Session::cmd_quit),
    ("REST", Session::cmd_rest),
    ("RETR", Session::cmd_retr),
    ("RMD", Session::cmd_rmd),
    ("RNFR", Session::cmd_rnfr),
    ("RNTO", Session::cmd_rnto),
    ("SITE", Session::cmd_site),
    ("SIZE", Session::cmd_size),
    ("STAT", Session::cmd_stat),
    ("STOR", Session::cmd_stor),
    ("STOU", Session::cmd_stou),
    ("STRU", Session::cmd_stru),
    ("SYST", Session::cmd_syst),
    ("TYPE", Session::cmd_type),
    ("USER", Session::cmd_user),
    ("XCUP", Session::cmd_cdup),
    ("XCWD", Session::cmd_cwd),
    ("XMKD", Session::cmd_mkd),
    ("XPWD", Session::cmd_pwd),
    ("XRMD", Session::cmd_rmd),
];

/// Commands allowed while a transfer is in progress (everything else forces
/// the session back to `Command` with a `503`).
const TRANSFER_SAFE: &[&str] = &["ABOR", "NOOP", "PWD", "QUIT", "STAT", "XPWD"];

fn lookup_handler(name: &str) -> Option<Handler> {
    HANDLERS
        .binary_search_by(|(probe, _)| probe.to_ascii_uppercase().cmp(&name.to_ascii_uppercase()))
        .ok()
        .map(|idx| HANDLERS[idx].1)
}

impl Session {
    pub fn new(socket: Socket, config: SharedConfig) -> Self {
        let cwd = "/".to_string();
        let mut session = Self {
            command_socket: Some(Rc::new(RefCell::new(socket))),
            pasv_socket: None,
            data_socket: None,
            pending_close: Vec::new(),
            config,
            state: State::Command,
            command_buffer: crate::io_buffer::IoBuffer::new(COMMAND_BUFFERSIZE),
            response_buffer: crate::io_buffer::IoBuffer::new(RESPONSE_BUFFERSIZE),
            xfer_buffer: crate::io_buffer::IoBuffer::new(XFER_BUFFERSIZE),
            urgent: false,
            lwd: cwd.clone(),
            cwd,
            rename: None,
            pasv: false,
            port: false,
            port_addr: SockAddr::ANY,
            authorized_user: false,
            authorized_pass: false,
            restart_position: 0,
            file_position: 0,
            file_size: 0,
            recv: false,
            send: false,
            transfer: None,
            file: None,
            dir: None,
            dev_zero: false,
            xfer_dir_mode: None,
            mlst_facts: MlstFacts::default(),
            dead: false,
        };
        session.send_response("220 Hello!\r\n");
        session
    }

    pub fn dead(&self) -> bool {
        self.dead && self.pending_close.is_empty()
    }

    fn authorized(&self) -> bool {
        self.authorized_user && self.authorized_pass
    }

    /// Transition state, optionally tearing down the passive listener and/or
    /// data socket, mirroring `FtpSession::setState`.
    fn set_state(&mut self, state: State, close_pasv: bool, close_data: bool) {
        self.state = state;

        if close_pasv {
            self.close_pasv();
        }
        if close_data {
            self.close_data();
        }

        if state == State::Command {
            self.restart_position = 0;
            self.file_size = 0;
            self.file_position = 0;
            self.dev_zero = false;
            self.file = None;
            self.dir = None;
        }
    }

    fn close_socket(socket: &mut Option<Rc<RefCell<Socket>>>, pending: &mut Vec<PendingClose>) {
        if let Some(sock) = socket.take() {
            if Rc::strong_count(&sock) == 1 {
                {
                    let s = sock.borrow();
                    let _ = s.shutdown(std::net::Shutdown::Write);
                    let _ = s.set_linger(true, Duration::ZERO);
                }
                pending.push(PendingClose { socket: sock });
            }
        }
    }

    fn close_command(&mut self) {
        Self::close_socket(&mut self.command_socket, &mut self.pending_close);
        self.dead = self.command_socket.is_none();
    }

    fn close_pasv(&mut self) {
        self.pasv_socket = None;
    }

    fn close_data(&mut self) {
        Self::close_socket(&mut self.data_socket, &mut self.pending_close);
        self.recv = false;
        self.send = false;
    }

    fn change_dir(&mut self, arg: &str) -> bool {
        if arg == ".." {
            match self.cwd.rfind('/') {
                Some(0) | None => self.cwd = "/".to_string(),
                Some(pos) => self.cwd = self.cwd[..pos].to_string(),
            }
            return true;
        }

        let Some(path) = crate::path_resolver::build_resolved_path(&self.cwd, arg) else {
            return false;
        };
        if !crate::path_resolver::is_directory(&path) {
            return false;
        }
        self.cwd = path;
        true
    }

    /// Write as much of the response buffer as possible; on failure the
    /// command socket is torn down.
    fn write_response(&mut self) {
        let Some(sock) = self.command_socket.clone() else {
            return;
        };
        let rc = sock.borrow().write_from(&mut self.response_buffer);
        match rc {
            Ok(n) if n > 0 => {}
            _ => self.close_command(),
        }
    }

    /// Queue a response for the command socket, attempting an immediate
    /// non-blocking write. Mirrors `sendResponse`'s string_view overload.
    fn send_response(&mut self, response: &str) {
        if self.command_socket.is_none() {
            return;
        }
        trace!(target: "ftpd::wire", "-> {}", response.trim_end());

        if response.len() > self.response_buffer.free_size() {
            error!("not enough space for response");
            self.close_command();
            return;
        }
        self.response_buffer.free_area()[..response.len()].copy_from_slice(response.as_bytes());
        self.response_buffer.mark_used(response.len());

        let sock = self.command_socket.clone().unwrap();
        match sock.borrow().write_from(&mut self.response_buffer) {
            Ok(0) => self.close_command(),
            Err(e) if e.kind() != std::io::ErrorKind::WouldBlock => self.close_command(),
            _ => {}
        }
    }

    /// Find the next `\r\n`/`\n`-delimited command in the buffer, returning
    /// the split point and the offset of the byte after the delimiter.
    fn parse_command(buf: &[u8]) -> Option<(usize, usize)> {
        let mut i = 0;
        while i < buf.len() {
            if buf[i] == b'\r' && i + 1 < buf.len() && buf[i + 1] == b'\n' {
                return Some((i, i + 2));
            }
            if buf[i] == b'\n' {
                return Some((i, i + 1));
            }
            i += 1;
        }
        None
    }

    /// Read pending data from the command socket, handling OOB/urgent data
    /// and looping over any complete commands received so far.
    fn read_command(&mut self, priority: bool, readable: bool) {
        if priority {
            self.urgent = true;

            let Some(sock) = self.command_socket.clone() else {
                return;
            };
            let at_mark = match sock.borrow().at_mark() {
                Ok(v) => v,
                Err(_) => {
                    self.close_command();
                    return;
                }
            };

            if !at_mark {
                self.command_buffer.clear();
                let mut scratch = [0u8; COMMAND_BUFFERSIZE];
                match sock.borrow().read(&mut scratch, false) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(_) => self.close_command(),
                }
                return;
            }

            self.command_buffer.clear();
            let mut scratch = [0u8; 16];
            match sock.borrow().read(&mut scratch, true) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => self.close_command(),
            }
            self.command_buffer.clear();
            return;
        }

        if readable {
            let Some(sock) = self.command_socket.clone() else {
                return;
            };

            if self.command_buffer.free_size() == 0 {
                error!("exceeded command buffer size");
                self.close_command();
                return;
            }

            let rc = sock.borrow().read_into(&mut self.command_buffer, false);
            match rc {
                Ok(0) => {
                    info!("peer closed connection");
                    self.close_command();
                    return;
                }
                Err(e) if e.kind() != std::io::ErrorKind::WouldBlock => {
                    self.close_command();
                    return;
                }
                Err(_) => return,
                Ok(_) => {}
            }

            if self.urgent {
                let used = self.command_buffer.used_area();
                match used.iter().position(|&b| b == TELNET_DATA_MARK) {
                    Some(pos) => {
                        self.command_buffer.mark_free(pos + 1);
                        self.command_buffer.coalesce();
                        self.urgent = false;
                    }
                    None => return,
                }
            }
        }

        loop {
            let size = self.command_buffer.used_size();
            if size < 1 {
                return;
            }

            let buf = self.command_buffer.used_area().to_vec();
            let Some((delim, next)) = Self::parse_command(&buf) else {
                return;
            };

            let line = decode_path(&buf[..delim]);
            let (command, args) = split_command(&line);

            if command.eq_ignore_ascii_case("USER") || command.eq_ignore_ascii_case("PASS") {
                trace!(target: "ftpd::wire", "<- {command} ******");
            } else {
                trace!(target: "ftpd::wire", "<- {line}");
            }

            match lookup_handler(command) {
                None => {
                    let mut response = format!("502 Invalid command \"{}", encode_path(command, false));
                    if !args.is_empty() {
                        response.push(' ');
                        response.push_str(&encode_path(args, false));
                    }
                    response.push_str("\"\r\n");
                    self.send_response(&response);
                }
                Some(handler) if self.state != State::Command => {
                    if TRANSFER_SAFE.iter().any(|c| command.eq_ignore_ascii_case(c)) {
                        handler(self, args);
                    } else {
                        self.send_response("503 Invalid command during transfer\r\n");
                        self.set_state(State::Command, true, true);
                    }
                }
                Some(handler) => {
                    if !command.eq_ignore_ascii_case("RNTO") {
                        self.rename = None;
                    }
                    handler(self, args);
                }
            }

            self.command_buffer.mark_free(next);
            self.command_buffer.coalesce();
        }
    }

    /// One multiplexing cycle across the listener, every pending-close
    /// socket, and every session's command/data sockets — a single
    /// `poll()` syscall, mirroring `FtpServer::loop_`/`FtpSession::poll`
    /// together (the original keeps them separate only because each
    /// `FtpSession::poll` call already shares the server's one poll set;
    /// here `Server` has no sockets of its own besides the listener, so
    /// folding it into this call is the direct translation). New
    /// connections accepted during this call are appended to `sessions`
    /// and picked up on the next call. Returns `false` on a fatal poll
    /// error.
    pub fn poll(
        listener: &Socket,
        sessions: &mut Vec<Session>,
        config: &SharedConfig,
    ) -> std::io::Result<bool> {
        #[derive(Clone, Copy)]
        enum Target {
            PendingClose(usize, usize),
            Listener,
            Command(usize),
            Data(usize),
        }

        enum Owned<'a> {
            Rc(std::cell::Ref<'a, Socket>),
            Plain(&'a Socket),
        }
        impl std::ops::Deref for Owned<'_> {
            type Target = Socket;
            fn deref(&self) -> &Socket {
                match self {
                    Owned::Rc(r) => r,
                    Owned::Plain(s) => s,
                }
            }
        }

        let mut owned: Vec<Owned<'_>> = Vec::new();
        let mut poll_events: Vec<PollEvents> = Vec::new();
        let mut targets: Vec<Target> = Vec::new();
        let mut has_pending_close = false;

        for (sidx, session) in sessions.iter().enumerate() {
            for (pidx, pending) in session.pending_close.iter().enumerate() {
                owned.push(Owned::Rc(pending.socket.borrow()));
                poll_events.push(PollEvents { read: true, ..Default::default() });
                targets.push(Target::PendingClose(sidx, pidx));
                has_pending_close = true;
            }
        }

        owned.push(Owned::Plain(listener));
        poll_events.push(PollEvents { read: true, ..Default::default() });
        targets.push(Target::Listener);

        for (idx, session) in sessions.iter().enumerate() {
            if let Some(sock) = &session.command_socket {
                let mut ev = PollEvents { read: true, priority: true, ..Default::default() };
                if session.response_buffer.used_size() != 0 {
                    ev.write = true;
                }
                owned.push(Owned::Rc(sock.borrow()));
                poll_events.push(ev);
                targets.push(Target::Command(idx));
            }

            match session.state {
                State::Command => {}
                State::DataConnect => {
                    if session.pasv {
                        if let Some(sock) = &session.pasv_socket {
                            owned.push(Owned::Plain(sock));
                            poll_events.push(PollEvents { read: true, ..Default::default() });
                            targets.push(Target::Data(idx));
                        }
                    } else if let Some(sock) = &session.data_socket {
                        owned.push(Owned::Rc(sock.borrow()));
                        poll_events.push(PollEvents { write: true, ..Default::default() });
                        targets.push(Target::Data(idx));
                    }
                }
                State::DataTransfer => {
                    if let Some(sock) = &session.data_socket {
                        let ev = if session.recv {
                            PollEvents { read: true, ..Default::default() }
                        } else {
                            PollEvents { write: true, ..Default::default() }
                        };
                        owned.push(Owned::Rc(sock.borrow()));
                        poll_events.push(ev);
                        targets.push(Target::Data(idx));
                    }
                }
            }
        }

        // a pending-close socket needs to be reaped as soon as it drains,
        // so the whole call drops to a 0ms timeout whenever one is present.
        let timeout = if has_pending_close {
            Duration::ZERO
        } else {
            Duration::from_millis(100)
        };

        let poll_entries: Vec<(&Socket, PollEvents)> =
            owned.iter().map(|o| &**o).zip(poll_events.iter().copied()).collect();
        let (n, results) = Socket::poll(&poll_entries, timeout)?;
        drop(poll_entries);
        drop(owned);
        if n == 0 {
            return Ok(true);
        }

        let mut closed: Vec<(usize, usize)> = targets
            .iter()
            .zip(results.iter())
            .filter_map(|(target, result)| match *target {
                Target::PendingClose(sidx, pidx) if ready_any(result) => Some((sidx, pidx)),
                _ => None,
            })
            .collect();
        closed.sort_unstable_by(|a, b| b.cmp(a));
        for (sidx, pidx) in closed {
            sessions[sidx].pending_close.remove(pidx);
        }

        for (target, result) in targets.iter().zip(results.iter()) {
            if !ready_any(result) {
                continue;
            }

            match *target {
                Target::PendingClose(..) => {}
                Target::Listener => {
                    if result.read {
                        Self::accept_all(listener, sessions, config);
                    }
                }
                Target::Command(idx) => {
                    let session = &mut sessions[idx];
                    if session.command_socket.is_none() {
                        continue;
                    }
                    if session.data_socket.is_none() && result.write {
                        session.write_response();
                    }
                    if result.read || result.priority {
                        session.read_command(result.priority, result.read);
                    }
                    if result.error || result.hangup {
                        session.close_command();
                    }
                }
                Target::Data(idx) => {
                    let session = &mut sessions[idx];
                    match session.state {
                        State::Command => debug!("stray data event in Command state"),
                        State::DataConnect => {
                            if result.error || result.hangup {
                                session.send_response("426 Data connection failed\r\n");
                                session.set_state(State::Command, true, true);
                            } else if result.read {
                                session.data_accept();
                            } else if result.write {
                                let outcome = session.data_socket.clone().map(|sock| {
                                    let finish = sock.borrow_mut().finish_connect();
                                    match finish {
                                        Ok(()) => Ok(sock.borrow().peer_name()),
                                        Err(e) => Err(e),
                                    }
                                });

                                match outcome {
                                    Some(Ok(peer)) => {
                                        info!("connected to {peer}");
                                        session.send_response("150 Ready\r\n");
                                        session.set_state(State::DataTransfer, true, false);
                                    }
                                    _ => {
                                        session.send_response("425 Can't open data connection\r\n");
                                        session.set_state(State::Command, true, true);
                                    }
                                }
                            }
                        }
                        State::DataTransfer => {
                            if result.error || result.hangup {
                                session.send_response("426 Data connection failed\r\n");
                                session.set_state(State::Command, true, true);
                            } else if result.read || result.write {
                                for _ in 0..10 {
                                    if !session.pump_transfer() {
                                        break;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        Ok(true)
    }

    /// Drain every connection the listener currently has queued, without
    /// blocking (the listener socket is non-blocking, so `accept` itself
    /// signals `WouldBlock` once the queue is empty).
    fn accept_all(listener: &Socket, sessions: &mut Vec<Session>, config: &SharedConfig) {
        loop {
            match listener.accept() {
                Ok(socket) => {
                    info!("accepted connection from {}", socket.peer_name());
                    sessions.push(Session::new(socket, config.clone()));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    error!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    fn pump_transfer(&mut self) -> bool {
        match self.transfer {
            Some(Transfer::List) => self.list_transfer(),
            Some(Transfer::Retrieve) => self.retrieve_transfer(),
            Some(Transfer::Store) => self.store_transfer(),
            None => false,
        }
    }
}

fn ready_any(result: &PollResult) -> bool {
    result.read || result.write || result.priority || result.error || result.hangup
}

/// Decode a command line's embedded `\0` back to `\n` (the wire encoding
/// `encode_path` uses for literal newlines in a path argument).
fn decode_path(buf: &[u8]) -> String {
    let decoded: Vec<u8> = buf.iter().map(|&b| if b == 0 { b'\n' } else { b }).collect();
    String::from_utf8_lossy(&decoded).into_owned()
}

/// Encode a path for the wire: embedded `\n` becomes `\0`, and `"` is
/// doubled when `quotes` is set (for the `PWD`/`XPWD` 257 response).
fn encode_path(path: &str, quotes: bool) -> String {
    let mut out = String::with_capacity(path.len());
    for c in path.chars() {
        match c {
            '\n' => out.push('\0'),
            '"' if quotes => {
                out.push('"');
                out.push('"');
            }
            c => out.push(c),
        }
    }
    out
}

fn split_command(line: &str) -> (&str, &str) {
    match line.find(|c: char| c.is_whitespace()) {
        Some(pos) => (&line[..pos], line[pos..].trim_start()),
        None => (line, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_command_finds_crlf() {
        let buf = b"USER anon\r\nPASS x\r\n";
        let (delim, next) = Session::parse_command(buf).unwrap();
        assert_eq!(&buf[..delim], b"USER anon");
        assert_eq!(next, delim + 2);
    }

    #[test]
    fn parse_command_accepts_bare_lf() {
        let buf = b"NOOP\n";
        let (delim, next) = Session::parse_command(buf).unwrap();
        assert_eq!(delim, 4);
        assert_eq!(next, 5);
    }

    #[test]
    fn parse_command_returns_none_without_delimiter() {
        assert!(Session::parse_command(b"NOOP").is_none());
    }

    #[test]
    fn split_command_separates_verb_and_args() {
        assert_eq!(split_command("CWD /foo/bar"), ("CWD", "/foo/bar"));
        assert_eq!(split_command("NOOP"), ("NOOP", ""));
    }

    #[test]
    fn handler_lookup_is_case_insensitive() {
        assert!(lookup_handler("noop").is_some());
        assert!(lookup_handler("NOOP").is_some());
        assert!(lookup_handler("bogus").is_none());
    }

    #[test]
    fn handler_table_is_sorted_for_binary_search() {
        let mut names: Vec<&str> = HANDLERS.iter().map(|(n, _)| *n).collect();
        let mut sorted = names.clone();
        sorted.sort_by_key(|n| n.to_ascii_uppercase());
        assert_eq!(names, sorted);
        names.dedup();
        assert_eq!(names.len(), HANDLERS.len());
    }

    #[test]
    fn encode_path_doubles_quotes_when_requested() {
        assert_eq!(encode_path("a\"b", true), "a\"\"b");
        assert_eq!(encode_path("a\"b", false), "a\"b");
    }
}
