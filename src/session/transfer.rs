// SPDX-License-Identifier: BSD-3-Clause

//! Data-channel setup (`PASV`/`PORT` completion) and the three transfer
//! pumps, grounded in `dataAccept`/`dataConnect`/`xferFile`/`xferDir`/
//! `listTransfer`/`retrieveTransfer`/`storeTransfer`.

use std::cell::RefCell;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use log::error;

use crate::dirent::{self, XferDirMode};
use crate::path_resolver;
use crate::socket::Socket;

use super::{Session, State, Transfer, SOCK_BUFFERSIZE};

#[derive(Clone, Copy, PartialEq, Eq)]
pub(super) enum XferFileMode {
    Retr,
    Stor,
    Appe,
}

impl Session {
    /// Accept a pending PASV connection.
    pub(super) fn data_accept(&mut self) {
        if !self.pasv {
            self.send_response("503 Bad sequence of commands\r\n");
            self.set_state(State::Command, true, true);
            return;
        }
        self.pasv = false;

        let Some(pasv) = &self.pasv_socket else {
            self.send_response("425 Failed to establish connection\r\n");
            self.set_state(State::Command, true, true);
            return;
        };

        let peer = match pasv.accept() {
            Ok(p) => p,
            Err(_) => {
                self.send_response("425 Failed to establish connection\r\n");
                self.set_state(State::Command, true, true);
                return;
            }
        };

        let _ = peer.set_recv_buffer_size(SOCK_BUFFERSIZE);
        let _ = peer.set_send_buffer_size(SOCK_BUFFERSIZE);
        if peer.set_nonblocking(true).is_err() {
            self.send_response("425 Failed to establish connection\r\n");
            self.set_state(State::Command, true, true);
            return;
        }

        self.data_socket = Some(Rc::new(RefCell::new(peer)));
        self.send_response("150 Ready\r\n");
        self.set_state(State::DataTransfer, true, false);
    }

    /// Begin an active-mode (PORT) connection. Returns `false` on immediate
    /// failure (caller replies `425`); a connection still in progress
    /// returns `true` and is finished later via `finish_connect`.
    pub(super) fn data_connect(&mut self) -> bool {
        self.port = false;

        let mut sock = match Socket::create() {
            Ok(s) => s,
            Err(_) => return false,
        };
        let _ = sock.set_recv_buffer_size(SOCK_BUFFERSIZE);
        let _ = sock.set_send_buffer_size(SOCK_BUFFERSIZE);
        if sock.set_nonblocking(true).is_err() {
            return false;
        }

        match sock.connect(self.port_addr) {
            Ok(true) => {
                self.data_socket = Some(Rc::new(RefCell::new(sock)));
                self.send_response("150 Ready\r\n");
                self.set_state(State::DataTransfer, true, false);
                true
            }
            Ok(false) => {
                self.data_socket = Some(Rc::new(RefCell::new(sock)));
                true
            }
            Err(_) => false,
        }
    }

    /// Set up a RETR/STOR/APPE transfer.
    pub(super) fn xfer_file(&mut self, arg: &str, mode: XferFileMode) {
        self.xfer_buffer.clear();

        let Some(path) = path_resolver::build_resolved_path(&self.cwd, arg) else {
            self.send_response("553 Failed to resolve path\r\n");
            self.set_state(State::Command, true, true);
            return;
        };

        if path == "/devZero" {
            self.dev_zero = true;
        } else if mode == XferFileMode::Retr {
            let meta = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    self.send_response(&format!("450 {e}\r\n"));
                    return;
                }
            };

            let mut file = match std::fs::File::open(&path) {
                Ok(f) => f,
                Err(e) => {
                    self.send_response(&format!("450 {e}\r\n"));
                    return;
                }
            };

            self.file_size = meta.len();

            if self.restart_position != 0 {
                if file.seek(SeekFrom::Start(self.restart_position)).is_err() {
                    self.send_response("450 Failed to seek\r\n");
                    return;
                }
            }

            self.file_position = self.restart_position;
            self.file = Some(file);
        } else {
            let append = mode == XferFileMode::Appe;

            let mut opts = std::fs::OpenOptions::new();
            opts.write(true).create(true);
            if append {
                opts.append(true);
            } else if self.restart_position != 0 {
                opts.read(true);
            } else {
                opts.truncate(true);
            }

            let mut file = match opts.open(&path) {
                Ok(f) => f,
                Err(e) => {
                    self.send_response(&format!("450 {e}\r\n"));
                    return;
                }
            };

            if self.restart_position != 0 && !append {
                if file.seek(SeekFrom::Start(self.restart_position)).is_err() {
                    self.send_response("450 Failed to seek\r\n");
                    return;
                }
            }

            self.file_position = self.restart_position;
            self.file = Some(file);
        }

        if !self.port && !self.pasv {
            self.send_response("503 Bad sequence of commands\r\n");
            self.set_state(State::Command, true, true);
            return;
        }

        self.set_state(State::DataConnect, false, true);

        if self.port && !self.data_connect() {
            self.send_response("425 Can't open data connection\r\n");
            self.set_state(State::Command, true, true);
            return;
        }

        if mode == XferFileMode::Retr {
            self.recv = false;
            self.send = true;
            self.transfer = Some(Transfer::Retrieve);
        } else {
            self.recv = true;
            self.send = false;
            self.transfer = Some(Transfer::Store);
        }
    }

    /// Set up a LIST/NLST/MLSD/MLST/STAT transfer.
    pub(super) fn xfer_dir(&mut self, arg: &str, mode: XferDirMode, workaround: bool) {
        self.xfer_dir_mode = Some(mode);
        self.recv = false;
        self.send = true;
        self.file_position = 0;
        self.xfer_buffer.clear();
        self.transfer = Some(Transfer::List);

        if !arg.is_empty() {
            let needs_workaround = workaround
                && arg.starts_with('-')
                && matches!(arg.as_bytes().get(1), Some(b'a') | Some(b'l'))
                && matches!(arg.as_bytes().get(2), None | Some(b' '));

            let resolved = path_resolver::build_resolved_path(&self.cwd, arg);
            let path = match resolved {
                Some(p) => p,
                None => {
                    if needs_workaround {
                        let rest = arg[2..].trim_start();
                        return self.xfer_dir(rest, mode, false);
                    }
                    self.send_response("550 Failed to resolve path\r\n");
                    self.set_state(State::Command, true, true);
                    return;
                }
            };

            let meta = match std::fs::metadata(&path) {
                Ok(m) => m,
                Err(_) => {
                    if needs_workaround {
                        let rest = arg[2..].trim_start();
                        return self.xfer_dir(rest, mode, false);
                    }
                    self.send_response("550 No such file or directory\r\n");
                    self.set_state(State::Command, true, true);
                    return;
                }
            };

            if mode == XferDirMode::Mlst {
                self.append_dirent(&meta, &path, None);
            } else if meta.is_dir() {
                let dir = match std::fs::read_dir(&path) {
                    Ok(d) => d,
                    Err(e) => {
                        self.send_response(&format!("550 {e}\r\n"));
                        self.set_state(State::Command, true, true);
                        return;
                    }
                };
                self.lwd = path.clone();
                self.dir = Some(dir);

                if mode == XferDirMode::Mlsd && self.mlst_facts.type_ {
                    self.append_dirent(&meta, &self.lwd.clone(), Some("cdir"));
                }
            } else if mode == XferDirMode::Mlsd {
                self.send_response("501 Not a directory\r\n");
                self.set_state(State::Command, true, true);
                return;
            } else {
                let name = if mode == XferDirMode::Nlst {
                    path.clone()
                } else {
                    path_resolver::base_name(&path).to_string()
                };
                self.append_dirent(&meta, &name, None);
            }
        } else if mode == XferDirMode::Mlst {
            let meta = match std::fs::metadata(&self.cwd) {
                Ok(m) => m,
                Err(e) => {
                    self.send_response(&format!("550 {e}\r\n"));
                    self.set_state(State::Command, true, true);
                    return;
                }
            };
            let cwd = self.cwd.clone();
            self.append_dirent(&meta, &cwd, None);
        } else {
            let dir = match std::fs::read_dir(&self.cwd) {
                Ok(d) => d,
                Err(e) => {
                    self.send_response(&format!("550 {e}\r\n"));
                    self.set_state(State::Command, true, true);
                    return;
                }
            };
            self.lwd = self.cwd.clone();
            self.dir = Some(dir);

            if mode == XferDirMode::Mlsd && self.mlst_facts.type_ {
                let meta = std::fs::metadata(&self.lwd).ok();
                if let Some(meta) = meta {
                    let lwd = self.lwd.clone();
                    self.append_dirent(&meta, &lwd, Some("cdir"));
                }
            }
        }

        if mode == XferDirMode::Mlst || mode == XferDirMode::Stat {
            self.send_response("250-Status\r\n");
            self.set_state(State::DataTransfer, true, true);
            self.data_socket = self.command_socket.clone();
            self.send = true;
            return;
        }

        if !self.port && !self.pasv {
            self.send_response("503 Bad sequence of commands\r\n");
            self.set_state(State::Command, true, true);
            return;
        }

        self.set_state(State::DataConnect, false, true);
        self.send = true;

        if self.port && !self.data_connect() {
            self.send_response("425 Can't open data connection\r\n");
            self.set_state(State::Command, true, true);
        }
    }

    /// Format one entry into the transfer buffer, mirroring the
    /// `fillDirent` overload that takes a `stat` directly.
    fn append_dirent(&mut self, meta: &std::fs::Metadata, path: &str, type_override: Option<&str>) {
        let mode = self.xfer_dir_mode.unwrap_or(XferDirMode::List);
        let facts = self.mlst_facts;
        let now = std::time::SystemTime::now();

        let mut line = if let Some(t) = type_override {
            // only the Type fact is ever overridden (the synthetic `cdir`
            // entry MLSD emits for the directory itself).
            let mut facts = facts;
            facts.type_ = true;
            let formatted = dirent::format_entry(mode, &facts, meta, path, now);
            formatted.replacen("Type=dir;", &format!("Type={t};"), 1)
        } else {
            dirent::format_entry(mode, &facts, meta, path, now)
        };
        line.push_str("\r\n");

        if line.len() > self.xfer_buffer.free_size() {
            self.send_response("425 Not enough buffer space\r\n");
            self.set_state(State::Command, true, true);
            return;
        }
        self.xfer_buffer.free_area()[..line.len()].copy_from_slice(line.as_bytes());
        self.xfer_buffer.mark_used(line.len());
        self.file_position += line.len() as u64;
    }

    /// Pump the directory-listing transfer. Returns `true` if called again
    /// immediately might make more progress.
    pub(super) fn list_transfer(&mut self) -> bool {
        while self.xfer_buffer.empty() {
            self.xfer_buffer.clear();

            let rc = match self.xfer_dir_mode {
                Some(XferDirMode::Mlst) | Some(XferDirMode::Stat) => 250,
                _ => 226,
            };

            let Some(dir) = &mut self.dir else {
                self.send_response(&format!("{rc} OK\r\n"));
                self.set_state(State::Command, true, true);
                return false;
            };

            let entry = match dir.next() {
                Some(Ok(e)) => e,
                Some(Err(_)) => continue,
                None => {
                    self.send_response(&format!("{rc} OK\r\n"));
                    self.set_state(State::Command, true, true);
                    return false;
                }
            };

            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            if self.xfer_dir_mode == Some(XferDirMode::Nlst) {
                let full = path_resolver::build_path(&self.lwd, name);
                let line = format!("{full}\r\n");
                if line.len() > self.xfer_buffer.free_size() {
                    self.send_response("501 Out of memory\r\n");
                    self.set_state(State::Command, true, true);
                    return false;
                }
                self.xfer_buffer.free_area()[..line.len()].copy_from_slice(line.as_bytes());
                self.xfer_buffer.mark_used(line.len());
                self.file_position += line.len() as u64;
            } else {
                let full = path_resolver::build_path(&self.lwd, name);
                let meta = match entry.metadata() {
                    Ok(m) => m,
                    Err(e) => {
                        error!("skipping {full}: {e}");
                        continue;
                    }
                };
                self.append_dirent(&meta, name, None);
            }
        }

        let Some(sock) = self.data_socket.clone() else {
            return false;
        };
        match sock.borrow_mut().write_from(&mut self.xfer_buffer) {
            Ok(0) => {
                self.send_response("426 Connection broken during transfer\r\n");
                self.set_state(State::Command, true, true);
                false
            }
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(_) => {
                self.send_response("426 Connection broken during transfer\r\n");
                self.set_state(State::Command, true, true);
                false
            }
        }
    }

    pub(super) fn retrieve_transfer(&mut self) -> bool {
        if self.xfer_buffer.empty() {
            self.xfer_buffer.clear();

            if !self.dev_zero {
                let Some(file) = &mut self.file else {
                    return false;
                };
                let n = match file.read(self.xfer_buffer.free_area()) {
                    Ok(n) => n,
                    Err(e) => {
                        self.send_response(&format!("451 {e}\r\n"));
                        self.set_state(State::Command, true, true);
                        return false;
                    }
                };
                if n == 0 {
                    self.send_response("226 OK\r\n");
                    self.set_state(State::Command, true, true);
                    return false;
                }
                self.xfer_buffer.mark_used(n);
            } else {
                let size = self.xfer_buffer.free_size();
                self.xfer_buffer.free_area().fill(0);
                self.xfer_buffer.mark_used(size);
            }
        }

        let Some(sock) = self.data_socket.clone() else {
            return false;
        };
        match sock.borrow_mut().write_from(&mut self.xfer_buffer) {
            Ok(0) => {
                self.send_response("426 Connection broken during transfer\r\n");
                self.set_state(State::Command, true, true);
                false
            }
            Ok(n) => {
                self.file_position += n as u64;
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(_) => {
                self.send_response("426 Connection broken during transfer\r\n");
                self.set_state(State::Command, true, true);
                false
            }
        }
    }

    pub(super) fn store_transfer(&mut self) -> bool {
        if self.xfer_buffer.empty() {
            self.xfer_buffer.clear();

            let Some(sock) = self.data_socket.clone() else {
                return false;
            };
            let rc = sock.borrow().read_into(&mut self.xfer_buffer, false);
            match rc {
                Ok(0) => {
                    self.send_response("226 OK\r\n");
                    self.set_state(State::Command, true, true);
                    return false;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return false,
                Err(e) => {
                    self.send_response(&format!("451 {e}\r\n"));
                    self.set_state(State::Command, true, true);
                    return false;
                }
                Ok(_) => {}
            }
        }

        if !self.dev_zero {
            let Some(file) = &mut self.file else {
                return false;
            };
            match file.write(self.xfer_buffer.used_area()) {
                Ok(0) => {
                    self.send_response("451 Failed to write file\r\n");
                    self.set_state(State::Command, true, true);
                    false
                }
                Ok(n) => {
                    self.xfer_buffer.mark_free(n);
                    self.file_position += n as u64;
                    true
                }
                Err(e) => {
                    self.send_response(&format!("451 Failed to write file: {e}\r\n"));
                    self.set_state(State::Command, true, true);
                    false
                }
            }
        } else {
            self.file_position += self.xfer_buffer.used_size() as u64;
            self.xfer_buffer.clear();
            true
        }
    }
}
