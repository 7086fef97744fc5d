// SPDX-License-Identifier: BSD-3-Clause

//! Non-blocking STREAM socket wrapper.
//!
//! Mirrors the teacher's habit of reaching for raw `libc` calls alongside
//! `nix` (`rpc_protocol/src/server/ring.rs` mixes both for the same reason:
//! `nix` doesn't expose every option this needs, notably `SO_LINGER` and
//! `sockatmark`).

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use crate::io_buffer::IoBuffer;
use crate::sock_addr::SockAddr;

/// Events to watch a socket for in a poll cycle, mirroring `Socket::PollInfo`.
#[derive(Clone, Copy, Debug, Default)]
pub struct PollEvents {
    pub read: bool,
    pub write: bool,
    pub priority: bool,
}

/// Events a socket was found ready for after a poll cycle.
#[derive(Clone, Copy, Debug, Default)]
pub struct PollResult {
    pub read: bool,
    pub write: bool,
    pub priority: bool,
    pub error: bool,
    pub hangup: bool,
}

pub struct Socket {
    fd: RawFd,
    sock_name: SockAddr,
    peer_name: SockAddr,
    listening: bool,
    connected: bool,
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

impl Socket {
    /// Create a new non-blocking IPv4 STREAM socket.
    pub fn create() -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            fd,
            sock_name: SockAddr::ANY,
            peer_name: SockAddr::ANY,
            listening: false,
            connected: false,
        })
    }

    fn from_fd(fd: RawFd, sock_name: SockAddr, peer_name: SockAddr) -> Self {
        Self {
            fd,
            sock_name,
            peer_name,
            listening: false,
            connected: true,
        }
    }

    pub fn sock_name(&self) -> SockAddr {
        self.sock_name
    }

    pub fn peer_name(&self) -> SockAddr {
        self.peer_name
    }

    pub fn bind(&mut self, addr: SockAddr) -> io::Result<()> {
        let raw = addr.to_raw();
        let rc = unsafe {
            libc::bind(
                self.fd,
                &raw as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.refresh_sock_name()?;
        Ok(())
    }

    pub fn listen(&mut self, backlog: i32) -> io::Result<()> {
        let rc = unsafe { libc::listen(self.fd, backlog) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.listening = true;
        Ok(())
    }

    /// Connect to a peer. Returns `Ok(true)` if the connection completed
    /// immediately, `Ok(false)` if it is in progress (`EINPROGRESS`, expected
    /// for a non-blocking socket — caller polls for `POLLOUT`).
    pub fn connect(&mut self, addr: SockAddr) -> io::Result<bool> {
        let raw = addr.to_raw();
        let rc = unsafe {
            libc::connect(
                self.fd,
                &raw as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            self.connected = true;
            self.peer_name = addr;
            self.refresh_sock_name()?;
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            self.peer_name = addr;
            return Ok(false);
        }
        Err(err)
    }

    /// Finish a non-blocking connect once `POLLOUT` fires; checks `SO_ERROR`.
    pub fn finish_connect(&mut self) -> io::Result<()> {
        let mut errnum: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                &mut errnum as *mut _ as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        if errnum != 0 {
            return Err(io::Error::from_raw_os_error(errnum));
        }
        self.connected = true;
        self.refresh_sock_name()?;
        Ok(())
    }

    pub fn accept(&self) -> io::Result<Socket> {
        let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept(
                self.fd,
                &mut raw as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let peer = SockAddr::from_raw(&raw);
        let mut sock = Socket::from_fd(fd, self.sock_name, peer);
        sock.set_nonblocking(true)?;
        sock.refresh_sock_name()?;
        Ok(sock)
    }

    pub fn shutdown(&self, how: std::net::Shutdown) -> io::Result<()> {
        let how = match how {
            std::net::Shutdown::Read => libc::SHUT_RD,
            std::net::Shutdown::Write => libc::SHUT_WR,
            std::net::Shutdown::Both => libc::SHUT_RDWR,
        };
        let rc = unsafe { libc::shutdown(self.fd, how) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            // already disconnected; treat as success like the original does
            if err.raw_os_error() != Some(libc::ENOTCONN) {
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn set_linger(&self, enable: bool, timeout: Duration) -> io::Result<()> {
        let linger = libc::linger {
            l_onoff: enable as libc::c_int,
            l_linger: timeout.as_secs() as libc::c_int,
        };
        self.setsockopt(libc::SOL_SOCKET, libc::SO_LINGER, &linger)
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL, 0) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if nonblocking {
            flags | libc::O_NONBLOCK
        } else {
            flags & !libc::O_NONBLOCK
        };
        let rc = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn set_reuse_address(&self, reuse: bool) -> io::Result<()> {
        let val: libc::c_int = reuse as libc::c_int;
        self.setsockopt(libc::SOL_SOCKET, libc::SO_REUSEADDR, &val)
    }

    pub fn set_recv_buffer_size(&self, size: usize) -> io::Result<()> {
        let val = size as libc::c_int;
        self.setsockopt(libc::SOL_SOCKET, libc::SO_RCVBUF, &val)
    }

    pub fn set_send_buffer_size(&self, size: usize) -> io::Result<()> {
        let val = size as libc::c_int;
        self.setsockopt(libc::SOL_SOCKET, libc::SO_SNDBUF, &val)
    }

    fn setsockopt<T>(&self, level: libc::c_int, name: libc::c_int, val: &T) -> io::Result<()> {
        let rc = unsafe {
            libc::setsockopt(
                self.fd,
                level,
                name,
                val as *const T as *const libc::c_void,
                std::mem::size_of::<T>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn refresh_sock_name(&mut self) -> io::Result<()> {
        let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(self.fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        self.sock_name = SockAddr::from_raw(&raw);
        Ok(())
    }

    /// True if the socket's read position is exactly at the OOB mark.
    pub fn at_mark(&self) -> io::Result<bool> {
        let mut atmark: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(self.fd, libc::SIOCATMARK, &mut atmark) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(atmark != 0)
    }

    /// Read up to `size` bytes. `Ok(0)` means peer closed (EOF). A
    /// `WouldBlock` error means "try again later" (non-blocking socket).
    pub fn read(&self, out: &mut [u8], oob: bool) -> io::Result<usize> {
        let flags = if oob { libc::MSG_OOB } else { 0 };
        let rc = unsafe {
            libc::recv(
                self.fd,
                out.as_mut_ptr() as *mut libc::c_void,
                out.len(),
                flags,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Read directly into an `IoBuffer`'s free area.
    pub fn read_into(&self, buf: &mut IoBuffer, oob: bool) -> io::Result<usize> {
        let n = self.read(buf.free_area(), oob)?;
        buf.mark_used(n);
        Ok(n)
    }

    pub fn write(&self, data: &[u8]) -> io::Result<usize> {
        let rc = unsafe {
            libc::send(
                self.fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_NOSIGNAL,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(rc as usize)
    }

    /// Write as much of an `IoBuffer`'s used area as the socket accepts,
    /// marking those bytes free on success.
    pub fn write_from(&self, buf: &mut IoBuffer) -> io::Result<usize> {
        let n = self.write(buf.used_area())?;
        buf.mark_free(n);
        Ok(n)
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Poll a set of sockets at once, mirroring `Socket::poll`'s batched
    /// static entry point. Returns the number of sockets with nonzero
    /// revents, or an I/O error.
    pub fn poll(entries: &[(&Socket, PollEvents)], timeout: Duration) -> io::Result<(i32, Vec<PollResult>)> {
        let mut fds: Vec<PollFd> = entries
            .iter()
            .map(|(sock, events)| {
                let mut flags = PollFlags::empty();
                if events.read {
                    flags |= PollFlags::POLLIN;
                }
                if events.write {
                    flags |= PollFlags::POLLOUT;
                }
                if events.priority {
                    flags |= PollFlags::POLLPRI;
                }
                PollFd::new(sock.as_fd_borrowed(), flags)
            })
            .collect();

        let timeout_ms = timeout.as_millis().min(u16::MAX as u128) as u16;
        let n = poll(&mut fds, PollTimeout::from(timeout_ms))
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;

        let results = fds
            .iter()
            .map(|fd| {
                let revents = fd.revents().unwrap_or_else(PollFlags::empty);
                PollResult {
                    read: revents.contains(PollFlags::POLLIN),
                    write: revents.contains(PollFlags::POLLOUT),
                    priority: revents.contains(PollFlags::POLLPRI),
                    error: revents.contains(PollFlags::POLLERR),
                    hangup: revents.contains(PollFlags::POLLHUP),
                }
            })
            .collect();

        Ok((n, results))
    }

    fn as_fd_borrowed(&self) -> std::os::fd::BorrowedFd<'_> {
        unsafe { std::os::fd::BorrowedFd::borrow_raw(self.fd) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn bind_listen_accept_connect_loopback() {
        let mut listener = Socket::create().unwrap();
        listener.set_reuse_address(true).unwrap();
        listener
            .bind(SockAddr::new(Ipv4Addr::LOCALHOST, 0))
            .unwrap();
        listener.listen(1).unwrap();
        listener.set_nonblocking(true).unwrap();

        let addr = listener.sock_name();

        let mut client = Socket::create().unwrap();
        client.set_nonblocking(true).unwrap();
        let connected = client.connect(addr).unwrap();

        // give the kernel a moment via poll on both ends
        let (_, results) = Socket::poll(
            &[
                (&listener, PollEvents { read: true, ..Default::default() }),
                (&client, PollEvents { write: true, ..Default::default() }),
            ],
            Duration::from_millis(200),
        )
        .unwrap();

        assert!(results[0].read || connected);
        let accepted = listener.accept();
        assert!(accepted.is_ok());
    }
}
