// SPDX-License-Identifier: BSD-3-Clause

//! Listener + session table, grounded in `FtpServer::loop_`/`threadFunc`.

use log::{info, warn};

use crate::config::SharedConfig;
use crate::error::Result;
use crate::session::Session;
use crate::sock_addr::SockAddr;
use crate::socket::Socket;

pub struct Server {
    listener: Socket,
    sessions: Vec<Session>,
    config: SharedConfig,
}

impl Server {
    /// Bind the listening socket on `config`'s port and construct an empty
    /// session table.
    pub fn new(config: SharedConfig) -> Result<Self> {
        let port = config.lock().unwrap().port();

        let mut listener = Socket::create()?;
        listener.set_reuse_address(true)?;
        listener.bind(SockAddr::new(std::net::Ipv4Addr::UNSPECIFIED, port))?;
        listener.listen(16)?;
        listener.set_nonblocking(true)?;

        info!("listening on {}", listener.sock_name());

        Ok(Self {
            listener,
            sessions: Vec::new(),
            config,
        })
    }

    /// Port the listener actually bound to (useful when `config`'s port is
    /// `0`, letting the kernel pick an ephemeral port).
    pub fn local_port(&self) -> u16 {
        self.listener.sock_name().port()
    }

    /// Run the server forever: reap finished sessions and multiplex the
    /// listener plus every session's sockets in one `poll()` per iteration.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.sessions.retain(|s| !s.dead());

            if !Session::poll(&self.listener, &mut self.sessions, &self.config)? {
                warn!("poll reported a fatal error, shutting down");
                return Ok(());
            }
        }
    }
}
