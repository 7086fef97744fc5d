// SPDX-License-Identifier: BSD-3-Clause

//! IPv4 socket address wrapper. IPv6 is out of scope (Non-goals).

use std::fmt;
use std::net::Ipv4Addr;

/// An IPv4 address/port pair, stored in host byte order.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SockAddr {
    addr: Ipv4Addr,
    port: u16,
}

impl SockAddr {
    pub const ANY: SockAddr = SockAddr {
        addr: Ipv4Addr::UNSPECIFIED,
        port: 0,
    };

    pub fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }

    pub fn addr(&self) -> Ipv4Addr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn set_port(&mut self, port: u16) {
        self.port = port;
    }

    /// Build from a raw `sockaddr_in`.
    pub fn from_raw(raw: &libc::sockaddr_in) -> Self {
        let addr = Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr));
        let port = u16::from_be(raw.sin_port);
        Self { addr, port }
    }

    /// Encode as a raw `sockaddr_in`, suitable for `bind`/`connect`.
    pub fn to_raw(self) -> libc::sockaddr_in {
        let mut raw: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        raw.sin_family = libc::AF_INET as libc::sa_family_t;
        raw.sin_port = self.port.to_be();
        raw.sin_addr.s_addr = u32::from(self.addr).to_be();
        raw
    }

    /// Render as the comma-separated octet format used by `PASV`/`PORT`
    /// (`h1,h2,h3,h4,p1,p2`).
    pub fn to_pasv_tuple(self) -> String {
        let [a, b, c, d] = self.addr.octets();
        format!(
            "{},{},{},{},{},{}",
            a,
            b,
            c,
            d,
            self.port >> 8,
            self.port & 0xFF
        )
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pasv_tuple_matches_rfc_format() {
        let addr = SockAddr::new(Ipv4Addr::new(192, 168, 1, 2), 0x1F91); // 8081
        assert_eq!(addr.to_pasv_tuple(), "192,168,1,2,31,145");
    }

    #[test]
    fn raw_round_trip_preserves_addr_and_port() {
        let addr = SockAddr::new(Ipv4Addr::new(10, 0, 0, 1), 2121);
        let raw = addr.to_raw();
        let back = SockAddr::from_raw(&raw);
        assert_eq!(addr, back);
    }
}
