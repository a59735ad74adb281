//! Opaque destination abstraction, so the packet pipeline and peer state
//! never depend on a concrete socket-address type (spec.md §9: "Opaque
//! endpoint type").

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Addr {
    V4(Ipv4Addr, u16),
    V6(Ipv6Addr, u16),
}

/// A peer's destination, plus an optional cached local source address a
/// bind may reuse for "sticky source" sending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    dst: Addr,
    src: Option<IpAddr>,
}

impl Endpoint {
    pub fn new(addr: std::net::SocketAddr) -> Self {
        let dst = match addr {
            std::net::SocketAddr::V4(a) => Addr::V4(*a.ip(), a.port()),
            std::net::SocketAddr::V6(a) => Addr::V6(*a.ip(), a.port()),
        };
        Self { dst, src: None }
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        match self.dst {
            Addr::V4(ip, port) => std::net::SocketAddr::new(IpAddr::V4(ip), port),
            Addr::V6(ip, port) => std::net::SocketAddr::new(IpAddr::V6(ip), port),
        }
    }

    pub fn is_v6(&self) -> bool {
        matches!(self.dst, Addr::V6(..))
    }

    pub fn cached_source(&self) -> Option<IpAddr> {
        self.src
    }

    pub fn set_cached_source(&mut self, src: IpAddr) {
        self.src = Some(src);
    }

    /// Forces the OS to re-select a source address on the next send
    /// (spec.md §4.7 `clear_src`).
    pub fn clear_src(&mut self) {
        self.src = None;
    }
}
