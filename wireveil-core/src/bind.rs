//! The UDP socket binding is an external collaborator (spec.md §1, §4.7):
//! this crate only depends on the trait below, never on a concrete socket
//! type, so it can be driven by a real OS socket or a test double.

use crate::endpoint::Endpoint;

pub trait Bind: Send + Sync {
    /// Opens (or reopens) the bind on `port`, returning the port actually
    /// bound (the OS may choose one when `port == 0`).
    fn open(&self, port: u16) -> std::io::Result<u16>;

    fn recv_v4(&self, buf: &mut [u8]) -> std::io::Result<(usize, Endpoint)>;
    fn recv_v6(&self, buf: &mut [u8]) -> std::io::Result<(usize, Endpoint)>;

    fn send(&self, buf: &[u8], endpoint: &Endpoint) -> std::io::Result<()>;

    fn set_mark(&self, mark: u32) -> std::io::Result<()>;

    /// Unblocks any thread parked in `recv_v4`/`recv_v6`.
    fn close(&self);
}
