//! Device controller, peer state machine and packet pipeline.
//!
//! The crypto core (`wireveil-crypto`) and wire format (`wireveil-types`)
//! stay `no_std`; this crate is where threads, sockets and the TUN device
//! get wired together.

pub mod bind;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod handshake;
mod iphdr;
pub mod keypair;
pub mod peer;
pub mod pipeline;
pub mod pool;
pub mod timers;
pub mod tun;
pub mod uapi;

pub use bind::Bind;
pub use device::{Device, DeviceConfig, PeerConfig};
pub use endpoint::Endpoint;
pub use error::{DeviceError, Result};
pub use peer::Peer;
pub use tun::{Tun, TunEvent};
