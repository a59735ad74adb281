//! Error taxonomy (spec.md §7). Packet-plane errors are always locally
//! recovered by the pipeline (silent drop or re-queue) and never reach a
//! caller; only control-plane errors (UAPI, bind lifecycle) are surfaced
//! here as `Result`s.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("malformed or inauthentic datagram")]
    ProtocolViolation,
    #[error("no peer owns the matching allowed-ip prefix")]
    PrefixNoMatch,
    #[error("peer has no known endpoint to send to")]
    NoEndpoint,
    #[error("handshake retry budget exhausted")]
    HandshakeBudgetExhausted,
    #[error("bind failed to send: {0}")]
    TransportSendFailure(std::io::Error),
    #[error("invalid configuration value for key {key}: {reason}")]
    ConfigurationError { key: String, reason: String },
    #[error("work queue is full")]
    ResourceExhaustion,
    #[error("unrecoverable I/O failure: {0}")]
    Fatal(std::io::Error),
    #[error("requested listen port is already in use")]
    PortInUse,
}

/// UAPI `errno=` codes (spec.md §6): 1 = generic I/O, 2 = protocol
/// violation, 3 = invalid value, 4 = port already in use.
impl DeviceError {
    pub fn uapi_errno(&self) -> i32 {
        match self {
            DeviceError::Fatal(_) | DeviceError::TransportSendFailure(_) => 1,
            DeviceError::ProtocolViolation
            | DeviceError::PrefixNoMatch
            | DeviceError::NoEndpoint
            | DeviceError::HandshakeBudgetExhausted
            | DeviceError::ResourceExhaustion => 2,
            DeviceError::ConfigurationError { .. } => 3,
            DeviceError::PortInUse => 4,
        }
    }
}

pub type Result<T> = core::result::Result<T, DeviceError>;
