//! Wire-format structs shared between the crypto engine and the device.
//!
//! Every multi-byte integer on the wire is little-endian (spec.md §6), so
//! every field here is either a single byte, a fixed byte array, or a
//! `zerocopy::little_endian` integer — never a native `u32`/`u64`, so that
//! `AsBytes`/`FromBytes` round-trip the packet exactly as it appears on the
//! wire regardless of host endianness.
#![no_std]

use zerocopy::{little_endian, AsBytes, FromBytes, FromZeroes};

pub const MSG_HANDSHAKE_INIT: u32 = 1;
pub const MSG_HANDSHAKE_RESP: u32 = 2;
pub const MSG_COOKIE_REPLY: u32 = 3;
pub const MSG_TRANSPORT: u32 = 4;

pub const HANDSHAKE_INIT_SZ: usize = 148;
pub const HANDSHAKE_RESP_SZ: usize = 92;
pub const COOKIE_REPLY_SZ: usize = 64;
pub const TRANSPORT_HEADER_SZ: usize = 16;

/// A 16-byte Poly1305/Blake2s keyed-MAC output.
pub type Mac = [u8; 16];

/// AEAD authentication tag, kept as a distinct newtype so it can't be
/// confused with a `Mac` despite being the same size.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct Tag(pub [u8; 16]);

/// A cached DoS-mitigation cookie, opaque to everything except the cookie
/// machinery (spec.md §4.2 "Cookie reply").
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct Cookie(pub [u8; 16]);

macro_rules! encrypted {
    ($name:ident, $n:literal) => {
        #[doc = concat!(
            "An AEAD-sealed ", stringify!($n), "-byte payload plus its 16-byte tag, ",
            "as it appears on the wire."
        )]
        #[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
        #[repr(C)]
        pub struct $name {
            pub msg: [u8; $n],
            pub tag: Tag,
        }
    };
}

encrypted!(EncryptedEmpty, 0);
encrypted!(EncryptedTimestamp, 12);
encrypted!(EncryptedPublicKey, 32);

/// The cookie value itself is 16 bytes; sealed under XChaCha20-Poly1305 it
/// grows by one tag.
#[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct EncryptedCookie {
    pub msg: Cookie,
    pub tag: Tag,
}

/// Message type 1: initiator -> responder.
///
/// `148` bytes: `4 + 4 + 32 + (32+16) + (12+16) + 16 + 16` (spec.md §6).
#[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct HandshakeInit {
    pub msg_type: little_endian::U32,
    pub sender: little_endian::U32,
    pub ephemeral_key: [u8; 32],
    pub static_key: EncryptedPublicKey,
    pub timestamp: EncryptedTimestamp,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// Message type 2: responder -> initiator.
///
/// `92` bytes: `4 + 4 + 4 + 32 + (0+16) + 16 + 16` (spec.md §6).
#[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct HandshakeResp {
    pub msg_type: little_endian::U32,
    pub sender: little_endian::U32,
    pub receiver: little_endian::U32,
    pub ephemeral_key: [u8; 32],
    pub empty: EncryptedEmpty,
    pub mac1: Mac,
    pub mac2: Mac,
}

/// Message type 3: sent by an overloaded responder instead of a handshake
/// response when MAC2 validation fails.
///
/// `64` bytes: `4 + 4 + 24 + (16+16)` (spec.md §6).
#[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct CookieReply {
    pub msg_type: little_endian::U32,
    pub receiver: little_endian::U32,
    pub nonce: [u8; 24],
    pub cookie: EncryptedCookie,
}

/// Message type 4 header. The ciphertext (padded plaintext + 16-byte tag)
/// follows immediately after these 16 bytes.
#[derive(Clone, Copy, Debug, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct TransportHeader {
    pub msg_type: little_endian::U32,
    pub receiver: little_endian::U32,
    pub counter: little_endian::U64,
}

impl TransportHeader {
    pub fn new(receiver: u32, counter: u64) -> Self {
        Self {
            msg_type: little_endian::U32::new(MSG_TRANSPORT),
            receiver: little_endian::U32::new(receiver),
            counter: little_endian::U64::new(counter),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes_match_spec() {
        assert_eq!(core::mem::size_of::<HandshakeInit>(), HANDSHAKE_INIT_SZ);
        assert_eq!(core::mem::size_of::<HandshakeResp>(), HANDSHAKE_RESP_SZ);
        assert_eq!(core::mem::size_of::<CookieReply>(), COOKIE_REPLY_SZ);
        assert_eq!(core::mem::size_of::<TransportHeader>(), TRANSPORT_HEADER_SZ);
    }

    #[test]
    fn structs_are_byte_aligned() {
        assert_eq!(core::mem::align_of::<HandshakeInit>(), 1);
        assert_eq!(core::mem::align_of::<HandshakeResp>(), 1);
        assert_eq!(core::mem::align_of::<CookieReply>(), 1);
    }
}
