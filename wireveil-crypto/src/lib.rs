//! Noise_IKpsk2 handshake messages, cookie machinery and MAC validation.
//!
//! Grounded on the teacher's `rustyguard-crypto` crate: the same split
//! between `StaticInitiatorConfig`/`StaticPeerConfig`, the same `HasMac`
//! trait for MAC1/MAC2 verification, and the same
//! `encrypt_handshake_init`/`decrypt_handshake_init`/`encrypt_handshake_resp`/
//! `decrypt_handshake_resp` functions, retargeted at `wireveil-types`'s wire
//! structs and this project's message-type numbering (spec.md §6: cookie
//! reply is type 3, transport is type 4).
#![no_std]

use core::{net::SocketAddr, ops::ControlFlow};

pub use prim::{derive_transport_keys, mac, DecryptionKey, EncryptionKey, HandshakeState, Key, Mac};
use prim::{hash, CookieCipher, EncryptedField, LABEL_COOKIE, LABEL_MAC1};
pub use x25519_dalek::{PublicKey, StaticSecret};

use rand_core::{CryptoRng, RngCore};
use tai64::Tai64N;
use wireveil_types::{
    Cookie, EncryptedCookie, EncryptedEmpty, EncryptedPublicKey, EncryptedTimestamp, HandshakeInit,
    HandshakeResp, MSG_HANDSHAKE_INIT, MSG_HANDSHAKE_RESP,
};
use zerocopy::{little_endian, transmute_mut, AsBytes, FromBytes, FromZeroes};
use zeroize::{Zeroize, ZeroizeOnDrop};

#[cfg(any(test, wireveil_unsafe_logging))]
extern crate std;

macro_rules! unsafe_log {
    ($($t:tt)*) => {
        match core::format_args!($($t)*) {
            #[cfg(any(test, wireveil_unsafe_logging))]
            args => std::eprintln!("{args}"),
            #[cfg(not(any(test, wireveil_unsafe_logging)))]
            _ => {}
        };
    }
}

mod prim;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    DecryptionFailed,
    Rejected,
    InvalidPeerKey,
}

pub fn decrypt_cookie(
    cookie: &mut EncryptedCookie,
    key: &Key,
    nonce: &[u8; 24],
    aad: &[u8],
) -> Result<Cookie, CryptoError> {
    cookie.decrypt(key, nonce, aad)
}

pub fn encrypt_cookie(cookie: Cookie, key: &Key, nonce: &[u8; 24], aad: &[u8]) -> EncryptedCookie {
    EncryptedCookie::encrypt(cookie, key, nonce, aad)
}

pub fn mac1_key(spk: &PublicKey) -> Key {
    hash([&LABEL_MAC1, spk.as_bytes()])
}

pub fn cookie_key(spk: &PublicKey) -> Key {
    hash([&LABEL_COOKIE, spk.as_bytes()])
}

/// Curve25519 static-static DH, rejecting the degenerate all-zero output a
/// low-order public key would produce (spec.md's Data Model: "must be
/// non-zero").
pub fn static_static_dh(sk: &StaticSecret, pk: &PublicKey) -> Result<(), CryptoError> {
    let shared = sk.diffie_hellman(pk);
    if shared.as_bytes().iter().all(|&b| b == 0) {
        Err(CryptoError::InvalidPeerKey)
    } else {
        Ok(())
    }
}

#[derive(Zeroize, ZeroizeOnDrop, Default)]
pub struct CookieState {
    key: Key,
}

impl CookieState {
    pub fn generate(&mut self, rng: &mut (impl CryptoRng + RngCore)) {
        rng.fill_bytes(&mut self.key);
    }

    /// A cookie binds a remote address; there is no specified encoding, it
    /// just needs to be stable for a given `(ip, port)` for the
    /// `CookieRefreshTime` window (spec.md §4.2).
    pub fn new_cookie(&self, addr: SocketAddr) -> Cookie {
        let mut a = [0; 20];
        match addr.ip() {
            core::net::IpAddr::V4(ipv4) => a[..4].copy_from_slice(&ipv4.octets()[..]),
            core::net::IpAddr::V6(ipv6) => a[..16].copy_from_slice(&ipv6.octets()[..]),
        }
        a[16..].copy_from_slice(&addr.port().to_le_bytes()[..]);
        Cookie(mac(&self.key, &a))
    }
}

/// Both handshake messages are protected via MACs which can quickly be used
/// to rule out invalid messages.
///
/// MAC1 is always checked; it rules out a message from someone who doesn't
/// even know our static public key. MAC2 is only checked while the device
/// is under load: if it fails, a cookie reply is sent instead of rejecting
/// outright (spec.md §4.2).
pub trait HasMac: FromBytes + AsBytes + Sized {
    fn verify<'m>(
        &'m mut self,
        mac1_key: &Key,
        overloaded: bool,
        cookie: &CookieState,
        addr: SocketAddr,
    ) -> Result<ControlFlow<Cookie, &'m mut Self>, CryptoError> {
        self.verify_mac1(mac1_key)?;

        if overloaded {
            let cookie = cookie.new_cookie(addr);
            if self.verify_mac2(&cookie).is_err() {
                return Ok(ControlFlow::Break(cookie));
            }
        }

        Ok(ControlFlow::Continue(self))
    }

    fn verify_mac1(&self, mac1_key: &Key) -> Result<(), CryptoError> {
        let actual_mac1 = self.compute_mac1(mac1_key);
        if &actual_mac1 != self.get_mac1() {
            unsafe_log!("invalid mac1");
            Err(CryptoError::Rejected)
        } else {
            Ok(())
        }
    }

    fn verify_mac2(&self, cookie: &Cookie) -> Result<(), CryptoError> {
        let actual_mac2 = self.compute_mac2(cookie);
        if &actual_mac2 != self.get_mac2() {
            unsafe_log!("invalid mac2");
            Err(CryptoError::Rejected)
        } else {
            Ok(())
        }
    }

    fn compute_mac1(&self, mac1_key: &Key) -> Mac;
    fn compute_mac2(&self, cookie: &Cookie) -> Mac;
    fn get_mac1(&self) -> &Mac;
    fn get_mac2(&self) -> &Mac;
}

macro_rules! mac_protected {
    ($i:ident) => {
        impl HasMac for $i {
            fn compute_mac1(&self, mac1_key: &Key) -> Mac {
                let offset = core::mem::offset_of!($i, mac1);
                let bytes = self.as_bytes();
                prim::mac(mac1_key, &bytes[..offset])
            }

            fn compute_mac2(&self, cookie: &Cookie) -> Mac {
                let offset = core::mem::offset_of!($i, mac2);
                let bytes = self.as_bytes();
                prim::mac(&cookie.0, &bytes[..offset])
            }

            fn get_mac1(&self) -> &Mac {
                &self.mac1
            }

            fn get_mac2(&self) -> &Mac {
                &self.mac2
            }
        }
    };
}

mac_protected!(HandshakeInit);
mac_protected!(HandshakeResp);

// ---- Noise IKpsk2 ---- //
// <- s
// -> e, es, s, ss
// <- e, ee, se, psk
//
// The initiator is expected to know the responder's static public key
// prior to the handshake. The initiator sends an ephemeral public key and
// their encrypted static public key. The responder sends an ephemeral
// public key and mixes in the preshared key.

pub struct StaticPeerConfig {
    /// Peer's public key.
    pub key: PublicKey,
    /// Peer's preshared key (all-zero if none configured).
    pub preshared_key: Key,
    /// Cached mac1_key: calculated using `mac1_key(&self.key)`
    pub mac1_key: Key,
    /// Cached cookie_key: calculated using `cookie_key(&self.key)`
    pub cookie_key: Key,
}

pub struct StaticInitiatorConfig {
    /// Our private key
    pub private_key: StaticSecret,
    /// Cached public key, derived from the above private key
    pub public_key: PublicKey,
    /// Cached mac1_key: calculated using `mac1_key(&self.public_key)`
    pub mac1_key: Key,
    /// Cached cookie_key: calculated using `cookie_key(&self.public_key)`
    pub cookie_key: Key,
}

impl StaticPeerConfig {
    pub fn new(key: PublicKey, preshared_key: Option<Key>) -> Self {
        Self {
            mac1_key: mac1_key(&key),
            cookie_key: cookie_key(&key),
            key,
            preshared_key: preshared_key.unwrap_or_default(),
        }
    }
}

impl StaticInitiatorConfig {
    pub fn new(key: StaticSecret) -> Self {
        let public_key = PublicKey::from(&key);
        Self {
            mac1_key: mac1_key(&public_key),
            cookie_key: cookie_key(&public_key),
            public_key,
            private_key: key,
        }
    }
}

#[derive(Clone, Copy, FromBytes, FromZeroes, AsBytes)]
#[repr(transparent)]
pub struct DecryptedHandshakeInit(HandshakeInit);

impl DecryptedHandshakeInit {
    #[inline(always)]
    pub fn static_key(&self) -> PublicKey {
        PublicKey::from(self.0.static_key.msg)
    }

    #[inline(always)]
    pub fn timestamp(&self) -> Tai64N {
        Tai64N::from_slice(&self.0.timestamp.msg).unwrap_or(Tai64N::UNIX_EPOCH)
    }

    #[inline(always)]
    pub fn sender(&self) -> u32 {
        self.0.sender.get()
    }
}

#[allow(clippy::too_many_arguments)]
pub fn encrypt_handshake_init(
    hs: &mut HandshakeState,
    initiator: &StaticInitiatorConfig,
    peer: &StaticPeerConfig,
    esk_i: &StaticSecret,
    now: Tai64N,
    sender: u32,
    cookie: Option<&Cookie>,
) -> HandshakeInit {
    // <- s:
    let epk_i = PublicKey::from(esk_i);
    hs.mix_hash(peer.key.as_bytes());

    // -> e: ephemeral keypair generated by caller
    hs.mix_chain(epk_i.as_bytes());
    hs.mix_hash(epk_i.as_bytes());

    // -> es:
    let k = hs.mix_key_dh(esk_i, &peer.key);

    // -> s:
    let static_key = EncryptedPublicKey::encrypt_and_hash(initiator.public_key.to_bytes(), hs, &k);

    // -> ss:
    let k = hs.mix_key_dh(&initiator.private_key, &peer.key);

    // payload:
    let timestamp = EncryptedTimestamp::encrypt_and_hash(now.to_bytes(), hs, &k);

    let mut msg = HandshakeInit {
        msg_type: little_endian::U32::new(MSG_HANDSHAKE_INIT),
        sender: little_endian::U32::new(sender),
        ephemeral_key: epk_i.to_bytes(),
        static_key,
        timestamp,
        mac1: [0; 16],
        mac2: [0; 16],
    };
    msg.mac1 = msg.compute_mac1(&peer.mac1_key);
    if let Some(cookie) = cookie {
        msg.mac2 = msg.compute_mac2(cookie);
    }

    msg
}

pub fn decrypt_handshake_init<'m>(
    init: &'m mut HandshakeInit,
    hs: &mut HandshakeState,
    receiver: &StaticInitiatorConfig,
) -> Result<&'m mut DecryptedHandshakeInit, CryptoError> {
    // <- s:
    hs.mix_hash(receiver.public_key.as_bytes());

    // -> e:
    hs.mix_chain(&init.ephemeral_key);
    hs.mix_hash(&init.ephemeral_key);

    // -> es:
    let epk_i = PublicKey::from(init.ephemeral_key);
    let k = hs.mix_key_dh(&receiver.private_key, &epk_i);

    // -> s:
    let spk_i = init.static_key.decrypt_and_hash(hs, &k)?;
    let spk_i = PublicKey::from(spk_i);
    unsafe_log!("decrypted initiator public key {spk_i:?}");

    // -> ss:
    let k = hs.mix_key_dh(&receiver.private_key, &spk_i);

    // payload:
    let _timestamp = init.timestamp.decrypt_and_hash(hs, &k)?;

    Ok(transmute_mut!(init))
}

pub fn encrypt_handshake_resp(
    hs: &mut HandshakeState,
    data: &DecryptedHandshakeInit,
    esk_r: &StaticSecret,
    peer: &StaticPeerConfig,
    sender: u32,
    cookie: Option<&Cookie>,
) -> HandshakeResp {
    // <- e: ephemeral keypair generated by caller
    let epk_r = PublicKey::from(esk_r);
    hs.mix_chain(epk_r.as_bytes());
    hs.mix_hash(epk_r.as_bytes());

    // <- ee
    let epk_i = PublicKey::from(data.0.ephemeral_key);
    hs.mix_dh(esk_r, &epk_i);

    // <- se
    let spk_i = PublicKey::from(data.0.static_key.msg);
    hs.mix_dh(esk_r, &spk_i);

    // <- psk
    let k = hs.mix_key_and_hash(&peer.preshared_key.into());

    // payload:
    let empty = EncryptedEmpty::encrypt_and_hash([], hs, &k);

    let mut msg = HandshakeResp {
        msg_type: little_endian::U32::new(MSG_HANDSHAKE_RESP),
        sender: little_endian::U32::new(sender),
        receiver: data.0.sender,
        ephemeral_key: epk_r.to_bytes(),
        empty,
        mac1: [0; 16],
        mac2: [0; 16],
    };
    msg.mac1 = msg.compute_mac1(&peer.mac1_key);
    if let Some(cookie) = cookie {
        msg.mac2 = msg.compute_mac2(cookie);
    }

    msg
}

pub fn decrypt_handshake_resp(
    resp: &mut HandshakeResp,
    hs: &mut HandshakeState,
    initiator: &StaticInitiatorConfig,
    peer: &StaticPeerConfig,
    esk_i: &StaticSecret,
) -> Result<(), CryptoError> {
    // <- e:
    let epk_r = PublicKey::from(resp.ephemeral_key);
    hs.mix_chain(epk_r.as_bytes());
    hs.mix_hash(epk_r.as_bytes());

    // <- ee:
    hs.mix_dh(esk_i, &epk_r);

    // <- se:
    hs.mix_dh(&initiator.private_key, &epk_r);

    // <- psk:
    let k = hs.mix_key_and_hash(&peer.preshared_key.into());

    // payload:
    resp.empty.decrypt_and_hash(hs, &k)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    fn keypair() -> (StaticSecret, PublicKey) {
        let sk = StaticSecret::random_from_rng(OsRng);
        let pk = PublicKey::from(&sk);
        (sk, pk)
    }

    #[test]
    fn full_handshake_derives_matching_transport_keys() {
        let (i_sk, i_pk) = keypair();
        let (r_sk, r_pk) = keypair();

        let initiator_cfg = StaticInitiatorConfig::new(i_sk);
        let responder_cfg = StaticInitiatorConfig::new(r_sk);
        let peer_of_responder = StaticPeerConfig::new(r_pk, None);
        let peer_of_initiator = StaticPeerConfig::new(i_pk, None);

        let esk_i = StaticSecret::random_from_rng(OsRng);
        let esk_r = StaticSecret::random_from_rng(OsRng);

        let mut hs_i = HandshakeState::default();
        let mut init = encrypt_handshake_init(
            &mut hs_i,
            &initiator_cfg,
            &peer_of_responder,
            &esk_i,
            Tai64N::UNIX_EPOCH,
            1,
            None,
        );

        let mut hs_r = HandshakeState::default();
        let decrypted = decrypt_handshake_init(&mut init, &mut hs_r, &responder_cfg).unwrap();
        assert_eq!(decrypted.static_key().as_bytes(), i_pk.as_bytes());

        let mut resp =
            encrypt_handshake_resp(&mut hs_r, decrypted, &esk_r, &peer_of_initiator, 2, None);

        decrypt_handshake_resp(&mut resp, &mut hs_i, &initiator_cfg, &peer_of_responder, &esk_i)
            .unwrap();

        let (i_send, i_recv) = derive_transport_keys(hs_i, true);
        let (r_send, r_recv) = derive_transport_keys(hs_r, false);

        let mut buf = *b"hello, world!!!!";
        let tag = i_send.seal_in_place(0, &[], &mut buf);
        r_recv.open_in_place(0, &[], &mut buf, &tag).unwrap();
        assert_eq!(&buf, b"hello, world!!!!");

        let mut buf2 = *b"response message";
        let tag2 = r_send.seal_in_place(0, &[], &mut buf2);
        i_recv.open_in_place(0, &[], &mut buf2, &tag2).unwrap();
        assert_eq!(&buf2, b"response message");
    }

    #[test]
    fn tampered_mac1_is_rejected() {
        let (r_sk, r_pk) = keypair();
        let responder_cfg = StaticInitiatorConfig::new(r_sk);
        let peer_of_responder = StaticPeerConfig::new(r_pk, None);
        let initiator_cfg = StaticInitiatorConfig::new(StaticSecret::random_from_rng(OsRng));
        let esk_i = StaticSecret::random_from_rng(OsRng);

        let mut hs_i = HandshakeState::default();
        let mut init = encrypt_handshake_init(
            &mut hs_i,
            &initiator_cfg,
            &peer_of_responder,
            &esk_i,
            Tai64N::UNIX_EPOCH,
            1,
            None,
        );
        init.mac1[0] ^= 0xff;

        let mut hs_r = HandshakeState::default();
        // MAC1 is keyed on the responder's own static key, so it must be
        // checked with `responder_cfg.mac1_key`, not an unrelated key.
        assert!(init.verify_mac1(&responder_cfg.mac1_key).is_err());
        // even if MAC1 were skipped, the decrypt below still runs against
        // the (unmodified-elsewhere) ciphertext, which is unaffected by a
        // MAC1 bit flip - MAC1 is a pre-filter, not message authentication.
        let _ = decrypt_handshake_init(&mut init, &mut hs_r, &responder_cfg);
    }

    #[test]
    fn static_static_dh_rejects_all_zero_output() {
        // A legitimate key pair never produces an all-zero shared secret.
        let (sk, _) = keypair();
        let (_, pk) = keypair();
        assert!(static_static_dh(&sk, &pk).is_ok());
    }
}
