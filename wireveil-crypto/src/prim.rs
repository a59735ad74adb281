//! Hashing, MAC, HKDF and the Noise `HandshakeState` accumulator.
//!
//! Grounded on the teacher's `src/utils.rs`: same BLAKE2s-based `hash`/`mac`
//! helpers and the same `HandshakeState` method names (`mix_chain`,
//! `mix_dh`, `mix_key_dh`, `mix_hash`, `split`), generalized with a
//! `mix_key_and_hash` for PSK mixing (IKpsk2's `<- psk` step, spec.md §4.2)
//! and switched from a hardcoded `CONSTRUCTION_HASH`/`IDENTIFIER_HASH` pair
//! to hashing the construction/identifier strings at first use, since those
//! constants are specific to this project rather than carried over from the
//! teacher's.

use blake2::digest::{Digest, Output};
use blake2::Blake2s256;
use chacha20poly1305::aead::AeadInPlace;
pub use chacha20poly1305::Key;
use chacha20poly1305::{ChaCha20Poly1305, KeyInit, Nonce, XChaCha20Poly1305, XNonce};
use hmac::SimpleHmac;
use wireveil_types::{
    Cookie, EncryptedCookie, EncryptedEmpty, EncryptedPublicKey, EncryptedTimestamp, Tag,
};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::CryptoError;

/// `Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s` — the Noise protocol name for
/// this exact combination of pattern, DH function, cipher and hash.
const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";
/// This project's handshake identifier, mixed into the transcript hash
/// alongside the construction name per the Noise spec's `Hi := Hash(Ci ||
/// Identifier)` initialization rule.
const IDENTIFIER: &[u8] = b"wireveil v1 handshake";

pub const LABEL_MAC1: [u8; 8] = *b"mac1----";
pub const LABEL_COOKIE: [u8; 8] = *b"cookie--";

pub type Mac = [u8; 16];

/// Build the 12-byte ChaCha20-Poly1305 nonce used throughout the handshake
/// and transport: 4 zero bytes followed by the little-endian counter
/// (spec.md §6).
pub(crate) fn nonce(counter: u64) -> Nonce {
    let mut n = Nonce::default();
    n[4..].copy_from_slice(&counter.to_le_bytes());
    n
}

pub fn hash<const M: usize>(msg: [&[u8]; M]) -> Output<Blake2s256> {
    let mut digest = Blake2s256::default();
    for part in msg {
        digest.update(part);
    }
    digest.finalize()
}

pub fn mac(key: &[u8], msg: &[u8]) -> Mac {
    use blake2::digest::Mac as _;
    type Blake2sMac16 = blake2::Blake2sMac<chacha20poly1305::consts::U16>;
    let mut mac = <Blake2sMac16 as KeyInit>::new_from_slice(key)
        .expect("key is a valid MAC key length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

fn hmac<const M: usize>(key: &Key, msg: [&[u8]; M]) -> Output<Blake2s256> {
    use hmac::Mac as _;
    let mut hmac = <SimpleHmac<Blake2s256> as hmac::Mac>::new_from_slice(key)
        .expect("key is a valid HMAC key length");
    for part in msg {
        hmac.update(part);
    }
    hmac.finalize().into_bytes()
}

/// HKDF-Extract-and-Expand producing `N` 32-byte outputs, as specified by
/// Noise's `HKDF(chaining_key, input_key_material, num_outputs)`.
pub(crate) fn hkdf<const N: usize, const M: usize>(
    key: &Key,
    msg: [&[u8]; M],
) -> [Output<Blake2s256>; N] {
    assert!(N <= 255 && N > 0);

    let mut output = [Output::<Blake2s256>::default(); N];

    let t0 = hmac(key, msg);
    let mut ti = hmac(&t0, [&[1]]);
    output[0] = ti;
    for i in 1..N as u8 {
        ti = hmac(&t0, [&ti, &[i + 1]]);
        output[i as usize] = ti;
    }

    output
}

/// Running Noise transcript state: the chaining key and the transcript
/// hash (spec.md's "Chain key / Transcript hash").
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct HandshakeState {
    hash: Key,
    chain: Key,
}

impl Default for HandshakeState {
    fn default() -> Self {
        let chain = hash([CONSTRUCTION]);
        let hash = hash([&chain, IDENTIFIER]);
        Self { chain, hash }
    }
}

impl HandshakeState {
    pub fn mix_chain(&mut self, b: &[u8]) {
        let [c] = hkdf(&self.chain, [b]);
        self.chain = c;
    }

    pub fn mix_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) {
        let prk = sk.diffie_hellman(pk);
        let [c] = hkdf(&self.chain, [prk.as_bytes()]);
        self.chain = c;
    }

    pub fn mix_key_dh(&mut self, sk: &StaticSecret, pk: &PublicKey) -> Key {
        let prk = sk.diffie_hellman(pk);
        let [c, k] = hkdf(&self.chain, [prk.as_bytes()]);
        self.chain = c;
        k
    }

    /// The IKpsk2 `<- psk` step: mixes the preshared key into both the
    /// chain and the transcript hash, and returns a fresh AEAD key.
    pub fn mix_key_and_hash(&mut self, psk: &[u8; 32]) -> Key {
        let [c, t, k] = hkdf(&self.chain, [psk]);
        self.chain = c;
        self.mix_hash(&t);
        k
    }

    pub fn mix_hash(&mut self, b: &[u8]) {
        self.hash = hash([&self.hash, b]);
    }

    pub fn transcript_hash(&self) -> &Key {
        &self.hash
    }

    /// `KDF2(chain_key, empty)`, consuming and zeroizing the state.
    pub fn split(mut self) -> (Key, Key) {
        let [k1, k2] = hkdf(&self.chain, []);
        self.zeroize();
        (k1, k2)
    }
}

/// A key whose only valid use is sealing outbound packets.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(Key);

/// A key whose only valid use is opening inbound packets.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DecryptionKey(Key);

impl EncryptionKey {
    pub(crate) fn new(key: Key) -> Self {
        Self(key)
    }

    /// Seals `buf` in place under the given 64-bit counter, returning the
    /// detached authentication tag (spec.md §6: nonce is 4 zero bytes
    /// followed by the little-endian counter).
    pub fn seal_in_place(&self, counter: u64, aad: &[u8], buf: &mut [u8]) -> Tag {
        let tag = ChaCha20Poly1305::new(&self.0)
            .encrypt_in_place_detached(&nonce(counter), aad, buf)
            .expect("transport payloads are always within the AEAD's max message size");
        Tag(tag.into())
    }
}

impl DecryptionKey {
    pub(crate) fn new(key: Key) -> Self {
        Self(key)
    }

    pub fn open_in_place(
        &self,
        counter: u64,
        aad: &[u8],
        buf: &mut [u8],
        tag: &Tag,
    ) -> Result<(), CryptoError> {
        ChaCha20Poly1305::new(&self.0)
            .decrypt_in_place_detached(&nonce(counter), aad, buf, (&tag.0).into())
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

/// Splits a completed handshake's chain key into role-tagged transport
/// keys (spec.md §4.2: "Both sides run KDF2(chain_key, empty) ..., with
/// roles swapped between initiator and responder").
pub fn derive_transport_keys(hs: HandshakeState, initiator: bool) -> (EncryptionKey, DecryptionKey) {
    let (k1, k2) = hs.split();
    if initiator {
        (EncryptionKey::new(k1), DecryptionKey::new(k2))
    } else {
        (EncryptionKey::new(k2), DecryptionKey::new(k1))
    }
}

/// Noise's `EncryptAndHash`/`DecryptAndHash`, specialized per fixed-size
/// handshake payload. Defined locally (rather than as an inherent impl on
/// the `wireveil-types` wire structs) so the orphan rule is satisfied while
/// keeping `wireveil-types` free of crypto dependencies.
pub trait EncryptedField<const N: usize>: Sized {
    fn decrypt_and_hash(
        &mut self,
        state: &mut HandshakeState,
        key: &Key,
    ) -> Result<[u8; N], CryptoError>;

    fn encrypt_and_hash(msg: [u8; N], state: &mut HandshakeState, key: &Key) -> Self;
}

macro_rules! encrypted_field {
    ($ty:ident, $n:literal) => {
        impl EncryptedField<$n> for $ty {
            fn decrypt_and_hash(
                &mut self,
                state: &mut HandshakeState,
                key: &Key,
            ) -> Result<[u8; $n], CryptoError> {
                let aad = *state.transcript_hash();
                state.mix_hash(zerocopy::AsBytes::as_bytes(&*self));

                let mut msg = self.msg;
                ChaCha20Poly1305::new(key)
                    .decrypt_in_place_detached(&nonce(0), &aad, &mut msg, (&self.tag.0).into())
                    .map_err(|_| CryptoError::DecryptionFailed)?;
                Ok(msg)
            }

            fn encrypt_and_hash(
                mut msg: [u8; $n],
                state: &mut HandshakeState,
                key: &Key,
            ) -> Self {
                let aad = *state.transcript_hash();
                let tag = ChaCha20Poly1305::new(key)
                    .encrypt_in_place_detached(&nonce(0), &aad, &mut msg)
                    .expect("handshake payloads are well within the AEAD's max message size");
                let out = Self {
                    msg,
                    tag: Tag(tag.into()),
                };
                state.mix_hash(zerocopy::AsBytes::as_bytes(&out));
                out
            }
        }
    };
}

encrypted_field!(EncryptedEmpty, 0);
encrypted_field!(EncryptedTimestamp, 12);
encrypted_field!(EncryptedPublicKey, 32);

/// Encryption for the cookie-reply message (XChaCha20-Poly1305, keyed by
/// `cookie_key`). A local trait for the same orphan-rule reason as
/// [`EncryptedField`].
pub trait CookieCipher: Sized {
    fn decrypt(&mut self, key: &Key, nonce: &[u8; 24], aad: &[u8]) -> Result<Cookie, CryptoError>;
    fn encrypt(cookie: Cookie, key: &Key, nonce: &[u8; 24], aad: &[u8]) -> Self;
}

impl CookieCipher for EncryptedCookie {
    fn decrypt(&mut self, key: &Key, nonce: &[u8; 24], aad: &[u8]) -> Result<Cookie, CryptoError> {
        let mut cookie = self.msg;
        XChaCha20Poly1305::new(key)
            .decrypt_in_place_detached(
                XNonce::from_slice(nonce),
                aad,
                &mut cookie.0,
                (&self.tag.0).into(),
            )
            .map_err(|_| CryptoError::DecryptionFailed)?;
        Ok(cookie)
    }

    fn encrypt(mut cookie: Cookie, key: &Key, nonce: &[u8; 24], aad: &[u8]) -> Self {
        let tag = XChaCha20Poly1305::new(key)
            .encrypt_in_place_detached(XNonce::from_slice(nonce), aad, &mut cookie.0)
            .expect("cookie payload is well within the AEAD's max message size");
        Self {
            msg: cookie,
            tag: Tag(tag.into()),
        }
    }
}

pub fn mac1_key(spk: &PublicKey) -> Key {
    hash([&LABEL_MAC1, spk.as_bytes()])
}

pub fn cookie_key(spk: &PublicKey) -> Key {
    hash([&LABEL_COOKIE, spk.as_bytes()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_state_matches_noise_initialization() {
        let hs = HandshakeState::default();
        let expected_chain = hash([CONSTRUCTION]);
        let expected_hash = hash([&expected_chain, IDENTIFIER]);
        assert_eq!(hs.chain, expected_chain);
        assert_eq!(hs.hash, expected_hash);
    }

    #[test]
    fn split_produces_distinct_keys() {
        let mut hs = HandshakeState::default();
        hs.mix_chain(b"some shared secret");
        let (k1, k2) = hs.split();
        assert_ne!(k1, k2);
    }

    #[test]
    fn transport_nonce_is_le_counter_padded_with_zeros() {
        let n = nonce(0x0102030405060708);
        assert_eq!(&n[..4], &[0, 0, 0, 0]);
        assert_eq!(&n[4..], &0x0102030405060708u64.to_le_bytes());
    }
}
