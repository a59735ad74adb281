//! Per-peer handshake state (spec.md's Data Model "Handshake state" and
//! §4.2): the in-progress Noise transcript, the state tag, and the
//! TAI64N replay check that `wireveil-crypto` leaves to its caller since
//! only the caller retains per-peer history.
//!
//! Responder-side initiation decryption is a free function rather than a
//! method: until the sender's static key has been decrypted and looked
//! up in the peer registry, there is no peer object to hang state on.

use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use tai64::Tai64N;
use wireveil_crypto::{
    decrypt_handshake_init, decrypt_handshake_resp, encrypt_handshake_init, encrypt_handshake_resp,
    CryptoError, DecryptedHandshakeInit, HandshakeState, PublicKey, StaticInitiatorConfig,
    StaticPeerConfig, StaticSecret,
};
use wireveil_types::{Cookie, HandshakeInit, HandshakeResp};

/// How long a server-issued cookie remains usable for MAC2 on subsequent
/// initiations.
pub const COOKIE_VALIDITY: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeTag {
    Zeroed,
    CreatedInitiation,
    ConsumedInitiation,
    CreatedResponse,
    ConsumedResponse,
}

#[derive(Debug)]
pub enum HandshakeError {
    Crypto(CryptoError),
    StaleTimestamp,
    WrongState,
}

impl From<CryptoError> for HandshakeError {
    fn from(e: CryptoError) -> Self {
        HandshakeError::Crypto(e)
    }
}

/// Completed handshake material ready to be turned into a [`crate::keypair::Keypair`].
pub struct HandshakeOutput {
    pub hs: HandshakeState,
    pub initiator: bool,
    pub local_index: u32,
    pub remote_index: u32,
}

/// The result of decrypting a `HandshakeInit` before the sender's
/// identity is known to the device.
pub struct ConsumedInitiation {
    hs: HandshakeState,
    pub static_key: PublicKey,
    timestamp: Tai64N,
    remote_index: u32,
}

/// Decrypts `init` in place and identifies the sender, without touching
/// any peer's state (spec.md §4.2: the responder only learns the sender
/// once the static key is decrypted).
pub fn consume_initiation(
    init: &mut HandshakeInit,
    receiver: &StaticInitiatorConfig,
) -> Result<ConsumedInitiation, HandshakeError> {
    let mut hs = HandshakeState::default();
    let decrypted = decrypt_handshake_init(init, &mut hs, receiver)?;
    Ok(ConsumedInitiation {
        static_key: decrypted.static_key(),
        timestamp: decrypted.timestamp(),
        remote_index: decrypted.sender(),
        hs,
    })
}

struct InProgress {
    hs: HandshakeState,
    esk: StaticSecret,
    local_index: u32,
}

pub struct PeerHandshake {
    tag: HandshakeTag,
    in_progress: Option<InProgress>,
    pub last_sent_handshake: Option<Instant>,
    last_initiation_timestamp_consumed: Option<Tai64N>,
    last_cookie: Option<(Cookie, Instant)>,
}

impl Default for PeerHandshake {
    fn default() -> Self {
        Self {
            tag: HandshakeTag::Zeroed,
            in_progress: None,
            last_sent_handshake: None,
            last_initiation_timestamp_consumed: None,
            last_cookie: None,
        }
    }
}

impl PeerHandshake {
    pub fn tag(&self) -> HandshakeTag {
        self.tag
    }

    pub fn set_cookie(&mut self, cookie: Cookie, now: Instant) {
        self.last_cookie = Some((cookie, now));
    }

    /// Returns the peer's cookie if it is still within [`COOKIE_VALIDITY`].
    pub fn valid_cookie(&self, now: Instant) -> Option<Cookie> {
        self.last_cookie
            .filter(|(_, received)| now.duration_since(*received) < COOKIE_VALIDITY)
            .map(|(c, _)| c)
    }

    /// As initiator: build a fresh `HandshakeInit`, remembering the
    /// ephemeral secret and transcript for the response step.
    pub fn begin_initiation(
        &mut self,
        initiator: &StaticInitiatorConfig,
        peer: &StaticPeerConfig,
        local_index: u32,
        now: Tai64N,
        cookie: Option<&Cookie>,
    ) -> HandshakeInit {
        let esk = StaticSecret::random_from_rng(OsRng);
        let mut hs = HandshakeState::default();
        let msg = encrypt_handshake_init(&mut hs, initiator, peer, &esk, now, local_index, cookie);
        self.in_progress = Some(InProgress { hs, esk, local_index });
        self.tag = HandshakeTag::CreatedInitiation;
        msg
    }

    /// As responder: having identified the sender via
    /// [`consume_initiation`], rejects stale TAI64N timestamps (spec.md
    /// §8) and builds the `HandshakeResp`, completing the handshake.
    pub fn begin_response(
        &mut self,
        consumed: ConsumedInitiation,
        init: &HandshakeInit,
        peer: &StaticPeerConfig,
        local_index: u32,
        cookie: Option<&Cookie>,
    ) -> Result<(HandshakeResp, HandshakeOutput), HandshakeError> {
        if let Some(last) = self.last_initiation_timestamp_consumed {
            if consumed.timestamp <= last {
                return Err(HandshakeError::StaleTimestamp);
            }
        }
        self.last_initiation_timestamp_consumed = Some(consumed.timestamp);
        self.tag = HandshakeTag::ConsumedInitiation;

        let mut hs = consumed.hs;
        let decrypted: &DecryptedHandshakeInit = zerocopy::transmute_ref!(init);
        let esk = StaticSecret::random_from_rng(OsRng);
        let msg = encrypt_handshake_resp(&mut hs, decrypted, &esk, peer, local_index, cookie);
        self.tag = HandshakeTag::CreatedResponse;

        Ok((
            msg,
            HandshakeOutput { hs, initiator: false, local_index, remote_index: consumed.remote_index },
        ))
    }

    /// As initiator: consume the responder's `HandshakeResp`, completing
    /// the handshake.
    pub fn consume_response(
        &mut self,
        resp: &mut HandshakeResp,
        initiator: &StaticInitiatorConfig,
        peer: &StaticPeerConfig,
    ) -> Result<HandshakeOutput, HandshakeError> {
        let Some(mut in_progress) = self.in_progress.take() else {
            return Err(HandshakeError::WrongState);
        };
        decrypt_handshake_resp(resp, &mut in_progress.hs, initiator, peer, &in_progress.esk)?;
        self.tag = HandshakeTag::ConsumedResponse;
        let remote_index = resp.sender.get();
        Ok(HandshakeOutput {
            hs: in_progress.hs,
            initiator: true,
            local_index: in_progress.local_index,
            remote_index,
        })
    }

    pub fn clear(&mut self) {
        self.in_progress = None;
        self.tag = HandshakeTag::Zeroed;
    }
}
