//! A single derived session: the AEAD key pair plus the bookkeeping
//! needed to expire it and reject replayed or exhausted counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use wireveil_crypto::{derive_transport_keys, DecryptionKey, EncryptionKey, HandshakeState};
use wireveil_utils::replay::REJECT_AFTER_MESSAGES;
use wireveil_utils::ReplayFilter;

/// A session expires this long after it was derived, regardless of
/// traffic (mirrors WireGuard's `REJECT_AFTER_TIME`).
pub const REJECT_AFTER_TIME: Duration = Duration::from_secs(180);

pub struct Keypair {
    pub local_index: u32,
    pub remote_index: u32,
    send: EncryptionKey,
    recv: DecryptionKey,
    send_counter: AtomicU64,
    recv_filter: parking_lot::Mutex<ReplayFilter>,
    created_at: Instant,
    pub initiator: bool,
}

impl Keypair {
    pub fn from_handshake(
        hs: HandshakeState,
        initiator: bool,
        local_index: u32,
        remote_index: u32,
    ) -> Self {
        let (send, recv) = derive_transport_keys(hs, initiator);
        Self {
            local_index,
            remote_index,
            send,
            recv,
            send_counter: AtomicU64::new(0),
            recv_filter: parking_lot::Mutex::new(ReplayFilter::new()),
            created_at: Instant::now(),
            initiator,
        }
    }

    /// Assigns the next monotonic send nonce.
    pub fn next_nonce(&self) -> u64 {
        self.send_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn seal(&self, counter: u64, aad: &[u8], buf: &mut [u8]) -> wireveil_types::Tag {
        self.send.seal_in_place(counter, aad, buf)
    }

    pub fn open(
        &self,
        counter: u64,
        aad: &[u8],
        buf: &mut [u8],
        tag: &wireveil_types::Tag,
    ) -> Result<(), wireveil_crypto::CryptoError> {
        self.recv.open_in_place(counter, aad, buf, tag)
    }

    /// `true` the first time `counter` is presented for this keypair.
    pub fn validate_counter(&self, counter: u64) -> bool {
        self.recv_filter.lock().validate_counter(counter)
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= REJECT_AFTER_TIME
            || self.send_counter.load(Ordering::Relaxed) >= REJECT_AFTER_MESSAGES
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// `previous` / `current` / `next` keypair ownership (spec.md's Data
/// Model "Keypair triple"). Kept behind `Arc` so a pipeline [`crate::pipeline::Completer`]
/// can hold the keypair it needs on another thread without locking the
/// triple for the duration of the AEAD operation.
#[derive(Default)]
pub struct KeypairTriple {
    pub previous: Option<Arc<Keypair>>,
    pub current: Option<Arc<Keypair>>,
    pub next: Option<Arc<Keypair>>,
}

impl KeypairTriple {
    /// Installs a freshly derived keypair as `next`.
    pub fn stage_next(&mut self, kp: Keypair) {
        self.next = Some(Arc::new(kp));
    }

    /// Promotes `next` to `current` on first authenticated receipt under
    /// it, demoting the prior `current` to `previous` and dropping the
    /// old `previous` (spec.md §4's pipeline step 3: "on first
    /// authenticated receipt under `next`, promotes the keypair triple").
    pub fn promote_next(&mut self) {
        if let Some(next) = self.next.take() {
            self.previous = self.current.take();
            self.current = Some(next);
        }
    }

    pub fn lookup(&self, local_index: u32) -> Option<Arc<Keypair>> {
        [&self.previous, &self.current, &self.next]
            .into_iter()
            .flatten()
            .find(|kp| kp.local_index == local_index)
            .cloned()
    }

    pub fn expire_stale(&mut self) {
        if self.previous.as_deref().is_some_and(Keypair::is_expired) {
            self.previous = None;
        }
        if self.current.as_deref().is_some_and(Keypair::is_expired) {
            self.current = None;
        }
        if self.next.as_deref().is_some_and(Keypair::is_expired) {
            self.next = None;
        }
    }

    pub fn wipe(&mut self) {
        self.previous = None;
        self.current = None;
        self.next = None;
    }
}
