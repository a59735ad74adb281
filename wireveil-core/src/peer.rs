//! The per-peer routing/session object (spec.md's Data Model "Peer").

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::time::SystemTime;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use wireveil_crypto::{PublicKey, StaticPeerConfig};

use crate::endpoint::Endpoint;
use crate::handshake::PeerHandshake;
use crate::keypair::KeypairTriple;
use crate::pipeline::Ticket;
use crate::timers::PeerTimers;

/// Depth of a peer's staging queue (outbound packets awaiting a usable
/// keypair) and of its ordered in/out queues.
pub const QUEUE_DEPTH: usize = 256;

#[derive(Default)]
pub struct PeerStats {
    pub tx_bytes: AtomicU64,
    pub rx_bytes: AtomicU64,
    last_handshake: Mutex<Option<SystemTime>>,
}

impl PeerStats {
    pub fn record_handshake(&self) {
        *self.last_handshake.lock() = Some(SystemTime::now());
    }

    pub fn last_handshake(&self) -> Option<SystemTime> {
        *self.last_handshake.lock()
    }
}

pub struct Peer {
    /// Behind a mutex (not the identity-defining `public_key` below)
    /// because the preshared key can be changed by a later UAPI `set`
    /// without recreating the peer or its session state.
    pub config: Mutex<StaticPeerConfig>,
    pub public_key: PublicKey,
    pub persistent_keepalive_secs: AtomicU16,
    pub disable_roaming: AtomicBool,

    endpoint: Mutex<Option<Endpoint>>,

    pub keypairs: Mutex<KeypairTriple>,
    pub handshake: Mutex<PeerHandshake>,
    pub timers: PeerTimers,
    pub stats: PeerStats,

    staging_tx: Sender<Vec<u8>>,
    staging_rx: Receiver<Vec<u8>>,
    outbound_order_tx: Sender<Ticket>,
    outbound_order_rx: Receiver<Ticket>,
    inbound_order_tx: Sender<Ticket>,
    inbound_order_rx: Receiver<Ticket>,
}

impl Peer {
    pub fn new(public_key: PublicKey, config: StaticPeerConfig) -> Self {
        let (staging_tx, staging_rx) = bounded(QUEUE_DEPTH);
        let (outbound_order_tx, outbound_order_rx) = bounded(QUEUE_DEPTH);
        let (inbound_order_tx, inbound_order_rx) = bounded(QUEUE_DEPTH);
        Self {
            config: Mutex::new(config),
            public_key,
            persistent_keepalive_secs: AtomicU16::new(0),
            disable_roaming: AtomicBool::new(false),
            endpoint: Mutex::new(None),
            keypairs: Mutex::new(KeypairTriple::default()),
            handshake: Mutex::new(PeerHandshake::default()),
            timers: PeerTimers::default(),
            stats: PeerStats::default(),
            staging_tx,
            staging_rx,
            outbound_order_tx,
            outbound_order_rx,
            inbound_order_tx,
            inbound_order_rx,
        }
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        *self.endpoint.lock()
    }

    /// Updates the roaming endpoint, unless disabled (spec.md's Data
    /// Model "Disable-roaming flag").
    pub fn update_endpoint(&self, endpoint: Endpoint) {
        if self.disable_roaming.load(Ordering::Relaxed) {
            return;
        }
        *self.endpoint.lock() = Some(endpoint);
    }

    pub fn set_endpoint(&self, endpoint: Endpoint) {
        *self.endpoint.lock() = Some(endpoint);
    }

    pub fn clear_endpoint_source(&self) {
        if let Some(ep) = self.endpoint.lock().as_mut() {
            ep.clear_src();
        }
    }

    /// Attempts to enqueue an outbound plaintext packet awaiting a
    /// keypair; drops silently if the staging queue is full (spec.md §4.4
    /// pipeline step 1).
    pub fn try_stage(&self, packet: Vec<u8>) -> bool {
        self.staging_tx.try_send(packet).is_ok()
    }

    pub fn drain_staged(&self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.staging_rx.try_iter()
    }

    pub fn push_outbound_ticket(&self, ticket: Ticket) -> Result<(), Ticket> {
        self.outbound_order_tx.send(ticket).map_err(|e| e.into_inner())
    }

    pub fn outbound_tickets(&self) -> &Receiver<Ticket> {
        &self.outbound_order_rx
    }

    pub fn push_inbound_ticket(&self, ticket: Ticket) -> Result<(), Ticket> {
        self.inbound_order_tx.send(ticket).map_err(|e| e.into_inner())
    }

    pub fn inbound_tickets(&self) -> &Receiver<Ticket> {
        &self.inbound_order_rx
    }

    pub fn has_usable_keypair(&self) -> bool {
        self.keypairs.lock().current.is_some()
    }

    pub fn stop(&self) {
        self.timers.stop();
        self.handshake.lock().clear();
        self.keypairs.lock().wipe();
    }
}
