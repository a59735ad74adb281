//! The device controller (spec.md §4.6): lifecycle, peer registry, static
//! identity, and the worker topology described in §4.4's parallel packet
//! pipeline. Grounded on the teacher's own top-level wiring (`src/lib.rs`
//! owned a single static identity plus a peer map) generalized to the
//! full multi-threaded pipeline and UAPI surface this project adds.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand_core::RngCore;
use tai64::Tai64N;
use tracing::{debug, info, trace, warn};
use zerocopy::{AsBytes, FromBytes};

use wireveil_crypto::{
    decrypt_cookie, encrypt_cookie, static_static_dh, CookieState, HasMac, Key, PublicKey,
    StaticInitiatorConfig, StaticPeerConfig, StaticSecret,
};
use wireveil_types::{
    CookieReply, HandshakeInit, HandshakeResp, TransportHeader, COOKIE_REPLY_SZ,
    HANDSHAKE_INIT_SZ, HANDSHAKE_RESP_SZ, MSG_COOKIE_REPLY, MSG_HANDSHAKE_INIT, MSG_HANDSHAKE_RESP,
    MSG_TRANSPORT, TRANSPORT_HEADER_SZ,
};
use wireveil_utils::{AllowedIps, IndexTable, RateLimiter};

use crate::bind::Bind;
use crate::endpoint::Endpoint;
use crate::error::{DeviceError, Result};
use crate::handshake::{consume_initiation, HandshakeError, HandshakeOutput};
use crate::iphdr;
use crate::keypair::Keypair;
use crate::peer::Peer;
use crate::pipeline::{self, Completer, Direction, PacketElement};
use crate::pool::BufferPool;
use crate::timers::{jitter, KEEPALIVE_TIMEOUT, MAX_TIMER_HANDSHAKES, REJECT_AFTER_TIME_X3, REKEY_TIMEOUT};
use crate::tun::Tun;

/// How many in-flight handshake-family datagrams before a device declares
/// itself under load (spec.md §4.5: "e.g., half its capacity").
pub const HANDSHAKE_QUEUE_CAPACITY: usize = 128;
const UNDER_LOAD_THRESHOLD: usize = HANDSHAKE_QUEUE_CAPACITY / 2;
const UNDER_LOAD_STICKY: Duration = Duration::from_secs(1);
const HANDSHAKE_INITIATION_RATE: Duration = Duration::from_millis(20);
const HANDSHAKE_RATE_BURST: u32 = 10;
const RATE_LIMITER_IDLE_AFTER: Duration = Duration::from_secs(180);
const RATE_LIMITER_GC_INTERVAL: Duration = Duration::from_secs(30);
const POOL_CAPACITY: usize = 512;
const TAG_SZ: usize = 16;
/// How often a per-peer sender/receiver loop wakes to check whether its
/// peer has been stopped, since the ordered ticket queues are never
/// closed out from under a running peer.
const PEER_LOOP_POLL: Duration = Duration::from_millis(200);

/// A peer's identity, derived once from its static public key and used as
/// the key into every per-device collection (registry, trie, index table)
/// so none of them need to depend on `x25519_dalek::PublicKey`'s own trait
/// impls.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct PeerId([u8; 32]);

impl PeerId {
    fn of(pk: &PublicKey) -> Self {
        PeerId(*pk.as_bytes())
    }
}

#[derive(Clone, Copy)]
enum IndexEntry {
    Handshake(PeerId),
    Keypair(PeerId),
}

impl IndexEntry {
    fn peer_id(&self) -> PeerId {
        match self {
            IndexEntry::Handshake(p) | IndexEntry::Keypair(p) => *p,
        }
    }
}

#[derive(Default)]
struct StaticIdentity {
    private: Option<StaticInitiatorConfig>,
    cookie_state: CookieState,
}

/// Construction-time parameters that don't change over a device's life.
#[derive(Clone, Copy)]
pub struct DeviceConfig {
    /// Tunneled-payload MTU; outbound packets are padded up to this bound
    /// (spec.md §6 "Padding").
    pub mtu: usize,
    /// Worker count for each of the encrypt/decrypt pools; `0` picks the
    /// number of available cores.
    pub worker_threads: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { mtu: 1420, worker_threads: 0 }
    }
}

/// A patch applied via [`Device::apply_peer_config`] — the Rust-level
/// equivalent of one `public_key=`-scoped block of the UAPI text protocol
/// (spec.md §6).
#[derive(Default)]
pub struct PeerConfig {
    pub public_key: Option<PublicKey>,
    pub preshared_key: Option<Key>,
    pub endpoint: Option<SocketAddr>,
    pub persistent_keepalive: Option<u16>,
    pub replace_allowed_ips: bool,
    pub allowed_ips: Vec<(IpAddr, u8)>,
    pub remove: bool,
    pub update_only: bool,
}

struct HandshakeJob {
    buf: Vec<u8>,
    endpoint: Endpoint,
}

/// Owns the virtual interface, the UDP bind, the peer registry and every
/// worker thread (spec.md §4.6).
pub struct Device {
    identity: RwLock<StaticIdentity>,
    listen_port: AtomicU16,
    fwmark: AtomicU32,
    peers: RwLock<HashMap<PeerId, Arc<Peer>>>,
    allowed_ips: RwLock<AllowedIps<PeerId>>,
    index_table: Mutex<IndexTable<IndexEntry>>,
    rate_limiter: Mutex<RateLimiter>,
    handshake_queue_len: AtomicUsize,
    under_load_until: Mutex<Option<Instant>>,
    pool: BufferPool,
    bind: Arc<dyn Bind>,
    tun: Arc<dyn Tun>,
    config: DeviceConfig,
    closed: AtomicBool,
    running: AtomicBool,
    threads: Mutex<Vec<JoinHandle<()>>>,
    peer_threads: Mutex<HashMap<PeerId, Vec<JoinHandle<()>>>>,
    encrypt_tx: Mutex<Option<Sender<Completer>>>,
    decrypt_tx: Mutex<Option<Sender<Completer>>>,
    handshake_tx: Mutex<Option<Sender<HandshakeJob>>>,
}

impl Device {
    pub fn new(bind: Arc<dyn Bind>, tun: Arc<dyn Tun>, config: DeviceConfig) -> Arc<Self> {
        let buf_size = TRANSPORT_HEADER_SZ + config.mtu + TAG_SZ;
        Arc::new(Self {
            identity: RwLock::new(StaticIdentity::default()),
            listen_port: AtomicU16::new(0),
            fwmark: AtomicU32::new(0),
            peers: RwLock::new(HashMap::new()),
            allowed_ips: RwLock::new(AllowedIps::default()),
            index_table: Mutex::new(IndexTable::new()),
            rate_limiter: Mutex::new(RateLimiter::new(HANDSHAKE_INITIATION_RATE, HANDSHAKE_RATE_BURST)),
            handshake_queue_len: AtomicUsize::new(0),
            under_load_until: Mutex::new(None),
            pool: BufferPool::new(buf_size, POOL_CAPACITY),
            bind,
            tun,
            config,
            closed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
            peer_threads: Mutex::new(HashMap::new()),
            encrypt_tx: Mutex::new(None),
            decrypt_tx: Mutex::new(None),
            handshake_tx: Mutex::new(None),
        })
    }

    // ---- configuration ---- //

    /// Sets the local static identity. Deletes any peer whose own public
    /// key now equals the new local one, and drops peers whose
    /// static-static DH has degenerated (spec.md's Data Model, "Static
    /// Identity").
    pub fn set_private_key(&self, sk: StaticSecret) {
        let new_pub = PublicKey::from(&sk);
        let new_id = PeerId::of(&new_pub);

        let mut peers = self.peers.write();
        if let Some(removed) = peers.remove(&new_id) {
            self.allowed_ips.write().remove_by_peer(new_id);
            removed.stop();
        }

        let mut degenerate = Vec::new();
        for (id, peer) in peers.iter() {
            if static_static_dh(&sk, &peer.public_key).is_err() {
                degenerate.push(*id);
            }
        }
        for id in degenerate {
            if let Some(peer) = peers.remove(&id) {
                warn!("dropping peer with degenerate static-static DH after key rotation");
                self.allowed_ips.write().remove_by_peer(id);
                peer.stop();
            }
        }
        drop(peers);

        let mut identity = self.identity.write();
        identity.cookie_state.generate(&mut OsRng);
        identity.private = Some(StaticInitiatorConfig::new(sk));
    }

    pub fn set_listen_port(&self, port: u16) {
        self.listen_port.store(port, Ordering::SeqCst);
    }

    pub fn set_fwmark(&self, mark: u32) {
        self.fwmark.store(mark, Ordering::SeqCst);
        if self.running.load(Ordering::SeqCst) {
            let _ = self.bind.set_mark(mark);
        }
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::SeqCst)
    }

    pub fn fwmark(&self) -> u32 {
        self.fwmark.load(Ordering::SeqCst)
    }

    pub fn has_private_key(&self) -> bool {
        self.identity.read().private.is_some()
    }

    pub fn public_key(&self) -> Option<PublicKey> {
        self.identity.read().private.as_ref().map(|p| p.public_key)
    }

    /// Creates or updates the peer identified by `cfg.public_key`
    /// (spec.md §4.6 `add_or_update_peer`).
    pub fn apply_peer_config(self: &Arc<Self>, cfg: PeerConfig) -> Result<()> {
        let public_key = cfg.public_key.ok_or_else(|| DeviceError::ConfigurationError {
            key: "public_key".into(),
            reason: "missing".into(),
        })?;
        let id = PeerId::of(&public_key);

        if cfg.remove {
            let mut peers = self.peers.write();
            if let Some(peer) = peers.remove(&id) {
                self.allowed_ips.write().remove_by_peer(id);
                peer.stop();
                drop(peers);
                self.join_peer_threads(id);
            }
            return Ok(());
        }

        let peer = {
            let mut peers = self.peers.write();
            match peers.get(&id) {
                Some(p) => p.clone(),
                None => {
                    if cfg.update_only {
                        return Err(DeviceError::ConfigurationError {
                            key: "public_key".into(),
                            reason: "no such peer and update_only was set".into(),
                        });
                    }
                    if let Some(private) = self.identity.read().private.as_ref() {
                        if static_static_dh(&private.private_key, &public_key).is_err() {
                            return Err(DeviceError::ConfigurationError {
                                key: "public_key".into(),
                                reason: "degenerate (low-order) public key".into(),
                            });
                        }
                    }
                    let static_cfg = StaticPeerConfig::new(public_key, cfg.preshared_key);
                    let new_peer = Arc::new(Peer::new(public_key, static_cfg));
                    peers.insert(id, new_peer.clone());
                    new_peer
                }
            }
        };

        if let Some(psk) = cfg.preshared_key {
            peer.config.lock().preshared_key = psk;
        }
        if let Some(endpoint) = cfg.endpoint {
            peer.set_endpoint(Endpoint::new(endpoint));
        }
        if let Some(secs) = cfg.persistent_keepalive {
            peer.persistent_keepalive_secs.store(secs, Ordering::SeqCst);
        }

        {
            let mut allowed_ips = self.allowed_ips.write();
            if cfg.replace_allowed_ips {
                allowed_ips.remove_by_peer(id);
            }
            for (addr, len) in &cfg.allowed_ips {
                allowed_ips.insert(*addr, *len, id);
            }
        }

        if self.running.load(Ordering::SeqCst) {
            self.spawn_peer_threads(&peer, id);
            if peer.persistent_keepalive_secs.load(Ordering::SeqCst) > 0 {
                self.send_keepalive(&peer);
            }
        }

        Ok(())
    }

    pub fn remove_all_peers(&self) {
        let ids: Vec<PeerId> = {
            let mut peers = self.peers.write();
            let ids: Vec<PeerId> = peers.keys().copied().collect();
            for peer in peers.values() {
                peer.stop();
            }
            peers.clear();
            ids
        };
        *self.allowed_ips.write() = AllowedIps::default();
        for id in ids {
            self.join_peer_threads(id);
        }
    }

    // ---- lifecycle ---- //

    /// Idempotently reconciles running state with configuration: creates
    /// or recreates the bind, (re)starts worker pools and per-peer
    /// threads, and kicks off persistent keepalives (spec.md §4.6).
    pub fn up(self: &Arc<Self>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::Fatal(std::io::Error::new(
                std::io::ErrorKind::Other,
                "device already closed",
            )));
        }

        let requested_port = self.listen_port();
        let actual_port = match self.bind.open(requested_port) {
            Ok(p) => p,
            Err(e) if requested_port != 0 => {
                warn!(port = requested_port, "bind failed on requested port, retrying on any port");
                let _ = e;
                self.bind.open(0).map_err(DeviceError::Fatal)?
            }
            Err(e) => return Err(DeviceError::Fatal(e)),
        };
        self.listen_port.store(actual_port, Ordering::SeqCst);
        let _ = self.bind.set_mark(self.fwmark());

        let worker_count = if self.config.worker_threads == 0 {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(2)
        } else {
            self.config.worker_threads
        };

        let (encrypt_tx, encrypt_rx) = bounded::<Completer>(POOL_CAPACITY);
        let (decrypt_tx, decrypt_rx) = bounded::<Completer>(POOL_CAPACITY);
        *self.encrypt_tx.lock() = Some(encrypt_tx);
        *self.decrypt_tx.lock() = Some(decrypt_tx);

        let mut threads = self.threads.lock();
        threads.extend(pipeline::spawn_workers(worker_count, encrypt_rx));
        threads.extend(pipeline::spawn_workers(worker_count, decrypt_rx));

        let (handshake_tx, handshake_rx) = bounded::<HandshakeJob>(HANDSHAKE_QUEUE_CAPACITY);
        *self.handshake_tx.lock() = Some(handshake_tx);
        {
            let device = self.clone();
            threads.push(std::thread::spawn(move || device.handshake_worker_loop(handshake_rx)));
        }
        {
            let device = self.clone();
            threads.push(std::thread::spawn(move || device.udp_receiver_loop(false)));
        }
        {
            let device = self.clone();
            threads.push(std::thread::spawn(move || device.udp_receiver_loop(true)));
        }
        {
            let device = self.clone();
            threads.push(std::thread::spawn(move || device.tun_reader_loop()));
        }
        {
            let device = self.clone();
            threads.push(std::thread::spawn(move || device.garbage_collector_loop()));
        }
        drop(threads);

        self.running.store(true, Ordering::SeqCst);

        let peers: Vec<(PeerId, Arc<Peer>)> =
            self.peers.read().iter().map(|(id, p)| (*id, p.clone())).collect();
        for (id, peer) in peers {
            self.spawn_peer_threads(&peer, id);
            if peer.persistent_keepalive_secs.load(Ordering::SeqCst) > 0 {
                self.send_keepalive(&peer);
            }
        }

        info!(port = actual_port, "device is up");
        Ok(())
    }

    /// Stops every worker and per-peer thread but leaves configuration
    /// (identity, peers, allowed-IPs) intact so a later `up()` resumes.
    pub fn down(self: &Arc<Self>) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.bind.close();
        self.tun.close();

        *self.encrypt_tx.lock() = None;
        *self.decrypt_tx.lock() = None;
        *self.handshake_tx.lock() = None;

        for thread in self.threads.lock().drain(..) {
            let _ = thread.join();
        }

        let ids: Vec<PeerId> = self.peers.read().keys().copied().collect();
        for (id, peer) in self.peers.read().iter() {
            let _ = id;
            peer.stop();
        }
        for id in ids {
            self.join_peer_threads(id);
        }
        info!("device is down");
    }

    /// Idempotent terminal shutdown (spec.md §4.6): flips the closed
    /// flag, tears down everything `down()` does, and wipes all key
    /// material.
    pub fn close(self: &Arc<Self>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.down();
        self.remove_all_peers();
        *self.identity.write() = StaticIdentity::default();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn join_peer_threads(&self, id: PeerId) {
        if let Some(handles) = self.peer_threads.lock().remove(&id) {
            for h in handles {
                let _ = h.join();
            }
        }
    }

    // ---- under-load / rate limiting (spec.md §4.5) ---- //

    fn is_under_load(&self, now: Instant) -> bool {
        let len = self.handshake_queue_len.load(Ordering::Relaxed);
        let mut sticky = self.under_load_until.lock();
        if len >= UNDER_LOAD_THRESHOLD {
            *sticky = Some(now + UNDER_LOAD_STICKY);
            return true;
        }
        match *sticky {
            Some(until) if now < until => true,
            _ => {
                *sticky = None;
                false
            }
        }
    }

    fn garbage_collector_loop(self: Arc<Self>) {
        while self.running.load(Ordering::SeqCst) {
            std::thread::sleep(RATE_LIMITER_GC_INTERVAL);
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.rate_limiter.lock().collect_garbage(Instant::now(), RATE_LIMITER_IDLE_AFTER);
        }
    }

    // ---- outbound path (spec.md §4.4) ---- //

    fn tun_reader_loop(self: Arc<Self>) {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let mut buf = self.pool.acquire();
            let n = match self.tun.read(&mut buf, TRANSPORT_HEADER_SZ) {
                Ok(n) => n,
                Err(e) => {
                    if self.is_closed() {
                        return;
                    }
                    debug!(error = %e, "tun read failed");
                    continue;
                }
            };
            let Some(dst) = iphdr::dst_addr(&buf[TRANSPORT_HEADER_SZ..TRANSPORT_HEADER_SZ + n]) else {
                continue;
            };
            let Some(id) = self.allowed_ips.read().lookup(dst) else {
                trace!(%dst, "no peer owns this destination, dropping");
                continue;
            };
            let Some(peer) = self.peers.read().get(&id).cloned() else { continue };

            let padded = pad_len(n, self.config.mtu);
            buf[TRANSPORT_HEADER_SZ + n..TRANSPORT_HEADER_SZ + padded].fill(0);

            let current = peer.keypairs.lock().current.clone();
            match current {
                Some(keypair) if !keypair.is_expired() => {
                    self.seal_and_send(&peer, &keypair, buf, padded);
                }
                _ => {
                    let mut raw = vec![0u8; n];
                    raw.copy_from_slice(&buf[TRANSPORT_HEADER_SZ..TRANSPORT_HEADER_SZ + n]);
                    drop(buf);
                    if !peer.try_stage(raw) {
                        trace!("staging queue full, dropping outbound packet");
                    }
                    self.maybe_initiate_handshake(&peer, id);
                }
            }
        }
    }

    fn seal_and_send(&self, peer: &Arc<Peer>, keypair: &Arc<Keypair>, buf: crate::pool::PooledBuffer, payload_len: usize) {
        let nonce = keypair.next_nonce();
        let element = PacketElement {
            buf,
            payload_len,
            nonce,
            receiver_index: keypair.remote_index,
            endpoint: peer.endpoint(),
            dropped: false,
            keypair: keypair.clone(),
        };
        let (ticket, completer) = pipeline::ticket(element, Direction::Encrypt);
        if peer.push_outbound_ticket(ticket).is_err() {
            return;
        }
        if let Some(tx) = self.encrypt_tx.lock().as_ref() {
            let _ = tx.send(completer);
        }
    }

    /// Drains a peer's staging queue once it has a usable keypair (the
    /// "nonce assigner" of spec.md §4.4, invoked inline rather than as a
    /// standing per-peer thread: it only has work to do right after a
    /// handshake completes or a packet is freshly staged).
    fn drain_staged(&self, peer: &Arc<Peer>) {
        let Some(keypair) = peer.keypairs.lock().current.clone() else { return };
        if keypair.is_expired() {
            return;
        }
        for payload in peer.drain_staged() {
            let mut buf = self.pool.acquire();
            let padded = pad_len(payload.len(), self.config.mtu);
            buf[TRANSPORT_HEADER_SZ..TRANSPORT_HEADER_SZ + payload.len()].copy_from_slice(&payload);
            buf[TRANSPORT_HEADER_SZ + payload.len()..TRANSPORT_HEADER_SZ + padded].fill(0);
            self.seal_and_send(peer, &keypair, buf, padded);
        }
    }

    /// Per-peer sequential sender: drains the ordered outbound queue in
    /// submission order and hands sealed datagrams to the bind.
    fn peer_sender_loop(self: Arc<Self>, peer: Arc<Peer>, id: PeerId) {
        loop {
            let ticket = match peer.outbound_tickets().recv_timeout(PEER_LOOP_POLL) {
                Ok(ticket) => ticket,
                Err(RecvTimeoutError::Timeout) => {
                    if peer.timers.is_stopped() {
                        return;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            };
            let element = ticket.wait();
            if element.dropped {
                continue;
            }
            let Some(endpoint) = element.endpoint else {
                debug!("dropping outbound packet with no known endpoint");
                continue;
            };
            let datagram = &element.buf[..element.total_len()];
            match self.bind.send(datagram, &endpoint) {
                Ok(()) => {
                    peer.stats.tx_bytes.fetch_add(datagram.len() as u64, Ordering::Relaxed);
                    peer.timers.send_keepalive.cancel();
                    self.arm_new_handshake_timer(&peer, id);
                }
                Err(e) => {
                    debug!(error = %e, "bind send failed, clearing cached source");
                    peer.clear_endpoint_source();
                }
            }
        }
    }

    /// Armed whenever authenticated data is sent; fires if nothing
    /// authenticated comes back within `KEEPALIVE_TIMEOUT + REKEY_TIMEOUT`,
    /// triggering a fresh initiation (spec.md §4.3 "NewHandshake").
    fn arm_new_handshake_timer(self: &Arc<Self>, peer: &Arc<Peer>, id: PeerId) {
        let device = self.clone();
        let p = peer.clone();
        peer.timers.new_handshake.arm(KEEPALIVE_TIMEOUT + REKEY_TIMEOUT, move || {
            device.maybe_initiate_handshake(&p, id);
        });
    }

    /// Armed on receipt of authenticated data; fires an empty transport
    /// packet if nothing has been sent back within `KEEPALIVE_TIMEOUT`
    /// (spec.md §4.3 "SendKeepalive").
    fn arm_send_keepalive_timer(self: &Arc<Self>, peer: &Arc<Peer>) {
        let device = self.clone();
        let p = peer.clone();
        peer.timers.send_keepalive.arm(KEEPALIVE_TIMEOUT, move || {
            device.send_keepalive(&p);
        });
    }

    fn send_keepalive(&self, peer: &Arc<Peer>) {
        let Some(keypair) = peer.keypairs.lock().current.clone() else { return };
        if keypair.is_expired() {
            return;
        }
        let mut buf = self.pool.acquire();
        let padded = pad_len(0, self.config.mtu);
        buf[TRANSPORT_HEADER_SZ..TRANSPORT_HEADER_SZ + padded].fill(0);
        self.seal_and_send(peer, &keypair, buf, padded);
    }

    // ---- handshake initiation ---- //

    fn maybe_initiate_handshake(self: &Arc<Self>, peer: &Arc<Peer>, id: PeerId) {
        let identity = self.identity.read();
        let Some(private) = identity.private.as_ref() else { return };

        let attempts = peer.timers.handshake_attempts();
        if attempts >= MAX_TIMER_HANDSHAKES {
            return;
        }
        let now = Instant::now();
        {
            let hs = peer.handshake.lock();
            if let Some(last) = hs.last_sent_handshake {
                if now.duration_since(last) < REKEY_TIMEOUT {
                    return;
                }
            }
        }

        let local_index = self.index_table.lock().insert(&mut OsRng, IndexEntry::Handshake(id));
        let cookie = peer.handshake.lock().valid_cookie(now);
        let cfg = peer.config.lock();
        let msg = peer.handshake.lock().begin_initiation(
            private,
            &cfg,
            local_index,
            Tai64N::now(),
            cookie.as_ref(),
        );
        drop(cfg);
        drop(identity);

        peer.handshake.lock().last_sent_handshake = Some(now);
        peer.timers.increment_handshake_attempts();
        peer.clear_endpoint_source();

        if let Some(endpoint) = peer.endpoint() {
            let _ = self.bind.send(msg.as_bytes(), &endpoint);
        }

        let device = self.clone();
        let peer_for_retry = peer.clone();
        peer.timers.retransmit_handshake.arm(REKEY_TIMEOUT + jitter(), move || {
            device.maybe_initiate_handshake(&peer_for_retry, id);
        });
    }

    // ---- inbound path (spec.md §4.4) ---- //

    fn udp_receiver_loop(self: Arc<Self>, v6: bool) {
        let mut raw = vec![0u8; TRANSPORT_HEADER_SZ + self.config.mtu + TAG_SZ + 64];
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return;
            }
            let recv = if v6 { self.bind.recv_v6(&mut raw) } else { self.bind.recv_v4(&mut raw) };
            let (n, endpoint) = match recv {
                Ok(v) => v,
                Err(e) => {
                    if self.is_closed() || !self.running.load(Ordering::SeqCst) {
                        return;
                    }
                    debug!(error = %e, "bind recv failed");
                    continue;
                }
            };
            if n < 4 {
                continue;
            }
            let msg_type = u32::from_le_bytes(raw[..4].try_into().unwrap());
            match msg_type {
                MSG_TRANSPORT => self.handle_transport(&raw[..n], endpoint),
                MSG_HANDSHAKE_INIT | MSG_HANDSHAKE_RESP | MSG_COOKIE_REPLY => {
                    self.dispatch_handshake_family(&raw[..n], endpoint);
                }
                _ => trace!(msg_type, "unrecognized datagram, dropping"),
            }
        }
    }

    fn dispatch_handshake_family(&self, raw: &[u8], endpoint: Endpoint) {
        let now = Instant::now();
        if self.is_under_load(now) {
            let Some(src) = endpoint.cached_source().or(Some(endpoint.addr().ip())) else { return };
            let _ = src;
            if !self.rate_limiter.lock().allow(endpoint.addr().ip(), now) {
                trace!("rate limiter rejected handshake datagram under load");
                return;
            }
        }
        self.handshake_queue_len.fetch_add(1, Ordering::Relaxed);
        let job = HandshakeJob { buf: raw.to_vec(), endpoint };
        if let Some(tx) = self.handshake_tx.lock().as_ref() {
            if tx.send(job).is_err() {
                self.handshake_queue_len.fetch_sub(1, Ordering::Relaxed);
            }
        } else {
            self.handshake_queue_len.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn handle_transport(&self, raw: &[u8], endpoint: Endpoint) {
        if raw.len() < TRANSPORT_HEADER_SZ + TAG_SZ {
            return;
        }
        let Some(header) = TransportHeader::read_from_prefix(raw) else { return };
        let receiver_index = header.receiver.get();

        let (peer, keypair) = {
            let table = self.index_table.lock();
            let Some(entry) = table.get(receiver_index) else { return };
            let id = entry.peer_id();
            drop(table);
            let Some(peer) = self.peers.read().get(&id).cloned() else { return };
            let Some(keypair) = peer.keypairs.lock().lookup(receiver_index) else { return };
            (peer, keypair)
        };
        if keypair.is_expired() {
            return;
        }

        let mut buf = self.pool.acquire();
        let payload_len = raw.len() - TRANSPORT_HEADER_SZ - TAG_SZ;
        buf[TRANSPORT_HEADER_SZ..TRANSPORT_HEADER_SZ + payload_len + TAG_SZ]
            .copy_from_slice(&raw[TRANSPORT_HEADER_SZ..]);

        peer.update_endpoint(endpoint);

        let element = PacketElement {
            buf,
            payload_len,
            nonce: header.counter.get(),
            receiver_index,
            endpoint: Some(endpoint),
            dropped: false,
            keypair,
        };
        let (ticket, completer) = pipeline::ticket(element, Direction::Decrypt);
        if peer.push_inbound_ticket(ticket).is_err() {
            return;
        }
        if let Some(tx) = self.decrypt_tx.lock().as_ref() {
            let _ = tx.send(completer);
        }
    }

    /// Per-peer sequential receiver: replay-checks, promotes the keypair
    /// triple on first use of `next`, re-validates the inner source
    /// address against allowed-IPs, and writes to TUN.
    fn peer_receiver_loop(self: Arc<Self>, peer: Arc<Peer>, id: PeerId) {
        loop {
            let ticket = match peer.inbound_tickets().recv_timeout(PEER_LOOP_POLL) {
                Ok(ticket) => ticket,
                Err(RecvTimeoutError::Timeout) => {
                    if peer.timers.is_stopped() {
                        return;
                    }
                    continue;
                }
                Err(RecvTimeoutError::Disconnected) => return,
            };
            let element = ticket.wait();
            if element.dropped {
                continue;
            }
            if !element.keypair.validate_counter(element.nonce) {
                trace!(nonce = element.nonce, "replayed or out-of-window counter, dropping");
                continue;
            }

            {
                let mut triple = peer.keypairs.lock();
                if triple.next.as_ref().is_some_and(|k| k.local_index == element.keypair.local_index) {
                    triple.promote_next();
                    drop(triple);
                    self.drain_staged(&peer);
                }
            }

            let payload = &element.buf[TRANSPORT_HEADER_SZ..TRANSPORT_HEADER_SZ + element.payload_len];
            peer.stats.rx_bytes.fetch_add(element.payload_len as u64, Ordering::Relaxed);
            peer.timers.new_handshake.cancel();
            self.arm_send_keepalive_timer(&peer);

            if payload.is_empty() {
                continue; // keepalive
            }
            let Some(src) = iphdr::src_addr(payload) else { continue };
            if self.allowed_ips.read().lookup(src) != Some(id) {
                debug!(%src, "inbound source not in this peer's allowed-ips, dropping");
                continue;
            }
            let real_len = ip_payload_len(payload).unwrap_or(payload.len());
            if self.tun.write(&payload[..real_len], 0).is_err() && self.is_closed() {
                return;
            }
        }
    }

    // ---- handshake worker (spec.md §4.4 step 4, single dedicated thread) ---- //

    fn handshake_worker_loop(self: Arc<Self>, rx: Receiver<HandshakeJob>) {
        while let Ok(job) = rx.recv() {
            self.handshake_queue_len.fetch_sub(1, Ordering::Relaxed);
            self.handle_handshake_datagram(job.buf, job.endpoint);
        }
    }

    fn handle_handshake_datagram(&self, mut buf: Vec<u8>, endpoint: Endpoint) {
        let now = Instant::now();
        let msg_type = u32::from_le_bytes(buf[..4].try_into().unwrap());
        match msg_type {
            MSG_HANDSHAKE_INIT if buf.len() == HANDSHAKE_INIT_SZ => {
                self.handle_initiation(&mut buf, endpoint, now);
            }
            MSG_HANDSHAKE_RESP if buf.len() == HANDSHAKE_RESP_SZ => {
                self.handle_response(&mut buf, endpoint, now);
            }
            MSG_COOKIE_REPLY if buf.len() == COOKIE_REPLY_SZ => {
                self.handle_cookie_reply(&buf, now);
            }
            _ => trace!(msg_type, len = buf.len(), "malformed handshake-family datagram"),
        }
    }

    fn handle_initiation(&self, buf: &mut [u8], endpoint: Endpoint, now: Instant) {
        let Some(init) = HandshakeInit::mut_from(buf) else { return };

        let identity = self.identity.read();
        let Some(private) = identity.private.as_ref() else { return };
        if init.verify_mac1(&private.mac1_key).is_err() {
            return;
        }

        if self.is_under_load(now) {
            let cookie = identity.cookie_state.new_cookie(endpoint.addr());
            if init.verify_mac2(&cookie).is_err() {
                drop(identity);
                self.reply_with_cookie(init.sender.get(), endpoint, &cookie);
                return;
            }
        }

        let consumed = match consume_initiation(init, private) {
            Ok(c) => c,
            Err(_) => return,
        };
        let id = PeerId::of(&consumed.static_key);
        drop(identity);

        let Some(peer) = self.peers.read().get(&id).cloned() else { return };
        let identity = self.identity.read();
        let _private = identity.private.as_ref().expect("checked above");
        let local_index = self.index_table.lock().insert(&mut OsRng, IndexEntry::Handshake(id));
        let cookie = peer.handshake.lock().valid_cookie(now);
        let cfg = peer.config.lock();

        let result = peer.handshake.lock().begin_response(consumed, init, &cfg, local_index, cookie.as_ref());
        drop(cfg);
        match result {
            Ok((resp, output)) => {
                drop(identity);
                peer.update_endpoint(endpoint);
                let _ = self.bind.send(resp.as_bytes(), &endpoint);
                self.complete_handshake(&peer, id, output);
            }
            Err(HandshakeError::StaleTimestamp) => {
                self.index_table.lock().remove(local_index);
                trace!("rejected initiation with stale TAI64N timestamp");
            }
            Err(_) => {
                self.index_table.lock().remove(local_index);
            }
        }
    }

    fn handle_response(&self, buf: &mut [u8], endpoint: Endpoint, now: Instant) {
        let Some(resp) = HandshakeResp::mut_from(buf) else { return };
        let receiver_index = resp.receiver.get();

        let id = {
            let table = self.index_table.lock();
            match table.get(receiver_index) {
                Some(IndexEntry::Handshake(id)) => *id,
                _ => return,
            }
        };
        let Some(peer) = self.peers.read().get(&id).cloned() else { return };

        let identity = self.identity.read();
        let Some(private) = identity.private.as_ref() else { return };
        if resp.verify_mac1(&private.mac1_key).is_err() {
            return;
        }
        if self.is_under_load(now) {
            let cookie = identity.cookie_state.new_cookie(endpoint.addr());
            if resp.verify_mac2(&cookie).is_err() {
                drop(identity);
                self.reply_with_cookie(resp.sender.get(), endpoint, &cookie);
                return;
            }
        }

        let cfg = peer.config.lock();
        let result = peer.handshake.lock().consume_response(resp, private, &cfg);
        drop(cfg);
        drop(identity);
        match result {
            Ok(output) => {
                peer.update_endpoint(endpoint);
                peer.timers.retransmit_handshake.cancel();
                self.complete_handshake(&peer, id, output);
            }
            Err(_) => trace!("failed to consume handshake response"),
        }
    }

    fn handle_cookie_reply(&self, buf: &[u8], now: Instant) {
        let Some(reply) = CookieReply::read_from(buf) else { return };
        let id = {
            let table = self.index_table.lock();
            match table.get(reply.receiver.get()) {
                Some(entry) => entry.peer_id(),
                None => return,
            }
        };
        let Some(peer) = self.peers.read().get(&id).cloned() else { return };
        let cfg = peer.config.lock();
        let aad = reply.receiver.as_bytes().to_vec();
        let mut cookie_field = reply.cookie;
        match decrypt_cookie(&mut cookie_field, &cfg.cookie_key, &reply.nonce, &aad) {
            Ok(cookie) => peer.handshake.lock().set_cookie(cookie, now),
            Err(_) => trace!("failed to decrypt cookie reply"),
        }
    }

    fn reply_with_cookie(&self, receiver_index: u32, endpoint: Endpoint, cookie: &wireveil_types::Cookie) {
        let identity = self.identity.read();
        let Some(private) = identity.private.as_ref() else { return };
        let mut nonce = [0u8; 24];
        OsRng.fill_bytes(&mut nonce);
        let aad = receiver_index.to_le_bytes();
        let encrypted = encrypt_cookie(*cookie, &private.cookie_key, &nonce, &aad);
        let reply = CookieReply {
            msg_type: zerocopy::little_endian::U32::new(MSG_COOKIE_REPLY),
            receiver: zerocopy::little_endian::U32::new(receiver_index),
            nonce,
            cookie: encrypted,
        };
        let _ = self.bind.send(reply.as_bytes(), &endpoint);
    }

    fn complete_handshake(&self, peer: &Arc<Peer>, id: PeerId, output: HandshakeOutput) {
        let initiator = output.initiator;
        let local_index = output.local_index;
        let kp = Keypair::from_handshake(output.hs, initiator, local_index, output.remote_index);

        if let Some(entry) = self.index_table.lock().get_mut(local_index) {
            *entry = IndexEntry::Keypair(id);
        }

        {
            let mut triple = peer.keypairs.lock();
            if initiator {
                triple.stage_next(kp);
            } else {
                triple.previous = triple.current.take();
                triple.current = Some(Arc::new(kp));
            }
        }

        peer.stats.record_handshake();
        peer.timers.reset_handshake_attempts();
        let p = peer.clone();
        peer.timers.zero_key_material.arm(REJECT_AFTER_TIME_X3, move || {
            p.keypairs.lock().wipe();
            p.handshake.lock().clear();
        });

        self.drain_staged(peer);
    }

    // ---- per-peer thread spawning ---- //

    fn spawn_peer_threads(self: &Arc<Self>, peer: &Arc<Peer>, id: PeerId) {
        let mut peer_threads = self.peer_threads.lock();
        if peer_threads.contains_key(&id) {
            return;
        }
        let mut handles = Vec::with_capacity(2);
        {
            let device = self.clone();
            let peer = peer.clone();
            handles.push(std::thread::spawn(move || device.peer_sender_loop(peer, id)));
        }
        {
            let device = self.clone();
            let peer = peer.clone();
            handles.push(std::thread::spawn(move || device.peer_receiver_loop(peer, id)));
        }
        peer_threads.insert(id, handles);

        if peer.persistent_keepalive_secs.load(Ordering::SeqCst) > 0 {
            let interval = Duration::from_secs(peer.persistent_keepalive_secs.load(Ordering::SeqCst) as u64);
            self.arm_persistent_keepalive(peer, interval);
        }
    }

    fn arm_persistent_keepalive(self: &Arc<Self>, peer: &Arc<Peer>, interval: Duration) {
        let device = self.clone();
        let p = peer.clone();
        peer.timers.persistent_keepalive.arm(interval, move || {
            device.send_keepalive(&p);
            device.arm_persistent_keepalive(&p, interval);
        });
    }

    // ---- UAPI support (used by `crate::uapi`) ---- //

    pub(crate) fn snapshot_identity(&self) -> (Option<StaticSecret>, u16, u32) {
        let identity = self.identity.read();
        (identity.private.as_ref().map(|p| p.private_key.clone()), self.listen_port(), self.fwmark())
    }

    pub(crate) fn for_each_peer<F: FnMut(&Peer, &[(IpAddr, u8)])>(&self, mut f: F) {
        let peers = self.peers.read();
        let allowed_ips = self.allowed_ips.read();
        for peer in peers.values() {
            let id = PeerId::of(&peer.public_key);
            let prefixes = allowed_ips.entries_for_peer(id);
            f(peer, &prefixes);
        }
    }
}

/// Zero-pads `len` bytes up to the next multiple of 16, capped at `mtu`
/// (spec.md §6 "Padding").
fn pad_len(len: usize, mtu: usize) -> usize {
    let padded = (len + 15) & !15;
    let padded = padded.max(16);
    padded.min(mtu.max(16))
}

/// Reads the IPv4 total-length or IPv6 payload-length field so trailing
/// zero padding can be stripped before writing to TUN.
fn ip_payload_len(packet: &[u8]) -> Option<usize> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 if packet.len() >= 4 => Some(u16::from_be_bytes([packet[2], packet[3]]) as usize),
        6 if packet.len() >= 6 => {
            Some(40 + u16::from_be_bytes([packet[4], packet[5]]) as usize)
        }
        _ => None,
    }
}
