//! Thin wiring layer: a real `std::net::UdpSocket` `Bind`, a stand-in
//! `Tun` and a Unix-socket UAPI front end bolted onto `wireveil-core`.
//!
//! TUN device creation and OS socket-option plumbing (`SO_MARK` and
//! friends) stay out of scope here; this binary exists to demonstrate
//! wiring the crate together, not to be a production launcher.

use std::io::{BufReader, Write};
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use wireveil_core::bind::Bind;
use wireveil_core::device::{Device, DeviceConfig, PeerConfig};
use wireveil_core::endpoint::Endpoint;
use wireveil_core::tun::{Tun, TunEvent};
use wireveil_core::uapi;
use wireveil_crypto::{PublicKey, StaticSecret};

#[derive(Parser)]
#[command(name = "wireveil", about = "Userspace tunnel daemon wiring demo")]
struct Args {
    /// UDP port to listen on.
    #[arg(long, default_value_t = 51820)]
    listen_port: u16,

    /// Hex-encoded Curve25519 private key.
    #[arg(long)]
    private_key: Option<String>,

    /// Hex-encoded peer public key; may be repeated alongside matching
    /// --peer-allowed-ip / --peer-endpoint flags.
    #[arg(long = "peer")]
    peers: Vec<String>,

    /// UAPI control socket path.
    #[arg(long, default_value = "/var/run/wireveil/wireveil0.sock")]
    uapi_socket: PathBuf,
}

/// `std::net::UdpSocket`-backed `Bind`. Recv calls use a short read
/// timeout so `close()` can unblock threads parked in them; there is no
/// portable way to interrupt a blocking socket read from another thread.
struct StdBind {
    v4: parking_lot::RwLock<Option<UdpSocket>>,
    v6: parking_lot::RwLock<Option<UdpSocket>>,
    closed: AtomicBool,
}

impl StdBind {
    fn new() -> Self {
        Self { v4: parking_lot::RwLock::new(None), v6: parking_lot::RwLock::new(None), closed: AtomicBool::new(false) }
    }
}

impl Bind for StdBind {
    fn open(&self, port: u16) -> std::io::Result<u16> {
        self.closed.store(false, Ordering::Relaxed);
        let v4 = UdpSocket::bind(("0.0.0.0", port))?;
        v4.set_read_timeout(Some(Duration::from_millis(500)))?;
        let bound_port = v4.local_addr()?.port();
        let v6 = UdpSocket::bind(("::", bound_port))?;
        v6.set_read_timeout(Some(Duration::from_millis(500)))?;
        *self.v4.write() = Some(v4);
        *self.v6.write() = Some(v6);
        Ok(bound_port)
    }

    fn recv_v4(&self, buf: &mut [u8]) -> std::io::Result<(usize, Endpoint)> {
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "bind closed"));
            }
            let guard = self.v4.read();
            let sock = guard.as_ref().ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "not bound"))?;
            match sock.recv_from(buf) {
                Ok((len, addr)) => return Ok((len, Endpoint::new(addr))),
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn recv_v6(&self, buf: &mut [u8]) -> std::io::Result<(usize, Endpoint)> {
        loop {
            if self.closed.load(Ordering::Relaxed) {
                return Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "bind closed"));
            }
            let guard = self.v6.read();
            let sock = guard.as_ref().ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "not bound"))?;
            match sock.recv_from(buf) {
                Ok((len, addr)) => return Ok((len, Endpoint::new(addr))),
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn send(&self, buf: &[u8], endpoint: &Endpoint) -> std::io::Result<()> {
        let dst: SocketAddr = endpoint.addr();
        let guard = if dst.is_ipv6() { self.v6.read() } else { self.v4.read() };
        let sock = guard.as_ref().ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "not bound"))?;
        sock.send_to(buf, dst).map(|_| ())
    }

    fn set_mark(&self, _mark: u32) -> std::io::Result<()> {
        // Firewall-mark plumbing is platform-specific socket-option code
        // and stays out of scope; wiring it up is left to a deployment
        // that needs it.
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.v4.write().take();
        self.v6.write().take();
    }
}

/// Stand-in `Tun`: demonstrates the wiring without creating a real
/// virtual interface. Reads never yield a packet; writes are discarded.
struct NullTun {
    mtu: usize,
}

impl Tun for NullTun {
    fn read(&self, _buf: &mut [u8], _offset: usize) -> std::io::Result<usize> {
        std::thread::sleep(Duration::from_millis(500));
        Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "no tun device wired up"))
    }

    fn write(&self, buf: &[u8], offset: usize) -> std::io::Result<usize> {
        Ok(buf.len() - offset)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn poll_events(&self) -> Vec<TunEvent> {
        Vec::new()
    }

    fn close(&self) {}
}

fn parse_hex32(s: &str) -> anyhow::Result<[u8; 32]> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(s, &mut out)?;
    Ok(out)
}

fn serve_uapi(device: Arc<Device>, socket_path: PathBuf) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(&socket_path);
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(&socket_path)?;
    tracing::info!(path = %socket_path.display(), "uapi listening");

    for stream in listener.incoming() {
        let stream = stream?;
        let device = device.clone();
        std::thread::spawn(move || {
            if let Err(e) = handle_uapi_conn(&device, stream) {
                tracing::warn!(error = %e, "uapi connection failed");
            }
        });
    }
    Ok(())
}

fn handle_uapi_conn(device: &Arc<Device>, mut stream: UnixStream) -> std::io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut first_line = String::new();
    std::io::BufRead::read_line(&mut reader, &mut first_line)?;
    match first_line.trim_end() {
        "get=1" => uapi::handle_get(device, &mut stream),
        "set=1" => uapi::handle_set(device, &mut reader, &mut stream),
        _ => {
            writeln!(stream, "errno=2")?;
            writeln!(stream)
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let bind = Arc::new(StdBind::new());
    let tun = Arc::new(NullTun { mtu: 1420 });
    let device = Device::new(bind, tun, DeviceConfig::default());

    if let Some(key) = &args.private_key {
        device.set_private_key(StaticSecret::from(parse_hex32(key)?));
    }
    device.set_listen_port(args.listen_port);

    for peer in &args.peers {
        let public_key = PublicKey::from(parse_hex32(peer)?);
        device.apply_peer_config(PeerConfig { public_key: Some(public_key), ..Default::default() })?;
    }

    device.up()?;
    tracing::info!(port = device.listen_port(), "device up");

    let shutdown = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, shutdown.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, shutdown.clone())?;

    let uapi_device = device.clone();
    let uapi_socket = args.uapi_socket.clone();
    std::thread::spawn(move || {
        if let Err(e) = serve_uapi(uapi_device, uapi_socket) {
            tracing::error!(error = %e, "uapi server exited");
        }
    });

    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
    }

    tracing::info!("shutting down");
    device.close();
    Ok(())
}
