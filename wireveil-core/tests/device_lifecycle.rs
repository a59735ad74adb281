//! Integration tests exercising `Device`'s multi-thread lifecycle —
//! scenarios that span peer threads, timers and the ordered pipeline
//! together, which a single colocated `#[cfg(test)] mod tests` can't
//! reach without exposing crate internals.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use wireveil_core::bind::Bind;
use wireveil_core::device::{Device, DeviceConfig, PeerConfig};
use wireveil_core::endpoint::Endpoint;
use wireveil_core::tun::{Tun, TunEvent};
use wireveil_crypto::{PublicKey, StaticSecret};

/// A `Bind` that never delivers traffic, so peer threads spend their time
/// idling rather than processing packets; every `recv_*` wakes
/// periodically rather than blocking forever, matching how a real socket
/// with a read timeout behaves.
#[derive(Default)]
struct IdleBind;

impl Bind for IdleBind {
    fn open(&self, port: u16) -> std::io::Result<u16> {
        Ok(port)
    }
    fn recv_v4(&self, _buf: &mut [u8]) -> std::io::Result<(usize, Endpoint)> {
        std::thread::sleep(Duration::from_millis(30));
        Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "no traffic"))
    }
    fn recv_v6(&self, _buf: &mut [u8]) -> std::io::Result<(usize, Endpoint)> {
        std::thread::sleep(Duration::from_millis(30));
        Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "no traffic"))
    }
    fn send(&self, _buf: &[u8], _endpoint: &Endpoint) -> std::io::Result<()> {
        Ok(())
    }
    fn set_mark(&self, _mark: u32) -> std::io::Result<()> {
        Ok(())
    }
    fn close(&self) {}
}

#[derive(Default)]
struct IdleTun;

impl Tun for IdleTun {
    fn read(&self, _buf: &mut [u8], _offset: usize) -> std::io::Result<usize> {
        std::thread::sleep(Duration::from_millis(30));
        Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "no packets"))
    }
    fn write(&self, buf: &[u8], offset: usize) -> std::io::Result<usize> {
        Ok(buf.len() - offset)
    }
    fn mtu(&self) -> usize {
        1420
    }
    fn poll_events(&self) -> Vec<TunEvent> {
        Vec::new()
    }
    fn close(&self) {}
}

fn device() -> Arc<Device> {
    let device = Device::new(Arc::new(IdleBind::default()), Arc::new(IdleTun::default()), DeviceConfig::default());
    device.set_private_key(StaticSecret::from([1u8; 32]));
    device
}

fn peer_config(seed: u8, allowed_ip: &str) -> PeerConfig {
    let peer_sk = StaticSecret::from([seed; 32]);
    let peer_pk = PublicKey::from(&peer_sk);
    let (addr, len) = allowed_ip.split_once('/').unwrap();
    PeerConfig {
        public_key: Some(peer_pk),
        allowed_ips: vec![(addr.parse().unwrap(), len.parse().unwrap())],
        ..Default::default()
    }
}

/// Runs `f` on a background thread and fails the test if it doesn't
/// finish within `timeout` — the shape of failure a deadlocked
/// `Device::down()` produces.
fn assert_completes_within(timeout: Duration, f: impl FnOnce() + Send + 'static) {
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        f();
        let _ = tx.send(());
    });
    rx.recv_timeout(timeout).expect("operation did not complete in time (deadlock?)");
}

#[test]
fn up_then_down_does_not_hang_with_an_active_peer() {
    let device = device();
    device.apply_peer_config(peer_config(2, "10.0.0.2/32")).unwrap();
    device.up().unwrap();

    let d = device.clone();
    assert_completes_within(Duration::from_secs(5), move || d.down());
}

#[test]
fn up_then_down_does_not_hang_with_multiple_peers() {
    let device = device();
    device.apply_peer_config(peer_config(2, "10.0.0.2/32")).unwrap();
    device.apply_peer_config(peer_config(3, "10.0.0.3/32")).unwrap();
    device.apply_peer_config(peer_config(4, "10.0.0.4/32")).unwrap();
    device.up().unwrap();

    let d = device.clone();
    assert_completes_within(Duration::from_secs(5), move || d.down());
}

#[test]
fn removing_a_peer_while_running_does_not_hang() {
    let device = device();
    let cfg = peer_config(2, "10.0.0.2/32");
    let peer_pk = cfg.public_key.unwrap();
    device.apply_peer_config(cfg).unwrap();
    device.up().unwrap();

    let d = device.clone();
    assert_completes_within(Duration::from_secs(5), move || {
        d.apply_peer_config(PeerConfig { public_key: Some(peer_pk), remove: true, ..Default::default() }).unwrap();
    });

    let d = device.clone();
    assert_completes_within(Duration::from_secs(5), move || d.down());
}

#[test]
fn close_is_idempotent_and_does_not_hang() {
    let device = device();
    device.apply_peer_config(peer_config(2, "10.0.0.2/32")).unwrap();
    device.up().unwrap();

    let d = device.clone();
    assert_completes_within(Duration::from_secs(5), move || {
        d.close();
        d.close();
    });
}
