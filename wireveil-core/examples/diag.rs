use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use wireveil_core::bind::Bind;
use wireveil_core::device::{Device, DeviceConfig, PeerConfig};
use wireveil_core::endpoint::Endpoint;
use wireveil_core::tun::{Tun, TunEvent};
use wireveil_crypto::{PublicKey, StaticSecret};

#[derive(Default)]
struct IdleBind;
impl Bind for IdleBind {
    fn open(&self, port: u16) -> std::io::Result<u16> { Ok(port) }
    fn recv_v4(&self, _buf: &mut [u8]) -> std::io::Result<(usize, Endpoint)> {
        std::thread::sleep(Duration::from_millis(30));
        Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "no traffic"))
    }
    fn recv_v6(&self, _buf: &mut [u8]) -> std::io::Result<(usize, Endpoint)> {
        std::thread::sleep(Duration::from_millis(30));
        Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "no traffic"))
    }
    fn send(&self, _buf: &[u8], _endpoint: &Endpoint) -> std::io::Result<()> { Ok(()) }
    fn set_mark(&self, _mark: u32) -> std::io::Result<()> { Ok(()) }
    fn close(&self) {}
}
#[derive(Default)]
struct IdleTun;
impl Tun for IdleTun {
    fn read(&self, _buf: &mut [u8], _offset: usize) -> std::io::Result<usize> {
        std::thread::sleep(Duration::from_millis(30));
        Err(std::io::Error::new(std::io::ErrorKind::WouldBlock, "no packets"))
    }
    fn write(&self, buf: &[u8], offset: usize) -> std::io::Result<usize> { Ok(buf.len() - offset) }
    fn mtu(&self) -> usize { 1420 }
    fn poll_events(&self) -> Vec<TunEvent> { Vec::new() }
    fn close(&self) {}
}

fn main() {
    let device = Device::new(Arc::new(IdleBind::default()), Arc::new(IdleTun::default()), DeviceConfig::default());
    device.set_private_key(StaticSecret::from([1u8; 32]));
    let peer_sk = StaticSecret::from([2u8; 32]);
    let peer_pk = PublicKey::from(&peer_sk);
    device.apply_peer_config(PeerConfig {
        public_key: Some(peer_pk),
        allowed_ips: vec![("10.0.0.2".parse().unwrap(), 32)],
        ..Default::default()
    }).unwrap();
    device.up().unwrap();
    eprintln!("up done");

    let d = device.clone();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        d.down();
        let _ = tx.send(());
    });
    match rx.recv_timeout(Duration::from_secs(5)) {
        Ok(_) => eprintln!("down done"),
        Err(_) => eprintln!("TIMED OUT - deadlock"),
    }
}
