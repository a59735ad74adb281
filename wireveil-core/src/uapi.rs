//! Line-oriented UAPI text protocol (spec.md §4.7 "UAPI" / §6 "UAPI
//! surface"): `get=1`/`set=1` requests over any `BufRead`/`Write` pair.
//! Wiring a concrete stream socket to this pair is left to the embedding
//! binary.

use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use wireveil_crypto::{Key, StaticSecret};

use crate::device::{Device, PeerConfig};
use crate::error::DeviceError;

/// Writes a `get=1` response: the device's full configuration snapshot
/// followed by `errno=0`.
pub fn handle_get<W: Write>(device: &Device, out: &mut W) -> io::Result<()> {
    let (private_key, listen_port, fwmark) = device.snapshot_identity();
    if let Some(sk) = private_key {
        writeln!(out, "private_key={}", hex::encode(sk.to_bytes()))?;
    }
    writeln!(out, "listen_port={listen_port}")?;
    writeln!(out, "fwmark={fwmark}")?;

    device.for_each_peer(|peer, allowed_ips| {
        let _ = writeln!(out, "public_key={}", hex::encode(peer.public_key.as_bytes()));
        let psk: [u8; 32] = peer.config.lock().preshared_key.into();
        if psk != [0u8; 32] {
            let _ = writeln!(out, "preshared_key={}", hex::encode(psk));
        }
        if let Some(endpoint) = peer.endpoint() {
            let _ = writeln!(out, "endpoint={}", endpoint.addr());
        }
        let last_handshake = peer
            .stats
            .last_handshake()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let _ = writeln!(out, "last_handshake_time_sec={last_handshake}");
        let _ = writeln!(out, "tx_bytes={}", peer.stats.tx_bytes.load(std::sync::atomic::Ordering::Relaxed));
        let _ = writeln!(out, "rx_bytes={}", peer.stats.rx_bytes.load(std::sync::atomic::Ordering::Relaxed));
        let _ = writeln!(
            out,
            "persistent_keepalive_interval={}",
            peer.persistent_keepalive_secs.load(std::sync::atomic::Ordering::Relaxed)
        );
        for (addr, len) in allowed_ips {
            let _ = writeln!(out, "allowed_ip={addr}/{len}");
        }
    });

    writeln!(out, "errno=0")?;
    writeln!(out)
}

/// Applies a `set=1` request read line-by-line from `input` until the
/// terminating empty line, writing `errno=<code>` to `out`.
pub fn handle_set<R: BufRead, W: Write>(device: &Arc<Device>, input: R, out: &mut W) -> io::Result<()> {
    let errno = match apply_set(device, input) {
        Ok(()) => 0,
        Err(e) => e.uapi_errno(),
    };
    writeln!(out, "errno={errno}")?;
    writeln!(out)
}

fn io_error(reason: &str) -> DeviceError {
    DeviceError::ConfigurationError { key: "<io>".into(), reason: reason.into() }
}

fn invalid(key: &str, reason: &str) -> DeviceError {
    DeviceError::ConfigurationError { key: key.into(), reason: reason.into() }
}

fn parse_hex32(value: &str, key: &str) -> Result<[u8; 32], DeviceError> {
    let mut out = [0u8; 32];
    hex::decode_to_slice(value, &mut out).map_err(|_| invalid(key, "expected 64 hex characters"))?;
    Ok(out)
}

fn parse_bool(value: &str, key: &str) -> Result<bool, DeviceError> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(key, "expected true or false")),
    }
}

fn parse_num<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, DeviceError> {
    value.parse().map_err(|_| invalid(key, "expected an integer"))
}

fn flush_peer(device: &Arc<Device>, pending: Option<PeerConfig>) -> Result<(), DeviceError> {
    if let Some(cfg) = pending {
        device.apply_peer_config(cfg)?;
    }
    Ok(())
}

fn apply_set<R: BufRead>(device: &Arc<Device>, input: R) -> Result<(), DeviceError> {
    let mut pending_peer: Option<PeerConfig> = None;

    for line in input.lines() {
        let line = line.map_err(|_| io_error("failed to read request"))?;
        if line.is_empty() {
            break;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| invalid(&line, "expected key=value"))?;

        match key {
            "private_key" => {
                flush_peer(device, pending_peer.take())?;
                device.set_private_key(StaticSecret::from(parse_hex32(value, key)?));
            }
            "listen_port" => {
                flush_peer(device, pending_peer.take())?;
                let port: u16 = parse_num(value, key)?;
                if port == 0 {
                    return Err(invalid(key, "must be in 1..=65535"));
                }
                device.set_listen_port(port);
            }
            "fwmark" => {
                flush_peer(device, pending_peer.take())?;
                device.set_fwmark(parse_num(value, key)?);
            }
            "replace_peers" => {
                flush_peer(device, pending_peer.take())?;
                if parse_bool(value, key)? {
                    device.remove_all_peers();
                }
            }
            "public_key" => {
                flush_peer(device, pending_peer.take())?;
                let bytes = parse_hex32(value, key)?;
                pending_peer = Some(PeerConfig { public_key: Some(bytes.into()), ..Default::default() });
            }
            "preshared_key" => {
                let cfg = pending_peer.as_mut().ok_or_else(|| invalid(key, "requires a preceding public_key"))?;
                cfg.preshared_key = Some(Key::from(parse_hex32(value, key)?));
            }
            "endpoint" => {
                let cfg = pending_peer.as_mut().ok_or_else(|| invalid(key, "requires a preceding public_key"))?;
                cfg.endpoint = Some(value.parse().map_err(|_| invalid(key, "expected host:port"))?);
            }
            "persistent_keepalive_interval" => {
                let cfg = pending_peer.as_mut().ok_or_else(|| invalid(key, "requires a preceding public_key"))?;
                cfg.persistent_keepalive = Some(parse_num(value, key)?);
            }
            "replace_allowed_ips" => {
                let cfg = pending_peer.as_mut().ok_or_else(|| invalid(key, "requires a preceding public_key"))?;
                cfg.replace_allowed_ips = parse_bool(value, key)?;
            }
            "allowed_ip" => {
                let cfg = pending_peer.as_mut().ok_or_else(|| invalid(key, "requires a preceding public_key"))?;
                let (addr, len) = value.split_once('/').ok_or_else(|| invalid(key, "expected prefix/len"))?;
                let addr: std::net::IpAddr = addr.parse().map_err(|_| invalid(key, "invalid address"))?;
                let len: u8 = len.parse().map_err(|_| invalid(key, "invalid prefix length"))?;
                let max_len = match addr {
                    std::net::IpAddr::V4(_) => 32,
                    std::net::IpAddr::V6(_) => 128,
                };
                if len > max_len {
                    return Err(invalid(key, "prefix length exceeds address width"));
                }
                cfg.allowed_ips.push((addr, len));
            }
            "remove" => {
                let cfg = pending_peer.as_mut().ok_or_else(|| invalid(key, "requires a preceding public_key"))?;
                cfg.remove = parse_bool(value, key)?;
            }
            "update_only" => {
                let cfg = pending_peer.as_mut().ok_or_else(|| invalid(key, "requires a preceding public_key"))?;
                cfg.update_only = parse_bool(value, key)?;
            }
            "protocol_version" => {
                if pending_peer.is_none() {
                    return Err(invalid(key, "requires a preceding public_key"));
                }
                if value != "1" {
                    return Err(invalid(key, "only protocol version 1 is supported"));
                }
            }
            other => return Err(invalid(other, "unrecognized key")),
        }
    }

    flush_peer(device, pending_peer.take())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::Arc;

    use crate::bind::Bind;
    use crate::device::DeviceConfig;
    use crate::endpoint::Endpoint;
    use crate::tun::{Tun, TunEvent};

    #[derive(Default)]
    struct NullBind;

    impl Bind for NullBind {
        fn open(&self, port: u16) -> std::io::Result<u16> {
            Ok(port)
        }
        fn recv_v4(&self, _buf: &mut [u8]) -> std::io::Result<(usize, Endpoint)> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "unused in these tests"))
        }
        fn recv_v6(&self, _buf: &mut [u8]) -> std::io::Result<(usize, Endpoint)> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "unused in these tests"))
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
    struct NullTun;

    impl Tun for NullTun {
        fn read(&self, _buf: &mut [u8], _offset: usize) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "unused in these tests"))
        }
        fn write(&self, _buf: &[u8], _offset: usize) -> std::io::Result<usize> {
            Ok(0)
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
        Device::new(Arc::new(NullBind::default()), Arc::new(NullTun::default()), DeviceConfig::default())
    }

    #[test]
    fn set_private_key_then_get_round_trips() {
        let device = device();
        let sk = StaticSecret::from([7u8; 32]);
        let request = format!("private_key={}\n\n", hex::encode(sk.to_bytes()));

        let mut out = Vec::new();
        handle_set(&device, Cursor::new(request), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "errno=0\n\n");

        let mut out = Vec::new();
        handle_get(&device, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains(&format!("private_key={}\n", hex::encode(sk.to_bytes()))));
        assert!(text.ends_with("errno=0\n\n"));
    }

    #[test]
    fn add_peer_with_allowed_ip() {
        let device = device();
        let request = format!(
            "public_key={}\nallowed_ip=10.0.0.2/32\npersistent_keepalive_interval=25\n\n",
            hex::encode([9u8; 32])
        );

        let mut out = Vec::new();
        handle_set(&device, Cursor::new(request), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "errno=0\n\n");

        let mut out = Vec::new();
        handle_get(&device, &mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("allowed_ip=10.0.0.2/32"));
        assert!(text.contains("persistent_keepalive_interval=25"));
    }

    #[test]
    fn unknown_key_is_rejected() {
        let device = device();
        let mut out = Vec::new();
        handle_set(&device, Cursor::new("not_a_real_key=1\n\n"), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "errno=3\n\n");
    }

    #[test]
    fn peer_key_without_scope_is_rejected() {
        let device = device();
        let mut out = Vec::new();
        handle_set(&device, Cursor::new("remove=true\n\n"), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "errno=3\n\n");
    }

    #[test]
    fn oversized_prefix_length_is_rejected() {
        let device = device();
        let request = format!("public_key={}\nallowed_ip=10.0.0.0/200\n\n", hex::encode([3u8; 32]));
        let mut out = Vec::new();
        handle_set(&device, Cursor::new(request), &mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "errno=3\n\n");
    }
}
