//! The parallel encrypt/decrypt pipeline (spec.md §4.4).
//!
//! Ordering is preserved without the "hand an element to a worker, block
//! on its mutex" pattern spec.md §9 flags as unusual: a [`Ticket`] is
//! pushed onto the peer's ordered queue *before* the matching
//! [`Completer`] is pushed onto the shared work queue, and the sequential
//! consumer blocks on the ticket's one-shot completion channel rather
//! than on a per-element mutex directly.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

use crate::endpoint::Endpoint;
use crate::keypair::Keypair;
use crate::pool::PooledBuffer;
use wireveil_types::{Tag, TransportHeader, TRANSPORT_HEADER_SZ};

/// One packet moving through the pipeline.
pub struct PacketElement {
    pub buf: PooledBuffer,
    /// Length of the plaintext (outbound, pre-seal) or ciphertext
    /// (inbound, pre-open) payload, not counting the header or tag.
    pub payload_len: usize,
    pub nonce: u64,
    pub receiver_index: u32,
    pub endpoint: Option<Endpoint>,
    pub dropped: bool,
    /// Kept alongside the buffer so the per-peer sequential consumer can
    /// run the replay check and triple promotion after `wait()` without a
    /// side channel back to the worker.
    pub keypair: Arc<Keypair>,
}

impl PacketElement {
    /// The byte range `[TRANSPORT_HEADER_SZ, TRANSPORT_HEADER_SZ + payload_len)`.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[TRANSPORT_HEADER_SZ..TRANSPORT_HEADER_SZ + self.payload_len]
    }

    pub fn total_len(&self) -> usize {
        TRANSPORT_HEADER_SZ + self.payload_len + 16
    }
}

/// The caller-visible half of a pipeline work item: pushed to the peer's
/// ordered queue, later blocks for the worker's result.
pub struct Ticket {
    slot: Arc<Mutex<PacketElement>>,
    done: Receiver<()>,
}

/// The worker-visible half: pushed to the shared work queue.
pub struct Completer {
    slot: Arc<Mutex<PacketElement>>,
    done: Sender<()>,
    pub keypair: Arc<Keypair>,
    pub direction: Direction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Encrypt,
    Decrypt,
}

/// Splits a [`PacketElement`] into its ordered-queue half and its
/// worker-queue half.
pub fn ticket(element: PacketElement, direction: Direction) -> (Ticket, Completer) {
    let keypair = element.keypair.clone();
    let slot = Arc::new(Mutex::new(element));
    let (tx, rx) = bounded(1);
    (Ticket { slot: slot.clone(), done: rx }, Completer { slot, done: tx, keypair, direction })
}

impl Ticket {
    /// Blocks until the assigned worker finishes, then returns the
    /// element (dropped or not).
    pub fn wait(self) -> PacketElement {
        let _ = self.done.recv();
        Arc::try_unwrap(self.slot)
            .unwrap_or_else(|_| unreachable!("worker releases its Arc before signalling done"))
            .into_inner()
    }
}

impl Completer {
    /// Performs the AEAD operation in place and signals completion.
    ///
    /// The `slot` Arc must be dropped *before* `done` is signalled: once
    /// `done.send` returns, `Ticket::wait` is free to observe completion
    /// and call `Arc::try_unwrap` on its own clone, which only succeeds
    /// if this was the last other reference.
    pub fn run(self) {
        let Completer { slot, done, keypair, direction } = self;
        {
            let mut element = slot.lock();
            match direction {
                Direction::Encrypt => {
                    let header = TransportHeader::new(element.receiver_index, element.nonce);
                    let header_bytes = zerocopy::AsBytes::as_bytes(&header);
                    element.buf[..TRANSPORT_HEADER_SZ].copy_from_slice(header_bytes);
                    let nonce = element.nonce;
                    let payload_len = element.payload_len;
                    let tag = keypair.seal(nonce, &[], element.payload_mut());
                    let tag_start = TRANSPORT_HEADER_SZ + payload_len;
                    element.buf[tag_start..tag_start + 16].copy_from_slice(&tag.0);
                }
                Direction::Decrypt => {
                    let nonce = element.nonce;
                    let payload_len = element.payload_len;
                    let tag_start = TRANSPORT_HEADER_SZ + payload_len;
                    let mut tag_bytes = [0u8; 16];
                    tag_bytes.copy_from_slice(&element.buf[tag_start..tag_start + 16]);
                    let tag = Tag(tag_bytes);
                    if keypair.open(nonce, &[], element.payload_mut(), &tag).is_err() {
                        element.dropped = true;
                    }
                }
            }
        }
        drop(slot);
        let _ = done.send(());
    }
}

/// Spawns `count` worker threads draining `work_rx` until the channel
/// closes.
pub fn spawn_workers(count: usize, work_rx: Receiver<Completer>) -> Vec<std::thread::JoinHandle<()>> {
    (0..count)
        .map(|_| {
            let rx = work_rx.clone();
            std::thread::spawn(move || {
                while let Ok(completer) = rx.recv() {
                    completer.run();
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use wireveil_crypto::HandshakeState;

    // independent handshake states won't agree on keys; this pair is only
    // used to exercise ordering, not to round-trip ciphertext.
    fn keypair_pair() -> (Arc<Keypair>, Arc<Keypair>) {
        let a = Arc::new(Keypair::from_handshake(HandshakeState::default(), true, 1, 2));
        let b = Arc::new(Keypair::from_handshake(HandshakeState::default(), false, 2, 1));
        (a, b)
    }

    #[test]
    fn ordered_completion_preserves_submission_order() {
        let pool = BufferPool::new(64, 4);
        let (work_tx, work_rx) = bounded::<Completer>(8);
        let _workers = spawn_workers(2, work_rx);
        let (kp, _) = keypair_pair();

        let mut tickets = Vec::new();
        for i in 0..5u64 {
            let mut buf = pool.acquire();
            buf[TRANSPORT_HEADER_SZ..TRANSPORT_HEADER_SZ + 8].copy_from_slice(&i.to_le_bytes());
            let element = PacketElement {
                buf,
                payload_len: 8,
                nonce: i,
                receiver_index: 9,
                endpoint: None,
                dropped: false,
                keypair: kp.clone(),
            };
            let (t, c) = ticket(element, Direction::Encrypt);
            work_tx.send(c).unwrap();
            tickets.push(t);
        }

        for (i, t) in tickets.into_iter().enumerate() {
            let element = t.wait();
            assert!(!element.dropped);
            assert_eq!(element.nonce, i as u64);
        }
    }
}
