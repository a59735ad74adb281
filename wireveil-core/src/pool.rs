//! Device-owned packet buffer pool (spec.md §9: "Re-architect as
//! device-owned pool objects with explicit lifetime, so that closing a
//! device releases its buffers deterministically" — replacing a
//! process-wide global pool). Exhaustion falls back to a fresh allocation
//! rather than blocking or erroring. `BufferPool` is `Arc`-backed so
//! pipeline workers on other threads can hold buffers without borrowing
//! from the device.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

struct Inner {
    free: Mutex<Vec<Box<[u8]>>>,
    buf_size: usize,
}

#[derive(Clone)]
pub struct BufferPool(Arc<Inner>);

impl BufferPool {
    pub fn new(buf_size: usize, capacity: usize) -> Self {
        let free = (0..capacity).map(|_| vec![0u8; buf_size].into_boxed_slice()).collect();
        Self(Arc::new(Inner { free: Mutex::new(free), buf_size }))
    }

    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .0
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.0.buf_size].into_boxed_slice());
        PooledBuffer { buf: Some(buf), pool: self.0.clone() }
    }

    pub fn available(&self) -> usize {
        self.0.free.lock().len()
    }
}

/// A buffer borrowed from a [`BufferPool`]; returned to the pool on drop.
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: Arc<Inner>,
}

impl Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer taken only on drop")
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer taken only on drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.free.lock().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_returned_buffers() {
        let pool = BufferPool::new(64, 2);
        assert_eq!(pool.available(), 2);
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn exhaustion_falls_back_to_fresh_allocation() {
        let pool = BufferPool::new(64, 0);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 64);
    }
}
