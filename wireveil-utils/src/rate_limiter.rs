//! Per-source-IP token bucket, consulted when the device is under load.
//!
//! Grounded on the boringtun-derived rate limiter's global token counter
//! (single `AtomicU64` reset once a second), generalized to one bucket per
//! remote IP as spec.md §4.5 calls for, with idle-bucket garbage
//! collection instead of a single global reset.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use ahash::AHashMap;

struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

pub struct RateLimiter {
    refill_interval: Duration,
    burst: u32,
    buckets: AHashMap<IpAddr, Bucket>,
}

impl RateLimiter {
    pub fn new(refill_interval: Duration, burst: u32) -> Self {
        Self { refill_interval, burst, buckets: AHashMap::default() }
    }

    /// Admits or rejects a message from `addr` at time `now`.
    pub fn allow(&mut self, addr: IpAddr, now: Instant) -> bool {
        let burst = self.burst;
        let interval = self.refill_interval;
        let bucket = self
            .buckets
            .entry(addr)
            .or_insert_with(|| Bucket { tokens: burst, last_refill: now });

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        let refills = (elapsed.as_nanos() / interval.as_nanos().max(1)) as u32;
        if refills > 0 {
            bucket.tokens = bucket.tokens.saturating_add(refills).min(burst);
            bucket.last_refill = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Evicts buckets that have not been touched within `idle_after`.
    pub fn collect_garbage(&mut self, now: Instant, idle_after: Duration) {
        self.buckets.retain(|_, b| now.saturating_duration_since(b.last_refill) < idle_after);
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn addr(n: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, n))
    }

    #[test]
    fn allows_up_to_burst_then_rejects() {
        let mut rl = RateLimiter::new(Duration::from_millis(20), 10);
        let now = Instant::now();
        for _ in 0..10 {
            assert!(rl.allow(addr(1), now));
        }
        assert!(!rl.allow(addr(1), now));
    }

    #[test]
    fn refills_over_time() {
        let mut rl = RateLimiter::new(Duration::from_millis(20), 10);
        let now = Instant::now();
        for _ in 0..10 {
            assert!(rl.allow(addr(1), now));
        }
        let later = now + Duration::from_millis(20);
        assert!(rl.allow(addr(1), later));
    }

    #[test]
    fn buckets_are_independent_per_source() {
        let mut rl = RateLimiter::new(Duration::from_millis(20), 1);
        let now = Instant::now();
        assert!(rl.allow(addr(1), now));
        assert!(!rl.allow(addr(1), now));
        assert!(rl.allow(addr(2), now));
    }

    #[test]
    fn garbage_collection_evicts_idle_buckets() {
        let mut rl = RateLimiter::new(Duration::from_millis(20), 1);
        let now = Instant::now();
        rl.allow(addr(1), now);
        assert_eq!(rl.bucket_count(), 1);
        rl.collect_garbage(now + Duration::from_secs(60), Duration::from_secs(30));
        assert_eq!(rl.bucket_count(), 0);
    }
}
