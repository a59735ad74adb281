//! Per-peer timer state machine (spec.md §4.3).
//!
//! Replaces the "fire-and-forget goroutine per timer" pattern flagged in
//! the design notes with an abstract `arm(duration, closure)`/`cancel()`
//! object backed by a single worker thread per timer; every timer is
//! disarmed when the peer stops.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use rand::Rng;

pub const REKEY_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_TIMER_HANDSHAKES: u32 = 3;
pub const REJECT_AFTER_TIME_X3: Duration = Duration::from_secs(180 * 3);

/// A single-shot timer that can be (re-)armed or cancelled from any
/// thread. Armed callbacks run on a dedicated background thread; arming
/// again replaces any pending callback.
pub struct Timer {
    generation: Arc<AtomicU64>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
}

impl Default for Timer {
    fn default() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            handle: parking_lot::Mutex::new(None),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Timer {
    /// Schedules `callback` to run after `duration`, superseding any
    /// previous arming. A no-op once the timer has been permanently
    /// disarmed via [`Timer::stop`] — including when called from a
    /// callback that re-arms itself, so a self-perpetuating timer chain
    /// stops as soon as the owning peer is stopped.
    pub fn arm(&self, duration: Duration, callback: impl FnOnce() + Send + 'static) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let generation = self.generation.clone();
        let stopped = self.stopped.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(duration);
            if !stopped.load(Ordering::SeqCst) && generation.load(Ordering::SeqCst) == my_gen {
                callback();
            }
        });
        *self.handle.lock() = Some(handle);
    }

    /// Cancels any pending callback without arming a new one.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Permanently disarms the timer; subsequent `arm` calls are no-ops
    /// until a fresh `Timer` is constructed.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.cancel();
    }
}

/// jittered delay in `0..=334ms`, matching WireGuard's handshake
/// retransmit jitter window.
pub fn jitter() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(0..=334))
}

/// The five timers driving one peer's lifecycle.
#[derive(Default)]
pub struct PeerTimers {
    pub retransmit_handshake: Timer,
    pub send_keepalive: Timer,
    pub new_handshake: Timer,
    pub zero_key_material: Timer,
    pub persistent_keepalive: Timer,
    attempts: AtomicU32,
    stopped: std::sync::atomic::AtomicBool,
}

impl PeerTimers {
    pub fn reset_handshake_attempts(&self) {
        self.attempts.store(0, Ordering::Relaxed);
    }

    pub fn handshake_attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn increment_handshake_attempts(&self) -> u32 {
        self.attempts.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Disarms every timer; arming any timer afterward is a no-op
    /// (spec.md §4.3: "Arming a timer on a stopped peer is a no-op").
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.retransmit_handshake.stop();
        self.send_keepalive.stop();
        self.new_handshake.stop();
        self.zero_key_material.stop();
        self.persistent_keepalive.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn rearming_supersedes_the_earlier_callback() {
        let timer = Timer::default();
        let fired = Arc::new(AtomicBool::new(false));
        let f1 = fired.clone();
        timer.arm(Duration::from_millis(20), move || f1.store(true, Ordering::SeqCst));
        let f2 = fired.clone();
        timer.arm(Duration::from_millis(5), move || f2.store(true, Ordering::SeqCst));
        std::thread::sleep(Duration::from_millis(50));
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn cancel_prevents_the_callback() {
        let timer = Timer::default();
        let fired = Arc::new(AtomicBool::new(false));
        let f = fired.clone();
        timer.arm(Duration::from_millis(10), move || f.store(true, Ordering::SeqCst));
        timer.cancel();
        std::thread::sleep(Duration::from_millis(40));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn jitter_stays_within_window() {
        for _ in 0..1000 {
            assert!(jitter() <= Duration::from_millis(334));
        }
    }
}
