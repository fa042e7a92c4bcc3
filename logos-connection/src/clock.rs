//! Monotonic time source injected into the manager.
//!
//! Production code reads `Instant::now()`; tests share a [`ManualClock`]
//! between the test body and the manager and move it forward explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of "now" for every timestamp the manager records.
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Wall-clock backed time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    origin: Instant,
    /// Nanoseconds elapsed since `origin`
    elapsed: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            elapsed: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Move time forward by `by`.
    pub fn advance(&self, by: Duration) {
        self.elapsed.fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    /// Move time forward to `to`. Never goes backwards.
    pub fn advance_to(&self, to: Instant) {
        let target = to.saturating_duration_since(self.origin).as_nanos() as u64;
        self.elapsed.fetch_max(target, Ordering::SeqCst);
    }

    /// Time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.elapsed.load(Ordering::SeqCst))
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}
