//! Time sources for latency measurement.
//!
//! The sensor only ever asks "what time is it, in nanoseconds?". Production
//! replicas read the wall clock, which is what peers stamp into proposals
//! and votes; tests and the simulator drive a [`ManualClock`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use warden_types::Nanos;

/// An opaque source of "now" in nanoseconds.
pub trait TimeSource: Send + Sync {
    fn now_nanos(&self) -> Nanos;
}

impl<T: TimeSource + ?Sized> TimeSource for Arc<T> {
    fn now_nanos(&self) -> Nanos {
        (**self).now_nanos()
    }
}

/// Wall-clock time since the Unix epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now_nanos(&self) -> Nanos {
        // A clock before 1970 reads as zero; one past 2262 saturates.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| Nanos::try_from(d.as_nanos()).unwrap_or(Nanos::MAX))
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Nanos) -> Self {
        Self {
            now: AtomicI64::new(start),
        }
    }

    pub fn set(&self, now: Nanos) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Advances the clock by `by` nanoseconds and returns the new time.
    pub fn advance(&self, by: Nanos) -> Nanos {
        self.now.fetch_add(by, Ordering::SeqCst) + by
    }
}

impl TimeSource for ManualClock {
    fn now_nanos(&self) -> Nanos {
        self.now.load(Ordering::SeqCst)
    }
}
