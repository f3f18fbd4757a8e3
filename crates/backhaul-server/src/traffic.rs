//! Shared traffic accounting

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counter of tunneled bytes.
///
/// Every splice pump adds the bytes it moves, in both directions. The
/// counter only ever grows.
#[derive(Debug, Default)]
pub struct TrafficMeter {
    total: AtomicU64,
}

impl TrafficMeter {
    pub fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
        }
    }

    /// Record transferred bytes.
    pub fn add(&self, bytes: u64) {
        self.total.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total bytes transferred so far.
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}
