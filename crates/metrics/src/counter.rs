use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide count of successful writes since the last flush.
///
/// A single atomic: `take` reads and resets in one step, so increments that
/// race with a flush land in either this window or the next, never both.
#[derive(Debug, Default)]
pub struct ThroughputCounter {
    count: AtomicU64,
}

impl ThroughputCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Read the current value and reset it to zero.
    pub fn take(&self) -> u64 {
        self.count.swap(0, Ordering::AcqRel)
    }

    /// Give back a value returned by [`take`](Self::take) whose flush failed.
    pub fn restore(&self, n: u64) {
        if n > 0 {
            self.count.fetch_add(n, Ordering::AcqRel);
        }
    }

    pub fn current(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}
