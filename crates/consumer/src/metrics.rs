use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Lifetime counters for one consumer pool.
#[derive(Debug, Default)]
pub struct PoolMetrics {
    pub received: AtomicU64,
    pub applied: AtomicU64,
    pub apply_failed: AtomicU64,
    pub rejected: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub requeued: AtomicU64,
    pub in_flight: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub received: u64,
    pub applied: u64,
    pub apply_failed: u64,
    pub rejected: u64,
    pub dead_lettered: u64,
    pub requeued: u64,
    pub in_flight: u64,
}

impl PoolMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            apply_failed: self.apply_failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            requeued: self.requeued.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
        }
    }

    /// Deliveries handled to completion. Every delivery ends up in exactly
    /// one of applied, rejected or apply_failed; dead_lettered and requeued
    /// break down apply_failed.
    pub fn settled(&self) -> u64 {
        let s = self.snapshot();
        s.applied + s.rejected + s.apply_failed
    }
}
