//! Monotonic epoch counter for ordering broadcasts.
//!
//! Every mutation the parameter store root sends down the routing tree gets
//! a fresh epoch. Replicas compare epochs per tag so a message that arrives
//! late never overwrites a newer one.

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic epoch counter.
#[derive(Debug, Default)]
pub struct EpochCounter {
    epoch: AtomicU64,
}

impl EpochCounter {
    /// Counter starting at 0.
    pub fn new() -> Self {
        Self {
            epoch: AtomicU64::new(0),
        }
    }

    /// Increment and return the new epoch.
    pub fn next(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Current epoch without incrementing.
    pub fn current(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }
}
