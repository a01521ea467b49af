//! Counters for replay buffer and replica activity.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

/// Thread-safe replay buffer counters.
#[derive(Debug, Default)]
pub struct ReplayMetrics {
    /// Cursor slots granted
    reserved: AtomicUsize,
    /// Reservations refused with backpressure
    dropped: AtomicUsize,
    /// Transactions released after their copy
    released: AtomicUsize,
    /// Safe areas handed to consumers
    acquired: AtomicUsize,
    /// Safe-area requests refused for lack of data
    insufficient: AtomicUsize,
}

impl ReplayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_reserved(&self, n: usize) {
        self.reserved.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, n: usize) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_released(&self, n: usize) {
        self.released.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_acquired(&self) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_insufficient(&self) {
        self.insufficient.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reserved(&self) -> usize {
        self.reserved.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::Relaxed)
    }

    pub fn insufficient(&self) -> usize {
        self.insufficient.load(Ordering::Relaxed)
    }

    /// Fraction of reservation attempts dropped (0.0 to 1.0).
    pub fn drop_rate(&self) -> f32 {
        let dropped = self.dropped() as f32;
        let total = dropped + self.reserved() as f32;
        if total == 0.0 {
            0.0
        } else {
            dropped / total
        }
    }
}

/// Counters for one parameter replica.
#[derive(Debug, Default)]
pub struct ReplicaMetrics {
    /// Updates copied into a ring slot
    processed: AtomicUsize,
    /// Ring slots (re)allocated
    allocations: AtomicUsize,
    /// Broadcasts ignored because a newer epoch was already applied
    stale: AtomicUsize,
}

impl ReplicaMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_allocations(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_stale(&self) {
        self.stale.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> usize {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn stale(&self) -> usize {
        self.stale.load(Ordering::Relaxed)
    }
}

struct ThroughputState {
    interval: u64,
    tick: Option<Instant>,
    moving_avg: f64,
}

/// Write throughput estimate with an adaptive logging interval.
///
/// Every `interval` writes the rate since the previous tick is folded into an
/// exponential moving average. The interval grows ×10 when the average rate
/// exceeds it and shrinks ÷10 when the rate falls below a tenth of it, so the
/// log line appears roughly once per second regardless of load.
pub struct ThroughputTracker {
    state: Mutex<ThroughputState>,
    lambda: f64,
}

impl ThroughputTracker {
    /// Tracker with an initial interval (in writes).
    pub fn new(interval: u64) -> Self {
        Self {
            state: Mutex::new(ThroughputState {
                interval: interval.max(1),
                tick: None,
                moving_avg: 0.0,
            }),
            lambda: 0.5,
        }
    }

    /// Current logging interval.
    pub fn interval(&self) -> u64 {
        self.state.lock().interval
    }

    /// Current moving average in writes per second.
    pub fn moving_avg(&self) -> f64 {
        self.state.lock().moving_avg
    }

    /// Observe the write counter; returns the new average on interval boundaries.
    pub fn observe(&self, write_count: u64) -> Option<f64> {
        self.observe_at(write_count, Instant::now())
    }

    fn observe_at(&self, write_count: u64, now: Instant) -> Option<f64> {
        let mut state = self.state.lock();
        if write_count % state.interval != 0 {
            return None;
        }
        let mut result = None;
        if let Some(tick) = state.tick {
            let elapsed = now.duration_since(tick).as_secs_f64().max(1e-9);
            let rate = state.interval as f64 / elapsed;
            state.moving_avg = if state.moving_avg == 0.0 {
                rate
            } else {
                state.moving_avg * self.lambda + rate * (1.0 - self.lambda)
            };
            log::debug!("write speed {:.2} it/s, moving average {:.2} it/s", rate, state.moving_avg);
            if state.moving_avg > state.interval as f64 {
                state.interval *= 10;
            } else if state.moving_avg < (state.interval / 10) as f64 {
                state.interval = (state.interval / 10).max(1);
            }
            result = Some(state.moving_avg);
        }
        state.tick = Some(now);
        result
    }
}
