//! Runtime counters for the replay buffer and parameter replicas.
//!
//! - [`ReplayMetrics`]: reservation, drop and safe-area counters
//! - [`ThroughputTracker`]: adaptive write-rate moving average
//! - [`ReplicaMetrics`]: per-replica update and allocation counters

pub mod replay_metrics;

pub use replay_metrics::{ReplayMetrics, ReplicaMetrics, ThroughputTracker};
