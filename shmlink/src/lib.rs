//! # shmlink: shared-memory data plane for distributed training
//!
//! Two shared structures that many processes read and write at high rate:
//!
//! - a fixed-capacity circular **replay buffer** whose write and read heads
//!   copy rows directly into shared arrays, coordinated only by a small
//!   cursor/reservation bookkeeping lock
//! - a replicated, versioned **parameter store** that fans serialized model
//!   weights out over a K-ary tree of replicas, each keeping a ring of shared
//!   segments per tag
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │ Replay buffer                                                        │
//! │                                                                      │
//! │  WriteHead 0 ─┐  reserve/release   ┌──────────────┐  acquire/release │
//! │  WriteHead 1 ─┼───────────────────►│ ReplayBuffer │◄──────────────── │
//! │  WriteHead N ─┘                    │ cursor state │   consumers      │
//! │       │ copy rows                  └──────────────┘        │         │
//! │       ▼                                                    ▼         │
//! │  [ shared arrays: obs | action | reward | ... | access_count ]      │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ Parameter store                                                      │
//! │                                                                      │
//! │  learner ──push──► ParamRoot ──Broadcast──► replica ──► replica ...  │
//! │                        │                       │                     │
//! │                  snapshot/load          ring of segments ◄── client  │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use shmlink::{ElementType, FieldBatch, FieldSpec, ReplayBuffer, ReplayConfig, SegmentStore};
//!
//! let store = Arc::new(SegmentStore::new(SegmentStore::default_dir())?);
//! let config = ReplayConfig::new(100_000)
//!     .with_field(FieldSpec::new("obs", vec![84], ElementType::F32))
//!     .with_field(FieldSpec::new("reward", vec![], ElementType::F32));
//! let buffer = Arc::new(ReplayBuffer::new(config, store)?);
//! let (writers, readers) = buffer.create_heads()?;
//!
//! writers[0].write(&sample)?;
//! let batch = buffer.acquire_safe_area("learner", 256, &["obs", "reward"])?;
//! buffer.release_safe_area("learner")?;
//! ```

pub mod core;
pub mod error;
pub mod metrics;
pub mod ps;
pub mod replay;

pub use error::{Error, Result};

pub use core::context::NodeContext;
pub use core::field::{ElementType, FieldBatch, FieldSpec, Initializer};
pub use core::safe_area::{Interval, SafeArea};
pub use core::segment::{Segment, SegmentStore};

pub use replay::{Acquired, BufferLayout, BufferState, ReadHead, ReplayBuffer, ReplayConfig, Reservation, WriteHead};

pub use ps::{
    Broadcast, InProcessTransport, LocalCluster, Overrides, ParamClient, ParamMeta, ParamRoot, PullRef, ReplicaNode,
    RouteTree, StoreConfig, Transport,
};

pub use metrics::{ReplayMetrics, ReplicaMetrics};
