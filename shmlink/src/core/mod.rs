//! Shared-memory primitives used by the replay buffer and parameter store.

pub mod context;
pub mod field;
pub mod safe_area;
pub mod segment;
pub mod shared_array;
pub mod version;

pub use context::NodeContext;
pub use field::{f32_bytes, f32_values, ElementType, FieldBatch, FieldSpec, Initializer};
pub use safe_area::{Interval, SafeArea};
pub use segment::{Segment, SegmentStore};
pub use shared_array::{ArrayDesc, SharedArray};
pub use version::EpochCounter;
