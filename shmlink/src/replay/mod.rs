//! Shared-memory replay buffer.
//!
//! - [`ReplayBuffer`]: cursor reservations, in-flight writes and consumer
//!   safe areas behind one mutex
//! - [`WriteHead`] / [`ReadHead`]: endpoints doing the bulk copies against the
//!   shared arrays, outside the buffer's lock
//!
//! Producers never block: a write that cannot be placed without overwriting
//! reserved or unfinished data fails with `Backpressure` and is dropped.

pub mod buffer;
pub mod config;
pub mod head;

pub use buffer::{
    format_bytes, memory_summary, Acquired, BufferState, InFlightWrite, ReplayBuffer, Reservation, TxId,
};
pub use config::{ReplayConfig, ACCESS_COUNT_FIELD};
pub use head::{BufferLayout, CursorCoordinator, ReadHead, WriteHead};

#[cfg(test)]
mod tests;
