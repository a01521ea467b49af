//! Error type shared by the replay buffer and the parameter store.

use std::io;

/// Errors raised by shmlink operations.
///
/// `Backpressure`, `InsufficientData` and `PropagationIncomplete` are expected
/// under load; callers drop or retry. `SegmentFault` is fatal for the endpoint
/// that hit it.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A write reservation would overwrite data that is reserved or still being written.
    #[error("backpressure: cursor {cursor} is not writable")]
    Backpressure {
        /// The cursor that failed validation.
        cursor: usize,
    },

    /// A safe-area request asked for more indices than are currently valid.
    #[error("insufficient data: requested {requested}, available {available}")]
    InsufficientData {
        /// Requested number of indices.
        requested: usize,
        /// Currently valid, unreserved indices.
        available: usize,
    },

    /// A tag, transaction or consumer reservation does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A shared segment could not be created, attached or accessed.
    #[error("segment fault on {name}: {cause}")]
    SegmentFault {
        /// Segment name.
        name: String,
        /// Underlying cause.
        cause: String,
    },

    /// A broadcast did not reach every replica of the routing tree.
    #[error("propagation incomplete, failed nodes: {failed:?}")]
    PropagationIncomplete {
        /// Ids of the replicas that failed (or whose subtree failed).
        failed: Vec<String>,
    },

    /// A sample or batch does not match the buffer's field layout.
    #[error("invalid sample: {0}")]
    InvalidSample(String),

    /// A configuration value is out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Filesystem error during persistence.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Metadata (de)serialization error.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl Error {
    /// Whether the caller may recover by dropping or retrying later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::Backpressure { .. }
                | Error::InsufficientData { .. }
                | Error::PropagationIncomplete { .. }
        )
    }

    pub(crate) fn segment(name: impl Into<String>, cause: impl ToString) -> Self {
        Error::SegmentFault {
            name: name.into(),
            cause: cause.to_string(),
        }
    }
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
