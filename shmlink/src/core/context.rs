//! Per-node context handed to components at construction.
//!
//! Components never reach for process-wide state: the node's identity and the
//! segment store it allocates from travel in a [`NodeContext`].

use super::segment::SegmentStore;
use crate::error::Result;
use std::path::PathBuf;
use std::sync::Arc;

/// Identity and resources of the node a component runs on.
#[derive(Debug, Clone)]
pub struct NodeContext {
    node_id: String,
    segments: Arc<SegmentStore>,
}

impl NodeContext {
    /// Create a context around an existing segment store.
    pub fn new(node_id: impl Into<String>, segments: Arc<SegmentStore>) -> Self {
        Self {
            node_id: node_id.into(),
            segments,
        }
    }

    /// Create a context whose segments live in `dir`.
    pub fn with_segment_dir(node_id: impl Into<String>, dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(node_id, Arc::new(SegmentStore::new(dir)?)))
    }

    /// Node identifier.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Segment store of this node.
    pub fn segments(&self) -> &Arc<SegmentStore> {
        &self.segments
    }

    /// Same resources under another identity (for co-located replicas).
    pub fn child(&self, node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            segments: Arc::clone(&self.segments),
        }
    }
}
