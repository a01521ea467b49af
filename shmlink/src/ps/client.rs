//! Consumer-side access to a replica's parameters.

use super::meta::ParamMeta;
use super::replica::{PullRef, ReplicaNode};
use crate::core::segment::SegmentStore;
use crate::error::Result;
use std::sync::Arc;

const MAX_ATTEMPTS: usize = 8;

/// Pulls parameters by mapping the replica's ring segments directly.
///
/// The replica only hands out where the current value lives; the bytes are
/// copied here. A copy is accepted if the tag's epoch did not move while it
/// ran. A slot is only rewritten after a newer value has been published, so
/// an unchanged epoch means the slot was not touched.
pub struct ParamClient {
    replica: Arc<ReplicaNode>,
    store: Arc<SegmentStore>,
}

impl ParamClient {
    pub fn new(replica: Arc<ReplicaNode>, store: Arc<SegmentStore>) -> Self {
        Self { replica, store }
    }

    /// Replica this client reads from.
    pub fn replica(&self) -> &Arc<ReplicaNode> {
        &self.replica
    }

    /// Bytes and metadata of the current value of `tag`.
    pub fn pull(&self, tag: &str) -> Result<(Vec<u8>, ParamMeta)> {
        for attempt in 0..MAX_ATTEMPTS {
            let pull = self.replica.pull(tag)?;
            match self.copy_out(&pull) {
                Ok(bytes) if self.replica.epoch(tag) == Some(pull.epoch) => return Ok((bytes, pull.meta)),
                Ok(_) => log::debug!("'{}' moved past epoch {} during pull {}", tag, pull.epoch, attempt),
                Err(e) => log::debug!("pull {} of '{}' failed: {}", attempt, tag, e),
            }
        }
        // Contended: fall back to a copy made under the replica's lock.
        self.replica.read_current(tag)
    }

    /// [`pull`](Self::pull) for several tags, in order.
    pub fn pull_many(&self, tags: &[&str]) -> Result<Vec<(Vec<u8>, ParamMeta)>> {
        tags.iter().map(|tag| self.pull(tag)).collect()
    }

    fn copy_out(&self, pull: &PullRef) -> Result<Vec<u8>> {
        let segment = self.store.attach(&pull.segment)?;
        segment.read(0, pull.size)
    }
}
