//! Replica node of the parameter store.
//!
//! A replica keeps, per tag, a ring of `ring_size` shared segments and a
//! pointer to the slot holding the current value. Updates go to the slot
//! after the current one, so readers of the current slot are never
//! overwritten by the copy in progress.
//!
//! ```text
//!            current
//!               ▼
//! ring: [ slot 0 | slot 1 | slot 2 ]
//!                    ▲
//!              next update is copied here (outside the state lock),
//!              then `current` moves to it
//! ```
//!
//! Broadcasts carry the root's epoch. A replica applies a broadcast only if
//! its epoch is newer than the last one applied for that tag, so late
//! arrivals never roll a tag back. Deleted tags leave only their epoch
//! behind; the oldest of those are forgotten past [`MAX_TOMBSTONES`].

use super::config::StoreConfig;
use super::lock_table::LockTable;
use super::meta::ParamMeta;
use super::transport::{failed_endpoints, Broadcast, PendingCall, Transport};
use crate::core::context::NodeContext;
use crate::core::segment::{Segment, SegmentStore};
use crate::error::{Error, Result};
use crate::metrics::ReplicaMetrics;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Deleted tags whose epochs a replica remembers.
pub const MAX_TOMBSTONES: usize = 4096;

/// Where a tag's current value lives, enough for a client to map it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRef {
    /// Segment holding the bytes.
    pub segment: String,
    /// Payload length (the segment may be larger).
    pub size: usize,
    pub meta: ParamMeta,
    /// Epoch of the broadcast that produced this value.
    pub epoch: u64,
}

struct RingSlot {
    segment: Segment,
    size: usize,
}

#[derive(Default)]
struct RingState {
    slots: Vec<Option<RingSlot>>,
    current: Option<usize>,
    meta: Option<ParamMeta>,
    /// Last applied epoch.
    epoch: u64,
}

impl RingState {
    fn live(&self) -> Option<(&RingSlot, &ParamMeta)> {
        let slot = self.slots.get(self.current?)?.as_ref()?;
        Some((slot, self.meta.as_ref()?))
    }
}

struct TagRing {
    /// Serializes updates and deletes of one tag.
    writer: Mutex<()>,
    state: Mutex<RingState>,
}

impl TagRing {
    fn new(ring_size: usize) -> Self {
        Self {
            writer: Mutex::new(()),
            state: Mutex::new(RingState {
                slots: (0..ring_size).map(|_| None).collect(),
                ..Default::default()
            }),
        }
    }
}

type ApplyJob = Option<JoinHandle<Result<()>>>;

#[derive(Default)]
struct TagIndex {
    live: HashMap<String, Arc<TagRing>>,
    /// Epoch of the delete that removed each tag.
    deleted: HashMap<String, u64>,
}

impl TagIndex {
    fn bury(&mut self, tag: &str, epoch: u64) {
        let entry = self.deleted.entry(tag.to_string()).or_insert(epoch);
        *entry = (*entry).max(epoch);
        if self.deleted.len() > MAX_TOMBSTONES {
            if let Some(oldest) = self.deleted.iter().min_by_key(|(_, e)| **e).map(|(t, _)| t.clone()) {
                self.deleted.remove(&oldest);
            }
        }
    }
}

/// A node holding a replica of every tag in shared segments.
pub struct ReplicaNode {
    ctx: NodeContext,
    config: StoreConfig,
    transport: Arc<dyn Transport>,
    children: RwLock<Vec<String>>,
    tags: RwLock<TagIndex>,
    jobs: LockTable<ApplyJob>,
    metrics: ReplicaMetrics,
}

impl ReplicaNode {
    /// Create a replica forwarding to its children through `transport`.
    pub fn new(ctx: NodeContext, config: StoreConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            ctx,
            config,
            transport,
            children: RwLock::new(Vec::new()),
            tags: RwLock::new(TagIndex::default()),
            jobs: LockTable::new(),
            metrics: ReplicaMetrics::new(),
        })
    }

    pub fn node_id(&self) -> &str {
        self.ctx.node_id()
    }

    /// Segment store the ring slots are allocated from.
    pub fn segments(&self) -> &Arc<SegmentStore> {
        self.ctx.segments()
    }

    /// Replace the replicas this node forwards to.
    pub fn set_children(&self, children: Vec<String>) {
        log::debug!("replica {} routes to {:?}", self.node_id(), children);
        *self.children.write() = children;
    }

    pub fn children(&self) -> Vec<String> {
        self.children.read().clone()
    }

    pub fn metrics(&self) -> &ReplicaMetrics {
        &self.metrics
    }

    /// Ring an update at `epoch` goes to, `None` if a newer delete buried the tag.
    fn ring_for_update(&self, tag: &str, epoch: u64) -> Option<Arc<TagRing>> {
        if let Some(ring) = self.tags.read().live.get(tag) {
            return Some(Arc::clone(ring));
        }
        let mut tags = self.tags.write();
        if let Some(ring) = tags.live.get(tag) {
            return Some(Arc::clone(ring));
        }
        match tags.deleted.get(tag) {
            Some(&deleted) if deleted >= epoch => return None,
            Some(_) => {
                tags.deleted.remove(tag);
            }
            None => {}
        }
        let ring = Arc::new(TagRing::new(self.config.ring_size));
        tags.live.insert(tag.to_string(), Arc::clone(&ring));
        Some(ring)
    }

    fn is_mapped(&self, tag: &str, ring: &Arc<TagRing>) -> bool {
        self.tags.read().live.get(tag).map_or(false, |r| Arc::ptr_eq(r, ring))
    }

    fn drop_stale(&self, tag: &str, epoch: u64, have: u64) {
        self.metrics.increment_stale();
        log::debug!(
            "replica {} drops stale '{}' epoch {} (have {})",
            self.node_id(),
            tag,
            epoch,
            have
        );
    }

    /// Handle a broadcast: apply it locally and forward it to the children.
    ///
    /// The previous job for the same tag is joined first. The local apply
    /// runs on its own thread while the message is forwarded. With `wait`
    /// the call returns only after the whole subtree finished, reporting
    /// failed replicas as [`Error::PropagationIncomplete`].
    pub fn handle(self: &Arc<Self>, msg: Arc<Broadcast>, wait: bool) -> Result<()> {
        log::debug!(
            "replica {} handling '{}' at epoch {}",
            self.node_id(),
            msg.tag(),
            msg.epoch()
        );
        let job = self.jobs.entry(msg.tag());
        let local = {
            let mut slot = job.lock();
            if let Some(previous) = slot.take() {
                let _ = previous.join();
            }
            let node = Arc::clone(self);
            let local_msg = Arc::clone(&msg);
            let handle = thread::Builder::new()
                .name(format!("ps-apply-{}", self.node_id()))
                .spawn(move || {
                    let result = node.apply(&local_msg);
                    if let Err(e) = &result {
                        log::error!("replica {} failed to apply '{}': {}", node.node_id(), local_msg.tag(), e);
                    }
                    result
                })?;
            if wait {
                Some(handle)
            } else {
                *slot = Some(handle);
                None
            }
        };

        let calls: Vec<PendingCall> = self
            .children()
            .iter()
            .map(|child| self.transport.call_async(child, Arc::clone(&msg), wait))
            .collect();
        if !wait {
            return Ok(());
        }

        let mut failed = Vec::new();
        if let Some(handle) = local {
            if !matches!(handle.join(), Ok(Ok(()))) {
                failed.push(self.node_id().to_string());
            }
        }
        failed.extend(failed_endpoints(calls));
        if failed.is_empty() {
            Ok(())
        } else {
            Err(Error::PropagationIncomplete { failed })
        }
    }

    /// Apply a broadcast to this replica only.
    pub fn apply(&self, msg: &Broadcast) -> Result<()> {
        match msg {
            Broadcast::Update { tag, meta, bytes, epoch } => self.process(tag, meta.clone(), bytes, *epoch),
            Broadcast::Delete { tag, epoch } => self.remove(tag, *epoch),
        }
    }

    /// Store `bytes` as the new value of `tag`.
    ///
    /// The next ring slot is (re)allocated if missing or too small, filled
    /// outside the state lock, then published as current. Epochs not newer
    /// than the last applied one are dropped.
    pub fn process(&self, tag: &str, meta: ParamMeta, bytes: &[u8], epoch: u64) -> Result<()> {
        loop {
            let ring = match self.ring_for_update(tag, epoch) {
                Some(ring) => ring,
                None => {
                    self.drop_stale(tag, epoch, self.tags.read().deleted.get(tag).copied().unwrap_or(0));
                    return Ok(());
                }
            };
            let _writer = ring.writer.lock();
            // A delete may have unmapped the ring while we waited.
            if !self.is_mapped(tag, &ring) {
                continue;
            }
            return self.store_locked(&ring, tag, meta, bytes, epoch);
        }
    }

    fn store_locked(&self, ring: &TagRing, tag: &str, meta: ParamMeta, bytes: &[u8], epoch: u64) -> Result<()> {
        let (next, slot) = {
            let mut state = ring.state.lock();
            if epoch <= state.epoch {
                self.drop_stale(tag, epoch, state.epoch);
                return Ok(());
            }
            let next = state.current.map_or(0, |c| (c + 1) % state.slots.len());
            (next, state.slots[next].take())
        };

        let store = self.ctx.segments();
        let mut slot = match slot {
            Some(slot) if slot.segment.len() >= bytes.len() => slot,
            old => {
                if let Some(old) = old {
                    log::debug!("releasing segment {} of '{}'", old.segment.name(), tag);
                    if let Err(e) = store.release(old.segment) {
                        log::warn!("failed to release ring slot of '{}': {}", tag, e);
                    }
                }
                let segment = store.create(self.config.slot_size(bytes.len()))?;
                self.metrics.increment_allocations();
                RingSlot { segment, size: 0 }
            }
        };
        if let Err(e) = slot.segment.write(0, bytes) {
            if let Err(release_err) = store.release(slot.segment) {
                log::warn!("failed to release ring slot of '{}': {}", tag, release_err);
            }
            return Err(e);
        }
        slot.size = bytes.len();

        {
            let mut state = ring.state.lock();
            state.slots[next] = Some(slot);
            state.current = Some(next);
            state.meta = Some(meta);
            state.epoch = epoch;
        }
        self.metrics.increment_processed();
        log::debug!("replica {} stored '{}' in slot {}", self.node_id(), tag, next);
        Ok(())
    }

    /// Drop `tag` and release every ring slot.
    ///
    /// The tag's epoch is remembered so an older update arriving later does
    /// not bring it back, even for a tag this replica never held.
    pub fn remove(&self, tag: &str, epoch: u64) -> Result<()> {
        loop {
            let ring = {
                let mut tags = self.tags.write();
                match tags.live.get(tag) {
                    Some(ring) => Arc::clone(ring),
                    None => {
                        tags.bury(tag, epoch);
                        return Ok(());
                    }
                }
            };
            let _writer = ring.writer.lock();
            if !self.is_mapped(tag, &ring) {
                continue;
            }
            let slots: Vec<RingSlot> = {
                let mut state = ring.state.lock();
                if epoch <= state.epoch {
                    self.drop_stale(tag, epoch, state.epoch);
                    return Ok(());
                }
                state.epoch = epoch;
                state.meta = None;
                state.current = None;
                state.slots.iter_mut().filter_map(Option::take).collect()
            };
            {
                let mut tags = self.tags.write();
                tags.live.remove(tag);
                tags.bury(tag, epoch);
            }
            let store = self.ctx.segments();
            for slot in slots {
                if let Err(e) = store.release(slot.segment) {
                    log::warn!("failed to release ring slot of '{}': {}", tag, e);
                }
            }
            log::debug!("replica {} deleted '{}'", self.node_id(), tag);
            return Ok(());
        }
    }

    fn with_live<R>(&self, tag: &str, f: impl FnOnce(&RingSlot, &ParamMeta, u64) -> Result<R>) -> Result<R> {
        let not_found = || Error::NotFound(format!("tag '{}' on replica {}", tag, self.node_id()));
        let ring = self.tags.read().live.get(tag).cloned().ok_or_else(not_found)?;
        let state = ring.state.lock();
        let (slot, meta) = state.live().ok_or_else(not_found)?;
        f(slot, meta, state.epoch)
    }

    /// Location and metadata of the current value of `tag`.
    pub fn pull(&self, tag: &str) -> Result<PullRef> {
        self.with_live(tag, |slot, meta, epoch| {
            Ok(PullRef {
                segment: slot.segment.name().to_string(),
                size: slot.size,
                meta: meta.clone(),
                epoch,
            })
        })
    }

    pub fn pull_many(&self, tags: &[&str]) -> Result<Vec<PullRef>> {
        tags.iter().map(|tag| self.pull(tag)).collect()
    }

    /// Copy of the current value of `tag`, read under the tag's lock.
    pub fn read_current(&self, tag: &str) -> Result<(Vec<u8>, ParamMeta)> {
        self.with_live(tag, |slot, meta, _| Ok((slot.segment.read(0, slot.size)?, meta.clone())))
    }

    pub fn meta(&self, tag: &str) -> Result<ParamMeta> {
        self.with_live(tag, |_, meta, _| Ok(meta.clone()))
    }

    /// Parameter id of `tag`.
    pub fn id(&self, tag: &str) -> Result<String> {
        self.with_live(tag, |_, meta, _| Ok(meta.id.clone()))
    }

    pub fn info(&self, tag: &str) -> Result<Value> {
        self.with_live(tag, |_, meta, _| Ok(meta.info.clone()))
    }

    /// Epoch of the current value, `None` if `tag` is absent.
    pub fn epoch(&self, tag: &str) -> Option<u64> {
        self.with_live(tag, |_, _, epoch| Ok(epoch)).ok()
    }

    /// Tags with a current value, sorted.
    pub fn list_tags(&self) -> Vec<String> {
        let mut tags: Vec<String> = self
            .tags
            .read()
            .live
            .iter()
            .filter(|(_, ring)| ring.state.lock().live().is_some())
            .map(|(tag, _)| tag.clone())
            .collect();
        tags.sort();
        tags
    }

    /// Info of every live tag.
    pub fn tags_info(&self) -> BTreeMap<String, Value> {
        self.tags
            .read()
            .live
            .iter()
            .filter_map(|(tag, ring)| {
                let state = ring.state.lock();
                state.live().map(|(_, meta)| (tag.clone(), meta.info.clone()))
            })
            .collect()
    }
}

impl Drop for ReplicaNode {
    fn drop(&mut self) {
        let store = Arc::clone(self.ctx.segments());
        for (tag, ring) in self.tags.get_mut().live.drain() {
            let slots: Vec<RingSlot> = ring.state.lock().slots.iter_mut().filter_map(Option::take).collect();
            for slot in slots {
                if let Err(e) = store.release(slot.segment) {
                    log::warn!("failed to release ring slot of '{}': {}", tag, e);
                }
            }
        }
    }
}
