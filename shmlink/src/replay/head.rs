//! Write and read endpoints attached to a buffer's shared arrays.
//!
//! Heads do the bulk copies. A [`WriteHead`] asks its [`CursorCoordinator`]
//! for cursors, copies rows, then releases the transaction. A [`ReadHead`]
//! gathers whatever indices it is given and trusts the caller to have
//! obtained them from `acquire_safe_area`.

use super::buffer::{Reservation, TxId};
use super::config::ACCESS_COUNT_FIELD;
use crate::core::field::{FieldBatch, FieldSpec};
use crate::core::segment::SegmentStore;
use crate::core::shared_array::{ArrayDesc, SharedArray};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Cursor bookkeeping a write head relies on.
///
/// Implemented by [`ReplayBuffer`](super::ReplayBuffer) in-process; a remote
/// proxy forwards the same two calls over an RPC channel.
pub trait CursorCoordinator: Send + Sync {
    /// Grant `n` cursors or fail with backpressure.
    fn reserve(&self, n: usize) -> Result<Reservation>;

    /// Commit granted transactions.
    fn release(&self, ids: &[TxId]) -> Result<()>;
}

/// Serializable description of a buffer's shared arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BufferLayout {
    /// Records per array.
    pub capacity: usize,
    /// Every array, including the access counter.
    pub arrays: Vec<ArrayDesc>,
}

struct AttachedArrays {
    capacity: usize,
    fields: BTreeMap<String, SharedArray>,
    specs: Vec<FieldSpec>,
    access_count: SharedArray,
}

impl AttachedArrays {
    fn attach(layout: &BufferLayout, store: &SegmentStore) -> Result<Self> {
        let mut fields = BTreeMap::new();
        let mut specs = Vec::new();
        let mut access_count = None;
        for desc in &layout.arrays {
            let array = SharedArray::attach(store, desc)?;
            if desc.spec.name == ACCESS_COUNT_FIELD {
                access_count = Some(array);
            } else {
                specs.push(desc.spec.clone());
                fields.insert(desc.spec.name.clone(), array);
            }
        }
        let access_count = access_count
            .ok_or_else(|| Error::NotFound(format!("'{}' array in buffer layout", ACCESS_COUNT_FIELD)))?;
        Ok(Self {
            capacity: layout.capacity,
            fields,
            specs,
            access_count,
        })
    }

    fn counter(&self, index: usize) -> Result<&AtomicU64> {
        assert!(index < self.capacity, "index {} out of range (capacity {})", index, self.capacity);
        self.access_count.segment().atomic_u64(index * 8)
    }
}

/// Producer endpoint.
pub struct WriteHead {
    arrays: AttachedArrays,
    coordinator: Arc<dyn CursorCoordinator>,
}

impl WriteHead {
    /// Attach to `layout` and report to `coordinator`.
    pub fn attach(layout: &BufferLayout, store: &SegmentStore, coordinator: Arc<dyn CursorCoordinator>) -> Result<Self> {
        Ok(Self {
            arrays: AttachedArrays::attach(layout, store)?,
            coordinator,
        })
    }

    /// Field specs this head expects in every sample.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.arrays.specs
    }

    /// Write one sample; returns its cursor.
    pub fn write(&self, sample: &FieldBatch) -> Result<usize> {
        if sample.rows() != 1 {
            return Err(Error::InvalidSample(format!("expected 1 row, got {}", sample.rows())));
        }
        let cursors = self.write_batch(sample)?;
        Ok(cursors[0])
    }

    /// Write every row of `batch`; returns the cursors in row order.
    ///
    /// On [`Error::Backpressure`] the batch is dropped. A failed copy still
    /// releases the transaction before the error is returned.
    pub fn write_batch(&self, batch: &FieldBatch) -> Result<Vec<usize>> {
        batch.validate(&self.arrays.specs)?;
        if batch.rows() == 0 {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let reservation = self.coordinator.reserve(batch.rows())?;

        let copied = self.copy_rows(batch, &reservation.cursors);
        let released = self.coordinator.release(&reservation.ids);
        if let Err(e) = copied {
            log::error!("write of {} rows failed: {}", batch.rows(), e);
            if let Err(release_err) = released {
                log::error!("release after failed write also failed: {}", release_err);
            }
            return Err(e);
        }
        released?;

        log::debug!("write of {} rows takes {:?}", batch.rows(), start.elapsed());
        Ok(reservation.cursors)
    }

    fn copy_rows(&self, batch: &FieldBatch, cursors: &[usize]) -> Result<()> {
        for (name, array) in &self.arrays.fields {
            let column = batch
                .column(name)
                .ok_or_else(|| Error::InvalidSample(format!("missing field '{}'", name)))?;
            array.scatter(cursors, column)?;
        }
        for &cursor in cursors {
            self.arrays.counter(cursor)?.store(0, Ordering::Release);
        }
        Ok(())
    }
}

/// Consumer endpoint.
pub struct ReadHead {
    arrays: AttachedArrays,
}

impl ReadHead {
    /// Attach to `layout`.
    pub fn attach(layout: &BufferLayout, store: &SegmentStore) -> Result<Self> {
        Ok(Self {
            arrays: AttachedArrays::attach(layout, store)?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.arrays.capacity
    }

    /// Gather `fields` at `indices`, bumping access counters if `count`.
    ///
    /// # Panics
    /// If any index is outside `[0, capacity)`.
    pub fn read(&self, fields: &[&str], indices: &[usize], count: bool) -> Result<FieldBatch> {
        if let Some(bad) = indices.iter().find(|&&i| i >= self.arrays.capacity) {
            panic!("read index {} out of range (capacity {})", bad, self.arrays.capacity);
        }
        let start = Instant::now();
        let mut batch = FieldBatch::new(indices.len());
        for name in fields {
            let array = self
                .arrays
                .fields
                .get(*name)
                .ok_or_else(|| Error::NotFound(format!("field '{}'", name)))?;
            batch.insert(*name, array.gather(indices)?);
        }
        if count {
            for &index in indices {
                self.arrays.counter(index)?.fetch_add(1, Ordering::AcqRel);
            }
        }
        log::debug!("read of {} rows takes {:?}", indices.len(), start.elapsed());
        Ok(batch)
    }

    /// Current access counters at `indices`.
    ///
    /// # Panics
    /// If any index is outside `[0, capacity)`.
    pub fn access_counts(&self, indices: &[usize]) -> Result<Vec<u64>> {
        indices
            .iter()
            .map(|&i| Ok(self.arrays.counter(i)?.load(Ordering::Acquire)))
            .collect()
    }
}
