//! Circular replay buffer over shared arrays.
//!
//! The buffer only arbitrates *which* indices may be touched; heads move the
//! bytes themselves, outside the buffer's lock.
//!
//! ```text
//! WriteHead ──reserve(n)──►┌──────────────────────────┐◄──acquire_safe_area── consumer
//!     │                    │ Mutex<CursorState>       │
//!     │ copy rows          │  write_count / loop      │
//!     ▼                    │  in-flight writes        │
//! [shared arrays] ◄────────│  consumer reservations   │────► gather rows
//!     │                    └──────────────────────────┘
//! WriteHead ──release(ids)──┘
//! ```
//!
//! # Invariants
//!
//! - `write_count = loop_number * capacity + cursor`.
//! - A cursor is granted only if no consumer holds it and granting it would
//!   not lap the oldest in-flight writer.
//! - A safe area only covers committed indices not held by another consumer.

use super::config::{ReplayConfig, ACCESS_COUNT_FIELD};
use super::head::{BufferLayout, CursorCoordinator, ReadHead, WriteHead};
use crate::core::field::{ElementType, FieldBatch, FieldSpec, Initializer};
use crate::core::safe_area::SafeArea;
use crate::core::segment::SegmentStore;
use crate::core::shared_array::SharedArray;
use crate::error::{Error, Result};
use crate::metrics::{ReplayMetrics, ThroughputTracker};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Write transaction id. Ids are issued in increasing order, so the smallest
/// in-flight id is the oldest writer.
pub type TxId = u64;

/// Lifecycle of a buffer instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BufferState {
    Created,
    StorageAllocated,
    HeadsAttached,
    Running,
}

/// Cursors granted by [`ReplayBuffer::reserve`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reservation {
    /// Transaction ids, to pass back to `release`.
    pub ids: Vec<TxId>,
    /// Granted cursors, one per id.
    pub cursors: Vec<usize>,
}

impl Reservation {
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// Result of a successful safe-area acquisition.
#[derive(Debug, Clone)]
pub struct Acquired {
    /// Reserved indices, most recent data first.
    pub indices: Vec<usize>,
    /// Requested fields gathered at `indices`.
    pub batch: FieldBatch,
}

/// Snapshot of one in-flight write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InFlightWrite {
    pub id: TxId,
    pub cursor: usize,
    pub loop_number: u64,
    pub age: Duration,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    cursor: usize,
    loop_number: u64,
    started: Instant,
}

#[derive(Debug)]
struct CursorState {
    write_count: u64,
    loop_number: u64,
    next_wrap: u64,
    next_tx: TxId,
    in_flight: BTreeMap<TxId, InFlight>,
    reservations: HashMap<String, SafeArea>,
    lifecycle: BufferState,
}

impl CursorState {
    fn new(capacity: u64) -> Self {
        Self {
            write_count: 0,
            loop_number: 0,
            next_wrap: capacity,
            next_tx: 1,
            in_flight: BTreeMap::new(),
            reservations: HashMap::new(),
            lifecycle: BufferState::Created,
        }
    }

    /// Cursor of the oldest in-flight writer and the loop it was granted in.
    fn oldest_writer(&self) -> Option<(usize, u64)> {
        self.in_flight
            .values()
            .next()
            .map(|w| (w.cursor, w.loop_number))
    }

    fn is_writable(&self, cursor: usize, loop_number: u64, oldest: Option<(usize, u64)>) -> bool {
        if self.reservations.values().any(|area| area.contains(cursor)) {
            return false;
        }
        match oldest {
            // One full lap ahead of the oldest unfinished write.
            Some((old_cursor, old_loop)) => !(loop_number > old_loop && old_cursor <= cursor),
            None => true,
        }
    }
}

/// Indices that hold committed data and are not being written.
///
/// Areas are added oldest data first so [`SafeArea::suffix`] hands out the
/// freshest records.
fn valid_region(capacity: usize, write_count: u64, in_flight: &BTreeMap<TxId, InFlight>) -> SafeArea {
    let cap = capacity as i64;
    let cursor = (write_count % capacity as u64) as i64;
    let full = write_count >= capacity as u64;
    let size = if full { cap } else { write_count as i64 };
    let mut area = SafeArea::new();

    match in_flight.len() {
        0 => {
            if full {
                area.add_signed(cursor, cap - 1);
                area.add_signed(0, cursor - 1);
            } else {
                area.add_signed(0, size - 1);
            }
        }
        1 => {
            let writer = in_flight.values().next().map(|w| w.cursor as i64).unwrap_or(cursor);
            if full {
                if writer < cursor {
                    area.add_signed(cursor, cap - 1);
                    area.add_signed(0, writer - 1);
                    area.add_signed(writer + 1, cursor - 1);
                } else {
                    // Writer granted a lap ago, at or past the cursor.
                    area.add_signed(cursor, writer - 1);
                    area.add_signed(writer + 1, cap - 1);
                    area.add_signed(0, cursor - 1);
                }
            } else {
                area.add_signed(0, writer - 1);
                area.add_signed(writer + 1, size - 1);
            }
        }
        _ => {
            let oldest = in_flight.values().next().map(|w| w.cursor as i64).unwrap_or(0);
            let newest = in_flight.values().next_back().map(|w| w.cursor as i64).unwrap_or(0);
            if oldest > newest {
                area.add_signed(newest + 1, oldest - 1);
            } else if full {
                area.add_signed(newest + 1, cap - 1);
                area.add_signed(0, oldest - 1);
            } else {
                area.add_signed(0, oldest - 1);
            }
        }
    }
    area
}

/// Fixed-capacity circular experience buffer shared between processes.
pub struct ReplayBuffer {
    config: ReplayConfig,
    store: Arc<SegmentStore>,
    arrays: BTreeMap<String, SharedArray>,
    state: Mutex<CursorState>,
    metrics: ReplayMetrics,
    throughput: ThroughputTracker,
}

impl ReplayBuffer {
    /// Validate the config and allocate every field's shared array.
    pub fn new(config: ReplayConfig, store: Arc<SegmentStore>) -> Result<Self> {
        config.validate()?;
        let mut state = CursorState::new(config.capacity as u64);

        log::info!("{}", memory_summary(&config));
        let mut arrays = BTreeMap::new();
        for spec in &config.fields {
            log::info!(
                "creating '{}' storage: {} x {:?} {:?}",
                spec.name,
                config.capacity,
                spec.shape,
                spec.dtype
            );
            arrays.insert(spec.name.clone(), SharedArray::create(&store, spec.clone(), config.capacity)?);
        }
        let counter = FieldSpec::new(ACCESS_COUNT_FIELD, Vec::new(), ElementType::U64).with_init(Initializer::Zeros);
        arrays.insert(
            ACCESS_COUNT_FIELD.to_string(),
            SharedArray::create(&store, counter, config.capacity)?,
        );
        state.lifecycle = BufferState::StorageAllocated;

        let throughput = ThroughputTracker::new(config.log_interval);
        Ok(Self {
            config,
            store,
            arrays,
            state: Mutex::new(state),
            metrics: ReplayMetrics::new(),
            throughput,
        })
    }

    /// Descriptor heads use to attach to the shared arrays.
    pub fn layout(&self) -> BufferLayout {
        BufferLayout {
            capacity: self.config.capacity,
            arrays: self.arrays.values().map(SharedArray::desc).collect(),
        }
    }

    /// Create the configured write and read heads, attached to this buffer.
    pub fn create_heads(self: &Arc<Self>) -> Result<(Vec<WriteHead>, Vec<ReadHead>)> {
        let layout = self.layout();
        let coordinator: Arc<dyn CursorCoordinator> = self.clone();
        let writers = (0..self.config.num_write_heads)
            .map(|_| WriteHead::attach(&layout, &self.store, Arc::clone(&coordinator)))
            .collect::<Result<Vec<_>>>()?;
        let readers = (0..self.config.num_read_heads)
            .map(|_| ReadHead::attach(&layout, &self.store))
            .collect::<Result<Vec<_>>>()?;

        let mut state = self.state.lock();
        if state.lifecycle < BufferState::HeadsAttached {
            state.lifecycle = BufferState::HeadsAttached;
        }
        log::debug!("attached {} write heads, {} read heads", writers.len(), readers.len());
        Ok((writers, readers))
    }

    /// Atomically grant `n` sequential cursors.
    ///
    /// Fails fast with [`Error::Backpressure`] if any candidate is held by a
    /// consumer or would lap the oldest in-flight writer; nothing is granted
    /// in that case.
    pub fn reserve(&self, n: usize) -> Result<Reservation> {
        if n == 0 {
            return Ok(Reservation::default());
        }
        let capacity = self.config.capacity as u64;
        let mut state = self.state.lock();
        if n > self.config.capacity {
            // More than a lap always overruns its own first grant.
            let cursor = (state.write_count % capacity) as usize;
            drop(state);
            self.metrics.add_dropped(n);
            log::warn!("reservation of {} exceeds capacity {}, dropping", n, capacity);
            return Err(Error::Backpressure { cursor });
        }

        let mut write_count = state.write_count;
        let mut loop_number = state.loop_number;
        let mut next_wrap = state.next_wrap;
        let existing = state.oldest_writer();
        let mut granted: Vec<(usize, u64)> = Vec::with_capacity(n);

        for _ in 0..n {
            let cursor = (write_count % capacity) as usize;
            let oldest = existing.or_else(|| granted.first().copied());
            if !state.is_writable(cursor, loop_number, oldest) {
                drop(state);
                self.metrics.add_dropped(n);
                log::warn!("unable to reserve cursor {} ({} requested), dropping", cursor, n);
                return Err(Error::Backpressure { cursor });
            }
            granted.push((cursor, loop_number));
            write_count += 1;
            if write_count == next_wrap {
                loop_number += 1;
                next_wrap += capacity;
            }
        }

        let now = Instant::now();
        let mut reservation = Reservation {
            ids: Vec::with_capacity(n),
            cursors: Vec::with_capacity(n),
        };
        for (cursor, loop_number) in granted {
            let id = state.next_tx;
            state.next_tx += 1;
            state.in_flight.insert(
                id,
                InFlight {
                    cursor,
                    loop_number,
                    started: now,
                },
            );
            reservation.ids.push(id);
            reservation.cursors.push(cursor);
        }
        state.write_count = write_count;
        state.loop_number = loop_number;
        state.next_wrap = next_wrap;
        state.lifecycle = BufferState::Running;
        drop(state);

        self.metrics.add_reserved(n);
        self.throughput.observe(write_count);
        Ok(reservation)
    }

    /// Mark transactions as committed.
    ///
    /// Known ids are always released; unknown ids are reported afterwards as
    /// [`Error::NotFound`].
    pub fn release(&self, ids: &[TxId]) -> Result<()> {
        let mut missing = Vec::new();
        {
            let mut state = self.state.lock();
            for id in ids {
                if state.in_flight.remove(id).is_none() {
                    missing.push(*id);
                }
            }
        }
        self.metrics.add_released(ids.len() - missing.len());
        if missing.is_empty() {
            Ok(())
        } else {
            Err(Error::NotFound(format!("write transactions {:?}", missing)))
        }
    }

    /// Indices currently safe to read (ignores consumer reservations).
    pub fn valid_region(&self) -> SafeArea {
        let state = self.state.lock();
        valid_region(self.config.capacity, state.write_count, &state.in_flight)
    }

    /// Reserve the `size` most recent readable indices for `consumer` and
    /// gather `fields` at them.
    ///
    /// Any previous reservation of `consumer` is replaced. Indices held by
    /// other consumers are skipped. Fails with [`Error::InsufficientData`]
    /// (state unchanged) if fewer than `size` indices qualify.
    pub fn acquire_safe_area(&self, consumer: &str, size: usize, fields: &[&str]) -> Result<Acquired> {
        for name in fields {
            if !self.arrays.contains_key(*name) {
                return Err(Error::NotFound(format!("field '{}'", name)));
            }
        }

        let area = {
            let mut state = self.state.lock();
            let mut held = SafeArea::new();
            for (other, area) in &state.reservations {
                if other != consumer {
                    for interval in area.intervals() {
                        held.add(interval.start, interval.end);
                    }
                }
            }
            let available = valid_region(self.config.capacity, state.write_count, &state.in_flight).subtract(&held);
            let area = match available.suffix(size) {
                Some(area) => area,
                None => {
                    drop(state);
                    self.metrics.increment_insufficient();
                    return Err(Error::InsufficientData {
                        requested: size,
                        available: available.len(),
                    });
                }
            };
            state.reservations.insert(consumer.to_string(), area.clone());
            area
        };
        self.metrics.increment_acquired();

        let indices = area.to_indices();
        let mut batch = FieldBatch::new(indices.len());
        for name in fields {
            if let Some(array) = self.arrays.get(*name) {
                batch.insert(*name, array.gather(&indices)?);
            }
        }
        Ok(Acquired { indices, batch })
    }

    /// Drop `consumer`'s reservation so writers may overwrite it again.
    pub fn release_safe_area(&self, consumer: &str) -> Result<()> {
        match self.state.lock().reservations.remove(consumer) {
            Some(_) => Ok(()),
            None => Err(Error::NotFound(format!("safe area of consumer '{}'", consumer))),
        }
    }

    /// Area currently held by `consumer`.
    pub fn reservation(&self, consumer: &str) -> Option<SafeArea> {
        self.state.lock().reservations.get(consumer).cloned()
    }

    /// Writes granted but not yet released, oldest first.
    pub fn in_flight(&self) -> Vec<InFlightWrite> {
        let now = Instant::now();
        self.state
            .lock()
            .in_flight
            .iter()
            .map(|(id, w)| InFlightWrite {
                id: *id,
                cursor: w.cursor,
                loop_number: w.loop_number,
                age: now.duration_since(w.started),
            })
            .collect()
    }

    /// Whether the cursor has wrapped at least once.
    pub fn is_full(&self) -> bool {
        self.state.lock().write_count >= self.config.capacity as u64
    }

    /// Number of records that hold data.
    pub fn size(&self) -> usize {
        (self.state.lock().write_count).min(self.config.capacity as u64) as usize
    }

    /// Next write position.
    pub fn cursor(&self) -> usize {
        (self.state.lock().write_count % self.config.capacity as u64) as usize
    }

    /// Number of completed wraps.
    pub fn loop_number(&self) -> u64 {
        self.state.lock().loop_number
    }

    /// Total cursors ever granted.
    pub fn write_count(&self) -> u64 {
        self.state.lock().write_count
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn state(&self) -> BufferState {
        self.state.lock().lifecycle
    }

    /// Field specs, excluding the access counter.
    pub fn fields(&self) -> &[FieldSpec] {
        &self.config.fields
    }

    pub fn metrics(&self) -> &ReplayMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }
}

impl CursorCoordinator for ReplayBuffer {
    fn reserve(&self, n: usize) -> Result<Reservation> {
        ReplayBuffer::reserve(self, n)
    }

    fn release(&self, ids: &[TxId]) -> Result<()> {
        ReplayBuffer::release(self, ids)
    }
}

impl Drop for ReplayBuffer {
    fn drop(&mut self) {
        for (name, array) in std::mem::take(&mut self.arrays) {
            if let Err(e) = self.store.release(array.into_segment()) {
                log::warn!("failed to release storage of '{}': {}", name, e);
            }
        }
    }
}

/// Human-readable size (`1.5MiB`).
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in ["", "Ki", "Mi", "Gi", "Ti", "Pi", "Ei", "Zi"] {
        if value.abs() < 1024.0 {
            return format!("{:.1}{}B", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1}YiB", value)
}

/// Per-field storage table logged at allocation time.
pub fn memory_summary(config: &ReplayConfig) -> String {
    let rows: Vec<(String, u64)> = config
        .fields
        .iter()
        .map(|f| (f.name.clone(), (config.capacity * f.row_bytes()) as u64))
        .chain(std::iter::once((ACCESS_COUNT_FIELD.to_string(), (config.capacity * 8) as u64)))
        .collect();
    let width = rows.iter().map(|(n, _)| n.len()).max().unwrap_or(3).max(3);
    let total: u64 = rows.iter().map(|(_, b)| b).sum();

    let mut out = String::from("replay memory summary:\n");
    out.push_str(&format!("  {:<width$}  {:>10}\n", "Key", "Size", width = width));
    for (name, bytes) in &rows {
        out.push_str(&format!("  {:<width$}  {:>10}\n", name, format_bytes(*bytes), width = width));
    }
    out.push_str(&format!("  total: {}", format_bytes(total)));
    out
}
