//! Behavioral test suite for the replay buffer and its heads.
//!
//! Test categories:
//! 1. Cursor arithmetic and lifecycle
//! 2. Safe-area acquisition and release
//! 3. Backpressure (held areas, lapping, atomic batches)
//! 4. Head data paths (write, gather, access counters)
//! 5. Randomized interleavings of metadata operations
//! 6. Concurrency (many writers and readers on one buffer)

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use tempfile::TempDir;

use super::*;
use crate::core::field::{f32_bytes, f32_values, ElementType, FieldBatch, FieldSpec};
use crate::core::segment::SegmentStore;
use crate::error::Error;

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

fn config(capacity: usize) -> ReplayConfig {
    ReplayConfig::new(capacity)
        .with_field(FieldSpec::new("obs", vec![2], ElementType::F32))
        .with_field(FieldSpec::new("reward", Vec::new(), ElementType::F32))
        .with_write_heads(2)
        .with_read_heads(1)
}

fn setup(capacity: usize) -> (TempDir, Arc<ReplayBuffer>) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SegmentStore::new(dir.path()).unwrap());
    let buffer = Arc::new(ReplayBuffer::new(config(capacity), store).unwrap());
    (dir, buffer)
}

/// A row whose every element equals `v`, so torn rows are detectable.
fn sample(v: f32) -> FieldBatch {
    FieldBatch::single([("obs", f32_bytes(&[v, v])), ("reward", f32_bytes(&[v]))])
}

fn write_n(head: &WriteHead, n: usize) {
    for i in 0..n {
        head.write(&sample(i as f32)).unwrap();
    }
}

// =============================================================================
// 1. CURSOR ARITHMETIC AND LIFECYCLE
// =============================================================================

#[test]
fn test_twelve_writes_wrap_capacity_ten() {
    let (_dir, buffer) = setup(10);
    let (writers, _readers) = buffer.create_heads().unwrap();
    write_n(&writers[0], 12);

    assert_eq!(buffer.write_count(), 12);
    assert_eq!(buffer.cursor(), 2);
    assert_eq!(buffer.loop_number(), 1);
    assert!(buffer.is_full());
    assert_eq!(buffer.size(), 10);
    assert!(buffer.in_flight().is_empty());
}

#[test]
fn test_write_count_identity_holds() {
    let (_dir, buffer) = setup(7);
    let (writers, _) = buffer.create_heads().unwrap();
    for i in 0..30 {
        writers[i % 2].write(&sample(i as f32)).unwrap();
        assert_eq!(
            buffer.write_count(),
            buffer.loop_number() * 7 + buffer.cursor() as u64
        );
    }
}

#[test]
fn test_lifecycle_states() {
    let (_dir, buffer) = setup(4);
    assert_eq!(buffer.state(), BufferState::StorageAllocated);

    let (writers, readers) = buffer.create_heads().unwrap();
    assert_eq!(writers.len(), 2);
    assert_eq!(readers.len(), 1);
    assert_eq!(buffer.state(), BufferState::HeadsAttached);

    writers[0].write(&sample(1.0)).unwrap();
    assert_eq!(buffer.state(), BufferState::Running);

    // Late heads do not move the state backwards.
    buffer.create_heads().unwrap();
    assert_eq!(buffer.state(), BufferState::Running);
}

#[test]
fn test_not_full_until_wrap() {
    let (_dir, buffer) = setup(5);
    let (writers, _) = buffer.create_heads().unwrap();
    write_n(&writers[0], 4);
    assert!(!buffer.is_full());
    assert_eq!(buffer.size(), 4);
    write_n(&writers[0], 1);
    assert!(buffer.is_full());
    assert_eq!(buffer.loop_number(), 1);
}

// =============================================================================
// 2. SAFE-AREA ACQUISITION AND RELEASE
// =============================================================================

#[test]
fn test_acquire_more_than_written_fails_without_side_effects() {
    let (_dir, buffer) = setup(10);
    let (writers, _) = buffer.create_heads().unwrap();
    write_n(&writers[0], 3);
    let region_before = buffer.valid_region();

    let err = buffer.acquire_safe_area("learner", 5, &["obs"]).unwrap_err();
    assert!(matches!(err, Error::InsufficientData { requested: 5, available: 3 }));

    assert!(buffer.reservation("learner").is_none());
    assert_eq!(buffer.write_count(), 3);
    assert_eq!(buffer.valid_region(), region_before);
    assert_eq!(buffer.metrics().insufficient(), 1);
}

#[test]
fn test_acquire_returns_most_recent_rows() {
    let (_dir, buffer) = setup(10);
    let (writers, _) = buffer.create_heads().unwrap();
    write_n(&writers[0], 13);

    // Rows 10, 11, 12 landed at cursors 0, 1, 2.
    let acquired = buffer.acquire_safe_area("learner", 3, &["reward"]).unwrap();
    assert_eq!(acquired.indices, vec![0, 1, 2]);
    assert_eq!(f32_values(acquired.batch.column("reward").unwrap()), vec![10.0, 11.0, 12.0]);

    let acquired = buffer.acquire_safe_area("learner", 5, &["reward"]).unwrap();
    assert_eq!(acquired.indices, vec![0, 1, 2, 8, 9]);
}

#[test]
fn test_two_consumers_hold_disjoint_areas() {
    let (_dir, buffer) = setup(10);
    let (writers, _) = buffer.create_heads().unwrap();
    write_n(&writers[0], 10);

    let a = buffer.acquire_safe_area("a", 4, &[]).unwrap();
    let b = buffer.acquire_safe_area("b", 5, &[]).unwrap();
    let a_set: HashSet<_> = a.indices.iter().copied().collect();
    assert!(b.indices.iter().all(|i| !a_set.contains(i)));
    assert_eq!(a.indices, vec![6, 7, 8, 9]);
    assert_eq!(b.indices, vec![1, 2, 3, 4, 5]);

    let err = buffer.acquire_safe_area("c", 2, &[]).unwrap_err();
    assert!(matches!(err, Error::InsufficientData { requested: 2, available: 1 }));

    buffer.release_safe_area("a").unwrap();
    let c = buffer.acquire_safe_area("c", 2, &[]).unwrap();
    assert_eq!(c.indices, vec![8, 9]);
}

#[test]
fn test_reacquire_replaces_own_reservation() {
    let (_dir, buffer) = setup(6);
    let (writers, _) = buffer.create_heads().unwrap();
    write_n(&writers[0], 6);

    buffer.acquire_safe_area("a", 6, &[]).unwrap();
    // The consumer's own previous area does not count against it.
    let again = buffer.acquire_safe_area("a", 6, &[]).unwrap();
    assert_eq!(again.indices.len(), 6);
    assert_eq!(buffer.reservation("a").unwrap().len(), 6);
}

#[test]
fn test_release_unknown_consumer_is_not_found() {
    let (_dir, buffer) = setup(4);
    assert!(matches!(buffer.release_safe_area("ghost"), Err(Error::NotFound(_))));
}

#[test]
fn test_acquire_unknown_field_is_not_found() {
    let (_dir, buffer) = setup(4);
    let (writers, _) = buffer.create_heads().unwrap();
    write_n(&writers[0], 4);
    assert!(matches!(
        buffer.acquire_safe_area("a", 1, &["missing"]),
        Err(Error::NotFound(_))
    ));
    assert!(buffer.reservation("a").is_none());
}

#[test]
fn test_acquired_area_excludes_in_flight_writes() {
    let (_dir, buffer) = setup(10);
    let (writers, _) = buffer.create_heads().unwrap();
    write_n(&writers[0], 5);

    let pending = buffer.reserve(2).unwrap();
    assert_eq!(pending.cursors, vec![5, 6]);
    let acquired = buffer.acquire_safe_area("a", 5, &[]).unwrap();
    assert_eq!(acquired.indices, vec![0, 1, 2, 3, 4]);
    assert!(buffer.acquire_safe_area("b", 1, &[]).is_err());

    buffer.release(&pending.ids).unwrap();
    let b = buffer.acquire_safe_area("b", 2, &[]).unwrap();
    assert_eq!(b.indices, vec![5, 6]);
}

// =============================================================================
// 3. BACKPRESSURE
// =============================================================================

#[test]
fn test_reserve_refuses_held_indices() {
    let (_dir, buffer) = setup(4);
    let (writers, _) = buffer.create_heads().unwrap();
    write_n(&writers[0], 4);

    let held = buffer.acquire_safe_area("learner", 2, &[]).unwrap();
    assert_eq!(held.indices, vec![2, 3]);

    writers[0].write(&sample(4.0)).unwrap(); // cursor 0
    writers[0].write(&sample(5.0)).unwrap(); // cursor 1
    let err = writers[0].write(&sample(6.0)).unwrap_err();
    assert!(matches!(err, Error::Backpressure { cursor: 2 }));
    assert_eq!(buffer.write_count(), 6);
    assert_eq!(buffer.metrics().dropped(), 1);

    buffer.release_safe_area("learner").unwrap();
    assert_eq!(writers[0].write(&sample(6.0)).unwrap(), 2);
}

#[test]
fn test_reserve_refuses_to_lap_oldest_writer() {
    let (_dir, buffer) = setup(10);
    let stuck = buffer.reserve(1).unwrap();
    assert_eq!(stuck.cursors, vec![0]);

    let rest = buffer.reserve(9).unwrap();
    buffer.release(&rest.ids).unwrap();
    assert_eq!(buffer.loop_number(), 1);

    assert!(matches!(buffer.reserve(1), Err(Error::Backpressure { cursor: 0 })));

    buffer.release(&stuck.ids).unwrap();
    assert_eq!(buffer.reserve(1).unwrap().cursors, vec![0]);
}

#[test]
fn test_lapped_writer_row_is_never_readable() {
    let (_dir, buffer) = setup(10);
    let first = buffer.reserve(5).unwrap();
    buffer.release(&first.ids).unwrap();
    let stuck = buffer.reserve(1).unwrap();
    assert_eq!(stuck.cursors, vec![5]);
    let lap = buffer.reserve(9).unwrap();
    buffer.release(&lap.ids).unwrap();
    assert_eq!((buffer.cursor(), buffer.write_count()), (5, 15));

    let region = buffer.valid_region();
    assert!(!region.contains(5));
    assert_eq!(region.len(), 9);
    assert!(matches!(
        buffer.acquire_safe_area("learner", 10, &[]),
        Err(Error::InsufficientData { requested: 10, available: 9 })
    ));
    let acquired = buffer.acquire_safe_area("learner", 9, &[]).unwrap();
    assert!(!acquired.indices.contains(&5));
    assert!(matches!(buffer.reserve(1), Err(Error::Backpressure { cursor: 5 })));
}

#[test]
fn test_oversized_reservation_fails_fast() {
    let (_dir, buffer) = setup(4);
    buffer.reserve(1).unwrap();
    let err = buffer.reserve(usize::MAX / 2).unwrap_err();
    assert!(matches!(err, Error::Backpressure { cursor: 1 }));
    assert_eq!(buffer.write_count(), 1);
    assert_eq!(buffer.in_flight().len(), 1);
}

#[test]
fn test_batch_reservation_is_all_or_nothing() {
    let (_dir, buffer) = setup(4);
    assert!(matches!(buffer.reserve(5), Err(Error::Backpressure { .. })));
    assert_eq!(buffer.write_count(), 0);
    assert!(buffer.in_flight().is_empty());

    let full_lap = buffer.reserve(4).unwrap();
    assert_eq!(full_lap.cursors, vec![0, 1, 2, 3]);
    assert_eq!(buffer.loop_number(), 1);
}

#[test]
fn test_batch_reservation_stops_before_held_area() {
    let (_dir, buffer) = setup(6);
    let (writers, _) = buffer.create_heads().unwrap();
    write_n(&writers[0], 6);
    buffer.acquire_safe_area("learner", 2, &[]).unwrap(); // holds 4, 5

    let before = buffer.write_count();
    assert!(matches!(buffer.reserve(5), Err(Error::Backpressure { cursor: 4 })));
    assert_eq!(buffer.write_count(), before);
    assert_eq!(buffer.reserve(4).unwrap().cursors, vec![0, 1, 2, 3]);
}

#[test]
fn test_release_unknown_transaction() {
    let (_dir, buffer) = setup(4);
    let r = buffer.reserve(1).unwrap();
    let err = buffer.release(&[r.ids[0], 999]).unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
    // The known id was still released.
    assert!(buffer.in_flight().is_empty());
}

// =============================================================================
// 4. HEAD DATA PATHS
// =============================================================================

#[test]
fn test_write_batch_and_read_head_gather() {
    let (_dir, buffer) = setup(8);
    let (writers, readers) = buffer.create_heads().unwrap();

    let mut batch = FieldBatch::new(3);
    batch.insert("obs", f32_bytes(&[0.0, 0.5, 1.0, 1.5, 2.0, 2.5]));
    batch.insert("reward", f32_bytes(&[10.0, 11.0, 12.0]));
    let cursors = writers[1].write_batch(&batch).unwrap();
    assert_eq!(cursors, vec![0, 1, 2]);

    let read = readers[0].read(&["obs", "reward"], &[2, 0], false).unwrap();
    assert_eq!(f32_values(read.column("obs").unwrap()), vec![2.0, 2.5, 0.0, 0.5]);
    assert_eq!(f32_values(read.row("reward", 0).unwrap()), vec![12.0]);
}

#[test]
fn test_access_counters_count_and_reset() {
    let (_dir, buffer) = setup(4);
    let (writers, readers) = buffer.create_heads().unwrap();
    write_n(&writers[0], 2);

    readers[0].read(&["reward"], &[0, 1], true).unwrap();
    readers[0].read(&["reward"], &[1], true).unwrap();
    readers[0].read(&["reward"], &[0], false).unwrap();
    assert_eq!(readers[0].access_counts(&[0, 1]).unwrap(), vec![1, 2]);

    // Overwriting slot 0 after a wrap resets its counter.
    write_n(&writers[0], 3);
    assert_eq!(readers[0].access_counts(&[0, 1]).unwrap(), vec![0, 2]);
}

/// Hands out transaction ids without cursors and refuses every release.
struct BrokenCoordinator {
    released: AtomicUsize,
}

impl CursorCoordinator for BrokenCoordinator {
    fn reserve(&self, n: usize) -> crate::error::Result<Reservation> {
        Ok(Reservation {
            ids: (1..=n as TxId).collect(),
            cursors: Vec::new(),
        })
    }

    fn release(&self, ids: &[TxId]) -> crate::error::Result<()> {
        self.released.fetch_add(ids.len(), Ordering::SeqCst);
        Err(Error::NotFound(format!("transactions {:?}", ids)))
    }
}

#[test]
fn test_failed_copy_still_releases_and_reports_copy_error() {
    let (dir, buffer) = setup(4);
    let store = SegmentStore::new(dir.path()).unwrap();
    let coordinator = Arc::new(BrokenCoordinator {
        released: AtomicUsize::new(0),
    });
    let head = WriteHead::attach(&buffer.layout(), &store, coordinator.clone()).unwrap();

    let err = head.write(&sample(1.0)).unwrap_err();
    assert!(matches!(err, Error::InvalidSample(_)), "got {:?}", err);
    assert_eq!(coordinator.released.load(Ordering::SeqCst), 1);
}

#[test]
fn test_invalid_sample_reserves_nothing() {
    let (_dir, buffer) = setup(4);
    let (writers, _) = buffer.create_heads().unwrap();
    let bad = FieldBatch::single([("obs", f32_bytes(&[1.0]))]);
    assert!(matches!(writers[0].write(&bad), Err(Error::InvalidSample(_))));
    assert_eq!(buffer.write_count(), 0);

    let mut two = FieldBatch::new(2);
    two.insert("obs", f32_bytes(&[0.0; 4]));
    two.insert("reward", f32_bytes(&[0.0; 2]));
    assert!(matches!(writers[0].write(&two), Err(Error::InvalidSample(_))));
}

#[test]
#[should_panic(expected = "out of range")]
fn test_read_out_of_range_panics() {
    let (_dir, buffer) = setup(4);
    let (_, readers) = buffer.create_heads().unwrap();
    let _ = readers[0].read(&["obs"], &[4], false);
}

#[test]
fn test_layout_round_trips_through_json() {
    let (dir, buffer) = setup(4);
    let layout = buffer.layout();
    let json = serde_json::to_string(&layout).unwrap();
    let back: BufferLayout = serde_json::from_str(&json).unwrap();
    assert_eq!(back, layout);
    assert_eq!(back.arrays.len(), 3);

    // A head in "another process" attaches through the decoded layout.
    let store = SegmentStore::new(dir.path()).unwrap();
    let head = ReadHead::attach(&back, &store).unwrap();
    assert_eq!(head.capacity(), 4);
}

// =============================================================================
// 5. RANDOMIZED INTERLEAVINGS
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Reserve(usize),
    ReleaseOldest,
    Acquire(u8, usize),
    ReleaseArea(u8),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..4).prop_map(Op::Reserve),
        2 => Just(Op::ReleaseOldest),
        2 => (0u8..3, 1usize..6).prop_map(|(c, s)| Op::Acquire(c, s)),
        1 => (0u8..3).prop_map(Op::ReleaseArea),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_reserve_never_grants_held_index(ops in prop::collection::vec(op(), 1..80)) {
        let (_dir, buffer) = setup(8);
        let consumers = ["c0", "c1", "c2"];
        let mut outstanding: Vec<Vec<TxId>> = Vec::new();

        for op in ops {
            match op {
                Op::Reserve(n) => {
                    if let Ok(r) = buffer.reserve(n) {
                        for c in consumers {
                            if let Some(area) = buffer.reservation(c) {
                                for cursor in &r.cursors {
                                    prop_assert!(!area.contains(*cursor));
                                }
                            }
                        }
                        outstanding.push(r.ids);
                    }
                }
                Op::ReleaseOldest => {
                    if !outstanding.is_empty() {
                        let ids = outstanding.remove(0);
                        buffer.release(&ids).unwrap();
                    }
                }
                Op::Acquire(c, size) => {
                    if let Ok(acquired) = buffer.acquire_safe_area(consumers[c as usize], size, &[]) {
                        prop_assert_eq!(acquired.indices.len(), size);
                        let writing: HashSet<usize> = buffer.in_flight().iter().map(|w| w.cursor).collect();
                        for idx in &acquired.indices {
                            prop_assert!(!writing.contains(idx));
                        }
                    }
                }
                Op::ReleaseArea(c) => {
                    let _ = buffer.release_safe_area(consumers[c as usize]);
                }
            }

            // Held areas stay pairwise disjoint.
            let mut seen = HashSet::new();
            for c in consumers {
                if let Some(area) = buffer.reservation(c) {
                    for idx in area.to_indices() {
                        prop_assert!(seen.insert(idx));
                    }
                }
            }
            prop_assert_eq!(
                buffer.write_count(),
                buffer.loop_number() * 8 + buffer.cursor() as u64
            );
        }
    }
}

// =============================================================================
// 6. CONCURRENCY
// =============================================================================

#[test]
fn test_concurrent_writers_and_readers_never_see_torn_rows() {
    let (_dir, buffer) = setup(64);
    let (writers, readers) = buffer.create_heads().unwrap();
    let stop = Arc::new(AtomicBool::new(false));
    let written = Arc::new(AtomicUsize::new(0));
    let torn = Arc::new(AtomicUsize::new(0));

    let writer_threads: Vec<_> = writers
        .into_iter()
        .enumerate()
        .map(|(w, head)| {
            let stop = Arc::clone(&stop);
            let written = Arc::clone(&written);
            thread::spawn(move || {
                let mut i = 0u32;
                while !stop.load(Ordering::Relaxed) {
                    let v = (w as u32 * 1_000_000 + i) as f32;
                    if head.write(&sample(v)).is_ok() {
                        written.fetch_add(1, Ordering::Relaxed);
                    }
                    i += 1;
                }
            })
        })
        .collect();

    let reader_threads: Vec<_> = (0..3)
        .map(|r| {
            let buffer = Arc::clone(&buffer);
            let torn = Arc::clone(&torn);
            thread::spawn(move || {
                let consumer = format!("reader-{}", r);
                for _ in 0..300 {
                    let size = fastrand::usize(1..12);
                    if let Ok(acquired) = buffer.acquire_safe_area(&consumer, size, &["obs", "reward"]) {
                        for row in 0..acquired.indices.len() {
                            let obs = f32_values(acquired.batch.row("obs", row).unwrap());
                            let reward = f32_values(acquired.batch.row("reward", row).unwrap());
                            if obs[0] != obs[1] || obs[0] != reward[0] {
                                torn.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        buffer.release_safe_area(&consumer).unwrap();
                    }
                    thread::yield_now();
                }
            })
        })
        .collect();

    for t in reader_threads {
        t.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for t in writer_threads {
        t.join().unwrap();
    }

    assert_eq!(torn.load(Ordering::Relaxed), 0);
    assert!(buffer.in_flight().is_empty());
    assert_eq!(buffer.write_count() as usize, written.load(Ordering::Relaxed));
    assert_eq!(buffer.metrics().reserved(), written.load(Ordering::Relaxed));
}

#[test]
fn test_heads_are_send_and_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<WriteHead>();
    assert_send_sync::<ReadHead>();
    assert_send_sync::<ReplayBuffer>();
}
