//! Index intervals over the replay buffer's circular storage.
//!
//! A [`SafeArea`] is an ordered union of inclusive [`Interval`]s. Order is
//! recency order: intervals are added oldest data first, so the tail of the
//! list holds the freshest indices and [`SafeArea::suffix`] consumes from the
//! tail backward.

use serde::{Deserialize, Serialize};

/// Inclusive index range `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    /// First index.
    pub start: usize,
    /// Last index (inclusive).
    pub end: usize,
}

impl Interval {
    /// Number of indices covered.
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    /// Intervals are never empty once constructed.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Membership test.
    pub fn contains(&self, index: usize) -> bool {
        self.start <= index && index <= self.end
    }
}

/// Ordered union of non-overlapping intervals with a cached total length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafeArea {
    intervals: Vec<Interval>,
    length: usize,
}

impl SafeArea {
    /// Empty area.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `start..=end`. Inverted ranges are ignored.
    pub fn add(&mut self, start: usize, end: usize) {
        if end < start {
            return;
        }
        let interval = Interval { start, end };
        self.length += interval.len();
        self.intervals.push(interval);
    }

    /// Signed variant of [`add`](Self::add) for ranges that may underflow
    /// (`cursor - 1` with `cursor == 0`).
    pub(crate) fn add_signed(&mut self, start: i64, end: i64) {
        if end < start || end < 0 {
            return;
        }
        self.add(start.max(0) as usize, end as usize);
    }

    /// Total number of indices.
    pub fn len(&self) -> usize {
        self.length
    }

    /// Whether the area holds no index.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Stored intervals in recency order.
    pub fn intervals(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter()
    }

    /// The most recently added `size` indices.
    ///
    /// Walks intervals newest first and trims the oldest partially consumed
    /// one so the result holds exactly `size` indices. Returns `None` when the
    /// area is shorter than `size`. The returned area lists intervals newest
    /// first.
    pub fn suffix(&self, size: usize) -> Option<SafeArea> {
        if size > self.length {
            return None;
        }
        let mut out = SafeArea::new();
        let mut remaining = size;
        for interval in self.intervals.iter().rev() {
            if remaining == 0 {
                break;
            }
            if interval.len() >= remaining {
                out.add(interval.end + 1 - remaining, interval.end);
                remaining = 0;
            } else {
                out.add(interval.start, interval.end);
                remaining -= interval.len();
            }
        }
        debug_assert_eq!(out.length, size);
        Some(out)
    }

    /// Every index, interval by interval, each interval ascending.
    pub fn to_indices(&self) -> Vec<usize> {
        let mut indices = Vec::with_capacity(self.length);
        for interval in &self.intervals {
            indices.extend(interval.start..=interval.end);
        }
        indices
    }

    /// Membership test, linear in the number of intervals.
    pub fn contains(&self, index: usize) -> bool {
        self.intervals.iter().any(|i| i.contains(index))
    }

    /// This area without any index held by `other`, order preserved.
    pub fn subtract(&self, other: &SafeArea) -> SafeArea {
        if other.is_empty() {
            return self.clone();
        }
        let mut holes: Vec<Interval> = other.intervals.clone();
        holes.sort_by_key(|i| i.start);

        let mut out = SafeArea::new();
        for interval in &self.intervals {
            let mut start = interval.start;
            for hole in &holes {
                if hole.end < start || hole.start > interval.end {
                    continue;
                }
                if hole.start > start {
                    out.add(start, hole.start - 1);
                }
                start = hole.end + 1;
                if start > interval.end {
                    break;
                }
            }
            if start <= interval.end {
                out.add(start, interval.end);
            }
        }
        out
    }
}
