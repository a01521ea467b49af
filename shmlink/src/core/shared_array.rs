//! Row-addressed arrays stored in shared segments.

use super::field::{FieldSpec, Initializer};
use super::segment::{Segment, SegmentStore};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Serializable handle to a shared array, enough for another process to attach.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArrayDesc {
    /// Segment name.
    pub segment: String,
    /// Field layout.
    pub spec: FieldSpec,
    /// Number of rows.
    pub capacity: usize,
}

/// A `capacity × spec.shape` array living in one segment.
#[derive(Debug)]
pub struct SharedArray {
    spec: FieldSpec,
    capacity: usize,
    row_bytes: usize,
    segment: Segment,
}

impl SharedArray {
    /// Allocate and initialize a new array.
    pub fn create(store: &SegmentStore, spec: FieldSpec, capacity: usize) -> Result<Self> {
        let row_bytes = spec.row_bytes();
        let segment = store.create(capacity * row_bytes)?;
        let array = Self {
            spec,
            capacity,
            row_bytes,
            segment,
        };
        array.initialize()?;
        Ok(array)
    }

    /// Attach to an array created elsewhere.
    pub fn attach(store: &SegmentStore, desc: &ArrayDesc) -> Result<Self> {
        let segment = store.attach(&desc.segment)?;
        let row_bytes = desc.spec.row_bytes();
        if segment.len() < desc.capacity * row_bytes {
            return Err(Error::segment(
                &desc.segment,
                format!("segment holds {} bytes, layout needs {}", segment.len(), desc.capacity * row_bytes),
            ));
        }
        Ok(Self {
            spec: desc.spec.clone(),
            capacity: desc.capacity,
            row_bytes,
            segment,
        })
    }

    fn initialize(&self) -> Result<()> {
        let total = self.capacity * self.row_bytes;
        match self.spec.init {
            Initializer::Empty => Ok(()),
            Initializer::Zeros => self.segment.fill(0, total, &[0]),
            Initializer::Constant(v) => self.segment.fill(0, total, &self.spec.dtype.encode(v)),
        }
    }

    /// Descriptor for attaching from another process.
    pub fn desc(&self) -> ArrayDesc {
        ArrayDesc {
            segment: self.segment.name().to_string(),
            spec: self.spec.clone(),
            capacity: self.capacity,
        }
    }

    pub fn spec(&self) -> &FieldSpec {
        &self.spec
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn row_bytes(&self) -> usize {
        self.row_bytes
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Consume the array, returning its segment (for release by the owner).
    pub fn into_segment(self) -> Segment {
        self.segment
    }

    fn offset(&self, index: usize) -> usize {
        assert!(
            index < self.capacity,
            "index {} out of range for field '{}' (capacity {})",
            index,
            self.spec.name,
            self.capacity
        );
        index * self.row_bytes
    }

    /// Write one row.
    ///
    /// # Panics
    /// If `index >= capacity`.
    pub fn write_row(&self, index: usize, row: &[u8]) -> Result<()> {
        if row.len() != self.row_bytes {
            return Err(Error::InvalidSample(format!(
                "row for '{}' has {} bytes, expected {}",
                self.spec.name,
                row.len(),
                self.row_bytes
            )));
        }
        self.segment.write(self.offset(index), row)
    }

    /// Scatter consecutive rows of `column` to `indices`.
    ///
    /// # Panics
    /// If any index is out of range.
    pub fn scatter(&self, indices: &[usize], column: &[u8]) -> Result<()> {
        if column.len() != indices.len() * self.row_bytes {
            return Err(Error::InvalidSample(format!(
                "column for '{}' has {} bytes, expected {}",
                self.spec.name,
                column.len(),
                indices.len() * self.row_bytes
            )));
        }
        for (i, &index) in indices.iter().enumerate() {
            let row = &column[i * self.row_bytes..(i + 1) * self.row_bytes];
            self.segment.write(self.offset(index), row)?;
        }
        Ok(())
    }

    /// Read one row.
    ///
    /// # Panics
    /// If `index >= capacity`.
    pub fn read_row(&self, index: usize) -> Result<Vec<u8>> {
        self.segment.read(self.offset(index), self.row_bytes)
    }

    /// Gather rows at `indices` into one contiguous column.
    ///
    /// # Panics
    /// If any index is out of range.
    pub fn gather(&self, indices: &[usize]) -> Result<Vec<u8>> {
        let mut column = vec![0u8; indices.len() * self.row_bytes];
        for (i, &index) in indices.iter().enumerate() {
            let offset = self.offset(index);
            self.segment
                .read_into(offset, &mut column[i * self.row_bytes..(i + 1) * self.row_bytes])?;
        }
        Ok(column)
    }
}
