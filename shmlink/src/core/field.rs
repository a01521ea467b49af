//! Field descriptors and row-major sample containers.
//!
//! Each replay field is a `capacity × shape` array of one element type. Rows
//! travel as little-endian bytes; [`FieldBatch`] keeps one contiguous column
//! per field.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Element type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElementType {
    U8,
    Bool,
    I32,
    U32,
    F32,
    I64,
    U64,
    F64,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 | ElementType::Bool => 1,
            ElementType::I32 | ElementType::U32 | ElementType::F32 => 4,
            ElementType::I64 | ElementType::U64 | ElementType::F64 => 8,
        }
    }

    /// Little-endian encoding of `value` in this type.
    pub fn encode(self, value: f64) -> Vec<u8> {
        match self {
            ElementType::U8 => vec![value as u8],
            ElementType::Bool => vec![(value != 0.0) as u8],
            ElementType::I32 => (value as i32).to_le_bytes().to_vec(),
            ElementType::U32 => (value as u32).to_le_bytes().to_vec(),
            ElementType::F32 => (value as f32).to_le_bytes().to_vec(),
            ElementType::I64 => (value as i64).to_le_bytes().to_vec(),
            ElementType::U64 => (value as u64).to_le_bytes().to_vec(),
            ElementType::F64 => value.to_le_bytes().to_vec(),
        }
    }
}

/// How a field's storage is initialized at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Initializer {
    /// Leave whatever the segment holds (fresh segments are zeroed by the OS).
    #[default]
    Empty,
    /// Explicitly zero the storage.
    Zeros,
    /// Fill every element with a constant.
    Constant(f64),
}

/// Descriptor of one shared array of the replay buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    /// Field name, unique within a buffer.
    pub name: String,
    /// Per-record shape (empty for scalars).
    pub shape: Vec<usize>,
    /// Element type.
    pub dtype: ElementType,
    /// Initialization policy.
    #[serde(default)]
    pub init: Initializer,
}

impl FieldSpec {
    /// Create a field with the default initializer.
    pub fn new(name: impl Into<String>, shape: impl Into<Vec<usize>>, dtype: ElementType) -> Self {
        Self {
            name: name.into(),
            shape: shape.into(),
            dtype,
            init: Initializer::Empty,
        }
    }

    /// Set the initializer.
    pub fn with_init(mut self, init: Initializer) -> Self {
        self.init = init;
        self
    }

    /// Elements per record.
    pub fn elements_per_row(&self) -> usize {
        self.shape.iter().product()
    }

    /// Bytes per record.
    pub fn row_bytes(&self) -> usize {
        self.elements_per_row() * self.dtype.size()
    }
}

/// Column-major batch of rows: one contiguous byte column per field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldBatch {
    rows: usize,
    columns: BTreeMap<String, Vec<u8>>,
}

impl FieldBatch {
    /// Empty batch of `rows` rows.
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            columns: BTreeMap::new(),
        }
    }

    /// Build a one-row batch from `(field, bytes)` pairs.
    pub fn single<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Vec<u8>)>,
        K: Into<String>,
    {
        let mut batch = Self::new(1);
        for (name, bytes) in fields {
            batch.columns.insert(name.into(), bytes);
        }
        batch
    }

    /// Add (or replace) a column.
    pub fn insert(&mut self, name: impl Into<String>, column: Vec<u8>) {
        self.columns.insert(name.into(), column);
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Column bytes of a field.
    pub fn column(&self, name: &str) -> Option<&[u8]> {
        self.columns.get(name).map(Vec::as_slice)
    }

    /// Field names present.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(String::as_str)
    }

    /// Bytes of row `row` of a field.
    pub fn row(&self, name: &str, row: usize) -> Option<&[u8]> {
        let column = self.columns.get(name)?;
        if self.rows == 0 || row >= self.rows {
            return None;
        }
        let width = column.len() / self.rows;
        column.get(row * width..(row + 1) * width)
    }

    /// Check every spec has a column of exactly `rows × row_bytes` bytes.
    pub fn validate(&self, specs: &[FieldSpec]) -> Result<()> {
        for spec in specs {
            let column = self
                .columns
                .get(&spec.name)
                .ok_or_else(|| Error::InvalidSample(format!("missing field '{}'", spec.name)))?;
            let expected = self.rows * spec.row_bytes();
            if column.len() != expected {
                return Err(Error::InvalidSample(format!(
                    "field '{}' has {} bytes, expected {}",
                    spec.name,
                    column.len(),
                    expected
                )));
            }
        }
        for name in self.columns.keys() {
            if !specs.iter().any(|s| &s.name == name) {
                return Err(Error::InvalidSample(format!("unknown field '{}'", name)));
            }
        }
        Ok(())
    }
}

/// Little-endian bytes of an `f32` slice.
pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Decode little-endian `f32`s. Trailing bytes are ignored.
pub fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}
