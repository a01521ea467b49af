//! Replay buffer configuration.

use crate::core::field::FieldSpec;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Name of the per-slot access counter array every buffer carries.
pub const ACCESS_COUNT_FIELD: &str = "access_count";

/// Configuration for a [`ReplayBuffer`](super::ReplayBuffer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Number of records the circular storage holds.
    pub capacity: usize,
    /// One shared array per field.
    pub fields: Vec<FieldSpec>,
    /// Write heads created by `create_heads`.
    pub num_write_heads: usize,
    /// Read heads created by `create_heads`.
    pub num_read_heads: usize,
    /// Initial throughput logging interval, in writes.
    pub log_interval: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            fields: Vec::new(),
            num_write_heads: 4,
            num_read_heads: 2,
            log_interval: 1000,
        }
    }
}

impl ReplayConfig {
    /// Config with a capacity and default head counts.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Read a config from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Add a field.
    pub fn with_field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    /// Set the number of write heads.
    pub fn with_write_heads(mut self, n: usize) -> Self {
        self.num_write_heads = n;
        self
    }

    /// Set the number of read heads.
    pub fn with_read_heads(mut self, n: usize) -> Self {
        self.num_read_heads = n;
        self
    }

    /// Set the throughput logging interval.
    pub fn with_log_interval(mut self, interval: u64) -> Self {
        self.log_interval = interval;
        self
    }

    /// Validate field names and sizes.
    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::InvalidConfig("capacity must be > 0".into()));
        }
        if self.log_interval == 0 {
            return Err(Error::InvalidConfig("log_interval must be > 0".into()));
        }
        if self.fields.is_empty() {
            return Err(Error::InvalidConfig("at least one field is required".into()));
        }
        for (i, field) in self.fields.iter().enumerate() {
            if field.name.is_empty() {
                return Err(Error::InvalidConfig(format!("field {} has an empty name", i)));
            }
            if field.name == ACCESS_COUNT_FIELD {
                return Err(Error::InvalidConfig(format!("'{}' is reserved", ACCESS_COUNT_FIELD)));
            }
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::InvalidConfig(format!("duplicate field '{}'", field.name)));
            }
        }
        Ok(())
    }
}
