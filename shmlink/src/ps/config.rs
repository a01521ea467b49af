//! Parameter store configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Configuration shared by the root and its replicas.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Children per routing tree node (K).
    pub fan_out: usize,
    /// Ring slots per tag on each replica.
    pub ring_size: usize,
    /// Headroom factor applied when a ring slot is (re)allocated.
    pub safe_ratio: f64,
    /// Directory snapshots are written under.
    pub models_dir: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            fan_out: 4,
            ring_size: 2,
            safe_ratio: 1.5,
            models_dir: PathBuf::from("./models"),
        }
    }
}

impl StoreConfig {
    /// Default config writing snapshots under `models_dir`.
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
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

    /// Set the routing fan-out.
    pub fn with_fan_out(mut self, k: usize) -> Self {
        self.fan_out = k;
        self
    }

    /// Set the number of ring slots per tag.
    pub fn with_ring_size(mut self, n: usize) -> Self {
        self.ring_size = n;
        self
    }

    /// Set the allocation headroom.
    pub fn with_safe_ratio(mut self, ratio: f64) -> Self {
        self.safe_ratio = ratio;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.fan_out == 0 {
            return Err(Error::InvalidConfig("fan_out must be > 0".into()));
        }
        // The slot being written must never be the one readers see.
        if self.ring_size < 2 {
            return Err(Error::InvalidConfig("ring_size must be >= 2".into()));
        }
        if !(self.safe_ratio >= 1.0) {
            return Err(Error::InvalidConfig(format!("safe_ratio must be >= 1.0, got {}", self.safe_ratio)));
        }
        Ok(())
    }

    /// Bytes to allocate for a payload of `len` bytes.
    pub(crate) fn slot_size(&self, len: usize) -> usize {
        ((len as f64 * self.safe_ratio).ceil() as usize).max(len).max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.fan_out, 4);
        assert_eq!(config.ring_size, 2);
        assert_eq!(config.safe_ratio, 1.5);
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects() {
        assert!(StoreConfig::default().with_fan_out(0).validate().is_err());
        assert!(StoreConfig::default().with_ring_size(1).validate().is_err());
        assert!(StoreConfig::default().with_safe_ratio(0.5).validate().is_err());
        assert!(StoreConfig::default().with_safe_ratio(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_slot_size_headroom() {
        let config = StoreConfig::default();
        assert_eq!(config.slot_size(100), 150);
        assert_eq!(config.slot_size(0), 1);
        assert_eq!(StoreConfig::default().with_safe_ratio(1.0).slot_size(7), 7);
    }

    #[test]
    fn test_partial_json() {
        let config: StoreConfig = serde_json::from_str(r#"{"fan_out": 2, "models_dir": "/tmp/m"}"#).unwrap();
        assert_eq!(config.fan_out, 2);
        assert_eq!(config.ring_size, 2);
        assert_eq!(config.models_dir, PathBuf::from("/tmp/m"));
    }
}
