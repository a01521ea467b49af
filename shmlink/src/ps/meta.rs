//! Parameter metadata.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Metadata stored alongside every tag's bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamMeta {
    /// Parameter id, a fresh uuid per push unless overridden.
    pub id: String,
    /// Caller-supplied info (learn step, score, ...).
    pub info: Value,
    /// Push time in seconds since the UNIX epoch.
    pub time: f64,
    /// Number of pushes this tag has seen.
    pub count: u64,
}

impl ParamMeta {
    /// Metadata for a new value of a tag whose previous value had `previous`.
    pub fn next(previous: Option<&ParamMeta>, info: Value, overrides: &Overrides) -> Self {
        Self {
            id: overrides.id.clone().unwrap_or_else(new_id),
            info,
            time: overrides.time.unwrap_or_else(now_secs),
            count: overrides.count.unwrap_or_else(|| next_count(previous)),
        }
    }
}

/// Explicit values for fields the store would otherwise generate.
///
/// Used when replaying saved parameters so their identity survives a restart.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Overrides {
    pub id: Option<String>,
    pub time: Option<f64>,
    pub count: Option<u64>,
}

impl Overrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_time(mut self, time: f64) -> Self {
        self.time = Some(time);
        self
    }

    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Overrides reproducing `meta` exactly.
    pub fn from_meta(meta: &ParamMeta) -> Self {
        Self {
            id: Some(meta.id.clone()),
            time: Some(meta.time),
            count: Some(meta.count),
        }
    }
}

pub(crate) fn next_count(previous: Option<&ParamMeta>) -> u64 {
    previous.map_or(1, |m| m.count + 1)
}

/// Fresh parameter id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Seconds since the UNIX epoch.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
