//! Telemetry envelope attached to every response.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key under which the worker's peak memory usage (bytes) is reported.
pub const MEMORY_PEAK_USAGE: &str = "memoryPeakUsage";

/// Ordered string-keyed measurements sent alongside a response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Telemetry(Map<String, Value>);

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn memory_peak_usage(&self) -> Option<u64> {
        self.0.get(MEMORY_PEAK_USAGE).and_then(Value::as_u64)
    }

    /// Merge in a fresh peak-memory measurement, overriding any caller-supplied one.
    pub fn with_memory_peak_usage(self) -> Self {
        self.with(MEMORY_PEAK_USAGE, peak_memory_usage())
    }
}

impl From<Map<String, Value>> for Telemetry {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

/// Peak resident set size of the current process in bytes.
#[cfg(unix)]
pub fn peak_memory_usage() -> u64 {
    use nix::sys::resource::{UsageWho, getrusage};

    match getrusage(UsageWho::RUSAGE_SELF) {
        Ok(usage) => {
            let max_rss = u64::try_from(usage.max_rss()).unwrap_or(0);
            // ru_maxrss is in bytes on macOS, kilobytes elsewhere.
            if cfg!(target_os = "macos") {
                max_rss
            } else {
                max_rss * 1024
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "getrusage failed, reporting zero peak memory");
            0
        }
    }
}

#[cfg(not(unix))]
pub fn peak_memory_usage() -> u64 {
    0
}
