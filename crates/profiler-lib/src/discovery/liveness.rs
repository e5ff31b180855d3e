//! Liveness cache for probed endpoints
//!
//! Remembers whether an `instance:port` pair serves profiling data so each
//! pair is probed once for the lifetime of the process. Entries are never
//! expired: a new instance reusing the same name and port inherits the
//! cached answer.

use dashmap::DashMap;
use tracing::debug;

/// Concurrent write-once map from endpoint identity to reachability
#[derive(Debug, Default)]
pub struct LivenessCache {
    entries: DashMap<String, bool>,
}

impl LivenessCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key for an instance port
    pub fn key(instance_name: &str, port: u16) -> String {
        format!("{instance_name}:{port}")
    }

    /// Look up a previously stored result
    pub fn load(&self, key: &str) -> Option<bool> {
        self.entries.get(key).map(|entry| *entry.value())
    }

    /// Store a result; the first value stored for a key wins
    pub fn store(&self, key: impl Into<String>, serves_profiles: bool) {
        let key = key.into();
        debug!(key = %key, serves_profiles, "Caching liveness result");
        self.entries.entry(key).or_insert(serves_profiles);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
