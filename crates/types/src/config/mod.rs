// Path: crates/types/src/config/mod.rs

//! Configuration for an IAVL tree and its node database.
use serde::{Deserialize, Serialize};

/// Tunables shared by the mutable tree and the node database.
///
/// Every field has a serde default so a partial TOML table is accepted.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct TreeOptions {
    /// Commit batches with a durable (synchronous) write.
    #[serde(default)]
    pub sync: bool,
    /// Version assigned to the first saved version when no versions exist. Zero means one.
    #[serde(default)]
    pub initial_version: u64,
    /// Approximate byte size at which a pending write batch is flushed early.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    /// Run version pruning on a background thread.
    #[serde(default)]
    pub async_pruning: bool,
    /// Capacity of the node cache, in nodes.
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,
    /// Capacity of the fast-node cache, in entries.
    #[serde(default = "default_fast_cache_size")]
    pub fast_cache_size: usize,
    /// Never build or consult the fast index.
    #[serde(default)]
    pub skip_fast_storage_upgrade: bool,
}

fn default_flush_threshold() -> usize {
    100_000
}
fn default_cache_size() -> usize {
    10_000
}
fn default_fast_cache_size() -> usize {
    100_000
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            sync: false,
            initial_version: 0,
            flush_threshold: default_flush_threshold(),
            async_pruning: false,
            cache_size: default_cache_size(),
            fast_cache_size: default_fast_cache_size(),
            skip_fast_storage_upgrade: false,
        }
    }
}

impl TreeOptions {
    /// Sets the durable-commit flag.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Sets the version used by the first `save_version` on an empty database.
    pub fn with_initial_version(mut self, version: u64) -> Self {
        self.initial_version = version;
        self
    }

    /// Sets the batch flush threshold in bytes.
    pub fn with_flush_threshold(mut self, threshold: usize) -> Self {
        self.flush_threshold = threshold;
        self
    }

    /// Enables or disables background pruning.
    pub fn with_async_pruning(mut self, enabled: bool) -> Self {
        self.async_pruning = enabled;
        self
    }

    /// Sets the node cache capacity.
    pub fn with_cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    /// Sets the fast-node cache capacity.
    pub fn with_fast_cache_size(mut self, size: usize) -> Self {
        self.fast_cache_size = size;
        self
    }

    /// Skips the fast index entirely.
    pub fn with_skip_fast_storage_upgrade(mut self, skip: bool) -> Self {
        self.skip_fast_storage_upgrade = skip;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let raw = r#"
            sync = true
            initial_version = 9
        "#;
        let opts: TreeOptions = toml::from_str(raw).unwrap();
        assert!(opts.sync);
        assert_eq!(opts.initial_version, 9);
        assert_eq!(opts.cache_size, 10_000);
        assert_eq!(opts.fast_cache_size, 100_000);
        assert_eq!(opts.flush_threshold, 100_000);
        assert!(!opts.async_pruning);
    }

    #[test]
    fn test_empty_toml_equals_default() {
        let opts: TreeOptions = toml::from_str("").unwrap();
        assert_eq!(opts, TreeOptions::default());
    }

    #[test]
    fn test_builders_and_json() {
        let opts = TreeOptions::default()
            .with_async_pruning(true)
            .with_skip_fast_storage_upgrade(true)
            .with_cache_size(0);
        let json = serde_json::to_string(&opts).unwrap();
        let back: TreeOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back, opts);
        assert!(back.async_pruning);
        assert!(back.skip_fast_storage_upgrade);
        assert_eq!(back.cache_size, 0);
    }
}
