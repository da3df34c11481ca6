// Path: crates/telemetry/src/sinks.rs
//! Defines abstract traits for metrics reporting, decoupling the tree from the backend.

use once_cell::sync::OnceCell;

// --- Static Sink Access ---

/// A no-op sink for use in tests or when telemetry is disabled.
#[derive(Debug, Clone, Copy)]
pub struct NopSink;

/// A lazily-initialized static reference to the global `MetricsSink` implementation.
pub static SINK: OnceCell<&'static dyn MetricsSink> = OnceCell::new();
static NOP_SINK: NopSink = NopSink;

/// Returns a static reference to the configured tree metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn tree_metrics() -> &'static dyn TreeMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured storage metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn storage_metrics() -> &'static dyn StorageMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

/// Returns a static reference to the configured error metrics sink.
/// If no sink has been initialized, it returns a no-op sink.
pub fn error_metrics() -> &'static dyn ErrorMetricsSink {
    SINK.get().copied().unwrap_or(&NOP_SINK)
}

// --- Trait Definitions ---

/// A sink for metrics related to the key-value backend.
pub trait StorageMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the total number of bytes committed through write batches.
    fn inc_bytes_written_total(&self, bytes: u64);
    /// Increments the number of batches committed, labeled by durability.
    fn inc_batches_committed(&self, sync: bool);
    /// Increments the number of intermediate batch flushes forced by the size threshold.
    fn inc_batch_flushes(&self);
}
impl StorageMetricsSink for NopSink {
    fn inc_bytes_written_total(&self, _bytes: u64) {}
    fn inc_batches_committed(&self, _sync: bool) {}
    fn inc_batch_flushes(&self) {}
}

/// A sink for metrics related to the versioned tree and its node database.
pub trait TreeMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments the number of nodes persisted by `save_version` or an import.
    fn inc_nodes_saved(&self, count: u64);
    /// Increments the number of orphaned nodes deleted by pruning.
    fn inc_nodes_pruned(&self, count: u64);
    /// Increments the number of versions deleted by pruning or rollback.
    fn inc_versions_deleted(&self, count: u64);
    /// Sets the gauge for the latest persisted version.
    fn set_latest_version(&self, version: i64);
    /// Observes the latency of a tree operation, labeled by operation name.
    fn observe_operation_duration(&self, operation: &'static str, duration_secs: f64);
}
impl TreeMetricsSink for NopSink {
    fn inc_nodes_saved(&self, _count: u64) {}
    fn inc_nodes_pruned(&self, _count: u64) {}
    fn inc_versions_deleted(&self, _count: u64) {}
    fn set_latest_version(&self, _version: i64) {}
    fn observe_operation_duration(&self, _operation: &'static str, _duration_secs: f64) {}
}

/// A sink for recording structured error metrics.
pub trait ErrorMetricsSink: Send + Sync + std::fmt::Debug {
    /// Increments a counter for a specific error, categorized by its kind and variant.
    fn inc_error(&self, kind: &'static str, variant: &'static str);
}
impl ErrorMetricsSink for NopSink {
    fn inc_error(&self, _kind: &'static str, _variant: &'static str) {}
}

/// A unified sink that implements all domain-specific traits, providing a single
/// point of implementation for metrics backends like Prometheus.
pub trait MetricsSink: StorageMetricsSink + TreeMetricsSink + ErrorMetricsSink {}

// Blanket implementation to allow any type that implements all sub-traits
// to be used as a `MetricsSink`.
impl<T> MetricsSink for T where T: StorageMetricsSink + TreeMetricsSink + ErrorMetricsSink {}
