// Path: crates/telemetry/src/prometheus.rs
//! A concrete implementation of the metrics sinks using the Prometheus crate.

use crate::sinks::*;
use once_cell::sync::OnceCell;
use prometheus::{
    exponential_buckets, register_gauge, register_histogram_vec, register_int_counter,
    register_int_counter_vec, Gauge, HistogramVec, IntCounter, IntCounterVec,
};

// --- Metric Statics ---
// Collectors are initialized exactly once by `install`.

static TREE_LATEST_VERSION: OnceCell<Gauge> = OnceCell::new();
static TREE_NODES_SAVED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static TREE_NODES_PRUNED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static TREE_VERSIONS_DELETED_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static TREE_OPERATION_DURATION_SECONDS: OnceCell<HistogramVec> = OnceCell::new();
static STORAGE_BYTES_WRITTEN_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static STORAGE_BATCHES_COMMITTED_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();
static STORAGE_BATCH_FLUSHES_TOTAL: OnceCell<IntCounter> = OnceCell::new();
static ERRORS_TOTAL: OnceCell<IntCounterVec> = OnceCell::new();

#[derive(Debug, Clone, Copy)]
pub struct PrometheusSink;

/// Helper macro to reduce boilerplate for getting a metric from OnceCell.
/// Calls made before `install()` are dropped.
macro_rules! get_metric {
    ($metric:ident) => {
        match $metric.get() {
            Some(m) => m,
            None => return,
        }
    };
}

impl StorageMetricsSink for PrometheusSink {
    fn inc_bytes_written_total(&self, bytes: u64) {
        get_metric!(STORAGE_BYTES_WRITTEN_TOTAL).inc_by(bytes);
    }
    fn inc_batches_committed(&self, sync: bool) {
        let mode = if sync { "sync" } else { "async" };
        get_metric!(STORAGE_BATCHES_COMMITTED_TOTAL)
            .with_label_values(&[mode])
            .inc();
    }
    fn inc_batch_flushes(&self) {
        get_metric!(STORAGE_BATCH_FLUSHES_TOTAL).inc();
    }
}

impl TreeMetricsSink for PrometheusSink {
    fn inc_nodes_saved(&self, count: u64) {
        get_metric!(TREE_NODES_SAVED_TOTAL).inc_by(count);
    }
    fn inc_nodes_pruned(&self, count: u64) {
        get_metric!(TREE_NODES_PRUNED_TOTAL).inc_by(count);
    }
    fn inc_versions_deleted(&self, count: u64) {
        get_metric!(TREE_VERSIONS_DELETED_TOTAL).inc_by(count);
    }
    fn set_latest_version(&self, version: i64) {
        get_metric!(TREE_LATEST_VERSION).set(version as f64);
    }
    fn observe_operation_duration(&self, operation: &'static str, duration_secs: f64) {
        get_metric!(TREE_OPERATION_DURATION_SECONDS)
            .with_label_values(&[operation])
            .observe(duration_secs);
    }
}

impl ErrorMetricsSink for PrometheusSink {
    fn inc_error(&self, kind: &'static str, variant: &'static str) {
        get_metric!(ERRORS_TOTAL)
            .with_label_values(&[kind, variant])
            .inc();
    }
}

fn already_initialized() -> prometheus::Error {
    prometheus::Error::Msg("prometheus sink already installed".into())
}

/// Initializes all Prometheus metrics collectors, registers the sink globally and
/// returns a static reference to it. Must be called only once per process.
pub fn install() -> Result<&'static dyn MetricsSink, prometheus::Error> {
    TREE_LATEST_VERSION
        .set(register_gauge!(
            "iavl_tree_latest_version",
            "Latest version persisted by the tree."
        )?)
        .map_err(|_| already_initialized())?;
    TREE_NODES_SAVED_TOTAL
        .set(register_int_counter!(
            "iavl_tree_nodes_saved_total",
            "Total number of tree nodes persisted."
        )?)
        .map_err(|_| already_initialized())?;
    TREE_NODES_PRUNED_TOTAL
        .set(register_int_counter!(
            "iavl_tree_nodes_pruned_total",
            "Total number of orphaned tree nodes deleted by pruning."
        )?)
        .map_err(|_| already_initialized())?;
    TREE_VERSIONS_DELETED_TOTAL
        .set(register_int_counter!(
            "iavl_tree_versions_deleted_total",
            "Total number of versions deleted."
        )?)
        .map_err(|_| already_initialized())?;
    TREE_OPERATION_DURATION_SECONDS
        .set(register_histogram_vec!(
            "iavl_tree_operation_duration_seconds",
            "Latency of tree operations such as save_version and pruning.",
            &["operation"],
            exponential_buckets(0.0001, 2.0, 16)?
        )?)
        .map_err(|_| already_initialized())?;
    STORAGE_BYTES_WRITTEN_TOTAL
        .set(register_int_counter!(
            "iavl_storage_bytes_written_total",
            "Total bytes committed to the key-value backend."
        )?)
        .map_err(|_| already_initialized())?;
    STORAGE_BATCHES_COMMITTED_TOTAL
        .set(register_int_counter_vec!(
            "iavl_storage_batches_committed_total",
            "Total write batches committed, by durability mode.",
            &["mode"]
        )?)
        .map_err(|_| already_initialized())?;
    STORAGE_BATCH_FLUSHES_TOTAL
        .set(register_int_counter!(
            "iavl_storage_batch_flushes_total",
            "Total intermediate batch flushes forced by the size threshold."
        )?)
        .map_err(|_| already_initialized())?;
    ERRORS_TOTAL
        .set(register_int_counter_vec!(
            "iavl_errors_total",
            "Total number of errors, categorized by type and variant.",
            &["kind", "variant"]
        )?)
        .map_err(|_| already_initialized())?;

    static PROMETHEUS_SINK: PrometheusSink = PrometheusSink;
    // Ignore a previously registered sink; the collectors above are the source of truth.
    let _ = SINK.set(&PROMETHEUS_SINK);
    Ok(&PROMETHEUS_SINK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_registers_collectors() {
        let sink = install().unwrap();
        sink.inc_nodes_saved(3);
        sink.inc_batches_committed(true);
        sink.observe_operation_duration("save_version", 0.01);
        sink.set_latest_version(7);

        let families = prometheus::gather();
        let saved = families
            .iter()
            .find(|f| f.get_name() == "iavl_tree_nodes_saved_total")
            .unwrap();
        assert_eq!(saved.get_metric()[0].get_counter().get_value(), 3.0);

        // Global accessors now route to the installed sink.
        crate::tree_metrics().inc_nodes_saved(1);
        let families = prometheus::gather();
        let saved = families
            .iter()
            .find(|f| f.get_name() == "iavl_tree_nodes_saved_total")
            .unwrap();
        assert_eq!(saved.get_metric()[0].get_counter().get_value(), 4.0);

        assert!(install().is_err());
    }
}
