// Path: crates/storage/src/metrics/mod.rs
use iavl_telemetry::sinks::StorageMetricsSink;
use once_cell::sync::OnceCell;

/// Crate-local override; when unset the global telemetry sink is used.
pub static SINK: OnceCell<&'static dyn StorageMetricsSink> = OnceCell::new();

pub fn metrics() -> &'static dyn StorageMetricsSink {
    SINK.get()
        .copied()
        .unwrap_or_else(iavl_telemetry::storage_metrics)
}

/// Records a committed batch of `bytes` payload bytes.
pub(crate) fn record_commit(bytes: usize, sync: bool) {
    let sink = metrics();
    sink.inc_bytes_written_total(bytes as u64);
    sink.inc_batches_committed(sync);
}
