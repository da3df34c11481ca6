// Path: crates/state/src/metrics.rs
use iavl_telemetry::sinks::TreeMetricsSink;
use once_cell::sync::OnceCell;

/// Crate-local override; when unset the global telemetry sink is used.
pub static SINK: OnceCell<&'static dyn TreeMetricsSink> = OnceCell::new();

pub fn metrics() -> &'static dyn TreeMetricsSink {
    SINK.get()
        .copied()
        .unwrap_or_else(iavl_telemetry::tree_metrics)
}
