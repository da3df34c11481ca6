// Path: crates/telemetry/src/lib.rs
#![cfg_attr(
    not(test),
    deny(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::panic,
        clippy::unimplemented,
        clippy::todo,
        clippy::indexing_slicing
    )
)]

//! # IAVL Telemetry
//!
//! Observability infrastructure for the IAVL tree: structured logging initialization,
//! abstract sinks that decouple metric instrumentation from the backend, a Prometheus
//! implementation of those sinks, and the per-tree cache hit/miss counters.

/// The initialization routine for global structured logging.
pub mod init;
/// The concrete implementation of metrics sinks using the `prometheus` crate.
pub mod prometheus;
/// Abstract traits (`*MetricsSink`) that define the contract for metrics reporting.
pub mod sinks;
/// Atomic cache hit/miss counters owned by a node database.
pub mod stats;
/// A simple RAII timer for measuring the duration of a scope.
pub mod time;

// Re-export the public helper functions for easy access to the global sinks.
pub use sinks::{error_metrics, storage_metrics, tree_metrics};
pub use stats::Statistics;
