//! Metrics collection for the check relay.
//!
//! Provides Prometheus-compatible metrics for monitoring broker connectivity
//! and message throughput.

pub mod prometheus;

pub use prometheus::RelayMetrics;
