//! Time-to-first-audio (TTFA) telemetry.
//!
//! [`LatencyMonitor`] tracks each request from acceptance to the moment its
//! first playable output exists, keeps a rolling window of samples, and
//! reports per-source P50/P95/P99.  [`MetricsAssertion`] turns a window into
//! a pass/fail verdict for load tests and operators.

pub mod monitor;
pub mod stats;

pub use monitor::{LatencyError, LatencyMonitor, TtfaRecord};
pub use stats::{
    percentile, AssertionReport, LatencyAlert, LatencyStats, MetricResult, MetricsAssertion,
    SourceStats,
};
