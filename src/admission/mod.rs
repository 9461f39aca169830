//! Admission control for the local inference backends.
//!
//! This module provides:
//! * [`AdmissionGate`]: allow/deny decisions with a token bucket, a
//!   queue-depth cap and OPEN/BLOCKED hysteresis.
//! * [`SharedGate`]: `Arc<Mutex<…>>` handle shared by the governor, the
//!   metrics sampler and the process supervisor.
//! * [`TokenBucket`]: burst + sustained rate limiter.
//! * [`ResourceMetrics`] / [`MetricsSource`]: CPU/RAM samples and the
//!   `sysinfo`-backed [`SysinfoMetricsSource`].

pub mod gate;
pub mod metrics;
pub mod rate_limit;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use gate::{
    AdmissionContext, AdmissionGate, BlockStatus, Decision, DenyReason, GateMetrics, GateMode,
    GuardianState, SharedGate,
};
pub use metrics::{MetricsSource, ResourceMetrics, SysinfoMetricsSource};
pub use rate_limit::TokenBucket;
