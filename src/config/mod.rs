//! Configuration module for the inference governor.
//!
//! Provides `GovernorConfig` (top-level settings), sub-configs for each
//! subsystem, `AppPaths` for cross-platform directories, and TOML
//! persistence via `GovernorConfig::load` / `GovernorConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AdmissionConfig, BackendConfig, BackendsConfig, GovernorConfig, LatencyConfig,
    LatencyTargets, QueueConfig, ServiceManagerConfig, SupervisorConfig,
};
