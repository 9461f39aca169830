//! Host resource samples consumed by the admission gate.
//!
//! The gate never samples the host itself; it is fed [`ResourceMetrics`] by
//! whoever owns a [`MetricsSource`].  [`SysinfoMetricsSource`] is the
//! production source backed by `sysinfo`.

use serde::{Deserialize, Serialize};
use sysinfo::System;

/// One CPU/RAM sample, both in percent (0.0 – 100.0).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResourceMetrics {
    pub cpu_pct: f64,
    pub ram_pct: f64,
}

impl ResourceMetrics {
    pub fn new(cpu_pct: f64, ram_pct: f64) -> Self {
        Self { cpu_pct, ram_pct }
    }

    /// `true` when CPU *and* RAM are strictly above their ceilings.
    pub fn exceeds(&self, cpu_ceiling_pct: f64, ram_ceiling_pct: f64) -> bool {
        self.cpu_pct > cpu_ceiling_pct && self.ram_pct > ram_ceiling_pct
    }
}

/// Anything that can produce host resource samples.
pub trait MetricsSource: Send {
    fn sample(&mut self) -> ResourceMetrics;
}

// ---------------------------------------------------------------------------
// SysinfoMetricsSource
// ---------------------------------------------------------------------------

/// Samples global CPU usage and RAM occupancy through `sysinfo`.
///
/// CPU usage is computed between two refreshes, so the very first sample
/// after construction may read low.
pub struct SysinfoMetricsSource {
    system: System,
}

impl std::fmt::Debug for SysinfoMetricsSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoMetricsSource").finish_non_exhaustive()
    }
}

impl SysinfoMetricsSource {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        system.refresh_memory();
        Self { system }
    }
}

impl Default for SysinfoMetricsSource {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSource for SysinfoMetricsSource {
    fn sample(&mut self) -> ResourceMetrics {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let cpu_pct = f64::from(self.system.global_cpu_usage());
        let total = self.system.total_memory();
        let ram_pct = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total as f64 * 100.0
        };

        ResourceMetrics { cpu_pct, ram_pct }
    }
}
