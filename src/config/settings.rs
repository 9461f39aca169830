//! Governor settings structs, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across tasks.
//! Every struct is `#[serde(default)]`, so a partial `settings.toml` only
//! overrides the keys it names.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;
use crate::request::SourceType;

// ---------------------------------------------------------------------------
// AdmissionConfig
// ---------------------------------------------------------------------------

/// Thresholds and rate limits for the admission gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Token-bucket capacity (maximum burst of back-to-back admissions).
    pub burst_capacity: u32,
    /// Token-bucket refill rate in requests per second.
    pub sustained_rps: f64,
    /// Requests waiting on in-flight work beyond which intake is refused.
    pub max_queue_depth: usize,
    /// CPU ceiling in percent; a check fails when CPU *and* RAM exceed
    /// their ceilings.
    pub cpu_ceiling_pct: f64,
    /// RAM ceiling in percent.
    pub ram_ceiling_pct: f64,
    /// How long failing checks must persist before the gate may block.
    pub emergency_window_secs: u64,
    /// Consecutive failed checks required to enter `BLOCKED`.
    pub block_after_failures: u32,
    /// Consecutive successful checks required to leave `BLOCKED`.
    pub unblock_after_successes: u32,
    /// Number of recent request outcomes kept for the success rate.
    pub outcome_window: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            burst_capacity: 8,
            sustained_rps: 4.0,
            max_queue_depth: 3,
            cpu_ceiling_pct: 85.0,
            ram_ceiling_pct: 80.0,
            emergency_window_secs: 10,
            block_after_failures: 3,
            unblock_after_successes: 1,
            outcome_window: 100,
        }
    }
}

impl AdmissionConfig {
    pub fn emergency_window(&self) -> Duration {
        Duration::from_secs(self.emergency_window_secs)
    }
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

/// Tier classification thresholds and single-flight settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Texts up to this many characters may be tier 0.
    pub tier0_max_chars: usize,
    /// Texts up to this many characters may be tier 1; longer is tier 2.
    pub tier1_max_chars: usize,
    /// In-flight executions allowed per tier, indexed by tier.
    pub tier_concurrency: [usize; 3],
    /// Coalescing window for identical requests, measured from the first
    /// arrival of a key.
    pub dedup_window_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tier0_max_chars: 130,
            tier1_max_chars: 200,
            tier_concurrency: [1, 1, 1],
            dedup_window_ms: 2_000,
        }
    }
}

impl QueueConfig {
    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}

// ---------------------------------------------------------------------------
// BackendConfig / BackendsConfig
// ---------------------------------------------------------------------------

/// Connection settings for one Ollama-compatible inference backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the server, e.g. `http://localhost:11434`.
    pub base_url: String,
    /// Model identifier sent with every request (e.g. `"qwen2.5:3b"`).
    pub model: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// Concurrent calls allowed through the pooled client.
    pub pool_size: usize,
    /// Ollama `keep_alive` sent with generate calls (e.g. `"5m"`).
    pub keep_alive: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".into(),
            model: "qwen2.5:3b".into(),
            timeout_secs: 30,
            pool_size: 2,
            keep_alive: "5m".into(),
        }
    }
}

/// The fast/deep backend pair plus routing settings.
///
/// Both default to the same supervised server, each with its own model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    /// Small, low-latency model used for short tier-0 requests.
    pub fast: BackendConfig,
    /// Larger model for everything else.
    pub deep: BackendConfig,
    /// Tier-0 texts shorter than this many characters may use `fast`.
    pub fast_max_chars: usize,
    /// Case-insensitive substrings that mark a request as complex.
    pub complex_markers: Vec<String>,
    /// Seconds between health polls of both backends.
    pub health_interval_secs: u64,
    /// Timeout for a single health poll.
    pub health_timeout_secs: u64,
}

impl Default for BackendsConfig {
    fn default() -> Self {
        Self {
            fast: BackendConfig {
                model: "qwen2.5:1.5b".into(),
                timeout_secs: 15,
                ..BackendConfig::default()
            },
            deep: BackendConfig {
                model: "qwen2.5:7b".into(),
                timeout_secs: 60,
                ..BackendConfig::default()
            },
            fast_max_chars: 120,
            complex_markers: [
                "explain",
                "why",
                "compare",
                "analy",
                "summar",
                "step by step",
                "translate",
                "```",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            health_interval_secs: 10,
            health_timeout_secs: 3,
        }
    }
}

impl BackendsConfig {
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// LatencyConfig
// ---------------------------------------------------------------------------

/// Per-source P95 time-to-first-audio targets, in seconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyTargets {
    pub chat: f64,
    pub notification: f64,
    pub email_summary: f64,
    pub email_segment: f64,
}

impl Default for LatencyTargets {
    fn default() -> Self {
        Self {
            chat: 3.0,
            notification: 3.0,
            email_summary: 6.0,
            email_segment: 10.0,
        }
    }
}

impl LatencyTargets {
    /// Target for `source` as a [`Duration`].
    ///
    /// A non-finite target falls back to the default for that source.
    pub fn for_source(&self, source: SourceType) -> Duration {
        let secs = *self.slot(source);
        let secs = if secs.is_finite() {
            secs
        } else {
            *Self::default().slot(source)
        };
        Duration::try_from_secs_f64(secs.max(0.0)).unwrap_or(Duration::ZERO)
    }

    fn slot(&self, source: SourceType) -> &f64 {
        match source {
            SourceType::Chat => &self.chat,
            SourceType::Notification => &self.notification,
            SourceType::EmailSummary => &self.email_summary,
            SourceType::EmailSegment => &self.email_segment,
        }
    }

    fn slot_mut(&mut self, source: SourceType) -> &mut f64 {
        match source {
            SourceType::Chat => &mut self.chat,
            SourceType::Notification => &mut self.notification,
            SourceType::EmailSummary => &mut self.email_summary,
            SourceType::EmailSegment => &mut self.email_segment,
        }
    }

    /// Replace `nan`/`inf` targets (valid TOML floats) with the defaults.
    fn sanitize(&mut self) {
        let defaults = Self::default();
        for source in SourceType::ALL {
            let secs = self.slot_mut(source);
            if !secs.is_finite() {
                let fallback = *defaults.slot(source);
                log::warn!(
                    "config: latency target for {} is {secs}, using {fallback}s",
                    source.as_str()
                );
                *secs = fallback;
            }
        }
    }
}

/// TTFA monitoring settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub targets: LatencyTargets,
    /// Completed records older than this are pruned.
    pub window_minutes: u64,
    /// Consecutive over-target requests of one source type that raise an
    /// alert.
    pub consecutive_breach_alert: u32,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            targets: LatencyTargets::default(),
            window_minutes: 60,
            consecutive_breach_alert: 3,
        }
    }
}

impl LatencyConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.window_minutes.saturating_mul(60))
    }
}

// ---------------------------------------------------------------------------
// SupervisorConfig
// ---------------------------------------------------------------------------

/// External command used to restart the server through a process manager
/// (e.g. `systemctl --user restart ollama`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceManagerConfig {
    pub program: String,
    pub args: Vec<String>,
}

/// Timeouts and limits for the graceful kill/restart sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Executable name (or absolute path) of the supervised server.
    pub binary: String,
    /// The single argument identifying the serving process.
    pub serve_arg: String,
    /// Preferred restart path; `None` launches `binary serve_arg` directly.
    pub service_manager: Option<ServiceManagerConfig>,
    pub drain_timeout_secs: u64,
    pub session_stop_timeout_secs: u64,
    /// Wait after the termination signal before escalating.
    pub grace_period_secs: u64,
    /// Wait after the forceful signal before giving up on the old process.
    pub kill_wait_secs: u64,
    /// Delay before each restart attempt; the last entry repeats.
    pub backoff_secs: Vec<u64>,
    pub max_restart_attempts: u32,
    /// Budget for readiness + functional probe after a launch.
    pub health_timeout_secs: u64,
    pub health_poll_interval_ms: u64,
    /// Per-call timeout for readiness and probe requests.
    pub probe_timeout_secs: u64,
    /// Prompt sent as the minimal functional probe.
    pub probe_prompt: String,
    /// PID file location; `None` uses the platform data dir.
    pub pid_file: Option<PathBuf>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            binary: "ollama".into(),
            serve_arg: "serve".into(),
            service_manager: None,
            drain_timeout_secs: 8,
            session_stop_timeout_secs: 5,
            grace_period_secs: 5,
            kill_wait_secs: 5,
            backoff_secs: vec![5, 15, 60],
            max_restart_attempts: 3,
            health_timeout_secs: 60,
            health_poll_interval_ms: 1_000,
            probe_timeout_secs: 10,
            probe_prompt: "Reply with OK.".into(),
            pid_file: None,
        }
    }
}

impl SupervisorConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn session_stop_timeout(&self) -> Duration {
        Duration::from_secs(self.session_stop_timeout_secs)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn kill_wait(&self) -> Duration {
        Duration::from_secs(self.kill_wait_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn health_poll_interval(&self) -> Duration {
        Duration::from_millis(self.health_poll_interval_ms.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Delay before restart attempt `attempt` (1-based).
    ///
    /// Indexes into `backoff_secs`, repeating the last entry once the list
    /// is exhausted and never decreasing.
    ///
    /// ```
    /// use inference_governor::config::SupervisorConfig;
    /// use std::time::Duration;
    ///
    /// let cfg = SupervisorConfig::default();
    /// assert_eq!(cfg.backoff_for(1), Duration::from_secs(5));
    /// assert_eq!(cfg.backoff_for(2), Duration::from_secs(15));
    /// assert_eq!(cfg.backoff_for(9), Duration::from_secs(60));
    /// ```
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let idx = (attempt.max(1) - 1) as usize;
        let secs = self
            .backoff_secs
            .iter()
            .take(idx + 1)
            .copied()
            .max()
            .unwrap_or(0);
        Duration::from_secs(secs)
    }

    /// Resolved PID file path.
    pub fn pid_file_path(&self) -> PathBuf {
        self.pid_file
            .clone()
            .unwrap_or_else(|| AppPaths::new().pid_file)
    }
}

// ---------------------------------------------------------------------------
// GovernorConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use inference_governor::config::GovernorConfig;
///
/// // Load (returns Default when file is missing)
/// let config = GovernorConfig::load().unwrap();
///
/// // Modify and save
/// // config.save().unwrap();
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    /// Seconds between host resource samples fed to the admission gate.
    pub metrics_interval_secs: u64,
    pub admission: AdmissionConfig,
    pub queue: QueueConfig,
    pub backends: BackendsConfig,
    pub latency: LatencyConfig,
    pub supervisor: SupervisorConfig,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 1,
            admission: AdmissionConfig::default(),
            queue: QueueConfig::default(),
            backends: BackendsConfig::default(),
            latency: LatencyConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl GovernorConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(GovernorConfig::default())` when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let mut config: Self = toml::from_str(&content)?;
        if config.metrics_interval_secs == 0 {
            config.metrics_interval_secs = 1;
        }
        config.latency.targets.sanitize();
        Ok(config)
    }

    /// Save configuration to the platform-appropriate `settings.toml`,
    /// creating parent directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs.max(1))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trip_toml() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("settings.toml");

        let original = GovernorConfig::default();
        original.save_to(&path).expect("save");

        let loaded = GovernorConfig::load_from(&path).expect("load");
        assert_eq!(original.admission, loaded.admission);
        assert_eq!(original.queue, loaded.queue);
        assert_eq!(original.backends, loaded.backends);
        assert_eq!(original.supervisor, loaded.supervisor);
    }

    /// `load_from` on a non-existent path must return `Default` without error.
    #[test]
    fn load_missing_returns_default() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("nonexistent.toml");

        let config = GovernorConfig::load_from(&path).expect("should not error");
        assert_eq!(config.admission.burst_capacity, 8);
        assert_eq!(config.queue.tier0_max_chars, 130);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("partial.toml");
        std::fs::write(
            &path,
            "[supervisor]\nmax_restart_attempts = 5\n\n[admission]\nsustained_rps = 2.5\n",
        )
        .unwrap();

        let cfg = GovernorConfig::load_from(&path).expect("load");
        assert_eq!(cfg.supervisor.max_restart_attempts, 5);
        assert_eq!(cfg.supervisor.grace_period_secs, 5);
        assert!((cfg.admission.sustained_rps - 2.5).abs() < f64::EPSILON);
        assert_eq!(cfg.admission.burst_capacity, 8);
        assert_eq!(cfg.metrics_interval_secs, 1);
    }

    #[test]
    fn non_finite_latency_targets_fall_back_to_defaults() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("targets.toml");
        std::fs::write(
            &path,
            "[latency.targets]\nchat = inf\nnotification = nan\nemail_summary = 4.5\n",
        )
        .unwrap();

        let cfg = GovernorConfig::load_from(&path).expect("load");
        let targets = &cfg.latency.targets;
        assert_eq!(targets.for_source(SourceType::Chat), Duration::from_secs(3));
        assert_eq!(targets.for_source(SourceType::Notification), Duration::from_secs(3));
        assert_eq!(targets.for_source(SourceType::EmailSummary), Duration::from_millis(4500));

        // Values set in code skip `load_from`; they must not panic either.
        let raw = LatencyTargets {
            chat: f64::INFINITY,
            notification: f64::NAN,
            email_summary: -1.0,
            ..LatencyTargets::default()
        };
        assert_eq!(raw.for_source(SourceType::Chat), Duration::from_secs(3));
        assert_eq!(raw.for_source(SourceType::Notification), Duration::from_secs(3));
        assert_eq!(raw.for_source(SourceType::EmailSummary), Duration::ZERO);
    }

    #[test]
    fn default_values() {
        let cfg = GovernorConfig::default();

        assert_eq!(cfg.admission.burst_capacity, 8);
        assert_eq!(cfg.admission.max_queue_depth, 3);
        assert_eq!(cfg.admission.block_after_failures, 3);
        assert_eq!(cfg.admission.unblock_after_successes, 1);
        assert_eq!(cfg.queue.tier_concurrency, [1, 1, 1]);
        assert_eq!(cfg.queue.dedup_window(), Duration::from_secs(2));
        assert_eq!(cfg.supervisor.backoff_secs, vec![5, 15, 60]);
        assert_eq!(cfg.supervisor.max_restart_attempts, 3);
        assert_eq!(
            cfg.latency.targets.for_source(SourceType::Chat),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn backoff_never_decreases() {
        let cfg = SupervisorConfig {
            backoff_secs: vec![5, 3, 60],
            ..SupervisorConfig::default()
        };
        let delays: Vec<_> = (1..=5).map(|a| cfg.backoff_for(a)).collect();
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(delays[1], Duration::from_secs(5));
    }

    #[test]
    fn round_trip_service_manager() {
        let dir = tempdir().expect("temp dir");
        let path = dir.path().join("svc.toml");

        let mut cfg = GovernorConfig::default();
        cfg.supervisor.service_manager = Some(ServiceManagerConfig {
            program: "systemctl".into(),
            args: vec!["--user".into(), "restart".into(), "ollama".into()],
        });
        cfg.supervisor.pid_file = Some(dir.path().join("serve.pid"));
        cfg.save_to(&path).expect("save");

        let loaded = GovernorConfig::load_from(&path).expect("load");
        assert_eq!(loaded.supervisor.service_manager, cfg.supervisor.service_manager);
        assert_eq!(loaded.supervisor.pid_file_path(), dir.path().join("serve.pid"));
    }
}
