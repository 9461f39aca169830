//! Kill-sequence phases and the observable supervisor state.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// KillPhase
// ---------------------------------------------------------------------------

/// Phases of the graceful recycle sequence.
///
/// ```text
/// Idle ──trigger──▶ Draining ──▶ SessionShutdown ──▶ Terminating
///                                                        │
///          ┌─────────────────────────────────────────────┘
///          ▼
///      Restarting ──launched──▶ HealthGating ──ready+probe──▶ Ready
///        │  ▲  ▲                     │
///        │  │  └──────timeout────────┘ (launched instance stopped)
///        │  └──launch failed (next attempt, after backoff)
///        └──attempts exhausted──▶ Failed
/// ```
///
/// The admission gate is held `BLOCKED` from `Draining` until `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KillPhase {
    #[default]
    Idle,
    Draining,
    SessionShutdown,
    Terminating,
    Restarting,
    HealthGating,
    Ready,
    Failed,
}

impl KillPhase {
    /// `true` while a sequence is between its first and last phase.
    ///
    /// ```
    /// use inference_governor::supervisor::KillPhase;
    ///
    /// assert!(!KillPhase::Idle.is_running());
    /// assert!(KillPhase::Terminating.is_running());
    /// assert!(!KillPhase::Ready.is_running());
    /// assert!(!KillPhase::Failed.is_running());
    /// ```
    pub fn is_running(&self) -> bool {
        !matches!(self, KillPhase::Idle | KillPhase::Ready | KillPhase::Failed)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, KillPhase::Ready | KillPhase::Failed)
    }
}

// ---------------------------------------------------------------------------
// KillSequenceState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default)]
pub struct KillSequenceState {
    pub phase: KillPhase,
    /// Restart attempts made by the current (or last) sequence.
    pub restart_attempt: u32,
    /// When the last termination or kill signal was sent.
    pub last_kill_time: Option<SystemTime>,
    pub pid_file_path: PathBuf,
    /// Human-readable reason for the last `Failed`.
    pub last_error: Option<String>,
}

impl KillSequenceState {
    pub fn new(pid_file_path: PathBuf) -> Self {
        Self {
            pid_file_path,
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// SupervisorHealth
// ---------------------------------------------------------------------------

/// Payload for the operational health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorHealth {
    pub phase: KillPhase,
    /// Unix seconds.
    pub last_kill_time: Option<f64>,
    pub restart_attempts: u32,
    pub max_attempts: u32,
    pub serve_pid: Option<u32>,
    pub pid_file_exists: bool,
    pub last_error: Option<String>,
}

pub(crate) fn unix_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_serialises_screaming() {
        let json = serde_json::to_string(&KillPhase::SessionShutdown).unwrap();
        assert_eq!(json, "\"SESSION_SHUTDOWN\"");
    }

    #[test]
    fn health_payload_field_names() {
        let health = SupervisorHealth {
            phase: KillPhase::Ready,
            last_kill_time: Some(1_700_000_000.0),
            restart_attempts: 1,
            max_attempts: 3,
            serve_pid: Some(4242),
            pid_file_exists: true,
            last_error: None,
        };
        let v = serde_json::to_value(&health).unwrap();
        for key in ["last_kill_time", "restart_attempts", "max_attempts", "serve_pid", "pid_file_exists"] {
            assert!(v.get(key).is_some(), "missing {key}");
        }
        assert_eq!(v["phase"], "READY");
    }
}
