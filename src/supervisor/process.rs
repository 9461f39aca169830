//! Process-management capability and exact signature matching.
//!
//! The supervisor never matches a process by a loose name.  A process is
//! ours only when its executable basename equals the configured binary and
//! its arguments are exactly `[serve_arg]`.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use thiserror::Error;

use crate::config::SupervisorConfig;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessError {
    #[error("no process with pid {0}")]
    NotFound(u32),

    #[error("failed to signal pid {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("failed to launch {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("pid {0} still alive after forceful kill")]
    Unkillable(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Signal {
    /// Polite termination request (SIGTERM).
    Terminate,
    /// Forceful kill (SIGKILL).
    Kill,
}

/// A running process as seen by the supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    /// Full command line, program first.
    pub cmd: Vec<String>,
}

impl ProcessInfo {
    pub fn new(pid: u32, cmd: &[&str]) -> Self {
        Self {
            pid,
            cmd: cmd.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// How to bring the server back up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchSpec {
    /// Ask a service manager to restart it (`systemctl`, `brew services`, ...).
    /// The new pid is discovered afterwards by signature.
    ServiceManager { program: String, args: Vec<String> },
    /// Launch the binary directly, detached from our stdio.
    Binary { program: String, args: Vec<String> },
}

impl LaunchSpec {
    /// Prefers the configured service manager over a raw launch.
    pub fn from_config(config: &SupervisorConfig) -> Self {
        match &config.service_manager {
            Some(sm) => LaunchSpec::ServiceManager {
                program: sm.program.clone(),
                args: sm.args.clone(),
            },
            None => LaunchSpec::Binary {
                program: config.binary.clone(),
                args: vec![config.serve_arg.clone()],
            },
        }
    }

    pub fn program(&self) -> &str {
        match self {
            LaunchSpec::ServiceManager { program, .. } | LaunchSpec::Binary { program, .. } => {
                program
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessManager
// ---------------------------------------------------------------------------

/// The only interface through which the supervisor touches processes.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, ProcessError>;

    async fn send_signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError>;

    async fn is_alive(&self, pid: u32) -> bool;

    /// Launch per `spec`.  Returns the new pid when it is known directly.
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Option<u32>, ProcessError>;
}

// ---------------------------------------------------------------------------
// ProcessSignature
// ---------------------------------------------------------------------------

/// Exact command signature of the supervised server: `<binary> <serve_arg>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSignature {
    binary: String,
    serve_arg: String,
}

impl ProcessSignature {
    pub fn new(binary: impl Into<String>, serve_arg: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            serve_arg: serve_arg.into(),
        }
    }

    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self::new(&config.binary, &config.serve_arg)
    }

    /// `true` only for `<…/binary> <serve_arg>` with no other arguments.
    ///
    /// ```
    /// use inference_governor::supervisor::{ProcessInfo, ProcessSignature};
    ///
    /// let sig = ProcessSignature::new("ollama", "serve");
    /// assert!(sig.matches(&ProcessInfo::new(7, &["/usr/local/bin/ollama", "serve"])));
    /// assert!(!sig.matches(&ProcessInfo::new(8, &["ollama", "run", "qwen2.5:7b"])));
    /// assert!(!sig.matches(&ProcessInfo::new(9, &["ollama-helper", "serve"])));
    /// ```
    pub fn matches(&self, process: &ProcessInfo) -> bool {
        let Some((program, args)) = process.cmd.split_first() else {
            return false;
        };
        basename(program) == basename(&self.binary)
            && args.len() == 1
            && args[0] == self.serve_arg
    }
}

fn basename(program: &str) -> &str {
    let name = Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program);
    name.strip_suffix(".exe").unwrap_or(name)
}

/// Every pid in `processes` that matches `signature`, ascending.
pub fn matching_pids(processes: &[ProcessInfo], signature: &ProcessSignature) -> Vec<u32> {
    let mut pids: Vec<u32> = processes
        .iter()
        .filter(|p| signature.matches(p))
        .map(|p| p.pid)
        .collect();
    pids.sort_unstable();
    pids
}

/// Pick the one process to terminate.
///
/// The PID-file pid wins when it still matches the signature; otherwise the
/// lowest matching pid.  A stale PID-file pid that no longer matches is
/// ignored.
pub fn resolve_by_signature(
    processes: &[ProcessInfo],
    signature: &ProcessSignature,
    recorded_pid: Option<u32>,
) -> Option<u32> {
    let pids = matching_pids(processes, signature);
    if let Some(pid) = recorded_pid.filter(|pid| pids.contains(pid)) {
        return Some(pid);
    }
    if pids.len() > 1 {
        log::warn!("supervisor: {} processes match the serve signature, picking pid {}", pids.len(), pids[0]);
    }
    pids.first().copied()
}

// ---------------------------------------------------------------------------
// SysinfoProcessManager
// ---------------------------------------------------------------------------

/// Production [`ProcessManager`]: `sysinfo` for enumeration and signals,
/// `tokio::process` for launching.
pub struct SysinfoProcessManager {
    system: Mutex<System>,
}

impl std::fmt::Debug for SysinfoProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SysinfoProcessManager").finish_non_exhaustive()
    }
}

impl SysinfoProcessManager {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for SysinfoProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessManager for SysinfoProcessManager {
    async fn list_processes(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
        let mut system = self.system();
        system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_cmd(UpdateKind::Always),
        );
        Ok(system
            .processes()
            .iter()
            .filter(|(_, p)| p.status() != ProcessStatus::Zombie)
            .map(|(pid, p)| ProcessInfo {
                pid: pid.as_u32(),
                cmd: p.cmd().iter().map(|a| a.to_string_lossy().into_owned()).collect(),
            })
            .collect())
    }

    async fn send_signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        let mut system = self.system();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        let process = system.process(sys_pid).ok_or(ProcessError::NotFound(pid))?;

        let sent = match signal {
            // Platforms without SIGTERM fall back to a hard kill.
            Signal::Terminate => process
                .kill_with(sysinfo::Signal::Term)
                .unwrap_or_else(|| process.kill()),
            Signal::Kill => process.kill_with(sysinfo::Signal::Kill).unwrap_or_else(|| process.kill()),
        };

        if sent {
            Ok(())
        } else {
            Err(ProcessError::Signal {
                pid,
                message: format!("{signal:?} was not delivered"),
            })
        }
    }

    async fn is_alive(&self, pid: u32) -> bool {
        let mut system = self.system();
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes(ProcessesToUpdate::Some(&[sys_pid]), true);
        system
            .process(sys_pid)
            .is_some_and(|p| p.status() != ProcessStatus::Zombie)
    }

    async fn spawn(&self, spec: &LaunchSpec) -> Result<Option<u32>, ProcessError> {
        let spawn_err = |e: std::io::Error| ProcessError::Spawn {
            program: spec.program().to_string(),
            message: e.to_string(),
        };

        match spec {
            LaunchSpec::ServiceManager { program, args } => {
                log::info!("supervisor: restarting via {program} {}", args.join(" "));
                let status = tokio::process::Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await
                    .map_err(spawn_err)?;
                if status.success() {
                    Ok(None)
                } else {
                    Err(ProcessError::Spawn {
                        program: program.clone(),
                        message: format!("exited with {status}"),
                    })
                }
            }
            LaunchSpec::Binary { program, args } => {
                log::info!("supervisor: launching {program} {}", args.join(" "));
                let child = tokio::process::Command::new(program)
                    .args(args)
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .spawn()
                    .map_err(spawn_err)?;
                Ok(child.id())
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceManagerConfig;

    fn sig() -> ProcessSignature {
        ProcessSignature::new("ollama", "serve")
    }

    #[test]
    fn exact_signature_only() {
        let s = sig();
        assert!(s.matches(&ProcessInfo::new(1, &["ollama", "serve"])));
        assert!(s.matches(&ProcessInfo::new(2, &["/opt/ollama/bin/ollama", "serve"])));

        assert!(!s.matches(&ProcessInfo::new(4, &["ollama"])));
        assert!(!s.matches(&ProcessInfo::new(5, &["ollama", "serve", "--verbose"])));
        assert!(!s.matches(&ProcessInfo::new(6, &["ollama", "run", "serve"])));
        assert!(!s.matches(&ProcessInfo::new(7, &["python", "ollama", "serve"])));
        assert!(!s.matches(&ProcessInfo::new(8, &["my-ollama", "serve"])));
        assert!(!s.matches(&ProcessInfo::new(9, &[])));
    }

    #[test]
    fn resolve_prefers_recorded_pid_when_it_matches() {
        let procs = vec![
            ProcessInfo::new(10, &["ollama", "serve"]),
            ProcessInfo::new(20, &["ollama", "serve"]),
            ProcessInfo::new(30, &["vim", "notes"]),
        ];
        assert_eq!(resolve_by_signature(&procs, &sig(), Some(20)), Some(20));
        assert_eq!(resolve_by_signature(&procs, &sig(), None), Some(10));
        // A recycled pid belonging to another program is ignored.
        assert_eq!(resolve_by_signature(&procs, &sig(), Some(30)), Some(10));
    }

    #[test]
    fn resolve_without_match_is_none() {
        let procs = vec![ProcessInfo::new(5, &["ollama", "run", "qwen2.5:1.5b"])];
        assert_eq!(resolve_by_signature(&procs, &sig(), Some(5)), None);
    }

    #[test]
    fn launch_spec_prefers_service_manager() {
        let mut cfg = SupervisorConfig::default();
        assert_eq!(
            LaunchSpec::from_config(&cfg),
            LaunchSpec::Binary {
                program: "ollama".into(),
                args: vec!["serve".into()]
            }
        );

        cfg.service_manager = Some(ServiceManagerConfig {
            program: "systemctl".into(),
            args: vec!["--user".into(), "restart".into(), "ollama".into()],
        });
        assert!(matches!(
            LaunchSpec::from_config(&cfg),
            LaunchSpec::ServiceManager { ref program, .. } if program == "systemctl"
        ));
    }

    #[tokio::test]
    async fn sysinfo_lists_this_process() {
        let pm = SysinfoProcessManager::new();
        let me = std::process::id();
        assert!(pm.is_alive(me).await);
        let procs = pm.list_processes().await.unwrap();
        assert!(procs.iter().any(|p| p.pid == me));
    }
}
