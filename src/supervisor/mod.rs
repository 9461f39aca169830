//! Lifecycle owner of the local inference server.
//!
//! This module provides:
//! * [`Supervisor`]: the graceful drain → stop sessions → terminate →
//!   restart → health-gate sequence, one at a time, with a forceful
//!   fallback.
//! * [`ProcessManager`]: the capability through which processes are listed,
//!   signalled and launched; [`SysinfoProcessManager`] in production.
//! * [`ProcessSignature`]: exact `<binary> serve` matching.
//! * [`PidFile`]: the pid of the process we launched.

pub mod pid_file;
pub mod process;
pub mod sequence;
pub mod state;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use pid_file::PidFile;
pub use process::{
    matching_pids, resolve_by_signature, LaunchSpec, ProcessError, ProcessInfo, ProcessManager,
    ProcessSignature, Signal, SysinfoProcessManager,
};
pub use sequence::{Supervisor, SupervisorError, WorkTracker};
pub use state::{KillPhase, KillSequenceState, SupervisorHealth};
