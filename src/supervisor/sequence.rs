//! The graceful recycle sequence and its forceful fallback.
//!
//! [`Supervisor`] is the only component allowed to signal or relaunch the
//! inference server.  At most one sequence runs at a time; a second trigger
//! gets [`SupervisorError::SequenceInProgress`] instead of racing the first
//! on the same process.
//!
//! Every wait is bounded: drain, session stop, grace, kill wait, backoff and
//! the health gate all have a configured ceiling.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::time::{sleep, timeout, Instant};

use crate::admission::SharedGate;
use crate::backend::{SessionControl, SessionState};
use crate::config::SupervisorConfig;
use crate::queue::PriorityQueue;
use crate::supervisor::pid_file::PidFile;
use crate::supervisor::process::{
    matching_pids, resolve_by_signature, LaunchSpec, ProcessError, ProcessManager,
    ProcessSignature, Signal,
};
use crate::supervisor::state::{unix_secs, KillPhase, KillSequenceState, SupervisorHealth};

const DRAIN_POLL: Duration = Duration::from_millis(100);
const EXIT_POLL: Duration = Duration::from_millis(250);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SupervisorError {
    #[error("a recycle sequence is already running")]
    SequenceInProgress,

    #[error("restart failed after {attempts} attempts")]
    RestartExhausted { attempts: u32 },

    #[error("backend not healthy within {0:?}")]
    HealthGateTimeout(Duration),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

// ---------------------------------------------------------------------------
// WorkTracker
// ---------------------------------------------------------------------------

/// Reports already-admitted work so the drain phase knows when to stop
/// waiting.
pub trait WorkTracker: Send + Sync {
    fn in_flight(&self) -> usize;
}

impl<T> WorkTracker for PriorityQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn in_flight(&self) -> usize {
        self.running()
    }
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

pub struct Supervisor {
    config: SupervisorConfig,
    signature: ProcessSignature,
    processes: Arc<dyn ProcessManager>,
    sessions: Arc<dyn SessionControl>,
    gate: SharedGate,
    work: Arc<dyn WorkTracker>,
    pid_file: PidFile,
    state: Mutex<KillSequenceState>,
    sequence_lock: tokio::sync::Mutex<()>,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        processes: Arc<dyn ProcessManager>,
        sessions: Arc<dyn SessionControl>,
        gate: SharedGate,
        work: Arc<dyn WorkTracker>,
    ) -> Self {
        let pid_path = config.pid_file_path();
        Self {
            signature: ProcessSignature::from_config(&config),
            processes,
            sessions,
            gate,
            work,
            pid_file: PidFile::new(pid_path.clone()),
            state: Mutex::new(KillSequenceState::new(pid_path)),
            sequence_lock: tokio::sync::Mutex::new(()),
            config,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, KillSequenceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> KillSequenceState {
        self.lock_state().clone()
    }

    pub fn phase(&self) -> KillPhase {
        self.lock_state().phase
    }

    /// `true` while a sequence holds the single-sequence lock.
    pub fn is_running(&self) -> bool {
        self.sequence_lock.try_lock().is_err()
    }

    fn set_phase(&self, phase: KillPhase) {
        let mut state = self.lock_state();
        if state.phase != phase {
            log::info!("supervisor: {:?} → {:?}", state.phase, phase);
            state.phase = phase;
        }
    }

    /// Payload for the operational health endpoint.
    pub fn health(&self) -> SupervisorHealth {
        let state = self.state();
        SupervisorHealth {
            phase: state.phase,
            last_kill_time: state.last_kill_time.map(unix_secs),
            restart_attempts: state.restart_attempt,
            max_attempts: self.config.max_restart_attempts,
            serve_pid: self.pid_file.read(),
            pid_file_exists: self.pid_file.exists(),
            last_error: state.last_error,
        }
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Run the graceful sequence once.  No fallback.
    pub async fn run_sequence(&self) -> Result<(), SupervisorError> {
        let _running = self
            .sequence_lock
            .try_lock()
            .map_err(|_| SupervisorError::SequenceInProgress)?;
        let result = self.graceful().await;
        self.finish(&result);
        result
    }

    /// Kill every matching process immediately and relaunch, skipping the
    /// graceful phases and the backoff.
    pub async fn force_restart(&self) -> Result<(), SupervisorError> {
        let _running = self
            .sequence_lock
            .try_lock()
            .map_err(|_| SupervisorError::SequenceInProgress)?;
        let result = self.forceful().await;
        self.finish(&result);
        result
    }

    /// Graceful sequence, falling back to [`force_restart`](Self::force_restart)
    /// when it fails.  The lock is held across both so no other trigger can
    /// slip in between.
    pub async fn recycle(&self) -> Result<(), SupervisorError> {
        let _running = self
            .sequence_lock
            .try_lock()
            .map_err(|_| SupervisorError::SequenceInProgress)?;

        let result = match self.graceful().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.finish(&Err(e.clone()));
                log::error!("supervisor: graceful recycle failed ({e}), forcing restart");
                self.forceful().await
            }
        };
        self.finish(&result);
        result
    }

    fn finish(&self, result: &Result<(), SupervisorError>) {
        match result {
            Ok(()) => {
                self.set_phase(KillPhase::Ready);
                self.lock_state().last_error = None;
                self.gate.lock().release_supervisor_hold();
            }
            Err(e) => {
                self.set_phase(KillPhase::Failed);
                self.lock_state().last_error = Some(e.to_string());
                log::error!("supervisor: sequence failed: {e}; intake stays blocked");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Graceful path
    // -----------------------------------------------------------------------

    async fn graceful(&self) -> Result<(), SupervisorError> {
        {
            let mut state = self.lock_state();
            state.restart_attempt = 0;
            state.last_error = None;
        }

        self.set_phase(KillPhase::Draining);
        self.gate.lock().hold_for_supervisor();
        self.drain().await;

        self.set_phase(KillPhase::SessionShutdown);
        self.stop_sessions().await;

        self.set_phase(KillPhase::Terminating);
        self.terminate().await?;

        self.restart_with_backoff().await
    }

    async fn drain(&self) {
        let deadline = Instant::now() + self.config.drain_timeout();
        loop {
            let in_flight = self.work.in_flight();
            if in_flight == 0 {
                log::debug!("supervisor: drained");
                return;
            }
            if Instant::now() >= deadline {
                log::warn!("supervisor: drain timed out with {in_flight} execution(s) in flight");
                return;
            }
            sleep(DRAIN_POLL).await;
        }
    }

    /// Stop every active session.  Failures are logged and the sequence
    /// carries on to termination.
    async fn stop_sessions(&self) {
        let limit = self.config.session_stop_timeout();

        let sessions = match timeout(limit, self.sessions.list_sessions()).await {
            Ok(Ok(sessions)) => sessions,
            Ok(Err(e)) => {
                log::warn!("supervisor: could not list sessions: {e}");
                return;
            }
            Err(_) => {
                log::warn!("supervisor: listing sessions timed out");
                return;
            }
        };

        for session in sessions.iter().filter(|s| s.state == SessionState::Active) {
            match timeout(limit, self.sessions.stop_session(&session.model_name)).await {
                Ok(Ok(())) => log::info!("supervisor: stopped session {}", session.model_name),
                Ok(Err(e)) => log::warn!("supervisor: stopping {} failed: {e}", session.model_name),
                Err(_) => log::warn!("supervisor: stopping {} timed out", session.model_name),
            }
        }

        match timeout(limit, self.sessions.list_sessions()).await {
            Ok(Ok(remaining)) => {
                let live = remaining
                    .iter()
                    .filter(|s| s.state != SessionState::Stopped)
                    .count();
                if live > 0 {
                    log::warn!("supervisor: {live} session(s) still loaded, terminating anyway");
                }
            }
            _ => log::warn!("supervisor: could not confirm sessions stopped"),
        }
    }

    /// TERM, wait out the grace period, then KILL.
    async fn terminate(&self) -> Result<(), SupervisorError> {
        let processes = self.processes.list_processes().await?;
        let Some(pid) = resolve_by_signature(&processes, &self.signature, self.pid_file.read()) else {
            log::warn!(
                "supervisor: no `{} {}` process found, nothing to terminate",
                self.config.binary,
                self.config.serve_arg
            );
            self.clear_pid_file();
            return Ok(());
        };

        log::info!("supervisor: sending TERM to pid {pid}");
        self.signal(pid, Signal::Terminate).await?;
        let grace = self.config.grace_period();
        if self.wait_for_exit(pid, grace).await {
            self.clear_pid_file();
            return Ok(());
        }

        log::warn!("supervisor: pid {pid} still alive after {grace:?}, sending KILL");
        self.signal(pid, Signal::Kill).await?;
        if self.wait_for_exit(pid, self.config.kill_wait()).await {
            self.clear_pid_file();
            Ok(())
        } else {
            Err(ProcessError::Unkillable(pid).into())
        }
    }

    async fn restart_with_backoff(&self) -> Result<(), SupervisorError> {
        let spec = LaunchSpec::from_config(&self.config);
        let max = self.config.max_restart_attempts;

        loop {
            let attempt = self.lock_state().restart_attempt + 1;
            if attempt > max {
                return Err(SupervisorError::RestartExhausted { attempts: max });
            }
            {
                let mut state = self.lock_state();
                state.restart_attempt = attempt;
            }
            self.set_phase(KillPhase::Restarting);

            let delay = self.config.backoff_for(attempt);
            log::info!("supervisor: restart attempt {attempt}/{max} in {delay:?}");
            sleep(delay).await;

            match self.processes.spawn(&spec).await {
                Ok(pid) => {
                    if let Some(pid) = pid {
                        self.record_pid(pid);
                    }
                    self.set_phase(KillPhase::HealthGating);
                    match self.health_gate().await {
                        Ok(()) => return Ok(()),
                        Err(e) => {
                            log::warn!("supervisor: restart attempt {attempt} not healthy: {e}");
                            // A half-started server would hold the port for the next launch.
                            self.set_phase(KillPhase::Terminating);
                            self.terminate().await?;
                        }
                    }
                }
                Err(e) => log::warn!("supervisor: restart attempt {attempt} failed: {e}"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Forceful path
    // -----------------------------------------------------------------------

    async fn forceful(&self) -> Result<(), SupervisorError> {
        self.set_phase(KillPhase::Terminating);
        self.gate.lock().hold_for_supervisor();

        let processes = self.processes.list_processes().await?;
        let pids = matching_pids(&processes, &self.signature);
        for &pid in &pids {
            log::warn!("supervisor: force-killing pid {pid}");
            self.signal(pid, Signal::Kill).await?;
        }
        for &pid in &pids {
            if !self.wait_for_exit(pid, self.config.kill_wait()).await {
                return Err(ProcessError::Unkillable(pid).into());
            }
        }
        self.clear_pid_file();

        self.set_phase(KillPhase::Restarting);
        if let Some(pid) = self.processes.spawn(&LaunchSpec::from_config(&self.config)).await? {
            self.record_pid(pid);
        }

        self.set_phase(KillPhase::HealthGating);
        self.health_gate().await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Send `signal`, stamping `last_kill_time`.  A process that is already
    /// gone counts as delivered.
    async fn signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
        self.lock_state().last_kill_time = Some(SystemTime::now());
        match self.processes.send_signal(pid, signal).await {
            Ok(()) | Err(ProcessError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Poll until `pid` exits or `within` elapses.  `true` if it exited.
    async fn wait_for_exit(&self, pid: u32, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        loop {
            if !self.processes.is_alive(pid).await {
                log::info!("supervisor: pid {pid} exited");
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(EXIT_POLL).await;
        }
    }

    /// Readiness plus functional probe, retried until both pass or the
    /// health budget runs out.
    async fn health_gate(&self) -> Result<(), SupervisorError> {
        let budget = self.config.health_timeout();
        let poll = self.config.health_poll_interval();

        let passed = timeout(budget, async {
            while !self.check_ready().await {
                sleep(poll).await;
            }
        })
        .await;

        match passed {
            Ok(()) => {
                self.record_serving_pid().await;
                Ok(())
            }
            Err(_) => Err(SupervisorError::HealthGateTimeout(budget)),
        }
    }

    async fn check_ready(&self) -> bool {
        let limit = self.config.probe_timeout();
        match timeout(limit, self.sessions.readiness()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                log::debug!("supervisor: not ready yet: {e}");
                return false;
            }
            Err(_) => {
                log::debug!("supervisor: readiness check timed out");
                return false;
            }
        }
        match timeout(limit, self.sessions.probe(&self.config.probe_prompt)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                log::debug!("supervisor: probe failed: {e}");
                false
            }
            Err(_) => {
                log::debug!("supervisor: probe timed out");
                false
            }
        }
    }

    /// After a launch through a service manager the pid is unknown; find it
    /// by signature once the server answers.
    async fn record_serving_pid(&self) {
        let processes = match self.processes.list_processes().await {
            Ok(p) => p,
            Err(e) => {
                log::warn!("supervisor: could not list processes to record pid: {e}");
                return;
            }
        };
        match resolve_by_signature(&processes, &self.signature, self.pid_file.read()) {
            Some(pid) if self.pid_file.read() != Some(pid) => self.record_pid(pid),
            Some(_) => {}
            None => log::warn!("supervisor: server is healthy but no process matches the signature"),
        }
    }

    fn record_pid(&self, pid: u32) {
        match self.pid_file.write(pid) {
            Ok(()) => log::info!("supervisor: serving pid {pid}"),
            Err(e) => log::warn!(
                "supervisor: could not write PID file {}: {e}",
                self.pid_file.path().display()
            ),
        }
    }

    fn clear_pid_file(&self) {
        if let Err(e) = self.pid_file.remove() {
            log::warn!("supervisor: could not remove PID file: {e}");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionGate;
    use crate::backend::{BackendError, BackendSession};
    use crate::config::AdmissionConfig;
    use crate::supervisor::process::ProcessInfo;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    // -----------------------------------------------------------------------
    // Test doubles
    // -----------------------------------------------------------------------

    struct FakeProc {
        info: ProcessInfo,
        killed: bool,
        exits_at: Option<Instant>,
    }

    /// Processes that exit `term_delay` after TERM (never, when `None`) and
    /// immediately on KILL.
    struct FakeProcesses {
        procs: Mutex<Vec<FakeProc>>,
        term_delay: Option<Duration>,
        signals: Mutex<Vec<(u32, Signal, Instant)>>,
        spawn_results: Mutex<VecDeque<Result<Option<u32>, ProcessError>>>,
        spawns: Mutex<Vec<Instant>>,
        next_pid: AtomicUsize,
    }

    impl FakeProcesses {
        fn new(running: Vec<ProcessInfo>, term_delay: Option<Duration>) -> Arc<Self> {
            Arc::new(Self {
                procs: Mutex::new(
                    running
                        .into_iter()
                        .map(|info| FakeProc {
                            info,
                            killed: false,
                            exits_at: None,
                        })
                        .collect(),
                ),
                term_delay,
                signals: Mutex::new(Vec::new()),
                spawn_results: Mutex::new(VecDeque::new()),
                spawns: Mutex::new(Vec::new()),
                next_pid: AtomicUsize::new(1000),
            })
        }

        fn fail_spawns(&self, n: usize) {
            let mut results = self.spawn_results.lock().unwrap();
            for _ in 0..n {
                results.push_back(Err(ProcessError::Spawn {
                    program: "ollama".into(),
                    message: "address already in use".into(),
                }));
            }
        }

        fn signals(&self) -> Vec<(u32, Signal, Instant)> {
            self.signals.lock().unwrap().clone()
        }

        fn spawns(&self) -> Vec<Instant> {
            self.spawns.lock().unwrap().clone()
        }

        fn alive(p: &FakeProc) -> bool {
            !p.killed && p.exits_at.map_or(true, |t| Instant::now() < t)
        }
    }

    #[async_trait]
    impl ProcessManager for FakeProcesses {
        async fn list_processes(&self) -> Result<Vec<ProcessInfo>, ProcessError> {
            Ok(self
                .procs
                .lock()
                .unwrap()
                .iter()
                .filter(|p| Self::alive(p))
                .map(|p| p.info.clone())
                .collect())
        }

        async fn send_signal(&self, pid: u32, signal: Signal) -> Result<(), ProcessError> {
            let now = Instant::now();
            self.signals.lock().unwrap().push((pid, signal, now));
            let mut procs = self.procs.lock().unwrap();
            let p = procs
                .iter_mut()
                .find(|p| p.info.pid == pid && Self::alive(p))
                .ok_or(ProcessError::NotFound(pid))?;
            match signal {
                Signal::Terminate => {
                    if let Some(delay) = self.term_delay {
                        p.exits_at.get_or_insert(now + delay);
                    }
                }
                Signal::Kill => p.killed = true,
            }
            Ok(())
        }

        async fn is_alive(&self, pid: u32) -> bool {
            self.procs
                .lock()
                .unwrap()
                .iter()
                .any(|p| p.info.pid == pid && Self::alive(p))
        }

        async fn spawn(&self, _spec: &LaunchSpec) -> Result<Option<u32>, ProcessError> {
            self.spawns.lock().unwrap().push(Instant::now());
            let result = self.spawn_results.lock().unwrap().pop_front();
            let result = result.unwrap_or_else(|| Ok(Some(self.next_pid.fetch_add(1, Ordering::SeqCst) as u32)));
            if let Ok(Some(pid)) = result {
                self.procs.lock().unwrap().push(FakeProc {
                    info: ProcessInfo::new(pid, &["/usr/local/bin/ollama", "serve"]),
                    killed: false,
                    exits_at: None,
                });
            }
            result
        }
    }

    struct FakeSessions {
        sessions: Mutex<Vec<BackendSession>>,
        stopped: Mutex<Vec<String>>,
        ready: AtomicBool,
    }

    impl FakeSessions {
        fn with_models(models: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                sessions: Mutex::new(
                    models
                        .iter()
                        .enumerate()
                        .map(|(i, m)| BackendSession {
                            session_id: format!("s{i}"),
                            model_name: m.to_string(),
                            state: SessionState::Active,
                        })
                        .collect(),
                ),
                stopped: Mutex::new(Vec::new()),
                ready: AtomicBool::new(true),
            })
        }
    }

    #[async_trait]
    impl SessionControl for FakeSessions {
        async fn list_sessions(&self) -> Result<Vec<BackendSession>, BackendError> {
            Ok(self.sessions.lock().unwrap().clone())
        }

        async fn stop_session(&self, model_name: &str) -> Result<(), BackendError> {
            self.stopped.lock().unwrap().push(model_name.to_string());
            for s in self.sessions.lock().unwrap().iter_mut() {
                if s.model_name == model_name {
                    s.state = SessionState::Stopped;
                }
            }
            Ok(())
        }

        async fn readiness(&self) -> Result<(), BackendError> {
            if self.ready.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(BackendError::Request("connection refused".into()))
            }
        }

        async fn probe(&self, _prompt: &str) -> Result<String, BackendError> {
            Ok("OK".into())
        }
    }

    struct FakeWork(AtomicUsize);

    impl WorkTracker for FakeWork {
        fn in_flight(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        supervisor: Arc<Supervisor>,
        gate: SharedGate,
        work: Arc<FakeWork>,
        _dir: tempfile::TempDir,
    }

    fn harness(procs: &Arc<FakeProcesses>, sessions: &Arc<FakeSessions>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig {
            pid_file: Some(dir.path().join("serve.pid")),
            ..SupervisorConfig::default()
        };
        let gate = SharedGate::new(AdmissionGate::new(AdmissionConfig::default()));
        let work = Arc::new(FakeWork(AtomicUsize::new(0)));
        let supervisor = Arc::new(Supervisor::new(
            config,
            Arc::clone(procs) as Arc<dyn ProcessManager>,
            Arc::clone(sessions) as Arc<dyn SessionControl>,
            gate.clone(),
            Arc::clone(&work) as Arc<dyn WorkTracker>,
        ));
        Harness {
            supervisor,
            gate,
            work,
            _dir: dir,
        }
    }

    fn serve(pid: u32) -> ProcessInfo {
        ProcessInfo::new(pid, &["/usr/local/bin/ollama", "serve"])
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn graceful_sequence_with_two_sessions() {
        let procs = FakeProcesses::new(vec![serve(42)], Some(Duration::from_secs(1)));
        let sessions = FakeSessions::with_models(&["qwen2.5:1.5b", "qwen2.5:7b"]);
        let h = harness(&procs, &sessions);

        h.supervisor.run_sequence().await.unwrap();

        assert_eq!(*sessions.stopped.lock().unwrap(), vec!["qwen2.5:1.5b", "qwen2.5:7b"]);
        let signals = procs.signals();
        assert_eq!(signals.len(), 1);
        assert_eq!((signals[0].0, signals[0].1), (42, Signal::Terminate));

        assert_eq!(h.supervisor.phase(), KillPhase::Ready);
        assert!(!h.gate.lock().is_blocked());

        let health = h.supervisor.health();
        assert_eq!(health.serve_pid, Some(1000));
        assert!(health.pid_file_exists);
        assert_eq!(health.restart_attempts, 1);
        assert_eq!(health.max_attempts, 3);
        assert!(health.last_kill_time.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn kill_only_after_grace_period() {
        let procs = FakeProcesses::new(vec![serve(42)], Some(Duration::from_secs(6)));
        let sessions = FakeSessions::with_models(&[]);
        let h = harness(&procs, &sessions);

        h.supervisor.run_sequence().await.unwrap();

        let signals = procs.signals();
        assert_eq!(signals.len(), 2);
        assert_eq!(signals[0].1, Signal::Terminate);
        assert_eq!(signals[1].1, Signal::Kill);
        let waited = signals[1].2 - signals[0].2;
        assert!(waited >= Duration::from_secs(5), "escalated after {waited:?}");
        assert!(waited < Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_grows_between_attempts() {
        let procs = FakeProcesses::new(vec![serve(42)], Some(Duration::ZERO));
        procs.fail_spawns(1);
        let sessions = FakeSessions::with_models(&[]);
        let h = harness(&procs, &sessions);

        let started = Instant::now();
        h.supervisor.run_sequence().await.unwrap();

        let spawns = procs.spawns();
        assert_eq!(spawns.len(), 2);
        assert!(spawns[0] - started >= Duration::from_secs(5));
        let gap = spawns[1] - spawns[0];
        assert!(gap >= Duration::from_secs(15) && gap < Duration::from_secs(16), "{gap:?}");
        assert_eq!(h.supervisor.state().restart_attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_attempts_are_bounded() {
        let procs = FakeProcesses::new(vec![serve(42)], Some(Duration::ZERO));
        procs.fail_spawns(10);
        let sessions = FakeSessions::with_models(&[]);
        let h = harness(&procs, &sessions);

        let err = h.supervisor.run_sequence().await.unwrap_err();
        assert_eq!(err, SupervisorError::RestartExhausted { attempts: 3 });
        assert_eq!(procs.spawns().len(), 3);
        assert_eq!(h.supervisor.phase(), KillPhase::Failed);
        assert!(h.gate.lock().is_blocked());
        assert!(h.supervisor.health().last_error.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn never_signals_a_non_matching_process() {
        let procs = FakeProcesses::new(
            vec![
                ProcessInfo::new(10, &["ollama", "run", "qwen2.5:7b"]),
                ProcessInfo::new(11, &["/usr/local/bin/ollama", "serve", "--verbose"]),
                ProcessInfo::new(12, &["ollama-proxy", "serve"]),
                serve(42),
            ],
            Some(Duration::from_secs(1)),
        );
        let sessions = FakeSessions::with_models(&[]);
        let h = harness(&procs, &sessions);

        h.supervisor.run_sequence().await.unwrap();
        h.supervisor.force_restart().await.unwrap();

        let targets: Vec<u32> = procs.signals().iter().map(|s| s.0).collect();
        assert!(targets.iter().all(|pid| *pid == 42 || *pid >= 1000), "{targets:?}");
        assert!(targets.contains(&42));
    }

    #[tokio::test(start_paused = true)]
    async fn second_trigger_is_rejected_while_running() {
        let procs = FakeProcesses::new(vec![serve(42)], Some(Duration::ZERO));
        let sessions = FakeSessions::with_models(&[]);
        let h = harness(&procs, &sessions);
        h.work.0.store(1, Ordering::SeqCst);

        let sup = Arc::clone(&h.supervisor);
        let first = tokio::spawn(async move { sup.run_sequence().await });
        sleep(Duration::from_secs(1)).await;

        assert!(h.supervisor.is_running());
        assert_eq!(h.supervisor.phase(), KillPhase::Draining);
        assert!(h.gate.lock().is_blocked());
        assert_eq!(h.supervisor.run_sequence().await, Err(SupervisorError::SequenceInProgress));
        assert_eq!(h.supervisor.force_restart().await, Err(SupervisorError::SequenceInProgress));

        h.work.0.store(0, Ordering::SeqCst);
        first.await.unwrap().unwrap();
        assert_eq!(procs.signals().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_is_bounded() {
        let procs = FakeProcesses::new(vec![serve(42)], Some(Duration::ZERO));
        let sessions = FakeSessions::with_models(&[]);
        let h = harness(&procs, &sessions);
        h.work.0.store(5, Ordering::SeqCst);

        let started = Instant::now();
        h.supervisor.run_sequence().await.unwrap();
        let first_signal = procs.signals()[0].2;
        assert!(first_signal - started >= Duration::from_secs(8));
        assert!(first_signal - started < Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn unhealthy_launch_is_retried_after_backoff() {
        let procs = FakeProcesses::new(vec![serve(42)], Some(Duration::ZERO));
        let sessions = FakeSessions::with_models(&[]);
        sessions.ready.store(false, Ordering::SeqCst);
        let h = harness(&procs, &sessions);

        // The first launch answers only after its 60 s health budget.
        let late = Arc::clone(&sessions);
        tokio::spawn(async move {
            sleep(Duration::from_secs(70)).await;
            late.ready.store(true, Ordering::SeqCst);
        });

        h.supervisor.run_sequence().await.unwrap();

        let spawns = procs.spawns();
        assert_eq!(spawns.len(), 2);
        let gap = spawns[1] - spawns[0];
        assert!(gap >= Duration::from_secs(60 + 15), "{gap:?}");
        assert!(gap < Duration::from_secs(60 + 16), "{gap:?}");
        assert_eq!(h.supervisor.state().restart_attempt, 2);

        // The unhealthy instance was stopped before the relaunch.
        let signals = procs.signals();
        assert_eq!((signals[1].0, signals[1].1), (1000, Signal::Terminate));
        assert!(signals[1].2 < spawns[1]);
        assert_eq!(h.supervisor.health().serve_pid, Some(1001));
        assert!(!h.gate.lock().is_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn health_gate_failures_exhaust_attempts_and_keep_gate_blocked() {
        let procs = FakeProcesses::new(vec![serve(42)], Some(Duration::ZERO));
        let sessions = FakeSessions::with_models(&[]);
        sessions.ready.store(false, Ordering::SeqCst);
        let h = harness(&procs, &sessions);

        let err = h.supervisor.run_sequence().await.unwrap_err();
        assert_eq!(err, SupervisorError::RestartExhausted { attempts: 3 });
        assert_eq!(procs.spawns().len(), 3);
        assert_eq!(h.supervisor.phase(), KillPhase::Failed);
        assert!(h.gate.lock().is_blocked());

        // Once the server answers, a retry reopens intake.
        sessions.ready.store(true, Ordering::SeqCst);
        h.supervisor.run_sequence().await.unwrap();
        assert!(!h.gate.lock().is_blocked());
    }

    #[tokio::test(start_paused = true)]
    async fn recycle_falls_back_to_forceful_restart() {
        let procs = FakeProcesses::new(vec![serve(42)], Some(Duration::ZERO));
        procs.fail_spawns(3);
        let sessions = FakeSessions::with_models(&["qwen2.5:7b"]);
        let h = harness(&procs, &sessions);

        h.supervisor.recycle().await.unwrap();

        assert_eq!(procs.spawns().len(), 4);
        assert_eq!(h.supervisor.phase(), KillPhase::Ready);
        assert!(!h.gate.lock().is_blocked());
        assert_eq!(h.supervisor.health().serve_pid, Some(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_process_still_restarts() {
        let procs = FakeProcesses::new(Vec::new(), None);
        let sessions = FakeSessions::with_models(&[]);
        let h = harness(&procs, &sessions);

        h.supervisor.run_sequence().await.unwrap();
        assert!(procs.signals().is_empty());
        assert_eq!(procs.spawns().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_pid_file_is_not_trusted() {
        let procs = FakeProcesses::new(vec![ProcessInfo::new(7, &["vim"]), serve(42)], Some(Duration::ZERO));
        let sessions = FakeSessions::with_models(&[]);
        let h = harness(&procs, &sessions);
        PidFile::new(h.supervisor.state().pid_file_path).write(7).unwrap();

        h.supervisor.run_sequence().await.unwrap();
        assert_eq!(procs.signals()[0].0, 42);
    }
}
