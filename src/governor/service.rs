//! The governor façade: one entry point for requests, one for operators.
//!
//! # Request flow
//!
//! ```text
//! submit(request, prompt)
//!   └─▶ gate.decide (queue depth, token bucket, hysteresis)
//!         ├─ Deny  → SubmitError::Rejected(reason)
//!         └─ Allow → latency.start_tracking
//!                      └─▶ queue.submit (dedup join or new flight)
//!                            └─▶ router.dispatch (fast/deep, failover)
//!                                  ├─ Ok  → latency.record_ready, gate outcome ✓
//!                                  └─ Err → latency.fail,         gate outcome ✗
//! ```
//!
//! Callers of [`Governor::submit`] see either the shared inference result or
//! a [`SubmitError`] whose [`reason`](SubmitError::reason) is a stable
//! string.  Supervisor state never leaks into that path.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::admission::{
    AdmissionContext, AdmissionGate, BlockStatus, Decision, DenyReason, GateMetrics, GuardianState,
    SharedGate,
};
use crate::backend::{BackendHealth, BackendRole, BackendRouter, InferenceBackend, InferenceOutput, SessionControl};
use crate::config::GovernorConfig;
use crate::latency::{
    AssertionReport, LatencyAlert, LatencyError, LatencyMonitor, LatencyStats, MetricsAssertion,
    TtfaRecord,
};
use crate::queue::{PriorityQueue, QueueError, QueueStats};
use crate::request::{PriorityTier, Request, SourceType};
use crate::supervisor::{ProcessManager, Supervisor, SupervisorError, SupervisorHealth, WorkTracker};

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// What a `submit` caller can get back instead of a result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("rejected: {0}")]
    Rejected(DenyReason),

    #[error("inference failed: {0}")]
    Failed(String),

    #[error("governor is shutting down")]
    Cancelled,
}

impl SubmitError {
    /// Stable reason string for the request-handling layer.
    ///
    /// ```
    /// use inference_governor::admission::DenyReason;
    /// use inference_governor::governor::SubmitError;
    ///
    /// assert_eq!(SubmitError::Rejected(DenyReason::QueueFull).reason(), "queue_full");
    /// assert_eq!(SubmitError::Cancelled.reason(), "cancelled");
    /// ```
    pub fn reason(&self) -> &'static str {
        match self {
            SubmitError::Rejected(reason) => reason.as_str(),
            SubmitError::Failed(_) => "backend_error",
            SubmitError::Cancelled => "cancelled",
        }
    }
}

impl From<QueueError> for SubmitError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Rejected(reason) => SubmitError::Rejected(reason),
            QueueError::Execution(message) => SubmitError::Failed(message),
            QueueError::Cancelled => SubmitError::Cancelled,
        }
    }
}

/// A successful `submit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub request_id: String,
    pub text: String,
    pub backend: BackendRole,
    /// Served by the non-preferred backend.
    pub degraded: bool,
    /// Joined an identical in-flight request instead of running its own.
    pub coalesced: bool,
    pub tier: PriorityTier,
}

/// Aggregate payload for the operational health endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorHealth {
    pub gate: GuardianState,
    pub backends: BackendHealth,
    pub supervisor: SupervisorHealth,
}

// ---------------------------------------------------------------------------
// Governor
// ---------------------------------------------------------------------------

pub struct Governor {
    pub(crate) config: GovernorConfig,
    pub(crate) gate: SharedGate,
    pub(crate) queue: Arc<PriorityQueue<InferenceOutput>>,
    pub(crate) router: Arc<BackendRouter>,
    latency: Mutex<LatencyMonitor>,
    pub(crate) supervisor: Arc<Supervisor>,
    pub(crate) shutdown: CancellationToken,
}

impl Governor {
    /// Wire every component from `config`.
    ///
    /// `sessions` is the session-control view of the supervised server and
    /// `processes` the capability the supervisor uses to signal and relaunch
    /// it.
    pub fn new(
        config: GovernorConfig,
        fast: Arc<dyn InferenceBackend>,
        deep: Arc<dyn InferenceBackend>,
        sessions: Arc<dyn SessionControl>,
        processes: Arc<dyn ProcessManager>,
    ) -> Self {
        let gate = SharedGate::new(AdmissionGate::new(config.admission.clone()));
        let queue = Arc::new(PriorityQueue::new(config.queue.clone()));
        let router = Arc::new(BackendRouter::new(fast, deep, config.backends.clone()));
        let latency = Mutex::new(LatencyMonitor::new(config.latency.clone()));
        let supervisor = Arc::new(Supervisor::new(
            config.supervisor.clone(),
            processes,
            sessions,
            gate.clone(),
            Arc::clone(&queue) as Arc<dyn WorkTracker>,
        ));

        Self {
            config,
            gate,
            queue,
            router,
            latency,
            supervisor,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    pub fn gate(&self) -> &SharedGate {
        &self.gate
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    fn latency(&self) -> MutexGuard<'_, LatencyMonitor> {
        self.latency.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // -----------------------------------------------------------------------
    // Request path
    // -----------------------------------------------------------------------

    /// Admit, deduplicate, route and run `prompt` for `request`.
    pub async fn submit(
        &self,
        request: &Request,
        prompt: impl Into<String>,
    ) -> Result<SubmitResult, SubmitError> {
        if self.shutdown.is_cancelled() {
            return Err(SubmitError::Cancelled);
        }

        let source = request.source_type();
        let ctx = AdmissionContext {
            metrics: None,
            queue_depth: self.queue.waiting_depth(),
        };
        let decision = self.gate.lock().decide_at(&ctx, source, Instant::now());
        if let Decision::Deny(reason) = decision {
            return Err(SubmitError::Rejected(reason));
        }

        if let Err(e) = self
            .latency()
            .start_tracking(request.id(), source, request.text(), Instant::now())
        {
            log::warn!("latency: {e}");
        }

        let router = Arc::clone(&self.router);
        let owned = request.clone();
        let tier = request.tier(self.queue.config());
        let prompt = prompt.into();
        let started = Instant::now();

        let outcome = self
            .queue
            .submit(request, move || async move {
                router.dispatch(&owned, tier, &prompt).await
            })
            .await;

        let now = Instant::now();
        let mut latency = self.latency();
        match outcome {
            Ok(outcome) => {
                if let Err(e) = latency.record_stage(request.id(), "inference", now - started) {
                    log::warn!("latency: {e}");
                }
                if let Err(e) = latency.record_ready(request.id(), now) {
                    log::warn!("latency: {e}");
                }
                drop(latency);
                self.gate.lock().record_outcome(true);

                Ok(SubmitResult {
                    request_id: request.id().to_string(),
                    text: outcome.value.text,
                    backend: outcome.value.backend,
                    degraded: outcome.value.degraded,
                    coalesced: outcome.coalesced,
                    tier: outcome.tier,
                })
            }
            Err(QueueError::Rejected(reason)) => {
                if let Err(e) = latency.discard(request.id()) {
                    log::warn!("latency: {e}");
                }
                Err(SubmitError::Rejected(reason))
            }
            Err(e) => {
                if let Err(le) = latency.fail(request.id(), now) {
                    log::warn!("latency: {le}");
                }
                drop(latency);
                if !matches!(e, QueueError::Cancelled) {
                    self.gate.lock().record_outcome(false);
                }
                log::warn!("governor: {} failed: {e}", request.id());
                Err(e.into())
            }
        }
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn get_metrics(&self) -> GateMetrics {
        self.gate.lock().metrics(Instant::now())
    }

    pub fn gate_state(&self) -> GuardianState {
        self.gate.lock().state(Instant::now())
    }

    pub fn get_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Cached router health flags.
    pub fn health_check(&self) -> BackendHealth {
        self.router.health_check()
    }

    pub fn latency_stats(&self, window: Duration) -> LatencyStats {
        self.latency().stats(window, Instant::now())
    }

    pub fn latency_alerts(&self) -> Vec<LatencyAlert> {
        self.latency().alerts(Instant::now())
    }

    pub fn supervisor_health(&self) -> SupervisorHealth {
        self.supervisor.health()
    }

    pub fn health(&self) -> GovernorHealth {
        GovernorHealth {
            gate: self.gate_state(),
            backends: self.health_check(),
            supervisor: self.supervisor_health(),
        }
    }

    // -----------------------------------------------------------------------
    // TTFA reporting for work the governor does not run itself
    // -----------------------------------------------------------------------

    pub fn start_tracking(&self, request_id: &str, source: SourceType, text: &str) -> Result<(), LatencyError> {
        self.latency()
            .start_tracking(request_id, source, text, Instant::now())
    }

    pub fn record_stage(&self, request_id: &str, stage: &str, duration: Duration) -> Result<(), LatencyError> {
        self.latency().record_stage(request_id, stage, duration)
    }

    pub fn record_ready(&self, request_id: &str) -> Result<TtfaRecord, LatencyError> {
        self.latency().record_ready(request_id, Instant::now())
    }

    // -----------------------------------------------------------------------
    // Control surface
    // -----------------------------------------------------------------------

    pub fn block_intake(&self) -> BlockStatus {
        let status = self.gate.lock().block_intake();
        log::info!("governor: intake blocked by operator (blocks so far: {})", status.block_count);
        status
    }

    pub fn unblock_intake(&self) -> BlockStatus {
        let status = self.gate.lock().unblock_intake();
        log::info!("governor: intake unblocked by operator");
        status
    }

    pub fn assert_metrics(&self, assertion: &MetricsAssertion) -> AssertionReport {
        let report = self.latency().assert_metrics(assertion, Instant::now());
        if !report.passed {
            log::warn!("governor: metric assertion failed: {}", report.failures.join("; "));
        }
        report
    }

    /// Run the recycle sequence now (graceful, then forceful on failure).
    pub async fn recycle(&self) -> Result<(), SupervisorError> {
        self.supervisor.recycle().await
    }

    /// Start a recycle in the background unless one is already running.
    pub fn spawn_recycle(&self) -> Option<JoinHandle<Result<(), SupervisorError>>> {
        if self.supervisor.is_running() {
            log::info!("governor: recycle already in progress");
            return None;
        }
        let supervisor = Arc::clone(&self.supervisor);
        Some(tokio::spawn(async move { supervisor.recycle().await }))
    }

    /// Cancel in-flight executions and stop the background loops.
    pub fn shutdown(&self) {
        log::info!("governor: shutting down");
        self.shutdown.cancel();
        self.queue.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
