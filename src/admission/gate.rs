//! Admission gate with hysteresis.
//!
//! [`AdmissionGate`] answers one question per request: may it enter?  It
//! combines three independent checks, evaluated in this order:
//!
//! 1. **Mode**: while `BLOCKED`, every request is denied `emergency_block`.
//! 2. **Queue depth**: more callers waiting than `max_queue_depth` → `queue_full`.
//! 3. **Token bucket**: burst/sustained rate exceeded → `rate_limited`.
//!
//! # Mode transitions
//!
//! ```text
//!            N consecutive failed checks, failing for >= emergency window
//!   OPEN ─────────────────────────────────────────────────────────────▶ BLOCKED
//!        ◀─────────────────────────────────────────────────────────────
//!            M consecutive successful checks (and no hold in place)
//! ```
//!
//! A check is a resource sample ([`observe`](AdmissionGate::observe)) or a
//! backend health result ([`record_check`](AdmissionGate::record_check)).
//! With the defaults N = 3, M = 1: the gate resists flapping into `BLOCKED`
//! but reopens as soon as the resource is healthy again.
//!
//! Two holds keep the gate `BLOCKED` independently of the hysteresis
//! counters: the operator hold ([`block_intake`](AdmissionGate::block_intake))
//! and the supervisor hold ([`hold_for_supervisor`](AdmissionGate::hold_for_supervisor)).
//!
//! The gate has no side effects beyond its own counters; it never touches
//! the backend process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::admission::metrics::ResourceMetrics;
use crate::admission::rate_limit::TokenBucket;
use crate::config::AdmissionConfig;
use crate::request::SourceType;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Gate mode as seen by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateMode {
    Open,
    Blocked,
}

/// Structured reason a request was turned away.  All variants are
/// recoverable; callers retry later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    #[error("rate_limited")]
    RateLimited,
    #[error("queue_full")]
    QueueFull,
    #[error("emergency_block")]
    EmergencyBlocked,
    /// The request's tier is saturated and no identical request is in
    /// flight.
    #[error("busy")]
    TierBusy,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::RateLimited => "rate_limited",
            DenyReason::QueueFull => "queue_full",
            DenyReason::EmergencyBlocked => "emergency_block",
            DenyReason::TierBusy => "busy",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

/// Inputs to a single admission decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdmissionContext {
    /// Fresh resource sample, if the caller has one.  It is observed as a
    /// check before deciding.
    pub metrics: Option<ResourceMetrics>,
    /// Callers currently waiting on in-flight work.
    pub queue_depth: usize,
}

/// Snapshot of the hysteresis state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardianState {
    pub mode: GateMode,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub current_rps: f64,
    /// Tokens left in the burst bucket.
    pub burst_tokens: f64,
    pub operator_hold: bool,
    pub supervisor_hold: bool,
}

/// Introspection payload for the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateMetrics {
    /// Share of recent request outcomes that succeeded (1.0 with no data).
    pub success_rate: f64,
    /// Transitions into `BLOCKED` since start, whatever the cause.
    pub emergency_blocks: u64,
    pub current_rps: f64,
    pub mode: GateMode,
    pub total_decisions: u64,
    pub denied: HashMap<String, u64>,
}

/// Result of the operator "block intake" control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub blocked: bool,
    /// Unix seconds when the current operator hold began.
    pub blocked_at: Option<f64>,
    /// Cumulative count of transitions into `BLOCKED`.
    pub block_count: u64,
}

// ---------------------------------------------------------------------------
// AdmissionGate
// ---------------------------------------------------------------------------

/// Allow/deny decisions with rate limiting and hysteresis.
///
/// All methods taking `now` are deterministic; the convenience wrappers
/// without it read the clock.
#[derive(Debug)]
pub struct AdmissionGate {
    config: AdmissionConfig,
    bucket: TokenBucket,
    /// Hysteresis verdict: `true` once N failures have been sustained.
    emergency: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    failing_since: Option<Instant>,
    operator_hold: Option<SystemTime>,
    supervisor_hold: bool,
    block_count: u64,
    admitted: VecDeque<Instant>,
    outcomes: VecDeque<bool>,
    total_decisions: u64,
    denied: HashMap<DenyReason, u64>,
}

impl AdmissionGate {
    pub fn new(config: AdmissionConfig) -> Self {
        let bucket = TokenBucket::new(config.burst_capacity, config.sustained_rps, Instant::now());
        Self {
            bucket,
            emergency: false,
            consecutive_failures: 0,
            consecutive_successes: 0,
            failing_since: None,
            operator_hold: None,
            supervisor_hold: false,
            block_count: 0,
            admitted: VecDeque::new(),
            outcomes: VecDeque::with_capacity(config.outcome_window),
            total_decisions: 0,
            denied: HashMap::new(),
            config,
        }
    }

    // -----------------------------------------------------------------------
    // Mode
    // -----------------------------------------------------------------------

    pub fn mode(&self) -> GateMode {
        if self.emergency || self.operator_hold.is_some() || self.supervisor_hold {
            GateMode::Blocked
        } else {
            GateMode::Open
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.mode() == GateMode::Blocked
    }

    /// Run `f`, logging and counting a transition into `BLOCKED` if it
    /// caused one.
    fn tracking_transition(&mut self, cause: &str, f: impl FnOnce(&mut Self)) {
        let before = self.mode();
        f(self);
        let after = self.mode();
        if before != after {
            match after {
                GateMode::Blocked => {
                    self.block_count += 1;
                    log::warn!("gate: OPEN → BLOCKED ({cause})");
                }
                GateMode::Open => log::info!("gate: BLOCKED → OPEN ({cause})"),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Checks (hysteresis inputs)
    // -----------------------------------------------------------------------

    /// Feed one resource sample.  A sample fails the check when CPU and RAM
    /// both exceed their ceilings.
    pub fn observe(&mut self, metrics: &ResourceMetrics, now: Instant) -> GateMode {
        let healthy = !metrics.exceeds(self.config.cpu_ceiling_pct, self.config.ram_ceiling_pct);
        self.record_check(healthy, now)
    }

    /// Feed one health/resource check outcome.
    pub fn record_check(&mut self, healthy: bool, now: Instant) -> GateMode {
        self.tracking_transition("health checks", |gate| {
            if healthy {
                gate.consecutive_successes = gate.consecutive_successes.saturating_add(1);
                gate.consecutive_failures = 0;
                gate.failing_since = None;
                if gate.emergency && gate.consecutive_successes >= gate.config.unblock_after_successes {
                    gate.emergency = false;
                }
            } else {
                gate.consecutive_failures = gate.consecutive_failures.saturating_add(1);
                gate.consecutive_successes = 0;
                let since = *gate.failing_since.get_or_insert(now);
                let sustained = now.saturating_duration_since(since) >= gate.config.emergency_window();
                if !gate.emergency
                    && gate.consecutive_failures >= gate.config.block_after_failures
                    && sustained
                {
                    gate.emergency = true;
                }
            }
        });
        self.mode()
    }

    /// `true` when the last hysteresis verdict is an emergency (ignores
    /// holds).
    pub fn in_emergency(&self) -> bool {
        self.emergency
    }

    // -----------------------------------------------------------------------
    // Decisions
    // -----------------------------------------------------------------------

    /// Decide using the current clock.
    pub fn decide(&mut self, ctx: &AdmissionContext, class: SourceType) -> Decision {
        self.decide_at(ctx, class, Instant::now())
    }

    /// Decide whether a request of `class` may enter.
    pub fn decide_at(&mut self, ctx: &AdmissionContext, class: SourceType, now: Instant) -> Decision {
        if let Some(metrics) = ctx.metrics {
            self.observe(&metrics, now);
        }

        self.total_decisions += 1;
        let decision = if self.is_blocked() {
            Decision::Deny(DenyReason::EmergencyBlocked)
        } else if ctx.queue_depth > self.config.max_queue_depth {
            Decision::Deny(DenyReason::QueueFull)
        } else if !self.bucket.try_acquire(now) {
            Decision::Deny(DenyReason::RateLimited)
        } else {
            Decision::Allow
        };

        match decision {
            Decision::Allow => self.admitted.push_back(now),
            Decision::Deny(reason) => {
                *self.denied.entry(reason).or_insert(0) += 1;
                log::debug!("gate: denied {class} request ({reason})");
            }
        }
        self.prune_admitted(now);
        decision
    }

    /// Record whether an admitted request ultimately succeeded.
    pub fn record_outcome(&mut self, success: bool) {
        if self.config.outcome_window == 0 {
            return;
        }
        while self.outcomes.len() >= self.config.outcome_window {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(success);
    }

    fn prune_admitted(&mut self, now: Instant) {
        while let Some(&front) = self.admitted.front() {
            if now.saturating_duration_since(front) >= Duration::from_secs(1) {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Holds
    // -----------------------------------------------------------------------

    /// Operator "block intake".  Idempotent: a second call keeps the
    /// original timestamp and does not count another block.
    pub fn block_intake(&mut self) -> BlockStatus {
        if self.operator_hold.is_none() {
            self.tracking_transition("operator block", |gate| {
                gate.operator_hold = Some(SystemTime::now());
            });
        }
        self.block_status()
    }

    /// Operator "unblock intake".  Clears the operator hold and resets the
    /// hysteresis counters.  A supervisor hold, if any, stays in place.
    pub fn unblock_intake(&mut self) -> BlockStatus {
        let now = Instant::now();
        self.tracking_transition("operator unblock", |gate| {
            gate.operator_hold = None;
            gate.emergency = false;
            gate.consecutive_failures = 0;
            gate.consecutive_successes = 0;
            gate.failing_since = None;
            gate.bucket.reset(now);
        });
        self.block_status()
    }

    pub fn block_status(&self) -> BlockStatus {
        BlockStatus {
            blocked: self.is_blocked(),
            blocked_at: self.operator_hold.map(unix_secs),
            block_count: self.block_count,
        }
    }

    /// Force `BLOCKED` for the duration of a supervisor sequence.
    pub fn hold_for_supervisor(&mut self) {
        if !self.supervisor_hold {
            self.tracking_transition("supervisor hold", |gate| gate.supervisor_hold = true);
        }
    }

    /// Lift the supervisor hold after the backend passed its health gate.
    ///
    /// A healthy backend also clears the emergency verdict.
    pub fn release_supervisor_hold(&mut self) {
        self.tracking_transition("supervisor ready", |gate| {
            gate.supervisor_hold = false;
            gate.emergency = false;
            gate.consecutive_failures = 0;
            gate.failing_since = None;
        });
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn state(&mut self, now: Instant) -> GuardianState {
        self.prune_admitted(now);
        GuardianState {
            mode: self.mode(),
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            current_rps: self.admitted.len() as f64,
            burst_tokens: self.bucket.available(now),
            operator_hold: self.operator_hold.is_some(),
            supervisor_hold: self.supervisor_hold,
        }
    }

    pub fn metrics(&mut self, now: Instant) -> GateMetrics {
        self.prune_admitted(now);
        let success_rate = if self.outcomes.is_empty() {
            1.0
        } else {
            self.outcomes.iter().filter(|ok| **ok).count() as f64 / self.outcomes.len() as f64
        };
        GateMetrics {
            success_rate,
            emergency_blocks: self.block_count,
            current_rps: self.admitted.len() as f64,
            mode: self.mode(),
            total_decisions: self.total_decisions,
            denied: self
                .denied
                .iter()
                .map(|(reason, count)| (reason.as_str().to_string(), *count))
                .collect(),
        }
    }
}

fn unix_secs(t: SystemTime) -> f64 {
    t.duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// SharedGate
// ---------------------------------------------------------------------------

/// Thread-safe handle to an [`AdmissionGate`].
///
/// Cheap to clone.  The lock is only held for the duration of a single
/// gate call, never across an `.await`.
#[derive(Debug, Clone)]
pub struct SharedGate(Arc<Mutex<AdmissionGate>>);

impl SharedGate {
    pub fn new(gate: AdmissionGate) -> Self {
        Self(Arc::new(Mutex::new(gate)))
    }

    /// Lock the gate, recovering from a poisoned mutex.
    pub fn lock(&self) -> MutexGuard<'_, AdmissionGate> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
