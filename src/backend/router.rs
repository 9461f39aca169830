//! Fast/deep backend routing with health-based failover.
//!
//! # Selection rule
//!
//! ```text
//! tier0 && chars < fast_max_chars && !complex  ──▶ Fast
//! anything else                                ──▶ Deep
//! ```
//!
//! A backend marked unhealthy is skipped; the request goes to the other one
//! with `degraded = true` in the result.  A call that fails with a
//! transport error, a timeout or pool exhaustion is retried once on the
//! other backend the same way.
//!
//! The router only issues application-level calls.  It never signals or
//! restarts a backend process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::client::{BackendError, InferenceBackend};
use crate::config::BackendsConfig;
use crate::request::{PriorityTier, Request};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendRole {
    Fast,
    Deep,
}

impl BackendRole {
    pub fn other(self) -> Self {
        match self {
            BackendRole::Fast => BackendRole::Deep,
            BackendRole::Deep => BackendRole::Fast,
        }
    }
}

impl std::fmt::Display for BackendRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            BackendRole::Fast => "fast",
            BackendRole::Deep => "deep",
        })
    }
}

/// Where a request will go and why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutePlan {
    pub role: BackendRole,
    /// The preferred backend was unhealthy or busy.
    pub degraded: bool,
    pub reason: &'static str,
}

/// The shared inference result handed back to every caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub text: String,
    pub backend: BackendRole,
    pub degraded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendHealth {
    pub fast: bool,
    pub deep: bool,
}

impl BackendHealth {
    pub fn any(&self) -> bool {
        self.fast || self.deep
    }
}

// ---------------------------------------------------------------------------
// Complexity detection
// ---------------------------------------------------------------------------

/// `true` when `text` contains any marker (case-insensitive) or asks more
/// than one question.
///
/// ```
/// use inference_governor::backend::is_complex;
///
/// let markers = vec!["explain".to_string()];
/// assert!(is_complex("Can you EXPLAIN this?", &markers));
/// assert!(is_complex("Who? When?", &markers));
/// assert!(!is_complex("Turn on the lights", &markers));
/// ```
pub fn is_complex(text: &str, markers: &[String]) -> bool {
    let lower = text.to_lowercase();
    let questions = lower.matches('?').count();
    questions > 1
        || markers
            .iter()
            .filter(|m| !m.is_empty())
            .any(|m| lower.contains(&m.to_lowercase()))
}

// ---------------------------------------------------------------------------
// BackendRouter
// ---------------------------------------------------------------------------

/// Chooses between the fast and deep backends.
pub struct BackendRouter {
    fast: Arc<dyn InferenceBackend>,
    deep: Arc<dyn InferenceBackend>,
    fast_healthy: AtomicBool,
    deep_healthy: AtomicBool,
    config: BackendsConfig,
}

impl BackendRouter {
    /// Both backends start out healthy until a poll says otherwise.
    pub fn new(
        fast: Arc<dyn InferenceBackend>,
        deep: Arc<dyn InferenceBackend>,
        config: BackendsConfig,
    ) -> Self {
        Self {
            fast,
            deep,
            fast_healthy: AtomicBool::new(true),
            deep_healthy: AtomicBool::new(true),
            config,
        }
    }

    fn backend(&self, role: BackendRole) -> &Arc<dyn InferenceBackend> {
        match role {
            BackendRole::Fast => &self.fast,
            BackendRole::Deep => &self.deep,
        }
    }

    fn flag(&self, role: BackendRole) -> &AtomicBool {
        match role {
            BackendRole::Fast => &self.fast_healthy,
            BackendRole::Deep => &self.deep_healthy,
        }
    }

    pub fn is_healthy(&self, role: BackendRole) -> bool {
        self.flag(role).load(Ordering::Acquire)
    }

    /// Record a health observation for `role`, logging transitions.
    pub fn mark(&self, role: BackendRole, healthy: bool) {
        let was = self.flag(role).swap(healthy, Ordering::AcqRel);
        if was != healthy {
            if healthy {
                log::info!("router: {role} backend healthy again");
            } else {
                log::warn!("router: {role} backend marked unhealthy");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Selection
    // -----------------------------------------------------------------------

    /// The backend the selection rule picks, ignoring health.
    pub fn preferred(&self, request: &Request, tier: PriorityTier) -> BackendRole {
        if tier == PriorityTier::Tier0
            && request.char_len() < self.config.fast_max_chars
            && !is_complex(request.text(), &self.config.complex_markers)
        {
            BackendRole::Fast
        } else {
            BackendRole::Deep
        }
    }

    /// Pick a backend for `request`, applying health-based failover.
    pub fn route(&self, request: &Request, tier: PriorityTier) -> Result<RoutePlan, BackendError> {
        let preferred = self.preferred(request, tier);
        if self.is_healthy(preferred) {
            return Ok(RoutePlan {
                role: preferred,
                degraded: false,
                reason: match preferred {
                    BackendRole::Fast => "short tier-0 request",
                    BackendRole::Deep => "long or complex request",
                },
            });
        }

        let fallback = preferred.other();
        if self.is_healthy(fallback) {
            log::warn!("router: {preferred} unhealthy, routing {} to {fallback}", request.id());
            return Ok(RoutePlan {
                role: fallback,
                degraded: true,
                reason: "preferred backend unhealthy",
            });
        }

        Err(BackendError::Unavailable)
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Route and run `prompt`, failing over once on a busy or broken
    /// backend.
    pub async fn dispatch(
        &self,
        request: &Request,
        tier: PriorityTier,
        prompt: &str,
    ) -> Result<InferenceOutput, BackendError> {
        let plan = self.route(request, tier)?;
        log::debug!("router: {} → {} ({})", request.id(), plan.role, plan.reason);

        let err = match self.backend(plan.role).generate(prompt).await {
            Ok(text) => {
                return Ok(InferenceOutput {
                    text,
                    backend: plan.role,
                    degraded: plan.degraded,
                })
            }
            Err(e) => e,
        };

        if err.marks_unhealthy() {
            self.mark(plan.role, false);
        }

        let fallback = plan.role.other();
        if !err.triggers_failover() || plan.degraded || !self.is_healthy(fallback) {
            return Err(err);
        }

        log::warn!(
            "router: {} failed on {} ({err}), failing over to {fallback}",
            request.id(),
            plan.role
        );
        let text = self.backend(fallback).generate(prompt).await.inspect_err(|e| {
            if e.marks_unhealthy() {
                self.mark(fallback, false);
            }
        })?;

        Ok(InferenceOutput {
            text,
            backend: fallback,
            degraded: true,
        })
    }

    // -----------------------------------------------------------------------
    // Health
    // -----------------------------------------------------------------------

    /// Cached health flags.
    pub fn health_check(&self) -> BackendHealth {
        BackendHealth {
            fast: self.is_healthy(BackendRole::Fast),
            deep: self.is_healthy(BackendRole::Deep),
        }
    }

    /// Poll both backends concurrently, each bounded by the configured
    /// health timeout, and update the flags.  Expiry counts as unhealthy.
    pub async fn poll_health(&self) -> BackendHealth {
        let timeout = self.config.health_timeout();
        let (fast, deep) = tokio::join!(
            check_one(self.fast.as_ref(), timeout),
            check_one(self.deep.as_ref(), timeout),
        );
        self.mark(BackendRole::Fast, fast);
        self.mark(BackendRole::Deep, deep);
        BackendHealth { fast, deep }
    }
}

async fn check_one(backend: &dyn InferenceBackend, timeout: Duration) -> bool {
    match tokio::time::timeout(timeout, backend.health()).await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::warn!("router: health check for {} failed: {e}", backend.name());
            false
        }
        Err(_) => {
            log::warn!("router: health check for {} timed out", backend.name());
            false
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
