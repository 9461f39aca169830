//! Single-flight priority queue.
//!
//! [`PriorityQueue::submit`] takes a request and the caller's unit of work
//! and either:
//!
//! * joins an identical in-flight execution (same [`DedupKey`], younger
//!   than the coalescing window) and returns its result, or
//! * starts a new execution if the request's tier has a free slot, or
//! * rejects with [`DenyReason::TierBusy`].
//!
//! This is a backpressure contract, not a FIFO wait queue: nothing ever
//! waits for a tier slot.
//!
//! # Tier policy
//!
//! ```text
//! Tier0 ─┐ semaphore(1) ──▶ run
//! Tier1 ─┤ semaphore(1) ──▶ run
//! Tier2 ─┘ semaphore(1) ──▶ run   only while Tier0 and Tier1 run nothing
//! ```
//!
//! Tiers never block each other except for the tier-2 idle rule.  Tier 0
//! has strict precedence: sustained tier-0 load can starve tier 2
//! indefinitely.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::admission::DenyReason;
use crate::config::QueueConfig;
use crate::queue::flight::{
    flight_info, ExecutionResult, FlightInfo, Outcome, QueueError, SharedExecution,
};
use crate::request::{DedupKey, PriorityTier, Request};

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierStats {
    pub tier: PriorityTier,
    /// Executions currently running.
    pub running: usize,
    /// Callers attached to a running execution that did not start it.
    pub waiting: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub tiers: Vec<TierStats>,
    pub submitted: u64,
    pub dedup_hits: u64,
    /// `dedup_hits / submitted`, 0.0 before the first submission.
    pub dedup_hit_rate: f64,
    pub rejected: u64,
    pub in_flight: Vec<FlightInfo>,
}

// ---------------------------------------------------------------------------
// Inner state
// ---------------------------------------------------------------------------

struct QueueInner<T: Clone> {
    flights: HashMap<DedupKey, SharedExecution<T>>,
    next_flight_id: u64,
    running: [usize; 3],
    attached: [usize; 3],
    submitted: u64,
    dedup_hits: u64,
    rejected: u64,
}

impl<T: Clone> QueueInner<T> {
    fn new() -> Self {
        Self {
            flights: HashMap::new(),
            next_flight_id: 1,
            running: [0; 3],
            attached: [0; 3],
            submitted: 0,
            dedup_hits: 0,
            rejected: 0,
        }
    }
}

type SharedInner<T> = Arc<Mutex<QueueInner<T>>>;

fn lock_inner<T: Clone>(inner: &SharedInner<T>) -> MutexGuard<'_, QueueInner<T>> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Detaches a caller from its tier when dropped, including when the
/// caller's future is cancelled mid-await.
struct AttachGuard<T: Clone> {
    inner: SharedInner<T>,
    tier: PriorityTier,
}

impl<T: Clone> Drop for AttachGuard<T> {
    fn drop(&mut self) {
        let mut inner = lock_inner(&self.inner);
        let slot = &mut inner.attached[self.tier.index()];
        *slot = slot.saturating_sub(1);
    }
}

// ---------------------------------------------------------------------------
// PriorityQueue
// ---------------------------------------------------------------------------

/// Deduplicating, per-tier concurrency-capped dispatcher.
///
/// Construct one per governor and share it behind an `Arc`.  Generic over the
/// result type so the same machinery serves inference calls and tests.
pub struct PriorityQueue<T: Clone> {
    config: QueueConfig,
    limits: [Arc<Semaphore>; 3],
    inner: SharedInner<T>,
    cancel: CancellationToken,
}

impl<T> PriorityQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: QueueConfig) -> Self {
        let limits = config
            .tier_concurrency
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));
        Self {
            config,
            limits,
            inner: Arc::new(Mutex::new(QueueInner::new())),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Submit `request`; run `executor` only if no identical execution can
    /// be joined.
    ///
    /// `executor` is invoked at most once, synchronously, to produce the
    /// future that is then spawned onto the runtime.  Its error is reported
    /// to every waiter as [`QueueError::Execution`].
    pub async fn submit<F, Fut, E>(&self, request: &Request, executor: F) -> ExecutionResult<Outcome<T>>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return Err(QueueError::Cancelled);
        }

        let tier = request.tier(&self.config);
        let key = request.dedup_key();
        let now = Instant::now();
        let window = self.config.dedup_window();

        let (future, coalesced, _attached) = {
            let mut guard = lock_inner(&self.inner);
            let inner = &mut *guard;
            inner.submitted += 1;

            let joinable = inner
                .flights
                .get_mut(&key)
                .filter(|flight| flight.accepts_at(now, window));

            if let Some(flight) = joinable {
                flight.waiters += 1;
                let future = flight.future.clone();
                let flight_tier = flight.tier;
                inner.dedup_hits += 1;
                inner.attached[flight_tier.index()] += 1;
                log::debug!(
                    "queue: {} joined in-flight {key} ({} waiters)",
                    request.id(),
                    flight.waiters
                );
                let attached = AttachGuard {
                    inner: Arc::clone(&self.inner),
                    tier: flight_tier,
                };
                (future, true, attached)
            } else {
                if tier == PriorityTier::Tier2 && inner.running[0] + inner.running[1] > 0 {
                    inner.rejected += 1;
                    log::debug!("queue: {} rejected, tier2 waits for idle tiers 0/1", request.id());
                    return Err(QueueError::Rejected(DenyReason::TierBusy));
                }

                let Ok(permit) = Arc::clone(&self.limits[tier.index()]).try_acquire_owned() else {
                    inner.rejected += 1;
                    log::debug!("queue: {} rejected, {tier} saturated", request.id());
                    return Err(QueueError::Rejected(DenyReason::TierBusy));
                };

                let id = inner.next_flight_id;
                inner.next_flight_id += 1;

                let work = executor();
                let cancel = self.cancel.clone();
                let table = Arc::clone(&self.inner);
                let task_key = key.clone();

                let handle = tokio::spawn(async move {
                    let result = tokio::select! {
                        _ = cancel.cancelled() => Err(QueueError::Cancelled),
                        r = work => r.map_err(|e| QueueError::Execution(e.to_string())),
                    };

                    {
                        let mut inner = lock_inner(&table);
                        if inner.flights.get(&task_key).map(|f| f.id) == Some(id) {
                            inner.flights.remove(&task_key);
                        }
                        let slot = &mut inner.running[tier.index()];
                        *slot = slot.saturating_sub(1);
                    }
                    drop(permit);
                    result
                });

                let future = async move {
                    match handle.await {
                        Ok(result) => result,
                        Err(e) => Err(QueueError::Execution(format!("execution task failed: {e}"))),
                    }
                }
                .boxed()
                .shared();

                inner.running[tier.index()] += 1;
                inner.attached[tier.index()] += 1;
                inner.flights.insert(
                    key.clone(),
                    SharedExecution {
                        id,
                        tier,
                        started_at: now,
                        waiters: 1,
                        future: future.clone(),
                    },
                );
                log::debug!("queue: {} started {key} on {tier}", request.id());

                let attached = AttachGuard {
                    inner: Arc::clone(&self.inner),
                    tier,
                };
                (future, false, attached)
            }
        };

        let value = future.await?;
        Ok(Outcome {
            value,
            coalesced,
            tier,
        })
    }

    /// Callers waiting on someone else's in-flight execution.  This is the
    /// "queued but not dispatched" depth the admission gate caps.
    pub fn waiting_depth(&self) -> usize {
        let inner = lock_inner(&self.inner);
        (0..3)
            .map(|i| inner.attached[i].saturating_sub(inner.running[i]))
            .sum()
    }

    /// Executions currently running across all tiers.
    pub fn running(&self) -> usize {
        lock_inner(&self.inner).running.iter().sum()
    }

    pub fn stats(&self) -> QueueStats {
        let now = Instant::now();
        let inner = lock_inner(&self.inner);
        let tiers = PriorityTier::ALL
            .iter()
            .map(|&tier| {
                let i = tier.index();
                TierStats {
                    tier,
                    running: inner.running[i],
                    waiting: inner.attached[i].saturating_sub(inner.running[i]),
                    capacity: self.config.tier_concurrency[i].max(1),
                }
            })
            .collect();

        let dedup_hit_rate = if inner.submitted == 0 {
            0.0
        } else {
            inner.dedup_hits as f64 / inner.submitted as f64
        };

        QueueStats {
            tiers,
            submitted: inner.submitted,
            dedup_hits: inner.dedup_hits,
            dedup_hit_rate,
            rejected: inner.rejected,
            in_flight: inner
                .flights
                .iter()
                .map(|(key, flight)| flight_info(key, flight, now))
                .collect(),
        }
    }

    /// Cancel every in-flight execution and refuse new submissions.
    pub fn shutdown(&self) {
        log::info!("queue: shutting down, cancelling in-flight work");
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
