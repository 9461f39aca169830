//! Single-flight bookkeeping: one shared execution per [`DedupKey`].
//!
//! A [`SharedExecution`] wraps the spawned task running a caller's unit of
//! work in a cloneable [`Shared`] future.  Every caller that joins the
//! flight awaits its own clone and observes the same result.

use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::admission::DenyReason;
use crate::request::{DedupKey, PriorityTier};

// ---------------------------------------------------------------------------
// QueueError
// ---------------------------------------------------------------------------

/// Errors a [`PriorityQueue`](crate::queue::PriorityQueue) caller can see.
///
/// `Clone` because a single failure is fanned out to every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// Backpressure: the request was not accepted.
    #[error("request rejected: {0}")]
    Rejected(DenyReason),

    /// The unit of work ran and failed.
    #[error("execution failed: {0}")]
    Execution(String),

    /// The queue was shut down before the work finished.
    #[error("execution cancelled")]
    Cancelled,
}

pub type ExecutionResult<T> = Result<T, QueueError>;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// A successful result as seen by one caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome<T> {
    pub value: T,
    /// `true` when this caller joined an execution started by another.
    pub coalesced: bool,
    pub tier: PriorityTier,
}

// ---------------------------------------------------------------------------
// SharedExecution
// ---------------------------------------------------------------------------

pub(crate) type FlightFuture<T> = Shared<BoxFuture<'static, ExecutionResult<T>>>;

/// The in-flight execution for one key.
pub(crate) struct SharedExecution<T: Clone> {
    /// Distinguishes successive flights for the same key.
    pub(crate) id: u64,
    pub(crate) tier: PriorityTier,
    pub(crate) started_at: Instant,
    /// Callers attached so far, the leader included.
    pub(crate) waiters: usize,
    pub(crate) future: FlightFuture<T>,
}

impl<T: Clone> SharedExecution<T> {
    /// Whether a caller arriving at `now` may still join.
    ///
    /// The window is measured from the first arrival and is exclusive: a
    /// caller arriving exactly `window` after the first does not join.
    pub(crate) fn accepts_at(&self, now: Instant, window: std::time::Duration) -> bool {
        now.saturating_duration_since(self.started_at) < window
    }
}

impl<T: Clone> std::fmt::Debug for SharedExecution<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedExecution")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("started_at", &self.started_at)
            .field("waiters", &self.waiters)
            .finish_non_exhaustive()
    }
}

/// Snapshot of one in-flight key, for introspection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlightInfo {
    pub key: String,
    pub tier: PriorityTier,
    pub waiters: usize,
    pub age_ms: u64,
}

pub(crate) fn flight_info<T: Clone>(key: &DedupKey, flight: &SharedExecution<T>, now: Instant) -> FlightInfo {
    FlightInfo {
        key: key.to_string(),
        tier: flight.tier,
        waiters: flight.waiters,
        age_ms: now.saturating_duration_since(flight.started_at).as_millis() as u64,
    }
}
