//! Single-flight priority queue.
//!
//! This module provides:
//! * [`PriorityQueue`]: classifies requests into tiers, coalesces identical
//!   in-flight requests, and caps concurrency per tier.
//! * [`QueueError`]: rejection, execution failure, cancellation.
//! * [`Outcome`]: a caller's view of a finished execution.
//! * [`QueueStats`]: per-tier depth and dedup hit rate.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use inference_governor::config::QueueConfig;
//! use inference_governor::queue::PriorityQueue;
//! use inference_governor::request::{Request, SourceType};
//!
//! #[tokio::main]
//! async fn main() {
//!     let queue: PriorityQueue<String> = PriorityQueue::new(QueueConfig::default());
//!     let request = Request::new("What's on my calendar?", SourceType::Chat);
//!
//!     let outcome = queue
//!         .submit(&request, || async { Ok::<_, String>("Two meetings.".to_string()) })
//!         .await
//!         .unwrap();
//!     println!("{} (coalesced: {})", outcome.value, outcome.coalesced);
//! }
//! ```

pub mod flight;
pub mod priority;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use flight::{ExecutionResult, FlightInfo, Outcome, QueueError};
pub use priority::{PriorityQueue, QueueStats, TierStats};
