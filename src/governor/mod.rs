//! Top-level wiring of admission, queue, routing, latency and supervision.
//!
//! This module provides:
//! * [`Governor`]: `submit` for the request-handling layer plus the
//!   operator control surface (block/unblock intake, metric assertions,
//!   health payload, recycle).
//! * [`SubmitError`] / [`SubmitResult`]: what `submit` callers see.
//! * Background loops (`spawn_metrics_sampler`, `spawn_health_monitor`)
//!   that feed the admission gate and trigger recycling.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use inference_governor::admission::SysinfoMetricsSource;
//! use inference_governor::backend::OllamaBackend;
//! use inference_governor::config::GovernorConfig;
//! use inference_governor::governor::Governor;
//! use inference_governor::request::{Request, SourceType};
//! use inference_governor::supervisor::SysinfoProcessManager;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = GovernorConfig::default();
//!     let fast = Arc::new(OllamaBackend::from_config("fast", &config.backends.fast));
//!     let deep = Arc::new(OllamaBackend::from_config("deep", &config.backends.deep));
//!     let governor = Arc::new(Governor::new(
//!         config,
//!         fast,
//!         deep.clone(),
//!         deep,
//!         Arc::new(SysinfoProcessManager::new()),
//!     ));
//!     governor.spawn_background(Box::new(SysinfoMetricsSource::new()));
//!
//!     let request = Request::new("Read my new messages", SourceType::Chat);
//!     match governor.submit(&request, request.text()).await {
//!         Ok(result) => println!("{}", result.text),
//!         Err(e) => println!("denied: {}", e.reason()),
//!     }
//! }
//! ```

mod loops;
pub mod service;

// ---------------------------------------------------------------------------
// Public re-exports
// ---------------------------------------------------------------------------

pub use service::{Governor, GovernorHealth, SubmitError, SubmitResult};
