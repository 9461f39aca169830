//! Inference backends: the HTTP client and the fast/deep router.

pub mod client;
pub mod router;

pub use client::{
    BackendError, BackendSession, InferenceBackend, OllamaBackend, SessionControl, SessionState,
};
pub use router::{is_complex, BackendHealth, BackendRole, BackendRouter, InferenceOutput, RoutePlan};
