//! Admission control, deduplication, routing and process supervision for a
//! voice assistant's local language-model backends.

pub mod admission;
pub mod backend;
pub mod config;
pub mod governor;
pub mod latency;
pub mod queue;
pub mod request;
pub mod supervisor;
