//! Triage orchestration: a bounded, retriable, fallback-capable pipeline of
//! investigation steps that streams progress to per-run subscribers.

pub mod config;
pub mod metrics;
pub mod orchestrator;
pub mod registry;
pub mod steps;

pub use config::TriageConfig;
pub use orchestrator::{FaultInjector, Orchestrator};
pub use registry::{EventSink, RunRegistry, Subscription};
