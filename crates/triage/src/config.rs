use std::time::Duration;

/// Knobs for one orchestrator instance. The gateway builds this from its
/// environment; defaults match production behavior (no pacing, no injected
/// faults).
#[derive(Debug, Clone)]
pub struct TriageConfig {
    /// Wall-time bound per pipeline step.
    pub step_timeout: Duration,
    /// Retries after the first attempt for retriable steps.
    pub retry_max: u32,
    /// Optional delay after each successful step. Zero disables it; the
    /// demo UI uses a few hundred milliseconds so operators can watch the
    /// pipeline advance.
    pub step_pacing: Duration,
    /// Probability in [0, 1] that a signal-derivation attempt fails. An
    /// opt-in testing facility; keep at 0.0 outside fault drills.
    pub fault_injection_rate: f64,
    pub recent_txn_limit: i64,
    pub kb_doc_limit: i64,
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(5),
            retry_max: 2,
            step_pacing: Duration::ZERO,
            fault_injection_rate: 0.0,
            recent_txn_limit: 20,
            kb_doc_limit: 2,
        }
    }
}
