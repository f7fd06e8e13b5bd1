//! The investigation pipeline. Five sequential steps over one alert,
//! emitting lifecycle events onto the per-run channel and persisting the
//! run plus its ordered trace when it terminates.

use std::future::Future;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use fraudesk_contracts::{
    ActivitySummary, AgentStep, KbDocRef, KbExcerpts, ProfileSummary, RunStatus, SignalSet,
    StepResult, SuspectTransaction, TriageEvent, TriageResult, TriageRunRecord,
};
use fraudesk_store::{Store, StoreError};
use tokio::time::{sleep, timeout};
use ulid::Ulid;

use crate::config::TriageConfig;
use crate::metrics;
use crate::registry::{EventSink, RunRegistry};
use crate::steps::{
    self, STEP_DECIDE, STEP_GET_PROFILE, STEP_KB_LOOKUP, STEP_RECENT_TRANSACTIONS,
    STEP_RISK_SIGNALS, STEP_RISK_SIGNALS_FALLBACK,
};

const RETRY_BACKOFF_MS: [u64; 2] = [150, 400];

fn retry_backoff(attempt: u32) -> Duration {
    let idx = (attempt.max(1) as usize - 1).min(RETRY_BACKOFF_MS.len() - 1);
    Duration::from_millis(RETRY_BACKOFF_MS[idx])
}

/// Opt-in fault injector for the signal-derivation step. Rate 0.0 (the
/// default) never fires.
#[derive(Debug, Clone)]
pub struct FaultInjector {
    rate: f64,
}

impl FaultInjector {
    pub fn new(rate: f64) -> Self {
        Self {
            rate: rate.clamp(0.0, 1.0),
        }
    }

    fn should_fail(&self) -> bool {
        self.rate > 0.0 && rand::random::<f64>() < self.rate
    }
}

#[derive(Debug)]
enum StepError {
    Store(StoreError),
    Missing(String),
    Injected,
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepError::Store(err) => write!(f, "store error: {}", err),
            StepError::Missing(what) => write!(f, "{} not found", what),
            StepError::Injected => write!(f, "injected fault"),
        }
    }
}

impl From<StoreError> for StepError {
    fn from(value: StoreError) -> Self {
        StepError::Store(value)
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: Store,
    registry: RunRegistry,
    config: TriageConfig,
    injector: FaultInjector,
}

impl Orchestrator {
    pub fn new(store: Store, registry: RunRegistry, config: TriageConfig) -> Self {
        let injector = FaultInjector::new(config.fault_injection_rate);
        Self {
            store,
            registry,
            config,
            injector,
        }
    }

    pub fn registry(&self) -> &RunRegistry {
        &self.registry
    }

    /// Register a run and kick off the pipeline. Returns immediately with
    /// the fresh run id; progress flows over the run's channel.
    pub async fn start(&self, alert_id: &str) -> String {
        let run_id = Ulid::new().to_string();
        let sink = self.registry.register(&run_id).await;

        let orchestrator = self.clone();
        let alert_id = alert_id.to_string();
        let spawned_run_id = run_id.clone();
        tokio::spawn(async move {
            orchestrator.run(spawned_run_id, alert_id, sink).await;
        });

        run_id
    }

    async fn run(self, run_id: String, alert_id: String, sink: EventSink) {
        let started_at = Utc::now();
        let run_start = Instant::now();

        tracing::info!(run_id = %run_id, alert_id = %alert_id, "triage.run_started");
        sink.emit(TriageEvent::Start {
            run_id: run_id.clone(),
            alert_id: alert_id.clone(),
        });

        let mut trace: Vec<AgentStep> = Vec::new();
        let mut fallback_used = false;

        let profile = match self
            .run_step(STEP_GET_PROFILE, &sink, &mut trace, self.fetch_profile(&alert_id), |p| {
                StepResult::Profile(p.clone())
            })
            .await
        {
            Ok(profile) => profile,
            Err(message) => {
                self.finish_failed(run_id, alert_id, started_at, run_start, trace, false, sink, message)
                    .await;
                return;
            }
        };
        self.pace().await;

        let activity = match self
            .run_step(
                STEP_RECENT_TRANSACTIONS,
                &sink,
                &mut trace,
                self.fetch_activity(&profile.customer_id),
                |a| StepResult::RecentActivity(a.clone()),
            )
            .await
        {
            Ok(activity) => activity,
            Err(message) => {
                self.finish_failed(run_id, alert_id, started_at, run_start, trace, false, sink, message)
                    .await;
                return;
            }
        };
        self.pace().await;

        let signals = {
            let mut derived: Option<SignalSet> = None;
            let mut last_error = String::new();

            for attempt in 0..=self.config.retry_max {
                if attempt > 0 {
                    metrics::inc_step_retry();
                    sink.emit(TriageEvent::Retry {
                        step: STEP_RISK_SIGNALS.to_string(),
                        attempt,
                    });
                    sleep(retry_backoff(attempt)).await;
                }

                match self
                    .run_step(
                        STEP_RISK_SIGNALS,
                        &sink,
                        &mut trace,
                        self.derive_signals_step(&profile, &activity),
                        |s| StepResult::RiskSignals(s.clone()),
                    )
                    .await
                {
                    Ok(signals) => {
                        derived = Some(signals);
                        break;
                    }
                    Err(message) => last_error = message,
                }
            }

            match derived {
                Some(signals) => signals,
                None => {
                    metrics::inc_fallback();
                    fallback_used = true;
                    tracing::warn!(
                        run_id = %run_id,
                        step = STEP_RISK_SIGNALS,
                        last_error = %last_error,
                        "triage.step_fallback"
                    );
                    sink.emit(TriageEvent::Fallback {
                        step: STEP_RISK_SIGNALS.to_string(),
                        last_error,
                    });

                    let signals = steps::fallback_signals();
                    let step = AgentStep {
                        name: STEP_RISK_SIGNALS_FALLBACK.to_string(),
                        ok: true,
                        duration_ms: 0,
                        result: Some(StepResult::RiskSignals(signals.clone())),
                        error: None,
                    };
                    sink.emit(TriageEvent::Step(step.clone()));
                    trace.push(step);
                    signals
                }
            }
        };
        self.pace().await;

        // Reference lookups are informational; a miss never fails the run.
        let _kb = match self
            .run_step(STEP_KB_LOOKUP, &sink, &mut trace, self.fetch_kb(), |k| {
                StepResult::KbLookup(k.clone())
            })
            .await
        {
            Ok(kb) => kb,
            Err(_) => KbExcerpts { docs: Vec::new() },
        };
        self.pace().await;

        let kyc_level = profile.kyc_level;
        let decision = match self
            .run_step(
                STEP_DECIDE,
                &sink,
                &mut trace,
                std::future::ready(Ok::<_, StepError>(steps::decide(&signals, kyc_level))),
                |d| StepResult::Decision(d.clone()),
            )
            .await
        {
            Ok(decision) => decision,
            Err(message) => {
                self.finish_failed(
                    run_id,
                    alert_id,
                    started_at,
                    run_start,
                    trace,
                    fallback_used,
                    sink,
                    message,
                )
                .await;
                return;
            }
        };

        let total_duration_ms = run_start.elapsed().as_millis() as u64;
        let result = TriageResult {
            risk: decision.risk,
            recommendation: decision.recommendation,
            reasons: decision.reasons.clone(),
            confidence: decision.confidence,
            requires_otp: decision.requires_otp,
            fallback_used,
            total_duration_ms,
            steps: trace.clone(),
        };

        let record = TriageRunRecord {
            id: run_id.clone(),
            alert_id,
            status: RunStatus::Completed,
            risk: Some(decision.risk),
            recommendation: Some(decision.recommendation),
            reasons: decision.reasons,
            confidence: Some(decision.confidence),
            fallback_used,
            started_at,
            ended_at: Utc::now(),
            total_duration_ms: total_duration_ms as i64,
        };

        if let Err(err) = self.store.insert_triage_run(&record, &trace).await {
            tracing::error!(run_id = %record.id, error = %err, "triage.persist_failed");
            metrics::observe_run("failed", run_start.elapsed());
            sink.finish(TriageEvent::Error {
                message: "failed to persist triage run".to_string(),
            })
            .await;
            return;
        }

        tracing::info!(
            run_id = %record.id,
            risk = decision.risk.as_str(),
            recommendation = decision.recommendation.as_str(),
            fallback_used,
            total_duration_ms,
            steps = trace.len(),
            "triage.run_completed"
        );
        metrics::observe_run("completed", run_start.elapsed());
        sink.finish(TriageEvent::Complete { result }).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_failed(
        &self,
        run_id: String,
        alert_id: String,
        started_at: DateTime<Utc>,
        run_start: Instant,
        trace: Vec<AgentStep>,
        fallback_used: bool,
        sink: EventSink,
        message: String,
    ) {
        let record = TriageRunRecord {
            id: run_id,
            alert_id,
            status: RunStatus::Failed,
            risk: None,
            recommendation: None,
            reasons: Vec::new(),
            confidence: None,
            fallback_used,
            started_at,
            ended_at: Utc::now(),
            total_duration_ms: run_start.elapsed().as_millis() as i64,
        };

        // Failed runs keep their partial trace.
        if let Err(err) = self.store.insert_triage_run(&record, &trace).await {
            tracing::error!(run_id = %record.id, error = %err, "triage.persist_failed");
        }

        tracing::warn!(run_id = %record.id, error = %message, "triage.run_failed");
        metrics::observe_run("failed", run_start.elapsed());
        sink.finish(TriageEvent::Error { message }).await;
    }

    async fn run_step<T, Fut>(
        &self,
        name: &'static str,
        sink: &EventSink,
        trace: &mut Vec<AgentStep>,
        fut: Fut,
        to_result: impl FnOnce(&T) -> StepResult,
    ) -> Result<T, String>
    where
        Fut: Future<Output = Result<T, StepError>>,
    {
        let started = Instant::now();
        let outcome = timeout(self.config.step_timeout, fut).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(value)) => {
                let step = AgentStep {
                    name: name.to_string(),
                    ok: true,
                    duration_ms,
                    result: Some(to_result(&value)),
                    error: None,
                };
                sink.emit(TriageEvent::Step(step.clone()));
                trace.push(step);
                Ok(value)
            }
            Ok(Err(err)) => {
                let message = err.to_string();
                self.record_failed_step(name, sink, trace, duration_ms, message.clone());
                Err(message)
            }
            Err(_) => {
                let message = format!(
                    "step timed out after {}ms",
                    self.config.step_timeout.as_millis()
                );
                self.record_failed_step(name, sink, trace, duration_ms, message.clone());
                Err(message)
            }
        }
    }

    fn record_failed_step(
        &self,
        name: &'static str,
        sink: &EventSink,
        trace: &mut Vec<AgentStep>,
        duration_ms: u64,
        message: String,
    ) {
        tracing::warn!(
            run_id = %sink.run_id(),
            step = name,
            error = %message,
            "triage.step_failed"
        );
        let step = AgentStep {
            name: name.to_string(),
            ok: false,
            duration_ms,
            result: None,
            error: Some(message),
        };
        sink.emit(TriageEvent::Step(step.clone()));
        trace.push(step);
    }

    async fn fetch_profile(&self, alert_id: &str) -> Result<ProfileSummary, StepError> {
        let alert = self
            .store
            .alert(alert_id)
            .await?
            .ok_or_else(|| StepError::Missing(format!("alert {}", alert_id)))?;

        let customer = self
            .store
            .customer(&alert.customer_id)
            .await?
            .ok_or_else(|| StepError::Missing(format!("customer {}", alert.customer_id)))?;

        let suspect = match &alert.transaction_id {
            Some(txn_id) => self.store.transaction(txn_id).await?.map(|txn| {
                SuspectTransaction {
                    txn_id: txn.id,
                    amount_minor: txn.amount_minor,
                    merchant: txn.merchant,
                    country: txn.country,
                }
            }),
            None => None,
        };

        let card_count = self.store.card_count(&customer.id).await?;
        let account_balance_minor = self
            .store
            .primary_account(&customer.id)
            .await?
            .map(|account| account.balance_minor)
            .unwrap_or(0);

        Ok(ProfileSummary {
            alert_id: alert.id,
            alert_risk: alert.risk,
            alert_reason: alert.reason,
            customer_id: customer.id,
            customer_name: customer.display_name,
            kyc_level: customer.kyc_level,
            card_count,
            account_balance_minor,
            suspect,
        })
    }

    async fn fetch_activity(&self, customer_id: &str) -> Result<ActivitySummary, StepError> {
        let transactions = self
            .store
            .recent_transactions(customer_id, self.config.recent_txn_limit)
            .await?;
        Ok(steps::summarize_activity(&transactions))
    }

    async fn derive_signals_step(
        &self,
        profile: &ProfileSummary,
        activity: &ActivitySummary,
    ) -> Result<SignalSet, StepError> {
        if self.injector.should_fail() {
            return Err(StepError::Injected);
        }
        Ok(steps::derive_signals(profile, activity))
    }

    async fn fetch_kb(&self) -> Result<KbExcerpts, StepError> {
        let docs = self.store.kb_docs(self.config.kb_doc_limit).await?;
        Ok(KbExcerpts {
            docs: docs
                .into_iter()
                .map(|doc| KbDocRef {
                    id: doc.id,
                    title: doc.title,
                })
                .collect(),
        })
    }

    async fn pace(&self) {
        if !self.config.step_pacing.is_zero() {
            sleep(self.config.step_pacing).await;
        }
    }
}
