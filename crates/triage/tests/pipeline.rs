use std::time::Duration;

use chrono::{TimeZone, Utc};
use fraudesk_contracts::{Recommendation, Risk, TriageEvent};
use fraudesk_store::Store;
use fraudesk_triage::{Orchestrator, RunRegistry, Subscription, TriageConfig};
use sqlx::Row;

fn test_db_url() -> Option<String> {
    std::env::var("FRAUDESK_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

async fn create_schema(base_db_url: &str) -> (sqlx::PgPool, String, String) {
    let schema = format!("fraudesk_test_{}", ulid::Ulid::new()).to_lowercase();

    let admin_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(base_db_url)
        .await
        .expect("DB connect should succeed");

    let create_schema = format!("CREATE SCHEMA {}", schema);
    sqlx::query(&create_schema)
        .execute(&admin_pool)
        .await
        .expect("create schema should succeed");

    let schema_url = schema_db_url(base_db_url, &schema);
    (admin_pool, schema, schema_url)
}

async fn drop_schema(admin_pool: &sqlx::PgPool, schema: &str) {
    let drop_schema = format!("DROP SCHEMA {} CASCADE", schema);
    let _ = sqlx::query(&drop_schema).execute(admin_pool).await;
}

async fn seed_high_velocity_alert(store: &Store) {
    sqlx::query(
        "INSERT INTO customers (id, display_name, email, phone, kyc_level) \
         VALUES ('cus_1', 'Asha Rao', 'asha@example.com', '+911234500000', 2)",
    )
    .execute(store.pool())
    .await
    .expect("insert customer");

    sqlx::query(
        "INSERT INTO cards (id, customer_id, last_four, network, status) \
         VALUES ('card_1', 'cus_1', '4242', 'visa', 'active')",
    )
    .execute(store.pool())
    .await
    .expect("insert card");

    sqlx::query(
        "INSERT INTO accounts (id, customer_id, balance_minor, currency) \
         VALUES ('acc_1', 'cus_1', 250000, 'INR')",
    )
    .execute(store.pool())
    .await
    .expect("insert account");

    for i in 0..18 {
        sqlx::query(
            "INSERT INTO transactions (id, customer_id, card_id, ts, amount_minor, merchant, \
                                       mcc, currency, country, status) \
             VALUES ($1, 'cus_1', 'card_1', $2, 1500, $3, '5411', 'INR', 'IN', 'settled')",
        )
        .bind(format!("txn_{i:03}"))
        .bind(Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap())
        .bind(format!("merchant_{}", i % 6))
        .execute(store.pool())
        .await
        .expect("insert transaction");
    }

    sqlx::query(
        "INSERT INTO transactions (id, customer_id, card_id, ts, amount_minor, merchant, \
                                   mcc, currency, country, status) \
         VALUES ('txn_suspect', 'cus_1', 'card_1', $1, 499900, 'Luxury Goods', '5944', \
                 'INR', 'US', 'settled')",
    )
    .bind(Utc.timestamp_opt(1_700_010_000, 0).unwrap())
    .execute(store.pool())
    .await
    .expect("insert suspect transaction");

    sqlx::query(
        "INSERT INTO alerts (id, customer_id, transaction_id, risk, status, reason) \
         VALUES ('alert_1', 'cus_1', 'txn_suspect', 'high', 'open', 'velocity_spike')",
    )
    .execute(store.pool())
    .await
    .expect("insert alert");
}

async fn terminal_event(registry: &RunRegistry, run_id: &str) -> TriageEvent {
    match registry.subscribe(run_id).await {
        Some(Subscription::Replay(event)) => event,
        Some(Subscription::Live(mut rx)) => loop {
            match rx.recv().await {
                Ok(event) if event.is_terminal() => break event,
                Ok(_) => continue,
                Err(err) => panic!("run channel closed before terminal event: {err}"),
            }
        },
        None => panic!("run {run_id} not registered"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn high_velocity_run_completes_with_contiguous_trace() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping triage pipeline test; set FRAUDESK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_schema(&db_url).await;
    let store = Store::connect_and_migrate(&schema_url, Duration::from_millis(2000))
        .await
        .expect("store init");
    seed_high_velocity_alert(&store).await;

    let registry = RunRegistry::new(Duration::from_secs(300));
    let orchestrator = Orchestrator::new(store.clone(), registry.clone(), TriageConfig::default());

    let run_id = orchestrator.start("alert_1").await;
    let terminal = terminal_event(&registry, &run_id).await;

    let TriageEvent::Complete { result } = terminal else {
        panic!("expected a complete event, got {terminal:?}");
    };
    assert_eq!(result.risk, Risk::High);
    assert_eq!(result.recommendation, Recommendation::FreezeCard);
    assert_eq!(result.confidence, 0.92);
    assert!(!result.requires_otp, "kyc level 2 never demands an OTP");
    assert!(!result.fallback_used);
    for reason in ["high_velocity", "large_amount", "foreign_transaction"] {
        assert!(
            result.reasons.contains(&reason.to_string()),
            "missing reason {reason}: {:?}",
            result.reasons
        );
    }

    let run_row = sqlx::query("SELECT status, risk, fallback_used FROM triage_runs WHERE id = $1")
        .bind(&run_id)
        .fetch_one(store.pool())
        .await
        .expect("run row persisted");
    assert_eq!(run_row.try_get::<&str, _>("status").unwrap(), "completed");
    assert_eq!(run_row.try_get::<&str, _>("risk").unwrap(), "high");

    let trace_rows = sqlx::query("SELECT seq, step, ok FROM agent_traces WHERE run_id = $1 ORDER BY seq")
        .bind(&run_id)
        .fetch_all(store.pool())
        .await
        .expect("trace rows persisted");

    assert_eq!(trace_rows.len(), result.steps.len());
    let expected_steps = [
        "get_profile",
        "recent_transactions",
        "risk_signals",
        "kb_lookup",
        "decide",
    ];
    assert_eq!(trace_rows.len(), expected_steps.len());
    for (i, row) in trace_rows.iter().enumerate() {
        assert_eq!(row.try_get::<i32, _>("seq").unwrap(), i as i32);
        assert_eq!(row.try_get::<&str, _>("step").unwrap(), expected_steps[i]);
        assert!(row.try_get::<bool, _>("ok").unwrap());
    }

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn exhausted_retries_take_the_fallback_path() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping triage fallback test; set FRAUDESK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_schema(&db_url).await;
    let store = Store::connect_and_migrate(&schema_url, Duration::from_millis(2000))
        .await
        .expect("store init");
    seed_high_velocity_alert(&store).await;

    let registry = RunRegistry::new(Duration::from_secs(300));
    let config = TriageConfig {
        fault_injection_rate: 1.0,
        ..TriageConfig::default()
    };
    let orchestrator = Orchestrator::new(store.clone(), registry.clone(), config);

    let run_id = orchestrator.start("alert_1").await;
    let terminal = terminal_event(&registry, &run_id).await;

    let TriageEvent::Complete { result } = terminal else {
        panic!("expected a complete event, got {terminal:?}");
    };
    assert!(result.fallback_used);
    assert_eq!(result.risk, Risk::Medium, "fallback score 0.5 maps to medium");
    assert_eq!(result.reasons, vec!["service_unavailable".to_string()]);

    let failed_attempts = result
        .steps
        .iter()
        .filter(|s| s.name == "risk_signals" && !s.ok)
        .count();
    assert_eq!(failed_attempts, 3, "first attempt plus two retries");
    assert!(
        result
            .steps
            .iter()
            .any(|s| s.name == "risk_signals_fallback" && s.ok)
    );

    let run_row = sqlx::query("SELECT fallback_used FROM triage_runs WHERE id = $1")
        .bind(&run_id)
        .fetch_one(store.pool())
        .await
        .expect("run row persisted");
    assert!(run_row.try_get::<bool, _>("fallback_used").unwrap());

    let trace_rows = sqlx::query("SELECT seq FROM agent_traces WHERE run_id = $1 ORDER BY seq")
        .bind(&run_id)
        .fetch_all(store.pool())
        .await
        .expect("trace rows persisted");
    for (i, row) in trace_rows.iter().enumerate() {
        assert_eq!(row.try_get::<i32, _>("seq").unwrap(), i as i32);
    }
    assert_eq!(trace_rows.len(), result.steps.len());

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_alert_persists_a_failed_run() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping triage failure test; set FRAUDESK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_schema(&db_url).await;
    let store = Store::connect_and_migrate(&schema_url, Duration::from_millis(2000))
        .await
        .expect("store init");

    let registry = RunRegistry::new(Duration::from_secs(300));
    let orchestrator = Orchestrator::new(store.clone(), registry.clone(), TriageConfig::default());

    let run_id = orchestrator.start("alert_missing").await;
    let terminal = terminal_event(&registry, &run_id).await;

    let TriageEvent::Error { message } = terminal else {
        panic!("expected an error event, got {terminal:?}");
    };
    assert!(message.contains("not found"), "got: {message}");

    let run_row = sqlx::query("SELECT status FROM triage_runs WHERE id = $1")
        .bind(&run_id)
        .fetch_one(store.pool())
        .await
        .expect("failed run row persisted");
    assert_eq!(run_row.try_get::<&str, _>("status").unwrap(), "failed");

    let trace_rows = sqlx::query("SELECT step, ok FROM agent_traces WHERE run_id = $1 ORDER BY seq")
        .bind(&run_id)
        .fetch_all(store.pool())
        .await
        .expect("trace rows persisted");
    assert_eq!(trace_rows.len(), 1);
    assert_eq!(
        trace_rows[0].try_get::<&str, _>("step").unwrap(),
        "get_profile"
    );
    assert!(!trace_rows[0].try_get::<bool, _>("ok").unwrap());

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}
