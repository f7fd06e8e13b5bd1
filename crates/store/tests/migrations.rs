use std::time::Duration;

use chrono::{TimeZone, Utc};
use fraudesk_contracts::cursor::{Page, PageCursor};
use fraudesk_contracts::{CaseStatus, CaseType, Transaction};
use fraudesk_store::{DisputeOutcome, NewCase, NewCaseEvent, Store};
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

async fn seed_customer_with_card(store: &Store, customer_id: &str, card_id: &str) {
    sqlx::query(
        "INSERT INTO customers (id, display_name, email, phone, kyc_level) \
         VALUES ($1, 'Asha Rao', 'asha@example.com', '+911234500000', 2)",
    )
    .bind(customer_id)
    .execute(store.pool())
    .await
    .expect("insert customer should succeed");

    sqlx::query(
        "INSERT INTO cards (id, customer_id, last_four, network, status) \
         VALUES ($1, $2, '4242', 'visa', 'active')",
    )
    .bind(card_id)
    .bind(customer_id)
    .execute(store.pool())
    .await
    .expect("insert card should succeed");
}

fn txn(customer_id: &str, card_id: &str, id: &str, secs: i64, amount: i64) -> Transaction {
    Transaction {
        id: id.to_string(),
        customer_id: customer_id.to_string(),
        card_id: card_id.to_string(),
        ts: Utc.timestamp_opt(secs, 0).unwrap(),
        amount_minor: amount,
        merchant: "Some Shop".to_string(),
        mcc: "5411".to_string(),
        currency: "INR".to_string(),
        device_id: None,
        city: None,
        country: "IN".to_string(),
        status: "settled".to_string(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn case_events_are_append_only() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB migration test; set FRAUDESK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_schema(&db_url).await;

    let store = Store::connect_and_migrate(&schema_url, Duration::from_millis(2000))
        .await
        .expect("store init should succeed");
    store.migrate().await.expect("migrations are idempotent");

    seed_customer_with_card(&store, "cus_1", "card_1").await;

    let case_id = store
        .freeze_card_with_case(
            "card_1",
            NewCase {
                customer_id: "cus_1",
                transaction_id: None,
                case_type: CaseType::CardFreeze,
                status: CaseStatus::Completed,
                reason_code: "operator_freeze",
            },
            NewCaseEvent {
                actor: "op_7",
                action: "card_frozen",
                payload: serde_json::json!({"cardId": "card_1", "cardLast4": "4242"}),
            },
        )
        .await
        .expect("freeze should succeed");

    let event_row = sqlx::query("SELECT id FROM case_events WHERE case_id = $1")
        .bind(&case_id)
        .fetch_one(store.pool())
        .await
        .expect("one event expected");
    let event_id: String = event_row.try_get("id").expect("event id");

    let update_err = sqlx::query("UPDATE case_events SET actor = 'intruder' WHERE id = $1")
        .bind(&event_id)
        .execute(store.pool())
        .await
        .expect_err("update must be rejected");
    assert!(
        format!("{update_err:?}").contains("append-only table"),
        "expected append-only error, got: {update_err:?}"
    );

    let delete_err = sqlx::query("DELETE FROM case_events WHERE id = $1")
        .bind(&event_id)
        .execute(store.pool())
        .await
        .expect_err("delete must be rejected");
    assert!(
        format!("{delete_err:?}").contains("append-only table"),
        "expected append-only error, got: {delete_err:?}"
    );

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_dispute_returns_existing_case() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB dispute test; set FRAUDESK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_schema(&db_url).await;

    let store = Store::connect_and_migrate(&schema_url, Duration::from_millis(2000))
        .await
        .expect("store init should succeed");

    seed_customer_with_card(&store, "cus_1", "card_1").await;
    store
        .ingest_transactions(&[txn("cus_1", "card_1", "txn_1", 1_700_000_000, 12_000)])
        .await
        .expect("ingest should succeed");

    let case = NewCase {
        customer_id: "cus_1",
        transaction_id: Some("txn_1"),
        case_type: CaseType::Dispute,
        status: CaseStatus::Open,
        reason_code: "fraud",
    };
    let event = NewCaseEvent {
        actor: "op_7",
        action: "dispute_opened",
        payload: serde_json::json!({"txnId": "txn_1", "reasonCode": "fraud"}),
    };

    let first = store
        .open_dispute_case("txn_1", case.clone(), event.clone())
        .await
        .expect("first dispute should open");
    let DisputeOutcome::Created { case_id } = first else {
        panic!("first call must create the case");
    };

    let second = store
        .open_dispute_case("txn_1", case, event)
        .await
        .expect("second dispute should resolve");
    assert_eq!(
        second,
        DisputeOutcome::Existing {
            case_id: case_id.clone()
        }
    );

    let count_row = sqlx::query(
        "SELECT COUNT(*) AS n FROM cases WHERE case_type = 'dispute' AND transaction_id = 'txn_1'",
    )
    .fetch_one(store.pool())
    .await
    .expect("count should succeed");
    assert_eq!(count_row.try_get::<i64, _>("n").expect("count"), 1);

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn keyset_pagination_covers_all_rows_without_duplicates() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping DB pagination test; set FRAUDESK_TEST_DB_URL to enable");
        return;
    };

    let (admin_pool, schema, schema_url) = create_schema(&db_url).await;

    let store = Store::connect_and_migrate(&schema_url, Duration::from_millis(2000))
        .await
        .expect("store init should succeed");

    seed_customer_with_card(&store, "cus_1", "card_1").await;

    let rows: Vec<Transaction> = (0..23)
        .map(|i| {
            txn(
                "cus_1",
                "card_1",
                &format!("txn_{i:03}"),
                1_700_000_000 + i * 60,
                1_000 + i,
            )
        })
        .collect();
    store
        .ingest_transactions(&rows)
        .await
        .expect("ingest should succeed");

    let limit = 7usize;
    let mut seen = Vec::new();
    let mut cursor: Option<PageCursor> = None;

    loop {
        let fetched = store
            .transactions_page("cus_1", cursor.as_ref(), limit as i64, None, None)
            .await
            .expect("page query should succeed");
        let page = Page::from_overfetch(fetched, limit, |t: &Transaction| {
            PageCursor::new(t.ts, t.id.clone())
        });

        for item in &page.items {
            assert!(
                !seen.contains(&item.id),
                "duplicate row {} across pages",
                item.id
            );
            seen.push(item.id.clone());
        }

        if !page.has_more {
            break;
        }
        let next = page.next_cursor.expect("cursor expected while has_more");
        cursor = Some(PageCursor::decode(&next).expect("cursor decodes"));
    }

    assert_eq!(seen.len(), 23, "every row is returned exactly once");

    let mut expected: Vec<String> = (0..23).map(|i| format!("txn_{i:03}")).collect();
    expected.reverse();
    assert_eq!(seen, expected, "pages preserve (ts, id) descending order");

    store.close().await;
    drop_schema(&admin_pool, &schema).await;
    admin_pool.close().await;
}
