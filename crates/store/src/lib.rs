//! Typed persistence adapter over the relational store.
//!
//! The orchestrator owns all writes to triage runs and traces; action
//! handlers own all writes to cards, alerts, cases and case events. Every
//! mutation here runs as one transaction, and `case_events` is append-only
//! at the schema level (a trigger rejects UPDATE and DELETE).

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fraudesk_contracts::cursor::PageCursor;
use fraudesk_contracts::{
    Account, AgentStep, Alert, AlertStatus, AlertSummary, Card, CardNetwork, CardStatus, Case,
    CaseStatus, CaseType, Customer, CustomerProfile, CustomerRef, KbDoc, Risk, Transaction,
    TriageRunRecord,
};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use ulid::Ulid;

#[derive(Debug)]
pub enum StoreError {
    Timeout,
    Sqlx(sqlx::Error),
    Decode(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Timeout => write!(f, "database call exceeded its deadline"),
            StoreError::Sqlx(err) => write!(f, "database error: {}", err),
            StoreError::Decode(message) => write!(f, "row decode failed: {}", message),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    /// SQLSTATE code of the underlying database error, if any. Lets callers
    /// distinguish constraint violations without depending on sqlx.
    pub fn database_code(&self) -> Option<String> {
        match self {
            StoreError::Sqlx(sqlx::Error::Database(db_err)) => {
                db_err.code().map(|code| code.to_string())
            }
            _ => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(value: sqlx::Error) -> Self {
        StoreError::Sqlx(value)
    }
}

fn parse_tag<T: FromStr<Err = fraudesk_contracts::TagError>>(raw: &str) -> Result<T, StoreError> {
    raw.parse::<T>()
        .map_err(|err| StoreError::Decode(err.to_string()))
}

/// New case to open inside an action transaction.
#[derive(Debug, Clone)]
pub struct NewCase<'a> {
    pub customer_id: &'a str,
    pub transaction_id: Option<&'a str>,
    pub case_type: CaseType,
    pub status: CaseStatus,
    pub reason_code: &'a str,
}

/// Audit entry appended alongside the case. The payload must already be
/// PII-redacted by the caller.
#[derive(Debug, Clone)]
pub struct NewCaseEvent<'a> {
    pub actor: &'a str,
    pub action: &'a str,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisputeOutcome {
    Created { case_id: String },
    Existing { case_id: String },
}

#[derive(Clone)]
pub struct Store {
    pool: PgPool,
    write_timeout: Duration,
}

const POOL_MAX_CONNECTIONS: u32 = 10;
const CONNECT_PROBE_DEADLINE: Duration = Duration::from_secs(3);
const MIGRATE_DEADLINE: Duration = Duration::from_secs(10);

impl Store {
    /// The pool itself is lazy; a probe query surfaces a bad URL or an
    /// unreachable host at startup instead of on the first real read.
    pub async fn connect(db_url: &str, write_timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(POOL_MAX_CONNECTIONS)
            .acquire_timeout(CONNECT_PROBE_DEADLINE)
            .connect_lazy(db_url)?;

        tokio::time::timeout(CONNECT_PROBE_DEADLINE, sqlx::query("SELECT 1").execute(&pool))
            .await
            .map_err(|_| StoreError::Timeout)??;

        Ok(Self {
            pool,
            write_timeout,
        })
    }

    pub async fn connect_and_migrate(
        db_url: &str,
        write_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let store = Self::connect(db_url, write_timeout).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        tokio::time::timeout(MIGRATE_DEADLINE, migrate(&self.pool))
            .await
            .map_err(|_| StoreError::Timeout)??;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // -- reads --------------------------------------------------------------

    pub async fn alert(&self, alert_id: &str) -> Result<Option<Alert>, StoreError> {
        let row = sqlx::query(
            "SELECT id, customer_id, transaction_id, risk, status, reason, created_at \
             FROM alerts WHERE id = $1",
        )
        .bind(alert_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_alert).transpose()
    }

    pub async fn customer(&self, customer_id: &str) -> Result<Option<Customer>, StoreError> {
        let row = sqlx::query(
            "SELECT id, display_name, email, phone, kyc_level, created_at \
             FROM customers WHERE id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_customer).transpose()
    }

    pub async fn card(&self, card_id: &str) -> Result<Option<Card>, StoreError> {
        let row = sqlx::query(
            "SELECT id, customer_id, last_four, network, status FROM cards WHERE id = $1",
        )
        .bind(card_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_card).transpose()
    }

    pub async fn transaction(&self, txn_id: &str) -> Result<Option<Transaction>, StoreError> {
        let row = sqlx::query(
            "SELECT id, customer_id, card_id, ts, amount_minor, merchant, mcc, currency, \
                    device_id, city, country, status \
             FROM transactions WHERE id = $1",
        )
        .bind(txn_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_transaction).transpose()
    }

    pub async fn open_alerts(&self, limit: i64) -> Result<Vec<AlertSummary>, StoreError> {
        let rows = sqlx::query(
            "SELECT a.id, a.customer_id, a.transaction_id, a.risk, a.status, a.reason, \
                    a.created_at, c.display_name, c.email \
             FROM alerts a \
             JOIN customers c ON c.id = a.customer_id \
             WHERE a.status = 'open' \
             ORDER BY a.created_at DESC, a.id DESC \
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AlertSummary {
                    alert: map_alert(row)?,
                    customer: CustomerRef {
                        name: row.try_get("display_name")?,
                        email: row.try_get("email")?,
                    },
                })
            })
            .collect()
    }

    pub async fn customer_profile(
        &self,
        customer_id: &str,
    ) -> Result<Option<CustomerProfile>, StoreError> {
        let Some(customer) = self.customer(customer_id).await? else {
            return Ok(None);
        };

        let card_rows = sqlx::query(
            "SELECT id, customer_id, last_four, network, status \
             FROM cards WHERE customer_id = $1 ORDER BY id",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        let cards = card_rows
            .iter()
            .map(map_card)
            .collect::<Result<Vec<_>, _>>()?;

        let account_rows = sqlx::query(
            "SELECT id, customer_id, balance_minor, currency \
             FROM accounts WHERE customer_id = $1 ORDER BY id",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;
        let accounts = account_rows
            .iter()
            .map(map_account)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(CustomerProfile {
            customer,
            cards,
            accounts,
        }))
    }

    pub async fn card_count(&self, customer_id: &str) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM cards WHERE customer_id = $1")
            .bind(customer_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    pub async fn primary_account(&self, customer_id: &str) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(
            "SELECT id, customer_id, balance_minor, currency \
             FROM accounts WHERE customer_id = $1 ORDER BY id LIMIT 1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_account).transpose()
    }

    pub async fn recent_transactions(
        &self,
        customer_id: &str,
        limit: i64,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, customer_id, card_id, ts, amount_minor, merchant, mcc, currency, \
                    device_id, city, country, status \
             FROM transactions \
             WHERE customer_id = $1 \
             ORDER BY ts DESC, id DESC \
             LIMIT $2",
        )
        .bind(customer_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_transaction).collect()
    }

    /// Keyset page ordered by `(ts, id)` descending. Fetches `limit + 1`
    /// rows; the caller drops the sentinel and derives the next cursor.
    pub async fn transactions_page(
        &self,
        customer_id: &str,
        cursor: Option<&PageCursor>,
        limit: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let (cursor_ts, cursor_id) = match cursor {
            Some(cursor) => (Some(cursor.ts), Some(cursor.id.clone())),
            None => (None, None),
        };

        let rows = sqlx::query(
            "SELECT id, customer_id, card_id, ts, amount_minor, merchant, mcc, currency, \
                    device_id, city, country, status \
             FROM transactions \
             WHERE customer_id = $1 \
               AND ($2::timestamptz IS NULL OR ts >= $2) \
               AND ($3::timestamptz IS NULL OR ts <= $3) \
               AND ($4::timestamptz IS NULL OR (ts, id) < ($4, $5)) \
             ORDER BY ts DESC, id DESC \
             LIMIT $6",
        )
        .bind(customer_id)
        .bind(from)
        .bind(to)
        .bind(cursor_ts)
        .bind(cursor_id)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_transaction).collect()
    }

    pub async fn transactions_since(
        &self,
        customer_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, customer_id, card_id, ts, amount_minor, merchant, mcc, currency, \
                    device_id, city, country, status \
             FROM transactions \
             WHERE customer_id = $1 AND ts >= $2 \
             ORDER BY ts DESC, id DESC",
        )
        .bind(customer_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(map_transaction).collect()
    }

    pub async fn kb_docs(&self, limit: i64) -> Result<Vec<KbDoc>, StoreError> {
        let rows = sqlx::query("SELECT id, title, body, tags FROM kb_docs ORDER BY id LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                Ok(KbDoc {
                    id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    body: row.try_get("body")?,
                    tags: row.try_get("tags")?,
                })
            })
            .collect()
    }

    pub async fn case(&self, case_id: &str) -> Result<Option<Case>, StoreError> {
        let row = sqlx::query(
            "SELECT id, customer_id, transaction_id, case_type, status, reason_code, created_at \
             FROM cases WHERE id = $1",
        )
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(map_case).transpose()
    }

    // -- writes -------------------------------------------------------------

    /// Freeze a card and record the case plus its audit event in one
    /// transaction. Returns the new case id.
    pub async fn freeze_card_with_case(
        &self,
        card_id: &str,
        case: NewCase<'_>,
        event: NewCaseEvent<'_>,
    ) -> Result<String, StoreError> {
        let case_id = Ulid::new().to_string();
        let event_id = Ulid::new().to_string();

        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("UPDATE cards SET status = 'frozen' WHERE id = $1")
                .bind(card_id)
                .execute(&mut *tx)
                .await?;

            insert_case(&mut tx, &case_id, &case).await?;
            insert_case_event(&mut tx, &event_id, &case_id, &event).await?;

            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(case_id)
    }

    /// Open a dispute case unless one is already live for the transaction.
    /// The existence check and the insert share a transaction; the partial
    /// unique index backstops concurrent openers.
    pub async fn open_dispute_case(
        &self,
        txn_id: &str,
        case: NewCase<'_>,
        event: NewCaseEvent<'_>,
    ) -> Result<DisputeOutcome, StoreError> {
        let case_id = Ulid::new().to_string();
        let event_id = Ulid::new().to_string();

        let outcome = tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;

            let existing = sqlx::query(
                "SELECT id FROM cases \
                 WHERE case_type = 'dispute' AND transaction_id = $1 \
                   AND status IN ('open', 'investigating') \
                 FOR UPDATE",
            )
            .bind(txn_id)
            .fetch_optional(&mut *tx)
            .await?;

            if let Some(row) = existing {
                tx.commit().await?;
                return Ok::<DisputeOutcome, sqlx::Error>(DisputeOutcome::Existing {
                    case_id: row.try_get("id")?,
                });
            }

            insert_case(&mut tx, &case_id, &case).await?;
            insert_case_event(&mut tx, &event_id, &case_id, &event).await?;

            tx.commit().await?;
            Ok(DisputeOutcome::Created {
                case_id: case_id.clone(),
            })
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(outcome)
    }

    /// Resolve an alert as a false positive: status update, closed case and
    /// audit event in one transaction. Returns the new case id.
    pub async fn mark_alert_false_positive(
        &self,
        alert_id: &str,
        case: NewCase<'_>,
        event: NewCaseEvent<'_>,
    ) -> Result<String, StoreError> {
        let case_id = Ulid::new().to_string();
        let event_id = Ulid::new().to_string();

        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;

            sqlx::query("UPDATE alerts SET status = 'false_positive' WHERE id = $1")
                .bind(alert_id)
                .execute(&mut *tx)
                .await?;

            insert_case(&mut tx, &case_id, &case).await?;
            insert_case_event(&mut tx, &event_id, &case_id, &event).await?;

            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(case_id)
    }

    /// Persist a finished run and its full trace atomically. `seq` follows
    /// the emission order of the steps.
    pub async fn insert_triage_run(
        &self,
        record: &TriageRunRecord,
        steps: &[AgentStep],
    ) -> Result<(), StoreError> {
        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;

            sqlx::query(
                "INSERT INTO triage_runs (id, alert_id, status, risk, recommendation, reasons, \
                                          confidence, fallback_used, started_at, ended_at, \
                                          total_duration_ms) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(&record.id)
            .bind(&record.alert_id)
            .bind(record.status.as_str())
            .bind(record.risk.map(Risk::as_str))
            .bind(record.recommendation.map(|r| r.as_str()))
            .bind(&record.reasons)
            .bind(record.confidence)
            .bind(record.fallback_used)
            .bind(record.started_at)
            .bind(record.ended_at)
            .bind(record.total_duration_ms)
            .execute(&mut *tx)
            .await?;

            for (seq, step) in steps.iter().enumerate() {
                let detail = step
                    .result
                    .as_ref()
                    .map(|result| serde_json::to_value(result).unwrap_or_default());

                sqlx::query(
                    "INSERT INTO agent_traces (run_id, seq, step, ok, duration_ms, detail) \
                     VALUES ($1, $2, $3, $4, $5, $6)",
                )
                .bind(&record.id)
                .bind(seq as i32)
                .bind(&step.name)
                .bind(step.ok)
                .bind(step.duration_ms as i64)
                .bind(detail)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok::<(), sqlx::Error>(())
        })
        .await
        .map_err(|_| StoreError::Timeout)??;

        Ok(())
    }

    /// Bulk-insert transactions in one transaction. Returns the row count.
    pub async fn ingest_transactions(&self, rows: &[Transaction]) -> Result<u64, StoreError> {
        tokio::time::timeout(self.write_timeout, async {
            let mut tx = self.pool.begin().await?;

            for txn in rows {
                sqlx::query(
                    "INSERT INTO transactions (id, customer_id, card_id, ts, amount_minor, \
                                               merchant, mcc, currency, device_id, city, \
                                               country, status) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
                )
                .bind(&txn.id)
                .bind(&txn.customer_id)
                .bind(&txn.card_id)
                .bind(txn.ts)
                .bind(txn.amount_minor)
                .bind(&txn.merchant)
                .bind(&txn.mcc)
                .bind(&txn.currency)
                .bind(&txn.device_id)
                .bind(&txn.city)
                .bind(&txn.country)
                .bind(&txn.status)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok::<u64, sqlx::Error>(rows.len() as u64)
        })
        .await
        .map_err(|_| StoreError::Timeout)?
        .map_err(StoreError::from)
    }
}

async fn insert_case(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    case_id: &str,
    case: &NewCase<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO cases (id, customer_id, transaction_id, case_type, status, reason_code) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(case_id)
    .bind(case.customer_id)
    .bind(case.transaction_id)
    .bind(case.case_type.as_str())
    .bind(case.status.as_str())
    .bind(case.reason_code)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

async fn insert_case_event(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    event_id: &str,
    case_id: &str,
    event: &NewCaseEvent<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO case_events (id, case_id, actor, action, payload) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(event_id)
    .bind(case_id)
    .bind(event.actor)
    .bind(event.action)
    .bind(&event.payload)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

fn map_customer(row: &PgRow) -> Result<Customer, StoreError> {
    Ok(Customer {
        id: row.try_get("id")?,
        display_name: row.try_get("display_name")?,
        email: row.try_get("email")?,
        phone: row.try_get("phone")?,
        kyc_level: row.try_get("kyc_level")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_card(row: &PgRow) -> Result<Card, StoreError> {
    Ok(Card {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        last_four: row.try_get("last_four")?,
        network: parse_tag::<CardNetwork>(row.try_get::<&str, _>("network")?)?,
        status: parse_tag::<CardStatus>(row.try_get::<&str, _>("status")?)?,
    })
}

fn map_account(row: &PgRow) -> Result<Account, StoreError> {
    Ok(Account {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        balance_minor: row.try_get("balance_minor")?,
        currency: row.try_get("currency")?,
    })
}

fn map_transaction(row: &PgRow) -> Result<Transaction, StoreError> {
    Ok(Transaction {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        card_id: row.try_get("card_id")?,
        ts: row.try_get("ts")?,
        amount_minor: row.try_get("amount_minor")?,
        merchant: row.try_get("merchant")?,
        mcc: row.try_get("mcc")?,
        currency: row.try_get("currency")?,
        device_id: row.try_get("device_id")?,
        city: row.try_get("city")?,
        country: row.try_get("country")?,
        status: row.try_get("status")?,
    })
}

fn map_alert(row: &PgRow) -> Result<Alert, StoreError> {
    Ok(Alert {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        transaction_id: row.try_get("transaction_id")?,
        risk: parse_tag::<Risk>(row.try_get::<&str, _>("risk")?)?,
        status: parse_tag::<AlertStatus>(row.try_get::<&str, _>("status")?)?,
        reason: row.try_get("reason")?,
        created_at: row.try_get("created_at")?,
    })
}

fn map_case(row: &PgRow) -> Result<Case, StoreError> {
    Ok(Case {
        id: row.try_get("id")?,
        customer_id: row.try_get("customer_id")?,
        transaction_id: row.try_get("transaction_id")?,
        case_type: parse_tag::<CaseType>(row.try_get::<&str, _>("case_type")?)?,
        status: parse_tag::<CaseStatus>(row.try_get::<&str, _>("status")?)?,
        reason_code: row.try_get("reason_code")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
