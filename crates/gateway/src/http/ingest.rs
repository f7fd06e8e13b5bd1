use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, StatusCode};
use chrono::{DateTime, Utc};
use fraudesk_contracts::Transaction;
use fraudesk_store::StoreError;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use super::{ApiError, AppState, json_error, require_api_key, store_error};

const MAX_BATCH_ROWS: usize = 1000;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(super) struct IngestTransaction {
    #[serde(default)]
    id: Option<String>,
    customer_id: String,
    card_id: String,
    #[serde(default)]
    ts: Option<DateTime<Utc>>,
    amount_minor: i64,
    merchant: String,
    mcc: String,
    #[serde(default)]
    currency: Option<String>,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    city: Option<String>,
    #[serde(default)]
    country: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct IngestResponse {
    inserted: u64,
}

pub(super) async fn ingest_transactions(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<Vec<IngestTransaction>>, JsonRejection>,
) -> Result<Json<IngestResponse>, ApiError> {
    require_api_key(&headers, &state.config)?;
    let Json(batch) = req.map_err(|_| {
        json_error(
            StatusCode::BAD_REQUEST,
            "validation",
            "expected a JSON array of transactions",
        )
    })?;

    if batch.len() > MAX_BATCH_ROWS {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "validation",
            format!("batch exceeds {} rows", MAX_BATCH_ROWS),
        ));
    }

    let mut rows = Vec::with_capacity(batch.len());
    for (idx, item) in batch.into_iter().enumerate() {
        if item.amount_minor <= 0 {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "validation",
                format!("row {}: amountMinor must be positive", idx),
            ));
        }
        if item.customer_id.trim().is_empty() || item.card_id.trim().is_empty() {
            return Err(json_error(
                StatusCode::BAD_REQUEST,
                "validation",
                format!("row {}: customerId and cardId are required", idx),
            ));
        }

        rows.push(Transaction {
            id: item
                .id
                .map(|id| id.trim().to_string())
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| Ulid::new().to_string()),
            customer_id: item.customer_id.trim().to_string(),
            card_id: item.card_id.trim().to_string(),
            ts: item.ts.unwrap_or_else(Utc::now),
            amount_minor: item.amount_minor,
            merchant: item.merchant,
            mcc: item.mcc,
            currency: item.currency.unwrap_or_else(|| "INR".to_string()),
            device_id: item.device_id,
            city: item.city,
            country: item.country.unwrap_or_else(|| "IN".to_string()),
            status: item.status.unwrap_or_else(|| "settled".to_string()),
        });
    }

    let inserted = state
        .store
        .ingest_transactions(&rows)
        .await
        .map_err(|err| match constraint_violation(&err) {
            Some(message) => json_error(StatusCode::BAD_REQUEST, "validation", message),
            None => store_error(err),
        })?;

    tracing::info!(inserted, "gateway.transactions_ingested");
    Ok(Json(IngestResponse { inserted }))
}

fn constraint_violation(err: &StoreError) -> Option<String> {
    match err.database_code().as_deref() {
        // foreign_key_violation: unknown customer or card
        Some("23503") => Some("unknown customer or card in batch".to_string()),
        // unique_violation: duplicate transaction id
        Some("23505") => Some("duplicate transaction id in batch".to_string()),
        _ => None,
    }
}
