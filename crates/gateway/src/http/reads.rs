use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use fraudesk_contracts::cursor::{Page, PageCursor, clamp_limit};
use fraudesk_contracts::{AlertSummary, CustomerProfile, Transaction};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState, json_error, store_error};
use crate::insights::{self, InsightsSummary};

const OPEN_ALERTS_LIMIT: i64 = 50;
const DEFAULT_INSIGHTS_DAYS: i64 = 90;
const MAX_INSIGHTS_DAYS: i64 = 365;

#[derive(Debug, Serialize)]
pub(super) struct AlertsResponse {
    alerts: Vec<AlertSummary>,
}

pub(super) async fn list_alerts(
    State(state): State<AppState>,
) -> Result<Json<AlertsResponse>, ApiError> {
    let alerts = state
        .store
        .open_alerts(OPEN_ALERTS_LIMIT)
        .await
        .map_err(store_error)?;
    Ok(Json(AlertsResponse { alerts }))
}

pub(super) async fn customer_profile(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
) -> Result<Json<CustomerProfile>, ApiError> {
    let profile = state
        .store
        .customer_profile(&customer_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "not_found", "customer not found"))?;
    Ok(Json(profile))
}

#[derive(Debug, Deserialize)]
pub(super) struct TransactionsQuery {
    cursor: Option<String>,
    limit: Option<i64>,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
}

pub(super) async fn customer_transactions(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<Page<Transaction>>, ApiError> {
    let cursor = match query.cursor.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(raw) => Some(PageCursor::decode(raw).map_err(|err| {
            json_error(StatusCode::BAD_REQUEST, "validation", err.to_string())
        })?),
        None => None,
    };

    let limit = clamp_limit(query.limit);
    let rows = state
        .store
        .transactions_page(&customer_id, cursor.as_ref(), limit, query.from, query.to)
        .await
        .map_err(store_error)?;

    let page = Page::from_overfetch(rows, limit as usize, |txn: &Transaction| {
        PageCursor::new(txn.ts, txn.id.clone())
    });
    Ok(Json(page))
}

#[derive(Debug, Deserialize)]
pub(super) struct InsightsQuery {
    days: Option<i64>,
}

pub(super) async fn insights_summary(
    State(state): State<AppState>,
    Path(customer_id): Path<String>,
    Query(query): Query<InsightsQuery>,
) -> Result<Json<InsightsSummary>, ApiError> {
    let days = query
        .days
        .unwrap_or(DEFAULT_INSIGHTS_DAYS)
        .clamp(1, MAX_INSIGHTS_DAYS);

    let customer = state
        .store
        .customer(&customer_id)
        .await
        .map_err(store_error)?;
    if customer.is_none() {
        return Err(json_error(
            StatusCode::NOT_FOUND,
            "not_found",
            "customer not found",
        ));
    }

    let since = Utc::now() - chrono::Duration::days(days);
    let transactions = state
        .store
        .transactions_since(&customer_id, since)
        .await
        .map_err(store_error)?;

    Ok(Json(insights::summarize(&transactions, days)))
}
