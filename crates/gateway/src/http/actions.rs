//! Operator actions. Each endpoint authenticates the API key, applies its
//! policy gates before mutating anything, performs the mutation and the
//! audit append as one store transaction, and reports conflicts as 2xx
//! status tags rather than errors.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use fraudesk_contracts::{AlertStatus, CardStatus, CaseStatus, CaseType};
use fraudesk_store::{DisputeOutcome, NewCase, NewCaseEvent};
use serde::{Deserialize, Serialize};

use super::policy;
use super::{ApiError, AppState, actor_from_headers, json_error, require_api_key, store_error};
use crate::metrics;

const DEFAULT_FREEZE_REASON: &str = "operator_freeze";

fn invalid_body(_: JsonRejection) -> ApiError {
    json_error(StatusCode::BAD_REQUEST, "validation", "invalid JSON body")
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(super) struct FreezeCardRequest {
    card_id: String,
    #[serde(default)]
    otp: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct FreezeCardResponse {
    status: &'static str,
    card_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    case_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    requires_otp: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    otp_verified: Option<bool>,
}

pub(super) async fn freeze_card(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<FreezeCardRequest>, JsonRejection>,
) -> Result<Json<FreezeCardResponse>, ApiError> {
    require_api_key(&headers, &state.config)?;
    let Json(req) = req.map_err(invalid_body)?;
    let actor = actor_from_headers(&headers);

    let card_id = req.card_id.trim().to_string();
    if card_id.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "validation",
            "cardId is required",
        ));
    }

    let card = state
        .store
        .card(&card_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "not_found", "card not found"))?;

    if card.status == CardStatus::Frozen {
        metrics::observe_action("freeze_card", "already_frozen");
        return Ok(Json(FreezeCardResponse {
            status: "ALREADY_FROZEN",
            card_id,
            case_id: None,
            requires_otp: None,
            otp_verified: None,
        }));
    }

    let customer = state
        .store
        .customer(&card.customer_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "not_found", "customer not found"))?;

    let requires_otp = policy::freeze_requires_otp(customer.kyc_level);
    let otp_verified = match (&req.otp, requires_otp) {
        (None, true) => {
            metrics::observe_action("freeze_card", "pending_otp");
            return Ok(Json(FreezeCardResponse {
                status: "PENDING_OTP",
                card_id,
                case_id: None,
                requires_otp: Some(true),
                otp_verified: None,
            }));
        }
        (Some(otp), true) => {
            if !policy::verify_otp(otp.trim()) {
                metrics::observe_action("freeze_card", "otp_failed");
                return Err(json_error(
                    StatusCode::BAD_REQUEST,
                    "OTP_FAILED",
                    "supplied OTP is invalid",
                ));
            }
            true
        }
        (_, false) => false,
    };

    let reason = req
        .reason
        .as_deref()
        .map(str::trim)
        .filter(|r| !r.is_empty())
        .unwrap_or(DEFAULT_FREEZE_REASON);

    let payload = serde_json::json!({
        "cardId": card.id,
        "cardLast4": card.last_four,
        "otpVerified": otp_verified,
    });
    let payload = fraudesk_redact::redact_value(&payload).value;

    let case_id = state
        .store
        .freeze_card_with_case(
            &card_id,
            NewCase {
                customer_id: &card.customer_id,
                transaction_id: None,
                case_type: CaseType::CardFreeze,
                status: CaseStatus::Completed,
                reason_code: reason,
            },
            NewCaseEvent {
                actor: &actor,
                action: "card_frozen",
                payload,
            },
        )
        .await
        .map_err(store_error)?;

    metrics::observe_action("freeze_card", "frozen");
    tracing::info!(
        card_id = %card_id,
        customer_id = %card.customer_id,
        case_id = %case_id,
        actor = %actor,
        otp_verified,
        "gateway.freeze_card"
    );

    Ok(Json(FreezeCardResponse {
        status: "FROZEN",
        card_id,
        case_id: Some(case_id),
        requires_otp: None,
        otp_verified: Some(otp_verified),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(super) struct OpenDisputeRequest {
    txn_id: String,
    reason_code: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    confirm: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct OpenDisputeResponse {
    status: &'static str,
    case_id: String,
}

pub(super) async fn open_dispute(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<OpenDisputeRequest>, JsonRejection>,
) -> Result<Json<OpenDisputeResponse>, ApiError> {
    require_api_key(&headers, &state.config)?;
    let Json(req) = req.map_err(invalid_body)?;
    let actor = actor_from_headers(&headers);

    if !req.confirm {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "confirmation_required",
            "set confirm to true to open a dispute",
        ));
    }

    let txn_id = req.txn_id.trim().to_string();
    let reason_code = req.reason_code.trim().to_string();
    if txn_id.is_empty() || reason_code.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "validation",
            "txnId and reasonCode are required",
        ));
    }

    let txn = state
        .store
        .transaction(&txn_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "not_found", "transaction not found"))?;

    let payload = serde_json::json!({
        "txnId": txn.id,
        "merchant": txn.merchant,
        "amount": txn.amount_minor,
        "reasonCode": reason_code,
        "description": req.description,
    });
    let payload = fraudesk_redact::redact_value(&payload).value;

    let outcome = state
        .store
        .open_dispute_case(
            &txn_id,
            NewCase {
                customer_id: &txn.customer_id,
                transaction_id: Some(&txn_id),
                case_type: CaseType::Dispute,
                status: CaseStatus::Open,
                reason_code: &reason_code,
            },
            NewCaseEvent {
                actor: &actor,
                action: "dispute_opened",
                payload,
            },
        )
        .await
        .map_err(store_error)?;

    let (status, case_id, outcome_tag) = match outcome {
        DisputeOutcome::Created { case_id } => ("OPEN", case_id, "opened"),
        DisputeOutcome::Existing { case_id } => ("ALREADY_EXISTS", case_id, "already_exists"),
    };

    metrics::observe_action("open_dispute", outcome_tag);
    tracing::info!(
        txn_id = %txn_id,
        customer_id = %txn.customer_id,
        case_id = %case_id,
        actor = %actor,
        outcome = outcome_tag,
        "gateway.open_dispute"
    );

    Ok(Json(OpenDisputeResponse { status, case_id }))
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(super) struct MarkFalsePositiveRequest {
    alert_id: String,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MarkFalsePositiveResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    case_id: Option<String>,
}

pub(super) async fn mark_false_positive(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<MarkFalsePositiveRequest>, JsonRejection>,
) -> Result<Json<MarkFalsePositiveResponse>, ApiError> {
    require_api_key(&headers, &state.config)?;
    let Json(req) = req.map_err(invalid_body)?;
    let actor = actor_from_headers(&headers);

    let alert_id = req.alert_id.trim().to_string();
    if alert_id.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "validation",
            "alertId is required",
        ));
    }

    let alert = state
        .store
        .alert(&alert_id)
        .await
        .map_err(store_error)?
        .ok_or_else(|| json_error(StatusCode::NOT_FOUND, "not_found", "alert not found"))?;

    match alert.status {
        AlertStatus::FalsePositive => {
            metrics::observe_action("mark_false_positive", "already_marked");
            return Ok(Json(MarkFalsePositiveResponse {
                status: "ALREADY_MARKED",
                case_id: None,
            }));
        }
        AlertStatus::Resolved => {
            metrics::observe_action("mark_false_positive", "already_resolved");
            return Ok(Json(MarkFalsePositiveResponse {
                status: "ALREADY_RESOLVED",
                case_id: None,
            }));
        }
        AlertStatus::Open => {}
    }

    let payload = serde_json::json!({
        "alertId": alert.id,
        "originalRisk": alert.risk,
        "notes": req.notes,
    });
    let payload = fraudesk_redact::redact_value(&payload).value;

    let case_id = state
        .store
        .mark_alert_false_positive(
            &alert_id,
            NewCase {
                customer_id: &alert.customer_id,
                transaction_id: alert.transaction_id.as_deref(),
                case_type: CaseType::FalsePositive,
                status: CaseStatus::Closed,
                reason_code: "operator_false_positive",
            },
            NewCaseEvent {
                actor: &actor,
                action: "marked_false_positive",
                payload,
            },
        )
        .await
        .map_err(store_error)?;

    metrics::observe_action("mark_false_positive", "marked");
    tracing::info!(
        alert_id = %alert_id,
        customer_id = %alert.customer_id,
        case_id = %case_id,
        actor = %actor,
        "gateway.mark_false_positive"
    );

    Ok(Json(MarkFalsePositiveResponse {
        status: "MARKED",
        case_id: Some(case_id),
    }))
}
