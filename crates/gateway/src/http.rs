use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::body::Body;
use axum::extract::{MatchedPath, Request, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use chrono::{SecondsFormat, Utc};
use fraudesk_store::{Store, StoreError};
use fraudesk_triage::{Orchestrator, RunRegistry};
use hex::ToHex;
use serde::Serialize;
use sha2::Digest;

use crate::config::{GatewayConfig, StartupError};
use crate::idempotency::IdempotencyCache;
use crate::metrics;
use crate::rate_limit::{Admission, MemoryWindowStore, SlidingWindowLimiter};

mod actions;
mod ingest;
mod policy;
mod reads;
mod triage;

/// Upper bound when buffering a JSON body for redaction or replay caching.
const BODY_LIMIT: usize = 2 * 1024 * 1024;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

pub fn json_error(
    status: StatusCode,
    error: impl Into<String>,
    message: impl Into<String>,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            message: message.into(),
        }),
    )
}

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pub store: Store,
    pub orchestrator: Orchestrator,
    pub runs: RunRegistry,
    pub limiter: SlidingWindowLimiter,
    pub idempotency: IdempotencyCache,
}

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let store = Store::connect_and_migrate(
        &config.db_url,
        Duration::from_millis(config.store_write_timeout_ms),
    )
    .await
    .map_err(|_| StartupError {
        code: "ERR_DB_UNAVAILABLE",
        message: "failed to initialize store".to_string(),
    })?;

    let runs = RunRegistry::new(Duration::from_secs(config.run_retention_secs));
    let orchestrator = Orchestrator::new(store.clone(), runs.clone(), config.triage());

    let limiter = SlidingWindowLimiter::new(
        Arc::new(MemoryWindowStore::new(config.rate_limit_max_keys)),
        Duration::from_millis(config.rate_limit_window_ms),
        config.rate_limit_max_requests,
    );
    let idempotency = IdempotencyCache::new(
        config.idempotency_max_entries,
        Duration::from_secs(config.idempotency_ttl_secs),
    );

    let state = AppState {
        config,
        store,
        orchestrator,
        runs,
        limiter,
        idempotency,
    };

    let api = Router::new()
        .route("/alerts", get(reads::list_alerts))
        .route("/customer/{customer_id}/profile", get(reads::customer_profile))
        .route(
            "/customer/{customer_id}/transactions",
            get(reads::customer_transactions),
        )
        .route(
            "/insights/{customer_id}/summary",
            get(reads::insights_summary),
        )
        .route("/triage", post(triage::start_triage))
        .route("/triage/{run_id}/stream", get(triage::stream_triage))
        .route("/action/freeze-card", post(actions::freeze_card))
        .route("/action/open-dispute", post(actions::open_dispute))
        .route(
            "/action/mark-false-positive",
            post(actions::mark_false_positive),
        )
        .route("/ingest/transactions", post(ingest::ingest_transactions))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            redact_bodies,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            replay_idempotent,
        ))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            rate_limit,
        ))
        .with_state(state);

    Ok(Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_exposition))
        .nest("/api", api)
        .layer(axum::middleware::from_fn(track_requests)))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "ts": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    }))
}

async fn metrics_exposition() -> Response {
    match metrics::render() {
        Ok((buffer, content_type)) => ([(header::CONTENT_TYPE, content_type)], buffer).into_response(),
        Err(err) => {
            tracing::error!(error = %err, "gateway.metrics_render_failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "failed to render metrics",
            )
            .into_response()
        }
    }
}

// -- middleware chain: rate limit, then idempotent replay, then redaction --

async fn track_requests(req: Request, next: Next) -> Response {
    let method = req.method().as_str().to_string();
    let route = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let started = Instant::now();
    let response = next.run(req).await;
    metrics::observe_http_request(
        &route,
        &method,
        response.status().as_u16(),
        started.elapsed(),
    );
    response
}

async fn rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let key = client_key(&req, &state);

    match state.limiter.check(&key) {
        Admission::Allowed => next.run(req).await,
        Admission::Limited { retry_after_secs } => {
            metrics::inc_rate_limited();
            tracing::warn!(
                client = %key,
                retry_after_secs,
                path = %req.uri().path(),
                "gateway.rate_limited"
            );

            let mut response = json_error(
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "too many requests",
            )
            .into_response();
            if let Ok(value) = HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

/// Clients are keyed by authenticated principal when they present the API
/// key, otherwise by peer address. The key itself never reaches logs or the
/// window store; only its fingerprint does.
fn client_key(req: &Request, state: &AppState) -> String {
    let api_key = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty());

    if let Some(key) = api_key
        && key == state.config.api_key
    {
        return format!("key:{}", &sha256_hex(key.as_bytes())[..16]);
    }

    let peer = req
        .extensions()
        .get::<axum::extract::ConnectInfo<std::net::SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    format!("ip:{}", peer)
}

async fn replay_idempotent(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if req.method() != Method::POST {
        return next.run(req).await;
    }

    let Some(key) = req
        .headers()
        .get("idempotency-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    else {
        return next.run(req).await;
    };

    if let Some(body) = state.idempotency.get(&key).await {
        metrics::inc_idempotent_replay();
        tracing::info!(path = %req.uri().path(), "gateway.idempotent_replay");
        return (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response();
    }

    let response = next.run(req).await;
    if !response.status().is_success() {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(error = %err, "gateway.response_buffering_failed");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "failed to buffer response",
            )
            .into_response();
        }
    };

    state.idempotency.put(key, bytes.clone()).await;
    Response::from_parts(parts, Body::from(bytes))
}

async fn redact_bodies(State(_state): State<AppState>, req: Request, next: Next) -> Response {
    let request_path = req.uri().path().to_string();
    let (mut parts, body) = req.into_parts();

    let req = if is_json(&parts.headers) {
        let bytes = match axum::body::to_bytes(body, BODY_LIMIT).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return json_error(
                    StatusCode::BAD_REQUEST,
                    "validation",
                    "failed to read request body",
                )
                .into_response();
            }
        };

        if bytes.is_empty() {
            Request::from_parts(parts, Body::from(bytes))
        } else {
            match serde_json::from_slice::<serde_json::Value>(&bytes) {
                Ok(value) => {
                    let redacted = fraudesk_redact::redact_value(&value);
                    if redacted.masked {
                        metrics::inc_redacted_body("request");
                        tracing::warn!(path = %parts.uri.path(), "gateway.request_body_masked");
                    }
                    let body_bytes =
                        serde_json::to_vec(&redacted.value).unwrap_or_else(|_| bytes.to_vec());
                    parts.headers.remove(header::CONTENT_LENGTH);
                    Request::from_parts(parts, Body::from(body_bytes))
                }
                // Malformed JSON flows through so the handler can shape the
                // validation error.
                Err(_) => Request::from_parts(parts, Body::from(bytes)),
            }
        }
    } else {
        Request::from_parts(parts, body)
    };

    let response = next.run(req).await;

    if !is_json(response.headers()) {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::error!(error = %err, "gateway.response_buffering_failed");
            return json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                "failed to buffer response",
            )
            .into_response();
        }
    };

    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) => {
            let redacted = fraudesk_redact::redact_value(&value);
            if redacted.masked {
                metrics::inc_redacted_body("response");
                tracing::warn!(path = %request_path, "gateway.response_body_masked");
            }
            let body_bytes = serde_json::to_vec(&redacted.value).unwrap_or_else(|_| bytes.to_vec());
            parts.headers.remove(header::CONTENT_LENGTH);
            Response::from_parts(parts, Body::from(body_bytes))
        }
        Err(_) => Response::from_parts(parts, Body::from(bytes)),
    }
}

fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"))
}

// -- shared handler helpers ------------------------------------------------

pub(crate) fn require_api_key(headers: &HeaderMap, config: &GatewayConfig) -> Result<(), ApiError> {
    let supplied = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing X-API-Key header",
            )
        })?;

    if supplied != config.api_key {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "invalid API key",
        ));
    }

    Ok(())
}

pub(crate) fn actor_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-operator-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .unwrap_or("system")
        .to_string()
}

pub(crate) fn store_error(err: StoreError) -> ApiError {
    tracing::error!(error = %err, "gateway.store_error");
    json_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "internal",
        "store unavailable",
    )
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(bytes);
    hasher.finalize().encode_hex::<String>()
}
