use std::convert::Infallible;
use std::time::Duration;

use async_stream::stream;
use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::response::sse::{Event, KeepAlive, Sse};
use chrono::{SecondsFormat, Utc};
use fraudesk_contracts::TriageEvent;
use fraudesk_triage::Subscription;
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::{ApiError, AppState, json_error};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "camelCase")]
pub(super) struct StartTriageRequest {
    alert_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StartTriageResponse {
    run_id: String,
    alert_id: String,
    status: &'static str,
}

pub(super) async fn start_triage(
    State(state): State<AppState>,
    req: Result<Json<StartTriageRequest>, JsonRejection>,
) -> Result<Json<StartTriageResponse>, ApiError> {
    let Json(req) = req
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "validation", "invalid JSON body"))?;

    let alert_id = req.alert_id.trim().to_string();
    if alert_id.is_empty() {
        return Err(json_error(
            StatusCode::BAD_REQUEST,
            "validation",
            "alertId is required",
        ));
    }

    let run_id = state.orchestrator.start(&alert_id).await;
    tracing::info!(run_id = %run_id, alert_id = %alert_id, "gateway.triage_started");

    Ok(Json(StartTriageResponse {
        run_id,
        alert_id,
        status: "started",
    }))
}

/// Wire frame: `{"type": …, "data": …, "timestamp": …}`.
fn frame(event: &TriageEvent) -> String {
    let mut value = serde_json::to_value(event).unwrap_or_else(|_| {
        serde_json::json!({"type": "error", "data": {"message": "event serialization failed"}})
    });
    if let Some(map) = value.as_object_mut() {
        map.insert(
            "timestamp".to_string(),
            serde_json::Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
    }
    value.to_string()
}

/// Long-lived event stream for one run. A synthetic `connected` frame goes
/// out first; the stream closes after the terminal frame. Disconnecting only
/// drops this subscriber; the run always completes so its trace is durable.
pub(super) async fn stream_triage(
    State(state): State<AppState>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    let subscription = state.runs.subscribe(&run_id).await;
    tracing::info!(
        run_id = %run_id,
        known = subscription.is_some(),
        "gateway.stream_opened"
    );

    let stream = event_stream(run_id, subscription);

    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));

    (
        headers,
        Sse::new(stream).keep_alive(
            KeepAlive::new()
                .interval(KEEP_ALIVE_INTERVAL)
                .text("keepalive"),
        ),
    )
}

fn event_stream(
    run_id: String,
    subscription: Option<Subscription>,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    stream! {
        yield Ok(Event::default().data(frame(&TriageEvent::Connected {
            run_id: run_id.clone(),
        })));

        match subscription {
            None => {
                yield Ok(Event::default().data(frame(&TriageEvent::Error {
                    message: "Run not found".to_string(),
                })));
            }
            Some(Subscription::Replay(event)) => {
                yield Ok(Event::default().data(frame(&event)));
            }
            Some(Subscription::Live(mut rx)) => {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let terminal = event.is_terminal();
                            yield Ok(Event::default().data(frame(&event)));
                            if terminal {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Either deliver every frame in order or close;
                            // a lagged subscriber gets neither.
                            tracing::warn!(
                                run_id = %run_id,
                                skipped,
                                "gateway.stream_lagged"
                            );
                            yield Ok(Event::default().data(frame(&TriageEvent::Error {
                                message: "subscriber lagged behind the run".to_string(),
                            })));
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }
    }
}
