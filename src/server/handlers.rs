//! HTTP route handlers.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::delivery::{AccumulatorHandle, RotationOutcome};
use crate::record::LogRecord;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: AccumulatorHandle<LogRecord>,
}

/// Body of `/rotate` responses.
#[derive(Debug, Serialize)]
pub struct RotateResponse {
    pub state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Handle POST /log
///
/// The body is the JSON array fluent-bit's HTTP output sends. Records are
/// queued in order; the response does not wait for delivery.
pub async fn handle_log(State(state): State<AppState>, body: Bytes) -> Response {
    let records: Vec<LogRecord> = match serde_json::from_slice(&body) {
        Ok(records) => records,
        Err(e) => {
            warn!("Error decoding json: {}", e);
            return (StatusCode::BAD_REQUEST, "Error decoding json").into_response();
        }
    };

    let count = records.len();
    for record in records {
        state.pipeline.push(record).await;
    }
    info!("{} message(s) buffered", count);

    (StatusCode::OK, "OK").into_response()
}

/// Handle POST /rotate
pub async fn handle_rotate(State(state): State<AppState>) -> Response {
    match state.pipeline.rotate().await {
        Ok(outcome) => {
            if let RotationOutcome::Rotated { from, to } = &outcome {
                info!("Rotation requested over HTTP: {} -> {}", from, to);
            }
            let body = RotateResponse {
                state: "Ok",
                rotated: Some(outcome.rotated()),
                error: None,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            let body = RotateResponse {
                state: "Fail",
                rotated: None,
                error: Some(e.to_string()),
            };
            (StatusCode::GATEWAY_TIMEOUT, Json(body)).into_response()
        }
    }
}

/// Handle GET /ping
pub async fn handle_ping() -> &'static str {
    debug!("ping");
    "PONG\n"
}

/// Handle GET /stats
pub async fn handle_stats(State(state): State<AppState>) -> Response {
    match state.pipeline.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}
