use axum::{body::Bytes, extract::State, http::StatusCode, Json};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use super::{AppError, AppState};
use crate::analysis::{process_text, TextAnalysis};
use crate::message::{Payload, PayloadValue, ANALYSIS_FIELD, DATA_FIELD, TEXT_FIELD};

pub const ACCEPTED_MESSAGE: &str = "Data sent to queue";

#[derive(Debug, Serialize)]
pub struct StatusMessage {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<TextAnalysis>,
    pub status: StatusMessage,
    pub data: String,
}

#[derive(Debug, Serialize)]
pub struct LatestResponse {
    pub data: String,
}

/// Require a non-empty `text` or `data` string; any one that is present must be valid.
///
/// `analysis` is reserved for the worker, and no string may contain NUL since
/// the document store cannot hold it.
fn validate(payload: &Payload) -> Result<(), AppError> {
    if payload.get(ANALYSIS_FIELD).is_some() {
        return Err(AppError::InvalidInput(format!(
            "'{}' is a reserved field",
            ANALYSIS_FIELD
        )));
    }

    if let Some(field) = payload.fields().find_map(|(key, value)| {
        value.as_str().filter(|s| s.contains('\0')).map(|_| key)
    }) {
        return Err(AppError::InvalidInput(format!(
            "'{}' must not contain NUL characters",
            field
        )));
    }

    let mut found = false;

    for field in [TEXT_FIELD, DATA_FIELD] {
        match payload.get(field) {
            None => {}
            Some(PayloadValue::Text(s)) if !s.trim().is_empty() => found = true,
            Some(_) => {
                return Err(AppError::InvalidInput(format!(
                    "'{}' must be a non-empty string",
                    field
                )))
            }
        }
    }

    if found {
        Ok(())
    } else {
        Err(AppError::InvalidInput(
            "payload requires a 'text' or 'data' field".to_string(),
        ))
    }
}

/// Validate a payload and publish it to the queue
pub async fn submit(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SubmitResponse>, AppError> {
    let value: Value = serde_json::from_slice(&body)
        .map_err(|e| AppError::InvalidInput(format!("invalid JSON: {}", e)))?;
    let payload = Payload::from_value(value).map_err(|e| AppError::InvalidInput(e.to_string()))?;
    validate(&payload)?;

    let encoded = payload
        .encode()
        .map_err(|e| AppError::InternalError(format!("encode payload: {}", e)))?;

    state.broker.publish(&state.queue, encoded).await.map_err(|e| {
        tracing::error!(queue = %state.queue, error = %e, "Publish failed");
        AppError::from(e)
    })?;

    tracing::info!(queue = %state.queue, "Message queued for processing");

    Ok(Json(SubmitResponse {
        analysis: payload
            .text()
            .filter(|_| state.analyze_text)
            .map(process_text),
        status: StatusMessage {
            message: ACCEPTED_MESSAGE.to_string(),
        },
        data: payload.content().unwrap_or_default().to_string(),
    }))
}

/// Content of the most recently stored document, or "" when there is none
pub async fn fetch_latest(
    State(state): State<Arc<AppState>>,
) -> Result<Json<LatestResponse>, AppError> {
    let latest = state.store.find_latest().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to read latest document");
        AppError::from(e)
    })?;

    let data = latest
        .as_ref()
        .and_then(|doc| doc.content())
        .unwrap_or_default()
        .to_string();

    Ok(Json(LatestResponse { data }))
}

/// Health check endpoint (liveness)
pub async fn health_check() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "docrelay",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Readiness check endpoint - verifies broker and store connectivity
pub async fn readiness_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    let broker = state.broker.ping().await;
    let store = state.store.ping().await;

    let status = if broker.is_ok() && store.is_ok() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let describe = |ok: bool| if ok { "connected" } else { "unavailable" };

    (
        status,
        Json(serde_json::json!({
            "status": if status == StatusCode::OK { "ready" } else { "not_ready" },
            "service": "docrelay",
            "broker": describe(broker.is_ok()),
            "store": describe(store.is_ok()),
        })),
    )
}
