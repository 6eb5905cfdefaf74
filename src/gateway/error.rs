use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::broker::BrokerError;
use crate::store::StoreError;

#[derive(Debug)]
pub enum AppError {
    InvalidInput(String),
    BrokerUnavailable(String),
    StoreUnavailable(String),
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::InvalidInput(msg) => (
                StatusCode::BAD_REQUEST,
                format!("Invalid input: {}", msg),
            ),
            AppError::BrokerUnavailable(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to queue message: {}", msg),
            ),
            AppError::StoreUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                format!("Document store error: {}", msg),
            ),
            AppError::InternalError(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {}", msg),
            ),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<BrokerError> for AppError {
    fn from(e: BrokerError) -> Self {
        AppError::BrokerUnavailable(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::StoreUnavailable(e.to_string())
    }
}
