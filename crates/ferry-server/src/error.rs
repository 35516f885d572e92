use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ferry_shared::constants::PAYLOAD_PREVIEW_CHARS;
use ferry_shared::ProtocolError;
use ferry_store::StoreError;
use thiserror::Error;

use crate::hub::HubClosed;

/// Errors surfaced by the HTTP API.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Not found")]
    NotFound,

    #[error("Connection limit reached")]
    AtCapacity,

    #[error("Relay hub is not running")]
    HubUnavailable,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<ProtocolError> for ServerError {
    fn from(e: ProtocolError) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}

impl From<HubClosed> for ServerError {
    fn from(_: HubClosed) -> Self {
        ServerError::HubUnavailable
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ServerError::BadRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, self.to_string()),
            ServerError::NotFound | ServerError::Store(StoreError::NotFound) => {
                (StatusCode::NOT_FOUND, "Not found".to_string())
            }
            ServerError::AtCapacity | ServerError::HubUnavailable => {
                (StatusCode::SERVICE_UNAVAILABLE, self.to_string())
            }
            ServerError::Store(e) => {
                tracing::warn!(error = %e, "Store failure while serving request");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = serde_json::json!({
            "error": message,
        });

        (status, axum::Json(body)).into_response()
    }
}

/// Why an ingestion cycle produced nothing.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The request still failed after the retry middleware gave up.
    #[error("upstream request failed: {0}")]
    Request(#[from] reqwest_middleware::Error),

    #[error("upstream returned HTTP {status}: {preview}")]
    Status { status: u16, preview: String },

    #[error("malformed upstream payload ({reason}): {preview}")]
    Malformed { reason: String, preview: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("relay hub is not running")]
    HubClosed,
}

impl From<HubClosed> for IngestError {
    fn from(_: HubClosed) -> Self {
        IngestError::HubClosed
    }
}

impl IngestError {
    pub fn malformed(reason: impl ToString, body: &str) -> Self {
        IngestError::Malformed {
            reason: reason.to_string(),
            preview: preview(body),
        }
    }
}

/// First characters of an upstream body, for log lines.
pub fn preview(body: &str) -> String {
    body.chars().take(PAYLOAD_PREVIEW_CHARS).collect()
}
