// HTTP routes
pub mod admin;
pub mod health;
pub mod jobs;
pub mod retry;

pub use admin::*;
pub use health::*;
pub use jobs::*;
pub use retry::*;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

/// Standard success envelope: `success`, echoed ids, payload, timestamp.
pub fn envelope(result: impl Serialize) -> Json<Value> {
    envelope_with_ids(Vec::new(), result)
}

pub fn envelope_with_ids(ids: Vec<Uuid>, result: impl Serialize) -> Json<Value> {
    Json(json!({
        "success": true,
        "ids": ids,
        "result": result,
        "timestamp": Utc::now(),
    }))
}

pub type ApiResult = Result<Json<Value>, ApiError>;

/// Handler-level error mapped onto the failure envelope.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!(error = %e, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": self.message,
            "timestamp": Utc::now(),
        }));
        (self.status, body).into_response()
    }
}
