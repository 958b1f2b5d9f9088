//! Retry subsystem endpoint: `/api/retry?action=...`.

use std::time::Duration;

use axum::extract::{Extension, Query};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::resilience::{classify, evaluate, RawFailure, RetryConfig};
use crate::server::app::AppState;

use super::{envelope, envelope_with_ids, ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct RetryQuery {
    pub action: String,
    pub job_id: Option<Uuid>,
    /// Retention for `cleanup`, in hours.
    pub retention_hours: Option<u64>,
}

/// Body for `action=test`: a hypothetical failure to run through the
/// classifier and the current retry policy.
#[derive(Debug, Deserialize)]
pub struct TestRequest {
    pub http_status: Option<u16>,
    pub vendor_code: Option<String>,
    pub message: String,
    pub retry_after_ms: Option<u64>,
    #[serde(default = "default_attempt")]
    pub attempt: u32,
    #[serde(default)]
    pub elapsed_ms: u64,
}

fn default_attempt() -> u32 {
    1
}

pub async fn retry_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<RetryQuery>,
    body: Option<Json<Value>>,
) -> ApiResult {
    let deps = &state.deps;
    match query.action.as_str() {
        "test" => {
            let Some(Json(body)) = body else {
                return Err(ApiError::bad_request("action=test requires a JSON body"));
            };
            let req: TestRequest = serde_json::from_value(body)
                .map_err(|e| ApiError::bad_request(format!("invalid test request: {e}")))?;

            let raw = RawFailure {
                http_status: req.http_status,
                vendor_code: req.vendor_code,
                message: req.message,
                retry_after_ms: req.retry_after_ms,
            };
            let error = classify(&raw);
            let decision = evaluate(
                &deps.tracker.config().snapshot(),
                &error,
                req.attempt,
                Duration::from_millis(req.elapsed_ms),
            );
            Ok(envelope(json!({
                "classification": error,
                "decision": decision,
            })))
        }
        "history" => {
            let job_id = require_job_id(&query)?;
            let attempts = deps.tracker.history(job_id).await?;
            Ok(envelope_with_ids(vec![job_id], attempts))
        }
        "eligibility" => {
            let job_id = require_job_id(&query)?;
            let eligibility = deps.tracker.can_retry(job_id).await?;
            Ok(envelope_with_ids(vec![job_id], eligibility))
        }
        "stats" => {
            let stats = deps.tracker.stats().await?;
            Ok(envelope(stats))
        }
        "cleanup" => {
            let hours = query.retention_hours.unwrap_or(7 * 24);
            let deleted = deps
                .tracker
                .cleanup(Duration::from_secs(hours * 3600))
                .await?;
            Ok(envelope(json!({ "deleted": deleted })))
        }
        "config" => Ok(envelope(deps.tracker.config().snapshot())),
        "update_config" => {
            let Some(Json(body)) = body else {
                return Err(ApiError::bad_request(
                    "action=update_config requires a JSON body",
                ));
            };
            let config: RetryConfig = serde_json::from_value(body)
                .map_err(|e| ApiError::bad_request(format!("invalid retry config: {e}")))?;
            // Whole-object replace; partial patches are not supported.
            deps.tracker.config().replace(config);
            Ok(envelope(deps.tracker.config().snapshot()))
        }
        other => Err(ApiError::bad_request(format!("unknown action '{other}'"))),
    }
}

fn require_job_id(query: &RetryQuery) -> Result<Uuid, ApiError> {
    query
        .job_id
        .ok_or_else(|| ApiError::bad_request(format!("action={} requires job_id", query.action)))
}
