//! Job CRUD and pipeline execution endpoints.

use axum::extract::{Extension, Query};
use axum::Json;
use serde::Deserialize;
use uuid::Uuid;

use crate::resilience::{Job, JobStatus, TransitionRequest};
use crate::server::app::AppState;

use super::{envelope, envelope_with_ids, ApiError, ApiResult};

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub topic: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

fn default_content_type() -> String {
    "article".to_string()
}

pub async fn create_job_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<CreateJobRequest>,
) -> ApiResult {
    if request.topic.trim().is_empty() {
        return Err(ApiError::bad_request("topic must not be empty"));
    }
    let job = Job::new(request.topic.trim(), &request.content_type)
        .insert(&state.deps.db_pool)
        .await?;
    Ok(envelope_with_ids(vec![job.id], job))
}

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    pub id: Option<Uuid>,
}

pub async fn get_jobs_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<JobQuery>,
) -> ApiResult {
    if let Some(id) = query.id {
        let job = Job::find_optional(id, &state.deps.db_pool)
            .await?
            .ok_or_else(|| ApiError::bad_request(format!("job {id} not found")))?;
        return Ok(envelope_with_ids(vec![id], job));
    }
    let jobs = Job::find_recent(50, &state.deps.db_pool).await?;
    Ok(envelope(jobs))
}

#[derive(Debug, Deserialize)]
pub struct CancelRequest {
    pub job_id: Uuid,
    #[serde(default = "default_cancel_reason")]
    pub reason: String,
}

fn default_cancel_reason() -> String {
    "cancelled by request".to_string()
}

/// Cancel a pending or processing job. Cancelling a terminal job is a
/// no-op; an in-flight attempt's eventual outcome will no-op too.
pub async fn cancel_job_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<CancelRequest>,
) -> ApiResult {
    let outcome = state
        .deps
        .status
        .transition(TransitionRequest::system(
            request.job_id,
            JobStatus::Cancelled,
            request.reason,
        ))
        .await?;
    Ok(envelope_with_ids(vec![request.job_id], outcome))
}

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub job_id: Uuid,
}

/// Run one pending job through the pipeline and report the outcome,
/// including scheduling decisions (retry delays, short-circuit waits).
pub async fn process_job_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<ProcessRequest>,
) -> ApiResult {
    let outcome = state.pipeline.run(request.job_id).await?;
    Ok(envelope_with_ids(vec![request.job_id], outcome))
}
