//! Admin retry endpoint: `POST /api/admin/retry`.

use axum::extract::Extension;
use axum::Json;

use crate::resilience::AdminRetryRequest;
use crate::server::app::AppState;

use super::{envelope_with_ids, ApiResult};

/// Execute an admin retry operation. Permission and eligibility denials
/// come back as successful envelopes with `applied: false` and the denial
/// reason; only store failures and unknown jobs produce error responses.
pub async fn admin_retry_handler(
    Extension(state): Extension<AppState>,
    Json(request): Json<AdminRetryRequest>,
) -> ApiResult {
    let job_id = request.job_id;
    let outcome = state.deps.admin.execute(request).await?;
    Ok(envelope_with_ids(vec![job_id], outcome))
}
