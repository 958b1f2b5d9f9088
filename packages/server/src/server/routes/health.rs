//! Liveness (`/health`) and the health dashboard (`/api/health?action=...`).

use axum::extract::{Extension, Query};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::resilience::{BreakerState, Job};
use crate::server::app::AppState;

use super::{envelope, envelope_with_ids, ApiError, ApiResult};

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    database: DatabaseHealth,
    connection_pool: ConnectionPoolHealth,
}

#[derive(Serialize)]
pub struct DatabaseHealth {
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Serialize)]
pub struct ConnectionPoolHealth {
    size: u32,
    idle_connections: usize,
}

/// Health check endpoint
///
/// Returns 200 OK if the database responds, 503 Service Unavailable
/// otherwise.
pub async fn health_handler(
    Extension(state): Extension<AppState>,
) -> (StatusCode, Json<HealthResponse>) {
    let db_health = match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        sqlx::query("SELECT 1").execute(&state.deps.db_pool),
    )
    .await
    {
        Ok(Ok(_)) => DatabaseHealth {
            status: "ok".to_string(),
            error: None,
        },
        Ok(Err(e)) => DatabaseHealth {
            status: "error".to_string(),
            error: Some(format!("Query failed: {}", e)),
        },
        Err(_) => DatabaseHealth {
            status: "error".to_string(),
            error: Some("Query timeout (>5s)".to_string()),
        },
    };

    let pool_health = ConnectionPoolHealth {
        size: state.deps.db_pool.size(),
        idle_connections: state.deps.db_pool.num_idle(),
    };

    let is_healthy = db_health.status == "ok";
    let status_code = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status_code,
        Json(HealthResponse {
            status: if is_healthy { "healthy" } else { "unhealthy" }.to_string(),
            database: db_health,
            connection_pool: pool_health,
        }),
    )
}

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    pub action: String,
    pub job_id: Option<Uuid>,
}

pub async fn api_health_handler(
    Extension(state): Extension<AppState>,
    Query(query): Query<HealthQuery>,
) -> ApiResult {
    let deps = &state.deps;
    match query.action.as_str() {
        "check" => {
            sqlx::query("SELECT 1")
                .execute(&deps.db_pool)
                .await
                .map_err(|e| ApiError::unavailable(format!("database unreachable: {e}")))?;
            Ok(envelope(json!({ "status": "healthy" })))
        }
        "status" => {
            let breakers = deps.breakers.list().await?;
            let windows = deps.limiter.windows().await?;
            Ok(envelope(json!({
                "circuit_breakers": breakers,
                "rate_limit_windows": windows,
            })))
        }
        "metrics" => {
            let service_stats = deps.limiter.stats().await?;
            let retry_stats = deps.tracker.stats().await?;
            let sample = deps.alerting.sample().await?;
            Ok(envelope(json!({
                "services": service_stats,
                "retries": retry_stats,
                "failure_rate": {
                    "total_jobs": sample.total_jobs,
                    "failed_jobs": sample.failed_jobs,
                    "rate": sample.rate(),
                },
            })))
        }
        "alerts" => {
            let open = deps.alerting.open_alerts().await?;
            let recent = deps.alerting.recent_alerts(50).await?;
            Ok(envelope(json!({ "open": open, "recent": recent })))
        }
        "recommendations" => {
            let recommendations = build_recommendations(&state).await?;
            Ok(envelope(recommendations))
        }
        "config" => Ok(envelope(json!({
            "circuit_breaker": deps.breakers.config(),
            "rate_limits": deps.limiter.quotas(),
            "alert_thresholds": deps.alerting.thresholds(),
            "retry": deps.tracker.config().snapshot(),
        }))),
        "history" => {
            if let Some(job_id) = query.job_id {
                let transitions = deps.status.history(job_id).await?;
                return Ok(envelope_with_ids(vec![job_id], transitions));
            }
            let jobs = Job::find_recent(50, &deps.db_pool).await?;
            Ok(envelope(jobs))
        }
        other => Err(ApiError::bad_request(format!("unknown action '{other}'"))),
    }
}

/// Operational advice derived from the current breaker, alert and window
/// state. Purely informational.
async fn build_recommendations(state: &AppState) -> anyhow::Result<Vec<String>> {
    let deps = &state.deps;
    let mut recommendations = Vec::new();

    for breaker in deps.breakers.list().await? {
        match breaker.state {
            BreakerState::Open => recommendations.push(format!(
                "{} circuit is open after {} consecutive failures; jobs will short-circuit until the cool-down elapses",
                breaker.dependency_name, breaker.consecutive_failures
            )),
            BreakerState::HalfOpen => recommendations.push(format!(
                "{} circuit is half-open; a probe request is deciding whether to close it",
                breaker.dependency_name
            )),
            BreakerState::Closed => {}
        }
    }

    let sample = deps.alerting.sample().await?;
    if let Some(severity) = deps.alerting.thresholds().severity_for_rate(sample.rate()) {
        recommendations.push(format!(
            "job failure rate is {:.1}% ({:?} band); inspect recent retry attempts for a dominant error category",
            sample.rate() * 100.0,
            severity
        ));
    }

    for window in deps.limiter.windows().await? {
        if let Some(quota) = deps.limiter.quotas().get(&window.service_name) {
            if window.request_count >= quota.max_requests {
                recommendations.push(format!(
                    "{} is at its request quota for the current window; defer non-urgent jobs",
                    window.service_name
                ));
            }
        }
    }

    if recommendations.is_empty() {
        recommendations.push("all systems nominal".to_string());
    }
    Ok(recommendations)
}
