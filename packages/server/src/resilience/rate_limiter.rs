//! Per-service rolling-window rate limiting.
//!
//! One durable window row per service. `check` reserves capacity with a
//! single guarded UPDATE so concurrent job runs cannot overshoot the quota;
//! `record` settles the reservation against actual usage after the call
//! completes and feeds the per-service stats the dashboard reads.

use std::collections::HashMap;

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

pub use super::circuit_breaker::{GENERATION_API, PUBLISHING_API};

/// Quota for one service over a rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceQuota {
    pub window_ms: u64,
    pub max_requests: i32,
    /// Token budget per window. Only the generation API meters tokens.
    pub max_tokens: Option<i64>,
}

/// Default quotas keyed by service name.
pub fn default_quotas() -> HashMap<String, ServiceQuota> {
    HashMap::from([
        (
            GENERATION_API.to_string(),
            ServiceQuota {
                window_ms: 60_000,
                max_requests: 60,
                max_tokens: Some(90_000),
            },
        ),
        (
            PUBLISHING_API.to_string(),
            ServiceQuota {
                window_ms: 60_000,
                max_requests: 120,
                max_tokens: None,
            },
        ),
    ])
}

/// Durable rolling window, one row per service.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WindowRow {
    pub service_name: String,
    pub window_start: DateTime<Utc>,
    pub request_count: i32,
    pub token_count: i64,
    pub updated_at: DateTime<Utc>,
}

/// Aggregate per-service counters consumed by the dashboard.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ServiceStatsRow {
    pub service_name: String,
    pub total_requests: i64,
    pub total_failures: i64,
    pub total_response_time_ms: i64,
    pub last_request_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateDecision {
    pub allowed: bool,
    /// Time until enough capacity frees up, when not allowed.
    pub wait_ms: u64,
    pub reason: Option<String>,
}

impl RateDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            wait_ms: 0,
            reason: None,
        }
    }
}

/// Pure decision against a window snapshot; used both to explain denials
/// and as the unit-testable core of the limiter.
pub fn decide(
    quota: &ServiceQuota,
    row: &WindowRow,
    estimated_tokens: i64,
    now: DateTime<Utc>,
) -> RateDecision {
    let window = chrono::Duration::milliseconds(quota.window_ms as i64);
    let window_end = row.window_start + window;

    // A stale window resets on the next reservation, so capacity is free.
    if now >= window_end {
        return RateDecision::allowed();
    }

    let wait_ms = (window_end - now).num_milliseconds().max(1) as u64;

    if row.request_count >= quota.max_requests {
        return RateDecision {
            allowed: false,
            wait_ms,
            reason: Some(format!(
                "request quota of {} per window reached",
                quota.max_requests
            )),
        };
    }
    if let Some(max_tokens) = quota.max_tokens {
        if row.token_count + estimated_tokens > max_tokens {
            return RateDecision {
                allowed: false,
                wait_ms,
                reason: Some(format!("token quota of {max_tokens} per window reached")),
            };
        }
    }
    RateDecision::allowed()
}

/// Store-backed limiter shared by all concurrent callers.
pub struct RateLimiter {
    pool: PgPool,
    quotas: HashMap<String, ServiceQuota>,
}

/// Bound on reservation retries when the window rolls over mid-check.
const MAX_RESERVE_ATTEMPTS: u32 = 8;

impl RateLimiter {
    pub fn new(pool: PgPool, quotas: HashMap<String, ServiceQuota>) -> Self {
        Self { pool, quotas }
    }

    pub fn quotas(&self) -> &HashMap<String, ServiceQuota> {
        &self.quotas
    }

    fn quota_for(&self, service: &str) -> Result<&ServiceQuota> {
        self.quotas
            .get(service)
            .ok_or_else(|| anyhow!("no quota configured for service {service}"))
    }

    /// Reserve capacity for one request (plus estimated tokens) now.
    ///
    /// The reservation is a single guarded UPDATE: if it matches no row the
    /// quota is exhausted and the returned decision carries the wait time
    /// until the window rolls over. An allow is only ever returned with a
    /// reservation actually charged.
    pub async fn check(&self, service: &str, estimated_tokens: Option<i64>) -> Result<RateDecision> {
        let quota = self.quota_for(service)?.clone();
        let estimate = estimated_tokens.unwrap_or(0);

        self.ensure_row(service).await?;

        for _ in 0..MAX_RESERVE_ATTEMPTS {
            // Reset a stale window in place before reserving.
            sqlx::query(
                r#"
                UPDATE rate_limit_windows
                SET window_start = NOW(), request_count = 0, token_count = 0, updated_at = NOW()
                WHERE service_name = $1
                  AND window_start <= NOW() - ($2 || ' milliseconds')::INTERVAL
                "#,
            )
            .bind(service)
            .bind(quota.window_ms.to_string())
            .execute(&self.pool)
            .await?;

            let reserved = sqlx::query(
                r#"
                UPDATE rate_limit_windows
                SET request_count = request_count + 1,
                    token_count = token_count + $3,
                    updated_at = NOW()
                WHERE service_name = $1
                  AND window_start > NOW() - ($2 || ' milliseconds')::INTERVAL
                  AND request_count < $4
                  AND ($5::BIGINT IS NULL OR token_count + $3 <= $5)
                "#,
            )
            .bind(service)
            .bind(quota.window_ms.to_string())
            .bind(estimate)
            .bind(quota.max_requests)
            .bind(quota.max_tokens)
            .execute(&self.pool)
            .await?;

            if reserved.rows_affected() > 0 {
                return Ok(RateDecision::allowed());
            }

            // Denied: read the snapshot to explain why and for how long.
            let row = self
                .window(service)
                .await?
                .ok_or_else(|| anyhow!("rate limit window for {service} missing"))?;
            let decision = decide(&quota, &row, estimate, Utc::now());
            if !decision.allowed {
                return Ok(decision);
            }
            // The window rolled over between the failed reservation and
            // the read. Go around and reserve in the fresh window rather
            // than letting this request through uncharged.
        }
        bail!("rate limit window for {service} contended beyond retry budget")
    }

    /// Settle a reservation with actual usage and update service stats.
    ///
    /// The window was charged the estimate at `check` time; this applies
    /// the difference so token accounting reflects real usage.
    pub async fn record(
        &self,
        service: &str,
        estimated_tokens: Option<i64>,
        actual_tokens: Option<i64>,
        response_time_ms: u64,
        success: bool,
    ) -> Result<()> {
        let quota = self.quota_for(service)?;
        let adjustment = actual_tokens.unwrap_or(0) - estimated_tokens.unwrap_or(0);

        if adjustment != 0 {
            sqlx::query(
                r#"
                UPDATE rate_limit_windows
                SET token_count = GREATEST(0, token_count + $3),
                    updated_at = NOW()
                WHERE service_name = $1
                  AND window_start > NOW() - ($2 || ' milliseconds')::INTERVAL
                "#,
            )
            .bind(service)
            .bind(quota.window_ms.to_string())
            .bind(adjustment)
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO service_stats
                (service_name, total_requests, total_failures, total_response_time_ms, last_request_at)
            VALUES ($1, 1, $2, $3, NOW())
            ON CONFLICT (service_name) DO UPDATE SET
                total_requests = service_stats.total_requests + 1,
                total_failures = service_stats.total_failures + $2,
                total_response_time_ms = service_stats.total_response_time_ms + $3,
                last_request_at = NOW(),
                updated_at = NOW()
            "#,
        )
        .bind(service)
        .bind(if success { 0i64 } else { 1i64 })
        .bind(response_time_ms as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn window(&self, service: &str) -> Result<Option<WindowRow>> {
        let row = sqlx::query_as::<_, WindowRow>(
            r#"
            SELECT service_name, window_start, request_count, token_count, updated_at
            FROM rate_limit_windows
            WHERE service_name = $1
            "#,
        )
        .bind(service)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn windows(&self) -> Result<Vec<WindowRow>> {
        let rows = sqlx::query_as::<_, WindowRow>(
            r#"
            SELECT service_name, window_start, request_count, token_count, updated_at
            FROM rate_limit_windows
            ORDER BY service_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn stats(&self) -> Result<Vec<ServiceStatsRow>> {
        let rows = sqlx::query_as::<_, ServiceStatsRow>(
            r#"
            SELECT service_name, total_requests, total_failures,
                   total_response_time_ms, last_request_at, updated_at
            FROM service_stats
            ORDER BY service_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn ensure_row(&self, service: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rate_limit_windows (service_name)
            VALUES ($1)
            ON CONFLICT (service_name) DO NOTHING
            "#,
        )
        .bind(service)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota() -> ServiceQuota {
        ServiceQuota {
            window_ms: 60_000,
            max_requests: 5,
            max_tokens: Some(1_000),
        }
    }

    fn window_at(start: DateTime<Utc>, requests: i32, tokens: i64) -> WindowRow {
        WindowRow {
            service_name: GENERATION_API.to_string(),
            window_start: start,
            request_count: requests,
            token_count: tokens,
            updated_at: start,
        }
    }

    #[test]
    fn under_quota_is_allowed() {
        let now = Utc::now();
        let decision = decide(&quota(), &window_at(now, 4, 100), 50, now);
        assert!(decision.allowed);
        assert_eq!(decision.wait_ms, 0);
    }

    #[test]
    fn request_past_quota_is_denied_with_wait() {
        let now = Utc::now();
        let decision = decide(&quota(), &window_at(now, 5, 0), 0, now);
        assert!(!decision.allowed);
        assert!(decision.wait_ms > 0);
        assert!(decision.reason.unwrap().contains("request quota"));
    }

    #[test]
    fn token_overflow_is_denied() {
        let now = Utc::now();
        let decision = decide(&quota(), &window_at(now, 1, 950), 100, now);
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("token quota"));
    }

    #[test]
    fn exact_token_fit_is_allowed() {
        let now = Utc::now();
        let decision = decide(&quota(), &window_at(now, 1, 900), 100, now);
        assert!(decision.allowed);
    }

    #[test]
    fn rolled_over_window_frees_capacity() {
        let now = Utc::now();
        let stale_start = now - chrono::Duration::milliseconds(61_000);
        let decision = decide(&quota(), &window_at(stale_start, 5, 1_000), 100, now);
        assert!(decision.allowed);
    }

    #[test]
    fn wait_counts_down_toward_window_end() {
        let now = Utc::now();
        let start = now - chrono::Duration::milliseconds(45_000);
        let decision = decide(&quota(), &window_at(start, 5, 0), 0, now);
        assert!(!decision.allowed);
        assert!(decision.wait_ms <= 15_000, "wait {} too long", decision.wait_ms);
    }

    #[test]
    fn services_without_token_quota_ignore_tokens() {
        let quota = ServiceQuota {
            window_ms: 60_000,
            max_requests: 5,
            max_tokens: None,
        };
        let now = Utc::now();
        let decision = decide(&quota, &window_at(now, 0, 0), 1_000_000, now);
        assert!(decision.allowed);
    }

    #[test]
    fn default_quotas_cover_both_services() {
        let quotas = default_quotas();
        assert!(quotas[GENERATION_API].max_tokens.is_some());
        assert!(quotas[PUBLISHING_API].max_tokens.is_none());
    }
}
