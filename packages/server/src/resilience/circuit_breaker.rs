//! Per-dependency circuit breakers.
//!
//! One durable row per protected dependency (`generation_api`,
//! `publishing_api`). Concurrent job runs share the row, so every mutation
//! is a version-guarded compare-and-update; the in-memory struct is only a
//! snapshot, never the source of truth.
//!
//! State machine: closed → open once enough qualifying failures accumulate
//! in a row within the rolling window; open → half_open after the cool-down
//! elapses (exactly one caller wins the probe slot); half_open → closed on
//! probe success, → open on probe failure with the cool-down restarted. The
//! probe slot carries a deadline, so a prober that dies without reporting
//! does not hold the breaker half-open forever.

use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{info, warn};

use super::classify::ErrorCategory;

pub const GENERATION_API: &str = "generation_api";
pub const PUBLISHING_API: &str = "publishing_api";

/// Breaker tuning, one config shared by all dependencies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive qualifying failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long an open breaker waits before allowing a probe.
    pub cooldown_ms: u64,
    /// Rolling window for the windowed failure counter.
    pub window_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 60_000,
            window_ms: 120_000,
        }
    }
}

impl BreakerConfig {
    fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.cooldown_ms as i64)
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.window_ms as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "breaker_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Durable breaker snapshot, one row per dependency.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BreakerRow {
    pub dependency_name: String,
    pub state: BreakerState,
    pub consecutive_failures: i32,
    pub window_failure_count: i32,
    pub window_started_at: DateTime<Utc>,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// What a caller may do right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    /// Breaker closed: proceed normally.
    Allow,
    /// Cool-down elapsed: this caller won the single probe slot.
    Probe,
    /// Breaker open (or probe already in flight): do not attempt the call.
    ShortCircuit { retry_after: Duration },
}

impl BreakerRow {
    fn fresh(dependency: &str, now: DateTime<Utc>) -> Self {
        Self {
            dependency_name: dependency.to_string(),
            state: BreakerState::Closed,
            consecutive_failures: 0,
            window_failure_count: 0,
            window_started_at: now,
            opened_at: None,
            next_probe_at: None,
            version: 0,
            updated_at: now,
        }
    }

    /// Evaluate what a caller may do, without mutating.
    pub fn gate(&self, now: DateTime<Utc>) -> Gate {
        match self.state {
            BreakerState::Closed => Gate::Allow,
            BreakerState::Open => match self.next_probe_at {
                Some(probe_at) if now >= probe_at => Gate::Probe,
                Some(probe_at) => Gate::ShortCircuit {
                    retry_after: (probe_at - now).to_std().unwrap_or_default(),
                },
                // Open with no probe time recorded: fail safe, allow a probe.
                None => Gate::Probe,
            },
            // Another caller holds the probe slot, up to its deadline; a
            // prober that crashed without reporting forfeits the slot.
            BreakerState::HalfOpen => match self.next_probe_at {
                Some(deadline) if now >= deadline => Gate::Probe,
                Some(deadline) => Gate::ShortCircuit {
                    retry_after: (deadline - now).to_std().unwrap_or_default(),
                },
                None => Gate::Probe,
            },
        }
    }

    /// Next state after a qualifying failure.
    ///
    /// Only server/network/timeout-class failures reach this method; the
    /// caller filters on [`ErrorCategory::trips_breaker`].
    pub fn after_failure(&self, config: &BreakerConfig, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();

        // Roll the window forward rather than accumulating forever.
        if now - next.window_started_at > config.window() {
            next.window_failure_count = 0;
            next.window_started_at = now;
        }
        next.consecutive_failures += 1;
        next.window_failure_count += 1;

        match next.state {
            // Probe failed: back to open, cool-down restarts.
            BreakerState::HalfOpen => {
                next.state = BreakerState::Open;
                next.opened_at = Some(now);
                next.next_probe_at = Some(now + config.cooldown());
            }
            BreakerState::Closed => {
                if next.consecutive_failures >= config.failure_threshold as i32 {
                    next.state = BreakerState::Open;
                    next.opened_at = Some(now);
                    next.next_probe_at = Some(now + config.cooldown());
                }
            }
            // Late in-flight failure while already open: counters only.
            BreakerState::Open => {}
        }
        next.updated_at = now;
        next
    }

    /// Next state after a success. Any success resets the consecutive
    /// counter; a half-open probe success closes the breaker.
    pub fn after_success(&self, now: DateTime<Utc>) -> Self {
        let mut next = self.clone();
        next.consecutive_failures = 0;
        if next.state == BreakerState::HalfOpen {
            next.state = BreakerState::Closed;
            next.window_failure_count = 0;
            next.opened_at = None;
            next.next_probe_at = None;
        }
        next.updated_at = now;
        next
    }

    /// Manual reset: forced closed regardless of counters.
    pub fn after_reset(&self, now: DateTime<Utc>) -> Self {
        let mut next = Self::fresh(&self.dependency_name, now);
        next.version = self.version;
        next
    }
}

/// Store-backed breaker shared by all concurrent callers.
pub struct CircuitBreaker {
    pool: PgPool,
    config: BreakerConfig,
}

/// Bound on compare-and-update retries before giving up.
const MAX_CAS_ATTEMPTS: u32 = 8;

impl CircuitBreaker {
    pub fn new(pool: PgPool, config: BreakerConfig) -> Self {
        Self { pool, config }
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Load the row for a dependency, creating it closed if missing.
    pub async fn load(&self, dependency: &str) -> Result<BreakerRow> {
        if let Some(row) = self.find(dependency).await? {
            return Ok(row);
        }
        sqlx::query(
            r#"
            INSERT INTO circuit_breakers (dependency_name)
            VALUES ($1)
            ON CONFLICT (dependency_name) DO NOTHING
            "#,
        )
        .bind(dependency)
        .execute(&self.pool)
        .await?;

        self.find(dependency)
            .await?
            .ok_or_else(|| anyhow::anyhow!("breaker row for {dependency} missing after insert"))
    }

    async fn find(&self, dependency: &str) -> Result<Option<BreakerRow>> {
        let row = sqlx::query_as::<_, BreakerRow>(
            r#"
            SELECT dependency_name, state, consecutive_failures, window_failure_count,
                   window_started_at, opened_at, next_probe_at, version, updated_at
            FROM circuit_breakers
            WHERE dependency_name = $1
            "#,
        )
        .bind(dependency)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// List all breaker rows (health dashboard).
    pub async fn list(&self) -> Result<Vec<BreakerRow>> {
        let rows = sqlx::query_as::<_, BreakerRow>(
            r#"
            SELECT dependency_name, state, consecutive_failures, window_failure_count,
                   window_started_at, opened_at, next_probe_at, version, updated_at
            FROM circuit_breakers
            ORDER BY dependency_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Decide whether a call to `dependency` may proceed.
    ///
    /// Winning the probe slot atomically flips the row to half_open so no
    /// second caller probes concurrently.
    pub async fn acquire(&self, dependency: &str) -> Result<Gate> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let row = self.load(dependency).await?;
            let now = Utc::now();
            match row.gate(now) {
                Gate::Allow => return Ok(Gate::Allow),
                Gate::ShortCircuit { retry_after } => {
                    return Ok(Gate::ShortCircuit { retry_after })
                }
                Gate::Probe => {
                    let mut probing = row.clone();
                    probing.state = BreakerState::HalfOpen;
                    // Deadline on the probe slot: if this caller crashes
                    // before reporting, the slot is re-offered after it.
                    probing.next_probe_at = Some(now + self.config.cooldown());
                    probing.updated_at = now;
                    if self.try_write(&row, &probing).await? {
                        info!(dependency, "circuit breaker half-open, probing");
                        return Ok(Gate::Probe);
                    }
                    // Lost the race; re-read and re-evaluate.
                }
            }
        }
        bail!("circuit breaker for {dependency} contended beyond retry budget");
    }

    /// Record the outcome of a completed call.
    pub async fn record_success(&self, dependency: &str) -> Result<()> {
        self.mutate(dependency, |row, now| Some(row.after_success(now)))
            .await
    }

    /// Record a classified failure. Non-dependency failures (auth,
    /// validation, policy) are ignored: retrying them never helps and they
    /// say nothing about dependency availability.
    pub async fn record_failure(&self, dependency: &str, category: ErrorCategory) -> Result<()> {
        if !category.trips_breaker() {
            return Ok(());
        }
        let config = self.config.clone();
        self.mutate(dependency, move |row, now| {
            let next = row.after_failure(&config, now);
            if next.state == BreakerState::Open && row.state != BreakerState::Open {
                warn!(
                    dependency = %row.dependency_name,
                    consecutive_failures = next.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            Some(next)
        })
        .await
    }

    /// Force the breaker closed regardless of counters.
    pub async fn reset(&self, dependency: &str) -> Result<()> {
        self.mutate(dependency, |row, now| Some(row.after_reset(now)))
            .await
    }

    async fn mutate<F>(&self, dependency: &str, next_fn: F) -> Result<()>
    where
        F: Fn(&BreakerRow, DateTime<Utc>) -> Option<BreakerRow>,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let row = self.load(dependency).await?;
            let Some(next) = next_fn(&row, Utc::now()) else {
                return Ok(());
            };
            if self.try_write(&row, &next).await? {
                return Ok(());
            }
        }
        bail!("circuit breaker for {dependency} contended beyond retry budget");
    }

    /// Single-statement compare-and-update keyed on the row version.
    async fn try_write(&self, expected: &BreakerRow, next: &BreakerRow) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE circuit_breakers
            SET state = $1,
                consecutive_failures = $2,
                window_failure_count = $3,
                window_started_at = $4,
                opened_at = $5,
                next_probe_at = $6,
                version = version + 1,
                updated_at = NOW()
            WHERE dependency_name = $7 AND version = $8
            "#,
        )
        .bind(next.state)
        .bind(next.consecutive_failures)
        .bind(next.window_failure_count)
        .bind(next.window_started_at)
        .bind(next.opened_at)
        .bind(next.next_probe_at)
        .bind(&expected.dependency_name)
        .bind(expected.version)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BreakerConfig {
        BreakerConfig::default()
    }

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    #[test]
    fn closed_breaker_allows_calls() {
        let row = BreakerRow::fresh(GENERATION_API, now());
        assert_eq!(row.gate(now()), Gate::Allow);
    }

    #[test]
    fn five_consecutive_failures_trip_open() {
        let t = now();
        let mut row = BreakerRow::fresh(GENERATION_API, t);
        for i in 1..=4 {
            row = row.after_failure(&config(), t);
            assert_eq!(row.state, BreakerState::Closed, "tripped early at {i}");
        }
        row = row.after_failure(&config(), t);
        assert_eq!(row.state, BreakerState::Open);
        assert_eq!(row.consecutive_failures, 5);
        assert!(row.next_probe_at.is_some());
    }

    #[test]
    fn open_breaker_short_circuits_until_cooldown() {
        let t = now();
        let mut row = BreakerRow::fresh(GENERATION_API, t);
        for _ in 0..5 {
            row = row.after_failure(&config(), t);
        }
        match row.gate(t) {
            Gate::ShortCircuit { retry_after } => assert!(retry_after > Duration::ZERO),
            other => panic!("expected short circuit, got {other:?}"),
        }

        let after_cooldown = t + chrono::Duration::milliseconds(config().cooldown_ms as i64 + 1);
        assert_eq!(row.gate(after_cooldown), Gate::Probe);
    }

    #[test]
    fn success_mid_streak_resets_consecutive_count() {
        let t = now();
        let mut row = BreakerRow::fresh(GENERATION_API, t);
        for _ in 0..4 {
            row = row.after_failure(&config(), t);
        }
        row = row.after_success(t);
        assert_eq!(row.consecutive_failures, 0);
        assert_eq!(row.state, BreakerState::Closed);

        // The streak starts over: four more failures do not trip it.
        for _ in 0..4 {
            row = row.after_failure(&config(), t);
        }
        assert_eq!(row.state, BreakerState::Closed);
    }

    #[test]
    fn probe_success_closes_and_clears() {
        let t = now();
        let mut row = BreakerRow::fresh(GENERATION_API, t);
        for _ in 0..5 {
            row = row.after_failure(&config(), t);
        }
        row.state = BreakerState::HalfOpen;
        let closed = row.after_success(t);
        assert_eq!(closed.state, BreakerState::Closed);
        assert_eq!(closed.consecutive_failures, 0);
        assert!(closed.opened_at.is_none());
        assert!(closed.next_probe_at.is_none());
    }

    #[test]
    fn probe_failure_reopens_with_fresh_cooldown() {
        let t = now();
        let mut row = BreakerRow::fresh(GENERATION_API, t);
        for _ in 0..5 {
            row = row.after_failure(&config(), t);
        }
        row.state = BreakerState::HalfOpen;
        let later = t + chrono::Duration::seconds(90);
        let reopened = row.after_failure(&config(), later);
        assert_eq!(reopened.state, BreakerState::Open);
        assert_eq!(reopened.opened_at, Some(later));
        assert_eq!(
            reopened.next_probe_at,
            Some(later + chrono::Duration::milliseconds(config().cooldown_ms as i64))
        );
    }

    #[test]
    fn half_open_short_circuits_other_callers() {
        let t = now();
        let mut row = BreakerRow::fresh(GENERATION_API, t);
        row.state = BreakerState::HalfOpen;
        row.next_probe_at = Some(t + chrono::Duration::seconds(30));
        assert!(matches!(row.gate(t), Gate::ShortCircuit { .. }));
    }

    #[test]
    fn abandoned_probe_slot_is_reoffered_after_deadline() {
        let t = now();
        let mut row = BreakerRow::fresh(GENERATION_API, t);
        row.state = BreakerState::HalfOpen;
        row.next_probe_at = Some(t + chrono::Duration::seconds(30));

        // Before the deadline the slot is held.
        assert!(matches!(row.gate(t), Gate::ShortCircuit { .. }));
        // Past it, the prober is presumed dead and the slot is free again.
        let past = t + chrono::Duration::seconds(31);
        assert_eq!(row.gate(past), Gate::Probe);
    }

    #[test]
    fn manual_reset_forces_closed() {
        let t = now();
        let mut row = BreakerRow::fresh(GENERATION_API, t);
        for _ in 0..5 {
            row = row.after_failure(&config(), t);
        }
        let reset = row.after_reset(t);
        assert_eq!(reset.state, BreakerState::Closed);
        assert_eq!(reset.consecutive_failures, 0);
        assert_eq!(reset.version, row.version);
    }

    #[test]
    fn window_rolls_instead_of_accumulating() {
        let t = now();
        let mut row = BreakerRow::fresh(GENERATION_API, t);
        row = row.after_failure(&config(), t);
        row = row.after_success(t); // break the streak, keep window count
        assert_eq!(row.window_failure_count, 1);

        let much_later = t + chrono::Duration::milliseconds(config().window_ms as i64 + 1);
        row = row.after_failure(&config(), much_later);
        assert_eq!(row.window_failure_count, 1);
        assert_eq!(row.window_started_at, much_later);
    }
}
