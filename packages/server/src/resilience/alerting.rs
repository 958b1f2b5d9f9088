//! Failure-rate alerting.
//!
//! The engine samples the failure rate over a recent window of jobs, maps
//! it onto severity bands and fans alerts out to notification channels.
//! Severity selection is a pure function so the band boundaries are unit
//! tested; delivery goes through the [`AlertNotifier`] trait so the server
//! wires in real transports and tests wire in a capture.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "alert_severity", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Chat,
    Webhook,
}

impl AlertSeverity {
    /// Channels an alert of this severity is delivered to.
    pub fn channels(&self) -> &'static [Channel] {
        match self {
            AlertSeverity::Warning => &[Channel::Email],
            AlertSeverity::Critical => &[Channel::Email, Channel::Chat],
            AlertSeverity::Emergency => &[Channel::Email, Channel::Chat, Channel::Webhook],
        }
    }

    /// Whether alerts of this severity enter the escalation path.
    pub fn escalates(&self) -> bool {
        matches!(self, AlertSeverity::Critical | AlertSeverity::Emergency)
    }
}

/// Failure-rate band boundaries. Each band is inclusive at its lower edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertThresholds {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
    /// Jobs needed in the sample before any alert fires. Defaults to 1,
    /// so every non-empty sample is judged against the bands; deployments
    /// that find small windows noisy can raise it.
    pub min_sample_size: i64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            warning: 0.15,
            critical: 0.20,
            emergency: 0.30,
            min_sample_size: 1,
        }
    }
}

impl AlertThresholds {
    /// Map a failure rate onto a severity band, highest band first.
    pub fn severity_for_rate(&self, rate: f64) -> Option<AlertSeverity> {
        if rate >= self.emergency {
            Some(AlertSeverity::Emergency)
        } else if rate >= self.critical {
            Some(AlertSeverity::Critical)
        } else if rate >= self.warning {
            Some(AlertSeverity::Warning)
        } else {
            None
        }
    }

    /// The lower boundary of the band for a severity.
    pub fn boundary(&self, severity: AlertSeverity) -> f64 {
        match severity {
            AlertSeverity::Warning => self.warning,
            AlertSeverity::Critical => self.critical,
            AlertSeverity::Emergency => self.emergency,
        }
    }
}

/// Snapshot of job outcomes over the sampling window.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct FailureRateSample {
    pub total_jobs: i64,
    pub failed_jobs: i64,
}

impl FailureRateSample {
    pub fn rate(&self) -> f64 {
        if self.total_jobs == 0 {
            0.0
        } else {
            self.failed_jobs as f64 / self.total_jobs as f64
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Alert {
    pub id: Uuid,
    pub severity: AlertSeverity,
    pub message: String,
    pub source_metric: String,
    pub threshold_crossed: f64,
    pub failure_rate: f64,
    pub total_jobs: i32,
    pub failed_jobs: i32,
    pub escalated: bool,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Delivery seam. The engine decides *what* to send and to *which*
/// channels; implementations own the transport.
#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn notify(&self, alert: &Alert, channels: &[Channel]) -> Result<()>;
}

/// Default notifier: structured log lines in place of real transports.
pub struct LogNotifier;

#[async_trait]
impl AlertNotifier for LogNotifier {
    async fn notify(&self, alert: &Alert, channels: &[Channel]) -> Result<()> {
        match alert.severity {
            AlertSeverity::Warning => warn!(
                severity = ?alert.severity,
                failure_rate = alert.failure_rate,
                channels = ?channels,
                "{}", alert.message
            ),
            AlertSeverity::Critical | AlertSeverity::Emergency => error!(
                severity = ?alert.severity,
                failure_rate = alert.failure_rate,
                escalated = alert.escalated,
                channels = ?channels,
                "{}", alert.message
            ),
        }
        Ok(())
    }
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum AlertEvaluation {
    /// Failure rate crossed a band; an alert was raised and delivered.
    Raised { alert: Alert },
    /// An unresolved alert of the same severity already covers this.
    AlreadyActive { severity: AlertSeverity },
    /// Below every band; any open alerts were resolved.
    Healthy { resolved: u64 },
    /// Not enough jobs in the window to judge.
    InsufficientSample { total_jobs: i64 },
}

pub struct AlertingEngine {
    pool: PgPool,
    thresholds: AlertThresholds,
    notifier: Arc<dyn AlertNotifier>,
    sample_window: Duration,
}

impl AlertingEngine {
    pub fn new(
        pool: PgPool,
        thresholds: AlertThresholds,
        notifier: Arc<dyn AlertNotifier>,
        sample_window: Duration,
    ) -> Self {
        Self {
            pool,
            thresholds,
            notifier,
            sample_window,
        }
    }

    pub fn thresholds(&self) -> &AlertThresholds {
        &self.thresholds
    }

    /// Failure rate over jobs that reached an outcome inside the window.
    /// Jobs still pending or processing are not part of the denominator.
    pub async fn sample(&self) -> Result<FailureRateSample> {
        let sample = sqlx::query_as::<_, FailureRateSample>(
            r#"
            SELECT
                COUNT(*) AS total_jobs,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed_jobs
            FROM jobs
            WHERE status IN ('completed', 'failed', 'cancelled')
              AND updated_at > NOW() - ($1 || ' milliseconds')::INTERVAL
            "#,
        )
        .bind(self.sample_window.as_millis().to_string())
        .fetch_one(&self.pool)
        .await?;
        Ok(sample)
    }

    /// Sample the failure rate and raise, hold or resolve alerts.
    pub async fn evaluate(&self) -> Result<AlertEvaluation> {
        let sample = self.sample().await?;

        if sample.total_jobs < self.thresholds.min_sample_size {
            return Ok(AlertEvaluation::InsufficientSample {
                total_jobs: sample.total_jobs,
            });
        }

        let rate = sample.rate();
        let Some(severity) = self.thresholds.severity_for_rate(rate) else {
            let resolved = self.resolve_open().await?;
            return Ok(AlertEvaluation::Healthy { resolved });
        };

        // One live alert per severity band; repeat evaluations while the
        // rate stays in the same band do not re-notify.
        let active: Option<AlertSeverity> = sqlx::query_scalar(
            "SELECT severity FROM alerts WHERE resolved = FALSE AND severity = $1 LIMIT 1",
        )
        .bind(severity)
        .fetch_optional(&self.pool)
        .await?;
        if active.is_some() {
            return Ok(AlertEvaluation::AlreadyActive { severity });
        }

        let alert = self.raise(severity, &sample, rate).await?;
        self.notifier.notify(&alert, severity.channels()).await?;
        Ok(AlertEvaluation::Raised { alert })
    }

    async fn raise(
        &self,
        severity: AlertSeverity,
        sample: &FailureRateSample,
        rate: f64,
    ) -> Result<Alert> {
        let message = format!(
            "job failure rate {:.1}% over the last {} jobs crossed the {:?} threshold",
            rate * 100.0,
            sample.total_jobs,
            severity,
        );
        let alert = sqlx::query_as::<_, Alert>(
            r#"
            INSERT INTO alerts
                (id, severity, message, source_metric, threshold_crossed,
                 failure_rate, total_jobs, failed_jobs, escalated)
            VALUES ($1, $2, $3, 'job_failure_rate', $4, $5, $6, $7, $8)
            RETURNING id, severity, message, source_metric, threshold_crossed,
                      failure_rate, total_jobs, failed_jobs, escalated,
                      resolved, resolved_at, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(severity)
        .bind(&message)
        .bind(self.thresholds.boundary(severity))
        .bind(rate)
        .bind(sample.total_jobs as i32)
        .bind(sample.failed_jobs as i32)
        .bind(severity.escalates())
        .fetch_one(&self.pool)
        .await?;

        info!(
            alert_id = %alert.id,
            severity = ?severity,
            failure_rate = rate,
            escalated = alert.escalated,
            "raised failure-rate alert"
        );
        Ok(alert)
    }

    async fn resolve_open(&self) -> Result<u64> {
        let resolved = sqlx::query(
            r#"
            UPDATE alerts
            SET resolved = TRUE, resolved_at = NOW()
            WHERE resolved = FALSE
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        if resolved > 0 {
            info!(resolved, "failure rate recovered, resolved open alerts");
        }
        Ok(resolved)
    }

    pub async fn open_alerts(&self) -> Result<Vec<Alert>> {
        let alerts = sqlx::query_as::<_, Alert>(
            r#"
            SELECT id, severity, message, source_metric, threshold_crossed,
                   failure_rate, total_jobs, failed_jobs, escalated,
                   resolved, resolved_at, created_at
            FROM alerts
            WHERE resolved = FALSE
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(alerts)
    }

    pub async fn recent_alerts(&self, limit: i64) -> Result<Vec<Alert>> {
        let alerts = sqlx::query_as::<_, Alert>(
            r#"
            SELECT id, severity, message, source_metric, threshold_crossed,
                   failure_rate, total_jobs, failed_jobs, escalated,
                   resolved, resolved_at, created_at
            FROM alerts
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(alerts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> AlertThresholds {
        AlertThresholds::default()
    }

    #[test]
    fn rates_below_warning_map_to_no_alert() {
        assert_eq!(thresholds().severity_for_rate(0.0), None);
        assert_eq!(thresholds().severity_for_rate(0.1499), None);
    }

    #[test]
    fn band_boundaries_are_lower_inclusive() {
        let t = thresholds();
        assert_eq!(t.severity_for_rate(0.15), Some(AlertSeverity::Warning));
        assert_eq!(t.severity_for_rate(0.20), Some(AlertSeverity::Critical));
        assert_eq!(t.severity_for_rate(0.30), Some(AlertSeverity::Emergency));
    }

    #[test]
    fn rates_between_boundaries_stay_in_the_lower_band() {
        let t = thresholds();
        assert_eq!(t.severity_for_rate(0.17), Some(AlertSeverity::Warning));
        assert_eq!(t.severity_for_rate(0.29), Some(AlertSeverity::Critical));
        assert_eq!(t.severity_for_rate(0.95), Some(AlertSeverity::Emergency));
    }

    #[test]
    fn channels_widen_with_severity() {
        assert_eq!(AlertSeverity::Warning.channels(), &[Channel::Email]);
        assert_eq!(
            AlertSeverity::Critical.channels(),
            &[Channel::Email, Channel::Chat]
        );
        assert_eq!(
            AlertSeverity::Emergency.channels(),
            &[Channel::Email, Channel::Chat, Channel::Webhook]
        );
    }

    #[test]
    fn only_critical_and_emergency_escalate() {
        assert!(!AlertSeverity::Warning.escalates());
        assert!(AlertSeverity::Critical.escalates());
        assert!(AlertSeverity::Emergency.escalates());
    }

    #[test]
    fn small_samples_are_judged_by_default() {
        let t = thresholds();
        assert_eq!(t.min_sample_size, 1);

        // Nine failed jobs out of nine must land in the emergency band.
        let sample = FailureRateSample {
            total_jobs: 9,
            failed_jobs: 9,
        };
        assert_eq!(
            t.severity_for_rate(sample.rate()),
            Some(AlertSeverity::Emergency)
        );
    }

    #[test]
    fn sample_rate_handles_empty_window() {
        let sample = FailureRateSample {
            total_jobs: 0,
            failed_jobs: 0,
        };
        assert_eq!(sample.rate(), 0.0);
    }

    #[test]
    fn sample_rate_is_failed_over_total() {
        let sample = FailureRateSample {
            total_jobs: 20,
            failed_jobs: 5,
        };
        assert!((sample.rate() - 0.25).abs() < f64::EPSILON);
    }
}
