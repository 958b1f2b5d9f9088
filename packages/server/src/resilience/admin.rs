//! Admin-initiated retries with declarative role permissions.
//!
//! Which role may perform which retry operation is a single data table,
//! [`is_permitted`], not logic scattered across handlers. Every admin
//! action lands in the same audit trail as system transitions, attributed
//! with the admin's id and role, and force-applied operations are flagged.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use super::classify::{ClassifiedError, ErrorCategory};
use super::job::Job;
use super::status::{Actor, JobStatus, JobStatusManager, StatusTransition, TransitionOutcome, TransitionRequest};
use super::tracker::{AttemptOutcome, RetryTracker};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminRole {
    User,
    Operator,
    Admin,
    SuperAdmin,
}

impl AdminRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AdminRole::User => "user",
            AdminRole::Operator => "operator",
            AdminRole::Admin => "admin",
            AdminRole::SuperAdmin => "super_admin",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryType {
    /// Requeue a failed job, subject to normal eligibility rules.
    ManualRetry,
    /// Requeue regardless of retry eligibility.
    ForceRetry,
    /// Zero the job's retry counter.
    ResetRetryCount,
    /// Raise the job's per-job retry cap.
    OverrideMaxRetries,
    /// Requeue from any state, terminal included, and zero the counter.
    EmergencyRetry,
}

/// The permission table. Roles are not hierarchical in code; each cell is
/// spelled out so the policy reads as written.
pub fn is_permitted(role: AdminRole, retry_type: RetryType) -> bool {
    use AdminRole::*;
    use RetryType::*;
    match (role, retry_type) {
        (User, _) => false,
        (Operator, ManualRetry) => true,
        (Operator, _) => false,
        (Admin, ManualRetry | ForceRetry | ResetRetryCount) => true,
        (Admin, OverrideMaxRetries | EmergencyRetry) => false,
        (SuperAdmin, _) => true,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AdminRetryRequest {
    pub job_id: Uuid,
    pub retry_type: RetryType,
    pub admin_user_id: String,
    pub admin_role: AdminRole,
    pub reason: String,
    /// Required for `override_max_retries`, ignored otherwise.
    pub new_max_retries: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdminRetryOutcome {
    pub permission_granted: bool,
    pub applied: bool,
    pub denial_reason: Option<String>,
    /// The eligibility reason a force/emergency retry pushed past,
    /// preserved for audit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub overridden_ineligibility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transition: Option<StatusTransition>,
}

impl AdminRetryOutcome {
    fn denied(reason: impl Into<String>, permission_granted: bool) -> Self {
        Self {
            permission_granted,
            applied: false,
            denial_reason: Some(reason.into()),
            overridden_ineligibility: None,
            transition: None,
        }
    }

    fn applied(transition: Option<StatusTransition>) -> Self {
        Self {
            permission_granted: true,
            applied: true,
            denial_reason: None,
            overridden_ineligibility: None,
            transition,
        }
    }

    fn overriding(mut self, ineligibility: Option<String>) -> Self {
        self.overridden_ineligibility = ineligibility;
        self
    }
}

pub struct AdminRetryManager {
    pool: PgPool,
    status: JobStatusManager,
    tracker: std::sync::Arc<RetryTracker>,
}

impl AdminRetryManager {
    pub fn new(pool: PgPool, tracker: std::sync::Arc<RetryTracker>) -> Self {
        Self {
            status: JobStatusManager::new(pool.clone()),
            pool,
            tracker,
        }
    }

    /// Check the permission table, then execute the requested operation.
    ///
    /// Permission denials and eligibility denials are reported as outcomes,
    /// not errors; errors are reserved for missing jobs and store failures.
    pub async fn execute(&self, req: AdminRetryRequest) -> Result<AdminRetryOutcome> {
        if !is_permitted(req.admin_role, req.retry_type) {
            warn!(
                job_id = %req.job_id,
                admin = %req.admin_user_id,
                role = req.admin_role.as_str(),
                retry_type = ?req.retry_type,
                "admin retry denied by permission table"
            );
            return Ok(AdminRetryOutcome::denied(
                format!(
                    "role {} is not permitted to perform {:?}",
                    req.admin_role.as_str(),
                    req.retry_type
                ),
                false,
            ));
        }

        let job = Job::find_optional(req.job_id, &self.pool)
            .await?
            .ok_or_else(|| anyhow!("job {} not found", req.job_id))?;

        let outcome = match req.retry_type {
            RetryType::ManualRetry => self.manual_retry(&req, &job).await?,
            RetryType::ForceRetry => self.force_retry(&req, false).await?,
            RetryType::ResetRetryCount => self.reset_retry_count(&req, &job).await?,
            RetryType::OverrideMaxRetries => self.override_max_retries(&req, &job).await?,
            RetryType::EmergencyRetry => self.force_retry(&req, true).await?,
        };

        if outcome.applied {
            info!(
                job_id = %req.job_id,
                admin = %req.admin_user_id,
                role = req.admin_role.as_str(),
                retry_type = ?req.retry_type,
                "admin retry applied"
            );
        }
        Ok(outcome)
    }

    /// Ordinary requeue: permission alone is not enough, the job must also
    /// be eligible under the retry policy.
    async fn manual_retry(&self, req: &AdminRetryRequest, job: &Job) -> Result<AdminRetryOutcome> {
        if job.status != JobStatus::Failed {
            return Ok(AdminRetryOutcome::denied(
                format!("job is {:?}, only failed jobs take a manual retry", job.status),
                true,
            ));
        }
        let eligibility = self.tracker.can_retry(req.job_id).await?;
        if !eligibility.eligible {
            let reason = eligibility
                .reason
                .unwrap_or_else(|| "job is not eligible for retry".to_string());
            return Ok(AdminRetryOutcome::denied(reason, true));
        }
        self.requeue(req, false).await
    }

    /// Requeue past normal eligibility. The overridden ineligibility
    /// reason is preserved on the outcome, and the override itself is
    /// logged as an admin-tagged attempt row (which is how `retry_count`
    /// may legitimately exceed `max_retries`). Emergency retries also
    /// zero the counter and force past terminal states.
    async fn force_retry(&self, req: &AdminRetryRequest, emergency: bool) -> Result<AdminRetryOutcome> {
        let eligibility = self.tracker.can_retry(req.job_id).await?;
        let overridden = if eligibility.eligible {
            None
        } else {
            eligibility.reason
        };

        // Transition first: a denied requeue must leave no trace, so the
        // attempt row and counter writes only happen once it applied.
        let outcome = self.requeue(req, emergency).await?;
        if !outcome.applied {
            return Ok(outcome);
        }

        if let Some(error) = self.last_failure(req.job_id).await? {
            self.tracker
                .record_attempt_as(req.job_id, &error, Actor::Admin, Some(&req.admin_user_id))
                .await?;
        }
        if emergency {
            self.zero_retry_count(req.job_id).await?;
        }
        Ok(outcome.overriding(overridden))
    }

    /// Reconstruct the most recent failure from the attempt log, for the
    /// admin-tagged override row.
    async fn last_failure(&self, job_id: Uuid) -> Result<Option<ClassifiedError>> {
        let attempts = self.tracker.history(job_id).await?;
        let last = attempts
            .into_iter()
            .rev()
            .find(|a| a.outcome != AttemptOutcome::Succeeded);
        Ok(last.map(|a| ClassifiedError {
            category: a.error_category.unwrap_or(ErrorCategory::Unknown),
            http_status: None,
            vendor_code: None,
            retry_after_ms: None,
            message: a.error_message.unwrap_or_default(),
        }))
    }

    /// Transition the job back to pending, forcing past the transition
    /// table when asked (emergency retries on terminal jobs).
    async fn requeue(&self, req: &AdminRetryRequest, force: bool) -> Result<AdminRetryOutcome> {
        let transition = self
            .status
            .transition(self.admin_transition(req, JobStatus::Pending, force))
            .await?;
        match transition {
            TransitionOutcome::Applied { transition } => {
                Ok(AdminRetryOutcome::applied(Some(transition)))
            }
            TransitionOutcome::Rejected { from, to, .. } => Ok(AdminRetryOutcome::denied(
                format!("transition {from:?} -> {to:?} is not allowed without force"),
                true,
            )),
            TransitionOutcome::NoopTerminal { current } => Ok(AdminRetryOutcome::denied(
                format!("job already reached terminal state {current:?}"),
                true,
            )),
        }
    }

    /// Zero the counter and record a forced same-status transition so the
    /// counter change is visible in the audit trail.
    async fn reset_retry_count(
        &self,
        req: &AdminRetryRequest,
        job: &Job,
    ) -> Result<AdminRetryOutcome> {
        self.zero_retry_count(req.job_id).await?;
        let outcome = self
            .status
            .transition(self.audit_marker(req, job, serde_json::json!({"retry_count": 0})))
            .await?;
        Ok(AdminRetryOutcome::applied(applied_transition(outcome)))
    }

    async fn override_max_retries(
        &self,
        req: &AdminRetryRequest,
        job: &Job,
    ) -> Result<AdminRetryOutcome> {
        let Some(new_max) = req.new_max_retries else {
            return Ok(AdminRetryOutcome::denied(
                "override_max_retries requires new_max_retries",
                true,
            ));
        };
        if new_max < 0 {
            return Ok(AdminRetryOutcome::denied("new_max_retries must be >= 0", true));
        }

        sqlx::query("UPDATE jobs SET max_retries = $1, updated_at = NOW() WHERE id = $2")
            .bind(new_max)
            .bind(req.job_id)
            .execute(&self.pool)
            .await?;

        let outcome = self
            .status
            .transition(self.audit_marker(
                req,
                job,
                serde_json::json!({"max_retries": new_max}),
            ))
            .await?;
        Ok(AdminRetryOutcome::applied(applied_transition(outcome)))
    }

    async fn zero_retry_count(&self, job_id: Uuid) -> Result<()> {
        sqlx::query("UPDATE jobs SET retry_count = 0, updated_at = NOW() WHERE id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn admin_transition(
        &self,
        req: &AdminRetryRequest,
        to: JobStatus,
        force: bool,
    ) -> TransitionRequest {
        TransitionRequest::builder()
            .job_id(req.job_id)
            .to(to)
            .reason(req.reason.clone())
            .actor(Actor::Admin)
            .admin_user_id(req.admin_user_id.clone())
            .admin_role(req.admin_role.as_str().to_string())
            .force_override(force)
            .build()
    }

    /// A forced same-status transition used purely as an audit marker for
    /// counter and cap changes.
    fn audit_marker(
        &self,
        req: &AdminRetryRequest,
        job: &Job,
        metadata: serde_json::Value,
    ) -> TransitionRequest {
        TransitionRequest::builder()
            .job_id(req.job_id)
            .to(job.status)
            .reason(req.reason.clone())
            .actor(Actor::Admin)
            .admin_user_id(req.admin_user_id.clone())
            .admin_role(req.admin_role.as_str().to_string())
            .force_override(true)
            .metadata(metadata)
            .build()
    }
}

fn applied_transition(outcome: TransitionOutcome) -> Option<StatusTransition> {
    match outcome {
        TransitionOutcome::Applied { transition } => Some(transition),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_role_is_always_denied() {
        for retry_type in [
            RetryType::ManualRetry,
            RetryType::ForceRetry,
            RetryType::ResetRetryCount,
            RetryType::OverrideMaxRetries,
            RetryType::EmergencyRetry,
        ] {
            assert!(!is_permitted(AdminRole::User, retry_type));
        }
    }

    #[test]
    fn operator_may_only_manual_retry() {
        assert!(is_permitted(AdminRole::Operator, RetryType::ManualRetry));
        assert!(!is_permitted(AdminRole::Operator, RetryType::ForceRetry));
        assert!(!is_permitted(AdminRole::Operator, RetryType::ResetRetryCount));
        assert!(!is_permitted(AdminRole::Operator, RetryType::OverrideMaxRetries));
        assert!(!is_permitted(AdminRole::Operator, RetryType::EmergencyRetry));
    }

    #[test]
    fn admin_stops_short_of_cap_overrides_and_emergencies() {
        assert!(is_permitted(AdminRole::Admin, RetryType::ManualRetry));
        assert!(is_permitted(AdminRole::Admin, RetryType::ForceRetry));
        assert!(is_permitted(AdminRole::Admin, RetryType::ResetRetryCount));
        assert!(!is_permitted(AdminRole::Admin, RetryType::OverrideMaxRetries));
        assert!(!is_permitted(AdminRole::Admin, RetryType::EmergencyRetry));
    }

    #[test]
    fn super_admin_may_do_everything() {
        for retry_type in [
            RetryType::ManualRetry,
            RetryType::ForceRetry,
            RetryType::ResetRetryCount,
            RetryType::OverrideMaxRetries,
            RetryType::EmergencyRetry,
        ] {
            assert!(is_permitted(AdminRole::SuperAdmin, retry_type));
        }
    }

    #[test]
    fn denied_outcomes_carry_no_applied_state() {
        let denied = AdminRetryOutcome::denied("transition not allowed", true);
        assert!(denied.permission_granted);
        assert!(!denied.applied);
        assert!(denied.transition.is_none());
        assert!(denied.overridden_ineligibility.is_none());
    }

    #[test]
    fn roles_round_trip_through_serde_names() {
        let role: AdminRole = serde_json::from_str("\"super_admin\"").unwrap();
        assert_eq!(role, AdminRole::SuperAdmin);
        assert_eq!(role.as_str(), "super_admin");
    }
}
