//! Job lifecycle state machine.
//!
//! Legal transitions:
//!
//! ```text
//! pending ──► processing ──► completed
//!    │             │ ▲
//!    │             ▼ │
//!    │          failed ──► pending   (retry requeue)
//!    ▼             │
//! cancelled ◄──────┘ (from pending/processing only)
//! ```
//!
//! `completed` and `cancelled` are terminal. Anything else is rejected
//! unless an admin forces it, in which case the transition still executes
//! but is flagged `force_override` in the audit trail. Every applied
//! transition writes the audit row and the job's status in one transaction,
//! so no reader ever sees one without the other.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use tracing::{debug, info};
use typed_builder::TypedBuilder;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "job_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Terminal states have no outgoing transitions except admin force.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Cancelled)
    }

    /// The legal transition table.
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
                | (JobStatus::Failed, JobStatus::Pending)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Processing, JobStatus::Cancelled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "transition_actor", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Actor {
    #[default]
    System,
    Admin,
}

/// Append-only audit row; immutable once written.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StatusTransition {
    pub id: Uuid,
    pub job_id: Uuid,
    pub from_status: JobStatus,
    pub to_status: JobStatus,
    pub reason: String,
    pub actor: Actor,
    pub admin_user_id: Option<String>,
    pub admin_role: Option<String>,
    pub force_override: bool,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A requested transition.
#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct TransitionRequest {
    pub job_id: Uuid,
    pub to: JobStatus,
    pub reason: String,
    #[builder(default)]
    pub actor: Actor,
    #[builder(default, setter(strip_option))]
    pub admin_user_id: Option<String>,
    #[builder(default, setter(strip_option))]
    pub admin_role: Option<String>,
    #[builder(default = false)]
    pub force_override: bool,
    #[builder(default, setter(strip_option))]
    pub metadata: Option<serde_json::Value>,
    /// Error message to stamp onto the job, for failed transitions.
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,
}

impl TransitionRequest {
    /// Convenience constructor for system-driven transitions.
    pub fn system(job_id: Uuid, to: JobStatus, reason: impl Into<String>) -> Self {
        Self::builder().job_id(job_id).to(to).reason(reason).build()
    }
}

/// Result of attempting a transition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TransitionOutcome {
    /// The transition was validated (or forced) and written.
    Applied { transition: StatusTransition },
    /// Illegal transition, rejected with no side effects.
    Rejected { from: JobStatus, to: JobStatus, reason: String },
    /// The job already reached a terminal state; late outcomes no-op
    /// rather than overwrite it.
    NoopTerminal { current: JobStatus },
}

impl TransitionOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }
}

/// Owns all mutation of a job's `status` column.
pub struct JobStatusManager {
    pool: PgPool,
}

impl JobStatusManager {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Validate and apply a transition.
    ///
    /// Locks the job row for the duration of the transaction, so the
    /// validation, the audit insert and the status update are observed
    /// together. The lock is scoped to the job id, never global.
    pub async fn transition(&self, req: TransitionRequest) -> Result<TransitionOutcome> {
        let mut tx = self.pool.begin().await?;

        let current: JobStatus = sqlx::query_scalar(
            "SELECT status FROM jobs WHERE id = $1 FOR UPDATE",
        )
        .bind(req.job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| anyhow!("job {} not found", req.job_id))?;

        let forcing = req.actor == Actor::Admin && req.force_override;
        let legal = current.can_transition_to(req.to);

        if !legal && !forcing {
            if current.is_terminal() && req.actor == Actor::System {
                // In-flight outcome arrived after completion/cancellation.
                debug!(job_id = %req.job_id, current = ?current, to = ?req.to,
                       "late transition against terminal job, ignoring");
                return Ok(TransitionOutcome::NoopTerminal { current });
            }
            return Ok(TransitionOutcome::Rejected {
                from: current,
                to: req.to,
                reason: format!("transition {current:?} -> {:?} is not allowed", req.to),
            });
        }

        // Conditional update keyed by the status we just validated.
        let updated = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $1,
                error_message = COALESCE($2, error_message),
                updated_at = NOW()
            WHERE id = $3 AND status = $4
            "#,
        )
        .bind(req.to)
        .bind(&req.error_message)
        .bind(req.job_id)
        .bind(current)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(anyhow!(
                "job {} changed status concurrently during transition",
                req.job_id
            ));
        }

        let transition = sqlx::query_as::<_, StatusTransition>(
            r#"
            INSERT INTO status_transitions
                (id, job_id, from_status, to_status, reason, actor,
                 admin_user_id, admin_role, force_override, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, job_id, from_status, to_status, reason, actor,
                      admin_user_id, admin_role, force_override, metadata, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(req.job_id)
        .bind(current)
        .bind(req.to)
        .bind(&req.reason)
        .bind(req.actor)
        .bind(&req.admin_user_id)
        .bind(&req.admin_role)
        .bind(!legal && forcing)
        .bind(&req.metadata)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(
            job_id = %req.job_id,
            from = ?current,
            to = ?req.to,
            actor = ?req.actor,
            forced = !legal && forcing,
            "job status transition"
        );
        Ok(TransitionOutcome::Applied { transition })
    }

    /// Full audit trail for a job, oldest first.
    pub async fn history(&self, job_id: Uuid) -> Result<Vec<StatusTransition>> {
        let rows = sqlx::query_as::<_, StatusTransition>(
            r#"
            SELECT id, job_id, from_status, to_status, reason, actor,
                   admin_user_id, admin_role, force_override, metadata, created_at
            FROM status_transitions
            WHERE job_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_is_the_initial_state() {
        assert_eq!(JobStatus::default(), JobStatus::Pending);
    }

    #[test]
    fn legal_transitions_are_allowed() {
        let legal = [
            (JobStatus::Pending, JobStatus::Processing),
            (JobStatus::Processing, JobStatus::Completed),
            (JobStatus::Processing, JobStatus::Failed),
            (JobStatus::Failed, JobStatus::Pending),
            (JobStatus::Pending, JobStatus::Cancelled),
            (JobStatus::Processing, JobStatus::Cancelled),
        ];
        for (from, to) in legal {
            assert!(from.can_transition_to(to), "{from:?} -> {to:?} should be legal");
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_transitions() {
        let all = [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ];
        for to in all {
            assert!(!JobStatus::Completed.can_transition_to(to));
            assert!(!JobStatus::Cancelled.can_transition_to(to));
        }
    }

    #[test]
    fn illegal_shortcuts_are_rejected() {
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn self_transitions_are_illegal() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn only_completed_and_cancelled_are_terminal() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(!JobStatus::Failed.is_terminal());
    }
}
