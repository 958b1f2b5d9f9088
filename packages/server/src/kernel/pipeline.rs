//! Content pipeline: generate, then publish, under the resilience stack.
//!
//! Control flow per stage: rate-limit reservation → circuit breaker gate →
//! API call → classification → retry tracking → status transition. The
//! pipeline never sleeps; denials and retry delays are returned to the
//! caller as scheduling decisions.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::deps::ServerDeps;
use super::generation::estimate_tokens;
use crate::resilience::{
    classify, ClassifiedError, ErrorCategory, Gate, Job, JobStatus, TransitionRequest,
    GENERATION_API, PUBLISHING_API,
};

/// What happened to one pipeline run. Short-circuits and rate denials are
/// distinct from genuine failures: they record no retry attempt and leave
/// the retry counter alone.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Completed {
        published_ref: String,
    },
    Failed {
        category: ErrorCategory,
        retry_scheduled: bool,
        next_delay_ms: u64,
    },
    /// A breaker refused the call without attempting it.
    ShortCircuited {
        dependency: String,
        retry_after_ms: u64,
    },
    /// The rate limiter had no capacity; try again after the wait.
    RateLimited {
        service: String,
        wait_ms: u64,
    },
    /// The job was not in a runnable state.
    NotRunnable {
        status: JobStatus,
    },
}

pub struct ContentPipeline {
    deps: Arc<ServerDeps>,
}

impl ContentPipeline {
    pub fn new(deps: Arc<ServerDeps>) -> Self {
        Self { deps }
    }

    /// Run one pending job through generation and publication.
    pub async fn run(&self, job_id: Uuid) -> Result<PipelineOutcome> {
        let job = Job::find_optional(job_id, &self.deps.db_pool)
            .await?
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        if job.status != JobStatus::Pending {
            return Ok(PipelineOutcome::NotRunnable { status: job.status });
        }

        // Reserve rate capacity before taking the breaker gate: losing the
        // probe slot while holding a reservation only costs one window
        // entry, while the reverse would stall the breaker half-open.
        let estimate = estimate_tokens(&job.topic, &job.content_type);
        let rate = self.deps.limiter.check(GENERATION_API, Some(estimate)).await?;
        if !rate.allowed {
            return Ok(PipelineOutcome::RateLimited {
                service: GENERATION_API.to_string(),
                wait_ms: rate.wait_ms,
            });
        }
        if let Gate::ShortCircuit { retry_after } = self.deps.breakers.acquire(GENERATION_API).await? {
            return Ok(PipelineOutcome::ShortCircuited {
                dependency: GENERATION_API.to_string(),
                retry_after_ms: retry_after.as_millis() as u64,
            });
        }

        let picked_up = self
            .deps
            .status
            .transition(TransitionRequest::system(
                job.id,
                JobStatus::Processing,
                "picked up for generation",
            ))
            .await?;
        if !picked_up.applied() {
            // A concurrent runner got there first.
            return Ok(PipelineOutcome::NotRunnable { status: job.status });
        }

        // Generation stage.
        let started = Instant::now();
        let generated = self.deps.generation.generate(&job.topic, &job.content_type).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let content = match generated {
            Ok(content) => {
                self.deps
                    .limiter
                    .record(GENERATION_API, Some(estimate), Some(content.tokens_used), elapsed_ms, true)
                    .await?;
                self.deps.breakers.record_success(GENERATION_API).await?;
                content
            }
            Err(raw) => {
                let error = classify(&raw);
                self.deps
                    .limiter
                    .record(GENERATION_API, Some(estimate), None, elapsed_ms, false)
                    .await?;
                self.deps
                    .breakers
                    .record_failure(GENERATION_API, error.category)
                    .await?;
                return self.fail(&job, error).await;
            }
        };

        // Publishing stage.
        let rate = self.deps.limiter.check(PUBLISHING_API, None).await?;
        if !rate.allowed {
            self.park(&job, format!("publishing rate limited, retry in {}ms", rate.wait_ms))
                .await?;
            return Ok(PipelineOutcome::RateLimited {
                service: PUBLISHING_API.to_string(),
                wait_ms: rate.wait_ms,
            });
        }
        if let Gate::ShortCircuit { retry_after } = self.deps.breakers.acquire(PUBLISHING_API).await? {
            let retry_after_ms = retry_after.as_millis() as u64;
            self.park(&job, format!("publishing circuit open, retry in {retry_after_ms}ms"))
                .await?;
            return Ok(PipelineOutcome::ShortCircuited {
                dependency: PUBLISHING_API.to_string(),
                retry_after_ms,
            });
        }

        let started = Instant::now();
        let published = self.deps.publishing.publish(&job.topic, &content).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match published {
            Ok(post) => {
                self.deps
                    .limiter
                    .record(PUBLISHING_API, None, None, elapsed_ms, true)
                    .await?;
                self.deps.breakers.record_success(PUBLISHING_API).await?;
                self.complete(&job, &post.reference).await
            }
            Err(raw) => {
                let error = classify(&raw);
                self.deps
                    .limiter
                    .record(PUBLISHING_API, None, None, elapsed_ms, false)
                    .await?;
                self.deps
                    .breakers
                    .record_failure(PUBLISHING_API, error.category)
                    .await?;
                self.fail(&job, error).await
            }
        }
    }

    async fn complete(&self, job: &Job, published_ref: &str) -> Result<PipelineOutcome> {
        if self.deps.tracker.record_success(job.id).await?.is_none() {
            return self.dropped_outcome(job.id).await;
        }
        let completed = self
            .deps
            .status
            .transition(TransitionRequest::system(
                job.id,
                JobStatus::Completed,
                "published",
            ))
            .await?;
        if !completed.applied() {
            return self.dropped_outcome(job.id).await;
        }
        // Only a validated completion stamps the publication reference.
        sqlx::query("UPDATE jobs SET published_ref = $1, updated_at = NOW() WHERE id = $2")
            .bind(published_ref)
            .bind(job.id)
            .execute(&self.deps.db_pool)
            .await?;

        info!(job_id = %job.id, published_ref, "job completed");
        self.sample_alerts().await;
        Ok(PipelineOutcome::Completed {
            published_ref: published_ref.to_string(),
        })
    }

    /// Record the failed attempt, fail the job and, when the policy still
    /// allows a retry, requeue it to pending for the next run.
    async fn fail(&self, job: &Job, error: ClassifiedError) -> Result<PipelineOutcome> {
        let Some(attempt) = self.deps.tracker.record_attempt(job.id, &error).await? else {
            return self.dropped_outcome(job.id).await;
        };

        self.deps
            .status
            .transition(
                TransitionRequest::builder()
                    .job_id(job.id)
                    .to(JobStatus::Failed)
                    .reason(format!("attempt {} failed", attempt.attempt_number))
                    .error_message(error.to_string())
                    .build(),
            )
            .await?;

        if attempt.eligible_for_further_retry {
            self.deps
                .status
                .transition(TransitionRequest::system(
                    job.id,
                    JobStatus::Pending,
                    format!(
                        "retry scheduled after {}ms backoff",
                        attempt.next_delay_ms
                    ),
                ))
                .await?;
        }

        self.sample_alerts().await;
        Ok(PipelineOutcome::Failed {
            category: error.category,
            retry_scheduled: attempt.eligible_for_further_retry,
            next_delay_ms: attempt.next_delay_ms,
        })
    }

    /// Fail the job without recording a retry attempt: the call was never
    /// made, so it neither consumes the retry budget nor feeds the breaker.
    async fn park(&self, job: &Job, reason: String) -> Result<()> {
        self.deps
            .status
            .transition(
                TransitionRequest::builder()
                    .job_id(job.id)
                    .to(JobStatus::Failed)
                    .reason(reason.clone())
                    .error_message(reason)
                    .build(),
            )
            .await?;
        self.deps
            .status
            .transition(TransitionRequest::system(
                job.id,
                JobStatus::Pending,
                "requeued after short-circuit",
            ))
            .await?;
        Ok(())
    }

    /// The job went terminal (cancelled, typically) while the call was in
    /// flight; the outcome is dropped without touching it.
    async fn dropped_outcome(&self, job_id: Uuid) -> Result<PipelineOutcome> {
        let status = Job::find_optional(job_id, &self.deps.db_pool)
            .await?
            .map(|j| j.status)
            .ok_or_else(|| anyhow!("job {job_id} not found"))?;
        warn!(job_id = %job_id, status = ?status, "in-flight outcome dropped, job no longer live");
        Ok(PipelineOutcome::NotRunnable { status })
    }

    /// Alerting rides along after every terminal outcome; a broken alert
    /// store must not fail the pipeline.
    async fn sample_alerts(&self) {
        if let Err(e) = self.deps.alerting.evaluate().await {
            warn!(error = %e, "failure-rate alert evaluation failed");
        }
    }
}
