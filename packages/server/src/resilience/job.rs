//! Content job model.
//!
//! A job is one unit of "generate this piece of content and publish it".
//! Its `status` is owned by the [`JobStatusManager`](super::status) and is
//! only ever mutated through validated transitions.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::status::JobStatus;

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    pub topic: String,
    #[builder(default = "article".to_string())]
    pub content_type: String,

    #[builder(default)]
    pub status: JobStatus,
    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,

    /// Identifier returned by the publishing backend once posted.
    #[builder(default, setter(strip_option))]
    pub published_ref: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a new pending job for a topic.
    pub fn new(topic: &str, content_type: &str) -> Self {
        Self::builder()
            .topic(topic.to_string())
            .content_type(content_type.to_string())
            .build()
    }

    /// Whether the job is still live (attempt outcomes may apply).
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub async fn insert(&self, db: &PgPool) -> Result<Self> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO jobs (id, topic, content_type, status, retry_count, max_retries,
                              published_ref, error_message, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id, topic, content_type, status, retry_count, max_retries,
                      published_ref, error_message, created_at, updated_at
            "#,
        )
        .bind(self.id)
        .bind(&self.topic)
        .bind(&self.content_type)
        .bind(self.status)
        .bind(self.retry_count)
        .bind(self.max_retries)
        .bind(&self.published_ref)
        .bind(&self.error_message)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(db)
        .await?;
        Ok(job)
    }

    pub async fn find_optional(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, topic, content_type, status, retry_count, max_retries,
                   published_ref, error_message, created_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(db)
        .await?;
        Ok(job)
    }

    /// Most recently updated jobs, for the dashboard history view.
    pub async fn find_recent(limit: i64, db: &PgPool) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, topic, content_type, status, retry_count, max_retries,
                   published_ref, error_message, created_at, updated_at
            FROM jobs
            ORDER BY updated_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(db)
        .await?;
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_starts_pending_with_zero_retries() {
        let job = Job::new("rust release notes", "article");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(job.max_retries, 3);
        assert!(job.is_active());
    }

    #[test]
    fn builder_defaults_content_type() {
        let job = Job::builder().topic("weekly digest".to_string()).build();
        assert_eq!(job.content_type, "article");
    }
}
