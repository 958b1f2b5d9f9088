//! Server dependencies (using traits for testability).
//!
//! Central dependency container shared by the pipeline and the HTTP
//! handlers. External services (generation, publishing, alert delivery)
//! sit behind trait objects so tests can swap them out.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use super::generation::GenerationApi;
use super::publishing::PublishingApi;
use crate::resilience::{
    default_quotas, AdminRetryManager, AlertNotifier, AlertThresholds, AlertingEngine,
    BreakerConfig, CircuitBreaker, JobStatusManager, RateLimiter, RetryConfig, RetryTracker,
    SharedRetryConfig,
};

/// How far back the alerting engine samples job outcomes.
const ALERT_SAMPLE_WINDOW: Duration = Duration::from_secs(60 * 60);

/// Server dependencies accessible to the pipeline and handlers.
#[derive(Clone)]
pub struct ServerDeps {
    pub db_pool: PgPool,
    pub generation: Arc<dyn GenerationApi>,
    pub publishing: Arc<dyn PublishingApi>,
    pub breakers: Arc<CircuitBreaker>,
    pub limiter: Arc<RateLimiter>,
    pub tracker: Arc<RetryTracker>,
    pub status: Arc<JobStatusManager>,
    pub alerting: Arc<AlertingEngine>,
    pub admin: Arc<AdminRetryManager>,
}

impl ServerDeps {
    pub fn new(
        db_pool: PgPool,
        generation: Arc<dyn GenerationApi>,
        publishing: Arc<dyn PublishingApi>,
        notifier: Arc<dyn AlertNotifier>,
    ) -> Self {
        let retry_config = SharedRetryConfig::new(RetryConfig::default());
        let tracker = Arc::new(RetryTracker::new(db_pool.clone(), retry_config));

        Self {
            breakers: Arc::new(CircuitBreaker::new(db_pool.clone(), BreakerConfig::default())),
            limiter: Arc::new(RateLimiter::new(db_pool.clone(), default_quotas())),
            status: Arc::new(JobStatusManager::new(db_pool.clone())),
            alerting: Arc::new(AlertingEngine::new(
                db_pool.clone(),
                AlertThresholds::default(),
                notifier,
                ALERT_SAMPLE_WINDOW,
            )),
            admin: Arc::new(AdminRetryManager::new(db_pool.clone(), tracker.clone())),
            tracker,
            db_pool,
            generation,
            publishing,
        }
    }
}
