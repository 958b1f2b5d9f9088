//! Job resilience subsystem: classification, retry policy, circuit
//! breakers, rate limiting, durable retry tracking, the job lifecycle
//! state machine, failure-rate alerting and admin retry controls.

pub mod admin;
pub mod alerting;
pub mod circuit_breaker;
pub mod classify;
pub mod job;
pub mod rate_limiter;
pub mod retry;
pub mod status;
pub mod tracker;

pub use admin::{is_permitted, AdminRetryManager, AdminRetryOutcome, AdminRetryRequest, AdminRole, RetryType};
pub use alerting::{
    Alert, AlertEvaluation, AlertNotifier, AlertSeverity, AlertThresholds, AlertingEngine,
    Channel, FailureRateSample, LogNotifier,
};
pub use circuit_breaker::{
    BreakerConfig, BreakerRow, BreakerState, CircuitBreaker, Gate, GENERATION_API, PUBLISHING_API,
};
pub use classify::{classify, ClassifiedError, ErrorCategory, RawFailure};
pub use job::Job;
pub use rate_limiter::{default_quotas, RateDecision, RateLimiter, ServiceQuota};
pub use retry::{evaluate, IneligibilityReason, RetryConfig, RetryDecision};
pub use status::{
    Actor, JobStatus, JobStatusManager, StatusTransition, TransitionOutcome, TransitionRequest,
};
pub use tracker::{
    accepts_outcome, bumped_retry_count, evaluate_history, policy_for_job, AttemptOutcome,
    AttemptRecord, RetryAttempt, RetryEligibility, RetryStats, RetryTracker, SharedRetryConfig,
};
