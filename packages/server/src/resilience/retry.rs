//! Retry policy: backoff delays and retry eligibility.
//!
//! Pure computation, no I/O. The [`RetryTracker`](super::tracker) consults
//! this policy against a job's persisted attempt history; the policy itself
//! never sleeps or touches the store.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use super::classify::ClassifiedError;

/// Backoff and eligibility configuration.
///
/// An explicit, overridable object: the active configuration is replaced
/// atomically via the retry config endpoint, never patched in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base_delay_ms: u64,
    /// Ceiling for the computed delay, before jitter.
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub backoff_multiplier: f64,
    /// Symmetric jitter as a fraction of the computed delay.
    pub jitter_factor: f64,
    /// Maximum number of retry attempts per job.
    pub max_attempts: u32,
    /// Overall wall-clock budget for a job's retries.
    pub overall_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
            max_attempts: 3,
            overall_timeout_ms: 600_000, // 10 minutes
        }
    }
}

impl RetryConfig {
    /// Clamp user-supplied values into a sane range.
    pub fn sanitized(mut self) -> Self {
        self.backoff_multiplier = self.backoff_multiplier.max(1.0);
        self.jitter_factor = self.jitter_factor.clamp(0.0, 1.0);
        self.max_delay_ms = self.max_delay_ms.max(self.base_delay_ms);
        self
    }

    /// Deterministic delay for a 1-based attempt number, before jitter.
    ///
    /// `min(max_delay, base_delay * multiplier^(attempt-1))`, so it is
    /// monotonically non-decreasing in the attempt number until the cap.
    pub fn base_delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31) as i32;
        let ms = (self.base_delay_ms as f64) * self.backoff_multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    /// Delay for an attempt with symmetric random jitter applied.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_for_attempt(attempt).as_millis() as f64;
        if self.jitter_factor <= 0.0 || base <= 0.0 {
            return Duration::from_millis(base as u64);
        }
        let spread = base * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_millis((base + jitter).max(0.0) as u64)
    }
}

/// Why a retry was ruled out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IneligibilityReason {
    NonRetryable,
    MaxAttemptsExceeded,
    TimeoutExceeded,
}

impl IneligibilityReason {
    pub fn describe(&self) -> &'static str {
        match self {
            IneligibilityReason::NonRetryable => "the failure category is not retryable",
            IneligibilityReason::MaxAttemptsExceeded => "the maximum retry attempts were exhausted",
            IneligibilityReason::TimeoutExceeded => "the overall retry time budget was exhausted",
        }
    }
}

/// Outcome of a policy evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryDecision {
    pub eligible: bool,
    /// Delay to apply before the next attempt, when eligible.
    pub delay_ms: u64,
    pub reason: Option<IneligibilityReason>,
}

impl RetryDecision {
    fn eligible(delay: Duration) -> Self {
        Self {
            eligible: true,
            delay_ms: delay.as_millis() as u64,
            reason: None,
        }
    }

    fn ineligible(reason: IneligibilityReason) -> Self {
        Self {
            eligible: false,
            delay_ms: 0,
            reason: Some(reason),
        }
    }
}

/// Decide whether a job may retry after `error`, on its `attempt`-th try
/// (1-based), given the wall-clock time already spent on the job.
///
/// A server-suggested delay (rate-limit Retry-After) takes precedence over
/// the computed backoff.
pub fn evaluate(
    config: &RetryConfig,
    error: &ClassifiedError,
    attempt: u32,
    elapsed: Duration,
) -> RetryDecision {
    if !error.is_retryable() {
        return RetryDecision::ineligible(IneligibilityReason::NonRetryable);
    }
    if attempt > config.max_attempts {
        return RetryDecision::ineligible(IneligibilityReason::MaxAttemptsExceeded);
    }
    if elapsed >= Duration::from_millis(config.overall_timeout_ms) {
        return RetryDecision::ineligible(IneligibilityReason::TimeoutExceeded);
    }

    let delay = error
        .retry_after()
        .unwrap_or_else(|| config.delay_for_attempt(attempt));
    RetryDecision::eligible(delay)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::classify::{classify, RawFailure};

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        }
    }

    fn server_error() -> ClassifiedError {
        classify(&RawFailure::new(Some(503), "unavailable"))
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let config = no_jitter();
        assert_eq!(config.base_delay_for_attempt(1), Duration::from_millis(1_000));
        assert_eq!(config.base_delay_for_attempt(2), Duration::from_millis(2_000));
        assert_eq!(config.base_delay_for_attempt(3), Duration::from_millis(4_000));
    }

    #[test]
    fn delay_is_monotone_until_cap() {
        let config = RetryConfig {
            jitter_factor: 0.0,
            max_delay_ms: 5_000,
            ..RetryConfig::default()
        };
        let mut last = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = config.base_delay_for_attempt(attempt);
            assert!(delay >= last, "delay decreased at attempt {attempt}");
            assert!(delay <= Duration::from_millis(5_000));
            last = delay;
        }
        assert_eq!(last, Duration::from_millis(5_000));
    }

    #[test]
    fn jitter_stays_within_band() {
        let config = RetryConfig {
            jitter_factor: 0.1,
            backoff_multiplier: 1.0,
            ..RetryConfig::default()
        };
        for _ in 0..100 {
            let ms = config.delay_for_attempt(1).as_millis() as f64;
            assert!((900.0..=1100.0).contains(&ms), "delay out of band: {ms}");
        }
    }

    #[test]
    fn non_retryable_error_is_ineligible() {
        let err = classify(&RawFailure::new(Some(401), "bad key"));
        let decision = evaluate(&no_jitter(), &err, 1, Duration::ZERO);
        assert!(!decision.eligible);
        assert_eq!(decision.reason, Some(IneligibilityReason::NonRetryable));
    }

    #[test]
    fn attempts_past_max_are_ineligible() {
        let decision = evaluate(&no_jitter(), &server_error(), 4, Duration::ZERO);
        assert!(!decision.eligible);
        assert_eq!(decision.reason, Some(IneligibilityReason::MaxAttemptsExceeded));
    }

    #[test]
    fn elapsed_past_timeout_is_ineligible() {
        let decision = evaluate(
            &no_jitter(),
            &server_error(),
            1,
            Duration::from_millis(600_000),
        );
        assert!(!decision.eligible);
        assert_eq!(decision.reason, Some(IneligibilityReason::TimeoutExceeded));
    }

    #[test]
    fn server_retry_after_overrides_backoff() {
        let err = classify(
            &RawFailure::new(Some(429), "slow down")
                .with_retry_after(Duration::from_secs(42)),
        );
        let decision = evaluate(&no_jitter(), &err, 1, Duration::ZERO);
        assert!(decision.eligible);
        assert_eq!(decision.delay_ms, 42_000);
    }

    #[test]
    fn sanitized_clamps_out_of_range_values() {
        let config = RetryConfig {
            backoff_multiplier: 0.2,
            jitter_factor: 3.0,
            base_delay_ms: 10_000,
            max_delay_ms: 1_000,
            ..RetryConfig::default()
        }
        .sanitized();
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.jitter_factor, 1.0);
        assert_eq!(config.max_delay_ms, 10_000);
    }
}
