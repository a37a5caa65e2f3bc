//! Retry policies for transient step failures
//!
//! A [`RetryPolicy`] tells the engine how many times to re-invoke a step whose
//! body returned `Failed`, and how long to wait between attempts (exponential
//! backoff with optional jitter, capped). Policies apply only to execution
//! failures: suspensions are normal exits and schema validation failures are
//! permanent, so neither is ever retried.
//!
//! The engine-wide default lives on
//! [`ExecutorConfig`](crate::executor::ExecutorConfig) and is a single attempt
//! (no retries); individual steps opt in via
//! [`StepDefinition::with_retry_policy`](crate::step::StepDefinition::with_retry_policy).
//! Steps can detect re-entry through
//! [`StepContext::run_count`](crate::step::StepContext::run_count) to keep
//! retried side effects idempotent.

use rand::Rng;
use std::time::Duration;

/// Configuration for retrying failed step executions
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first)
    pub max_attempts: u32,

    /// Interval before the first retry, in seconds
    pub initial_interval: f64,

    /// Multiplier applied to the interval after each retry
    pub backoff_factor: f64,

    /// Upper bound on any single interval, in seconds
    pub max_interval: f64,

    /// Whether to randomize intervals (0.5x to 1.5x) to spread retry load
    pub jitter: bool,
}

impl RetryPolicy {
    /// Policy with the given number of attempts and default backoff
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval: 0.5,
            backoff_factor: 2.0,
            max_interval: 30.0,
            jitter: true,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Whether another attempt is allowed after `attempts` completed ones
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the retry following attempt number `attempt` (0-indexed)
    ///
    /// Exponential: `initial_interval * backoff_factor^attempt`, capped at
    /// `max_interval`, with jitter multiplying by a random factor in
    /// `0.5..=1.5` when enabled.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_interval).max(0.0);

        let final_delay = if self.jitter {
            let factor = rand::thread_rng().gen_range(0.5..=1.5);
            capped * factor
        } else {
            capped
        };

        Duration::from_secs_f64(final_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_none_is_single_attempt() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.max_attempts, 1);
        assert!(!policy.should_retry(1));
    }

    #[test]
    fn test_builder() {
        let policy = RetryPolicy::new(5)
            .with_initial_interval(1.0)
            .with_backoff_factor(3.0)
            .with_max_interval(60.0)
            .with_jitter(false);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_interval, 1.0);
        assert_eq!(policy.backoff_factor, 3.0);
        assert_eq!(policy.max_interval, 60.0);
        assert!(!policy.jitter);
    }

    #[test]
    fn test_exponential_backoff_without_jitter() {
        let policy = RetryPolicy::new(4)
            .with_initial_interval(1.0)
            .with_backoff_factor(2.0)
            .with_max_interval(100.0)
            .with_jitter(false);

        assert_eq!(policy.delay_for(0).as_secs_f64(), 1.0);
        assert_eq!(policy.delay_for(1).as_secs_f64(), 2.0);
        assert_eq!(policy.delay_for(2).as_secs_f64(), 4.0);
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let policy = RetryPolicy::new(0);
        assert_eq!(policy.max_attempts, 1);
    }

    proptest! {
        #[test]
        fn prop_delay_never_exceeds_cap(attempt in 0u32..20, cap in 0.1f64..120.0) {
            let policy = RetryPolicy::new(20)
                .with_initial_interval(0.5)
                .with_backoff_factor(2.0)
                .with_max_interval(cap)
                .with_jitter(false);

            prop_assert!(policy.delay_for(attempt).as_secs_f64() <= cap + f64::EPSILON);
        }
    }
}
