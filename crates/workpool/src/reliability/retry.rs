//! Retry policy and the retrying handler decorator

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::job::{Job, JobContext, JobError, JobHandler};
use crate::worker::config::duration_millis;

/// Backoff schedule for retrying failed jobs
///
/// Supports exponential backoff with jitter to avoid thundering herd.
///
/// # Example
///
/// ```
/// use workpool::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy::exponential()
///     .with_max_attempts(4)
///     .with_initial_interval(Duration::from_millis(100))
///     .with_max_interval(Duration::from_secs(5));
///
/// assert!(policy.has_attempts_remaining(3));
/// assert!(!policy.has_attempts_remaining(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including initial)
    pub max_attempts: u32,

    /// Initial delay before first retry
    #[serde(with = "duration_millis")]
    pub initial_interval: Duration,

    /// Maximum delay between retries
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier (e.g., 2.0 for exponential)
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10%
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    /// Exponential backoff: 3 attempts, 100ms initial, 10s cap, 2x, 10% jitter
    pub fn exponential() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 2.0,
            jitter: 0.1,
        }
    }

    /// Create a policy that never retries
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_interval: Duration::ZERO,
            max_interval: Duration::ZERO,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    /// Create a policy with fixed intervals (no backoff)
    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient;
        self
    }

    /// Set the jitter factor (clamped to 0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before `attempt` (1-based); zero for the first attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let retry_num = attempt - 1;
        let base = self.initial_interval.as_secs_f64()
            * self.backoff_coefficient.powi(retry_num as i32 - 1);
        let capped = base.min(self.max_interval.as_secs_f64());

        let jittered = if self.jitter > 0.0 && capped > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = capped * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (capped + jitter_offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(jittered)
    }

    /// Only processing failures are worth another attempt
    pub fn should_retry(&self, error: &JobError) -> bool {
        error.is_processing()
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Handler decorator retrying [`JobError::Processing`] failures
///
/// The pool itself never retries; wrap a handler in `Retrying` to opt in.
/// Each attempt gets a clone of the job, so the payload must be `Clone`.
/// Backoff sleeps end early with [`JobError::Cancelled`] when the pool is
/// cancelled.
#[derive(Debug, Clone)]
pub struct Retrying<H> {
    inner: H,
    policy: RetryPolicy,
}

impl<H> Retrying<H> {
    pub fn new(inner: H, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn into_inner(self) -> H {
        self.inner
    }
}

/// Wrap `handler` so processing failures are retried under `policy`
pub fn with_retry<H>(handler: H, policy: RetryPolicy) -> Retrying<H> {
    Retrying::new(handler, policy)
}

#[async_trait]
impl<P, O, H> JobHandler<P, O> for Retrying<H>
where
    H: JobHandler<P, O>,
    P: Clone + Send + Sync + 'static,
    O: Send + 'static,
{
    async fn handle(&self, ctx: JobContext, job: Job<P>) -> Result<O, JobError> {
        let mut attempt = 1;
        loop {
            let error = match self.inner.handle(ctx.clone(), job.clone()).await {
                Ok(output) => return Ok(output),
                Err(error) => error,
            };

            if !self.policy.should_retry(&error)
                || !self.policy.has_attempts_remaining(attempt)
                || ctx.is_cancelled()
            {
                return Err(error);
            }

            attempt += 1;
            let delay = self.policy.delay_for_attempt(attempt);
            debug!(
                job_id = %ctx.job_id(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                %error,
                "Retrying job"
            );

            tokio::select! {
                biased;
                _ = ctx.cancelled() => return Err(JobError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
