//! Pool configuration
//!
//! A plain configuration snapshot supplied at start. Only the live worker
//! count changes afterwards (through [`WorkerPool::scale`](super::WorkerPool::scale)).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::PoolError;

/// Environment variable prefix used by [`PoolConfig::from_env`]
pub const ENV_PREFIX: &str = "WORKPOOL_";

/// Order in which buffered jobs are handed to workers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// Strict submission order; priority hints are ignored
    #[default]
    Fifo,
    /// Highest priority first, submission order among equal priorities
    Priority,
}

impl std::str::FromStr for QueueOrder {
    type Err = PoolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fifo" => Ok(Self::Fifo),
            "priority" => Ok(Self::Priority),
            other => Err(PoolError::config(format!("unknown queue order '{other}'"))),
        }
    }
}

/// Token-bucket parameters
///
/// # Example
///
/// ```
/// use workpool::RateLimitConfig;
///
/// // 50 admissions per second, bursts of up to 10
/// let limit = RateLimitConfig::per_second(50.0).with_burst(10);
/// assert_eq!(limit.burst, 10);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateLimitConfig {
    /// Refill rate in tokens per second
    pub rate: f64,

    /// Bucket capacity
    pub burst: u32,
}

impl RateLimitConfig {
    /// `rate` tokens per second with a burst equal to one second's worth
    pub fn per_second(rate: f64) -> Self {
        Self {
            rate,
            burst: default_burst(rate),
        }
    }

    /// Set the bucket capacity
    pub fn with_burst(mut self, burst: u32) -> Self {
        self.burst = burst;
        self
    }

    fn validate(&self) -> Result<(), PoolError> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(PoolError::config(format!(
                "rate limit must be a positive number of tokens per second, got {}",
                self.rate
            )));
        }
        // The refill interval of one token must fit in a Duration
        if Duration::try_from_secs_f64(1.0 / self.rate).is_err() {
            return Err(PoolError::config(format!(
                "rate limit of {} tokens per second is too small",
                self.rate
            )));
        }
        if self.burst == 0 {
            return Err(PoolError::config("rate limit burst must be at least 1"));
        }
        Ok(())
    }
}

fn default_burst(rate: f64) -> u32 {
    if rate.is_finite() && rate >= 1.0 {
        rate.ceil().min(u32::MAX as f64) as u32
    } else {
        1
    }
}

/// Worker pool configuration
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use workpool::{PoolConfig, RateLimitConfig};
///
/// let config = PoolConfig::new()
///     .with_worker_bounds(2, 8)
///     .with_initial_workers(4)
///     .with_queue_capacity(128)
///     .with_rate_limit(RateLimitConfig::per_second(100.0))
///     .with_shutdown_grace(Duration::from_secs(10));
///
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Workers spawned at start
    pub initial_workers: usize,

    /// Lower bound for scaling (at least 1)
    pub min_workers: usize,

    /// Upper bound for scaling
    pub max_workers: usize,

    /// Maximum number of buffered jobs
    pub queue_capacity: usize,

    /// Maximum number of buffered results before workers block
    pub result_buffer: usize,

    /// Admission rate limit (`None` = unlimited)
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,

    /// Default grace period used by [`WorkerPool::stop`](super::WorkerPool::stop)
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,

    /// Per-job execution limit (`None` = handlers run until they return)
    #[serde(default, with = "option_duration_millis")]
    pub job_timeout: Option<Duration>,

    /// Queue ordering
    #[serde(default)]
    pub queue_order: QueueOrder,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_workers: 4,
            min_workers: 1,
            max_workers: 16,
            queue_capacity: 64,
            result_buffer: 256,
            rate_limit: None,
            shutdown_grace: Duration::from_secs(30),
            job_timeout: None,
            queue_order: QueueOrder::Fifo,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers spawned at start
    pub fn with_initial_workers(mut self, count: usize) -> Self {
        self.initial_workers = count;
        self
    }

    /// Set the scaling bounds
    pub fn with_worker_bounds(mut self, min: usize, max: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Pin the pool to exactly `count` workers
    pub fn with_fixed_workers(mut self, count: usize) -> Self {
        self.initial_workers = count;
        self.min_workers = count;
        self.max_workers = count;
        self
    }

    /// Set the job queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Set the result buffer size
    pub fn with_result_buffer(mut self, size: usize) -> Self {
        self.result_buffer = size;
        self
    }

    /// Set the admission rate limit
    pub fn with_rate_limit(mut self, limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(limit);
        self
    }

    /// Set the default shutdown grace period
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Set the per-job timeout
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Set the queue ordering
    pub fn with_queue_order(mut self, order: QueueOrder) -> Self {
        self.queue_order = order;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.min_workers == 0 {
            return Err(PoolError::config(
                "min_workers must be at least 1 (a pool without workers never drains)",
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::config(format!(
                "min_workers ({}) must not exceed max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.initial_workers < self.min_workers || self.initial_workers > self.max_workers {
            return Err(PoolError::config(format!(
                "initial_workers ({}) must lie within [{}, {}]",
                self.initial_workers, self.min_workers, self.max_workers
            )));
        }
        if self.queue_capacity == 0 {
            return Err(PoolError::config("queue_capacity must be at least 1"));
        }
        if self.result_buffer == 0 {
            return Err(PoolError::config("result_buffer must be at least 1"));
        }
        if self.job_timeout == Some(Duration::ZERO) {
            return Err(PoolError::config("job_timeout must be greater than zero"));
        }
        if let Some(limit) = &self.rate_limit {
            limit.validate()?;
        }
        Ok(())
    }

    /// Load configuration from `WORKPOOL_*` environment variables
    ///
    /// Missing variables keep their defaults; unparseable ones are logged and
    /// ignored. Recognised variables:
    ///
    /// - `WORKPOOL_INITIAL_WORKERS`, `WORKPOOL_MIN_WORKERS`, `WORKPOOL_MAX_WORKERS`
    /// - `WORKPOOL_QUEUE_CAPACITY`, `WORKPOOL_RESULT_BUFFER`
    /// - `WORKPOOL_RATE_LIMIT` (tokens/second), `WORKPOOL_RATE_BURST`
    /// - `WORKPOOL_SHUTDOWN_GRACE_MS`, `WORKPOOL_JOB_TIMEOUT_MS`
    /// - `WORKPOOL_QUEUE_ORDER` (`fifo` or `priority`)
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let parsed = |name: &str| -> Option<u64> {
            let raw = get(name)?;
            match raw.trim().parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(variable = %format!("{ENV_PREFIX}{name}"), value = %raw, "Ignoring unparseable setting");
                    None
                }
            }
        };

        let mut config = Self::default();

        if let Some(v) = parsed("INITIAL_WORKERS") {
            config.initial_workers = v as usize;
        }
        if let Some(v) = parsed("MIN_WORKERS") {
            config.min_workers = v as usize;
        }
        if let Some(v) = parsed("MAX_WORKERS") {
            config.max_workers = v as usize;
        }
        if let Some(v) = parsed("QUEUE_CAPACITY") {
            config.queue_capacity = v as usize;
        }
        if let Some(v) = parsed("RESULT_BUFFER") {
            config.result_buffer = v as usize;
        }
        if let Some(v) = parsed("SHUTDOWN_GRACE_MS") {
            config.shutdown_grace = Duration::from_millis(v);
        }
        if let Some(v) = parsed("JOB_TIMEOUT_MS") {
            config.job_timeout = Some(Duration::from_millis(v));
        }

        if let Some(raw) = get("RATE_LIMIT") {
            match raw.trim().parse::<f64>() {
                Ok(rate) => {
                    let mut limit = RateLimitConfig::per_second(rate);
                    if let Some(burst) = parsed("RATE_BURST") {
                        limit.burst = burst.min(u32::MAX as u64) as u32;
                    }
                    config.rate_limit = Some(limit);
                }
                Err(_) => {
                    warn!(value = %raw, "Ignoring unparseable WORKPOOL_RATE_LIMIT");
                }
            }
        }

        if let Some(raw) = get("QUEUE_ORDER") {
            match raw.parse() {
                Ok(order) => config.queue_order = order,
                Err(e) => warn!(error = %e, "Ignoring WORKPOOL_QUEUE_ORDER"),
            }
        }

        config
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Serde support for Option<Duration> as milliseconds
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
