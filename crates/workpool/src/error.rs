//! Engine-level errors

use thiserror::Error;

/// Result type alias for pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

/// Errors returned synchronously by the pool, its queue and its rate limiter
///
/// Failures of individual jobs are never reported here; they travel inside
/// the job's [`JobResult`](crate::JobResult) as a [`JobError`](crate::JobError).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    /// The shared cancellation token (or a per-call token) fired
    #[error("operation cancelled")]
    Cancelled,

    /// A job was submitted after shutdown began
    #[error("job queue is closed")]
    QueueClosed,

    /// Invalid pool configuration, detected at start
    #[error("invalid pool configuration: {0}")]
    Config(String),

    /// The pool is draining or stopped
    #[error("worker pool is not running")]
    NotRunning,

    /// The result stream was already handed out
    #[error("result stream has already been taken")]
    ResultsTaken,

    /// The pool was started outside of a tokio runtime
    #[error("worker pool must be started from within a tokio runtime")]
    NoRuntime,
}

impl PoolError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        PoolError::Config(msg.into())
    }
}
