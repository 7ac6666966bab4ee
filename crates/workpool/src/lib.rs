//! # workpool
//!
//! A bounded, in-process worker pool for async job processing.
//!
//! ## Features
//!
//! - **Backpressure**: a bounded job queue makes producers wait instead of buffering without limit
//! - **Rate limiting**: optional token bucket gating admission
//! - **Dynamic scaling**: add or retire workers between configured bounds
//! - **Fan-in results**: one bounded stream of [`JobResult`]s, one per admitted job
//! - **Graceful shutdown**: drain within a grace period, then cancel in-flight jobs
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Producer                             │
//! │        submit() / scale() / shutdown()                      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                            │
//! │  (RateLimiter → JobQueue → Workers → ResultCollector)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ResultStream                           │
//! │  (consumed by the caller until the pool has stopped)        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Job handlers must check their [`JobContext`] for cancellation; a handler
//! that ignores it keeps shutdown waiting past its grace period.

pub mod error;
pub mod job;
pub mod reliability;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::error::{PoolError, Result};
    pub use crate::job::{Job, JobContext, JobError, JobHandler, JobId, JobResult};
    pub use crate::reliability::{with_retry, RetryPolicy, Retrying};
    pub use crate::worker::{
        PoolConfig, PoolStatus, QueueOrder, RateLimitConfig, ResultStream, ShutdownOutcome,
        WorkerPool,
    };
}

// Re-export key types at crate root
pub use error::{PoolError, Result};
pub use job::{Job, JobContext, JobError, JobHandler, JobId, JobResult};
pub use reliability::{with_retry, RetryPolicy, Retrying};
pub use worker::{
    JobCounts, JobQueue, PoolConfig, PoolStats, PoolStatus, QueueOrder, RateLimitConfig,
    RateLimiter, ResultCollector, ResultStream, ShutdownOutcome, WorkerId, WorkerPool,
    WorkerState,
};
