//! Worker pool for in-process job execution
//!
//! This module provides:
//! - [`WorkerPool`] - Pool controller: admission, scaling and shutdown
//! - [`JobQueue`] - Bounded job buffer enforcing backpressure
//! - [`RateLimiter`] - Token-bucket admission control
//! - [`ResultCollector`] / [`ResultStream`] - Fan-in of job results
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkerPool                            │
//! │                                                             │
//! │  submit ──► RateLimiter ──► JobQueue (bounded, closable)    │
//! │                                  │                          │
//! │                                  ▼                          │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │   Workers (Idle ⇄ Busy → Draining → Stopped)        │    │
//! │  │   [worker-1] [worker-2] ... [worker-N]              │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! │                                  │                          │
//! │                                  ▼                          │
//! │                ResultCollector (bounded) ──► results()      │
//! │                                                             │
//! │  CancellationToken shared by workers and job contexts       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use workpool::{Job, JobContext, JobError, PoolConfig, WorkerPool};
//!
//! # async fn run() -> workpool::Result<()> {
//! let config = PoolConfig::default()
//!     .with_worker_bounds(2, 8)
//!     .with_initial_workers(4)
//!     .with_queue_capacity(32);
//!
//! let pool = WorkerPool::start(config, |ctx: JobContext, job: Job<String>| async move {
//!     if ctx.is_cancelled() {
//!         return Err(JobError::Cancelled);
//!     }
//!     Ok(job.into_payload().len())
//! })?;
//!
//! let mut results = pool.results()?;
//! pool.submit(Job::new("greeting", "hello".to_string())).await?;
//!
//! // Graceful shutdown
//! pool.shutdown(Duration::from_secs(5)).await?;
//! while let Some(result) = results.recv().await {
//!     println!("{}: {:?}", result.job_id, result.outcome);
//! }
//! # Ok(())
//! # }
//! ```

mod collector;
pub(crate) mod config;
mod pool;
mod queue;
mod rate_limiter;
mod runner;
mod stats;

pub use collector::{ResultCollector, ResultStream};
pub use config::{PoolConfig, QueueOrder, RateLimitConfig, ENV_PREFIX};
pub use pool::{PoolStatus, ShutdownOutcome, WorkerPool};
pub use queue::JobQueue;
pub use rate_limiter::RateLimiter;
pub use runner::{WorkerExit, WorkerId, WorkerState};
pub use stats::{JobCounts, PoolStats};
