//! Worker pool controller
//!
//! Owns the worker registry, admission (rate limiter + queue), scaling and
//! the shutdown sequence.

use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

use super::collector::{ResultCollector, ResultStream};
use super::config::PoolConfig;
use super::queue::JobQueue;
use super::rate_limiter::RateLimiter;
use super::runner::{Shared, Worker, WorkerExit, WorkerHandle, WorkerId, WorkerState};
use super::stats::{PoolCounters, PoolStats};
use crate::error::{PoolError, Result};
use crate::job::{Job, JobHandler, JobResult};

/// How often a stalled shutdown reports the jobs still in flight
const STALL_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Pool status, monotonic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStatus {
    /// Accepting jobs
    Running,
    /// Shutdown started; intake closed
    Draining,
    /// Every worker stopped and the result stream is closed
    Stopped,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// How a shutdown ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownOutcome {
    /// Every queued job was processed within the grace period
    Graceful,
    /// The grace period elapsed (or the pool was cancelled) and in-flight
    /// jobs were told to stop
    Forced,
}

impl fmt::Display for ShutdownOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Graceful => write!(f, "graceful"),
            Self::Forced => write!(f, "forced"),
        }
    }
}

/// Live workers keyed by id
#[derive(Default)]
struct Registry {
    workers: BTreeMap<WorkerId, WorkerHandle>,
    next_id: u64,
}

impl Registry {
    fn spawn<P, O>(&mut self, shared: &Arc<Shared<P, O>>, runtime: &Handle) -> WorkerId
    where
        P: Send + 'static,
        O: Send + 'static,
    {
        self.next_id += 1;
        let id = WorkerId::new(self.next_id);
        let handle = Worker::spawn(id, Arc::clone(shared), runtime);
        self.workers.insert(id, handle);
        id
    }

    /// Forget workers that have left their loop
    fn prune(&mut self) {
        self.workers
            .retain(|_, handle| !handle.is_finished() && handle.state() != WorkerState::Stopped);
    }

    /// Workers not yet asked to retire
    fn active(&self) -> usize {
        self.workers.values().filter(|h| !h.is_retiring()).count()
    }

    /// Retire `count` workers, idle ones first, then the most recently started
    fn retire(&self, count: usize) -> Vec<WorkerId> {
        let mut candidates: Vec<&WorkerHandle> =
            self.workers.values().filter(|h| !h.is_retiring()).collect();
        candidates.sort_by_key(|h| (h.state() != WorkerState::Idle, Reverse(h.id)));

        candidates
            .into_iter()
            .take(count)
            .map(|handle| {
                handle.retire();
                handle.id
            })
            .collect()
    }
}

/// Bounded pool of workers processing jobs of payload `P` into outputs `O`
///
/// ```text
/// submit ─► RateLimiter ─► JobQueue ─► Worker × N ─► ResultCollector ─► results()
/// ```
///
/// The pool must be started inside a tokio runtime; workers and the shutdown
/// sequence run as tasks on that runtime.
pub struct WorkerPool<P, O> {
    config: PoolConfig,
    shared: Arc<Shared<P, O>>,
    limiter: Option<RateLimiter>,
    registry: Mutex<Registry>,
    runtime: Handle,
    status: Arc<watch::Sender<PoolStatus>>,
    outcome: Arc<OnceLock<ShutdownOutcome>>,
    results: Mutex<Option<ResultStream<O>>>,
}

impl<P, O> WorkerPool<P, O>
where
    P: Send + 'static,
    O: Send + 'static,
{
    /// Validate `config` and spawn the initial workers
    #[instrument(skip(config, handler), fields(initial_workers = config.initial_workers))]
    pub fn start<H>(config: PoolConfig, handler: H) -> Result<Self>
    where
        H: JobHandler<P, O>,
    {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| PoolError::NoRuntime)?;

        let (collector, results) = ResultCollector::new(config.result_buffer);
        let shared = Arc::new(Shared {
            queue: JobQueue::new(config.queue_capacity, config.queue_order),
            collector,
            handler: Arc::new(handler),
            cancel: CancellationToken::new(),
            in_flight: DashMap::new(),
            counters: PoolCounters::default(),
            job_timeout: config.job_timeout,
        });

        let mut registry = Registry::default();
        for _ in 0..config.initial_workers {
            registry.spawn(&shared, &runtime);
        }

        info!(
            initial_workers = config.initial_workers,
            min_workers = config.min_workers,
            max_workers = config.max_workers,
            queue_capacity = config.queue_capacity,
            rate_limited = config.rate_limit.is_some(),
            "Worker pool started"
        );

        let (status, _) = watch::channel(PoolStatus::Running);

        Ok(Self {
            limiter: config.rate_limit.as_ref().map(RateLimiter::new),
            config,
            shared,
            registry: Mutex::new(registry),
            runtime,
            status: Arc::new(status),
            outcome: Arc::new(OnceLock::new()),
            results: Mutex::new(Some(results)),
        })
    }

    /// Submit a job, waiting on the rate limiter and then for queue capacity
    ///
    /// Fails with [`PoolError::QueueClosed`] once shutdown has begun and with
    /// [`PoolError::Cancelled`] if the pool is cancelled while waiting.
    pub async fn submit(&self, job: Job<P>) -> Result<()> {
        self.admit(job, &self.shared.cancel).await
    }

    /// Like [`submit`](Self::submit), but also gives up when `cancel` fires
    ///
    /// A job is never enqueued when this returns an error.
    pub async fn submit_with_cancel(&self, job: Job<P>, cancel: &CancellationToken) -> Result<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Cancelled),
            admitted = self.admit(job, &self.shared.cancel) => admitted,
        }
    }

    async fn admit(&self, job: Job<P>, cancel: &CancellationToken) -> Result<()> {
        if *self.status.borrow() != PoolStatus::Running {
            return Err(PoolError::QueueClosed);
        }

        if let Some(limiter) = &self.limiter {
            limiter.wait(cancel).await?;
        }

        let job_id = job.id().clone();
        self.shared.queue.submit(job, cancel).await?;
        self.shared.counters.record_submitted();
        debug!(%job_id, "Job queued");
        Ok(())
    }

    /// Add (`delta > 0`) or retire (`delta < 0`) workers
    ///
    /// The change is clamped to `[min_workers, max_workers]`. Retiring workers
    /// count against `max_workers` until they have stopped. Scale-down retires
    /// idle workers first; a busy worker finishes its current job before it
    /// stops. Returns the number of active (non-retiring) workers.
    #[instrument(skip(self))]
    pub fn scale(&self, delta: isize) -> Result<usize> {
        let mut registry = self.registry.lock();
        if *self.status.borrow() != PoolStatus::Running {
            return Err(PoolError::NotRunning);
        }
        registry.prune();

        let requested = delta.unsigned_abs();
        if delta > 0 {
            let room = self.config.max_workers.saturating_sub(registry.workers.len());
            let added = requested.min(room);
            if added < requested {
                warn!(requested, added, max_workers = self.config.max_workers, "Scale-up clamped");
            }
            for _ in 0..added {
                let id = registry.spawn(&self.shared, &self.runtime);
                debug!(worker_id = %id, "Worker added");
            }
        } else if delta < 0 {
            let removable = registry.active().saturating_sub(self.config.min_workers);
            let removed = requested.min(removable);
            if removed < requested {
                warn!(requested, removed, min_workers = self.config.min_workers, "Scale-down clamped");
            }
            for id in registry.retire(removed) {
                debug!(worker_id = %id, "Worker retiring");
            }
        }

        let active = registry.active();
        info!(active, "Worker pool scaled");
        Ok(active)
    }

    /// Shut the pool down
    ///
    /// 1. closes the queue to new jobs,
    /// 2. lets workers drain it for up to `grace` (`Duration::MAX` waits forever),
    /// 3. cancels in-flight jobs if the grace period elapses,
    /// 4. waits for every worker to stop,
    /// 5. closes the result stream.
    ///
    /// Jobs still queued after a forced stop are reported as
    /// [`JobError::Cancelled`](crate::JobError::Cancelled) results. Calling
    /// this again, or concurrently, waits for the same shutdown and returns
    /// the same outcome. The sequence runs in its own task, so dropping the
    /// returned future does not abort it.
    #[instrument(skip(self))]
    pub async fn shutdown(&self, grace: Duration) -> Result<ShutdownOutcome> {
        let handles = {
            let mut registry = self.registry.lock();
            let began = self.status.send_if_modified(|status| {
                if *status == PoolStatus::Running {
                    *status = PoolStatus::Draining;
                    true
                } else {
                    false
                }
            });
            began.then(|| std::mem::take(&mut registry.workers))
        };

        if let Some(handles) = handles {
            info!(workers = handles.len(), "Initiating graceful shutdown");

            let shared = Arc::clone(&self.shared);
            let status = Arc::clone(&self.status);
            let outcome = Arc::clone(&self.outcome);
            self.runtime.spawn(
                async move {
                    let result = drain(shared, handles, grace).await;
                    let _ = outcome.set(result);
                    status.send_replace(PoolStatus::Stopped);
                    info!(outcome = %result, "Worker pool stopped");
                }
                .in_current_span(),
            );
        }

        self.wait_stopped().await
    }

    /// Shut down with the configured grace period
    pub async fn stop(&self) -> Result<ShutdownOutcome> {
        self.shutdown(self.config.shutdown_grace).await
    }

    async fn wait_stopped(&self) -> Result<ShutdownOutcome> {
        let mut status = self.status.subscribe();
        status
            .wait_for(|status| *status == PoolStatus::Stopped)
            .await
            .map_err(|_| PoolError::NotRunning)?;
        self.outcome.get().copied().ok_or(PoolError::NotRunning)
    }
}

impl<P, O> WorkerPool<P, O> {
    /// Take the result stream; only the first call succeeds
    pub fn results(&self) -> Result<ResultStream<O>> {
        self.results.lock().take().ok_or(PoolError::ResultsTaken)
    }

    pub fn status(&self) -> PoolStatus {
        *self.status.borrow()
    }

    /// Watch status transitions
    pub fn subscribe_status(&self) -> watch::Receiver<PoolStatus> {
        self.status.subscribe()
    }

    /// Workers that have not stopped yet, including retiring ones
    pub fn worker_count(&self) -> usize {
        self.registry
            .lock()
            .workers
            .values()
            .filter(|h| h.state() != WorkerState::Stopped)
            .count()
    }

    pub fn worker_states(&self) -> Vec<(WorkerId, WorkerState)> {
        self.registry
            .lock()
            .workers
            .values()
            .map(|h| (h.id, h.state()))
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        let states: Vec<WorkerState> = self
            .registry
            .lock()
            .workers
            .values()
            .map(WorkerHandle::state)
            .collect();

        PoolStats::new(
            self.shared.counters.snapshot(),
            self.shared.queue.len(),
            self.shared.in_flight.len(),
            self.shared.collector.dropped(),
            states,
        )
    }

    /// The token shared by every worker and job context
    ///
    /// Cancelling it stops the pool without a grace period; a later
    /// [`shutdown`](WorkerPool::shutdown) still reports the leftovers.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shared.cancel.clone()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }
}

impl<P, O> Drop for WorkerPool<P, O> {
    fn drop(&mut self) {
        if *self.status.borrow() != PoolStatus::Stopped {
            warn!("Worker pool dropped without completed shutdown; cancelling workers");
            self.shared.queue.close();
            self.shared.cancel.cancel();
        }
    }
}

impl<P, O> fmt::Debug for WorkerPool<P, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("status", &*self.status.borrow())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

type WorkerJoin = JoinHandle<(WorkerId, WorkerExit)>;

/// Steps 1-5 of the shutdown sequence
async fn drain<P, O>(
    shared: Arc<Shared<P, O>>,
    handles: BTreeMap<WorkerId, WorkerHandle>,
    grace: Duration,
) -> ShutdownOutcome
where
    O: Send,
{
    shared.queue.close();

    let mut pending: FuturesUnordered<WorkerJoin> =
        handles.into_values().map(|handle| handle.join).collect();

    let drained = match Instant::now().checked_add(grace) {
        Some(deadline) => tokio::time::timeout_at(deadline, join_workers(&mut pending))
            .await
            .is_ok(),
        None => {
            join_workers(&mut pending).await;
            true
        }
    };

    let outcome = if drained && !shared.cancel.is_cancelled() {
        ShutdownOutcome::Graceful
    } else {
        if !drained {
            warn!(
                workers = pending.len(),
                queued = shared.queue.len(),
                "Grace period elapsed; cancelling in-flight jobs"
            );
        }
        shared.cancel.cancel();
        ShutdownOutcome::Forced
    };

    while tokio::time::timeout(STALL_REPORT_INTERVAL, join_workers(&mut pending))
        .await
        .is_err()
    {
        let outstanding: Vec<String> = shared
            .in_flight
            .iter()
            .map(|entry| format!("{} ({})", entry.key(), entry.value()))
            .collect();
        warn!(
            workers = pending.len(),
            ?outstanding,
            "Shutdown waiting on handlers that ignore cancellation"
        );
    }

    let leftovers = shared.queue.drain_remaining();
    if !leftovers.is_empty() {
        warn!(count = leftovers.len(), "Reporting unprocessed jobs as cancelled");
    }
    for job in leftovers {
        shared.counters.record_cancelled();
        shared
            .collector
            .push(JobResult::cancelled(job.id().clone()))
            .await;
    }

    shared.collector.close();
    outcome
}

async fn join_workers(pending: &mut FuturesUnordered<WorkerJoin>) {
    while let Some(joined) = pending.next().await {
        match joined {
            Ok((id, exit)) => debug!(worker_id = %id, ?exit, "Worker stopped"),
            Err(e) => error!(error = %e, "Worker task failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobContext, JobError};
    use crate::worker::config::RateLimitConfig;

    async fn echo(_ctx: JobContext, job: Job<u32>) -> std::result::Result<u32, JobError> {
        Ok(job.into_payload())
    }

    fn config(workers: usize) -> PoolConfig {
        PoolConfig::default()
            .with_worker_bounds(1, 8)
            .with_initial_workers(workers)
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let bad = PoolConfig::default().with_queue_capacity(0);
        let err = WorkerPool::start(bad, echo).unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));

        let glacial = config(1).with_rate_limit(RateLimitConfig::per_second(1e-20).with_burst(1));
        let err = WorkerPool::start(glacial, echo).unwrap_err();
        assert!(matches!(err, PoolError::Config(_)));
    }

    #[test]
    fn test_start_requires_runtime() {
        let err = WorkerPool::start(config(1), echo).unwrap_err();
        assert_eq!(err, PoolError::NoRuntime);
    }

    #[tokio::test]
    async fn test_start_spawns_initial_workers() {
        let pool = WorkerPool::start(config(3), echo).unwrap();
        assert_eq!(pool.status(), PoolStatus::Running);
        assert_eq!(pool.worker_count(), 3);
        let ids: Vec<u64> = pool.worker_states().iter().map(|(id, _)| id.as_u64()).collect();
        assert_eq!(ids, vec![1, 2, 3]);

        assert_eq!(pool.shutdown(Duration::MAX).await, Ok(ShutdownOutcome::Graceful));
        assert_eq!(pool.status(), PoolStatus::Stopped);
    }

    #[tokio::test]
    async fn test_results_can_only_be_taken_once() {
        let pool = WorkerPool::start(config(1), echo).unwrap();
        assert!(pool.results().is_ok());
        assert_eq!(pool.results().unwrap_err(), PoolError::ResultsTaken);
        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_rejected() {
        let pool = WorkerPool::start(config(1), echo).unwrap();
        pool.shutdown(Duration::MAX).await.unwrap();

        assert_eq!(pool.submit(Job::new("late", 1)).await, Err(PoolError::QueueClosed));
        assert_eq!(pool.scale(1), Err(PoolError::NotRunning));
        assert_eq!(pool.stats().jobs.submitted, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_with_cancel_gives_up_on_full_queue() {
        let blocked = |ctx: JobContext, _job: Job<u32>| async move {
            ctx.cancelled().await;
            Err::<u32, _>(JobError::Cancelled)
        };
        let pool = WorkerPool::start(config(1).with_queue_capacity(1), blocked).unwrap();
        pool.submit(Job::new("a", 1)).await.unwrap();
        pool.submit(Job::new("b", 2)).await.unwrap();

        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let result = pool.submit_with_cancel(Job::new("c", 3), &cancel).await;
        assert_eq!(result, Err(PoolError::Cancelled));
        assert_eq!(pool.stats().jobs.submitted, 2);

        assert_eq!(
            pool.shutdown(Duration::from_millis(10)).await,
            Ok(ShutdownOutcome::Forced)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_submit_waits_for_tokens() {
        let config = config(2).with_rate_limit(RateLimitConfig::per_second(10.0).with_burst(2));
        let pool = WorkerPool::start(config, echo).unwrap();

        let start = Instant::now();
        for n in 0..4 {
            pool.submit(Job::new(format!("job-{n}"), n)).await.unwrap();
        }
        // two from the burst, then two refills of 100ms each
        assert!(start.elapsed() >= Duration::from_millis(199));

        pool.shutdown(Duration::MAX).await.unwrap();
    }

    #[tokio::test]
    async fn test_scale_up_and_down() {
        let pool = WorkerPool::start(
            PoolConfig::default().with_worker_bounds(2, 4).with_initial_workers(2),
            echo,
        )
        .unwrap();

        assert_eq!(pool.scale(1), Ok(3));
        assert_eq!(pool.scale(5), Ok(4));
        assert_eq!(pool.scale(-1), Ok(3));
        assert_eq!(pool.scale(-10), Ok(2));
        assert_eq!(pool.scale(0), Ok(2));

        pool.shutdown(Duration::MAX).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_token_forces_shutdown() {
        let pool = WorkerPool::start(config(2), echo).unwrap();
        pool.cancellation_token().cancel();

        assert_eq!(pool.shutdown(Duration::MAX).await, Ok(ShutdownOutcome::Forced));
    }

    #[tokio::test]
    async fn test_drop_cancels_workers() {
        let pool = WorkerPool::start(config(2), echo).unwrap();
        let token = pool.cancellation_token();
        let mut results = pool.results().unwrap();
        drop(pool);

        assert!(token.is_cancelled());
        assert!(results.recv().await.is_none());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&PoolStatus::Draining).unwrap(), "\"draining\"");
        assert_eq!(ShutdownOutcome::Forced.to_string(), "forced");
    }
}
