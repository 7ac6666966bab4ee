//! Worker execution loop
//!
//! Each worker is one tokio task: it pulls a job, runs the handler, pushes
//! the result and goes back for more until it is retired, the queue is
//! closed and drained, or the pool is cancelled.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn, Instrument};

use super::collector::ResultCollector;
use super::queue::JobQueue;
use super::stats::PoolCounters;
use crate::error::PoolError;
use crate::job::{Job, JobContext, JobError, JobHandler, JobId, JobResult};

/// Identifier of a worker within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Worker lifecycle
///
/// ```text
/// Idle ⇄ Busy → Draining → Stopped
/// ```
///
/// Only the worker's own loop publishes transitions; the pool observes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Waiting for a job
    Idle,
    /// Running a job
    Busy,
    /// Leaving the loop; takes no new jobs
    Draining,
    /// Exited
    Stopped,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Busy => write!(f, "busy"),
            Self::Draining => write!(f, "draining"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why a worker left its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Retired by a scale-down
    Retired,
    /// The queue was closed and empty
    QueueDrained,
    /// The pool's cancellation token fired
    Cancelled,
}

/// State shared by the pool and every worker
pub(crate) struct Shared<P, O> {
    pub(crate) queue: JobQueue<P>,
    pub(crate) collector: ResultCollector<O>,
    pub(crate) handler: Arc<dyn JobHandler<P, O>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) in_flight: DashMap<JobId, WorkerId>,
    pub(crate) counters: PoolCounters,
    pub(crate) job_timeout: Option<Duration>,
}

/// The pool's view of one worker
pub(crate) struct WorkerHandle {
    pub(crate) id: WorkerId,
    stop: CancellationToken,
    state: watch::Receiver<WorkerState>,
    pub(crate) join: JoinHandle<(WorkerId, WorkerExit)>,
}

impl WorkerHandle {
    pub(crate) fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    /// Ask the worker to stop after its current job
    pub(crate) fn retire(&self) {
        self.stop.cancel();
    }

    pub(crate) fn is_retiring(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

pub(crate) struct Worker<P, O> {
    id: WorkerId,
    shared: Arc<Shared<P, O>>,
    stop: CancellationToken,
    state: watch::Sender<WorkerState>,
}

impl<P, O> Worker<P, O>
where
    P: Send + 'static,
    O: Send + 'static,
{
    /// Spawn a worker on `runtime`
    pub(crate) fn spawn(id: WorkerId, shared: Arc<Shared<P, O>>, runtime: &Handle) -> WorkerHandle {
        let stop = CancellationToken::new();
        let (state_tx, state_rx) = watch::channel(WorkerState::Idle);
        let worker = Worker {
            id,
            shared,
            stop: stop.clone(),
            state: state_tx,
        };

        let span = tracing::debug_span!("worker", worker_id = %id);
        let join = runtime.spawn(worker.run().instrument(span));

        WorkerHandle {
            id,
            stop,
            state: state_rx,
            join,
        }
    }

    async fn run(self) -> (WorkerId, WorkerExit) {
        debug!("Worker started");

        let exit = loop {
            if self.stop.is_cancelled() {
                break WorkerExit::Retired;
            }
            if self.shared.cancel.is_cancelled() {
                break WorkerExit::Cancelled;
            }
            self.set_state(WorkerState::Idle);

            let next = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break WorkerExit::Retired,
                next = self.shared.queue.next(&self.shared.cancel) => next,
            };

            match next {
                Ok(Some(job)) => self.process(job).await,
                Ok(None) => break WorkerExit::QueueDrained,
                Err(PoolError::Cancelled) => break WorkerExit::Cancelled,
                Err(e) => {
                    warn!(error = %e, "Unexpected queue error, stopping worker");
                    break WorkerExit::Cancelled;
                }
            }
        };

        self.set_state(WorkerState::Draining);
        debug!(?exit, "Worker draining");
        self.set_state(WorkerState::Stopped);
        (self.id, exit)
    }

    async fn process(&self, job: Job<P>) {
        let job_id = job.id().clone();
        self.set_state(WorkerState::Busy);
        self.shared.in_flight.insert(job_id.clone(), self.id);

        let started_at = Utc::now();
        let ctx = JobContext::new(job_id.clone(), self.id, self.shared.cancel.clone());
        let run = self.execute(ctx, job);
        tokio::pin!(run);

        // A stop request mid-job lets the job finish but is visible right away
        let outcome = tokio::select! {
            biased;
            outcome = &mut run => outcome,
            _ = self.stopping() => {
                self.set_state(WorkerState::Draining);
                debug!(%job_id, "Worker draining; finishing in-flight job");
                run.await
            }
        };
        let finished_at = Utc::now();

        match &outcome {
            Ok(_) => {
                self.shared.counters.record_success();
                debug!(%job_id, "Job completed");
            }
            Err(JobError::Cancelled) => {
                self.shared.counters.record_cancelled();
                debug!(%job_id, "Job cancelled");
            }
            Err(error) => {
                self.shared.counters.record_failure();
                debug!(%job_id, %error, "Job failed");
            }
        }

        let result = JobResult {
            job_id: job_id.clone(),
            worker_id: Some(self.id),
            outcome,
            started_at,
            finished_at,
        };
        self.shared.collector.push(result).await;
        self.shared.in_flight.remove(&job_id);
    }

    /// Run the handler, turning panics and timeouts into job errors
    async fn execute(&self, ctx: JobContext, job: Job<P>) -> Result<O, JobError> {
        let handler = Arc::clone(&self.shared.handler);
        let run = AssertUnwindSafe(async move { handler.handle(ctx, job).await }).catch_unwind();

        let caught = match self.shared.job_timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(caught) => caught,
                Err(_) => {
                    warn!(timeout_ms = limit.as_millis() as u64, "Job exceeded its timeout");
                    return Err(JobError::TimedOut(limit));
                }
            },
            None => run.await,
        };

        caught.unwrap_or_else(|panic| {
            let message = panic_message(panic.as_ref());
            warn!(%message, "Job handler panicked");
            Err(JobError::Panicked(message))
        })
    }

    /// Resolves once the worker is retired or the pool is cancelled
    async fn stopping(&self) {
        tokio::select! {
            _ = self.stop.cancelled() => {}
            _ = self.shared.cancel.cancelled() => {}
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
