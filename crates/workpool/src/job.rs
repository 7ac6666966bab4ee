//! Jobs, job results and the job-handler contract

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::worker::WorkerId;

/// Unique identifier of a job
///
/// Any caller-chosen string is accepted; [`JobId::generate`] produces a
/// time-ordered UUID v7.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Create a job ID from a caller-supplied string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh, time-ordered job ID
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for JobId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// An opaque unit of work
///
/// Fields are private: a job cannot change once it has been built. It is
/// moved into the queue on submit and moved into the handler by exactly one
/// worker.
#[derive(Debug, Clone)]
pub struct Job<P> {
    id: JobId,
    payload: P,
    priority: Option<i32>,
    submitted_at: DateTime<Utc>,
}

impl<P> Job<P> {
    /// Create a job with an explicit ID
    pub fn new(id: impl Into<JobId>, payload: P) -> Self {
        Self {
            id: id.into(),
            payload,
            priority: None,
            submitted_at: Utc::now(),
        }
    }

    /// Create a job with a generated ID
    pub fn from_payload(payload: P) -> Self {
        Self::new(JobId::generate(), payload)
    }

    /// Set the priority hint
    ///
    /// Only honoured by queues configured with
    /// [`QueueOrder::Priority`](crate::QueueOrder::Priority); higher runs first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn priority(&self) -> Option<i32> {
        self.priority
    }

    /// When the job was created by the producer
    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// Consume the job, returning its payload
    pub fn into_payload(self) -> P {
        self.payload
    }
}

/// Why a job did not produce an output
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The handler returned an error
    #[error("processing error: {0}")]
    Processing(String),

    /// The job was cancelled before or while it ran
    #[error("job cancelled")]
    Cancelled,

    /// The handler exceeded the configured per-job timeout
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),

    /// The handler panicked
    #[error("job handler panicked: {0}")]
    Panicked(String),
}

impl JobError {
    /// Create a processing error
    pub fn processing(msg: impl fmt::Display) -> Self {
        JobError::Processing(msg.to_string())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobError::Cancelled)
    }

    pub fn is_processing(&self) -> bool {
        matches!(self, JobError::Processing(_))
    }
}

impl From<anyhow::Error> for JobError {
    fn from(err: anyhow::Error) -> Self {
        JobError::Processing(format!("{err:#}"))
    }
}

/// Outcome of one job
///
/// Results arrive in completion order, not submission order; callers that
/// need ordering re-sort by [`JobResult::job_id`].
#[derive(Debug, Clone)]
pub struct JobResult<O> {
    /// Job this result belongs to
    pub job_id: JobId,

    /// Worker that ran the job (`None` if the job never reached a worker)
    pub worker_id: Option<WorkerId>,

    /// Handler output or failure
    pub outcome: Result<O, JobError>,

    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl<O> JobResult<O> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn output(&self) -> Option<&O> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&JobError> {
        self.outcome.as_ref().err()
    }

    /// Wall-clock time between start and finish
    pub fn duration(&self) -> Duration {
        self.finished_at
            .signed_duration_since(self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub(crate) fn cancelled(job_id: JobId) -> Self {
        let now = Utc::now();
        Self {
            job_id,
            worker_id: None,
            outcome: Err(JobError::Cancelled),
            started_at: now,
            finished_at: now,
        }
    }
}

/// Context provided to handlers while a job runs
///
/// Handlers must check the context for cancellation so that shutdown can
/// complete in time:
///
/// ```ignore
/// tokio::select! {
///     output = do_work(job.payload()) => Ok(output),
///     _ = ctx.cancelled() => Err(JobError::Cancelled),
/// }
/// ```
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    worker_id: WorkerId,
    cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job_id: JobId, worker_id: WorkerId, cancel: CancellationToken) -> Self {
        Self {
            job_id,
            worker_id,
            cancel,
        }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Check if cancellation was requested
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when cancellation is requested
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Processes one job
///
/// Implemented for every `Fn(JobContext, Job<P>) -> impl Future<Output = Result<O, JobError>>`,
/// so closures can be passed straight to
/// [`WorkerPool::start`](crate::WorkerPool::start).
#[async_trait]
pub trait JobHandler<P, O>: Send + Sync + 'static {
    async fn handle(&self, ctx: JobContext, job: Job<P>) -> Result<O, JobError>;
}

#[async_trait]
impl<P, O, F, Fut> JobHandler<P, O> for F
where
    P: Send + 'static,
    O: Send + 'static,
    F: Fn(JobContext, Job<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, JobError>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext, job: Job<P>) -> Result<O, JobError> {
        (self)(ctx, job).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
        assert!(Uuid::parse_str(a.as_str()).is_ok());
    }

    #[test]
    fn test_job_builder() {
        let job = Job::new("bad-1", 42u32).with_priority(7);
        assert_eq!(job.id().as_str(), "bad-1");
        assert_eq!(*job.payload(), 42);
        assert_eq!(job.priority(), Some(7));
        assert_eq!(job.into_payload(), 42);
    }

    #[test]
    fn test_anyhow_conversion() {
        let err: JobError = anyhow::anyhow!("disk full").context("writing chunk").into();
        assert_eq!(err, JobError::Processing("writing chunk: disk full".to_string()));
        assert!(err.is_processing());
    }

    #[test]
    fn test_result_helpers() {
        let result: JobResult<u32> = JobResult::cancelled(JobId::new("j-1"));
        assert!(!result.is_success());
        assert!(result.output().is_none());
        assert!(result.error().is_some_and(JobError::is_cancelled));
        assert_eq!(result.duration(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = |_ctx: JobContext, job: Job<u32>| async move {
            if *job.payload() == 0 {
                Err(JobError::processing("zero"))
            } else {
                Ok(job.into_payload() * 2)
            }
        };

        let ctx = JobContext::new(JobId::new("j"), WorkerId::new(1), CancellationToken::new());
        let ok = JobHandler::<u32, u32>::handle(&handler, ctx.clone(), Job::new("a", 21)).await;
        assert_eq!(ok, Ok(42));

        let err = JobHandler::<u32, u32>::handle(&handler, ctx, Job::new("b", 0)).await;
        assert_eq!(err, Err(JobError::Processing("zero".into())));
    }

    #[test]
    fn test_context_cancellation() {
        let token = CancellationToken::new();
        let ctx = JobContext::new(JobId::new("j"), WorkerId::new(3), token.clone());
        assert!(!ctx.is_cancelled());
        token.cancel();
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.worker_id(), WorkerId::new(3));
    }
}
