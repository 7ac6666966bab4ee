//! Fan-in of job results
//!
//! A bounded channel: when the consumer falls behind, workers block in
//! [`ResultCollector::push`], which in turn stalls the queue and the rate
//! limiter upstream.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};

use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::job::JobResult;

/// Producer side of the result channel, shared by all workers
pub struct ResultCollector<O> {
    tx: Mutex<Option<mpsc::Sender<JobResult<O>>>>,
    pushed: AtomicU64,
    dropped: AtomicU64,
}

impl<O> ResultCollector<O> {
    /// Create a collector buffering at most `buffer` results, plus its stream
    pub fn new(buffer: usize) -> (Self, ResultStream<O>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let collector = Self {
            tx: Mutex::new(Some(tx)),
            pushed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (collector, ResultStream::new(rx))
    }

    /// Close the collector so the stream ends after the buffered results
    ///
    /// Must only be called once every worker has stopped; a push after close
    /// is a programming error and is logged.
    pub fn close(&self) {
        if self.tx.lock().take().is_some() {
            debug!(
                pushed = self.pushed.load(Ordering::Relaxed),
                dropped = self.dropped.load(Ordering::Relaxed),
                "Result collector closed"
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }

    /// Number of results delivered to the channel
    pub fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Relaxed)
    }

    /// Number of results discarded because the stream was gone
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl<O: Send> ResultCollector<O> {
    /// Deliver a result, waiting while the buffer is full
    ///
    /// Waits for as long as the [`ResultStream`] is alive, cancellation
    /// included. A result is only discarded once the stream has been dropped.
    pub async fn push(&self, result: JobResult<O>) {
        let tx = self.tx.lock().clone();
        let Some(tx) = tx else {
            error!(job_id = %result.job_id, "Result pushed after collector was closed; discarding");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        match tx.reserve().await {
            Ok(permit) => {
                permit.send(result);
                self.pushed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                debug!(job_id = %result.job_id, "Result stream dropped; discarding result");
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        };
    }
}

/// Consumer side: a finite stream of [`JobResult`]s
///
/// Ends once the pool has stopped and every buffered result has been
/// consumed. It cannot be restarted.
#[derive(Debug)]
pub struct ResultStream<O> {
    inner: ReceiverStream<JobResult<O>>,
}

impl<O> ResultStream<O> {
    fn new(rx: mpsc::Receiver<JobResult<O>>) -> Self {
        Self {
            inner: ReceiverStream::new(rx),
        }
    }

    /// Receive the next result; `None` once the stream is exhausted
    pub async fn recv(&mut self) -> Option<JobResult<O>> {
        self.inner.next().await
    }

    /// Consume the rest of the stream
    pub async fn collect_all(mut self) -> Vec<JobResult<O>> {
        let mut results = Vec::new();
        while let Some(result) = self.recv().await {
            results.push(result);
        }
        results
    }
}

impl<O> Stream for ResultStream<O> {
    type Item = JobResult<O>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
