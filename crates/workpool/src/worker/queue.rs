//! Bounded job queue
//!
//! The queue is where backpressure is enforced: producers wait for a free
//! slot instead of growing the buffer. State lives behind a mutex that is
//! never held across an `.await`; waiters park on two [`Notify`]s.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::config::QueueOrder;
use crate::error::PoolError;
use crate::job::Job;

/// Heap entry; ordered by rank, then by submission sequence (older first)
struct Entry<P> {
    rank: i32,
    seq: u64,
    job: Job<P>,
}

impl<P> PartialEq for Entry<P> {
    fn eq(&self, other: &Self) -> bool {
        self.rank == other.rank && self.seq == other.seq
    }
}

impl<P> Eq for Entry<P> {}

impl<P> PartialOrd for Entry<P> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<P> Ord for Entry<P> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<P> {
    entries: BinaryHeap<Entry<P>>,
    next_seq: u64,
    closed: bool,
}

/// Bounded, thread-safe job buffer between producers and workers
///
/// After [`close`](JobQueue::close), `submit` always fails while `next`
/// keeps returning buffered jobs until the buffer is empty.
pub struct JobQueue<P> {
    state: Mutex<QueueState<P>>,
    capacity: usize,
    order: QueueOrder,
    not_empty: Notify,
    not_full: Notify,
}

impl<P> JobQueue<P> {
    /// Create an open queue holding at most `capacity` jobs
    pub fn new(capacity: usize, order: QueueOrder) -> Self {
        Self {
            state: Mutex::new(QueueState {
                entries: BinaryHeap::with_capacity(capacity.min(1024)),
                next_seq: 0,
                closed: false,
            }),
            capacity: capacity.max(1),
            order,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Enqueue a job, waiting while the queue is full
    ///
    /// Fails with [`PoolError::QueueClosed`] if the queue is (or becomes)
    /// closed, and with [`PoolError::Cancelled`] if `cancel` fires first.
    pub async fn submit(&self, job: Job<P>, cancel: &CancellationToken) -> Result<(), PoolError> {
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.closed {
                    return Err(PoolError::QueueClosed);
                }
                if cancel.is_cancelled() {
                    return Err(PoolError::Cancelled);
                }
                if state.entries.len() < self.capacity {
                    let rank = match self.order {
                        QueueOrder::Fifo => 0,
                        QueueOrder::Priority => job.priority().unwrap_or(0),
                    };
                    let seq = state.next_seq;
                    state.next_seq += 1;
                    state.entries.push(Entry { rank, seq, job });
                    drop(state);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Dequeue the next job
    ///
    /// Returns `Ok(None)` once the queue is closed and drained, and
    /// [`PoolError::Cancelled`] when `cancel` fires.
    pub async fn next(&self, cancel: &CancellationToken) -> Result<Option<Job<P>>, PoolError> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if cancel.is_cancelled() {
                    return Err(PoolError::Cancelled);
                }
                if let Some(entry) = state.entries.pop() {
                    drop(state);
                    self.not_full.notify_one();
                    return Ok(Some(entry.job));
                }
                if state.closed {
                    return Ok(None);
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(PoolError::Cancelled),
                _ = &mut notified => {}
            }
        }
    }

    /// Stop accepting jobs; returns `false` if the queue was already closed
    ///
    /// Wakes every blocked producer (they fail) and every blocked consumer
    /// (they drain what is left, then observe the close).
    pub fn close(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            state.closed = true;
        }
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
        true
    }

    /// Remove every buffered job, in dequeue order
    pub fn drain_remaining(&self) -> Vec<Job<P>> {
        let mut state = self.state.lock();
        let mut jobs = Vec::with_capacity(state.entries.len());
        while let Some(entry) = state.entries.pop() {
            jobs.push(entry.job);
        }
        drop(state);
        self.not_full.notify_waiters();
        jobs
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn order(&self) -> QueueOrder {
        self.order
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio_test::{assert_pending, assert_ready_eq};

    use super::*;

    fn job(id: &str) -> Job<()> {
        Job::new(id, ())
    }

    async fn next_id(queue: &JobQueue<()>, cancel: &CancellationToken) -> Option<String> {
        queue
            .next(cancel)
            .await
            .unwrap()
            .map(|job| job.id().to_string())
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = JobQueue::new(8, QueueOrder::Fifo);
        let cancel = CancellationToken::new();

        for id in ["a", "b", "c"] {
            queue
                .submit(job(id).with_priority(id.len() as i32 * 10), &cancel)
                .await
                .unwrap();
        }

        assert_eq!(next_id(&queue, &cancel).await.as_deref(), Some("a"));
        assert_eq!(next_id(&queue, &cancel).await.as_deref(), Some("b"));
        assert_eq!(next_id(&queue, &cancel).await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn test_priority_order_is_stable_among_equals() {
        let queue = JobQueue::new(8, QueueOrder::Priority);
        let cancel = CancellationToken::new();

        queue.submit(job("low"), &cancel).await.unwrap();
        queue
            .submit(job("high-1").with_priority(5), &cancel)
            .await
            .unwrap();
        queue
            .submit(job("negative").with_priority(-1), &cancel)
            .await
            .unwrap();
        queue
            .submit(job("high-2").with_priority(5), &cancel)
            .await
            .unwrap();

        let mut order = Vec::new();
        queue.close();
        while let Some(id) = next_id(&queue, &cancel).await {
            order.push(id);
        }
        assert_eq!(order, vec!["high-1", "high-2", "low", "negative"]);
    }

    #[tokio::test]
    async fn test_submit_blocks_when_full() {
        let queue = JobQueue::new(1, QueueOrder::Fifo);
        let cancel = CancellationToken::new();
        queue.submit(job("first"), &cancel).await.unwrap();

        let mut blocked = tokio_test::task::spawn(queue.submit(job("second"), &cancel));
        assert_pending!(blocked.poll());

        assert_eq!(next_id(&queue, &cancel).await.as_deref(), Some("first"));
        assert!(blocked.is_woken());
        assert_ready_eq!(blocked.poll(), Ok(()));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_close_rejects_submit_but_drains_buffered() {
        let queue = JobQueue::new(4, QueueOrder::Fifo);
        let cancel = CancellationToken::new();
        queue.submit(job("a"), &cancel).await.unwrap();
        queue.submit(job("b"), &cancel).await.unwrap();

        assert!(queue.close());
        assert!(!queue.close());
        assert!(queue.is_closed());

        assert_eq!(
            queue.submit(job("c"), &cancel).await,
            Err(PoolError::QueueClosed)
        );
        assert_eq!(next_id(&queue, &cancel).await.as_deref(), Some("a"));
        assert_eq!(next_id(&queue, &cancel).await.as_deref(), Some("b"));
        assert_eq!(next_id(&queue, &cancel).await, None);
        assert_eq!(next_id(&queue, &cancel).await, None);
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_producer() {
        let queue = Arc::new(JobQueue::new(1, QueueOrder::Fifo));
        let cancel = CancellationToken::new();
        queue.submit(job("a"), &cancel).await.unwrap();

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.submit(job("b"), &cancel).await })
        };
        tokio::task::yield_now().await;

        queue.close();
        let result = tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should wake up")
            .unwrap();
        assert_eq!(result, Err(PoolError::QueueClosed));
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_consumers() {
        let queue = Arc::new(JobQueue::<()>::new(4, QueueOrder::Fifo));
        let cancel = CancellationToken::new();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let cancel = cancel.clone();
                tokio::spawn(async move { queue.next(&cancel).await.map(|j| j.is_none()) })
            })
            .collect();
        tokio::task::yield_now().await;

        queue.close();
        for consumer in consumers {
            let closed = tokio::time::timeout(Duration::from_secs(1), consumer)
                .await
                .expect("consumer should wake up")
                .unwrap();
            assert_eq!(closed, Ok(true));
        }
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_all_consumers_quickly() {
        let queue = Arc::new(JobQueue::<()>::new(4, QueueOrder::Fifo));
        let cancel = CancellationToken::new();

        let consumers: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let cancel = cancel.clone();
                tokio::spawn(async move { queue.next(&cancel).await.map(|_| ()) })
            })
            .collect();
        tokio::task::yield_now().await;

        let start = std::time::Instant::now();
        cancel.cancel();
        for consumer in consumers {
            let result = tokio::time::timeout(Duration::from_millis(100), consumer)
                .await
                .expect("consumer should observe cancellation")
                .unwrap();
            assert_eq!(result, Err(PoolError::Cancelled));
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_cancellation_unblocks_producer() {
        let queue = JobQueue::new(1, QueueOrder::Fifo);
        let cancel = CancellationToken::new();
        queue.submit(job("a"), &cancel).await.unwrap();

        let mut blocked = tokio_test::task::spawn(queue.submit(job("b"), &cancel));
        assert_pending!(blocked.poll());

        cancel.cancel();
        assert!(blocked.is_woken());
        assert_ready_eq!(blocked.poll(), Err(PoolError::Cancelled));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_drain_remaining() {
        let queue = JobQueue::new(4, QueueOrder::Fifo);
        let cancel = CancellationToken::new();
        queue.submit(job("a"), &cancel).await.unwrap();
        queue.submit(job("b"), &cancel).await.unwrap();

        let drained: Vec<String> = queue
            .drain_remaining()
            .into_iter()
            .map(|j| j.id().to_string())
            .collect();

        assert_eq!(drained, vec!["a", "b"]);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 4);
    }

    #[tokio::test]
    async fn test_no_duplication_under_concurrency() {
        let queue = Arc::new(JobQueue::new(4, QueueOrder::Fifo));
        let cancel = CancellationToken::new();

        let producer = {
            let queue = Arc::clone(&queue);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    queue.submit(job(&format!("job-{i}")), &cancel).await.unwrap();
                }
                queue.close();
            })
        };

        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while let Some(job) = queue.next(&cancel).await.unwrap() {
                        seen.push(job.id().to_string());
                        tokio::task::yield_now().await;
                    }
                    seen
                })
            })
            .collect();

        producer.await.unwrap();
        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 200);
    }
}
