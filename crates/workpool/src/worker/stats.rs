//! Pool counters

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use super::runner::WorkerState;

/// Monotonic job counters updated by the pool and its workers
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_success(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> JobCounts {
        JobCounts {
            submitted: self.submitted.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Job totals since the pool started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    /// Jobs accepted into the queue
    pub submitted: u64,
    pub succeeded: u64,
    /// Failed, timed out or panicked
    pub failed: u64,
    /// Cancelled by the handler or left in the queue at forced shutdown
    pub cancelled: u64,
}

impl JobCounts {
    pub fn completed(&self) -> u64 {
        self.succeeded + self.failed + self.cancelled
    }
}

/// Point-in-time view of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStats {
    pub jobs: JobCounts,
    /// Jobs waiting in the queue
    pub queued: usize,
    /// Jobs currently held by a worker
    pub in_flight: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
    /// Workers leaving their loop (retired or draining)
    pub draining_workers: usize,
    /// Results discarded because the result stream had been dropped
    pub dropped_results: u64,
}

impl PoolStats {
    pub(crate) fn new(
        jobs: JobCounts,
        queued: usize,
        in_flight: usize,
        dropped_results: u64,
        states: impl IntoIterator<Item = WorkerState>,
    ) -> Self {
        let mut stats = Self {
            jobs,
            queued,
            in_flight,
            idle_workers: 0,
            busy_workers: 0,
            draining_workers: 0,
            dropped_results,
        };
        for state in states {
            match state {
                WorkerState::Idle => stats.idle_workers += 1,
                WorkerState::Busy => stats.busy_workers += 1,
                WorkerState::Draining => stats.draining_workers += 1,
                WorkerState::Stopped => {}
            }
        }
        stats
    }

    pub fn live_workers(&self) -> usize {
        self.idle_workers + self.busy_workers + self.draining_workers
    }
}
