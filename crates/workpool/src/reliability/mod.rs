//! Reliability patterns layered on top of job handlers
//!
//! This module provides:
//! - [`RetryPolicy`] - Configurable retry with exponential backoff
//! - [`Retrying`] - Handler decorator applying a [`RetryPolicy`]

mod retry;

pub use retry::{with_retry, RetryPolicy, Retrying};
