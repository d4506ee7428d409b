//! Retry logic with exponential backoff
//!
//! Transient failures (chunk sends that time out, dropped source reads, throttled store calls)
//! are retried with capped exponential backoff and optional jitter. Which failures count as
//! transient is decided per error type through [`IsRetryable`].
//!
//! # Example
//!
//! ```no_run
//! use chat_relay::retry::with_retry;
//! use chat_relay::config::RetryConfig;
//! use chat_relay::{ContentProxy, FetchError, MediaInfo, MessageRef};
//!
//! # async fn example(proxy: &dyn ContentProxy, message: MessageRef) -> Result<(), FetchError> {
//! let config = RetryConfig::default();
//! // Dropped reads are retried, a deleted message is not
//! let info: MediaInfo = with_retry(&config, || proxy.describe(&message)).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, FetchError, StoreError};
use rand::Rng;
use std::future::Future;
use std::io::ErrorKind;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (timeouts, dropped connections, throttling) should return `true`.
/// Permanent failures (permission denied, quota exceeded, expired authorization) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        match self {
            FetchError::Read(_) | FetchError::Timeout => true,
            // Throttling and server-side hiccups
            FetchError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            FetchError::PermissionDenied(_)
            | FetchError::MessageNotFound(_)
            | FetchError::NoMedia(_)
            | FetchError::ChannelEnd
            | FetchError::EmptySource => false,
        }
    }
}

impl IsRetryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::ChunkSend(_) | StoreError::Timeout => true,
            // A lost session needs a fresh one, not a resend
            StoreError::SessionLost => false,
            StoreError::Rejected(_) | StoreError::Protocol(_) => false,
        }
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Fetch(e) => e.is_retryable(),
            Error::Store(e) => e.is_retryable(),
            Error::Network(e) => e.is_timeout() || e.is_connect(),
            Error::Io(e) => matches!(
                e.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}

/// Delay schedule for one retried operation
///
/// Yields `max_attempts` delays, starting at `initial_delay` and growing by
/// `backoff_multiplier` up to `max_delay`. Jitter, when enabled, stretches each delay by up
/// to 100%.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    retries: u32,
    base: Duration,
}

impl Backoff {
    /// Fresh schedule for `config`
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            config: config.clone(),
            retries: 0,
            base: config.initial_delay,
        }
    }

    /// Retries handed out so far
    pub fn retries(&self) -> u32 {
        self.retries
    }

    /// Delay before the next retry, or `None` once every retry is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries >= self.config.max_attempts {
            return None;
        }
        self.retries += 1;
        let delay = if self.config.jitter {
            add_jitter(self.base)
        } else {
            self.base
        };
        self.base = self
            .base
            .mul_f64(self.config.backoff_multiplier.max(1.0))
            .min(self.config.max_delay);
        Some(delay)
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// Returns the successful result or the last error after all retry attempts are exhausted.
/// `config.max_attempts` counts retries, so the operation runs at most `max_attempts + 1` times.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    with_retry_observed(config, |_, _| {}, operation).await
}

/// Like [`with_retry`], calling `on_retry(attempt, &error)` before each backoff sleep
///
/// `attempt` starts at 1 for the first retry.
pub async fn with_retry_observed<F, Fut, T, E, O>(
    config: &RetryConfig,
    mut on_retry: O,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
    O: FnMut(u32, &E),
{
    let mut backoff = Backoff::new(config);

    loop {
        let error = match operation().await {
            Ok(result) => {
                if backoff.retries() > 0 {
                    tracing::debug!(retries = backoff.retries(), "operation recovered");
                }
                return Ok(result);
            }
            Err(e) => e,
        };

        if !error.is_retryable() {
            tracing::debug!(error = %error, "non-retryable failure");
            return Err(error);
        }
        let Some(delay) = backoff.next_delay() else {
            tracing::warn!(
                error = %error,
                retries = backoff.retries(),
                "giving up after exhausting retries"
            );
            return Err(error);
        };

        on_retry(backoff.retries(), &error);
        tracing::warn!(
            error = %error,
            attempt = backoff.retries(),
            max_attempts = config.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "transient failure, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Stretch `delay` by a uniform factor in `[1, 2]`
fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(1.0..=2.0);
    delay.mul_f64(factor)
}
