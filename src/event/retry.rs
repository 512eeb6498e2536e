//! Chunk-send retry policy.
//!
//! When configured, a failed chunk write is retried with exponential
//! backoff; the whole chunk is the unit of retry. The `on_error` hook
//! observes every failed attempt.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::core::error::WriteError;
use crate::transport::backoff::BackoffConfig;

/// Hook invoked after each failed attempt with the error and the 1-based
/// attempt number.
pub type ErrorHook = Arc<dyn Fn(&WriteError, u32) + Send + Sync>;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the given delay.
    RetryAfter(Duration),
    /// Stop retrying and surface the error.
    GiveUp,
}

/// Retry configuration for chunk sends.
#[derive(Clone)]
pub struct RetryOptions {
    /// Backoff parameters; `max_attempts` bounds the retries.
    pub backoff: BackoffConfig,
    /// Optional per-failure observer.
    pub on_error: Option<ErrorHook>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig {
                initial: Duration::from_millis(100),
                max_attempts: Some(3),
                ..BackoffConfig::default()
            },
            on_error: None,
        }
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("backoff", &self.backoff)
            .field("on_error", &self.on_error.as_ref().map(|_| "Fn"))
            .finish()
    }
}

impl RetryOptions {
    /// Decide the follow-up to failed attempt number `attempt` (1-based).
    pub fn decide(&self, attempt: u32) -> RetryDecision {
        match self.backoff.delay(attempt) {
            Some(delay) => RetryDecision::RetryAfter(delay),
            None => RetryDecision::GiveUp,
        }
    }
}

/// Run `op` until it succeeds or the policy gives up.
///
/// Returns the last error on give-up. The hook fires once per failed
/// attempt, before the backoff sleep.
pub async fn run_with_retry<F, Fut>(options: &RetryOptions, mut op: F) -> Result<(), WriteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), WriteError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempt += 1;
                if let Some(hook) = &options.on_error {
                    hook(&err, attempt);
                }
                match options.decide(attempt) {
                    RetryDecision::RetryAfter(delay) => tokio::time::sleep(delay).await,
                    RetryDecision::GiveUp => return Err(err),
                }
            }
        }
    }
}
