//! Retry logic.
//!
//! # Responsibilities
//! - Decide retry eligibility from the explicit failure kind
//! - Execute attempts with exponential backoff + jitter
//!
//! # Design Decisions
//! - Non-retryable kinds (authorization, not-found by default) fail on first attempt
//! - Every attempt runs under its own timeout
//! - The caller sees one outcome; attempts are an internal detail

use std::future::Future;
use std::time::Duration;

use crate::config::CircuitBreakerConfig;
use crate::error::{CallFailure, FailureKind};
use crate::resilience::backoff::BackoffPolicy;
use crate::resilience::timeouts::with_timeout;

/// Attempt budget and retry eligibility.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    pub non_retryable: Vec<FailureKind>,
}

impl RetryPolicy {
    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: BackoffPolicy::from_config(config),
            non_retryable: config.non_retryable.clone(),
        }
    }

    pub fn is_retryable(&self, kind: FailureKind) -> bool {
        !self.non_retryable.contains(&kind)
    }
}

/// Final result of a retried operation and the attempts it took.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, CallFailure>,
    pub attempts: u32,
}

/// Run `operation` until it succeeds, fails with a non-retryable kind, or the
/// attempt budget is spent.
pub async fn retry_with_backoff<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CallFailure>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match with_timeout(attempt_timeout, operation()).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(failure) => {
                if attempt >= policy.max_attempts || !policy.is_retryable(failure.kind) {
                    return RetryOutcome {
                        result: Err(failure),
                        attempts: attempt,
                    };
                }
                let delay = policy.backoff.delay(attempt - 1);
                tracing::debug!(
                    target_name = %label,
                    attempt,
                    kind = %failure.kind,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}
