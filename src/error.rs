//! Error taxonomy of the core.
//!
//! Three kinds matter at the boundaries:
//!
//! - [`CommandError`] — a command was malformed, unauthorized or arrived in
//!   the wrong state. Surfaced to the offending connection only; never
//!   affects match state.
//! - [`StateStoreError`] — infrastructure trouble talking to the shared
//!   state store. Transient failures are retried with
//!   [`retry_with_backoff`]; a CAS conflict means this instance lost
//!   ownership of the key.
//! - Fatal conditions (invariant violations, exhausted retry budgets) are
//!   plain `anyhow` errors inside actors and escalate the match to
//!   `cancelled`.
//!
//! Round and grading deadlines are not errors; they are ordinary
//! transitions.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::clock::Clock;

/// Machine-readable code carried by `error` events on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Payload failed validation (length, encoding, unknown fields).
    BadRequest,
    /// Submission rejected (closed round, bad language, oversized code).
    InvalidSubmission,
    /// The target match has no free player slot.
    Full,
    /// No such match or lobby.
    NotFound,
    /// Private lobby and the caller is not on the invite list.
    PrivateDenied,
    /// Command is not valid in the match's current state.
    WrongState,
    /// Caller is not a participant of the target match.
    Unauthorized,
    /// Chat or typing rate limit exceeded.
    RateLimited,
    /// The process is at its match capacity.
    Busy,
    /// Unexpected internal failure.
    Internal,
}

/// A rejected command, confined to the connection that sent it.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{code:?}: {message}")]
pub struct CommandError {
    /// Wire error code.
    pub code: ErrorCode,
    /// Human-readable reason.
    pub message: String,
}

impl CommandError {
    /// Builds an error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub(crate) fn wrong_state(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::WrongState, message)
    }

    pub(crate) fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotFound, message)
    }

    pub(crate) fn invalid_submission(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidSubmission, message)
    }
}

/// Failures of the shared state store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StateStoreError {
    /// A compare-and-set found a different version than expected.
    #[error("version conflict on {key}: expected {expected}, found {found}")]
    Conflict {
        /// Key the write targeted.
        key: String,
        /// Version the writer expected.
        expected: u64,
        /// Version actually stored.
        found: u64,
    },
    /// The store could not be reached or answered with a transient error.
    #[error("state store unavailable: {0}")]
    Unavailable(String),
}

impl StateStoreError {
    /// Whether retrying the same call can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StateStoreError::Unavailable(_))
    }
}

/// Bounded retry schedule: capped exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay before the second attempt.
    pub base: Duration,
    /// Upper bound on any single delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base: Duration::from_millis(100),
            cap: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after attempt `n` (0-based) failed.
    pub fn delay_after(&self, n: u32) -> Duration {
        let factor = 1u32 << n.min(16);
        self.cap.min(self.base.saturating_mul(factor))
    }
}

/// Runs `op` until it succeeds, fails non-transiently, or the attempt
/// budget is exhausted.
pub async fn retry_with_backoff<T, F, Fut>(
    clock: &Clock,
    policy: &RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, StateStoreError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, StateStoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt + 1 < policy.attempts => {
                let delay = policy.delay_after(attempt);
                warn!(what, attempt, ?delay, error = %e, "transient store failure, retrying");
                clock.sleep_until(clock.now() + delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after(0), Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(200));
        assert_eq!(policy.delay_after(10), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_then_succeeds() {
        let clock = Clock::new();
        let calls = AtomicU32::new(0);
        let out = retry_with_backoff(&clock, &RetryPolicy::default(), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StateStoreError::Unavailable("down".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(out.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_is_not_retried() {
        let clock = Clock::new();
        let calls = AtomicU32::new(0);
        let out: Result<(), _> =
            retry_with_backoff(&clock, &RetryPolicy::default(), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StateStoreError::Conflict {
                    key: "match:x".into(),
                    expected: 1,
                    found: 2,
                })
            })
            .await;
        assert!(matches!(out, Err(StateStoreError::Conflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
