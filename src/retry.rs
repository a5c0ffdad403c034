//! Retry policies for collaborator calls.
//!
//! Dispatchers retry cursor flushes during teardown, where giving up
//! early loses the mark-delete position. Everything else fails fast.
//!
//! | Policy | Min Delay | Max Delay | Retries | Use Case |
//! |--------|-----------|-----------|---------|----------|
//! | `cursor_policy` | 10ms | 500ms | 3 | Cursor flush on close |

use std::future::Future;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};

use crate::error::Error;
use crate::metrics::RETRY_ATTEMPTS;

/// Policy for managed-cursor operations.
pub fn cursor_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(10))
        .with_max_delay(Duration::from_millis(500))
        .with_max_times(3)
        .with_jitter()
}

/// Run a cursor operation under [`cursor_policy`], retrying cursor errors only.
pub async fn with_cursor_policy<F, Fut, T>(operation: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    let result = operation
        .retry(cursor_policy())
        .when(|e: &Error| matches!(e, Error::Cursor(_)))
        .notify(|e: &Error, delay: Duration| {
            record_retry_attempt("cursor");
            tracing::debug!(error = %e, ?delay, "Retrying cursor operation");
        })
        .await;

    match &result {
        Ok(_) => record_retry_outcome("cursor", "success"),
        Err(e) => {
            record_retry_outcome("cursor", "exhausted");
            tracing::warn!(error = %e, "Cursor retry policy exhausted");
        }
    }
    result
}

fn record_retry_attempt(policy_name: &str) {
    RETRY_ATTEMPTS
        .with_label_values(&[policy_name, "attempt"])
        .inc();
}

fn record_retry_outcome(policy_name: &str, outcome: &str) {
    RETRY_ATTEMPTS
        .with_label_values(&[policy_name, outcome])
        .inc();
}
