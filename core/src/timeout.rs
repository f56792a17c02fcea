//! Timeout guard
//!
//! `with_timeout` races a future against a deadline. The timer lives inside
//! the returned future and is dropped on whichever path settles first.
//!
//! Dropping the raced future is the only way Rust cancels async work, so
//! whether the underlying call keeps running depends on what is passed in:
//! a plain future is dropped on timeout, a `JoinHandle` of a spawned task is
//! merely abandoned and the task runs to completion unobserved. The
//! dispatcher picks between the two with [`TimeoutBehavior`].

use crate::errors::DispatchError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// What happens to an operation whose attempt timed out
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutBehavior {
    /// Run each attempt as a spawned task; on timeout stop waiting but let it finish
    #[default]
    Detach,
    /// Poll each attempt in place; on timeout drop it
    Cancel,
}

/// Resolve with `future`'s output, or `OperationTimeout(label, limit)` if it is late
pub async fn with_timeout<F>(
    future: F,
    limit: Duration,
    label: &str,
) -> Result<F::Output, DispatchError>
where
    F: Future,
{
    tokio::time::timeout(limit, future)
        .await
        .map_err(|_| DispatchError::OperationTimeout {
            name: label.to_string(),
            timeout_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
        })
}
