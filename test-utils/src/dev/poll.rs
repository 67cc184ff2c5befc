// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for waiting for some condition to become true
//!
//! Background tasks, dispatch workers, and maintenance plans all make progress
//! asynchronously.  Tests use [`wait_for_condition`] to poll for the state they
//! expect rather than sleeping for a fixed amount of time.

use std::future::Future;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Result of one attempt to check a condition (see [`wait_for_condition`])
#[derive(Debug, Error)]
pub enum CondCheckError<E: std::error::Error + Send + Sync + 'static> {
    /// the condition we're waiting for is not true
    #[error("poll condition not yet ready")]
    NotYet,
    #[error("non-retryable error while polling on condition")]
    Failed(#[from] E),
}

/// Result of [`wait_for_condition`]
#[derive(Debug, Error)]
pub enum Error<E: std::error::Error + Send + Sync + 'static> {
    /// operation timed out before succeeding or failing permanently
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("non-retryable error while polling on condition")]
    PermanentError(#[from] E),
}

/// Poll the given closure until it succeeds, returns a permanent error, or
/// a given time has expired
///
/// This is intended in the test suite and developer tools for situations where
/// you've taken some action and want to wait for its effects to be observable.
pub async fn wait_for_condition<O, E, Func, Fut>(
    mut cond: Func,
    poll_interval: &Duration,
    poll_max: &Duration,
) -> Result<O, Error<E>>
where
    Func: FnMut() -> Fut,
    Fut: Future<Output = Result<O, CondCheckError<E>>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let poll_start = Instant::now();
    loop {
        let duration = Instant::now().duration_since(poll_start);
        if duration > *poll_max {
            return Err(Error::TimedOut(duration));
        }

        let check = cond().await;
        if let Ok(output) = check {
            return Ok(output);
        }

        match check {
            Ok(_) => unreachable!(),
            Err(CondCheckError::NotYet) => (),
            Err(CondCheckError::Failed(e)) => {
                return Err(Error::PermanentError(e));
            }
        }

        tokio::time::sleep(*poll_interval).await;
    }
}
