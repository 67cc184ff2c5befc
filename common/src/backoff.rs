// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module providing utilities for retrying operations with exponential backoff.

use std::time::Duration;

pub use ::backoff::backoff::Backoff;
pub use ::backoff::future::retry_notify;
pub use ::backoff::Error as BackoffError;

/// A backoff policy that allows at most a fixed number of attempts
///
/// The wrapped policy supplies the delays; this one stops handing them out
/// once `attempts` tries have been made, regardless of how long each try
/// took.
#[derive(Debug, Clone)]
pub struct AttemptLimited<B> {
    inner: B,
    attempts: u32,
    retries_left: u32,
}

impl<B: Backoff> AttemptLimited<B> {
    pub fn new(inner: B, attempts: u32) -> Self {
        let attempts = attempts.max(1);
        AttemptLimited { inner, attempts, retries_left: attempts - 1 }
    }
}

impl<B: Backoff> Backoff for AttemptLimited<B> {
    fn reset(&mut self) {
        self.inner.reset();
        self.retries_left = self.attempts - 1;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        self.retries_left -= 1;
        self.inner.next_backoff()
    }
}

/// Return a backoff policy for querying a remote agent that gives up after
/// `attempts` tries
///
/// Reconciliation uses this so that an unreachable host costs a bounded
/// number of queries per cycle.  The record is left alone and picked up again
/// by a later cycle.
pub fn agent_query_policy(
    attempts: u32,
) -> AttemptLimited<::backoff::ExponentialBackoff> {
    const INITIAL_INTERVAL: Duration = Duration::from_millis(100);
    const MAX_INTERVAL: Duration = Duration::from_secs(2);

    let policy = ::backoff::ExponentialBackoff {
        current_interval: INITIAL_INTERVAL,
        initial_interval: INITIAL_INTERVAL,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: MAX_INTERVAL,
        // The attempt count is the only limit.
        max_elapsed_time: None,
        ..::backoff::ExponentialBackoff::default()
    };
    AttemptLimited::new(policy, attempts)
}
