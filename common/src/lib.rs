// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! # Keel control plane
//!
//! This crate implements facilities shared by every piece of the keel
//! control plane: the common error type, identifier types, retry policies,
//! and the on-disk ledger used for durable state.  Other top-level crates
//! implement the pieces of the control plane (e.g., `keel_ledger` for the
//! command ledger and `keel_reconciler` for command reconciliation).

// We only use rustdoc for internal documentation, including private items, so
// it's expected that we'll have links to private items in the docs.
#![allow(rustdoc::private_intra_doc_links)]

pub mod api;
pub mod backoff;
pub mod ledger;
pub mod typed_uuid;

use futures::Future;
use slog::warn;

/// Retry an operation against a remote agent until a known result comes back
///
/// `classify` decides whether an error is transient.  Transient errors are
/// retried according to `policy`; anything else is returned immediately.  Once
/// the policy gives up, the last transient error is returned.
///
/// Retrying is only valid if the operation itself is idempotent (e.g., a
/// status query).
pub async fn retry_until_known_result<F, T, E, Fut, C, B>(
    log: &slog::Logger,
    policy: B,
    classify: C,
    mut f: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: std::fmt::Display,
    B: backoff::Backoff,
{
    backoff::retry_notify(
        policy,
        || {
            let fut = f();
            let classify = &classify;
            async move {
                match fut.await {
                    Ok(v) => Ok(v),
                    Err(e) if classify(&e) => {
                        Err(backoff::BackoffError::transient(e))
                    }
                    Err(e) => {
                        warn!(
                            log,
                            "saw permanent error, aborting";
                            "error" => %e,
                        );
                        Err(backoff::BackoffError::Permanent(e))
                    }
                }
            }
        },
        |error: E, delay| {
            warn!(
                log,
                "failed remote call, will retry";
                "error" => %error,
                "delay" => ?delay,
            );
        },
    )
    .await
}
