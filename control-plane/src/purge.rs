// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Purging expunged resources
//!
//! Expunged virtual machines and tombstoned command records are kept around
//! for a while after they're removed.  They are purged either on request
//! ([`ControlPlane::purge_expunged_resources`]) or by a periodic background
//! task that removes everything older than a configured age.

use crate::AdminResponse;
use crate::ControlPlane;
use crate::InMemoryInventory;
use chrono::DateTime;
use chrono::TimeDelta;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use keel_common::api::external::Error;
use keel_common::api::external::ResourceType;
use keel_config::PurgeConfig;
use keel_ledger::CommandLedger;
use keel_reconciler::BackgroundTask;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use serde_json::json;
use slog::info;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

/// Kinds of resources that can be purged
const PURGEABLE: &[ResourceType] =
    &[ResourceType::VirtualMachine, ResourceType::Command];

/// Parameters of a purge request
#[derive(Clone, Debug, Default, Deserialize, JsonSchema)]
pub struct PurgeParams {
    /// purge only this kind of resource (default: all of them)
    pub resource_type: Option<String>,
    /// how many resources to delete per batch (default: configured)
    pub batch_size: Option<i64>,
    /// purge only resources removed at or after this time
    pub start: Option<DateTime<Utc>>,
    /// purge only resources removed before this time (default: now)
    pub end: Option<DateTime<Utc>>,
}

/// A validated purge request
#[derive(Clone, Debug, Eq, PartialEq)]
struct PurgeRequest {
    resource_types: Vec<ResourceType>,
    /// `None`: unbounded
    batch_size: Option<usize>,
    start: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
}

impl PurgeParams {
    fn validate(
        self,
        default_batch_size: u64,
        now: DateTime<Utc>,
    ) -> Result<PurgeRequest, Error> {
        let resource_types = match &self.resource_type {
            None => PURGEABLE.to_vec(),
            Some(name) => {
                let resource_type = ResourceType::from_str(name)
                    .ok()
                    .filter(|t| PURGEABLE.contains(t))
                    .ok_or_else(|| {
                        Error::invalid_value(
                            "resource_type",
                            &format!("cannot purge resources of type {name:?}"),
                        )
                    })?;
                vec![resource_type]
            }
        };

        let batch_size = match self.batch_size {
            Some(n) if n <= 0 => {
                return Err(Error::invalid_value(
                    "batch_size",
                    "must be positive",
                ));
            }
            Some(n) => usize::try_from(n).ok(),
            None => match default_batch_size {
                0 => None,
                n => usize::try_from(n).ok(),
            },
        };

        if let (Some(start), Some(end)) = (self.start, self.end) {
            if end < start {
                return Err(Error::invalid_value(
                    "end",
                    "must not be before start",
                ));
            }
        }

        Ok(PurgeRequest {
            resource_types,
            batch_size,
            start: self.start,
            end: self.end.unwrap_or(now),
        })
    }
}

/// What a purge removed
#[derive(Clone, Debug, Default, Eq, JsonSchema, PartialEq, Serialize)]
pub struct PurgeCounts {
    pub virtual_machines: usize,
    pub commands: usize,
}

/// Call `purge_batch` until it removes less than a full batch
async fn purge_in_batches<F, Fut>(
    batch_size: Option<usize>,
    mut purge_batch: F,
) -> Result<usize, Error>
where
    F: FnMut(Option<usize>) -> Fut,
    Fut: Future<Output = Result<usize, Error>>,
{
    let mut total = 0;
    loop {
        let removed = purge_batch(batch_size).await?;
        total += removed;
        match batch_size {
            Some(limit) if removed >= limit => continue,
            _ => return Ok(total),
        }
    }
}

async fn purge(
    log: &Logger,
    inventory: &InMemoryInventory,
    ledger: &CommandLedger,
    request: &PurgeRequest,
) -> Result<PurgeCounts, Error> {
    let mut counts = PurgeCounts::default();
    if request.resource_types.contains(&ResourceType::VirtualMachine) {
        counts.virtual_machines =
            purge_in_batches(request.batch_size, |limit| {
                inventory.purge_expunged_vms(request.start, request.end, limit)
            })
            .await?;
    }
    // Command records only know when they were tombstoned, and any tombstone
    // before `end` is fair game.
    if request.resource_types.contains(&ResourceType::Command) {
        counts.commands = purge_in_batches(request.batch_size, |limit| {
            ledger.purge_removed(request.end, limit)
        })
        .await?;
    }
    info!(
        log,
        "purged expunged resources";
        "virtual_machines" => counts.virtual_machines,
        "commands" => counts.commands,
        "end" => %request.end,
    );
    Ok(counts)
}

impl ControlPlane {
    /// Delete expunged resources
    pub async fn purge_expunged_resources(
        &self,
        params: PurgeParams,
    ) -> Result<AdminResponse, Error> {
        let request =
            params.validate(self.purge_config.batch_size, Utc::now())?;
        let counts =
            purge(&self.log, &self.inventory, &self.ledger, &request).await?;
        Ok(AdminResponse::ok(format!(
            "purged {} virtual machine(s) and {} command record(s)",
            counts.virtual_machines, counts.commands
        )))
    }
}

/// Background task that periodically purges old expunged resources
pub struct ExpungedResourcePurger {
    inventory: Arc<InMemoryInventory>,
    ledger: Arc<CommandLedger>,
    config: PurgeConfig,
}

impl ExpungedResourcePurger {
    pub fn new(
        inventory: Arc<InMemoryInventory>,
        ledger: Arc<CommandLedger>,
        config: PurgeConfig,
    ) -> ExpungedResourcePurger {
        ExpungedResourcePurger { inventory, ledger, config }
    }

    fn request(&self, now: DateTime<Utc>) -> PurgeRequest {
        let age =
            TimeDelta::days(i64::from(self.config.end_time_difference_days));
        PurgeRequest {
            resource_types: PURGEABLE.to_vec(),
            batch_size: match self.config.batch_size {
                0 => None,
                n => usize::try_from(n).ok(),
            },
            start: None,
            end: now
                .checked_sub_signed(age)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        }
    }
}

impl BackgroundTask for ExpungedResourcePurger {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let request = self.request(Utc::now());
            match purge(log, &self.inventory, &self.ledger, &request).await {
                Ok(counts) => serde_json::to_value(&counts).unwrap_or_else(
                    |error| {
                        json!({
                            "error": format!(
                                "failed to serialize final value: {:#}",
                                error
                            )
                        })
                    },
                ),
                Err(error) => {
                    warn!(
                        log,
                        "failed to purge expunged resources";
                        InlineErrorChain::new(&error),
                    );
                    let message = InlineErrorChain::new(&error).to_string();
                    json!({ "error": message })
                }
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_purge_params_validation() {
        let now = Utc::now();

        let request = PurgeParams::default().validate(0, now).unwrap();
        assert_eq!(
            request,
            PurgeRequest {
                resource_types: PURGEABLE.to_vec(),
                batch_size: None,
                start: None,
                end: now,
            }
        );

        // The configured batch size fills in for a missing one.
        let request = PurgeParams::default().validate(25, now).unwrap();
        assert_eq!(request.batch_size, Some(25));

        let request = PurgeParams {
            resource_type: Some(String::from("virtual_machine")),
            batch_size: Some(3),
            ..Default::default()
        }
        .validate(25, now)
        .unwrap();
        assert_eq!(request.resource_types, vec![ResourceType::VirtualMachine]);
        assert_eq!(request.batch_size, Some(3));

        for resource_type in ["bogus", "host"] {
            let error = PurgeParams {
                resource_type: Some(String::from(resource_type)),
                ..Default::default()
            }
            .validate(0, now)
            .unwrap_err();
            assert_matches!(
                error,
                Error::InvalidValue { label, .. } if label == "resource_type"
            );
        }

        for batch_size in [0, -5] {
            let error = PurgeParams {
                batch_size: Some(batch_size),
                ..Default::default()
            }
            .validate(0, now)
            .unwrap_err();
            assert_matches!(
                error,
                Error::InvalidValue { label, .. } if label == "batch_size"
            );
        }

        let error = PurgeParams {
            start: Some(now),
            end: Some(now - TimeDelta::days(1)),
            ..Default::default()
        }
        .validate(0, now)
        .unwrap_err();
        assert_matches!(
            error,
            Error::InvalidValue { label, .. } if label == "end"
        );
    }

    #[tokio::test]
    async fn test_purge_in_batches() {
        let mut remaining = 7;
        let mut calls = 0;
        let total = purge_in_batches(Some(3), |limit| {
            calls += 1;
            let removed = remaining.min(limit.unwrap_or(usize::MAX));
            remaining -= removed;
            async move { Ok(removed) }
        })
        .await
        .unwrap();
        assert_eq!(total, 7);
        // 3, 3, then 1 (a short batch ends the loop)
        assert_eq!(calls, 3);

        let total =
            purge_in_batches(None, |_| async { Ok(5) }).await.unwrap();
        assert_eq!(total, 5);
    }
}
