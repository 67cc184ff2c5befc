// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Live migration of virtual machines together with their volumes

use crate::ControlPlane;
use keel_common::api::external::Error;
use keel_common::typed_uuid::HostUuid;
use keel_common::typed_uuid::VirtualMachineUuid;
use keel_ledger::CommandOutcome;
use keel_placement::evaluate;
use keel_placement::migration_command;
use keel_placement::HostInfo;
use keel_placement::MigrationMap;
use keel_placement::PlacementDecision;
use keel_types::command::CommandKey;
use keel_types::command::VolumeMigration;
use keel_types::inventory::HostState;
use keel_types::inventory::VmState;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::info;
use slog::o;
use slog::warn;
use slog_error_chain::InlineErrorChain;
use std::sync::Arc;

#[derive(Clone, Debug, Deserialize, JsonSchema)]
pub struct MigrateWithStorageParams {
    pub vm_id: VirtualMachineUuid,
    pub destination_host: HostUuid,
    pub volumes: Vec<VolumeMigration>,
}

/// Acknowledgment of a migration request
#[derive(Clone, Debug, Serialize)]
pub struct MigrationStarted {
    pub decision: PlacementDecision,
    /// the command carrying out the migration, if it was permitted
    pub command: Option<CommandKey>,
}

impl ControlPlane {
    /// Live-migrate a running VM and move its volumes
    ///
    /// The request is checked against placement rules first.  If it passes,
    /// one command is dispatched to the source host and this returns as soon
    /// as that command is recorded.  The inventory is updated when the
    /// command finishes.
    pub async fn migrate_with_storage(
        &self,
        params: MigrateWithStorageParams,
    ) -> Result<MigrationStarted, Error> {
        let vm = self.inventory.vm(params.vm_id).await?;
        if vm.state != VmState::Running {
            return Err(Error::invalid_request(&format!(
                "virtual machine {} is {}, not running",
                vm.id, vm.state
            )));
        }
        let source_id = vm.host_id.ok_or_else(|| {
            Error::invalid_request(&format!(
                "virtual machine {} is not placed on any host",
                vm.id
            ))
        })?;
        let source = HostInfo::from(&self.inventory.host(source_id).await?);
        let destination_host =
            self.inventory.host(params.destination_host).await?;
        if destination_host.state != HostState::Enabled {
            return Err(Error::invalid_request(&format!(
                "destination host {} is {}",
                destination_host.id, destination_host.state
            )));
        }
        let destination = HostInfo::from(&destination_host);

        let pools = self.inventory.pools().await;
        let map = MigrationMap::resolve(&params.volumes, &pools)?;
        let decision = evaluate(&map, &source, &destination)?;
        let log = self.log.new(o!(
            "vm_id" => vm.id.to_string(),
            "source_host" => source.id.to_string(),
            "destination_host" => destination.id.to_string(),
        ));
        let Some(payload) =
            migration_command(vm.id, &map, &source, &destination, &decision)
        else {
            info!(
                log,
                "declined migration with storage";
                "reason" => &decision.reason,
            );
            return Ok(MigrationStarted { decision, command: None });
        };

        self.inventory.set_vm_state(vm.id, VmState::Migrating).await?;
        let dispatched = self.dispatcher.dispatch(source.id, payload).await;
        let dispatched = match dispatched {
            Ok(dispatched) => dispatched,
            Err(error) => {
                self.inventory.set_vm_state(vm.id, VmState::Running).await?;
                return Err(error);
            }
        };
        let key = dispatched.key;
        info!(
            log,
            "started migration with storage";
            "command" => %key,
            "strategy" => %decision.strategy,
        );

        let inventory = Arc::clone(&self.inventory);
        let vm_id = vm.id;
        tokio::spawn(async move {
            let result = match dispatched.outcome().await {
                CommandOutcome::Answered(answer) if answer.success => {
                    info!(log, "migration with storage finished");
                    inventory
                        .finish_migration(vm_id, Some(destination.id))
                        .await
                }
                CommandOutcome::Answered(answer) => {
                    warn!(
                        log,
                        "migration with storage failed";
                        "details" => answer.details,
                    );
                    inventory.finish_migration(vm_id, None).await
                }
                CommandOutcome::NotDelivered(error) => {
                    warn!(
                        log,
                        "migration with storage was not delivered";
                        InlineErrorChain::new(&error),
                    );
                    inventory.finish_migration(vm_id, None).await
                }
                CommandOutcome::Withdrawn(reason) => {
                    warn!(
                        log,
                        "migration with storage was withdrawn before it was \
                         sent";
                        "reason" => reason,
                    );
                    inventory.finish_migration(vm_id, None).await
                }
                // Where the VM is now is up to reconciliation, and an
                // operator.
                CommandOutcome::Unresolved(reason) => {
                    warn!(
                        log,
                        "outcome of migration with storage is unknown";
                        "reason" => reason,
                    );
                    Ok(())
                }
            };
            if let Err(error) = result {
                warn!(
                    log,
                    "failed to update inventory after migration";
                    InlineErrorChain::new(&error),
                );
            }
        });

        Ok(MigrationStarted { decision, command: Some(key) })
    }
}
