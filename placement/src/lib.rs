// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Placement checks for live migrations with storage
//!
//! Before a virtual machine is live-migrated together with its volumes, the
//! proposed set of volume moves is checked here.  The check is a pure
//! function of the [`MigrationMap`] and the two hosts: it either rejects the
//! request as malformed ([`PlacementError`]) or decides which migration
//! mechanism, if any, can carry it out ([`PlacementDecision`]).  Nothing is
//! dispatched for a rejected request.

use keel_common::api::external::Error;
use keel_common::typed_uuid::ClusterUuid;
use keel_common::typed_uuid::HostUuid;
use keel_common::typed_uuid::StoragePoolUuid;
use keel_common::typed_uuid::VirtualMachineUuid;
use keel_common::typed_uuid::VolumeUuid;
use keel_types::command::CommandPayload;
use keel_types::command::MigrateWithStorageCommand;
use keel_types::command::MigrationStrategy;
use keel_types::command::VolumeMigration;
use keel_types::inventory::HostDescriptor;
use keel_types::inventory::PoolScope;
use keel_types::inventory::StoragePoolDescriptor;
use serde::Serialize;
use std::collections::BTreeMap;
use std::collections::BTreeSet;

/// Errors that make a migration request invalid
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum PlacementError {
    #[error("migration map is empty")]
    EmptyMap,
    #[error("volume {volume_id} appears more than once in the migration map")]
    DuplicateVolume { volume_id: VolumeUuid },
    #[error("unknown destination pool {pool_id} for volume {volume_id}")]
    UnknownDestinationPool { volume_id: VolumeUuid, pool_id: StoragePoolUuid },
    #[error("unknown source pool {pool_id} for volume {volume_id}")]
    UnknownSourcePool { volume_id: VolumeUuid, pool_id: StoragePoolUuid },
    #[error(
        "destination pools mix managed and unmanaged storage \
         ({managed} managed, {unmanaged} unmanaged)"
    )]
    MixedDestinationPools { managed: usize, unmanaged: usize },
}

impl From<PlacementError> for Error {
    fn from(error: PlacementError) -> Self {
        Error::invalid_request(&error.to_string())
    }
}

/// Source of storage pool descriptions
pub trait PoolLookup {
    fn pool(&self, id: StoragePoolUuid) -> Option<StoragePoolDescriptor>;
}

impl PoolLookup for BTreeMap<StoragePoolUuid, StoragePoolDescriptor> {
    fn pool(&self, id: StoragePoolUuid) -> Option<StoragePoolDescriptor> {
        self.get(&id).copied()
    }
}

/// One volume move, annotated with what is known about its pools
///
/// A pool that could not be found is `None`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VolumePlacement {
    pub volume_id: VolumeUuid,
    pub source_pool_id: StoragePoolUuid,
    pub source: Option<StoragePoolDescriptor>,
    pub destination_pool_id: StoragePoolUuid,
    pub destination: Option<StoragePoolDescriptor>,
}

/// The volume moves of one migration request
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MigrationMap {
    entries: Vec<VolumePlacement>,
}

impl MigrationMap {
    /// Look up the pools of each requested volume move
    ///
    /// Unknown pools are not an error here; [`evaluate`] reports them.
    pub fn resolve(
        requests: &[VolumeMigration],
        pools: &dyn PoolLookup,
    ) -> Result<MigrationMap, PlacementError> {
        if requests.is_empty() {
            return Err(PlacementError::EmptyMap);
        }
        let mut seen = BTreeSet::new();
        let mut entries = Vec::with_capacity(requests.len());
        for request in requests {
            if !seen.insert(request.volume_id) {
                return Err(PlacementError::DuplicateVolume {
                    volume_id: request.volume_id,
                });
            }
            entries.push(VolumePlacement {
                volume_id: request.volume_id,
                source_pool_id: request.source_pool,
                source: pools.pool(request.source_pool),
                destination_pool_id: request.destination_pool,
                destination: pools.pool(request.destination_pool),
            });
        }
        Ok(MigrationMap { entries })
    }

    pub fn entries(&self) -> &[VolumePlacement] {
        &self.entries
    }
}

/// The placement-relevant facts about a host
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct HostInfo {
    pub id: HostUuid,
    pub cluster_id: ClusterUuid,
}

impl From<&HostDescriptor> for HostInfo {
    fn from(host: &HostDescriptor) -> Self {
        HostInfo { id: host.id, cluster_id: host.cluster_id }
    }
}

/// Outcome of a placement check on a valid request
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct PlacementDecision {
    pub strategy: MigrationStrategy,
    pub reason: String,
}

impl PlacementDecision {
    fn cannot_handle(reason: impl Into<String>) -> PlacementDecision {
        PlacementDecision {
            strategy: MigrationStrategy::CannotHandle,
            reason: reason.into(),
        }
    }

    /// Returns whether some mechanism can carry out the migration
    pub fn permitted(&self) -> bool {
        self.strategy != MigrationStrategy::CannotHandle
    }
}

/// Decide whether the moves in `map` can be carried out as part of a live
/// migration from `source` to `destination`, and how
///
/// This has no side effects and the result depends only on the arguments.
pub fn evaluate(
    map: &MigrationMap,
    source: &HostInfo,
    destination: &HostInfo,
) -> Result<PlacementDecision, PlacementError> {
    if map.entries.is_empty() {
        return Err(PlacementError::EmptyMap);
    }

    let mut destination_pools = Vec::with_capacity(map.entries.len());
    for entry in &map.entries {
        let pool = entry.destination.ok_or(
            PlacementError::UnknownDestinationPool {
                volume_id: entry.volume_id,
                pool_id: entry.destination_pool_id,
            },
        )?;
        destination_pools.push(pool);
    }
    if let Some(entry) = map.entries.iter().find(|e| e.source.is_none()) {
        return Err(PlacementError::UnknownSourcePool {
            volume_id: entry.volume_id,
            pool_id: entry.source_pool_id,
        });
    }

    let managed = destination_pools.iter().filter(|p| p.managed).count();
    let unmanaged = destination_pools.len() - managed;
    if managed > 0 && unmanaged > 0 {
        return Err(PlacementError::MixedDestinationPools {
            managed,
            unmanaged,
        });
    }

    if unmanaged > 0 {
        if source.cluster_id == destination.cluster_id
            && source.id == destination.id
        {
            return Ok(PlacementDecision::cannot_handle(
                "source and destination host are the same",
            ));
        }
        if source.cluster_id != destination.cluster_id {
            return Ok(PlacementDecision::cannot_handle(format!(
                "live migration with unmanaged storage from cluster {} to \
                 cluster {} is not supported",
                source.cluster_id, destination.cluster_id
            )));
        }
        let unreachable = destination_pools.iter().find(|p| match p.scope {
            PoolScope::Cluster(c) => c != destination.cluster_id,
            PoolScope::Zone(_) => false,
        });
        if let Some(pool) = unreachable {
            return Ok(PlacementDecision::cannot_handle(format!(
                "destination pool {} is not reachable from cluster {}",
                pool.id, destination.cluster_id
            )));
        }
        return Ok(PlacementDecision {
            strategy: MigrationStrategy::UnmanagedLiveMigration,
            reason: String::from("live migration with unmanaged storage"),
        });
    }

    Ok(PlacementDecision {
        strategy: MigrationStrategy::ManagedLiveMigration,
        reason: String::from("live migration with managed storage"),
    })
}

/// Build the single command that carries out a permitted migration
///
/// Returns `None` if `decision` does not permit the migration.
pub fn migration_command(
    vm_id: VirtualMachineUuid,
    map: &MigrationMap,
    source: &HostInfo,
    destination: &HostInfo,
    decision: &PlacementDecision,
) -> Option<CommandPayload> {
    if !decision.permitted() {
        return None;
    }
    Some(CommandPayload::MigrateWithStorage(MigrateWithStorageCommand {
        vm_id,
        source_host: source.id,
        destination_host: destination.id,
        strategy: decision.strategy,
        volumes: map
            .entries
            .iter()
            .map(|e| VolumeMigration {
                volume_id: e.volume_id,
                source_pool: e.source_pool_id,
                destination_pool: e.destination_pool_id,
            })
            .collect(),
    }))
}
