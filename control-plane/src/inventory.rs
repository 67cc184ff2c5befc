// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory inventory of hosts, virtual machines, and storage pools

use chrono::DateTime;
use chrono::Utc;
use keel_common::api::external::Error;
use keel_common::api::external::ResourceType;
use keel_common::typed_uuid::ClusterUuid;
use keel_common::typed_uuid::HostUuid;
use keel_common::typed_uuid::StoragePoolUuid;
use keel_common::typed_uuid::VirtualMachineUuid;
use keel_config::SimulationConfig;
use keel_maintenance::MaintenanceInventory;
use keel_types::inventory::HostDescriptor;
use keel_types::inventory::HostState;
use keel_types::inventory::StoragePoolDescriptor;
use keel_types::inventory::VmDescriptor;
use keel_types::inventory::VmState;
use keel_types::maintenance::MaintenanceScope;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct Tables {
    /// hosts, in the order rolling maintenance visits them
    hosts: Vec<HostDescriptor>,
    vms: BTreeMap<VirtualMachineUuid, VmDescriptor>,
    pools: BTreeMap<StoragePoolUuid, StoragePoolDescriptor>,
}

impl Tables {
    fn host_mut(&mut self, id: HostUuid) -> Result<&mut HostDescriptor, Error> {
        self.hosts.iter_mut().find(|h| h.id == id).ok_or_else(|| {
            Error::not_found_by_id(ResourceType::Host, id.as_untyped_uuid())
        })
    }

    fn vm_mut(
        &mut self,
        id: VirtualMachineUuid,
    ) -> Result<&mut VmDescriptor, Error> {
        self.vms.get_mut(&id).ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::VirtualMachine,
                id.as_untyped_uuid(),
            )
        })
    }
}

/// The resources a control plane node manages
///
/// This stands in for the database-backed inventory of a production
/// deployment.
pub struct InMemoryInventory {
    log: Logger,
    tables: Mutex<Tables>,
}

impl InMemoryInventory {
    pub fn new(
        log: &Logger,
        hosts: Vec<HostDescriptor>,
        pools: Vec<StoragePoolDescriptor>,
    ) -> InMemoryInventory {
        let tables = Tables {
            hosts,
            vms: BTreeMap::new(),
            pools: pools.into_iter().map(|p| (p.id, p)).collect(),
        };
        InMemoryInventory {
            log: log.new(o!("component" => "InMemoryInventory")),
            tables: Mutex::new(tables),
        }
    }

    pub fn from_simulation(
        log: &Logger,
        config: &SimulationConfig,
    ) -> InMemoryInventory {
        InMemoryInventory::new(log, config.hosts.clone(), config.pools.clone())
    }

    pub async fn insert_vm(&self, vm: VmDescriptor) {
        self.tables.lock().await.vms.insert(vm.id, vm);
    }

    pub async fn host(&self, id: HostUuid) -> Result<HostDescriptor, Error> {
        self.tables.lock().await.host_mut(id).map(|h| h.clone())
    }

    pub async fn hosts(&self) -> Vec<HostDescriptor> {
        self.tables.lock().await.hosts.clone()
    }

    pub async fn vm(
        &self,
        id: VirtualMachineUuid,
    ) -> Result<VmDescriptor, Error> {
        self.tables.lock().await.vm_mut(id).map(|vm| vm.clone())
    }

    /// Returns a snapshot of every known storage pool
    pub async fn pools(
        &self,
    ) -> BTreeMap<StoragePoolUuid, StoragePoolDescriptor> {
        self.tables.lock().await.pools.clone()
    }

    pub async fn set_vm_state(
        &self,
        id: VirtualMachineUuid,
        state: VmState,
    ) -> Result<(), Error> {
        self.tables.lock().await.vm_mut(id)?.state = state;
        Ok(())
    }

    /// Record where a migrating VM ended up
    ///
    /// `destination` is `None` if the migration failed and the VM stayed
    /// where it was.
    pub async fn finish_migration(
        &self,
        id: VirtualMachineUuid,
        destination: Option<HostUuid>,
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().await;
        let vm = tables.vm_mut(id)?;
        if let Some(host_id) = destination {
            vm.host_id = Some(host_id);
        }
        vm.state = VmState::Running;
        Ok(())
    }

    /// Mark a VM expunged as of `now`
    pub async fn expunge_vm(
        &self,
        id: VirtualMachineUuid,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().await;
        let vm = tables.vm_mut(id)?;
        vm.state = VmState::Expunged;
        vm.host_id = None;
        vm.time_removed = Some(now);
        Ok(())
    }

    /// Drop a VM from the inventory, provided it is still in state `expected`
    pub async fn remove_vm(
        &self,
        id: VirtualMachineUuid,
        expected: VmState,
    ) -> Result<VmDescriptor, Error> {
        let mut tables = self.tables.lock().await;
        let vm = tables.vm_mut(id)?;
        if vm.state != expected {
            return Err(Error::conflict(&format!(
                "virtual machine {} changed state from {} to {}",
                id, expected, vm.state
            )));
        }
        tables.vms.remove(&id).ok_or_else(|| {
            Error::internal_error("virtual machine vanished while locked")
        })
    }

    /// Delete expunged VMs removed in `[start, end)`, at most `limit` of them
    pub async fn purge_expunged_vms(
        &self,
        start: Option<DateTime<Utc>>,
        end: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<usize, Error> {
        let mut tables = self.tables.lock().await;
        let doomed: Vec<_> = tables
            .vms
            .values()
            .filter(|vm| vm.state == VmState::Expunged)
            .filter(|vm| match vm.time_removed {
                Some(t) => t < end && start.map_or(true, |s| t >= s),
                None => false,
            })
            .map(|vm| vm.id)
            .take(limit.unwrap_or(usize::MAX))
            .collect();
        for id in &doomed {
            tables.vms.remove(id);
        }
        if !doomed.is_empty() {
            debug!(self.log, "purged expunged VMs"; "count" => doomed.len());
        }
        Ok(doomed.len())
    }
}

#[async_trait::async_trait]
impl MaintenanceInventory for InMemoryInventory {
    async fn hosts_in_scope(
        &self,
        scope: &MaintenanceScope,
    ) -> Result<Vec<HostDescriptor>, Error> {
        let tables = self.tables.lock().await;
        Ok(tables.hosts.iter().filter(|h| scope.contains(h)).cloned().collect())
    }

    async fn cluster_hosts(
        &self,
        cluster: ClusterUuid,
    ) -> Result<Vec<HostDescriptor>, Error> {
        let tables = self.tables.lock().await;
        Ok(tables
            .hosts
            .iter()
            .filter(|h| h.cluster_id == cluster)
            .cloned()
            .collect())
    }

    async fn set_host_state(
        &self,
        host: HostUuid,
        state: HostState,
    ) -> Result<(), Error> {
        let mut tables = self.tables.lock().await;
        let descriptor = tables.host_mut(host)?;
        if descriptor.state != state {
            debug!(
                self.log,
                "host state changed";
                "host_id" => %host,
                "from" => %descriptor.state,
                "to" => %state,
            );
            descriptor.state = state;
        }
        Ok(())
    }
}
