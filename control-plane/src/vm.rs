// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual machine administration

use crate::AdminResponse;
use crate::ControlPlane;
use keel_common::api::external::Error;
use keel_common::typed_uuid::VirtualMachineUuid;
use keel_types::inventory::VmState;
use keel_types::record::CommandState;
use slog::info;

impl ControlPlane {
    /// Stop managing a virtual machine
    ///
    /// The VM is dropped from the inventory.  Nothing is sent to its host: the
    /// guest keeps running, outside of keel's control.
    pub async fn unmanage_virtual_machine(
        &self,
        vm_id: VirtualMachineUuid,
    ) -> Result<AdminResponse, Error> {
        let vm = self.inventory.vm(vm_id).await?;
        if vm.time_removed.is_some() {
            return Err(Error::invalid_request(&format!(
                "virtual machine {} has already been removed",
                vm_id
            )));
        }
        if !matches!(vm.state, VmState::Running | VmState::Stopped) {
            return Err(Error::invalid_request(&format!(
                "virtual machine {} is {}; only running or stopped virtual \
                 machines can be unmanaged",
                vm_id, vm.state
            )));
        }

        let in_progress = self
            .ledger
            .find_by_state(CommandState::NON_TERMINAL)
            .await?
            .into_iter()
            .filter(|r| r.command.payload.vm_id() == Some(vm_id))
            .count();
        if in_progress > 0 {
            return Err(Error::conflict(&format!(
                "virtual machine {} has {} command(s) in progress",
                vm_id, in_progress
            )));
        }

        self.inventory.remove_vm(vm_id, vm.state).await?;
        info!(
            self.log,
            "virtual machine unmanaged";
            "vm_id" => %vm_id,
            "host_id" => ?vm.host_id,
        );
        Ok(AdminResponse::ok(format!(
            "virtual machine {} is no longer managed",
            vm_id
        )))
    }
}
