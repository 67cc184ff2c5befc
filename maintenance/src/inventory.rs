// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use keel_common::api::external::Error;
use keel_common::typed_uuid::ClusterUuid;
use keel_common::typed_uuid::HostUuid;
use keel_types::inventory::HostDescriptor;
use keel_types::inventory::HostState;
use keel_types::maintenance::MaintenanceScope;

/// The part of the host inventory that rolling maintenance needs
#[async_trait::async_trait]
pub trait MaintenanceInventory: Send + Sync {
    /// Returns every host in `scope`, in the order they should be maintained
    async fn hosts_in_scope(
        &self,
        scope: &MaintenanceScope,
    ) -> Result<Vec<HostDescriptor>, Error>;

    /// Returns every host in `cluster`
    async fn cluster_hosts(
        &self,
        cluster: ClusterUuid,
    ) -> Result<Vec<HostDescriptor>, Error>;

    async fn set_host_state(
        &self,
        host: HostUuid,
        state: HostState,
    ) -> Result<(), Error>;
}
