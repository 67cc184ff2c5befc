// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Descriptions of hosts, virtual machines, and storage pools as known to the
//! control plane's inventory

use chrono::DateTime;
use chrono::Utc;
use keel_common::typed_uuid::ClusterUuid;
use keel_common::typed_uuid::HostUuid;
use keel_common::typed_uuid::PodUuid;
use keel_common::typed_uuid::StoragePoolUuid;
use keel_common::typed_uuid::VirtualMachineUuid;
use keel_common::typed_uuid::ZoneUuid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// Administrative state of a host
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    parse_display::Display,
)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum HostState {
    Enabled,
    Maintenance,
    Disabled,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct HostDescriptor {
    pub id: HostUuid,
    pub cluster_id: ClusterUuid,
    pub pod_id: PodUuid,
    pub zone_id: ZoneUuid,
    pub state: HostState,
    /// total capacity, in abstract allocation units
    pub capacity: u64,
    /// capacity allocated to guests
    pub allocated: u64,
}

impl HostDescriptor {
    pub fn free_capacity(&self) -> u64 {
        self.capacity.saturating_sub(self.allocated)
    }
}

#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    JsonSchema,
    PartialEq,
    Serialize,
    parse_display::Display,
)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum VmState {
    Running,
    Stopped,
    Migrating,
    Expunging,
    Expunged,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct VmDescriptor {
    pub id: VirtualMachineUuid,
    pub host_id: Option<HostUuid>,
    pub state: VmState,
    /// set once the VM has been expunged (or unmanaged)
    pub time_removed: Option<DateTime<Utc>>,
}

/// Where a storage pool is reachable from
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum PoolScope {
    Cluster(ClusterUuid),
    Zone(ZoneUuid),
}

#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
pub struct StoragePoolDescriptor {
    pub id: StoragePoolUuid,
    /// whether the pool's lifecycle is controlled by an external array or API
    pub managed: bool,
    pub scope: PoolScope,
}
