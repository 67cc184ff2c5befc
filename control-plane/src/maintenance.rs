// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rolling maintenance requests

use crate::ControlPlane;
use keel_common::api::external::Error;
use keel_common::api::external::ResourceType;
use keel_common::typed_uuid::ClusterUuid;
use keel_common::typed_uuid::HostUuid;
use keel_common::typed_uuid::MaintenancePlanUuid;
use keel_common::typed_uuid::PodUuid;
use keel_common::typed_uuid::ZoneUuid;
use keel_types::maintenance::MaintenancePlan;
use keel_types::maintenance::MaintenancePlanStatus;
use keel_types::maintenance::MaintenanceScope;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use slog::info;

/// Parameters of a rolling maintenance request
///
/// Exactly one of the scope fields must be set.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema)]
pub struct RollingMaintenanceParams {
    pub host_id: Option<HostUuid>,
    pub cluster_id: Option<ClusterUuid>,
    pub pod_id: Option<PodUuid>,
    pub zone_id: Option<ZoneUuid>,
    /// keep going after a host fails a stage
    #[serde(default)]
    pub forced: bool,
    /// handed to each host's maintenance hook
    #[serde(default)]
    pub payload: String,
}

impl RollingMaintenanceParams {
    fn scope(&self) -> Result<MaintenanceScope, Error> {
        let scopes: Vec<MaintenanceScope> = [
            self.host_id.map(MaintenanceScope::Host),
            self.cluster_id.map(MaintenanceScope::Cluster),
            self.pod_id.map(MaintenanceScope::Pod),
            self.zone_id.map(MaintenanceScope::Zone),
        ]
        .into_iter()
        .flatten()
        .collect();
        match scopes.as_slice() {
            [scope] => Ok(*scope),
            [] => Err(Error::invalid_request(
                "one of host_id, cluster_id, pod_id, or zone_id must be \
                 specified",
            )),
            _ => Err(Error::invalid_request(
                "only one of host_id, cluster_id, pod_id, or zone_id may be \
                 specified",
            )),
        }
    }
}

/// Acknowledgment that a rolling maintenance plan was admitted
#[derive(Clone, Debug, Eq, JsonSchema, PartialEq, Serialize)]
pub struct RollingMaintenanceStarted {
    pub plan_id: MaintenancePlanUuid,
    /// number of hosts in the plan's scope
    pub hosts: usize,
}

impl ControlPlane {
    /// Start rolling maintenance over every host in the requested scope
    ///
    /// This returns once the plan has been validated and admitted.  The plan
    /// itself runs in the background; see
    /// [`ControlPlane::rolling_maintenance_status`].
    pub async fn start_rolling_maintenance(
        &self,
        params: RollingMaintenanceParams,
    ) -> Result<RollingMaintenanceStarted, Error> {
        let scope = params.scope()?;
        let plan = MaintenancePlan {
            id: MaintenancePlanUuid::new_v4(),
            scope,
            forced: params.forced,
            payload: params.payload,
        };
        let started = self.maintenance.start(plan).await?;
        info!(
            self.log,
            "admitted rolling maintenance plan";
            "plan_id" => %started.plan_id,
            "scope" => %scope,
            "hosts" => started.hosts,
        );
        Ok(RollingMaintenanceStarted {
            plan_id: started.plan_id,
            hosts: started.hosts,
        })
    }

    /// Returns the progress of a running plan, or the report of one that
    /// finished recently
    pub async fn rolling_maintenance_status(
        &self,
        plan_id: MaintenancePlanUuid,
    ) -> Result<MaintenancePlanStatus, Error> {
        self.maintenance.plan_status(plan_id).await.ok_or_else(|| {
            Error::not_found_by_id(
                ResourceType::MaintenancePlan,
                plan_id.as_untyped_uuid(),
            )
        })
    }
}
