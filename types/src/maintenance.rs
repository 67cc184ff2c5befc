// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rolling maintenance plans and their results

use crate::inventory::HostDescriptor;
use chrono::DateTime;
use chrono::Utc;
use keel_common::typed_uuid::ClusterUuid;
use keel_common::typed_uuid::HostUuid;
use keel_common::typed_uuid::MaintenancePlanUuid;
use keel_common::typed_uuid::PodUuid;
use keel_common::typed_uuid::ZoneUuid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;

/// One stage of rolling maintenance, in execution order
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    PreFlight,
    PreMaintenance,
    Maintenance,
}

impl Stage {
    /// The argument passed to the host's maintenance hook for this stage
    pub fn hook_argument(&self) -> &'static str {
        match self {
            Stage::PreFlight => "preflight",
            Stage::PreMaintenance => "premaintenance",
            Stage::Maintenance => "maintenance",
        }
    }

    /// Whether this stage is carried out by the host's agent (as opposed to a
    /// local check in the coordinator)
    pub fn runs_on_agent(&self) -> bool {
        !matches!(self, Stage::PreFlight)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.hook_argument())
    }
}

/// The set of hosts a maintenance plan covers
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum MaintenanceScope {
    Host(HostUuid),
    Cluster(ClusterUuid),
    Pod(PodUuid),
    Zone(ZoneUuid),
}

impl MaintenanceScope {
    /// Returns whether `host` falls within this scope
    pub fn contains(&self, host: &HostDescriptor) -> bool {
        match self {
            MaintenanceScope::Host(id) => host.id == *id,
            MaintenanceScope::Cluster(id) => host.cluster_id == *id,
            MaintenanceScope::Pod(id) => host.pod_id == *id,
            MaintenanceScope::Zone(id) => host.zone_id == *id,
        }
    }
}

impl std::fmt::Display for MaintenanceScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MaintenanceScope::Host(id) => write!(f, "host {id}"),
            MaintenanceScope::Cluster(id) => write!(f, "cluster {id}"),
            MaintenanceScope::Pod(id) => write!(f, "pod {id}"),
            MaintenanceScope::Zone(id) => write!(f, "zone {id}"),
        }
    }
}

/// A request to run rolling maintenance over every host in `scope`
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct MaintenancePlan {
    pub id: MaintenancePlanUuid,
    pub scope: MaintenanceScope,
    /// keep going after a host fails a stage
    pub forced: bool,
    /// opaque payload handed to each host's maintenance hook
    pub payload: String,
}

/// Where one host is in its maintenance
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum HostStage {
    NotStarted,
    /// currently executing (or about to execute) the given stage
    InStage { stage: Stage },
    Completed,
    Failed { stage: Stage, reason: String },
    /// stopped because the plan aborted, before starting `next_stage`
    Aborted { next_stage: Stage },
}

impl HostStage {
    pub fn is_completed(&self) -> bool {
        matches!(self, HostStage::Completed)
    }
}

/// Durable result of one stage on one host
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct StageResult {
    pub plan_id: MaintenancePlanUuid,
    pub host_id: HostUuid,
    pub stage: Stage,
    pub success: bool,
    pub details: String,
    pub time_finished: DateTime<Utc>,
}

/// Terminal report of a maintenance plan
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub plan_id: MaintenancePlanUuid,
    /// whether the plan was aborted after a stage failure
    pub aborted: bool,
    pub hosts: BTreeMap<HostUuid, HostStage>,
}

/// What is known about a maintenance plan
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MaintenancePlanStatus {
    Running { hosts: BTreeMap<HostUuid, HostStage> },
    Finished { report: MaintenanceReport },
}

impl MaintenanceReport {
    /// Success only if every host in scope reached `Completed`
    pub fn success(&self) -> bool {
        !self.aborted && self.hosts.values().all(HostStage::is_completed)
    }

    pub fn summary(&self) -> String {
        if self.success() {
            return format!(
                "rolling maintenance completed on {} host(s)",
                self.hosts.len()
            );
        }

        let mut lines = vec![format!(
            "rolling maintenance {}",
            if self.aborted { "aborted" } else { "finished with failures" }
        )];
        for (host_id, stage) in &self.hosts {
            let line = match stage {
                HostStage::NotStarted => format!("{host_id}: not started"),
                HostStage::InStage { stage } => {
                    format!("{host_id}: stopped in {stage}")
                }
                HostStage::Completed => format!("{host_id}: completed"),
                HostStage::Failed { stage, reason } => {
                    format!("{host_id}: failed in {stage}: {reason}")
                }
                HostStage::Aborted { next_stage } => {
                    format!("{host_id}: aborted before {next_stage}")
                }
            };
            lines.push(line);
        }
        lines.join("\n")
    }
}
