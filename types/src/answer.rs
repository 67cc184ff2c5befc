// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Answers returned by remote agents

use crate::record::CommandState;
use keel_common::typed_uuid::HostUuid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// The result of executing a [`crate::command::Command`]
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct Answer {
    pub success: bool,
    pub details: String,
    pub kind: AnswerKind,
}

impl Answer {
    pub fn success(details: impl Into<String>) -> Answer {
        Answer {
            success: true,
            details: details.into(),
            kind: AnswerKind::Generic,
        }
    }

    pub fn failure(details: impl Into<String>) -> Answer {
        Answer {
            success: false,
            details: details.into(),
            kind: AnswerKind::Generic,
        }
    }

    pub fn with_kind(mut self, kind: AnswerKind) -> Answer {
        self.kind = kind;
        self
    }

    /// Returns the terminal state implied by this answer
    pub fn terminal_state(&self) -> CommandState {
        if self.success {
            CommandState::Done
        } else {
            CommandState::Failed
        }
    }
}

/// Command-specific typed fields of an [`Answer`]
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnswerKind {
    Generic,
    MigrateWithStorage(MigrateAnswer),
    RollingMaintenance(RollingMaintenanceAnswer),
}

/// Power state of a virtual machine as observed on one host
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum VmPowerState {
    Running,
    Stopped,
    Paused,
    Missing,
}

/// What one host reports about a migrating virtual machine
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct HostVmView {
    pub host_id: HostUuid,
    /// `None` if the host could not determine the state
    pub state: Option<VmPowerState>,
    pub disks: Vec<String>,
}

/// Typed fields of a migration answer: per-host VM state and disks on the
/// source and destination host
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct MigrateAnswer {
    pub source: HostVmView,
    pub destination: HostVmView,
}

impl MigrateAnswer {
    /// Returns whether this answer is conclusive about where the VM ended up
    ///
    /// That's the case if both hosts reported a state, or if the destination
    /// reports the VM running.
    pub fn is_conclusive(&self) -> bool {
        (self.source.state.is_some() && self.destination.state.is_some())
            || self.destination.state == Some(VmPowerState::Running)
    }
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct RollingMaintenanceAnswer {
    pub finished: bool,
    pub reboot_required: bool,
}

/// An agent's reply to a status query for one command
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AgentCommandStatus {
    /// the agent has never seen this command (or has forgotten it)
    UnknownCommand,
    /// the agent accepted the command and is still executing it
    Running,
    /// the agent finished the command
    Completed { answer: Answer },
}
