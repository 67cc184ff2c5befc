// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records kept by the command ledger

use crate::answer::Answer;
use crate::command::Command;
use crate::command::CommandKey;
use chrono::DateTime;
use chrono::Utc;
use keel_common::api::external::Generation;
use keel_common::typed_uuid::ControlPlaneNodeUuid;
use keel_common::typed_uuid::HostUuid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;

/// State of a command, as seen by the control plane or by the agent
///
/// The control plane moves a record through `Created -> Reconciling -> {Done,
/// Failed}`, or to `Interrupted` when the owner of the record is known to be
/// gone and no answer can be retrieved.  Agents additionally report `Started`
/// once they have accepted a command.
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
    strum::Display,
    strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandState {
    /// persisted, not yet confirmed accepted by the agent
    Created,
    /// (agent only) accepted and executing
    Started,
    /// accepted by the agent, outcome not yet durably known
    Reconciling,
    Done,
    Failed,
    /// the owner went away before the outcome was known
    ///
    /// This is terminal-but-unresolved: it is not the same as failure, and an
    /// operator may need to resolve it.
    Interrupted,
}

impl CommandState {
    /// States a record can be in while its outcome is still being worked out
    pub const NON_TERMINAL: &'static [CommandState] =
        &[CommandState::Created, CommandState::Reconciling];

    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Done | CommandState::Failed)
    }
}

/// Identifies who owns a set of command records for the purpose of bulk
/// interruption
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize,
)]
#[serde(tag = "type", content = "id", rename_all = "snake_case")]
pub enum Owner {
    /// the control plane node that dispatched the command
    ControlPlane(ControlPlaneNodeUuid),
    /// the host the command was sent to
    Host(HostUuid),
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Owner::ControlPlane(id) => write!(f, "control plane node {}", id),
            Owner::Host(id) => write!(f, "host {}", id),
        }
    }
}

/// The ledger's unit of storage: one dispatched long-running command
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct CommandRecord {
    pub command: Command,
    pub host_id: HostUuid,
    /// control plane node that dispatched this command
    pub owner: ControlPlaneNodeUuid,
    pub state_by_management: CommandState,
    /// `None` until the agent has reported anything about this command
    pub state_by_agent: Option<CommandState>,
    pub answer: Option<Answer>,
    /// number of reconciliation attempts that could not reach the agent
    pub reconcile_attempts: u32,
    pub generation: Generation,
    pub time_created: DateTime<Utc>,
    pub time_updated: DateTime<Utc>,
    /// set when the record is tombstoned
    pub time_removed: Option<DateTime<Utc>>,
}

impl CommandRecord {
    pub fn new(
        command: Command,
        host_id: HostUuid,
        owner: ControlPlaneNodeUuid,
        now: DateTime<Utc>,
    ) -> CommandRecord {
        CommandRecord {
            command,
            host_id,
            owner,
            state_by_management: CommandState::Created,
            state_by_agent: None,
            answer: None,
            reconcile_attempts: 0,
            generation: Generation::new(),
            time_created: now,
            time_updated: now,
            time_removed: None,
        }
    }

    pub fn key(&self) -> CommandKey {
        self.command.key()
    }

    pub fn is_removed(&self) -> bool {
        self.time_removed.is_some()
    }

    /// Returns whether both sides agree on the same terminal state
    pub fn sides_agree_on_terminal(&self) -> bool {
        self.state_by_management.is_terminal()
            && self.state_by_agent == Some(self.state_by_management)
    }

    pub fn is_owned_by(&self, owner: &Owner) -> bool {
        match owner {
            Owner::ControlPlane(id) => self.owner == *id,
            Owner::Host(id) => self.host_id == *id,
        }
    }
}

/// What an agent reports about one in-flight command (e.g., along with a
/// heartbeat)
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct AgentCommandReport {
    pub host_id: HostUuid,
    pub key: CommandKey,
    pub state: CommandState,
    pub answer: Option<Answer>,
}
