// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Commands sent from a control plane node to a remote agent

use crate::maintenance::Stage;
use keel_common::typed_uuid::HostUuid;
use keel_common::typed_uuid::StoragePoolUuid;
use keel_common::typed_uuid::VirtualMachineUuid;
use keel_common::typed_uuid::VolumeUuid;
use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt;

/// Sequence number assigned to a command by the control plane node that
/// dispatches it
///
/// Sequence numbers are monotonic and unique per control plane node.
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
)]
#[serde(transparent)]
pub struct RequestSequence(u64);

impl RequestSequence {
    pub const fn new(value: u64) -> RequestSequence {
        RequestSequence(value)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> RequestSequence {
        RequestSequence(self.0 + 1)
    }
}

impl fmt::Display for RequestSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a command, derived from the kind of its payload
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
    strum::EnumString,
)]
pub enum CommandName {
    #[strum(serialize = "MigrateWithStorageCommand")]
    MigrateWithStorage,
    #[strum(serialize = "RollingMaintenanceCommand")]
    RollingMaintenance,
    #[strum(serialize = "CopyVolumeCommand")]
    CopyVolume,
}

/// Identifies one command (and its ledger record)
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
)]
pub struct CommandKey {
    pub request_sequence: RequestSequence,
    pub command_name: CommandName,
}

impl fmt::Display for CommandKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.request_sequence, self.command_name)
    }
}

/// An immutable request for a remote agent to perform an operation
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct Command {
    pub request_sequence: RequestSequence,
    pub payload: CommandPayload,
    /// whether this command must be serialized with other sequenced commands
    /// to the same agent rather than run concurrently
    pub execute_in_sequence: bool,
}

impl Command {
    pub fn new(
        request_sequence: RequestSequence,
        payload: CommandPayload,
    ) -> Command {
        let execute_in_sequence = payload.execute_in_sequence();
        Command { request_sequence, payload, execute_in_sequence }
    }

    pub fn name(&self) -> CommandName {
        self.payload.name()
    }

    pub fn key(&self) -> CommandKey {
        CommandKey {
            request_sequence: self.request_sequence,
            command_name: self.name(),
        }
    }
}

/// Operation-specific contents of a [`Command`]
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    MigrateWithStorage(MigrateWithStorageCommand),
    RollingMaintenance(RollingMaintenanceCommand),
    CopyVolume(CopyVolumeCommand),
}

impl CommandPayload {
    pub fn name(&self) -> CommandName {
        match self {
            CommandPayload::MigrateWithStorage(_) => {
                CommandName::MigrateWithStorage
            }
            CommandPayload::RollingMaintenance(_) => {
                CommandName::RollingMaintenance
            }
            CommandPayload::CopyVolume(_) => CommandName::CopyVolume,
        }
    }

    /// Default sequencing for this kind of command
    ///
    /// Maintenance hooks for one host must never overlap, and a live
    /// migration must not race another operation on the same host.
    pub fn execute_in_sequence(&self) -> bool {
        match self {
            CommandPayload::MigrateWithStorage(_)
            | CommandPayload::RollingMaintenance(_) => true,
            CommandPayload::CopyVolume(_) => false,
        }
    }

    /// Returns the virtual machine this command operates on, if any
    pub fn vm_id(&self) -> Option<VirtualMachineUuid> {
        match self {
            CommandPayload::MigrateWithStorage(c) => Some(c.vm_id),
            CommandPayload::RollingMaintenance(_)
            | CommandPayload::CopyVolume(_) => None,
        }
    }
}

/// Which agent-side mechanism performs a live migration with storage
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
    parse_display::Display,
)]
#[serde(rename_all = "snake_case")]
#[display(style = "snake_case")]
pub enum MigrationStrategy {
    /// the placement gate declined; some other component handles (or
    /// rejects) this migration
    CannotHandle,
    /// generic live migration that copies volumes between unmanaged pools
    UnmanagedLiveMigration,
    /// live migration between externally-provisioned (managed) pools
    ManagedLiveMigration,
}

/// One volume's move as part of a migration
#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct VolumeMigration {
    pub volume_id: VolumeUuid,
    pub source_pool: StoragePoolUuid,
    pub destination_pool: StoragePoolUuid,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct MigrateWithStorageCommand {
    pub vm_id: VirtualMachineUuid,
    pub source_host: HostUuid,
    pub destination_host: HostUuid,
    pub strategy: MigrationStrategy,
    pub volumes: Vec<VolumeMigration>,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct RollingMaintenanceCommand {
    pub stage: Stage,
    /// opaque operator-provided payload handed to the hook
    pub payload: String,
}

#[derive(Clone, Debug, Deserialize, Eq, JsonSchema, PartialEq, Serialize)]
pub struct CopyVolumeCommand {
    pub volume_id: VolumeUuid,
    pub source_pool: StoragePoolUuid,
    pub destination_pool: StoragePoolUuid,
}
