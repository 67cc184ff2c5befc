// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interface between a control plane node and the agents running on hosts
//!
//! The control plane only ever talks to agents through [`AgentLink`].  Real
//! implementations are hypervisor-specific and live outside this repository.
//! [`sim::SimAgent`] is an in-process implementation used for development and
//! by the test suite.  [`hook::HookExecutor`] is the agent-side runner for
//! rolling maintenance hooks.

use futures::future::BoxFuture;
use keel_common::api::external::Error;
use keel_common::typed_uuid::HostUuid;
use keel_types::answer::AgentCommandStatus;
use keel_types::answer::Answer;
use keel_types::command::Command;
use keel_types::command::CommandKey;

pub mod hook;
pub mod sim;

/// Resolves with the agent's answer to a command it has accepted
pub type PendingAnswer = BoxFuture<'static, Result<Answer, AgentLinkError>>;

/// A bidirectional channel between this control plane node and the agents on
/// remote hosts
#[async_trait::async_trait]
pub trait AgentLink: Send + Sync {
    /// Deliver `command` to the agent on `host`
    ///
    /// This resolves once the agent has accepted the command.  The returned
    /// [`PendingAnswer`] resolves when the agent answers, or with an error if
    /// the link drops first.  A command whose delivery fails with
    /// [`AgentLinkError::Unreachable`] was never accepted.
    async fn submit(
        &self,
        host: HostUuid,
        command: Command,
    ) -> Result<PendingAnswer, AgentLinkError>;

    /// Ask the agent on `host` what it knows about a previously-submitted
    /// command
    async fn query_status(
        &self,
        host: HostUuid,
        key: CommandKey,
    ) -> Result<AgentCommandStatus, AgentLinkError>;
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum AgentLinkError {
    /// the command was not delivered
    #[error("agent on host {host} is unreachable: {message}")]
    Unreachable { host: HostUuid, message: String },
    /// the command was accepted, but the link dropped before an answer
    /// arrived
    #[error("link to host {host} dropped before the agent answered")]
    Disconnected { host: HostUuid },
    #[error("timed out waiting for host {host}")]
    Timeout { host: HostUuid },
}

impl AgentLinkError {
    /// Returns whether the operation may succeed if retried later
    ///
    /// Every link failure is transient from the control plane's perspective:
    /// hosts may be partitioned for a while and come back.
    pub fn is_transient(&self) -> bool {
        match self {
            AgentLinkError::Unreachable { .. }
            | AgentLinkError::Disconnected { .. }
            | AgentLinkError::Timeout { .. } => true,
        }
    }

    /// Returns whether the agent accepted the command before this error
    pub fn accepted(&self) -> bool {
        !matches!(self, AgentLinkError::Unreachable { .. })
    }
}

impl From<AgentLinkError> for Error {
    fn from(error: AgentLinkError) -> Self {
        Error::unavail(&error.to_string())
    }
}
