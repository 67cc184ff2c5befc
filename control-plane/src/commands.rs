// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator access to the command ledger and background tasks

use crate::AdminResponse;
use crate::ControlPlane;
use keel_common::api::external::Error;
use keel_common::api::external::LookupType;
use keel_common::api::external::ResourceType;
use keel_types::command::CommandKey;
use keel_types::record::AgentCommandReport;
use keel_types::record::CommandRecord;
use keel_types::record::CommandState;
use keel_types::task_status::BackgroundTask as BackgroundTaskView;

impl ControlPlane {
    /// Resolve a command whose owner went away before its outcome was known
    ///
    /// `outcome` must be `Done` or `Failed`.
    pub async fn resolve_interrupted_command(
        &self,
        key: CommandKey,
        outcome: CommandState,
        details: &str,
    ) -> Result<AdminResponse, Error> {
        self.ledger.resolve_interrupted(key, outcome, details).await?;
        Ok(AdminResponse::ok(format!(
            "command {} resolved as {}",
            key, outcome
        )))
    }

    pub async fn list_commands(
        &self,
        include_removed: bool,
    ) -> Result<Vec<CommandRecord>, Error> {
        self.ledger.list(include_removed).await
    }

    /// Apply what an agent reported about one of its commands
    pub async fn agent_report(
        &self,
        report: AgentCommandReport,
    ) -> Result<bool, Error> {
        self.ledger.record_agent_report(report).await
    }

    pub fn background_tasks(&self) -> Vec<BackgroundTaskView> {
        self.background.summaries()
    }

    /// Activate the named background task now
    pub fn activate_background_task(&self, name: &str) -> Result<(), Error> {
        let task = self.background.task(name).ok_or_else(|| {
            LookupType::from(name).into_not_found(ResourceType::BackgroundTask)
        })?;
        self.background.activate(task);
        Ok(())
    }
}
