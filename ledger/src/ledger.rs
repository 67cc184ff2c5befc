// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command ledger service

use crate::store::CommandStore;
use crate::store::RecordUpdate;
use crate::store::UpdateCondition;
use crate::store::UpdateStatus;
use chrono::DateTime;
use chrono::Utc;
use keel_common::api::external::Error;
use keel_common::typed_uuid::ControlPlaneNodeUuid;
use keel_common::typed_uuid::HostUuid;
use keel_types::answer::Answer;
use keel_types::command::Command;
use keel_types::command::CommandKey;
use keel_types::command::CommandName;
use keel_types::command::CommandPayload;
use keel_types::command::RequestSequence;
use keel_types::record::AgentCommandReport;
use keel_types::record::CommandRecord;
use keel_types::record::CommandState;
use keel_types::record::Owner;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::Mutex;

/// States from which an agent's answer may still be recorded
const ANSWERABLE: &[CommandState] = &[
    CommandState::Created,
    CommandState::Reconciling,
    CommandState::Interrupted,
];

/// Held commands, with how many holds each one has
type HeldKeys = Arc<Mutex<BTreeMap<CommandKey, usize>>>;

/// Keeps the reconciler on this node away from a persisted command until the
/// dispatcher has handed it to its agent
///
/// The command is released when this is dropped.
#[derive(Debug)]
pub struct DeliveryHold {
    key: CommandKey,
    held: HeldKeys,
}

impl DeliveryHold {
    pub fn key(&self) -> CommandKey {
        self.key
    }
}

impl Drop for DeliveryHold {
    fn drop(&mut self) {
        let mut held =
            self.held.lock().unwrap_or_else(|poison| poison.into_inner());
        if let Some(count) = held.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                held.remove(&self.key);
            }
        }
    }
}

/// Records every command this node dispatches and tracks it to a terminal
/// state
///
/// A command must be persisted here before it is sent anywhere.  After that,
/// the dispatching node and the reconciler move the record along, always
/// through conditional updates.
pub struct CommandLedger {
    log: Logger,
    node_id: ControlPlaneNodeUuid,
    store: Arc<dyn CommandStore>,
    /// persisted commands that are not yet in their agent's hands
    held: HeldKeys,
}

impl CommandLedger {
    pub fn new(
        log: &Logger,
        node_id: ControlPlaneNodeUuid,
        store: Arc<dyn CommandStore>,
    ) -> CommandLedger {
        CommandLedger {
            log: log.new(o!(
                "component" => "CommandLedger",
                "node_id" => node_id.to_string(),
            )),
            node_id,
            store,
            held: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Returns the id of the control plane node that owns records created
    /// through this ledger
    pub fn node_id(&self) -> ControlPlaneNodeUuid {
        self.node_id
    }

    /// Record `commands` for `host_id` in state `Created`
    ///
    /// All of the records are written or none are.  The caller must not send
    /// any of these commands unless this succeeds.
    pub async fn persist(
        &self,
        host_id: HostUuid,
        request_sequence: RequestSequence,
        commands: Vec<CommandPayload>,
    ) -> Result<Vec<CommandRecord>, Error> {
        let records = self.new_records(host_id, request_sequence, commands);
        self.insert(host_id, request_sequence, records).await
    }

    /// Like [`CommandLedger::persist`], but also hold each command back from
    /// reconciliation until its [`DeliveryHold`] is dropped
    ///
    /// The holds are taken before anything is written, so there is no moment
    /// at which the reconciler on this node can see an unheld record.
    pub async fn persist_for_delivery(
        &self,
        host_id: HostUuid,
        request_sequence: RequestSequence,
        commands: Vec<CommandPayload>,
    ) -> Result<Vec<(CommandRecord, DeliveryHold)>, Error> {
        let records = self.new_records(host_id, request_sequence, commands);
        let holds: Vec<_> =
            records.iter().map(|r| self.hold(r.key())).collect();
        let records = self.insert(host_id, request_sequence, records).await?;
        Ok(records.into_iter().zip(holds).collect())
    }

    fn new_records(
        &self,
        host_id: HostUuid,
        request_sequence: RequestSequence,
        commands: Vec<CommandPayload>,
    ) -> Vec<CommandRecord> {
        let now = Utc::now();
        commands
            .into_iter()
            .map(|payload| {
                CommandRecord::new(
                    Command::new(request_sequence, payload),
                    host_id,
                    self.node_id,
                    now,
                )
            })
            .collect()
    }

    async fn insert(
        &self,
        host_id: HostUuid,
        request_sequence: RequestSequence,
        records: Vec<CommandRecord>,
    ) -> Result<Vec<CommandRecord>, Error> {
        self.store.insert_batch(records.clone()).await.map_err(|error| {
            error.internal_context(format!(
                "persisting commands for request {}",
                request_sequence
            ))
        })?;
        debug!(
            self.log,
            "persisted commands";
            "host_id" => %host_id,
            "request_sequence" => %request_sequence,
            "count" => records.len(),
        );
        Ok(records)
    }

    fn hold(&self, key: CommandKey) -> DeliveryHold {
        let mut held =
            self.held.lock().unwrap_or_else(|poison| poison.into_inner());
        *held.entry(key).or_insert(0) += 1;
        DeliveryHold { key, held: Arc::clone(&self.held) }
    }

    /// Returns the commands currently held back from reconciliation
    pub fn held_for_delivery(&self) -> BTreeSet<CommandKey> {
        let held =
            self.held.lock().unwrap_or_else(|poison| poison.into_inner());
        held.keys().copied().collect()
    }

    /// Claim a `Created` command for sending
    ///
    /// Returns `false` if the record has already moved on (e.g., it was
    /// interrupted because its host was removed), in which case the command
    /// must not be sent.  A successful claim bumps the record's generation,
    /// so a reconciler working from an earlier read can no longer resolve
    /// it.
    pub async fn claim_for_delivery(
        &self,
        key: CommandKey,
    ) -> Result<bool, Error> {
        let status = self
            .store
            .update_if(
                key,
                UpdateCondition::State(&[CommandState::Created]),
                &RecordUpdate::default(),
            )
            .await?;
        Ok(status == UpdateStatus::Updated)
    }

    /// Record an agent's answer
    ///
    /// Returns `false`, without error, if there is no live record that can
    /// still accept an answer: the answer is a duplicate or arrived after the
    /// record was resolved some other way.
    pub async fn update_on_answer(
        &self,
        request_sequence: RequestSequence,
        command_name: CommandName,
        answer: Answer,
        new_state_by_management: CommandState,
        new_state_by_agent: CommandState,
    ) -> Result<bool, Error> {
        let key = CommandKey { request_sequence, command_name };
        let update = RecordUpdate {
            state_by_management: Some(new_state_by_management),
            state_by_agent: Some(new_state_by_agent),
            answer: Some(answer),
            reconcile_attempts: None,
        };
        match self
            .store
            .update_if(key, UpdateCondition::State(ANSWERABLE), &update)
            .await
        {
            Ok(UpdateStatus::Updated) => {
                debug!(
                    self.log,
                    "recorded answer";
                    "command" => %key,
                    "state_by_management" => %new_state_by_management,
                );
                Ok(true)
            }
            Ok(UpdateStatus::NotUpdatedButExists) => {
                info!(
                    self.log,
                    "ignoring late or duplicate answer";
                    "command" => %key,
                );
                Ok(false)
            }
            Err(Error::ObjectNotFound { .. }) => {
                warn!(
                    self.log,
                    "answer for unknown command";
                    "command" => %key,
                );
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    /// Record each answer against the command it answers, returning how many
    /// records were updated
    pub async fn process_answers(
        &self,
        request_sequence: RequestSequence,
        answers: Vec<(CommandName, Answer)>,
    ) -> Result<usize, Error> {
        let mut updated = 0;
        for (command_name, answer) in answers {
            let state = answer.terminal_state();
            if self
                .update_on_answer(
                    request_sequence,
                    command_name,
                    answer,
                    state,
                    state,
                )
                .await?
            {
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Note that the agent accepted a command and is running it
    pub async fn mark_accepted(&self, key: CommandKey) -> Result<bool, Error> {
        let update = RecordUpdate {
            state_by_management: Some(CommandState::Reconciling),
            state_by_agent: Some(CommandState::Started),
            ..Default::default()
        };
        let status = self
            .store
            .update_if(
                key,
                UpdateCondition::State(&[CommandState::Created]),
                &update,
            )
            .await?;
        Ok(status == UpdateStatus::Updated)
    }

    /// Note that a command could not be delivered at all
    ///
    /// The agent never saw the command, so only the management side moves.
    pub async fn mark_undelivered(
        &self,
        key: CommandKey,
        reason: &str,
    ) -> Result<bool, Error> {
        let update = RecordUpdate {
            state_by_management: Some(CommandState::Failed),
            answer: Some(Answer::failure(reason)),
            ..Default::default()
        };
        let status = self
            .store
            .update_if(
                key,
                UpdateCondition::State(&[CommandState::Created]),
                &update,
            )
            .await?;
        Ok(status == UpdateStatus::Updated)
    }

    /// Apply state reported by an agent, typically from its heartbeat
    ///
    /// A terminal state that comes with an answer resolves the record.
    /// Anything else only updates what we know about the agent's side.
    pub async fn record_agent_report(
        &self,
        report: AgentCommandReport,
    ) -> Result<bool, Error> {
        let record = self
            .store
            .find(report.key)
            .await?
            .ok_or_else(|| {
                Error::invalid_request(&format!(
                    "agent reported unknown command {}",
                    report.key
                ))
            })?;
        if record.host_id != report.host_id {
            return Err(Error::invalid_request(&format!(
                "command {} was sent to host {}, not {}",
                report.key, record.host_id, report.host_id
            )));
        }

        match (report.state.is_terminal(), report.answer) {
            (true, Some(answer)) => {
                self.update_on_answer(
                    report.key.request_sequence,
                    report.key.command_name,
                    answer,
                    report.state,
                    report.state,
                )
                .await
            }
            _ => {
                let update = RecordUpdate {
                    state_by_agent: Some(report.state),
                    ..Default::default()
                };
                let status = self
                    .store
                    .update_if(
                        report.key,
                        UpdateCondition::State(ANSWERABLE),
                        &update,
                    )
                    .await?;
                Ok(status == UpdateStatus::Updated)
            }
        }
    }

    pub async fn find_by_state(
        &self,
        states: &[CommandState],
    ) -> Result<Vec<CommandRecord>, Error> {
        self.store.find_by_state(states).await
    }

    pub async fn find(
        &self,
        key: CommandKey,
    ) -> Result<Option<CommandRecord>, Error> {
        self.store.find(key).await
    }

    /// Mark every non-terminal record owned by `owner` as `Interrupted`
    ///
    /// This is one bulk update.  Records in any other state, and records
    /// owned by anybody else, are untouched.
    pub async fn mark_interrupted_by_owner(
        &self,
        owner: Owner,
    ) -> Result<usize, Error> {
        let count = self
            .store
            .update_owned_if_state(
                owner,
                CommandState::NON_TERMINAL,
                &RecordUpdate::management(CommandState::Interrupted),
            )
            .await?;
        if count > 0 {
            info!(
                self.log,
                "marked commands interrupted";
                "owner" => %owner,
                "count" => count,
            );
        }
        Ok(count)
    }

    /// Apply `update` to `record` if nobody else has changed it since it was
    /// read
    ///
    /// Of any number of concurrent resolvers working from the same read,
    /// exactly one sees [`UpdateStatus::Updated`].
    pub async fn resolve(
        &self,
        record: &CommandRecord,
        update: RecordUpdate,
    ) -> Result<UpdateStatus, Error> {
        self.store
            .update_if(
                record.key(),
                UpdateCondition::Generation(record.generation),
                &update,
            )
            .await
    }

    /// Operator resolution of an `Interrupted` record
    ///
    /// `outcome` must be `Done` or `Failed`.
    pub async fn resolve_interrupted(
        &self,
        key: CommandKey,
        outcome: CommandState,
        details: &str,
    ) -> Result<(), Error> {
        let answer = match outcome {
            CommandState::Done => Answer::success(details),
            CommandState::Failed => Answer::failure(details),
            _ => {
                return Err(Error::invalid_value(
                    "outcome",
                    &format!("must be done or failed, not {}", outcome),
                ));
            }
        };
        let status = self
            .store
            .update_if(
                key,
                UpdateCondition::State(&[CommandState::Interrupted]),
                &RecordUpdate::answered(answer),
            )
            .await?;
        match status {
            UpdateStatus::Updated => {
                info!(
                    self.log,
                    "operator resolved interrupted command";
                    "command" => %key,
                    "outcome" => %outcome,
                );
                Ok(())
            }
            UpdateStatus::NotUpdatedButExists => Err(Error::conflict(
                &format!("command {} is not interrupted", key),
            )),
        }
    }

    pub async fn list(
        &self,
        include_removed: bool,
    ) -> Result<Vec<CommandRecord>, Error> {
        self.store.list(include_removed).await
    }

    /// Delete tombstoned records removed before `before`, at most
    /// `batch_size` of them (`None`: all of them)
    pub async fn purge_removed(
        &self,
        before: DateTime<Utc>,
        batch_size: Option<usize>,
    ) -> Result<usize, Error> {
        let count = self.store.purge_removed(before, batch_size).await?;
        debug!(
            self.log,
            "purged removed command records";
            "before" => %before,
            "count" => count,
        );
        Ok(count)
    }
}
