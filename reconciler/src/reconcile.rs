// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background task that resolves commands whose outcome was never recorded
//!
//! A command can be left unresolved if the link to its host dropped after the
//! agent accepted it, if the dispatching node crashed, or if the host itself
//! went away.  Each activation loads the records that have been unresolved for
//! longer than the grace period and works out what happened to them.

use crate::driver::BackgroundTask;
use crate::membership::HostStatus;
use crate::membership::Membership;
use crate::membership::NodeStatus;
use crate::task_set::ParallelTaskSet;
use chrono::TimeDelta;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use keel_agent_link::AgentLink;
use keel_agent_link::AgentLinkError;
use keel_common::backoff::agent_query_policy;
use keel_common::retry_until_known_result;
use keel_common::typed_uuid::ControlPlaneNodeUuid;
use keel_common::typed_uuid::HostUuid;
use keel_config::ReconcileConfig;
use keel_ledger::CommandLedger;
use keel_ledger::RecordUpdate;
use keel_ledger::UpdateStatus;
use keel_types::answer::AgentCommandStatus;
use keel_types::answer::Answer;
use keel_types::answer::AnswerKind;
use keel_types::record::CommandRecord;
use keel_types::record::CommandState;
use keel_types::record::Owner;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Summary of one reconciliation cycle, reported as the task's status
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ReconcileStatus {
    /// unresolved records older than the grace period
    pub loaded: usize,
    /// records bulk-interrupted because their owning node is gone
    pub interrupted_by_owner: usize,
    /// records bulk-interrupted because their host was removed
    pub interrupted_by_host: usize,
    /// records that reached `Done` or `Failed` this cycle
    pub resolved: usize,
    /// records the agent is still working on
    pub still_running: usize,
    /// records whose agent could not be reached
    pub unreachable: usize,
    /// records that ran out of attempts and were marked `Interrupted`
    pub surfaced_interrupted: usize,
    /// records somebody else updated while we were looking at them
    pub lost_race: usize,
    /// records owned by some other live (or unknown) node
    pub skipped: usize,
    /// records this node has persisted but not yet handed to their agent
    pub awaiting_delivery: usize,
    pub errors: Vec<String>,
}

/// What happened to one record
#[derive(Debug)]
enum Check {
    Resolved,
    StillRunning,
    Unreachable,
    SurfacedInterrupted,
    LostRace,
    Error(String),
}

/// Resolves command records that nobody is waiting on any more
pub struct CommandReconciler {
    node_id: ControlPlaneNodeUuid,
    ledger: Arc<CommandLedger>,
    link: Arc<dyn AgentLink>,
    membership: Arc<dyn Membership>,
    config: ReconcileConfig,
}

impl CommandReconciler {
    pub fn new(
        ledger: Arc<CommandLedger>,
        link: Arc<dyn AgentLink>,
        membership: Arc<dyn Membership>,
        config: ReconcileConfig,
    ) -> CommandReconciler {
        CommandReconciler {
            node_id: ledger.node_id(),
            ledger,
            link,
            membership,
            config,
        }
    }

    /// Run one reconciliation cycle
    ///
    /// Failures are recorded in the returned status.  Records that could not
    /// be dealt with are left for the next cycle.
    pub async fn reconcile_once(&self, log: &Logger) -> ReconcileStatus {
        let mut status = ReconcileStatus::default();

        let mut states = CommandState::NON_TERMINAL.to_vec();
        if self.config.adopt_interrupted {
            states.push(CommandState::Interrupted);
        }
        let records = match self.ledger.find_by_state(&states).await {
            Ok(records) => records,
            Err(error) => {
                warn!(
                    log,
                    "failed to load unresolved commands";
                    InlineErrorChain::new(&error),
                );
                status.errors.push(error.to_string());
                return status;
            }
        };

        let Some(cutoff) = TimeDelta::from_std(self.config.grace_period_secs)
            .ok()
            .and_then(|grace| Utc::now().checked_sub_signed(grace))
        else {
            return status;
        };
        let records: Vec<_> = records
            .into_iter()
            .filter(|r| r.time_created <= cutoff)
            .collect();
        status.loaded = records.len();
        if records.is_empty() {
            return status;
        }

        // Taken after loading: a command is held before its record is
        // written, so every held record we loaded shows up here.
        let held = self.ledger.held_for_delivery();

        let dead_owners =
            self.interrupt_dead_owners(log, &records, &mut status).await;
        let (removed_hosts, disconnected_hosts) =
            self.interrupt_removed_hosts(log, &records, &mut status).await;

        let mut checks =
            ParallelTaskSet::new_with_parallelism(self.config.workers);
        for record in records {
            let adopted =
                record.state_by_management == CommandState::Interrupted;
            if removed_hosts.contains(&record.host_id)
                || (!adopted && dead_owners.contains(&record.owner))
            {
                continue;
            }
            if !adopted && record.owner != self.node_id {
                status.skipped += 1;
                continue;
            }
            // The agent may not have seen it yet, so asking it now proves
            // nothing.
            if held.contains(&record.key()) {
                status.awaiting_delivery += 1;
                continue;
            }
            let reachable = !disconnected_hosts.contains(&record.host_id);
            checks.spawn(self.check_record(log, record, reachable));
        }

        while let Some(result) = checks.join_next().await {
            match result {
                Ok(Check::Resolved) => status.resolved += 1,
                Ok(Check::StillRunning) => status.still_running += 1,
                Ok(Check::Unreachable) => status.unreachable += 1,
                Ok(Check::SurfacedInterrupted) => {
                    status.surfaced_interrupted += 1
                }
                Ok(Check::LostRace) => status.lost_race += 1,
                Ok(Check::Error(message)) => status.errors.push(message),
                Err(error) => {
                    warn!(
                        log,
                        "reconciliation worker failed";
                        InlineErrorChain::new(&error),
                    );
                    status.errors.push(error.to_string());
                }
            }
        }

        status
    }

    /// Interrupt everything owned by nodes that are confirmed gone, with one
    /// bulk update per node
    async fn interrupt_dead_owners(
        &self,
        log: &Logger,
        records: &[CommandRecord],
        status: &mut ReconcileStatus,
    ) -> BTreeSet<ControlPlaneNodeUuid> {
        let owners: BTreeSet<_> = records
            .iter()
            .filter(|r| r.state_by_management != CommandState::Interrupted)
            .map(|r| r.owner)
            .filter(|owner| *owner != self.node_id)
            .collect();

        let mut dead = BTreeSet::new();
        for owner in owners {
            if self.membership.node_status(owner).await != NodeStatus::Down {
                continue;
            }
            dead.insert(owner);
            match self
                .ledger
                .mark_interrupted_by_owner(Owner::ControlPlane(owner))
                .await
            {
                Ok(count) => status.interrupted_by_owner += count,
                Err(error) => {
                    warn!(
                        log,
                        "failed to interrupt commands of dead node";
                        "owner" => %owner,
                        InlineErrorChain::new(&error),
                    );
                    status.errors.push(error.to_string());
                }
            }
        }
        dead
    }

    /// Interrupt everything sent to hosts that were removed, with one bulk
    /// update per host
    ///
    /// Returns the removed hosts and the hosts that are currently
    /// disconnected.
    async fn interrupt_removed_hosts(
        &self,
        log: &Logger,
        records: &[CommandRecord],
        status: &mut ReconcileStatus,
    ) -> (BTreeSet<HostUuid>, BTreeSet<HostUuid>) {
        let hosts: BTreeSet<_> = records.iter().map(|r| r.host_id).collect();
        let mut by_status: BTreeMap<HostUuid, HostStatus> = BTreeMap::new();
        for host in hosts {
            by_status.insert(host, self.membership.host_status(host).await);
        }

        let mut removed = BTreeSet::new();
        let mut disconnected = BTreeSet::new();
        for (host, host_status) in by_status {
            match host_status {
                HostStatus::Up => (),
                HostStatus::Disconnected => {
                    disconnected.insert(host);
                }
                HostStatus::Removed => {
                    removed.insert(host);
                    match self
                        .ledger
                        .mark_interrupted_by_owner(Owner::Host(host))
                        .await
                    {
                        Ok(count) => status.interrupted_by_host += count,
                        Err(error) => {
                            warn!(
                                log,
                                "failed to interrupt commands of removed host";
                                "host_id" => %host,
                                InlineErrorChain::new(&error),
                            );
                            status.errors.push(error.to_string());
                        }
                    }
                }
            }
        }
        (removed, disconnected)
    }

    fn check_record(
        &self,
        log: &Logger,
        record: CommandRecord,
        reachable: bool,
    ) -> impl Future<Output = Check> + Send + 'static {
        let log = log.new(o!(
            "command" => record.key().to_string(),
            "host_id" => record.host_id.to_string(),
        ));
        let ledger = Arc::clone(&self.ledger);
        let link = Arc::clone(&self.link);
        let query_timeout = self.config.query_timeout_secs;
        let query_retries = self.config.query_retries;
        let max_attempts = self.config.max_attempts;

        async move {
            let agent_status = if reachable {
                query_agent(
                    &log,
                    link.as_ref(),
                    &record,
                    query_timeout,
                    query_retries,
                )
                .await
            } else {
                Err(AgentLinkError::Unreachable {
                    host: record.host_id,
                    message: String::from("host is disconnected"),
                })
            };

            let adopted =
                record.state_by_management == CommandState::Interrupted;
            let (update, on_success) = match agent_status {
                Ok(AgentCommandStatus::Completed { answer }) => {
                    if is_inconclusive(&answer) {
                        info!(log, "agent answer is inconclusive");
                        match record.state_by_management {
                            CommandState::Created => (
                                RecordUpdate {
                                    state_by_agent: Some(CommandState::Started),
                                    ..RecordUpdate::management(
                                        CommandState::Reconciling,
                                    )
                                },
                                Check::StillRunning,
                            ),
                            _ => return Check::StillRunning,
                        }
                    } else {
                        (RecordUpdate::answered(answer), Check::Resolved)
                    }
                }
                Ok(AgentCommandStatus::Running) => {
                    match (record.state_by_management, record.state_by_agent) {
                        (CommandState::Created, _) => (
                            RecordUpdate {
                                state_by_agent: Some(CommandState::Started),
                                reconcile_attempts: Some(0),
                                ..RecordUpdate::management(
                                    CommandState::Reconciling,
                                )
                            },
                            Check::StillRunning,
                        ),
                        (CommandState::Reconciling, agent)
                            if agent != Some(CommandState::Started)
                                || record.reconcile_attempts > 0 =>
                        {
                            (
                                RecordUpdate {
                                    state_by_agent: Some(CommandState::Started),
                                    reconcile_attempts: Some(0),
                                    ..Default::default()
                                },
                                Check::StillRunning,
                            )
                        }
                        _ => return Check::StillRunning,
                    }
                }
                Ok(AgentCommandStatus::UnknownCommand) => {
                    info!(log, "agent does not know about command");
                    (
                        RecordUpdate::answered(Answer::failure(
                            "agent has no record of this command",
                        )),
                        Check::Resolved,
                    )
                }
                Err(error) if adopted => {
                    debug!(
                        log,
                        "could not reach agent for interrupted command";
                        InlineErrorChain::new(&error),
                    );
                    return Check::Unreachable;
                }
                Err(error) => {
                    let attempts = record.reconcile_attempts.saturating_add(1);
                    if attempts > max_attempts {
                        warn!(
                            log,
                            "giving up on command after repeated failures to \
                             reach its agent";
                            "attempts" => attempts,
                            InlineErrorChain::new(&error),
                        );
                        (
                            RecordUpdate {
                                reconcile_attempts: Some(attempts),
                                ..RecordUpdate::management(
                                    CommandState::Interrupted,
                                )
                            },
                            Check::SurfacedInterrupted,
                        )
                    } else {
                        info!(
                            log,
                            "could not reach agent";
                            "attempts" => attempts,
                            InlineErrorChain::new(&error),
                        );
                        (
                            RecordUpdate {
                                reconcile_attempts: Some(attempts),
                                ..RecordUpdate::management(
                                    CommandState::Reconciling,
                                )
                            },
                            Check::Unreachable,
                        )
                    }
                }
            };

            match ledger.resolve(&record, update).await {
                Ok(UpdateStatus::Updated) => {
                    debug!(log, "updated command"; "check" => ?on_success);
                    on_success
                }
                Ok(UpdateStatus::NotUpdatedButExists) => {
                    debug!(log, "command changed underneath us");
                    Check::LostRace
                }
                Err(error) => {
                    warn!(
                        log,
                        "failed to update command";
                        InlineErrorChain::new(&error),
                    );
                    Check::Error(error.to_string())
                }
            }
        }
    }
}

/// Ask the agent about `record`, with a timeout on each query and a bounded
/// number of tries
async fn query_agent(
    log: &Logger,
    link: &dyn AgentLink,
    record: &CommandRecord,
    query_timeout: Duration,
    query_retries: u32,
) -> Result<AgentCommandStatus, AgentLinkError> {
    let host = record.host_id;
    let key = record.key();
    retry_until_known_result(
        log,
        agent_query_policy(query_retries),
        AgentLinkError::is_transient,
        || async move {
            match tokio::time::timeout(
                query_timeout,
                link.query_status(host, key),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(AgentLinkError::Timeout { host }),
            }
        },
    )
    .await
}

/// A migration answer that doesn't say where the VM ended up doesn't resolve
/// anything
fn is_inconclusive(answer: &Answer) -> bool {
    match &answer.kind {
        AnswerKind::MigrateWithStorage(migrate) => !migrate.is_conclusive(),
        AnswerKind::Generic | AnswerKind::RollingMaintenance(_) => false,
    }
}

impl BackgroundTask for CommandReconciler {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value> {
        async move {
            let status = self.reconcile_once(log).await;
            if status != ReconcileStatus::default() {
                info!(
                    log,
                    "reconciliation cycle finished";
                    "loaded" => status.loaded,
                    "resolved" => status.resolved,
                    "awaiting_delivery" => status.awaiting_delivery,
                    "interrupted" => status.interrupted_by_owner
                        + status.interrupted_by_host
                        + status.surfaced_interrupted,
                    "errors" => status.errors.len(),
                );
            }
            match serde_json::to_value(&status) {
                Ok(value) => value,
                Err(error) => serde_json::json!({
                    "error": format!("failed to serialize status: {error}"),
                }),
            }
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::membership::HeartbeatMembership;
    use keel_agent_link::sim::SimAgent;
    use keel_agent_link::sim::SimBehavior;
    use keel_common::typed_uuid::StoragePoolUuid;
    use keel_common::typed_uuid::VirtualMachineUuid;
    use keel_common::typed_uuid::VolumeUuid;
    use assert_matches::assert_matches;
    use keel_ledger::CommandOutcome;
    use keel_ledger::CommandStore;
    use keel_ledger::Dispatcher;
    use keel_ledger::LedgerStore;
    use keel_test_utils::dev::poll::wait_for_condition;
    use keel_test_utils::dev::poll::CondCheckError;
    use keel_test_utils::dev::test_setup_log;
    use keel_test_utils::dev::LogContext;
    use keel_types::answer::HostVmView;
    use keel_types::answer::MigrateAnswer;
    use keel_types::command::Command;
    use keel_types::command::CommandPayload;
    use keel_types::command::CopyVolumeCommand;
    use keel_types::command::MigrateWithStorageCommand;
    use keel_types::command::MigrationStrategy;
    use keel_types::command::RequestSequence;
    use keel_types::command::RollingMaintenanceCommand;
    use keel_types::maintenance::Stage;
    use std::convert::Infallible;
    use tokio::sync::Notify;

    struct Harness {
        node_id: ControlPlaneNodeUuid,
        store: Arc<LedgerStore>,
        ledger: Arc<CommandLedger>,
        sim: Arc<SimAgent>,
        membership: Arc<HeartbeatMembership>,
    }

    impl Harness {
        fn new(logctx: &LogContext) -> Harness {
            let log = &logctx.log;
            let node_id = ControlPlaneNodeUuid::new_v4();
            let store = Arc::new(LedgerStore::new_in_memory(log));
            let ledger =
                Arc::new(CommandLedger::new(log, node_id, store.clone()));
            let sim = Arc::new(SimAgent::new(log));
            let membership = Arc::new(HeartbeatMembership::new(
                node_id,
                Duration::from_secs(60),
            ));
            Harness { node_id, store, ledger, sim, membership }
        }

        fn reconciler(&self, config: ReconcileConfig) -> CommandReconciler {
            CommandReconciler::new(
                self.ledger.clone(),
                self.sim.clone(),
                self.membership.clone(),
                config,
            )
        }

        /// Insert a record that is well past the grace period
        async fn insert_old(
            &self,
            seq: u64,
            host_id: HostUuid,
            owner: ControlPlaneNodeUuid,
            payload: CommandPayload,
        ) -> CommandRecord {
            let created = Utc::now() - TimeDelta::hours(1);
            let record = CommandRecord::new(
                Command::new(RequestSequence::new(seq), payload),
                host_id,
                owner,
                created,
            );
            self.store.insert_batch(vec![record.clone()]).await.unwrap();
            record
        }

        async fn state_of(&self, record: &CommandRecord) -> CommandRecord {
            self.store.find(record.key()).await.unwrap().unwrap()
        }
    }

    fn copy_payload() -> CommandPayload {
        CommandPayload::CopyVolume(CopyVolumeCommand {
            volume_id: VolumeUuid::new_v4(),
            source_pool: StoragePoolUuid::new_v4(),
            destination_pool: StoragePoolUuid::new_v4(),
        })
    }

    fn config() -> ReconcileConfig {
        ReconcileConfig {
            workers: 4,
            query_timeout_secs: Duration::from_secs(5),
            query_retries: 1,
            max_attempts: 2,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reconcile_resolves_from_agent_state() {
        let logctx = test_setup_log("test_reconcile_resolves_from_agent_state");
        let h = Harness::new(&logctx);
        let host = HostUuid::new_v4();
        h.sim.add_host(host);

        // The agent finished this one while nobody was listening.
        let finished = h.insert_old(1, host, h.node_id, copy_payload()).await;
        h.sim.complete_offline(host, finished.key(), Answer::success("copied"));

        // The agent never heard of this one.
        let unknown = h.insert_old(2, host, h.node_id, copy_payload()).await;

        // This one is still running on the agent.
        let release = Arc::new(Notify::new());
        h.sim.script(host, SimBehavior::Hold(release.clone()));
        let running = h.insert_old(3, host, h.node_id, copy_payload()).await;
        let _pending =
            h.sim.submit(host, running.command.clone()).await.unwrap();

        // Too young to touch.
        let young = CommandRecord::new(
            Command::new(RequestSequence::new(4), copy_payload()),
            host,
            h.node_id,
            Utc::now(),
        );
        h.store.insert_batch(vec![young.clone()]).await.unwrap();

        let reconciler = h.reconciler(config());
        let status = reconciler.reconcile_once(&logctx.log).await;
        assert_eq!(status.loaded, 3);
        assert_eq!(status.resolved, 2);
        assert_eq!(status.still_running, 1);
        assert!(status.errors.is_empty());

        let record = h.state_of(&finished).await;
        assert_eq!(record.state_by_management, CommandState::Done);
        assert!(record.is_removed());
        assert_eq!(record.answer.unwrap().details, "copied");

        let record = h.state_of(&unknown).await;
        assert_eq!(record.state_by_management, CommandState::Failed);
        assert!(record.is_removed());

        let record = h.state_of(&running).await;
        assert_eq!(record.state_by_management, CommandState::Reconciling);
        assert_eq!(record.state_by_agent, Some(CommandState::Started));

        let record = h.state_of(&young).await;
        assert_eq!(record.state_by_management, CommandState::Created);
        assert_eq!(h.sim.status_queries(host), 3);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reconcile_unreachable_surfaces_interrupted() {
        let logctx =
            test_setup_log("test_reconcile_unreachable_surfaces_interrupted");
        let h = Harness::new(&logctx);
        let host = HostUuid::new_v4();
        h.sim.add_host(host);
        h.sim.set_reachable(host, false);
        let record = h.insert_old(1, host, h.node_id, copy_payload()).await;

        let reconciler = h.reconciler(config());
        for attempt in 1..=2 {
            let status = reconciler.reconcile_once(&logctx.log).await;
            assert_eq!(status.unreachable, 1);
            let found = h.state_of(&record).await;
            assert_eq!(found.state_by_management, CommandState::Reconciling);
            assert_eq!(found.reconcile_attempts, attempt);
        }

        let status = reconciler.reconcile_once(&logctx.log).await;
        assert_eq!(status.surfaced_interrupted, 1);
        let found = h.state_of(&record).await;
        assert_eq!(found.state_by_management, CommandState::Interrupted);
        assert!(!found.is_removed());

        // Interrupted records are left alone unless adoption is enabled.
        let status = reconciler.reconcile_once(&logctx.log).await;
        assert_eq!(status.loaded, 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reconcile_dead_owner_and_removed_host() {
        let logctx =
            test_setup_log("test_reconcile_dead_owner_and_removed_host");
        let h = Harness::new(&logctx);
        let host = HostUuid::new_v4();
        let removed_host = HostUuid::new_v4();
        h.sim.add_host(host);
        h.sim.add_host(removed_host);
        let dead = ControlPlaneNodeUuid::new_v4();
        let alive = ControlPlaneNodeUuid::new_v4();
        h.membership.heartbeat(alive).await;
        h.membership.node_departed(dead).await;
        h.membership.set_host_status(removed_host, HostStatus::Removed).await;

        let dead_1 = h.insert_old(1, host, dead, copy_payload()).await;
        let dead_2 = h.insert_old(2, host, dead, copy_payload()).await;
        let other = h.insert_old(3, host, alive, copy_payload()).await;
        let on_removed =
            h.insert_old(4, removed_host, h.node_id, copy_payload()).await;

        let reconciler = h.reconciler(config());
        let status = reconciler.reconcile_once(&logctx.log).await;
        assert_eq!(status.interrupted_by_owner, 2);
        assert_eq!(status.interrupted_by_host, 1);
        assert_eq!(status.skipped, 1);
        assert_eq!(status.resolved, 0);

        for record in [&dead_1, &dead_2, &on_removed] {
            let found = h.state_of(record).await;
            assert_eq!(found.state_by_management, CommandState::Interrupted);
        }
        let found = h.state_of(&other).await;
        assert_eq!(found.state_by_management, CommandState::Created);

        // Nothing was asked of the agents: interruption is a bulk ledger
        // operation.
        assert_eq!(h.sim.status_queries(host), 0);
        assert_eq!(h.sim.status_queries(removed_host), 0);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reconcile_adopts_interrupted() {
        let logctx = test_setup_log("test_reconcile_adopts_interrupted");
        let h = Harness::new(&logctx);
        let host = HostUuid::new_v4();
        h.sim.add_host(host);
        let dead = ControlPlaneNodeUuid::new_v4();
        h.membership.node_departed(dead).await;

        let record = h
            .insert_old(
                1,
                host,
                dead,
                CommandPayload::RollingMaintenance(RollingMaintenanceCommand {
                    stage: Stage::Maintenance,
                    payload: String::new(),
                }),
            )
            .await;
        h.sim.complete_offline(host, record.key(), Answer::success("done"));

        let reconciler = h.reconciler(ReconcileConfig {
            adopt_interrupted: true,
            ..config()
        });

        // The first cycle interrupts the dead node's records.  The one we
        // loaded still says `Created`, so it isn't queried this time around.
        let status = reconciler.reconcile_once(&logctx.log).await;
        assert_eq!(status.interrupted_by_owner, 1);
        assert_eq!(
            h.state_of(&record).await.state_by_management,
            CommandState::Interrupted
        );

        // The next cycle adopts it and resolves it from the agent's state.
        let status = reconciler.reconcile_once(&logctx.log).await;
        assert_eq!(status.resolved, 1);
        let found = h.state_of(&record).await;
        assert_eq!(found.state_by_management, CommandState::Done);
        assert!(found.is_removed());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reconcile_inconclusive_migration() {
        let logctx = test_setup_log("test_reconcile_inconclusive_migration");
        let h = Harness::new(&logctx);
        let source = HostUuid::new_v4();
        let destination = HostUuid::new_v4();
        h.sim.add_host(source);

        let record = h
            .insert_old(
                1,
                source,
                h.node_id,
                CommandPayload::MigrateWithStorage(MigrateWithStorageCommand {
                    vm_id: VirtualMachineUuid::new_v4(),
                    source_host: source,
                    destination_host: destination,
                    strategy: MigrationStrategy::ManagedLiveMigration,
                    volumes: vec![],
                }),
            )
            .await;
        let answer = Answer::failure("lost track of the VM").with_kind(
            AnswerKind::MigrateWithStorage(MigrateAnswer {
                source: HostVmView {
                    host_id: source,
                    state: None,
                    disks: vec![],
                },
                destination: HostVmView {
                    host_id: destination,
                    state: None,
                    disks: vec![],
                },
            }),
        );
        h.sim.complete_offline(source, record.key(), answer);

        let reconciler = h.reconciler(config());
        let status = reconciler.reconcile_once(&logctx.log).await;
        assert_eq!(status.resolved, 0);
        assert_eq!(status.still_running, 1);
        let found = h.state_of(&record).await;
        assert_eq!(found.state_by_management, CommandState::Reconciling);
        assert!(!found.is_removed());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reconcile_activation_reports_status() {
        let logctx = test_setup_log("test_reconcile_activation_reports_status");
        let h = Harness::new(&logctx);
        let host = HostUuid::new_v4();
        h.sim.add_host(host);
        h.insert_old(1, host, h.node_id, copy_payload()).await;

        let mut reconciler = h.reconciler(config());
        let value = reconciler.activate(&logctx.log).await;
        assert_eq!(value["loaded"], 1);
        assert_eq!(value["resolved"], 1);
        assert_eq!(value["errors"], serde_json::json!([]));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reconcile_leaves_queued_commands_alone() {
        let logctx =
            test_setup_log("test_reconcile_leaves_queued_commands_alone");
        let h = Harness::new(&logctx);
        let host = HostUuid::new_v4();
        h.sim.add_host(host);
        let dispatcher = Dispatcher::new(
            &logctx.log,
            h.ledger.clone(),
            h.sim.clone(),
            Duration::from_secs(30),
        );

        // The first sequenced command holds the host's queue, so the second
        // sits in `Created` without having been sent.
        let maintenance = |payload: &str| {
            CommandPayload::RollingMaintenance(RollingMaintenanceCommand {
                stage: Stage::PreMaintenance,
                payload: payload.to_string(),
            })
        };
        let release = Arc::new(Notify::new());
        h.sim.script(host, SimBehavior::Hold(release.clone()));
        let first = dispatcher.dispatch(host, maintenance("a")).await.unwrap();
        let queued = dispatcher.dispatch(host, maintenance("b")).await.unwrap();
        let (first_key, queued_key) = (first.key, queued.key);
        wait_for_condition(
            || async {
                let record = h.store.find(first_key).await.unwrap().unwrap();
                let held = h.ledger.held_for_delivery();
                if record.state_by_management == CommandState::Reconciling
                    && !held.contains(&first_key)
                {
                    Ok(())
                } else {
                    Err(CondCheckError::<Infallible>::NotYet)
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(10),
        )
        .await
        .unwrap();

        let reconciler = h.reconciler(ReconcileConfig {
            grace_period_secs: Duration::ZERO,
            ..config()
        });
        let status = reconciler.reconcile_once(&logctx.log).await;
        assert_eq!(status.loaded, 2);
        assert_eq!(status.still_running, 1);
        assert_eq!(status.awaiting_delivery, 1);
        assert_eq!(status.resolved, 0);
        assert_eq!(h.sim.status_queries(host), 1);
        let record = h.store.find(queued_key).await.unwrap().unwrap();
        assert_eq!(record.state_by_management, CommandState::Created);

        release.notify_one();
        assert_matches!(first.outcome().await, CommandOutcome::Answered(_));
        assert_matches!(
            queued.outcome().await,
            CommandOutcome::Answered(answer) if answer.success
        );
        assert_eq!(h.sim.started(host), vec![first_key, queued_key]);
        let record = h.store.find(queued_key).await.unwrap().unwrap();
        assert_eq!(record.state_by_management, CommandState::Done);
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_reconcile_retries_slow_queries() {
        let logctx = test_setup_log("test_reconcile_retries_slow_queries");
        let h = Harness::new(&logctx);
        let host = HostUuid::new_v4();
        h.sim.add_host(host);
        h.sim.set_query_delay(host, Duration::from_secs(60));
        let record = h.insert_old(1, host, h.node_id, copy_payload()).await;

        // Every query times out, and each one still counts as an attempt.
        let reconciler = h.reconciler(ReconcileConfig {
            query_timeout_secs: Duration::from_millis(20),
            query_retries: 3,
            ..config()
        });
        let status = reconciler.reconcile_once(&logctx.log).await;
        assert_eq!(status.unreachable, 1);
        assert_eq!(h.sim.status_queries(host), 3);

        let found = h.state_of(&record).await;
        assert_eq!(found.state_by_management, CommandState::Reconciling);
        assert_eq!(found.reconcile_attempts, 1);
        logctx.cleanup_successful();
    }
}
