// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A keel control plane node
//!
//! [`ControlPlane`] constructs the command ledger, the dispatcher, the
//! maintenance coordinator, and the background tasks of one node, and
//! exposes the administrative operations built on them.

mod commands;
mod inventory;
mod maintenance;
mod migration;
mod purge;
mod vm;

pub use inventory::InMemoryInventory;
pub use maintenance::RollingMaintenanceParams;
pub use maintenance::RollingMaintenanceStarted;
pub use migration::MigrateWithStorageParams;
pub use migration::MigrationStarted;
pub use purge::PurgeCounts;
pub use purge::PurgeParams;

use keel_agent_link::AgentLink;
use keel_common::api::external::Error;
use keel_common::typed_uuid::ControlPlaneNodeUuid;
use keel_config::Config;
use keel_config::PurgeConfig;
use keel_ledger::CommandLedger;
use keel_ledger::CommandStore;
use keel_ledger::Dispatcher;
use keel_ledger::LedgerStore;
use keel_maintenance::InMemoryResultStore;
use keel_maintenance::MaintenanceCoordinator;
use keel_reconciler::CommandReconciler;
use keel_reconciler::Driver;
use keel_reconciler::HeartbeatMembership;
use keel_reconciler::TaskDefinition;
use keel_types::record::Owner;
use schemars::JsonSchema;
use serde::Serialize;
use slog::info;
use slog::o;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;

/// Name of the command reconciliation background task
pub const RECONCILE_TASK: &str = "command_reconciler";
/// Name of the expunged resource purge background task
pub const PURGE_TASK: &str = "expunged_resource_purge";

/// Result of an administrative operation
#[derive(Clone, Debug, Eq, JsonSchema, PartialEq, Serialize)]
pub struct AdminResponse {
    pub success: bool,
    pub details: String,
}

impl AdminResponse {
    fn ok(details: impl Into<String>) -> AdminResponse {
        AdminResponse { success: true, details: details.into() }
    }
}

/// One control plane node
pub struct ControlPlane {
    log: Logger,
    id: ControlPlaneNodeUuid,
    ledger: Arc<CommandLedger>,
    dispatcher: Arc<Dispatcher>,
    inventory: Arc<InMemoryInventory>,
    membership: Arc<HeartbeatMembership>,
    maintenance: Arc<MaintenanceCoordinator>,
    purge_config: PurgeConfig,
    background: Driver,
}

impl ControlPlane {
    /// Start a node whose command ledger lives in the files configured in
    /// `config` (or only in memory, if there are none)
    pub async fn new(
        log: &Logger,
        config: &Config,
        link: Arc<dyn AgentLink>,
        inventory: Arc<InMemoryInventory>,
    ) -> ControlPlane {
        let store = if config.node.ledger_paths.is_empty() {
            LedgerStore::new_in_memory(log)
        } else {
            LedgerStore::new(log, config.node.ledger_paths.clone()).await
        };
        ControlPlane::with_store(log, config, link, inventory, Arc::new(store))
    }

    /// Start a node on top of an existing command store, which may be shared
    /// with other nodes
    pub fn with_store(
        log: &Logger,
        config: &Config,
        link: Arc<dyn AgentLink>,
        inventory: Arc<InMemoryInventory>,
        store: Arc<dyn CommandStore>,
    ) -> ControlPlane {
        let id = config.node.id;
        let log = log.new(o!(
            "component" => "ControlPlane",
            "node_id" => id.to_string(),
        ));

        let ledger = Arc::new(CommandLedger::new(&log, id, store));
        // A dispatcher gives up waiting for an answer at about the time the
        // reconciler starts looking at the record.
        let dispatcher = Arc::new(Dispatcher::new(
            &log,
            Arc::clone(&ledger),
            Arc::clone(&link),
            config.reconcile.grace_period_secs,
        ));
        let membership = Arc::new(HeartbeatMembership::new(
            id,
            config.node.heartbeat_timeout_secs,
        ));
        let maintenance = Arc::new(MaintenanceCoordinator::new(
            &log,
            Arc::clone(&dispatcher),
            inventory.clone(),
            Arc::new(InMemoryResultStore::new()),
            config.maintenance.stage_timeout_secs,
        ));

        let mut background = Driver::new(&log);
        if config.reconcile.enabled {
            let reconciler = CommandReconciler::new(
                Arc::clone(&ledger),
                link,
                membership.clone(),
                config.reconcile.clone(),
            );
            background.register(TaskDefinition {
                name: String::from(RECONCILE_TASK),
                description: String::from(
                    "resolves command records whose outcome is not known",
                ),
                period: config.reconcile.period_secs,
                initial_delay: Duration::ZERO,
                task_impl: Box::new(reconciler),
            });
        }
        if config.purge.enabled {
            let purger = purge::ExpungedResourcePurger::new(
                Arc::clone(&inventory),
                Arc::clone(&ledger),
                config.purge.clone(),
            );
            background.register(TaskDefinition {
                name: String::from(PURGE_TASK),
                description: String::from(
                    "deletes expunged virtual machines and tombstoned \
                     command records",
                ),
                period: config.purge.period_secs,
                initial_delay: config.purge.initial_delay_secs,
                task_impl: Box::new(purger),
            });
        }

        info!(
            log,
            "control plane node started";
            "reconcile" => config.reconcile.enabled,
            "purge" => config.purge.enabled,
        );
        ControlPlane {
            log,
            id,
            ledger,
            dispatcher,
            inventory,
            membership,
            maintenance,
            purge_config: config.purge.clone(),
            background,
        }
    }

    pub fn id(&self) -> ControlPlaneNodeUuid {
        self.id
    }

    pub fn ledger(&self) -> &Arc<CommandLedger> {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn inventory(&self) -> &Arc<InMemoryInventory> {
        &self.inventory
    }

    /// Liveness information used by reconciliation
    pub fn membership(&self) -> &Arc<HeartbeatMembership> {
        &self.membership
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceCoordinator> {
        &self.maintenance
    }

    /// Stop this node gracefully
    ///
    /// Every command this node owns whose outcome is still open is marked
    /// `Interrupted`.  Returns how many were.
    pub async fn shutdown(&self) -> Result<usize, Error> {
        let interrupted = self
            .ledger
            .mark_interrupted_by_owner(Owner::ControlPlane(self.id))
            .await?;
        info!(
            self.log,
            "control plane node stopping";
            "interrupted_commands" => interrupted,
        );
        Ok(interrupted)
    }
}
