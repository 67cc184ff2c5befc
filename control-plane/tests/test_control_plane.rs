// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Scenarios spanning the whole control plane: a node (or two) wired up
//! against simulated agents

use assert_matches::assert_matches;
use chrono::TimeDelta;
use chrono::Utc;
use dropshot::ConfigLogging;
use dropshot::ConfigLoggingLevel;
use keel_agent_link::sim::SimAgent;
use keel_agent_link::sim::SimBehavior;
use keel_common::api::external::Error;
use keel_common::typed_uuid::ClusterUuid;
use keel_common::typed_uuid::ControlPlaneNodeUuid;
use keel_common::typed_uuid::HostUuid;
use keel_common::typed_uuid::MaintenancePlanUuid;
use keel_common::typed_uuid::PodUuid;
use keel_common::typed_uuid::StoragePoolUuid;
use keel_common::typed_uuid::VirtualMachineUuid;
use keel_common::typed_uuid::VolumeUuid;
use keel_common::typed_uuid::ZoneUuid;
use keel_config::Config;
use keel_config::MaintenanceConfig;
use keel_config::NodeConfig;
use keel_config::PurgeConfig;
use keel_config::ReconcileConfig;
use keel_control_plane::ControlPlane;
use keel_control_plane::InMemoryInventory;
use keel_control_plane::MigrateWithStorageParams;
use keel_control_plane::PurgeParams;
use keel_control_plane::RollingMaintenanceParams;
use keel_control_plane::PURGE_TASK;
use keel_control_plane::RECONCILE_TASK;
use keel_ledger::CommandStore;
use keel_ledger::LedgerStore;
use keel_test_utils::dev::poll::wait_for_condition;
use keel_test_utils::dev::poll::CondCheckError;
use keel_test_utils::dev::test_setup_log;
use keel_types::command::CommandKey;
use keel_types::command::CommandPayload;
use keel_types::command::CopyVolumeCommand;
use keel_types::command::MigrateWithStorageCommand;
use keel_types::command::MigrationStrategy;
use keel_types::command::VolumeMigration;
use keel_types::inventory::HostDescriptor;
use keel_types::inventory::HostState;
use keel_types::inventory::PoolScope;
use keel_types::inventory::StoragePoolDescriptor;
use keel_types::inventory::VmDescriptor;
use keel_types::inventory::VmState;
use keel_types::maintenance::HostStage;
use keel_types::maintenance::MaintenancePlanStatus;
use keel_types::maintenance::MaintenanceReport;
use keel_types::maintenance::Stage;
use keel_types::record::CommandRecord;
use keel_types::record::CommandState;
use slog::Logger;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const POLL_MAX: Duration = Duration::from_secs(30);

/// A zone with two clusters.  Cluster A has three hosts and an unmanaged
/// pool; cluster B has one host and an unmanaged pool.  A managed pool spans
/// the zone.
struct Fleet {
    cluster_a: Vec<HostUuid>,
    cluster_b: HostUuid,
    zone_id: ZoneUuid,
    cluster_a_id: ClusterUuid,
    pool_a: StoragePoolUuid,
    pool_b: StoragePoolUuid,
    managed_pool: StoragePoolUuid,
    hosts: Vec<HostDescriptor>,
    pools: Vec<StoragePoolDescriptor>,
}

impl Fleet {
    fn new() -> Fleet {
        let (pod_id, zone_id) = (PodUuid::new_v4(), ZoneUuid::new_v4());
        let (cluster_a_id, cluster_b_id) =
            (ClusterUuid::new_v4(), ClusterUuid::new_v4());
        let host = |cluster_id, allocated| HostDescriptor {
            id: HostUuid::new_v4(),
            cluster_id,
            pod_id,
            zone_id,
            state: HostState::Enabled,
            capacity: 100,
            allocated,
        };
        let hosts = vec![
            host(cluster_a_id, 10),
            host(cluster_a_id, 10),
            host(cluster_a_id, 10),
            host(cluster_b_id, 0),
        ];
        let pool = |managed, scope| StoragePoolDescriptor {
            id: StoragePoolUuid::new_v4(),
            managed,
            scope,
        };
        let pools = vec![
            pool(false, PoolScope::Cluster(cluster_a_id)),
            pool(false, PoolScope::Cluster(cluster_b_id)),
            pool(true, PoolScope::Zone(zone_id)),
        ];
        Fleet {
            cluster_a: hosts[..3].iter().map(|h| h.id).collect(),
            cluster_b: hosts[3].id,
            zone_id,
            cluster_a_id,
            pool_a: pools[0].id,
            pool_b: pools[1].id,
            managed_pool: pools[2].id,
            hosts,
            pools,
        }
    }
}

fn config(reconcile: bool) -> Config {
    Config {
        log: ConfigLogging::StderrTerminal { level: ConfigLoggingLevel::Info },
        node: NodeConfig {
            id: ControlPlaneNodeUuid::new_v4(),
            ledger_paths: vec![],
            heartbeat_timeout_secs: Duration::from_secs(60),
        },
        reconcile: ReconcileConfig {
            enabled: reconcile,
            period_secs: Duration::from_secs(3600),
            workers: 4,
            // Dispatchers stop waiting for answers after the grace period,
            // so only nodes that reconcile use a short one.
            grace_period_secs: if reconcile {
                Duration::ZERO
            } else {
                Duration::from_secs(600)
            },
            query_timeout_secs: Duration::from_secs(1),
            query_retries: 1,
            max_attempts: 2,
            adopt_interrupted: false,
        },
        purge: PurgeConfig::default(),
        maintenance: MaintenanceConfig {
            stage_timeout_secs: Duration::from_secs(10),
            ..Default::default()
        },
        simulation: Default::default(),
    }
}

struct Harness {
    fleet: Fleet,
    agents: Arc<SimAgent>,
    inventory: Arc<InMemoryInventory>,
    node: ControlPlane,
}

impl Harness {
    fn new(log: &Logger, config: &Config) -> Harness {
        let fleet = Fleet::new();
        let agents = Arc::new(SimAgent::new(log));
        for host in &fleet.hosts {
            agents.add_host(host.id);
        }
        let inventory = Arc::new(InMemoryInventory::new(
            log,
            fleet.hosts.clone(),
            fleet.pools.clone(),
        ));
        let node = ControlPlane::with_store(
            log,
            config,
            agents.clone(),
            inventory.clone(),
            Arc::new(LedgerStore::new_in_memory(log)),
        );
        Harness { fleet, agents, inventory, node }
    }

    async fn running_vm(&self, host_id: HostUuid) -> VirtualMachineUuid {
        let vm = VmDescriptor {
            id: VirtualMachineUuid::new_v4(),
            host_id: Some(host_id),
            state: VmState::Running,
            time_removed: None,
        };
        self.inventory.insert_vm(vm.clone()).await;
        vm.id
    }
}

async fn wait_for_record<F>(node: &ControlPlane, key: CommandKey, done: F)
where
    F: Fn(&CommandRecord) -> bool,
{
    wait_for_condition(
        || async {
            match node.ledger().find(key).await {
                Ok(Some(record)) if done(&record) => Ok(()),
                _ => Err(CondCheckError::<Infallible>::NotYet),
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap();
}

/// Start rolling maintenance and wait for the plan's report
async fn run_maintenance(
    node: &ControlPlane,
    params: RollingMaintenanceParams,
) -> MaintenanceReport {
    let started = node.start_rolling_maintenance(params).await.unwrap();
    wait_for_condition(
        || async {
            match node.rolling_maintenance_status(started.plan_id).await {
                Ok(MaintenancePlanStatus::Finished { report }) => Ok(report),
                _ => Err(CondCheckError::<Infallible>::NotYet),
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_rolling_maintenance_fail_fast_and_forced() {
    let logctx =
        test_setup_log("test_rolling_maintenance_fail_fast_and_forced");
    let h = Harness::new(&logctx.log, &config(false));
    let (host1, host2, host3) =
        (h.fleet.cluster_a[0], h.fleet.cluster_a[1], h.fleet.cluster_a[2]);
    h.agents.fail_stage(host2, Stage::PreMaintenance);

    let params = RollingMaintenanceParams {
        cluster_id: Some(h.fleet.cluster_a_id),
        payload: String::from("kernel upgrade"),
        ..Default::default()
    };
    let report = run_maintenance(&h.node, params.clone()).await;
    assert!(!report.success());
    assert!(report.aborted);
    assert!(report.summary().contains("aborted"), "{}", report.summary());
    // host 1 ran both remote stages, host 2 failed its first, and host 3 was
    // never touched
    assert_eq!(h.agents.started(host1).len(), 2);
    assert_eq!(h.agents.started(host2).len(), 1);
    assert!(h.agents.started(host3).is_empty());
    for host in [host1, host2, host3] {
        assert_eq!(
            h.inventory.host(host).await.unwrap().state,
            HostState::Enabled
        );
    }

    let report = run_maintenance(
        &h.node,
        RollingMaintenanceParams { forced: true, ..params },
    )
    .await;
    assert!(!report.success());
    assert!(!report.aborted);
    assert_eq!(h.agents.started(host2).len(), 2);
    assert_eq!(h.agents.started(host3).len(), 2);

    // A host with no failing stage goes through.
    let report = run_maintenance(
        &h.node,
        RollingMaintenanceParams {
            host_id: Some(h.fleet.cluster_b),
            ..Default::default()
        },
    )
    .await;
    assert!(report.success(), "{}", report.summary());
    assert_eq!(h.agents.started(h.fleet.cluster_b).len(), 2);

    let error = h
        .node
        .start_rolling_maintenance(RollingMaintenanceParams {
            zone_id: Some(h.fleet.zone_id),
            cluster_id: Some(h.fleet.cluster_a_id),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_matches!(error, Error::InvalidRequest { .. });

    let error = h
        .node
        .rolling_maintenance_status(MaintenancePlanUuid::new_v4())
        .await
        .unwrap_err();
    assert_matches!(error, Error::ObjectNotFound { .. });

    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_rolling_maintenance_acknowledged_before_it_finishes() {
    let logctx = test_setup_log(
        "test_rolling_maintenance_acknowledged_before_it_finishes",
    );
    let h = Harness::new(&logctx.log, &config(false));
    let host = h.fleet.cluster_b;
    let release = Arc::new(Notify::new());
    h.agents.script(host, SimBehavior::Hold(release.clone()));

    // The first remote stage hangs, yet the request comes back.
    let started = h
        .node
        .start_rolling_maintenance(RollingMaintenanceParams {
            host_id: Some(host),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(started.hosts, 1);

    wait_for_condition(
        || async {
            match h.node.rolling_maintenance_status(started.plan_id).await {
                Ok(MaintenancePlanStatus::Running { hosts })
                    if hosts[&host]
                        == HostStage::InStage {
                            stage: Stage::PreMaintenance,
                        } =>
                {
                    Ok(())
                }
                _ => Err(CondCheckError::<Infallible>::NotYet),
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap();

    // A second plan over the same host is refused while the first runs.
    let error = h
        .node
        .start_rolling_maintenance(RollingMaintenanceParams {
            host_id: Some(host),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_matches!(error, Error::Conflict { .. });

    release.notify_one();
    let report = wait_for_condition(
        || async {
            match h.node.rolling_maintenance_status(started.plan_id).await {
                Ok(MaintenancePlanStatus::Finished { report }) => Ok(report),
                _ => Err(CondCheckError::<Infallible>::NotYet),
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap();
    assert!(report.success(), "{}", report.summary());
    assert_eq!(report.hosts[&host], HostStage::Completed);
    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_migrate_with_storage() {
    let logctx = test_setup_log("test_migrate_with_storage");
    let h = Harness::new(&logctx.log, &config(false));
    let source = h.fleet.cluster_a[0];
    let vm_id = h.running_vm(source).await;
    let volume = |source_pool, destination_pool| VolumeMigration {
        volume_id: VolumeUuid::new_v4(),
        source_pool,
        destination_pool,
    };

    // unmanaged storage to the same host
    let started = h
        .node
        .migrate_with_storage(MigrateWithStorageParams {
            vm_id,
            destination_host: source,
            volumes: vec![volume(h.fleet.pool_a, h.fleet.pool_a)],
        })
        .await
        .unwrap();
    assert_eq!(started.decision.strategy, MigrationStrategy::CannotHandle);
    assert_eq!(started.command, None);

    // unmanaged storage across clusters
    let started = h
        .node
        .migrate_with_storage(MigrateWithStorageParams {
            vm_id,
            destination_host: h.fleet.cluster_b,
            volumes: vec![volume(h.fleet.pool_a, h.fleet.pool_b)],
        })
        .await
        .unwrap();
    assert_eq!(started.decision.strategy, MigrationStrategy::CannotHandle);
    assert!(h.agents.started(source).is_empty());

    // mixed destinations are rejected outright
    let error = h
        .node
        .migrate_with_storage(MigrateWithStorageParams {
            vm_id,
            destination_host: h.fleet.cluster_b,
            volumes: vec![
                volume(h.fleet.pool_a, h.fleet.pool_b),
                volume(h.fleet.pool_a, h.fleet.managed_pool),
            ],
        })
        .await
        .unwrap_err();
    assert_matches!(error, Error::InvalidRequest { .. });

    // managed storage across clusters
    let started = h
        .node
        .migrate_with_storage(MigrateWithStorageParams {
            vm_id,
            destination_host: h.fleet.cluster_b,
            volumes: vec![volume(h.fleet.pool_a, h.fleet.managed_pool)],
        })
        .await
        .unwrap();
    assert_eq!(
        started.decision.strategy,
        MigrationStrategy::ManagedLiveMigration
    );
    let key = started.command.expect("migration was dispatched");

    let destination = h.fleet.cluster_b;
    wait_for_condition(
        || async {
            match h.inventory.vm(vm_id).await {
                Ok(vm)
                    if vm.host_id == Some(destination)
                        && vm.state == VmState::Running =>
                {
                    Ok(())
                }
                _ => Err(CondCheckError::<Infallible>::NotYet),
            }
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap();
    wait_for_record(&h.node, key, |r| r.is_removed()).await;
    assert_eq!(h.agents.started(source), vec![key]);

    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_unmanage_virtual_machine() {
    let logctx = test_setup_log("test_unmanage_virtual_machine");
    let h = Harness::new(&logctx.log, &config(false));
    let host = h.fleet.cluster_a[0];
    let vm_id = h.running_vm(host).await;

    // A command for this VM is still running on its host.
    let release = Arc::new(Notify::new());
    h.agents.script(host, SimBehavior::Hold(release.clone()));
    let dispatched = h
        .node
        .dispatcher()
        .dispatch(
            host,
            CommandPayload::MigrateWithStorage(MigrateWithStorageCommand {
                vm_id,
                source_host: host,
                destination_host: h.fleet.cluster_a[1],
                strategy: MigrationStrategy::UnmanagedLiveMigration,
                volumes: vec![],
            }),
        )
        .await
        .unwrap();
    let key = dispatched.key;
    let error = h.node.unmanage_virtual_machine(vm_id).await.unwrap_err();
    assert_matches!(error, Error::Conflict { .. });

    release.notify_one();
    assert!(dispatched.outcome().await.into_answer().success);
    wait_for_record(&h.node, key, |r| r.is_removed()).await;

    let response = h.node.unmanage_virtual_machine(vm_id).await.unwrap();
    assert!(response.success);
    assert_matches!(
        h.inventory.vm(vm_id).await,
        Err(Error::ObjectNotFound { .. })
    );
    assert_matches!(
        h.node.unmanage_virtual_machine(vm_id).await,
        Err(Error::ObjectNotFound { .. })
    );

    let expunged = h.running_vm(host).await;
    h.inventory.expunge_vm(expunged, Utc::now()).await.unwrap();
    assert_matches!(
        h.node.unmanage_virtual_machine(expunged).await,
        Err(Error::InvalidRequest { .. })
    );

    let migrating = h.running_vm(host).await;
    h.inventory.set_vm_state(migrating, VmState::Migrating).await.unwrap();
    assert_matches!(
        h.node.unmanage_virtual_machine(migrating).await,
        Err(Error::InvalidRequest { .. })
    );

    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_purge_expunged_resources() {
    let logctx = test_setup_log("test_purge_expunged_resources");
    let mut config = config(false);
    config.purge = PurgeConfig {
        enabled: true,
        period_secs: Duration::ZERO,
        initial_delay_secs: Duration::ZERO,
        batch_size: 2,
        end_time_difference_days: 30,
    };
    let h = Harness::new(&logctx.log, &config);
    let host = h.fleet.cluster_a[0];

    let now = Utc::now();
    let mut ancient = Vec::new();
    for _ in 0..3 {
        let vm_id = h.running_vm(host).await;
        h.inventory
            .expunge_vm(vm_id, now - TimeDelta::days(60))
            .await
            .unwrap();
        ancient.push(vm_id);
    }
    let recent = h.running_vm(host).await;
    h.inventory.expunge_vm(recent, now - TimeDelta::days(1)).await.unwrap();

    // The periodic task only takes what's older than 30 days.
    h.node.activate_background_task(PURGE_TASK).unwrap();
    wait_for_condition(
        || async {
            for vm_id in &ancient {
                if h.inventory.vm(*vm_id).await.is_ok() {
                    return Err(CondCheckError::<Infallible>::NotYet);
                }
            }
            Ok(())
        },
        &POLL_INTERVAL,
        &POLL_MAX,
    )
    .await
    .unwrap();
    h.inventory.vm(recent).await.expect("recent VM is kept");
    assert!(h
        .node
        .background_tasks()
        .iter()
        .any(|t| t.name == PURGE_TASK));

    // An explicit purge takes the rest, including finished commands.
    let dispatched = h
        .node
        .dispatcher()
        .dispatch(
            host,
            CommandPayload::CopyVolume(CopyVolumeCommand {
                volume_id: VolumeUuid::new_v4(),
                source_pool: h.fleet.pool_a,
                destination_pool: h.fleet.pool_a,
            }),
        )
        .await
        .unwrap();
    let key = dispatched.key;
    dispatched.outcome().await;
    wait_for_record(&h.node, key, |r| r.is_removed()).await;

    let error = h
        .node
        .purge_expunged_resources(PurgeParams {
            batch_size: Some(0),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_matches!(error, Error::InvalidValue { .. });

    let response = h
        .node
        .purge_expunged_resources(PurgeParams {
            end: Some(Utc::now() + TimeDelta::seconds(1)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        response.details,
        "purged 1 virtual machine(s) and 1 command record(s)"
    );
    assert!(h.node.list_commands(true).await.unwrap().is_empty());
    assert_matches!(
        h.inventory.vm(recent).await,
        Err(Error::ObjectNotFound { .. })
    );

    logctx.cleanup_successful();
}

#[tokio::test]
async fn test_dead_owner_interrupted_and_resolved() {
    let logctx = test_setup_log("test_dead_owner_interrupted_and_resolved");
    let log = &logctx.log;
    let fleet = Fleet::new();
    let agents = Arc::new(SimAgent::new(log));
    for host in &fleet.hosts {
        agents.add_host(host.id);
    }
    let inventory = Arc::new(InMemoryInventory::new(
        log,
        fleet.hosts.clone(),
        fleet.pools.clone(),
    ));
    let store: Arc<dyn CommandStore> =
        Arc::new(LedgerStore::new_in_memory(log));
    let node_a = ControlPlane::with_store(
        log,
        &config(false),
        agents.clone(),
        inventory.clone(),
        store.clone(),
    );
    let node_b = ControlPlane::with_store(
        log,
        &config(true),
        agents.clone(),
        inventory.clone(),
        store.clone(),
    );

    // Each node has one command that never finishes.
    let copy = || {
        CommandPayload::CopyVolume(CopyVolumeCommand {
            volume_id: VolumeUuid::new_v4(),
            source_pool: fleet.pool_a,
            destination_pool: fleet.pool_a,
        })
    };
    let release = Arc::new(Notify::new());
    let host_a = fleet.cluster_a[0];
    let host_b = fleet.cluster_a[1];
    agents.script(host_a, SimBehavior::Hold(release.clone()));
    agents.script(host_b, SimBehavior::Hold(release.clone()));
    let key_a =
        node_a.dispatcher().dispatch(host_a, copy()).await.unwrap().key;
    let key_b =
        node_b.dispatcher().dispatch(host_b, copy()).await.unwrap().key;
    for (node, key) in [(&node_a, key_a), (&node_b, key_b)] {
        wait_for_record(node, key, |r| {
            r.state_by_management == CommandState::Reconciling
        })
        .await;
    }

    // Node B learns that node A is gone.
    node_b.membership().node_departed(node_a.id()).await;
    node_b.activate_background_task(RECONCILE_TASK).unwrap();
    wait_for_record(&node_b, key_a, |r| {
        r.state_by_management == CommandState::Interrupted
    })
    .await;
    let record_b = node_b.ledger().find(key_b).await.unwrap().unwrap();
    assert_eq!(record_b.state_by_management, CommandState::Reconciling);

    // An operator settles node A's command.
    let response = node_b
        .resolve_interrupted_command(key_a, CommandState::Failed, "abandoned")
        .await
        .unwrap();
    assert!(response.success);
    let record_a = node_b.ledger().find(key_a).await.unwrap().unwrap();
    assert_eq!(record_a.state_by_management, CommandState::Failed);
    assert_matches!(
        node_b
            .resolve_interrupted_command(key_a, CommandState::Done, "again")
            .await,
        Err(Error::Conflict { .. })
    );

    // Stopping node B interrupts its own command and nothing else.
    assert_eq!(node_b.shutdown().await.unwrap(), 1);
    let record_b = node_b.ledger().find(key_b).await.unwrap().unwrap();
    assert_eq!(record_b.state_by_management, CommandState::Interrupted);
    assert_eq!(node_a.shutdown().await.unwrap(), 0);

    logctx.cleanup_successful();
}
