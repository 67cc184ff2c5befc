// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executes rolling maintenance plans

use crate::inventory::MaintenanceInventory;
use crate::store::MaintenanceResultStore;
use chrono::Utc;
use futures::future::join_all;
use keel_common::api::external::Error;
use keel_common::typed_uuid::ClusterUuid;
use keel_common::typed_uuid::HostUuid;
use keel_common::typed_uuid::MaintenancePlanUuid;
use keel_ledger::Dispatcher;
use keel_types::answer::Answer;
use keel_types::command::CommandPayload;
use keel_types::command::RollingMaintenanceCommand;
use keel_types::inventory::HostDescriptor;
use keel_types::inventory::HostState;
use keel_types::maintenance::HostStage;
use keel_types::maintenance::MaintenancePlan;
use keel_types::maintenance::MaintenancePlanStatus;
use keel_types::maintenance::MaintenanceReport;
use keel_types::maintenance::Stage;
use keel_types::maintenance::StageResult;
use slog::debug;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

type Progress = BTreeMap<HostUuid, HostStage>;

/// How many finished plans' reports are kept for status queries
const FINISHED_PLANS_KEPT: usize = 64;

/// A plan that was admitted and is running in the background
#[derive(Debug)]
pub struct StartedPlan {
    pub plan_id: MaintenancePlanUuid,
    /// number of hosts in the plan's scope
    pub hosts: usize,
    /// completes with the plan's report
    pub finished: JoinHandle<MaintenanceReport>,
}

/// Runs rolling maintenance plans
///
/// Plans currently executing are tracked in an in-memory registry so that
/// two plans never work on the same host at once.  A plan leaves the
/// registry when it finishes or aborts; its stage results remain in the
/// [`MaintenanceResultStore`], and its report is kept in memory for a while.
pub struct MaintenanceCoordinator {
    log: Logger,
    dispatcher: Arc<Dispatcher>,
    inventory: Arc<dyn MaintenanceInventory>,
    results: Arc<dyn MaintenanceResultStore>,
    stage_timeout: Duration,
    active: Mutex<BTreeMap<MaintenancePlanUuid, Progress>>,
    /// reports of the most recently finished plans, oldest first
    finished: Mutex<VecDeque<MaintenanceReport>>,
}

/// State of one running plan, shared by the tasks working on its clusters
struct PlanExec<'a> {
    log: Logger,
    plan: &'a MaintenancePlan,
    /// set after a stage failure in a plan that isn't forced
    abort: AtomicBool,
}

impl<'a> PlanExec<'a> {
    fn aborted(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }
}

impl MaintenanceCoordinator {
    pub fn new(
        log: &Logger,
        dispatcher: Arc<Dispatcher>,
        inventory: Arc<dyn MaintenanceInventory>,
        results: Arc<dyn MaintenanceResultStore>,
        stage_timeout: Duration,
    ) -> MaintenanceCoordinator {
        MaintenanceCoordinator {
            log: log.new(o!("component" => "MaintenanceCoordinator")),
            dispatcher,
            inventory,
            results,
            stage_timeout,
            active: Mutex::new(BTreeMap::new()),
            finished: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the progress of every plan currently executing
    pub async fn active_plans(
        &self,
    ) -> BTreeMap<MaintenancePlanUuid, Progress> {
        self.active.lock().await.clone()
    }

    pub async fn stage_results(
        &self,
        plan_id: MaintenancePlanUuid,
    ) -> Result<Vec<StageResult>, Error> {
        self.results.results(plan_id).await
    }

    /// Returns what is known about `plan_id`, if it is running or finished
    /// recently
    pub async fn plan_status(
        &self,
        plan_id: MaintenancePlanUuid,
    ) -> Option<MaintenancePlanStatus> {
        if let Some(hosts) = self.active.lock().await.get(&plan_id) {
            let hosts = hosts.clone();
            return Some(MaintenancePlanStatus::Running { hosts });
        }
        let finished = self.finished.lock().await;
        finished.iter().find(|report| report.plan_id == plan_id).map(
            |report| MaintenancePlanStatus::Finished { report: report.clone() },
        )
    }

    /// Run `plan` to completion
    ///
    /// Errors are returned only if the plan could not be started at all.
    /// Once started, stage failures are reported through the returned
    /// [`MaintenanceReport`].
    pub async fn run(
        &self,
        plan: MaintenancePlan,
    ) -> Result<MaintenanceReport, Error> {
        let hosts = self.admit(&plan).await?;
        Ok(self.execute(plan, hosts).await)
    }

    /// Start `plan` and let it run in the background
    ///
    /// This returns as soon as the plan has been validated and registered,
    /// with the same errors as [`MaintenanceCoordinator::run`].
    pub async fn start(
        self: &Arc<Self>,
        plan: MaintenancePlan,
    ) -> Result<StartedPlan, Error> {
        let hosts = self.admit(&plan).await?;
        let plan_id = plan.id;
        let host_count = hosts.len();
        let coordinator = Arc::clone(self);
        let finished =
            tokio::spawn(async move { coordinator.execute(plan, hosts).await });
        Ok(StartedPlan { plan_id, hosts: host_count, finished })
    }

    /// Resolve the hosts in `plan`'s scope and register the plan as active
    async fn admit(
        &self,
        plan: &MaintenancePlan,
    ) -> Result<Vec<HostDescriptor>, Error> {
        let hosts = self.inventory.hosts_in_scope(&plan.scope).await?;
        if hosts.is_empty() {
            return Err(Error::invalid_request(&format!(
                "maintenance scope {} contains no hosts",
                plan.scope
            )));
        }
        self.register(plan, &hosts).await?;
        Ok(hosts)
    }

    async fn execute(
        &self,
        plan: MaintenancePlan,
        hosts: Vec<HostDescriptor>,
    ) -> MaintenanceReport {
        let log = self.log.new(o!(
            "plan_id" => plan.id.to_string(),
            "scope" => plan.scope.to_string(),
            "forced" => plan.forced,
        ));
        info!(log, "starting rolling maintenance"; "hosts" => hosts.len());

        let mut clusters: BTreeMap<ClusterUuid, Vec<HostDescriptor>> =
            BTreeMap::new();
        for host in hosts {
            clusters.entry(host.cluster_id).or_default().push(host);
        }

        let exec = PlanExec { log, plan: &plan, abort: AtomicBool::new(false) };
        join_all(
            clusters
                .into_iter()
                .map(|(cluster_id, hosts)| {
                    self.run_cluster(&exec, cluster_id, hosts)
                }),
        )
        .await;

        let hosts = self
            .active
            .lock()
            .await
            .get(&plan.id)
            .cloned()
            .unwrap_or_default();
        let report = MaintenanceReport {
            plan_id: plan.id,
            aborted: exec.aborted(),
            hosts,
        };
        // The report is findable before the plan stops being active.
        {
            let mut finished = self.finished.lock().await;
            if finished.len() >= FINISHED_PLANS_KEPT {
                finished.pop_front();
            }
            finished.push_back(report.clone());
        }
        self.active.lock().await.remove(&plan.id);

        info!(
            exec.log,
            "rolling maintenance finished";
            "success" => report.success(),
            "aborted" => report.aborted,
        );
        report
    }

    async fn register(
        &self,
        plan: &MaintenancePlan,
        hosts: &[HostDescriptor],
    ) -> Result<(), Error> {
        let mut active = self.active.lock().await;
        if active.contains_key(&plan.id) {
            return Err(Error::conflict(&format!(
                "maintenance plan {} is already running",
                plan.id
            )));
        }
        for (other, progress) in active.iter() {
            let overlap = hosts.iter().find(|h| progress.contains_key(&h.id));
            if let Some(host) = overlap {
                return Err(Error::conflict(&format!(
                    "host {} is already part of maintenance plan {}",
                    host.id, other
                )));
            }
        }
        active.insert(
            plan.id,
            hosts.iter().map(|h| (h.id, HostStage::NotStarted)).collect(),
        );
        Ok(())
    }

    async fn set_progress(
        &self,
        plan_id: MaintenancePlanUuid,
        host_id: HostUuid,
        stage: HostStage,
    ) {
        if let Some(progress) = self.active.lock().await.get_mut(&plan_id) {
            progress.insert(host_id, stage);
        }
    }

    /// Maintain the hosts of one cluster, one at a time
    async fn run_cluster(
        &self,
        exec: &PlanExec<'_>,
        cluster_id: ClusterUuid,
        hosts: Vec<HostDescriptor>,
    ) {
        let log = exec.log.new(o!("cluster_id" => cluster_id.to_string()));
        for host in hosts {
            if exec.aborted() {
                debug!(
                    log,
                    "plan aborted, not starting host";
                    "host_id" => %host.id,
                );
                return;
            }
            let completed = self.run_host(exec, &log, &host).await;
            if !completed && !exec.plan.forced {
                exec.abort.store(true, Ordering::SeqCst);
                return;
            }
        }
    }

    /// Take one host through every stage
    ///
    /// Returns whether the host completed maintenance.
    async fn run_host(
        &self,
        exec: &PlanExec<'_>,
        log: &Logger,
        host: &HostDescriptor,
    ) -> bool {
        let log = log.new(o!("host_id" => host.id.to_string()));
        for stage in Stage::iter() {
            // Plans abort only between stages.
            if exec.aborted() {
                info!(
                    log,
                    "plan aborted, stopping host";
                    "next_stage" => %stage,
                );
                self.set_progress(
                    exec.plan.id,
                    host.id,
                    HostStage::Aborted { next_stage: stage },
                )
                .await;
                return false;
            }
            self.set_progress(
                exec.plan.id,
                host.id,
                HostStage::InStage { stage },
            )
            .await;

            let answer = self.run_stage(exec, &log, host, stage).await;
            let answer = match self
                .results
                .record(StageResult {
                    plan_id: exec.plan.id,
                    host_id: host.id,
                    stage,
                    success: answer.success,
                    details: answer.details.clone(),
                    time_finished: Utc::now(),
                })
                .await
            {
                Ok(()) => answer,
                Err(error) => {
                    warn!(
                        log,
                        "failed to record stage result";
                        "stage" => %stage,
                        InlineErrorChain::new(&error),
                    );
                    Answer::failure(format!(
                        "failed to record stage result: {}",
                        InlineErrorChain::new(&error)
                    ))
                }
            };

            if !answer.success {
                warn!(
                    log,
                    "maintenance stage failed";
                    "stage" => %stage,
                    "details" => &answer.details,
                );
                self.set_progress(
                    exec.plan.id,
                    host.id,
                    HostStage::Failed { stage, reason: answer.details },
                )
                .await;
                return false;
            }
            info!(log, "maintenance stage completed"; "stage" => %stage);
        }

        // The host is back in service once its maintenance is done.
        if let Err(error) =
            self.inventory.set_host_state(host.id, HostState::Enabled).await
        {
            warn!(
                log,
                "failed to take host out of maintenance mode";
                InlineErrorChain::new(&error),
            );
            self.set_progress(
                exec.plan.id,
                host.id,
                HostStage::Failed {
                    stage: Stage::Maintenance,
                    reason: format!(
                        "failed to take host out of maintenance mode: {}",
                        InlineErrorChain::new(&error)
                    ),
                },
            )
            .await;
            return false;
        }
        self.set_progress(exec.plan.id, host.id, HostStage::Completed).await;
        true
    }

    async fn run_stage(
        &self,
        exec: &PlanExec<'_>,
        log: &Logger,
        host: &HostDescriptor,
        stage: Stage,
    ) -> Answer {
        if !stage.runs_on_agent() {
            return self.drain_check(host).await;
        }

        if stage == Stage::Maintenance {
            if let Err(error) = self
                .inventory
                .set_host_state(host.id, HostState::Maintenance)
                .await
            {
                return Answer::failure(format!(
                    "failed to put host into maintenance mode: {}",
                    InlineErrorChain::new(&error)
                ));
            }
        }

        let payload = CommandPayload::RollingMaintenance(
            RollingMaintenanceCommand {
                stage,
                payload: exec.plan.payload.clone(),
            },
        );
        let dispatched = match self.dispatcher.dispatch(host.id, payload).await
        {
            Ok(dispatched) => dispatched,
            Err(error) => {
                return Answer::failure(format!(
                    "failed to dispatch {} command: {}",
                    stage,
                    InlineErrorChain::new(&error)
                ));
            }
        };
        debug!(
            log,
            "dispatched stage";
            "stage" => %stage,
            "command" => %dispatched.key,
        );

        match tokio::time::timeout(self.stage_timeout, dispatched.outcome())
            .await
        {
            Ok(outcome) => outcome.into_answer(),
            Err(_) => Answer::failure(format!(
                "timed out after {:?} waiting for {} to finish",
                self.stage_timeout, stage
            )),
        }
    }

    /// Check that the rest of the host's cluster can absorb its guests
    async fn drain_check(&self, host: &HostDescriptor) -> Answer {
        let cluster = match self.inventory.cluster_hosts(host.cluster_id).await
        {
            Ok(cluster) => cluster,
            Err(error) => {
                return Answer::failure(format!(
                    "failed to list hosts of cluster {}: {}",
                    host.cluster_id,
                    InlineErrorChain::new(&error)
                ));
            }
        };
        let (targets, free) = cluster
            .iter()
            .filter(|h| h.id != host.id && h.state == HostState::Enabled)
            .fold((0usize, 0u64), |(n, free), h| {
                (n + 1, free.saturating_add(h.free_capacity()))
            });
        if free >= host.allocated {
            Answer::success(format!(
                "{} allocated unit(s) can be drained to {} host(s) with {} \
                 free",
                host.allocated, targets, free
            ))
        } else {
            Answer::failure(format!(
                "cannot drain host: {} unit(s) allocated, but only {} free \
                 on {} other enabled host(s) in the cluster",
                host.allocated, free, targets
            ))
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::store::InMemoryResultStore;
    use assert_matches::assert_matches;
    use keel_agent_link::sim::SimAgent;
    use keel_agent_link::sim::SimBehavior;
    use keel_common::typed_uuid::ControlPlaneNodeUuid;
    use keel_common::typed_uuid::PodUuid;
    use keel_common::typed_uuid::ZoneUuid;
    use keel_ledger::CommandLedger;
    use keel_ledger::LedgerStore;
    use keel_test_utils::dev::poll::wait_for_condition;
    use keel_test_utils::dev::poll::CondCheckError;
    use keel_test_utils::dev::test_setup_log;
    use keel_types::maintenance::MaintenanceScope;
    use std::convert::Infallible;
    use tokio::sync::Notify;

    /// Inventory that hands out hosts in the order they were added
    struct TestInventory {
        hosts: Mutex<Vec<HostDescriptor>>,
        /// every state change, in order
        transitions: Mutex<Vec<(HostUuid, HostState)>>,
    }

    #[async_trait::async_trait]
    impl MaintenanceInventory for TestInventory {
        async fn hosts_in_scope(
            &self,
            scope: &MaintenanceScope,
        ) -> Result<Vec<HostDescriptor>, Error> {
            let hosts = self.hosts.lock().await;
            Ok(hosts.iter().filter(|h| scope.contains(h)).cloned().collect())
        }

        async fn cluster_hosts(
            &self,
            cluster: ClusterUuid,
        ) -> Result<Vec<HostDescriptor>, Error> {
            let hosts = self.hosts.lock().await;
            Ok(hosts
                .iter()
                .filter(|h| h.cluster_id == cluster)
                .cloned()
                .collect())
        }

        async fn set_host_state(
            &self,
            host: HostUuid,
            state: HostState,
        ) -> Result<(), Error> {
            let mut hosts = self.hosts.lock().await;
            let found = hosts.iter_mut().find(|h| h.id == host).ok_or_else(
                || Error::invalid_request(&format!("no host {host}")),
            )?;
            found.state = state;
            self.transitions.lock().await.push((host, state));
            Ok(())
        }
    }

    struct Harness {
        sim: Arc<SimAgent>,
        inventory: Arc<TestInventory>,
        results: Arc<InMemoryResultStore>,
        coordinator: Arc<MaintenanceCoordinator>,
        cluster_id: ClusterUuid,
        hosts: Vec<HostUuid>,
    }

    impl Harness {
        /// One cluster of `n` hosts, each with room to absorb the others'
        /// guests
        fn new(log: &Logger, n: usize, stage_timeout: Duration) -> Harness {
            let sim = Arc::new(SimAgent::new(log));
            let store = Arc::new(LedgerStore::new_in_memory(log));
            let ledger = Arc::new(CommandLedger::new(
                log,
                ControlPlaneNodeUuid::new_v4(),
                store,
            ));
            let dispatcher = Arc::new(Dispatcher::new(
                log,
                ledger,
                sim.clone(),
                Duration::from_secs(60),
            ));

            let cluster_id = ClusterUuid::new_v4();
            let (pod_id, zone_id) = (PodUuid::new_v4(), ZoneUuid::new_v4());
            let descriptors: Vec<_> = (0..n)
                .map(|_| HostDescriptor {
                    id: HostUuid::new_v4(),
                    cluster_id,
                    pod_id,
                    zone_id,
                    state: HostState::Enabled,
                    capacity: 100,
                    allocated: 10,
                })
                .collect();
            let hosts: Vec<_> = descriptors.iter().map(|h| h.id).collect();
            for host in &hosts {
                sim.add_host(*host);
            }
            let inventory = Arc::new(TestInventory {
                hosts: Mutex::new(descriptors),
                transitions: Mutex::new(Vec::new()),
            });
            let results = Arc::new(InMemoryResultStore::new());
            let coordinator = Arc::new(MaintenanceCoordinator::new(
                log,
                dispatcher,
                inventory.clone(),
                results.clone(),
                stage_timeout,
            ));
            Harness { sim, inventory, results, coordinator, cluster_id, hosts }
        }

        fn plan(&self, forced: bool) -> MaintenancePlan {
            MaintenancePlan {
                id: MaintenancePlanUuid::new_v4(),
                scope: MaintenanceScope::Cluster(self.cluster_id),
                forced,
                payload: String::from("{\"reason\": \"firmware\"}"),
            }
        }
    }

    #[tokio::test]
    async fn test_maintenance_fail_fast() {
        let logctx = test_setup_log("test_maintenance_fail_fast");
        let h = Harness::new(&logctx.log, 3, Duration::from_secs(30));
        h.sim.fail_stage(h.hosts[1], Stage::PreMaintenance);

        let plan = h.plan(false);
        let report = h.coordinator.run(plan.clone()).await.unwrap();
        assert!(report.aborted);
        assert!(!report.success());
        assert_eq!(report.hosts[&h.hosts[0]], HostStage::Completed);
        assert_matches!(
            &report.hosts[&h.hosts[1]],
            HostStage::Failed { stage: Stage::PreMaintenance, .. }
        );
        assert_eq!(report.hosts[&h.hosts[2]], HostStage::NotStarted);

        // The third host was never touched.
        assert!(h.sim.started(h.hosts[2]).is_empty());

        let results = h.results.results(plan.id).await.unwrap();
        let for_host = |host: HostUuid| {
            results
                .iter()
                .filter(|r| r.host_id == host)
                .map(|r| (r.stage, r.success))
                .collect::<Vec<_>>()
        };
        assert_eq!(
            for_host(h.hosts[0]),
            vec![
                (Stage::PreFlight, true),
                (Stage::PreMaintenance, true),
                (Stage::Maintenance, true),
            ]
        );
        assert_eq!(
            for_host(h.hosts[1]),
            vec![(Stage::PreFlight, true), (Stage::PreMaintenance, false)]
        );
        assert!(for_host(h.hosts[2]).is_empty());

        // The first host went into maintenance mode and came back out.
        assert_eq!(
            *h.inventory.transitions.lock().await,
            vec![
                (h.hosts[0], HostState::Maintenance),
                (h.hosts[0], HostState::Enabled),
            ]
        );
        assert!(h.coordinator.active_plans().await.is_empty());
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_maintenance_forced_continues() {
        let logctx = test_setup_log("test_maintenance_forced_continues");
        let h = Harness::new(&logctx.log, 3, Duration::from_secs(30));
        h.sim.fail_stage(h.hosts[1], Stage::PreMaintenance);

        let report = h.coordinator.run(h.plan(true)).await.unwrap();
        assert!(!report.aborted);
        assert!(!report.success());
        assert_eq!(report.hosts[&h.hosts[0]], HostStage::Completed);
        assert_matches!(
            &report.hosts[&h.hosts[1]],
            HostStage::Failed { stage: Stage::PreMaintenance, reason }
                if reason.contains("simulated premaintenance hook failure")
        );
        assert_eq!(report.hosts[&h.hosts[2]], HostStage::Completed);
        assert!(report.summary().contains("failed in premaintenance"));
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_maintenance_success_and_drain_check() {
        let logctx = test_setup_log("test_maintenance_success_and_drain_check");
        let h = Harness::new(&logctx.log, 2, Duration::from_secs(30));

        let report = h.coordinator.run(h.plan(false)).await.unwrap();
        assert!(report.success(), "{}", report.summary());

        // Fill up the second host so that the first can't be drained.
        h.inventory.hosts.lock().await[1].allocated = 100;
        let plan = MaintenancePlan {
            scope: MaintenanceScope::Host(h.hosts[0]),
            ..h.plan(false)
        };
        let report = h.coordinator.run(plan).await.unwrap();
        assert_matches!(
            &report.hosts[&h.hosts[0]],
            HostStage::Failed { stage: Stage::PreFlight, reason }
                if reason.starts_with("cannot drain host")
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_maintenance_scope_validation() {
        let logctx = test_setup_log("test_maintenance_scope_validation");
        let h = Harness::new(&logctx.log, 1, Duration::from_secs(30));

        let plan = MaintenancePlan {
            scope: MaintenanceScope::Zone(ZoneUuid::new_v4()),
            ..h.plan(false)
        };
        let error = h.coordinator.run(plan).await.unwrap_err();
        assert_matches!(error, Error::InvalidRequest { .. });
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_maintenance_stage_timeout_and_overlap() {
        let logctx =
            test_setup_log("test_maintenance_stage_timeout_and_overlap");
        let h = Arc::new(Harness::new(
            &logctx.log,
            2,
            Duration::from_millis(500),
        ));
        let release = Arc::new(Notify::new());
        h.sim.script(h.hosts[0], SimBehavior::Hold(release.clone()));

        let running = tokio::spawn({
            let h = h.clone();
            async move { h.coordinator.run(h.plan(false)).await }
        });

        // Wait for the first plan to show up, then try to start another one
        // over the same hosts.
        wait_for_condition(
            || async {
                if h.coordinator.active_plans().await.is_empty() {
                    Err(CondCheckError::<Infallible>::NotYet)
                } else {
                    Ok(())
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(30),
        )
        .await
        .unwrap();
        let error = h.coordinator.run(h.plan(false)).await.unwrap_err();
        assert_matches!(error, Error::Conflict { .. });

        let report = running.await.unwrap().unwrap();
        assert!(report.aborted);
        assert_matches!(
            &report.hosts[&h.hosts[0]],
            HostStage::Failed { stage: Stage::PreMaintenance, reason }
                if reason.starts_with("timed out")
        );
        release.notify_one();
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_started_plan_status() {
        let logctx = test_setup_log("test_started_plan_status");
        let h = Harness::new(&logctx.log, 2, Duration::from_secs(30));
        let release = Arc::new(Notify::new());
        h.sim.script(h.hosts[0], SimBehavior::Hold(release.clone()));

        let plan = h.plan(false);
        let started = h.coordinator.start(plan.clone()).await.unwrap();
        assert_eq!(started.plan_id, plan.id);
        assert_eq!(started.hosts, 2);
        wait_for_condition(
            || async {
                match h.coordinator.plan_status(plan.id).await {
                    Some(MaintenancePlanStatus::Running { hosts })
                        if hosts[&h.hosts[0]]
                            == HostStage::InStage {
                                stage: Stage::PreMaintenance,
                            } =>
                    {
                        Ok(())
                    }
                    _ => Err(CondCheckError::<Infallible>::NotYet),
                }
            },
            &Duration::from_millis(10),
            &Duration::from_secs(30),
        )
        .await
        .unwrap();

        release.notify_one();
        let report = started.finished.await.unwrap();
        assert!(report.success(), "{}", report.summary());
        assert_eq!(
            h.coordinator.plan_status(plan.id).await,
            Some(MaintenancePlanStatus::Finished { report })
        );
        assert!(h.coordinator.active_plans().await.is_empty());
        assert_eq!(
            h.coordinator.plan_status(MaintenancePlanUuid::new_v4()).await,
            None
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_finished_reports_are_capped() {
        let logctx = test_setup_log("test_finished_reports_are_capped");
        let h = Harness::new(&logctx.log, 1, Duration::from_secs(30));
        let first = h.plan(false);
        h.coordinator.run(first.clone()).await.unwrap();
        let mut last = None;
        for _ in 0..FINISHED_PLANS_KEPT {
            let plan = h.plan(false);
            h.coordinator.run(plan.clone()).await.unwrap();
            last = Some(plan.id);
        }
        assert_eq!(h.coordinator.plan_status(first.id).await, None);
        let last = last.unwrap();
        assert_matches!(
            h.coordinator.plan_status(last).await,
            Some(MaintenancePlanStatus::Finished { report })
                if report.plan_id == last
        );
        logctx.cleanup_successful();
    }

    #[tokio::test]
    async fn test_abort_reported_for_other_clusters() {
        let logctx = test_setup_log("test_abort_reported_for_other_clusters");
        let h = Harness::new(&logctx.log, 2, Duration::from_secs(30));

        // A second cluster in the same pod.
        let other_cluster = ClusterUuid::new_v4();
        let pod_id = {
            let mut hosts = h.inventory.hosts.lock().await;
            let template = hosts[0].clone();
            for _ in 0..2 {
                let host = HostDescriptor {
                    id: HostUuid::new_v4(),
                    cluster_id: other_cluster,
                    ..template.clone()
                };
                h.sim.add_host(host.id);
                hosts.push(host);
            }
            template.pod_id
        };
        let other = {
            let hosts = h.inventory.hosts.lock().await;
            [hosts[2].id, hosts[3].id]
        };

        // The other cluster's first host is partway through its stages when
        // this cluster's first host fails.
        h.sim.fail_stage(h.hosts[0], Stage::PreMaintenance);
        let release = Arc::new(Notify::new());
        h.sim.script(other[0], SimBehavior::Hold(release.clone()));
        let plan = MaintenancePlan {
            scope: MaintenanceScope::Pod(pod_id),
            ..h.plan(false)
        };
        let plan_id = plan.id;
        let coordinator = &h.coordinator;
        let running = coordinator.run(plan);
        let observe = async {
            wait_for_condition(
                || async {
                    let active = coordinator.active_plans().await;
                    let failed = active.get(&plan_id).is_some_and(|p| {
                        matches!(p[&h.hosts[0]], HostStage::Failed { .. })
                    });
                    if failed && h.sim.started(other[0]).len() == 1 {
                        Ok(())
                    } else {
                        Err(CondCheckError::<Infallible>::NotYet)
                    }
                },
                &Duration::from_millis(10),
                &Duration::from_secs(30),
            )
            .await
            .unwrap();
            release.notify_one();
        };
        let (report, ()) = tokio::join!(running, observe);
        let report = report.unwrap();

        assert!(report.aborted);
        assert_matches!(
            &report.hosts[&h.hosts[0]],
            HostStage::Failed { stage: Stage::PreMaintenance, .. }
        );
        assert_eq!(report.hosts[&h.hosts[1]], HostStage::NotStarted);
        assert_eq!(
            report.hosts[&other[0]],
            HostStage::Aborted { next_stage: Stage::Maintenance }
        );
        assert_eq!(report.hosts[&other[1]], HostStage::NotStarted);
        assert!(report
            .summary()
            .contains(&format!("{}: aborted before maintenance", other[0])));

        // The aborted host never went into maintenance mode.
        assert!(h
            .inventory
            .transitions
            .lock()
            .await
            .iter()
            .all(|(host, _)| *host != other[0]));
        logctx.cleanup_successful();
    }
}
