// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Manages execution of background tasks

use chrono::Utc;
use futures::future::BoxFuture;
use keel_types::task_status::ActivationReason;
use keel_types::task_status::BackgroundTask as BackgroundTaskView;
use keel_types::task_status::CurrentStatus;
use keel_types::task_status::CurrentStatusRunning;
use keel_types::task_status::LastResult;
use keel_types::task_status::LastResultCompleted;
use keel_types::task_status::TaskStatus;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tokio::sync::watch;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;

/// An operation activated both periodically and by an explicit signal
///
/// Implementations report what they did in each activation as an arbitrary
/// JSON value, which shows up in the task's status.
pub trait BackgroundTask: Send + Sync {
    fn activate<'a>(
        &'a mut self,
        log: &'a Logger,
    ) -> BoxFuture<'a, serde_json::Value>;
}

/// Identifies a background task registered with a [`Driver`]
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TaskName(String);

impl TaskName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything needed to register a background task
pub struct TaskDefinition {
    /// unique name for this background task
    pub name: String,
    /// short description of what this task does
    pub description: String,
    /// how often this task is activated automatically (zero: only on
    /// explicit activation)
    pub period: Duration,
    /// how long after registration the first periodic activation happens
    pub initial_delay: Duration,
    /// the task itself
    pub task_impl: Box<dyn BackgroundTask>,
}

/// Drives the execution of background tasks
///
/// A control plane node has one Driver.  Every background task is registered
/// with it at startup and runs in its own tokio task.  The Driver exposes the
/// status of each task (when it last ran, whether it's running now, and what
/// it reported).
pub struct Driver {
    log: Logger,
    tasks: BTreeMap<TaskName, Task>,
}

/// Driver-side state of a background task
struct Task {
    /// what this task does (for developers)
    description: String,
    /// configured period of the task
    period: Duration,
    /// channel used to receive updates from the background task's tokio task
    /// about what the background task is doing
    status: watch::Receiver<TaskStatus>,
    /// join handle for the tokio task that's executing this background task
    tokio_task: tokio::task::JoinHandle<()>,
    /// `Notify` used to wake up the tokio task when a caller explicitly wants
    /// to activate the background task
    notify: Arc<Notify>,
}

impl Driver {
    pub fn new(log: &Logger) -> Driver {
        Driver { log: log.clone(), tasks: BTreeMap::new() }
    }

    /// Register a new background task
    ///
    /// The task can be activated immediately with [`Driver::activate()`].
    /// Unless its period is zero, the Driver also activates it once
    /// `initial_delay` has passed and every `period` after that.
    ///
    /// All background tasks have a unique name.  This function panics if the
    /// name conflicts with that of a previously-registered task.
    pub fn register(&mut self, taskdef: TaskDefinition) -> TaskName {
        let TaskDefinition {
            name,
            description,
            period,
            initial_delay,
            task_impl,
        } = taskdef;

        // Activation happens in a separate tokio task, which reports its
        // status back over this channel.
        let (status_tx, status_rx) = watch::channel(TaskStatus {
            current: CurrentStatus::Idle,
            last: LastResult::NeverCompleted,
        });
        let notify = Arc::new(Notify::new());

        let log = self.log.new(o!("background_task" => name.clone()));
        let task_exec = TaskExec {
            period,
            initial_delay,
            imp: task_impl,
            notify: Arc::clone(&notify),
            log,
            status_tx,
            iteration: 0,
        };
        let tokio_task = tokio::task::spawn(task_exec.run());

        let task =
            Task { description, period, status: status_rx, tokio_task, notify };
        let task_name = TaskName(name);
        if self.tasks.insert(task_name.clone(), task).is_some() {
            panic!("started two background tasks called {:?}", task_name);
        }
        task_name
    }

    /// Look up a registered task by name
    pub fn task(&self, name: &str) -> Option<&TaskName> {
        self.tasks.get_key_value(&TaskName(name.to_string())).map(|(k, _)| k)
    }

    /// Activate the specified background task
    ///
    /// If the task is currently running, it will be activated again when it
    /// finishes.  Returns `false` if there is no such task.
    pub fn activate(&self, task: &TaskName) -> bool {
        match self.tasks.get(task) {
            Some(t) => {
                t.notify.notify_one();
                true
            }
            None => false,
        }
    }

    /// Returns a summary of every registered task
    ///
    /// Borrowing from a watch channel's receiver blocks the sender, so each
    /// status is cloned rather than handed out by reference.
    pub fn summaries(&self) -> Vec<BackgroundTaskView> {
        self.tasks
            .iter()
            .map(|(name, t)| BackgroundTaskView {
                name: name.to_string(),
                description: t.description.clone(),
                period: t.period,
                status: t.status.borrow().clone(),
            })
            .collect()
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        // When the driver is dropped, terminate all tokio tasks that were used
        // to run background tasks.
        for t in self.tasks.values() {
            t.tokio_task.abort();
        }
    }
}

/// Encapsulates state needed by the background tokio task to manage activation
/// of the background task
struct TaskExec {
    /// how often the background task should be activated
    period: Duration,
    /// delay before the first periodic activation
    initial_delay: Duration,
    /// impl of the background task
    imp: Box<dyn BackgroundTask>,
    /// used to receive notifications from the Driver that someone has requested
    /// explicit activation
    notify: Arc<Notify>,
    /// passed through to the background task impl when activated
    log: Logger,
    /// used to send current status back to the Driver
    status_tx: watch::Sender<TaskStatus>,
    /// counts iterations of the task, for debuggability
    iteration: u64,
}

impl TaskExec {
    /// Body of the tokio task that manages activation of this background task
    async fn run(mut self) {
        let mut interval = (!self.period.is_zero()).then(|| {
            let start = tokio::time::Instant::now() + self.initial_delay;
            let mut interval = tokio::time::interval_at(start, self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        // Wait for either the period to elapse or an explicit activation
        // signal from the Driver.
        loop {
            let tick = async {
                match interval.as_mut() {
                    Some(interval) => {
                        interval.tick().await;
                    }
                    None => futures::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = tick => {
                    self.activate(ActivationReason::Timeout).await;
                },

                _ = self.notify.notified() => {
                    self.activate(ActivationReason::Signaled).await;
                }
            }
        }
    }

    /// "Activate" the background task
    ///
    /// This basically just invokes `activate()` on the underlying
    /// `BackgroundTask` impl, but provides a bunch of runtime observability
    /// around doing so.
    async fn activate(&mut self, reason: ActivationReason) {
        self.iteration += 1;
        let iteration = self.iteration;
        let start_time = Utc::now();
        let start_instant = Instant::now();

        debug!(
            &self.log,
            "activating";
            "reason" => ?reason,
            "iteration" => iteration
        );

        self.status_tx.send_modify(|status| {
            debug_assert!(status.current.is_idle());
            status.current = CurrentStatus::Running(CurrentStatusRunning {
                start_time,
                reason,
                iteration,
            });
        });

        let details = self.imp.activate(&self.log).await;

        let elapsed = start_instant.elapsed();

        self.status_tx.send_modify(|status| {
            *status = TaskStatus {
                current: CurrentStatus::Idle,
                last: LastResult::Completed(LastResultCompleted {
                    iteration,
                    start_time,
                    reason,
                    elapsed,
                    details,
                }),
            };
        });

        debug!(
            &self.log,
            "activation complete";
            "elapsed" => ?elapsed,
            "iteration" => iteration,
        );
    }
}
