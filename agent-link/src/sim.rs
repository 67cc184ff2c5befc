// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulated agents
//!
//! [`SimAgent`] implements [`AgentLink`] for any number of simulated hosts in
//! the same process.  By default every command succeeds immediately.  Tests
//! script other behavior per host: failures, links that drop after the agent
//! accepted a command, agents that lose track of commands, and commands that
//! hang until released.

use crate::hook::HookExecutor;
use crate::AgentLink;
use crate::AgentLinkError;
use crate::PendingAnswer;
use futures::FutureExt;
use keel_common::typed_uuid::HostUuid;
use keel_types::answer::AgentCommandStatus;
use keel_types::answer::Answer;
use keel_types::command::Command;
use keel_types::command::CommandKey;
use keel_types::command::CommandPayload;
use keel_types::maintenance::Stage;
use slog::debug;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;

/// How a simulated agent handles one command
#[derive(Clone, Debug)]
pub enum SimBehavior {
    /// execute and answer successfully
    Succeed,
    /// execute and answer with a failure
    Fail(String),
    /// execute to completion, but the link drops before the answer arrives
    DisconnectAfterCompletion,
    /// accept, then crash and forget about the command entirely
    Forget,
    /// accept, and don't finish until the given `Notify` is signaled
    Hold(Arc<Notify>),
}

#[derive(Clone, Debug)]
enum SimCommandStatus {
    Running,
    Completed(Answer),
}

#[derive(Default)]
struct SimHost {
    reachable: bool,
    /// one-shot behaviors, consumed in submission order
    scripted: VecDeque<SimBehavior>,
    /// stages whose maintenance commands always fail
    failing_stages: BTreeSet<Stage>,
    commands: BTreeMap<CommandKey, SimCommandStatus>,
    /// order in which commands started executing
    started: Vec<CommandKey>,
    in_flight: usize,
    max_in_flight: usize,
    status_queries: usize,
    /// how long each status query takes to answer
    query_delay: Option<Duration>,
    hook: Option<Arc<HookExecutor>>,
}

impl SimHost {
    fn behavior_for(&mut self, command: &Command) -> SimBehavior {
        if let Some(behavior) = self.scripted.pop_front() {
            return behavior;
        }
        if let CommandPayload::RollingMaintenance(c) = &command.payload {
            if self.failing_stages.contains(&c.stage) {
                return SimBehavior::Fail(format!(
                    "simulated {} hook failure",
                    c.stage
                ));
            }
        }
        SimBehavior::Succeed
    }
}

/// An in-process stand-in for the agents on a set of hosts
pub struct SimAgent {
    log: Logger,
    hosts: Arc<Mutex<BTreeMap<HostUuid, SimHost>>>,
}

impl SimAgent {
    pub fn new(log: &Logger) -> SimAgent {
        SimAgent {
            log: log.new(o!("component" => "SimAgent")),
            hosts: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Add a reachable host
    pub fn add_host(&self, host: HostUuid) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.entry(host).or_default().reachable = true;
    }

    /// Run rolling maintenance commands on `host` through a real hook
    pub fn set_hook(&self, host: HostUuid, hook: Arc<HookExecutor>) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.entry(host).or_default().hook = Some(hook);
    }

    pub fn set_reachable(&self, host: HostUuid, reachable: bool) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.entry(host).or_default().reachable = reachable;
    }

    /// Make every status query to `host` take `delay` before answering
    pub fn set_query_delay(&self, host: HostUuid, delay: Duration) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.entry(host).or_default().query_delay = Some(delay);
    }

    /// Queue a behavior for the next command submitted to `host`
    pub fn script(&self, host: HostUuid, behavior: SimBehavior) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.entry(host).or_default().scripted.push_back(behavior);
    }

    /// Make every maintenance command for `stage` on `host` fail
    pub fn fail_stage(&self, host: HostUuid, stage: Stage) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts.entry(host).or_default().failing_stages.insert(stage);
    }

    /// Record that `host` finished `key` while nobody was listening
    ///
    /// This simulates an agent that completed a command whose dispatcher went
    /// away.
    pub fn complete_offline(
        &self,
        host: HostUuid,
        key: CommandKey,
        answer: Answer,
    ) {
        let mut hosts = self.hosts.lock().unwrap();
        hosts
            .entry(host)
            .or_default()
            .commands
            .insert(key, SimCommandStatus::Completed(answer));
    }

    /// Returns the commands `host` started, in the order it started them
    pub fn started(&self, host: HostUuid) -> Vec<CommandKey> {
        let hosts = self.hosts.lock().unwrap();
        hosts.get(&host).map(|h| h.started.clone()).unwrap_or_default()
    }

    /// Returns the largest number of commands `host` ever ran at once
    pub fn max_in_flight(&self, host: HostUuid) -> usize {
        let hosts = self.hosts.lock().unwrap();
        hosts.get(&host).map(|h| h.max_in_flight).unwrap_or(0)
    }

    /// Returns how many status queries `host` has served
    pub fn status_queries(&self, host: HostUuid) -> usize {
        let hosts = self.hosts.lock().unwrap();
        hosts.get(&host).map(|h| h.status_queries).unwrap_or(0)
    }

    fn unreachable(host: HostUuid) -> AgentLinkError {
        AgentLinkError::Unreachable {
            host,
            message: String::from("simulated host is not reachable"),
        }
    }
}

async fn execute(
    command: &Command,
    behavior: &SimBehavior,
    hook: Option<Arc<HookExecutor>>,
) -> Answer {
    match behavior {
        SimBehavior::Fail(message) => Answer::failure(message.clone()),
        SimBehavior::Hold(release) => {
            release.notified().await;
            Answer::success("released")
        }
        SimBehavior::Succeed
        | SimBehavior::DisconnectAfterCompletion
        | SimBehavior::Forget => match (&command.payload, hook) {
            (CommandPayload::RollingMaintenance(c), Some(hook)) => {
                hook.answer(c.stage, &c.payload).await
            }
            _ => Answer::success(format!("simulated {}", command.name())),
        },
    }
}

#[async_trait::async_trait]
impl AgentLink for SimAgent {
    async fn submit(
        &self,
        host: HostUuid,
        command: Command,
    ) -> Result<PendingAnswer, AgentLinkError> {
        let key = command.key();
        let (behavior, hook) = {
            let mut hosts = self.hosts.lock().unwrap();
            let sim_host = match hosts.get_mut(&host) {
                Some(h) if h.reachable => h,
                _ => return Err(Self::unreachable(host)),
            };
            let behavior = sim_host.behavior_for(&command);
            sim_host.commands.insert(key, SimCommandStatus::Running);
            sim_host.started.push(key);
            sim_host.in_flight += 1;
            sim_host.max_in_flight =
                sim_host.max_in_flight.max(sim_host.in_flight);
            (behavior, sim_host.hook.clone())
        };
        debug!(
            self.log,
            "accepted command";
            "host" => %host,
            "command" => %key,
            "behavior" => ?behavior,
        );

        let hosts = Arc::clone(&self.hosts);
        let pending = async move {
            let answer = execute(&command, &behavior, hook).await;
            {
                let mut hosts = hosts.lock().unwrap();
                if let Some(sim_host) = hosts.get_mut(&host) {
                    sim_host.in_flight -= 1;
                    if matches!(behavior, SimBehavior::Forget) {
                        sim_host.commands.remove(&key);
                    } else {
                        sim_host.commands.insert(
                            key,
                            SimCommandStatus::Completed(answer.clone()),
                        );
                    }
                }
            }
            match behavior {
                SimBehavior::DisconnectAfterCompletion
                | SimBehavior::Forget => {
                    Err(AgentLinkError::Disconnected { host })
                }
                _ => Ok(answer),
            }
        };
        Ok(pending.boxed())
    }

    async fn query_status(
        &self,
        host: HostUuid,
        key: CommandKey,
    ) -> Result<AgentCommandStatus, AgentLinkError> {
        let delay = {
            let mut hosts = self.hosts.lock().unwrap();
            let sim_host = match hosts.get_mut(&host) {
                Some(h) if h.reachable => h,
                _ => return Err(Self::unreachable(host)),
            };
            sim_host.status_queries += 1;
            sim_host.query_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let hosts = self.hosts.lock().unwrap();
        let sim_host = match hosts.get(&host) {
            Some(h) if h.reachable => h,
            _ => return Err(Self::unreachable(host)),
        };
        Ok(match sim_host.commands.get(&key) {
            None => AgentCommandStatus::UnknownCommand,
            Some(SimCommandStatus::Running) => AgentCommandStatus::Running,
            Some(SimCommandStatus::Completed(answer)) => {
                AgentCommandStatus::Completed { answer: answer.clone() }
            }
        })
    }
}
