// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sending commands to agents
//!
//! The [`Dispatcher`] is the only path by which a command reaches an agent.
//! It persists the command first and only then hands it off for delivery.
//! Commands that must execute in sequence are delivered by one worker task
//! per host, so a host sees its sequenced commands one at a time and in the
//! order they were dispatched.  Other commands are delivered from their own
//! tasks.
//!
//! Once an agent accepts a command, the dispatcher waits (for a bounded time)
//! for its answer.  If the answer never arrives, the record stays
//! `Reconciling` and the reconciler picks it up later.

use crate::ledger::CommandLedger;
use crate::ledger::DeliveryHold;
use chrono::Utc;
use keel_agent_link::AgentLink;
use keel_agent_link::AgentLinkError;
use keel_common::api::external::Error;
use keel_common::typed_uuid::HostUuid;
use keel_types::answer::Answer;
use keel_types::command::CommandKey;
use keel_types::command::CommandPayload;
use keel_types::command::RequestSequence;
use keel_types::record::CommandRecord;
use slog::debug;
use slog::error;
use slog::info;
use slog::o;
use slog::warn;
use slog::Logger;
use slog_error_chain::InlineErrorChain;
use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;

/// How many request sequences `dispatch` burns through on collisions with
/// existing records before giving up
const MAX_SEQUENCE_COLLISIONS: usize = 16;

/// What finally happened to a dispatched command, as far as the dispatcher
/// knows
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CommandOutcome {
    /// the agent answered
    Answered(Answer),
    /// the command never reached the agent; its record is `Failed`
    NotDelivered(AgentLinkError),
    /// the agent accepted the command but no answer arrived; the record is
    /// left for reconciliation
    Unresolved(String),
    /// the command was not sent because its record moved on while it was
    /// waiting (e.g., its host was removed)
    Withdrawn(String),
}

impl CommandOutcome {
    /// Returns the answer, treating anything else as a failure
    pub fn into_answer(self) -> Answer {
        match self {
            CommandOutcome::Answered(answer) => answer,
            CommandOutcome::NotDelivered(error) => {
                Answer::failure(InlineErrorChain::new(&error).to_string())
            }
            CommandOutcome::Unresolved(reason)
            | CommandOutcome::Withdrawn(reason) => Answer::failure(reason),
        }
    }
}

/// Acknowledgment that a command was durably recorded and handed off
#[derive(Debug)]
pub struct Dispatched {
    pub key: CommandKey,
    pub host_id: HostUuid,
    outcome: oneshot::Receiver<CommandOutcome>,
}

impl Dispatched {
    /// Wait for the command's outcome
    pub async fn outcome(self) -> CommandOutcome {
        self.outcome.await.unwrap_or_else(|_| {
            CommandOutcome::Unresolved(String::from(
                "dispatcher stopped before the command finished",
            ))
        })
    }
}

struct Job {
    record: CommandRecord,
    hold: DeliveryHold,
    reply: oneshot::Sender<CommandOutcome>,
}

/// Sequenced delivery queues, one per host with commands in flight
type HostQueues = BTreeMap<HostUuid, mpsc::UnboundedSender<Job>>;

/// State shared by every delivery task
struct Sender {
    log: Logger,
    ledger: Arc<CommandLedger>,
    link: Arc<dyn AgentLink>,
    answer_timeout: Duration,
}

impl Sender {
    /// Deliver one command and wait for its answer
    ///
    /// `hold` is released once the agent has accepted the command (or it is
    /// clear that it never will).
    async fn send_one(
        &self,
        record: CommandRecord,
        hold: DeliveryHold,
    ) -> CommandOutcome {
        let key = record.key();
        let host_id = record.host_id;
        let log = self.log.new(o!(
            "command" => key.to_string(),
            "host_id" => host_id.to_string(),
        ));

        // A queued command may have been interrupted or resolved while it
        // waited its turn.  Only a record that is still `Created` is sent.
        match self.ledger.claim_for_delivery(key).await {
            Ok(true) => (),
            Ok(false) => {
                let state = match self.ledger.find(key).await {
                    Ok(Some(found)) => found.state_by_management.to_string(),
                    _ => String::from("gone"),
                };
                info!(
                    log,
                    "command changed before it was sent, not sending it";
                    "state_by_management" => %state,
                );
                return CommandOutcome::Withdrawn(format!(
                    "command was {} before it could be sent",
                    state
                ));
            }
            Err(error) => {
                warn!(
                    log,
                    "failed to claim command for delivery";
                    InlineErrorChain::new(&error),
                );
                return CommandOutcome::Withdrawn(format!(
                    "failed to claim command for delivery: {}",
                    InlineErrorChain::new(&error)
                ));
            }
        }

        let submitted = self.link.submit(host_id, record.command).await;
        let pending = match submitted {
            Ok(pending) => pending,
            Err(error) if !error.accepted() => {
                warn!(
                    log,
                    "failed to deliver command";
                    InlineErrorChain::new(&error),
                );
                let reason = InlineErrorChain::new(&error).to_string();
                if let Err(e) = self.ledger.mark_undelivered(key, &reason).await
                {
                    error!(
                        log,
                        "failed to record undelivered command";
                        InlineErrorChain::new(&e),
                    );
                }
                return CommandOutcome::NotDelivered(error);
            }
            Err(error) => {
                self.note_accepted(&log, key).await;
                drop(hold);
                return self.unresolved(&log, error);
            }
        };

        self.note_accepted(&log, key).await;
        drop(hold);
        let answer = match tokio::time::timeout(self.answer_timeout, pending)
            .await
        {
            Ok(Ok(answer)) => answer,
            Ok(Err(error)) => return self.unresolved(&log, error),
            Err(_) => {
                return self
                    .unresolved(&log, AgentLinkError::Timeout { host: host_id })
            }
        };

        let state = answer.terminal_state();
        match self
            .ledger
            .update_on_answer(
                key.request_sequence,
                key.command_name,
                answer.clone(),
                state,
                state,
            )
            .await
        {
            Ok(_) => {
                debug!(log, "command answered"; "success" => answer.success)
            }
            // The answer is not lost: the agent still has it, and the
            // reconciler will ask for it again.
            Err(error) => error!(
                log,
                "failed to record answer";
                InlineErrorChain::new(&error),
            ),
        }
        CommandOutcome::Answered(answer)
    }

    async fn note_accepted(&self, log: &Logger, key: CommandKey) {
        if let Err(error) = self.ledger.mark_accepted(key).await {
            error!(
                log,
                "failed to record accepted command";
                InlineErrorChain::new(&error),
            );
        }
    }

    fn unresolved(
        &self,
        log: &Logger,
        error: AgentLinkError,
    ) -> CommandOutcome {
        info!(
            log,
            "no answer from agent, leaving command for reconciliation";
            InlineErrorChain::new(&error),
        );
        CommandOutcome::Unresolved(InlineErrorChain::new(&error).to_string())
    }
}

/// Persists commands and delivers them to agents
pub struct Dispatcher {
    log: Logger,
    ledger: Arc<CommandLedger>,
    sender: Arc<Sender>,
    next_sequence: AtomicU64,
    host_queues: Arc<Mutex<HostQueues>>,
}

impl Dispatcher {
    /// `answer_timeout` bounds how long a delivery task waits for an agent's
    /// answer after the agent accepted the command.
    pub fn new(
        log: &Logger,
        ledger: Arc<CommandLedger>,
        link: Arc<dyn AgentLink>,
        answer_timeout: Duration,
    ) -> Dispatcher {
        let log = log.new(o!("component" => "Dispatcher"));
        // Request sequences only need to be unique per node.  Starting from
        // the clock keeps them moving forward across restarts.
        let first = u64::try_from(Utc::now().timestamp_micros()).unwrap_or(1);
        let sender = Arc::new(Sender {
            log: log.clone(),
            ledger: Arc::clone(&ledger),
            link,
            answer_timeout,
        });
        Dispatcher {
            log,
            ledger,
            sender,
            next_sequence: AtomicU64::new(first),
            host_queues: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Start assigning request sequences at `first`
    pub fn with_first_sequence(self, first: RequestSequence) -> Dispatcher {
        self.next_sequence.store(first.as_u64(), Ordering::SeqCst);
        self
    }

    pub fn ledger(&self) -> &Arc<CommandLedger> {
        &self.ledger
    }

    fn next_request_sequence(&self) -> RequestSequence {
        RequestSequence::new(self.next_sequence.fetch_add(1, Ordering::SeqCst))
    }

    /// Persist a command for `host_id` and hand it off for delivery
    ///
    /// This returns once the command is durably recorded.  Nothing is sent
    /// if recording fails.
    pub async fn dispatch(
        &self,
        host_id: HostUuid,
        payload: CommandPayload,
    ) -> Result<Dispatched, Error> {
        let mut persisted = None;
        for _ in 0..MAX_SEQUENCE_COLLISIONS {
            let request_sequence = self.next_request_sequence();
            match self
                .ledger
                .persist_for_delivery(
                    host_id,
                    request_sequence,
                    vec![payload.clone()],
                )
                .await
            {
                Ok(mut records) => {
                    persisted = records.pop();
                    break;
                }
                Err(Error::ObjectAlreadyExists { object_name, .. }) => {
                    warn!(
                        self.log,
                        "request sequence already in use, skipping it";
                        "command" => object_name,
                    );
                }
                Err(error) => return Err(error),
            }
        }
        let (record, hold) = persisted.ok_or_else(|| {
            Error::internal_error("could not find an unused request sequence")
        })?;

        let key = record.key();
        let (reply, outcome) = oneshot::channel();
        let job = Job { record, hold, reply };
        if job.record.command.execute_in_sequence {
            self.enqueue(host_id, job).await;
        } else {
            let sender = Arc::clone(&self.sender);
            tokio::spawn(async move {
                let Job { record, hold, reply } = job;
                let outcome = sender.send_one(record, hold).await;
                let _ = reply.send(outcome);
            });
        }

        debug!(self.log, "dispatched command"; "command" => %key);
        Ok(Dispatched { key, host_id, outcome })
    }

    async fn enqueue(&self, host_id: HostUuid, job: Job) {
        let mut queues = self.host_queues.lock().await;
        let job = match queues.get(&host_id) {
            Some(queue) => match queue.send(job) {
                Ok(()) => return,
                // The worker is gone.  Start a new one.
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(host_worker(
            Arc::clone(&self.sender),
            Arc::clone(&self.host_queues),
            host_id,
            rx,
        ));
        // A freshly-created receiver is still alive.
        let _ = tx.send(job);
        queues.insert(host_id, tx);
    }

    #[cfg(test)]
    async fn hosts_with_queues(&self) -> Vec<HostUuid> {
        self.host_queues.lock().await.keys().copied().collect()
    }
}

/// Delivers one host's sequenced commands, one at a time
///
/// The worker exits once its queue is empty, removing the queue from
/// `queues`.  It checks for emptiness a second time with `queues` locked,
/// the same lock [`Dispatcher::enqueue`] holds while sending, so a job is
/// never left in a queue that nobody is draining.
async fn host_worker(
    sender: Arc<Sender>,
    queues: Arc<Mutex<HostQueues>>,
    host_id: HostUuid,
    mut jobs: mpsc::UnboundedReceiver<Job>,
) {
    debug!(sender.log, "starting sequenced delivery"; "host_id" => %host_id);
    loop {
        let job = match jobs.try_recv() {
            Ok(job) => job,
            Err(_) => {
                let mut queues = queues.lock().await;
                match jobs.try_recv() {
                    Ok(job) => job,
                    Err(_) => {
                        queues.remove(&host_id);
                        debug!(
                            sender.log,
                            "sequenced delivery drained";
                            "host_id" => %host_id,
                        );
                        return;
                    }
                }
            }
        };
        let Job { record, hold, reply } = job;
        let outcome = sender.send_one(record, hold).await;
        let _ = reply.send(outcome);
    }
}
