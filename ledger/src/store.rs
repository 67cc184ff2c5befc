// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage of command records
//!
//! [`CommandStore`] is the narrow repository interface the rest of the
//! control plane uses.  Every mutation is a conditional update: the caller
//! states what it expects the record to look like, and the update only
//! applies if that still holds.  This is what linearizes concurrent
//! dispatchers and reconcilers on the same record.
//!
//! [`LedgerStore`] keeps the table in memory and, when configured with ledger
//! paths, commits every mutation to a JSON [`Ledger`] before it becomes
//! visible.

use camino::Utf8PathBuf;
use chrono::DateTime;
use chrono::Utc;
use keel_common::api::external::Error;
use keel_common::api::external::Generation;
use keel_common::api::external::LookupType;
use keel_common::api::external::ResourceType;
use keel_common::bail_unless;
use keel_common::ledger::Ledger;
use keel_common::ledger::Ledgerable;
use keel_types::answer::Answer;
use keel_types::command::CommandKey;
use keel_types::record::CommandRecord;
use keel_types::record::CommandState;
use keel_types::record::Owner;
use serde::Deserialize;
use serde::Serialize;
use serde_with::serde_as;
use slog::debug;
use slog::info;
use slog::o;
use slog::Logger;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use tokio::sync::Mutex;

/// Describes whether a conditional update was applied
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum UpdateStatus {
    /// The row exists and was updated.
    Updated,
    /// The row exists, but was not updated.
    NotUpdatedButExists,
}

/// Precondition for a conditional update
///
/// Tombstoned records never satisfy any condition.
#[derive(Clone, Copy, Debug)]
pub enum UpdateCondition<'a> {
    /// `state_by_management` is one of these states
    State(&'a [CommandState]),
    /// the record has not changed since it was read at this generation
    Generation(Generation),
}

impl UpdateCondition<'_> {
    fn holds(&self, record: &CommandRecord) -> bool {
        if record.is_removed() {
            return false;
        }
        match self {
            UpdateCondition::State(states) => {
                states.contains(&record.state_by_management)
            }
            UpdateCondition::Generation(generation) => {
                record.generation == *generation
            }
        }
    }
}

/// Changes to apply to a record
///
/// Fields left as `None` are unchanged.  Applying an update bumps the
/// record's generation.  A record whose two sides agree on a terminal state
/// after the update is tombstoned.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecordUpdate {
    pub state_by_management: Option<CommandState>,
    pub state_by_agent: Option<CommandState>,
    pub answer: Option<Answer>,
    pub reconcile_attempts: Option<u32>,
}

impl RecordUpdate {
    /// Update only the management-side state
    pub fn management(state: CommandState) -> RecordUpdate {
        RecordUpdate {
            state_by_management: Some(state),
            ..Default::default()
        }
    }

    /// Update both sides to the same state
    pub fn both(state: CommandState) -> RecordUpdate {
        RecordUpdate {
            state_by_management: Some(state),
            state_by_agent: Some(state),
            ..Default::default()
        }
    }

    /// Record `answer` and the terminal state it implies on both sides
    pub fn answered(answer: Answer) -> RecordUpdate {
        let state = answer.terminal_state();
        RecordUpdate { answer: Some(answer), ..RecordUpdate::both(state) }
    }

    pub fn apply(&self, record: &mut CommandRecord, now: DateTime<Utc>) {
        if let Some(state) = self.state_by_management {
            record.state_by_management = state;
        }
        if let Some(state) = self.state_by_agent {
            record.state_by_agent = Some(state);
        }
        if let Some(answer) = &self.answer {
            record.answer = Some(answer.clone());
        }
        if let Some(attempts) = self.reconcile_attempts {
            record.reconcile_attempts = attempts;
        }
        record.generation = record.generation.next();
        record.time_updated = now;
        if record.sides_agree_on_terminal() {
            record.time_removed = Some(now);
        }
    }
}

/// Repository of command records
#[async_trait::async_trait]
pub trait CommandStore: Send + Sync {
    /// Insert all of `records`, or none of them
    ///
    /// Fails with `ObjectAlreadyExists` if any key is already present
    /// (including as a tombstone) or appears more than once in `records`.
    async fn insert_batch(&self, records: Vec<CommandRecord>)
        -> Result<(), Error>;

    /// Fetch one record, tombstoned or not
    async fn find(&self, key: CommandKey)
        -> Result<Option<CommandRecord>, Error>;

    /// Apply `update` to the record at `key` if `condition` holds
    ///
    /// Fails with `ObjectNotFound` if there is no such record.
    async fn update_if(
        &self,
        key: CommandKey,
        condition: UpdateCondition<'_>,
        update: &RecordUpdate,
    ) -> Result<UpdateStatus, Error>;

    /// List live records whose management state is one of `states`
    async fn find_by_state(
        &self,
        states: &[CommandState],
    ) -> Result<Vec<CommandRecord>, Error>;

    /// List live records owned by `owner`
    async fn find_by_owner(
        &self,
        owner: Owner,
    ) -> Result<Vec<CommandRecord>, Error>;

    /// Apply `update` to every live record owned by `owner` whose management
    /// state is one of `states`, returning how many were updated
    async fn update_owned_if_state(
        &self,
        owner: Owner,
        states: &[CommandState],
        update: &RecordUpdate,
    ) -> Result<usize, Error>;

    /// List every record
    async fn list(
        &self,
        include_removed: bool,
    ) -> Result<Vec<CommandRecord>, Error>;

    /// Delete up to `limit` tombstoned records removed before `before`
    /// (`None`: no limit), returning how many were deleted
    async fn purge_removed(
        &self,
        before: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<usize, Error>;
}

/// On-disk form of the command table
#[serde_as]
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct CommandTable {
    generation: Generation,
    #[serde_as(as = "Vec<(_, _)>")]
    records: BTreeMap<CommandKey, CommandRecord>,
}

impl Ledgerable for CommandTable {
    fn is_newer_than(&self, other: &Self) -> bool {
        self.generation > other.generation
    }

    fn generation_bump(&mut self) {
        self.generation = self.generation.next();
    }
}

enum Backing {
    Memory(CommandTable),
    Durable(Ledger<CommandTable>),
}

impl Backing {
    fn table(&self) -> &CommandTable {
        match self {
            Backing::Memory(table) => table,
            Backing::Durable(ledger) => ledger.data(),
        }
    }

    fn table_mut(&mut self) -> &mut CommandTable {
        match self {
            Backing::Memory(table) => table,
            Backing::Durable(ledger) => ledger.data_mut(),
        }
    }

    /// Make the current contents durable
    ///
    /// On failure, each `(key, previous)` pair in `undo` is restored so that
    /// the failed mutation never becomes visible.
    async fn commit(
        &mut self,
        undo: Vec<(CommandKey, Option<CommandRecord>)>,
    ) -> Result<(), Error> {
        let Backing::Durable(ledger) = self else {
            return Ok(());
        };
        if let Err(error) = ledger.commit().await {
            let records = &mut ledger.data_mut().records;
            for (key, previous) in undo {
                match previous {
                    Some(record) => records.insert(key, record),
                    None => records.remove(&key),
                };
            }
            return Err(Error::from(error)
                .internal_context("committing command ledger"));
        }
        Ok(())
    }
}

/// [`CommandStore`] backed by an in-memory table and an optional JSON ledger
pub struct LedgerStore {
    log: Logger,
    backing: Mutex<Backing>,
}

impl LedgerStore {
    /// Store that keeps records only in memory
    pub fn new_in_memory(log: &Logger) -> LedgerStore {
        LedgerStore {
            log: log.new(o!("component" => "LedgerStore")),
            backing: Mutex::new(Backing::Memory(CommandTable::default())),
        }
    }

    /// Store that commits every change to each of `paths`
    ///
    /// Existing contents are loaded from the newest readable copy.  If none
    /// of `paths` can be read, the store starts empty.  With no paths, this
    /// is the same as [`LedgerStore::new_in_memory`].
    pub async fn new(log: &Logger, paths: Vec<Utf8PathBuf>) -> LedgerStore {
        let log = log.new(o!("component" => "LedgerStore"));
        if paths.is_empty() {
            return LedgerStore {
                log,
                backing: Mutex::new(Backing::Memory(CommandTable::default())),
            };
        }

        let ledger = match Ledger::<CommandTable>::new(&log, paths.clone())
            .await
        {
            Some(ledger) => {
                info!(
                    log,
                    "loaded command ledger";
                    "generation" => %ledger.data().generation,
                    "records" => ledger.data().records.len(),
                );
                ledger
            }
            None => {
                info!(log, "no command ledger found, starting empty");
                Ledger::new_with(&log, paths, CommandTable::default())
            }
        };
        LedgerStore { log, backing: Mutex::new(Backing::Durable(ledger)) }
    }
}

fn not_found(key: CommandKey) -> Error {
    LookupType::ByCompositeId(key.to_string())
        .into_not_found(ResourceType::Command)
}

#[async_trait::async_trait]
impl CommandStore for LedgerStore {
    async fn insert_batch(
        &self,
        records: Vec<CommandRecord>,
    ) -> Result<(), Error> {
        bail_unless!(!records.is_empty(), "inserting an empty command batch");

        let mut backing = self.backing.lock().await;
        let table = backing.table_mut();
        let mut batch_keys = BTreeSet::new();
        if let Some(existing) = records.iter().find(|r| {
            table.records.contains_key(&r.key()) || !batch_keys.insert(r.key())
        }) {
            return Err(Error::ObjectAlreadyExists {
                type_name: ResourceType::Command,
                object_name: existing.key().to_string(),
            });
        }

        let mut undo = Vec::with_capacity(records.len());
        for record in records {
            let key = record.key();
            undo.push((key, None));
            table.records.insert(key, record);
        }
        let count = undo.len();
        backing.commit(undo).await?;
        debug!(self.log, "inserted command records"; "count" => count);
        Ok(())
    }

    async fn find(
        &self,
        key: CommandKey,
    ) -> Result<Option<CommandRecord>, Error> {
        let backing = self.backing.lock().await;
        Ok(backing.table().records.get(&key).cloned())
    }

    async fn update_if(
        &self,
        key: CommandKey,
        condition: UpdateCondition<'_>,
        update: &RecordUpdate,
    ) -> Result<UpdateStatus, Error> {
        let mut backing = self.backing.lock().await;
        let record = backing
            .table_mut()
            .records
            .get_mut(&key)
            .ok_or_else(|| not_found(key))?;
        if !condition.holds(record) {
            return Ok(UpdateStatus::NotUpdatedButExists);
        }

        let previous = record.clone();
        update.apply(record, Utc::now());
        backing.commit(vec![(key, Some(previous))]).await?;
        Ok(UpdateStatus::Updated)
    }

    async fn find_by_state(
        &self,
        states: &[CommandState],
    ) -> Result<Vec<CommandRecord>, Error> {
        let backing = self.backing.lock().await;
        Ok(backing
            .table()
            .records
            .values()
            .filter(|r| {
                !r.is_removed() && states.contains(&r.state_by_management)
            })
            .cloned()
            .collect())
    }

    async fn find_by_owner(
        &self,
        owner: Owner,
    ) -> Result<Vec<CommandRecord>, Error> {
        let backing = self.backing.lock().await;
        Ok(backing
            .table()
            .records
            .values()
            .filter(|r| !r.is_removed() && r.is_owned_by(&owner))
            .cloned()
            .collect())
    }

    async fn update_owned_if_state(
        &self,
        owner: Owner,
        states: &[CommandState],
        update: &RecordUpdate,
    ) -> Result<usize, Error> {
        let mut backing = self.backing.lock().await;
        let now = Utc::now();
        let condition = UpdateCondition::State(states);
        let mut undo = Vec::new();
        for (key, record) in backing.table_mut().records.iter_mut() {
            if record.is_owned_by(&owner) && condition.holds(record) {
                undo.push((*key, Some(record.clone())));
                update.apply(record, now);
            }
        }
        let count = undo.len();
        if count > 0 {
            backing.commit(undo).await?;
        }
        Ok(count)
    }

    async fn list(
        &self,
        include_removed: bool,
    ) -> Result<Vec<CommandRecord>, Error> {
        let backing = self.backing.lock().await;
        Ok(backing
            .table()
            .records
            .values()
            .filter(|r| include_removed || !r.is_removed())
            .cloned()
            .collect())
    }

    async fn purge_removed(
        &self,
        before: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<usize, Error> {
        let mut backing = self.backing.lock().await;
        let table = backing.table_mut();
        let doomed: Vec<CommandKey> = table
            .records
            .values()
            .filter(|r| r.time_removed.is_some_and(|t| t < before))
            .map(|r| r.key())
            .take(limit.unwrap_or(usize::MAX))
            .collect();

        let mut undo = Vec::with_capacity(doomed.len());
        for key in doomed {
            if let Some(record) = table.records.remove(&key) {
                undo.push((key, Some(record)));
            }
        }
        let count = undo.len();
        if count > 0 {
            backing.commit(undo).await?;
        }
        Ok(count)
    }
}
