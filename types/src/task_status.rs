// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! What operators see about background tasks

use chrono::DateTime;
use chrono::Utc;
use schemars::JsonSchema;
use serde::Serialize;
use std::time::Duration;

/// One background task (command reconciliation, resource purging) as
/// reported by a control plane node
#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct BackgroundTask {
    pub name: String,
    pub description: String,
    /// delay between the end of one periodic activation and the start of
    /// the next (zero: activated only on request)
    pub period: Duration,

    #[serde(flatten)]
    pub status: TaskStatus,
}

/// What caused an activation
#[derive(Debug, Clone, Copy, Eq, PartialEq, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationReason {
    /// an operator or another component asked for it
    Signaled,
    /// the period elapsed
    Timeout,
}

#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct TaskStatus {
    pub current: CurrentStatus,
    /// outcome of the most recent activation that finished
    pub last: LastResult,
}

#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(
    rename_all = "snake_case",
    tag = "current_status",
    content = "details"
)]
pub enum CurrentStatus {
    /// waiting for the next activation
    Idle,
    Running(CurrentStatusRunning),
}

impl CurrentStatus {
    pub fn is_idle(&self) -> bool {
        matches!(self, CurrentStatus::Idle)
    }
}

#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct CurrentStatusRunning {
    pub start_time: DateTime<Utc>,
    pub reason: ActivationReason,
    /// activation counter, starting from 1
    pub iteration: u64,
}

#[derive(Clone, Debug, JsonSchema, Serialize)]
#[serde(rename_all = "snake_case", tag = "last_result", content = "details")]
pub enum LastResult {
    NeverCompleted,
    Completed(LastResultCompleted),
}

impl LastResult {
    pub fn has_completed(&self) -> bool {
        self.completion().is_some()
    }

    pub fn completion(&self) -> Option<&LastResultCompleted> {
        match self {
            LastResult::Completed(completed) => Some(completed),
            LastResult::NeverCompleted => None,
        }
    }
}

#[derive(Clone, Debug, JsonSchema, Serialize)]
pub struct LastResultCompleted {
    pub iteration: u64,
    pub start_time: DateTime<Utc>,
    pub reason: ActivationReason,
    pub elapsed: Duration,
    /// summary the task produced, e.g. how many records it resolved
    pub details: serde_json::Value,
}
