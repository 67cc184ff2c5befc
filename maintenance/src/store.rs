// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage for the results of maintenance stages

use keel_common::api::external::Error;
use keel_common::typed_uuid::HostUuid;
use keel_common::typed_uuid::MaintenancePlanUuid;
use keel_types::maintenance::Stage;
use keel_types::maintenance::StageResult;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// Keeps the result of every stage that ran, keyed by plan, host, and stage
///
/// Results outlive the plan that produced them.
#[async_trait::async_trait]
pub trait MaintenanceResultStore: Send + Sync {
    /// Store `result`, replacing any earlier result for the same plan, host
    /// and stage
    async fn record(&self, result: StageResult) -> Result<(), Error>;

    /// Returns every result for `plan_id`, ordered by host and stage
    async fn results(
        &self,
        plan_id: MaintenancePlanUuid,
    ) -> Result<Vec<StageResult>, Error>;
}

type ResultKey = (MaintenancePlanUuid, HostUuid, Stage);

#[derive(Default)]
pub struct InMemoryResultStore {
    results: Mutex<BTreeMap<ResultKey, StageResult>>,
}

impl InMemoryResultStore {
    pub fn new() -> InMemoryResultStore {
        InMemoryResultStore::default()
    }
}

#[async_trait::async_trait]
impl MaintenanceResultStore for InMemoryResultStore {
    async fn record(&self, result: StageResult) -> Result<(), Error> {
        let key = (result.plan_id, result.host_id, result.stage);
        self.results.lock().await.insert(key, result);
        Ok(())
    }

    async fn results(
        &self,
        plan_id: MaintenancePlanUuid,
    ) -> Result<Vec<StageResult>, Error> {
        Ok(self
            .results
            .lock()
            .await
            .iter()
            .filter(|((id, _, _), _)| *id == plan_id)
            .map(|(_, result)| result.clone())
            .collect())
    }
}
