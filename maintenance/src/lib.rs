// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Rolling maintenance
//!
//! A [`MaintenancePlan`](keel_types::maintenance::MaintenancePlan) takes
//! every host in its scope through the stages `PreFlight`, `PreMaintenance`
//! and `Maintenance`.  Hosts within one cluster go one at a time so that the
//! cluster never loses more than one host's capacity.  Clusters proceed
//! concurrently.

mod coordinator;
mod inventory;
mod store;

pub use coordinator::MaintenanceCoordinator;
pub use coordinator::StartedPlan;
pub use inventory::MaintenanceInventory;
pub use store::InMemoryResultStore;
pub use store::MaintenanceResultStore;
