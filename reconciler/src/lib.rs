// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Background tasks of a control plane node
//!
//! [`driver::Driver`] runs each registered [`driver::BackgroundTask`]
//! periodically and on demand, and keeps track of what each activation did.
//! The most important task is [`reconcile::CommandReconciler`], which works
//! out what happened to commands whose answer never made it into the ledger.

pub mod driver;
pub mod membership;
pub mod reconcile;
pub mod task_set;

pub use driver::BackgroundTask;
pub use driver::Driver;
pub use driver::TaskDefinition;
pub use driver::TaskName;
pub use membership::HeartbeatMembership;
pub use membership::HostStatus;
pub use membership::Membership;
pub use membership::NodeStatus;
pub use reconcile::CommandReconciler;
pub use reconcile::ReconcileStatus;
pub use task_set::ParallelTaskSet;
