// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The command ledger and dispatcher
//!
//! Every command a control plane node sends to an agent is first recorded in
//! the [`CommandLedger`].  The record follows the command through delivery,
//! the agent's answer, and (if something goes wrong along the way)
//! reconciliation.  Records whose two sides agree on a terminal state are
//! tombstoned and eventually purged.

pub mod dispatch;
mod ledger;
pub mod store;

pub use dispatch::CommandOutcome;
pub use dispatch::Dispatched;
pub use dispatch::Dispatcher;
pub use ledger::CommandLedger;
pub use ledger::DeliveryHold;
pub use store::CommandStore;
pub use store::LedgerStore;
pub use store::RecordUpdate;
pub use store::UpdateCondition;
pub use store::UpdateStatus;
