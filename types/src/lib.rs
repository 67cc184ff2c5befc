// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types shared between keel control plane components
//!
//! These describe commands sent to remote agents and the answers they send
//! back, the records the command ledger keeps about them, maintenance plans,
//! and the inventory descriptors that the coordinator and placement gate
//! consume.

pub mod answer;
pub mod command;
pub mod inventory;
pub mod maintenance;
pub mod record;
pub mod task_status;
