// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Data structures and related facilities for representing resources in the
//! administrative surface
//!
//! This includes all representations over the wire, plus some internal types
//! that are shared by more than one crate.

mod error;
pub use error::*;

use schemars::JsonSchema;
use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result as FormatResult;

/// Generation number for a durable record
///
/// Every mutation of a record bumps its generation.  Conditional updates
/// compare against the generation that the writer last observed, so at most
/// one of several concurrent writers can win.
#[derive(
    Copy,
    Clone,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Generation(u64);

impl Generation {
    pub const fn new() -> Generation {
        Generation(1)
    }

    pub const fn from_u64(value: u64) -> Generation {
        Generation(value)
    }

    pub fn next(&self) -> Generation {
        // It should technically be an operational error if this wraps.  But it
        // seems unlikely enough to happen in practice that we can probably feel
        // safe with saturating.
        Generation(self.0.saturating_add(1))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for Generation {
    fn default() -> Self {
        Generation::new()
    }
}

impl Display for Generation {
    fn fmt(&self, f: &mut Formatter<'_>) -> FormatResult {
        f.write_str(&self.0.to_string())
    }
}

/// Identifies a type of resource managed by the control plane
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    JsonSchema,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    strum::EnumIter,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceType {
    BackgroundTask,
    Cluster,
    Command,
    ControlPlaneNode,
    Host,
    MaintenancePlan,
    Pod,
    StoragePool,
    VirtualMachine,
    Volume,
    Zone,
}

impl ResourceType {
    pub fn label(&self) -> &'static str {
        self.into()
    }
}

impl Display for ResourceType {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod test {
    use super::Generation;
    use super::ResourceType;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_resource_type_labels_parse_back() {
        for resource_type in ResourceType::iter() {
            let parsed = ResourceType::from_str(resource_type.label())
                .expect("label parses");
            assert_eq!(parsed, resource_type);
        }
        assert_eq!(ResourceType::VirtualMachine.to_string(), "virtual_machine");
        assert!(ResourceType::from_str("template").is_err());
    }

    #[test]
    fn test_generation_ordering() {
        let g1 = Generation::new();
        let g2 = g1.next();
        assert!(g2 > g1);
        assert_eq!(g2.as_u64(), 2);
        assert_eq!(Generation::from_u64(u64::MAX).next().as_u64(), u64::MAX);
    }
}
