// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Liveness of control plane nodes and hosts

use keel_common::typed_uuid::ControlPlaneNodeUuid;
use keel_common::typed_uuid::HostUuid;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// What is known about a control plane node
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeStatus {
    Up,
    /// confirmed gone: its in-flight commands will never be answered to it
    Down,
    /// no information either way
    Unknown,
}

/// What is known about a host
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostStatus {
    Up,
    /// the agent is temporarily out of contact
    Disconnected,
    /// the host has been permanently taken out of service
    Removed,
}

/// Source of liveness information used by reconciliation
///
/// Only [`NodeStatus::Down`] and [`HostStatus::Removed`] lead to records
/// being interrupted.  Anything less certain leaves records for a later
/// cycle.
#[async_trait::async_trait]
pub trait Membership: Send + Sync {
    async fn node_status(&self, node: ControlPlaneNodeUuid) -> NodeStatus;
    async fn host_status(&self, host: HostUuid) -> HostStatus;
}

#[derive(Clone, Copy, Debug)]
enum NodeEntry {
    LastSeen(Instant),
    Departed,
}

/// [`Membership`] driven by node heartbeats and explicit host state
///
/// A node that has not sent a heartbeat for `dead_after` is considered down.
/// A node we've never heard from is unknown.  Hosts are up unless told
/// otherwise.
pub struct HeartbeatMembership {
    self_id: ControlPlaneNodeUuid,
    dead_after: Duration,
    nodes: Mutex<BTreeMap<ControlPlaneNodeUuid, NodeEntry>>,
    hosts: Mutex<BTreeMap<HostUuid, HostStatus>>,
}

impl HeartbeatMembership {
    pub fn new(
        self_id: ControlPlaneNodeUuid,
        dead_after: Duration,
    ) -> HeartbeatMembership {
        HeartbeatMembership {
            self_id,
            dead_after,
            nodes: Mutex::new(BTreeMap::new()),
            hosts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Record a heartbeat from `node`
    pub async fn heartbeat(&self, node: ControlPlaneNodeUuid) {
        let now = Instant::now();
        self.nodes.lock().await.insert(node, NodeEntry::LastSeen(now));
    }

    /// Record that `node` left the cluster for good
    pub async fn node_departed(&self, node: ControlPlaneNodeUuid) {
        self.nodes.lock().await.insert(node, NodeEntry::Departed);
    }

    pub async fn set_host_status(&self, host: HostUuid, status: HostStatus) {
        self.hosts.lock().await.insert(host, status);
    }
}

#[async_trait::async_trait]
impl Membership for HeartbeatMembership {
    async fn node_status(&self, node: ControlPlaneNodeUuid) -> NodeStatus {
        if node == self.self_id {
            return NodeStatus::Up;
        }
        match self.nodes.lock().await.get(&node) {
            None => NodeStatus::Unknown,
            Some(NodeEntry::Departed) => NodeStatus::Down,
            Some(NodeEntry::LastSeen(when)) => {
                if when.elapsed() > self.dead_after {
                    NodeStatus::Down
                } else {
                    NodeStatus::Up
                }
            }
        }
    }

    async fn host_status(&self, host: HostUuid) -> HostStatus {
        self.hosts
            .lock()
            .await
            .get(&host)
            .copied()
            .unwrap_or(HostStatus::Up)
    }
}
