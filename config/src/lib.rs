// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Configuration of a keel control plane node

use camino::Utf8Path;
use camino::Utf8PathBuf;
use dropshot::ConfigLogging;
use keel_common::typed_uuid::ControlPlaneNodeUuid;
use keel_types::inventory::HostDescriptor;
use keel_types::inventory::StoragePoolDescriptor;
use serde::Deserialize;
use serde_with::serde_as;
use serde_with::DurationSeconds;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {err}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        err: std::io::Error,
    },
    #[error("Failed to parse config from {path}: {err}")]
    Parse {
        path: Utf8PathBuf,
        #[source]
        err: toml::de::Error,
    },
    #[error("Invalid config value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

/// Configuration for a control plane node
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Server-wide logging configuration
    pub log: ConfigLogging,
    pub node: NodeConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub purge: PurgeConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Simulated fleet, used when running without real agents
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Config {
    /// Load a `Config` from the given TOML file
    ///
    /// This config object can then be used to create a new control plane
    /// node.
    pub fn from_file<P: AsRef<Utf8Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|err| ConfigError::Io { path: path.into(), err })?;
        let config: Config = toml::from_str(&contents)
            .map_err(|err| ConfigError::Parse { path: path.into(), err })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks constraints that the TOML schema cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reconcile.enabled {
            if self.reconcile.workers == 0 {
                return Err(ConfigError::Invalid {
                    field: "reconcile.workers",
                    message: String::from("must be at least 1"),
                });
            }
            if self.reconcile.period_secs.is_zero() {
                return Err(ConfigError::Invalid {
                    field: "reconcile.period_secs",
                    message: String::from("must be non-zero"),
                });
            }
        }
        if self.reconcile.query_retries == 0 {
            return Err(ConfigError::Invalid {
                field: "reconcile.query_retries",
                message: String::from("must be at least 1"),
            });
        }
        if self.maintenance.stage_timeout_secs.is_zero() {
            return Err(ConfigError::Invalid {
                field: "maintenance.stage_timeout_secs",
                message: String::from("must be non-zero"),
            });
        }
        Ok(())
    }
}

/// Identity and durable state of this node
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct NodeConfig {
    /// unique id of this control plane node
    pub id: ControlPlaneNodeUuid,
    /// files in which the command ledger is kept (none: in memory only)
    #[serde(default)]
    pub ledger_paths: Vec<Utf8PathBuf>,
    /// how long a peer node may go without a heartbeat before it is
    /// considered dead
    #[serde_as(as = "DurationSeconds<u64>")]
    #[serde(default = "NodeConfig::default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: Duration,
}

impl NodeConfig {
    fn default_heartbeat_timeout() -> Duration {
        Duration::from_secs(60)
    }
}

/// Configuration for the command reconciliation background task
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconcileConfig {
    /// whether reconciliation runs on this node at all
    pub enabled: bool,
    /// period (in seconds) for periodic activations of the task
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs: Duration,
    /// maximum number of records resolved concurrently
    pub workers: usize,
    /// records younger than this are left to their dispatcher
    #[serde_as(as = "DurationSeconds<u64>")]
    pub grace_period_secs: Duration,
    /// timeout for one status query to an agent
    #[serde_as(as = "DurationSeconds<u64>")]
    pub query_timeout_secs: Duration,
    /// number of tries for one status query within a cycle
    pub query_retries: u32,
    /// cycles in which the agent could not be reached before a record is
    /// surfaced as interrupted
    pub max_attempts: u32,
    /// whether a live node may take over interrupted records to resolve them
    /// by querying their host
    pub adopt_interrupted: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            enabled: true,
            period_secs: Duration::from_secs(60),
            workers: 100,
            grace_period_secs: Duration::from_secs(600),
            query_timeout_secs: Duration::from_secs(30),
            query_retries: 3,
            max_attempts: 10,
            adopt_interrupted: false,
        }
    }
}

/// Configuration for purging expunged resources
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PurgeConfig {
    /// whether the periodic purge task runs
    pub enabled: bool,
    /// period (in seconds) of the periodic purge; zero disables it
    #[serde_as(as = "DurationSeconds<u64>")]
    pub period_secs: Duration,
    /// delay (in seconds) before the first periodic purge
    #[serde_as(as = "DurationSeconds<u64>")]
    pub initial_delay_secs: Duration,
    /// number of resources removed per batch (zero: unbounded)
    pub batch_size: u64,
    /// the periodic purge only removes resources expunged at least this
    /// many days ago
    pub end_time_difference_days: u32,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        PurgeConfig {
            enabled: false,
            period_secs: Duration::from_secs(24 * 60 * 60),
            initial_delay_secs: Duration::ZERO,
            batch_size: 0,
            end_time_difference_days: 180,
        }
    }
}

/// Configuration for rolling maintenance
#[serde_as]
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// how long the coordinator waits for one host's stage to finish
    #[serde_as(as = "DurationSeconds<u64>")]
    pub stage_timeout_secs: Duration,
    /// (agent side) executable invoked for each stage
    pub hook_path: Utf8PathBuf,
    /// (agent side) how long the hook may run before it is killed
    #[serde_as(as = "DurationSeconds<u64>")]
    pub hook_timeout_secs: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        MaintenanceConfig {
            stage_timeout_secs: Duration::from_secs(120),
            hook_path: Utf8PathBuf::from("/opt/keel/rolling-maintenance"),
            hook_timeout_secs: Duration::from_secs(60),
        }
    }
}

/// A simulated fleet
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SimulationConfig {
    pub hosts: Vec<HostDescriptor>,
    pub pools: Vec<StoragePoolDescriptor>,
}
