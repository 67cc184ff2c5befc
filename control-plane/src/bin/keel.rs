// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable program to run a keel control plane node

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use keel_agent_link::hook::HookExecutor;
use keel_agent_link::sim::SimAgent;
use keel_config::Config;
use keel_control_plane::ControlPlane;
use keel_control_plane::InMemoryInventory;
use slog::info;
use slog::warn;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "keel", about = "keel control plane node")]
enum Args {
    /// Run a control plane node against the simulated fleet described in
    /// its config file
    Run {
        #[arg(long)]
        config_file: Utf8PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    match Args::parse() {
        Args::Run { config_file } => run(config_file).await,
    }
}

async fn run(config_file: Utf8PathBuf) -> anyhow::Result<()> {
    let config = Config::from_file(&config_file)
        .with_context(|| format!("loading config from {config_file}"))?;
    let log = config
        .log
        .to_logger("keel")
        .context("failed to initialize logger")?;

    let agents = Arc::new(SimAgent::new(&log));
    let hook = if config.maintenance.hook_path.exists() {
        Some(Arc::new(HookExecutor::new(
            &log,
            config.maintenance.hook_path.clone(),
            config.maintenance.hook_timeout_secs,
        )))
    } else {
        warn!(
            log,
            "maintenance hook not found; simulated hosts will answer \
             maintenance commands without running it";
            "hook_path" => %config.maintenance.hook_path,
        );
        None
    };
    for host in &config.simulation.hosts {
        agents.add_host(host.id);
        if let Some(hook) = &hook {
            agents.set_hook(host.id, Arc::clone(hook));
        }
    }

    let inventory =
        Arc::new(InMemoryInventory::from_simulation(&log, &config.simulation));
    let control_plane =
        ControlPlane::new(&log, &config, agents, inventory).await;
    info!(
        log,
        "keel running";
        "node_id" => %control_plane.id(),
        "hosts" => config.simulation.hosts.len(),
        "background_tasks" => control_plane.background_tasks().len(),
    );

    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    control_plane
        .shutdown()
        .await
        .context("failed to stop control plane node")?;
    Ok(())
}
