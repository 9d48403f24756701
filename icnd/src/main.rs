// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Main application entry point for `icnd`, the forwarding-state bootstrap
//! daemon for ICN overlays on programmable switches.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use futures::stream::StreamExt;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGQUIT;
use signal_hook::consts::SIGTERM;
use signal_hook_tokio::Signals;
use slog::info;
use structopt::StructOpt;

use crate::config::Config;
use crate::configurator::EdgeConfigurator;
use crate::registry::Registries;
use crate::rm::RmClient;
use crate::rules::LoggingSwitchApi;
use crate::topology::TopologyGraph;

mod combinations;
mod config;
mod configurator;
mod registry;
mod rm;
mod rules;
mod topology;
mod types;

#[derive(Debug, StructOpt)]
#[structopt(name = "icnd", about = "icn forwarding-state bootstrap daemon")]
pub(crate) struct Opt {
    #[structopt(
        long,
        about = "send log data to the named file rather than stdout"
    )]
    log_file: Option<String>,

    #[structopt(long, about = "log format: human or json")]
    log_format: Option<common::logging::LogFormat>,

    #[structopt(long, short = "c", about = "config file to load")]
    config_file: Option<String>,

    #[structopt(long, about = "resource manager address")]
    rm_address: Option<SocketAddr>,

    #[structopt(long, about = "build fast-failover groups for edges")]
    groups: bool,

    #[structopt(long, about = "place each edge in its own table")]
    multi_table: bool,

    #[structopt(long, about = "activate edge configuration immediately")]
    activate: bool,
}

/// Everything the daemon owns, bundled for the task and signal handlers.
pub struct Bootstrap {
    pub log: slog::Logger,
    pub config: Config,
    pub topology: Mutex<TopologyGraph>,
    pub configurator: EdgeConfigurator,
}

fn build_config(opt: &Opt) -> anyhow::Result<Config> {
    let mut config = Config::load(opt.config_file.as_deref())?;
    if opt.log_file.is_some() {
        config.log_file = opt.log_file.clone();
    }
    if let Some(format) = opt.log_format {
        config.log_format = format;
    }
    if let Some(addr) = opt.rm_address {
        config.rm_address = addr;
    }
    config.groups_enabled |= opt.groups;
    config.multi_table |= opt.multi_table;
    config.activate_on_start |= opt.activate;
    Ok(config)
}

async fn handle_signals(mut signals: Signals, log: slog::Logger) {
    while let Some(signal) = signals.next().await {
        info!(log, "received signal, shutting down"; "signal" => signal);
        std::process::exit(0);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opt = Opt::from_args();
    let config = build_config(&opt)?;
    let log = common::logging::init(
        "icnd",
        &config.log_file,
        config.log_format,
    )?;

    info!(log, "icnd starting";
        "rm_address" => %config.rm_address,
        "groups" => config.groups_enabled,
        "multi_table" => config.multi_table);

    let registries = Arc::new(Registries::in_memory());
    let switch_api = Arc::new(LoggingSwitchApi::new(&log));
    let client =
        RmClient::new(&log, config.rm_address, config.rm_timeout());
    let configurator = EdgeConfigurator::new(
        &log,
        Box::new(client),
        registries,
        switch_api,
        config.groups_enabled,
        config.multi_table,
    );

    if let Some(section) = &config.rendezvous {
        let rendezvous = section
            .to_rendezvous()
            .context("invalid rendezvous configuration")?;
        configurator
            .configure_rendezvous(rendezvous)
            .context("seeding rendezvous node")?;
    }
    if config.activate_on_start {
        configurator.activate();
    }

    let bootstrap = Arc::new(Bootstrap {
        log: log.clone(),
        config,
        topology: Mutex::new(TopologyGraph::new(&log)),
        configurator,
    });

    let signals = Signals::new([SIGINT, SIGQUIT, SIGTERM])
        .context("registering signal handler")?;
    let signal_task = tokio::spawn(handle_signals(signals, log.clone()));

    info!(bootstrap.log, "icnd running";
        "rm_address" => %bootstrap.config.rm_address,
        "topology_edges" => bootstrap.topology.lock().unwrap().edge_count());
    signal_task.await?;
    Ok(())
}
