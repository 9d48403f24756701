// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Configuration for `icnd`.

use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::configurator::RendezvousConfig;
use common::ids::Connector;

/// Run-time settings, from the config file with command-line overrides on
/// top.
#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// If set, where the log should be written.  If not set, the log goes
    /// to stdout.
    pub log_file: Option<String>,

    /// Output log info in unstructured text or json?
    pub log_format: common::logging::LogFormat,

    /// Where the resource manager listens.
    pub rm_address: SocketAddr,

    /// Bound on every socket operation against the resource manager.
    pub rm_timeout_secs: u64,

    /// Forward inter-switch edges through fast-failover groups.
    pub groups_enabled: bool,

    /// Place each of a switch's edges in its own table, chained by goto
    /// instructions.
    pub multi_table: bool,

    /// Start processing edges immediately instead of waiting for an
    /// explicit activation.
    pub activate_on_start: bool,

    /// The rendezvous node's identity, when this controller seeds it.
    pub rendezvous: Option<RendezvousSection>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: None,
            log_format: common::logging::LogFormat::Json,
            rm_address: SocketAddr::new(
                IpAddr::V4(Ipv4Addr::LOCALHOST),
                common::DEFAULT_RM_PORT,
            ),
            rm_timeout_secs: 30,
            groups_enabled: false,
            multi_table: false,
            activate_on_start: false,
            rendezvous: None,
        }
    }
}

impl Config {
    pub fn load(path: Option<&str>) -> anyhow::Result<Config> {
        match path {
            None => Ok(Config::default()),
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {path}"))?;
                toml::from_str(&raw)
                    .with_context(|| format!("parsing config file {path}"))
            }
        }
    }

    pub fn rm_timeout(&self) -> Duration {
        Duration::from_secs(self.rm_timeout_secs)
    }
}

/// The `[rendezvous]` section of the config file.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RendezvousSection {
    pub node: String,
    pub attached_switch: String,
    pub node_id: String,
    pub lid_position: u16,
    pub internal_lid_position: u16,
    pub connector: String,
}

impl RendezvousSection {
    pub fn to_rendezvous(&self) -> anyhow::Result<RendezvousConfig> {
        let connector: Connector = self
            .connector
            .parse()
            .with_context(|| format!("rendezvous connector {}", self.connector))?;
        Ok(RendezvousConfig {
            node: self.node.clone(),
            attached_switch: self.attached_switch.clone(),
            node_id: self.node_id.clone(),
            lid_position: self.lid_position,
            internal_lid_position: self.internal_lid_position,
            connector,
        })
    }
}
