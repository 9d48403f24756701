// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Identifiers for switches, edge connectors, and links.
//!
//! The SDN controller names an edge connector with a string such as
//! `openflow:1:2` (port 2 of switch `openflow:1`).  These types give that
//! naming structural equality, so lookups never depend on string splitting
//! at the point of use.

use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum IdError {
    #[error("malformed connector id: {0}")]
    BadConnector(String),
    #[error("malformed port number in: {0}")]
    BadPort(String),
}

/// One switch-local edge endpoint: a (switch, port) pair.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Connector {
    /// The owning switch, e.g. `openflow:1`.
    pub switch: String,
    /// The port number within the switch.
    pub port: u32,
}

impl Connector {
    pub fn new(switch: impl ToString, port: u32) -> Self {
        Connector {
            switch: switch.to_string(),
            port,
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.switch, self.port)
    }
}

impl FromStr for Connector {
    type Err = IdError;

    // The port is everything after the last ':'; the switch id itself may
    // contain colons (openflow:1).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (switch, port) = s
            .rsplit_once(':')
            .ok_or_else(|| IdError::BadConnector(s.to_string()))?;
        if switch.is_empty() {
            return Err(IdError::BadConnector(s.to_string()));
        }
        let port =
            port.parse().map_err(|_| IdError::BadPort(s.to_string()))?;
        Ok(Connector {
            switch: switch.to_string(),
            port,
        })
    }
}

/// The identity of one configurable edge: the source switch, the switch or
/// host on the far end, and the egress port on the source switch.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LinkKey {
    pub src_switch: String,
    pub dst_switch: String,
    pub src_port: u32,
}

impl LinkKey {
    pub fn new(
        src_switch: impl ToString,
        dst_switch: impl ToString,
        src_port: u32,
    ) -> Self {
        LinkKey {
            src_switch: src_switch.to_string(),
            dst_switch: dst_switch.to_string(),
            src_port,
        }
    }

    /// The connector on the source side of this edge.
    pub fn connector(&self) -> Connector {
        Connector::new(&self.src_switch, self.src_port)
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{},{},{}:{}",
            self.src_switch, self.dst_switch, self.src_switch, self.src_port
        )
    }
}
