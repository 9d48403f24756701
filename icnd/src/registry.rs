// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The external assignment registries.
//!
//! Five registries persist what the configurator has handed out: node ids,
//! link assignments, per-connector LIDs, installed flows, and failover
//! groups.  The durable backends live outside this process; the contract is
//! plain synchronously-acknowledged key/value access with no cross-registry
//! atomicity.  `MemRegistry` is the reference implementation, used by the
//! daemon until an external broker is attached, and by the tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::rules::RuleId;
use crate::types::IcndResult;
use common::ids::Connector;
use common::ids::LinkKey;
use common::lid::Lid;

/// A node name to ICN node-id assignment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub name: String,
    pub node_id: String,
}

/// A link assignment: the LID handed out for one edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub key: LinkKey,
    pub lid: Lid,
    /// The topology event source's own id for this link, when known.
    pub topo_link_id: Option<String>,
}

/// The LID attached to a single edge connector; consumed by the combination
/// pass when it reassembles a switch's edge set.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkInfoEntry {
    pub connector: Connector,
    pub lid: Lid,
}

/// A flow rule the configurator has installed, with the table it landed in
/// and the output ports its action list covers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowEntry {
    pub rule: RuleId,
    pub switch: String,
    pub table: u8,
    pub out_ports: Vec<u32>,
}

/// A fast-failover group bound to an edge connector.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub connector: Connector,
    pub group_id: u32,
}

/// The per-entity registry contract.
pub trait KvStore<K, V>: Send + Sync {
    fn write(&self, key: K, value: V) -> IcndResult<()>;
    fn read(&self, key: &K) -> IcndResult<Option<V>>;
    fn delete(&self, key: &K) -> IcndResult<()>;
    fn read_all(&self) -> IcndResult<Vec<V>>;
}

/// In-memory registry backend.
pub struct MemRegistry<K, V> {
    entries: Mutex<BTreeMap<K, V>>,
}

impl<K: Ord, V> MemRegistry<K, V> {
    pub fn new() -> Self {
        MemRegistry {
            entries: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<K: Ord, V> Default for MemRegistry<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KvStore<K, V> for MemRegistry<K, V>
where
    K: Ord + Clone + Send,
    V: Clone + Send,
{
    fn write(&self, key: K, value: V) -> IcndResult<()> {
        self.entries.lock().unwrap().insert(key, value);
        Ok(())
    }

    fn read(&self, key: &K) -> IcndResult<Option<V>> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn delete(&self, key: &K) -> IcndResult<()> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    fn read_all(&self) -> IcndResult<Vec<V>> {
        Ok(self.entries.lock().unwrap().values().cloned().collect())
    }
}

/// All five registries, bundled for injection into the configurator.
pub struct Registries {
    pub nodes: Box<dyn KvStore<String, NodeEntry>>,
    pub links: Box<dyn KvStore<LinkKey, LinkEntry>>,
    pub link_info: Box<dyn KvStore<Connector, LinkInfoEntry>>,
    pub flows: Box<dyn KvStore<RuleId, FlowEntry>>,
    pub groups: Box<dyn KvStore<Connector, GroupEntry>>,
}

impl Registries {
    pub fn in_memory() -> Self {
        Registries {
            nodes: Box::new(MemRegistry::new()),
            links: Box::new(MemRegistry::new()),
            link_info: Box::new(MemRegistry::new()),
            flows: Box::new(MemRegistry::new()),
            groups: Box::new(MemRegistry::new()),
        }
    }

    /// All link-info entries for edges of one switch.
    pub fn link_info_for_switch(
        &self,
        switch: &str,
    ) -> IcndResult<Vec<LinkInfoEntry>> {
        Ok(self
            .link_info
            .read_all()?
            .into_iter()
            .filter(|e| e.connector.switch == switch)
            .collect())
    }

    /// All flow entries for one switch whose action list outputs to `port`.
    pub fn flows_touching_port(
        &self,
        switch: &str,
        port: u32,
    ) -> IcndResult<Vec<FlowEntry>> {
        Ok(self
            .flows
            .read_all()?
            .into_iter()
            .filter(|e| e.switch == switch && e.out_ports.contains(&port))
            .collect())
    }
}
