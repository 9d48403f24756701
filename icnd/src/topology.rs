// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The network topology graph.
//!
//! Links arrive from the controller's topology events in both orientations
//! (A→B and B→A of the same physical cable), so every mutation is keyed by
//! the unordered pair of endpoint connectors and collapses to one logical
//! edge.  Shortest paths are computed on demand; nothing derived from the
//! graph is cached across a mutation.

use std::collections::BTreeMap;

use petgraph::algo::astar;
use petgraph::stable_graph::EdgeIndex;
use petgraph::stable_graph::NodeIndex;
use petgraph::stable_graph::StableGraph;
use petgraph::Undirected;
use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::info;
use slog::warn;

use crate::types::IcndError;
use crate::types::IcndResult;
use common::ids::Connector;
use common::ids::LinkKey;

/// One link as reported by the topology event source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopoLink {
    pub source: Connector,
    pub destination: Connector,
    pub link_id: String,
}

impl TopoLink {
    pub fn new(
        source: Connector,
        destination: Connector,
        link_id: impl ToString,
    ) -> Self {
        TopoLink {
            source,
            destination,
            link_id: link_id.to_string(),
        }
    }

    /// Host-facing edges are excluded from allocation, combinations, and
    /// failover groups.
    pub fn is_host(&self) -> bool {
        self.link_id.starts_with("host")
    }

    /// The identity under which this link's assignment is tracked.
    pub fn key(&self) -> LinkKey {
        LinkKey::new(
            &self.source.switch,
            &self.destination.switch,
            self.source.port,
        )
    }

    /// The same physical link with its stored orientation flipped.
    pub fn reversed(&self) -> TopoLink {
        TopoLink {
            source: self.destination.clone(),
            destination: self.source.clone(),
            link_id: self.link_id.clone(),
        }
    }

    // Orientation-independent identity of the underlying physical link.
    fn dedup_key(&self) -> (String, String) {
        let a = self.source.to_string();
        let b = self.destination.to_string();
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }
}

pub struct TopologyGraph {
    log: slog::Logger,
    graph: StableGraph<String, TopoLink, Undirected>,
    nodes: BTreeMap<String, NodeIndex>,
    edges: BTreeMap<(String, String), EdgeIndex>,
}

impl TopologyGraph {
    pub fn new(log: &slog::Logger) -> Self {
        let log = log.new(slog::o!("unit" => "topology"));
        TopologyGraph {
            log,
            graph: StableGraph::default(),
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    fn node(&mut self, id: &str) -> NodeIndex {
        match self.nodes.get(id) {
            Some(idx) => *idx,
            None => {
                let idx = self.graph.add_node(id.to_string());
                self.nodes.insert(id.to_string(), idx);
                idx
            }
        }
    }

    /// Add a batch of links.  Adding a link whose physical edge is already
    /// present (in either orientation) is a no-op.
    pub fn add_links(&mut self, links: &[TopoLink]) {
        for link in links {
            let key = link.dedup_key();
            if self.edges.contains_key(&key) {
                debug!(self.log, "link already present";
                    "link" => %link.link_id);
                continue;
            }
            let src = self.node(&link.source.switch);
            let dst = self.node(&link.destination.switch);
            let edge = self.graph.add_edge(src, dst, link.clone());
            self.edges.insert(key, edge);
        }
        info!(self.log, "updated topology graph";
            "vertices" => self.graph.node_count(),
            "edges" => self.graph.edge_count());
    }

    /// Remove a batch of links.  Removing an absent link is a no-op.
    pub fn remove_links(&mut self, links: &[TopoLink]) {
        for link in links {
            let key = link.dedup_key();
            match self.edges.remove(&key) {
                Some(edge) => {
                    self.graph.remove_edge(edge);
                }
                None => {
                    warn!(self.log, "removing link that is not in the graph";
                        "link" => %link.link_id);
                }
            }
        }
        info!(self.log, "updated topology graph";
            "vertices" => self.graph.node_count(),
            "edges" => self.graph.edge_count());
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Shortest path between two nodes, unit edge weight, oriented so that
    /// the returned links chain src → … → dst.
    pub fn shortest_path(
        &self,
        src: &str,
        dst: &str,
    ) -> IcndResult<Vec<TopoLink>> {
        let no_path = || IcndError::NoPath {
            src: src.to_string(),
            dst: dst.to_string(),
        };
        let s = *self.nodes.get(src).ok_or_else(no_path)?;
        let d = *self.nodes.get(dst).ok_or_else(no_path)?;

        let (_, node_path) =
            astar(&self.graph, s, |n| n == d, |_| 1u32, |_| 0)
                .ok_or_else(no_path)?;

        let mut links = Vec::with_capacity(node_path.len().saturating_sub(1));
        for pair in node_path.windows(2) {
            let edge = self
                .graph
                .edges_connecting(pair[0], pair[1])
                .next()
                .ok_or_else(no_path)?;
            links.push(edge.weight().clone());
        }
        Ok(orient_path(links, src))
    }
}

/// Flip each link so that consecutive links chain away from `src`.  The
/// graph is undirected, so a stored link's orientation may be backwards
/// relative to the query.
pub fn orient_path(links: Vec<TopoLink>, src: &str) -> Vec<TopoLink> {
    let mut oriented = Vec::with_capacity(links.len());
    let mut previous = src.to_string();
    for link in links {
        let link = if link.source.switch == previous {
            link
        } else {
            link.reversed()
        };
        previous = link.destination.switch.clone();
        oriented.push(link);
    }
    oriented
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_log() -> slog::Logger {
        common::logging::init(
            "test",
            &None,
            common::logging::LogFormat::Human,
        )
        .unwrap()
    }

    fn link(
        src: &str,
        src_port: u32,
        dst: &str,
        dst_port: u32,
        id: &str,
    ) -> TopoLink {
        TopoLink::new(
            Connector::new(src, src_port),
            Connector::new(dst, dst_port),
            id,
        )
    }

    #[test]
    fn test_dedup_both_orientations() {
        let log = test_log();
        let mut graph = TopologyGraph::new(&log);
        let forward = link("openflow:1", 1, "openflow:2", 1, "of:1:1");
        graph.add_links(&[forward.clone(), forward.reversed()]);
        assert_eq!(graph.edge_count(), 1);

        // A second add of the same link is also a no-op.
        graph.add_links(&[forward.clone()]);
        assert_eq!(graph.edge_count(), 1);

        graph.remove_links(&[forward.reversed()]);
        assert_eq!(graph.edge_count(), 0);

        // Removing it again does nothing.
        graph.remove_links(&[forward]);
        assert_eq!(graph.edge_count(), 0);
    }

    #[test]
    fn test_shortest_path_oriented() -> anyhow::Result<()> {
        let log = test_log();
        let mut graph = TopologyGraph::new(&log);
        // host:A - openflow:1 - openflow:2 - host:B, with the middle link
        // stored backwards.
        graph.add_links(&[
            link("host:A", 1, "openflow:1", 1, "host:a"),
            link("openflow:2", 2, "openflow:1", 2, "of:2:2"),
            link("openflow:2", 3, "host:B", 1, "host:b"),
        ]);

        let path = graph.shortest_path("host:A", "host:B")?;
        assert_eq!(path.len(), 3);
        let mut previous = "host:A".to_string();
        for l in &path {
            assert_eq!(l.source.switch, previous);
            previous = l.destination.switch.clone();
        }
        assert_eq!(previous, "host:B");
        Ok(())
    }

    #[test]
    fn test_no_path() {
        let log = test_log();
        let mut graph = TopologyGraph::new(&log);
        graph.add_links(&[
            link("host:A", 1, "openflow:1", 1, "host:a"),
            link("host:B", 1, "openflow:2", 1, "host:b"),
        ]);
        assert!(matches!(
            graph.shortest_path("host:A", "host:B"),
            Err(IcndError::NoPath { .. })
        ));
        assert!(graph.shortest_path("host:A", "host:C").is_err());
    }

    #[test]
    fn test_path_never_contains_removed_link() -> anyhow::Result<()> {
        let log = test_log();
        let mut graph = TopologyGraph::new(&log);
        let shortcut = link("openflow:1", 9, "openflow:3", 9, "of:1:9");
        graph.add_links(&[
            link("openflow:1", 1, "openflow:2", 1, "of:1:1"),
            link("openflow:2", 2, "openflow:3", 1, "of:2:2"),
            shortcut.clone(),
        ]);

        let path = graph.shortest_path("openflow:1", "openflow:3")?;
        assert_eq!(path.len(), 1);

        graph.remove_links(&[shortcut.clone()]);
        let path = graph.shortest_path("openflow:1", "openflow:3")?;
        assert_eq!(path.len(), 2);
        assert!(path.iter().all(|l| l.link_id != shortcut.link_id));
        Ok(())
    }
}
