// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Edge configuration: the orchestration core of the daemon.
//!
//! Topology changes arrive as batches of links.  For every newly observed
//! inter-switch or switch-to-host edge the configurator obtains a globally
//! unique (node id, LID) pair from the resource manager, persists the
//! assignment through the registries, and emits the flow and group
//! descriptors that realize the edge on the switch.  Once a switch owns two
//! or more edges, one multicast combination rule is synthesized for every
//! subset of its edge set.
//!
//! Per edge the lifecycle is Unconfigured → Allocating → Configured.  A
//! failed or empty allocation quietly reverts the edge to Unconfigured; it
//! is retried the next time its switch's edges are processed.  Removal
//! reverts a Configured edge to Unconfigured and releases its table into a
//! reuse pool.
//!
//! Batches are processed one at a time; all shared state sits behind a
//! single mutex which is never held across a call to the resource manager.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use slog::debug;
use slog::error;
use slog::info;
use slog::warn;

use crate::combinations::k_subsets;
use crate::registry::FlowEntry;
use crate::registry::LinkEntry;
use crate::registry::LinkInfoEntry;
use crate::registry::NodeEntry;
use crate::registry::Registries;
use crate::rm::protocol::LinkStatusMsg;
use crate::rm::protocol::LinkStatusType;
use crate::rm::protocol::ResourceRequest;
use crate::rm::ResourceAllocator;
use crate::rules;
use crate::rules::RuleAction;
use crate::rules::RuleId;
use crate::rules::SwitchApi;
use crate::topology::TopologyGraph;
use crate::topology::TopoLink;
use crate::types::IcndError;
use crate::types::IcndResult;
use common::ids::Connector;
use common::ids::LinkKey;
use common::lid::Lid;
use common::lid::LID_BITS;

/// Where an edge stands in its configuration lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeState {
    Unconfigured,
    Allocating,
    Configured,
}

/// A completed allocation for one edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub key: LinkKey,
    pub node_id: String,
    pub lid: Lid,
    pub table: u8,
}

/// Identity of the rendezvous node, seeded once at bootstrap.  LID
/// positions are in the resource manager's wire bit order.
#[derive(Clone, Debug)]
pub struct RendezvousConfig {
    /// Topology node id of the rendezvous host.
    pub node: String,
    /// The switch the rendezvous host hangs off.
    pub attached_switch: String,
    /// Its ICN node id.
    pub node_id: String,
    /// Wire position of the LID of its attachment link.
    pub lid_position: u16,
    /// Wire position of its internal LID; every path toward the rendezvous
    /// node carries this bit.
    pub internal_lid_position: u16,
    /// The attachment link's connector on the rendezvous side.
    pub connector: Connector,
}

// One primary edge of a switch, as consumed by the combination pass.
#[derive(Clone, Debug)]
struct SwitchEdge {
    lid: Lid,
    connector: Connector,
}

#[derive(Default)]
struct State {
    active: bool,
    assignments: BTreeMap<LinkKey, Assignment>,
    edge_states: BTreeMap<LinkKey, EdgeState>,
    node_ids: BTreeMap<String, String>,
    // Per-switch primary edge lists; each switch owns its own collection.
    switch_edges: BTreeMap<String, Vec<SwitchEdge>>,
    // Tables released by removed edges, reusable by a new edge on the same
    // (switch, port).
    freed_tables: BTreeMap<(String, u32), u8>,
    next_table: BTreeMap<String, u8>,
    tables_per_switch: BTreeMap<String, u8>,
    // Fast-failover groups, one per inter-switch connector.
    groups: BTreeMap<Connector, u32>,
    next_group_id: u32,
    // Links observed so far; buffered for activation and searched for
    // failover alternates.
    link_pool: Vec<TopoLink>,
    rendezvous: Option<RendezvousConfig>,
}

pub struct EdgeConfigurator {
    log: slog::Logger,
    allocator: Box<dyn ResourceAllocator>,
    registries: Arc<Registries>,
    switch_api: Arc<dyn SwitchApi>,
    groups_enabled: bool,
    multi_table: bool,
    state: Mutex<State>,
}

impl EdgeConfigurator {
    pub fn new(
        log: &slog::Logger,
        allocator: Box<dyn ResourceAllocator>,
        registries: Arc<Registries>,
        switch_api: Arc<dyn SwitchApi>,
        groups_enabled: bool,
        multi_table: bool,
    ) -> Self {
        EdgeConfigurator {
            log: log.new(slog::o!("unit" => "configurator")),
            allocator,
            registries,
            switch_api,
            groups_enabled,
            multi_table,
            state: Mutex::new(State::default()),
        }
    }

    /// The lifecycle state of an edge.  Edges never seen report
    /// Unconfigured.
    pub fn edge_state(&self, key: &LinkKey) -> EdgeState {
        *self
            .state
            .lock()
            .unwrap()
            .edge_states
            .get(key)
            .unwrap_or(&EdgeState::Unconfigured)
    }

    pub fn assignment(&self, key: &LinkKey) -> Option<Assignment> {
        self.state.lock().unwrap().assignments.get(key).cloned()
    }

    /// Activate the application: process every link buffered while
    /// inactive.
    pub fn activate(&self) {
        let buffered = {
            let mut state = self.state.lock().unwrap();
            state.active = true;
            state.link_pool.clone()
        };
        info!(self.log, "activating"; "buffered" => buffered.len());
        if self.multi_table {
            self.process_batch_multi_table(&buffered);
        } else {
            self.process_batch(&buffered);
        }
    }

    /// Single-table entry point for a topology add batch.
    pub fn add_links(&self, links: &[TopoLink]) {
        if !self.buffer_or_proceed(links) {
            return;
        }
        self.process_batch(links);
    }

    /// Multi-table entry point: each of a switch's edges goes to its own
    /// table, chained by goto instructions.
    pub fn add_links_multi_table(&self, links: &[TopoLink]) {
        if !self.buffer_or_proceed(links) {
            return;
        }
        self.process_batch_multi_table(links);
    }

    // Record the batch in the link pool.  Returns false when the
    // application is inactive and the links were only buffered.
    fn buffer_or_proceed(&self, links: &[TopoLink]) -> bool {
        let mut state = self.state.lock().unwrap();
        for link in links {
            if !state.link_pool.contains(link) {
                state.link_pool.push(link.clone());
            }
        }
        if !state.active {
            info!(self.log, "application inactive, buffering links";
                "links" => links.len());
        }
        state.active
    }

    fn process_batch(&self, links: &[TopoLink]) {
        for (switch, group) in group_by_switch(links) {
            for link in &group {
                if let Err(e) = self.configure(link) {
                    error!(self.log, "failed to configure edge";
                        "switch" => &switch,
                        "connector" => %link.source,
                        "error" => %e);
                }
            }
            // With the whole group configured, rebuild this switch's
            // multicast combinations.
            if let Err(e) = self.sync_combinations(&switch) {
                error!(self.log, "combination synthesis failed";
                    "switch" => &switch,
                    "error" => %e);
            }
        }
    }

    fn process_batch_multi_table(&self, links: &[TopoLink]) {
        for (switch, group) in group_by_switch(links) {
            // The goto chain is bounded by the number of tables this switch
            // will have once the batch is placed.
            {
                let mut state = self.state.lock().unwrap();
                let assigned = state.next_table.get(&switch).copied().unwrap_or(0);
                let total = assigned.saturating_add(group.len() as u8);
                let entry =
                    state.tables_per_switch.entry(switch.clone()).or_insert(0);
                *entry = (*entry).max(total);
            }
            for link in &group {
                if let Err(e) = self.configure_multi_table(link) {
                    error!(self.log, "failed to configure edge";
                        "switch" => &switch,
                        "connector" => %link.source,
                        "error" => %e);
                }
            }
        }
    }

    /// Configure one edge in table 0.  Returns true if the edge was already
    /// configured or is now; false if the resource manager had no offer.
    pub fn configure(&self, link: &TopoLink) -> IcndResult<bool> {
        self.configure_edge(link, false)
    }

    /// Configure one edge in its own table, chained to the next.
    pub fn configure_multi_table(&self, link: &TopoLink) -> IcndResult<bool> {
        self.configure_edge(link, true)
    }

    fn configure_edge(
        &self,
        link: &TopoLink,
        multi_table: bool,
    ) -> IcndResult<bool> {
        if link.is_host() {
            debug!(self.log, "skipping host-facing edge";
                "link" => &link.link_id);
            return Ok(false);
        }
        let key = link.key();
        let connector = key.connector();

        // Idempotent re-entry: an existing assignment is simply reported.
        {
            let mut state = self.state.lock().unwrap();
            if let Some(assignment) = state.assignments.get(&key).cloned() {
                debug!(self.log, "edge already configured";
                    "connector" => %connector);
                self.ensure_flow_entry(&assignment, &connector);
                return Ok(true);
            }
            state.edge_states.insert(key.clone(), EdgeState::Allocating);
        }

        info!(self.log, "edge not configured, requesting resources";
            "connector" => %connector);
        let offers = match self.allocator.allocate(vec![ResourceRequest {
            src_node: key.src_switch.clone(),
            dst_node: key.dst_switch.clone(),
            connector: key.src_port,
        }]) {
            Ok(offers) => offers,
            Err(e) => {
                self.revert(&key);
                return Err(e);
            }
        };

        let Some(offer) = offers.first() else {
            // Nothing to give; the edge stays unconfigured and is retried
            // on a later batch.
            info!(self.log, "empty resource offer";
                "connector" => %connector);
            self.revert(&key);
            return Ok(false);
        };

        let lid = match Lid::from_wire(&offer.lid) {
            Ok(lid) => lid,
            Err(e) => {
                self.revert(&key);
                return Err(e.into());
            }
        };
        info!(self.log, "received edge resources";
            "connector" => %connector,
            "node_id" => &offer.nid,
            "lid" => ?lid);

        // Table placement, then the group, then the rule itself.
        let (table, goto_table) = if !multi_table {
            (0, None)
        } else {
                let mut state = self.state.lock().unwrap();
                let table = match state
                    .freed_tables
                    .remove(&(key.src_switch.clone(), key.src_port))
                {
                    Some(table) => table,
                    None => {
                        let next = state
                            .next_table
                            .entry(key.src_switch.clone())
                            .or_insert(0);
                        let table = *next;
                        *next += 1;
                        table
                    }
                };
                let total = state
                    .tables_per_switch
                    .get(&key.src_switch)
                    .copied()
                    .unwrap_or(table + 1);
                let goto_table =
                    if table + 1 < total { Some(table + 1) } else { None };
                (table, goto_table)
        };

        let action = self.edge_action(link, &connector);

        let assignment = Assignment {
            key: key.clone(),
            node_id: offer.nid.clone(),
            lid,
            table,
        };
        self.persist_assignment(&assignment, link);

        let rule =
            rules::primary_rule(&connector, &lid, table, action, goto_table);
        if let Err(e) = self.switch_api.install(&key.src_switch, &rule) {
            error!(self.log, "flow installation failed";
                "connector" => %connector,
                "error" => %e);
        }
        if multi_table {
            self.install_default_rule(&key.src_switch, table);
        }

        {
            let mut state = self.state.lock().unwrap();
            state
                .node_ids
                .insert(key.src_switch.clone(), offer.nid.clone());
            state
                .switch_edges
                .entry(key.src_switch.clone())
                .or_default()
                .push(SwitchEdge {
                    lid,
                    connector: connector.clone(),
                });
            state.assignments.insert(key.clone(), assignment);
            state
                .edge_states
                .insert(key.clone(), EdgeState::Configured);
        }
        self.notify_status(&key, LinkStatusType::Add);
        Ok(true)
    }

    // Tell the resource manager an edge came up or went away.  Requires
    // both endpoints' node ids to be known; fire-and-forget either way.
    fn notify_status(&self, key: &LinkKey, status: LinkStatusType) {
        let (node1, node2) = {
            let state = self.state.lock().unwrap();
            let node1 = state.node_ids.get(&key.src_switch).cloned();
            let node2 = state.node_ids.get(&key.dst_switch).cloned();
            (node1, node2)
        };
        let (Some(node1), Some(node2)) = (node1, node2) else {
            return;
        };
        if let Err(e) = self.allocator.notify_link_status(LinkStatusMsg {
            node1,
            node2,
            connector: key.src_port,
            status,
        }) {
            warn!(self.log, "link status notification failed";
                "connector" => %key.connector(),
                "error" => %e);
        }
    }

    fn revert(&self, key: &LinkKey) {
        self.state
            .lock()
            .unwrap()
            .edge_states
            .insert(key.clone(), EdgeState::Unconfigured);
    }

    // The action of an edge's primary rule: through its failover group when
    // groups are enabled and the edge is inter-switch, plain output
    // otherwise.  Creates the group on first use.
    fn edge_action(&self, link: &TopoLink, connector: &Connector) -> RuleAction {
        if !self.groups_enabled || link.destination.switch.contains("host") {
            return RuleAction::Output(connector.port);
        }
        let mut state = self.state.lock().unwrap();
        if let Some(group_id) = state.groups.get(connector) {
            return RuleAction::Group(*group_id);
        }

        let failover = find_alternative_port(&state.link_pool, connector);
        let group_id = state.next_group_id;
        state.next_group_id += 1;
        state.groups.insert(connector.clone(), group_id);
        drop(state);

        if let Err(e) = self.registries.groups.write(
            connector.clone(),
            crate::registry::GroupEntry {
                connector: connector.clone(),
                group_id,
            },
        ) {
            warn!(self.log, "group registry write failed"; "error" => %e);
        }
        let group =
            rules::failover_group(group_id, connector.port, failover);
        if let Err(e) =
            self.switch_api.install_group(&connector.switch, &group)
        {
            error!(self.log, "group installation failed";
                "connector" => %connector,
                "error" => %e);
        }
        RuleAction::Group(group_id)
    }

    // Registry writes for a fresh assignment.  A failure here is logged and
    // tolerated: the in-memory assignment keeps the switch running, at the
    // cost of a durability gap until the next successful write.
    fn persist_assignment(&self, assignment: &Assignment, link: &TopoLink) {
        let key = &assignment.key;
        let connector = key.connector();
        if let Err(e) = self.registries.nodes.write(
            key.src_switch.clone(),
            NodeEntry {
                name: key.src_switch.clone(),
                node_id: assignment.node_id.clone(),
            },
        ) {
            warn!(self.log, "node registry write failed"; "error" => %e);
        }
        if let Err(e) = self.registries.links.write(
            key.clone(),
            LinkEntry {
                key: key.clone(),
                lid: assignment.lid,
                topo_link_id: Some(link.link_id.clone()),
            },
        ) {
            warn!(self.log, "link registry write failed"; "error" => %e);
        }
        if let Err(e) = self.registries.link_info.write(
            connector.clone(),
            LinkInfoEntry {
                connector: connector.clone(),
                lid: assignment.lid,
            },
        ) {
            warn!(self.log, "link info registry write failed"; "error" => %e);
        }
        self.ensure_flow_entry(assignment, &connector);
    }

    fn ensure_flow_entry(&self, assignment: &Assignment, connector: &Connector) {
        let rule = RuleId::from(connector.to_string());
        match self.registries.flows.read(&rule) {
            Ok(Some(_)) => (),
            Ok(None) => {
                if let Err(e) = self.registries.flows.write(
                    rule.clone(),
                    FlowEntry {
                        rule,
                        switch: connector.switch.clone(),
                        table: assignment.table,
                        out_ports: vec![connector.port],
                    },
                ) {
                    warn!(self.log, "flow registry write failed";
                        "error" => %e);
                }
            }
            Err(e) => {
                warn!(self.log, "flow registry read failed"; "error" => %e);
            }
        }
    }

    fn install_default_rule(&self, switch: &str, table: u8) {
        let total = self
            .state
            .lock()
            .unwrap()
            .tables_per_switch
            .get(switch)
            .copied()
            .unwrap_or(table + 1);
        let rule = rules::default_rule(switch, table, total);
        if let Err(e) = self.registries.flows.write(
            rule.id.clone(),
            FlowEntry {
                rule: rule.id.clone(),
                switch: switch.to_string(),
                table,
                out_ports: Vec::new(),
            },
        ) {
            warn!(self.log, "flow registry write failed"; "error" => %e);
        }
        if let Err(e) = self.switch_api.install(switch, &rule) {
            error!(self.log, "default flow installation failed";
                "switch" => switch,
                "table" => table,
                "error" => %e);
        }
    }

    /// Rebuild every multicast combination rule of one switch from scratch.
    /// Invoked after each batch that added a primary edge to the switch.
    fn sync_combinations(&self, switch: &str) -> IcndResult<()> {
        // Edges configured in earlier runs survive in the link-info
        // registry; fold them in before enumerating.
        let recovered = self.registries.link_info_for_switch(switch)?;
        let edges = {
            let mut state = self.state.lock().unwrap();
            let edges =
                state.switch_edges.entry(switch.to_string()).or_default();
            for entry in recovered {
                if !edges.iter().any(|e| e.connector == entry.connector) {
                    edges.push(SwitchEdge {
                        lid: entry.lid,
                        connector: entry.connector,
                    });
                }
            }
            edges.clone()
        };
        if edges.len() < 2 {
            return Ok(());
        }
        info!(self.log, "synthesizing combination rules";
            "switch" => switch,
            "edges" => edges.len());

        let groups: BTreeMap<Connector, u32> =
            self.state.lock().unwrap().groups.clone();
        for k in 2..=edges.len() {
            for subset in k_subsets(&edges, k)? {
                let positions: Vec<u16> = subset
                    .iter()
                    .filter_map(|e| e.lid.bit_position())
                    .collect();
                if positions.len() != subset.len() {
                    return Err(IcndError::Encoding(format!(
                        "switch {switch} has an edge with an empty lid"
                    )));
                }
                let combined = Lid::combine(positions)?;
                let ports: Vec<u32> =
                    subset.iter().map(|e| e.connector.port).collect();
                let actions: Vec<RuleAction> = subset
                    .iter()
                    .map(|e| match groups.get(&e.connector) {
                        Some(group_id) => RuleAction::Group(*group_id),
                        None => RuleAction::Output(e.connector.port),
                    })
                    .collect();

                let rule =
                    rules::combination_rule(switch, &ports, &combined, actions);
                if let Err(e) = self.registries.flows.write(
                    rule.id.clone(),
                    FlowEntry {
                        rule: rule.id.clone(),
                        switch: switch.to_string(),
                        table: 0,
                        out_ports: ports,
                    },
                ) {
                    warn!(self.log, "flow registry write failed";
                        "error" => %e);
                }
                if let Err(e) = self.switch_api.install(switch, &rule) {
                    error!(self.log, "combination flow installation failed";
                        "switch" => switch,
                        "error" => %e);
                }
            }
        }
        Ok(())
    }

    /// Remove a batch of links: delete their assignments and withdraw their
    /// rules.
    pub fn remove_links(&self, links: &[TopoLink]) {
        for link in links {
            if link.is_host() {
                continue;
            }
            info!(self.log, "removing edge"; "connector" => %link.source);
            self.remove_link(link);
        }
    }

    fn remove_link(&self, link: &TopoLink) {
        let key = link.key();
        let connector = key.connector();
        let removed = {
            let mut state = self.state.lock().unwrap();
            state.link_pool.retain(|l| l != link);
            let Some(assignment) = state.assignments.remove(&key) else {
                debug!(self.log, "edge was not configured";
                    "connector" => %connector);
                return;
            };
            state
                .edge_states
                .insert(key.clone(), EdgeState::Unconfigured);
            if let Some(edges) = state.switch_edges.get_mut(&key.src_switch) {
                edges.retain(|e| e.connector != connector);
            }
            assignment
        };

        if let Err(e) = self.registries.links.delete(&key) {
            warn!(self.log, "link registry delete failed"; "error" => %e);
        }
        if let Err(e) = self.registries.link_info.delete(&connector) {
            warn!(self.log, "link info registry delete failed";
                "error" => %e);
        }
        self.notify_status(&key, LinkStatusType::Rmv);

        if self.multi_table {
            // The edge's table becomes reusable for a future edge on the
            // same port.
            self.state.lock().unwrap().freed_tables.insert(
                (key.src_switch.clone(), key.src_port),
                removed.table,
            );
            let rule = RuleId::from(connector.to_string());
            if let Err(e) = self.registries.flows.delete(&rule) {
                warn!(self.log, "flow registry delete failed"; "error" => %e);
            }
            if let Err(e) =
                self.switch_api
                    .withdraw(&key.src_switch, removed.table, &rule)
            {
                error!(self.log, "flow withdrawal failed";
                    "connector" => %connector,
                    "error" => %e);
            }
        } else {
            // Withdraw every rule whose output set includes this port,
            // combination rules included.
            let touching = match self
                .registries
                .flows_touching_port(&key.src_switch, key.src_port)
            {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(self.log, "flow registry read failed";
                        "error" => %e);
                    Vec::new()
                }
            };
            info!(self.log, "withdrawing flows for removed edge";
                "connector" => %connector,
                "flows" => touching.len());
            for entry in touching {
                if let Err(e) = self.registries.flows.delete(&entry.rule) {
                    warn!(self.log, "flow registry delete failed";
                        "error" => %e);
                }
                if let Err(e) = self.switch_api.withdraw(
                    &key.src_switch,
                    entry.table,
                    &entry.rule,
                ) {
                    error!(self.log, "flow withdrawal failed";
                        "rule" => %entry.rule,
                        "error" => %e);
                }
            }
        }
    }

    /// Seed the rendezvous node's own identity: its node id, the LID of its
    /// attachment link, and the registry entries, without involving the
    /// resource manager.
    pub fn configure_rendezvous(
        &self,
        cfg: RendezvousConfig,
    ) -> IcndResult<()> {
        let lid = Lid::primary(wire_to_internal(cfg.lid_position)?)?;
        let key = LinkKey::new(
            &cfg.node,
            &cfg.attached_switch,
            cfg.connector.port,
        );
        info!(self.log, "configuring rendezvous node";
            "node" => &cfg.node,
            "node_id" => &cfg.node_id);

        if let Err(e) = self.registries.nodes.write(
            cfg.node.clone(),
            NodeEntry {
                name: cfg.node.clone(),
                node_id: cfg.node_id.clone(),
            },
        ) {
            warn!(self.log, "node registry write failed"; "error" => %e);
        }
        if let Err(e) = self.registries.links.write(
            key.clone(),
            LinkEntry {
                key: key.clone(),
                lid,
                topo_link_id: None,
            },
        ) {
            warn!(self.log, "link registry write failed"; "error" => %e);
        }

        let mut state = self.state.lock().unwrap();
        state.node_ids.insert(cfg.node.clone(), cfg.node_id.clone());
        state.assignments.insert(
            key.clone(),
            Assignment {
                key: key.clone(),
                node_id: cfg.node_id.clone(),
                lid,
                table: 0,
            },
        );
        state.edge_states.insert(key, EdgeState::Configured);
        state.rendezvous = Some(cfg);
        Ok(())
    }

    /// Look up the (node id, LID) pair of a link, allocating and persisting
    /// it if this is the first request.  Returns None when the resource
    /// manager has nothing to offer.
    pub fn node_link_information(
        &self,
        src_node: &str,
        dst_node: &str,
    ) -> IcndResult<Option<(String, Lid)>> {
        {
            let state = self.state.lock().unwrap();
            let known = state.assignments.values().find(|a| {
                a.key.src_switch == src_node && a.key.dst_switch == dst_node
            });
            if let Some(assignment) = known {
                return Ok(Some((
                    assignment.node_id.clone(),
                    assignment.lid,
                )));
            }
        }

        let offers = self.allocator.allocate(vec![ResourceRequest {
            src_node: src_node.to_string(),
            dst_node: dst_node.to_string(),
            connector: 0,
        }])?;
        let Some(offer) = offers.first() else {
            return Ok(None);
        };
        let lid = Lid::from_wire(&offer.lid)?;

        let key = LinkKey::new(src_node, dst_node, 0);
        if let Err(e) = self.registries.nodes.write(
            src_node.to_string(),
            NodeEntry {
                name: src_node.to_string(),
                node_id: offer.nid.clone(),
            },
        ) {
            warn!(self.log, "node registry write failed"; "error" => %e);
        }
        if let Err(e) = self.registries.links.write(
            key.clone(),
            LinkEntry {
                key: key.clone(),
                lid,
                topo_link_id: None,
            },
        ) {
            warn!(self.log, "link registry write failed"; "error" => %e);
        }

        let mut state = self.state.lock().unwrap();
        state.node_ids.insert(src_node.to_string(), offer.nid.clone());
        state.assignments.insert(
            key.clone(),
            Assignment {
                key: key.clone(),
                node_id: offer.nid.clone(),
                lid,
                table: 0,
            },
        );
        state.edge_states.insert(key, EdgeState::Configured);
        Ok(Some((offer.nid.clone(), lid)))
    }

    /// Install a rule for a manually chosen LID position, bypassing the
    /// resource manager.  Nothing is persisted; this exists for bench
    /// bring-up.
    pub fn configure_edge_manual(
        &self,
        switch: &str,
        port: u32,
        wire_lid_position: u16,
    ) -> IcndResult<()> {
        let lid = Lid::primary(wire_to_internal(wire_lid_position)?)?;
        let connector = Connector::new(switch, port);
        info!(self.log, "manually configuring edge";
            "connector" => %connector,
            "lid" => ?lid);
        let rule = rules::primary_rule(
            &connector,
            &lid,
            0,
            RuleAction::Output(port),
            None,
        );
        self.switch_api.install(switch, &rule)
    }

    /// The forwarding identifier a host needs to reach the rendezvous node:
    /// the rendezvous internal LID combined with the LID of every assigned
    /// link along the shortest path.
    pub fn rendezvous_fid(
        &self,
        host: &str,
        topology: &TopologyGraph,
    ) -> IcndResult<Lid> {
        let (rendezvous, assignments) = {
            let state = self.state.lock().unwrap();
            let Some(cfg) = state.rendezvous.clone() else {
                return Err(IcndError::Missing(
                    "rendezvous node not configured".to_string(),
                ));
            };
            (cfg, state.assignments.clone())
        };

        let path = topology.shortest_path(host, &rendezvous.node)?;
        let mut positions =
            vec![wire_to_internal(rendezvous.internal_lid_position)?];
        for link in &path {
            if let Some(assignment) = assignments.get(&link.key()) {
                if let Some(pos) = assignment.lid.bit_position() {
                    positions.push(pos);
                }
            }
        }
        debug!(self.log, "rendezvous fid positions";
            "host" => host,
            "positions" => ?positions);
        Ok(Lid::combine(positions)?)
    }
}

// A wire-order bit position, as carried by configuration and the resource
// manager, mapped to the internal bit order.
fn wire_to_internal(pos: u16) -> IcndResult<u16> {
    if pos >= LID_BITS {
        return Err(IcndError::Invalid(format!(
            "lid position {pos} outside [0, {LID_BITS})"
        )));
    }
    Ok(LID_BITS - 1 - pos)
}

/// Group a batch by owning switch, dropping host-facing edges, so one
/// combinatorial pass covers each switch.
fn group_by_switch(links: &[TopoLink]) -> BTreeMap<String, Vec<TopoLink>> {
    let mut grouped: BTreeMap<String, Vec<TopoLink>> = BTreeMap::new();
    for link in links {
        if link.is_host() {
            continue;
        }
        grouped
            .entry(link.source.switch.clone())
            .or_default()
            .push(link.clone());
    }
    grouped
}

/// Another inter-switch port on the same switch, usable as the failover
/// bucket of `connector`'s group.  Host-facing ports are never eligible.
fn find_alternative_port(
    pool: &[TopoLink],
    connector: &Connector,
) -> Option<u32> {
    pool.iter()
        .filter(|l| !l.is_host() && !l.destination.switch.contains("host"))
        .find(|l| {
            l.source.switch == connector.switch
                && l.source.port != connector.port
        })
        .map(|l| l.source.port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rm::protocol::LinkStatusMsg;
    use crate::rm::protocol::ResourceOffer;
    use crate::rules::FlowRule;
    use crate::rules::RuleRecorder;
    use crate::rules::PRIMARY_PRIORITY;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    fn test_log() -> slog::Logger {
        common::logging::init(
            "test",
            &None,
            common::logging::LogFormat::Human,
        )
        .unwrap()
    }

    // Hands out one canned offer per allocation call.
    struct StubAllocator {
        offers: Mutex<VecDeque<ResourceOffer>>,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ResourceAllocator for StubAllocator {
        fn allocate(
            &self,
            _requests: Vec<ResourceRequest>,
        ) -> IcndResult<Vec<ResourceOffer>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(IcndError::Allocation(
                    "manager unreachable".to_string(),
                ));
            }
            Ok(self
                .offers
                .lock()
                .unwrap()
                .pop_front()
                .map(|o| vec![o])
                .unwrap_or_default())
        }

        fn notify_link_status(&self, _msg: LinkStatusMsg) -> IcndResult<()> {
            Ok(())
        }
    }

    struct Harness {
        configurator: EdgeConfigurator,
        recorder: Arc<RuleRecorder>,
        registries: Arc<Registries>,
        calls: Arc<AtomicUsize>,
    }

    fn harness(positions: &[u16], groups: bool, multi_table: bool) -> Harness {
        let offers = positions
            .iter()
            .enumerate()
            .map(|(i, pos)| ResourceOffer {
                nid: format!("{:08}", i + 1),
                lid: Lid::primary(*pos).unwrap().to_wire(),
            })
            .collect();
        let calls = Arc::new(AtomicUsize::new(0));
        let allocator = StubAllocator {
            offers: Mutex::new(offers),
            calls: calls.clone(),
            fail: false,
        };
        let registries = Arc::new(Registries::in_memory());
        let recorder = Arc::new(RuleRecorder::new());
        let configurator = EdgeConfigurator::new(
            &test_log(),
            Box::new(allocator),
            registries.clone(),
            recorder.clone(),
            groups,
            multi_table,
        );
        Harness {
            configurator,
            recorder,
            registries,
            calls,
        }
    }

    fn tl(
        src_switch: &str,
        src_port: u32,
        dst_switch: &str,
        dst_port: u32,
        id: &str,
    ) -> TopoLink {
        TopoLink::new(
            Connector::new(src_switch, src_port),
            Connector::new(dst_switch, dst_port),
            id,
        )
    }

    // The LID bit positions a rule matches on, recovered from its match
    // addresses.
    fn rule_positions(rule: &FlowRule) -> Vec<u16> {
        let m = rule.matches.ipv6.as_ref().unwrap();
        Lid::from_addresses(m.src, m.dst).positions()
    }

    fn output_ports(rule: &FlowRule) -> Vec<u32> {
        rule.actions
            .iter()
            .map(|a| match a {
                RuleAction::Output(p) => *p,
                other => panic!("expected an output action, got {other:?}"),
            })
            .collect()
    }

    // Three edges on one switch yield three primary rules, three pairwise
    // combination rules, and one triple: seven descriptors whose matched
    // bit positions line up with their output ports.
    #[test]
    fn test_three_edges_seven_rules() {
        let h = harness(&[10, 20, 30], false, false);
        h.configurator.activate();
        h.configurator.add_links(&[
            tl("openflow:1", 1, "openflow:2", 1, "of:1:1"),
            tl("openflow:1", 2, "openflow:3", 1, "of:1:2"),
            tl("openflow:1", 3, "openflow:4", 1, "of:1:3"),
        ]);

        let installed = h.recorder.installed("openflow:1");
        assert_eq!(installed.len(), 7);

        let by_priority = |p: u16| {
            installed
                .iter()
                .filter(|r| r.priority == p)
                .collect::<Vec<_>>()
        };
        assert_eq!(by_priority(PRIMARY_PRIORITY).len(), 3);
        assert_eq!(by_priority(1020).len(), 3);
        assert_eq!(by_priority(1030).len(), 1);

        // Position 10 went to port 1, 20 to port 2, 30 to port 3; each
        // rule's matched positions must correspond exactly to its outputs.
        for rule in &installed {
            let expected: Vec<u32> = rule_positions(rule)
                .iter()
                .map(|pos| (pos / 10) as u32)
                .collect();
            assert_eq!(output_ports(rule), expected, "rule {}", rule.id);
        }
    }

    #[test]
    fn test_configure_idempotent() -> anyhow::Result<()> {
        let h = harness(&[10, 20], false, false);
        h.configurator.activate();
        let link = tl("openflow:1", 1, "openflow:2", 1, "of:1:1");

        assert!(h.configurator.configure(&link)?);
        assert!(h.configurator.configure(&link)?);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);

        let assignment =
            h.configurator.assignment(&link.key()).expect("assigned");
        assert_eq!(assignment.lid.bit_position(), Some(10));
        assert_eq!(
            h.configurator.edge_state(&link.key()),
            EdgeState::Configured
        );
        Ok(())
    }

    // An empty offer leaves the edge unconfigured: no registry writes, no
    // flow descriptors, retry possible later.
    #[test]
    fn test_empty_offer_leaves_unconfigured() -> anyhow::Result<()> {
        let h = harness(&[], false, false);
        h.configurator.activate();
        let link = tl("openflow:5", 3, "openflow:6", 1, "of:5:3");

        assert!(!h.configurator.configure(&link)?);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.configurator.edge_state(&link.key()),
            EdgeState::Unconfigured
        );
        assert!(h.configurator.assignment(&link.key()).is_none());
        assert!(h.registries.links.read_all()?.is_empty());
        assert!(h.registries.nodes.read_all()?.is_empty());
        assert!(h.recorder.installed("openflow:5").is_empty());
        Ok(())
    }

    #[test]
    fn test_allocation_failure_reverts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let allocator = StubAllocator {
            offers: Mutex::new(VecDeque::new()),
            calls: calls.clone(),
            fail: true,
        };
        let configurator = EdgeConfigurator::new(
            &test_log(),
            Box::new(allocator),
            Arc::new(Registries::in_memory()),
            Arc::new(RuleRecorder::new()),
            false,
            false,
        );
        configurator.activate();
        let link = tl("openflow:1", 1, "openflow:2", 1, "of:1:1");
        assert!(configurator.configure(&link).is_err());
        assert_eq!(
            configurator.edge_state(&link.key()),
            EdgeState::Unconfigured
        );
    }

    // While the application is inactive, links are only buffered;
    // activation drains the buffer.
    #[test]
    fn test_activation_gate() {
        let h = harness(&[10], false, false);
        let link = tl("openflow:1", 1, "openflow:2", 1, "of:1:1");
        h.configurator.add_links(std::slice::from_ref(&link));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
        assert!(h.recorder.installed("openflow:1").is_empty());

        h.configurator.activate();
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.recorder.installed("openflow:1").len(), 1);
    }

    #[test]
    fn test_host_links_skipped() {
        let h = harness(&[10], false, false);
        h.configurator.activate();
        h.configurator.add_links(&[tl(
            "host:00:00:00:00:00:01",
            1,
            "openflow:1",
            2,
            "host:00:00:00:00:00:01",
        )]);
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_multi_table_chaining() {
        let h = harness(&[10, 20], false, true);
        h.configurator.activate();
        let l1 = tl("openflow:1", 1, "openflow:2", 1, "of:1:1");
        let l2 = tl("openflow:1", 2, "openflow:3", 1, "of:1:2");
        h.configurator.add_links_multi_table(&[l1.clone(), l2.clone()]);

        let installed = h.recorder.installed("openflow:1");
        // Two primary rules plus one default rule per table.
        assert_eq!(installed.len(), 4);

        let primary_t0 = installed
            .iter()
            .find(|r| r.table == 0 && r.priority == PRIMARY_PRIORITY)
            .unwrap();
        assert_eq!(primary_t0.goto_table, Some(1));

        let primary_t1 = installed
            .iter()
            .find(|r| r.table == 1 && r.priority == PRIMARY_PRIORITY)
            .unwrap();
        assert_eq!(primary_t1.goto_table, None);

        let default_t0 = installed
            .iter()
            .find(|r| r.table == 0 && r.priority == rules::DEFAULT_PRIORITY)
            .unwrap();
        assert_eq!(default_t0.goto_table, Some(1));
        assert!(default_t0.actions.is_empty());

        // The last table punts to the controller instead of chaining.
        let default_t1 = installed
            .iter()
            .find(|r| r.table == 1 && r.priority == rules::DEFAULT_PRIORITY)
            .unwrap();
        assert_eq!(default_t1.goto_table, None);
        assert_eq!(default_t1.actions, vec![RuleAction::Controller]);

        assert_eq!(h.configurator.assignment(&l1.key()).unwrap().table, 0);
        assert_eq!(h.configurator.assignment(&l2.key()).unwrap().table, 1);
    }

    // A removed edge's table is reusable by a later edge on the same
    // (switch, port) instead of growing the table count.
    #[test]
    fn test_freed_table_reuse() {
        let h = harness(&[10, 20, 40], false, true);
        h.configurator.activate();
        let l1 = tl("openflow:1", 1, "openflow:2", 1, "of:1:1");
        let l2 = tl("openflow:1", 2, "openflow:3", 1, "of:1:2");
        h.configurator.add_links_multi_table(&[l1.clone(), l2.clone()]);
        assert_eq!(h.configurator.assignment(&l1.key()).unwrap().table, 0);

        h.configurator.remove_links(std::slice::from_ref(&l1));
        assert!(h.configurator.assignment(&l1.key()).is_none());
        assert_eq!(
            h.configurator.edge_state(&l1.key()),
            EdgeState::Unconfigured
        );
        let withdrawn = h.recorder.withdrawn("openflow:1");
        assert_eq!(
            withdrawn,
            vec![(0, RuleId::from("openflow:1:1"))]
        );

        // The same port comes back: it gets table 0 again.
        h.configurator.add_links_multi_table(std::slice::from_ref(&l1));
        assert_eq!(h.configurator.assignment(&l1.key()).unwrap().table, 0);
    }

    #[test]
    fn test_failover_groups() {
        let h = harness(&[10, 20], true, false);
        h.configurator.activate();
        let l1 = tl("openflow:1", 1, "openflow:2", 1, "of:1:1");
        let l2 = tl("openflow:1", 2, "openflow:3", 1, "of:1:2");
        h.configurator.add_links(&[l1, l2]);

        let groups = h.recorder.groups("openflow:1");
        assert_eq!(groups.len(), 2);
        // Port 1's group fails over to port 2 and vice versa.
        assert_eq!(groups[0].buckets.len(), 2);
        assert_eq!(groups[0].buckets[0].watch_port, 1);
        assert_eq!(groups[0].buckets[1].watch_port, 2);
        assert_eq!(groups[1].buckets[0].watch_port, 2);
        assert_eq!(groups[1].buckets[1].watch_port, 1);

        // Primary and combination rules forward through the groups.
        let installed = h.recorder.installed("openflow:1");
        let primary: Vec<_> = installed
            .iter()
            .filter(|r| r.priority == PRIMARY_PRIORITY)
            .collect();
        assert_eq!(primary.len(), 2);
        assert_eq!(primary[0].actions, vec![RuleAction::Group(0)]);
        assert_eq!(primary[1].actions, vec![RuleAction::Group(1)]);

        let combo = installed.iter().find(|r| r.priority == 1020).unwrap();
        assert_eq!(
            combo.actions,
            vec![RuleAction::Group(0), RuleAction::Group(1)]
        );
    }

    // A host-facing destination never forwards through a group, even with
    // groups enabled.
    #[test]
    fn test_no_group_toward_host() {
        let h = harness(&[10], true, false);
        h.configurator.activate();
        let link = tl("openflow:1", 3, "host:00:00:00:00:00:02", 1, "of:1:3");
        h.configurator.add_links(std::slice::from_ref(&link));

        assert!(h.recorder.groups("openflow:1").is_empty());
        let installed = h.recorder.installed("openflow:1");
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].actions, vec![RuleAction::Output(3)]);
    }

    // Removing an edge withdraws its primary rule and every combination
    // rule whose output set contained the port.
    #[test]
    fn test_remove_withdraws_combinations() {
        let h = harness(&[10, 20, 30], false, false);
        h.configurator.activate();
        let l1 = tl("openflow:1", 1, "openflow:2", 1, "of:1:1");
        h.configurator.add_links(&[
            l1.clone(),
            tl("openflow:1", 2, "openflow:3", 1, "of:1:2"),
            tl("openflow:1", 3, "openflow:4", 1, "of:1:3"),
        ]);
        assert_eq!(h.recorder.installed("openflow:1").len(), 7);

        h.configurator.remove_links(std::slice::from_ref(&l1));
        let withdrawn = h.recorder.withdrawn("openflow:1");
        // Primary of port 1, pairs (1,2) and (1,3), and the triple.
        assert_eq!(withdrawn.len(), 4);
        let ids: Vec<String> =
            withdrawn.iter().map(|(_, r)| r.to_string()).collect();
        assert!(ids.contains(&"openflow:1:1".to_string()));
        assert!(ids.contains(&"openflow:1:1:2".to_string()));
        assert!(ids.contains(&"openflow:1:1:3".to_string()));
        assert!(ids.contains(&"openflow:1:1:2:3".to_string()));
    }

    #[test]
    fn test_node_link_information_read_through() -> anyhow::Result<()> {
        let h = harness(&[10], false, false);
        let first = h
            .configurator
            .node_link_information("openflow:7", "openflow:8")?
            .expect("allocated");
        assert_eq!(first.1.bit_position(), Some(10));

        // The second query answers from the cache.
        let second = h
            .configurator
            .node_link_information("openflow:7", "openflow:8")?
            .expect("cached");
        assert_eq!(first, second);
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn test_rendezvous_fid() -> anyhow::Result<()> {
        let h = harness(&[10], false, false);
        h.configurator.activate();

        // host:A - openflow:1 - host:tm, with the rendezvous node on the
        // far side.
        let attach = tl("openflow:1", 2, "host:tm", 1, "of:1:2");
        h.configurator.add_links(std::slice::from_ref(&attach));

        h.configurator.configure_rendezvous(RendezvousConfig {
            node: "host:tm".to_string(),
            attached_switch: "openflow:1".to_string(),
            node_id: "00000099".to_string(),
            lid_position: 0,
            internal_lid_position: 6,
            connector: Connector::new("host:tm", 1),
        })?;

        let log = test_log();
        let mut topology = TopologyGraph::new(&log);
        topology.add_links(&[
            tl("host:A", 1, "openflow:1", 1, "host:a"),
            attach.clone(),
        ]);

        let fid = h.configurator.rendezvous_fid("host:A", &topology)?;
        // The internal LID (wire position 6) plus the attachment link's
        // LID at internal position 10.
        assert_eq!(fid.count_ones(), 2);
        assert!(fid.get(10));
        assert!(fid.get(LID_BITS - 1 - 6));
        Ok(())
    }

    #[test]
    fn test_manual_configuration() -> anyhow::Result<()> {
        let h = harness(&[], false, false);
        h.configurator.configure_edge_manual("openflow:1", 2, 4)?;
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);

        let installed = h.recorder.installed("openflow:1");
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].actions, vec![RuleAction::Output(2)]);
        assert_eq!(rule_positions(&installed[0]), vec![LID_BITS - 1 - 4]);
        Ok(())
    }
}
