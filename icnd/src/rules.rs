// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Flow and group rule descriptors.
//!
//! Everything here is declarative: a rule describes a match, an ordered
//! action list, and a table placement.  Installation is delegated to the
//! external switch-programming API behind the `SwitchApi` trait; this module
//! never touches the network.
//!
//! The forwarding match is an arbitrary-bitmask IPv6 match in which the mask
//! equals the address, so exactly the set bits of the encoded LID are
//! significant.  A combination rule of size k is installed at priority
//! `1000 + 10*k`, which keeps every multi-port rule above every single-port
//! rule in TCAM order; that ordering is what makes the most-specific match
//! win under arbitrary-bitmask semantics.

use std::fmt;
use std::net::Ipv6Addr;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;

use crate::types::IcndResult;
use common::ids::Connector;
use common::lid::full_form;
use common::lid::Lid;
use common::network::MacAddr;

/// Flat priority of a single-edge forwarding rule.
pub const PRIMARY_PRIORITY: u16 = 1000;
/// Priority of the per-table default (chain or punt) rule.
pub const DEFAULT_PRIORITY: u16 = 900;
/// EtherType carried by every forwarding match.
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

/// Priority of a combination rule over `k` output ports.
pub fn combination_priority(k: usize) -> u16 {
    PRIMARY_PRIORITY + 10 * k as u16
}

/// Identifies one installed rule within a switch.
#[derive(
    Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RuleId(String);

impl From<&str> for RuleId {
    fn from(s: &str) -> Self {
        RuleId(s.to_string())
    }
}

impl From<String> for RuleId {
    fn from(s: String) -> Self {
        RuleId(s)
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The IPv6 half of a forwarding match: source and destination addresses,
/// each significant only under its own bitmask.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv6MaskMatch {
    pub src: Ipv6Addr,
    pub src_mask: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub dst_mask: Ipv6Addr,
}

impl Ipv6MaskMatch {
    /// The self-masked match for a LID: mask == address on both halves, so
    /// only the LID's set bits are significant.
    pub fn for_lid(lid: &Lid) -> Self {
        let (src, dst) = lid.to_addresses();
        Ipv6MaskMatch {
            src,
            src_mask: src,
            dst,
            dst_mask: dst,
        }
    }
}

/// The full match of a rule.  The default rules match on the Ethernet
/// fields alone.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    pub eth_type: u16,
    pub eth_dst: MacAddr,
    pub ipv6: Option<Ipv6MaskMatch>,
}

impl RuleMatch {
    fn ethernet() -> Self {
        RuleMatch {
            eth_type: ETHERTYPE_IPV6,
            eth_dst: MacAddr::ZERO,
            ipv6: None,
        }
    }

    fn for_lid(lid: &Lid) -> Self {
        RuleMatch {
            ipv6: Some(Ipv6MaskMatch::for_lid(lid)),
            ..Self::ethernet()
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleAction {
    /// Output to a switch port.
    Output(u32),
    /// Output through a (fast-failover) group.
    Group(u32),
    /// Punt to the controller.
    Controller,
}

/// A declarative flow rule, consumed by the external switch-programming
/// API.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowRule {
    pub id: RuleId,
    pub table: u8,
    pub priority: u16,
    pub matches: RuleMatch,
    /// Applied in order.
    pub actions: Vec<RuleAction>,
    /// Chain to this table after the actions, if set.
    pub goto_table: Option<u8>,
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "table {} prio {} ", self.table, self.priority)?;
        match &self.matches.ipv6 {
            Some(m) => write!(
                f,
                "{}/{} -> {:?}",
                full_form(m.src),
                full_form(m.dst),
                self.actions
            )?,
            None => write!(f, "* -> {:?}", self.actions)?,
        }
        if let Some(t) = self.goto_table {
            write!(f, " goto {t}")?;
        }
        Ok(())
    }
}

/// One bucket of a fast-failover group: used while its watched port is
/// live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub watch_port: u32,
    pub out_port: u32,
}

/// A fast-failover group: the first bucket outputs to the primary port, the
/// optional second to an alternate port on the same switch.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRule {
    pub id: u32,
    pub buckets: Vec<Bucket>,
}

/// The primary forwarding rule for one edge.
pub fn primary_rule(
    connector: &Connector,
    lid: &Lid,
    table: u8,
    action: RuleAction,
    goto_table: Option<u8>,
) -> FlowRule {
    FlowRule {
        id: RuleId(connector.to_string()),
        table,
        priority: PRIMARY_PRIORITY,
        matches: RuleMatch::for_lid(lid),
        actions: vec![action],
        goto_table,
    }
}

/// The multicast rule for one combination of a switch's edges.  `actions`
/// must be in the combination's enumeration order.
pub fn combination_rule(
    switch: &str,
    ports: &[u32],
    lid: &Lid,
    actions: Vec<RuleAction>,
) -> FlowRule {
    let mut id = switch.to_string();
    for port in ports {
        id.push_str(&format!(":{port}"));
    }
    FlowRule {
        id: RuleId(id),
        table: 0,
        priority: combination_priority(ports.len()),
        matches: RuleMatch::for_lid(lid),
        actions,
        goto_table: None,
    }
}

/// The low-priority default rule of one table in multi-table mode: chain to
/// the next table, or punt to the controller from the last one.
pub fn default_rule(switch: &str, table: u8, tables_in_switch: u8) -> FlowRule {
    let next = table + 1;
    let (actions, goto_table) = if next < tables_in_switch {
        (Vec::new(), Some(next))
    } else {
        (vec![RuleAction::Controller], None)
    };
    FlowRule {
        id: RuleId(format!("{switch}:table{table}:default")),
        table,
        priority: DEFAULT_PRIORITY,
        matches: RuleMatch::ethernet(),
        actions,
        goto_table,
    }
}

/// A fast-failover group for an inter-switch edge.  Without an alternate
/// port the group degenerates to its primary bucket.
pub fn failover_group(
    id: u32,
    primary_port: u32,
    failover_port: Option<u32>,
) -> GroupRule {
    let mut buckets = vec![Bucket {
        watch_port: primary_port,
        out_port: primary_port,
    }];
    if let Some(port) = failover_port {
        buckets.push(Bucket {
            watch_port: port,
            out_port: port,
        });
    }
    GroupRule { id, buckets }
}

/// The switch-programming contract.  Implemented outside this process by
/// the controller's flow/group API.
pub trait SwitchApi: Send + Sync {
    fn install(&self, switch: &str, rule: &FlowRule) -> IcndResult<()>;
    fn install_group(&self, switch: &str, group: &GroupRule)
        -> IcndResult<()>;
    fn withdraw(&self, switch: &str, table: u8, rule: &RuleId)
        -> IcndResult<()>;
}

/// Records every programming call instead of installing anything.  Used by
/// the tests and as the daemon's stand-in until a controller session is
/// attached.
#[derive(Default)]
pub struct RuleRecorder {
    state: Mutex<RecorderState>,
}

#[derive(Default)]
struct RecorderState {
    installed: Vec<(String, FlowRule)>,
    groups: Vec<(String, GroupRule)>,
    withdrawn: Vec<(String, u8, RuleId)>,
}

impl RuleRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// All rules installed so far, per switch.
    pub fn installed(&self, switch: &str) -> Vec<FlowRule> {
        self.state
            .lock()
            .unwrap()
            .installed
            .iter()
            .filter(|(s, _)| s == switch)
            .map(|(_, r)| r.clone())
            .collect()
    }

    pub fn groups(&self, switch: &str) -> Vec<GroupRule> {
        self.state
            .lock()
            .unwrap()
            .groups
            .iter()
            .filter(|(s, _)| s == switch)
            .map(|(_, g)| g.clone())
            .collect()
    }

    pub fn withdrawn(&self, switch: &str) -> Vec<(u8, RuleId)> {
        self.state
            .lock()
            .unwrap()
            .withdrawn
            .iter()
            .filter(|(s, _, _)| s == switch)
            .map(|(_, t, r)| (*t, r.clone()))
            .collect()
    }
}

impl SwitchApi for RuleRecorder {
    fn install(&self, switch: &str, rule: &FlowRule) -> IcndResult<()> {
        self.state
            .lock()
            .unwrap()
            .installed
            .push((switch.to_string(), rule.clone()));
        Ok(())
    }

    fn install_group(
        &self,
        switch: &str,
        group: &GroupRule,
    ) -> IcndResult<()> {
        self.state
            .lock()
            .unwrap()
            .groups
            .push((switch.to_string(), group.clone()));
        Ok(())
    }

    fn withdraw(
        &self,
        switch: &str,
        table: u8,
        rule: &RuleId,
    ) -> IcndResult<()> {
        self.state.lock().unwrap().withdrawn.push((
            switch.to_string(),
            table,
            rule.clone(),
        ));
        Ok(())
    }
}

/// Logs each descriptor as it would be handed to the controller.
pub struct LoggingSwitchApi {
    log: slog::Logger,
}

impl LoggingSwitchApi {
    pub fn new(log: &slog::Logger) -> Self {
        LoggingSwitchApi {
            log: log.new(slog::o!("unit" => "switch_api")),
        }
    }
}

impl SwitchApi for LoggingSwitchApi {
    fn install(&self, switch: &str, rule: &FlowRule) -> IcndResult<()> {
        slog::info!(self.log, "install flow";
            "switch" => switch,
            "rule" => %rule);
        Ok(())
    }

    fn install_group(
        &self,
        switch: &str,
        group: &GroupRule,
    ) -> IcndResult<()> {
        slog::info!(self.log, "install group";
            "switch" => switch,
            "group" => group.id,
            "buckets" => group.buckets.len());
        Ok(())
    }

    fn withdraw(
        &self,
        switch: &str,
        table: u8,
        rule: &RuleId,
    ) -> IcndResult<()> {
        slog::info!(self.log, "withdraw flow";
            "switch" => switch,
            "table" => table,
            "rule" => %rule);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primary_rule_self_masked() -> anyhow::Result<()> {
        let lid = Lid::primary(10)?;
        let rule = primary_rule(
            &Connector::new("openflow:1", 2),
            &lid,
            0,
            RuleAction::Output(2),
            None,
        );
        assert_eq!(rule.priority, PRIMARY_PRIORITY);
        assert_eq!(rule.matches.eth_type, ETHERTYPE_IPV6);
        assert!(rule.matches.eth_dst.is_null());
        let m = rule.matches.ipv6.unwrap();
        assert_eq!(m.src, m.src_mask);
        assert_eq!(m.dst, m.dst_mask);
        let (src, dst) = lid.to_addresses();
        assert_eq!(m.src, src);
        assert_eq!(m.dst, dst);
        Ok(())
    }

    // Combination rules always outrank single-port rules, and larger
    // combinations outrank smaller ones.
    #[test]
    fn test_priority_ordering() {
        assert!(combination_priority(2) > PRIMARY_PRIORITY);
        assert!(combination_priority(3) > combination_priority(2));
        assert!(DEFAULT_PRIORITY < PRIMARY_PRIORITY);
    }

    #[test]
    fn test_combination_rule_action_order() -> anyhow::Result<()> {
        let lid = Lid::combine([10, 20])?;
        let rule = combination_rule(
            "openflow:1",
            &[1, 2],
            &lid,
            vec![RuleAction::Output(1), RuleAction::Output(2)],
        );
        assert_eq!(rule.priority, 1020);
        assert_eq!(
            rule.actions,
            vec![RuleAction::Output(1), RuleAction::Output(2)]
        );
        Ok(())
    }

    #[test]
    fn test_default_rule_chain_and_punt() {
        let chained = default_rule("openflow:1", 0, 3);
        assert_eq!(chained.priority, DEFAULT_PRIORITY);
        assert_eq!(chained.goto_table, Some(1));
        assert!(chained.actions.is_empty());
        assert!(chained.matches.ipv6.is_none());

        let last = default_rule("openflow:1", 2, 3);
        assert_eq!(last.goto_table, None);
        assert_eq!(last.actions, vec![RuleAction::Controller]);
    }

    #[test]
    fn test_failover_group_buckets() {
        let group = failover_group(7, 2, Some(3));
        assert_eq!(group.buckets.len(), 2);
        assert_eq!(group.buckets[0].watch_port, 2);
        assert_eq!(group.buckets[0].out_port, 2);
        assert_eq!(group.buckets[1].watch_port, 3);

        let solo = failover_group(8, 2, None);
        assert_eq!(solo.buckets.len(), 1);
    }
}
