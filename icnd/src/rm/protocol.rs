// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Wire messages exchanged with the resource manager.
//!
//! Every message travels as one frame: a big-endian u32 payload length
//! followed by the JSON-serialized tagged message.  The resource manager
//! owns the schema; this module only has to encode and decode it
//! faithfully.  The monitoring variants are produced by the (external)
//! statistics subsystem and share this transport; the daemon itself sends
//! resource requests and link-status notifications.

use std::io::Read;
use std::io::Write;

use bytes::BufMut;
use bytes::BytesMut;
use serde::Deserialize;
use serde::Serialize;

use crate::types::IcndError;
use crate::types::IcndResult;

/// Upper bound on a frame payload.  A frame length beyond this is a framing
/// desync, not a message.
pub const MAX_FRAME_BYTES: u32 = 1 << 20;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TmSdnMessage {
    #[serde(rename = "RR")]
    ResourceRequest(ResourceRequestMsg),
    #[serde(rename = "RO")]
    ResourceOffer(ResourceOfferMsg),
    #[serde(rename = "LS")]
    LinkStatus(LinkStatusMsg),
    #[serde(rename = "TM")]
    TrafficMonitoring(TrafficMonitoringMsg),
    #[serde(rename = "FM")]
    FlowMonitoring(FlowMonitoringMsg),
    #[serde(rename = "GM")]
    GroupMonitoring(GroupMonitoringMsg),
}

/// One allocation request per newly discovered edge.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub src_node: String,
    pub dst_node: String,
    pub connector: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequestMsg {
    pub requests: Vec<ResourceRequest>,
}

/// The node id and LID granted for one requested edge.  The LID is the
/// manager's 256-character bitstring form.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOffer {
    pub nid: String,
    pub lid: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceOfferMsg {
    pub offers: Vec<ResourceOffer>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkStatusType {
    Add,
    Rmv,
}

/// Asynchronous liveness notification; fire-and-forget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkStatusMsg {
    pub node1: String,
    pub node2: String,
    pub connector: u32,
    pub status: LinkStatusType,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficMonitoringMsg {
    pub node1: String,
    pub node2: String,
    pub connector: u32,
    pub port_name: String,
    pub packets_received: u64,
    pub packets_transmitted: u64,
    pub bytes_received: u64,
    pub bytes_transmitted: u64,
    pub receive_errors: u64,
    pub transmit_errors: u64,
    pub receive_drops: u64,
    pub transmit_drops: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMonitoringMsg {
    pub node: String,
    pub table: u8,
    pub src_ipv6: String,
    pub dst_ipv6: String,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketCounters {
    pub bucket: u32,
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMonitoringMsg {
    pub node: String,
    pub group: u32,
    pub packets: u64,
    pub bytes: u64,
    pub buckets: Vec<BucketCounters>,
}

/// Serialize a message into one length-prefixed frame.
pub fn encode_frame(msg: &TmSdnMessage) -> IcndResult<Vec<u8>> {
    let payload = serde_json::to_vec(msg)?;
    if payload.len() as u64 > u64::from(MAX_FRAME_BYTES) {
        return Err(IcndError::Protocol(format!(
            "frame payload of {} bytes exceeds limit",
            payload.len()
        )));
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    Ok(frame.to_vec())
}

/// Write one framed message.
pub fn write_frame(
    w: &mut impl Write,
    msg: &TmSdnMessage,
) -> IcndResult<()> {
    let frame = encode_frame(msg)?;
    w.write_all(&frame)?;
    w.flush()?;
    Ok(())
}

/// Read one framed message.
pub fn read_frame(r: &mut impl Read) -> IcndResult<TmSdnMessage> {
    let mut len = [0u8; 4];
    r.read_exact(&mut len)?;
    let len = u32::from_be_bytes(len);
    if len > MAX_FRAME_BYTES {
        return Err(IcndError::Protocol(format!(
            "frame length {len} exceeds limit"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)?;
    Ok(serde_json::from_slice(&payload)?)
}
