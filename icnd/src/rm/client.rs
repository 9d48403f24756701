// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! One-shot client for the resource manager.
//!
//! Every call opens a fresh connection, writes exactly one message, and
//! (for a resource request) blocks for the single correlated response
//! before closing.  Concurrent callers get independent connections, so no
//! response can be delivered to the wrong request.  All socket operations
//! carry the configured timeout; a manager that never answers surfaces as
//! an allocation error rather than a hung thread.

use std::net::Shutdown;
use std::net::SocketAddr;
use std::net::TcpStream;
use std::time::Duration;

use slog::debug;
use slog::info;
use slog::warn;

use crate::rm::protocol;
use crate::rm::protocol::LinkStatusMsg;
use crate::rm::protocol::ResourceOffer;
use crate::rm::protocol::ResourceRequest;
use crate::rm::protocol::ResourceRequestMsg;
use crate::rm::protocol::TmSdnMessage;
use crate::types::IcndError;
use crate::types::IcndResult;

/// The allocation face of the resource manager, as the configurator sees
/// it.
pub trait ResourceAllocator: Send + Sync {
    /// Submit allocation requests and block for the correlated offers.  An
    /// empty offer list means the manager had nothing to give; the affected
    /// edges stay unconfigured.
    fn allocate(
        &self,
        requests: Vec<ResourceRequest>,
    ) -> IcndResult<Vec<ResourceOffer>>;

    /// Fire-and-forget link liveness notification.
    fn notify_link_status(&self, msg: LinkStatusMsg) -> IcndResult<()>;
}

pub struct RmClient {
    log: slog::Logger,
    addr: SocketAddr,
    timeout: Duration,
}

impl RmClient {
    pub fn new(
        log: &slog::Logger,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Self {
        RmClient {
            log: log.new(slog::o!("unit" => "rm_client")),
            addr,
            timeout,
        }
    }

    fn connect(&self) -> IcndResult<TcpStream> {
        let stream = TcpStream::connect_timeout(&self.addr, self.timeout)
            .map_err(|e| {
                IcndError::Allocation(format!(
                    "resource manager {} unreachable: {e}",
                    self.addr
                ))
            })?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        Ok(stream)
    }
}

impl ResourceAllocator for RmClient {
    fn allocate(
        &self,
        requests: Vec<ResourceRequest>,
    ) -> IcndResult<Vec<ResourceOffer>> {
        debug!(self.log, "requesting resources";
            "requests" => requests.len());
        let mut stream = self.connect()?;
        protocol::write_frame(
            &mut stream,
            &TmSdnMessage::ResourceRequest(ResourceRequestMsg { requests }),
        )
        .map_err(allocation_err)?;

        let response =
            protocol::read_frame(&mut stream).map_err(allocation_err)?;
        let _ = stream.shutdown(Shutdown::Both);

        match response {
            TmSdnMessage::ResourceOffer(msg) => {
                info!(self.log, "received resource offer";
                    "offers" => msg.offers.len());
                Ok(msg.offers)
            }
            other => Err(IcndError::Protocol(format!(
                "expected a resource offer, got {other:?}"
            ))),
        }
    }

    fn notify_link_status(&self, msg: LinkStatusMsg) -> IcndResult<()> {
        let mut stream = self.connect()?;
        let result = protocol::write_frame(
            &mut stream,
            &TmSdnMessage::LinkStatus(msg),
        );
        let _ = stream.shutdown(Shutdown::Both);
        if let Err(e) = &result {
            warn!(self.log, "link status notification failed"; "error" => %e);
        }
        result
    }
}

// A timed-out or interrupted exchange is an allocation failure, not a
// daemon fault.
fn allocation_err(e: IcndError) -> IcndError {
    match e {
        IcndError::Io(e) => {
            IcndError::Allocation(format!("resource manager i/o failed: {e}"))
        }
        e => e,
    }
}
