// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! General types used throughout the daemon.

use std::convert;

use common::ids::IdError;
use common::lid::LidError;

pub type IcndResult<T> = Result<T, IcndError>;

#[derive(Debug, thiserror::Error)]
pub enum IcndError {
    #[error("I/O error: {0:?}")]
    Io(std::io::Error),
    /// The resource manager was unreachable, timed out, or misbehaved.
    /// Non-fatal: the edge stays unconfigured and is retried on a later
    /// batch.
    #[error("resource allocation failed: {0}")]
    Allocation(String),
    /// A LID or address failed to convert.  Fatal to the affected edge's
    /// configuration attempt only.
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("no path from {src} to {dst}")]
    NoPath { src: String, dst: String },
    /// An external registry write/read/delete failed.  The in-memory
    /// assignment survives for the process lifetime.
    #[error("registry error: {0}")]
    Registry(String),
    #[error("Invalid argument: {0}")]
    Invalid(String),
    #[error("Resource is missing: {0}")]
    Missing(String),
    #[error("wire protocol error: {0}")]
    Protocol(String),
}

impl convert::From<std::io::Error> for IcndError {
    fn from(err: std::io::Error) -> Self {
        IcndError::Io(err)
    }
}

impl convert::From<LidError> for IcndError {
    fn from(err: LidError) -> Self {
        IcndError::Encoding(err.to_string())
    }
}

impl convert::From<IdError> for IcndError {
    fn from(err: IdError) -> Self {
        IcndError::Invalid(err.to_string())
    }
}

impl convert::From<serde_json::Error> for IcndError {
    fn from(err: serde_json::Error) -> Self {
        IcndError::Protocol(err.to_string())
    }
}

impl convert::From<String> for IcndError {
    fn from(err: String) -> Self {
        IcndError::Invalid(err)
    }
}

impl convert::From<&str> for IcndError {
    fn from(err: &str) -> Self {
        IcndError::Invalid(err.to_string())
    }
}
