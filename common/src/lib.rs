// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! Types shared across the icn bootstrap daemon and its collaborators.

pub mod ids;
pub mod lid;
pub mod logging;
pub mod network;

/// Default TCP port on which the resource manager listens.
pub const DEFAULT_RM_PORT: u16 = 12345;
