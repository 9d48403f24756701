// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/
//
// Copyright 2025 Oxide Computer Company

//! The resource-manager interface: wire messages and the one-shot client.

pub mod client;
pub mod protocol;

pub use client::ResourceAllocator;
pub use client::RmClient;
