// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! API types shared between the FNAT dataplane and its control plane.
//!
//! Everything in this crate may cross the host-supplied request/reply
//! channel: address and endpoint types, the local-address command set,
//! and the status enumeration. The dataplane engine lives in the
//! `fnat` crate and depends on this one.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod cmd;
pub mod ip;

pub use cmd::*;
pub use ip::*;

/// The overall version of the API. Anytime an API is added, removed,
/// or modified, this number should increment. We attach no semantic
/// meaning to the number other than as a means to verify that both
/// sides of the control channel are compiled for the same API.
pub const API_VERSION: u64 = 3;
