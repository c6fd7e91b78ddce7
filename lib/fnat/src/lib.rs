// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The FNAT dataplane engine.
//!
//! A Full-NAT load balancer rewrites a client-to-service flow into a
//! balancer-to-realserver flow. The heart of that rewrite is the
//! local address and port allocator found under [`engine::laddr`]: it
//! synthesizes a fresh `(lip, lport)` source endpoint for each new
//! flow, unique for the flow's destination, while steering the return
//! traffic back to the worker core that owns the connection. The
//! socket-address pool which owns the port space and programs the
//! hardware flow-director filters is consumed through the facade in
//! [`engine::sa`]; the host supplies the implementation.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

use core::fmt;
use core::fmt::Display;

pub mod api {
    pub use fnat_api::*;
}

pub mod engine;
pub mod stat;
pub mod sync;

/// A logging provider provides the means to log messages to some
/// destination based on the context in which the engine is running.
/// In a unit test this could map to `println!`; embedded in a larger
/// daemon it would map to whatever that daemon logs with.
///
/// Logging levels are provided by [`LogLevel`]. These levels will map
/// to the underlying provider with varying degrees of success.
pub trait LogProvider: Send + Sync {
    /// Log a message at the specified level.
    fn log(&self, level: LogLevel, msg: &str);
}

#[derive(Clone, Copy, Debug)]
pub enum LogLevel {
    Note,
    Warn,
    Error,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let level_s = match self {
            Self::Note => "[NOTE]",
            Self::Warn => "[WARN]",
            Self::Error => "[ERROR]",
        };
        write!(f, "{}", level_s)
    }
}

#[derive(Clone, Copy)]
pub struct PrintlnLog {}

impl LogProvider for PrintlnLog {
    fn log(&self, level: LogLevel, msg: &str) {
        println!("{} {}", level, msg);
    }
}

pub struct ExecCtx {
    pub log: Box<dyn LogProvider>,
}
