// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The socket-address pool facade.
//!
//! The SA-pool owns the ephemeral port space per `(iface, lip, core)`
//! and programs the flow-director filters that steer return traffic
//! back to the originating core. The allocator consumes it through
//! [`SocketAllocator`] and never looks inside: the only observable
//! behaviors are that a fetch may fail with exhaustion, that a
//! successful fetch yields a concrete source endpoint, and that the
//! pool is addressable per interface and per core.

use super::CoreId;
use super::CoreMask;
use super::netif::Iface;
use core::fmt;
use core::fmt::Display;
use fnat_api::Endpoint;
use fnat_api::Family;
use fnat_api::IpAddr;
use std::sync::Arc;

/// Failure to reserve a source endpoint.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SaError {
    /// No free port under this source address for this destination.
    Exhausted,
}

impl Display for SaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Exhausted => write!(f, "port space exhausted"),
        }
    }
}

/// An interface-address record: the per-core view of which SA
/// sub-pools exist under one `(family, iface, addr)`.
#[derive(Clone, Copy, Debug)]
pub struct InetIfaddr {
    sa_cores: CoreMask,
}

impl InetIfaddr {
    pub fn new(sa_cores: CoreMask) -> Self {
        Self { sa_cores }
    }

    /// Is an SA sub-pool allocated for `core` under this address?
    pub fn has_sa_pool(&self, core: CoreId) -> bool {
        self.sa_cores.contains(core)
    }

    pub fn sa_cores(&self) -> CoreMask {
        self.sa_cores
    }
}

/// The boundary through which the allocator reserves and returns
/// source endpoints.
///
/// Implementations own their internal synchronization; the allocator
/// may call in from any worker core concurrently.
pub trait SocketAllocator: Send + Sync {
    /// Reserve a source endpoint under `src_addr` for flows towards
    /// `dst`, on behalf of `core`. Returns the chosen source port.
    ///
    /// # Errors
    ///
    /// [`SaError::Exhausted`] when no free port remains under this
    /// address for this destination.
    fn fetch(
        &self,
        af: Family,
        iface: &Arc<Iface>,
        core: CoreId,
        dst: &Endpoint,
        src_addr: &IpAddr,
    ) -> Result<u16, SaError>;

    /// Return a previously fetched source endpoint. `dst` and `src`
    /// must be exactly the pair the fetch named and yielded; the
    /// implementation recovers the owning sub-pool from them.
    fn release(&self, iface: &Arc<Iface>, dst: &Endpoint, src: &Endpoint);

    /// Look up the interface-address record for `(af, iface, addr)`,
    /// if the address is configured on the interface.
    fn ifaddr_get(
        &self,
        af: Family,
        iface: &Arc<Iface>,
        addr: &IpAddr,
    ) -> Option<InetIfaddr>;
}
