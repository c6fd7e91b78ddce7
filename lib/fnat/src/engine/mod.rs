// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The FNAT engine.

pub mod conn;
pub mod ioctl;
pub mod laddr;
pub mod netif;
pub mod reconcile;
pub mod sa;
pub mod service;

use crate::ExecCtx;
use crate::engine::netif::IfaceTable;
use crate::engine::sa::SocketAllocator;
use core::fmt;
use core::fmt::Display;
use core::result;
use fnat_api::Error;
use std::sync::Arc;

pub type Result<T> = result::Result<T, Error>;

/// The maximum number of local addresses a single bind attempt will
/// try before giving up with [`Error::Resource`].
pub const LADDR_MAX_TRIALS: usize = 16;

/// The width of [`CoreMask`], and thus the maximum worker core id + 1.
pub const MAX_CORES: usize = 64;

/// A worker core identifier.
///
/// One packet-processing worker runs per enabled core; connection
/// state is core-local, so the allocator needs to know which worker is
/// asking.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CoreId(pub u16);

impl CoreId {
    pub fn index(&self) -> usize {
        usize::from(self.0)
    }
}

impl Display for CoreId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The set of enabled worker cores, as a bitmask.
///
/// Built once at initialization from the network layer and immutable
/// thereafter. The mask is authoritative: every per-core iteration in
/// the engine visits exactly the set bits, nothing else. The reserved
/// master core is simply never part of the mask.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct CoreMask(u64);

impl CoreMask {
    pub const EMPTY: Self = Self(0);

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Return a copy of the mask with `core` added.
    pub const fn set(self, core: CoreId) -> Self {
        Self(self.0 | (1u64 << core.0))
    }

    pub const fn contains(&self, core: CoreId) -> bool {
        core.0 < MAX_CORES as u16 && self.0 & (1u64 << core.0) != 0
    }

    pub const fn count(&self) -> u32 {
        self.0.count_ones()
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate the enabled cores in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = CoreId> {
        let raw = self.0;
        (0..MAX_CORES as u16)
            .filter(move |cid| raw & (1u64 << cid) != 0)
            .map(CoreId)
    }
}

impl Display for CoreMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// How the socket-address pool maps return flows to cores, and
/// therefore how each service shapes its local-address pool.
///
/// Fixed per process at initialization.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PoolMode {
    /// The flow-director mask covers the low bits of the lport: every
    /// core draws from one shared list of addresses.
    PortLcoreMapping,
    /// The flow-director mask covers the address: each core owns a
    /// disjoint subset of addresses and draws only from its own list.
    AddrLcoreMapping,
}

impl Display for PoolMode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::PortLcoreMapping => write!(f, "port-lcore-mapping"),
            Self::AddrLcoreMapping => write!(f, "addr-lcore-mapping"),
        }
    }
}

/// Process-wide dataplane context.
///
/// Holds the configuration fixed at initialization (pool mode, enabled
/// cores) together with the collaborators every service needs: the
/// socket-address pool, the interface table, and the execution
/// context. Published once, read-only thereafter.
pub struct DataplaneCtx {
    mode: PoolMode,
    cores: CoreMask,
    sa: Arc<dyn SocketAllocator>,
    ifaces: IfaceTable,
    ectx: Arc<ExecCtx>,
}

impl DataplaneCtx {
    pub fn new(
        mode: PoolMode,
        cores: CoreMask,
        sa: Arc<dyn SocketAllocator>,
        ectx: Arc<ExecCtx>,
    ) -> Self {
        Self { mode, cores, sa, ifaces: IfaceTable::new(), ectx }
    }

    pub fn mode(&self) -> PoolMode {
        self.mode
    }

    pub fn cores(&self) -> CoreMask {
        self.cores
    }

    pub fn sa(&self) -> &Arc<dyn SocketAllocator> {
        &self.sa
    }

    pub fn ifaces(&self) -> &IfaceTable {
        &self.ifaces
    }

    pub fn ectx(&self) -> &ExecCtx {
        &self.ectx
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn core_mask_iter() {
        let mask =
            CoreMask::EMPTY.set(CoreId(1)).set(CoreId(4)).set(CoreId(63));
        assert_eq!(mask.count(), 3);
        assert!(mask.contains(CoreId(4)));
        assert!(!mask.contains(CoreId(0)));
        let cores: Vec<CoreId> = mask.iter().collect();
        assert_eq!(cores, vec![CoreId(1), CoreId(4), CoreId(63)]);
    }

    #[test]
    fn core_mask_empty() {
        assert!(CoreMask::EMPTY.is_empty());
        assert_eq!(CoreMask::EMPTY.iter().count(), 0);
    }
}
