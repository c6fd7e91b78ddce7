// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Virtual services and the service table.
//!
//! Only the slice of a virtual service the allocator cares about lives
//! here: its identity (the lookup key), the real-server scheduler in
//! effect (which shapes the selection step), and the local-address
//! pool it owns.

use super::DataplaneCtx;
use super::Result;
use super::laddr::LaddrPool;
use crate::sync::RwLock;
use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use fnat_api::Error;
use fnat_api::Family;
use fnat_api::IpAddr;
use fnat_api::MatchFilter;
use fnat_api::Protocol;
use std::sync::Arc;

/// The real-server scheduling policy of a service.
///
/// The allocator only cares whether the policy is a round-robin
/// variant: a round-robin real-server rotation can synchronize with
/// the local-address rotation, which the selection step perturbs.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Scheduler {
    RoundRobin,
    WeightedRoundRobin,
    WeightedLeastConn,
    ConsistentHash,
}

impl Scheduler {
    pub fn is_round_robin(&self) -> bool {
        matches!(self, Self::RoundRobin | Self::WeightedRoundRobin)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RoundRobin => "rr",
            Self::WeightedRoundRobin => "wrr",
            Self::WeightedLeastConn => "wlc",
            Self::ConsistentHash => "conhash",
        }
    }
}

impl Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Scheduler {
    type Err = String;

    fn from_str(val: &str) -> core::result::Result<Self, Self::Err> {
        match val {
            "rr" => Ok(Self::RoundRobin),
            "wrr" => Ok(Self::WeightedRoundRobin),
            "wlc" => Ok(Self::WeightedLeastConn),
            "conhash" => Ok(Self::ConsistentHash),
            _ => Err(format!("unknown scheduler: {val}")),
        }
    }
}

/// A virtual service, as seen by the allocator.
pub struct Service {
    ctx: Arc<DataplaneCtx>,
    proto: Protocol,
    vaddr: IpAddr,
    vport: u16,
    fwmark: u32,
    filter: MatchFilter,
    scheduler: Scheduler,
    pub(crate) laddrs: LaddrPool,
}

impl Service {
    pub fn new(
        ctx: Arc<DataplaneCtx>,
        proto: Protocol,
        vaddr: IpAddr,
        vport: u16,
        fwmark: u32,
        filter: MatchFilter,
        scheduler: Scheduler,
    ) -> Arc<Self> {
        let laddrs = LaddrPool::new(ctx.mode());
        Arc::new(Self {
            ctx,
            proto,
            vaddr,
            vport,
            fwmark,
            filter,
            scheduler,
            laddrs,
        })
    }

    /// Like [`Service::new`], but with a fixed seed for the selection
    /// perturbation, for reproducible runs.
    pub fn with_laddr_seed(
        ctx: Arc<DataplaneCtx>,
        proto: Protocol,
        vaddr: IpAddr,
        vport: u16,
        fwmark: u32,
        filter: MatchFilter,
        scheduler: Scheduler,
        seed: u64,
    ) -> Arc<Self> {
        let laddrs = LaddrPool::with_seed(ctx.mode(), seed);
        Arc::new(Self {
            ctx,
            proto,
            vaddr,
            vport,
            fwmark,
            filter,
            scheduler,
            laddrs,
        })
    }

    pub fn af(&self) -> Family {
        self.vaddr.family()
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    pub fn vaddr(&self) -> IpAddr {
        self.vaddr
    }

    pub fn vport(&self) -> u16 {
        self.vport
    }

    pub fn fwmark(&self) -> u32 {
        self.fwmark
    }

    pub fn filter(&self) -> &MatchFilter {
        &self.filter
    }

    pub fn scheduler(&self) -> Scheduler {
        self.scheduler
    }

    pub(crate) fn ctx(&self) -> &DataplaneCtx {
        &self.ctx
    }

    fn key_matches(
        &self,
        af: Family,
        proto: Protocol,
        vaddr: &IpAddr,
        vport: u16,
        fwmark: u32,
        filter: &MatchFilter,
    ) -> bool {
        self.af() == af
            && self.proto == proto
            && self.vaddr == *vaddr
            && self.vport == vport
            && self.fwmark == fwmark
            && self.filter == *filter
    }
}

impl Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.vaddr {
            IpAddr::Ip4(ip4) => {
                write!(f, "{}:{}:{}", self.proto, ip4, self.vport)
            }
            IpAddr::Ip6(ip6) => {
                write!(f, "{}:[{}]:{}", self.proto, ip6, self.vport)
            }
        }
    }
}

/// The table of virtual services.
pub struct ServiceTable {
    ctx: Arc<DataplaneCtx>,
    svcs: RwLock<Vec<Arc<Service>>>,
}

impl ServiceTable {
    pub fn new(ctx: Arc<DataplaneCtx>) -> Self {
        Self { ctx, svcs: RwLock::new(Vec::new()) }
    }

    pub fn ctx(&self) -> &Arc<DataplaneCtx> {
        &self.ctx
    }

    /// Register a service.
    ///
    /// # Errors
    ///
    /// [`Error::Exists`] if a service with the same key is already
    /// registered.
    pub fn add(&self, svc: Arc<Service>) -> Result<()> {
        let mut svcs = self.svcs.write();
        let dup = svcs.iter().any(|s| {
            s.key_matches(
                svc.af(),
                svc.proto(),
                &svc.vaddr(),
                svc.vport(),
                svc.fwmark(),
                svc.filter(),
            )
        });
        if dup {
            return Err(Error::Exists);
        }
        svcs.push(svc);
        Ok(())
    }

    /// Look a service up by its full key.
    pub fn lookup(
        &self,
        af: Family,
        proto: Protocol,
        vaddr: &IpAddr,
        vport: u16,
        fwmark: u32,
        filter: &MatchFilter,
    ) -> Option<Arc<Service>> {
        self.svcs
            .read()
            .iter()
            .find(|s| s.key_matches(af, proto, vaddr, vport, fwmark, filter))
            .map(Arc::clone)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scheduler_round_robin() {
        assert!(Scheduler::RoundRobin.is_round_robin());
        assert!(Scheduler::WeightedRoundRobin.is_round_robin());
        assert!(!Scheduler::WeightedLeastConn.is_round_robin());
        assert!(!Scheduler::ConsistentHash.is_round_robin());
    }

    #[test]
    fn scheduler_parse() {
        assert_eq!("rr".parse::<Scheduler>().unwrap(), Scheduler::RoundRobin);
        assert_eq!(
            "wrr".parse::<Scheduler>().unwrap(),
            Scheduler::WeightedRoundRobin
        );
        assert!("lblcr".parse::<Scheduler>().is_err());
    }
}
