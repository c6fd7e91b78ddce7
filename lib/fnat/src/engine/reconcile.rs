// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Configuration-reload reconciliation.
//!
//! The health-checker daemon re-reads its configuration on reload and
//! ends up with two views of the same virtual service: the running one
//! and the freshly parsed one. Rather than tearing the service down,
//! it diffs the local-address groups and issues the minimal set of
//! pool operations: entries that disappeared are deleted, surviving
//! entries keep their runtime status, and entries that are new are not
//! added at all — the normal add path materializes them on first
//! demand.

use super::Result;
use super::service::Service;
use crate::LogLevel;
use fnat_api::Error;
use fnat_api::IpAddr;
use fnat_api::Ipv4Addr;
use fnat_api::Ipv6Addr;

/// One configured local-address entry: a base address, the number of
/// additional consecutive addresses it covers (0 = just the base),
/// and the interface they live on. The remaining fields are runtime
/// status, preserved across reloads.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaddrGroupEntry {
    pub addr: IpAddr,
    pub range: u32,
    pub ifname: String,

    pub alive: bool,
    pub set: bool,
    pub weight: i32,
    pub pweight: i32,
    /// True once a reload has carried this entry over from a previous
    /// configuration.
    pub reloaded: bool,
}

impl LaddrGroupEntry {
    pub fn new(addr: IpAddr, range: u32, ifname: &str) -> Self {
        Self {
            addr,
            range,
            ifname: ifname.to_string(),
            alive: false,
            set: false,
            weight: 0,
            pweight: 0,
            reloaded: false,
        }
    }

    /// Two entries are the same configured object iff address, range,
    /// and interface all match.
    fn same_identity(&self, other: &Self) -> bool {
        self.addr == other.addr
            && self.range == other.range
            && self.ifname == other.ifname
    }

    /// The concrete addresses this entry covers.
    fn addrs(&self) -> Vec<IpAddr> {
        match self.addr {
            IpAddr::Ip4(ip4) => {
                let base: u32 = ip4.into();
                (0..=self.range)
                    .map(|k| IpAddr::Ip4(Ipv4Addr::from(base.wrapping_add(k))))
                    .collect()
            }
            IpAddr::Ip6(ip6) => {
                let base: u128 = ip6.into();
                (0..=self.range)
                    .map(|k| {
                        IpAddr::Ip6(Ipv6Addr::from(
                            base.wrapping_add(u128::from(k)),
                        ))
                    })
                    .collect()
            }
        }
    }
}

/// A local-address group: single addresses and ranged entries are
/// configured (and diffed) separately.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct LaddrGroup {
    pub addr_ip: Vec<LaddrGroupEntry>,
    pub ranges: Vec<LaddrGroupEntry>,
}

impl LaddrGroup {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Diff `old` against `new` for `svc` and apply the result:
/// disappeared entries are deleted from the pool, surviving entries
/// have their status copied onto the new records and are marked
/// `reloaded`.
///
/// # Errors
///
/// [`Error::Busy`] aborts the reconcile if a disappeared address still
/// has connections bound; the operator retries once they drain. A
/// delete of an address that was never materialized is not an error —
/// adds are lazy.
pub fn reconcile(
    svc: &Service,
    old: &LaddrGroup,
    new: &mut LaddrGroup,
) -> Result<()> {
    clear_diff_entries(svc, &old.addr_ip, &new.addr_ip)?;
    clear_diff_entries(svc, &old.ranges, &new.ranges)?;

    copy_status(&old.addr_ip, &mut new.addr_ip);
    copy_status(&old.ranges, &mut new.ranges);
    Ok(())
}

fn clear_diff_entries(
    svc: &Service,
    old: &[LaddrGroupEntry],
    new: &[LaddrGroupEntry],
) -> Result<()> {
    for entry in old {
        if new.iter().any(|n| n.same_identity(entry)) {
            continue;
        }

        svc.ctx().ectx().log.log(
            LogLevel::Note,
            &format!(
                "local address {}-{} on {} no longer configured, removing",
                entry.addr, entry.range, entry.ifname
            ),
        );

        for addr in entry.addrs() {
            match svc.laddr_del(addr) {
                Ok(()) => {}
                Err(Error::NotExist) => {}
                Err(e) => return Err(e),
            }
        }
    }
    Ok(())
}

fn copy_status(old: &[LaddrGroupEntry], new: &mut [LaddrGroupEntry]) {
    for entry in new.iter_mut() {
        if let Some(prev) = old.iter().find(|o| o.same_identity(entry)) {
            entry.alive = prev.alive;
            entry.set = prev.set;
            entry.weight = prev.weight;
            entry.pweight = prev.pweight;
            entry.reloaded = true;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ExecCtx;
    use crate::PrintlnLog;
    use crate::engine::CoreId;
    use crate::engine::CoreMask;
    use crate::engine::DataplaneCtx;
    use crate::engine::PoolMode;
    use crate::engine::netif::Iface;
    use crate::engine::sa::InetIfaddr;
    use crate::engine::sa::SaError;
    use crate::engine::sa::SocketAllocator;
    use crate::engine::service::Scheduler;
    use fnat_api::Endpoint;
    use fnat_api::Family;
    use fnat_api::Protocol;
    use std::sync::Arc;

    struct NullSa {}

    impl SocketAllocator for NullSa {
        fn fetch(
            &self,
            _af: Family,
            _iface: &Arc<Iface>,
            _core: CoreId,
            _dst: &Endpoint,
            _src_addr: &IpAddr,
        ) -> core::result::Result<u16, SaError> {
            Err(SaError::Exhausted)
        }

        fn release(
            &self,
            _iface: &Arc<Iface>,
            _dst: &Endpoint,
            _src: &Endpoint,
        ) {
        }

        fn ifaddr_get(
            &self,
            _af: Family,
            _iface: &Arc<Iface>,
            _addr: &IpAddr,
        ) -> Option<InetIfaddr> {
            None
        }
    }

    fn service() -> Arc<Service> {
        let ctx = Arc::new(DataplaneCtx::new(
            PoolMode::PortLcoreMapping,
            CoreMask::EMPTY.set(CoreId(1)),
            Arc::new(NullSa {}),
            Arc::new(ExecCtx { log: Box::new(PrintlnLog {}) }),
        ));
        ctx.ifaces().register("eth0", 1);
        Service::new(
            ctx,
            Protocol::TCP,
            "192.0.2.1".parse().unwrap(),
            80,
            0,
            Default::default(),
            Scheduler::RoundRobin,
        )
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn entry_range_expansion() {
        let entry = LaddrGroupEntry::new(ip("10.0.0.250"), 2, "eth0");
        assert_eq!(
            entry.addrs(),
            vec![ip("10.0.0.250"), ip("10.0.0.251"), ip("10.0.0.252")]
        );

        let single = LaddrGroupEntry::new(ip("fd00::1"), 0, "eth0");
        assert_eq!(single.addrs(), vec![ip("fd00::1")]);
    }

    #[test]
    fn diff_deletes_only_disappeared() {
        let svc = service();
        for addr in ["10.0.0.1", "10.0.0.2", "10.0.0.3"] {
            svc.laddr_add(ip(addr), "eth0").unwrap();
        }

        let old = LaddrGroup {
            addr_ip: vec![
                LaddrGroupEntry::new(ip("10.0.0.1"), 0, "eth0"),
                LaddrGroupEntry::new(ip("10.0.0.2"), 0, "eth0"),
                LaddrGroupEntry::new(ip("10.0.0.3"), 0, "eth0"),
            ],
            ranges: vec![],
        };
        let mut new = LaddrGroup {
            addr_ip: vec![
                LaddrGroupEntry::new(ip("10.0.0.2"), 0, "eth0"),
                LaddrGroupEntry::new(ip("10.0.0.3"), 0, "eth0"),
                LaddrGroupEntry::new(ip("10.0.0.4"), 0, "eth0"),
            ],
            ranges: vec![],
        };

        reconcile(&svc, &old, &mut new).unwrap();

        // Only 10.0.0.1 was deleted; 10.0.0.4 is left for lazy add.
        let addrs: Vec<IpAddr> =
            svc.laddr_getall().iter().map(|e| e.addr).collect();
        assert_eq!(addrs, vec![ip("10.0.0.2"), ip("10.0.0.3")]);

        assert!(new.addr_ip[0].reloaded);
        assert!(new.addr_ip[1].reloaded);
        assert!(!new.addr_ip[2].reloaded);
    }

    #[test]
    fn survivors_keep_status() {
        let svc = service();
        svc.laddr_add(ip("10.0.0.2"), "eth0").unwrap();

        let mut old_entry = LaddrGroupEntry::new(ip("10.0.0.2"), 0, "eth0");
        old_entry.alive = true;
        old_entry.set = true;
        old_entry.weight = 7;
        old_entry.pweight = 3;
        let old =
            LaddrGroup { addr_ip: vec![old_entry], ranges: vec![] };
        let mut new = LaddrGroup {
            addr_ip: vec![LaddrGroupEntry::new(ip("10.0.0.2"), 0, "eth0")],
            ranges: vec![],
        };

        reconcile(&svc, &old, &mut new).unwrap();

        let e = &new.addr_ip[0];
        assert!(e.alive);
        assert!(e.set);
        assert_eq!(e.weight, 7);
        assert_eq!(e.pweight, 3);
        assert!(e.reloaded);
    }

    #[test]
    fn identity_includes_range_and_ifname() {
        let svc = service();
        svc.laddr_add(ip("10.0.0.1"), "eth0").unwrap();

        // Same base address, different range: not the same entry, so
        // the old one is deleted.
        let old = LaddrGroup {
            addr_ip: vec![],
            ranges: vec![LaddrGroupEntry::new(ip("10.0.0.1"), 0, "eth0")],
        };
        let mut new = LaddrGroup {
            addr_ip: vec![],
            ranges: vec![LaddrGroupEntry::new(ip("10.0.0.1"), 1, "eth0")],
        };

        reconcile(&svc, &old, &mut new).unwrap();
        assert!(svc.laddr_getall().is_empty());
        assert!(!new.ranges[0].reloaded);
    }

    #[test]
    fn range_deletion_tolerates_unmaterialized() {
        let svc = service();
        // Only the base of the ranged entry was ever added.
        svc.laddr_add(ip("10.0.0.1"), "eth0").unwrap();

        let old = LaddrGroup {
            addr_ip: vec![],
            ranges: vec![LaddrGroupEntry::new(ip("10.0.0.1"), 3, "eth0")],
        };
        let mut new = LaddrGroup::new();

        reconcile(&svc, &old, &mut new).unwrap();
        assert!(svc.laddr_getall().is_empty());
    }
}
