// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Local address and port allocation.
//!
//! A Full-NAT flow's four tuple `<lip:lport, rip:rport>` must be
//! unique, and one local IP caps out at a port space's worth of
//! concurrent connections towards a single real server. Each service
//! therefore owns a pool of local addresses and rotates through them;
//! the socket-address pool hands out a free port under the chosen
//! address and keys the flow-director filter that brings the reply
//! back to the right core.
//!
//! The pool takes one of two shapes, fixed per process by
//! [`PoolMode`]: in port-mode every core draws from a single shared
//! list; in addr-mode each core owns its own list and an address
//! appears only on the cores whose SA sub-pool covers it.
//!
//! Locking: one reader/writer lock per service pool covers the lists,
//! the rotation cursors, and the counts. Selection advances a cursor,
//! so even the bind fast path takes the write lock. The two per-entry
//! counters (`refcnt`, `conn_counts`) are atomics maintained outside
//! the lock; `refcnt > 0` is what makes delete and flush refuse with
//! `Busy`.

use super::CoreId;
use super::DataplaneCtx;
use super::LADDR_MAX_TRIALS;
use super::MAX_CORES;
use super::PoolMode;
use super::Result;
use super::conn::Conn;
use super::conn::OutTuple;
use super::netif::Iface;
use super::sa::SaError;
use super::service::Scheduler;
use super::service::Service;
use crate::LogLevel;
use crate::stat::StatU64;
use crate::sync::RwLock;
use core::fmt;
use core::fmt::Display;
use core::sync::atomic::AtomicU32;
use core::sync::atomic::Ordering::SeqCst;
use fnat_api::Endpoint;
use fnat_api::Error;
use fnat_api::Family;
use fnat_api::IpAddr;
use fnat_api::LaddrEntryDump;
use fnat_api::Protocol;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use serde::Deserialize;
use serde::Serialize;
use std::sync::Arc;

/// A local address owned by a service pool.
///
/// The list entry owns the record through its `Arc`; a bound
/// connection holds a second reference until unbind. `refcnt` is not
/// the memory owner: it counts in-flight trials plus successful
/// holders, and its only job is to veto delete/flush while non-zero.
#[derive(Debug)]
pub struct LocalAddr {
    addr: IpAddr,
    iface: Arc<Iface>,
    refcnt: AtomicU32,
    conn_counts: AtomicU32,
}

impl LocalAddr {
    fn new(addr: IpAddr, iface: Arc<Iface>) -> Arc<Self> {
        Arc::new(Self {
            addr,
            iface,
            refcnt: AtomicU32::new(0),
            conn_counts: AtomicU32::new(0),
        })
    }

    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    pub fn family(&self) -> Family {
        self.addr.family()
    }

    pub fn iface(&self) -> &Arc<Iface> {
        &self.iface
    }

    /// In-flight bind attempts plus bound holders.
    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(SeqCst)
    }

    /// Live connections currently bound to this address.
    pub fn conn_counts(&self) -> u32 {
        self.conn_counts.load(SeqCst)
    }

    fn get(&self) {
        self.refcnt.fetch_add(1, SeqCst);
    }

    fn put(&self) {
        self.refcnt.fetch_sub(1, SeqCst);
    }

    fn conn_inc(&self) {
        self.conn_counts.fetch_add(1, SeqCst);
    }

    fn conn_dec(&self) {
        self.conn_counts.fetch_sub(1, SeqCst);
    }
}

impl Display for LocalAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{}", self.addr, self.iface)
    }
}

/// An ordered list of local addresses with a rotation cursor.
///
/// `cursor` names the last-selected position; `None` means the next
/// selection starts at the head. Invariant: `cursor` is `None` or a
/// valid index.
struct LaddrList {
    entries: Vec<Arc<LocalAddr>>,
    cursor: Option<usize>,
}

impl LaddrList {
    fn new() -> Self {
        Self { entries: Vec::new(), cursor: None }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn find(&self, addr: &IpAddr) -> Option<usize> {
        self.entries.iter().position(|e| e.addr == *addr)
    }

    fn push(&mut self, entry: Arc<LocalAddr>) {
        self.entries.push(entry);
    }

    /// Advance the cursor `step` positions (wrapping) and return the
    /// entry under it with its refcnt taken. `None` iff the list is
    /// empty. `step` must be at least 1.
    fn select(&mut self, step: usize) -> Option<Arc<LocalAddr>> {
        if self.entries.is_empty() {
            return None;
        }

        let mut idx = self.cursor;
        for _ in 0..step {
            idx = Some(match idx {
                None => 0,
                Some(i) if i + 1 >= self.entries.len() => 0,
                Some(i) => i + 1,
            });
        }

        let idx = idx?;
        self.cursor = Some(idx);
        let entry = Arc::clone(&self.entries[idx]);
        entry.get();
        Some(entry)
    }

    /// Unlink the entry at `idx`, fixing the cursor up first: if the
    /// cursor sat on the removed entry it moves to the successor (or
    /// back to the head sentinel when the removed entry was last).
    fn remove_at(&mut self, idx: usize) -> Arc<LocalAddr> {
        let entry = self.entries.remove(idx);
        self.cursor = match self.cursor {
            Some(c) if c == idx => {
                if idx < self.entries.len() {
                    Some(idx)
                } else {
                    None
                }
            }
            Some(c) if c > idx => Some(c - 1),
            other => other,
        };
        entry
    }

    /// Remove every idle entry. Returns true if any in-use entry had
    /// to be left behind.
    fn flush_idle(&mut self) -> bool {
        let cursor_entry = self.cursor.map(|i| Arc::clone(&self.entries[i]));
        let mut busy = false;

        self.entries.retain(|e| {
            if e.refcnt() == 0 {
                false
            } else {
                busy = true;
                true
            }
        });

        // If the entry under the cursor went away, rotation restarts
        // at the head.
        self.cursor = cursor_entry.and_then(|ce| {
            self.entries.iter().position(|e| Arc::ptr_eq(e, &ce))
        });

        busy
    }
}

/// The mode-dependent shape of a service pool: one shared list, or one
/// list per core.
enum PoolShape {
    Port(LaddrList),
    Addr(Vec<LaddrList>),
}

impl PoolShape {
    fn list_mut(&mut self, core: CoreId) -> Option<&mut LaddrList> {
        match self {
            Self::Port(list) => Some(list),
            Self::Addr(lists) => lists.get_mut(core.index()),
        }
    }

    fn num(&self, core: CoreId) -> usize {
        match self {
            Self::Port(list) => list.len(),
            Self::Addr(lists) => {
                lists.get(core.index()).map(LaddrList::len).unwrap_or(0)
            }
        }
    }
}

struct PoolState {
    shape: PoolShape,
    rng: SmallRng,
}

/// Allocation counters for one service pool.
pub struct LaddrStats {
    /// Successful binds.
    bind_ok: StatU64,
    /// Binds that found no usable local endpoint.
    bind_resource: StatU64,
    /// Trials where the SA pool was exhausted under the tried address.
    fetch_fail: StatU64,
    /// Addr-mode trials skipped because the address has no sub-pool on
    /// the calling core.
    off_core_skip: StatU64,
    /// Unbinds.
    unbind: StatU64,
}

impl LaddrStats {
    fn new() -> Self {
        Self {
            bind_ok: StatU64::new(),
            bind_resource: StatU64::new(),
            fetch_fail: StatU64::new(),
            off_core_skip: StatU64::new(),
            unbind: StatU64::new(),
        }
    }

    pub fn snapshot(&self) -> LaddrStatsSnap {
        LaddrStatsSnap {
            bind_ok: self.bind_ok.val(),
            bind_resource: self.bind_resource.val(),
            fetch_fail: self.fetch_fail.val(),
            off_core_skip: self.off_core_skip.val(),
            unbind: self.unbind.val(),
        }
    }
}

/// A point-in-time copy of [`LaddrStats`].
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct LaddrStatsSnap {
    pub bind_ok: u64,
    pub bind_resource: u64,
    pub fetch_fail: u64,
    pub off_core_skip: u64,
    pub unbind: u64,
}

/// The per-service local-address pool.
pub struct LaddrPool {
    state: RwLock<PoolState>,
    stats: LaddrStats,
}

/// How far the cursor advances for one selection.
///
/// A deterministic single step resonates with a round-robin real
/// server scheduler: each real server ends up reached through mostly
/// one local IP, which caps the per-server connection fan-out. In
/// port-mode a 5% chance of a double step breaks the resonance. In
/// addr-mode each address is pinned to one core, so the two rotations
/// cannot lock and the step stays 1.
fn step_for(rng: &mut SmallRng, mode: PoolMode, sched: Scheduler) -> usize {
    match mode {
        PoolMode::AddrLcoreMapping => 1,
        PoolMode::PortLcoreMapping => {
            if sched.is_round_robin() && rng.gen_range(0..100) < 5 {
                2
            } else {
                1
            }
        }
    }
}

impl LaddrPool {
    pub(crate) fn new(mode: PoolMode) -> Self {
        Self::with_rng(mode, SmallRng::from_entropy())
    }

    pub(crate) fn with_seed(mode: PoolMode, seed: u64) -> Self {
        Self::with_rng(mode, SmallRng::seed_from_u64(seed))
    }

    fn with_rng(mode: PoolMode, rng: SmallRng) -> Self {
        let shape = match mode {
            PoolMode::PortLcoreMapping => PoolShape::Port(LaddrList::new()),
            PoolMode::AddrLcoreMapping => PoolShape::Addr(
                (0..MAX_CORES).map(|_| LaddrList::new()).collect(),
            ),
        };
        Self {
            state: RwLock::new(PoolState { shape, rng }),
            stats: LaddrStats::new(),
        }
    }

    pub fn stats(&self) -> &LaddrStats {
        &self.stats
    }

    /// Pick a local address and reserve a port under it for `conn`'s
    /// destination, writing the bound endpoint into the connection on
    /// success.
    fn bind(
        &self,
        ctx: &DataplaneCtx,
        sched: Scheduler,
        conn: &mut Conn,
        core: CoreId,
    ) -> Result<()> {
        let mode = ctx.mode();
        let dst = Endpoint::new(conn.daddr, conn.dport);
        let mut chosen: Option<(Arc<LocalAddr>, u16)> = None;
        let num;

        {
            // Write lock: selection advances the cursor, and the trial
            // bound reads the entry count.
            let mut state = self.state.write();
            num = state.shape.num(core);

            for _ in 0..LADDR_MAX_TRIALS.min(num) {
                let step = step_for(&mut state.rng, mode, sched);
                let laddr = match state
                    .shape
                    .list_mut(core)
                    .and_then(|list| list.select(step))
                {
                    Some(laddr) => laddr,
                    None => break,
                };

                if mode == PoolMode::AddrLcoreMapping {
                    let on_core = ctx
                        .sa()
                        .ifaddr_get(laddr.family(), laddr.iface(), &laddr.addr)
                        .map(|ifa| ifa.has_sa_pool(core))
                        .unwrap_or(false);
                    if !on_core {
                        laddr.put();
                        self.stats.off_core_skip.incr(1);
                        continue;
                    }
                }

                match ctx.sa().fetch(
                    laddr.family(),
                    laddr.iface(),
                    core,
                    &dst,
                    &laddr.addr,
                ) {
                    Ok(sport) => {
                        chosen = Some((laddr, sport));
                        break;
                    }
                    Err(SaError::Exhausted) => {
                        laddr.put();
                        self.stats.fetch_fail.incr(1);
                        continue;
                    }
                }
            }
        }

        let Some((laddr, sport)) = chosen else {
            self.stats.bind_resource.incr(1);
            let msg = if num == 0 {
                format!("no local address available on core {core}")
            } else {
                format!("no free lport towards {dst} on core {core}")
            };
            ctx.ectx().log.log(LogLevel::Error, &msg);
            return Err(Error::Resource);
        };

        laddr.conn_inc();

        // Overwrite the related fields in the out-tuple and the conn.
        conn.laddr = laddr.addr;
        conn.lport = sport;
        conn.tuple_out = OutTuple { daddr: laddr.addr, dport: sport };
        conn.set_local(laddr);
        self.stats.bind_ok.incr(1);
        Ok(())
    }

    /// Release the endpoint held by `conn` back to the SA pool and
    /// drop the reference taken at bind time.
    fn unbind(&self, ctx: &DataplaneCtx, conn: &mut Conn) -> Result<()> {
        let Some(laddr) = conn.take_local() else {
            // Not a Full-NAT connection.
            return Ok(());
        };

        let dst = Endpoint::new(conn.daddr, conn.dport);
        let src = Endpoint::new(conn.laddr, conn.lport);
        ctx.sa().release(laddr.iface(), &dst, &src);

        laddr.conn_dec();
        laddr.put();
        self.stats.unbind.incr(1);
        Ok(())
    }

    /// Add `addr` to the pool. In addr-mode a fresh record is inserted
    /// into the list of every enabled core whose SA sub-pool covers
    /// the address; each list owns its own record.
    fn add(
        &self,
        ctx: &DataplaneCtx,
        addr: IpAddr,
        ifname: &str,
    ) -> Result<()> {
        let iface = ctx.ifaces().get_by_name(ifname).ok_or(Error::NotExist)?;

        let mut state = self.state.write();
        match &mut state.shape {
            PoolShape::Port(list) => {
                if list.find(&addr).is_some() {
                    return Err(Error::Exists);
                }
                list.push(LocalAddr::new(addr, iface));
            }
            PoolShape::Addr(lists) => {
                for core in ctx.cores().iter() {
                    if lists[core.index()].find(&addr).is_some() {
                        return Err(Error::Exists);
                    }
                }

                let ifa = ctx
                    .sa()
                    .ifaddr_get(addr.family(), &iface, &addr)
                    .ok_or(Error::NotExist)?;

                for core in ctx.cores().iter() {
                    if ifa.has_sa_pool(core) {
                        lists[core.index()]
                            .push(LocalAddr::new(addr, Arc::clone(&iface)));
                    }
                }
            }
        }
        Ok(())
    }

    /// Remove `addr` from the pool, refusing with `Busy` while any
    /// bind holds a reference.
    fn del(&self, ctx: &DataplaneCtx, addr: IpAddr) -> Result<()> {
        let mut state = self.state.write();
        let res = match &mut state.shape {
            PoolShape::Port(list) => Self::del_in_list(list, &addr),
            PoolShape::Addr(lists) => {
                let mut removed = false;
                let mut busy = false;
                for core in ctx.cores().iter() {
                    match Self::del_in_list(&mut lists[core.index()], &addr) {
                        Ok(()) => removed = true,
                        Err(Error::Busy) => busy = true,
                        // Not on this core's list.
                        Err(_) => {}
                    }
                }
                if busy {
                    Err(Error::Busy)
                } else if removed {
                    Ok(())
                } else {
                    Err(Error::NotExist)
                }
            }
        };
        drop(state);

        if res == Err(Error::Busy) {
            ctx.ectx().log.log(
                LogLevel::Note,
                &format!("local address {addr} is in use, not deleted"),
            );
        }
        res
    }

    fn del_in_list(list: &mut LaddrList, addr: &IpAddr) -> Result<()> {
        let idx = list.find(addr).ok_or(Error::NotExist)?;
        if list.entries[idx].refcnt() != 0 {
            return Err(Error::Busy);
        }
        list.remove_at(idx);
        Ok(())
    }

    /// Remove every idle address. In-use entries stay put and the call
    /// reports `Busy` so the operator knows to retry.
    fn flush(&self, ctx: &DataplaneCtx) -> Result<()> {
        let mut state = self.state.write();
        let busy = match &mut state.shape {
            PoolShape::Port(list) => list.flush_idle(),
            PoolShape::Addr(lists) => {
                let mut busy = false;
                for core in ctx.cores().iter() {
                    busy |= lists[core.index()].flush_idle();
                }
                busy
            }
        };
        drop(state);

        if busy {
            ctx.ectx().log.log(
                LogLevel::Note,
                "flush left in-use local addresses behind",
            );
            return Err(Error::Busy);
        }
        Ok(())
    }

    /// Materialize a snapshot of the pool. In addr-mode the per-core
    /// lists are concatenated in core-id order.
    ///
    /// The snapshot takes the write lock even though it never moves a
    /// cursor, keeping enumeration strictly serialized against
    /// selection.
    fn getall(&self, ctx: &DataplaneCtx) -> Vec<LaddrEntryDump> {
        let state = self.state.write();

        let dump = |e: &Arc<LocalAddr>| LaddrEntryDump {
            family: e.family(),
            addr: e.addr,
            // Reserved on the wire.
            nport_conflict: 0,
            nconns: e.conn_counts(),
        };

        match &state.shape {
            PoolShape::Port(list) => list.entries.iter().map(dump).collect(),
            PoolShape::Addr(lists) => ctx
                .cores()
                .iter()
                .flat_map(|core| lists[core.index()].entries.iter())
                .map(dump)
                .collect(),
        }
    }
}

impl Service {
    /// Allocate a local endpoint for a new connection towards a real
    /// server and write it into the connection's outbound tuple.
    ///
    /// # Errors
    ///
    /// * [`Error::NotSupported`] for services that are neither TCP nor
    ///   UDP.
    /// * [`Error::Resource`] when no usable `(lip, lport)` could be
    ///   reserved within the trial budget.
    pub fn bind_laddr(&self, conn: &mut Conn, core: CoreId) -> Result<()> {
        if !matches!(self.proto(), Protocol::TCP | Protocol::UDP) {
            return Err(Error::NotSupported);
        }
        if conn.template {
            return Ok(());
        }
        self.laddrs.bind(self.ctx(), self.scheduler(), conn, core)
    }

    /// Release the local endpoint held by a connection, if any.
    pub fn unbind_laddr(&self, conn: &mut Conn) -> Result<()> {
        if conn.template {
            return Ok(());
        }
        self.laddrs.unbind(self.ctx(), conn)
    }

    /// Add a local address configured on interface `ifname`.
    ///
    /// # Errors
    ///
    /// * [`Error::NotExist`] if the interface is unknown, or (in
    ///   addr-mode) the address is not configured on it.
    /// * [`Error::Exists`] on duplicate add.
    pub fn laddr_add(&self, addr: IpAddr, ifname: &str) -> Result<()> {
        self.laddrs.add(self.ctx(), addr, ifname)
    }

    /// Remove a local address.
    ///
    /// # Errors
    ///
    /// * [`Error::NotExist`] if the address is not in the pool.
    /// * [`Error::Busy`] while any bind holds a reference to it.
    pub fn laddr_del(&self, addr: IpAddr) -> Result<()> {
        self.laddrs.del(self.ctx(), addr)
    }

    /// Remove every idle local address; `Busy` reports that in-use
    /// entries were left in place.
    pub fn laddr_flush(&self) -> Result<()> {
        self.laddrs.flush(self.ctx())
    }

    /// Snapshot the pool for the control plane.
    pub fn laddr_getall(&self) -> Vec<LaddrEntryDump> {
        self.laddrs.getall(self.ctx())
    }

    /// Snapshot the pool's allocation counters.
    pub fn laddr_stats(&self) -> LaddrStatsSnap {
        self.laddrs.stats().snapshot()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::engine::netif::IfaceTable;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn list_of(addrs: &[&str]) -> LaddrList {
        let ifaces = IfaceTable::new();
        let eth0 = ifaces.register("eth0", 1);
        let mut list = LaddrList::new();
        for a in addrs {
            list.push(LocalAddr::new(ip(a), Arc::clone(&eth0)));
        }
        list
    }

    #[test]
    fn cursor_rotates_in_order() {
        let mut list = list_of(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let mut picked = Vec::new();
        for _ in 0..6 {
            let e = list.select(1).unwrap();
            picked.push(e.addr());
            e.put();
        }
        let expect: Vec<IpAddr> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
            .iter()
            .cycle()
            .take(6)
            .map(|s| ip(s))
            .collect();
        assert_eq!(picked, expect);
    }

    #[test]
    fn cursor_double_step_skips_one() {
        let mut list = list_of(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let e = list.select(2).unwrap();
        assert_eq!(e.addr(), ip("10.0.0.2"));
        e.put();
        let e = list.select(1).unwrap();
        assert_eq!(e.addr(), ip("10.0.0.3"));
        e.put();
        let e = list.select(2).unwrap();
        assert_eq!(e.addr(), ip("10.0.0.2"));
        e.put();
    }

    #[test]
    fn select_takes_reference() {
        let mut list = list_of(&["10.0.0.1"]);
        let e = list.select(1).unwrap();
        assert_eq!(e.refcnt(), 1);
        let e2 = list.select(1).unwrap();
        assert_eq!(e.refcnt(), 2);
        e.put();
        e2.put();
        assert_eq!(list.entries[0].refcnt(), 0);
    }

    #[test]
    fn select_empty_is_none() {
        let mut list = LaddrList::new();
        assert!(list.select(1).is_none());
        assert!(list.select(2).is_none());
    }

    #[test]
    fn remove_under_cursor_moves_to_successor() {
        let mut list = list_of(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        // Select the middle entry, then remove it.
        if let Some(e) = list.select(2) {
            e.put();
        }
        assert_eq!(list.cursor, Some(1));
        list.remove_at(1);

        // The successor (former tail) took over the cursor position;
        // the next selection rotates past it to the head.
        assert_eq!(list.cursor, Some(1));
        let e = list.select(1).unwrap();
        assert_eq!(e.addr(), ip("10.0.0.1"));
        e.put();
    }

    #[test]
    fn remove_tail_under_cursor_resets_to_head() {
        let mut list = list_of(&["10.0.0.1", "10.0.0.2"]);

        if let Some(e) = list.select(2) {
            e.put();
        }
        assert_eq!(list.cursor, Some(1));
        list.remove_at(1);
        assert_eq!(list.cursor, None);

        let e = list.select(1).unwrap();
        assert_eq!(e.addr(), ip("10.0.0.1"));
        e.put();
    }

    #[test]
    fn remove_before_cursor_shifts_it() {
        let mut list = list_of(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        if let Some(e) = list.select(3) {
            e.put();
        }
        assert_eq!(list.cursor, Some(2));
        list.remove_at(0);
        assert_eq!(list.cursor, Some(1));

        // Rotation continues with the head, as it would have.
        let e = list.select(1).unwrap();
        assert_eq!(e.addr(), ip("10.0.0.2"));
        e.put();
    }

    #[test]
    fn flush_keeps_busy_entries() {
        let mut list = list_of(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]);

        let held = list.select(2).unwrap();
        assert!(list.flush_idle());
        assert_eq!(list.len(), 1);
        assert_eq!(list.entries[0].addr(), ip("10.0.0.2"));
        // The busy entry was under the cursor and survived.
        assert_eq!(list.cursor, Some(0));

        held.put();
        assert!(!list.flush_idle());
        assert_eq!(list.len(), 0);
        assert_eq!(list.cursor, None);
    }

    #[test]
    fn flush_resets_cursor_when_its_entry_goes() {
        let mut list = list_of(&["10.0.0.1", "10.0.0.2"]);

        // Park the cursor on an idle entry, then flush everything.
        let e = list.select(1).unwrap();
        e.put();
        assert_eq!(list.cursor, Some(0));

        assert!(!list.flush_idle());
        assert_eq!(list.len(), 0);
        assert_eq!(list.cursor, None);
    }
}
