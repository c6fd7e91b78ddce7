// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The control-channel interface.
//!
//! The host owns the transport: some request/reply channel delivering
//! an opcode plus a serialized body, and carrying a status (plus an
//! optional body) back. These handlers sit directly behind it. Bodies
//! are postcard-encoded [`fnat_api`] types; an undecodable body or an
//! unparsable match filter is `Invalid`, an opcode outside the
//! laddr set is `NotSupported`, and a service lookup miss is
//! `NoService`.

use super::Result;
use super::service::Service;
use super::service::ServiceTable;
use fnat_api::Error;
use fnat_api::GetLaddrsReq;
use fnat_api::GetLaddrsResp;
use fnat_api::LaddrAddReq;
use fnat_api::LaddrCmd;
use fnat_api::LaddrDelReq;
use fnat_api::LaddrFlushReq;
use fnat_api::ServiceKey;
use serde::de::DeserializeOwned;
use std::sync::Arc;

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    postcard::from_bytes(body).map_err(|_| Error::Invalid)
}

fn resolve(table: &ServiceTable, key: &ServiceKey) -> Result<Arc<Service>> {
    if key.af != key.vaddr.family() {
        return Err(Error::Invalid);
    }
    let filter = key.mtch.parse()?;
    table
        .lookup(key.af, key.proto, &key.vaddr, key.vport, key.fwmark, &filter)
        .ok_or(Error::NoService)
}

/// Handle a set-side command: add, delete, or flush.
pub fn sockopt_set(
    table: &ServiceTable,
    cmd: LaddrCmd,
    body: &[u8],
) -> Result<()> {
    match cmd {
        LaddrCmd::AddLaddr => {
            let req: LaddrAddReq = decode(body)?;
            if req.addr.family() != req.family {
                return Err(Error::Invalid);
            }
            let svc = resolve(table, &req.key)?;
            svc.laddr_add(req.addr, &req.ifname)
        }
        LaddrCmd::DelLaddr => {
            let req: LaddrDelReq = decode(body)?;
            if req.addr.family() != req.family {
                return Err(Error::Invalid);
            }
            let svc = resolve(table, &req.key)?;
            svc.laddr_del(req.addr)
        }
        LaddrCmd::FlushLaddr => {
            let req: LaddrFlushReq = decode(body)?;
            let svc = resolve(table, &req.key)?;
            svc.laddr_flush()
        }
        LaddrCmd::GetLaddrs => Err(Error::NotSupported),
    }
}

/// Handle a get-side command, returning the encoded reply body.
pub fn sockopt_get(
    table: &ServiceTable,
    cmd: LaddrCmd,
    body: &[u8],
) -> Result<Vec<u8>> {
    match cmd {
        LaddrCmd::GetLaddrs => {
            let req: GetLaddrsReq = decode(body)?;
            let svc = resolve(table, &req.key)?;
            let resp =
                GetLaddrsResp { key: req.key, laddrs: svc.laddr_getall() };
            postcard::to_allocvec(&resp).map_err(|_| Error::NoMem)
        }
        _ => Err(Error::NotSupported),
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
    use fnat_api::IpAddr;
    use fnat_api::MatchSpec;
    use fnat_api::Protocol;

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

    fn table_with_service() -> ServiceTable {
        let ctx = Arc::new(DataplaneCtx::new(
            PoolMode::PortLcoreMapping,
            CoreMask::EMPTY.set(CoreId(1)),
            Arc::new(NullSa {}),
            Arc::new(ExecCtx { log: Box::new(PrintlnLog {}) }),
        ));
        ctx.ifaces().register("eth0", 1);
        let table = ServiceTable::new(Arc::clone(&ctx));
        let svc = Service::new(
            ctx,
            Protocol::TCP,
            "192.0.2.1".parse().unwrap(),
            80,
            0,
            Default::default(),
            Scheduler::RoundRobin,
        );
        table.add(svc).unwrap();
        table
    }

    fn key() -> ServiceKey {
        ServiceKey {
            af: Family::V4,
            proto: Protocol::TCP,
            vaddr: "192.0.2.1".parse().unwrap(),
            vport: 80,
            fwmark: 0,
            mtch: MatchSpec::default(),
        }
    }

    #[test]
    fn add_then_getall() {
        let table = table_with_service();
        let req = LaddrAddReq {
            key: key(),
            family: Family::V4,
            addr: "10.0.0.1".parse().unwrap(),
            ifname: "eth0".to_string(),
        };
        let body = postcard::to_allocvec(&req).unwrap();
        sockopt_set(&table, LaddrCmd::AddLaddr, &body).unwrap();

        let get = GetLaddrsReq { key: key() };
        let body = postcard::to_allocvec(&get).unwrap();
        let resp_bytes =
            sockopt_get(&table, LaddrCmd::GetLaddrs, &body).unwrap();
        let resp: GetLaddrsResp = postcard::from_bytes(&resp_bytes).unwrap();
        assert_eq!(resp.key, key());
        assert_eq!(resp.laddrs.len(), 1);
        assert_eq!(resp.laddrs[0].addr, "10.0.0.1".parse().unwrap());
        assert_eq!(resp.laddrs[0].nport_conflict, 0);
        assert_eq!(resp.laddrs[0].nconns, 0);
    }

    #[test]
    fn unknown_service_is_noservice() {
        let table = table_with_service();
        let mut bad_key = key();
        bad_key.vport = 81;
        let req = LaddrFlushReq { key: bad_key };
        let body = postcard::to_allocvec(&req).unwrap();
        assert_eq!(
            sockopt_set(&table, LaddrCmd::FlushLaddr, &body),
            Err(Error::NoService)
        );
    }

    #[test]
    fn bad_match_is_invalid() {
        let table = table_with_service();
        let mut bad_key = key();
        bad_key.mtch.srange = "not-a-range".to_string();
        let req = LaddrFlushReq { key: bad_key };
        let body = postcard::to_allocvec(&req).unwrap();
        assert_eq!(
            sockopt_set(&table, LaddrCmd::FlushLaddr, &body),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn family_mismatch_is_invalid() {
        let table = table_with_service();
        let req = LaddrAddReq {
            key: key(),
            family: Family::V6,
            addr: "10.0.0.1".parse().unwrap(),
            ifname: "eth0".to_string(),
        };
        let body = postcard::to_allocvec(&req).unwrap();
        assert_eq!(
            sockopt_set(&table, LaddrCmd::AddLaddr, &body),
            Err(Error::Invalid)
        );
    }

    #[test]
    fn wrong_side_is_notsupported() {
        let table = table_with_service();
        let get = GetLaddrsReq { key: key() };
        let body = postcard::to_allocvec(&get).unwrap();
        assert_eq!(
            sockopt_set(&table, LaddrCmd::GetLaddrs, &body),
            Err(Error::NotSupported)
        );
        assert_eq!(
            sockopt_get(&table, LaddrCmd::AddLaddr, &body),
            Err(Error::NotSupported)
        );
    }

    #[test]
    fn garbage_body_is_invalid() {
        let table = table_with_service();
        assert_eq!(
            sockopt_set(&table, LaddrCmd::FlushLaddr, &[]),
            Err(Error::Invalid)
        );
    }
}
