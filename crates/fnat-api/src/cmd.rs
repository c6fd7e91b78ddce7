// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The local-address command set.
//!
//! The transport is supplied by the host: an opaque request/reply
//! channel carrying an opcode plus a serialized body. These are the
//! opcode and body types, and the status enumeration every reply
//! carries.

use super::ip::Family;
use super::ip::InetRange;
use super::ip::IpAddr;
use super::ip::Protocol;
use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::result;
use serde::Deserialize;
use serde::Serialize;

/// A local-address command opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(C)]
pub enum LaddrCmd {
    AddLaddr = 1,   // add a local address to a service
    DelLaddr = 2,   // remove a local address from a service
    FlushLaddr = 3, // remove every idle local address from a service
    GetLaddrs = 16, // snapshot a service's local addresses
}

impl TryFrom<i32> for LaddrCmd {
    type Error = ();

    fn try_from(num: i32) -> result::Result<Self, Self::Error> {
        match num {
            1 => Ok(Self::AddLaddr),
            2 => Ok(Self::DelLaddr),
            3 => Ok(Self::FlushLaddr),
            16 => Ok(Self::GetLaddrs),
            _ => Err(()),
        }
    }
}

/// The status taxonomy. Every control operation resolves to `Ok(..)`
/// or exactly one of these.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum Error {
    /// Null or malformed argument, or an undecodable request.
    Invalid,
    /// Protocol other than TCP/UDP, or an unsupported opcode.
    NotSupported,
    /// Service lookup miss.
    NoService,
    /// Interface or address not found.
    NotExist,
    /// Duplicate add.
    Exists,
    /// Exhausted lport/laddr pool.
    Resource,
    /// Delete or flush blocked by an in-use entry.
    Busy,
    /// Allocation failure.
    NoMem,
}

impl Error {
    /// Convert to an errno-style value for hosts that speak numeric
    /// status codes over the channel.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Invalid => libc_consts::EINVAL,
            Self::NotSupported => libc_consts::ENOTSUP,
            Self::NoService => libc_consts::ESRCH,
            Self::NotExist => libc_consts::ENOENT,
            Self::Exists => libc_consts::EEXIST,
            Self::Resource => libc_consts::ENOSPC,
            Self::Busy => libc_consts::EBUSY,
            Self::NoMem => libc_consts::ENOMEM,
        }
    }
}

mod libc_consts {
    pub const ENOENT: i32 = 2;
    pub const ENOMEM: i32 = 12;
    pub const EEXIST: i32 = 17;
    pub const EINVAL: i32 = 22;
    pub const ESRCH: i32 = 3;
    pub const EBUSY: i32 = 16;
    pub const ENOSPC: i32 = 28;
    pub const ENOTSUP: i32 = 95;
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            Self::Invalid => "invalid argument",
            Self::NotSupported => "not supported",
            Self::NoService => "no such service",
            Self::NotExist => "not exist",
            Self::Exists => "already exists",
            Self::Resource => "resource exhausted",
            Self::Busy => "in use",
            Self::NoMem => "out of memory",
        };
        write!(f, "{msg}")
    }
}

impl std::error::Error for Error {}

/// A service match filter as carried on the wire: textual ranges and
/// interface names, empty strings meaning "no constraint".
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MatchSpec {
    pub srange: String,
    pub drange: String,
    pub iifname: String,
    pub oifname: String,
}

impl MatchSpec {
    /// Parse the wire form into a [`MatchFilter`].
    ///
    /// # Errors
    ///
    /// Any unparsable range yields [`Error::Invalid`].
    pub fn parse(&self) -> result::Result<MatchFilter, Error> {
        let parse_range =
            |val: &str| -> result::Result<Option<InetRange>, Error> {
                if val.is_empty() {
                    Ok(None)
                } else {
                    val.parse::<InetRange>()
                        .map(Some)
                        .map_err(|_| Error::Invalid)
                }
            };
        let parse_name = |val: &str| {
            if val.is_empty() { None } else { Some(val.to_string()) }
        };

        Ok(MatchFilter {
            srange: parse_range(&self.srange)?,
            drange: parse_range(&self.drange)?,
            iifname: parse_name(&self.iifname),
            oifname: parse_name(&self.oifname),
        })
    }
}

/// A parsed service match filter. Part of a service's identity: two
/// services with the same virtual endpoint but different filters are
/// distinct.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct MatchFilter {
    pub srange: Option<InetRange>,
    pub drange: Option<InetRange>,
    pub iifname: Option<String>,
    pub oifname: Option<String>,
}

impl MatchFilter {
    pub fn is_empty(&self) -> bool {
        self.srange.is_none()
            && self.drange.is_none()
            && self.iifname.is_none()
            && self.oifname.is_none()
    }
}

/// The key identifying a virtual service on the wire.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ServiceKey {
    pub af: Family,
    pub proto: Protocol,
    pub vaddr: IpAddr,
    pub vport: u16,
    pub fwmark: u32,
    pub mtch: MatchSpec,
}

/// A marker trait indicating a success response type that may be
/// passed back across the control channel.
pub trait CmdOk: Debug + Serialize {}

impl CmdOk for () {}

/// Indicates no meaningful response value on success.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct NoResp {
    pub unused: u64,
}

impl CmdOk for NoResp {}

/// Add a local address to a service.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LaddrAddReq {
    pub key: ServiceKey,
    pub family: Family,
    pub addr: IpAddr,
    pub ifname: String,
}

/// Remove a local address from a service.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LaddrDelReq {
    pub key: ServiceKey,
    pub family: Family,
    pub addr: IpAddr,
}

/// Remove every idle local address from a service.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LaddrFlushReq {
    pub key: ServiceKey,
}

/// Snapshot a service's local addresses.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetLaddrsReq {
    pub key: ServiceKey,
}

/// One local address in a [`GetLaddrsResp`].
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct LaddrEntryDump {
    pub family: Family,
    pub addr: IpAddr,
    /// Reserved; always zero.
    pub nport_conflict: u32,
    /// Live connections currently bound to this address.
    pub nconns: u32,
}

/// The response to a [`GetLaddrsReq`].
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GetLaddrsResp {
    /// The request's service key, echoed.
    pub key: ServiceKey,
    pub laddrs: Vec<LaddrEntryDump>,
}

impl CmdOk for GetLaddrsResp {}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cmd_round_trip() {
        for num in [1, 2, 3, 16] {
            let cmd = LaddrCmd::try_from(num).unwrap();
            assert_eq!(cmd as i32, num);
        }
        assert!(LaddrCmd::try_from(0).is_err());
        assert!(LaddrCmd::try_from(17).is_err());
    }

    #[test]
    fn match_spec_parse() {
        let spec = MatchSpec {
            srange: "10.0.0.1-10.0.0.9:1-1024".to_string(),
            drange: String::new(),
            iifname: "eth0".to_string(),
            oifname: String::new(),
        };
        let filter = spec.parse().unwrap();
        assert!(filter.srange.is_some());
        assert!(filter.drange.is_none());
        assert_eq!(filter.iifname.as_deref(), Some("eth0"));
        assert!(!filter.is_empty());

        assert_eq!(
            MatchSpec::default().parse().unwrap(),
            MatchFilter::default()
        );
        assert!(MatchSpec::default().parse().unwrap().is_empty());
    }

    #[test]
    fn match_spec_parse_bad_range() {
        let spec = MatchSpec {
            srange: "10.0.0.9-10.0.0.1".to_string(),
            ..Default::default()
        };
        assert_eq!(spec.parse().unwrap_err(), Error::Invalid);
    }
}
