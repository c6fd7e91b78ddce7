// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Address, protocol, and endpoint types.

use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::ops::Deref;
use core::result;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// An address family.
///
/// The numeric values are the ones carried on the control channel;
/// they follow the conventional `AF_INET`/`AF_INET6` codes.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(u8)]
pub enum Family {
    V4 = 2,
    V6 = 10,
}

impl TryFrom<u8> for Family {
    type Error = String;

    fn try_from(val: u8) -> result::Result<Self, Self::Error> {
        match val {
            2 => Ok(Family::V4),
            10 => Ok(Family::V6),
            _ => Err(format!("invalid address family: {val}")),
        }
    }
}

impl Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Family::V4 => write!(f, "ipv4"),
            Family::V6 => write!(f, "ipv6"),
        }
    }
}

/// An IP protocol value.
#[repr(u8)]
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum Protocol {
    ICMP,
    IGMP,
    TCP,
    UDP,
    ICMPv6,
    Unknown(u8),
}

pub const PROTO_ICMP: u8 = 0x1;
pub const PROTO_IGMP: u8 = 0x2;
pub const PROTO_TCP: u8 = 0x6;
pub const PROTO_UDP: u8 = 0x11;
pub const PROTO_ICMPV6: u8 = 0x3A;

impl Default for Protocol {
    fn default() -> Self {
        Self::Unknown(255)
    }
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::ICMP => write!(f, "ICMP"),
            Self::IGMP => write!(f, "IGMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::ICMPv6 => write!(f, "ICMPv6"),
            Self::Unknown(_) => write!(f, "Unknown"),
        }
    }
}

impl From<u8> for Protocol {
    fn from(proto: u8) -> Self {
        match proto {
            PROTO_ICMP => Self::ICMP,
            PROTO_IGMP => Self::IGMP,
            PROTO_TCP => Self::TCP,
            PROTO_UDP => Self::UDP,
            PROTO_ICMPV6 => Self::ICMPv6,
            _ => Self::Unknown(proto),
        }
    }
}

impl From<Protocol> for u8 {
    fn from(proto: Protocol) -> u8 {
        match proto {
            Protocol::ICMP => PROTO_ICMP,
            Protocol::IGMP => PROTO_IGMP,
            Protocol::TCP => PROTO_TCP,
            Protocol::UDP => PROTO_UDP,
            Protocol::ICMPv6 => PROTO_ICMPV6,
            Protocol::Unknown(v) => v,
        }
    }
}

/// An IPv4 or IPv6 address.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub enum IpAddr {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
}

impl IpAddr {
    /// Return the address family of this address.
    pub const fn family(&self) -> Family {
        match self {
            IpAddr::Ip4(_) => Family::V4,
            IpAddr::Ip6(_) => Family::V6,
        }
    }
}

impl From<Ipv4Addr> for IpAddr {
    fn from(ipv4: Ipv4Addr) -> Self {
        IpAddr::Ip4(ipv4)
    }
}

impl From<Ipv6Addr> for IpAddr {
    fn from(ipv6: Ipv6Addr) -> Self {
        IpAddr::Ip6(ipv6)
    }
}

impl From<std::net::IpAddr> for IpAddr {
    fn from(ip: std::net::IpAddr) -> Self {
        match ip {
            std::net::IpAddr::V4(ipv4) => Self::Ip4(ipv4.into()),
            std::net::IpAddr::V6(ipv6) => Self::Ip6(ipv6.into()),
        }
    }
}

impl From<IpAddr> for std::net::IpAddr {
    fn from(ip: IpAddr) -> Self {
        match ip {
            IpAddr::Ip4(ipv4) => Self::V4(ipv4.into()),
            IpAddr::Ip6(ipv6) => Self::V6(ipv6.into()),
        }
    }
}

impl Default for IpAddr {
    fn default() -> Self {
        IpAddr::Ip4(Default::default())
    }
}

impl Display for IpAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpAddr::Ip4(ip4) => write!(f, "{ip4}"),
            IpAddr::Ip6(ip6) => write!(f, "{ip6}"),
        }
    }
}

impl FromStr for IpAddr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        if let Ok(ipv4) = val.parse::<Ipv4Addr>() {
            Ok(ipv4.into())
        } else {
            val.parse::<Ipv6Addr>()
                .map(IpAddr::Ip6)
                .map_err(|_| String::from("Invalid IP address"))
        }
    }
}

/// An IPv4 address.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(C)]
pub struct Ipv4Addr {
    inner: [u8; 4],
}

impl Ipv4Addr {
    pub const ANY_ADDR: Self = Self { inner: [0; 4] };

    /// Return the bytes of the address.
    #[inline]
    pub fn bytes(&self) -> [u8; 4] {
        self.inner
    }

    pub const fn from_const(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }
}

impl From<std::net::Ipv4Addr> for Ipv4Addr {
    fn from(ip4: std::net::Ipv4Addr) -> Self {
        Self { inner: ip4.octets() }
    }
}

impl From<Ipv4Addr> for std::net::Ipv4Addr {
    fn from(ip4: Ipv4Addr) -> Self {
        Self::from(ip4.inner)
    }
}

impl From<Ipv4Addr> for u32 {
    fn from(ip: Ipv4Addr) -> u32 {
        u32::from_be_bytes(ip.bytes())
    }
}

impl From<u32> for Ipv4Addr {
    fn from(val: u32) -> Self {
        Self { inner: val.to_be_bytes() }
    }
}

impl From<[u8; 4]> for Ipv4Addr {
    fn from(bytes: [u8; 4]) -> Self {
        Self { inner: bytes }
    }
}

impl FromStr for Ipv4Addr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        let octets: Vec<u8> = val
            .split('.')
            .map(|s| s.parse().map_err(|e| format!("{e}")))
            .collect::<result::Result<Vec<u8>, _>>()?;

        if octets.len() != 4 {
            return Err(format!("malformed ip: {val}"));
        }

        Ok(Self { inner: [octets[0], octets[1], octets[2], octets[3]] })
    }
}

impl Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.inner[0], self.inner[1], self.inner[2], self.inner[3],
        )
    }
}

// There's no reason to view an Ipv4Addr as its raw array, so just
// present it in a human-friendly manner.
impl Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Ipv4Addr {{ inner: {self} }}")
    }
}

impl AsRef<[u8]> for Ipv4Addr {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl Deref for Ipv4Addr {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// An IPv6 address.
#[derive(
    Clone,
    Copy,
    Debug,
    Default,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
#[repr(C)]
pub struct Ipv6Addr {
    inner: [u8; 16],
}

impl Ipv6Addr {
    /// The unspecified IPv6 address, i.e., `::` or all zeros.
    pub const ANY_ADDR: Self = Self { inner: [0; 16] };

    /// Return the bytes of the address.
    pub fn bytes(&self) -> [u8; 16] {
        self.inner
    }

    pub const fn from_const(words: [u16; 8]) -> Self {
        let w0 = words[0].to_be_bytes();
        let w1 = words[1].to_be_bytes();
        let w2 = words[2].to_be_bytes();
        let w3 = words[3].to_be_bytes();
        let w4 = words[4].to_be_bytes();
        let w5 = words[5].to_be_bytes();
        let w6 = words[6].to_be_bytes();
        let w7 = words[7].to_be_bytes();
        Self {
            inner: [
                w0[0], w0[1], w1[0], w1[1], w2[0], w2[1], w3[0], w3[1], w4[0],
                w4[1], w5[0], w5[1], w6[0], w6[1], w7[0], w7[1],
            ],
        }
    }
}

impl From<std::net::Ipv6Addr> for Ipv6Addr {
    fn from(ip6: std::net::Ipv6Addr) -> Self {
        Self { inner: ip6.octets() }
    }
}

impl From<Ipv6Addr> for std::net::Ipv6Addr {
    fn from(ip6: Ipv6Addr) -> Self {
        Self::from(ip6.inner)
    }
}

impl From<[u8; 16]> for Ipv6Addr {
    fn from(bytes: [u8; 16]) -> Ipv6Addr {
        Ipv6Addr { inner: bytes }
    }
}

impl From<[u16; 8]> for Ipv6Addr {
    fn from(words: [u16; 8]) -> Ipv6Addr {
        Self::from_const(words)
    }
}

impl From<Ipv6Addr> for u128 {
    fn from(ip: Ipv6Addr) -> u128 {
        u128::from_be_bytes(ip.bytes())
    }
}

impl From<u128> for Ipv6Addr {
    fn from(val: u128) -> Ipv6Addr {
        Self { inner: val.to_be_bytes() }
    }
}

impl FromStr for Ipv6Addr {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        let ip = val
            .parse::<std::net::Ipv6Addr>()
            .map_err(|_| String::from("Invalid IPv6 address"))?;
        Ok(ip.into())
    }
}

impl Display for Ipv6Addr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", std::net::Ipv6Addr::from(self.inner))
    }
}

impl AsRef<[u8]> for Ipv6Addr {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl Deref for Ipv6Addr {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

/// A socket endpoint: an IP address and a port.
///
/// This is the unit of exchange with the socket-address pool: a fetch
/// names a destination endpoint and a source address, and yields the
/// source endpoint; a release returns exactly that pair.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Endpoint {
    pub addr: IpAddr,
    pub port: u16,
}

impl Endpoint {
    pub fn new(addr: IpAddr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.addr {
            IpAddr::Ip4(ip4) => write!(f, "{}:{}", ip4, self.port),
            IpAddr::Ip6(ip6) => write!(f, "[{}]:{}", ip6, self.port),
        }
    }
}

/// An inclusive range of addresses and ports, as used by service match
/// filters.
///
/// The textual form is `addr[-addr][:port[-port]]`, with IPv6
/// addresses in brackets: `10.0.0.1-10.0.0.9:80-88`,
/// `[fd00::1]-[fd00::9]:80`. An omitted port range means any port.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct InetRange {
    pub min_addr: IpAddr,
    pub max_addr: IpAddr,
    pub min_port: u16,
    pub max_port: u16,
}

impl InetRange {
    /// Return the address family of the range.
    pub fn family(&self) -> Family {
        self.min_addr.family()
    }
}

fn parse_port_range(val: &str) -> result::Result<(u16, u16), String> {
    let (min_s, max_s) = match val.split_once('-') {
        Some((min_s, max_s)) => (min_s, max_s),
        None => (val, val),
    };
    let min = min_s.parse::<u16>().map_err(|e| format!("{e}"))?;
    let max = max_s.parse::<u16>().map_err(|e| format!("{e}"))?;
    if min > max {
        return Err(format!("inverted port range: {val}"));
    }
    Ok((min, max))
}

impl FromStr for InetRange {
    type Err = String;

    fn from_str(val: &str) -> result::Result<Self, Self::Err> {
        if val.is_empty() {
            return Err(String::from("empty range"));
        }

        // Split the address part from the optional port part. IPv6
        // literals contain colons, so they must be bracketed.
        let (addr_part, port_part) = if val.starts_with('[') {
            let end = val.rfind(']').ok_or("unterminated bracket")?;
            let rest = &val[end + 1..];
            match rest.strip_prefix(':') {
                Some(ports) => (&val[..=end], Some(ports)),
                None if rest.is_empty() => (&val[..=end], None),
                None => return Err(format!("malformed range: {val}")),
            }
        } else {
            match val.split_once(':') {
                Some((addrs, ports)) => (addrs, Some(ports)),
                None => (val, None),
            }
        };

        // A `-` never occurs inside an address literal, bracketed or
        // not, so a plain split suffices.
        let (min_s, max_s) = match addr_part.split_once('-') {
            Some((min_s, max_s)) => (min_s, max_s),
            None => (addr_part, addr_part),
        };
        let strip = |s: &str| {
            s.trim_start_matches('[').trim_end_matches(']').to_string()
        };
        let min_addr = strip(min_s).parse::<IpAddr>()?;
        let max_addr = strip(max_s).parse::<IpAddr>()?;

        if min_addr.family() != max_addr.family() {
            return Err(format!("mixed address families: {val}"));
        }
        if min_addr > max_addr {
            return Err(format!("inverted address range: {val}"));
        }

        let (min_port, max_port) = match port_part {
            Some(ports) => parse_port_range(ports)?,
            None => (0, u16::MAX),
        };

        Ok(Self { min_addr, max_addr, min_port, max_port })
    }
}

impl Display for InetRange {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.min_addr, self.max_addr) {
            (IpAddr::Ip4(min), IpAddr::Ip4(max)) => {
                write!(f, "{min}-{max}")?;
            }
            (min, max) => write!(f, "[{min}]-[{max}]")?,
        }
        write!(f, ":{}-{}", self.min_port, self.max_port)
    }
}
