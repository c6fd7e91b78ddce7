// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The connection fields the allocator touches.
//!
//! The full connection entry (state machine, timers, tuple hash
//! buckets) belongs to the connection table; the allocator reads the
//! destination, writes the bound local endpoint and the outbound
//! tuple, and keeps a back-reference to the local address entry so
//! that teardown can return exactly what bind took.

use super::laddr::LocalAddr;
use fnat_api::IpAddr;
use fnat_api::Ipv4Addr;
use fnat_api::Protocol;
use std::sync::Arc;

/// The outbound half of the connection's tuple hash: the destination
/// the real server replies to, i.e. the bound local endpoint.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct OutTuple {
    pub daddr: IpAddr,
    pub dport: u16,
}

/// A connection as seen by the allocator.
pub struct Conn {
    pub proto: Protocol,
    /// Template connections hold session affinity and never carry
    /// traffic themselves; they are exempt from local-address binding.
    pub template: bool,

    /// Destination endpoint: the chosen real server.
    pub daddr: IpAddr,
    pub dport: u16,

    /// Bound local endpoint. Valid only while `local` is set.
    pub laddr: IpAddr,
    pub lport: u16,

    /// Outbound tuple-hash fields, rewritten on bind.
    pub tuple_out: OutTuple,

    local: Option<Arc<LocalAddr>>,
}

impl Conn {
    pub fn new(proto: Protocol, daddr: IpAddr, dport: u16) -> Self {
        Self {
            proto,
            template: false,
            daddr,
            dport,
            laddr: IpAddr::Ip4(Ipv4Addr::ANY_ADDR),
            lport: 0,
            tuple_out: OutTuple::default(),
            local: None,
        }
    }

    pub fn new_template(proto: Protocol, daddr: IpAddr, dport: u16) -> Self {
        Self { template: true, ..Self::new(proto, daddr, dport) }
    }

    /// The local address entry this connection is bound to, if any.
    pub fn local(&self) -> Option<&Arc<LocalAddr>> {
        self.local.as_ref()
    }

    pub(crate) fn set_local(&mut self, laddr: Arc<LocalAddr>) {
        self.local = Some(laddr);
    }

    pub(crate) fn take_local(&mut self) -> Option<Arc<LocalAddr>> {
        self.local.take()
    }
}
