// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Network interface handles.
//!
//! The engine never drives an interface itself; it only needs stable
//! handles so that a local address can name the device it is
//! configured on, and so the socket-address pool can be addressed per
//! interface.

use crate::sync::RwLock;
use core::fmt;
use core::fmt::Display;
use std::collections::BTreeMap;
use std::sync::Arc;

/// A network interface.
#[derive(Debug, Eq, PartialEq)]
pub struct Iface {
    name: String,
    index: u32,
}

impl Iface {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

impl Display for Iface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// The table of known interfaces, registered by the host at startup.
pub struct IfaceTable {
    inner: RwLock<BTreeMap<String, Arc<Iface>>>,
}

impl IfaceTable {
    pub fn new() -> Self {
        Self { inner: RwLock::new(BTreeMap::new()) }
    }

    /// Register an interface, returning its handle. Registering a name
    /// twice returns the existing handle.
    pub fn register(&self, name: &str, index: u32) -> Arc<Iface> {
        let mut table = self.inner.write();
        if let Some(iface) = table.get(name) {
            return Arc::clone(iface);
        }
        let iface = Arc::new(Iface { name: name.to_string(), index });
        table.insert(name.to_string(), Arc::clone(&iface));
        iface
    }

    /// Look up an interface by name.
    pub fn get_by_name(&self, name: &str) -> Option<Arc<Iface>> {
        self.inner.read().get(name).map(Arc::clone)
    }
}

impl Default for IfaceTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_and_lookup() {
        let table = IfaceTable::new();
        let eth0 = table.register("eth0", 1);
        assert_eq!(eth0.name(), "eth0");
        assert_eq!(eth0.index(), 1);

        let again = table.register("eth0", 9);
        assert!(Arc::ptr_eq(&eth0, &again));
        assert_eq!(again.index(), 1);

        assert!(table.get_by_name("eth1").is_none());
        let found = table.get_by_name("eth0").unwrap();
        assert!(Arc::ptr_eq(&eth0, &found));
    }
}
