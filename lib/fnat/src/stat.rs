// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Named statistic cells.
//!
//! A subsystem that wants operator-visible counters declares a struct
//! of [`StatU64`] fields along with a plain-integer snapshot type; the
//! cells are updated lock-free on the fast path and snapshotted on
//! demand. Individual values are never corrupted, but a snapshot taken
//! while the dataplane runs may mix values from slightly different
//! instants.

use core::sync::atomic::AtomicU64;
use core::sync::atomic::Ordering;

/// A 64-bit unsigned named statistic.
#[derive(Default)]
pub struct StatU64 {
    value: AtomicU64,
}

impl StatU64 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, val: u64) {
        self.value.store(val, Ordering::Relaxed)
    }

    pub fn val(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    pub fn incr(&self, val: u64) {
        self.value.fetch_add(val, Ordering::Relaxed);
    }

    pub fn decr(&self, val: u64) {
        self.value.fetch_sub(val, Ordering::Relaxed);
    }
}

impl core::ops::AddAssign<u64> for StatU64 {
    #[inline]
    fn add_assign(&mut self, other: u64) {
        self.incr(other);
    }
}

impl core::ops::SubAssign<u64> for StatU64 {
    #[inline]
    fn sub_assign(&mut self, other: u64) {
        self.decr(other);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn stat_ops() {
        let stat = StatU64::new();
        assert_eq!(stat.val(), 0);
        stat.incr(3);
        stat.incr(4);
        assert_eq!(stat.val(), 7);
        stat.decr(2);
        assert_eq!(stat.val(), 5);
        stat.set(42);
        assert_eq!(stat.val(), 42);
    }
}
