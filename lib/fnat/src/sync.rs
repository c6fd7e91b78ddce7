// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Safe abstractions for synchronization primitives.
//!
//! These wrap `std::sync` and absorb lock poisoning: a worker that
//! panics while holding a service lock takes the process down with it
//! anyway, so every other path treats the lock as always healthy and
//! gets a guard back directly rather than a `Result`.

use core::ops::Deref;
use core::ops::DerefMut;

pub struct Mutex<T> {
    inner: std::sync::Mutex<T>,
}

pub struct MutexGuard<'a, T: 'a> {
    guard: std::sync::MutexGuard<'a, T>,
}

impl<T> Mutex<T> {
    pub fn new(val: T) -> Self {
        Mutex { inner: std::sync::Mutex::new(val) }
    }

    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.inner.into_inner().unwrap()
    }

    pub fn lock(&self) -> MutexGuard<T> {
        let guard = self.inner.lock().unwrap();
        MutexGuard { guard }
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}

pub struct RwLock<T> {
    inner: std::sync::RwLock<T>,
}

pub struct RwLockReadGuard<'a, T: 'a> {
    guard: std::sync::RwLockReadGuard<'a, T>,
}

pub struct RwLockWriteGuard<'a, T: 'a> {
    guard: std::sync::RwLockWriteGuard<'a, T>,
}

impl<T> RwLock<T> {
    pub fn new(val: T) -> Self {
        RwLock { inner: std::sync::RwLock::new(val) }
    }

    pub fn into_inner(self) -> T
    where
        T: Sized,
    {
        self.inner.into_inner().unwrap()
    }

    pub fn read(&self) -> RwLockReadGuard<T> {
        let guard = self.inner.read().unwrap();
        RwLockReadGuard { guard }
    }

    pub fn write(&self) -> RwLockWriteGuard<T> {
        let guard = self.inner.write().unwrap();
        RwLockWriteGuard { guard }
    }
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.guard.deref()
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.guard.deref_mut()
    }
}
