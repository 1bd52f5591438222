// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Lock helpers that recover from poisoning instead of panicking.
//!
//! File workers, the progress aggregator and the coordinator all touch the
//! same `FileDownload` records from different threads. A worker that panics
//! mid-chunk must not take the whole session down with it, so every lock in
//! the engine is acquired through these helpers: a poisoned lock is logged
//! and the guard is recovered anyway.
//!
//! ```no_run
//! use std::sync::RwLock;
//! use poliigon_sync::locks::{resilient_read, resilient_write};
//!
//! let lock = RwLock::new(42);
//! let value = *resilient_read(&lock);
//! *resilient_write(&lock) = value + 1;
//! ```

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "locks",
                event = "LOCK_POISONED_READ",
                "RwLock was poisoned during read acquisition, recovering data. \
                 A thread previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering from poisoning if necessary.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "locks",
                event = "LOCK_POISONED_WRITE",
                "RwLock was poisoned during write acquisition, recovering data. \
                 A thread previously panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a mutex, recovering from poisoning if necessary.
///
/// Used for the per-file status lock, where compare-and-set transitions
/// must keep working even after a sibling worker panicked.
#[inline]
pub fn resilient_lock<T>(lock: &Mutex<T>) -> MutexGuard<'_, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "locks",
                event = "LOCK_POISONED_MUTEX",
                "Mutex was poisoned during acquisition, recovering data."
            );
            poisoned.into_inner()
        }
    }
}
