// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Synchronization primitives handed to the interpreter engine.
//!
//! [`SpinLock`] may be taken from interrupt and event handler context: it
//! disables interrupt delivery before spinning and restores it only after
//! the lock is released. [`Semaphore`] is a blocking counting semaphore with
//! an optional timeout.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod semaphore;
mod spinlock;

pub use semaphore::Semaphore;
pub use semaphore::Timeout;
pub use spinlock::SpinLock;
pub use spinlock::SpinLockGuard;

use thiserror::Error;

/// Errors returned by the synchronization primitives.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The arguments are inconsistent.
    #[error("invalid semaphore units: initial {initial}, max {max}")]
    InvalidUnits {
        /// Requested initial units.
        initial: u32,
        /// Requested maximum units.
        max: u32,
    },
    /// A wait asked for more units than the semaphore can ever hold.
    #[error("waiting for {units} units exceeds semaphore maximum {max}")]
    TooManyUnits {
        /// Requested units.
        units: u32,
        /// Semaphore maximum.
        max: u32,
    },
    /// A signal would push the count past the semaphore maximum.
    #[error("signal would exceed semaphore maximum {max}")]
    Limit {
        /// Semaphore maximum.
        max: u32,
    },
    /// The wait expired.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}
