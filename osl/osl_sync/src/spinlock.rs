// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt-safe spin lock.

use osl_host::InterruptControl;
use osl_host::InterruptsDisabled;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;

/// A spin lock that keeps interrupts disabled while held.
///
/// Interrupts are disabled before the lock is taken and restored after it is
/// released, so a handler that interrupts the holder on the same CPU can
/// never spin on it.
pub struct SpinLock<T: ?Sized> {
    interrupts: Arc<dyn InterruptControl>,
    inner: spin::Mutex<T>,
}

/// Guard returned by [`SpinLock::lock`].
pub struct SpinLockGuard<'a, T: ?Sized> {
    // Fields drop in declaration order: the lock is released before the
    // saved interrupt state is restored.
    guard: spin::MutexGuard<'a, T>,
    _interrupts: InterruptsDisabled<'a>,
}

impl<T> SpinLock<T> {
    /// Creates a new lock protecting `value`.
    pub fn new(interrupts: Arc<dyn InterruptControl>, value: T) -> Self {
        Self {
            interrupts,
            inner: spin::Mutex::new(value),
        }
    }

    /// Consumes the lock, returning the protected value.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T: ?Sized> SpinLock<T> {
    /// Disables interrupts, then spins until the lock is acquired.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let interrupts = InterruptsDisabled::new(&*self.interrupts);
        SpinLockGuard {
            guard: self.inner.lock(),
            _interrupts: interrupts,
        }
    }

    /// Attempts to acquire the lock without spinning. Interrupts are left
    /// untouched on failure.
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T>> {
        let interrupts = InterruptsDisabled::new(&*self.interrupts);
        let guard = self.inner.try_lock()?;
        Some(SpinLockGuard {
            guard,
            _interrupts: interrupts,
        })
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: ?Sized> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T: ?Sized> std::fmt::Debug for SpinLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpinLock")
            .field("locked", &self.inner.is_locked())
            .finish()
    }
}
