// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interrupt delivery control.

/// Interrupt delivery state saved by [`InterruptControl::disable`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub struct InterruptState {
    enabled: bool,
}

impl InterruptState {
    /// Captures a delivery state.
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    /// Whether interrupts were enabled when this state was captured.
    pub fn was_enabled(&self) -> bool {
        self.enabled
    }
}

/// Control over interrupt delivery on the current execution context.
pub trait InterruptControl: Send + Sync {
    /// Disables interrupt delivery and returns the previous state.
    fn disable(&self) -> InterruptState;

    /// Restores a state previously returned by [`InterruptControl::disable`].
    fn restore(&self, state: InterruptState);

    /// Whether interrupts are currently enabled.
    fn are_enabled(&self) -> bool;
}

/// A scope with interrupts disabled. Dropping it restores the saved state.
#[must_use]
pub struct InterruptsDisabled<'a> {
    control: &'a dyn InterruptControl,
    saved: InterruptState,
}

impl<'a> InterruptsDisabled<'a> {
    /// Disables interrupts until the returned value is dropped.
    pub fn new(control: &'a dyn InterruptControl) -> Self {
        let saved = control.disable();
        Self { control, saved }
    }
}

impl Drop for InterruptsDisabled<'_> {
    fn drop(&mut self) {
        self.control.restore(self.saved);
    }
}

impl std::fmt::Debug for InterruptsDisabled<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptsDisabled")
            .field("saved", &self.saved)
            .finish()
    }
}
