// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host kernel services consumed by the ACPI OS services layer.
//!
//! The OS services layer never touches hardware or the kernel heap directly.
//! Every primitive it needs from the host kernel is expressed as one of the
//! traits in this crate, and an embedding supplies an implementation of each
//! through [`HostServices`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod heap;
mod interrupts;
mod io;
mod physical;
mod platform;

pub use heap::HeapBox;
pub use heap::HeapBuf;
pub use heap::HostHeap;
pub use heap::OutOfMemory;
pub use heap::SystemHeap;
pub use interrupts::InterruptControl;
pub use interrupts::InterruptState;
pub use interrupts::InterruptsDisabled;
pub use io::AccessWidth;
pub use io::PortIo;
pub use physical::HostMapping;
pub use physical::MapError;
pub use physical::PhysicalMemory;
pub use platform::EfiConfigTable;
pub use platform::PciBootInfo;
pub use platform::Platform;

use std::sync::Arc;

/// The full set of host primitives the OS services layer is built on.
#[derive(Clone)]
pub struct HostServices {
    /// Heap budget for every allocation made on behalf of the engine.
    pub heap: Arc<dyn HostHeap>,
    /// Interrupt delivery control for the current execution context.
    pub interrupts: Arc<dyn InterruptControl>,
    /// Legacy port I/O.
    pub ports: Arc<dyn PortIo>,
    /// Physical memory access and mapping.
    pub physical: Arc<dyn PhysicalMemory>,
    /// Firmware data, time, thread identity and console output.
    pub platform: Arc<dyn Platform>,
}

impl std::fmt::Debug for HostServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostServices")
            .field("heap_in_use", &self.heap.in_use())
            .finish_non_exhaustive()
    }
}
