// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Firmware data, time, thread identity and console output.

use std::time::Duration;

/// EFI configuration tables that can hold the ACPI root pointer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum EfiConfigTable {
    /// ACPI 2.0 and later RSDP.
    Acpi20,
    /// ACPI 1.0 RSDP.
    Acpi10,
}

impl EfiConfigTable {
    /// The vendor GUID of the table.
    pub fn guid(self) -> &'static str {
        match self {
            Self::Acpi20 => "8868E871-E4F1-11D3-BC22-0080C73C8881",
            Self::Acpi10 => "EB9D2D30-2D88-11D3-9A16-0090273FC14D",
        }
    }
}

/// ECAM window handed over by the boot loader.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PciBootInfo {
    /// Physical address of the configuration space of `start_bus`.
    pub base_address: u64,
    /// First decoded bus.
    pub start_bus: u8,
    /// Last decoded bus.
    pub end_bus: u8,
}

/// Miscellaneous host kernel services.
pub trait Platform: Send + Sync {
    /// The physical address the EFI configuration table `table` points to,
    /// if the firmware published it.
    fn efi_config_table(&self, table: EfiConfigTable) -> Option<u64>;

    /// The kernel boot argument string.
    fn boot_args(&self) -> String;

    /// The ECAM window recorded by the boot loader, if any.
    fn pci_boot_info(&self) -> Option<PciBootInfo>;

    /// An identifier unique to the calling thread.
    fn current_thread_id(&self) -> u64;

    /// Time since boot.
    fn uptime(&self) -> Duration;

    /// Blocks the calling thread for at least `duration`.
    fn sleep(&self, duration: Duration);

    /// Busy-waits for at least `duration` without yielding.
    fn stall(&self, duration: Duration);

    /// Whether the caller is running in interrupt context.
    fn at_interrupt_context(&self) -> bool;

    /// Writes to the kernel console.
    fn console_write(&self, message: &str);

    /// Writes to the structured kernel log.
    fn log_write(&self, message: &str);
}
