// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Physical memory access and mapping.

use crate::AccessWidth;
use thiserror::Error;

/// Error returned when the host cannot map a physical range.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MapError {
    /// The requested range is empty.
    #[error("cannot map an empty range at {address:#x}")]
    Empty {
        /// Physical base address.
        address: u64,
    },
    /// The host could not build a descriptor for the range.
    #[error("no memory descriptor for physical range {address:#x}+{length:#x}")]
    NoDescriptor {
        /// Physical base address.
        address: u64,
        /// Length in bytes.
        length: usize,
    },
    /// The host built a descriptor but could not map it.
    #[error("failed to map physical range {address:#x}+{length:#x}")]
    MapFailed {
        /// Physical base address.
        address: u64,
        /// Length in bytes.
        length: usize,
    },
}

/// A live host mapping of a physical range. Dropping it releases the
/// mapping.
pub trait HostMapping: Send + Sync {
    /// The virtual address of the first mapped byte.
    fn virtual_address(&self) -> u64;

    /// The mapped length in bytes.
    fn length(&self) -> usize;
}

/// Physical memory services of the host kernel.
pub trait PhysicalMemory: Send + Sync {
    /// Maps `length` bytes starting at physical `address` into the kernel
    /// address space.
    fn map(&self, address: u64, length: usize) -> Result<Box<dyn HostMapping>, MapError>;

    /// Translates a kernel virtual address to a physical address.
    fn virtual_to_physical(&self, virtual_address: u64) -> Option<u64>;

    /// Performs a single load of `width` at physical `address`. The result
    /// is zero-extended.
    fn read(&self, address: u64, width: AccessWidth) -> u64;

    /// Performs a single store of the low `width` bits of `value` at
    /// physical `address`.
    fn write(&self, address: u64, width: AccessWidth, value: u64);

    /// Copies `buf.len()` bytes starting at physical `address` into `buf`.
    fn read_bytes(&self, address: u64, buf: &mut [u8]);
}
