// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Registry of physical memory mappings made for the interpreter engine.
//!
//! The engine identifies a mapping only by the virtual address and length it
//! was given, so the registry keeps the host mapping object for each live
//! mapping and looks it up again on unmap.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use osl_host::HostMapping;
use osl_host::MapError;
use osl_host::PhysicalMemory;
use parking_lot::Mutex;
use std::sync::Arc;

struct MappingRecord {
    physical_address: u64,
    virtual_address: u64,
    length: usize,
    // Released on drop.
    _mapping: Box<dyn HostMapping>,
}

/// The set of live mappings.
///
/// The registry lock blocks; the registry must not be used from interrupt
/// context.
pub struct MappingRegistry {
    physical: Arc<dyn PhysicalMemory>,
    records: Mutex<Vec<MappingRecord>>,
}

impl MappingRegistry {
    /// Creates an empty registry mapping through `physical`.
    pub fn new(physical: Arc<dyn PhysicalMemory>) -> Self {
        Self {
            physical,
            records: Mutex::new(Vec::new()),
        }
    }

    /// Maps `length` bytes at physical `address` and returns the virtual
    /// address of the first byte. On failure nothing is recorded.
    pub fn map(&self, address: u64, length: usize) -> Result<u64, MapError> {
        let mapping = self.physical.map(address, length).map_err(|err| {
            tracing::warn!(
                address,
                length,
                error = &err as &dyn std::error::Error,
                "failed to map physical range"
            );
            err
        })?;

        let virtual_address = mapping.virtual_address();
        self.records.lock().push(MappingRecord {
            physical_address: address,
            virtual_address,
            length,
            _mapping: mapping,
        });
        tracing::trace!(address, length, virtual_address, "mapped");
        Ok(virtual_address)
    }

    /// Releases the mapping whose virtual address and length match exactly.
    /// Returns false, and does nothing, if there is no such mapping.
    pub fn unmap(&self, virtual_address: u64, length: usize) -> bool {
        let removed = {
            let mut records = self.records.lock();
            records
                .iter()
                .position(|r| r.virtual_address == virtual_address && r.length == length)
                .map(|i| records.swap_remove(i))
        };
        match removed {
            Some(record) => {
                tracing::trace!(
                    address = record.physical_address,
                    length,
                    virtual_address,
                    "unmapped"
                );
                // Dropped outside the lock.
                drop(record);
                true
            }
            None => {
                tracing::debug!(virtual_address, length, "unmap of unknown mapping ignored");
                false
            }
        }
    }

    /// The number of live mappings.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether there are no live mappings.
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Releases every live mapping. Returns the number released.
    pub fn clear(&self) -> usize {
        let records = std::mem::take(&mut *self.records.lock());
        let count = records.len();
        if count != 0 {
            tracing::debug!(count, "releasing outstanding mappings");
        }
        count
    }
}

impl Drop for MappingRegistry {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for MappingRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappingRegistry")
            .field("len", &self.len())
            .finish()
    }
}
