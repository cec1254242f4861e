// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tag-checked allocations on the host heap.
//!
//! Every allocation made on behalf of the interpreter engine carries a header
//! holding a magic tag and the number of bytes obtained from the host. A free
//! validates the header before trusting the size, so a bogus or stale handle
//! is refused instead of corrupting host heap accounting.
//!
//! Headers live in an allocation record addressed by an [`AllocationHandle`]
//! (slot index plus generation) rather than in front of the payload.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use osl_host::HeapBuf;
use osl_host::HostHeap;
use osl_host::OutOfMemory;
use std::sync::Arc;
use thiserror::Error;

/// Tag stored in the header of every live allocation.
pub const ALLOCATION_MAGIC: u32 = u32::from_be_bytes(*b"mema");

/// Size of the header charged to the host heap with every allocation.
pub const HEADER_SIZE: usize = size_of::<AllocationHeader>();

/// Errors returned by [`TaggedAllocator`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    /// The host heap could not satisfy the request.
    #[error("allocation failed")]
    OutOfMemory(#[source] OutOfMemory),
    /// The handle does not refer to a live allocation.
    #[error("refusing to free {0}: header tag mismatch")]
    BadTag(AllocationHandle),
}

#[derive(Debug, Copy, Clone)]
struct AllocationHeader {
    magic: u32,
    size: usize,
}

/// Identifies one allocation made by a [`TaggedAllocator`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AllocationHandle {
    index: u32,
    generation: u32,
}

impl std::fmt::Display for AllocationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "allocation {}.{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Record {
    header: AllocationHeader,
    generation: u32,
    payload: Option<HeapBuf>,
}

/// Allocates tagged payloads from the host heap.
///
/// The allocator does no locking of its own; callers that share it must
/// serialize access.
pub struct TaggedAllocator {
    heap: Arc<dyn HostHeap>,
    records: Vec<Record>,
    vacant: Vec<u32>,
    live: usize,
}

impl TaggedAllocator {
    /// Creates an allocator drawing from `heap`.
    pub fn new(heap: Arc<dyn HostHeap>) -> Self {
        Self {
            heap,
            records: Vec::new(),
            vacant: Vec::new(),
            live: 0,
        }
    }

    /// Allocates `size` bytes. The contents are unspecified.
    pub fn allocate(&mut self, size: usize) -> Result<AllocationHandle, AllocError> {
        let payload = HeapBuf::new(&self.heap, size, HEADER_SIZE).map_err(|err| {
            tracing::debug!(size, "host heap refused allocation");
            AllocError::OutOfMemory(err)
        })?;
        let header = AllocationHeader {
            magic: ALLOCATION_MAGIC,
            size: payload.charged(),
        };

        let index = match self.vacant.pop() {
            Some(index) => {
                let record = &mut self.records[index as usize];
                record.header = header;
                record.payload = Some(payload);
                index
            }
            None => {
                self.records.push(Record {
                    header,
                    generation: 0,
                    payload: Some(payload),
                });
                (self.records.len() - 1) as u32
            }
        };

        self.live += 1;
        let handle = AllocationHandle {
            index,
            generation: self.records[index as usize].generation,
        };
        tracing::trace!(%handle, size, "allocate");
        Ok(handle)
    }

    /// Allocates `size` bytes and zero-fills them.
    pub fn allocate_zeroed(&mut self, size: usize) -> Result<AllocationHandle, AllocError> {
        let handle = self.allocate(size)?;
        if let Some(payload) = self.payload_mut(handle) {
            payload.fill(0);
        }
        Ok(handle)
    }

    /// Frees an allocation, returning its bytes to the host heap.
    ///
    /// A handle whose header does not carry the allocation tag, or that was
    /// already freed, is refused: the host heap is left untouched.
    pub fn free(&mut self, handle: AllocationHandle) -> Result<(), AllocError> {
        let Some(record) = self.record_mut(handle) else {
            tracing::warn!(%handle, "free of unknown allocation refused");
            return Err(AllocError::BadTag(handle));
        };

        let size = record.header.size;
        let payload = record.payload.take();
        record.header.magic = 0;
        record.generation = record.generation.wrapping_add(1);
        debug_assert_eq!(payload.as_ref().map(|p| p.charged()), Some(size));
        drop(payload);

        self.vacant.push(handle.index);
        self.live -= 1;
        tracing::trace!(%handle, size, "free");
        Ok(())
    }

    /// The payload of a live allocation.
    pub fn payload(&self, handle: AllocationHandle) -> Option<&[u8]> {
        let record = self.records.get(handle.index as usize)?;
        Self::check(record, handle)?;
        record.payload.as_deref()
    }

    /// The mutable payload of a live allocation.
    pub fn payload_mut(&mut self, handle: AllocationHandle) -> Option<&mut [u8]> {
        self.record_mut(handle)?.payload.as_deref_mut()
    }

    /// The number of bytes charged to the host for a live allocation,
    /// including the header.
    pub fn size(&self, handle: AllocationHandle) -> Option<usize> {
        let record = self.records.get(handle.index as usize)?;
        Self::check(record, handle)?;
        Some(record.header.size)
    }

    /// The number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.live
    }

    fn record_mut(&mut self, handle: AllocationHandle) -> Option<&mut Record> {
        let record = self.records.get_mut(handle.index as usize)?;
        Self::check(record, handle)?;
        Some(record)
    }

    fn check(record: &Record, handle: AllocationHandle) -> Option<()> {
        (record.header.magic == ALLOCATION_MAGIC && record.generation == handle.generation)
            .then_some(())
    }
}

impl std::fmt::Debug for TaggedAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaggedAllocator")
            .field("live", &self.live)
            .field("slots", &self.records.len())
            .finish()
    }
}
