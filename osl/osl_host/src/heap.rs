// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host heap budget and heap-charged buffers.

use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// Error returned when the host heap cannot satisfy a request.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("host heap exhausted allocating {size} bytes")]
pub struct OutOfMemory {
    /// Size of the failed request, including any header overhead.
    pub size: usize,
}

/// The host kernel heap, as seen by the OS services layer.
///
/// The layer charges every byte it asks the host for, including the headers
/// it keeps alongside payloads, so host accounting matches what a kernel
/// heap would see.
pub trait HostHeap: Send + Sync {
    /// Charges `size` bytes against the host heap.
    fn charge(&self, size: usize) -> Result<(), OutOfMemory>;

    /// Returns `size` bytes previously obtained with [`HostHeap::charge`].
    fn uncharge(&self, size: usize);

    /// The number of bytes currently charged.
    fn in_use(&self) -> usize;
}

/// A host heap with no limit beyond the global allocator.
#[derive(Debug, Default)]
pub struct SystemHeap {
    in_use: AtomicUsize,
}

impl SystemHeap {
    /// Creates a new heap with nothing charged.
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostHeap for SystemHeap {
    fn charge(&self, size: usize) -> Result<(), OutOfMemory> {
        self.in_use
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_add(size))
            .map_err(|_| OutOfMemory { size })?;
        Ok(())
    }

    fn uncharge(&self, size: usize) {
        let prev = self.in_use.fetch_sub(size, Ordering::Relaxed);
        debug_assert!(prev >= size, "uncharged more than was charged");
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}

/// Bytes charged to a host heap, returned when dropped.
struct Charge {
    heap: Arc<dyn HostHeap>,
    size: usize,
}

impl Charge {
    fn new(heap: &Arc<dyn HostHeap>, size: usize) -> Result<Self, OutOfMemory> {
        heap.charge(size)?;
        Ok(Self {
            heap: heap.clone(),
            size,
        })
    }
}

impl Drop for Charge {
    fn drop(&mut self) {
        self.heap.uncharge(self.size);
    }
}

/// A byte buffer whose storage, plus `overhead` header bytes, is charged to
/// a host heap for as long as the buffer lives.
///
/// The buffer is zero-filled when allocated.
pub struct HeapBuf {
    data: Box<[u8]>,
    charge: Charge,
}

impl HeapBuf {
    /// Allocates `len` bytes, charging `len + overhead` to `heap`.
    pub fn new(heap: &Arc<dyn HostHeap>, len: usize, overhead: usize) -> Result<Self, OutOfMemory> {
        let size = len
            .checked_add(overhead)
            .ok_or(OutOfMemory { size: usize::MAX })?;
        let charge = Charge::new(heap, size)?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| OutOfMemory { size })?;
        data.resize(len, 0);
        Ok(Self {
            data: data.into_boxed_slice(),
            charge,
        })
    }

    /// The number of bytes charged to the host heap for this buffer.
    pub fn charged(&self) -> usize {
        self.charge.size
    }
}

impl Deref for HeapBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for HeapBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl std::fmt::Debug for HeapBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapBuf")
            .field("len", &self.data.len())
            .field("charged", &self.charge.size)
            .finish()
    }
}

/// A boxed value whose size is charged to a host heap, used for control
/// blocks the host would otherwise allocate itself.
pub struct HeapBox<T> {
    value: Box<T>,
    charge: Charge,
}

impl<T> HeapBox<T> {
    /// Moves `value` to the heap, charging `size_of::<T>()` bytes.
    pub fn new(heap: &Arc<dyn HostHeap>, value: T) -> Result<Self, OutOfMemory> {
        let charge = Charge::new(heap, size_of::<T>())?;
        Ok(Self {
            value: Box::new(value),
            charge,
        })
    }

    /// Returns the value, releasing the charge.
    pub fn into_inner(this: Self) -> T {
        let Self { value, charge } = this;
        drop(charge);
        *value
    }
}

impl<T> Deref for HeapBox<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for HeapBox<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for HeapBox<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.value.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Limited {
        inner: SystemHeap,
        limit: usize,
    }

    impl HostHeap for Limited {
        fn charge(&self, size: usize) -> Result<(), OutOfMemory> {
            if self.inner.in_use() + size > self.limit {
                return Err(OutOfMemory { size });
            }
            self.inner.charge(size)
        }

        fn uncharge(&self, size: usize) {
            self.inner.uncharge(size)
        }

        fn in_use(&self) -> usize {
            self.inner.in_use()
        }
    }

    #[test]
    fn buffers_return_their_charge() {
        let heap: Arc<dyn HostHeap> = Arc::new(SystemHeap::new());
        let buf = HeapBuf::new(&heap, 32, 16).unwrap();
        assert_eq!(buf.len(), 32);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(heap.in_use(), 48);

        let boxed = HeapBox::new(&heap, 7u64).unwrap();
        assert_eq!(heap.in_use(), 56);
        assert_eq!(HeapBox::into_inner(boxed), 7);
        assert_eq!(heap.in_use(), 48);

        drop(buf);
        assert_eq!(heap.in_use(), 0);
    }

    #[test]
    fn exhaustion_is_reported() {
        let heap: Arc<dyn HostHeap> = Arc::new(Limited {
            inner: SystemHeap::new(),
            limit: 64,
        });
        let _a = HeapBuf::new(&heap, 40, 8).unwrap();
        let err = HeapBuf::new(&heap, 16, 8).unwrap_err();
        assert_eq!(err, OutOfMemory { size: 24 });
        assert_eq!(heap.in_use(), 48);
    }
}
