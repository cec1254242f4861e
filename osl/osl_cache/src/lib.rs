// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Fixed-size object caches for the interpreter engine.
//!
//! A cache hands out zeroed buffers of one size and keeps up to `max_depth`
//! released buffers on a free list for reuse. Reuse is LIFO: the most
//! recently released object is the next one acquired.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use osl_host::HeapBox;
use osl_host::HeapBuf;
use osl_host::HostHeap;
use osl_host::InterruptControl;
use osl_host::OutOfMemory;
use osl_sync::SpinLock;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

/// Tag held by every live cache.
pub const CACHE_MAGIC: u32 = u32::from_be_bytes(*b"cach");

/// Longest cache name retained, in bytes.
pub const CACHE_NAME_LEN: usize = 15;

/// Slack allowed when walking a free list that may be corrupt.
const VALIDATE_SLACK: usize = 10;

/// Per-object overhead charged to the host for the free list link.
const LINK_SIZE: usize = size_of::<usize>();

/// Errors returned by [`ObjectCache`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Caches of zero-sized objects are not supported.
    #[error("cache object size must be nonzero")]
    ZeroObjectSize,
    /// The host heap could not satisfy the request.
    #[error("cache allocation failed")]
    OutOfMemory(#[source] OutOfMemory),
    /// The cache has been deleted.
    #[error("cache {name} has been deleted")]
    Deleted {
        /// Cache name.
        name: String,
    },
    /// The released object does not belong to a cache of this object size.
    #[error("object of {len} bytes released to cache {name} of {object_size}-byte objects")]
    WrongSize {
        /// Cache name.
        name: String,
        /// Length of the released object.
        len: usize,
        /// Object size of the cache.
        object_size: usize,
    },
    /// The free list does not hold the number of objects the cache recorded.
    #[error("cache {name} free list holds {counted} objects, expected {recorded}")]
    DepthMismatch {
        /// Cache name.
        name: String,
        /// Objects found on the free list, bounded by `max_depth + 10`.
        counted: usize,
        /// Recorded depth.
        recorded: usize,
    },
}

impl From<OutOfMemory> for CacheError {
    fn from(err: OutOfMemory) -> Self {
        Self::OutOfMemory(err)
    }
}

/// An object acquired from an [`ObjectCache`].
///
/// Dropping the object instead of releasing it returns its memory to the
/// host heap.
#[derive(Debug)]
pub struct CacheObject {
    buf: HeapBuf,
}

impl Deref for CacheObject {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl DerefMut for CacheObject {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Usage counters for a cache.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CacheStatistics {
    /// Number of acquire requests.
    pub requests: u64,
    /// Number of requests satisfied from the free list.
    pub hits: u64,
    /// Objects currently on the free list.
    pub current_depth: usize,
    /// Maximum objects kept on the free list.
    pub max_depth: usize,
    /// Size of each object.
    pub object_size: usize,
}

impl CacheStatistics {
    /// Percentage of requests served from the free list.
    pub fn hit_percent(&self) -> u64 {
        if self.requests == 0 {
            0
        } else {
            self.hits * 100 / self.requests
        }
    }
}

#[derive(Debug)]
struct CacheState {
    free: Vec<CacheObject>,
    current_depth: usize,
    requests: u64,
    hits: u64,
}

/// A cache of fixed-size, zero-initialized objects.
pub struct ObjectCache {
    magic: AtomicU32,
    name: String,
    object_size: usize,
    max_depth: usize,
    heap: Arc<dyn HostHeap>,
    state: SpinLock<CacheState>,
}

impl ObjectCache {
    /// Creates a cache of `object_size`-byte objects that retains at most
    /// `max_depth` released objects. `name` is truncated to
    /// [`CACHE_NAME_LEN`] bytes.
    ///
    /// The cache control block itself is charged to `heap`.
    pub fn create(
        heap: &Arc<dyn HostHeap>,
        interrupts: Arc<dyn InterruptControl>,
        name: &str,
        object_size: usize,
        max_depth: usize,
    ) -> Result<HeapBox<Self>, CacheError> {
        if object_size == 0 {
            return Err(CacheError::ZeroObjectSize);
        }
        let cache = Self {
            magic: AtomicU32::new(CACHE_MAGIC),
            name: truncate_name(name).to_owned(),
            object_size,
            max_depth,
            heap: heap.clone(),
            state: SpinLock::new(
                interrupts,
                CacheState {
                    free: Vec::new(),
                    current_depth: 0,
                    requests: 0,
                    hits: 0,
                },
            ),
        };
        let cache = HeapBox::new(heap, cache)?;
        tracing::debug!(name = %cache.name, object_size, max_depth, "cache created");
        Ok(cache)
    }

    /// The cache name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The size of each object.
    pub fn object_size(&self) -> usize {
        self.object_size
    }

    /// Whether the cache has not been deleted.
    pub fn is_live(&self) -> bool {
        self.magic.load(Ordering::Acquire) == CACHE_MAGIC
    }

    fn deleted(&self) -> CacheError {
        CacheError::Deleted {
            name: self.name.clone(),
        }
    }

    /// Returns a zeroed object, reusing the most recently released one if
    /// any.
    pub fn acquire(&self) -> Result<CacheObject, CacheError> {
        if !self.is_live() {
            return Err(self.deleted());
        }

        let reused = {
            let mut state = self.state.lock();
            state.requests += 1;
            let object = state.free.pop();
            if object.is_some() {
                state.current_depth -= 1;
                state.hits += 1;
            }
            object
        };

        match reused {
            Some(mut object) => {
                object.fill(0);
                tracing::trace!(name = %self.name, "cache hit");
                Ok(object)
            }
            None => {
                let buf = HeapBuf::new(&self.heap, self.object_size, LINK_SIZE)?;
                tracing::trace!(name = %self.name, "cache miss");
                Ok(CacheObject { buf })
            }
        }
    }

    /// Returns an object to the cache.
    ///
    /// When the free list is already full, or the cache has been deleted,
    /// the object is freed to the host heap instead.
    pub fn release(&self, object: CacheObject) -> Result<(), CacheError> {
        if !self.is_live() {
            tracing::warn!(name = %self.name, "release to deleted cache");
            drop(object);
            return Err(self.deleted());
        }
        if object.len() != self.object_size {
            return Err(CacheError::WrongSize {
                name: self.name.clone(),
                len: object.len(),
                object_size: self.object_size,
            });
        }

        let evicted = {
            let mut state = self.state.lock();
            if state.current_depth >= self.max_depth {
                Some(object)
            } else {
                state.free.push(object);
                state.current_depth += 1;
                None
            }
        };
        // Freed outside the lock.
        drop(evicted);
        Ok(())
    }

    /// Frees every object on the free list. Returns the number freed.
    pub fn purge(&self) -> usize {
        let freed = {
            let mut state = self.state.lock();
            state.current_depth = 0;
            std::mem::take(&mut state.free)
        };
        let count = freed.len();
        drop(freed);
        tracing::trace!(name = %self.name, count, "cache purged");
        count
    }

    /// Invalidates the cache and frees its free list. Later acquires fail.
    pub fn delete(&self) -> Result<(), CacheError> {
        if self
            .magic
            .compare_exchange(CACHE_MAGIC, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(self.deleted());
        }
        self.purge();
        let stats = self.statistics();
        tracing::debug!(
            name = %self.name,
            requests = stats.requests,
            hits = stats.hits,
            hit_percent = stats.hit_percent(),
            "cache deleted"
        );
        Ok(())
    }

    /// Checks that the free list holds exactly the recorded number of
    /// objects, each of the cache's object size.
    pub fn validate(&self) -> Result<(), CacheError> {
        let state = self.state.lock();
        let bound = self.max_depth.saturating_add(VALIDATE_SLACK);
        let counted = state
            .free
            .iter()
            .take(bound)
            .filter(|object| object.len() == self.object_size)
            .count();
        if counted != state.current_depth {
            let recorded = state.current_depth;
            drop(state);
            tracing::warn!(name = %self.name, counted, recorded, "cache corrupt");
            return Err(CacheError::DepthMismatch {
                name: self.name.clone(),
                counted,
                recorded,
            });
        }
        Ok(())
    }

    /// Returns the cache counters.
    pub fn statistics(&self) -> CacheStatistics {
        let state = self.state.lock();
        CacheStatistics {
            requests: state.requests,
            hits: state.hits,
            current_depth: state.current_depth,
            max_depth: self.max_depth,
            object_size: self.object_size,
        }
    }
}

impl std::fmt::Debug for ObjectCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("name", &self.name)
            .field("object_size", &self.object_size)
            .field("max_depth", &self.max_depth)
            .field("live", &self.is_live())
            .finish()
    }
}

fn truncate_name(name: &str) -> &str {
    let mut end = name.len().min(CACHE_NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    &name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;
    use osl_test_host::TestHost;
    use osl_test_host::test;

    fn cache(
        name: &str,
        object_size: usize,
        max_depth: usize,
    ) -> (Arc<TestHost>, HeapBox<ObjectCache>) {
        let host = TestHost::new();
        let heap: Arc<dyn HostHeap> = host.clone();
        let cache = ObjectCache::create(&heap, host.clone(), name, object_size, max_depth).unwrap();
        (host, cache)
    }

    #[test]
    fn zero_object_size_is_refused() {
        let host = TestHost::new();
        let heap: Arc<dyn HostHeap> = host.clone();
        assert_eq!(
            ObjectCache::create(&heap, host.clone(), "Acpi-Empty", 0, 4).unwrap_err(),
            CacheError::ZeroObjectSize
        );
    }

    #[test]
    fn control_block_exhaustion() {
        let host = TestHost::new();
        host.set_heap_limit(8);
        let heap: Arc<dyn HostHeap> = host.clone();
        assert!(matches!(
            ObjectCache::create(&heap, host.clone(), "Acpi-Operand", 72, 4),
            Err(CacheError::OutOfMemory(_))
        ));
        assert_eq!(host.in_use(), 0);
    }

    #[test]
    fn name_is_truncated() {
        let (_host, cache) = cache("Acpi-Namespace-Objects", 16, 4);
        assert_eq!(cache.name(), "Acpi-Namespace-");
        assert_eq!(truncate_name("ééééééééé"), "ééééééé");
    }

    #[test]
    fn reuse_is_lifo_and_zeroed() {
        let (_host, cache) = cache("Acpi-Parse", 32, 4);
        let mut a = cache.acquire().unwrap();
        let mut b = cache.acquire().unwrap();
        a.fill(0xaa);
        b.fill(0xbb);
        let a_ptr = a.as_ptr();
        let b_ptr = b.as_ptr();
        cache.release(a).unwrap();
        cache.release(b).unwrap();

        // The last released object comes back first, scrubbed.
        let first = cache.acquire().unwrap();
        assert_eq!(first.as_ptr(), b_ptr);
        assert!(first.iter().all(|&x| x == 0));
        let second = cache.acquire().unwrap();
        assert_eq!(second.as_ptr(), a_ptr);
        assert!(second.iter().all(|&x| x == 0));

        let stats = cache.statistics();
        assert_eq!(stats.requests, 4);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.current_depth, 0);
    }

    #[test]
    fn depth_is_capped() {
        let (host, cache) = cache("Acpi-State", 24, 2);
        let objects: Vec<_> = (0..4).map(|_| cache.acquire().unwrap()).collect();
        let per_object = 24 + LINK_SIZE;
        let base = host.in_use() - 4 * per_object;

        for object in objects {
            cache.release(object).unwrap();
        }
        assert_eq!(cache.statistics().current_depth, 2);
        assert_eq!(host.in_use(), base + 2 * per_object);
        cache.validate().unwrap();

        assert_eq!(cache.purge(), 2);
        assert_eq!(cache.statistics().current_depth, 0);
        assert_eq!(host.in_use(), base);
    }

    #[test]
    fn exhaustion_on_miss() {
        let (host, cache) = cache("Acpi-Operand", 64, 4);
        host.set_heap_limit(host.in_use() + 10);
        assert!(matches!(cache.acquire(), Err(CacheError::OutOfMemory(_))));
        assert_eq!(cache.statistics().requests, 1);
    }

    #[test]
    fn wrong_size_release() {
        let (_host, small) = cache("Acpi-Small", 8, 4);
        let (_host2, large) = cache("Acpi-Large", 16, 4);
        let object = large.acquire().unwrap();
        assert!(matches!(
            small.release(object),
            Err(CacheError::WrongSize { len: 16, .. })
        ));
    }

    #[test]
    fn deleted_cache() {
        let (host, cache) = cache("Acpi-Deleted", 16, 4);
        let kept = cache.acquire().unwrap();
        let parked = cache.acquire().unwrap();
        cache.release(parked).unwrap();

        cache.delete().unwrap();
        assert!(!cache.is_live());
        assert_eq!(cache.statistics().current_depth, 0);
        assert!(matches!(cache.acquire(), Err(CacheError::Deleted { .. })));
        assert!(matches!(cache.delete(), Err(CacheError::Deleted { .. })));

        // The straggler is freed, not cached.
        let before = host.in_use();
        assert!(matches!(
            cache.release(kept),
            Err(CacheError::Deleted { .. })
        ));
        assert_eq!(host.in_use(), before - 16 - LINK_SIZE);
    }

    #[test]
    fn validate_detects_corruption() {
        let (_host, cache) = cache("Acpi-Validate", 16, 3);
        let a = cache.acquire().unwrap();
        cache.release(a).unwrap();
        cache.validate().unwrap();

        cache.state.lock().current_depth = 2;
        assert_eq!(
            cache.validate().unwrap_err(),
            CacheError::DepthMismatch {
                name: "Acpi-Validate".into(),
                counted: 1,
                recorded: 2,
            }
        );
    }

    #[test]
    fn lock_disables_interrupts() {
        let (host, cache) = cache("Acpi-Irq", 16, 3);
        let before = host.interrupt_disable_calls();
        let a = cache.acquire().unwrap();
        cache.release(a).unwrap();
        assert!(host.interrupt_disable_calls() > before);
        assert!(host.are_enabled());
    }

    #[test]
    fn concurrent_use() {
        let (host, cache) = cache("Acpi-Shared", 16, 8);
        let cache = Arc::new(cache);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let object = cache.acquire().unwrap();
                        assert!(object.iter().all(|&x| x == 0));
                        cache.release(object).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        cache.validate().unwrap();
        let stats = cache.statistics();
        assert_eq!(stats.requests, 400);
        assert!(stats.current_depth <= 8);
        drop(cache);
        assert_eq!(host.in_use(), 0);
    }
}
