// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The OS services layer that binds an ACPI interpreter engine to a host
//! kernel.
//!
//! [`AcpiOs`] is the single context the engine calls into. It owns the
//! tagged allocator, the mapping registry, the deferred execution
//! dispatcher and the PCI config accessor, and hands out locks, semaphores
//! and object caches whose control blocks are charged to the host heap.
//! Every fallible entry point reports failure as an [`AcpiStatus`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod printf;
mod status;
mod tables;

pub use config::AcpiOsConfig;
pub use config::LogFlags;
pub use config::LOG_BOOT_OPTION;
pub use osl_alloc::AllocationHandle;
pub use osl_cache::CacheObject;
pub use osl_cache::CacheStatistics;
pub use osl_exec::ExecuteType;
pub use osl_pci::PciId;
pub use printf::MAX_MESSAGE_LEN;
pub use status::AcpiStatus;
pub use tables::CatalogEntry;
pub use tables::TableCatalog;

use acpi_table_spec::mcfg::parse_mcfg;
use acpi_table_spec::Header;
use osl_alloc::TaggedAllocator;
use osl_cache::ObjectCache;
use osl_exec::Dispatcher;
use osl_host::AccessWidth;
use osl_host::HeapBox;
use osl_host::HostServices;
use osl_mmap::MappingRegistry;
use osl_pci::PciConfigAccess;
use osl_sync::Semaphore;
use osl_sync::SpinLock;
use osl_sync::SpinLockGuard;
use osl_sync::Timeout;
use parking_lot::Mutex;
use printf::LogSink;
use std::sync::Arc;
use std::time::Duration;

/// A spin lock handed to the engine.
pub type AcpiLock = Arc<HeapBox<SpinLock<()>>>;

/// A counting semaphore handed to the engine.
pub type AcpiSemaphore = Arc<HeapBox<Semaphore>>;

/// An object cache handed to the engine.
pub type AcpiCache = Arc<HeapBox<ObjectCache>>;

/// Proof that an [`AcpiLock`] is held. Dropping it, or passing it to
/// [`AcpiOs::release_lock`], releases the lock and restores interrupts.
#[must_use]
pub struct LockToken<'a> {
    _guard: SpinLockGuard<'a, ()>,
}

/// Details of an AML `Fatal` operator.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FatalInfo {
    /// Fatal type.
    pub kind: u32,
    /// Fatal code.
    pub code: u32,
    /// Fatal argument.
    pub argument: u32,
}

/// A signal raised by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AcpiSignal<'a> {
    /// An AML `BreakPoint` operator, with an optional message.
    Breakpoint(Option<&'a str>),
    /// An AML `Fatal` operator.
    Fatal(Option<FatalInfo>),
    /// A signal function this layer does not know.
    Unknown(u32),
}

/// Formats a message to the engine log backends of an [`AcpiOs`].
#[macro_export]
macro_rules! acpi_os_printf {
    ($os:expr, $($arg:tt)*) => {
        $os.printf(format_args!($($arg)*))
    };
}

/// The OS services context.
pub struct AcpiOs {
    host: HostServices,
    log: LogSink,
    allocator: Mutex<TaggedAllocator>,
    mappings: MappingRegistry,
    dispatcher: Dispatcher,
    pci: PciConfigAccess,
}

impl AcpiOs {
    /// Brings up the OS layer on `host`.
    ///
    /// Boot options found in the host's boot arguments override `config`.
    pub fn initialize(host: HostServices, mut config: AcpiOsConfig) -> Result<Self, AcpiStatus> {
        config.apply_boot_args(&host.platform.boot_args());
        let pci_boot_info = config
            .pci_boot_info
            .or_else(|| host.platform.pci_boot_info());

        let dispatcher = Dispatcher::new(
            host.heap.clone(),
            host.interrupts.clone(),
            host.platform.clone(),
            config.dispatcher,
        )
        .map_err(|err| {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                "failed to start deferred work dispatcher"
            );
            AcpiStatus::from(err)
        })?;

        let os = Self {
            log: LogSink::new(config.log_flags, host.platform.clone()),
            allocator: Mutex::new(TaggedAllocator::new(host.heap.clone())),
            mappings: MappingRegistry::new(host.physical.clone()),
            dispatcher,
            pci: PciConfigAccess::new(
                host.ports.clone(),
                host.physical.clone(),
                host.interrupts.clone(),
                pci_boot_info,
            ),
            host,
        };
        tracing::info!(
            log_flags = u32::from(config.log_flags),
            boot_ecam = pci_boot_info.is_some(),
            "ACPI OS layer initialized"
        );
        Ok(os)
    }

    /// Drains deferred work, stops the worker and releases every mapping
    /// still outstanding.
    pub fn terminate(self) {
        self.wait_events_complete();
        self.dispatcher.shutdown();
        let mappings = self.mappings.clear();
        let leaked = self.allocator.lock().live_allocations();
        if leaked != 0 {
            tracing::warn!(leaked, "engine allocations outstanding at termination");
        }
        tracing::info!(mappings, "ACPI OS layer terminated");
    }

    /// The active log backends.
    pub fn log_flags(&self) -> LogFlags {
        self.log.flags()
    }

    /// Writes formatted engine output to the log backends. Messages longer
    /// than [`MAX_MESSAGE_LEN`] bytes are truncated.
    pub fn printf(&self, args: std::fmt::Arguments<'_>) {
        self.log.write_fmt(args)
    }

    /// Returns the physical address of the RSDP.
    pub fn get_root_pointer(&self) -> Option<u64> {
        let rsdp = tables::find_root_pointer(&*self.host.platform, &*self.host.physical);
        if rsdp.is_none() {
            tracing::warn!("no RSDP found");
            acpi_os_printf!(self, "ACPI: No RSDP found.\n");
        }
        rsdp
    }

    /// Names the firmware tables and picks up the MCFG ECAM windows.
    pub fn catalog_tables<'a>(&self, tables: impl IntoIterator<Item = &'a [u8]>) -> TableCatalog {
        let catalog = TableCatalog::build(tables);
        if let Some(mcfg) = catalog.mcfg() {
            let mut allocations = Vec::new();
            let parsed = parse_mcfg(mcfg, |allocation| allocations.push(*allocation));
            match parsed {
                Ok(_) => self.pci.set_mcfg_regions(&allocations),
                Err(err) => tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "ignoring malformed MCFG"
                ),
            }
        }
        catalog
    }

    /// Never replaces a predefined object.
    pub fn predefined_override(&self, _name: &str) -> Option<String> {
        None
    }

    /// Never replaces a firmware table.
    pub fn table_override(&self, _existing: &Header) -> Option<Box<[u8]>> {
        None
    }

    /// Never relocates a firmware table.
    pub fn physical_table_override(&self, _existing: &Header) -> Option<(u64, u32)> {
        None
    }

    /// Reports an engine signal.
    pub fn signal(&self, signal: AcpiSignal<'_>) -> Result<(), AcpiStatus> {
        match signal {
            AcpiSignal::Breakpoint(Some(message)) => {
                tracing::info!(breakpoint = message, "AML breakpoint");
                acpi_os_printf!(self, "ACPI: received breakpoint signal: {message}\n");
            }
            AcpiSignal::Breakpoint(None) => {
                tracing::info!("AML breakpoint");
                acpi_os_printf!(self, "ACPI: received breakpoint signal\n");
            }
            AcpiSignal::Fatal(Some(FatalInfo {
                kind,
                code,
                argument,
            })) => {
                tracing::error!(kind, code, argument, "AML fatal");
                acpi_os_printf!(
                    self,
                    "ACPI: received AML fatal signal, type: {kind}, code: {code}, arg: {argument}\n"
                );
            }
            AcpiSignal::Fatal(None) => {
                tracing::error!("AML fatal");
                acpi_os_printf!(self, "ACPI: received AML fatal signal\n");
            }
            AcpiSignal::Unknown(function) => {
                tracing::warn!(function, "unknown engine signal");
                acpi_os_printf!(self, "ACPI: unknown signal received ({function})\n");
            }
        }
        Ok(())
    }
}

/// Memory.
impl AcpiOs {
    /// Allocates `size` bytes.
    pub fn allocate(&self, size: usize) -> Result<AllocationHandle, AcpiStatus> {
        Ok(self.allocator.lock().allocate(size)?)
    }

    /// Allocates `size` zeroed bytes.
    pub fn allocate_zeroed(&self, size: usize) -> Result<AllocationHandle, AcpiStatus> {
        Ok(self.allocator.lock().allocate_zeroed(size)?)
    }

    /// Frees an allocation. A handle that does not name a live allocation
    /// is refused.
    pub fn free(&self, handle: AllocationHandle) -> Result<(), AcpiStatus> {
        Ok(self.allocator.lock().free(handle)?)
    }

    /// Runs `f` on the payload of a live allocation.
    pub fn with_allocation<R>(
        &self,
        handle: AllocationHandle,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Option<R> {
        self.allocator.lock().payload_mut(handle).map(f)
    }

    /// Maps `length` bytes of physical memory at `address`.
    pub fn map_memory(&self, address: u64, length: usize) -> Result<u64, AcpiStatus> {
        Ok(self.mappings.map(address, length)?)
    }

    /// Unmaps a range returned by [`AcpiOs::map_memory`]. Unknown ranges
    /// are ignored.
    pub fn unmap_memory(&self, virtual_address: u64, length: usize) {
        self.mappings.unmap(virtual_address, length);
    }

    /// Translates a mapped virtual address to a physical address.
    pub fn get_physical_address(&self, virtual_address: u64) -> Result<u64, AcpiStatus> {
        self.host
            .physical
            .virtual_to_physical(virtual_address)
            .ok_or(AcpiStatus::BAD_ADDRESS)
    }

    /// Whether the engine may read the range. Always true.
    pub fn readable(&self, _virtual_address: u64, _length: usize) -> bool {
        true
    }

    /// Whether the engine may write the range. Always true.
    pub fn writable(&self, _virtual_address: u64, _length: usize) -> bool {
        true
    }

    fn memory_width(&self, bits: u32) -> Result<AccessWidth, AcpiStatus> {
        AccessWidth::from_bits(bits).ok_or_else(|| {
            acpi_os_printf!(self, "ACPI: bad width value\n");
            AcpiStatus::BAD_PARAMETER
        })
    }

    /// Reads `bits` bits of physical memory.
    pub fn read_memory(&self, address: u64, bits: u32) -> Result<u64, AcpiStatus> {
        let width = self.memory_width(bits)?;
        Ok(self.host.physical.read(address, width))
    }

    /// Writes the low `bits` bits of `value` to physical memory.
    pub fn write_memory(&self, address: u64, value: u64, bits: u32) -> Result<(), AcpiStatus> {
        let width = self.memory_width(bits)?;
        self.host
            .physical
            .write(address, width, value & width.mask());
        Ok(())
    }
}

/// Port and PCI I/O.
impl AcpiOs {
    /// Reads `bits` bits from an I/O port.
    pub fn read_port(&self, port: u16, bits: u32) -> Result<u32, AcpiStatus> {
        let ports = &self.host.ports;
        match bits {
            8 => Ok(ports.read_u8(port).into()),
            16 => Ok(ports.read_u16(port).into()),
            32 => Ok(ports.read_u32(port)),
            _ => Err(AcpiStatus::BAD_PARAMETER),
        }
    }

    /// Writes the low `bits` bits of `value` to an I/O port.
    pub fn write_port(&self, port: u16, value: u32, bits: u32) -> Result<(), AcpiStatus> {
        let ports = &self.host.ports;
        match bits {
            8 => ports.write_u8(port, value as u8),
            16 => ports.write_u16(port, value as u16),
            32 => ports.write_u32(port, value),
            _ => return Err(AcpiStatus::BAD_PARAMETER),
        }
        Ok(())
    }

    /// Reads `bits` bits from `register` of a PCI function.
    pub fn read_pci_configuration(
        &self,
        id: PciId,
        register: u32,
        bits: u32,
    ) -> Result<u64, AcpiStatus> {
        let register = u16::try_from(register).map_err(|_| AcpiStatus::BAD_PARAMETER)?;
        Ok(self.pci.read(id, register, bits)?.into())
    }

    /// Writes the low `bits` bits of `value` to `register` of a PCI
    /// function.
    pub fn write_pci_configuration(
        &self,
        id: PciId,
        register: u32,
        value: u64,
        bits: u32,
    ) -> Result<(), AcpiStatus> {
        let register = u16::try_from(register).map_err(|_| AcpiStatus::BAD_PARAMETER)?;
        Ok(self.pci.write(id, register, value as u32, bits)?)
    }
}

/// Time and threads.
impl AcpiOs {
    /// Sleeps for `milliseconds`.
    pub fn sleep(&self, milliseconds: u64) {
        self.host
            .platform
            .sleep(Duration::from_millis(milliseconds))
    }

    /// Busy-waits for `microseconds`.
    pub fn stall(&self, microseconds: u32) {
        self.host
            .platform
            .stall(Duration::from_micros(microseconds.into()))
    }

    /// Time since boot in 100 ns units.
    pub fn get_timer(&self) -> u64 {
        (self.host.platform.uptime().as_nanos() / 100) as u64
    }

    /// The identity of the calling thread.
    pub fn get_thread_id(&self) -> u64 {
        self.host.platform.current_thread_id()
    }

    /// Queues `callback` to run later on the deferred work thread.
    pub fn execute(
        &self,
        kind: ExecuteType,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<(), AcpiStatus> {
        Ok(self.dispatcher.execute(kind, Box::new(callback))?)
    }

    /// Waits, for a bounded time, until all queued callbacks have run.
    pub fn wait_events_complete(&self) {
        if !self.dispatcher.wait_for_idle() {
            acpi_os_printf!(
                self,
                "ACPI: Warning - {} executions still pending after timeout\n",
                self.dispatcher.pending()
            );
        }
    }
}

/// Locks and semaphores.
impl AcpiOs {
    /// Creates a spin lock.
    pub fn create_lock(&self) -> Result<AcpiLock, AcpiStatus> {
        let lock = SpinLock::new(self.host.interrupts.clone(), ());
        Ok(Arc::new(HeapBox::new(&self.host.heap, lock)?))
    }

    /// Drops the caller's reference to a lock.
    pub fn delete_lock(&self, lock: AcpiLock) {
        drop(lock);
    }

    /// Disables interrupts and takes the lock.
    pub fn acquire_lock<'a>(&self, lock: &'a AcpiLock) -> LockToken<'a> {
        LockToken {
            _guard: lock.lock(),
        }
    }

    /// Releases a lock taken with [`AcpiOs::acquire_lock`].
    pub fn release_lock(&self, token: LockToken<'_>) {
        drop(token);
    }

    /// Creates a semaphore holding `initial_units` of at most `max_units`.
    pub fn create_semaphore(
        &self,
        max_units: u32,
        initial_units: u32,
    ) -> Result<AcpiSemaphore, AcpiStatus> {
        let semaphore = Semaphore::new(initial_units, max_units)?;
        Ok(Arc::new(HeapBox::new(&self.host.heap, semaphore)?))
    }

    /// Drops the caller's reference to a semaphore.
    pub fn delete_semaphore(&self, semaphore: AcpiSemaphore) {
        drop(semaphore);
    }

    /// Takes `units` units, waiting at most `timeout` milliseconds, or
    /// forever if `timeout` is 0xFFFF.
    pub fn wait_semaphore(
        &self,
        semaphore: &AcpiSemaphore,
        units: u32,
        timeout: u16,
    ) -> Result<(), AcpiStatus> {
        Ok(semaphore.wait(units, Timeout::from_engine(timeout))?)
    }

    /// Releases units. More than one unit wakes every waiter.
    pub fn signal_semaphore(&self, semaphore: &AcpiSemaphore, units: u32) -> Result<(), AcpiStatus> {
        Ok(semaphore.signal(units)?)
    }
}

/// Object caches.
impl AcpiOs {
    /// Creates an object cache.
    pub fn create_cache(
        &self,
        name: &str,
        object_size: usize,
        max_depth: usize,
    ) -> Result<AcpiCache, AcpiStatus> {
        let cache = ObjectCache::create(
            &self.host.heap,
            self.host.interrupts.clone(),
            name,
            object_size,
            max_depth,
        )?;
        Ok(Arc::new(cache))
    }

    /// Deletes a cache. Objects still held by callers are freed when they
    /// are released.
    pub fn delete_cache(&self, cache: &AcpiCache) -> Result<(), AcpiStatus> {
        cache.delete()?;
        if cfg!(debug_assertions) {
            let stats = cache.statistics();
            acpi_os_printf!(
                self,
                "ACPI: Deleted cache '{}', requests {}, hits {} ({}%)\n",
                cache.name(),
                stats.requests,
                stats.hits,
                stats.hit_percent()
            );
        }
        Ok(())
    }

    /// Frees every object on the cache free list.
    pub fn purge_cache(&self, cache: &AcpiCache) -> Result<(), AcpiStatus> {
        live(cache)?.purge();
        Ok(())
    }

    /// Takes a zeroed object from the cache.
    pub fn acquire_object(&self, cache: &AcpiCache) -> Result<CacheObject, AcpiStatus> {
        Ok(cache.acquire()?)
    }

    /// Returns an object to the cache.
    pub fn release_object(&self, cache: &AcpiCache, object: CacheObject) -> Result<(), AcpiStatus> {
        Ok(cache.release(object)?)
    }

    /// Checks the cache free list against its recorded depth.
    pub fn validate_cache(&self, cache: &AcpiCache) -> Result<(), AcpiStatus> {
        Ok(live(cache)?.validate()?)
    }

    /// Returns the cache counters.
    pub fn get_cache_statistics(&self, cache: &AcpiCache) -> Result<CacheStatistics, AcpiStatus> {
        Ok(live(cache)?.statistics())
    }
}

fn live(cache: &AcpiCache) -> Result<&ObjectCache, AcpiStatus> {
    let cache: &ObjectCache = cache;
    if cache.is_live() {
        Ok(cache)
    } else {
        Err(AcpiStatus::BAD_PARAMETER)
    }
}

impl std::fmt::Debug for AcpiOs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcpiOs")
            .field("host", &self.host)
            .field("log_flags", &self.log.flags())
            .field("mappings", &self.mappings)
            .field("dispatcher", &self.dispatcher)
            .field("pci", &self.pci)
            .finish()
    }
}
