// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A simulated host kernel for testing the OS services layer.
//!
//! [`TestHost`] implements every trait in [`osl_host`] in memory: a heap with
//! an adjustable budget, per-thread interrupt state, a type 1 PCI host bridge
//! behind ports 0xCF8/0xCFC, sparse physical memory with fake kernel
//! mappings, and a platform that captures console and log output.

#![forbid(unsafe_code)]

use osl_host::AccessWidth;
use osl_host::EfiConfigTable;
use osl_host::HostHeap;
use osl_host::HostMapping;
use osl_host::HostServices;
use osl_host::InterruptControl;
use osl_host::InterruptState;
use osl_host::MapError;
use osl_host::OutOfMemory;
use osl_host::PciBootInfo;
use osl_host::PhysicalMemory;
use osl_host::Platform;
use osl_host::PortIo;
use parking_lot::Mutex;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

pub use osl_test_host_macro::test;

// Lets the `test` macro name this crate from its own tests.
#[cfg(test)]
extern crate self as osl_test_host;

/// Initializes `tracing` output for tests. Safe to call from every test.
pub fn init_tracing() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = if let Ok(var) = std::env::var("RUST_LOG") {
            var.parse().unwrap()
        } else {
            Targets::new().with_default(LevelFilter::DEBUG)
        };
        tracing_subscriber::fmt()
            .with_ansi(false)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .finish()
            .with(targets)
            .init();
    });
}

const PCI_CONFIG_ADDRESS: u16 = 0xcf8;
const PCI_CONFIG_DATA: u16 = 0xcfc;
const MAPPING_BASE: u64 = 0xffff_8000_0000_0000;
const PAGE_SIZE: u64 = 4096;

thread_local! {
    static INTERRUPTS_ENABLED: Cell<bool> = const { Cell::new(true) };
    static THREAD_ID: u64 = NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed);
}

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

/// A port access observed by the simulated host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PortAccess {
    /// A read of `width` from `port`.
    Read {
        /// Port number.
        port: u16,
        /// Access width.
        width: AccessWidth,
    },
    /// A write of `value` with `width` to `port`.
    Write {
        /// Port number.
        port: u16,
        /// Access width.
        width: AccessWidth,
        /// Value written.
        value: u32,
    },
}

#[derive(Default)]
struct PortState {
    address: u32,
    config: BTreeMap<(u8, u8, u8), Box<[u8; 256]>>,
    registers: HashMap<u16, u32>,
    log: Vec<PortAccess>,
}

impl PortState {
    // Returns the config space byte selected by the current address register
    // plus `lane`, if the address is enabled and a function is present.
    fn config_byte(&mut self, lane: u16) -> Option<&mut u8> {
        if self.address & 0x8000_0000 == 0 {
            return None;
        }
        let bus = (self.address >> 16) as u8;
        let device = ((self.address >> 11) & 0x1f) as u8;
        let function = ((self.address >> 8) & 0x7) as u8;
        let register = (self.address & 0xfc) as usize + lane as usize;
        self.config
            .get_mut(&(bus, device, function))
            .map(|space| &mut space[register])
    }

    fn read(&mut self, port: u16, width: AccessWidth) -> u32 {
        self.log.push(PortAccess::Read { port, width });
        if (PCI_CONFIG_DATA..PCI_CONFIG_DATA + 4).contains(&port) {
            let lane = port - PCI_CONFIG_DATA;
            let mut value = 0;
            for i in 0..width.bytes() as u16 {
                let byte = self.config_byte(lane + i).map_or(0xff, |b| *b);
                value |= u32::from(byte) << (8 * i);
            }
            value
        } else if port == PCI_CONFIG_ADDRESS {
            self.address
        } else {
            self.registers.get(&port).copied().unwrap_or(!0) & width.mask() as u32
        }
    }

    fn write(&mut self, port: u16, width: AccessWidth, value: u32) {
        self.log.push(PortAccess::Write { port, width, value });
        if (PCI_CONFIG_DATA..PCI_CONFIG_DATA + 4).contains(&port) {
            let lane = port - PCI_CONFIG_DATA;
            for i in 0..width.bytes() as u16 {
                if let Some(byte) = self.config_byte(lane + i) {
                    *byte = (value >> (8 * i)) as u8;
                }
            }
        } else if port == PCI_CONFIG_ADDRESS && width == AccessWidth::Bits32 {
            self.address = value;
        } else {
            self.registers.insert(port, value & width.mask() as u32);
        }
    }
}

#[derive(Default)]
struct PhysicalState {
    memory: BTreeMap<u64, u8>,
    mappings: HashMap<u64, (u64, usize)>,
    next_mapping: u64,
    fail_maps: bool,
    accesses: usize,
}

impl PhysicalState {
    fn load(&self, address: u64, len: usize) -> u64 {
        let mut value = 0;
        for i in 0..len as u64 {
            let byte = self.memory.get(&(address + i)).copied().unwrap_or(0);
            value |= u64::from(byte) << (8 * i);
        }
        value
    }

    fn store(&mut self, address: u64, len: usize, value: u64) {
        for i in 0..len as u64 {
            self.memory.insert(address + i, (value >> (8 * i)) as u8);
        }
    }
}

#[derive(Default)]
struct PlatformState {
    boot_args: String,
    acpi20: Option<u64>,
    acpi10: Option<u64>,
    pci_boot_info: Option<PciBootInfo>,
    console: Vec<String>,
    log: Vec<String>,
}

/// The simulated host kernel.
pub struct TestHost {
    in_use: AtomicUsize,
    heap_limit: AtomicUsize,
    failed_allocations: AtomicUsize,
    disable_calls: AtomicUsize,
    sleep_calls: AtomicUsize,
    at_interrupt: AtomicBool,
    ports: Mutex<PortState>,
    physical: Arc<Mutex<PhysicalState>>,
    platform: Mutex<PlatformState>,
    boot_time: Instant,
}

impl TestHost {
    /// Creates a host with an unlimited heap, no PCI functions and empty
    /// physical memory.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            in_use: AtomicUsize::new(0),
            heap_limit: AtomicUsize::new(usize::MAX),
            failed_allocations: AtomicUsize::new(0),
            disable_calls: AtomicUsize::new(0),
            sleep_calls: AtomicUsize::new(0),
            at_interrupt: AtomicBool::new(false),
            ports: Default::default(),
            physical: Arc::new(Mutex::new(PhysicalState {
                next_mapping: MAPPING_BASE,
                ..Default::default()
            })),
            platform: Default::default(),
            boot_time: Instant::now(),
        })
    }

    /// Returns the trait objects for this host.
    pub fn services(self: &Arc<Self>) -> HostServices {
        HostServices {
            heap: self.clone(),
            interrupts: self.clone(),
            ports: self.clone(),
            physical: self.clone(),
            platform: self.clone(),
        }
    }

    /// Caps the heap at `limit` bytes in use.
    pub fn set_heap_limit(&self, limit: usize) {
        self.heap_limit.store(limit, Ordering::SeqCst);
    }

    /// Removes any heap cap.
    pub fn clear_heap_limit(&self) {
        self.set_heap_limit(usize::MAX);
    }

    /// The number of heap requests refused so far.
    pub fn failed_allocations(&self) -> usize {
        self.failed_allocations.load(Ordering::SeqCst)
    }

    /// The number of times interrupts were disabled, on any thread.
    pub fn interrupt_disable_calls(&self) -> usize {
        self.disable_calls.load(Ordering::SeqCst)
    }

    /// The number of [`Platform::sleep`] calls so far.
    pub fn sleep_calls(&self) -> usize {
        self.sleep_calls.load(Ordering::SeqCst)
    }

    /// Marks every caller as running in interrupt context, or not.
    pub fn set_interrupt_context(&self, at_interrupt: bool) {
        self.at_interrupt.store(at_interrupt, Ordering::SeqCst);
    }

    /// Adds a PCI function whose 256-byte config space initially holds
    /// `config`.
    pub fn add_pci_function(&self, bus: u8, device: u8, function: u8, config: [u8; 256]) {
        self.ports
            .lock()
            .config
            .insert((bus, device, function), Box::new(config));
    }

    /// Returns the config space byte at `register` of a legacy PCI function.
    pub fn pci_config_byte(&self, bus: u8, device: u8, function: u8, register: u8) -> Option<u8> {
        self.ports
            .lock()
            .config
            .get(&(bus, device, function))
            .map(|space| space[register as usize])
    }

    /// All port accesses performed so far.
    pub fn port_log(&self) -> Vec<PortAccess> {
        self.ports.lock().log.clone()
    }

    /// Stores `bytes` at physical `address`.
    pub fn write_physical(&self, address: u64, bytes: &[u8]) {
        let mut state = self.physical.lock();
        for (i, b) in bytes.iter().enumerate() {
            state.memory.insert(address + i as u64, *b);
        }
    }

    /// Loads `len` bytes from physical `address`.
    pub fn read_physical(&self, address: u64, len: usize) -> Vec<u8> {
        let state = self.physical.lock();
        (0..len as u64)
            .map(|i| state.memory.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    /// The number of single loads and stores of physical memory performed
    /// through [`PhysicalMemory::read`] and [`PhysicalMemory::write`].
    pub fn physical_accesses(&self) -> usize {
        self.physical.lock().accesses
    }

    /// Makes every later map request fail.
    pub fn fail_maps(&self, fail: bool) {
        self.physical.lock().fail_maps = fail;
    }

    /// The number of host mappings currently alive.
    pub fn live_mappings(&self) -> usize {
        self.physical.lock().mappings.len()
    }

    /// Sets the kernel boot argument string.
    pub fn set_boot_args(&self, args: &str) {
        self.platform.lock().boot_args = args.to_owned();
    }

    /// Publishes an EFI configuration table.
    pub fn set_efi_config_table(&self, table: EfiConfigTable, address: u64) {
        let mut state = self.platform.lock();
        match table {
            EfiConfigTable::Acpi20 => state.acpi20 = Some(address),
            EfiConfigTable::Acpi10 => state.acpi10 = Some(address),
        }
    }

    /// Sets the ECAM window reported by the boot loader.
    pub fn set_pci_boot_info(&self, info: PciBootInfo) {
        self.platform.lock().pci_boot_info = Some(info);
    }

    /// Messages written to the console backend.
    pub fn console_output(&self) -> Vec<String> {
        self.platform.lock().console.clone()
    }

    /// Messages written to the structured log backend.
    pub fn log_output(&self) -> Vec<String> {
        self.platform.lock().log.clone()
    }
}

impl HostHeap for TestHost {
    fn charge(&self, size: usize) -> Result<(), OutOfMemory> {
        let limit = self.heap_limit.load(Ordering::SeqCst);
        self.in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                n.checked_add(size).filter(|&total| total <= limit)
            })
            .map_err(|_| {
                self.failed_allocations.fetch_add(1, Ordering::SeqCst);
                OutOfMemory { size }
            })?;
        Ok(())
    }

    fn uncharge(&self, size: usize) {
        let prev = self.in_use.fetch_sub(size, Ordering::SeqCst);
        assert!(prev >= size, "heap underflow: {prev} < {size}");
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }
}

impl InterruptControl for TestHost {
    fn disable(&self) -> InterruptState {
        self.disable_calls.fetch_add(1, Ordering::SeqCst);
        InterruptState::new(INTERRUPTS_ENABLED.with(|e| e.replace(false)))
    }

    fn restore(&self, state: InterruptState) {
        INTERRUPTS_ENABLED.with(|e| e.set(state.was_enabled()));
    }

    fn are_enabled(&self) -> bool {
        INTERRUPTS_ENABLED.with(|e| e.get())
    }
}

impl PortIo for TestHost {
    fn read_u8(&self, port: u16) -> u8 {
        self.ports.lock().read(port, AccessWidth::Bits8) as u8
    }

    fn read_u16(&self, port: u16) -> u16 {
        self.ports.lock().read(port, AccessWidth::Bits16) as u16
    }

    fn read_u32(&self, port: u16) -> u32 {
        self.ports.lock().read(port, AccessWidth::Bits32)
    }

    fn write_u8(&self, port: u16, value: u8) {
        self.ports
            .lock()
            .write(port, AccessWidth::Bits8, value.into())
    }

    fn write_u16(&self, port: u16, value: u16) {
        self.ports
            .lock()
            .write(port, AccessWidth::Bits16, value.into())
    }

    fn write_u32(&self, port: u16, value: u32) {
        self.ports.lock().write(port, AccessWidth::Bits32, value)
    }
}

struct TestMapping {
    state: Arc<Mutex<PhysicalState>>,
    virtual_address: u64,
    length: usize,
}

impl HostMapping for TestMapping {
    fn virtual_address(&self) -> u64 {
        self.virtual_address
    }

    fn length(&self) -> usize {
        self.length
    }
}

impl Drop for TestMapping {
    fn drop(&mut self) {
        let removed = self.state.lock().mappings.remove(&self.virtual_address);
        assert!(removed.is_some(), "mapping released twice");
    }
}

impl PhysicalMemory for TestHost {
    fn map(&self, address: u64, length: usize) -> Result<Box<dyn HostMapping>, MapError> {
        if length == 0 {
            return Err(MapError::Empty { address });
        }
        let mut state = self.physical.lock();
        if state.fail_maps {
            return Err(MapError::MapFailed { address, length });
        }
        let page_offset = address % PAGE_SIZE;
        let pages = (page_offset + length as u64).div_ceil(PAGE_SIZE);
        let virtual_address = state.next_mapping + page_offset;
        state.next_mapping += pages * PAGE_SIZE;
        state.mappings.insert(virtual_address, (address, length));
        Ok(Box::new(TestMapping {
            state: self.physical.clone(),
            virtual_address,
            length,
        }))
    }

    fn virtual_to_physical(&self, virtual_address: u64) -> Option<u64> {
        let state = self.physical.lock();
        state.mappings.iter().find_map(|(&va, &(pa, len))| {
            (va..va + len as u64)
                .contains(&virtual_address)
                .then(|| pa + (virtual_address - va))
        })
    }

    fn read(&self, address: u64, width: AccessWidth) -> u64 {
        let mut state = self.physical.lock();
        state.accesses += 1;
        state.load(address, width.bytes())
    }

    fn write(&self, address: u64, width: AccessWidth, value: u64) {
        let mut state = self.physical.lock();
        state.accesses += 1;
        state.store(address, width.bytes(), value);
    }

    fn read_bytes(&self, address: u64, buf: &mut [u8]) {
        let state = self.physical.lock();
        for (i, b) in buf.iter_mut().enumerate() {
            *b = state.memory.get(&(address + i as u64)).copied().unwrap_or(0);
        }
    }
}

impl Platform for TestHost {
    fn efi_config_table(&self, table: EfiConfigTable) -> Option<u64> {
        let state = self.platform.lock();
        match table {
            EfiConfigTable::Acpi20 => state.acpi20,
            EfiConfigTable::Acpi10 => state.acpi10,
        }
    }

    fn boot_args(&self) -> String {
        self.platform.lock().boot_args.clone()
    }

    fn pci_boot_info(&self) -> Option<PciBootInfo> {
        self.platform.lock().pci_boot_info
    }

    fn current_thread_id(&self) -> u64 {
        THREAD_ID.with(|id| *id)
    }

    fn uptime(&self) -> Duration {
        self.boot_time.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        self.sleep_calls.fetch_add(1, Ordering::SeqCst);
        std::thread::sleep(duration);
    }

    fn stall(&self, duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {
            std::hint::spin_loop();
        }
    }

    fn at_interrupt_context(&self) -> bool {
        self.at_interrupt.load(Ordering::SeqCst)
    }

    fn console_write(&self, message: &str) {
        self.platform.lock().console.push(message.to_owned());
    }

    fn log_write(&self, message: &str) {
        self.platform.lock().log.push(message.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test;

    #[test]
    fn legacy_config_space_follows_address_register() {
        let host = TestHost::new();
        let mut config = [0u8; 256];
        config[0..4].copy_from_slice(&0x1234_8086u32.to_le_bytes());
        host.add_pci_function(0, 3, 0, config);

        host.write_u32(PCI_CONFIG_ADDRESS, 0x8000_0000 | (3 << 11));
        assert_eq!(host.read_u32(PCI_CONFIG_DATA), 0x1234_8086);
        assert_eq!(host.read_u16(PCI_CONFIG_DATA + 2), 0x1234);
        assert_eq!(host.read_u8(PCI_CONFIG_DATA + 1), 0x80);

        // An absent function floats high.
        host.write_u32(PCI_CONFIG_ADDRESS, 0x8000_0000 | (4 << 11));
        assert_eq!(host.read_u32(PCI_CONFIG_DATA), !0);
    }

    #[test]
    fn mappings_translate_and_release() {
        let host = TestHost::new();
        let mapping = host.map(0x1000_0010, 0x20).unwrap();
        let va = mapping.virtual_address();
        assert_eq!(va % PAGE_SIZE, 0x10);
        assert_eq!(host.virtual_to_physical(va + 4), Some(0x1000_0014));
        assert_eq!(host.live_mappings(), 1);
        drop(mapping);
        assert_eq!(host.live_mappings(), 0);
        assert_eq!(host.virtual_to_physical(va), None);
    }

    #[test]
    fn interrupt_state_is_per_thread() {
        let host = TestHost::new();
        let saved = host.disable();
        assert!(saved.was_enabled());
        assert!(!host.are_enabled());
        let other = host.clone();
        std::thread::spawn(move || assert!(other.are_enabled()))
            .join()
            .unwrap();
        host.restore(saved);
        assert!(host.are_enabled());
    }
}
