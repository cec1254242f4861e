// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI configuration space access for the interpreter engine.
//!
//! Accesses are routed through a memory-mapped ECAM window when one covers
//! the target bus, and through the legacy 0xCF8/0xCFC port pair otherwise.
//! ECAM windows come from the MCFG table and from the boot loader.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use acpi_table_spec::mcfg::McfgAllocation;
use bitfield_struct::bitfield;
use osl_host::AccessWidth;
use osl_host::InterruptControl;
use osl_host::PciBootInfo;
use osl_host::PhysicalMemory;
use osl_host::PortIo;
use osl_sync::SpinLock;
use std::sync::Arc;
use thiserror::Error;

/// The legacy configuration address port.
pub const CONFIG_ADDRESS_PORT: u16 = 0xcf8;
/// The legacy configuration data port.
pub const CONFIG_DATA_PORT: u16 = 0xcfc;

const MAX_DEVICE: u8 = 31;
const MAX_FUNCTION: u8 = 7;
const MAX_LEGACY_REGISTER: u16 = 0xff;
const MAX_ECAM_REGISTER: u16 = 0xfff;

/// Errors returned by [`PciConfigAccess`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PciError {
    /// The access width is not 8, 16 or 32 bits.
    #[error("unsupported PCI config access width {bits}")]
    BadWidth {
        /// Requested width in bits.
        bits: u32,
    },
    /// The device or function number is out of range.
    #[error("invalid PCI function {0}")]
    BadAddress(PciId),
    /// The register offset is beyond the function's config space.
    #[error("register {register:#x} is beyond config space of {id}")]
    BadRegister {
        /// Target function.
        id: PciId,
        /// Register offset.
        register: u16,
    },
    /// No ECAM window covers the access and the legacy mechanism cannot
    /// express it.
    #[error("no config mechanism can reach register {register:#x} of {id}")]
    NotImplemented {
        /// Target function.
        id: PciId,
        /// Register offset.
        register: u16,
    },
}

/// A PCI function address.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PciId {
    /// Segment group.
    pub segment: u16,
    /// Bus number.
    pub bus: u8,
    /// Device number, 0 to 31.
    pub device: u8,
    /// Function number, 0 to 7.
    pub function: u8,
}

impl PciId {
    /// Creates an address.
    pub const fn new(segment: u16, bus: u8, device: u8, function: u8) -> Self {
        Self {
            segment,
            bus,
            device,
            function,
        }
    }
}

impl std::fmt::Display for PciId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:02x}:{:02x}.{:x}",
            self.segment, self.bus, self.device, self.function
        )
    }
}

/// A memory-mapped configuration window.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EcamRegion {
    /// Address of the config space of bus 0, device 0, function 0 of the
    /// segment, even if bus 0 is outside the window.
    pub base_address: u64,
    /// Segment group.
    pub segment: u16,
    /// First bus decoded by the window.
    pub start_bus: u8,
    /// Last bus decoded by the window.
    pub end_bus: u8,
}

impl EcamRegion {
    /// Builds a window from an MCFG allocation. Returns `None` if the
    /// allocation has no base address or runs past the end of the physical
    /// address space.
    pub fn from_mcfg(allocation: &McfgAllocation) -> Option<Self> {
        let base_address = allocation.base_address.get();
        if base_address == 0 {
            return None;
        }
        Self {
            base_address,
            segment: allocation.segment.get(),
            start_bus: allocation.start_bus,
            end_bus: allocation.end_bus,
        }
        .checked()
    }

    /// Builds a segment 0 window from boot loader data, whose base address
    /// is that of the first bus. Returns `None` if there is no base address
    /// or the window does not fit in the physical address space.
    pub fn from_boot_info(info: &PciBootInfo) -> Option<Self> {
        if info.base_address == 0 {
            return None;
        }
        let base_address = info
            .base_address
            .checked_sub(u64::from(info.start_bus) << 20)?;
        Self {
            base_address,
            segment: 0,
            start_bus: info.start_bus,
            end_bus: info.end_bus,
        }
        .checked()
    }

    // Every bus up to `end_bus` must be addressable.
    fn checked(self) -> Option<Self> {
        let span = (u64::from(self.end_bus) + 1) << 20;
        self.base_address.checked_add(span)?;
        Some(self)
    }

    /// Whether the window decodes accesses to `id`.
    pub fn contains(&self, id: PciId) -> bool {
        id.segment == self.segment && (self.start_bus..=self.end_bus).contains(&id.bus)
    }

    /// The physical address of `register` of `id`, or `None` if it is not
    /// addressable.
    pub fn config_address(&self, id: PciId, register: u16) -> Option<u64> {
        self.base_address
            .checked_add(u64::from(id.bus) << 20)?
            .checked_add(u64::from(id.device) << 15)?
            .checked_add(u64::from(id.function) << 12)?
            .checked_add(u64::from(register))
    }
}

/// The legacy configuration address register at port 0xCF8.
#[rustfmt::skip]
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct AddressRegister {
    /// Dword-aligned register offset.
    #[bits(8)] pub register: u8,
    /// Function number.
    #[bits(3)] pub function: u8,
    /// Device number.
    #[bits(5)] pub device: u8,
    /// Bus number.
    #[bits(8)] pub bus: u8,
    #[bits(7)] reserved: u8,
    /// Config cycles are generated only when set.
    #[bits(1)] pub enabled: bool,
}

impl AddressRegister {
    /// Composes the enabled address of `register` of `id`. The low two
    /// register bits are dropped; they select a byte lane of the data port.
    fn for_register(id: PciId, register: u8) -> Self {
        let mut address = Self::new()
            .with_enabled(true)
            .with_bus(id.bus)
            .with_device(id.device)
            .with_function(id.function)
            .with_register(register);
        address.fixup();
        address
    }

    /// Clears the reserved and hard-wired zero bits.
    fn fixup(&mut self) {
        self.set_register(self.register() & !0b11);
        self.set_reserved(0);
    }
}

/// How one config access is carried out.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConfigRoute {
    /// A load or store at a physical address in an ECAM window.
    Ecam {
        /// Physical address of the register.
        address: u64,
    },
    /// An address write to port 0xCF8 followed by a data port access.
    Legacy {
        /// Value written to the address port.
        address: AddressRegister,
        /// Data port, including the byte lane.
        data_port: u16,
    },
}

/// Routes PCI config accesses to ECAM or the legacy port mechanism.
pub struct PciConfigAccess {
    ports: Arc<dyn PortIo>,
    physical: Arc<dyn PhysicalMemory>,
    boot_region: Option<EcamRegion>,
    mcfg_regions: SpinLock<Vec<EcamRegion>>,
    // Serializes the address/data port pair.
    legacy: SpinLock<()>,
}

impl PciConfigAccess {
    /// Creates an accessor. `boot_info` is the ECAM window reported by the
    /// boot loader, if any.
    pub fn new(
        ports: Arc<dyn PortIo>,
        physical: Arc<dyn PhysicalMemory>,
        interrupts: Arc<dyn InterruptControl>,
        boot_info: Option<PciBootInfo>,
    ) -> Self {
        let boot_region = boot_info.and_then(|info| {
            let region = EcamRegion::from_boot_info(&info);
            match &region {
                Some(region) => tracing::debug!(
                    base_address = region.base_address,
                    start_bus = region.start_bus,
                    end_bus = region.end_bus,
                    "boot loader ECAM window"
                ),
                None => tracing::warn!(
                    base_address = info.base_address,
                    start_bus = info.start_bus,
                    end_bus = info.end_bus,
                    "ignoring unusable boot loader ECAM window"
                ),
            }
            region
        });
        Self {
            ports,
            physical,
            boot_region,
            mcfg_regions: SpinLock::new(interrupts.clone(), Vec::new()),
            legacy: SpinLock::new(interrupts, ()),
        }
    }

    /// Replaces the MCFG-derived windows. They take precedence over the boot
    /// loader window. Allocations without a usable base address are skipped.
    pub fn set_mcfg_regions(&self, allocations: &[McfgAllocation]) {
        let mut regions = Vec::with_capacity(allocations.len());
        for allocation in allocations {
            let segment = allocation.segment.get();
            let base_address = allocation.base_address.get();
            match EcamRegion::from_mcfg(allocation) {
                Some(region) => {
                    tracing::debug!(
                        segment,
                        base_address,
                        start_bus = region.start_bus,
                        end_bus = region.end_bus,
                        "MCFG ECAM window"
                    );
                    regions.push(region);
                }
                None => tracing::warn!(
                    segment,
                    base_address,
                    start_bus = allocation.start_bus,
                    end_bus = allocation.end_bus,
                    "ignoring unusable MCFG allocation"
                ),
            }
        }
        *self.mcfg_regions.lock() = regions;
    }

    /// Picks the mechanism for an access to `register` of `id`.
    pub fn resolve(&self, id: PciId, register: u16) -> Result<ConfigRoute, PciError> {
        if id.device > MAX_DEVICE || id.function > MAX_FUNCTION {
            return Err(PciError::BadAddress(id));
        }

        let region = self
            .mcfg_regions
            .lock()
            .iter()
            .find(|r| r.contains(id))
            .copied()
            .or_else(|| self.boot_region.filter(|r| r.contains(id)));

        if let Some(region) = region {
            if register > MAX_ECAM_REGISTER {
                return Err(PciError::BadRegister { id, register });
            }
            let address = region
                .config_address(id, register)
                .ok_or(PciError::NotImplemented { id, register })?;
            return Ok(ConfigRoute::Ecam { address });
        }

        if id.segment != 0 || register > MAX_LEGACY_REGISTER {
            return Err(PciError::NotImplemented { id, register });
        }
        Ok(ConfigRoute::Legacy {
            address: AddressRegister::for_register(id, register as u8),
            data_port: CONFIG_DATA_PORT,
        })
    }

    /// Reads `bits` bits from `register` of `id`.
    pub fn read(&self, id: PciId, register: u16, bits: u32) -> Result<u32, PciError> {
        let width = config_width(bits)?;
        let value = match self.resolve(id, register)? {
            ConfigRoute::Ecam { address } => self.physical.read(address, width) as u32,
            ConfigRoute::Legacy { address, data_port } => {
                let _guard = self.legacy.lock();
                self.ports.write_u32(CONFIG_ADDRESS_PORT, address.into());
                match width {
                    AccessWidth::Bits8 => self.ports.read_u8(data_port + (register & 3)).into(),
                    AccessWidth::Bits16 => self.ports.read_u16(data_port + (register & 2)).into(),
                    _ => self.ports.read_u32(data_port),
                }
            }
        };
        tracing::trace!(%id, register, bits, value, "config read");
        Ok(value)
    }

    /// Writes the low `bits` bits of `value` to `register` of `id`.
    pub fn write(&self, id: PciId, register: u16, value: u32, bits: u32) -> Result<(), PciError> {
        let width = config_width(bits)?;
        match self.resolve(id, register)? {
            ConfigRoute::Ecam { address } => {
                self.physical
                    .write(address, width, u64::from(value) & width.mask())
            }
            ConfigRoute::Legacy { address, data_port } => {
                let _guard = self.legacy.lock();
                self.ports.write_u32(CONFIG_ADDRESS_PORT, address.into());
                match width {
                    AccessWidth::Bits8 => {
                        self.ports.write_u8(data_port + (register & 3), value as u8)
                    }
                    AccessWidth::Bits16 => {
                        self.ports.write_u16(data_port + (register & 2), value as u16)
                    }
                    _ => self.ports.write_u32(data_port, value),
                }
            }
        }
        tracing::trace!(%id, register, bits, value, "config write");
        Ok(())
    }
}

impl std::fmt::Debug for PciConfigAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PciConfigAccess")
            .field("boot_region", &self.boot_region)
            .field("mcfg_regions", &*self.mcfg_regions.lock())
            .finish()
    }
}

fn config_width(bits: u32) -> Result<AccessWidth, PciError> {
    match AccessWidth::from_bits(bits) {
        Some(width @ (AccessWidth::Bits8 | AccessWidth::Bits16 | AccessWidth::Bits32)) => Ok(width),
        _ => Err(PciError::BadWidth { bits }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osl_test_host::PortAccess;
    use osl_test_host::TestHost;
    use osl_test_host::test;

    const ECAM_BASE: u64 = 0xe000_0000;

    fn new_access(boot_info: Option<PciBootInfo>) -> (Arc<TestHost>, PciConfigAccess) {
        let host = TestHost::new();
        let access = PciConfigAccess::new(host.clone(), host.clone(), host.clone(), boot_info);
        (host, access)
    }

    fn ecam_boot_info() -> PciBootInfo {
        PciBootInfo {
            base_address: ECAM_BASE,
            start_bus: 0,
            end_bus: 0xff,
        }
    }

    #[test]
    fn legacy_address_composition() {
        let (_host, access) = new_access(None);
        let route = access.resolve(PciId::new(0, 1, 2, 3), 0x10).unwrap();
        let ConfigRoute::Legacy { address, data_port } = route else {
            panic!("expected legacy route, got {route:?}");
        };
        assert_eq!(
            u32::from(address),
            0x8000_0000 | (1 << 16) | (2 << 11) | (3 << 8) | 0x10
        );
        assert_eq!(data_port, CONFIG_DATA_PORT);

        // Byte lanes are not part of the address.
        let route = access.resolve(PciId::new(0, 1, 2, 3), 0x13).unwrap();
        assert!(matches!(
            route,
            ConfigRoute::Legacy { address, .. } if address.register() == 0x10
        ));
    }

    #[test]
    fn ecam_address_composition() {
        let (_host, access) = new_access(Some(ecam_boot_info()));
        assert_eq!(
            access.resolve(PciId::new(0, 1, 2, 3), 0x10).unwrap(),
            ConfigRoute::Ecam {
                address: ECAM_BASE + (1 << 20) + (2 << 15) + (3 << 12) + 0x10
            }
        );
        assert_eq!(
            access.resolve(PciId::new(0, 0, 0, 0), 0x1000),
            Err(PciError::BadRegister {
                id: PciId::new(0, 0, 0, 0),
                register: 0x1000
            })
        );
    }

    #[test]
    fn boot_window_is_normalized_to_bus_zero() {
        let info = PciBootInfo {
            base_address: 0xf010_0000,
            start_bus: 1,
            end_bus: 4,
        };
        let region = EcamRegion::from_boot_info(&info).unwrap();
        assert_eq!(region.base_address, 0xf000_0000);
        assert_eq!(
            region.config_address(PciId::new(0, 1, 0, 0), 0),
            Some(0xf010_0000)
        );
        assert!(!region.contains(PciId::new(0, 0, 0, 0)));
        assert!(!region.contains(PciId::new(0, 5, 0, 0)));
        assert!(!region.contains(PciId::new(1, 1, 0, 0)));
    }

    #[test]
    fn bad_width_performs_no_io() {
        let (host, access) = new_access(None);
        let id = PciId::new(0, 0, 1, 0);
        assert_eq!(access.read(id, 0, 24), Err(PciError::BadWidth { bits: 24 }));
        assert_eq!(access.write(id, 0, 0, 64), Err(PciError::BadWidth { bits: 64 }));
        assert!(host.port_log().is_empty());

        let (host, access) = new_access(Some(ecam_boot_info()));
        assert_eq!(access.read(id, 0, 24), Err(PciError::BadWidth { bits: 24 }));
        assert_eq!(host.physical_accesses(), 0);
    }

    #[test]
    fn legacy_reads_and_writes() {
        let (host, access) = new_access(None);
        let mut config = [0u8; 256];
        config[0..4].copy_from_slice(&0x7190_8086u32.to_le_bytes());
        host.add_pci_function(0, 7, 0, config);
        let id = PciId::new(0, 0, 7, 0);

        assert_eq!(access.read(id, 0, 32).unwrap(), 0x7190_8086);
        assert_eq!(access.read(id, 2, 16).unwrap(), 0x7190);
        assert_eq!(access.read(id, 1, 8).unwrap(), 0x80);

        access.write(id, 0x3c, 0x0b, 8).unwrap();
        access.write(id, 0x3e, 0x1234, 16).unwrap();
        assert_eq!(host.pci_config_byte(0, 7, 0, 0x3c), Some(0x0b));
        assert_eq!(access.read(id, 0x3c, 32).unwrap(), 0x1234_000b);

        let log = host.port_log();
        assert_eq!(
            log[0],
            PortAccess::Write {
                port: CONFIG_ADDRESS_PORT,
                width: AccessWidth::Bits32,
                value: 0x8000_3800,
            }
        );
        assert_eq!(
            log[3],
            PortAccess::Read {
                port: CONFIG_DATA_PORT + 2,
                width: AccessWidth::Bits16,
            }
        );
    }

    #[test]
    fn legacy_limits() {
        let (host, access) = new_access(None);
        let id = PciId::new(1, 0, 0, 0);
        assert_eq!(
            access.read(id, 0, 32),
            Err(PciError::NotImplemented { id, register: 0 })
        );
        let id = PciId::new(0, 0, 0, 0);
        assert_eq!(
            access.read(id, 0x100, 32),
            Err(PciError::NotImplemented { id, register: 0x100 })
        );
        let id = PciId::new(0, 0, 32, 0);
        assert_eq!(access.read(id, 0, 32), Err(PciError::BadAddress(id)));
        assert!(host.port_log().is_empty());
    }

    #[test]
    fn ecam_reads_and_writes() {
        let (host, access) = new_access(Some(ecam_boot_info()));
        let id = PciId::new(0, 1, 2, 3);
        let address = ECAM_BASE + (1 << 20) + (2 << 15) + (3 << 12);
        host.write_physical(address, &0xdead_beefu32.to_le_bytes());

        assert_eq!(access.read(id, 0, 32).unwrap(), 0xdead_beef);
        assert_eq!(access.read(id, 2, 16).unwrap(), 0xdead);
        access.write(id, 0x104, 0x5a, 8).unwrap();
        assert_eq!(host.read_physical(address + 0x104, 1), [0x5a]);
        assert!(host.port_log().is_empty());
    }

    #[test]
    fn mcfg_windows_take_precedence() {
        let (_host, access) = new_access(Some(ecam_boot_info()));
        access.set_mcfg_regions(&[
            McfgAllocation::new(0xc000_0000, 0, 0, 0x7f),
            McfgAllocation::new(0xd000_0000, 1, 0, 0xff),
        ]);

        assert_eq!(
            access.resolve(PciId::new(0, 0, 0, 0), 0).unwrap(),
            ConfigRoute::Ecam {
                address: 0xc000_0000
            }
        );
        // Bus 0x80 of segment 0 is only covered by the boot window.
        assert_eq!(
            access.resolve(PciId::new(0, 0x80, 0, 0), 0).unwrap(),
            ConfigRoute::Ecam {
                address: ECAM_BASE + (0x80 << 20)
            }
        );
        assert_eq!(
            access.resolve(PciId::new(1, 2, 0, 0), 0).unwrap(),
            ConfigRoute::Ecam {
                address: 0xd000_0000 + (2 << 20)
            }
        );
        assert!(matches!(
            access.resolve(PciId::new(2, 0, 0, 0), 0),
            Err(PciError::NotImplemented { .. })
        ));
    }

    #[test]
    fn zero_base_windows_fall_back_to_legacy() {
        let (host, access) = new_access(Some(PciBootInfo {
            base_address: 0,
            start_bus: 0,
            end_bus: 0xff,
        }));
        assert!(matches!(
            access.resolve(PciId::new(0, 1, 2, 3), 0x10).unwrap(),
            ConfigRoute::Legacy { .. }
        ));

        access.set_mcfg_regions(&[McfgAllocation::new(0, 1, 0, 0xff)]);
        assert!(matches!(
            access.resolve(PciId::new(1, 0, 0, 0), 0),
            Err(PciError::NotImplemented { .. })
        ));
        assert_eq!(host.physical_accesses(), 0);
    }

    #[test]
    fn boot_window_below_bus_zero_is_ignored() {
        assert_eq!(
            EcamRegion::from_boot_info(&PciBootInfo {
                base_address: 0x8_0000,
                start_bus: 1,
                end_bus: 0xff,
            }),
            None
        );

        let (_host, access) = new_access(Some(PciBootInfo {
            base_address: 0,
            start_bus: 1,
            end_bus: 0xff,
        }));
        assert!(matches!(
            access.resolve(PciId::new(0, 1, 0, 0), 0).unwrap(),
            ConfigRoute::Legacy { .. }
        ));
    }

    #[test]
    fn windows_past_end_of_address_space_are_ignored() {
        let top = McfgAllocation::new(0xffff_ffff_fff0_0000, 0, 0, 0xff);
        assert_eq!(EcamRegion::from_mcfg(&top), None);

        let (host, access) = new_access(None);
        access.set_mcfg_regions(&[top]);
        let id = PciId::new(0, 1, 0, 0);
        assert!(matches!(
            access.resolve(id, 0).unwrap(),
            ConfigRoute::Legacy { .. }
        ));
        // No function is present, so the data port floats high.
        assert_eq!(access.read(id, 0, 32), Ok(0xffff_ffff));
        assert_eq!(host.physical_accesses(), 0);

        let region = EcamRegion {
            base_address: u64::MAX - 0xfff,
            segment: 0,
            start_bus: 0,
            end_bus: 0,
        };
        assert_eq!(region.config_address(PciId::new(0, 0, 0, 0), 0x10), None);
    }
}
