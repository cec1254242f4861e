// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! ACPI table layouts consumed by the OS services layer.
//!
//! Only the structures the OS layer itself reads are defined here: the EFI
//! configuration table entry and root system description pointer used to
//! find the tables, the common table header, and the MCFG table that
//! describes ECAM windows. Everything else is left to the interpreter
//! engine.

#![no_std]

pub mod mcfg;

#[allow(non_camel_case_types)]
mod packed_nums {
    pub type u16_ne = zerocopy::U16<zerocopy::NativeEndian>;
    pub type u32_ne = zerocopy::U32<zerocopy::NativeEndian>;
    pub type u64_ne = zerocopy::U64<zerocopy::NativeEndian>;
}

use self::packed_nums::*;
use core::mem::size_of;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;

/// Signature at the start of every RSDP.
pub const RSDP_SIGNATURE: [u8; 8] = *b"RSD PTR ";

/// Number of bytes covered by the ACPI 1.0 RSDP checksum.
pub const RSDP_V1_LENGTH: usize = 20;

#[repr(C, packed)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct Rsdp {
    pub signature: [u8; 8],
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub revision: u8,
    pub rsdt: u32,
    pub length: u32,
    pub xsdt: u64,
    pub xchecksum: u8,
    pub rsvd: [u8; 3],
}

const_assert_eq!(size_of::<Rsdp>(), 36);

impl Rsdp {
    /// Returns true if the signature and the checksums that apply to this
    /// revision are valid.
    ///
    /// Revision 0 tables only carry the first 20 bytes, so the extended
    /// checksum is not consulted for them.
    pub fn is_valid(&self) -> bool {
        if self.signature != RSDP_SIGNATURE {
            return false;
        }
        let bytes = self.as_bytes();
        if checksum(&bytes[..RSDP_V1_LENGTH]) != 0 {
            return false;
        }
        self.revision == 0 || checksum(bytes) == 0
    }
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct Header {
    pub signature: [u8; 4],
    pub length: u32_ne,
    pub revision: u8,
    pub checksum: u8,
    pub oem_id: [u8; 6],
    pub oem_tableid: [u8; 8],
    pub oem_revision: u32_ne,
    pub creator_id: u32_ne,
    pub creator_revision: u32_ne,
}

const_assert_eq!(size_of::<Header>(), 36);

/// Marker trait for ACPI table structs that encodes the table's signature.
pub trait Table: IntoBytes + Unaligned + Immutable + KnownLayout {
    const SIGNATURE: [u8; 4];
}

/// An entry of the EFI system table's configuration table array.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct EfiConfigurationTable {
    pub vendor_guid: [u8; 16],
    pub vendor_table: u64_ne,
}

const_assert_eq!(size_of::<EfiConfigurationTable>(), 24);

/// Signature of the multiple APIC description table.
pub const MADT_SIGNATURE: [u8; 4] = *b"APIC";

/// Computes the byte-wise sum used by ACPI checksums. A well-formed table
/// sums to zero.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsdp(revision: u8) -> Rsdp {
        let mut rsdp = Rsdp {
            signature: RSDP_SIGNATURE,
            checksum: 0,
            oem_id: *b"OSLTST",
            revision,
            rsdt: 0x1000,
            length: size_of::<Rsdp>() as u32,
            xsdt: 0x2000,
            xchecksum: 0,
            rsvd: [0; 3],
        };
        rsdp.checksum = 0u8.wrapping_sub(checksum(&rsdp.as_bytes()[..RSDP_V1_LENGTH]));
        rsdp.xchecksum = 0u8.wrapping_sub(checksum(rsdp.as_bytes()));
        rsdp
    }

    #[test]
    fn valid_rsdp() {
        assert!(rsdp(0).is_valid());
        assert!(rsdp(2).is_valid());
    }

    #[test]
    fn corrupt_rsdp() {
        let mut bad_sig = rsdp(2);
        bad_sig.signature = *b"RSD PTX ";
        assert!(!bad_sig.is_valid());

        let mut bad_ext = rsdp(2);
        bad_ext.xsdt = 0x3000;
        assert!(!bad_ext.is_valid());

        // Revision 0 ignores the extended area entirely.
        let mut v1 = rsdp(0);
        v1.xchecksum = v1.xchecksum.wrapping_add(1);
        assert!(v1.is_valid());
    }
}
