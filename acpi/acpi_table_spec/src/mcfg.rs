// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCI Express memory-mapped configuration space base address description
//! table.

use super::Table;
use crate::packed_nums::*;
use core::mem::size_of;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Ref;
use zerocopy::Unaligned;

/// Fixed part of the MCFG table that follows the standard header.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct McfgHeader {
    pub rsvd: u64_ne,
}

const_assert_eq!(size_of::<McfgHeader>(), 8);

impl Table for McfgHeader {
    const SIGNATURE: [u8; 4] = *b"MCFG";
}

/// One ECAM window. `base_address` is the address of bus 0 of the segment,
/// even when `start_bus` is not 0.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned)]
pub struct McfgAllocation {
    pub base_address: u64_ne,
    pub segment: u16_ne,
    pub start_bus: u8,
    pub end_bus: u8,
    pub rsvd: u32_ne,
}

const_assert_eq!(size_of::<McfgAllocation>(), 16);

impl McfgAllocation {
    pub fn new(base_address: u64, segment: u16, start_bus: u8, end_bus: u8) -> Self {
        Self {
            base_address: base_address.into(),
            segment: segment.into(),
            start_bus,
            end_bus,
            rsvd: 0.into(),
        }
    }
}

#[derive(Debug)]
pub enum ParseMcfgError {
    MissingAcpiHeader,
    InvalidSignature([u8; 4]),
    MismatchedLength { in_header: usize, actual: usize },
    MissingFixedHeader,
    TrailingBytes(usize),
}

impl core::fmt::Display for ParseMcfgError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::MissingAcpiHeader => write!(f, "could not read standard ACPI header"),
            Self::InvalidSignature(sig) => {
                write!(f, "invalid signature. expected b\"MCFG\", found {sig:?}")
            }
            Self::MismatchedLength { in_header, actual } => {
                write!(f, "mismatched len. in_header: {in_header}, actual {actual}")
            }
            Self::MissingFixedHeader => write!(f, "missing fixed MCFG header"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after last allocation"),
        }
    }
}

impl core::error::Error for ParseMcfgError {}

/// Parses a raw MCFG table, invoking `on_allocation` for each ECAM window in
/// table order.
pub fn parse_mcfg<'a>(
    raw_mcfg: &'a [u8],
    mut on_allocation: impl FnMut(&'a McfgAllocation),
) -> Result<&'a crate::Header, ParseMcfgError> {
    let raw_mcfg_len = raw_mcfg.len();
    let (acpi_header, buf) = Ref::<_, crate::Header>::from_prefix(raw_mcfg)
        .map_err(|_| ParseMcfgError::MissingAcpiHeader)?;

    if acpi_header.signature != McfgHeader::SIGNATURE {
        return Err(ParseMcfgError::InvalidSignature(acpi_header.signature));
    }

    if acpi_header.length.get() as usize != raw_mcfg_len {
        return Err(ParseMcfgError::MismatchedLength {
            in_header: acpi_header.length.get() as usize,
            actual: raw_mcfg_len,
        });
    }

    let (_, mut buf) =
        Ref::<_, McfgHeader>::from_prefix(buf).map_err(|_| ParseMcfgError::MissingFixedHeader)?;

    while !buf.is_empty() {
        let (allocation, rest) = Ref::<_, McfgAllocation>::from_prefix(buf)
            .map_err(|_| ParseMcfgError::TrailingBytes(buf.len()))?;
        on_allocation(Ref::into_ref(allocation));
        buf = rest;
    }

    Ok(Ref::into_ref(acpi_header))
}
