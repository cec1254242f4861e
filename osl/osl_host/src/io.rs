// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access widths and legacy port I/O.

/// Width of a register or memory access requested by the engine.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum AccessWidth {
    /// 8 bits.
    Bits8,
    /// 16 bits.
    Bits16,
    /// 32 bits.
    Bits32,
    /// 64 bits. Only valid for memory accesses.
    Bits64,
}

impl AccessWidth {
    /// Converts an engine-supplied width in bits. Returns `None` for any
    /// width other than 8, 16, 32 or 64.
    pub fn from_bits(bits: u32) -> Option<Self> {
        let width = match bits {
            8 => Self::Bits8,
            16 => Self::Bits16,
            32 => Self::Bits32,
            64 => Self::Bits64,
            _ => return None,
        };
        Some(width)
    }

    /// The width in bits.
    pub fn bits(self) -> u32 {
        match self {
            Self::Bits8 => 8,
            Self::Bits16 => 16,
            Self::Bits32 => 32,
            Self::Bits64 => 64,
        }
    }

    /// The width in bytes.
    pub fn bytes(self) -> usize {
        self.bits() as usize / 8
    }

    /// A mask covering the low `bits()` bits.
    pub fn mask(self) -> u64 {
        match self {
            Self::Bits64 => !0,
            _ => (1 << self.bits()) - 1,
        }
    }
}

impl std::fmt::Display for AccessWidth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-bit", self.bits())
    }
}

/// Legacy x86 port I/O.
pub trait PortIo: Send + Sync {
    /// Reads a byte from `port`.
    fn read_u8(&self, port: u16) -> u8;
    /// Reads a word from `port`.
    fn read_u16(&self, port: u16) -> u16;
    /// Reads a dword from `port`.
    fn read_u32(&self, port: u16) -> u32;
    /// Writes a byte to `port`.
    fn write_u8(&self, port: u16, value: u8);
    /// Writes a word to `port`.
    fn write_u16(&self, port: u16, value: u16);
    /// Writes a dword to `port`.
    fn write_u32(&self, port: u16, value: u32);
}
