// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! ACPI exception codes.

use osl_alloc::AllocError;
use osl_cache::CacheError;
use osl_exec::ExecError;
use osl_host::MapError;
use osl_host::OutOfMemory;
use osl_pci::PciError;
use osl_sync::SyncError;

macro_rules! acpi_status {
    ($($(#[$attr:meta])* $name:ident = $value:expr => $text:literal,)*) => {
        impl AcpiStatus {
            $(
                #[doc = concat!("`", $text, "`")]
                $(#[$attr])*
                pub const $name: Self = Self($value);
            )*

            /// The ACPICA name of the code, if it is a known one.
            pub fn name(self) -> Option<&'static str> {
                match self {
                    $(Self::$name => Some($text),)*
                    _ => None,
                }
            }
        }
    };
}

/// An ACPI exception code, as exchanged with the interpreter engine.
#[repr(transparent)]
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AcpiStatus(pub u32);

acpi_status! {
    /// Success.
    OK = 0x0000 => "AE_OK",
    /// Unspecified failure.
    ERROR = 0x0001 => "AE_ERROR",
    NO_ACPI_TABLES = 0x0002 => "AE_NO_ACPI_TABLES",
    NO_NAMESPACE = 0x0003 => "AE_NO_NAMESPACE",
    /// An allocation failed.
    NO_MEMORY = 0x0004 => "AE_NO_MEMORY",
    NOT_FOUND = 0x0005 => "AE_NOT_FOUND",
    NOT_EXIST = 0x0006 => "AE_NOT_EXIST",
    ALREADY_EXISTS = 0x0007 => "AE_ALREADY_EXISTS",
    TYPE = 0x0008 => "AE_TYPE",
    NULL_OBJECT = 0x0009 => "AE_NULL_OBJECT",
    NULL_ENTRY = 0x000a => "AE_NULL_ENTRY",
    BUFFER_OVERFLOW = 0x000b => "AE_BUFFER_OVERFLOW",
    STACK_OVERFLOW = 0x000c => "AE_STACK_OVERFLOW",
    STACK_UNDERFLOW = 0x000d => "AE_STACK_UNDERFLOW",
    /// The operation cannot be carried out by this layer.
    NOT_IMPLEMENTED = 0x000e => "AE_NOT_IMPLEMENTED",
    SUPPORT = 0x000f => "AE_SUPPORT",
    /// A count would exceed its maximum.
    LIMIT = 0x0010 => "AE_LIMIT",
    /// A wait timed out.
    TIME = 0x0011 => "AE_TIME",
    ACQUIRE_DEADLOCK = 0x0012 => "AE_ACQUIRE_DEADLOCK",
    RELEASE_DEADLOCK = 0x0013 => "AE_RELEASE_DEADLOCK",
    NOT_ACQUIRED = 0x0014 => "AE_NOT_ACQUIRED",
    ALREADY_ACQUIRED = 0x0015 => "AE_ALREADY_ACQUIRED",
    NO_HARDWARE_RESPONSE = 0x0016 => "AE_NO_HARDWARE_RESPONSE",
    NO_GLOBAL_LOCK = 0x0017 => "AE_NO_GLOBAL_LOCK",
    ABORT_METHOD = 0x0018 => "AE_ABORT_METHOD",
    SAME_HANDLER = 0x0019 => "AE_SAME_HANDLER",
    NO_HANDLER = 0x001a => "AE_NO_HANDLER",
    OWNER_ID_LIMIT = 0x001b => "AE_OWNER_ID_LIMIT",
    NOT_CONFIGURED = 0x001c => "AE_NOT_CONFIGURED",
    ACCESS = 0x001d => "AE_ACCESS",
    IO_ERROR = 0x001e => "AE_IO_ERROR",
    /// An argument is invalid.
    BAD_PARAMETER = 0x1001 => "AE_BAD_PARAMETER",
    BAD_CHARACTER = 0x1002 => "AE_BAD_CHARACTER",
    BAD_PATHNAME = 0x1003 => "AE_BAD_PATHNAME",
    BAD_DATA = 0x1004 => "AE_BAD_DATA",
    /// An address is not mapped.
    BAD_ADDRESS = 0x1009 => "AE_BAD_ADDRESS",
}

impl AcpiStatus {
    /// Whether this is [`AcpiStatus::OK`].
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// Converts to a `Result`, so that `OK` is `Ok(())`.
    pub fn into_result(self) -> Result<(), Self> {
        if self.is_ok() {
            Ok(())
        } else {
            Err(self)
        }
    }

    /// Collapses a result into a status code.
    pub fn from_result<T>(result: &Result<T, Self>) -> Self {
        match result {
            Ok(_) => Self::OK,
            Err(status) => *status,
        }
    }
}

impl std::fmt::Debug for AcpiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

impl std::fmt::Display for AcpiStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => f.pad(name),
            None => write!(f, "AE_UNKNOWN({:#06x})", self.0),
        }
    }
}

impl std::error::Error for AcpiStatus {}

impl From<OutOfMemory> for AcpiStatus {
    fn from(_: OutOfMemory) -> Self {
        Self::NO_MEMORY
    }
}

impl From<AllocError> for AcpiStatus {
    fn from(err: AllocError) -> Self {
        match err {
            AllocError::OutOfMemory(_) => Self::NO_MEMORY,
            AllocError::BadTag(_) => Self::BAD_PARAMETER,
        }
    }
}

impl From<CacheError> for AcpiStatus {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::OutOfMemory(_) => Self::NO_MEMORY,
            CacheError::ZeroObjectSize
            | CacheError::Deleted { .. }
            | CacheError::WrongSize { .. } => Self::BAD_PARAMETER,
            CacheError::DepthMismatch { .. } => Self::ERROR,
        }
    }
}

impl From<SyncError> for AcpiStatus {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::InvalidUnits { .. } | SyncError::TooManyUnits { .. } => Self::BAD_PARAMETER,
            SyncError::Limit { .. } => Self::LIMIT,
            SyncError::Timeout(_) => Self::TIME,
        }
    }
}

impl From<ExecError> for AcpiStatus {
    fn from(err: ExecError) -> Self {
        match err {
            ExecError::OutOfMemory(_) => Self::NO_MEMORY,
            ExecError::QueueFull | ExecError::WorkerGone | ExecError::Spawn(_) => Self::ERROR,
        }
    }
}

impl From<MapError> for AcpiStatus {
    fn from(err: MapError) -> Self {
        match err {
            MapError::Empty { .. } => Self::BAD_PARAMETER,
            MapError::NoDescriptor { .. } | MapError::MapFailed { .. } => Self::NO_MEMORY,
        }
    }
}

impl From<PciError> for AcpiStatus {
    fn from(err: PciError) -> Self {
        match err {
            PciError::BadWidth { .. } | PciError::BadAddress(_) | PciError::BadRegister { .. } => {
                Self::BAD_PARAMETER
            }
            PciError::NotImplemented { .. } => Self::NOT_IMPLEMENTED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osl_test_host::test;

    #[test]
    fn names() {
        assert_eq!(AcpiStatus::OK.to_string(), "AE_OK");
        assert_eq!(AcpiStatus::BAD_PARAMETER.to_string(), "AE_BAD_PARAMETER");
        assert_eq!(AcpiStatus(0x1234).to_string(), "AE_UNKNOWN(0x1234)");
        assert_eq!(AcpiStatus::TIME.0, 0x11);
    }

    #[test]
    fn results() {
        assert_eq!(AcpiStatus::OK.into_result(), Ok(()));
        assert_eq!(AcpiStatus::TIME.into_result(), Err(AcpiStatus::TIME));
        assert_eq!(
            AcpiStatus::from_result(&Err::<(), _>(AcpiStatus::NO_MEMORY)),
            AcpiStatus::NO_MEMORY
        );
    }

    #[test]
    fn conversions() {
        assert_eq!(
            AcpiStatus::from(SyncError::Timeout(std::time::Duration::ZERO)),
            AcpiStatus::TIME
        );
        assert_eq!(
            AcpiStatus::from(PciError::BadWidth { bits: 24 }),
            AcpiStatus::BAD_PARAMETER
        );
        assert_eq!(
            AcpiStatus::from(CacheError::DepthMismatch {
                name: "x".into(),
                counted: 0,
                recorded: 1
            }),
            AcpiStatus::ERROR
        );
        assert_eq!(
            AcpiStatus::from(OutOfMemory { size: 8 }),
            AcpiStatus::NO_MEMORY
        );
    }
}
