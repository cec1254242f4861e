// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! OS layer configuration and boot options.

use bitfield_struct::bitfield;
use osl_exec::DispatcherConfig;
use osl_host::PciBootInfo;

/// The boot option selecting the engine log backends.
pub const LOG_BOOT_OPTION: &str = "acpi_os_log";

/// Backends that receive engine log output.
#[bitfield(u32)]
#[derive(PartialEq, Eq)]
pub struct LogFlags {
    /// Write to the kernel console.
    pub console: bool,
    /// Write to the structured system log. Skipped at interrupt context.
    pub log: bool,
    #[bits(30)]
    _reserved: u32,
}

impl LogFlags {
    /// The backends used when no boot option is given. Debug builds log
    /// to both; release builds only to the structured log.
    pub fn platform_default() -> Self {
        Self::new()
            .with_console(cfg!(debug_assertions))
            .with_log(true)
    }
}

/// Configuration for [`AcpiOs`](crate::AcpiOs).
#[derive(Debug, Clone)]
pub struct AcpiOsConfig {
    /// Engine log backends.
    pub log_flags: LogFlags,
    /// Deferred execution tuning.
    pub dispatcher: DispatcherConfig,
    /// ECAM window reported by the boot loader. When unset, the host
    /// platform is asked at initialization.
    pub pci_boot_info: Option<PciBootInfo>,
}

impl Default for AcpiOsConfig {
    fn default() -> Self {
        Self {
            log_flags: LogFlags::platform_default(),
            dispatcher: DispatcherConfig::default(),
            pci_boot_info: None,
        }
    }
}

impl AcpiOsConfig {
    /// Applies the options found in the kernel boot argument string.
    pub fn apply_boot_args(&mut self, boot_args: &str) {
        if let Some(mask) = parse_boot_arg(boot_args, LOG_BOOT_OPTION) {
            tracing::debug!(mask, "log backends selected by boot option");
            self.log_flags = LogFlags::from(mask);
        }
    }

    /// The default configuration with `boot_args` applied.
    pub fn from_boot_args(boot_args: &str) -> Self {
        let mut config = Self::default();
        config.apply_boot_args(boot_args);
        config
    }
}

/// Finds `name=<value>` among whitespace separated boot arguments, where
/// the value is decimal or `0x` hex. The last occurrence wins.
fn parse_boot_arg(boot_args: &str, name: &str) -> Option<u32> {
    let mut found = None;
    for arg in boot_args.split_whitespace() {
        let Some(value) = arg
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
        else {
            continue;
        };
        let parsed = match value
            .strip_prefix("0x")
            .or_else(|| value.strip_prefix("0X"))
        {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => value.parse(),
        };
        match parsed {
            Ok(v) => found = Some(v),
            Err(err) => {
                tracing::warn!(
                    option = name,
                    value,
                    error = &err as &dyn std::error::Error,
                    "ignoring malformed boot option"
                );
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use osl_test_host::test;

    #[test]
    fn boot_arg_parsing() {
        assert_eq!(parse_boot_arg("-v acpi_os_log=3", LOG_BOOT_OPTION), Some(3));
        assert_eq!(parse_boot_arg("acpi_os_log=0x2 debug=0x100", LOG_BOOT_OPTION), Some(2));
        assert_eq!(parse_boot_arg("acpi_os_log=1 acpi_os_log=2", LOG_BOOT_OPTION), Some(2));
        assert_eq!(parse_boot_arg("acpi_os_logx=1", LOG_BOOT_OPTION), None);
        assert_eq!(parse_boot_arg("acpi_os_log=zz", LOG_BOOT_OPTION), None);
        assert_eq!(parse_boot_arg("", LOG_BOOT_OPTION), None);
    }

    #[test]
    fn log_flags() {
        let config = AcpiOsConfig::from_boot_args("acpi_os_log=1");
        assert!(config.log_flags.console());
        assert!(!config.log_flags.log());

        let config = AcpiOsConfig::from_boot_args("keepsyms=1");
        assert_eq!(config.log_flags, LogFlags::platform_default());
        assert!(config.log_flags.log());
        assert_eq!(config.log_flags.console(), cfg!(debug_assertions));
    }
}
