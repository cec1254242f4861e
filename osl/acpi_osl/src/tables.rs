// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Locating and cataloguing the firmware ACPI tables.

use acpi_table_spec::mcfg::McfgHeader;
use acpi_table_spec::EfiConfigurationTable;
use acpi_table_spec::Header;
use acpi_table_spec::Rsdp;
use acpi_table_spec::Table;
use acpi_table_spec::MADT_SIGNATURE;
use osl_host::EfiConfigTable;
use osl_host::PhysicalMemory;
use osl_host::Platform;
use std::collections::HashMap;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Looks up the RSDP through the EFI configuration table, preferring the
/// ACPI 2.0 entry. Returns the physical address of the first RSDP whose
/// signature and checksums are valid.
pub(crate) fn find_root_pointer(
    platform: &dyn Platform,
    physical: &dyn PhysicalMemory,
) -> Option<u64> {
    for table in [EfiConfigTable::Acpi20, EfiConfigTable::Acpi10] {
        let Some(entry_address) = platform.efi_config_table(table) else {
            continue;
        };

        let mut entry = EfiConfigurationTable::new_zeroed();
        physical.read_bytes(entry_address, entry.as_mut_bytes());
        let rsdp_address = entry.vendor_table.get();

        let mut rsdp = Rsdp::new_zeroed();
        physical.read_bytes(rsdp_address, rsdp.as_mut_bytes());
        if rsdp.is_valid() {
            tracing::debug!(guid = table.guid(), rsdp_address, "found RSDP");
            return Some(rsdp_address);
        }
        tracing::warn!(guid = table.guid(), rsdp_address, "invalid RSDP");
    }
    None
}

/// One catalogued table.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// The signature, with an instance suffix if the signature repeats.
    pub name: String,
    /// The table contents, header included.
    pub data: Box<[u8]>,
}

/// The firmware tables, named by signature.
///
/// Tables whose signature occurs once keep the bare signature as their
/// name. Every table whose signature repeats is named `SIG-1`, `SIG-2`, and
/// so on, in table order.
#[derive(Debug, Default)]
pub struct TableCatalog {
    entries: Vec<CatalogEntry>,
    madt: Option<usize>,
    mcfg: Option<usize>,
}

impl TableCatalog {
    /// Catalogues `tables`, each a complete table starting with its header.
    /// Tables too short to hold their header, or shorter than the length it
    /// declares, are skipped.
    pub fn build<'a>(tables: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let tables: Vec<(&Header, &[u8])> = tables
            .into_iter()
            .filter_map(|raw| {
                let Ok((header, _)) = Header::ref_from_prefix(raw) else {
                    tracing::warn!(len = raw.len(), "skipping table without a header");
                    return None;
                };
                let length = header.length.get() as usize;
                if length < size_of::<Header>() || length > raw.len() {
                    tracing::warn!(
                        signature = %String::from_utf8_lossy(&header.signature),
                        length,
                        available = raw.len(),
                        "skipping truncated table"
                    );
                    return None;
                }
                Some((header, &raw[..length]))
            })
            .collect();

        let mut counts = HashMap::<[u8; 4], usize>::new();
        for (header, _) in &tables {
            *counts.entry(header.signature).or_default() += 1;
        }

        let mut catalog = Self::default();
        let mut instances = HashMap::<[u8; 4], usize>::new();
        for (header, data) in tables {
            let signature = String::from_utf8_lossy(&header.signature).into_owned();
            let name = if counts[&header.signature] > 1 {
                let instance = instances.entry(header.signature).or_default();
                *instance += 1;
                format!("{signature}-{instance}")
            } else {
                signature
            };

            let index = catalog.entries.len();
            if header.signature == MADT_SIGNATURE {
                catalog.madt.get_or_insert(index);
            } else if header.signature == McfgHeader::SIGNATURE {
                catalog.mcfg.get_or_insert(index);
            }

            tracing::debug!(%name, length = data.len(), "catalogued table");
            catalog.entries.push(CatalogEntry {
                name,
                data: data.into(),
            });
        }
        catalog
    }

    /// The table named `name`.
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| &*e.data)
    }

    /// All tables, in table order.
    pub fn entries(&self) -> &[CatalogEntry] {
        &self.entries
    }

    /// The first MADT.
    pub fn madt(&self) -> Option<&[u8]> {
        self.madt.map(|i| &*self.entries[i].data)
    }

    /// The first MCFG table.
    pub fn mcfg(&self) -> Option<&[u8]> {
        self.mcfg.map(|i| &*self.entries[i].data)
    }

    /// The number of catalogued tables.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no tables were catalogued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
