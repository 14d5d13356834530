/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! UEFI GPT parsing with CRC validation and backup-header fallback
//! support. The protocol clients feed raw sectors in; nothing here does
//! device I/O.

use crate::error::{Error, Result};
use crate::storage::{Partition, PartitionFlags, is_modem_partition};
use crate::utilities::utf16le_name;
use crate::{le_u32, le_u64};

pub const GPT_MAGIC: &[u8; 8] = b"EFI PART";
/// GPT read-only attribute bit (bit 60).
const ATTR_READ_ONLY: u64 = 1 << 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GptHeader {
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub entries_lba: u64,
    pub num_entries: u32,
    pub entry_size: u32,
    pub entries_crc32: u32,
}

impl GptHeader {
    /// Parses and CRC-validates one header sector.
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < 92 {
            return Err(Error::proto("GPT header sector too short"));
        }
        if &sector[0..8] != GPT_MAGIC {
            return Err(Error::integrity("GPT signature missing"));
        }

        let header_size = le_u32!(sector, 12) as usize;
        if !(92..=sector.len()).contains(&header_size) {
            return Err(Error::integrity(format!("implausible GPT header size {header_size}")));
        }

        let stored_crc = le_u32!(sector, 16);
        let mut scratch = sector[..header_size].to_vec();
        scratch[16..20].fill(0);
        let computed = crc32fast::hash(&scratch);
        if computed != stored_crc {
            return Err(Error::integrity(format!(
                "GPT header CRC mismatch: stored 0x{stored_crc:08X}, computed 0x{computed:08X}"
            )));
        }

        Ok(GptHeader {
            current_lba: le_u64!(sector, 24),
            backup_lba: le_u64!(sector, 32),
            first_usable_lba: le_u64!(sector, 40),
            last_usable_lba: le_u64!(sector, 48),
            entries_lba: le_u64!(sector, 72),
            num_entries: le_u32!(sector, 80),
            entry_size: le_u32!(sector, 84),
            entries_crc32: le_u32!(sector, 88),
        })
    }

    /// Bytes occupied by the entries array.
    pub fn entries_len(&self) -> usize {
        self.num_entries as usize * self.entry_size as usize
    }
}

/// Decodes the entries array after validating it against the header CRC.
/// Entries with an all-zero type GUID are unused and skipped.
pub fn parse_entries(
    header: &GptHeader,
    data: &[u8],
    sector_size: u32,
    lun: u32,
) -> Result<Vec<Partition>> {
    let wanted = header.entries_len();
    if data.len() < wanted {
        return Err(Error::proto(format!(
            "GPT entries array truncated: {} of {wanted} bytes",
            data.len()
        )));
    }

    let array = &data[..wanted];
    let computed = crc32fast::hash(array);
    if computed != header.entries_crc32 {
        return Err(Error::integrity(format!(
            "GPT entries CRC mismatch: stored 0x{:08X}, computed 0x{computed:08X}",
            header.entries_crc32
        )));
    }

    let entry_size = header.entry_size as usize;
    if entry_size < 128 {
        return Err(Error::proto(format!("GPT entry size {entry_size} below minimum")));
    }

    let mut partitions = Vec::new();
    for entry in array.chunks_exact(entry_size) {
        if entry[0..16].iter().all(|&b| b == 0) {
            continue;
        }

        let first_lba = le_u64!(entry, 32);
        let last_lba = le_u64!(entry, 40);
        let attributes = le_u64!(entry, 48);
        let name = utf16le_name(&entry[56..56 + 72]);
        if name.is_empty() || last_lba < first_lba {
            continue;
        }

        let flags = PartitionFlags {
            modem: is_modem_partition(&name),
            ab_replicated: name.ends_with("_a") || name.ends_with("_b"),
            readonly: attributes & ATTR_READ_ONLY != 0,
            ..Default::default()
        };

        partitions.push(Partition {
            name,
            lun,
            start_sector: first_lba,
            num_sectors: last_lba - first_lba + 1,
            sector_size,
            flags,
            super_offset: None,
        });
    }

    Ok(partitions)
}
