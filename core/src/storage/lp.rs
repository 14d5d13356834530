/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Logical-partition (LP, "dynamic partition") metadata, as stored at the
//! head of the physical `super` partition.
//!
//! Layout: 4 KiB reserved, geometry, backup geometry, then
//! `slot_count` primary metadata copies followed by their backups, each
//! `metadata_max_size` bytes. All checksums are SHA-256 with the checksum
//! field zeroed.

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::storage::{Partition, PartitionFlags, Slot};
use crate::{le_u16, le_u32, le_u64};

pub const GEOMETRY_MAGIC: u32 = 0x616C_4467;
pub const METADATA_MAGIC: u32 = 0x414C_5030;

/// Bytes reserved ahead of the first geometry copy.
pub const PARTITION_RESERVED_BYTES: u64 = 4096;
/// On-disk size of one geometry copy.
pub const GEOMETRY_SIZE: u64 = 4096;

const GEOMETRY_STRUCT_SIZE: usize = 52;

/// Attribute bit: partition rejects writes.
pub const ATTR_READONLY: u32 = 1 << 0;
/// Attribute bit: name carries the active slot suffix.
pub const ATTR_SLOT_SUFFIXED: u32 = 1 << 1;
/// Attribute bit: partition was touched by the current update.
pub const ATTR_UPDATED: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub metadata_max_size: u32,
    pub metadata_slot_count: u32,
    pub logical_block_size: u32,
}

impl Geometry {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < GEOMETRY_STRUCT_SIZE {
            return Err(Error::proto("LP geometry truncated"));
        }
        if le_u32!(data, 0) != GEOMETRY_MAGIC {
            return Err(Error::integrity("LP geometry magic missing"));
        }

        let struct_size = le_u32!(data, 4) as usize;
        if !(GEOMETRY_STRUCT_SIZE..=data.len()).contains(&struct_size) {
            return Err(Error::integrity(format!("implausible LP geometry size {struct_size}")));
        }

        let stored = &data[8..40];
        let mut scratch = data[..struct_size].to_vec();
        scratch[8..40].fill(0);
        let computed = Sha256::digest(&scratch);
        if computed.as_slice() != stored {
            return Err(Error::integrity("LP geometry checksum mismatch"));
        }

        Ok(Geometry {
            metadata_max_size: le_u32!(data, 40),
            metadata_slot_count: le_u32!(data, 44),
            logical_block_size: le_u32!(data, 48),
        })
    }

    /// Byte offset of the primary metadata copy for `slot` inside super.
    pub fn metadata_offset(&self, slot: u32) -> u64 {
        PARTITION_RESERVED_BYTES
            + 2 * GEOMETRY_SIZE
            + slot as u64 * self.metadata_max_size as u64
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LpExtent {
    pub num_sectors: u64,
    /// Physical 512-byte sector inside super; `None` for zero-filled.
    pub physical_sector: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPartition {
    pub name: String,
    pub attributes: u32,
    pub extents: Vec<LpExtent>,
}

impl LogicalPartition {
    pub fn num_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.num_sectors).sum()
    }

    pub fn slot(&self) -> Slot {
        if self.name.ends_with("_a") {
            Slot::A
        } else if self.name.ends_with("_b") {
            Slot::B
        } else {
            Slot::None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LpMetadata {
    pub partitions: Vec<LogicalPartition>,
}

struct TableDescriptor {
    offset: usize,
    num_entries: usize,
    entry_size: usize,
}

fn descriptor(data: &[u8], at: usize) -> TableDescriptor {
    TableDescriptor {
        offset: le_u32!(data, at) as usize,
        num_entries: le_u32!(data, at + 4) as usize,
        entry_size: le_u32!(data, at + 8) as usize,
    }
}

impl LpMetadata {
    /// Parses one metadata copy (header + tables).
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 128 {
            return Err(Error::proto("LP metadata truncated"));
        }
        if le_u32!(data, 0) != METADATA_MAGIC {
            return Err(Error::integrity("LP metadata magic missing"));
        }

        let major = le_u16!(data, 4);
        if major != 10 {
            return Err(Error::unsupported(format!("LP metadata major version {major}")));
        }

        let header_size = le_u32!(data, 8) as usize;
        if !(128..=data.len()).contains(&header_size) {
            return Err(Error::integrity(format!("implausible LP header size {header_size}")));
        }

        let stored_header_sum = data[12..44].to_vec();
        let mut scratch = data[..header_size].to_vec();
        scratch[12..44].fill(0);
        if Sha256::digest(&scratch).as_slice() != stored_header_sum {
            return Err(Error::integrity("LP header checksum mismatch"));
        }

        let tables_size = le_u32!(data, 44) as usize;
        let tables = data
            .get(header_size..header_size + tables_size)
            .ok_or_else(|| Error::proto("LP tables truncated"))?;
        let stored_tables_sum = &data[48..80];
        if Sha256::digest(tables).as_slice() != stored_tables_sum {
            return Err(Error::integrity("LP tables checksum mismatch"));
        }

        // Descriptors: partitions at 80, extents at 92 (groups and block
        // devices follow but are not needed here).
        let partitions_desc = descriptor(data, 80);
        let extents_desc = descriptor(data, 92);

        if partitions_desc.entry_size < 52 || extents_desc.entry_size < 24 {
            return Err(Error::proto("LP table entry sizes below minimum"));
        }

        let mut extents = Vec::with_capacity(extents_desc.num_entries);
        for i in 0..extents_desc.num_entries {
            let at = extents_desc.offset + i * extents_desc.entry_size;
            let entry = tables
                .get(at..at + extents_desc.entry_size)
                .ok_or_else(|| Error::proto("LP extent entry out of range"))?;

            let num_sectors = le_u64!(entry, 0);
            let target_type = le_u32!(entry, 8);
            let target_data = le_u64!(entry, 12);

            extents.push(LpExtent {
                num_sectors,
                physical_sector: match target_type {
                    0 => Some(target_data), // linear
                    _ => None,              // zero
                },
            });
        }

        let mut partitions = Vec::with_capacity(partitions_desc.num_entries);
        for i in 0..partitions_desc.num_entries {
            let at = partitions_desc.offset + i * partitions_desc.entry_size;
            let entry = tables
                .get(at..at + partitions_desc.entry_size)
                .ok_or_else(|| Error::proto("LP partition entry out of range"))?;

            let name: String = entry[..36]
                .iter()
                .take_while(|&&b| b != 0)
                .map(|&b| b as char)
                .collect();
            let attributes = le_u32!(entry, 36);
            let first_extent = le_u32!(entry, 40) as usize;
            let num_extents = le_u32!(entry, 44) as usize;

            let slice = extents
                .get(first_extent..first_extent + num_extents)
                .ok_or_else(|| Error::proto(format!("'{name}' references missing extents")))?;

            partitions.push(LogicalPartition {
                name,
                attributes,
                extents: slice.to_vec(),
            });
        }

        Ok(LpMetadata { partitions })
    }

    pub fn find(&self, name: &str) -> Option<&LogicalPartition> {
        self.partitions.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }

    /// Projects logical partitions into the common partition model. The
    /// first linear extent anchors the offset inside super.
    pub fn to_partitions(&self, super_partition: &Partition) -> Vec<Partition> {
        self.partitions
            .iter()
            .map(|lp| {
                let offset = lp
                    .extents
                    .iter()
                    .find_map(|e| e.physical_sector)
                    .map(|s| s * 512);

                Partition {
                    name: lp.name.clone(),
                    lun: super_partition.lun,
                    start_sector: 0,
                    num_sectors: lp.num_sectors(),
                    sector_size: 512,
                    flags: PartitionFlags {
                        logical: true,
                        modem: false,
                        ab_replicated: lp.slot() != Slot::None,
                        readonly: lp.attributes & ATTR_READONLY != 0,
                    },
                    super_offset: offset,
                }
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod testdata {
    use super::*;

    pub fn build_geometry(metadata_max_size: u32, slots: u32) -> Vec<u8> {
        let mut g = vec![0u8; GEOMETRY_STRUCT_SIZE];
        g[0..4].copy_from_slice(&GEOMETRY_MAGIC.to_le_bytes());
        g[4..8].copy_from_slice(&(GEOMETRY_STRUCT_SIZE as u32).to_le_bytes());
        g[40..44].copy_from_slice(&metadata_max_size.to_le_bytes());
        g[44..48].copy_from_slice(&slots.to_le_bytes());
        g[48..52].copy_from_slice(&4096u32.to_le_bytes());

        let sum = Sha256::digest(&g);
        g[8..40].copy_from_slice(&sum);
        g
    }

    /// Partitions: (name, attributes, extents as (sectors, phys)).
    pub fn build_metadata(parts: &[(&str, u32, &[(u64, Option<u64>)])]) -> Vec<u8> {
        const HEADER_SIZE: usize = 128;
        const PART_ENTRY: usize = 52;
        const EXTENT_ENTRY: usize = 24;

        let num_extents: usize = parts.iter().map(|(_, _, e)| e.len()).sum();
        let parts_len = parts.len() * PART_ENTRY;
        let extents_len = num_extents * EXTENT_ENTRY;
        let tables_size = parts_len + extents_len;

        let mut tables = vec![0u8; tables_size];
        let mut extent_index = 0usize;
        for (i, (name, attrs, extents)) in parts.iter().enumerate() {
            let e = &mut tables[i * PART_ENTRY..(i + 1) * PART_ENTRY];
            for (j, b) in name.bytes().take(36).enumerate() {
                e[j] = b;
            }
            e[36..40].copy_from_slice(&attrs.to_le_bytes());
            e[40..44].copy_from_slice(&(extent_index as u32).to_le_bytes());
            e[44..48].copy_from_slice(&(extents.len() as u32).to_le_bytes());

            for (sectors, phys) in extents.iter() {
                let at = parts_len + extent_index * EXTENT_ENTRY;
                let x = &mut tables[at..at + EXTENT_ENTRY];
                x[0..8].copy_from_slice(&sectors.to_le_bytes());
                let (ty, data) = match phys {
                    Some(s) => (0u32, *s),
                    None => (1u32, 0),
                };
                x[8..12].copy_from_slice(&ty.to_le_bytes());
                x[12..20].copy_from_slice(&data.to_le_bytes());
                extent_index += 1;
            }
        }

        let mut header = vec![0u8; HEADER_SIZE];
        header[0..4].copy_from_slice(&METADATA_MAGIC.to_le_bytes());
        header[4..6].copy_from_slice(&10u16.to_le_bytes());
        header[8..12].copy_from_slice(&(HEADER_SIZE as u32).to_le_bytes());
        header[44..48].copy_from_slice(&(tables_size as u32).to_le_bytes());
        let tables_sum = Sha256::digest(&tables);
        header[48..80].copy_from_slice(&tables_sum);

        // partitions descriptor
        header[80..84].copy_from_slice(&0u32.to_le_bytes());
        header[84..88].copy_from_slice(&(parts.len() as u32).to_le_bytes());
        header[88..92].copy_from_slice(&(PART_ENTRY as u32).to_le_bytes());
        // extents descriptor
        header[92..96].copy_from_slice(&(parts_len as u32).to_le_bytes());
        header[96..100].copy_from_slice(&(num_extents as u32).to_le_bytes());
        header[100..104].copy_from_slice(&(EXTENT_ENTRY as u32).to_le_bytes());

        let header_sum = Sha256::digest(&header);
        header[12..44].copy_from_slice(&header_sum);

        let mut out = header;
        out.extend_from_slice(&tables);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testdata::{build_geometry, build_metadata};
    use super::*;

    #[test]
    fn geometry_roundtrip_and_offsets() {
        let raw = build_geometry(65536, 2);
        let geometry = Geometry::parse(&raw).unwrap();

        assert_eq!(geometry.metadata_slot_count, 2);
        assert_eq!(geometry.metadata_offset(0), 4096 + 2 * 4096);
        assert_eq!(geometry.metadata_offset(1), 4096 + 2 * 4096 + 65536);
    }

    #[test]
    fn corrupted_geometry_checksum_is_rejected() {
        let mut raw = build_geometry(65536, 2);
        raw[41] ^= 0x01;
        assert!(matches!(Geometry::parse(&raw), Err(Error::Integrity(_))));
    }

    #[test]
    fn metadata_parses_partitions_and_extents() {
        let raw = build_metadata(&[
            ("system_a", ATTR_READONLY | ATTR_SLOT_SUFFIXED, &[(0x10000, Some(2048))]),
            ("system_b", ATTR_SLOT_SUFFIXED, &[(0x10000, Some(0x12800))]),
            ("scratch", 0, &[(0x800, None)]),
        ]);

        let metadata = LpMetadata::parse(&raw).unwrap();
        assert_eq!(metadata.partitions.len(), 3);

        let system_a = metadata.find("system_a").unwrap();
        assert_eq!(system_a.num_sectors(), 0x10000);
        assert_eq!(system_a.slot(), Slot::A);
        assert_eq!(system_a.extents[0].physical_sector, Some(2048));

        let scratch = metadata.find("scratch").unwrap();
        assert_eq!(scratch.extents[0].physical_sector, None);
    }

    #[test]
    fn header_or_tables_corruption_is_an_integrity_error() {
        let good = build_metadata(&[("system_a", 0, &[(0x1000, Some(64))])]);

        let mut bad_header = good.clone();
        bad_header[9] ^= 0x01;
        assert!(matches!(LpMetadata::parse(&bad_header), Err(Error::Integrity(_))));

        let mut bad_tables = good.clone();
        let last = bad_tables.len() - 1;
        bad_tables[last] ^= 0x01;
        assert!(matches!(LpMetadata::parse(&bad_tables), Err(Error::Integrity(_))));
    }

    #[test]
    fn projection_marks_partitions_logical() {
        let raw = build_metadata(&[("vendor_a", ATTR_READONLY, &[(0x2000, Some(4096))])]);
        let metadata = LpMetadata::parse(&raw).unwrap();

        let super_part = Partition::new("super", 0, 1024, 0x100000, 4096);
        let logical = metadata.to_partitions(&super_part);

        assert_eq!(logical.len(), 1);
        assert!(logical[0].flags.logical);
        assert!(logical[0].flags.readonly);
        assert_eq!(logical[0].super_offset, Some(4096 * 512));
    }
}
