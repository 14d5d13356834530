/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
pub mod gpt;
pub mod lp;

use std::collections::BTreeMap;

/// Kind of backing storage behind the currently selected protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageKind {
    #[default]
    Unknown,
    Emmc,
    Ufs,
    Nor,
    Nand,
}

impl StorageKind {
    /// Native sector size of the storage family.
    pub fn sector_size(&self) -> u32 {
        match self {
            StorageKind::Ufs => 4096,
            _ => 512,
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StorageKind::Unknown => "unknown",
            StorageKind::Emmc => "emmc",
            StorageKind::Ufs => "ufs",
            StorageKind::Nor => "nor",
            StorageKind::Nand => "nand",
        };
        f.write_str(name)
    }
}

/// A/B slot selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Slot {
    A,
    B,
    #[default]
    None,
}

impl Slot {
    /// Partition-name suffix for this slot, empty for non-A/B.
    pub fn suffix(&self) -> &'static str {
        match self {
            Slot::A => "_a",
            Slot::B => "_b",
            Slot::None => "",
        }
    }

    pub fn other(&self) -> Slot {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
            Slot::None => Slot::None,
        }
    }

    /// Parses fastboot's `current-slot` style values (`a`, `b`, `_a`...).
    pub fn parse(value: &str) -> Slot {
        match value.trim_start_matches('_') {
            "a" => Slot::A,
            "b" => Slot::B,
            _ => Slot::None,
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::A => f.write_str("a"),
            Slot::B => f.write_str("b"),
            Slot::None => f.write_str("none"),
        }
    }
}

/// Flags refined from partition tables and metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PartitionFlags {
    /// Lives inside `super`, addressed through LP metadata.
    pub logical: bool,
    /// Modem-family partition, staged separately by the orchestrator.
    pub modem: bool,
    /// Carries an `_a`/`_b` replica.
    pub ab_replicated: bool,
    /// Best guess that the device refuses writes.
    pub readonly: bool,
}

/// Names the orchestrator treats as modem-family.
pub const MODEM_PARTITIONS: &[&str] =
    &["modem", "modem_a", "modem_b", "md1img", "persist", "nv_data"];

pub fn is_modem_partition(name: &str) -> bool {
    MODEM_PARTITIONS.iter().any(|m| name.eq_ignore_ascii_case(m))
}

/// A partition as addressed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    /// LUN index on multi-LUN (UFS) storage, 0 elsewhere.
    pub lun: u32,
    pub start_sector: u64,
    pub num_sectors: u64,
    pub sector_size: u32,
    pub flags: PartitionFlags,
    /// Byte offset inside `super` for logical partitions.
    pub super_offset: Option<u64>,
}

impl Partition {
    pub fn new(name: impl Into<String>, lun: u32, start_sector: u64, num_sectors: u64, sector_size: u32) -> Self {
        let name = name.into();
        let flags = PartitionFlags {
            modem: is_modem_partition(&name),
            ab_replicated: name.ends_with("_a") || name.ends_with("_b"),
            ..Default::default()
        };

        Partition { name, lun, start_sector, num_sectors, sector_size, flags, super_offset: None }
    }

    pub fn size_bytes(&self) -> u64 {
        self.num_sectors * self.sector_size as u64
    }

    /// Base name with any slot suffix removed.
    pub fn base_name(&self) -> &str {
        self.name
            .strip_suffix("_a")
            .or_else(|| self.name.strip_suffix("_b"))
            .unwrap_or(&self.name)
    }
}

/// Case-insensitive partition directory, unique per (LUN, name).
#[derive(Debug, Clone, Default)]
pub struct PartitionTable {
    entries: BTreeMap<(u32, String), Partition>,
}

impl PartitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_partitions(parts: impl IntoIterator<Item = Partition>) -> Self {
        let mut table = Self::new();
        for p in parts {
            table.insert(p);
        }
        table
    }

    pub fn insert(&mut self, partition: Partition) {
        self.entries.insert((partition.lun, partition.name.to_ascii_lowercase()), partition);
    }

    /// Finds a partition by name on any LUN.
    pub fn find(&self, name: &str) -> Option<&Partition> {
        let key = name.to_ascii_lowercase();
        self.entries.iter().find(|((_, n), _)| *n == key).map(|(_, p)| p)
    }

    pub fn find_on_lun(&self, lun: u32, name: &str) -> Option<&Partition> {
        self.entries.get(&(lun, name.to_ascii_lowercase()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Partition> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the table carries both replicas of at least one name.
    pub fn is_ab(&self) -> bool {
        self.entries.values().any(|p| {
            p.name.ends_with("_a")
                && self.find(&format!("{}_b", p.base_name())).is_some()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_suffix_and_flip() {
        assert_eq!(Slot::A.suffix(), "_a");
        assert_eq!(Slot::B.other(), Slot::A);
        assert_eq!(Slot::parse("_b"), Slot::B);
        assert_eq!(Slot::parse("x"), Slot::None);
    }

    #[test]
    fn lookup_is_case_insensitive_and_per_lun() {
        let mut table = PartitionTable::new();
        table.insert(Partition::new("Boot_A", 0, 1024, 2048, 4096));
        table.insert(Partition::new("boot_b", 0, 4096, 2048, 4096));
        table.insert(Partition::new("xbl", 1, 6, 1000, 4096));

        assert!(table.find("BOOT_a").is_some());
        assert!(table.find_on_lun(1, "XBL").is_some());
        assert!(table.find_on_lun(0, "xbl").is_none());
        assert!(table.is_ab());
    }

    #[test]
    fn modem_family_flags_are_inferred() {
        assert!(Partition::new("modem_a", 0, 0, 1, 512).flags.modem);
        assert!(Partition::new("NV_DATA", 0, 0, 1, 512).flags.modem);
        assert!(!Partition::new("system_a", 0, 0, 1, 512).flags.modem);
    }

    #[test]
    fn base_name_strips_slot_suffix() {
        assert_eq!(Partition::new("vendor_b", 0, 0, 1, 512).base_name(), "vendor");
        assert_eq!(Partition::new("userdata", 0, 0, 1, 512).base_name(), "userdata");
    }

    #[test]
    fn storage_kind_sector_sizes() {
        assert_eq!(StorageKind::Ufs.sector_size(), 4096);
        assert_eq!(StorageKind::Emmc.sector_size(), 512);
    }
}
