/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/

/// Read a `u16` from a byte slice at the given offset, little-endian.
#[macro_export]
macro_rules! le_u16 {
    ($data:expr, $offset:expr) => {
        u16::from_le_bytes($data[$offset..$offset + 2].try_into().unwrap())
    };
}

/// Read a `u32` from a byte slice at the given offset, little-endian.
#[macro_export]
macro_rules! le_u32 {
    ($data:expr, $offset:expr) => {
        u32::from_le_bytes($data[$offset..$offset + 4].try_into().unwrap())
    };
}

/// Read a `u64` from a byte slice at the given offset, little-endian.
#[macro_export]
macro_rules! le_u64 {
    ($data:expr, $offset:expr) => {
        u64::from_le_bytes($data[$offset..$offset + 8].try_into().unwrap())
    };
}

/// Encodes a name as UTF-16LE into a fixed number of code units,
/// NUL-padded. Longer names are truncated.
pub fn utf16le_fixed(name: &str, units: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(units * 2);
    for unit in name.encode_utf16().take(units) {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.resize(units * 2, 0);
    out
}

/// Decodes a NUL-terminated UTF-16LE name from a fixed-size field.
pub fn utf16le_name(field: &[u8]) -> String {
    let units: Vec<u16> = field
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .take_while(|&u| u != 0)
        .collect();
    String::from_utf16_lossy(&units)
}

/// Read a `u32` from a byte slice at the given offset, big-endian.
#[macro_export]
macro_rules! be_u32 {
    ($data:expr, $offset:expr) => {
        u32::from_be_bytes($data[$offset..$offset + 4].try_into().unwrap())
    };
}

/// Read a `u64` from a byte slice at the given offset, big-endian.
#[macro_export]
macro_rules! be_u64 {
    ($data:expr, $offset:expr) => {
        u64::from_be_bytes($data[$offset..$offset + 8].try_into().unwrap())
    };
}
