/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Qualcomm hardware-id to chip-name mapping, loaded from a compiled-in
//! CSV resource so new chips are a data change.

use std::collections::HashMap;
use std::sync::OnceLock;

use log::warn;

const CHIP_CSV: &str = include_str!("../resources/qcom_chips.csv");

fn table() -> &'static HashMap<u32, String> {
    static TABLE: OnceLock<HashMap<u32, String>> = OnceLock::new();

    TABLE.get_or_init(|| {
        let mut map = HashMap::new();
        for (lineno, line) in CHIP_CSV.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((id, name)) = line.split_once(',') else {
                warn!("chip table line {} is malformed: {line}", lineno + 1);
                continue;
            };

            let id = id.trim().trim_start_matches("0x");
            match u32::from_str_radix(id, 16) {
                Ok(id) => {
                    map.insert(id, name.trim().to_string());
                }
                Err(_) => warn!("chip table line {} has a bad id: {line}", lineno + 1),
            }
        }
        map
    })
}

/// Marketing name for a raw MSM id, if the table knows it.
pub fn chip_name(msm_id: u32) -> Option<&'static str> {
    table().get(&msm_id).map(String::as_str)
}

/// Formats an id for display, falling back to hex for unknown chips.
pub fn describe(msm_id: u32) -> String {
    match chip_name(msm_id) {
        Some(name) => format!("{name} (0x{msm_id:08X})"),
        None => format!("unknown chip 0x{msm_id:08X}"),
    }
}
