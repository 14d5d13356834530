/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Qualcomm Sahara: the boot-ROM protocol that uploads a signed Firehose
//! programmer into a device in EDL mode.

mod client;
pub mod cmds;

pub use client::{ChipIdentity, SaharaClient, SaharaState};
pub use cmds::Mode;
