/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Spreadtrum/Unisoc BSL: HDLC-framed command protocol spoken first by
//! the boot ROM, then by the staged FDL1/FDL2 loaders.

pub mod chips;
mod client;
pub mod cmds;
pub mod hdlc;

pub use chips::{ChipProfile, profile};
pub use client::{BslClient, BslState, FdlStage};
