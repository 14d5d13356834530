/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Android Fastboot: the 4-byte-prefixed line protocol spoken by both
//! the bootloader implementation and the userspace daemon (fastbootd).

mod client;

pub use client::{FastbootClient, FastbootFeatures, RebootTarget};
