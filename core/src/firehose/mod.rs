/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Qualcomm Firehose: the XML-over-bulk storage protocol served by the
//! programmer that Sahara uploads.

mod client;
pub mod xml;

pub use client::{FirehoseClient, PowerAction};
