/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! A/B OTA payload (`payload.bin`) parsing and per-partition extraction,
//! local or streamed over HTTP ranges.

mod bspatch;
mod extract;
pub mod manifest;
pub mod source;

pub use bspatch::bspatch;
pub use extract::PayloadExtractor;
pub use manifest::{Manifest, OpType, PayloadHeader, PayloadPartition};
pub use source::{BlobSource, FileSource, HttpSource, MemorySource};
