/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Cinder: a cross-vendor low-level flashing engine for Android devices.
//!
//! Three protocol stacks are spoken natively:
//!
//! - **Fastboot** (bootloader and userspace fastbootd),
//! - **Qualcomm EDL**: Sahara programmer upload followed by Firehose
//!   XML storage access,
//! - **Spreadtrum BSL**: HDLC-framed BROM/FDL1/FDL2 staging.
//!
//! On top of the protocol clients sit the A/B OTA payload extractor, the
//! GPT and dynamic-partition models, and the flash orchestrator that
//! composes everything into a cancellable, progress-reporting
//! multi-partition flash procedure.
//!
//! The crate is a pure library: device discovery, loader lookup and UI
//! are injected by the front-end (see [`orchestrator::DeviceMonitor`],
//! [`auth::AuthStrategy`] and the [`progress::Event`] stream).

#[macro_use]
pub mod utilities;

pub mod auth;
pub mod bsl;
pub mod cancel;
pub mod chipdb;
pub mod error;
pub mod fastboot;
pub mod firehose;
pub mod orchestrator;
pub mod payload;
pub mod progress;
pub mod sahara;
pub mod session;
pub mod sparse;
pub mod storage;
pub mod timeouts;
pub mod transport;
pub mod watchdog;

pub use cancel::CancelToken;
pub use error::{Error, Result};
pub use orchestrator::{FlashOptions, FlashReport, FlashTask, Orchestrator};
pub use progress::{Event, ProgressBus};
pub use session::{FlashTarget, Session, VendorFamily};
pub use timeouts::Timeouts;
