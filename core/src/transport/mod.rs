/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
#[doc(hidden)]
pub mod mock;
#[cfg(feature = "serial")]
pub mod serial;
#[cfg(feature = "nusb")]
pub mod usb;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};

#[cfg(feature = "serial")]
pub use serial::SerialTransport;
#[cfg(feature = "nusb")]
pub use usb::UsbTransport;

/// An opened byte-stream endpoint to a device.
///
/// Implementations surface device unplug as [`Error::Disconnected`] on the
/// next I/O and a lapsed deadline as [`Error::Timeout`]. Device discovery
/// is the front-end's job; a `Transport` is constructed around an already
/// identified endpoint.
#[async_trait]
pub trait Transport: Send {
    async fn open(&mut self) -> Result<()>;
    async fn close(&mut self) -> Result<()>;

    /// Reads exactly `buf.len()` bytes or fails.
    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> Result<()>;

    /// Reads at most `buf.len()` bytes from a single transfer. Returns the
    /// number of bytes read; zero means the deadline lapsed with nothing
    /// pending.
    async fn read_some(&mut self, buf: &mut [u8], deadline: Duration) -> Result<usize>;

    async fn write_all(&mut self, data: &[u8], deadline: Duration) -> Result<()>;

    /// Discards any buffered inbound bytes.
    async fn drain(&mut self) -> Result<()>;

    /// Cheap liveness probe, polled by idle monitors.
    fn is_alive(&self) -> bool;

    /// Largest single transfer the endpoint accepts.
    fn max_bulk_size(&self) -> usize;

    /// Human-readable endpoint identity for logs.
    fn endpoint_name(&self) -> String;

    /// Changes the line rate. Only meaningful for serial endpoints.
    async fn set_baud(&mut self, _rate: u32) -> Result<()> {
        Err(Error::unsupported("baud-rate change on a non-serial transport"))
    }
}

/// Maps a `tokio::time::timeout` elapse onto the error taxonomy.
pub(crate) fn deadline_lapsed(operation: &str, deadline: Duration) -> Error {
    Error::timeout(operation, deadline)
}
