/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::Duration;

/// Environment variable overriding the default transport read timeout.
pub const READ_TIMEOUT_ENV: &str = "DEVICE_READ_TIMEOUT_MS";

/// Per-operation deadline defaults. Every field is overridable by the
/// front-end; `transport_read` additionally honors `DEVICE_READ_TIMEOUT_MS`.
#[derive(Debug, Clone)]
pub struct Timeouts {
    pub transport_read: Duration,
    pub command_ack: Duration,
    pub sahara_transfer: Duration,
    pub firehose_configure: Duration,
    pub firehose_io: Duration,
    pub fastboot_download: Duration,
    pub reconnect_wait: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        let transport_read = std::env::var(READ_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(5));

        Timeouts {
            transport_read,
            command_ack: Duration::from_secs(15),
            sahara_transfer: Duration::from_secs(30),
            firehose_configure: Duration::from_secs(20),
            firehose_io: Duration::from_secs(60),
            fastboot_download: Duration::from_secs(120),
            reconnect_wait: Duration::from_secs(60),
        }
    }
}
