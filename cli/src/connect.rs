/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Session establishment from command-line arguments: endpoint parsing,
//! the USB reconnect monitor, and per-mode connect sequences.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clap::{Args, ValueEnum};
use log::info;

use cinder::auth::AuthStrategy;
use cinder::error::{Error, Result};
use cinder::orchestrator::DeviceMonitor;
use cinder::storage::StorageKind;
use cinder::transport::Transport;
use cinder::{CancelToken, ProgressBus, Session, Timeouts};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Fastboot,
    Edl,
    Bsl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StorageArg {
    Emmc,
    Ufs,
}

impl From<StorageArg> for StorageKind {
    fn from(value: StorageArg) -> Self {
        match value {
            StorageArg::Emmc => StorageKind::Emmc,
            StorageArg::Ufs => StorageKind::Ufs,
        }
    }
}

/// Connection flags shared by every subcommand.
#[derive(Args, Debug)]
pub struct DeviceArgs {
    /// Device endpoint: USB `vid:pid` in hex, or a serial port path
    #[arg(short, long)]
    pub device: String,
    /// Protocol family to connect with
    #[arg(short, long, value_enum)]
    pub mode: Mode,
    /// USB interface number to claim
    #[arg(long, default_value_t = 0)]
    pub interface: u8,
    /// EDL: Firehose programmer image uploaded over Sahara
    #[arg(long, value_name = "FILE")]
    pub loader: Option<PathBuf>,
    /// EDL: storage backing the device
    #[arg(long, value_enum, default_value_t = StorageArg::Ufs)]
    pub storage: StorageArg,
    /// EDL: VIP digest-table blob for privileged access
    #[arg(long, value_name = "FILE")]
    pub vip_digests: Option<PathBuf>,
    /// EDL: VIP RSA signature blob
    #[arg(long, value_name = "FILE")]
    pub vip_signature: Option<PathBuf>,
    /// BSL: FDL1 loader image
    #[arg(long, value_name = "FILE")]
    pub fdl1: Option<PathBuf>,
    /// BSL: FDL2 loader image
    #[arg(long, value_name = "FILE")]
    pub fdl2: Option<PathBuf>,
    /// BSL: chip profile name (e.g. sc9863a)
    #[arg(long)]
    pub chip: Option<String>,
}

/// Parses `vid:pid` hex endpoint syntax.
fn parse_usb_id(device: &str) -> Option<(u16, u16)> {
    let (vid, pid) = device.split_once(':')?;
    Some((
        u16::from_str_radix(vid.trim_start_matches("0x"), 16).ok()?,
        u16::from_str_radix(pid.trim_start_matches("0x"), 16).ok()?,
    ))
}

pub async fn open_transport(device: &str, interface: u8) -> Result<Box<dyn Transport>> {
    if let Some((vid, pid)) = parse_usb_id(device) {
        let transport = cinder::transport::usb::find_usb_device(vid, pid, interface)
            .await?
            .ok_or_else(|| {
                Error::user_input(format!("no USB device {vid:04X}:{pid:04X} connected"))
            })?;
        return Ok(Box::new(transport));
    }

    #[cfg(feature = "serial")]
    if device.starts_with("/dev/") || device.starts_with("COM") {
        return Ok(Box::new(cinder::transport::SerialTransport::new(device, 115_200)));
    }

    Err(Error::user_input(format!(
        "'{device}' is neither a vid:pid pair nor a supported serial port"
    )))
}

/// Reconnect source polling the USB bus for the configured endpoint.
pub struct UsbMonitor {
    vid: u16,
    pid: u16,
    interface: u8,
}

impl UsbMonitor {
    /// Only `vid:pid` endpoints can be re-found after a reboot.
    pub fn for_device(args: &DeviceArgs) -> Option<Self> {
        parse_usb_id(&args.device).map(|(vid, pid)| UsbMonitor {
            vid,
            pid,
            interface: args.interface,
        })
    }
}

#[async_trait]
impl DeviceMonitor for UsbMonitor {
    async fn wait_for_device(&self, timeout: Duration) -> Result<Box<dyn Transport>> {
        const POLL_INTERVAL: Duration = Duration::from_secs(5);
        let started = Instant::now();

        loop {
            if let Some(transport) =
                cinder::transport::usb::find_usb_device(self.vid, self.pid, self.interface)
                    .await?
            {
                info!("device {:04X}:{:04X} is back", self.vid, self.pid);
                return Ok(Box::new(transport));
            }

            if started.elapsed() + POLL_INTERVAL > timeout {
                return Err(Error::timeout("reconnect wait", timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

async fn read_required(path: &Option<PathBuf>, what: &str) -> Result<Vec<u8>> {
    let path = path
        .as_ref()
        .ok_or_else(|| Error::user_input(format!("{what} is required for this mode")))?;
    tokio::fs::read(path)
        .await
        .map_err(|e| Error::user_input(format!("{}: {e}", path.display())))
}

/// Builds the auth strategy from the supplied blobs.
pub async fn auth_strategy(args: &DeviceArgs) -> Result<AuthStrategy> {
    match (&args.vip_digests, &args.vip_signature) {
        (Some(digests), Some(signature)) => Ok(AuthStrategy::VipDigestSignature {
            digest_table: tokio::fs::read(digests)
                .await
                .map_err(|e| Error::user_input(format!("{}: {e}", digests.display())))?,
            signature: tokio::fs::read(signature)
                .await
                .map_err(|e| Error::user_input(format!("{}: {e}", signature.display())))?,
        }),
        (None, None) => Ok(AuthStrategy::None),
        _ => Err(Error::user_input(
            "--vip-digests and --vip-signature must be given together",
        )),
    }
}

/// Opens the transport and runs the per-mode connect sequence.
pub async fn establish(
    args: &DeviceArgs,
    timeouts: Timeouts,
    cancel: CancelToken,
    bus: &ProgressBus,
) -> Result<Session> {
    let transport = open_transport(&args.device, args.interface).await?;

    match args.mode {
        Mode::Fastboot => Session::connect_fastboot(transport, timeouts, cancel, bus).await,
        Mode::Edl => {
            let programmer = read_required(&args.loader, "--loader").await?;
            let auth = auth_strategy(args).await?;

            Session::connect_edl(
                transport,
                &programmer,
                args.storage.into(),
                &auth,
                timeouts,
                cancel,
                bus,
            )
            .await
        }
        Mode::Bsl => {
            let chip_name = args
                .chip
                .as_deref()
                .ok_or_else(|| Error::user_input("--chip is required for BSL mode"))?;
            let chip = cinder::bsl::profile(chip_name).ok_or_else(|| {
                Error::user_input(format!("unknown chip '{chip_name}'; see the profile table"))
            })?;

            let fdl1 = read_required(&args.fdl1, "--fdl1").await?;
            let fdl2 = read_required(&args.fdl2, "--fdl2").await?;

            Session::connect_bsl(transport, chip, &fdl1, &fdl2, timeouts, cancel, bus).await
        }
    }
}
