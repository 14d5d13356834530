/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use nusb::descriptors::TransferType;
use nusb::io::{EndpointRead, EndpointWrite};
use nusb::transfer::{Bulk, Direction, In, Out};
use nusb::{DeviceInfo, Interface};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

use crate::error::{Error, Result};
use crate::transport::{Transport, deadline_lapsed};

const BULK_IN_SZ: usize = 0x80000;
const BULK_OUT_SZ: usize = 0x80000;
/// Inner nusb-level timeout; per-call deadlines are enforced on top.
const ENDPOINT_TIMEOUT: Duration = Duration::from_secs(600);

/// Finds a USB device by vendor/product id and wraps it in a transport.
/// Returns `Ok(None)` when nothing matches.
pub async fn find_usb_device(
    vendor_id: u16,
    product_id: u16,
    interface_number: u8,
) -> Result<Option<UsbTransport>> {
    let devices = nusb::list_devices()
        .await
        .map_err(|e| Error::disconnected(format!("USB enumeration failed: {e}")))?;

    for info in devices {
        if info.vendor_id() == vendor_id && info.product_id() == product_id {
            return Ok(Some(UsbTransport::new(info, interface_number)));
        }
    }

    Ok(None)
}

/// Raw USB bulk-pipe transport over nusb.
///
/// Used unframed for Qualcomm (Sahara/Firehose) and Fastboot; Spreadtrum
/// frames it through the HDLC codec.
pub struct UsbTransport {
    info: DeviceInfo,
    interface_number: u8,
    interface: Option<Interface>,
    reader: Option<EndpointRead<Bulk>>,
    writer: Option<EndpointWrite<Bulk>>,
    ep_in: u8,
    ep_out: u8,
    alive: bool,
}

impl std::fmt::Debug for UsbTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "UsbTransport {{ {:04X}:{:04X}, iface: {}, alive: {} }}",
            self.info.vendor_id(),
            self.info.product_id(),
            self.interface_number,
            self.alive
        )
    }
}

impl UsbTransport {
    pub fn new(info: DeviceInfo, interface_number: u8) -> Self {
        Self {
            info,
            interface_number,
            interface: None,
            reader: None,
            writer: None,
            ep_in: 0,
            ep_out: 0,
            alive: false,
        }
    }

    fn select_endpoints(&mut self, iface: &Interface) -> Result<()> {
        for alt in iface.descriptors() {
            let mut in_ep = None;
            let mut out_ep = None;

            for ep in alt.endpoints() {
                if !matches!(ep.transfer_type(), TransferType::Bulk) {
                    continue;
                }

                match ep.direction() {
                    Direction::In => in_ep = Some(ep.address()),
                    Direction::Out => out_ep = Some(ep.address()),
                }
            }

            if let (Some(i), Some(o)) = (in_ep, out_ep) {
                self.ep_in = i;
                self.ep_out = o;
                return Ok(());
            }
        }

        Err(Error::proto("No bulk endpoints found on the claimed interface"))
    }

    /// Marks the endpoint dead and rewraps an I/O failure as the taxonomy
    /// error that best describes it.
    fn fail(&mut self, err: std::io::Error) -> Error {
        let mapped = Error::from(err);
        if mapped.is_session_fatal() {
            self.alive = false;
        }
        mapped
    }
}

#[async_trait]
impl Transport for UsbTransport {
    async fn open(&mut self) -> Result<()> {
        if self.alive {
            return Ok(());
        }

        let device = self
            .info
            .open()
            .await
            .map_err(|e| Error::disconnected(format!("USB open failed: {e}")))?;
        let iface = device
            .detach_and_claim_interface(self.interface_number)
            .await
            .map_err(|e| Error::disconnected(format!("claim interface failed: {e}")))?;

        self.select_endpoints(&iface)?;

        let ep_in = iface
            .endpoint::<Bulk, In>(self.ep_in)
            .map_err(|e| Error::proto(format!("IN endpoint: {e}")))?;
        let ep_out = iface
            .endpoint::<Bulk, Out>(self.ep_out)
            .map_err(|e| Error::proto(format!("OUT endpoint: {e}")))?;

        self.reader = Some(ep_in.reader(BULK_IN_SZ).with_read_timeout(ENDPOINT_TIMEOUT));
        self.writer = Some(ep_out.writer(BULK_OUT_SZ).with_write_timeout(ENDPOINT_TIMEOUT));
        self.interface = Some(iface);
        self.alive = true;

        debug!("Opened USB endpoint pair IN=0x{:02X} OUT=0x{:02X}", self.ep_in, self.ep_out);

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // nusb releases claimed interfaces on drop
        self.reader = None;
        self.writer = None;
        self.interface = None;
        self.alive = false;
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> Result<()> {
        let reader =
            self.reader.as_mut().ok_or_else(|| Error::disconnected("USB port is not open"))?;
        let result = timeout(deadline, reader.read_exact(buf)).await;

        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => Err(deadline_lapsed("usb read", deadline)),
        }
    }

    async fn read_some(&mut self, buf: &mut [u8], deadline: Duration) -> Result<usize> {
        let reader =
            self.reader.as_mut().ok_or_else(|| Error::disconnected("USB port is not open"))?;
        let result = timeout(deadline, reader.read(buf)).await;

        match result {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => Ok(0),
        }
    }

    async fn write_all(&mut self, data: &[u8], deadline: Duration) -> Result<()> {
        let writer =
            self.writer.as_mut().ok_or_else(|| Error::disconnected("USB port is not open"))?;
        let result = timeout(deadline, async {
            writer.write_all(data).await?;
            writer.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.fail(e)),
            Err(_) => Err(deadline_lapsed("usb write", deadline)),
        }
    }

    async fn drain(&mut self) -> Result<()> {
        let mut scratch = [0u8; 512];
        loop {
            match self.read_some(&mut scratch, Duration::from_millis(20)).await {
                Ok(0) => return Ok(()),
                Ok(_) => continue,
                Err(Error::Timeout { .. }) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    fn max_bulk_size(&self) -> usize {
        BULK_OUT_SZ
    }

    fn endpoint_name(&self) -> String {
        format!("USB {:04X}:{:04X}", self.info.vendor_id(), self.info.product_id())
    }
}
