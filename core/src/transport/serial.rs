/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_serial::{SerialPort, SerialPortBuilderExt, SerialStream};

use crate::error::{Error, Result};
use crate::transport::{Transport, deadline_lapsed};

/// Largest write a BROM-side serial endpoint tolerates in one burst.
const SERIAL_MAX_BULK: usize = 0x10000;

/// USB-serial (CDC) transport used by Spreadtrum BROM/FDL endpoints.
pub struct SerialTransport {
    path: String,
    baudrate: u32,
    stream: Option<SerialStream>,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SerialTransport {{ {} @ {} }}", self.path, self.baudrate)
    }
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baudrate: u32) -> Self {
        Self { path: path.into(), baudrate, stream: None }
    }

    fn stream(&mut self) -> Result<&mut SerialStream> {
        self.stream.as_mut().ok_or_else(|| Error::disconnected("serial port is not open"))
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let stream = tokio_serial::new(&self.path, self.baudrate)
            .timeout(Duration::from_secs(1))
            .open_native_async()
            .map_err(|e| Error::disconnected(format!("open {} failed: {e}", self.path)))?;

        debug!("Opened serial port {} @ {}", self.path, self.baudrate);
        self.stream = Some(stream);

        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stream = None;
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> Result<()> {
        let stream = self.stream()?;
        let result = timeout(deadline, stream.read_exact(buf)).await;

        match result {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => {
                self.stream = None;
                Err(Error::from(e))
            }
            Err(_) => Err(deadline_lapsed("serial read", deadline)),
        }
    }

    async fn read_some(&mut self, buf: &mut [u8], deadline: Duration) -> Result<usize> {
        let stream = self.stream()?;
        let result = timeout(deadline, stream.read(buf)).await;

        match result {
            Ok(Ok(n)) => Ok(n),
            Ok(Err(e)) => {
                self.stream = None;
                Err(Error::from(e))
            }
            Err(_) => Ok(0),
        }
    }

    async fn write_all(&mut self, data: &[u8], deadline: Duration) -> Result<()> {
        let stream = self.stream()?;
        let result = timeout(deadline, async {
            stream.write_all(data).await?;
            stream.flush().await
        })
        .await;

        match result {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                self.stream = None;
                Err(Error::from(e))
            }
            Err(_) => Err(deadline_lapsed("serial write", deadline)),
        }
    }

    async fn drain(&mut self) -> Result<()> {
        let mut scratch = [0u8; 256];
        while self.read_some(&mut scratch, Duration::from_millis(20)).await? > 0 {}
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.stream.is_some()
    }

    fn max_bulk_size(&self) -> usize {
        SERIAL_MAX_BULK
    }

    fn endpoint_name(&self) -> String {
        self.path.clone()
    }

    async fn set_baud(&mut self, rate: u32) -> Result<()> {
        let stream = self.stream()?;
        stream
            .set_baud_rate(rate)
            .map_err(|e| Error::proto(format!("baud change to {rate} failed: {e}")))?;
        self.baudrate = rate;
        Ok(())
    }
}
