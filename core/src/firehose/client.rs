/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::firehose::xml::{DeviceElement, ResponseAttrs, build_command, parse_document, split_documents};
use crate::storage::gpt::{GptHeader, parse_entries};
use crate::storage::{Partition, PartitionTable, StorageKind};
use crate::timeouts::Timeouts;
use crate::transport::Transport;

/// Payload size we open negotiations with; devices commonly talk us down.
const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;
/// Upper bound for one device response burst.
const RX_CHUNK: usize = 0x8000;
/// RSA-2048 signature length expected by the VIP ritual.
const VIP_SIGNATURE_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Reset,
    Off,
    Edl,
}

impl PowerAction {
    fn value(&self) -> &'static str {
        match self {
            PowerAction::Reset => "reset",
            PowerAction::Off => "off",
            PowerAction::Edl => "edl",
        }
    }
}

/// Firehose client: XML RPC over the bulk pipe left behind by Sahara.
pub struct FirehoseClient {
    transport: Box<dyn Transport>,
    timeouts: Timeouts,
    cancel: CancelToken,
    storage: StorageKind,
    max_payload: usize,
    configured: bool,
    vip_granted: bool,
    /// Bytes received but not yet consumed as XML or raw data.
    pending: Vec<u8>,
    /// Responses parsed ahead of their consumer.
    inbox: VecDeque<ResponseAttrs>,
}

impl FirehoseClient {
    pub fn new(
        transport: Box<dyn Transport>,
        storage: StorageKind,
        timeouts: Timeouts,
        cancel: CancelToken,
    ) -> Self {
        FirehoseClient {
            transport,
            timeouts,
            cancel,
            storage,
            max_payload: DEFAULT_MAX_PAYLOAD,
            configured: false,
            vip_granted: false,
            pending: Vec::new(),
            inbox: VecDeque::new(),
        }
    }

    pub fn storage(&self) -> StorageKind {
        self.storage
    }

    pub fn sector_size(&self) -> u32 {
        self.storage.sector_size()
    }

    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Whether the VIP ritual elevated this session.
    pub fn vip_granted(&self) -> bool {
        self.vip_granted
    }

    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    async fn send_command(&mut self, name: &str, attrs: &[(&str, String)]) -> Result<()> {
        self.cancel.check()?;
        let doc = build_command(name, attrs)?;
        debug!("[TX] <{name}> {} bytes", doc.len());
        self.transport.write_all(&doc, self.timeouts.command_ack).await
    }

    /// Pulls device bytes until a `<response>` arrives. Interleaved
    /// `<log>` elements are reported at debug level and skipped.
    async fn read_response(&mut self, deadline: Duration) -> Result<ResponseAttrs> {
        let started = Instant::now();

        loop {
            if let Some(resp) = self.inbox.pop_front() {
                return Ok(resp);
            }

            self.drain_pending_documents()?;
            if !self.inbox.is_empty() {
                continue;
            }

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(Error::timeout("firehose response", deadline));
            }

            let mut buf = vec![0u8; RX_CHUNK];
            let window = (deadline - elapsed).min(self.timeouts.transport_read);
            let n = self.transport.read_some(&mut buf, window).await?;
            if n > 0 {
                self.pending.extend_from_slice(&buf[..n]);
            }
        }
    }

    fn drain_pending_documents(&mut self) -> Result<()> {
        let (docs, rest) = split_documents(&self.pending);
        if docs.is_empty() {
            return Ok(());
        }

        let owned: Vec<Vec<u8>> = docs.into_iter().map(|d| d.to_vec()).collect();
        self.pending = rest.to_vec();

        for doc in owned {
            for element in parse_document(&doc)? {
                match element {
                    DeviceElement::Log(msg) => debug!("firehose log: {msg}"),
                    DeviceElement::Response(resp) => self.inbox.push_back(resp),
                }
            }
        }

        Ok(())
    }

    /// Reads raw sector bytes, consuming any buffered remainder first.
    async fn read_raw(&mut self, buf: &mut [u8], deadline: Duration) -> Result<()> {
        let from_pending = self.pending.len().min(buf.len());
        if from_pending > 0 {
            buf[..from_pending].copy_from_slice(&self.pending[..from_pending]);
            self.pending.drain(..from_pending);
        }

        if from_pending < buf.len() {
            self.transport.read_exact(&mut buf[from_pending..], deadline).await?;
        }

        Ok(())
    }

    async fn expect_ack(&mut self, what: &str, deadline: Duration) -> Result<ResponseAttrs> {
        let resp = self.read_response(deadline).await?;
        if !resp.ack {
            return Err(Error::proto(format!("{what} was NAKed by the device")));
        }
        Ok(resp)
    }

    fn sector_attrs(&self, lun: u32, start: u64, count: u64) -> Vec<(&'static str, String)> {
        vec![
            ("SECTOR_SIZE_IN_BYTES", self.sector_size().to_string()),
            ("num_partition_sectors", count.to_string()),
            ("physical_partition_number", lun.to_string()),
            ("start_sector", start.to_string()),
        ]
    }

    /// Issues `<configure>`; on NAK the device reports the payload size it
    /// can actually take and the command is re-issued once with it.
    pub async fn configure(&mut self) -> Result<()> {
        let mut payload = self.max_payload;

        for attempt in 0..2 {
            let attrs = vec![
                ("MemoryName", self.storage.to_string()),
                ("Verbose", "0".to_string()),
                ("AlwaysValidate", "0".to_string()),
                ("MaxDigestTableSizeInBytes", "8192".to_string()),
                ("MaxPayloadSizeToTargetInBytes", payload.to_string()),
                ("ZlpAwareHost", "1".to_string()),
                ("SkipStorageInit", "0".to_string()),
            ];

            self.send_command("configure", &attrs).await?;
            let resp = self.read_response(self.timeouts.firehose_configure).await?;

            if resp.ack {
                // Some programmers advertise a bigger supported size; take it.
                if let Some(supported) =
                    resp.get_u64("MaxPayloadSizeToTargetInBytesSupported")
                {
                    payload = payload.max(supported as usize);
                }
                self.max_payload = payload;
                self.configured = true;
                info!("Firehose configured: {} storage, {} byte payloads", self.storage, payload);
                return Ok(());
            }

            match resp.get_u64("MaxPayloadSizeToTargetInBytes") {
                Some(negotiated) if attempt == 0 => {
                    info!("configure NAKed, renegotiating payload size to {negotiated}");
                    payload = negotiated as usize;
                }
                _ => break,
            }
        }

        Err(Error::proto("device refused <configure> even after renegotiation"))
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.configured {
            Ok(())
        } else {
            Err(Error::internal("Firehose operation before <configure>"))
        }
    }

    /// Streams `count` sectors into `writer`.
    pub async fn read_sectors_to(
        &mut self,
        lun: u32,
        start: u64,
        count: u64,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
        progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<()> {
        self.ensure_configured()?;

        let attrs = self.sector_attrs(lun, start, count);
        self.send_command("read", &attrs).await?;
        self.expect_ack("<read>", self.timeouts.firehose_io).await?;

        let total = count * self.sector_size() as u64;
        let mut done = 0u64;
        let mut chunk = vec![0u8; self.max_payload];

        while done < total {
            self.cancel.check()?;
            let n = chunk.len().min((total - done) as usize);
            self.read_raw(&mut chunk[..n], self.timeouts.firehose_io).await?;
            writer.write_all(&chunk[..n]).await?;
            done += n as u64;
            progress(done, total);
        }
        writer.flush().await?;

        self.expect_ack("<read> completion", self.timeouts.firehose_io).await?;
        Ok(())
    }

    /// Convenience wrapper collecting a sector read in memory.
    pub async fn read_sectors(&mut self, lun: u32, start: u64, count: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity((count * self.sector_size() as u64) as usize);
        let mut progress = |_: u64, _: u64| {};
        self.read_sectors_to(lun, start, count, &mut out, &mut progress).await?;
        Ok(out)
    }

    /// Programs `size` bytes from `reader` starting at `start`. The final
    /// sector is zero-padded.
    pub async fn program(
        &mut self,
        lun: u32,
        start: u64,
        size: u64,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<()> {
        self.ensure_configured()?;

        let sector_size = self.sector_size() as u64;
        let count = size.div_ceil(sector_size);
        let padded = count * sector_size;

        let attrs = self.sector_attrs(lun, start, count);
        self.send_command("program", &attrs).await?;
        self.expect_ack("<program>", self.timeouts.firehose_io).await?;

        let mut sent = 0u64;
        let mut chunk = vec![0u8; self.max_payload];

        while sent < padded {
            self.cancel.check()?;

            let want = chunk.len().min((padded - sent) as usize);
            let mut filled = 0usize;
            while filled < want && sent + (filled as u64) < size {
                let readable = want.min((size - sent) as usize);
                let n = reader.read(&mut chunk[filled..readable]).await?;
                if n == 0 {
                    return Err(Error::user_input(format!(
                        "image stream ended {} bytes short",
                        size - sent - filled as u64
                    )));
                }
                filled += n;
            }
            chunk[filled..want].fill(0);

            self.transport.write_all(&chunk[..want], self.timeouts.firehose_io).await?;
            sent += want as u64;
            progress(sent.min(size), size);
        }

        self.expect_ack("<program> completion", self.timeouts.firehose_io).await?;
        Ok(())
    }

    pub async fn erase(&mut self, lun: u32, start: u64, count: u64) -> Result<()> {
        self.ensure_configured()?;

        let attrs = self.sector_attrs(lun, start, count);
        self.send_command("erase", &attrs).await?;
        self.expect_ack("<erase>", self.timeouts.firehose_io).await?;
        Ok(())
    }

    /// Applies a disk patch (the `<patch>` element of patch XMLs).
    pub async fn patch(
        &mut self,
        lun: u32,
        start_sector: u64,
        byte_offset: u64,
        size_in_bytes: u32,
        value: &str,
    ) -> Result<()> {
        self.ensure_configured()?;

        let attrs = vec![
            ("SECTOR_SIZE_IN_BYTES", self.sector_size().to_string()),
            ("byte_offset", byte_offset.to_string()),
            ("filename", "DISK".to_string()),
            ("physical_partition_number", lun.to_string()),
            ("size_in_bytes", size_in_bytes.to_string()),
            ("start_sector", start_sector.to_string()),
            ("value", value.to_string()),
        ];

        self.send_command("patch", &attrs).await?;
        self.expect_ack("<patch>", self.timeouts.firehose_io).await?;
        Ok(())
    }

    /// Marks a LUN bootable (UFS boot LUN selection).
    pub async fn set_bootable_storage_drive(&mut self, lun: u32) -> Result<()> {
        self.ensure_configured()?;

        self.send_command("setbootablestoragedrive", &[("value", lun.to_string())]).await?;
        self.expect_ack("<setbootablestoragedrive>", self.timeouts.command_ack).await?;
        info!("LUN {lun} marked bootable");
        Ok(())
    }

    /// Power control. The device usually detaches before answering, so a
    /// missing response is not an error.
    pub async fn power(&mut self, action: PowerAction) -> Result<()> {
        self.send_command("power", &[("value", action.value().to_string())]).await?;

        match self.read_response(Duration::from_secs(2)).await {
            Ok(resp) if !resp.ack => warn!("power {:?} NAKed", action),
            Ok(_) => {}
            Err(Error::Timeout { .. }) => {}
            Err(e) => return Err(e),
        }

        Ok(())
    }

    /// Pre-configure VIP elevation: `<nop value="sig"/>` framing, then
    /// the digest table, then the RSA-2048 signature.
    ///
    /// A NAK downgrades to normal privilege and is not fatal.
    pub async fn vip_auth(&mut self, digest_table: &[u8], signature: &[u8]) -> Result<bool> {
        if signature.len() != VIP_SIGNATURE_LEN {
            return Err(Error::user_input(format!(
                "VIP signature must be {VIP_SIGNATURE_LEN} bytes, got {}",
                signature.len()
            )));
        }

        self.send_command("nop", &[("value", "sig".to_string())]).await?;
        let resp = self.read_response(self.timeouts.command_ack).await?;
        if !resp.ack {
            warn!("device refused the VIP framing, continuing unprivileged");
            return Ok(false);
        }

        self.transport.write_all(digest_table, self.timeouts.firehose_io).await?;
        self.transport.write_all(signature, self.timeouts.firehose_io).await?;

        let resp = self.read_response(self.timeouts.command_ack).await?;
        if resp.ack {
            self.vip_granted = true;
            info!("VIP privilege granted");
            Ok(true)
        } else {
            warn!("VIP signature rejected, continuing unprivileged");
            Ok(false)
        }
    }

    /// Reads and validates the GPT of one LUN, falling back to the backup
    /// copy when the primary is damaged. `total_sectors` enables the
    /// fallback even when the primary header is unreadable.
    pub async fn gpt_read(
        &mut self,
        lun: u32,
        total_sectors: Option<u64>,
    ) -> Result<PartitionTable> {
        self.ensure_configured()?;
        let ss = self.sector_size();

        let primary = async {
            let sector = self.read_sectors(lun, 1, 1).await?;
            let header = GptHeader::parse(&sector)?;
            self.read_gpt_entries(lun, &header).await
        }
        .await;

        let parts = match primary {
            Ok(parts) => parts,
            Err(e @ Error::Integrity(_)) => {
                warn!("primary GPT on LUN {lun} is damaged ({e}), trying backup");
                let backup_lba = match self.try_backup_lba(lun).await {
                    Some(lba) => lba,
                    None => total_sectors.map(|t| t - 1).ok_or(e)?,
                };

                let sector = self.read_sectors(lun, backup_lba, 1).await?;
                let header = GptHeader::parse(&sector)?;
                self.read_gpt_entries(lun, &header).await?
            }
            Err(e) => return Err(e),
        };

        let mut table = PartitionTable::new();
        for mut p in parts {
            p.sector_size = ss;
            table.insert(p);
        }

        info!("LUN {lun}: {} partitions", table.len());
        Ok(table)
    }

    /// Backup header location from the primary header, when that much of
    /// the primary still parses.
    async fn try_backup_lba(&mut self, lun: u32) -> Option<u64> {
        let sector = self.read_sectors(lun, 1, 1).await.ok()?;
        GptHeader::parse(&sector).ok().map(|h| h.backup_lba)
    }

    async fn read_gpt_entries(&mut self, lun: u32, header: &GptHeader) -> Result<Vec<Partition>> {
        let ss = self.sector_size();
        let sectors = (header.entries_len() as u64).div_ceil(ss as u64);
        let data = self.read_sectors(lun, header.entries_lba, sectors).await?;
        parse_entries(header, &data, ss, lun)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn response(body: &str) -> Vec<u8> {
        format!("<?xml version=\"1.0\" encoding=\"UTF-8\" ?><data>{body}</data>\0").into_bytes()
    }

    fn ack() -> Vec<u8> {
        response(r#"<response value="ACK" rawmode="false" />"#)
    }

    fn ack_raw() -> Vec<u8> {
        response(r#"<response value="ACK" rawmode="true" />"#)
    }

    fn client(mock: MockTransport, storage: StorageKind) -> FirehoseClient {
        FirehoseClient::new(Box::new(mock), storage, Timeouts::default(), CancelToken::new())
    }

    fn configured(mock: MockTransport, storage: StorageKind) -> FirehoseClient {
        let mut c = client(mock, storage);
        c.configured = true;
        c.max_payload = 16384;
        c
    }

    #[tokio::test]
    async fn configure_renegotiates_on_nak() {
        let nak = response(
            r#"<response value="NAK" MaxPayloadSizeToTargetInBytes="16384" />"#,
        );

        let mock = MockTransport::new().loose().reply(&nak).reply(&ack());
        let mut fh = client(mock, StorageKind::Ufs);
        fh.configure().await.unwrap();

        assert_eq!(fh.max_payload(), 16384);
    }

    #[tokio::test]
    async fn configure_fails_when_nak_has_no_counterproposal() {
        let mock = MockTransport::new()
            .loose()
            .reply(&response(r#"<response value="NAK" />"#));

        let mut fh = client(mock, StorageKind::Ufs);
        assert!(matches!(fh.configure().await, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn read_sectors_streams_exactly_the_payload() {
        let data = vec![0x5A; 2 * 4096];
        let mock = MockTransport::new()
            .loose()
            .reply(&ack_raw())
            .reply(&data)
            .reply(&ack());

        let mut fh = configured(mock, StorageKind::Ufs);
        let out = fh.read_sectors(0, 8, 2).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn program_pads_the_final_sector() {
        let image = vec![0xA1u8; 512 + 100]; // 2 eMMC sectors, 412 pad bytes

        let mock = MockTransport::new()
            .loose()
            .reply(&ack_raw())
            .reply(&ack());

        let mut fh = configured(mock, StorageKind::Emmc);
        let mut reader: &[u8] = &image;
        let mut progress = |_: u64, _: u64| {};
        fh.program(0, 100, image.len() as u64, &mut reader, &mut progress).await.unwrap();
    }

    #[tokio::test]
    async fn nak_on_erase_is_fatal_for_the_operation() {
        let mock = MockTransport::new()
            .loose()
            .reply(&response(r#"<response value="NAK" />"#));

        let mut fh = configured(mock, StorageKind::Ufs);
        let err = fh.erase(0, 0, 16).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn logs_are_skipped_while_waiting_for_the_response() {
        let doc = response(
            r#"<log value="INFO: first" /><log value="INFO: second" /><response value="ACK" />"#,
        );

        let mock = MockTransport::new().loose().reply(&doc);
        let mut fh = configured(mock, StorageKind::Ufs);
        fh.erase(0, 0, 1).await.unwrap();
    }

    #[tokio::test]
    async fn vip_nak_downgrades_without_failing() {
        let mock = MockTransport::new()
            .loose()
            .reply(&ack())
            .reply(&response(r#"<response value="NAK" />"#));

        let mut fh = client(mock, StorageKind::Ufs);
        let granted = fh.vip_auth(&[0u8; 64], &[0u8; 256]).await.unwrap();
        assert!(!granted);
        assert!(!fh.vip_granted());
    }

    #[tokio::test]
    async fn gpt_read_parses_a_valid_primary() {
        use crate::storage::gpt::testdata::{GptSpec, build_disk};

        let disk = build_disk(&GptSpec {
            sector_size: 4096,
            total_sectors: 128,
            parts: &[("xbl_a", 6, 13), ("boot_a", 14, 29)],
        });
        let ss = 4096usize;

        // Header read, then a 4-sector entries read.
        let mock = MockTransport::new()
            .loose()
            .reply(&ack_raw())
            .reply(&disk[ss..2 * ss])
            .reply(&ack())
            .reply(&ack_raw())
            .reply(&disk[2 * ss..6 * ss])
            .reply(&ack());

        let mut fh = configured(mock, StorageKind::Ufs);
        let table = fh.gpt_read(0, None).await.unwrap();
        assert_eq!(table.len(), 2);
        assert!(table.find("boot_a").is_some());
    }

    #[tokio::test]
    async fn gpt_read_falls_back_to_backup_entries() {
        use crate::storage::gpt::testdata::{GptSpec, build_disk};

        let disk = build_disk(&GptSpec {
            sector_size: 4096,
            total_sectors: 128,
            parts: &[("boot_a", 6, 13)],
        });
        let ss = 4096usize;

        // Corrupt the primary entries array only.
        let mut damaged = disk.clone();
        damaged[2 * ss] ^= 0xFF;

        let backup_entries_off = 123 * ss;
        let mock = MockTransport::new()
            .loose()
            // primary header + damaged entries
            .reply(&ack_raw())
            .reply(&damaged[ss..2 * ss])
            .reply(&ack())
            .reply(&ack_raw())
            .reply(&damaged[2 * ss..6 * ss])
            .reply(&ack())
            // re-read of the primary header for the backup LBA
            .reply(&ack_raw())
            .reply(&damaged[ss..2 * ss])
            .reply(&ack())
            // backup header + clean entries
            .reply(&ack_raw())
            .reply(&damaged[127 * ss..128 * ss])
            .reply(&ack())
            .reply(&ack_raw())
            .reply(&damaged[backup_entries_off..backup_entries_off + 4 * ss])
            .reply(&ack());

        let mut fh = configured(mock, StorageKind::Ufs);
        let table = fh.gpt_read(0, None).await.unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.find("boot_a").is_some());
    }
}
