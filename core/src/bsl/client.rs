/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::bsl::cmds::{CHECK_BAUD, Command, Response};
use crate::bsl::hdlc::{DecodeEvent, Frame, FrameDecoder, FrameEncoder};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::sparse::{self, SparseReader};
use crate::storage::{Partition, PartitionTable};
use crate::timeouts::Timeouts;
use crate::transport::Transport;
use crate::utilities::{utf16le_fixed, utf16le_name};

/// Chunk size for loader staging. The boot ROM's receive window is tiny.
const LOAD_CHUNK: usize = 0x840;
/// Default chunk size for partition transfers once a loader runs.
const DEFAULT_MAX_XFER: usize = 0x1_0000;
/// Partition reads are requested in spans of this many bytes.
const READ_CHUNK: usize = 0x8000;
/// Attempts of the CHECK_BAUD probe burst before giving up.
const HANDSHAKE_ATTEMPTS: u32 = 64;
/// Resend attempts for one command whose ACK went missing.
const COMMAND_RETRIES: u32 = 3;
/// Consecutive CRC failures that abort the transfer.
const MAX_CRC_FAILURES: u32 = 3;

/// Partition-name field width in UTF-16 code units.
const NAME_UNITS: usize = 36;
/// Partition-table entry: 72-byte UTF-16LE name + u32 LE sector count.
const TABLE_ENTRY_LEN: usize = NAME_UNITS * 2 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BslState {
    Disconnected,
    Brom,
    Fdl1,
    Fdl2,
    Error,
}

impl std::fmt::Display for BslState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BslState::Disconnected => "disconnected",
            BslState::Brom => "brom",
            BslState::Fdl1 => "fdl1",
            BslState::Fdl2 => "fdl2",
            BslState::Error => "error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdlStage {
    Fdl1,
    Fdl2,
}

/// Client for the Spreadtrum BSL command set across all three stages
/// (BROM, FDL1, FDL2).
pub struct BslClient {
    transport: Box<dyn Transport>,
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    state: BslState,
    timeouts: Timeouts,
    cancel: CancelToken,
    max_xfer: usize,
    crc_failures: u32,
    rx_buf: Vec<u8>,
}

impl BslClient {
    pub fn new(transport: Box<dyn Transport>, timeouts: Timeouts, cancel: CancelToken) -> Self {
        BslClient {
            transport,
            encoder: FrameEncoder::new(),
            decoder: FrameDecoder::new(),
            state: BslState::Disconnected,
            timeouts,
            cancel,
            max_xfer: DEFAULT_MAX_XFER,
            crc_failures: 0,
            rx_buf: vec![0u8; 0x4000],
        }
    }

    pub fn state(&self) -> BslState {
        self.state
    }

    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn set_max_xfer(&mut self, max_xfer: usize) {
        self.max_xfer = max_xfer.max(0x200);
    }

    fn ensure(&self, allowed: &[BslState]) -> Result<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "BSL operation not valid in state {}, needs one of {allowed:?}",
                self.state
            )))
        }
    }

    /// Reads until one complete frame decodes, within `deadline` overall.
    /// `Ok(None)` reports a CRC mismatch so the caller can retransmit.
    async fn read_frame(&mut self, deadline: Duration) -> Result<Option<Frame>> {
        let started = Instant::now();

        loop {
            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(Error::timeout("bsl response", deadline));
            }

            let window = (deadline - elapsed).min(self.timeouts.transport_read);
            let n = self.transport.read_some(&mut self.rx_buf, window).await?;
            if n == 0 {
                continue;
            }

            let chunk: Vec<u8> = self.rx_buf[..n].to_vec();
            for event in self.decoder.push(&chunk) {
                match event {
                    DecodeEvent::Frame(frame) => {
                        self.crc_failures = 0;
                        debug!(
                            "[RX] {} payload {} bytes",
                            Response::describe(frame.command),
                            frame.payload.len()
                        );
                        return Ok(Some(frame));
                    }
                    DecodeEvent::CrcMismatch => {
                        self.crc_failures += 1;
                        warn!("CRC mismatch ({}/{MAX_CRC_FAILURES})", self.crc_failures);
                        if self.crc_failures >= MAX_CRC_FAILURES {
                            return Err(Error::proto(
                                "three consecutive CRC mismatches, aborting transfer",
                            ));
                        }
                        return Ok(None);
                    }
                }
            }
        }
    }

    fn response_error(&self, cmd: Command, frame: &Frame) -> Error {
        match Response::try_from(frame.command) {
            Ok(Response::VerifyError) => {
                Error::integrity(format!("{cmd:?} rejected: data verification failed"))
            }
            Ok(Response::SignVerifyError) => {
                Error::unauthorized(format!("{cmd:?} rejected: signature verification failed"))
            }
            Ok(Response::OpFailed) => Error::proto(format!("{cmd:?} failed on the device")),
            Ok(Response::Invalid) | Ok(Response::Unknown) => {
                Error::proto(format!("{cmd:?} not understood by the current stage"))
            }
            _ => Error::proto(format!(
                "unexpected response {} to {cmd:?}",
                Response::describe(frame.command)
            )),
        }
    }

    /// Sends one command and awaits the expected response, retransmitting
    /// on missing ACKs and CRC-damaged replies.
    async fn command(&mut self, cmd: Command, payload: &[u8], expect: Response) -> Result<Frame> {
        self.cancel.check()?;

        let wire = self.encoder.encode(cmd.into(), payload)?;
        let mut attempt = 0;

        loop {
            attempt += 1;
            debug!("[TX] {cmd:?} payload {} bytes (attempt {attempt})", payload.len());
            self.transport.write_all(&wire, self.timeouts.command_ack).await?;

            match self.read_frame(self.timeouts.command_ack).await {
                Ok(Some(frame)) if frame.command == expect as u8 => return Ok(frame),
                Ok(Some(frame)) => return Err(self.response_error(cmd, &frame)),
                Ok(None) if attempt < COMMAND_RETRIES => continue,
                Ok(None) => {
                    return Err(Error::proto(format!("{cmd:?}: retries exhausted on CRC damage")));
                }
                Err(Error::Timeout { .. }) if attempt < COMMAND_RETRIES => {
                    warn!("{cmd:?}: no ACK, retrying ({attempt}/{COMMAND_RETRIES})");
                    continue;
                }
                Err(e) => {
                    if e.is_session_fatal() {
                        self.state = BslState::Error;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn simple(&mut self, cmd: Command, payload: &[u8]) -> Result<()> {
        self.command(cmd, payload, Response::Ack).await.map(|_| ())
    }

    /// Probes the boot ROM with a CHECK_BAUD burst until it answers VER,
    /// then issues CONNECT. Returns the version string.
    pub async fn handshake(&mut self) -> Result<String> {
        self.transport.open().await?;
        self.transport.drain().await?;

        let mut version = None;

        for attempt in 0..HANDSHAKE_ATTEMPTS {
            self.cancel.check()?;
            self.transport.write_all(&[CHECK_BAUD], self.timeouts.command_ack).await?;

            match self.read_frame(Duration::from_millis(300)).await {
                Ok(Some(frame)) if frame.command == Response::Ver as u8 => {
                    let ver = String::from_utf8_lossy(&frame.payload)
                        .trim_end_matches('\0')
                        .to_string();
                    info!("BSL endpoint answered: {ver}");
                    version = Some(ver);
                    break;
                }
                Ok(_) => continue,
                Err(Error::Timeout { .. }) => {
                    if attempt % 16 == 15 {
                        debug!("still probing for VER ({attempt} attempts)");
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }

        let version = version
            .ok_or_else(|| Error::proto("device never answered the CHECK_BAUD probe burst"))?;

        self.simple(Command::Connect, &[]).await?;
        if self.state == BslState::Disconnected {
            self.state = BslState::Brom;
        }

        Ok(version)
    }

    /// Uploads one FDL stage and executes it.
    ///
    /// START_DATA carries the big-endian load address and length; the blob
    /// then moves in MIDST_DATA chunks sized for the receiving stage.
    pub async fn load_stage(
        &mut self,
        stage: FdlStage,
        data: &[u8],
        addr: u32,
        progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<()> {
        match stage {
            FdlStage::Fdl1 => self.ensure(&[BslState::Brom])?,
            FdlStage::Fdl2 => self.ensure(&[BslState::Fdl1])?,
        }

        info!("Staging {stage:?}: {} bytes to 0x{addr:08X}", data.len());

        let mut start = Vec::with_capacity(8);
        start.extend_from_slice(&addr.to_be_bytes());
        start.extend_from_slice(&(data.len() as u32).to_be_bytes());
        self.simple(Command::StartData, &start).await?;

        let chunk_size = match self.state {
            BslState::Brom => LOAD_CHUNK,
            _ => self.max_xfer.min(0x3000),
        };

        let total = data.len() as u64;
        let mut sent = 0u64;
        for chunk in data.chunks(chunk_size) {
            self.cancel.check()?;
            self.simple(Command::MidstData, chunk).await?;
            sent += chunk.len() as u64;
            progress(sent, total);
        }

        self.simple(Command::EndData, &[]).await?;

        // Some mask ROMs jump before acknowledging EXEC_DATA; a missing
        // ACK here is not a failure.
        let exec = self.encoder.encode(Command::ExecData.into(), &[])?;
        self.transport.write_all(&exec, self.timeouts.command_ack).await?;
        match self.read_frame(Duration::from_millis(500)).await {
            Ok(Some(frame)) if frame.command == Response::Ack as u8 => {}
            Ok(Some(frame)) => return Err(self.response_error(Command::ExecData, &frame)),
            Ok(None) | Err(Error::Timeout { .. }) => {
                debug!("no EXEC_DATA ack, assuming the loader took over");
            }
            Err(e) => return Err(e),
        }

        // The freshly started loader expects its own probe + CONNECT.
        self.decoder = FrameDecoder::new();
        if !self.encoder.transcode() {
            self.decoder.disable_transcode();
        }

        self.state = match stage {
            FdlStage::Fdl1 => BslState::Fdl1,
            FdlStage::Fdl2 => BslState::Fdl2,
        };
        self.handshake().await?;

        info!("{stage:?} is up, state now {}", self.state);

        if stage == FdlStage::Fdl2 {
            self.disable_transcode().await?;
        }

        Ok(())
    }

    /// Turns off payload escaping for the rest of the session.
    pub async fn disable_transcode(&mut self) -> Result<()> {
        self.ensure(&[BslState::Fdl2])?;

        self.simple(Command::DisableTranscode, &[]).await?;
        self.encoder.disable_transcode();
        self.decoder.disable_transcode();
        debug!("payload transcoding disabled");

        Ok(())
    }

    fn name_field(name: &str) -> Vec<u8> {
        utf16le_fixed(name, NAME_UNITS)
    }

    /// Writes a partition from a stream. Sparse images are expanded to
    /// raw blocks on the fly before framing.
    pub async fn write_partition(
        &mut self,
        name: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        size: u64,
        progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<()> {
        self.ensure(&[BslState::Fdl2])?;

        let mut probe = vec![0u8; sparse::FILE_HEADER_LEN.min(size as usize)];
        reader.read_exact(&mut probe).await?;

        if sparse::is_sparse(&probe) {
            let mut expander = SparseReader::resume(reader, &probe)?;
            let total = expander.expanded_len();
            info!("Writing sparse image to '{name}': {total} bytes expanded");

            self.start_write(name, total).await?;

            let mut chunk = vec![0u8; self.max_xfer];
            let mut filled = 0usize;
            let mut sent = 0u64;

            loop {
                let n = expander.read_expanded(&mut chunk[filled..]).await?;
                filled += n;

                if filled == chunk.len() || (n == 0 && filled > 0) {
                    self.cancel.check()?;
                    let piece: Vec<u8> = chunk[..filled].to_vec();
                    self.simple(Command::MidstData, &piece).await?;
                    sent += filled as u64;
                    progress(sent, total);
                    filled = 0;
                }

                if n == 0 {
                    break;
                }
            }

            if sent != total {
                return Err(Error::proto(format!(
                    "sparse stream produced {sent} bytes, header promised {total}"
                )));
            }
        } else {
            info!("Writing raw image to '{name}': {size} bytes");
            self.start_write(name, size).await?;

            let mut sent = 0u64;
            let mut pending = probe;

            while sent < size {
                self.cancel.check()?;

                let want = self.max_xfer.min((size - sent) as usize);
                while pending.len() < want {
                    let mut buf = vec![0u8; want - pending.len()];
                    let n = reader.read(&mut buf).await?;
                    if n == 0 {
                        return Err(Error::user_input(format!(
                            "image for '{name}' ended {} bytes short",
                            size - sent - pending.len() as u64
                        )));
                    }
                    pending.extend_from_slice(&buf[..n]);
                }

                let piece: Vec<u8> = pending.drain(..want).collect();
                self.simple(Command::MidstData, &piece).await?;
                sent += want as u64;
                progress(sent, size);
            }
        }

        self.simple(Command::EndData, &[]).await?;
        info!("Partition '{name}' written");

        Ok(())
    }

    async fn start_write(&mut self, name: &str, total: u64) -> Result<()> {
        if total > u32::MAX as u64 {
            return Err(Error::unsupported(format!(
                "BSL transfers are limited to 4 GiB, '{name}' is {total} bytes"
            )));
        }

        let mut payload = Self::name_field(name);
        payload.extend_from_slice(&(total as u32).to_le_bytes());
        payload.extend_from_slice(&0u32.to_le_bytes()); // checksum unused
        self.simple(Command::StartData, &payload).await
    }

    /// Reads `size` bytes of a partition.
    pub async fn read_partition(
        &mut self,
        name: &str,
        size: u64,
        progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<Vec<u8>> {
        self.ensure(&[BslState::Fdl2])?;

        info!("Reading {size} bytes of '{name}'");
        let mut out = Vec::with_capacity(size as usize);

        while (out.len() as u64) < size {
            self.cancel.check()?;

            let want = READ_CHUNK.min((size - out.len() as u64) as usize);
            let mut payload = Self::name_field(name);
            payload.extend_from_slice(&(want as u32).to_le_bytes());
            payload.extend_from_slice(&(out.len() as u32).to_le_bytes());

            let frame = self.command(Command::ReadPartition, &payload, Response::Data).await?;
            if frame.payload.is_empty() {
                return Err(Error::proto(format!("device returned no data for '{name}'")));
            }
            out.extend_from_slice(&frame.payload);
            progress(out.len() as u64, size);
        }

        out.truncate(size as usize);
        Ok(out)
    }

    pub async fn erase_partition(&mut self, name: &str) -> Result<()> {
        self.ensure(&[BslState::Fdl2])?;
        info!("Erasing '{name}'");
        self.simple(Command::EraseFlash, &Self::name_field(name)).await
    }

    /// Fetches the FDL2-side partition table.
    ///
    /// Entries are a 72-byte UTF-16LE name followed by a u32 LE sector
    /// count over 512-byte sectors.
    pub async fn read_partition_table(&mut self) -> Result<PartitionTable> {
        self.ensure(&[BslState::Fdl2])?;

        let frame = self.command(Command::ReadPartition, &[], Response::Partition).await?;
        if frame.payload.len() % TABLE_ENTRY_LEN != 0 {
            return Err(Error::proto(format!(
                "partition table payload of {} bytes is not a multiple of {TABLE_ENTRY_LEN}",
                frame.payload.len()
            )));
        }

        let mut table = PartitionTable::new();
        let mut next_start = 0u64;
        for entry in frame.payload.chunks_exact(TABLE_ENTRY_LEN) {
            let name = utf16le_name(&entry[..NAME_UNITS * 2]);
            if name.is_empty() {
                continue;
            }
            let sectors = crate::le_u32!(entry, NAME_UNITS * 2) as u64;
            table.insert(Partition::new(name, 0, next_start, sectors, 512));
            next_start += sectors;
        }

        info!("Device reports {} partitions", table.len());
        Ok(table)
    }

    /// Rewrites the partition table. Entries are `(name, sector_count)`.
    pub async fn repartition(&mut self, entries: &[(String, u32)]) -> Result<()> {
        self.ensure(&[BslState::Fdl2])?;

        let mut payload = Vec::with_capacity(entries.len() * TABLE_ENTRY_LEN);
        for (name, sectors) in entries {
            payload.extend_from_slice(&Self::name_field(name));
            payload.extend_from_slice(&sectors.to_le_bytes());
        }

        self.simple(Command::Repartition, &payload).await
    }

    pub async fn read_nv(&mut self, id: u32) -> Result<Vec<u8>> {
        self.ensure(&[BslState::Fdl2])?;
        let frame =
            self.command(Command::ReadNvItem, &id.to_be_bytes(), Response::Data).await?;
        Ok(frame.payload)
    }

    pub async fn write_nv(&mut self, id: u32, data: &[u8]) -> Result<()> {
        self.ensure(&[BslState::Fdl2])?;
        let mut payload = id.to_be_bytes().to_vec();
        payload.extend_from_slice(data);
        self.simple(Command::WriteNvItem, &payload).await
    }

    pub async fn read_efuse(&mut self, block: u32) -> Result<Vec<u8>> {
        self.ensure(&[BslState::Fdl2])?;
        let frame =
            self.command(Command::ReadEfuse, &block.to_be_bytes(), Response::Data).await?;
        Ok(frame.payload)
    }

    pub async fn read_chip_type(&mut self) -> Result<u32> {
        self.ensure(&[BslState::Brom, BslState::Fdl1, BslState::Fdl2])?;
        let frame = self.command(Command::ReadChipType, &[], Response::Data).await?;
        if frame.payload.len() < 4 {
            return Err(Error::proto("chip-type response shorter than 4 bytes"));
        }
        Ok(crate::be_u32!(frame.payload, 0))
    }

    /// Reads the device's signature public key, used to pick a matching
    /// bypass signature.
    pub async fn read_pubkey(&mut self) -> Result<Vec<u8>> {
        let frame = self.command(Command::ReadPubkey, &[], Response::Data).await?;
        Ok(frame.payload)
    }

    /// Presents a signature blob to the loader's verifier.
    pub async fn send_signature(&mut self, signature: &[u8]) -> Result<()> {
        self.simple(Command::SendSignature, signature).await
    }

    /// Lifts the loader's write restrictions after a successful signature.
    pub async fn unlock(&mut self) -> Result<()> {
        self.simple(Command::Unlock, &[]).await
    }

    /// Switches the line rate; the framed command goes out at the old rate.
    pub async fn set_baud(&mut self, rate: u32) -> Result<()> {
        self.simple(Command::ChangeBaud, &rate.to_be_bytes()).await?;
        self.transport.set_baud(rate).await?;
        info!("Line rate changed to {rate}");
        Ok(())
    }

    /// Reboots the device. The session is over either way.
    pub async fn reset(&mut self) -> Result<()> {
        let wire = self.encoder.encode(Command::Reset.into(), &[])?;
        self.transport.write_all(&wire, self.timeouts.command_ack).await?;
        // The device drops the line while rebooting; don't insist on ACK.
        let _ = self.read_frame(Duration::from_millis(500)).await;
        self.state = BslState::Disconnected;
        Ok(())
    }

    pub async fn power_off(&mut self) -> Result<()> {
        let wire = self.encoder.encode(Command::EndProcess.into(), &[])?;
        self.transport.write_all(&wire, self.timeouts.command_ack).await?;
        let _ = self.read_frame(Duration::from_millis(500)).await;
        self.state = BslState::Disconnected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn encoded(cmd: u8, payload: &[u8]) -> Vec<u8> {
        FrameEncoder::new().encode(cmd, payload).unwrap()
    }

    fn client(mock: MockTransport) -> BslClient {
        BslClient::new(Box::new(mock), Timeouts::default(), CancelToken::new())
    }

    #[tokio::test]
    async fn handshake_probes_until_ver_then_connects() {
        let mock = MockTransport::new()
            .loose()
            .reply(&encoded(Response::Ver as u8, b"SPRD3\0"))
            .reply(&encoded(Response::Ack as u8, &[]));

        let mut bsl = client(mock);
        let version = bsl.handshake().await.unwrap();

        assert_eq!(version, "SPRD3");
        assert_eq!(bsl.state(), BslState::Brom);
    }

    #[tokio::test]
    async fn partition_ops_require_fdl2() {
        let mut bsl = client(MockTransport::new().loose());
        let err = bsl.erase_partition("misc").await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn command_maps_verify_error_to_integrity() {
        let mock = MockTransport::new()
            .loose()
            .reply(&encoded(Response::VerifyError as u8, &[]));

        let mut bsl = client(mock);
        bsl.state = BslState::Fdl2;

        let err = bsl.erase_partition("misc").await.unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[tokio::test]
    async fn command_retries_on_crc_damage_then_succeeds() {
        // First reply arrives CRC-damaged; the retransmit gets a clean ACK.
        let mut bad = encoded(Response::Ack as u8, &[]);
        let idx = bad.len() - 2;
        bad[idx] ^= 0x01;

        let mock = MockTransport::new()
            .loose()
            .reply(&bad)
            .reply(&encoded(Response::Ack as u8, &[]));

        let mut bsl = client(mock);
        bsl.state = BslState::Fdl2;
        bsl.erase_partition("cache").await.unwrap();
    }

    #[tokio::test]
    async fn partition_table_parses_entries() {
        let mut payload = Vec::new();
        for (name, sectors) in [("boot", 0x1000u32), ("system", 0x80000)] {
            payload.extend_from_slice(&utf16le_fixed(name, NAME_UNITS));
            payload.extend_from_slice(&sectors.to_le_bytes());
        }

        let mock = MockTransport::new()
            .loose()
            .reply(&encoded(Response::Partition as u8, &payload));

        let mut bsl = client(mock);
        bsl.state = BslState::Fdl2;

        let table = bsl.read_partition_table().await.unwrap();
        assert_eq!(table.len(), 2);
        let system = table.find("system").unwrap();
        assert_eq!(system.num_sectors, 0x80000);
        assert_eq!(system.start_sector, 0x1000);
    }

    #[tokio::test]
    async fn write_partition_expands_sparse_input() {
        use crate::sparse::{CHUNK_HEADER_LEN, FILE_HEADER_LEN, SparseHeader};

        // One fill chunk of 2 blocks at 512-byte blocks.
        let mut image = SparseHeader { block_size: 512, total_blocks: 2, total_chunks: 1 }
            .serialize()
            .to_vec();
        let mut chunk_hdr = [0u8; CHUNK_HEADER_LEN];
        chunk_hdr[0..2].copy_from_slice(&0xCAC2u16.to_le_bytes());
        chunk_hdr[4..8].copy_from_slice(&2u32.to_le_bytes());
        chunk_hdr[8..12].copy_from_slice(&((CHUNK_HEADER_LEN + 4) as u32).to_le_bytes());
        image.extend_from_slice(&chunk_hdr);
        image.extend_from_slice(&[0xAB; 4]);
        assert_eq!(image.len(), FILE_HEADER_LEN + CHUNK_HEADER_LEN + 4);

        let mock = MockTransport::new()
            .loose()
            .reply(&encoded(Response::Ack as u8, &[])) // START_DATA
            .reply(&encoded(Response::Ack as u8, &[])) // MIDST_DATA
            .reply(&encoded(Response::Ack as u8, &[])); // END_DATA

        let mut bsl = client(mock);
        bsl.state = BslState::Fdl2;

        let mut sent = Vec::new();
        let mut progress = |done: u64, total: u64| sent.push((done, total));
        let mut reader: &[u8] = &image;
        bsl.write_partition("misc", &mut reader, image.len() as u64, &mut progress)
            .await
            .unwrap();

        // The expanded size (1024) is what travels, not the file size.
        assert_eq!(sent.last(), Some(&(1024, 1024)));
    }

    #[tokio::test]
    async fn short_raw_image_is_a_user_error() {
        let mock = MockTransport::new()
            .loose()
            .reply(&encoded(Response::Ack as u8, &[])); // START_DATA

        let mut bsl = client(mock);
        bsl.state = BslState::Fdl2;

        let data = vec![0u8; 100];
        let mut reader: &[u8] = &data;
        let mut progress = |_: u64, _: u64| {};
        let err = bsl
            .write_partition("misc", &mut reader, 4096, &mut progress)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UserInput(_)));
    }

    #[tokio::test]
    async fn cancellation_stops_between_chunks() {
        let cancel = CancelToken::new();
        let mock = MockTransport::new().loose();
        let mut bsl = BslClient::new(Box::new(mock), Timeouts::default(), cancel.clone());
        bsl.state = BslState::Fdl2;

        cancel.cancel();
        let err = bsl.erase_partition("misc").await.unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }
}
