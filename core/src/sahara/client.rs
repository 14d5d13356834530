/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use log::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::sahara::cmds::{ClientCommand, HEADER_LEN, HELLO_LEN, Mode, Opcode};
use crate::timeouts::Timeouts;
use crate::transport::Transport;
use crate::{le_u32, le_u64};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaharaState {
    WaitHello,
    Command,
    ImageTransfer,
    Done,
    Error,
}

impl std::fmt::Display for SaharaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SaharaState::WaitHello => "wait-hello",
            SaharaState::Command => "command",
            SaharaState::ImageTransfer => "image-transfer",
            SaharaState::Done => "done",
            SaharaState::Error => "error",
        };
        f.write_str(name)
    }
}

/// Chip identity pulled over Sahara command mode, without uploading any
/// programmer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChipIdentity {
    pub serial: u32,
    /// Raw 64-bit MSM hardware id.
    pub hw_id: u64,
    pub pk_hash: Vec<u8>,
}

impl ChipIdentity {
    /// SoC id portion of the hardware id.
    pub fn msm_id(&self) -> u32 {
        (self.hw_id & 0xFFFF_FFFF) as u32
    }

    pub fn oem_id(&self) -> u16 {
        ((self.hw_id >> 32) & 0xFFFF) as u16
    }

    pub fn model_id(&self) -> u16 {
        ((self.hw_id >> 48) & 0xFFFF) as u16
    }
}

#[derive(Debug)]
struct Packet {
    opcode: u32,
    payload: Vec<u8>,
}

/// Qualcomm boot-ROM Sahara client: programmer upload and chip-info
/// extraction.
pub struct SaharaClient {
    transport: Box<dyn Transport>,
    state: SaharaState,
    timeouts: Timeouts,
    cancel: CancelToken,
    /// Protocol version the ROM greeted us with.
    version: u32,
}

impl SaharaClient {
    pub fn new(transport: Box<dyn Transport>, timeouts: Timeouts, cancel: CancelToken) -> Self {
        SaharaClient { transport, state: SaharaState::WaitHello, timeouts, cancel, version: 0 }
    }

    pub fn state(&self) -> SaharaState {
        self.state
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Hands the transport over to the next protocol stage (Firehose).
    pub fn into_transport(self) -> Box<dyn Transport> {
        self.transport
    }

    async fn read_packet(&mut self) -> Result<Packet> {
        let mut header = [0u8; HEADER_LEN];
        self.transport.read_exact(&mut header, self.timeouts.sahara_transfer).await?;

        let opcode = le_u32!(header, 0);
        let length = le_u32!(header, 4) as usize;
        if !(HEADER_LEN..=0x1_0000).contains(&length) {
            self.state = SaharaState::Error;
            return Err(Error::proto(format!("Sahara packet length {length} out of range")));
        }

        let mut payload = vec![0u8; length - HEADER_LEN];
        self.transport.read_exact(&mut payload, self.timeouts.transport_read).await?;

        debug!("[RX] Sahara opcode 0x{opcode:02X}, {length} bytes");
        Ok(Packet { opcode, payload })
    }

    async fn write_packet(&mut self, opcode: Opcode, payload: &[u8]) -> Result<()> {
        let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
        packet.extend_from_slice(&u32::from(opcode).to_le_bytes());
        packet.extend_from_slice(&((HEADER_LEN + payload.len()) as u32).to_le_bytes());
        packet.extend_from_slice(payload);

        debug!("[TX] Sahara {opcode:?}, {} bytes", packet.len());
        self.transport.write_all(&packet, self.timeouts.command_ack).await
    }

    fn unexpected(&mut self, packet: &Packet) -> Error {
        self.state = SaharaState::Error;
        Error::proto(format!("unexpected Sahara opcode 0x{:02X}", packet.opcode))
    }

    /// Waits for the ROM's HELLO and answers it with the requested mode.
    async fn greet(&mut self, mode: Mode) -> Result<()> {
        self.transport.open().await?;

        let packet = self.read_packet().await?;
        if packet.opcode != u32::from(Opcode::Hello) {
            return Err(self.unexpected(&packet));
        }
        if packet.payload.len() < 16 {
            self.state = SaharaState::Error;
            return Err(Error::proto("HELLO payload truncated"));
        }

        self.version = le_u32!(packet.payload, 0);
        let version_min = le_u32!(packet.payload, 4);
        let max_cmd_len = le_u32!(packet.payload, 8);
        info!(
            "Sahara HELLO: version {} (min {}), max command packet {} bytes",
            self.version, version_min, max_cmd_len
        );

        let mut resp = vec![0u8; HELLO_LEN - HEADER_LEN];
        resp[0..4].copy_from_slice(&self.version.to_le_bytes());
        resp[4..8].copy_from_slice(&version_min.to_le_bytes());
        resp[8..12].copy_from_slice(&0u32.to_le_bytes()); // status: success
        resp[12..16].copy_from_slice(&u32::from(mode).to_le_bytes());
        self.write_packet(Opcode::HelloResp, &resp).await?;

        self.state = match mode {
            Mode::Command => SaharaState::Command,
            _ => SaharaState::ImageTransfer,
        };

        Ok(())
    }

    /// Serves the ROM's READ_DATA requests out of `image` until
    /// END_OF_IMAGE, then completes the DONE handshake.
    ///
    /// A zero status in DONE_RESP means the programmer is executing.
    pub async fn upload_programmer(
        &mut self,
        image: &[u8],
        progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<()> {
        self.greet(Mode::ImageTransferPending).await?;

        let total = image.len() as u64;
        info!("Uploading {total}-byte programmer");

        loop {
            self.cancel.check()?;

            let packet = self.read_packet().await?;
            let opcode = Opcode::try_from(packet.opcode)
                .map_err(|_| self.unexpected(&packet))?;

            let (offset, length) = match opcode {
                Opcode::ReadData => {
                    if packet.payload.len() < 12 {
                        return Err(Error::proto("READ_DATA payload truncated"));
                    }
                    (le_u32!(packet.payload, 4) as u64, le_u32!(packet.payload, 8) as u64)
                }
                Opcode::ReadData64 => {
                    if packet.payload.len() < 24 {
                        return Err(Error::proto("READ_DATA_64 payload truncated"));
                    }
                    (le_u64!(packet.payload, 8), le_u64!(packet.payload, 16))
                }
                Opcode::EndOfImage => {
                    if packet.payload.len() < 8 {
                        return Err(Error::proto("END_OF_IMAGE payload truncated"));
                    }
                    let status = le_u32!(packet.payload, 4);
                    if status != 0 {
                        self.state = SaharaState::Error;
                        return Err(Error::proto(format!(
                            "boot ROM rejected the programmer, image status 0x{status:08X}"
                        )));
                    }
                    break;
                }
                _ => return Err(self.unexpected(&packet)),
            };

            let end = offset
                .checked_add(length)
                .filter(|&e| e <= total)
                .ok_or_else(|| {
                    Error::proto(format!("ROM requested {length} bytes at {offset}, image is {total}"))
                })?;

            self.transport
                .write_all(&image[offset as usize..end as usize], self.timeouts.sahara_transfer)
                .await?;
            progress(end, total);
        }

        self.write_packet(Opcode::Done, &[]).await?;
        let packet = self.read_packet().await?;
        if packet.opcode != u32::from(Opcode::DoneResp) {
            return Err(self.unexpected(&packet));
        }

        if packet.payload.len() < 4 {
            return Err(Error::proto("DONE_RESP payload truncated"));
        }
        let status = le_u32!(packet.payload, 0);
        if status != 0 {
            self.state = SaharaState::Error;
            return Err(Error::proto(format!("DONE_RESP image transfer status 0x{status:08X}")));
        }

        self.state = SaharaState::Done;
        info!("Programmer accepted, device is executing it");
        Ok(())
    }

    /// Switches into command mode and pulls the chip identity.
    pub async fn read_device_info(&mut self) -> Result<ChipIdentity> {
        self.greet(Mode::Command).await?;

        let packet = self.read_packet().await?;
        if packet.opcode != u32::from(Opcode::CmdReady) {
            return Err(self.unexpected(&packet));
        }

        let serial_raw = self.exec(ClientCommand::SerialNumRead).await?;
        let hw_id_raw = self.exec(ClientCommand::MsmHwIdRead).await?;
        let pk_hash = self.exec(ClientCommand::OemPkHashRead).await?;

        if serial_raw.len() < 4 || hw_id_raw.len() < 8 {
            return Err(Error::proto("short client-command response"));
        }

        let identity = ChipIdentity {
            serial: le_u32!(serial_raw, 0),
            hw_id: le_u64!(hw_id_raw, 0),
            pk_hash,
        };

        info!(
            "Chip identity: serial 0x{:08X}, msm 0x{:08X}, oem 0x{:04X}",
            identity.serial,
            identity.msm_id(),
            identity.oem_id()
        );

        Ok(identity)
    }

    /// Runs one client command and returns its response data.
    async fn exec(&mut self, cmd: ClientCommand) -> Result<Vec<u8>> {
        self.cancel.check()?;
        self.write_packet(Opcode::CmdExec, &u32::from(cmd).to_le_bytes()).await?;

        let packet = self.read_packet().await?;
        if packet.opcode != u32::from(Opcode::CmdExecResp) {
            return Err(self.unexpected(&packet));
        }
        if packet.payload.len() < 8 {
            return Err(Error::proto("CMD_EXEC_RESP payload truncated"));
        }

        let resp_len = le_u32!(packet.payload, 4) as usize;
        if resp_len > 0x1000 {
            return Err(Error::proto(format!("client command response of {resp_len} bytes")));
        }

        let mut data = vec![0u8; resp_len];
        self.transport.read_exact(&mut data, self.timeouts.transport_read).await?;
        Ok(data)
    }

    /// Returns to image-transfer mode after command-mode queries.
    pub async fn switch_mode(&mut self, mode: Mode) -> Result<()> {
        self.write_packet(Opcode::SwitchMode, &u32::from(mode).to_le_bytes()).await?;
        self.state = match mode {
            Mode::Command => SaharaState::Command,
            _ => SaharaState::WaitHello,
        };
        Ok(())
    }

    /// Clears a stuck Sahara state. The ROM restarts its HELLO sequence.
    pub async fn reset(&mut self) -> Result<()> {
        self.write_packet(Opcode::Reset, &[]).await?;

        match self.read_packet().await {
            Ok(packet) if packet.opcode == u32::from(Opcode::ResetResp) => {}
            Ok(packet) => warn!("odd reply 0x{:02X} to Sahara reset", packet.opcode),
            Err(Error::Timeout { .. }) => {}
            Err(e) => return Err(e),
        }

        self.state = SaharaState::WaitHello;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::MockTransport;

    fn packet(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
        let mut out = u32::from(opcode).to_le_bytes().to_vec();
        out.extend_from_slice(&((HEADER_LEN + payload.len()) as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn hello(version: u32) -> Vec<u8> {
        let mut payload = vec![0u8; HELLO_LEN - HEADER_LEN];
        payload[0..4].copy_from_slice(&version.to_le_bytes());
        payload[4..8].copy_from_slice(&1u32.to_le_bytes());
        payload[8..12].copy_from_slice(&0x400u32.to_le_bytes());
        packet(Opcode::Hello, &payload)
    }

    fn read_data_64(offset: u64, length: u64) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u64.to_le_bytes()); // image id
        payload.extend_from_slice(&offset.to_le_bytes());
        payload.extend_from_slice(&length.to_le_bytes());
        packet(Opcode::ReadData64, &payload)
    }

    fn end_of_image(status: u32) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&0u32.to_le_bytes());
        payload.extend_from_slice(&status.to_le_bytes());
        packet(Opcode::EndOfImage, &payload)
    }

    fn client(mock: MockTransport) -> SaharaClient {
        SaharaClient::new(Box::new(mock), Timeouts::default(), CancelToken::new())
    }

    #[tokio::test]
    async fn uploads_a_programmer_in_requested_windows() {
        const CHUNK: u64 = 64 * 1024;
        let image: Vec<u8> = (0..512 * 1024).map(|i| (i % 253) as u8).collect();

        let mut mock = MockTransport::new().loose().reply(&hello(2));
        for k in 0..8 {
            mock = mock.reply(&read_data_64(k * CHUNK, CHUNK));
        }
        mock = mock
            .reply(&end_of_image(0))
            .reply(&packet(Opcode::DoneResp, &0u32.to_le_bytes()));

        let mut sahara = client(mock);
        let mut last = (0, 0);
        let mut progress = |done: u64, total: u64| last = (done, total);
        sahara.upload_programmer(&image, &mut progress).await.unwrap();

        assert_eq!(sahara.state(), SaharaState::Done);
        assert_eq!(sahara.version(), 2);
        assert_eq!(last, (image.len() as u64, image.len() as u64));
    }

    #[tokio::test]
    async fn nonzero_image_status_fails_the_upload() {
        let mock = MockTransport::new()
            .loose()
            .reply(&hello(2))
            .reply(&end_of_image(0x23));

        let mut sahara = client(mock);
        let mut progress = |_: u64, _: u64| {};
        let err = sahara.upload_programmer(&[0u8; 16], &mut progress).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert_eq!(sahara.state(), SaharaState::Error);
    }

    #[tokio::test]
    async fn truncated_end_of_image_is_a_protocol_error() {
        let mock = MockTransport::new()
            .loose()
            .reply(&hello(2))
            // END_OF_IMAGE with only 4 payload bytes instead of 8
            .reply(&packet(Opcode::EndOfImage, &0u32.to_le_bytes()));

        let mut sahara = client(mock);
        let mut progress = |_: u64, _: u64| {};
        let err = sahara.upload_programmer(&[0u8; 16], &mut progress).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn truncated_done_resp_is_a_protocol_error() {
        let mock = MockTransport::new()
            .loose()
            .reply(&hello(2))
            .reply(&end_of_image(0))
            // DONE_RESP with an empty payload
            .reply(&packet(Opcode::DoneResp, &[]));

        let mut sahara = client(mock);
        let mut progress = |_: u64, _: u64| {};
        let err = sahara.upload_programmer(&[0u8; 16], &mut progress).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn out_of_range_read_request_is_a_protocol_error() {
        let mock = MockTransport::new()
            .loose()
            .reply(&hello(2))
            .reply(&read_data_64(0, 1024));

        let mut sahara = client(mock);
        let mut progress = |_: u64, _: u64| {};
        let err = sahara.upload_programmer(&[0u8; 16], &mut progress).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn unexpected_opcode_surfaces_with_the_offender() {
        let mock = MockTransport::new()
            .loose()
            .reply(&hello(2))
            .reply(&packet(Opcode::CmdReady, &[]));

        let mut sahara = client(mock);
        let mut progress = |_: u64, _: u64| {};
        let err = sahara.upload_programmer(&[0u8; 16], &mut progress).await.unwrap_err();
        match err {
            Error::Protocol(msg) => assert!(msg.contains("0x0D"), "{msg}"),
            other => panic!("expected protocol error, got {other:?}"),
        }
        assert_eq!(sahara.state(), SaharaState::Error);
    }

    #[tokio::test]
    async fn device_info_runs_the_command_mode_ritual() {
        let hw_id = 0x0009_A0E1_0041_9000u64;

        let exec_resp = |cmd: u32, len: u32| {
            let mut payload = cmd.to_le_bytes().to_vec();
            payload.extend_from_slice(&len.to_le_bytes());
            packet(Opcode::CmdExecResp, &payload)
        };

        let mock = MockTransport::new()
            .loose()
            .reply(&hello(2))
            .reply(&packet(Opcode::CmdReady, &[]))
            .reply(&exec_resp(1, 4))
            .reply(&0xDEADBEEFu32.to_le_bytes())
            .reply(&exec_resp(2, 8))
            .reply(&hw_id.to_le_bytes())
            .reply(&exec_resp(3, 32))
            .reply(&[0xAB; 32]);

        let mut sahara = client(mock);
        let identity = sahara.read_device_info().await.unwrap();

        assert_eq!(identity.serial, 0xDEADBEEF);
        assert_eq!(identity.hw_id, hw_id);
        assert_eq!(identity.oem_id(), 0xA0E1);
        assert_eq!(identity.model_id(), 0x0009);
        assert_eq!(identity.pk_hash.len(), 32);
        assert_eq!(sahara.state(), SaharaState::Command);
    }
}
