/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Host-to-device BSL commands.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[allow(dead_code)]
pub enum Command {
    Connect = 0x00,
    StartData = 0x01,
    MidstData = 0x02,
    EndData = 0x03,
    ExecData = 0x04,
    Reset = 0x05,
    ReadFlash = 0x06,
    ReadChipType = 0x07,
    ReadNvItem = 0x08,
    ChangeBaud = 0x09,
    EraseFlash = 0x0A,
    Repartition = 0x0B,
    DisableTranscode = 0x21,
    WriteNvItem = 0x22,
    ReadPartition = 0x2D,
    Unlock = 0x30,
    ReadPubkey = 0x31,
    SendSignature = 0x32,
    ReadLog = 0x35,
    ReadEfuse = 0x60,
    EndProcess = 0x7F,
}

/// The handshake probe is the bare sentinel byte, not a framed command.
pub const CHECK_BAUD: u8 = 0x7E;

/// Device-to-host response codes.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum Response {
    Ack = 0x80,
    Ver = 0x81,
    Invalid = 0x82,
    Unknown = 0x83,
    OpFailed = 0x84,
    VerifyError = 0x8B,
    Data = 0x93,
    SignVerifyError = 0xA6,
    Partition = 0xBA,
}

impl Response {
    pub fn describe(code: u8) -> String {
        match Response::try_from(code) {
            Ok(r) => format!("{r:?} (0x{code:02X})"),
            Err(_) => format!("unknown response 0x{code:02X}"),
        }
    }
}
