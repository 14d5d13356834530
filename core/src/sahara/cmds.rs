/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Sahara packet opcodes. Every packet is `cmd:u32 LE | length:u32 LE |
/// payload`, with `length` covering the whole packet.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[allow(dead_code)]
pub enum Opcode {
    Hello = 0x01,
    HelloResp = 0x02,
    ReadData = 0x03,
    EndOfImage = 0x04,
    Done = 0x05,
    DoneResp = 0x06,
    Reset = 0x07,
    ResetResp = 0x08,
    SwitchMode = 0x0B,
    CmdReady = 0x0D,
    CmdExec = 0x0E,
    CmdExecResp = 0x0F,
    ReadData64 = 0x12,
}

/// Mode requested in HELLO_RESP / SWITCH_MODE.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
pub enum Mode {
    ImageTransferPending = 0x00,
    ImageTransferComplete = 0x01,
    MemoryDebug = 0x02,
    Command = 0x03,
}

/// Client commands executable in command mode.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[allow(dead_code)]
pub enum ClientCommand {
    SerialNumRead = 0x01,
    MsmHwIdRead = 0x02,
    OemPkHashRead = 0x03,
}

pub const HEADER_LEN: usize = 8;
/// HELLO and HELLO_RESP are fixed 48-byte packets.
pub const HELLO_LEN: usize = 0x30;
