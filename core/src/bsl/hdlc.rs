/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! HDLC-style framing used by the Spreadtrum BSL command set.
//!
//! Wire layout between two `0x7E` sentinels:
//! `cmd:u8 | len:u16 BE | payload[len] | crc:u16 BE`, with `0x7E`/`0x7D`
//! byte-stuffed as `0x7D 0x5E` / `0x7D 0x5D`. The CRC is CRC-16/CCITT
//! (poly 0x1021, init 0x0000, MSB-first) over `cmd | len | payload`.
//!
//! After FDL2 acknowledges `DISABLE_TRANSCODE`, payload bytes travel
//! verbatim while header and CRC stay escaped; the toggle is sticky for
//! the rest of the session.

use crate::error::{Error, Result};

pub const FLAG: u8 = 0x7E;
pub const ESCAPE: u8 = 0x7D;
const ESCAPE_XOR: u8 = 0x20;

/// Header is cmd + 16-bit length; trailer is the 16-bit CRC.
const HEADER_LEN: usize = 3;
const CRC_LEN: usize = 2;

/// CRC-16/CCITT, polynomial 0x1021, initial value 0x0000, MSB-first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for &byte in data {
        crc ^= (byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// A decoded BSL frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub command: u8,
    pub payload: Vec<u8>,
}

/// Outcome of feeding bytes into the [`FrameDecoder`].
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeEvent {
    Frame(Frame),
    /// A complete frame arrived but its CRC did not match. The decoder has
    /// already resynchronized on the next sentinel.
    CrcMismatch,
}

fn escape_into(out: &mut Vec<u8>, data: &[u8]) {
    for &byte in data {
        if byte == FLAG || byte == ESCAPE {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_XOR);
        } else {
            out.push(byte);
        }
    }
}

/// Frame encoder. `transcode` mirrors the session's escaping mode.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    transcode: bool,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        FrameEncoder { transcode: true }
    }

    /// Disables payload escaping. Header and CRC remain escaped.
    pub fn disable_transcode(&mut self) {
        self.transcode = false;
    }

    pub fn transcode(&self) -> bool {
        self.transcode
    }

    pub fn encode(&self, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.len() > u16::MAX as usize {
            return Err(Error::internal(format!(
                "BSL payload of {} bytes exceeds the 16-bit length field",
                payload.len()
            )));
        }

        let len = payload.len() as u16;
        let header = [command, (len >> 8) as u8, (len & 0xFF) as u8];

        let mut crc_input = Vec::with_capacity(HEADER_LEN + payload.len());
        crc_input.extend_from_slice(&header);
        crc_input.extend_from_slice(payload);
        let crc = crc16(&crc_input);

        let mut out = Vec::with_capacity(payload.len() + 8);
        out.push(FLAG);
        escape_into(&mut out, &header);
        if self.transcode {
            escape_into(&mut out, payload);
        } else {
            out.extend_from_slice(payload);
        }
        escape_into(&mut out, &crc.to_be_bytes());
        out.push(FLAG);

        Ok(out)
    }
}

#[derive(Debug)]
enum State {
    /// Hunting for an opening sentinel.
    Seek,
    /// Collecting the (escaped) 3-byte header.
    Header,
    /// Collecting `remaining` payload bytes, escaped or raw per mode.
    Payload { remaining: usize },
    /// Collecting the (escaped) CRC trailer.
    Crc,
    /// Swallowing the closing sentinel.
    Close,
}

/// Incremental frame decoder; feed it whatever the transport produced.
#[derive(Debug)]
pub struct FrameDecoder {
    transcode: bool,
    state: State,
    esc: bool,
    collected: Vec<u8>,
    crc_bytes: Vec<u8>,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        FrameDecoder {
            transcode: true,
            state: State::Seek,
            esc: false,
            collected: Vec::new(),
            crc_bytes: Vec::new(),
        }
    }

    /// Disables payload unescaping, mirroring [`FrameEncoder::disable_transcode`].
    pub fn disable_transcode(&mut self) {
        self.transcode = false;
    }

    fn reset(&mut self) {
        self.state = State::Seek;
        self.esc = false;
        self.collected.clear();
        self.crc_bytes.clear();
    }

    /// Decodes one escaped byte, or `None` while mid-escape.
    fn unescape(&mut self, byte: u8) -> Option<u8> {
        if self.esc {
            self.esc = false;
            Some(byte ^ ESCAPE_XOR)
        } else if byte == ESCAPE {
            self.esc = true;
            None
        } else {
            Some(byte)
        }
    }

    fn finish_frame(&mut self) -> DecodeEvent {
        let payload_len = self.collected.len() - HEADER_LEN;
        debug_assert_eq!(
            payload_len,
            ((self.collected[1] as usize) << 8) | self.collected[2] as usize
        );

        let wire_crc = ((self.crc_bytes[0] as u16) << 8) | self.crc_bytes[1] as u16;
        let event = if crc16(&self.collected) == wire_crc {
            DecodeEvent::Frame(Frame {
                command: self.collected[0],
                payload: self.collected[HEADER_LEN..].to_vec(),
            })
        } else {
            DecodeEvent::CrcMismatch
        };

        self.reset();
        event
    }

    /// Feeds raw bytes in; yields every complete frame found.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<DecodeEvent> {
        let mut events = Vec::new();

        for &byte in chunk {
            match self.state {
                State::Seek => {
                    if byte == FLAG {
                        self.state = State::Header;
                    }
                }
                State::Header => {
                    // Repeated sentinels between frames are idle noise.
                    if self.collected.is_empty() && !self.esc && byte == FLAG {
                        continue;
                    }
                    if let Some(b) = self.unescape(byte) {
                        self.collected.push(b);
                        if self.collected.len() == HEADER_LEN {
                            let len =
                                ((self.collected[1] as usize) << 8) | self.collected[2] as usize;
                            self.state = if len == 0 {
                                State::Crc
                            } else {
                                State::Payload { remaining: len }
                            };
                        }
                    }
                }
                State::Payload { remaining } => {
                    let consumed = if self.transcode {
                        match self.unescape(byte) {
                            Some(b) => {
                                self.collected.push(b);
                                true
                            }
                            None => false,
                        }
                    } else {
                        self.collected.push(byte);
                        true
                    };

                    if consumed {
                        if remaining == 1 {
                            self.state = State::Crc;
                        } else {
                            self.state = State::Payload { remaining: remaining - 1 };
                        }
                    }
                }
                State::Crc => {
                    if let Some(b) = self.unescape(byte) {
                        self.crc_bytes.push(b);
                        if self.crc_bytes.len() == CRC_LEN {
                            events.push(self.finish_frame());
                            self.state = State::Close;
                        }
                    }
                }
                State::Close => {
                    // The closing sentinel doubles as the next opener.
                    self.state = if byte == FLAG { State::Header } else { State::Seek };
                }
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(encoder: &FrameEncoder, decoder: &mut FrameDecoder, cmd: u8, payload: &[u8]) {
        let wire = encoder.encode(cmd, payload).unwrap();
        let events = decoder.push(&wire);
        assert_eq!(
            events,
            vec![DecodeEvent::Frame(Frame { command: cmd, payload: payload.to_vec() })]
        );
    }

    #[test]
    fn crc16_known_vector() {
        // CRC-16/XMODEM of "123456789".
        assert_eq!(crc16(b"123456789"), 0x31C3);
        assert_eq!(crc16(b""), 0x0000);
    }

    #[test]
    fn roundtrip_plain_payloads() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        roundtrip(&encoder, &mut decoder, 0x00, b"");
        roundtrip(&encoder, &mut decoder, 0x01, b"hello");
        roundtrip(&encoder, &mut decoder, 0x02, &[0u8; 1024]);
    }

    #[test]
    fn roundtrip_payloads_with_reserved_bytes() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        roundtrip(&encoder, &mut decoder, 0x81, &[0x7E, 0x7D, 0x7E, 0x00, 0x7D]);
    }

    #[test]
    fn reserved_bytes_are_escaped_on_the_wire() {
        let encoder = FrameEncoder::new();
        let wire = encoder.encode(0x01, &[0x7E]).unwrap();

        // No bare 0x7E may appear between the sentinels.
        assert!(!wire[1..wire.len() - 1].contains(&FLAG));
        assert!(wire[1..wire.len() - 1].windows(2).any(|w| w == [ESCAPE, 0x5E]));
    }

    #[test]
    fn roundtrip_across_transcode_boundary() {
        let mut encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        roundtrip(&encoder, &mut decoder, 0x02, &[0x7E, 0x11, 0x7D]);

        encoder.disable_transcode();
        decoder.disable_transcode();

        // Same payload travels verbatim now; the length field carries it.
        let payload = [0x7E, 0x11, 0x7D];
        let wire = encoder.encode(0x02, &payload).unwrap();
        assert!(wire[4..4 + payload.len()].contains(&FLAG));

        let events = decoder.push(&wire);
        assert_eq!(
            events,
            vec![DecodeEvent::Frame(Frame { command: 0x02, payload: payload.to_vec() })]
        );
    }

    #[test]
    fn single_bit_flip_is_rejected_everywhere() {
        let encoder = FrameEncoder::new();
        let wire = encoder.encode(0x01, b"payload under test").unwrap();

        // Flip one bit in every interior position; each corruption must be
        // discarded, never surfaced as a valid frame with wrong bytes.
        for pos in 1..wire.len() - 1 {
            for bit in 0..8 {
                let mut corrupted = wire.clone();
                corrupted[pos] ^= 1 << bit;

                let mut decoder = FrameDecoder::new();
                let events = decoder.push(&corrupted);

                let ok = events.iter().all(|e| match e {
                    DecodeEvent::CrcMismatch => true,
                    // A flip may damage framing so no frame completes at
                    // all, or recreate an escape; it must never produce a
                    // frame different from the original payload.
                    DecodeEvent::Frame(f) => f.command == 0x01 && f.payload == b"payload under test",
                });
                assert!(ok, "corruption at byte {pos} bit {bit} leaked through");
            }
        }
    }

    #[test]
    fn resynchronizes_after_a_bad_frame() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        let mut bad = encoder.encode(0x01, b"first").unwrap();
        bad[4] ^= 0xFF;
        let good = encoder.encode(0x02, b"second").unwrap();

        let mut events = decoder.push(&bad);
        events.extend(decoder.push(&good));

        assert!(events.contains(&DecodeEvent::CrcMismatch));
        assert!(events.contains(&DecodeEvent::Frame(Frame {
            command: 0x02,
            payload: b"second".to_vec()
        })));
    }

    #[test]
    fn frames_split_across_reads_reassemble() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();
        let wire = encoder.encode(0x93, &[0xAB; 300]).unwrap();

        let mut events = Vec::new();
        for chunk in wire.chunks(7) {
            events.extend(decoder.push(chunk));
        }

        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], DecodeEvent::Frame(f) if f.payload == vec![0xAB; 300]));
    }

    #[test]
    fn back_to_back_frames_share_a_sentinel() {
        let encoder = FrameEncoder::new();
        let mut decoder = FrameDecoder::new();

        let mut wire = encoder.encode(0x01, b"a").unwrap();
        // Device sends the next frame reusing the closing flag as opener.
        wire.extend_from_slice(&encoder.encode(0x02, b"b").unwrap()[1..]);

        let events = decoder.push(&wire);
        assert_eq!(events.len(), 2);
    }
}
