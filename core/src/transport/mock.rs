/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Scripted in-memory transport for exercising protocol clients without
//! hardware. Test-support only; not part of the stable API.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::transport::{Transport, deadline_lapsed};

#[derive(Debug)]
enum Step {
    /// Bytes the client is expected to write next (strict mode only).
    Expect(Vec<u8>),
    /// Bytes served to subsequent reads.
    Reply(Vec<u8>),
    /// Reads block until the deadline lapses.
    Hang,
    /// Every following I/O fails with `Disconnected`.
    Disconnect,
}

/// A transport driven by a pre-recorded script of expected writes and
/// canned replies.
///
/// In strict mode every written byte must match the scripted `Expect`
/// steps, in order; chunked writes are allowed (each write consumes a
/// prefix). In loose mode writes are only logged and replies are served
/// in script order.
#[derive(Debug)]
pub struct MockTransport {
    steps: VecDeque<Step>,
    cursor: usize,
    written: Vec<u8>,
    strict: bool,
    open: bool,
    max_bulk: usize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        MockTransport {
            steps: VecDeque::new(),
            cursor: 0,
            written: Vec::new(),
            strict: true,
            open: true,
            max_bulk: 0x40000,
        }
    }

    /// Switches to loose mode: writes are logged but not matched.
    pub fn loose(mut self) -> Self {
        self.strict = false;
        self
    }

    pub fn with_max_bulk(mut self, max_bulk: usize) -> Self {
        self.max_bulk = max_bulk;
        self
    }

    pub fn expect_write(mut self, bytes: &[u8]) -> Self {
        self.steps.push_back(Step::Expect(bytes.to_vec()));
        self
    }

    pub fn reply(mut self, bytes: &[u8]) -> Self {
        self.steps.push_back(Step::Reply(bytes.to_vec()));
        self
    }

    pub fn hang(mut self) -> Self {
        self.steps.push_back(Step::Hang);
        self
    }

    pub fn disconnect(mut self) -> Self {
        self.steps.push_back(Step::Disconnect);
        self
    }

    /// Every byte the client has written so far, in order.
    pub fn written(&self) -> &[u8] {
        &self.written
    }

    /// True once every scripted step has been consumed.
    pub fn script_exhausted(&self) -> bool {
        self.steps.is_empty()
    }

    fn pop_front(&mut self) {
        self.steps.pop_front();
        self.cursor = 0;
    }

    /// Drops leading steps a read is allowed to skip over in loose mode.
    fn skip_expects(&mut self) {
        while matches!(self.steps.front(), Some(Step::Expect(_))) && !self.strict {
            self.pop_front();
        }
    }

    fn consume_write(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.steps.front() {
                Some(Step::Disconnect) => return Err(Error::disconnected("mock: unplugged")),
                Some(Step::Expect(expected)) => {
                    let remaining = &expected[self.cursor..];
                    let n = remaining.len().min(data.len());
                    if remaining[..n] != data[..n] {
                        return Err(Error::internal(format!(
                            "mock: write mismatch, expected {:02X?} got {:02X?}",
                            &remaining[..n],
                            &data[..n]
                        )));
                    }
                    self.cursor += n;
                    if self.cursor == expected.len() {
                        self.pop_front();
                    }
                    data = &data[n..];
                }
                other => {
                    return Err(Error::internal(format!(
                        "mock: unexpected write {:02X?} while script front is {other:?}",
                        data
                    )));
                }
            }
        }
        Ok(())
    }

    fn serve_read(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        self.skip_expects();

        match self.steps.front() {
            Some(Step::Reply(reply)) => {
                let remaining = &reply[self.cursor..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                self.cursor += n;
                if self.cursor == reply.len() {
                    self.pop_front();
                }
                Ok(Some(n))
            }
            Some(Step::Disconnect) => Err(Error::disconnected("mock: unplugged")),
            Some(Step::Hang) | Some(Step::Expect(_)) | None => Ok(None),
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        self.open = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    async fn read_exact(&mut self, buf: &mut [u8], deadline: Duration) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.serve_read(&mut buf[filled..])? {
                Some(0) | None => {
                    // Scripted stall: behave like a lapsed deadline.
                    tokio::task::yield_now().await;
                    return Err(deadline_lapsed("mock read", deadline));
                }
                Some(n) => filled += n,
            }
        }
        Ok(())
    }

    async fn read_some(&mut self, buf: &mut [u8], _deadline: Duration) -> Result<usize> {
        tokio::task::yield_now().await;
        Ok(self.serve_read(buf)?.unwrap_or(0))
    }

    async fn write_all(&mut self, data: &[u8], _deadline: Duration) -> Result<()> {
        if !self.open {
            return Err(Error::disconnected("mock: closed"));
        }

        self.written.extend_from_slice(data);

        if self.strict {
            self.consume_write(data)
        } else {
            if matches!(self.steps.front(), Some(Step::Disconnect)) {
                return Err(Error::disconnected("mock: unplugged"));
            }
            Ok(())
        }
    }

    async fn drain(&mut self) -> Result<()> {
        // Scripted replies model future device responses, not stale
        // bytes; draining must leave them in place.
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.open && !matches!(self.steps.front(), Some(Step::Disconnect))
    }

    fn max_bulk_size(&self) -> usize {
        self.max_bulk
    }

    fn endpoint_name(&self) -> String {
        "mock".into()
    }

    async fn set_baud(&mut self, _rate: u32) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strict_script_matches_chunked_writes() {
        let mut t = MockTransport::new().expect_write(b"hello world").reply(b"ok");

        t.write_all(b"hello ", Duration::from_secs(1)).await.unwrap();
        t.write_all(b"world", Duration::from_secs(1)).await.unwrap();

        let mut buf = [0u8; 2];
        t.read_exact(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf, b"ok");
        assert!(t.script_exhausted());
    }

    #[tokio::test]
    async fn mismatched_write_is_rejected() {
        let mut t = MockTransport::new().expect_write(b"abc");
        let err = t.write_all(b"abd", Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[tokio::test]
    async fn disconnect_step_fails_io() {
        let mut t = MockTransport::new().disconnect();
        let mut buf = [0u8; 1];
        let err = t.read_exact(&mut buf, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, Error::Disconnected(_)));
    }

    #[tokio::test]
    async fn reads_span_adjacent_replies() {
        let mut t = MockTransport::new().loose().reply(b"ab").reply(b"cd");
        let mut buf = [0u8; 4];
        t.read_exact(&mut buf, Duration::from_secs(1)).await.unwrap();
        assert_eq!(&buf, b"abcd");
    }
}
