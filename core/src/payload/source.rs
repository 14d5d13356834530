/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Random-access blob sources for the payload extractor: local files and
//! HTTP range reads for the remote streaming mode.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Error, Result};

/// Ranged GET attempts before a network failure turns fatal.
const HTTP_ATTEMPTS: u32 = 3;
/// Base backoff; attempts wait 1x, 2x, 4x this.
const HTTP_BACKOFF: Duration = Duration::from_millis(500);

/// Random-access byte source backing a payload blob.
///
/// Implementations own an independent cursor, so distinct partitions can
/// extract concurrently from separate source instances.
#[async_trait]
pub trait BlobSource: Send {
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>>;
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Local payload file, opened read-only with its own cursor.
pub struct FileSource {
    file: tokio::fs::File,
    len: u64,
}

impl FileSource {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| Error::user_input(format!("{}: {e}", path.display())))?;
        let len = file
            .metadata()
            .await
            .map_err(|e| Error::user_input(format!("{}: {e}", path.display())))?
            .len();

        Ok(FileSource { file, len })
    }
}

#[async_trait]
impl BlobSource for FileSource {
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.len {
            return Err(Error::proto(format!(
                "blob read of {len} bytes at {offset} beyond payload end ({})",
                self.len
            )));
        }

        self.file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Remote payload over HTTP range requests.
pub struct HttpSource {
    client: reqwest::Client,
    url: String,
    len: u64,
}

impl HttpSource {
    /// Probes the remote size and verifies range support.
    pub async fn open(url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| Error::internal(format!("http client: {e}")))?;

        let resp = client
            .head(url)
            .send()
            .await
            .map_err(|e| Error::user_input(format!("cannot reach {url}: {e}")))?;

        if !resp.status().is_success() {
            return Err(Error::user_input(format!("{url} answered {}", resp.status())));
        }

        let len = resp
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| Error::user_input(format!("{url} reports no content length")))?;

        Ok(HttpSource { client, url: url.to_string(), len })
    }

    async fn ranged_get(&self, offset: u64, len: usize) -> std::result::Result<Vec<u8>, String> {
        let range = format!("bytes={}-{}", offset, offset + len as u64 - 1);

        let resp = self
            .client
            .get(&self.url)
            .header(reqwest::header::RANGE, range)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        if resp.status() != reqwest::StatusCode::PARTIAL_CONTENT && !resp.status().is_success() {
            return Err(format!("status {}", resp.status()));
        }

        let body = resp.bytes().await.map_err(|e| e.to_string())?;
        if body.len() != len {
            return Err(format!("short range response: {} of {len} bytes", body.len()));
        }

        Ok(body.to_vec())
    }
}

#[async_trait]
impl BlobSource for HttpSource {
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset + len as u64 > self.len {
            return Err(Error::proto(format!(
                "range read of {len} bytes at {offset} beyond remote end ({})",
                self.len
            )));
        }

        let mut last_error = String::new();
        for attempt in 0..HTTP_ATTEMPTS {
            if attempt > 0 {
                let backoff = HTTP_BACKOFF * (1 << (attempt - 1));
                warn!("range read failed ({last_error}), retrying in {backoff:?}");
                tokio::time::sleep(backoff).await;
            }

            match self.ranged_get(offset, len).await {
                Ok(body) => {
                    debug!("GET [{offset}, +{len}) ok on attempt {}", attempt + 1);
                    return Ok(body);
                }
                Err(e) => last_error = e,
            }
        }

        Err(Error::disconnected(format!(
            "remote payload unreachable after {HTTP_ATTEMPTS} attempts: {last_error}"
        )))
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// In-memory source for tests and for payloads already staged in RAM.
pub struct MemorySource {
    data: Vec<u8>,
}

impl MemorySource {
    pub fn new(data: Vec<u8>) -> Self {
        MemorySource { data }
    }
}

#[async_trait]
impl BlobSource for MemorySource {
    async fn read_at(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let end = offset as usize + len;
        if end > self.data.len() {
            return Err(Error::proto("memory source read out of range"));
        }
        Ok(self.data[offset as usize..end].to_vec())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
