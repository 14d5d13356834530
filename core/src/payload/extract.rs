/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
use std::io::Read;
use std::path::Path;

use log::{debug, info};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::payload::bspatch::bspatch;
use crate::payload::manifest::{
    Extent, InstallOperation, Manifest, OpType, PAYLOAD_HEADER_LEN, PayloadHeader,
    PayloadPartition,
};
use crate::payload::source::BlobSource;

/// A/B OTA payload extractor: opens the container once, then extracts
/// partitions on demand.
pub struct PayloadExtractor {
    source: Box<dyn BlobSource>,
    manifest: Manifest,
    blob_offset: u64,
}

impl PayloadExtractor {
    /// Reads the header and manifest out of `source`.
    pub async fn open(mut source: Box<dyn BlobSource>) -> Result<Self> {
        let header_bytes = source.read_at(0, PAYLOAD_HEADER_LEN).await?;
        let header = PayloadHeader::parse(&header_bytes)?;

        if header.manifest_size > 64 * 1024 * 1024 {
            return Err(Error::proto(format!(
                "manifest of {} bytes is implausibly large",
                header.manifest_size
            )));
        }

        let manifest_bytes = source
            .read_at(PAYLOAD_HEADER_LEN as u64, header.manifest_size as usize)
            .await?;
        let manifest = Manifest::parse(&manifest_bytes)?;

        info!(
            "payload: {} partitions, {}-byte blocks",
            manifest.partitions.len(),
            manifest.block_size
        );

        Ok(PayloadExtractor { source, manifest, blob_offset: header.blob_offset() })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn partition(&self, name: &str) -> Option<&PayloadPartition> {
        self.manifest.partition(name)
    }

    /// Extracts one partition to `out_path`. `old_path` supplies the
    /// source image for delta operations; full payloads never need it.
    pub async fn extract_partition(
        &mut self,
        name: &str,
        out_path: &Path,
        old_path: Option<&Path>,
        cancel: &CancelToken,
        progress: &mut (dyn FnMut(u64, u64) + Send),
    ) -> Result<()> {
        let part = self
            .manifest
            .partition(name)
            .ok_or_else(|| Error::user_input(format!("payload has no partition '{name}'")))?
            .clone();

        let block_size = self.manifest.block_size as u64;
        let new_size = part.new_info.size;
        info!("extracting '{name}' ({new_size} bytes, {} ops)", part.operations.len());

        let mut out = tokio::fs::File::create(out_path).await?;
        out.set_len(new_size).await?;

        let mut old = match old_path {
            Some(p) => Some(tokio::fs::File::open(p).await.map_err(|e| {
                Error::user_input(format!("source image {}: {e}", p.display()))
            })?),
            None => None,
        };

        let mut written = 0u64;
        for (index, op) in part.operations.iter().enumerate() {
            cancel.check()?;
            debug!("op {index}: {:?}", op.op);

            let out_bytes = self
                .apply_operation(op, block_size, &mut out, old.as_mut(), name)
                .await?;

            written += out_bytes;
            progress(written.min(new_size), new_size);
        }

        out.flush().await?;

        if !part.new_info.hash.is_empty() {
            verify_file_hash(out_path, &part.new_info.hash, new_size).await.map_err(|e| {
                match e {
                    Error::Integrity(msg) => {
                        Error::integrity(format!("'{name}' after extraction: {msg}"))
                    }
                    other => other,
                }
            })?;
        }

        progress(new_size, new_size);
        info!("'{name}' extracted and verified");
        Ok(())
    }

    async fn read_op_data(&mut self, op: &InstallOperation) -> Result<Vec<u8>> {
        let data = self
            .source
            .read_at(self.blob_offset + op.data_offset, op.data_length as usize)
            .await?;

        if let Some(expected) = &op.data_sha256 {
            let actual = Sha256::digest(&data);
            if actual.as_slice() != expected.as_slice() {
                return Err(Error::integrity(format!(
                    "operation data hash mismatch at blob offset {}",
                    op.data_offset
                )));
            }
        }

        Ok(data)
    }

    /// Applies one install operation; returns the bytes it produced.
    async fn apply_operation(
        &mut self,
        op: &InstallOperation,
        block_size: u64,
        out: &mut tokio::fs::File,
        old: Option<&mut tokio::fs::File>,
        name: &str,
    ) -> Result<u64> {
        let dst_bytes = extent_bytes(&op.dst_extents, block_size);

        match op.op {
            OpType::Replace => {
                let data = self.read_op_data(op).await?;
                write_extents(out, &op.dst_extents, block_size, &data).await?;
            }
            OpType::ReplaceBz => {
                let data = self.read_op_data(op).await?;
                let raw = decompress_bz(&data, dst_bytes)?;
                write_extents(out, &op.dst_extents, block_size, &raw).await?;
            }
            OpType::ReplaceXz => {
                let data = self.read_op_data(op).await?;
                let raw = decompress_xz(&data, dst_bytes)?;
                write_extents(out, &op.dst_extents, block_size, &raw).await?;
            }
            OpType::Zero | OpType::Discard => {
                let zeros = vec![0u8; block_size as usize];
                for extent in &op.dst_extents {
                    for block in 0..extent.num_blocks {
                        let at = (extent.start_block + block) * block_size;
                        out.seek(std::io::SeekFrom::Start(at)).await?;
                        out.write_all(&zeros).await?;
                    }
                }
            }
            OpType::SourceCopy => {
                let old = old.ok_or_else(|| {
                    Error::user_input(format!(
                        "'{name}' is a delta update and needs the original image"
                    ))
                })?;
                let data = read_extents(old, &op.src_extents, block_size).await?;
                write_extents(out, &op.dst_extents, block_size, &data).await?;
            }
            OpType::Bsdiff | OpType::SourceBsdiff | OpType::BrotliBsdiff => {
                let patch = self.read_op_data(op).await?;
                let old = old.ok_or_else(|| {
                    Error::user_input(format!(
                        "'{name}' is a delta update and needs the original image"
                    ))
                })?;
                let src = read_extents(old, &op.src_extents, block_size).await?;
                let new = bspatch(&src, &patch)?;
                write_extents(out, &op.dst_extents, block_size, &new).await?;
            }
            OpType::Puffdiff => {
                return Err(Error::unsupported(
                    "PUFFDIFF operations are not implemented; re-extract from a full OTA",
                ));
            }
            OpType::Move => {
                return Err(Error::unsupported("legacy MOVE operations are not implemented"));
            }
            OpType::Unknown(code) => {
                return Err(Error::unsupported(format!("install operation type {code}")));
            }
        }

        Ok(dst_bytes)
    }
}

fn extent_bytes(extents: &[Extent], block_size: u64) -> u64 {
    extents.iter().map(|e| e.num_blocks * block_size).sum()
}

fn decompress_bz(data: &[u8], expected: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected as usize);
    bzip2::read::BzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::integrity(format!("bzip2 operation data: {e}")))?;
    Ok(out)
}

fn decompress_xz(data: &[u8], expected: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected as usize);
    xz2::read::XzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::integrity(format!("xz operation data: {e}")))?;
    Ok(out)
}

/// Writes `data` across the destination extents in order. Data shorter
/// than the extents leaves the tail untouched (already zeroed by the
/// pre-allocation).
async fn write_extents(
    out: &mut tokio::fs::File,
    extents: &[Extent],
    block_size: u64,
    data: &[u8],
) -> Result<()> {
    let mut consumed = 0usize;

    for extent in extents {
        if consumed >= data.len() {
            break;
        }

        let capacity = (extent.num_blocks * block_size) as usize;
        let take = capacity.min(data.len() - consumed);

        out.seek(std::io::SeekFrom::Start(extent.start_block * block_size)).await?;
        out.write_all(&data[consumed..consumed + take]).await?;
        consumed += take;
    }

    if consumed < data.len() {
        return Err(Error::proto(format!(
            "operation produced {} bytes but destination extents hold {consumed}",
            data.len()
        )));
    }

    Ok(())
}

async fn read_extents(
    file: &mut tokio::fs::File,
    extents: &[Extent],
    block_size: u64,
) -> Result<Vec<u8>> {
    let total = extent_bytes(extents, block_size) as usize;
    let mut out = Vec::with_capacity(total);

    for extent in extents {
        let len = (extent.num_blocks * block_size) as usize;
        let mut buf = vec![0u8; len];
        file.seek(std::io::SeekFrom::Start(extent.start_block * block_size)).await?;
        file.read_exact(&mut buf).await?;
        out.extend_from_slice(&buf);
    }

    Ok(out)
}

async fn verify_file_hash(path: &Path, expected: &[u8], size: u64) -> Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut remaining = size;
    let mut buf = vec![0u8; 1 << 20];

    while remaining > 0 {
        let n = buf.len().min(remaining as usize);
        file.read_exact(&mut buf[..n]).await?;
        hasher.update(&buf[..n]);
        remaining -= n as u64;
    }

    let actual = hasher.finalize();
    if actual.as_slice() != expected {
        return Err(Error::integrity(format!(
            "SHA-256 mismatch: manifest {}, file {}",
            hex::encode(expected),
            hex::encode(actual)
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use sha2::{Digest, Sha256};

    use super::*;
    use crate::payload::manifest::testdata::encode_payload;
    use crate::payload::manifest::{PartitionInfo, PayloadPartition};
    use crate::payload::source::MemorySource;

    const BLOCK: u64 = 4096;

    fn temp(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("cinder-payload-{}-{name}", std::process::id()))
    }

    fn replace_op(data: &[u8], offset: u64, dst: &[Extent]) -> InstallOperation {
        InstallOperation {
            op: OpType::Replace,
            data_offset: offset,
            data_length: data.len() as u64,
            data_sha256: Some(Sha256::digest(data).to_vec()),
            src_extents: vec![],
            dst_extents: dst.to_vec(),
        }
    }

    /// Payload with three REPLACE ops over scattered extents, matching
    /// the shape of a full-image system payload.
    fn build_replace_payload() -> (Vec<u8>, Vec<u8>) {
        let blobs: [Vec<u8>; 3] = [
            (0..4 * BLOCK).map(|i| (i % 197) as u8).collect(),
            (0..8 * BLOCK).map(|i| (i % 193) as u8).collect(),
            (0..4 * BLOCK).map(|i| (i % 191) as u8).collect(),
        ];

        let mut expected = vec![0u8; 16 * BLOCK as usize];
        expected[..4 * BLOCK as usize].copy_from_slice(&blobs[0]);
        expected[4 * BLOCK as usize..12 * BLOCK as usize].copy_from_slice(&blobs[1]);
        expected[12 * BLOCK as usize..].copy_from_slice(&blobs[2]);

        let mut blob = Vec::new();
        let mut ops = Vec::new();
        for (data, dst) in [
            (&blobs[0], Extent { start_block: 0, num_blocks: 4 }),
            (&blobs[1], Extent { start_block: 4, num_blocks: 8 }),
            (&blobs[2], Extent { start_block: 12, num_blocks: 4 }),
        ] {
            ops.push(replace_op(data, blob.len() as u64, &[dst]));
            blob.extend_from_slice(data);
        }

        let manifest = Manifest {
            block_size: BLOCK as u32,
            partitions: vec![PayloadPartition {
                name: "system".into(),
                new_info: PartitionInfo {
                    size: expected.len() as u64,
                    hash: Sha256::digest(&expected).to_vec(),
                },
                old_info: None,
                operations: ops,
            }],
        };

        (encode_payload(&manifest, &blob), expected)
    }

    #[tokio::test]
    async fn replace_payload_extracts_and_verifies() {
        let (payload, expected) = build_replace_payload();
        let out_path = temp("replace.img");

        let mut extractor =
            PayloadExtractor::open(Box::new(MemorySource::new(payload))).await.unwrap();

        let cancel = CancelToken::new();
        let mut last = (0, 0);
        let mut progress = |done: u64, total: u64| last = (done, total);
        extractor
            .extract_partition("system", &out_path, None, &cancel, &mut progress)
            .await
            .unwrap();

        let out = tokio::fs::read(&out_path).await.unwrap();
        tokio::fs::remove_file(&out_path).await.ok();

        assert_eq!(out.len(), expected.len());
        assert_eq!(out, expected);
        assert_eq!(last, (expected.len() as u64, expected.len() as u64));
    }

    #[tokio::test]
    async fn extraction_is_deterministic() {
        let (payload, _) = build_replace_payload();
        let a = temp("det-a.img");
        let b = temp("det-b.img");

        let cancel = CancelToken::new();
        let mut progress = |_: u64, _: u64| {};

        let mut extractor =
            PayloadExtractor::open(Box::new(MemorySource::new(payload))).await.unwrap();
        extractor.extract_partition("system", &a, None, &cancel, &mut progress).await.unwrap();
        extractor.extract_partition("system", &b, None, &cancel, &mut progress).await.unwrap();

        let first = tokio::fs::read(&a).await.unwrap();
        let second = tokio::fs::read(&b).await.unwrap();
        tokio::fs::remove_file(&a).await.ok();
        tokio::fs::remove_file(&b).await.ok();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn corrupted_blob_data_fails_the_hash_check() {
        let (mut payload, _) = build_replace_payload();
        let len = payload.len();
        payload[len - 1] ^= 0xFF; // last blob byte

        let out_path = temp("corrupt.img");
        let mut extractor =
            PayloadExtractor::open(Box::new(MemorySource::new(payload))).await.unwrap();

        let cancel = CancelToken::new();
        let mut progress = |_: u64, _: u64| {};
        let err = extractor
            .extract_partition("system", &out_path, None, &cancel, &mut progress)
            .await
            .unwrap_err();
        tokio::fs::remove_file(&out_path).await.ok();

        assert!(matches!(err, Error::Integrity(_)));
    }

    #[tokio::test]
    async fn zero_ops_blank_their_extents() {
        let data: Vec<u8> = (0..2 * BLOCK).map(|i| (i % 251) as u8).collect();
        let mut expected = vec![0u8; 4 * BLOCK as usize];
        expected[..2 * BLOCK as usize].copy_from_slice(&data);

        let manifest = Manifest {
            block_size: BLOCK as u32,
            partitions: vec![PayloadPartition {
                name: "cache".into(),
                new_info: PartitionInfo {
                    size: expected.len() as u64,
                    hash: Sha256::digest(&expected).to_vec(),
                },
                old_info: None,
                operations: vec![
                    replace_op(&data, 0, &[Extent { start_block: 0, num_blocks: 2 }]),
                    InstallOperation {
                        op: OpType::Zero,
                        data_offset: 0,
                        data_length: 0,
                        data_sha256: None,
                        src_extents: vec![],
                        dst_extents: vec![Extent { start_block: 2, num_blocks: 2 }],
                    },
                ],
            }],
        };

        let payload = encode_payload(&manifest, &data);
        let out_path = temp("zero.img");

        let mut extractor =
            PayloadExtractor::open(Box::new(MemorySource::new(payload))).await.unwrap();
        let cancel = CancelToken::new();
        let mut progress = |_: u64, _: u64| {};
        extractor
            .extract_partition("cache", &out_path, None, &cancel, &mut progress)
            .await
            .unwrap();

        let out = tokio::fs::read(&out_path).await.unwrap();
        tokio::fs::remove_file(&out_path).await.ok();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn source_copy_without_old_image_is_a_user_error() {
        let manifest = Manifest {
            block_size: BLOCK as u32,
            partitions: vec![PayloadPartition {
                name: "vendor".into(),
                new_info: PartitionInfo { size: BLOCK, hash: vec![] },
                old_info: Some(PartitionInfo::default()),
                operations: vec![InstallOperation {
                    op: OpType::SourceCopy,
                    data_offset: 0,
                    data_length: 0,
                    data_sha256: None,
                    src_extents: vec![Extent { start_block: 0, num_blocks: 1 }],
                    dst_extents: vec![Extent { start_block: 0, num_blocks: 1 }],
                }],
            }],
        };

        let payload = encode_payload(&manifest, &[]);
        let out_path = temp("delta.img");

        let mut extractor =
            PayloadExtractor::open(Box::new(MemorySource::new(payload))).await.unwrap();
        let cancel = CancelToken::new();
        let mut progress = |_: u64, _: u64| {};
        let err = extractor
            .extract_partition("vendor", &out_path, None, &cancel, &mut progress)
            .await
            .unwrap_err();
        tokio::fs::remove_file(&out_path).await.ok();

        assert!(matches!(err, Error::UserInput(_)));
    }

    #[tokio::test]
    async fn source_copy_moves_old_extents() {
        let old_data: Vec<u8> = (0..2 * BLOCK).map(|i| (i % 181) as u8).collect();
        let old_path = temp("old.img");
        tokio::fs::write(&old_path, &old_data).await.unwrap();

        // New image swaps the two blocks of the old image.
        let mut expected = vec![0u8; 2 * BLOCK as usize];
        expected[..BLOCK as usize].copy_from_slice(&old_data[BLOCK as usize..]);
        expected[BLOCK as usize..].copy_from_slice(&old_data[..BLOCK as usize]);

        let manifest = Manifest {
            block_size: BLOCK as u32,
            partitions: vec![PayloadPartition {
                name: "odm".into(),
                new_info: PartitionInfo {
                    size: expected.len() as u64,
                    hash: Sha256::digest(&expected).to_vec(),
                },
                old_info: Some(PartitionInfo::default()),
                operations: vec![
                    InstallOperation {
                        op: OpType::SourceCopy,
                        data_offset: 0,
                        data_length: 0,
                        data_sha256: None,
                        src_extents: vec![Extent { start_block: 1, num_blocks: 1 }],
                        dst_extents: vec![Extent { start_block: 0, num_blocks: 1 }],
                    },
                    InstallOperation {
                        op: OpType::SourceCopy,
                        data_offset: 0,
                        data_length: 0,
                        data_sha256: None,
                        src_extents: vec![Extent { start_block: 0, num_blocks: 1 }],
                        dst_extents: vec![Extent { start_block: 1, num_blocks: 1 }],
                    },
                ],
            }],
        };

        let payload = encode_payload(&manifest, &[]);
        let out_path = temp("swapped.img");

        let mut extractor =
            PayloadExtractor::open(Box::new(MemorySource::new(payload))).await.unwrap();
        let cancel = CancelToken::new();
        let mut progress = |_: u64, _: u64| {};
        extractor
            .extract_partition("odm", &out_path, Some(&old_path), &cancel, &mut progress)
            .await
            .unwrap();

        let out = tokio::fs::read(&out_path).await.unwrap();
        tokio::fs::remove_file(&out_path).await.ok();
        tokio::fs::remove_file(&old_path).await.ok();
        assert_eq!(out, expected);
    }

    #[tokio::test]
    async fn compressed_replace_ops_decompress_to_extents() {
        let raw: Vec<u8> = (0..BLOCK).map(|i| (i % 7) as u8).collect();
        let mut bz = Vec::new();
        bzip2::read::BzEncoder::new(&raw[..], bzip2::Compression::default())
            .read_to_end(&mut bz)
            .unwrap();

        let manifest = Manifest {
            block_size: BLOCK as u32,
            partitions: vec![PayloadPartition {
                name: "boot".into(),
                new_info: PartitionInfo {
                    size: BLOCK,
                    hash: Sha256::digest(&raw).to_vec(),
                },
                old_info: None,
                operations: vec![InstallOperation {
                    op: OpType::ReplaceBz,
                    data_offset: 0,
                    data_length: bz.len() as u64,
                    data_sha256: Some(Sha256::digest(&bz).to_vec()),
                    src_extents: vec![],
                    dst_extents: vec![Extent { start_block: 0, num_blocks: 1 }],
                }],
            }],
        };

        let payload = encode_payload(&manifest, &bz);
        let out_path = temp("bz.img");

        let mut extractor =
            PayloadExtractor::open(Box::new(MemorySource::new(payload))).await.unwrap();
        let cancel = CancelToken::new();
        let mut progress = |_: u64, _: u64| {};
        extractor
            .extract_partition("boot", &out_path, None, &cancel, &mut progress)
            .await
            .unwrap();

        let out = tokio::fs::read(&out_path).await.unwrap();
        tokio::fs::remove_file(&out_path).await.ok();
        assert_eq!(out, raw);
    }
}
