/*
    SPDX-License-Identifier: AGPL-3.0-or-later
    SPDX-FileCopyrightText: 2025 Shomy
*/
//! Android sparse image format: a 28-byte file header followed by chunks
//! of RAW / FILL / DONT_CARE / CRC32 data, each with a 12-byte header.
//!
//! Two consumers: the Spreadtrum write path expands sparse streams to raw
//! blocks on the fly, and the Fastboot path splits oversized images into
//! self-contained sparse sub-images that the firmware concatenates.

use std::io::{Read, Seek, SeekFrom};

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::{le_u16, le_u32};

pub const SPARSE_MAGIC: u32 = 0xED26_FF3A;
pub const FILE_HEADER_LEN: usize = 28;
pub const CHUNK_HEADER_LEN: usize = 12;

const CHUNK_RAW: u16 = 0xCAC1;
const CHUNK_FILL: u16 = 0xCAC2;
const CHUNK_DONT_CARE: u16 = 0xCAC3;
const CHUNK_CRC32: u16 = 0xCAC4;

/// True when `data` starts with a plausible sparse file header.
pub fn is_sparse(data: &[u8]) -> bool {
    data.len() >= FILE_HEADER_LEN && le_u32!(data, 0) == SPARSE_MAGIC
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SparseHeader {
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_chunks: u32,
}

impl SparseHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < FILE_HEADER_LEN {
            return Err(Error::proto("sparse header truncated"));
        }
        if le_u32!(data, 0) != SPARSE_MAGIC {
            return Err(Error::proto("not a sparse image"));
        }

        let major = le_u16!(data, 4);
        if major != 1 {
            return Err(Error::unsupported(format!("sparse major version {major}")));
        }

        let file_hdr_sz = le_u16!(data, 8) as usize;
        let chunk_hdr_sz = le_u16!(data, 10) as usize;
        if file_hdr_sz != FILE_HEADER_LEN || chunk_hdr_sz != CHUNK_HEADER_LEN {
            return Err(Error::proto("unexpected sparse header geometry"));
        }

        Ok(SparseHeader {
            block_size: le_u32!(data, 12),
            total_blocks: le_u32!(data, 16),
            total_chunks: le_u32!(data, 20),
        })
    }

    pub fn serialize(&self) -> [u8; FILE_HEADER_LEN] {
        let mut out = [0u8; FILE_HEADER_LEN];
        out[0..4].copy_from_slice(&SPARSE_MAGIC.to_le_bytes());
        out[4..6].copy_from_slice(&1u16.to_le_bytes());
        out[6..8].copy_from_slice(&0u16.to_le_bytes());
        out[8..10].copy_from_slice(&(FILE_HEADER_LEN as u16).to_le_bytes());
        out[10..12].copy_from_slice(&(CHUNK_HEADER_LEN as u16).to_le_bytes());
        out[12..16].copy_from_slice(&self.block_size.to_le_bytes());
        out[16..20].copy_from_slice(&self.total_blocks.to_le_bytes());
        out[20..24].copy_from_slice(&self.total_chunks.to_le_bytes());
        // image_checksum is unused by every flashing stack we speak to
        out
    }

    pub fn expanded_len(&self) -> u64 {
        self.total_blocks as u64 * self.block_size as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkKind {
    Raw,
    Fill,
    DontCare,
    Crc32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub kind: ChunkKind,
    pub blocks: u32,
    /// Total on-wire size of the chunk including this header.
    pub total_size: u32,
}

impl ChunkHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < CHUNK_HEADER_LEN {
            return Err(Error::proto("sparse chunk header truncated"));
        }

        let kind = match le_u16!(data, 0) {
            CHUNK_RAW => ChunkKind::Raw,
            CHUNK_FILL => ChunkKind::Fill,
            CHUNK_DONT_CARE => ChunkKind::DontCare,
            CHUNK_CRC32 => ChunkKind::Crc32,
            other => return Err(Error::proto(format!("unknown sparse chunk type 0x{other:04X}"))),
        };

        let total_size = le_u32!(data, 8);
        if total_size < CHUNK_HEADER_LEN as u32 {
            return Err(Error::proto(format!(
                "sparse chunk total_size {total_size} smaller than its header"
            )));
        }

        Ok(ChunkHeader { kind, blocks: le_u32!(data, 4), total_size })
    }

    pub fn serialize(&self) -> [u8; CHUNK_HEADER_LEN] {
        let raw_kind = match self.kind {
            ChunkKind::Raw => CHUNK_RAW,
            ChunkKind::Fill => CHUNK_FILL,
            ChunkKind::DontCare => CHUNK_DONT_CARE,
            ChunkKind::Crc32 => CHUNK_CRC32,
        };

        let mut out = [0u8; CHUNK_HEADER_LEN];
        out[0..2].copy_from_slice(&raw_kind.to_le_bytes());
        out[4..8].copy_from_slice(&self.blocks.to_le_bytes());
        out[8..12].copy_from_slice(&self.total_size.to_le_bytes());
        out
    }

    fn body_len(&self) -> u64 {
        self.total_size as u64 - CHUNK_HEADER_LEN as u64
    }
}

/// Fully expands an in-memory sparse image to its raw block contents.
/// DONT_CARE chunks expand to zeros.
pub fn expand(data: &[u8]) -> Result<Vec<u8>> {
    let header = SparseHeader::parse(data)?;
    let block_size = header.block_size as usize;
    let mut out = Vec::with_capacity(header.expanded_len() as usize);
    let mut pos = FILE_HEADER_LEN;

    for _ in 0..header.total_chunks {
        if data.len() < pos + CHUNK_HEADER_LEN {
            return Err(Error::proto("sparse image truncated mid-chunk"));
        }
        let chunk = ChunkHeader::parse(&data[pos..])?;
        let body = &data[pos + CHUNK_HEADER_LEN..];
        let chunk_bytes = chunk.blocks as usize * block_size;

        match chunk.kind {
            ChunkKind::Raw => {
                if chunk.body_len() as usize != chunk_bytes || body.len() < chunk_bytes {
                    return Err(Error::proto("raw chunk length mismatch"));
                }
                out.extend_from_slice(&body[..chunk_bytes]);
            }
            ChunkKind::Fill => {
                if chunk.body_len() != 4 || body.len() < 4 {
                    return Err(Error::proto("fill chunk needs a 4-byte pattern"));
                }
                let pattern: [u8; 4] = body[..4].try_into().unwrap();
                for _ in 0..chunk_bytes / 4 {
                    out.extend_from_slice(&pattern);
                }
            }
            ChunkKind::DontCare => {
                out.resize(out.len() + chunk_bytes, 0);
            }
            ChunkKind::Crc32 => {
                if chunk.body_len() != 4 {
                    return Err(Error::proto("crc32 chunk needs a 4-byte body"));
                }
            }
        }

        pos += chunk.total_size as usize;
    }

    if out.len() != header.expanded_len() as usize {
        return Err(Error::proto(format!(
            "sparse expansion produced {} bytes, header promises {}",
            out.len(),
            header.expanded_len()
        )));
    }

    Ok(out)
}

/// Streaming sparse-to-raw expander over an async byte source.
pub struct SparseReader<R> {
    inner: R,
    header: SparseHeader,
    chunks_left: u32,
    /// Current chunk being expanded, if any.
    current: Option<(ChunkKind, [u8; 4], u64)>,
}

impl<R: AsyncRead + Unpin + Send> SparseReader<R> {
    /// `header_bytes` are the 28 bytes the caller already consumed to
    /// detect the format; `inner` is positioned at the first chunk.
    pub fn resume(inner: R, header_bytes: &[u8]) -> Result<Self> {
        let header = SparseHeader::parse(header_bytes)?;
        Ok(SparseReader { inner, header, chunks_left: header.total_chunks, current: None })
    }

    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    pub fn expanded_len(&self) -> u64 {
        self.header.expanded_len()
    }

    async fn next_chunk(&mut self) -> Result<bool> {
        loop {
            if self.chunks_left == 0 {
                return Ok(false);
            }
            self.chunks_left -= 1;

            let mut hdr = [0u8; CHUNK_HEADER_LEN];
            self.inner.read_exact(&mut hdr).await?;
            let chunk = ChunkHeader::parse(&hdr)?;
            let chunk_bytes = chunk.blocks as u64 * self.header.block_size as u64;

            match chunk.kind {
                ChunkKind::Raw => {
                    self.current = Some((ChunkKind::Raw, [0; 4], chunk_bytes));
                    return Ok(true);
                }
                ChunkKind::Fill => {
                    let mut pattern = [0u8; 4];
                    self.inner.read_exact(&mut pattern).await?;
                    self.current = Some((ChunkKind::Fill, pattern, chunk_bytes));
                    return Ok(true);
                }
                ChunkKind::DontCare => {
                    self.current = Some((ChunkKind::DontCare, [0; 4], chunk_bytes));
                    return Ok(true);
                }
                ChunkKind::Crc32 => {
                    let mut skip = [0u8; 4];
                    self.inner.read_exact(&mut skip).await?;
                }
            }
        }
    }

    /// Yields the next expanded bytes into `buf`; `Ok(0)` at end of image.
    pub async fn read_expanded(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match &mut self.current {
                None => {
                    if !self.next_chunk().await? {
                        return Ok(0);
                    }
                }
                Some((_, _, 0)) => {
                    self.current = None;
                }
                Some((kind, pattern, remaining)) => {
                    let n = buf.len().min(*remaining as usize);
                    match kind {
                        ChunkKind::Raw => {
                            let got = self.inner.read(&mut buf[..n]).await?;
                            if got == 0 {
                                return Err(Error::proto("sparse stream ended inside a raw chunk"));
                            }
                            *remaining -= got as u64;
                            return Ok(got);
                        }
                        ChunkKind::Fill => {
                            // Chunk length is 4-aligned, so the pattern
                            // phase follows from the remaining count.
                            let phase = ((4 - (*remaining % 4)) % 4) as usize;
                            for (i, b) in buf[..n].iter_mut().enumerate() {
                                *b = pattern[(phase + i) % 4];
                            }
                            *remaining -= n as u64;
                            return Ok(n);
                        }
                        ChunkKind::DontCare => {
                            buf[..n].fill(0);
                            *remaining -= n as u64;
                            return Ok(n);
                        }
                        ChunkKind::Crc32 => unreachable!("crc chunks are consumed inline"),
                    }
                }
            }
        }
    }
}

/// One chunk of a planned sub-image. Bodies reference the source file so
/// splitting never loads whole images in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedBody {
    None,
    Fill([u8; 4]),
    /// Byte span inside the source file.
    Source { offset: u64, len: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedChunk {
    pub kind: ChunkKind,
    pub blocks: u32,
    pub body: PlannedBody,
}

/// A self-contained sparse sub-image covering `[start_block, start_block
/// + blocks)` of the destination partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubImage {
    pub start_block: u32,
    pub chunks: Vec<PlannedChunk>,
}

impl SubImage {
    fn payload_blocks(&self) -> u32 {
        self.chunks.iter().map(|c| c.blocks).sum()
    }

    /// Serialized size on the wire, skip chunk and headers included.
    pub fn wire_size(&self) -> u64 {
        let mut size = (FILE_HEADER_LEN + CHUNK_HEADER_LEN) as u64; // header + skip chunk
        if self.start_block == 0 {
            size -= CHUNK_HEADER_LEN as u64;
        }
        for chunk in &self.chunks {
            size += CHUNK_HEADER_LEN as u64;
            size += match &chunk.body {
                PlannedBody::None => 0,
                PlannedBody::Fill(_) => 4,
                PlannedBody::Source { len, .. } => *len,
            };
        }
        size
    }

    /// Serializes this sub-image, pulling chunk bodies out of `source`.
    pub fn serialize<R: Read + Seek>(&self, source: &mut R, block_size: u32) -> Result<Vec<u8>> {
        let skip = self.start_block > 0;
        let chunk_count = self.chunks.len() as u32 + u32::from(skip);
        let header = SparseHeader {
            block_size,
            total_blocks: self.start_block + self.payload_blocks(),
            total_chunks: chunk_count,
        };

        let mut out = Vec::with_capacity(self.wire_size() as usize);
        out.extend_from_slice(&header.serialize());

        if skip {
            let hdr = ChunkHeader {
                kind: ChunkKind::DontCare,
                blocks: self.start_block,
                total_size: CHUNK_HEADER_LEN as u32,
            };
            out.extend_from_slice(&hdr.serialize());
        }

        for chunk in &self.chunks {
            let body_len = match &chunk.body {
                PlannedBody::None => 0u64,
                PlannedBody::Fill(_) => 4,
                PlannedBody::Source { len, .. } => *len,
            };
            let hdr = ChunkHeader {
                kind: chunk.kind,
                blocks: chunk.blocks,
                total_size: (CHUNK_HEADER_LEN as u64 + body_len) as u32,
            };
            out.extend_from_slice(&hdr.serialize());

            match &chunk.body {
                PlannedBody::None => {}
                PlannedBody::Fill(pattern) => out.extend_from_slice(pattern),
                PlannedBody::Source { offset, len } => {
                    source.seek(SeekFrom::Start(*offset))?;
                    let start = out.len();
                    out.resize(start + *len as usize, 0);
                    source.read_exact(&mut out[start..])?;
                }
            }
        }

        Ok(out)
    }
}

/// Splits a source image into sparse sub-images whose serialized size
/// never exceeds `limit`. `source` may be sparse or raw; raw sources are
/// wrapped in RAW chunks first.
pub fn plan_split<R: Read + Seek>(source: &mut R, limit: usize, block_size: u32) -> Result<Vec<SubImage>> {
    let file_len = source.seek(SeekFrom::End(0))?;
    source.seek(SeekFrom::Start(0))?;

    let mut probe = [0u8; FILE_HEADER_LEN];
    let probed = {
        let mut filled = 0;
        while filled < probe.len() {
            let n = source.read(&mut probe[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        filled
    };

    let chunks = if probed == FILE_HEADER_LEN && is_sparse(&probe) {
        scan_sparse_chunks(source, &SparseHeader::parse(&probe)?)?
    } else {
        scan_raw_as_chunks(file_len, block_size)?
    };

    pack_chunks(chunks, limit, block_size)
}

/// Walks the chunk directory of a sparse file without reading bodies.
fn scan_sparse_chunks<R: Read + Seek>(
    source: &mut R,
    header: &SparseHeader,
) -> Result<Vec<PlannedChunk>> {
    let mut chunks = Vec::with_capacity(header.total_chunks as usize);
    let mut pos = FILE_HEADER_LEN as u64;

    for _ in 0..header.total_chunks {
        source.seek(SeekFrom::Start(pos))?;
        let mut hdr = [0u8; CHUNK_HEADER_LEN];
        source.read_exact(&mut hdr)?;
        let chunk = ChunkHeader::parse(&hdr)?;
        let body_offset = pos + CHUNK_HEADER_LEN as u64;

        match chunk.kind {
            ChunkKind::Raw => chunks.push(PlannedChunk {
                kind: ChunkKind::Raw,
                blocks: chunk.blocks,
                body: PlannedBody::Source { offset: body_offset, len: chunk.body_len() },
            }),
            ChunkKind::Fill => {
                let mut pattern = [0u8; 4];
                source.read_exact(&mut pattern)?;
                chunks.push(PlannedChunk {
                    kind: ChunkKind::Fill,
                    blocks: chunk.blocks,
                    body: PlannedBody::Fill(pattern),
                });
            }
            ChunkKind::DontCare => chunks.push(PlannedChunk {
                kind: ChunkKind::DontCare,
                blocks: chunk.blocks,
                body: PlannedBody::None,
            }),
            ChunkKind::Crc32 => {}
        }

        pos += chunk.total_size as u64;
    }

    Ok(chunks)
}

fn scan_raw_as_chunks(file_len: u64, block_size: u32) -> Result<Vec<PlannedChunk>> {
    if file_len % block_size as u64 != 0 {
        return Err(Error::user_input(format!(
            "raw image length {file_len} is not a multiple of the {block_size}-byte block size"
        )));
    }

    let blocks = (file_len / block_size as u64) as u32;
    if blocks == 0 {
        return Ok(Vec::new());
    }

    Ok(vec![PlannedChunk {
        kind: ChunkKind::Raw,
        blocks,
        body: PlannedBody::Source { offset: 0, len: file_len },
    }])
}

/// Greedily packs chunks into sub-images under the wire-size limit,
/// splitting oversized RAW chunks on block boundaries.
fn pack_chunks(chunks: Vec<PlannedChunk>, limit: usize, block_size: u32) -> Result<Vec<SubImage>> {
    // Room for header + skip chunk + one chunk header must exist.
    let overhead = FILE_HEADER_LEN + 2 * CHUNK_HEADER_LEN;
    if limit <= overhead + block_size as usize {
        return Err(Error::user_input(format!(
            "download limit {limit} cannot fit a single {block_size}-byte block"
        )));
    }

    let max_raw_blocks_per_image = ((limit - overhead) / block_size as usize) as u32;

    let mut images: Vec<SubImage> = Vec::new();
    let mut current = SubImage { start_block: 0, chunks: Vec::new() };
    let mut block_cursor: u32 = 0;

    let mut flush =
        |current: &mut SubImage, images: &mut Vec<SubImage>, next_start: u32| {
            if !current.chunks.is_empty() {
                images.push(std::mem::replace(
                    current,
                    SubImage { start_block: next_start, chunks: Vec::new() },
                ));
            } else {
                current.start_block = next_start;
            }
        };

    for chunk in chunks {
        let mut remaining = chunk;
        loop {
            let body_len = match &remaining.body {
                PlannedBody::None => 0u64,
                PlannedBody::Fill(_) => 4,
                PlannedBody::Source { len, .. } => *len,
            };
            let projected =
                current.wire_size() + CHUNK_HEADER_LEN as u64 + body_len;

            if projected <= limit as u64 {
                block_cursor += remaining.blocks;
                current.chunks.push(remaining);
                break;
            }

            // RAW chunks can split on a block boundary; everything else is
            // tiny and just moves whole to the next sub-image.
            if remaining.kind == ChunkKind::Raw && remaining.blocks > 1 {
                let fit_blocks = {
                    let free = (limit as u64).saturating_sub(
                        current.wire_size() + CHUNK_HEADER_LEN as u64,
                    );
                    ((free / block_size as u64) as u32)
                        .min(remaining.blocks - 1)
                        .min(max_raw_blocks_per_image)
                };

                if fit_blocks > 0 {
                    let (offset, _) = match remaining.body {
                        PlannedBody::Source { offset, len } => (offset, len),
                        _ => unreachable!("raw chunks always reference the source"),
                    };
                    let head_len = fit_blocks as u64 * block_size as u64;

                    current.chunks.push(PlannedChunk {
                        kind: ChunkKind::Raw,
                        blocks: fit_blocks,
                        body: PlannedBody::Source { offset, len: head_len },
                    });
                    block_cursor += fit_blocks;

                    remaining = PlannedChunk {
                        kind: ChunkKind::Raw,
                        blocks: remaining.blocks - fit_blocks,
                        body: PlannedBody::Source {
                            offset: offset + head_len,
                            len: (remaining.blocks - fit_blocks) as u64 * block_size as u64,
                        },
                    };
                }
            }

            flush(&mut current, &mut images, block_cursor);
        }
    }

    flush(&mut current, &mut images, block_cursor);
    Ok(images)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    const BLOCK: u32 = 4096;

    fn build_sparse(chunks: &[(u16, u32, Vec<u8>)], block_size: u32) -> Vec<u8> {
        let total_blocks: u32 = chunks
            .iter()
            .filter(|(kind, ..)| *kind != CHUNK_CRC32)
            .map(|(_, blocks, _)| *blocks)
            .sum();

        let mut out = SparseHeader {
            block_size,
            total_blocks,
            total_chunks: chunks.len() as u32,
        }
        .serialize()
        .to_vec();

        for (kind, blocks, body) in chunks {
            let mut hdr = [0u8; CHUNK_HEADER_LEN];
            hdr[0..2].copy_from_slice(&kind.to_le_bytes());
            hdr[4..8].copy_from_slice(&blocks.to_le_bytes());
            hdr[8..12]
                .copy_from_slice(&((CHUNK_HEADER_LEN + body.len()) as u32).to_le_bytes());
            out.extend_from_slice(&hdr);
            out.extend_from_slice(body);
        }

        out
    }

    #[test]
    fn expansion_matches_chunk_bodies() {
        let raw_block = vec![0xAA; BLOCK as usize];
        let image = build_sparse(
            &[
                (CHUNK_RAW, 1, raw_block.clone()),
                (CHUNK_FILL, 2, vec![0xDE, 0xAD, 0xBE, 0xEF]),
                (CHUNK_DONT_CARE, 1, vec![]),
                (CHUNK_CRC32, 0, vec![0; 4]),
            ],
            BLOCK,
        );

        let expanded = expand(&image).unwrap();
        assert_eq!(expanded.len(), 4 * BLOCK as usize);
        assert_eq!(&expanded[..BLOCK as usize], &raw_block[..]);
        assert_eq!(&expanded[BLOCK as usize..BLOCK as usize + 4], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert!(expanded[3 * BLOCK as usize..].iter().all(|&b| b == 0));
    }

    #[test]
    fn expansion_length_always_matches_the_header() {
        for blocks in [1u32, 3, 17] {
            let image = build_sparse(
                &[(CHUNK_FILL, blocks, vec![1, 2, 3, 4])],
                BLOCK,
            );
            let expanded = expand(&image).unwrap();
            assert_eq!(expanded.len() as u64, blocks as u64 * BLOCK as u64);
        }
    }

    #[test]
    fn truncated_image_is_rejected() {
        let image = build_sparse(&[(CHUNK_RAW, 2, vec![0xAA; 2 * BLOCK as usize])], BLOCK);
        assert!(expand(&image[..image.len() - 10]).is_err());
    }

    #[test]
    fn undersized_chunk_total_size_is_rejected() {
        let mut hdr = [0u8; CHUNK_HEADER_LEN];
        hdr[0..2].copy_from_slice(&CHUNK_RAW.to_le_bytes());
        hdr[4..8].copy_from_slice(&1u32.to_le_bytes());
        hdr[8..12].copy_from_slice(&4u32.to_le_bytes()); // smaller than the header itself

        assert!(matches!(ChunkHeader::parse(&hdr), Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn streaming_reader_agrees_with_full_expansion() {
        let image = build_sparse(
            &[
                (CHUNK_RAW, 2, vec![0x55; 2 * BLOCK as usize]),
                (CHUNK_DONT_CARE, 1, vec![]),
                (CHUNK_FILL, 1, vec![9, 8, 7, 6]),
            ],
            BLOCK,
        );
        let expected = expand(&image).unwrap();

        let mut reader =
            SparseReader::resume(&image[FILE_HEADER_LEN..], &image[..FILE_HEADER_LEN]).unwrap();
        assert_eq!(reader.expanded_len(), expected.len() as u64);

        let mut streamed = Vec::new();
        let mut buf = [0u8; 1000]; // deliberately unaligned
        loop {
            let n = reader.read_expanded(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            streamed.extend_from_slice(&buf[..n]);
        }

        assert_eq!(streamed, expected);
    }

    #[test]
    fn raw_split_reassembles_to_the_original() {
        let raw: Vec<u8> = (0..8 * BLOCK as usize).map(|i| (i % 251) as u8).collect();
        let limit = FILE_HEADER_LEN + 2 * CHUNK_HEADER_LEN + 3 * BLOCK as usize;

        let mut cursor = Cursor::new(raw.clone());
        let plan = plan_split(&mut cursor, limit, BLOCK).unwrap();
        assert!(plan.len() > 1);

        let mut reassembled = vec![0u8; raw.len()];
        for sub in &plan {
            let wire = sub.serialize(&mut cursor, BLOCK).unwrap();
            assert!(wire.len() <= limit, "{} > {}", wire.len(), limit);

            let expanded = expand(&wire).unwrap();
            let start = sub.start_block as usize * BLOCK as usize;
            // Sub-image expansion covers [0, end); the skip prefix is zeros.
            reassembled[start..expanded.len()].copy_from_slice(&expanded[start..]);
        }

        assert_eq!(reassembled, raw);
    }

    #[test]
    fn sparse_split_preserves_fill_and_skip_chunks() {
        let image = build_sparse(
            &[
                (CHUNK_RAW, 2, vec![0x11; 2 * BLOCK as usize]),
                (CHUNK_DONT_CARE, 4, vec![]),
                (CHUNK_FILL, 2, vec![0xCA, 0xFE, 0xBA, 0xBE]),
            ],
            BLOCK,
        );
        let expected = expand(&image).unwrap();
        let limit = FILE_HEADER_LEN + 3 * CHUNK_HEADER_LEN + 2 * BLOCK as usize + 4;

        let mut cursor = Cursor::new(image);
        let plan = plan_split(&mut cursor, limit, BLOCK).unwrap();

        let mut reassembled = vec![0u8; expected.len()];
        for sub in &plan {
            let wire = sub.serialize(&mut cursor, BLOCK).unwrap();
            assert!(wire.len() <= limit);
            let expanded = expand(&wire).unwrap();
            let start = sub.start_block as usize * BLOCK as usize;
            reassembled[start..expanded.len()].copy_from_slice(&expanded[start..]);
        }

        assert_eq!(reassembled, expected);
    }

    #[test]
    fn unsplittable_limit_is_a_user_error() {
        let raw = vec![0u8; BLOCK as usize];
        let mut cursor = Cursor::new(raw);
        let err = plan_split(&mut cursor, 64, BLOCK).unwrap_err();
        assert!(matches!(err, Error::UserInput(_)));
    }
}
