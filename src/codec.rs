//! Lossless compression of full token sequences.
//!
//! Blob layout:
//! - [`BlobHeader`] (48 bytes): magic, format version, token count,
//!   dimension, and the blake3 digest of the uncompressed f32 bytes
//! - zlib stream of the byte-shuffled f32 values
//!
//! Byte shuffling groups the first byte of every float, then the second,
//! and so on. Sign and exponent bytes of neighbouring embedding values are
//! highly repetitive, which deflate exploits far better once they are
//! contiguous. Decoding verifies the digest, so a damaged blob is reported
//! instead of being returned as garbage.

use std::io::{Read, Write};

use bytemuck::{Pod, Zeroable};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};

use crate::{embedding::MultiVector, error::Result};

const MAGIC: [u8; 4] = *b"PBMV";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = std::mem::size_of::<BlobHeader>();
const F32_SIZE: usize = std::mem::size_of::<f32>();

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct BlobHeader {
    magic: [u8; 4],
    version: u32,
    num_tokens: u32,
    dimension: u32,
    digest: [u8; 32],
}

/// Why a blob failed to decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("blob is {0} bytes, shorter than its header")]
    Truncated(usize),
    #[error("bad magic bytes")]
    BadMagic,
    #[error("unsupported blob format version {0}")]
    UnsupportedVersion(u32),
    #[error("decompression failed: {0}")]
    Inflate(String),
    #[error("decompressed {actual} bytes, header promises {expected}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("invalid shape: {0}")]
    Shape(String),
}

/// Compress a sequence into a self-describing blob.
pub fn compress(sequence: &MultiVector) -> Result<Vec<u8>> {
    let raw: &[u8] = bytemuck::cast_slice(sequence.as_slice());
    let header = BlobHeader {
        magic: MAGIC,
        version: FORMAT_VERSION,
        num_tokens: sequence.num_tokens() as u32,
        dimension: sequence.dimension() as u32,
        digest: *blake3::hash(raw).as_bytes(),
    };

    let mut out = Vec::with_capacity(HEADER_SIZE + raw.len() / 2);
    out.extend_from_slice(bytemuck::bytes_of(&header));

    let mut encoder = ZlibEncoder::new(out, Compression::default());
    encoder.write_all(&shuffle(raw))?;
    Ok(encoder.finish()?)
}

/// Decompress a blob produced by [`compress`], verifying its integrity.
pub fn decompress(blob: &[u8]) -> std::result::Result<MultiVector, DecodeError> {
    if blob.len() < HEADER_SIZE {
        return Err(DecodeError::Truncated(blob.len()));
    }
    let header: BlobHeader = bytemuck::pod_read_unaligned(&blob[..HEADER_SIZE]);
    if header.magic != MAGIC {
        return Err(DecodeError::BadMagic);
    }
    if header.version != FORMAT_VERSION {
        return Err(DecodeError::UnsupportedVersion(header.version));
    }

    let num_tokens = header.num_tokens as usize;
    let dimension = header.dimension as usize;
    let expected = num_tokens
        .checked_mul(dimension)
        .and_then(|n| n.checked_mul(F32_SIZE))
        .ok_or_else(|| DecodeError::Shape("token count overflows".into()))?;

    // The header is not covered by the digest, so `expected` is only an
    // upper bound on what is read, never an allocation size. One byte past
    // it detects trailing data.
    let mut shuffled = Vec::new();
    ZlibDecoder::new(&blob[HEADER_SIZE..])
        .take(expected as u64 + 1)
        .read_to_end(&mut shuffled)
        .map_err(|e| DecodeError::Inflate(e.to_string()))?;
    if shuffled.len() != expected {
        return Err(DecodeError::LengthMismatch {
            expected,
            actual: shuffled.len(),
        });
    }

    let raw = unshuffle(&shuffled);
    if blake3::hash(&raw).as_bytes() != &header.digest {
        return Err(DecodeError::ChecksumMismatch);
    }

    let data: Vec<f32> = raw
        .chunks_exact(F32_SIZE)
        .map(bytemuck::pod_read_unaligned::<f32>)
        .collect();
    MultiVector::new(num_tokens, dimension, data)
        .map_err(|e| DecodeError::Shape(e.to_string()))
}

/// Uncompressed size of the sequence a blob holds, read from its header
/// without inflating it.
pub fn raw_len(blob: &[u8]) -> Option<usize> {
    if blob.len() < HEADER_SIZE {
        return None;
    }
    let header: BlobHeader = bytemuck::pod_read_unaligned(&blob[..HEADER_SIZE]);
    if header.magic != MAGIC {
        return None;
    }
    (header.num_tokens as usize)
        .checked_mul(header.dimension as usize)
        .and_then(|n| n.checked_mul(F32_SIZE))
}

/// Token dimension recorded in a blob's header.
pub fn dimension(blob: &[u8]) -> Option<usize> {
    if blob.len() < HEADER_SIZE {
        return None;
    }
    let header: BlobHeader = bytemuck::pod_read_unaligned(&blob[..HEADER_SIZE]);
    (header.magic == MAGIC).then_some(header.dimension as usize)
}

fn shuffle(raw: &[u8]) -> Vec<u8> {
    let n = raw.len() / F32_SIZE;
    let mut out = vec![0u8; raw.len()];
    for (i, value) in raw.chunks_exact(F32_SIZE).enumerate() {
        for (b, byte) in value.iter().enumerate() {
            out[b * n + i] = *byte;
        }
    }
    out
}

fn unshuffle(shuffled: &[u8]) -> Vec<u8> {
    let n = shuffled.len() / F32_SIZE;
    let mut out = vec![0u8; shuffled.len()];
    for (b, plane) in shuffled.chunks_exact(n.max(1)).enumerate().take(F32_SIZE) {
        for (i, byte) in plane.iter().enumerate() {
            out[i * F32_SIZE + b] = *byte;
        }
    }
    out
}
