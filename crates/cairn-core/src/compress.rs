use crate::config::CompressionAlgorithm;
use crate::error::{CairnError, Result};

/// Compressed payloads are framed as `codec_tag || plain_len || body`,
/// with the plaintext length as a little-endian u32. Declaring the length
/// up front lets every codec decompress into an exact-sized buffer and
/// lets the decoder refuse absurd lengths before allocating anything.
/// For encrypted repositories the frame sits inside the sealed envelope,
/// so the declared length is covered by the authentication tag.
const CODEC_RAW: u8 = b'r';
const CODEC_LZ4: u8 = b'l';
const CODEC_ZSTD: u8 = b'z';

const FRAME_HEADER_LEN: usize = 5;

/// Ceiling on the declared plaintext length. The largest honest payload
/// is one unchunked file just below the min-chunkable threshold; this
/// leaves room for generous chunker settings while keeping a forged
/// length from pinning unbounded memory.
const MAX_PLAIN_LEN: u32 = 1 << 29;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Lz4,
    Zstd { level: i32 },
}

impl Compression {
    pub fn from_algorithm(algorithm: CompressionAlgorithm, zstd_level: i32) -> Self {
        match algorithm {
            CompressionAlgorithm::None => Compression::None,
            CompressionAlgorithm::Lz4 => Compression::Lz4,
            CompressionAlgorithm::Zstd => Compression::Zstd { level: zstd_level },
        }
    }
}

/// Compress a plaintext payload into a self-describing frame.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    let plain_len = u32::try_from(data.len())
        .ok()
        .filter(|len| *len <= MAX_PLAIN_LEN)
        .ok_or_else(|| {
            CairnError::InvalidFormat(format!("payload of {} bytes exceeds the frame limit", data.len()))
        })?;

    let (tag, body) = match compression {
        Compression::None => (CODEC_RAW, data.to_vec()),
        Compression::Lz4 => (CODEC_LZ4, lz4_flex::compress(data)),
        Compression::Zstd { level } => (CODEC_ZSTD, zstd::bulk::compress(data, level)?),
    };

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.push(tag);
    frame.extend_from_slice(&plain_len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame produced by `compress`. The output must come back at
/// exactly the declared length; any disagreement means corruption.
pub fn decompress(frame: &[u8]) -> Result<Vec<u8>> {
    let (header, body) = frame
        .split_at_checked(FRAME_HEADER_LEN)
        .ok_or_else(|| CairnError::Decompression("truncated frame header".into()))?;
    let plain_len = u32::from_le_bytes(header[1..5].try_into().expect("header split"));
    if plain_len > MAX_PLAIN_LEN {
        return Err(CairnError::Decompression(format!(
            "declared plaintext length {plain_len} exceeds the frame limit"
        )));
    }

    let plain = match header[0] {
        CODEC_RAW => body.to_vec(),
        CODEC_LZ4 => lz4_flex::decompress(body, plain_len as usize)
            .map_err(|e| CairnError::Decompression(format!("lz4: {e}")))?,
        CODEC_ZSTD => zstd::bulk::decompress(body, plain_len as usize)
            .map_err(|e| CairnError::Decompression(format!("zstd: {e}")))?,
        other => return Err(CairnError::UnknownCompressionTag(other)),
    };

    if plain.len() != plain_len as usize {
        return Err(CairnError::Decompression(format!(
            "frame declared {plain_len} plaintext bytes but decoded {}",
            plain.len()
        )));
    }
    Ok(plain)
}
