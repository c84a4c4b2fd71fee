//! Compression codecs and the chunk framing shared by all streams.
//!
//! Every compressed stream is a sequence of chunks, each preceded by a
//! 3-byte little-endian header holding `(payload_len << 1) | is_original`.
//! `is_original = 1` means the payload is stored uncompressed because the
//! codec did not shrink it.

use std::io::{Read, Write};
use std::sync::Mutex;

use dwrf_error::{dwrf_bail, DwrfResult};

use crate::COMPRESSION_HEADER_SIZE;

/// The maximum chunk payload length representable in the 23 bits left by
/// the header's original-flag bit.
pub const MAX_CHUNK_LENGTH: usize = (1 << 23) - 1;

/// The compression applied to all streams and metadata of a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionKind {
    None,
    #[default]
    Zlib,
    Snappy,
    Lz4,
    Zstd,
}

impl CompressionKind {
    pub(crate) fn to_proto(self) -> dwrf_proto::post_script::CompressionKind {
        use dwrf_proto::post_script::CompressionKind as Proto;
        match self {
            Self::None => Proto::None,
            Self::Zlib => Proto::Zlib,
            Self::Snappy => Proto::Snappy,
            Self::Lz4 => Proto::Lz4,
            Self::Zstd => Proto::Zstd,
        }
    }

    pub(crate) fn from_proto(proto: dwrf_proto::post_script::CompressionKind) -> Self {
        use dwrf_proto::post_script::CompressionKind as Proto;
        match proto {
            Proto::None => Self::None,
            Proto::Zlib => Self::Zlib,
            Proto::Snappy => Self::Snappy,
            Proto::Lz4 => Self::Lz4,
            Proto::Zstd => Self::Zstd,
        }
    }
}

/// Compress `input` with `kind` into `output` (cleared first). Returns
/// false when the codec failed to shrink the input, in which case the
/// caller must store the original bytes with the original flag set.
pub(crate) fn compress_chunk(
    kind: CompressionKind,
    level: Option<i32>,
    input: &[u8],
    output: &mut Vec<u8>,
) -> DwrfResult<bool> {
    output.clear();
    match kind {
        CompressionKind::None => return Ok(false),
        CompressionKind::Zlib => {
            let level = level
                .map(|l| flate2::Compression::new(l.clamp(0, 9) as u32))
                .unwrap_or_default();
            let mut encoder = flate2::write::ZlibEncoder::new(std::mem::take(output), level);
            encoder.write_all(input)?;
            *output = encoder.finish()?;
        }
        CompressionKind::Snappy => {
            *output = snap::raw::Encoder::new()
                .compress_vec(input)
                .map_err(|e| dwrf_error::dwrf_err!("snappy compression failed: {}", e))?;
        }
        CompressionKind::Lz4 => {
            *output = lz4::block::compress(input, None, true)?;
        }
        CompressionKind::Zstd => {
            *output = zstd::bulk::compress(input, level.unwrap_or(0))?;
        }
    }
    Ok(output.len() < input.len())
}

/// Decompress one chunk payload previously produced by [`compress_chunk`].
pub(crate) fn decompress_chunk(kind: CompressionKind, input: &[u8]) -> DwrfResult<Vec<u8>> {
    match kind {
        CompressionKind::None => {
            dwrf_bail!(CorruptFile: "compressed chunk in an uncompressed file")
        }
        CompressionKind::Zlib => {
            let mut output = Vec::new();
            flate2::read::ZlibDecoder::new(input).read_to_end(&mut output)?;
            Ok(output)
        }
        CompressionKind::Snappy => snap::raw::Decoder::new()
            .decompress_vec(input)
            .map_err(|e| dwrf_error::dwrf_err!(CorruptFile: "snappy chunk: {}", e)),
        CompressionKind::Lz4 => Ok(lz4::block::decompress(input, None)?),
        CompressionKind::Zstd => Ok(zstd::stream::decode_all(input)?),
    }
}

/// Append the 3-byte chunk header for a payload of `len` bytes.
pub(crate) fn write_chunk_header(output: &mut Vec<u8>, len: usize, is_original: bool) {
    debug_assert!(len <= MAX_CHUNK_LENGTH);
    let header = ((len as u32) << 1) | u32::from(is_original);
    output.extend_from_slice(&header.to_le_bytes()[..COMPRESSION_HEADER_SIZE]);
}

/// Parse a 3-byte chunk header, returning `(payload_len, is_original)`.
pub(crate) fn read_chunk_header(header: &[u8]) -> DwrfResult<(usize, bool)> {
    if header.len() < COMPRESSION_HEADER_SIZE {
        dwrf_bail!(CorruptFile: "truncated compression chunk header");
    }
    let raw = u32::from_le_bytes([header[0], header[1], header[2], 0]);
    Ok(((raw >> 1) as usize, raw & 1 == 1))
}

/// A pool of scratch buffers for chunk compression.
///
/// Compressing a chunk needs a scratch buffer of roughly the chunk size;
/// the pool retains the most recently returned buffer so that steady-state
/// writing does not allocate per chunk. The pool is owned by one writer and
/// never shared across writers.
#[derive(Debug, Default)]
pub struct CompressionBufferPool {
    last_used: Mutex<Option<Vec<u8>>>,
}

impl CompressionBufferPool {
    /// Take a buffer out of the pool, or allocate one with the requested
    /// capacity.
    pub fn checkout(&self, capacity: usize) -> Vec<u8> {
        let mut last = self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        match last.take() {
            Some(mut buffer) => {
                buffer.clear();
                buffer
            }
            None => Vec::with_capacity(capacity),
        }
    }

    /// Return a buffer to the pool, replacing any buffer already held.
    pub fn checkin(&self, buffer: Vec<u8>) {
        let mut last = self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(buffer);
    }

    pub fn retained_bytes(&self) -> u64 {
        let last = self.last_used.lock().unwrap_or_else(|e| e.into_inner());
        last.as_ref().map(|b| b.capacity() as u64).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn chunk_header_round_trips() {
        let mut buf = Vec::new();
        write_chunk_header(&mut buf, 300, false);
        assert_eq!(buf.len(), COMPRESSION_HEADER_SIZE);
        assert_eq!(read_chunk_header(&buf).unwrap(), (300, false));

        buf.clear();
        write_chunk_header(&mut buf, MAX_CHUNK_LENGTH, true);
        assert_eq!(read_chunk_header(&buf).unwrap(), (MAX_CHUNK_LENGTH, true));
    }

    #[rstest]
    #[case(CompressionKind::Zlib)]
    #[case(CompressionKind::Snappy)]
    #[case(CompressionKind::Lz4)]
    #[case(CompressionKind::Zstd)]
    fn codecs_round_trip(#[case] kind: CompressionKind) {
        let input: Vec<u8> = (0..4096u32).map(|i| (i % 16) as u8).collect();
        let mut compressed = Vec::new();
        let shrank = compress_chunk(kind, None, &input, &mut compressed).unwrap();
        assert!(shrank, "repetitive input should compress under {kind:?}");
        assert_eq!(decompress_chunk(kind, &compressed).unwrap(), input);
    }

    #[test]
    fn incompressible_input_reports_original() {
        // 64 bytes of high-entropy data will not shrink under snappy.
        let input: Vec<u8> = (0..64u32)
            .map(|i| (i.wrapping_mul(2654435761) >> 13) as u8)
            .collect();
        let mut compressed = Vec::new();
        let shrank =
            compress_chunk(CompressionKind::Snappy, None, &input, &mut compressed).unwrap();
        assert!(!shrank);
    }

    #[test]
    fn pool_reuses_buffers() {
        let pool = CompressionBufferPool::default();
        let mut buffer = pool.checkout(1024);
        buffer.extend_from_slice(&[1, 2, 3]);
        let capacity = buffer.capacity();
        pool.checkin(buffer);
        assert_eq!(pool.retained_bytes(), capacity as u64);

        let reused = pool.checkout(0);
        assert!(reused.is_empty());
        assert_eq!(reused.capacity(), capacity);
    }
}
