//! The compressed, optionally encrypted output buffer all streams and
//! metadata are framed through.

use bytes::Bytes;
use dwrf_error::DwrfResult;

use crate::compression::{compress_chunk, write_chunk_header, CompressionKind, MAX_CHUNK_LENGTH};
use crate::encryption::DataEncryptor;
use crate::options::ColumnWriterOptions;

/// A position in the output, taken at a row-group boundary so the row
/// index can point into the stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OutputCheckpoint {
    /// Bytes of finished chunks (headers included) before this point.
    pub compressed_offset: u64,
    /// Bytes pending in the unfinished chunk.
    pub uncompressed_offset: u64,
}

/// Buffers raw bytes and emits them as compression chunks with 3-byte
/// headers. When an encryptor is present each chunk payload is encrypted
/// after compression. When compression is `None` and no encryptor is
/// configured the bytes pass through unframed.
pub struct DwrfOutputBuffer {
    compression: CompressionKind,
    compression_level: Option<i32>,
    max_chunk_size: usize,
    min_chunk_size: usize,
    encryptor: Option<DataEncryptor>,
    options: ColumnWriterOptions,
    finished: Vec<Bytes>,
    finished_size: u64,
    current: Vec<u8>,
}

impl DwrfOutputBuffer {
    pub fn new(options: &ColumnWriterOptions, encryptor: Option<DataEncryptor>) -> Self {
        let max_chunk_size = options
            .max_compression_buffer_size
            .clamp(1, MAX_CHUNK_LENGTH);
        let min_chunk_size = options.min_output_buffer_chunk_size.min(max_chunk_size);
        let current = if options.lazy_output_buffer {
            Vec::new()
        } else {
            Vec::with_capacity(min_chunk_size)
        };
        Self {
            compression: options.compression_kind,
            compression_level: options.compression_level,
            max_chunk_size,
            min_chunk_size,
            encryptor,
            options: options.clone(),
            finished: Vec::new(),
            finished_size: 0,
            current,
        }
    }

    fn is_framed(&self) -> bool {
        self.compression != CompressionKind::None || self.encryptor.is_some()
    }

    pub fn write_u8(&mut self, byte: u8) -> DwrfResult<()> {
        self.current.push(byte);
        self.maybe_flush_chunk()
    }

    pub fn write_all(&mut self, mut data: &[u8]) -> DwrfResult<()> {
        while !data.is_empty() {
            let room = self.max_chunk_size - self.current.len();
            let take = room.min(data.len());
            self.current.extend_from_slice(&data[..take]);
            data = &data[take..];
            self.maybe_flush_chunk()?;
        }
        Ok(())
    }

    /// Write an unsigned LEB128 varint.
    pub fn write_varint(&mut self, mut value: u64) -> DwrfResult<()> {
        loop {
            if value < 0x80 {
                return self.write_u8(value as u8);
            }
            self.write_u8((value as u8 & 0x7f) | 0x80)?;
            value >>= 7;
        }
    }

    /// Write a zigzag-encoded signed varint.
    pub fn write_zigzag_varint(&mut self, value: i64) -> DwrfResult<()> {
        self.write_varint(zigzag_encode(value))
    }

    fn maybe_flush_chunk(&mut self) -> DwrfResult<()> {
        if self.current.len() >= self.max_chunk_size {
            self.flush_chunk()?;
        }
        Ok(())
    }

    fn flush_chunk(&mut self) -> DwrfResult<()> {
        if self.current.is_empty() {
            return Ok(());
        }
        if !self.is_framed() {
            let chunk = std::mem::replace(&mut self.current, Vec::new());
            self.finished_size += chunk.len() as u64;
            self.finished.push(Bytes::from(chunk));
            return Ok(());
        }

        let mut scratch = self.options.buffer_pool.checkout(self.current.len());
        let compressed = compress_chunk(
            self.compression,
            self.compression_level,
            &self.current,
            &mut scratch,
        )?;
        let (payload, is_original): (&[u8], bool) = if compressed {
            (&scratch, false)
        } else {
            (&self.current, true)
        };

        let mut framed = Vec::with_capacity(payload.len() + crate::COMPRESSION_HEADER_SIZE);
        match &self.encryptor {
            Some(encryptor) => {
                let ciphertext = encryptor.encrypt(payload)?;
                write_chunk_header(&mut framed, ciphertext.len(), is_original);
                framed.extend_from_slice(&ciphertext);
            }
            None => {
                write_chunk_header(&mut framed, payload.len(), is_original);
                framed.extend_from_slice(payload);
            }
        }

        self.options.buffer_pool.checkin(scratch);
        self.current.clear();
        self.finished_size += framed.len() as u64;
        self.finished.push(Bytes::from(framed));
        Ok(())
    }

    /// The position of the next byte written, for row index positions.
    pub fn checkpoint(&self) -> OutputCheckpoint {
        OutputCheckpoint {
            compressed_offset: self.finished_size,
            uncompressed_offset: self.current.len() as u64,
        }
    }

    /// An estimate of the bytes this buffer will emit; exact once
    /// [`Self::finish`] has run.
    pub fn buffered_bytes(&self) -> u64 {
        self.finished_size + self.current.len() as u64
    }

    pub fn retained_bytes(&self) -> u64 {
        self.finished_size + self.current.capacity() as u64
    }

    /// Seal the stream: flush the pending chunk and return the framed
    /// chunks. The buffer stays usable after a [`Self::reset`].
    pub fn finish(&mut self) -> DwrfResult<Vec<Bytes>> {
        self.flush_chunk()?;
        self.finished_size = 0;
        Ok(std::mem::take(&mut self.finished))
    }

    /// Seal the stream into one contiguous allocation. Used for metadata,
    /// which must be addressable as a single slice.
    pub fn finish_to_bytes(&mut self) -> DwrfResult<Bytes> {
        let chunks = self.finish()?;
        match chunks.len() {
            0 => Ok(Bytes::new()),
            1 => Ok(chunks.into_iter().next().unwrap_or_default()),
            _ => {
                let total = chunks.iter().map(Bytes::len).sum();
                let mut out = Vec::with_capacity(total);
                for chunk in chunks {
                    out.extend_from_slice(&chunk);
                }
                Ok(Bytes::from(out))
            }
        }
    }

    pub fn reset(&mut self) {
        self.finished.clear();
        self.finished_size = 0;
        self.current.clear();
        if self.options.reset_output_buffer {
            self.current = if self.options.lazy_output_buffer {
                Vec::new()
            } else {
                Vec::with_capacity(self.min_chunk_size)
            };
        }
    }
}

pub(crate) fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub(crate) fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::compression::{read_chunk_header, CompressionBufferPool};
    use crate::options::{ColumnWriterOptions, WriterOptions};

    fn options(kind: CompressionKind) -> ColumnWriterOptions {
        let writer_options = WriterOptions::default().with_compression(kind);
        ColumnWriterOptions::from_writer_options(
            &writer_options,
            Default::default(),
            Arc::new(CompressionBufferPool::default()),
        )
    }

    #[test]
    fn uncompressed_bytes_pass_through() {
        let mut buffer = DwrfOutputBuffer::new(&options(CompressionKind::None), None);
        buffer.write_all(b"hello").unwrap();
        let chunks = buffer.finish().unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(&chunks[0][..], b"hello");
    }

    #[test]
    fn compressed_chunks_carry_headers() {
        let mut buffer = DwrfOutputBuffer::new(&options(CompressionKind::Zlib), None);
        let input = vec![42u8; 10_000];
        buffer.write_all(&input).unwrap();
        let chunks = buffer.finish().unwrap();
        assert_eq!(chunks.len(), 1);
        let (len, is_original) = read_chunk_header(&chunks[0]).unwrap();
        assert!(!is_original);
        assert_eq!(len + crate::COMPRESSION_HEADER_SIZE, chunks[0].len());
        assert!(chunks[0].len() < input.len());
    }

    #[test]
    fn zigzag_round_trips() {
        for value in [0, -1, 1, i64::MIN, i64::MAX, -123456789] {
            assert_eq!(zigzag_decode(zigzag_encode(value)), value);
        }
    }

    #[test]
    fn checkpoint_tracks_positions() {
        let mut buffer = DwrfOutputBuffer::new(&options(CompressionKind::None), None);
        buffer.write_all(b"abc").unwrap();
        let checkpoint = buffer.checkpoint();
        assert_eq!(checkpoint.uncompressed_offset, 3);
        assert_eq!(checkpoint.compressed_offset, 0);
    }

    #[test]
    fn reset_clears_state() {
        let mut buffer = DwrfOutputBuffer::new(&options(CompressionKind::None), None);
        buffer.write_all(b"abc").unwrap();
        buffer.reset();
        assert_eq!(buffer.buffered_bytes(), 0);
        assert!(buffer.finish().unwrap().is_empty());
    }
}
