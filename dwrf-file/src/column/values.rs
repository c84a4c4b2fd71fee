//! The primitive value streams column writers encode into. These are the
//! pluggable leaves of the writer: varint integers, raw bytes, and a
//! present bitmap, each framed through a [`DwrfOutputBuffer`].

use bytes::Bytes;
use dwrf_error::DwrfResult;

use crate::encryption::DataEncryptor;
use crate::options::ColumnWriterOptions;
use crate::output::DwrfOutputBuffer;

/// A stream of varint-encoded integers.
pub(crate) struct LongStream {
    buffer: DwrfOutputBuffer,
}

impl LongStream {
    pub fn new(options: &ColumnWriterOptions, encryptor: Option<DataEncryptor>) -> Self {
        Self {
            buffer: DwrfOutputBuffer::new(options, encryptor),
        }
    }

    pub fn write_signed(&mut self, value: i64) -> DwrfResult<()> {
        self.buffer.write_zigzag_varint(value)
    }

    pub fn write_unsigned(&mut self, value: u64) -> DwrfResult<()> {
        self.buffer.write_varint(value)
    }

    /// Positions for a row index entry: compressed offset, pending
    /// uncompressed offset.
    pub fn positions(&self) -> Vec<u64> {
        let checkpoint = self.buffer.checkpoint();
        vec![checkpoint.compressed_offset, checkpoint.uncompressed_offset]
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffer.buffered_bytes()
    }

    pub fn retained_bytes(&self) -> u64 {
        self.buffer.retained_bytes()
    }

    pub fn finish(&mut self) -> DwrfResult<Vec<Bytes>> {
        self.buffer.finish()
    }
}

/// A stream of raw value bytes.
pub(crate) struct ByteStream {
    buffer: DwrfOutputBuffer,
}

impl ByteStream {
    pub fn new(options: &ColumnWriterOptions, encryptor: Option<DataEncryptor>) -> Self {
        Self {
            buffer: DwrfOutputBuffer::new(options, encryptor),
        }
    }

    pub fn write(&mut self, data: &[u8]) -> DwrfResult<()> {
        self.buffer.write_all(data)
    }

    pub fn positions(&self) -> Vec<u64> {
        let checkpoint = self.buffer.checkpoint();
        vec![checkpoint.compressed_offset, checkpoint.uncompressed_offset]
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffer.buffered_bytes()
    }

    pub fn retained_bytes(&self) -> u64 {
        self.buffer.retained_bytes()
    }

    pub fn finish(&mut self) -> DwrfResult<Vec<Bytes>> {
        self.buffer.finish()
    }
}

/// The present bitmap: one bit per row, MSB first, set for non-null rows.
/// The stream is omitted from the stripe when every row was non-null.
pub(crate) struct PresentStream {
    buffer: DwrfOutputBuffer,
    current_byte: u8,
    bits_in_current: u8,
    null_seen: bool,
}

impl PresentStream {
    pub fn new(options: &ColumnWriterOptions, encryptor: Option<DataEncryptor>) -> Self {
        Self {
            buffer: DwrfOutputBuffer::new(options, encryptor),
            current_byte: 0,
            bits_in_current: 0,
            null_seen: false,
        }
    }

    pub fn write(&mut self, present: bool) -> DwrfResult<()> {
        if present {
            self.current_byte |= 1 << (7 - self.bits_in_current);
        } else {
            self.null_seen = true;
        }
        self.bits_in_current += 1;
        if self.bits_in_current == 8 {
            self.buffer.write_u8(self.current_byte)?;
            self.current_byte = 0;
            self.bits_in_current = 0;
        }
        Ok(())
    }

    /// Positions for a row index entry: compressed offset, pending
    /// uncompressed offset, bit offset within the pending byte.
    pub fn positions(&self) -> Vec<u64> {
        let checkpoint = self.buffer.checkpoint();
        vec![
            checkpoint.compressed_offset,
            checkpoint.uncompressed_offset,
            self.bits_in_current as u64,
        ]
    }

    pub fn buffered_bytes(&self) -> u64 {
        self.buffer.buffered_bytes() + u64::from(self.bits_in_current > 0)
    }

    pub fn retained_bytes(&self) -> u64 {
        self.buffer.retained_bytes()
    }

    /// Seal the bitmap, padding the final byte with zero bits. Returns
    /// `None` when no null was recorded, in which case the stream is
    /// omitted.
    pub fn finish(&mut self) -> DwrfResult<Option<Vec<Bytes>>> {
        if self.bits_in_current > 0 {
            self.buffer.write_u8(self.current_byte)?;
            self.current_byte = 0;
            self.bits_in_current = 0;
        }
        let chunks = self.buffer.finish()?;
        let null_seen = std::mem::replace(&mut self.null_seen, false);
        Ok(null_seen.then_some(chunks))
    }
}
