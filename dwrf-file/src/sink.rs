//! Append-only byte sinks.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use bytes::Bytes;
use dwrf_error::{dwrf_bail, DwrfResult};

/// An ordered list of byte payloads to be appended to a sink as one unit.
///
/// Stripe assembly produces outputs without copying the underlying stream
/// chunks into one contiguous allocation; the sink writes them in order.
#[derive(Clone, Debug, Default)]
pub struct DataOutput {
    chunks: Vec<Bytes>,
}

impl DataOutput {
    pub fn from_bytes(bytes: Bytes) -> Self {
        Self {
            chunks: vec![bytes],
        }
    }

    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Self { chunks }
    }

    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }
}

impl From<Vec<u8>> for DataOutput {
    fn from(data: Vec<u8>) -> Self {
        Self::from_bytes(Bytes::from(data))
    }
}

/// An append-only byte sink. The sink never seeks; the writer relies only
/// on [`DataSink::size`] advancing monotonically with each write.
pub trait DataSink {
    /// Number of bytes appended so far.
    fn size(&self) -> u64;

    /// Append every output, in order. A failure leaves the sink in an
    /// unspecified state and the file under construction unusable.
    fn write(&mut self, outputs: Vec<DataOutput>) -> DwrfResult<()>;

    fn close(&mut self) -> DwrfResult<()>;

    /// Memory retained by the sink's own buffering.
    fn retained_bytes(&self) -> u64;
}

/// A sink that accumulates the file in memory. Used by tests and by the
/// write-validation read-back.
#[derive(Debug, Default)]
pub struct MemoryDataSink {
    data: Vec<u8>,
    closed: bool,
}

impl MemoryDataSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        Bytes::from(self.data)
    }
}

impl DataSink for MemoryDataSink {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn write(&mut self, outputs: Vec<DataOutput>) -> DwrfResult<()> {
        if self.closed {
            dwrf_bail!("write to closed sink");
        }
        for output in outputs {
            for chunk in output.chunks() {
                self.data.extend_from_slice(chunk);
            }
        }
        Ok(())
    }

    fn close(&mut self) -> DwrfResult<()> {
        self.closed = true;
        Ok(())
    }

    fn retained_bytes(&self) -> u64 {
        self.data.capacity() as u64
    }
}

/// A sink writing through a buffered local file.
#[derive(Debug)]
pub struct FileDataSink {
    writer: BufWriter<File>,
    size: u64,
    closed: bool,
}

impl FileDataSink {
    pub fn create(path: impl AsRef<Path>) -> DwrfResult<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            size: 0,
            closed: false,
        })
    }
}

impl DataSink for FileDataSink {
    fn size(&self) -> u64 {
        self.size
    }

    fn write(&mut self, outputs: Vec<DataOutput>) -> DwrfResult<()> {
        if self.closed {
            dwrf_bail!("write to closed sink");
        }
        for output in outputs {
            for chunk in output.chunks() {
                self.writer.write_all(chunk)?;
                self.size += chunk.len() as u64;
            }
        }
        Ok(())
    }

    fn close(&mut self) -> DwrfResult<()> {
        if !self.closed {
            self.closed = true;
            self.writer.flush()?;
        }
        Ok(())
    }

    fn retained_bytes(&self) -> u64 {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_appends_in_order() {
        let mut sink = MemoryDataSink::new();
        sink.write(vec![
            DataOutput::from(vec![1u8, 2]),
            DataOutput::from_chunks(vec![Bytes::from_static(b"ab"), Bytes::from_static(b"c")]),
        ])
        .unwrap();
        assert_eq!(sink.size(), 5);
        assert_eq!(sink.as_slice(), &[1, 2, b'a', b'b', b'c']);
    }

    #[test]
    fn memory_sink_rejects_write_after_close() {
        let mut sink = MemoryDataSink::new();
        sink.close().unwrap();
        assert!(sink.write(vec![DataOutput::from(vec![0u8])]).is_err());
    }
}
