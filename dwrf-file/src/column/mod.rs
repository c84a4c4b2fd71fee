//! Per-column writers.
//!
//! A column writer owns the streams of one node subtree, accumulates
//! per-row-group and per-stripe statistics, and hands back framed streams
//! at stripe flush. Writers are created once per file, reset at each
//! stripe boundary, and closed exactly once per stripe before their
//! streams are collected.

mod long;
mod string;
pub(crate) mod values;

use dwrf_error::{dwrf_bail, DwrfResult};
pub use long::*;
use prost::Message;
pub use string::*;

use crate::dictionary::DictionaryColumn;
use crate::encryption::{DataEncryptor, EncryptionInfo};
use crate::metadata::{ColumnEncoding, ColumnStatistics, DwrfType, TypeKind};
use crate::options::ColumnWriterOptions;
use crate::output::DwrfOutputBuffer;
use crate::page::Block;
use crate::stream::{Stream, StreamDataOutput, StreamKind};

/// The contract between the writer orchestrator and one column.
pub trait ColumnWriter {
    /// Mark the start of a row group; the writer records stream positions
    /// for the row index here.
    fn begin_row_group(&mut self);

    /// Append a block of values. Returns the logical (raw) size delta.
    fn write_block(&mut self, block: &Block) -> DwrfResult<u64>;

    /// Seal the current row group and return its statistics, keyed by
    /// node id.
    fn finish_row_group(&mut self) -> DwrfResult<Vec<(u32, ColumnStatistics)>>;

    /// Seal the stripe's value streams. After close, only the stream and
    /// statistics accessors and [`Self::reset`] may be called.
    fn close(&mut self) -> DwrfResult<()>;

    /// Clear per-stripe state and reopen the writer for the next stripe.
    fn reset(&mut self);

    fn buffered_bytes(&self) -> u64;

    fn retained_bytes(&self) -> u64;

    /// The stripe's index streams, row index first.
    fn index_streams(&mut self) -> DwrfResult<Vec<StreamDataOutput>>;

    /// The stripe's data streams, in the column's natural order; the
    /// stream layout may reorder them afterwards.
    fn data_streams(&mut self) -> DwrfResult<Vec<StreamDataOutput>>;

    /// The encoding of every node this writer owns.
    fn column_encodings(&self) -> Vec<(u32, ColumnEncoding)>;

    /// Per-node statistics over the whole stripe.
    fn column_stripe_statistics(&self) -> Vec<(u32, ColumnStatistics)>;

    /// Writers for nested columns, if any.
    fn nested_writers(&mut self) -> Vec<&mut dyn ColumnWriter> {
        Vec::new()
    }

    /// The dictionary capability, for writers the optimizer may convert
    /// to direct encoding.
    fn as_dictionary_column(&mut self) -> Option<&mut dyn DictionaryColumn> {
        None
    }
}

/// Create the writer for a top-level column node.
pub fn create_column_writer(
    node: u32,
    types: &[DwrfType],
    options: &ColumnWriterOptions,
    encryption: &EncryptionInfo,
) -> DwrfResult<Box<dyn ColumnWriter>> {
    let encryptor = match encryption.group_by_node(node) {
        Some(group) => Some(encryption.encryptor(group)?.clone()),
        None => None,
    };
    let dwrf_type = types
        .get(node as usize)
        .ok_or_else(|| dwrf_error::dwrf_err!("node {} outside the type tree", node))?;
    match dwrf_type.kind() {
        TypeKind::Bigint => Ok(Box::new(LongColumnWriter::new(node, options, encryptor))),
        TypeKind::Varchar => Ok(Box::new(StringColumnWriter::new(node, options, encryptor))),
        kind => dwrf_bail!(NotImplemented: "no column writer for {:?}", kind),
    }
}

/// Serialize per-row-group entries into this column's row index stream.
pub(crate) fn build_row_index_stream(
    node: u32,
    entries: Vec<dwrf_proto::RowIndexEntry>,
    options: &ColumnWriterOptions,
    encryptor: Option<DataEncryptor>,
) -> DwrfResult<StreamDataOutput> {
    let row_index = dwrf_proto::RowIndex { entry: entries };
    let mut buffer = DwrfOutputBuffer::new(options, encryptor);
    buffer.write_all(&row_index.encode_to_vec())?;
    let chunks = buffer.finish()?;
    let length = chunks.iter().map(|c| c.len() as u64).sum();
    Ok(StreamDataOutput::new(
        Stream::new(node, StreamKind::RowIndex, length),
        chunks,
    ))
}

pub(crate) fn row_index_entry(
    positions: Vec<u64>,
    statistics: &ColumnStatistics,
) -> dwrf_proto::RowIndexEntry {
    dwrf_proto::RowIndexEntry {
        positions,
        statistics: Some(statistics.to_proto()),
    }
}

/// Wrap finished chunks as a stream of the given kind, or nothing if the
/// stream is empty and omissible.
pub(crate) fn stream_output(
    node: u32,
    kind: StreamKind,
    chunks: Vec<bytes::Bytes>,
) -> StreamDataOutput {
    let length = chunks.iter().map(|c| c.len() as u64).sum();
    StreamDataOutput::new(Stream::new(node, kind, length), chunks)
}
