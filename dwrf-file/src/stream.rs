//! Stream descriptors and their buffered byte payloads.

use bytes::Bytes;

use crate::sink::DataOutput;

/// The kind of a stream within a stripe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamKind {
    /// Row index: per-row-group positions and statistics.
    RowIndex,
    /// One bit per row, set when the row is non-null. Omitted for columns
    /// without nulls.
    Present,
    /// The column's primary values: integers, string bytes, or dictionary
    /// codes.
    Data,
    /// Per-value byte lengths for variable-width data.
    Length,
    /// The distinct values of a dictionary-encoded column.
    DictionaryData,
}

impl StreamKind {
    pub fn is_index(self) -> bool {
        matches!(self, Self::RowIndex)
    }

    pub(crate) fn to_proto(self) -> dwrf_proto::stream::StreamKind {
        use dwrf_proto::stream::StreamKind as Proto;
        match self {
            Self::Present => Proto::Present,
            Self::Data => Proto::Data,
            Self::Length => Proto::Length,
            Self::DictionaryData => Proto::DictionaryData,
            Self::RowIndex => Proto::RowIndex,
        }
    }

    pub(crate) fn from_proto(proto: dwrf_proto::stream::StreamKind) -> Self {
        use dwrf_proto::stream::StreamKind as Proto;
        match proto {
            Proto::Present => Self::Present,
            Proto::Data => Self::Data,
            Proto::Length => Self::Length,
            Proto::DictionaryData => Self::DictionaryData,
            Proto::RowIndex => Self::RowIndex,
        }
    }
}

/// A stream descriptor: the owning column node, the stream kind, the byte
/// length, and an offset populated only when the stream begins a new
/// encryption region within the stripe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stream {
    column: u32,
    kind: StreamKind,
    length: u64,
    offset: Option<u64>,
}

impl Stream {
    pub fn new(column: u32, kind: StreamKind, length: u64) -> Self {
        Self {
            column,
            kind,
            length,
            offset: None,
        }
    }

    pub fn column(&self) -> u32 {
        self.column
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn offset(&self) -> Option<u64> {
        self.offset
    }

    /// The same descriptor carrying an explicit region-boundary offset.
    pub fn with_offset(self, offset: u64) -> Self {
        Self {
            offset: Some(offset),
            ..self
        }
    }

    pub(crate) fn to_proto(&self) -> dwrf_proto::Stream {
        dwrf_proto::Stream {
            kind: self.kind.to_proto() as i32,
            column: Some(self.column),
            length: Some(self.length),
            offset: self.offset,
        }
    }

    pub(crate) fn from_proto(proto: &dwrf_proto::Stream) -> dwrf_error::DwrfResult<Self> {
        let kind = dwrf_proto::stream::StreamKind::try_from(proto.kind)
            .map_err(|_| dwrf_error::dwrf_err!(CorruptFile: "unknown stream kind {}", proto.kind))?;
        Ok(Self {
            column: proto.column.unwrap_or(0),
            kind: StreamKind::from_proto(kind),
            length: proto.length.unwrap_or(0),
            offset: proto.offset,
        })
    }
}

/// A stream descriptor together with the framed bytes backing it.
#[derive(Clone, Debug)]
pub struct StreamDataOutput {
    stream: Stream,
    data: Vec<Bytes>,
}

impl StreamDataOutput {
    /// Create from framed chunks; the descriptor's length must equal the
    /// total chunk size.
    pub fn new(stream: Stream, data: Vec<Bytes>) -> Self {
        debug_assert_eq!(
            stream.length(),
            data.iter().map(|c| c.len() as u64).sum::<u64>(),
            "stream length must match its payload"
        );
        Self { stream, data }
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn size(&self) -> u64 {
        self.stream.length()
    }

    pub fn data(&self) -> &[Bytes] {
        &self.data
    }

    pub fn into_data_output(self) -> DataOutput {
        DataOutput::from_chunks(self.data)
    }
}
