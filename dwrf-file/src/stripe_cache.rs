//! The DWRF stripe cache: index and/or stripe-footer bytes duplicated near
//! the end of the file so readers can plan stripe reads without seeking
//! back through the whole file.

use bytes::{Bytes, BytesMut};

use crate::stream::StreamDataOutput;

/// Which regions of each stripe the cache duplicates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StripeCacheMode {
    #[default]
    None,
    Index,
    Footer,
    Both,
}

impl StripeCacheMode {
    fn includes_index(self) -> bool {
        matches!(self, Self::Index | Self::Both)
    }

    fn includes_footer(self) -> bool {
        matches!(self, Self::Footer | Self::Both)
    }

    pub(crate) fn to_proto(self) -> dwrf_proto::post_script::StripeCacheMode {
        use dwrf_proto::post_script::StripeCacheMode as Proto;
        match self {
            Self::None => Proto::Na,
            Self::Index => Proto::Index,
            Self::Footer => Proto::Footer,
            Self::Both => Proto::Both,
        }
    }

    pub(crate) fn from_proto(proto: dwrf_proto::post_script::StripeCacheMode) -> Self {
        use dwrf_proto::post_script::StripeCacheMode as Proto;
        match proto {
            Proto::Na => Self::None,
            Proto::Index => Self::Index,
            Proto::Footer => Self::Footer,
            Proto::Both => Self::Both,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DwrfStripeCacheOptions {
    pub mode: StripeCacheMode,
    pub max_size: u64,
}

/// The sealed cache blob and its descriptor fields.
#[derive(Clone, Debug)]
pub struct DwrfStripeCacheData {
    pub mode: StripeCacheMode,
    pub data: Bytes,
}

/// Accumulates the cached bytes and the offset of each contribution within
/// the blob. Once a contribution would exceed the configured cap the cache
/// stops growing; the offsets already recorded stay valid.
#[derive(Debug)]
pub struct DwrfStripeCacheWriter {
    mode: StripeCacheMode,
    max_size: u64,
    data: BytesMut,
    offsets: Vec<u32>,
    full: bool,
}

impl DwrfStripeCacheWriter {
    pub fn new(mode: StripeCacheMode, max_size: u64) -> Self {
        Self {
            mode,
            max_size,
            data: BytesMut::new(),
            // The leading zero is the terminator when nothing contributes;
            // each contribution appends its end offset.
            offsets: vec![0],
            full: false,
        }
    }

    /// Record a stripe's index streams, in file order.
    pub fn add_index_streams(&mut self, index_streams: &[StreamDataOutput], index_length: u64) {
        if !self.mode.includes_index() {
            return;
        }
        if !self.try_reserve(index_length) {
            return;
        }
        for stream in index_streams {
            for chunk in stream.data() {
                self.data.extend_from_slice(chunk);
            }
        }
        self.offsets.push(self.data.len() as u32);
    }

    /// Record a stripe's serialized footer.
    pub fn add_stripe_footer(&mut self, footer: &Bytes) {
        if !self.mode.includes_footer() {
            return;
        }
        if !self.try_reserve(footer.len() as u64) {
            return;
        }
        self.data.extend_from_slice(footer);
        self.offsets.push(self.data.len() as u32);
    }

    fn try_reserve(&mut self, additional: u64) -> bool {
        if self.full || self.data.len() as u64 + additional > self.max_size {
            self.full = true;
            return false;
        }
        true
    }

    /// The offsets of each contribution within the blob, ending with the
    /// blob length as terminator.
    pub fn offsets(&self) -> Vec<u32> {
        self.offsets.clone()
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn retained_bytes(&self) -> u64 {
        self.data.capacity() as u64
    }

    pub fn into_cache_data(self) -> DwrfStripeCacheData {
        DwrfStripeCacheData {
            mode: self.mode,
            data: self.data.freeze(),
        }
    }

    /// Seal the current contents without consuming the writer.
    pub fn cache_data(&self) -> DwrfStripeCacheData {
        DwrfStripeCacheData {
            mode: self.mode,
            data: Bytes::copy_from_slice(&self.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{Stream, StreamDataOutput, StreamKind};

    fn index_stream(len: usize) -> StreamDataOutput {
        StreamDataOutput::new(
            Stream::new(1, StreamKind::RowIndex, len as u64),
            vec![Bytes::from(vec![7u8; len])],
        )
    }

    #[test]
    fn offsets_track_contributions() {
        let mut writer = DwrfStripeCacheWriter::new(StripeCacheMode::Index, 1024);
        writer.add_index_streams(&[index_stream(10)], 10);
        writer.add_index_streams(&[index_stream(5)], 5);
        assert_eq!(writer.offsets(), vec![0, 10, 15]);
        assert_eq!(writer.cache_data().data.len(), 15);
    }

    #[test]
    fn footer_mode_ignores_index_streams() {
        let mut writer = DwrfStripeCacheWriter::new(StripeCacheMode::Footer, 1024);
        writer.add_index_streams(&[index_stream(10)], 10);
        writer.add_stripe_footer(&Bytes::from_static(b"footer"));
        assert_eq!(writer.offsets(), vec![0, 6]);
    }

    #[test]
    fn cache_stops_growing_at_cap() {
        let mut writer = DwrfStripeCacheWriter::new(StripeCacheMode::Index, 12);
        writer.add_index_streams(&[index_stream(10)], 10);
        // Would exceed the cap: dropped, and the cache stays full from
        // here on even for contributions that would fit.
        writer.add_index_streams(&[index_stream(5)], 5);
        writer.add_index_streams(&[index_stream(1)], 1);
        assert_eq!(writer.offsets(), vec![0, 10]);
        assert_eq!(writer.size(), 10);
    }
}
