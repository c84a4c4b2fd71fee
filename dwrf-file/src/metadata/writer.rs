//! Serialization of the metadata model: protobuf encoding framed through
//! the file's compression.

use bytes::Bytes;
use dwrf_error::{dwrf_bail, DwrfResult};
use prost::Message;

use crate::encryption::DataEncryptor;
use crate::metadata::{
    ColumnStatistics, Footer, Metadata, PostScript, StripeEncryptionGroup, StripeFooter,
};
use crate::options::ColumnWriterOptions;
use crate::output::DwrfOutputBuffer;
use crate::stripe_cache::DwrfStripeCacheData;
use crate::MAX_POSTSCRIPT_SIZE;

/// Serializes footers and metadata sections, compressed with the same
/// configuration as the data streams. The postscript alone is written
/// uncompressed, because a reader must parse it before it knows the
/// compression kind.
pub struct CompressedMetadataWriter {
    options: ColumnWriterOptions,
}

impl CompressedMetadataWriter {
    pub fn new(options: ColumnWriterOptions) -> Self {
        Self { options }
    }

    fn write_framed(&self, message: &[u8], encryptor: Option<&DataEncryptor>) -> DwrfResult<Bytes> {
        let mut buffer = DwrfOutputBuffer::new(&self.options, encryptor.cloned());
        buffer.write_all(message)?;
        buffer.finish_to_bytes()
    }

    pub fn write_stripe_footer(&self, footer: &StripeFooter) -> DwrfResult<Bytes> {
        let proto = dwrf_proto::StripeFooter {
            streams: footer.streams.iter().map(|s| s.to_proto()).collect(),
            columns: footer
                .column_encodings
                .iter()
                .map(|(&node, encoding)| encoding.to_proto(node))
                .collect(),
            encrypted_groups: footer
                .encrypted_groups
                .iter()
                .map(|g| g.to_vec())
                .collect(),
        };
        self.write_framed(&proto.encode_to_vec(), None)
    }

    /// Serialize and encrypt one group's streams and encodings for a
    /// stripe footer.
    pub fn write_stripe_encryption_group(
        &self,
        group: &StripeEncryptionGroup,
        encryptor: &DataEncryptor,
    ) -> DwrfResult<Bytes> {
        let proto = dwrf_proto::StripeEncryptionGroup {
            streams: group.streams.iter().map(|s| s.to_proto()).collect(),
            encoding: group
                .column_encodings
                .iter()
                .map(|(&node, encoding)| encoding.to_proto(node))
                .collect(),
        };
        self.write_framed(&proto.encode_to_vec(), Some(encryptor))
    }

    /// Serialize and encrypt one group's file-level statistics for the
    /// footer's encryption descriptor.
    pub fn write_encrypted_file_statistics(
        &self,
        statistics: &[ColumnStatistics],
        encryptor: &DataEncryptor,
    ) -> DwrfResult<Bytes> {
        let proto = dwrf_proto::FileStatistics {
            statistics: statistics.iter().map(|s| s.to_proto()).collect(),
        };
        self.write_framed(&proto.encode_to_vec(), Some(encryptor))
    }

    pub fn write_metadata(&self, metadata: &Metadata) -> DwrfResult<Bytes> {
        let proto = dwrf_proto::Metadata {
            stripe_stats: metadata
                .stripe_statistics
                .iter()
                .map(|s| dwrf_proto::StripeStatistics {
                    col_stats: s.column_statistics.iter().map(|c| c.to_proto()).collect(),
                })
                .collect(),
        };
        self.write_framed(&proto.encode_to_vec(), None)
    }

    pub fn write_footer(&self, footer: &Footer) -> DwrfResult<Bytes> {
        let proto = dwrf_proto::Footer {
            number_of_rows: Some(footer.number_of_rows),
            row_index_stride: Some(footer.row_group_max_row_count),
            raw_data_size: Some(footer.raw_size),
            stripes: footer.stripes.iter().map(|s| s.to_proto()).collect(),
            types: footer.types.iter().map(|t| t.to_proto()).collect(),
            statistics: footer.statistics.iter().map(|s| s.to_proto()).collect(),
            metadata: footer
                .user_metadata
                .iter()
                .map(|(name, value)| dwrf_proto::UserMetadataItem {
                    name: Some(name.clone()),
                    value: Some(value.to_vec()),
                })
                .collect(),
            encryption: footer.encryption.as_ref().map(|e| dwrf_proto::Encryption {
                key_provider: e.key_provider.to_proto() as i32,
                encryption_groups: e
                    .groups
                    .iter()
                    .map(|g| dwrf_proto::EncryptionGroup {
                        nodes: g.nodes.clone(),
                        key_metadata: g.key_metadata.as_ref().map(|k| k.to_vec()),
                        statistics: g.statistics.iter().map(|s| s.to_vec()).collect(),
                    })
                    .collect(),
            }),
            stripe_cache_offsets: footer.stripe_cache_offsets.clone().unwrap_or_default(),
        };
        self.write_framed(&proto.encode_to_vec(), None)
    }

    /// The stripe cache blob is emitted verbatim: its contents are already
    /// framed stream and footer bytes.
    pub fn write_stripe_cache(&self, cache: Option<&DwrfStripeCacheData>) -> Bytes {
        cache.map(|c| c.data.clone()).unwrap_or_default()
    }

    pub fn write_postscript(&self, postscript: &PostScript) -> DwrfResult<Bytes> {
        let proto = dwrf_proto::PostScript {
            footer_length: Some(postscript.footer_length),
            compression: postscript.compression.to_proto() as i32,
            compression_block_size: Some(postscript.compression_block_size),
            metadata_length: Some(postscript.metadata_length),
            writer_version: Some(postscript.writer_version.clone()),
            cache_mode: Some(postscript.cache_mode.to_proto() as i32),
            cache_size: postscript.cache_size,
        };
        let encoded = proto.encode_to_vec();
        if encoded.len() > MAX_POSTSCRIPT_SIZE {
            dwrf_bail!(
                "postscript is {} bytes; the trailing length byte caps it at {}",
                encoded.len(),
                MAX_POSTSCRIPT_SIZE
            );
        }
        Ok(Bytes::from(encoded))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use crate::compression::{CompressionBufferPool, CompressionKind};
    use crate::metadata::ColumnEncoding;
    use crate::options::WriterOptions;
    use crate::stream::{Stream, StreamKind};
    use crate::stripe_cache::StripeCacheMode;

    fn metadata_writer(kind: CompressionKind) -> CompressedMetadataWriter {
        let options = WriterOptions::default().with_compression(kind);
        CompressedMetadataWriter::new(ColumnWriterOptions::from_writer_options(
            &options,
            Default::default(),
            Arc::new(CompressionBufferPool::default()),
        ))
    }

    #[test]
    fn stripe_footer_round_trips_uncompressed() {
        let writer = metadata_writer(CompressionKind::None);
        let mut encodings = BTreeMap::new();
        encodings.insert(0, ColumnEncoding::DIRECT);
        encodings.insert(1, ColumnEncoding::dictionary(42));
        let footer = StripeFooter {
            streams: vec![Stream::new(1, StreamKind::Data, 100).with_offset(0)],
            column_encodings: encodings,
            encrypted_groups: vec![],
        };
        let bytes = writer.write_stripe_footer(&footer).unwrap();
        let decoded = dwrf_proto::StripeFooter::decode(&bytes[..]).unwrap();
        assert_eq!(decoded.streams.len(), 1);
        assert_eq!(decoded.streams[0].offset, Some(0));
        assert_eq!(decoded.columns.len(), 2);
        assert_eq!(decoded.columns[1].dictionary_size, Some(42));
    }

    #[test]
    fn postscript_is_uncompressed_and_bounded() {
        let writer = metadata_writer(CompressionKind::Zstd);
        let postscript = PostScript {
            footer_length: 10,
            metadata_length: 5,
            compression: CompressionKind::Zstd,
            compression_block_size: 256 * 1024,
            writer_version: "test".to_string(),
            cache_mode: StripeCacheMode::None,
            cache_size: None,
        };
        let bytes = writer.write_postscript(&postscript).unwrap();
        assert!(bytes.len() <= MAX_POSTSCRIPT_SIZE);
        // Must decode without decompression.
        let decoded = dwrf_proto::PostScript::decode(&bytes[..]).unwrap();
        assert_eq!(decoded.footer_length, Some(10));
    }
}
