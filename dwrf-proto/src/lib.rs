//! Protobuf messages for the DWRF/ORC file metadata.
//!
//! These are hand-derived [`prost::Message`] definitions rather than
//! build-script codegen; the field tags are part of the on-disk format and
//! must never change. The writer converts its in-memory metadata model into
//! these messages immediately before serialization, and the read-back path
//! decodes them directly.

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct IntegerStatistics {
    #[prost(sint64, optional, tag = "1")]
    pub minimum: ::core::option::Option<i64>,
    #[prost(sint64, optional, tag = "2")]
    pub maximum: ::core::option::Option<i64>,
    #[prost(sint64, optional, tag = "3")]
    pub sum: ::core::option::Option<i64>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StringStatistics {
    #[prost(string, optional, tag = "1")]
    pub minimum: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "2")]
    pub maximum: ::core::option::Option<::prost::alloc::string::String>,
    /// sum stores the total length of all strings in the unit the statistics
    /// cover (row group, stripe, or file).
    #[prost(sint64, optional, tag = "3")]
    pub sum: ::core::option::Option<i64>,
}

/// Per-key statistics for one key of a flattened map column.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeyInfo {
    #[prost(int64, optional, tag = "1")]
    pub int_key: ::core::option::Option<i64>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub bytes_key: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MapEntryStatistics {
    #[prost(message, optional, tag = "1")]
    pub key: ::core::option::Option<KeyInfo>,
    #[prost(message, optional, tag = "2")]
    pub stats: ::core::option::Option<ColumnStatistics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MapStatistics {
    #[prost(message, repeated, tag = "1")]
    pub stats: ::prost::alloc::vec::Vec<MapEntryStatistics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnStatistics {
    #[prost(uint64, optional, tag = "1")]
    pub number_of_values: ::core::option::Option<u64>,
    #[prost(message, optional, tag = "2")]
    pub int_statistics: ::core::option::Option<IntegerStatistics>,
    #[prost(message, optional, tag = "3")]
    pub string_statistics: ::core::option::Option<StringStatistics>,
    /// Logical (uncompressed, unencoded) size of the values.
    #[prost(uint64, optional, tag = "4")]
    pub raw_size: ::core::option::Option<u64>,
    /// Physical size of the streams backing the column within the unit.
    #[prost(uint64, optional, tag = "5")]
    pub storage_size: ::core::option::Option<u64>,
    #[prost(message, optional, tag = "6")]
    pub map_statistics: ::core::option::Option<MapStatistics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RowIndexEntry {
    /// Stream positions needed to seek to the start of the row group,
    /// concatenated across the column's streams in index order.
    #[prost(uint64, repeated, tag = "1")]
    pub positions: ::prost::alloc::vec::Vec<u64>,
    #[prost(message, optional, tag = "2")]
    pub statistics: ::core::option::Option<ColumnStatistics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RowIndex {
    #[prost(message, repeated, tag = "1")]
    pub entry: ::prost::alloc::vec::Vec<RowIndexEntry>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Stream {
    #[prost(enumeration = "stream::StreamKind", tag = "1")]
    pub kind: i32,
    /// The node id of the column the stream belongs to.
    #[prost(uint32, optional, tag = "2")]
    pub column: ::core::option::Option<u32>,
    #[prost(uint64, optional, tag = "3")]
    pub length: ::core::option::Option<u64>,
    /// Offset from the start of the stripe's index+data region. Present only
    /// on the first stream of each encryption region; readers reconstruct
    /// the other offsets by summing lengths.
    #[prost(uint64, optional, tag = "4")]
    pub offset: ::core::option::Option<u64>,
}

pub mod stream {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum StreamKind {
        Present = 0,
        Data = 1,
        Length = 2,
        DictionaryData = 3,
        RowIndex = 4,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ColumnEncoding {
    #[prost(enumeration = "column_encoding::EncodingKind", tag = "1")]
    pub kind: i32,
    #[prost(uint32, optional, tag = "2")]
    pub dictionary_size: ::core::option::Option<u32>,
    /// The node id the encoding describes. Encodings inside an encrypted
    /// stripe group are sparse over the file's nodes, so the node must be
    /// carried explicitly.
    #[prost(uint32, optional, tag = "3")]
    pub node: ::core::option::Option<u32>,
}

pub mod column_encoding {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum EncodingKind {
        Direct = 0,
        Dictionary = 1,
    }
}

/// The streams and encodings of one encryption group within a stripe. The
/// serialized message is encrypted with the group's data encryption key and
/// embedded in the stripe footer as an opaque blob.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StripeEncryptionGroup {
    #[prost(message, repeated, tag = "1")]
    pub streams: ::prost::alloc::vec::Vec<Stream>,
    #[prost(message, repeated, tag = "2")]
    pub encoding: ::prost::alloc::vec::Vec<ColumnEncoding>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StripeFooter {
    #[prost(message, repeated, tag = "1")]
    pub streams: ::prost::alloc::vec::Vec<Stream>,
    #[prost(message, repeated, tag = "2")]
    pub columns: ::prost::alloc::vec::Vec<ColumnEncoding>,
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub encrypted_groups: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StripeInformation {
    #[prost(uint64, optional, tag = "1")]
    pub offset: ::core::option::Option<u64>,
    #[prost(uint64, optional, tag = "2")]
    pub index_length: ::core::option::Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub data_length: ::core::option::Option<u64>,
    #[prost(uint64, optional, tag = "4")]
    pub footer_length: ::core::option::Option<u64>,
    #[prost(uint64, optional, tag = "5")]
    pub number_of_rows: ::core::option::Option<u64>,
    #[prost(uint64, optional, tag = "6")]
    pub raw_data_size: ::core::option::Option<u64>,
    /// One encrypted data-encryption-key blob per encryption group.
    #[prost(bytes = "vec", repeated, tag = "7")]
    pub key_metadata: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StripeStatistics {
    #[prost(message, repeated, tag = "1")]
    pub col_stats: ::prost::alloc::vec::Vec<ColumnStatistics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Metadata {
    #[prost(message, repeated, tag = "1")]
    pub stripe_stats: ::prost::alloc::vec::Vec<StripeStatistics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Type {
    #[prost(enumeration = "r#type::TypeKind", tag = "1")]
    pub kind: i32,
    #[prost(uint32, repeated, tag = "2")]
    pub subtypes: ::prost::alloc::vec::Vec<u32>,
    #[prost(string, repeated, tag = "3")]
    pub field_names: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
}

pub mod r#type {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum TypeKind {
        Struct = 0,
        Bigint = 1,
        Varchar = 2,
        Boolean = 3,
        Double = 4,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserMetadataItem {
    #[prost(string, optional, tag = "1")]
    pub name: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub value: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
}

/// File-level statistics for the subtree of one encryption group. The
/// serialized message is encrypted with the group's data encryption key.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileStatistics {
    #[prost(message, repeated, tag = "1")]
    pub statistics: ::prost::alloc::vec::Vec<ColumnStatistics>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct EncryptionGroup {
    #[prost(uint32, repeated, tag = "1")]
    pub nodes: ::prost::alloc::vec::Vec<u32>,
    /// Readers take key metadata from the per-stripe copies; the footer
    /// level field exists for writers that choose to duplicate it.
    #[prost(bytes = "vec", optional, tag = "2")]
    pub key_metadata: ::core::option::Option<::prost::alloc::vec::Vec<u8>>,
    /// One encrypted [`FileStatistics`] blob per group subtree root.
    #[prost(bytes = "vec", repeated, tag = "3")]
    pub statistics: ::prost::alloc::vec::Vec<::prost::alloc::vec::Vec<u8>>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Encryption {
    #[prost(enumeration = "encryption::KeyProvider", tag = "1")]
    pub key_provider: i32,
    #[prost(message, repeated, tag = "2")]
    pub encryption_groups: ::prost::alloc::vec::Vec<EncryptionGroup>,
}

pub mod encryption {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum KeyProvider {
        Unknown = 0,
        CryptoService = 1,
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Footer {
    #[prost(uint64, optional, tag = "1")]
    pub number_of_rows: ::core::option::Option<u64>,
    /// The maximum row count of a row group, aka the row index stride.
    #[prost(uint32, optional, tag = "2")]
    pub row_index_stride: ::core::option::Option<u32>,
    #[prost(uint64, optional, tag = "3")]
    pub raw_data_size: ::core::option::Option<u64>,
    #[prost(message, repeated, tag = "4")]
    pub stripes: ::prost::alloc::vec::Vec<StripeInformation>,
    #[prost(message, repeated, tag = "5")]
    pub types: ::prost::alloc::vec::Vec<Type>,
    #[prost(message, repeated, tag = "6")]
    pub statistics: ::prost::alloc::vec::Vec<ColumnStatistics>,
    #[prost(message, repeated, tag = "7")]
    pub metadata: ::prost::alloc::vec::Vec<UserMetadataItem>,
    #[prost(message, optional, tag = "8")]
    pub encryption: ::core::option::Option<Encryption>,
    /// Offsets of each stripe's region within the stripe cache blob, plus a
    /// final terminator offset.
    #[prost(uint32, repeated, tag = "9")]
    pub stripe_cache_offsets: ::prost::alloc::vec::Vec<u32>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PostScript {
    #[prost(uint64, optional, tag = "1")]
    pub footer_length: ::core::option::Option<u64>,
    #[prost(enumeration = "post_script::CompressionKind", tag = "2")]
    pub compression: i32,
    #[prost(uint64, optional, tag = "3")]
    pub compression_block_size: ::core::option::Option<u64>,
    #[prost(uint64, optional, tag = "4")]
    pub metadata_length: ::core::option::Option<u64>,
    #[prost(string, optional, tag = "5")]
    pub writer_version: ::core::option::Option<::prost::alloc::string::String>,
    #[prost(enumeration = "post_script::StripeCacheMode", optional, tag = "6")]
    pub cache_mode: ::core::option::Option<i32>,
    #[prost(uint32, optional, tag = "7")]
    pub cache_size: ::core::option::Option<u32>,
}

pub mod post_script {
    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum CompressionKind {
        None = 0,
        Zlib = 1,
        Snappy = 2,
        Lz4 = 3,
        Zstd = 4,
    }

    #[derive(
        Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration,
    )]
    #[repr(i32)]
    pub enum StripeCacheMode {
        Na = 0,
        Index = 1,
        Footer = 2,
        Both = 3,
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn stream_round_trips() {
        let stream = Stream {
            kind: stream::StreamKind::Data as i32,
            column: Some(3),
            length: Some(128),
            offset: None,
        };
        let bytes = stream.encode_to_vec();
        let decoded = Stream::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, stream);
        assert_eq!(decoded.offset, None);
    }

    #[test]
    fn footer_skips_absent_fields() {
        let footer = Footer {
            number_of_rows: Some(0),
            ..Default::default()
        };
        let decoded = Footer::decode(footer.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.number_of_rows, Some(0));
        assert!(decoded.encryption.is_none());
        assert!(decoded.stripes.is_empty());
    }
}
