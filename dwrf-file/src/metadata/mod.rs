//! The in-memory metadata model of a file under construction.
//!
//! These are the structured forms the writer assembles; the
//! [`CompressedMetadataWriter`] converts them to [`dwrf_proto`] messages
//! and frames them through the file's compression. The read-back path in
//! [`crate::reader`] decodes the proto messages straight back into these
//! types.

mod statistics;
mod writer;

use std::collections::BTreeMap;

use bytes::Bytes;
use dwrf_error::{dwrf_bail, DwrfResult};
use itertools::Itertools;
pub use statistics::*;
pub use writer::*;

use crate::stream::Stream;
use crate::{CompressionKind, StripeCacheMode};

/// The kind of a node in the type tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeKind {
    Struct,
    Bigint,
    Varchar,
    Boolean,
    Double,
}

impl TypeKind {
    fn to_proto(self) -> dwrf_proto::r#type::TypeKind {
        use dwrf_proto::r#type::TypeKind as Proto;
        match self {
            Self::Struct => Proto::Struct,
            Self::Bigint => Proto::Bigint,
            Self::Varchar => Proto::Varchar,
            Self::Boolean => Proto::Boolean,
            Self::Double => Proto::Double,
        }
    }

    fn from_proto(proto: dwrf_proto::r#type::TypeKind) -> Self {
        use dwrf_proto::r#type::TypeKind as Proto;
        match proto {
            Proto::Struct => Self::Struct,
            Proto::Bigint => Self::Bigint,
            Proto::Varchar => Self::Varchar,
            Proto::Boolean => Self::Boolean,
            Proto::Double => Self::Double,
        }
    }
}

/// One node of the flattened type tree. The tree is numbered depth-first;
/// node 0 is the synthetic root struct whose fields are the top-level
/// columns. Node ids are dense and stable for the writer's lifetime.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DwrfType {
    kind: TypeKind,
    field_names: Vec<String>,
    field_type_indexes: Vec<u32>,
}

impl DwrfType {
    pub fn new(kind: TypeKind) -> Self {
        Self {
            kind,
            field_names: Vec::new(),
            field_type_indexes: Vec::new(),
        }
    }

    pub fn kind(&self) -> TypeKind {
        self.kind
    }

    pub fn field_count(&self) -> usize {
        self.field_type_indexes.len()
    }

    pub fn field_names(&self) -> &[String] {
        &self.field_names
    }

    pub fn field_type_indexes(&self) -> &[u32] {
        &self.field_type_indexes
    }

    /// Build the flattened type list for a row of named top-level columns.
    pub fn create_row_type(names: &[String], kinds: &[TypeKind]) -> Vec<DwrfType> {
        assert_eq!(names.len(), kinds.len());
        let mut root = DwrfType::new(TypeKind::Struct);
        let mut types = Vec::with_capacity(1 + kinds.len());
        for (name, kind) in names.iter().zip_eq(kinds) {
            root.field_names.push(name.clone());
            root.field_type_indexes.push((1 + types.len()) as u32);
            types.push(DwrfType::new(*kind));
        }
        let mut all = Vec::with_capacity(1 + types.len());
        all.push(root);
        all.extend(types);
        all
    }

    pub(crate) fn to_proto(&self) -> dwrf_proto::Type {
        dwrf_proto::Type {
            kind: self.kind.to_proto() as i32,
            subtypes: self.field_type_indexes.clone(),
            field_names: self.field_names.clone(),
        }
    }

    pub(crate) fn from_proto(proto: &dwrf_proto::Type) -> DwrfResult<Self> {
        let kind = dwrf_proto::r#type::TypeKind::try_from(proto.kind)
            .map_err(|_| dwrf_error::dwrf_err!(CorruptFile: "unknown type kind {}", proto.kind))?;
        Ok(Self {
            kind: TypeKind::from_proto(kind),
            field_names: proto.field_names.clone(),
            field_type_indexes: proto.subtypes.clone(),
        })
    }
}

/// Map each node id to the index of the top-level column containing it.
pub(crate) fn create_node_to_column_map(types: &[DwrfType]) -> Vec<u32> {
    let mut map = vec![0u32; types.len()];
    let root = &types[0];
    for (column, &field_node) in root.field_type_indexes.iter().enumerate() {
        for node in subtree_nodes(types, field_node) {
            map[node as usize] = column as u32;
        }
    }
    map
}

/// All node ids in the subtree rooted at `node`, in depth-first order.
pub(crate) fn subtree_nodes(types: &[DwrfType], node: u32) -> Vec<u32> {
    let mut nodes = vec![node];
    let mut i = 0;
    while i < nodes.len() {
        let current = &types[nodes[i] as usize];
        nodes.extend_from_slice(&current.field_type_indexes);
        i += 1;
    }
    nodes
}

/// The encoding of one column node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnEncoding {
    pub kind: ColumnEncodingKind,
    pub dictionary_size: u32,
}

impl ColumnEncoding {
    pub const DIRECT: ColumnEncoding = ColumnEncoding {
        kind: ColumnEncodingKind::Direct,
        dictionary_size: 0,
    };

    pub fn dictionary(size: u32) -> Self {
        Self {
            kind: ColumnEncodingKind::Dictionary,
            dictionary_size: size,
        }
    }

    pub(crate) fn to_proto(&self, node: u32) -> dwrf_proto::ColumnEncoding {
        use dwrf_proto::column_encoding::EncodingKind;
        dwrf_proto::ColumnEncoding {
            kind: match self.kind {
                ColumnEncodingKind::Direct => EncodingKind::Direct,
                ColumnEncodingKind::Dictionary => EncodingKind::Dictionary,
            } as i32,
            dictionary_size: Some(self.dictionary_size),
            node: Some(node),
        }
    }

    pub(crate) fn from_proto(proto: &dwrf_proto::ColumnEncoding) -> DwrfResult<(u32, Self)> {
        use dwrf_proto::column_encoding::EncodingKind;
        let kind = EncodingKind::try_from(proto.kind).map_err(
            |_| dwrf_error::dwrf_err!(CorruptFile: "unknown encoding kind {}", proto.kind),
        )?;
        let encoding = Self {
            kind: match kind {
                EncodingKind::Direct => ColumnEncodingKind::Direct,
                EncodingKind::Dictionary => ColumnEncodingKind::Dictionary,
            },
            dictionary_size: proto.dictionary_size.unwrap_or(0),
        };
        let node = proto
            .node
            .ok_or_else(|| dwrf_error::dwrf_err!(CorruptFile: "column encoding missing node"))?;
        Ok((node, encoding))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ColumnEncodingKind {
    Direct,
    Dictionary,
}

/// The location and shape of one stripe within the file.
#[derive(Clone, Debug, PartialEq)]
pub struct StripeInformation {
    pub number_of_rows: u64,
    pub offset: u64,
    pub index_length: u64,
    pub data_length: u64,
    pub footer_length: u64,
    pub raw_size: u64,
    /// One encrypted data-encryption-key blob per encryption group.
    pub encrypted_key_metadatas: Vec<Bytes>,
}

impl StripeInformation {
    pub fn total_length(&self) -> u64 {
        self.index_length + self.data_length + self.footer_length
    }

    pub(crate) fn to_proto(&self) -> dwrf_proto::StripeInformation {
        dwrf_proto::StripeInformation {
            offset: Some(self.offset),
            index_length: Some(self.index_length),
            data_length: Some(self.data_length),
            footer_length: Some(self.footer_length),
            number_of_rows: Some(self.number_of_rows),
            raw_data_size: Some(self.raw_size),
            key_metadata: self
                .encrypted_key_metadatas
                .iter()
                .map(|k| k.to_vec())
                .collect(),
        }
    }

    pub(crate) fn from_proto(proto: &dwrf_proto::StripeInformation) -> Self {
        Self {
            number_of_rows: proto.number_of_rows.unwrap_or(0),
            offset: proto.offset.unwrap_or(0),
            index_length: proto.index_length.unwrap_or(0),
            data_length: proto.data_length.unwrap_or(0),
            footer_length: proto.footer_length.unwrap_or(0),
            raw_size: proto.raw_data_size.unwrap_or(0),
            encrypted_key_metadatas: proto
                .key_metadata
                .iter()
                .map(|k| Bytes::from(k.clone()))
                .collect(),
        }
    }
}

/// The footer of one stripe: the unencrypted streams and encodings plus one
/// opaque encrypted payload per encryption group.
#[derive(Clone, Debug)]
pub struct StripeFooter {
    pub streams: Vec<Stream>,
    pub column_encodings: BTreeMap<u32, ColumnEncoding>,
    pub encrypted_groups: Vec<Bytes>,
}

/// The streams and encodings of one encryption group within a stripe.
/// Serialized and encrypted into a [`StripeFooter::encrypted_groups`] slot.
#[derive(Clone, Debug)]
pub struct StripeEncryptionGroup {
    pub streams: Vec<Stream>,
    pub column_encodings: BTreeMap<u32, ColumnEncoding>,
}

/// The dense per-node statistics of one stripe.
#[derive(Clone, Debug, PartialEq)]
pub struct StripeStatistics {
    pub column_statistics: Vec<ColumnStatistics>,
}

/// The file metadata section: every stripe's statistics, in stripe order.
#[derive(Clone, Debug, Default)]
pub struct Metadata {
    pub stripe_statistics: Vec<StripeStatistics>,
}

/// The footer-level description of one encryption group.
#[derive(Clone, Debug)]
pub struct EncryptionGroup {
    pub nodes: Vec<u32>,
    /// Unset by this writer: readers use the per-stripe key metadata.
    pub key_metadata: Option<Bytes>,
    /// One encrypted `FileStatistics` blob per group subtree root.
    pub statistics: Vec<Bytes>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyProvider {
    Unknown,
    CryptoService,
}

impl KeyProvider {
    pub(crate) fn to_proto(self) -> dwrf_proto::encryption::KeyProvider {
        use dwrf_proto::encryption::KeyProvider as Proto;
        match self {
            Self::Unknown => Proto::Unknown,
            Self::CryptoService => Proto::CryptoService,
        }
    }
}

/// The footer-level encryption descriptor.
#[derive(Clone, Debug)]
pub struct DwrfEncryption {
    pub key_provider: KeyProvider,
    pub groups: Vec<EncryptionGroup>,
}

/// The file footer.
#[derive(Clone, Debug)]
pub struct Footer {
    pub number_of_rows: u64,
    pub row_group_max_row_count: u32,
    pub raw_size: u64,
    pub stripes: Vec<StripeInformation>,
    pub types: Vec<DwrfType>,
    pub statistics: Vec<ColumnStatistics>,
    pub user_metadata: BTreeMap<String, Bytes>,
    pub encryption: Option<DwrfEncryption>,
    pub stripe_cache_offsets: Option<Vec<u32>>,
}

/// The postscript: everything a reader needs before it can decompress the
/// footer. Always serialized uncompressed.
#[derive(Clone, Debug, PartialEq)]
pub struct PostScript {
    pub footer_length: u64,
    pub metadata_length: u64,
    pub compression: CompressionKind,
    pub compression_block_size: u64,
    pub writer_version: String,
    pub cache_mode: StripeCacheMode,
    pub cache_size: Option<u32>,
}

/// Collapse a map keyed by dense node ids into a list indexed by node id.
/// Every id in `0..expected_size` must be present exactly once; a gap is a
/// programming bug in the column writers.
pub(crate) fn to_dense_list<T>(
    data: BTreeMap<u32, T>,
    expected_size: usize,
) -> DwrfResult<Vec<T>> {
    if data.len() != expected_size {
        dwrf_bail!(
            "expected {} dense entries, found {}",
            expected_size,
            data.len()
        );
    }
    if let Some((&last, _)) = data.iter().next_back() {
        if last as usize != expected_size - 1 {
            dwrf_bail!("node ids are not dense: max id {}", last);
        }
    }
    Ok(data.into_values().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row_type() -> Vec<DwrfType> {
        DwrfType::create_row_type(
            &["a".to_string(), "b".to_string()],
            &[TypeKind::Bigint, TypeKind::Varchar],
        )
    }

    #[test]
    fn row_type_is_dense_and_rooted() {
        let types = row_type();
        assert_eq!(types.len(), 3);
        assert_eq!(types[0].kind(), TypeKind::Struct);
        assert_eq!(types[0].field_type_indexes(), &[1, 2]);
        assert_eq!(types[1].kind(), TypeKind::Bigint);
        assert_eq!(types[2].kind(), TypeKind::Varchar);
    }

    #[test]
    fn node_to_column_map_covers_subtrees() {
        let types = row_type();
        assert_eq!(create_node_to_column_map(&types), vec![0, 0, 1]);
        assert_eq!(subtree_nodes(&types, 0), vec![0, 1, 2]);
        assert_eq!(subtree_nodes(&types, 2), vec![2]);
    }

    #[test]
    fn dense_list_rejects_gaps() {
        let mut data = BTreeMap::new();
        data.insert(0u32, "root");
        data.insert(2u32, "skipped one");
        assert!(to_dense_list(data, 2).is_err());

        let mut data = BTreeMap::new();
        data.insert(0u32, "root");
        data.insert(1u32, "child");
        assert_eq!(to_dense_list(data, 2).unwrap(), vec!["root", "child"]);
    }
}
