//! Writer configuration.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;

use crate::compression::{CompressionBufferPool, CompressionKind};
use crate::encryption::{EncryptionLibrary, WriterEncryption};
use crate::flush::{DefaultFlushPolicy, FlushPolicy};
use crate::layout::StreamLayout;
use crate::stripe_cache::DwrfStripeCacheOptions;

/// Which metadata dialect the file carries. Both dialects share the
/// container layout; only DWRF files may carry encryption and a stripe
/// cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FileEncoding {
    Orc,
    #[default]
    Dwrf,
}

/// Configuration for a [`crate::DwrfWriter`].
#[derive(Clone)]
pub struct WriterOptions {
    pub encoding: FileEncoding,
    /// Encryption groups; requires `encryption_library` and the DWRF
    /// encoding.
    pub encryption: Option<WriterEncryption>,
    pub encryption_library: Option<Arc<dyn EncryptionLibrary>>,
    /// Arbitrary key/value metadata recorded in the footer. The writer
    /// version property is always added.
    pub user_metadata: BTreeMap<String, Bytes>,
    /// Mirror the input for a post-write read-back self-check via
    /// [`crate::DwrfWriter::validate`].
    pub validate: bool,
    pub flush_policy: Arc<dyn FlushPolicy>,
    pub row_group_max_row_count: u32,
    pub compression_kind: CompressionKind,
    pub compression_level: Option<i32>,
    /// The maximum uncompressed chunk size; also recorded in the
    /// postscript as the buffer a reader must be prepared to allocate.
    pub max_compression_buffer_size: usize,
    pub min_output_buffer_chunk_size: usize,
    pub max_output_buffer_chunk_size: usize,
    pub dictionary_max_memory: u64,
    /// The band below the maximum within which the dictionary memory is
    /// reported "almost full" to the flush policy.
    pub dictionary_memory_almost_full_range: u64,
    /// Dictionary columns smaller than this skip the usefulness check.
    pub dictionary_useful_check_column_size: u64,
    /// How many ingest chunks between usefulness checks.
    pub dictionary_useful_check_per_chunk_frequency: u64,
    pub integer_dictionary_encoding_enabled: bool,
    pub string_dictionary_encoding_enabled: bool,
    pub string_dictionary_sorting_enabled: bool,
    pub ignore_dictionary_row_group_sizes: bool,
    /// After a conversion to direct, keep that column direct for this many
    /// subsequent stripes before allowing a dictionary again.
    pub preserve_direct_encoding_stripe_count: u32,
    /// Strings longer than this are excluded from min/max statistics.
    pub max_string_statistics_limit: usize,
    /// Top-level column indexes to treat as flattened maps.
    pub flattened_columns: Vec<usize>,
    pub map_statistics_enabled: bool,
    pub max_flattened_map_key_count: u32,
    pub reset_output_buffer: bool,
    pub lazy_output_buffer: bool,
    pub stream_layout: StreamLayout,
    pub stripe_cache_options: Option<DwrfStripeCacheOptions>,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            encoding: FileEncoding::default(),
            encryption: None,
            encryption_library: None,
            user_metadata: BTreeMap::new(),
            validate: false,
            flush_policy: Arc::new(DefaultFlushPolicy::default()),
            row_group_max_row_count: 10_000,
            compression_kind: CompressionKind::Zlib,
            compression_level: None,
            max_compression_buffer_size: 256 * 1024,
            min_output_buffer_chunk_size: 8 * 1024,
            max_output_buffer_chunk_size: 1024 * 1024,
            dictionary_max_memory: 16 << 20,
            dictionary_memory_almost_full_range: 4 << 20,
            dictionary_useful_check_column_size: 6 << 20,
            dictionary_useful_check_per_chunk_frequency: 4,
            integer_dictionary_encoding_enabled: false,
            string_dictionary_encoding_enabled: true,
            string_dictionary_sorting_enabled: true,
            ignore_dictionary_row_group_sizes: false,
            preserve_direct_encoding_stripe_count: 0,
            max_string_statistics_limit: 64,
            flattened_columns: Vec::new(),
            map_statistics_enabled: false,
            max_flattened_map_key_count: 25_000,
            reset_output_buffer: false,
            lazy_output_buffer: false,
            stream_layout: StreamLayout::default(),
            stripe_cache_options: None,
        }
    }
}

impl WriterOptions {
    pub fn with_encoding(mut self, encoding: FileEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_encryption(
        mut self,
        encryption: WriterEncryption,
        library: Arc<dyn EncryptionLibrary>,
    ) -> Self {
        self.encryption = Some(encryption);
        self.encryption_library = Some(library);
        self
    }

    pub fn with_user_metadata(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.user_metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_validation(mut self) -> Self {
        self.validate = true;
        self
    }

    pub fn with_flush_policy(mut self, policy: Arc<dyn FlushPolicy>) -> Self {
        self.flush_policy = policy;
        self
    }

    pub fn with_row_group_max_row_count(mut self, count: u32) -> Self {
        assert!(count > 0, "row group max row count must be positive");
        self.row_group_max_row_count = count;
        self
    }

    pub fn with_compression(mut self, kind: CompressionKind) -> Self {
        self.compression_kind = kind;
        self
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = Some(level);
        self
    }

    pub fn with_dictionary_max_memory(mut self, bytes: u64) -> Self {
        self.dictionary_max_memory = bytes;
        self
    }

    pub fn with_dictionary_memory_almost_full_range(mut self, bytes: u64) -> Self {
        self.dictionary_memory_almost_full_range = bytes;
        self
    }

    pub fn with_integer_dictionary_encoding(mut self, enabled: bool) -> Self {
        self.integer_dictionary_encoding_enabled = enabled;
        self
    }

    pub fn with_string_dictionary_encoding(mut self, enabled: bool) -> Self {
        self.string_dictionary_encoding_enabled = enabled;
        self
    }

    pub fn with_string_dictionary_sorting(mut self, enabled: bool) -> Self {
        self.string_dictionary_sorting_enabled = enabled;
        self
    }

    pub fn with_stream_layout(mut self, layout: StreamLayout) -> Self {
        self.stream_layout = layout;
        self
    }

    pub fn with_stripe_cache(mut self, options: DwrfStripeCacheOptions) -> Self {
        self.stripe_cache_options = Some(options);
        self
    }

    pub fn with_max_string_statistics_limit(mut self, limit: usize) -> Self {
        self.max_string_statistics_limit = limit;
        self
    }

    pub fn with_preserve_direct_encoding_stripe_count(mut self, stripes: u32) -> Self {
        self.preserve_direct_encoding_stripe_count = stripes;
        self
    }
}

/// The subset of the configuration column writers and the metadata writer
/// need, plus the shared compression buffer pool.
#[derive(Clone)]
pub struct ColumnWriterOptions {
    pub compression_kind: CompressionKind,
    pub compression_level: Option<i32>,
    pub max_compression_buffer_size: usize,
    pub min_output_buffer_chunk_size: usize,
    pub max_output_buffer_chunk_size: usize,
    pub string_statistics_limit: usize,
    pub integer_dictionary_encoding_enabled: bool,
    pub string_dictionary_encoding_enabled: bool,
    pub string_dictionary_sorting_enabled: bool,
    pub ignore_dictionary_row_group_sizes: bool,
    pub preserve_direct_encoding_stripe_count: u32,
    pub flattened_nodes: HashSet<u32>,
    pub map_statistics_enabled: bool,
    pub max_flattened_map_key_count: u32,
    pub reset_output_buffer: bool,
    pub lazy_output_buffer: bool,
    pub buffer_pool: Arc<CompressionBufferPool>,
}

impl ColumnWriterOptions {
    pub(crate) fn from_writer_options(
        options: &WriterOptions,
        flattened_nodes: HashSet<u32>,
        buffer_pool: Arc<CompressionBufferPool>,
    ) -> Self {
        Self {
            compression_kind: options.compression_kind,
            compression_level: options.compression_level,
            max_compression_buffer_size: options.max_compression_buffer_size,
            min_output_buffer_chunk_size: options.min_output_buffer_chunk_size,
            max_output_buffer_chunk_size: options.max_output_buffer_chunk_size,
            string_statistics_limit: options.max_string_statistics_limit,
            integer_dictionary_encoding_enabled: options.integer_dictionary_encoding_enabled,
            string_dictionary_encoding_enabled: options.string_dictionary_encoding_enabled,
            string_dictionary_sorting_enabled: options.string_dictionary_sorting_enabled,
            ignore_dictionary_row_group_sizes: options.ignore_dictionary_row_group_sizes,
            preserve_direct_encoding_stripe_count: options.preserve_direct_encoding_stripe_count,
            flattened_nodes,
            map_statistics_enabled: options.map_statistics_enabled,
            max_flattened_map_key_count: options.max_flattened_map_key_count,
            reset_output_buffer: options.reset_output_buffer,
            lazy_output_buffer: options.lazy_output_buffer,
            buffer_pool,
        }
    }
}
