//! The writer orchestrator: ingests pages, slices them into row groups and
//! stripes, drives the column writers, and emits the file.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use dwrf_error::{dwrf_bail, dwrf_err, DwrfResult};
use itertools::Itertools;
use log::debug;

use crate::column::{create_column_writer, ColumnWriter};
use crate::dictionary::DictionaryCompressionOptimizer;
use crate::encryption::{EncryptionInfo, WriterEncryption};
use crate::flush::{FlushPolicy, FlushReason};
use crate::metadata::{
    create_node_to_column_map, merge_column_statistics, to_dense_list, ColumnEncoding,
    ColumnStatistics, CompressedMetadataWriter, DwrfEncryption, DwrfType, EncryptionGroup,
    Footer, Metadata, PostScript, StripeEncryptionGroup, StripeFooter, StripeInformation,
    StripeStatistics, TypeKind,
};
use crate::options::{ColumnWriterOptions, FileEncoding, WriterOptions};
use crate::page::Page;
use crate::reader::ReadDecryption;
use crate::sink::{DataOutput, DataSink};
use crate::stream::{Stream, StreamDataOutput};
use crate::stripe_cache::DwrfStripeCacheWriter;
use crate::validation::WriteValidationBuilder;
use crate::{StreamLayout, MAGIC, WRITER_VERSION_METADATA_KEY};

/// Counters observable while and after writing.
#[derive(Debug, Default)]
pub struct WriterStats {
    stripes_max_rows: u64,
    stripes_max_bytes: u64,
    stripes_dictionary_full: u64,
    stripes_closed: u64,
    stripe_bytes: u64,
    stripe_rows: u64,
}

impl WriterStats {
    fn record_stripe_written(&mut self, reason: FlushReason, information: &StripeInformation) {
        match reason {
            FlushReason::MaxRows => self.stripes_max_rows += 1,
            FlushReason::MaxBytes => self.stripes_max_bytes += 1,
            FlushReason::DictionaryFull => self.stripes_dictionary_full += 1,
            FlushReason::Closed => self.stripes_closed += 1,
        }
        self.stripe_bytes += information.total_length();
        self.stripe_rows += information.number_of_rows;
    }

    pub fn stripe_count(&self) -> u64 {
        self.stripes_max_rows
            + self.stripes_max_bytes
            + self.stripes_dictionary_full
            + self.stripes_closed
    }

    pub fn stripes_by_reason(&self, reason: FlushReason) -> u64 {
        match reason {
            FlushReason::MaxRows => self.stripes_max_rows,
            FlushReason::MaxBytes => self.stripes_max_bytes,
            FlushReason::DictionaryFull => self.stripes_dictionary_full,
            FlushReason::Closed => self.stripes_closed,
        }
    }

    pub fn stripe_rows(&self) -> u64 {
        self.stripe_rows
    }

    pub fn stripe_bytes(&self) -> u64 {
        self.stripe_bytes
    }
}

/// Physical stream sizes accumulated during stripe assembly, attached to
/// the file-level statistics as per-node storage sizes.
struct StreamSizeHelper {
    node_sizes: Vec<u64>,
}

impl StreamSizeHelper {
    fn new(node_count: usize) -> Self {
        Self {
            node_sizes: vec![0; node_count],
        }
    }

    fn collect_stream_sizes<'a>(&mut self, streams: impl Iterator<Item = &'a StreamDataOutput>) {
        for stream in streams {
            if let Some(size) = self.node_sizes.get_mut(stream.stream().column() as usize) {
                *size += stream.size();
            }
        }
    }

    fn node_size(&self, node: usize) -> u64 {
        self.node_sizes.get(node).copied().unwrap_or(0)
    }
}

/// A flushed stripe retained in memory until the footer is written.
struct ClosedStripe {
    information: StripeInformation,
    statistics: StripeStatistics,
}

impl ClosedStripe {
    fn retained_bytes(&self) -> u64 {
        let keys: u64 = self
            .information
            .encrypted_key_metadatas
            .iter()
            .map(|k| k.len() as u64)
            .sum();
        keys + self.statistics.column_statistics.len() as u64
            * std::mem::size_of::<ColumnStatistics>() as u64
    }
}

/// A streaming writer for DWRF/ORC files.
///
/// Single-owner and synchronous: [`DwrfWriter::write`] blocks until the
/// page's effects are buffered (and any triggered stripe flush is durable
/// in the sink), and [`DwrfWriter::close`] finishes the file. A failed
/// flush leaves the file unusable; the writer does not attempt recovery.
pub struct DwrfWriter<S: DataSink> {
    sink: S,
    types: Vec<DwrfType>,
    node_to_column: Vec<u32>,
    encoding: FileEncoding,
    options: WriterOptions,
    column_writer_options: ColumnWriterOptions,
    flush_policy: Arc<dyn FlushPolicy>,
    stream_layout: StreamLayout,
    metadata_writer: CompressedMetadataWriter,
    user_metadata: BTreeMap<String, Bytes>,
    encryption_config: Option<WriterEncryption>,
    encryption_info: EncryptionInfo,
    stripe_cache_writer: Option<DwrfStripeCacheWriter>,
    column_writers: Vec<Box<dyn ColumnWriter>>,
    dictionary_optimizer: DictionaryCompressionOptimizer,
    validation: Option<WriteValidationBuilder>,
    stream_sizes: StreamSizeHelper,
    stats: WriterStats,
    closed_stripes: Vec<ClosedStripe>,

    row_group_row_count: u64,
    stripe_row_count: u64,
    buffered_bytes: u64,
    stripe_raw_size: u64,
    raw_size: u64,
    number_of_rows: u64,
    unencrypted_file_statistics: Vec<ColumnStatistics>,
    closed: bool,
}

impl<S: DataSink> DwrfWriter<S> {
    pub fn try_new(
        sink: S,
        column_names: Vec<String>,
        column_kinds: Vec<TypeKind>,
        options: WriterOptions,
    ) -> DwrfResult<Self> {
        if column_names.is_empty() {
            dwrf_bail!(InvalidArgument: "a file must have at least one column");
        }
        if column_names.len() != column_kinds.len() {
            dwrf_bail!(
                InvalidArgument: "{} column names for {} column kinds",
                column_names.len(),
                column_kinds.len()
            );
        }

        let types = DwrfType::create_row_type(&column_names, &column_kinds);
        let node_to_column = create_node_to_column_map(&types);

        let flattened_nodes: HashSet<u32> = options
            .flattened_columns
            .iter()
            .filter_map(|&column| types[0].field_type_indexes().get(column).copied())
            .collect();
        let buffer_pool = Arc::new(crate::CompressionBufferPool::default());
        let column_writer_options = ColumnWriterOptions::from_writer_options(
            &options,
            flattened_nodes.clone(),
            buffer_pool,
        );

        let encryption_info = match (&options.encryption, &options.encryption_library) {
            (Some(encryption), Some(library)) => {
                if options.encoding != FileEncoding::Dwrf {
                    dwrf_bail!(InvalidArgument: "encryption requires the DWRF encoding");
                }
                EncryptionInfo::try_new(encryption, library.clone(), &types)?
            }
            (Some(_), None) => {
                dwrf_bail!(InvalidEncryption: "encryption configured without a library")
            }
            _ => EncryptionInfo::none(types.len()),
        };

        let stripe_cache_writer = match (options.encoding, options.stripe_cache_options) {
            (FileEncoding::Dwrf, Some(cache)) => {
                Some(DwrfStripeCacheWriter::new(cache.mode, cache.max_size))
            }
            _ => None,
        };

        let mut column_writers = Vec::with_capacity(column_names.len());
        for &node in types[0].field_type_indexes() {
            column_writers.push(create_column_writer(
                node,
                &types,
                &column_writer_options,
                &encryption_info,
            )?);
        }

        let flush_policy = options.flush_policy.clone();
        let dictionary_optimizer = DictionaryCompressionOptimizer::new(
            flush_policy.stripe_min_bytes(),
            flush_policy.stripe_max_bytes(),
            flush_policy.stripe_max_row_count(),
            options.dictionary_max_memory,
            options.dictionary_memory_almost_full_range,
            options.dictionary_useful_check_column_size,
            options.dictionary_useful_check_per_chunk_frequency,
        );

        let mut user_metadata = options.user_metadata.clone();
        user_metadata.insert(
            WRITER_VERSION_METADATA_KEY.to_string(),
            Bytes::from_static(env!("CARGO_PKG_VERSION").as_bytes()),
        );

        let validation = options.validate.then(|| {
            let mut builder = WriteValidationBuilder::default();
            builder.set_compression(options.compression_kind);
            builder.set_types(types.clone());
            builder.set_flattened_nodes(flattened_nodes);
            builder.set_row_group_max_row_count(options.row_group_max_row_count);
            builder.set_column_names(column_names.clone());
            for (key, value) in &user_metadata {
                builder.add_metadata_property(key.clone(), value.clone());
            }
            builder
        });

        let metadata_writer = CompressedMetadataWriter::new(column_writer_options.clone());
        let stream_sizes = StreamSizeHelper::new(types.len());
        let encryption_config = options.encryption.clone();
        let stream_layout = options.stream_layout;
        let encoding = options.encoding;

        Ok(Self {
            sink,
            types,
            node_to_column,
            encoding,
            options,
            column_writer_options,
            flush_policy,
            stream_layout,
            metadata_writer,
            user_metadata,
            encryption_config,
            encryption_info,
            stripe_cache_writer,
            column_writers,
            dictionary_optimizer,
            validation,
            stream_sizes,
            stats: WriterStats::default(),
            closed_stripes: Vec::new(),
            row_group_row_count: 0,
            stripe_row_count: 0,
            buffered_bytes: 0,
            stripe_raw_size: 0,
            raw_size: 0,
            number_of_rows: 0,
            unencrypted_file_statistics: Vec::new(),
            closed: false,
        })
    }

    /// Number of bytes already flushed to the sink.
    pub fn written_bytes(&self) -> u64 {
        self.sink.size()
    }

    /// Number of pending bytes not yet flushed.
    pub fn buffered_bytes(&self) -> u64 {
        self.buffered_bytes
    }

    pub fn retained_bytes(&self) -> u64 {
        self.column_writers
            .iter()
            .map(|w| w.retained_bytes())
            .sum::<u64>()
            + self
                .closed_stripes
                .iter()
                .map(ClosedStripe::retained_bytes)
                .sum::<u64>()
            + self.sink.retained_bytes()
            + self.column_writer_options.buffer_pool.retained_bytes()
            + self
                .validation
                .as_ref()
                .map(|v| v.retained_bytes())
                .unwrap_or(0)
    }

    pub fn stats(&self) -> &WriterStats {
        &self.stats
    }

    /// Total dictionary-to-direct conversions performed by the optimizer.
    pub fn dictionary_conversion_count(&self) -> u64 {
        self.dictionary_optimizer.direct_conversion_count()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Append a batch of rows. Zero-row pages are no-ops.
    pub fn write(&mut self, page: &Page) -> DwrfResult<()> {
        if self.closed {
            dwrf_bail!("write after close");
        }
        if page.position_count() == 0 {
            return Ok(());
        }
        if page.channel_count() != self.column_writers.len() {
            dwrf_bail!(
                InvalidArgument: "page has {} columns, writer has {}",
                page.channel_count(),
                self.column_writers.len()
            );
        }

        if let Some(validation) = &mut self.validation {
            validation.add_page(page);
        }

        let max_chunk_row_count = self.flush_policy.max_chunk_row_count(page);
        let mut position = 0;
        while position < page.position_count() {
            // Never cross a row-group or stripe boundary mid-chunk.
            let chunk_rows = max_chunk_row_count
                .min(self.options.row_group_max_row_count as u64 - self.row_group_row_count)
                .min(self.flush_policy.stripe_max_row_count() - self.stripe_row_count)
                .min((page.position_count() - position) as u64) as usize;
            let chunk = page.region(position, chunk_rows);
            position += chunk_rows;
            self.write_chunk(&chunk)?;
        }
        Ok(())
    }

    fn write_chunk(&mut self, chunk: &Page) -> DwrfResult<()> {
        if self.row_group_row_count == 0 {
            for writer in &mut self.column_writers {
                writer.begin_row_group();
            }
        }

        for (channel, writer) in self.column_writers.iter_mut().enumerate() {
            self.stripe_raw_size += writer.write_block(chunk.block(channel))?;
        }
        self.buffered_bytes = self
            .column_writers
            .iter()
            .map(|w| w.buffered_bytes())
            .sum();

        self.row_group_row_count += chunk.position_count() as u64;
        assert!(
            self.row_group_row_count <= self.options.row_group_max_row_count as u64,
            "row group overran its maximum"
        );
        self.stripe_row_count += chunk.position_count() as u64;
        assert!(
            self.stripe_row_count <= self.flush_policy.stripe_max_row_count(),
            "stripe overran its maximum row count"
        );

        if self.row_group_row_count == self.options.row_group_max_row_count as u64 {
            self.finish_row_group()?;
        }

        // Convert dictionary columns to direct if memory pressure demands.
        self.dictionary_optimizer.optimize(
            &mut self.column_writers,
            self.buffered_bytes,
            self.stripe_row_count,
        )?;

        self.buffered_bytes = self
            .column_writers
            .iter()
            .map(|w| w.buffered_bytes())
            .sum();
        let dictionary_is_full = self.dictionary_optimizer.is_full(&mut self.column_writers);
        if let Some(reason) = self.flush_policy.should_flush_stripe(
            self.stripe_row_count,
            self.buffered_bytes,
            dictionary_is_full,
        ) {
            self.flush_stripe(reason)?;
        }
        Ok(())
    }

    fn finish_row_group(&mut self) -> DwrfResult<()> {
        let mut statistics: BTreeMap<u32, ColumnStatistics> = BTreeMap::new();
        for writer in &mut self.column_writers {
            statistics.extend(writer.finish_row_group()?);
        }
        if let Some(validation) = &mut self.validation {
            validation.add_row_group_statistics(&statistics);
        }
        self.row_group_row_count = 0;
        Ok(())
    }

    fn flush_stripe(&mut self, reason: FlushReason) -> DwrfResult<()> {
        let result = self.flush_stripe_inner(reason);
        // Open the next stripe on every exit path so a failed flush cannot
        // double-emit buffered data on close.
        for writer in &mut self.column_writers {
            writer.reset();
        }
        self.dictionary_optimizer.reset();
        self.row_group_row_count = 0;
        self.stripe_row_count = 0;
        self.stripe_raw_size = 0;
        self.buffered_bytes = self
            .column_writers
            .iter()
            .map(|w| w.buffered_bytes())
            .sum();
        result
    }

    fn flush_stripe_inner(&mut self, reason: FlushReason) -> DwrfResult<()> {
        let mut outputs = Vec::new();
        let mut stripe_start = self.sink.size();
        if self.closed_stripes.is_empty() {
            outputs.push(DataOutput::from_bytes(Bytes::from_static(&MAGIC)));
            stripe_start += MAGIC.len() as u64;
        }

        self.flush_column_writers(reason)?;
        outputs.extend(self.buffer_stripe_data(stripe_start, reason)?);
        self.raw_size += self.stripe_raw_size;
        if reason == FlushReason::Closed {
            outputs.extend(self.buffer_file_footer()?);
        }
        self.sink.write(outputs)
    }

    fn flush_column_writers(&mut self, reason: FlushReason) -> DwrfResult<()> {
        if self.stripe_row_count == 0 {
            assert!(
                reason == FlushReason::Closed,
                "an empty stripe is not allowed"
            );
        } else {
            if self.row_group_row_count > 0 {
                self.finish_row_group()?;
            }
            // Collapse dictionaries with a poor compression ratio before
            // the streams are sealed.
            self.dictionary_optimizer
                .final_optimize(&mut self.column_writers, self.buffered_bytes)?;
        }
        for writer in &mut self.column_writers {
            writer.close()?;
        }
        Ok(())
    }

    /// Assemble the current stripe into an ordered output list: index
    /// streams, data streams, then the stripe footer.
    fn buffer_stripe_data(
        &mut self,
        stripe_start: u64,
        reason: FlushReason,
    ) -> DwrfResult<Vec<DataOutput>> {
        if self.stripe_row_count == 0 {
            return Ok(Vec::new());
        }

        let mut unencrypted_streams: Vec<Stream> = Vec::new();
        let mut encrypted_streams: BTreeMap<u32, Vec<Stream>> = BTreeMap::new();
        // The format stores a length per stream but an offset only at
        // region boundaries; `previous_group` tracks the region of the
        // stream before the current one. `None` is the unencrypted
        // region, which is also the initial state.
        let mut previous_group: Option<u32> = None;
        let mut offset = 0u64;

        let mut bucket_stream =
            |stream_output: &StreamDataOutput,
             encryption_info: &EncryptionInfo,
             unencrypted_streams: &mut Vec<Stream>,
             encrypted_streams: &mut BTreeMap<u32, Vec<Stream>>| {
                let group = encryption_info.group_by_node(stream_output.stream().column());
                let descriptor = if group == previous_group {
                    stream_output.stream().clone()
                } else {
                    stream_output.stream().clone().with_offset(offset)
                };
                match group {
                    Some(group) => encrypted_streams.entry(group).or_default().push(descriptor),
                    None => unencrypted_streams.push(descriptor),
                }
                previous_group = group;
                offset += stream_output.size();
            };

        // Index streams, in column order.
        let mut index_streams: Vec<StreamDataOutput> = Vec::new();
        for writer in &mut self.column_writers {
            index_streams.extend(writer.index_streams()?);
        }
        let index_length: u64 = index_streams.iter().map(StreamDataOutput::size).sum();
        for stream in &index_streams {
            bucket_stream(
                stream,
                &self.encryption_info,
                &mut unencrypted_streams,
                &mut encrypted_streams,
            );
        }
        if let Some(cache) = &mut self.stripe_cache_writer {
            cache.add_index_streams(&index_streams, index_length);
        }

        // Data streams, reordered for read locality.
        let mut data_streams: Vec<StreamDataOutput> = Vec::new();
        for writer in &mut self.column_writers {
            data_streams.extend(writer.data_streams()?);
        }
        let data_length: u64 = data_streams.iter().map(StreamDataOutput::size).sum();

        let mut column_encodings: BTreeMap<u32, ColumnEncoding> = BTreeMap::new();
        column_encodings.insert(0, ColumnEncoding::DIRECT);
        for writer in &self.column_writers {
            column_encodings.extend(writer.column_encodings());
        }

        self.stream_layout
            .reorder(&mut data_streams, &self.node_to_column);
        self.stream_sizes
            .collect_stream_sizes(index_streams.iter().chain(data_streams.iter()));

        for stream in &data_streams {
            bucket_stream(
                stream,
                &self.encryption_info,
                &mut unencrypted_streams,
                &mut encrypted_streams,
            );
        }
        drop(bucket_stream);

        // Per-node stripe statistics, with the synthetic node-0 entry.
        let mut column_statistics: BTreeMap<u32, ColumnStatistics> = BTreeMap::new();
        for writer in &self.column_writers {
            column_statistics.extend(writer.column_stripe_statistics());
        }
        column_statistics.insert(
            0,
            ColumnStatistics::row_count(self.stripe_row_count, self.stripe_raw_size),
        );

        let (unencrypted_encodings, encrypted_encodings): (Vec<_>, Vec<_>) = column_encodings
            .into_iter()
            .partition(|(node, _)| self.encryption_info.group_by_node(*node).is_none());

        let mut encrypted_groups = Vec::with_capacity(self.encryption_info.group_count());
        for group in 0..self.encryption_info.group_count() as u32 {
            let streams = encrypted_streams.remove(&group).ok_or_else(
                || dwrf_err!(InvalidEncryption: "encryption group {} produced no streams", group),
            )?;
            let group_encodings: BTreeMap<u32, ColumnEncoding> = encrypted_encodings
                .iter()
                .filter(|(node, _)| self.encryption_info.group_by_node(*node) == Some(group))
                .map(|&(node, encoding)| (node, encoding))
                .collect();
            let encryptor = self.encryption_info.encryptor(group)?;
            encrypted_groups.push(self.metadata_writer.write_stripe_encryption_group(
                &StripeEncryptionGroup {
                    streams,
                    column_encodings: group_encodings,
                },
                encryptor,
            )?);
        }

        let stripe_footer = StripeFooter {
            streams: unencrypted_streams,
            column_encodings: unencrypted_encodings.into_iter().collect(),
            encrypted_groups,
        };
        let footer_slice = self.metadata_writer.write_stripe_footer(&stripe_footer)?;
        if let Some(cache) = &mut self.stripe_cache_writer {
            cache.add_stripe_footer(&footer_slice);
        }

        let statistics = StripeStatistics {
            column_statistics: to_dense_list(column_statistics, self.types.len())?,
        };
        if let Some(validation) = &mut self.validation {
            validation.add_stripe_statistics(stripe_start, &statistics);
            validation.add_stripe(self.stripe_row_count);
        }

        let information = StripeInformation {
            number_of_rows: self.stripe_row_count,
            offset: stripe_start,
            index_length,
            data_length,
            footer_length: footer_slice.len() as u64,
            raw_size: self.stripe_raw_size,
            encrypted_key_metadatas: self.encryption_info.encrypted_key_metadatas(),
        };
        debug!(
            "flushed stripe at {} with {} rows ({})",
            information.offset,
            information.number_of_rows,
            reason.as_str()
        );
        self.stats.record_stripe_written(reason, &information);
        self.closed_stripes.push(ClosedStripe {
            information,
            statistics,
        });

        let mut outputs = Vec::with_capacity(index_streams.len() + data_streams.len() + 1);
        outputs.extend(index_streams.into_iter().map(StreamDataOutput::into_data_output));
        outputs.extend(data_streams.into_iter().map(StreamDataOutput::into_data_output));
        outputs.push(DataOutput::from_bytes(footer_slice));
        Ok(outputs)
    }

    /// Assemble the metadata section, stripe cache, footer, and postscript.
    fn buffer_file_footer(&mut self) -> DwrfResult<Vec<DataOutput>> {
        let mut outputs = Vec::new();

        let metadata = Metadata {
            stripe_statistics: self
                .closed_stripes
                .iter()
                .map(|s| s.statistics.clone())
                .collect(),
        };
        let metadata_slice = self.metadata_writer.write_metadata(&metadata)?;
        let metadata_length = metadata_slice.len() as u64;
        outputs.push(DataOutput::from_bytes(metadata_slice));

        self.number_of_rows = self
            .closed_stripes
            .iter()
            .map(|s| s.information.number_of_rows)
            .sum();

        let file_statistics = self.to_file_stats()?;
        if let Some(validation) = &mut self.validation {
            validation.set_file_statistics(file_statistics.clone());
        }

        let (unencrypted_statistics, mut encrypted_statistics) =
            self.split_statistics(&file_statistics)?;
        self.unencrypted_file_statistics = unencrypted_statistics.clone();

        let encryption = match &self.encryption_config {
            Some(config) => {
                let mut groups = Vec::with_capacity(config.groups.len());
                for (group_id, group) in config.groups.iter().enumerate() {
                    let mut stats_by_node = encrypted_statistics
                        .remove(&(group_id as u32))
                        .unwrap_or_default();
                    let statistics = if file_statistics.is_empty() {
                        Vec::new()
                    } else {
                        group
                            .nodes
                            .iter()
                            .map(|node| {
                                stats_by_node.remove(node).ok_or_else(|| {
                                    dwrf_err!(
                                        InvalidEncryption: "no encrypted statistics for node {}",
                                        node
                                    )
                                })
                            })
                            .try_collect()?
                    };
                    groups.push(EncryptionGroup {
                        nodes: group.nodes.clone(),
                        // Readers take the key metadata from each stripe.
                        key_metadata: None,
                        statistics,
                    });
                }
                Some(DwrfEncryption {
                    key_provider: config.key_provider,
                    groups,
                })
            }
            None => None,
        };

        let cache_data = self.stripe_cache_writer.as_ref().map(|w| w.cache_data());
        let cache_slice = self
            .metadata_writer
            .write_stripe_cache(cache_data.as_ref());
        let stripe_cache_offsets = self.stripe_cache_writer.as_ref().map(|w| w.offsets());
        outputs.push(DataOutput::from_bytes(cache_slice));

        let footer = Footer {
            number_of_rows: self.number_of_rows,
            row_group_max_row_count: self.options.row_group_max_row_count,
            raw_size: self.raw_size,
            stripes: self
                .closed_stripes
                .iter()
                .map(|s| s.information.clone())
                .collect(),
            types: self.types.clone(),
            statistics: unencrypted_statistics,
            user_metadata: self.user_metadata.clone(),
            encryption,
            stripe_cache_offsets: stripe_cache_offsets.clone(),
        };
        self.closed_stripes.clear();

        let footer_slice = self.metadata_writer.write_footer(&footer)?;
        let footer_length = footer_slice.len() as u64;
        outputs.push(DataOutput::from_bytes(footer_slice));

        if let Some(validation) = &mut self.validation {
            validation.set_version(env!("CARGO_PKG_VERSION").to_string());
        }

        let postscript = PostScript {
            footer_length,
            metadata_length,
            compression: self.options.compression_kind,
            compression_block_size: self.options.max_compression_buffer_size as u64,
            writer_version: env!("CARGO_PKG_VERSION").to_string(),
            cache_mode: cache_data
                .as_ref()
                .map(|c| c.mode)
                .unwrap_or_default(),
            cache_size: cache_data.as_ref().map(|c| c.data.len() as u32),
        };
        let postscript_slice = self.metadata_writer.write_postscript(&postscript)?;
        let postscript_length = postscript_slice.len() as u8;
        outputs.push(DataOutput::from_bytes(postscript_slice));
        outputs.push(DataOutput::from(vec![postscript_length]));
        Ok(outputs)
    }

    /// Merge each node's statistics across all closed stripes and attach
    /// the node's physical storage size.
    fn to_file_stats(&self) -> DwrfResult<Vec<ColumnStatistics>> {
        if self.closed_stripes.is_empty() {
            return Ok(Vec::new());
        }
        let column_count = self.closed_stripes[0].statistics.column_statistics.len();
        for stripe in &self.closed_stripes {
            if stripe.statistics.column_statistics.len() != column_count {
                dwrf_bail!(
                    "stripe reported {} column statistics, expected {}",
                    stripe.statistics.column_statistics.len(),
                    column_count
                );
            }
        }

        Ok((0..column_count)
            .map(|node| {
                let per_stripe: Vec<ColumnStatistics> = self
                    .closed_stripes
                    .iter()
                    .map(|s| s.statistics.column_statistics[node].clone())
                    .collect();
                merge_column_statistics(&per_stripe, Some(self.stream_sizes.node_size(node)), None)
            })
            .collect())
    }

    /// Split the file statistics into the unencrypted footer list (full
    /// entries for plain nodes, stripped entries for encrypted ones) and
    /// per-group encrypted blobs keyed by subtree root.
    fn split_statistics(
        &self,
        all: &[ColumnStatistics],
    ) -> DwrfResult<(Vec<ColumnStatistics>, BTreeMap<u32, BTreeMap<u32, Bytes>>)> {
        let mut unencrypted = Vec::new();
        let mut encrypted: BTreeMap<u32, BTreeMap<u32, Bytes>> = BTreeMap::new();
        if !all.is_empty() {
            self.walk_statistics(all, 0, &mut unencrypted, &mut encrypted)?;
        }
        Ok((unencrypted, encrypted))
    }

    fn walk_statistics(
        &self,
        all: &[ColumnStatistics],
        node: u32,
        unencrypted: &mut Vec<ColumnStatistics>,
        encrypted: &mut BTreeMap<u32, BTreeMap<u32, Bytes>>,
    ) -> DwrfResult<()> {
        match self.encryption_info.group_by_node(node) {
            Some(group) => {
                // This node is a subtree root of its group: accumulate the
                // full statistics of the subtree and seal them encrypted.
                let mut subtree = Vec::new();
                self.walk_group_subtree(all, node, &mut subtree, unencrypted);
                let encryptor = self.encryption_info.encryptor(group)?;
                let blob = self
                    .metadata_writer
                    .write_encrypted_file_statistics(&subtree, encryptor)?;
                encrypted.entry(group).or_default().insert(node, blob);
            }
            None => {
                unencrypted.push(all[node as usize].clone());
                for &child in self.types[node as usize].field_type_indexes() {
                    self.walk_statistics(all, child, unencrypted, encrypted)?;
                }
            }
        }
        Ok(())
    }

    fn walk_group_subtree(
        &self,
        all: &[ColumnStatistics],
        node: u32,
        subtree: &mut Vec<ColumnStatistics>,
        unencrypted: &mut Vec<ColumnStatistics>,
    ) {
        let statistics = &all[node as usize];
        unencrypted.push(statistics.stripped());
        subtree.push(statistics.clone());
        for &child in self.types[node as usize].field_type_indexes() {
            self.walk_group_subtree(all, child, subtree, unencrypted);
        }
    }

    /// Flush the final stripe, write the footer and postscript, and close
    /// the sink. Idempotent.
    pub fn close(&mut self) -> DwrfResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.flush_stripe(FlushReason::Closed)?;
        self.sink.close()
    }

    /// The file's row count; available once the file is closed.
    pub fn file_row_count(&self) -> DwrfResult<u64> {
        if !self.closed {
            dwrf_bail!("file row count is not available until the writing has finished");
        }
        Ok(self.number_of_rows)
    }

    /// The unencrypted file statistics; available once the file is closed.
    pub fn file_statistics(&self) -> DwrfResult<&[ColumnStatistics]> {
        if !self.closed {
            dwrf_bail!("file statistics are not available until the writing has finished");
        }
        Ok(&self.unencrypted_file_statistics)
    }

    /// Read the produced file back and check it against the recorded
    /// expectations. Only permitted when validation was enabled at
    /// construction.
    pub fn validate(&self, file: &[u8]) -> DwrfResult<()> {
        let Some(validation) = &self.validation else {
            dwrf_bail!("validation is not enabled");
        };
        let decryption = match (&self.encryption_config, &self.options.encryption_library) {
            (Some(config), Some(library)) => Some(ReadDecryption {
                library: library.clone(),
                intermediate_keys: config
                    .groups
                    .iter()
                    .map(|g| g.intermediate_key_metadata.clone())
                    .collect(),
            }),
            _ => None,
        };
        validation.build().validate(file, decryption.as_ref())
    }

    /// The file encoding this writer emits.
    pub fn encoding(&self) -> FileEncoding {
        self.encoding
    }
}
