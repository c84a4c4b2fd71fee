//! The 64-bit integer column writer.

use std::collections::HashMap;

use dwrf_error::{dwrf_bail, DwrfResult};

use crate::column::values::{LongStream, PresentStream};
use crate::column::{build_row_index_stream, row_index_entry, stream_output, ColumnWriter};
use crate::dictionary::DictionaryColumn;
use crate::encryption::DataEncryptor;
use crate::metadata::{
    merge_row_groups, ColumnEncoding, ColumnStatistics, LongStatisticsBuilder,
};
use crate::options::ColumnWriterOptions;
use crate::page::{Block, LONG_SIZE, NULL_SIZE};
use crate::stream::{StreamDataOutput, StreamKind};

/// Rough per-entry overhead of the dictionary hash index.
const DICTIONARY_ENTRY_OVERHEAD: u64 = 32;

/// Writes a `BIGINT` column. Starts dictionary-encoded when integer
/// dictionaries are enabled and may be converted to direct encoding by the
/// optimizer mid-stripe.
pub struct LongColumnWriter {
    node: u32,
    options: ColumnWriterOptions,
    encryptor: Option<DataEncryptor>,
    encoding: LongEncoding,
    stats: LongStatisticsBuilder,
    row_group_stats: Vec<ColumnStatistics>,
    closed: bool,
    dictionary_enabled: bool,
    preserve_direct_stripes: u32,
}

enum LongEncoding {
    Direct(DirectState),
    Dictionary(DictionaryState),
}

struct DirectState {
    present: PresentStream,
    data: LongStream,
    /// Per row group: (present positions, data positions) at group start.
    group_positions: Vec<(Vec<u64>, Vec<u64>)>,
    /// Set once the stripe's streams have been sealed by `close`.
    sealed: Option<Vec<StreamDataOutput>>,
}

struct DictionaryState {
    dictionary: Vec<i64>,
    index: HashMap<i64, u32>,
    presents: Vec<bool>,
    /// One code per non-null row, in row order.
    codes: Vec<u32>,
    /// (row count, non-null count) at each group start.
    group_boundaries: Vec<(usize, usize)>,
    logical_bytes: u64,
    sealed: Option<SealedDictionary>,
}

struct SealedDictionary {
    streams: Vec<StreamDataOutput>,
    group_positions: Vec<Vec<u64>>,
    dictionary_size: u32,
}

impl LongColumnWriter {
    pub fn new(
        node: u32,
        options: &ColumnWriterOptions,
        encryptor: Option<DataEncryptor>,
    ) -> Self {
        let dictionary_enabled = options.integer_dictionary_encoding_enabled;
        let encoding = if dictionary_enabled {
            LongEncoding::Dictionary(DictionaryState::new())
        } else {
            LongEncoding::Direct(DirectState::new(options, encryptor.clone()))
        };
        Self {
            node,
            options: options.clone(),
            encryptor,
            encoding,
            stats: LongStatisticsBuilder::default(),
            row_group_stats: Vec::new(),
            closed: false,
            dictionary_enabled,
            preserve_direct_stripes: 0,
        }
    }

    fn convert_to_direct_impl(&mut self) -> DwrfResult<()> {
        let LongEncoding::Dictionary(dictionary) = &mut self.encoding else {
            return Ok(());
        };
        if dictionary.sealed.is_some() {
            dwrf_bail!("cannot convert a sealed dictionary column");
        }

        let mut direct = DirectState::new(&self.options, self.encryptor.clone());
        let mut boundaries = dictionary.group_boundaries.iter().peekable();
        let mut code_index = 0usize;
        for (row, &present) in dictionary.presents.iter().enumerate() {
            if boundaries.peek().is_some_and(|&&(rows, _)| rows == row) {
                boundaries.next();
                direct.record_group_start();
            }
            direct.present.write(present)?;
            if present {
                direct
                    .data
                    .write_signed(dictionary.dictionary[dictionary.codes[code_index] as usize])?;
                code_index += 1;
            }
        }
        // A boundary recorded at the current row count belongs to a group
        // that has not received rows yet.
        if boundaries.next().is_some() {
            direct.record_group_start();
        }

        self.preserve_direct_stripes = self.options.preserve_direct_encoding_stripe_count;
        self.encoding = LongEncoding::Direct(direct);
        Ok(())
    }
}

impl DirectState {
    fn new(options: &ColumnWriterOptions, encryptor: Option<DataEncryptor>) -> Self {
        Self {
            present: PresentStream::new(options, encryptor.clone()),
            data: LongStream::new(options, encryptor),
            group_positions: Vec::new(),
            sealed: None,
        }
    }

    fn record_group_start(&mut self) {
        self.group_positions
            .push((self.present.positions(), self.data.positions()));
    }
}

impl DictionaryState {
    fn new() -> Self {
        Self {
            dictionary: Vec::new(),
            index: HashMap::new(),
            presents: Vec::new(),
            codes: Vec::new(),
            group_boundaries: Vec::new(),
            logical_bytes: 0,
            sealed: None,
        }
    }

    fn encoded_size_estimate(&self) -> u64 {
        // Codes average about two varint bytes, dictionary entries five.
        self.codes.len() as u64 * 2
            + self.dictionary.len() as u64 * 5
            + self.presents.len() as u64 / 8
    }
}

impl ColumnWriter for LongColumnWriter {
    fn begin_row_group(&mut self) {
        match &mut self.encoding {
            LongEncoding::Direct(direct) => direct.record_group_start(),
            LongEncoding::Dictionary(dictionary) => {
                dictionary
                    .group_boundaries
                    .push((dictionary.presents.len(), dictionary.codes.len()));
            }
        }
    }

    fn write_block(&mut self, block: &Block) -> DwrfResult<u64> {
        let Block::Bigint(values) = block else {
            dwrf_bail!(InvalidArgument: "expected a bigint block for node {}", self.node);
        };
        let mut raw_size = 0;
        match &mut self.encoding {
            LongEncoding::Direct(direct) => {
                for value in values.iter() {
                    direct.present.write(value.is_some())?;
                    match value {
                        Some(v) => {
                            direct.data.write_signed(v)?;
                            self.stats.add_value(v);
                            raw_size += LONG_SIZE;
                        }
                        None => raw_size += NULL_SIZE,
                    }
                }
            }
            LongEncoding::Dictionary(dictionary) => {
                for value in values.iter() {
                    dictionary.presents.push(value.is_some());
                    match value {
                        Some(v) => {
                            let next_code = dictionary.dictionary.len() as u32;
                            let code = *dictionary.index.entry(v).or_insert(next_code);
                            if code == next_code {
                                dictionary.dictionary.push(v);
                            }
                            dictionary.codes.push(code);
                            dictionary.logical_bytes += LONG_SIZE;
                            self.stats.add_value(v);
                            raw_size += LONG_SIZE;
                        }
                        None => raw_size += NULL_SIZE,
                    }
                }
            }
        }
        Ok(raw_size)
    }

    fn finish_row_group(&mut self) -> DwrfResult<Vec<(u32, ColumnStatistics)>> {
        let stats = self.stats.build_and_reset();
        self.row_group_stats.push(stats.clone());
        Ok(vec![(self.node, stats)])
    }

    fn close(&mut self) -> DwrfResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        match &mut self.encoding {
            LongEncoding::Direct(direct) => {
                let mut streams = Vec::with_capacity(2);
                if let Some(chunks) = direct.present.finish()? {
                    streams.push(stream_output(self.node, StreamKind::Present, chunks));
                }
                streams.push(stream_output(
                    self.node,
                    StreamKind::Data,
                    direct.data.finish()?,
                ));
                direct.sealed = Some(streams);
            }
            LongEncoding::Dictionary(dictionary) => {
                let mut present = PresentStream::new(&self.options, self.encryptor.clone());
                let mut codes = LongStream::new(&self.options, self.encryptor.clone());
                let mut values = LongStream::new(&self.options, self.encryptor.clone());

                let mut group_positions = Vec::with_capacity(dictionary.group_boundaries.len());
                let mut boundaries = dictionary.group_boundaries.iter().peekable();
                let mut code_index = 0usize;
                for (row, &is_present) in dictionary.presents.iter().enumerate() {
                    if boundaries.peek().is_some_and(|&&(rows, _)| rows == row) {
                        boundaries.next();
                        group_positions.push((present.positions(), codes.positions()));
                    }
                    present.write(is_present)?;
                    if is_present {
                        codes.write_unsigned(dictionary.codes[code_index] as u64)?;
                        code_index += 1;
                    }
                }
                if boundaries.next().is_some() {
                    group_positions.push((present.positions(), codes.positions()));
                }
                for &value in &dictionary.dictionary {
                    values.write_signed(value)?;
                }

                let present_chunks = present.finish()?;
                let mut streams = Vec::with_capacity(3);
                if let Some(chunks) = &present_chunks {
                    streams.push(stream_output(self.node, StreamKind::Present, chunks.clone()));
                }
                streams.push(stream_output(self.node, StreamKind::Data, codes.finish()?));
                streams.push(stream_output(
                    self.node,
                    StreamKind::DictionaryData,
                    values.finish()?,
                ));

                let positions = group_positions
                    .into_iter()
                    .map(|(present_pos, data_pos)| {
                        let mut entry = Vec::new();
                        if present_chunks.is_some() {
                            entry.extend(present_pos);
                        }
                        entry.extend(data_pos);
                        entry
                    })
                    .collect();
                dictionary.sealed = Some(SealedDictionary {
                    streams,
                    group_positions: positions,
                    dictionary_size: dictionary.dictionary.len() as u32,
                });
            }
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.closed = false;
        self.stats = LongStatisticsBuilder::default();
        self.row_group_stats.clear();
        let back_to_dictionary = self.dictionary_enabled
            && match &self.encoding {
                LongEncoding::Dictionary(_) => true,
                LongEncoding::Direct(_) => {
                    if self.preserve_direct_stripes > 0 {
                        self.preserve_direct_stripes -= 1;
                        false
                    } else {
                        true
                    }
                }
            };
        if back_to_dictionary {
            self.encoding = LongEncoding::Dictionary(DictionaryState::new());
        } else {
            self.encoding = LongEncoding::Direct(DirectState::new(
                &self.options,
                self.encryptor.clone(),
            ));
        }
    }

    fn buffered_bytes(&self) -> u64 {
        match &self.encoding {
            LongEncoding::Direct(direct) => match &direct.sealed {
                Some(streams) => streams.iter().map(StreamDataOutput::size).sum(),
                None => direct.present.buffered_bytes() + direct.data.buffered_bytes(),
            },
            LongEncoding::Dictionary(dictionary) => match &dictionary.sealed {
                Some(sealed) => sealed.streams.iter().map(StreamDataOutput::size).sum(),
                None => dictionary.encoded_size_estimate(),
            },
        }
    }

    fn retained_bytes(&self) -> u64 {
        match &self.encoding {
            LongEncoding::Direct(direct) => {
                direct.present.retained_bytes() + direct.data.retained_bytes()
            }
            LongEncoding::Dictionary(dictionary) => {
                dictionary.dictionary.capacity() as u64 * 8
                    + dictionary.codes.capacity() as u64 * 4
                    + dictionary.presents.capacity() as u64
                    + dictionary.index.capacity() as u64 * DICTIONARY_ENTRY_OVERHEAD
            }
        }
    }

    fn index_streams(&mut self) -> DwrfResult<Vec<StreamDataOutput>> {
        if !self.closed {
            dwrf_bail!("index streams requested before close");
        }
        let entries = match &self.encoding {
            LongEncoding::Direct(direct) => {
                let sealed = direct
                    .sealed
                    .as_ref()
                    .ok_or_else(|| dwrf_error::dwrf_err!("direct streams not sealed"))?;
                let has_present = sealed
                    .iter()
                    .any(|s| s.stream().kind() == StreamKind::Present);
                self.row_group_stats
                    .iter()
                    .zip(&direct.group_positions)
                    .map(|(stats, (present_pos, data_pos))| {
                        let mut positions = Vec::new();
                        if has_present {
                            positions.extend_from_slice(present_pos);
                        }
                        positions.extend_from_slice(data_pos);
                        row_index_entry(positions, stats)
                    })
                    .collect()
            }
            LongEncoding::Dictionary(dictionary) => {
                let sealed = dictionary
                    .sealed
                    .as_ref()
                    .ok_or_else(|| dwrf_error::dwrf_err!("dictionary streams not sealed"))?;
                self.row_group_stats
                    .iter()
                    .zip(&sealed.group_positions)
                    .map(|(stats, positions)| row_index_entry(positions.clone(), stats))
                    .collect()
            }
        };
        Ok(vec![build_row_index_stream(
            self.node,
            entries,
            &self.options,
            self.encryptor.clone(),
        )?])
    }

    fn data_streams(&mut self) -> DwrfResult<Vec<StreamDataOutput>> {
        if !self.closed {
            dwrf_bail!("data streams requested before close");
        }
        match &mut self.encoding {
            LongEncoding::Direct(direct) => Ok(direct.sealed.take().unwrap_or_default()),
            LongEncoding::Dictionary(dictionary) => Ok(dictionary
                .sealed
                .as_mut()
                .map(|sealed| std::mem::take(&mut sealed.streams))
                .unwrap_or_default()),
        }
    }

    fn column_encodings(&self) -> Vec<(u32, ColumnEncoding)> {
        let encoding = match &self.encoding {
            LongEncoding::Direct(_) => ColumnEncoding::DIRECT,
            LongEncoding::Dictionary(dictionary) => {
                let size = dictionary
                    .sealed
                    .as_ref()
                    .map(|s| s.dictionary_size)
                    .unwrap_or(dictionary.dictionary.len() as u32);
                ColumnEncoding::dictionary(size)
            }
        };
        vec![(self.node, encoding)]
    }

    fn column_stripe_statistics(&self) -> Vec<(u32, ColumnStatistics)> {
        vec![(self.node, merge_row_groups(&self.row_group_stats))]
    }

    fn as_dictionary_column(&mut self) -> Option<&mut dyn DictionaryColumn> {
        if self.dictionary_enabled {
            Some(self)
        } else {
            None
        }
    }
}

impl DictionaryColumn for LongColumnWriter {
    fn dictionary_memory_bytes(&self) -> u64 {
        match &self.encoding {
            LongEncoding::Direct(_) => 0,
            LongEncoding::Dictionary(dictionary) => {
                let entries = dictionary.dictionary.len() as u64 * (8 + DICTIONARY_ENTRY_OVERHEAD);
                // The buffered codes grow with the row groups; they are
                // excluded when row-group sizes are configured out of the
                // memory accounting.
                if self.options.ignore_dictionary_row_group_sizes {
                    entries
                } else {
                    entries + dictionary.codes.len() as u64 * 4
                }
            }
        }
    }

    fn buffered_bytes(&self) -> u64 {
        ColumnWriter::buffered_bytes(self)
    }

    fn estimate_compression_ratio(&self) -> f64 {
        match &self.encoding {
            LongEncoding::Direct(_) => 1.0,
            LongEncoding::Dictionary(dictionary) => {
                dictionary.logical_bytes as f64 / dictionary.encoded_size_estimate().max(1) as f64
            }
        }
    }

    fn convert_to_direct(&mut self) -> DwrfResult<()> {
        self.convert_to_direct_impl()
    }

    fn is_direct_encoded(&self) -> bool {
        matches!(self.encoding, LongEncoding::Direct(_))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::compression::{CompressionBufferPool, CompressionKind};
    use crate::metadata::TypedStatistics;
    use crate::options::WriterOptions;
    use crate::page::BigintBlock;

    fn options(integer_dictionary: bool) -> ColumnWriterOptions {
        ColumnWriterOptions::from_writer_options(
            &WriterOptions::default()
                .with_compression(CompressionKind::None)
                .with_integer_dictionary_encoding(integer_dictionary),
            Default::default(),
            Arc::new(CompressionBufferPool::default()),
        )
    }

    fn write_rows(writer: &mut LongColumnWriter, values: Vec<Option<i64>>) {
        writer.begin_row_group();
        writer
            .write_block(&BigintBlock::from_nullable(values).into())
            .unwrap();
        writer.finish_row_group().unwrap();
    }

    #[test]
    fn direct_writer_emits_data_stream_only_without_nulls() {
        let mut writer = LongColumnWriter::new(1, &options(false), None);
        write_rows(&mut writer, vec![Some(1), Some(2), Some(3)]);
        writer.close().unwrap();
        let streams = writer.data_streams().unwrap();
        assert_eq!(streams.len(), 1);
        assert_eq!(streams[0].stream().kind(), StreamKind::Data);
        assert_eq!(
            writer.column_encodings(),
            vec![(1, ColumnEncoding::DIRECT)]
        );
    }

    #[test]
    fn nulls_produce_present_stream() {
        let mut writer = LongColumnWriter::new(1, &options(false), None);
        write_rows(&mut writer, vec![Some(1), None, Some(3)]);
        writer.close().unwrap();
        let streams = writer.data_streams().unwrap();
        let kinds: Vec<StreamKind> = streams.iter().map(|s| s.stream().kind()).collect();
        assert_eq!(kinds, vec![StreamKind::Present, StreamKind::Data]);
    }

    #[test]
    fn dictionary_writer_seals_three_streams() {
        let mut writer = LongColumnWriter::new(1, &options(true), None);
        write_rows(&mut writer, vec![Some(7), Some(7), Some(8), None]);
        writer.close().unwrap();
        let streams = writer.data_streams().unwrap();
        let kinds: Vec<StreamKind> = streams.iter().map(|s| s.stream().kind()).collect();
        assert_eq!(
            kinds,
            vec![
                StreamKind::Present,
                StreamKind::Data,
                StreamKind::DictionaryData
            ]
        );
        assert_eq!(
            writer.column_encodings(),
            vec![(1, ColumnEncoding::dictionary(2))]
        );
    }

    #[test]
    fn conversion_preserves_values_and_groups() {
        let mut writer = LongColumnWriter::new(1, &options(true), None);
        write_rows(&mut writer, vec![Some(5), Some(5), None]);
        writer.begin_row_group();
        writer
            .write_block(&BigintBlock::from_values(vec![6]).into())
            .unwrap();

        DictionaryColumn::convert_to_direct(&mut writer).unwrap();
        assert!(writer.is_direct_encoded());

        writer
            .write_block(&BigintBlock::from_values(vec![9]).into())
            .unwrap();
        writer.finish_row_group().unwrap();
        writer.close().unwrap();

        let stats = writer.column_stripe_statistics();
        let TypedStatistics::Integer(int) = &stats[0].1.typed else {
            panic!("expected integer stats");
        };
        assert_eq!(int.minimum, Some(5));
        assert_eq!(int.maximum, Some(9));

        let index = writer.index_streams().unwrap();
        assert_eq!(index.len(), 1);
        let streams = writer.data_streams().unwrap();
        let kinds: Vec<StreamKind> = streams.iter().map(|s| s.stream().kind()).collect();
        assert_eq!(kinds, vec![StreamKind::Present, StreamKind::Data]);
    }

    #[test]
    fn reset_restores_dictionary_mode() {
        let mut writer = LongColumnWriter::new(1, &options(true), None);
        write_rows(&mut writer, vec![Some(1)]);
        DictionaryColumn::convert_to_direct(&mut writer).unwrap();
        writer.close().unwrap();
        writer.reset();
        assert!(!writer.is_direct_encoded());
    }
}
