//! The variable-width string column writer.

use std::collections::HashMap;

use dwrf_error::{dwrf_bail, DwrfResult};

use crate::column::values::{ByteStream, LongStream, PresentStream};
use crate::column::{build_row_index_stream, row_index_entry, stream_output, ColumnWriter};
use crate::dictionary::DictionaryColumn;
use crate::encryption::DataEncryptor;
use crate::metadata::{
    merge_row_groups, ColumnEncoding, ColumnStatistics, StringStatisticsBuilder,
};
use crate::options::ColumnWriterOptions;
use crate::page::{Block, NULL_SIZE};
use crate::stream::{StreamDataOutput, StreamKind};

/// Rough per-entry overhead of the dictionary hash index.
const DICTIONARY_ENTRY_OVERHEAD: u64 = 48;

/// Writes a `VARCHAR` column. Dictionary-encoded by default; the optimizer
/// may convert it to direct encoding mid-stripe when the dictionary stops
/// paying for itself.
pub struct StringColumnWriter {
    node: u32,
    options: ColumnWriterOptions,
    encryptor: Option<DataEncryptor>,
    encoding: StringEncoding,
    stats: StringStatisticsBuilder,
    row_group_stats: Vec<ColumnStatistics>,
    closed: bool,
    dictionary_enabled: bool,
    preserve_direct_stripes: u32,
}

enum StringEncoding {
    Direct(DirectState),
    Dictionary(DictionaryState),
}

struct DirectState {
    present: PresentStream,
    data: ByteStream,
    lengths: LongStream,
    /// Per row group: (present, data, length) positions at group start.
    group_positions: Vec<(Vec<u64>, Vec<u64>, Vec<u64>)>,
    sealed: Option<Vec<StreamDataOutput>>,
}

struct DictionaryState {
    dictionary: Vec<String>,
    index: HashMap<String, u32>,
    entry_bytes: u64,
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

impl StringColumnWriter {
    pub fn new(
        node: u32,
        options: &ColumnWriterOptions,
        encryptor: Option<DataEncryptor>,
    ) -> Self {
        let dictionary_enabled = options.string_dictionary_encoding_enabled;
        let encoding = if dictionary_enabled {
            StringEncoding::Dictionary(DictionaryState::new())
        } else {
            StringEncoding::Direct(DirectState::new(options, encryptor.clone()))
        };
        Self {
            node,
            options: options.clone(),
            encryptor,
            encoding,
            stats: StringStatisticsBuilder::new(options.string_statistics_limit),
            row_group_stats: Vec::new(),
            closed: false,
            dictionary_enabled,
            preserve_direct_stripes: 0,
        }
    }

    fn convert_to_direct_impl(&mut self) -> DwrfResult<()> {
        let StringEncoding::Dictionary(dictionary) = &mut self.encoding else {
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
                let value = &dictionary.dictionary[dictionary.codes[code_index] as usize];
                direct.data.write(value.as_bytes())?;
                direct.lengths.write_unsigned(value.len() as u64)?;
                code_index += 1;
            }
        }
        if boundaries.next().is_some() {
            direct.record_group_start();
        }

        self.preserve_direct_stripes = self.options.preserve_direct_encoding_stripe_count;
        self.encoding = StringEncoding::Direct(direct);
        Ok(())
    }
}

impl DirectState {
    fn new(options: &ColumnWriterOptions, encryptor: Option<DataEncryptor>) -> Self {
        Self {
            present: PresentStream::new(options, encryptor.clone()),
            data: ByteStream::new(options, encryptor.clone()),
            lengths: LongStream::new(options, encryptor),
            group_positions: Vec::new(),
            sealed: None,
        }
    }

    fn record_group_start(&mut self) {
        self.group_positions.push((
            self.present.positions(),
            self.data.positions(),
            self.lengths.positions(),
        ));
    }
}

impl DictionaryState {
    fn new() -> Self {
        Self {
            dictionary: Vec::new(),
            index: HashMap::new(),
            entry_bytes: 0,
            presents: Vec::new(),
            codes: Vec::new(),
            group_boundaries: Vec::new(),
            logical_bytes: 0,
            sealed: None,
        }
    }

    fn encoded_size_estimate(&self) -> u64 {
        // Codes average about two varint bytes; the dictionary pays its
        // value bytes plus a varint length each.
        self.codes.len() as u64 * 2
            + self.entry_bytes
            + self.dictionary.len() as u64 * 2
            + self.presents.len() as u64 / 8
    }

    /// The permutation applied to the dictionary when sorting is enabled:
    /// `remap[old_code] = new_code`.
    fn sorted_remap(&self) -> Vec<u32> {
        let mut order: Vec<u32> = (0..self.dictionary.len() as u32).collect();
        order.sort_by(|&a, &b| self.dictionary[a as usize].cmp(&self.dictionary[b as usize]));
        let mut remap = vec![0u32; order.len()];
        for (new_code, &old_code) in order.iter().enumerate() {
            remap[old_code as usize] = new_code as u32;
        }
        remap
    }
}

impl ColumnWriter for StringColumnWriter {
    fn begin_row_group(&mut self) {
        match &mut self.encoding {
            StringEncoding::Direct(direct) => direct.record_group_start(),
            StringEncoding::Dictionary(dictionary) => {
                dictionary
                    .group_boundaries
                    .push((dictionary.presents.len(), dictionary.codes.len()));
            }
        }
    }

    fn write_block(&mut self, block: &Block) -> DwrfResult<u64> {
        let Block::Varchar(values) = block else {
            dwrf_bail!(InvalidArgument: "expected a varchar block for node {}", self.node);
        };
        let mut raw_size = 0;
        match &mut self.encoding {
            StringEncoding::Direct(direct) => {
                for value in values.iter() {
                    direct.present.write(value.is_some())?;
                    match value {
                        Some(v) => {
                            direct.data.write(v.as_bytes())?;
                            direct.lengths.write_unsigned(v.len() as u64)?;
                            self.stats.add_value(v);
                            raw_size += v.len() as u64;
                        }
                        None => raw_size += NULL_SIZE,
                    }
                }
            }
            StringEncoding::Dictionary(dictionary) => {
                for value in values.iter() {
                    dictionary.presents.push(value.is_some());
                    match value {
                        Some(v) => {
                            let code = match dictionary.index.get(v) {
                                Some(&code) => code,
                                None => {
                                    let code = dictionary.dictionary.len() as u32;
                                    dictionary.index.insert(v.to_string(), code);
                                    dictionary.dictionary.push(v.to_string());
                                    dictionary.entry_bytes += v.len() as u64;
                                    code
                                }
                            };
                            dictionary.codes.push(code);
                            dictionary.logical_bytes += v.len() as u64;
                            self.stats.add_value(v);
                            raw_size += v.len() as u64;
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
            StringEncoding::Direct(direct) => {
                let mut streams = Vec::with_capacity(3);
                if let Some(chunks) = direct.present.finish()? {
                    streams.push(stream_output(self.node, StreamKind::Present, chunks));
                }
                streams.push(stream_output(
                    self.node,
                    StreamKind::Data,
                    direct.data.finish()?,
                ));
                streams.push(stream_output(
                    self.node,
                    StreamKind::Length,
                    direct.lengths.finish()?,
                ));
                direct.sealed = Some(streams);
            }
            StringEncoding::Dictionary(dictionary) => {
                let remap = if self.options.string_dictionary_sorting_enabled {
                    Some(dictionary.sorted_remap())
                } else {
                    None
                };

                let mut present = PresentStream::new(&self.options, self.encryptor.clone());
                let mut codes = LongStream::new(&self.options, self.encryptor.clone());
                let mut values = ByteStream::new(&self.options, self.encryptor.clone());
                let mut lengths = LongStream::new(&self.options, self.encryptor.clone());

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
                        let code = dictionary.codes[code_index];
                        let code = remap.as_ref().map_or(code, |r| r[code as usize]);
                        codes.write_unsigned(code as u64)?;
                        code_index += 1;
                    }
                }
                if boundaries.next().is_some() {
                    group_positions.push((present.positions(), codes.positions()));
                }

                // Dictionary values, in code order (sorted order when the
                // remap is present).
                match &remap {
                    Some(remap) => {
                        let mut sorted: Vec<&str> =
                            vec![""; dictionary.dictionary.len()];
                        for (old_code, value) in dictionary.dictionary.iter().enumerate() {
                            sorted[remap[old_code] as usize] = value.as_str();
                        }
                        for value in sorted {
                            values.write(value.as_bytes())?;
                            lengths.write_unsigned(value.len() as u64)?;
                        }
                    }
                    None => {
                        for value in &dictionary.dictionary {
                            values.write(value.as_bytes())?;
                            lengths.write_unsigned(value.len() as u64)?;
                        }
                    }
                }

                let present_chunks = present.finish()?;
                let mut streams = Vec::with_capacity(4);
                if let Some(chunks) = &present_chunks {
                    streams.push(stream_output(self.node, StreamKind::Present, chunks.clone()));
                }
                streams.push(stream_output(self.node, StreamKind::Data, codes.finish()?));
                streams.push(stream_output(
                    self.node,
                    StreamKind::DictionaryData,
                    values.finish()?,
                ));
                streams.push(stream_output(
                    self.node,
                    StreamKind::Length,
                    lengths.finish()?,
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
        self.stats = StringStatisticsBuilder::new(self.options.string_statistics_limit);
        self.row_group_stats.clear();
        let back_to_dictionary = self.dictionary_enabled
            && match &self.encoding {
                StringEncoding::Dictionary(_) => true,
                StringEncoding::Direct(_) => {
                    if self.preserve_direct_stripes > 0 {
                        self.preserve_direct_stripes -= 1;
                        false
                    } else {
                        true
                    }
                }
            };
        if back_to_dictionary {
            self.encoding = StringEncoding::Dictionary(DictionaryState::new());
        } else {
            self.encoding = StringEncoding::Direct(DirectState::new(
                &self.options,
                self.encryptor.clone(),
            ));
        }
    }

    fn buffered_bytes(&self) -> u64 {
        match &self.encoding {
            StringEncoding::Direct(direct) => match &direct.sealed {
                Some(streams) => streams.iter().map(StreamDataOutput::size).sum(),
                None => {
                    direct.present.buffered_bytes()
                        + direct.data.buffered_bytes()
                        + direct.lengths.buffered_bytes()
                }
            },
            StringEncoding::Dictionary(dictionary) => match &dictionary.sealed {
                Some(sealed) => sealed.streams.iter().map(StreamDataOutput::size).sum(),
                None => dictionary.encoded_size_estimate(),
            },
        }
    }

    fn retained_bytes(&self) -> u64 {
        match &self.encoding {
            StringEncoding::Direct(direct) => {
                direct.present.retained_bytes()
                    + direct.data.retained_bytes()
                    + direct.lengths.retained_bytes()
            }
            StringEncoding::Dictionary(dictionary) => {
                dictionary.entry_bytes
                    + dictionary.dictionary.capacity() as u64 * 24
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
            StringEncoding::Direct(direct) => {
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
                    .map(|(stats, (present_pos, data_pos, length_pos))| {
                        let mut positions = Vec::new();
                        if has_present {
                            positions.extend_from_slice(present_pos);
                        }
                        positions.extend_from_slice(data_pos);
                        positions.extend_from_slice(length_pos);
                        row_index_entry(positions, stats)
                    })
                    .collect()
            }
            StringEncoding::Dictionary(dictionary) => {
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
            StringEncoding::Direct(direct) => Ok(direct.sealed.take().unwrap_or_default()),
            StringEncoding::Dictionary(dictionary) => Ok(dictionary
                .sealed
                .as_mut()
                .map(|sealed| std::mem::take(&mut sealed.streams))
                .unwrap_or_default()),
        }
    }

    fn column_encodings(&self) -> Vec<(u32, ColumnEncoding)> {
        let encoding = match &self.encoding {
            StringEncoding::Direct(_) => ColumnEncoding::DIRECT,
            StringEncoding::Dictionary(dictionary) => {
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

impl DictionaryColumn for StringColumnWriter {
    fn dictionary_memory_bytes(&self) -> u64 {
        match &self.encoding {
            StringEncoding::Direct(_) => 0,
            StringEncoding::Dictionary(dictionary) => {
                let entries = dictionary.entry_bytes
                    + dictionary.dictionary.len() as u64 * DICTIONARY_ENTRY_OVERHEAD;
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
            StringEncoding::Direct(_) => 1.0,
            StringEncoding::Dictionary(dictionary) => {
                dictionary.logical_bytes as f64 / dictionary.encoded_size_estimate().max(1) as f64
            }
        }
    }

    fn convert_to_direct(&mut self) -> DwrfResult<()> {
        self.convert_to_direct_impl()
    }

    fn is_direct_encoded(&self) -> bool {
        matches!(self.encoding, StringEncoding::Direct(_))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::compression::{CompressionBufferPool, CompressionKind};
    use crate::metadata::TypedStatistics;
    use crate::options::WriterOptions;
    use crate::page::VarcharBlock;

    fn options(dictionary: bool, sorting: bool) -> ColumnWriterOptions {
        ColumnWriterOptions::from_writer_options(
            &WriterOptions::default()
                .with_compression(CompressionKind::None)
                .with_string_dictionary_encoding(dictionary)
                .with_string_dictionary_sorting(sorting),
            Default::default(),
            Arc::new(CompressionBufferPool::default()),
        )
    }

    fn block(values: &[&str]) -> Block {
        VarcharBlock::from_values(values.iter().map(|s| s.to_string()).collect()).into()
    }

    fn write_group(writer: &mut StringColumnWriter, values: &[&str]) {
        writer.begin_row_group();
        writer.write_block(&block(values)).unwrap();
        writer.finish_row_group().unwrap();
    }

    #[test]
    fn dictionary_deduplicates_values() {
        let mut writer = StringColumnWriter::new(2, &options(true, false), None);
        write_group(&mut writer, &["b", "a", "b", "a", "b"]);
        writer.close().unwrap();
        assert_eq!(
            writer.column_encodings(),
            vec![(2, ColumnEncoding::dictionary(2))]
        );
        let streams = writer.data_streams().unwrap();
        let kinds: Vec<StreamKind> = streams.iter().map(|s| s.stream().kind()).collect();
        assert_eq!(
            kinds,
            vec![
                StreamKind::Data,
                StreamKind::DictionaryData,
                StreamKind::Length
            ]
        );
        // Unsorted: first-seen order is "b", "a".
        let dictionary_data = &streams[1];
        assert_eq!(dictionary_data.data()[0].as_ref(), b"ba");
    }

    #[test]
    fn sorted_dictionary_reorders_values_and_codes() {
        let mut writer = StringColumnWriter::new(2, &options(true, true), None);
        write_group(&mut writer, &["b", "a", "b"]);
        writer.close().unwrap();
        let streams = writer.data_streams().unwrap();
        // Sorted dictionary is "a", "b"; codes remap to 1, 0, 1.
        assert_eq!(streams[0].data()[0].as_ref(), &[1, 0, 1]);
        assert_eq!(streams[1].data()[0].as_ref(), b"ab");
    }

    #[test]
    fn direct_mode_streams_values_through() {
        let mut writer = StringColumnWriter::new(2, &options(false, false), None);
        write_group(&mut writer, &["hi", "there"]);
        writer.close().unwrap();
        let streams = writer.data_streams().unwrap();
        let kinds: Vec<StreamKind> = streams.iter().map(|s| s.stream().kind()).collect();
        assert_eq!(kinds, vec![StreamKind::Data, StreamKind::Length]);
        assert_eq!(streams[0].data()[0].as_ref(), b"hithere");
    }

    #[test]
    fn ignoring_row_group_sizes_excludes_codes_from_memory() {
        let counting = options(true, false);
        let mut ignoring = counting.clone();
        ignoring.ignore_dictionary_row_group_sizes = true;

        let values: Vec<&str> = vec!["a", "b", "a", "b", "a"];
        let mut with_codes = StringColumnWriter::new(2, &counting, None);
        let mut without_codes = StringColumnWriter::new(2, &ignoring, None);
        for writer in [&mut with_codes, &mut without_codes] {
            writer.begin_row_group();
            writer.write_block(&block(&values)).unwrap();
            writer.finish_row_group().unwrap();
        }

        // The buffered codes (4 bytes per row) are excluded when
        // row-group sizes are ignored.
        assert_eq!(
            with_codes.dictionary_memory_bytes(),
            without_codes.dictionary_memory_bytes() + values.len() as u64 * 4
        );
    }

    #[test]
    fn conversion_replays_buffered_values() {
        let mut writer = StringColumnWriter::new(2, &options(true, true), None);
        write_group(&mut writer, &["x", "y", "x"]);
        DictionaryColumn::convert_to_direct(&mut writer).unwrap();
        writer.begin_row_group();
        writer.write_block(&block(&["z"])).unwrap();
        writer.finish_row_group().unwrap();
        writer.close().unwrap();

        let streams = writer.data_streams().unwrap();
        assert_eq!(streams[0].data()[0].as_ref(), b"xyxz");
        let stats = writer.column_stripe_statistics();
        let TypedStatistics::String(s) = &stats[0].1.typed else {
            panic!("expected string stats");
        };
        assert_eq!(s.minimum.as_deref(), Some("x"));
        assert_eq!(s.maximum.as_deref(), Some("z"));
        assert_eq!(s.sum, 4);
    }
}
