//! Dictionary memory management.
//!
//! Dictionary-capable column writers expose a small capability surface;
//! the optimizer walks the column tree for it rather than downcasting.
//! Under memory or efficacy pressure it instructs specific columns to
//! convert to direct encoding mid-stripe, which never changes the
//! reader-visible values.

use dwrf_error::DwrfResult;
use log::debug;

use crate::column::ColumnWriter;

/// A dictionary encoding must project at least this ratio of logical
/// bytes to encoded bytes to be worth keeping.
const MIN_DICTIONARY_COMPRESSION_RATIO: f64 = 1.25;

/// The capability exposed by dictionary-backed column writers.
pub trait DictionaryColumn {
    /// Memory currently held by the dictionary and its buffered codes.
    fn dictionary_memory_bytes(&self) -> u64;

    /// Bytes this column would occupy in the stripe as currently encoded.
    fn buffered_bytes(&self) -> u64;

    /// Projected logical-to-encoded ratio of the dictionary encoding;
    /// higher is better.
    fn estimate_compression_ratio(&self) -> f64;

    /// Abandon the dictionary: replay buffered values into direct streams
    /// and write through directly from now on.
    fn convert_to_direct(&mut self) -> DwrfResult<()>;

    fn is_direct_encoded(&self) -> bool;
}

fn for_each_dictionary_column<F>(writers: &mut [Box<dyn ColumnWriter>], f: &mut F)
where
    F: FnMut(&mut dyn DictionaryColumn),
{
    for writer in writers {
        visit(writer.as_mut(), f);
    }
}

fn visit<F>(writer: &mut dyn ColumnWriter, f: &mut F)
where
    F: FnMut(&mut dyn DictionaryColumn),
{
    if let Some(dictionary) = writer.as_dictionary_column() {
        f(dictionary);
        return;
    }
    for nested in writer.nested_writers() {
        visit(nested, f);
    }
}

/// Monitors aggregate dictionary memory and estimated efficacy, converting
/// columns to direct encoding when the dictionaries stop paying for
/// themselves.
pub struct DictionaryCompressionOptimizer {
    stripe_min_bytes: u64,
    stripe_max_bytes: u64,
    stripe_max_row_count: u64,
    dictionary_max_memory_bytes: u64,
    dictionary_almost_full_range_bytes: u64,
    useful_check_column_size_bytes: u64,
    useful_check_per_chunk_frequency: u64,
    chunks_since_useful_check: u64,
    direct_conversions: u64,
}

impl DictionaryCompressionOptimizer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        stripe_min_bytes: u64,
        stripe_max_bytes: u64,
        stripe_max_row_count: u64,
        dictionary_max_memory_bytes: u64,
        dictionary_almost_full_range_bytes: u64,
        useful_check_column_size_bytes: u64,
        useful_check_per_chunk_frequency: u64,
    ) -> Self {
        Self {
            stripe_min_bytes,
            stripe_max_bytes,
            stripe_max_row_count,
            dictionary_max_memory_bytes,
            dictionary_almost_full_range_bytes,
            useful_check_column_size_bytes,
            useful_check_per_chunk_frequency: useful_check_per_chunk_frequency.max(1),
            chunks_since_useful_check: 0,
            direct_conversions: 0,
        }
    }

    /// Total dictionary memory across the column tree.
    pub fn dictionary_memory_bytes(&self, writers: &mut [Box<dyn ColumnWriter>]) -> u64 {
        let mut total = 0;
        for_each_dictionary_column(writers, &mut |column| {
            if !column.is_direct_encoded() {
                total += column.dictionary_memory_bytes();
            }
        });
        total
    }

    fn memory_soft_limit(&self) -> u64 {
        self.dictionary_max_memory_bytes
            .saturating_sub(self.dictionary_almost_full_range_bytes)
    }

    /// True when dictionary memory is within the almost-full band; the
    /// flush policy uses this to cut a stripe before the hard cap.
    pub fn is_full(&self, writers: &mut [Box<dyn ColumnWriter>]) -> bool {
        self.dictionary_memory_bytes(writers) > self.memory_soft_limit()
    }

    /// Re-evaluate after an ingest chunk.
    pub fn optimize(
        &mut self,
        writers: &mut [Box<dyn ColumnWriter>],
        buffered_bytes: u64,
        stripe_row_count: u64,
    ) -> DwrfResult<()> {
        self.chunks_since_useful_check += 1;

        if self.dictionary_memory_bytes(writers) <= self.memory_soft_limit()
            && stripe_row_count < self.stripe_max_row_count
        {
            // No pressure: only the periodic usefulness check applies,
            // and only to columns big enough for the ratio to matter.
            if self.chunks_since_useful_check >= self.useful_check_per_chunk_frequency {
                self.chunks_since_useful_check = 0;
                self.convert_low_compression_columns(writers, buffered_bytes, false)?;
            }
            return Ok(());
        }

        // Memory pressure, or the stripe is at its row cap: drop every
        // poorly compressing dictionary first, then the least effective
        // ones until the pressure clears or nothing convertible still
        // fits the stripe byte budget.
        let mut buffered = self.convert_low_compression_columns(writers, buffered_bytes, true)?;
        while self.dictionary_memory_bytes(writers) > self.memory_soft_limit() {
            match self.convert_worst(writers, buffered)? {
                Some(updated) => buffered = updated,
                None => break,
            }
        }
        Ok(())
    }

    /// The terminal evaluation at stripe close: the same usefulness
    /// evaluation without the memory guard. Once the stripe has reached
    /// its minimum size, even small weakly-useful dictionaries are
    /// collapsed before writing.
    pub fn final_optimize(
        &mut self,
        writers: &mut [Box<dyn ColumnWriter>],
        buffered_bytes: u64,
    ) -> DwrfResult<()> {
        let include_small_columns = buffered_bytes >= self.stripe_min_bytes;
        self.convert_low_compression_columns(writers, buffered_bytes, include_small_columns)?;
        Ok(())
    }

    /// A dictionary column's projected size under direct encoding: its
    /// logical bytes, recovered from the current encoded size and ratio.
    fn projected_direct_bytes(column: &mut dyn DictionaryColumn) -> u64 {
        (column.estimate_compression_ratio() * column.buffered_bytes() as f64) as u64
    }

    /// Convert every dictionary whose projected ratio is below the
    /// threshold, provided its direct form still fits the stripe byte
    /// budget. Returns the buffered byte total updated for the
    /// conversions performed.
    fn convert_low_compression_columns(
        &mut self,
        writers: &mut [Box<dyn ColumnWriter>],
        buffered_bytes: u64,
        include_small_columns: bool,
    ) -> DwrfResult<u64> {
        let size_floor = if include_small_columns {
            0
        } else {
            self.useful_check_column_size_bytes
        };
        let stripe_max_bytes = self.stripe_max_bytes;
        let mut buffered = buffered_bytes;
        let mut conversions = 0u64;
        let mut result = Ok(());
        for_each_dictionary_column(writers, &mut |column| {
            if result.is_err() || column.is_direct_encoded() {
                return;
            }
            let column_bytes = column.buffered_bytes();
            if column_bytes < size_floor
                || column.estimate_compression_ratio() >= MIN_DICTIONARY_COMPRESSION_RATIO
            {
                return;
            }
            let projected = Self::projected_direct_bytes(column);
            if buffered.saturating_sub(column_bytes) + projected > stripe_max_bytes {
                return;
            }
            match column.convert_to_direct() {
                Ok(()) => {
                    conversions += 1;
                    buffered = buffered.saturating_sub(column_bytes) + column.buffered_bytes();
                }
                Err(e) => result = Err(e),
            }
        });
        if conversions > 0 {
            debug!("converted {conversions} dictionary columns to direct encoding");
        }
        self.direct_conversions += conversions;
        result.map(|_| buffered)
    }

    /// Convert the dictionary with the worst projected ratio whose direct
    /// form fits the stripe byte budget. Returns the updated buffered
    /// byte total, or `None` when no convertible column remains.
    fn convert_worst(
        &mut self,
        writers: &mut [Box<dyn ColumnWriter>],
        buffered_bytes: u64,
    ) -> DwrfResult<Option<u64>> {
        let stripe_max_bytes = self.stripe_max_bytes;
        let mut worst: Option<(f64, usize)> = None;
        let mut index = 0;
        for_each_dictionary_column(writers, &mut |column| {
            if !column.is_direct_encoded() {
                let column_bytes = column.buffered_bytes();
                let projected = Self::projected_direct_bytes(column);
                let fits =
                    buffered_bytes.saturating_sub(column_bytes) + projected <= stripe_max_bytes;
                let ratio = column.estimate_compression_ratio();
                if fits && worst.map_or(true, |(r, _)| ratio < r) {
                    worst = Some((ratio, index));
                }
            }
            index += 1;
        });
        let Some((_, target)) = worst else {
            return Ok(None);
        };

        let mut result = Ok(());
        let mut buffered = buffered_bytes;
        let mut index = 0;
        for_each_dictionary_column(writers, &mut |column| {
            if index == target {
                let column_bytes = column.buffered_bytes();
                match column.convert_to_direct() {
                    Ok(()) => {
                        buffered =
                            buffered.saturating_sub(column_bytes) + column.buffered_bytes();
                    }
                    Err(e) => result = Err(e),
                }
            }
            index += 1;
        });
        result?;
        self.direct_conversions += 1;
        Ok(Some(buffered))
    }

    /// Clear per-stripe accounting; the column writers reset their own
    /// per-stripe state.
    pub fn reset(&mut self) {
        self.chunks_since_useful_check = 0;
    }

    /// Total dictionary-to-direct conversions over the writer's lifetime.
    pub fn direct_conversion_count(&self) -> u64 {
        self.direct_conversions
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::column::StringColumnWriter;
    use crate::compression::{CompressionBufferPool, CompressionKind};
    use crate::options::{ColumnWriterOptions, WriterOptions};
    use crate::page::VarcharBlock;

    fn column_options() -> ColumnWriterOptions {
        ColumnWriterOptions::from_writer_options(
            &WriterOptions::default().with_compression(CompressionKind::None),
            Default::default(),
            Arc::new(CompressionBufferPool::default()),
        )
    }

    /// A dictionary string column where every value is distinct, so the
    /// dictionary only adds overhead.
    fn unique_strings_writer(rows: usize) -> Box<dyn ColumnWriter> {
        let mut writer = StringColumnWriter::new(1, &column_options(), None);
        writer.begin_row_group();
        let values: Vec<String> = (0..rows).map(|i| format!("unique-{i:08}")).collect();
        writer
            .write_block(&VarcharBlock::from_values(values).into())
            .unwrap();
        writer.finish_row_group().unwrap();
        Box::new(writer)
    }

    fn is_direct(writers: &mut [Box<dyn ColumnWriter>]) -> bool {
        let mut direct = false;
        for_each_dictionary_column(writers, &mut |column| direct = column.is_direct_encoded());
        direct
    }

    #[test]
    fn conversion_respects_stripe_byte_budget() {
        // The ratio is poor, but direct encoding would overrun a 64-byte
        // stripe budget, so the dictionary must stay.
        let mut writers = vec![unique_strings_writer(2000)];
        let buffered = writers[0].buffered_bytes();
        let mut optimizer =
            DictionaryCompressionOptimizer::new(0, 64, 10_000_000, 1 << 20, 1 << 18, 6 << 20, 4);
        optimizer.final_optimize(&mut writers, buffered).unwrap();
        assert_eq!(optimizer.direct_conversion_count(), 0);
        assert!(!is_direct(&mut writers));

        // The same column converts once the budget allows it.
        let mut optimizer = DictionaryCompressionOptimizer::new(
            0,
            64 << 20,
            10_000_000,
            1 << 20,
            1 << 18,
            6 << 20,
            4,
        );
        optimizer.final_optimize(&mut writers, buffered).unwrap();
        assert_eq!(optimizer.direct_conversion_count(), 1);
        assert!(is_direct(&mut writers));
    }

    #[test]
    fn final_optimize_keeps_small_dictionaries_below_stripe_min() {
        // Under the stripe minimum, only columns past the usefulness
        // size threshold are evaluated; this one is far smaller.
        let mut writers = vec![unique_strings_writer(2000)];
        let buffered = writers[0].buffered_bytes();
        let mut optimizer = DictionaryCompressionOptimizer::new(
            32 << 20,
            64 << 20,
            10_000_000,
            1 << 20,
            1 << 18,
            6 << 20,
            4,
        );
        optimizer.final_optimize(&mut writers, buffered).unwrap();
        assert_eq!(optimizer.direct_conversion_count(), 0);
        assert!(!is_direct(&mut writers));
    }

    #[test]
    fn memory_pressure_converts_the_dictionary() {
        // 2000 distinct entries hold far more than the 8 KiB cap.
        let mut writers = vec![unique_strings_writer(2000)];
        let buffered = writers[0].buffered_bytes();
        let mut optimizer =
            DictionaryCompressionOptimizer::new(0, 64 << 20, 10_000_000, 8 << 10, 2 << 10, 6 << 20, 4);
        optimizer.optimize(&mut writers, buffered, 2000).unwrap();
        assert_eq!(optimizer.direct_conversion_count(), 1);
        assert!(is_direct(&mut writers));
    }
}
