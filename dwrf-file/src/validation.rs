//! The optional write-validation mirror.
//!
//! When enabled, the writer records everything it believes it wrote: the
//! input rows, per-row-group and per-stripe statistics, and the footer
//! content. [`crate::DwrfWriter::validate`] then reads the produced file
//! back and checks the two against each other.

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;
use dwrf_error::{dwrf_bail, DwrfResult};

use crate::compression::CompressionKind;
use crate::metadata::{ColumnStatistics, DwrfType, StripeStatistics};
use crate::page::{Block, Page};
use crate::reader::{read_file, ReadDecryption};

/// The side-channel observer fed by the ingest and flush paths.
#[derive(Default)]
pub struct WriteValidationBuilder {
    pages: Vec<Page>,
    row_group_statistics: Vec<BTreeMap<u32, ColumnStatistics>>,
    stripe_row_counts: Vec<u64>,
    stripe_statistics: Vec<(u64, StripeStatistics)>,
    file_statistics: Option<Vec<ColumnStatistics>>,
    compression: Option<CompressionKind>,
    types: Option<Vec<DwrfType>>,
    flattened_nodes: HashSet<u32>,
    row_group_max_row_count: Option<u32>,
    column_names: Vec<String>,
    version: Option<String>,
    metadata: BTreeMap<String, Bytes>,
}

impl WriteValidationBuilder {
    pub fn add_page(&mut self, page: &Page) {
        self.pages.push(page.clone());
    }

    pub fn add_row_group_statistics(&mut self, statistics: &BTreeMap<u32, ColumnStatistics>) {
        self.row_group_statistics.push(statistics.clone());
    }

    pub fn add_stripe(&mut self, number_of_rows: u64) {
        self.stripe_row_counts.push(number_of_rows);
    }

    pub fn add_stripe_statistics(&mut self, stripe_offset: u64, statistics: &StripeStatistics) {
        self.stripe_statistics
            .push((stripe_offset, statistics.clone()));
    }

    pub fn set_file_statistics(&mut self, statistics: Vec<ColumnStatistics>) {
        self.file_statistics = Some(statistics);
    }

    pub fn set_compression(&mut self, compression: CompressionKind) {
        self.compression = Some(compression);
    }

    pub fn set_types(&mut self, types: Vec<DwrfType>) {
        self.types = Some(types);
    }

    pub fn set_flattened_nodes(&mut self, nodes: HashSet<u32>) {
        self.flattened_nodes = nodes;
    }

    pub fn set_row_group_max_row_count(&mut self, count: u32) {
        self.row_group_max_row_count = Some(count);
    }

    pub fn set_column_names(&mut self, names: Vec<String>) {
        self.column_names = names;
    }

    pub fn set_version(&mut self, version: String) {
        self.version = Some(version);
    }

    pub fn add_metadata_property(&mut self, key: String, value: Bytes) {
        self.metadata.insert(key, value);
    }

    pub fn retained_bytes(&self) -> u64 {
        self.pages.iter().map(Page::size_in_bytes).sum()
    }

    pub fn build(&self) -> WriteValidation {
        WriteValidation {
            pages: self.pages.clone(),
            row_group_statistics: self.row_group_statistics.clone(),
            stripe_row_counts: self.stripe_row_counts.clone(),
            stripe_statistics: self.stripe_statistics.clone(),
            file_statistics: self.file_statistics.clone().unwrap_or_default(),
            compression: self.compression.unwrap_or_default(),
            types: self.types.clone(),
            flattened_nodes: self.flattened_nodes.clone(),
            row_group_max_row_count: self.row_group_max_row_count.unwrap_or(0),
            column_names: self.column_names.clone(),
            version: self.version.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// The sealed expectations checked against the produced file.
pub struct WriteValidation {
    pages: Vec<Page>,
    row_group_statistics: Vec<BTreeMap<u32, ColumnStatistics>>,
    stripe_row_counts: Vec<u64>,
    stripe_statistics: Vec<(u64, StripeStatistics)>,
    file_statistics: Vec<ColumnStatistics>,
    compression: CompressionKind,
    types: Option<Vec<DwrfType>>,
    flattened_nodes: HashSet<u32>,
    row_group_max_row_count: u32,
    column_names: Vec<String>,
    version: Option<String>,
    metadata: BTreeMap<String, Bytes>,
}

macro_rules! validate_eq {
    ($left:expr, $right:expr, $what:literal) => {
        if $left != $right {
            return Err(dwrf_error::DwrfError::CorruptFile(
                format!(
                    concat!($what, ": wrote {:?}, read back {:?}"),
                    $left, $right
                )
                .into(),
            ));
        }
    };
}

impl WriteValidation {
    /// Read the produced file back and compare it against the recorded
    /// expectations. Any mismatch is a corruption error.
    pub fn validate(&self, file: &[u8], decryption: Option<&ReadDecryption>) -> DwrfResult<()> {
        let parsed = read_file(file, decryption)?;

        validate_eq!(self.compression, parsed.postscript.compression, "compression");
        validate_eq!(
            self.row_group_max_row_count,
            parsed.footer.row_group_max_row_count,
            "row group max row count"
        );
        if let Some(types) = &self.types {
            validate_eq!(types, &parsed.footer.types, "type tree");
        }
        if !self.column_names.is_empty() {
            let read_names = parsed
                .footer
                .types
                .first()
                .map(|t| t.field_names())
                .unwrap_or_default();
            validate_eq!(self.column_names.as_slice(), read_names, "column names");
        }
        if let Some(version) = &self.version {
            validate_eq!(
                version.as_str(),
                parsed.postscript.writer_version.as_str(),
                "writer version"
            );
        }
        for &node in &self.flattened_nodes {
            if node as usize >= parsed.footer.types.len() {
                dwrf_bail!(CorruptFile: "flattened node {} outside the type tree", node);
            }
        }
        for (key, value) in &self.metadata {
            match parsed.footer.user_metadata.get(key) {
                Some(read) => validate_eq!(value, read, "user metadata value"),
                None => dwrf_bail!(CorruptFile: "user metadata key {} missing", key),
            }
        }

        let expected_rows: u64 = self.pages.iter().map(|p| p.position_count() as u64).sum();
        validate_eq!(expected_rows, parsed.footer.number_of_rows, "row count");
        validate_eq!(
            self.stripe_row_counts,
            parsed
                .footer
                .stripes
                .iter()
                .map(|s| s.number_of_rows)
                .collect::<Vec<_>>(),
            "stripe row counts"
        );
        validate_eq!(
            self.stripe_statistics.len(),
            parsed.metadata.stripe_statistics.len(),
            "stripe statistics count"
        );
        for ((offset, expected), actual) in self
            .stripe_statistics
            .iter()
            .zip(&parsed.metadata.stripe_statistics)
        {
            if expected != actual {
                dwrf_bail!(CorruptFile: "stripe statistics mismatch at offset {}", offset);
            }
        }

        // Encrypted nodes appear stripped in the unencrypted footer; the
        // read path substitutes the decrypted statistics when a decryption
        // configuration is available, in which case the full comparison
        // applies.
        validate_eq!(
            self.file_statistics.len(),
            parsed.footer.statistics.len(),
            "file statistics count"
        );
        for (node, (expected, actual)) in self
            .file_statistics
            .iter()
            .zip(&parsed.footer.statistics)
            .enumerate()
        {
            let stripped;
            let comparable = if actual.is_stripped() && !expected.is_stripped() {
                stripped = expected.stripped();
                &stripped
            } else {
                expected
            };
            if comparable != actual {
                dwrf_bail!(CorruptFile: "file statistics mismatch at node {}", node);
            }
        }

        self.validate_rows(&parsed.columns())?;

        // Row-group statistics are re-derivable from the recorded pages;
        // their count is checked against the stride here.
        let expected_groups: u64 = self
            .stripe_row_counts
            .iter()
            .map(|rows| rows.div_ceil(self.row_group_max_row_count.max(1) as u64))
            .sum();
        validate_eq!(
            expected_groups,
            self.row_group_statistics.len() as u64,
            "row group count"
        );

        Ok(())
    }

    fn validate_rows(&self, read_columns: &[Vec<Block>]) -> DwrfResult<()> {
        let channel_count = self.pages.first().map(|p| p.channel_count()).unwrap_or(0);
        for channel in 0..channel_count {
            let written: Vec<&Block> = self
                .pages
                .iter()
                .map(|page| page.block(channel))
                .collect();
            let read = &read_columns[channel];
            compare_column(channel, &written, read)?;
        }
        Ok(())
    }
}

fn compare_column(channel: usize, written: &[&Block], read: &[Block]) -> DwrfResult<()> {
    match written.first() {
        Some(Block::Bigint(_)) => {
            let expected = written.iter().flat_map(|b| match b {
                Block::Bigint(b) => b.iter(),
                _ => unreachable!("mixed block kinds in one column"),
            });
            let actual = read.iter().flat_map(|b| match b {
                Block::Bigint(b) => Some(b.iter()),
                _ => None,
            });
            let expected: Vec<Option<i64>> = expected.collect();
            let actual: Vec<Option<i64>> = actual.flatten().collect();
            if expected != actual {
                dwrf_bail!(CorruptFile: "column {} integer values differ", channel);
            }
        }
        Some(Block::Varchar(_)) => {
            let expected: Vec<Option<String>> = written
                .iter()
                .flat_map(|b| match b {
                    Block::Varchar(b) => b.iter().map(|v| v.map(str::to_string)).collect::<Vec<_>>(),
                    _ => unreachable!("mixed block kinds in one column"),
                })
                .collect();
            let actual: Vec<Option<String>> = read
                .iter()
                .flat_map(|b| match b {
                    Block::Varchar(b) => {
                        b.iter().map(|v| v.map(str::to_string)).collect::<Vec<_>>()
                    }
                    _ => Vec::new(),
                })
                .collect();
            if expected != actual {
                dwrf_bail!(CorruptFile: "column {} string values differ", channel);
            }
        }
        None => {}
    }
    Ok(())
}
