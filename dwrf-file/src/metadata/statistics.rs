//! Column statistics: accumulation within a row group, merging across row
//! groups, stripes, and the whole file.

use std::collections::BTreeMap;

/// Statistics for one column node over one unit (row group, stripe, file).
#[derive(Clone, Debug, PartialEq, Default)]
pub struct ColumnStatistics {
    /// The number of non-null values in the unit.
    pub number_of_values: Option<u64>,
    pub typed: TypedStatistics,
    /// Logical size of the values.
    pub raw_size: Option<u64>,
    /// Physical size of the streams backing the node.
    pub storage_size: Option<u64>,
    pub map_statistics: Option<MapStatistics>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub enum TypedStatistics {
    #[default]
    None,
    Integer(IntegerStatistics),
    String(StringStatistics),
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct IntegerStatistics {
    pub minimum: Option<i64>,
    pub maximum: Option<i64>,
    /// Unset on overflow.
    pub sum: Option<i64>,
}

#[derive(Clone, Debug, PartialEq, Default)]
pub struct StringStatistics {
    pub minimum: Option<String>,
    pub maximum: Option<String>,
    /// Total byte length of all values.
    pub sum: i64,
}

/// The key of one entry of a flattened map column.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MapKey {
    Int(i64),
    Bytes(Vec<u8>),
}

/// Per-key storage sizes of a flattened map column.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct MapStatistics {
    pub key_sizes: BTreeMap<MapKey, u64>,
}

impl ColumnStatistics {
    /// The synthetic node-0 entry of a stripe: row count and raw size only.
    pub fn row_count(number_of_rows: u64, raw_size: u64) -> Self {
        Self {
            number_of_values: Some(number_of_rows),
            raw_size: Some(raw_size),
            ..Default::default()
        }
    }

    /// The reduced form recorded in the unencrypted footer for a node that
    /// belongs to an encryption group: counts and sizes without values.
    pub fn stripped(&self) -> Self {
        Self {
            number_of_values: self.number_of_values,
            raw_size: self.raw_size,
            storage_size: self.storage_size,
            ..Default::default()
        }
    }

    pub(crate) fn to_proto(&self) -> dwrf_proto::ColumnStatistics {
        dwrf_proto::ColumnStatistics {
            number_of_values: self.number_of_values,
            int_statistics: match &self.typed {
                TypedStatistics::Integer(s) => Some(dwrf_proto::IntegerStatistics {
                    minimum: s.minimum,
                    maximum: s.maximum,
                    sum: s.sum,
                }),
                _ => None,
            },
            string_statistics: match &self.typed {
                TypedStatistics::String(s) => Some(dwrf_proto::StringStatistics {
                    minimum: s.minimum.clone(),
                    maximum: s.maximum.clone(),
                    sum: Some(s.sum),
                }),
                _ => None,
            },
            raw_size: self.raw_size,
            storage_size: self.storage_size,
            map_statistics: self.map_statistics.as_ref().map(|m| dwrf_proto::MapStatistics {
                stats: m
                    .key_sizes
                    .iter()
                    .map(|(key, &size)| dwrf_proto::MapEntryStatistics {
                        key: Some(match key {
                            MapKey::Int(i) => dwrf_proto::KeyInfo {
                                int_key: Some(*i),
                                bytes_key: None,
                            },
                            MapKey::Bytes(b) => dwrf_proto::KeyInfo {
                                int_key: None,
                                bytes_key: Some(b.clone()),
                            },
                        }),
                        stats: Some(dwrf_proto::ColumnStatistics {
                            storage_size: Some(size),
                            ..Default::default()
                        }),
                    })
                    .collect(),
            }),
        }
    }

    pub(crate) fn from_proto(proto: &dwrf_proto::ColumnStatistics) -> Self {
        let typed = if let Some(s) = &proto.int_statistics {
            TypedStatistics::Integer(IntegerStatistics {
                minimum: s.minimum,
                maximum: s.maximum,
                sum: s.sum,
            })
        } else if let Some(s) = &proto.string_statistics {
            TypedStatistics::String(StringStatistics {
                minimum: s.minimum.clone(),
                maximum: s.maximum.clone(),
                sum: s.sum.unwrap_or(0),
            })
        } else {
            TypedStatistics::None
        };
        Self {
            number_of_values: proto.number_of_values,
            typed,
            raw_size: proto.raw_size,
            storage_size: proto.storage_size,
            map_statistics: proto.map_statistics.as_ref().map(|m| MapStatistics {
                key_sizes: m
                    .stats
                    .iter()
                    .filter_map(|entry| {
                        let key = match entry.key.as_ref()? {
                            dwrf_proto::KeyInfo {
                                int_key: Some(i), ..
                            } => MapKey::Int(*i),
                            dwrf_proto::KeyInfo {
                                bytes_key: Some(b), ..
                            } => MapKey::Bytes(b.clone()),
                            _ => return None,
                        };
                        let size = entry.stats.as_ref()?.storage_size?;
                        Some((key, size))
                    })
                    .collect(),
            }),
        }
    }
}

fn sum_present(values: impl Iterator<Item = Option<u64>>) -> Option<u64> {
    values.flatten().fold(None, |acc, v| Some(acc.unwrap_or(0) + v))
}

/// Merge one node's statistics across stripes into a file-level entry.
/// Counts and sums add, min/max union; the node's physical size and
/// flat-map key sizes are attached from the stream-size bookkeeping.
pub fn merge_column_statistics(
    stats: &[ColumnStatistics],
    storage_size: Option<u64>,
    map_key_sizes: Option<BTreeMap<MapKey, u64>>,
) -> ColumnStatistics {
    let number_of_values = sum_present(stats.iter().map(|s| s.number_of_values));
    let raw_size = sum_present(stats.iter().map(|s| s.raw_size));

    let integers: Vec<&IntegerStatistics> = stats
        .iter()
        .filter_map(|s| match &s.typed {
            TypedStatistics::Integer(i) => Some(i),
            _ => None,
        })
        .collect();
    let strings: Vec<&StringStatistics> = stats
        .iter()
        .filter_map(|s| match &s.typed {
            TypedStatistics::String(s) => Some(s),
            _ => None,
        })
        .collect();

    let typed = match (integers.is_empty(), strings.is_empty()) {
        (false, true) => TypedStatistics::Integer(IntegerStatistics {
            minimum: integers
                .iter()
                .fold(None, |acc, s| union_min(acc, s.minimum)),
            maximum: integers
                .iter()
                .fold(None, |acc, s| union_max(acc, s.maximum)),
            // The sum is only meaningful if every unit reported one.
            sum: integers
                .iter()
                .try_fold(0i64, |acc, s| s.sum.and_then(|v| acc.checked_add(v))),
        }),
        (true, false) => TypedStatistics::String(StringStatistics {
            minimum: strings
                .iter()
                .fold(None, |acc, s| union_min(acc, s.minimum.clone())),
            maximum: strings
                .iter()
                .fold(None, |acc, s| union_max(acc, s.maximum.clone())),
            sum: strings.iter().map(|s| s.sum).sum(),
        }),
        // Mixed variants indicate a bug upstream; drop the typed stats
        // rather than fabricate a union.
        _ => TypedStatistics::None,
    };

    ColumnStatistics {
        number_of_values,
        typed,
        raw_size,
        storage_size,
        map_statistics: map_key_sizes.map(|key_sizes| MapStatistics { key_sizes }),
    }
}

fn union_min<T: PartialOrd>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b < a { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}

fn union_max<T: PartialOrd>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b > a { b } else { a }),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Accumulates integer statistics for one row group.
#[derive(Debug, Default)]
pub struct LongStatisticsBuilder {
    non_null_count: u64,
    minimum: Option<i64>,
    maximum: Option<i64>,
    sum: Option<i64>,
    overflowed: bool,
}

impl LongStatisticsBuilder {
    pub fn add_value(&mut self, value: i64) {
        self.non_null_count += 1;
        self.minimum = Some(self.minimum.map_or(value, |m| m.min(value)));
        self.maximum = Some(self.maximum.map_or(value, |m| m.max(value)));
        if !self.overflowed {
            match self.sum.unwrap_or(0).checked_add(value) {
                Some(sum) => self.sum = Some(sum),
                None => {
                    self.overflowed = true;
                    self.sum = None;
                }
            }
        }
    }

    /// Seal the accumulated statistics and reset for the next row group.
    pub fn build_and_reset(&mut self) -> ColumnStatistics {
        let stats = ColumnStatistics {
            number_of_values: Some(self.non_null_count),
            typed: TypedStatistics::Integer(IntegerStatistics {
                minimum: self.minimum,
                maximum: self.maximum,
                sum: self.sum,
            }),
            ..Default::default()
        };
        *self = Self::default();
        stats
    }
}

/// Accumulates string statistics for one row group. Values longer than the
/// configured limit suppress min/max for the group; the sum still counts
/// every byte.
#[derive(Debug)]
pub struct StringStatisticsBuilder {
    limit: usize,
    non_null_count: u64,
    minimum: Option<String>,
    maximum: Option<String>,
    sum: i64,
    over_limit: bool,
}

impl StringStatisticsBuilder {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            non_null_count: 0,
            minimum: None,
            maximum: None,
            sum: 0,
            over_limit: false,
        }
    }

    pub fn add_value(&mut self, value: &str) {
        self.non_null_count += 1;
        self.sum += value.len() as i64;
        if value.len() > self.limit {
            self.over_limit = true;
            self.minimum = None;
            self.maximum = None;
            return;
        }
        if !self.over_limit {
            if self.minimum.as_deref().map_or(true, |m| value < m) {
                self.minimum = Some(value.to_string());
            }
            if self.maximum.as_deref().map_or(true, |m| value > m) {
                self.maximum = Some(value.to_string());
            }
        }
    }

    pub fn build_and_reset(&mut self) -> ColumnStatistics {
        let stats = ColumnStatistics {
            number_of_values: Some(self.non_null_count),
            typed: TypedStatistics::String(StringStatistics {
                minimum: self.minimum.take(),
                maximum: self.maximum.take(),
                sum: self.sum,
            }),
            ..Default::default()
        };
        let limit = self.limit;
        *self = Self::new(limit);
        stats
    }
}

/// Merge a column's per-row-group statistics into its stripe statistics.
pub(crate) fn merge_row_groups(groups: &[ColumnStatistics]) -> ColumnStatistics {
    merge_column_statistics(groups, None, None)
}

impl ColumnStatistics {
    pub(crate) fn is_stripped(&self) -> bool {
        matches!(self.typed, TypedStatistics::None) && self.map_statistics.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_builder_tracks_min_max_sum() {
        let mut builder = LongStatisticsBuilder::default();
        for v in [3, -1, 7] {
            builder.add_value(v);
        }
        let stats = builder.build_and_reset();
        assert_eq!(stats.number_of_values, Some(3));
        assert_eq!(
            stats.typed,
            TypedStatistics::Integer(IntegerStatistics {
                minimum: Some(-1),
                maximum: Some(7),
                sum: Some(9),
            })
        );

        // The builder is reusable after sealing.
        builder.add_value(5);
        assert_eq!(builder.build_and_reset().number_of_values, Some(1));
    }

    #[test]
    fn long_builder_drops_sum_on_overflow() {
        let mut builder = LongStatisticsBuilder::default();
        builder.add_value(i64::MAX);
        builder.add_value(1);
        let stats = builder.build_and_reset();
        let TypedStatistics::Integer(int) = stats.typed else {
            panic!("expected integer stats");
        };
        assert_eq!(int.sum, None);
        assert_eq!(int.maximum, Some(i64::MAX));
    }

    #[test]
    fn string_builder_honors_limit() {
        let mut builder = StringStatisticsBuilder::new(4);
        builder.add_value("abc");
        builder.add_value("abcdef");
        let stats = builder.build_and_reset();
        let TypedStatistics::String(s) = stats.typed else {
            panic!("expected string stats");
        };
        assert_eq!(s.minimum, None);
        assert_eq!(s.maximum, None);
        assert_eq!(s.sum, 9);
    }

    #[test]
    fn merge_unions_ranges_and_sums_counts() {
        let a = ColumnStatistics {
            number_of_values: Some(2),
            typed: TypedStatistics::Integer(IntegerStatistics {
                minimum: Some(1),
                maximum: Some(5),
                sum: Some(6),
            }),
            raw_size: Some(16),
            ..Default::default()
        };
        let b = ColumnStatistics {
            number_of_values: Some(1),
            typed: TypedStatistics::Integer(IntegerStatistics {
                minimum: Some(-2),
                maximum: Some(3),
                sum: Some(-2),
            }),
            raw_size: Some(8),
            ..Default::default()
        };
        let merged = merge_column_statistics(&[a, b], Some(100), None);
        assert_eq!(merged.number_of_values, Some(3));
        assert_eq!(merged.raw_size, Some(24));
        assert_eq!(merged.storage_size, Some(100));
        assert_eq!(
            merged.typed,
            TypedStatistics::Integer(IntegerStatistics {
                minimum: Some(-2),
                maximum: Some(5),
                sum: Some(4),
            })
        );
    }

    #[test]
    fn stripped_retains_only_sizes() {
        let stats = ColumnStatistics {
            number_of_values: Some(3),
            typed: TypedStatistics::String(StringStatistics {
                minimum: Some("a".into()),
                maximum: Some("z".into()),
                sum: 3,
            }),
            raw_size: Some(3),
            storage_size: Some(10),
            ..Default::default()
        };
        let stripped = stats.stripped();
        assert!(stripped.is_stripped());
        assert_eq!(stripped.number_of_values, Some(3));
        assert_eq!(stripped.raw_size, Some(3));
        assert_eq!(stripped.storage_size, Some(10));
    }
}
