//! Data stream ordering within a stripe.
//!
//! Index streams always precede data streams and stay in column order; the
//! layout only reorders the data region, grouping streams by top-level
//! column for read locality.

use std::collections::HashMap;

use crate::stream::StreamDataOutput;

/// The strategy for ordering a stripe's data streams.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamLayout {
    /// Group streams by top-level column, smallest column first, smallest
    /// stream first within a column.
    #[default]
    ByColumnSize,
    /// Order all data streams by size, smallest first, regardless of
    /// column.
    ByStreamSize,
}

impl StreamLayout {
    /// Reorder `data_streams` in place. `node_to_column` maps each node id
    /// to the index of the top-level column containing it.
    pub fn reorder(&self, data_streams: &mut [StreamDataOutput], node_to_column: &[u32]) {
        match self {
            Self::ByStreamSize => {
                data_streams.sort_by_key(|s| (s.size(), s.stream().column(), s.stream().kind()));
            }
            Self::ByColumnSize => {
                let mut column_sizes: HashMap<u32, u64> = HashMap::new();
                for stream in data_streams.iter() {
                    let column = node_to_column[stream.stream().column() as usize];
                    *column_sizes.entry(column).or_default() += stream.size();
                }
                data_streams.sort_by_key(|s| {
                    let column = node_to_column[s.stream().column() as usize];
                    (
                        column_sizes[&column],
                        column,
                        s.size(),
                        s.stream().column(),
                        s.stream().kind(),
                    )
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::stream::{Stream, StreamKind};

    fn stream(node: u32, kind: StreamKind, len: usize) -> StreamDataOutput {
        StreamDataOutput::new(
            Stream::new(node, kind, len as u64),
            vec![Bytes::from(vec![0u8; len])],
        )
    }

    #[test]
    fn by_stream_size_orders_globally() {
        let mut streams = vec![
            stream(1, StreamKind::Data, 30),
            stream(2, StreamKind::Data, 10),
            stream(1, StreamKind::Length, 20),
        ];
        StreamLayout::ByStreamSize.reorder(&mut streams, &[0, 0, 1]);
        let sizes: Vec<u64> = streams.iter().map(|s| s.size()).collect();
        assert_eq!(sizes, vec![10, 20, 30]);
    }

    #[test]
    fn by_column_size_groups_columns() {
        // Column 0 (node 1) totals 50, column 1 (node 2) totals 10: the
        // smaller column's streams come first, and column 0's streams stay
        // together ordered by size.
        let mut streams = vec![
            stream(1, StreamKind::Data, 30),
            stream(2, StreamKind::Data, 10),
            stream(1, StreamKind::Length, 20),
        ];
        StreamLayout::ByColumnSize.reorder(&mut streams, &[0, 0, 1]);
        let order: Vec<(u32, u64)> = streams
            .iter()
            .map(|s| (s.stream().column(), s.size()))
            .collect();
        assert_eq!(order, vec![(2, 10), (1, 20), (1, 30)]);
    }
}
