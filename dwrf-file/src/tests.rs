use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rstest::rstest;

use crate::encryption::testing::RotateXorLibrary;
use crate::metadata::{ColumnEncodingKind, KeyProvider, TypeKind, TypedStatistics};
use crate::reader::{read_file, ParsedFile, ReadDecryption};
use crate::{
    BigintBlock, Block, CompressionKind, DataSink, DefaultFlushPolicy, DwrfStripeCacheOptions,
    DwrfWriter, FileEncoding, FlushReason, MemoryDataSink, Page, StripeCacheMode, VarcharBlock,
    WriterEncryption, WriterEncryptionGroup, WriterOptions, MAGIC,
};

fn int_page(values: Vec<i64>) -> Page {
    Page::try_new(vec![BigintBlock::from_values(values).into()]).unwrap()
}

fn string_page(values: Vec<String>) -> Page {
    Page::try_new(vec![VarcharBlock::from_values(values).into()]).unwrap()
}

fn write_pages(
    names: &[&str],
    kinds: &[TypeKind],
    pages: &[Page],
    options: WriterOptions,
) -> (DwrfWriter<MemoryDataSink>, Vec<u8>) {
    let mut writer = DwrfWriter::try_new(
        MemoryDataSink::new(),
        names.iter().map(|n| n.to_string()).collect(),
        kinds.to_vec(),
        options,
    )
    .unwrap();
    for page in pages {
        writer.write(page).unwrap();
    }
    writer.close().unwrap();
    let file = writer.sink().as_slice().to_vec();
    (writer, file)
}

fn read_ints(parsed: &ParsedFile, channel: usize) -> Vec<Option<i64>> {
    parsed.columns()[channel]
        .iter()
        .flat_map(|block| match block {
            Block::Bigint(b) => b.iter().collect::<Vec<_>>(),
            _ => panic!("expected bigint column"),
        })
        .collect()
}

fn read_strings(parsed: &ParsedFile, channel: usize) -> Vec<Option<String>> {
    parsed.columns()[channel]
        .iter()
        .flat_map(|block| match block {
            Block::Varchar(b) => b
                .iter()
                .map(|v| v.map(str::to_string))
                .collect::<Vec<_>>(),
            _ => panic!("expected varchar column"),
        })
        .collect()
}

#[test]
fn test_tiny_file() {
    let options = WriterOptions::default()
        .with_compression(CompressionKind::None)
        .with_validation();
    let (writer, file) = write_pages(
        &["number"],
        &[TypeKind::Bigint],
        &[int_page(vec![1, 2, 3])],
        options,
    );

    let parsed = read_file(&file, None).unwrap();
    assert_eq!(parsed.footer.stripes.len(), 1);
    assert_eq!(parsed.footer.number_of_rows, 3);
    assert_eq!(
        parsed.stripes[0].encodings[&1].kind,
        ColumnEncodingKind::Direct
    );
    assert_eq!(
        read_ints(&parsed, 0),
        vec![Some(1), Some(2), Some(3)]
    );

    writer.validate(&file).unwrap();
    assert_eq!(writer.file_row_count().unwrap(), 3);
}

#[test]
fn test_row_group_boundaries() {
    let options = WriterOptions::default()
        .with_compression(CompressionKind::None)
        .with_row_group_max_row_count(10_000);
    let values: Vec<i64> = (0..25_000).collect();
    let (_, file) = write_pages(
        &["number"],
        &[TypeKind::Bigint],
        &[int_page(values.clone())],
        options,
    );

    let parsed = read_file(&file, None).unwrap();
    assert_eq!(parsed.footer.stripes.len(), 1);
    assert_eq!(parsed.stripes[0].information.number_of_rows, 25_000);

    // Three row groups, each carrying its own statistics.
    let row_index = &parsed.stripes[0].row_indexes[&1];
    assert_eq!(row_index.entry.len(), 3);
    let mins: Vec<i64> = row_index
        .entry
        .iter()
        .map(|e| {
            e.statistics
                .as_ref()
                .and_then(|s| s.int_statistics.as_ref())
                .and_then(|s| s.minimum)
                .unwrap()
        })
        .collect();
    assert_eq!(mins, vec![0, 10_000, 20_000]);

    let read: Vec<Option<i64>> = read_ints(&parsed, 0);
    assert_eq!(read, values.into_iter().map(Some).collect::<Vec<_>>());
}

#[test]
fn test_stripe_flush_by_bytes() {
    let options = WriterOptions::default()
        .with_compression(CompressionKind::None)
        .with_string_dictionary_encoding(false)
        .with_flush_policy(Arc::new(DefaultFlushPolicy::new(1024, 16 * 1024, 10_000_000)));
    let values: Vec<String> = (0..10_000).map(|i| format!("row-value-{i:08}")).collect();
    let (writer, file) = write_pages(
        &["text"],
        &[TypeKind::Varchar],
        &[string_page(values.clone())],
        options,
    );

    let parsed = read_file(&file, None).unwrap();
    assert!(
        parsed.footer.stripes.len() > 1,
        "expected multiple stripes, got {}",
        parsed.footer.stripes.len()
    );
    let total_rows: u64 = parsed
        .footer
        .stripes
        .iter()
        .map(|s| s.number_of_rows)
        .sum();
    assert_eq!(total_rows, 10_000);
    assert!(writer.stats().stripes_by_reason(FlushReason::MaxBytes) > 0);

    assert_eq!(
        read_strings(&parsed, 0),
        values.into_iter().map(Some).collect::<Vec<_>>()
    );
}

#[test]
fn test_dictionary_conversion_under_memory_pressure() {
    let options = WriterOptions::default()
        .with_compression(CompressionKind::None)
        .with_validation()
        .with_dictionary_max_memory(64 * 1024)
        .with_dictionary_memory_almost_full_range(16 * 1024);
    // High cardinality: every value distinct, so the dictionary only adds
    // overhead and must be abandoned.
    let values: Vec<String> = (0..20_000).map(|i| format!("unique-{i:012}")).collect();
    let (writer, file) = write_pages(
        &["text"],
        &[TypeKind::Varchar],
        &[string_page(values.clone())],
        options,
    );

    assert!(
        writer.dictionary_conversion_count() > 0,
        "expected at least one dictionary-to-direct conversion"
    );

    let parsed = read_file(&file, None).unwrap();
    for stripe in &parsed.stripes {
        assert_eq!(stripe.encodings[&1].kind, ColumnEncodingKind::Direct);
    }
    assert_eq!(
        read_strings(&parsed, 0),
        values.into_iter().map(Some).collect::<Vec<_>>()
    );
    writer.validate(&file).unwrap();
}

#[test]
fn test_useful_dictionary_is_kept() {
    let options = WriterOptions::default().with_compression(CompressionKind::None);
    // Three distinct values over ten thousand rows: a dictionary earns
    // its keep and must survive final optimization.
    let values: Vec<String> = (0..10_000)
        .map(|i| format!("status-{}", i % 3))
        .collect();
    let (writer, file) = write_pages(&["status"], &[TypeKind::Varchar], &[string_page(values.clone())], options);

    assert_eq!(writer.dictionary_conversion_count(), 0);
    let parsed = read_file(&file, None).unwrap();
    let encoding = parsed.stripes[0].encodings[&1];
    assert_eq!(encoding.kind, ColumnEncodingKind::Dictionary);
    assert_eq!(encoding.dictionary_size, 3);
    assert_eq!(
        read_strings(&parsed, 0),
        values.into_iter().map(Some).collect::<Vec<_>>()
    );
}

fn two_group_encryption() -> WriterEncryption {
    WriterEncryption {
        key_provider: KeyProvider::CryptoService,
        groups: vec![
            WriterEncryptionGroup {
                nodes: vec![1],
                intermediate_key_metadata: Bytes::from_static(b"key-material-one"),
            },
            WriterEncryptionGroup {
                nodes: vec![2],
                intermediate_key_metadata: Bytes::from_static(b"key-material-two"),
            },
        ],
    }
}

#[test]
fn test_two_group_encryption() {
    let library = Arc::new(RotateXorLibrary);
    let options = WriterOptions::default()
        .with_compression(CompressionKind::None)
        .with_encoding(FileEncoding::Dwrf)
        .with_encryption(two_group_encryption(), library.clone())
        .with_validation();
    let numbers: Vec<i64> = (0..1000).collect();
    let strings: Vec<String> = (0..1000).map(|i| format!("secret-{i}")).collect();
    let page = Page::try_new(vec![
        BigintBlock::from_values(numbers.clone()).into(),
        VarcharBlock::from_values(strings.clone()).into(),
    ])
    .unwrap();

    let mut writer = DwrfWriter::try_new(
        MemoryDataSink::new(),
        vec!["number".to_string(), "text".to_string()],
        vec![TypeKind::Bigint, TypeKind::Varchar],
        options,
    )
    .unwrap();
    writer.write(&page).unwrap();
    writer.close().unwrap();
    let file = writer.sink().as_slice().to_vec();

    // Opening without keys must fail.
    assert!(read_file(&file, None).is_err());

    let decryption = ReadDecryption {
        library,
        intermediate_keys: vec![
            Bytes::from_static(b"key-material-one"),
            Bytes::from_static(b"key-material-two"),
        ],
    };
    let parsed = read_file(&file, Some(&decryption)).unwrap();

    let encryption = parsed.footer.encryption.as_ref().unwrap();
    assert_eq!(encryption.groups.len(), 2);
    assert_eq!(encryption.groups[0].nodes, vec![1]);
    assert_eq!(encryption.groups[1].nodes, vec![2]);
    for group in &encryption.groups {
        assert_eq!(group.statistics.len(), 1);
        assert!(group.key_metadata.is_none());
    }

    // The unencrypted footer carries only stripped statistics for
    // encrypted nodes: counts and sizes, no values.
    for node in [1usize, 2] {
        let stats = &parsed.footer.statistics[node];
        assert_eq!(stats.number_of_values, Some(1000));
        assert!(matches!(stats.typed, TypedStatistics::None));
        assert!(stats.storage_size.is_some());
    }

    // Each stripe footer carries one encrypted payload per group, and the
    // group streams cover exactly the group's nodes.
    for stripe in &parsed.stripes {
        assert_eq!(stripe.group_streams.len(), 2);
        assert_eq!(stripe.information.encrypted_key_metadatas.len(), 2);
        for (group, streams) in stripe.group_streams.iter().enumerate() {
            assert!(!streams.is_empty());
            let expected_node = group as u32 + 1;
            assert!(streams.iter().all(|s| s.column() == expected_node));
            // The first stream of an encryption region always carries an
            // explicit offset.
            assert!(streams[0].offset().is_some());
        }
        assert!(stripe.unencrypted_streams.is_empty());

        // The resolved streams tile the index+data region exactly, which
        // only holds if every region boundary carried the right offset.
        let mut ranges: Vec<(u64, u64)> = stripe
            .streams
            .iter()
            .map(|s| (s.region_offset, s.region_offset + s.stream.length()))
            .collect();
        ranges.sort_unstable();
        let mut cursor = 0;
        for (start, end) in ranges {
            assert_eq!(start, cursor, "streams must not overlap or leave gaps");
            cursor = end;
        }
        assert_eq!(
            cursor,
            stripe.information.index_length + stripe.information.data_length
        );
    }

    assert_eq!(
        read_ints(&parsed, 0),
        numbers.into_iter().map(Some).collect::<Vec<_>>()
    );
    assert_eq!(
        read_strings(&parsed, 1),
        strings.into_iter().map(Some).collect::<Vec<_>>()
    );

    writer.validate(&file).unwrap();
}

#[test]
fn test_close_with_no_rows() {
    let options = WriterOptions::default().with_compression(CompressionKind::None);
    let mut writer = DwrfWriter::try_new(
        MemoryDataSink::new(),
        vec!["number".to_string()],
        vec![TypeKind::Bigint],
        options,
    )
    .unwrap();
    writer.close().unwrap();
    let file = writer.sink().as_slice().to_vec();

    let parsed = read_file(&file, None).unwrap();
    assert!(parsed.footer.stripes.is_empty());
    assert_eq!(parsed.footer.number_of_rows, 0);
    assert!(parsed.metadata.stripe_statistics.is_empty());
    assert!(parsed.footer.statistics.is_empty());
    assert_eq!(writer.file_row_count().unwrap(), 0);

    // The file still begins with the magic and ends with the postscript
    // length byte.
    assert_eq!(&file[..MAGIC.len()], MAGIC.as_slice());
    let postscript_length = file[file.len() - 1] as usize;
    assert!(postscript_length > 0);
}

#[test]
fn test_close_is_idempotent() {
    let options = WriterOptions::default().with_compression(CompressionKind::None);
    let mut writer = DwrfWriter::try_new(
        MemoryDataSink::new(),
        vec!["number".to_string()],
        vec![TypeKind::Bigint],
        options,
    )
    .unwrap();
    writer.write(&int_page(vec![5, 6])).unwrap();
    writer.close().unwrap();
    let written = writer.written_bytes();
    writer.close().unwrap();
    assert_eq!(writer.written_bytes(), written);
    assert_eq!(writer.written_bytes(), writer.sink().size());
}

#[test]
fn test_stripe_lengths_tile_the_file() {
    let options = WriterOptions::default()
        .with_compression(CompressionKind::None)
        .with_flush_policy(Arc::new(DefaultFlushPolicy::new(1024, 8 * 1024, 10_000_000)));
    let values: Vec<i64> = (0..20_000).collect();
    let (_, file) = write_pages(&["number"], &[TypeKind::Bigint], &[int_page(values)], options);

    let parsed = read_file(&file, None).unwrap();
    assert!(parsed.footer.stripes.len() > 1);
    assert_eq!(parsed.footer.stripes[0].offset, MAGIC.len() as u64);
    for (stripe, next) in parsed.footer.stripes.iter().zip(&parsed.footer.stripes[1..]) {
        assert_eq!(stripe.offset + stripe.total_length(), next.offset);
    }
}

#[test]
fn test_unencrypted_streams_never_carry_offsets() {
    let page = Page::try_new(vec![
        BigintBlock::from_values((0..100).collect()).into(),
        VarcharBlock::from_values((0..100).map(|i| format!("v{i}")).collect()).into(),
    ])
    .unwrap();
    let mut writer = DwrfWriter::try_new(
        MemoryDataSink::new(),
        vec!["a".to_string(), "b".to_string()],
        vec![TypeKind::Bigint, TypeKind::Varchar],
        WriterOptions::default().with_compression(CompressionKind::None),
    )
    .unwrap();
    writer.write(&page).unwrap();
    writer.close().unwrap();

    let parsed = read_file(writer.sink().as_slice(), None).unwrap();
    // A file without encryption has a single region, so no stream ever
    // starts a new one.
    for stripe in &parsed.stripes {
        assert!(stripe
            .unencrypted_streams
            .iter()
            .all(|s| s.offset().is_none()));
    }
}

#[test]
fn test_stripe_cache_offsets() {
    let options = WriterOptions::default()
        .with_compression(CompressionKind::None)
        .with_encoding(FileEncoding::Dwrf)
        .with_stripe_cache(DwrfStripeCacheOptions {
            mode: StripeCacheMode::Both,
            max_size: 1 << 20,
        });
    let (_, file) = write_pages(
        &["number"],
        &[TypeKind::Bigint],
        &[int_page((0..100).collect())],
        options,
    );

    let parsed = read_file(&file, None).unwrap();
    assert_eq!(parsed.postscript.cache_mode, StripeCacheMode::Both);
    let stripe = &parsed.footer.stripes[0];
    let offsets = parsed.footer.stripe_cache_offsets.as_ref().unwrap();
    // One index contribution and one footer contribution plus the leading
    // terminator.
    assert_eq!(
        offsets,
        &vec![
            0,
            stripe.index_length as u32,
            (stripe.index_length + stripe.footer_length) as u32
        ]
    );
    assert_eq!(
        parsed.postscript.cache_size,
        Some((stripe.index_length + stripe.footer_length) as u32)
    );
}

#[test]
fn test_orc_encoding_ignores_stripe_cache() {
    let options = WriterOptions::default()
        .with_compression(CompressionKind::None)
        .with_encoding(FileEncoding::Orc)
        .with_stripe_cache(DwrfStripeCacheOptions {
            mode: StripeCacheMode::Both,
            max_size: 1 << 20,
        });
    let (_, file) = write_pages(
        &["number"],
        &[TypeKind::Bigint],
        &[int_page((0..10).collect())],
        options,
    );

    let parsed = read_file(&file, None).unwrap();
    assert_eq!(parsed.postscript.cache_mode, StripeCacheMode::None);
    assert_eq!(parsed.postscript.cache_size, None);
    assert!(parsed.footer.stripe_cache_offsets.is_none());
}

#[rstest]
#[case(CompressionKind::None)]
#[case(CompressionKind::Zlib)]
#[case(CompressionKind::Snappy)]
#[case(CompressionKind::Lz4)]
#[case(CompressionKind::Zstd)]
fn test_round_trip_per_codec(#[case] kind: CompressionKind) {
    let mut rng = StdRng::seed_from_u64(42);
    let numbers: Vec<Option<i64>> = (0..5000)
        .map(|_| rng.gen_bool(0.9).then(|| rng.gen_range(-1_000_000..1_000_000)))
        .collect();
    let strings: Vec<Option<String>> = (0..5000)
        .map(|_| {
            rng.gen_bool(0.8)
                .then(|| format!("value-{}", rng.gen_range(0..500)))
        })
        .collect();
    let page = Page::try_new(vec![
        BigintBlock::from_nullable(numbers.clone()).into(),
        VarcharBlock::from_nullable(strings.clone()).into(),
    ])
    .unwrap();

    let mut writer = DwrfWriter::try_new(
        MemoryDataSink::new(),
        vec!["numbers".to_string(), "strings".to_string()],
        vec![TypeKind::Bigint, TypeKind::Varchar],
        WriterOptions::default()
            .with_compression(kind)
            .with_validation(),
    )
    .unwrap();
    writer.write(&page).unwrap();
    writer.close().unwrap();

    let file = writer.sink().as_slice().to_vec();
    let parsed = read_file(&file, None).unwrap();
    assert_eq!(read_ints(&parsed, 0), numbers);
    assert_eq!(read_strings(&parsed, 1), strings);
    writer.validate(&file).unwrap();
}

#[test]
fn test_multiple_pages_accumulate() {
    let mut writer = DwrfWriter::try_new(
        MemoryDataSink::new(),
        vec!["number".to_string()],
        vec![TypeKind::Bigint],
        WriterOptions::default().with_compression(CompressionKind::Zlib),
    )
    .unwrap();
    for batch in 0..10 {
        let start = batch * 100;
        writer.write(&int_page((start..start + 100).collect())).unwrap();
    }
    writer.close().unwrap();

    let parsed = read_file(writer.sink().as_slice(), None).unwrap();
    assert_eq!(parsed.footer.number_of_rows, 1000);
    assert_eq!(
        read_ints(&parsed, 0),
        (0..1000).map(Some).collect::<Vec<_>>()
    );
}

#[test]
fn test_page_column_count_mismatch() {
    let mut writer = DwrfWriter::try_new(
        MemoryDataSink::new(),
        vec!["a".to_string(), "b".to_string()],
        vec![TypeKind::Bigint, TypeKind::Bigint],
        WriterOptions::default(),
    )
    .unwrap();
    assert!(writer.write(&int_page(vec![1])).is_err());
}

#[test]
fn test_write_after_close_fails() {
    let mut writer = DwrfWriter::try_new(
        MemoryDataSink::new(),
        vec!["a".to_string()],
        vec![TypeKind::Bigint],
        WriterOptions::default(),
    )
    .unwrap();
    writer.close().unwrap();
    assert!(writer.write(&int_page(vec![1])).is_err());
}

#[test]
fn test_file_statistics_merge_across_stripes() {
    let options = WriterOptions::default()
        .with_compression(CompressionKind::None)
        .with_flush_policy(Arc::new(DefaultFlushPolicy::new(512, 4 * 1024, 10_000_000)));
    let values: Vec<i64> = (0..10_000).collect();
    let (writer, file) = write_pages(&["number"], &[TypeKind::Bigint], &[int_page(values)], options);

    let parsed = read_file(&file, None).unwrap();
    assert!(parsed.footer.stripes.len() > 1);

    let stats = &parsed.footer.statistics[1];
    assert_eq!(stats.number_of_values, Some(10_000));
    let TypedStatistics::Integer(int) = &stats.typed else {
        panic!("expected integer statistics");
    };
    assert_eq!(int.minimum, Some(0));
    assert_eq!(int.maximum, Some(9_999));
    assert!(stats.storage_size.unwrap() > 0);

    // The writer's own view matches what landed in the footer.
    assert_eq!(writer.file_statistics().unwrap(), &parsed.footer.statistics[..]);
}
