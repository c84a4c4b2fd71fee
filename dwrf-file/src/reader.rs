//! The read-back path used by the write-validation self-check and the
//! round-trip tests.
//!
//! This is intentionally writer-shaped rather than a general-purpose
//! reader: it opens a file from the tail (postscript length byte, then
//! postscript, footer, metadata), resolves stream offsets by the
//! region-boundary summation rule, and decodes every column of every
//! stripe eagerly.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use dwrf_error::{dwrf_bail, dwrf_err, DwrfResult};
use prost::Message;

use crate::compression::{decompress_chunk, read_chunk_header, CompressionKind};
use crate::encryption::{DataEncryptor, EncryptionLibrary};
use crate::metadata::{
    ColumnEncoding, ColumnEncodingKind, ColumnStatistics, DwrfEncryption, DwrfType,
    EncryptionGroup, Footer, KeyProvider, Metadata, PostScript, StripeInformation,
    StripeStatistics, TypeKind,
};
use crate::output::zigzag_decode;
use crate::page::{BigintBlock, Block, VarcharBlock};
use crate::stream::{Stream, StreamKind};
use crate::stripe_cache::StripeCacheMode;
use crate::{COMPRESSION_HEADER_SIZE, MAGIC};

fn decode_proto<T: Message + Default>(bytes: &[u8], what: &str) -> DwrfResult<T> {
    T::decode(bytes).map_err(|e| dwrf_err!(CorruptFile: "{} decode failed: {}", what, e))
}

/// What a reader needs to decrypt an encrypted file: the encryption
/// library and each group's intermediate key metadata, in group order.
pub struct ReadDecryption {
    pub library: Arc<dyn EncryptionLibrary>,
    pub intermediate_keys: Vec<Bytes>,
}

/// A stream descriptor with its offset resolved against the stripe's
/// index+data region.
#[derive(Clone, Debug)]
pub struct ResolvedStream {
    pub stream: Stream,
    pub region_offset: u64,
    pub group: Option<u32>,
}

/// One decoded stripe.
pub struct ParsedStripe {
    pub information: StripeInformation,
    /// Every stream of the stripe with resolved offsets, index streams
    /// first within each region.
    pub streams: Vec<ResolvedStream>,
    /// The unencrypted stream descriptors exactly as serialized.
    pub unencrypted_streams: Vec<Stream>,
    /// Per encryption group, the decrypted stream descriptors as
    /// serialized.
    pub group_streams: Vec<Vec<Stream>>,
    /// Column encodings across all regions, dense over the stripe's
    /// nodes.
    pub encodings: BTreeMap<u32, ColumnEncoding>,
    /// Decoded row indexes per node.
    pub row_indexes: BTreeMap<u32, dwrf_proto::RowIndex>,
    /// Decoded values of each top-level column.
    pub columns: Vec<Block>,
}

/// A fully parsed and decoded file.
pub struct ParsedFile {
    pub postscript: PostScript,
    pub footer: Footer,
    pub metadata: Metadata,
    pub stripes: Vec<ParsedStripe>,
}

impl ParsedFile {
    /// Decoded values per channel: one block per stripe.
    pub fn columns(&self) -> Vec<Vec<Block>> {
        let channel_count = self
            .footer
            .types
            .first()
            .map(|t| t.field_count())
            .unwrap_or(0);
        (0..channel_count)
            .map(|channel| {
                self.stripes
                    .iter()
                    .map(|stripe| stripe.columns[channel].clone())
                    .collect()
            })
            .collect()
    }

    /// The total number of decoded rows.
    pub fn row_count(&self) -> u64 {
        self.stripes
            .iter()
            .map(|s| s.information.number_of_rows)
            .sum()
    }
}

/// Parse a complete file image. `decryption` is required to decode
/// encrypted columns; without it an encrypted file fails to open.
pub fn read_file(data: &[u8], decryption: Option<&ReadDecryption>) -> DwrfResult<ParsedFile> {
    if data.len() < MAGIC.len() + 2 {
        dwrf_bail!(CorruptFile: "file of {} bytes is too short", data.len());
    }
    if data[..MAGIC.len()] != MAGIC {
        dwrf_bail!(CorruptFile: "bad magic {:?}", &data[..MAGIC.len()]);
    }

    // The last byte is the postscript length.
    let postscript_length = data[data.len() - 1] as usize;
    let postscript_end = data.len() - 1;
    let postscript_start = postscript_end
        .checked_sub(postscript_length)
        .ok_or_else(|| dwrf_err!(CorruptFile: "postscript extends past file start"))?;
    let postscript = postscript_from_proto(&decode_proto::<dwrf_proto::PostScript>(
        &data[postscript_start..postscript_end],
        "postscript",
    )?)?;
    let compression = postscript.compression;

    let footer_start = postscript_start
        .checked_sub(postscript.footer_length as usize)
        .ok_or_else(|| dwrf_err!(CorruptFile: "footer extends past file start"))?;
    let footer_bytes = read_framed(
        &data[footer_start..postscript_start],
        compression,
        None,
    )?;
    let footer = footer_from_proto(&decode_proto::<dwrf_proto::Footer>(
        footer_bytes.as_slice(),
        "footer",
    )?)?;

    let cache_length = postscript.cache_size.unwrap_or(0) as usize;
    let metadata_end = footer_start
        .checked_sub(cache_length)
        .ok_or_else(|| dwrf_err!(CorruptFile: "stripe cache extends past file start"))?;
    let metadata_start = metadata_end
        .checked_sub(postscript.metadata_length as usize)
        .ok_or_else(|| dwrf_err!(CorruptFile: "metadata extends past file start"))?;
    let metadata_bytes = read_framed(&data[metadata_start..metadata_end], compression, None)?;
    let metadata_proto =
        decode_proto::<dwrf_proto::Metadata>(metadata_bytes.as_slice(), "metadata")?;
    let metadata = Metadata {
        stripe_statistics: metadata_proto
            .stripe_stats
            .iter()
            .map(|s| StripeStatistics {
                column_statistics: s
                    .col_stats
                    .iter()
                    .map(ColumnStatistics::from_proto)
                    .collect(),
            })
            .collect(),
    };

    if footer.encryption.is_some() && decryption.is_none() {
        dwrf_bail!(
            InvalidEncryption: "file has encrypted columns and no decryption was provided"
        );
    }

    let mut stripes = Vec::with_capacity(footer.stripes.len());
    for information in &footer.stripes {
        stripes.push(read_stripe(
            data,
            information,
            &footer.types,
            compression,
            decryption,
        )?);
    }

    Ok(ParsedFile {
        postscript,
        footer,
        metadata,
        stripes,
    })
}

fn postscript_from_proto(proto: &dwrf_proto::PostScript) -> DwrfResult<PostScript> {
    let compression = dwrf_proto::post_script::CompressionKind::try_from(proto.compression)
        .map_err(|_| dwrf_err!(CorruptFile: "unknown compression {}", proto.compression))?;
    let cache_mode = proto
        .cache_mode
        .map(|m| {
            dwrf_proto::post_script::StripeCacheMode::try_from(m)
                .map_err(|_| dwrf_err!(CorruptFile: "unknown stripe cache mode {}", m))
        })
        .transpose()?
        .map(StripeCacheMode::from_proto)
        .unwrap_or_default();
    Ok(PostScript {
        footer_length: proto.footer_length.unwrap_or(0),
        metadata_length: proto.metadata_length.unwrap_or(0),
        compression: CompressionKind::from_proto(compression),
        compression_block_size: proto.compression_block_size.unwrap_or(0),
        writer_version: proto.writer_version.clone().unwrap_or_default(),
        cache_mode,
        cache_size: proto.cache_size,
    })
}

fn footer_from_proto(proto: &dwrf_proto::Footer) -> DwrfResult<Footer> {
    let types = proto
        .types
        .iter()
        .map(DwrfType::from_proto)
        .collect::<DwrfResult<Vec<_>>>()?;
    let encryption = proto
        .encryption
        .as_ref()
        .map(|e| -> DwrfResult<DwrfEncryption> {
            let key_provider =
                match dwrf_proto::encryption::KeyProvider::try_from(e.key_provider) {
                    Ok(dwrf_proto::encryption::KeyProvider::CryptoService) => {
                        KeyProvider::CryptoService
                    }
                    _ => KeyProvider::Unknown,
                };
            Ok(DwrfEncryption {
                key_provider,
                groups: e
                    .encryption_groups
                    .iter()
                    .map(|g| EncryptionGroup {
                        nodes: g.nodes.clone(),
                        key_metadata: g.key_metadata.clone().map(Bytes::from),
                        statistics: g
                            .statistics
                            .iter()
                            .map(|s| Bytes::from(s.clone()))
                            .collect(),
                    })
                    .collect(),
            })
        })
        .transpose()?;
    Ok(Footer {
        number_of_rows: proto.number_of_rows.unwrap_or(0),
        row_group_max_row_count: proto.row_index_stride.unwrap_or(0),
        raw_size: proto.raw_data_size.unwrap_or(0),
        stripes: proto
            .stripes
            .iter()
            .map(StripeInformation::from_proto)
            .collect(),
        types,
        statistics: proto
            .statistics
            .iter()
            .map(ColumnStatistics::from_proto)
            .collect(),
        user_metadata: proto
            .metadata
            .iter()
            .filter_map(|item| {
                Some((
                    item.name.clone()?,
                    Bytes::from(item.value.clone().unwrap_or_default()),
                ))
            })
            .collect(),
        encryption,
        stripe_cache_offsets: (!proto.stripe_cache_offsets.is_empty())
            .then(|| proto.stripe_cache_offsets.clone()),
    })
}

/// Undo the chunk framing of one stream: decrypt each chunk payload when a
/// decryptor is given, then decompress chunks not stored as originals.
fn read_framed(
    data: &[u8],
    compression: CompressionKind,
    decryptor: Option<&DataEncryptor>,
) -> DwrfResult<Vec<u8>> {
    if compression == CompressionKind::None && decryptor.is_none() {
        return Ok(data.to_vec());
    }
    let mut output = Vec::with_capacity(data.len());
    let mut position = 0;
    while position < data.len() {
        let (length, is_original) = read_chunk_header(&data[position..])?;
        position += COMPRESSION_HEADER_SIZE;
        if position + length > data.len() {
            dwrf_bail!(CorruptFile: "chunk of {} bytes overruns its stream", length);
        }
        let payload = &data[position..position + length];
        position += length;
        let plaintext = match decryptor {
            Some(decryptor) => decryptor.decrypt(payload)?,
            None => payload.to_vec(),
        };
        if is_original {
            output.extend_from_slice(&plaintext);
        } else {
            output.extend_from_slice(&decompress_chunk(compression, &plaintext)?);
        }
    }
    Ok(output)
}

fn read_stripe(
    data: &[u8],
    information: &StripeInformation,
    types: &[DwrfType],
    compression: CompressionKind,
    decryption: Option<&ReadDecryption>,
) -> DwrfResult<ParsedStripe> {
    let region_start = information.offset as usize;
    let region_length = (information.index_length + information.data_length) as usize;
    let footer_start = region_start + region_length;
    let footer_end = footer_start + information.footer_length as usize;
    if footer_end > data.len() {
        dwrf_bail!(CorruptFile: "stripe at {} overruns the file", information.offset);
    }
    let region = &data[region_start..footer_start];

    let footer_bytes = read_framed(&data[footer_start..footer_end], compression, None)?;
    let stripe_footer =
        decode_proto::<dwrf_proto::StripeFooter>(footer_bytes.as_slice(), "stripe footer")?;

    // Recover each group's data encryption key from the stripe's
    // encrypted key metadata.
    let mut decryptors: Vec<DataEncryptor> = Vec::new();
    if let Some(decryption) = decryption {
        if decryption.intermediate_keys.len() < information.encrypted_key_metadatas.len() {
            dwrf_bail!(
                InvalidEncryption: "{} intermediate keys for {} groups",
                decryption.intermediate_keys.len(),
                information.encrypted_key_metadatas.len()
            );
        }
        for (group, encrypted_dek) in information.encrypted_key_metadatas.iter().enumerate() {
            let dek = decryption
                .library
                .decrypt_key(&decryption.intermediate_keys[group], encrypted_dek)?;
            decryptors.push(DataEncryptor::new(
                Bytes::from(dek),
                decryption.library.clone(),
            ));
        }
    }

    let mut encodings: BTreeMap<u32, ColumnEncoding> = BTreeMap::new();
    for encoding in &stripe_footer.columns {
        let (node, encoding) = ColumnEncoding::from_proto(encoding)?;
        encodings.insert(node, encoding);
    }

    // Streams record a length always and an offset only at region
    // boundaries; within each region the cursor advances by summation.
    let mut resolved = Vec::new();
    let mut unencrypted_streams = Vec::new();
    let mut cursor = 0u64;
    for stream_proto in &stripe_footer.streams {
        let stream = Stream::from_proto(stream_proto)?;
        let offset = stream.offset().unwrap_or(cursor);
        cursor = offset + stream.length();
        unencrypted_streams.push(stream.clone());
        resolved.push(ResolvedStream {
            stream,
            region_offset: offset,
            group: None,
        });
    }

    let mut group_streams = Vec::with_capacity(stripe_footer.encrypted_groups.len());
    for (group, blob) in stripe_footer.encrypted_groups.iter().enumerate() {
        let decryptor = decryptors.get(group).ok_or_else(
            || dwrf_err!(InvalidEncryption: "no key to decrypt stripe group {}", group),
        )?;
        let group_bytes = read_framed(blob, compression, Some(decryptor))?;
        let encryption_group = decode_proto::<dwrf_proto::StripeEncryptionGroup>(
            group_bytes.as_slice(),
            "stripe encryption group",
        )?;

        for encoding in &encryption_group.encoding {
            let (node, encoding) = ColumnEncoding::from_proto(encoding)?;
            encodings.insert(node, encoding);
        }
        let mut streams = Vec::with_capacity(encryption_group.streams.len());
        let mut cursor = 0u64;
        for stream_proto in &encryption_group.streams {
            let stream = Stream::from_proto(stream_proto)?;
            let offset = stream.offset().unwrap_or(cursor);
            cursor = offset + stream.length();
            streams.push(stream.clone());
            resolved.push(ResolvedStream {
                stream,
                region_offset: offset,
                group: Some(group as u32),
            });
        }
        group_streams.push(streams);
    }

    let stream_bytes = |resolved: &ResolvedStream| -> DwrfResult<Vec<u8>> {
        let start = resolved.region_offset as usize;
        let end = start + resolved.stream.length() as usize;
        if end > region.len() {
            dwrf_bail!(
                CorruptFile: "stream at {}..{} overruns the stripe region",
                start,
                end
            );
        }
        let decryptor = resolved
            .group
            .map(|g| {
                decryptors
                    .get(g as usize)
                    .ok_or_else(|| dwrf_err!(InvalidEncryption: "no key for group {}", g))
            })
            .transpose()?;
        read_framed(&region[start..end], compression, decryptor)
    };

    let mut row_indexes = BTreeMap::new();
    for stream in resolved
        .iter()
        .filter(|s| s.stream.kind() == StreamKind::RowIndex)
    {
        let bytes = stream_bytes(stream)?;
        row_indexes.insert(
            stream.stream.column(),
            decode_proto::<dwrf_proto::RowIndex>(bytes.as_slice(), "row index")?,
        );
    }

    let root = types
        .first()
        .ok_or_else(|| dwrf_err!(CorruptFile: "empty type tree"))?;
    let mut columns = Vec::with_capacity(root.field_count());
    for &node in root.field_type_indexes() {
        let encoding = encodings
            .get(&node)
            .copied()
            .ok_or_else(|| dwrf_err!(CorruptFile: "no encoding for node {}", node))?;
        let find = |kind: StreamKind| -> Option<&ResolvedStream> {
            resolved
                .iter()
                .find(|s| s.stream.column() == node && s.stream.kind() == kind)
        };
        let presents = match find(StreamKind::Present) {
            Some(stream) => decode_present(&stream_bytes(stream)?, information.number_of_rows),
            None => vec![true; information.number_of_rows as usize],
        };
        let data = find(StreamKind::Data)
            .map(&stream_bytes)
            .transpose()?
            .unwrap_or_default();
        let lengths = find(StreamKind::Length).map(&stream_bytes).transpose()?;
        let dictionary_data = find(StreamKind::DictionaryData)
            .map(&stream_bytes)
            .transpose()?;

        let block = decode_column(
            types[node as usize].kind(),
            encoding,
            &presents,
            &data,
            lengths.as_deref(),
            dictionary_data.as_deref(),
        )?;
        columns.push(block);
    }

    Ok(ParsedStripe {
        information: information.clone(),
        streams: resolved,
        unencrypted_streams,
        group_streams,
        encodings,
        row_indexes,
        columns,
    })
}

fn decode_column(
    kind: TypeKind,
    encoding: ColumnEncoding,
    presents: &[bool],
    data: &[u8],
    lengths: Option<&[u8]>,
    dictionary_data: Option<&[u8]>,
) -> DwrfResult<Block> {
    match kind {
        TypeKind::Bigint => {
            let raw = decode_varints(data)?;
            let values: Vec<i64> = match encoding.kind {
                ColumnEncodingKind::Direct => raw.into_iter().map(zigzag_decode).collect(),
                ColumnEncodingKind::Dictionary => {
                    let dictionary: Vec<i64> = decode_varints(
                        dictionary_data
                            .ok_or_else(|| dwrf_err!(CorruptFile: "missing dictionary stream"))?,
                    )?
                    .into_iter()
                    .map(zigzag_decode)
                    .collect();
                    raw.into_iter()
                        .map(|code| {
                            dictionary.get(code as usize).copied().ok_or_else(
                                || dwrf_err!(CorruptFile: "dictionary code {} out of range", code),
                            )
                        })
                        .collect::<DwrfResult<_>>()?
                }
            };
            let mut iter = values.into_iter();
            let rows: Vec<Option<i64>> = presents
                .iter()
                .map(|&present| {
                    if present {
                        iter.next()
                            .ok_or_else(|| dwrf_err!(CorruptFile: "integer stream exhausted"))
                            .map(Some)
                    } else {
                        Ok(None)
                    }
                })
                .collect::<DwrfResult<_>>()?;
            Ok(BigintBlock::from_nullable(rows).into())
        }
        TypeKind::Varchar => {
            let values: Vec<String> = match encoding.kind {
                ColumnEncodingKind::Direct => {
                    let lengths = decode_varints(
                        lengths.ok_or_else(|| dwrf_err!(CorruptFile: "missing length stream"))?,
                    )?;
                    split_strings(data, &lengths)?
                }
                ColumnEncodingKind::Dictionary => {
                    let entry_lengths = decode_varints(
                        lengths.ok_or_else(|| dwrf_err!(CorruptFile: "missing length stream"))?,
                    )?;
                    let entries = split_strings(
                        dictionary_data
                            .ok_or_else(|| dwrf_err!(CorruptFile: "missing dictionary stream"))?,
                        &entry_lengths,
                    )?;
                    decode_varints(data)?
                        .into_iter()
                        .map(|code| {
                            entries.get(code as usize).cloned().ok_or_else(
                                || dwrf_err!(CorruptFile: "dictionary code {} out of range", code),
                            )
                        })
                        .collect::<DwrfResult<_>>()?
                }
            };
            let mut iter = values.into_iter();
            let rows: Vec<Option<String>> = presents
                .iter()
                .map(|&present| {
                    if present {
                        iter.next()
                            .ok_or_else(|| dwrf_err!(CorruptFile: "string stream exhausted"))
                            .map(Some)
                    } else {
                        Ok(None)
                    }
                })
                .collect::<DwrfResult<_>>()?;
            Ok(VarcharBlock::from_nullable(rows).into())
        }
        kind => dwrf_bail!(NotImplemented: "no column decoder for {:?}", kind),
    }
}

fn decode_varints(mut data: &[u8]) -> DwrfResult<Vec<u64>> {
    let mut values = Vec::new();
    while !data.is_empty() {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let Some((&byte, rest)) = data.split_first() else {
                dwrf_bail!(CorruptFile: "truncated varint");
            };
            data = rest;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift > 63 {
                dwrf_bail!(CorruptFile: "varint exceeds 64 bits");
            }
        }
        values.push(value);
    }
    Ok(values)
}

fn decode_present(data: &[u8], rows: u64) -> Vec<bool> {
    (0..rows as usize)
        .map(|row| {
            data.get(row / 8)
                .map(|byte| byte >> (7 - row % 8) & 1 == 1)
                .unwrap_or(false)
        })
        .collect()
}

fn split_strings(data: &[u8], lengths: &[u64]) -> DwrfResult<Vec<String>> {
    let mut values = Vec::with_capacity(lengths.len());
    let mut position = 0usize;
    for &length in lengths {
        let end = position + length as usize;
        if end > data.len() {
            dwrf_bail!(CorruptFile: "string data exhausted at byte {}", position);
        }
        let value = std::str::from_utf8(&data[position..end])
            .map_err(|_| dwrf_err!(CorruptFile: "string value is not valid utf-8"))?;
        values.push(value.to_string());
        position = end;
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varints_round_trip() {
        let data = [0x00, 0x7f, 0x80, 0x01, 0xff, 0x7f];
        assert_eq!(decode_varints(&data).unwrap(), vec![0, 127, 128, 16383]);
    }

    #[test]
    fn truncated_varint_is_corrupt() {
        assert!(decode_varints(&[0x80]).is_err());
    }

    #[test]
    fn present_bits_are_msb_first() {
        assert_eq!(
            decode_present(&[0b1010_0000], 3),
            vec![true, false, true]
        );
    }
}
