//! Write DWRF/ORC files, a columnar serialization of row pages.
//!
//! The writer ingests [`Page`]s (batches of rows), slices them into
//! row groups and stripes, and emits a self-describing binary file of
//! compressed, optionally encrypted column streams. All metadata is
//! serialized as protobuf ([`dwrf_proto`]) framed through the same
//! compression as the data streams.
//!
//! # Writing
//!
//! Construct a [`DwrfWriter`] from a [`DataSink`], the column names and
//! kinds, and [`WriterOptions`]. Call [`DwrfWriter::write`] for each page
//! and [`DwrfWriter::close`] once at the end. The writer is synchronous and
//! single-owner: every call blocks until its effects are durable in the
//! sink, and stripes appear in the file in flush order.
//!
//! # File Format
//!
//! Succinctly, the file format is as follows:
//!
//! 1. The 3-byte magic `ORC`.
//! 2. A sequence of stripes. Each stripe is an index region (row index
//!    streams), a data region (value streams), and a protobuf stripe
//!    footer describing the streams and column encodings. Streams record a
//!    length but carry a starting offset only when they begin a new
//!    encryption region; readers reconstruct the other offsets by
//!    summation.
//! 3. A metadata section holding the per-stripe column statistics.
//! 4. An optional stripe-cache blob duplicating index and/or stripe-footer
//!    bytes for low-latency opens.
//! 5. The file footer: row counts, stripe information, the type tree,
//!    file-level column statistics, user metadata, and the optional
//!    encryption group descriptors.
//! 6. The postscript, which tells a reader how to locate and decompress
//!    the footer, followed by a single byte holding the postscript length.
//!
//! ## Reified File Format
//! ```text
//! ┌──────────────────────────────┐
//! │          "ORC" magic         │
//! ├──────────────────────────────┤
//! │   Stripe 0: index streams    │
//! │             data streams     │
//! │             stripe footer    │
//! ├──────────────────────────────┤
//! │           Stripe …           │
//! ├──────────────────────────────┤
//! │   Metadata (stripe stats)    │
//! ├──────────────────────────────┤
//! │  Stripe cache (DWRF, opt.)   │
//! ├──────────────────────────────┤
//! │            Footer            │
//! ├──────────────────────────────┤
//! │          Postscript          │
//! ├──────────────────────────────┤
//! │ 1-byte postscript length     │
//! └──────────────────────────────┘
//! ```
//!
//! The trailing length byte is load-bearing: a reader reads the last byte
//! of the file, then reads that many bytes preceding it as the postscript.

pub mod column;
mod compression;
mod dictionary;
mod encryption;
mod flush;
mod layout;
pub mod metadata;
mod options;
mod output;
mod page;
pub mod reader;
mod sink;
mod stream;
mod stripe_cache;
#[cfg(test)]
mod tests;
mod validation;
mod writer;

pub use compression::*;
pub use dictionary::*;
pub use encryption::*;
pub use flush::*;
pub use forever_constant::*;
pub use layout::*;
pub use options::*;
pub use output::*;
pub use page::*;
pub use sink::*;
pub use stream::*;
pub use stripe_cache::*;
pub use validation::*;
pub use writer::*;

/// The user metadata key under which the writer records its version.
pub const WRITER_VERSION_METADATA_KEY: &str = "dwrf.writer.version";

/// Constants that will never change (i.e., doing so would break backwards compatibility)
mod forever_constant {
    /// The magic bytes at the start of every file.
    pub const MAGIC: [u8; 3] = *b"ORC";

    /// The maximum serialized size of the postscript; its length must fit
    /// the single trailing byte.
    pub const MAX_POSTSCRIPT_SIZE: usize = 255;

    /// The size of the compression chunk header in bytes.
    pub const COMPRESSION_HEADER_SIZE: usize = 3;

    #[cfg(test)]
    mod test {
        use super::*;

        #[test]
        fn never_change_these_constants() {
            assert_eq!(MAGIC, *b"ORC");
            assert_eq!(MAX_POSTSCRIPT_SIZE, 255);
            assert_eq!(COMPRESSION_HEADER_SIZE, 3);
        }
    }
}
