//! RAC: a random access compression container.
//!
//! A container splits a logical (decompressed) byte stream into independently
//! compressed chunks and records where each one lives in a checksummed index
//! tree. Readers seek by walking that tree and decompress only the chunks they
//! need.
//!
//! - [`ChunkWriter`] / [`ChunkReader`] work at the level of already-compressed
//!   chunks and shared resources.
//! - [`Writer`] compresses an `io::Write` stream with a [`CodecWriter`].
//! - [`Reader`] is an `io::Read + io::Seek` view of the decompressed stream,
//!   optionally backed by a pool of decompression threads.

pub mod codec;
mod conc_reader;
pub mod config;
pub mod error;
pub mod index;
pub mod mmap;
pub mod range;
pub mod reader;
pub mod source;
pub mod writer;

pub use codec::{Codec, CodecReader, CodecWriter, Compressed};
pub use config::{Chunking, IndexLocation, ReaderConfig, WriterConfig};
pub use error::{Error, Result};
pub use index::{Chunk, ChunkReader, ChunkWriter, Resource};
pub use mmap::MmapSource;
pub use range::Range;
pub use reader::Reader;
pub use source::{ReadAt, Section};
pub use writer::Writer;
