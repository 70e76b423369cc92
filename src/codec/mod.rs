//! Codec identifiers and the pluggable compression capabilities.
//!
//! The container never compresses anything itself. Readers hand each chunk to
//! the first [`CodecReader`] that accepts its codec, and the compressing
//! [`Writer`](crate::Writer) asks a [`CodecWriter`] for the bytes of each chunk.

pub mod dict;
#[cfg(feature = "lz4")]
pub mod lz4;
#[cfg(feature = "zlib")]
pub mod zlib;
#[cfg(feature = "zstd")]
pub mod zstd;

use std::fmt;
use std::io::Read;
use std::sync::Arc;

use crate::index::Chunk;
use crate::source::ReadAt;
use crate::Result;

const LONG_BIT: u64 = 1 << 63;
const MIX_BIT: u64 = 1 << 62;
const LOW_56_BITS: u64 = (1 << 56) - 1;

/// Compression codec identifier.
///
/// Short codecs live in the top byte. Long codecs set the high bit and carry
/// 56 bits of payload, stored in a dedicated codec entry of each node.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Codec(pub u64);

impl Codec {
    pub const ZEROES: Codec = Codec(0x00 << 56);
    pub const ZLIB: Codec = Codec(0x01 << 56);
    pub const LZ4: Codec = Codec(0x02 << 56);
    pub const ZSTANDARD: Codec = Codec(0x04 << 56);
    pub const INVALID: Codec = Codec(u64::MAX);

    /// Builds a long codec from its 56-bit payload.
    pub const fn long(payload: u64) -> Codec {
        Codec(LONG_BIT | (payload & LOW_56_BITS))
    }

    pub fn is_long(self) -> bool {
        self.0 & LONG_BIT != 0
    }

    pub fn is_valid(self) -> bool {
        if self.is_long() {
            self.0 & !(LONG_BIT | LOW_56_BITS) == 0
        } else {
            self.0 & (MIX_BIT | LOW_56_BITS) == 0
        }
    }

    /// The byte stored next to a node's DPtrMax, before any mix bit.
    pub(crate) fn high_byte(self) -> u8 {
        if self.is_long() {
            0x80
        } else {
            (self.0 >> 56) as u8
        }
    }

    pub(crate) fn payload(self) -> u64 {
        self.0 & LOW_56_BITS
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Codec::ZEROES => f.write_str("Zeroes"),
            Codec::ZLIB => f.write_str("Zlib"),
            Codec::LZ4 => f.write_str("Lz4"),
            Codec::ZSTANDARD => f.write_str("Zstandard"),
            Codec(value) => write!(f, "Codec({value:#018x})"),
        }
    }
}

/// Decompression side of a codec.
pub trait CodecReader: Send {
    fn accepts(&self, codec: Codec) -> bool;

    /// Fresh instance for another reader, e.g. a concurrent worker.
    fn clone_box(&self) -> Box<dyn CodecReader>;

    /// Returns a reader producing the chunk's decompressed bytes. It may
    /// produce fewer bytes than the chunk's DRange; the rest reads as zeroes.
    fn make_decompressor(
        &mut self,
        source: &Arc<dyn ReadAt>,
        chunk: &Chunk,
    ) -> Result<Box<dyn Read + Send>>;
}

/// Output of [`CodecWriter::compress`].
#[derive(Debug, Clone)]
pub struct Compressed {
    pub codec: Codec,
    pub bytes: Vec<u8>,
    /// Index into the resources passed to `compress`.
    pub secondary: Option<usize>,
    pub tertiary: Option<usize>,
}

/// Compression side of a codec.
pub trait CodecWriter: Send {
    fn compress(&mut self, data: &[u8], resources: &[Vec<u8>]) -> Result<Compressed>;

    /// Converts raw resource bytes (e.g. a dictionary) into their stored form.
    fn wrap_resource(&mut self, raw: &[u8]) -> Result<Vec<u8>>;
}

/// Decompressor for chunks whose codec is [`Codec::ZEROES`]: produces nothing,
/// so the whole DRange reads as zeroes.
#[derive(Debug, Default, Clone)]
pub struct ZeroesReader;

impl CodecReader for ZeroesReader {
    fn accepts(&self, codec: Codec) -> bool {
        codec == Codec::ZEROES
    }

    fn clone_box(&self) -> Box<dyn CodecReader> {
        Box::new(ZeroesReader)
    }

    fn make_decompressor(
        &mut self,
        _source: &Arc<dyn ReadAt>,
        _chunk: &Chunk,
    ) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(std::io::empty()))
    }
}

/// The codec readers compiled into this build, zeroes included.
pub fn default_readers() -> Vec<Box<dyn CodecReader>> {
    let mut readers: Vec<Box<dyn CodecReader>> = vec![Box::new(ZeroesReader)];
    #[cfg(feature = "zlib")]
    readers.push(Box::new(zlib::ZlibReader::default()));
    #[cfg(feature = "lz4")]
    readers.push(Box::new(lz4::Lz4Reader));
    #[cfg(feature = "zstd")]
    readers.push(Box::new(zstd::ZstdReader::default()));
    readers
}
