//! Zlib chunks via `flate2`, optionally primed with a preset dictionary.
//!
//! A stored zlib dictionary is a little-endian u16 length, at most 32 KiB of
//! dictionary bytes and the big-endian Adler-32 of those bytes. Chunks refer
//! to it through their secondary resource and never use a tertiary one.

use std::io::{self, BufRead, BufReader, Read};
use std::sync::Arc;

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::codec::dict;
use crate::codec::{Codec, CodecReader, CodecWriter, Compressed};
use crate::index::node::TAG_NO_RESOURCE;
use crate::index::Chunk;
use crate::range::Range;
use crate::source::{ReadAt, Section};
use crate::{Error, Result};

/// Deflate's window: older history can never be referenced.
pub const MAX_DICTIONARY_LEN: usize = 32 * 1024;

/// The trailing [`MAX_DICTIONARY_LEN`] bytes of a resource.
fn suffix_32k(raw: &[u8]) -> &[u8] {
    &raw[raw.len().saturating_sub(MAX_DICTIONARY_LEN)..]
}

fn adler32(data: &[u8]) -> u32 {
    const MOD: u32 = 65521;
    // Largest run that cannot overflow `b` before reducing.
    const NMAX: usize = 5552;
    let (mut a, mut b) = (1u32, 0u32);
    for run in data.chunks(NMAX) {
        for &byte in run {
            a += u32::from(byte);
            b += a;
        }
        a %= MOD;
        b %= MOD;
    }
    (b << 16) | a
}

/// Stored form of a zlib dictionary resource.
pub fn wrap_resource(raw: &[u8]) -> Vec<u8> {
    let dict = suffix_32k(raw);
    let mut wrapped = Vec::with_capacity(dict.len() + 6);
    // 32 KiB fits in a u16.
    wrapped.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    wrapped.extend_from_slice(dict);
    wrapped.extend_from_slice(&adler32(dict).to_be_bytes());
    wrapped
}

/// Loads zlib dictionaries, keeping the most recent one.
#[derive(Debug, Default, Clone)]
struct DictionaryCache {
    range: Range,
    dict: Vec<u8>,
}

impl DictionaryCache {
    fn load(&mut self, source: &dyn ReadAt, chunk: &Chunk) -> Result<Option<Vec<u8>>> {
        if !chunk.c_tertiary.is_empty() {
            return Err(Error::InvalidDictionary("unexpected tertiary resource"));
        }
        let range = chunk.c_secondary;
        if range.is_empty() {
            return Ok(None);
        }
        if range == self.range {
            return Ok(Some(self.dict.clone()));
        }
        if range.size() < 6 || chunk.t_tag != TAG_NO_RESOURCE {
            return Err(Error::InvalidDictionary("malformed resource"));
        }

        let mut header = [0u8; 2];
        source.read_exact_at(&mut header, range.lo)?;
        let len = u16::from_le_bytes(header) as u64;
        if len + 6 > range.size() {
            return Err(Error::InvalidDictionary("bad length"));
        }

        self.range = Range::default();
        self.dict.clear();
        self.dict.resize(len as usize + 4, 0);
        source.read_exact_at(&mut self.dict, range.lo + 2)?;
        let (dict, trailer) = self.dict.split_at(len as usize);
        let want = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if adler32(dict) != want {
            return Err(Error::InvalidDictionary("checksum mismatch"));
        }
        self.dict.truncate(len as usize);
        self.range = range;
        Ok(Some(self.dict.clone()))
    }
}

/// Inflates one chunk's zlib stream, stopping at its end even when the
/// CSpace range runs on into other data.
struct Inflater {
    input: BufReader<Section>,
    inflate: Decompress,
    dictionary: Option<Vec<u8>>,
    done: bool,
}

impl Inflater {
    fn new(input: Section, dictionary: Option<Vec<u8>>) -> Self {
        Self {
            input: BufReader::new(input),
            inflate: Decompress::new(true),
            dictionary,
            done: false,
        }
    }
}

impl Read for Inflater {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.done {
            return Ok(0);
        }
        loop {
            let input = self.input.fill_buf()?;
            let eof = input.is_empty();
            let (in_before, out_before) = (self.inflate.total_in(), self.inflate.total_out());
            let status = self.inflate.decompress(input, buf, FlushDecompress::None);
            let consumed = (self.inflate.total_in() - in_before) as usize;
            let produced = (self.inflate.total_out() - out_before) as usize;
            self.input.consume(consumed);

            match status {
                Ok(Status::StreamEnd) => {
                    self.done = true;
                    return Ok(produced);
                }
                Ok(_) if produced > 0 => return Ok(produced),
                Ok(_) if consumed > 0 => {}
                Ok(_) if eof => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "zlib stream ends early",
                    ))
                }
                Ok(_) => {
                    return Err(io::Error::new(io::ErrorKind::InvalidData, "zlib stream stalled"))
                }
                Err(err) if err.needs_dictionary().is_some() => match self.dictionary.take() {
                    Some(dictionary) => {
                        self.inflate.set_dictionary(&dictionary)?;
                    }
                    None => {
                        let err = Error::InvalidDictionary("zlib stream needs a dictionary");
                        return Err(err.into());
                    }
                },
                Err(err) => return Err(err.into()),
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct ZlibReader {
    dictionaries: DictionaryCache,
}

impl CodecReader for ZlibReader {
    fn accepts(&self, codec: Codec) -> bool {
        codec == Codec::ZLIB
    }

    fn clone_box(&self) -> Box<dyn CodecReader> {
        Box::new(ZlibReader::default())
    }

    fn make_decompressor(
        &mut self,
        source: &Arc<dyn ReadAt>,
        chunk: &Chunk,
    ) -> Result<Box<dyn Read + Send>> {
        let dictionary = self.dictionaries.load(&**source, chunk)?;
        let section = Section::new(Arc::clone(source), chunk.c_primary);
        Ok(Box::new(Inflater::new(section, dictionary)))
    }
}

#[derive(Debug, Clone)]
pub struct ZlibWriter {
    level: Compression,
}

impl ZlibWriter {
    /// `level` ranges from 0 (store) to 9 (best).
    pub fn new(level: u32) -> Self {
        Self {
            level: Compression::new(level.min(9)),
        }
    }

    fn deflate(&self, data: &[u8], dictionary: Option<&[u8]>) -> Result<Vec<u8>> {
        let mut deflate = Compress::new(self.level, true);
        if let Some(dictionary) = dictionary {
            deflate.set_dictionary(suffix_32k(dictionary)).map_err(io::Error::from)?;
        }
        let mut out = Vec::with_capacity(data.len() / 2 + 64);
        loop {
            if out.len() == out.capacity() {
                out.reserve(out.capacity().max(64));
            }
            let consumed = deflate.total_in() as usize;
            let status = deflate
                .compress_vec(&data[consumed..], &mut out, FlushCompress::Finish)
                .map_err(io::Error::from)?;
            if status == Status::StreamEnd {
                return Ok(out);
            }
        }
    }
}

impl Default for ZlibWriter {
    fn default() -> Self {
        Self {
            level: Compression::default(),
        }
    }
}

impl CodecWriter for ZlibWriter {
    fn compress(&mut self, data: &[u8], resources: &[Vec<u8>]) -> Result<Compressed> {
        dict::compress_with_best_dictionary(data, resources, Codec::ZLIB, |data, dictionary| {
            self.deflate(data, dictionary)
        })
    }

    fn wrap_resource(&mut self, raw: &[u8]) -> Result<Vec<u8>> {
        Ok(wrap_resource(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(c_primary: Range, c_secondary: Range) -> Chunk {
        let end = c_primary.hi.max(c_secondary.hi);
        Chunk {
            d_range: Range::new(0, 1 << 20),
            c_primary,
            c_secondary,
            c_tertiary: Range::new(end, end),
            s_tag: if c_secondary.is_empty() { TAG_NO_RESOURCE } else { 0 },
            t_tag: TAG_NO_RESOURCE,
            codec: Codec::ZLIB,
        }
    }

    fn inflate(file: Vec<u8>, chunk: &Chunk) -> io::Result<Vec<u8>> {
        let source: Arc<dyn ReadAt> = Arc::new(file);
        let mut out = Vec::new();
        ZlibReader::default()
            .make_decompressor(&source, chunk)
            .expect("decompressor")
            .read_to_end(&mut out)?;
        Ok(out)
    }

    #[test]
    fn adler32_known_values() {
        assert_eq!(adler32(b""), 1);
        assert_eq!(adler32(b"Wikipedia"), 0x11E6_0398);
        // Long enough to need the periodic reduction.
        let long = vec![0xFFu8; 20_000];
        let (mut a, mut b) = (1u64, 0u64);
        for &byte in &long {
            a = (a + byte as u64) % 65521;
            b = (b + a) % 65521;
        }
        assert_eq!(adler32(&long), ((b << 16) | a) as u32);
    }

    #[test]
    fn compressed_chunk_decompresses() {
        let data = b"zlib zlib zlib zlib zlib zlib zlib".repeat(10);
        let compressed = ZlibWriter::default()
            .compress(&data, &[])
            .expect("compress");
        assert_eq!(compressed.codec, Codec::ZLIB);
        assert_eq!(compressed.secondary, None);
        assert!(compressed.bytes.len() < data.len());

        let len = compressed.bytes.len() as u64;
        let out = inflate(compressed.bytes, &chunk(Range::new(0, len), Range::new(len, len)))
            .expect("read");
        assert_eq!(out, data);
    }

    #[test]
    fn trailing_bytes_after_the_stream_are_ignored() {
        let data = b"0123456789".repeat(40);
        let mut file = ZlibWriter::default()
            .compress(&data, &[])
            .expect("compress")
            .bytes;
        file.extend_from_slice(b"next chunk's bytes");
        let len = file.len() as u64;
        let out = inflate(file, &chunk(Range::new(0, len), Range::new(len, len))).expect("read");
        assert_eq!(out, data);
    }

    #[test]
    fn truncated_stream_is_unexpected_eof() {
        let data: Vec<u8> = (0..4000u32).map(|i| (i * 31 % 251) as u8).collect();
        let mut file = ZlibWriter::default()
            .compress(&data, &[])
            .expect("compress")
            .bytes;
        file.truncate(file.len() / 2);
        let len = file.len() as u64;
        let err = inflate(file, &chunk(Range::new(0, len), Range::new(len, len)))
            .expect_err("truncated");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn dictionary_chunk_round_trips() {
        let mut writer = ZlibWriter::default();
        let mut state = 0x9E37_79B9u32;
        let dictionary: Vec<u8> = (0..3000)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();
        let data = dictionary.repeat(2);
        let compressed = writer
            .compress(&data, &[b"unrelated".to_vec(), dictionary.clone()])
            .expect("compress");
        assert_eq!(compressed.secondary, Some(1));

        // Layout: wrapped dictionary, then the chunk.
        let mut file = writer.wrap_resource(&dictionary).expect("wrap");
        assert_eq!(file.len(), dictionary.len() + 6);
        let dict_end = file.len() as u64;
        file.extend_from_slice(&compressed.bytes);
        let file_end = file.len() as u64;
        let chunk = chunk(Range::new(dict_end, file_end), Range::new(0, dict_end));
        assert_eq!(inflate(file, &chunk).expect("read"), data);
    }

    #[test]
    fn long_resources_keep_their_last_32k() {
        let raw: Vec<u8> = (0..40_000u32).map(|i| (i % 199) as u8).collect();
        let wrapped = wrap_resource(&raw);
        assert_eq!(&wrapped[..2], &(32 * 1024u16).to_le_bytes());
        assert_eq!(&wrapped[2..wrapped.len() - 4], &raw[raw.len() - 32 * 1024..]);
    }

    #[test]
    fn corrupt_dictionary_is_rejected() {
        let mut file = wrap_resource(b"some dictionary bytes");
        file[5] ^= 0x40;
        let end = file.len() as u64;
        let err = DictionaryCache::default()
            .load(&file, &chunk(Range::new(end, end), Range::new(0, end)))
            .expect_err("checksum");
        assert!(matches!(err, Error::InvalidDictionary("checksum mismatch")));
    }

    #[test]
    fn missing_dictionary_is_reported() {
        let dictionary = b"a dictionary that the data leans on heavily ".repeat(20);
        let data = dictionary.repeat(3);
        let bytes = ZlibWriter::default()
            .deflate(&data, Some(dictionary.as_slice()))
            .expect("deflate");
        let len = bytes.len() as u64;
        let err = inflate(bytes, &chunk(Range::new(0, len), Range::new(len, len)))
            .expect_err("no dictionary");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("dictionary"), "{err}");
    }
}
