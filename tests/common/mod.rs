#![allow(dead_code)]

use std::io::{self, Read};
use std::sync::Arc;

use rac::{Chunk, ChunkReader, Codec, CodecReader, CodecWriter, Compressed, ReadAt, Section};

/// Test codec: a little-endian u32 length followed by the raw bytes.
pub const STORED: Codec = Codec::long(0x53_544f_5245_44);

pub fn stored(data: &[u8]) -> Vec<u8> {
    let mut out = (data.len() as u32).to_le_bytes().to_vec();
    out.extend_from_slice(data);
    out
}

#[derive(Default)]
pub struct StoredReader;

impl CodecReader for StoredReader {
    fn accepts(&self, codec: Codec) -> bool {
        codec == STORED
    }

    fn clone_box(&self) -> Box<dyn CodecReader> {
        Box::new(StoredReader)
    }

    fn make_decompressor(
        &mut self,
        source: &Arc<dyn ReadAt>,
        chunk: &Chunk,
    ) -> rac::Result<Box<dyn Read + Send>> {
        Ok(Box::new(StoredDecompressor {
            section: Section::new(Arc::clone(source), chunk.c_primary),
            remaining: None,
        }))
    }
}

struct StoredDecompressor {
    section: Section,
    remaining: Option<u64>,
}

impl Read for StoredDecompressor {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = match self.remaining {
            Some(remaining) => remaining,
            None => {
                let mut header = [0u8; 4];
                self.section.read_exact(&mut header)?;
                u32::from_le_bytes(header) as u64
            }
        };
        self.remaining = Some(remaining);
        if remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let want = remaining.min(buf.len() as u64) as usize;
        let n = self.section.read(&mut buf[..want])?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stored chunk is truncated",
            ));
        }
        self.remaining = Some(remaining - n as u64);
        Ok(n)
    }
}

#[derive(Default)]
pub struct StoredWriter;

impl CodecWriter for StoredWriter {
    fn compress(&mut self, data: &[u8], _resources: &[Vec<u8>]) -> rac::Result<Compressed> {
        Ok(Compressed {
            codec: STORED,
            bytes: stored(data),
            secondary: None,
            tertiary: None,
        })
    }

    fn wrap_resource(&mut self, raw: &[u8]) -> rac::Result<Vec<u8>> {
        Ok(raw.to_vec())
    }
}

pub fn stored_readers() -> Vec<Box<dyn CodecReader>> {
    vec![Box::new(StoredReader)]
}

/// Parses whitespace-separated hex bytes.
pub fn hex(text: &str) -> Vec<u8> {
    text.split_whitespace()
        .map(|b| u8::from_str_radix(b, 16).expect("hex byte"))
        .collect()
}

pub fn source(bytes: Vec<u8>) -> Arc<dyn ReadAt> {
    Arc::new(bytes)
}

pub fn all_chunks(source: Arc<dyn ReadAt>) -> Vec<Chunk> {
    ChunkReader::new(source)
        .expect("open")
        .collect::<rac::Result<Vec<_>>>()
        .expect("chunks")
}

/// Up to `n` bytes of `bytes` starting at the range's lower bound.
pub fn snippet(bytes: &[u8], range: rac::Range, n: usize) -> Vec<u8> {
    if range.is_empty() {
        return Vec::new();
    }
    let lo = range.lo as usize;
    let hi = (range.hi as usize).min(lo + n).min(bytes.len());
    bytes[lo..hi].to_vec()
}
