//! LZ4 chunks: each chunk is one LZ4 frame. No resources are used.

use std::io::{Read, Write};
use std::sync::Arc;

use lz4_flex::frame::{FrameDecoder, FrameEncoder};

use crate::codec::{Codec, CodecReader, CodecWriter, Compressed};
use crate::index::Chunk;
use crate::range::Range;
use crate::source::{ReadAt, Section};
use crate::{Error, Result};

const FRAME_MAGIC: u32 = 0x184D_2204;

const FLAG_DICT_ID: u8 = 0x01;
const FLAG_CONTENT_CHECKSUM: u8 = 0x04;
const FLAG_CONTENT_SIZE: u8 = 0x08;
const FLAG_BLOCK_CHECKSUM: u8 = 0x10;
const BLOCK_UNCOMPRESSED: u32 = 1 << 31;

/// The part of `range` holding its first LZ4 frame.
///
/// The frame decoder carries on into whatever follows a frame, and a chunk's
/// CSpace range may run on into other chunks. A frame that does not fit in
/// `range` is left for the decoder to report as truncated.
fn first_frame(source: &dyn ReadAt, range: Range) -> Result<Range> {
    let mut header = [0u8; 6];
    if range.size() < header.len() as u64 {
        return Ok(range);
    }
    source.read_exact_at(&mut header, range.lo)?;
    if u32::from_le_bytes([header[0], header[1], header[2], header[3]]) != FRAME_MAGIC {
        return Err(Error::InvalidChunk("not an lz4 frame"));
    }
    let flags = header[4];
    let mut pos = range.lo + 7;
    if flags & FLAG_CONTENT_SIZE != 0 {
        pos += 8;
    }
    if flags & FLAG_DICT_ID != 0 {
        pos += 4;
    }
    let block_trailer = if flags & FLAG_BLOCK_CHECKSUM != 0 { 4 } else { 0 };

    let mut word = [0u8; 4];
    loop {
        if pos + 4 > range.hi {
            return Ok(range);
        }
        source.read_exact_at(&mut word, pos)?;
        pos += 4;
        let block = u32::from_le_bytes(word);
        if block == 0 {
            break;
        }
        pos += u64::from(block & !BLOCK_UNCOMPRESSED) + block_trailer;
    }
    if flags & FLAG_CONTENT_CHECKSUM != 0 {
        pos += 4;
    }
    Ok(Range::new(range.lo, pos.min(range.hi)))
}

#[derive(Debug, Default, Clone)]
pub struct Lz4Reader;

impl CodecReader for Lz4Reader {
    fn accepts(&self, codec: Codec) -> bool {
        codec == Codec::LZ4
    }

    fn clone_box(&self) -> Box<dyn CodecReader> {
        Box::new(Lz4Reader)
    }

    fn make_decompressor(
        &mut self,
        source: &Arc<dyn ReadAt>,
        chunk: &Chunk,
    ) -> Result<Box<dyn Read + Send>> {
        if !chunk.c_secondary.is_empty() || !chunk.c_tertiary.is_empty() {
            return Err(Error::InvalidChunk("lz4 chunks take no resources"));
        }
        let frame = first_frame(&**source, chunk.c_primary)?;
        Ok(Box::new(FrameDecoder::new(Section::new(Arc::clone(source), frame))))
    }
}

#[derive(Debug, Default, Clone)]
pub struct Lz4Writer;

impl CodecWriter for Lz4Writer {
    fn compress(&mut self, data: &[u8], _resources: &[Vec<u8>]) -> Result<Compressed> {
        let mut encoder = FrameEncoder::new(Vec::with_capacity(data.len() / 2 + 32));
        encoder.write_all(data)?;
        let bytes = encoder
            .finish()
            .map_err(|_| Error::Internal("lz4 frame encoding failed"))?;
        Ok(Compressed {
            codec: Codec::LZ4,
            bytes,
            secondary: None,
            tertiary: None,
        })
    }

    fn wrap_resource(&mut self, _raw: &[u8]) -> Result<Vec<u8>> {
        Err(Error::Unsupported("lz4 resources"))
    }
}
