//! Zstandard chunks, optionally compressed against a dictionary resource.

use std::io::{BufReader, Read};
use std::sync::Arc;

use zstd::stream::read::Decoder;

use crate::codec::dict::{self, DictionaryLoader};
use crate::codec::{Codec, CodecReader, CodecWriter, Compressed};
use crate::index::Chunk;
use crate::source::{ReadAt, Section};
use crate::Result;

#[derive(Debug, Default, Clone)]
pub struct ZstdReader {
    dictionaries: DictionaryLoader,
}

impl CodecReader for ZstdReader {
    fn accepts(&self, codec: Codec) -> bool {
        codec == Codec::ZSTANDARD
    }

    fn clone_box(&self) -> Box<dyn CodecReader> {
        Box::new(ZstdReader::default())
    }

    fn make_decompressor(
        &mut self,
        source: &Arc<dyn ReadAt>,
        chunk: &Chunk,
    ) -> Result<Box<dyn Read + Send>> {
        let section = BufReader::new(Section::new(Arc::clone(source), chunk.c_primary));
        let decoder = match self.dictionaries.load(&**source, chunk)? {
            Some(dictionary) => Decoder::with_dictionary(section, dictionary)?,
            None => Decoder::with_buffer(section)?,
        };
        Ok(Box::new(decoder.single_frame()))
    }
}

#[derive(Debug, Clone)]
pub struct ZstdWriter {
    level: i32,
}

impl ZstdWriter {
    pub fn new(level: i32) -> Self {
        Self { level }
    }
}

impl Default for ZstdWriter {
    fn default() -> Self {
        Self::new(zstd::DEFAULT_COMPRESSION_LEVEL)
    }
}

impl CodecWriter for ZstdWriter {
    fn compress(&mut self, data: &[u8], resources: &[Vec<u8>]) -> Result<Compressed> {
        let level = self.level;
        dict::compress_with_best_dictionary(data, resources, Codec::ZSTANDARD, |data, dictionary| {
            let bytes = match dictionary {
                Some(dictionary) => {
                    zstd::bulk::Compressor::with_dictionary(level, dictionary)?.compress(data)?
                }
                None => zstd::bulk::compress(data, level)?,
            };
            Ok(bytes)
        })
    }

    fn wrap_resource(&mut self, raw: &[u8]) -> Result<Vec<u8>> {
        dict::wrap_resource(raw)
    }
}
