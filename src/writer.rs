use std::io::{self, Cursor, Read, Seek, Write};

use crate::codec::{CodecWriter, Compressed};
use crate::config::{Chunking, WriterConfig};
use crate::index::{ChunkWriter, Resource};
use crate::{Error, Result};

/// Input tried for one chunk when cutting by compressed size never grows past
/// this.
const MAX_TARGET_DCHUNK_SIZE: usize = 1 << 31;

/// Compressing writer: cuts its input into chunks, compresses each with a
/// [`CodecWriter`] and lays them out with a [`ChunkWriter`].
///
/// Chunks either hold a fixed amount of input or, with a cchunk size, as much
/// input as compresses to at most that many bytes.
///
/// Trailing zero bytes of each chunk are not compressed. The chunk still
/// declares its full size and readers serve the tail as zeroes.
pub struct Writer<W: Write, C: CodecWriter, T: Read + Write + Seek = Cursor<Vec<u8>>> {
    chunks: ChunkWriter<W, T>,
    codec: C,
    chunking: Chunking,
    /// Input tried for the next chunk when cutting by compressed size.
    target: usize,
    pending: Vec<u8>,
    resources: Vec<Vec<u8>>,
    handles: Vec<Option<Resource>>,
    err: Option<Error>,
}

impl<W: Write, C: CodecWriter> Writer<W, C> {
    pub fn new(writer: W, codec: C, config: &WriterConfig) -> Result<Self> {
        let chunks = ChunkWriter::new(writer, config)?;
        Self::build(chunks, codec, config)
    }
}

impl<W: Write, C: CodecWriter, T: Read + Write + Seek> Writer<W, C, T> {
    /// Index-at-start writer staging compressed data in `temp`.
    pub fn with_temp_file(writer: W, codec: C, temp: T, config: &WriterConfig) -> Result<Self> {
        let chunks = ChunkWriter::with_temp_file(writer, temp, config)?;
        Self::build(chunks, codec, config)
    }

    fn build(chunks: ChunkWriter<W, T>, codec: C, config: &WriterConfig) -> Result<Self> {
        let chunking = config.chunking()?;
        let (capacity, target) = match chunking {
            Chunking::Decompressed(size) => (size, 0),
            Chunking::Compressed(size) => {
                let target = size.saturating_mul(2).min(MAX_TARGET_DCHUNK_SIZE);
                (target, target)
            }
        };
        Ok(Self {
            chunks,
            codec,
            chunking,
            target,
            pending: Vec::with_capacity(capacity),
            resources: Vec::new(),
            handles: Vec::new(),
            err: None,
        })
    }

    /// Offers shared resources (e.g. dictionaries) to the codec. Each one is
    /// written only once some chunk actually uses it.
    pub fn with_resources(mut self, resources: Vec<Vec<u8>>) -> Self {
        self.handles = vec![None; resources.len()];
        self.resources = resources;
        self
    }

    /// Flushes the buffered input and writes the index.
    pub fn close(&mut self) -> Result<()> {
        self.check()?;
        let result = match self.chunking {
            Chunking::Decompressed(_) => {
                let pending = std::mem::take(&mut self.pending);
                if pending.is_empty() {
                    Ok(())
                } else {
                    self.write_chunk(&pending)
                }
            }
            Chunking::Compressed(limit) => self.cut_compressed(limit, true),
        };
        let result = result.and_then(|()| self.chunks.close());
        self.err = Some(match &result {
            Ok(()) => Error::Closed,
            Err(err) => err.clone(),
        });
        result
    }

    /// Closes and returns the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.close()?;
        Ok(self.chunks.into_inner())
    }

    fn check(&self) -> Result<()> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn sticky<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(err) = &result {
            self.err = Some(err.clone());
        }
        result
    }

    fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        let result = Self::encode(&mut self.codec, &self.resources, data)
            .and_then(|compressed| self.emit(data.len(), compressed));
        self.sticky(result)
    }

    /// Compresses `data` minus its trailing zeroes.
    fn encode(codec: &mut C, resources: &[Vec<u8>], data: &[u8]) -> Result<Compressed> {
        let end = data.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
        codec.compress(&data[..end], resources)
    }

    /// Adds a chunk of `d_len` input bytes, writing the resources it uses.
    fn emit(&mut self, d_len: usize, compressed: Compressed) -> Result<()> {
        let secondary = compressed
            .secondary
            .map(|i| self.resource_handle(i))
            .transpose()?;
        let tertiary = compressed
            .tertiary
            .map(|i| self.resource_handle(i))
            .transpose()?;
        self.chunks
            .add_chunk(d_len as u64, compressed.codec, &compressed.bytes, secondary, tertiary)
    }

    /// Cuts chunks off the front of `pending` whose compressed form fits in
    /// `limit` bytes. Before `eof`, input that could still join a chunk stays
    /// buffered.
    fn cut_compressed(&mut self, limit: usize, eof: bool) -> Result<()> {
        while !self.pending.is_empty() {
            if !eof && self.pending.len() < self.target {
                return Ok(());
            }
            let take = self.pending.len().min(self.target);
            let compressed = Self::encode(&mut self.codec, &self.resources, &self.pending[..take])?;
            if compressed.bytes.len() <= limit {
                let everything = take == self.pending.len();
                if (eof && everything) || self.target >= MAX_TARGET_DCHUNK_SIZE {
                    self.emit(take, compressed)?;
                    self.pending.drain(..take);
                } else {
                    self.target = self.target.saturating_mul(2).min(MAX_TARGET_DCHUNK_SIZE);
                }
                continue;
            }
            let (len, compressed) = self.longest_fitting_prefix(take, limit)?;
            log::trace!("rac cchunk: {len} of {take} input bytes fit in {limit}");
            self.emit(len, compressed)?;
            self.pending.drain(..len);
        }
        Ok(())
    }

    /// Binary search for the longest prefix of `pending[..too_long]` that
    /// compresses to at most `limit` bytes.
    fn longest_fitting_prefix(
        &mut self,
        too_long: usize,
        limit: usize,
    ) -> Result<(usize, Compressed)> {
        let (mut lo, mut hi) = (0, too_long);
        let mut best = None;
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            let compressed = Self::encode(&mut self.codec, &self.resources, &self.pending[..mid])?;
            if compressed.bytes.len() <= limit {
                lo = mid;
                best = Some(compressed);
            } else {
                hi = mid;
            }
        }
        match best {
            Some(compressed) => Ok((lo, compressed)),
            None => Err(Error::InvalidArgument("cchunk size is too small")),
        }
    }

    fn resource_handle(&mut self, i: usize) -> Result<Resource> {
        let slot = self
            .handles
            .get(i)
            .copied()
            .ok_or(Error::Internal("codec chose an unknown resource"))?;
        if let Some(handle) = slot {
            return Ok(handle);
        }
        let wrapped = self.codec.wrap_resource(&self.resources[i])?;
        let handle = self.chunks.add_resource(&wrapped)?;
        self.handles[i] = Some(handle);
        log::debug!("rac resource {i} written ({} bytes)", wrapped.len());
        Ok(handle)
    }

    fn write_fixed(&mut self, size: usize, mut buf: &[u8]) -> Result<()> {
        if !self.pending.is_empty() {
            let take = (size - self.pending.len()).min(buf.len());
            self.pending.extend_from_slice(&buf[..take]);
            buf = &buf[take..];
            if self.pending.len() == size {
                let mut piece = std::mem::take(&mut self.pending);
                self.write_chunk(&piece)?;
                piece.clear();
                self.pending = piece;
            }
        }
        while buf.len() >= size {
            self.write_chunk(&buf[..size])?;
            buf = &buf[size..];
        }
        self.pending.extend_from_slice(buf);
        Ok(())
    }
}

impl<W: Write, C: CodecWriter, T: Read + Write + Seek> Write for Writer<W, C, T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check()?;
        match self.chunking {
            Chunking::Decompressed(size) => self.write_fixed(size, buf)?,
            Chunking::Compressed(limit) => {
                self.pending.extend_from_slice(buf);
                let result = self.cut_compressed(limit, false);
                self.sticky(result)?;
            }
        }
        Ok(buf.len())
    }

    /// Chunk boundaries depend only on the input, so flushing does not cut a
    /// short chunk.
    fn flush(&mut self) -> io::Result<()> {
        self.check()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::codec::{Codec, Compressed};
    use crate::index::ChunkReader;
    use crate::source::ReadAt;

    /// Stores chunks verbatim and always picks the first resource, if any.
    struct Verbatim;

    impl CodecWriter for Verbatim {
        fn compress(&mut self, data: &[u8], resources: &[Vec<u8>]) -> Result<Compressed> {
            Ok(Compressed {
                codec: Codec::long(0x5645_5242),
                bytes: data.to_vec(),
                secondary: (!resources.is_empty()).then_some(0),
                tertiary: None,
            })
        }

        fn wrap_resource(&mut self, raw: &[u8]) -> Result<Vec<u8>> {
            Ok(raw.to_vec())
        }
    }

    fn config(dchunk_size: usize) -> WriterConfig {
        WriterConfig {
            dchunk_size,
            ..WriterConfig::default()
        }
    }

    #[test]
    fn input_is_cut_into_fixed_chunks() {
        let mut writer = Writer::new(Vec::new(), Verbatim, &config(4)).expect("writer");
        writer.write_all(b"abcde").expect("write");
        writer.write_all(b"fghij").expect("write");
        let bytes = writer.finish().expect("finish");

        let source: Arc<dyn ReadAt> = Arc::new(bytes);
        let chunks: Vec<_> = ChunkReader::new(source)
            .expect("open")
            .collect::<Result<_>>()
            .expect("chunks");
        let sizes: Vec<u64> = chunks.iter().map(|c| c.d_range.size()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(chunks.iter().all(|c| c.codec == Codec::long(0x5645_5242)));
    }

    #[test]
    fn trailing_zeroes_are_not_stored() {
        let mut writer = Writer::new(Vec::new(), Verbatim, &config(8)).expect("writer");
        writer.write_all(b"ab\0\0\0\0\0\0").expect("write");
        let bytes = writer.finish().expect("finish");

        // Prefix, the two stored bytes and a root of arity 2 (codec entry
        // plus one chunk).
        assert_eq!(bytes.len(), 4 + 2 + 48);
        let source: Arc<dyn ReadAt> = Arc::new(bytes.clone());
        let chunk = ChunkReader::new(source)
            .expect("open")
            .next_chunk()
            .expect("next")
            .expect("chunk");
        assert_eq!(chunk.d_range.size(), 8);
        let lo = chunk.c_primary.lo as usize;
        assert_eq!(&bytes[lo..lo + 2], b"ab");
    }

    #[test]
    fn resources_are_written_when_first_used() {
        let mut writer = Writer::new(Vec::new(), Verbatim, &config(4))
            .expect("writer")
            .with_resources(vec![b"dict".to_vec()]);
        writer.write_all(b"12345678").expect("write");
        let bytes = writer.finish().expect("finish");

        let source: Arc<dyn ReadAt> = Arc::new(bytes.clone());
        let chunks: Vec<_> = ChunkReader::new(source)
            .expect("open")
            .collect::<Result<_>>()
            .expect("chunks");
        assert_eq!(chunks.len(), 2);
        // Both chunks share the single stored copy.
        assert_eq!(chunks[0].c_secondary, chunks[1].c_secondary);
        let lo = chunks[0].c_secondary.lo as usize;
        assert_eq!(&bytes[lo..lo + 4], b"dict");
    }

    #[test]
    fn writes_after_close_fail() {
        let mut writer = Writer::new(Vec::new(), Verbatim, &config(4)).expect("writer");
        writer.close().expect("close");
        assert!(matches!(writer.close(), Err(Error::Closed)));
        assert!(writer.write(b"x").is_err());
    }

    #[test]
    fn both_chunk_sizes_are_rejected() {
        let config = WriterConfig {
            dchunk_size: 4,
            cchunk_size: 4,
            ..WriterConfig::default()
        };
        assert!(matches!(
            Writer::new(Vec::new(), Verbatim, &config),
            Err(Error::InvalidArgument(_))
        ));
    }

    fn cchunk_config(cchunk_size: usize) -> WriterConfig {
        WriterConfig {
            cchunk_size,
            ..WriterConfig::default()
        }
    }

    fn chunk_sizes(bytes: Vec<u8>) -> Vec<(u64, u64)> {
        let source: Arc<dyn ReadAt> = Arc::new(bytes);
        ChunkReader::new(source)
            .expect("open")
            .map(|chunk| {
                let chunk = chunk.expect("chunk");
                (chunk.d_range.size(), chunk.c_primary.size())
            })
            .collect()
    }

    #[test]
    fn chunks_are_cut_by_compressed_size() {
        let mut writer = Writer::new(Vec::new(), Verbatim, &cchunk_config(5)).expect("writer");
        for piece in [&b"abc"[..], b"defgh", b"ijkl"] {
            writer.write_all(piece).expect("write");
        }
        let bytes = writer.finish().expect("finish");
        let d_sizes: Vec<u64> = chunk_sizes(bytes).iter().map(|&(d, _)| d).collect();
        assert_eq!(d_sizes, vec![5, 5, 2]);
    }

    #[test]
    fn compressible_runs_grow_one_chunk() {
        // Trailing zeroes compress to nothing, so the target keeps doubling
        // until the input runs out.
        let mut writer = Writer::new(Vec::new(), Verbatim, &cchunk_config(4)).expect("writer");
        writer.write_all(b"ab").expect("write");
        writer.write_all(&[0u8; 40]).expect("write");
        let bytes = writer.finish().expect("finish");
        let sizes = chunk_sizes(bytes);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].0, 42);
    }

    /// Adds a fixed header to every chunk.
    struct Framed;

    impl CodecWriter for Framed {
        fn compress(&mut self, data: &[u8], _resources: &[Vec<u8>]) -> Result<Compressed> {
            let mut bytes = b"HDR:".to_vec();
            bytes.extend_from_slice(data);
            Ok(Compressed {
                codec: Codec::long(0x4652_4d44),
                bytes,
                secondary: None,
                tertiary: None,
            })
        }

        fn wrap_resource(&mut self, raw: &[u8]) -> Result<Vec<u8>> {
            Ok(raw.to_vec())
        }
    }

    #[test]
    fn cchunk_size_below_codec_overhead_fails() {
        let mut writer = Writer::new(Vec::new(), Framed, &cchunk_config(4)).expect("writer");
        let err = writer.write_all(b"0123456789").expect_err("too small");
        assert!(err.to_string().contains("too small"), "{err}");
        // The failure is sticky.
        assert!(matches!(writer.close(), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn framed_chunks_stay_within_the_limit() {
        let mut writer = Writer::new(Vec::new(), Framed, &cchunk_config(10)).expect("writer");
        writer.write_all(b"the quick brown fox").expect("write");
        let sizes = chunk_sizes(writer.finish().expect("finish"));
        let d_sizes: Vec<u64> = sizes.iter().map(|&(d, _)| d).collect();
        assert_eq!(d_sizes, vec![6, 6, 6, 1]);
    }
}
