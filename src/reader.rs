use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::codec::{default_readers, CodecReader};
use crate::conc_reader::ConcReader;
use crate::config::ReaderConfig;
use crate::index::ChunkReader;
use crate::range::Range;
use crate::source::ReadAt;
use crate::{Error, Result};

/// Progress through the current chunk.
enum ChunkState {
    /// Nothing loaded; the next read asks the chunk reader for a chunk.
    NoChunk,
    /// Decompressed bytes are being served from the codec.
    Explicit(Box<dyn Read + Send>),
    /// The codec finished early; the rest of the chunk reads as zeroes.
    ImplicitZeroes,
}

/// Presents a container as one seekable decompressed byte stream.
///
/// With [`ReaderConfig::concurrency`] above one, reads are served by a pool
/// of decompression threads that prefetch the current region of interest.
/// Seeking cancels any prefetch in flight.
pub struct Reader {
    chunks: ChunkReader,
    codecs: Vec<Box<dyn CodecReader>>,
    err: Option<Error>,
    decompressed_size: u64,

    pos: u64,
    limit: u64,
    /// Decompressed range still owed by the current chunk. Its lower bound
    /// trails `pos` while a mid-chunk seek is being caught up on.
    d_range: Range,
    state: ChunkState,

    conc: Option<ConcReader>,
}

impl Reader {
    /// Opens a reader using the codecs compiled into this build.
    pub fn new(source: Arc<dyn ReadAt>, config: &ReaderConfig) -> Result<Self> {
        Self::with_codecs(source, default_readers(), config)
    }

    pub fn with_codecs(
        source: Arc<dyn ReadAt>,
        codecs: Vec<Box<dyn CodecReader>>,
        config: &ReaderConfig,
    ) -> Result<Self> {
        let chunks = ChunkReader::new(source)?;
        let decompressed_size = chunks.decompressed_size()?;
        let mut reader = Self {
            chunks,
            codecs,
            err: None,
            decompressed_size,
            pos: 0,
            limit: decompressed_size,
            d_range: Range::default(),
            state: ChunkState::NoChunk,
            conc: None,
        };
        if config.concurrency > 1 {
            reader.conc = Some(ConcReader::spawn(&reader, config)?);
        }
        Ok(reader)
    }

    /// A single-threaded reader over the same container, positioned at 0.
    pub(crate) fn serial_clone(&self) -> Reader {
        Reader {
            chunks: self.chunks.clone(),
            codecs: self.codecs.iter().map(|codec| codec.clone_box()).collect(),
            err: None,
            decompressed_size: self.decompressed_size,
            pos: 0,
            limit: self.decompressed_size,
            d_range: Range::default(),
            state: ChunkState::NoChunk,
            conc: None,
        }
    }

    pub(crate) fn chunk_reader(&self) -> &ChunkReader {
        &self.chunks
    }

    pub fn decompressed_size(&self) -> Result<u64> {
        self.check()?;
        Ok(self.decompressed_size)
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    /// Positions the stream at `lo` and ends it at `hi` (clamped to the
    /// decompressed size). A later `seek` lifts the limit.
    pub fn seek_range(&mut self, lo: u64, hi: u64) -> Result<()> {
        self.check()?;
        if lo > hi {
            return Err(self.fail(Error::InvalidArgument("seek range has lo > hi")));
        }
        self.limit = hi.min(self.decompressed_size);
        self.seek_to(lo)?;
        Ok(())
    }

    /// Stops any decompression threads. Every later call fails with
    /// [`Error::Closed`].
    pub fn close(&mut self) -> Result<()> {
        self.conc = None;
        self.state = ChunkState::NoChunk;
        if self.err.is_none() {
            self.err = Some(Error::Closed);
        }
        Ok(())
    }

    fn check(&self) -> Result<()> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        self.err = Some(err.clone());
        err
    }

    pub(crate) fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.check()?;
        let result = match self.conc.as_mut() {
            Some(conc) => conc.read(buf),
            None => self.read_serial(buf),
        };
        match result {
            Ok(n) => {
                if let Some(conc) = &self.conc {
                    self.pos = conc.position();
                }
                Ok(n)
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    fn seek_from(&mut self, from: SeekFrom) -> Result<u64> {
        self.check()?;
        let target = match from {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => self.decompressed_size.checked_add_signed(delta),
        };
        let Some(target) = target else {
            return Err(self.fail(Error::InvalidArgument("seek position out of range")));
        };
        self.limit = self.decompressed_size;
        self.seek_to(target)
    }

    pub(crate) fn seek_to(&mut self, pos: u64) -> Result<u64> {
        if pos != self.pos {
            if let Err(err) = self.chunks.seek_to_chunk_containing(pos) {
                return Err(self.fail(err));
            }
            self.pos = pos;
            self.d_range = Range::new(pos, pos);
            self.state = ChunkState::NoChunk;
        }
        if let Some(conc) = self.conc.as_mut() {
            conc.seek(self.pos, self.limit);
        }
        Ok(self.pos)
    }

    fn read_serial(&mut self, buf: &mut [u8]) -> Result<usize> {
        let room = self.limit.saturating_sub(self.pos).min(buf.len() as u64) as usize;
        let buf = &mut buf[..room];
        let mut filled = 0;
        while filled < buf.len() {
            if self.pos < self.d_range.lo || self.d_range.hi < self.pos {
                return Err(Error::Internal("inconsistent position"));
            }
            let step = match self.state {
                ChunkState::NoChunk => match self.load_next_chunk() {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(err) => Err(err),
                },
                ChunkState::Explicit(_) => self.read_explicit(&mut buf[filled..]),
                ChunkState::ImplicitZeroes => Ok(self.read_implicit_zeroes(&mut buf[filled..])),
            };
            match step {
                Ok(n) => filled += n,
                // Hand back what was decoded; the error surfaces on the next call.
                Err(err) if filled > 0 => {
                    self.err = Some(err);
                    break;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(filled)
    }

    fn load_next_chunk(&mut self) -> Result<bool> {
        let Some(chunk) = self.chunks.next_chunk()? else {
            return Ok(false);
        };
        if chunk.d_range.is_empty() {
            return Err(Error::InvalidChunk("empty"));
        }
        let codec = self
            .codecs
            .iter_mut()
            .find(|codec| codec.accepts(chunk.codec))
            .ok_or(Error::UnsupportedCodec(chunk.codec.0))?;
        let decompressor = codec.make_decompressor(self.chunks.source(), &chunk)?;
        self.d_range = chunk.d_range;
        self.state = ChunkState::Explicit(decompressor);
        Ok(true)
    }

    fn read_explicit(&mut self, buf: &mut [u8]) -> Result<usize> {
        let ChunkState::Explicit(decompressor) = &mut self.state else {
            return Ok(0);
        };

        // Catch up with a seek that landed inside this chunk.
        while self.pos > self.d_range.lo {
            let want = (self.pos - self.d_range.lo).min(buf.len() as u64) as usize;
            let n = read_decompressed(decompressor, &mut buf[..want])?;
            if n == 0 {
                self.state = ChunkState::ImplicitZeroes;
                return Ok(0);
            }
            self.d_range.lo += n as u64;
        }

        let n = read_decompressed(decompressor, buf)?;
        if n == 0 {
            self.state = ChunkState::ImplicitZeroes;
            return Ok(0);
        }
        if n as u64 > self.d_range.size() {
            return Err(Error::InvalidChunk("too large"));
        }
        self.pos += n as u64;
        self.d_range.lo += n as u64;
        Ok(n)
    }

    fn read_implicit_zeroes(&mut self, buf: &mut [u8]) -> usize {
        if self.d_range.lo < self.pos {
            self.d_range.lo = self.pos;
        }
        let n = self.d_range.size().min(buf.len() as u64) as usize;
        buf[..n].fill(0);
        self.pos += n as u64;
        self.d_range.lo += n as u64;
        if self.d_range.is_empty() {
            self.state = ChunkState::NoChunk;
        }
        n
    }
}

fn read_decompressed(decompressor: &mut Box<dyn Read + Send>, buf: &mut [u8]) -> Result<usize> {
    loop {
        match decompressor.read(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(Error::InvalidChunk("truncated"))
            }
            Err(err) => return Err(err.into()),
        }
    }
}

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_inner(buf)?)
    }
}

impl Seek for Reader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.seek_from(pos)?)
    }
}
