//! Prefetching decompression on a pool of threads.
//!
//! A manager thread walks the chunk index over the current region of interest
//! and queues one work order per chunk. Workers decompress orders into
//! buffers from their own small pools and send the pieces back tagged with
//! their DSpace range. The consumer reorders pieces through a holding map
//! and returns each buffer to its worker once drained.
//!
//! Seeking runs a stop handshake: the consumer bumps the shared generation,
//! asks the manager to stop, and keeps recycling buffers until the manager
//! and every worker have acknowledged. Workers then park on a barrier until
//! the consumer releases them, so nothing stale is in flight when the next
//! region is announced.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender, SyncSender, TryRecvError};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::{self, JoinHandle};

use crate::config::ReaderConfig;
use crate::index::ChunkReader;
use crate::range::Range;
use crate::reader::Reader;
use crate::{Error, Result};

const MAX_WORKERS: usize = 1 << 16;

enum ManagerMsg {
    Region { range: Range, generation: u64 },
    Stop,
    Shutdown,
}

enum WorkerMsg {
    Work { range: Range, generation: u64 },
    Stop,
    Shutdown,
}

enum Response {
    Data {
        range: Range,
        buf: Vec<u8>,
        home: Sender<Vec<u8>>,
        generation: u64,
    },
    Failed {
        at: u64,
        err: Error,
        generation: u64,
    },
    Ack,
}

/// A decompressed piece waiting in the holding map.
enum Piece {
    Data {
        len: usize,
        buf: Vec<u8>,
        home: Sender<Vec<u8>>,
    },
    Failed(Error),
}

struct Current {
    buf: Vec<u8>,
    home: Sender<Vec<u8>>,
    index: usize,
    len: usize,
}

pub(crate) struct ConcReader {
    inbox: SyncSender<ManagerMsg>,
    responses: Receiver<Response>,
    generation: Arc<AtomicU64>,
    resume: Arc<Barrier>,
    workers: usize,
    threads: Vec<JoinHandle<()>>,

    holding: BTreeMap<u64, Piece>,
    current: Option<Current>,
    announced: bool,
    resolved: bool,
    pos: u64,
    limit: u64,
}

impl ConcReader {
    pub(crate) fn spawn(template: &Reader, config: &ReaderConfig) -> Result<Self> {
        let limit = template.decompressed_size()?;
        let workers = config.concurrency.clamp(1, MAX_WORKERS);
        let buffer_size = config.buffer_size.max(1);
        let buffers_per_worker = config.buffers_per_worker.max(1);

        let generation = Arc::new(AtomicU64::new(0));
        let resume = Arc::new(Barrier::new(workers + 1));
        let (inbox, manager_rx) = mpsc::sync_channel(1);
        let (work_tx, work_rx) = mpsc::sync_channel(workers);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let (response_tx, responses) = mpsc::channel();

        let mut threads = Vec::with_capacity(workers + 1);
        for id in 0..workers {
            let worker = Worker {
                reader: template.serial_clone(),
                queue: Arc::clone(&work_rx),
                responses: response_tx.clone(),
                generation: Arc::clone(&generation),
                resume: Arc::clone(&resume),
                buffer_size,
                buffers: buffers_per_worker,
            };
            let handle = thread::Builder::new()
                .name(format!("rac-worker-{id}"))
                .spawn(move || worker.run())?;
            threads.push(handle);
        }

        let manager = Manager {
            chunks: template.chunk_reader().clone(),
            inbox: manager_rx,
            work: work_tx,
            responses: response_tx,
            generation: Arc::clone(&generation),
            workers,
        };
        let handle = thread::Builder::new()
            .name("rac-manager".to_string())
            .spawn(move || manager.run())?;
        threads.push(handle);
        log::debug!("rac spawned {workers} decompression workers");

        Ok(Self {
            inbox,
            responses,
            generation,
            resume,
            workers,
            threads,
            holding: BTreeMap::new(),
            current: None,
            announced: false,
            resolved: false,
            pos: 0,
            limit,
        })
    }

    pub(crate) fn position(&self) -> u64 {
        self.pos
    }

    pub(crate) fn seek(&mut self, pos: u64, limit: u64) {
        if pos != self.pos || limit != self.limit {
            self.pos = pos;
            self.limit = limit;
            self.resolved = false;
        }
    }

    pub(crate) fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() || self.pos >= self.limit {
            return Ok(0);
        }
        if !self.resolved {
            if self.announced {
                self.stop()?;
            }
            self.announced = true;
            self.resolved = true;
            let generation = self.generation.load(Ordering::SeqCst);
            self.inbox
                .send(ManagerMsg::Region {
                    range: Range::new(self.pos, self.limit),
                    generation,
                })
                .map_err(|_| Error::Internal("decompression manager exited"))?;
        }

        let mut filled = 0;
        while filled < buf.len() && self.pos < self.limit {
            if let Some(current) = self.current.as_mut() {
                let n = (current.len - current.index).min(buf.len() - filled);
                let from = current.index;
                buf[filled..filled + n].copy_from_slice(&current.buf[from..from + n]);
                current.index += n;
                filled += n;
                self.pos += n as u64;
                if current.index == current.len {
                    if let Some(done) = self.current.take() {
                        let _ = done.home.send(done.buf);
                    }
                }
                continue;
            }

            match self.next_piece(filled == 0)? {
                None => break,
                Some(Piece::Data { len, buf, home }) => {
                    self.current = Some(Current {
                        buf,
                        home,
                        index: 0,
                        len,
                    });
                }
                Some(Piece::Failed(err)) => {
                    if filled == 0 {
                        return Err(err);
                    }
                    self.holding.insert(self.pos, Piece::Failed(err));
                    break;
                }
            }
        }
        Ok(filled)
    }

    /// The piece starting at the current position. Without `block`, returns
    /// `None` rather than wait for a worker.
    fn next_piece(&mut self, block: bool) -> Result<Option<Piece>> {
        let generation = self.generation.load(Ordering::SeqCst);
        loop {
            if let Some(piece) = self.holding.remove(&self.pos) {
                return Ok(Some(piece));
            }
            let response = if block {
                self.responses
                    .recv()
                    .map_err(|_| Error::Internal("decompression workers exited"))?
            } else {
                match self.responses.try_recv() {
                    Ok(response) => response,
                    Err(TryRecvError::Empty) => return Ok(None),
                    Err(TryRecvError::Disconnected) => {
                        return Err(Error::Internal("decompression workers exited"))
                    }
                }
            };
            match response {
                Response::Data {
                    range,
                    buf,
                    home,
                    generation: g,
                } if g == generation => {
                    let len = range.size() as usize;
                    self.holding.insert(range.lo, Piece::Data { len, buf, home });
                }
                Response::Failed {
                    at,
                    err,
                    generation: g,
                } if g == generation => {
                    self.holding.insert(at, Piece::Failed(err));
                }
                Response::Data { buf, home, .. } => {
                    let _ = home.send(buf);
                }
                Response::Failed { .. } | Response::Ack => {}
            }
        }
    }

    /// Returns every held buffer to its worker.
    fn recycle_held(&mut self) {
        if let Some(current) = self.current.take() {
            let _ = current.home.send(current.buf);
        }
        for (_, piece) in std::mem::take(&mut self.holding) {
            if let Piece::Data { buf, home, .. } = piece {
                let _ = home.send(buf);
            }
        }
    }

    fn stop(&mut self) -> Result<()> {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.recycle_held();
        self.inbox
            .send(ManagerMsg::Stop)
            .map_err(|_| Error::Internal("decompression manager exited"))?;

        let mut acks = 0;
        while acks < self.workers + 1 {
            match self.responses.recv() {
                Ok(Response::Ack) => acks += 1,
                Ok(Response::Data { buf, home, .. }) => {
                    let _ = home.send(buf);
                }
                Ok(Response::Failed { .. }) => {}
                Err(_) => return Err(Error::Internal("decompression workers exited")),
            }
        }
        self.resume.wait();
        Ok(())
    }
}

impl Drop for ConcReader {
    fn drop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.recycle_held();
        let _ = self.inbox.send(ManagerMsg::Shutdown);
        // Keep buffers flowing until every thread has dropped its sender.
        while let Ok(response) = self.responses.recv() {
            if let Response::Data { buf, home, .. } = response {
                let _ = home.send(buf);
            }
        }
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                log::warn!("rac decompression thread panicked");
            }
        }
        log::debug!("rac decompression workers shut down");
    }
}

struct Manager {
    chunks: ChunkReader,
    inbox: Receiver<ManagerMsg>,
    work: SyncSender<WorkerMsg>,
    responses: Sender<Response>,
    generation: Arc<AtomicU64>,
    workers: usize,
}

impl Manager {
    fn run(mut self) {
        while let Ok(msg) = self.inbox.recv() {
            match msg {
                ManagerMsg::Region { range, generation } => {
                    if let Err((at, err)) = self.dispatch(range, generation) {
                        let _ = self.responses.send(Response::Failed {
                            at,
                            err,
                            generation,
                        });
                    }
                }
                ManagerMsg::Stop => {
                    for _ in 0..self.workers {
                        if self.work.send(WorkerMsg::Stop).is_err() {
                            return;
                        }
                    }
                    if self.responses.send(Response::Ack).is_err() {
                        return;
                    }
                }
                ManagerMsg::Shutdown => break,
            }
        }
        for _ in 0..self.workers {
            let _ = self.work.send(WorkerMsg::Shutdown);
        }
    }

    /// Queues one work order per chunk overlapping `region`. Stops early once
    /// the consumer moves to a newer generation.
    fn dispatch(
        &mut self,
        region: Range,
        generation: u64,
    ) -> std::result::Result<(), (u64, Error)> {
        let mut next = region.lo;
        self.chunks
            .seek_to_chunk_containing(region.lo)
            .map_err(|err| (next, err))?;
        while next < region.hi {
            if self.generation.load(Ordering::SeqCst) != generation {
                return Ok(());
            }
            let chunk = match self.chunks.next_chunk() {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return Err((next, Error::Internal("chunks end before the region"))),
                Err(err) => return Err((next, err)),
            };
            let piece = chunk.d_range.intersect(region);
            if piece.is_empty() {
                continue;
            }
            if piece.lo != next {
                return Err((next, Error::Internal("chunks are not contiguous")));
            }
            let order = WorkerMsg::Work {
                range: piece,
                generation,
            };
            if self.work.send(order).is_err() {
                return Ok(());
            }
            next = piece.hi;
        }
        Ok(())
    }
}

struct Worker {
    reader: Reader,
    queue: Arc<Mutex<Receiver<WorkerMsg>>>,
    responses: Sender<Response>,
    generation: Arc<AtomicU64>,
    resume: Arc<Barrier>,
    buffer_size: usize,
    buffers: usize,
}

impl Worker {
    fn run(mut self) {
        let (home, pool) = mpsc::channel();
        for _ in 0..self.buffers {
            let _ = home.send(vec![0u8; self.buffer_size]);
        }
        loop {
            let msg = match self.queue.lock() {
                Ok(queue) => queue.recv(),
                Err(_) => return,
            };
            match msg {
                Ok(WorkerMsg::Work { range, generation }) => {
                    if !self.decompress(range, generation, &home, &pool) {
                        return;
                    }
                }
                Ok(WorkerMsg::Stop) => {
                    if self.responses.send(Response::Ack).is_err() {
                        return;
                    }
                    self.resume.wait();
                }
                Ok(WorkerMsg::Shutdown) | Err(_) => return,
            }
        }
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) != generation
    }

    /// Returns false once the consumer is gone.
    fn decompress(
        &mut self,
        range: Range,
        generation: u64,
        home: &Sender<Vec<u8>>,
        pool: &Receiver<Vec<u8>>,
    ) -> bool {
        if self.is_stale(generation) {
            return true;
        }
        if let Err(err) = self.reader.seek_to(range.lo) {
            return self.fail(range.lo, err, generation);
        }
        let mut at = range.lo;
        while at < range.hi {
            if self.is_stale(generation) {
                return true;
            }
            let Ok(mut buf) = pool.recv() else {
                return false;
            };
            let want = (range.hi - at).min(buf.len() as u64) as usize;
            let (filled, err) = self.fill(&mut buf[..want]);
            if filled > 0 {
                let data = Response::Data {
                    range: Range::new(at, at + filled as u64),
                    buf,
                    home: home.clone(),
                    generation,
                };
                if self.responses.send(data).is_err() {
                    return false;
                }
                at += filled as u64;
            } else {
                let _ = home.send(buf);
            }
            if let Some(err) = err {
                return self.fail(at, err, generation);
            }
            if filled < want {
                return self.fail(at, Error::InvalidChunk("truncated"), generation);
            }
        }
        true
    }

    fn fill(&mut self, buf: &mut [u8]) -> (usize, Option<Error>) {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read_inner(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(err) => return (filled, Some(err)),
            }
        }
        (filled, None)
    }

    /// Reports the failure and starts over with a fresh reader, since the
    /// old one keeps its error.
    fn fail(&mut self, at: u64, err: Error, generation: u64) -> bool {
        log::warn!("rac worker failed at {at:#x}: {err}");
        self.reader = self.reader.serial_clone();
        self.responses
            .send(Response::Failed {
                at,
                err,
                generation,
            })
            .is_ok()
    }
}

#[cfg(all(test, feature = "zlib"))]
mod tests {
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::sync::Arc;

    use super::*;
    use crate::codec::zlib::ZlibWriter;
    use crate::config::WriterConfig;
    use crate::source::ReadAt;
    use crate::writer::Writer;

    fn container(data: &[u8]) -> Arc<dyn ReadAt> {
        let config = WriterConfig {
            dchunk_size: 300,
            ..WriterConfig::default()
        };
        let mut writer = Writer::new(Vec::new(), ZlibWriter::default(), &config).expect("writer");
        writer.write_all(data).expect("write");
        Arc::new(writer.finish().expect("finish"))
    }

    fn drain(conc: &mut ConcReader, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            match conc.read(&mut out[filled..]).expect("read") {
                0 => break,
                n => filled += n,
            }
        }
        out.truncate(filled);
        out
    }

    #[test]
    fn single_worker_matches_serial_reader() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8 ^ (i >> 8) as u8).collect();
        let reader = Reader::new(container(&data), &ReaderConfig::default()).expect("reader");
        let config = ReaderConfig {
            concurrency: 1,
            buffer_size: 64,
            buffers_per_worker: 1,
        };
        let mut conc = ConcReader::spawn(&reader, &config).expect("spawn");

        assert_eq!(drain(&mut conc, 6000), data);
        for (pos, len) in [(10u64, 700usize), (4999, 5), (299, 2), (0, 301), (6000, 10)] {
            conc.seek(pos, data.len() as u64);
            let got = drain(&mut conc, len);
            let lo = (pos as usize).min(data.len());
            let hi = (lo + len).min(data.len());
            assert_eq!(got, &data[lo..hi], "pos {pos}");
            assert_eq!(conc.position(), hi.max(pos as usize) as u64);
        }

        conc.seek(100, 150);
        assert_eq!(drain(&mut conc, 500), &data[100..150]);
    }

    #[test]
    fn single_worker_random_seeks() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i * 17 % 253) as u8).collect();
        let source = container(&data);
        let reader = Reader::new(Arc::clone(&source), &ReaderConfig::default()).expect("reader");
        let mut serial = Reader::new(source, &ReaderConfig::default()).expect("reader");
        let config = ReaderConfig {
            concurrency: 1,
            buffer_size: 97,
            buffers_per_worker: 2,
        };
        let mut conc = ConcReader::spawn(&reader, &config).expect("spawn");

        let mut state = 11u64;
        for round in 0..150 {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let pos = (state >> 33) % (data.len() as u64 + 10);
            let len = ((state >> 13) % 2000) as usize;

            serial.seek(SeekFrom::Start(pos)).expect("seek");
            let mut want = Vec::new();
            (&mut serial)
                .take(len as u64)
                .read_to_end(&mut want)
                .expect("read");
            conc.seek(pos, data.len() as u64);
            let got = drain(&mut conc, len);
            assert_eq!(got, want, "round {round} pos {pos}");
            assert_eq!(conc.position(), pos + got.len() as u64);
        }
    }
}
