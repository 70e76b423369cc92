use std::collections::BTreeSet;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::num::NonZeroU32;
use std::ops::Range as IndexRange;

use crate::codec::Codec;
use crate::config::{IndexLocation, WriterConfig};
use crate::index::node::{
    empty_root, put_u64_le, seal, INDEX_AT_END_MAGIC, MAX_NODE_SIZE, MAX_SIZE, TAG_BRANCH,
    TAG_CODEC, TAG_NO_RESOURCE, VERSION,
};
use crate::{Error, Result};

const MAX_RESOURCES: usize = 1 << 30;
const MAX_CHUNKS: usize = 1 << 30;
const MAX_PADDING_BLOCK: u64 = 4096;

/// Handle to a resource added with [`ChunkWriter::add_resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Resource(NonZeroU32);

impl Resource {
    /// 1-based handle value.
    pub fn get(self) -> u32 {
        self.0.get()
    }

    fn index(self) -> usize {
        self.0.get() as usize - 1
    }
}

/// Compressed length in 1024-byte units, rounded up. Lengths above 255
/// units are recorded as 0 (unknown).
fn c_length(len: u64) -> u64 {
    if len == 0 {
        return 1;
    }
    let units = (len - 1) / 1024 + 1;
    if units > 255 {
        0
    } else {
        units
    }
}

/// A chunk or branch while the tree is being built. Nodes live in one arena;
/// a branch's children are a contiguous run of the previous level.
#[derive(Debug, Clone, Default)]
struct WNode {
    d_range_size: u64,
    children: IndexRange<usize>,
    /// Sorted indexes of the resources this branch lists as children.
    resources: Vec<usize>,
    c_offset_c_length: u64,
    secondary: Option<usize>,
    tertiary: Option<usize>,
}

impl WNode {
    fn is_chunk(&self) -> bool {
        self.children.is_empty()
    }
}

struct Tree {
    nodes: Vec<WNode>,
    root: usize,
}

impl Tree {
    /// Groups the chunks into branches of at most `arity_budget` children
    /// (distinct resources included), one level at a time, until a single
    /// root remains. Every chunk ends up at the same depth.
    fn gather(chunks: Vec<WNode>, arity_budget: usize) -> Tree {
        let mut nodes = chunks;
        let mut level = 0..nodes.len();
        loop {
            let next_level = nodes.len();
            let mut resources = BTreeSet::new();
            let mut start = level.start;
            let mut arity = 0;
            for j in level.clone() {
                let (secondary, tertiary) = (nodes[j].secondary, nodes[j].tertiary);
                let new2 = secondary.is_some_and(|r| !resources.contains(&r));
                let new3 = tertiary
                    .is_some_and(|r| !resources.contains(&r) && Some(r) != secondary);
                arity += 1 + usize::from(new2) + usize::from(new3);
                if arity <= arity_budget {
                    resources.extend(secondary.filter(|_| new2));
                    resources.extend(tertiary.filter(|_| new3));
                    continue;
                }

                let branch = Self::make_branch(&nodes, start..j, std::mem::take(&mut resources));
                nodes.push(branch);
                start = j;
                arity = 1;
                for r in [secondary, tertiary].into_iter().flatten() {
                    if resources.insert(r) {
                        arity += 1;
                    }
                }
            }

            let single = start == level.start;
            let branch = Self::make_branch(&nodes, start..level.end, resources);
            nodes.push(branch);
            if single {
                let root = nodes.len() - 1;
                return Tree { nodes, root };
            }
            level = next_level..nodes.len();
        }
    }

    fn make_branch(
        nodes: &[WNode],
        children: IndexRange<usize>,
        resources: BTreeSet<usize>,
    ) -> WNode {
        WNode {
            d_range_size: nodes[children.clone()].iter().map(|n| n.d_range_size).sum(),
            children,
            resources: resources.into_iter().collect(),
            ..WNode::default()
        }
    }

    /// Assigns each branch its offset within the index and returns the
    /// index's total size. The root goes last when the index is at the end of
    /// the file, so that it can be found from the final byte.
    fn assign_offsets(
        &mut self,
        n: usize,
        mut acc: u64,
        root_at_end: bool,
        codec_slots: usize,
    ) -> u64 {
        if self.nodes[n].is_chunk() {
            return acc;
        }
        let arity = self.nodes[n].children.len() + self.nodes[n].resources.len() + codec_slots;
        let size = (16 * arity + 16) as u64;
        let children = self.nodes[n].children.clone();

        if root_at_end {
            for c in children.clone() {
                acc = self.assign_offsets(c, acc, false, codec_slots);
            }
        }
        self.nodes[n].c_offset_c_length = acc | c_length(size) << 48;
        acc += size;
        if !root_at_end {
            for c in children {
                acc = self.assign_offsets(c, acc, false, codec_slots);
            }
        }
        acc
    }
}

/// Serializes branch nodes once every offset is known.
struct NodeWriter<'a> {
    codec: Codec,
    c_file_size: u64,
    data_c_offset: u64,
    index_c_offset: u64,
    resources: &'a [u64],
    buf: Box<[u8; MAX_NODE_SIZE]>,
}

impl NodeWriter<'_> {
    fn write_index(
        &mut self,
        sink: &mut dyn Write,
        tree: &Tree,
        n: usize,
        root_at_end: bool,
    ) -> Result<()> {
        let node = &tree.nodes[n];
        if root_at_end {
            self.write_branch_children(sink, tree, n)?;
        }

        let codec_slots = usize::from(self.codec.is_long());
        let arity = codec_slots + node.resources.len() + node.children.len();
        if arity > 0xFF {
            return Err(Error::Internal("arity is too large"));
        }
        let c_base = 8 * arity + 8;
        let tag_of = |r: Option<usize>| -> u64 {
            r.and_then(|r| node.resources.iter().position(|&x| x == r))
                .map_or(u64::from(TAG_NO_RESOURCE), |i| (codec_slots + i) as u64)
                << 56
        };

        let buf = &mut self.buf[..];
        let mut slot = 0;
        if codec_slots != 0 {
            put_u64_le(&mut buf[0..], u64::from(TAG_CODEC) << 56);
            put_u64_le(&mut buf[c_base..], self.codec.payload());
            slot += 1;
        }
        // Resources come first so that their slot numbers, used as tags,
        // stay below the reserved tag band.
        for &r in &node.resources {
            put_u64_le(&mut buf[8 * slot..], u64::from(TAG_NO_RESOURCE) << 56);
            put_u64_le(
                &mut buf[c_base + 8 * slot..],
                (self.resources[r] + self.data_c_offset) | u64::from(TAG_NO_RESOURCE) << 56,
            );
            slot += 1;
        }
        let mut d_ptr = 0;
        for child in &tree.nodes[node.children.clone()] {
            let (t_tag, c_offset) = if child.is_chunk() {
                (tag_of(child.tertiary), child.c_offset_c_length + self.data_c_offset)
            } else {
                (u64::from(TAG_BRANCH) << 56, child.c_offset_c_length + self.index_c_offset)
            };
            put_u64_le(&mut buf[8 * slot..], d_ptr | t_tag);
            put_u64_le(&mut buf[c_base + 8 * slot..], c_offset | tag_of(child.secondary));
            d_ptr += child.d_range_size;
            slot += 1;
        }
        put_u64_le(&mut buf[8 * arity..], d_ptr | u64::from(self.codec.high_byte()) << 56);
        put_u64_le(
            &mut buf[16 * arity + 8..],
            self.c_file_size | u64::from(VERSION) << 48 | (arity as u64) << 56,
        );
        let size = seal(buf, arity as u8);
        sink.write_all(&buf[..size])?;

        if !root_at_end {
            self.write_branch_children(sink, tree, n)?;
        }
        Ok(())
    }

    fn write_branch_children(
        &mut self,
        sink: &mut dyn Write,
        tree: &Tree,
        n: usize,
    ) -> Result<()> {
        for c in tree.nodes[n].children.clone() {
            if !tree.nodes[c].is_chunk() {
                self.write_index(sink, tree, c, false)?;
            }
        }
        Ok(())
    }
}

/// Zero padding so that regions straddle as few compressed pages as possible.
struct Pager {
    page_size: u64,
    zeroes: Vec<u8>,
}

impl Pager {
    fn new(page_size: u64) -> Result<Self> {
        if !(page_size == 0 || page_size.is_power_of_two()) || page_size > MAX_SIZE {
            return Err(Error::InvalidArgument("cpage size must be zero or a power of two"));
        }
        let block = page_size.min(MAX_PADDING_BLOCK) as usize;
        Ok(Self {
            page_size,
            zeroes: vec![0; block],
        })
    }

    fn round_up(&self, x: u64) -> u64 {
        if self.page_size == 0 {
            x
        } else {
            (x + self.page_size - 1) & !(self.page_size - 1)
        }
    }

    fn to_boundary(&self, offset: u64) -> u64 {
        self.round_up(offset) - offset
    }

    /// Padding to insert at `offset` before a region of `len` bytes: none,
    /// unless starting on a fresh page saves a page.
    fn before_region(&self, offset: u64, len: u64) -> u64 {
        if self.page_size == 0 || len == 0 {
            return 0;
        }
        let within = offset & (self.page_size - 1);
        if (within + len).div_ceil(self.page_size) == len.div_ceil(self.page_size) {
            return 0;
        }
        self.to_boundary(offset)
    }

    fn write_zeroes(&self, sink: &mut dyn Write, mut n: u64) -> io::Result<()> {
        while n > 0 {
            let block = n.min(self.zeroes.len() as u64) as usize;
            sink.write_all(&self.zeroes[..block])?;
            n -= block as u64;
        }
        Ok(())
    }
}

enum State {
    Open,
    Failed(Error),
    Closed,
}

/// Low-level container writer.
///
/// The caller supplies already-compressed chunk bytes plus their decompressed
/// sizes; the writer lays them out and builds the index on
/// [`close`](Self::close). With [`IndexLocation::AtStart`] the data is staged
/// in `T` (an in-memory buffer unless [`with_temp_file`](Self::with_temp_file)
/// is used) and copied after the index.
pub struct ChunkWriter<W: Write, T: Read + Write + Seek = Cursor<Vec<u8>>> {
    writer: W,
    temp: Option<T>,
    temp_start: u64,
    index_location: IndexLocation,
    pager: Pager,
    state: State,
    initialized: bool,

    codec: Option<Codec>,
    data_size: u64,
    d_file_size: u64,
    resources: Vec<u64>,
    chunks: Vec<WNode>,
}

impl<W: Write> ChunkWriter<W> {
    pub fn new(writer: W, config: &WriterConfig) -> Result<Self> {
        let temp = match config.index_location {
            IndexLocation::AtEnd => None,
            IndexLocation::AtStart => Some(Cursor::new(Vec::new())),
        };
        Self::build(writer, temp, config)
    }
}

impl<W: Write, T: Read + Write + Seek> ChunkWriter<W, T> {
    /// Index-at-start writer that stages data in `temp`, starting at its
    /// current position.
    pub fn with_temp_file(writer: W, temp: T, config: &WriterConfig) -> Result<Self> {
        if config.index_location != IndexLocation::AtStart {
            return Err(Error::InvalidArgument("index at end takes no temp file"));
        }
        Self::build(writer, Some(temp), config)
    }

    fn build(writer: W, mut temp: Option<T>, config: &WriterConfig) -> Result<Self> {
        let pager = Pager::new(config.cpage_size)?;
        let temp_start = match temp.as_mut() {
            Some(t) => t.stream_position()?,
            None => 0,
        };
        Ok(Self {
            writer,
            temp,
            temp_start,
            index_location: config.index_location,
            pager,
            state: State::Open,
            initialized: false,
            codec: None,
            data_size: 0,
            d_file_size: 0,
            resources: Vec::new(),
            chunks: Vec::new(),
        })
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    /// Appends a shared resource and returns its handle.
    pub fn add_resource(&mut self, resource: &[u8]) -> Result<Resource> {
        self.check()?;
        let result = self.add_resource_inner(resource);
        self.sticky(result)
    }

    /// Appends one compressed chunk. A zero `d_range_size` is a no-op.
    pub fn add_chunk(
        &mut self,
        d_range_size: u64,
        codec: Codec,
        primary: &[u8],
        secondary: Option<Resource>,
        tertiary: Option<Resource>,
    ) -> Result<()> {
        self.check()?;
        if d_range_size == 0 {
            return Ok(());
        }
        let result = self.add_chunk_inner(d_range_size, codec, primary, secondary, tertiary);
        self.sticky(result)
    }

    /// Writes the index (and, for index-at-start, the staged data). Every
    /// later call fails with [`Error::Closed`].
    pub fn close(&mut self) -> Result<()> {
        self.check()?;
        let result = self.close_inner().and_then(|()| Ok(self.writer.flush()?));
        match result {
            Ok(()) => {
                self.state = State::Closed;
                Ok(())
            }
            Err(err) => {
                self.state = State::Failed(err.clone());
                Err(err)
            }
        }
    }

    /// Closes and returns the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        self.close()?;
        Ok(self.writer)
    }

    fn check(&self) -> Result<()> {
        match &self.state {
            State::Open => Ok(()),
            State::Failed(err) => Err(err.clone()),
            State::Closed => Err(Error::Closed),
        }
    }

    fn sticky<R>(&mut self, result: Result<R>) -> Result<R> {
        if let Err(err) = &result {
            self.state = State::Failed(err.clone());
        }
        result
    }

    fn initialize(&mut self) -> Result<()> {
        if self.initialized {
            return Ok(());
        }
        self.initialized = true;
        if self.index_location == IndexLocation::AtEnd {
            self.write_data(&INDEX_AT_END_MAGIC)?;
        }
        Ok(())
    }

    fn write_data(&mut self, data: &[u8]) -> Result<()> {
        let len = data.len() as u64;
        if len > MAX_SIZE {
            return Err(Error::TooMuchInput);
        }
        let padding = self.pager.before_region(self.data_size, len);
        let sink: &mut dyn Write = match self.temp.as_mut() {
            Some(temp) => temp,
            None => &mut self.writer,
        };
        self.pager.write_zeroes(sink, padding)?;
        sink.write_all(data)?;
        self.data_size += padding + len;
        if self.data_size > MAX_SIZE {
            return Err(Error::TooMuchInput);
        }
        Ok(())
    }

    fn add_resource_inner(&mut self, resource: &[u8]) -> Result<Resource> {
        if self.resources.len() >= MAX_RESOURCES {
            return Err(Error::TooManyResources);
        }
        self.initialize()?;
        self.write_data(resource)?;
        let len = resource.len() as u64;
        let c_offset = self.data_size - len;
        self.resources.push(c_offset | c_length(len) << 48);
        let handle = NonZeroU32::new(self.resources.len() as u32)
            .ok_or(Error::Internal("resource handle overflow"))?;
        Ok(Resource(handle))
    }

    fn add_chunk_inner(
        &mut self,
        d_range_size: u64,
        codec: Codec,
        primary: &[u8],
        secondary: Option<Resource>,
        tertiary: Option<Resource>,
    ) -> Result<()> {
        if d_range_size > MAX_SIZE || self.d_file_size + d_range_size > MAX_SIZE {
            return Err(Error::TooMuchInput);
        }
        if self.chunks.len() >= MAX_CHUNKS {
            return Err(Error::TooManyChunks);
        }
        if !codec.is_valid() {
            return Err(Error::InvalidCodec);
        }
        match self.codec {
            None => self.codec = Some(codec),
            Some(existing) if existing != codec => return Err(Error::InconsistentCodec),
            Some(_) => {}
        }
        let known = |r: Option<Resource>| r.map_or(true, |r| r.index() < self.resources.len());
        if !known(secondary) || !known(tertiary) {
            return Err(Error::InvalidArgument("unknown resource handle"));
        }

        self.initialize()?;
        self.write_data(primary)?;
        let len = primary.len() as u64;
        let c_offset = self.data_size - len;
        self.d_file_size += d_range_size;
        self.chunks.push(WNode {
            d_range_size,
            c_offset_c_length: c_offset | c_length(len) << 48,
            secondary: secondary.map(Resource::index),
            tertiary: tertiary.map(Resource::index),
            ..WNode::default()
        });
        Ok(())
    }

    fn close_inner(&mut self) -> Result<()> {
        let Some(codec) = self.codec.filter(|_| !self.chunks.is_empty()) else {
            return self.write_empty();
        };
        let at_end = self.index_location == IndexLocation::AtEnd;
        let codec_slots = usize::from(codec.is_long());
        let chunks = std::mem::take(&mut self.chunks);
        let num_chunks = chunks.len();
        let mut tree = Tree::gather(chunks, 0xFF - codec_slots);
        let root = tree.root;
        let index_size = tree.assign_offsets(root, 0, at_end, codec_slots);
        log::debug!(
            "rac index: {num_chunks} chunks, {} branch nodes, {index_size} bytes",
            tree.nodes.len() - num_chunks
        );

        let (data_c_offset, index_c_offset, c_file_size) = if at_end {
            let index_c_offset = self.pager.round_up(self.data_size);
            (0, index_c_offset, index_c_offset + index_size)
        } else {
            let data_c_offset = self.pager.round_up(index_size);
            (data_c_offset, 0, data_c_offset + self.data_size)
        };
        if c_file_size > MAX_SIZE {
            return Err(Error::TooMuchInput);
        }

        let mut nodes = NodeWriter {
            codec,
            c_file_size,
            data_c_offset,
            index_c_offset,
            resources: &self.resources,
            buf: Box::new([0u8; MAX_NODE_SIZE]),
        };
        if at_end {
            let padding = self.pager.to_boundary(self.data_size);
            self.pager.write_zeroes(&mut self.writer, padding)?;
            nodes.write_index(&mut self.writer, &tree, root, true)?;
            return Ok(());
        }

        nodes.write_index(&mut self.writer, &tree, root, false)?;
        let padding = self.pager.to_boundary(index_size);
        self.pager.write_zeroes(&mut self.writer, padding)?;
        let temp = self
            .temp
            .as_mut()
            .ok_or(Error::Internal("index at start without a temp file"))?;
        temp.seek(SeekFrom::Start(self.temp_start))?;
        let copied = io::copy(temp, &mut self.writer)?;
        if copied != self.data_size {
            return Err(Error::Internal("inconsistent compressed data size"));
        }
        Ok(())
    }

    fn write_empty(&mut self) -> Result<()> {
        if !self.initialized || self.index_location == IndexLocation::AtStart {
            self.writer.write_all(&empty_root(32))?;
            return Ok(());
        }
        // The prefix and any resources are already out; the root follows them.
        let padding = self.pager.to_boundary(self.data_size);
        self.pager.write_zeroes(&mut self.writer, padding)?;
        let c_file_size = self.data_size + padding + 32;
        self.writer.write_all(&empty_root(c_file_size))?;
        Ok(())
    }
}
