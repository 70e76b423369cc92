use std::sync::Arc;

use crate::codec::Codec;
use crate::index::node::{node_size, Node, MAGIC, MAX_NODE_SIZE, MIN_CONTAINER_SIZE, VERSION};
use crate::index::Chunk;
use crate::source::ReadAt;
use crate::{Error, Result};

/// Walks a container's index tree and yields its chunks in DSpace order.
///
/// Only one node is held in memory at a time. Branch nodes are checked
/// against their parent as the reader descends, so a corrupt subtree is only
/// reported when a seek or iteration reaches it.
#[derive(Clone)]
pub struct ChunkReader {
    source: Arc<dyn ReadAt>,
    compressed_size: u64,
    err: Option<Error>,
    /// The iterator has handed out `err` and now ends.
    err_yielded: bool,

    root_arity: u8,
    root_c_offset: u64,
    decompressed_size: u64,

    need_to_resolve: bool,
    seek_position: u64,
    next_child: usize,
    curr_c_bias: u64,
    curr_d_bias: u64,
    curr_node: Box<[u8; MAX_NODE_SIZE]>,
}

struct ParentContract {
    codec: Codec,
    has_mix_bit: bool,
    version: u8,
    c_off_max: u64,
}

impl ChunkReader {
    pub fn new(source: Arc<dyn ReadAt>) -> Result<Self> {
        let compressed_size = source.size()?;
        Self::with_size(source, compressed_size)
    }

    /// Opens a container occupying the first `compressed_size` bytes of
    /// `source`.
    pub fn with_size(source: Arc<dyn ReadAt>, compressed_size: u64) -> Result<Self> {
        if compressed_size < MIN_CONTAINER_SIZE {
            return Err(Error::InvalidInput("compressed size is too small"));
        }
        let mut reader = Self {
            source,
            compressed_size,
            err: None,
            err_yielded: false,
            root_arity: 0,
            root_c_offset: 0,
            decompressed_size: 0,
            need_to_resolve: true,
            seek_position: 0,
            next_child: 0,
            curr_c_bias: 0,
            curr_d_bias: 0,
            curr_node: Box::new([0u8; MAX_NODE_SIZE]),
        };
        reader.find_root_node()?;
        let version = reader.current_node()?.version();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(u32::from(version)));
        }
        log::debug!(
            "rac root node at {:#x} (arity {}), {} bytes compressed, {} bytes decompressed",
            reader.root_c_offset,
            reader.root_arity,
            reader.compressed_size,
            reader.decompressed_size
        );
        Ok(reader)
    }

    pub fn source(&self) -> &Arc<dyn ReadAt> {
        &self.source
    }

    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    pub fn decompressed_size(&self) -> Result<u64> {
        self.check()?;
        Ok(self.decompressed_size)
    }

    /// Makes the next [`next_chunk`](Self::next_chunk) return the chunk
    /// containing `d_offset`, which need not start there. Offsets at or past
    /// the end make it return `None`.
    pub fn seek_to_chunk_containing(&mut self, d_offset: u64) -> Result<()> {
        self.check()?;
        self.need_to_resolve = true;
        self.seek_position = d_offset;
        Ok(())
    }

    /// Returns the next non-empty chunk, or `None` once the decompressed size
    /// is reached.
    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        self.check()?;
        let result = self.advance();
        if let Err(err) = &result {
            self.err = Some(err.clone());
        }
        result
    }

    fn check(&self) -> Result<()> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn current_node(&self) -> Result<Node<'_>> {
        Node::decode(&self.curr_node[..]).ok_or(Error::InvalidIndexNode)
    }

    fn advance(&mut self) -> Result<Option<Chunk>> {
        loop {
            if self.need_to_resolve {
                if self.seek_position >= self.decompressed_size {
                    return Ok(None);
                }
                self.need_to_resolve = false;
                self.resolve_seek_position()?;
            }
            let node = Node::decode(&self.curr_node[..]).ok_or(Error::InvalidIndexNode)?;
            while self.next_child < node.arity() {
                let chunk = node.chunk(self.next_child, self.curr_c_bias, self.curr_d_bias);
                self.next_child += 1;
                self.seek_position = chunk.d_range.hi;
                if !chunk.d_range.is_empty() {
                    return Ok(Some(chunk));
                }
            }
            self.need_to_resolve = true;
        }
    }

    fn find_root_node(&mut self) -> Result<()> {
        let mut head = [0u8; 4];
        self.source.read_exact_at(&mut head, 0)?;
        if head[..3] != MAGIC {
            return Err(Error::InvalidInput("missing magic bytes"));
        }
        if self.try_root_node(head[3], false)? {
            return Ok(());
        }

        let mut tail = [0u8; 1];
        self.source.read_exact_at(&mut tail, self.compressed_size - 1)?;
        if self.try_root_node(tail[0], true)? {
            return Ok(());
        }
        Err(Error::InvalidInput("missing root node"))
    }

    fn try_root_node(&mut self, arity: u8, from_end: bool) -> Result<bool> {
        if arity == 0 {
            return Ok(false);
        }
        let size = node_size(arity) as u64;
        if self.compressed_size < size {
            return Ok(false);
        }
        let c_offset = if from_end {
            self.compressed_size - size
        } else {
            0
        };
        self.load(c_offset, arity)?;
        if self.curr_node[3] != arity {
            return Ok(false);
        }
        let node = self.current_node()?;
        if !node.is_valid() || node.c_ptr_max() != self.compressed_size {
            return Ok(false);
        }
        let d_ptr_max = node.d_ptr_max();
        self.decompressed_size = d_ptr_max;
        self.root_c_offset = c_offset;
        self.root_arity = arity;
        self.need_to_resolve = true;
        Ok(true)
    }

    fn load(&mut self, c_offset: u64, arity: u8) -> Result<()> {
        let size = node_size(arity);
        self.source.read_exact_at(&mut self.curr_node[..size], c_offset)?;
        Ok(())
    }

    fn load_and_validate(
        &mut self,
        c_offset: u64,
        parent: &ParentContract,
        child_c_bias: u64,
        child_d_size: u64,
    ) -> Result<()> {
        if self.compressed_size - 4 < c_offset {
            return Err(Error::InvalidIndexNode);
        }
        self.source.read_exact_at(&mut self.curr_node[..4], c_offset)?;
        let arity = self.curr_node[3];
        if arity == 0 {
            return Err(Error::InvalidIndexNode);
        }
        let size = node_size(arity) as u64;
        if self.compressed_size < size || self.compressed_size - size < c_offset {
            return Err(Error::InvalidIndexNode);
        }
        self.load(c_offset, arity)?;

        let child = self.current_node()?;
        if !child.is_valid() {
            return Err(Error::InvalidIndexNode);
        }
        let codecs_agree = parent.has_mix_bit || parent.codec == child.codec();
        if !codecs_agree
            || parent.version < child.version()
            || parent.c_off_max < child_c_bias + child.c_ptr_max()
            || child_d_size != child.d_ptr_max()
        {
            return Err(Error::InvalidIndexNode);
        }
        Ok(())
    }

    fn resolve_seek_position(&mut self) -> Result<()> {
        self.load(self.root_c_offset, self.root_arity)?;

        let mut c_bias = 0;
        let mut d_bias = 0;
        loop {
            let node = self.current_node()?;
            let i = node
                .find_child_containing(self.seek_position, d_bias)
                .ok_or(Error::Internal("could not find containing chunk"))?;
            if node.is_leaf(i) {
                self.next_child = i;
                self.curr_c_bias = c_bias;
                self.curr_d_bias = d_bias;
                return Ok(());
            }

            let parent = ParentContract {
                codec: node.codec(),
                has_mix_bit: node.codec_has_mix_bit(),
                version: node.version(),
                c_off_max: c_bias + node.c_ptr_max(),
            };
            let child_c_offset = node.c_off(i, c_bias);
            let s_tag = node.s_tag(i) as usize;
            let child_c_bias = if s_tag < node.arity() {
                node.c_off(s_tag, c_bias)
            } else {
                c_bias
            };
            let child_d_bias = node.d_off(i, d_bias);
            let child_d_size = node.d_size(i);
            log::trace!(
                "rac descending into child {i} at {child_c_offset:#x} for d_offset {:#x}",
                self.seek_position
            );

            self.load_and_validate(child_c_offset, &parent, child_c_bias, child_d_size)?;
            c_bias = child_c_bias;
            d_bias = child_d_bias;
        }
    }
}

/// Yields each chunk in turn. After an error is yielded the iterator ends.
impl Iterator for ChunkReader {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.err_yielded {
            return None;
        }
        let item = self.next_chunk().transpose();
        self.err_yielded = matches!(item, Some(Err(_)));
        item
    }
}

impl std::iter::FusedIterator for ChunkReader {}
