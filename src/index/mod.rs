//! The index tree: node layout, chunk iteration and tree construction.

pub mod chunk_reader;
pub mod chunk_writer;
pub mod node;

use crate::codec::Codec;
use crate::range::Range;

pub use chunk_reader::ChunkReader;
pub use chunk_writer::{ChunkWriter, Resource};
pub use node::Node;

/// One independently compressed unit, as described by a leaf node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    pub d_range: Range,
    pub c_primary: Range,
    pub c_secondary: Range,
    pub c_tertiary: Range,
    pub s_tag: u8,
    pub t_tag: u8,
    pub codec: Codec,
}
