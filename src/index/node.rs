//! Byte layout of a single index node.
//!
//! A node of arity `n` is `16 * n + 16` bytes:
//!
//! ```text
//! [0..8)              magic (3) | arity | checksum (2) | 0 | TTag[0]
//! [8*i..8*i+8)        DPtr[i] (6) | 0 | TTag[i]            for 1 <= i < n
//! [8*n..8*n+8)        DPtrMax (6) | 0 | codec byte
//! [8*n+8+8*i..)       CPtr[i] (6) | CLen[i] | STag[i]      for 0 <= i < n
//! [16*n+8..16*n+16)   CPtrMax (6) | version | arity
//! ```
//!
//! All multi-byte fields are little-endian.

use crate::codec::Codec;
use crate::index::Chunk;
use crate::range::Range;

pub const MAGIC: [u8; 3] = [0x72, 0xC3, 0x63];
/// First four bytes of a container whose index follows the data.
pub const INDEX_AT_END_MAGIC: [u8; 4] = [0x72, 0xC3, 0x63, 0x00];
/// Largest CSpace or DSpace offset a container can describe.
pub const MAX_SIZE: u64 = (1 << 48) - 1;
pub const MAX_NODE_SIZE: usize = 4096;
pub const VERSION: u8 = 1;
/// Smallest well-formed container: a root node of arity 1.
pub const MIN_CONTAINER_SIZE: u64 = 32;

pub const TAG_BRANCH: u8 = 0xFE;
pub const TAG_CODEC: u8 = 0xFD;
pub const TAG_NO_RESOURCE: u8 = 0xFF;
const RESERVED_TAGS: std::ops::Range<u8> = 0xC0..0xFD;

const CODEC_BYTE_LONG: u8 = 0x80;
const CODEC_BYTE_MIX: u8 = 0x40;
const CODEC_BYTE_LOW: u8 = 0x3F;

pub fn node_size(arity: u8) -> usize {
    16 * arity as usize + 16
}

fn u48_le(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], 0, 0])
}

fn u64_le(b: &[u8]) -> u64 {
    u64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

pub(crate) fn put_u64_le(b: &mut [u8], value: u64) {
    b[..8].copy_from_slice(&value.to_le_bytes());
}

/// CRC-32 (IEEE) of everything after the checksum field, folded to 16 bits.
pub fn checksum(node: &[u8]) -> u16 {
    let crc = crc32fast::hash(&node[6..]);
    (crc ^ (crc >> 16)) as u16
}

/// Writes magic, arity and checksum into an otherwise complete node buffer.
/// Returns the node's size.
pub(crate) fn seal(buf: &mut [u8], arity: u8) -> usize {
    let size = node_size(arity);
    buf[..3].copy_from_slice(&MAGIC);
    buf[3] = arity;
    let sum = checksum(&buf[..size]);
    buf[4..6].copy_from_slice(&sum.to_le_bytes());
    size
}

/// Root node of a container that holds no chunks, for a container of
/// `c_file_size` bytes whose root is its last 32 bytes.
pub(crate) fn empty_root(c_file_size: u64) -> [u8; 32] {
    let mut buf = [0u8; 32];
    put_u64_le(&mut buf[0..], u64::from(TAG_NO_RESOURCE) << 56);
    put_u64_le(&mut buf[8..], 0);
    put_u64_le(
        &mut buf[16..],
        c_file_size | 1 << 48 | u64::from(TAG_NO_RESOURCE) << 56,
    );
    put_u64_le(
        &mut buf[24..],
        c_file_size | u64::from(VERSION) << 48 | 1 << 56,
    );
    seal(&mut buf, 1);
    buf
}

/// Read-only view of an encoded node. Borrows the buffer; nothing is copied.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    buf: &'a [u8],
    arity: usize,
}

impl<'a> Node<'a> {
    /// Interprets `buf` as a node. Returns `None` when the arity byte is zero
    /// or the buffer is shorter than the size that arity implies. The result
    /// is not validated.
    pub fn decode(buf: &'a [u8]) -> Option<Self> {
        let arity = *buf.get(3)?;
        if arity == 0 {
            return None;
        }
        let size = node_size(arity);
        let buf = buf.get(..size)?;
        Some(Self {
            buf,
            arity: arity as usize,
        })
    }

    /// Whether `buf` starts with a well-formed node.
    pub fn validate(buf: &[u8]) -> bool {
        Node::decode(buf).is_some_and(|node| node.is_valid())
    }

    pub fn as_bytes(&self) -> &'a [u8] {
        self.buf
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    fn codec_byte(&self) -> u8 {
        self.buf[8 * self.arity + 7]
    }

    pub fn codec_has_mix_bit(&self) -> bool {
        self.codec_byte() & CODEC_BYTE_MIX != 0
    }

    /// Resolves the node's codec, following the codec entry for long codecs.
    /// Returns [`Codec::INVALID`] when a long codec has no entry.
    pub fn codec(&self) -> Codec {
        let c_byte = self.codec_byte();
        if c_byte & CODEC_BYTE_LONG == 0 {
            return Codec(u64::from(c_byte & CODEC_BYTE_LOW) << 56);
        }
        let low = (c_byte & CODEC_BYTE_LOW) as usize;
        for high in 0..4 {
            let i = low | (high << 6);
            if i < self.arity && self.t_tag(i) == TAG_CODEC {
                let entry = u64_le(&self.buf[8 * i + 8 * self.arity + 8..]);
                return Codec::long(entry);
            }
        }
        Codec::INVALID
    }

    pub fn d_ptr_max(&self) -> u64 {
        u48_le(&self.buf[8 * self.arity..])
    }

    pub fn c_ptr_max(&self) -> u64 {
        u48_le(&self.buf[16 * self.arity + 8..])
    }

    pub fn version(&self) -> u8 {
        self.buf[16 * self.arity + 14]
    }

    pub fn t_tag(&self, i: usize) -> u8 {
        self.buf[8 * i + 7]
    }

    pub fn s_tag(&self, i: usize) -> u8 {
        self.buf[8 * i + 8 * self.arity + 15]
    }

    /// Compressed length hint in 1024-byte units. Zero means unknown.
    pub fn c_len(&self, i: usize) -> u8 {
        self.buf[8 * i + 8 * self.arity + 14]
    }

    pub fn is_leaf(&self, i: usize) -> bool {
        self.t_tag(i) != TAG_BRANCH
    }

    pub fn c_off(&self, i: usize, c_bias: u64) -> u64 {
        c_bias + u48_le(&self.buf[8 * i + 8 * self.arity + 8..])
    }

    /// CSpace range of child `i`. Slots past the arity give the empty range
    /// at the node's CSpace end.
    pub fn c_off_range(&self, i: usize, c_bias: u64) -> Range {
        let mut end = c_bias + self.c_ptr_max();
        if i >= self.arity {
            return Range::new(end, end);
        }
        let c_off = self.c_off(i, c_bias);
        let c_len = self.c_len(i);
        if c_len != 0 {
            end = end.min(c_off + u64::from(c_len) * 1024);
        }
        Range::new(c_off, end)
    }

    pub fn d_off(&self, i: usize, d_bias: u64) -> u64 {
        if i == 0 {
            d_bias
        } else {
            d_bias + u48_le(&self.buf[8 * i..])
        }
    }

    pub fn d_off_range(&self, i: usize, d_bias: u64) -> Range {
        Range::new(self.d_off(i, d_bias), self.d_off(i + 1, d_bias))
    }

    pub fn d_size(&self, i: usize) -> u64 {
        let lo = if i > 0 { u48_le(&self.buf[8 * i..]) } else { 0 };
        u48_le(&self.buf[8 * i + 8..]).wrapping_sub(lo)
    }

    /// Largest child index whose DSpace start is at or before `d_off`.
    /// `None` when `d_off` precedes the node's first child.
    pub fn find_child_containing(&self, d_off: u64, d_bias: u64) -> Option<usize> {
        let (mut lo, mut hi) = (0, self.arity);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.d_off(mid, d_bias) <= d_off {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        lo.checked_sub(1)
    }

    pub fn chunk(&self, i: usize, c_bias: u64, d_bias: u64) -> Chunk {
        let s_tag = self.s_tag(i);
        let t_tag = self.t_tag(i);
        Chunk {
            d_range: self.d_off_range(i, d_bias),
            c_primary: self.c_off_range(i, c_bias),
            c_secondary: self.c_off_range(s_tag as usize, c_bias),
            c_tertiary: self.c_off_range(t_tag as usize, c_bias),
            s_tag,
            t_tag,
            codec: self.codec(),
        }
    }

    pub fn is_valid(&self) -> bool {
        let b = self.buf;
        let arity = self.arity;
        let size = b.len();
        if b[..3] != MAGIC || b[size - 1] as usize != arity {
            return false;
        }

        let mut has_children = false;
        for i in 0..arity {
            if b[8 * i + 6] != 0 {
                return false;
            }
            let t_tag = b[8 * i + 7];
            if RESERVED_TAGS.contains(&t_tag) {
                return false;
            }
            if t_tag != TAG_CODEC {
                has_children = true;
            }
        }
        if !has_children || b[8 * arity + 6] != 0 {
            return false;
        }

        // Boundaries never decrease, and codec entries cover nothing.
        let mut prev = 0;
        for i in 1..=arity {
            let curr = u48_le(&b[8 * i..]);
            if curr < prev {
                return false;
            }
            if curr != prev && b[8 * i + 7] == TAG_CODEC {
                return false;
            }
            prev = curr;
        }

        let c_ptr_max = self.c_ptr_max();
        for i in 0..arity {
            if u48_le(&b[8 * i + 8 * arity + 8..]) > c_ptr_max && self.t_tag(i) != TAG_CODEC {
                return false;
            }
        }

        if self.version() == 0 {
            return false;
        }
        if b[4..6] != checksum(b).to_le_bytes() {
            return false;
        }
        self.codec().is_valid()
    }
}
