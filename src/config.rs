//! Reader and writer configuration.
//!
//! Both structs deserialize from JSON (see `ractool encode --config`), and
//! every field falls back to its default when omitted.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Where the index tree goes relative to the compressed data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexLocation {
    /// Data first, index appended. Needs no temporary storage.
    #[default]
    AtEnd,
    /// Index first. Data is staged in a temporary store until close.
    AtStart,
}

/// Configuration for writing containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterConfig {
    /// Index placement.
    /// Default: at end
    pub index_location: IndexLocation,

    /// Compressed page size for alignment padding. Zero or a power of two.
    /// Default: 0 (no padding)
    pub cpage_size: u64,

    /// Decompressed size of each chunk cut by the compressing writer.
    /// Excludes `cchunk_size`; when neither is set, chunks hold 64 KiB.
    /// Default: 0
    pub dchunk_size: usize,

    /// Target compressed size of each chunk cut by the compressing writer.
    /// Chunks take as much input as fits, up to 1 GiB compressed.
    /// Default: 0
    pub cchunk_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            index_location: IndexLocation::AtEnd,
            cpage_size: 0,
            dchunk_size: 0,
            cchunk_size: 0,
        }
    }
}

pub const DEFAULT_DCHUNK_SIZE: usize = 64 * 1024; // 64 KiB
pub const MAX_CCHUNK_SIZE: usize = 1 << 30;

/// How the compressing writer cuts its input into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chunking {
    /// Every chunk but the last holds exactly this many input bytes.
    Decompressed(usize),
    /// Each chunk holds as much input as compresses to at most this many
    /// bytes.
    Compressed(usize),
}

impl WriterConfig {
    pub fn chunking(&self) -> Result<Chunking> {
        match (self.dchunk_size, self.cchunk_size) {
            (0, 0) => Ok(Chunking::Decompressed(DEFAULT_DCHUNK_SIZE)),
            (size, 0) => Ok(Chunking::Decompressed(size)),
            (0, size) => Ok(Chunking::Compressed(size.min(MAX_CCHUNK_SIZE))),
            _ => Err(Error::InvalidArgument("dchunk size and cchunk size are mutually exclusive")),
        }
    }
}

/// Configuration for reading containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Number of decompression workers. Values of 0 or 1 read on the
    /// caller's thread.
    /// Default: 1
    pub concurrency: usize,

    /// Size of each worker buffer.
    /// Default: 64 KiB
    pub buffer_size: usize,

    /// Buffers owned by each worker.
    /// Default: 2
    pub buffers_per_worker: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            buffer_size: 64 * 1024, // 64 KiB
            buffers_per_worker: 2,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() {
        let config: WriterConfig =
            serde_json::from_str(r#"{"index_location":"at_start","cpage_size":4096}"#)
                .expect("parse");
        assert_eq!(config.index_location, IndexLocation::AtStart);
        assert_eq!(config.cpage_size, 4096);
        assert_eq!(config.dchunk_size, 0);
        assert_eq!(config.chunking().expect("chunking"), Chunking::Decompressed(64 * 1024));

        let reader: ReaderConfig = serde_json::from_str(r#"{"concurrency":4}"#).expect("parse");
        assert_eq!(reader.concurrency, 4);
        assert_eq!(reader.buffers_per_worker, 2);
    }

    #[test]
    fn chunk_sizes_resolve() {
        let both = WriterConfig {
            dchunk_size: 100,
            cchunk_size: 100,
            ..WriterConfig::default()
        };
        assert!(matches!(both.chunking(), Err(Error::InvalidArgument(_))));

        let config: WriterConfig = serde_json::from_str(r#"{"cchunk_size":4096}"#).expect("parse");
        assert_eq!(config.chunking().expect("chunking"), Chunking::Compressed(4096));

        let huge = WriterConfig {
            cchunk_size: usize::MAX,
            ..WriterConfig::default()
        };
        assert_eq!(huge.chunking().expect("chunking"), Chunking::Compressed(1 << 30));

        let fixed = WriterConfig {
            dchunk_size: 512,
            ..WriterConfig::default()
        };
        assert_eq!(fixed.chunking().expect("chunking"), Chunking::Decompressed(512));
    }
}
