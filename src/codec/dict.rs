//! Dictionary resources for the zstd codec, plus the dictionary selection
//! heuristic that every dictionary-capable codec shares.
//!
//! A stored dictionary is a little-endian u32 length, the dictionary bytes and
//! a little-endian CRC-32 (IEEE) of those bytes. Chunks refer to it through
//! their secondary resource.

use crate::codec::{Codec, Compressed};
use crate::index::node::TAG_NO_RESOURCE;
use crate::index::Chunk;
use crate::range::Range;
use crate::source::ReadAt;
use crate::{Error, Result};

pub const MAX_DICTIONARY_LEN: usize = (1 << 30) - 1;

/// Compressed chunks shorter than this never try a dictionary.
const MIN_BASELINE_FOR_DICTIONARIES: usize = 256;

/// Keeps at most the trailing [`MAX_DICTIONARY_LEN`] bytes of a resource.
/// Dictionary matches favour recent history, so the tail is the useful part.
pub fn refine(raw: &[u8]) -> &[u8] {
    &raw[raw.len().saturating_sub(MAX_DICTIONARY_LEN)..]
}

/// Stored form of a dictionary resource.
pub fn wrap_resource(raw: &[u8]) -> Result<Vec<u8>> {
    let dict = refine(raw);
    let len = u32::try_from(dict.len()).map_err(|_| Error::InvalidDictionary("too long"))?;
    let mut wrapped = Vec::with_capacity(dict.len() + 8);
    wrapped.extend_from_slice(&len.to_le_bytes());
    wrapped.extend_from_slice(dict);
    wrapped.extend_from_slice(&crc32fast::hash(dict).to_le_bytes());
    Ok(wrapped)
}

/// Compresses `data` without a dictionary and then with each resource in
/// turn, keeping a dictionary only when it beats the baseline by more than
/// 1/64th.
pub fn compress_with_best_dictionary<F>(
    data: &[u8],
    resources: &[Vec<u8>],
    codec: Codec,
    mut compress: F,
) -> Result<Compressed>
where
    F: FnMut(&[u8], Option<&[u8]>) -> Result<Vec<u8>>,
{
    let baseline = compress(data, None)?;
    let threshold = baseline.len() / 64 * 63;
    let mut best = Compressed {
        codec,
        bytes: baseline,
        secondary: None,
        tertiary: None,
    };
    if resources.is_empty() || best.bytes.len() < MIN_BASELINE_FOR_DICTIONARIES {
        return Ok(best);
    }
    for (i, resource) in resources.iter().enumerate() {
        let candidate = compress(data, Some(refine(resource)))?;
        if candidate.len() >= threshold || candidate.len() >= best.bytes.len() {
            continue;
        }
        best.bytes = candidate;
        best.secondary = Some(i);
    }
    Ok(best)
}

/// Reads dictionaries back, remembering the most recent one.
#[derive(Debug, Default, Clone)]
pub struct DictionaryLoader {
    cached_range: Range,
    cached: Vec<u8>,
}

impl DictionaryLoader {
    /// The chunk's dictionary, or `None` when it has no secondary resource.
    pub fn load(&mut self, source: &dyn ReadAt, chunk: &Chunk) -> Result<Option<&[u8]>> {
        if !chunk.c_tertiary.is_empty() {
            return Err(Error::InvalidDictionary("unexpected tertiary resource"));
        }
        let range = chunk.c_secondary;
        if range.is_empty() {
            return Ok(None);
        }
        if range == self.cached_range {
            return Ok(Some(&self.cached));
        }
        if range.size() < 8 || chunk.t_tag != TAG_NO_RESOURCE {
            return Err(Error::InvalidDictionary("malformed resource"));
        }

        let mut header = [0u8; 4];
        source.read_exact_at(&mut header, range.lo)?;
        let len = u32::from_le_bytes(header) as u64;
        if len >> 30 != 0 || len + 8 > range.size() {
            return Err(Error::InvalidDictionary("bad length"));
        }

        self.cached_range = Range::default();
        self.cached.clear();
        self.cached.resize(len as usize + 4, 0);
        source.read_exact_at(&mut self.cached, range.lo + 4)?;
        let (dict, trailer) = self.cached.split_at(len as usize);
        let want = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        if crc32fast::hash(dict) != want {
            return Err(Error::InvalidDictionary("checksum mismatch"));
        }
        self.cached.truncate(len as usize);
        self.cached_range = range;
        Ok(Some(&self.cached))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_with_secondary(c_secondary: Range) -> Chunk {
        Chunk {
            d_range: Range::new(0, 10),
            c_primary: Range::new(0, 4),
            c_secondary,
            c_tertiary: Range::new(40, 40),
            s_tag: 0,
            t_tag: TAG_NO_RESOURCE,
            codec: Codec::ZSTANDARD,
        }
    }

    #[test]
    fn wrapped_resources_load_back() {
        let mut file = b"prim".to_vec();
        let wrapped = wrap_resource(b"dictionary words").expect("wrap");
        assert_eq!(wrapped.len(), 16 + 8);
        file.extend_from_slice(&wrapped);
        let range = Range::new(4, file.len() as u64);

        let mut loader = DictionaryLoader::default();
        let dict = loader
            .load(&file, &chunk_with_secondary(range))
            .expect("load")
            .expect("dictionary");
        assert_eq!(dict, b"dictionary words");

        // Served from the cache even if the source changes underneath.
        let zeroed = vec![0u8; file.len()];
        let dict = loader
            .load(&zeroed, &chunk_with_secondary(range))
            .expect("load")
            .expect("dictionary");
        assert_eq!(dict, b"dictionary words");
    }

    #[test]
    fn corrupt_dictionary_is_rejected() {
        let mut file = wrap_resource(b"dictionary words").expect("wrap");
        file[6] ^= 0xFF;
        let range = Range::new(0, file.len() as u64);
        let err = DictionaryLoader::default()
            .load(&file, &chunk_with_secondary(range))
            .expect_err("checksum");
        assert!(matches!(err, Error::InvalidDictionary("checksum mismatch")));
    }

    #[test]
    fn no_secondary_means_no_dictionary() {
        let file = vec![0u8; 8];
        let mut loader = DictionaryLoader::default();
        let got = loader
            .load(&file, &chunk_with_secondary(Range::new(8, 8)))
            .expect("load");
        assert!(got.is_none());
    }

    #[test]
    fn small_outputs_skip_dictionaries() {
        let mut calls = 0;
        let count = |data: &[u8], _: Option<&[u8]>| {
            calls += 1;
            Ok(data.to_vec())
        };
        let result = compress_with_best_dictionary(b"abc", &[b"abc".to_vec()], Codec::ZLIB, count)
            .expect("compress");
        assert_eq!(calls, 1);
        assert_eq!(result.secondary, None);
    }

    #[test]
    fn best_dictionary_wins() {
        let data = vec![7u8; 1000];
        let resources = vec![b"a".to_vec(), b"bb".to_vec(), b"c".to_vec()];
        // Pretend the two-byte dictionary halves the output.
        let halve = |data: &[u8], dict: Option<&[u8]>| {
            Ok(match dict {
                Some(d) if d.len() == 2 => data[..500].to_vec(),
                _ => data.to_vec(),
            })
        };
        let result = compress_with_best_dictionary(&data, &resources, Codec::ZSTANDARD, halve)
            .expect("compress");
        assert_eq!(result.secondary, Some(1));
        assert_eq!(result.bytes.len(), 500);
        assert_eq!(result.codec, Codec::ZSTANDARD);
    }
}
