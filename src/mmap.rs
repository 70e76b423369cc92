use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};

use crate::source::ReadAt;
use crate::{Error, Result};

/// A read-only memory-mapped container file.
pub struct MmapSource {
    _file: File,
    map: Mmap,
    len: usize,
}

impl MmapSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::InvalidInput("compressed size is too small"));
        }
        let map = unsafe { MmapOptions::new().len(len).map(&file)? };
        Ok(Self {
            _file: file,
            map,
            len,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl ReadAt for MmapSource {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }

    fn size(&self) -> io::Result<u64> {
        Ok(self.len as u64)
    }
}
