use crate::error::{Error, ErrorFlags, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, Read};

/// Read cursor over a memory-mapped model file.
#[derive(Debug)]
pub(crate) struct MemoryMapper {
    mmap: Mmap,
    offset: usize,
}

impl MemoryMapper {
    pub fn new(file: &File) -> Result<Self> {
        // SAFETY: the mapping is read-only and only lives while the loader runs;
        // tensor payloads are copied out before it is dropped.
        let mmap = unsafe { memmap2::MmapOptions::new().map(file) }
            .map_err(|e| Error::new(ErrorFlags::FILE | ErrorFlags::FILE_READ, format!("Failed to create memory mapping: {e}")))?;
        Ok(Self { mmap, offset: 0 })
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.len() - self.offset
    }

    pub fn is_exhausted(&self) -> bool {
        self.offset >= self.mmap.len()
    }

    pub fn get_bytes(&mut self, count: usize) -> Result<&[u8]> {
        if count > self.remaining() {
            return Error::fail(
                ErrorFlags::FILE_READ,
                format!("Insufficient data: need {} bytes, have {} remaining", count, self.remaining()),
            );
        }

        let result = &self.mmap[self.offset..self.offset + count];
        self.offset += count;
        Ok(result)
    }
}

impl Read for MemoryMapper {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let count = buf.len().min(self.remaining());
        buf[..count].copy_from_slice(&self.mmap[self.offset..self.offset + count]);
        self.offset += count;
        Ok(count)
    }
}

/// Rounds `size` up to the next multiple of `align` (a power of two).
#[inline]
pub(crate) fn align_up(size: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (size + align - 1) & !(align - 1)
}
