//! Memory-backed store.

use super::{validate_block_size, BackingStore, StorageError, StorageResult, DEFAULT_BLOCK_SIZE};

/// Block store held entirely in memory. Writes at the end grow it.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    data: Vec<u8>,
    block_size: u32,
    position: u64,
    read_only: bool,
}

impl MemoryStore {
    /// Zero-filled store of `size` bytes. Fails instead of aborting when the
    /// buffer cannot be allocated.
    pub fn new(size: u64) -> StorageResult<Self> {
        let len = usize::try_from(size).map_err(|_| StorageError::Allocation(size))?;
        let mut data = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| StorageError::Allocation(size))?;
        data.resize(len, 0);
        Ok(Self::from_bytes(data))
    }

    /// Store initialised with existing contents
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self {
            data,
            block_size: DEFAULT_BLOCK_SIZE,
            position: 0,
            read_only: false,
        }
    }

    pub fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }

    /// Raw contents
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

impl BackingStore for MemoryStore {
    fn byte_size(&self) -> u64 {
        self.data.len() as u64
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn set_block_size(&mut self, block_size: u32) -> StorageResult<()> {
        validate_block_size(block_size)?;
        self.block_size = block_size;
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn seek(&mut self, offset: u64) -> StorageResult<()> {
        if offset >= self.byte_size() {
            return Err(StorageError::OutOfRange {
                offset,
                size: self.byte_size(),
            });
        }
        self.position = offset;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let start = self.position as usize;
        let n = buf.len().min(self.data.len().saturating_sub(start));
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.position += n as u64;
        n
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        if self.read_only {
            return 0;
        }
        let start = self.position as usize;
        let end = start + buf.len();
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[start..end].copy_from_slice(buf);
        self.position = end as u64;
        buf.len()
    }

    fn close(&mut self) {
        self.data = Vec::new();
        self.position = 0;
    }
}
