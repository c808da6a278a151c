//! Disk backing stores
//!
//! This module defines the BackingStore trait and its file and memory
//! implementations. Every emulated disk talks to its medium only through
//! the trait, so a controller never knows which variant it holds.

pub mod create;
pub mod file;
pub mod memory;

use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

/// Default logical block size for hard disks
pub const DEFAULT_BLOCK_SIZE: u32 = 512;

/// Logical block size for optical media
pub const OPTICAL_BLOCK_SIZE: u32 = 2048;

/// Size used when auto-creating a missing image and nothing else is configured
pub const DEFAULT_CREATE_SIZE_MB: u64 = 5000;

/// Largest memory-backed store a configuration may ask for (16 GiB)
pub const MAX_MEMORY_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Fixed number of heads in the emulated layout
pub const HEADS: u32 = 8;

/// Fixed number of sectors per track in the emulated layout
pub const SECTORS: u32 = 32;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("offset out of range: {offset} (size: {size})")]
    OutOfRange { offset: u64, size: u64 },

    #[error("cannot create image {path:?}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid block size: {0}")]
    InvalidBlockSize(u32),

    #[error("cannot allocate {0} bytes for a memory store")]
    Allocation(u64),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Cylinder/head/sector layout derived from a store's size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    pub cylinders: u64,
    pub heads: u32,
    pub sectors: u32,
    pub block_size: u32,
}

impl DiskGeometry {
    /// Number of whole blocks addressable through this layout
    pub fn total_blocks(&self) -> u64 {
        self.cylinders * self.heads as u64 * self.sectors as u64
    }

    /// Bytes covered by the layout; never exceeds the store size
    pub fn capacity(&self) -> u64 {
        self.total_blocks() * self.block_size as u64
    }
}

/// Derive the layout for a store of `byte_size` bytes.
///
/// Heads and sectors are fixed; the cylinder count is whatever fits,
/// rounded down.
pub fn determine_layout(byte_size: u64, block_size: u32) -> DiskGeometry {
    let per_cylinder = HEADS as u64 * SECTORS as u64;
    let cylinders = if block_size == 0 {
        0
    } else {
        byte_size / block_size as u64 / per_cylinder
    };

    DiskGeometry {
        cylinders,
        heads: HEADS,
        sectors: SECTORS,
        block_size,
    }
}

/// Check that a block size is usable by the layout code
pub fn validate_block_size(block_size: u32) -> StorageResult<()> {
    if block_size < DEFAULT_BLOCK_SIZE || !block_size.is_power_of_two() {
        return Err(StorageError::InvalidBlockSize(block_size));
    }
    Ok(())
}

/// Backing store trait - the capability set every disk medium provides
pub trait BackingStore {
    /// Total addressable bytes.
    fn byte_size(&self) -> u64;

    /// Logical sector size.
    fn block_size(&self) -> u32;

    /// Change the logical sector size. The geometry follows.
    fn set_block_size(&mut self, block_size: u32) -> StorageResult<()>;

    /// Current byte offset.
    fn position(&self) -> u64;

    /// Whether writes are discarded.
    fn is_read_only(&self) -> bool;

    /// Move to `offset`. Offsets at or past the end are rejected and the
    /// position is left where it was.
    fn seek(&mut self, offset: u64) -> StorageResult<()>;

    /// Read up to `buf.len()` bytes at the current position.
    /// Returns the number of bytes transferred, 0 at end of store.
    fn read(&mut self, buf: &mut [u8]) -> usize;

    /// Write up to `buf.len()` bytes at the current position.
    /// A read-only store transfers nothing and returns 0.
    fn write(&mut self, buf: &[u8]) -> usize;

    /// Release the underlying resource. Calling it twice is harmless.
    fn close(&mut self);

    /// Layout derived from the current size and block size
    fn geometry(&self) -> DiskGeometry {
        determine_layout(self.byte_size(), self.block_size())
    }
}

/// How to open a backing store
#[derive(Debug, Clone)]
pub enum StoreDescriptor {
    /// Image file, created with `create_size_mb` megabytes if missing
    File {
        path: PathBuf,
        create_size_mb: Option<u64>,
        block_size: u32,
        read_only: bool,
    },
    /// Zero-filled buffer of `size` bytes
    Memory {
        size: u64,
        block_size: u32,
        read_only: bool,
    },
}

/// Open the store a descriptor names. A missing image file is created
/// first, with progress written to `progress`.
pub fn open(
    descriptor: &StoreDescriptor,
    progress: &mut dyn Write,
) -> StorageResult<Box<dyn BackingStore>> {
    match descriptor {
        StoreDescriptor::File {
            path,
            create_size_mb,
            block_size,
            read_only,
        } => {
            let size_mb = create_size_mb.unwrap_or(DEFAULT_CREATE_SIZE_MB);
            let mut store = file::FileStore::open_or_create(path, size_mb, *read_only, progress)?;
            store.set_block_size(*block_size)?;
            Ok(Box::new(store))
        }
        StoreDescriptor::Memory {
            size,
            block_size,
            read_only,
        } => {
            let mut store = memory::MemoryStore::new(*size)?;
            store.set_block_size(*block_size)?;
            store.set_read_only(*read_only);
            Ok(Box::new(store))
        }
    }
}

// Re-export stores
pub use file::FileStore;
pub use memory::MemoryStore;

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn test_layout_formula() {
        for &(size, block) in &[
            (0u64, 512u32),
            (511, 512),
            (131_072, 512),
            (10 * MB + 17, 512),
            (650 * MB, 2048),
            (u64::MAX, 4096),
        ] {
            let geometry = determine_layout(size, block);
            assert_eq!(geometry.heads, 8);
            assert_eq!(geometry.sectors, 32);
            assert_eq!(geometry.cylinders, size / block as u64 / 256);
            assert!(geometry.cylinders * 256 * block as u64 <= size);
        }
    }

    #[test]
    fn test_default_create_size_layout() {
        let geometry = determine_layout(DEFAULT_CREATE_SIZE_MB * MB, DEFAULT_BLOCK_SIZE);
        assert_eq!(geometry.cylinders, 40960);
        assert_eq!(geometry.capacity(), DEFAULT_CREATE_SIZE_MB * MB);
    }

    #[test]
    fn test_block_size_validation() {
        assert!(validate_block_size(512).is_ok());
        assert!(validate_block_size(OPTICAL_BLOCK_SIZE).is_ok());
        assert!(matches!(
            validate_block_size(256),
            Err(StorageError::InvalidBlockSize(256))
        ));
        assert!(validate_block_size(1000).is_err());
    }

    #[test]
    fn test_open_memory_descriptor() {
        let store = open(
            &StoreDescriptor::Memory {
                size: 4 * MB,
                block_size: 2048,
                read_only: true,
            },
            &mut std::io::sink(),
        )
        .unwrap();

        assert_eq!(store.byte_size(), 4 * MB);
        assert!(store.is_read_only());
        assert_eq!(store.geometry().cylinders, 4 * MB / 2048 / 256);
    }

    #[test]
    fn test_open_file_descriptor_creates_missing_image() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("scratch.img");
        let descriptor = StoreDescriptor::File {
            path: path.clone(),
            create_size_mb: Some(2),
            block_size: OPTICAL_BLOCK_SIZE,
            read_only: false,
        };

        let mut progress = Vec::new();
        let mut store = open(&descriptor, &mut progress).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * MB);
        assert_eq!(String::from_utf8(progress).unwrap(), "\r0%\r50%\r100%\n");
        assert_eq!(store.byte_size(), 2 * MB);
        assert_eq!(store.block_size(), OPTICAL_BLOCK_SIZE);
        assert_eq!(store.geometry().cylinders, 2 * MB / 2048 / 256);
        store.close();

        // Existing image: opened as is, nothing reported
        let mut progress = Vec::new();
        let store = open(&descriptor, &mut progress).unwrap();
        assert!(progress.is_empty());
        assert_eq!(store.byte_size(), 2 * MB);
    }

    #[test]
    fn test_open_oversized_memory_descriptor() {
        let result = open(
            &StoreDescriptor::Memory {
                size: u64::MAX,
                block_size: DEFAULT_BLOCK_SIZE,
                read_only: false,
            },
            &mut std::io::sink(),
        );
        assert!(matches!(result, Err(StorageError::Allocation(_))));
    }
}
