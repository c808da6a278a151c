//! Disk lifecycle
//!
//! Turns a disk configuration into an attached disk: opens (or
//! auto-creates) the backing store and works out the model string. The
//! layout is always derived from the medium, never cached.

use crate::config::{BackendType, DiskConfig};
use crate::snapshot::{Snapshot, SnapshotError, SnapshotResult, StateReader, StateWriter};
use crate::storage::{self, BackingStore, DiskGeometry, StorageError, StoreDescriptor};
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

const MB: u64 = 1024 * 1024;

/// Model string for memory-backed disks without an override
pub const MEMORY_MODEL: &str = "Memory Disk";

/// Disk errors
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("cannot attach target {target}: {source}")]
    Attach {
        target: u8,
        #[source]
        source: StorageError,
    },

    #[error("invalid disk configuration: {0}")]
    Config(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for disk operations
pub type DiskResult<T> = Result<T, DiskError>;

/// Default model string for an image path: the file name alone.
///
/// Both `/` and `\` count as separators so Windows-style paths from old
/// configurations come out the same.
pub fn model_from_path(path: &str) -> String {
    path.rsplit(['/', '\\']).next().unwrap_or(path).to_string()
}

/// Build the store descriptor for a disk configuration
pub fn descriptor(config: &DiskConfig) -> DiskResult<StoreDescriptor> {
    match config.backend {
        BackendType::File => {
            let path = config.path.as_ref().ok_or_else(|| {
                DiskError::Config(format!("target {} has no image path", config.target))
            })?;
            Ok(StoreDescriptor::File {
                path: PathBuf::from(path),
                create_size_mb: config.size.map(|bytes| bytes.div_ceil(MB)),
                block_size: config.block_size,
                read_only: config.read_only,
            })
        }
        BackendType::Memory => {
            let size = config.size.ok_or_else(|| {
                DiskError::Config(format!("target {} has no memory size", config.target))
            })?;
            Ok(StoreDescriptor::Memory {
                size,
                block_size: config.block_size,
                read_only: config.read_only,
            })
        }
    }
}

/// An attached disk: backing store plus identity and layout
pub struct Disk {
    store: Box<dyn BackingStore>,
    model: String,
}

impl Disk {
    /// Attach a disk, reporting auto-creation progress on stderr
    pub fn attach(config: &DiskConfig) -> DiskResult<Self> {
        Self::attach_with_progress(config, &mut std::io::stderr())
    }

    /// Attach a disk, reporting auto-creation progress to `progress`
    pub fn attach_with_progress(config: &DiskConfig, progress: &mut dyn Write) -> DiskResult<Self> {
        let store = storage::open(&descriptor(config)?, progress).map_err(|source| {
            DiskError::Attach {
                target: config.target,
                source,
            }
        })?;

        let model = match (&config.model, &config.path, config.backend) {
            (Some(model), _, _) => model.clone(),
            (None, Some(path), BackendType::File) => model_from_path(path),
            _ => MEMORY_MODEL.to_string(),
        };

        let disk = Self::from_store(store, model);
        let geometry = disk.geometry();
        log::info!(
            "Attached target {}: {} ({} bytes, C/H/S {}/{}/{}, {} byte blocks{})",
            config.target,
            disk.model,
            disk.store.byte_size(),
            geometry.cylinders,
            geometry.heads,
            geometry.sectors,
            geometry.block_size,
            if disk.store.is_read_only() { ", read-only" } else { "" }
        );
        Ok(disk)
    }

    /// Wrap an already opened store
    pub fn from_store(store: Box<dyn BackingStore>, model: String) -> Self {
        Self { store, model }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Layout of the medium as it is now; memory media grow on writes
    pub fn geometry(&self) -> DiskGeometry {
        self.store.geometry()
    }

    pub fn store(&self) -> &dyn BackingStore {
        self.store.as_ref()
    }

    pub fn store_mut(&mut self) -> &mut dyn BackingStore {
        self.store.as_mut()
    }

    /// Change the block size; the layout follows
    pub fn set_block_size(&mut self, block_size: u32) -> DiskResult<()> {
        self.store.set_block_size(block_size)?;
        Ok(())
    }

    /// Seek to `offset` and read into `buf`
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> DiskResult<usize> {
        self.store.seek(offset)?;
        Ok(self.store.read(buf))
    }

    /// Seek to `offset` and write `buf`. Read-only disks transfer nothing.
    pub fn write_at(&mut self, offset: u64, buf: &[u8]) -> DiskResult<usize> {
        self.store.seek(offset)?;
        Ok(self.store.write(buf))
    }

    /// Release the backing store
    pub fn detach(mut self) {
        self.store.close();
        log::info!("Detached {}", self.model);
    }
}

impl Snapshot for Disk {
    const MAGIC_START: u32 = 0x4B53_4944;
    const MAGIC_END: u32 = 0x4449_534B;
    const STATE_SIZE: usize = 24;

    fn save_state(&self) -> Vec<u8> {
        StateWriter::with_capacity(Self::STATE_SIZE)
            .u64(self.store.byte_size())
            .u64(self.store.position())
            .u32(self.store.block_size())
            .u8(self.store.is_read_only() as u8)
            .bytes(&[0; 3])
            .finish()
    }

    fn load_state(&mut self, state: &[u8]) -> SnapshotResult<()> {
        let mut reader = StateReader::new(state);
        let byte_size = reader.u64()?;
        let position = reader.u64()?;
        let block_size = reader.u32()?;
        let read_only = reader.u8()? != 0;

        if read_only != self.store.is_read_only() {
            return Err(SnapshotError::InvalidState(format!(
                "{}: snapshot was taken {}",
                self.model,
                if read_only { "read-only" } else { "writable" }
            )));
        }
        if byte_size != self.store.byte_size() {
            return Err(SnapshotError::InvalidState(format!(
                "medium is {} bytes, snapshot was taken with {}",
                self.store.byte_size(),
                byte_size
            )));
        }
        if position > byte_size {
            return Err(SnapshotError::InvalidState(format!(
                "position {} past end of medium",
                position
            )));
        }
        storage::validate_block_size(block_size)
            .map_err(|e| SnapshotError::InvalidState(e.to_string()))?;

        self.set_block_size(block_size)
            .map_err(|e| SnapshotError::InvalidState(e.to_string()))?;
        if position < byte_size {
            self.store
                .seek(position)
                .map_err(|e| SnapshotError::InvalidState(e.to_string()))?;
        } else if byte_size > 0 {
            // The end position is only reachable through a transfer
            self.store
                .seek(byte_size - 1)
                .map_err(|e| SnapshotError::InvalidState(e.to_string()))?;
            self.store.read(&mut [0u8; 1]);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{restore_device, save_device};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn file_config(path: &str, size: Option<u64>) -> DiskConfig {
        DiskConfig {
            target: 0,
            backend: BackendType::File,
            path: Some(path.to_string()),
            size,
            block_size: 512,
            model: None,
            read_only: false,
        }
    }

    fn memory_config(size: u64) -> DiskConfig {
        DiskConfig {
            target: 1,
            backend: BackendType::Memory,
            path: None,
            size: Some(size),
            block_size: 512,
            model: None,
            read_only: false,
        }
    }

    #[test]
    fn test_model_from_path() {
        assert_eq!(model_from_path("/var/lib/disks/boot.img"), "boot.img");
        assert_eq!(model_from_path("C:\\images\\hd0.raw"), "hd0.raw");
        assert_eq!(model_from_path("mixed/dir\\name.dsk"), "name.dsk");
        assert_eq!(model_from_path("plain.img"), "plain.img");
    }

    #[test]
    fn test_attach_auto_creates() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("hd0.img");
        let config = file_config(path.to_str().unwrap(), Some(2 * MB));

        let mut progress = Vec::new();
        let disk = Disk::attach_with_progress(&config, &mut progress).unwrap();

        assert!(path.exists());
        assert_eq!(disk.model(), "hd0.img");
        assert_eq!(disk.store().byte_size(), 2 * MB);
        assert_eq!(disk.geometry().cylinders, 2 * MB / 512 / 256);
        assert!(String::from_utf8(progress).unwrap().contains("100%"));
    }

    #[test]
    fn test_attach_rounds_size_up_to_whole_mb() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("odd.img");
        let config = file_config(path.to_str().unwrap(), Some(MB + 1));

        let disk = Disk::attach_with_progress(&config, &mut std::io::sink()).unwrap();
        assert_eq!(disk.store().byte_size(), 2 * MB);
    }

    #[test]
    fn test_attach_failure_does_not_attach() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("missing").join("hd0.img");
        let config = file_config(path.to_str().unwrap(), Some(MB));

        let result = Disk::attach_with_progress(&config, &mut std::io::sink());
        assert!(matches!(
            result,
            Err(DiskError::Attach {
                target: 0,
                source: StorageError::Create { .. }
            })
        ));
    }

    #[test]
    fn test_model_override() {
        let mut config = memory_config(MB);
        assert_eq!(Disk::attach(&config).unwrap().model(), MEMORY_MODEL);

        config.model = Some("CDROM DRIVE".to_string());
        assert_eq!(Disk::attach(&config).unwrap().model(), "CDROM DRIVE");
    }

    #[test]
    fn test_block_size_recomputes_geometry() {
        let mut disk = Disk::attach(&memory_config(64 * MB)).unwrap();
        assert_eq!(disk.geometry().cylinders, 512);

        disk.set_block_size(storage::OPTICAL_BLOCK_SIZE).unwrap();
        assert_eq!(disk.geometry().cylinders, 128);
        assert_eq!(disk.geometry().block_size, 2048);
    }

    #[test]
    fn test_read_write_at() {
        let mut disk = Disk::attach(&memory_config(MB)).unwrap();
        assert_eq!(disk.write_at(4096, b"hello").unwrap(), 5);

        let mut buf = [0u8; 5];
        assert_eq!(disk.read_at(4096, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");
        assert!(matches!(
            disk.read_at(MB, &mut buf),
            Err(DiskError::Storage(StorageError::OutOfRange { .. }))
        ));
    }

    #[test]
    fn test_disk_snapshot_round_trip() {
        let mut disk = Disk::attach(&memory_config(MB)).unwrap();
        disk.set_block_size(2048).unwrap();
        disk.store_mut().seek(12345).unwrap();

        let mut out = Vec::new();
        save_device(&disk, &mut out).unwrap();

        let mut restored = Disk::attach(&memory_config(MB)).unwrap();
        restore_device(&mut restored, &mut Cursor::new(out)).unwrap();
        assert_eq!(restored.store().position(), 12345);
        assert_eq!(restored.geometry(), disk.geometry());
        assert_eq!(restored.save_state(), disk.save_state());
    }

    #[test]
    fn test_disk_snapshot_position_at_end() {
        let mut disk = Disk::attach(&memory_config(4096)).unwrap();
        disk.store_mut().seek(4000).unwrap();
        let mut buf = [0u8; 200];
        disk.store_mut().read(&mut buf);
        assert_eq!(disk.store().position(), 4096);

        let mut out = Vec::new();
        save_device(&disk, &mut out).unwrap();

        let mut restored = Disk::attach(&memory_config(4096)).unwrap();
        restore_device(&mut restored, &mut Cursor::new(out)).unwrap();
        assert_eq!(restored.store().position(), 4096);
    }

    #[test]
    fn test_geometry_follows_growing_medium() {
        let mut disk = Disk::attach(&memory_config(MB)).unwrap();
        assert_eq!(disk.geometry().cylinders, 8);

        assert_eq!(disk.write_at(MB - 1, &vec![1u8; MB as usize]).unwrap(), MB as usize);
        assert_eq!(disk.store().byte_size(), 2 * MB - 1);
        assert_eq!(disk.geometry(), disk.store().geometry());
        assert_eq!(disk.geometry().cylinders, 15);
    }

    #[test]
    fn test_disk_snapshot_read_only_mismatch_rejected() {
        let mut config = memory_config(MB);
        config.read_only = true;
        let protected = Disk::attach(&config).unwrap();
        let mut out = Vec::new();
        save_device(&protected, &mut out).unwrap();

        let mut writable = Disk::attach(&memory_config(MB)).unwrap();
        writable.store_mut().seek(99).unwrap();
        let result = restore_device(&mut writable, &mut Cursor::new(out));
        assert!(matches!(result, Err(SnapshotError::InvalidState(_))));
        assert_eq!(writable.store().position(), 99);
        assert!(!writable.store().is_read_only());
    }

    #[test]
    fn test_disk_snapshot_other_medium_rejected() {
        let disk = Disk::attach(&memory_config(MB)).unwrap();
        let mut out = Vec::new();
        save_device(&disk, &mut out).unwrap();

        let mut other = Disk::attach(&memory_config(2 * MB)).unwrap();
        other.store_mut().seek(77).unwrap();
        let result = restore_device(&mut other, &mut Cursor::new(out));
        assert!(matches!(result, Err(SnapshotError::InvalidState(_))));
        assert_eq!(other.store().position(), 77);
    }
}
