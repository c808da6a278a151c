//! File-backed store
//!
//! Stores disk contents in a regular image file. The file never grows
//! past the size it had when it was opened.

use super::create::create_image;
use super::{validate_block_size, BackingStore, StorageError, StorageResult, DEFAULT_BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// File-backed block store
pub struct FileStore {
    file: Option<File>,
    path: PathBuf,
    byte_size: u64,
    block_size: u32,
    position: u64,
    read_only: bool,
}

impl FileStore {
    /// Open an existing image
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path.as_ref())?;
        Self::from_file(file, path.as_ref(), read_only)
    }

    /// Open an image, creating it with `size_mb` megabytes first if the
    /// path does not exist. Creation progress is written to `progress`.
    pub fn open_or_create<P: AsRef<Path>>(
        path: P,
        size_mb: u64,
        read_only: bool,
        progress: &mut dyn Write,
    ) -> StorageResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::open(path, read_only);
        }

        let file = create_image(path, size_mb, read_only, progress)?;
        Self::from_file(file, path, read_only)
    }

    fn from_file(mut file: File, path: &Path, read_only: bool) -> StorageResult<Self> {
        // Size comes from the stream itself, not metadata
        let byte_size = file.seek(SeekFrom::End(0))?;
        file.seek(SeekFrom::Start(0))?;

        log::debug!(
            "Opened {:?} ({} bytes{})",
            path,
            byte_size,
            if read_only { ", read-only" } else { "" }
        );

        Ok(Self {
            file: Some(file),
            path: path.to_path_buf(),
            byte_size,
            block_size: DEFAULT_BLOCK_SIZE,
            position: 0,
            read_only,
        })
    }

    /// Path of the image
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn transfer<F>(&mut self, len: usize, mut op: F) -> usize
    where
        F: FnMut(&mut File, usize) -> std::io::Result<usize>,
    {
        let remaining = self.byte_size.saturating_sub(self.position);
        let len = len.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        let Some(file) = self.file.as_mut() else {
            return 0;
        };
        if len == 0 {
            return 0;
        }
        if let Err(e) = file.seek(SeekFrom::Start(self.position)) {
            log::warn!("{:?}: seek to {} failed: {}", self.path, self.position, e);
            return 0;
        }

        let mut done = 0;
        while done < len {
            match op(file, done) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::warn!("{:?}: transfer at {} failed: {}", self.path, self.position, e);
                    break;
                }
            }
        }

        self.position += done as u64;
        done
    }
}

impl BackingStore for FileStore {
    fn byte_size(&self) -> u64 {
        self.byte_size
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
        if offset >= self.byte_size {
            return Err(StorageError::OutOfRange {
                offset,
                size: self.byte_size,
            });
        }
        self.position = offset;
        Ok(())
    }

    fn read(&mut self, buf: &mut [u8]) -> usize {
        let len = buf.len();
        self.transfer(len, |file, done| file.read(&mut buf[done..len]))
    }

    fn write(&mut self, buf: &[u8]) -> usize {
        if self.read_only {
            return 0;
        }
        let len = buf.len();
        self.transfer(len, |file, done| file.write(&buf[done..len]))
    }

    fn close(&mut self) {
        if let Some(file) = self.file.take() {
            if !self.read_only {
                if let Err(e) = file.sync_all() {
                    log::warn!("{:?}: sync on close failed: {}", self.path, e);
                }
            }
            log::debug!("Closed {:?}", self.path);
        }
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        self.close();
    }
}
