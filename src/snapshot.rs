//! Device state snapshots
//!
//! Every stateful device persists itself as one framed record:
//!
//! ```text
//! [u32 magic_start][i64 size][size bytes of state][u32 magic_end]
//! ```
//!
//! All integers are little-endian. Each device type owns its own pair of
//! magics and a fixed state size; a record whose size differs comes from an
//! incompatible build and is rejected before any live state is touched.

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::Serialize;
use std::io::{self, Read, Write};
use thiserror::Error;

/// Bytes of framing around each payload
pub const RECORD_OVERHEAD: usize = 4 + 8 + 4;

/// Snapshot errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{which} magic mismatch: expected {expected:#010x}, found {found:#010x}")]
    MagicMismatch {
        which: MagicPosition,
        expected: u32,
        found: u32,
    },

    #[error("state size mismatch: expected {expected} bytes, found {found} (incompatible version?)")]
    SizeMismatch { expected: usize, found: i64 },

    #[error("record truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },

    #[error("invalid state: {0}")]
    InvalidState(String),
}

/// Which of the two magics failed to match
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MagicPosition {
    Start,
    End,
}

impl std::fmt::Display for MagicPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MagicPosition::Start => write!(f, "leading"),
            MagicPosition::End => write!(f, "trailing"),
        }
    }
}

/// Result type for snapshot operations
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Write one record. Returns the number of bytes written.
pub fn save<W: Write>(
    state: &[u8],
    magic_start: u32,
    magic_end: u32,
    sink: &mut W,
) -> io::Result<usize> {
    sink.write_u32::<LittleEndian>(magic_start)?;
    sink.write_i64::<LittleEndian>(state.len() as i64)?;
    sink.write_all(state)?;
    sink.write_u32::<LittleEndian>(magic_end)?;
    Ok(RECORD_OVERHEAD + state.len())
}

/// Read and validate one record, returning its payload.
pub fn restore<R: Read>(
    source: &mut R,
    magic_start: u32,
    magic_end: u32,
    expected_size: usize,
) -> SnapshotResult<Vec<u8>> {
    let found = read_magic(source)?;
    if found != magic_start {
        return Err(SnapshotError::MagicMismatch {
            which: MagicPosition::Start,
            expected: magic_start,
            found,
        });
    }

    let size = read_size(source)?;
    if size < 0 || size as u64 != expected_size as u64 {
        return Err(SnapshotError::SizeMismatch {
            expected: expected_size,
            found: size,
        });
    }

    let mut payload = vec![0u8; expected_size];
    let got = read_full(source, &mut payload)?;
    if got < expected_size {
        return Err(SnapshotError::Truncated {
            expected: expected_size,
            got,
        });
    }

    let found = read_magic(source)?;
    if found != magic_end {
        return Err(SnapshotError::MagicMismatch {
            which: MagicPosition::End,
            expected: magic_end,
            found,
        });
    }

    Ok(payload)
}

/// Fill a fixed-size header field; a short read reports how much of the
/// field arrived
fn read_field<R: Read, const N: usize>(source: &mut R) -> SnapshotResult<[u8; N]> {
    let mut field = [0u8; N];
    let got = read_full(source, &mut field)?;
    if got < N {
        return Err(SnapshotError::Truncated { expected: N, got });
    }
    Ok(field)
}

fn read_magic<R: Read>(source: &mut R) -> SnapshotResult<u32> {
    read_field::<R, 4>(source).map(|field| LittleEndian::read_u32(&field))
}

fn read_size<R: Read>(source: &mut R) -> SnapshotResult<i64> {
    read_field::<R, 8>(source).map(|field| LittleEndian::read_i64(&field))
}

fn read_full<R: Read>(source: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match source.read(&mut buf[done..]) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

/// A device whose state can be captured in a snapshot record
pub trait Snapshot {
    /// Leading record magic for this device type
    const MAGIC_START: u32;
    /// Trailing record magic for this device type
    const MAGIC_END: u32;
    /// Exact encoded state size for this build
    const STATE_SIZE: usize;

    /// Encode the live state. Must return exactly `STATE_SIZE` bytes.
    fn save_state(&self) -> Vec<u8>;

    /// Apply a decoded state blob of `STATE_SIZE` bytes.
    ///
    /// Implementations validate the whole blob before mutating anything.
    fn load_state(&mut self, state: &[u8]) -> SnapshotResult<()>;
}

/// Save a device as one record
pub fn save_device<D: Snapshot, W: Write>(device: &D, sink: &mut W) -> io::Result<usize> {
    let state = device.save_state();
    debug_assert_eq!(state.len(), D::STATE_SIZE);
    let written = save(&state, D::MAGIC_START, D::MAGIC_END, sink)?;
    log::debug!("Saved snapshot record {:#010x} ({} bytes)", D::MAGIC_START, written);
    Ok(written)
}

/// Restore a device from the next record in `source`
pub fn restore_device<D: Snapshot, R: Read>(device: &mut D, source: &mut R) -> SnapshotResult<()> {
    let state = restore(source, D::MAGIC_START, D::MAGIC_END, D::STATE_SIZE).map_err(|e| {
        log::warn!("Rejected snapshot record {:#010x}: {}", D::MAGIC_START, e);
        e
    })?;
    device.load_state(&state)?;
    log::debug!("Restored snapshot record {:#010x}", D::MAGIC_START);
    Ok(())
}

/// Header of a record found while scanning a snapshot stream
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RecordInfo {
    /// Byte offset of the record within the stream
    pub offset: u64,
    pub magic_start: u32,
    pub size: i64,
    pub magic_end: u32,
}

/// Walk every record in a stream without interpreting payloads.
///
/// Stops cleanly at end of stream; a record cut short yields `Truncated`.
pub fn scan_records<R: Read>(source: &mut R) -> SnapshotResult<Vec<RecordInfo>> {
    let mut records = Vec::new();
    let mut offset = 0u64;

    loop {
        let mut head = [0u8; 4];
        let got = read_full(source, &mut head)?;
        if got == 0 {
            break;
        }
        if got < head.len() {
            return Err(SnapshotError::Truncated { expected: 4, got });
        }
        let magic_start = LittleEndian::read_u32(&head);

        let size = read_size(source)?;
        if size < 0 {
            return Err(SnapshotError::SizeMismatch {
                expected: 0,
                found: size,
            });
        }

        let skipped = io::copy(&mut source.by_ref().take(size as u64), &mut io::sink())?;
        if skipped < size as u64 {
            return Err(SnapshotError::Truncated {
                expected: size as usize,
                got: skipped as usize,
            });
        }
        let magic_end = read_magic(source)?;

        records.push(RecordInfo {
            offset,
            magic_start,
            size,
            magic_end,
        });
        offset += RECORD_OVERHEAD as u64 + size as u64;
    }

    Ok(records)
}

/// Little-endian field writer for fixed-layout state blobs
pub(crate) struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    pub fn with_capacity(size: usize) -> Self {
        Self {
            buf: Vec::with_capacity(size),
        }
    }

    pub fn u8(&mut self, v: u8) -> &mut Self {
        self.buf.push(v);
        self
    }

    // Writes into a Vec cannot fail
    pub fn u32(&mut self, v: u32) -> &mut Self {
        let _ = self.buf.write_u32::<LittleEndian>(v);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        let _ = self.buf.write_u64::<LittleEndian>(v);
        self
    }

    pub fn bytes(&mut self, v: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(v);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Little-endian field reader matching [`StateWriter`]
pub(crate) struct StateReader<'a> {
    cursor: io::Cursor<&'a [u8]>,
}

impl<'a> StateReader<'a> {
    pub fn new(state: &'a [u8]) -> Self {
        Self {
            cursor: io::Cursor::new(state),
        }
    }

    pub fn u8(&mut self) -> SnapshotResult<u8> {
        Ok(self.cursor.read_u8()?)
    }

    pub fn u32(&mut self) -> SnapshotResult<u32> {
        Ok(self.cursor.read_u32::<LittleEndian>()?)
    }

    pub fn u64(&mut self) -> SnapshotResult<u64> {
        Ok(self.cursor.read_u64::<LittleEndian>()?)
    }

    pub fn bytes(&mut self, out: &mut [u8]) -> SnapshotResult<()> {
        self.cursor.read_exact(out)?;
        Ok(())
    }
}
