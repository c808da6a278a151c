//! Image auto-creation
//!
//! Missing image files are created by writing zero-filled 1 MiB blocks
//! until the requested size is reached. Progress goes to a caller-supplied
//! writer as integer percentages.

use super::{StorageError, StorageResult};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Bytes written per step
pub const CREATE_BLOCK_SIZE: usize = 1024 * 1024;

/// Create `path` with `size_mb` megabytes of zeros, then reopen it.
///
/// Progress output is best effort; failures writing it are ignored.
pub fn create_image(
    path: &Path,
    size_mb: u64,
    read_only: bool,
    progress: &mut dyn Write,
) -> StorageResult<File> {
    let create_err = |source: io::Error| StorageError::Create {
        path: path.to_path_buf(),
        source,
    };

    // Probe that the path is writable before doing any real work
    let probe = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(create_err)?;
    drop(probe);

    log::info!("Creating image {:?} ({} MB)", path, size_mb);

    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(create_err)?;

    if let Err(e) = fill_zeros(&mut file, size_mb, progress).and_then(|()| file.sync_all()) {
        drop(file);
        return Err(discard_partial(path, e));
    }
    drop(file);

    let file = OpenOptions::new()
        .read(true)
        .write(!read_only)
        .open(path)
        .map_err(create_err)?;

    log::info!("Created image {:?}", path);
    Ok(file)
}

/// Write `size_mb` zero blocks, reporting percentages as it goes
fn fill_zeros<W: Write>(sink: &mut W, size_mb: u64, progress: &mut dyn Write) -> io::Result<()> {
    let block = vec![0u8; CREATE_BLOCK_SIZE];
    let mut last_percent = None;
    report(progress, 0, &mut last_percent);

    for written in 1..=size_mb {
        sink.write_all(&block)?;
        report(progress, written * 100 / size_mb, &mut last_percent);
    }
    if size_mb == 0 {
        report(progress, 100, &mut last_percent);
    }
    let _ = writeln!(progress);
    Ok(())
}

/// Remove a half-written image so the next attach does not mistake it
/// for a complete one
fn discard_partial(path: &Path, source: io::Error) -> StorageError {
    log::warn!("Creating {:?} failed, removing partial image: {}", path, source);
    if let Err(e) = std::fs::remove_file(path) {
        log::warn!("Cannot remove {:?}: {}", path, e);
    }
    StorageError::Create {
        path: path.to_path_buf(),
        source,
    }
}

fn report(progress: &mut dyn Write, percent: u64, last: &mut Option<u64>) {
    if *last == Some(percent) {
        return;
    }
    *last = Some(percent);
    let _ = write!(progress, "\r{}%", percent);
    let _ = progress.flush();
}
