//! OS file layer used by the store
//!
//! Wraps the handful of file operations the engine performs so the policy
//! around external deletion lives in one place: on Unix an unlinked file
//! stays readable through existing handles, and the engine relies on that
//! during compaction (in-flight readers finish against removed logs).

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

use crate::Result;

/// Create a new file, truncating any existing one.
pub fn create_file(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?)
}

/// Open an existing file read-only.
pub fn open_read_only(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).open(path)?)
}

/// Open an existing file for reading and writing.
pub fn open_read_write(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().read(true).write(true).open(path)?)
}

/// Open for appending, creating if absent.
pub fn open_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)?)
}

/// Remove a file. Handles other processes hold remain usable.
pub fn remove(path: &Path) -> Result<()> {
    Ok(std::fs::remove_file(path)?)
}

/// Read an exact range at an absolute offset without moving any cursor.
#[cfg(unix)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

/// Read an exact range at an absolute offset without moving any cursor.
#[cfg(windows)]
pub fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut read = 0;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "short read",
            ));
        }
        read += n;
    }
    Ok(())
}

/// Write an exact range at an absolute offset without moving any cursor.
#[cfg(unix)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

/// Write an exact range at an absolute offset without moving any cursor.
#[cfg(windows)]
pub fn write_all_at(file: &File, buf: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        written += n;
    }
    Ok(())
}

/// Flush file contents and metadata to stable storage, retrying a failed
/// sync once before surfacing the error.
pub fn fsync(file: &File) -> Result<()> {
    if let Err(first) = file.sync_all() {
        tracing::warn!("fsync failed, retrying once: {first}");
        file.sync_all()?;
    }
    Ok(())
}

/// Fsync the directory containing renamed files so the rename itself is
/// durable.
pub fn fsync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir)?;
    fsync(&handle)
}
