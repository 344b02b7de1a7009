use std::fs::{self, TryLockError};
use std::io::{self, Cursor, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use tempfile::Builder;
use zip::ZipArchive;

use crate::error::BidaliError;

const LEASE_POLL: Duration = Duration::from_millis(5);

/// Writes `content` next to `path` and renames it into place, so readers see
/// either the old file or the new one.
pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), BidaliError> {
    let parent = path
        .parent()
        .ok_or_else(|| BidaliError::Filesystem(format!("invalid destination path {path}")))?;
    fs::create_dir_all(parent.as_std_path()).map_err(BidaliError::fs)?;
    let mut temp = Builder::new()
        .prefix(".bidali-write")
        .suffix(".tmp")
        .tempfile_in(parent.as_std_path())
        .map_err(BidaliError::fs)?;
    temp.write_all(content).map_err(BidaliError::fs)?;
    temp.as_file().sync_all().map_err(BidaliError::fs)?;
    temp.persist(path.as_std_path())
        .map_err(|err| BidaliError::Filesystem(err.error.to_string()))?;
    if let Ok(dir) = fs::File::open(parent.as_std_path()) {
        let _ = dir.sync_all();
    }
    Ok(())
}

pub fn remove_if_exists(path: &Utf8Path) -> Result<bool, BidaliError> {
    match fs::remove_file(path.as_std_path()) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(BidaliError::Filesystem(format!("remove {path}: {err}"))),
    }
}

/// Exclusive lease on one cache entry, shared by every process using the
/// same cache directory. Backed by an OS lock on a lock file that stays on
/// disk; the lock goes away with the holder, even if it crashes.
#[derive(Debug)]
pub struct EntryLease {
    file: fs::File,
}

impl EntryLease {
    pub fn acquire(path: &Utf8Path, timeout: Duration) -> Result<Self, BidaliError> {
        let started = Instant::now();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(BidaliError::fs)?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.as_std_path())
            .map_err(|err| BidaliError::Filesystem(format!("lease {path}: {err}")))?;
        loop {
            match file.try_lock() {
                Ok(()) => return Ok(Self { file }),
                Err(TryLockError::WouldBlock) => {
                    if started.elapsed() >= timeout {
                        return Err(BidaliError::LockTimeout(path.as_std_path().to_path_buf()));
                    }
                    thread::sleep(LEASE_POLL);
                }
                Err(TryLockError::Error(err)) => {
                    return Err(BidaliError::Filesystem(format!("lease {path}: {err}")));
                }
            }
        }
    }
}

impl Drop for EntryLease {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Reads one file out of an in-memory zip archive. With no member name the
/// archive must hold exactly one file.
pub fn read_zip_member(archive_bytes: &[u8], member: Option<&str>) -> Result<Vec<u8>, String> {
    let mut archive =
        ZipArchive::new(Cursor::new(archive_bytes)).map_err(|err| format!("open zip: {err}"))?;

    let mut files = Vec::new();
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(|err| err.to_string())?;
        if entry.is_dir() {
            continue;
        }
        let path = entry
            .enclosed_name()
            .ok_or_else(|| "zip entry path traversal detected".to_string())?;
        files.push((i, path.to_string_lossy().replace('\\', "/")));
    }

    let index = match member {
        Some(name) => files
            .iter()
            .find(|(_, path)| path == name || path.ends_with(&format!("/{name}")))
            .map(|(i, _)| *i)
            .ok_or_else(|| format!("zip member {name} not found"))?,
        None => match files.as_slice() {
            [(i, _)] => *i,
            [] => return Err("zip archive is empty".to_string()),
            _ => return Err(format!("zip archive holds {} files, name one", files.len())),
        },
    };

    let mut entry = archive.by_index(index).map_err(|err| err.to_string())?;
    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(|err| format!("read zip member: {err}"))?;
    Ok(content)
}
