//! On-disk cache of raw dataset payloads.
//!
//! Layout: `<cache_root>/<dataset>/<fingerprint>.payload` with a
//! `<fingerprint>.meta` JSON sidecar and a `<fingerprint>.lock` file that
//! carries the entry lease. Payload and sidecar are each replaced with write-temp-then-rename,
//! and both reads and writes hold the lease, so a reader never pairs a new
//! payload with an old sidecar.

use std::fs;
use std::io;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{DatasetName, Ttl};
use crate::error::BidaliError;
use crate::fingerprint::{Fingerprint, payload_checksum};
use crate::fs_util::{EntryLease, remove_if_exists, write_bytes_atomic};

pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Addresses one entry: the dataset directory plus the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub dataset: DatasetName,
    pub fingerprint: Fingerprint,
}

impl EntryKey {
    pub fn new(dataset: DatasetName, fingerprint: Fingerprint) -> Self {
        Self {
            dataset,
            fingerprint,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    pub dataset: String,
    pub fingerprint: String,
    pub fetched_at: DateTime<Utc>,
    pub ttl_secs: Option<u64>,
    pub source_checksum: String,
    pub payload_checksum: String,
    pub payload_len: u64,
    pub source: String,
    pub schema_version: u32,
    pub tool: String,
}

/// What the caller supplies alongside a payload on `put`.
#[derive(Debug, Clone)]
pub struct PutMetadata {
    pub fetched_at: DateTime<Utc>,
    pub ttl: Ttl,
    pub source_checksum: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub metadata: EntryMetadata,
    pub payload_path: Utf8PathBuf,
}

impl CacheEntry {
    pub fn ttl(&self) -> Ttl {
        Ttl::from_secs(self.metadata.ttl_secs)
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.metadata.ttl_secs?).unwrap_or(i64::MAX);
        self.metadata
            .fetched_at
            .checked_add_signed(chrono::Duration::try_seconds(secs)?)
    }

    /// Fresh while `now - fetched_at < ttl`. An infinite TTL, or one too large
    /// to represent, never expires.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at() {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

/// A verified entry together with its payload bytes.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub entry: CacheEntry,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    root: Utf8PathBuf,
    lock_timeout: Duration,
}

impl CacheStore {
    pub fn new(root: Utf8PathBuf, lock_timeout: Duration) -> Self {
        Self { root, lock_timeout }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn dataset_dir(&self, dataset: &DatasetName) -> Utf8PathBuf {
        self.root.join(dataset.as_str())
    }

    pub fn payload_path(&self, key: &EntryKey) -> Utf8PathBuf {
        self.dataset_dir(&key.dataset)
            .join(format!("{}.payload", key.fingerprint))
    }

    pub fn meta_path(&self, key: &EntryKey) -> Utf8PathBuf {
        self.dataset_dir(&key.dataset)
            .join(format!("{}.meta", key.fingerprint))
    }

    fn lock_path(&self, key: &EntryKey) -> Utf8PathBuf {
        self.dataset_dir(&key.dataset)
            .join(format!("{}.lock", key.fingerprint))
    }

    pub fn ensure_root(&self) -> Result<(), BidaliError> {
        fs::create_dir_all(self.root.as_std_path()).map_err(BidaliError::fs)
    }

    /// Returns the verified entry, `None` when absent. A checksum mismatch
    /// evicts the entry and reports `CacheCorruption`.
    pub fn get(&self, key: &EntryKey) -> Result<Option<CacheHit>, BidaliError> {
        if !self.meta_path(key).as_std_path().exists() {
            return Ok(None);
        }
        let _lease = EntryLease::acquire(&self.lock_path(key), self.lock_timeout)?;

        let metadata = match self.read_metadata(key) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => return Ok(None),
            Err(reason) => {
                tracing::warn!(fingerprint = %key.fingerprint, %reason, "unreadable cache sidecar");
                self.remove_files(key)?;
                return Err(BidaliError::CacheCorruption {
                    fingerprint: key.fingerprint.to_string(),
                    expected: "readable sidecar".to_string(),
                    actual: reason,
                });
            }
        };
        if metadata.schema_version != CACHE_SCHEMA_VERSION {
            tracing::debug!(
                fingerprint = %key.fingerprint,
                schema_version = metadata.schema_version,
                "ignoring cache entry from another schema version"
            );
            return Ok(None);
        }

        let payload_path = self.payload_path(key);
        let payload = match fs::read(payload_path.as_std_path()) {
            Ok(payload) => payload,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.remove_files(key)?;
                return Err(BidaliError::CacheCorruption {
                    fingerprint: key.fingerprint.to_string(),
                    expected: metadata.payload_checksum,
                    actual: "missing payload".to_string(),
                });
            }
            Err(err) => return Err(BidaliError::Filesystem(format!("read {payload_path}: {err}"))),
        };

        let actual = payload_checksum(&payload);
        if actual != metadata.payload_checksum {
            tracing::warn!(
                fingerprint = %key.fingerprint,
                expected = %metadata.payload_checksum,
                %actual,
                "cache checksum mismatch, evicting entry"
            );
            self.remove_files(key)?;
            return Err(BidaliError::CacheCorruption {
                fingerprint: key.fingerprint.to_string(),
                expected: metadata.payload_checksum,
                actual,
            });
        }

        Ok(Some(CacheHit {
            entry: CacheEntry {
                metadata,
                payload_path,
            },
            payload,
        }))
    }

    /// Sidecar only, without reading or verifying the payload.
    pub fn peek(&self, key: &EntryKey) -> Result<Option<CacheEntry>, BidaliError> {
        match self.read_metadata(key) {
            Ok(Some(metadata)) if metadata.schema_version == CACHE_SCHEMA_VERSION => {
                Ok(Some(CacheEntry {
                    metadata,
                    payload_path: self.payload_path(key),
                }))
            }
            Ok(_) => Ok(None),
            Err(reason) => Err(BidaliError::Filesystem(reason)),
        }
    }

    /// Atomically replaces the entry for `key`.
    pub fn put(
        &self,
        key: &EntryKey,
        payload: &[u8],
        meta: PutMetadata,
    ) -> Result<CacheEntry, BidaliError> {
        let checksum = payload_checksum(payload);
        let metadata = EntryMetadata {
            dataset: key.dataset.to_string(),
            fingerprint: key.fingerprint.to_string(),
            fetched_at: meta.fetched_at,
            ttl_secs: meta.ttl.as_secs(),
            source_checksum: meta.source_checksum.unwrap_or_else(|| checksum.clone()),
            payload_checksum: checksum,
            payload_len: payload.len() as u64,
            source: meta.source,
            schema_version: CACHE_SCHEMA_VERSION,
            tool: format!("bidali/{}", env!("CARGO_PKG_VERSION")),
        };
        let content = serde_json::to_vec_pretty(&metadata).map_err(BidaliError::fs)?;

        let payload_path = self.payload_path(key);
        let _lease = EntryLease::acquire(&self.lock_path(key), self.lock_timeout)?;
        write_bytes_atomic(&payload_path, payload)?;
        write_bytes_atomic(&self.meta_path(key), &content)?;
        tracing::debug!(
            fingerprint = %key.fingerprint,
            bytes = payload.len(),
            "cache entry written"
        );

        Ok(CacheEntry {
            metadata,
            payload_path,
        })
    }

    /// Removes the entry; returns whether anything was there.
    pub fn evict(&self, key: &EntryKey) -> Result<bool, BidaliError> {
        let _lease = EntryLease::acquire(&self.lock_path(key), self.lock_timeout)?;
        self.remove_files(key)
    }

    fn remove_files(&self, key: &EntryKey) -> Result<bool, BidaliError> {
        // Sidecar first: without it the payload is invisible to `get`.
        let had_meta = remove_if_exists(&self.meta_path(key))?;
        let had_payload = remove_if_exists(&self.payload_path(key))?;
        Ok(had_meta || had_payload)
    }

    fn read_metadata(&self, key: &EntryKey) -> Result<Option<EntryMetadata>, String> {
        let path = self.meta_path(key);
        let content = match fs::read_to_string(path.as_std_path()) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(format!("read {path}: {err}")),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|err| format!("parse {path}: {err}"))
    }

    /// Every readable entry in the cache, sorted by dataset then fetch time.
    pub fn list(&self) -> Result<Vec<CacheEntry>, BidaliError> {
        if !self.root.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for dataset_dir in fs::read_dir(self.root.as_std_path()).map_err(BidaliError::fs)? {
            let dataset_dir = dataset_dir.map_err(BidaliError::fs)?;
            if !dataset_dir.path().is_dir() {
                continue;
            }
            for file in fs::read_dir(dataset_dir.path()).map_err(BidaliError::fs)? {
                let path = file.map_err(BidaliError::fs)?.path();
                if path.extension().map(|ext| ext != "meta").unwrap_or(true) {
                    continue;
                }
                let Some(entry) = read_listed_entry(&path) else {
                    continue;
                };
                entries.push(entry);
            }
        }
        entries.sort_by(|a, b| {
            (a.metadata.dataset.as_str(), a.metadata.fetched_at)
                .cmp(&(b.metadata.dataset.as_str(), b.metadata.fetched_at))
        });
        Ok(entries)
    }

    pub fn clear(&self) -> Result<(), BidaliError> {
        if self.root.as_std_path().exists() {
            fs::remove_dir_all(self.root.as_std_path()).map_err(BidaliError::fs)?;
        }
        Ok(())
    }
}

fn read_listed_entry(path: &std::path::Path) -> Option<CacheEntry> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "skipping unreadable sidecar");
            return None;
        }
    };
    let metadata: EntryMetadata = match serde_json::from_str(&content) {
        Ok(metadata) => metadata,
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "skipping malformed sidecar");
            return None;
        }
    };
    if metadata.schema_version != CACHE_SCHEMA_VERSION {
        return None;
    }
    let payload_path = Utf8PathBuf::from_path_buf(path.with_extension("payload")).ok()?;
    Some(CacheEntry {
        metadata,
        payload_path,
    })
}
