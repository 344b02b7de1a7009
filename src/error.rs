use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BidaliError {
    #[error("unknown dataset: {0}")]
    #[diagnostic(help("run `bidali data datasets` to list registered datasets"))]
    UnknownDataset(String),

    #[error("dataset {0} is already registered with a different pipeline")]
    DuplicateDescriptor(String),

    #[error("invalid parameters for {dataset}: {reason}")]
    InvalidParameters { dataset: String, reason: String },

    #[error("invalid dataset specifier: {0}")]
    InvalidSpecifier(String),

    #[error("invalid dataset name: {0}")]
    InvalidDatasetName(String),

    #[error("fetch failed for {fingerprint} from {source_id} after {attempts} attempt(s): {reason}")]
    Fetch {
        fingerprint: String,
        source_id: String,
        attempts: u32,
        reason: String,
    },

    #[error("cache entry {fingerprint} is corrupt: expected checksum {expected}, found {actual}")]
    CacheCorruption {
        fingerprint: String,
        expected: String,
        actual: String,
    },

    #[error("transform {stage} failed for {fingerprint}: {reason}")]
    Transform {
        fingerprint: String,
        stage: String,
        reason: String,
    },

    #[error("timed out waiting for cache lock {0}")]
    LockTimeout(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse config: {0}")]
    ConfigParse(String),

    #[error("http client error: {0}")]
    Http(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl BidaliError {
    pub fn fs(err: impl std::fmt::Display) -> Self {
        BidaliError::Filesystem(err.to_string())
    }
}
