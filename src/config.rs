use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::Ttl;
use crate::error::BidaliError;

pub const CONFIG_FILE: &str = "bidali.json";

const DEFAULT_TTL_SECS: u64 = 7 * 24 * 60 * 60;

/// On-disk configuration. Every field may be omitted; `default_ttl: null`
/// means entries never expire.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default = "default_ttl_secs")]
    pub default_ttl: Option<u64>,
    #[serde(default)]
    pub retry_count: Option<u32>,
    #[serde(default)]
    pub retry_backoff_base: Option<f64>,
    #[serde(default)]
    pub offline_mode: Option<bool>,
    #[serde(default)]
    pub fetch_timeout: Option<f64>,
    #[serde(default)]
    pub lock_timeout: Option<f64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: None,
            default_ttl: default_ttl_secs(),
            retry_count: None,
            retry_backoff_base: None,
            offline_mode: None,
            fetch_timeout: None,
            lock_timeout: None,
        }
    }
}

fn default_ttl_secs() -> Option<u64> {
    Some(DEFAULT_TTL_SECS)
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: Utf8PathBuf,
    pub default_ttl: Ttl,
    /// Retries after the first attempt.
    pub retry_count: u32,
    pub retry_backoff_base: Duration,
    pub offline_mode: bool,
    pub fetch_timeout: Duration,
    pub lock_timeout: Duration,
}

impl CacheConfig {
    pub fn with_cache_dir(cache_dir: Utf8PathBuf) -> Self {
        Self {
            cache_dir,
            default_ttl: Ttl::from_secs(Some(DEFAULT_TTL_SECS)),
            retry_count: 2,
            retry_backoff_base: Duration::from_millis(500),
            offline_mode: false,
            fetch_timeout: Duration::from_secs(60),
            lock_timeout: Duration::from_secs(30),
        }
    }

    /// Delay before retry number `retry` (zero-based): base * 2^retry.
    pub fn backoff_for(&self, retry: u32) -> Duration {
        self.retry_backoff_base
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<CacheConfig, BidaliError> {
        let config = match path {
            Some(path) => Self::read(PathBuf::from(path))?,
            None => {
                let local = PathBuf::from(CONFIG_FILE);
                if local.exists() {
                    Self::read(local)?
                } else {
                    Config::default()
                }
            }
        };
        let mut resolved = Self::resolve_config(config)?;
        Self::apply_env(&mut resolved)?;
        Ok(resolved)
    }

    fn read(path: PathBuf) -> Result<Config, BidaliError> {
        let content = fs::read_to_string(&path).map_err(|_| BidaliError::ConfigRead(path.clone()))?;
        serde_json::from_str(&content).map_err(|err| BidaliError::ConfigParse(err.to_string()))
    }

    pub fn resolve_config(config: Config) -> Result<CacheConfig, BidaliError> {
        let cache_dir = match config.cache_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_cache_dir()?,
        };
        let mut resolved = CacheConfig::with_cache_dir(cache_dir);
        resolved.default_ttl = Ttl::from_secs(config.default_ttl);
        if let Some(retry_count) = config.retry_count {
            resolved.retry_count = retry_count;
        }
        if let Some(base) = config.retry_backoff_base {
            resolved.retry_backoff_base = seconds("retry_backoff_base", base)?;
        }
        if let Some(offline) = config.offline_mode {
            resolved.offline_mode = offline;
        }
        if let Some(timeout) = config.fetch_timeout {
            resolved.fetch_timeout = seconds("fetch_timeout", timeout)?;
        }
        if let Some(timeout) = config.lock_timeout {
            resolved.lock_timeout = seconds("lock_timeout", timeout)?;
        }
        Ok(resolved)
    }

    fn apply_env(config: &mut CacheConfig) -> Result<(), BidaliError> {
        if let Ok(dir) = std::env::var("BIDALI_CACHE_DIR") {
            if !dir.trim().is_empty() {
                config.cache_dir = Utf8PathBuf::from(dir.trim());
            }
        }
        if let Ok(offline) = std::env::var("BIDALI_OFFLINE") {
            config.offline_mode = parse_env_flag(&offline).ok_or_else(|| {
                BidaliError::ConfigParse(format!("BIDALI_OFFLINE must be a boolean, got {offline:?}"))
            })?;
        }
        Ok(())
    }
}

pub fn default_cache_dir() -> Result<Utf8PathBuf, BidaliError> {
    BaseDirs::new()
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.home_dir().join(".cache").join("bidali")).ok())
        .ok_or_else(|| BidaliError::Filesystem("unable to resolve cache directory".to_string()))
}

fn seconds(field: &str, value: f64) -> Result<Duration, BidaliError> {
    Duration::try_from_secs_f64(value).map_err(|_| {
        BidaliError::ConfigParse(format!(
            "{field} must be a non-negative number of seconds, got {value}"
        ))
    })
}

fn parse_env_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}
