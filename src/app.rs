use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::{Clock, SystemClock};
use crate::config::CacheConfig;
use crate::domain::{DatasetName, ParamSpec, Params};
use crate::error::BidaliError;
use crate::fingerprint::Fingerprint;
use crate::orchestrator::{FetchOrchestrator, LoadOptions, Origin, StalenessWarning};
use crate::registry::{DatasetRegistry, ResolvedDataset};
use crate::store::{CacheEntry, CacheStore};
use crate::transform::Representation;

/// Analysis-ready dataset plus the provenance of the payload it came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RealizedDataset {
    pub name: DatasetName,
    pub params: Params,
    pub fingerprint: Fingerprint,
    pub fetched_at: DateTime<Utc>,
    pub source: String,
    pub source_checksum: String,
    pub payload_checksum: String,
    pub value: Representation,
}

#[derive(Debug, Clone)]
pub struct Loaded {
    pub dataset: Arc<RealizedDataset>,
    pub origin: Origin,
    pub staleness: Option<StalenessWarning>,
}

impl Loaded {
    pub fn is_stale(&self) -> bool {
        self.staleness.is_some()
    }
}

#[derive(Debug, Clone)]
struct MemoSlot {
    dataset: Arc<RealizedDataset>,
    /// `None` never expires. A stale slot expires immediately so the next
    /// load tries the source again.
    fresh_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidateResult {
    pub fingerprint: String,
    pub memo_dropped: bool,
    pub evicted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub dataset: String,
    pub params: Params,
    pub fingerprint: String,
    pub cached: bool,
    pub fresh: bool,
    pub memoized: bool,
    pub fetched_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub payload_path: Option<String>,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListResult {
    pub entries: Vec<ListEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListEntry {
    pub dataset: String,
    pub fingerprint: String,
    pub fetched_at: DateTime<Utc>,
    pub fresh: bool,
    pub payload_len: u64,
    pub source: String,
    pub payload_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub source: String,
    pub transforms: String,
    pub ttl: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearResult {
    pub cleared: bool,
    pub memo_dropped: usize,
}

/// Entry point for analysis code: one context per process (or per test),
/// holding the registry, the orchestrator and the in-process memo.
pub struct App {
    registry: Arc<DatasetRegistry>,
    orchestrator: FetchOrchestrator,
    memo: Mutex<HashMap<Fingerprint, MemoSlot>>,
}

impl App {
    pub fn new(config: CacheConfig, registry: Arc<DatasetRegistry>) -> Self {
        Self::with_clock(config, registry, Arc::new(SystemClock))
    }

    pub fn with_clock(
        config: CacheConfig,
        registry: Arc<DatasetRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let store = CacheStore::new(config.cache_dir.clone(), config.lock_timeout);
        Self {
            registry,
            orchestrator: FetchOrchestrator::new(store, config, clock),
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &DatasetRegistry {
        &self.registry
    }

    pub fn store(&self) -> &CacheStore {
        self.orchestrator.store()
    }

    pub fn orchestrator(&self) -> &FetchOrchestrator {
        &self.orchestrator
    }

    pub fn load(&self, name: &str, params: &Params) -> Result<Loaded, BidaliError> {
        self.load_with(name, params, &LoadOptions::default())
    }

    pub fn load_with(
        &self,
        name: &str,
        params: &Params,
        options: &LoadOptions,
    ) -> Result<Loaded, BidaliError> {
        let resolved = self.registry.resolve(name, params)?;
        let now = self.orchestrator.now();

        let memoized = self.memo_get(&resolved.fingerprint);
        if let Some(slot) = &memoized {
            let fresh = slot.fresh_until.map(|until| now < until).unwrap_or(true);
            if fresh && !options.force_refresh {
                tracing::debug!(
                    dataset = %resolved.descriptor.name,
                    fingerprint = %resolved.fingerprint,
                    "memo hit"
                );
                return Ok(Loaded {
                    dataset: Arc::clone(&slot.dataset),
                    origin: Origin::Memo,
                    staleness: None,
                });
            }
        }

        let retrieved = self.orchestrator.retrieve(&resolved, options)?;
        let hit = &retrieved.hit;
        let dataset = match memoized {
            Some(slot) if slot.dataset.payload_checksum == hit.entry.metadata.payload_checksum => {
                slot.dataset
            }
            _ => {
                let value = self.orchestrator.transform(&resolved, hit)?;
                Arc::new(realized(&resolved, &hit.entry, value))
            }
        };

        let fresh_until = match retrieved.origin {
            Origin::Stale => Some(now),
            _ => hit.entry.expires_at(),
        };
        self.memo_put(
            resolved.fingerprint.clone(),
            MemoSlot {
                dataset: Arc::clone(&dataset),
                fresh_until,
            },
        );

        Ok(Loaded {
            dataset,
            origin: retrieved.origin,
            staleness: retrieved.staleness,
        })
    }

    /// Drops the memo for one request and, with `evict`, its cache entry.
    pub fn invalidate(
        &self,
        name: &str,
        params: &Params,
        evict: bool,
    ) -> Result<InvalidateResult, BidaliError> {
        let resolved = self.registry.resolve(name, params)?;
        let memo_dropped = self
            .memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&resolved.fingerprint)
            .is_some();
        let evicted = if evict {
            self.store().evict(&resolved.key())?
        } else {
            false
        };
        tracing::info!(
            dataset = %resolved.descriptor.name,
            fingerprint = %resolved.fingerprint,
            memo_dropped,
            evicted,
            "invalidated"
        );
        Ok(InvalidateResult {
            fingerprint: resolved.fingerprint.to_string(),
            memo_dropped,
            evicted,
        })
    }

    /// Forgets every memoized dataset; the disk cache is untouched.
    pub fn reset(&self) -> usize {
        let mut memo = self.memo.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let dropped = memo.len();
        memo.clear();
        dropped
    }

    pub fn datasets(&self) -> Vec<DatasetSummary> {
        self.registry
            .descriptors()
            .into_iter()
            .map(|descriptor| DatasetSummary {
                name: descriptor.name.to_string(),
                description: descriptor.description.clone(),
                params: descriptor.params.clone(),
                source: descriptor.fetcher.source_id(),
                transforms: descriptor.transforms.identity(),
                ttl: descriptor.ttl.map(|ttl| ttl.to_string()),
            })
            .collect()
    }

    pub fn resolve(&self, name: &str, params: &Params) -> Result<ResolvedDataset, BidaliError> {
        self.registry.resolve(name, params)
    }

    /// Cache state for one request, without fetching.
    pub fn status(&self, name: &str, params: &Params) -> Result<StatusResult, BidaliError> {
        let resolved = self.registry.resolve(name, params)?;
        let entry = self.store().peek(&resolved.key())?;
        let now = self.orchestrator.now();
        let memoized = self.memo_get(&resolved.fingerprint).is_some();
        Ok(StatusResult {
            dataset: resolved.descriptor.name.to_string(),
            params: resolved.params.clone(),
            fingerprint: resolved.fingerprint.to_string(),
            cached: entry.is_some(),
            fresh: entry.as_ref().map(|e| e.is_fresh(now)).unwrap_or(false),
            memoized,
            fetched_at: entry.as_ref().map(|e| e.metadata.fetched_at),
            expires_at: entry.as_ref().and_then(CacheEntry::expires_at),
            payload_path: entry.as_ref().map(|e| e.payload_path.to_string()),
            source: entry.map(|e| e.metadata.source),
        })
    }

    pub fn list(&self) -> Result<ListResult, BidaliError> {
        let now = self.orchestrator.now();
        let entries = self
            .store()
            .list()?
            .into_iter()
            .map(|entry| ListEntry {
                fresh: entry.is_fresh(now),
                dataset: entry.metadata.dataset,
                fingerprint: entry.metadata.fingerprint,
                fetched_at: entry.metadata.fetched_at,
                payload_len: entry.metadata.payload_len,
                source: entry.metadata.source,
                payload_path: entry.payload_path.to_string(),
            })
            .collect();
        Ok(ListResult { entries })
    }

    /// Removes the whole cache directory and the memo.
    pub fn clear(&self) -> Result<ClearResult, BidaliError> {
        let memo_dropped = self.reset();
        self.store().clear()?;
        Ok(ClearResult {
            cleared: true,
            memo_dropped,
        })
    }

    fn memo_get(&self, fingerprint: &Fingerprint) -> Option<MemoSlot> {
        self.memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(fingerprint)
            .cloned()
    }

    fn memo_put(&self, fingerprint: Fingerprint, slot: MemoSlot) {
        self.memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(fingerprint, slot);
    }
}

fn realized(resolved: &ResolvedDataset, entry: &CacheEntry, value: Representation) -> RealizedDataset {
    RealizedDataset {
        name: resolved.descriptor.name.clone(),
        params: resolved.params.clone(),
        fingerprint: resolved.fingerprint.clone(),
        fetched_at: entry.metadata.fetched_at,
        source: entry.metadata.source.clone(),
        source_checksum: entry.metadata.source_checksum.clone(),
        payload_checksum: entry.metadata.payload_checksum.clone(),
        value,
    }
}
