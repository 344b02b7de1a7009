//! Fetch orchestration: cache check, single-flight fetch with retries, and
//! stale fallback.
//!
//! Every fetch runs on a worker thread owned by its flight, never on the
//! caller's thread. Callers only wait on the flight, so a caller deadline can
//! give up waiting while the fetch still finishes and populates the cache for
//! whoever asks next.

use std::collections::HashMap;
use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::config::CacheConfig;
use crate::error::BidaliError;
use crate::fetcher::{FetchOutcome, FetchRequest, Fetcher};
use crate::fingerprint::Fingerprint;
use crate::registry::ResolvedDataset;
use crate::store::{CacheHit, CacheStore, PutMetadata};
use crate::transform::Representation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Served from the in-process memo.
    Memo,
    /// Fresh entry already on disk.
    Cache,
    /// Fetched from the source during this request.
    Fetched,
    /// Expired entry served because fetching failed.
    Stale,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Memo => write!(f, "memo"),
            Origin::Cache => write!(f, "cache"),
            Origin::Fetched => write!(f, "fetched"),
            Origin::Stale => write!(f, "stale"),
        }
    }
}

/// Attached to a successful load that had to fall back to an expired entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StalenessWarning {
    pub fingerprint: Fingerprint,
    pub fetched_at: DateTime<Utc>,
    pub expired_at: Option<DateTime<Utc>>,
    pub reason: String,
}

impl fmt::Display for StalenessWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "serving data fetched at {} for {}: {}",
            self.fetched_at.to_rfc3339(),
            self.fingerprint.short(),
            self.reason
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Stop waiting for an in-flight fetch at this instant.
    pub deadline: Option<Instant>,
    /// Fetch even when a fresh entry exists.
    pub force_refresh: bool,
}

/// Raw payload plus how it was obtained.
#[derive(Debug, Clone)]
pub struct Retrieved {
    pub hit: Arc<CacheHit>,
    pub origin: Origin,
    pub staleness: Option<StalenessWarning>,
}

#[derive(Debug, Clone)]
struct FetchFailure {
    attempts: u32,
    reason: String,
}

#[derive(Debug, Clone)]
struct FlightSuccess {
    hit: Arc<CacheHit>,
    fetched: bool,
}

type FlightResult = Result<FlightSuccess, FetchFailure>;

#[derive(Default)]
struct Flight {
    state: Mutex<Option<FlightResult>>,
    done: Condvar,
}

impl Flight {
    fn complete(&self, result: FlightResult) {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *state = Some(result);
        self.done.notify_all();
    }

    /// `None` when the deadline passed first.
    fn wait(&self, deadline: Option<Instant>) -> Option<FlightResult> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            if let Some(result) = state.as_ref() {
                return Some(result.clone());
            }
            state = match deadline {
                None => self
                    .done
                    .wait(state)
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    self.done
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .0
                }
            };
        }
    }
}

struct Inner {
    store: CacheStore,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    inflight: Mutex<HashMap<Fingerprint, Arc<Flight>>>,
    /// Attempts that outlived their flight, still running. The next flight
    /// for the fingerprint waits on them instead of calling the fetcher.
    stragglers: Mutex<HashMap<Fingerprint, Receiver<FetchOutcome>>>,
}

#[derive(Clone)]
pub struct FetchOrchestrator {
    inner: Arc<Inner>,
}

impl FetchOrchestrator {
    pub fn new(store: CacheStore, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                clock,
                inflight: Mutex::new(HashMap::new()),
                stragglers: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &CacheStore {
        &self.inner.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.inner.clock.now()
    }

    /// Number of fetches currently running.
    pub fn inflight(&self) -> usize {
        self.inner
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Cache check, then at most one shared fetch, then stale fallback.
    pub fn retrieve(
        &self,
        resolved: &ResolvedDataset,
        options: &LoadOptions,
    ) -> Result<Retrieved, BidaliError> {
        let key = resolved.key();
        let cached = match self.inner.store.get(&key) {
            Ok(hit) => hit.map(Arc::new),
            Err(BidaliError::CacheCorruption { .. }) => {
                tracing::warn!(
                    dataset = %resolved.descriptor.name,
                    fingerprint = %resolved.fingerprint,
                    "corrupt cache entry evicted, fetching again"
                );
                None
            }
            Err(err) => return Err(err),
        };

        if let Some(hit) = &cached {
            if !options.force_refresh && hit.entry.is_fresh(self.now()) {
                tracing::debug!(
                    dataset = %resolved.descriptor.name,
                    fingerprint = %resolved.fingerprint,
                    "fresh cache entry"
                );
                return Ok(Retrieved {
                    hit: Arc::clone(hit),
                    origin: Origin::Cache,
                    staleness: None,
                });
            }
        }

        if self.inner.config.offline_mode {
            let failure = FetchFailure {
                attempts: 0,
                reason: "offline mode".to_string(),
            };
            return self.fall_back(resolved, cached, failure);
        }

        let flight = self.join_flight(resolved, options.force_refresh);
        match flight.wait(options.deadline) {
            Some(Ok(success)) => Ok(Retrieved {
                hit: success.hit,
                origin: if success.fetched {
                    Origin::Fetched
                } else {
                    Origin::Cache
                },
                staleness: None,
            }),
            Some(Err(failure)) => self.fall_back(resolved, cached, failure),
            None => {
                let failure = FetchFailure {
                    attempts: 0,
                    reason: "deadline passed while waiting for the fetch".to_string(),
                };
                self.fall_back(resolved, cached, failure)
            }
        }
    }

    /// Runs the descriptor's transform chain over a retrieved payload.
    pub fn transform(
        &self,
        resolved: &ResolvedDataset,
        hit: &CacheHit,
    ) -> Result<Representation, BidaliError> {
        resolved
            .descriptor
            .transforms
            .run(hit.payload.clone())
            .map_err(|err| BidaliError::Transform {
                fingerprint: resolved.fingerprint.to_string(),
                stage: err.stage,
                reason: err.reason,
            })
    }

    fn fall_back(
        &self,
        resolved: &ResolvedDataset,
        cached: Option<Arc<CacheHit>>,
        failure: FetchFailure,
    ) -> Result<Retrieved, BidaliError> {
        match cached {
            Some(hit) => {
                let warning = StalenessWarning {
                    fingerprint: resolved.fingerprint.clone(),
                    fetched_at: hit.entry.metadata.fetched_at,
                    expired_at: hit.entry.expires_at(),
                    reason: failure.reason,
                };
                tracing::warn!(
                    dataset = %resolved.descriptor.name,
                    fingerprint = %resolved.fingerprint,
                    fetched_at = %warning.fetched_at,
                    reason = %warning.reason,
                    "serving stale cache entry"
                );
                Ok(Retrieved {
                    hit,
                    origin: Origin::Stale,
                    staleness: Some(warning),
                })
            }
            None => Err(BidaliError::Fetch {
                fingerprint: resolved.fingerprint.to_string(),
                source_id: resolved.descriptor.fetcher.source_id(),
                attempts: failure.attempts,
                reason: failure.reason,
            }),
        }
    }

    fn join_flight(&self, resolved: &ResolvedDataset, force_refresh: bool) -> Arc<Flight> {
        let mut inflight = self
            .inner
            .inflight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(flight) = inflight.get(&resolved.fingerprint) {
            tracing::debug!(fingerprint = %resolved.fingerprint, "joining in-flight fetch");
            return Arc::clone(flight);
        }
        let flight = Arc::new(Flight::default());
        inflight.insert(resolved.fingerprint.clone(), Arc::clone(&flight));
        drop(inflight);

        let inner = Arc::clone(&self.inner);
        let worker_flight = Arc::clone(&flight);
        let worker_resolved = resolved.clone();
        let spawned = thread::Builder::new()
            .name(format!("bidali-fetch-{}", resolved.fingerprint.short()))
            .spawn(move || {
                let result = inner.run_flight(&worker_resolved, force_refresh);
                inner.finish_flight(&worker_resolved.fingerprint, &worker_flight, result);
            });
        if let Err(err) = spawned {
            self.inner.finish_flight(
                &resolved.fingerprint,
                &flight,
                Err(FetchFailure {
                    attempts: 0,
                    reason: format!("could not start fetch worker: {err}"),
                }),
            );
        }
        flight
    }
}

impl Inner {
    /// Unregisters before waking waiters, so a woken caller never sees its
    /// own finished flight still listed. Anyone arriving in between starts a
    /// new flight that finds the entry already on disk.
    fn finish_flight(&self, fingerprint: &Fingerprint, flight: &Arc<Flight>, result: FlightResult) {
        {
            let mut inflight = self
                .inflight
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if inflight
                .get(fingerprint)
                .map(|current| Arc::ptr_eq(current, flight))
                .unwrap_or(false)
            {
                inflight.remove(fingerprint);
            }
        }
        flight.complete(result);
    }

    fn run_flight(&self, resolved: &ResolvedDataset, force_refresh: bool) -> FlightResult {
        let key = resolved.key();
        // Another flight may have finished between the caller's cache check
        // and this one starting.
        if !force_refresh {
            if let Ok(Some(hit)) = self.store.get(&key) {
                if hit.entry.is_fresh(self.clock.now()) {
                    return Ok(FlightSuccess {
                        hit: Arc::new(hit),
                        fetched: false,
                    });
                }
            }
        }

        let fetcher = Arc::clone(&resolved.descriptor.fetcher);
        let request = FetchRequest {
            dataset: resolved.descriptor.name.clone(),
            params: resolved.params.clone(),
            timeout: self.config.fetch_timeout,
        };
        let mut pending = self.take_straggler(&resolved.fingerprint);

        let result = self.fetch_attempts(resolved, &fetcher, &request, &mut pending);
        if let Some(receiver) = pending {
            self.park_straggler(&resolved.fingerprint, receiver);
        }
        result
    }

    fn fetch_attempts(
        &self,
        resolved: &ResolvedDataset,
        fetcher: &Arc<dyn Fetcher>,
        request: &FetchRequest,
        pending: &mut Option<Receiver<FetchOutcome>>,
    ) -> Result<FlightSuccess, FetchFailure> {
        let key = resolved.key();
        let source = fetcher.source_id();
        let max_attempts = self.config.retry_count.saturating_add(1);
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            tracing::info!(
                dataset = %resolved.descriptor.name,
                fingerprint = %resolved.fingerprint,
                %source,
                attempt,
                resumed = pending.is_some(),
                "fetch start"
            );
            let started = Instant::now();
            match self.attempt(fetcher, request, pending) {
                FetchOutcome::Success {
                    payload,
                    source_checksum,
                } => {
                    let latency_ms = started.elapsed().as_millis();
                    let meta = PutMetadata {
                        fetched_at: self.clock.now(),
                        ttl: resolved.ttl(self.config.default_ttl),
                        source_checksum,
                        source: source.clone(),
                    };
                    return match self.store.put(&key, &payload, meta) {
                        Ok(entry) => {
                            tracing::info!(
                                dataset = %resolved.descriptor.name,
                                fingerprint = %resolved.fingerprint,
                                bytes = payload.len(),
                                latency_ms,
                                "fetch complete"
                            );
                            Ok(FlightSuccess {
                                hit: Arc::new(CacheHit { entry, payload }),
                                fetched: true,
                            })
                        }
                        Err(err) => Err(FetchFailure {
                            attempts: attempt,
                            reason: format!("fetched but could not persist: {err}"),
                        }),
                    };
                }
                FetchOutcome::TransientFailure(reason) => {
                    tracing::warn!(
                        dataset = %resolved.descriptor.name,
                        fingerprint = %resolved.fingerprint,
                        attempt,
                        max_attempts,
                        %reason,
                        "transient fetch failure"
                    );
                    last_reason = reason;
                    // An overrun attempt already cost a full timeout.
                    if attempt < max_attempts && pending.is_none() {
                        thread::sleep(self.config.backoff_for(attempt - 1));
                    }
                }
                FetchOutcome::FatalFailure(reason) => {
                    tracing::warn!(
                        dataset = %resolved.descriptor.name,
                        fingerprint = %resolved.fingerprint,
                        attempt,
                        %reason,
                        "fatal fetch failure"
                    );
                    return Err(FetchFailure {
                        attempts: attempt,
                        reason,
                    });
                }
            }
        }

        Err(FetchFailure {
            attempts: max_attempts,
            reason: format!("retries exhausted: {last_reason}"),
        })
    }

    /// One fetch call bounded by `fetch_timeout`. An attempt that overruns
    /// is not killed: its receiver stays in `pending` and the next attempt
    /// waits on it again, so one fingerprint never has two fetcher calls
    /// running.
    fn attempt(
        &self,
        fetcher: &Arc<dyn Fetcher>,
        request: &FetchRequest,
        pending: &mut Option<Receiver<FetchOutcome>>,
    ) -> FetchOutcome {
        let receiver = match pending.take() {
            Some(receiver) => receiver,
            None => {
                let (tx, rx) = mpsc::channel();
                let fetcher = Arc::clone(fetcher);
                let worker_request = request.clone();
                let spawned = thread::Builder::new()
                    .name("bidali-fetch-attempt".to_string())
                    .spawn(move || {
                        let _ = tx.send(fetcher.fetch(&worker_request));
                    });
                if let Err(err) = spawned {
                    return FetchOutcome::TransientFailure(format!(
                        "could not start fetch attempt: {err}"
                    ));
                }
                rx
            }
        };
        match receiver.recv_timeout(request.timeout) {
            Ok(outcome) => outcome,
            Err(RecvTimeoutError::Timeout) => {
                *pending = Some(receiver);
                FetchOutcome::TransientFailure(format!(
                    "timed out after {:.1}s",
                    request.timeout.as_secs_f64()
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                FetchOutcome::FatalFailure("fetcher panicked".to_string())
            }
        }
    }

    fn take_straggler(&self, fingerprint: &Fingerprint) -> Option<Receiver<FetchOutcome>> {
        self.stragglers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(fingerprint)
    }

    fn park_straggler(&self, fingerprint: &Fingerprint, receiver: Receiver<FetchOutcome>) {
        tracing::debug!(%fingerprint, "fetch attempt still running after its flight");
        self.stragglers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(fingerprint.clone(), receiver);
    }
}
