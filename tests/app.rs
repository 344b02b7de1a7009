use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{TimeZone, Utc};

use bidali::app::App;
use bidali::clock::{Clock, ManualClock};
use bidali::config::CacheConfig;
use bidali::domain::{ParamKind, ParamSpec, Params, Ttl};
use bidali::error::BidaliError;
use bidali::fetcher::{FetchOutcome, FetchRequest, Fetcher};
use bidali::orchestrator::{LoadOptions, Origin};
use bidali::registry::{DatasetDescriptor, DatasetRegistry};
use bidali::transform::{DecodeText, ParseDelimited, Representation, Transform, TransformChain};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Succeed,
    Transient,
    Fatal,
}

/// Serves `<build>:<payload>` and counts every call.
struct MockSource {
    calls: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    delay: Mutex<Duration>,
    mode: Mutex<Mode>,
    payload: Mutex<String>,
    /// Path turned into a non-empty directory during the next fetch, so the
    /// cache cannot write over it.
    block_path: Mutex<Option<Utf8PathBuf>>,
}

impl MockSource {
    fn new(payload: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            mode: Mutex::new(Mode::Succeed),
            payload: Mutex::new(payload.to_string()),
            block_path: Mutex::new(None),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn peak_running(&self) -> usize {
        self.peak_running.load(Ordering::SeqCst)
    }

    fn set_mode(&self, mode: Mode) {
        *self.mode.lock().unwrap() = mode;
    }

    fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    fn set_payload(&self, payload: &str) {
        *self.payload.lock().unwrap() = payload.to_string();
    }

    fn block_next_write(&self, path: Utf8PathBuf) {
        *self.block_path.lock().unwrap() = Some(path);
    }
}

struct MockFetcher(Arc<MockSource>);

impl Fetcher for MockFetcher {
    fn source_id(&self) -> String {
        "mock://annotations".to_string()
    }

    fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        self.0.calls.fetch_add(1, Ordering::SeqCst);
        let running = self.0.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.0.peak_running.fetch_max(running, Ordering::SeqCst);
        let outcome = self.serve(request);
        self.0.running.fetch_sub(1, Ordering::SeqCst);
        outcome
    }
}

impl MockFetcher {
    fn serve(&self, request: &FetchRequest) -> FetchOutcome {
        if let Some(path) = self.0.block_path.lock().unwrap().take() {
            std::fs::remove_file(path.as_std_path()).unwrap();
            std::fs::create_dir(path.as_std_path()).unwrap();
            std::fs::write(path.join("occupied").as_std_path(), b"x").unwrap();
        }
        let delay = *self.0.delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        match *self.0.mode.lock().unwrap() {
            Mode::Succeed => {
                let build = request
                    .params
                    .get("build")
                    .map(|value| value.as_text())
                    .unwrap_or_default();
                let payload = self.0.payload.lock().unwrap().clone();
                FetchOutcome::success(format!("{build}\t{payload}\n").into_bytes())
            }
            Mode::Transient => FetchOutcome::TransientFailure("503 from mock".to_string()),
            Mode::Fatal => FetchOutcome::FatalFailure("404 from mock".to_string()),
        }
    }
}

struct Explode;

impl Transform for Explode {
    fn name(&self) -> String {
        "explode".to_string()
    }

    fn apply(&self, _input: Representation) -> Result<Representation, String> {
        Err("malformed record on line 1".to_string())
    }
}

fn config(dir: &tempfile::TempDir) -> CacheConfig {
    let root = Utf8PathBuf::from_path_buf(dir.path().join("cache")).unwrap();
    let mut config = CacheConfig::with_cache_dir(root);
    config.retry_backoff_base = Duration::from_millis(1);
    config.fetch_timeout = Duration::from_secs(5);
    config
}

fn registry(source: &Arc<MockSource>, ttl: Option<Ttl>, chain: TransformChain) -> Arc<DatasetRegistry> {
    let mut builder = DatasetDescriptor::builder("gene_annotations", MockFetcher(Arc::clone(source)))
        .unwrap()
        .description("mock gene annotations")
        .param(ParamSpec::optional("build", ParamKind::Text, "hg38").case_insensitive())
        .transforms(chain);
    if let Some(ttl) = ttl {
        builder = builder.ttl(ttl);
    }
    let registry = DatasetRegistry::new();
    registry.register(builder.build().unwrap()).unwrap();
    Arc::new(registry)
}

fn text_chain() -> TransformChain {
    TransformChain::new("1").then(DecodeText)
}

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()))
}

fn hg38() -> Params {
    Params::new().with("build", "hg38")
}

#[test]
fn ttl_lifecycle_with_memo_cache_and_stale_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("BRCA1");
    let clock = clock();
    let registry = registry(&source, Some(Ttl::After(Duration::from_secs(3600))), text_chain());
    let app = App::with_clock(config(&dir), Arc::clone(&registry), clock.clone());

    let first = app.load("gene_annotations", &hg38()).unwrap();
    assert_eq!(first.origin, Origin::Fetched);
    assert_eq!(first.dataset.value.as_text(), Some("hg38\tBRCA1\n"));
    assert_eq!(source.calls(), 1);

    let second = app.load("gene_annotations", &Params::new().with("build", "HG38")).unwrap();
    assert_eq!(second.origin, Origin::Memo);
    assert!(Arc::ptr_eq(&first.dataset, &second.dataset));

    // A new context sees the disk entry but has no memo.
    let other = App::with_clock(config(&dir), Arc::clone(&registry), clock.clone());
    let from_disk = other.load("gene_annotations", &hg38()).unwrap();
    assert_eq!(from_disk.origin, Origin::Cache);
    assert_eq!(source.calls(), 1);

    clock.advance(chrono::Duration::seconds(3601));
    source.set_payload("BRCA2");
    let refreshed = app.load("gene_annotations", &hg38()).unwrap();
    assert_eq!(refreshed.origin, Origin::Fetched);
    assert_eq!(refreshed.dataset.value.as_text(), Some("hg38\tBRCA2\n"));
    assert_eq!(source.calls(), 2);

    clock.advance(chrono::Duration::seconds(3601));
    source.set_mode(Mode::Transient);
    let stale = app.load("gene_annotations", &hg38()).unwrap();
    assert_eq!(stale.origin, Origin::Stale);
    assert!(stale.is_stale());
    let warning = stale.staleness.as_ref().unwrap();
    assert_eq!(warning.fetched_at, refreshed.dataset.fetched_at);
    assert!(warning.reason.contains("503"));
    assert_eq!(stale.dataset.value.as_text(), Some("hg38\tBRCA2\n"));
    assert_eq!(source.calls(), 2 + 3);

    // Stale memo slots do not short-circuit: the next load asks the source.
    source.set_mode(Mode::Succeed);
    let recovered = app.load("gene_annotations", &hg38()).unwrap();
    assert_eq!(recovered.origin, Origin::Fetched);
    assert_eq!(source.calls(), 6);
}

#[test]
fn concurrent_loads_fetch_once() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("TP53");
    source.set_delay(Duration::from_millis(200));
    let app = Arc::new(App::new(config(&dir), registry(&source, None, text_chain())));
    let barrier = Arc::new(Barrier::new(8));

    let handles = (0..8)
        .map(|_| {
            let app = Arc::clone(&app);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                app.load("gene_annotations", &hg38()).unwrap()
            })
        })
        .collect::<Vec<_>>();
    let results = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect::<Vec<_>>();

    assert_eq!(source.calls(), 1);
    let checksum = &results[0].dataset.payload_checksum;
    assert!(results.iter().all(|loaded| &loaded.dataset.payload_checksum == checksum));
    assert!(results.iter().any(|loaded| loaded.origin == Origin::Fetched));
    assert_eq!(app.orchestrator().inflight(), 0);
}

#[test]
fn distinct_parameters_fetch_independently() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("EGFR");
    let app = App::new(config(&dir), registry(&source, None, text_chain()));

    let hg38 = app.load("gene_annotations", &hg38()).unwrap();
    let hg19 = app
        .load("gene_annotations", &Params::new().with("build", "hg19"))
        .unwrap();
    assert_ne!(hg38.dataset.fingerprint, hg19.dataset.fingerprint);
    assert_eq!(hg19.dataset.value.as_text(), Some("hg19\tEGFR\n"));
    assert_eq!(source.calls(), 2);
    assert_eq!(app.list().unwrap().entries.len(), 2);
}

#[test]
fn exhausted_retries_without_cache_is_fetch_error() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("MYC");
    source.set_mode(Mode::Transient);
    let app = App::new(config(&dir), registry(&source, None, text_chain()));

    let err = app.load("gene_annotations", &hg38()).unwrap_err();
    assert_matches!(err, BidaliError::Fetch { attempts: 3, ref source_id, .. } if source_id == "mock://annotations");
    assert_eq!(source.calls(), 3);
    assert!(app.list().unwrap().entries.is_empty());
}

#[test]
fn fatal_failure_is_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("MYC");
    source.set_mode(Mode::Fatal);
    let app = App::new(config(&dir), registry(&source, None, text_chain()));

    let err = app.load("gene_annotations", &hg38()).unwrap_err();
    assert_matches!(err, BidaliError::Fetch { attempts: 1, .. });
    assert_eq!(source.calls(), 1);
}

#[test]
fn slow_fetch_attempt_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("KRAS");
    source.set_delay(Duration::from_millis(300));
    let mut config = config(&dir);
    config.fetch_timeout = Duration::from_millis(50);
    config.retry_count = 0;
    let app = App::new(config, registry(&source, None, text_chain()));

    let err = app.load("gene_annotations", &hg38()).unwrap_err();
    assert_matches!(err, BidaliError::Fetch { ref reason, .. } if reason.contains("timed out"));
}

#[test]
fn overrunning_attempt_is_awaited_not_duplicated() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("HRAS");
    source.set_delay(Duration::from_millis(300));
    let mut config = config(&dir);
    config.fetch_timeout = Duration::from_millis(50);
    config.retry_count = 2;
    let app = App::new(config, registry(&source, None, text_chain()));

    let err = app.load("gene_annotations", &hg38()).unwrap_err();
    assert_matches!(err, BidaliError::Fetch { attempts: 3, ref reason, .. } if reason.contains("timed out"));
    assert_eq!(source.calls(), 1);
    assert_eq!(source.peak_running(), 1);

    // The abandoned call finishes in the background; the next load takes
    // its result instead of fetching again.
    thread::sleep(Duration::from_millis(400));
    let loaded = app.load("gene_annotations", &hg38()).unwrap();
    assert_eq!(loaded.origin, Origin::Fetched);
    assert_eq!(source.calls(), 1);
    assert_eq!(source.peak_running(), 1);
}

#[test]
fn deadline_with_stale_entry_serves_stale() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("MYC");
    let clock = clock();
    let registry = registry(&source, Some(Ttl::After(Duration::from_secs(60))), text_chain());
    let app = App::with_clock(config(&dir), registry, clock.clone());
    let first = app.load("gene_annotations", &hg38()).unwrap();

    clock.advance(chrono::Duration::seconds(61));
    source.set_payload("MYCN");
    source.set_delay(Duration::from_millis(300));
    let options = LoadOptions {
        deadline: Some(Instant::now() + Duration::from_millis(30)),
        force_refresh: false,
    };
    let stale = app.load_with("gene_annotations", &hg38(), &options).unwrap();
    assert_eq!(stale.origin, Origin::Stale);
    let warning = stale.staleness.as_ref().unwrap();
    assert!(warning.reason.contains("deadline"));
    assert_eq!(warning.fetched_at, first.dataset.fetched_at);
    assert_eq!(stale.dataset.value.as_text(), Some("hg38\tMYC\n"));

    // The abandoned wait does not cancel the fetch.
    thread::sleep(Duration::from_millis(500));
    source.set_delay(Duration::ZERO);
    let fresh = app.load("gene_annotations", &hg38()).unwrap();
    assert_eq!(fresh.origin, Origin::Cache);
    assert_eq!(fresh.dataset.value.as_text(), Some("hg38\tMYCN\n"));
    assert_eq!(source.calls(), 2);
}

#[test]
fn persist_failure_after_fetch_serves_stale() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("TP53");
    let clock = clock();
    let registry = registry(&source, Some(Ttl::After(Duration::from_secs(60))), text_chain());
    let app = App::with_clock(config(&dir), registry, clock.clone());
    app.load("gene_annotations", &hg38()).unwrap();

    clock.advance(chrono::Duration::seconds(61));
    let resolved = app.resolve("gene_annotations", &hg38()).unwrap();
    source.set_payload("TP63");
    source.block_next_write(app.store().payload_path(&resolved.key()));

    let stale = app.load("gene_annotations", &hg38()).unwrap();
    assert_eq!(stale.origin, Origin::Stale);
    let warning = stale.staleness.as_ref().unwrap();
    assert!(warning.reason.contains("persist"));
    assert_eq!(stale.dataset.value.as_text(), Some("hg38\tTP53\n"));
    assert_eq!(source.calls(), 2);
}

#[test]
fn transform_failure_keeps_raw_payload() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("ALK");
    let chain = TransformChain::new("1").then(DecodeText).then(Explode);
    let app = App::new(config(&dir), registry(&source, None, chain));

    let err = app.load("gene_annotations", &hg38()).unwrap_err();
    assert_matches!(err, BidaliError::Transform { ref stage, .. } if stage == "explode");

    let resolved = app.resolve("gene_annotations", &hg38()).unwrap();
    let hit = app.store().get(&resolved.key()).unwrap().unwrap();
    assert_eq!(hit.payload, b"hg38\tALK\n");

    // The payload is reused; only the transform runs again.
    assert!(app.load("gene_annotations", &hg38()).is_err());
    assert_eq!(source.calls(), 1);
}

#[test]
fn deadline_stops_waiting_but_fetch_completes() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("NRAS");
    source.set_delay(Duration::from_millis(400));
    let app = App::new(config(&dir), registry(&source, None, text_chain()));

    let started = Instant::now();
    let options = LoadOptions {
        deadline: Some(Instant::now() + Duration::from_millis(50)),
        force_refresh: false,
    };
    let err = app.load_with("gene_annotations", &hg38(), &options).unwrap_err();
    assert_matches!(err, BidaliError::Fetch { ref reason, .. } if reason.contains("deadline"));
    assert!(started.elapsed() < Duration::from_millis(350));

    let waited = Instant::now();
    while app.orchestrator().inflight() > 0 && waited.elapsed() < Duration::from_secs(5) {
        thread::sleep(Duration::from_millis(10));
    }
    let loaded = app.load("gene_annotations", &hg38()).unwrap();
    assert_eq!(loaded.origin, Origin::Cache);
    assert_eq!(source.calls(), 1);
}

#[test]
fn offline_mode_serves_cache_only() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("PTEN");
    let clock = clock();
    let registry = registry(&source, Some(Ttl::After(Duration::from_secs(60))), text_chain());

    let online = App::with_clock(config(&dir), Arc::clone(&registry), clock.clone());
    online.load("gene_annotations", &hg38()).unwrap();

    let mut offline_config = config(&dir);
    offline_config.offline_mode = true;
    let offline = App::with_clock(offline_config, registry, clock.clone());

    assert_eq!(offline.load("gene_annotations", &hg38()).unwrap().origin, Origin::Cache);
    clock.advance(chrono::Duration::seconds(61));
    let stale = offline.load("gene_annotations", &hg38()).unwrap();
    assert_eq!(stale.origin, Origin::Stale);
    assert!(stale.staleness.unwrap().reason.contains("offline"));

    let err = offline
        .load("gene_annotations", &Params::new().with("build", "mm10"))
        .unwrap_err();
    assert_matches!(err, BidaliError::Fetch { attempts: 0, .. });
    assert_eq!(source.calls(), 1);
}

#[test]
fn corrupt_entry_is_fetched_again() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("CDK4");
    let registry = registry(&source, None, text_chain());
    let app = App::new(config(&dir), Arc::clone(&registry));
    app.load("gene_annotations", &hg38()).unwrap();

    let resolved = app.resolve("gene_annotations", &hg38()).unwrap();
    std::fs::write(app.store().payload_path(&resolved.key()).as_std_path(), b"bit rot").unwrap();

    let fresh = App::new(config(&dir), registry);
    let loaded = fresh.load("gene_annotations", &hg38()).unwrap();
    assert_eq!(loaded.origin, Origin::Fetched);
    assert_eq!(loaded.dataset.value.as_text(), Some("hg38\tCDK4\n"));
    assert_eq!(source.calls(), 2);
}

#[test]
fn invalidate_and_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("MDM2");
    let app = App::new(config(&dir), registry(&source, None, text_chain()));
    app.load("gene_annotations", &hg38()).unwrap();

    let result = app.invalidate("gene_annotations", &hg38(), false).unwrap();
    assert!(result.memo_dropped);
    assert!(!result.evicted);
    assert_eq!(app.load("gene_annotations", &hg38()).unwrap().origin, Origin::Cache);

    let result = app.invalidate("gene_annotations", &hg38(), true).unwrap();
    assert!(result.evicted);
    assert_eq!(app.load("gene_annotations", &hg38()).unwrap().origin, Origin::Fetched);
    assert_eq!(source.calls(), 2);

    let options = LoadOptions {
        deadline: None,
        force_refresh: true,
    };
    let refreshed = app.load_with("gene_annotations", &hg38(), &options).unwrap();
    assert_eq!(refreshed.origin, Origin::Fetched);
    assert_eq!(source.calls(), 3);

    assert_eq!(app.reset(), 1);
    assert_eq!(app.load("gene_annotations", &hg38()).unwrap().origin, Origin::Cache);
}

#[test]
fn status_reports_without_fetching() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("SOX2");
    let clock = clock();
    let app = App::with_clock(
        config(&dir),
        registry(&source, Some(Ttl::After(Duration::from_secs(3600))), text_chain()),
        clock.clone(),
    );

    let before = app.status("gene_annotations", &hg38()).unwrap();
    assert!(!before.cached);
    assert_eq!(source.calls(), 0);

    app.load("gene_annotations", &hg38()).unwrap();
    let after = app.status("gene_annotations", &hg38()).unwrap();
    assert!(after.cached && after.fresh && after.memoized);
    assert_eq!(
        after.expires_at,
        Some(clock.now() + chrono::Duration::seconds(3600))
    );

    let cleared = app.clear().unwrap();
    assert_eq!(cleared.memo_dropped, 1);
    assert!(!app.status("gene_annotations", &hg38()).unwrap().cached);
}

#[test]
fn unknown_dataset_and_bad_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("GATA1");
    let app = App::new(config(&dir), registry(&source, None, text_chain()));

    assert_matches!(
        app.load("protein_atlas", &Params::new()),
        Err(BidaliError::UnknownDataset(_))
    );
    assert_matches!(
        app.load("gene_annotations", &Params::new().with("assembly", "hg38")),
        Err(BidaliError::InvalidParameters { .. })
    );
    assert_eq!(source.calls(), 0);
}

#[test]
fn table_chain_realizes_rows() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("chr17\t43044295");
    let chain = TransformChain::new("1")
        .then(DecodeText)
        .then(ParseDelimited::tsv().headerless());
    let app = App::new(config(&dir), registry(&source, None, chain));

    let loaded = app.load("gene_annotations", &hg38()).unwrap();
    let table = loaded.dataset.value.as_table().unwrap();
    assert_eq!(table.columns, vec!["col1", "col2", "col3"]);
    assert_eq!(table.rows, vec![vec!["hg38", "chr17", "43044295"]]);
}

#[test]
fn gene_annotations_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let source = MockSource::new("ENSG00000141510");
    let clock = clock();
    let descriptor = DatasetDescriptor::builder("gene_annotations", MockFetcher(Arc::clone(&source)))
        .unwrap()
        .param(ParamSpec::required("species", ParamKind::Text).case_insensitive())
        .param(ParamSpec::required("build", ParamKind::Text))
        .transforms(text_chain())
        .ttl(Ttl::After(Duration::from_secs(3600)))
        .build()
        .unwrap();
    let registry = DatasetRegistry::new();
    registry.register(descriptor).unwrap();
    let app = App::with_clock(config(&dir), Arc::new(registry), clock.clone());
    let params = Params::new().with("species", "human").with("build", "GRCh38");

    let first = app.load("gene_annotations", &params).unwrap();
    assert_eq!(source.calls(), 1);
    assert_eq!(app.list().unwrap().entries.len(), 1);

    let reordered = Params::new().with("build", "GRCh38").with("species", "Human");
    let second = app.load("gene_annotations", &reordered).unwrap();
    assert_eq!(second.origin, Origin::Memo);
    assert_eq!(source.calls(), 1);

    clock.advance(chrono::Duration::seconds(3600));
    source.set_mode(Mode::Transient);
    let third = app.load("gene_annotations", &params).unwrap();
    assert_eq!(source.calls(), 4);
    assert_eq!(third.origin, Origin::Stale);
    assert!(third.staleness.is_some());
    assert_eq!(third.dataset.value, first.dataset.value);
    assert_eq!(third.dataset.value.as_text(), Some("GRCh38\tENSG00000141510\n"));
}
