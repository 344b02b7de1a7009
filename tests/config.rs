use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use bidali::config::{Config, ConfigLoader};
use bidali::domain::Ttl;
use bidali::error::BidaliError;

#[test]
fn resolve_reads_explicit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bidali.json");
    std::fs::write(
        &path,
        r#"{
            "cache_dir": "/srv/bidali-cache",
            "default_ttl": 3600,
            "retry_count": 5,
            "retry_backoff_base": 0.25,
            "fetch_timeout": 12.5,
            "lock_timeout": 2
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap();
    assert_eq!(resolved.default_ttl, Ttl::After(Duration::from_secs(3600)));
    assert_eq!(resolved.retry_count, 5);
    assert_eq!(resolved.retry_backoff_base, Duration::from_millis(250));
    assert_eq!(resolved.fetch_timeout, Duration::from_secs_f64(12.5));
    assert_eq!(resolved.lock_timeout, Duration::from_secs(2));
    assert_eq!(resolved.backoff_for(1), Duration::from_millis(500));
}

#[test]
fn resolve_missing_file_is_config_read() {
    let err = ConfigLoader::resolve(Some("/nonexistent/bidali.json")).unwrap_err();
    assert_matches!(err, BidaliError::ConfigRead(_));
}

#[test]
fn resolve_malformed_file_is_config_parse() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bidali.json");
    std::fs::write(&path, r#"{"retry_count": "many"}"#).unwrap();
    let err = ConfigLoader::resolve(Some(path.to_str().unwrap())).unwrap_err();
    assert_matches!(err, BidaliError::ConfigParse(_));
}

#[test]
fn defaults() {
    let resolved = ConfigLoader::resolve_config(Config {
        cache_dir: Some("/tmp/bidali".to_string()),
        ..Config::default()
    })
    .unwrap();
    assert_eq!(resolved.cache_dir, Utf8PathBuf::from("/tmp/bidali"));
    assert_eq!(resolved.default_ttl, Ttl::After(Duration::from_secs(7 * 24 * 3600)));
    assert_eq!(resolved.retry_count, 2);
    assert_eq!(resolved.retry_backoff_base, Duration::from_millis(500));
    assert_eq!(resolved.fetch_timeout, Duration::from_secs(60));
    assert!(!resolved.offline_mode);
}

#[test]
fn offline_flag_from_file() {
    let config: Config =
        serde_json::from_str(r#"{"cache_dir": "/tmp/bidali", "offline_mode": true}"#).unwrap();
    assert!(ConfigLoader::resolve_config(config).unwrap().offline_mode);
}

#[test]
fn oversized_or_negative_durations_are_config_parse() {
    for body in [
        r#"{"cache_dir": "/tmp/bidali", "fetch_timeout": 1e20}"#,
        r#"{"cache_dir": "/tmp/bidali", "lock_timeout": -1}"#,
        r#"{"cache_dir": "/tmp/bidali", "retry_backoff_base": 1e300}"#,
    ] {
        let config: Config = serde_json::from_str(body).unwrap();
        let err = ConfigLoader::resolve_config(config).unwrap_err();
        assert_matches!(err, BidaliError::ConfigParse(_));
    }
}
