use std::fs;
use std::io;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use reqwest::header::{ETAG, HeaderMap, HeaderValue, USER_AGENT};

use crate::domain::{DatasetName, Params};
use crate::error::BidaliError;

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([a-z_][a-z0-9_]*)\}").unwrap());

/// Result of a single fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Success {
        payload: Vec<u8>,
        source_checksum: Option<String>,
    },
    /// Worth retrying: timeouts, dropped connections, 5xx, rate limits.
    TransientFailure(String),
    /// Retrying will not help: missing resource, bad request, bad parameters.
    FatalFailure(String),
}

impl FetchOutcome {
    pub fn success(payload: impl Into<Vec<u8>>) -> Self {
        FetchOutcome::Success {
            payload: payload.into(),
            source_checksum: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub dataset: DatasetName,
    pub params: Params,
    pub timeout: Duration,
}

/// A source of raw dataset bytes. Implementations never touch the cache.
pub trait Fetcher: Send + Sync {
    /// Stable description of where data comes from, used in error context and
    /// to tell registrations apart.
    fn source_id(&self) -> String;

    fn fetch(&self, request: &FetchRequest) -> FetchOutcome;
}

/// Substitutes `{param}` placeholders with normalized parameter values.
pub fn render_template(template: &str, params: &Params) -> Result<String, String> {
    render(template, params, false)
}

/// Like [`render_template`], for filesystem paths: a substituted value may
/// not climb out of its directory.
pub fn render_path_template(template: &str, params: &Params) -> Result<String, String> {
    render(template, params, true)
}

fn render(template: &str, params: &Params, path: bool) -> Result<String, String> {
    let mut missing = Vec::new();
    let mut escaping = Vec::new();
    let rendered = PLACEHOLDER.replace_all(template, |caps: &regex::Captures<'_>| {
        match params.get(&caps[1]) {
            Some(value) => {
                let text = value.as_text();
                if path && (text.contains("..") || text.contains('/') || text.contains('\\')) {
                    escaping.push(caps[1].to_string());
                }
                text
            }
            None => {
                missing.push(caps[1].to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        return Err(format!("template {template} needs parameter(s) {}", missing.join(", ")));
    }
    if !escaping.is_empty() {
        return Err(format!(
            "parameter(s) {} contain a path separator",
            escaping.join(", ")
        ));
    }
    Ok(rendered.into_owned())
}

#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
    url_template: String,
}

impl HttpFetcher {
    pub fn new(url_template: &str) -> Result<Self, BidaliError> {
        Ok(Self {
            client: default_client()?,
            url_template: url_template.to_string(),
        })
    }

    pub fn with_client(client: Client, url_template: &str) -> Self {
        Self {
            client,
            url_template: url_template.to_string(),
        }
    }

    pub fn url_template(&self) -> &str {
        &self.url_template
    }
}

pub fn default_client() -> Result<Client, BidaliError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("bidali/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| BidaliError::Http(err.to_string()))?,
    );
    Client::builder()
        .default_headers(headers)
        .build()
        .map_err(|err| BidaliError::Http(err.to_string()))
}

impl Fetcher for HttpFetcher {
    fn source_id(&self) -> String {
        self.url_template.clone()
    }

    fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        let url = match render_template(&self.url_template, &request.params) {
            Ok(url) => url,
            Err(reason) => return FetchOutcome::FatalFailure(reason),
        };
        http_get(&self.client, &url, request.timeout)
    }
}

/// One blocking GET, classified for the retry loop.
pub fn http_get(client: &Client, url: &str, timeout: Duration) -> FetchOutcome {
    let response = match client.get(url).timeout(timeout).send() {
        Ok(response) => response,
        Err(err) if is_retryable_error(&err) => {
            return FetchOutcome::TransientFailure(format!("GET {url}: {err}"));
        }
        Err(err) => return FetchOutcome::FatalFailure(format!("GET {url}: {err}")),
    };

    let status = response.status().as_u16();
    if !response.status().is_success() {
        let message = format!("GET {url} returned status {status}");
        return if is_retryable_status(status) {
            FetchOutcome::TransientFailure(message)
        } else {
            FetchOutcome::FatalFailure(message)
        };
    }

    let etag = response
        .headers()
        .get(ETAG)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim_matches('"').to_string())
        .filter(|value| !value.is_empty());
    match response.bytes() {
        Ok(bytes) => FetchOutcome::Success {
            payload: bytes.to_vec(),
            source_checksum: etag,
        },
        Err(err) => FetchOutcome::TransientFailure(format!("read body of {url}: {err}")),
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request() || err.is_body()
}

/// Reads datasets that already live on local disk.
#[derive(Debug, Clone)]
pub struct LocalFileFetcher {
    path_template: String,
}

impl LocalFileFetcher {
    pub fn new(path_template: &str) -> Self {
        Self {
            path_template: path_template.to_string(),
        }
    }
}

impl Fetcher for LocalFileFetcher {
    fn source_id(&self) -> String {
        format!("file://{}", self.path_template)
    }

    fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        let path = match render_path_template(&self.path_template, &request.params) {
            Ok(path) => path,
            Err(reason) => return FetchOutcome::FatalFailure(reason),
        };
        match fs::read(&path) {
            Ok(payload) => FetchOutcome::success(payload),
            Err(err) if matches!(err.kind(), io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied) => {
                FetchOutcome::FatalFailure(format!("read {path}: {err}"))
            }
            Err(err) => FetchOutcome::TransientFailure(format!("read {path}: {err}")),
        }
    }
}
