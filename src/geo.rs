use std::sync::LazyLock;

use regex::Regex;
use reqwest::blocking::Client;

use crate::error::BidaliError;
use crate::fetcher::{FetchOutcome, FetchRequest, Fetcher, default_client, http_get};
use crate::transform::{Representation, Table, Transform};

static SERIES_ACCESSION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^GSE\d+$").unwrap());

pub const GEO_SERIES_BASE: &str = "https://ftp.ncbi.nlm.nih.gov/geo/series";

/// Downloads the gzipped series matrix of a GEO series given as the
/// `accession` parameter.
#[derive(Clone)]
pub struct GeoSeriesMatrixFetcher {
    client: Client,
    base_url: String,
}

impl GeoSeriesMatrixFetcher {
    pub fn new() -> Result<Self, BidaliError> {
        Ok(Self::with_client(default_client()?, GEO_SERIES_BASE))
    }

    pub fn with_client(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn matrix_url(&self, accession: &str) -> String {
        format!(
            "{base}/{prefix}/{acc}/matrix/{acc}_series_matrix.txt.gz",
            base = self.base_url,
            prefix = geo_series_prefix(accession),
            acc = accession
        )
    }
}

impl Fetcher for GeoSeriesMatrixFetcher {
    fn source_id(&self) -> String {
        format!("{}/{{prefix}}/{{accession}}/matrix", self.base_url)
    }

    fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        let accession = match request.params.get("accession") {
            Some(value) => value.as_text().trim().to_ascii_uppercase(),
            None => return FetchOutcome::FatalFailure("missing accession parameter".to_string()),
        };
        if !SERIES_ACCESSION.is_match(&accession) {
            return FetchOutcome::FatalFailure(format!(
                "{accession} is not a GEO series accession (expected GSE followed by digits)"
            ));
        }
        http_get(&self.client, &self.matrix_url(&accession), request.timeout)
    }
}

/// GEO groups series into directories of a thousand: `GSE12345` lives under
/// `GSE12nnn`, anything with three digits or fewer under `GSEnnn`.
pub fn geo_series_prefix(accession: &str) -> String {
    let digits = accession.trim_start_matches("GSE");
    if digits.len() <= 3 {
        return "GSEnnn".to_string();
    }
    let head = &digits[..digits.len() - 3];
    format!("GSE{head}nnn")
}

/// Value of the first `!Series_<field>` header line, unquoted.
pub fn series_header(text: &str, field: &str) -> Option<String> {
    let prefix = format!("!Series_{field}");
    text.lines()
        .filter_map(|line| line.strip_prefix(prefix.as_str()))
        .filter_map(|rest| rest.strip_prefix('\t'))
        .map(|value| value.trim().trim_matches('"').to_string())
        .find(|value| !value.is_empty())
}

/// Turns series matrix text into the table between
/// `!series_matrix_table_begin` and `!series_matrix_table_end`.
#[derive(Debug, Clone, Copy)]
pub struct ParseSeriesMatrix;

impl Transform for ParseSeriesMatrix {
    fn name(&self) -> String {
        "geo_series_matrix".to_string()
    }

    fn apply(&self, input: Representation) -> Result<Representation, String> {
        let Representation::Text(text) = input else {
            return Err(format!("expected text, got {}", input.kind()));
        };
        let block = text
            .lines()
            .skip_while(|line| !line.starts_with("!series_matrix_table_begin"))
            .skip(1)
            .take_while(|line| !line.starts_with("!series_matrix_table_end"))
            .collect::<Vec<_>>()
            .join("\n");

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(block.as_bytes());
        let mut records = reader
            .records()
            .filter(|record| {
                record
                    .as_ref()
                    .map(|record| record.iter().any(|field| !field.is_empty()))
                    .unwrap_or(true)
            })
            .map(|record| {
                record
                    .map(|record| record.iter().map(str::to_string).collect::<Vec<_>>())
                    .map_err(|err| format!("series matrix: {err}"))
            });

        let columns = records
            .next()
            .ok_or_else(|| "no series matrix table found".to_string())??;
        let mut rows = Vec::new();
        for (index, row) in records.enumerate() {
            let row = row?;
            if row.len() != columns.len() {
                return Err(format!(
                    "matrix row {} has {} fields, header has {}",
                    index + 1,
                    row.len(),
                    columns.len()
                ));
            }
            rows.push(row);
        }
        Ok(Representation::Table(Table { columns, rows }))
    }
}
