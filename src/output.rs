use std::io::{self, Write};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::app::{
    ClearResult, DatasetSummary, InvalidateResult, ListResult, Loaded, StatusResult,
};
use crate::domain::Params;
use crate::orchestrator::{Origin, StalenessWarning};
use crate::transform::Representation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

/// What `data load` reports; the realized value itself only with `full`.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport<'a> {
    pub dataset: String,
    pub params: &'a Params,
    pub fingerprint: String,
    pub origin: Origin,
    pub fetched_at: DateTime<Utc>,
    pub source: &'a str,
    pub kind: &'static str,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staleness: Option<&'a StalenessWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<&'a Representation>,
}

impl<'a> LoadReport<'a> {
    pub fn new(loaded: &'a Loaded, full: bool) -> Self {
        let dataset = &loaded.dataset;
        Self {
            dataset: dataset.name.to_string(),
            params: &dataset.params,
            fingerprint: dataset.fingerprint.to_string(),
            origin: loaded.origin,
            fetched_at: dataset.fetched_at,
            source: &dataset.source,
            kind: dataset.value.kind(),
            summary: dataset.value.summary(),
            staleness: loaded.staleness.as_ref(),
            value: full.then_some(&dataset.value),
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_load(report: &LoadReport<'_>) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_invalidate(result: &InvalidateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_clear(result: &ClearResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_datasets(result: &[DatasetSummary]) -> io::Result<()> {
        Self::print_json(&result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct HumanOutput;

impl HumanOutput {
    pub fn print_load(report: &LoadReport<'_>) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{} ({})", report.dataset, report.params)?;
        writeln!(out, "  fingerprint: {}", report.fingerprint)?;
        writeln!(out, "  origin:      {}", report.origin)?;
        writeln!(out, "  fetched at:  {}", report.fetched_at.to_rfc3339())?;
        writeln!(out, "  source:      {}", report.source)?;
        writeln!(out, "  value:       {} ({})", report.kind, report.summary)?;
        if let Some(warning) = report.staleness {
            writeln!(out, "  warning:     {warning}")?;
        }
        Ok(())
    }

    pub fn print_list(result: &ListResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        if result.entries.is_empty() {
            return writeln!(out, "cache is empty");
        }
        for entry in &result.entries {
            writeln!(
                out,
                "{:<20} {}  {:>12} bytes  {}  {}",
                entry.dataset,
                &entry.fingerprint[..entry.fingerprint.len().min(12)],
                entry.payload_len,
                entry.fetched_at.format("%Y-%m-%d %H:%M"),
                if entry.fresh { "fresh" } else { "expired" }
            )?;
        }
        Ok(())
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        let mut out = io::stdout().lock();
        writeln!(out, "{} ({})", result.dataset, result.params)?;
        writeln!(out, "  fingerprint: {}", result.fingerprint)?;
        if !result.cached {
            return writeln!(out, "  not cached");
        }
        let state = if result.fresh { "fresh" } else { "expired" };
        writeln!(out, "  state:       {state}")?;
        if let Some(fetched_at) = result.fetched_at {
            writeln!(out, "  fetched at:  {}", fetched_at.to_rfc3339())?;
        }
        match result.expires_at {
            Some(expires_at) => writeln!(out, "  expires at:  {}", expires_at.to_rfc3339())?,
            None => writeln!(out, "  expires at:  never")?,
        }
        if let Some(path) = &result.payload_path {
            writeln!(out, "  payload:     {path}")?;
        }
        if let Some(source) = &result.source {
            writeln!(out, "  source:      {source}")?;
        }
        Ok(())
    }

    pub fn print_invalidate(result: &InvalidateResult) -> io::Result<()> {
        let action = if result.evicted { "evicted" } else { "nothing evicted" };
        writeln!(io::stdout().lock(), "{} {action}", result.fingerprint)
    }

    pub fn print_clear(_result: &ClearResult) -> io::Result<()> {
        writeln!(io::stdout().lock(), "cache cleared")
    }

    pub fn print_datasets(result: &[DatasetSummary]) -> io::Result<()> {
        let mut out = io::stdout().lock();
        for dataset in result {
            writeln!(out, "{:<20} {}", dataset.name, dataset.description)?;
            for param in &dataset.params {
                match &param.default {
                    Some(default) => writeln!(out, "{:<22}{} ({}, default {default})", "", param.name, param.kind)?,
                    None => writeln!(out, "{:<22}{} ({}, required)", "", param.name, param.kind)?,
                }
            }
        }
        Ok(())
    }
}
