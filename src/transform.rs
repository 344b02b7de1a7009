//! Transform chains turn a raw cached payload into the structure analysis code
//! works with. Stages are pure; the chain identity (version plus stage names)
//! is part of every fingerprint.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use serde::Serialize;

use crate::fs_util::read_zip_member;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column == name)
    }

    pub fn column(&self, name: &str) -> Option<Vec<&str>> {
        let index = self.column_index(name)?;
        Some(
            self.rows
                .iter()
                .map(|row| row.get(index).map(String::as_str).unwrap_or(""))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Node {
    pub label: Option<String>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub relation: String,
}

/// Directed, labelled graph such as an ontology or a regulatory network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Graph {
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
}

impl Graph {
    pub fn successors<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |edge| edge.from == id)
    }
}

/// Key to one-or-more values, e.g. gene to pathways or old to new coordinates.
pub type Mapping = BTreeMap<String, Vec<String>>;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Representation {
    Bytes(Vec<u8>),
    Text(String),
    Table(Table),
    Graph(Graph),
    Mapping(Mapping),
    Json(serde_json::Value),
}

impl Representation {
    pub fn kind(&self) -> &'static str {
        match self {
            Representation::Bytes(_) => "bytes",
            Representation::Text(_) => "text",
            Representation::Table(_) => "table",
            Representation::Graph(_) => "graph",
            Representation::Mapping(_) => "mapping",
            Representation::Json(_) => "json",
        }
    }

    /// One-line shape description for listings.
    pub fn summary(&self) -> String {
        match self {
            Representation::Bytes(bytes) => format!("{} bytes", bytes.len()),
            Representation::Text(text) => format!("{} lines", text.lines().count()),
            Representation::Table(table) => {
                format!("{} rows x {} columns", table.rows.len(), table.columns.len())
            }
            Representation::Graph(graph) => {
                format!("{} nodes, {} edges", graph.nodes.len(), graph.edges.len())
            }
            Representation::Mapping(mapping) => format!("{} keys", mapping.len()),
            Representation::Json(_) => "json document".to_string(),
        }
    }

    pub fn as_table(&self) -> Option<&Table> {
        match self {
            Representation::Table(table) => Some(table),
            _ => None,
        }
    }

    pub fn as_graph(&self) -> Option<&Graph> {
        match self {
            Representation::Graph(graph) => Some(graph),
            _ => None,
        }
    }

    pub fn as_mapping(&self) -> Option<&Mapping> {
        match self {
            Representation::Mapping(mapping) => Some(mapping),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Representation::Text(text) => Some(text),
            _ => None,
        }
    }

    fn into_bytes(self, stage: &str) -> Result<Vec<u8>, String> {
        match self {
            Representation::Bytes(bytes) => Ok(bytes),
            Representation::Text(text) => Ok(text.into_bytes()),
            other => Err(format!("{stage} expects bytes, got {}", other.kind())),
        }
    }

    fn into_text(self, stage: &str) -> Result<String, String> {
        match self {
            Representation::Text(text) => Ok(text),
            Representation::Bytes(bytes) => {
                String::from_utf8(bytes).map_err(|err| format!("payload is not UTF-8: {err}"))
            }
            other => Err(format!("{stage} expects text, got {}", other.kind())),
        }
    }
}

pub trait Transform: Send + Sync {
    fn name(&self) -> String;

    fn apply(&self, input: Representation) -> Result<Representation, String>;
}

/// Failure of one stage, before fingerprint context is attached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageError {
    pub stage: String,
    pub reason: String,
}

#[derive(Clone)]
pub struct TransformChain {
    version: String,
    stages: Vec<Arc<dyn Transform>>,
}

impl fmt::Debug for TransformChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformChain")
            .field("identity", &self.identity())
            .finish()
    }
}

impl TransformChain {
    pub fn new(version: &str) -> Self {
        Self {
            version: version.to_string(),
            stages: Vec::new(),
        }
    }

    pub fn then(mut self, stage: impl Transform + 'static) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// `version:stage>stage>...`; changing either part re-keys the cache.
    pub fn identity(&self) -> String {
        let names = self
            .stages
            .iter()
            .map(|stage| stage.name())
            .collect::<Vec<_>>();
        format!("{}:{}", self.version, names.join(">"))
    }

    pub fn run(&self, payload: Vec<u8>) -> Result<Representation, StageError> {
        let mut current = Representation::Bytes(payload);
        for stage in &self.stages {
            current = stage.apply(current).map_err(|reason| StageError {
                stage: stage.name(),
                reason,
            })?;
        }
        Ok(current)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Gunzip;

impl Transform for Gunzip {
    fn name(&self) -> String {
        "gunzip".to_string()
    }

    fn apply(&self, input: Representation) -> Result<Representation, String> {
        let bytes = input.into_bytes("gunzip")?;
        let mut decoder = MultiGzDecoder::new(bytes.as_slice());
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|err| format!("gunzip: {err}"))?;
        Ok(Representation::Bytes(out))
    }
}

/// Picks one file out of a zip archive.
#[derive(Debug, Clone)]
pub struct ZipMember(pub Option<String>);

impl Transform for ZipMember {
    fn name(&self) -> String {
        match &self.0 {
            Some(member) => format!("unzip({member})"),
            None => "unzip".to_string(),
        }
    }

    fn apply(&self, input: Representation) -> Result<Representation, String> {
        let bytes = input.into_bytes("unzip")?;
        read_zip_member(&bytes, self.0.as_deref()).map(Representation::Bytes)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DecodeText;

impl Transform for DecodeText {
    fn name(&self) -> String {
        "decode_text".to_string()
    }

    fn apply(&self, input: Representation) -> Result<Representation, String> {
        input.into_text("decode_text").map(Representation::Text)
    }
}

/// Delimited text to a table, quoted per RFC 4180. Without a header,
/// columns are named `col1..colN` after the widest row.
#[derive(Debug, Clone)]
pub struct ParseDelimited {
    pub delimiter: u8,
    pub header: bool,
    pub comment: Option<u8>,
}

impl ParseDelimited {
    pub fn tsv() -> Self {
        Self {
            delimiter: b'\t',
            header: true,
            comment: None,
        }
    }

    pub fn headerless(mut self) -> Self {
        self.header = false;
        self
    }

    pub fn comment(mut self, marker: u8) -> Self {
        self.comment = Some(marker);
        self
    }
}

impl Transform for ParseDelimited {
    fn name(&self) -> String {
        format!(
            "delimited({:?},header={},comment={})",
            char::from(self.delimiter),
            self.header,
            self.comment.map(char::from).map(String::from).unwrap_or_default()
        )
    }

    fn apply(&self, input: Representation) -> Result<Representation, String> {
        let text = input.into_text("delimited")?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(self.header)
            .comment(self.comment)
            .flexible(true)
            .from_reader(text.as_bytes());

        let header = if self.header {
            let header = reader
                .headers()
                .map_err(|err| format!("delimited: {err}"))?
                .iter()
                .map(str::to_string)
                .collect::<Vec<_>>();
            if header.is_empty() {
                return Err("delimited payload has no header row".to_string());
            }
            Some(header)
        } else {
            None
        };

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| format!("delimited: {err}"))?;
            if record.iter().all(|cell| cell.trim().is_empty()) {
                continue;
            }
            rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        let columns = match header {
            Some(header) => {
                if let Some((line, row)) = rows
                    .iter()
                    .enumerate()
                    .find(|(_, row)| row.len() > header.len())
                {
                    return Err(format!(
                        "row {} has {} cells but the header has {}",
                        line + 1,
                        row.len(),
                        header.len()
                    ));
                }
                header
            }
            None => {
                let width = rows.iter().map(Vec::len).max().unwrap_or(0);
                (1..=width).map(|i| format!("col{i}")).collect()
            }
        };
        Ok(Representation::Table(Table { columns, rows }))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseJson;

impl Transform for ParseJson {
    fn name(&self) -> String {
        "json".to_string()
    }

    fn apply(&self, input: Representation) -> Result<Representation, String> {
        let bytes = input.into_bytes("json")?;
        serde_json::from_slice(&bytes)
            .map(Representation::Json)
            .map_err(|err| format!("json: {err}"))
    }
}

/// OBO 1.2 ontology to a graph: one node per `[Term]`, `is_a` and
/// `relationship` lines become edges pointing from child to parent.
#[derive(Debug, Clone, Copy)]
pub struct ParseObo;

impl Transform for ParseObo {
    fn name(&self) -> String {
        "obo".to_string()
    }

    fn apply(&self, input: Representation) -> Result<Representation, String> {
        let text = input.into_text("obo")?;
        let mut graph = Graph::default();
        let mut in_term = false;
        let mut current: Option<(String, Node)> = None;

        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('[') {
                flush_term(&mut current, &mut graph);
                in_term = line == "[Term]";
                continue;
            }
            if !in_term || line.is_empty() || line.starts_with('!') {
                continue;
            }
            let Some((tag, value)) = line.split_once(':') else {
                continue;
            };
            let value = strip_obo_comment(value.trim());
            match tag.trim() {
                "id" => {
                    flush_term(&mut current, &mut graph);
                    current = Some((value.to_string(), Node::default()));
                }
                tag => {
                    let Some((id, node)) = current.as_mut() else {
                        return Err(format!("obo tag {tag} before any term id"));
                    };
                    match tag {
                        "name" => node.label = Some(value.to_string()),
                        "is_a" => graph.edges.push(Edge {
                            from: id.clone(),
                            to: value.to_string(),
                            relation: "is_a".to_string(),
                        }),
                        "relationship" => {
                            let mut parts = value.split_whitespace();
                            if let (Some(relation), Some(target)) = (parts.next(), parts.next()) {
                                graph.edges.push(Edge {
                                    from: id.clone(),
                                    to: target.to_string(),
                                    relation: relation.to_string(),
                                });
                            }
                        }
                        other => node
                            .attributes
                            .entry(other.to_string())
                            .or_default()
                            .push(value.to_string()),
                    }
                }
            }
        }
        flush_term(&mut current, &mut graph);

        if graph.nodes.is_empty() {
            return Err("obo payload contains no [Term] stanzas".to_string());
        }
        Ok(Representation::Graph(graph))
    }
}

fn flush_term(current: &mut Option<(String, Node)>, graph: &mut Graph) {
    if let Some((id, node)) = current.take() {
        graph.nodes.insert(id, node);
    }
}

fn strip_obo_comment(value: &str) -> &str {
    match value.find(" ! ") {
        Some(index) => value[..index].trim(),
        None => value,
    }
}

/// Table to mapping: groups `value` cells under their `key` cell.
#[derive(Debug, Clone)]
pub struct IndexColumns {
    pub key: String,
    pub value: String,
}

impl IndexColumns {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

impl Transform for IndexColumns {
    fn name(&self) -> String {
        format!("index({}->{})", self.key, self.value)
    }

    fn apply(&self, input: Representation) -> Result<Representation, String> {
        let Representation::Table(table) = input else {
            return Err(format!("index expects a table, got {}", input.kind()));
        };
        let key = table
            .column_index(&self.key)
            .ok_or_else(|| format!("no column named {}", self.key))?;
        let value = table
            .column_index(&self.value)
            .ok_or_else(|| format!("no column named {}", self.value))?;
        let mut mapping = Mapping::new();
        for row in &table.rows {
            let (Some(k), Some(v)) = (row.get(key), row.get(value)) else {
                continue;
            };
            let values = mapping.entry(k.clone()).or_default();
            if !values.contains(v) {
                values.push(v.clone());
            }
        }
        Ok(Representation::Mapping(mapping))
    }
}
