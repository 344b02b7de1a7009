use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BidaliError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DatasetName(String);

impl DatasetName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DatasetName {
    type Err = BidaliError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid = !normalized.is_empty()
            && normalized
                .chars()
                .next()
                .map(|ch| ch.is_ascii_lowercase())
                .unwrap_or(false)
            && normalized
                .chars()
                .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_' || ch == '-');
        if !is_valid {
            return Err(BidaliError::InvalidDatasetName(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Flag(bool),
    Integer(i64),
    Text(String),
}

impl ParamValue {
    pub fn as_text(&self) -> String {
        match self {
            ParamValue::Flag(value) => value.to_string(),
            ParamValue::Integer(value) => value.to_string(),
            ParamValue::Text(value) => value.clone(),
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_text())
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Text(value.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Text(value)
    }
}

impl From<i64> for ParamValue {
    fn from(value: i64) -> Self {
        ParamValue::Integer(value)
    }
}

impl From<bool> for ParamValue {
    fn from(value: bool) -> Self {
        ParamValue::Flag(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamKind {
    Text,
    Integer,
    Flag,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Text => write!(f, "text"),
            ParamKind::Integer => write!(f, "integer"),
            ParamKind::Flag => write!(f, "flag"),
        }
    }
}

/// One declared parameter of a dataset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: Option<ParamValue>,
    pub case_insensitive: bool,
}

impl ParamSpec {
    pub fn required(name: &str, kind: ParamKind) -> Self {
        Self {
            name: normalize_key(name),
            kind,
            default: None,
            case_insensitive: false,
        }
    }

    pub fn optional(name: &str, kind: ParamKind, default: impl Into<ParamValue>) -> Self {
        Self {
            name: normalize_key(name),
            kind,
            default: Some(default.into()),
            case_insensitive: false,
        }
    }

    pub fn case_insensitive(mut self) -> Self {
        self.case_insensitive = true;
        self
    }

    /// Coerces a raw value to the declared kind.
    pub fn coerce(&self, value: &ParamValue) -> Result<ParamValue, String> {
        let coerced = match (self.kind, value) {
            (ParamKind::Text, value) => ParamValue::Text(value.as_text().trim().to_string()),
            (ParamKind::Integer, ParamValue::Integer(value)) => ParamValue::Integer(*value),
            (ParamKind::Integer, ParamValue::Text(text)) => text
                .trim()
                .parse::<i64>()
                .map(ParamValue::Integer)
                .map_err(|_| format!("{} expects an integer, got {text:?}", self.name))?,
            (ParamKind::Flag, ParamValue::Flag(value)) => ParamValue::Flag(*value),
            (ParamKind::Flag, ParamValue::Text(text)) => {
                match text.trim().to_lowercase().as_str() {
                    "1" | "true" | "yes" | "on" => ParamValue::Flag(true),
                    "0" | "false" | "no" | "off" => ParamValue::Flag(false),
                    _ => return Err(format!("{} expects a flag, got {text:?}", self.name)),
                }
            }
            (ParamKind::Flag, ParamValue::Integer(value)) if *value == 0 || *value == 1 => {
                ParamValue::Flag(*value == 1)
            }
            (kind, value) => return Err(format!("{} expects {kind}, got {value}", self.name)),
        };
        Ok(match coerced {
            ParamValue::Text(text) if text.is_empty() => {
                return Err(format!("{} must not be empty", self.name));
            }
            ParamValue::Text(text) if self.case_insensitive => ParamValue::Text(text.to_lowercase()),
            other => other,
        })
    }
}

pub fn normalize_key(key: &str) -> String {
    key.trim().to_lowercase().replace('-', "_")
}

/// Canonical parameter set. Keys are kept sorted so iteration and
/// serialization order never depend on how the caller built the request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Params(BTreeMap<String, ParamValue>);

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Into<ParamValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<ParamValue>) {
        self.0.insert(normalize_key(key), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.0.get(&normalize_key(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParamValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for Params {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts = self
            .0
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>();
        write!(f, "{}", parts.join(","))
    }
}

impl<K: AsRef<str>, V: Into<ParamValue>> FromIterator<(K, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut params = Params::new();
        for (key, value) in iter {
            params.insert(key.as_ref(), value);
        }
        params
    }
}

/// How long an entry stays fresh after it was fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Ttl {
    Infinite,
    After(Duration),
}

impl Ttl {
    pub fn from_secs(secs: Option<u64>) -> Self {
        match secs {
            Some(secs) => Ttl::After(Duration::from_secs(secs)),
            None => Ttl::Infinite,
        }
    }

    pub fn as_secs(&self) -> Option<u64> {
        match self {
            Ttl::Infinite => None,
            Ttl::After(duration) => Some(duration.as_secs()),
        }
    }
}

impl fmt::Display for Ttl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ttl::Infinite => write!(f, "infinite"),
            Ttl::After(duration) => write!(f, "{}s", duration.as_secs()),
        }
    }
}

/// `name[:key=value[,key=value...]]`, as typed on the command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpecifier {
    pub name: DatasetName,
    pub params: Params,
}

impl FromStr for DatasetSpecifier {
    type Err = BidaliError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let (name, rest) = match trimmed.split_once(':') {
            Some((name, rest)) => (name, Some(rest)),
            None => (trimmed, None),
        };
        let name = name
            .parse::<DatasetName>()
            .map_err(|_| BidaliError::InvalidSpecifier(value.to_string()))?;
        let mut params = Params::new();
        for pair in rest.unwrap_or_default().split(',') {
            if pair.trim().is_empty() {
                continue;
            }
            let (key, val) = pair
                .split_once('=')
                .ok_or_else(|| BidaliError::InvalidSpecifier(value.to_string()))?;
            if key.trim().is_empty() {
                return Err(BidaliError::InvalidSpecifier(value.to_string()));
            }
            params.insert(key, val.trim());
        }
        Ok(Self { name, params })
    }
}

impl fmt::Display for DatasetSpecifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.params.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}:{}", self.name, self.params)
        }
    }
}
