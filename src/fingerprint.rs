//! Deterministic cache keys.
//!
//! A fingerprint is the blake3 digest of a canonical JSON document built from
//! the dataset name, the normalized parameters and the transform chain
//! identity. `Params` is backed by a `BTreeMap`, so the serialized key order is
//! fixed regardless of how the request was assembled.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::{DatasetName, Params};
use crate::error::BidaliError;

/// Bumped whenever the canonical document layout changes.
pub const FINGERPRINT_SCHEME: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct CanonicalIdentity<'a> {
    scheme: u32,
    dataset: &'a str,
    params: &'a Params,
    transforms: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_version: Option<&'a str>,
}

impl Fingerprint {
    pub fn compute(
        name: &DatasetName,
        params: &Params,
        transform_identity: &str,
        source_version: Option<&str>,
    ) -> Self {
        let canonical = CanonicalIdentity {
            scheme: FINGERPRINT_SCHEME,
            dataset: name.as_str(),
            params,
            transforms: transform_identity,
            source_version,
        };
        // Serializing plain strings and integers cannot fail.
        let json = serde_json::to_vec(&canonical).unwrap_or_default();
        Self(blake3::hash(&json).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = BidaliError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        let is_valid = normalized.len() == 64 && normalized.chars().all(|ch| ch.is_ascii_hexdigit());
        if !is_valid {
            return Err(BidaliError::InvalidSpecifier(format!(
                "not a fingerprint: {value}"
            )));
        }
        Ok(Self(normalized))
    }
}

/// Hex blake3 digest of a payload, recorded in the sidecar and checked on read.
pub fn payload_checksum(bytes: &[u8]) -> String {
    blake3::hash(bytes).to_hex().to_string()
}
