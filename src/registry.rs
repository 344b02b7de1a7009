use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use crate::domain::{DatasetName, ParamSpec, Params, Ttl};
use crate::error::BidaliError;
use crate::fetcher::Fetcher;
use crate::fingerprint::Fingerprint;
use crate::store::EntryKey;
use crate::transform::TransformChain;

/// Registered identity and pipeline of one logical dataset. Immutable once
/// handed to the registry.
#[derive(Clone)]
pub struct DatasetDescriptor {
    pub name: DatasetName,
    pub description: String,
    pub params: Vec<ParamSpec>,
    pub fetcher: Arc<dyn Fetcher>,
    pub transforms: TransformChain,
    /// `None` falls back to the configured default TTL.
    pub ttl: Option<Ttl>,
    pub source_version: Option<String>,
}

impl fmt::Debug for DatasetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetDescriptor")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("source", &self.fetcher.source_id())
            .field("transforms", &self.transforms.identity())
            .field("ttl", &self.ttl)
            .field("source_version", &self.source_version)
            .finish()
    }
}

impl DatasetDescriptor {
    pub fn builder(name: &str, fetcher: impl Fetcher + 'static) -> Result<DescriptorBuilder, BidaliError> {
        Ok(DescriptorBuilder {
            descriptor: DatasetDescriptor {
                name: name.parse()?,
                description: String::new(),
                params: Vec::new(),
                fetcher: Arc::new(fetcher),
                transforms: TransformChain::new("1"),
                ttl: None,
                source_version: None,
            },
        })
    }

    /// Two descriptors share a pipeline when source, parameter schema,
    /// transform chain, TTL and source version all agree.
    fn same_pipeline(&self, other: &DatasetDescriptor) -> bool {
        self.fetcher.source_id() == other.fetcher.source_id()
            && self.params == other.params
            && self.transforms.identity() == other.transforms.identity()
            && self.ttl == other.ttl
            && self.source_version == other.source_version
    }

    /// Validates and canonicalizes caller parameters against the schema.
    pub fn normalize_params(&self, raw: &Params) -> Result<Params, BidaliError> {
        let invalid = |reason: String| BidaliError::InvalidParameters {
            dataset: self.name.to_string(),
            reason,
        };
        let declared = self
            .params
            .iter()
            .map(|spec| spec.name.as_str())
            .collect::<BTreeSet<_>>();
        let unknown = raw
            .iter()
            .map(|(key, _)| key.as_str())
            .filter(|key| !declared.contains(key))
            .collect::<Vec<_>>();
        if !unknown.is_empty() {
            return Err(invalid(format!("unknown parameter(s) {}", unknown.join(", "))));
        }

        let mut normalized = Params::new();
        for spec in &self.params {
            let value = match (raw.get(&spec.name), &spec.default) {
                (Some(value), _) => spec.coerce(value).map_err(invalid)?,
                (None, Some(default)) => spec.coerce(default).map_err(invalid)?,
                (None, None) => return Err(invalid(format!("missing required parameter {}", spec.name))),
            };
            normalized.insert(&spec.name, value);
        }
        Ok(normalized)
    }

    pub fn fingerprint(&self, normalized: &Params) -> Fingerprint {
        Fingerprint::compute(
            &self.name,
            normalized,
            &self.transforms.identity(),
            self.source_version.as_deref(),
        )
    }
}

pub struct DescriptorBuilder {
    descriptor: DatasetDescriptor,
}

impl DescriptorBuilder {
    pub fn description(mut self, description: &str) -> Self {
        self.descriptor.description = description.to_string();
        self
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.descriptor.params.push(spec);
        self
    }

    pub fn transforms(mut self, chain: TransformChain) -> Self {
        self.descriptor.transforms = chain;
        self
    }

    pub fn ttl(mut self, ttl: Ttl) -> Self {
        self.descriptor.ttl = Some(ttl);
        self
    }

    pub fn source_version(mut self, version: &str) -> Self {
        self.descriptor.source_version = Some(version.to_string());
        self
    }

    pub fn build(mut self) -> Result<DatasetDescriptor, BidaliError> {
        let mut seen = BTreeSet::new();
        for spec in &self.descriptor.params {
            if !seen.insert(spec.name.clone()) {
                return Err(BidaliError::InvalidParameters {
                    dataset: self.descriptor.name.to_string(),
                    reason: format!("parameter {} declared twice", spec.name),
                });
            }
        }
        self.descriptor.params.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(self.descriptor)
    }
}

/// A descriptor bound to one concrete, normalized parameter set.
#[derive(Debug, Clone)]
pub struct ResolvedDataset {
    pub descriptor: Arc<DatasetDescriptor>,
    pub params: Params,
    pub fingerprint: Fingerprint,
}

impl ResolvedDataset {
    pub fn key(&self) -> EntryKey {
        EntryKey::new(self.descriptor.name.clone(), self.fingerprint.clone())
    }

    pub fn ttl(&self, default: Ttl) -> Ttl {
        self.descriptor.ttl.unwrap_or(default)
    }
}

#[derive(Debug, Default)]
pub struct DatasetRegistry {
    descriptors: RwLock<BTreeMap<DatasetName, Arc<DatasetDescriptor>>>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registering the same pipeline twice is a no-op; a different pipeline
    /// under an existing name is rejected.
    ///
    /// Descriptors are keyed by name alone because one descriptor serves
    /// every parameter value. The parameter schema (names, kinds, defaults,
    /// case folding) is part of the pipeline, so re-registering a name with
    /// a changed schema is a duplicate too.
    pub fn register(&self, descriptor: DatasetDescriptor) -> Result<Arc<DatasetDescriptor>, BidaliError> {
        let mut descriptors = self
            .descriptors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(existing) = descriptors.get(&descriptor.name) {
            if existing.same_pipeline(&descriptor) {
                return Ok(Arc::clone(existing));
            }
            return Err(BidaliError::DuplicateDescriptor(descriptor.name.to_string()));
        }
        tracing::debug!(
            dataset = %descriptor.name,
            source = %descriptor.fetcher.source_id(),
            transforms = %descriptor.transforms.identity(),
            "dataset registered"
        );
        let descriptor = Arc::new(descriptor);
        descriptors.insert(descriptor.name.clone(), Arc::clone(&descriptor));
        Ok(descriptor)
    }

    pub fn resolve(&self, name: &str, params: &Params) -> Result<ResolvedDataset, BidaliError> {
        let name = name
            .parse::<DatasetName>()
            .map_err(|_| BidaliError::UnknownDataset(name.to_string()))?;
        let descriptor = self
            .descriptors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&name)
            .cloned()
            .ok_or_else(|| BidaliError::UnknownDataset(name.to_string()))?;
        let params = descriptor.normalize_params(params)?;
        let fingerprint = descriptor.fingerprint(&params);
        Ok(ResolvedDataset {
            descriptor,
            params,
            fingerprint,
        })
    }

    pub fn descriptors(&self) -> Vec<Arc<DatasetDescriptor>> {
        self.descriptors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;
    use crate::domain::{ParamKind, ParamValue};
    use crate::fetcher::LocalFileFetcher;
    use crate::transform::DecodeText;

    fn annotations(path: &str) -> DatasetDescriptor {
        DatasetDescriptor::builder("gene_annotations", LocalFileFetcher::new(path))
            .unwrap()
            .param(ParamSpec::required("species", ParamKind::Text).case_insensitive())
            .param(ParamSpec::optional("build", ParamKind::Text, "GRCh38"))
            .param(ParamSpec::optional("release", ParamKind::Integer, 110))
            .transforms(TransformChain::new("1").then(DecodeText))
            .build()
            .unwrap()
    }

    #[test]
    fn resolve_applies_defaults_and_coercion() {
        let registry = DatasetRegistry::new();
        registry.register(annotations("/data/{species}.tsv")).unwrap();
        let resolved = registry
            .resolve(
                "gene_annotations",
                &Params::new().with("Species", "Human").with("release", "111"),
            )
            .unwrap();
        assert_eq!(resolved.params.get("species"), Some(&ParamValue::from("human")));
        assert_eq!(resolved.params.get("build"), Some(&ParamValue::from("GRCh38")));
        assert_eq!(resolved.params.get("release"), Some(&ParamValue::Integer(111)));
    }

    #[test]
    fn equivalent_requests_share_fingerprint() {
        let registry = DatasetRegistry::new();
        registry.register(annotations("/data/{species}.tsv")).unwrap();
        let a = registry
            .resolve(
                "gene_annotations",
                &Params::new().with("species", "human").with("build", "GRCh38"),
            )
            .unwrap();
        let b = registry
            .resolve(
                "gene_annotations",
                &Params::new()
                    .with("release", 110)
                    .with("build", " GRCh38 ")
                    .with("SPECIES", "HUMAN"),
            )
            .unwrap();
        assert_eq!(a.fingerprint, b.fingerprint);
    }

    #[test]
    fn unknown_dataset() {
        let registry = DatasetRegistry::new();
        let err = registry.resolve("nope", &Params::new()).unwrap_err();
        assert_matches!(err, BidaliError::UnknownDataset(_));
    }

    #[test]
    fn invalid_parameters() {
        let registry = DatasetRegistry::new();
        registry.register(annotations("/data/{species}.tsv")).unwrap();
        let err = registry
            .resolve("gene_annotations", &Params::new())
            .unwrap_err();
        assert_matches!(err, BidaliError::InvalidParameters { .. });
        let err = registry
            .resolve(
                "gene_annotations",
                &Params::new().with("species", "human").with("tissue", "liver"),
            )
            .unwrap_err();
        assert_matches!(err, BidaliError::InvalidParameters { .. });
    }

    #[test]
    fn duplicate_registration() {
        let registry = DatasetRegistry::new();
        registry.register(annotations("/data/{species}.tsv")).unwrap();
        assert!(registry.register(annotations("/data/{species}.tsv")).is_ok());
        let err = registry
            .register(annotations("/mirror/{species}.tsv"))
            .unwrap_err();
        assert_matches!(err, BidaliError::DuplicateDescriptor(_));
    }

    #[test]
    fn changed_parameter_schema_is_duplicate() {
        let registry = DatasetRegistry::new();
        registry.register(annotations("/data/{species}.tsv")).unwrap();
        let other_default = DatasetDescriptor::builder(
            "gene_annotations",
            LocalFileFetcher::new("/data/{species}.tsv"),
        )
        .unwrap()
        .param(ParamSpec::required("species", ParamKind::Text).case_insensitive())
        .param(ParamSpec::optional("build", ParamKind::Text, "GRCh37"))
        .param(ParamSpec::optional("release", ParamKind::Integer, 110))
        .transforms(TransformChain::new("1").then(DecodeText))
        .build()
        .unwrap();
        assert_matches!(
            registry.register(other_default),
            Err(BidaliError::DuplicateDescriptor(_))
        );
    }
}
