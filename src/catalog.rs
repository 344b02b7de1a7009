//! Datasets every `bidali` installation knows about.

use std::time::Duration;

use reqwest::blocking::Client;

use crate::domain::{ParamKind, ParamSpec, Ttl};
use crate::error::BidaliError;
use crate::fetcher::{FetchOutcome, FetchRequest, Fetcher, HttpFetcher, default_client, http_get};
use crate::geo::{GeoSeriesMatrixFetcher, ParseSeriesMatrix};
use crate::registry::{DatasetDescriptor, DatasetRegistry};
use crate::transform::{DecodeText, Gunzip, IndexColumns, ParseDelimited, ParseObo, TransformChain};

const GO_BASIC_URL: &str = "http://purl.obolibrary.org/obo/go/go-basic.obo";
const REACTOME_PATHWAYS_URL: &str = "https://reactome.org/download/current/ReactomePathways.txt";
const REACTOME_UNIPROT_URL: &str = "https://reactome.org/download/current/UniProt2Reactome.txt";
const KEGG_PATHWAYS_URL: &str = "https://rest.kegg.jp/list/pathway";
const KEGG_LINK_URL: &str = "https://rest.kegg.jp/link/pathway/{organism}";
const UCSC_TABLE_URL: &str = "https://hgdownload.soe.ucsc.edu/goldenPath/{build}/database/{track}.txt.gz";
const UCSC_GOLDEN_PATH: &str = "https://hgdownload.soe.ucsc.edu/goldenPath";

const MONTH: Duration = Duration::from_secs(30 * 24 * 60 * 60);

pub fn builtin_registry() -> Result<DatasetRegistry, BidaliError> {
    let registry = DatasetRegistry::new();
    register_builtin(&registry, &default_client()?)?;
    Ok(registry)
}

/// Registers the built-in datasets, sharing one HTTP client between them.
pub fn register_builtin(registry: &DatasetRegistry, client: &Client) -> Result<(), BidaliError> {
    let http = |template: &str| HttpFetcher::with_client(client.clone(), template);

    registry.register(
        DatasetDescriptor::builder("go", http(GO_BASIC_URL))?
            .description("Gene Ontology (go-basic) as a term graph")
            .transforms(TransformChain::new("1").then(DecodeText).then(ParseObo))
            .ttl(Ttl::After(MONTH))
            .build()?,
    )?;

    registry.register(
        DatasetDescriptor::builder("reactome_pathways", http(REACTOME_PATHWAYS_URL))?
            .description("Reactome pathway identifiers, names and species")
            .transforms(tsv_chain())
            .build()?,
    )?;

    registry.register(
        DatasetDescriptor::builder("reactome_uniprot", http(REACTOME_UNIPROT_URL))?
            .description("UniProt accession to Reactome pathways")
            .transforms(tsv_chain().then(IndexColumns::new("col1", "col2")))
            .build()?,
    )?;

    registry.register(
        DatasetDescriptor::builder("kegg_pathways", http(KEGG_PATHWAYS_URL))?
            .description("KEGG pathway identifiers and names")
            .transforms(tsv_chain())
            .build()?,
    )?;

    registry.register(
        DatasetDescriptor::builder("kegg_pathway_links", http(KEGG_LINK_URL))?
            .description("KEGG entries of an organism (or ko) to pathways")
            .param(ParamSpec::optional("organism", ParamKind::Text, "ko").case_insensitive())
            .transforms(tsv_chain().then(IndexColumns::new("col1", "col2")))
            .build()?,
    )?;

    registry.register(
        DatasetDescriptor::builder("gene_annotations", http(UCSC_TABLE_URL))?
            .description("UCSC gene annotation table for a genome build")
            .param(ParamSpec::optional("build", ParamKind::Text, "hg38").case_insensitive())
            .param(ParamSpec::optional("track", ParamKind::Text, "refGene"))
            .transforms(
                TransformChain::new("1")
                    .then(Gunzip)
                    .then(DecodeText)
                    .then(ParseDelimited::tsv().headerless()),
            )
            .ttl(Ttl::After(MONTH))
            .build()?,
    )?;

    registry.register(
        DatasetDescriptor::builder(
            "liftover_chain",
            LiftoverChainFetcher::new(client.clone(), UCSC_GOLDEN_PATH),
        )?
        .description("UCSC liftOver chain between two genome builds")
        .param(ParamSpec::required("from", ParamKind::Text).case_insensitive())
        .param(ParamSpec::required("to", ParamKind::Text).case_insensitive())
        .transforms(TransformChain::new("1").then(Gunzip).then(DecodeText))
        .ttl(Ttl::Infinite)
        .build()?,
    )?;

    registry.register(
        DatasetDescriptor::builder(
            "geo_series_matrix",
            GeoSeriesMatrixFetcher::with_client(client.clone(), crate::geo::GEO_SERIES_BASE),
        )?
        .description("GEO series matrix expression table")
        .param(ParamSpec::required("accession", ParamKind::Text))
        .transforms(
            TransformChain::new("1")
                .then(Gunzip)
                .then(DecodeText)
                .then(ParseSeriesMatrix),
        )
        .build()?,
    )?;

    Ok(())
}

fn tsv_chain() -> TransformChain {
    TransformChain::new("1")
        .then(DecodeText)
        .then(ParseDelimited::tsv().headerless())
}

/// UCSC names chain files `<from>To<To>.over.chain.gz`, with the target build
/// capitalized, which a plain URL template cannot express.
#[derive(Clone)]
pub struct LiftoverChainFetcher {
    client: Client,
    base_url: String,
}

impl LiftoverChainFetcher {
    pub fn new(client: Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn chain_url(&self, from: &str, to: &str) -> String {
        format!(
            "{}/{from}/liftOver/{from}To{}.over.chain.gz",
            self.base_url,
            capitalize(to)
        )
    }
}

impl Fetcher for LiftoverChainFetcher {
    fn source_id(&self) -> String {
        format!("{}/{{from}}/liftOver", self.base_url)
    }

    fn fetch(&self, request: &FetchRequest) -> FetchOutcome {
        let (Some(from), Some(to)) = (request.params.get("from"), request.params.get("to")) else {
            return FetchOutcome::FatalFailure("liftover needs `from` and `to` builds".to_string());
        };
        let (from, to) = (from.as_text(), to.as_text());
        let valid = |build: &str| !build.is_empty() && build.chars().all(|c| c.is_ascii_alphanumeric());
        if !valid(&from) || !valid(&to) {
            return FetchOutcome::FatalFailure(format!("invalid genome build pair {from} -> {to}"));
        }
        if from == to {
            return FetchOutcome::FatalFailure(format!("nothing to lift: {from} -> {to}"));
        }
        http_get(&self.client, &self.chain_url(&from, &to), request.timeout)
    }
}

fn capitalize(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
        None => String::new(),
    }
}
