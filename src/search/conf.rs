//! Code for the search configuration file.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Enum for the supported search backends.
#[derive(
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Debug,
    Default,
    strum::EnumString,
    strum::Display,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum BackendKind {
    /// Elasticsearch cluster reachable via HTTP.
    #[default]
    Elasticsearch,
    /// In-process index loaded from a JSON lines file.
    Memory,
}

/// Enum for the supported session cache stores.
#[derive(
    Serialize,
    Deserialize,
    PartialEq,
    Eq,
    Clone,
    Copy,
    Debug,
    Default,
    strum::EnumString,
    strum::Display,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CacheKind {
    /// Cache lives for the lifetime of the process only.
    #[default]
    Memory,
    /// Cache persisted in a RocksDB directory.
    Rocksdb,
}

/// Search backend settings.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(default)]
pub struct BackendConf {
    pub kind: BackendKind,
    /// Base URL of the Elasticsearch cluster.
    pub url: String,
    /// Connection/read timeout in seconds.
    pub timeout_secs: u64,
    /// Path to JSON lines documents for the memory backend.
    pub documents_path: Option<String>,
    /// Path to JSON file with index mappings for the memory backend.
    pub mappings_path: Option<String>,
}

impl Default for BackendConf {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            url: String::from("http://localhost:9200"),
            timeout_secs: 30,
            documents_path: None,
            mappings_path: None,
        }
    }
}

/// Session cache settings.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
#[serde(default)]
pub struct CacheConf {
    pub kind: CacheKind,
    /// Directory of the RocksDB cache.
    pub path: Option<String>,
}

/// Paths to reference and sample tables.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
#[serde(default)]
pub struct ReferenceConf {
    /// TSV file with loaded samples.
    pub samples_path: Option<String>,
    /// TSV file with gene IDs and symbols.
    pub genes_path: Option<String>,
    /// TSV file with gene IDs that have disease phenotypes.
    pub disease_genes_path: Option<String>,
    /// TSV file with per-gene constraint metrics.
    pub constraint_path: Option<String>,
    /// UCSC chain file from GRCh38 to GRCh37, optionally gzip compressed.
    pub liftover_path: Option<String>,
}

/// Hard limits of the search engine.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
#[serde(default)]
pub struct LimitsConf {
    /// Maximal number of compound heterozygous gene buckets.
    pub max_compound_het_genes: usize,
    /// Number of variants loaded per compound heterozygous gene bucket.
    pub compound_het_top_hits: usize,
    /// Backend tasks running longer than this are canceled after a timeout.
    pub long_running_task_secs: u64,
    /// Page size used with "load all" when the total is not yet known.
    pub load_all_page_size: usize,
}

impl Default for LimitsConf {
    fn default() -> Self {
        Self {
            max_compound_het_genes: 1000,
            compound_het_top_hits: 100,
            long_running_task_secs: 100,
            load_all_page_size: 10_000,
        }
    }
}

impl LimitsConf {
    pub fn long_running_task_threshold(&self) -> Duration {
        Duration::from_secs(self.long_running_task_secs)
    }
}

/// Top-level search configuration, read from TOML.
#[derive(Serialize, Deserialize, PartialEq, Eq, Clone, Debug, Default)]
#[serde(default)]
pub struct SearchConf {
    pub backend: BackendConf,
    pub cache: CacheConf,
    pub reference: ReferenceConf,
    pub limits: LimitsConf,
}

impl SearchConf {
    /// Load configuration from the TOML file at `path`.
    pub fn from_path(path: &str) -> Result<Self, anyhow::Error> {
        let path = shellexpand::tilde(path);
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| anyhow::anyhow!("could not read configuration {}: {}", &path, e))?;
        toml::from_str(&text)
            .map_err(|e| anyhow::anyhow!("could not parse configuration {}: {}", &path, e))
    }
}

/// Expand `~` in a configured path.
pub fn expand_path(path: &str) -> String {
    shellexpand::tilde(path).into_owned()
}
