//! Search backend abstraction.
//!
//! The engine talks to the backend in terms of `SearchRequest` batches
//! (multi-search) and receives one `SearchResponse` per request, in order.

pub mod dsl;
pub mod es;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use serde_json::{json, Value};

use crate::common::GenomeRelease;
use crate::err::SearchError;

use self::dsl::{Query, SortSpec};

use super::conf::{self, BackendKind};

/// Field holding the gene IDs of a variant, used for compound heterozygous bucketing.
pub const GENE_IDS_FIELD: &str = "geneIds";
/// Name of the gene aggregation.
pub const GENES_AGGREGATION: &str = "genes";
/// Name of the top hits sub aggregation.
pub const VARS_BY_GENE_AGGREGATION: &str = "vars_by_gene";

/// Error type for backend operations.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    /// Connection or read timeout.
    #[error("search backend timed out")]
    Timeout,
    /// Inaccessible index or otherwise unusable setup.
    #[error("{0}")]
    Configuration(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<BackendError> for SearchError {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Timeout => SearchError::BackendTimeout { canceled: 0 },
            BackendError::Configuration(msg) => SearchError::Configuration(msg),
            BackendError::Other(e) => SearchError::Backend(e),
        }
    }
}

/// Metadata of one backend index, derived from its mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct IndexMetadata {
    /// Genome build of the index.
    pub genome_version: Option<GenomeRelease>,
    /// Names of the mapped fields.
    pub fields: BTreeSet<String>,
}

/// Per-gene terms aggregation with nested top hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneAggregation {
    pub min_doc_count: usize,
    /// Maximal number of gene buckets.
    pub size: usize,
    /// Number of hits per bucket.
    pub top_hits: usize,
}

/// One search of a multi-search batch.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    /// Index name, or several comma-separated names.
    pub index: String,
    pub query: Query,
    pub sort: Vec<SortSpec>,
    pub from: usize,
    pub size: usize,
    /// Fields to return, all if `None`.
    pub source: Option<Vec<String>>,
    pub gene_aggregation: Option<GeneAggregation>,
}

impl SearchRequest {
    /// Individual index names.
    pub fn indices(&self) -> Vec<&str> {
        self.index.split(',').filter(|s| !s.is_empty()).collect()
    }

    /// Render the request body in Elasticsearch JSON.
    pub fn to_es_body(&self) -> Value {
        let sort: Vec<Value> = self.sort.iter().map(SortSpec::to_es_json).collect();
        let mut body = json!({
            "query": {"bool": {"filter": [self.query.to_es_json()]}},
            "sort": sort,
            "from": self.from,
            "size": self.size,
        });
        if let Some(source) = &self.source {
            body["_source"] = json!(source);
        }
        if let Some(agg) = &self.gene_aggregation {
            let mut top_hits = json!({"size": agg.top_hits, "sort": sort});
            if let Some(source) = &self.source {
                top_hits["_source"] = json!(source);
            }
            body["aggs"] = json!({
                GENES_AGGREGATION: {
                    "terms": {
                        "field": GENE_IDS_FIELD,
                        "min_doc_count": agg.min_doc_count,
                        "size": agg.size,
                    },
                    "aggs": {VARS_BY_GENE_AGGREGATION: {"top_hits": top_hits}},
                }
            });
        }
        body
    }
}

/// One search hit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Hit {
    pub index: String,
    pub id: String,
    pub source: serde_json::Map<String, Value>,
    /// Raw backend sort values, one per sort criterion.
    pub sort: Vec<Value>,
    /// Names of matching named queries, `None` if there were none.
    pub matched_queries: Option<Vec<String>>,
}

/// One bucket of the gene aggregation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneBucket {
    pub key: String,
    pub doc_count: usize,
    pub hits: Vec<Hit>,
}

/// Response to one `SearchRequest`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchResponse {
    pub took_ms: u64,
    /// Total number of matching documents.
    pub total: usize,
    pub hits: Vec<Hit>,
    /// Gene buckets if the request had a gene aggregation.
    pub gene_buckets: Option<Vec<GeneBucket>>,
}

/// Interface to a search backend.
pub trait SearchBackend: Send + Sync {
    /// Fetch metadata of the given indices; missing indices are absent from the result.
    fn index_metadata(
        &self,
        indices: &[String],
    ) -> Result<BTreeMap<String, IndexMetadata>, BackendError>;

    /// Execute all requests in one batch.
    fn msearch(&self, requests: &[SearchRequest]) -> Result<Vec<SearchResponse>, BackendError>;

    /// Cancel search tasks running longer than `threshold`, returns their number.
    fn cancel_long_running_tasks(&self, threshold: Duration) -> Result<usize, BackendError>;
}

/// Construct the configured backend.
pub fn from_conf(conf: &conf::BackendConf) -> Result<Box<dyn SearchBackend>, anyhow::Error> {
    Ok(match conf.kind {
        BackendKind::Elasticsearch => Box::new(es::ElasticsearchBackend::new(
            &conf.url,
            Duration::from_secs(conf.timeout_secs),
        )?),
        BackendKind::Memory => {
            let documents_path = conf
                .documents_path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("memory backend requires documents_path"))?;
            let mappings_path = conf
                .mappings_path
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("memory backend requires mappings_path"))?;
            Box::new(memory::MemoryBackend::from_paths(
                &conf::expand_path(documents_path),
                &conf::expand_path(mappings_path),
            )?)
        }
    })
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::dsl::{Query, SortSpec};
    use super::*;

    #[test]
    fn request_indices() {
        let request = SearchRequest {
            index: "a,b".into(),
            query: Query::MatchAll,
            sort: vec![],
            from: 0,
            size: 10,
            source: None,
            gene_aggregation: None,
        };
        assert_eq!(request.indices(), vec!["a", "b"]);
    }

    #[test]
    fn request_body_with_aggregation() {
        let request = SearchRequest {
            index: "a".into(),
            query: Query::exists("filters"),
            sort: vec![SortSpec::field("xpos")],
            from: 0,
            size: 1,
            source: Some(vec!["xpos".into()]),
            gene_aggregation: Some(GeneAggregation {
                min_doc_count: 2,
                size: 1001,
                top_hits: 100,
            }),
        };
        assert_eq!(
            request.to_es_body(),
            json!({
                "query": {"bool": {"filter": [{"exists": {"field": "filters"}}]}},
                "sort": [{"xpos": {"order": "asc"}}],
                "from": 0,
                "size": 1,
                "_source": ["xpos"],
                "aggs": {"genes": {
                    "terms": {"field": "geneIds", "min_doc_count": 2, "size": 1001},
                    "aggs": {"vars_by_gene": {"top_hits": {
                        "size": 100,
                        "sort": [{"xpos": {"order": "asc"}}],
                        "_source": ["xpos"]
                    }}}
                }}
            })
        );
    }

    #[test]
    fn backend_error_conversion() {
        assert!(matches!(
            SearchError::from(BackendError::Timeout),
            SearchError::BackendTimeout { canceled: 0 }
        ));
        assert!(matches!(
            SearchError::from(BackendError::Configuration("x".into())),
            SearchError::Configuration(_)
        ));
    }
}
