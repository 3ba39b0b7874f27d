//! Elasticsearch backend via the HTTP API.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use serde_json::{json, Map, Value};

use crate::common::GenomeRelease;

use super::{
    BackendError, GeneBucket, Hit, IndexMetadata, SearchBackend, SearchRequest, SearchResponse,
    GENES_AGGREGATION,
};

/// Legacy document type of variant indices (Elasticsearch 6 mappings).
const VARIANT_DOC_TYPE: &str = "variant";

/// Backend talking to an Elasticsearch server.
#[derive(Debug, Clone)]
pub struct ElasticsearchBackend {
    client: reqwest::blocking::Client,
    base_url: String,
}

#[derive(Debug, serde::Deserialize)]
struct RawMsearchResponse {
    responses: Vec<RawResponse>,
}

#[derive(Debug, serde::Deserialize)]
struct RawResponse {
    #[serde(default)]
    took: u64,
    hits: Option<RawHits>,
    aggregations: Option<RawAggregations>,
    error: Option<Value>,
}

#[derive(Debug, serde::Deserialize)]
#[serde(untagged)]
enum RawTotal {
    Count(usize),
    Object { value: usize },
}

#[derive(Debug, serde::Deserialize)]
struct RawHits {
    total: Option<RawTotal>,
    #[serde(default)]
    hits: Vec<RawHit>,
}

#[derive(Debug, serde::Deserialize)]
struct RawHit {
    #[serde(rename = "_index")]
    index: String,
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_source", default)]
    source: Map<String, Value>,
    #[serde(default)]
    sort: Vec<Value>,
    matched_queries: Option<Vec<String>>,
}

impl From<RawHit> for Hit {
    fn from(raw: RawHit) -> Self {
        Hit {
            index: raw.index,
            id: raw.id,
            source: raw.source,
            sort: raw.sort,
            matched_queries: raw.matched_queries.filter(|names| !names.is_empty()),
        }
    }
}

#[derive(Debug, serde::Deserialize)]
struct RawAggregations {
    genes: Option<RawGenes>,
}

#[derive(Debug, serde::Deserialize)]
struct RawGenes {
    buckets: Vec<RawBucket>,
}

#[derive(Debug, serde::Deserialize)]
struct RawBucket {
    key: String,
    doc_count: usize,
    vars_by_gene: RawTopHits,
}

#[derive(Debug, serde::Deserialize)]
struct RawTopHits {
    hits: RawHits,
}

/// Render requests as `_msearch` NDJSON body.
pub fn msearch_body(requests: &[SearchRequest]) -> Result<String, serde_json::Error> {
    let mut body = String::new();
    for request in requests {
        body.push_str(&serde_json::to_string(&json!({"index": request.index}))?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&request.to_es_body())?);
        body.push('\n');
    }
    Ok(body)
}

/// Parse the `_msearch` response body.
pub fn parse_msearch_response(body: Value) -> Result<Vec<SearchResponse>, BackendError> {
    let raw: RawMsearchResponse = serde_json::from_value(body)
        .map_err(|e| anyhow::anyhow!("invalid msearch response: {}", e))?;

    raw.responses
        .into_iter()
        .map(|response| {
            if let Some(error) = response.error {
                return Err(BackendError::Other(anyhow::anyhow!(
                    "search failed: {}",
                    error
                )));
            }
            let (total, hits) = match response.hits {
                Some(RawHits { total, hits }) => (
                    match total {
                        Some(RawTotal::Count(value)) | Some(RawTotal::Object { value }) => value,
                        None => 0,
                    },
                    hits.into_iter().map(Hit::from).collect(),
                ),
                None => (0, Vec::new()),
            };
            let gene_buckets = response
                .aggregations
                .and_then(|aggs| aggs.genes)
                .map(|genes| {
                    genes
                        .buckets
                        .into_iter()
                        .map(|bucket| GeneBucket {
                            key: bucket.key,
                            doc_count: bucket.doc_count,
                            hits: bucket
                                .vars_by_gene
                                .hits
                                .hits
                                .into_iter()
                                .map(Hit::from)
                                .collect(),
                        })
                        .collect()
                });
            Ok(SearchResponse {
                took_ms: response.took,
                total,
                hits,
                gene_buckets,
            })
        })
        .collect()
}

/// Parse the `_mapping` response, supporting typed and untyped mappings.
pub fn parse_mappings(body: &Value) -> BTreeMap<String, IndexMetadata> {
    let Some(indices) = body.as_object() else {
        return BTreeMap::new();
    };
    indices
        .iter()
        .map(|(index, mapping)| {
            let mappings = &mapping["mappings"];
            let mapping = if mappings.get("properties").is_some() {
                mappings
            } else {
                &mappings[VARIANT_DOC_TYPE]
            };
            let genome_version = mapping["_meta"]["genomeVersion"]
                .as_str()
                .and_then(|s| GenomeRelease::from_str(s).ok());
            let fields = mapping["properties"]
                .as_object()
                .map(|properties| properties.keys().cloned().collect())
                .unwrap_or_default();
            (
                index.clone(),
                IndexMetadata {
                    genome_version,
                    fields,
                },
            )
        })
        .collect()
}

fn map_reqwest_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Other(anyhow::anyhow!("request to search backend failed: {}", e))
    }
}

impl ElasticsearchBackend {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, anyhow::Error> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("failed to create HTTP client: {}", e))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn get_json(&self, url: &str) -> Result<Value, BackendError> {
        let response = self.client.get(url).send().map_err(map_reqwest_error)?;
        let status = response.status();
        let body: Value = response.json().map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(BackendError::Other(anyhow::anyhow!(
                "GET {} failed with {}: {}",
                url,
                status,
                body
            )));
        }
        Ok(body)
    }
}

impl SearchBackend for ElasticsearchBackend {
    fn index_metadata(
        &self,
        indices: &[String],
    ) -> Result<BTreeMap<String, IndexMetadata>, BackendError> {
        let joined = indices.join(",");
        let url = format!(
            "{}/{}/_mapping?ignore_unavailable=true",
            self.base_url, &joined
        );
        let body = self.get_json(&url).map_err(|e| match e {
            BackendError::Timeout => BackendError::Timeout,
            e => BackendError::Configuration(format!("Error accessing index \"{}\": {}", joined, e)),
        })?;
        Ok(parse_mappings(&body))
    }

    fn msearch(&self, requests: &[SearchRequest]) -> Result<Vec<SearchResponse>, BackendError> {
        let body = msearch_body(requests).map_err(|e| BackendError::Other(e.into()))?;
        tracing::debug!("msearch request:\n{}", &body);

        let response = self
            .client
            .post(format!("{}/_msearch", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/x-ndjson")
            .body(body)
            .send()
            .map_err(map_reqwest_error)?;
        let status = response.status();
        let body: Value = response.json().map_err(map_reqwest_error)?;
        if !status.is_success() {
            return Err(BackendError::Other(anyhow::anyhow!(
                "msearch failed with {}: {}",
                status,
                body
            )));
        }

        let responses = parse_msearch_response(body)?;
        for response in &responses {
            tracing::info!(
                "Total hits: {} ({} seconds)",
                response.total,
                response.took_ms as f64 / 1000.0
            );
        }
        Ok(responses)
    }

    fn cancel_long_running_tasks(&self, threshold: Duration) -> Result<usize, BackendError> {
        let tasks = self.get_json(&format!(
            "{}/_tasks?actions=*search&group_by=parents",
            self.base_url
        ))?;
        let mut canceled = 0;
        if let Some(tasks) = tasks["tasks"].as_object() {
            for (parent_id, task) in tasks {
                let running_time =
                    Duration::from_nanos(task["running_time_in_nanos"].as_u64().unwrap_or_default());
                if running_time > threshold {
                    self.client
                        .post(format!(
                            "{}/_tasks/_cancel?parent_task_id={}",
                            self.base_url, parent_id
                        ))
                        .send()
                        .map_err(map_reqwest_error)?;
                    canceled += 1;
                }
            }
        }
        Ok(canceled)
    }
}
