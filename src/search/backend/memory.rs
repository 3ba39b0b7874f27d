//! In-memory search backend over JSON documents.
//!
//! Implements the subset of Elasticsearch semantics used by the engine:
//! predicate evaluation with named query attribution, sorting with missing
//! values and scripted sorts, pagination, and the per-gene terms aggregation
//! with top hits.  Requests are logged so callers can inspect what was sent.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde_json::{Map, Value};

use super::dsl::{Missing, Query, SortOrder, SortScript, SortSpec, MISSING_CONSTRAINT_RANK};
use super::{
    BackendError, GeneBucket, Hit, IndexMetadata, SearchBackend, SearchRequest, SearchResponse,
    GENE_IDS_FIELD,
};

/// One stored document.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Document {
    #[serde(rename = "_index")]
    pub index: String,
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_source")]
    pub source: Map<String, Value>,
}

/// Backend holding all documents in memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    metadata: BTreeMap<String, IndexMetadata>,
    documents: Vec<Document>,
    /// All requests received so far.
    request_log: Mutex<Vec<SearchRequest>>,
    /// Running times of simulated long-running search tasks.
    running_tasks: Mutex<Vec<Duration>>,
    /// Whether every search times out.
    simulate_timeout: bool,
}

impl MemoryBackend {
    pub fn new(metadata: BTreeMap<String, IndexMetadata>, documents: Vec<Document>) -> Self {
        Self {
            metadata,
            documents,
            ..Default::default()
        }
    }

    /// Load documents from a JSON lines file and index metadata from a JSON file.
    pub fn from_paths(documents_path: &str, mappings_path: &str) -> Result<Self, anyhow::Error> {
        let before_loading = Instant::now();
        let metadata: BTreeMap<String, IndexMetadata> = serde_json::from_str(
            &std::fs::read_to_string(mappings_path)
                .map_err(|e| anyhow::anyhow!("could not read {}: {}", mappings_path, e))?,
        )
        .map_err(|e| anyhow::anyhow!("could not parse mappings {}: {}", mappings_path, e))?;

        let mut documents = Vec::new();
        let contents = std::fs::read_to_string(documents_path)
            .map_err(|e| anyhow::anyhow!("could not read {}: {}", documents_path, e))?;
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let document: Document = serde_json::from_str(line).map_err(|e| {
                anyhow::anyhow!("invalid document in {}:{}: {}", documents_path, lineno + 1, e)
            })?;
            documents.push(document);
        }
        tracing::info!(
            "loaded {} documents of {} indices in {:?}",
            documents.len(),
            metadata.len(),
            before_loading.elapsed()
        );

        Ok(Self::new(metadata, documents))
    }

    /// Let every search time out while the given tasks are running.
    pub fn with_timeout(mut self, running_tasks: Vec<Duration>) -> Self {
        self.simulate_timeout = true;
        self.running_tasks = Mutex::new(running_tasks);
        self
    }

    /// Copy of all requests received so far.
    pub fn requests(&self) -> Vec<SearchRequest> {
        self.request_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of simulated tasks still running.
    pub fn running_task_count(&self) -> usize {
        self.running_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn search(&self, request: &SearchRequest) -> SearchResponse {
        let before_search = Instant::now();
        let indices: BTreeSet<&str> = request.indices().into_iter().collect();

        let mut matches: Vec<(Vec<f64>, &Document)> = self
            .documents
            .iter()
            .filter(|doc| indices.contains(doc.index.as_str()))
            .filter(|doc| evaluate(&request.query, &doc.source))
            .map(|doc| (sort_keys(&request.sort, &doc.source), doc))
            .collect();
        matches.sort_by(|(lhs_keys, lhs), (rhs_keys, rhs)| {
            cmp_keys(lhs_keys, rhs_keys).then_with(|| lhs.id.cmp(&rhs.id))
        });

        let hits = matches
            .iter()
            .skip(request.from)
            .take(request.size)
            .map(|(_, doc)| to_hit(request, doc))
            .collect();

        let gene_buckets = request.gene_aggregation.map(|agg| {
            let mut buckets: BTreeMap<&str, Vec<&Document>> = BTreeMap::new();
            for (_, doc) in &matches {
                let gene_ids: BTreeSet<&str> = values(&doc.source, GENE_IDS_FIELD)
                    .filter_map(Value::as_str)
                    .collect();
                for gene_id in gene_ids {
                    buckets.entry(gene_id).or_default().push(doc);
                }
            }
            let mut buckets: Vec<(&str, Vec<&Document>)> = buckets
                .into_iter()
                .filter(|(_, docs)| docs.len() >= agg.min_doc_count)
                .collect();
            buckets.sort_by(|(lhs_key, lhs), (rhs_key, rhs)| {
                rhs.len().cmp(&lhs.len()).then_with(|| lhs_key.cmp(rhs_key))
            });
            buckets
                .into_iter()
                .take(agg.size)
                .map(|(key, docs)| GeneBucket {
                    key: key.to_owned(),
                    doc_count: docs.len(),
                    hits: docs
                        .iter()
                        .take(agg.top_hits)
                        .map(|doc| to_hit(request, doc))
                        .collect(),
                })
                .collect()
        });

        SearchResponse {
            took_ms: before_search.elapsed().as_millis() as u64,
            total: matches.len(),
            hits,
            gene_buckets,
        }
    }
}

impl SearchBackend for MemoryBackend {
    fn index_metadata(
        &self,
        indices: &[String],
    ) -> Result<BTreeMap<String, IndexMetadata>, BackendError> {
        Ok(indices
            .iter()
            .flat_map(|index| index.split(','))
            .filter_map(|index| {
                self.metadata
                    .get(index)
                    .map(|metadata| (index.to_owned(), metadata.clone()))
            })
            .collect())
    }

    fn msearch(&self, requests: &[SearchRequest]) -> Result<Vec<SearchResponse>, BackendError> {
        self.request_log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(requests.iter().cloned());
        if self.simulate_timeout {
            return Err(BackendError::Timeout);
        }

        Ok(requests
            .par_iter()
            .map(|request| self.search(request))
            .collect())
    }

    fn cancel_long_running_tasks(&self, threshold: Duration) -> Result<usize, BackendError> {
        let mut tasks = self
            .running_tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = tasks.len();
        tasks.retain(|running_time| *running_time <= threshold);
        Ok(before - tasks.len())
    }
}

/// Values of a field; arrays yield their elements, missing and null fields nothing.
fn values<'a>(doc: &'a Map<String, Value>, field: &str) -> Box<dyn Iterator<Item = &'a Value> + 'a> {
    match doc.get(field) {
        None | Some(Value::Null) => Box::new(std::iter::empty()),
        Some(Value::Array(values)) => Box::new(values.iter().filter(|v| !v.is_null())),
        Some(value) => Box::new(std::iter::once(value)),
    }
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(lhs), Some(rhs)) => lhs == rhs,
        _ => lhs == rhs,
    }
}

/// Whether `query` matches `doc`.
pub fn evaluate(query: &Query, doc: &Map<String, Value>) -> bool {
    match query {
        Query::MatchAll => true,
        Query::Term { field, value } => values(doc, field).any(|v| values_equal(v, value)),
        Query::Terms { field, values: terms } => {
            values(doc, field).any(|v| terms.iter().any(|term| values_equal(v, term)))
        }
        Query::Range { field, gte, lte } => {
            let gte = gte.as_ref().and_then(Value::as_f64);
            let lte = lte.as_ref().and_then(Value::as_f64);
            values(doc, field).filter_map(Value::as_f64).any(|v| {
                gte.map(|gte| v >= gte).unwrap_or(true) && lte.map(|lte| v <= lte).unwrap_or(true)
            })
        }
        Query::Exists { field } => values(doc, field).next().is_some(),
        Query::Bool(bool_query) => {
            bool_query.must.iter().all(|q| evaluate(q, doc))
                && !bool_query.must_not.iter().any(|q| evaluate(q, doc))
                && (bool_query.should.is_empty() || bool_query.should.iter().any(|q| evaluate(q, doc)))
        }
    }
}

/// Names of all named sub-queries of `query` matching `doc`, in tree order.
pub fn evaluate_named(query: &Query, doc: &Map<String, Value>) -> Vec<String> {
    fn collect(query: &Query, doc: &Map<String, Value>, result: &mut Vec<String>) {
        if let Query::Bool(bool_query) = query {
            if let Some(name) = &bool_query.name {
                if evaluate(query, doc) && !result.contains(name) {
                    result.push(name.clone());
                }
            }
            for q in bool_query
                .must
                .iter()
                .chain(bool_query.should.iter())
                .chain(bool_query.must_not.iter())
            {
                collect(q, doc, result);
            }
        }
    }

    let mut result = Vec::new();
    collect(query, doc, &mut result);
    result
}

/// Value of a scripted sort.
fn script_value(script: &SortScript, doc: &Map<String, Value>) -> f64 {
    let first_str = |field: &str| values(doc, field).find_map(Value::as_str);
    match script {
        SortScript::ClinvarPathogenicity => match first_str("clinvar_clinical_significance") {
            None => 2.0,
            Some(clinsig) if clinsig.contains("Pathogenic") || clinsig.contains("Likely_pathogenic") => {
                0.0
            }
            Some(clinsig) if clinsig.contains("Benign") || clinsig.contains("Likely_benign") => 3.0,
            Some(_) => 1.0,
        },
        SortScript::HgmdDiseaseCausing => match first_str("hgmd_class") {
            Some("DM") => 0.0,
            _ => 1.0,
        },
        SortScript::InGeneSet { gene_ids } => match first_str("mainTranscript_gene_id") {
            Some(gene_id) if gene_ids.iter().any(|g| g == gene_id) => 0.0,
            _ => 1.0,
        },
        SortScript::ConstraintRank { ranks } => first_str("mainTranscript_gene_id")
            .and_then(|gene_id| ranks.get(gene_id))
            .copied()
            .unwrap_or(MISSING_CONSTRAINT_RANK) as f64,
    }
}

/// Raw sort value of one criterion, infinite for missing values.
fn sort_value(spec: &SortSpec, doc: &Map<String, Value>) -> f64 {
    match spec {
        SortSpec::Field {
            field,
            order,
            missing,
        } => match values(doc, field).find_map(Value::as_f64) {
            Some(value) => value,
            None => {
                let missing = missing.unwrap_or(Missing::Last);
                match (order, missing) {
                    (SortOrder::Asc, Missing::Last) | (SortOrder::Desc, Missing::First) => {
                        f64::INFINITY
                    }
                    (SortOrder::Asc, Missing::First) | (SortOrder::Desc, Missing::Last) => {
                        f64::NEG_INFINITY
                    }
                }
            }
        },
        SortSpec::Script { script, .. } => script_value(script, doc),
    }
}

/// Keys ordering documents ascending, descending criteria negated.
fn sort_keys(sort: &[SortSpec], doc: &Map<String, Value>) -> Vec<f64> {
    sort.iter()
        .map(|spec| {
            let value = sort_value(spec, doc);
            match spec.order() {
                SortOrder::Asc => value,
                SortOrder::Desc => -value,
            }
        })
        .collect()
}

fn cmp_keys(lhs: &[f64], rhs: &[f64]) -> Ordering {
    lhs.iter()
        .zip(rhs.iter())
        .map(|(l, r)| l.total_cmp(r))
        .find(|ord| *ord != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

/// Render a raw sort value the way Elasticsearch reports it.
fn render_sort_value(value: f64) -> Value {
    if value == f64::INFINITY {
        Value::from("Infinity")
    } else if value == f64::NEG_INFINITY {
        Value::from("-Infinity")
    } else {
        Value::from(value)
    }
}

fn to_hit(request: &SearchRequest, doc: &Document) -> Hit {
    let source = match &request.source {
        Some(fields) => fields
            .iter()
            .filter_map(|field| {
                doc.source
                    .get(field)
                    .map(|value| (field.clone(), value.clone()))
            })
            .collect(),
        None => doc.source.clone(),
    };
    let matched_queries = evaluate_named(&request.query, &doc.source);

    Hit {
        index: doc.index.clone(),
        id: doc.id.clone(),
        source,
        sort: request
            .sort
            .iter()
            .map(|spec| render_sort_value(sort_value(spec, &doc.source)))
            .collect(),
        matched_queries: (!matched_queries.is_empty()).then_some(matched_queries),
    }
}
