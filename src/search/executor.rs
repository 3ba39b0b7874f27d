//! Execution of compiled searches with pagination across requests.

use std::collections::HashMap;
use std::sync::Arc;

use itertools::Itertools;
use thousands::Separable;

use crate::common::get_chrom_pos;
use crate::err::SearchError;

use super::backend::{
    self,
    dsl::{Query, SortSpec},
    BackendError, GeneAggregation, SearchBackend, SearchRequest, SearchResponse,
};
use super::cache::{
    cache_key, get_compound_het_page, CacheStore, LoadedCount, MemoryCacheStore,
    PaginationCache, RocksDbCacheStore,
};
use super::comphet::{self, CompoundHetGroups};
use super::conf::{expand_path, CacheKind, LimitsConf, SearchConf};
use super::interpreter::{self, QueryPlan};
use super::liftover::LazyLiftover;
use super::output::{query_field_names, HitParser};
use super::reference::ReferenceData;
use super::samples::{SampleIndexCatalog, SampleStore, SampleTable};
use super::schema::data::{cmp_sort_keys, Variant, VariantGroup};
use super::schema::query::SearchFilter;
use super::sorting::{parse_sort_key, resolve_sort, SortParams};

/// Field holding the variant ID.
const VARIANT_ID_FIELD: &str = "variantId";

/// A saved search: families plus filter.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchModel {
    /// Identity of the search, derived from families and filter if missing.
    pub search_guid: Option<String>,
    pub family_guids: Vec<String>,
    pub filter: SearchFilter,
}

impl SearchModel {
    /// Identity of the search, the key of its pagination state.
    pub fn search_guid(&self) -> String {
        if let Some(guid) = &self.search_guid {
            return guid.clone();
        }
        let family_guids = self.family_guids.iter().sorted().collect_vec();
        let identity = serde_json::json!({
            "families": family_guids,
            "filter": &self.filter,
        });
        uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, identity.to_string().as_bytes()).to_string()
    }
}

/// One page of results.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantPage {
    pub variants: Vec<Variant>,
    /// Total number of results as known so far.
    pub total_results: usize,
}

/// How a page request is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum SearchStrategy {
    /// One index, one search: paginate by offset.
    SingleIndexDirect,
    /// No per-family predicates: one search over all indices, de-duplicated.
    SingleIndexDedupAll,
    /// Searches per index in one batch, merged client side.
    MultiIndexFanout,
}

/// Choose the strategy for a page request.
pub fn choose_strategy(
    catalog: &SampleIndexCatalog,
    plan: &QueryPlan,
    has_grouped_results: bool,
) -> SearchStrategy {
    let indices = catalog.indices();
    let single_index_searches = indices
        .first()
        .and_then(|index| plan.index_searches.get(*index))
        .map(Vec::len)
        .unwrap_or_default();
    if indices.len() == 1 && single_index_searches <= 1 && !has_grouped_results {
        SearchStrategy::SingleIndexDirect
    } else if plan.index_searches.is_empty() {
        SearchStrategy::SingleIndexDedupAll
    } else {
        SearchStrategy::MultiIndexFanout
    }
}

/// Merge records with the same variant ID, keeping the first occurrence.
///
/// Records in `returned` absorb later copies of themselves.  Returns the
/// remaining records and the number of duplicates, counting a copy only if
/// it came from an index not merged before.
pub fn deduplicate(returned: &mut [Variant], variants: Vec<Variant>) -> (Vec<Variant>, usize) {
    let returned_pos: HashMap<String, usize> = returned
        .iter()
        .enumerate()
        .map(|(i, v)| (v.variant_id.clone(), i))
        .collect();

    let mut duplicates = 0;
    let mut result: Vec<Variant> = Vec::with_capacity(variants.len());
    let mut result_pos: HashMap<String, usize> = HashMap::new();
    for variant in variants {
        let existing = match returned_pos.get(&variant.variant_id) {
            Some(&i) => Some(&mut returned[i]),
            None => match result_pos.get(&variant.variant_id) {
                Some(&i) => Some(&mut result[i]),
                None => None,
            },
        };
        match existing {
            Some(existing) => {
                if existing.merge(&variant) {
                    duplicates += 1;
                }
            }
            None => {
                result_pos.insert(variant.variant_id.clone(), result.len());
                result.push(variant);
            }
        }
    }
    (result, duplicates)
}

fn sort_variants(variants: &mut [Variant]) {
    variants.sort_by(|lhs, rhs| {
        cmp_sort_keys(&lhs.sort, &rhs.sort).then_with(|| lhs.variant_id.cmp(&rhs.variant_id))
    });
}

/// Record range `start..end` of the 1-based `page`.
fn page_range(page: usize, num_results: usize) -> Result<(usize, usize), SearchError> {
    let page = page.max(1);
    let end = page.checked_mul(num_results).ok_or_else(|| {
        SearchError::InvalidFilter(format!(
            "Page {} with {} results per page is out of range",
            page, num_results
        ))
    })?;
    Ok((end - num_results, end))
}

fn window(variants: &[Variant], start: usize, end: usize) -> Vec<Variant> {
    let end = end.min(variants.len());
    variants[start.min(end)..end].to_vec()
}

/// Parsed response of one search.
#[derive(Debug)]
enum Parsed {
    Hits { variants: Vec<Variant>, total: usize },
    CompoundHets(CompoundHetGroups),
}

impl Parsed {
    fn total(&self) -> usize {
        match self {
            Parsed::Hits { total, .. } => *total,
            Parsed::CompoundHets(groups) => groups.total,
        }
    }
}

/// The search engine with its collaborators.
pub struct SearchEngine {
    backend: Arc<dyn SearchBackend>,
    samples: Box<dyn SampleStore + Send + Sync>,
    reference: ReferenceData,
    cache_store: Arc<dyn CacheStore>,
    liftover: LazyLiftover,
    limits: LimitsConf,
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("liftover", &self.liftover)
            .field("limits", &self.limits)
            .finish()
    }
}

/// State of one page request.
struct Session<'a> {
    engine: &'a SearchEngine,
    catalog: SampleIndexCatalog,
    plan: QueryPlan,
    sort: Vec<SortSpec>,
    source: Vec<String>,
}

impl SearchEngine {
    pub fn new(
        backend: Arc<dyn SearchBackend>,
        samples: Box<dyn SampleStore + Send + Sync>,
        reference: ReferenceData,
        cache_store: Arc<dyn CacheStore>,
        liftover: LazyLiftover,
        limits: LimitsConf,
    ) -> Self {
        Self {
            backend,
            samples,
            reference,
            cache_store,
            liftover,
            limits,
        }
    }

    /// Set up the engine from configuration.
    ///
    /// Missing or unreadable reference tables only disable the features
    /// depending on them.
    pub fn from_conf(conf: &SearchConf) -> Result<Self, anyhow::Error> {
        let reference_conf = &conf.reference;
        let samples_path = reference_conf
            .samples_path
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("configuration lacks reference.samples_path"))?;
        let samples = SampleTable::from_path(&expand_path(samples_path))?;
        let backend: Arc<dyn SearchBackend> = Arc::from(backend::from_conf(&conf.backend)?);

        let mut reference = ReferenceData::default();
        type Loader = fn(&mut ReferenceData, &str) -> Result<(), anyhow::Error>;
        let loaders: [(&Option<String>, Loader); 3] = [
            (&reference_conf.genes_path, ReferenceData::load_genes),
            (&reference_conf.disease_genes_path, ReferenceData::load_disease_genes),
            (&reference_conf.constraint_path, ReferenceData::load_constraint),
        ];
        for (path, load) in loaders {
            if let Some(path) = path {
                if let Err(e) = load(&mut reference, &expand_path(path)) {
                    tracing::warn!("Unable to load reference table {}: {}", path, e);
                }
            }
        }

        let cache_store: Arc<dyn CacheStore> = match (conf.cache.kind, &conf.cache.path) {
            (CacheKind::Rocksdb, Some(path)) => {
                Arc::new(RocksDbCacheStore::open(&expand_path(path))?)
            }
            (CacheKind::Rocksdb, None) => anyhow::bail!("rocksdb cache requires cache.path"),
            (CacheKind::Memory, _) => Arc::new(MemoryCacheStore::default()),
        };

        let liftover = match &reference_conf.liftover_path {
            Some(path) => LazyLiftover::from_path(expand_path(path)),
            None => LazyLiftover::unavailable(),
        };

        Ok(Self::new(
            backend,
            Box::new(samples),
            reference,
            cache_store,
            liftover,
            conf.limits.clone(),
        ))
    }

    /// Load one page of results of `search`.
    ///
    /// With `load_all`, the page covers all results (or a configured number
    /// of results if the total is not known yet).
    pub fn get_variants(
        &self,
        search: &SearchModel,
        sort: &str,
        page: usize,
        num_results: usize,
        load_all: bool,
    ) -> Result<VariantPage, SearchError> {
        let key = cache_key(&search.search_guid(), sort);
        let mut cache = PaginationCache::load(self.cache_store.as_ref(), &key);

        let num_results = if load_all {
            cache
                .total_results
                .unwrap_or(self.limits.load_all_page_size)
        } else {
            num_results
        };
        let page = page.max(1);
        let (start, end) = page_range(page, num_results)?;
        if let Some(variants) = cache.materialized_page(start, end) {
            tracing::info!("Returning {} cached results", variants.len());
            return Ok(VariantPage {
                variants,
                total_results: cache.total_results.unwrap_or_default(),
            });
        }

        let sort_key = parse_sort_key(sort);
        let params = SortParams::resolve(sort_key, &self.reference);
        let catalog = SampleIndexCatalog::resolve(
            self.samples.as_ref(),
            self.backend.as_ref(),
            &search.family_guids,
        )?;
        let plan = interpreter::compile(
            &search.filter,
            &catalog,
            &self.reference,
            cache.has_grouped_results(),
        )?;
        let session = Session::new(self, catalog, plan, resolve_sort(sort_key, &params));

        let variants = session.search(&mut cache, page, num_results)?;
        cache.save(self.cache_store.as_ref(), &key);

        Ok(VariantPage {
            variants,
            total_results: cache.total_results.unwrap_or_default(),
        })
    }

    /// Load a single variant by its ID.
    pub fn get_single_variant(
        &self,
        family_guids: &[String],
        variant_id: &str,
    ) -> Result<Variant, SearchError> {
        self.search_variant_ids(family_guids, Query::term(VARIANT_ID_FIELD, variant_id), 1)?
            .into_iter()
            .next()
            .ok_or_else(|| SearchError::NotFound(format!("Variant {} not found", variant_id)))
    }

    /// Load the variants given as `(xpos, ref, alt)`.
    pub fn get_variants_for_variant_tuples(
        &self,
        family_guids: &[String],
        xpos_ref_alt_tuples: &[(u64, String, String)],
    ) -> Result<Vec<Variant>, SearchError> {
        let variant_ids = xpos_ref_alt_tuples
            .iter()
            .map(|(xpos, reference, alt)| {
                let (chrom, pos) = get_chrom_pos(*xpos)
                    .map_err(|e| SearchError::InvalidFilter(e.to_string()))?;
                let chrom = if chrom == "M" { String::from("MT") } else { chrom };
                Ok(format!("{}-{}-{}-{}", chrom, pos, reference, alt))
            })
            .collect::<Result<Vec<_>, SearchError>>()?;
        self.search_variant_ids(
            family_guids,
            Query::terms(VARIANT_ID_FIELD, variant_ids),
            xpos_ref_alt_tuples.len(),
        )
    }

    /// Run `query` without genotype constraints and without pagination state.
    fn search_variant_ids(
        &self,
        family_guids: &[String],
        query: Query,
        num_results: usize,
    ) -> Result<Vec<Variant>, SearchError> {
        let catalog =
            SampleIndexCatalog::resolve(self.samples.as_ref(), self.backend.as_ref(), family_guids)?;
        let sort = resolve_sort(None, &SortParams::default());
        let session = Session::new(self, catalog, QueryPlan::with_base(query), sort);
        session.search(&mut PaginationCache::default(), 1, num_results)
    }

    /// Execute a batch, canceling long-running tasks on timeout.
    fn execute(&self, requests: &[SearchRequest]) -> Result<Vec<SearchResponse>, SearchError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        for request in requests {
            tracing::debug!(
                "search request for {}: {}",
                &request.index,
                request.to_es_body()
            );
        }
        match self.backend.msearch(requests) {
            Ok(responses) => Ok(responses),
            Err(BackendError::Timeout) => {
                let canceled = self
                    .backend
                    .cancel_long_running_tasks(self.limits.long_running_task_threshold())
                    .unwrap_or_else(|e| {
                        tracing::warn!("Unable to cancel long running searches: {}", e);
                        0
                    });
                tracing::error!(
                    "Search backend timeout. Canceled {} long running searches",
                    canceled
                );
                Err(SearchError::BackendTimeout { canceled })
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<'a> Session<'a> {
    fn new(
        engine: &'a SearchEngine,
        catalog: SampleIndexCatalog,
        plan: QueryPlan,
        sort: Vec<SortSpec>,
    ) -> Self {
        Self {
            engine,
            catalog,
            plan,
            sort,
            source: query_field_names(),
        }
    }

    fn parser(&self) -> HitParser<'_> {
        HitParser::new(&self.catalog, &self.sort, &self.engine.liftover)
    }

    fn search(
        &self,
        cache: &mut PaginationCache,
        page: usize,
        num_results: usize,
    ) -> Result<Vec<Variant>, SearchError> {
        let indices = self.catalog.indices();
        tracing::info!("Searching in indices: {}", indices.join(", "));

        let strategy = choose_strategy(&self.catalog, &self.plan, cache.has_grouped_results());
        tracing::debug!("executing search as {}", strategy);
        match strategy {
            SearchStrategy::SingleIndexDirect => {
                self.execute_direct_search(cache, page, num_results)
            }
            SearchStrategy::SingleIndexDedupAll => {
                self.execute_dedup_all_search(cache, page, num_results)
            }
            SearchStrategy::MultiIndexFanout => {
                self.execute_multi_search(cache, page, num_results)
            }
        }
    }

    /// Requests of `index` covering records `start..end`.
    ///
    /// Compound heterozygous searches ignore the window and return their
    /// payload in the gene aggregation.
    fn paginated_requests(
        &self,
        index: &str,
        start: usize,
        end: usize,
    ) -> Vec<(SearchRequest, bool)> {
        let limits = &self.engine.limits;
        self.plan
            .searches_for(index)
            .into_iter()
            .map(|search| {
                let request = if search.compound_het {
                    tracing::info!("Loading compound hets for {}", index);
                    SearchRequest {
                        index: index.to_owned(),
                        query: search.query,
                        sort: self.sort.clone(),
                        from: 0,
                        size: 1,
                        source: Some(self.source.clone()),
                        gene_aggregation: Some(GeneAggregation {
                            min_doc_count: 2,
                            size: limits.max_compound_het_genes + 1,
                            top_hits: limits.compound_het_top_hits,
                        }),
                    }
                } else {
                    tracing::info!("Loading {} records {}-{}", index, start, end);
                    SearchRequest {
                        index: index.to_owned(),
                        query: search.query,
                        sort: self.sort.clone(),
                        from: start,
                        size: end.saturating_sub(start),
                        source: Some(self.source.clone()),
                        gene_aggregation: None,
                    }
                };
                (request, search.compound_het)
            })
            .collect()
    }

    fn parse_response(
        &self,
        response: &SearchResponse,
        compound_het: bool,
    ) -> Result<Parsed, SearchError> {
        let parser = self.parser();
        match (&response.gene_buckets, response.hits.first()) {
            (Some(buckets), Some(first_hit)) if compound_het => {
                let unaffected = self.catalog.unaffected_individuals(&first_hit.index);
                Ok(Parsed::CompoundHets(comphet::group_buckets(
                    buckets,
                    &parser,
                    &unaffected,
                    &self.plan.allowed_consequences,
                    self.engine.limits.max_compound_het_genes,
                )?))
            }
            _ => {
                tracing::info!(
                    "Total hits: {} ({} seconds)",
                    response.total.separate_with_commas(),
                    response.took_ms as f64 / 1000.0
                );
                Ok(Parsed::Hits {
                    variants: parser.parse_hits(&response.hits),
                    total: response.total,
                })
            }
        }
    }

    /// Run the first search of the joined indices and parse its response.
    fn execute_single_search(&self, start: usize, end: usize) -> Result<Parsed, SearchError> {
        let index = self.catalog.indices().join(",");
        let requests = self.paginated_requests(&index, start, end);
        let Some((request, compound_het)) = requests.into_iter().next() else {
            return Ok(Parsed::Hits {
                variants: Vec::new(),
                total: 0,
            });
        };
        let responses = self.engine.execute(std::slice::from_ref(&request))?;
        match responses.first() {
            Some(response) => self.parse_response(response, compound_het),
            None => Err(SearchError::Backend(anyhow::anyhow!(
                "no response for search of {}",
                &index
            ))),
        }
    }

    fn execute_direct_search(
        &self,
        cache: &mut PaginationCache,
        page: usize,
        num_results: usize,
    ) -> Result<Vec<Variant>, SearchError> {
        let (results_start, results_end) = page_range(page, num_results)?;
        let num_loaded = cache.all_results.len();
        let is_contiguous = num_loaded >= results_start;
        let start = if is_contiguous { num_loaded } else { results_start };

        let parsed = self.execute_single_search(start, results_end)?;
        cache.total_results = Some(parsed.total());
        match parsed {
            Parsed::CompoundHets(CompoundHetGroups { mut groups, total }) => {
                comphet::sort_groups(&mut groups);
                cache.grouped_results = groups;
                let end = results_end.min(total);
                Ok(get_compound_het_page(&cache.grouped_results, results_start, end)
                    .unwrap_or_default())
            }
            Parsed::Hits { variants, .. } => {
                if is_contiguous {
                    cache.all_results.extend(variants);
                    Ok(window(&cache.all_results, results_start, results_end))
                } else {
                    Ok(window(&variants, 0, num_results))
                }
            }
        }
    }

    /// One unfiltered search over all indices, continued at the raw offset
    /// of all records loaded so far.
    fn execute_dedup_all_search(
        &self,
        cache: &mut PaginationCache,
        page: usize,
        num_results: usize,
    ) -> Result<Vec<Variant>, SearchError> {
        let (results_start, results_end) = page_range(page, num_results)?;
        let num_indices = self.catalog.indices().len().max(1);
        let start = cache.all_results.len() + cache.duplicate_doc_count;
        let end = results_end.saturating_mul(num_indices);

        let parsed = self.execute_single_search(start, end)?;
        let raw_total = parsed.total();
        let variants = match parsed {
            Parsed::Hits { variants, .. } => variants,
            Parsed::CompoundHets(groups) => groups
                .groups
                .into_iter()
                .flat_map(|group| group.variants)
                .collect(),
        };
        let (variants, duplicates) = deduplicate(&mut cache.all_results, variants);
        cache.all_results.extend(variants);
        cache.duplicate_doc_count += duplicates;
        cache.total_results = Some(raw_total.saturating_sub(cache.duplicate_doc_count));

        Ok(window(&cache.all_results, results_start, results_end))
    }

    fn execute_multi_search(
        &self,
        cache: &mut PaginationCache,
        page: usize,
        num_results: usize,
    ) -> Result<Vec<Variant>, SearchError> {
        let (results_start, results_end) = page_range(page, num_results)?;

        let mut requests = Vec::new();
        let mut is_compound_het = Vec::new();
        for index in self.catalog.indices() {
            // An index seen before is done once all its hits are loaded, also with no hits.
            let start = match cache.loaded_variant_counts.get(index) {
                Some(counts) if counts.loaded >= counts.total => continue,
                Some(counts) => counts.loaded,
                None => {
                    cache
                        .loaded_variant_counts
                        .insert(index.to_owned(), LoadedCount::default());
                    0
                }
            };
            for (request, compound_het) in self.paginated_requests(index, start, results_end) {
                requests.push(request);
                is_compound_het.push(compound_het);
            }
        }

        let responses = self.engine.execute(&requests)?;

        let mut new_results = Vec::new();
        let mut compound_het_results = std::mem::take(&mut cache.compound_het_results);
        for ((request, response), compound_het) in
            requests.iter().zip(responses.iter()).zip(is_compound_het)
        {
            let parsed = self.parse_response(response, compound_het)?;
            if parsed.total() == 0 {
                continue;
            }
            match parsed {
                Parsed::CompoundHets(groups) => {
                    cache
                        .compound_het_totals
                        .insert(request.index.clone(), groups.total);
                    compound_het_results.extend(groups.groups);
                }
                Parsed::Hits { variants, total } => {
                    let counts = cache
                        .loaded_variant_counts
                        .entry(request.index.clone())
                        .or_default();
                    counts.total = total;
                    counts.loaded += variants.len();
                    new_results.extend(variants);
                }
            }
        }

        let raw_total: usize = cache
            .loaded_variant_counts
            .values()
            .map(|counts| counts.total)
            .chain(cache.compound_het_totals.values().copied())
            .sum();

        new_results.extend(std::mem::take(&mut cache.variant_results));
        sort_variants(&mut new_results);
        let (variant_results, duplicates) = deduplicate(&mut cache.all_results, new_results);
        cache.duplicate_doc_count += duplicates;

        let result = if !compound_het_results.is_empty() || cache.has_grouped_results() {
            let (mut compound_het_results, duplicates) = comphet::merge_groups(compound_het_results);
            cache.duplicate_doc_count += duplicates;
            comphet::sort_groups(&mut compound_het_results);
            cache.total_results = Some(raw_total.saturating_sub(cache.duplicate_doc_count));
            self.process_compound_hets(cache, compound_het_results, variant_results, num_results)
        } else {
            // Each index is loaded up to `results_end`, so that prefix of the merge is final.
            let num_final = results_end.saturating_sub(cache.all_results.len());
            let mut variant_results = variant_results;
            let pending = variant_results.split_off(num_final.min(variant_results.len()));
            cache.all_results.extend(variant_results);
            cache.variant_results = pending;
            cache.total_results = Some(raw_total.saturating_sub(cache.duplicate_doc_count));
            window(&cache.all_results, results_start, results_end)
        };
        Ok(result)
    }

    /// Merge compound heterozygous groups and single variants in sort order
    /// and consume whole groups until the page is full.
    fn process_compound_hets(
        &self,
        cache: &mut PaginationCache,
        compound_het_results: Vec<VariantGroup>,
        variant_results: Vec<Variant>,
        num_results: usize,
    ) -> Vec<Variant> {
        let mut grouped: Vec<VariantGroup> = compound_het_results
            .iter()
            .cloned()
            .chain(variant_results.iter().cloned().map(VariantGroup::single))
            .collect();
        comphet::sort_groups(&mut grouped);

        let loaded_result_count: usize = grouped
            .iter()
            .chain(cache.grouped_results.iter())
            .map(|group| group.variants.len())
            .sum();
        let all_loaded = Some(loaded_result_count) == cache.total_results;

        let mut result = Vec::new();
        let mut num_compound_hets = 0;
        let mut num_single_variants = 0;
        for group in &grouped {
            result.extend(group.variants.iter().cloned());
            if !all_loaded {
                cache.grouped_results.push(group.clone());
            }
            if group.is_compound_het() {
                num_compound_hets += 1;
            } else {
                num_single_variants += 1;
            }
            if result.len() >= num_results {
                break;
            }
        }

        if all_loaded {
            cache.grouped_results.extend(grouped);
            cache.compound_het_results = Vec::new();
            cache.variant_results = Vec::new();
        } else {
            cache.compound_het_results = compound_het_results
                .into_iter()
                .skip(num_compound_hets)
                .collect();
            cache.variant_results = variant_results
                .into_iter()
                .skip(num_single_variants)
                .collect();
        }
        result
    }
}
