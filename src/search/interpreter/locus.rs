use crate::{
    common::get_xpos,
    err::SearchError,
    search::{
        backend::{dsl::Query, GENE_IDS_FIELD},
        reference::GeneLookup,
        schema::query::{Interval, LocusFilter},
    },
};

/// Location filter with gene symbols resolved to gene IDs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedLocus {
    pub gene_ids: Vec<String>,
    pub intervals: Vec<Interval>,
    pub exclude: bool,
}

impl ResolvedLocus {
    pub fn is_empty(&self) -> bool {
        self.gene_ids.is_empty() && self.intervals.is_empty()
    }
}

/// Resolve the raw items of `locus` into gene IDs and intervals.
pub fn resolve(locus: &LocusFilter, genes: &dyn GeneLookup) -> Result<ResolvedLocus, SearchError> {
    let mut result = ResolvedLocus {
        exclude: locus.exclude_locations,
        ..Default::default()
    };
    let mut invalid_items = Vec::new();
    for item in locus.items() {
        if item.contains(':') {
            match item.parse::<Interval>() {
                Ok(interval) if interval.start <= interval.end => result.intervals.push(interval),
                _ => invalid_items.push(item.to_owned()),
            }
        } else if let Some(gene_id) = genes.gene_id(item) {
            if !result.gene_ids.contains(&gene_id) {
                result.gene_ids.push(gene_id);
            }
        } else {
            invalid_items.push(item.to_owned());
        }
    }

    if invalid_items.is_empty() {
        Ok(result)
    } else {
        Err(SearchError::InvalidFilter(format!(
            "Invalid genes/intervals: {}",
            invalid_items.join(", ")
        )))
    }
}

/// Build the location predicate, `None` if there are no locations.
pub fn filter(locus: &ResolvedLocus) -> Result<Option<Query>, SearchError> {
    let mut queries = Vec::new();
    for interval in &locus.intervals {
        let xpos = |pos| {
            get_xpos(&interval.chrom, pos)
                .map_err(|e| SearchError::InvalidFilter(format!("Invalid interval: {}", e)))
        };
        queries.push(Query::range(
            "xpos",
            Some(xpos(interval.start)?),
            Some(xpos(interval.end)?),
        ));
    }
    if !locus.gene_ids.is_empty() {
        queries.push(Query::terms(GENE_IDS_FIELD, locus.gene_ids.iter().cloned()));
    }

    Ok(Query::any_of(queries).map(|q| if locus.exclude { !q } else { q }))
}
