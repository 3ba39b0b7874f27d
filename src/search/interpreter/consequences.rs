use std::collections::BTreeSet;

use indexmap::IndexMap;

use crate::search::{backend::dsl::Query, schema::query::INTERGENIC_VARIANT};

/// Field with the union of consequence terms over all transcripts.
pub const CONSEQUENCE_TERMS_FIELD: &str = "transcriptConsequenceTerms";

/// Annotation predicate together with the allowed consequences.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsequenceFilter {
    pub query: Query,
    /// Consequences a compound heterozygous member must have in its gene.
    pub allowed_consequences: BTreeSet<String>,
}

/// Build the consequence predicate, `None` if no terms were requested.
pub fn filter(annotations: &IndexMap<String, Vec<String>>) -> Option<ConsequenceFilter> {
    let terms: Vec<&String> = annotations.values().flatten().collect();
    if terms.is_empty() {
        return None;
    }

    let mut query = Query::terms(CONSEQUENCE_TERMS_FIELD, terms.iter().map(|t| t.as_str()));
    // Intergenic variants often have no annotation at all.
    if terms.iter().any(|t| t.as_str() == INTERGENIC_VARIANT) {
        query = query | !Query::exists(CONSEQUENCE_TERMS_FIELD);
    }

    Some(ConsequenceFilter {
        query,
        allowed_consequences: terms.into_iter().cloned().collect(),
    })
}
