//! Predicate tree and sort specification understood by all search backends.
//!
//! Predicates are combined with `&`, `|`, and `!`; the combinators flatten
//! unnamed boolean nodes so that repeatedly combining predicates yields
//! shallow trees.

use std::collections::BTreeMap;
use std::ops::{BitAnd, BitOr, Not};

use serde_json::{json, Value};

/// Boolean combination of predicates.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct BoolQuery {
    /// All must match.
    pub must: Vec<Query>,
    /// At least one must match if non-empty.
    pub should: Vec<Query>,
    /// None may match.
    pub must_not: Vec<Query>,
    /// Name reported back for matching documents.
    pub name: Option<String>,
}

impl BoolQuery {
    fn is_plain_and(&self) -> bool {
        self.name.is_none() && self.should.is_empty()
    }

    fn is_plain_or(&self) -> bool {
        self.name.is_none() && self.must.is_empty() && self.must_not.is_empty()
    }
}

/// Primitive predicate tree.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum Query {
    /// Matches every document.
    #[default]
    MatchAll,
    /// Field (or any element of an array field) equals the value.
    Term { field: String, value: Value },
    /// Field (or any element of an array field) equals one of the values.
    Terms { field: String, values: Vec<Value> },
    /// Numeric field within the closed range.
    Range {
        field: String,
        gte: Option<Value>,
        lte: Option<Value>,
    },
    /// Field is present, non-null, and not an empty array.
    Exists { field: String },
    Bool(BoolQuery),
}

impl Query {
    pub fn term<V: Into<Value>>(field: &str, value: V) -> Self {
        Query::Term {
            field: field.to_owned(),
            value: value.into(),
        }
    }

    pub fn terms<I, V>(field: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Query::Terms {
            field: field.to_owned(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn range<V: Into<Value>>(field: &str, gte: Option<V>, lte: Option<V>) -> Self {
        Query::Range {
            field: field.to_owned(),
            gte: gte.map(Into::into),
            lte: lte.map(Into::into),
        }
    }

    pub fn exists(field: &str) -> Self {
        Query::Exists {
            field: field.to_owned(),
        }
    }

    /// Conjunction of `must` tagged with `name`.
    pub fn named(name: &str, must: Vec<Query>) -> Self {
        Query::Bool(BoolQuery {
            must,
            name: Some(name.to_owned()),
            ..Default::default()
        })
    }

    /// Disjunction of all queries, `None` if empty.
    pub fn any_of<I: IntoIterator<Item = Query>>(queries: I) -> Option<Self> {
        queries.into_iter().reduce(|lhs, rhs| lhs | rhs)
    }

    /// Render to Elasticsearch query DSL JSON.
    pub fn to_es_json(&self) -> Value {
        match self {
            Query::MatchAll => json!({"match_all": {}}),
            Query::Term { field, value } => json!({"term": {field: value}}),
            Query::Terms { field, values } => json!({"terms": {field: values}}),
            Query::Range { field, gte, lte } => {
                let mut bounds = serde_json::Map::new();
                if let Some(gte) = gte {
                    bounds.insert("gte".into(), gte.clone());
                }
                if let Some(lte) = lte {
                    bounds.insert("lte".into(), lte.clone());
                }
                json!({"range": {field: bounds}})
            }
            Query::Exists { field } => json!({"exists": {"field": field}}),
            Query::Bool(bool_query) => {
                // keys are inserted in lexicographic order
                let mut body = serde_json::Map::new();
                let render =
                    |qs: &Vec<Query>| Value::Array(qs.iter().map(Query::to_es_json).collect());
                if let Some(name) = &bool_query.name {
                    body.insert("_name".into(), json!(name));
                }
                if !bool_query.should.is_empty() {
                    body.insert("minimum_should_match".into(), json!(1));
                }
                if !bool_query.must.is_empty() {
                    body.insert("must".into(), render(&bool_query.must));
                }
                if !bool_query.must_not.is_empty() {
                    body.insert("must_not".into(), render(&bool_query.must_not));
                }
                if !bool_query.should.is_empty() {
                    body.insert("should".into(), render(&bool_query.should));
                }
                json!({ "bool": body })
            }
        }
    }
}

impl BitAnd for Query {
    type Output = Query;

    fn bitand(self, rhs: Query) -> Query {
        match (self, rhs) {
            (Query::MatchAll, rhs) => rhs,
            (lhs, Query::MatchAll) => lhs,
            (Query::Bool(mut lhs), Query::Bool(rhs)) if lhs.is_plain_and() && rhs.is_plain_and() => {
                lhs.must.extend(rhs.must);
                lhs.must_not.extend(rhs.must_not);
                Query::Bool(lhs)
            }
            (Query::Bool(mut lhs), rhs) if lhs.is_plain_and() => {
                lhs.must.push(rhs);
                Query::Bool(lhs)
            }
            (lhs, Query::Bool(mut rhs)) if rhs.is_plain_and() => {
                rhs.must.insert(0, lhs);
                Query::Bool(rhs)
            }
            (lhs, rhs) => Query::Bool(BoolQuery {
                must: vec![lhs, rhs],
                ..Default::default()
            }),
        }
    }
}

impl BitOr for Query {
    type Output = Query;

    fn bitor(self, rhs: Query) -> Query {
        match (self, rhs) {
            (Query::MatchAll, _) | (_, Query::MatchAll) => Query::MatchAll,
            (Query::Bool(mut lhs), Query::Bool(rhs)) if lhs.is_plain_or() && rhs.is_plain_or() => {
                lhs.should.extend(rhs.should);
                Query::Bool(lhs)
            }
            (Query::Bool(mut lhs), rhs) if lhs.is_plain_or() => {
                lhs.should.push(rhs);
                Query::Bool(lhs)
            }
            (lhs, rhs) => Query::Bool(BoolQuery {
                should: vec![lhs, rhs],
                ..Default::default()
            }),
        }
    }
}

impl Not for Query {
    type Output = Query;

    fn not(self) -> Query {
        match self {
            Query::Bool(BoolQuery {
                must,
                should,
                mut must_not,
                name: None,
            }) if must.is_empty() && should.is_empty() && must_not.len() == 1 => must_not.remove(0),
            query => Query::Bool(BoolQuery {
                must_not: vec![query],
                ..Default::default()
            }),
        }
    }
}

/// Sort direction.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Placement of documents without the sort field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Missing {
    #[serde(rename = "_first")]
    First,
    #[serde(rename = "_last")]
    Last,
}

/// Server-side computed sort values.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SortScript {
    /// 0 for pathogenic, 1 for uncertain, 2 for missing, 3 for benign ClinVar calls.
    ClinvarPathogenicity,
    /// 0 for HGMD class `DM`, 1 otherwise.
    HgmdDiseaseCausing,
    /// 0 if the main transcript gene is in the set, 1 otherwise.
    InGeneSet { gene_ids: Vec<String> },
    /// Constraint rank sum of the main transcript gene.
    ConstraintRank { ranks: BTreeMap<String, u64> },
}

/// Rank used for genes without constraint information.
pub const MISSING_CONSTRAINT_RANK: u64 = 1_000_000_000;

impl SortScript {
    /// Painless source of the script.
    pub fn source(&self) -> &'static str {
        match self {
            SortScript::ClinvarPathogenicity => {
                "if (doc['clinvar_clinical_significance'].empty) { return 2; } \
                 String clinsig = doc['clinvar_clinical_significance'].value; \
                 if (clinsig.indexOf('Pathogenic') >= 0 || clinsig.indexOf('Likely_pathogenic') >= 0) { return 0; } \
                 else if (clinsig.indexOf('Benign') >= 0 || clinsig.indexOf('Likely_benign') >= 0) { return 3; } \
                 return 1;"
            }
            SortScript::HgmdDiseaseCausing => {
                "(!doc['hgmd_class'].empty && doc['hgmd_class'].value == 'DM') ? 0 : 1"
            }
            SortScript::InGeneSet { .. } => {
                "params.gene_ids.contains(doc['mainTranscript_gene_id'].value) ? 0 : 1"
            }
            SortScript::ConstraintRank { .. } => {
                "params.constraint_ranks_by_gene.getOrDefault(doc['mainTranscript_gene_id'].value, 1000000000)"
            }
        }
    }

    /// Script parameters, if any.
    pub fn params(&self) -> Option<Value> {
        match self {
            SortScript::ClinvarPathogenicity | SortScript::HgmdDiseaseCausing => None,
            SortScript::InGeneSet { gene_ids } => Some(json!({ "gene_ids": gene_ids })),
            SortScript::ConstraintRank { ranks } => {
                Some(json!({ "constraint_ranks_by_gene": ranks }))
            }
        }
    }
}

/// One backend sort criterion.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum SortSpec {
    Field {
        field: String,
        order: SortOrder,
        missing: Option<Missing>,
    },
    Script {
        script: SortScript,
        order: SortOrder,
    },
}

impl SortSpec {
    pub fn field(field: &str) -> Self {
        SortSpec::Field {
            field: field.to_owned(),
            order: SortOrder::Asc,
            missing: None,
        }
    }

    pub fn order(&self) -> SortOrder {
        match self {
            SortSpec::Field { order, .. } | SortSpec::Script { order, .. } => *order,
        }
    }

    /// Render to Elasticsearch sort JSON.
    pub fn to_es_json(&self) -> Value {
        match self {
            SortSpec::Field {
                field,
                order,
                missing,
            } => {
                let mut body = serde_json::Map::new();
                body.insert("order".into(), json!(order.to_string()));
                if let Some(missing) = missing {
                    body.insert("missing".into(), json!(missing));
                }
                json!({ field: body })
            }
            SortSpec::Script { script, order } => {
                let mut inner = serde_json::Map::new();
                inner.insert("source".into(), json!(script.source()));
                if let Some(params) = script.params() {
                    inner.insert("params".into(), params);
                }
                json!({"_script": {"type": "number", "order": order.to_string(), "script": inner}})
            }
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    #[test]
    fn and_with_match_all_is_identity() {
        let q = Query::exists("filters");
        assert_eq!(Query::MatchAll & q.clone(), q);
        assert_eq!(q.clone() & Query::MatchAll, q);
    }

    #[test]
    fn and_flattens() {
        let q = Query::term("a", 1) & Query::term("b", 2) & Query::term("c", 3);
        assert_eq!(
            q,
            Query::Bool(BoolQuery {
                must: vec![
                    Query::term("a", 1),
                    Query::term("b", 2),
                    Query::term("c", 3)
                ],
                ..Default::default()
            })
        );
    }

    #[test]
    fn or_flattens_but_keeps_named() {
        let named = Query::named("F1", vec![Query::term("a", 1)]);
        let q = named.clone() | Query::term("b", 2) | Query::term("c", 3);
        assert_eq!(
            q,
            Query::Bool(BoolQuery {
                should: vec![named, Query::term("b", 2), Query::term("c", 3)],
                ..Default::default()
            })
        );
    }

    #[test]
    fn double_negation() {
        let q = Query::exists("filters");
        assert_eq!(!!q.clone(), q);
    }

    #[test]
    fn any_of() {
        assert_eq!(Query::any_of(vec![]), None);
        assert_eq!(
            Query::any_of(vec![Query::term("a", 1)]),
            Some(Query::term("a", 1))
        );
    }

    #[test]
    fn render_bool() {
        let q = Query::named(
            "F1",
            vec![!Query::exists("filters") | Query::range("xpos", Some(1), Some(2))],
        );
        insta::assert_snapshot!(
            q.to_es_json().to_string(),
            @r#"{"bool":{"_name":"F1","must":[{"bool":{"minimum_should_match":1,"should":[{"bool":{"must_not":[{"exists":{"field":"filters"}}]}},{"range":{"xpos":{"gte":1,"lte":2}}}]}}]}}"#
        );
    }

    #[test]
    fn render_sort() {
        assert_eq!(
            SortSpec::Field {
                field: "exac_AF_POPMAX".into(),
                order: SortOrder::Asc,
                missing: Some(Missing::First)
            }
            .to_es_json(),
            json!({"exac_AF_POPMAX": {"order": "asc", "missing": "_first"}})
        );
        assert_eq!(
            SortSpec::Script {
                script: SortScript::InGeneSet {
                    gene_ids: vec!["ENSG1".into()]
                },
                order: SortOrder::Asc
            }
            .to_es_json(),
            json!({"_script": {
                "type": "number",
                "order": "asc",
                "script": {
                    "source": "params.gene_ids.contains(doc['mainTranscript_gene_id'].value) ? 0 : 1",
                    "params": {"gene_ids": ["ENSG1"]}
                }
            }})
        );
    }
}
