//! Resolution of logical sort keys to backend sort specifications.

use std::collections::BTreeMap;

use serde_json::Value;

use super::backend::dsl::{Missing, SortOrder, SortScript, SortSpec};
use super::interpreter::frequency::{freq_key, FreqField};
use super::reference::ReferenceData;
use super::schema::query::Population;

/// Sort key used as final tie-break and as default.
pub const XPOS_SORT_KEY: &str = "xpos";

/// Logical sort keys.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "snake_case")]
pub enum SortKey {
    Xpos,
    Pathogenicity,
    PathogenicityHgmd,
    InOmim,
    ProteinConsequence,
    Exac,
    #[strum(serialize = "1kg")]
    OneKg,
    Cadd,
    Revel,
    Eigen,
    Mpc,
    SpliceAi,
    PrimateAi,
    Constraint,
}

/// External parameters of scripted sorts, fetched before building the sort.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SortParams {
    pub disease_gene_ids: Option<Vec<String>>,
    pub constraint_ranks: Option<BTreeMap<String, u64>>,
}

impl SortParams {
    /// Fetch the parameters needed by `key`, and only those.
    pub fn resolve(key: Option<SortKey>, reference: &ReferenceData) -> Self {
        match key {
            Some(SortKey::InOmim) => Self {
                disease_gene_ids: Some(reference.disease_gene_ids()),
                ..Default::default()
            },
            Some(SortKey::Constraint) => Self {
                constraint_ranks: Some(reference.constraint_ranks()),
                ..Default::default()
            },
            _ => Self::default(),
        }
    }
}

fn desc(field: &str) -> SortSpec {
    SortSpec::Field {
        field: field.to_owned(),
        order: SortOrder::Desc,
        missing: None,
    }
}

fn missing_first(field: String) -> SortSpec {
    SortSpec::Field {
        field,
        order: SortOrder::Asc,
        missing: Some(Missing::First),
    }
}

fn script(script: SortScript) -> SortSpec {
    SortSpec::Script {
        script,
        order: SortOrder::Asc,
    }
}

/// Build the sort specification of `key`; `xpos` is always the final criterion.
pub fn resolve_sort(key: Option<SortKey>, params: &SortParams) -> Vec<SortSpec> {
    let mut result = match key {
        None | Some(SortKey::Xpos) => vec![],
        Some(SortKey::Pathogenicity) => vec![script(SortScript::ClinvarPathogenicity)],
        Some(SortKey::PathogenicityHgmd) => vec![
            script(SortScript::ClinvarPathogenicity),
            script(SortScript::HgmdDiseaseCausing),
        ],
        Some(SortKey::InOmim) => vec![script(SortScript::InGeneSet {
            gene_ids: params.disease_gene_ids.clone().unwrap_or_default(),
        })],
        Some(SortKey::ProteinConsequence) => {
            vec![SortSpec::field("mainTranscript_major_consequence_rank")]
        }
        Some(SortKey::Exac) => vec![missing_first(freq_key(Population::Exac, FreqField::Af))],
        Some(SortKey::OneKg) => vec![missing_first(freq_key(Population::G1k, FreqField::Af))],
        Some(SortKey::Cadd) => vec![desc("cadd_PHRED")],
        Some(SortKey::Revel) => vec![desc("dbnsfp_REVEL_score")],
        Some(SortKey::Eigen) => vec![desc("eigen_Eigen_phred")],
        Some(SortKey::Mpc) => vec![desc("mpc_MPC")],
        Some(SortKey::SpliceAi) => vec![desc("splice_ai_delta_score")],
        Some(SortKey::PrimateAi) => vec![desc("primate_ai_score")],
        Some(SortKey::Constraint) => vec![script(SortScript::ConstraintRank {
            ranks: params.constraint_ranks.clone().unwrap_or_default(),
        })],
    };
    result.push(SortSpec::field(XPOS_SORT_KEY));
    result
}

/// Parse a logical sort key; unknown keys sort by position only.
pub fn parse_sort_key(sort: &str) -> Option<SortKey> {
    let key = sort.parse::<SortKey>().ok();
    if key.is_none() {
        tracing::warn!("unknown sort key {:?}, sorting by position", sort);
    }
    key
}

/// Sort value used for missing and infinite values.
const MAX_SORT_VALUE: f64 = i64::MAX as f64;

/// Normalize one backend sort value so that ascending order of the result
/// is the order requested by `spec`.
pub fn normalize_sort_value(value: &Value, spec: &SortSpec) -> f64 {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => match s.as_str() {
            "Infinity" => Some(f64::INFINITY),
            "-Infinity" => Some(f64::NEG_INFINITY),
            s => s.parse::<f64>().ok(),
        },
        _ => None,
    };
    match (spec.order(), number) {
        (SortOrder::Desc, Some(n)) if n == f64::INFINITY => -1.0,
        (SortOrder::Desc, Some(n)) if n == f64::NEG_INFINITY => MAX_SORT_VALUE,
        (SortOrder::Desc, Some(n)) => -n,
        (SortOrder::Desc, None) => MAX_SORT_VALUE,
        (SortOrder::Asc, Some(n)) if n == f64::INFINITY => MAX_SORT_VALUE,
        (SortOrder::Asc, Some(n)) if n == f64::NEG_INFINITY => -1.0,
        (SortOrder::Asc, Some(n)) => n,
        (SortOrder::Asc, None) => MAX_SORT_VALUE,
    }
}

/// Normalize all sort values of a hit.
pub fn normalize_sort_values(values: &[Value], sort: &[SortSpec]) -> Vec<f64> {
    values
        .iter()
        .zip(sort.iter())
        .map(|(value, spec)| normalize_sort_value(value, spec))
        .collect()
}
