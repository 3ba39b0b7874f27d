use std::collections::BTreeMap;

use crate::search::{
    backend::dsl::Query,
    schema::query::{FrequencyCeiling, Population},
};

/// Frequency summary fields of a population.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display, strum::EnumIter,
)]
pub enum FreqField {
    #[strum(serialize = "AF")]
    Af,
    #[strum(serialize = "AC")]
    Ac,
    #[strum(serialize = "AN")]
    An,
    #[strum(serialize = "Hom")]
    Hom,
    #[strum(serialize = "Hemi")]
    Hemi,
}

impl FreqField {
    /// Additional field suffixes tried when reading values.
    fn custom_suffixes(self) -> &'static [&'static str] {
        match self {
            FreqField::Af => &["AF_POPMAX_OR_GLOBAL"],
            _ => &[],
        }
    }
}

/// Population specific field name, if it deviates from the `{population}_{field}` scheme.
fn field_override(population: Population, field: FreqField) -> Option<&'static str> {
    match (population, field) {
        (Population::Callset, FreqField::Af) => Some("AF"),
        (Population::Callset, FreqField::Ac) => Some("AC"),
        (Population::Callset, FreqField::An) => Some("AN"),
        (Population::G1k, FreqField::Af) => Some("g1k_POPMAX_AF"),
        (Population::Exac, FreqField::Af) => Some("exac_AF_POPMAX"),
        (Population::Exac, FreqField::Ac) => Some("exac_AC_Adj"),
        (Population::Exac, FreqField::An) => Some("exac_AN_Adj"),
        (Population::Exac, FreqField::Hom) => Some("exac_AC_Hom"),
        (Population::Exac, FreqField::Hemi) => Some("exac_AC_Hemi"),
        _ => None,
    }
}

/// Field used for filtering and sorting on a population frequency.
pub fn freq_key(population: Population, field: FreqField) -> String {
    if let Some(key) = field_override(population, field) {
        return key.to_owned();
    }
    let suffix = match field.custom_suffixes().last() {
        Some(suffix) if population != Population::Topmed => suffix.to_string(),
        _ => field.to_string(),
    };
    format!("{}_{}", population, suffix)
}

/// Candidate fields for reading a population frequency, in order of preference.
pub fn response_keys(population: Population, field: FreqField) -> Vec<String> {
    let mut result = Vec::new();
    if let Some(key) = field_override(population, field) {
        result.push(key.to_owned());
    }
    for suffix in field.custom_suffixes() {
        result.push(format!("{}_{}", population, suffix));
    }
    result.push(format!("{}_{}", population, field));
    result
}

fn ceiling<V: Into<serde_json::Value>>(key: String, value: V) -> Query {
    // Missing values pass.
    Query::range(&key, None, Some(value)) | !Query::exists(&key)
}

/// Build the frequency predicate, `None` if no ceilings were given.
pub fn filter(freqs: &BTreeMap<Population, FrequencyCeiling>) -> Option<Query> {
    let mut query = Query::MatchAll;
    for (population, freqs) in freqs {
        if let Some(af) = freqs.af {
            query = query & ceiling(freq_key(*population, FreqField::Af), af);
        } else if let Some(ac) = freqs.ac {
            query = query & ceiling(freq_key(*population, FreqField::Ac), ac);
        }
        if let Some(hh) = freqs.hh {
            query = query & ceiling(freq_key(*population, FreqField::Hom), hh);
            query = query & ceiling(freq_key(*population, FreqField::Hemi), hh);
        }
    }

    (query != Query::MatchAll).then_some(query)
}
