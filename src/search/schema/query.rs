//! Code for representing search filter definitions.
//!
//! Filters arrive as JSON (e.g., stored with a saved search) and are
//! deserialized into the strongly typed structures defined here.  All
//! validation happens in `SearchFilter::validate()` before any query is built.

use std::collections::BTreeMap;

use indexmap::IndexMap;

use crate::err::SearchError;

/// Name of the consequence that also matches records without consequence terms.
pub const INTERGENIC_VARIANT: &str = "intergenic_variant";

/// Genomic interval with 1-based, closed coordinates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Interval {
    pub chrom: String,
    pub start: u64,
    pub end: u64,
}

/// Supporting code for `Interval`.
pub(crate) mod interval {
    /// Error type for `Interval::from_str()`.
    #[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        #[error("Invalid format in interval: {0:?}")]
        InvalidFormat(String),
        #[error("Invalid integer coordinates in interval: {0:?}")]
        InvalidInts(String),
    }
}

impl std::str::FromStr for Interval {
    type Err = interval::Error;

    /// Parse intervals of the form `chr1:1,000-2,000`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (chrom, range) = s
            .split_once(':')
            .ok_or_else(|| interval::Error::InvalidFormat(s.to_owned()))?;
        let (start, end) = range
            .split_once('-')
            .ok_or_else(|| interval::Error::InvalidFormat(s.to_owned()))?;
        let parse = |x: &str| {
            x.replace(',', "")
                .parse::<u64>()
                .map_err(|_| interval::Error::InvalidInts(s.to_owned()))
        };
        let chrom = chrom.trim_start_matches("chr");
        if chrom.is_empty() {
            return Err(interval::Error::InvalidFormat(s.to_owned()));
        }
        Ok(Interval {
            chrom: chrom.to_owned(),
            start: parse(start)?,
            end: parse(end)?,
        })
    }
}

/// Location filter as entered by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LocusFilter {
    /// Free-text gene symbols, gene IDs, and intervals (comma/whitespace separated).
    pub raw_items: String,
    /// Whether to exclude rather than include the locations.
    pub exclude_locations: bool,
}

impl LocusFilter {
    /// Split the raw items into individual tokens.
    pub fn items(&self) -> Vec<&str> {
        self.raw_items
            .split(|c: char| c == ';' || c.is_whitespace())
            .flat_map(|item| {
                // Commas are separators unless they are thousands separators within an interval.
                if item.contains(':') {
                    vec![item]
                } else {
                    item.split(',').collect()
                }
            })
            .filter(|item| !item.is_empty())
            .collect()
    }
}

/// Named clinvar significance buckets.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ClinvarBucket {
    Pathogenic,
    LikelyPathogenic,
    Benign,
    LikelyBenign,
    VusOrConflicting,
}

/// Named HGMD class buckets.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HgmdBucket {
    DiseaseCausing,
    LikelyDiseaseCausing,
    HgmdOther,
}

/// Pathogenicity filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PathogenicityFilter {
    pub clinvar: Vec<ClinvarBucket>,
    pub hgmd: Vec<HgmdBucket>,
}

/// Populations with frequency annotation in the backend.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    enum_map::Enum,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Population {
    Callset,
    Topmed,
    G1k,
    Exac,
    GnomadExomes,
    GnomadGenomes,
}

/// Frequency ceilings for one population.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct FrequencyCeiling {
    /// Maximal allele frequency.
    pub af: Option<f64>,
    /// Maximal allele count; ignored if `af` is given.
    pub ac: Option<u32>,
    /// Maximal homozygous and hemizygous count.
    pub hh: Option<u32>,
}

/// Named inheritance modes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InheritanceMode {
    /// Homozygous recessive, X-linked recessive, or compound heterozygous.
    Recessive,
    XLinkedRecessive,
    HomozygousRecessive,
    CompoundHet,
    DeNovo,
}

/// Required genotype of one individual.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GenotypeRequirement {
    /// Homozygous reference (called, no alternative allele).
    RefRef,
    /// Heterozygous.
    RefAlt,
    /// Homozygous alternative.
    AltAlt,
    /// Heterozygous or homozygous alternative.
    HasAlt,
    /// Homozygous reference or heterozygous.
    HasRef,
}

/// Affected status of an individual.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
)]
pub enum AffectedStatus {
    #[serde(rename = "A")]
    #[strum(serialize = "A")]
    Affected,
    #[serde(rename = "N")]
    #[strum(serialize = "N")]
    Unaffected,
    #[default]
    #[serde(rename = "U")]
    #[strum(serialize = "U")]
    Unknown,
}

/// Per-individual overrides of the inheritance mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InheritanceOverrides {
    /// Explicit genotype requirement by individual GUID.
    pub genotype: BTreeMap<String, GenotypeRequirement>,
    /// Affected status override by individual GUID.
    pub affected: BTreeMap<String, AffectedStatus>,
}

/// Inheritance filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct InheritanceFilter {
    pub mode: Option<InheritanceMode>,
    pub filter: InheritanceOverrides,
}

impl InheritanceFilter {
    /// Whether any inheritance constraint is present.
    pub fn is_constrained(&self) -> bool {
        self.mode.is_some() || !self.filter.genotype.is_empty()
    }
}

/// VCF `FILTER` column handling.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum VcfFilter {
    /// Only keep records that pass all VCF filters.
    Pass,
}

/// Call quality filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct QualityFilter {
    /// Minimal allele balance in percent; multiple of 5.
    pub min_ab: u32,
    /// Minimal genotype quality; multiple of 5.
    pub min_gq: u32,
    pub vcf_filter: Option<VcfFilter>,
}

impl QualityFilter {
    pub fn has_thresholds(&self) -> bool {
        self.min_ab > 0 || self.min_gq > 0
    }
}

/// Full search filter.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchFilter {
    pub locus: Option<LocusFilter>,
    /// Consequence terms grouped by category.
    pub annotations: IndexMap<String, Vec<String>>,
    pub pathogenicity: PathogenicityFilter,
    pub freqs: BTreeMap<Population, FrequencyCeiling>,
    pub inheritance: InheritanceFilter,
    pub quality_filter: QualityFilter,
}

impl SearchFilter {
    /// Validate the filter, to be called before compiling it.
    pub fn validate(&self) -> Result<(), SearchError> {
        if self.quality_filter.min_ab % 5 != 0 {
            return Err(SearchError::InvalidFilter(format!(
                "Invalid ab filter {}",
                self.quality_filter.min_ab
            )));
        }
        if self.quality_filter.min_gq % 5 != 0 {
            return Err(SearchError::InvalidFilter(format!(
                "Invalid gq filter {}",
                self.quality_filter.min_gq
            )));
        }
        Ok(())
    }
}
