//! Data structures for normalized variant records.

use std::collections::{BTreeMap, BTreeSet};

use enum_map::EnumMap;
use indexmap::IndexMap;

use crate::common::GenomeRelease;

use super::query::Population;

/// Genotype call of one individual.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Genotype {
    pub ab: Option<f64>,
    pub ad: Option<String>,
    pub dp: Option<i64>,
    pub gq: Option<i64>,
    pub pl: Option<String>,
    pub sample_id: String,
    /// Number of alternative alleles, -1 for no-call.
    pub num_alt: i32,
}

/// One transcript consequence.
///
/// Raw backend documents use snake case keys, normalized records camel case.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    #[serde(alias = "gene_id")]
    pub gene_id: String,
    #[serde(alias = "gene_symbol")]
    pub gene_symbol: Option<String>,
    #[serde(alias = "transcript_id")]
    pub transcript_id: Option<String>,
    #[serde(alias = "transcript_rank")]
    pub transcript_rank: Option<i64>,
    #[serde(alias = "major_consequence")]
    pub major_consequence: Option<String>,
    #[serde(alias = "major_consequence_rank")]
    pub major_consequence_rank: Option<i64>,
    #[serde(alias = "consequence_terms", default)]
    pub consequence_terms: Vec<String>,
    pub category: Option<String>,
    pub biotype: Option<String>,
    pub canonical: Option<i64>,
    pub hgvsc: Option<String>,
    pub hgvsp: Option<String>,
    #[serde(alias = "amino_acids")]
    pub amino_acids: Option<String>,
    pub codons: Option<String>,
    pub lof: Option<String>,
    #[serde(alias = "lof_filter")]
    pub lof_filter: Option<String>,
    #[serde(alias = "lof_flags")]
    pub lof_flags: Option<String>,
    #[serde(alias = "protein_id")]
    pub protein_id: Option<String>,
}

/// Frequency summary of one population.
#[derive(Debug, Clone, Copy, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct PopulationFreqs {
    pub af: Option<f64>,
    pub ac: Option<i64>,
    pub an: Option<i64>,
    pub hom: Option<i64>,
    pub hemi: Option<i64>,
}

/// A prediction is either a numeric score or a categorical call.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Prediction {
    Score(f64),
    Call(String),
}

/// Prediction scores of a variant.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Predictions {
    pub cadd: Option<Prediction>,
    pub dann: Option<Prediction>,
    pub eigen: Option<Prediction>,
    pub fathmm: Option<Prediction>,
    pub gerp_rs: Option<Prediction>,
    pub mpc: Option<Prediction>,
    pub metasvm: Option<Prediction>,
    pub mut_taster: Option<Prediction>,
    pub phastcons_100_vert: Option<Prediction>,
    pub polyphen: Option<Prediction>,
    pub primate_ai: Option<Prediction>,
    pub revel: Option<Prediction>,
    pub sift: Option<Prediction>,
    pub splice_ai: Option<Prediction>,
}

/// ClinVar summary.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinvarSummary {
    pub clinical_significance: Option<String>,
    pub variation_id: Option<i64>,
    pub allele_id: Option<i64>,
    pub gold_stars: Option<i64>,
}

/// HGMD summary.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HgmdSummary {
    pub accession: Option<String>,
    pub class: Option<String>,
}

/// Normalized variant record.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    /// `chrom-pos-ref-alt`, unique within one genome build.
    pub variant_id: String,
    pub chrom: String,
    pub pos: u64,
    #[serde(rename = "ref")]
    pub reference: String,
    pub alt: String,
    pub xpos: u64,
    pub rsid: Option<String>,
    /// Comma-separated VCF filter values.
    pub genotype_filters: String,
    pub original_alt_alleles: Vec<String>,
    pub clinvar: ClinvarSummary,
    pub hgmd: HgmdSummary,
    /// Genotypes by individual GUID.
    pub genotypes: BTreeMap<String, Genotype>,
    /// Sorted GUIDs of families the variant is relevant for.
    pub family_guids: Vec<String>,
    /// Transcripts grouped by gene ID.
    pub transcripts: IndexMap<String, Vec<Transcript>>,
    pub main_transcript: Option<Transcript>,
    pub populations: EnumMap<Population, PopulationFreqs>,
    pub predictions: Predictions,
    pub genome_version: GenomeRelease,
    pub lifted_over_genome_version: Option<GenomeRelease>,
    pub lifted_over_chrom: Option<String>,
    pub lifted_over_pos: Option<u64>,
    /// Normalized sort key.
    #[serde(rename = "_sort", default)]
    pub sort: Vec<f64>,
    /// Backend indices the record was merged from.
    #[serde(rename = "_indices", default)]
    pub indices: BTreeSet<String>,
}

impl Variant {
    /// Merge a duplicate record of the same variant into `self`.
    ///
    /// Genotypes and families are only ever added.  Returns whether `other`
    /// came from an index not merged before, i.e., whether it is a new duplicate.
    pub fn merge(&mut self, other: &Variant) -> bool {
        for (guid, genotype) in &other.genotypes {
            self.genotypes.insert(guid.clone(), genotype.clone());
        }
        let families: BTreeSet<_> = self
            .family_guids
            .iter()
            .chain(other.family_guids.iter())
            .cloned()
            .collect();
        self.family_guids = families.into_iter().collect();

        let mut is_new = false;
        for index in &other.indices {
            is_new |= self.indices.insert(index.clone());
        }
        is_new
    }

    /// Transcripts of the given gene, empty if the gene is not annotated.
    pub fn gene_transcripts(&self, gene_id: &str) -> &[Transcript] {
        self.transcripts
            .get(gene_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Gene of the main transcript, if any.
    pub fn main_gene_id(&self) -> Option<&str> {
        self.main_transcript.as_ref().map(|t| t.gene_id.as_str())
    }
}

/// A group of variants, either compound heterozygous in a gene or a single variant.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantGroup {
    /// Gene of a compound heterozygous group, `None` for single variants.
    pub gene_id: Option<String>,
    pub variants: Vec<Variant>,
}

impl VariantGroup {
    pub fn single(variant: Variant) -> Self {
        Self {
            gene_id: None,
            variants: vec![variant],
        }
    }

    pub fn is_compound_het(&self) -> bool {
        self.gene_id.is_some()
    }

    /// Sort key of the group, the one of its first variant.
    pub fn sort_key(&self) -> &[f64] {
        self.variants
            .first()
            .map(|v| v.sort.as_slice())
            .unwrap_or_default()
    }
}

/// Compare two sort keys lexicographically with total float order.
pub fn cmp_sort_keys(lhs: &[f64], rhs: &[f64]) -> std::cmp::Ordering {
    for (l, r) in lhs.iter().zip(rhs.iter()) {
        match l.total_cmp(r) {
            std::cmp::Ordering::Equal => continue,
            ord => return ord,
        }
    }
    lhs.len().cmp(&rhs.len())
}
