//! Conversion of raw backend hits into `Variant` records.

use std::collections::BTreeSet;

use enum_map::EnumMap;
use serde_json::{Map, Value};
use strum::IntoEnumIterator;

use crate::common::{get_xpos, GenomeRelease};

use super::backend::{dsl::SortSpec, Hit};
use super::interpreter::frequency::{response_keys, FreqField};
use super::interpreter::genotype::{NUM_ALT_1_FIELD, NUM_ALT_2_FIELD};
use super::liftover::LazyLiftover;
use super::samples::SampleIndexCatalog;
use super::schema::data::{
    ClinvarSummary, Genotype, HgmdSummary, PopulationFreqs, Prediction, Predictions, Transcript,
    Variant,
};
use super::schema::query::Population;
use super::sorting::normalize_sort_values;

const GENOTYPES_FIELD: &str = "genotypes";
const SORTED_TRANSCRIPTS_FIELD: &str = "sortedTranscriptConsequences";

const CORE_FIELDS: &[&str] = &[
    "alt",
    "contig",
    "filters",
    "originalAltAlleles",
    "ref",
    "rsid",
    "start",
    "variantId",
    "xpos",
];

const CLINVAR_FIELDS: &[&str] = &[
    "clinvar_clinical_significance",
    "clinvar_variation_id",
    "clinvar_allele_id",
    "clinvar_gold_stars",
];

const HGMD_FIELDS: &[&str] = &["hgmd_accession", "hgmd_class"];

/// Backend fields of the prediction scores.
const PREDICTION_FIELDS: &[&str] = &[
    "cadd_PHRED",
    "dbnsfp_DANN_score",
    "eigen_Eigen_phred",
    "dbnsfp_FATHMM_pred",
    "dbnsfp_GERP_RS",
    "mpc_MPC",
    "dbnsfp_MetaSVM_pred",
    "dbnsfp_MutationTaster_pred",
    "dbnsfp_phastCons100way_vertebrate",
    "dbnsfp_Polyphen2_HVAR_pred",
    "primate_ai_score",
    "dbnsfp_REVEL_score",
    "dbnsfp_SIFT_pred",
    "splice_ai_delta_score",
];

/// All fields requested from the backend.
pub fn query_field_names() -> Vec<String> {
    let mut result: Vec<String> = CORE_FIELDS
        .iter()
        .chain(PREDICTION_FIELDS.iter())
        .chain(CLINVAR_FIELDS.iter())
        .chain(HGMD_FIELDS.iter())
        .map(|s| s.to_string())
        .collect();
    result.extend(
        [
            SORTED_TRANSCRIPTS_FIELD,
            GENOTYPES_FIELD,
            NUM_ALT_1_FIELD,
            NUM_ALT_2_FIELD,
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    let mut seen: BTreeSet<String> = result.iter().cloned().collect();
    for population in Population::iter() {
        for field in FreqField::iter() {
            for key in response_keys(population, field) {
                if seen.insert(key.clone()) {
                    result.push(key);
                }
            }
        }
    }
    result
}

fn as_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(values) => Some(
            values
                .iter()
                .map(|v| as_string(v).unwrap_or_default())
                .collect::<Vec<_>>()
                .join(","),
        ),
        value => Some(value.to_string()),
    }
}

fn as_i64(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|v| v as i64))
}

fn str_field(source: &Map<String, Value>, key: &str) -> Option<String> {
    source.get(key).and_then(as_string)
}

fn str_list(source: &Map<String, Value>, key: &str) -> Vec<String> {
    source
        .get(key)
        .and_then(Value::as_array)
        .map(|values| values.iter().filter_map(as_string).collect())
        .unwrap_or_default()
}

fn prediction(source: &Map<String, Value>, key: &str) -> Option<Prediction> {
    match source.get(key)? {
        Value::Number(n) => n.as_f64().map(Prediction::Score),
        Value::String(s) => Some(Prediction::Call(s.clone())),
        _ => None,
    }
}

fn parse_predictions(source: &Map<String, Value>) -> Predictions {
    Predictions {
        cadd: prediction(source, "cadd_PHRED"),
        dann: prediction(source, "dbnsfp_DANN_score"),
        eigen: prediction(source, "eigen_Eigen_phred"),
        fathmm: prediction(source, "dbnsfp_FATHMM_pred"),
        gerp_rs: prediction(source, "dbnsfp_GERP_RS"),
        mpc: prediction(source, "mpc_MPC"),
        metasvm: prediction(source, "dbnsfp_MetaSVM_pred"),
        mut_taster: prediction(source, "dbnsfp_MutationTaster_pred"),
        phastcons_100_vert: prediction(source, "dbnsfp_phastCons100way_vertebrate"),
        polyphen: prediction(source, "dbnsfp_Polyphen2_HVAR_pred"),
        primate_ai: prediction(source, "primate_ai_score"),
        revel: prediction(source, "dbnsfp_REVEL_score"),
        sift: prediction(source, "dbnsfp_SIFT_pred"),
        splice_ai: prediction(source, "splice_ai_delta_score"),
    }
}

fn parse_genotype(value: &Value) -> Option<Genotype> {
    let obj = value.as_object()?;
    Some(Genotype {
        ab: obj.get("ab").and_then(Value::as_f64),
        ad: obj.get("ad").and_then(as_string),
        dp: obj.get("dp").and_then(as_i64),
        gq: obj.get("gq").and_then(as_i64),
        pl: obj.get("pl").and_then(as_string),
        sample_id: obj.get("sample_id").and_then(as_string)?,
        num_alt: obj
            .get("num_alt")
            .and_then(as_i64)
            .map(|n| n as i32)
            .unwrap_or(-1),
    })
}

/// Converts hits of one search into variant records.
#[derive(Debug)]
pub struct HitParser<'a> {
    catalog: &'a SampleIndexCatalog,
    sort: &'a [SortSpec],
    liftover: &'a LazyLiftover,
}

impl<'a> HitParser<'a> {
    pub fn new(
        catalog: &'a SampleIndexCatalog,
        sort: &'a [SortSpec],
        liftover: &'a LazyLiftover,
    ) -> Self {
        Self {
            catalog,
            sort,
            liftover,
        }
    }

    /// Families a hit is relevant for, sorted.
    fn family_guids(&self, hit: &Hit) -> Vec<String> {
        let Some(family_samples) = self.catalog.family_samples(&hit.index) else {
            return Vec::new();
        };
        let families: BTreeSet<String> = match &hit.matched_queries {
            Some(names) => names
                .iter()
                .filter(|name| family_samples.contains_key(*name))
                .cloned()
                .collect(),
            None => {
                let alt_samples: BTreeSet<String> = [NUM_ALT_1_FIELD, NUM_ALT_2_FIELD]
                    .iter()
                    .flat_map(|field| str_list(&hit.source, field))
                    .collect();
                family_samples
                    .iter()
                    .filter(|(_, samples)| samples.keys().any(|id| alt_samples.contains(id)))
                    .map(|(family_guid, _)| family_guid.clone())
                    .collect()
            }
        };
        families.into_iter().collect()
    }

    fn populations(&self, hit: &Hit) -> EnumMap<Population, PopulationFreqs> {
        let existing_fields = self.catalog.metadata(&hit.index).map(|m| &m.fields);
        let read = |population: Population, field: FreqField| -> Option<Value> {
            let keys = response_keys(population, field);
            if let Some(key) = keys.iter().find(|key| hit.source.contains_key(*key)) {
                return Some(match hit.source.get(key) {
                    Some(Value::Null) | None => Value::from(0),
                    Some(value) => value.clone(),
                });
            }
            // Default to zero if the index knows the field.
            match existing_fields {
                Some(fields) if !fields.is_empty() => keys
                    .iter()
                    .any(|key| fields.contains(key))
                    .then(|| Value::from(0)),
                _ => Some(Value::from(0)),
            }
        };
        let int = |population, field| read(population, field).as_ref().and_then(as_i64);

        EnumMap::from_fn(|population| PopulationFreqs {
            af: read(population, FreqField::Af).and_then(|v| v.as_f64()),
            ac: int(population, FreqField::Ac),
            an: int(population, FreqField::An),
            hom: int(population, FreqField::Hom),
            hemi: int(population, FreqField::Hemi),
        })
    }

    /// Convert one hit.
    pub fn parse_hit(&self, hit: &Hit) -> Result<Variant, anyhow::Error> {
        let source = &hit.source;
        let variant_id = str_field(source, "variantId")
            .ok_or_else(|| anyhow::anyhow!("hit {} has no variantId", &hit.id))?;
        let chrom = str_field(source, "contig")
            .map(|c| c.trim_start_matches("chr").to_owned())
            .unwrap_or_default();
        let pos = source.get("start").and_then(as_i64).unwrap_or_default() as u64;
        let xpos = match source.get("xpos").and_then(as_i64) {
            Some(xpos) => xpos as u64,
            None => get_xpos(&chrom, pos)?,
        };

        let family_guids = self.family_guids(hit);
        let mut genotypes = std::collections::BTreeMap::new();
        if let Some(family_samples) = self.catalog.family_samples(&hit.index) {
            let raw_genotypes = source
                .get(GENOTYPES_FIELD)
                .and_then(Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            for family_guid in &family_guids {
                let Some(samples) = family_samples.get(family_guid) else {
                    continue;
                };
                for genotype in raw_genotypes.iter().filter_map(parse_genotype) {
                    if let Some(sample) = samples.get(&genotype.sample_id) {
                        genotypes.insert(sample.individual.guid.clone(), genotype);
                    }
                }
            }
        }

        let genome_version = self
            .catalog
            .metadata(&hit.index)
            .and_then(|m| m.genome_version)
            .unwrap_or_default();
        let lifted_over = if genome_version == GenomeRelease::Grch38 {
            self.liftover
                .get()
                .and_then(|liftover| liftover.convert(&chrom, pos))
        } else {
            None
        };

        let sorted_transcripts: Vec<Transcript> = source
            .get(SORTED_TRANSCRIPTS_FIELD)
            .and_then(Value::as_array)
            .map(|transcripts| {
                transcripts
                    .iter()
                    .filter_map(|t| match serde_json::from_value::<Transcript>(t.clone()) {
                        Ok(transcript) => Some(transcript),
                        Err(e) => {
                            tracing::trace!("skipping transcript of {}: {}", &variant_id, e);
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        let mut transcripts: indexmap::IndexMap<String, Vec<Transcript>> = Default::default();
        for transcript in &sorted_transcripts {
            transcripts
                .entry(transcript.gene_id.clone())
                .or_default()
                .push(transcript.clone());
        }

        Ok(Variant {
            variant_id,
            chrom,
            pos,
            reference: str_field(source, "ref").unwrap_or_default(),
            alt: str_field(source, "alt").unwrap_or_default(),
            xpos,
            rsid: str_field(source, "rsid"),
            genotype_filters: str_list(source, "filters").join(","),
            original_alt_alleles: str_list(source, "originalAltAlleles")
                .iter()
                .filter_map(|allele| allele.split('-').last().map(str::to_owned))
                .collect(),
            clinvar: ClinvarSummary {
                clinical_significance: str_field(source, "clinvar_clinical_significance"),
                variation_id: source.get("clinvar_variation_id").and_then(as_i64),
                allele_id: source.get("clinvar_allele_id").and_then(as_i64),
                gold_stars: source.get("clinvar_gold_stars").and_then(as_i64),
            },
            hgmd: HgmdSummary {
                accession: str_field(source, "hgmd_accession"),
                class: str_field(source, "hgmd_class"),
            },
            genotypes,
            family_guids,
            main_transcript: sorted_transcripts.first().cloned(),
            transcripts,
            populations: self.populations(hit),
            predictions: parse_predictions(source),
            genome_version,
            lifted_over_genome_version: lifted_over.as_ref().map(|_| GenomeRelease::Grch37),
            lifted_over_chrom: lifted_over.as_ref().map(|(chrom, _)| chrom.clone()),
            lifted_over_pos: lifted_over.as_ref().map(|(_, pos)| *pos),
            sort: normalize_sort_values(&hit.sort, self.sort),
            indices: [hit.index.clone()].into_iter().collect(),
        })
    }

    /// Convert hits, skipping and logging malformed ones.
    pub fn parse_hits(&self, hits: &[Hit]) -> Vec<Variant> {
        hits.iter()
            .filter_map(|hit| match self.parse_hit(hit) {
                Ok(variant) => Some(variant),
                Err(e) => {
                    tracing::warn!("skipping hit {} of {}: {}", &hit.id, &hit.index, e);
                    None
                }
            })
            .collect()
    }
}
