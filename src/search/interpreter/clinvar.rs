use std::collections::BTreeSet;

use crate::search::{
    backend::dsl::Query,
    schema::query::{ClinvarBucket, HgmdBucket, PathogenicityFilter},
};

pub const CLINVAR_SIGNIFICANCE_FIELD: &str = "clinvar_clinical_significance";
pub const HGMD_CLASS_FIELD: &str = "hgmd_class";

/// Backend clinical significance values of a ClinVar bucket.
pub fn clinvar_significances(bucket: ClinvarBucket) -> &'static [&'static str] {
    match bucket {
        ClinvarBucket::Pathogenic => &["Pathogenic", "Pathogenic/Likely_pathogenic"],
        ClinvarBucket::LikelyPathogenic => &["Likely_pathogenic", "Pathogenic/Likely_pathogenic"],
        ClinvarBucket::Benign => &["Benign", "Benign/Likely_benign"],
        ClinvarBucket::LikelyBenign => &["Likely_benign", "Benign/Likely_benign"],
        ClinvarBucket::VusOrConflicting => &[
            "Conflicting_interpretations_of_pathogenicity",
            "Uncertain_significance",
            "not_provided",
            "other",
        ],
    }
}

/// Backend class values of an HGMD bucket.
pub fn hgmd_classes(bucket: HgmdBucket) -> &'static [&'static str] {
    match bucket {
        HgmdBucket::DiseaseCausing => &["DM"],
        HgmdBucket::LikelyDiseaseCausing => &["DM?"],
        HgmdBucket::HgmdOther => &["DP", "DFP", "FP", "FTV"],
    }
}

/// Build the pathogenicity predicate, `None` if no buckets were selected.
pub fn filter(pathogenicity: &PathogenicityFilter) -> Option<Query> {
    let clinvar_q = (!pathogenicity.clinvar.is_empty()).then(|| {
        let values: BTreeSet<&str> = pathogenicity
            .clinvar
            .iter()
            .flat_map(|bucket| clinvar_significances(*bucket).iter().copied())
            .collect();
        Query::terms(CLINVAR_SIGNIFICANCE_FIELD, values)
    });
    let hgmd_q = (!pathogenicity.hgmd.is_empty()).then(|| {
        let values: BTreeSet<&str> = pathogenicity
            .hgmd
            .iter()
            .flat_map(|bucket| hgmd_classes(*bucket).iter().copied())
            .collect();
        Query::terms(HGMD_CLASS_FIELD, values)
    });

    Query::any_of(clinvar_q.into_iter().chain(hgmd_q))
}
