//! Compilation of a `SearchFilter` into backend predicates.
//!
//! The result is a `QueryPlan`: one base predicate shared by all indices and,
//! per index, the list of searches (plain hits or compound heterozygous
//! aggregation) to run on top of it.

pub mod clinvar;
pub mod consequences;
pub mod frequency;
pub mod genotype;
pub mod locus;
pub mod quality;

use std::collections::{BTreeMap, BTreeSet};

use crate::err::SearchError;

use super::{
    backend::dsl::Query,
    reference::GeneLookup,
    samples::SampleIndexCatalog,
    schema::query::{InheritanceMode, SearchFilter},
};

/// One search to run against an index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSearch {
    /// Full predicate, including the base predicate.
    pub query: Query,
    /// Whether hits are bucketed by gene for compound heterozygous detection.
    pub compound_het: bool,
}

/// Compiled search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryPlan {
    /// Predicate shared by all indices.
    pub base: Query,
    /// Searches per index; indices without entry are searched with `base`.
    pub index_searches: BTreeMap<String, Vec<IndexSearch>>,
    /// Consequences requested by the annotation filter, empty if none.
    pub allowed_consequences: BTreeSet<String>,
}

impl QueryPlan {
    /// Plan running `base` on all indices.
    pub fn with_base(base: Query) -> Self {
        Self {
            base,
            ..Default::default()
        }
    }

    /// Searches for `index`, the base predicate if the index has no dedicated ones.
    pub fn searches_for(&self, index: &str) -> Vec<IndexSearch> {
        match self.index_searches.get(index) {
            Some(searches) => searches.clone(),
            None => vec![IndexSearch {
                query: self.base.clone(),
                compound_het: false,
            }],
        }
    }
}

/// Compile the sample-independent base predicate.
fn compile_base(
    filter: &SearchFilter,
    genes: &dyn GeneLookup,
) -> Result<(Query, BTreeSet<String>), SearchError> {
    let mut base = Query::MatchAll;

    if let Some(locus_filter) = &filter.locus {
        let resolved = locus::resolve(locus_filter, genes)?;
        if let Some(q) = locus::filter(&resolved)? {
            base = base & q;
        }
    }

    // Annotations and pathogenicity are alternatives.
    let pathogenicity_q = clinvar::filter(&filter.pathogenicity);
    let mut allowed_consequences = BTreeSet::new();
    match consequences::filter(&filter.annotations) {
        Some(consequence_filter) => {
            let q = match pathogenicity_q {
                Some(pathogenicity_q) => consequence_filter.query | pathogenicity_q,
                None => consequence_filter.query,
            };
            base = base & q;
            allowed_consequences = consequence_filter.allowed_consequences;
        }
        None => {
            if let Some(q) = pathogenicity_q {
                base = base & q;
            }
        }
    }

    if let Some(q) = frequency::filter(&filter.freqs) {
        base = base & q;
    }
    if let Some(q) = quality::vcf_filter(&filter.quality_filter) {
        base = base & q;
    }

    Ok((base, allowed_consequences))
}

/// Compile `filter` for the indices of `catalog`.
///
/// `has_grouped_results` suppresses the compound heterozygous aggregation
/// searches when grouped results are already cached.  Compilation is pure:
/// the same inputs always yield the same plan.
pub fn compile(
    filter: &SearchFilter,
    catalog: &SampleIndexCatalog,
    genes: &dyn GeneLookup,
    has_grouped_results: bool,
) -> Result<QueryPlan, SearchError> {
    filter.validate()?;
    let (base, allowed_consequences) = compile_base(filter, genes)?;

    let inheritance = &filter.inheritance;
    let mode = inheritance.mode;
    let quality_filter = &filter.quality_filter;

    let mut index_searches = BTreeMap::new();
    for (index, family_samples) in catalog.iter() {
        if !inheritance.is_constrained()
            && !quality_filter.has_thresholds()
            && catalog.covers_index(index)
        {
            tracing::debug!("searching all samples of {}, no genotype filter", index);
            continue;
        }

        let genotypes_q =
            genotype::genotype_filter(mode, &inheritance.filter, family_samples, quality_filter);

        let mut searches = Vec::new();
        let mut compound_het_q = None;
        if mode == Some(InheritanceMode::CompoundHet) {
            compound_het_q = genotypes_q;
        } else {
            searches.push(IndexSearch {
                query: base.clone() & genotypes_q.unwrap_or_default(),
                compound_het: false,
            });
        }
        if mode == Some(InheritanceMode::Recessive) {
            compound_het_q = genotype::genotype_filter(
                Some(InheritanceMode::CompoundHet),
                &inheritance.filter,
                family_samples,
                quality_filter,
            );
        }

        if let Some(compound_het_q) = compound_het_q {
            if !has_grouped_results {
                searches.push(IndexSearch {
                    query: base.clone() & compound_het_q,
                    compound_het: true,
                });
            }
        }
        index_searches.insert(index.clone(), searches);
    }

    Ok(QueryPlan {
        base,
        index_searches,
        allowed_consequences,
    })
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;
    use crate::common::GenomeRelease;
    use crate::search::reference::ReferenceData;
    use crate::search::samples::test::{metadata, sample};
    use crate::search::samples::{FamilySamples, Sex};
    use crate::search::schema::query::{
        AffectedStatus, ClinvarBucket, GenotypeRequirement, LocusFilter, PathogenicityFilter,
        QualityFilter,
    };

    /// Catalog with two indices; `idx1` is fully searched, `idx2` is not.
    fn catalog() -> SampleIndexCatalog {
        let families = |index: &str, family: &str, samples: &[(&str, &str, AffectedStatus)]| {
            let samples = samples
                .iter()
                .map(|(sample_id, individual, affected)| {
                    (
                        sample_id.to_string(),
                        sample(sample_id, individual, family, *affected, Sex::Female, index),
                    )
                })
                .collect();
            FamilySamples::from([(family.to_string(), samples)])
        };
        SampleIndexCatalog::from_parts(
            BTreeMap::from([
                (
                    "idx1".to_string(),
                    families(
                        "idx1",
                        "F1",
                        &[
                            ("S1", "I1", AffectedStatus::Affected),
                            ("S2", "I2", AffectedStatus::Unaffected),
                        ],
                    ),
                ),
                (
                    "idx2".to_string(),
                    families("idx2", "F2", &[("S3", "I3", AffectedStatus::Affected)]),
                ),
            ]),
            BTreeMap::from([
                ("idx1".to_string(), metadata(GenomeRelease::Grch37)),
                ("idx2".to_string(), metadata(GenomeRelease::Grch37)),
            ]),
            BTreeMap::from([("idx1".to_string(), 2), ("idx2".to_string(), 10)]),
        )
    }

    fn reference() -> ReferenceData {
        ReferenceData::from_genes(vec![("ENSG00000012048".into(), "BRCA1".into())])
    }

    fn with_mode(mode: Option<InheritanceMode>) -> SearchFilter {
        let mut filter = SearchFilter::default();
        filter.inheritance.mode = mode;
        filter
    }

    #[test]
    fn empty_filter() -> Result<(), anyhow::Error> {
        let plan = compile(&SearchFilter::default(), &catalog(), &reference(), false)?;
        assert_eq!(plan.base, Query::MatchAll);
        // idx1 is fully covered and skipped, idx2 needs an explicit genotype filter.
        assert_eq!(
            plan.index_searches.keys().collect::<Vec<_>>(),
            vec!["idx2"]
        );
        assert_eq!(plan.searches_for("idx1").len(), 1);

        Ok(())
    }

    #[rstest]
    #[case(None, false, &[false])]
    #[case(Some(InheritanceMode::DeNovo), false, &[false])]
    #[case(Some(InheritanceMode::CompoundHet), false, &[true])]
    #[case(Some(InheritanceMode::CompoundHet), true, &[])]
    #[case(Some(InheritanceMode::Recessive), false, &[false, true])]
    #[case(Some(InheritanceMode::Recessive), true, &[false])]
    fn searches_per_mode(
        #[case] mode: Option<InheritanceMode>,
        #[case] has_grouped_results: bool,
        #[case] expected: &[bool],
    ) -> Result<(), anyhow::Error> {
        let mut filter = with_mode(mode);
        filter.quality_filter = QualityFilter {
            min_gq: 10,
            ..Default::default()
        };
        let plan = compile(&filter, &catalog(), &reference(), has_grouped_results)?;
        let searches = plan.searches_for("idx1");
        assert_eq!(
            searches.iter().map(|s| s.compound_het).collect::<Vec<_>>(),
            expected.to_vec()
        );

        Ok(())
    }

    #[test]
    fn annotations_or_pathogenicity() -> Result<(), anyhow::Error> {
        let mut filter = SearchFilter::default();
        filter.annotations.insert(
            "missense".to_string(),
            vec!["missense_variant".to_string()],
        );
        filter.pathogenicity = PathogenicityFilter {
            clinvar: vec![ClinvarBucket::Pathogenic],
            hgmd: vec![],
        };
        let plan = compile(&filter, &catalog(), &reference(), false)?;
        assert_eq!(
            plan.base,
            Query::terms(consequences::CONSEQUENCE_TERMS_FIELD, ["missense_variant"])
                | Query::terms(
                    clinvar::CLINVAR_SIGNIFICANCE_FIELD,
                    ["Pathogenic", "Pathogenic/Likely_pathogenic"]
                )
        );
        assert_eq!(
            plan.allowed_consequences,
            BTreeSet::from(["missense_variant".to_string()])
        );

        filter.annotations.clear();
        let plan = compile(&filter, &catalog(), &reference(), false)?;
        assert_eq!(
            plan.base,
            Query::terms(
                clinvar::CLINVAR_SIGNIFICANCE_FIELD,
                ["Pathogenic", "Pathogenic/Likely_pathogenic"]
            )
        );
        assert!(plan.allowed_consequences.is_empty());

        Ok(())
    }

    #[test]
    fn genotype_override_constrains_all_indices() -> Result<(), anyhow::Error> {
        let mut filter = SearchFilter::default();
        filter
            .inheritance
            .filter
            .genotype
            .insert("I1".into(), GenotypeRequirement::AltAlt);
        let plan = compile(&filter, &catalog(), &reference(), false)?;
        assert_eq!(
            plan.index_searches.keys().collect::<Vec<_>>(),
            vec!["idx1", "idx2"]
        );

        Ok(())
    }

    #[test]
    fn invalid_inputs() {
        let mut filter = SearchFilter::default();
        filter.quality_filter.min_ab = 7;
        assert_eq!(
            compile(&filter, &catalog(), &reference(), false)
                .unwrap_err()
                .to_string(),
            "Invalid ab filter 7"
        );

        let filter = SearchFilter {
            locus: Some(LocusFilter {
                raw_items: "NOTAGENE".into(),
                exclude_locations: false,
            }),
            ..Default::default()
        };
        assert_eq!(
            compile(&filter, &catalog(), &reference(), false)
                .unwrap_err()
                .to_string(),
            "Invalid genes/intervals: NOTAGENE"
        );
    }

    #[test]
    fn compile_is_pure() -> Result<(), anyhow::Error> {
        let mut filter = with_mode(Some(InheritanceMode::Recessive));
        filter.locus = Some(LocusFilter {
            raw_items: "BRCA1 1:100-200".into(),
            exclude_locations: true,
        });
        filter.quality_filter = QualityFilter {
            min_ab: 20,
            min_gq: 15,
            vcf_filter: Some(crate::search::schema::query::VcfFilter::Pass),
        };
        let lhs = compile(&filter, &catalog(), &reference(), false)?;
        let rhs = compile(&filter, &catalog(), &reference(), false)?;
        assert_eq!(lhs, rhs);

        Ok(())
    }
}
