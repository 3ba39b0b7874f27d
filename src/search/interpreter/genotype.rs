use crate::search::{
    backend::dsl::Query,
    samples::{FamilySamples, SamplesById, Sex},
    schema::query::{
        AffectedStatus, GenotypeRequirement, InheritanceMode, InheritanceOverrides, QualityFilter,
    },
};

use super::quality;

pub const NO_CALL_FIELD: &str = "samples_no_call";
pub const NUM_ALT_1_FIELD: &str = "samples_num_alt_1";
pub const NUM_ALT_2_FIELD: &str = "samples_num_alt_2";
pub const CONTIG_FIELD: &str = "contig";

/// Predicate requiring `sample_id` to have the given genotype.
pub fn requirement_query(requirement: GenotypeRequirement, sample_id: &str) -> Query {
    let term = |field: &str| Query::term(field, sample_id);
    match requirement {
        GenotypeRequirement::RefRef => {
            !(term(NO_CALL_FIELD) | term(NUM_ALT_1_FIELD) | term(NUM_ALT_2_FIELD))
        }
        GenotypeRequirement::RefAlt => term(NUM_ALT_1_FIELD),
        GenotypeRequirement::AltAlt => term(NUM_ALT_2_FIELD),
        GenotypeRequirement::HasAlt => term(NUM_ALT_1_FIELD) | term(NUM_ALT_2_FIELD),
        GenotypeRequirement::HasRef => !(term(NO_CALL_FIELD) | term(NUM_ALT_2_FIELD)),
    }
}

/// Genotype the mode requires for an individual with the given affected status.
pub fn mode_template(
    mode: InheritanceMode,
    affected: AffectedStatus,
) -> Option<GenotypeRequirement> {
    use GenotypeRequirement::*;
    match (mode, affected) {
        (_, AffectedStatus::Unknown) => None,
        (
            InheritanceMode::Recessive
            | InheritanceMode::XLinkedRecessive
            | InheritanceMode::HomozygousRecessive,
            AffectedStatus::Affected,
        ) => Some(AltAlt),
        (InheritanceMode::CompoundHet, AffectedStatus::Affected) => Some(RefAlt),
        (InheritanceMode::DeNovo, AffectedStatus::Affected) => Some(HasAlt),
        (InheritanceMode::DeNovo, AffectedStatus::Unaffected) => Some(RefRef),
        (_, AffectedStatus::Unaffected) => Some(HasRef),
    }
}

/// Inheritance predicate of one family.
///
/// The effective requirement of an individual is its explicit override, else
/// the template of `mode` for its (possibly overridden) affected status.  In
/// the X-linked branch, the predicate is restricted to chromosome X and
/// unaffected males must be homozygous reference, regardless of overrides.
pub fn family_inheritance_filter(
    mode: Option<InheritanceMode>,
    overrides: &InheritanceOverrides,
    samples: &SamplesById,
    x_linked: bool,
) -> Query {
    let mut query = Query::MatchAll;
    if x_linked {
        query = query & Query::term(CONTIG_FIELD, "X");
    }

    for (sample_id, sample) in samples {
        let individual = &sample.individual;
        let affected = overrides
            .affected
            .get(&individual.guid)
            .copied()
            .unwrap_or(individual.affected);

        let requirement = if x_linked
            && affected == AffectedStatus::Unaffected
            && individual.sex == Sex::Male
        {
            Some(GenotypeRequirement::RefRef)
        } else {
            overrides
                .genotype
                .get(&individual.guid)
                .copied()
                .or_else(|| mode.and_then(|mode| mode_template(mode, affected)))
        };

        if let Some(requirement) = requirement {
            tracing::trace!(
                "sample {} of individual {} requires {}",
                sample_id,
                &individual.guid,
                requirement
            );
            query = query & requirement_query(requirement, sample_id);
        }
    }

    query
}

/// Predicate requiring at least one sample of the family to carry an alternative allele.
pub fn any_alt_filter(samples: &SamplesById) -> Query {
    let sample_ids: Vec<&str> = samples.keys().map(String::as_str).collect();
    Query::terms(NUM_ALT_1_FIELD, sample_ids.iter().copied())
        | Query::terms(NUM_ALT_2_FIELD, sample_ids.iter().copied())
}

/// Genotype predicate over all families of one index.
///
/// Each family predicate is named by the family GUID so that matching
/// families can be recovered from the backend response.  Families are
/// combined with OR.
pub fn genotype_filter(
    mode: Option<InheritanceMode>,
    overrides: &InheritanceOverrides,
    family_samples: &FamilySamples,
    quality_filter: &QualityFilter,
) -> Option<Query> {
    let constrained = mode.is_some() || !overrides.genotype.is_empty();

    Query::any_of(family_samples.iter().map(|(family_guid, samples)| {
        let family_q = if constrained {
            match mode {
                Some(InheritanceMode::Recessive) => {
                    family_inheritance_filter(mode, overrides, samples, false)
                        | family_inheritance_filter(
                            Some(InheritanceMode::XLinkedRecessive),
                            overrides,
                            samples,
                            true,
                        )
                }
                Some(InheritanceMode::XLinkedRecessive) => {
                    family_inheritance_filter(mode, overrides, samples, true)
                }
                _ => family_inheritance_filter(mode, overrides, samples, false),
            }
        } else {
            any_alt_filter(samples)
        };

        let mut must = vec![family_q];
        if let Some(quality_q) = quality::family_filter(quality_filter, samples) {
            must.push(quality_q);
        }
        Query::named(family_guid, must)
    }))
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::search::backend::memory::{evaluate, evaluate_named};
    use crate::search::samples::test::sample;

    /// Trio with affected index S1 (male), unaffected father S2, unaffected mother S3.
    fn trio() -> SamplesById {
        BTreeMap::from([
            (
                "S1".to_string(),
                sample("S1", "I1", "F1", AffectedStatus::Affected, Sex::Male, "idx"),
            ),
            (
                "S2".to_string(),
                sample("S2", "I2", "F1", AffectedStatus::Unaffected, Sex::Male, "idx"),
            ),
            (
                "S3".to_string(),
                sample("S3", "I3", "F1", AffectedStatus::Unaffected, Sex::Female, "idx"),
            ),
        ])
    }

    fn doc(contig: &str, no_call: &[&str], het: &[&str], hom: &[&str]) -> serde_json::Value {
        json!({
            "contig": contig,
            "samples_no_call": no_call,
            "samples_num_alt_1": het,
            "samples_num_alt_2": hom,
        })
    }

    #[rstest]
    #[case(GenotypeRequirement::RefRef, &[], &[], &[], true)]
    #[case(GenotypeRequirement::RefRef, &["S1"], &[], &[], false)]
    #[case(GenotypeRequirement::RefRef, &[], &["S1"], &[], false)]
    #[case(GenotypeRequirement::RefAlt, &[], &["S1"], &[], true)]
    #[case(GenotypeRequirement::RefAlt, &[], &[], &["S1"], false)]
    #[case(GenotypeRequirement::AltAlt, &[], &[], &["S1"], true)]
    #[case(GenotypeRequirement::HasAlt, &[], &["S1"], &[], true)]
    #[case(GenotypeRequirement::HasAlt, &[], &[], &["S1"], true)]
    #[case(GenotypeRequirement::HasAlt, &[], &[], &[], false)]
    #[case(GenotypeRequirement::HasRef, &[], &["S1"], &[], true)]
    #[case(GenotypeRequirement::HasRef, &[], &[], &[], true)]
    #[case(GenotypeRequirement::HasRef, &["S1"], &[], &[], false)]
    #[case(GenotypeRequirement::HasRef, &[], &[], &["S1"], false)]
    fn requirement_matches(
        #[case] requirement: GenotypeRequirement,
        #[case] no_call: &[&str],
        #[case] het: &[&str],
        #[case] hom: &[&str],
        #[case] expected: bool,
    ) {
        let q = requirement_query(requirement, "S1");
        let d = doc("1", no_call, het, hom);
        assert_eq!(evaluate(&q, d.as_object().unwrap()), expected);
    }

    #[rstest]
    #[case(InheritanceMode::Recessive, AffectedStatus::Affected, Some(GenotypeRequirement::AltAlt))]
    #[case(InheritanceMode::Recessive, AffectedStatus::Unaffected, Some(GenotypeRequirement::HasRef))]
    #[case(InheritanceMode::CompoundHet, AffectedStatus::Affected, Some(GenotypeRequirement::RefAlt))]
    #[case(InheritanceMode::CompoundHet, AffectedStatus::Unaffected, Some(GenotypeRequirement::HasRef))]
    #[case(InheritanceMode::DeNovo, AffectedStatus::Affected, Some(GenotypeRequirement::HasAlt))]
    #[case(InheritanceMode::DeNovo, AffectedStatus::Unaffected, Some(GenotypeRequirement::RefRef))]
    #[case(InheritanceMode::DeNovo, AffectedStatus::Unknown, None)]
    fn templates(
        #[case] mode: InheritanceMode,
        #[case] affected: AffectedStatus,
        #[case] expected: Option<GenotypeRequirement>,
    ) {
        assert_eq!(mode_template(mode, affected), expected);
    }

    #[rstest]
    // autosomal hom. recessive
    #[case(InheritanceMode::Recessive, "1", &[], &["S2", "S3"], &["S1"], true)]
    // father hom. alt fails
    #[case(InheritanceMode::Recessive, "1", &[], &["S3"], &["S1", "S2"], false)]
    // X-linked: carrier mother, hemizygous index, reference father
    #[case(InheritanceMode::Recessive, "X", &[], &["S3"], &["S1"], true)]
    #[case(InheritanceMode::XLinkedRecessive, "X", &[], &["S3"], &["S1"], true)]
    // X-linked: unaffected father must not carry the variant
    #[case(InheritanceMode::XLinkedRecessive, "X", &[], &["S2", "S3"], &["S1"], false)]
    // X-linked only applies to chromosome X
    #[case(InheritanceMode::XLinkedRecessive, "1", &[], &["S3"], &["S1"], false)]
    // no-call father fails both branches
    #[case(InheritanceMode::Recessive, "X", &["S2"], &["S3"], &["S1"], false)]
    fn recessive_family(
        #[case] mode: InheritanceMode,
        #[case] contig: &str,
        #[case] no_call: &[&str],
        #[case] het: &[&str],
        #[case] hom: &[&str],
        #[case] expected: bool,
    ) {
        let q = genotype_filter(
            Some(mode),
            &InheritanceOverrides::default(),
            &BTreeMap::from([("F1".to_string(), trio())]),
            &QualityFilter::default(),
        )
        .unwrap();
        let d = doc(contig, no_call, het, hom);
        assert_eq!(evaluate(&q, d.as_object().unwrap()), expected);
    }

    #[test]
    fn x_linked_unaffected_male_forced_to_ref_despite_override() {
        let overrides = InheritanceOverrides {
            genotype: BTreeMap::from([("I2".to_string(), GenotypeRequirement::HasAlt)]),
            affected: BTreeMap::new(),
        };
        let families = BTreeMap::from([("F1".to_string(), trio())]);
        let q = genotype_filter(
            Some(InheritanceMode::XLinkedRecessive),
            &overrides,
            &families,
            &QualityFilter::default(),
        )
        .unwrap();

        // Father carries the variant on X: excluded even though the override asks for it.
        let d = doc("X", &[], &["S2", "S3"], &["S1"]);
        assert!(!evaluate(&q, d.as_object().unwrap()));
        let d = doc("X", &[], &["S3"], &["S1"]);
        assert!(evaluate(&q, d.as_object().unwrap()));

        // The autosomal branch of the recessive mode honors the override.
        let q = genotype_filter(
            Some(InheritanceMode::Recessive),
            &overrides,
            &families,
            &QualityFilter::default(),
        )
        .unwrap();
        let d = doc("1", &[], &["S3"], &["S1", "S2"]);
        assert!(evaluate(&q, d.as_object().unwrap()));
        let d = doc("1", &[], &["S3"], &["S1"]);
        assert!(!evaluate(&q, d.as_object().unwrap()));
    }

    #[test]
    fn affected_override_changes_template() {
        let overrides = InheritanceOverrides {
            genotype: BTreeMap::new(),
            affected: BTreeMap::from([("I2".to_string(), AffectedStatus::Affected)]),
        };
        let q = genotype_filter(
            Some(InheritanceMode::DeNovo),
            &overrides,
            &BTreeMap::from([("F1".to_string(), trio())]),
            &QualityFilter::default(),
        )
        .unwrap();

        let d = doc("1", &[], &["S1", "S2"], &[]);
        assert!(evaluate(&q, d.as_object().unwrap()));
        let d = doc("1", &[], &["S1"], &[]);
        assert!(!evaluate(&q, d.as_object().unwrap()));
    }

    #[test]
    fn no_inheritance_requires_alt_carrier_and_names_families() {
        let mut other = BTreeMap::new();
        other.insert(
            "S4".to_string(),
            sample("S4", "I4", "F2", AffectedStatus::Affected, Sex::Female, "idx"),
        );
        let families = BTreeMap::from([("F1".to_string(), trio()), ("F2".to_string(), other)]);
        let q = genotype_filter(
            None,
            &InheritanceOverrides::default(),
            &families,
            &QualityFilter::default(),
        )
        .unwrap();

        let d = doc("1", &[], &["S4"], &[]);
        let d = d.as_object().unwrap();
        assert!(evaluate(&q, d));
        assert_eq!(evaluate_named(&q, d), vec!["F2".to_string()]);

        let d = doc("1", &["S1"], &[], &[]);
        assert!(!evaluate(&q, d.as_object().unwrap()));
    }

    #[test]
    fn quality_is_added_per_family() {
        let q = genotype_filter(
            Some(InheritanceMode::DeNovo),
            &InheritanceOverrides::default(),
            &BTreeMap::from([("F1".to_string(), trio())]),
            &QualityFilter {
                min_ab: 0,
                min_gq: 20,
                vcf_filter: None,
            },
        )
        .unwrap();

        let d = json!({"samples_num_alt_1": ["S1"]});
        assert!(evaluate(&q, d.as_object().unwrap()));
        let d = json!({"samples_num_alt_1": ["S1"], "samples_gq_10_to_15": ["S3"]});
        assert!(!evaluate(&q, d.as_object().unwrap()));
    }

    #[test]
    fn genotype_filter_is_pure() {
        let families = BTreeMap::from([("F1".to_string(), trio())]);
        let build = || {
            genotype_filter(
                Some(InheritanceMode::Recessive),
                &InheritanceOverrides::default(),
                &families,
                &QualityFilter {
                    min_ab: 10,
                    min_gq: 5,
                    vcf_filter: None,
                },
            )
        };
        assert_eq!(build(), build());
    }
}
