use crate::search::{
    backend::dsl::Query,
    samples::SamplesById,
    schema::query::{QualityFilter, VcfFilter},
};

use super::genotype::NUM_ALT_1_FIELD;

/// Width of the discretized allele balance and genotype quality buckets.
const BUCKET_WIDTH: u32 = 5;

/// Disjunction over the `{prefix}_{i}_to_{i+5}` buckets below `threshold`.
fn below_threshold(prefix: &str, threshold: u32, sample_id: &str) -> Option<Query> {
    Query::any_of(
        (0..threshold)
            .step_by(BUCKET_WIDTH as usize)
            .map(|i| Query::term(&format!("{}_{}_to_{}", prefix, i, i + BUCKET_WIDTH), sample_id)),
    )
}

/// Quality predicate of one sample, `None` without thresholds.
pub fn sample_filter(quality: &QualityFilter, sample_id: &str) -> Option<Query> {
    let mut query = Query::MatchAll;
    if let Some(low_ab) = below_threshold("samples_ab", quality.min_ab, sample_id) {
        // Allele balance is only meaningful for heterozygous calls.
        query = query & (!low_ab | !Query::term(NUM_ALT_1_FIELD, sample_id));
    }
    if let Some(low_gq) = below_threshold("samples_gq", quality.min_gq, sample_id) {
        query = query & !low_gq;
    }
    (query != Query::MatchAll).then_some(query)
}

/// Conjunction of the quality predicates of all samples of a family.
pub fn family_filter(quality: &QualityFilter, samples: &SamplesById) -> Option<Query> {
    if !quality.has_thresholds() {
        return None;
    }
    samples
        .keys()
        .filter_map(|sample_id| sample_filter(quality, sample_id))
        .reduce(|lhs, rhs| lhs & rhs)
}

/// Predicate excluding records with failing VCF filters.
pub fn vcf_filter(quality: &QualityFilter) -> Option<Query> {
    match quality.vcf_filter {
        Some(VcfFilter::Pass) => Some(!Query::exists("filters")),
        None => None,
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    use super::*;
    use crate::search::backend::memory::evaluate;

    fn quality(min_ab: u32, min_gq: u32) -> QualityFilter {
        QualityFilter {
            min_ab,
            min_gq,
            vcf_filter: None,
        }
    }

    #[test]
    fn no_thresholds() {
        assert_eq!(sample_filter(&quality(0, 0), "S1"), None);
        assert_eq!(family_filter(&quality(0, 0), &SamplesById::new()), None);
    }

    #[test]
    fn bucket_terms() {
        assert_eq!(
            sample_filter(&quality(0, 10), "S1"),
            Some(!(Query::term("samples_gq_0_to_5", "S1") | Query::term("samples_gq_5_to_10", "S1")))
        );
    }

    #[rstest]
    // het with low ab fails
    #[case(20, 0, json!({"samples_num_alt_1": ["S1"], "samples_ab_15_to_20": ["S1"]}), false)]
    // het with sufficient ab passes
    #[case(20, 0, json!({"samples_num_alt_1": ["S1"], "samples_ab_20_to_25": ["S1"]}), true)]
    // hom alt with low ab is exempt
    #[case(20, 0, json!({"samples_num_alt_2": ["S1"], "samples_ab_0_to_5": ["S1"]}), true)]
    // low ab of other sample is irrelevant
    #[case(20, 0, json!({"samples_num_alt_1": ["S1"], "samples_ab_0_to_5": ["S2"]}), true)]
    // low gq fails regardless of genotype
    #[case(0, 10, json!({"samples_num_alt_2": ["S1"], "samples_gq_5_to_10": ["S1"]}), false)]
    #[case(0, 10, json!({"samples_gq_5_to_10": ["S1"]}), false)]
    #[case(0, 10, json!({"samples_gq_10_to_15": ["S1"]}), true)]
    fn sample_filter_matches(
        #[case] min_ab: u32,
        #[case] min_gq: u32,
        #[case] doc: serde_json::Value,
        #[case] expected: bool,
    ) {
        let q = sample_filter(&quality(min_ab, min_gq), "S1").unwrap();
        assert_eq!(evaluate(&q, doc.as_object().unwrap()), expected);
    }

    #[test]
    fn vcf_filter_pass() {
        let mut q = quality(0, 0);
        assert_eq!(vcf_filter(&q), None);
        q.vcf_filter = Some(VcfFilter::Pass);
        let filter = vcf_filter(&q).unwrap();
        assert!(evaluate(&filter, json!({}).as_object().unwrap()));
        assert!(!evaluate(
            &filter,
            json!({"filters": ["LowQual"]}).as_object().unwrap()
        ));
    }
}
