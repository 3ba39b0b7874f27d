//! Grouping of per-gene aggregation buckets into compound heterozygous groups.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;
use thousands::Separable;

use crate::err::SearchError;

use super::backend::GeneBucket;
use super::output::HitParser;
use super::schema::data::{cmp_sort_keys, Variant, VariantGroup};

/// Error message if there are too many gene buckets.
pub const TOO_MANY_COMPOUND_HETS: &str =
    "This search returned too many compound heterozygous variants. Please add stricter filters";

/// Whether any transcript of `gene_id` has one of the allowed consequences.
///
/// An empty allow list accepts all variants.
fn has_allowed_consequence(
    variant: &Variant,
    gene_id: &str,
    allowed_consequences: &BTreeSet<String>,
) -> bool {
    allowed_consequences.is_empty()
        || variant.gene_transcripts(gene_id).iter().any(|transcript| {
            transcript
                .major_consequence
                .as_ref()
                .map(|c| allowed_consequences.contains(c))
                .unwrap_or_default()
        })
}

/// Families for which the variants form a valid compound heterozygous pair.
///
/// Each unaffected individual must not be heterozygous for at least one of
/// the variants; a missing genotype does not count as heterozygous.
fn valid_families(
    variants: &[Variant],
    unaffected_by_family: &BTreeMap<String, BTreeSet<String>>,
) -> BTreeSet<String> {
    let Some((first, rest)) = variants.split_first() else {
        return BTreeSet::new();
    };
    let mut families: BTreeSet<String> = first.family_guids.iter().cloned().collect();
    for variant in rest {
        let other: BTreeSet<&String> = variant.family_guids.iter().collect();
        families.retain(|family_guid| other.contains(family_guid));
    }

    families.retain(|family_guid| {
        unaffected_by_family
            .get(family_guid)
            .map(|unaffected| {
                unaffected.iter().all(|individual_guid| {
                    variants.iter().any(|variant| {
                        variant
                            .genotypes
                            .get(individual_guid)
                            .map(|gt| gt.num_alt)
                            != Some(1)
                    })
                })
            })
            .unwrap_or(true)
    });
    families
}

/// Compound heterozygous groups of one index with their variant count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompoundHetGroups {
    pub groups: Vec<VariantGroup>,
    pub total: usize,
}

/// Turn the gene buckets of one index into compound heterozygous groups.
pub fn group_buckets(
    buckets: &[GeneBucket],
    parser: &HitParser,
    unaffected_by_family: &BTreeMap<String, BTreeSet<String>>,
    allowed_consequences: &BTreeSet<String>,
    max_genes: usize,
) -> Result<CompoundHetGroups, SearchError> {
    if buckets.len() > max_genes {
        return Err(SearchError::InvalidFilter(TOO_MANY_COMPOUND_HETS.to_string()));
    }

    let mut variants_by_gene: IndexMap<String, Vec<Variant>> = IndexMap::new();
    for bucket in buckets {
        let mut gene_id = bucket.key.clone();
        if variants_by_gene.contains_key(&gene_id) {
            continue;
        }

        let variants: Vec<Variant> = parser
            .parse_hits(&bucket.hits)
            .into_iter()
            .filter(|variant| has_allowed_consequence(variant, &gene_id, allowed_consequences))
            .collect();
        if variants.len() < 2 {
            continue;
        }

        let primary_genes: Vec<Option<&str>> =
            variants.iter().map(|variant| variant.main_gene_id()).collect();
        if primary_genes.iter().any(|gene| *gene != Some(gene_id.as_str())) {
            let shared_gene = primary_genes[0].filter(|first| {
                primary_genes.iter().all(|gene| *gene == Some(*first))
            });
            if let Some(shared_gene) = shared_gene {
                let is_valid_gene = variants.iter().all(|variant| {
                    has_allowed_consequence(variant, shared_gene, allowed_consequences)
                });
                if is_valid_gene {
                    gene_id = shared_gene.to_owned();
                    if variants_by_gene.contains_key(&gene_id) {
                        continue;
                    }
                }
            } else {
                let variant_ids: Vec<&str> =
                    variants.iter().map(|v| v.variant_id.as_str()).collect();
                let is_recorded = primary_genes.iter().flatten().any(|gene| {
                    variants_by_gene.get(*gene).map(|recorded| {
                        recorded
                            .iter()
                            .map(|v| v.variant_id.as_str())
                            .eq(variant_ids.iter().copied())
                    }) == Some(true)
                });
                if is_recorded {
                    continue;
                }
            }
        }

        let families = valid_families(&variants, unaffected_by_family);
        if families.is_empty() {
            tracing::trace!("no family with compound het in gene {}", &gene_id);
            continue;
        }
        let family_guids: Vec<String> = families.into_iter().collect();
        let variants = variants
            .into_iter()
            .map(|mut variant| {
                variant.family_guids = family_guids.clone();
                variant
            })
            .collect();

        variants_by_gene.insert(gene_id, variants);
    }

    let total: usize = variants_by_gene.values().map(Vec::len).sum();
    tracing::info!("Total compound het hits: {}", total.separate_with_commas());

    Ok(CompoundHetGroups {
        groups: variants_by_gene
            .into_iter()
            .map(|(gene_id, variants)| VariantGroup {
                gene_id: Some(gene_id),
                variants,
            })
            .collect(),
        total,
    })
}

/// Merge groups of the same gene coming from different indices.
///
/// Returns the merged groups and the number of duplicate records.
pub fn merge_groups(groups: Vec<VariantGroup>) -> (Vec<VariantGroup>, usize) {
    let mut duplicates = 0;
    let mut result: IndexMap<Option<String>, Vec<Variant>> = IndexMap::new();
    for group in groups {
        let Some(existing) = result.get_mut(&group.gene_id) else {
            result.insert(group.gene_id, group.variants);
            continue;
        };
        for variant in group.variants {
            match existing
                .iter_mut()
                .find(|e| e.variant_id == variant.variant_id)
            {
                Some(e) => {
                    if e.merge(&variant) {
                        duplicates += 1;
                    }
                }
                None => existing.push(variant),
            }
        }
    }

    (
        result
            .into_iter()
            .map(|(gene_id, variants)| VariantGroup { gene_id, variants })
            .collect(),
        duplicates,
    )
}

/// Sort groups by the sort key of their first variant.
pub fn sort_groups(groups: &mut [VariantGroup]) {
    groups.sort_by(|lhs, rhs| cmp_sort_keys(lhs.sort_key(), rhs.sort_key()));
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    use super::*;
    use crate::common::GenomeRelease;
    use crate::search::backend::dsl::SortSpec;
    use crate::search::backend::Hit;
    use crate::search::liftover::LazyLiftover;
    use crate::search::output::test::catalog;
    use crate::search::schema::data::test::variant;

    /// Hit in index `idx` for family F1 (samples S1 and S2).
    fn hit(variant_id: &str, genes: &[(&str, &str)], s2_num_alt: i64) -> Hit {
        let parts: Vec<&str> = variant_id.split('-').collect();
        let pos: u64 = parts[1].parse().unwrap();
        let transcripts: Vec<Value> = genes
            .iter()
            .map(|(gene_id, consequence)| {
                json!({"gene_id": gene_id, "major_consequence": consequence})
            })
            .collect();
        Hit {
            index: "idx".into(),
            id: variant_id.into(),
            source: json!({
                "variantId": variant_id,
                "contig": parts[0],
                "start": pos,
                "ref": parts[2],
                "alt": parts[3],
                "sortedTranscriptConsequences": transcripts,
                "genotypes": [
                    {"sample_id": "S1", "num_alt": 1},
                    {"sample_id": "S2", "num_alt": s2_num_alt},
                ],
            })
            .as_object()
            .cloned()
            .unwrap(),
            sort: vec![json!(pos)],
            matched_queries: Some(vec!["F1".into()]),
        }
    }

    fn bucket(key: &str, hits: Vec<Hit>) -> GeneBucket {
        GeneBucket {
            key: key.into(),
            doc_count: hits.len(),
            hits,
        }
    }

    fn unaffected() -> BTreeMap<String, BTreeSet<String>> {
        BTreeMap::from([(
            "F1".to_string(),
            BTreeSet::from(["I2".to_string()]),
        )])
    }

    fn allowed(terms: &[&str]) -> BTreeSet<String> {
        terms.iter().map(|s| s.to_string()).collect()
    }

    fn run(
        buckets: &[GeneBucket],
        allowed_consequences: &BTreeSet<String>,
    ) -> Result<CompoundHetGroups, SearchError> {
        let catalog = catalog(GenomeRelease::Grch37, &[]);
        let sort = vec![SortSpec::field("xpos")];
        let liftover = LazyLiftover::unavailable();
        let parser = HitParser::new(&catalog, &sort, &liftover);
        group_buckets(buckets, &parser, &unaffected(), allowed_consequences, 1000)
    }

    fn ids(groups: &CompoundHetGroups) -> Vec<(Option<&str>, Vec<&str>)> {
        groups
            .groups
            .iter()
            .map(|g| {
                (
                    g.gene_id.as_deref(),
                    g.variants.iter().map(|v| v.variant_id.as_str()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn valid_pair() -> Result<(), anyhow::Error> {
        let groups = run(
            &[bucket(
                "G1",
                vec![
                    hit("1-100-A-G", &[("G1", "missense_variant")], 1),
                    hit("1-200-A-G", &[("G1", "missense_variant")], 0),
                ],
            )],
            &BTreeSet::new(),
        )?;
        assert_eq!(ids(&groups), vec![(Some("G1"), vec!["1-100-A-G", "1-200-A-G"])]);
        assert_eq!(groups.total, 2);
        for variant in &groups.groups[0].variants {
            assert_eq!(variant.family_guids, vec!["F1"]);
        }

        Ok(())
    }

    #[test]
    fn unaffected_het_for_all_variants_is_invalid() -> Result<(), anyhow::Error> {
        let groups = run(
            &[bucket(
                "G1",
                vec![
                    hit("1-100-A-G", &[("G1", "missense_variant")], 1),
                    hit("1-200-A-G", &[("G1", "missense_variant")], 1),
                ],
            )],
            &BTreeSet::new(),
        )?;
        assert_eq!(groups, CompoundHetGroups::default());

        Ok(())
    }

    #[test]
    fn consequence_checked_on_gene_of_interest() -> Result<(), anyhow::Error> {
        let groups = run(
            &[bucket(
                "G1",
                vec![
                    hit("1-100-A-G", &[("G1", "missense_variant")], 0),
                    hit(
                        "1-200-A-G",
                        &[("G2", "missense_variant"), ("G1", "intron_variant")],
                        0,
                    ),
                ],
            )],
            &allowed(&["missense_variant"]),
        )?;
        assert!(groups.groups.is_empty());

        Ok(())
    }

    #[test]
    fn rekey_to_shared_main_gene() -> Result<(), anyhow::Error> {
        let hits = vec![
            hit("1-100-A-G", &[("G2", "missense_variant"), ("G1", "missense_variant")], 0),
            hit("1-200-A-G", &[("G2", "missense_variant"), ("G1", "missense_variant")], 0),
        ];
        let groups = run(
            &[bucket("G1", hits.clone()), bucket("G2", hits)],
            &allowed(&["missense_variant"]),
        )?;
        // The second bucket is skipped, its key is already recorded.
        assert_eq!(ids(&groups), vec![(Some("G2"), vec!["1-100-A-G", "1-200-A-G"])]);
        assert_eq!(groups.total, 2);

        Ok(())
    }

    #[test]
    fn keep_key_if_shared_gene_lacks_consequence() -> Result<(), anyhow::Error> {
        let hits = vec![
            hit("1-100-A-G", &[("G2", "intron_variant"), ("G1", "missense_variant")], 0),
            hit("1-200-A-G", &[("G2", "intron_variant"), ("G1", "missense_variant")], 0),
        ];
        let groups = run(&[bucket("G1", hits)], &allowed(&["missense_variant"]))?;
        assert_eq!(ids(&groups), vec![(Some("G1"), vec!["1-100-A-G", "1-200-A-G"])]);

        Ok(())
    }

    #[test]
    fn skip_identical_sequence_under_primary_gene() -> Result<(), anyhow::Error> {
        let in_g2 = vec![
            hit("1-100-A-G", &[("G2", "missense_variant")], 0),
            hit("1-200-A-G", &[("G2", "missense_variant")], 0),
        ];
        // Main genes G2 and G3 differ, so no re-keying.
        let in_g1 = vec![
            hit("1-100-A-G", &[("G2", "missense_variant"), ("G1", "missense_variant")], 0),
            hit("1-200-A-G", &[("G3", "missense_variant"), ("G1", "missense_variant")], 0),
        ];
        let groups = run(
            &[bucket("G2", in_g2), bucket("G1", in_g1)],
            &BTreeSet::new(),
        )?;
        assert_eq!(ids(&groups), vec![(Some("G2"), vec!["1-100-A-G", "1-200-A-G"])]);

        Ok(())
    }

    #[test]
    fn too_many_buckets() {
        let buckets: Vec<GeneBucket> = (0..3).map(|i| bucket(&format!("G{}", i), vec![])).collect();
        let catalog = catalog(GenomeRelease::Grch37, &[]);
        let sort = vec![SortSpec::field("xpos")];
        let liftover = LazyLiftover::unavailable();
        let parser = HitParser::new(&catalog, &sort, &liftover);

        let result = group_buckets(&buckets, &parser, &unaffected(), &BTreeSet::new(), 2);
        assert!(matches!(
            result,
            Err(SearchError::InvalidFilter(msg)) if msg == TOO_MANY_COMPOUND_HETS
        ));
    }

    #[test]
    fn merge_groups_across_indices() {
        let group = |index: &str, ids: &[&str]| VariantGroup {
            gene_id: Some("G1".into()),
            variants: ids.iter().map(|id| variant(id, index, &["F1"])).collect(),
        };
        let (merged, duplicates) = merge_groups(vec![
            group("idx1", &["1-100-A-G", "1-200-A-G"]),
            group("idx2", &["1-200-A-G", "1-300-A-G"]),
            group("idx2", &["1-200-A-G"]),
        ]);
        assert_eq!(duplicates, 1);
        assert_eq!(merged.len(), 1);
        assert_eq!(
            merged[0]
                .variants
                .iter()
                .map(|v| v.variant_id.as_str())
                .collect::<Vec<_>>(),
            vec!["1-100-A-G", "1-200-A-G", "1-300-A-G"]
        );
    }

    #[test]
    fn groups_sorted_by_first_variant() {
        let mut groups = vec![
            VariantGroup::single(variant("2-100-A-G", "idx", &[])),
            VariantGroup {
                gene_id: Some("G1".into()),
                variants: vec![
                    variant("1-500-A-G", "idx", &[]),
                    variant("1-100-A-G", "idx", &[]),
                ],
            },
            VariantGroup::single(variant("1-300-A-G", "idx", &[])),
        ];
        sort_groups(&mut groups);
        assert_eq!(
            groups
                .iter()
                .map(|g| g.variants[0].variant_id.as_str())
                .collect::<Vec<_>>(),
            vec!["1-300-A-G", "1-500-A-G", "2-100-A-G"]
        );
    }
}
