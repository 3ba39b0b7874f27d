//! Gene reference data used for locus resolution and scripted sorts.

use std::collections::{BTreeMap, BTreeSet};

use indexmap::IndexMap;

/// Prefix of Ensembl gene identifiers.
const GENE_ID_PREFIX: &str = "ENSG";

/// Lookup of gene identifiers.
pub trait GeneLookup {
    /// Resolve a gene symbol (case-insensitive) or gene ID to a known gene ID.
    fn gene_id(&self, item: &str) -> Option<String>;
}

/// One row of the genes TSV file.
#[derive(Debug, serde::Deserialize)]
struct GeneRecord {
    gene_id: String,
    gene_symbol: String,
}

/// One row of the disease genes TSV file.
#[derive(Debug, serde::Deserialize)]
struct DiseaseGeneRecord {
    gene_id: String,
}

/// One row of the gene constraint TSV file.
#[derive(Debug, serde::Deserialize)]
struct ConstraintRecord {
    gene_id: String,
    mis_z: f64,
    #[serde(rename = "pLI")]
    pli: String,
}

/// Gene constraint metrics of one gene.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeneConstraint {
    pub mis_z: f64,
    pub pli: f64,
}

/// Reference data tables.
#[derive(Debug, Clone, Default)]
pub struct ReferenceData {
    /// Gene symbol by gene ID.
    symbols: IndexMap<String, String>,
    /// Gene ID by upper case gene symbol.
    ids_by_symbol: BTreeMap<String, String>,
    /// Genes with a disease association.
    disease_genes: BTreeSet<String>,
    /// Constraint metrics by gene ID.
    constraint: IndexMap<String, GeneConstraint>,
}

fn tsv_reader(path: &str) -> Result<csv::Reader<std::fs::File>, anyhow::Error> {
    csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)
        .map_err(|e| anyhow::anyhow!("could not open {}: {}", path, e))
}

impl ReferenceData {
    /// Construct from `(gene_id, gene_symbol)` pairs.
    pub fn from_genes(genes: Vec<(String, String)>) -> Self {
        let mut result = Self::default();
        for (gene_id, gene_symbol) in genes {
            result.add_gene(gene_id, gene_symbol);
        }
        result
    }

    fn add_gene(&mut self, gene_id: String, gene_symbol: String) {
        self.ids_by_symbol
            .entry(gene_symbol.to_uppercase())
            .or_insert_with(|| gene_id.clone());
        self.symbols.insert(gene_id, gene_symbol);
    }

    /// Load the genes TSV file with columns `gene_id` and `gene_symbol`.
    pub fn load_genes(&mut self, path: &str) -> Result<(), anyhow::Error> {
        let mut reader = tsv_reader(path)?;
        for record in reader.deserialize::<GeneRecord>() {
            let record =
                record.map_err(|e| anyhow::anyhow!("could not parse genes file {}: {}", path, e))?;
            self.add_gene(record.gene_id, record.gene_symbol);
        }
        tracing::debug!("loaded {} genes from {}", self.symbols.len(), path);
        Ok(())
    }

    /// Load the disease genes TSV file with column `gene_id`.
    pub fn load_disease_genes(&mut self, path: &str) -> Result<(), anyhow::Error> {
        let mut reader = tsv_reader(path)?;
        for record in reader.deserialize::<DiseaseGeneRecord>() {
            let record = record
                .map_err(|e| anyhow::anyhow!("could not parse disease genes file {}: {}", path, e))?;
            self.disease_genes.insert(record.gene_id);
        }
        tracing::debug!(
            "loaded {} disease genes from {}",
            self.disease_genes.len(),
            path
        );
        Ok(())
    }

    /// Load the constraint TSV file with columns `gene_id`, `mis_z`, and `pLI`.
    ///
    /// A `pLI` value of `NA` is read as zero.
    pub fn load_constraint(&mut self, path: &str) -> Result<(), anyhow::Error> {
        let mut reader = tsv_reader(path)?;
        for record in reader.deserialize::<ConstraintRecord>() {
            let record = record
                .map_err(|e| anyhow::anyhow!("could not parse constraint file {}: {}", path, e))?;
            let pli = if record.pli == "NA" {
                0.0
            } else {
                record.pli.parse::<f64>().map_err(|e| {
                    anyhow::anyhow!("invalid pLI {:?} in {}: {}", &record.pli, path, e)
                })?
            };
            self.constraint.insert(
                record.gene_id,
                GeneConstraint {
                    mis_z: record.mis_z,
                    pli,
                },
            );
        }
        tracing::debug!(
            "loaded constraint of {} genes from {}",
            self.constraint.len(),
            path
        );
        Ok(())
    }

    pub fn with_disease_genes<I: IntoIterator<Item = String>>(mut self, gene_ids: I) -> Self {
        self.disease_genes.extend(gene_ids);
        self
    }

    pub fn with_constraint<I: IntoIterator<Item = (String, GeneConstraint)>>(
        mut self,
        constraint: I,
    ) -> Self {
        self.constraint.extend(constraint);
        self
    }

    pub fn gene_symbol(&self, gene_id: &str) -> Option<&str> {
        self.symbols.get(gene_id).map(String::as_str)
    }

    /// Sorted IDs of genes with a disease association.
    pub fn disease_gene_ids(&self) -> Vec<String> {
        self.disease_genes.iter().cloned().collect()
    }

    /// Sum of the descending `mis_z` rank and the descending `pLI` rank per gene.
    ///
    /// Ranks start at zero; ties keep input order.
    pub fn constraint_ranks(&self) -> BTreeMap<String, u64> {
        let mut result: BTreeMap<String, u64> = BTreeMap::new();
        let metrics: [fn(&GeneConstraint) -> f64; 2] = [|c| c.mis_z, |c| c.pli];
        for metric in metrics {
            let mut genes: Vec<(&String, f64)> = self
                .constraint
                .iter()
                .map(|(gene_id, constraint)| (gene_id, metric(constraint)))
                .collect();
            genes.sort_by(|(_, lhs), (_, rhs)| rhs.total_cmp(lhs));
            for (rank, (gene_id, _)) in genes.into_iter().enumerate() {
                *result.entry(gene_id.clone()).or_default() += rank as u64;
            }
        }
        result
    }
}

impl GeneLookup for ReferenceData {
    fn gene_id(&self, item: &str) -> Option<String> {
        if item.starts_with(GENE_ID_PREFIX) && self.symbols.contains_key(item) {
            return Some(item.to_owned());
        }
        self.ids_by_symbol.get(&item.to_uppercase()).cloned()
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn reference() -> ReferenceData {
        ReferenceData::from_genes(vec![
            ("ENSG00000012048".into(), "BRCA1".into()),
            ("ENSG00000141510".into(), "TP53".into()),
        ])
    }

    #[rstest]
    #[case("BRCA1", Some("ENSG00000012048"))]
    #[case("brca1", Some("ENSG00000012048"))]
    #[case("ENSG00000141510", Some("ENSG00000141510"))]
    #[case("ENSG00000000000", None)]
    #[case("FOO", None)]
    fn gene_lookup(#[case] item: &str, #[case] expected: Option<&str>) {
        assert_eq!(reference().gene_id(item).as_deref(), expected);
    }

    #[test]
    fn constraint_ranks() {
        let reference = reference().with_constraint(vec![
            (
                "A".to_string(),
                GeneConstraint {
                    mis_z: 3.0,
                    pli: 0.1,
                },
            ),
            (
                "B".to_string(),
                GeneConstraint {
                    mis_z: 1.0,
                    pli: 0.9,
                },
            ),
            (
                "C".to_string(),
                GeneConstraint {
                    mis_z: 2.0,
                    pli: 0.5,
                },
            ),
        ]);
        assert_eq!(
            reference.constraint_ranks(),
            BTreeMap::from([
                ("A".to_string(), 2),
                ("B".to_string(), 2),
                ("C".to_string(), 2),
            ])
        );
    }

    #[test]
    fn load_tables() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let genes_path = tmp_dir.join("genes.tsv");
        std::fs::write(&genes_path, "gene_id\tgene_symbol\nENSG1\tGENE1\nENSG2\tGENE2\n")?;
        let disease_path = tmp_dir.join("disease_genes.tsv");
        std::fs::write(&disease_path, "gene_id\nENSG2\n")?;
        let constraint_path = tmp_dir.join("constraint.tsv");
        std::fs::write(
            &constraint_path,
            "gene_id\tmis_z\tpLI\nENSG1\t1.5\tNA\nENSG2\t0.5\t0.99\n",
        )?;

        let mut reference = ReferenceData::default();
        reference.load_genes(&genes_path.to_string_lossy())?;
        reference.load_disease_genes(&disease_path.to_string_lossy())?;
        reference.load_constraint(&constraint_path.to_string_lossy())?;

        assert_eq!(reference.gene_id("gene2").as_deref(), Some("ENSG2"));
        assert_eq!(reference.gene_symbol("ENSG1"), Some("GENE1"));
        assert_eq!(reference.disease_gene_ids(), vec!["ENSG2".to_string()]);
        assert_eq!(
            reference.constraint_ranks(),
            BTreeMap::from([("ENSG1".to_string(), 1), ("ENSG2".to_string(), 1)])
        );

        Ok(())
    }
}
