//! Resolution of families to backend indices and samples.

use std::collections::{BTreeMap, BTreeSet};

use crate::err::SearchError;

use super::backend::{IndexMetadata, SearchBackend};
use super::schema::query::AffectedStatus;

/// Field whose presence in an index mapping marks a compatible schema.
pub const SCHEMA_PROBE_FIELD: &str = "samples_num_alt_1";

/// Sex of an individual.
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
pub enum Sex {
    #[serde(rename = "M")]
    #[strum(serialize = "M")]
    Male,
    #[serde(rename = "F")]
    #[strum(serialize = "F")]
    Female,
    #[default]
    #[serde(rename = "U")]
    #[strum(serialize = "U")]
    Unknown,
}

/// Kind of data set a sample was loaded from.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DatasetType {
    /// Small variant calls.
    Variants,
    /// Structural variant calls.
    Sv,
}

/// Loading status of a sample.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Requested,
    Loading,
    Loaded,
}

/// An individual of a family.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Individual {
    pub guid: String,
    pub family_guid: String,
    pub affected: AffectedStatus,
    pub sex: Sex,
}

/// A sample as stored in the sample store.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Sample {
    pub sample_id: String,
    pub individual: Individual,
    pub dataset_type: DatasetType,
    pub sample_status: SampleStatus,
    pub elasticsearch_index: Option<String>,
    pub loaded_date: Option<chrono::NaiveDateTime>,
}

/// Read access to samples and individuals.
pub trait SampleStore {
    /// All samples of the given families.
    fn samples_for_families(&self, family_guids: &[String]) -> Vec<Sample>;

    /// Number of samples stored in the given index, across all families.
    fn index_sample_count(&self, index: &str) -> usize;
}

/// One row of the samples TSV file.
#[derive(Debug, serde::Deserialize)]
struct SampleRecord {
    sample_id: String,
    individual_guid: String,
    family_guid: String,
    affected: AffectedStatus,
    sex: Sex,
    dataset_type: DatasetType,
    sample_status: SampleStatus,
    elasticsearch_index: Option<String>,
    loaded_date: Option<chrono::NaiveDateTime>,
}

impl From<SampleRecord> for Sample {
    fn from(record: SampleRecord) -> Self {
        Sample {
            sample_id: record.sample_id,
            individual: Individual {
                guid: record.individual_guid,
                family_guid: record.family_guid,
                affected: record.affected,
                sex: record.sex,
            },
            dataset_type: record.dataset_type,
            sample_status: record.sample_status,
            elasticsearch_index: record.elasticsearch_index.filter(|s| !s.is_empty()),
            loaded_date: record.loaded_date,
        }
    }
}

/// In-memory sample store, e.g., loaded from a TSV file.
#[derive(Debug, Clone, Default)]
pub struct SampleTable {
    samples: Vec<Sample>,
}

impl SampleTable {
    pub fn new(samples: Vec<Sample>) -> Self {
        Self { samples }
    }

    /// Load from a tab-separated file with header.
    pub fn from_path(path: &str) -> Result<Self, anyhow::Error> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .from_path(path)
            .map_err(|e| anyhow::anyhow!("could not open samples file {}: {}", path, e))?;
        let samples = reader
            .deserialize::<SampleRecord>()
            .map(|record| record.map(Sample::from))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("could not parse samples file {}: {}", path, e))?;
        tracing::debug!("loaded {} samples from {}", samples.len(), path);
        Ok(Self { samples })
    }
}

impl SampleStore for SampleTable {
    fn samples_for_families(&self, family_guids: &[String]) -> Vec<Sample> {
        let families: BTreeSet<&str> = family_guids.iter().map(String::as_str).collect();
        self.samples
            .iter()
            .filter(|s| families.contains(s.individual.family_guid.as_str()))
            .cloned()
            .collect()
    }

    fn index_sample_count(&self, index: &str) -> usize {
        self.samples
            .iter()
            .filter(|s| s.elasticsearch_index.as_deref() == Some(index))
            .count()
    }
}

/// Return loaded variant call samples with an index, only the latest per individual.
pub fn latest_loaded_samples(store: &dyn SampleStore, family_guids: &[String]) -> Vec<Sample> {
    let candidates: Vec<Sample> = store
        .samples_for_families(family_guids)
        .into_iter()
        .filter(|s| {
            s.dataset_type == DatasetType::Variants
                && s.sample_status == SampleStatus::Loaded
                && s.elasticsearch_index.is_some()
        })
        .collect();

    let mut max_loaded_date = BTreeMap::new();
    for sample in &candidates {
        let entry = max_loaded_date
            .entry(sample.individual.guid.clone())
            .or_insert(sample.loaded_date);
        if sample.loaded_date > *entry {
            *entry = sample.loaded_date;
        }
    }

    candidates
        .into_iter()
        .filter(|s| max_loaded_date.get(&s.individual.guid) == Some(&s.loaded_date))
        .collect()
}

/// Samples by sample ID.
pub type SamplesById = BTreeMap<String, Sample>;
/// Samples by family GUID and sample ID.
pub type FamilySamples = BTreeMap<String, SamplesById>;

/// Resolved mapping `index -> family -> sample ID -> sample` with index metadata.
#[derive(Debug, Clone, Default)]
pub struct SampleIndexCatalog {
    samples_by_family_index: BTreeMap<String, FamilySamples>,
    index_metadata: BTreeMap<String, IndexMetadata>,
    index_sample_counts: BTreeMap<String, usize>,
}

impl SampleIndexCatalog {
    /// Resolve the latest loaded samples of the given families and validate their indices.
    pub fn resolve(
        store: &dyn SampleStore,
        backend: &dyn SearchBackend,
        family_guids: &[String],
    ) -> Result<Self, SearchError> {
        let mut samples_by_family_index: BTreeMap<String, FamilySamples> = BTreeMap::new();
        for sample in latest_loaded_samples(store, family_guids) {
            if let Some(index) = sample.elasticsearch_index.clone() {
                samples_by_family_index
                    .entry(index)
                    .or_default()
                    .entry(sample.individual.family_guid.clone())
                    .or_default()
                    .insert(sample.sample_id.clone(), sample);
            }
        }
        if samples_by_family_index.is_empty() {
            return Err(SearchError::Configuration(String::from("No es index found")));
        }

        let indices: Vec<String> = samples_by_family_index.keys().cloned().collect();
        let index_metadata = backend.index_metadata(&indices)?;
        for (index, metadata) in &index_metadata {
            if !metadata.fields.contains(SCHEMA_PROBE_FIELD) {
                return Err(SearchError::Configuration(format!(
                    "Index \"{}\" does not have a valid schema",
                    index
                )));
            }
        }
        let missing: Vec<&str> = indices
            .iter()
            .filter(|index| !index_metadata.contains_key(*index))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() || index_metadata.len() != indices.len() {
            return Err(SearchError::Configuration(format!(
                "Could not find expected indices: {}",
                missing.join(", ")
            )));
        }

        let index_sample_counts = indices
            .iter()
            .map(|index| (index.clone(), store.index_sample_count(index)))
            .collect();

        tracing::debug!(
            "resolved {} families to indices {:?}",
            family_guids.len(),
            &indices
        );
        Ok(Self {
            samples_by_family_index,
            index_metadata,
            index_sample_counts,
        })
    }

    /// Construct directly from parts.
    pub fn from_parts(
        samples_by_family_index: BTreeMap<String, FamilySamples>,
        index_metadata: BTreeMap<String, IndexMetadata>,
        index_sample_counts: BTreeMap<String, usize>,
    ) -> Self {
        Self {
            samples_by_family_index,
            index_metadata,
            index_sample_counts,
        }
    }

    /// Names of the resolved indices, sorted.
    pub fn indices(&self) -> Vec<&str> {
        self.samples_by_family_index
            .keys()
            .map(String::as_str)
            .collect()
    }

    /// Samples of the given index by family.
    pub fn family_samples(&self, index: &str) -> Option<&FamilySamples> {
        self.samples_by_family_index.get(index)
    }

    /// Iterate over indices with their samples by family.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FamilySamples)> {
        self.samples_by_family_index.iter()
    }

    pub fn metadata(&self, index: &str) -> Option<&IndexMetadata> {
        self.index_metadata.get(index)
    }

    /// Whether the searched samples are all samples stored in the index.
    pub fn covers_index(&self, index: &str) -> bool {
        let searched: usize = self
            .family_samples(index)
            .map(|families| families.values().map(BTreeMap::len).sum())
            .unwrap_or_default();
        self.index_sample_counts.get(index).copied() == Some(searched)
    }

    /// GUIDs of unaffected individuals by family for the given index.
    pub fn unaffected_individuals(&self, index: &str) -> BTreeMap<String, BTreeSet<String>> {
        self.family_samples(index)
            .map(|families| {
                families
                    .iter()
                    .map(|(family_guid, samples)| {
                        let unaffected = samples
                            .values()
                            .filter(|s| s.individual.affected == AffectedStatus::Unaffected)
                            .map(|s| s.individual.guid.clone())
                            .collect();
                        (family_guid.clone(), unaffected)
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
