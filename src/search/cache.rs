//! Pagination state of one search, persisted in a session cache store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use super::schema::data::{Variant, VariantGroup};

/// Storage of opaque cache blobs by key.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error>;
}

/// Cache store living as long as the process.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<String, String>>,
}

impl CacheStore for MemoryCacheStore {
    fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("cache lock poisoned: {}", e))?;
        entries.insert(key.to_owned(), value.to_owned());
        Ok(())
    }
}

/// Cache store persisted in a RocksDB directory.
pub struct RocksDbCacheStore {
    db: rocksdb::DBWithThreadMode<rocksdb::MultiThreaded>,
}

impl std::fmt::Debug for RocksDbCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbCacheStore")
            .field("path", &self.db.path())
            .finish()
    }
}

impl RocksDbCacheStore {
    /// Open or create the cache database at `path`.
    pub fn open(path: &str) -> Result<Self, anyhow::Error> {
        let options = {
            let mut options = rocksdb::Options::default();
            options.create_if_missing(true);
            options
        };
        let db = rocksdb::DBWithThreadMode::<rocksdb::MultiThreaded>::open(&options, path)
            .map_err(|e| anyhow::anyhow!("could not open cache at {}: {}", path, e))?;
        tracing::debug!("opened cache at {}", path);
        Ok(Self { db })
    }
}

impl CacheStore for RocksDbCacheStore {
    fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        let Some(raw) = self.db.get(key.as_bytes())? else {
            return Ok(None);
        };
        Ok(Some(String::from_utf8(raw)?))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        Ok(self.db.put(key.as_bytes(), value.as_bytes())?)
    }
}

/// Key of the cached pagination state of a search.
pub fn cache_key(search_guid: &str, sort: &str) -> String {
    format!("search_results__{}__{}", search_guid, sort)
}

/// Loaded and total number of records of one index.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct LoadedCount {
    pub loaded: usize,
    pub total: usize,
}

/// Pagination state of one search.
#[serde_with::skip_serializing_none]
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PaginationCache {
    /// Total number of results, known after the first page.
    pub total_results: Option<usize>,
    /// Contiguous single variant results from the first one on.
    pub all_results: Vec<Variant>,
    /// Per-index counters of single variant searches.
    pub loaded_variant_counts: BTreeMap<String, LoadedCount>,
    /// Per-index number of compound heterozygous variants.
    pub compound_het_totals: BTreeMap<String, usize>,
    /// Groups in result order, from the first one on.
    pub grouped_results: Vec<VariantGroup>,
    /// Compound heterozygous groups loaded but not returned yet.
    pub compound_het_results: Vec<VariantGroup>,
    /// Single variants loaded but not returned yet.
    pub variant_results: Vec<Variant>,
    /// Number of duplicates removed so far.
    pub duplicate_doc_count: usize,
}

impl PaginationCache {
    /// Load from the store; a missing or unreadable entry gives an empty cache.
    pub fn load(store: &dyn CacheStore, key: &str) -> Self {
        match store.get(key) {
            Ok(Some(value)) => match serde_json::from_str(&value) {
                Ok(cache) => cache,
                Err(e) => {
                    tracing::warn!("Ignoring unreadable cache entry {}: {}", key, e);
                    Self::default()
                }
            },
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!("Unable to read from cache: {}", e);
                Self::default()
            }
        }
    }

    /// Write to the store; failures are only logged.
    pub fn save(&self, store: &dyn CacheStore, key: &str) {
        let result = serde_json::to_string(self)
            .map_err(anyhow::Error::from)
            .and_then(|value| store.set(key, &value));
        if let Err(e) = result {
            tracing::warn!("Unable to write to cache: {}", e);
        }
    }

    /// Whether compound heterozygous groups were materialized.
    pub fn has_grouped_results(&self) -> bool {
        !self.grouped_results.is_empty()
    }

    /// The window `start..end` if it is already materialized.
    ///
    /// `end` is capped by the known total.
    pub fn materialized_page(&self, start: usize, end: usize) -> Option<Vec<Variant>> {
        let end = match self.total_results {
            Some(total) => end.min(total),
            None => end,
        };
        if self.all_results.len() >= end {
            return Some(self.all_results[start.min(end)..end].to_vec());
        }
        if self.has_grouped_results() {
            return get_compound_het_page(&self.grouped_results, start, end);
        }
        None
    }
}

/// Page of variants covering `start..end` from groups, never splitting a group.
///
/// Groups before `start` are skipped as a whole.  Returns `None` if the
/// groups do not reach `end`.
pub fn get_compound_het_page(
    groups: &[VariantGroup],
    start: usize,
    end: usize,
) -> Option<Vec<Variant>> {
    let mut skipped = 0;
    let mut result = Vec::new();
    for group in groups {
        if skipped < start {
            skipped += group.variants.len();
        } else {
            result.extend(group.variants.iter().cloned());
        }
        if result.len() + skipped >= end {
            return Some(result);
        }
    }
    None
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::search::schema::data::test::variant;

    fn group(ids: &[&str]) -> VariantGroup {
        let variants: Vec<Variant> = ids.iter().map(|id| variant(id, "idx", &[])).collect();
        if variants.len() > 1 {
            VariantGroup {
                gene_id: Some("G1".into()),
                variants,
            }
        } else {
            VariantGroup {
                gene_id: None,
                variants,
            }
        }
    }

    fn ids(variants: &[Variant]) -> Vec<&str> {
        variants.iter().map(|v| v.variant_id.as_str()).collect()
    }

    #[test]
    fn key() {
        assert_eq!(cache_key("S1", "xpos"), "search_results__S1__xpos");
    }

    #[test]
    fn compound_het_page() {
        let groups = vec![
            group(&["1-1-A-G", "1-2-A-G"]),
            group(&["1-3-A-G"]),
            group(&["1-4-A-G", "1-5-A-G"]),
        ];
        assert_eq!(
            get_compound_het_page(&groups, 0, 2).as_deref().map(ids),
            Some(vec!["1-1-A-G", "1-2-A-G"])
        );
        // Groups are never split.
        assert_eq!(
            get_compound_het_page(&groups, 0, 4).as_deref().map(ids),
            Some(vec!["1-1-A-G", "1-2-A-G", "1-3-A-G", "1-4-A-G", "1-5-A-G"])
        );
        assert_eq!(
            get_compound_het_page(&groups, 2, 4).as_deref().map(ids),
            Some(vec!["1-3-A-G", "1-4-A-G", "1-5-A-G"])
        );
        assert_eq!(get_compound_het_page(&groups, 0, 6), None);
    }

    #[test]
    fn materialized_flat_page() {
        let cache = PaginationCache {
            total_results: Some(12),
            all_results: (1..=12)
                .map(|i| variant(&format!("1-{}-A-G", i), "idx", &[]))
                .collect(),
            ..Default::default()
        };
        assert_eq!(
            cache.materialized_page(10, 20).as_deref().map(ids),
            Some(vec!["1-11-A-G", "1-12-A-G"])
        );
        assert_eq!(cache.materialized_page(20, 30), Some(vec![]));
        assert_eq!(PaginationCache::default().materialized_page(0, 10), None);
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryCacheStore::default();
        let cache = PaginationCache {
            total_results: Some(1),
            all_results: vec![variant("1-1-A-G", "idx", &["F1"])],
            ..Default::default()
        };
        cache.save(&store, "key");
        assert_eq!(PaginationCache::load(&store, "key"), cache);
        assert_eq!(PaginationCache::load(&store, "other"), PaginationCache::default());
    }

    #[test]
    fn rocksdb_store_round_trip() -> Result<(), anyhow::Error> {
        let tmp_dir = temp_testdir::TempDir::default();
        let path = tmp_dir.join("cache");
        let path = path.to_str().ok_or_else(|| anyhow::anyhow!("invalid path"))?;

        let cache = PaginationCache {
            total_results: Some(2),
            duplicate_doc_count: 1,
            ..Default::default()
        };
        {
            let store = RocksDbCacheStore::open(path)?;
            cache.save(&store, "key");
        }
        let store = RocksDbCacheStore::open(path)?;
        assert_eq!(PaginationCache::load(&store, "key"), cache);

        Ok(())
    }

    #[tracing_test::traced_test]
    #[test]
    fn unreadable_entry_is_ignored() {
        let store = MemoryCacheStore::default();
        store.set("key", "not json").unwrap();
        assert_eq!(PaginationCache::load(&store, "key"), PaginationCache::default());
        assert!(logs_contain("Ignoring unreadable cache entry"));
    }
}
