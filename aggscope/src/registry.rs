//! Entity index metadata and index resolution
//!
//! Entity types are registered with explicit [`IndexMetadata`] through a
//! [`MetadataSource`]. The [`IndexRegistry`] looks each type up on first use,
//! caches the result for its own lifetime and turns an entity type plus an
//! optional explicit index list into the indices a request runs against.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::AggError;
use crate::Result;

/// Per-entity index configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct IndexMetadata {
    /// Primary index, used for writes and as the search default
    pub index_name: String,

    /// Indices searched instead of `index_name` when set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_index_names: Vec<String>,

    /// Mapping type; defaults to the index name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_type: Option<String>,

    #[serde(default = "default_shards")]
    pub number_of_shards: u32,

    #[serde(default = "default_replicas")]
    pub number_of_replicas: u32,

    /// Log every request tree issued for this entity at info level
    #[serde(default)]
    pub print_log: bool,
}

fn default_shards() -> u32 {
    5
}

fn default_replicas() -> u32 {
    1
}

impl IndexMetadata {
    pub fn new(index_name: impl Into<String>) -> Self {
        Self {
            index_name: index_name.into(),
            search_index_names: Vec::new(),
            index_type: None,
            number_of_shards: default_shards(),
            number_of_replicas: default_replicas(),
            print_log: false,
        }
    }

    pub fn with_search_indices<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.search_index_names = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_print_log(mut self, enabled: bool) -> Self {
        self.print_log = enabled;
        self
    }

    pub fn index_type(&self) -> &str {
        self.index_type.as_deref().unwrap_or(&self.index_name)
    }

    pub fn validate(&self) -> Result<()> {
        if self.index_name.trim().is_empty() {
            return Err(AggError::Config("index_name must not be empty".to_string()));
        }
        if self.search_index_names.iter().any(|n| n.trim().is_empty()) {
            return Err(AggError::Config(format!(
                "search_index_names of '{}' contains an empty name",
                self.index_name
            )));
        }
        Ok(())
    }
}

/// What the resolved indices will be used for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexPurpose {
    Write,
    Search,
}

/// Source of per-entity metadata.
pub trait MetadataSource: Send + Sync {
    fn lookup(&self, entity: &str) -> Option<IndexMetadata>;
}

/// Metadata registered up front, usually from the config file.
#[derive(Debug, Clone, Default)]
pub struct StaticMetadata {
    entities: HashMap<String, IndexMetadata>,
}

impl StaticMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity: impl Into<String>, metadata: IndexMetadata) -> Self {
        self.register(entity, metadata);
        self
    }

    pub fn register(&mut self, entity: impl Into<String>, metadata: IndexMetadata) {
        self.entities.insert(entity.into(), metadata);
    }

    /// Registered entity names, sorted.
    pub fn entities(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entities.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl From<HashMap<String, IndexMetadata>> for StaticMetadata {
    fn from(entities: HashMap<String, IndexMetadata>) -> Self {
        Self { entities }
    }
}

impl MetadataSource for StaticMetadata {
    fn lookup(&self, entity: &str) -> Option<IndexMetadata> {
        self.entities.get(entity).cloned()
    }
}

/// Caching index resolver.
pub struct IndexRegistry {
    source: Arc<dyn MetadataSource>,
    cache: RwLock<HashMap<String, Arc<IndexMetadata>>>,
}

impl IndexRegistry {
    pub fn new(source: Arc<dyn MetadataSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Metadata for `entity`, fetched from the source on first access.
    ///
    /// Racing first accesses may each query the source; the first insert wins.
    pub fn metadata(&self, entity: &str) -> Result<Arc<IndexMetadata>> {
        if let Some(meta) = self.cache.read().get(entity) {
            return Ok(Arc::clone(meta));
        }

        let meta = self
            .source
            .lookup(entity)
            .ok_or_else(|| AggError::UnresolvedEntity(entity.to_string()))?;
        meta.validate()?;
        tracing::debug!(entity, index = %meta.index_name, "Cached index metadata");

        let mut cache = self.cache.write();
        let entry = cache
            .entry(entity.to_string())
            .or_insert_with(|| Arc::new(meta));
        Ok(Arc::clone(entry))
    }

    /// Indices a request for `entity` runs against.
    ///
    /// A non-empty `explicit` list always wins and is returned in order with
    /// duplicates removed, without consulting the metadata source.
    pub fn resolve(
        &self,
        entity: &str,
        explicit: &[String],
        purpose: IndexPurpose,
    ) -> Result<Vec<String>> {
        if !explicit.is_empty() {
            if explicit.iter().any(|n| n.trim().is_empty()) {
                return Err(AggError::InvalidAggregationSpec(
                    "explicit index names must not be empty".to_string(),
                ));
            }
            return Ok(dedup(explicit));
        }

        let meta = self.metadata(entity)?;
        let indices = match purpose {
            IndexPurpose::Search if !meta.search_index_names.is_empty() => {
                dedup(&meta.search_index_names)
            }
            _ => vec![meta.index_name.clone()],
        };
        Ok(indices)
    }

    /// Number of entity types cached so far.
    pub fn cached_len(&self) -> usize {
        self.cache.read().len()
    }
}

fn dedup(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .filter(|n| seen.insert(n.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        inner: StaticMetadata,
        lookups: AtomicUsize,
    }

    impl MetadataSource for CountingSource {
        fn lookup(&self, entity: &str) -> Option<IndexMetadata> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.inner.lookup(entity)
        }
    }

    fn registry() -> IndexRegistry {
        let source = StaticMetadata::new()
            .with_entity("policy", IndexMetadata::new("policy"))
            .with_entity(
                "claim",
                IndexMetadata::new("claim").with_search_indices(["claim", "claim_2019", "claim"]),
            );
        IndexRegistry::new(Arc::new(source))
    }

    #[test]
    fn test_primary_index_used_by_default() {
        let reg = registry();
        let indices = reg.resolve("policy", &[], IndexPurpose::Search).unwrap();
        assert_eq!(indices, vec!["policy"]);
    }

    #[test]
    fn test_search_indices_used_for_search_only() {
        let reg = registry();
        assert_eq!(
            reg.resolve("claim", &[], IndexPurpose::Search).unwrap(),
            vec!["claim", "claim_2019"]
        );
        assert_eq!(
            reg.resolve("claim", &[], IndexPurpose::Write).unwrap(),
            vec!["claim"]
        );
    }

    #[test]
    fn test_explicit_indices_override() {
        let reg = registry();
        let explicit = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        assert_eq!(
            reg.resolve("policy", &explicit, IndexPurpose::Search).unwrap(),
            vec!["a", "b"]
        );
        // Explicit lists never touch the metadata source.
        assert_eq!(
            reg.resolve("unknown", &explicit, IndexPurpose::Search).unwrap(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn test_blank_explicit_index_rejected() {
        let reg = registry();
        let err = reg
            .resolve("policy", &[" ".to_string()], IndexPurpose::Search)
            .unwrap_err();
        assert!(matches!(err, AggError::InvalidAggregationSpec(_)));
    }

    #[test]
    fn test_unknown_entity() {
        let reg = registry();
        let err = reg.resolve("ghost", &[], IndexPurpose::Search).unwrap_err();
        assert!(matches!(err, AggError::UnresolvedEntity(e) if e == "ghost"));
    }

    #[test]
    fn test_invalid_metadata_rejected() {
        let source = StaticMetadata::new().with_entity("bad", IndexMetadata::new(""));
        let reg = IndexRegistry::new(Arc::new(source));
        assert!(matches!(reg.metadata("bad"), Err(AggError::Config(_))));
        assert_eq!(reg.cached_len(), 0);
    }

    #[test]
    fn test_metadata_looked_up_once() {
        let source = Arc::new(CountingSource {
            inner: StaticMetadata::new().with_entity("policy", IndexMetadata::new("policy")),
            lookups: AtomicUsize::new(0),
        });
        let reg = IndexRegistry::new(source.clone());

        for _ in 0..5 {
            reg.resolve("policy", &[], IndexPurpose::Search).unwrap();
        }
        assert_eq!(source.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(reg.cached_len(), 1);
    }

    #[test]
    fn test_concurrent_first_access_converges() {
        let reg = Arc::new(registry());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                std::thread::spawn(move || reg.metadata("claim").unwrap())
            })
            .collect();

        let metas: Vec<Arc<IndexMetadata>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(metas.iter().all(|m| **m == *metas[0]));
        assert_eq!(reg.cached_len(), 1);
    }

    #[test]
    fn test_metadata_defaults() {
        let meta: IndexMetadata = toml::from_str("index_name = \"policy\"").unwrap();
        assert_eq!(meta.number_of_shards, 5);
        assert_eq!(meta.number_of_replicas, 1);
        assert_eq!(meta.index_type(), "policy");
        assert!(!meta.print_log);
    }
}
