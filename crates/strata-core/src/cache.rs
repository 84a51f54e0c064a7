//! Second-level cache collaborator.
//!
//! Regions are advisory: a miss always falls back to the primary store.

use crate::value::{Value, ValueKey};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Key of one cached entity: identifier, entity name and hierarchy root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    id: ValueKey,
    entity_name: String,
    root_entity_name: String,
}

impl CacheKey {
    pub fn new(id: Value, entity_name: impl Into<String>, root_entity_name: impl Into<String>) -> Self {
        Self {
            id: ValueKey(id),
            entity_name: entity_name.into(),
            root_entity_name: root_entity_name.into(),
        }
    }

    pub fn id(&self) -> &Value {
        &self.id.0
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    pub fn root_entity_name(&self) -> &str {
        &self.root_entity_name
    }
}

/// Disassembled entity state stored in a region.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedEntry {
    pub state: Vec<Value>,
    pub version: Option<Value>,
}

/// A named cache region.
pub trait CacheRegion: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn get(&self, key: &CacheKey) -> Option<CachedEntry>;

    fn put(&self, key: CacheKey, entry: CachedEntry);

    fn evict(&self, key: &CacheKey);

    fn evict_all(&self);
}

/// Builds regions on first use.
pub trait RegionFactory: Send + Sync + fmt::Debug {
    fn build_region(&self, name: &str) -> Arc<dyn CacheRegion>;
}

/// In-memory region backed by a `HashMap`.
#[derive(Debug)]
pub struct MapCacheRegion {
    name: String,
    entries: RwLock<HashMap<CacheKey, CachedEntry>>,
}

impl MapCacheRegion {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheRegion for MapCacheRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &CacheKey) -> Option<CachedEntry> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn put(&self, key: CacheKey, entry: CachedEntry) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(key, entry);
    }

    fn evict(&self, key: &CacheKey) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(key);
    }

    fn evict_all(&self) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clear();
    }
}

/// Factory producing [`MapCacheRegion`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct MapRegionFactory;

impl RegionFactory for MapRegionFactory {
    fn build_region(&self, name: &str) -> Arc<dyn CacheRegion> {
        Arc::new(MapCacheRegion::new(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_put_get_evict() {
        let region = MapCacheRegion::new("customers");
        let key = CacheKey::new(Value::BigInt(1), "Customer", "Customer");
        assert!(region.get(&key).is_none());
        region.put(
            key.clone(),
            CachedEntry {
                state: vec![Value::from("a")],
                version: None,
            },
        );
        assert_eq!(region.get(&key).map(|e| e.state.len()), Some(1));
        region.evict(&key);
        assert!(region.get(&key).is_none());
    }

    #[test]
    fn keys_differ_by_entity_name() {
        let a = CacheKey::new(Value::BigInt(1), "Customer", "Party");
        let b = CacheKey::new(Value::BigInt(1), "Supplier", "Party");
        assert_ne!(a, b);
    }

    #[test]
    fn evict_all_empties_region() {
        let region = MapRegionFactory.build_region("r");
        region.put(
            CacheKey::new(Value::Int(1), "E", "E"),
            CachedEntry {
                state: vec![],
                version: None,
            },
        );
        region.evict_all();
        assert!(region.get(&CacheKey::new(Value::Int(1), "E", "E")).is_none());
    }
}
