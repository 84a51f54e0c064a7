//! Query plan caching.
//!
//! Compiled plans are keyed by a [`PlanSignature`]: query text, shallow flag,
//! enabled filter names, collection role and the parameter metadata of the
//! text. Two requests with the same signature share one plan; changing any
//! component compiles a new one.
//!
//! Compilation runs outside the cache lock. When two threads race to compile
//! the same signature, the first inserted plan wins and both callers receive
//! it. Hits take only the read lock; recency is stamped atomically.

use std::borrow::Borrow;
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use strata_core::{
    Error, ParameterMetadata, PlanValidationError, QueryTranslator, Result, TranslatedQuery,
    TranslationRequest,
};

/// Cache key of one compiled plan.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlanSignature {
    pub text: String,
    pub shallow: bool,
    pub filters: BTreeSet<String>,
    pub collection_role: Option<String>,
    pub metadata: Arc<ParameterMetadata>,
}

/// A compiled, immutable query plan.
#[derive(Debug)]
pub struct QueryPlan {
    signature: PlanSignature,
    translated: TranslatedQuery,
}

impl QueryPlan {
    pub fn signature(&self) -> &PlanSignature {
        &self.signature
    }

    pub fn metadata(&self) -> &Arc<ParameterMetadata> {
        &self.signature.metadata
    }

    pub fn translated(&self) -> &TranslatedQuery {
        &self.translated
    }

    pub fn sql(&self) -> &str {
        &self.translated.sql
    }

    pub fn query_spaces(&self) -> &BTreeSet<String> {
        &self.translated.query_spaces
    }
}

#[derive(Debug)]
struct Slot<V> {
    value: Arc<V>,
    last_used: AtomicU64,
    hits: AtomicU64,
}

/// Bounded map evicting its least recently used entry on insert.
#[derive(Debug)]
struct LruMap<K, V> {
    entries: RwLock<HashMap<K, Slot<V>>>,
    max_size: usize,
}

impl<K: Eq + Hash + Clone, V> LruMap<K, V> {
    fn new(max_size: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(max_size.min(256))),
            max_size,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<K, Slot<V>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<K, Slot<V>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn get<Q>(&self, key: &Q, now: u64) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        let entries = self.read();
        let slot = entries.get(key)?;
        slot.last_used.fetch_max(now, Ordering::Relaxed);
        slot.hits.fetch_add(1, Ordering::Relaxed);
        Some(Arc::clone(&slot.value))
    }

    /// Insert unless another caller got there first; either way return the
    /// cached value.
    fn insert(&self, key: K, value: Arc<V>, now: u64) -> Arc<V> {
        let mut entries = self.write();
        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            Self::evict_lru(&mut entries);
        }
        let slot = entries.entry(key).or_insert_with(|| Slot {
            value,
            last_used: AtomicU64::new(now),
            hits: AtomicU64::new(0),
        });
        slot.last_used.fetch_max(now, Ordering::Relaxed);
        Arc::clone(&slot.value)
    }

    fn evict_lru(entries: &mut HashMap<K, Slot<V>>) {
        let lru = entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_used.load(Ordering::Relaxed))
            .map(|(key, _)| key.clone());
        if let Some(evicted) = lru.and_then(|key| entries.remove(&key)) {
            tracing::trace!(hits = evicted.hits.load(Ordering::Relaxed), "evicted cache entry");
        }
    }

    fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.read().contains_key(key)
    }

    fn len(&self) -> usize {
        self.read().len()
    }

    fn clear(&self) {
        self.write().clear();
    }
}

/// LRU cache of compiled query plans, shared by every session of a factory.
#[derive(Debug)]
pub struct QueryPlanCache {
    translator: Arc<dyn QueryTranslator>,
    plans: LruMap<PlanSignature, QueryPlan>,
    metadata: LruMap<String, ParameterMetadata>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl QueryPlanCache {
    pub fn new(translator: Arc<dyn QueryTranslator>, max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            translator,
            plans: LruMap::new(max_size),
            metadata: LruMap::new(max_size),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn translator(&self) -> &Arc<dyn QueryTranslator> {
        &self.translator
    }

    /// Parameter metadata of a query text, computed once per text.
    pub fn parameter_metadata(&self, text: &str) -> Result<Arc<ParameterMetadata>> {
        if let Some(found) = self.metadata.get(text, self.tick()) {
            return Ok(found);
        }
        let computed = Arc::new(self.translator.parameter_metadata(text)?);
        Ok(self.metadata.insert(text.to_string(), computed, self.tick()))
    }

    /// Get the plan for a request, compiling it on a miss.
    pub fn get_plan(&self, request: &TranslationRequest<'_>) -> Result<Arc<QueryPlan>> {
        let metadata = self.parameter_metadata(request.text)?;
        let signature = PlanSignature {
            text: request.text.to_string(),
            shallow: request.shallow,
            filters: request.enabled_filters.clone(),
            collection_role: request.collection_role.map(str::to_string),
            metadata,
        };

        if let Some(plan) = self.plans.get(&signature, self.tick()) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(plan);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            query = %request.text,
            shallow = request.shallow,
            filters = request.enabled_filters.len(),
            "compiling query plan"
        );
        let translated = self.translator.translate(request)?;
        let compiled = Arc::new(QueryPlan {
            signature: signature.clone(),
            translated,
        });
        Ok(self.plans.insert(signature, compiled, self.tick()))
    }

    /// Compile every `(name, text)` pair, collecting all failures into one
    /// error instead of stopping at the first.
    pub fn validate_all<'a>(
        &self,
        queries: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Result<()> {
        let no_filters = BTreeSet::new();
        let mut failures = Vec::new();
        for (name, text) in queries {
            let request = TranslationRequest {
                text,
                shallow: false,
                enabled_filters: &no_filters,
                collection_role: None,
            };
            if let Err(e) = self.get_plan(&request) {
                tracing::error!(query = %name, error = %e, "named query failed validation");
                failures.push((name.to_string(), e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PlanValidation(PlanValidationError { failures }))
        }
    }

    pub fn contains(&self, signature: &PlanSignature) -> bool {
        self.plans.contains(signature)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.plans.clear();
        self.metadata.clear();
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn miss_count(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }
}
