//! Session factory: the state shared by every session.
//!
//! A factory is built once and shared through `Arc`. It owns the metamodel,
//! the type registry, the two plan caches (translated and native queries),
//! the second-level cache regions, named queries and the query result cache.

use crate::config::SessionConfig;
use crate::session::Session;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use strata_core::{
    CacheRegion, ConnectionProvider, Error, ExternalTransaction, MappingErrorKind, Metamodel,
    QueryTranslator, RegionFactory, Result, Row, TypeRegistry,
};
use strata_query::{NativeSqlTranslator, QueryPlanCache};

/// A query registered on the factory under a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedQuery {
    pub text: String,
    pub native: bool,
}

// ============================================================================
// Query result cache
// ============================================================================

#[derive(Debug, Clone)]
struct CachedResult {
    rows: Vec<Row>,
    spaces: BTreeSet<String>,
    timestamp: u64,
}

/// Results of cacheable queries, invalidated per query space.
///
/// A result is served only while none of its spaces has been written since
/// the result was read.
#[derive(Debug, Default)]
pub struct QueryResultCache {
    results: Mutex<HashMap<u64, CachedResult>>,
    invalidated: RwLock<HashMap<String, Arc<AtomicU64>>>,
    clock: AtomicU64,
}

impl QueryResultCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical timestamp to take before running a query whose result will
    /// be cached.
    pub fn now(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn get(&self, key: u64) -> Option<Vec<Row>> {
        let cached = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
            .cloned()?;
        let stale = cached
            .spaces
            .iter()
            .any(|space| self.last_invalidation(space) >= cached.timestamp);
        if stale {
            tracing::debug!(key, "Query cache entry is stale");
            self.results
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            return None;
        }
        tracing::debug!(key, rows = cached.rows.len(), "Query cache hit");
        Some(cached.rows)
    }

    pub fn put(&self, key: u64, spaces: BTreeSet<String>, rows: Vec<Row>, timestamp: u64) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                CachedResult {
                    rows,
                    spaces,
                    timestamp,
                },
            );
    }

    /// Mark `spaces` as written now.
    pub fn invalidate<'a>(&self, spaces: impl IntoIterator<Item = &'a String>) {
        let stamp = self.now();
        for space in spaces {
            if let Some(cell) = self
                .invalidated
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(space)
            {
                cell.store(stamp, Ordering::SeqCst);
                continue;
            }
            let mut map = self
                .invalidated
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            map.entry(space.clone())
                .or_insert_with(|| Arc::new(AtomicU64::new(0)))
                .store(stamp, Ordering::SeqCst);
        }
    }

    fn last_invalidation(&self, space: &str) -> u64 {
        self.invalidated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(space)
            .map_or(0, |cell| cell.load(Ordering::SeqCst))
    }

    pub fn len(&self) -> usize {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

// ============================================================================
// SessionFactory
// ============================================================================

/// Shared, thread-safe state behind every [`Session`].
pub struct SessionFactory {
    metamodel: Arc<Metamodel>,
    types: Arc<TypeRegistry>,
    provider: Arc<dyn ConnectionProvider>,
    config: SessionConfig,
    plans: QueryPlanCache,
    native_plans: QueryPlanCache,
    region_factory: Option<Arc<dyn RegionFactory>>,
    regions: RwLock<HashMap<String, Arc<dyn CacheRegion>>>,
    named_queries: BTreeMap<String, NamedQuery>,
    filters: BTreeSet<String>,
    external_transaction: Option<Arc<dyn ExternalTransaction>>,
    query_cache: QueryResultCache,
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("config", &self.config)
            .field("plans", &self.plans.len())
            .field("native_plans", &self.native_plans.len())
            .field("named_queries", &self.named_queries.len())
            .field("filters", &self.filters)
            .field("external_transaction", &self.external_transaction.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionFactory {
    pub fn builder(metamodel: Metamodel, provider: Arc<dyn ConnectionProvider>) -> SessionFactoryBuilder {
        SessionFactoryBuilder::new(metamodel, provider)
    }

    /// Open a new session. Sessions are cheap; open one per unit of work.
    pub fn open_session(self: &Arc<Self>) -> Session {
        Session::open(Arc::clone(self))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn metamodel(&self) -> &Arc<Metamodel> {
        &self.metamodel
    }

    pub fn types(&self) -> &Arc<TypeRegistry> {
        &self.types
    }

    pub fn provider(&self) -> &Arc<dyn ConnectionProvider> {
        &self.provider
    }

    /// Plan cache for translated queries and collection filters.
    pub fn plan_cache(&self) -> &QueryPlanCache {
        &self.plans
    }

    pub fn native_plan_cache(&self) -> &QueryPlanCache {
        &self.native_plans
    }

    pub fn query_cache(&self) -> &QueryResultCache {
        &self.query_cache
    }

    pub fn external_transaction(&self) -> Option<&Arc<dyn ExternalTransaction>> {
        self.external_transaction.as_ref()
    }

    pub fn named_query(&self, name: &str) -> Result<&NamedQuery> {
        self.named_queries.get(name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownQuery,
                None,
                format!("Named query not known: {name}"),
            )
        })
    }

    pub fn has_filter(&self, name: &str) -> bool {
        self.filters.contains(name)
    }

    pub fn filter_names(&self) -> impl Iterator<Item = &str> {
        self.filters.iter().map(String::as_str)
    }

    /// Cache region by name, built on first use.
    ///
    /// Returns `None` when the second-level cache is disabled or no region
    /// factory is configured.
    pub fn cache_region(&self, name: &str) -> Option<Arc<dyn CacheRegion>> {
        if !self.config.use_second_level_cache {
            return None;
        }
        if let Some(region) = self
            .regions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
        {
            return Some(Arc::clone(region));
        }
        let factory = self.region_factory.as_ref()?;
        let mut regions = self.regions.write().unwrap_or_else(PoisonError::into_inner);
        let region = regions.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(region = %name, "Building cache region");
            factory.build_region(name)
        });
        Some(Arc::clone(region))
    }

    /// Evict every cache region of entities stored in `spaces`.
    pub fn evict_regions_for_spaces(&self, spaces: &BTreeSet<String>) {
        for persister in self.metamodel.persisters_for_spaces(spaces) {
            if let Some(region) = persister.cache_region().and_then(|r| self.cache_region(r)) {
                tracing::debug!(region = %region.name(), entity = %persister.entity_name(), "Evicting region after bulk statement");
                region.evict_all();
            }
        }
    }

    /// Invalidate cached query results that read any of `spaces`.
    pub fn invalidate_spaces(&self, spaces: &BTreeSet<String>) {
        if !spaces.is_empty() {
            tracing::trace!(spaces = ?spaces, "Invalidating query spaces");
            self.query_cache.invalidate(spaces);
        }
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Builder for [`SessionFactory`].
#[must_use]
pub struct SessionFactoryBuilder {
    metamodel: Metamodel,
    provider: Arc<dyn ConnectionProvider>,
    types: TypeRegistry,
    config: SessionConfig,
    translator: Option<Arc<dyn QueryTranslator>>,
    native: NativeSqlTranslator,
    region_factory: Option<Arc<dyn RegionFactory>>,
    named_queries: BTreeMap<String, NamedQuery>,
    filters: BTreeSet<String>,
    external_transaction: Option<Arc<dyn ExternalTransaction>>,
}

impl SessionFactoryBuilder {
    pub fn new(metamodel: Metamodel, provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            metamodel,
            provider,
            types: TypeRegistry::new(),
            config: SessionConfig::default(),
            translator: None,
            native: NativeSqlTranslator::new(),
            region_factory: None,
            named_queries: BTreeMap::new(),
            filters: BTreeSet::new(),
            external_transaction: None,
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn types(mut self, types: TypeRegistry) -> Self {
        self.types = types;
        self
    }

    /// Translator for object queries. Defaults to the native translator.
    pub fn translator(mut self, translator: Arc<dyn QueryTranslator>) -> Self {
        self.translator = Some(translator);
        self
    }

    /// Translator for native SQL. Its filters are registered as factory
    /// filters.
    pub fn native_translator(mut self, translator: NativeSqlTranslator) -> Self {
        self.native = translator;
        self
    }

    pub fn region_factory(mut self, factory: Arc<dyn RegionFactory>) -> Self {
        self.region_factory = Some(factory);
        self
    }

    pub fn named_query(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.named_queries.insert(
            name.into(),
            NamedQuery {
                text: text.into(),
                native: false,
            },
        );
        self
    }

    pub fn named_native_query(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.named_queries.insert(
            name.into(),
            NamedQuery {
                text: text.into(),
                native: true,
            },
        );
        self
    }

    /// Declare a filter name that sessions may enable.
    pub fn filter(mut self, name: impl Into<String>) -> Self {
        self.filters.insert(name.into());
        self
    }

    pub fn external_transaction(mut self, transaction: Arc<dyn ExternalTransaction>) -> Self {
        self.external_transaction = Some(transaction);
        self
    }

    /// Build the factory, translating every named query first when
    /// `validate_named_queries` is set.
    pub fn build(self) -> Result<Arc<SessionFactory>> {
        let mut filters = self.filters;
        filters.extend(self.native.filter_names().map(str::to_string));

        let native: Arc<dyn QueryTranslator> = Arc::new(self.native);
        let translator = self.translator.unwrap_or_else(|| Arc::clone(&native));
        let size = self.config.plan_cache_size;
        let plans = QueryPlanCache::new(translator, size);
        let native_plans = QueryPlanCache::new(native, size);

        if self.config.validate_named_queries && !self.named_queries.is_empty() {
            let (native_queries, queries): (Vec<_>, Vec<_>) =
                self.named_queries.iter().partition(|(_, q)| q.native);
            let mut failures = Vec::new();
            for (cache, list) in [(&plans, queries), (&native_plans, native_queries)] {
                let pairs = list.iter().map(|(name, q)| (name.as_str(), q.text.as_str()));
                if let Err(Error::PlanValidation(e)) = cache.validate_all(pairs) {
                    failures.extend(e.failures);
                }
            }
            if !failures.is_empty() {
                tracing::error!(failed = failures.len(), "Named query validation failed");
                return Err(Error::PlanValidation(strata_core::PlanValidationError {
                    failures,
                }));
            }
            tracing::debug!(count = self.named_queries.len(), "Named queries validated");
        }

        Ok(Arc::new(SessionFactory {
            metamodel: Arc::new(self.metamodel),
            types: Arc::new(self.types),
            provider: self.provider,
            config: self.config,
            plans,
            native_plans,
            region_factory: self.region_factory,
            regions: RwLock::new(HashMap::new()),
            named_queries: self.named_queries,
            filters,
            external_transaction: self.external_transaction,
            query_cache: QueryResultCache::new(),
        }))
    }
}
