//! Queries bound to a session.
//!
//! Translated queries, native SQL and collection filters share one execution
//! path. They differ only in their [`QueryKind`]: which plan cache compiles
//! them, whether enabled filters apply, whether `iterate` is available and
//! whether ordinal 0 is reserved for the collection owner.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use strata_core::{
    CancelToken, CollectionRef, EntityPersister, EntityRef, EntityResolver, Error, LockMode, LockOptions,
    Result, Row, RowStream, Statement, StatementKind, StoreError, StoreResult, TranslationRequest,
    UsageErrorKind, Value, ValueType,
};
use strata_query::{ParameterBinder, QueryParameters, QueryPlan, QueryPlanCache, RowSelection, ScrollMode, TypedValue};

use crate::action::Completion;
use crate::config::{CacheMode, FlushMode, TrackingMode};
use crate::scroll::ScrollableResults;
use crate::session::{Session, lock_state, with_connection};

// ============================================================================
// Kinds and results
// ============================================================================

/// What a query's text is and how it is compiled.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryKind {
    /// Text handed to the configured query translator.
    Translated,
    /// SQL executed as written.
    Native,
    /// Native `{? = call ...}` procedure call; the first placeholder is the
    /// return value and user positions start after it.
    Callable,
    /// Condition over the elements of one collection instance.
    Filter { role: String, owner: Value },
}

impl QueryKind {
    /// Whether results can be streamed one entity at a time.
    pub fn supports_iterate(&self) -> bool {
        matches!(self, QueryKind::Translated)
    }

    /// Whether enabled session filters apply.
    pub fn supports_filtering(&self) -> bool {
        !matches!(self, QueryKind::Native | QueryKind::Callable)
    }

    /// Whether ordinal 0 is filled by the runtime rather than the caller.
    fn reserves_first(&self) -> bool {
        matches!(self, QueryKind::Filter { .. } | QueryKind::Callable)
    }

    /// Native kind for `sql`: procedure-call escapes become callable.
    fn native(sql: &str) -> Self {
        let compact: String = sql
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        if compact.starts_with("{?=call") {
            QueryKind::Callable
        } else {
            QueryKind::Native
        }
    }

    fn collection_role(&self) -> Option<&str> {
        match self {
            QueryKind::Filter { role, .. } => Some(role),
            _ => None,
        }
    }
}

/// One result of a query: a managed entity when the statement returns an
/// entity type, the raw row otherwise.
#[derive(Debug, Clone)]
pub enum QueryResult {
    Entity(EntityRef),
    Row(Row),
}

impl QueryResult {
    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            QueryResult::Entity(e) => Some(e),
            QueryResult::Row(_) => None,
        }
    }

    pub fn into_entity(self) -> Option<EntityRef> {
        match self {
            QueryResult::Entity(e) => Some(e),
            QueryResult::Row(_) => None,
        }
    }

    pub fn as_row(&self) -> Option<&Row> {
        match self {
            QueryResult::Row(r) => Some(r),
            QueryResult::Entity(_) => None,
        }
    }

    fn same_as(&self, other: &QueryResult) -> bool {
        match (self, other) {
            (QueryResult::Entity(a), QueryResult::Entity(b)) => a.ptr_eq(b),
            (QueryResult::Row(a), QueryResult::Row(b)) => {
                a.len() == b.len() && a.values().iter().zip(b.values()).all(|(x, y)| x.identity_eq(y))
            }
            _ => false,
        }
    }
}

/// A compiled plan with its bound statement parameters.
struct Prepared {
    plan: Arc<QueryPlan>,
    parameters: QueryParameters,
    values: Vec<Value>,
}

impl Prepared {
    fn statement(&self, cancel: &CancelToken) -> Statement {
        let selection = self.parameters.selection();
        let mut statement = Statement::new(self.plan.sql(), self.values.clone()).with_cancel(cancel.clone());
        statement.first_row = selection.first_row;
        statement.max_rows = selection.max_rows;
        statement.fetch_size = selection.fetch_size;
        statement.timeout = selection.timeout;
        statement.callable = self.parameters.is_callable();
        statement.for_update = self.parameters.lock_options().strongest().is_pessimistic();
        statement
    }

    fn returned_entity(&self) -> Option<&str> {
        self.plan.translated().returned_entity.as_deref()
    }
}

// ============================================================================
// Query
// ============================================================================

/// A query under construction or ready to run.
///
/// Bindings stay on the query; running it never mutates them, so the same
/// query can be executed again after rebinding some or none of them.
#[derive(Debug)]
pub struct Query<'s> {
    session: &'s mut Session,
    kind: QueryKind,
    binder: ParameterBinder,
    selection: RowSelection,
    lock_options: LockOptions,
    cacheable: bool,
    cache_region: Option<String>,
    read_only: Option<bool>,
    flush_mode: Option<FlushMode>,
    cache_mode: Option<CacheMode>,
    cancel: CancelToken,
}

impl<'s> Query<'s> {
    pub(crate) fn new(session: &'s mut Session, kind: QueryKind, text: &str) -> Result<Self> {
        session.check_open()?;
        let factory = Arc::clone(session.factory());
        let metadata = plan_cache(&factory, &kind).parameter_metadata(text)?;
        // A filter's owner placeholder is not part of the caller's text.
        let metadata = if matches!(kind, QueryKind::Filter { .. }) {
            Arc::new(metadata.reserving_first())
        } else {
            metadata
        };
        let limit = factory.config().in_expression_limit;
        let resolver: Arc<dyn EntityResolver> = Arc::clone(factory.metamodel()) as Arc<dyn EntityResolver>;
        let binder = ParameterBinder::new(text, metadata, Arc::clone(factory.types()))
            .with_entity_resolver(resolver)
            .with_in_expression_limit((limit > 0).then_some(limit));
        Ok(Self {
            session,
            kind,
            binder,
            selection: RowSelection::default(),
            lock_options: LockOptions::default(),
            cacheable: false,
            cache_region: None,
            read_only: None,
            flush_mode: None,
            cache_mode: None,
            cancel: CancelToken::new(),
        })
    }

    pub fn kind(&self) -> &QueryKind {
        &self.kind
    }

    /// The query text as written; list expansion never changes it.
    pub fn query_string(&self) -> &str {
        self.binder.query()
    }

    pub fn named_parameters(&self) -> BTreeSet<String> {
        self.binder.named_parameter_names()
    }

    /// Token that cancels the statement this query is running.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    // ------------------------------------------------------------------
    // Binding
    // ------------------------------------------------------------------

    fn ordinal(&self, position: usize) -> usize {
        if self.kind.reserves_first() {
            position + 1
        } else {
            position
        }
    }

    /// Bind a positional parameter (0-based).
    pub fn set_positional(&mut self, position: usize, value: impl Into<Value>) -> Result<&mut Self> {
        let ordinal = self.ordinal(position);
        self.binder.set_positional(ordinal, value)?;
        Ok(self)
    }

    pub fn set_positional_typed(
        &mut self,
        position: usize,
        value: impl Into<Value>,
        value_type: ValueType,
    ) -> Result<&mut Self> {
        let ordinal = self.ordinal(position);
        self.binder.set_positional_typed(ordinal, value.into(), value_type)?;
        Ok(self)
    }

    /// Bind a named parameter.
    pub fn set_parameter(&mut self, name: &str, value: impl Into<Value>) -> Result<&mut Self> {
        self.binder.set_named(name, value)?;
        Ok(self)
    }

    pub fn set_parameter_typed(
        &mut self,
        name: &str,
        value: impl Into<Value>,
        value_type: ValueType,
    ) -> Result<&mut Self> {
        self.binder.set_named_typed(name, value.into(), value_type)?;
        Ok(self)
    }

    /// Bind a list; each element becomes its own placeholder at execution.
    pub fn set_parameter_list(&mut self, name: &str, values: Vec<Value>) -> Result<&mut Self> {
        self.binder.set_parameter_list(name, values)?;
        Ok(self)
    }

    pub fn set_parameter_list_typed(
        &mut self,
        name: &str,
        values: Vec<Value>,
        value_type: ValueType,
    ) -> Result<&mut Self> {
        self.binder.set_parameter_list_typed(name, values, value_type)?;
        Ok(self)
    }

    /// Bind every named parameter found in `properties`.
    pub fn set_properties(&mut self, properties: &BTreeMap<String, Value>) -> Result<&mut Self> {
        self.binder.set_properties(properties)?;
        Ok(self)
    }

    // ------------------------------------------------------------------
    // Options
    // ------------------------------------------------------------------

    pub fn set_first_result(&mut self, first: usize) -> &mut Self {
        self.selection.first_row = Some(first);
        self
    }

    pub fn set_max_results(&mut self, max: usize) -> &mut Self {
        self.selection.max_rows = Some(max);
        self
    }

    pub fn set_fetch_size(&mut self, size: usize) -> &mut Self {
        self.selection.fetch_size = Some(size);
        self
    }

    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.selection.timeout = Some(timeout);
        self
    }

    pub fn set_lock_mode(&mut self, mode: LockMode) -> &mut Self {
        self.lock_options = LockOptions::new(mode);
        self
    }

    pub fn set_lock_mode_for(&mut self, alias: &str, mode: LockMode) -> &mut Self {
        self.lock_options = std::mem::take(&mut self.lock_options).with_alias(alias, mode);
        self
    }

    pub fn set_cacheable(&mut self, cacheable: bool) -> &mut Self {
        self.cacheable = cacheable;
        self
    }

    pub fn set_cache_region(&mut self, region: &str) -> &mut Self {
        self.cache_region = Some(region.to_string());
        self
    }

    /// Entities loaded by this query start read-only (or not), overriding
    /// the session default.
    pub fn set_read_only(&mut self, read_only: bool) -> &mut Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn set_flush_mode(&mut self, mode: FlushMode) -> &mut Self {
        self.flush_mode = Some(mode);
        self
    }

    pub fn set_cache_mode(&mut self, mode: CacheMode) -> &mut Self {
        self.cache_mode = Some(mode);
        self
    }

    // ------------------------------------------------------------------
    // Preparation
    // ------------------------------------------------------------------

    /// Verify bindings, expand lists into a private copy of the text,
    /// resolve the plan and flatten the statement parameters.
    fn prepare(&mut self, shallow: bool) -> Result<Prepared> {
        self.session.check_open()?;
        self.binder.verify(self.kind.reserves_first())?;
        let expanded = self.binder.expand()?;
        if expanded.rewritten {
            tracing::trace!(query = %expanded.text, "Expanded list parameters");
        }

        let factory = Arc::clone(self.session.factory());
        let no_filters = BTreeSet::new();
        let filters = if self.kind.supports_filtering() {
            self.session.enabled_filters()
        } else {
            &no_filters
        };
        let request = TranslationRequest {
            text: &expanded.text,
            shallow,
            enabled_filters: filters,
            collection_role: self.kind.collection_role(),
        };
        let plan = plan_cache(&factory, &self.kind).get_plan(&request)?;

        let mut parameters = self
            .binder
            .to_query_parameters(expanded.named)
            .with_selection(self.selection.clone())
            .with_lock_options(self.lock_options.clone())
            .with_cacheable(self.cacheable, self.cache_region.clone())
            .with_read_only(self.read_only)
            .with_callable(self.kind == QueryKind::Callable);
        if let QueryKind::Filter { role, owner } = &self.kind {
            parameters = parameters.with_positional(0, owner_binding(&factory, role, owner)?);
        }
        let values = parameters.bind_slots(&plan.translated().slots, plan.sql())?;
        Ok(Prepared {
            plan,
            parameters,
            values,
        })
    }

    /// Run `f` with the query's flush and cache modes installed on the
    /// session, restoring the previous modes afterwards.
    fn with_modes<T>(&mut self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let previous = (self.session.flush_mode(), self.session.cache_mode());
        if let Some(mode) = self.flush_mode {
            self.session.set_flush_mode(mode)?;
        }
        if let Some(mode) = self.cache_mode {
            self.session.set_cache_mode(mode)?;
        }
        let result = f(&mut *self.session);
        self.session.restore_modes(previous.0, previous.1);
        result
    }

    /// Selects return rows; so does a procedure call.
    fn ensure_returns_rows(&self, prepared: &Prepared) -> Result<()> {
        if prepared.plan.translated().kind == StatementKind::Select || self.kind == QueryKind::Callable {
            return Ok(());
        }
        Err(Error::usage(
            UsageErrorKind::Unsupported,
            format!("not a select statement, use execute_update(): {}", self.binder.query()),
        ))
    }

    fn read_only_default(&self) -> bool {
        self.read_only
            .unwrap_or_else(|| self.session.is_default_read_only())
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    /// Run the query and materialize every result.
    #[tracing::instrument(level = "debug", skip(self), fields(query = %self.binder.query()))]
    pub fn list(&mut self) -> Result<Vec<QueryResult>> {
        let prepared = self.prepare(false)?;
        self.ensure_returns_rows(&prepared)?;
        let read_only = self.read_only_default();
        let cancel = self.cancel.clone();
        self.with_modes(|session| {
            session.auto_flush_if_required(prepared.plan.query_spaces())?;
            let rows = fetch_cached(session, &prepared, &cancel)?;
            let results = materialize(session, &prepared, rows, read_only)?;
            tracing::debug!(results = results.len(), "Query returned");
            Ok(results)
        })
    }

    /// At most one result; several distinct results are an error.
    pub fn unique_result(&mut self) -> Result<Option<QueryResult>> {
        let mut results = self.list()?.into_iter();
        let Some(first) = results.next() else {
            return Ok(None);
        };
        for other in results {
            if !other.same_as(&first) {
                return Err(Error::usage(
                    UsageErrorKind::NonUniqueResult,
                    format!("query did not return a unique result: {}", self.binder.query()),
                ));
            }
        }
        Ok(Some(first))
    }

    /// Read identifiers only and load each entity as the iterator advances.
    pub fn iterate(&mut self) -> Result<QueryIter<'_>> {
        if !self.kind.supports_iterate() {
            return Err(Error::usage(
                UsageErrorKind::Unsupported,
                "iterate is not supported by native queries or collection filters",
            ));
        }
        let prepared = self.prepare(true)?;
        let cancel = self.cancel.clone();
        let rows = self.with_modes(|session| {
            session.auto_flush_if_required(prepared.plan.query_spaces())?;
            fetch(session, &prepared, &cancel)
        })?;
        tracing::debug!(ids = rows.len(), "Iterating query results");
        Ok(QueryIter {
            session: &mut *self.session,
            entity: prepared.returned_entity().map(str::to_string),
            rows: rows.into_iter(),
        })
    }

    /// Execute a bulk update or delete and return the affected row count.
    #[tracing::instrument(level = "debug", skip(self), fields(query = %self.binder.query()))]
    pub fn execute_update(&mut self) -> Result<u64> {
        let prepared = self.prepare(false)?;
        if prepared.plan.translated().kind != StatementKind::Update {
            return Err(Error::usage(
                UsageErrorKind::Unsupported,
                format!("not an update statement, use list(): {}", self.binder.query()),
            ));
        }
        let cancel = self.cancel.clone();
        self.with_modes(|session| {
            let spaces = prepared.plan.query_spaces();
            session.auto_flush_if_required(spaces)?;
            let statement = prepared.statement(&cancel);
            let count = with_connection(&session.link, |conn| {
                conn.execute(&statement)
                    .map_err(|e| Error::from_store(e, Some(&statement.sql)))
            })?;
            let factory = Arc::clone(session.factory());
            factory.evict_regions_for_spaces(spaces);
            if session.in_transaction() {
                session.queue.register_completion(Completion {
                    spaces: spaces.iter().cloned().collect(),
                    evict: None,
                });
            } else {
                factory.invalidate_spaces(spaces);
            }
            tracing::debug!(count, spaces = ?spaces, "Bulk statement executed");
            Ok(count)
        })
    }

    /// Open a cursor over the results. The session keeps its connection
    /// until the cursor is closed or dropped.
    pub fn scroll(&mut self, mode: ScrollMode) -> Result<ScrollableResults<'_>> {
        let prepared = self.prepare(false)?;
        self.ensure_returns_rows(&prepared)?;
        let read_only = self.read_only_default();
        let cancel = self.cancel.clone();
        let statement = prepared.statement(&cancel);
        let persister = prepared
            .returned_entity()
            .map(|name| self.session.factory().metamodel().entity_persister(name))
            .transpose()?;
        let stream = self.with_modes(|session| {
            session.auto_flush_if_required(prepared.plan.query_spaces())?;
            open_stream(session, &statement)
        })?;
        Ok(ScrollableResults::open(
            &mut *self.session,
            stream,
            statement,
            mode,
            persister,
            prepared.plan.translated().fetches_collection,
            read_only,
        ))
    }
}

/// Results of [`Query::iterate`]: each step loads one entity by identifier.
#[derive(Debug)]
pub struct QueryIter<'a> {
    session: &'a mut Session,
    entity: Option<String>,
    rows: std::vec::IntoIter<Row>,
}

impl Iterator for QueryIter<'_> {
    type Item = Result<QueryResult>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let row = self.rows.next()?;
            let Some(entity) = &self.entity else {
                return Some(Ok(QueryResult::Row(row)));
            };
            let id = row.get(0).cloned().unwrap_or(Value::Null);
            match self.session.get(entity, id) {
                Ok(Some(found)) => return Some(Ok(QueryResult::Entity(found))),
                // Deleted since the identifiers were read.
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

// ============================================================================
// Session entry points
// ============================================================================

impl Session {
    /// A query in the configured query language.
    pub fn create_query(&mut self, text: &str) -> Result<Query<'_>> {
        Query::new(self, QueryKind::Translated, text)
    }

    /// A native SQL query. Session filters do not apply. A `{? = call ...}`
    /// escape is run as a callable statement.
    pub fn create_native_query(&mut self, sql: &str) -> Result<Query<'_>> {
        Query::new(self, QueryKind::native(sql), sql)
    }

    /// A query over the elements of a managed collection. Positional
    /// parameters of `text` start at 0 as usual; the owner key is bound
    /// automatically.
    pub fn create_filter(&mut self, collection: &CollectionRef, text: &str) -> Result<Query<'_>> {
        self.check_open()?;
        let entry = self.context.collection_entry(collection).ok_or_else(|| {
            Error::usage(
                UsageErrorKind::NotManaged,
                format!("collection of role {} is not associated with this session", collection.role()),
            )
        })?;
        let owner = entry
            .loaded_key
            .clone()
            .or_else(|| entry.current_key.clone())
            .ok_or_else(|| {
                Error::usage(
                    UsageErrorKind::NotManaged,
                    format!("collection of role {} has no persistent owner", entry.role),
                )
            })?;
        let role = entry.role.clone();
        Query::new(self, QueryKind::Filter { role, owner }, text)
    }

    /// A query registered on the factory under `name`.
    pub fn get_named_query(&mut self, name: &str) -> Result<Query<'_>> {
        let named = self.factory().named_query(name)?.clone();
        let kind = if named.native {
            QueryKind::native(&named.text)
        } else {
            QueryKind::Translated
        };
        Query::new(self, kind, &named.text)
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn plan_cache<'f>(factory: &'f crate::factory::SessionFactory, kind: &QueryKind) -> &'f QueryPlanCache {
    match kind {
        QueryKind::Native | QueryKind::Callable => factory.native_plan_cache(),
        QueryKind::Translated | QueryKind::Filter { .. } => factory.plan_cache(),
    }
}

/// The owner key of a filtered collection, typed as the owner's identifier.
fn owner_binding(factory: &crate::factory::SessionFactory, role: &str, owner: &Value) -> Result<TypedValue> {
    let metamodel = factory.metamodel();
    let collection = metamodel.collection_persister(role)?;
    let persister = metamodel.entity_persister(collection.owner_entity())?;
    Ok(TypedValue::new(owner.clone(), persister.identifier_type().clone()))
}

/// Rows from the query result cache when allowed, from the store otherwise.
fn fetch_cached(session: &Session, prepared: &Prepared, cancel: &CancelToken) -> Result<Vec<Row>> {
    let factory = Arc::clone(session.factory());
    let use_cache = prepared.parameters.is_cacheable() && factory.config().use_query_cache;
    if !use_cache {
        return fetch(session, prepared, cancel);
    }
    let key = prepared.parameters.result_cache_key(prepared.plan.sql(), &prepared.values);
    let cache = factory.query_cache();
    if session.cache_mode().is_get_enabled() {
        if let Some(rows) = cache.get(key) {
            return Ok(rows);
        }
    }
    let timestamp = cache.now();
    let rows = fetch(session, prepared, cancel)?;
    if session.cache_mode().is_put_enabled() {
        cache.put(key, prepared.plan.query_spaces().clone(), rows.clone(), timestamp);
    }
    Ok(rows)
}

fn fetch(session: &Session, prepared: &Prepared, cancel: &CancelToken) -> Result<Vec<Row>> {
    let statement = prepared.statement(cancel);
    with_connection(&session.link, |conn| {
        let mut stream = conn
            .query(&statement)
            .map_err(|e| Error::from_store(e, Some(&statement.sql)))?;
        let rows = drain(stream.as_mut(), cancel);
        stream.close();
        rows.map_err(|e| Error::from_store(e, Some(&statement.sql)))
    })
}

fn drain(stream: &mut dyn RowStream, cancel: &CancelToken) -> StoreResult<Vec<Row>> {
    let mut rows = Vec::new();
    while let Some(row) = stream.next_row()? {
        if cancel.is_cancelled() {
            return Err(StoreError::cancelled());
        }
        rows.push(row);
    }
    Ok(rows)
}

/// Open a result stream for a cursor and pin the connection until the
/// cursor closes.
fn open_stream(session: &Session, statement: &Statement) -> Result<Box<dyn RowStream>> {
    let mut link = lock_state(&session.link);
    let result = link
        .connection()
        .and_then(|conn| conn.query(statement).map_err(|e| Error::from_store(e, Some(&statement.sql))));
    match result {
        Ok(stream) => {
            link.open_cursors += 1;
            Ok(stream)
        }
        Err(e) => {
            link.release_if_idle();
            Err(e)
        }
    }
}

/// Resolve rows through the identity map when the statement returns an
/// entity; lock them when the query asked for a lock.
fn materialize(session: &mut Session, prepared: &Prepared, rows: Vec<Row>, read_only: bool) -> Result<Vec<QueryResult>> {
    let Some(entity) = prepared.returned_entity() else {
        return Ok(rows.into_iter().map(QueryResult::Row).collect());
    };
    let persister: Arc<dyn EntityPersister> = session.factory().metamodel().entity_persister(entity)?;
    let lock = prepared.parameters.lock_options().strongest();
    let reduced = session.tracking_mode() == TrackingMode::Reduced;
    let mut results = Vec::with_capacity(rows.len());
    let mut detach = Vec::new();
    for row in &rows {
        let (managed, created) = session.hydrate_row(&persister, row, read_only)?;
        if lock != LockMode::None {
            session.lock(&managed, lock)?;
        }
        if created && reduced {
            detach.push(managed.clone());
        }
        results.push(QueryResult::Entity(managed));
    }
    for entity in detach {
        session.evict_entity(&entity)?;
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionConfig;
    use crate::events::OperationKind;
    use crate::factory::SessionFactory;
    use crate::test_support::{JournalCollectionPersister, JournalPersister, Journal, RecordingProvider, entries, journal};
    use strata_core::{
        BindingErrorKind, Element, ElementKind, Entity, Metamodel, PropertyMapping, SqlType,
    };
    use strata_core::{ParameterMetadata, QueryTranslator, TranslatedQuery, TranslationRequest};
    use strata_query::NativeSqlTranslator;

    /// Object-query translator whose customer queries fetch-join the tags
    /// collection.
    #[derive(Debug)]
    struct FetchJoinTranslator(NativeSqlTranslator);

    impl QueryTranslator for FetchJoinTranslator {
        fn parameter_metadata(&self, text: &str) -> Result<ParameterMetadata> {
            self.0.parameter_metadata(text)
        }

        fn translate(&self, request: &TranslationRequest<'_>) -> Result<TranslatedQuery> {
            let mut translated = self.0.translate(request)?;
            translated.fetches_collection = translated.returned_entity.is_some();
            Ok(translated)
        }
    }

    struct Fixture {
        journal: Journal,
        provider: Arc<RecordingProvider>,
        factory: Arc<SessionFactory>,
        customers: Arc<JournalPersister>,
    }

    impl Fixture {
        fn new(config: SessionConfig) -> Self {
            Self::build(config, None)
        }

        fn build(config: SessionConfig, translator: Option<Arc<dyn QueryTranslator>>) -> Self {
            let journal = journal();
            let customers = Arc::new(
                JournalPersister::new("Customer", &journal)
                    .versioned()
                    .property(PropertyMapping::collection("tags", "Customer.tags")),
            );
            let mut metamodel = Metamodel::new();
            metamodel.register_entity(customers.clone());
            metamodel.register_collection(Arc::new(JournalCollectionPersister::new(
                "Customer.tags",
                "Customer",
                ElementKind::Value(SqlType::Text),
                &journal,
            )));
            let native = NativeSqlTranslator::new()
                .with_entity("customer", "Customer", "id")
                .with_collection("Customer.tags", "customer_tags", "customer_id", None)
                .with_filter("active", "active = 1");
            let provider = RecordingProvider::new(&journal);
            let mut builder = SessionFactory::builder(metamodel, provider.clone())
                .config(config)
                .native_translator(native)
                .named_native_query("allCustomers", "select * from customer");
            if let Some(translator) = translator {
                builder = builder.translator(translator);
            }
            let factory = builder.build().unwrap();
            Self {
                journal,
                provider,
                factory,
                customers,
            }
        }

        fn session(&self) -> Session {
            self.factory.open_session()
        }

        fn log(&self) -> Vec<String> {
            entries(&self.journal)
        }

        fn clear_log(&self) {
            self.journal.lock().unwrap().clear();
        }

        fn queries(&self) -> usize {
            self.log().iter().filter(|l| l.starts_with("query ")).count()
        }
    }

    fn customer_row(id: i64, name: &str) -> Row {
        Row::new(
            vec!["id".into(), "name".into(), "version".into(), "tags".into()],
            vec![Value::BigInt(id), name.into(), Value::BigInt(0), Value::Null],
        )
    }

    #[test]
    fn test_list_resolves_rows_through_identity_map() {
        let fx = Fixture::new(SessionConfig::default());
        fx.provider.script(vec![customer_row(7, "bob")]);
        fx.provider.script(vec![customer_row(7, "bob")]);
        let mut session = fx.session();

        let first = session.create_native_query("select * from customer").unwrap().list().unwrap();
        let second = session.create_native_query("select * from customer").unwrap().list().unwrap();
        let a = first[0].as_entity().unwrap();
        let b = second[0].as_entity().unwrap();
        assert!(a.ptr_eq(b));
        assert!(session.contains(a).unwrap());
        assert_eq!(
            fx.log(),
            vec!["query select * from customer", "query select * from customer"]
        );
    }

    #[test]
    fn test_rows_without_mapped_entity_are_returned_raw() {
        let fx = Fixture::new(SessionConfig::default());
        fx.provider.script(vec![Row::new(vec!["n".into()], vec![Value::BigInt(3)])]);
        let mut session = fx.session();
        let results = session
            .create_native_query("select count(*) as n from invoice")
            .unwrap()
            .list()
            .unwrap();
        assert_eq!(results[0].as_row().unwrap().get(0), Some(&Value::BigInt(3)));
        assert_eq!(session.context().entity_count(), 0);
    }

    #[test]
    fn test_parameter_list_expands_per_execution() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        let mut query = session
            .create_native_query("select * from customer where id in (:ids)")
            .unwrap();
        query
            .set_parameter_list("ids", vec![Value::BigInt(1), Value::BigInt(2), Value::BigInt(3)])
            .unwrap();
        query.list().unwrap();
        assert_eq!(query.query_string(), "select * from customer where id in (:ids)");

        query
            .set_parameter_list("ids", vec![Value::BigInt(4), Value::BigInt(5)])
            .unwrap();
        query.list().unwrap();
        assert_eq!(
            fx.log(),
            vec![
                "query select * from customer where id in (?, ?, ?)",
                "query select * from customer where id in (?, ?)",
            ]
        );
    }

    #[test]
    fn test_unbound_named_parameter_is_rejected() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        let err = session
            .create_native_query("select * from customer where name = :name")
            .unwrap()
            .list()
            .unwrap_err();
        assert_eq!(err.binding_kind(), Some(BindingErrorKind::MissingNamed));
        assert!(fx.log().is_empty());
    }

    #[test]
    fn test_autoflush_only_for_overlapping_spaces_in_transaction() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();

        session.save(&EntityRef::new(Entity::new("Customer").with_id(1_i64).with("name", "ann"))).unwrap();
        session.create_native_query("select * from customer").unwrap().list().unwrap();
        assert_eq!(fx.log(), vec!["query select * from customer"]);
        fx.clear_log();

        session.begin_transaction().unwrap();
        session.create_native_query("select * from invoice").unwrap().list().unwrap();
        session.create_native_query("select * from customer").unwrap().list().unwrap();
        assert_eq!(
            fx.log(),
            vec![
                "begin",
                "query select * from invoice",
                "insert Customer#1",
                "query select * from customer",
            ]
        );
    }

    #[test]
    fn test_query_without_tables_does_not_autoflush() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        session.begin_transaction().unwrap();
        session.save(&EntityRef::new(Entity::new("Customer").with_id(1_i64).with("name", "ann"))).unwrap();
        session.create_native_query("select 1").unwrap().list().unwrap();
        assert_eq!(fx.log(), vec!["begin", "query select 1"]);
    }

    #[test]
    fn test_always_flush_mode_goes_through_flush_handlers() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        let flushes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&flushes);
        session.handlers().on_pre(OperationKind::Flush, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        session.set_flush_mode(FlushMode::Always).unwrap();
        session.begin_transaction().unwrap();
        session.save(&EntityRef::new(Entity::new("Customer").with_id(1_i64).with("name", "ann"))).unwrap();
        session.create_native_query("select * from invoice").unwrap().list().unwrap();
        assert_eq!(fx.log(), vec!["begin", "insert Customer#1", "query select * from invoice"]);
        assert_eq!(flushes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_manual_flush_mode_override_skips_autoflush() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        session.begin_transaction().unwrap();
        session.save(&EntityRef::new(Entity::new("Customer").with_id(1_i64).with("name", "ann"))).unwrap();
        session
            .create_native_query("select * from customer")
            .unwrap()
            .set_flush_mode(FlushMode::Manual)
            .list()
            .unwrap();
        assert_eq!(fx.log(), vec!["begin", "query select * from customer"]);
        assert_eq!(session.flush_mode(), FlushMode::Auto);
    }

    #[test]
    fn test_unique_result() {
        let fx = Fixture::new(SessionConfig::default());
        fx.provider.script(vec![customer_row(7, "bob"), customer_row(7, "bob")]);
        fx.provider.script(vec![customer_row(7, "bob"), customer_row(8, "eve")]);
        let mut session = fx.session();

        let one = session
            .create_native_query("select * from customer")
            .unwrap()
            .unique_result()
            .unwrap();
        assert!(one.is_some());

        let err = session
            .create_native_query("select * from customer")
            .unwrap()
            .unique_result()
            .unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::NonUniqueResult));
        assert!(session.create_native_query("select * from customer").unwrap().unique_result().unwrap().is_none());
    }

    #[test]
    fn test_execute_update_runs_bulk_statement() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        let mut query = session.create_native_query("update customer set name = :name").unwrap();
        query.set_parameter("name", "x").unwrap();
        assert_eq!(query.execute_update().unwrap(), 1);
        let err = query.list().unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::Unsupported));
        assert_eq!(fx.log(), vec!["execute update customer set name = ?"]);
    }

    #[test]
    fn test_iterate_reads_identifiers_then_loads() {
        let fx = Fixture::new(SessionConfig::default());
        fx.customers
            .seed(Value::BigInt(7), vec!["bob".into(), Value::BigInt(3), Value::Null]);
        fx.provider.script(vec![
            Row::new(vec!["id".into()], vec![Value::BigInt(7)]),
            Row::new(vec!["id".into()], vec![Value::BigInt(9)]),
        ]);
        let mut session = fx.session();
        let mut query = session.create_query("select * from customer where name = :name").unwrap();
        query.set_parameter("name", "bob").unwrap();
        let found: Vec<QueryResult> = query.iterate().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].as_entity().unwrap().id(), Some(Value::BigInt(7)));
        assert_eq!(
            fx.log(),
            vec![
                "query select id from customer where name = ?",
                "load Customer#7",
                "load Customer#9",
            ]
        );
    }

    #[test]
    fn test_iterate_unsupported_for_native_sql() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        let mut query = session.create_native_query("select * from customer").unwrap();
        let err = query.iterate().unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::Unsupported));
    }

    #[test]
    fn test_enabled_filters_skip_native_queries() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        session.enable_filter("active").unwrap();
        session.create_query("select * from customer").unwrap().list().unwrap();
        session.create_native_query("select * from customer").unwrap().list().unwrap();
        assert_eq!(
            fx.log(),
            vec![
                "query select * from customer where (active = 1)",
                "query select * from customer",
            ]
        );
    }

    #[test]
    fn test_named_query_lookup() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        let query = session.get_named_query("allCustomers").unwrap();
        assert_eq!(query.kind(), &QueryKind::Native);
        drop(query);
        assert!(session.get_named_query("missing").is_err());
    }

    #[test]
    fn test_collection_filter_binds_owner_first() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        let tags = CollectionRef::new("Customer.tags", vec![Element::Value("a".into())]);
        let c = EntityRef::new(
            Entity::new("Customer")
                .with_id(1_i64)
                .with("name", "ann")
                .with_collection("tags", tags.clone()),
        );
        session.save(&c).unwrap();
        session.flush().unwrap();
        fx.clear_log();

        let mut filter = session.create_filter(&tags, "where value = ?").unwrap();
        filter.set_positional(0, "a").unwrap();
        assert!(filter.set_positional(1, "b").is_err());
        let rows = filter.list().unwrap();
        assert!(rows.is_empty());
        assert_eq!(
            fx.log(),
            vec!["query select * from customer_tags where customer_id = ? and value = ?"]
        );

        let stray = CollectionRef::new("Customer.tags", Vec::new());
        let err = session.create_filter(&stray, "").unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::NotManaged));
    }

    #[test]
    fn test_query_cache_serves_until_spaces_are_written() {
        let fx = Fixture::new(SessionConfig::default().use_query_cache(true));
        let mut session = fx.session();
        for _ in 0..2 {
            session
                .create_native_query("select * from customer")
                .unwrap()
                .set_cacheable(true)
                .list()
                .unwrap();
        }
        assert_eq!(fx.queries(), 1);

        session
            .create_native_query("update customer set name = 'x'")
            .unwrap()
            .execute_update()
            .unwrap();
        session
            .create_native_query("select * from customer")
            .unwrap()
            .set_cacheable(true)
            .list()
            .unwrap();
        assert_eq!(fx.queries(), 2);
    }

    #[test]
    fn test_scroll_holds_connection_until_dropped() {
        let fx = Fixture::new(SessionConfig::default());
        fx.provider.script(vec![
            customer_row(1, "a"),
            customer_row(2, "b"),
            customer_row(3, "c"),
        ]);
        let mut session = fx.session();
        {
            let mut query = session.create_native_query("select * from customer").unwrap();
            let mut results = query.scroll(ScrollMode::Insensitive).unwrap();
            assert!(results.next().unwrap());
            let first = results.get().unwrap().unwrap();
            assert_eq!(first.as_entity().unwrap().id(), Some(Value::BigInt(1)));
            assert!(results.last().unwrap());
            assert_eq!(results.position(), 3);
            assert!(results.previous().unwrap());
            assert_eq!(results.position(), 2);
            assert_eq!(fx.provider.outstanding(), 1);
        }
        assert_eq!(fx.provider.outstanding(), 0);
        assert!(!session.is_connected());
    }

    #[test]
    fn test_forward_only_scroll_rejects_backward_moves() {
        let fx = Fixture::new(SessionConfig::default());
        fx.provider.script(vec![customer_row(1, "a"), customer_row(2, "b")]);
        let mut session = fx.session();
        let mut query = session.create_native_query("select * from customer").unwrap();
        let mut results = query.scroll(ScrollMode::ForwardOnly).unwrap();
        assert!(results.next().unwrap());
        assert!(results.next().unwrap());
        let err = results.previous().unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::ForwardOnly));
        results.close();
        assert!(results.is_closed());
    }

    #[test]
    fn test_scroll_and_list_agree_on_repeated_rows() {
        let fx = Fixture::new(SessionConfig::default());
        let rows = vec![customer_row(1, "a"), customer_row(1, "a"), customer_row(2, "b")];
        fx.provider.script(rows.clone());
        fx.provider.script(rows);
        let mut session = fx.session();

        let listed = session.create_query("select * from customer").unwrap().list().unwrap();
        let mut query = session.create_query("select * from customer").unwrap();
        let mut results = query.scroll(ScrollMode::Insensitive).unwrap();
        let mut scrolled = 0;
        while results.next().unwrap() {
            scrolled += 1;
        }
        assert_eq!(listed.len(), 3);
        assert_eq!(scrolled, 3);
    }

    #[test]
    fn test_scroll_groups_rows_of_fetch_joined_collection() {
        let translator = FetchJoinTranslator(NativeSqlTranslator::new().with_entity("customer", "Customer", "id"));
        let fx = Fixture::build(SessionConfig::default(), Some(Arc::new(translator)));
        fx.provider.script(vec![customer_row(1, "a"), customer_row(1, "a"), customer_row(2, "b")]);
        let mut session = fx.session();

        let mut query = session.create_query("select * from customer").unwrap();
        let mut results = query.scroll(ScrollMode::Insensitive).unwrap();
        assert!(results.next().unwrap());
        assert_eq!(results.get().unwrap().unwrap().as_entity().unwrap().id(), Some(Value::BigInt(1)));
        assert!(results.next().unwrap());
        assert_eq!(results.get().unwrap().unwrap().as_entity().unwrap().id(), Some(Value::BigInt(2)));
        assert!(!results.next().unwrap());
    }

    #[test]
    fn test_failed_move_keeps_current_row_attached() {
        let fx = Fixture::new(SessionConfig::default());
        fx.provider.script(vec![customer_row(1, "a"), customer_row(2, "b")]);
        fx.provider.script(vec![customer_row(3, "c"), customer_row(4, "d")]);
        let mut root = fx.session();
        let session = root.child(TrackingMode::Reduced).unwrap();

        let mut query = session.create_native_query("select * from customer").unwrap();
        let mut results = query.scroll(ScrollMode::ForwardOnly).unwrap();
        assert!(results.next().unwrap());
        let first = results.get().unwrap().unwrap().as_entity().unwrap().clone();
        assert!(results.previous().is_err());
        assert!(results.scroll(0).is_err());
        drop(results);
        drop(query);
        assert!(session.contains(&first).unwrap());

        let mut query = session.create_native_query("select * from customer").unwrap();
        let mut results = query.scroll(ScrollMode::ForwardOnly).unwrap();
        assert!(results.next().unwrap());
        let third = results.get().unwrap().unwrap().as_entity().unwrap().clone();
        assert!(results.next().unwrap());
        drop(results);
        drop(query);
        assert!(!session.contains(&third).unwrap());
    }

    #[test]
    fn test_scroll_requires_a_select() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        let mut query = session.create_native_query("update customer set name = 'x'").unwrap();
        let err = query.scroll(ScrollMode::Insensitive).unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::Unsupported));
        assert!(fx.log().is_empty());
    }

    #[test]
    fn test_callable_reserves_the_return_slot() {
        let fx = Fixture::new(SessionConfig::default());
        let mut session = fx.session();
        let mut query = session.create_native_query("{? = call top_customer(?)}").unwrap();
        assert_eq!(query.kind(), &QueryKind::Callable);
        query.set_positional(0, 5_i64).unwrap();
        query.list().unwrap();
        assert_eq!(fx.log(), vec!["call {? = call top_customer(?)} [null,5]"]);
    }
}
