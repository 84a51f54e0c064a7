//! The unit of work.
//!
//! A [`Session`] owns a persistence context (identity map plus tracking
//! records) and an action queue. Entity operations register, schedule and
//! look up instances; nothing is written until [`Session::flush`] runs the
//! dirty check and executes the queue phase by phase. Transactions are local
//! to the session's connection, or joined from an [`ExternalTransaction`]
//! configured on the factory.
//!
//! [`ExternalTransaction`]: strata_core::ExternalTransaction

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use strata_core::{
    Association, CacheKey, CachedEntry, CascadeStyle, CollectionRef, Connection, ConnectionErrorKind,
    ConnectionProvider, Element, ElementKind, EntityIdentity, EntityPersister, EntityRef, Error,
    IdGeneration, IsolationLevel, LockMode, MappingErrorKind, Property, PropertyKind, Result, Row,
    TransactionErrorKind, UsageErrorKind, Value,
};

use crate::action::{
    Action, CollectionAction, EntityDeleteAction, EntityInsertAction, EntityUpdateAction, Phase,
    dirty_properties, extract_state,
};
use crate::action_queue::{ActionQueue, FlushStats, QueueSnapshot};
use crate::config::{CacheMode, ConnectionReleaseMode, FlushMode, TrackingMode};
use crate::context::{
    CollectionEntry, ContextSnapshot, EntityEntry, EntityKey, EntityStatus, PersistenceContext,
};
use crate::events::{HandlerPipeline, OperationEvent, OperationKind, Stage};
use crate::factory::SessionFactory;
use crate::snapshot::GraphCopier;

// ============================================================================
// Connection state
// ============================================================================

/// Connection and transaction state shared by a root session and its
/// children.
pub(crate) struct ConnectionState {
    provider: Arc<dyn ConnectionProvider>,
    conn: Option<Box<dyn Connection>>,
    pub(crate) in_transaction: bool,
    /// The active transaction belongs to an external coordinator.
    joined_external: bool,
    pub(crate) open_cursors: usize,
    release_mode: ConnectionReleaseMode,
}

impl ConnectionState {
    fn new(provider: Arc<dyn ConnectionProvider>, release_mode: ConnectionReleaseMode) -> Self {
        Self {
            provider,
            conn: None,
            in_transaction: false,
            joined_external: false,
            open_cursors: 0,
            release_mode,
        }
    }

    /// The session's connection, acquired on first use.
    pub(crate) fn connection(&mut self) -> Result<&mut dyn Connection> {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => {
                tracing::trace!("Acquiring connection");
                self.provider
                    .acquire()
                    .map_err(|e| Error::connection(ConnectionErrorKind::Acquire, e))?
            }
        };
        Ok(&mut **self.conn.insert(conn))
    }

    /// Give the connection back unless a transaction or cursor still needs
    /// it, or the session keeps it until close.
    pub(crate) fn release_if_idle(&mut self) {
        if self.in_transaction
            || self.open_cursors > 0
            || self.release_mode == ConnectionReleaseMode::OnClose
        {
            return;
        }
        self.release();
    }

    pub(crate) fn release(&mut self) {
        if let Some(conn) = self.conn.take() {
            tracing::trace!("Releasing connection");
            self.provider.release(conn);
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.conn.is_some()
    }
}

impl fmt::Debug for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionState")
            .field("connected", &self.conn.is_some())
            .field("in_transaction", &self.in_transaction)
            .field("joined_external", &self.joined_external)
            .field("open_cursors", &self.open_cursors)
            .field("release_mode", &self.release_mode)
            .finish()
    }
}

pub(crate) fn lock_state(link: &Mutex<ConnectionState>) -> MutexGuard<'_, ConnectionState> {
    link.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Run `f` on the session's connection, then release it if idle.
///
/// Must not be nested: the state lock is held while `f` runs.
pub(crate) fn with_connection<T>(
    link: &Mutex<ConnectionState>,
    f: impl FnOnce(&mut dyn Connection) -> Result<T>,
) -> Result<T> {
    let mut state = lock_state(link);
    let result = state.connection().and_then(f);
    state.release_if_idle();
    result
}

// ============================================================================
// Session
// ============================================================================

/// A collection held by an entity property, with the cascade that applies
/// to its elements.
struct OwnedCollection {
    role: String,
    cascade: CascadeStyle,
    collection: CollectionRef,
}

/// Deep copy of a session's context and pending actions.
#[derive(Debug)]
pub struct SessionSnapshot {
    context: ContextSnapshot,
    queue: QueueSnapshot,
}

impl SessionSnapshot {
    pub fn entity_count(&self) -> usize {
        self.context.entity_count()
    }

    pub fn pending_actions(&self) -> usize {
        self.queue.len()
    }
}

/// A single-threaded unit of work over one connection.
pub struct Session {
    factory: Arc<SessionFactory>,
    closed: bool,
    /// Set when executing queued writes failed; only rollback and close
    /// remain available.
    broken: bool,
    tracking: TrackingMode,
    is_root: bool,
    pub(crate) link: Arc<Mutex<ConnectionState>>,
    pub(crate) context: PersistenceContext,
    pub(crate) queue: ActionQueue,
    flush_mode: FlushMode,
    cache_mode: CacheMode,
    enabled_filters: BTreeSet<String>,
    handlers: Arc<Mutex<HandlerPipeline>>,
    children: BTreeMap<TrackingMode, Session>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.closed)
            .field("broken", &self.broken)
            .field("tracking", &self.tracking)
            .field("root", &self.is_root)
            .field("entities", &self.context.entity_count())
            .field("queued_actions", &self.queue.len())
            .field("flush_mode", &self.flush_mode)
            .field("children", &self.children.len())
            .finish()
    }
}

impl Session {
    pub(crate) fn open(factory: Arc<SessionFactory>) -> Self {
        let config = factory.config();
        let link = ConnectionState::new(Arc::clone(factory.provider()), config.connection_release_mode);
        let flush_mode = config.flush_mode;
        Self::build(
            factory,
            Arc::new(Mutex::new(link)),
            TrackingMode::Full,
            true,
            flush_mode,
            CacheMode::default(),
            BTreeSet::new(),
            Arc::new(Mutex::new(HandlerPipeline::new())),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        factory: Arc<SessionFactory>,
        link: Arc<Mutex<ConnectionState>>,
        tracking: TrackingMode,
        is_root: bool,
        flush_mode: FlushMode,
        cache_mode: CacheMode,
        enabled_filters: BTreeSet<String>,
        handlers: Arc<Mutex<HandlerPipeline>>,
    ) -> Self {
        let config = factory.config();
        let mut context = PersistenceContext::new();
        context.set_default_read_only(config.default_read_only);
        let queue = ActionQueue::new()
            .with_order_inserts(config.order_inserts)
            .with_order_updates(config.order_updates)
            .with_batch_size(config.batch_size);
        tracing::debug!(tracking = ?tracking, root = is_root, "Session opened");
        Self {
            factory,
            closed: false,
            broken: false,
            tracking,
            is_root,
            link,
            context,
            queue,
            flush_mode,
            cache_mode,
            enabled_filters,
            handlers,
            children: BTreeMap::new(),
        }
    }

    // ------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------

    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    pub fn is_open(&self) -> bool {
        !self.closed
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    pub fn tracking_mode(&self) -> TrackingMode {
        self.tracking
    }

    pub fn in_transaction(&self) -> bool {
        lock_state(&self.link).in_transaction
    }

    /// Whether the session currently holds a connection.
    pub fn is_connected(&self) -> bool {
        lock_state(&self.link).is_connected()
    }

    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    pub fn set_flush_mode(&mut self, mode: FlushMode) -> Result<()> {
        self.ensure_open()?;
        self.flush_mode = mode;
        Ok(())
    }

    pub fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    pub fn set_cache_mode(&mut self, mode: CacheMode) -> Result<()> {
        self.ensure_open()?;
        self.cache_mode = mode;
        Ok(())
    }

    /// Put back modes saved before a query overrode them.
    pub(crate) fn restore_modes(&mut self, flush_mode: FlushMode, cache_mode: CacheMode) {
        self.flush_mode = flush_mode;
        self.cache_mode = cache_mode;
    }

    pub fn context(&self) -> &PersistenceContext {
        &self.context
    }

    pub fn action_queue(&self) -> &ActionQueue {
        &self.queue
    }

    /// Operation handlers; shared with child sessions.
    pub fn handlers(&self) -> MutexGuard<'_, HandlerPipeline> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fire(&self, event: OperationEvent) -> Result<()> {
        self.handlers().fire(&event)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::usage(UsageErrorKind::SessionClosed, "session is closed"));
        }
        Ok(())
    }

    pub(crate) fn ensure_usable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.broken {
            return Err(Error::usage(
                UsageErrorKind::SessionBroken,
                "session is unusable after a failed flush; roll back and close it",
            ));
        }
        Ok(())
    }

    /// Assert the session is usable and catch up with an external
    /// transaction.
    pub(crate) fn check_open(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.sync_external_transaction();
        Ok(())
    }

    fn sync_external_transaction(&mut self) {
        let Some(tx) = self.factory.external_transaction().cloned() else {
            return;
        };
        let active = tx.is_active();
        let completed = {
            let mut link = lock_state(&self.link);
            if active && !link.in_transaction {
                link.in_transaction = true;
                link.joined_external = true;
                tracing::debug!("Joined external transaction");
                None
            } else if !active && link.joined_external {
                link.in_transaction = false;
                link.joined_external = false;
                Some(!tx.is_rollback_only())
            } else {
                None
            }
        };
        if let Some(success) = completed {
            self.after_transaction_completion(success);
        }
    }

    fn require_root(&self, operation: &str) -> Result<()> {
        if self.is_root {
            Ok(())
        } else {
            Err(Error::usage(
                UsageErrorKind::Unsupported,
                format!("{operation} is only available on the root session"),
            ))
        }
    }

    fn cascading<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        self.context.increment_cascade_level();
        let result = f(self);
        self.context.decrement_cascade_level();
        result
    }

    fn persister_for(&self, entity: &EntityRef) -> Result<Arc<dyn EntityPersister>> {
        self.factory.metamodel().entity_persister(&entity.entity_name())
    }

    /// Collections held by `entity` for the persister's collection
    /// properties. The property's cascade wins over the role's default.
    fn owned_collections(
        &self,
        entity: &EntityRef,
        persister: &dyn EntityPersister,
    ) -> Result<Vec<OwnedCollection>> {
        let held: Vec<(String, CascadeStyle, CollectionRef)> = {
            let e = entity.read();
            persister
                .properties()
                .iter()
                .filter_map(|m| match &m.kind {
                    PropertyKind::Collection { role } => e
                        .collection(&m.name)
                        .map(|c| (role.clone(), m.cascade, c.clone())),
                    _ => None,
                })
                .collect()
        };
        held.into_iter()
            .map(|(role, cascade, collection)| {
                let cascade = if cascade.is_none() {
                    self.factory.metamodel().collection_persister(&role)?.cascade()
                } else {
                    cascade
                };
                Ok(OwnedCollection {
                    role,
                    cascade,
                    collection,
                })
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Save
    // ------------------------------------------------------------------

    /// Make a transient instance persistent and return its identifier.
    pub fn save(&mut self, entity: &EntityRef) -> Result<Value> {
        self.check_open()?;
        self.fire(OperationEvent::for_entity(OperationKind::Save, Stage::Pre, entity))?;
        let id = self.save_entity(entity)?;
        self.fire(OperationEvent::for_entity(OperationKind::Save, Stage::Post, entity))?;
        Ok(id)
    }

    /// Make a transient instance persistent. Detached instances are
    /// rejected.
    pub fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_open()?;
        self.fire(OperationEvent::for_entity(OperationKind::Persist, Stage::Pre, entity))?;
        if !self.context.contains(entity) {
            let persister = self.persister_for(entity)?;
            let has_id = entity.id().is_some_and(|id| !id.is_null());
            if has_id && persister.id_generation() != IdGeneration::Assigned {
                return Err(Error::usage(
                    UsageErrorKind::DetachedEntity,
                    format!("detached entity passed to persist: {}", persister.entity_name()),
                ));
            }
        }
        self.save_entity(entity)?;
        self.fire(OperationEvent::for_entity(OperationKind::Persist, Stage::Post, entity))
    }

    /// Reattach a detached instance; it is written at the next flush.
    pub fn update(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_open()?;
        self.fire(OperationEvent::for_entity(OperationKind::Update, Stage::Pre, entity))?;
        match self.context.entry(entity) {
            Some(entry) if entry.is_removed() => {
                return Err(Error::usage(
                    UsageErrorKind::NotManaged,
                    format!("deleted instance passed to update: {}", entry.entity_name),
                ));
            }
            Some(_) => {}
            None => {
                let persister = self.persister_for(entity)?;
                self.reattach(entity, &persister)?;
            }
        }
        self.fire(OperationEvent::for_entity(OperationKind::Update, Stage::Post, entity))
    }

    /// Save a transient instance or reattach a detached one.
    pub fn save_or_update(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_open()?;
        self.fire(OperationEvent::for_entity(OperationKind::SaveOrUpdate, Stage::Pre, entity))?;
        self.save_or_update_entity(entity)?;
        self.fire(OperationEvent::for_entity(OperationKind::SaveOrUpdate, Stage::Post, entity))
    }

    fn save_or_update_entity(&mut self, entity: &EntityRef) -> Result<()> {
        if let Some(entry) = self.context.entry(entity) {
            if entry.status == EntityStatus::Deleted {
                self.save_entity(entity)?;
            }
            return Ok(());
        }
        let persister = self.persister_for(entity)?;
        if self.is_transient(entity, &persister)? {
            self.save_entity(entity).map(drop)
        } else {
            self.reattach(entity, &persister)
        }
    }

    /// Unmanaged instance without a stored row: no identifier, an unset
    /// version, or an assigned identifier the store does not know.
    fn is_transient(&mut self, entity: &EntityRef, persister: &Arc<dyn EntityPersister>) -> Result<bool> {
        let (id, version) = {
            let e = entity.read();
            let version = persister.version_property().and_then(|p| e.get(p).cloned());
            (e.id().cloned(), version)
        };
        let Some(id) = id.filter(|id| !id.is_null()) else {
            return Ok(true);
        };
        if persister.version_property().is_some() {
            return Ok(version.is_none_or(|v| v.is_null()));
        }
        if persister.id_generation() != IdGeneration::Assigned {
            return Ok(false);
        }
        let row = with_connection(&self.link, |conn| persister.load(conn, &id, LockMode::None))?;
        Ok(row.is_none())
    }

    fn save_entity(&mut self, entity: &EntityRef) -> Result<Value> {
        if let Some(entry) = self.context.entry(entity).cloned() {
            match entry.status {
                EntityStatus::Deleted => {
                    self.queue.unschedule_deletion(entity);
                    if let Some(e) = self.context.entry_mut(entity) {
                        e.status = EntityStatus::Managed;
                    }
                    tracing::debug!(entity = %entry.entity_name, "Un-deleted entity scheduled for deletion");
                }
                EntityStatus::Gone => {
                    self.context.remove(entity);
                    return self.save_entity(entity);
                }
                _ => {}
            }
            return entry
                .id
                .or_else(|| entity.id())
                .ok_or_else(|| missing_identifier(&entry.entity_name, "managed entity has no identifier"));
        }

        let persister = self.persister_for(entity)?;
        let name = persister.entity_name().to_string();
        self.cascade_save_references(entity, persister.as_ref())?;

        let id = match persister.id_generation() {
            IdGeneration::Assigned => Some(entity.id().filter(|id| !id.is_null()).ok_or_else(|| {
                missing_identifier(
                    &name,
                    format!("ids for this class must be manually assigned before calling save(): {name}"),
                )
            })?),
            IdGeneration::Generated => {
                let generated = with_connection(&self.link, |conn| persister.generate_id(conn))?;
                let id = persister.identifier_type().coerce(generated);
                entity.write().set_id(Some(id.clone()));
                Some(id)
            }
            IdGeneration::Identity => None,
        };
        if let Some(property) = persister.version_property() {
            let unset = entity.read().get(property).is_none_or(Value::is_null);
            if unset {
                entity.write().set(property, Value::BigInt(0));
            }
        }

        self.context
            .put(entity, EntityEntry::new(EntityStatus::Saving, name.clone(), id))?;
        let insert = EntityInsertAction::new(entity.clone(), Arc::clone(&persister), entity.id());
        if insert.is_immediate() {
            let result = with_connection(&self.link, |conn| {
                self.queue
                    .execute_immediate(Action::EntityInsert(insert), conn, &mut self.context)
            });
            if let Err(e) = result {
                if self.queue.is_poisoned() {
                    self.broken = true;
                }
                tracing::error!(entity = %name, error = %e, "Immediate insert failed");
                self.context.remove(entity);
                return Err(e);
            }
        } else {
            self.queue.enqueue(Action::EntityInsert(insert));
        }

        for owned in self.owned_collections(entity, persister.as_ref())? {
            if self.context.collection_entry(&owned.collection).is_none() {
                self.context
                    .add_collection(&owned.collection, CollectionEntry::transient(owned.role));
            }
        }
        self.cascade_save_collections(entity, persister.as_ref())?;

        let id = entity
            .id()
            .ok_or_else(|| missing_identifier(&name, "no identifier after save"))?;
        tracing::debug!(entity = %name, id = %id, "Saved entity");
        Ok(id)
    }

    /// Register a detached instance as managed with unknown loaded state.
    fn reattach(&mut self, entity: &EntityRef, persister: &Arc<dyn EntityPersister>) -> Result<()> {
        let name = persister.entity_name().to_string();
        let id = entity
            .id()
            .filter(|id| !id.is_null())
            .ok_or_else(|| missing_identifier(&name, "cannot reattach an instance without identifier"))?;
        let mut entry = EntityEntry::new(EntityStatus::Managed, name.clone(), Some(id.clone()));
        entry.exists_in_store = true;
        entry.version = persister
            .version_property()
            .and_then(|p| entity.read().get(p).cloned());
        self.context.put(entity, entry)?;
        for owned in self.owned_collections(entity, persister.as_ref())? {
            if self.context.collection_entry(&owned.collection).is_none() {
                self.context
                    .add_collection(&owned.collection, CollectionEntry::loaded(owned.role, id.clone()));
            }
        }
        tracing::debug!(entity = %name, id = %id, "Reattached detached entity");
        self.cascade_save_references(entity, persister.as_ref())?;
        self.cascade_save_collections(entity, persister.as_ref())
    }

    fn cascade_save_references(&mut self, entity: &EntityRef, persister: &dyn EntityPersister) -> Result<()> {
        let targets = referenced_targets(entity, persister, |c| c.save);
        if targets.is_empty() {
            return Ok(());
        }
        self.cascading(|s| targets.iter().try_for_each(|t| s.save_or_update_entity(t)))
    }

    fn cascade_save_collections(&mut self, entity: &EntityRef, persister: &dyn EntityPersister) -> Result<()> {
        for owned in self.owned_collections(entity, persister)? {
            if !owned.cascade.save {
                continue;
            }
            let elements = element_entities(&owned.collection);
            self.cascading(|s| elements.iter().try_for_each(|e| s.save_or_update_entity(e)))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Schedule `entity` for deletion. Detached instances are reattached
    /// first; transient ones are ignored.
    pub fn delete(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_open()?;
        self.fire(OperationEvent::for_entity(OperationKind::Delete, Stage::Pre, entity))?;
        self.delete_entity(entity)?;
        self.fire(OperationEvent::for_entity(OperationKind::Delete, Stage::Post, entity))
    }

    fn delete_entity(&mut self, entity: &EntityRef) -> Result<()> {
        let persister = self.persister_for(entity)?;
        if !self.context.contains(entity) {
            let Some(id) = entity.id().filter(|id| !id.is_null()) else {
                tracing::debug!(entity = %persister.entity_name(), "Ignoring delete of a transient instance");
                return Ok(());
            };
            let mut entry = EntityEntry::new(EntityStatus::Managed, persister.entity_name(), Some(id));
            entry.exists_in_store = true;
            entry.version = persister
                .version_property()
                .and_then(|p| entity.read().get(p).cloned());
            self.context.put(entity, entry)?;
        }
        let Some(entry) = self.context.entry(entity).cloned() else {
            return Ok(());
        };
        if entry.is_removed() {
            return Ok(());
        }
        // A queued insert still runs first; the delete follows it at flush.
        let version = if entry.status == EntityStatus::Saving && self.queue.has_pending_insert(entity) {
            persister
                .version_property()
                .and_then(|p| entity.read().get(p).cloned())
        } else {
            entry.version.clone()
        };
        let id = entry
            .id
            .clone()
            .ok_or_else(|| missing_identifier(&entry.entity_name, "cannot delete an instance without identifier"))?;
        if let Some(e) = self.context.entry_mut(entity) {
            e.status = EntityStatus::Deleted;
        }

        for owned in self.owned_collections(entity, persister.as_ref())? {
            if !owned.cascade.delete {
                continue;
            }
            if !owned.collection.read().is_initialized() {
                self.load_collection(&owned.collection)?;
            }
            let elements = element_entities(&owned.collection);
            self.cascading(|s| elements.iter().try_for_each(|e| s.delete_entity(e)))?;
        }

        tracing::debug!(entity = %entry.entity_name, id = %id, "Scheduled entity deletion");
        self.queue.enqueue(Action::EntityDelete(EntityDeleteAction {
            entity: entity.clone(),
            persister: Arc::clone(&persister),
            id,
            version,
        }));

        let targets = referenced_targets(entity, persister.as_ref(), |c| c.delete);
        if targets.is_empty() {
            return Ok(());
        }
        self.cascading(|s| targets.iter().try_for_each(|t| s.delete_entity(t)))
    }

    // ------------------------------------------------------------------
    // Load
    // ------------------------------------------------------------------

    /// The instance with identifier `id`, or `None` if no row exists.
    pub fn get(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<Option<EntityRef>> {
        self.get_with_lock(entity_name, id, LockMode::None)
    }

    pub fn get_with_lock(
        &mut self,
        entity_name: &str,
        id: impl Into<Value>,
        lock: LockMode,
    ) -> Result<Option<EntityRef>> {
        self.check_open()?;
        let id = id.into();
        self.fire(OperationEvent::for_key(OperationKind::Load, Stage::Pre, entity_name, &id))?;
        let loaded = self.load_entity(entity_name, id.clone(), lock)?;
        self.fire(OperationEvent::for_key(OperationKind::Load, Stage::Post, entity_name, &id))?;
        Ok(loaded)
    }

    /// The instance with identifier `id`; a missing row is an error.
    pub fn load(&mut self, entity_name: &str, id: impl Into<Value>) -> Result<EntityRef> {
        let id = id.into();
        self.get(entity_name, id.clone())?
            .ok_or_else(|| object_not_found(entity_name, &id))
    }

    /// Identity map, then second-level cache, then the store.
    pub(crate) fn load_entity(&mut self, entity_name: &str, id: Value, lock: LockMode) -> Result<Option<EntityRef>> {
        let persister = self.factory.metamodel().entity_persister(entity_name)?;
        let id = persister.identifier_type().coerce(id);
        let key = EntityKey::new(id.clone(), persister.entity_name());

        if let Some(entity) = self.context.get(&key) {
            let Some(entry) = self.context.entry(&entity).cloned() else {
                return Ok(Some(entity));
            };
            if entry.is_removed() {
                return Ok(None);
            }
            if lock.greater_than(entry.lock_mode) && entry.exists_in_store {
                with_connection(&self.link, |conn| {
                    persister.lock(conn, &id, entry.version.as_ref(), lock)
                })?;
                if let Some(e) = self.context.entry_mut(&entity) {
                    e.lock_mode = lock;
                }
            }
            return Ok(Some(entity));
        }

        if let Some(cached) = self.cached_state(persister.as_ref(), &id, lock) {
            tracing::debug!(entity = %key, "Second-level cache hit");
            return self.assemble(&persister, id, cached.state, LockMode::None).map(Some);
        }

        let state = with_connection(&self.link, |conn| persister.load(conn, &id, lock))?;
        let Some(state) = state else {
            tracing::debug!(entity = %key, "No row found");
            return Ok(None);
        };
        self.cache_put(persister.as_ref(), &id, &state);
        self.assemble(&persister, id, state, lock).map(Some)
    }

    fn cache_key(persister: &dyn EntityPersister, id: &Value) -> CacheKey {
        CacheKey::new(id.clone(), persister.entity_name(), persister.root_entity_name())
    }

    fn cached_state(&self, persister: &dyn EntityPersister, id: &Value, lock: LockMode) -> Option<CachedEntry> {
        if !self.cache_mode.is_get_enabled() || lock.bypasses_cache() {
            return None;
        }
        let region = persister.cache_region().and_then(|r| self.factory.cache_region(r))?;
        let entry = region.get(&Self::cache_key(persister, id));
        if entry.is_none() {
            tracing::debug!(region = %region.name(), id = %id, "Second-level cache miss");
        }
        entry
    }

    fn cache_put(&self, persister: &dyn EntityPersister, id: &Value, state: &[Value]) {
        if !self.cache_mode.is_put_enabled() {
            return;
        }
        let Some(region) = persister.cache_region().and_then(|r| self.factory.cache_region(r)) else {
            return;
        };
        let key = Self::cache_key(persister, id);
        if self.cache_mode != CacheMode::Refresh && region.get(&key).is_some() {
            return;
        }
        let version = persister.version_index().and_then(|i| state.get(i).cloned());
        region.put(
            key,
            CachedEntry {
                state: state.to_vec(),
                version,
            },
        );
    }

    /// Build an instance from a state vector. References resolve to managed
    /// instances when present, otherwise to lazy cells; collections start
    /// lazy.
    fn materialize(
        &self,
        persister: &dyn EntityPersister,
        id: &Value,
        state: &[Value],
    ) -> (strata_core::Entity, Vec<(String, CollectionRef)>) {
        let mut entity = strata_core::Entity::new(persister.entity_name()).with_id(id.clone());
        let mut collections = Vec::new();
        for (mapping, value) in persister.properties().iter().zip(state) {
            match &mapping.kind {
                PropertyKind::Basic(_) => entity.set(mapping.name.clone(), value.clone()),
                PropertyKind::ManyToOne { target } => {
                    let assoc = if value.is_null() {
                        Association::empty(target.clone())
                    } else {
                        match self.context.get(&EntityKey::new(value.clone(), target.clone())) {
                            Some(managed) => Association::to(&managed),
                            None => Association::lazy(target.clone(), value.clone()),
                        }
                    };
                    entity.set_property(mapping.name.clone(), Property::Reference(assoc));
                }
                PropertyKind::Collection { role } => {
                    let collection = CollectionRef::lazy(role.clone());
                    entity.set_property(mapping.name.clone(), Property::Collection(collection.clone()));
                    collections.push((role.clone(), collection));
                }
            }
        }
        (entity, collections)
    }

    fn assemble(
        &mut self,
        persister: &Arc<dyn EntityPersister>,
        id: Value,
        state: Vec<Value>,
        lock: LockMode,
    ) -> Result<EntityRef> {
        let (entity, collections) = self.materialize(persister.as_ref(), &id, &state);
        let entity = EntityRef::new(entity);
        let version = persister.version_index().and_then(|i| state.get(i).cloned());
        let read_only = self.context.default_read_only();
        let entry = EntityEntry::loaded(persister.entity_name(), id.clone(), state, version, lock)
            .read_only(read_only);
        self.context.put(&entity, entry)?;
        for (role, collection) in collections {
            self.context
                .add_collection(&collection, CollectionEntry::loaded(role, id.clone()));
        }
        tracing::trace!(entity = %persister.entity_name(), id = %id, "Assembled entity");
        Ok(entity)
    }

    /// Resolve a query result row through the identity map. Returns the
    /// instance and whether it was created for this row.
    pub(crate) fn hydrate_row(
        &mut self,
        persister: &Arc<dyn EntityPersister>,
        row: &Row,
        read_only: bool,
    ) -> Result<(EntityRef, bool)> {
        let (id, state) = persister.hydrate(row)?;
        let id = persister.identifier_type().coerce(id);
        let key = EntityKey::new(id.clone(), persister.entity_name());
        if let Some(existing) = self.context.get(&key) {
            return Ok((existing, false));
        }
        let entity = self.assemble(persister, id, state, LockMode::None)?;
        if read_only {
            self.context.set_read_only(&entity, true)?;
        }
        Ok((entity, true))
    }

    /// Load the target of a lazy many-to-one.
    pub fn initialize_association(&mut self, entity: &EntityRef, property: &str) -> Result<Option<EntityRef>> {
        self.check_open()?;
        let (target, foreign_key) = {
            let mut e = entity.write();
            let name = e.entity_name().to_string();
            let assoc = e.association_mut(property).ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::UnknownProperty,
                    Some(&name),
                    format!("{property} is not an association"),
                )
            })?;
            if assoc.is_initialized() {
                return Ok(assoc.target().cloned());
            }
            assoc.begin_initialize()?;
            (assoc.target_entity().to_string(), assoc.foreign_key())
        };
        let loaded = match foreign_key {
            Some(fk) => self
                .load_entity(&target, fk.clone(), LockMode::None)
                .and_then(|found| found.map(Some).ok_or_else(|| object_not_found(&target, &fk))),
            None => Ok(None),
        };
        let mut e = entity.write();
        let Some(assoc) = e.association_mut(property) else {
            return loaded;
        };
        match loaded {
            Ok(value) => {
                assoc.finish_initialize(value.clone());
                Ok(value)
            }
            Err(err) => {
                assoc.abort_initialize();
                Err(err)
            }
        }
    }

    /// Load the elements of a lazy collection.
    pub fn initialize_collection(&mut self, collection: &CollectionRef) -> Result<()> {
        self.check_open()?;
        if collection.read().is_initialized() {
            return Ok(());
        }
        self.fire(OperationEvent::new(OperationKind::InitializeCollection, Stage::Pre))?;
        self.load_collection(collection)?;
        self.fire(OperationEvent::new(OperationKind::InitializeCollection, Stage::Post))
    }

    fn load_collection(&mut self, collection: &CollectionRef) -> Result<()> {
        let role = collection.role();
        let owner = self
            .context
            .collection_entry(collection)
            .and_then(|e| e.loaded_key.clone())
            .ok_or_else(|| {
                Error::usage(
                    UsageErrorKind::LazyInitialization,
                    format!("failed to lazily initialize a collection of role: {role}, no session or session was closed"),
                )
            })?;
        let persister = self.factory.metamodel().collection_persister(&role)?;
        collection.write().begin_initialize()?;
        match self.read_collection_elements(persister.as_ref(), &owner) {
            Ok(elements) => {
                let keys: Vec<Value> = elements.iter().filter_map(Element::key).collect();
                let count = elements.len();
                collection.write().finish_initialize(elements);
                if let Some(entry) = self.context.collection_entry_mut(collection) {
                    entry.snapshot = Some(keys);
                }
                tracing::debug!(role = %role, owner = %owner, count, "Initialized collection");
                Ok(())
            }
            Err(e) => {
                collection.write().abort_initialize();
                Err(e)
            }
        }
    }

    fn read_collection_elements(
        &mut self,
        persister: &dyn strata_core::CollectionPersister,
        owner: &Value,
    ) -> Result<Vec<Element>> {
        let keys = with_connection(&self.link, |conn| persister.load(conn, owner))?;
        match persister.element_kind() {
            ElementKind::Value(_) => Ok(keys.into_iter().map(Element::Value).collect()),
            ElementKind::Entity { target } => keys
                .into_iter()
                .map(|key| {
                    self.load_entity(target, key.clone(), LockMode::None)?
                        .map(Element::Entity)
                        .ok_or_else(|| object_not_found(target, &key))
                })
                .collect(),
        }
    }

    // ------------------------------------------------------------------
    // Merge / refresh / evict / lock
    // ------------------------------------------------------------------

    /// Copy the state of a detached instance onto the managed instance with
    /// the same identifier and return the managed one.
    pub fn merge(&mut self, entity: &EntityRef) -> Result<EntityRef> {
        self.check_open()?;
        self.fire(OperationEvent::for_entity(OperationKind::Merge, Stage::Pre, entity))?;
        let mut merged = HashSet::new();
        let managed = self.merge_entity(entity, &mut merged)?;
        self.fire(OperationEvent::for_entity(OperationKind::Merge, Stage::Post, &managed))?;
        Ok(managed)
    }

    fn merge_entity(&mut self, entity: &EntityRef, merged: &mut HashSet<EntityIdentity>) -> Result<EntityRef> {
        if self.context.contains(entity) {
            return Ok(entity.clone());
        }
        let persister = self.persister_for(entity)?;
        let name = persister.entity_name().to_string();
        let id = entity.id().filter(|id| !id.is_null());
        let managed = match &id {
            Some(id) => self.load_entity(&name, id.clone(), LockMode::None)?,
            None => None,
        };
        let Some(managed) = managed else {
            let copy = entity.detached_copy();
            self.save_entity(&copy)?;
            return Ok(copy);
        };
        if !merged.insert(entity.identity()) {
            return Ok(managed);
        }

        if let Some(property) = persister.version_property() {
            let incoming = entity.read().get(property).cloned();
            let current = managed.read().get(property).cloned();
            if let (Some(incoming), Some(current)) = (incoming, current) {
                if !incoming.is_null() && !incoming.identity_eq(&current) {
                    let id = id.unwrap_or(Value::Null);
                    return Err(Error::stale_state(
                        format!("Row was updated or deleted by another transaction: [{name}#{id}]"),
                        None,
                    ));
                }
            }
        }

        for mapping in persister.properties() {
            match &mapping.kind {
                PropertyKind::Basic(_) => {
                    let value = entity.read().get(&mapping.name).cloned();
                    if let Some(value) = value {
                        managed.write().set(mapping.name.clone(), value);
                    }
                }
                PropertyKind::ManyToOne { .. } => {
                    let assoc = entity.read().association(&mapping.name).cloned();
                    let Some(assoc) = assoc else { continue };
                    let cascaded = assoc.target().filter(|_| mapping.cascade.merge).cloned();
                    let reference = match cascaded {
                        Some(target) => Association::to(&self.merge_entity(&target, merged)?),
                        None => assoc,
                    };
                    managed
                        .write()
                        .set_property(mapping.name.clone(), Property::Reference(reference));
                }
                PropertyKind::Collection { .. } => {
                    let source = entity.read().collection(&mapping.name).cloned();
                    let target = managed.read().collection(&mapping.name).cloned();
                    if let (Some(source), Some(target)) = (source, target) {
                        self.merge_collection(&source, &target)?;
                    }
                }
            }
        }
        tracing::debug!(entity = %name, "Merged detached state");
        Ok(managed)
    }

    fn merge_collection(&mut self, source: &CollectionRef, target: &CollectionRef) -> Result<()> {
        if source.ptr_eq(target) {
            return Ok(());
        }
        let incoming = {
            let s = source.read();
            if !s.is_initialized() {
                return Ok(());
            }
            s.elements()?.to_vec()
        };
        if !target.read().is_initialized() {
            self.load_collection(target)?;
        }
        let mut t = target.write();
        if same_keys(t.elements()?, &incoming) {
            return Ok(());
        }
        t.clear()?;
        for element in incoming {
            t.push(element)?;
        }
        Ok(())
    }

    /// Re-read the state of a managed or detached instance from the store.
    pub fn refresh(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_open()?;
        self.fire(OperationEvent::for_entity(OperationKind::Refresh, Stage::Pre, entity))?;
        let mut visited = HashSet::new();
        self.refresh_entity(entity, &mut visited)?;
        self.fire(OperationEvent::for_entity(OperationKind::Refresh, Stage::Post, entity))
    }

    fn refresh_entity(&mut self, entity: &EntityRef, visited: &mut HashSet<EntityIdentity>) -> Result<()> {
        if !visited.insert(entity.identity()) {
            return Ok(());
        }
        let persister = self.persister_for(entity)?;
        let name = persister.entity_name().to_string();
        let id = entity
            .id()
            .filter(|id| !id.is_null())
            .ok_or_else(|| missing_identifier(&name, "cannot refresh an instance without identifier"))?;
        let targets = referenced_targets(entity, persister.as_ref(), |c| c.refresh);

        if let Some(region) = persister.cache_region().and_then(|r| self.factory.cache_region(r)) {
            region.evict(&Self::cache_key(persister.as_ref(), &id));
        }
        let state = with_connection(&self.link, |conn| persister.load(conn, &id, LockMode::None))?
            .ok_or_else(|| object_not_found(&name, &id))?;

        for owned in self.owned_collections(entity, persister.as_ref())? {
            self.context.remove_collection(&owned.collection);
        }
        let (fresh, collections) = self.materialize(persister.as_ref(), &id, &state);
        *entity.write() = fresh;
        let version = persister.version_index().and_then(|i| state.get(i).cloned());
        match self.context.entry_mut(entity) {
            Some(entry) => {
                entry.loaded_state = Some(state);
                entry.version = version;
                entry.exists_in_store = true;
            }
            None => {
                let read_only = self.context.default_read_only();
                self.context.put(
                    entity,
                    EntityEntry::loaded(name.clone(), id.clone(), state, version, LockMode::None)
                        .read_only(read_only),
                )?;
            }
        }
        for (role, collection) in collections {
            self.context
                .add_collection(&collection, CollectionEntry::loaded(role, id.clone()));
        }
        tracing::debug!(entity = %name, id = %id, "Refreshed entity");
        targets
            .iter()
            .try_for_each(|t| self.refresh_entity(t, visited))
    }

    /// Detach `entity` (and what it cascades evict to) from the session.
    pub fn evict(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_open()?;
        self.fire(OperationEvent::for_entity(OperationKind::Evict, Stage::Pre, entity))?;
        self.evict_entity(entity)?;
        self.fire(OperationEvent::for_entity(OperationKind::Evict, Stage::Post, entity))
    }

    pub(crate) fn evict_entity(&mut self, entity: &EntityRef) -> Result<()> {
        let Some(entry) = self.context.remove(entity) else {
            return Ok(());
        };
        let persister = self.factory.metamodel().entity_persister(&entry.entity_name)?;
        let owned = self.owned_collections(entity, persister.as_ref())?;
        for o in &owned {
            self.context.remove_collection(&o.collection);
        }
        tracing::trace!(entity = %entry.entity_name, "Evicted entity");
        for target in referenced_targets(entity, persister.as_ref(), |c| c.evict) {
            self.evict_entity(&target)?;
        }
        for o in owned.iter().filter(|o| o.cascade.evict) {
            for element in element_entities(&o.collection) {
                self.evict_entity(&element)?;
            }
        }
        Ok(())
    }

    /// Acquire `mode` on `entity`, reattaching an unmodified detached
    /// instance first.
    pub fn lock(&mut self, entity: &EntityRef, mode: LockMode) -> Result<()> {
        self.check_open()?;
        self.fire(OperationEvent::for_entity(OperationKind::Lock, Stage::Pre, entity))?;
        let persister = self.persister_for(entity)?;
        if !self.context.contains(entity) {
            self.reattach_unmodified(entity, &persister)?;
        }
        let entry = self
            .context
            .entry(entity)
            .cloned()
            .ok_or_else(|| not_managed(persister.entity_name()))?;
        if entry.is_removed() {
            return Err(Error::usage(
                UsageErrorKind::NotManaged,
                format!("attempted to lock a deleted instance: {}", entry.entity_name),
            ));
        }
        let id = entry
            .id
            .clone()
            .ok_or_else(|| missing_identifier(&entry.entity_name, "cannot lock an unsaved instance"))?;
        if mode.greater_than(entry.lock_mode) {
            with_connection(&self.link, |conn| {
                persister.lock(conn, &id, entry.version.as_ref(), mode)
            })?;
            if let Some(e) = self.context.entry_mut(entity) {
                e.lock_mode = mode;
            }
        }
        if matches!(mode, LockMode::OptimisticForceIncrement | LockMode::Force) {
            self.force_version_increment(entity, &persister, &entry)?;
        }
        let cascade_to: Vec<EntityRef> = referenced_targets(entity, persister.as_ref(), |c| c.lock)
            .into_iter()
            .filter(|t| self.context.contains(t))
            .collect();
        for target in cascade_to {
            self.lock(&target, mode)?;
        }
        self.fire(OperationEvent::for_entity(OperationKind::Lock, Stage::Post, entity))
    }

    fn reattach_unmodified(&mut self, entity: &EntityRef, persister: &Arc<dyn EntityPersister>) -> Result<()> {
        let name = persister.entity_name().to_string();
        let id = entity
            .id()
            .filter(|id| !id.is_null())
            .ok_or_else(|| missing_identifier(&name, "cannot lock a transient instance"))?;
        let state = extract_state(entity, persister.as_ref())?;
        let version = persister.version_index().and_then(|i| state.get(i).cloned());
        self.context.put(
            entity,
            EntityEntry::loaded(name, id.clone(), state, version, LockMode::None),
        )?;
        for owned in self.owned_collections(entity, persister.as_ref())? {
            if self.context.collection_entry(&owned.collection).is_some() {
                continue;
            }
            let mut entry = CollectionEntry::loaded(owned.role, id.clone());
            let c = owned.collection.read();
            if c.is_initialized() {
                entry.snapshot = c.element_keys().into_iter().collect();
            }
            drop(c);
            self.context.add_collection(&owned.collection, entry);
        }
        Ok(())
    }

    /// Write the next version right away.
    fn force_version_increment(
        &mut self,
        entity: &EntityRef,
        persister: &Arc<dyn EntityPersister>,
        entry: &EntityEntry,
    ) -> Result<()> {
        let (Some(index), Some(id)) = (persister.version_index(), entry.id.clone()) else {
            return Ok(());
        };
        let mut state = extract_state(entity, persister.as_ref())?;
        let next = increment_version(entry.version.as_ref());
        if let Some(slot) = state.get_mut(index) {
            *slot = next.clone();
        }
        let action = Action::EntityUpdate(EntityUpdateAction {
            entity: entity.clone(),
            persister: Arc::clone(persister),
            id,
            state,
            previous_version: entry.version.clone(),
            next_version: Some(next),
            dirty: vec![index],
        });
        let completion = with_connection(&self.link, |conn| action.execute(conn, &mut self.context))?;
        self.queue.register_completion(completion);
        self.complete_outside_transaction();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Membership / read-only
    // ------------------------------------------------------------------

    /// Whether `entity` is managed by this session and not deleted.
    pub fn contains(&self, entity: &EntityRef) -> Result<bool> {
        self.ensure_usable()?;
        Ok(self
            .context
            .entry(entity)
            .is_some_and(|e| !e.is_removed()))
    }

    pub fn is_read_only(&self, entity: &EntityRef) -> Result<bool> {
        self.ensure_usable()?;
        self.context.is_read_only(entity)
    }

    /// Mark a managed instance read-only (never dirty-checked) or
    /// modifiable again. Changes made while read-only are not written.
    pub fn set_read_only(&mut self, entity: &EntityRef, read_only: bool) -> Result<()> {
        self.ensure_usable()?;
        let was_read_only = self.context.is_read_only(entity)?;
        self.context.set_read_only(entity, read_only)?;
        if was_read_only && !read_only {
            let persister = self.persister_for(entity)?;
            let state = extract_state(entity, persister.as_ref())?;
            if let Some(entry) = self.context.entry_mut(entity) {
                entry.loaded_state = Some(state);
            }
        }
        Ok(())
    }

    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.context.set_default_read_only(read_only);
    }

    pub fn is_default_read_only(&self) -> bool {
        self.context.default_read_only()
    }

    // ------------------------------------------------------------------
    // Filters
    // ------------------------------------------------------------------

    pub fn enable_filter(&mut self, name: &str) -> Result<()> {
        self.ensure_usable()?;
        if !self.factory.has_filter(name) {
            return Err(Error::usage(
                UsageErrorKind::UnknownFilter,
                format!("No such filter configured [{name}]"),
            ));
        }
        self.enabled_filters.insert(name.to_string());
        for child in self.children.values_mut() {
            child.enabled_filters.insert(name.to_string());
        }
        Ok(())
    }

    pub fn disable_filter(&mut self, name: &str) {
        self.enabled_filters.remove(name);
        for child in self.children.values_mut() {
            child.enabled_filters.remove(name);
        }
    }

    pub fn enabled_filters(&self) -> &BTreeSet<String> {
        &self.enabled_filters
    }

    // ------------------------------------------------------------------
    // Flush
    // ------------------------------------------------------------------

    /// Write every pending change to the store.
    #[tracing::instrument(level = "debug", skip(self), fields(tracking = ?self.tracking))]
    pub fn flush(&mut self) -> Result<()> {
        self.check_open()?;
        if self.context.is_cascading() {
            return Err(Error::usage(
                UsageErrorKind::FlushDuringCascade,
                "Flush during cascade is dangerous",
            ));
        }
        self.fire(OperationEvent::new(OperationKind::Flush, Stage::Pre))?;
        self.prepare_flush()?;
        self.execute_flush()?;
        for child in self.children.values_mut() {
            child.flush()?;
        }
        self.fire(OperationEvent::new(OperationKind::Flush, Stage::Post))
    }

    /// Whether a flush would write anything.
    pub fn is_dirty(&mut self) -> Result<bool> {
        self.check_open()?;
        if self.queue.has_any_queued_actions() {
            return Ok(true);
        }
        let previous_removals = self.queue.count(Phase::CollectionRemoval);
        self.prepare_flush()?;
        let dirty = self.queue.has_any_queued_actions();
        self.queue.clear_from_flush_needed_check(previous_removals);
        self.reset_collection_flags();
        Ok(dirty)
    }

    /// Cascade saves, dirty-check entities and schedule collection writes.
    fn prepare_flush(&mut self) -> Result<()> {
        for entity in self.context.managed_entities() {
            let live = self
                .context
                .entry(&entity)
                .is_some_and(|e| matches!(e.status, EntityStatus::Managed | EntityStatus::Saving));
            if !live {
                continue;
            }
            let persister = self.persister_for(&entity)?;
            self.cascade_save_references(&entity, persister.as_ref())?;
            self.cascade_save_collections(&entity, persister.as_ref())?;
        }

        self.reset_collection_flags();

        for entity in self.context.managed_entities() {
            let Some(entry) = self.context.entry(&entity).cloned() else {
                continue;
            };
            if !matches!(entry.status, EntityStatus::Managed | EntityStatus::Saving) {
                continue;
            }
            let persister = self.persister_for(&entity)?;
            self.check_transient_references(&entity, persister.as_ref())?;
            for owned in self.owned_collections(&entity, persister.as_ref())? {
                if self.context.collection_entry(&owned.collection).is_none() {
                    self.context
                        .add_collection(&owned.collection, CollectionEntry::transient(owned.role));
                }
                if let Some(c) = self.context.collection_entry_mut(&owned.collection) {
                    c.reached = true;
                    c.current_key.clone_from(&entry.id);
                }
            }
            if entry.status == EntityStatus::Managed && !entry.is_read_only() && persister.is_mutable() {
                self.schedule_update_if_dirty(&entity, &persister, &entry)?;
            }
        }

        self.schedule_collections()
    }

    fn check_transient_references(&self, entity: &EntityRef, persister: &dyn EntityPersister) -> Result<()> {
        for target in referenced_targets(entity, persister, |_| true) {
            if !self.context.contains(&target) && target.id().is_none_or(|id| id.is_null()) {
                return Err(Error::usage(
                    UsageErrorKind::TransientReference,
                    format!(
                        "object references an unsaved transient instance - save the transient instance before flushing: {} -> {}",
                        persister.entity_name(),
                        target.entity_name()
                    ),
                ));
            }
        }
        Ok(())
    }

    fn schedule_update_if_dirty(
        &mut self,
        entity: &EntityRef,
        persister: &Arc<dyn EntityPersister>,
        entry: &EntityEntry,
    ) -> Result<()> {
        let Some(id) = entry.id.clone() else {
            return Ok(());
        };
        let mut state = extract_state(entity, persister.as_ref())?;
        let version_index = persister.version_index();
        let dirty: Vec<usize> = match &entry.loaded_state {
            Some(loaded) => dirty_properties(loaded, &state),
            None => (0..state.len()).collect(),
        }
        .into_iter()
        .filter(|&i| Some(i) != version_index)
        .collect();
        if dirty.is_empty() {
            return Ok(());
        }
        let next_version = version_index.map(|i| {
            let next = increment_version(entry.version.as_ref());
            if let Some(slot) = state.get_mut(i) {
                *slot = next.clone();
            }
            next
        });
        tracing::trace!(entity = %entry.entity_name, id = %id, dirty = ?dirty, "Entity is dirty");
        self.queue.enqueue(Action::EntityUpdate(EntityUpdateAction {
            entity: entity.clone(),
            persister: Arc::clone(persister),
            id,
            state,
            previous_version: entry.version.clone(),
            next_version,
            dirty,
        }));
        Ok(())
    }

    /// Schedule removal of unreached collections, creation of new ones and
    /// element diffs of changed ones.
    fn schedule_collections(&mut self) -> Result<()> {
        for collection in self.context.collections() {
            let Some(entry) = self.context.collection_entry(&collection).cloned() else {
                continue;
            };
            let persister = self.factory.metamodel().collection_persister(&entry.role)?;
            if !entry.reached {
                match entry.loaded_key {
                    Some(owner) => {
                        self.mark_collection(&collection, |e| e.do_remove = true);
                        self.queue.enqueue(Action::CollectionRemove(CollectionAction::new(
                            collection.clone(),
                            persister,
                            owner,
                        )));
                    }
                    None => {
                        self.context.remove_collection(&collection);
                    }
                }
                continue;
            }
            let Some(current) = entry.current_key.clone() else {
                continue;
            };
            let (initialized, dirty) = {
                let c = collection.read();
                (c.is_initialized(), c.is_dirty())
            };
            match entry.loaded_key {
                None => {
                    self.mark_collection(&collection, |e| e.do_recreate = true);
                    self.queue.enqueue(Action::CollectionRecreate(CollectionAction::new(
                        collection.clone(),
                        persister,
                        current,
                    )));
                }
                Some(loaded) if !loaded.identity_eq(&current) || (initialized && entry.snapshot.is_none()) => {
                    self.mark_collection(&collection, |e| {
                        e.do_remove = true;
                        e.do_recreate = true;
                    });
                    self.queue.enqueue(Action::CollectionRemove(CollectionAction::new(
                        collection.clone(),
                        Arc::clone(&persister),
                        loaded,
                    )));
                    self.queue.enqueue(Action::CollectionRecreate(CollectionAction::new(
                        collection.clone(),
                        persister,
                        current,
                    )));
                }
                Some(loaded) if initialized && dirty => {
                    self.mark_collection(&collection, |e| e.do_update = true);
                    self.queue.enqueue(Action::CollectionUpdate(CollectionAction::new(
                        collection.clone(),
                        persister,
                        loaded,
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn mark_collection(&mut self, collection: &CollectionRef, f: impl FnOnce(&mut CollectionEntry)) {
        if let Some(entry) = self.context.collection_entry_mut(collection) {
            f(entry);
        }
    }

    fn reset_collection_flags(&mut self) {
        for collection in self.context.collections() {
            self.mark_collection(&collection, CollectionEntry::reset_flush_flags);
        }
    }

    /// Execute the queue, clean up after it and log the outcome.
    fn execute_flush(&mut self) -> Result<()> {
        let started = Instant::now();
        let result = with_connection(&self.link, |conn| self.queue.execute(conn, &mut self.context));
        let stats: FlushStats = match result {
            Ok(stats) => stats,
            Err(e) => {
                if self.queue.is_poisoned() {
                    self.broken = true;
                    tracing::error!(error = %e, "Flush failed; the session must be rolled back and closed");
                }
                return Err(e);
            }
        };
        self.post_flush();
        tracing::info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            inserted = stats.inserted,
            updated = stats.updated,
            deleted = stats.deleted,
            collections_removed = stats.collections_removed,
            collections_updated = stats.collections_updated,
            collections_recreated = stats.collections_recreated,
            "Flush complete"
        );
        self.complete_outside_transaction();
        Ok(())
    }

    fn post_flush(&mut self) {
        for entity in self.context.managed_entities() {
            let gone = self
                .context
                .entry(&entity)
                .is_some_and(|e| e.status == EntityStatus::Gone);
            if gone {
                self.context.remove(&entity);
            }
        }
        self.reset_collection_flags();
    }

    /// Flush before a query when pending changes touch `spaces`. Returns
    /// whether a flush happened.
    pub(crate) fn auto_flush_if_required(&mut self, spaces: &BTreeSet<String>) -> Result<bool> {
        if !self.in_transaction() {
            tracing::debug!("Skipping autoflush outside a transaction");
            return Ok(false);
        }
        if self.context.is_cascading() {
            return Ok(false);
        }
        match self.flush_mode {
            FlushMode::Manual | FlushMode::Commit => return Ok(false),
            FlushMode::Always => {
                self.flush()?;
                return Ok(true);
            }
            FlushMode::Auto => {}
        }
        self.fire(OperationEvent::new(OperationKind::AutoFlush, Stage::Pre))?;
        let previous_removals = self.queue.count(Phase::CollectionRemoval);
        self.prepare_flush()?;
        // A query touching no known table cannot observe pending writes.
        let needed = !spaces.is_empty() && self.queue.are_tables_to_be_updated(spaces);
        if needed {
            tracing::debug!(spaces = ?spaces, "Autoflush: pending changes touch the query spaces");
            self.execute_flush()?;
        } else {
            tracing::debug!(spaces = ?spaces, "Autoflush not needed");
            self.queue.clear_from_flush_needed_check(previous_removals);
            self.reset_collection_flags();
        }
        self.fire(OperationEvent::new(OperationKind::AutoFlush, Stage::Post))?;
        Ok(needed)
    }

    /// Outside a transaction every executed statement is final: run the
    /// completion work right away.
    pub(crate) fn complete_outside_transaction(&mut self) {
        if self.in_transaction() {
            return;
        }
        let factory = Arc::clone(&self.factory);
        let spaces = self
            .queue
            .after_transaction_completion(true, &|region: &str| factory.cache_region(region));
        factory.invalidate_spaces(&spaces);
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn begin_transaction(&mut self) -> Result<()> {
        self.begin_transaction_with(None)
    }

    pub fn begin_transaction_with(&mut self, isolation: Option<IsolationLevel>) -> Result<()> {
        self.check_open()?;
        self.require_root("begin_transaction")?;
        let mut link = lock_state(&self.link);
        if link.in_transaction {
            return Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "a transaction is already active",
            ));
        }
        let result = link
            .connection()
            .and_then(|conn| conn.begin(isolation).map_err(|e| Error::from_store(e, None)));
        match result {
            Ok(()) => {
                link.in_transaction = true;
                tracing::debug!(isolation = ?isolation, "Transaction started");
                Ok(())
            }
            Err(e) => {
                link.release_if_idle();
                Err(e)
            }
        }
    }

    fn check_local_transaction(&self, operation: &str) -> Result<()> {
        let link = lock_state(&self.link);
        if !link.in_transaction {
            return Err(Error::transaction(
                TransactionErrorKind::NotActive,
                format!("no active transaction to {operation}"),
            ));
        }
        if link.joined_external {
            return Err(Error::usage(
                UsageErrorKind::Transaction,
                format!("cannot {operation} an externally managed transaction"),
            ));
        }
        Ok(())
    }

    /// Flush (unless manual), commit, then run completion work.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&mut self) -> Result<()> {
        self.check_open()?;
        self.require_root("commit")?;
        self.check_local_transaction("commit")?;
        if self.flush_mode.flushes_on_commit() {
            self.flush()?;
        }
        self.fire(OperationEvent::new(OperationKind::Commit, Stage::Pre))?;
        let result = {
            let mut link = lock_state(&self.link);
            let result = link
                .connection()
                .and_then(|conn| conn.commit().map_err(|e| Error::from_store(e, None)));
            if let Err(e) = &result {
                tracing::warn!(error = %e, "Commit failed; rolling back");
                if let Ok(conn) = link.connection() {
                    if let Err(rollback) = conn.rollback() {
                        tracing::warn!(error = %rollback, "Rollback after failed commit also failed");
                    }
                }
            }
            link.in_transaction = false;
            result
        };
        self.after_transaction_completion(result.is_ok());
        result?;
        tracing::debug!("Transaction committed");
        self.fire(OperationEvent::new(OperationKind::Commit, Stage::Post))
    }

    /// Roll back the local transaction. Available on a broken session.
    pub fn rollback(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::usage(UsageErrorKind::SessionClosed, "session is closed"));
        }
        self.require_root("rollback")?;
        self.check_local_transaction("roll back")?;
        self.fire(OperationEvent::new(OperationKind::Rollback, Stage::Pre))?;
        let result = {
            let mut link = lock_state(&self.link);
            let result = link
                .connection()
                .and_then(|conn| conn.rollback().map_err(|e| Error::from_store(e, None)));
            link.in_transaction = false;
            result
        };
        self.after_transaction_completion(false);
        result?;
        tracing::debug!("Transaction rolled back");
        self.fire(OperationEvent::new(OperationKind::Rollback, Stage::Post))
    }

    /// Close out a transaction: completion work on success, discard of
    /// unexecuted actions either way, lock reset and connection release.
    pub fn after_transaction_completion(&mut self, success: bool) {
        let factory = Arc::clone(&self.factory);
        let spaces = self
            .queue
            .after_transaction_completion(success, &|region: &str| factory.cache_region(region));
        factory.invalidate_spaces(&spaces);
        self.context.after_transaction_completion();
        for child in self.children.values_mut() {
            child.after_transaction_completion(success);
        }
        lock_state(&self.link).release_if_idle();
        tracing::debug!(success, "Transaction completed");
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Detach everything and drop unexecuted actions.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_usable()?;
        self.context.clear();
        self.queue.discard_pending();
        for child in self.children.values_mut() {
            child.clear()?;
        }
        tracing::debug!("Session cleared");
        Ok(())
    }

    /// Close the session and its children. The root rolls back an active
    /// local transaction and releases the connection.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::usage(UsageErrorKind::SessionClosed, "session is already closed"));
        }
        for (_, mut child) in std::mem::take(&mut self.children) {
            if let Err(e) = child.close() {
                tracing::warn!(error = %e, "Closing child session failed");
            }
        }
        self.closed = true;
        self.context.clear();
        self.queue.clear();
        if self.is_root {
            let mut link = lock_state(&self.link);
            if link.in_transaction && !link.joined_external {
                tracing::warn!("Closing session with an active transaction; rolling back");
                if let Some(conn) = link.conn.as_mut() {
                    if let Err(e) = conn.rollback() {
                        tracing::warn!(error = %e, "Rollback on close failed");
                    }
                }
                link.in_transaction = false;
            }
            link.release();
        }
        tracing::debug!(root = self.is_root, "Session closed");
        Ok(())
    }

    /// The child session with `mode`, created on first use. Children share
    /// the connection, transaction, filters and handlers of the root but
    /// track their own entities.
    pub fn child(&mut self, mode: TrackingMode) -> Result<&mut Session> {
        self.check_open()?;
        self.require_root("child")?;
        let factory = Arc::clone(&self.factory);
        let link = Arc::clone(&self.link);
        let handlers = Arc::clone(&self.handlers);
        let (flush_mode, cache_mode) = (self.flush_mode, self.cache_mode);
        let filters = self.enabled_filters.clone();
        Ok(self.children.entry(mode).or_insert_with(move || {
            Session::build(factory, link, mode, false, flush_mode, cache_mode, filters, handlers)
        }))
    }

    // ------------------------------------------------------------------
    // Snapshot
    // ------------------------------------------------------------------

    /// Detached deep copy of the context and pending actions.
    pub fn snapshot(&self) -> Result<SessionSnapshot> {
        self.ensure_usable()?;
        let copier = GraphCopier::new();
        let context = self.context.snapshot_with(&copier);
        let queue = self.queue.snapshot_with(&copier);
        copier.finish();
        Ok(SessionSnapshot { context, queue })
    }

    /// Install a snapshot into an empty session.
    pub fn restore(&mut self, snapshot: SessionSnapshot) -> Result<()> {
        self.check_open()?;
        if self.queue.has_any_queued_actions() {
            return Err(Error::usage(
                UsageErrorKind::Unsupported,
                "cannot restore a snapshot into a session with pending actions",
            ));
        }
        self.context.restore(snapshot.context)?;
        self.queue.restore(snapshot.queue)?;
        tracing::debug!(entities = self.context.entity_count(), "Session restored");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                tracing::warn!(error = %e, "Closing session on drop failed");
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// In-memory targets of the many-to-one properties whose cascade passes
/// `filter`.
fn referenced_targets(
    entity: &EntityRef,
    persister: &dyn EntityPersister,
    filter: impl Fn(CascadeStyle) -> bool,
) -> Vec<EntityRef> {
    let e = entity.read();
    persister
        .properties()
        .iter()
        .filter(|m| matches!(m.kind, PropertyKind::ManyToOne { .. }) && filter(m.cascade))
        .filter_map(|m| e.association(&m.name).and_then(Association::target).cloned())
        .collect()
}

fn element_entities(collection: &CollectionRef) -> Vec<EntityRef> {
    let c = collection.read();
    c.elements()
        .map(|elements| elements.iter().filter_map(Element::as_entity).cloned().collect())
        .unwrap_or_default()
}

fn same_keys(a: &[Element], b: &[Element]) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(x, y)| match (x.key(), y.key()) {
            (Some(x), Some(y)) => x.identity_eq(&y),
            _ => false,
        })
}

fn increment_version(current: Option<&Value>) -> Value {
    match current {
        Some(Value::Int(v)) => Value::Int(v.saturating_add(1)),
        Some(v) => Value::BigInt(v.as_i64().unwrap_or(0).saturating_add(1)),
        None => Value::BigInt(1),
    }
}

fn missing_identifier(entity: &str, message: impl Into<String>) -> Error {
    Error::mapping(MappingErrorKind::MissingIdentifier, Some(entity), message)
}

fn object_not_found(entity: &str, id: &Value) -> Error {
    Error::mapping(
        MappingErrorKind::ObjectNotFound,
        Some(entity),
        format!("No row with the given identifier exists: [{entity}#{id}]"),
    )
}

fn not_managed(entity: &str) -> Error {
    Error::usage(
        UsageErrorKind::NotManaged,
        format!("instance of {entity} is not associated with this session"),
    )
}
