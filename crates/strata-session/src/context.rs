//! Persistence context: the session's identity map.
//!
//! Every managed entity handle has exactly one [`EntityEntry`], keyed by the
//! address of the handle. Entities with an identifier are additionally
//! indexed by [`EntityKey`]; a second distinct instance under an existing key
//! is rejected, so a session never holds two representatives of one row.

use crate::snapshot::GraphCopier;
use std::collections::HashMap;
use std::fmt;
use strata_core::{
    CollectionIdentity, CollectionRef, EntityIdentity, EntityRef, Error, LockMode, Result,
    UsageErrorKind, Value, ValueKey,
};

// ============================================================================
// Keys
// ============================================================================

/// Persistent identity of an entity: identifier plus entity name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    id: ValueKey,
    entity_name: String,
}

impl EntityKey {
    pub fn new(id: Value, entity_name: impl Into<String>) -> Self {
        Self {
            id: ValueKey(id),
            entity_name: entity_name.into(),
        }
    }

    pub fn id(&self) -> &Value {
        &self.id.0
    }

    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity_name, self.id.0)
    }
}

/// Persistent identity of a collection: role plus owner identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionKey {
    role: String,
    owner: ValueKey,
}

impl CollectionKey {
    pub fn new(role: impl Into<String>, owner: Value) -> Self {
        Self {
            role: role.into(),
            owner: ValueKey(owner),
        }
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn owner(&self) -> &Value {
        &self.owner.0
    }
}

// ============================================================================
// Entries
// ============================================================================

/// Lifecycle status of a managed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityStatus {
    /// Loaded or flushed; dirty-checked at flush.
    Managed,
    /// Saved in this session, insert not yet executed.
    Saving,
    /// Scheduled for deletion.
    Deleted,
    /// Deleted in the store; removed from the context after flush.
    Gone,
    /// State is being read from the store.
    Loading,
}

/// Tracking record for one managed entity.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub status: EntityStatus,
    pub entity_name: String,
    pub id: Option<Value>,
    /// State as last read from or written to the store. `None` means unknown,
    /// which makes the entity dirty in every property.
    pub loaded_state: Option<Vec<Value>>,
    pub lock_mode: LockMode,
    pub version: Option<Value>,
    pub exists_in_store: bool,
    read_only: bool,
}

impl EntityEntry {
    pub fn new(status: EntityStatus, entity_name: impl Into<String>, id: Option<Value>) -> Self {
        Self {
            status,
            entity_name: entity_name.into(),
            id,
            loaded_state: None,
            lock_mode: LockMode::None,
            version: None,
            exists_in_store: false,
            read_only: false,
        }
    }

    /// Entry for a row just read from the store.
    pub fn loaded(
        entity_name: impl Into<String>,
        id: Value,
        state: Vec<Value>,
        version: Option<Value>,
        lock_mode: LockMode,
    ) -> Self {
        Self {
            status: EntityStatus::Managed,
            entity_name: entity_name.into(),
            id: Some(id),
            loaded_state: Some(state),
            lock_mode,
            version,
            exists_in_store: true,
            read_only: false,
        }
    }

    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn key(&self) -> Option<EntityKey> {
        self.id
            .clone()
            .map(|id| EntityKey::new(id, self.entity_name.clone()))
    }

    /// Deleted or gone: no longer visible through the identity map.
    pub fn is_removed(&self) -> bool {
        matches!(self.status, EntityStatus::Deleted | EntityStatus::Gone)
    }
}

/// Tracking record for one collection instance.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionEntry {
    pub role: String,
    /// Owner identifier the store rows belong to; `None` for a collection
    /// that has never been written.
    pub loaded_key: Option<Value>,
    /// Owner identifier as of the current flush.
    pub current_key: Option<Value>,
    /// Element keys as of load or the last flush. `None` while unknown.
    pub snapshot: Option<Vec<Value>>,
    pub reached: bool,
    pub do_recreate: bool,
    pub do_update: bool,
    pub do_remove: bool,
}

impl CollectionEntry {
    /// A collection backed by store rows of `owner_key`.
    pub fn loaded(role: impl Into<String>, owner_key: Value) -> Self {
        Self {
            role: role.into(),
            loaded_key: Some(owner_key.clone()),
            current_key: Some(owner_key),
            snapshot: None,
            reached: false,
            do_recreate: false,
            do_update: false,
            do_remove: false,
        }
    }

    /// A collection created in memory.
    pub fn transient(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            loaded_key: None,
            current_key: None,
            snapshot: None,
            reached: false,
            do_recreate: false,
            do_update: false,
            do_remove: false,
        }
    }

    pub fn is_new(&self) -> bool {
        self.loaded_key.is_none()
    }

    pub fn reset_flush_flags(&mut self) {
        self.reached = false;
        self.do_recreate = false;
        self.do_update = false;
        self.do_remove = false;
    }

    /// Record that the store now holds `keys` for the current owner.
    pub fn post_flush(&mut self, keys: Vec<Value>) {
        self.loaded_key = self.current_key.clone();
        self.snapshot = Some(keys);
        self.reset_flush_flags();
    }
}

// ============================================================================
// PersistenceContext
// ============================================================================

#[derive(Debug, Clone)]
struct ManagedEntity {
    entity: EntityRef,
    entry: EntityEntry,
    seq: u64,
}

#[derive(Debug, Clone)]
struct ManagedCollection {
    collection: CollectionRef,
    entry: CollectionEntry,
    seq: u64,
}

/// Identity map plus per-entity and per-collection tracking records.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entities: HashMap<EntityIdentity, ManagedEntity>,
    by_key: HashMap<EntityKey, EntityRef>,
    collections: HashMap<CollectionIdentity, ManagedCollection>,
    collections_by_key: HashMap<CollectionKey, CollectionRef>,
    next_seq: u64,
    cascade_level: usize,
    default_read_only: bool,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The managed instance for `key`, if any.
    pub fn get(&self, key: &EntityKey) -> Option<EntityRef> {
        self.by_key.get(key).cloned()
    }

    /// Register `entity` with `entry`, or replace the entry of an already
    /// managed handle.
    ///
    /// Fails with `NonUniqueObject` when a different instance is already
    /// managed under the entry's key.
    pub fn put(&mut self, entity: &EntityRef, entry: EntityEntry) -> Result<()> {
        if let Some(key) = entry.key() {
            self.check_unique(&key, entity)?;
            self.by_key.insert(key, entity.clone());
        }
        let identity = entity.identity();
        if let Some(managed) = self.entities.get_mut(&identity) {
            managed.entry = entry;
        } else {
            let seq = self.next_seq();
            self.entities.insert(
                identity,
                ManagedEntity {
                    entity: entity.clone(),
                    entry,
                    seq,
                },
            );
        }
        Ok(())
    }

    /// Index an already managed entity under the identifier it just received.
    pub fn register_key(&mut self, entity: &EntityRef, id: Value) -> Result<EntityKey> {
        let identity = entity.identity();
        let Some(managed) = self.entities.get(&identity) else {
            return Err(not_managed(entity));
        };
        let key = EntityKey::new(id.clone(), managed.entry.entity_name.clone());
        self.check_unique(&key, entity)?;
        self.by_key.insert(key.clone(), entity.clone());
        if let Some(managed) = self.entities.get_mut(&identity) {
            managed.entry.id = Some(id);
        }
        Ok(key)
    }

    fn check_unique(&self, key: &EntityKey, entity: &EntityRef) -> Result<()> {
        match self.by_key.get(key) {
            Some(existing) if !existing.ptr_eq(entity) => Err(Error::usage(
                UsageErrorKind::NonUniqueObject,
                format!(
                    "a different object with the same identifier value was already associated with the session: [{key}]"
                ),
            )),
            _ => Ok(()),
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    pub fn entry(&self, entity: &EntityRef) -> Option<&EntityEntry> {
        self.entities.get(&entity.identity()).map(|m| &m.entry)
    }

    pub fn entry_mut(&mut self, entity: &EntityRef) -> Option<&mut EntityEntry> {
        self.entities.get_mut(&entity.identity()).map(|m| &mut m.entry)
    }

    /// Stop tracking `entity`, returning its entry.
    pub fn remove(&mut self, entity: &EntityRef) -> Option<EntityEntry> {
        let managed = self.entities.remove(&entity.identity())?;
        if let Some(key) = managed.entry.key() {
            if self.by_key.get(&key).is_some_and(|e| e.ptr_eq(entity)) {
                self.by_key.remove(&key);
            }
        }
        Some(managed.entry)
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.entities.contains_key(&entity.identity())
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.by_key.clear();
        self.collections.clear();
        self.collections_by_key.clear();
        self.cascade_level = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.collections.is_empty()
    }

    pub fn is_read_only(&self, entity: &EntityRef) -> Result<bool> {
        self.entry(entity)
            .map(EntityEntry::is_read_only)
            .ok_or_else(|| not_managed(entity))
    }

    pub fn set_read_only(&mut self, entity: &EntityRef, read_only: bool) -> Result<()> {
        let Some(entry) = self.entry_mut(entity) else {
            return Err(not_managed(entity));
        };
        if entry.is_removed() {
            return Err(Error::usage(
                UsageErrorKind::NotManaged,
                format!(
                    "cannot change read-only state of a deleted entity: {}",
                    entry.entity_name
                ),
            ));
        }
        entry.read_only = read_only;
        Ok(())
    }

    /// Whether entities loaded from now on start out read-only.
    pub fn default_read_only(&self) -> bool {
        self.default_read_only
    }

    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.default_read_only = read_only;
    }

    /// Managed entities in the order they entered the context.
    pub fn managed_entities(&self) -> Vec<EntityRef> {
        let mut all: Vec<&ManagedEntity> = self.entities.values().collect();
        all.sort_by_key(|m| m.seq);
        all.into_iter().map(|m| m.entity.clone()).collect()
    }

    // ------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------

    pub fn add_collection(&mut self, collection: &CollectionRef, entry: CollectionEntry) {
        if let Some(owner) = entry.loaded_key.clone() {
            self.collections_by_key.insert(
                CollectionKey::new(entry.role.clone(), owner),
                collection.clone(),
            );
        }
        let identity = collection.identity();
        if let Some(managed) = self.collections.get_mut(&identity) {
            managed.entry = entry;
        } else {
            let seq = self.next_seq();
            self.collections.insert(
                identity,
                ManagedCollection {
                    collection: collection.clone(),
                    entry,
                    seq,
                },
            );
        }
    }

    pub fn collection_entry(&self, collection: &CollectionRef) -> Option<&CollectionEntry> {
        self.collections.get(&collection.identity()).map(|m| &m.entry)
    }

    pub fn collection_entry_mut(&mut self, collection: &CollectionRef) -> Option<&mut CollectionEntry> {
        self.collections
            .get_mut(&collection.identity())
            .map(|m| &mut m.entry)
    }

    pub fn remove_collection(&mut self, collection: &CollectionRef) -> Option<CollectionEntry> {
        let managed = self.collections.remove(&collection.identity())?;
        if let Some(owner) = managed.entry.loaded_key.clone() {
            let key = CollectionKey::new(managed.entry.role.clone(), owner);
            if self
                .collections_by_key
                .get(&key)
                .is_some_and(|c| c.ptr_eq(collection))
            {
                self.collections_by_key.remove(&key);
            }
        }
        Some(managed.entry)
    }

    pub fn collection_by_key(&self, key: &CollectionKey) -> Option<CollectionRef> {
        self.collections_by_key.get(key).cloned()
    }

    /// Tracked collections in registration order.
    pub fn collections(&self) -> Vec<CollectionRef> {
        let mut all: Vec<&ManagedCollection> = self.collections.values().collect();
        all.sort_by_key(|m| m.seq);
        all.into_iter().map(|m| m.collection.clone()).collect()
    }

    /// Re-index a collection after its owner key changed (post-flush).
    pub fn reindex_collection(&mut self, collection: &CollectionRef) {
        let Some(entry) = self.collection_entry(collection) else {
            return;
        };
        if let Some(owner) = entry.loaded_key.clone() {
            let key = CollectionKey::new(entry.role.clone(), owner);
            self.collections_by_key.insert(key, collection.clone());
        }
    }

    // ------------------------------------------------------------------
    // Cascades
    // ------------------------------------------------------------------

    pub fn increment_cascade_level(&mut self) -> usize {
        self.cascade_level += 1;
        self.cascade_level
    }

    pub fn decrement_cascade_level(&mut self) -> usize {
        self.cascade_level = self.cascade_level.saturating_sub(1);
        self.cascade_level
    }

    pub fn is_cascading(&self) -> bool {
        self.cascade_level > 0
    }

    // ------------------------------------------------------------------
    // Transaction completion
    // ------------------------------------------------------------------

    pub fn after_transaction_completion(&mut self) {
        self.reset_lock_modes();
    }

    pub fn reset_lock_modes(&mut self) {
        for managed in self.entities.values_mut() {
            managed.entry.lock_mode = LockMode::None;
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    // ------------------------------------------------------------------
    // Snapshot / restore
    // ------------------------------------------------------------------

    /// Deep copy of the context. Handles shared inside the context stay
    /// shared inside the copy; nothing is shared with `self`.
    pub fn snapshot(&self) -> ContextSnapshot {
        let copier = GraphCopier::new();
        let snapshot = self.snapshot_with(&copier);
        copier.finish();
        snapshot
    }

    /// Deep copy through an external copier, so that other structures (the
    /// action queue) can be copied into the same graph. The caller runs
    /// [`GraphCopier::finish`].
    pub fn snapshot_with(&self, copier: &GraphCopier) -> ContextSnapshot {
        let mut copy = PersistenceContext {
            next_seq: self.next_seq,
            default_read_only: self.default_read_only,
            ..PersistenceContext::default()
        };
        for managed in self.entities.values() {
            let entity = copier.entity(&managed.entity);
            copy.entities.insert(
                entity.identity(),
                ManagedEntity {
                    entity,
                    entry: managed.entry.clone(),
                    seq: managed.seq,
                },
            );
        }
        for (key, entity) in &self.by_key {
            copy.by_key.insert(key.clone(), copier.entity(entity));
        }
        for managed in self.collections.values() {
            let collection = copier.collection(&managed.collection);
            copy.collections.insert(
                collection.identity(),
                ManagedCollection {
                    collection,
                    entry: managed.entry.clone(),
                    seq: managed.seq,
                },
            );
        }
        for (key, collection) in &self.collections_by_key {
            copy.collections_by_key
                .insert(key.clone(), copier.collection(collection));
        }
        ContextSnapshot(copy)
    }

    /// Install a snapshot. The context must be empty.
    pub fn restore(&mut self, snapshot: ContextSnapshot) -> Result<()> {
        if !self.is_empty() {
            return Err(Error::usage(
                UsageErrorKind::Unsupported,
                "cannot restore a snapshot into a non-empty persistence context",
            ));
        }
        let cascade_level = self.cascade_level;
        *self = snapshot.0;
        self.cascade_level = cascade_level;
        Ok(())
    }
}

fn not_managed(entity: &EntityRef) -> Error {
    Error::usage(
        UsageErrorKind::NotManaged,
        format!("entity is not associated with this session: {entity:?}"),
    )
}

/// Detached deep copy of a [`PersistenceContext`].
#[derive(Debug)]
pub struct ContextSnapshot(PersistenceContext);

impl ContextSnapshot {
    pub fn entity_count(&self) -> usize {
        self.0.entity_count()
    }

    pub fn get(&self, key: &EntityKey) -> Option<EntityRef> {
        self.0.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_core::{Association, Entity};

    fn customer(id: i64) -> EntityRef {
        EntityRef::new(Entity::new("Customer").with_id(id).with("name", "n"))
    }

    fn managed_entry(id: i64) -> EntityEntry {
        EntityEntry::loaded("Customer", Value::BigInt(id), vec![], None, LockMode::None)
    }

    #[test]
    fn test_put_and_get_by_key() {
        let mut ctx = PersistenceContext::new();
        let c = customer(1);
        ctx.put(&c, managed_entry(1)).unwrap();
        let found = ctx.get(&EntityKey::new(Value::BigInt(1), "Customer")).unwrap();
        assert!(found.ptr_eq(&c));
        assert!(ctx.contains(&c));
        assert_eq!(ctx.entity_count(), 1);
    }

    #[test]
    fn test_second_instance_under_same_key_rejected() {
        let mut ctx = PersistenceContext::new();
        let first = customer(1);
        let second = customer(1);
        ctx.put(&first, managed_entry(1)).unwrap();
        let err = ctx.put(&second, managed_entry(1)).unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::NonUniqueObject));
        assert!(err.to_string().contains("Customer#1"));
        // Same instance again only replaces the entry.
        ctx.put(&first, managed_entry(1)).unwrap();
        assert_eq!(ctx.entity_count(), 1);
        assert!(!ctx.contains(&second));
    }

    #[test]
    fn test_register_key_after_identity_insert() {
        let mut ctx = PersistenceContext::new();
        let c = EntityRef::new(Entity::new("Customer"));
        ctx.put(&c, EntityEntry::new(EntityStatus::Saving, "Customer", None))
            .unwrap();
        ctx.register_key(&c, Value::BigInt(7)).unwrap();
        assert!(ctx.get(&EntityKey::new(Value::BigInt(7), "Customer")).is_some());
        assert_eq!(ctx.entry(&c).unwrap().id, Some(Value::BigInt(7)));
    }

    #[test]
    fn test_remove_drops_key() {
        let mut ctx = PersistenceContext::new();
        let c = customer(1);
        ctx.put(&c, managed_entry(1)).unwrap();
        assert!(ctx.remove(&c).is_some());
        assert!(ctx.get(&EntityKey::new(Value::BigInt(1), "Customer")).is_none());
        assert!(ctx.remove(&c).is_none());
    }

    #[test]
    fn test_read_only_requires_managed() {
        let mut ctx = PersistenceContext::new();
        let c = customer(1);
        let err = ctx.set_read_only(&c, true).unwrap_err();
        assert_eq!(err.usage_kind(), Some(UsageErrorKind::NotManaged));
        ctx.put(&c, managed_entry(1)).unwrap();
        ctx.set_read_only(&c, true).unwrap();
        assert!(ctx.is_read_only(&c).unwrap());
    }

    #[test]
    fn test_cascade_level() {
        let mut ctx = PersistenceContext::new();
        assert!(!ctx.is_cascading());
        ctx.increment_cascade_level();
        ctx.increment_cascade_level();
        assert_eq!(ctx.decrement_cascade_level(), 1);
        assert!(ctx.is_cascading());
        ctx.decrement_cascade_level();
        ctx.decrement_cascade_level();
        assert!(!ctx.is_cascading());
    }

    #[test]
    fn test_lock_modes_reset_at_completion() {
        let mut ctx = PersistenceContext::new();
        let c = customer(1);
        ctx.put(&c, managed_entry(1)).unwrap();
        ctx.entry_mut(&c).unwrap().lock_mode = LockMode::Upgrade;
        ctx.after_transaction_completion();
        assert_eq!(ctx.entry(&c).unwrap().lock_mode, LockMode::None);
    }

    #[test]
    fn test_collection_registration() {
        let mut ctx = PersistenceContext::new();
        let coll = CollectionRef::lazy("Customer.orders");
        ctx.add_collection(&coll, CollectionEntry::loaded("Customer.orders", Value::BigInt(1)));
        let key = CollectionKey::new("Customer.orders", Value::BigInt(1));
        assert!(ctx.collection_by_key(&key).unwrap().ptr_eq(&coll));
        assert_eq!(ctx.collection_count(), 1);
        ctx.remove_collection(&coll);
        assert!(ctx.collection_by_key(&key).is_none());
    }

    #[test]
    fn test_snapshot_is_deep_and_preserves_sharing() {
        let mut ctx = PersistenceContext::new();
        let c = customer(1);
        let order = EntityRef::new(
            Entity::new("Order")
                .with_id(10_i64)
                .with_reference("customer", Association::to(&c)),
        );
        ctx.put(&c, managed_entry(1)).unwrap();
        ctx.put(
            &order,
            EntityEntry::loaded("Order", Value::BigInt(10), vec![], None, LockMode::None),
        )
        .unwrap();

        let snapshot = ctx.snapshot();
        c.write().set("name", "changed");

        let mut restored = PersistenceContext::new();
        restored.restore(snapshot).unwrap();
        let c2 = restored.get(&EntityKey::new(Value::BigInt(1), "Customer")).unwrap();
        let o2 = restored.get(&EntityKey::new(Value::BigInt(10), "Order")).unwrap();
        assert!(!c2.ptr_eq(&c));
        assert_eq!(c2.read().get("name"), Some(&Value::Text("n".into())));
        let target = o2.read().association("customer").unwrap().target().unwrap().clone();
        assert!(target.ptr_eq(&c2));
        assert!(restored.contains(&c2));
    }

    #[test]
    fn test_restore_requires_empty_context() {
        let mut ctx = PersistenceContext::new();
        let c = customer(1);
        ctx.put(&c, managed_entry(1)).unwrap();
        let snapshot = ctx.snapshot();
        assert!(ctx.restore(snapshot).is_err());
    }

    #[test]
    fn test_managed_entities_in_insertion_order() {
        let mut ctx = PersistenceContext::new();
        let ids: Vec<i64> = vec![5, 3, 9];
        let handles: Vec<EntityRef> = ids.iter().map(|&i| customer(i)).collect();
        for (h, &i) in handles.iter().zip(&ids) {
            ctx.put(h, managed_entry(i)).unwrap();
        }
        let order: Vec<Option<Value>> = ctx.managed_entities().iter().map(EntityRef::id).collect();
        assert_eq!(
            order,
            vec![Some(Value::BigInt(5)), Some(Value::BigInt(3)), Some(Value::BigInt(9))]
        );
    }
}
