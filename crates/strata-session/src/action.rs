//! Write actions buffered by the session until flush.
//!
//! Each action reads the entity or collection state at execution time, so
//! identifiers assigned by earlier actions in the same flush are picked up.

use crate::context::{EntityStatus, PersistenceContext};
use crate::snapshot::GraphCopier;
use std::fmt;
use std::sync::Arc;
use strata_core::{
    CacheKey, CollectionPersister, CollectionRef, Connection, EntityPersister, EntityRef, Error,
    MappingErrorKind, Result, UsageErrorKind, Value,
};

/// Execution phase of an action. Phases run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    Insertion,
    Update,
    CollectionRemoval,
    CollectionUpdate,
    CollectionRecreation,
    Deletion,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Insertion,
        Phase::Update,
        Phase::CollectionRemoval,
        Phase::CollectionUpdate,
        Phase::CollectionRecreation,
        Phase::Deletion,
    ];
}

/// Work to do once the surrounding transaction completes.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Tables whose cached query results become stale.
    pub spaces: Vec<String>,
    /// Second-level cache entry to evict: (region, key).
    pub evict: Option<(String, CacheKey)>,
}

// ============================================================================
// Entity actions
// ============================================================================

#[derive(Debug, Clone)]
pub struct EntityInsertAction {
    pub entity: EntityRef,
    pub persister: Arc<dyn EntityPersister>,
    /// Identifier known before insert; `None` for store-generated keys.
    pub id: Option<Value>,
}

impl EntityInsertAction {
    pub fn new(entity: EntityRef, persister: Arc<dyn EntityPersister>, id: Option<Value>) -> Self {
        Self {
            entity,
            persister,
            id,
        }
    }

    /// Whether the insert must run immediately to learn its identifier.
    pub fn is_immediate(&self) -> bool {
        self.persister.id_generation().is_post_insert()
    }

    fn execute(&self, conn: &mut dyn Connection, ctx: &mut PersistenceContext) -> Result<Completion> {
        let state = extract_state(&self.entity, self.persister.as_ref())?;
        let generated = self.persister.insert(conn, self.id.as_ref(), &state)?;
        let id = match (&self.id, generated) {
            (Some(id), _) => id.clone(),
            (None, Some(generated)) => {
                let id = self.persister.identifier_type().coerce(generated);
                self.entity.write().set_id(Some(id.clone()));
                ctx.register_key(&self.entity, id.clone())?;
                id
            }
            (None, None) => {
                return Err(Error::mapping(
                    MappingErrorKind::MissingIdentifier,
                    Some(self.persister.entity_name()),
                    "the store did not return a generated identifier",
                ));
            }
        };
        let version = self
            .persister
            .version_index()
            .and_then(|i| state.get(i).cloned());
        if let Some(entry) = ctx.entry_mut(&self.entity) {
            if entry.status == EntityStatus::Saving {
                entry.status = EntityStatus::Managed;
            }
            entry.id = Some(id);
            entry.loaded_state = Some(state);
            entry.version = version;
            entry.exists_in_store = true;
        }
        Ok(Completion {
            spaces: self.persister.query_spaces().to_vec(),
            evict: None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct EntityUpdateAction {
    pub entity: EntityRef,
    pub persister: Arc<dyn EntityPersister>,
    pub id: Value,
    pub state: Vec<Value>,
    pub previous_version: Option<Value>,
    pub next_version: Option<Value>,
    /// Indices of the properties that changed; empty when unknown.
    pub dirty: Vec<usize>,
}

impl EntityUpdateAction {
    fn execute(&self, conn: &mut dyn Connection, ctx: &mut PersistenceContext) -> Result<Completion> {
        self.persister
            .update(conn, &self.id, &self.state, self.previous_version.as_ref())?;
        if let (Some(property), Some(next)) = (self.persister.version_property(), &self.next_version) {
            self.entity.write().set(property, next.clone());
        }
        if let Some(entry) = ctx.entry_mut(&self.entity) {
            entry.loaded_state = Some(self.state.clone());
            entry.version.clone_from(&self.next_version);
        }
        Ok(Completion {
            spaces: self.persister.query_spaces().to_vec(),
            evict: cache_eviction(self.persister.as_ref(), &self.id),
        })
    }
}

#[derive(Debug, Clone)]
pub struct EntityDeleteAction {
    pub entity: EntityRef,
    pub persister: Arc<dyn EntityPersister>,
    pub id: Value,
    pub version: Option<Value>,
}

impl EntityDeleteAction {
    fn execute(&self, conn: &mut dyn Connection, ctx: &mut PersistenceContext) -> Result<Completion> {
        self.persister.delete(conn, &self.id, self.version.as_ref())?;
        if let Some(entry) = ctx.entry_mut(&self.entity) {
            entry.status = EntityStatus::Gone;
            entry.exists_in_store = false;
        }
        Ok(Completion {
            spaces: self.persister.query_spaces().to_vec(),
            evict: cache_eviction(self.persister.as_ref(), &self.id),
        })
    }
}

fn cache_eviction(persister: &dyn EntityPersister, id: &Value) -> Option<(String, CacheKey)> {
    persister.cache_region().map(|region| {
        (
            region.to_string(),
            CacheKey::new(
                id.clone(),
                persister.entity_name(),
                persister.root_entity_name(),
            ),
        )
    })
}

// ============================================================================
// Collection actions
// ============================================================================

#[derive(Debug, Clone)]
pub struct CollectionAction {
    pub collection: CollectionRef,
    pub persister: Arc<dyn CollectionPersister>,
    pub owner_key: Value,
}

impl CollectionAction {
    pub fn new(collection: CollectionRef, persister: Arc<dyn CollectionPersister>, owner_key: Value) -> Self {
        Self {
            collection,
            persister,
            owner_key,
        }
    }

    fn completion(&self) -> Completion {
        Completion {
            spaces: self.persister.query_spaces().to_vec(),
            evict: None,
        }
    }

    fn remove(&self, conn: &mut dyn Connection, ctx: &mut PersistenceContext) -> Result<Completion> {
        self.persister.remove(conn, &self.owner_key)?;
        let recreate_follows = ctx
            .collection_entry(&self.collection)
            .is_some_and(|e| e.do_recreate);
        if !recreate_follows {
            ctx.remove_collection(&self.collection);
        }
        Ok(self.completion())
    }

    fn update(&self, conn: &mut dyn Connection, ctx: &mut PersistenceContext) -> Result<Completion> {
        let current = current_keys(&self.collection)?;
        let previous = ctx
            .collection_entry(&self.collection)
            .and_then(|e| e.snapshot.clone())
            .unwrap_or_default();
        let removed = difference(&previous, &current);
        let added = difference(&current, &previous);
        if !removed.is_empty() || !added.is_empty() {
            self.persister
                .update(conn, &self.owner_key, &removed, &added)?;
        }
        self.finish(ctx, current);
        Ok(self.completion())
    }

    fn recreate(&self, conn: &mut dyn Connection, ctx: &mut PersistenceContext) -> Result<Completion> {
        let current = current_keys(&self.collection)?;
        if !current.is_empty() {
            self.persister.recreate(conn, &self.owner_key, &current)?;
        }
        self.finish(ctx, current);
        Ok(self.completion())
    }

    fn finish(&self, ctx: &mut PersistenceContext, keys: Vec<Value>) {
        if let Some(entry) = ctx.collection_entry_mut(&self.collection) {
            entry.current_key = Some(self.owner_key.clone());
            entry.post_flush(keys);
        }
        ctx.reindex_collection(&self.collection);
        self.collection.write().clear_dirty();
    }
}

/// Store keys of the collection's elements. A transient entity element has
/// no key and cannot be written.
fn current_keys(collection: &CollectionRef) -> Result<Vec<Value>> {
    let coll = collection.read();
    coll.elements()?
        .iter()
        .map(|element| {
            element.key().ok_or_else(|| {
                Error::usage(
                    UsageErrorKind::TransientReference,
                    format!(
                        "collection {} references an unsaved transient instance",
                        coll.role()
                    ),
                )
            })
        })
        .collect()
}

/// Elements of `a` not matched by an element of `b`, counting duplicates.
fn difference(a: &[Value], b: &[Value]) -> Vec<Value> {
    let mut unmatched: Vec<&Value> = b.iter().collect();
    let mut out = Vec::new();
    for value in a {
        if let Some(pos) = unmatched.iter().position(|v| v.identity_eq(value)) {
            unmatched.swap_remove(pos);
        } else {
            out.push(value.clone());
        }
    }
    out
}

// ============================================================================
// Action
// ============================================================================

/// A buffered write, executed exactly once.
#[derive(Debug, Clone)]
pub enum Action {
    EntityInsert(EntityInsertAction),
    EntityUpdate(EntityUpdateAction),
    EntityDelete(EntityDeleteAction),
    CollectionRemove(CollectionAction),
    CollectionUpdate(CollectionAction),
    CollectionRecreate(CollectionAction),
}

impl Action {
    pub fn phase(&self) -> Phase {
        match self {
            Action::EntityInsert(_) => Phase::Insertion,
            Action::EntityUpdate(_) => Phase::Update,
            Action::CollectionRemove(_) => Phase::CollectionRemoval,
            Action::CollectionUpdate(_) => Phase::CollectionUpdate,
            Action::CollectionRecreate(_) => Phase::CollectionRecreation,
            Action::EntityDelete(_) => Phase::Deletion,
        }
    }

    pub fn query_spaces(&self) -> &[String] {
        match self {
            Action::EntityInsert(a) => a.persister.query_spaces(),
            Action::EntityUpdate(a) => a.persister.query_spaces(),
            Action::EntityDelete(a) => a.persister.query_spaces(),
            Action::CollectionRemove(a) | Action::CollectionUpdate(a) | Action::CollectionRecreate(a) => {
                a.persister.query_spaces()
            }
        }
    }

    pub fn entity(&self) -> Option<&EntityRef> {
        match self {
            Action::EntityInsert(a) => Some(&a.entity),
            Action::EntityUpdate(a) => Some(&a.entity),
            Action::EntityDelete(a) => Some(&a.entity),
            _ => None,
        }
    }

    pub fn collection(&self) -> Option<&CollectionRef> {
        match self {
            Action::CollectionRemove(a) | Action::CollectionUpdate(a) | Action::CollectionRecreate(a) => {
                Some(&a.collection)
            }
            _ => None,
        }
    }

    /// Entity name or collection role the action writes.
    pub fn target_name(&self) -> String {
        match self {
            Action::EntityInsert(a) => a.persister.entity_name().to_string(),
            Action::EntityUpdate(a) => a.persister.entity_name().to_string(),
            Action::EntityDelete(a) => a.persister.entity_name().to_string(),
            Action::CollectionRemove(a) | Action::CollectionUpdate(a) | Action::CollectionRecreate(a) => {
                a.persister.role().to_string()
            }
        }
    }

    pub fn execute(&self, conn: &mut dyn Connection, ctx: &mut PersistenceContext) -> Result<Completion> {
        tracing::trace!(action = %self, "Executing action");
        match self {
            Action::EntityInsert(a) => a.execute(conn, ctx),
            Action::EntityUpdate(a) => a.execute(conn, ctx),
            Action::EntityDelete(a) => a.execute(conn, ctx),
            Action::CollectionRemove(a) => a.remove(conn, ctx),
            Action::CollectionUpdate(a) => a.update(conn, ctx),
            Action::CollectionRecreate(a) => a.recreate(conn, ctx),
        }
    }

    /// Copy pointing at `copier`'s copies of the entity / collection.
    pub fn copy_with(&self, copier: &GraphCopier) -> Action {
        let mut copy = self.clone();
        match &mut copy {
            Action::EntityInsert(a) => a.entity = copier.entity(&a.entity),
            Action::EntityUpdate(a) => a.entity = copier.entity(&a.entity),
            Action::EntityDelete(a) => a.entity = copier.entity(&a.entity),
            Action::CollectionRemove(a) | Action::CollectionUpdate(a) | Action::CollectionRecreate(a) => {
                a.collection = copier.collection(&a.collection);
            }
        }
        copy
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::EntityInsert(a) => match &a.id {
                Some(id) => write!(f, "insert {}#{}", a.persister.entity_name(), id),
                None => write!(f, "insert {}#<generated>", a.persister.entity_name()),
            },
            Action::EntityUpdate(a) => write!(f, "update {}#{}", a.persister.entity_name(), a.id),
            Action::EntityDelete(a) => write!(f, "delete {}#{}", a.persister.entity_name(), a.id),
            Action::CollectionRemove(a) => write!(f, "remove {}#{}", a.persister.role(), a.owner_key),
            Action::CollectionUpdate(a) => write!(f, "update {}#{}", a.persister.role(), a.owner_key),
            Action::CollectionRecreate(a) => {
                write!(f, "recreate {}#{}", a.persister.role(), a.owner_key)
            }
        }
    }
}

// ============================================================================
// State extraction
// ============================================================================

/// Current state vector of `entity` in the persister's property order.
///
/// References contribute the target's identifier; collections contribute
/// `Null` (they are written by collection actions).
pub fn extract_state(entity: &EntityRef, persister: &dyn EntityPersister) -> Result<Vec<Value>> {
    use strata_core::PropertyKind;

    let entity = entity.read();
    persister
        .properties()
        .iter()
        .map(|mapping| {
            Ok(match &mapping.kind {
                PropertyKind::Basic(_) => entity.get(&mapping.name).cloned().unwrap_or(Value::Null),
                PropertyKind::ManyToOne { .. } => match entity.property(&mapping.name) {
                    None => Value::Null,
                    Some(strata_core::Property::Reference(assoc)) => {
                        assoc.foreign_key().unwrap_or(Value::Null)
                    }
                    Some(_) => {
                        return Err(Error::mapping(
                            MappingErrorKind::WrongShape,
                            Some(entity.entity_name()),
                            format!("property {} must hold a reference", mapping.name),
                        ));
                    }
                },
                PropertyKind::Collection { .. } => Value::Null,
            })
        })
        .collect()
}

/// Indices where `current` differs from `loaded`.
pub fn dirty_properties(loaded: &[Value], current: &[Value]) -> Vec<usize> {
    (0..current.len().max(loaded.len()))
        .filter(|&i| match (loaded.get(i), current.get(i)) {
            (Some(a), Some(b)) => !a.identity_eq(b),
            _ => true,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        let mut phases = Phase::ALL.to_vec();
        phases.sort();
        assert_eq!(phases, Phase::ALL.to_vec());
        assert!(Phase::Insertion < Phase::Deletion);
        assert!(Phase::CollectionRemoval < Phase::CollectionRecreation);
    }

    #[test]
    fn test_difference_counts_duplicates() {
        let a = vec![Value::BigInt(1), Value::BigInt(1), Value::BigInt(2)];
        let b = vec![Value::BigInt(1), Value::BigInt(3)];
        assert_eq!(difference(&a, &b), vec![Value::BigInt(1), Value::BigInt(2)]);
        assert_eq!(difference(&b, &a), vec![Value::BigInt(3)]);
    }

    #[test]
    fn test_dirty_properties() {
        let loaded = vec![Value::Text("a".into()), Value::BigInt(1)];
        let current = vec![Value::Text("a".into()), Value::BigInt(2)];
        assert_eq!(dirty_properties(&loaded, &current), vec![1]);
        assert!(dirty_properties(&loaded, &loaded).is_empty());
    }
}
