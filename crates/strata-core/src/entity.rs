//! Entity instances, shared handles and association cells.
//!
//! Entities are dynamic property bags keyed by property name. A session hands
//! them out as [`EntityRef`] handles (`Arc<RwLock<Entity>>`); two handles are
//! the *same* object only if they point at the same allocation, regardless of
//! the values inside.
//!
//! Lazy associations are explicit cells with a [`LoadState`] tag rather than
//! generated proxies:
//!
//! - **Uninitialized**: only the foreign key is known
//! - **Initializing**: a load is in progress (re-entrant loads are rejected)
//! - **Initialized**: the target (or null) has been resolved

use crate::error::{Error, Result, UsageErrorKind};
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================================
// Load state
// ============================================================================

/// Explicit initialization state of a lazy cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Uninitialized,
    Initializing,
    Initialized,
}

// ============================================================================
// Entity
// ============================================================================

/// A single property value of an entity.
#[derive(Debug, Clone)]
pub enum Property {
    /// Plain column value.
    Value(Value),
    /// Many-to-one / one-to-one reference.
    Reference(Association),
    /// Persistent collection.
    Collection(CollectionRef),
}

/// A persistent domain object.
#[derive(Debug, Clone)]
pub struct Entity {
    name: String,
    id: Option<Value>,
    properties: BTreeMap<String, Property>,
}

impl Entity {
    /// Create a transient entity of the given type without an identifier.
    pub fn new(entity_name: impl Into<String>) -> Self {
        Self {
            name: entity_name.into(),
            id: None,
            properties: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Builder-style setter for a plain value property.
    #[must_use]
    pub fn with(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties
            .insert(property.into(), Property::Value(value.into()));
        self
    }

    #[must_use]
    pub fn with_reference(mut self, property: impl Into<String>, assoc: Association) -> Self {
        self.properties
            .insert(property.into(), Property::Reference(assoc));
        self
    }

    #[must_use]
    pub fn with_collection(mut self, property: impl Into<String>, coll: CollectionRef) -> Self {
        self.properties
            .insert(property.into(), Property::Collection(coll));
        self
    }

    pub fn entity_name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> Option<&Value> {
        self.id.as_ref()
    }

    pub fn set_id(&mut self, id: Option<Value>) {
        self.id = id;
    }

    /// Plain value of a property; `None` if absent or not a plain value.
    pub fn get(&self, property: &str) -> Option<&Value> {
        match self.properties.get(property) {
            Some(Property::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn set(&mut self, property: impl Into<String>, value: impl Into<Value>) {
        self.properties
            .insert(property.into(), Property::Value(value.into()));
    }

    pub fn property(&self, property: &str) -> Option<&Property> {
        self.properties.get(property)
    }

    pub fn set_property(&mut self, property: impl Into<String>, value: Property) {
        self.properties.insert(property.into(), value);
    }

    pub fn association(&self, property: &str) -> Option<&Association> {
        match self.properties.get(property) {
            Some(Property::Reference(a)) => Some(a),
            _ => None,
        }
    }

    pub fn association_mut(&mut self, property: &str) -> Option<&mut Association> {
        match self.properties.get_mut(property) {
            Some(Property::Reference(a)) => Some(a),
            _ => None,
        }
    }

    pub fn collection(&self, property: &str) -> Option<&CollectionRef> {
        match self.properties.get(property) {
            Some(Property::Collection(c)) => Some(c),
            _ => None,
        }
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.properties.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Point every entity/collection handle held by this entity at a
    /// replacement, where `map_entity` / `map_collection` provide one.
    ///
    /// Used by deep copies to keep shared references shared in the copy.
    pub fn relink(
        &mut self,
        map_entity: &mut dyn FnMut(&EntityRef) -> Option<EntityRef>,
        map_collection: &mut dyn FnMut(&CollectionRef) -> Option<CollectionRef>,
    ) {
        for prop in self.properties.values_mut() {
            match prop {
                Property::Value(_) => {}
                Property::Reference(assoc) => {
                    if let Some(target) = assoc.value.as_ref().and_then(|t| map_entity(t)) {
                        assoc.value = Some(target);
                    }
                }
                Property::Collection(coll) => {
                    if let Some(replacement) = map_collection(coll) {
                        *coll = replacement;
                    }
                }
            }
        }
    }
}

// ============================================================================
// EntityRef
// ============================================================================

/// Address-based identity of an entity handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityIdentity(usize);

/// Shared handle to an entity instance.
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Acquire a read guard. A poisoned lock is recovered; entity data has no
    /// invariants a panicking writer could break halfway.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn identity(&self) -> EntityIdentity {
        EntityIdentity(Arc::as_ptr(&self.0) as usize)
    }

    pub fn entity_name(&self) -> String {
        self.read().entity_name().to_string()
    }

    pub fn id(&self) -> Option<Value> {
        self.read().id().cloned()
    }

    /// Value form of a reference to this entity, for binding as a parameter.
    pub fn to_reference(&self) -> Value {
        let entity = self.read();
        Value::object(
            entity.entity_name(),
            vec![entity.id().cloned().unwrap_or(Value::Null)],
        )
    }

    /// Copy of the entity data in a fresh, unshared handle.
    pub fn detached_copy(&self) -> EntityRef {
        EntityRef::new(self.read().clone())
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // No recursion into properties: graphs may be cyclic.
        match self.0.try_read() {
            Ok(entity) => write!(f, "EntityRef({}#{:?})", entity.name, entity.id),
            Err(_) => write!(f, "EntityRef(<locked>)"),
        }
    }
}

impl From<Entity> for EntityRef {
    fn from(entity: Entity) -> Self {
        EntityRef::new(entity)
    }
}

// ============================================================================
// Association cell
// ============================================================================

/// A lazily resolved reference to another entity.
#[derive(Debug, Clone)]
pub struct Association {
    target: String,
    foreign_key: Option<Value>,
    state: LoadState,
    value: Option<EntityRef>,
}

impl Association {
    /// Null reference (initialized, no target).
    pub fn empty(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            foreign_key: None,
            state: LoadState::Initialized,
            value: None,
        }
    }

    /// Reference known only by foreign key.
    pub fn lazy(target: impl Into<String>, foreign_key: impl Into<Value>) -> Self {
        let fk = foreign_key.into();
        if fk.is_null() {
            return Self::empty(target);
        }
        Self {
            target: target.into(),
            foreign_key: Some(fk),
            state: LoadState::Uninitialized,
            value: None,
        }
    }

    /// Reference to an in-memory entity.
    pub fn to(entity: &EntityRef) -> Self {
        Self {
            target: entity.entity_name(),
            foreign_key: None,
            state: LoadState::Initialized,
            value: Some(entity.clone()),
        }
    }

    pub fn target_entity(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == LoadState::Initialized
    }

    /// Loaded target. Fails on an uninitialized cell instead of loading.
    pub fn get(&self) -> Result<Option<&EntityRef>> {
        match self.state {
            LoadState::Initialized => Ok(self.value.as_ref()),
            _ => Err(Error::usage(
                UsageErrorKind::LazyInitialization,
                format!("association to {} is not initialized", self.target),
            )),
        }
    }

    /// The in-memory target, whatever the state.
    pub fn target(&self) -> Option<&EntityRef> {
        self.value.as_ref()
    }

    /// Identifier of the referenced row, if known.
    ///
    /// For an in-memory target this is the target's current identifier, which
    /// is `None` while the target is still transient.
    pub fn foreign_key(&self) -> Option<Value> {
        match &self.value {
            Some(target) => target.id(),
            None => self.foreign_key.clone(),
        }
    }

    /// Whether the association points anywhere at all.
    pub fn is_null(&self) -> bool {
        self.value.is_none() && self.foreign_key.is_none()
    }

    /// Mark the cell as being loaded.
    pub fn begin_initialize(&mut self) -> Result<()> {
        match self.state {
            LoadState::Uninitialized => {
                self.state = LoadState::Initializing;
                Ok(())
            }
            LoadState::Initializing => Err(Error::usage(
                UsageErrorKind::LazyInitialization,
                format!("circular initialization of association to {}", self.target),
            )),
            LoadState::Initialized => Ok(()),
        }
    }

    /// Complete initialization with the loaded target (or null).
    pub fn finish_initialize(&mut self, value: Option<EntityRef>) {
        self.value = value;
        self.state = LoadState::Initialized;
    }

    /// Abandon an in-progress initialization after a failed load.
    pub fn abort_initialize(&mut self) {
        if self.state == LoadState::Initializing {
            self.state = LoadState::Uninitialized;
        }
    }
}

// ============================================================================
// Collections
// ============================================================================

/// One element of a persistent collection.
#[derive(Debug, Clone)]
pub enum Element {
    Value(Value),
    Entity(EntityRef),
}

impl Element {
    /// Key stored in the collection table: the value itself, or the
    /// referenced entity's identifier (`None` while transient).
    pub fn key(&self) -> Option<Value> {
        match self {
            Element::Value(v) => Some(v.clone()),
            Element::Entity(e) => e.id(),
        }
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Element::Entity(e) => Some(e),
            Element::Value(_) => None,
        }
    }
}

/// A collection owned by an entity property.
#[derive(Debug, Clone)]
pub struct PersistentCollection {
    role: String,
    elements: Vec<Element>,
    state: LoadState,
    dirty: bool,
}

impl PersistentCollection {
    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == LoadState::Initialized
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    pub fn elements(&self) -> Result<&[Element]> {
        self.check_initialized()?;
        Ok(&self.elements)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.elements()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.elements()?.is_empty())
    }

    pub fn push(&mut self, element: Element) -> Result<()> {
        self.check_initialized()?;
        self.elements.push(element);
        self.dirty = true;
        Ok(())
    }

    pub fn remove(&mut self, index: usize) -> Result<Element> {
        self.check_initialized()?;
        if index >= self.elements.len() {
            return Err(Error::Custom(format!(
                "index {index} out of bounds for collection {}",
                self.role
            )));
        }
        self.dirty = true;
        Ok(self.elements.remove(index))
    }

    pub fn clear(&mut self) -> Result<()> {
        self.check_initialized()?;
        if !self.elements.is_empty() {
            self.dirty = true;
        }
        self.elements.clear();
        Ok(())
    }

    /// Mark the collection as being loaded.
    pub fn begin_initialize(&mut self) -> Result<()> {
        match self.state {
            LoadState::Uninitialized => {
                self.state = LoadState::Initializing;
                Ok(())
            }
            LoadState::Initializing => Err(Error::usage(
                UsageErrorKind::LazyInitialization,
                format!("circular initialization of collection {}", self.role),
            )),
            LoadState::Initialized => Ok(()),
        }
    }

    /// Install loaded elements. The collection is clean afterwards.
    pub fn finish_initialize(&mut self, elements: Vec<Element>) {
        self.elements = elements;
        self.state = LoadState::Initialized;
        self.dirty = false;
    }

    pub fn abort_initialize(&mut self) {
        if self.state == LoadState::Initializing {
            self.state = LoadState::Uninitialized;
        }
    }

    /// Keys of all elements; transient entity elements yield `None`.
    pub fn element_keys(&self) -> Vec<Option<Value>> {
        self.elements.iter().map(Element::key).collect()
    }

    pub fn relink_elements(&mut self, map_entity: &mut dyn FnMut(&EntityRef) -> Option<EntityRef>) {
        for element in &mut self.elements {
            if let Element::Entity(e) = element {
                if let Some(replacement) = map_entity(e) {
                    *e = replacement;
                }
            }
        }
    }

    fn check_initialized(&self) -> Result<()> {
        if self.state == LoadState::Initialized {
            Ok(())
        } else {
            Err(Error::usage(
                UsageErrorKind::LazyInitialization,
                format!("collection {} is not initialized", self.role),
            ))
        }
    }
}

/// Address-based identity of a collection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionIdentity(usize);

/// Shared handle to a persistent collection.
#[derive(Clone)]
pub struct CollectionRef(Arc<RwLock<PersistentCollection>>);

impl CollectionRef {
    /// A new, initialized collection holding `elements`.
    pub fn new(role: impl Into<String>, elements: Vec<Element>) -> Self {
        let dirty = !elements.is_empty();
        Self(Arc::new(RwLock::new(PersistentCollection {
            role: role.into(),
            elements,
            state: LoadState::Initialized,
            dirty,
        })))
    }

    /// An uninitialized collection to be loaded on demand.
    pub fn lazy(role: impl Into<String>) -> Self {
        Self(Arc::new(RwLock::new(PersistentCollection {
            role: role.into(),
            elements: Vec::new(),
            state: LoadState::Uninitialized,
            dirty: false,
        })))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, PersistentCollection> {
        self.0.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, PersistentCollection> {
        self.0
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn ptr_eq(&self, other: &CollectionRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub fn identity(&self) -> CollectionIdentity {
        CollectionIdentity(Arc::as_ptr(&self.0) as usize)
    }

    pub fn role(&self) -> String {
        self.read().role().to_string()
    }

    pub fn detached_copy(&self) -> CollectionRef {
        CollectionRef(Arc::new(RwLock::new(self.read().clone())))
    }
}

impl fmt::Debug for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(c) => write!(f, "CollectionRef({}, {:?})", c.role, c.state),
            Err(_) => write!(f, "CollectionRef(<locked>)"),
        }
    }
}
