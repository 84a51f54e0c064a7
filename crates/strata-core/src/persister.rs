//! Mapping collaborators: per-type persisters and the metamodel registry.
//!
//! A persister translates one entity type (or one collection role) to and from
//! its relational form. Entity state travels as a `Vec<Value>` aligned with
//! [`EntityPersister::properties`]: plain properties carry their value,
//! references carry the target identifier and collection slots carry `Null`.

use crate::connection::Connection;
use crate::error::{Error, MappingErrorKind, Result};
use crate::lock::LockMode;
use crate::row::Row;
use crate::types::{EntityResolver, SqlType, ValueType};
use crate::value::Value;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

/// How identifiers are produced for new entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdGeneration {
    /// The application assigns the identifier before saving.
    Assigned,
    /// The persister produces an identifier before insert (sequence, uuid).
    Generated,
    /// The store produces the identifier during insert; the insert must run
    /// immediately to learn it.
    Identity,
}

impl IdGeneration {
    pub fn is_post_insert(self) -> bool {
        self == IdGeneration::Identity
    }
}

/// Operations that propagate across an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CascadeStyle {
    pub save: bool,
    pub delete: bool,
    pub merge: bool,
    pub refresh: bool,
    pub evict: bool,
    pub lock: bool,
}

impl CascadeStyle {
    pub const NONE: CascadeStyle = CascadeStyle {
        save: false,
        delete: false,
        merge: false,
        refresh: false,
        evict: false,
        lock: false,
    };

    pub const ALL: CascadeStyle = CascadeStyle {
        save: true,
        delete: true,
        merge: true,
        refresh: true,
        evict: true,
        lock: true,
    };

    pub const SAVE_UPDATE: CascadeStyle = CascadeStyle {
        save: true,
        ..CascadeStyle::NONE
    };

    pub fn is_none(self) -> bool {
        self == CascadeStyle::NONE
    }
}

/// Kind of a mapped property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    /// Single column value.
    Basic(SqlType),
    /// Foreign key to another entity.
    ManyToOne { target: String },
    /// Collection stored in its own table.
    Collection { role: String },
}

/// Mapping of one entity property.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyMapping {
    pub name: String,
    pub column: String,
    pub kind: PropertyKind,
    pub cascade: CascadeStyle,
    pub nullable: bool,
}

impl PropertyMapping {
    pub fn basic(name: impl Into<String>, sql_type: SqlType) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            kind: PropertyKind::Basic(sql_type),
            cascade: CascadeStyle::NONE,
            nullable: true,
        }
    }

    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            column: format!("{name}_id"),
            name,
            kind: PropertyKind::ManyToOne {
                target: target.into(),
            },
            cascade: CascadeStyle::NONE,
            nullable: true,
        }
    }

    pub fn collection(name: impl Into<String>, role: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            column: String::new(),
            name,
            kind: PropertyKind::Collection { role: role.into() },
            cascade: CascadeStyle::NONE,
            nullable: true,
        }
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    #[must_use]
    pub fn cascade(mut self, cascade: CascadeStyle) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Whether the property is stored in the owning entity's table.
    pub fn is_columnar(&self) -> bool {
        !matches!(self.kind, PropertyKind::Collection { .. })
    }
}

/// Persister for one entity type.
pub trait EntityPersister: Send + Sync + fmt::Debug {
    fn entity_name(&self) -> &str;

    /// Name of the hierarchy root; used for cache keys.
    fn root_entity_name(&self) -> &str {
        self.entity_name()
    }

    /// Tables touched by this entity type.
    fn query_spaces(&self) -> &[String];

    fn properties(&self) -> &[PropertyMapping];

    fn identifier_type(&self) -> &ValueType;

    fn id_generation(&self) -> IdGeneration;

    /// Name of the version property, if versioned.
    fn version_property(&self) -> Option<&str> {
        None
    }

    /// Second-level cache region, if cached.
    fn cache_region(&self) -> Option<&str> {
        None
    }

    /// Immutable entities are never dirty-checked.
    fn is_mutable(&self) -> bool {
        true
    }

    /// Produce an identifier ahead of insert (for [`IdGeneration::Generated`]).
    fn generate_id(&self, conn: &mut dyn Connection) -> Result<Value>;

    /// Insert a row; returns the store-generated identifier, if any.
    fn insert(
        &self,
        conn: &mut dyn Connection,
        id: Option<&Value>,
        state: &[Value],
    ) -> Result<Option<Value>>;

    fn update(
        &self,
        conn: &mut dyn Connection,
        id: &Value,
        state: &[Value],
        previous_version: Option<&Value>,
    ) -> Result<()>;

    fn delete(&self, conn: &mut dyn Connection, id: &Value, version: Option<&Value>) -> Result<()>;

    /// Read the state of one row, or `None` if no such row exists.
    fn load(&self, conn: &mut dyn Connection, id: &Value, lock: LockMode)
    -> Result<Option<Vec<Value>>>;

    /// Acquire a lock on an existing row (version check / `FOR UPDATE`).
    fn lock(
        &self,
        conn: &mut dyn Connection,
        id: &Value,
        version: Option<&Value>,
        lock: LockMode,
    ) -> Result<()>;

    /// Split a result row into identifier and state.
    fn hydrate(&self, row: &Row) -> Result<(Value, Vec<Value>)>;

    /// Index of a property in the state vector.
    fn property_index(&self, name: &str) -> Option<usize> {
        self.properties().iter().position(|p| p.name == name)
    }

    /// Index of the version property in the state vector.
    fn version_index(&self) -> Option<usize> {
        self.version_property()
            .and_then(|name| self.property_index(name))
    }
}

/// Kind of element stored by a collection role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Value(SqlType),
    Entity { target: String },
}

/// Persister for one collection role.
pub trait CollectionPersister: Send + Sync + fmt::Debug {
    fn role(&self) -> &str;

    fn owner_entity(&self) -> &str;

    fn element_kind(&self) -> &ElementKind;

    fn query_spaces(&self) -> &[String];

    fn cascade(&self) -> CascadeStyle {
        CascadeStyle::NONE
    }

    /// Element keys currently stored for an owner.
    fn load(&self, conn: &mut dyn Connection, owner_key: &Value) -> Result<Vec<Value>>;

    /// Write every element for an owner (the collection was replaced or is new).
    fn recreate(&self, conn: &mut dyn Connection, owner_key: &Value, elements: &[Value])
    -> Result<()>;

    /// Apply an element diff.
    fn update(
        &self,
        conn: &mut dyn Connection,
        owner_key: &Value,
        removed: &[Value],
        added: &[Value],
    ) -> Result<()>;

    /// Remove every element row of an owner.
    fn remove(&self, conn: &mut dyn Connection, owner_key: &Value) -> Result<()>;
}

/// Registry of all persisters known to a factory.
#[derive(Debug, Default, Clone)]
pub struct Metamodel {
    entities: HashMap<String, Arc<dyn EntityPersister>>,
    collections: HashMap<String, Arc<dyn CollectionPersister>>,
}

impl Metamodel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity(&mut self, persister: Arc<dyn EntityPersister>) {
        self.entities
            .insert(persister.entity_name().to_string(), persister);
    }

    pub fn register_collection(&mut self, persister: Arc<dyn CollectionPersister>) {
        self.collections
            .insert(persister.role().to_string(), persister);
    }

    pub fn entity_persister(&self, entity_name: &str) -> Result<Arc<dyn EntityPersister>> {
        self.entities.get(entity_name).cloned().ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownEntity,
                Some(entity_name),
                format!("Unknown entity: {entity_name}"),
            )
        })
    }

    pub fn collection_persister(&self, role: &str) -> Result<Arc<dyn CollectionPersister>> {
        self.collections.get(role).cloned().ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownCollection,
                None,
                format!("Unknown collection role: {role}"),
            )
        })
    }

    pub fn has_entity(&self, entity_name: &str) -> bool {
        self.entities.contains_key(entity_name)
    }

    pub fn entity_names(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    /// Entity persisters whose tables intersect `spaces`.
    pub fn persisters_for_spaces(&self, spaces: &BTreeSet<String>) -> Vec<Arc<dyn EntityPersister>> {
        self.entities
            .values()
            .filter(|p| p.query_spaces().iter().any(|s| spaces.contains(s)))
            .cloned()
            .collect()
    }
}

impl EntityResolver for Metamodel {
    fn entity_type(&self, descriptor: &str) -> Option<ValueType> {
        self.entities.get(descriptor).map(|p| ValueType::Entity {
            entity: p.entity_name().to_string(),
            id_span: p.identifier_type().column_span(),
        })
    }
}
