//! Core types and traits for Strata.
//!
//! This crate provides the foundational abstractions shared by the query and
//! session layers:
//!
//! - `Value` / `ValueType` / `TypeRegistry` for typed values
//! - `Entity`, `EntityRef` and lazy `Association` / `CollectionRef` cells
//! - `Connection` and `ConnectionProvider` for blocking store access
//! - `EntityPersister` / `CollectionPersister` mapping collaborators
//! - `CacheRegion` second-level cache collaborator
//! - `QueryTranslator` and `ParameterMetadata`

pub mod cache;
pub mod connection;
pub mod entity;
pub mod error;
pub mod lock;
pub mod persister;
pub mod row;
pub mod translator;
pub mod types;
pub mod value;

pub use cache::{CacheKey, CacheRegion, CachedEntry, MapCacheRegion, MapRegionFactory, RegionFactory};
pub use connection::{
    CancelToken, Connection, ConnectionProvider, ExternalTransaction, IsolationLevel, RowStream,
    Statement, VecRowStream,
};
pub use entity::{
    Association, CollectionIdentity, CollectionRef, Element, Entity, EntityIdentity, EntityRef,
    LoadState, PersistentCollection, Property,
};
pub use error::{
    BindingError, BindingErrorKind, ConfigError, ConnectionError, ConnectionErrorKind, Error,
    MappingError, MappingErrorKind, PlanValidationError, QueryError, QueryErrorKind, Result,
    StoreError, StoreResult, TransactionError, TransactionErrorKind, UsageError, UsageErrorKind,
};
pub use lock::{LockMode, LockOptions};
pub use persister::{
    CascadeStyle, CollectionPersister, ElementKind, EntityPersister, IdGeneration, Metamodel,
    PropertyKind, PropertyMapping,
};
pub use row::{ColumnInfo, Row};
pub use translator::{
    NamedParameterDescriptor, ParamSlot, ParameterMetadata, QueryTranslator, StatementKind,
    TranslatedQuery, TranslationRequest,
};
pub use types::{EntityResolver, SqlType, TypeRegistry, ValueType};
pub use value::{ObjectValue, Value, ValueKey};
