//! Strata - a unit-of-work persistence runtime over a relational store.
//!
//! Strata keeps domain objects in an in-memory unit of work, tracks new,
//! changed and removed objects, writes them to the store in a
//! dependency-safe order on demand, and runs parameterized queries with
//! typed bindings and cursor navigation.
//!
//! - One managed instance per identity inside a session
//! - Write-behind through an ordered action queue
//! - Typed parameter binding with list expansion
//! - Shared, bounded query plan cache
//! - Scrollable cursors that keep their connection until closed
//!
//! # Quick Start
//!
//! ```ignore
//! use strata::prelude::*;
//!
//! let mut metamodel = Metamodel::new();
//! metamodel.register_entity(Arc::new(
//!     TablePersister::new("Customer", "customer")
//!         .property(PropertyMapping::basic("name", SqlType::Text)),
//! ));
//! let factory = SessionFactory::builder(metamodel, provider).build()?;
//!
//! let mut session = factory.open_session();
//! session.begin_transaction()?;
//! let ann = EntityRef::new(Entity::new("Customer").with_id(1_i64).with("name", "ann"));
//! session.save(&ann)?;
//! session.commit()?;
//! ```
//!
//! The store itself is reached through [`Connection`] and
//! [`ConnectionProvider`]; no driver ships with this crate.

pub use strata_core::{
    Association, BindingError, BindingErrorKind, CacheKey, CacheRegion, CachedEntry, CancelToken,
    CascadeStyle, CollectionIdentity, CollectionPersister, CollectionRef, ColumnInfo, ConfigError,
    Connection, ConnectionError, ConnectionErrorKind, ConnectionProvider, Element, ElementKind,
    Entity, EntityIdentity, EntityPersister, EntityRef, EntityResolver, Error, ExternalTransaction,
    IdGeneration, IsolationLevel, LoadState, LockMode, LockOptions, MapCacheRegion,
    MapRegionFactory, MappingError, MappingErrorKind, Metamodel, NamedParameterDescriptor,
    ObjectValue, ParamSlot, ParameterMetadata, PersistentCollection, PlanValidationError, Property,
    PropertyKind, PropertyMapping, QueryError, QueryErrorKind, QueryTranslator, RegionFactory,
    Result, Row, RowStream, SqlType, Statement, StatementKind, StoreError, StoreResult,
    TransactionError, TransactionErrorKind, TranslatedQuery, TranslationRequest, TypeRegistry,
    UsageError, UsageErrorKind, Value, ValueKey, ValueType, VecRowStream,
};
pub use strata_query::{
    ExpandedQuery, NativeSqlTranslator, ParameterBinder, PlanSignature, QueryParameters, QueryPlan,
    QueryPlanCache, RowSelection, ScrollMode, ScrollableCursor, TypedList, TypedValue,
};
pub use strata_session::{
    Action, ActionQueue, CacheMode, CollectionEntry, CollectionKey, Completion,
    ConnectionReleaseMode, ContextSnapshot, EntityEntry, EntityKey, EntityStatus, FlushMode,
    FlushStats, GraphCopier, Handler, HandlerPipeline, NamedQuery, OperationEvent, OperationKind,
    PersistenceContext, Phase, Query, QueryIter, QueryKind, QueryResult, QueryResultCache,
    QueueSnapshot, ScrollableResults, Session, SessionConfig, SessionFactory,
    SessionFactoryBuilder, SessionSnapshot, Stage, TableCollectionPersister, TablePersister,
    TrackingMode,
};

/// Sub-crates, for items not re-exported at the top level.
pub mod core {
    pub use strata_core::*;
}

pub mod query {
    pub use strata_query::*;
}

pub mod session {
    pub use strata_session::*;
}

/// Everything an application typically needs.
pub mod prelude {
    pub use crate::{
        // Mapping
        CascadeStyle,
        CollectionRef,
        Connection,
        ConnectionProvider,
        Element,
        ElementKind,
        Entity,
        EntityRef,
        // Errors
        Error,
        FlushMode,
        IdGeneration,
        LockMode,
        Metamodel,
        PropertyMapping,
        Query,
        QueryResult,
        Result,
        Row,
        ScrollMode,
        // Session
        Session,
        SessionConfig,
        SessionFactory,
        SqlType,
        TableCollectionPersister,
        TablePersister,
        TrackingMode,
        Value,
    };
    pub use std::sync::Arc;
}
