//! Session runtime for Strata.
//!
//! `strata-session` is the **unit-of-work layer**. A [`Session`] owns a
//! persistence context (one managed instance per identity), an action queue
//! of pending writes, and a lazily acquired connection.
//!
//! # Role In The Architecture
//!
//! - **Persistence context**: identity map, loaded-state snapshots, entity
//!   and collection entries, proxies and the cascade depth counter.
//! - **Action queue**: inserts, updates, deletes and collection actions,
//!   executed in a fixed phase order at flush.
//! - **Transactions**: begin, commit and rollback delegate to the store;
//!   completion work runs once the outcome is known.
//! - **Queries**: translated queries, native SQL and collection filters
//!   share one execution path with autoflush and the query result cache.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::builder(metamodel, provider).build()?;
//! let mut session = factory.open_session();
//!
//! session.begin_transaction()?;
//! session.save(&customer)?;
//! let rows = session
//!     .create_query("select * from customer where name = :name")?
//!     .set_parameter("name", "ann")?
//!     .list()?;
//! session.commit()?;
//! ```

pub mod action;
pub mod action_queue;
pub mod config;
pub mod context;
pub mod events;
pub mod factory;
pub mod query;
pub mod scroll;
pub mod session;
pub mod snapshot;
pub mod table;

#[cfg(test)]
mod test_support;

pub use action::{Action, Completion, Phase};
pub use action_queue::{ActionQueue, FlushStats, QueueSnapshot};
pub use config::{CacheMode, ConnectionReleaseMode, FlushMode, SessionConfig, TrackingMode};
pub use context::{
    CollectionEntry, CollectionKey, ContextSnapshot, EntityEntry, EntityKey, EntityStatus,
    PersistenceContext,
};
pub use events::{Handler, HandlerPipeline, OperationEvent, OperationKind, Stage};
pub use factory::{NamedQuery, QueryResultCache, SessionFactory, SessionFactoryBuilder};
pub use query::{Query, QueryIter, QueryKind, QueryResult};
pub use scroll::ScrollableResults;
pub use session::{Session, SessionSnapshot};
pub use snapshot::GraphCopier;
pub use table::{TableCollectionPersister, TablePersister};
