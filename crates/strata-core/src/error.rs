//! Error types for Strata operations.
//!
//! Errors fall into four families:
//!
//! - **usage** errors (closed session, `scroll(0)`, malformed parameter lists) are
//!   raised synchronously at the offending call;
//! - **binding** errors (missing named parameters, positional count mismatch,
//!   unresolvable types) are raised before any statement reaches the store and
//!   always carry the query text;
//! - **store** errors are reported by drivers as [`StoreError`] and classified
//!   into [`QueryError`] / [`ConnectionError`] by [`Error::from_store`];
//! - **mapping** errors describe metadata problems (unknown entity, missing row).

use std::fmt;

/// The primary error type for all Strata operations.
#[derive(Debug)]
pub enum Error {
    /// API misuse detected at the call site
    Usage(UsageError),
    /// Parameter binding / verification failure
    Binding(BindingError),
    /// Statement execution errors, classified from the store
    Query(QueryError),
    /// Connection-related errors (acquire, disconnect)
    Connection(ConnectionError),
    /// Transaction boundary errors
    Transaction(TransactionError),
    /// Entity / collection metadata errors
    Mapping(MappingError),
    /// Aggregated failures from eager query validation
    PlanValidation(PlanValidationError),
    /// Configuration errors
    Config(ConfigError),
    /// Custom error with message
    Custom(String),
}

// ============================================================================
// Usage errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct UsageError {
    pub kind: UsageErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageErrorKind {
    /// Operation on a closed session
    SessionClosed,
    /// Operation on a session left unusable by an earlier store failure
    SessionBroken,
    /// The action queue failed mid-execution and cannot run again
    QueueUnusable,
    /// Flush requested while a cascade is in progress
    FlushDuringCascade,
    /// `scroll(0)` or another invalid cursor movement
    InvalidScroll,
    /// Backward movement on a forward-only cursor
    ForwardOnly,
    /// Cursor already closed
    CursorClosed,
    /// Empty or otherwise unusable parameter list
    MalformedList,
    /// A different instance with the same identity is already managed
    NonUniqueObject,
    /// A managed entity references an unsaved transient entity
    TransientReference,
    /// The entity is not associated with this session
    NotManaged,
    /// Access to an uninitialized association or collection
    LazyInitialization,
    /// Operation not supported by the query kind
    Unsupported,
    /// Transaction state does not allow the operation
    Transaction,
    /// Filter name not defined on the session factory
    UnknownFilter,
    /// Detached instance handed to an operation that requires a transient one
    DetachedEntity,
    /// A query expected to return at most one result returned more
    NonUniqueResult,
}

impl UsageError {
    pub fn new(kind: UsageErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// ============================================================================
// Binding errors
// ============================================================================

#[derive(Debug, Clone)]
pub struct BindingError {
    pub kind: BindingErrorKind,
    /// The query text the parameters were bound against.
    pub query: String,
    /// Name or position of the offending parameter(s).
    pub parameter: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingErrorKind {
    /// Named parameters discovered in the query were never bound
    MissingNamed,
    /// A positional slot was left unset
    UnsetPositional,
    /// Bound positional column span differs from the ordinal count
    PositionalCount,
    /// No type could be resolved for a bound value
    UndeterminedType,
    /// Position outside the query's ordinal parameters
    UnknownPosition,
    /// Name not present in the query
    UnknownName,
    /// Synthetic alias produced by list expansion collides with an existing one
    RepeatedAlias,
}

impl BindingError {
    pub fn new(
        kind: BindingErrorKind,
        query: impl Into<String>,
        parameter: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            query: query.into(),
            parameter,
            message: message.into(),
        }
    }
}

// ============================================================================
// Store errors
// ============================================================================

/// Raw error reported by a driver. Never escapes the session layer;
/// [`Error::from_store`] classifies it into [`QueryError`] or [`ConnectionError`].
#[derive(Debug)]
pub struct StoreError {
    pub sqlstate: Option<String>,
    pub message: String,
}

impl StoreError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            sqlstate: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_sqlstate(mut self, sqlstate: impl Into<String>) -> Self {
        self.sqlstate = Some(sqlstate.into());
        self
    }

    /// Driver-side cancellation marker (SQLSTATE 57014).
    pub fn cancelled() -> Self {
        Self::new("statement cancelled").with_sqlstate("57014")
    }
}

/// Result type for driver-level operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error or unknown table/column
    Syntax,
    /// Constraint violation (unique, foreign key, etc.)
    Constraint,
    /// Optimistic version check failed or row count mismatch
    StaleState,
    /// Statement cancelled out-of-band
    Cancelled,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to obtain a connection from the provider
    Acquire,
    /// Connection lost during operation
    Disconnected,
}

// ============================================================================
// Transaction / mapping / validation / config
// ============================================================================

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// begin() while a transaction is already active
    AlreadyActive,
    /// commit()/rollback() without an active transaction
    NotActive,
    /// A completion callback failed after the store committed
    Completion,
}

#[derive(Debug, Clone)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    pub entity: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// No persister registered for the entity name
    UnknownEntity,
    /// No persister registered for the collection role
    UnknownCollection,
    /// Property not declared by the entity's persister
    UnknownProperty,
    /// Row for the requested identifier does not exist
    ObjectNotFound,
    /// Property holds a value of the wrong shape
    WrongShape,
    /// Identifier missing where one is required
    MissingIdentifier,
    /// No named query registered under the name
    UnknownQuery,
}

impl MappingError {
    pub fn new(
        kind: MappingErrorKind,
        entity: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity: entity.map(str::to_string),
            message: message.into(),
        }
    }
}

/// All failures collected by an eager validation pass over named queries.
#[derive(Debug)]
pub struct PlanValidationError {
    /// (query name, failure)
    pub failures: Vec<(String, Error)>,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

// ============================================================================
// Constructors and classification
// ============================================================================

impl Error {
    pub fn usage(kind: UsageErrorKind, message: impl Into<String>) -> Self {
        Error::Usage(UsageError::new(kind, message))
    }

    pub fn binding(
        kind: BindingErrorKind,
        query: impl Into<String>,
        parameter: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Binding(BindingError::new(kind, query, parameter, message))
    }

    pub fn mapping(kind: MappingErrorKind, entity: Option<&str>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError::new(kind, entity, message))
    }

    pub fn config(message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            message: message.into(),
        })
    }

    /// Failure to obtain or keep a connection, carrying the driver error.
    pub fn connection(kind: ConnectionErrorKind, err: StoreError) -> Self {
        Error::Connection(ConnectionError {
            kind,
            message: err.message,
        })
    }

    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }

    /// Translate a raw driver error into the categorized vocabulary.
    ///
    /// Classification follows the SQLSTATE class: `08` connection, `23`
    /// constraint, `42` syntax, `57014` cancelled.
    pub fn from_store(err: StoreError, sql: Option<&str>) -> Self {
        let state = err.sqlstate.as_deref().unwrap_or("");
        if state.starts_with("08") {
            return Error::Connection(ConnectionError {
                kind: ConnectionErrorKind::Disconnected,
                message: err.message,
            });
        }
        let kind = match state {
            "57014" => QueryErrorKind::Cancelled,
            s if s.starts_with("23") => QueryErrorKind::Constraint,
            s if s.starts_with("42") => QueryErrorKind::Syntax,
            _ => QueryErrorKind::Database,
        };
        Error::Query(QueryError {
            kind,
            sql: sql.map(str::to_string),
            sqlstate: err.sqlstate,
            message: err.message,
        })
    }

    /// Optimistic check failure: the row was changed or removed by another
    /// transaction, or an update/delete matched an unexpected row count.
    pub fn stale_state(message: impl Into<String>, sql: Option<&str>) -> Self {
        Error::Query(QueryError {
            kind: QueryErrorKind::StaleState,
            sql: sql.map(str::to_string),
            sqlstate: None,
            message: message.into(),
        })
    }

    pub fn is_stale_state(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::StaleState)
    }

    /// Did the store reject or lose the statement?
    ///
    /// Such failures leave the session unusable when they happen during a flush.
    pub fn is_store_error(&self) -> bool {
        matches!(self, Error::Query(_) | Error::Connection(_))
    }

    /// Is this a cancellation of an in-flight statement?
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Query(q) if q.kind == QueryErrorKind::Cancelled)
    }

    pub fn usage_kind(&self) -> Option<UsageErrorKind> {
        match self {
            Error::Usage(u) => Some(u.kind),
            _ => None,
        }
    }

    pub fn binding_kind(&self) -> Option<BindingErrorKind> {
        match self {
            Error::Binding(b) => Some(b.kind),
            _ => None,
        }
    }

    /// Get the SQL (or query text) that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            Error::Binding(b) => Some(b.query.as_str()),
            _ => None,
        }
    }
}

// ============================================================================
// Display
// ============================================================================

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Usage(e) => write!(f, "Usage error: {}", e.message),
            Error::Binding(e) => write!(f, "Binding error: {}", e),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e.message),
            Error::PlanValidation(e) => write!(f, "{}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for UsageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for BindingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.message, self.query)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for StoreError {}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for PlanValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Errors in named queries:")?;
        for (name, err) in &self.failures {
            writeln!(f, "  - {}: {}", name, err)?;
        }
        Ok(())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Result type alias for Strata operations.
pub type Result<T> = std::result::Result<T, Error>;
