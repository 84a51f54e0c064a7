//! Database connection traits.
//!
//! This module defines the blocking collaborator surface the session talks to:
//!
//! - [`Connection`] - executes statements and manages local transactions
//! - [`ConnectionProvider`] - lends one physical connection per session
//! - [`RowStream`] - forward-only stream of result rows
//! - [`Statement`] - SQL text, flattened parameters and row selection
//! - [`CancelToken`] - out-of-band cancellation of an in-flight statement
//!
//! Drivers report failures as [`StoreError`]; the session classifies them.

use crate::error::{StoreError, StoreResult};
use crate::row::Row;
use crate::value::Value;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted: dirty reads possible.
    ReadUncommitted,
    /// Read committed: only committed changes of others are visible.
    #[default]
    ReadCommitted,
    /// Repeatable read: a consistent snapshot for the transaction.
    RepeatableRead,
    /// Serializable: transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Shared flag used to cancel an in-flight statement from another thread.
///
/// Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear a previous cancellation so the token can be reused.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// A statement ready for execution: SQL with `?` placeholders and the
/// flattened parameter values in placeholder order.
#[derive(Debug, Clone, Default)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Rows to skip (offset).
    pub first_row: Option<usize>,
    /// Row limit.
    pub max_rows: Option<usize>,
    pub fetch_size: Option<usize>,
    pub timeout: Option<Duration>,
    /// Whether the first placeholder is a return-value slot.
    pub callable: bool,
    /// Lock clause requested by the caller (`FOR UPDATE` etc.), driver-rendered.
    pub for_update: bool,
    pub cancel: CancelToken,
}

impl Statement {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Forward-only stream of rows produced by a query.
///
/// The stream owns whatever driver resources back it; `close` releases them
/// and must be idempotent.
pub trait RowStream: Send {
    /// Fetch the next row, or `None` when the stream is exhausted.
    fn next_row(&mut self) -> StoreResult<Option<Row>>;

    /// Release driver resources.
    fn close(&mut self) {}
}

/// Row stream over rows already in memory.
#[derive(Debug, Default)]
pub struct VecRowStream {
    rows: VecDeque<Row>,
    closed: bool,
}

impl VecRowStream {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            rows: rows.into(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl RowStream for VecRowStream {
    fn next_row(&mut self) -> StoreResult<Option<Row>> {
        if self.closed {
            return Err(StoreError::new("result stream already closed"));
        }
        Ok(self.rows.pop_front())
    }

    fn close(&mut self) {
        self.closed = true;
        self.rows.clear();
    }
}

/// A database connection capable of executing statements.
///
/// All operations block. Implementations should honor
/// [`Statement::cancel`] and report cancellation with
/// [`StoreError::cancelled`].
pub trait Connection: Send {
    /// Execute a query and return its rows as a stream.
    fn query(&mut self, stmt: &Statement) -> StoreResult<Box<dyn RowStream>>;

    /// Execute a statement and return the number of affected rows.
    fn execute(&mut self, stmt: &Statement) -> StoreResult<u64>;

    /// Execute an insert and return the generated key, if any.
    fn insert(&mut self, stmt: &Statement) -> StoreResult<Option<Value>>;

    /// Execute several statements, returning affected row counts.
    fn batch(&mut self, stmts: &[Statement]) -> StoreResult<Vec<u64>> {
        stmts.iter().map(|s| self.execute(s)).collect()
    }

    /// Begin a local transaction.
    fn begin(&mut self, isolation: Option<IsolationLevel>) -> StoreResult<()>;

    /// Commit the current local transaction.
    fn commit(&mut self) -> StoreResult<()>;

    /// Roll back the current local transaction.
    fn rollback(&mut self) -> StoreResult<()>;

    /// Close the physical connection.
    fn close(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

/// Lends physical connections to sessions.
pub trait ConnectionProvider: Send + Sync {
    /// Borrow a connection.
    fn acquire(&self) -> StoreResult<Box<dyn Connection>>;

    /// Return a borrowed connection.
    fn release(&self, conn: Box<dyn Connection>);
}

/// A transaction managed outside the session (e.g. by a container).
///
/// The session re-synchronizes with it at the start of every operation.
pub trait ExternalTransaction: Send + Sync {
    fn is_active(&self) -> bool;

    /// Whether the external transaction has been marked rollback-only.
    fn is_rollback_only(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared_between_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        clone.cancel();
        assert!(token.is_cancelled());
        token.reset();
        assert!(!clone.is_cancelled());
    }

    #[test]
    fn vec_stream_yields_rows_then_none() {
        let mut stream = VecRowStream::new(vec![
            Row::new(vec!["a".into()], vec![Value::Int(1)]),
            Row::new(vec!["a".into()], vec![Value::Int(2)]),
        ]);
        assert!(stream.next_row().unwrap().is_some());
        assert!(stream.next_row().unwrap().is_some());
        assert!(stream.next_row().unwrap().is_none());
        stream.close();
        assert!(stream.is_closed());
        assert!(stream.next_row().is_err());
    }
}
