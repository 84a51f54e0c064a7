//! Scrollable query results.

use std::sync::Arc;

use strata_core::{EntityPersister, EntityRef, Result, Row, RowStream, Statement, Value};
use strata_query::{ScrollMode, ScrollableCursor};

use crate::config::TrackingMode;
use crate::query::QueryResult;
use crate::session::{Session, lock_state};

/// Cursor over query results that hydrates rows on access.
///
/// While open it keeps the session's connection pinned. Closing or dropping
/// it hands the connection back under the session's release mode.
#[derive(Debug)]
pub struct ScrollableResults<'s> {
    session: &'s mut Session,
    cursor: ScrollableCursor,
    persister: Option<Arc<dyn EntityPersister>>,
    read_only: bool,
    /// Entities materialized for the current row, detached after the next
    /// successful move in reduced tracking mode.
    row_entities: Vec<EntityRef>,
}

impl<'s> ScrollableResults<'s> {
    pub(crate) fn open(
        session: &'s mut Session,
        stream: Box<dyn RowStream>,
        statement: Statement,
        mode: ScrollMode,
        persister: Option<Arc<dyn EntityPersister>>,
        group_rows: bool,
        read_only: bool,
    ) -> Self {
        let link = Arc::clone(&session.link);
        let mut cursor = ScrollableCursor::new(stream, statement.sql.clone(), mode)
            .with_cancel_token(statement.cancel.clone())
            .with_after_move(Box::new(|position| {
                tracing::trace!(position, "Cursor moved");
            }))
            .with_on_close(move || {
                let mut state = lock_state(&link);
                state.open_cursors = state.open_cursors.saturating_sub(1);
                state.release_if_idle();
            });
        if group_rows && persister.is_some() {
            // Rows of one fetch-joined entity share its identifier in the
            // first column.
            cursor = cursor.with_row_key(Box::new(|row: &Row| row.get(0).cloned().unwrap_or(Value::Null)));
        }
        tracing::debug!(sql = %statement.sql, ?mode, "Opened scrollable results");
        Self {
            session,
            cursor,
            persister,
            read_only,
            row_entities: Vec::new(),
        }
    }

    /// Post-move step: the previous row's entities are detached in reduced
    /// tracking mode. A failed move leaves them untouched.
    fn moved<T>(&mut self, result: Result<T>) -> Result<T> {
        let value = result?;
        let previous = std::mem::take(&mut self.row_entities);
        if self.session.tracking_mode() == TrackingMode::Reduced {
            for entity in previous {
                self.session.evict_entity(&entity)?;
            }
        }
        Ok(value)
    }

    pub fn next(&mut self) -> Result<bool> {
        let result = self.cursor.next();
        self.moved(result)
    }

    pub fn previous(&mut self) -> Result<bool> {
        let result = self.cursor.previous();
        self.moved(result)
    }

    /// Move `n` rows relative to the current one.
    pub fn scroll(&mut self, n: isize) -> Result<bool> {
        let result = self.cursor.scroll(n);
        self.moved(result)
    }

    pub fn first(&mut self) -> Result<bool> {
        let result = self.cursor.first();
        self.moved(result)
    }

    pub fn last(&mut self) -> Result<bool> {
        let result = self.cursor.last();
        self.moved(result)
    }

    /// Absolute positioning: 1-based from the start, negative from the end.
    pub fn set_row_number(&mut self, n: isize) -> Result<bool> {
        let result = self.cursor.set_row_number(n);
        self.moved(result)
    }

    pub fn before_first(&mut self) -> Result<()> {
        let result = self.cursor.before_first();
        self.moved(result)
    }

    pub fn after_last(&mut self) -> Result<()> {
        let result = self.cursor.after_last();
        self.moved(result)
    }

    pub fn is_first(&self) -> bool {
        self.cursor.is_first()
    }

    pub fn is_last(&mut self) -> Result<bool> {
        self.cursor.is_last()
    }

    pub fn position(&self) -> usize {
        self.cursor.position()
    }

    /// Physical rows backing the current result.
    pub fn rows(&self) -> Option<&[Row]> {
        self.cursor.get()
    }

    /// The current result, hydrated through the session when the query
    /// returns an entity.
    pub fn get(&mut self) -> Result<Option<QueryResult>> {
        let Some(row) = self.cursor.row().cloned() else {
            return Ok(None);
        };
        let Some(persister) = &self.persister else {
            return Ok(Some(QueryResult::Row(row)));
        };
        let persister = Arc::clone(persister);
        let (entity, created) = self.session.hydrate_row(&persister, &row, self.read_only)?;
        if created {
            self.row_entities.push(entity.clone());
        }
        Ok(Some(QueryResult::Entity(entity)))
    }

    pub fn is_closed(&self) -> bool {
        self.cursor.is_closed()
    }

    /// Release the cursor and its connection hold. Idempotent.
    pub fn close(&mut self) {
        self.row_entities.clear();
        self.cursor.close();
    }
}

impl Drop for ScrollableResults<'_> {
    fn drop(&mut self) {
        self.close();
    }
}
