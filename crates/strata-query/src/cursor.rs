//! Position-aware navigation over a row stream.
//!
//! Positions are 1-based; 0 is the before-first sentinel and `max + 1` the
//! after-last sentinel. The maximum position is unknown until the stream has
//! been observed to end.
//!
//! A logical row may span several physical rows (a fetch join over a
//! collection): consecutive rows yielding the same key under the configured
//! row key are grouped into one logical row.
//!
//! Absolute positioning is always performed by relative stepping; the store
//! is never asked to seek.

use std::fmt;
use strata_core::{
    CancelToken, Error, Result, Row, RowStream, StoreError, UsageErrorKind, Value,
};

/// How the cursor may move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScrollMode {
    /// Forward only; only the current logical row is kept.
    ForwardOnly,
    /// Every fetched logical row is buffered, allowing backward movement.
    #[default]
    Insensitive,
}

/// Extracts the grouping key of a physical row.
pub type RowKeyFn = Box<dyn Fn(&Row) -> Value + Send>;

/// Called after every successful reposition with the new position.
pub type AfterMoveFn = Box<dyn FnMut(usize) + Send>;

type OnCloseFn = Box<dyn FnOnce() + Send>;

/// Scrollable cursor over an open [`RowStream`].
pub struct ScrollableCursor {
    sql: String,
    stream: Option<Box<dyn RowStream>>,
    mode: ScrollMode,
    row_key: Option<RowKeyFn>,
    lookahead: Option<Row>,
    /// Logical rows fetched so far (insensitive mode only).
    buffer: Vec<Vec<Row>>,
    /// Logical row read ahead by `is_last` in forward-only mode.
    prefetched: Option<Vec<Row>>,
    current: Option<Vec<Row>>,
    position: usize,
    fetched: usize,
    max_position: Option<usize>,
    cancel: CancelToken,
    after_move: Option<AfterMoveFn>,
    on_close: Option<OnCloseFn>,
    closed: bool,
}

impl fmt::Debug for ScrollableCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScrollableCursor")
            .field("sql", &self.sql)
            .field("mode", &self.mode)
            .field("position", &self.position)
            .field("max_position", &self.max_position)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl ScrollableCursor {
    pub fn new(stream: Box<dyn RowStream>, sql: impl Into<String>, mode: ScrollMode) -> Self {
        Self {
            sql: sql.into(),
            stream: Some(stream),
            mode,
            row_key: None,
            lookahead: None,
            buffer: Vec::new(),
            prefetched: None,
            current: None,
            position: 0,
            fetched: 0,
            max_position: None,
            cancel: CancelToken::new(),
            after_move: None,
            on_close: None,
            closed: false,
        }
    }

    /// Group consecutive physical rows with equal keys into one logical row.
    #[must_use]
    pub fn with_row_key(mut self, key: RowKeyFn) -> Self {
        self.row_key = Some(key);
        self
    }

    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn with_after_move(mut self, hook: AfterMoveFn) -> Self {
        self.after_move = Some(hook);
        self
    }

    /// Run once when the cursor is closed, explicitly or on drop.
    #[must_use]
    pub fn with_on_close(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_close = Some(Box::new(hook));
        self
    }

    pub fn mode(&self) -> ScrollMode {
        self.mode
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Current 1-based position; 0 before the first row.
    pub fn position(&self) -> usize {
        self.position
    }

    /// Number of logical rows, once the end of the stream has been seen.
    pub fn max_position(&self) -> Option<usize> {
        self.max_position
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Physical rows of the current logical row.
    pub fn get(&self) -> Option<&[Row]> {
        self.current.as_deref()
    }

    /// First physical row of the current logical row.
    pub fn row(&self) -> Option<&Row> {
        self.current.as_ref().and_then(|rows| rows.first())
    }

    // ========================================================================
    // Movement
    // ========================================================================

    /// Advance one logical row. Returns `false` once past the last row.
    pub fn next(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let moved = self.step_forward()?;
        self.fire_after_move();
        Ok(moved)
    }

    /// Step back one logical row. Returns `false` on reaching position 0.
    pub fn previous(&mut self) -> Result<bool> {
        self.ensure_open()?;
        self.ensure_scrollable("previous")?;
        let moved = self.step_back();
        self.fire_after_move();
        Ok(moved)
    }

    /// Move `n` rows forward (positive) or backward (negative).
    pub fn scroll(&mut self, n: isize) -> Result<bool> {
        if n == 0 {
            return Err(Error::usage(
                UsageErrorKind::InvalidScroll,
                "scroll(0) is not a movement",
            ));
        }
        self.ensure_open()?;
        if n < 0 {
            self.ensure_scrollable("scroll")?;
        }
        let moved = self.scroll_by(n)?;
        self.fire_after_move();
        Ok(moved)
    }

    pub fn first(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let moved = self.go_first()?;
        self.fire_after_move();
        Ok(moved)
    }

    /// Move to the last row, reading the rest of the stream if its length is
    /// not known yet.
    pub fn last(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let moved = self.go_last()?;
        self.fire_after_move();
        Ok(moved)
    }

    /// Absolute positioning: `1` is [`first`](Self::first), `-1` or the known
    /// maximum is [`last`](Self::last), anything else is a relative scroll.
    pub fn set_row_number(&mut self, n: isize) -> Result<bool> {
        if n == 1 {
            return self.first();
        }
        if n == -1 || self.max_position.is_some_and(|max| n >= 0 && n as usize == max) {
            return self.last();
        }
        let current = self.position as isize;
        self.scroll(n - current)
    }

    pub fn before_first(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.position != 0 {
            self.ensure_scrollable("before_first")?;
        }
        self.position = 0;
        self.current = None;
        self.fire_after_move();
        Ok(())
    }

    pub fn after_last(&mut self) -> Result<()> {
        self.ensure_open()?;
        while self.step_forward()? {}
        self.fire_after_move();
        Ok(())
    }

    pub fn is_first(&self) -> bool {
        self.position == 1 && self.current.is_some()
    }

    /// Whether the cursor is on the last row. May read one row ahead.
    pub fn is_last(&mut self) -> Result<bool> {
        self.ensure_open()?;
        if let Some(max) = self.max_position {
            return Ok(max > 0 && self.position == max);
        }
        if self.position == 0 || self.current.is_none() {
            return Ok(false);
        }
        if self.mode == ScrollMode::Insensitive && self.position < self.buffer.len() {
            return Ok(false);
        }
        if self.prefetched.is_some() {
            return Ok(false);
        }
        match self.fetch_logical()? {
            Some(rows) => {
                match self.mode {
                    ScrollMode::Insensitive => self.buffer.push(rows),
                    ScrollMode::ForwardOnly => self.prefetched = Some(rows),
                }
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Release the underlying stream. Idempotent.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.release_stream();
        self.buffer.clear();
        self.prefetched = None;
        self.current = None;
        if let Some(hook) = self.on_close.take() {
            hook();
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::usage(
                UsageErrorKind::CursorClosed,
                format!("cursor over [{}] is closed", self.sql),
            ))
        } else {
            Ok(())
        }
    }

    fn ensure_scrollable(&self, operation: &str) -> Result<()> {
        match self.mode {
            ScrollMode::Insensitive => Ok(()),
            ScrollMode::ForwardOnly => Err(Error::usage(
                UsageErrorKind::ForwardOnly,
                format!("{operation} is not allowed on a forward-only cursor"),
            )),
        }
    }

    fn fire_after_move(&mut self) {
        let position = self.position;
        if let Some(hook) = self.after_move.as_mut() {
            hook(position);
        }
    }

    fn scroll_by(&mut self, n: isize) -> Result<bool> {
        let mut moved = false;
        for _ in 0..n.unsigned_abs() {
            moved = if n > 0 {
                self.step_forward()?
            } else {
                self.step_back()
            };
            if !moved {
                break;
            }
        }
        Ok(moved)
    }

    fn go_first(&mut self) -> Result<bool> {
        match self.position {
            0 => self.step_forward(),
            1 if self.current.is_some() => Ok(true),
            _ => {
                self.ensure_scrollable("first")?;
                self.position = 0;
                self.current = None;
                self.step_forward()
            }
        }
    }

    fn go_last(&mut self) -> Result<bool> {
        if let (Some(max), ScrollMode::Insensitive) = (self.max_position, self.mode) {
            self.position = max;
            self.current = max.checked_sub(1).and_then(|i| self.buffer.get(i).cloned());
            return Ok(self.current.is_some());
        }
        if self.current.is_none() && self.max_position.is_some_and(|max| self.position > max) {
            self.ensure_scrollable("last")?;
        }
        loop {
            let held = self.current.take();
            let held_position = self.position;
            if !self.step_forward()? {
                self.current = held;
                self.position = if self.current.is_some() { held_position } else { 0 };
                return Ok(self.current.is_some());
            }
        }
    }

    fn step_forward(&mut self) -> Result<bool> {
        let target = self.position + 1;
        if let Some(max) = self.max_position {
            if target > max {
                self.position = max + 1;
                self.current = None;
                return Ok(false);
            }
        }
        if self.mode == ScrollMode::Insensitive && target <= self.buffer.len() {
            self.current = Some(self.buffer[target - 1].clone());
            self.position = target;
            return Ok(true);
        }
        let next = match self.prefetched.take() {
            Some(rows) => Some(rows),
            None => self.fetch_logical()?,
        };
        match next {
            Some(rows) => {
                if self.mode == ScrollMode::Insensitive {
                    self.buffer.push(rows.clone());
                }
                self.current = Some(rows);
                self.position = target;
                Ok(true)
            }
            None => {
                self.position = self.fetched + 1;
                self.current = None;
                Ok(false)
            }
        }
    }

    fn step_back(&mut self) -> bool {
        if self.position <= 1 {
            self.position = 0;
            self.current = None;
            return false;
        }
        self.position -= 1;
        self.current = self.buffer.get(self.position - 1).cloned();
        self.current.is_some()
    }

    /// Read the next logical row from the stream.
    fn fetch_logical(&mut self) -> Result<Option<Vec<Row>>> {
        if self.stream.is_none() {
            return Ok(None);
        }
        if self.cancel.is_cancelled() {
            return Err(Error::from_store(StoreError::cancelled(), Some(&self.sql)));
        }
        let first = match self.lookahead.take() {
            Some(row) => Some(row),
            None => self.read_physical()?,
        };
        let Some(first) = first else {
            self.max_position = Some(self.fetched);
            tracing::trace!(sql = %self.sql, rows = self.fetched, "cursor exhausted");
            self.release_stream();
            return Ok(None);
        };

        let mut group = vec![first];
        if let Some(key_fn) = &self.row_key {
            let key = key_fn(&group[0]);
            loop {
                let Some(row) = read_from(&mut self.stream, &self.sql)? else {
                    break;
                };
                if key_fn(&row).identity_eq(&key) {
                    group.push(row);
                } else {
                    self.lookahead = Some(row);
                    break;
                }
            }
        }
        self.fetched += 1;
        Ok(Some(group))
    }

    fn read_physical(&mut self) -> Result<Option<Row>> {
        read_from(&mut self.stream, &self.sql)
    }

    fn release_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.close();
        }
    }
}

fn read_from(stream: &mut Option<Box<dyn RowStream>>, sql: &str) -> Result<Option<Row>> {
    match stream {
        Some(s) => s.next_row().map_err(|e| Error::from_store(e, Some(sql))),
        None => Ok(None),
    }
}

impl Drop for ScrollableCursor {
    fn drop(&mut self) {
        self.close();
    }
}
