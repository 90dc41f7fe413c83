use std::fmt;
use std::thread;

use tracing::trace;

use crate::binding::bind_params;
use crate::connection::Connection;
use crate::error::DbError;
use crate::row::{ColumnInfo, Row};
use crate::types::{FromValue, Value};

/// Where a [`Statement`]'s cursor stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Bound and not yet stepped.
    Ready,
    /// Stepped at least once with rows possibly remaining.
    HasRow,
    /// Ran to completion or stopped on an error.
    Exhausted,
}

/// A compiled statement bound to one [`Connection`].
///
/// Statements are single pass: once stepped they must be [`reset`](Statement::reset) (which
/// rebinds the last parameters) or [`bind`](Statement::bind) again before they can run again.
pub struct Statement<'c> {
    stmt: rusqlite::Statement<'c>,
    conn: &'c Connection,
    sql: String,
    columns: Vec<ColumnInfo>,
    params: Vec<Value>,
    state: CursorState,
}

impl<'c> Statement<'c> {
    pub(crate) fn new(conn: &'c Connection, stmt: rusqlite::Statement<'c>, sql: &str) -> Self {
        let columns = stmt
            .columns()
            .iter()
            .map(|c| ColumnInfo {
                name: c.name().to_owned(),
                decl_type: c.decl_type().map(str::to_owned),
            })
            .collect();
        Self {
            stmt,
            conn,
            sql: sql.to_owned(),
            columns,
            params: Vec::new(),
            state: CursorState::Ready,
        }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    #[must_use]
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    #[must_use]
    pub fn state(&self) -> CursorState {
        self.state
    }

    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.stmt.parameter_count()
    }

    /// Bind a new parameter list and rewind the cursor.
    ///
    /// # Errors
    ///
    /// Returns `DbError::BindingError` on a count mismatch or a value with no bindable form.
    pub fn bind(&mut self, params: &[Value]) -> Result<(), DbError> {
        bind_params(&mut self.stmt, params)?;
        self.params = params.to_vec();
        self.state = CursorState::Ready;
        Ok(())
    }

    /// Rewind the cursor, rebinding the last parameters.
    ///
    /// # Errors
    ///
    /// Returns `DbError::BindingError` if rebinding fails.
    pub fn reset(&mut self) -> Result<(), DbError> {
        let params = std::mem::take(&mut self.params);
        self.bind(&params)
    }

    fn ensure_ready(&self) -> Result<(), DbError> {
        if self.state == CursorState::Ready {
            Ok(())
        } else {
            Err(DbError::StatementNotReset)
        }
    }

    /// Step to completion, returning the number of rows changed. Statements that change no
    /// rows themselves (queries, DDL, `ATTACH`, pragmas) report 0.
    ///
    /// # Errors
    ///
    /// Returns `DbError::StatementNotReset` if already stepped, otherwise any engine error.
    pub fn run(&mut self) -> Result<usize, DbError> {
        self.ensure_ready()?;
        self.state = CursorState::Exhausted;
        let before = self.conn.raw().total_changes();
        let stmt = &mut self.stmt;
        self.conn.with_contention_retry("run", || {
            let mut rows = stmt.raw_query();
            while rows.next()?.is_some() {}
            Ok(())
        })?;
        // `changes()` keeps the last DML count, so only trust it when this step changed rows.
        if self.stmt.readonly() || self.conn.raw().total_changes() == before {
            Ok(0)
        } else {
            Ok(usize::try_from(self.conn.raw().changes()).unwrap_or(usize::MAX))
        }
    }

    /// Visit up to `limit` rows. The first step is retried under the lock policy; once a row
    /// has been handed out the cursor is never rewound.
    fn drive<F>(&mut self, limit: Option<usize>, mut f: F) -> Result<usize, DbError>
    where
        F: FnMut(&Row<'_>) -> Result<(), DbError>,
    {
        self.ensure_ready()?;
        let policy = self.conn.lock_policy();
        let Statement {
            stmt,
            columns,
            state,
            ..
        } = self;
        let columns: &[ColumnInfo] = columns;
        *state = CursorState::Exhausted;

        let mut attempt = 0;
        loop {
            let mut rows = stmt.raw_query();
            match rows.next() {
                Err(err) => {
                    let err = DbError::from(err);
                    if err.is_contention()
                        && let Some(delay) = policy.backoff(attempt)
                    {
                        trace!(attempt, ?delay, "sqlite lock contention on first step; retrying");
                        thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
                Ok(None) => return Ok(0),
                Ok(Some(first)) => {
                    *state = CursorState::HasRow;
                    f(&Row::new(first, columns))?;
                    let mut seen = 1;
                    while limit.is_none_or(|max| seen < max) {
                        match rows.next()? {
                            Some(row) => {
                                f(&Row::new(row, columns))?;
                                seen += 1;
                            }
                            None => {
                                *state = CursorState::Exhausted;
                                break;
                            }
                        }
                    }
                    return Ok(seen);
                }
            }
        }
    }

    /// Invoke `f` for every remaining row and return how many were visited.
    ///
    /// # Errors
    ///
    /// Returns `DbError::StatementNotReset` if already stepped, or the first error from the
    /// engine or `f`.
    pub fn fetch<F>(&mut self, f: F) -> Result<usize, DbError>
    where
        F: FnMut(&Row<'_>) -> Result<(), DbError>,
    {
        self.drive(None, f)
    }

    /// Map the first row with `f`, if there is one.
    ///
    /// # Errors
    ///
    /// Same as [`Statement::fetch`].
    pub fn query_row<R, F>(&mut self, f: F) -> Result<Option<R>, DbError>
    where
        F: FnOnce(&Row<'_>) -> Result<R, DbError>,
    {
        let mut f = Some(f);
        let mut out = None;
        self.drive(Some(1), |row| {
            if let Some(f) = f.take() {
                out = Some(f(row)?);
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// First column of the first row.
    ///
    /// # Errors
    ///
    /// Same as [`Statement::fetch`], plus `DbError::ExtractionError` if the value does not
    /// convert to `T`.
    pub fn query_value<T: FromValue>(&mut self) -> Result<Option<T>, DbError> {
        self.query_row(|row| row.get(0))
    }

    /// Pull rows one at a time.
    ///
    /// Contention while stepping is not retried here; the engine busy timeout still applies.
    ///
    /// # Errors
    ///
    /// Returns `DbError::StatementNotReset` if already stepped.
    pub fn rows(&mut self) -> Result<Rows<'_>, DbError> {
        self.ensure_ready()?;
        self.state = CursorState::HasRow;
        let Statement {
            stmt,
            columns,
            state,
            ..
        } = self;
        Ok(Rows {
            inner: stmt.raw_query(),
            columns,
            state,
        })
    }
}

impl fmt::Debug for Statement<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.sql)
            .field("params", &self.params)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// Pull-based cursor over a [`Statement`]'s rows.
pub struct Rows<'s> {
    inner: rusqlite::Rows<'s>,
    columns: &'s [ColumnInfo],
    state: &'s mut CursorState,
}

impl Rows<'_> {
    /// Advance the cursor. The returned [`Row`] is valid until the next call.
    ///
    /// # Errors
    ///
    /// Returns the engine error; the cursor is exhausted afterwards.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Result<Option<Row<'_>>, DbError> {
        match self.inner.next() {
            Ok(Some(row)) => Ok(Some(Row::new(row, self.columns))),
            Ok(None) => {
                *self.state = CursorState::Exhausted;
                Ok(None)
            }
            Err(err) => {
                *self.state = CursorState::Exhausted;
                Err(err.into())
            }
        }
    }
}
