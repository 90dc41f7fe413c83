use rusqlite::Batch;
use rusqlite::fallible_iterator::FallibleIterator;

use super::Connection;
use crate::error::DbError;
use crate::row::{FromRow, Row};
use crate::statement::Statement;
use crate::types::{FromValue, Value};

impl Connection {
    /// Run one or more `;`-separated statements, discarding any rows they produce.
    ///
    /// Each statement is stepped to completion on its own, so the lock policy applies per
    /// statement rather than to the script as a whole.
    ///
    /// # Errors
    ///
    /// Returns `DbError::SqliteError` on malformed SQL, constraint violations, or contention
    /// that outlasts the lock policy. Statements before the failing one stay applied.
    pub fn execute(&self, sql: &str) -> Result<(), DbError> {
        let mut batch = Batch::new(&self.conn, sql);
        while let Some(mut stmt) = batch.next()? {
            self.with_contention_retry("execute", || {
                let mut rows = stmt.raw_query();
                while rows.next()?.is_some() {}
                Ok(())
            })?;
        }
        Ok(())
    }

    /// Compile `sql` and bind `params` to its `?` placeholders.
    ///
    /// # Errors
    ///
    /// Returns `DbError::SqliteError` if the SQL does not compile and `DbError::BindingError`
    /// if the parameters do not fit the placeholders.
    pub fn prepare(&self, sql: &str, params: &[Value]) -> Result<Statement<'_>, DbError> {
        let raw = self.with_contention_retry("prepare", || Ok(self.conn.prepare(sql)?))?;
        let mut stmt = Statement::new(self, raw, sql);
        stmt.bind(params)?;
        Ok(stmt)
    }

    /// Prepare, bind and run a single statement, returning the number of changed rows.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::prepare`] plus any error the engine reports while stepping.
    pub fn run(&self, sql: &str, params: &[Value]) -> Result<usize, DbError> {
        self.prepare(sql, params)?.run()
    }

    /// First column of the first row, or `None` when the query yields no rows.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ExtractionError` if the column cannot be converted to `T`.
    pub fn query<T: FromValue>(&self, sql: &str, params: &[Value]) -> Result<Option<T>, DbError> {
        self.prepare(sql, params)?.query_value()
    }

    /// Map the first row with `f`, or return `None` when the query yields no rows.
    ///
    /// # Errors
    ///
    /// Returns whatever preparing, stepping or `f` reports.
    pub fn query_row<R, F>(&self, sql: &str, params: &[Value], f: F) -> Result<Option<R>, DbError>
    where
        F: FnOnce(&Row<'_>) -> Result<R, DbError>,
    {
        self.prepare(sql, params)?.query_row(f)
    }

    /// First column of every row.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ExtractionError` on the first value that cannot be converted.
    pub fn query_all<T: FromValue>(&self, sql: &str, params: &[Value]) -> Result<Vec<T>, DbError> {
        let mut out = Vec::new();
        self.fetch(sql, params, |row| {
            out.push(row.get(0)?);
            Ok(())
        })?;
        Ok(out)
    }

    /// Every row converted through [`FromRow`].
    ///
    /// # Errors
    ///
    /// Returns the first conversion or engine error.
    pub fn query_rows<T: FromRow>(&self, sql: &str, params: &[Value]) -> Result<Vec<T>, DbError> {
        let mut out = Vec::new();
        self.fetch(sql, params, |row| {
            out.push(T::from_row(row)?);
            Ok(())
        })?;
        Ok(out)
    }

    /// Invoke `f` once per result row and return how many rows were visited.
    ///
    /// The [`Row`] handed to `f` borrows the statement cursor; copy values out (for example
    /// with [`Row::values`]) to keep them past the callback.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error from the engine or from `f`.
    pub fn fetch<F>(&self, sql: &str, params: &[Value], f: F) -> Result<usize, DbError>
    where
        F: FnMut(&Row<'_>) -> Result<(), DbError>,
    {
        self.prepare(sql, params)?.fetch(f)
    }
}

#[cfg(test)]
mod tests {
    use crate::{Connection, DbError, Value, params};

    fn cars() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute(
            "CREATE TABLE cars (id INTEGER PRIMARY KEY, name TEXT NOT NULL, price INTEGER);
             INSERT INTO cars (name, price) VALUES ('Audi', 52642);
             INSERT INTO cars (name, price) VALUES ('Mercedes', 57127);
             -- trailing comment
             SELECT 1;",
        )
        .unwrap();
        conn
    }

    #[test]
    fn scripts_run_every_statement() {
        let conn = cars();
        assert_eq!(conn.query::<i64>("SELECT count(*) FROM cars", &[]).unwrap(), Some(2));
    }

    #[test]
    fn script_error_keeps_earlier_statements() {
        let conn = cars();
        let err = conn
            .execute("INSERT INTO cars (name) VALUES ('Skoda'); INSERT INTO nope VALUES (1);")
            .unwrap_err();
        assert!(matches!(err, DbError::SqliteError(_)));
        assert_eq!(conn.query::<i64>("SELECT count(*) FROM cars", &[]).unwrap(), Some(3));
    }

    #[test]
    fn run_reports_changes_and_rowid() {
        let conn = cars();
        let changed = conn
            .run("INSERT INTO cars (name, price) VALUES (?, ?)", &params!["Ford", 20_000])
            .unwrap();
        assert_eq!(changed, 1);
        assert_eq!(conn.last_insert_rowid(), 3);
        assert_eq!(conn.run("SELECT * FROM cars", &[]).unwrap(), 0);
    }

    #[test]
    fn query_on_empty_result_is_none() {
        let conn = cars();
        let name: Option<String> = conn
            .query("SELECT name FROM cars WHERE price > ?", &params![1_000_000])
            .unwrap();
        assert_eq!(name, None);
    }

    #[test]
    fn query_row_and_query_all() {
        let conn = cars();
        let pair = conn
            .query_row("SELECT name, price FROM cars ORDER BY id", &[], |row| {
                Ok((row.get::<String>(0)?, row.get::<i64>("price")?))
            })
            .unwrap();
        assert_eq!(pair, Some(("Audi".to_string(), 52642)));

        let names: Vec<String> = conn.query_all("SELECT name FROM cars ORDER BY id", &[]).unwrap();
        assert_eq!(names, vec!["Audi", "Mercedes"]);

        let rows: Vec<(i64, String)> =
            conn.query_rows("SELECT id, name FROM cars ORDER BY id", &[]).unwrap();
        assert_eq!(rows[1], (2, "Mercedes".to_string()));
    }

    #[test]
    fn fetch_counts_rows_and_stops_on_callback_error() {
        let conn = cars();
        let mut seen = Vec::new();
        let n = conn
            .fetch("SELECT price FROM cars ORDER BY id", &[], |row| {
                seen.push(row.value(0)?);
                Ok(())
            })
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(seen, vec![Value::Integer(52642), Value::Integer(57127)]);

        let err = conn
            .fetch("SELECT price FROM cars", &[], |_| {
                Err(DbError::ExtractionError("stop".into()))
            })
            .unwrap_err();
        assert!(matches!(err, DbError::ExtractionError(_)));
    }
}
