use std::collections::BTreeMap;

use super::Connection;
use super::attach::quote_identifier;
use crate::error::DbError;
use crate::types::Value;

/// Whether [`Connection::update`] rewrites rows whose values already match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UpdateMode {
    /// Write every matching row.
    Always,
    /// Skip rows whose columns already hold the new values, so no-op updates fire no triggers
    /// and report no changes. Comparison is null-safe (`IS`).
    #[default]
    IfChanged,
}

/// Column/value pairs for the DML helpers, in column-name order.
pub type Record = BTreeMap<String, Value>;

fn where_clause(filter: &Record, params: &mut Vec<Value>) -> String {
    let terms: Vec<String> = filter
        .iter()
        .map(|(column, value)| {
            params.push(value.clone());
            format!("{} IS ?", quote_identifier(column))
        })
        .collect();
    terms.join(" AND ")
}

impl Connection {
    /// `INSERT` one row and return its rowid. An empty record inserts `DEFAULT VALUES`.
    ///
    /// # Errors
    ///
    /// Returns the engine error for unknown tables/columns or constraint violations.
    pub fn insert(&self, table: &str, values: &Record) -> Result<i64, DbError> {
        let table = quote_identifier(table);
        if values.is_empty() {
            self.run(&format!("INSERT INTO {table} DEFAULT VALUES"), &[])?;
        } else {
            let columns: Vec<String> = values.keys().map(|c| quote_identifier(c)).collect();
            let placeholders = vec!["?"; values.len()].join(", ");
            let params: Vec<Value> = values.values().cloned().collect();
            self.run(
                &format!(
                    "INSERT INTO {table} ({}) VALUES ({placeholders})",
                    columns.join(", ")
                ),
                &params,
            )?;
        }
        Ok(self.last_insert_rowid())
    }

    /// `UPDATE` rows equal to `filter` (all rows when `filter` is empty) and return how many
    /// rows changed.
    ///
    /// # Errors
    ///
    /// Returns the engine error for unknown tables/columns or constraint violations.
    pub fn update(
        &self,
        table: &str,
        values: &Record,
        filter: &Record,
        mode: UpdateMode,
    ) -> Result<usize, DbError> {
        if values.is_empty() {
            return Ok(0);
        }
        let mut params: Vec<Value> = values.values().cloned().collect();
        let assignments: Vec<String> = values
            .keys()
            .map(|c| format!("{} = ?", quote_identifier(c)))
            .collect();

        let mut conditions = Vec::new();
        if !filter.is_empty() {
            conditions.push(where_clause(filter, &mut params));
        }
        if mode == UpdateMode::IfChanged {
            conditions.push(format!("NOT ({})", where_clause(values, &mut params)));
        }

        let mut sql = format!(
            "UPDATE {} SET {}",
            quote_identifier(table),
            assignments.join(", ")
        );
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        self.run(&sql, &params)
    }

    /// `DELETE` rows equal to `filter`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ConfigError` for an empty filter; use [`Connection::delete_all`] to
    /// clear a table.
    pub fn delete(&self, table: &str, filter: &Record) -> Result<usize, DbError> {
        if filter.is_empty() {
            return Err(DbError::ConfigError(
                "delete requires a filter; use delete_all to clear a table".into(),
            ));
        }
        let mut params = Vec::with_capacity(filter.len());
        let sql = format!(
            "DELETE FROM {} WHERE {}",
            quote_identifier(table),
            where_clause(filter, &mut params)
        );
        self.run(&sql, &params)
    }

    /// `DELETE` every row of `table`.
    ///
    /// # Errors
    ///
    /// Returns the engine error if the table does not exist.
    pub fn delete_all(&self, table: &str) -> Result<usize, DbError> {
        self.run(&format!("DELETE FROM {}", quote_identifier(table)), &[])
    }

    /// Count rows equal to `filter` (all rows when it is empty).
    ///
    /// # Errors
    ///
    /// Returns the engine error if the table does not exist.
    pub fn count(&self, table: &str, filter: &Record) -> Result<i64, DbError> {
        let mut params = Vec::new();
        let mut sql = format!("SELECT count(*) FROM {}", quote_identifier(table));
        if !filter.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_clause(filter, &mut params));
        }
        Ok(self.query(&sql, &params)?.unwrap_or(0))
    }
}
