use tracing::debug;

use super::Connection;
use crate::error::DbError;
use crate::storage::StorageLocation;
use crate::types::Value;

/// Quote `name` as an SQL identifier.
pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn check_schema_name(name: &str) -> Result<(), DbError> {
    if name.is_empty() {
        return Err(DbError::ConfigError("schema name must not be empty".into()));
    }
    if name.eq_ignore_ascii_case("main") || name.eq_ignore_ascii_case("temp") {
        return Err(DbError::ConfigError(format!(
            "schema name '{name}' is reserved"
        )));
    }
    Ok(())
}

impl Connection {
    /// `ATTACH` another database under the schema `name`.
    ///
    /// Only locations that another connection could open again (on-disk files and named
    /// shared-memory databases) may be attached.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ConfigError` for private or temporary locations and reserved schema
    /// names, and `DbError::SqliteError` if the engine rejects the attach (for example inside
    /// a transaction).
    pub fn attach_database(&self, location: &StorageLocation, name: &str) -> Result<(), DbError> {
        check_schema_name(name)?;
        if !matches!(
            location,
            StorageLocation::OnDisk(_) | StorageLocation::SharedMemory(_)
        ) {
            return Err(DbError::ConfigError(format!(
                "cannot attach {location}: only on-disk and shared-memory databases can be attached"
            )));
        }
        let sql = format!("ATTACH DATABASE ? AS {}", quote_identifier(name));
        self.run(&sql, &[Value::Text(location.path())])?;
        debug!(schema = name, location = %location, "attached database");
        Ok(())
    }

    /// `DETACH` the schema `name`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::SqliteError` if nothing is attached under `name`.
    pub fn detach_database(&self, name: &str) -> Result<(), DbError> {
        check_schema_name(name)?;
        self.run(&format!("DETACH DATABASE {}", quote_identifier(name)), &[])?;
        debug!(schema = name, "detached database");
        Ok(())
    }
}
