use std::path::PathBuf;
use std::time::Duration;

use rusqlite::ErrorCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    SqliteError(#[from] rusqlite::Error),

    #[error("Parameter binding error: {0}")]
    BindingError(String),

    #[error("Column extraction error: {0}")]
    ExtractionError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Resource error: {}: {source}", path.display())]
    ResourceError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Timed out after {0:?} waiting for a connection")]
    AcquireTimeout(Duration),

    #[error("SQLite transaction already in progress on this connection")]
    NestedTransaction,

    #[error("Statement was already stepped; call reset() or bind() before running it again")]
    StatementNotReset,

    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl DbError {
    /// The primary SQLite result code, when the error came from the engine.
    #[must_use]
    pub fn sqlite_code(&self) -> Option<ErrorCode> {
        match self {
            DbError::SqliteError(err) => err.sqlite_error_code(),
            _ => None,
        }
    }

    /// True for `SQLITE_BUSY` and `SQLITE_LOCKED` (including the shared-cache variants).
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(
            self.sqlite_code(),
            Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }

    pub(crate) fn extraction(msg: impl Into<String>) -> Self {
        DbError::ExtractionError(msg.into())
    }

    pub(crate) fn binding(msg: impl Into<String>) -> Self {
        DbError::BindingError(msg.into())
    }
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::BindingError(format!("JSON encoding failed: {err}"))
    }
}
