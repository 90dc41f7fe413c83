use std::sync::Arc;

use crate::config::{DatabaseOptions, TransactionKind};
use crate::connection::Connection;
use crate::db::Database;
use crate::error::DbError;
use crate::pool::PoolStats;

async fn run_blocking<R, E, F>(func: F) -> Result<R, E>
where
    F: FnOnce() -> Result<R, E> + Send + 'static,
    R: Send + 'static,
    E: From<DbError> + Send + 'static,
{
    tokio::task::spawn_blocking(func).await.map_err(|e| {
        E::from(DbError::ConnectionError(format!(
            "sqlite spawn_blocking join error: {e}"
        )))
    })?
}

/// [`Database`] for async callers: each unit of work runs on tokio's blocking pool.
#[derive(Debug, Clone)]
pub struct AsyncDatabase {
    inner: Arc<Database>,
}

impl AsyncDatabase {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self {
            inner: Arc::new(db),
        }
    }

    /// Open a [`Database`] without blocking the async runtime.
    ///
    /// # Errors
    ///
    /// As [`Database::open`].
    pub async fn open(options: DatabaseOptions) -> Result<Self, DbError> {
        let db = run_blocking(move || Database::open(options)).await?;
        Ok(Self::new(db))
    }

    /// The shared blocking handle.
    #[must_use]
    pub fn database(&self) -> &Arc<Database> {
        &self.inner
    }

    /// # Errors
    ///
    /// As [`Database::execute_write`], plus `DbError::ConnectionError` if the blocking task
    /// panics or is cancelled.
    pub async fn execute_write<R, E, F>(&self, kind: TransactionKind, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        let db = Arc::clone(&self.inner);
        run_blocking(move || db.execute_write(kind, f)).await
    }

    /// # Errors
    ///
    /// As [`Database::execute_read`], plus `DbError::ConnectionError` if the blocking task
    /// panics or is cancelled.
    pub async fn execute_read<R, E, F>(&self, kind: TransactionKind, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E> + Send + 'static,
        R: Send + 'static,
        E: From<DbError> + Send + 'static,
    {
        let db = Arc::clone(&self.inner);
        run_blocking(move || db.execute_read(kind, f)).await
    }

    /// # Errors
    ///
    /// As [`Database::execute_script`].
    pub async fn execute_script(&self, sql: impl Into<String>) -> Result<(), DbError> {
        let db = Arc::clone(&self.inner);
        let sql = sql.into();
        run_blocking(move || db.execute_script(&sql)).await
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool_stats()
    }
}
