use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use tempfile::TempPath;
use tracing::debug;

use crate::config::{DatabaseOptions, DatabaseOptionsBuilder, TransactionKind};
use crate::connection::{Connection, ConnectionOptions};
use crate::error::DbError;
use crate::pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats};
use crate::queue::ConnectionQueue;
use crate::storage::StorageLocation;

type AttachRegistry = Arc<RwLock<BTreeMap<String, StorageLocation>>>;

/// One writer queue and one reader pool over a single storage location.
///
/// Open one `Database` per location and share it (for example behind an `Arc`); every
/// entry point takes `&self`.
pub struct Database {
    writer: ConnectionQueue,
    readers: ConnectionPool,
    location: StorageLocation,
    attached: AttachRegistry,
    options: DatabaseOptions,
    // Dropped last so every connection is closed before the file is removed.
    _temp_file: Option<TempPath>,
}

impl Database {
    /// Start building options for `location`.
    #[must_use]
    pub fn builder(location: StorageLocation) -> DatabaseOptionsBuilder {
        DatabaseOptionsBuilder::new(location)
    }

    /// Open the writer connection and set up the reader pool.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ConfigError` for a private in-memory location or zero readers,
    /// `DbError::ResourceError` if a temporary file cannot be created, and engine errors from
    /// opening the writer or running its preparation hook.
    pub fn open(options: DatabaseOptions) -> Result<Self, DbError> {
        options.validate()?;

        let (location, temp_file) = match &options.location {
            StorageLocation::Temporary => {
                let file = tempfile::Builder::new()
                    .prefix("sqlite-dispatch-")
                    .suffix(".db")
                    .tempfile()
                    .map_err(|source| DbError::ResourceError {
                        path: std::env::temp_dir(),
                        source,
                    })?;
                let path = file.into_temp_path();
                (StorageLocation::on_disk(&path), Some(path))
            }
            other => (other.clone(), None),
        };

        let base = ConnectionOptions {
            lock_policy: options.lock_policy,
            read_only: false,
            multi_threaded: options.multi_threaded,
            shared_cache: options.shared_cache,
        };

        let writer = Connection::open(&location, base)?;
        if options.wal && location.is_file_backed() {
            writer.execute("PRAGMA journal_mode = WAL;")?;
        }
        if let Some(prepare) = &options.writer_preparation {
            prepare(&writer)?;
        }

        let attached: AttachRegistry = Arc::new(RwLock::new(BTreeMap::new()));
        let factory: ConnectionFactory = {
            let location = location.clone();
            let attached = Arc::clone(&attached);
            let prepare = options.reader_preparation.clone();
            let reader = ConnectionOptions {
                read_only: true,
                ..base
            };
            Box::new(move || {
                let conn = Connection::open(&location, reader)?;
                let schemas = attached
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clone();
                for (name, schema_location) in &schemas {
                    conn.attach_database(schema_location, name)?;
                }
                if let Some(prepare) = &prepare {
                    prepare(&conn)?;
                }
                Ok(conn)
            })
        };
        let readers = ConnectionPool::new(
            factory,
            PoolConfig {
                max_connections: options.max_readers,
                drain_delay: options.drain_delay,
                acquire_timeout: options.acquire_timeout,
            },
        )?;

        debug!(location = %options.location, max_readers = options.max_readers, "database opened");
        Ok(Self {
            writer: ConnectionQueue::new(writer, options.acquire_timeout),
            readers,
            location: options.location.clone(),
            attached,
            options,
            _temp_file: temp_file,
        })
    }

    /// Run `f` on the writer inside a transaction of the given kind, after every earlier
    /// write has finished.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AcquireTimeout` if the writer stays busy past the configured bound,
    /// `DbError::NestedTransaction` if called from inside another write on the same thread,
    /// transaction errors, or the error from `f` (after rolling back).
    pub fn execute_write<R, E, F>(&self, kind: TransactionKind, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E>,
        E: From<DbError>,
    {
        self.writer.execute_in_transaction(kind, f)
    }

    /// Run `f` on a pooled reader inside a transaction of the given kind.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AcquireTimeout` if no reader frees up in time, transaction errors,
    /// or the error from `f`.
    pub fn execute_read<R, E, F>(&self, kind: TransactionKind, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E>,
        E: From<DbError>,
    {
        self.readers.execute_in_transaction(kind, f)
    }

    /// [`Database::execute_write`] with a deferred transaction.
    ///
    /// # Errors
    ///
    /// As [`Database::execute_write`].
    pub fn write<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E>,
        E: From<DbError>,
    {
        self.execute_write(TransactionKind::Deferred, f)
    }

    /// [`Database::execute_read`] with a deferred transaction.
    ///
    /// # Errors
    ///
    /// As [`Database::execute_read`].
    pub fn read<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E>,
        E: From<DbError>,
    {
        self.execute_read(TransactionKind::Deferred, f)
    }

    /// Run a script on the writer outside of any wrapping transaction, so it may manage its
    /// own `BEGIN`/`COMMIT`.
    ///
    /// # Errors
    ///
    /// Returns the first engine error; earlier statements stay applied.
    pub fn execute_script(&self, sql: &str) -> Result<(), DbError> {
        self.writer.execute(|conn| conn.execute(sql))
    }

    /// Load `path` and run it with [`Database::execute_script`].
    ///
    /// # Errors
    ///
    /// Returns `DbError::ResourceError` if the file cannot be read.
    pub fn execute_file(&self, path: impl AsRef<Path>) -> Result<(), DbError> {
        let path = path.as_ref();
        let sql = std::fs::read_to_string(path).map_err(|source| DbError::ResourceError {
            path: path.to_path_buf(),
            source,
        })?;
        self.execute_script(&sql)
    }

    /// Attach `location` as schema `name` on the writer and on every reader opened from now
    /// on. Readers already open are retired.
    ///
    /// # Errors
    ///
    /// As [`Connection::attach_database`].
    pub fn attach_database(&self, location: &StorageLocation, name: &str) -> Result<(), DbError> {
        self.writer
            .execute(|conn| conn.attach_database(location, name))?;
        self.attached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), location.clone());
        self.readers.invalidate();
        Ok(())
    }

    /// Detach schema `name` from the writer and stop attaching it to new readers.
    ///
    /// # Errors
    ///
    /// As [`Connection::detach_database`].
    pub fn detach_database(&self, name: &str) -> Result<(), DbError> {
        self.writer.execute(|conn| conn.detach_database(name))?;
        self.attached
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        self.readers.invalidate();
        Ok(())
    }

    /// Schemas currently attached, by name.
    #[must_use]
    pub fn attached_databases(&self) -> BTreeMap<String, StorageLocation> {
        self.attached
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.readers.stats()
    }

    /// Close every idle reader now. Returns how many were closed.
    pub fn drain_readers(&self) -> usize {
        self.readers.drain_all()
    }

    /// Callers waiting for the writer.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.writer.waiting()
    }

    /// The location this database was opened with.
    #[must_use]
    pub fn storage_location(&self) -> &StorageLocation {
        &self.location
    }

    #[must_use]
    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("location", &self.location)
            .field("readers", &self.readers)
            .field("attached", &self.attached_databases())
            .finish_non_exhaustive()
    }
}
