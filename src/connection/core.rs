use std::fmt;
use std::thread;

use rusqlite::OpenFlags;
use tracing::{debug, trace, warn};

use crate::config::TableLockPolicy;
use crate::error::DbError;
use crate::storage::StorageLocation;

/// How a single [`Connection`] is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub lock_policy: TableLockPolicy,
    /// Readers set `PRAGMA query_only` right after opening.
    pub read_only: bool,
    pub multi_threaded: bool,
    pub shared_cache: bool,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            lock_policy: TableLockPolicy::FastFail,
            read_only: false,
            multi_threaded: true,
            shared_cache: false,
        }
    }
}

impl ConnectionOptions {
    fn open_flags(&self) -> OpenFlags {
        let mut flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI;
        flags |= if self.multi_threaded {
            OpenFlags::SQLITE_OPEN_NO_MUTEX
        } else {
            OpenFlags::SQLITE_OPEN_FULL_MUTEX
        };
        if self.shared_cache {
            flags |= OpenFlags::SQLITE_OPEN_SHARED_CACHE;
        }
        flags
    }
}

/// One native `SQLite` handle plus the policy it was opened with.
///
/// A `Connection` is `Send` but not `Sync`: share it across threads through a
/// [`ConnectionQueue`](crate::queue::ConnectionQueue) or a
/// [`ConnectionPool`](crate::pool::ConnectionPool).
pub struct Connection {
    pub(crate) conn: rusqlite::Connection,
    location: StorageLocation,
    lock_policy: TableLockPolicy,
    read_only: bool,
    multi_threaded: bool,
}

impl Connection {
    /// Open a connection to `location`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::SqliteError` if the engine cannot open the database or apply the
    /// connection pragmas.
    pub fn open(location: &StorageLocation, opts: ConnectionOptions) -> Result<Self, DbError> {
        let conn = rusqlite::Connection::open_with_flags(location.path(), opts.open_flags())?;
        conn.busy_timeout(opts.lock_policy.engine_busy_timeout())?;
        if opts.read_only {
            conn.execute_batch("PRAGMA query_only = ON;")?;
        }
        debug!(
            location = %location,
            read_only = opts.read_only,
            multi_threaded = opts.multi_threaded,
            "sqlite connection opened"
        );
        Ok(Self {
            conn,
            location: location.clone(),
            lock_policy: opts.lock_policy,
            read_only: opts.read_only,
            multi_threaded: opts.multi_threaded,
        })
    }

    /// Open a private in-memory connection with default options.
    ///
    /// # Errors
    ///
    /// Returns `DbError::SqliteError` if the engine cannot allocate the database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::open(&StorageLocation::InMemory, ConnectionOptions::default())
    }

    #[must_use]
    pub fn location(&self) -> &StorageLocation {
        &self.location
    }

    #[must_use]
    pub fn lock_policy(&self) -> TableLockPolicy {
        self.lock_policy
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[must_use]
    pub fn is_multi_threaded(&self) -> bool {
        self.multi_threaded
    }

    /// Swap the contention policy, updating the engine busy timeout to match.
    ///
    /// # Errors
    ///
    /// Returns `DbError::SqliteError` if the busy timeout cannot be set.
    pub fn set_lock_policy(&mut self, policy: TableLockPolicy) -> Result<(), DbError> {
        self.conn.busy_timeout(policy.engine_busy_timeout())?;
        self.lock_policy = policy;
        Ok(())
    }

    /// True while a `BEGIN` is open on this handle.
    #[must_use]
    pub fn is_in_transaction(&self) -> bool {
        !self.conn.is_autocommit()
    }

    #[must_use]
    pub fn last_insert_rowid(&self) -> i64 {
        self.conn.last_insert_rowid()
    }

    /// Borrow the underlying rusqlite handle.
    ///
    /// Statements run through it bypass the lock policy.
    #[must_use]
    pub fn raw(&self) -> &rusqlite::Connection {
        &self.conn
    }

    /// Close the handle, surfacing any error the engine reports.
    ///
    /// # Errors
    ///
    /// Returns `DbError::SqliteError` if the engine refuses to close (the handle is dropped
    /// regardless).
    pub fn close(self) -> Result<(), DbError> {
        let location = self.location;
        self.conn.close().map_err(|(_conn, err)| DbError::from(err))?;
        debug!(location = %location, "sqlite connection closed");
        Ok(())
    }

    /// Run `op` under this connection's lock policy.
    pub(crate) fn with_contention_retry<T>(
        &self,
        what: &str,
        op: impl FnMut() -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        retry_on_contention(self.lock_policy, what, op)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("location", &self.location)
            .field("lock_policy", &self.lock_policy)
            .field("read_only", &self.read_only)
            .field("multi_threaded", &self.multi_threaded)
            .field("in_transaction", &self.is_in_transaction())
            .finish()
    }
}

/// Re-run `op` while it reports `SQLITE_BUSY`/`SQLITE_LOCKED` and `policy` still has retries left.
pub(crate) fn retry_on_contention<T>(
    policy: TableLockPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T, DbError>,
) -> Result<T, DbError> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(err) if err.is_contention() => match policy.backoff(attempt) {
                Some(delay) => {
                    trace!(op = what, attempt, ?delay, "sqlite lock contention; retrying");
                    thread::sleep(delay);
                    attempt += 1;
                }
                None => {
                    if attempt > 0 {
                        warn!(op = what, attempts = attempt, "sqlite lock contention retries exhausted");
                    }
                    return Err(err);
                }
            },
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::time::Duration;

    fn busy() -> DbError {
        DbError::SqliteError(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy,
                extended_code: rusqlite::ffi::SQLITE_BUSY,
            },
            None,
        ))
    }

    #[test]
    fn fast_fail_calls_once() {
        let calls = Cell::new(0);
        let res: Result<(), _> = retry_on_contention(TableLockPolicy::FastFail, "t", || {
            calls.set(calls.get() + 1);
            Err(busy())
        });
        assert!(res.unwrap_err().is_contention());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_stops_after_budget() {
        let policy = TableLockPolicy::Retry {
            max_retries: 3,
            backoff: Duration::from_millis(1),
        };
        let calls = Cell::new(0);
        let res: Result<(), _> = retry_on_contention(policy, "t", || {
            calls.set(calls.get() + 1);
            Err(busy())
        });
        assert!(res.is_err());
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn retry_returns_first_success() {
        let policy = TableLockPolicy::Retry {
            max_retries: 5,
            backoff: Duration::from_millis(1),
        };
        let calls = Cell::new(0);
        let res = retry_on_contention(policy, "t", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 { Err(busy()) } else { Ok(calls.get()) }
        });
        assert_eq!(res.unwrap(), 3);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let policy = TableLockPolicy::Retry {
            max_retries: 5,
            backoff: Duration::from_millis(1),
        };
        let calls = Cell::new(0);
        let res: Result<(), _> = retry_on_contention(policy, "t", || {
            calls.set(calls.get() + 1);
            Err(DbError::BindingError("nope".into()))
        });
        assert!(matches!(res, Err(DbError::BindingError(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn reader_connections_reject_writes() {
        let dir = tempfile::tempdir().unwrap();
        let location = StorageLocation::on_disk(dir.path().join("ro.db"));
        let writer = Connection::open(&location, ConnectionOptions::default()).unwrap();
        writer.execute("CREATE TABLE t (x INTEGER)").unwrap();

        let reader = Connection::open(
            &location,
            ConnectionOptions {
                read_only: true,
                ..ConnectionOptions::default()
            },
        )
        .unwrap();
        assert!(reader.is_read_only());
        assert!(reader.execute("INSERT INTO t VALUES (1)").is_err());
        assert_eq!(reader.query::<i64>("SELECT count(*) FROM t", &[]).unwrap(), Some(0));
    }
}
