use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::connection::Connection;
use crate::db::Database;
use crate::error::DbError;
use crate::storage::StorageLocation;

/// Hook run against a freshly opened connection before anyone else sees it.
pub type Preparation = Arc<dyn Fn(&Connection) -> Result<(), DbError> + Send + Sync>;

/// Longest single sleep between contention retries.
pub const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// What to do when the engine reports `SQLITE_BUSY` / `SQLITE_LOCKED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableLockPolicy {
    /// Surface the error immediately.
    #[default]
    FastFail,
    /// Retry up to `max_retries` times, sleeping `backoff`, `2 * backoff`, ... (capped at
    /// [`MAX_RETRY_BACKOFF`]) between attempts.
    Retry { max_retries: u32, backoff: Duration },
}

impl TableLockPolicy {
    /// Delay before retry number `attempt` (zero based), or `None` once the budget is spent.
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Option<Duration> {
        match *self {
            TableLockPolicy::FastFail => None,
            TableLockPolicy::Retry {
                max_retries,
                backoff,
            } => {
                if attempt >= max_retries {
                    return None;
                }
                let factor = 1u32 << attempt.min(16);
                Some(backoff.saturating_mul(factor).min(MAX_RETRY_BACKOFF))
            }
        }
    }

    /// Busy timeout handed to the engine itself. It covers a single attempt; the retry loop
    /// around contended operations supplies the rest of the budget.
    #[must_use]
    pub fn engine_busy_timeout(&self) -> Duration {
        match *self {
            TableLockPolicy::FastFail => Duration::ZERO,
            TableLockPolicy::Retry { backoff, .. } => backoff.min(MAX_RETRY_BACKOFF),
        }
    }
}

/// Transaction isolation mode passed to `BEGIN`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionKind {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl TransactionKind {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            TransactionKind::Deferred => "BEGIN DEFERRED",
            TransactionKind::Immediate => "BEGIN IMMEDIATE",
            TransactionKind::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

/// Settings shared by every connection a [`Database`] opens.
#[derive(Clone)]
pub struct DatabaseOptions {
    pub location: StorageLocation,
    pub lock_policy: TableLockPolicy,
    /// `true` opens connections with `SQLITE_OPEN_NO_MUTEX`, `false` with `SQLITE_OPEN_FULL_MUTEX`.
    pub multi_threaded: bool,
    pub shared_cache: bool,
    /// Idle readers older than this are closed. `Duration::ZERO` disables draining.
    pub drain_delay: Duration,
    pub max_readers: usize,
    /// Bound on how long a caller waits for the writer or a reader. `None` waits forever.
    pub acquire_timeout: Option<Duration>,
    /// Put file-backed databases in WAL mode when the writer opens.
    pub wal: bool,
    pub writer_preparation: Option<Preparation>,
    pub reader_preparation: Option<Preparation>,
}

impl DatabaseOptions {
    #[must_use]
    pub fn new(location: StorageLocation) -> Self {
        Self {
            location,
            lock_policy: TableLockPolicy::FastFail,
            multi_threaded: true,
            shared_cache: false,
            drain_delay: Duration::from_secs(1),
            max_readers: 4,
            acquire_timeout: None,
            wal: true,
            writer_preparation: None,
            reader_preparation: None,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), DbError> {
        if !self.location.is_shared() {
            return Err(DbError::ConfigError(
                "the private in-memory storage location is not valid when using multiple connections"
                    .into(),
            ));
        }
        if self.max_readers == 0 {
            return Err(DbError::ConfigError(
                "max_readers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for DatabaseOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseOptions")
            .field("location", &self.location)
            .field("lock_policy", &self.lock_policy)
            .field("multi_threaded", &self.multi_threaded)
            .field("shared_cache", &self.shared_cache)
            .field("drain_delay", &self.drain_delay)
            .field("max_readers", &self.max_readers)
            .field("acquire_timeout", &self.acquire_timeout)
            .field("wal", &self.wal)
            .field("writer_preparation", &self.writer_preparation.is_some())
            .field("reader_preparation", &self.reader_preparation.is_some())
            .finish()
    }
}

/// Fluent builder for [`DatabaseOptions`].
#[derive(Debug, Clone)]
pub struct DatabaseOptionsBuilder {
    opts: DatabaseOptions,
}

impl DatabaseOptionsBuilder {
    #[must_use]
    pub fn new(location: StorageLocation) -> Self {
        Self {
            opts: DatabaseOptions::new(location),
        }
    }

    #[must_use]
    pub fn lock_policy(mut self, policy: TableLockPolicy) -> Self {
        self.opts.lock_policy = policy;
        self
    }

    #[must_use]
    pub fn multi_threaded(mut self, multi_threaded: bool) -> Self {
        self.opts.multi_threaded = multi_threaded;
        self
    }

    #[must_use]
    pub fn shared_cache(mut self, shared_cache: bool) -> Self {
        self.opts.shared_cache = shared_cache;
        self
    }

    #[must_use]
    pub fn drain_delay(mut self, delay: Duration) -> Self {
        self.opts.drain_delay = delay;
        self
    }

    #[must_use]
    pub fn max_readers(mut self, max: usize) -> Self {
        self.opts.max_readers = max;
        self
    }

    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.opts.acquire_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn wal(mut self, wal: bool) -> Self {
        self.opts.wal = wal;
        self
    }

    #[must_use]
    pub fn writer_preparation<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) -> Result<(), DbError> + Send + Sync + 'static,
    {
        self.opts.writer_preparation = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn reader_preparation<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Connection) -> Result<(), DbError> + Send + Sync + 'static,
    {
        self.opts.reader_preparation = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn finish(self) -> DatabaseOptions {
        self.opts
    }

    /// Open the [`Database`].
    ///
    /// # Errors
    ///
    /// Returns `DbError` if the options are invalid or the writer cannot be opened.
    pub fn open(self) -> Result<Database, DbError> {
        Database::open(self.finish())
    }
}
