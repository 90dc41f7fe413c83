use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::TransactionKind;
use crate::connection::{Connection, rollback_with_busy_retries};
use crate::error::DbError;

/// Opens a new reader connection, already prepared for use.
pub type ConnectionFactory = Box<dyn Fn() -> Result<Connection, DbError> + Send + Sync>;

/// Shortest pause between drain passes.
const MIN_DRAIN_TICK: Duration = Duration::from_millis(10);

/// Sizing and timing for a [`ConnectionPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub max_connections: usize,
    /// Idle connections older than this are closed. `Duration::ZERO` keeps them forever.
    pub drain_delay: Duration,
    pub acquire_timeout: Option<Duration>,
}

/// Point-in-time counters for a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub in_use: usize,
    pub max_connections: usize,
    pub generation: u64,
    /// Connections opened over the pool's lifetime.
    pub created: u64,
}

struct IdleConnection {
    conn: Connection,
    since: Instant,
    generation: u64,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IdleConnection>,
    /// Handed-out connections plus slots reserved for connections being opened.
    in_use: usize,
    generation: u64,
    created: u64,
    closed: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    released: Condvar,
    shutdown: Condvar,
    factory: ConnectionFactory,
    config: PoolConfig,
}

impl PoolShared {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            warn!("reader pool lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn drain_where(&self, expired: impl Fn(&IdleConnection) -> bool) -> usize {
        let closing: Vec<IdleConnection> = {
            let mut state = self.lock();
            let (closing, keep) = std::mem::take(&mut state.idle)
                .into_iter()
                .partition(|idle| expired(idle));
            state.idle = keep;
            closing
        };
        let n = closing.len();
        for idle in closing {
            close_quietly(idle.conn);
        }
        if n > 0 {
            self.released.notify_all();
        }
        n
    }

    fn release(&self, conn: Connection, generation: u64) {
        let mut reusable = true;
        if conn.is_in_transaction()
            && let Err(err) = rollback_with_busy_retries(conn.raw())
        {
            warn!(error = %err, "reader returned mid-transaction and rollback failed; evicting");
            reusable = false;
        }

        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        let evict = !reusable || state.closed || generation != state.generation;
        if !evict {
            state.idle.push(IdleConnection {
                conn,
                since: Instant::now(),
                generation,
            });
            drop(state);
            self.released.notify_one();
            return;
        }
        drop(state);
        self.released.notify_one();
        close_quietly(conn);
    }
}

fn close_quietly(conn: Connection) {
    if let Err(err) = conn.close() {
        warn!(error = %err, "closing reader connection failed");
    }
}

/// An elastic set of reader connections against one storage location.
///
/// Connections are opened lazily up to `max_connections`, reused most-recently-returned first,
/// and closed by a background thread once idle longer than the drain delay.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    drainer: Option<JoinHandle<()>>,
}

impl ConnectionPool {
    /// Build a pool that opens connections with `factory`.
    ///
    /// # Errors
    ///
    /// Returns `DbError::ConfigError` for a zero maximum and `DbError::ConnectionError` if the
    /// drain thread cannot be spawned.
    pub fn new(factory: ConnectionFactory, config: PoolConfig) -> Result<Self, DbError> {
        if config.max_connections == 0 {
            return Err(DbError::ConfigError(
                "pool needs room for at least one connection".into(),
            ));
        }
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            released: Condvar::new(),
            shutdown: Condvar::new(),
            factory,
            config,
        });

        let drainer = if config.drain_delay.is_zero() {
            None
        } else {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name("sqlite-dispatch-drain".into())
                .spawn(move || drain_loop(&shared))
                .map_err(|e| DbError::ConnectionError(format!("failed to spawn drain thread: {e}")))?;
            Some(handle)
        };

        Ok(Self { shared, drainer })
    }

    /// Take a connection, opening one if none is idle and the pool has room, otherwise
    /// waiting for a release.
    ///
    /// # Errors
    ///
    /// Returns `DbError::AcquireTimeout` when the configured bound elapses, the factory's error
    /// if opening fails, or `DbError::ConnectionError` once the pool is shut down.
    pub fn acquire(&self) -> Result<PooledConnection, DbError> {
        let config = self.shared.config;
        let deadline = config.acquire_timeout.map(|t| Instant::now() + t);
        let mut state = self.shared.lock();
        loop {
            if state.closed {
                return Err(DbError::ConnectionError("reader pool is shut down".into()));
            }
            if let Some(idle) = state.idle.pop() {
                state.in_use += 1;
                return Ok(PooledConnection {
                    conn: Some(idle.conn),
                    generation: idle.generation,
                    pool: Arc::clone(&self.shared),
                });
            }
            if state.idle.len() + state.in_use < config.max_connections {
                state.in_use += 1;
                let generation = state.generation;
                drop(state);
                return self.open_reserved(generation);
            }

            state = match deadline {
                None => self
                    .shared
                    .released
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(DbError::AcquireTimeout(
                            config.acquire_timeout.unwrap_or_default(),
                        ));
                    }
                    self.shared
                        .released
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn open_reserved(&self, generation: u64) -> Result<PooledConnection, DbError> {
        match (self.shared.factory)() {
            Ok(conn) => {
                let mut state = self.shared.lock();
                state.created += 1;
                debug!(
                    in_use = state.in_use,
                    available = state.idle.len(),
                    "opened reader connection"
                );
                Ok(PooledConnection {
                    conn: Some(conn),
                    generation,
                    pool: Arc::clone(&self.shared),
                })
            }
            Err(err) => {
                let mut state = self.shared.lock();
                state.in_use -= 1;
                drop(state);
                self.shared.released.notify_one();
                Err(err)
            }
        }
    }

    /// Run `f` on a pooled connection and return the connection afterwards.
    ///
    /// # Errors
    ///
    /// As [`ConnectionPool::acquire`], plus whatever `f` returns.
    pub fn execute<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E>,
        E: From<DbError>,
    {
        let conn = self.acquire()?;
        f(&conn)
    }

    /// [`ConnectionPool::execute`] wrapped in a transaction of the given kind.
    ///
    /// # Errors
    ///
    /// As [`ConnectionPool::execute`] and [`Connection::transaction`].
    pub fn execute_in_transaction<R, E, F>(&self, kind: TransactionKind, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E>,
        E: From<DbError>,
    {
        let conn = self.acquire()?;
        conn.transaction(kind, f)
    }

    /// Close idle connections older than the drain delay. Returns how many were closed.
    pub fn drain_idle(&self) -> usize {
        let delay = self.shared.config.drain_delay;
        if delay.is_zero() {
            return 0;
        }
        self.shared.drain_where(|idle| idle.since.elapsed() >= delay)
    }

    /// Close every idle connection. Returns how many were closed.
    pub fn drain_all(&self) -> usize {
        self.shared.drain_where(|_| true)
    }

    /// Close idle connections and make sure connections handed out before this call are
    /// closed rather than reused when returned.
    pub fn invalidate(&self) {
        let generation = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.generation
        };
        let closed = self
            .shared
            .drain_where(|idle| idle.generation != generation);
        debug!(generation, closed, "reader pool invalidated");
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.lock();
        PoolStats {
            available: state.idle.len(),
            in_use: state.in_use,
            max_connections: self.shared.config.max_connections,
            generation: state.generation,
            created: state.created,
        }
    }

    #[must_use]
    pub fn config(&self) -> PoolConfig {
        self.shared.config
    }
}

fn drain_loop(shared: &PoolShared) {
    let delay = shared.config.drain_delay;
    let tick = (delay / 2).max(MIN_DRAIN_TICK);
    loop {
        {
            let state = shared.lock();
            if state.closed {
                return;
            }
            let (state, _) = shared
                .shutdown
                .wait_timeout(state, tick)
                .unwrap_or_else(PoisonError::into_inner);
            if state.closed {
                return;
            }
        }
        let closed = shared.drain_where(|idle| idle.since.elapsed() >= delay);
        if closed > 0 {
            debug!(closed, "drained idle reader connections");
        }
    }
}

impl Drop for ConnectionPool {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.shutdown.notify_all();
        self.shared.released.notify_all();
        if let Some(handle) = self.drainer.take()
            && handle.join().is_err()
        {
            warn!("reader pool drain thread panicked");
        }
        self.shared.drain_where(|_| true);
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.shared.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

/// A connection checked out of a [`ConnectionPool`]; returned to it on drop.
pub struct PooledConnection {
    conn: Option<Connection>,
    generation: u64,
    pool: Arc<PoolShared>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only `Drop` takes the connection out.
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("pooled connection used after release"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn, self.generation);
        }
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("conn", &self.conn)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}
