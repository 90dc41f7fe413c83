use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::TransactionKind;
use crate::connection::Connection;
use crate::error::DbError;

#[derive(Default)]
struct Turnstile {
    next_ticket: u64,
    waiting: VecDeque<u64>,
    active: bool,
    /// Thread holding the turn, so re-entry fails instead of waiting on itself.
    owner: Option<ThreadId>,
}

/// Serializes every unit of work against one [`Connection`], first come first served.
pub struct ConnectionQueue {
    conn: Mutex<Connection>,
    turnstile: Mutex<Turnstile>,
    turn: Condvar,
    acquire_timeout: Option<Duration>,
}

/// Releases the turn on every exit path, including unwinding.
struct Turn<'q> {
    queue: &'q ConnectionQueue,
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        let mut turnstile = self.queue.lock_turnstile();
        turnstile.active = false;
        turnstile.owner = None;
        drop(turnstile);
        self.queue.turn.notify_all();
    }
}

impl ConnectionQueue {
    #[must_use]
    pub fn new(conn: Connection, acquire_timeout: Option<Duration>) -> Self {
        Self {
            conn: Mutex::new(conn),
            turnstile: Mutex::new(Turnstile::default()),
            turn: Condvar::new(),
            acquire_timeout,
        }
    }

    fn lock_turnstile(&self) -> MutexGuard<'_, Turnstile> {
        self.turnstile.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of callers currently waiting for their turn.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.lock_turnstile().waiting.len()
    }

    fn wait_for_turn(&self) -> Result<Turn<'_>, DbError> {
        let deadline = self.acquire_timeout.map(|t| Instant::now() + t);
        let mut turnstile = self.lock_turnstile();
        let me = thread::current().id();
        if turnstile.active && turnstile.owner == Some(me) {
            return Err(DbError::NestedTransaction);
        }
        let ticket = turnstile.next_ticket;
        turnstile.next_ticket += 1;
        turnstile.waiting.push_back(ticket);

        loop {
            if !turnstile.active && turnstile.waiting.front() == Some(&ticket) {
                turnstile.waiting.pop_front();
                turnstile.active = true;
                turnstile.owner = Some(me);
                return Ok(Turn { queue: self });
            }
            turnstile = match deadline {
                None => self
                    .turn
                    .wait(turnstile)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        turnstile.waiting.retain(|t| *t != ticket);
                        drop(turnstile);
                        self.turn.notify_all();
                        return Err(DbError::AcquireTimeout(
                            self.acquire_timeout.unwrap_or_default(),
                        ));
                    }
                    self.turn
                        .wait_timeout(turnstile, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    /// Run `f` with exclusive use of the connection. Its result is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NestedTransaction` when called from inside another unit on the same
    /// thread, `DbError::AcquireTimeout` if the configured wait bound elapses first, otherwise
    /// whatever `f` returns.
    pub fn execute<R, E, F>(&self, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E>,
        E: From<DbError>,
    {
        let _turn = self.wait_for_turn()?;
        let conn = match self.conn.lock() {
            Ok(conn) => conn,
            Err(poisoned) => {
                warn!("writer connection lock poisoned by a panicking caller; recovering");
                self.conn.clear_poison();
                poisoned.into_inner()
            }
        };
        f(&conn)
    }

    /// [`ConnectionQueue::execute`] wrapped in a transaction of the given kind.
    ///
    /// # Errors
    ///
    /// As [`ConnectionQueue::execute`] and [`Connection::transaction`].
    pub fn execute_in_transaction<R, E, F>(&self, kind: TransactionKind, f: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E>,
        E: From<DbError>,
    {
        self.execute(|conn| conn.transaction(kind, f))
    }

    /// Take the connection back, closing the queue.
    #[must_use]
    pub fn into_inner(self) -> Connection {
        self.conn.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ConnectionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionQueue")
            .field("waiting", &self.waiting())
            .field("acquire_timeout", &self.acquire_timeout)
            .finish_non_exhaustive()
    }
}
