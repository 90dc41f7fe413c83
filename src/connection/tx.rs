use std::thread;
use std::time::Duration;

use tracing::warn;

use super::Connection;
use crate::config::TransactionKind;
use crate::error::DbError;

const ROLLBACK_BUSY_RETRIES: &[Duration] = &[
    Duration::from_millis(10),
    Duration::from_millis(25),
    Duration::from_millis(50),
];

/// Issue `ROLLBACK`, retrying briefly while the engine reports busy.
pub(crate) fn rollback_with_busy_retries(conn: &rusqlite::Connection) -> Result<(), DbError> {
    retry_busy_rollback(ROLLBACK_BUSY_RETRIES, || Ok(conn.execute_batch("ROLLBACK")?))
}

fn retry_busy_rollback(
    delays: &[Duration],
    mut rollback: impl FnMut() -> Result<(), DbError>,
) -> Result<(), DbError> {
    let mut last = None;
    for (idx, delay) in delays.iter().copied().enumerate() {
        match rollback() {
            Ok(()) => return Ok(()),
            Err(err) if err.is_contention() => {
                last = Some(err);
                if idx + 1 < delays.len() {
                    thread::sleep(delay);
                }
            }
            Err(err) => return Err(err),
        }
    }
    Err(last.unwrap_or_else(|| DbError::ConnectionError("rollback retries exhausted".into())))
}

/// Rolls the open transaction back unless disarmed; covers early returns and panics.
struct RollbackGuard<'c> {
    conn: &'c Connection,
    armed: bool,
}

impl RollbackGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RollbackGuard<'_> {
    fn drop(&mut self) {
        if !self.armed || !self.conn.is_in_transaction() {
            return;
        }
        if let Err(err) = rollback_with_busy_retries(&self.conn.conn) {
            warn!(location = %self.conn.location(), error = %err, "sqlite rollback failed");
        }
    }
}

impl Connection {
    /// Run `body` inside a `BEGIN <kind>` / `COMMIT` pair.
    ///
    /// Any error returned by `body` (or a panic unwinding out of it) rolls the transaction back
    /// and is handed back unchanged. `body` may end the transaction itself with `COMMIT` or
    /// `ROLLBACK`; nothing further is issued in that case.
    ///
    /// # Errors
    ///
    /// Returns `DbError::NestedTransaction` if a transaction is already open on this
    /// connection, the engine error if `BEGIN` or `COMMIT` fails, or the error from `body`.
    pub fn transaction<R, E, F>(&self, kind: TransactionKind, body: F) -> Result<R, E>
    where
        F: FnOnce(&Connection) -> Result<R, E>,
        E: From<DbError>,
    {
        if self.is_in_transaction() {
            return Err(DbError::NestedTransaction.into());
        }
        self.with_contention_retry("begin", || Ok(self.conn.execute_batch(kind.begin_sql())?))?;
        let guard = RollbackGuard {
            conn: self,
            armed: true,
        };

        let value = body(self)?;
        if self.is_in_transaction() {
            self.with_contention_retry("commit", || Ok(self.conn.execute_batch("COMMIT")?))?;
        }
        guard.disarm();
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::time::{Duration, Instant};

    use crate::{Connection, DbError, TransactionKind, params};

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute("CREATE TABLE t (x INTEGER UNIQUE)").unwrap();
        conn
    }

    fn count(conn: &Connection) -> i64 {
        conn.query("SELECT count(*) FROM t", &[]).unwrap().unwrap()
    }

    fn busy() -> DbError {
        DbError::from(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code: rusqlite::ErrorCode::DatabaseBusy,
                extended_code: rusqlite::ffi::SQLITE_BUSY,
            },
            None,
        ))
    }

    #[test]
    fn busy_rollback_gives_up_without_a_final_sleep() {
        let delays = [Duration::from_millis(5), Duration::from_millis(5), Duration::from_secs(2)];
        let mut calls = 0;
        let started = Instant::now();
        let res = super::retry_busy_rollback(&delays, || {
            calls += 1;
            Err(busy())
        });
        assert!(res.as_ref().is_err_and(DbError::is_contention));
        assert_eq!(calls, 3);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn non_busy_rollback_errors_are_not_retried() {
        let mut calls = 0;
        let res = super::retry_busy_rollback(super::ROLLBACK_BUSY_RETRIES, || {
            calls += 1;
            Err(DbError::ConnectionError("gone".into()))
        });
        assert!(matches!(res, Err(DbError::ConnectionError(_))));
        assert_eq!(calls, 1);
    }

    #[test]
    fn commit_on_success() {
        let conn = conn();
        let id = conn
            .transaction(TransactionKind::Immediate, |c| {
                c.run("INSERT INTO t VALUES (?)", &params![1])?;
                Ok::<_, DbError>(c.last_insert_rowid())
            })
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(count(&conn), 1);
        assert!(!conn.is_in_transaction());
    }

    #[test]
    fn rollback_on_error_after_partial_write() {
        let conn = conn();
        let err = conn
            .transaction(TransactionKind::Deferred, |c| {
                c.run("INSERT INTO t VALUES (?)", &params![1])?;
                c.run("INSERT INTO t VALUES (?)", &params![1])?;
                Ok::<_, DbError>(())
            })
            .unwrap_err();
        assert!(matches!(err, DbError::SqliteError(_)));
        assert_eq!(count(&conn), 0);
        assert!(!conn.is_in_transaction());
    }

    #[test]
    fn nested_transaction_is_rejected() {
        let conn = conn();
        let res = conn.transaction(TransactionKind::Deferred, |c| {
            c.transaction(TransactionKind::Deferred, |_| Ok::<_, DbError>(()))
        });
        assert!(matches!(res, Err(DbError::NestedTransaction)));
    }

    #[test]
    fn panic_in_body_rolls_back() {
        let conn = conn();
        let res = catch_unwind(AssertUnwindSafe(|| {
            let _ = conn.transaction(TransactionKind::Deferred, |c| {
                c.run("INSERT INTO t VALUES (1)", &[])?;
                if count(c) == 1 {
                    panic!("boom");
                }
                Ok::<_, DbError>(())
            });
        }));
        assert!(res.is_err());
        assert_eq!(count(&conn), 0);
        assert!(!conn.is_in_transaction());
    }

    #[test]
    fn body_may_finish_the_transaction_itself() {
        let conn = conn();
        conn.transaction(TransactionKind::Deferred, |c| {
            c.run("INSERT INTO t VALUES (1)", &[])?;
            c.execute("COMMIT")
        })
        .unwrap();
        assert_eq!(count(&conn), 1);
    }

    #[derive(Debug)]
    enum AppError {
        Db(DbError),
        Invalid,
    }

    impl From<DbError> for AppError {
        fn from(err: DbError) -> Self {
            AppError::Db(err)
        }
    }

    #[test]
    fn caller_errors_pass_through_unchanged() {
        let conn = conn();
        let res: Result<(), AppError> = conn.transaction(TransactionKind::Deferred, |c| {
            c.run("INSERT INTO t VALUES (1)", &[])?;
            Err(AppError::Invalid)
        });
        assert!(matches!(res, Err(AppError::Invalid)));
        assert_eq!(count(&conn), 0);

        let res: Result<(), AppError> =
            conn.transaction(TransactionKind::Deferred, |c| Ok(c.execute("BOGUS")?));
        assert!(matches!(res, Err(AppError::Db(DbError::SqliteError(_)))));
    }
}
