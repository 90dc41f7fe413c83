//! Concurrency-safe access to an embedded `SQLite` database.
//!
//! A [`Database`] owns one writer [`Connection`], serialized through a FIFO
//! [`ConnectionQueue`], and an elastic [`ConnectionPool`] of read-only connections. Every unit of
//! work runs inside an explicit transaction that commits on success and rolls back on error.
//!
//! ```rust,no_run
//! use sqlite_dispatch::prelude::*;
//!
//! # fn main() -> Result<(), DbError> {
//! let db = Database::builder(StorageLocation::on_disk("cars.db"))
//!     .lock_policy(TableLockPolicy::Retry {
//!         max_retries: 10,
//!         backoff: std::time::Duration::from_millis(5),
//!     })
//!     .open()?;
//!
//! db.execute_script("CREATE TABLE IF NOT EXISTS cars (id INTEGER PRIMARY KEY, name TEXT, price INTEGER)")?;
//! db.write(|conn| conn.run("INSERT INTO cars (name, price) VALUES (?, ?)", &params!["Ford", 20_000]))?;
//!
//! let names: Vec<String> =
//!     db.read(|conn| conn.query_all("SELECT name FROM cars WHERE price >= ?", &params![20_000]))?;
//! # Ok(())
//! # }
//! ```

mod binding;
pub mod config;
pub mod connection;
pub mod db;
pub mod error;
pub mod pool;
pub mod prelude;
pub mod queue;
pub mod row;
pub mod statement;
pub mod storage;
#[cfg(feature = "tokio")]
pub mod tokio_support;
pub mod types;

pub use config::{
    DatabaseOptions, DatabaseOptionsBuilder, MAX_RETRY_BACKOFF, Preparation, TableLockPolicy,
    TransactionKind,
};
pub use connection::{Connection, ConnectionOptions, Record, UpdateMode};
pub use db::Database;
pub use error::DbError;
pub use pool::{ConnectionFactory, ConnectionPool, PoolConfig, PoolStats, PooledConnection};
pub use queue::ConnectionQueue;
pub use row::{Column, ColumnInfo, FromRow, Row, RowIndex};
pub use statement::{CursorState, Rows, Statement};
pub use storage::StorageLocation;
#[cfg(feature = "tokio")]
pub use tokio_support::AsyncDatabase;
pub use types::{FromValue, Json, Value, is_json_decl_type};

pub use rusqlite;
