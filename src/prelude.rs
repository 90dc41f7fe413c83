//! Convenient imports for common functionality.
//!
//! This module re-exports the types most callers need, so a single
//! `use sqlite_dispatch::prelude::*;` is enough to open a database and run work on it.

pub use crate::config::{DatabaseOptions, DatabaseOptionsBuilder, TableLockPolicy, TransactionKind};
pub use crate::connection::{Connection, Record, UpdateMode};
pub use crate::db::Database;
pub use crate::error::DbError;
pub use crate::row::{Column, FromRow, Row};
pub use crate::statement::Statement;
pub use crate::storage::StorageLocation;
pub use crate::types::{FromValue, Json, Value};

#[cfg(feature = "tokio")]
pub use crate::tokio_support::AsyncDatabase;

pub use crate::params;
