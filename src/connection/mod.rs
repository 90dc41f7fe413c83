mod attach;
mod core;
mod exec;
mod tx;
mod updates;

pub use self::core::{Connection, ConnectionOptions};
pub use updates::{Record, UpdateMode};

pub(crate) use tx::rollback_with_busy_retries;
