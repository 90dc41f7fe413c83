use std::fmt;
use std::path::{Path, PathBuf};

/// Where a database lives.
///
/// See <https://www.sqlite.org/inmemorydb.html> for how the in-memory variants behave.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StorageLocation {
    /// A database file at the given path (or a `file:` URI).
    OnDisk(PathBuf),
    /// A private in-memory database, visible only to the connection that opened it.
    InMemory,
    /// A named in-memory database every connection in the process can attach to.
    SharedMemory(String),
    /// An anonymous on-disk database, deleted when closed.
    Temporary,
}

impl StorageLocation {
    /// Convenience constructor for [`StorageLocation::OnDisk`].
    pub fn on_disk(path: impl AsRef<Path>) -> Self {
        StorageLocation::OnDisk(path.as_ref().to_path_buf())
    }

    /// Convenience constructor for [`StorageLocation::SharedMemory`].
    pub fn shared_memory(name: impl Into<String>) -> Self {
        StorageLocation::SharedMemory(name.into())
    }

    /// The filename handed to `sqlite3_open_v2`. Connections must be opened with
    /// `SQLITE_OPEN_URI` for the shared-memory form to work.
    #[must_use]
    pub fn path(&self) -> String {
        match self {
            StorageLocation::OnDisk(path) => path.to_string_lossy().into_owned(),
            StorageLocation::InMemory => ":memory:".to_string(),
            StorageLocation::SharedMemory(name) => format!("file:{name}?mode=memory&cache=shared"),
            StorageLocation::Temporary => String::new(),
        }
    }

    /// Whether several connections opening this location observe the same database.
    ///
    /// `Temporary` counts as shared because a pooled database backs it with one real file.
    #[must_use]
    pub fn is_shared(&self) -> bool {
        !matches!(self, StorageLocation::InMemory)
    }

    /// True for locations whose data lives in a file (and so can use WAL).
    #[must_use]
    pub fn is_file_backed(&self) -> bool {
        matches!(self, StorageLocation::OnDisk(_) | StorageLocation::Temporary)
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLocation::OnDisk(path) => write!(f, "{}", path.display()),
            StorageLocation::InMemory => f.write_str(":memory:"),
            StorageLocation::SharedMemory(name) => write!(f, "shared-memory:{name}"),
            StorageLocation::Temporary => f.write_str("temporary"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_sqlite_uri_conventions() {
        assert_eq!(StorageLocation::InMemory.path(), ":memory:");
        assert_eq!(
            StorageLocation::shared_memory("memdb1").path(),
            "file:memdb1?mode=memory&cache=shared"
        );
        assert_eq!(StorageLocation::Temporary.path(), "");
        assert_eq!(StorageLocation::on_disk("/tmp/cars.db").path(), "/tmp/cars.db");
    }

    #[test]
    fn only_private_memory_is_unshared() {
        assert!(!StorageLocation::InMemory.is_shared());
        assert!(StorageLocation::shared_memory("x").is_shared());
        assert!(StorageLocation::Temporary.is_shared());
        assert!(StorageLocation::on_disk("a.db").is_shared());
    }
}
