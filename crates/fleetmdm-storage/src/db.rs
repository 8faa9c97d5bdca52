//! Database handle shared by the device, push-info and queue stores.

use std::path::Path;
use std::sync::Arc;

use redb::backends::InMemoryBackend;
use redb::Database;
use tracing::info;

use crate::devices::{DeviceStorage, DEVICES_TABLE, SERIAL_INDEX_TABLE};
use crate::push_info::{PushInfoStorage, PUSH_INFO_TABLE};
use crate::queue::{QueueStorage, QUEUES_TABLE};
use crate::Result;

/// Path value that selects the in-memory backend.
pub const MEMORY_PATH: &str = ":memory:";

/// An open redb database with all FleetMDM tables created.
///
/// Cloning is cheap; clones share the same database.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    path: String,
}

impl Store {
    /// Open or create the database at `path`, creating parent directories.
    ///
    /// `":memory:"` opens a non-persistent database.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();
        let path_str = path_ref.to_string_lossy().to_string();
        if path_str == MEMORY_PATH {
            return Self::memory();
        }

        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let db = if path_ref.exists() {
            Database::open(path_ref)?
        } else {
            Database::create(path_ref)?
        };
        info!(path = %path_str, "Opened database");
        Self::init(db, path_str)
    }

    /// Create a non-persistent database.
    pub fn memory() -> Result<Self> {
        let db = Database::builder().create_with_backend(InMemoryBackend::new())?;
        Self::init(db, MEMORY_PATH.to_string())
    }

    fn init(db: Database, path: String) -> Result<Self> {
        // Create every table up front so read transactions never hit a
        // missing table.
        let txn = db.begin_write()?;
        {
            txn.open_table(DEVICES_TABLE)?;
            txn.open_table(SERIAL_INDEX_TABLE)?;
            txn.open_table(PUSH_INFO_TABLE)?;
            txn.open_table(QUEUES_TABLE)?;
        }
        txn.commit()?;
        Ok(Self {
            db: Arc::new(db),
            path,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_persistent(&self) -> bool {
        self.path != MEMORY_PATH
    }

    pub fn devices(&self) -> DeviceStorage {
        DeviceStorage::new(self.db.clone())
    }

    pub fn push_info(&self) -> PushInfoStorage {
        PushInfoStorage::new(self.db.clone())
    }

    pub fn queues(&self) -> QueueStorage {
        QueueStorage::new(self.db.clone())
    }
}

/// Run a synchronous store operation on the blocking thread pool.
pub async fn spawn_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store() {
        let store = Store::memory().unwrap();
        assert!(!store.is_persistent());
        assert!(store.devices().list().unwrap().is_empty());
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("fleetmdm.redb");
        let store = Store::open(&path).unwrap();
        assert!(store.is_persistent());
        assert!(path.exists());
    }
}
