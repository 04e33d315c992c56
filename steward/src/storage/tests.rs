use super::*;
use sqlx::{pool::PoolConnection, Sqlite};
use tempfile::TempDir;

/// Spins up a database in a throw-away directory. The directory (and the sqlite -shm/-wal companions
/// inside it) is removed when the harness is dropped.
pub struct TestHarness {
    pub db: Db,
    _storage_dir: TempDir,
}

impl TestHarness {
    pub async fn new() -> Self {
        let storage_dir = tempfile::tempdir().expect("could not create temporary directory");
        let storage_path = storage_dir.path().join("steward_tests.db");

        let db = Db::new(&storage_path.to_string_lossy())
            .await
            .expect("could not create test database");

        Self {
            db,
            _storage_dir: storage_dir,
        }
    }

    pub async fn write_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.db.write_conn().await
    }
}
