pub mod events;
pub mod operations;
pub mod queue_messages;
pub mod resource_templates;
pub mod resources;

#[cfg(test)]
pub mod tests;

use sqlx::{
    migrate, pool::PoolConnection, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions, Pool,
    Sqlite,
};
use std::{fs::File, io, ops::Deref, path::Path, str::FromStr};

/// The maximum amount of rows that can be returned by any single query.
const MAX_ROW_LIMIT: i64 = 200;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum StorageError {
    #[error("could not establish connection to database; {0}")]
    Connection(String),

    #[error("requested entity not found")]
    NotFound,

    #[error("entity already exists")]
    Exists,

    /// A conditional write was rejected because the stored etag no longer matches.
    #[error("entity was modified concurrently; expected etag '{0}'")]
    Conflict(String),

    #[error("did not find any fields to update")]
    NoFieldsUpdated,

    #[error("unexpected storage error occurred; {0}")]
    Internal(String),
}

/// Sqlite Errors are determined by database error code. We map these to the specific code so that
/// when we come back with a database error we can detect which one happened.
/// See the codes here: https://www.sqlite.org/rescode.html
pub fn map_sqlx_error(e: sqlx::Error, query: &str) -> StorageError {
    match e {
        sqlx::Error::RowNotFound => StorageError::NotFound,
        sqlx::Error::Database(database_err) => {
            if let Some(err_code) = database_err.code() {
                match err_code.deref() {
                    // SQLITE_CONSTRAINT_PRIMARYKEY and SQLITE_CONSTRAINT_UNIQUE
                    "1555" | "2067" => StorageError::Exists,
                    _ => StorageError::Internal(format!(
                        "Error occurred while running query; [{err_code}] {database_err}; query: {query}"
                    )),
                }
            } else {
                StorageError::Internal(format!(
                    "Error occurred while running query; {database_err}; query: {query}"
                ))
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StorageError::Connection(format!("{e}; query: {query}"))
        }
        _ => StorageError::Internal(format!(
            "Error occurred while running query; {:#?}; query: {query}",
            e
        )),
    }
}

#[derive(Debug, Clone)]
pub struct Db {
    write_pool: Pool<Sqlite>,
    read_pool: Pool<Sqlite>,
}

// Create file if not exists.
fn touch_file(path: &Path) -> io::Result<()> {
    if !path.exists() {
        File::create(path)?;
    }

    Ok(())
}

impl Db {
    pub async fn new(path: &str) -> Result<Self, StorageError> {
        touch_file(Path::new(path)).map_err(|e| {
            StorageError::Connection(format!("could not create database file '{path}'; {e}"))
        })?;

        // We create two different pools of connections. The read pool has many connections and is high concurrency.
        // The write pool is essentially a single connection in which only one write can be made at a time.
        // Not using this paradigm may result in sqlite "database is locked(error: 5)" errors because of the
        // manner in which sqlite handles transactions.
        let connect_options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))
            .map_err(|e| StorageError::Connection(e.to_string()))?
            // * journal_mode: Turns on WAL mode which increases concurrency and reliability.
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            // * synchronous: Only sync to disk at critical junctures; safe because of WAL mode.
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            // * busy_timeout: How long should a sqlite query try before it returns an error.
            .busy_timeout(std::time::Duration::from_secs(5));

        let read_pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(connect_options.clone())
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let write_pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        migrate!("src/storage/migrations")
            .run(&write_pool)
            .await
            .map_err(|e| StorageError::Internal(format!("could not run migrations; {e}")))?;

        Ok(Db {
            write_pool,
            read_pool,
        })
    }

    pub async fn write_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.write_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }

    pub async fn read_conn(&self) -> Result<PoolConnection<Sqlite>, StorageError> {
        self.read_pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(format!("{:?}", e)))
    }
}
