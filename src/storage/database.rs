//! SQLite handle for one cache file.
//!
//! A cache is written once into a staging file and then renamed over the
//! published one, so each handle owns a single self-contained file. The
//! rollback journal stays in `DELETE` mode: WAL would leave `-wal`/`-shm`
//! side files that a rename does not carry along.

use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;

use super::schema;

/// Pragmas applied to every cache file before the schema.
const PRAGMAS: &str = "PRAGMA journal_mode = DELETE; PRAGMA synchronous = FULL;";

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The schema could not be applied, e.g. the file is not a database.
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Cache file handle usable from async code.
///
/// Statements run on the blocking pool, one at a time. Dropping the last
/// clone closes the file, after which it may be renamed.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens or creates the cache file at `path` and applies the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        Self::init(move || {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Ok(Connection::open(&path)?)
        })
        .await
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        Self::init(|| Ok(Connection::open_in_memory()?)).await
    }

    async fn init<F>(connect: F) -> Result<Self>
    where
        F: FnOnce() -> Result<Connection> + Send + 'static,
    {
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = connect()?;
            conn.execute_batch(PRAGMAS)
                .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
            for statement in schema::all_migrations() {
                conn.execute_batch(statement)
                    .map_err(|e| DatabaseError::MigrationFailed(e.to_string()))?;
            }
            Ok(conn)
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` against the connection on the blocking pool.
    pub async fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
    }

    /// Runs `f` in a transaction, committing only if it returns `Ok`.
    pub async fn transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            let result = f(&tx)?;
            tx.commit()?;
            Ok(result)
        })
        .await
        .map_err(|e| DatabaseError::TaskFailed(e.to_string()))?
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_in_memory_creates_schema() {
        let db = Database::open_in_memory().await.unwrap();

        let tables: Vec<String> = db
            .with_conn(|conn| {
                let mut stmt = conn
                    .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
            })
            .await
            .unwrap();

        assert!(tables.contains(&"cache_header".to_string()));
        assert!(tables.contains(&"cache_entries".to_string()));
    }

    #[tokio::test]
    async fn open_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("cache.db");

        let db = Database::open(&path).await.unwrap();
        drop(db);

        assert!(path.exists());
    }

    #[tokio::test]
    async fn file_uses_rollback_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        let db = Database::open(&path).await.unwrap();

        let mode: String = db
            .with_conn(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .await
            .unwrap();
        db.transaction(|tx| {
            tx.execute(
                "INSERT INTO cache_header (id, provenance_model, status, dimension, entry_count, created_at)
                 VALUES (1, 'clip-s', 'complete', 4, 0, '2025-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();
        drop(db);

        assert_eq!(mode.to_ascii_lowercase(), "delete");
        assert!(!dir.path().join("cache.db-wal").exists());
        assert!(!dir.path().join("cache.db-journal").exists());
    }

    #[tokio::test]
    async fn non_database_file_fails_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

        let result = Database::open(&path).await;
        assert!(matches!(result, Err(DatabaseError::MigrationFailed(_))));
    }

    #[tokio::test]
    async fn transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().await.unwrap();

        let result: Result<()> = db
            .transaction(|tx| {
                tx.execute(
                    "INSERT INTO cache_header (id, provenance_model, status, dimension, entry_count, created_at)
                     VALUES (1, 'm', 'building', 4, 0, '2025-01-01T00:00:00Z')",
                    [],
                )?;
                Err(DatabaseError::MigrationFailed("intentional error".to_string()))
            })
            .await;

        assert!(result.is_err());

        let count: i64 = db
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM cache_header", [], |row| row.get(0))?)
            })
            .await
            .unwrap();

        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn database_is_clone() {
        let db1 = Database::open_in_memory().await.unwrap();
        let db2 = db1.clone();

        db1.transaction(|tx| {
            tx.execute(
                "INSERT INTO cache_header (id, provenance_model, status, dimension, entry_count, created_at)
                 VALUES (1, 'clip-s', 'complete', 4, 0, '2025-01-01T00:00:00Z')",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let model: String = db2
            .with_conn(|conn| {
                Ok(conn.query_row("SELECT provenance_model FROM cache_header", [], |row| {
                    row.get(0)
                })?)
            })
            .await
            .unwrap();

        assert_eq!(model, "clip-s");
    }
}
