//! SQLite row store for the working copy.
//!
//! Provides a [`Database`] handle with WAL-mode journaling, automatic schema
//! migrations, typed row accessors for every table the engine uses, and the
//! explicit begin/commit/rollback primitives the transaction driver wraps
//! around its apply phase.

pub mod queries;
pub mod schema;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

pub use queries::{CsetEntry, IssueRow, LockRow, TimestampEntry};

/// Main database handle wrapping a SQLite connection.
///
/// The connection is opened in WAL mode with `PRAGMA foreign_keys = ON`.
/// The inner connection is wrapped in a `Mutex` so that `Database` is
/// `Send + Sync`.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DatabaseError> {
        let path = path.as_ref();
        info!(path = %path.display(), "opening database");

        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch("PRAGMA busy_timeout = 5000;")?;

        debug!("database opened successfully with WAL mode");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (useful for testing).
    pub fn in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run all schema migrations to bring the database up to date.
    pub fn initialize(&self) -> Result<(), DatabaseError> {
        info!("initializing database schema");
        let conn = self.conn();
        schema::run_migrations(&conn)?;
        debug!("database schema is up to date");
        Ok(())
    }

    /// Obtain a lock on the underlying connection.
    ///
    /// If the Mutex is poisoned (a previous holder panicked), the lock is
    /// recovered rather than propagating a panic.
    pub fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("database mutex was poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Take the store's write lock and start the transaction that spans a
    /// whole working-copy transaction. Contention surfaces as
    /// [`DatabaseError::Busy`].
    pub fn begin_immediate(&self) -> Result<(), DatabaseError> {
        self.conn().execute_batch("BEGIN IMMEDIATE")?;
        debug!("row store transaction started");
        Ok(())
    }

    /// Commit the transaction started by [`begin_immediate`](Self::begin_immediate).
    pub fn commit(&self) -> Result<(), DatabaseError> {
        self.conn().execute_batch("COMMIT")?;
        debug!("row store transaction committed");
        Ok(())
    }

    /// Roll back the transaction started by [`begin_immediate`](Self::begin_immediate).
    pub fn rollback(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        if conn.is_autocommit() {
            return Ok(());
        }
        conn.execute_batch("ROLLBACK")?;
        debug!("row store transaction rolled back");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Alias;

    #[test]
    fn test_in_memory_database() {
        let db = Database::in_memory().expect("failed to create in-memory db");
        db.initialize().expect("failed to initialize schema");
    }

    #[test]
    fn test_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wc.db");
        let db = Database::new(&path).expect("failed to create file db");
        db.initialize().expect("failed to initialize schema");
        assert!(path.exists());
    }

    #[test]
    fn test_begin_immediate_then_rollback_discards_rows() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();

        db.begin_immediate().unwrap();
        let alias = db.create_gid("gabc", false).unwrap();
        assert!(alias.0 > Alias::NULL_ROOT.0);
        db.rollback().unwrap();

        assert_eq!(db.alias_of_gid("gabc").unwrap(), None);
        // Rolling back outside a transaction is harmless.
        db.rollback().unwrap();
    }

    #[test]
    fn test_second_writer_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wc.db");
        let a = Database::new(&path).unwrap();
        a.initialize().unwrap();
        let b = Database::new(&path).unwrap();
        b.conn().execute_batch("PRAGMA busy_timeout = 0;").unwrap();

        a.begin_immediate().unwrap();
        let err = b.begin_immediate().unwrap_err();
        assert!(matches!(err, DatabaseError::Busy));
        a.rollback().unwrap();
        b.begin_immediate().unwrap();
        b.commit().unwrap();
    }
}
