//! Database schema definitions and migration runner.
//!
//! Migrations are simple SQL strings applied in order. The `user_version`
//! pragma tracks which migrations have already been applied. Per-changeset
//! tree tables and the merge issue table are not migrations: they are
//! created and dropped by the flows that own them (see
//! [`Database::create_tree_table`](super::Database::create_tree_table) and
//! [`Database::create_issue_table`](super::Database::create_issue_table)).

use rusqlite::Connection;
use tracing::{debug, info};

use crate::errors::DatabaseError;

/// All migrations, in order. Each entry is `(version, description, sql)`.
static MIGRATIONS: &[(u32, &str, &str)] = &[
    (
        1,
        "initial schema",
        r#"
        CREATE TABLE IF NOT EXISTS gid (
            alias   INTEGER PRIMARY KEY,
            gid     TEXT    NOT NULL UNIQUE,
            is_tmp  INTEGER NOT NULL DEFAULT 0
        );

        INSERT OR IGNORE INTO gid (alias, gid, is_tmp)
            VALUES (1, 'g0000000000000000000000000000000000', 0);

        CREATE TABLE IF NOT EXISTS csets (
            label           TEXT PRIMARY KEY,
            cset_hash       TEXT,
            tree_table_name TEXT NOT NULL,
            pc_table_name   TEXT,
            super_root_hash TEXT,
            created_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS pending_change (
            alias               INTEGER PRIMARY KEY REFERENCES gid (alias),
            parent_alias        INTEGER NOT NULL,
            name                TEXT    NOT NULL,
            type                INTEGER NOT NULL,
            net_change_flags    INTEGER NOT NULL,
            merge_content_hash  TEXT,
            sparse_content_hash TEXT,
            sparse_attrbits     INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_pending_change_parent
            ON pending_change (parent_alias, name);
        "#,
    ),
    (
        2,
        "file locks and timestamp cache",
        r#"
        CREATE TABLE IF NOT EXISTS file_lock (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            gid          TEXT    NOT NULL,
            branch       TEXT    NOT NULL,
            owner        TEXT    NOT NULL,
            completed    INTEGER NOT NULL DEFAULT 0,
            pull_blocked INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_file_lock_branch ON file_lock (branch, completed);

        CREATE TABLE IF NOT EXISTS timestamp_cache (
            alias    INTEGER PRIMARY KEY,
            mtime_ns INTEGER NOT NULL,
            size     INTEGER NOT NULL,
            hid      TEXT    NOT NULL
        );
        "#,
    ),
];

/// Run all pending migrations against `conn`.
pub fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    let current_version = get_schema_version(conn)?;
    info!(
        current_version,
        target_version = MIGRATIONS.last().map(|m| m.0).unwrap_or(0),
        "checking database migrations"
    );

    for &(version, description, sql) in MIGRATIONS {
        if version > current_version {
            info!(version, description, "applying migration");
            conn.execute_batch(sql)
                .map_err(|e| DatabaseError::MigrationFailed {
                    version,
                    detail: e.to_string(),
                })?;
            set_schema_version(conn, version)?;
            debug!(version, "migration applied successfully");
        }
    }

    Ok(())
}

/// Read the current schema version from the SQLite `user_version` pragma.
fn get_schema_version(conn: &Connection) -> Result<u32, DatabaseError> {
    let version: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    Ok(version)
}

/// Set the schema version via the SQLite `user_version` pragma.
fn set_schema_version(conn: &Connection, version: u32) -> Result<(), DatabaseError> {
    conn.pragma_update(None, "user_version", version)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_run_idempotently() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
        assert_eq!(get_schema_version(&conn).unwrap(), 2);
    }

    #[test]
    fn test_tables_created() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let tables: Vec<String> = {
            let mut stmt = conn
                .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .unwrap();
            stmt.query_map([], |row| row.get(0))
                .unwrap()
                .filter_map(|r| r.ok())
                .collect()
        };

        for expected in ["gid", "csets", "pending_change", "file_lock", "timestamp_cache"] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
        assert!(!tables.contains(&"issue".to_string()));
    }

    #[test]
    fn test_null_root_sentinel_present() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();
        let alias: i64 = conn
            .query_row(
                "SELECT alias FROM gid WHERE gid = 'g0000000000000000000000000000000000'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(alias, 1);
    }
}
