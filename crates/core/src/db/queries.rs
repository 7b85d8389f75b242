//! Typed row accessors for every table in the working-copy database.
//!
//! Single-row lookups go through `prepare_cached`, so repeated
//! "get row by alias" calls inside one transaction reuse their statements.
//! Anything that drops a table must flush that cache first.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::Database;
use crate::errors::{is_no_such_table, DatabaseError};
use crate::models::{Alias, PcFlags, PcRow, SparseInfo, TreeRow};

// ---------------------------------------------------------------------------
// Row structs returned by queries
// ---------------------------------------------------------------------------

/// A row from the `csets` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsetEntry {
    pub label: String,
    pub cset_hash: Option<String>,
    pub tree_table_name: String,
    pub pc_table_name: Option<String>,
    pub super_root_hash: Option<String>,
    pub created_at: String,
}

/// A row from the `issue` table. `issue_json` is parsed by the caller.
#[derive(Debug, Clone)]
pub struct IssueRow {
    pub alias: Alias,
    pub status_flags: u64,
    pub issue_json: String,
    pub resolve_json: Option<String>,
}

/// A row from the `file_lock` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRow {
    pub gid: String,
    pub branch: String,
    pub owner: String,
    pub completed: bool,
    pub pull_blocked: bool,
}

/// A row from the `timestamp_cache` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampEntry {
    pub alias: Alias,
    pub mtime_ns: i64,
    pub size: u64,
    pub hid: String,
}

/// Name of the tree table holding rows for `label`.
pub fn tree_table_name(label: &str) -> Result<String, DatabaseError> {
    if label.is_empty() || !label.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(DatabaseError::InvalidLabel(label.to_string()));
    }
    Ok(format!("tree_{label}"))
}

fn tree_row_from(row: &Row<'_>) -> rusqlite::Result<TreeRow> {
    Ok(TreeRow {
        alias: row.get(0)?,
        parent_alias: row.get(1)?,
        content_hash: row.get(2)?,
        entry_type: row.get(3)?,
        attrbits: row.get::<_, i64>(4)? as u64,
        name: row.get(5)?,
    })
}

fn pc_row_from(row: &Row<'_>) -> rusqlite::Result<PcRow> {
    let sparse_hash: Option<String> = row.get(6)?;
    let sparse_attrbits: Option<i64> = row.get(7)?;
    Ok(PcRow {
        alias: row.get(0)?,
        parent_alias: row.get(1)?,
        name: row.get(2)?,
        entry_type: row.get(3)?,
        flags: PcFlags::from_bits_truncate(row.get::<_, i64>(4)? as u32),
        merge_content_hash: row.get(5)?,
        sparse: sparse_hash.map(|content_hash| SparseInfo {
            content_hash,
            attrbits: sparse_attrbits.unwrap_or(0) as u64,
        }),
    })
}

const PC_COLUMNS: &str = "alias, parent_alias, name, type, net_change_flags, \
     merge_content_hash, sparse_content_hash, sparse_attrbits";

fn insert_tree_row_on(conn: &Connection, table: &str, row: &TreeRow) -> Result<(), DatabaseError> {
    conn.prepare_cached(&format!(
        "INSERT OR REPLACE INTO {table} (alias, parent_alias, content_hash, type, attrbits, name)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
    ))?
    .execute(params![
        row.alias,
        row.parent_alias,
        row.content_hash,
        row.entry_type,
        row.attrbits as i64,
        row.name
    ])?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- gid ----------------------------------------------------------------

    /// Insert a GID and return its new alias.
    pub fn create_gid(&self, gid: &str, is_tmp: bool) -> Result<Alias, DatabaseError> {
        let conn = self.conn();
        conn.prepare_cached("INSERT INTO gid (gid, is_tmp) VALUES (?1, ?2)")?
            .execute(params![gid, is_tmp as i64])?;
        let alias = Alias(conn.last_insert_rowid());
        debug!(%alias, gid, is_tmp, "created gid");
        Ok(alias)
    }

    /// Alias for `gid`, creating a permanent row if the GID is new.
    pub fn get_or_create_alias(&self, gid: &str) -> Result<Alias, DatabaseError> {
        match self.alias_of_gid(gid)? {
            Some(alias) => Ok(alias),
            None => self.create_gid(gid, false),
        }
    }

    pub fn alias_of_gid(&self, gid: &str) -> Result<Option<Alias>, DatabaseError> {
        let conn = self.conn();
        let alias = conn
            .prepare_cached("SELECT alias FROM gid WHERE gid = ?1")?
            .query_row(params![gid], |row| row.get(0))
            .optional()?;
        Ok(alias)
    }

    pub fn gid_of_alias(&self, alias: Alias) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let gid = conn
            .prepare_cached("SELECT gid FROM gid WHERE alias = ?1")?
            .query_row(params![alias], |row| row.get(0))
            .optional()?;
        Ok(gid)
    }

    /// Make the GIDs of every item with a pending change (or a row in the
    /// baseline tree) permanent, then delete every remaining temporary GID.
    /// Returns the number purged.
    pub fn settle_tmp_gids(&self, baseline_label: &str) -> Result<usize, DatabaseError> {
        let table = tree_table_name(baseline_label)?;
        let conn = self.conn();
        conn.execute(
            "UPDATE gid SET is_tmp = 0
             WHERE is_tmp = 1 AND alias IN (SELECT alias FROM pending_change)",
            [],
        )?;
        conn.execute(
            &format!(
                "UPDATE gid SET is_tmp = 0
                 WHERE is_tmp = 1 AND alias IN (SELECT alias FROM {table})"
            ),
            [],
        )?;
        let purged = conn.execute("DELETE FROM gid WHERE is_tmp = 1", [])?;
        conn.execute(
            "DELETE FROM timestamp_cache WHERE alias NOT IN (SELECT alias FROM gid)",
            [],
        )?;
        debug!(purged, "settled temporary gids");
        Ok(purged)
    }

    // -- csets --------------------------------------------------------------

    pub fn get_cset(&self, label: &str) -> Result<Option<CsetEntry>, DatabaseError> {
        let conn = self.conn();
        let entry = conn
            .prepare_cached(
                "SELECT label, cset_hash, tree_table_name, pc_table_name, super_root_hash, created_at
                 FROM csets WHERE label = ?1",
            )?
            .query_row(params![label], |row| {
                Ok(CsetEntry {
                    label: row.get(0)?,
                    cset_hash: row.get(1)?,
                    tree_table_name: row.get(2)?,
                    pc_table_name: row.get(3)?,
                    super_root_hash: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })
            .optional()?;
        Ok(entry)
    }

    /// Record (or replace) the changeset held under `label`.
    pub fn upsert_cset(
        &self,
        label: &str,
        cset_hash: Option<&str>,
        super_root_hash: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let table = tree_table_name(label)?;
        let pc_table = (label == "L0").then_some("pending_change");
        let now = Utc::now().to_rfc3339();
        self.conn().execute(
            "INSERT OR REPLACE INTO csets
                (label, cset_hash, tree_table_name, pc_table_name, super_root_hash, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![label, cset_hash, table, pc_table, super_root_hash, now],
        )?;
        debug!(label, ?cset_hash, "recorded changeset");
        Ok(())
    }

    // -- tree_<label> -------------------------------------------------------

    /// Create the tree table for `label` (idempotent).
    pub fn create_tree_table(&self, label: &str) -> Result<(), DatabaseError> {
        let table = tree_table_name(label)?;
        self.conn().execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                alias        INTEGER PRIMARY KEY REFERENCES gid (alias),
                parent_alias INTEGER NOT NULL REFERENCES gid (alias),
                content_hash TEXT    NOT NULL,
                type         INTEGER NOT NULL,
                attrbits     INTEGER NOT NULL,
                name         TEXT    NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_{table}_parent ON {table} (parent_alias, name);"
        ))?;
        Ok(())
    }

    pub fn get_tree_row(&self, label: &str, alias: Alias) -> Result<Option<TreeRow>, DatabaseError> {
        let table = tree_table_name(label)?;
        let conn = self.conn();
        let row = conn
            .prepare_cached(&format!(
                "SELECT alias, parent_alias, content_hash, type, attrbits, name
                 FROM {table} WHERE alias = ?1"
            ))?
            .query_row(params![alias], tree_row_from)
            .optional()?;
        Ok(row)
    }

    /// Rows whose parent is `parent`, ordered by alias. A bogus parent simply
    /// yields no rows.
    pub fn list_tree_children(&self, label: &str, parent: Alias) -> Result<Vec<TreeRow>, DatabaseError> {
        let table = tree_table_name(label)?;
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT alias, parent_alias, content_hash, type, attrbits, name
             FROM {table} WHERE parent_alias = ?1 ORDER BY alias"
        ))?;
        let rows = stmt
            .query_map(params![parent], tree_row_from)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// The root directory row of a tree (the row whose parent is the
    /// null-root sentinel).
    pub fn root_tree_row(&self, label: &str) -> Result<TreeRow, DatabaseError> {
        let mut rows = self.list_tree_children(label, Alias::NULL_ROOT)?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            n => Err(DatabaseError::NotFound {
                entity: format!("root of tree {label}"),
                id: format!("{n} candidate rows"),
            }),
        }
    }

    pub fn insert_tree_row(&self, label: &str, row: &TreeRow) -> Result<(), DatabaseError> {
        let table = tree_table_name(label)?;
        insert_tree_row_on(&self.conn(), &table, row)
    }

    /// Replace every row of a tree.
    pub fn replace_tree(&self, label: &str, rows: &[TreeRow]) -> Result<(), DatabaseError> {
        let table = tree_table_name(label)?;
        let conn = self.conn();
        conn.execute(&format!("DELETE FROM {table}"), [])?;
        for row in rows {
            insert_tree_row_on(&conn, &table, row)?;
        }
        debug!(label, count = rows.len(), "replaced tree");
        Ok(())
    }

    // -- pending_change -----------------------------------------------------

    pub fn get_pending_change(&self, alias: Alias) -> Result<Option<PcRow>, DatabaseError> {
        let conn = self.conn();
        let row = conn
            .prepare_cached(&format!(
                "SELECT {PC_COLUMNS} FROM pending_change WHERE alias = ?1"
            ))?
            .query_row(params![alias], pc_row_from)
            .optional()?;
        Ok(row)
    }

    /// Pending-change rows currently located in `parent`, ordered by alias.
    pub fn list_pending_children(&self, parent: Alias) -> Result<Vec<PcRow>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PC_COLUMNS} FROM pending_change WHERE parent_alias = ?1 ORDER BY alias"
        ))?;
        let rows = stmt
            .query_map(params![parent], pc_row_from)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn list_pending_changes(&self) -> Result<Vec<PcRow>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {PC_COLUMNS} FROM pending_change ORDER BY alias"
        ))?;
        let rows = stmt
            .query_map([], pc_row_from)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn upsert_pending_change(&self, row: &PcRow) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.prepare_cached(&format!(
            "INSERT OR REPLACE INTO pending_change ({PC_COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
        ))?
        .execute(params![
            row.alias,
            row.parent_alias,
            row.name,
            row.entry_type,
            row.flags.bits() as i64,
            row.merge_content_hash,
            row.sparse.as_ref().map(|s| s.content_hash.as_str()),
            row.sparse.as_ref().map(|s| s.attrbits as i64),
        ])?;
        debug!(alias = %row.alias, flags = ?row.flags, "stored pending change");
        Ok(())
    }

    pub fn delete_pending_change(&self, alias: Alias) -> Result<(), DatabaseError> {
        self.conn()
            .prepare_cached("DELETE FROM pending_change WHERE alias = ?1")?
            .execute(params![alias])?;
        debug!(%alias, "deleted pending change");
        Ok(())
    }

    /// Remove all pending changes after they have been absorbed into a new
    /// baseline. Sparse rows survive with only their SPARSE bit.
    pub fn clear_pending_changes(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let sparse = PcFlags::SPARSE.bits() as i64;
        conn.execute(
            "DELETE FROM pending_change WHERE (net_change_flags & ?1) = 0",
            params![sparse],
        )?;
        conn.execute(
            "UPDATE pending_change SET net_change_flags = ?1, merge_content_hash = NULL",
            params![sparse],
        )?;
        Ok(())
    }

    // -- issue --------------------------------------------------------------

    /// Create the issue table at the start of a merge.
    pub fn create_issue_table(&self) -> Result<(), DatabaseError> {
        self.conn().execute_batch(
            "CREATE TABLE IF NOT EXISTS issue (
                alias        INTEGER PRIMARY KEY REFERENCES gid (alias),
                status_flags INTEGER NOT NULL,
                issue_json   TEXT    NOT NULL,
                resolve_json TEXT
            );",
        )?;
        Ok(())
    }

    /// Drop the issue table when the merge is committed or reverted. Cached
    /// statements that reference it are flushed first.
    pub fn drop_issue_table(&self) -> Result<(), DatabaseError> {
        let conn = self.conn();
        conn.flush_prepared_statement_cache();
        conn.execute_batch("DROP TABLE IF EXISTS issue;")?;
        debug!("dropped issue table");
        Ok(())
    }

    /// The issue for `alias`. Outside a merge the table does not exist and
    /// this reports no issue.
    pub fn get_issue(&self, alias: Alias) -> Result<Option<IssueRow>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = match conn.prepare_cached(
            "SELECT alias, status_flags, issue_json, resolve_json FROM issue WHERE alias = ?1",
        ) {
            Ok(stmt) => stmt,
            Err(e) if is_no_such_table(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let row = stmt
            .query_row(params![alias], |row| {
                Ok(IssueRow {
                    alias: row.get(0)?,
                    status_flags: row.get::<_, i64>(1)? as u64,
                    issue_json: row.get(2)?,
                    resolve_json: row.get(3)?,
                })
            })
            .optional()?;
        Ok(row)
    }

    /// Aliases of every item with an issue, ordered by alias.
    pub fn list_issue_aliases(&self) -> Result<Vec<Alias>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = match conn.prepare_cached("SELECT alias FROM issue ORDER BY alias") {
            Ok(stmt) => stmt,
            Err(e) if is_no_such_table(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let aliases = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(aliases)
    }

    pub fn insert_issue(
        &self,
        alias: Alias,
        status_flags: u64,
        issue_json: &str,
    ) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO issue (alias, status_flags, issue_json) VALUES (?1, ?2, ?3)",
            params![alias, status_flags as i64, issue_json],
        )?;
        debug!(%alias, status_flags, "inserted issue");
        Ok(())
    }

    pub fn update_issue(
        &self,
        alias: Alias,
        status_flags: u64,
        resolve_json: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .prepare_cached("UPDATE issue SET status_flags = ?2, resolve_json = ?3 WHERE alias = ?1")?
            .execute(params![alias, status_flags as i64, resolve_json])?;
        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "issue".into(),
                id: alias.to_string(),
            });
        }
        Ok(())
    }

    // -- file_lock ----------------------------------------------------------

    pub fn insert_lock(&self, lock: &LockRow) -> Result<(), DatabaseError> {
        self.conn().execute(
            "INSERT INTO file_lock (gid, branch, owner, completed, pull_blocked)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                lock.gid,
                lock.branch,
                lock.owner,
                lock.completed as i64,
                lock.pull_blocked as i64
            ],
        )?;
        Ok(())
    }

    /// Locks on `branch` that have not completed.
    pub fn list_active_locks(&self, branch: &str) -> Result<Vec<LockRow>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached(
            "SELECT gid, branch, owner, completed, pull_blocked FROM file_lock
             WHERE branch = ?1 AND completed = 0 ORDER BY id",
        )?;
        let locks = stmt
            .query_map(params![branch], |row| {
                Ok(LockRow {
                    gid: row.get(0)?,
                    branch: row.get(1)?,
                    owner: row.get(2)?,
                    completed: row.get::<_, i64>(3)? != 0,
                    pull_blocked: row.get::<_, i64>(4)? != 0,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(locks)
    }

    // -- timestamp_cache ----------------------------------------------------

    pub fn load_timestamp_cache(&self) -> Result<Vec<TimestampEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare_cached("SELECT alias, mtime_ns, size, hid FROM timestamp_cache")?;
        let entries = stmt
            .query_map([], |row| {
                Ok(TimestampEntry {
                    alias: row.get(0)?,
                    mtime_ns: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                    hid: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn upsert_timestamp(&self, entry: &TimestampEntry) -> Result<(), DatabaseError> {
        self.conn()
            .prepare_cached(
                "INSERT OR REPLACE INTO timestamp_cache (alias, mtime_ns, size, hid)
                 VALUES (?1, ?2, ?3, ?4)",
            )?
            .execute(params![entry.alias, entry.mtime_ns, entry.size as i64, entry.hid])?;
        Ok(())
    }
}
