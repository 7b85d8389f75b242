//! Error types for the wcengine core library.
//!
//! Each collaborator (row store, content store, configuration, merge tools)
//! has its own error type derived with `thiserror`, and [`WcError`] unifies
//! them with the engine-level conditions callers are expected to handle:
//! busy, not-found, invalid-state, collision, and reserved-item access.

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for working-copy transactions.
#[derive(Debug, Error)]
pub enum WcError {
    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Blob(#[from] BlobError),

    #[error(transparent)]
    MergeTool(#[from] MergeToolError),

    /// An alias, gid, row or value that was assumed to exist does not.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// The operation cannot apply to the item in its current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The chosen value is already the accepted resolution.
    #[error("{choice} of '{item}' is already resolved to that value")]
    AlreadyResolved { item: String, choice: String },

    /// Content or attributes of a reserved item cannot be touched.
    #[error("'{0}' is reserved and cannot be modified")]
    Reserved(String),

    /// The destination slot is already occupied.
    #[error("'{name}' collides with existing item '{existing}'")]
    Collision { name: String, existing: String },

    /// An entry name that cannot exist in a directory.
    #[error("invalid entry name '{0}'")]
    InvalidName(String),

    /// A property that has no meaningful value for this kind of item.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WcError {
    /// Shorthand for [`WcError::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// `true` when the underlying store was locked by someone else. The
    /// caller may retry; the engine never does.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Database(DatabaseError::Busy))
    }

    /// `true` for destination name collisions.
    pub fn is_collision(&self) -> bool {
        matches!(self, Self::Collision { .. })
    }
}

// ---------------------------------------------------------------------------
// Database errors
// ---------------------------------------------------------------------------

/// Errors from the SQLite row store.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Underlying rusqlite error.
    #[error("database error: {0}")]
    SqliteError(rusqlite::Error),

    /// The store is locked by another transaction.
    #[error("database busy")]
    Busy,

    /// A migration failed.
    #[error("database migration failed (version {version}): {detail}")]
    MigrationFailed { version: u32, detail: String },

    /// A record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    /// A tree label that cannot be used as part of a table name.
    #[error("invalid changeset label '{0}'")]
    InvalidLabel(String),

    /// Generic I/O error (e.g. file permissions).
    #[error("database I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<rusqlite::Error> for DatabaseError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DatabaseBusy) | Some(rusqlite::ErrorCode::DatabaseLocked) => {
                Self::Busy
            }
            _ => Self::SqliteError(err),
        }
    }
}

/// `true` when `err` reports a missing table. Used where an absent table
/// legitimately means "no rows" (the issue table outside a merge).
pub fn is_no_such_table(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(msg)) => msg.starts_with("no such table"),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Content store errors
// ---------------------------------------------------------------------------

/// Errors from the content-addressable blob store.
#[derive(Debug, Error)]
pub enum BlobError {
    /// No blob is stored under this hash.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Stored bytes no longer hash to their key.
    #[error("blob {expected} is corrupt (hashes to {actual})")]
    HashMismatch { expected: String, actual: String },

    /// The key is not a well-formed hash.
    #[error("malformed blob hash '{0}'")]
    MalformedHash(String),

    #[error("blob store I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Merge tool errors
// ---------------------------------------------------------------------------

/// Errors from merge-tool selection and invocation. A tool that runs and
/// reports conflicts is not an error; these cover tools that cannot run.
#[derive(Debug, Error)]
pub enum MergeToolError {
    /// No builtin or configured tool by that name.
    #[error("unknown merge tool '{0}'")]
    UnknownTool(String),

    /// The external command could not be started.
    #[error("failed to launch merge tool '{tool}': {detail}")]
    LaunchFailed { tool: String, detail: String },

    #[error("merge tool I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_messages() {
        let err = WcError::not_found("alias", 42);
        assert_eq!(err.to_string(), "alias not found: 42");

        let err = WcError::Collision {
            name: "a.txt".into(),
            existing: "dir/a.txt".into(),
        };
        assert!(err.to_string().contains("collides"));
        assert!(err.is_collision());

        let err = ConfigError::InvalidValue {
            field: "merge.default_tool".into(),
            detail: "unknown tool".into(),
        };
        assert!(err.to_string().contains("merge.default_tool"));
    }

    #[test]
    fn test_busy_is_remapped() {
        let sqlite_err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".into()),
        );
        let err: WcError = DatabaseError::from(sqlite_err).into();
        assert!(err.is_busy());
    }

    #[test]
    fn test_no_such_table_detection() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        let err = conn.prepare("SELECT * FROM issue").unwrap_err();
        assert!(is_no_such_table(&err));

        let other = rusqlite::Error::QueryReturnedNoRows;
        assert!(!is_no_such_table(&other));
    }
}
