//! The in-memory journal of queued operations.
//!
//! Every mutation made through a transaction appends one or more
//! [`JournalOp`]s. Nothing touches the filesystem or the row store until the
//! apply driver replays the journal in order. Paths are relative to the
//! working-copy root and are recorded as the item's live path at queue time,
//! which is exactly where the item will be on disk when the op is replayed.

use std::path::PathBuf;

use tracing::debug;

use crate::models::{Alias, EntryType, PcRow, TreeRow};

/// Where the bytes of a queued write come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentSource {
    /// A blob already in the content store.
    Blob(String),
    /// A caller-supplied file, read at apply time.
    TempFile(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub enum JournalOp {
    // -- filesystem --------------------------------------------------------
    Mkdir {
        path: PathBuf,
    },
    MoveRename {
        from: PathBuf,
        to: PathBuf,
    },
    Remove {
        path: PathBuf,
        entry_type: EntryType,
        recursive: bool,
    },
    WriteFile {
        path: PathBuf,
        source: ContentSource,
        attrbits: Option<u64>,
    },
    WriteSymlink {
        path: PathBuf,
        target: String,
    },
    SetAttrbits {
        path: PathBuf,
        attrbits: u64,
    },

    // -- row store ---------------------------------------------------------
    StorePendingChange(PcRow),
    DeletePendingChange(Alias),
    UpdateIssue {
        alias: Alias,
        status_flags: u64,
        resolve_json: Option<String>,
    },
    ReplaceBaseline {
        rows: Vec<TreeRow>,
        cset_hash: String,
        super_root_hash: String,
    },
    ClearPendingChanges,
    DropIssueTable,
}

impl JournalOp {
    pub fn is_filesystem(&self) -> bool {
        matches!(
            self,
            Self::Mkdir { .. }
                | Self::MoveRename { .. }
                | Self::Remove { .. }
                | Self::WriteFile { .. }
                | Self::WriteSymlink { .. }
                | Self::SetAttrbits { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Mkdir { .. } => "mkdir",
            Self::MoveRename { .. } => "move_rename",
            Self::Remove { .. } => "remove",
            Self::WriteFile { .. } => "write_file",
            Self::WriteSymlink { .. } => "write_symlink",
            Self::SetAttrbits { .. } => "set_attrbits",
            Self::StorePendingChange(_) => "store_pending_change",
            Self::DeletePendingChange(_) => "delete_pending_change",
            Self::UpdateIssue { .. } => "update_issue",
            Self::ReplaceBaseline { .. } => "replace_baseline",
            Self::ClearPendingChanges => "clear_pending_changes",
            Self::DropIssueTable => "drop_issue_table",
        }
    }
}

/// Ordered list of queued operations.
#[derive(Debug, Default)]
pub struct Journal {
    ops: Vec<JournalOp>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: JournalOp) {
        debug!(seq = self.ops.len(), kind = op.kind(), "journal append");
        self.ops.push(op);
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JournalOp> {
        self.ops.iter()
    }

    /// Hand the ops to the apply driver, leaving the journal empty.
    pub fn take(&mut self) -> Vec<JournalOp> {
        std::mem::take(&mut self.ops)
    }

    pub fn clear(&mut self) {
        self.ops.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_take_preserves_order() {
        let mut journal = Journal::new();
        journal.push(JournalOp::Mkdir { path: "a".into() });
        journal.push(JournalOp::DeletePendingChange(Alias(5)));
        journal.push(JournalOp::ClearPendingChanges);
        assert_eq!(journal.len(), 3);

        let kinds: Vec<&str> = journal.iter().map(JournalOp::kind).collect();
        assert_eq!(kinds, ["mkdir", "delete_pending_change", "clear_pending_changes"]);

        let ops = journal.take();
        assert!(ops[0].is_filesystem());
        assert!(!ops[1].is_filesystem());
        assert!(journal.is_empty());
    }
}
