//! The apply driver: replays the journal into the working directory and the
//! row store, then commits the store transaction.
//!
//! Ops replay strictly in queue order. Filesystem ops are not undone when a
//! later op fails; the row store is rolled back to its state before the
//! transaction began and the next status run re-derives the truth from disk.

use std::fs;
use std::io;

use tracing::{debug, error, info, instrument, warn};

use crate::errors::WcError;
use crate::journal::{ContentSource, JournalOp};
use crate::models::BASELINE_LABEL;
use crate::tx::Transaction;
use crate::workdir::{remove_entry, set_attrbits, write_file, write_symlink};

/// Counts reported by a successful [`Transaction::apply`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub filesystem_ops: usize,
    pub row_ops: usize,
    pub timestamps_recorded: usize,
    pub tmp_gids_purged: usize,
}

impl Transaction<'_> {
    /// Replay every queued op and commit. The transaction ends either way;
    /// on failure the row store is left exactly as it was at `begin`.
    #[instrument(skip(self), fields(queued = self.journal.len()))]
    pub fn apply(mut self) -> Result<ApplySummary, WcError> {
        let ops = self.journal.take();
        match self.replay(&ops) {
            Ok(summary) => {
                self.finish_committed();
                info!(
                    filesystem_ops = summary.filesystem_ops,
                    row_ops = summary.row_ops,
                    "transaction applied"
                );
                Ok(summary)
            }
            Err(e) => {
                error!(error = %e, "apply failed, rolling back row store");
                self.abort();
                Err(e)
            }
        }
    }

    fn replay(&mut self, ops: &[JournalOp]) -> Result<ApplySummary, WcError> {
        let mut summary = ApplySummary::default();
        for (seq, op) in ops.iter().enumerate() {
            debug!(seq, kind = op.kind(), "replaying");
            if op.is_filesystem() {
                self.apply_filesystem_op(op)?;
                summary.filesystem_ops += 1;
            } else {
                self.apply_row_op(op)?;
                summary.row_ops += 1;
            }
        }

        let db = self.wc.db();
        let fresh = std::mem::take(&mut self.fresh_timestamps);
        for entry in &fresh {
            let untouched = self.items.get(&entry.alias).map_or(false, |item| {
                item.is_controlled()
                    && item.materialized
                    && item.overwrite.hid.is_none()
                    && !item.is_deleted()
            });
            if untouched {
                db.upsert_timestamp(entry)?;
                summary.timestamps_recorded += 1;
            }
        }

        summary.tmp_gids_purged = db.settle_tmp_gids(BASELINE_LABEL)?;
        db.commit()?;
        Ok(summary)
    }

    fn apply_filesystem_op(&self, op: &JournalOp) -> Result<(), WcError> {
        let root = self.wc.root();
        match op {
            JournalOp::Mkdir { path } => fs::create_dir_all(root.join(path))?,
            JournalOp::MoveRename { from, to } => {
                let to = root.join(to);
                if let Some(parent) = to.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(root.join(from), to)?;
            }
            JournalOp::Remove {
                path,
                entry_type,
                recursive,
            } => match remove_entry(&root.join(path), *entry_type, *recursive) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    warn!(path = %path.display(), "already gone");
                }
                Err(e) => return Err(e.into()),
            },
            JournalOp::WriteFile {
                path,
                source,
                attrbits,
            } => {
                let abs = root.join(path);
                let bytes = match source {
                    ContentSource::Blob(hid) => self.wc.blobs().fetch(hid)?,
                    ContentSource::TempFile(tmp) => fs::read(tmp)?,
                };
                write_file(&abs, &bytes)?;
                if let Some(bits) = attrbits {
                    set_attrbits(&abs, *bits)?;
                }
            }
            JournalOp::WriteSymlink { path, target } => write_symlink(&root.join(path), target)?,
            JournalOp::SetAttrbits { path, attrbits } => set_attrbits(&root.join(path), *attrbits)?,
            other => {
                return Err(WcError::InvalidState(format!(
                    "{} is not a filesystem op",
                    other.kind()
                )))
            }
        }
        Ok(())
    }

    fn apply_row_op(&self, op: &JournalOp) -> Result<(), WcError> {
        let db = self.wc.db();
        match op {
            JournalOp::StorePendingChange(pc) => db.upsert_pending_change(pc)?,
            JournalOp::DeletePendingChange(alias) => db.delete_pending_change(*alias)?,
            JournalOp::UpdateIssue {
                alias,
                status_flags,
                resolve_json,
            } => db.update_issue(*alias, *status_flags, resolve_json.as_deref())?,
            JournalOp::ReplaceBaseline {
                rows,
                cset_hash,
                super_root_hash,
            } => {
                db.replace_tree(BASELINE_LABEL, rows)?;
                db.upsert_cset(BASELINE_LABEL, Some(cset_hash), Some(super_root_hash))?;
            }
            JournalOp::ClearPendingChanges => db.clear_pending_changes()?,
            JournalOp::DropIssueTable => db.drop_issue_table()?,
            other => {
                return Err(WcError::InvalidState(format!(
                    "{} is not a row-store op",
                    other.kind()
                )))
            }
        }
        Ok(())
    }
}
