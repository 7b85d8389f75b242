//! Committing the live view as the new baseline.
//!
//! Every directory gets a candidate node: the rows of its live, controlled
//! children plus a hash over them. Hashes bubble up from the leaves, and a
//! directory whose children are exactly its baseline children keeps its
//! baseline hash. The resulting rows replace `tree_L0` when the journal is
//! applied.

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::errors::WcError;
use crate::journal::JournalOp;
use crate::models::{Alias, EntryType, TreeRow, BASELINE_LABEL};
use crate::prescan::ScanClass;
use crate::status::StatusFlags;
use crate::tx::Transaction;

/// Hash of a directory over `(gid, row)` pairs for its children. The empty
/// directory hashes the empty string.
pub fn directory_hash(entries: &[(String, TreeRow)]) -> String {
    let mut lines: Vec<String> = entries
        .iter()
        .map(|(gid, row)| {
            format!(
                "{} {} {} {} {}\n",
                row.name,
                gid,
                row.entry_type.as_i64(),
                row.attrbits,
                row.content_hash
            )
        })
        .collect();
    lines.sort();
    let mut hasher = Sha256::new();
    for line in &lines {
        hasher.update(line.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// In-memory tree node built for one directory at commit time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateNode {
    /// Rows of the directory's children in the new baseline.
    pub rows: Vec<TreeRow>,
    pub hash: String,
}

/// What [`Transaction::commit_baseline`] queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    /// Rows in the new baseline, root included.
    pub rows: usize,
    pub root_hash: String,
    pub cset_hash: String,
}

impl Transaction<'_> {
    /// Queue replacing the baseline with the live view. Fails while any
    /// issue is unresolved or any controlled item is lost. Afterwards the
    /// transaction is sealed: only `apply` or `cancel` remain.
    pub fn commit_baseline(&mut self) -> Result<CommitSummary, WcError> {
        self.ensure_mutable()?;
        self.check_no_unresolved()?;

        let root = self.root;
        let mut rows = Vec::new();
        let root_hash = self.build_candidate(root, &mut rows)?;

        let root_row = {
            let item = self.item(root)?;
            let tree = item
                .scan
                .tree
                .clone()
                .ok_or_else(|| WcError::not_found("baseline row for root", root))?;
            TreeRow {
                content_hash: root_hash.clone(),
                ..tree
            }
        };
        rows.insert(0, root_row);

        let previous = self
            .wc
            .db()
            .get_cset(BASELINE_LABEL)?
            .and_then(|c| c.cset_hash)
            .unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(previous.as_bytes());
        hasher.update(b"\n");
        hasher.update(root_hash.as_bytes());
        let cset_hash = hex::encode(hasher.finalize());

        let summary = CommitSummary {
            rows: rows.len(),
            root_hash: root_hash.clone(),
            cset_hash: cset_hash.clone(),
        };
        self.journal.push(JournalOp::ReplaceBaseline {
            rows,
            cset_hash,
            super_root_hash: root_hash,
        });
        self.journal.push(JournalOp::ClearPendingChanges);
        self.journal.push(JournalOp::DropIssueTable);
        self.sealed = true;
        info!(rows = summary.rows, root_hash = %summary.root_hash, "queued baseline commit");
        Ok(summary)
    }

    fn check_no_unresolved(&mut self) -> Result<(), WcError> {
        for alias in self.wc.db().list_issue_aliases()? {
            match self.ensure_item(alias) {
                Ok(()) => {}
                Err(WcError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
            self.load_issue(alias)?;
            let unresolved = self
                .item(alias)?
                .issue()
                .map_or(false, |i| i.status_flags.contains(StatusFlags::X_UNRESOLVED));
            if unresolved {
                return Err(WcError::InvalidState(format!(
                    "'{}' has unresolved conflicts",
                    self.path_string(alias)?
                )));
            }
        }
        Ok(())
    }

    /// Build the candidate node for `dir`, appending every row below it to
    /// `rows`. Returns the directory's hash.
    fn build_candidate(&mut self, dir: Alias, rows: &mut Vec<TreeRow>) -> Result<String, WcError> {
        let mut children = Vec::new();
        for child in self.residents(dir)? {
            let (class, deleted, entry_type, gid) = {
                let item = self.item(child)?;
                (item.class, item.is_deleted(), item.entry_type, item.gid().to_string())
            };
            if deleted || !class.is_controlled() {
                continue;
            }
            if class == ScanClass::ControlledLost {
                return Err(WcError::InvalidState(format!(
                    "'{}' is missing from the working directory",
                    self.path_string(child)?
                )));
            }

            let content_hash = match entry_type {
                EntryType::Directory if class == ScanClass::ControlledSparse => {
                    self.carry_sparse_subtree(child, rows)?
                }
                EntryType::Directory => self.build_candidate(child, rows)?,
                EntryType::Submodule => self.current_hid(child)?,
                _ if class == ScanClass::ControlledSparse => self.current_hid(child)?,
                _ => self.store_current_content(child)?,
            };
            let attrbits = match entry_type {
                EntryType::Directory if class == ScanClass::ControlledSparse => {
                    self.original_attrbits(child)?
                }
                _ => self.current_attrbits(child)?,
            };
            let item = self.item(child)?;
            let row = TreeRow {
                alias: child,
                parent_alias: dir,
                content_hash,
                entry_type,
                attrbits,
                name: item.current_name().to_string(),
            };
            children.push((gid, row));
        }

        let unchanged = {
            let item = self.item(dir)?;
            match &item.scan.tree {
                Some(tree) if tree.entry_type == EntryType::Directory => {
                    let mut baseline = self.wc.db().list_tree_children(BASELINE_LABEL, dir)?;
                    baseline.sort_by_key(|r| r.alias);
                    let mut live: Vec<&TreeRow> = children.iter().map(|(_, r)| r).collect();
                    live.sort_by_key(|r| r.alias);
                    (baseline.len() == live.len()
                        && baseline.iter().zip(&live).all(|(a, b)| a == *b))
                    .then(|| tree.content_hash.clone())
                }
                _ => None,
            }
        };
        let reused = unchanged.is_some();
        let hash = match unchanged {
            Some(hash) => hash,
            None => directory_hash(&children),
        };
        debug!(dir = %dir, children = children.len(), unchanged = reused, "built candidate node");

        let node_rows: Vec<TreeRow> = children.into_iter().map(|(_, row)| row).collect();
        rows.extend(node_rows.iter().cloned());
        self.dir_mut(dir)?.candidate = Some(CandidateNode {
            rows: node_rows,
            hash: hash.clone(),
        });
        Ok(hash)
    }

    /// Store the live content of a file or symlink and return its hash.
    fn store_current_content(&mut self, alias: Alias) -> Result<String, WcError> {
        let hid = self.current_hid(alias)?;
        if self.wc.blobs().contains(&hid) {
            return Ok(hid);
        }
        let bytes = self.current_content(alias)?;
        Ok(self.wc.blobs().store(&bytes)?)
    }

    /// A sparse directory is not on disk; its baseline subtree is carried
    /// into the new baseline as is.
    fn carry_sparse_subtree(&mut self, dir: Alias, rows: &mut Vec<TreeRow>) -> Result<String, WcError> {
        let db = self.wc.db();
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            for row in db.list_tree_children(BASELINE_LABEL, current)? {
                if row.entry_type == EntryType::Directory {
                    stack.push(row.alias);
                }
                rows.push(row);
            }
        }
        let item = self.item(dir)?;
        item.baseline_row()
            .map(|t| t.content_hash.clone())
            .ok_or_else(|| WcError::not_found("baseline row for sparse directory", dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(alias: i64, name: &str, hash: &str) -> TreeRow {
        TreeRow {
            alias: Alias(alias),
            parent_alias: Alias(2),
            content_hash: hash.into(),
            entry_type: EntryType::File,
            attrbits: 0,
            name: name.into(),
        }
    }

    #[test]
    fn test_directory_hash_is_order_independent() {
        let a = ("ga".to_string(), row(3, "a", "h1"));
        let b = ("gb".to_string(), row(4, "b", "h2"));
        assert_eq!(
            directory_hash(&[a.clone(), b.clone()]),
            directory_hash(&[b.clone(), a.clone()])
        );
        assert_ne!(directory_hash(&[a.clone()]), directory_hash(&[a, b]));
    }

    #[test]
    fn test_empty_directory_hash() {
        assert_eq!(directory_hash(&[]), crate::blobstore::hash_bytes(b""));
    }

    #[test]
    fn test_directory_hash_sees_renames() {
        let before = [("ga".to_string(), row(3, "a", "h1"))];
        let after = [("ga".to_string(), row(3, "z", "h1"))];
        assert_ne!(directory_hash(&before), directory_hash(&after));
    }
}
