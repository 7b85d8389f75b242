//! Accepting values and running manual merges.

use std::fs;
use std::io;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::config::META_DIR_NAME;
use crate::errors::WcError;
use crate::journal::{ContentSource, JournalOp};
use crate::models::{gid7, Alias, EntryType};
use crate::resolve::{
    Choice, MergeInputs, MergeOutcome, MergeRecord, ResolveItem, ResolveValue, SavedRecord,
    ValueData, ValueOrigin, LABEL_WORKING,
};
use crate::status::{ConflictAxis, StatusFlags};
use crate::tx::Transaction;

impl Transaction<'_> {
    /// Resolve one axis of a conflicted item by accepting the value labelled
    /// `label`. The working copy is changed to match the value; uncommitted
    /// edits that would be overwritten are saved first.
    pub fn resolve_accept(
        &mut self,
        alias: Alias,
        axis: ConflictAxis,
        label: &str,
    ) -> Result<(), WcError> {
        self.ensure_mutable()?;
        self.settle_collapsed(alias)?;
        let item = self.resolve_item(alias)?;
        let choice = item
            .choice(axis)
            .ok_or_else(|| WcError::not_found("choice", format!("{axis} of {}", item.path)))?;
        let (_, value) = choice
            .value(label)
            .ok_or_else(|| WcError::not_found("value", format!("{label} for {axis} of {}", item.path)))?;
        if !value.is_usable() {
            return Err(WcError::InvalidState(format!(
                "'{label}' is the result of a failed merge and cannot be accepted"
            )));
        }
        if choice.accepted.as_deref() == Some(label) {
            return Err(WcError::AlreadyResolved {
                item: item.path.clone(),
                choice: axis.to_string(),
            });
        }
        let value = value.clone();

        let (deleted, lost) = {
            let lvi = self.item(alias)?;
            (lvi.is_deleted(), lvi.is_lost())
        };
        match &value.data {
            ValueData::Existence(false) => {
                if deleted {
                    self.implicit_resolve(alias, &ConflictAxis::ALL)?;
                } else {
                    self.remove(alias, false)?;
                }
            }
            data => {
                if lost {
                    return Err(WcError::InvalidState(format!(
                        "'{}' is missing from the working directory; restore or remove it first",
                        item.path
                    )));
                }
                if deleted {
                    let source = restore_source(&item, label);
                    self.undo_delete(alias, source)?;
                }
                if axis == ConflictAxis::Contents {
                    self.save_working_if_edited(alias, &item, choice, label)?;
                }
                if !matches!(data, ValueData::Existence(_)) {
                    self.apply_value(alias, &item, &value)?;
                }
            }
        }

        self.mark_accepted(alias, axis, label)?;
        let restored = matches!(value.data, ValueData::Existence(true));
        if restored || axis == ConflictAxis::Location {
            self.implicit_unmangle(alias, &item)?;
        }
        info!(alias = %alias, axis = %axis, label, "accepted value");
        Ok(())
    }

    fn apply_value(
        &mut self,
        alias: Alias,
        item: &ResolveItem,
        value: &ResolveValue,
    ) -> Result<(), WcError> {
        match &value.data {
            ValueData::Existence(_) => Ok(()),
            ValueData::Name(name) => self.rename(alias, name),
            ValueData::Location(gid_parent) => {
                let parent = self
                    .wc
                    .db()
                    .alias_of_gid(gid_parent)?
                    .ok_or_else(|| WcError::not_found("parent directory", gid_parent))?;
                self.move_item(alias, parent)
            }
            ValueData::Attributes(bits) => {
                if self.current_attrbits(alias)? != *bits {
                    self.set_attrbits(alias, *bits)?;
                }
                Ok(())
            }
            ValueData::Contents(hid) => match item.entry_type {
                EntryType::Directory => Err(WcError::InvalidState(format!(
                    "directory '{}' cannot have a contents conflict",
                    item.path
                ))),
                EntryType::Submodule => {
                    Err(WcError::NotImplemented("resolving submodule contents".into()))
                }
                _ if self.current_hid(alias)? == *hid => Ok(()),
                entry_type => {
                    let source = value
                        .backing
                        .clone()
                        .unwrap_or_else(|| ContentSource::Blob(hid.clone()));
                    if entry_type == EntryType::Symlink {
                        let target = self.source_text(&source)?;
                        self.overwrite_symlink(alias, &target)
                    } else {
                        self.overwrite_file(alias, source)
                    }
                }
            },
        }
    }

    /// Copy the working file aside when it carries edits that accepting
    /// `label` would overwrite.
    fn save_working_if_edited(
        &mut self,
        alias: Alias,
        item: &ResolveItem,
        choice: &Choice,
        label: &str,
    ) -> Result<(), WcError> {
        if label == LABEL_WORKING || item.entry_type != EntryType::File {
            return Ok(());
        }
        let Some((idx, working)) = choice.working() else {
            return Ok(());
        };
        let is_leaf = choice.leaves.as_ref().map_or(false, |l| l.contains(&idx));
        let edited = working
            .parents
            .first()
            .map_or(true, |&p| choice.values[p].data != working.data);
        if !is_leaf || !edited {
            return Ok(());
        }

        let bytes = self.current_content(alias)?;
        let hid = self.wc.blobs().store(&bytes)?;
        let count = self
            .item(alias)?
            .issue()
            .map(|i| i.resolve.saved.len())
            .unwrap_or(0);
        let saved_label = format!("saved{}", count + 1);
        let path = PathBuf::from(META_DIR_NAME)
            .join("tmp")
            .join("resolve")
            .join(&item.gid)
            .join(&saved_label);
        self.journal.push(JournalOp::WriteFile {
            path: path.clone(),
            source: ContentSource::Blob(hid.clone()),
            attrbits: None,
        });
        if let Some(issue) = self.item_mut(alias)?.issue_mut() {
            issue.resolve.saved.push(SavedRecord {
                label: saved_label.clone(),
                hid,
                path: path.to_string_lossy().into_owned(),
            });
        }
        info!(alias = %alias, label = %saved_label, path = %path.display(), "saved working copy");
        Ok(())
    }

    fn mark_accepted(&mut self, alias: Alias, axis: ConflictAxis, label: &str) -> Result<(), WcError> {
        self.load_issue(alias)?;
        let issue = self
            .item_mut(alias)?
            .issue_mut()
            .ok_or_else(|| WcError::not_found("issue for item", alias))?;
        issue.status_flags.remove(axis.xu());
        issue.status_flags.insert(axis.xr());
        if !issue.status_flags.intersects(StatusFlags::XU_MASK) {
            issue.status_flags.remove(StatusFlags::X_UNRESOLVED);
            issue.status_flags.insert(StatusFlags::X_RESOLVED);
        }
        issue.resolve.record_accept(axis, Some(label.to_string()));
        self.persist_issue(alias)
    }

    /// Rename an item the merge parked under `name~gid7` back to its
    /// original name, unless the user renamed it already or still has a
    /// name choice to make.
    fn implicit_unmangle(&mut self, alias: Alias, item: &ResolveItem) -> Result<(), WcError> {
        if item.choice(ConflictAxis::Name).is_some() {
            return Ok(());
        }
        let mangled = &item.doc.output.entryname;
        if mangled.is_empty() || self.item(alias)?.current_name() != mangled {
            return Ok(());
        }
        let original = match &item.doc.restore_original_name {
            Some(name) => Some(name.clone()),
            None => mangled
                .strip_suffix(&format!("~{}", gid7(&item.gid)))
                .map(str::to_string),
        };
        match original {
            Some(original) if !original.is_empty() && original != *mangled => {
                debug!(alias = %alias, from = %mangled, to = %original, "unmangling name");
                self.rename(alias, &original)
            }
            _ => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // merge
    // -----------------------------------------------------------------------

    /// Merge two leaf values of an item's contents choice with `tool` (or
    /// the tool selected for the item). The result is recorded as a new
    /// value whatever the outcome; only clean results become leaves.
    /// Returns the new value's label.
    pub fn resolve_merge(
        &mut self,
        alias: Alias,
        baseline_label: &str,
        other_label: &str,
        tool: Option<&str>,
    ) -> Result<String, WcError> {
        self.ensure_mutable()?;
        let item = self.resolve_item(alias)?;
        let choice = item
            .choice(ConflictAxis::Contents)
            .filter(|c| c.is_mergeable())
            .ok_or_else(|| {
                WcError::InvalidState(format!("'{}' has no mergeable contents choice", item.path))
            })?;
        let leaves = choice.leaves.clone().unwrap_or_default();
        let pick = |label: &str| -> Result<usize, WcError> {
            let (idx, _) = choice
                .value(label)
                .ok_or_else(|| WcError::not_found("value", label))?;
            if !leaves.contains(&idx) {
                return Err(WcError::InvalidState(format!(
                    "'{label}' has already been merged or is unusable"
                )));
            }
            Ok(idx)
        };
        let a = pick(baseline_label)?;
        let b = pick(other_label)?;

        let ancestor_bytes = match choice.common_ancestor(a, b) {
            Some(idx) => self.value_bytes(alias, &choice.values[idx])?,
            None => Vec::new(),
        };
        let a_bytes = self.value_bytes(alias, &choice.values[a])?;
        let b_bytes = self.value_bytes(alias, &choice.values[b])?;

        let count = self
            .item(alias)?
            .issue()
            .map(|i| i.resolve.merges.len())
            .unwrap_or(0);
        let merge_label = format!("merge{}", count + 1);
        let work_dir = self
            .wc
            .tmp_dir()
            .join("resolve")
            .join(&item.gid)
            .join(&merge_label);
        fs::create_dir_all(&work_dir)?;
        let ancestor = work_dir.join("ancestor");
        let baseline = work_dir.join("baseline");
        let other = work_dir.join("other");
        let result = work_dir.join("result");
        fs::write(&ancestor, &ancestor_bytes)?;
        fs::write(&baseline, &a_bytes)?;
        fs::write(&other, &b_bytes)?;
        // A cancelled earlier run may have left a result behind.
        if let Err(e) = fs::remove_file(&result) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(e.into());
            }
        }

        let registry = self.wc.merge_tools();
        let entryname = self.item(alias)?.current_name().to_string();
        let tool = tool
            .map(str::to_string)
            .unwrap_or_else(|| registry.select(&entryname, &a_bytes).to_string());
        let outcome = registry.run(
            &tool,
            &MergeInputs {
                ancestor: &ancestor,
                baseline: &baseline,
                other: &other,
                result: &result,
            },
        )?;
        let hid = match outcome {
            MergeOutcome::Failed => None,
            _ if result.exists() => Some(self.wc.blobs().store_file(&result)?),
            _ => None,
        };

        let record = MergeRecord {
            label: merge_label.clone(),
            baseline: baseline_label.to_string(),
            other: other_label.to_string(),
            tool: tool.clone(),
            outcome,
            hid,
        };
        if let Some(issue) = self.item_mut(alias)?.issue_mut() {
            issue.resolve.merges.push(record);
        }
        self.persist_issue(alias)?;
        info!(alias = %alias, label = %merge_label, tool = %tool, outcome = ?outcome, "recorded merge");
        Ok(merge_label)
    }

    fn value_bytes(&mut self, alias: Alias, value: &ResolveValue) -> Result<Vec<u8>, WcError> {
        if value.origin == ValueOrigin::Working {
            return self.current_content(alias);
        }
        match &value.backing {
            Some(ContentSource::Blob(hid)) => Ok(self.wc.blobs().fetch(hid)?),
            Some(ContentSource::TempFile(path)) => Ok(fs::read(path)?),
            None => Err(WcError::not_found("content for value", &value.label)),
        }
    }
}

/// Content to re-create a deleted item from when accepting `label`: the
/// contents value with the same label, if there is one.
fn restore_source(item: &ResolveItem, label: &str) -> Option<ContentSource> {
    item.choice(ConflictAxis::Contents)
        .and_then(|c| c.value(label))
        .and_then(|(_, v)| v.backing.clone())
}
