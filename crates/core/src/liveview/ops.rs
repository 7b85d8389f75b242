//! Queued mutations on liveview items.
//!
//! Each operation validates against the live view, updates the item's
//! pending-change row in memory, appends journal entries for the eventual
//! filesystem and row-store effects, and implicitly resolves matching
//! conflict axes on items with an open issue.

use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::blobstore::{hash_bytes, hash_file};
use crate::errors::WcError;
use crate::journal::{ContentSource, JournalOp};
use crate::liveview::{IssueSlot, ItemIssue, LiveViewItem};
use crate::models::{gid7, Alias, EntryType, IssueDoc, PcFlags, PcRow};
use crate::prescan::{synthesize_uncontrolled, PrescanRow, ScanClass};
use crate::resolve::ResolveDoc;
use crate::status::{ConflictAxis, StatusFlags};
use crate::tx::Transaction;

/// Highest counter tried for a parked name.
const MAX_PARK_ATTEMPTS: u32 = 100;

/// Which flow created an add-special item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddSpecialKind {
    Merge,
    Update,
}

impl AddSpecialKind {
    fn flag(self) -> PcFlags {
        match self {
            Self::Merge => PcFlags::ADD_SPECIAL_MERGE,
            Self::Update => PcFlags::ADD_SPECIAL_UPDATE,
        }
    }
}

/// An item brought into the working copy by a merge or update.
#[derive(Debug, Clone)]
pub struct AddSpecial {
    pub gid: String,
    pub parent: Alias,
    pub name: String,
    pub entry_type: EntryType,
    /// File content; required for files.
    pub content: Option<ContentSource>,
    /// Link target; required for symlinks.
    pub symlink_target: Option<String>,
    pub attrbits: u64,
    pub kind: AddSpecialKind,
}

/// Name used for an item parked out of a colliding slot.
pub fn parked_name(gid: &str, counter: u32) -> String {
    format!(".park.{}.{:02}", gid7(gid), counter)
}

impl Transaction<'_> {
    // -----------------------------------------------------------------------
    // add
    // -----------------------------------------------------------------------

    /// Put an uncontrolled item under version control. With `recursive`,
    /// uncontrolled descendants of a directory are added too, except those
    /// matching an ignore pattern. Returns the number of items added.
    pub fn add(&mut self, alias: Alias, recursive: bool) -> Result<usize, WcError> {
        self.ensure_mutable()?;
        self.ensure_item(alias)?;
        let (class, entry_type) = {
            let item = self.item(alias)?;
            (item.class, item.entry_type)
        };

        let mut added = 0;
        match class {
            ScanClass::Reserved => return Err(WcError::Reserved(self.path_string(alias)?)),
            ScanClass::UncontrolledUnqualified => {
                self.add_one(alias)?;
                added += 1;
            }
            _ if !recursive || entry_type != EntryType::Directory => {
                debug!(alias = %alias, "already controlled");
                return Ok(0);
            }
            _ => {}
        }

        if recursive && entry_type == EntryType::Directory {
            for child in self.residents(alias)? {
                let child_class = self.item(child)?.class;
                match child_class {
                    ScanClass::Reserved => continue,
                    ScanClass::UncontrolledUnqualified if self.is_ignored(child)? => {
                        debug!(alias = %child, "skipping ignored item");
                        continue;
                    }
                    _ => added += self.add(child, true)?,
                }
            }
        }
        Ok(added)
    }

    fn add_one(&mut self, alias: Alias) -> Result<(), WcError> {
        let (name, parent, entry_type) = {
            let item = self.item(alias)?;
            (
                item.current_name().to_string(),
                item.current_parent(),
                item.entry_type,
            )
        };
        self.wc.names().validate_entryname(&name)?;

        let item = self.item_mut(alias)?;
        item.class = ScanClass::ControlledActive;
        item.pc = Some(PcRow {
            alias,
            parent_alias: parent,
            name,
            entry_type,
            flags: PcFlags::ADDED,
            merge_content_hash: None,
            sparse: None,
        });
        self.store_pc(alias)?;
        debug!(alias = %alias, "added");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // remove
    // -----------------------------------------------------------------------

    /// Remove a controlled item. Baseline items are marked deleted; items
    /// added in a pending change disappear entirely. With `keep` nothing is
    /// deleted on disk and the item reappears as an uncontrolled entry under
    /// a new alias.
    pub fn remove(&mut self, alias: Alias, keep: bool) -> Result<(), WcError> {
        self.ensure_mutable()?;
        self.ensure_item(alias)?;
        if alias == self.root {
            return Err(WcError::InvalidState("the root cannot be removed".into()));
        }
        let (class, deleted, parent) = {
            let item = self.item(alias)?;
            (item.class, item.is_deleted(), item.current_parent())
        };
        match class {
            ScanClass::Reserved => return Err(WcError::Reserved(self.path_string(alias)?)),
            ScanClass::UncontrolledUnqualified => {
                return Err(WcError::InvalidState(format!(
                    "'{}' is not under version control",
                    self.path_string(alias)?
                )))
            }
            _ => {}
        }
        if deleted {
            return Err(WcError::InvalidState(format!(
                "'{}' is already deleted",
                self.path_string(alias)?
            )));
        }

        let kept_entry = if keep { self.kept_disk_entry(alias)? } else { None };
        self.remove_controlled(alias, keep)?;
        self.implicit_resolve(alias, &ConflictAxis::ALL)?;

        if let Some((entry, disk_path)) = kept_entry {
            let row = synthesize_uncontrolled(self.wc.db(), self.wc.names(), parent, entry)?;
            let new_alias = row.alias;
            let mut item = LiveViewItem::from_scan(row, None);
            item.disk_path = Some(disk_path);
            self.items.insert(new_alias, item);
            self.dir_mut(parent)?.residents.insert(new_alias);
            debug!(alias = %alias, new_alias = %new_alias, "kept on disk as uncontrolled");
        }
        Ok(())
    }

    /// Disk entry to re-surface after a keep-remove, if the item is on disk.
    fn kept_disk_entry(
        &mut self,
        alias: Alias,
    ) -> Result<Option<(crate::workdir::DiskEntry, PathBuf)>, WcError> {
        let item = self.item(alias)?;
        if !item.materialized {
            return Ok(None);
        }
        let (Some(disk), Some(path)) = (item.scan.disk.clone(), item.disk_path.clone()) else {
            return Ok(None);
        };
        let mut entry = disk;
        entry.name = item.current_name().to_string();
        Ok(Some((entry, path)))
    }

    fn remove_controlled(&mut self, alias: Alias, keep: bool) -> Result<(), WcError> {
        let (entry_type, materialized) = {
            let item = self.item(alias)?;
            (item.entry_type, item.materialized)
        };

        if entry_type == EntryType::Directory {
            for child in self.residents(alias)? {
                let (class, deleted) = {
                    let c = self.item(child)?;
                    (c.class, c.is_deleted())
                };
                match class {
                    _ if deleted => {}
                    c if c.is_controlled() => self.remove_controlled(child, keep)?,
                    _ if keep => {}
                    ScanClass::UncontrolledUnqualified if self.is_ignored(child)? => {}
                    _ => {
                        return Err(WcError::InvalidState(format!(
                            "'{}' contains uncontrolled item '{}'",
                            self.path_string(alias)?,
                            self.path_string(child)?
                        )))
                    }
                }
            }
        }

        if materialized && !keep {
            let path = self.current_path(alias)?;
            self.journal.push(JournalOp::Remove {
                path,
                entry_type,
                recursive: entry_type == EntryType::Directory,
            });
        }

        let item = self.item_mut(alias)?;
        item.materialized = false;
        item.cached_hid = None;
        item.overwrite = Default::default();
        let parent = item.current_parent();

        match item.scan.tree.clone() {
            Some(tree) => {
                let pc = item.pc.get_or_insert_with(|| PcRow::from_tree(&tree));
                pc.flags.remove(PcFlags::SPARSE);
                pc.sparse = None;
                pc.flags.insert(PcFlags::DELETED);
                item.class = ScanClass::ControlledActive;
                self.store_pc(alias)?;
                debug!(alias = %alias, "marked deleted");
            }
            None => {
                item.pc = None;
                self.journal.push(JournalOp::DeletePendingChange(alias));
                self.dir_mut(parent)?.residents.remove(&alias);
                self.items.remove(&alias);
                debug!(alias = %alias, "dropped pending add");
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // rename / move
    // -----------------------------------------------------------------------

    /// Rename an item within its directory. Renaming to the current name
    /// changes nothing.
    pub fn rename(&mut self, alias: Alias, new_name: &str) -> Result<(), WcError> {
        self.ensure_mutable()?;
        self.check_structural_target(alias)?;
        self.wc.names().validate_entryname(new_name)?;

        let (current, parent, materialized) = {
            let item = self.item(alias)?;
            (
                item.current_name().to_string(),
                item.current_parent(),
                item.materialized,
            )
        };
        if current == new_name {
            debug!(alias = %alias, name = new_name, "rename to current name");
            return Ok(());
        }
        self.check_name_free(parent, new_name, alias)?;

        if materialized {
            let from = self.current_path(alias)?;
            let to = self.current_path(parent)?.join(new_name);
            self.journal.push(JournalOp::MoveRename { from, to });
        }
        self.pc_for_edit(alias)?.name = new_name.to_string();
        self.store_pc(alias)?;
        self.implicit_resolve(alias, &[ConflictAxis::Name])?;
        debug!(alias = %alias, from = %current, to = new_name, "renamed");
        Ok(())
    }

    /// Move an item into another directory, keeping its name. Moving into
    /// the current parent changes nothing.
    pub fn move_item(&mut self, alias: Alias, new_parent: Alias) -> Result<(), WcError> {
        self.ensure_mutable()?;
        self.check_structural_target(alias)?;
        self.ensure_item(new_parent)?;
        {
            let dest = self.item(new_parent)?;
            if dest.entry_type != EntryType::Directory
                || !dest.is_controlled()
                || dest.is_deleted()
                || dest.is_lost()
            {
                return Err(WcError::InvalidState(format!(
                    "'{}' is not a live controlled directory",
                    self.path_string(new_parent)?
                )));
            }
        }

        let (name, old_parent, materialized, baseline_parent) = {
            let item = self.item(alias)?;
            (
                item.current_name().to_string(),
                item.current_parent(),
                item.materialized,
                item.scan.tree.as_ref().map(|t| t.parent_alias),
            )
        };
        if old_parent == new_parent {
            debug!(alias = %alias, "move to current parent");
            return Ok(());
        }

        let mut cursor = new_parent;
        while cursor != self.root {
            if cursor == alias {
                return Err(WcError::InvalidState(format!(
                    "cannot move '{}' into itself",
                    self.path_string(alias)?
                )));
            }
            self.ensure_item(cursor)?;
            cursor = self.item(cursor)?.current_parent();
        }

        self.check_name_free(new_parent, &name, alias)?;

        if materialized {
            let from = self.current_path(alias)?;
            let to = self.current_path(new_parent)?.join(&name);
            self.journal.push(JournalOp::MoveRename { from, to });
        }

        {
            let old = self.dir_mut(old_parent)?;
            old.residents.remove(&alias);
            if baseline_parent == Some(old_parent) {
                old.moved_out.insert(alias);
            }
        }
        {
            let new = self.dir_mut(new_parent)?;
            new.residents.insert(alias);
            new.moved_out.remove(&alias);
        }

        self.pc_for_edit(alias)?.parent_alias = new_parent;
        self.store_pc(alias)?;
        self.implicit_resolve(alias, &[ConflictAxis::Location])?;
        debug!(alias = %alias, from = %old_parent, to = %new_parent, "moved");
        Ok(())
    }

    fn check_structural_target(&mut self, alias: Alias) -> Result<(), WcError> {
        self.ensure_item(alias)?;
        if alias == self.root {
            return Err(WcError::InvalidState("the root cannot be renamed or moved".into()));
        }
        let (class, deleted) = {
            let item = self.item(alias)?;
            (item.class, item.is_deleted())
        };
        let problem = match class {
            ScanClass::Reserved => return Err(WcError::Reserved(self.path_string(alias)?)),
            ScanClass::UncontrolledUnqualified => Some("is not under version control"),
            _ if deleted => Some("is deleted"),
            _ => None,
        };
        match problem {
            Some(problem) => Err(WcError::InvalidState(format!(
                "'{}' {problem}",
                self.path_string(alias)?
            ))),
            None => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // undo-delete
    // -----------------------------------------------------------------------

    /// Restore a deleted item at its pre-delete name and location. Files
    /// and symlinks are re-created from `source`, or from the baseline
    /// content when `source` is `None`.
    pub fn undo_delete(
        &mut self,
        alias: Alias,
        source: Option<ContentSource>,
    ) -> Result<(), WcError> {
        self.ensure_mutable()?;
        self.ensure_item(alias)?;
        let (deleted, entry_type, name, parent, baseline) = {
            let item = self.item(alias)?;
            (
                item.is_deleted(),
                item.entry_type,
                item.current_name().to_string(),
                item.current_parent(),
                item.baseline_row().cloned(),
            )
        };
        if !deleted {
            return Err(WcError::InvalidState(format!(
                "'{}' is not deleted",
                self.path_string(alias)?
            )));
        }
        self.ensure_item(parent)?;
        if self.item(parent)?.is_deleted() {
            return Err(WcError::InvalidState(format!(
                "parent of '{}' is deleted",
                self.path_string(alias)?
            )));
        }
        self.check_name_free(parent, &name, alias)?;

        let source = source.or_else(|| {
            baseline
                .as_ref()
                .filter(|_| entry_type != EntryType::Directory)
                .map(|t| ContentSource::Blob(t.content_hash.clone()))
        });
        let attrbits = baseline.as_ref().map(|t| t.attrbits).unwrap_or(0);
        let path = self.current_path(alias)?;

        let mut overwrite = crate::liveview::QueuedOverwrite::default();
        match entry_type {
            EntryType::Directory => self.journal.push(JournalOp::Mkdir { path }),
            EntryType::File => {
                let source = source.ok_or_else(|| {
                    WcError::InvalidState(format!("no content to restore item {alias} from"))
                })?;
                overwrite.hid = Some(self.source_hid(&source)?);
                overwrite.attrbits = Some(attrbits);
                overwrite.source = Some(source.clone());
                self.journal.push(JournalOp::WriteFile {
                    path,
                    source,
                    attrbits: Some(attrbits),
                });
            }
            EntryType::Symlink => {
                let source = source.ok_or_else(|| {
                    WcError::InvalidState(format!("no target to restore item {alias} from"))
                })?;
                let target = self.source_text(&source)?;
                overwrite.hid = Some(hash_bytes(target.as_bytes()));
                overwrite.symlink_target = Some(target.clone());
                self.journal.push(JournalOp::WriteSymlink { path, target });
            }
            EntryType::Submodule => {
                return Err(WcError::NotImplemented("restoring a submodule".into()))
            }
        }

        let item = self.item_mut(alias)?;
        item.materialized = true;
        item.class = ScanClass::ControlledActive;
        item.overwrite = overwrite;
        item.cached_hid = None;
        if let Some(pc) = item.pc.as_mut() {
            pc.flags.remove(PcFlags::DELETED);
        }
        self.store_pc(alias)?;
        self.implicit_resolve(alias, &[ConflictAxis::Existence])?;
        debug!(alias = %alias, "undeleted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // add-special
    // -----------------------------------------------------------------------

    /// Queue an item created by a merge or update. If the destination name
    /// is taken the item is parked under `.park.<gid7>.NN` instead.
    pub fn add_special(&mut self, spec: AddSpecial) -> Result<Alias, WcError> {
        self.ensure_mutable()?;
        let alias = self.wc.db().get_or_create_alias(&spec.gid)?;
        if self.items.contains_key(&alias) {
            return Err(WcError::InvalidState(format!(
                "item {} is already in the working copy",
                spec.gid
            )));
        }
        self.ensure_dir(spec.parent)?;
        self.wc.names().validate_entryname(&spec.name)?;

        let name = match self.check_name_free(spec.parent, &spec.name, alias) {
            Ok(()) => spec.name.clone(),
            Err(err) if err.is_collision() => self.find_parking_slot(&spec, err)?,
            Err(err) => return Err(err),
        };
        let path = self.current_path(spec.parent)?.join(&name);

        let mut overwrite = crate::liveview::QueuedOverwrite {
            attrbits: Some(spec.attrbits),
            ..Default::default()
        };
        match spec.entry_type {
            EntryType::Directory => self.journal.push(JournalOp::Mkdir { path }),
            EntryType::File => {
                let source = spec.content.clone().ok_or_else(|| {
                    WcError::InvalidState(format!("no content for new file {}", spec.gid))
                })?;
                overwrite.hid = Some(self.source_hid(&source)?);
                overwrite.source = Some(source.clone());
                self.journal.push(JournalOp::WriteFile {
                    path,
                    source,
                    attrbits: Some(spec.attrbits),
                });
            }
            EntryType::Symlink => {
                let target = spec.symlink_target.clone().ok_or_else(|| {
                    WcError::InvalidState(format!("no target for new symlink {}", spec.gid))
                })?;
                overwrite.hid = Some(hash_bytes(target.as_bytes()));
                overwrite.symlink_target = Some(target.clone());
                self.journal.push(JournalOp::WriteSymlink { path, target });
            }
            EntryType::Submodule => {
                return Err(WcError::NotImplemented("adding a submodule".into()))
            }
        }

        let pc = PcRow {
            alias,
            parent_alias: spec.parent,
            name,
            entry_type: spec.entry_type,
            flags: spec.kind.flag(),
            merge_content_hash: match spec.kind {
                AddSpecialKind::Merge => overwrite.hid.clone(),
                AddSpecialKind::Update => None,
            },
            sparse: None,
        };
        let row = PrescanRow {
            alias,
            gid: spec.gid.clone(),
            tree: None,
            pc: Some(pc),
            class: ScanClass::ControlledActive,
            disk: None,
            scan_dir: spec.parent,
        };
        let mut item = LiveViewItem::from_scan(row, None);
        item.materialized = true;
        item.overwrite = overwrite;
        self.items.insert(alias, item);
        self.dir_mut(spec.parent)?.residents.insert(alias);
        self.store_pc(alias)?;
        info!(alias = %alias, gid = %spec.gid, kind = ?spec.kind, "queued add-special");
        Ok(alias)
    }

    fn find_parking_slot(&mut self, spec: &AddSpecial, collision: WcError) -> Result<String, WcError> {
        warn!(gid = %spec.gid, name = %spec.name, error = %collision, "destination taken, parking");
        for counter in 0..MAX_PARK_ATTEMPTS {
            let candidate = parked_name(&spec.gid, counter);
            if self.find_child(spec.parent, &candidate)?.is_none() {
                return Ok(candidate);
            }
        }
        Err(collision)
    }

    // -----------------------------------------------------------------------
    // overwrites
    // -----------------------------------------------------------------------

    /// Replace a file's content, keeping its attribute bits.
    pub fn overwrite_file(&mut self, alias: Alias, source: ContentSource) -> Result<(), WcError> {
        self.ensure_mutable()?;
        self.check_overwritable(alias, EntryType::File)?;
        let hid = self.source_hid(&source)?;
        let attrbits = self.current_attrbits(alias)?;
        let path = self.current_path(alias)?;
        self.journal.push(JournalOp::WriteFile {
            path,
            source: source.clone(),
            attrbits: Some(attrbits),
        });
        let item = self.item_mut(alias)?;
        item.overwrite.hid = Some(hid);
        item.overwrite.source = Some(source);
        item.overwrite.attrbits = Some(attrbits);
        item.cached_hid = None;
        debug!(alias = %alias, "queued content overwrite");
        Ok(())
    }

    /// Retarget a symlink.
    pub fn overwrite_symlink(&mut self, alias: Alias, target: &str) -> Result<(), WcError> {
        self.ensure_mutable()?;
        self.check_overwritable(alias, EntryType::Symlink)?;
        let path = self.current_path(alias)?;
        self.journal.push(JournalOp::WriteSymlink {
            path,
            target: target.to_string(),
        });
        let item = self.item_mut(alias)?;
        item.overwrite.hid = Some(hash_bytes(target.as_bytes()));
        item.overwrite.symlink_target = Some(target.to_string());
        item.cached_hid = None;
        debug!(alias = %alias, target, "queued symlink retarget");
        Ok(())
    }

    pub fn set_attrbits(&mut self, alias: Alias, attrbits: u64) -> Result<(), WcError> {
        self.ensure_mutable()?;
        self.ensure_item(alias)?;
        let entry_type = self.item(alias)?.entry_type;
        self.check_overwritable(alias, entry_type)?;
        let path = self.current_path(alias)?;
        self.journal.push(JournalOp::SetAttrbits { path, attrbits });
        self.item_mut(alias)?.overwrite.attrbits = Some(attrbits);
        debug!(alias = %alias, attrbits, "queued attribute change");
        Ok(())
    }

    fn check_overwritable(&mut self, alias: Alias, expected: EntryType) -> Result<(), WcError> {
        self.ensure_item(alias)?;
        let (reserved, entry_type, materialized) = {
            let item = self.item(alias)?;
            (item.is_reserved(), item.entry_type, item.materialized)
        };
        if reserved {
            return Err(WcError::Reserved(self.path_string(alias)?));
        }
        if entry_type != expected {
            return Err(WcError::InvalidState(format!(
                "'{}' is a {entry_type}, not a {expected}",
                self.path_string(alias)?
            )));
        }
        if !materialized {
            return Err(WcError::InvalidState(format!(
                "'{}' is not present in the working directory",
                self.path_string(alias)?
            )));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // issues
    // -----------------------------------------------------------------------

    /// Record a merge issue for an item. Creates the issue table on first
    /// use. The row is written inside the open store transaction, so a
    /// cancel discards it with everything else.
    pub fn insert_issue(&mut self, alias: Alias, doc: &IssueDoc) -> Result<StatusFlags, WcError> {
        self.ensure_mutable()?;
        self.ensure_item(alias)?;
        let unresolved = unresolved_bits_for(doc);
        let status_flags = if unresolved.is_empty() {
            StatusFlags::X_RESOLVED
        } else {
            StatusFlags::X_UNRESOLVED | unresolved
        };

        let db = self.wc.db();
        db.create_issue_table()?;
        db.insert_issue(alias, status_flags.bits(), &serde_json::to_string(doc)?)?;
        self.item_mut(alias)?.issue = IssueSlot::Present(Box::new(ItemIssue {
            doc: doc.clone(),
            status_flags,
            resolve: ResolveDoc::default(),
        }));
        info!(alias = %alias, flags = ?status_flags, "recorded merge issue");
        Ok(status_flags)
    }

    // -----------------------------------------------------------------------
    // helpers
    // -----------------------------------------------------------------------

    /// Fail with a collision if another live item in `dir` already holds
    /// `name` (under the configured collision key).
    pub(crate) fn check_name_free(
        &mut self,
        dir: Alias,
        name: &str,
        except: Alias,
    ) -> Result<(), WcError> {
        let key = self.wc.names().collision_key(name);
        for other in self.residents(dir)? {
            if other == except {
                continue;
            }
            let item = self.item(other)?;
            if item.occupies_slot() && self.wc.names().collision_key(item.current_name()) == key {
                return Err(WcError::Collision {
                    name: name.to_string(),
                    existing: self.path_string(other)?,
                });
            }
        }
        Ok(())
    }

    /// The item's in-memory pending-change row, created from its baseline
    /// row on first edit.
    fn pc_for_edit(&mut self, alias: Alias) -> Result<&mut PcRow, WcError> {
        let item = self.item_mut(alias)?;
        if item.pc.is_none() {
            let tree = item
                .scan
                .tree
                .as_ref()
                .ok_or_else(|| WcError::not_found("baseline row", alias))?;
            item.pc = Some(PcRow::from_tree(tree));
        }
        item.pc
            .as_mut()
            .ok_or_else(|| WcError::not_found("pending change", alias))
    }

    /// Normalize the item's pending-change row and journal its write (or
    /// its deletion once it no longer records anything).
    pub(crate) fn store_pc(&mut self, alias: Alias) -> Result<(), WcError> {
        let item = self
            .items
            .get_mut(&alias)
            .ok_or_else(|| WcError::not_found("liveview item", alias))?;
        let baseline = item.scan.tree.clone();
        let op = match item.pc.as_mut() {
            Some(pc) => {
                pc.recompute_structural(baseline.as_ref());
                if pc.is_noop() {
                    item.pc = None;
                    JournalOp::DeletePendingChange(alias)
                } else {
                    JournalOp::StorePendingChange(pc.clone())
                }
            }
            None => JournalOp::DeletePendingChange(alias),
        };
        item.pc_dirty = true;
        self.journal.push(op);
        Ok(())
    }

    /// Flip unresolved bits for `axes` to resolved on an item with an open
    /// issue. Once no unresolved axis remains the whole item is resolved.
    pub(crate) fn implicit_resolve(
        &mut self,
        alias: Alias,
        axes: &[ConflictAxis],
    ) -> Result<(), WcError> {
        if !self.items.contains_key(&alias) {
            return Ok(());
        }
        self.load_issue(alias)?;
        let Some(issue) = self.item_mut(alias)?.issue_mut() else {
            return Ok(());
        };
        let mut changed = false;
        for axis in axes {
            if issue.status_flags.contains(axis.xu()) {
                issue.status_flags.remove(axis.xu());
                issue.status_flags.insert(axis.xr());
                issue.resolve.record_accept(*axis, None);
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }
        if !issue.status_flags.intersects(StatusFlags::XU_MASK) {
            issue.status_flags.remove(StatusFlags::X_UNRESOLVED);
            issue.status_flags.insert(StatusFlags::X_RESOLVED);
        }
        debug!(alias = %alias, axes = ?axes, flags = ?issue.status_flags, "implicitly resolved");
        self.persist_issue(alias)
    }

    pub(crate) fn source_hid(&self, source: &ContentSource) -> Result<String, WcError> {
        match source {
            ContentSource::Blob(hid) => {
                if !self.wc.blobs().contains(hid) {
                    return Err(WcError::not_found("blob", hid));
                }
                Ok(hid.clone())
            }
            ContentSource::TempFile(path) => Ok(hash_file(path)?),
        }
    }

    pub(crate) fn source_text(&self, source: &ContentSource) -> Result<String, WcError> {
        let bytes = match source {
            ContentSource::Blob(hid) => self.wc.blobs().fetch(hid)?,
            ContentSource::TempFile(path) => std::fs::read(path)?,
        };
        String::from_utf8(bytes)
            .map_err(|_| WcError::InvalidState("symlink target is not UTF-8".into()))
    }
}

/// Unresolved-axis bits for a freshly recorded issue.
pub(crate) fn unresolved_bits_for(doc: &IssueDoc) -> StatusFlags {
    use crate::models::ConflictFlags as C;
    let conflicts = doc.conflict_flags();
    let mut bits = StatusFlags::empty();
    if conflicts.intersects(C::EXISTENCE) {
        bits |= StatusFlags::XU_EXISTENCE;
    }
    // A delete on one side against a change on the other also leaves the
    // changed property undecided.
    if conflicts.contains(C::DELETE_VS_RENAME) || conflicts.intersects(C::NAME) {
        bits |= StatusFlags::XU_NAME;
    }
    if conflicts.contains(C::DELETE_VS_MOVE) || conflicts.intersects(C::LOCATION) {
        bits |= StatusFlags::XU_LOCATION;
    }
    if conflicts.contains(C::DELETE_VS_ATTRBITS) || conflicts.intersects(C::ATTRIBUTES) {
        bits |= StatusFlags::XU_ATTRIBUTES;
    }
    if conflicts.intersects(
        C::DELETE_VS_FILE_EDIT | C::DELETE_VS_SYMLINK_EDIT | C::DELETE_VS_SUBMODULE_EDIT,
    ) || conflicts.intersects(C::CONTENTS)
    {
        bits |= StatusFlags::XU_CONTENTS;
    }
    if doc.has_collision_cause() || doc.has_portability_cause() {
        bits |= StatusFlags::XU_NAME;
    }
    bits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConflictFlags, IssueInputs, IssueOutput};

    fn doc(conflicts: ConflictFlags) -> IssueDoc {
        IssueDoc {
            gid: "gabc".into(),
            tne_type: EntryType::File.as_i64(),
            conflict_flags: conflicts.bits(),
            collision_flags: 0,
            portability_flags: 0,
            input: IssueInputs::default(),
            output: IssueOutput::default(),
            automerge_mergetool: None,
            automerge_generated_hid: None,
            restore_original_name: None,
            reference_original_name: None,
            collisions: vec![],
            portability_collisions: vec![],
            conflict_path_cycle_hint: None,
            conflict_path_cycle_others: vec![],
        }
    }

    #[test]
    fn test_parked_name() {
        assert_eq!(parked_name("g1234567890", 0), ".park.g123456.00");
        assert_eq!(parked_name("g1234567890", 42), ".park.g123456.42");
    }

    #[test]
    fn test_unresolved_bits_for_delete_vs_edit() {
        let bits = unresolved_bits_for(&doc(ConflictFlags::DELETE_VS_FILE_EDIT));
        assert_eq!(bits, StatusFlags::XU_EXISTENCE | StatusFlags::XU_CONTENTS);
    }

    #[test]
    fn test_unresolved_bits_for_divergent_and_collision() {
        let bits = unresolved_bits_for(&doc(
            ConflictFlags::DIVERGENT_MOVE | ConflictFlags::DIVERGENT_ATTRBITS,
        ));
        assert_eq!(bits, StatusFlags::XU_LOCATION | StatusFlags::XU_ATTRIBUTES);

        let mut collided = doc(ConflictFlags::empty());
        collided.collisions.push("gother".into());
        assert_eq!(unresolved_bits_for(&collided), StatusFlags::XU_NAME);
        assert!(unresolved_bits_for(&doc(ConflictFlags::empty())).is_empty());
    }
}
