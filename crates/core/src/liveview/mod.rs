//! The liveview: one mutable in-memory item per alias, layered over its
//! prescan snapshot.
//!
//! Every property has two views. The *original* view is baseline-relative:
//! an alternate baseline row if one was set, else the baseline tree row,
//! else (items without a baseline) the current value. The *current* view is
//! live: queued overwrites first, then sparse fields, then what the
//! directory scan observed on disk.
//!
//! Items and directories live in the transaction's caches keyed by alias.
//! Items never point at their directory; they carry the directory's alias
//! and callers go back through the cache.

pub mod ops;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::blobstore::{hash_bytes, hash_file};
use crate::commit::CandidateNode;
use crate::errors::WcError;
use crate::journal::ContentSource;
use crate::models::{
    effective_attrbits, platform_definable_mask, Alias, EntryType, IssueDoc, PcFlags, PcRow,
    TreeRow, BASELINE_LABEL,
};
use crate::prescan::{scan_dir, PrescanRow, ScanClass};
use crate::resolve::ResolveDoc;
use crate::status::StatusFlags;
use crate::tx::Transaction;
use crate::workdir::{mtime_ns, read_symlink_target, DiskEntry};

/// Files modified this recently are never recorded in the timestamp cache;
/// their mtime may not yet distinguish a further edit.
const TIMESTAMP_SETTLE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// Items
// ---------------------------------------------------------------------------

/// Content and attribute changes queued for an item but not yet on disk.
#[derive(Debug, Clone, Default)]
pub struct QueuedOverwrite {
    pub hid: Option<String>,
    pub source: Option<ContentSource>,
    pub symlink_target: Option<String>,
    pub attrbits: Option<u64>,
}

/// An item's merge issue and its accumulated resolution state.
#[derive(Debug, Clone)]
pub struct ItemIssue {
    pub doc: IssueDoc,
    pub status_flags: StatusFlags,
    pub resolve: ResolveDoc,
}

/// Lazily loaded issue state.
#[derive(Debug, Clone, Default)]
pub enum IssueSlot {
    #[default]
    Unloaded,
    Absent,
    Present(Box<ItemIssue>),
}

#[derive(Debug, Clone)]
pub struct LiveViewItem {
    pub(crate) scan: PrescanRow,
    pub(crate) class: ScanClass,
    pub(crate) entry_type: EntryType,
    /// Live pending-change row, starting from the scanned one.
    pub(crate) pc: Option<PcRow>,
    pub(crate) pc_dirty: bool,
    pub(crate) alt_baseline: Option<TreeRow>,
    /// Location on disk, relative to the root, as of the scan.
    pub(crate) disk_path: Option<PathBuf>,
    /// Whether the item exists on disk once every queued op has replayed.
    pub(crate) materialized: bool,
    pub(crate) overwrite: QueuedOverwrite,
    pub(crate) cached_hid: Option<String>,
    pub(crate) issue: IssueSlot,
}

impl LiveViewItem {
    pub(crate) fn from_scan(scan: PrescanRow, parent_disk_path: Option<&Path>) -> Self {
        let entry_type = scan
            .pc
            .as_ref()
            .map(|pc| pc.entry_type)
            .or_else(|| scan.tree.as_ref().map(|t| t.entry_type))
            .or_else(|| scan.disk.as_ref().map(|d| d.entry_type))
            .unwrap_or(EntryType::File);
        let disk_path = match (&scan.disk, parent_disk_path) {
            (Some(disk), Some(parent)) => Some(parent.join(&disk.name)),
            _ => None,
        };
        Self {
            class: scan.class,
            entry_type,
            pc: scan.pc.clone(),
            pc_dirty: false,
            alt_baseline: None,
            materialized: scan.disk.is_some(),
            disk_path,
            overwrite: QueuedOverwrite::default(),
            cached_hid: None,
            issue: IssueSlot::Unloaded,
            scan,
        }
    }

    pub fn alias(&self) -> Alias {
        self.scan.alias
    }

    pub fn gid(&self) -> &str {
        &self.scan.gid
    }

    pub fn class(&self) -> ScanClass {
        self.class
    }

    pub fn entry_type(&self) -> EntryType {
        self.entry_type
    }

    pub fn flags(&self) -> PcFlags {
        self.pc.as_ref().map(|pc| pc.flags).unwrap_or_default()
    }

    pub fn pending_change(&self) -> Option<&PcRow> {
        self.pc.as_ref()
    }

    /// Baseline row consulted by the original view.
    pub fn baseline_row(&self) -> Option<&TreeRow> {
        self.alt_baseline.as_ref().or(self.scan.tree.as_ref())
    }

    pub fn current_name(&self) -> &str {
        if let Some(pc) = &self.pc {
            return &pc.name;
        }
        if let Some(tree) = &self.scan.tree {
            return &tree.name;
        }
        self.scan.disk.as_ref().map(|d| d.name.as_str()).unwrap_or("")
    }

    pub fn current_parent(&self) -> Alias {
        if let Some(pc) = &self.pc {
            return pc.parent_alias;
        }
        if let Some(tree) = &self.scan.tree {
            return tree.parent_alias;
        }
        self.scan.scan_dir
    }

    pub fn original_name(&self) -> &str {
        self.baseline_row()
            .map(|t| t.name.as_str())
            .unwrap_or_else(|| self.current_name())
    }

    pub fn original_parent(&self) -> Alias {
        self.baseline_row()
            .map(|t| t.parent_alias)
            .unwrap_or_else(|| self.current_parent())
    }

    pub fn is_controlled(&self) -> bool {
        self.class.is_controlled()
    }

    pub fn is_deleted(&self) -> bool {
        self.flags().contains(PcFlags::DELETED)
    }

    pub fn is_lost(&self) -> bool {
        self.class == ScanClass::ControlledLost
    }

    pub fn is_sparse(&self) -> bool {
        self.class == ScanClass::ControlledSparse
    }

    pub fn is_reserved(&self) -> bool {
        self.class == ScanClass::Reserved
    }

    pub fn is_materialized(&self) -> bool {
        self.materialized
    }

    /// Occupies its name in the parent directory.
    pub(crate) fn occupies_slot(&self) -> bool {
        !self.is_deleted()
    }

    pub fn issue(&self) -> Option<&ItemIssue> {
        match &self.issue {
            IssueSlot::Present(issue) => Some(issue),
            _ => None,
        }
    }

    pub(crate) fn issue_mut(&mut self) -> Option<&mut ItemIssue> {
        match &mut self.issue {
            IssueSlot::Present(issue) => Some(issue),
            _ => None,
        }
    }

    fn sparse_info(&self) -> Option<(&str, u64)> {
        self.pc
            .as_ref()
            .and_then(|pc| pc.sparse.as_ref())
            .map(|s| (s.content_hash.as_str(), s.attrbits))
    }
}

// ---------------------------------------------------------------------------
// Directories
// ---------------------------------------------------------------------------

/// The items currently located in one directory.
#[derive(Debug, Clone)]
pub struct LiveViewDir {
    pub alias: Alias,
    pub residents: BTreeSet<Alias>,
    /// Baseline children currently located elsewhere.
    pub moved_out: BTreeSet<Alias>,
    pub candidate: Option<CandidateNode>,
}

impl LiveViewDir {
    pub fn new(alias: Alias) -> Self {
        Self {
            alias,
            residents: BTreeSet::new(),
            moved_out: BTreeSet::new(),
            candidate: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Cache access and path resolution
// ---------------------------------------------------------------------------

impl Transaction<'_> {
    /// Make sure `alias` has a liveview item, scanning its directory (and
    /// that directory's ancestors) if needed.
    pub fn ensure_item(&mut self, alias: Alias) -> Result<(), WcError> {
        if self.items.contains_key(&alias) {
            return Ok(());
        }
        if alias == self.root {
            let item = self.load_root()?;
            self.items.insert(alias, item);
            return Ok(());
        }

        let db = self.wc.db();
        let parent = match db.get_pending_change(alias)? {
            Some(pc) => pc.parent_alias,
            None => match db.get_tree_row(BASELINE_LABEL, alias)? {
                Some(tree) => tree.parent_alias,
                None => return Err(WcError::not_found("item", alias)),
            },
        };
        if parent.is_sentinel() {
            return Err(WcError::not_found("item", alias));
        }
        self.ensure_dir(parent)?;
        if self.items.contains_key(&alias) {
            Ok(())
        } else {
            Err(WcError::not_found("item", alias))
        }
    }

    fn load_root(&self) -> Result<LiveViewItem, WcError> {
        let db = self.wc.db();
        let tree = db.root_tree_row(BASELINE_LABEL)?;
        let gid = db
            .gid_of_alias(tree.alias)?
            .ok_or_else(|| WcError::not_found("gid for alias", tree.alias))?;
        let meta = std::fs::metadata(self.wc.root())?;
        let row = PrescanRow {
            alias: tree.alias,
            gid,
            pc: db.get_pending_change(tree.alias)?,
            class: ScanClass::ControlledActive,
            disk: Some(DiskEntry {
                name: tree.name.clone(),
                entry_type: EntryType::Directory,
                mtime_ns: mtime_ns(&meta),
                size: 0,
                attrbits: 0,
            }),
            scan_dir: Alias::NULL_ROOT,
            tree: Some(tree),
        };
        let mut item = LiveViewItem::from_scan(row, None);
        item.disk_path = Some(PathBuf::new());
        Ok(item)
    }

    /// Make sure directory `dir` has been scanned into the cache.
    pub fn ensure_dir(&mut self, dir: Alias) -> Result<(), WcError> {
        if self.dirs.contains_key(&dir) {
            return Ok(());
        }
        self.ensure_item(dir)?;
        let (disk_rel, entry_type) = {
            let item = self.item(dir)?;
            let on_disk = item.scan.disk.is_some();
            (item.disk_path.clone().filter(|_| on_disk), item.entry_type)
        };
        if entry_type != EntryType::Directory {
            return Err(WcError::InvalidState(format!("item {dir} is not a directory")));
        }
        let disk_abs = disk_rel.as_ref().map(|rel| self.wc.root().join(rel));

        let scan = scan_dir(
            self.wc.db(),
            self.wc.names(),
            BASELINE_LABEL,
            dir,
            disk_abs.as_deref(),
        )?;
        let mut lvd = LiveViewDir::new(dir);
        lvd.moved_out = scan.moved_out;
        for row in scan.rows {
            let alias = row.alias;
            if let Some(existing) = self.items.get(&alias) {
                if existing.current_parent() == dir {
                    lvd.residents.insert(alias);
                }
                continue;
            }
            self.items
                .insert(alias, LiveViewItem::from_scan(row, disk_rel.as_deref()));
            lvd.residents.insert(alias);
        }
        debug!(dir = %dir, residents = lvd.residents.len(), "loaded directory");
        self.dirs.insert(dir, lvd);
        Ok(())
    }

    /// The cached item for `alias`. Call [`ensure_item`](Self::ensure_item)
    /// first.
    pub fn item(&self, alias: Alias) -> Result<&LiveViewItem, WcError> {
        self.items
            .get(&alias)
            .ok_or_else(|| WcError::not_found("liveview item", alias))
    }

    pub(crate) fn item_mut(&mut self, alias: Alias) -> Result<&mut LiveViewItem, WcError> {
        self.items
            .get_mut(&alias)
            .ok_or_else(|| WcError::not_found("liveview item", alias))
    }

    pub(crate) fn dir_mut(&mut self, dir: Alias) -> Result<&mut LiveViewDir, WcError> {
        self.dirs
            .get_mut(&dir)
            .ok_or_else(|| WcError::not_found("liveview directory", dir))
    }

    /// Aliases currently located in `dir`, including deleted items.
    pub fn residents(&mut self, dir: Alias) -> Result<Vec<Alias>, WcError> {
        self.ensure_dir(dir)?;
        Ok(self.dirs[&dir].residents.iter().copied().collect())
    }

    /// The live, non-deleted resident of `dir` named `name`.
    pub fn find_child(&mut self, dir: Alias, name: &str) -> Result<Option<Alias>, WcError> {
        for alias in self.residents(dir)? {
            let item = self.item(alias)?;
            if item.occupies_slot() && item.current_name() == name {
                return Ok(Some(alias));
            }
        }
        Ok(None)
    }

    /// Resolve a repo-relative path (forward slashes) through the live view.
    pub fn lookup_path(&mut self, path: &str) -> Result<Option<Alias>, WcError> {
        let mut current = self.root;
        for component in path.split('/').filter(|c| !c.is_empty() && *c != ".") {
            self.ensure_item(current)?;
            if self.item(current)?.entry_type != EntryType::Directory {
                return Ok(None);
            }
            match self.find_child(current, component)? {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }
        self.ensure_item(current)?;
        Ok(Some(current))
    }

    /// The live path of `alias`, relative to the root. Journal entries are
    /// recorded with this path.
    pub fn current_path(&mut self, alias: Alias) -> Result<PathBuf, WcError> {
        let mut names = Vec::new();
        let mut seen = HashSet::new();
        let mut current = alias;
        while current != self.root {
            if !seen.insert(current) {
                return Err(WcError::InvalidState(format!(
                    "item {alias} has a cyclic parent chain"
                )));
            }
            self.ensure_item(current)?;
            let item = self.item(current)?;
            names.push(item.current_name().to_string());
            current = item.current_parent();
        }
        Ok(names.iter().rev().collect())
    }

    /// [`current_path`](Self::current_path) as a forward-slash string.
    pub fn path_string(&mut self, alias: Alias) -> Result<String, WcError> {
        let path = self.current_path(alias)?;
        let parts: Vec<String> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Ok(parts.join("/"))
    }

    pub(crate) fn is_ignored(&mut self, alias: Alias) -> Result<bool, WcError> {
        let path = self.path_string(alias)?;
        Ok(self.wc.ignores().is_ignored(&path))
    }

    fn disk_abs_path(&self, item: &LiveViewItem) -> Option<PathBuf> {
        item.scan
            .disk
            .as_ref()
            .and(item.disk_path.as_ref())
            .map(|rel| self.wc.root().join(rel))
    }

    /// Set the baseline row the original view should use instead of the
    /// tree row (update and merge flows).
    pub fn set_alternate_baseline(&mut self, alias: Alias, row: TreeRow) -> Result<(), WcError> {
        self.ensure_item(alias)?;
        let item = self.item_mut(alias)?;
        debug!(alias = %alias, name = %row.name, "set alternate baseline");
        item.alt_baseline = Some(row);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Attribute bits
    // -----------------------------------------------------------------------

    pub fn original_attrbits(&mut self, alias: Alias) -> Result<u64, WcError> {
        self.ensure_item(alias)?;
        match self.item(alias)?.baseline_row() {
            Some(row) => Ok(row.attrbits),
            None => self.current_attrbits(alias),
        }
    }

    pub fn current_attrbits(&mut self, alias: Alias) -> Result<u64, WcError> {
        self.ensure_item(alias)?;
        let item = self.item(alias)?;
        if let Some(bits) = item.overwrite.attrbits {
            return Ok(bits);
        }
        if let Some((_, bits)) = item.sparse_info() {
            return Ok(bits);
        }
        let baseline = item.baseline_row().map(|t| t.attrbits).unwrap_or(0);
        match (&item.scan.disk, item.materialized) {
            (Some(disk), true) => Ok(effective_attrbits(
                baseline,
                disk.attrbits,
                platform_definable_mask(),
            )),
            _ => Ok(baseline),
        }
    }

    // -----------------------------------------------------------------------
    // Content hashes
    // -----------------------------------------------------------------------

    /// Baseline content hash, or the current one for items without a
    /// baseline. `None` for directories without a baseline row.
    pub fn original_hid(&mut self, alias: Alias) -> Result<Option<String>, WcError> {
        self.ensure_item(alias)?;
        let item = self.item(alias)?;
        if let Some(row) = item.baseline_row() {
            return Ok(Some(row.content_hash.clone()));
        }
        if item.entry_type == EntryType::Directory {
            return Ok(None);
        }
        self.current_hid(alias).map(Some)
    }

    /// Live content hash of a file, symlink or submodule.
    pub fn current_hid(&mut self, alias: Alias) -> Result<String, WcError> {
        self.ensure_item(alias)?;
        let item = self.item(alias)?;
        if item.entry_type == EntryType::Directory {
            return Err(WcError::NotImplemented(format!(
                "content hash of directory {alias}"
            )));
        }
        if let Some(hid) = &item.overwrite.hid {
            return Ok(hid.clone());
        }
        if let Some((hid, _)) = item.sparse_info() {
            return Ok(hid.to_string());
        }
        if item.entry_type == EntryType::Submodule {
            return item
                .baseline_row()
                .map(|t| t.content_hash.clone())
                .ok_or_else(|| WcError::not_found("submodule baseline", alias));
        }
        if let Some(hid) = &item.cached_hid {
            return Ok(hid.clone());
        }
        let path = match (self.disk_abs_path(item), item.materialized) {
            (Some(path), true) => path,
            _ => return Err(WcError::not_found("live directory entry for item", alias)),
        };
        let (entry_type, disk) = (item.entry_type, item.scan.disk.clone());

        let hid = match entry_type {
            EntryType::Symlink => hash_bytes(read_symlink_target(&path)?.as_bytes()),
            _ => self.hash_with_timestamp_cache(alias, &path, disk.as_ref())?,
        };
        self.item_mut(alias)?.cached_hid = Some(hid.clone());
        Ok(hid)
    }

    /// Current symlink target.
    pub fn current_symlink_target(&mut self, alias: Alias) -> Result<String, WcError> {
        self.ensure_item(alias)?;
        let item = self.item(alias)?;
        if item.entry_type != EntryType::Symlink {
            return Err(WcError::InvalidState(format!("item {alias} is not a symlink")));
        }
        if let Some(target) = &item.overwrite.symlink_target {
            return Ok(target.clone());
        }
        match (self.disk_abs_path(item), item.materialized) {
            (Some(path), true) => Ok(read_symlink_target(&path)?),
            _ => Err(WcError::not_found("live directory entry for item", alias)),
        }
    }

    /// Bytes of the item's current content (files and symlinks).
    pub fn current_content(&mut self, alias: Alias) -> Result<Vec<u8>, WcError> {
        self.ensure_item(alias)?;
        let entry_type = self.item(alias)?.entry_type;
        match entry_type {
            EntryType::Symlink => Ok(self.current_symlink_target(alias)?.into_bytes()),
            EntryType::File => {
                let item = self.item(alias)?;
                if let Some(source) = &item.overwrite.source {
                    return match source {
                        ContentSource::Blob(hid) => Ok(self.wc.blobs().fetch(hid)?),
                        ContentSource::TempFile(path) => Ok(std::fs::read(path)?),
                    };
                }
                if let Some((hid, _)) = item.sparse_info() {
                    return Ok(self.wc.blobs().fetch(hid)?);
                }
                match (self.disk_abs_path(item), item.materialized) {
                    (Some(path), true) => Ok(std::fs::read(path)?),
                    _ => Err(WcError::not_found("live directory entry for item", alias)),
                }
            }
            other => Err(WcError::NotImplemented(format!("content of a {other}"))),
        }
    }

    fn hash_with_timestamp_cache(
        &mut self,
        alias: Alias,
        path: &Path,
        disk: Option<&DiskEntry>,
    ) -> Result<String, WcError> {
        let use_cache = self.wc.config().working_copy.timestamp_cache;
        if use_cache && self.timestamps.is_none() {
            let entries: HashMap<Alias, _> = self
                .wc
                .db()
                .load_timestamp_cache()?
                .into_iter()
                .map(|e| (e.alias, e))
                .collect();
            debug!(count = entries.len(), "loaded timestamp cache");
            self.timestamps = Some(entries);
        }
        if let (Some(disk), Some(cache)) = (disk, &self.timestamps) {
            if let Some(entry) = cache.get(&alias) {
                if use_cache && entry.mtime_ns == disk.mtime_ns && entry.size == disk.size {
                    return Ok(entry.hid.clone());
                }
            }
        }

        let hid = hash_file(path)?;
        if let (true, Some(disk)) = (use_cache, disk) {
            let settled = SystemTime::now()
                .checked_sub(TIMESTAMP_SETTLE)
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_nanos() as i64)
                .unwrap_or(0);
            if disk.mtime_ns > 0 && disk.mtime_ns < settled {
                self.fresh_timestamps.push(crate::db::TimestampEntry {
                    alias,
                    mtime_ns: disk.mtime_ns,
                    size: disk.size,
                    hid: hid.clone(),
                });
            }
        }
        Ok(hid)
    }

    // -----------------------------------------------------------------------
    // Issues
    // -----------------------------------------------------------------------

    /// Load the item's merge issue on first use.
    pub fn load_issue(&mut self, alias: Alias) -> Result<(), WcError> {
        self.ensure_item(alias)?;
        if !matches!(self.item(alias)?.issue, IssueSlot::Unloaded) {
            return Ok(());
        }
        let slot = match self.wc.db().get_issue(alias)? {
            Some(row) => {
                let doc: IssueDoc = serde_json::from_str(&row.issue_json)?;
                let resolve = match &row.resolve_json {
                    Some(json) => serde_json::from_str(json)?,
                    None => ResolveDoc::default(),
                };
                IssueSlot::Present(Box::new(ItemIssue {
                    doc,
                    status_flags: StatusFlags::from_bits_truncate(row.status_flags),
                    resolve,
                }))
            }
            None => IssueSlot::Absent,
        };
        self.item_mut(alias)?.issue = slot;
        Ok(())
    }

    /// Queue the item's issue state for writing back.
    pub(crate) fn persist_issue(&mut self, alias: Alias) -> Result<(), WcError> {
        let item = self.item(alias)?;
        if let Some(issue) = item.issue() {
            let op = crate::journal::JournalOp::UpdateIssue {
                alias,
                status_flags: issue.status_flags.bits(),
                resolve_json: Some(serde_json::to_string(&issue.resolve)?),
            };
            self.journal.push(op);
        }
        Ok(())
    }
}
