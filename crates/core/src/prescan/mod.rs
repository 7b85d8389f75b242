//! Per-directory union of baseline rows, pending-change rows and the
//! on-disk listing.
//!
//! [`scan_dir`] produces one [`PrescanRow`] per item that is, or logically
//! should be, in a directory: controlled items from the join in
//! [`join`], plus one uncontrolled or reserved row for every disk entry no
//! controlled item claims.

pub mod join;

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use tracing::debug;

use crate::db::Database;
use crate::errors::WcError;
use crate::models::{new_tmp_gid, Alias, PcFlags, PcRow, TreeRow};
use crate::policy::NamePolicy;
use crate::workdir::{read_dir_entries, DiskEntry};

pub use join::{DirJoin, JoinedRow};

/// How an item relates to version control at scan time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScanClass {
    ControlledActive,
    ControlledSparse,
    /// Controlled, expected on disk, but absent.
    ControlledLost,
    /// Present on disk, not controlled; found vs ignored is decided later.
    UncontrolledUnqualified,
    /// Matches a reserved name; can never be controlled.
    Reserved,
}

impl ScanClass {
    pub fn is_controlled(self) -> bool {
        matches!(
            self,
            Self::ControlledActive | Self::ControlledSparse | Self::ControlledLost
        )
    }
}

/// Snapshot of one item as of its directory's scan.
#[derive(Debug, Clone)]
pub struct PrescanRow {
    pub alias: Alias,
    pub gid: String,
    pub tree: Option<TreeRow>,
    pub pc: Option<PcRow>,
    pub class: ScanClass,
    pub disk: Option<DiskEntry>,
    /// Directory whose scan produced this row.
    pub scan_dir: Alias,
}

impl PrescanRow {
    /// Name under which the item sits on disk as of the scan.
    pub fn effective_name(&self) -> Option<&str> {
        if let Some(pc) = &self.pc {
            return Some(&pc.name);
        }
        if let Some(tree) = &self.tree {
            return Some(&tree.name);
        }
        self.disk.as_ref().map(|d| d.name.as_str())
    }
}

/// Result of scanning one directory.
#[derive(Debug, Default)]
pub struct DirScan {
    pub rows: Vec<PrescanRow>,
    /// Baseline children that pending moves have taken elsewhere.
    pub moved_out: BTreeSet<Alias>,
}

/// Scan directory `dir`. `disk_dir` is its absolute location on disk, or
/// `None` when it has no disk presence (lost, deleted, sparse or not yet
/// created), in which case no uncontrolled rows are produced.
pub fn scan_dir(
    db: &Database,
    policy: &NamePolicy,
    label: &str,
    dir: Alias,
    disk_dir: Option<&Path>,
) -> Result<DirScan, WcError> {
    let mut disk: HashMap<String, DiskEntry> = match disk_dir {
        Some(path) => read_dir_entries(path)?
            .into_iter()
            .map(|e| (e.name.clone(), e))
            .collect(),
        None => HashMap::new(),
    };

    let mut scan = DirScan::default();
    for joined in DirJoin::new(db, label, dir)? {
        let joined = joined?;
        if !joined.resident {
            scan.moved_out.insert(joined.alias);
            continue;
        }
        let gid = db
            .gid_of_alias(joined.alias)?
            .ok_or_else(|| WcError::not_found("gid for alias", joined.alias))?;
        let mut row = PrescanRow {
            alias: joined.alias,
            gid,
            tree: joined.tree,
            pc: joined.pc,
            class: ScanClass::ControlledActive,
            disk: None,
            scan_dir: dir,
        };
        classify_controlled(&mut row, &mut disk);
        debug!(dir = %dir, alias = %row.alias, class = ?row.class, "prescan row");
        scan.rows.push(row);
    }

    let mut leftovers: Vec<DiskEntry> = disk.into_values().collect();
    leftovers.sort_by(|a, b| a.name.cmp(&b.name));
    for entry in leftovers {
        scan.rows.push(synthesize_uncontrolled(db, policy, dir, entry)?);
    }
    Ok(scan)
}

/// Decide the class of a controlled row and claim its disk entry.
fn classify_controlled(row: &mut PrescanRow, disk: &mut HashMap<String, DiskEntry>) {
    let flags = row.pc.as_ref().map(|pc| pc.flags).unwrap_or_default();
    if flags.contains(PcFlags::DELETED) {
        // The absence is the queued intent; any same-named entry is
        // someone else.
        return;
    }
    if flags.contains(PcFlags::SPARSE) {
        row.class = ScanClass::ControlledSparse;
        return;
    }
    let entry_type = row
        .pc
        .as_ref()
        .map(|pc| pc.entry_type)
        .or_else(|| row.tree.as_ref().map(|t| t.entry_type));
    let name = row.effective_name().map(str::to_string);
    let claimed = match (name, entry_type) {
        (Some(name), Some(ty)) => match disk.get(&name) {
            Some(entry) if entry.entry_type == ty => disk.remove(&name),
            _ => None,
        },
        _ => None,
    };
    match claimed {
        Some(entry) => row.disk = Some(entry),
        None => row.class = ScanClass::ControlledLost,
    }
}

/// Build a row for a disk entry that no controlled item claims. The row
/// always gets a fresh temporary alias; an alias that once named a
/// controlled item is never reused for an uncontrolled one.
pub fn synthesize_uncontrolled(
    db: &Database,
    policy: &NamePolicy,
    dir: Alias,
    entry: DiskEntry,
) -> Result<PrescanRow, WcError> {
    let gid = new_tmp_gid();
    let alias = db.create_gid(&gid, true)?;
    let class = if policy.is_reserved(&entry.name) {
        ScanClass::Reserved
    } else {
        ScanClass::UncontrolledUnqualified
    };
    debug!(dir = %dir, alias = %alias, name = %entry.name, class = ?class, "synthesized uncontrolled row");
    Ok(PrescanRow {
        alias,
        gid,
        tree: None,
        pc: None,
        class,
        disk: Some(entry),
        scan_dir: dir,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntryType;
    use std::fs;

    fn setup() -> (Database, Alias) {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.create_tree_table("L0").unwrap();
        let root = db.create_gid("groot", false).unwrap();
        (db, root)
    }

    fn file_row(db: &Database, gid: &str, parent: Alias, name: &str) -> Alias {
        let alias = db.create_gid(gid, false).unwrap();
        db.insert_tree_row(
            "L0",
            &TreeRow {
                alias,
                parent_alias: parent,
                content_hash: "h".into(),
                entry_type: EntryType::File,
                attrbits: 0,
                name: name.into(),
            },
        )
        .unwrap();
        alias
    }

    #[test]
    fn test_classification() {
        let (db, root) = setup();
        let dir = tempfile::tempdir().unwrap();
        let policy = NamePolicy::new(vec![".wc".into()], false);

        let present = file_row(&db, "gpresent", root, "present.txt");
        let lost = file_row(&db, "glost", root, "lost.txt");
        let deleted = file_row(&db, "gdel", root, "deleted.txt");
        let sparse = file_row(&db, "gsparse", root, "sparse.txt");
        let mut pc = PcRow::from_tree(&db.get_tree_row("L0", deleted).unwrap().unwrap());
        pc.flags = PcFlags::DELETED;
        db.upsert_pending_change(&pc).unwrap();
        let mut pc = PcRow::from_tree(&db.get_tree_row("L0", sparse).unwrap().unwrap());
        pc.flags = PcFlags::SPARSE;
        db.upsert_pending_change(&pc).unwrap();

        fs::write(dir.path().join("present.txt"), b"x").unwrap();
        fs::write(dir.path().join("deleted.txt"), b"again").unwrap();
        fs::write(dir.path().join("stray.txt"), b"y").unwrap();
        fs::create_dir(dir.path().join(".wc")).unwrap();

        let scan = scan_dir(&db, &policy, "L0", root, Some(dir.path())).unwrap();
        let class_of = |alias: Alias| scan.rows.iter().find(|r| r.alias == alias).unwrap().class;
        assert_eq!(class_of(present), ScanClass::ControlledActive);
        assert_eq!(class_of(lost), ScanClass::ControlledLost);
        assert_eq!(class_of(deleted), ScanClass::ControlledActive);
        assert_eq!(class_of(sparse), ScanClass::ControlledSparse);

        let uncontrolled: Vec<&PrescanRow> = scan
            .rows
            .iter()
            .filter(|r| !r.class.is_controlled())
            .collect();
        assert_eq!(uncontrolled.len(), 3);
        let reserved = uncontrolled
            .iter()
            .find(|r| r.effective_name() == Some(".wc"))
            .unwrap();
        assert_eq!(reserved.class, ScanClass::Reserved);
        // The re-created file under a deleted item's name is a new item.
        let twin = uncontrolled
            .iter()
            .find(|r| r.effective_name() == Some("deleted.txt"))
            .unwrap();
        assert_ne!(twin.alias, deleted);
        assert!(twin.gid.starts_with('t'));
    }

    #[test]
    fn test_type_mismatch_is_lost() {
        let (db, root) = setup();
        let dir = tempfile::tempdir().unwrap();
        let policy = NamePolicy::new(vec![".wc".into()], false);
        let item = file_row(&db, "gitem", root, "thing");
        fs::create_dir(dir.path().join("thing")).unwrap();

        let scan = scan_dir(&db, &policy, "L0", root, Some(dir.path())).unwrap();
        assert_eq!(scan.rows.len(), 2);
        let row = scan.rows.iter().find(|r| r.alias == item).unwrap();
        assert_eq!(row.class, ScanClass::ControlledLost);
    }

    #[test]
    fn test_no_disk_presence() {
        let (db, root) = setup();
        let policy = NamePolicy::new(vec![], false);
        file_row(&db, "ga", root, "a.txt");
        let scan = scan_dir(&db, &policy, "L0", root, None).unwrap();
        assert_eq!(scan.rows.len(), 1);
        assert_eq!(scan.rows[0].class, ScanClass::ControlledLost);
    }
}
