//! Merge-join of a directory's baseline tree rows with its pending-change
//! rows.
//!
//! The tree pass runs first and claims every alias it visits; the
//! pending-change pass then contributes only aliases the tree pass did not
//! see (pure adds and items moved in). Each alias is yielded exactly once.

use std::collections::HashSet;

use crate::db::Database;
use crate::errors::DatabaseError;
use crate::models::{Alias, PcRow, TreeRow};

/// One joined row for a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedRow {
    pub alias: Alias,
    pub tree: Option<TreeRow>,
    pub pc: Option<PcRow>,
    /// `false` when the baseline places the item here but a pending move
    /// has taken it elsewhere.
    pub resident: bool,
}

/// Lazy, finite sequence of [`JoinedRow`]s for one directory. Not
/// restartable; build a new one when the directory's pending state changes.
pub struct DirJoin<'a> {
    db: &'a Database,
    label: &'a str,
    dir: Alias,
    tree_rows: std::vec::IntoIter<TreeRow>,
    pc_rows: std::vec::IntoIter<PcRow>,
    seen: HashSet<Alias>,
}

impl<'a> DirJoin<'a> {
    pub fn new(db: &'a Database, label: &'a str, dir: Alias) -> Result<Self, DatabaseError> {
        let tree_rows = db.list_tree_children(label, dir)?;
        let pc_rows = db.list_pending_children(dir)?;
        Ok(Self {
            db,
            label,
            dir,
            tree_rows: tree_rows.into_iter(),
            pc_rows: pc_rows.into_iter(),
            seen: HashSet::new(),
        })
    }
}

impl Iterator for DirJoin<'_> {
    type Item = Result<JoinedRow, DatabaseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(tree) = self.tree_rows.next() {
            self.seen.insert(tree.alias);
            let pc = match self.db.get_pending_change(tree.alias) {
                Ok(pc) => pc,
                Err(e) => return Some(Err(e)),
            };
            let resident = pc.as_ref().map_or(true, |pc| pc.parent_alias == self.dir);
            return Some(Ok(JoinedRow {
                alias: tree.alias,
                tree: Some(tree),
                pc,
                resident,
            }));
        }

        for pc in self.pc_rows.by_ref() {
            if !self.seen.insert(pc.alias) {
                continue;
            }
            let tree = match self.db.get_tree_row(self.label, pc.alias) {
                Ok(tree) => tree,
                Err(e) => return Some(Err(e)),
            };
            return Some(Ok(JoinedRow {
                alias: pc.alias,
                tree,
                pc: Some(pc),
                resident: true,
            }));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntryType, PcFlags};

    fn tree_row(alias: Alias, parent: Alias, name: &str) -> TreeRow {
        TreeRow {
            alias,
            parent_alias: parent,
            content_hash: "h".into(),
            entry_type: EntryType::File,
            attrbits: 0,
            name: name.into(),
        }
    }

    fn pc_row(alias: Alias, parent: Alias, name: &str, flags: PcFlags) -> PcRow {
        PcRow {
            alias,
            parent_alias: parent,
            name: name.into(),
            entry_type: EntryType::File,
            flags,
            merge_content_hash: None,
            sparse: None,
        }
    }

    #[test]
    fn test_each_alias_once_and_moves_excluded() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.create_tree_table("L0").unwrap();
        let gids = ["gd1", "gd2", "gkeep", "gren", "gaway", "gin", "gnew"];
        let a: Vec<Alias> = gids.iter().map(|g| db.create_gid(g, false).unwrap()).collect();
        let (d1, d2, keep, ren, away, moved_in, added) = (a[0], a[1], a[2], a[3], a[4], a[5], a[6]);

        db.insert_tree_row("L0", &tree_row(keep, d1, "keep.txt")).unwrap();
        db.insert_tree_row("L0", &tree_row(ren, d1, "old.txt")).unwrap();
        db.insert_tree_row("L0", &tree_row(away, d1, "away.txt")).unwrap();
        db.insert_tree_row("L0", &tree_row(moved_in, d2, "in.txt")).unwrap();

        db.upsert_pending_change(&pc_row(ren, d1, "new.txt", PcFlags::RENAMED)).unwrap();
        db.upsert_pending_change(&pc_row(away, d2, "away.txt", PcFlags::MOVED)).unwrap();
        db.upsert_pending_change(&pc_row(moved_in, d1, "in.txt", PcFlags::MOVED)).unwrap();
        db.upsert_pending_change(&pc_row(added, d1, "added.txt", PcFlags::ADDED)).unwrap();

        let rows: Vec<JoinedRow> = DirJoin::new(&db, "L0", d1)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        let residents: Vec<Alias> = rows.iter().filter(|r| r.resident).map(|r| r.alias).collect();
        let moved_out: Vec<Alias> = rows.iter().filter(|r| !r.resident).map(|r| r.alias).collect();
        assert_eq!(residents.len(), 4);
        for alias in [keep, ren, moved_in, added] {
            assert_eq!(residents.iter().filter(|&&r| r == alias).count(), 1);
        }
        assert_eq!(moved_out, vec![away]);

        let renamed = rows.iter().find(|r| r.alias == ren).unwrap();
        assert_eq!(renamed.pc.as_ref().unwrap().name, "new.txt");
        let pure_add = rows.iter().find(|r| r.alias == added).unwrap();
        assert!(pure_add.tree.is_none());
    }

    #[test]
    fn test_bogus_parent_is_empty() {
        let db = Database::in_memory().unwrap();
        db.initialize().unwrap();
        db.create_tree_table("L0").unwrap();
        assert_eq!(DirJoin::new(&db, "L0", Alias(424242)).unwrap().count(), 0);
    }
}
