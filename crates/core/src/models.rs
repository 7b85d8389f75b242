//! Domain model types shared by the row store, prescan, liveview and
//! resolve layers.

use std::fmt;

use bitflags::bitflags;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Alias
// ---------------------------------------------------------------------------

/// Dense integer surrogate for a GID. Primary key of every row-store table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Alias(pub i64);

impl Alias {
    /// Never assigned.
    pub const INVALID: Alias = Alias(0);
    /// Parent of the working-copy root. Present in the gid table but never
    /// the alias of a real item.
    pub const NULL_ROOT: Alias = Alias(1);

    pub fn is_sentinel(self) -> bool {
        self == Self::INVALID || self == Self::NULL_ROOT
    }
}

impl fmt::Display for Alias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl ToSql for Alias {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Alias {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(Alias)
    }
}

/// GID of the null-root sentinel row.
pub const NULL_ROOT_GID: &str = "g0000000000000000000000000000000000";

/// Entry name of the working-copy root in every tree.
pub const ROOT_ENTRYNAME: &str = "@";

/// Changeset label of the active baseline.
pub const BASELINE_LABEL: &str = "L0";

/// Generate a fresh permanent GID.
pub fn new_gid() -> String {
    format!("g{}", uuid::Uuid::new_v4().simple())
}

/// Generate a temporary GID for an uncontrolled item.
pub fn new_tmp_gid() -> String {
    format!("t{}", uuid::Uuid::new_v4().simple())
}

/// First seven characters of a GID, as used in mangled and parked names.
pub fn gid7(gid: &str) -> &str {
    let end = gid.char_indices().nth(7).map(|(i, _)| i).unwrap_or(gid.len());
    &gid[..end]
}

// ---------------------------------------------------------------------------
// Entry types and attribute bits
// ---------------------------------------------------------------------------

/// Kind of a versioned item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryType {
    File,
    Directory,
    Symlink,
    Submodule,
}

impl EntryType {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::File => 1,
            Self::Directory => 2,
            Self::Symlink => 3,
            Self::Submodule => 4,
        }
    }

    pub fn from_i64(v: i64) -> Option<Self> {
        match v {
            1 => Some(Self::File),
            2 => Some(Self::Directory),
            3 => Some(Self::Symlink),
            4 => Some(Self::Submodule),
            _ => None,
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File => write!(f, "file"),
            Self::Directory => write!(f, "directory"),
            Self::Symlink => write!(f, "symlink"),
            Self::Submodule => write!(f, "submodule"),
        }
    }
}

impl ToSql for EntryType {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_i64()))
    }
}

impl FromSql for EntryType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let v = i64::column_result(value)?;
        Self::from_i64(v).ok_or(FromSqlError::OutOfRange(v))
    }
}

/// Executable bit.
pub const ATTRBITS_EXEC: u64 = 0x1;

/// The attribute bits this platform can observe and set.
pub fn platform_definable_mask() -> u64 {
    if cfg!(unix) {
        ATTRBITS_EXEC
    } else {
        0
    }
}

/// Reconcile baseline attribute bits with a live observation. Bits outside
/// `mask` cannot be observed here, so they are inherited from the baseline
/// unchanged; bits inside `mask` come from the observation.
pub fn effective_attrbits(baseline: u64, observed: u64, mask: u64) -> u64 {
    (baseline & !mask) | (observed & mask)
}

// ---------------------------------------------------------------------------
// Tree rows
// ---------------------------------------------------------------------------

/// An item's recorded state in one reference changeset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeRow {
    pub alias: Alias,
    pub parent_alias: Alias,
    pub content_hash: String,
    pub entry_type: EntryType,
    pub attrbits: u64,
    pub name: String,
}

// ---------------------------------------------------------------------------
// Pending changes
// ---------------------------------------------------------------------------

bitflags! {
    /// Cumulative structural changes of one item relative to the baseline.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct PcFlags: u32 {
        const ADDED = 1 << 0;
        const DELETED = 1 << 1;
        const RENAMED = 1 << 2;
        const MOVED = 1 << 3;
        const ADD_SPECIAL_MERGE = 1 << 4;
        const ADD_SPECIAL_UPDATE = 1 << 5;
        const SPARSE = 1 << 6;
    }
}

impl PcFlags {
    /// Flags that make an item exist without a baseline row.
    pub const CREATED: PcFlags = PcFlags::ADDED
        .union(PcFlags::ADD_SPECIAL_MERGE)
        .union(PcFlags::ADD_SPECIAL_UPDATE);
}

/// Sparse sub-record of a pending change: content that exists in the
/// version history but is deliberately not materialized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseInfo {
    pub content_hash: String,
    pub attrbits: u64,
}

/// Queued-but-uncommitted structural state of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcRow {
    pub alias: Alias,
    pub parent_alias: Alias,
    pub name: String,
    pub entry_type: EntryType,
    pub flags: PcFlags,
    pub merge_content_hash: Option<String>,
    pub sparse: Option<SparseInfo>,
}

impl PcRow {
    /// Start a pending-change row that mirrors a baseline row.
    pub fn from_tree(tree: &TreeRow) -> Self {
        Self {
            alias: tree.alias,
            parent_alias: tree.parent_alias,
            name: tree.name.clone(),
            entry_type: tree.entry_type,
            flags: PcFlags::empty(),
            merge_content_hash: None,
            sparse: None,
        }
    }

    /// Recompute RENAMED/MOVED from the final name and parent so that a
    /// change that is walked back leaves no trace.
    pub fn recompute_structural(&mut self, baseline: Option<&TreeRow>) {
        self.flags.remove(PcFlags::RENAMED | PcFlags::MOVED);
        if let Some(tree) = baseline {
            if self.name != tree.name {
                self.flags.insert(PcFlags::RENAMED);
            }
            if self.parent_alias != tree.parent_alias {
                self.flags.insert(PcFlags::MOVED);
            }
        }
    }

    /// A row without flags carries no information and should be deleted.
    pub fn is_noop(&self) -> bool {
        self.flags.is_empty() && self.merge_content_hash.is_none() && self.sparse.is_none()
    }
}

// ---------------------------------------------------------------------------
// Merge issues
// ---------------------------------------------------------------------------

bitflags! {
    /// Conflict causes recorded by the tree merge.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ConflictFlags: u32 {
        const DELETE_VS_MOVE = 1 << 0;
        const DELETE_VS_RENAME = 1 << 1;
        const DELETE_VS_ATTRBITS = 1 << 2;
        const DELETE_VS_FILE_EDIT = 1 << 3;
        const DELETE_VS_SYMLINK_EDIT = 1 << 4;
        const DELETE_VS_SUBMODULE_EDIT = 1 << 5;
        const DELETE_VS_ADD = 1 << 6;
        const DIVERGENT_MOVE = 1 << 8;
        const MOVES_CAUSED_PATH_CYCLE = 1 << 9;
        const DIVERGENT_RENAME = 1 << 10;
        const DIVERGENT_ATTRBITS = 1 << 11;
        const DIVERGENT_FILE_EDIT_TBD = 1 << 12;
        const DIVERGENT_FILE_EDIT_AUTO_CONFLICT = 1 << 13;
        const DIVERGENT_FILE_EDIT_AUTO_ERROR = 1 << 14;
        const DIVERGENT_SYMLINK_EDIT = 1 << 15;
        const DIVERGENT_SUBMODULE_EDIT = 1 << 16;
    }
}

impl ConflictFlags {
    pub const EXISTENCE: ConflictFlags = ConflictFlags::DELETE_VS_MOVE
        .union(ConflictFlags::DELETE_VS_RENAME)
        .union(ConflictFlags::DELETE_VS_ATTRBITS)
        .union(ConflictFlags::DELETE_VS_FILE_EDIT)
        .union(ConflictFlags::DELETE_VS_SYMLINK_EDIT)
        .union(ConflictFlags::DELETE_VS_SUBMODULE_EDIT)
        .union(ConflictFlags::DELETE_VS_ADD);
    pub const NAME: ConflictFlags = ConflictFlags::DIVERGENT_RENAME;
    pub const LOCATION: ConflictFlags =
        ConflictFlags::DIVERGENT_MOVE.union(ConflictFlags::MOVES_CAUSED_PATH_CYCLE);
    pub const ATTRIBUTES: ConflictFlags = ConflictFlags::DIVERGENT_ATTRBITS;
    pub const CONTENTS: ConflictFlags = ConflictFlags::DIVERGENT_FILE_EDIT_TBD
        .union(ConflictFlags::DIVERGENT_FILE_EDIT_AUTO_CONFLICT)
        .union(ConflictFlags::DIVERGENT_FILE_EDIT_AUTO_ERROR)
        .union(ConflictFlags::DIVERGENT_SYMLINK_EDIT)
        .union(ConflictFlags::DIVERGENT_SUBMODULE_EDIT);
}

/// One side's view of an item as recorded by the merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueInput {
    pub entryname: String,
    pub gid_parent: String,
    pub attrbits: u64,
    pub hid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempfile: Option<String>,
}

/// The three merge inputs, each optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueInputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ancestor: Option<IssueInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<IssueInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub other: Option<IssueInput>,
}

/// Where the merge placed the item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueOutput {
    pub entryname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tempfile: Option<String>,
}

/// The immutable conflict facts computed by the tree merge for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueDoc {
    pub gid: String,
    pub tne_type: i64,
    #[serde(default)]
    pub conflict_flags: u32,
    #[serde(default)]
    pub collision_flags: u32,
    #[serde(default)]
    pub portability_flags: u64,
    #[serde(default)]
    pub input: IssueInputs,
    #[serde(default)]
    pub output: IssueOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automerge_mergetool: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub automerge_generated_hid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collisions: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub portability_collisions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_path_cycle_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflict_path_cycle_others: Vec<String>,
}

impl IssueDoc {
    pub fn entry_type(&self) -> Option<EntryType> {
        EntryType::from_i64(self.tne_type)
    }

    pub fn conflict_flags(&self) -> ConflictFlags {
        ConflictFlags::from_bits_truncate(self.conflict_flags)
    }

    /// The item occupies a slot another item also wants.
    pub fn has_collision_cause(&self) -> bool {
        self.collision_flags != 0 || !self.collisions.is_empty()
    }

    /// The item's name is not portable or collides after normalization.
    pub fn has_portability_cause(&self) -> bool {
        self.portability_flags != 0 || !self.portability_collisions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(name: &str, parent: i64) -> TreeRow {
        TreeRow {
            alias: Alias(10),
            parent_alias: Alias(parent),
            content_hash: "h".into(),
            entry_type: EntryType::File,
            attrbits: 0,
            name: name.into(),
        }
    }

    #[test]
    fn test_recompute_structural_collapses_reverts() {
        let base = tree("foo.txt", 2);
        let mut pc = PcRow::from_tree(&base);

        pc.name = "bar.txt".into();
        pc.recompute_structural(Some(&base));
        assert_eq!(pc.flags, PcFlags::RENAMED);

        pc.parent_alias = Alias(3);
        pc.recompute_structural(Some(&base));
        assert_eq!(pc.flags, PcFlags::RENAMED | PcFlags::MOVED);

        pc.name = "foo.txt".into();
        pc.parent_alias = Alias(2);
        pc.recompute_structural(Some(&base));
        assert!(pc.is_noop());
    }

    #[test]
    fn test_effective_attrbits_idempotent() {
        for mask in [0u64, ATTRBITS_EXEC, 0xff] {
            for baseline in [0u64, 1, 0x10, 0x11, 0xf0] {
                for observed in [0u64, 1, 0x10, 0x11] {
                    let once = effective_attrbits(baseline, observed, mask);
                    let twice = effective_attrbits(once, observed, mask);
                    assert_eq!(once, twice);
                    assert_eq!(once & mask, observed & mask);
                    assert_eq!(once & !mask, baseline & !mask);
                }
            }
        }
    }

    #[test]
    fn test_effective_attrbits_order_independence() {
        let mask = ATTRBITS_EXEC;
        // Two baselines that differ only in non-definable bits, observed
        // identically, keep their own non-definable bits.
        let a = effective_attrbits(0x10, 1, mask);
        let b = effective_attrbits(0x20, 1, mask);
        assert_eq!(a & mask, b & mask);
        assert_eq!(a, 0x11);
        assert_eq!(b, 0x21);
    }

    #[test]
    fn test_gid7_and_generation() {
        let gid = new_gid();
        assert!(gid.starts_with('g'));
        assert_eq!(gid.len(), 33);
        assert_eq!(gid7(&gid).len(), 7);
        assert_eq!(gid7("g12"), "g12");
        assert!(new_tmp_gid().starts_with('t'));
    }

    #[test]
    fn test_issue_doc_parses_minimal_json() {
        let json = r#"{
            "gid": "gabc",
            "tne_type": 1,
            "conflict_flags": 8,
            "input": {
                "baseline": {"entryname": "f.txt", "gid_parent": "groot", "attrbits": 0, "hid": "h1"},
                "other": {"entryname": "f.txt", "gid_parent": "groot", "attrbits": 0, "hid": "h2"}
            },
            "output": {"entryname": "f.txt"}
        }"#;
        let doc: IssueDoc = serde_json::from_str(json).unwrap();
        assert_eq!(doc.entry_type(), Some(EntryType::File));
        assert!(doc.conflict_flags().contains(ConflictFlags::DELETE_VS_FILE_EDIT));
        assert!(doc.input.ancestor.is_none());
        assert!(!doc.has_collision_cause());
    }
}
