//! Status flags: one wide bitfield describing every observable difference
//! between an item's baseline and its live state.
//!
//! Bits are grouped by axis. T (type), R (reserved), U (uncontrolled),
//! S (structural), C (dynamic content/attributes), X/XU/XR (conflict,
//! unresolved and resolved per axis), L (lock), M (automerge annotation)
//! and A (informational and aggregate).

use std::fmt;
use std::path::PathBuf;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::WcError;
use crate::models::{Alias, EntryType, PcFlags};
use crate::prescan::ScanClass;
use crate::tx::Transaction;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusFlags: u64 {
        // T
        const T_FILE = 1 << 0;
        const T_DIRECTORY = 1 << 1;
        const T_SYMLINK = 1 << 2;
        const T_SUBREPO = 1 << 3;
        const T_INVALID = 1 << 4;

        // R
        const R_RESERVED = 1 << 8;

        // U
        const U_FOUND = 1 << 9;
        const U_IGNORED = 1 << 10;
        const U_LOST = 1 << 11;

        // S
        const S_ADDED = 1 << 12;
        const S_DELETED = 1 << 13;
        const S_RENAMED = 1 << 14;
        const S_MOVED = 1 << 15;
        const S_MERGE_CREATED = 1 << 16;
        const S_UPDATE_CREATED = 1 << 17;

        // C
        const C_ATTRBITS_CHANGED = 1 << 20;
        const C_CONTENT_CHANGED = 1 << 21;

        // X
        const X_UNRESOLVED = 1 << 24;
        const X_RESOLVED = 1 << 25;
        const XU_EXISTENCE = 1 << 26;
        const XU_NAME = 1 << 27;
        const XU_LOCATION = 1 << 28;
        const XU_ATTRIBUTES = 1 << 29;
        const XU_CONTENTS = 1 << 30;
        const XR_EXISTENCE = 1 << 32;
        const XR_NAME = 1 << 33;
        const XR_LOCATION = 1 << 34;
        const XR_ATTRIBUTES = 1 << 35;
        const XR_CONTENTS = 1 << 36;

        // L
        const L_LOCKED_BY_USER = 1 << 40;
        const L_LOCKED_BY_OTHER = 1 << 41;
        const L_WAITING = 1 << 42;
        const L_PENDING_VIOLATION = 1 << 43;

        // M
        const M_AUTO_MERGED = 1 << 44;
        const M_AUTO_MERGED_EDITED = 1 << 45;

        // A
        const A_SPARSE = 1 << 48;
        const A_MULTIPLE_CHANGE = 1 << 49;
    }
}

impl StatusFlags {
    pub const T_MASK: StatusFlags = StatusFlags::T_FILE
        .union(StatusFlags::T_DIRECTORY)
        .union(StatusFlags::T_SYMLINK)
        .union(StatusFlags::T_SUBREPO)
        .union(StatusFlags::T_INVALID);
    pub const S_MASK: StatusFlags = StatusFlags::S_ADDED
        .union(StatusFlags::S_DELETED)
        .union(StatusFlags::S_RENAMED)
        .union(StatusFlags::S_MOVED)
        .union(StatusFlags::S_MERGE_CREATED)
        .union(StatusFlags::S_UPDATE_CREATED);
    pub const C_MASK: StatusFlags =
        StatusFlags::C_ATTRBITS_CHANGED.union(StatusFlags::C_CONTENT_CHANGED);
    pub const XU_MASK: StatusFlags = StatusFlags::XU_EXISTENCE
        .union(StatusFlags::XU_NAME)
        .union(StatusFlags::XU_LOCATION)
        .union(StatusFlags::XU_ATTRIBUTES)
        .union(StatusFlags::XU_CONTENTS);
    pub const XR_MASK: StatusFlags = StatusFlags::XR_EXISTENCE
        .union(StatusFlags::XR_NAME)
        .union(StatusFlags::XR_LOCATION)
        .union(StatusFlags::XR_ATTRIBUTES)
        .union(StatusFlags::XR_CONTENTS);
    pub const X_MASK: StatusFlags = StatusFlags::X_UNRESOLVED
        .union(StatusFlags::X_RESOLVED)
        .union(StatusFlags::XU_MASK)
        .union(StatusFlags::XR_MASK);
    pub const L_MASK: StatusFlags = StatusFlags::L_LOCKED_BY_USER
        .union(StatusFlags::L_LOCKED_BY_OTHER)
        .union(StatusFlags::L_WAITING)
        .union(StatusFlags::L_PENDING_VIOLATION);
    pub const M_MASK: StatusFlags =
        StatusFlags::M_AUTO_MERGED.union(StatusFlags::M_AUTO_MERGED_EDITED);

    /// Bits counted by the multiple-change aggregate.
    pub const COUNTED: StatusFlags = StatusFlags::U_FOUND
        .union(StatusFlags::U_IGNORED)
        .union(StatusFlags::U_LOST)
        .union(StatusFlags::S_ADDED)
        .union(StatusFlags::S_DELETED)
        .union(StatusFlags::S_RENAMED)
        .union(StatusFlags::S_MOVED)
        .union(StatusFlags::C_ATTRBITS_CHANGED)
        .union(StatusFlags::C_CONTENT_CHANGED);

    /// Bits that make an item worth listing in a status report.
    pub const CHANGE_MASK: StatusFlags = StatusFlags::COUNTED
        .union(StatusFlags::S_MERGE_CREATED)
        .union(StatusFlags::S_UPDATE_CREATED)
        .union(StatusFlags::X_MASK)
        .union(StatusFlags::L_MASK);

    pub fn for_entry_type(entry_type: EntryType) -> Self {
        match entry_type {
            EntryType::File => Self::T_FILE,
            EntryType::Directory => Self::T_DIRECTORY,
            EntryType::Symlink => Self::T_SYMLINK,
            EntryType::Submodule => Self::T_SUBREPO,
        }
    }

    /// Unresolved conflict axes.
    pub fn unresolved_axes(self) -> Vec<ConflictAxis> {
        ConflictAxis::ALL
            .into_iter()
            .filter(|axis| self.contains(axis.xu()))
            .collect()
    }

    /// Short codes for display, e.g. `["modified", "renamed"]`.
    pub fn labels(self) -> Vec<&'static str> {
        const NAMES: &[(StatusFlags, &str)] = &[
            (StatusFlags::R_RESERVED, "reserved"),
            (StatusFlags::U_FOUND, "found"),
            (StatusFlags::U_IGNORED, "ignored"),
            (StatusFlags::U_LOST, "lost"),
            (StatusFlags::S_ADDED, "added"),
            (StatusFlags::S_DELETED, "deleted"),
            (StatusFlags::S_RENAMED, "renamed"),
            (StatusFlags::S_MOVED, "moved"),
            (StatusFlags::S_MERGE_CREATED, "merge-created"),
            (StatusFlags::S_UPDATE_CREATED, "update-created"),
            (StatusFlags::C_ATTRBITS_CHANGED, "attributes"),
            (StatusFlags::C_CONTENT_CHANGED, "modified"),
            (StatusFlags::X_UNRESOLVED, "unresolved"),
            (StatusFlags::X_RESOLVED, "resolved"),
            (StatusFlags::L_LOCKED_BY_USER, "locked"),
            (StatusFlags::L_LOCKED_BY_OTHER, "locked-by-other"),
            (StatusFlags::L_WAITING, "lock-waiting"),
            (StatusFlags::L_PENDING_VIOLATION, "lock-violation"),
            (StatusFlags::M_AUTO_MERGED, "auto-merged"),
            (StatusFlags::M_AUTO_MERGED_EDITED, "auto-merged-edited"),
            (StatusFlags::A_SPARSE, "sparse"),
        ];
        NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Conflict axes
// ---------------------------------------------------------------------------

/// One dimension along which a merge can leave an item conflicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictAxis {
    Existence,
    Name,
    Location,
    Attributes,
    Contents,
}

impl ConflictAxis {
    pub const ALL: [ConflictAxis; 5] = [
        Self::Existence,
        Self::Name,
        Self::Location,
        Self::Attributes,
        Self::Contents,
    ];

    pub fn xu(self) -> StatusFlags {
        match self {
            Self::Existence => StatusFlags::XU_EXISTENCE,
            Self::Name => StatusFlags::XU_NAME,
            Self::Location => StatusFlags::XU_LOCATION,
            Self::Attributes => StatusFlags::XU_ATTRIBUTES,
            Self::Contents => StatusFlags::XU_CONTENTS,
        }
    }

    pub fn xr(self) -> StatusFlags {
        match self {
            Self::Existence => StatusFlags::XR_EXISTENCE,
            Self::Name => StatusFlags::XR_NAME,
            Self::Location => StatusFlags::XR_LOCATION,
            Self::Attributes => StatusFlags::XR_ATTRIBUTES,
            Self::Contents => StatusFlags::XR_CONTENTS,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Existence => "existence",
            Self::Name => "name",
            Self::Location => "location",
            Self::Attributes => "attributes",
            Self::Contents => "contents",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|axis| axis.as_str() == s)
    }
}

impl fmt::Display for ConflictAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Computation
// ---------------------------------------------------------------------------

/// Caller switches for a status computation.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatusOptions {
    /// Report every uncontrolled item as found, ignoring ignore patterns.
    pub no_ignores: bool,
    /// List unchanged items too.
    pub list_all: bool,
}

/// One line of a status report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    pub alias: Alias,
    pub path: PathBuf,
    pub flags: StatusFlags,
}

impl Transaction<'_> {
    /// Compute the status flags of one item. An alias with no item is
    /// reported as `T_INVALID`.
    pub fn status(&mut self, alias: Alias, opts: StatusOptions) -> Result<StatusFlags, WcError> {
        match self.ensure_item(alias) {
            Ok(()) => {}
            Err(WcError::NotFound { .. }) => return Ok(StatusFlags::T_INVALID),
            Err(e) => return Err(e),
        }
        let (class, entry_type, pc_flags) = {
            let item = self.item(alias)?;
            (item.class, item.entry_type, item.flags())
        };

        let mut flags = StatusFlags::for_entry_type(entry_type);

        match class {
            ScanClass::UncontrolledUnqualified => {
                if !opts.no_ignores && self.is_ignored(alias)? {
                    flags |= StatusFlags::U_IGNORED;
                } else {
                    flags |= StatusFlags::U_FOUND;
                }
                return Ok(flags);
            }
            ScanClass::Reserved => return Ok(flags | StatusFlags::R_RESERVED),
            ScanClass::ControlledLost => flags |= StatusFlags::U_LOST,
            ScanClass::ControlledSparse => flags |= StatusFlags::A_SPARSE,
            ScanClass::ControlledActive => {}
        }

        flags |= structural_bits(pc_flags);

        let skip_c = flags.intersects(
            StatusFlags::S_ADDED
                | StatusFlags::U_FOUND
                | StatusFlags::U_IGNORED
                | StatusFlags::S_DELETED
                | StatusFlags::U_LOST
                | StatusFlags::S_MERGE_CREATED,
        );
        if !skip_c {
            if !flags.contains(StatusFlags::S_UPDATE_CREATED)
                && self.original_attrbits(alias)? != self.current_attrbits(alias)?
            {
                flags |= StatusFlags::C_ATTRBITS_CHANGED;
            }
            if entry_type != EntryType::Directory {
                let original = self.original_hid(alias)?.unwrap_or_default();
                let current = self.current_hid(alias)?;
                if original != current {
                    flags |= StatusFlags::C_CONTENT_CHANGED;
                }
            }
        }

        self.load_issue(alias)?;
        let issue_bits = self
            .item(alias)?
            .issue()
            .map(|issue| (issue.status_flags, issue.doc.automerge_generated_hid.clone()));
        if let Some((issue_flags, automerge_hid)) = issue_bits {
            flags |= issue_flags & StatusFlags::X_MASK;
            if let Some(automerge_hid) = automerge_hid {
                let exists = !flags.intersects(StatusFlags::S_DELETED | StatusFlags::U_LOST);
                if entry_type == EntryType::File && exists {
                    if self.current_hid(alias)? == automerge_hid {
                        flags |= StatusFlags::M_AUTO_MERGED;
                    } else {
                        flags |= StatusFlags::M_AUTO_MERGED_EDITED;
                    }
                }
            }
        }

        flags |= self.lock_bits(alias, flags)?;

        if (flags & StatusFlags::COUNTED).bits().count_ones() > 1 {
            flags |= StatusFlags::A_MULTIPLE_CHANGE;
        }
        debug!(alias = %alias, flags = ?flags, "computed status");
        Ok(flags)
    }

    /// Walk the live tree and report items with changes (or every item with
    /// `list_all`). Ignored items are only reported with `list_all`.
    pub fn status_all(&mut self, opts: StatusOptions) -> Result<Vec<StatusEntry>, WcError> {
        let mut entries = Vec::new();
        let mut stack = vec![self.root];
        while let Some(dir) = stack.pop() {
            let mut children = self.residents(dir)?;
            children.sort_by_key(|alias| std::cmp::Reverse(*alias));
            for child in children {
                let flags = self.status(child, opts)?;
                let report = if flags.contains(StatusFlags::U_IGNORED) {
                    opts.list_all
                } else {
                    opts.list_all || flags.intersects(StatusFlags::CHANGE_MASK)
                };
                if report {
                    entries.push(StatusEntry {
                        alias: child,
                        path: self.current_path(child)?,
                        flags,
                    });
                }
                let descend = flags.contains(StatusFlags::T_DIRECTORY)
                    && !flags.intersects(
                        StatusFlags::U_FOUND | StatusFlags::U_IGNORED | StatusFlags::R_RESERVED,
                    );
                if descend {
                    stack.push(child);
                }
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    /// Lock bits for one item. Locks are fetched once per transaction.
    fn lock_bits(&mut self, alias: Alias, flags: StatusFlags) -> Result<StatusFlags, WcError> {
        if self.locks.is_none() {
            let locks = self.wc.db().list_active_locks(&self.wc.config().locks.branch)?;
            debug!(count = locks.len(), "loaded active locks");
            self.locks = Some(locks);
        }
        let gid = self.item(alias)?.gid().to_string();
        let user = &self.wc.config().user.name;
        let mut bits = StatusFlags::empty();
        for lock in self.locks.iter().flatten().filter(|l| l.gid == gid) {
            if lock.pull_blocked {
                bits |= StatusFlags::L_WAITING;
            }
            if &lock.owner == user {
                bits |= StatusFlags::L_LOCKED_BY_USER;
            } else {
                bits |= StatusFlags::L_LOCKED_BY_OTHER;
                if flags.contains(StatusFlags::C_CONTENT_CHANGED) {
                    bits |= StatusFlags::L_PENDING_VIOLATION;
                }
            }
        }
        Ok(bits)
    }
}

fn structural_bits(pc: PcFlags) -> StatusFlags {
    let mut flags = StatusFlags::empty();
    for (pc_bit, status_bit) in [
        (PcFlags::ADDED, StatusFlags::S_ADDED),
        (PcFlags::ADD_SPECIAL_MERGE, StatusFlags::S_MERGE_CREATED),
        (PcFlags::ADD_SPECIAL_UPDATE, StatusFlags::S_UPDATE_CREATED),
        (PcFlags::DELETED, StatusFlags::S_DELETED),
        (PcFlags::RENAMED, StatusFlags::S_RENAMED),
        (PcFlags::MOVED, StatusFlags::S_MOVED),
    ] {
        if pc.contains(pc_bit) {
            flags |= status_bit;
        }
    }
    flags
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_groups_do_not_overlap() {
        let groups = [
            StatusFlags::T_MASK,
            StatusFlags::S_MASK,
            StatusFlags::C_MASK,
            StatusFlags::X_MASK,
            StatusFlags::L_MASK,
            StatusFlags::M_MASK,
            StatusFlags::R_RESERVED,
            StatusFlags::U_FOUND | StatusFlags::U_IGNORED | StatusFlags::U_LOST,
            StatusFlags::A_SPARSE | StatusFlags::A_MULTIPLE_CHANGE,
        ];
        for (i, a) in groups.iter().enumerate() {
            for b in &groups[i + 1..] {
                assert!(!a.intersects(*b), "{a:?} overlaps {b:?}");
            }
        }
    }

    #[test]
    fn test_counted_excludes_annotations() {
        assert!(!StatusFlags::COUNTED.intersects(StatusFlags::X_MASK));
        assert!(!StatusFlags::COUNTED.intersects(StatusFlags::L_MASK));
        assert!(!StatusFlags::COUNTED.intersects(StatusFlags::M_MASK));
        assert!(!StatusFlags::COUNTED.contains(StatusFlags::A_SPARSE));
    }

    #[test]
    fn test_structural_bits_combine() {
        let flags = structural_bits(PcFlags::RENAMED | PcFlags::MOVED);
        assert_eq!(flags, StatusFlags::S_RENAMED | StatusFlags::S_MOVED);
        assert_eq!(
            structural_bits(PcFlags::ADD_SPECIAL_MERGE),
            StatusFlags::S_MERGE_CREATED
        );
        assert!(structural_bits(PcFlags::SPARSE).is_empty());
    }

    #[test]
    fn test_axis_bits_and_parse() {
        for axis in ConflictAxis::ALL {
            assert!(StatusFlags::XU_MASK.contains(axis.xu()));
            assert!(StatusFlags::XR_MASK.contains(axis.xr()));
            assert_eq!(ConflictAxis::parse(axis.as_str()), Some(axis));
        }
        let flags = StatusFlags::XU_NAME | StatusFlags::XU_CONTENTS;
        assert_eq!(
            flags.unresolved_axes(),
            vec![ConflictAxis::Name, ConflictAxis::Contents]
        );
    }

    #[test]
    fn test_labels() {
        let flags = StatusFlags::T_FILE | StatusFlags::S_RENAMED | StatusFlags::C_CONTENT_CHANGED;
        assert_eq!(flags.labels(), vec!["renamed", "modified"]);
    }
}
