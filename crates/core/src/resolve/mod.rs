//! Merge-conflict resolution.
//!
//! An item with an open issue is presented as a [`ResolveItem`] holding up
//! to five [`Choice`]s, one per conflict axis. Each choice lists the
//! [`ResolveValue`]s a user can pick from, in a fixed order: ancestor,
//! baseline, other, automerge result, saved working copies, the live
//! working value, then manual merge results. A value's parents always
//! appear before it.
//!
//! Choices are rebuilt from the issue document, the persisted
//! [`ResolveDoc`] and the live view every time they are requested; the
//! only resolve state that outlives a call is the issue itself.

mod accept;
pub mod merge_tool;

use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::WcError;
use crate::journal::ContentSource;
use crate::models::{Alias, EntryType, IssueDoc, IssueInput};
use crate::status::{ConflictAxis, StatusFlags};
use crate::tx::Transaction;

pub use merge_tool::{MergeInputs, MergeOutcome, MergeToolRegistry};

pub const LABEL_ANCESTOR: &str = "ancestor";
pub const LABEL_BASELINE: &str = "baseline";
pub const LABEL_OTHER: &str = "other";
pub const LABEL_AUTOMERGE: &str = "automerge";
pub const LABEL_WORKING: &str = "working";

// ---------------------------------------------------------------------------
// Persisted resolution state
// ---------------------------------------------------------------------------

/// Accumulated resolution state of one item, stored as `resolve_json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveDoc {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accepted: Vec<AcceptRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merges: Vec<MergeRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub saved: Vec<SavedRecord>,
}

/// How one axis was resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRecord {
    pub axis: ConflictAxis,
    /// Label of the accepted value; `None` when an edit resolved the axis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// A manual merge of two contents values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeRecord {
    pub label: String,
    pub baseline: String,
    pub other: String,
    pub tool: String,
    pub outcome: MergeOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hid: Option<String>,
}

/// A working copy saved before an accept overwrote it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedRecord {
    pub label: String,
    pub hid: String,
    /// Root-relative location of the saved file.
    pub path: String,
}

impl ResolveDoc {
    pub fn accepted_for(&self, axis: ConflictAxis) -> Option<&AcceptRecord> {
        self.accepted.iter().find(|a| a.axis == axis)
    }

    pub(crate) fn record_accept(&mut self, axis: ConflictAxis, label: Option<String>) {
        self.accepted.retain(|a| a.axis != axis);
        self.accepted.push(AcceptRecord { axis, label });
    }
}

// ---------------------------------------------------------------------------
// In-memory model
// ---------------------------------------------------------------------------

/// Per-transaction resolve handle.
#[derive(Debug, Clone, Default)]
pub struct ResolveState {
    /// Items with an issue, as enumerated on first use in this transaction.
    pub aliases: Vec<Alias>,
}

/// The data a value proposes for its axis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueData {
    Existence(bool),
    Name(String),
    /// GID of the parent directory.
    Location(String),
    Attributes(u64),
    /// Content hash.
    Contents(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Ancestor,
    Baseline,
    Other,
}

/// Where a value came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueOrigin {
    Changeset(Side),
    Automerge { tool: String },
    Merge { tool: String, outcome: MergeOutcome },
    Saved,
    Working,
}

#[derive(Debug, Clone)]
pub struct ResolveValue {
    pub label: String,
    pub data: ValueData,
    /// Indices of the values this one was derived from.
    pub parents: Vec<usize>,
    pub origin: ValueOrigin,
    /// Content backing a contents value, when it is not the live file.
    pub backing: Option<ContentSource>,
}

impl ResolveValue {
    /// Values a user may accept.
    pub fn is_usable(&self) -> bool {
        !matches!(
            self.origin,
            ValueOrigin::Merge {
                outcome: MergeOutcome::Conflict | MergeOutcome::Failed,
                ..
            }
        )
    }
}

#[derive(Debug, Clone)]
pub struct Choice {
    pub axis: ConflictAxis,
    pub values: Vec<ResolveValue>,
    /// Values not yet superseded by a merge; `None` for choices that cannot
    /// be merged.
    pub leaves: Option<Vec<usize>>,
    /// Label of the accepted value, if the choice was resolved by accept.
    pub accepted: Option<String>,
    pub resolved: bool,
}

impl Choice {
    pub fn value(&self, label: &str) -> Option<(usize, &ResolveValue)> {
        self.values.iter().enumerate().find(|(_, v)| v.label == label)
    }

    pub fn working(&self) -> Option<(usize, &ResolveValue)> {
        self.values
            .iter()
            .enumerate()
            .find(|(_, v)| v.origin == ValueOrigin::Working)
    }

    pub fn is_mergeable(&self) -> bool {
        self.leaves.is_some()
    }

    /// Nearest value both `a` and `b` derive from (either may be the
    /// other's ancestor).
    pub fn common_ancestor(&self, a: usize, b: usize) -> Option<usize> {
        let from_a = self.lineage(a);
        let mut queue = VecDeque::from([b]);
        let mut seen = BTreeSet::new();
        while let Some(idx) = queue.pop_front() {
            if !seen.insert(idx) {
                continue;
            }
            if from_a.contains(&idx) {
                return Some(idx);
            }
            queue.extend(self.values[idx].parents.iter().copied());
        }
        None
    }

    /// `idx` and everything it derives from.
    fn lineage(&self, idx: usize) -> BTreeSet<usize> {
        let mut out = BTreeSet::new();
        let mut queue = vec![idx];
        while let Some(i) = queue.pop() {
            if out.insert(i) {
                queue.extend(self.values[i].parents.iter().copied());
            }
        }
        out
    }
}

/// Values that nothing usable supersedes.
fn structural_leaves(values: &[ResolveValue]) -> Vec<usize> {
    let mut superseded = BTreeSet::new();
    for value in values {
        let supersedes = match &value.origin {
            ValueOrigin::Changeset(_) => true,
            ValueOrigin::Merge { outcome, .. } => *outcome == MergeOutcome::Clean,
            _ => false,
        };
        if supersedes {
            superseded.extend(value.parents.iter().copied());
        }
    }
    values
        .iter()
        .enumerate()
        .filter(|(i, v)| !superseded.contains(i) && v.is_usable())
        .map(|(i, _)| i)
        .collect()
}

/// A conflicted item with its choices.
#[derive(Debug, Clone)]
pub struct ResolveItem {
    pub alias: Alias,
    pub gid: String,
    pub path: String,
    pub entry_type: EntryType,
    pub status_flags: StatusFlags,
    pub doc: IssueDoc,
    pub choices: Vec<Choice>,
}

impl ResolveItem {
    pub fn choice(&self, axis: ConflictAxis) -> Option<&Choice> {
        self.choices.iter().find(|c| c.axis == axis)
    }

    pub fn is_resolved(&self) -> bool {
        !self.status_flags.intersects(StatusFlags::XU_MASK)
    }
}

/// One line of a resolve listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveSummary {
    pub alias: Alias,
    pub path: String,
    pub unresolved: Vec<ConflictAxis>,
    pub resolved: Vec<ConflictAxis>,
}

// ---------------------------------------------------------------------------
// Enumeration and choice building
// ---------------------------------------------------------------------------

impl Transaction<'_> {
    /// Every item with an issue. The set of items is read from the issue
    /// table once per transaction; each item's state comes from the live
    /// view and reflects resolutions queued since.
    pub fn resolve_items(&mut self) -> Result<Vec<ResolveSummary>, WcError> {
        if self.resolve.is_none() {
            let aliases = self.wc.db().list_issue_aliases()?;
            debug!(count = aliases.len(), "enumerated issues");
            self.resolve = Some(ResolveState { aliases });
        }
        let aliases = self
            .resolve
            .as_ref()
            .map(|s| s.aliases.clone())
            .unwrap_or_default();

        let mut out = Vec::new();
        for alias in aliases {
            match self.ensure_item(alias) {
                Ok(()) => {}
                Err(WcError::NotFound { .. }) => {
                    debug!(alias = %alias, "issue item no longer in the live view");
                    continue;
                }
                Err(e) => return Err(e),
            }
            self.load_issue(alias)?;
            if self.item(alias)?.issue().is_none() {
                continue;
            }
            if !self.sealed {
                self.settle_collapsed(alias)?;
            }
            let Some(flags) = self.item(alias)?.issue().map(|i| i.status_flags) else {
                continue;
            };
            out.push(ResolveSummary {
                alias,
                path: self.path_string(alias)?,
                unresolved: flags.unresolved_axes(),
                resolved: ConflictAxis::ALL
                    .into_iter()
                    .filter(|axis| flags.contains(axis.xr()))
                    .collect(),
            });
        }
        Ok(out)
    }

    /// Build the choices of one conflicted item. Choices whose candidate
    /// values all agree are left out unless the conflict was caused by a
    /// collision. Nothing is queued.
    pub fn resolve_item(&mut self, alias: Alias) -> Result<ResolveItem, WcError> {
        self.build_resolve_item(alias).map(|(item, _)| item)
    }

    /// Resolve the unresolved axes whose choices were left out, so that
    /// accepting every presented choice completes the item.
    pub(crate) fn settle_collapsed(&mut self, alias: Alias) -> Result<(), WcError> {
        self.ensure_mutable()?;
        let (_, collapsed) = self.build_resolve_item(alias)?;
        if collapsed.is_empty() {
            return Ok(());
        }
        warn!(alias = %alias, axes = ?collapsed, "all values agree, resolving discarded choices");
        self.implicit_resolve(alias, &collapsed)
    }

    /// The item plus the unresolved axes whose choices collapsed.
    fn build_resolve_item(
        &mut self,
        alias: Alias,
    ) -> Result<(ResolveItem, Vec<ConflictAxis>), WcError> {
        self.ensure_item(alias)?;
        self.load_issue(alias)?;
        let issue = self
            .item(alias)?
            .issue()
            .cloned()
            .ok_or_else(|| WcError::not_found("issue for item", alias))?;
        let collision = issue.doc.has_collision_cause() || issue.doc.has_portability_cause();

        let mut choices = Vec::new();
        let mut collapsed = Vec::new();
        for axis in ConflictAxis::ALL {
            if !issue.status_flags.intersects(axis.xu() | axis.xr()) {
                continue;
            }
            let set = self.build_choice(alias, axis, &issue.doc, &issue.resolve)?;
            if !collision && collapses(&set) {
                debug!(alias = %alias, axis = %axis, "all values agree, discarding choice");
                if issue.status_flags.contains(axis.xu()) {
                    collapsed.push(axis);
                }
                continue;
            }
            choices.push(set.finish(issue.status_flags, &issue.resolve));
        }

        let path = self.path_string(alias)?;
        let item = self.item(alias)?;
        let resolve_item = ResolveItem {
            alias,
            gid: item.gid().to_string(),
            entry_type: item.entry_type,
            path,
            status_flags: issue.status_flags,
            doc: issue.doc,
            choices,
        };
        Ok((resolve_item, collapsed))
    }

    fn build_choice(
        &mut self,
        alias: Alias,
        axis: ConflictAxis,
        doc: &IssueDoc,
        resolve: &ResolveDoc,
    ) -> Result<ResolveValueSet, WcError> {
        let mut set = ResolveValueSet::new(axis);
        let is_file = self.item(alias)?.entry_type == EntryType::File;

        let sides = [
            (Side::Ancestor, LABEL_ANCESTOR, doc.input.ancestor.as_ref()),
            (Side::Baseline, LABEL_BASELINE, doc.input.baseline.as_ref()),
            (Side::Other, LABEL_OTHER, doc.input.other.as_ref()),
        ];
        let mut ancestor = None;
        for (side, label, input) in sides {
            let data = match (axis, input) {
                (ConflictAxis::Existence, input) if side != Side::Ancestor || input.is_some() => {
                    ValueData::Existence(input.is_some())
                }
                (_, Some(input)) => side_data(axis, input),
                _ => continue,
            };
            let parents = match side {
                Side::Ancestor => vec![],
                _ => ancestor.into_iter().collect(),
            };
            let backing = input
                .filter(|_| axis == ConflictAxis::Contents)
                .map(|input| self.side_backing(input));
            let idx = set.push(label, data, parents, ValueOrigin::Changeset(side), backing);
            if side == Side::Ancestor {
                ancestor = Some(idx);
            }
        }
        let baseline = set.index_of(LABEL_BASELINE);
        let other = set.index_of(LABEL_OTHER);

        if axis == ConflictAxis::Contents {
            if let Some(hid) = &doc.automerge_generated_hid {
                set.push(
                    LABEL_AUTOMERGE,
                    ValueData::Contents(hid.clone()),
                    baseline.into_iter().chain(other).collect(),
                    ValueOrigin::Automerge {
                        tool: doc.automerge_mergetool.clone().unwrap_or_default(),
                    },
                    Some(ContentSource::Blob(hid.clone())),
                );
            }
            if is_file {
                for saved in &resolve.saved {
                    set.push(
                        &saved.label,
                        ValueData::Contents(saved.hid.clone()),
                        baseline.into_iter().collect(),
                        ValueOrigin::Saved,
                        Some(ContentSource::Blob(saved.hid.clone())),
                    );
                }
            }
        }

        if let Some(data) = self.working_data(alias, axis)? {
            set.push(
                LABEL_WORKING,
                data,
                baseline.into_iter().collect(),
                ValueOrigin::Working,
                None,
            );
        }

        if axis == ConflictAxis::Contents && is_file {
            for merge in &resolve.merges {
                let parents: Vec<usize> = [&merge.baseline, &merge.other]
                    .into_iter()
                    .filter_map(|label| set.index_of(label))
                    .collect();
                set.push(
                    &merge.label,
                    ValueData::Contents(merge.hid.clone().unwrap_or_default()),
                    parents,
                    ValueOrigin::Merge {
                        tool: merge.tool.clone(),
                        outcome: merge.outcome,
                    },
                    merge.hid.clone().map(ContentSource::Blob),
                );
            }
        }
        set.mergeable = axis == ConflictAxis::Contents && is_file;
        Ok(set)
    }

    /// The live value of one axis, if the item has one.
    fn working_data(&mut self, alias: Alias, axis: ConflictAxis) -> Result<Option<ValueData>, WcError> {
        let (deleted, materialized, entry_type, name, parent) = {
            let item = self.item(alias)?;
            (
                item.is_deleted(),
                item.materialized,
                item.entry_type,
                item.current_name().to_string(),
                item.current_parent(),
            )
        };
        Ok(match axis {
            ConflictAxis::Existence => Some(ValueData::Existence(!deleted)),
            ConflictAxis::Name => Some(ValueData::Name(name)),
            ConflictAxis::Location => self.wc.db().gid_of_alias(parent)?.map(ValueData::Location),
            ConflictAxis::Attributes if materialized => {
                Some(ValueData::Attributes(self.current_attrbits(alias)?))
            }
            ConflictAxis::Contents if materialized && entry_type != EntryType::Directory => {
                Some(ValueData::Contents(self.current_hid(alias)?))
            }
            _ => None,
        })
    }

    fn side_backing(&self, input: &IssueInput) -> ContentSource {
        match &input.tempfile {
            Some(tempfile) => ContentSource::TempFile(self.wc.tmp_dir().join(tempfile)),
            None => ContentSource::Blob(input.hid.clone()),
        }
    }
}

fn side_data(axis: ConflictAxis, input: &IssueInput) -> ValueData {
    match axis {
        ConflictAxis::Existence => ValueData::Existence(true),
        ConflictAxis::Name => ValueData::Name(input.entryname.clone()),
        ConflictAxis::Location => ValueData::Location(input.gid_parent.clone()),
        ConflictAxis::Attributes => ValueData::Attributes(input.attrbits),
        ConflictAxis::Contents => ValueData::Contents(input.hid.clone()),
    }
}

/// All candidate values agree.
fn collapses(set: &ResolveValueSet) -> bool {
    let leaves = structural_leaves(&set.values);
    let mut data = leaves.iter().map(|&i| &set.values[i].data);
    match data.next() {
        Some(first) => data.all(|d| d == first),
        None => true,
    }
}

/// A choice under construction.
struct ResolveValueSet {
    axis: ConflictAxis,
    values: Vec<ResolveValue>,
    mergeable: bool,
}

impl ResolveValueSet {
    fn new(axis: ConflictAxis) -> Self {
        Self {
            axis,
            values: Vec::new(),
            mergeable: false,
        }
    }

    fn push(
        &mut self,
        label: &str,
        data: ValueData,
        parents: Vec<usize>,
        origin: ValueOrigin,
        backing: Option<ContentSource>,
    ) -> usize {
        self.values.push(ResolveValue {
            label: label.to_string(),
            data,
            parents,
            origin,
            backing,
        });
        self.values.len() - 1
    }

    fn index_of(&self, label: &str) -> Option<usize> {
        self.values.iter().position(|v| v.label == label)
    }

    fn finish(self, flags: StatusFlags, resolve: &ResolveDoc) -> Choice {
        let leaves = self.mergeable.then(|| structural_leaves(&self.values));
        Choice {
            axis: self.axis,
            accepted: resolve
                .accepted_for(self.axis)
                .and_then(|a| a.label.clone()),
            resolved: flags.contains(self.axis.xr()),
            values: self.values,
            leaves,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(label: &str, data: ValueData, parents: Vec<usize>, origin: ValueOrigin) -> ResolveValue {
        ResolveValue {
            label: label.into(),
            data,
            parents,
            origin,
            backing: None,
        }
    }

    fn contents(hid: &str) -> ValueData {
        ValueData::Contents(hid.into())
    }

    fn choice(values: Vec<ResolveValue>) -> Choice {
        Choice {
            axis: ConflictAxis::Contents,
            leaves: Some(structural_leaves(&values)),
            values,
            accepted: None,
            resolved: false,
        }
    }

    #[test]
    fn test_leaves_exclude_superseded_and_failed() {
        let values = vec![
            value("ancestor", contents("a"), vec![], ValueOrigin::Changeset(Side::Ancestor)),
            value("baseline", contents("b"), vec![0], ValueOrigin::Changeset(Side::Baseline)),
            value("other", contents("o"), vec![0], ValueOrigin::Changeset(Side::Other)),
            value("working", contents("b"), vec![1], ValueOrigin::Working),
            value(
                "merge1",
                contents(""),
                vec![1, 2],
                ValueOrigin::Merge {
                    tool: ":fail".into(),
                    outcome: MergeOutcome::Failed,
                },
            ),
        ];
        assert_eq!(structural_leaves(&values), vec![1, 2, 3]);

        let mut values = values;
        values.push(value(
            "merge2",
            contents("m"),
            vec![1, 2],
            ValueOrigin::Merge {
                tool: ":diffy".into(),
                outcome: MergeOutcome::Clean,
            },
        ));
        assert_eq!(structural_leaves(&values), vec![3, 5]);
    }

    #[test]
    fn test_common_ancestor() {
        let c = choice(vec![
            value("ancestor", contents("a"), vec![], ValueOrigin::Changeset(Side::Ancestor)),
            value("baseline", contents("b"), vec![0], ValueOrigin::Changeset(Side::Baseline)),
            value("other", contents("o"), vec![0], ValueOrigin::Changeset(Side::Other)),
            value("working", contents("w"), vec![1], ValueOrigin::Working),
        ]);
        assert_eq!(c.common_ancestor(1, 2), Some(0));
        assert_eq!(c.common_ancestor(3, 2), Some(0));
        assert_eq!(c.common_ancestor(3, 1), Some(1));
        assert_eq!(c.value("working").map(|(i, _)| i), Some(3));
        assert_eq!(c.working().map(|(i, _)| i), Some(3));
    }

    #[test]
    fn test_collapse_ignores_ancestor() {
        let name = |n: &str| ValueData::Name(n.into());
        let mut set = ResolveValueSet::new(ConflictAxis::Name);
        let a = set.push("ancestor", name("a"), vec![], ValueOrigin::Changeset(Side::Ancestor), None);
        let b = set.push("baseline", name("b"), vec![a], ValueOrigin::Changeset(Side::Baseline), None);
        set.push("other", name("b"), vec![a], ValueOrigin::Changeset(Side::Other), None);
        set.push("working", name("b"), vec![b], ValueOrigin::Working, None);
        assert!(collapses(&set));

        set.push("saved1", name("c"), vec![b], ValueOrigin::Saved, None);
        assert!(!collapses(&set));
    }

    #[test]
    fn test_resolve_doc_roundtrip_and_record() {
        let mut doc = ResolveDoc::default();
        doc.record_accept(ConflictAxis::Name, None);
        doc.record_accept(ConflictAxis::Name, Some("other".into()));
        assert_eq!(doc.accepted.len(), 1);
        assert_eq!(
            doc.accepted_for(ConflictAxis::Name).and_then(|a| a.label.as_deref()),
            Some("other")
        );
        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains("\"axis\":\"name\""));
        let back: ResolveDoc = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}
