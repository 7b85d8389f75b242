//! The working-copy transaction.
//!
//! A [`Transaction`] owns every piece of per-transaction state: the liveview
//! item and directory caches, the journal, lazily loaded lock and timestamp
//! data, and the resolve handle. It holds the row store's write lock from
//! [`WorkingCopy::begin`] until [`apply`](Transaction::apply),
//! [`cancel`](Transaction::cancel) or drop. Row-store writes made while the
//! transaction is open stay inside the store transaction, and nothing is
//! committed or written to the working directory before `apply`.

use std::collections::HashMap;

use tracing::{debug, info};

use crate::db::{LockRow, TimestampEntry};
use crate::errors::WcError;
use crate::journal::Journal;
use crate::liveview::{LiveViewDir, LiveViewItem};
use crate::models::{Alias, BASELINE_LABEL};
use crate::resolve::ResolveState;
use crate::wc::WorkingCopy;

pub struct Transaction<'wc> {
    pub(crate) wc: &'wc WorkingCopy,
    pub(crate) root: Alias,
    pub(crate) items: HashMap<Alias, LiveViewItem>,
    pub(crate) dirs: HashMap<Alias, LiveViewDir>,
    pub(crate) journal: Journal,
    /// Active locks on the attached branch; `None` until first needed.
    pub(crate) locks: Option<Vec<LockRow>>,
    /// Recorded (mtime, size) → hash entries; `None` until first needed.
    pub(crate) timestamps: Option<HashMap<Alias, TimestampEntry>>,
    /// Hashes computed during this transaction that may be recorded.
    pub(crate) fresh_timestamps: Vec<TimestampEntry>,
    pub(crate) resolve: Option<ResolveState>,
    /// Set once the baseline has been replaced; only apply or cancel remain.
    pub(crate) sealed: bool,
    finished: bool,
}

impl<'wc> Transaction<'wc> {
    pub(crate) fn new(wc: &'wc WorkingCopy) -> Result<Self, WcError> {
        let root = wc.db().root_tree_row(BASELINE_LABEL)?.alias;
        info!(root = %root, "transaction started");
        Ok(Self {
            wc,
            root,
            items: HashMap::new(),
            dirs: HashMap::new(),
            journal: Journal::new(),
            locks: None,
            timestamps: None,
            fresh_timestamps: Vec::new(),
            resolve: None,
            sealed: false,
            finished: false,
        })
    }

    pub fn working_copy(&self) -> &'wc WorkingCopy {
        self.wc
    }

    /// Alias of the working-copy root directory.
    pub fn root(&self) -> Alias {
        self.root
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Drop every cached item, directory and resolve state and discard the
    /// journal. Neither the filesystem nor the row store is touched.
    pub fn cancel(mut self) {
        info!(queued = self.journal.len(), "transaction cancelled");
        self.abort();
    }

    /// Roll back the store transaction and release the gate.
    pub(crate) fn abort(&mut self) {
        self.teardown();
        self.finished = true;
        self.wc.end_transaction();
    }

    pub(crate) fn teardown(&mut self) {
        self.items.clear();
        self.dirs.clear();
        self.journal.clear();
        self.locks = None;
        self.timestamps = None;
        self.fresh_timestamps.clear();
        self.resolve = None;
    }

    /// Mark the transaction as ended after a successful commit.
    pub(crate) fn finish_committed(&mut self) {
        self.teardown();
        self.finished = true;
        self.wc.release_gate();
    }

    pub(crate) fn ensure_mutable(&self) -> Result<(), WcError> {
        if self.sealed {
            return Err(WcError::InvalidState(
                "the baseline has been replaced in this transaction; apply or cancel it".into(),
            ));
        }
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            debug!("transaction dropped without apply, rolling back");
            self.teardown();
            self.wc.end_transaction();
        }
    }
}
