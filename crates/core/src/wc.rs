//! A working copy on disk: its metadata directory, row store, content store
//! and configuration, plus the single-transaction gate.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::blobstore::{BlobStore, FsBlobStore};
use crate::commit::directory_hash;
use crate::config::{WcConfig, META_DIR_NAME};
use crate::db::Database;
use crate::errors::{DatabaseError, WcError};
use crate::models::{new_gid, Alias, EntryType, TreeRow, BASELINE_LABEL, ROOT_ENTRYNAME};
use crate::policy::{IgnoreRules, NamePolicy};
use crate::resolve::merge_tool::MergeToolRegistry;
use crate::tx::Transaction;

const DB_FILE: &str = "wc.db";
const CONFIG_FILE: &str = "config.toml";

pub struct WorkingCopy {
    root: PathBuf,
    meta_dir: PathBuf,
    db: Database,
    blobs: Box<dyn BlobStore>,
    config: WcConfig,
    names: NamePolicy,
    ignores: IgnoreRules,
    merge_tools: MergeToolRegistry,
    tx_open: AtomicBool,
}

impl WorkingCopy {
    /// Turn `root` into a working copy with an empty baseline holding only
    /// the root directory. `config` is written to `.wc/config.toml`.
    pub fn init<P: AsRef<Path>>(root: P, config: WcConfig) -> Result<Self, WcError> {
        let root = root.as_ref().to_path_buf();
        let meta_dir = root.join(META_DIR_NAME);
        if meta_dir.join(DB_FILE).exists() {
            return Err(WcError::InvalidState(format!(
                "{} is already a working copy",
                root.display()
            )));
        }
        config.validate()?;
        info!(root = %root.display(), "initializing working copy");

        std::fs::create_dir_all(meta_dir.join("tmp"))?;
        std::fs::write(meta_dir.join(CONFIG_FILE), config.to_toml_string()?)?;

        let db = Database::new(meta_dir.join(DB_FILE))?;
        db.initialize()?;
        let root_gid = new_gid();
        let root_alias = db.create_gid(&root_gid, false)?;
        db.create_tree_table(BASELINE_LABEL)?;
        let root_hash = directory_hash(&[]);
        db.insert_tree_row(
            BASELINE_LABEL,
            &TreeRow {
                alias: root_alias,
                parent_alias: Alias::NULL_ROOT,
                content_hash: root_hash.clone(),
                entry_type: EntryType::Directory,
                attrbits: 0,
                name: ROOT_ENTRYNAME.to_string(),
            },
        )?;
        db.upsert_cset(BASELINE_LABEL, None, Some(&root_hash))?;
        debug!(root_gid = %root_gid, "created root item");

        Self::assemble(root, meta_dir, db, config)
    }

    /// Open an existing working copy rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, WcError> {
        let root = root.as_ref().to_path_buf();
        let meta_dir = root.join(META_DIR_NAME);
        if !meta_dir.join(DB_FILE).exists() {
            return Err(WcError::not_found("working copy", root.display()));
        }
        let config = WcConfig::load_or_default(meta_dir.join(CONFIG_FILE))?;
        config.validate()?;
        let db = Database::new(meta_dir.join(DB_FILE))?;
        db.initialize()?;
        Self::assemble(root, meta_dir, db, config)
    }

    /// Walk up from `start` to the nearest directory holding `.wc/` and
    /// open it.
    pub fn discover<P: AsRef<Path>>(start: P) -> Result<Self, WcError> {
        let start = start.as_ref();
        let mut dir = Some(start);
        while let Some(candidate) = dir {
            if candidate.join(META_DIR_NAME).join(DB_FILE).exists() {
                return Self::open(candidate);
            }
            dir = candidate.parent();
        }
        Err(WcError::not_found("working copy above", start.display()))
    }

    fn assemble(
        root: PathBuf,
        meta_dir: PathBuf,
        db: Database,
        config: WcConfig,
    ) -> Result<Self, WcError> {
        let blobs = FsBlobStore::new(meta_dir.join("blobs"))?;
        Ok(Self {
            names: NamePolicy::from_config(&config),
            ignores: IgnoreRules::from_config(&config),
            merge_tools: MergeToolRegistry::from_config(&config.merge),
            root,
            meta_dir,
            db,
            blobs: Box::new(blobs),
            config,
            tx_open: AtomicBool::new(false),
        })
    }

    /// Open the working copy's one transaction. A second concurrent
    /// transaction, from this process or another, fails with busy.
    pub fn begin(&self) -> Result<Transaction<'_>, WcError> {
        if self
            .tx_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(DatabaseError::Busy.into());
        }
        if let Err(e) = self.db.begin_immediate() {
            self.tx_open.store(false, Ordering::Release);
            return Err(e.into());
        }
        match Transaction::new(self) {
            Ok(tx) => Ok(tx),
            Err(e) => {
                self.end_transaction();
                Err(e)
            }
        }
    }

    /// Roll back the store transaction (if still open) and release the gate.
    pub(crate) fn end_transaction(&self) {
        if let Err(e) = self.db.rollback() {
            tracing::warn!(error = %e, "rollback failed");
        }
        self.tx_open.store(false, Ordering::Release);
    }

    pub(crate) fn release_gate(&self) {
        self.tx_open.store(false, Ordering::Release);
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    /// Scratch space for resolve copies and merge inputs.
    pub fn tmp_dir(&self) -> PathBuf {
        self.meta_dir.join("tmp")
    }

    pub fn config(&self) -> &WcConfig {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn blobs(&self) -> &dyn BlobStore {
        self.blobs.as_ref()
    }

    pub fn names(&self) -> &NamePolicy {
        &self.names
    }

    pub fn ignores(&self) -> &IgnoreRules {
        &self.ignores
    }

    pub fn merge_tools(&self) -> &MergeToolRegistry {
        &self.merge_tools
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_then_open() {
        let dir = tempfile::tempdir().unwrap();
        let wc = WorkingCopy::init(dir.path(), WcConfig::default()).unwrap();
        let root = wc.db().root_tree_row(BASELINE_LABEL).unwrap();
        assert_eq!(root.name, ROOT_ENTRYNAME);
        assert_eq!(root.entry_type, EntryType::Directory);
        drop(wc);

        let wc = WorkingCopy::open(dir.path()).unwrap();
        assert!(wc.db().get_cset(BASELINE_LABEL).unwrap().is_some());
        assert!(matches!(
            WorkingCopy::init(dir.path(), WcConfig::default()),
            Err(WcError::InvalidState(_))
        ));
    }

    #[test]
    fn test_discover_from_subdirectory() {
        let dir = tempfile::tempdir().unwrap();
        WorkingCopy::init(dir.path(), WcConfig::default()).unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        let wc = WorkingCopy::discover(&nested).unwrap();
        assert_eq!(wc.root(), dir.path());
    }

    #[test]
    fn test_second_begin_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let wc = WorkingCopy::init(dir.path(), WcConfig::default()).unwrap();
        let tx = wc.begin().unwrap();
        let err = wc.begin().err().unwrap();
        assert!(err.is_busy());
        tx.cancel();
        wc.begin().unwrap().cancel();
    }
}
