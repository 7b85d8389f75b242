//! End-to-end tests for working-copy transactions.
//!
//! Every test builds a real working copy in a temporary directory, commits
//! a baseline through the public API and then drives queued changes through
//! status, apply and cancel. No mocks: real SQLite, real blob store, real
//! filesystem.

use std::fs;
use std::path::Path;

use tempfile::TempDir;

use wcengine_core::blobstore::BlobStore;
use wcengine_core::db::LockRow;
use wcengine_core::journal::ContentSource;
use wcengine_core::liveview::ops::{AddSpecial, AddSpecialKind};
use wcengine_core::models::{
    new_gid, Alias, EntryType, PcFlags, TreeRow, ATTRBITS_EXEC, BASELINE_LABEL,
};
use wcengine_core::{StatusFlags, StatusOptions, WcConfig, WcError, WorkingCopy};

// ===========================================================================
// Helpers
// ===========================================================================

/// Create `files` under a fresh working copy and commit them as the
/// baseline.
fn setup_with(config: WcConfig, files: &[(&str, &str)]) -> (TempDir, WorkingCopy) {
    let dir = tempfile::tempdir().unwrap();
    let wc = WorkingCopy::init(dir.path(), config).unwrap();
    for (path, content) in files {
        let abs = dir.path().join(path);
        fs::create_dir_all(abs.parent().unwrap()).unwrap();
        fs::write(abs, content).unwrap();
    }
    if !files.is_empty() {
        let mut tx = wc.begin().unwrap();
        let root = tx.root();
        tx.add(root, true).unwrap();
        tx.commit_baseline().unwrap();
        tx.apply().unwrap();
    }
    (dir, wc)
}

fn setup(files: &[(&str, &str)]) -> (TempDir, WorkingCopy) {
    setup_with(WcConfig::default(), files)
}

fn read(root: &Path, path: &str) -> String {
    fs::read_to_string(root.join(path)).unwrap()
}

// ===========================================================================
// Baseline commit
// ===========================================================================

#[test]
fn test_commit_baseline_records_tree() {
    let (_dir, wc) = setup(&[("foo.txt", "hello\n"), ("src/main.rs", "fn main() {}\n")]);

    let mut tx = wc.begin().unwrap();
    let foo = tx.lookup_path("foo.txt").unwrap().unwrap();
    let main = tx.lookup_path("src/main.rs").unwrap().unwrap();
    assert!(tx.item(foo).unwrap().is_controlled());
    assert!(tx.item(main).unwrap().pending_change().is_none());

    let row = wc.db().get_tree_row(BASELINE_LABEL, foo).unwrap().unwrap();
    assert_eq!(row.name, "foo.txt");
    assert!(wc.blobs().contains(&row.content_hash));
    assert_eq!(wc.blobs().fetch(&row.content_hash).unwrap(), b"hello\n");

    let entries = tx.status_all(StatusOptions::default()).unwrap();
    assert!(entries.is_empty(), "clean tree reported changes: {entries:?}");
    tx.cancel();
}

#[test]
fn test_commit_refuses_lost_items() {
    let (dir, wc) = setup(&[("gone.txt", "x")]);
    fs::remove_file(dir.path().join("gone.txt")).unwrap();

    let mut tx = wc.begin().unwrap();
    let gone = tx.lookup_path("gone.txt").unwrap().unwrap();
    assert!(tx.item(gone).unwrap().is_lost());
    let flags = tx.status(gone, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::U_LOST));
    assert!(matches!(tx.commit_baseline(), Err(WcError::InvalidState(_))));
}

#[test]
fn test_sealed_transaction_refuses_edits() {
    let (_dir, wc) = setup(&[("a.txt", "a")]);
    let mut tx = wc.begin().unwrap();
    tx.commit_baseline().unwrap();
    let a = tx.lookup_path("a.txt").unwrap().unwrap();
    assert!(matches!(tx.rename(a, "b.txt"), Err(WcError::InvalidState(_))));
    tx.cancel();
}

// ===========================================================================
// Structural changes
// ===========================================================================

#[test]
fn test_rename_twice_collapses_to_one_change() {
    let (dir, wc) = setup(&[("foo.txt", "hello\n")]);

    let mut tx = wc.begin().unwrap();
    let g = tx.lookup_path("foo.txt").unwrap().unwrap();
    tx.rename(g, "bar.txt").unwrap();
    tx.rename(g, "baz.txt").unwrap();

    let pc = tx.item(g).unwrap().pending_change().cloned().unwrap();
    assert_eq!(pc.flags, PcFlags::RENAMED);
    assert_eq!(pc.name, "baz.txt");

    let flags = tx.status(g, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::S_RENAMED));
    assert!(!flags.contains(StatusFlags::A_MULTIPLE_CHANGE));
    assert!(!flags.contains(StatusFlags::C_CONTENT_CHANGED));

    tx.apply().unwrap();
    assert!(!dir.path().join("foo.txt").exists());
    assert_eq!(read(dir.path(), "baz.txt"), "hello\n");
    assert_eq!(wc.db().get_pending_change(g).unwrap().unwrap().name, "baz.txt");
}

#[test]
fn test_rename_back_leaves_no_pending_change() {
    let (_dir, wc) = setup(&[("foo.txt", "x")]);
    let mut tx = wc.begin().unwrap();
    let g = tx.lookup_path("foo.txt").unwrap().unwrap();
    tx.rename(g, "bar.txt").unwrap();
    tx.rename(g, "foo.txt").unwrap();
    assert!(tx.item(g).unwrap().pending_change().is_none());
    tx.apply().unwrap();
    assert!(wc.db().get_pending_change(g).unwrap().is_none());
}

#[test]
fn test_move_and_rename_set_both_bits() {
    let (dir, wc) = setup(&[("a.txt", "a"), ("sub/keep.txt", "k")]);

    let mut tx = wc.begin().unwrap();
    let a = tx.lookup_path("a.txt").unwrap().unwrap();
    let sub = tx.lookup_path("sub").unwrap().unwrap();
    tx.move_item(a, sub).unwrap();
    tx.rename(a, "b.txt").unwrap();

    let flags = tx.status(a, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::S_MOVED | StatusFlags::S_RENAMED));
    assert!(flags.contains(StatusFlags::A_MULTIPLE_CHANGE));
    assert_eq!(tx.path_string(a).unwrap(), "sub/b.txt");
    assert_eq!(tx.lookup_path("sub/b.txt").unwrap(), Some(a));
    assert_eq!(tx.lookup_path("a.txt").unwrap(), None);

    tx.apply().unwrap();
    assert_eq!(read(dir.path(), "sub/b.txt"), "a");
}

#[test]
fn test_move_into_itself_is_refused() {
    let (_dir, wc) = setup(&[("outer/inner/f.txt", "f")]);
    let mut tx = wc.begin().unwrap();
    let outer = tx.lookup_path("outer").unwrap().unwrap();
    let inner = tx.lookup_path("outer/inner").unwrap().unwrap();
    assert!(matches!(tx.move_item(outer, inner), Err(WcError::InvalidState(_))));
}

#[test]
fn test_rename_onto_existing_name_collides() {
    let (_dir, wc) = setup(&[("a.txt", "a"), ("b.txt", "b")]);
    let mut tx = wc.begin().unwrap();
    let a = tx.lookup_path("a.txt").unwrap().unwrap();
    let err = tx.rename(a, "b.txt").unwrap_err();
    assert!(err.is_collision());
}

#[test]
fn test_remove_then_undo_delete_restores_content() {
    let (dir, wc) = setup(&[("doomed.txt", "precious\n")]);

    let mut tx = wc.begin().unwrap();
    let g = tx.lookup_path("doomed.txt").unwrap().unwrap();
    tx.remove(g, false).unwrap();
    assert!(tx.item(g).unwrap().is_deleted());
    assert_eq!(tx.lookup_path("doomed.txt").unwrap(), None);
    tx.apply().unwrap();
    assert!(!dir.path().join("doomed.txt").exists());

    let mut tx = wc.begin().unwrap();
    tx.ensure_item(g).unwrap();
    let flags = tx.status(g, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::S_DELETED));
    tx.undo_delete(g, None).unwrap();
    tx.apply().unwrap();
    assert_eq!(read(dir.path(), "doomed.txt"), "precious\n");
    assert!(wc.db().get_pending_change(g).unwrap().is_none());
}

#[test]
fn test_remove_keep_leaves_file_uncontrolled() {
    let (dir, wc) = setup(&[("kept.txt", "k")]);

    let mut tx = wc.begin().unwrap();
    let g = tx.lookup_path("kept.txt").unwrap().unwrap();
    tx.remove(g, true).unwrap();
    let found = tx.lookup_path("kept.txt").unwrap().unwrap();
    assert_ne!(found, g);
    let flags = tx.status(found, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::U_FOUND));
    tx.apply().unwrap();
    assert_eq!(read(dir.path(), "kept.txt"), "k");
}

#[test]
fn test_remove_directory_with_found_child_is_refused() {
    let (dir, wc) = setup(&[("d/tracked.txt", "t")]);
    fs::write(dir.path().join("d/stray.txt"), "s").unwrap();

    let mut tx = wc.begin().unwrap();
    let d = tx.lookup_path("d").unwrap().unwrap();
    assert!(matches!(tx.remove(d, false), Err(WcError::InvalidState(_))));
}

#[test]
fn test_reserved_metadata_directory() {
    let (_dir, wc) = setup(&[("a.txt", "a")]);
    let mut tx = wc.begin().unwrap();
    let meta = tx.lookup_path(".wc").unwrap().unwrap();
    assert!(tx.item(meta).unwrap().is_reserved());
    let flags = tx.status(meta, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::R_RESERVED));
    assert!(matches!(tx.add(meta, false), Err(WcError::Reserved(_))));
    assert!(matches!(tx.rename(meta, "x"), Err(WcError::Reserved(_))));
}

// ===========================================================================
// Content and status
// ===========================================================================

#[test]
fn test_overwrite_file_shows_content_change() {
    let (dir, wc) = setup(&[("f.txt", "old\n")]);
    let hid = wc.blobs().store(b"new\n").unwrap();

    let mut tx = wc.begin().unwrap();
    let f = tx.lookup_path("f.txt").unwrap().unwrap();
    tx.overwrite_file(f, ContentSource::Blob(hid.clone())).unwrap();
    assert_eq!(tx.current_hid(f).unwrap(), hid);
    let flags = tx.status(f, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::C_CONTENT_CHANGED));
    tx.apply().unwrap();
    assert_eq!(read(dir.path(), "f.txt"), "new\n");
}

#[test]
fn test_edit_on_disk_is_detected() {
    let (dir, wc) = setup(&[("f.txt", "one\n")]);
    fs::write(dir.path().join("f.txt"), "two\n").unwrap();

    let mut tx = wc.begin().unwrap();
    let entries = tx.status_all(StatusOptions::default()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].path, Path::new("f.txt"));
    assert!(entries[0].flags.contains(StatusFlags::C_CONTENT_CHANGED));
}

#[test]
fn test_no_ignores_reports_found() {
    let mut config = WcConfig::default();
    config.status.ignores = vec!["*.log".into()];
    let (dir, wc) = setup_with(config, &[("a.txt", "a")]);
    fs::write(dir.path().join("debug.log"), "noise").unwrap();

    let mut tx = wc.begin().unwrap();
    let log = tx.lookup_path("debug.log").unwrap().unwrap();
    let flags = tx.status(log, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::U_IGNORED));

    let opts = StatusOptions {
        no_ignores: true,
        ..Default::default()
    };
    let flags = tx.status(log, opts).unwrap();
    assert!(flags.contains(StatusFlags::U_FOUND));
    assert!(!flags.contains(StatusFlags::U_IGNORED));
}

#[test]
fn test_recursive_add_skips_ignored() {
    let mut config = WcConfig::default();
    config.status.ignores = vec!["*.o".into()];
    let (dir, wc) = setup_with(config, &[]);
    fs::create_dir_all(dir.path().join("lib")).unwrap();
    fs::write(dir.path().join("lib/a.c"), "int a;").unwrap();
    fs::write(dir.path().join("lib/a.o"), "obj").unwrap();

    let mut tx = wc.begin().unwrap();
    let root = tx.root();
    assert_eq!(tx.add(root, true).unwrap(), 2);
    let obj = tx.lookup_path("lib/a.o").unwrap().unwrap();
    assert!(!tx.item(obj).unwrap().is_controlled());
    let src = tx.lookup_path("lib/a.c").unwrap().unwrap();
    let flags = tx.status(src, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::S_ADDED));
}

// ===========================================================================
// Add-special and parking
// ===========================================================================

#[test]
fn test_add_special_parks_on_collision() {
    let (dir, wc) = setup(&[("conflict.txt", "mine\n")]);
    let hid = wc.blobs().store(b"theirs\n").unwrap();
    let gid = new_gid();

    let mut tx = wc.begin().unwrap();
    let root = tx.root();
    let alias = tx
        .add_special(AddSpecial {
            gid: gid.clone(),
            parent: root,
            name: "conflict.txt".into(),
            entry_type: EntryType::File,
            content: Some(ContentSource::Blob(hid)),
            symlink_target: None,
            attrbits: 0,
            kind: AddSpecialKind::Merge,
        })
        .unwrap();

    let parked = format!(".park.{}.00", &gid[..7]);
    assert_eq!(tx.item(alias).unwrap().current_name(), parked);
    let flags = tx.status(alias, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::S_MERGE_CREATED));
    tx.apply().unwrap();

    assert_eq!(read(dir.path(), &parked), "theirs\n");
    assert_eq!(read(dir.path(), "conflict.txt"), "mine\n");
    let pc = wc.db().get_pending_change(alias).unwrap().unwrap();
    assert!(pc.flags.contains(PcFlags::ADD_SPECIAL_MERGE));
}

// ===========================================================================
// Transaction discipline
// ===========================================================================

#[test]
fn test_cancel_leaves_disk_and_store_untouched() {
    let (dir, wc) = setup(&[("foo.txt", "x")]);
    fs::write(dir.path().join("new.txt"), "n").unwrap();

    let mut tx = wc.begin().unwrap();
    let foo = tx.lookup_path("foo.txt").unwrap().unwrap();
    let new = tx.lookup_path("new.txt").unwrap().unwrap();
    tx.rename(foo, "bar.txt").unwrap();
    tx.add(new, false).unwrap();
    assert!(!tx.journal().is_empty());
    tx.cancel();

    assert!(dir.path().join("foo.txt").exists());
    assert!(!dir.path().join("bar.txt").exists());
    assert!(wc.db().list_pending_changes().unwrap().is_empty());
}

#[test]
fn test_drop_rolls_back_and_releases() {
    let (dir, wc) = setup(&[("foo.txt", "x")]);
    {
        let mut tx = wc.begin().unwrap();
        let foo = tx.lookup_path("foo.txt").unwrap().unwrap();
        tx.remove(foo, false).unwrap();
    }
    assert!(dir.path().join("foo.txt").exists());
    assert!(wc.db().list_pending_changes().unwrap().is_empty());
    wc.begin().unwrap().cancel();
}

#[test]
fn test_second_transaction_is_busy() {
    let (_dir, wc) = setup(&[]);
    let tx = wc.begin().unwrap();
    assert!(wc.begin().err().unwrap().is_busy());
    drop(tx);
    assert!(wc.begin().is_ok());
}

#[test]
fn test_read_only_transaction_has_no_effect() {
    let (_dir, wc) = setup(&[("a.txt", "a"), ("d/b.txt", "b")]);
    let before = wc.db().get_cset(BASELINE_LABEL).unwrap().unwrap();

    let mut tx = wc.begin().unwrap();
    tx.status_all(StatusOptions { list_all: true, ..Default::default() })
        .unwrap();
    let summary = tx.apply().unwrap();
    assert_eq!(summary.filesystem_ops, 0);
    assert_eq!(summary.row_ops, 0);

    let after = wc.db().get_cset(BASELINE_LABEL).unwrap().unwrap();
    assert_eq!(before.cset_hash, after.cset_hash);
    assert!(wc.db().list_pending_changes().unwrap().is_empty());
}

#[test]
fn test_unchanged_commit_keeps_root_hash() {
    let (_dir, wc) = setup(&[("a.txt", "a"), ("d/b.txt", "b")]);
    let before = wc.db().root_tree_row(BASELINE_LABEL).unwrap();

    let mut tx = wc.begin().unwrap();
    let summary = tx.commit_baseline().unwrap();
    assert_eq!(summary.root_hash, before.content_hash);
    tx.apply().unwrap();

    let after = wc.db().root_tree_row(BASELINE_LABEL).unwrap();
    assert_eq!(after.content_hash, before.content_hash);
}

#[test]
fn test_commit_after_edit_changes_root_hash() {
    let (dir, wc) = setup(&[("d/b.txt", "b")]);
    let before = wc.db().root_tree_row(BASELINE_LABEL).unwrap();
    fs::write(dir.path().join("d/b.txt"), "changed").unwrap();

    let mut tx = wc.begin().unwrap();
    let summary = tx.commit_baseline().unwrap();
    assert_ne!(summary.root_hash, before.content_hash);
    tx.apply().unwrap();

    let mut tx = wc.begin().unwrap();
    assert!(tx.status_all(StatusOptions::default()).unwrap().is_empty());
}

// ===========================================================================
// Status: locks, attributes, alternate baselines
// ===========================================================================

#[test]
fn test_lock_bits_follow_owner_and_pending_edits() {
    let mut config = WcConfig::default();
    config.user.name = "alice".into();
    config.locks.branch = "main".into();
    let (dir, wc) = setup_with(config, &[("a.txt", "a\n"), ("b.txt", "b\n")]);

    let (a_gid, b_gid) = {
        let mut tx = wc.begin().unwrap();
        let a = tx.lookup_path("a.txt").unwrap().unwrap();
        let b = tx.lookup_path("b.txt").unwrap().unwrap();
        let gids = (
            tx.item(a).unwrap().gid().to_string(),
            tx.item(b).unwrap().gid().to_string(),
        );
        tx.cancel();
        gids
    };
    for (gid, owner, pull_blocked) in [(a_gid, "alice", false), (b_gid, "bob", true)] {
        wc.db()
            .insert_lock(&LockRow {
                gid,
                branch: "main".into(),
                owner: owner.into(),
                completed: false,
                pull_blocked,
            })
            .unwrap();
    }
    fs::write(dir.path().join("b.txt"), "edited by alice\n").unwrap();

    let mut tx = wc.begin().unwrap();
    let a = tx.lookup_path("a.txt").unwrap().unwrap();
    let b = tx.lookup_path("b.txt").unwrap().unwrap();

    let flags = tx.status(a, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::L_LOCKED_BY_USER));
    assert!(!flags.intersects(StatusFlags::L_LOCKED_BY_OTHER | StatusFlags::L_WAITING));

    let flags = tx.status(b, StatusOptions::default()).unwrap();
    assert!(flags.contains(
        StatusFlags::L_LOCKED_BY_OTHER
            | StatusFlags::L_WAITING
            | StatusFlags::L_PENDING_VIOLATION
            | StatusFlags::C_CONTENT_CHANGED
    ));
    assert!(!flags.contains(StatusFlags::L_LOCKED_BY_USER));
    tx.cancel();
}

#[test]
fn test_locks_on_other_branches_are_ignored() {
    let mut config = WcConfig::default();
    config.user.name = "alice".into();
    config.locks.branch = "main".into();
    let (_dir, wc) = setup_with(config, &[("a.txt", "a\n")]);

    let gid = {
        let mut tx = wc.begin().unwrap();
        let a = tx.lookup_path("a.txt").unwrap().unwrap();
        let gid = tx.item(a).unwrap().gid().to_string();
        tx.cancel();
        gid
    };
    wc.db()
        .insert_lock(&LockRow {
            gid,
            branch: "release".into(),
            owner: "bob".into(),
            completed: false,
            pull_blocked: false,
        })
        .unwrap();

    let mut tx = wc.begin().unwrap();
    let a = tx.lookup_path("a.txt").unwrap().unwrap();
    let flags = tx.status(a, StatusOptions::default()).unwrap();
    assert!(!flags.intersects(StatusFlags::L_MASK));
    tx.cancel();
}

#[test]
fn test_queued_attrbits_report_attribute_change() {
    let (_dir, wc) = setup(&[("run.sh", "echo hi\n")]);

    let mut tx = wc.begin().unwrap();
    let run = tx.lookup_path("run.sh").unwrap().unwrap();
    assert_eq!(tx.original_attrbits(run).unwrap(), 0);

    tx.set_attrbits(run, ATTRBITS_EXEC).unwrap();
    assert_eq!(tx.current_attrbits(run).unwrap(), ATTRBITS_EXEC);
    assert_eq!(tx.original_attrbits(run).unwrap(), 0);

    let flags = tx.status(run, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::C_ATTRBITS_CHANGED));
    assert!(!flags.contains(StatusFlags::C_CONTENT_CHANGED));
    tx.cancel();
}

#[cfg(unix)]
#[test]
fn test_exec_bit_on_disk_reports_attribute_change() {
    use std::os::unix::fs::PermissionsExt;

    let (dir, wc) = setup(&[("run.sh", "echo hi\n")]);
    let path = dir.path().join("run.sh");
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(perms.mode() | 0o111);
    fs::set_permissions(&path, perms).unwrap();

    let mut tx = wc.begin().unwrap();
    let run = tx.lookup_path("run.sh").unwrap().unwrap();
    assert_eq!(tx.current_attrbits(run).unwrap(), ATTRBITS_EXEC);
    let flags = tx.status(run, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::C_ATTRBITS_CHANGED));
    assert!(!flags.contains(StatusFlags::A_MULTIPLE_CHANGE));
    tx.cancel();
}

#[test]
fn test_alternate_baseline_drives_original_view() {
    let (_dir, wc) = setup(&[("a.txt", "current\n")]);
    let older = wc.blobs().store(b"older\n").unwrap();

    let mut tx = wc.begin().unwrap();
    let a = tx.lookup_path("a.txt").unwrap().unwrap();
    let tree = wc.db().get_tree_row(BASELINE_LABEL, a).unwrap().unwrap();
    assert_eq!(tx.original_hid(a).unwrap(), Some(tree.content_hash.clone()));

    let alternate = TreeRow {
        name: "old.txt".into(),
        content_hash: older.clone(),
        ..tree
    };
    tx.set_alternate_baseline(a, alternate).unwrap();
    assert_eq!(tx.item(a).unwrap().original_name(), "old.txt");
    assert_eq!(tx.item(a).unwrap().current_name(), "a.txt");
    assert_eq!(tx.original_hid(a).unwrap(), Some(older));

    let flags = tx.status(a, StatusOptions::default()).unwrap();
    assert!(flags.contains(StatusFlags::C_CONTENT_CHANGED));
    assert!(!flags.contains(StatusFlags::S_RENAMED));
    tx.cancel();
}

#[test]
fn test_status_of_unknown_alias_is_invalid() {
    let (_dir, wc) = setup(&[("a.txt", "a\n")]);
    let mut tx = wc.begin().unwrap();
    let flags = tx.status(Alias(999_999), StatusOptions::default()).unwrap();
    assert_eq!(flags, StatusFlags::T_INVALID);
    tx.cancel();
}
