//! Filesystem primitives for the working directory: directory listing with
//! observed attributes, and the mutations the apply driver performs.

use std::fs;
use std::path::Path;
use std::time::UNIX_EPOCH;

use tracing::{debug, warn};

use crate::models::{EntryType, ATTRBITS_EXEC};

/// One entry returned by [`read_dir_entries`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskEntry {
    pub name: String,
    pub entry_type: EntryType,
    pub mtime_ns: i64,
    pub size: u64,
    /// Platform-definable attribute bits as observed.
    pub attrbits: u64,
}

/// List the entries of `dir`. A missing directory lists as empty. Names that
/// are not valid UTF-8, and special files, are skipped.
pub fn read_dir_entries(dir: &Path) -> std::io::Result<Vec<DiskEntry>> {
    let iter = match fs::read_dir(dir) {
        Ok(iter) => iter,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut entries = Vec::new();
    for entry in iter {
        let entry = entry?;
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(raw) => {
                warn!(dir = %dir.display(), name = ?raw, "skipping non-UTF-8 entry name");
                continue;
            }
        };
        let meta = fs::symlink_metadata(entry.path())?;
        let entry_type = if meta.file_type().is_symlink() {
            EntryType::Symlink
        } else if meta.is_dir() {
            EntryType::Directory
        } else if meta.is_file() {
            EntryType::File
        } else {
            debug!(name = %name, "skipping special file");
            continue;
        };
        entries.push(DiskEntry {
            name,
            entry_type,
            mtime_ns: mtime_ns(&meta),
            size: meta.len(),
            attrbits: observed_attrbits(&meta),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub fn mtime_ns(meta: &fs::Metadata) -> i64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

#[cfg(unix)]
pub fn observed_attrbits(meta: &fs::Metadata) -> u64 {
    use std::os::unix::fs::PermissionsExt;
    if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
        ATTRBITS_EXEC
    } else {
        0
    }
}

#[cfg(not(unix))]
pub fn observed_attrbits(_meta: &fs::Metadata) -> u64 {
    0
}

/// Apply the platform-definable attribute bits to a regular file.
#[cfg(unix)]
pub fn set_attrbits(path: &Path, attrbits: u64) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let meta = fs::metadata(path)?;
    let mut mode = meta.permissions().mode();
    if attrbits & ATTRBITS_EXEC != 0 {
        mode |= (mode & 0o444) >> 2;
    } else {
        mode &= !0o111;
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
pub fn set_attrbits(_path: &Path, _attrbits: u64) -> std::io::Result<()> {
    Ok(())
}

pub fn read_symlink_target(path: &Path) -> std::io::Result<String> {
    let target = fs::read_link(path)?;
    target.into_os_string().into_string().map_err(|raw| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("symlink target {raw:?} is not UTF-8"),
        )
    })
}

#[cfg(unix)]
pub fn write_symlink(path: &Path, target: &str) -> std::io::Result<()> {
    if fs::symlink_metadata(path).is_ok() {
        fs::remove_file(path)?;
    }
    std::os::unix::fs::symlink(target, path)
}

#[cfg(not(unix))]
pub fn write_symlink(_path: &Path, _target: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "symlinks are not supported on this platform",
    ))
}

/// Write `bytes` to `path` through a sibling temporary file.
pub fn write_file(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_file_name(format!(".wc-write.{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Remove a file, symlink or directory. `recursive` allows non-empty
/// directories.
pub fn remove_entry(path: &Path, entry_type: EntryType, recursive: bool) -> std::io::Result<()> {
    match entry_type {
        EntryType::Directory | EntryType::Submodule if recursive => fs::remove_dir_all(path),
        EntryType::Directory | EntryType::Submodule => fs::remove_dir(path),
        EntryType::File | EntryType::Symlink => fs::remove_file(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_dir_entries_types_and_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), b"bb").unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();

        let entries = read_dir_entries(dir.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].name, "a");
        assert_eq!(entries[0].entry_type, EntryType::Directory);
        assert_eq!(entries[1].entry_type, EntryType::File);
        assert_eq!(entries[1].size, 2);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_dir_entries(&dir.path().join("nope")).unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_exec_bit_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sh");
        fs::write(&path, b"#!/bin/sh\n").unwrap();

        set_attrbits(&path, ATTRBITS_EXEC).unwrap();
        assert_eq!(observed_attrbits(&fs::metadata(&path).unwrap()), ATTRBITS_EXEC);
        set_attrbits(&path, 0).unwrap();
        assert_eq!(observed_attrbits(&fs::metadata(&path).unwrap()), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        write_symlink(&link, "target.txt").unwrap();
        assert_eq!(read_symlink_target(&link).unwrap(), "target.txt");
        write_symlink(&link, "other.txt").unwrap();
        assert_eq!(read_symlink_target(&link).unwrap(), "other.txt");

        let entries = read_dir_entries(dir.path()).unwrap();
        assert_eq!(entries[0].entry_type, EntryType::Symlink);
    }

    #[test]
    fn test_write_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/new.txt");
        write_file(&path, b"data").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"data");
        remove_entry(&dir.path().join("sub"), EntryType::Directory, true).unwrap();
        assert!(!dir.path().join("sub").exists());
    }
}
