use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::path::Path;

use crate::errors::SyncError;

/// Metadata of one tracked filesystem object.
///
/// Two entries are equal only when every field matches, so any change to
/// size, permissions or modification time marks the path as modified.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub name: String,
    pub size: u64,
    /// Permission bits plus file type bits (`st_mode` on Unix)
    pub mode: u32,
    pub mod_time: DateTime<Utc>,
    pub is_dir: bool,
}

impl FileEntry {
    pub fn from_metadata(name: &str, meta: &Metadata) -> std::io::Result<Self> {
        Ok(FileEntry {
            name: name.to_string(),
            size: meta.len(),
            mode: mode_of(meta),
            mod_time: DateTime::<Utc>::from(meta.modified()?),
            is_dir: meta.is_dir(),
        })
    }

    /// Stat `path` (without following a final symlink) and capture its metadata.
    pub fn stat(path: &Path) -> Result<Self> {
        let meta = std::fs::symlink_metadata(path).map_err(|e| SyncError::fs("stat", path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::from_metadata(&name, &meta).map_err(|e| SyncError::fs("stat", path, e))?)
    }

    pub fn permissions(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self).map_err(|e| SyncError::serde("file metadata", e))?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data).map_err(|e| SyncError::serde("file metadata", e))?)
    }
}

#[cfg(unix)]
fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::MetadataExt;
    meta.mode()
}

#[cfg(not(unix))]
fn mode_of(meta: &Metadata) -> u32 {
    // Synthesize Unix-style bits so peers on different platforms agree
    let perm = if meta.permissions().readonly() { 0o444 } else { 0o644 };
    if meta.is_dir() {
        0o040000 | perm | 0o111
    } else {
        0o100000 | perm
    }
}

/// Apply the permission bits of `mode` to `path`.
#[cfg(unix)]
pub fn apply_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))
        .map_err(|e| SyncError::fs("chmod", path, e))?;
    Ok(())
}

#[cfg(not(unix))]
pub fn apply_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut perms = std::fs::metadata(path)
        .map_err(|e| SyncError::fs("stat", path, e))?
        .permissions();
    perms.set_readonly(mode & 0o200 == 0);
    std::fs::set_permissions(path, perms).map_err(|e| SyncError::fs("chmod", path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn stat_regular_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        let entry = FileEntry::stat(&path).unwrap();
        assert_eq!(entry.name, "hello.txt");
        assert_eq!(entry.size, 5);
        assert!(!entry.is_dir);
    }

    #[test]
    fn stat_directory() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("sub");
        std::fs::create_dir(&dir).unwrap();

        let entry = FileEntry::stat(&dir).unwrap();
        assert_eq!(entry.name, "sub");
        assert!(entry.is_dir);
    }

    #[test]
    fn stat_missing_path_is_filesystem_error() {
        let tmp = TempDir::new().unwrap();
        let err = FileEntry::stat(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Filesystem { op: "stat", .. })
        ));
    }

    #[test]
    fn metadata_message_keeps_nanoseconds() {
        let entry = FileEntry {
            name: "a.txt".into(),
            size: 3,
            mode: 0o100644,
            mod_time: DateTime::from_timestamp(1_700_000_000, 123_456_789).unwrap(),
            is_dir: false,
        };
        let decoded = FileEntry::from_bytes(&entry.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, entry);
        assert_eq!(decoded.mod_time.timestamp_subsec_nanos(), 123_456_789);
    }

    #[test]
    fn garbage_metadata_is_serialization_error() {
        let err = FileEntry::from_bytes(b"{not json").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Serialization { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn apply_permissions_sets_mode_bits() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("script.sh");
        std::fs::write(&path, b"#!/bin/sh\n").unwrap();

        apply_permissions(&path, 0o100750).unwrap();
        assert_eq!(FileEntry::stat(&path).unwrap().permissions(), 0o750);
    }
}
