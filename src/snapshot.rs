//! Snapshot: relative path -> metadata for a directory tree at one instant

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, MAIN_SEPARATOR_STR};
use walkdir::WalkDir;

use crate::entry::FileEntry;
use crate::errors::SyncError;
use crate::policy::Predicate;
use crate::protocol::PATH_DELIMITER;

/// Key used for the walk root when a policy lets it through.
pub const ROOT_KEY: &str = ".";

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Snapshot {
    entries: BTreeMap<String, FileEntry>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk `root` recursively and record every directory and regular file
    /// the policy admits. Any walk error aborts the whole build.
    ///
    /// Symlinks and special files are not tracked, and neither are paths that
    /// contain the wire delimiter since they cannot be named in a path list.
    pub fn build(root: &Path, policy: &dyn Predicate) -> Result<Self> {
        let mut snapshot = Snapshot::new();

        for entry in WalkDir::new(root).follow_links(false) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(root).to_path_buf();
                SyncError::fs("walk", path, e.into())
            })?;

            let file_type = entry.file_type();
            if !file_type.is_dir() && !file_type.is_file() {
                continue;
            }
            if !policy.include(entry.path(), file_type.is_dir()) {
                continue;
            }

            let Some(key) = relative_key(root, entry.path()) else {
                continue;
            };
            let meta = entry
                .metadata()
                .map_err(|e| SyncError::fs("stat", entry.path(), e.into()))?;
            let name = entry.file_name().to_string_lossy();
            let info = FileEntry::from_metadata(&name, &meta)
                .map_err(|e| SyncError::fs("stat", entry.path(), e))?;
            snapshot.entries.insert(key, info);
        }

        Ok(snapshot)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.entries.contains_key(path)
    }

    pub fn insert(&mut self, path: impl Into<String>, entry: FileEntry) {
        self.entries.insert(path.into(), entry);
    }

    pub fn remove(&mut self, path: &str) -> Option<FileEntry> {
        self.entries.remove(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FileEntry)> {
        self.entries.iter()
    }

    /// Copy of this snapshot restricted to `keys`; unknown keys are skipped.
    pub fn subset<S: AsRef<str>>(&self, keys: &[S]) -> Snapshot {
        let entries = keys
            .iter()
            .filter_map(|k| {
                let k = k.as_ref();
                self.entries.get(k).map(|e| (k.to_string(), e.clone()))
            })
            .collect();
        Snapshot { entries }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self).map_err(|e| SyncError::serde("snapshot", e))?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data).map_err(|e| SyncError::serde("snapshot", e))?)
    }
}

impl FromIterator<(String, FileEntry)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, FileEntry)>>(iter: I) -> Self {
        Snapshot {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Paths present in `a` and absent from `b`, in key order.
pub fn key_diff(a: &Snapshot, b: &Snapshot) -> Vec<String> {
    a.entries
        .keys()
        .filter(|k| !b.entries.contains_key(*k))
        .cloned()
        .collect()
}

/// Paths present in both snapshots with differing metadata, in key order.
pub fn value_diff(a: &Snapshot, b: &Snapshot) -> Vec<String> {
    a.entries
        .iter()
        .filter(|(k, va)| b.entries.get(*k).is_some_and(|vb| vb != *va))
        .map(|(k, _)| k.clone())
        .collect()
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    if rel.as_os_str().is_empty() {
        return Some(ROOT_KEY.to_string());
    }
    let parts: Vec<&str> = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<_>>()?;
    let key = parts.join(MAIN_SEPARATOR_STR);
    (!key.contains(PATH_DELIMITER)).then_some(key)
}
