//! Persisted history: the last snapshot both peers reconciled.
//!
//! The history file is only ever replaced as a whole, so an interrupted
//! session leaves the previous record intact and the next run re-diffs
//! against it.

use anyhow::Result;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use crate::errors::SyncError;
use crate::protocol::{HISTORY_FILE, HISTORY_TEMP_PREFIX};
use crate::snapshot::Snapshot;

pub struct HistoryStore {
    path: PathBuf,
}

impl HistoryStore {
    pub fn for_root(root: &Path) -> Self {
        Self::at(root.join(HISTORY_FILE))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the last reconciled snapshot. A missing or empty file means this
    /// is the first sync of the directory.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::fs("read history", &self.path, e).into()),
        };
        if data.is_empty() {
            return Ok(None);
        }
        Snapshot::from_bytes(&data).map(Some)
    }

    /// Replace the history file with `snapshot` in one rename.
    pub fn save(&self, snapshot: &Snapshot) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let payload = snapshot.to_bytes()?;

        let mut tmp = staging_file(dir).map_err(|e| SyncError::fs("create temp history", dir, e))?;
        tmp.write_all(&payload)
            .and_then(|_| tmp.flush())
            .map_err(|e| SyncError::fs("write history", tmp.path(), e))?;
        tmp.persist(&self.path)
            .map_err(|e| SyncError::fs("persist history", &self.path, e.error))?;
        Ok(())
    }
}

/// Staging file next to the history. Its reserved prefix keeps a file left
/// behind by a crash out of every snapshot.
fn staging_file(dir: &Path) -> std::io::Result<tempfile::NamedTempFile> {
    tempfile::Builder::new()
        .prefix(HISTORY_TEMP_PREFIX)
        .tempfile_in(dir)
}
