//! Error kinds surfaced by a sync session

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{op} failed for {}: {source}", path.display())]
    Filesystem {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed {what}: {source}")]
    Serialization {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("protocol integrity: {0}")]
    Protocol(String),

    #[error("connection: {0}")]
    Connection(String),
}

impl SyncError {
    pub fn fs(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Filesystem {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn serde(what: &'static str, source: serde_json::Error) -> Self {
        SyncError::Serialization { what, source }
    }
}
