//! Frame header codec and path handling shared by the transport and the
//! transfer tasks.

use anyhow::{bail, Result};
use std::path::{Component, Path, PathBuf};

use crate::errors::SyncError;

/// Frame header length: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub const HEADER_LEN: usize = 11;

/// Validate frame payload size against protocol::MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<()> {
    if size > crate::protocol::MAX_FRAME_SIZE {
        bail!(SyncError::Connection(format!(
            "frame payload too large: {} bytes (max: {})",
            size,
            crate::protocol::MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

pub fn build_frame_header(frame_type: u8, payload_len: u32) -> [u8; HEADER_LEN] {
    use crate::protocol::{MAGIC, VERSION};

    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(MAGIC);
    header[4..6].copy_from_slice(&VERSION.to_le_bytes());
    header[6] = frame_type;
    header[7..11].copy_from_slice(&payload_len.to_le_bytes());
    header
}

/// Parse frame header
/// Returns: (frame_type, payload_length)
pub fn parse_frame_header(header: &[u8; HEADER_LEN]) -> Result<(u8, u32)> {
    use crate::protocol::{MAGIC, VERSION};

    if &header[0..4] != MAGIC {
        bail!(SyncError::Connection("invalid magic in frame header".into()));
    }

    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != VERSION {
        bail!(SyncError::Connection(format!(
            "protocol version mismatch: got {}, expected {}",
            version, VERSION
        )));
    }

    let frame_type = header[6];
    let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]);

    Ok((frame_type, payload_len))
}

/// Resolve a peer-supplied relative path under `root`.
///
/// Rejects absolute paths, parent components and NUL bytes; the peer only
/// ever names paths inside the synchronized tree.
pub fn resolve_under_root(root: &Path, rel: &str) -> Result<PathBuf> {
    if rel.contains('\0') {
        bail!(SyncError::Protocol(format!("path contains NUL byte: {:?}", rel)));
    }

    let mut safe = PathBuf::new();
    for component in Path::new(rel).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(s) => safe.push(s),
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                bail!(SyncError::Protocol(format!(
                    "path {:?} contains disallowed component {:?}",
                    rel, component
                )));
            }
        }
    }

    Ok(root.join(safe))
}

/// Create parent directory if needed
pub fn ensure_parent_exists(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::fs("mkdir", parent, e))?;
        }
    }
    Ok(())
}
