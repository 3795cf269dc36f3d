//! File transfer over the two virtual lanes.
//!
//! Every peer runs a downloader (client) and a server task at the same time.
//! The offeror serves on lane 1 and downloads on lane 2; the answerer does the
//! mirror image, so on each lane exactly one side serves.
//!
//! Wire sequence per requested path:
//!   client -> server: relative path
//!   server -> client: metadata (serialized FileEntry)
//!   server -> client: binary chunks totalling `size` bytes (regular files only)
//! The client ends the lane with the sentinel request.

use anyhow::{anyhow, Result};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::entry::{apply_permissions, FileEntry};
use crate::errors::SyncError;
use crate::logger::Logger;
use crate::protocol::{CHUNK_SIZE, SENTINEL};
use crate::protocol_core::{ensure_parent_exists, resolve_under_root};
use crate::snapshot::Snapshot;
use crate::transport::{Lane, Role};

/// The session's in-memory snapshot. Only the downloader writes to it, and
/// only for the paths it has just fetched.
pub type SharedSnapshot = Arc<RwLock<Snapshot>>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransferStats {
    pub files_pulled: u64,
    pub bytes_pulled: u64,
    pub files_served: u64,
    pub bytes_served: u64,
}

pub struct Transfer {
    role: Role,
    root: PathBuf,
    chunk_size: usize,
    snapshot: SharedSnapshot,
    logger: Arc<dyn Logger>,
}

impl Transfer {
    pub fn new(
        role: Role,
        root: impl Into<PathBuf>,
        snapshot: SharedSnapshot,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            role,
            root: root.into(),
            chunk_size: CHUNK_SIZE,
            snapshot,
            logger,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Fetch `pulls` from the peer while serving the peer's requests. Returns
    /// when both local tasks finished, or with the first error either raised.
    pub async fn run(&self, lanes: (Lane, Lane), pulls: Vec<String>) -> Result<TransferStats> {
        let (lane_1, lane_2) = lanes;
        let (serve_lane, download_lane) = match self.role {
            Role::Offer => (lane_1, lane_2),
            Role::Answer => (lane_2, lane_1),
        };

        // Single slot: the first failure wins, later ones are dropped
        let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(1);

        let downloader = Downloader {
            lane: download_lane,
            root: self.root.clone(),
            snapshot: self.snapshot.clone(),
            logger: self.logger.clone(),
        };
        let server = Server {
            lane: serve_lane,
            root: self.root.clone(),
            chunk_size: self.chunk_size,
            snapshot: self.snapshot.clone(),
            logger: self.logger.clone(),
        };

        let download_task = {
            let err_tx = err_tx.clone();
            tokio::spawn(async move { funnel(downloader.run(pulls).await, &err_tx) })
        };
        let serve_task = tokio::spawn(async move { funnel(server.run().await, &err_tx) });
        let aborts = [download_task.abort_handle(), serve_task.abort_handle()];

        let finished = async { (download_task.await, serve_task.await) };
        tokio::select! {
            biased;
            Some(err) = err_rx.recv() => {
                aborts.iter().for_each(|a| a.abort());
                Err(err)
            }
            (pulled, served) = finished => {
                match (pulled, served) {
                    (Ok(Some(pulled)), Ok(Some(served))) => Ok(TransferStats {
                        files_pulled: pulled.0,
                        bytes_pulled: pulled.1,
                        files_served: served.0,
                        bytes_served: served.1,
                    }),
                    (Err(e), _) | (_, Err(e)) => Err(anyhow!("transfer task panicked: {e}")),
                    _ => Err(err_rx.try_recv().unwrap_or_else(|_| {
                        anyhow!("transfer task failed without reporting an error")
                    })),
                }
            }
        }
    }
}

fn funnel<T>(result: Result<T>, errors: &mpsc::Sender<anyhow::Error>) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            let _ = errors.try_send(e);
            None
        }
    }
}

struct Downloader {
    lane: Lane,
    root: PathBuf,
    snapshot: SharedSnapshot,
    logger: Arc<dyn Logger>,
}

impl Downloader {
    /// Returns (files, bytes) received.
    async fn run(self, mut pulls: Vec<String>) -> Result<(u64, u64)> {
        // Shorter paths first so a directory exists before its children arrive
        pulls.sort_by_key(|p| p.len());
        self.logger.debug(&format!("DOWNLOAD: requesting {} paths", pulls.len()));

        let mut bytes = 0u64;
        for rel in &pulls {
            let path = resolve_under_root(&self.root, rel)?;
            self.lane.send(rel.as_bytes().to_vec()).await?;
            let info = FileEntry::from_bytes(&self.lane.recv().await?)?;

            if info.is_dir {
                std::fs::create_dir_all(&path).map_err(|e| SyncError::fs("mkdir", &path, e))?;
                apply_permissions(&path, info.mode)?;
            } else {
                bytes += self.receive_file(rel, &path, &info).await?;
            }

            // Record what is now on disk, not what the peer declared
            let fresh = FileEntry::stat(&path)?;
            let parent = refreshed_parent(&self.root, rel, &self.snapshot)?;
            {
                let mut snap = self.snapshot.write();
                snap.insert(rel.clone(), fresh);
                if let Some((key, entry)) = parent {
                    snap.insert(key, entry);
                }
            }
            self.logger.pulled(rel, info.size);
        }

        self.lane.send(SENTINEL.to_vec()).await?;
        self.logger.debug("DOWNLOAD: finished requests");
        Ok((pulls.len() as u64, bytes))
    }

    async fn receive_file(&self, rel: &str, path: &Path, info: &FileEntry) -> Result<u64> {
        ensure_parent_exists(path)?;
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| SyncError::fs("create", path, e))?;
        apply_permissions(path, info.mode)?;

        let mut received = 0u64;
        while received < info.size {
            let chunk = self.lane.recv().await?;
            received += chunk.len() as u64;
            if received > info.size {
                return Err(SyncError::Protocol(format!(
                    "{rel}: peer sent {received} bytes, declared {}",
                    info.size
                ))
                .into());
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| SyncError::fs("write", path, e))?;
        }
        file.flush().await.map_err(|e| SyncError::fs("write", path, e))?;
        self.logger
            .debug(&format!("DOWNLOAD: received {:>5}/{:>5} {}", received, info.size, rel));
        Ok(received)
    }
}

struct Server {
    lane: Lane,
    root: PathBuf,
    chunk_size: usize,
    snapshot: SharedSnapshot,
    logger: Arc<dyn Logger>,
}

impl Server {
    /// Returns (files, bytes) sent.
    async fn run(self) -> Result<(u64, u64)> {
        let mut files = 0u64;
        let mut bytes = 0u64;

        loop {
            let request = self.lane.recv().await?;
            if request == SENTINEL {
                break;
            }
            let rel = String::from_utf8(request)
                .map_err(|_| SyncError::Protocol("request is not a UTF-8 path".into()))?;
            self.logger.debug(&format!("SEND: got request {rel}"));

            let info = self.snapshot.read().get(&rel).cloned();
            let info = info.ok_or_else(|| {
                SyncError::Protocol(format!(
                    "peer requested {rel}, which is not in the local snapshot"
                ))
            })?;
            let path = resolve_under_root(&self.root, &rel)?;

            self.lane.send(info.to_bytes()?).await?;
            if !info.is_dir {
                bytes += self.stream_file(&rel, &path, info.size).await?;
            }
            files += 1;
            self.logger.served(&rel, info.size);
        }

        self.logger.debug("SEND: finished requests");
        Ok((files, bytes))
    }

    /// Stream exactly `size` bytes; the client counts bytes to find the end.
    async fn stream_file(&self, rel: &str, path: &Path, size: u64) -> Result<u64> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| SyncError::fs("open", path, e))?;
        let mut reader = file.take(size);
        let mut buf = vec![0u8; self.chunk_size];
        let mut sent = 0u64;

        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| SyncError::fs("read", path, e))?;
            if n == 0 {
                break;
            }
            self.lane.send(buf[..n].to_vec()).await?;
            sent += n as u64;
        }

        if sent != size {
            return Err(SyncError::Protocol(format!(
                "{rel} shrank during transfer: sent {sent} of {size} bytes"
            ))
            .into());
        }
        Ok(sent)
    }
}

/// New metadata for the parent directory of `rel`, if the snapshot tracks it.
/// Writing into a directory bumps its mtime; recording that keeps the next
/// session from reporting the directory as modified.
fn refreshed_parent(
    root: &Path,
    rel: &str,
    snapshot: &SharedSnapshot,
) -> Result<Option<(String, FileEntry)>> {
    let Some(parent) = Path::new(rel).parent().and_then(Path::to_str) else {
        return Ok(None);
    };
    if parent.is_empty() || !snapshot.read().contains(parent) {
        return Ok(None);
    }
    let entry = FileEntry::stat(&root.join(parent))?;
    Ok(Some((parent.to_string(), entry)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::NoopLogger;
    use crate::policy::ExcludePath;
    use crate::transport::pair;
    use tempfile::TempDir;

    fn shared(root: &Path) -> SharedSnapshot {
        Arc::new(RwLock::new(
            Snapshot::build(root, &ExcludePath(root.to_path_buf())).unwrap(),
        ))
    }

    fn transfer(role: Role, root: &Path, snap: &SharedSnapshot) -> Transfer {
        Transfer::new(role, root, snap.clone(), Arc::new(NoopLogger)).with_chunk_size(4)
    }

    #[tokio::test]
    async fn pulls_directories_and_files_in_both_directions() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        std::fs::create_dir_all(a.path().join("dir")).unwrap();
        std::fs::write(a.path().join("dir/a.txt"), b"hello, chunked world").unwrap();
        std::fs::write(a.path().join("empty.txt"), b"").unwrap();
        std::fs::write(b.path().join("from_b.txt"), b"bee").unwrap();

        let snap_a = shared(a.path());
        let snap_b = shared(b.path());
        let (ca, cb) = pair();

        let ta = transfer(Role::Offer, a.path(), &snap_a);
        let tb = transfer(Role::Answer, b.path(), &snap_b);
        let pulls_b = vec!["dir/a.txt".to_string(), "empty.txt".to_string(), "dir".to_string()];
        let (ra, rb) = tokio::join!(
            ta.run(ca.split(), vec!["from_b.txt".to_string()]),
            tb.run(cb.split(), pulls_b),
        );
        let (ra, rb) = (ra.unwrap(), rb.unwrap());

        assert_eq!(std::fs::read(b.path().join("dir/a.txt")).unwrap(), b"hello, chunked world");
        assert_eq!(std::fs::read(b.path().join("empty.txt")).unwrap(), b"");
        assert_eq!(std::fs::read(a.path().join("from_b.txt")).unwrap(), b"bee");

        assert_eq!(rb.files_pulled, 3);
        assert_eq!(rb.bytes_pulled, 20);
        assert_eq!(ra.files_served, 3);
        assert_eq!(ra.bytes_served, 20);
        assert_eq!(ra.files_pulled, 1);
        assert_eq!(rb.files_served, 1);

        // B's snapshot now holds B's own view of what it wrote
        let snap_b = snap_b.read();
        let local = FileEntry::stat(&b.path().join("dir/a.txt")).unwrap();
        assert_eq!(snap_b.get("dir/a.txt"), Some(&local));
        assert_eq!(
            snap_b.get("dir"),
            Some(&FileEntry::stat(&b.path().join("dir")).unwrap())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn permissions_follow_the_served_metadata() {
        use std::os::unix::fs::PermissionsExt;
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let script = a.path().join("run.sh");
        std::fs::write(&script, b"#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o750)).unwrap();

        let (snap_a, snap_b) = (shared(a.path()), shared(b.path()));
        let (ca, cb) = pair();
        let ta = transfer(Role::Offer, a.path(), &snap_a);
        let tb = transfer(Role::Answer, b.path(), &snap_b);
        let (ra, rb) = tokio::join!(
            ta.run(ca.split(), vec![]),
            tb.run(cb.split(), vec!["run.sh".to_string()]),
        );
        ra.unwrap();
        rb.unwrap();

        let mode = std::fs::metadata(b.path().join("run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[tokio::test]
    async fn request_for_unknown_path_is_fatal() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        let (snap_a, snap_b) = (shared(a.path()), shared(b.path()));
        let (ca, cb) = pair();

        let ta = transfer(Role::Offer, a.path(), &snap_a);
        let tb = transfer(Role::Answer, b.path(), &snap_b);

        // B waits forever for metadata that never comes; only A is awaited
        let b_task = tokio::spawn(async move {
            tb.run(cb.split(), vec!["not-there.txt".to_string()]).await
        });
        let err = ta.run(ca.split(), vec![]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::Protocol(_))
        ));
        b_task.abort();
    }

    #[test]
    fn parent_refresh_only_for_tracked_dirs() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir(tmp.path().join("d")).unwrap();
        std::fs::write(tmp.path().join("d/f"), b"x").unwrap();
        let snap = shared(tmp.path());

        let (key, entry) = refreshed_parent(tmp.path(), "d/f", &snap).unwrap().unwrap();
        assert_eq!(key, "d");
        assert!(entry.is_dir);
        assert!(refreshed_parent(tmp.path(), "top.txt", &snap).unwrap().is_none());
        assert!(refreshed_parent(tmp.path(), "untracked/f", &snap).unwrap().is_none());
    }
}
