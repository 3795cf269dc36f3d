//! Session driver: one complete reconciliation of a directory with its peer.
//!
//! LoadHistory -> BuildSnapshot -> ExchangeChangeSets -> ResolveDownloads ->
//! ResolveDeletions -> DeleteLocalPaths -> Transfer -> PersistHistory -> Closed
//!
//! Any failure ends in `Failed` and nothing is persisted, so the next run
//! re-diffs against the last successfully reconciled history.

use anyhow::Result;
use parking_lot::RwLock;
use std::cmp::Reverse;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use crate::config::SyncConfig;
use crate::entry::FileEntry;
use crate::errors::SyncError;
use crate::exchange::{exchange, ChangeSet};
use crate::history::HistoryStore;
use crate::logger::{ConsoleLogger, Logger, NoopLogger, TeeLogger, TextLogger};
use crate::protocol_core::resolve_under_root;
use crate::resolver::resolve;
use crate::snapshot::Snapshot;
use crate::transfer::{Transfer, TransferStats};
use crate::transport::Connection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    LoadHistory,
    BuildSnapshot,
    ExchangeChangeSets,
    ResolveDownloads,
    ResolveDeletions,
    DeleteLocalPaths,
    Transfer,
    PersistHistory,
    Closed,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// What one session did.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub session_id: String,
    pub local: ChangeSet,
    pub remote: ChangeSet,
    /// Paths fetched from the peer
    pub pulled: Vec<String>,
    /// Paths removed locally because the peer deleted them
    pub deleted: Vec<String>,
    pub transfer: TransferStats,
}

pub struct Session {
    config: SyncConfig,
    logger: Arc<dyn Logger>,
    id: String,
    state: SessionState,
}

impl Session {
    /// Build a session whose logging follows `config.debug` and `config.log_file`.
    pub fn new(config: SyncConfig) -> Result<Self> {
        let mut sinks: Vec<Box<dyn Logger>> = Vec::new();
        if config.debug {
            sinks.push(Box::new(ConsoleLogger));
        }
        if let Some(path) = &config.log_file {
            sinks.push(Box::new(TextLogger::new(path)?));
        }
        let logger: Arc<dyn Logger> = if sinks.is_empty() {
            Arc::new(NoopLogger)
        } else {
            Arc::new(TeeLogger(sinks))
        };
        Ok(Self::with_logger(config, logger))
    }

    pub fn with_logger(config: SyncConfig, logger: Arc<dyn Logger>) -> Self {
        Self {
            config,
            logger,
            id: uuid::Uuid::new_v4().to_string(),
            state: SessionState::Idle,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run(&mut self, conn: Connection) -> Result<SessionReport> {
        let start = Instant::now();
        self.logger.session_start(&self.id, &self.config.root, conn.role());

        match self.drive(conn).await {
            Ok(report) => {
                self.enter(SessionState::Closed);
                self.logger.done(
                    &self.id,
                    report.transfer.files_pulled,
                    report.transfer.bytes_pulled,
                    start.elapsed().as_secs_f64(),
                );
                Ok(report)
            }
            Err(e) => {
                let failed_in = self.state;
                self.enter(SessionState::Failed);
                self.logger.error(&failed_in.to_string(), &format!("{e:#}"));
                Err(e)
            }
        }
    }

    async fn drive(&mut self, conn: Connection) -> Result<SessionReport> {
        let root = self.config.root.clone();
        if !root.is_dir() {
            return Err(SyncError::fs(
                "open root",
                &root,
                std::io::Error::new(std::io::ErrorKind::NotFound, "not a directory"),
            )
            .into());
        }
        self.watch_connection(&conn);

        self.enter(SessionState::LoadHistory);
        let store = HistoryStore::at(self.config.history_path());
        let old = match store.load()? {
            Some(old) => old,
            None => {
                self.logger.debug("no history found, treating as first sync");
                Snapshot::new()
            }
        };

        self.enter(SessionState::BuildSnapshot);
        let mut new = Snapshot::build(&root, &self.config.policy())?;

        self.enter(SessionState::ExchangeChangeSets);
        let control = conn.control();
        let local = ChangeSet::between(&new, &old);
        self.logger.changes("sent", &local.added, &local.deleted, &local.modified);
        let remote = exchange(&control, &local).await?;
        self.logger.changes("received", &remote.added, &remote.deleted, &remote.modified);

        self.enter(SessionState::ResolveDownloads);
        let to_pull = resolve(&control, &local.changed(), &remote.changed(), &new).await?;
        self.logger.debug(&format!("to download: {to_pull:?}"));

        // Only conflict left: modified here, deleted there
        self.enter(SessionState::ResolveDeletions);
        let to_delete = resolve(&control, &local.modified, &remote.deleted, &new).await?;
        self.logger.debug(&format!("to delete: {to_delete:?}"));

        self.enter(SessionState::DeleteLocalPaths);
        let deleted = delete_paths(&root, &to_delete, &mut new, self.logger.as_ref())?;

        self.enter(SessionState::Transfer);
        let shared = Arc::new(RwLock::new(new));
        let transfer = Transfer::new(conn.role(), &root, shared.clone(), self.logger.clone())
            .with_chunk_size(self.config.chunk_size);
        let stats = transfer.run(conn.split(), to_pull.clone()).await?;
        drop(transfer);

        // Every byte either side needed has arrived; a failed goodbye is not fatal
        if let Err(e) = conn.close().await {
            self.logger.error("close", &format!("{e:#}"));
        }

        self.enter(SessionState::PersistHistory);
        let snapshot = match Arc::try_unwrap(shared) {
            Ok(lock) => lock.into_inner(),
            Err(shared) => shared.read().clone(),
        };
        store.save(&snapshot)?;

        Ok(SessionReport {
            session_id: self.id.clone(),
            local,
            remote,
            pulled: to_pull,
            deleted,
            transfer: stats,
        })
    }

    fn enter(&mut self, state: SessionState) {
        self.logger.debug(&format!("state {} -> {}", self.state, state));
        self.state = state;
    }

    fn watch_connection(&self, conn: &Connection) {
        let mut states = conn.states();
        let logger = self.logger.clone();
        tokio::spawn(async move {
            while states.changed().await.is_ok() {
                let state = states.borrow_and_update().clone();
                logger.debug(&format!("connection state changed: {state:?}"));
            }
        });
    }
}

/// Remove `paths` from disk and from `snapshot`, deepest paths first.
///
/// A directory that still has children after its tracked descendants were
/// removed is kept: those children were changed locally and the peer may be
/// about to fetch them.
pub fn delete_paths(
    root: &Path,
    paths: &[String],
    snapshot: &mut Snapshot,
    logger: &dyn Logger,
) -> Result<Vec<String>> {
    let mut ordered = paths.to_vec();
    ordered.sort_by_key(|p| Reverse(p.len()));

    let mut deleted = Vec::with_capacity(ordered.len());
    for rel in &ordered {
        let path = resolve_under_root(root, rel)?;
        let meta = match std::fs::symlink_metadata(&path) {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(SyncError::fs("stat", &path, e).into()),
        };

        match meta {
            Some(meta) if meta.is_dir() => {
                let has_children = std::fs::read_dir(&path)
                    .map_err(|e| SyncError::fs("read dir", &path, e))?
                    .next()
                    .is_some();
                if has_children {
                    logger.debug(&format!("keeping non-empty directory {rel}"));
                    continue;
                }
                std::fs::remove_dir(&path).map_err(|e| SyncError::fs("remove dir", &path, e))?;
            }
            Some(_) => {
                std::fs::remove_file(&path).map_err(|e| SyncError::fs("remove", &path, e))?;
            }
            None => {}
        }

        snapshot.remove(rel);
        logger.deleted(rel);
        deleted.push(rel.clone());
    }

    // Removing entries bumps the parent directory's mtime
    for rel in &deleted {
        let Some(parent) = Path::new(rel).parent().and_then(Path::to_str) else {
            continue;
        };
        if parent.is_empty() || !snapshot.contains(parent) {
            continue;
        }
        let parent_path = root.join(parent);
        if parent_path.is_dir() {
            snapshot.insert(parent, FileEntry::stat(&parent_path)?);
        }
    }

    Ok(deleted)
}
