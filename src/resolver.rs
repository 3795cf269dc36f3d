//! Last-write-wins conflict resolution.
//!
//! Paths only the peer changed are taken from the peer unconditionally.
//! Paths both sides changed are settled by asking the peer for its metadata
//! and comparing modification times: the peer wins only when its timestamp
//! is strictly newer. Both peers run this at the same time over the same
//! lane, each answering the other's metadata request.

use anyhow::Result;
use std::collections::HashSet;

use crate::errors::SyncError;
use crate::protocol::{decode_paths, encode_paths};
use crate::snapshot::Snapshot;
use crate::transport::Lane;

/// Split `remote_changed` into (overlap, exclusive) with respect to `local_changed`.
pub fn partition(
    local_changed: &[String],
    remote_changed: &[String],
) -> (Vec<String>, Vec<String>) {
    let local: HashSet<&str> = local_changed.iter().map(String::as_str).collect();
    remote_changed
        .iter()
        .cloned()
        .partition(|p| local.contains(p.as_str()))
}

/// Overlap paths whose remote timestamp is strictly newer than the local one.
pub fn newer_remote(remote: &Snapshot, local: &Snapshot) -> Vec<String> {
    remote
        .iter()
        .filter(|(path, theirs)| match local.get(path.as_str()) {
            Some(ours) => theirs.mod_time > ours.mod_time,
            None => true,
        })
        .map(|(path, _)| path.clone())
        .collect()
}

/// Decide which of the peer's changed paths must be taken from the peer.
pub async fn resolve(
    lane: &Lane,
    local_changed: &[String],
    remote_changed: &[String],
    local: &Snapshot,
) -> Result<Vec<String>> {
    let (overlap, mut pull) = partition(local_changed, remote_changed);

    lane.send(encode_paths(&overlap)).await?;

    // The peer's own request arrives before its reply to ours, since it sends
    // the request first and only replies after reading ours.
    let requested = decode_paths(&lane.recv().await?);
    let reply = local.subset(&requested).to_bytes()?;
    let replier = lane.clone();
    let reply_task = tokio::spawn(async move { replier.send(reply).await });

    let theirs = Snapshot::from_bytes(&lane.recv().await?)?;
    pull.extend(newer_remote(&theirs, local));

    reply_task
        .await
        .map_err(|e| SyncError::Connection(format!("metadata reply task failed: {e}")))??;
    Ok(pull)
}
