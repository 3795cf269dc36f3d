//! Change sets and their exchange over the control lane.
//!
//! Each peer sends its added, deleted and modified lists as three messages in
//! that order while concurrently receiving the peer's three lists.

use anyhow::Result;
use tokio::sync::oneshot;

use crate::errors::SyncError;
use crate::protocol::{decode_paths, encode_paths};
use crate::snapshot::{key_diff, value_diff, Snapshot};
use crate::transport::Lane;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    pub modified: Vec<String>,
}

impl ChangeSet {
    /// Compare the freshly built snapshot against the persisted history.
    pub fn between(new: &Snapshot, old: &Snapshot) -> Self {
        ChangeSet {
            added: key_diff(new, old),
            deleted: key_diff(old, new),
            modified: value_diff(new, old),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty() && self.modified.is_empty()
    }

    /// added ∪ modified
    pub fn changed(&self) -> Vec<String> {
        self.added.iter().chain(&self.modified).cloned().collect()
    }
}

pub async fn send_changes(lane: &Lane, changes: &ChangeSet) -> Result<()> {
    lane.send(encode_paths(&changes.added)).await?;
    lane.send(encode_paths(&changes.deleted)).await?;
    lane.send(encode_paths(&changes.modified)).await?;
    Ok(())
}

pub async fn recv_changes(lane: &Lane) -> Result<ChangeSet> {
    let added = decode_paths(&lane.recv().await?);
    let deleted = decode_paths(&lane.recv().await?);
    let modified = decode_paths(&lane.recv().await?);
    Ok(ChangeSet {
        added,
        deleted,
        modified,
    })
}

/// Send `local` and receive the peer's change set concurrently. Returns once
/// the local send has completed and all three remote lists have arrived.
pub async fn exchange(lane: &Lane, local: &ChangeSet) -> Result<ChangeSet> {
    let (done_tx, done_rx) = oneshot::channel();
    let sender = lane.clone();
    let outgoing = local.clone();
    tokio::spawn(async move {
        let _ = done_tx.send(send_changes(&sender, &outgoing).await);
    });

    let remote = recv_changes(lane).await?;
    done_rx
        .await
        .map_err(|_| SyncError::Connection("change-set sender vanished".into()))??;
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::FileEntry;
    use crate::transport::pair;
    use chrono::{DateTime, Utc};

    fn entry(size: u64) -> FileEntry {
        FileEntry {
            name: "x".into(),
            size,
            mode: 0o100644,
            mod_time: DateTime::<Utc>::from_timestamp(1_000, 0).unwrap(),
            is_dir: false,
        }
    }

    #[test]
    fn change_lists_are_disjoint() {
        let old: Snapshot = [
            ("same".to_string(), entry(1)),
            ("edit".to_string(), entry(1)),
            ("drop".to_string(), entry(1)),
        ]
        .into_iter()
        .collect();
        let new: Snapshot = [
            ("same".to_string(), entry(1)),
            ("edit".to_string(), entry(2)),
            ("make".to_string(), entry(1)),
        ]
        .into_iter()
        .collect();

        let cs = ChangeSet::between(&new, &old);
        assert_eq!(cs.added, vec!["make"]);
        assert_eq!(cs.deleted, vec!["drop"]);
        assert_eq!(cs.modified, vec!["edit"]);
        assert_eq!(cs.changed(), vec!["make", "edit"]);
        assert!(ChangeSet::between(&new, &new).is_empty());
    }

    #[tokio::test]
    async fn both_peers_learn_each_others_changes() {
        let (a, b) = pair();
        let ours = ChangeSet {
            added: vec!["dir".into(), "dir/a.txt".into()],
            deleted: vec![],
            modified: vec!["notes.md".into()],
        };
        let theirs = ChangeSet {
            added: vec![],
            deleted: vec!["old.bin".into()],
            modified: vec![],
        };

        let (la, lb) = (a.control(), b.control());
        let (got_a, got_b) = tokio::join!(exchange(&la, &ours), exchange(&lb, &theirs));
        assert_eq!(got_a.unwrap(), theirs);
        assert_eq!(got_b.unwrap(), ours);
    }

    #[tokio::test]
    async fn empty_change_sets_round_trip() {
        let (a, b) = pair();
        let empty = ChangeSet::default();
        let (la, lb) = (a.control(), b.control());
        let (got_a, got_b) = tokio::join!(exchange(&la, &empty), exchange(&lb, &empty));
        assert!(got_a.unwrap().is_empty());
        assert!(got_b.unwrap().is_empty());
    }
}
