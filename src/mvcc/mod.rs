// # MVCC version manager and snapshots
//
// Every logical key owns a chain of versions, newest first. Readers never
// block writers: a snapshot is a logical timestamp plus the set of
// transactions committed when it was taken, and a read walks the chain for
// the newest entry the snapshot can see.
//
// Versions are only published at commit, under the committing transaction's
// commit timestamp; in-flight writes live in the transaction's write set
// until then. Chains are never garbage collected; the hook for a
// compaction pass driven by the oldest live snapshot would slot in here.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::common::{Timestamp, TxnId};

/// One entry in a version chain. `payload == None` is a tombstone.
#[derive(Debug, Clone)]
pub struct Version {
    pub txn_id: TxnId,
    pub ts: Timestamp,
    pub payload: Option<Vec<u8>>,
}

/// Outcome of a visibility walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Visibility {
    /// A live version is visible.
    Payload(Vec<u8>),
    /// The newest visible version is a tombstone.
    Deleted,
    /// No version is visible to this snapshot.
    Missing,
}

/// A visibility horizon: everything committed at or before `snapshot_ts` by
/// a transaction in `committed` is visible.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub snapshot_ts: Timestamp,
    committed: Arc<HashSet<TxnId>>,
}

impl Snapshot {
    fn sees(&self, txn_id: TxnId, ts: Timestamp) -> bool {
        ts <= self.snapshot_ts && self.committed.contains(&txn_id)
    }

    pub fn is_committed(&self, txn_id: TxnId) -> bool {
        self.committed.contains(&txn_id)
    }
}

/// Per-key version chains.
#[derive(Default)]
pub struct VersionManager {
    chains: DashMap<Vec<u8>, Vec<Version>>,
}

impl VersionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a version into the key's chain, keeping timestamps
    /// non-increasing from the head. Concurrent committers may publish out
    /// of timestamp order, so the slot is found by position rather than
    /// assumed to be the head.
    pub fn put_version(&self, key: &[u8], txn_id: TxnId, ts: Timestamp, payload: Option<Vec<u8>>) {
        let mut chain = self.chains.entry(key.to_vec()).or_default();
        let pos = chain.partition_point(|v| v.ts > ts);
        chain.insert(
            pos,
            Version {
                txn_id,
                ts,
                payload,
            },
        );
    }

    /// Newest version visible to `snapshot`; a transaction always sees its
    /// own versions regardless of commit state.
    pub fn read_visible(&self, key: &[u8], snapshot: &Snapshot, own: Option<TxnId>) -> Visibility {
        let Some(chain) = self.chains.get(key) else {
            return Visibility::Missing;
        };
        for version in chain.iter() {
            let own_version = own == Some(version.txn_id);
            if own_version || snapshot.sees(version.txn_id, version.ts) {
                return match &version.payload {
                    Some(bytes) => Visibility::Payload(bytes.clone()),
                    None => Visibility::Deleted,
                };
            }
        }
        Visibility::Missing
    }

    /// Absolute newest version, committed or not (Read Uncommitted).
    pub fn read_latest(&self, key: &[u8]) -> Visibility {
        let Some(chain) = self.chains.get(key) else {
            return Visibility::Missing;
        };
        match chain.first() {
            Some(version) => match &version.payload {
                Some(bytes) => Visibility::Payload(bytes.clone()),
                None => Visibility::Deleted,
            },
            None => Visibility::Missing,
        }
    }

    /// Identity of the newest committed version, used by the Serializable
    /// commit-time validation.
    pub fn latest_committed(
        &self,
        key: &[u8],
        committed: &HashSet<TxnId>,
    ) -> Option<(TxnId, Timestamp)> {
        let chain = self.chains.get(key)?;
        chain
            .iter()
            .find(|v| committed.contains(&v.txn_id))
            .map(|v| (v.txn_id, v.ts))
    }

    pub fn key_count(&self) -> usize {
        self.chains.len()
    }
}

/// Allocates snapshots and tracks the committed set and the logical clock.
pub struct SnapshotManager {
    clock: Arc<AtomicU64>,
    committed: RwLock<Arc<HashSet<TxnId>>>,
}

impl SnapshotManager {
    pub fn new() -> Self {
        Self {
            clock: Arc::new(AtomicU64::new(0)),
            committed: RwLock::new(Arc::new(HashSet::new())),
        }
    }

    /// Capture the current horizon. O(1): the committed set is shared
    /// copy-on-write and replaced wholesale at each commit.
    pub fn snapshot(&self) -> Snapshot {
        let committed = Arc::clone(&self.committed.read());
        Snapshot {
            snapshot_ts: self.clock.load(Ordering::SeqCst),
            committed,
        }
    }

    /// Record a commit; every snapshot taken afterwards observes it.
    pub fn mark_committed(&self, txn_id: TxnId) {
        let mut guard = self.committed.write();
        let mut next = HashSet::clone(&guard);
        next.insert(txn_id);
        *guard = Arc::new(next);
    }

    pub fn committed_set(&self) -> Arc<HashSet<TxnId>> {
        Arc::clone(&self.committed.read())
    }

    /// The logical clock; commit timestamps are allocated from it under the
    /// WAL append lock.
    pub fn clock(&self) -> &Arc<AtomicU64> {
        &self.clock
    }

    /// Seed clock and committed set from WAL recovery.
    pub fn restore(&self, committed: impl IntoIterator<Item = TxnId>, max_ts: Timestamp) {
        let mut guard = self.committed.write();
        let mut next = HashSet::clone(&guard);
        next.extend(committed);
        *guard = Arc::new(next);
        self.clock.fetch_max(max_ts, Ordering::SeqCst);
    }
}

impl Default for SnapshotManager {
    fn default() -> Self {
        Self::new()
    }
}
