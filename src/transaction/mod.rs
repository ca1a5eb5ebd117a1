// # Transaction manager
//
// Binds the WAL, the version manager and the snapshot manager into the
// transaction lifecycle. Writes are staged in a per-transaction write set
// (read-your-writes, last-write-wins) and logged as they happen; nothing is
// published to MVCC until the commit barrier has made the `Commit` frame
// durable, so a crash between the barrier and publication is repaired by
// WAL replay.
//
// State machine: Active -> {Committing | Aborted},
// Committing -> {Committed | Aborted}. Terminal states are immutable.
// Dropping an unterminated handle rolls the transaction back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::{Timestamp, TxnId};
use crate::error::{DbError, Result};
use crate::mvcc::{Snapshot, SnapshotManager, VersionManager, Visibility};
use crate::wal::{Wal, WalRecord};

/// Isolation levels, with the wire-level names clients use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborted,
}

struct TxnInner {
    id: TxnId,
    level: IsolationLevel,
    start_ts: Timestamp,
    state: Mutex<TxnState>,
    snapshot: Mutex<Snapshot>,
    /// Staged mutations; `None` is a tombstone.
    write_set: Mutex<HashMap<Vec<u8>, Option<Vec<u8>>>>,
    /// Serializable only: identity of the newest committed version at first
    /// read of each key.
    read_set: Mutex<HashMap<Vec<u8>, Option<(TxnId, Timestamp)>>>,
    commit_ts: Mutex<Option<Timestamp>>,
}

/// Caller-facing transaction handle. Dropping it without commit or rollback
/// rolls the transaction back.
pub struct Txn {
    inner: Arc<TxnInner>,
    manager: Arc<TxnManager>,
}

impl Txn {
    pub fn id(&self) -> TxnId {
        self.inner.id
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.inner.level
    }

    pub fn state(&self) -> TxnState {
        *self.inner.state.lock()
    }

    pub fn start_ts(&self) -> Timestamp {
        self.inner.start_ts
    }

    pub fn commit_ts(&self) -> Option<Timestamp> {
        *self.inner.commit_ts.lock()
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if *self.inner.state.lock() == TxnState::Active {
            let _ = self.manager.rollback_inner(&self.inner);
        }
    }
}

/// Owns transaction records and drives the commit protocol.
pub struct TxnManager {
    wal: Arc<Wal>,
    versions: Arc<VersionManager>,
    snapshots: Arc<SnapshotManager>,
    next_txn_id: AtomicU64,
    closed: AtomicBool,
}

impl TxnManager {
    pub fn new(
        wal: Arc<Wal>,
        versions: Arc<VersionManager>,
        snapshots: Arc<SnapshotManager>,
    ) -> Self {
        Self {
            wal,
            versions,
            snapshots,
            next_txn_id: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Seed the id space after recovery so replayed ids are never reissued.
    pub fn seed_txn_id(&self, max_seen: TxnId) {
        self.next_txn_id.fetch_max(max_seen, Ordering::SeqCst);
    }

    pub fn begin(self: &Arc<Self>, level: IsolationLevel) -> Result<Txn> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = self.snapshots.snapshot();
        let start_ts = snapshot.snapshot_ts;
        self.wal.append(&WalRecord::Begin {
            txn_id: id,
            ts: start_ts,
        })?;
        debug!(txn = id, ?level, "transaction started");

        Ok(Txn {
            inner: Arc::new(TxnInner {
                id,
                level,
                start_ts,
                state: Mutex::new(TxnState::Active),
                snapshot: Mutex::new(snapshot),
                write_set: Mutex::new(HashMap::new()),
                read_set: Mutex::new(HashMap::new()),
                commit_ts: Mutex::new(None),
            }),
            manager: Arc::clone(self),
        })
    }

    /// Resolve a key through the write set first, then MVCC under the
    /// transaction's isolation level.
    pub fn read(&self, txn: &Txn, key: &[u8]) -> Result<Visibility> {
        let inner = &txn.inner;
        self.ensure_active(inner, "read")?;

        if let Some(staged) = inner.write_set.lock().get(key) {
            return Ok(match staged {
                Some(bytes) => Visibility::Payload(bytes.clone()),
                None => Visibility::Deleted,
            });
        }

        match inner.level {
            IsolationLevel::ReadUncommitted => Ok(self.versions.read_latest(key)),
            IsolationLevel::ReadCommitted => {
                // Fresh horizon at every read.
                let snapshot = self.snapshots.snapshot();
                let result = self.versions.read_visible(key, &snapshot, Some(inner.id));
                *inner.snapshot.lock() = snapshot;
                Ok(result)
            }
            IsolationLevel::RepeatableRead => {
                let snapshot = inner.snapshot.lock().clone();
                Ok(self.versions.read_visible(key, &snapshot, Some(inner.id)))
            }
            IsolationLevel::Serializable => {
                let snapshot = inner.snapshot.lock().clone();
                let result = self.versions.read_visible(key, &snapshot, Some(inner.id));
                // Record what this key looked like the first time we read
                // it; commit validates the identity did not move.
                let observed = self
                    .versions
                    .latest_committed(key, &self.snapshots.committed_set());
                inner
                    .read_set
                    .lock()
                    .entry(key.to_vec())
                    .or_insert(observed);
                Ok(result)
            }
        }
    }

    /// Stage a write (or tombstone) and log it. Last write wins within the
    /// transaction.
    pub fn write(&self, txn: &Txn, key: &[u8], value: Option<Vec<u8>>) -> Result<()> {
        let inner = &txn.inner;
        self.ensure_active(inner, "write")?;

        self.wal.append(&WalRecord::Write {
            txn_id: inner.id,
            key: key.to_vec(),
            value: value.clone(),
        })?;
        inner.write_set.lock().insert(key.to_vec(), value);
        Ok(())
    }

    /// Run the commit protocol. Read-only transactions bypass the WAL
    /// barrier entirely.
    pub fn commit(&self, txn: &Txn) -> Result<()> {
        let inner = &txn.inner;
        {
            let mut state = inner.state.lock();
            if *state != TxnState::Active {
                return Err(DbError::TransactionState(format!(
                    "commit on transaction {} in state {:?}",
                    inner.id, *state
                )));
            }
            *state = TxnState::Committing;
        }

        let writes: Vec<(Vec<u8>, Option<Vec<u8>>)> = {
            let write_set = inner.write_set.lock();
            write_set
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        if writes.is_empty() {
            // Read-only fast path: no frame, no barrier.
            *inner.state.lock() = TxnState::Committed;
            return Ok(());
        }

        if inner.level == IsolationLevel::Serializable {
            if let Err(conflict) = self.validate_read_set(inner) {
                *inner.state.lock() = TxnState::Aborted;
                let _ = self.wal.append(&WalRecord::Abort { txn_id: inner.id });
                return Err(conflict);
            }
        }

        let (commit_ts, waiter) = self.wal.append_commit(inner.id, self.snapshots.clock())?;
        if let Err(e) = waiter.wait() {
            // The commit frame never became durable; the transaction is gone.
            *inner.state.lock() = TxnState::Aborted;
            return Err(e);
        }

        // Publication must follow the barrier: a crash in between is
        // recovered by WAL replay.
        for (key, value) in writes {
            self.versions.put_version(&key, inner.id, commit_ts, value);
        }
        self.snapshots.mark_committed(inner.id);

        *inner.commit_ts.lock() = Some(commit_ts);
        *inner.state.lock() = TxnState::Committed;
        debug!(txn = inner.id, commit_ts, "transaction committed");
        Ok(())
    }

    /// Abort: discard staged writes, log the abort, drop the snapshot.
    pub fn rollback(&self, txn: &Txn) -> Result<()> {
        self.rollback_inner(&txn.inner)
    }

    fn rollback_inner(&self, inner: &TxnInner) -> Result<()> {
        {
            let mut state = inner.state.lock();
            if !matches!(*state, TxnState::Active | TxnState::Committing) {
                return Err(DbError::TransactionState(format!(
                    "rollback on transaction {} in state {:?}",
                    inner.id, *state
                )));
            }
            *state = TxnState::Aborted;
        }
        inner.write_set.lock().clear();
        inner.read_set.lock().clear();
        self.wal.append(&WalRecord::Abort { txn_id: inner.id })?;
        debug!(txn = inner.id, "transaction rolled back");
        Ok(())
    }

    /// Stop accepting new transactions.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn ensure_active(&self, inner: &TxnInner, op: &str) -> Result<()> {
        let state = *inner.state.lock();
        if state != TxnState::Active {
            return Err(DbError::TransactionState(format!(
                "{} on transaction {} in state {:?}",
                op, inner.id, state
            )));
        }
        Ok(())
    }

    /// Serializable validation: every key read must still resolve to the
    /// same committed version identity it had when first read.
    fn validate_read_set(&self, inner: &TxnInner) -> Result<()> {
        let committed = self.snapshots.committed_set();
        let read_set = inner.read_set.lock();
        for (key, observed) in read_set.iter() {
            let current = self.versions.latest_committed(key, &committed);
            if current != *observed {
                debug!(txn = inner.id, "serializable validation failed");
                return Err(DbError::SerializationConflict);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::WalConfig;
    use tempfile::tempdir;

    fn manager() -> (tempfile::TempDir, Arc<TxnManager>) {
        let dir = tempdir().unwrap();
        let wal = Arc::new(Wal::open(&dir.path().join("wal"), WalConfig::default()).unwrap());
        let manager = Arc::new(TxnManager::new(
            wal,
            Arc::new(VersionManager::new()),
            Arc::new(SnapshotManager::new()),
        ));
        (dir, manager)
    }

    #[test]
    fn read_your_writes() {
        let (_dir, manager) = manager();
        let txn = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        manager.write(&txn, b"k", Some(b"v".to_vec())).unwrap();
        assert_eq!(
            manager.read(&txn, b"k").unwrap(),
            Visibility::Payload(b"v".to_vec())
        );
        manager.commit(&txn).unwrap();
    }

    #[test]
    fn staged_writes_invisible_until_commit() {
        let (_dir, manager) = manager();
        let writer = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        manager.write(&writer, b"k", Some(b"v".to_vec())).unwrap();

        let reader = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(manager.read(&reader, b"k").unwrap(), Visibility::Missing);

        manager.commit(&writer).unwrap();
        assert_eq!(
            manager.read(&reader, b"k").unwrap(),
            Visibility::Payload(b"v".to_vec()),
            "read committed refreshes its snapshot"
        );
        manager.commit(&reader).unwrap();
    }

    #[test]
    fn repeatable_read_is_stable() {
        let (_dir, manager) = manager();

        let setup = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        manager.write(&setup, b"k", Some(b"old".to_vec())).unwrap();
        manager.commit(&setup).unwrap();

        let reader = manager.begin(IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(
            manager.read(&reader, b"k").unwrap(),
            Visibility::Payload(b"old".to_vec())
        );

        let writer = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        manager.write(&writer, b"k", Some(b"new".to_vec())).unwrap();
        manager.commit(&writer).unwrap();

        assert_eq!(
            manager.read(&reader, b"k").unwrap(),
            Visibility::Payload(b"old".to_vec()),
            "repeated read must return the identical result"
        );
        manager.commit(&reader).unwrap();
    }

    #[test]
    fn serializable_conflict_detected() {
        let (_dir, manager) = manager();

        let setup = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        manager.write(&setup, b"k", Some(b"0".to_vec())).unwrap();
        manager.commit(&setup).unwrap();

        let t1 = manager.begin(IsolationLevel::Serializable).unwrap();
        manager.read(&t1, b"k").unwrap();

        let t2 = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        manager.write(&t2, b"k", Some(b"1".to_vec())).unwrap();
        manager.commit(&t2).unwrap();

        manager.write(&t1, b"other", Some(b"x".to_vec())).unwrap();
        assert!(matches!(
            manager.commit(&t1),
            Err(DbError::SerializationConflict)
        ));
        assert_eq!(t1.state(), TxnState::Aborted);
    }

    #[test]
    fn serializable_commit_without_interference() {
        let (_dir, manager) = manager();
        let txn = manager.begin(IsolationLevel::Serializable).unwrap();
        manager.read(&txn, b"missing").unwrap();
        manager.write(&txn, b"k", Some(b"v".to_vec())).unwrap();
        manager.commit(&txn).unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
    }

    #[test]
    fn read_only_commit_skips_barrier() {
        let (_dir, manager) = manager();
        let before = manager.wal.stats().fsyncs;
        let txn = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        manager.read(&txn, b"anything").unwrap();
        manager.commit(&txn).unwrap();
        assert_eq!(manager.wal.stats().fsyncs, before);
    }

    #[test]
    fn terminal_states_reject_operations() {
        let (_dir, manager) = manager();
        let txn = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        manager.commit(&txn).unwrap();

        assert!(matches!(
            manager.write(&txn, b"k", Some(b"v".to_vec())),
            Err(DbError::TransactionState(_))
        ));
        assert!(matches!(
            manager.commit(&txn),
            Err(DbError::TransactionState(_))
        ));
        assert!(matches!(
            manager.rollback(&txn),
            Err(DbError::TransactionState(_))
        ));
    }

    #[test]
    fn rollback_discards_staged_writes() {
        let (_dir, manager) = manager();
        let txn = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        manager.write(&txn, b"k", Some(b"v".to_vec())).unwrap();
        manager.rollback(&txn).unwrap();

        let reader = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(manager.read(&reader, b"k").unwrap(), Visibility::Missing);
        manager.commit(&reader).unwrap();
    }

    #[test]
    fn dropping_active_handle_rolls_back() {
        let (_dir, manager) = manager();
        {
            let txn = manager.begin(IsolationLevel::ReadCommitted).unwrap();
            manager.write(&txn, b"k", Some(b"v".to_vec())).unwrap();
            // Dropped without terminating.
        }
        let reader = manager.begin(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(manager.read(&reader, b"k").unwrap(), Visibility::Missing);
        manager.commit(&reader).unwrap();
    }

    #[test]
    fn closed_manager_rejects_begin() {
        let (_dir, manager) = manager();
        manager.close();
        assert!(matches!(
            manager.begin(IsolationLevel::ReadCommitted),
            Err(DbError::Closed)
        ));
    }
}
