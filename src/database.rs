// # Database façade
//
// Wires the pager, buffer pool, WAL, MVCC and catalog together, runs
// recovery at open, and exposes the transactional API the collection layer
// sits on. One `Database` owns one directory:
//
// ```text
// <path>/data.db              paged store (optionally encrypted)
// <path>/wal/000001.wal ...   append-only log segments
// <path>/system_catalog.json  collection and index metadata
// ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::buffer::{BufferPool, PoolStats};
use crate::catalog::Catalog;
use crate::collection::Collection;
use crate::error::{DbError, Result};
use crate::mvcc::{SnapshotManager, VersionManager};
use crate::storage::Pager;
use crate::transaction::{IsolationLevel, Txn, TxnManager};
use crate::wal::{Wal, WalConfig, WalStats};

/// Open options; everything but `path` has a default.
#[derive(Debug, Clone)]
pub struct Options {
    /// Directory for the data file, WAL and catalog.
    pub path: PathBuf,
    /// Page cache capacity in pages.
    pub buffer_pool_size: usize,
    /// WAL directory; defaults to `<path>/wal`.
    pub wal_path: Option<PathBuf>,
    /// Catalog file; defaults to `<path>/system_catalog.json`.
    pub catalog_path: Option<PathBuf>,
    /// Enables AES-256-GCM page encryption when set.
    pub encryption_key: Option<[u8; 32]>,
    /// Upper bound on the group-commit barrier wait.
    pub group_commit_timeout: Option<Duration>,
}

impl Options {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            buffer_pool_size: 1000,
            wal_path: None,
            catalog_path: None,
            encryption_key: None,
            group_commit_timeout: None,
        }
    }

    pub fn with_buffer_pool_size(mut self, pages: usize) -> Self {
        self.buffer_pool_size = pages;
        self
    }

    pub fn with_encryption_key(mut self, key: [u8; 32]) -> Self {
        self.encryption_key = Some(key);
        self
    }

    pub fn with_wal_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.wal_path = Some(path.into());
        self
    }

    pub fn with_catalog_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.catalog_path = Some(path.into());
        self
    }

    pub fn with_group_commit_timeout(mut self, timeout: Duration) -> Self {
        self.group_commit_timeout = Some(timeout);
        self
    }

    fn wal_dir(&self) -> PathBuf {
        self.wal_path
            .clone()
            .unwrap_or_else(|| self.path.join("wal"))
    }

    fn catalog_file(&self) -> PathBuf {
        self.catalog_path
            .clone()
            .unwrap_or_else(|| self.path.join("system_catalog.json"))
    }
}

struct DbInner {
    pool: Arc<BufferPool>,
    wal: Arc<Wal>,
    txns: Arc<TxnManager>,
    catalog: Arc<Catalog>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    closed: AtomicBool,
}

/// An open database instance.
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Open (or create) the database at `options.path`, reattaching
    /// cataloged collections and replaying the WAL.
    pub fn open(options: Options) -> Result<Database> {
        std::fs::create_dir_all(&options.path)?;

        let pager = Arc::new(Pager::open(
            &options.path.join("data.db"),
            options.encryption_key.as_ref(),
        )?);
        let pool = Arc::new(BufferPool::new(Arc::clone(&pager), options.buffer_pool_size));
        let wal = Arc::new(Wal::open(
            &options.wal_dir(),
            WalConfig {
                commit_timeout: options.group_commit_timeout,
                ..WalConfig::default()
            },
        )?);
        let versions = Arc::new(VersionManager::new());
        let snapshots = Arc::new(SnapshotManager::new());
        let txns = Arc::new(TxnManager::new(
            Arc::clone(&wal),
            Arc::clone(&versions),
            Arc::clone(&snapshots),
        ));
        let catalog = Arc::new(Catalog::open(&options.catalog_file())?);

        // Reattach every cataloged collection from its persisted roots.
        let mut collections = HashMap::new();
        for (name, meta) in catalog.snapshot().collections {
            let collection = Collection::attach(
                &name,
                Arc::clone(&txns),
                Arc::clone(&pool),
                Arc::clone(&catalog),
                &meta.indexes,
            )?;
            collections.insert(name, Arc::new(collection));
        }

        // Replay committed transactions: publish versions to MVCC, then
        // reconcile the trees with what the log says actually committed.
        let outcome = wal.recover()?;
        snapshots.restore(
            outcome.committed.iter().map(|t| t.txn_id),
            outcome.max_ts,
        );
        txns.seed_txn_id(outcome.max_txn_id);
        let replayed = outcome.committed.len();
        for recovered in outcome.committed {
            // Collapse to the final value per key; earlier writes in the
            // same transaction were overwritten before commit.
            let mut last: HashMap<Vec<u8>, Option<Vec<u8>>> = HashMap::new();
            let mut order: Vec<Vec<u8>> = Vec::new();
            for (key, value) in recovered.writes {
                if !last.contains_key(&key) {
                    order.push(key.clone());
                }
                last.insert(key, value);
            }
            for key in order {
                let value = last.remove(&key).unwrap_or(None);
                versions.put_version(&key, recovered.txn_id, recovered.commit_ts, value.clone());

                let Ok(key_str) = std::str::from_utf8(&key) else {
                    warn!("skipping replay of non-utf8 key");
                    continue;
                };
                let Some((name, id)) = key_str.split_once(':') else {
                    continue;
                };
                if let Some(collection) = collections.get(name) {
                    collection.replay_write(id, value.as_deref())?;
                }
            }
        }
        if replayed > 0 {
            info!(transactions = replayed, "wal replay complete");
        }

        Ok(Database {
            inner: Arc::new(DbInner {
                pool,
                wal,
                txns,
                catalog,
                collections: RwLock::new(collections),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Flush everything and shut the instance down. Idempotent; every
    /// operation afterwards fails with `Closed`.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.txns.close();
        self.inner.pool.flush_all()?;
        self.inner.wal.close()?;
        self.inner.pool.pager().close()?;
        info!("database closed");
        Ok(())
    }

    pub fn create_collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.ensure_open()?;
        if name.is_empty() || name.contains(':') {
            return Err(DbError::InvalidArgument(format!(
                "invalid collection name {:?}",
                name
            )));
        }
        let mut collections = self.inner.collections.write();
        if collections.contains_key(name) {
            return Err(DbError::AlreadyExists(format!("collection {}", name)));
        }
        let collection = Arc::new(Collection::create(
            name,
            Arc::clone(&self.inner.txns),
            Arc::clone(&self.inner.pool),
            Arc::clone(&self.inner.catalog),
        )?);
        collections.insert(name.to_string(), Arc::clone(&collection));
        Ok(collection)
    }

    pub fn get_collection(&self, name: &str) -> Result<Arc<Collection>> {
        self.ensure_open()?;
        self.inner
            .collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("collection {}", name)))
    }

    pub fn drop_collection(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        let mut collections = self.inner.collections.write();
        if collections.remove(name).is_none() {
            return Err(DbError::NotFound(format!("collection {}", name)));
        }
        // Pages of the dropped trees are not reclaimed; allocation is
        // append-only.
        self.inner.catalog.remove_collection(name)
    }

    pub fn list_collections(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut names: Vec<String> = self.inner.collections.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn begin_transaction(&self, level: IsolationLevel) -> Result<Txn> {
        self.ensure_open()?;
        self.inner.txns.begin(level)
    }

    pub fn commit_transaction(&self, txn: &Txn) -> Result<()> {
        self.inner.txns.commit(txn)
    }

    pub fn rollback_transaction(&self, txn: &Txn) -> Result<()> {
        self.inner.txns.rollback(txn)
    }

    /// Flush counters, used by the group-commit property tests.
    pub fn wal_stats(&self) -> WalStats {
        self.inner.wal.stats()
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.inner.pool.stats()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DbError::Closed);
        }
        Ok(())
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                warn!(error = %e, "close on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::Document;
    use serde_json::json;
    use tempfile::tempdir;

    fn doc(value: serde_json::Value) -> Document {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn create_get_drop_list() {
        let dir = tempdir().unwrap();
        let db = Database::open(Options::new(dir.path())).unwrap();

        db.create_collection("users").unwrap();
        db.create_collection("orders").unwrap();
        assert!(matches!(
            db.create_collection("users"),
            Err(DbError::AlreadyExists(_))
        ));
        assert_eq!(db.list_collections().unwrap(), vec!["orders", "users"]);

        db.drop_collection("orders").unwrap();
        assert!(matches!(
            db.get_collection("orders"),
            Err(DbError::NotFound(_))
        ));
        db.close().unwrap();
    }

    #[test]
    fn invalid_collection_names_rejected() {
        let dir = tempdir().unwrap();
        let db = Database::open(Options::new(dir.path())).unwrap();
        assert!(matches!(
            db.create_collection(""),
            Err(DbError::InvalidArgument(_))
        ));
        assert!(matches!(
            db.create_collection("a:b"),
            Err(DbError::InvalidArgument(_))
        ));
        db.close().unwrap();
    }

    #[test]
    fn closed_database_rejects_everything() {
        let dir = tempdir().unwrap();
        let db = Database::open(Options::new(dir.path())).unwrap();
        db.close().unwrap();
        assert!(matches!(db.create_collection("x"), Err(DbError::Closed)));
        assert!(matches!(db.list_collections(), Err(DbError::Closed)));
        assert!(matches!(
            db.begin_transaction(IsolationLevel::ReadCommitted),
            Err(DbError::Closed)
        ));
        // Close is idempotent.
        db.close().unwrap();
    }

    #[test]
    fn documents_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let db = Database::open(Options::new(dir.path())).unwrap();
            let users = db.create_collection("users").unwrap();
            let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
            users
                .insert(&txn, doc(json!({"_id": "u1", "name": "Alice", "age": 30})))
                .unwrap();
            db.commit_transaction(&txn).unwrap();
            db.close().unwrap();
        }

        let db = Database::open(Options::new(dir.path())).unwrap();
        let users = db.get_collection("users").unwrap();
        let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        let found = users.find_by_id(&txn, "u1").unwrap().unwrap();
        assert_eq!(found["name"], json!("Alice"));
        db.commit_transaction(&txn).unwrap();
        db.close().unwrap();
    }

    #[test]
    fn encrypted_database_round_trip() {
        let dir = tempdir().unwrap();
        let key = [42u8; 32];
        {
            let db =
                Database::open(Options::new(dir.path()).with_encryption_key(key)).unwrap();
            let users = db.create_collection("users").unwrap();
            let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
            users
                .insert(&txn, doc(json!({"_id": "u1", "secret": "hunter2"})))
                .unwrap();
            db.commit_transaction(&txn).unwrap();
            db.close().unwrap();
        }

        let db = Database::open(Options::new(dir.path()).with_encryption_key(key)).unwrap();
        let users = db.get_collection("users").unwrap();
        let txn = db.begin_transaction(IsolationLevel::ReadCommitted).unwrap();
        assert_eq!(
            users.find_by_id(&txn, "u1").unwrap().unwrap()["secret"],
            json!("hunter2")
        );
        db.commit_transaction(&txn).unwrap();
        db.close().unwrap();
    }
}
