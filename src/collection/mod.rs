// # Collections
//
// Maps named groups of JSON documents onto the storage core. Every
// collection owns a primary tree keyed `name ":" doc_id` holding the
// serialized document, plus one tree per secondary-indexed field keyed
// `value 0x00 doc_id`. Mutations are staged through the transaction
// manager (which gives them WAL durability and MVCC visibility) and applied
// to the trees inline; readers always resolve documents through the
// transaction, so uncommitted or stale tree entries are filtered out by
// snapshot visibility plus a re-projection check.
//
// Missing secondary indexes are created lazily inside the query path and
// backfilled from the primary tree, matching the engine's read-mostly
// usage.

pub mod patch;
pub mod query;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, warn};

use crate::buffer::BufferPool;
use crate::catalog::Catalog;
use crate::common::PageId;
use crate::document::{
    composite_key, composite_range, decode_document, document_id, encode_document,
    generate_document_id, primary_key, project_field, scalar_to_string, Document, ID_FIELD,
};
use crate::error::{DbError, Result};
use crate::index::BPlusTree;
use crate::mvcc::Visibility;
use crate::transaction::{Txn, TxnManager};

use patch::apply_patch;
use query::{apply_options, FindOptions, QueryExpr};

/// A named set of documents with a primary index and optional secondary
/// indexes.
pub struct Collection {
    name: String,
    txns: Arc<TxnManager>,
    pool: Arc<BufferPool>,
    catalog: Arc<Catalog>,
    primary: Arc<BPlusTree>,
    indexes: RwLock<HashMap<String, Arc<BPlusTree>>>,
}

impl Collection {
    /// Create a brand-new collection with its primary tree, and persist the
    /// root in the catalog.
    pub(crate) fn create(
        name: &str,
        txns: Arc<TxnManager>,
        pool: Arc<BufferPool>,
        catalog: Arc<Catalog>,
    ) -> Result<Self> {
        let primary = Arc::new(BPlusTree::new(Arc::clone(&pool))?);
        attach_listener(&primary, &catalog, name, ID_FIELD);
        catalog.set_index_root(name, ID_FIELD, primary.root_id())?;

        let mut indexes = HashMap::new();
        indexes.insert(ID_FIELD.to_string(), Arc::clone(&primary));
        Ok(Self {
            name: name.to_string(),
            txns,
            pool,
            catalog,
            primary,
            indexes: RwLock::new(indexes),
        })
    }

    /// Reattach a collection from its cataloged roots after restart.
    pub(crate) fn attach(
        name: &str,
        txns: Arc<TxnManager>,
        pool: Arc<BufferPool>,
        catalog: Arc<Catalog>,
        roots: &std::collections::BTreeMap<String, PageId>,
    ) -> Result<Self> {
        let mut indexes = HashMap::new();
        let mut primary = None;
        for (field, &root) in roots {
            let tree = Arc::new(BPlusTree::load(Arc::clone(&pool), root));
            attach_listener(&tree, &catalog, name, field);
            if field == ID_FIELD {
                primary = Some(Arc::clone(&tree));
            }
            indexes.insert(field.clone(), tree);
        }
        let primary = primary.ok_or_else(|| {
            DbError::CorruptPage(format!("collection {} has no primary index root", name))
        })?;
        Ok(Self {
            name: name.to_string(),
            txns,
            pool,
            catalog,
            primary,
            indexes: RwLock::new(indexes),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert a document, generating a monotonic id when `_id` is absent.
    /// Inserting over an existing id behaves like an update.
    pub fn insert(&self, txn: &Txn, mut doc: Document) -> Result<String> {
        let id = match document_id(&doc)? {
            Some(id) => id,
            None => {
                let id = generate_document_id();
                doc.insert(ID_FIELD.to_string(), Value::String(id.clone()));
                id
            }
        };

        let old = self.visible_doc(txn, &id)?;
        let bytes = encode_document(&doc)?;
        let key = primary_key(&self.name, &id);
        self.txns.write(txn, &key, Some(bytes.clone()))?;
        self.primary.insert(&key, &bytes)?;
        self.maintain_secondaries(old.as_ref(), Some(&doc), &id)?;
        Ok(id)
    }

    /// Replace a document wholesale, diffing secondary index entries field
    /// by field.
    pub fn update(&self, txn: &Txn, id: &str, mut doc: Document) -> Result<()> {
        match document_id(&doc)? {
            Some(existing) if existing != id => {
                return Err(DbError::InvalidArgument(format!(
                    "document _id {} does not match update target {}",
                    existing, id
                )));
            }
            Some(_) => {}
            None => {
                doc.insert(ID_FIELD.to_string(), Value::String(id.to_string()));
            }
        }

        let old = self
            .visible_doc(txn, id)?
            .ok_or_else(|| DbError::NotFound(format!("document {}:{}", self.name, id)))?;

        let bytes = encode_document(&doc)?;
        let key = primary_key(&self.name, id);
        self.txns.write(txn, &key, Some(bytes.clone()))?;
        self.primary.insert(&key, &bytes)?;
        self.maintain_secondaries(Some(&old), Some(&doc), id)
    }

    /// Delete a document: tombstone in the write set, primary entry and all
    /// secondary composite keys removed.
    pub fn delete(&self, txn: &Txn, id: &str) -> Result<()> {
        let old = self
            .visible_doc(txn, id)?
            .ok_or_else(|| DbError::NotFound(format!("document {}:{}", self.name, id)))?;

        self.maintain_secondaries(Some(&old), None, id)?;
        let key = primary_key(&self.name, id);
        self.txns.write(txn, &key, None)?;
        tolerate_missing(self.primary.delete(&key))?;
        Ok(())
    }

    /// Resolve by primary key: write set first, then a snapshot-visible
    /// version.
    pub fn find_by_id(&self, txn: &Txn, id: &str) -> Result<Option<Document>> {
        self.visible_doc(txn, id)
    }

    /// Equality lookup on one field through its secondary index, creating
    /// and backfilling the index on first use.
    pub fn find(&self, txn: &Txn, field: &str, value: &Value) -> Result<Vec<Document>> {
        if field == ID_FIELD {
            let Value::String(id) = value else {
                return Err(DbError::InvalidArgument(format!(
                    "_id lookup requires a string, got {}",
                    value
                )));
            };
            return Ok(self.find_by_id(txn, id)?.into_iter().collect());
        }

        let value_string = scalar_to_string(value).ok_or_else(|| {
            DbError::InvalidArgument(format!("cannot index non-scalar value {}", value))
        })?;
        self.ensure_index(field)?;
        let tree = self
            .indexes
            .read()
            .get(field)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("index on {}", field)))?;

        let (start, end) = composite_range(&value_string);
        let mut out = Vec::new();
        for (_, id_bytes) in tree.range_scan(&start, &end)? {
            let id = String::from_utf8(id_bytes).map_err(|_| {
                DbError::CorruptPage(format!("non-utf8 document id in index on {}", field))
            })?;
            if let Some(doc) = self.find_by_id(txn, &id)? {
                // The index entry may be stale or from an uncommitted
                // writer; only the visible document's own value counts.
                if project_field(&doc, field).and_then(scalar_to_string).as_deref()
                    == Some(value_string.as_str())
                {
                    out.push(doc);
                }
            }
        }
        Ok(out)
    }

    /// Evaluate a query map. A single top-level equality is served by the
    /// secondary index; everything else table-scans into the filter, then
    /// through sort/skip/limit.
    pub fn find_query(
        &self,
        txn: &Txn,
        query: &Value,
        opts: &FindOptions,
    ) -> Result<Vec<Document>> {
        let expr = QueryExpr::parse(query)?;
        let matches = match expr.as_single_equality() {
            Some((field, value)) => self.find(txn, field, value)?,
            None => self
                .scan_visible(txn)?
                .into_iter()
                .filter(|doc| expr.matches(doc))
                .collect(),
        };
        Ok(apply_options(matches, opts))
    }

    /// Partial update with dotted paths and `$unset`; the patched document
    /// then goes through the full update path.
    pub fn patch(&self, txn: &Txn, id: &str, patch: &Document) -> Result<Document> {
        let mut doc = self
            .visible_doc(txn, id)?
            .ok_or_else(|| DbError::NotFound(format!("document {}:{}", self.name, id)))?;
        apply_patch(&mut doc, patch);
        self.update(txn, id, doc.clone())?;
        Ok(doc)
    }

    pub fn insert_batch(&self, txn: &Txn, docs: Vec<Document>) -> Result<Vec<String>> {
        docs.into_iter().map(|doc| self.insert(txn, doc)).collect()
    }

    pub fn update_batch(&self, txn: &Txn, updates: Vec<(String, Document)>) -> Result<()> {
        for (id, doc) in updates {
            self.update(txn, &id, doc)?;
        }
        Ok(())
    }

    pub fn delete_batch(&self, txn: &Txn, ids: Vec<String>) -> Result<()> {
        for id in ids {
            self.delete(txn, &id)?;
        }
        Ok(())
    }

    /// Create and backfill a secondary index if it does not exist yet, and
    /// persist its root in the catalog.
    pub fn ensure_index(&self, field: &str) -> Result<()> {
        if field == ID_FIELD {
            return Ok(());
        }
        let mut indexes = self.indexes.write();
        if indexes.contains_key(field) {
            return Ok(());
        }
        debug!(collection = %self.name, field, "creating secondary index");

        let tree = Arc::new(BPlusTree::new(Arc::clone(&self.pool))?);
        for (_, bytes) in self.primary.scan_all()? {
            let doc = decode_document(&bytes)?;
            let Some(id) = document_id(&doc)? else {
                continue;
            };
            if let Some(value_string) = project_field(&doc, field).and_then(scalar_to_string) {
                tree.insert(&composite_key(&value_string, &id), id.as_bytes())?;
            }
        }

        // Backfilled pages must hit disk before the catalog references the
        // tree, or a crash would strand the root over zeroed pages.
        self.pool.flush_all()?;
        attach_listener(&tree, &self.catalog, &self.name, field);
        self.catalog
            .set_index_root(&self.name, field, tree.root_id())?;
        indexes.insert(field.to_string(), Arc::clone(&tree));
        Ok(())
    }

    pub fn indexed_fields(&self) -> Vec<String> {
        self.indexes.read().keys().cloned().collect()
    }

    /// Re-apply one committed write during WAL replay. The tree's current
    /// entry stands in for the pre-crash document when diffing secondary
    /// keys, so index state converges with the log regardless of which
    /// pages reached disk before the crash.
    pub(crate) fn replay_write(&self, id: &str, value: Option<&[u8]>) -> Result<()> {
        let key = primary_key(&self.name, id);
        let old = match self.primary.search(&key)? {
            Some(bytes) => Some(decode_document(&bytes)?),
            None => None,
        };
        match value {
            Some(bytes) => {
                let new = decode_document(bytes)?;
                self.primary.insert(&key, bytes)?;
                self.maintain_secondaries(old.as_ref(), Some(&new), id)
            }
            None => {
                tolerate_missing(self.primary.delete(&key))?;
                self.maintain_secondaries(old.as_ref(), None, id)
            }
        }
    }

    /// All documents visible to the transaction, in primary-key order.
    fn scan_visible(&self, txn: &Txn) -> Result<Vec<Document>> {
        let mut out = Vec::new();
        for (key, _) in self.primary.scan_all()? {
            match self.txns.read(txn, &key)? {
                Visibility::Payload(bytes) => out.push(decode_document(&bytes)?),
                Visibility::Deleted | Visibility::Missing => {}
            }
        }
        Ok(out)
    }

    fn visible_doc(&self, txn: &Txn, id: &str) -> Result<Option<Document>> {
        let key = primary_key(&self.name, id);
        match self.txns.read(txn, &key)? {
            Visibility::Payload(bytes) => Ok(Some(decode_document(&bytes)?)),
            Visibility::Deleted | Visibility::Missing => Ok(None),
        }
    }

    /// Diff old vs. new field values into secondary index mutations: delete
    /// the stale composite key, insert the new one, leave unchanged fields
    /// alone.
    fn maintain_secondaries(
        &self,
        old: Option<&Document>,
        new: Option<&Document>,
        id: &str,
    ) -> Result<()> {
        let indexes = self.indexes.read();
        for (field, tree) in indexes.iter() {
            if field == ID_FIELD {
                continue;
            }
            let old_value = old
                .and_then(|d| project_field(d, field))
                .and_then(scalar_to_string);
            let new_value = new
                .and_then(|d| project_field(d, field))
                .and_then(scalar_to_string);
            if old_value == new_value {
                continue;
            }
            if let Some(old_value) = old_value {
                tolerate_missing(tree.delete(&composite_key(&old_value, id)))?;
            }
            if let Some(new_value) = new_value {
                tree.insert(&composite_key(&new_value, id), id.as_bytes())?;
            }
        }
        Ok(())
    }
}

fn attach_listener(tree: &BPlusTree, catalog: &Arc<Catalog>, name: &str, field: &str) {
    let catalog = Arc::clone(catalog);
    let name = name.to_string();
    let field = field.to_string();
    tree.set_on_root_change(Box::new(move |root| {
        if let Err(e) = catalog.set_index_root(&name, &field, root) {
            warn!(collection = %name, field = %field, error = %e, "failed to persist new root");
        }
    }));
}

/// Index cleanup may race a partially-maintained tree; a missing entry is
/// not an error there.
fn tolerate_missing(result: Result<()>) -> Result<()> {
    match result {
        Err(DbError::NotFound(_)) => Ok(()),
        other => other,
    }
}
