// # System catalog
//
// Human-readable JSON file holding, per collection, the map of indexed
// fields to their B+Tree root pages, plus optional schema / rules strings
// the engine stores but does not interpret, and pattern-based group-index
// entries. The catalog is the authoritative record of tree roots across
// restarts: every root-change event raised by a tree lands here and is
// fsynced before the mutation that caused it returns to the caller.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::common::PageId;
use crate::error::{DbError, Result};

/// Per-collection metadata. `schema` and `rules` belong to external
/// collaborators (validators, rules engines) and are carried verbatim.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionMeta {
    pub indexes: BTreeMap<String, PageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rules: BTreeMap<String, String>,
}

/// A pattern-scoped index entry applying to every collection whose name
/// matches `pattern`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupIndexEntry {
    pub pattern: String,
    pub field: String,
    pub root_page_id: PageId,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogData {
    pub collections: BTreeMap<String, CollectionMeta>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_indexes: Vec<GroupIndexEntry>,
}

/// Durable collection/index metadata.
pub struct Catalog {
    path: PathBuf,
    state: Mutex<CatalogData>,
}

impl Catalog {
    /// Load the catalog file, or start empty when none exists yet.
    pub fn open(path: &Path) -> Result<Self> {
        let data = match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| DbError::CorruptPage(format!("unreadable catalog: {}", e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogData::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(data),
        })
    }

    pub fn snapshot(&self) -> CatalogData {
        self.state.lock().clone()
    }

    pub fn collection(&self, name: &str) -> Option<CollectionMeta> {
        self.state.lock().collections.get(name).cloned()
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.state.lock().collections.keys().cloned().collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().collections.contains_key(name)
    }

    /// Replace a collection's index map, preserving schema and rules.
    pub fn update_collection(
        &self,
        name: &str,
        indexes: BTreeMap<String, PageId>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state
            .collections
            .entry(name.to_string())
            .or_default()
            .indexes = indexes;
        self.persist(&state)
    }

    /// Incremental update driven by a tree's root-change event.
    pub fn set_index_root(&self, name: &str, field: &str, root: PageId) -> Result<()> {
        let mut state = self.state.lock();
        state
            .collections
            .entry(name.to_string())
            .or_default()
            .indexes
            .insert(field.to_string(), root);
        debug!(collection = name, field, root, "catalog root updated");
        self.persist(&state)
    }

    pub fn remove_collection(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.collections.remove(name).is_none() {
            return Err(DbError::NotFound(format!("collection {}", name)));
        }
        self.persist(&state)
    }

    /// Insert or refresh a group-index entry keyed by (pattern, field).
    pub fn upsert_group_index(&self, pattern: &str, field: &str, root: PageId) -> Result<()> {
        let mut state = self.state.lock();
        match state
            .group_indexes
            .iter_mut()
            .find(|g| g.pattern == pattern && g.field == field)
        {
            Some(entry) => entry.root_page_id = root,
            None => state.group_indexes.push(GroupIndexEntry {
                pattern: pattern.to_string(),
                field: field.to_string(),
                root_page_id: root,
            }),
        }
        self.persist(&state)
    }

    /// Serialize and fsync. Called with the state mutex held so writers
    /// cannot interleave partial files.
    fn persist(&self, data: &CatalogData) -> Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        let bytes = serde_json::to_vec_pretty(data)
            .map_err(|e| DbError::InvalidArgument(format!("unencodable catalog: {}", e)))?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        Ok(())
    }
}
