// # B+Tree
//
// Ordered byte-key map over buffer-pool pages. Leaves are doubly linked for
// range scans; internal nodes carry a leftmost child plus separators. Leaf
// splits copy the right sibling's first key up; internal splits move the
// median up. Deletion is lazy: underflowing nodes are never merged or
// rebalanced, and empty leaves stay linked.
//
// A root split allocates a new root page and fires the root-change callback
// before the mutation returns; that callback is the only durability hook the
// catalog needs.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::{BufferPool, PinnedPage};
use crate::common::{PageId, INVALID_PAGE_ID};
use crate::error::{DbError, Result};
use crate::index::node::{InternalNode, LeafNode, NODE_CAPACITY, SPLIT_MARGIN};
use crate::storage::PageType;

/// Invoked with the new root page id whenever a root split replaces the root.
pub type RootChangeCallback = Box<dyn Fn(PageId) + Send + Sync>;

struct TreeState {
    root: PageId,
}

/// A single ordered index persisted in the page file.
pub struct BPlusTree {
    pool: Arc<BufferPool>,
    state: RwLock<TreeState>,
    on_root_change: RwLock<Option<RootChangeCallback>>,
}

impl BPlusTree {
    /// Create an empty tree backed by a fresh leaf root. The root page is
    /// made durable immediately so a catalog entry can safely reference it.
    pub fn new(pool: Arc<BufferPool>) -> Result<Self> {
        let root = pool.new_page(PageType::Leaf)?;
        root.mark_dirty();
        let root_id = root.id();
        drop(root);
        pool.flush(root_id)?;
        pool.pager().sync()?;
        Ok(Self {
            pool,
            state: RwLock::new(TreeState { root: root_id }),
            on_root_change: RwLock::new(None),
        })
    }

    /// Reattach a tree whose root was persisted in the catalog.
    pub fn load(pool: Arc<BufferPool>, root_id: PageId) -> Self {
        Self {
            pool,
            state: RwLock::new(TreeState { root: root_id }),
            on_root_change: RwLock::new(None),
        }
    }

    pub fn root_id(&self) -> PageId {
        self.state.read().root
    }

    pub fn set_on_root_change(&self, callback: RootChangeCallback) {
        *self.on_root_change.write() = Some(callback);
    }

    /// Insert or overwrite. Splits propagate upward as needed.
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        if 4 + key.len() + value.len() + SPLIT_MARGIN > NODE_CAPACITY {
            return Err(DbError::InvalidArgument(format!(
                "entry of {} bytes cannot fit in a single leaf",
                key.len() + value.len()
            )));
        }

        let mut state = self.state.write();
        let (leaf_id, path) = self.descend(state.root, key)?;

        let pinned = self.pool.fetch(leaf_id)?;
        let mut node = LeafNode::decode(&pinned.read())?;
        match node
            .entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
        {
            Ok(i) => node.entries[i].1 = value.to_vec(),
            Err(i) => node.entries.insert(i, (key.to_vec(), value.to_vec())),
        }

        if !node.overflows() {
            node.encode(&mut pinned.write());
            pinned.mark_dirty();
            return Ok(());
        }

        let carry = self.split_leaf(&pinned, node)?;
        drop(pinned);
        self.propagate_split(&mut state, path, carry)
    }

    /// Exact-match lookup.
    pub fn search(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let state = self.state.read();
        let (leaf_id, _) = self.descend(state.root, key)?;
        let pinned = self.pool.fetch(leaf_id)?;
        let node = LeafNode::decode(&pinned.read())?;
        Ok(node
            .entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
            .ok()
            .map(|i| node.entries[i].1.clone()))
    }

    /// Remove a key. Underflow is tolerated; absent keys are an error.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let state = self.state.write();
        let (leaf_id, _) = self.descend(state.root, key)?;
        let pinned = self.pool.fetch(leaf_id)?;
        let mut node = LeafNode::decode(&pinned.read())?;
        match node
            .entries
            .binary_search_by(|(k, _)| k.as_slice().cmp(key))
        {
            Ok(i) => {
                node.entries.remove(i);
                node.encode(&mut pinned.write());
                pinned.mark_dirty();
                Ok(())
            }
            Err(_) => Err(DbError::NotFound(format!(
                "key {:?} not present in index",
                String::from_utf8_lossy(key)
            ))),
        }
    }

    /// Collect every entry with key in `[start, end]`, in order. At most two
    /// leaves are pinned while walking the sibling chain; the tree-level read
    /// latch is held for the whole scan so splits cannot relink leaves
    /// underneath it.
    pub fn range_scan(&self, start: &[u8], end: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let state = self.state.read();
        let (leaf_id, _) = self.descend(state.root, start)?;
        self.walk_leaves(leaf_id, start, Some(end))
    }

    /// Full ordered scan from the leftmost leaf.
    pub fn scan_all(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let state = self.state.read();
        let (leaf_id, _) = self.descend(state.root, &[])?;
        self.walk_leaves(leaf_id, &[], None)
    }

    fn walk_leaves(
        &self,
        first_leaf: PageId,
        start: &[u8],
        end: Option<&[u8]>,
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out = Vec::new();
        let mut current = self.pool.fetch(first_leaf)?;
        loop {
            let (entries, next_id) = {
                let page = current.read();
                let node = LeafNode::decode(&page)?;
                (node.entries, page.next_page_id())
            };
            for (key, value) in entries {
                if let Some(end) = end {
                    if key.as_slice() > end {
                        return Ok(out);
                    }
                }
                if key.as_slice() >= start {
                    out.push((key, value));
                }
            }
            if next_id == INVALID_PAGE_ID {
                return Ok(out);
            }
            let next = self.pool.fetch(next_id)?;
            current = next;
        }
    }

    /// Walk from `root` down to the leaf responsible for `key`, recording
    /// the internal path for split propagation. Each internal page is pinned
    /// only while its separators are read.
    fn descend(&self, root: PageId, key: &[u8]) -> Result<(PageId, Vec<PageId>)> {
        let mut path = Vec::new();
        let mut current = root;
        loop {
            let pinned = self.pool.fetch(current)?;
            let page = pinned.read();
            match page.page_type() {
                PageType::Leaf => return Ok((current, path)),
                PageType::Internal => {
                    let node = InternalNode::decode(&page)?;
                    drop(page);
                    path.push(current);
                    current = node.child_for(key);
                }
                other => {
                    return Err(DbError::CorruptPage(format!(
                        "page {} has non-index type {:?} inside tree",
                        current, other
                    )))
                }
            }
        }
    }

    /// Split an overflowing leaf; returns the separator to push upward.
    /// Page content guards are never held across pool calls.
    fn split_leaf(&self, left: &PinnedPage, mut node: LeafNode) -> Result<(Vec<u8>, PageId)> {
        let mid = node.entries.len() / 2;
        let right_entries = node.entries.split_off(mid);
        let separator = right_entries[0].0.clone();

        let right = self.pool.new_page(PageType::Leaf)?;
        let right_id = right.id();
        let old_next = left.read().next_page_id();

        {
            let mut right_page = right.write();
            LeafNode {
                entries: right_entries,
            }
            .encode(&mut right_page);
            right_page.set_prev_page_id(left.id());
            right_page.set_next_page_id(old_next);
        }
        right.mark_dirty();

        {
            let mut left_page = left.write();
            node.encode(&mut left_page);
            left_page.set_next_page_id(right_id);
        }
        left.mark_dirty();

        if old_next != INVALID_PAGE_ID {
            let old_sibling = self.pool.fetch(old_next)?;
            old_sibling.write().set_prev_page_id(right_id);
            old_sibling.mark_dirty();
        }

        Ok((separator, right_id))
    }

    /// Push a split separator up the recorded path, splitting internal nodes
    /// as needed; allocates a new root when the split outgrows the path.
    fn propagate_split(
        &self,
        state: &mut TreeState,
        mut path: Vec<PageId>,
        mut carry: (Vec<u8>, PageId),
    ) -> Result<()> {
        while let Some(parent_id) = path.pop() {
            let pinned = self.pool.fetch(parent_id)?;
            let mut node = InternalNode::decode(&pinned.read())?;
            let (sep, child) = carry;
            let pos = node.entries.partition_point(|(k, _)| k.as_slice() < sep.as_slice());
            node.entries.insert(pos, (sep, child));

            if !node.overflows() {
                node.encode(&mut pinned.write());
                pinned.mark_dirty();
                return Ok(());
            }

            // Internal split: the median key moves up, and its child pointer
            // becomes the leftmost child of the new right node.
            let mid = node.entries.len() / 2;
            let mut right_entries = node.entries.split_off(mid);
            let (median_key, median_child) = right_entries.remove(0);

            let right = self.pool.new_page(PageType::Internal)?;
            let right_id = right.id();
            InternalNode {
                leftmost: median_child,
                entries: right_entries,
            }
            .encode(&mut right.write());
            right.mark_dirty();

            node.encode(&mut pinned.write());
            pinned.mark_dirty();

            carry = (median_key, right_id);
        }

        // The split outgrew the root: allocate a new one.
        let (sep, right_id) = carry;
        let new_root = self.pool.new_page(PageType::Internal)?;
        let new_root_id = new_root.id();
        InternalNode {
            leftmost: state.root,
            entries: vec![(sep, right_id)],
        }
        .encode(&mut new_root.write());
        new_root.mark_dirty();
        drop(new_root);

        state.root = new_root_id;
        // The catalog persists the new root as soon as the callback runs;
        // every page the new root can reach must be durable first, or a
        // crash would leave the catalog pointing into zeroed pages.
        self.pool.flush_all()?;
        if let Some(callback) = self.on_root_change.read().as_ref() {
            callback(new_root_id);
        }
        Ok(())
    }
}
