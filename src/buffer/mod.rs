// # Buffer pool: segmented LRU page cache
//
// Two LRU lists split the cache into a probationary segment for new or
// one-touch pages and a protected segment for re-accessed pages. Sequential
// scans churn through probation without displacing the protected working
// set.
//
// Policy:
// - a page fetched from disk or freshly allocated enters probation at MRU;
// - a hit on a probation entry promotes it to protected MRU, demoting the
//   protected LRU tail back to probation MRU on overflow;
// - a hit on a protected entry moves it to protected MRU;
// - eviction tries the probation LRU first, then the protected LRU; when
//   every resident page is pinned the fetch fails with `PoolExhausted`;
// - dirty victims are written through the pager before they leave.
//
// Structural changes (list moves, map mutations) happen under one exclusive
// lock; page contents are guarded by each page's own reader-writer lock.
// Content locks are only held while the page is pinned, which keeps
// eviction's write-back from ever blocking on a content writer.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

use crate::common::PageId;
use crate::error::{DbError, Result};
use crate::storage::{Page, PageType, Pager};

/// Fraction of the pool reserved for the protected segment.
const PROTECTED_SHARE: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Segment {
    Probation,
    Protected,
}

struct Frame {
    page: Arc<RwLock<Page>>,
    pin_count: u32,
    dirty: bool,
    segment: Segment,
}

/// Counters exposed for observability and cache-behavior tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct PoolState {
    frames: HashMap<PageId, Frame>,
    /// Front is LRU, back is MRU.
    probation: VecDeque<PageId>,
    protected: VecDeque<PageId>,
    stats: PoolStats,
}

impl PoolState {
    fn remove_from_list(&mut self, id: PageId, segment: Segment) {
        let list = match segment {
            Segment::Probation => &mut self.probation,
            Segment::Protected => &mut self.protected,
        };
        if let Some(pos) = list.iter().position(|&p| p == id) {
            list.remove(pos);
        }
    }
}

/// In-memory page cache with pinning and dirty tracking.
pub struct BufferPool {
    pager: Arc<Pager>,
    capacity: usize,
    protected_capacity: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    pub fn new(pager: Arc<Pager>, capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let protected_capacity = ((capacity as f64 * PROTECTED_SHARE) as usize).max(1);
        Self {
            pager,
            capacity,
            protected_capacity,
            state: Mutex::new(PoolState {
                frames: HashMap::new(),
                probation: VecDeque::new(),
                protected: VecDeque::new(),
                stats: PoolStats::default(),
            }),
        }
    }

    /// Fetch a page, reading it from disk on a miss. The returned handle
    /// keeps the page pinned until dropped (or until an explicit `unpin`).
    pub fn fetch(self: &Arc<Self>, id: PageId) -> Result<PinnedPage> {
        let mut state = self.state.lock();

        if let Some(frame) = state.frames.get_mut(&id) {
            frame.pin_count += 1;
            let page = Arc::clone(&frame.page);
            let segment = frame.segment;
            self.touch(&mut state, id, segment);
            state.stats.hits += 1;
            return Ok(PinnedPage::new(Arc::clone(self), id, page));
        }

        self.make_room(&mut state)?;
        let page = self.pager.read_page(id)?;
        state.stats.misses += 1;
        let page = Arc::new(RwLock::new(page));
        state.frames.insert(
            id,
            Frame {
                page: Arc::clone(&page),
                pin_count: 1,
                dirty: false,
                segment: Segment::Probation,
            },
        );
        state.probation.push_back(id);
        Ok(PinnedPage::new(Arc::clone(self), id, page))
    }

    /// Allocate a fresh page of the given type. The page exists only in the
    /// cache (dirty) until written back.
    pub fn new_page(self: &Arc<Self>, page_type: PageType) -> Result<PinnedPage> {
        let mut state = self.state.lock();
        self.make_room(&mut state)?;

        let page = self.pager.allocate_typed(page_type)?;
        let id = page.id;
        let page = Arc::new(RwLock::new(page));
        state.frames.insert(
            id,
            Frame {
                page: Arc::clone(&page),
                pin_count: 1,
                dirty: true,
                segment: Segment::Probation,
            },
        );
        state.probation.push_back(id);
        Ok(PinnedPage::new(Arc::clone(self), id, page))
    }

    /// Drop one pin; `dirty` records whether the caller mutated the page.
    pub fn unpin(&self, id: PageId, dirty: bool) {
        let mut state = self.state.lock();
        if let Some(frame) = state.frames.get_mut(&id) {
            debug_assert!(frame.pin_count > 0, "unpin of unpinned page {}", id);
            frame.pin_count = frame.pin_count.saturating_sub(1);
            frame.dirty |= dirty;
        }
    }

    /// Write one page through to the pager if dirty.
    pub fn flush(&self, id: PageId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(frame) = state.frames.get_mut(&id) {
            if frame.dirty {
                self.pager.write_page(&frame.page.read())?;
                frame.dirty = false;
            }
        }
        Ok(())
    }

    /// Write every dirty page through and issue a durability barrier.
    pub fn flush_all(&self) -> Result<()> {
        let mut state = self.state.lock();
        let dirty_ids: Vec<PageId> = state
            .frames
            .iter()
            .filter(|(_, f)| f.dirty)
            .map(|(&id, _)| id)
            .collect();
        for id in dirty_ids {
            if let Some(frame) = state.frames.get_mut(&id) {
                self.pager.write_page(&frame.page.read())?;
                frame.dirty = false;
            }
        }
        drop(state);
        self.pager.sync()
    }

    pub fn stats(&self) -> PoolStats {
        self.state.lock().stats
    }

    /// Number of resident pages; never exceeds the configured capacity.
    pub fn resident(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn pager(&self) -> &Arc<Pager> {
        &self.pager
    }

    /// Promote/refresh an entry on a cache hit.
    fn touch(&self, state: &mut PoolState, id: PageId, segment: Segment) {
        match segment {
            Segment::Probation => {
                state.remove_from_list(id, Segment::Probation);
                state.protected.push_back(id);
                if let Some(frame) = state.frames.get_mut(&id) {
                    frame.segment = Segment::Protected;
                }
                if state.protected.len() > self.protected_capacity {
                    if let Some(demoted) = state.protected.pop_front() {
                        state.probation.push_back(demoted);
                        if let Some(frame) = state.frames.get_mut(&demoted) {
                            frame.segment = Segment::Probation;
                        }
                    }
                }
            }
            Segment::Protected => {
                state.remove_from_list(id, Segment::Protected);
                state.protected.push_back(id);
            }
        }
    }

    /// Evict until a new frame fits, probation LRU first.
    fn make_room(&self, state: &mut PoolState) -> Result<()> {
        while state.frames.len() >= self.capacity {
            self.evict_one(state)?;
        }
        Ok(())
    }

    fn evict_one(&self, state: &mut PoolState) -> Result<()> {
        let victim = Self::pick_unpinned(&state.probation, &state.frames)
            .or_else(|| Self::pick_unpinned(&state.protected, &state.frames))
            .ok_or(DbError::PoolExhausted)?;

        let frame = match state.frames.get(&victim) {
            Some(f) => f,
            None => return Ok(()),
        };
        if frame.dirty {
            self.pager.write_page(&frame.page.read())?;
        }
        let segment = frame.segment;
        state.frames.remove(&victim);
        state.remove_from_list(victim, segment);
        state.stats.evictions += 1;
        debug!(page = victim, "evicted page");
        Ok(())
    }

    fn pick_unpinned(list: &VecDeque<PageId>, frames: &HashMap<PageId, Frame>) -> Option<PageId> {
        list.iter()
            .find(|&&id| frames.get(&id).map(|f| f.pin_count == 0).unwrap_or(false))
            .copied()
    }
}

/// A pinned, shared reference to a cached page. Dropping the handle unpins
/// it, carrying the dirty flag set via [`PinnedPage::mark_dirty`].
pub struct PinnedPage {
    pool: Arc<BufferPool>,
    id: PageId,
    page: Arc<RwLock<Page>>,
    dirty: AtomicBool,
}

impl PinnedPage {
    fn new(pool: Arc<BufferPool>, id: PageId, page: Arc<RwLock<Page>>) -> Self {
        Self {
            pool,
            id,
            page,
            dirty: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write()
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed);
    }
}

impl Drop for PinnedPage {
    fn drop(&mut self) {
        self.pool.unpin(self.id, self.dirty.load(Ordering::Relaxed));
    }
}
