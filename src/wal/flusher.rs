// # Shared group-commit flusher
//
// One flusher thread serves every open database in the process. It wakes
// when any registered log has pending frames, swaps that log's buffer, and
// retires the whole batch behind a single sequential write and one
// durability barrier. Commits that pile up while a barrier is in flight are
// absorbed by the next batch, which is where the group-commit scaling comes
// from.
//
// The lifecycle is explicit: the first `FlusherHandle::acquire` spawns the
// thread, the last handle dropped shuts it down and joins it. Tests that
// open several databases share the thread like production does.

use std::sync::Arc;
use std::thread::JoinHandle;

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info};

use crate::error::Result;
use crate::wal::WalShared;

struct RegistryInner {
    wals: Vec<Arc<WalShared>>,
    refcount: usize,
    dirty: bool,
    shutdown: bool,
    thread: Option<JoinHandle<()>>,
}

struct FlusherRegistry {
    inner: Mutex<RegistryInner>,
    work: Condvar,
}

static REGISTRY: Lazy<Arc<FlusherRegistry>> = Lazy::new(|| {
    Arc::new(FlusherRegistry {
        inner: Mutex::new(RegistryInner {
            wals: Vec::new(),
            refcount: 0,
            dirty: false,
            shutdown: false,
            thread: None,
        }),
        work: Condvar::new(),
    })
});

/// Reference-counted claim on the process-wide flusher.
pub(crate) struct FlusherHandle {
    registry: Arc<FlusherRegistry>,
}

impl FlusherHandle {
    /// Take a claim, spawning the flusher thread on the first one.
    pub(crate) fn acquire() -> Result<Self> {
        let registry = Arc::clone(&REGISTRY);
        let mut inner = registry.inner.lock();
        inner.refcount += 1;
        if inner.thread.is_none() {
            inner.shutdown = false;
            inner.dirty = false;
            let for_thread = Arc::clone(&registry);
            inner.thread = Some(
                std::thread::Builder::new()
                    .name("wal-flusher".into())
                    .spawn(move || flusher_loop(&for_thread))?,
            );
            info!("wal flusher started");
        }
        drop(inner);
        Ok(Self { registry })
    }
}

impl Drop for FlusherHandle {
    fn drop(&mut self) {
        let mut inner = self.registry.inner.lock();
        inner.refcount = inner.refcount.saturating_sub(1);
        if inner.refcount == 0 {
            inner.shutdown = true;
            let thread = inner.thread.take();
            drop(inner);
            self.registry.work.notify_all();
            if let Some(thread) = thread {
                let _ = thread.join();
            }
            info!("wal flusher stopped");
        }
    }
}

/// Make a log visible to the flusher.
pub(crate) fn register_wal(shared: &Arc<WalShared>) {
    REGISTRY.inner.lock().wals.push(Arc::clone(shared));
}

pub(crate) fn deregister_wal(shared: &Arc<WalShared>) {
    REGISTRY
        .inner
        .lock()
        .wals
        .retain(|w| !Arc::ptr_eq(w, shared));
}

/// Signal that some log has pending frames.
pub(crate) fn notify_work() {
    let mut inner = REGISTRY.inner.lock();
    inner.dirty = true;
    REGISTRY.work.notify_one();
}

fn flusher_loop(registry: &Arc<FlusherRegistry>) {
    loop {
        let (wals, shutdown) = {
            let mut inner = registry.inner.lock();
            while !inner.dirty && !inner.shutdown {
                registry.work.wait(&mut inner);
            }
            inner.dirty = false;
            (inner.wals.clone(), inner.shutdown)
        };

        for wal in &wals {
            wal.flush_pending();
        }
        if shutdown {
            debug!("wal flusher draining on shutdown");
            return;
        }
    }
}
