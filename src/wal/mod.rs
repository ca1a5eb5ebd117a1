// # Write-ahead log
//
// Append-only, segmented log under `<path>/wal/`. Writers enqueue frames
// into an in-memory buffer under a short mutex; the shared flusher thread
// (see `flusher`) swaps the buffer and retires it with one write and one
// fsync. Commit records carry a completion channel so the committer can
// block until its frame is durable; `Begin`/`Write`/`Abort` frames ride
// along without waiting.
//
// Recovery scans segments in order and stops at the first frame that fails
// its CRC or is truncated; only transactions whose `Commit` frame survives
// the scan are replayed.

pub mod flusher;
pub mod record;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::common::{Lsn, Timestamp, TxnId};
use crate::error::{DbError, Result};

pub use record::WalRecord;
use record::{decode_frame, encode_frame};

pub(crate) use flusher::FlusherHandle;

const SEGMENT_EXT: &str = "wal";

/// Tuning knobs for the log.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Rotate to a new segment file once the current one exceeds this.
    pub segment_size: u64,
    /// Upper bound on how long a committer waits for the flusher barrier.
    pub commit_timeout: Option<Duration>,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            segment_size: 64 * 1024 * 1024,
            commit_timeout: None,
        }
    }
}

/// Flush counters; the concurrency tests assert group-commit behavior on
/// these.
#[derive(Debug, Clone, Copy, Default)]
pub struct WalStats {
    pub records: u64,
    pub batches: u64,
    pub fsyncs: u64,
    /// Batches that retired more than one waiting commit.
    pub group_commits: u64,
    pub max_batch: u64,
}

type WaiterResult = std::result::Result<Lsn, String>;

struct PendingBuffer {
    bytes: Vec<u8>,
    count: u64,
    last_lsn: Lsn,
    waiters: Vec<Sender<WaiterResult>>,
}

struct SegmentFile {
    file: File,
    index: u64,
    written: u64,
}

/// State shared between appenders and the flusher thread.
pub(crate) struct WalShared {
    dir: PathBuf,
    segment_size: u64,
    buffer: Mutex<PendingBuffer>,
    segment: Mutex<SegmentFile>,
    next_lsn: AtomicU64,
    stats: Mutex<WalStats>,
}

impl WalShared {
    /// Swap out the pending buffer and retire it: one sequential write, one
    /// durability barrier, then every waiter in the batch is signalled.
    pub(crate) fn flush_pending(&self) {
        let (bytes, count, last_lsn, waiters) = {
            let mut buffer = self.buffer.lock();
            if buffer.count == 0 {
                return;
            }
            let bytes = std::mem::take(&mut buffer.bytes);
            let count = buffer.count;
            let last_lsn = buffer.last_lsn;
            let waiters = std::mem::take(&mut buffer.waiters);
            buffer.count = 0;
            (bytes, count, last_lsn, waiters)
        };

        let outcome = self.write_batch(&bytes);
        {
            let mut stats = self.stats.lock();
            stats.records += count;
            stats.batches += 1;
            stats.fsyncs += 1;
            stats.max_batch = stats.max_batch.max(count);
            if waiters.len() > 1 {
                stats.group_commits += 1;
            }
        }
        if let Err(e) = &outcome {
            warn!(error = %e, "wal batch flush failed");
        }
        for waiter in waiters {
            let _ = waiter.send(outcome.clone().map(|_| last_lsn));
        }
    }

    fn write_batch(&self, bytes: &[u8]) -> std::result::Result<(), String> {
        use std::io::Write;

        let mut segment = self.segment.lock();
        if segment.written >= self.segment_size {
            let next_index = segment.index + 1;
            let file = open_segment(&self.dir, next_index).map_err(|e| e.to_string())?;
            *segment = SegmentFile {
                file,
                index: next_index,
                written: 0,
            };
            debug!(segment = next_index, "wal segment rotated");
        }
        segment.file.write_all(bytes).map_err(|e| e.to_string())?;
        segment.file.sync_data().map_err(|e| e.to_string())?;
        segment.written += bytes.len() as u64;
        Ok(())
    }

    fn enqueue(&self, frame: Vec<u8>, waiter: Option<Sender<WaiterResult>>) -> Lsn {
        let mut buffer = self.buffer.lock();
        let lsn = self.next_lsn.fetch_add(1, Ordering::SeqCst);
        buffer.bytes.extend_from_slice(&frame);
        buffer.count += 1;
        buffer.last_lsn = lsn;
        if let Some(waiter) = waiter {
            buffer.waiters.push(waiter);
        }
        lsn
    }
}

/// Completion handle for a commit frame; resolves when the frame is durable.
pub struct CommitWaiter {
    rx: Receiver<WaiterResult>,
    timeout: Option<Duration>,
}

impl CommitWaiter {
    /// Block until the flusher has made the commit durable.
    pub fn wait(self) -> Result<Lsn> {
        let received = match self.timeout {
            Some(timeout) => self.rx.recv_timeout(timeout).map_err(|_| {
                DbError::Io(std::io::Error::other("group commit wait timed out"))
            })?,
            None => self
                .rx
                .recv()
                .map_err(|_| DbError::Io(std::io::Error::other("wal flusher went away")))?,
        };
        received.map_err(|e| DbError::Io(std::io::Error::other(e)))
    }
}

/// A transaction recovered from the log, in commit order.
#[derive(Debug)]
pub struct RecoveredTxn {
    pub txn_id: TxnId,
    pub commit_ts: Timestamp,
    /// Writes in append order; `None` payloads are tombstones.
    pub writes: Vec<(Vec<u8>, Option<Vec<u8>>)>,
}

/// Everything recovery learned from the durable log.
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    pub committed: Vec<RecoveredTxn>,
    pub max_txn_id: TxnId,
    pub max_ts: Timestamp,
}

/// The write-ahead log of one database instance.
pub struct Wal {
    shared: Arc<WalShared>,
    config: WalConfig,
    // Claim on the process-wide flusher; released on close.
    flusher: Mutex<Option<FlusherHandle>>,
    closed: Mutex<bool>,
}

impl Wal {
    /// Open the log directory, truncating any torn tail so new frames append
    /// after the last valid one.
    pub fn open(dir: &Path, config: WalConfig) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let flusher = FlusherHandle::acquire()?;

        let segments = list_segments(dir)?;
        let mut frame_count: u64 = 0;
        let mut last_index = 0;
        for (index, path) in &segments {
            let bytes = std::fs::read(path)?;
            let (frames, valid_len) = count_valid_frames(&bytes);
            frame_count += frames;
            last_index = *index;
            if valid_len < bytes.len() {
                // Torn tail from a crash mid-write; drop it so appends stay
                // contiguous with the valid prefix.
                warn!(
                    segment = index,
                    dropped = bytes.len() - valid_len,
                    "truncating torn wal tail"
                );
                let file = OpenOptions::new().write(true).open(path)?;
                file.set_len(valid_len as u64)?;
            }
        }

        let (index, file, written) = if segments.is_empty() {
            (1, open_segment(dir, 1)?, 0)
        } else {
            let path = segment_path(dir, last_index);
            let file = OpenOptions::new().append(true).open(&path)?;
            let written = file.metadata()?.len();
            (last_index, file, written)
        };

        let shared = Arc::new(WalShared {
            dir: dir.to_path_buf(),
            segment_size: config.segment_size,
            buffer: Mutex::new(PendingBuffer {
                bytes: Vec::new(),
                count: 0,
                last_lsn: 0,
                waiters: Vec::new(),
            }),
            segment: Mutex::new(SegmentFile {
                file,
                index,
                written,
            }),
            next_lsn: AtomicU64::new(frame_count + 1),
            stats: Mutex::new(WalStats::default()),
        });
        flusher::register_wal(&shared);
        info!(dir = %dir.display(), frames = frame_count, "wal opened");

        Ok(Self {
            shared,
            config,
            flusher: Mutex::new(Some(flusher)),
            closed: Mutex::new(false),
        })
    }

    /// Append a record without waiting for durability. `Begin`, `Write` and
    /// `Abort` frames are not worth a barrier of their own; they sit in the
    /// buffer until the next commit (or close) sweeps them out.
    pub fn append(&self, record: &WalRecord) -> Result<Lsn> {
        if *self.closed.lock() {
            return Err(DbError::Closed);
        }
        let frame = encode_frame(record)?;
        Ok(self.shared.enqueue(frame, None))
    }

    /// Append a `Commit` frame and hand back a waiter for its barrier. The
    /// commit timestamp is allocated under the append lock so commit order
    /// and timestamp order agree.
    pub fn append_commit(
        &self,
        txn_id: TxnId,
        clock: &AtomicU64,
    ) -> Result<(Timestamp, CommitWaiter)> {
        if *self.closed.lock() {
            return Err(DbError::Closed);
        }
        let mut buffer = self.shared.buffer.lock();
        let commit_ts = clock.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = encode_frame(&WalRecord::Commit { txn_id, commit_ts })?;
        let lsn = self.shared.next_lsn.fetch_add(1, Ordering::SeqCst);
        buffer.bytes.extend_from_slice(&frame);
        buffer.count += 1;
        buffer.last_lsn = lsn;
        let (tx, rx) = bounded(1);
        buffer.waiters.push(tx);
        drop(buffer);
        flusher::notify_work();

        Ok((
            commit_ts,
            CommitWaiter {
                rx,
                timeout: self.config.commit_timeout,
            },
        ))
    }

    /// Scan the durable log and return the transactions to replay.
    pub fn recover(&self) -> Result<RecoveryOutcome> {
        let mut outcome = RecoveryOutcome::default();
        let mut in_flight: HashMap<TxnId, Vec<(Vec<u8>, Option<Vec<u8>>)>> = HashMap::new();

        'segments: for (_, path) in list_segments(&self.shared.dir)? {
            let bytes = std::fs::read(&path)?;
            let mut at = 0;
            while at < bytes.len() {
                let Some((record, next)) = decode_frame(&bytes, at) else {
                    // CRC failure or torn frame: everything beyond is void.
                    break 'segments;
                };
                at = next;
                match record {
                    WalRecord::Begin { txn_id, ts } => {
                        outcome.max_txn_id = outcome.max_txn_id.max(txn_id);
                        outcome.max_ts = outcome.max_ts.max(ts);
                        in_flight.entry(txn_id).or_default();
                    }
                    WalRecord::Write { txn_id, key, value } => {
                        in_flight.entry(txn_id).or_default().push((key, value));
                    }
                    WalRecord::Commit { txn_id, commit_ts } => {
                        outcome.max_txn_id = outcome.max_txn_id.max(txn_id);
                        outcome.max_ts = outcome.max_ts.max(commit_ts);
                        let writes = in_flight.remove(&txn_id).unwrap_or_default();
                        outcome.committed.push(RecoveredTxn {
                            txn_id,
                            commit_ts,
                            writes,
                        });
                    }
                    WalRecord::Abort { txn_id } => {
                        outcome.max_txn_id = outcome.max_txn_id.max(txn_id);
                        in_flight.remove(&txn_id);
                    }
                }
            }
        }
        // Transactions with no terminating record are ignored.
        info!(
            committed = outcome.committed.len(),
            dangling = in_flight.len(),
            "wal recovery scan complete"
        );
        Ok(outcome)
    }

    pub fn stats(&self) -> WalStats {
        *self.shared.stats.lock()
    }

    /// Flush anything still buffered and detach from the shared flusher;
    /// the last instance to detach shuts the flusher thread down.
    pub fn close(&self) -> Result<()> {
        let mut closed = self.closed.lock();
        if *closed {
            return Ok(());
        }
        *closed = true;
        self.shared.flush_pending();
        flusher::deregister_wal(&self.shared);
        drop(self.flusher.lock().take());
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn segment_path(dir: &Path, index: u64) -> PathBuf {
    dir.join(format!("{:06}.{}", index, SEGMENT_EXT))
}

fn open_segment(dir: &Path, index: u64) -> std::io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(segment_path(dir, index))
}

fn list_segments(dir: &Path) -> Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXT) {
            continue;
        }
        if let Some(index) = path
            .file_stem()
            .and_then(|s| s.to_str())
            .and_then(|s| s.parse::<u64>().ok())
        {
            segments.push((index, path));
        }
    }
    segments.sort_by_key(|(index, _)| *index);
    Ok(segments)
}

/// Count whole valid frames in `bytes`, returning how many and the offset
/// where validity ends.
fn count_valid_frames(bytes: &[u8]) -> (u64, usize) {
    let mut count = 0;
    let mut at = 0;
    while at < bytes.len() {
        match decode_frame(bytes, at) {
            Some((_, next)) => {
                count += 1;
                at = next;
            }
            None => break,
        }
    }
    (count, at)
}
