// # WAL record and frame format
//
// Records are bincode-encoded and wrapped in length-prefixed, CRC-protected
// frames:
//
// ```text
// [payload_len: u32][crc32(payload): u32][payload]
// ```
//
// A frame that fails its CRC, or that cannot be read in full, marks the
// end of the usable log; everything after it is discarded by recovery.

use serde::{Deserialize, Serialize};

use crate::common::{Timestamp, TxnId};
use crate::error::{DbError, Result};

/// One logical log entry. A `Write` with `value: None` is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecord {
    Begin {
        txn_id: TxnId,
        ts: Timestamp,
    },
    Write {
        txn_id: TxnId,
        key: Vec<u8>,
        value: Option<Vec<u8>>,
    },
    Commit {
        txn_id: TxnId,
        commit_ts: Timestamp,
    },
    Abort {
        txn_id: TxnId,
    },
}

impl WalRecord {
    pub fn txn_id(&self) -> TxnId {
        match self {
            WalRecord::Begin { txn_id, .. }
            | WalRecord::Write { txn_id, .. }
            | WalRecord::Commit { txn_id, .. }
            | WalRecord::Abort { txn_id } => *txn_id,
        }
    }
}

/// Encode a record into a complete frame.
pub fn encode_frame(record: &WalRecord) -> Result<Vec<u8>> {
    let payload = bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| DbError::InvalidArgument(format!("unencodable wal record: {}", e)))?;
    let mut frame = Vec::with_capacity(8 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Decode the frame starting at `buf[at..]`. Returns the record and the
/// offset just past it, or `None` when the bytes from `at` on do not form a
/// complete, checksummed frame (truncated tail or torn write).
pub fn decode_frame(buf: &[u8], at: usize) -> Option<(WalRecord, usize)> {
    let header = buf.get(at..at + 8)?;
    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    let payload = buf.get(at + 8..at + 8 + len)?;
    if crc32fast::hash(payload) != crc {
        return None;
    }
    let (record, _) =
        bincode::serde::decode_from_slice(payload, bincode::config::standard()).ok()?;
    Some((record, at + 8 + len))
}
