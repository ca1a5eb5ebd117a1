// # B+Tree node codec
//
// Nodes are decoded from page bodies into plain vectors, mutated, and
// encoded back. Entries are length-prefixed and packed densely from the
// start of the body; the page header's key count and free-space offset are
// rewritten on every encode.
//
// Leaf body:      [key_len:u16][key][val_len:u16][value]*
// Internal body:  [leftmost_child:u64] ([key_len:u16][key][val_len:u16=8][child:u64])*

use crate::common::{PageId, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::error::{DbError, Result};
use crate::storage::Page;

/// Bytes of a page usable for node entries.
pub const NODE_CAPACITY: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Target fan-out; nodes split past this many keys even when bytes remain.
pub const FANOUT: usize = 64;

/// Safety margin kept free when deciding whether an entry still fits.
pub const SPLIT_MARGIN: usize = 32;

fn read_u16(buf: &[u8], at: usize) -> Result<u16> {
    buf.get(at..at + 2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .ok_or_else(|| DbError::CorruptPage("truncated node entry length".into()))
}

fn read_u64(buf: &[u8], at: usize) -> Result<u64> {
    buf.get(at..at + 8)
        .map(|b| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(b);
            u64::from_le_bytes(raw)
        })
        .ok_or_else(|| DbError::CorruptPage("truncated node pointer".into()))
}

/// A decoded leaf: sorted `(key, value)` pairs.
#[derive(Debug, Default)]
pub struct LeafNode {
    pub entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl LeafNode {
    pub fn decode(page: &Page) -> Result<Self> {
        let body = page.body();
        let count = page.key_count() as usize;
        let mut entries = Vec::with_capacity(count);
        let mut at = 0;
        for _ in 0..count {
            let key_len = read_u16(body, at)? as usize;
            at += 2;
            let key = body
                .get(at..at + key_len)
                .ok_or_else(|| DbError::CorruptPage("truncated leaf key".into()))?
                .to_vec();
            at += key_len;
            let val_len = read_u16(body, at)? as usize;
            at += 2;
            let value = body
                .get(at..at + val_len)
                .ok_or_else(|| DbError::CorruptPage("truncated leaf value".into()))?
                .to_vec();
            at += val_len;
            entries.push((key, value));
        }
        if PAGE_HEADER_SIZE + at != page.free_space_offset() as usize {
            return Err(DbError::CorruptPage(
                "leaf body disagrees with free-space offset".into(),
            ));
        }
        Ok(Self { entries })
    }

    pub fn encode(&self, page: &mut Page) {
        let mut at = 0;
        {
            let body = page.body_mut();
            for (key, value) in &self.entries {
                body[at..at + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
                at += 2;
                body[at..at + key.len()].copy_from_slice(key);
                at += key.len();
                body[at..at + 2].copy_from_slice(&(value.len() as u16).to_le_bytes());
                at += 2;
                body[at..at + value.len()].copy_from_slice(value);
                at += value.len();
            }
        }
        page.set_key_count(self.entries.len() as u16);
        page.set_free_space_offset((PAGE_HEADER_SIZE + at) as u16);
    }

    pub fn encoded_size(&self) -> usize {
        self.entries.iter().map(|(k, v)| 4 + k.len() + v.len()).sum()
    }

    pub fn overflows(&self) -> bool {
        self.entries.len() > FANOUT || self.encoded_size() + SPLIT_MARGIN > NODE_CAPACITY
    }
}

/// A decoded internal node: a leftmost child plus sorted separators, each
/// owning the subtree at or above its key.
#[derive(Debug)]
pub struct InternalNode {
    pub leftmost: PageId,
    pub entries: Vec<(Vec<u8>, PageId)>,
}

impl InternalNode {
    pub fn decode(page: &Page) -> Result<Self> {
        let body = page.body();
        let count = page.key_count() as usize;
        let leftmost = read_u64(body, 0)?;
        let mut entries = Vec::with_capacity(count);
        let mut at = 8;
        for _ in 0..count {
            let key_len = read_u16(body, at)? as usize;
            at += 2;
            let key = body
                .get(at..at + key_len)
                .ok_or_else(|| DbError::CorruptPage("truncated separator key".into()))?
                .to_vec();
            at += key_len;
            let val_len = read_u16(body, at)? as usize;
            if val_len != 8 {
                return Err(DbError::CorruptPage(format!(
                    "separator payload is {} bytes, expected 8",
                    val_len
                )));
            }
            at += 2;
            let child = read_u64(body, at)?;
            at += 8;
            entries.push((key, child));
        }
        if PAGE_HEADER_SIZE + at != page.free_space_offset() as usize {
            return Err(DbError::CorruptPage(
                "internal body disagrees with free-space offset".into(),
            ));
        }
        Ok(Self { leftmost, entries })
    }

    pub fn encode(&self, page: &mut Page) {
        let mut at = 8;
        {
            let body = page.body_mut();
            body[0..8].copy_from_slice(&self.leftmost.to_le_bytes());
            for (key, child) in &self.entries {
                body[at..at + 2].copy_from_slice(&(key.len() as u16).to_le_bytes());
                at += 2;
                body[at..at + key.len()].copy_from_slice(key);
                at += key.len();
                body[at..at + 2].copy_from_slice(&8u16.to_le_bytes());
                at += 2;
                body[at..at + 8].copy_from_slice(&child.to_le_bytes());
                at += 8;
            }
        }
        page.set_key_count(self.entries.len() as u16);
        page.set_free_space_offset((PAGE_HEADER_SIZE + at) as u16);
    }

    pub fn encoded_size(&self) -> usize {
        8 + self.entries.iter().map(|(k, _)| 12 + k.len()).sum::<usize>()
    }

    pub fn overflows(&self) -> bool {
        self.entries.len() > FANOUT || self.encoded_size() + SPLIT_MARGIN > NODE_CAPACITY
    }

    /// Index of the child to descend into for `key`. Ties resolve right:
    /// `key >= separator` goes into the separator's subtree.
    pub fn child_for(&self, key: &[u8]) -> PageId {
        let idx = self
            .entries
            .partition_point(|(sep, _)| sep.as_slice() <= key);
        if idx == 0 {
            self.leftmost
        } else {
            self.entries[idx - 1].1
        }
    }
}
