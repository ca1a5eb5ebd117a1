// # Pager
//
// Exclusively owns the data file handle and performs fixed-size page I/O.
// Page ids map directly to file offsets: `id * disk_page_size`. The next id
// to allocate is derived from the file size at open, so the file itself is
// the allocation record.
//
// When an encryption key is configured every on-disk page is sealed with
// AES-256-GCM under a fresh random nonce; the nonce and the GCM tag ride in
// the disk block, so the disk page size grows by a fixed overhead. A page
// that fails to open is reported as corrupt, never silently zeroed.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use parking_lot::RwLock;
use rand::RngCore;
use tracing::debug;

use crate::common::{PageId, PAGE_SIZE};
use crate::error::{DbError, Result};
use crate::storage::page::{Page, PageType};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Extra bytes per disk page when encryption at rest is enabled.
pub const ENCRYPTION_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

struct PagerState {
    file: File,
    closed: bool,
}

/// Fixed-size page store over a single data file.
pub struct Pager {
    state: RwLock<PagerState>,
    cipher: Option<Aes256Gcm>,
    disk_page_size: usize,
    next_page_id: AtomicU64,
}

impl Pager {
    /// Open (or create) the data file. `encryption_key` enables AES-256-GCM
    /// for every page written from here on; a file written with a key can
    /// only be reopened with the same key.
    pub fn open(path: &Path, encryption_key: Option<&[u8; 32]>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let cipher = encryption_key.map(|key| Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)));
        let disk_page_size = if cipher.is_some() {
            PAGE_SIZE + ENCRYPTION_OVERHEAD
        } else {
            PAGE_SIZE
        };

        let file_len = file.metadata()?.len();
        let next_page_id = file_len / disk_page_size as u64;
        debug!(
            path = %path.display(),
            pages = next_page_id,
            encrypted = cipher.is_some(),
            "pager opened"
        );

        Ok(Self {
            state: RwLock::new(PagerState {
                file,
                closed: false,
            }),
            cipher,
            disk_page_size,
            next_page_id: AtomicU64::new(next_page_id),
        })
    }

    /// Reserve a fresh page id and extend the file to cover it.
    pub fn allocate_page(&self) -> Result<PageId> {
        let state = self.state.write();
        if state.closed {
            return Err(DbError::Closed);
        }
        let id = self.next_page_id.fetch_add(1, Ordering::SeqCst);
        state
            .file
            .set_len((id + 1) * self.disk_page_size as u64)?;
        Ok(id)
    }

    /// Read a page back, decrypting and validating it.
    pub fn read_page(&self, id: PageId) -> Result<Page> {
        let state = self.state.read();
        if state.closed {
            return Err(DbError::Closed);
        }
        if id >= self.next_page_id.load(Ordering::SeqCst) {
            return Err(DbError::NotFound(format!("page {}", id)));
        }

        let mut block = vec![0u8; self.disk_page_size];
        read_exact_at(&state.file, &mut block, id * self.disk_page_size as u64)?;
        drop(state);

        let plaintext = match &self.cipher {
            Some(cipher) => {
                let (nonce, ciphertext) = block.split_at(NONCE_LEN);
                cipher
                    .decrypt(Nonce::from_slice(nonce), ciphertext)
                    .map_err(|_| {
                        DbError::CorruptPage(format!("page {} failed authenticated decryption", id))
                    })?
            }
            None => block,
        };
        Page::from_bytes(id, plaintext)
    }

    /// Write a page at its slot. The page must have been allocated.
    pub fn write_page(&self, page: &Page) -> Result<()> {
        let state = self.state.read();
        if state.closed {
            return Err(DbError::Closed);
        }

        let block = match &self.cipher {
            Some(cipher) => {
                let mut nonce = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce);
                let ciphertext = cipher
                    .encrypt(Nonce::from_slice(&nonce), page.as_bytes())
                    .map_err(|_| {
                        DbError::CorruptPage(format!("page {} failed encryption", page.id))
                    })?;
                let mut block = Vec::with_capacity(self.disk_page_size);
                block.extend_from_slice(&nonce);
                block.extend_from_slice(&ciphertext);
                block
            }
            None => page.as_bytes().to_vec(),
        };
        debug_assert_eq!(block.len(), self.disk_page_size);

        write_all_at(&state.file, &block, page.id * self.disk_page_size as u64)?;
        Ok(())
    }

    /// OS-level durability barrier on the data file.
    pub fn sync(&self) -> Result<()> {
        let state = self.state.read();
        if state.closed {
            return Err(DbError::Closed);
        }
        state.file.sync_data()?;
        Ok(())
    }

    /// Flush and mark the pager closed; later calls fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.closed {
            return Ok(());
        }
        state.file.sync_all()?;
        state.closed = true;
        Ok(())
    }

    /// Number of pages the file currently covers.
    pub fn page_count(&self) -> u64 {
        self.next_page_id.load(Ordering::SeqCst)
    }

    /// Convenience for callers that allocate and immediately initialize.
    pub fn allocate_typed(&self, page_type: PageType) -> Result<Page> {
        let id = self.allocate_page()?;
        Ok(Page::new(id, page_type))
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_read(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "short page read",
            ));
        }
        buf = &mut buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn allocate_write_read_round_trip() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(&dir.path().join("data.db"), None).unwrap();

        let mut page = pager.allocate_typed(PageType::Leaf).unwrap();
        page.body_mut()[0..4].copy_from_slice(b"abcd");
        pager.write_page(&page).unwrap();

        let loaded = pager.read_page(page.id).unwrap();
        assert_eq!(&loaded.body()[0..4], b"abcd");
        assert_eq!(loaded.page_type(), PageType::Leaf);
    }

    #[test]
    fn next_id_derived_from_file_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        {
            let pager = Pager::open(&path, None).unwrap();
            for _ in 0..3 {
                let page = pager.allocate_typed(PageType::Leaf).unwrap();
                pager.write_page(&page).unwrap();
            }
            pager.close().unwrap();
        }
        let pager = Pager::open(&path, None).unwrap();
        assert_eq!(pager.page_count(), 3);
        assert_eq!(pager.allocate_page().unwrap(), 3);
    }

    #[test]
    fn encrypted_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");
        let key = [7u8; 32];

        let pager = Pager::open(&path, Some(&key)).unwrap();
        let mut page = pager.allocate_typed(PageType::Leaf).unwrap();
        page.body_mut()[0..6].copy_from_slice(b"secret");
        pager.write_page(&page).unwrap();
        let id = page.id;
        pager.close().unwrap();

        let pager = Pager::open(&path, Some(&key)).unwrap();
        let loaded = pager.read_page(id).unwrap();
        assert_eq!(&loaded.body()[0..6], b"secret");
    }

    #[test]
    fn wrong_key_is_corrupt_page() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.db");

        let pager = Pager::open(&path, Some(&[1u8; 32])).unwrap();
        let page = pager.allocate_typed(PageType::Leaf).unwrap();
        pager.write_page(&page).unwrap();
        let id = page.id;
        pager.close().unwrap();

        let pager = Pager::open(&path, Some(&[2u8; 32])).unwrap();
        assert!(matches!(
            pager.read_page(id),
            Err(DbError::CorruptPage(_))
        ));
    }

    #[test]
    fn unallocated_page_not_found() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(&dir.path().join("data.db"), None).unwrap();
        assert!(matches!(pager.read_page(5), Err(DbError::NotFound(_))));
    }

    #[test]
    fn closed_pager_rejects_io() {
        let dir = tempdir().unwrap();
        let pager = Pager::open(&dir.path().join("data.db"), None).unwrap();
        pager.close().unwrap();
        assert!(matches!(pager.allocate_page(), Err(DbError::Closed)));
        assert!(matches!(pager.sync(), Err(DbError::Closed)));
    }
}
