// # Page format
//
// A page is the only unit of disk I/O: 8 KiB, addressed by a 64-bit PageId,
// with a 30-byte header followed by the body. The header is kept consistent
// with the body on every mutation; the buffer pool tracks dirtiness, the
// page itself only knows its bytes.
//
// Header layout (little endian):
//
// ```text
// offset  size  field
//      0     1  page type (leaf / internal / meta / free)
//      1     1  flags (reserved)
//      2     2  key count
//      4     2  free-space offset
//      6     8  page LSN
//     14     8  next page id
//     22     8  prev page id
// ```

use crate::common::{Lsn, PageId, INVALID_PAGE_ID, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::error::{DbError, Result};

/// What a page carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Leaf,
    Internal,
    Meta,
    Free,
}

impl PageType {
    fn as_u8(self) -> u8 {
        match self {
            PageType::Leaf => 1,
            PageType::Internal => 2,
            PageType::Meta => 3,
            PageType::Free => 4,
        }
    }

    fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(PageType::Leaf),
            2 => Ok(PageType::Internal),
            3 => Ok(PageType::Meta),
            4 => Ok(PageType::Free),
            other => Err(DbError::CorruptPage(format!(
                "unknown page type tag {}",
                other
            ))),
        }
    }
}

/// A fixed-size block of data plus its header accessors.
#[derive(Debug, Clone)]
pub struct Page {
    pub id: PageId,
    data: Vec<u8>,
}

impl Page {
    /// Create a zeroed page of the given type. The free-space offset starts
    /// right after the header.
    pub fn new(id: PageId, page_type: PageType) -> Self {
        let mut page = Self {
            id,
            data: vec![0; PAGE_SIZE],
        };
        page.set_page_type(page_type);
        page.set_free_space_offset(PAGE_HEADER_SIZE as u16);
        page.set_next_page_id(INVALID_PAGE_ID);
        page.set_prev_page_id(INVALID_PAGE_ID);
        page
    }

    /// Reconstruct a page from raw disk bytes, validating structural sanity.
    pub fn from_bytes(id: PageId, data: Vec<u8>) -> Result<Self> {
        if data.len() != PAGE_SIZE {
            return Err(DbError::CorruptPage(format!(
                "page {} has {} bytes, expected {}",
                id,
                data.len(),
                PAGE_SIZE
            )));
        }
        let page = Self { id, data };
        PageType::from_u8(page.data[0])?;
        if page.free_space_offset() as usize > PAGE_SIZE {
            return Err(DbError::CorruptPage(format!(
                "page {} free-space offset {} exceeds page size",
                id,
                page.free_space_offset()
            )));
        }
        Ok(page)
    }

    pub fn page_type(&self) -> PageType {
        // from_bytes/new guarantee a valid tag.
        PageType::from_u8(self.data[0]).unwrap_or(PageType::Free)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.data[0] = page_type.as_u8();
    }

    pub fn key_count(&self) -> u16 {
        u16::from_le_bytes([self.data[2], self.data[3]])
    }

    pub fn set_key_count(&mut self, count: u16) {
        self.data[2..4].copy_from_slice(&count.to_le_bytes());
    }

    pub fn free_space_offset(&self) -> u16 {
        u16::from_le_bytes([self.data[4], self.data[5]])
    }

    pub fn set_free_space_offset(&mut self, offset: u16) {
        debug_assert!(offset as usize <= PAGE_SIZE);
        self.data[4..6].copy_from_slice(&offset.to_le_bytes());
    }

    pub fn lsn(&self) -> Lsn {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[6..14]);
        Lsn::from_le_bytes(buf)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.data[6..14].copy_from_slice(&lsn.to_le_bytes());
    }

    pub fn next_page_id(&self) -> PageId {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[14..22]);
        PageId::from_le_bytes(buf)
    }

    pub fn set_next_page_id(&mut self, id: PageId) {
        self.data[14..22].copy_from_slice(&id.to_le_bytes());
    }

    pub fn prev_page_id(&self) -> PageId {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.data[22..30]);
        PageId::from_le_bytes(buf)
    }

    pub fn set_prev_page_id(&mut self, id: PageId) {
        self.data[22..30].copy_from_slice(&id.to_le_bytes());
    }

    /// Page body after the header.
    pub fn body(&self) -> &[u8] {
        &self.data[PAGE_HEADER_SIZE..]
    }

    pub fn body_mut(&mut self) -> &mut [u8] {
        &mut self.data[PAGE_HEADER_SIZE..]
    }

    /// Full page bytes, header included, as written to disk.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut page = Page::new(7, PageType::Leaf);
        page.set_key_count(12);
        page.set_free_space_offset(456);
        page.set_lsn(99);
        page.set_next_page_id(8);
        page.set_prev_page_id(6);

        let restored = Page::from_bytes(7, page.as_bytes().to_vec()).unwrap();
        assert_eq!(restored.page_type(), PageType::Leaf);
        assert_eq!(restored.key_count(), 12);
        assert_eq!(restored.free_space_offset(), 456);
        assert_eq!(restored.lsn(), 99);
        assert_eq!(restored.next_page_id(), 8);
        assert_eq!(restored.prev_page_id(), 6);
    }

    #[test]
    fn fresh_page_points_nowhere() {
        let page = Page::new(0, PageType::Internal);
        assert_eq!(page.next_page_id(), INVALID_PAGE_ID);
        assert_eq!(page.prev_page_id(), INVALID_PAGE_ID);
        assert_eq!(page.free_space_offset() as usize, PAGE_HEADER_SIZE);
        assert_eq!(page.key_count(), 0);
    }

    #[test]
    fn bad_type_tag_rejected() {
        let mut raw = vec![0u8; PAGE_SIZE];
        raw[0] = 9;
        assert!(matches!(
            Page::from_bytes(0, raw),
            Err(DbError::CorruptPage(_))
        ));
    }

    #[test]
    fn short_buffer_rejected() {
        assert!(Page::from_bytes(0, vec![0u8; 100]).is_err());
    }
}
