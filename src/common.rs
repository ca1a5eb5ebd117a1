// # Shared identifier types and layout constants
//
// Kept in one place so the storage, log and transaction layers agree on the
// width of every on-disk identifier.

/// Identifies a fixed-size page in the data file.
pub type PageId = u64;

/// Monotonic transaction identifier.
pub type TxnId = u64;

/// Log sequence number of a WAL frame.
pub type Lsn = u64;

/// Logical commit/snapshot timestamp.
pub type Timestamp = u64;

/// Size of a plaintext page, the only unit of disk I/O.
pub const PAGE_SIZE: usize = 8192;

/// Bytes reserved at the start of every page for the header.
pub const PAGE_HEADER_SIZE: usize = 30;

/// Sentinel for "no page" in next/prev links and unset roots.
pub const INVALID_PAGE_ID: PageId = PageId::MAX;
