// Paged storage: the page format and the disk pager that owns the data file.

pub mod page;
pub mod pager;

pub use page::{Page, PageType};
pub use pager::{Pager, ENCRYPTION_OVERHEAD};
