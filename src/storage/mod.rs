mod cache;
mod page_io;

pub use cache::PageCache;
pub use page_io::{PageIo, FREE_MARKER, NO_PAGE};
