//! Pages, page containers, and the buffer pool for the Larch storage
//! engine.
//!
//! A page is a fixed-size byte array with a small header, managed as a
//! slotted page (slot directory + variable-length slot data) or as a
//! space-map bitmap. Containers are files of pages. The buffer pool
//! caches pages in frames and hands out latched fix handles; it enforces
//! the write-ahead rule by flushing the log before writing a dirty page.

pub mod buffer;
pub mod error;
pub mod file;
pub mod page;

pub use buffer::{BufferPool, BufferPoolConfig, FixHandle, LatchMode};
pub use error::{StorageError, StorageResult};
pub use file::ContainerManager;
pub use page::{Page, PageType, SpaceMapPage};
