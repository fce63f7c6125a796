//! Storage error types.

use std::io;
use thiserror::Error;

use larch_common::PageId;
use larch_wal::LogError;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors from pages, containers, and the buffer pool.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O failure on a page container.
    #[error("storage I/O error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    /// Log failure while honouring the write-ahead rule.
    #[error("log error during page write-back: {source}")]
    Log {
        #[from]
        source: LogError,
    },

    /// Container id is not registered.
    #[error("unknown container {container_id}")]
    UnknownContainer { container_id: u32 },

    /// Container id already registered.
    #[error("container {container_id} already exists")]
    ContainerExists { container_id: u32 },

    /// Every buffer frame is pinned.
    #[error("no free buffer frames")]
    NoFreeFrames,

    /// Slot index out of range or deleted.
    #[error("invalid slot {slot} on page {page_id}")]
    InvalidSlot { page_id: PageId, slot: usize },

    /// Page cannot hold the requested bytes.
    #[error("page {page_id} is full")]
    PageFull { page_id: PageId },

    /// Space map has no free page to hand out.
    #[error("container {container_id} has no free pages")]
    NoFreePages { container_id: u32 },
}
