//! Index error types.

use thiserror::Error;

use larch_storage::StorageError;
use larch_txn::TxnError;

/// Result type for index operations.
pub type IndexResult<T> = Result<T, IndexError>;

/// Errors from B-link tree operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Transaction, lock, or log failure.
    #[error("transaction error: {source}")]
    Txn {
        #[from]
        source: TxnError,
    },

    /// Buffer pool or container failure.
    #[error("storage error: {source}")]
    Storage {
        #[from]
        source: StorageError,
    },

    /// Inserting a duplicate key into a unique index.
    #[error("unique constraint violation: {key}")]
    UniqueConstraintViolation { key: String },

    /// Delete target is absent.
    #[error("key not found: {key}")]
    KeyNotFound { key: String },

    /// An index page's contents contradict the tree invariants.
    #[error("tree structure is corrupt: {reason}")]
    TreeCorrupt { reason: String },

    /// A key or location failed to parse or decode.
    #[error("bad key or location encoding: {reason}")]
    BadEncoding { reason: String },
}

impl IndexError {
    /// Creates a corrupt-structure error.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::TreeCorrupt {
            reason: reason.into(),
        }
    }

    /// Creates a bad-encoding error.
    pub fn bad_encoding(reason: impl Into<String>) -> Self {
        Self::BadEncoding {
            reason: reason.into(),
        }
    }
}
