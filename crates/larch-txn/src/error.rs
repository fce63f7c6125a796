//! Transaction error types.

use thiserror::Error;

use larch_common::TxnId;
use larch_storage::StorageError;
use larch_wal::LogError;

/// Result type for transaction operations.
pub type TxnResult<T> = Result<T, TxnError>;

/// Errors from transactions, locking, and recovery.
#[derive(Debug, Error)]
pub enum TxnError {
    /// Log manager failure.
    #[error("log error: {source}")]
    Log {
        #[from]
        source: LogError,
    },

    /// Buffer pool or container failure.
    #[error("storage error: {source}")]
    Storage {
        #[from]
        source: StorageError,
    },

    /// A lock wait exceeded its bound.
    #[error("transaction {txn_id} timed out waiting for a lock")]
    LockTimeout { txn_id: TxnId },

    /// The lock manager chose this transaction as a deadlock victim.
    #[error("deadlock detected for transaction {txn_id}")]
    Deadlock { txn_id: TxnId },

    /// Operation on a transaction that is no longer active.
    #[error("transaction {txn_id} is not active")]
    NotActive { txn_id: TxnId },

    /// A log record referenced a module that is not registered.
    #[error("no transactional module registered with id {module_id}")]
    UnknownModule { module_id: u8 },

    /// A log record payload failed to parse.
    #[error("malformed log record payload: {reason}")]
    BadRecord { reason: String },
}

impl TxnError {
    /// Creates a malformed-record error.
    pub fn bad_record(reason: impl Into<String>) -> Self {
        Self::BadRecord {
            reason: reason.into(),
        }
    }
}
