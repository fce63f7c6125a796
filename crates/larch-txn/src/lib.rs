//! Transactions, locking, and restart recovery for the Larch storage
//! engine.
//!
//! Transactions chain their log records through per-transaction previous
//! LSNs, support savepoints and partial rollback, and release locks by
//! duration. Structure modifications compose through nested top actions:
//! a sequence of logged updates sealed by a compensation record whose
//! undo-next pointer jumps over the whole action.
//!
//! Restart recovery follows ARIES: analysis from the last checkpoint,
//! redo that repeats history, then undo of loser transactions.

pub mod error;
pub mod lock;
pub mod manager;
pub mod record;

pub use error::{TxnError, TxnResult};
pub use lock::{LockDuration, LockManager, LockMode, LockName, LockOutcome};
pub use manager::{
    Savepoint, Transaction, TransactionManager, TransactionManagerConfig, TransactionalModule,
};
pub use record::{RecordFlags, TxRecord, TXN_MODULE_ID};
