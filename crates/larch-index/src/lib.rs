//! Recoverable B-link tree index manager.
//!
//! The tree is a B-link tree: every page carries a right-sibling
//! pointer, so readers can traverse across in-progress structure
//! modifications. SMOs (split, merge, link, unlink, redistribute, tree
//! height changes) are logged as compensation records forming nested
//! top actions: once complete they survive their transaction's
//! rollback. Key inserts and deletes are undoable with *logical* undo,
//! because the leaf holding a key may have moved by the time the undo
//! runs. Phantom prevention uses next-key locking.
//!
//! The index is parametric in its key and location types through the
//! [`KeyCodec`] and [`LocationCodec`] capabilities.

pub mod error;
pub mod item;
pub mod node;
pub mod ops;
pub mod scan;
pub mod tree;

pub use error::{IndexError, IndexResult};
pub use item::{IndexItem, ItemCodec, KeyCodec, LocationCodec, RowLocation, RowLocationCodec, StringKey, StringKeyCodec};
pub use scan::IndexScan;
pub use tree::{BTree, BTreeIndexManager, PageLoad, INDEX_MODULE_ID};
