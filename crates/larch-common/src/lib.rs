//! Shared types for the Larch storage engine.
//!
//! This crate holds the identifier newtypes used across every other
//! Larch crate, plus the constants that define the on-disk geometry.

pub mod constants;
pub mod types;

pub use types::{Lsn, PageId, PageNumber, TxnId};
