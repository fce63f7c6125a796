//! Write-ahead log manager for the Larch storage engine.
//!
//! The log is a never-ending logical sequence of records, physically
//! realised as a ring of pre-allocated online log files per group, with
//! full files copied to an archive directory before their slot is reused.
//! Control information (the "anchor") is mirrored across up to three
//! control files.
//!
//! The manager runs three background workers: a periodic flush daemon, an
//! archiver, and an archive cleaner. Background failures are recorded and
//! surfaced on the next public call.

pub mod anchor;
pub mod buffer;
pub mod config;
pub mod error;
pub mod manager;
pub mod reader;
pub mod record;

pub use config::LogConfig;
pub use error::{LogError, LogResult};
pub use manager::LogManager;
pub use reader::{BackwardLogReader, ForwardLogReader};
pub use record::LogRecord;
