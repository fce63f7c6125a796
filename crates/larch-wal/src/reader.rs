//! Forward and backward log scans.
//!
//! Scans are lazy and honour the durable LSN as their visibility
//! boundary. EOF marker records are skipped.

use std::sync::Arc;

use larch_common::Lsn;

use crate::error::LogResult;
use crate::manager::{advance_to_next_file, advance_to_next_record, LogManager, FIRST_LSN};
use crate::record::LogRecord;

/// Iterates over records in log order, starting at a given LSN.
pub struct ForwardLogReader {
    log: Arc<LogManager>,
    next_lsn: Lsn,
}

impl ForwardLogReader {
    pub(crate) fn new(log: Arc<LogManager>, start: Lsn) -> Self {
        let start = if start.is_null() { FIRST_LSN } else { start };
        Self {
            log,
            next_lsn: start,
        }
    }
}

impl Iterator for ForwardLogReader {
    type Item = LogResult<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let limit = self.log.durable_lsn();
            if limit.is_null() || self.next_lsn < FIRST_LSN || self.next_lsn > limit {
                return None;
            }
            match self.log.read(self.next_lsn) {
                Err(e) => return Some(Err(e)),
                Ok(rec) if rec.is_eof() => {
                    self.next_lsn = advance_to_next_file(self.next_lsn);
                }
                Ok(rec) => {
                    self.next_lsn = advance_to_next_record(self.next_lsn, rec.stored_length());
                    return Some(Ok(rec));
                }
            }
        }
    }
}

/// Iterates over records in reverse log order, following each record's
/// previous-record pointer.
pub struct BackwardLogReader {
    log: Arc<LogManager>,
    next_lsn: Lsn,
}

impl BackwardLogReader {
    pub(crate) fn new(log: Arc<LogManager>, start: Lsn) -> Self {
        Self {
            log,
            next_lsn: start,
        }
    }
}

impl Iterator for BackwardLogReader {
    type Item = LogResult<LogRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let limit = self.log.durable_lsn();
            if self.next_lsn.is_null() || limit.is_null() || self.next_lsn > limit {
                return None;
            }
            match self.log.read(self.next_lsn) {
                Err(e) => return Some(Err(e)),
                Ok(rec) => {
                    self.next_lsn = rec.prev_lsn;
                    if !rec.is_eof() {
                        return Some(Ok(rec));
                    }
                }
            }
        }
    }
}
