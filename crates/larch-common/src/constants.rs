//! System-wide constants.

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 8 * 1024;

/// Size of the fixed page header preceding the slot directory.
pub const PAGE_HEADER_SIZE: usize = 24;

/// Maximum number of log control (anchor) files.
pub const MAX_CTL_FILES: usize = 3;

/// Maximum number of online log groups.
pub const MAX_LOG_GROUPS: usize = 3;

/// Maximum number of online log files per group.
pub const MAX_LOG_FILES: usize = 8;

/// Overhead of a log record on disk: length (4) + lsn (8) + prev_lsn (8)
/// + checksum (8).
pub const LOG_RECORD_OVERHEAD: usize = 28;

/// Size of the header at the start of every online log file:
/// group id (2) + file index (4).
pub const LOG_FILE_HEADER_SIZE: usize = 6;

/// Page number of the first space map page in an index container.
pub const SPACE_MAP_PAGE_NUMBER: u32 = 1;

/// Page number of the root page of a B-link tree. The root never moves.
pub const ROOT_PAGE_NUMBER: u32 = 2;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_record_overhead() {
        // length + two LSNs + checksum
        assert_eq!(LOG_RECORD_OVERHEAD, 4 + 8 + 8 + 8);
    }

    #[test]
    fn test_page_header_fits() {
        assert!(PAGE_HEADER_SIZE < DEFAULT_PAGE_SIZE);
    }
}
