//! Log manager configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use larch_common::constants::{MAX_CTL_FILES, MAX_LOG_FILES, MAX_LOG_GROUPS};

use crate::error::{LogError, LogResult};

/// Single-character ids assigned to log groups, stored in every log file
/// header of the group.
pub const LOG_GROUP_IDS: [char; MAX_LOG_GROUPS] = ['a', 'b', 'c'];

/// Configuration for the write-ahead log.
///
/// Recognised settings mirror the `log.*` configuration keys: control
/// file paths, group directories, files per group, file size, buffer size
/// and limit, flush interval, and the archive directory.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Paths of the mirrored control files (at most 3).
    pub ctl_files: Vec<PathBuf>,

    /// Directory of each online log group (at most 3).
    pub group_paths: Vec<PathBuf>,

    /// Number of online log files per group (at most 8).
    pub files_per_group: u16,

    /// Size in bytes of each online log file.
    pub file_size: usize,

    /// Size in bytes of an in-memory log buffer; must accommodate the
    /// largest record.
    pub buffer_size: usize,

    /// Maximum number of in-flight log buffers before inserters block.
    pub max_buffers: usize,

    /// Interval between background flushes.
    pub flush_interval: Duration,

    /// Directory for archived log files.
    pub archive_path: PathBuf,

    /// Whether full files are archived before reuse.
    pub archive_mode: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            ctl_files: vec![PathBuf::from("ctl.0"), PathBuf::from("ctl.1")],
            group_paths: vec![PathBuf::from(".")],
            files_per_group: 2,
            file_size: 2 * 1024 * 1024,
            buffer_size: 64 * 1024,
            max_buffers: 20,
            flush_interval: Duration::from_secs(6),
            archive_path: PathBuf::from("."),
            archive_mode: true,
        }
    }
}

impl LogConfig {
    /// Creates a configuration rooted under a single base directory, the
    /// common case for an embedded database.
    pub fn within(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            ctl_files: vec![base.join("ctl.0"), base.join("ctl.1")],
            group_paths: vec![base.to_path_buf()],
            archive_path: base.join("archive"),
            ..Default::default()
        }
    }

    /// Sets the online file size.
    #[must_use]
    pub fn with_file_size(mut self, size: usize) -> Self {
        self.file_size = size;
        self
    }

    /// Sets the in-memory buffer size.
    #[must_use]
    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Sets the number of online files per group.
    #[must_use]
    pub fn with_files_per_group(mut self, n: u16) -> Self {
        self.files_per_group = n;
        self
    }

    /// Sets the maximum number of in-flight log buffers.
    #[must_use]
    pub fn with_max_buffers(mut self, n: usize) -> Self {
        self.max_buffers = n;
        self
    }

    /// Sets the background flush interval.
    #[must_use]
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    /// Validates the configuration.
    pub fn validate(&self) -> LogResult<()> {
        if self.ctl_files.is_empty() || self.ctl_files.len() > MAX_CTL_FILES {
            return Err(LogError::config(format!(
                "between 1 and {} control files required",
                MAX_CTL_FILES
            )));
        }
        if self.group_paths.is_empty() || self.group_paths.len() > MAX_LOG_GROUPS {
            return Err(LogError::config(format!(
                "between 1 and {} log groups required",
                MAX_LOG_GROUPS
            )));
        }
        if self.files_per_group < 2 || self.files_per_group as usize > MAX_LOG_FILES {
            return Err(LogError::config(format!(
                "between 2 and {} files per group required",
                MAX_LOG_FILES
            )));
        }
        if self.file_size < 1024 {
            return Err(LogError::config("log file size must be at least 1 KiB"));
        }
        if self.buffer_size < 256 {
            return Err(LogError::config("log buffer size must be at least 256 bytes"));
        }
        if self.max_buffers == 0 {
            return Err(LogError::config("log buffer limit must be positive"));
        }
        Ok(())
    }

    /// Returns the path of online file `file_no` in group `group_no`.
    pub fn online_file_path(&self, group_no: usize, file_no: usize) -> PathBuf {
        self.group_paths[group_no].join(format!("{}.{}", LOG_GROUP_IDS[group_no], file_no))
    }

    /// Returns the path of the archived file for a log index.
    pub fn archive_file_path(&self, log_index: u32) -> PathBuf {
        self.archive_path.join(format!("{}.log", log_index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(LogConfig::default().validate().is_ok());
    }

    #[test]
    fn test_validation_limits() {
        let mut cfg = LogConfig::default();
        cfg.files_per_group = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = LogConfig::default();
        cfg.ctl_files.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = LogConfig::default();
        cfg.file_size = 100;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_paths() {
        let cfg = LogConfig::within("/tmp/db");
        assert_eq!(
            cfg.online_file_path(0, 1),
            PathBuf::from("/tmp/db/a.1")
        );
        assert_eq!(
            cfg.archive_file_path(7),
            PathBuf::from("/tmp/db/archive/7.log")
        );
    }
}
