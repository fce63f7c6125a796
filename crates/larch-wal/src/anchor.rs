//! The log anchor (control block).
//!
//! The anchor holds everything needed to re-open the log: group and file
//! layout, per-file statuses, the current write position, durability
//! water marks, and the checkpoint LSNs. It is written in full to every
//! configured control file, prefixed by `{length, checksum}`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};

use bytes::{Buf, BufMut};

use larch_common::Lsn;

use crate::error::{LogError, LogResult};

/// Status of one online log file slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FileStatus {
    /// Slot holds no live log file and may be reused.
    Unused = 0,
    /// Slot holds the log file currently being written.
    Current = 1,
    /// Slot holds a full log file awaiting archive.
    Full = 2,
    /// Slot contents are damaged.
    Invalid = 3,
}

impl FileStatus {
    fn from_u16(v: u16) -> LogResult<Self> {
        match v {
            0 => Ok(Self::Unused),
            1 => Ok(Self::Current),
            2 => Ok(Self::Full),
            3 => Ok(Self::Invalid),
            _ => Err(LogError::anchor_corrupt(format!("bad file status {}", v))),
        }
    }
}

/// One log group: a directory of pre-allocated online log files.
#[derive(Debug, Clone)]
pub struct LogGroup {
    /// Single-character group id, stored in every file header.
    pub id: char,
    /// Fully qualified paths of the group's online files.
    pub files: Vec<String>,
}

impl LogGroup {
    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u16(self.id as u16);
        buf.put_u16(self.files.len() as u16);
        for f in &self.files {
            put_string(buf, f);
        }
    }

    fn decode(buf: &mut impl Buf) -> LogResult<Self> {
        let id = char::from_u32(u32::from(buf.get_u16()))
            .ok_or_else(|| LogError::anchor_corrupt("bad group id"))?;
        let n = buf.get_u16() as usize;
        let mut files = Vec::with_capacity(n);
        for _ in 0..n {
            files.push(get_string(buf)?);
        }
        Ok(Self { id, files })
    }
}

/// Control information for the log.
#[derive(Debug, Clone)]
pub struct LogAnchor {
    /// Paths of the mirrored control files.
    pub ctl_files: Vec<String>,
    /// Online log groups.
    pub groups: Vec<LogGroup>,
    /// Per-slot file status; indexed by physical file number.
    pub file_status: Vec<FileStatus>,
    /// Logical log index stored in each physical slot (0 when unused).
    pub log_indexes: Vec<u32>,
    /// Whether full files are archived before reuse.
    pub archive_mode: bool,
    /// Directory for archived log files.
    pub archive_path: String,
    /// In-memory log buffer size.
    pub buffer_size: u32,
    /// Online log file size.
    pub file_size: u32,
    /// Physical slot currently being written.
    pub current_file: u16,
    /// Logical index of the current log file.
    pub current_index: u32,
    /// Highest logical index that has been archived.
    pub archived_index: u32,
    /// Next insert position.
    pub current_lsn: Lsn,
    /// LSN of the last record inserted.
    pub max_lsn: Lsn,
    /// LSN of the last durable record.
    pub durable_lsn: Lsn,
    /// Insert position as of the last durable flush.
    pub durable_current_lsn: Lsn,
    /// LSN of the last checkpoint record.
    pub checkpoint_lsn: Lsn,
    /// Oldest LSN that restart recovery may need.
    pub oldest_interesting_lsn: Lsn,
    /// Maximum number of in-flight log buffers.
    pub max_buffers: u32,
    /// Background flush interval in seconds.
    pub flush_interval_secs: u32,
}

impl LogAnchor {
    /// Number of online files per group.
    pub fn files_per_group(&self) -> usize {
        self.file_status.len()
    }

    /// Serialises the anchor body.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(256);
        buf.put_u16(self.ctl_files.len() as u16);
        for f in &self.ctl_files {
            put_string(&mut buf, f);
        }
        buf.put_u16(self.groups.len() as u16);
        for g in &self.groups {
            g.encode(&mut buf);
        }
        buf.put_u16(self.file_status.len() as u16);
        for s in &self.file_status {
            buf.put_u16(*s as u16);
        }
        for i in &self.log_indexes {
            buf.put_u32(*i);
        }
        buf.put_u8(u8::from(self.archive_mode));
        put_string(&mut buf, &self.archive_path);
        buf.put_u32(self.buffer_size);
        buf.put_u32(self.file_size);
        buf.put_u16(self.current_file);
        buf.put_u32(self.current_index);
        buf.put_u32(self.archived_index);
        buf.put_slice(&self.current_lsn.to_be_bytes());
        buf.put_slice(&self.max_lsn.to_be_bytes());
        buf.put_slice(&self.durable_lsn.to_be_bytes());
        buf.put_slice(&self.durable_current_lsn.to_be_bytes());
        buf.put_slice(&self.checkpoint_lsn.to_be_bytes());
        buf.put_slice(&self.oldest_interesting_lsn.to_be_bytes());
        buf.put_u32(self.max_buffers);
        buf.put_u32(self.flush_interval_secs);
        buf
    }

    /// Parses an anchor body.
    pub fn decode(mut buf: &[u8]) -> LogResult<Self> {
        let n_ctl = buf.get_u16() as usize;
        let mut ctl_files = Vec::with_capacity(n_ctl);
        for _ in 0..n_ctl {
            ctl_files.push(get_string(&mut buf)?);
        }
        let n_groups = buf.get_u16() as usize;
        let mut groups = Vec::with_capacity(n_groups);
        for _ in 0..n_groups {
            groups.push(LogGroup::decode(&mut buf)?);
        }
        let n_files = buf.get_u16() as usize;
        let mut file_status = Vec::with_capacity(n_files);
        for _ in 0..n_files {
            file_status.push(FileStatus::from_u16(buf.get_u16())?);
        }
        let mut log_indexes = Vec::with_capacity(n_files);
        for _ in 0..n_files {
            log_indexes.push(buf.get_u32());
        }
        let archive_mode = buf.get_u8() != 0;
        let archive_path = get_string(&mut buf)?;
        let buffer_size = buf.get_u32();
        let file_size = buf.get_u32();
        let current_file = buf.get_u16();
        let current_index = buf.get_u32();
        let archived_index = buf.get_u32();
        let current_lsn = get_lsn(&mut buf);
        let max_lsn = get_lsn(&mut buf);
        let durable_lsn = get_lsn(&mut buf);
        let durable_current_lsn = get_lsn(&mut buf);
        let checkpoint_lsn = get_lsn(&mut buf);
        let oldest_interesting_lsn = get_lsn(&mut buf);
        let max_buffers = buf.get_u32();
        let flush_interval_secs = buf.get_u32();
        Ok(Self {
            ctl_files,
            groups,
            file_status,
            log_indexes,
            archive_mode,
            archive_path,
            buffer_size,
            file_size,
            current_file,
            current_index,
            archived_index,
            current_lsn,
            max_lsn,
            durable_lsn,
            durable_current_lsn,
            checkpoint_lsn,
            oldest_interesting_lsn,
            max_buffers,
            flush_interval_secs,
        })
    }
}

/// Writes the anchor to a control file with the `{length, checksum}`
/// prefix.
pub fn write_anchor(file: &mut File, body: &[u8]) -> LogResult<()> {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    let checksum = u64::from(hasher.finalize());

    let mut head = Vec::with_capacity(12);
    head.put_u32(body.len() as u32);
    head.put_u64(checksum);

    file.seek(SeekFrom::Start(0))?;
    file.write_all(&head)?;
    file.write_all(body)?;
    file.sync_data()?;
    Ok(())
}

/// Reads and validates the anchor from a control file.
pub fn read_anchor(file: &mut File) -> LogResult<LogAnchor> {
    file.seek(SeekFrom::Start(0))?;
    let mut head = [0u8; 12];
    file.read_exact(&mut head)?;
    let mut hb = &head[..];
    let len = hb.get_u32() as usize;
    let checksum = hb.get_u64();

    let mut body = vec![0u8; len];
    file.read_exact(&mut body)?;

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&body);
    if u64::from(hasher.finalize()) != checksum {
        return Err(LogError::anchor_corrupt("checksum mismatch"));
    }
    LogAnchor::decode(&body)
}

fn put_string(buf: &mut impl BufMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

fn get_string(buf: &mut impl Buf) -> LogResult<String> {
    if buf.remaining() < 2 {
        return Err(LogError::anchor_corrupt("truncated string"));
    }
    let n = buf.get_u16() as usize;
    if buf.remaining() < n {
        return Err(LogError::anchor_corrupt("truncated string body"));
    }
    let mut raw = vec![0u8; n];
    buf.copy_to_slice(&mut raw);
    String::from_utf8(raw).map_err(|_| LogError::anchor_corrupt("string is not utf-8"))
}

fn get_lsn(buf: &mut impl Buf) -> Lsn {
    let mut raw = [0u8; 8];
    buf.copy_to_slice(&mut raw);
    Lsn::from_be_bytes(raw)
}
