//! The log manager.
//!
//! Physically the log is a ring of pre-allocated online files per group.
//! Records are buffered in memory and flushed in large chunks, group by
//! group. When the current file fills up it is handed to the archiver
//! and the next unused file takes its place (a "log switch"). Control
//! information lives in the anchor, mirrored across the control files.
//!
//! Lock order, when more than one is needed:
//! flush | archive → buffer → anchor → anchor-write. The per-file read
//! locks are acquired by readers with `try_lock` because the archiver
//! takes them in the opposite order.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Buf;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info};

use larch_common::constants::{LOG_FILE_HEADER_SIZE, LOG_RECORD_OVERHEAD};
use larch_common::Lsn;

use crate::anchor::{self, FileStatus, LogAnchor, LogGroup};
use crate::buffer::LogBuffer;
use crate::config::{LogConfig, LOG_GROUP_IDS};
use crate::error::{LogError, LogResult};
use crate::reader::{BackwardLogReader, ForwardLogReader};
use crate::record::{self, LogFileHeader, LogRecord};

/// The first valid LSN: file index 1, first byte after the file header.
pub const FIRST_LSN: Lsn = Lsn::new(1, LOG_FILE_HEADER_SIZE as u32);

/// LSN of the record following one of `stored_length` bytes at `lsn`.
pub fn advance_to_next_record(lsn: Lsn, stored_length: usize) -> Lsn {
    Lsn::new(lsn.index(), lsn.offset() + stored_length as u32)
}

/// LSN of the first record in the log file after `lsn`'s.
pub fn advance_to_next_file(lsn: Lsn) -> Lsn {
    Lsn::new(lsn.index() + 1, FIRST_LSN.offset())
}

/// Log manager statistics.
#[derive(Debug, Default)]
pub struct LogStats {
    /// Records inserted.
    pub inserts: AtomicU64,
    /// Flush passes completed.
    pub flushes: AtomicU64,
    /// Log switches performed.
    pub switches: AtomicU64,
    /// Files archived.
    pub archives: AtomicU64,
}

/// In-flight log buffers; the active buffer is the last one.
struct Buffers {
    list: Vec<LogBuffer>,
}

/// A pending write of a contiguous run of records to one log file.
struct WriteRequest {
    log_index: u32,
    offset: u64,
    bytes: Vec<u8>,
}

/// Request to archive one full online file.
struct ArchiveRequest {
    file_no: usize,
    log_index: u32,
}

/// Counting semaphore mediating the log switch against the archiver.
struct Semaphore {
    permits: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cond: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cond.wait(&mut permits);
        }
        *permits -= 1;
    }

    fn release(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cond.notify_one();
    }
}

/// The write-ahead log manager.
pub struct LogManager {
    config: LogConfig,

    flush_lock: Mutex<()>,
    archive_lock: Mutex<()>,
    buffers: Mutex<Buffers>,
    buffers_available: Condvar,
    anchor: Mutex<LogAnchor>,
    anchor_write_lock: Mutex<()>,
    read_locks: Vec<Mutex<()>>,

    /// Online file handles, `[group][slot]`. Fixed at open.
    files: Vec<Vec<Mutex<File>>>,
    ctl_files: Mutex<Vec<File>>,

    /// Free online file slots; acquired on switch, released by the
    /// archiver.
    free_files: Semaphore,

    anchor_dirty: AtomicBool,
    started: AtomicBool,
    errored: AtomicBool,
    shutting_down: AtomicBool,

    /// Wakes the periodic workers out of their interval sleep.
    daemon_gate: Mutex<bool>,
    daemon_cond: Condvar,

    background_errors: Mutex<Vec<LogError>>,
    archive_tx: Mutex<Option<Sender<ArchiveRequest>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,

    stats: LogStats,
}

impl LogManager {
    /// Opens the log, creating it when no control file exists yet, and
    /// starts the background workers.
    ///
    /// At startup the true end of log is re-located by scanning forward
    /// from the recorded durable LSN, because the control files are not
    /// rewritten on every flush.
    pub fn open(config: LogConfig) -> LogResult<Arc<Self>> {
        config.validate()?;

        for path in &config.group_paths {
            fs::create_dir_all(path)?;
        }
        fs::create_dir_all(&config.archive_path)?;
        for ctl in &config.ctl_files {
            if let Some(parent) = ctl.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)?;
                }
            }
        }

        let fresh = !config.ctl_files[0].exists();
        if fresh {
            Self::create_on_disk(&config)?;
        }

        // Open control files and read the anchor from the first one.
        let mut ctl_handles = Vec::with_capacity(config.ctl_files.len());
        for path in &config.ctl_files {
            ctl_handles.push(File::options().read(true).write(true).open(path)?);
        }
        let mut anchor = anchor::read_anchor(&mut ctl_handles[0])?;
        anchor.max_lsn = anchor.durable_lsn;
        anchor.current_lsn = anchor.durable_current_lsn;

        // Open online files, validating headers of slots in use.
        let n_groups = anchor.groups.len();
        let n_files = anchor.files_per_group();
        let mut files = Vec::with_capacity(n_groups);
        for (g, group) in anchor.groups.iter().enumerate() {
            let mut handles = Vec::with_capacity(n_files);
            for (slot, path) in group.files.iter().enumerate() {
                let mut file = File::options().read(true).write(true).open(path)?;
                if anchor.file_status[slot] != FileStatus::Unused {
                    let mut raw = [0u8; LogFileHeader::SIZE];
                    file.seek(SeekFrom::Start(0))?;
                    file.read_exact(&mut raw)?;
                    let header = LogFileHeader::decode(&mut raw.as_slice())?;
                    if header.group_id != LOG_GROUP_IDS[g] || header.index != anchor.log_indexes[slot]
                    {
                        return Err(LogError::BadFileHeader { path: path.clone() });
                    }
                }
                handles.push(Mutex::new(file));
            }
            files.push(handles);
        }

        // One permit per spare file; full files consume a permit each.
        let full_count = anchor
            .file_status
            .iter()
            .filter(|s| **s == FileStatus::Full)
            .count();
        let free_files = Semaphore::new(n_files - 1 - full_count);

        let buffer_size = anchor.buffer_size as usize;
        let manager = Arc::new(Self {
            config,
            flush_lock: Mutex::new(()),
            archive_lock: Mutex::new(()),
            buffers: Mutex::new(Buffers {
                list: vec![LogBuffer::new(buffer_size)],
            }),
            buffers_available: Condvar::new(),
            anchor: Mutex::new(anchor),
            anchor_write_lock: Mutex::new(()),
            read_locks: (0..n_files).map(|_| Mutex::new(())).collect(),
            files,
            ctl_files: Mutex::new(ctl_handles),
            free_files,
            anchor_dirty: AtomicBool::new(false),
            started: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
            daemon_gate: Mutex::new(false),
            daemon_cond: Condvar::new(),
            background_errors: Mutex::new(Vec::new()),
            archive_tx: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
            stats: LogStats::default(),
        });

        manager.scan_to_eof()?;
        manager.started.store(true, Ordering::Release);
        manager.spawn_workers();
        info!(fresh, "log manager started");
        Ok(manager)
    }

    /// Creates the on-disk structures for a brand new log.
    fn create_on_disk(config: &LogConfig) -> LogResult<()> {
        let anchor = Self::default_anchor(config);
        for (g, group) in anchor.groups.iter().enumerate() {
            for (slot, path) in group.files.iter().enumerate() {
                let header = LogFileHeader {
                    group_id: LOG_GROUP_IDS[g],
                    index: anchor.log_indexes[slot],
                };
                Self::create_log_file(Path::new(path), config.file_size, header)?;
            }
        }
        let body = anchor.encode();
        for path in &config.ctl_files {
            let mut file = File::options()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?;
            anchor::write_anchor(&mut file, &body)?;
        }
        Ok(())
    }

    fn default_anchor(config: &LogConfig) -> LogAnchor {
        let n_files = config.files_per_group as usize;
        let groups = config
            .group_paths
            .iter()
            .enumerate()
            .map(|(g, _)| LogGroup {
                id: LOG_GROUP_IDS[g],
                files: (0..n_files)
                    .map(|slot| config.online_file_path(g, slot).to_string_lossy().into_owned())
                    .collect(),
            })
            .collect();
        let mut file_status = vec![FileStatus::Unused; n_files];
        let mut log_indexes = vec![0u32; n_files];
        file_status[0] = FileStatus::Current;
        log_indexes[0] = 1;
        LogAnchor {
            ctl_files: config
                .ctl_files
                .iter()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            groups,
            file_status,
            log_indexes,
            archive_mode: config.archive_mode,
            archive_path: config.archive_path.to_string_lossy().into_owned(),
            buffer_size: config.buffer_size as u32,
            file_size: config.file_size as u32,
            current_file: 0,
            current_index: 1,
            archived_index: 0,
            current_lsn: FIRST_LSN,
            max_lsn: Lsn::NULL,
            durable_lsn: Lsn::NULL,
            durable_current_lsn: FIRST_LSN,
            checkpoint_lsn: Lsn::NULL,
            oldest_interesting_lsn: Lsn::NULL,
            max_buffers: config.max_buffers as u32,
            flush_interval_secs: config.flush_interval.as_secs() as u32,
        }
    }

    /// Pre-allocates one online log file with its header.
    fn create_log_file(path: &Path, size: usize, header: LogFileHeader) -> LogResult<()> {
        debug!(?path, "creating log file");
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;
        let mut raw = Vec::with_capacity(LogFileHeader::SIZE);
        header.encode(&mut raw);
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&raw)?;
        file.sync_data()?;
        Ok(())
    }

    fn spawn_workers(self: &Arc<Self>) {
        let (tx, rx) = mpsc::channel::<ArchiveRequest>();
        *self.archive_tx.lock() = Some(tx);

        let mut workers = self.workers.lock();

        let log = Arc::clone(self);
        workers.push(std::thread::spawn(move || log.run_archiver(rx)));

        let log = Arc::clone(self);
        workers.push(std::thread::spawn(move || log.run_flush_daemon()));

        let log = Arc::clone(self);
        workers.push(std::thread::spawn(move || log.run_archive_cleaner()));
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    /// Appends a record, returning its LSN. Blocks only when the number
    /// of in-flight buffers exceeds the configured limit.
    pub fn insert(&self, data: &[u8]) -> LogResult<Lsn> {
        self.check_open()?;
        let reclen = record::stored_length(data.len());
        if reclen > self.max_record_size() {
            return Err(LogError::RecordTooLarge {
                size: reclen,
                max: self.max_record_size(),
            });
        }

        let mut buffers = self.buffers.lock();
        while buffers.list.len() > self.config.max_buffers {
            self.buffers_available.wait(&mut buffers);
        }
        let mut anchor = self.anchor.lock();

        let mut next = advance_to_next_record(anchor.current_lsn, reclen);
        if next.offset() as usize > self.eof_position() {
            // Reserve the file tail for the EOF marker and move on.
            let (eof_lsn, prev) = (anchor.current_lsn, anchor.max_lsn);
            Self::add_to_buffer(&mut buffers, self.config.buffer_size, eof_lsn, &[], prev);
            anchor.max_lsn = eof_lsn;
            anchor.current_lsn = advance_to_next_file(eof_lsn);
            next = advance_to_next_record(anchor.current_lsn, reclen);
        }
        let (lsn, prev) = (anchor.current_lsn, anchor.max_lsn);
        Self::add_to_buffer(&mut buffers, self.config.buffer_size, lsn, data, prev);
        anchor.max_lsn = lsn;
        anchor.current_lsn = next;
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        Ok(lsn)
    }

    fn add_to_buffer(buffers: &mut Buffers, buffer_size: usize, lsn: Lsn, data: &[u8], prev: Lsn) {
        let reclen = record::stored_length(data.len());
        if buffers.list.last().map_or(true, |b| b.remaining() < reclen) {
            buffers.list.push(LogBuffer::new(buffer_size));
        }
        buffers
            .list
            .last_mut()
            .expect("buffer list is never empty")
            .insert(lsn, data, prev);
    }

    /// Forces all records up to `upto` (or everything buffered) to
    /// durable storage of every group.
    pub fn flush(&self, upto: Option<Lsn>) -> LogResult<()> {
        self.check_open()?;
        let _guard = self.flush_lock.lock();
        let result = self.do_flush(upto);
        if result.is_err() {
            self.errored.store(true, Ordering::Release);
        }
        result
    }

    fn do_flush(&self, upto: Option<Lsn>) -> LogResult<()> {
        let mut total_flushed = 0usize;
        let mut done = false;

        while !done {
            let mut requests: Vec<WriteRequest> = Vec::new();
            let mut durable: Option<Lsn> = None;
            let mut delete_front = false;

            {
                let buffers = self.buffers.lock();
                let anchor = self.anchor.lock();
                let front = &buffers.list[0];
                let is_current = buffers.list.len() == 1;
                let mut flushed_all = true;

                for rec in &front.records {
                    if rec.lsn <= anchor.durable_lsn {
                        continue;
                    }
                    if let Some(limit) = upto {
                        if rec.lsn > limit {
                            flushed_all = false;
                            done = true;
                            break;
                        }
                    }
                    let bytes = front.record_bytes(*rec);
                    match requests.last_mut() {
                        Some(req)
                            if req.log_index == rec.lsn.index()
                                && req.offset + req.bytes.len() as u64
                                    == u64::from(rec.lsn.offset()) =>
                        {
                            req.bytes.extend_from_slice(bytes);
                        }
                        _ => requests.push(WriteRequest {
                            log_index: rec.lsn.index(),
                            offset: u64::from(rec.lsn.offset()),
                            bytes: bytes.to_vec(),
                        }),
                    }
                    durable = Some(rec.lsn);
                }
                if flushed_all && !is_current {
                    delete_front = true;
                }
                if is_current {
                    done = true;
                }
            }

            if durable.is_some() || delete_front {
                for req in &requests {
                    total_flushed += 1;
                    self.do_log_write(req)?;
                }
                self.sync_current_files()?;

                let mut buffers = self.buffers.lock();
                if let Some(lsn) = durable {
                    let mut anchor = self.anchor.lock();
                    anchor.durable_lsn = lsn;
                    anchor.durable_current_lsn = lsn;
                }
                if delete_front {
                    buffers.list.remove(0);
                    self.buffers_available.notify_all();
                }
            }
        }

        if total_flushed > 0 || self.anchor_dirty.load(Ordering::Acquire) {
            if self.anchor_dirty.swap(false, Ordering::AcqRel) {
                let body = {
                    let anchor = self.anchor.lock();
                    anchor.encode()
                };
                let _write = self.anchor_write_lock.lock();
                self.write_anchors(&body)?;
            }
        }
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Writes one request to every group, switching log files first when
    /// the request belongs to a newer log index.
    fn do_log_write(&self, req: &WriteRequest) -> LogResult<()> {
        let current_index = self.anchor.lock().current_index;
        if req.log_index != current_index {
            self.log_switch()?;
        }
        let slot = {
            let anchor = self.anchor.lock();
            debug_assert_eq!(anchor.current_index, req.log_index);
            anchor.current_file as usize
        };
        // Groups are written in order; a failed group aborts the rest so
        // damage stays confined to a single group.
        for group in &self.files {
            let mut file = group[slot].lock();
            file.seek(SeekFrom::Start(req.offset))?;
            file.write_all(&req.bytes)?;
        }
        Ok(())
    }

    fn sync_current_files(&self) -> LogResult<()> {
        let slot = self.anchor.lock().current_file as usize;
        for group in &self.files {
            group[slot].lock().sync_data()?;
        }
        Ok(())
    }

    /// Switches to the next online log file. Waits for the archiver when
    /// every spare file is still full.
    fn log_switch(&self) -> LogResult<()> {
        self.sync_current_files()?;

        let request = {
            let mut anchor = self.anchor.lock();
            let slot = anchor.current_file as usize;
            if anchor.file_status[slot] != FileStatus::Current {
                return Err(LogError::anchor_corrupt("log switch on non-current file"));
            }
            anchor.file_status[slot] = FileStatus::Full;
            ArchiveRequest {
                file_no: slot,
                log_index: anchor.current_index,
            }
        };
        debug!(log_index = request.log_index, "log switch");
        if let Some(tx) = self.archive_tx.lock().as_ref() {
            // A send failure means the archiver is gone; the semaphore
            // acquire below would then block forever, so fail now.
            tx.send(request)
                .map_err(|_| LogError::Closed)?;
        }

        self.free_files.acquire();

        let body;
        {
            let mut anchor = self.anchor.lock();
            let n_files = anchor.files_per_group();
            let mut next = anchor.current_file as usize;
            loop {
                next = (next + 1) % n_files;
                if anchor.file_status[next] == FileStatus::Unused
                    || next == anchor.current_file as usize
                {
                    break;
                }
            }
            if anchor.file_status[next] != FileStatus::Unused {
                return Err(LogError::anchor_corrupt("no unused log file after switch"));
            }
            anchor.current_index += 1;
            anchor.file_status[next] = FileStatus::Current;
            anchor.log_indexes[next] = anchor.current_index;
            anchor.current_file = next as u16;
            body = anchor.encode();
        }
        {
            let _write = self.anchor_write_lock.lock();
            self.write_anchors(&body)?;
        }
        self.reset_current_file_header()?;
        self.stats.switches.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reset_current_file_header(&self) -> LogResult<()> {
        let (slot, index) = {
            let anchor = self.anchor.lock();
            (anchor.current_file as usize, anchor.current_index)
        };
        for (g, group) in self.files.iter().enumerate() {
            let header = LogFileHeader {
                group_id: LOG_GROUP_IDS[g],
                index,
            };
            let mut raw = Vec::with_capacity(LogFileHeader::SIZE);
            header.encode(&mut raw);
            let mut file = group[slot].lock();
            file.seek(SeekFrom::Start(0))?;
            file.write_all(&raw)?;
        }
        Ok(())
    }

    fn write_anchors(&self, body: &[u8]) -> LogResult<()> {
        let mut ctl_files = self.ctl_files.lock();
        for file in ctl_files.iter_mut() {
            anchor::write_anchor(file, body)?;
        }
        Ok(())
    }

    /// Reads the record at `lsn` from buffers, online files, or archives.
    pub fn read(&self, lsn: Lsn) -> LogResult<LogRecord> {
        // Buffers first.
        {
            let buffers = self.buffers.lock();
            for buf in &buffers.list {
                if let Some(ptr) = buf.find(lsn) {
                    return record::decode(lsn, buf.record_bytes(ptr));
                }
            }
        }

        loop {
            enum Source {
                Archived,
                Online(usize),
            }
            let source = {
                let anchor = self.anchor.lock();
                if anchor.archived_index > 0 && lsn.index() <= anchor.archived_index {
                    Source::Archived
                } else {
                    let slot = anchor
                        .log_indexes
                        .iter()
                        .position(|idx| *idx == lsn.index())
                        .ok_or(LogError::InvalidLsn { lsn })?;
                    Source::Online(slot)
                }
            };

            match source {
                Source::Archived => {
                    let path = self.config.archive_file_path(lsn.index());
                    let mut file = File::open(path)?;
                    return self.read_record_from(&mut file, lsn);
                }
                Source::Online(slot) => {
                    // The archiver flips statuses under this lock; keep
                    // retrying rather than waiting in the wrong order.
                    match self.read_locks[slot].try_lock() {
                        Some(_guard) => {
                            let mut file = self.files[0][slot].lock();
                            return self.read_record_from(&mut file, lsn);
                        }
                        None => {
                            std::thread::yield_now();
                            continue;
                        }
                    }
                }
            }
        }
    }

    fn read_record_from(&self, file: &mut File, lsn: Lsn) -> LogResult<LogRecord> {
        file.seek(SeekFrom::Start(u64::from(lsn.offset())))?;
        let mut len_raw = [0u8; 4];
        file.read_exact(&mut len_raw)?;
        let reclen = (&len_raw[..]).get_u32() as usize;
        if reclen < LOG_RECORD_OVERHEAD || reclen > self.max_record_size() {
            return Err(LogError::corrupt(lsn, "invalid record length"));
        }
        let mut raw = vec![0u8; reclen];
        raw[..4].copy_from_slice(&len_raw);
        file.read_exact(&mut raw[4..])?;
        record::decode(lsn, &raw)
    }

    /// Lazy forward iterator from `from` (or the start of the log).
    pub fn forward_scan(self: &Arc<Self>, from: Option<Lsn>) -> ForwardLogReader {
        ForwardLogReader::new(Arc::clone(self), from.unwrap_or(FIRST_LSN))
    }

    /// Lazy backward iterator from `from` (or the last durable record).
    pub fn backward_scan(self: &Arc<Self>, from: Option<Lsn>) -> BackwardLogReader {
        let start = from.unwrap_or_else(|| self.durable_lsn());
        BackwardLogReader::new(Arc::clone(self), start)
    }

    /// Records the checkpoint LSN and the oldest LSN restart recovery
    /// may need; the anchor is written out on the next flush.
    pub fn set_checkpoint_lsn(&self, checkpoint: Lsn, oldest_interesting: Lsn) {
        let mut anchor = self.anchor.lock();
        let _write = self.anchor_write_lock.lock();
        anchor.checkpoint_lsn = checkpoint;
        anchor.oldest_interesting_lsn = oldest_interesting;
        self.anchor_dirty.store(true, Ordering::Release);
    }

    /// LSN of the last checkpoint record.
    pub fn checkpoint_lsn(&self) -> Lsn {
        self.anchor.lock().checkpoint_lsn
    }

    /// Oldest LSN restart recovery may need.
    pub fn oldest_interesting_lsn(&self) -> Lsn {
        self.anchor.lock().oldest_interesting_lsn
    }

    /// LSN of the last durable record.
    pub fn durable_lsn(&self) -> Lsn {
        self.anchor.lock().durable_lsn
    }

    /// LSN of the last inserted record.
    pub fn max_lsn(&self) -> Lsn {
        self.anchor.lock().max_lsn
    }

    /// Returns statistics.
    pub fn stats(&self) -> &LogStats {
        &self.stats
    }

    /// Drains errors recorded by the background workers.
    pub fn take_background_errors(&self) -> Vec<LogError> {
        std::mem::take(&mut *self.background_errors.lock())
    }

    /// Stops the workers, performs a final flush, and closes the log.
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.stop_workers(true);
        info!("log manager stopped");
    }

    /// Stops the workers without a final flush, leaving whatever is in
    /// the buffers to be lost. This mimics a hard crash; restart relies
    /// on `scan_to_eof` and recovery.
    pub fn halt(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        self.stop_workers(false);
        info!("log manager halted without flush");
    }

    fn stop_workers(&self, final_flush: bool) {
        self.shutting_down.store(true, Ordering::Release);
        {
            let mut gate = self.daemon_gate.lock();
            *gate = true;
            self.daemon_cond.notify_all();
        }
        if final_flush && !self.errored.load(Ordering::Acquire) {
            let _guard = self.flush_lock.lock();
            if let Err(e) = self.do_flush(None) {
                error!(error = %e, "final log flush failed");
            }
        }
        // Dropping the sender lets the archiver drain and exit.
        self.archive_tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            let _ = handle.join();
        }
    }

    // ------------------------------------------------------------------
    // Background workers
    // ------------------------------------------------------------------

    fn run_flush_daemon(self: Arc<Self>) {
        let interval = self.config.flush_interval;
        loop {
            if self.wait_interval(interval) {
                return;
            }
            if self.errored.load(Ordering::Acquire) {
                continue;
            }
            let guard = self.flush_lock.lock();
            if let Err(e) = self.do_flush(None) {
                drop(guard);
                self.record_background_error(e);
            }
        }
    }

    fn run_archiver(self: Arc<Self>, rx: Receiver<ArchiveRequest>) {
        while let Ok(request) = rx.recv() {
            if let Err(e) = self.handle_archive_request(&request) {
                self.record_background_error(e);
                return;
            }
        }
    }

    fn run_archive_cleaner(self: Arc<Self>) {
        let interval = self.config.flush_interval;
        loop {
            if self.wait_interval(interval) {
                return;
            }
            let oldest = self.oldest_interesting_lsn();
            if oldest.index() <= 1 {
                continue;
            }
            let mut index = oldest.index() - 1;
            while index > 0 {
                let path = self.config.archive_file_path(index);
                if fs::remove_file(&path).is_err() {
                    break;
                }
                debug!(index, "removed archived log file");
                index -= 1;
            }
        }
    }

    /// Sleeps for `interval` or until shutdown; returns true on shutdown.
    fn wait_interval(&self, interval: Duration) -> bool {
        let mut gate = self.daemon_gate.lock();
        if !*gate {
            self.daemon_cond.wait_for(&mut gate, interval);
        }
        *gate
    }

    fn handle_archive_request(&self, request: &ArchiveRequest) -> LogResult<()> {
        let _guard = self.archive_lock.lock();
        debug!(log_index = request.log_index, "archiving log file");

        // Copy the full file to the archive directory.
        let archive_path = self.config.archive_file_path(request.log_index);
        let mut archive = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&archive_path)?;
        {
            let mut src = self.files[0][request.file_no].lock();
            src.seek(SeekFrom::Start(0))?;
            let mut buf = vec![0u8; 8192];
            let mut copied = 0u64;
            loop {
                let n = src.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                archive.write_all(&buf[..n])?;
                copied += n as u64;
            }
            if copied != self.config.file_size as u64 {
                return Err(LogError::anchor_corrupt("archived file size mismatch"));
            }
        }
        archive.sync_data()?;

        // Flip the slot to unused; readers of the old contents are held
        // off by the read lock.
        let body;
        {
            let _read = self.read_locks[request.file_no].lock();
            let mut anchor = self.anchor.lock();
            anchor.archived_index = request.log_index;
            anchor.file_status[request.file_no] = FileStatus::Unused;
            anchor.log_indexes[request.file_no] = 0;
            body = anchor.encode();
        }
        {
            let _write = self.anchor_write_lock.lock();
            self.write_anchors(&body)?;
        }
        self.free_files.release();
        self.stats.archives.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn record_background_error(&self, e: LogError) {
        error!(error = %e, "log background worker failed");
        self.background_errors.lock().push(e);
        self.errored.store(true, Ordering::Release);
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn check_open(&self) -> LogResult<()> {
        if !self.started.load(Ordering::Acquire) || self.errored.load(Ordering::Acquire) {
            return Err(LogError::Closed);
        }
        Ok(())
    }

    /// Last offset a record may end at, leaving room for the EOF marker.
    fn eof_position(&self) -> usize {
        self.config.file_size - LOG_RECORD_OVERHEAD
    }

    /// Largest stored record size: it must fit into a log buffer and
    /// into a single file behind the header.
    fn max_record_size(&self) -> usize {
        let usable = self.config.file_size - LOG_RECORD_OVERHEAD - LOG_FILE_HEADER_SIZE;
        usable.min(self.config.buffer_size)
    }

    /// Re-locates the true end of the log by reading forward from the
    /// recorded durable LSN until a record fails to parse. Tolerates a
    /// crash between a log switch and the anchor update.
    fn scan_to_eof(&self) -> LogResult<()> {
        let (mut durable, mut current) = {
            let anchor = self.anchor.lock();
            (anchor.durable_lsn, anchor.durable_current_lsn)
        };
        let mut scan = if durable.is_null() { FIRST_LSN } else { durable };

        loop {
            let rec = match self.read(scan) {
                Ok(rec) => rec,
                // Any parse failure marks the end of the log.
                Err(_) => break,
            };
            durable = scan;
            scan = if rec.is_eof() {
                advance_to_next_file(scan)
            } else {
                advance_to_next_record(scan, rec.stored_length())
            };
            current = scan;
        }

        let body = {
            let mut anchor = self.anchor.lock();
            anchor.durable_lsn = durable;
            anchor.durable_current_lsn = current;
            anchor.current_lsn = current;
            anchor.max_lsn = durable;
            anchor.encode()
        };
        let _write = self.anchor_write_lock.lock();
        self.write_anchors(&body)?;
        Ok(())
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let anchor = self.anchor.lock();
        f.debug_struct("LogManager")
            .field("current_lsn", &anchor.current_lsn)
            .field("durable_lsn", &anchor.durable_lsn)
            .field("current_index", &anchor.current_index)
            .field("errored", &self.errored.load(Ordering::Relaxed))
            .finish()
    }
}
