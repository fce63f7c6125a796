//! Transaction lifecycle and ARIES restart recovery.
//!
//! Transactions are handles owned by the calling thread; the manager
//! keeps only a table of live transaction ids with their first and last
//! LSNs (for checkpointing and recovery). Modules that own log-record
//! payloads register themselves under a module id; the manager
//! dispatches redo and undo through the [`TransactionalModule`] trait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use larch_common::{Lsn, PageId, TxnId};
use larch_storage::page::{Page, PageType};
use larch_storage::{BufferPool, FixHandle};
use larch_wal::LogManager;

use crate::error::{TxnError, TxnResult};
use crate::lock::{LockDuration, LockManager, LockMode, LockName, LockOutcome};
use crate::record::{RecordFlags, TxRecord, TxnPayload, TXN_MODULE_ID};

/// A module that owns a class of log records: it can reapply them to a
/// page and, for undoable records, roll their effect back (emitting a
/// compensation record in the process).
pub trait TransactionalModule: Send + Sync {
    /// Reapplies a record to one of its pages. The page id is passed
    /// explicitly: a never-written page reads back zero-filled and
    /// cannot identify itself.
    fn redo(&self, page_id: PageId, page: &mut Page, record: &TxRecord) -> TxnResult<()>;

    /// Rolls an undoable record back, emitting a CLR through `txn`.
    fn undo(&self, txn: &mut Transaction, record: &TxRecord) -> TxnResult<()>;

    /// Pages a redoable record applies to; the primary page by default.
    fn page_ids(&self, record: &TxRecord) -> TxnResult<Vec<PageId>> {
        Ok(vec![record.page_id])
    }
}

/// State of a transaction handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Operations allowed.
    Active,
    /// Commit record forced to disk.
    Committed,
    /// Rolled back to completion.
    Aborted,
}

/// A savepoint: a position in the transaction's log chain plus a mark
/// into its lock list.
#[derive(Debug, Clone, Copy)]
pub struct Savepoint {
    lsn: Lsn,
    lock_mark: usize,
}

#[derive(Debug, Clone, Copy)]
struct TxnTableEntry {
    first_lsn: Lsn,
    last_lsn: Lsn,
}

/// Transaction manager configuration.
#[derive(Debug, Clone, Default)]
pub struct TransactionManagerConfig {}

/// Transaction manager statistics.
#[derive(Debug, Default)]
pub struct TxnStats {
    /// Transactions started.
    pub started: AtomicU64,
    /// Transactions committed.
    pub committed: AtomicU64,
    /// Transactions aborted (including recovery losers).
    pub aborted: AtomicU64,
}

/// Coordinates transactions, modules, and restart recovery.
pub struct TransactionManager {
    log: Arc<LogManager>,
    pool: Arc<BufferPool>,
    locks: Arc<LockManager>,
    modules: RwLock<HashMap<u8, Arc<dyn TransactionalModule>>>,
    txn_table: Mutex<HashMap<TxnId, TxnTableEntry>>,
    next_txn_id: AtomicU64,
    stats: TxnStats,
}

impl TransactionManager {
    /// Creates a manager over the given log, buffer pool, and locks.
    pub fn new(
        log: Arc<LogManager>,
        pool: Arc<BufferPool>,
        locks: Arc<LockManager>,
        _config: TransactionManagerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            log,
            pool,
            locks,
            modules: RwLock::new(HashMap::new()),
            txn_table: Mutex::new(HashMap::new()),
            next_txn_id: AtomicU64::new(TxnId::FIRST.as_u64()),
            stats: TxnStats::default(),
        })
    }

    /// Registers a module under its id.
    pub fn register_module(&self, module_id: u8, module: Arc<dyn TransactionalModule>) {
        self.modules.write().insert(module_id, module);
    }

    fn module(&self, module_id: u8) -> TxnResult<Arc<dyn TransactionalModule>> {
        self.modules
            .read()
            .get(&module_id)
            .cloned()
            .ok_or(TxnError::UnknownModule { module_id })
    }

    /// Starts a new transaction.
    pub fn begin(self: &Arc<Self>) -> Transaction {
        let id = TxnId::new(self.next_txn_id.fetch_add(1, Ordering::SeqCst));
        self.txn_table.lock().insert(
            id,
            TxnTableEntry {
                first_lsn: Lsn::NULL,
                last_lsn: Lsn::NULL,
            },
        );
        self.stats.started.fetch_add(1, Ordering::Relaxed);
        Transaction {
            id,
            mgr: Arc::clone(self),
            state: TransactionState::Active,
            first_lsn: Lsn::NULL,
            last_lsn: Lsn::NULL,
            locks: Vec::new(),
        }
    }

    /// Reads a transactional record back from the log.
    pub fn read_record(&self, lsn: Lsn) -> TxnResult<TxRecord> {
        let raw = self.log.read(lsn)?;
        TxRecord::decode(lsn, &raw.data)
    }

    /// The buffer pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// The log manager.
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }

    /// The lock manager.
    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Statistics.
    pub fn stats(&self) -> &TxnStats {
        &self.stats
    }

    /// Number of live transactions.
    pub fn active_count(&self) -> usize {
        self.txn_table.lock().len()
    }

    /// Takes a checkpoint: logs the active-transaction table and the
    /// dirty-page table, then records the checkpoint LSN and the oldest
    /// interesting LSN in the log anchor.
    pub fn checkpoint(&self) -> TxnResult<Lsn> {
        let active: Vec<(TxnId, Lsn, Lsn)> = self
            .txn_table
            .lock()
            .iter()
            .map(|(id, e)| (*id, e.first_lsn, e.last_lsn))
            .collect();
        let dirty = self.pool.dirty_pages();

        let record = TxRecord::new(
            TXN_MODULE_ID,
            RecordFlags::empty(),
            PageId::NULL,
            TxnPayload::Checkpoint {
                active: active.clone(),
                dirty: dirty.clone(),
            }
            .encode(),
        );
        let lsn = self.log.insert(&record.encode())?;
        self.log.flush(Some(lsn))?;

        let mut oldest = lsn;
        for (_, first, _) in &active {
            if first.is_valid() && *first < oldest {
                oldest = *first;
            }
        }
        for (_, recovery) in &dirty {
            if recovery.is_valid() && *recovery < oldest {
                oldest = *recovery;
            }
        }
        self.log.set_checkpoint_lsn(lsn, oldest);
        self.log.flush(None)?;
        debug!(%lsn, %oldest, "checkpoint taken");
        Ok(lsn)
    }

    /// ARIES restart recovery: analysis, redo, undo.
    pub fn recover(self: &Arc<Self>) -> TxnResult<()> {
        let (losers, dirty_pages, max_txn_id) = self.analysis_pass()?;
        info!(
            losers = losers.len(),
            dirty_pages = dirty_pages.len(),
            "recovery analysis complete"
        );
        self.redo_pass(&dirty_pages)?;
        self.undo_pass(&losers, max_txn_id)?;
        self.checkpoint()?;
        Ok(())
    }

    /// Reconstructs the active-transaction table and dirty-page table
    /// by reading forward from the last checkpoint.
    #[allow(clippy::type_complexity)]
    fn analysis_pass(
        &self,
    ) -> TxnResult<(HashMap<TxnId, TxnTableEntry>, HashMap<PageId, Lsn>, u64)> {
        let mut active: HashMap<TxnId, TxnTableEntry> = HashMap::new();
        let mut dirty: HashMap<PageId, Lsn> = HashMap::new();
        let mut max_txn_id = 0u64;

        let checkpoint = self.log.checkpoint_lsn();
        let start = if checkpoint.is_valid() {
            let rec = self.read_record(checkpoint)?;
            if let TxnPayload::Checkpoint {
                active: ckpt_active,
                dirty: ckpt_dirty,
            } = TxnPayload::decode(&rec.payload)?
            {
                for (id, first, last) in ckpt_active {
                    max_txn_id = max_txn_id.max(id.as_u64());
                    active.insert(
                        id,
                        TxnTableEntry {
                            first_lsn: first,
                            last_lsn: last,
                        },
                    );
                }
                for (page, lsn) in ckpt_dirty {
                    dirty.insert(page, lsn);
                }
            }
            Some(checkpoint)
        } else {
            None
        };

        for raw in self.log.forward_scan(start) {
            let raw = raw?;
            let rec = TxRecord::decode(raw.lsn, &raw.data)?;
            max_txn_id = max_txn_id.max(rec.txn_id.as_u64());

            if rec.module_id == TXN_MODULE_ID {
                match TxnPayload::decode(&rec.payload)? {
                    TxnPayload::Commit | TxnPayload::Abort => {
                        active.remove(&rec.txn_id);
                    }
                    TxnPayload::Checkpoint { .. } => {}
                }
                continue;
            }

            let entry = active.entry(rec.txn_id).or_insert(TxnTableEntry {
                first_lsn: rec.lsn,
                last_lsn: rec.lsn,
            });
            entry.last_lsn = rec.lsn;

            if rec.is_redoable() {
                let module = self.module(rec.module_id)?;
                for page_id in module.page_ids(&rec)? {
                    dirty.entry(page_id).or_insert(rec.lsn);
                }
            }
        }
        Ok((active, dirty, max_txn_id))
    }

    /// Repeats history: replays every redoable record whose page's LSN
    /// is strictly older, each declared page independently.
    fn redo_pass(&self, dirty: &HashMap<PageId, Lsn>) -> TxnResult<()> {
        let Some(redo_start) = dirty.values().min().copied() else {
            return Ok(());
        };
        for raw in self.log.forward_scan(Some(redo_start)) {
            let raw = raw?;
            let rec = TxRecord::decode(raw.lsn, &raw.data)?;
            if !rec.is_redoable() {
                continue;
            }
            let module = self.module(rec.module_id)?;
            for page_id in module.page_ids(&rec)? {
                match dirty.get(&page_id) {
                    Some(recovery_lsn) if rec.lsn >= *recovery_lsn => {}
                    _ => continue,
                }
                if !self.pool.containers().exists(page_id.container_id()) {
                    warn!(%page_id, "skipping redo for missing container");
                    continue;
                }
                let mut fix = self.pool.fix_exclusive(page_id, false, PageType::Slotted)?;
                if fix.page_lsn() < rec.lsn {
                    module.redo(page_id, fix.page_mut(), &rec)?;
                    fix.page_mut().set_page_lsn(rec.lsn);
                    fix.set_dirty(rec.lsn);
                }
            }
        }
        Ok(())
    }

    /// Rolls every loser transaction back, emitting CLRs, and ends each
    /// with an abort record.
    fn undo_pass(
        self: &Arc<Self>,
        losers: &HashMap<TxnId, TxnTableEntry>,
        max_txn_id: u64,
    ) -> TxnResult<()> {
        self.next_txn_id
            .fetch_max(max_txn_id + 1, Ordering::SeqCst);

        for (id, entry) in losers {
            debug!(txn = %id, "rolling back loser transaction");
            self.txn_table.lock().insert(*id, *entry);
            let mut txn = Transaction {
                id: *id,
                mgr: Arc::clone(self),
                state: TransactionState::Active,
                first_lsn: entry.first_lsn,
                last_lsn: entry.last_lsn,
                locks: Vec::new(),
            };
            txn.abort()?;
        }
        Ok(())
    }

    fn note_logged(&self, txn_id: TxnId, lsn: Lsn) {
        if let Some(entry) = self.txn_table.lock().get_mut(&txn_id) {
            if entry.first_lsn.is_null() {
                entry.first_lsn = lsn;
            }
            entry.last_lsn = lsn;
        }
    }

    fn finish(&self, txn_id: TxnId, state: TransactionState) {
        self.locks.release_all(txn_id);
        self.txn_table.lock().remove(&txn_id);
        match state {
            TransactionState::Committed => {
                self.stats.committed.fetch_add(1, Ordering::Relaxed);
            }
            TransactionState::Aborted => {
                self.stats.aborted.fetch_add(1, Ordering::Relaxed);
            }
            TransactionState::Active => {}
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active", &self.active_count())
            .finish()
    }
}

/// A live transaction handle.
pub struct Transaction {
    id: TxnId,
    mgr: Arc<TransactionManager>,
    state: TransactionState,
    first_lsn: Lsn,
    last_lsn: Lsn,
    /// Held locks in acquisition order, with their durations.
    locks: Vec<(LockName, LockDuration)>,
}

impl Transaction {
    /// The transaction id.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// The owning manager.
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.mgr
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// LSN of the transaction's most recent log record.
    pub fn last_lsn(&self) -> Lsn {
        self.last_lsn
    }

    fn check_active(&self) -> TxnResult<()> {
        if self.state != TransactionState::Active {
            return Err(TxnError::NotActive { txn_id: self.id });
        }
        Ok(())
    }

    /// Appends a record to the log on this transaction's chain. The
    /// record's previous-LSN is stamped from the chain; when a page
    /// handle is supplied, the page's LSN is set to the new record's.
    ///
    /// For compensation records the caller sets `undo_next_lsn` before
    /// calling; starting a nested top action means remembering
    /// [`last_lsn`](Self::last_lsn) and sealing the action with a CLR
    /// whose undo-next points there.
    pub fn log_insert(
        &mut self,
        page: Option<&mut FixHandle>,
        record: &mut TxRecord,
    ) -> TxnResult<Lsn> {
        self.check_active()?;
        record.txn_id = self.id;
        record.prev_lsn = self.last_lsn;
        let lsn = self.mgr.log.insert(&record.encode())?;
        record.lsn = lsn;
        if self.first_lsn.is_null() {
            self.first_lsn = lsn;
        }
        self.last_lsn = lsn;
        self.mgr.note_logged(self.id, lsn);
        if let Some(page) = page {
            page.page_mut().set_page_lsn(lsn);
        }
        Ok(lsn)
    }

    /// Conditionally acquires a lock; returns false instead of waiting.
    pub fn try_acquire_lock(
        &mut self,
        name: &LockName,
        mode: LockMode,
        duration: LockDuration,
    ) -> bool {
        let granted = self.mgr.locks.try_lock(self.id, name, mode, duration);
        if granted && duration != LockDuration::Instant {
            self.locks.push((name.clone(), duration));
        }
        granted
    }

    /// Acquires a lock, waiting if necessary. Deadlock or timeout is
    /// surfaced as an error; callers typically roll the transaction
    /// back.
    pub fn acquire_lock(
        &mut self,
        name: &LockName,
        mode: LockMode,
        duration: LockDuration,
    ) -> TxnResult<()> {
        match self.mgr.locks.lock(self.id, name, mode, duration) {
            LockOutcome::Granted => {
                if duration != LockDuration::Instant {
                    self.locks.push((name.clone(), duration));
                }
                Ok(())
            }
            LockOutcome::Deadlock => Err(TxnError::Deadlock { txn_id: self.id }),
            LockOutcome::Timeout => Err(TxnError::LockTimeout { txn_id: self.id }),
        }
    }

    /// Releases one manual-duration lock early.
    pub fn release_lock(&mut self, name: &LockName) {
        if let Some(pos) = self
            .locks
            .iter()
            .rposition(|(n, d)| n == name && *d == LockDuration::Manual)
        {
            self.locks.remove(pos);
            self.mgr.locks.unlock(self.id, name);
        }
    }

    /// Creates a savepoint at the current position.
    pub fn create_savepoint(&self) -> Savepoint {
        Savepoint {
            lsn: self.last_lsn,
            lock_mark: self.locks.len(),
        }
    }

    /// Rolls back to a savepoint: undoes records logged after it and
    /// releases manual-duration locks acquired after it.
    pub fn rollback_to(&mut self, savepoint: &Savepoint) -> TxnResult<()> {
        self.check_active()?;
        self.do_rollback(savepoint.lsn)?;
        let tail = self.locks.split_off(savepoint.lock_mark.min(self.locks.len()));
        for (name, duration) in tail {
            if duration == LockDuration::Manual {
                self.mgr.locks.unlock(self.id, &name);
            } else {
                self.locks.push((name, duration));
            }
        }
        Ok(())
    }

    /// Commits: forces the log up to the commit record, then releases
    /// all locks.
    pub fn commit(mut self) -> TxnResult<()> {
        self.check_active()?;
        let mut record = TxRecord::new(
            TXN_MODULE_ID,
            RecordFlags::empty(),
            PageId::NULL,
            TxnPayload::Commit.encode(),
        );
        let lsn = self.log_insert(None, &mut record)?;
        self.mgr.log.flush(Some(lsn))?;
        self.state = TransactionState::Committed;
        self.mgr.finish(self.id, TransactionState::Committed);
        Ok(())
    }

    /// Aborts: walks the chain backwards emitting CLRs, writes the
    /// abort record, and releases all locks.
    pub fn abort(&mut self) -> TxnResult<()> {
        self.check_active()?;
        self.do_rollback(Lsn::NULL)?;
        let mut record = TxRecord::new(
            TXN_MODULE_ID,
            RecordFlags::empty(),
            PageId::NULL,
            TxnPayload::Abort.encode(),
        );
        self.log_insert(None, &mut record)?;
        self.state = TransactionState::Aborted;
        self.mgr.finish(self.id, TransactionState::Aborted);
        Ok(())
    }

    /// Undo walk: follows the chain from the last record down to (not
    /// including) `upto`. Compensation records are skipped over via
    /// their undo-next pointer, so a completed nested top action is
    /// never individually undone.
    fn do_rollback(&mut self, upto: Lsn) -> TxnResult<()> {
        let mut lsn = self.last_lsn;
        while lsn.is_valid() && (upto.is_null() || lsn > upto) {
            let record = self.mgr.read_record(lsn)?;
            if record.is_clr() {
                lsn = record.undo_next_lsn;
                continue;
            }
            if record.is_undoable() {
                let module = self.mgr.module(record.module_id)?;
                module.undo(self, &record)?;
            }
            lsn = record.prev_lsn;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("last_lsn", &self.last_lsn)
            .field("locks", &self.locks.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Buf, BufMut, Bytes};
    use larch_common::PageNumber;
    use larch_storage::{BufferPoolConfig, ContainerManager};
    use larch_wal::LogConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Test module: slot zero of a page holds a single value; records
    /// carry the old and new values so the change is undoable.
    struct SlotZero {
        pool: Arc<BufferPool>,
    }

    const SLOT_ZERO_MODULE: u8 = 9;

    fn encode_change(old: &[u8], new: &[u8]) -> Bytes {
        let mut buf = Vec::new();
        buf.put_u16(old.len() as u16);
        buf.put_slice(old);
        buf.put_u16(new.len() as u16);
        buf.put_slice(new);
        Bytes::from(buf)
    }

    fn decode_change(mut data: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let n = data.get_u16() as usize;
        let old = data[..n].to_vec();
        data.advance(n);
        let n = data.get_u16() as usize;
        let new = data[..n].to_vec();
        (old, new)
    }

    impl SlotZero {
        fn set(
            &self,
            txn: &mut Transaction,
            page_id: PageId,
            new: &[u8],
        ) -> TxnResult<()> {
            let mut fix = self.pool.fix_exclusive(page_id, false, PageType::Slotted)?;
            if fix.page().slot_count() == 0 {
                fix.page_mut().format(page_id.page_number(), PageType::Slotted);
            }
            let old = fix.page().slot(0).unwrap_or(b"").to_vec();
            let mut record = TxRecord::new(
                SLOT_ZERO_MODULE,
                RecordFlags::REDO | RecordFlags::UNDO,
                page_id,
                encode_change(&old, new),
            );
            let lsn = txn.log_insert(Some(&mut fix), &mut record)?;
            self.redo(page_id, fix.page_mut(), &record)?;
            fix.set_dirty(lsn);
            Ok(())
        }

        fn get(&self, page_id: PageId) -> TxnResult<Vec<u8>> {
            let fix = self.pool.fix_shared(page_id)?;
            Ok(fix.page().slot(0).unwrap_or(b"").to_vec())
        }
    }

    impl TransactionalModule for SlotZero {
        fn redo(&self, _page_id: PageId, page: &mut Page, record: &TxRecord) -> TxnResult<()> {
            let (_, new) = decode_change(&record.payload);
            page.insert_at(0, &new, true);
            Ok(())
        }

        fn undo(&self, txn: &mut Transaction, record: &TxRecord) -> TxnResult<()> {
            let (old, new) = decode_change(&record.payload);
            let mut fix = self
                .pool
                .fix_exclusive(record.page_id, false, PageType::Slotted)?;
            let mut clr = TxRecord::new(
                SLOT_ZERO_MODULE,
                RecordFlags::REDO | RecordFlags::CLR,
                record.page_id,
                encode_change(&new, &old),
            );
            clr.undo_next_lsn = record.prev_lsn;
            let lsn = txn.log_insert(Some(&mut fix), &mut clr)?;
            self.redo(record.page_id, fix.page_mut(), &clr)?;
            fix.set_dirty(lsn);
            Ok(())
        }
    }

    struct Harness {
        log: Arc<LogManager>,
        mgr: Arc<TransactionManager>,
        module: Arc<SlotZero>,
    }

    fn open(dir: &std::path::Path) -> Harness {
        let log = LogManager::open(
            LogConfig::within(dir.join("log"))
                .with_file_size(256 * 1024)
                .with_buffer_size(16 * 1024)
                .with_flush_interval(Duration::from_secs(60)),
        )
        .unwrap();
        let containers = Arc::new(ContainerManager::open(dir.join("data"), 512).unwrap());
        if !containers.exists(1) {
            containers.create_container(1, "slots").unwrap();
        }
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig {
                num_frames: 16,
                page_size: 512,
            },
            containers,
            Arc::clone(&log),
        ));
        let mgr = TransactionManager::new(
            Arc::clone(&log),
            Arc::clone(&pool),
            Arc::new(LockManager::new()),
            TransactionManagerConfig::default(),
        );
        let module = Arc::new(SlotZero { pool });
        mgr.register_module(SLOT_ZERO_MODULE, Arc::clone(&module) as _);
        Harness { log, mgr, module }
    }

    fn pid(n: u32) -> PageId {
        PageId::new(1, PageNumber::new(n))
    }

    #[test]
    fn test_commit_forces_log() {
        let tmp = TempDir::new().unwrap();
        let h = open(tmp.path());

        let mut txn = h.mgr.begin();
        h.module.set(&mut txn, pid(0), b"committed").unwrap();
        let last = txn.last_lsn();
        txn.commit().unwrap();
        assert!(h.log.durable_lsn() > last);
        assert_eq!(h.module.get(pid(0)).unwrap(), b"committed");
        h.log.shutdown();
    }

    #[test]
    fn test_abort_restores_old_value() {
        let tmp = TempDir::new().unwrap();
        let h = open(tmp.path());

        let mut txn = h.mgr.begin();
        h.module.set(&mut txn, pid(0), b"first").unwrap();
        txn.commit().unwrap();

        let mut txn = h.mgr.begin();
        h.module.set(&mut txn, pid(0), b"second").unwrap();
        assert_eq!(h.module.get(pid(0)).unwrap(), b"second");
        txn.abort().unwrap();
        assert_eq!(h.module.get(pid(0)).unwrap(), b"first");
        h.log.shutdown();
    }

    #[test]
    fn test_savepoint_partial_rollback() {
        let tmp = TempDir::new().unwrap();
        let h = open(tmp.path());

        let mut txn = h.mgr.begin();
        h.module.set(&mut txn, pid(0), b"keep").unwrap();
        let sp = txn.create_savepoint();
        h.module.set(&mut txn, pid(0), b"discard").unwrap();
        h.module.set(&mut txn, pid(1), b"also-discard").unwrap();
        txn.rollback_to(&sp).unwrap();
        assert_eq!(h.module.get(pid(0)).unwrap(), b"keep");
        assert_eq!(h.module.get(pid(1)).unwrap(), b"");
        txn.commit().unwrap();
        assert_eq!(h.module.get(pid(0)).unwrap(), b"keep");
        h.log.shutdown();
    }

    #[test]
    fn test_prev_lsn_chain() {
        let tmp = TempDir::new().unwrap();
        let h = open(tmp.path());

        let mut txn = h.mgr.begin();
        h.module.set(&mut txn, pid(0), b"a").unwrap();
        let first = txn.last_lsn();
        h.module.set(&mut txn, pid(0), b"b").unwrap();
        let second = txn.last_lsn();
        h.log.flush(None).unwrap();

        let rec = h.mgr.read_record(second).unwrap();
        assert_eq!(rec.prev_lsn, first);
        let rec = h.mgr.read_record(first).unwrap();
        assert!(rec.prev_lsn.is_null());
        txn.commit().unwrap();
        h.log.shutdown();
    }

    #[test]
    fn test_recovery_redoes_committed_and_undoes_losers() {
        let tmp = TempDir::new().unwrap();
        {
            let h = open(tmp.path());
            // Committed change.
            let mut txn = h.mgr.begin();
            h.module.set(&mut txn, pid(0), b"survives").unwrap();
            txn.commit().unwrap();
            // In-flight change, lost at the crash.
            let mut txn = h.mgr.begin();
            h.module.set(&mut txn, pid(0), b"vanishes").unwrap();
            h.log.flush(None).unwrap();
            // Crash: no buffer flush, no clean shutdown.
            h.log.halt();
        }
        {
            let h = open(tmp.path());
            h.mgr.recover().unwrap();
            assert_eq!(h.module.get(pid(0)).unwrap(), b"survives");
            assert_eq!(h.mgr.active_count(), 0);
            h.log.shutdown();
        }
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        {
            let h = open(tmp.path());
            let mut txn = h.mgr.begin();
            h.module.set(&mut txn, pid(0), b"stable").unwrap();
            txn.commit().unwrap();
            h.log.halt();
        }
        for _ in 0..2 {
            let h = open(tmp.path());
            h.mgr.recover().unwrap();
            assert_eq!(h.module.get(pid(0)).unwrap(), b"stable");
            h.log.shutdown();
        }
    }

    #[test]
    fn test_nested_top_action_survives_abort() {
        let tmp = TempDir::new().unwrap();
        let h = open(tmp.path());

        let mut txn = h.mgr.begin();
        h.module.set(&mut txn, pid(0), b"before").unwrap();

        // Nested top action: a change sealed by a CLR pointing back to
        // the action's start survives the transaction's rollback.
        let mark = txn.last_lsn();
        {
            let mut fix = h
                .mgr
                .pool()
                .fix_exclusive(pid(1), false, PageType::Slotted)
                .unwrap();
            fix.page_mut().format(PageNumber::new(1), PageType::Slotted);
            let mut record = TxRecord::new(
                SLOT_ZERO_MODULE,
                RecordFlags::REDO | RecordFlags::CLR,
                pid(1),
                encode_change(b"", b"nested"),
            );
            record.undo_next_lsn = mark;
            let lsn = txn.log_insert(Some(&mut fix), &mut record).unwrap();
            fix.page_mut().insert_at(0, b"nested", true);
            fix.set_dirty(lsn);
        }
        h.module.set(&mut txn, pid(0), b"after").unwrap();
        txn.abort().unwrap();

        // The plain updates rolled back; the nested top action did not.
        assert_eq!(h.module.get(pid(0)).unwrap(), b"");
        assert_eq!(h.module.get(pid(1)).unwrap(), b"nested");
        h.log.shutdown();
    }
}
