//! The buffer pool.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use larch_common::{Lsn, PageId};
use larch_wal::LogManager;

use crate::error::{StorageError, StorageResult};
use crate::file::ContainerManager;
use crate::page::{Page, PageType};

use super::frame::BufferFrame;
use super::latch::{FixHandle, LatchMode};

/// Buffer pool configuration.
#[derive(Debug, Clone)]
pub struct BufferPoolConfig {
    /// Number of frames.
    pub num_frames: usize,
    /// Page size in bytes; must match the container manager's.
    pub page_size: usize,
}

impl Default for BufferPoolConfig {
    fn default() -> Self {
        Self {
            num_frames: 256,
            page_size: larch_common::constants::DEFAULT_PAGE_SIZE,
        }
    }
}

/// Page cache with latch-coupled fix handles.
///
/// The WAL rule is enforced here: before a dirty page is written to its
/// container, the log is flushed up to the page's LSN.
pub struct BufferPool {
    config: BufferPoolConfig,
    frames: Vec<Arc<BufferFrame>>,
    /// Page table plus the clock hand, under one lock.
    table: Mutex<TableState>,
    containers: Arc<ContainerManager>,
    log: Arc<LogManager>,
}

struct TableState {
    map: HashMap<PageId, usize>,
    clock_hand: usize,
}

impl BufferPool {
    /// Creates a pool over the given containers and log.
    pub fn new(
        config: BufferPoolConfig,
        containers: Arc<ContainerManager>,
        log: Arc<LogManager>,
    ) -> Self {
        let frames = (0..config.num_frames)
            .map(|i| Arc::new(BufferFrame::new(i, config.page_size)))
            .collect();
        Self {
            config,
            frames,
            table: Mutex::new(TableState {
                map: HashMap::new(),
                clock_hand: 0,
            }),
            containers,
            log,
        }
    }

    /// Fixes a page with a shared latch.
    pub fn fix_shared(&self, page_id: PageId) -> StorageResult<FixHandle> {
        let frame = self.locate_or_load(page_id, false, PageType::Free)?;
        Ok(FixHandle::new(frame, page_id, LatchMode::Shared))
    }

    /// Fixes a page with an update latch.
    pub fn fix_for_update(&self, page_id: PageId) -> StorageResult<FixHandle> {
        let frame = self.locate_or_load(page_id, false, PageType::Free)?;
        Ok(FixHandle::new(frame, page_id, LatchMode::Update))
    }

    /// Fixes a page with the exclusive latch. With `is_new` set the page
    /// is formatted fresh instead of being read from its container.
    pub fn fix_exclusive(
        &self,
        page_id: PageId,
        is_new: bool,
        page_type: PageType,
    ) -> StorageResult<FixHandle> {
        let frame = self.locate_or_load(page_id, is_new, page_type)?;
        Ok(FixHandle::new(frame, page_id, LatchMode::Exclusive))
    }

    /// Finds the page's frame, loading (or freshly formatting) it on a
    /// miss. The returned frame is pinned.
    fn locate_or_load(
        &self,
        page_id: PageId,
        is_new: bool,
        page_type: PageType,
    ) -> StorageResult<Arc<BufferFrame>> {
        let mut table = self.table.lock();
        if let Some(&idx) = table.map.get(&page_id) {
            let frame = Arc::clone(&self.frames[idx]);
            frame.pin();
            frame.meta.lock().referenced = true;
            return Ok(frame);
        }

        let idx = self.find_victim(&mut table)?;
        let frame = Arc::clone(&self.frames[idx]);

        // Evict whatever the frame held.
        {
            let mut meta = frame.meta.lock();
            if meta.page_id.is_valid() {
                table.map.remove(&meta.page_id);
                if meta.dirty {
                    let page = frame.latch.read();
                    self.write_back(meta.page_id, &page)?;
                    meta.dirty = false;
                    meta.recovery_lsn = Lsn::NULL;
                }
                trace!(evicted = %meta.page_id, "buffer eviction");
            }
        }

        let page = if is_new {
            let mut page = Page::new(self.config.page_size);
            page.format(page_id.page_number(), page_type);
            page
        } else {
            self.containers.read_page(page_id)?
        };
        *frame.latch.write() = page;
        {
            let mut meta = frame.meta.lock();
            meta.page_id = page_id;
            meta.dirty = is_new;
            meta.recovery_lsn = Lsn::NULL;
            meta.referenced = true;
        }
        frame.pin();
        table.map.insert(page_id, idx);
        Ok(frame)
    }

    /// Clock sweep over unpinned frames.
    fn find_victim(&self, table: &mut TableState) -> StorageResult<usize> {
        let n = self.frames.len();
        for _ in 0..2 * n {
            let idx = table.clock_hand;
            table.clock_hand = (table.clock_hand + 1) % n;
            let frame = &self.frames[idx];
            if frame.pin_count() != 0 {
                continue;
            }
            let mut meta = frame.meta.lock();
            if meta.referenced {
                meta.referenced = false;
                continue;
            }
            return Ok(idx);
        }
        Err(StorageError::NoFreeFrames)
    }

    /// Flushes the log past the page's LSN, then writes the page.
    fn write_back(&self, page_id: PageId, page: &Page) -> StorageResult<()> {
        let page_lsn = page.page_lsn();
        if page_lsn.is_valid() {
            self.log.flush(Some(page_lsn))?;
        }
        self.containers.write_page(page_id, page)?;
        Ok(())
    }

    /// Oldest first-dirty LSN across the pool; null when nothing is
    /// dirty. Feeds the oldest-interesting LSN computation.
    pub fn min_recovery_lsn(&self) -> Lsn {
        let mut min = Lsn::NULL;
        for frame in &self.frames {
            let meta = frame.meta.lock();
            if meta.dirty && meta.recovery_lsn.is_valid() {
                if min.is_null() || meta.recovery_lsn < min {
                    min = meta.recovery_lsn;
                }
            }
        }
        min
    }

    /// Dirty pages and their first-dirty LSNs, for checkpointing.
    pub fn dirty_pages(&self) -> Vec<(PageId, Lsn)> {
        let mut out = Vec::new();
        for frame in &self.frames {
            let meta = frame.meta.lock();
            if meta.dirty && meta.page_id.is_valid() {
                out.push((meta.page_id, meta.recovery_lsn));
            }
        }
        out
    }

    /// Writes back every dirty page; returns how many were written.
    pub fn flush_all(&self) -> StorageResult<usize> {
        let mut written = 0;
        for frame in &self.frames {
            let page_id = {
                let meta = frame.meta.lock();
                if !meta.dirty || !meta.page_id.is_valid() {
                    continue;
                }
                meta.page_id
            };
            let page = frame.latch.read();
            self.write_back(page_id, &page)?;
            let mut meta = frame.meta.lock();
            meta.dirty = false;
            meta.recovery_lsn = Lsn::NULL;
            written += 1;
        }
        Ok(written)
    }

    /// The configured page size.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// The underlying container manager.
    pub fn containers(&self) -> &Arc<ContainerManager> {
        &self.containers
    }

    /// The log whose records guard these pages.
    pub fn log(&self) -> &Arc<LogManager> {
        &self.log
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("BufferPool")
            .field("frames", &self.frames.len())
            .field("resident", &table.map.len())
            .finish()
    }
}
