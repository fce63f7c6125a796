//! Buffer frames.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use larch_common::{Lsn, PageId};

use crate::page::Page;

/// Book-keeping for one frame, guarded separately from the page latch.
#[derive(Debug)]
pub(crate) struct FrameMeta {
    /// Page cached in this frame; `PageId::NULL` when empty.
    pub page_id: PageId,
    /// Whether the page has unwritten changes.
    pub dirty: bool,
    /// LSN that first dirtied the page since its last write-back.
    pub recovery_lsn: Lsn,
    /// Clock reference bit.
    pub referenced: bool,
}

/// A single buffer pool frame holding one page image.
pub struct BufferFrame {
    frame_id: usize,
    /// The page latch. Shared fixes take read, update fixes take
    /// upgradable read, exclusive fixes take write.
    pub(crate) latch: Arc<RwLock<Page>>,
    pub(crate) meta: Mutex<FrameMeta>,
    pin_count: AtomicUsize,
}

impl BufferFrame {
    /// Creates an empty frame.
    pub fn new(frame_id: usize, page_size: usize) -> Self {
        Self {
            frame_id,
            latch: Arc::new(RwLock::new(Page::new(page_size))),
            meta: Mutex::new(FrameMeta {
                page_id: PageId::NULL,
                dirty: false,
                recovery_lsn: Lsn::NULL,
                referenced: false,
            }),
            pin_count: AtomicUsize::new(0),
        }
    }

    /// Frame index within the pool.
    pub fn frame_id(&self) -> usize {
        self.frame_id
    }

    /// Pins the frame, protecting it from eviction.
    pub fn pin(&self) {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases one pin.
    pub fn unpin(&self) {
        let prev = self.pin_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin without pin");
    }

    /// Current pin count.
    pub fn pin_count(&self) -> usize {
        self.pin_count.load(Ordering::Acquire)
    }

    /// Page id currently cached, if any.
    pub fn page_id(&self) -> PageId {
        self.meta.lock().page_id
    }

    /// Whether the cached page has unwritten changes.
    pub fn is_dirty(&self) -> bool {
        self.meta.lock().dirty
    }

    /// Marks the page dirty, recording the first-dirty LSN.
    pub fn set_dirty(&self, lsn: Lsn) {
        let mut meta = self.meta.lock();
        if !meta.dirty {
            meta.recovery_lsn = lsn;
        }
        meta.dirty = true;
    }

    /// First-dirty LSN, or null when clean.
    pub fn recovery_lsn(&self) -> Lsn {
        self.meta.lock().recovery_lsn
    }
}

impl std::fmt::Debug for BufferFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let meta = self.meta.lock();
        f.debug_struct("BufferFrame")
            .field("frame_id", &self.frame_id)
            .field("page_id", &meta.page_id)
            .field("dirty", &meta.dirty)
            .field("pins", &self.pin_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_unpin() {
        let frame = BufferFrame::new(0, 512);
        assert_eq!(frame.pin_count(), 0);
        frame.pin();
        frame.pin();
        assert_eq!(frame.pin_count(), 2);
        frame.unpin();
        assert_eq!(frame.pin_count(), 1);
        frame.unpin();
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_first_dirty_lsn_sticks() {
        let frame = BufferFrame::new(0, 512);
        frame.set_dirty(Lsn::new(1, 100));
        frame.set_dirty(Lsn::new(1, 200));
        assert_eq!(frame.recovery_lsn(), Lsn::new(1, 100));
        assert!(frame.is_dirty());
    }
}
