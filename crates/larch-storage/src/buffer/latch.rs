//! Latched fix handles.
//!
//! A [`FixHandle`] owns both the pin on a buffer frame and one of the
//! three page latches. Update latches admit concurrent readers but
//! exclude each other, and can be upgraded to exclusive at the point of
//! mutation; exclusive latches can be downgraded back to update once
//! the mutation is logged.

use std::sync::Arc;

use parking_lot::lock_api::{
    ArcRwLockReadGuard, ArcRwLockUpgradableReadGuard, ArcRwLockWriteGuard,
};
use parking_lot::RawRwLock;

use larch_common::{Lsn, PageId};

use crate::page::Page;

use super::frame::BufferFrame;

type SharedGuard = ArcRwLockReadGuard<RawRwLock, Page>;
type UpdateGuard = ArcRwLockUpgradableReadGuard<RawRwLock, Page>;
type ExclusiveGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

/// Latch mode held by a fix handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatchMode {
    /// Compatible with other shared and update latches.
    Shared,
    /// Compatible with shared latches; upgradable to exclusive.
    Update,
    /// Excludes all other latches.
    Exclusive,
}

enum LatchGuard {
    Shared(SharedGuard),
    Update(UpdateGuard),
    Exclusive(ExclusiveGuard),
}

/// A pinned, latched page.
pub struct FixHandle {
    frame: Arc<BufferFrame>,
    page_id: PageId,
    guard: Option<LatchGuard>,
}

impl FixHandle {
    pub(crate) fn new(frame: Arc<BufferFrame>, page_id: PageId, guard_mode: LatchMode) -> Self {
        let guard = match guard_mode {
            LatchMode::Shared => LatchGuard::Shared(frame.latch.read_arc()),
            LatchMode::Update => LatchGuard::Update(frame.latch.upgradable_read_arc()),
            LatchMode::Exclusive => LatchGuard::Exclusive(frame.latch.write_arc()),
        };
        Self {
            frame,
            page_id,
            guard: Some(guard),
        }
    }

    /// The fixed page's id.
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    /// The latch mode currently held.
    pub fn mode(&self) -> LatchMode {
        match self.guard.as_ref().expect("latch released") {
            LatchGuard::Shared(_) => LatchMode::Shared,
            LatchGuard::Update(_) => LatchMode::Update,
            LatchGuard::Exclusive(_) => LatchMode::Exclusive,
        }
    }

    /// True while the handle holds an update latch.
    pub fn is_update_latched(&self) -> bool {
        self.mode() == LatchMode::Update
    }

    /// True while the handle holds the exclusive latch.
    pub fn is_exclusive_latched(&self) -> bool {
        self.mode() == LatchMode::Exclusive
    }

    /// Read access to the page.
    pub fn page(&self) -> &Page {
        match self.guard.as_ref().expect("latch released") {
            LatchGuard::Shared(g) => g,
            LatchGuard::Update(g) => g,
            LatchGuard::Exclusive(g) => g,
        }
    }

    /// Write access to the page. The handle must hold the exclusive
    /// latch; anything else is a programming error in the caller.
    pub fn page_mut(&mut self) -> &mut Page {
        match self.guard.as_mut().expect("latch released") {
            LatchGuard::Exclusive(g) => &mut *g,
            _ => panic!("page_mut requires the exclusive latch"),
        }
    }

    /// The page's LSN.
    pub fn page_lsn(&self) -> Lsn {
        self.page().page_lsn()
    }

    /// Upgrades an update latch to exclusive.
    pub fn upgrade_update_latch(&mut self) {
        let guard = self.guard.take().expect("latch released");
        self.guard = Some(match guard {
            LatchGuard::Update(g) => {
                LatchGuard::Exclusive(ArcRwLockUpgradableReadGuard::upgrade(g))
            }
            other => other,
        });
    }

    /// Downgrades the exclusive latch back to update mode.
    pub fn downgrade_exclusive_latch(&mut self) {
        let guard = self.guard.take().expect("latch released");
        self.guard = Some(match guard {
            LatchGuard::Exclusive(g) => {
                LatchGuard::Update(ArcRwLockWriteGuard::downgrade_to_upgradable(g))
            }
            other => other,
        });
    }

    /// Marks the page dirty, recording the first-dirty LSN for the
    /// oldest-interesting computation.
    pub fn set_dirty(&mut self, lsn: Lsn) {
        self.frame.set_dirty(lsn);
    }
}

impl Drop for FixHandle {
    fn drop(&mut self) {
        // Release the latch before the pin so eviction never sees a
        // pinned-but-unlatched window in the wrong order.
        self.guard.take();
        self.frame.unpin();
    }
}

impl std::fmt::Debug for FixHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixHandle")
            .field("page_id", &self.page_id)
            .field("mode", &self.mode())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;
    use larch_common::PageNumber;

    fn fixture() -> Arc<BufferFrame> {
        let frame = Arc::new(BufferFrame::new(0, 512));
        {
            let mut page = frame.latch.write();
            page.format(PageNumber::new(2), PageType::Slotted);
        }
        frame
    }

    #[test]
    fn test_shared_handles_coexist() {
        let frame = fixture();
        let id = PageId::new(1, PageNumber::new(2));
        frame.pin();
        frame.pin();
        let a = FixHandle::new(Arc::clone(&frame), id, LatchMode::Shared);
        let b = FixHandle::new(Arc::clone(&frame), id, LatchMode::Shared);
        assert_eq!(a.page().page_number(), PageNumber::new(2));
        assert_eq!(b.page().page_number(), PageNumber::new(2));
        drop(a);
        drop(b);
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    fn test_upgrade_and_downgrade() {
        let frame = fixture();
        let id = PageId::new(1, PageNumber::new(2));
        frame.pin();
        let mut handle = FixHandle::new(Arc::clone(&frame), id, LatchMode::Update);
        assert!(handle.is_update_latched());

        handle.upgrade_update_latch();
        assert!(handle.is_exclusive_latched());
        handle.page_mut().set_flags(3);

        handle.downgrade_exclusive_latch();
        assert!(handle.is_update_latched());
        assert_eq!(handle.page().flags(), 3);
    }

    #[test]
    fn test_drop_unpins() {
        let frame = fixture();
        let id = PageId::new(1, PageNumber::new(2));
        frame.pin();
        {
            let _handle = FixHandle::new(Arc::clone(&frame), id, LatchMode::Exclusive);
            assert_eq!(frame.pin_count(), 1);
        }
        assert_eq!(frame.pin_count(), 0);
    }

    #[test]
    #[should_panic(expected = "exclusive latch")]
    fn test_page_mut_requires_exclusive() {
        let frame = fixture();
        let id = PageId::new(1, PageNumber::new(2));
        frame.pin();
        let mut handle = FixHandle::new(frame, id, LatchMode::Shared);
        let _ = handle.page_mut();
    }
}
