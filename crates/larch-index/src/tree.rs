//! The B-link tree index manager.
//!
//! Structure modifications are half-atomic: each one is a single logged
//! multi-page redo record, applied immediately to the latched pages and
//! sealed as a nested top action, so a traversal may observe a page
//! whose right sibling is not yet linked to the parent and simply move
//! right. Update-mode traversal repairs such states (and pages about to
//! underflow) on the way down, before descending.
//!
//! Latch discipline: at most two page latches are held at a time during
//! descent (parent and child, update mode); a third (the right sibling)
//! joins only for SMOs, after the parent's latch is resolved. The
//! three-slot cursor P/Q/R tracks them; every operation documents which
//! slots it expects latched.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, trace};

use larch_common::constants::{ROOT_PAGE_NUMBER, SPACE_MAP_PAGE_NUMBER};
use larch_common::{Lsn, PageId, PageNumber};
use larch_storage::page::{Page, PageType, SpaceMapPage};
use larch_storage::{BufferPool, FixHandle};
use larch_txn::{
    LockDuration, LockMode, RecordFlags, Transaction, TransactionalModule, TxRecord, TxnError,
    TxnResult,
};

use crate::error::{IndexError, IndexResult};
use crate::item::{IndexItem, ItemCodec, KeyCodec, LocationCodec};
use crate::node::{format_node, Node, NodeHeader, NodeMut, SearchResult};
use crate::ops::IndexLogPayload;
use crate::scan::IndexScan;

/// Module id of the index manager in the transaction manager's
/// dispatch table.
pub const INDEX_MODULE_ID: u8 = 4;

pub(crate) type Item<C, D> =
    IndexItem<<C as KeyCodec>::Key, <D as LocationCodec>::Location>;
pub(crate) type Payload<C, D> =
    IndexLogPayload<<C as KeyCodec>::Key, <D as LocationCodec>::Location>;

/// Description of one page for the bulk page loader.
#[derive(Debug, Clone)]
pub struct PageLoad<K, L> {
    /// Page to install.
    pub page_number: PageNumber,
    /// Whether the page is a leaf.
    pub leaf: bool,
    /// Left sibling hint.
    pub left_sibling: PageNumber,
    /// Right sibling pointer.
    pub right_sibling: PageNumber,
    /// All physical items, including the leaf high key.
    pub items: Vec<IndexItem<K, L>>,
}

/// The three-slot traversal cursor. P is typically the parent, Q the
/// page under consideration, R its right sibling.
pub(crate) struct BTreeCursor<C: KeyCodec, D: LocationCodec> {
    pub p: Option<FixHandle>,
    pub q: Option<FixHandle>,
    pub r: Option<FixHandle>,
    pub search_key: Item<C, D>,
}

impl<C: KeyCodec, D: LocationCodec> BTreeCursor<C, D> {
    pub fn new(search_key: Item<C, D>) -> Self {
        Self {
            p: None,
            q: None,
            r: None,
            search_key,
        }
    }

    pub fn set_p(&mut self, fix: FixHandle) {
        debug_assert!(self.p.is_none(), "cursor slot P already occupied");
        self.p = Some(fix);
    }

    pub fn set_q(&mut self, fix: FixHandle) {
        debug_assert!(self.q.is_none(), "cursor slot Q already occupied");
        self.q = Some(fix);
    }

    pub fn set_r(&mut self, fix: FixHandle) {
        debug_assert!(self.r.is_none(), "cursor slot R already occupied");
        self.r = Some(fix);
    }

    pub fn p_ref(&self) -> &FixHandle {
        self.p.as_ref().expect("cursor slot P is empty")
    }

    pub fn p_mut(&mut self) -> &mut FixHandle {
        self.p.as_mut().expect("cursor slot P is empty")
    }

    pub fn q_ref(&self) -> &FixHandle {
        self.q.as_ref().expect("cursor slot Q is empty")
    }

    pub fn q_mut(&mut self) -> &mut FixHandle {
        self.q.as_mut().expect("cursor slot Q is empty")
    }

    pub fn r_ref(&self) -> &FixHandle {
        self.r.as_ref().expect("cursor slot R is empty")
    }

    pub fn r_mut(&mut self) -> &mut FixHandle {
        self.r.as_mut().expect("cursor slot R is empty")
    }

    pub fn unfix_p(&mut self) {
        self.p.take();
    }

    pub fn unfix_q(&mut self) {
        self.q.take();
    }

    pub fn unfix_r(&mut self) {
        self.r.take();
    }
}

/// The index manager: owns the codecs and performs redo/undo dispatch
/// for every tree log record. Individual trees are accessed through
/// [`BTree`] handles.
#[derive(Clone)]
pub struct BTreeIndexManager<C: KeyCodec, D: LocationCodec> {
    pool: Arc<BufferPool>,
    codec: ItemCodec<C, D>,
}

impl<C: KeyCodec, D: LocationCodec> BTreeIndexManager<C, D> {
    /// Creates a manager over the buffer pool with the given codecs.
    pub fn new(pool: Arc<BufferPool>, keys: C, locations: D) -> Self {
        Self {
            pool,
            codec: ItemCodec::new(keys, locations),
        }
    }

    /// The codec pair.
    pub fn codec(&self) -> &ItemCodec<C, D> {
        &self.codec
    }

    /// The buffer pool.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    fn page_id(&self, container_id: u32, page: PageNumber) -> PageId {
        PageId::new(container_id, page)
    }

    /// Creates a new index: a fresh container whose page 1 is the space
    /// map and whose page 2 is a root leaf holding only the INFINITY
    /// sentinel. Both pages are installed through one multi-page redo
    /// record.
    pub fn create_index(
        &self,
        txn: &mut Transaction,
        container_id: u32,
        name: &str,
        unique: bool,
    ) -> IndexResult<()> {
        self.pool.containers().create_container(container_id, name)?;

        let root_id = self.page_id(container_id, PageNumber::new(ROOT_PAGE_NUMBER));
        let smp_id = self.page_id(container_id, PageNumber::new(SPACE_MAP_PAGE_NUMBER));
        let payload: Payload<C, D> = IndexLogPayload::LoadPage {
            leaf: true,
            unique,
            space_map_page: PageNumber::new(SPACE_MAP_PAGE_NUMBER),
            left_sibling: PageNumber::NULL,
            right_sibling: PageNumber::NULL,
            items: vec![self.codec.infinity_item(true, unique)],
        };

        let mut root_fix = self.pool.fix_exclusive(root_id, true, PageType::Slotted)?;
        let mut smp_fix = self.pool.fix_exclusive(smp_id, true, PageType::SpaceMap)?;
        let lsn = self.log_and_apply(txn, &mut root_fix, &payload, Lsn::NULL)?;
        self.apply_secondary(&mut smp_fix, root_id, &payload, lsn)?;
        debug!(container_id, unique, "created index");
        Ok(())
    }

    /// Opens a tree, reading its uniqueness from the root page.
    pub fn index(&self, container_id: u32) -> IndexResult<BTree<C, D>> {
        let root_id = self.page_id(container_id, PageNumber::new(ROOT_PAGE_NUMBER));
        let fix = self.pool.fix_shared(root_id)?;
        let unique = Node::new(fix.page(), &self.codec).is_unique();
        Ok(BTree {
            mgr: self.clone(),
            container_id,
            unique,
        })
    }

    /// Installs a described set of tree pages, one multi-page redo
    /// record each. Exists to build trees with specific shapes for
    /// exercising the SMO paths deterministically.
    pub fn load_pages(
        &self,
        txn: &mut Transaction,
        container_id: u32,
        unique: bool,
        pages: Vec<PageLoad<C::Key, D::Location>>,
    ) -> IndexResult<()> {
        for load in pages {
            let page_id = self.page_id(container_id, load.page_number);
            let smp_id = self.page_id(container_id, PageNumber::new(SPACE_MAP_PAGE_NUMBER));
            let payload: Payload<C, D> = IndexLogPayload::LoadPage {
                leaf: load.leaf,
                unique,
                space_map_page: PageNumber::new(SPACE_MAP_PAGE_NUMBER),
                left_sibling: load.left_sibling,
                right_sibling: load.right_sibling,
                items: load.items,
            };
            let mut fix = self.pool.fix_exclusive(page_id, false, PageType::Slotted)?;
            let mut smp_fix = self.pool.fix_exclusive(smp_id, false, PageType::SpaceMap)?;
            let lsn = self.log_and_apply(txn, &mut fix, &payload, Lsn::NULL)?;
            self.apply_secondary(&mut smp_fix, page_id, &payload, lsn)?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------
    // Logging helpers
    // -----------------------------------------------------------------

    /// Logs a payload against the primary (exclusively latched) page and
    /// applies it there. `undo_next` seals a nested top action when the
    /// payload is a compensation record.
    fn log_and_apply(
        &self,
        txn: &mut Transaction,
        fix: &mut FixHandle,
        payload: &Payload<C, D>,
        undo_next: Lsn,
    ) -> IndexResult<Lsn> {
        let page_id = fix.page_id();
        let mut record = TxRecord::new(
            INDEX_MODULE_ID,
            payload.flags(),
            page_id,
            payload.encode(&self.codec),
        );
        record.undo_next_lsn = undo_next;
        let lsn = txn.log_insert(Some(fix), &mut record)?;
        self.apply(page_id, fix.page_mut(), page_id, payload)?;
        fix.set_dirty(lsn);
        Ok(lsn)
    }

    /// Applies an already-logged payload to one of its secondary pages.
    fn apply_secondary(
        &self,
        fix: &mut FixHandle,
        primary: PageId,
        payload: &Payload<C, D>,
        lsn: Lsn,
    ) -> IndexResult<()> {
        let page_id = fix.page_id();
        self.apply(page_id, fix.page_mut(), primary, payload)?;
        fix.page_mut().set_page_lsn(lsn);
        fix.set_dirty(lsn);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Redo
    // -----------------------------------------------------------------

    /// Applies a payload to the page identified by `page_id`, where
    /// `primary` is the page the record was logged against.
    fn apply(
        &self,
        page_id: PageId,
        page: &mut Page,
        primary: PageId,
        payload: &Payload<C, D>,
    ) -> IndexResult<()> {
        use IndexLogPayload::*;
        let own = page_id.page_number();
        match payload {
            LoadPage {
                leaf,
                unique,
                space_map_page,
                left_sibling,
                right_sibling,
                items,
            } => {
                if own == *space_map_page && own != primary.page_number() {
                    self.redo_space_map_bit(page, primary.page_number(), true);
                } else {
                    page.format(own, PageType::Slotted);
                    format_node(page, *leaf, *unique);
                    page.set_space_map_page(*space_map_page);
                    let mut node = NodeMut::new(page, &self.codec);
                    for (i, item) in items.iter().enumerate() {
                        node.replace_item(i + 1, item);
                    }
                    node.set_header(NodeHeader {
                        left_sibling: *left_sibling,
                        right_sibling: *right_sibling,
                        key_count: items.len() as u16,
                    });
                }
            }
            Split {
                leaf,
                unique,
                new_sibling,
                right_sibling,
                space_map_page,
                high_key,
                new_key_count,
                items,
            } => {
                if page_id == primary {
                    // Left page: trim to the new count first (the page
                    // is full, so the freed space is what makes room
                    // for the new high key), then rewire the sibling
                    // pointer and install the leaf high key.
                    while page.slot_count() > usize::from(*new_key_count) + 1 {
                        page.purge(page.slot_count() - 1);
                    }
                    let mut node = NodeMut::new(page, &self.codec);
                    let mut header = node.header()?;
                    header.right_sibling = *new_sibling;
                    if let Some(hk) = high_key {
                        node.replace_item(usize::from(*new_key_count), hk);
                    }
                    header.key_count = *new_key_count;
                    node.set_header(header);
                } else {
                    // New right sibling.
                    page.format(own, PageType::Slotted);
                    format_node(page, *leaf, *unique);
                    page.set_space_map_page(*space_map_page);
                    let mut node = NodeMut::new(page, &self.codec);
                    for (i, item) in items.iter().enumerate() {
                        node.replace_item(i + 1, item);
                    }
                    node.set_header(NodeHeader {
                        left_sibling: primary.page_number(),
                        right_sibling: *right_sibling,
                        key_count: items.len() as u16,
                    });
                }
            }
            Merge {
                leaf,
                right_sibling,
                right_right_sibling,
                items,
                ..
            } => {
                if page_id == primary {
                    let mut node = NodeMut::new(page, &self.codec);
                    let mut header = node.header()?;
                    let mut k = usize::from(header.key_count);
                    if *leaf {
                        // The left page's high key goes first.
                        node.delete_slot(k);
                    } else {
                        k += 1;
                    }
                    for item in items {
                        node.replace_item(k, item);
                        k += 1;
                    }
                    header.key_count += items.len() as u16;
                    if *leaf {
                        header.key_count -= 1;
                    }
                    header.right_sibling = *right_right_sibling;
                    node.set_header(header);
                } else if own == *right_sibling {
                    let mut node = NodeMut::new(page, &self.codec);
                    node.set_deallocated();
                }
            }
            Link {
                left_sibling,
                right_sibling,
                left_child_high_key,
                ..
            } => {
                let (slot, mut item) = {
                    let node = Node::new(page, &self.codec);
                    node.find_index_item(*left_sibling)?.ok_or_else(|| {
                        IndexError::corrupt("link target not found in parent")
                    })?
                };
                item.child_page = *right_sibling;
                let mut node = NodeMut::new(page, &self.codec);
                node.replace_item(slot, &item);
                node.insert_item(slot, left_child_high_key);
                let mut header = node.header()?;
                header.key_count += 1;
                node.set_header(header);
            }
            Unlink {
                left_sibling,
                right_sibling,
                ..
            } => {
                let slot = {
                    let node = Node::new(page, &self.codec);
                    node.find_index_item(*left_sibling)?
                        .ok_or_else(|| IndexError::corrupt("unlink target not in parent"))?
                        .0
                };
                let mut node = NodeMut::new(page, &self.codec);
                node.purge(slot);
                let mut item = node.as_node().item(slot)?;
                if item.child_page != *right_sibling {
                    return Err(IndexError::corrupt("unlink sibling mismatch in parent"));
                }
                item.child_page = *left_sibling;
                node.replace_item(slot, &item);
                let mut header = node.header()?;
                header.key_count -= 1;
                node.set_header(header);
            }
            Redistribute {
                leaf,
                left_sibling,
                target_sibling,
                key,
                ..
            } => {
                let moving_left = target_sibling == left_sibling;
                let mut node = NodeMut::new(page, &self.codec);
                let mut header = node.header()?;
                if own == *left_sibling {
                    if moving_left {
                        // The incoming key becomes the last real key
                        // and, in leaves, the new high key.
                        header.key_count += 1;
                        node.set_header(header);
                        let kc = usize::from(header.key_count);
                        node.replace_item(kc, key);
                        if *leaf {
                            node.replace_item(kc - 1, key);
                        }
                    } else {
                        // Drop the outgoing key; in leaves the previous
                        // key becomes the new high key.
                        let kc = usize::from(header.key_count);
                        node.purge(kc);
                        header.key_count -= 1;
                        node.set_header(header);
                        if *leaf {
                            let kc = usize::from(header.key_count);
                            let prev = node.as_node().item(kc - 1)?;
                            node.replace_item(kc, &prev);
                        }
                    }
                } else if moving_left {
                    node.purge(1);
                    header.key_count -= 1;
                    node.set_header(header);
                } else {
                    node.insert_item(1, key);
                    header.key_count += 1;
                    node.set_header(header);
                }
            }
            IncreaseTreeHeight {
                leaf,
                unique,
                left_child,
                right_child,
                space_map_page,
                items,
                root_items,
            } => {
                if page_id == primary {
                    // Root becomes a two-entry index page.
                    page.reset_body();
                    format_node(page, false, *unique);
                    page.set_page_number(primary.page_number());
                    let mut node = NodeMut::new(page, &self.codec);
                    node.insert_item(1, &root_items[0]);
                    node.insert_item(2, &root_items[1]);
                    let mut header = node.header()?;
                    header.key_count = 2;
                    node.set_header(header);
                } else if own == *left_child {
                    // New left child takes the old root's contents.
                    page.format(own, PageType::Slotted);
                    format_node(page, *leaf, *unique);
                    page.set_space_map_page(*space_map_page);
                    let mut node = NodeMut::new(page, &self.codec);
                    for (i, item) in items.iter().enumerate() {
                        node.replace_item(i + 1, item);
                    }
                    node.set_header(NodeHeader {
                        left_sibling: PageNumber::NULL,
                        right_sibling: *right_child,
                        key_count: items.len() as u16,
                    });
                }
            }
            DecreaseTreeHeight {
                leaf,
                unique,
                child_page,
                items,
                ..
            } => {
                if page_id == primary {
                    page.reset_body();
                    format_node(page, *leaf, *unique);
                    page.set_page_number(primary.page_number());
                    let mut node = NodeMut::new(page, &self.codec);
                    for (i, item) in items.iter().enumerate() {
                        node.replace_item(i + 1, item);
                    }
                    let mut header = node.header()?;
                    header.key_count = items.len() as u16;
                    node.set_header(header);
                } else if own == *child_page {
                    let mut node = NodeMut::new(page, &self.codec);
                    node.set_deallocated();
                }
            }
            Insert { item, .. } => {
                let slot = {
                    let node = Node::new(page, &self.codec);
                    let sr = node.search(item)?;
                    match sr.slot {
                        Some(slot) => slot,
                        // Greater than every real key: goes just below
                        // the high key.
                        None => node.physical_key_count()?,
                    }
                };
                let mut node = NodeMut::new(page, &self.codec);
                node.insert_item(slot, item);
                let mut header = node.header()?;
                header.key_count += 1;
                node.set_header(header);
            }
            UndoInsert { slot, .. } => {
                let mut node = NodeMut::new(page, &self.codec);
                node.purge(usize::from(*slot));
                let mut header = node.header()?;
                header.key_count -= 1;
                node.set_header(header);
            }
            Delete { item, .. } => {
                let slot = {
                    let node = Node::new(page, &self.codec);
                    let sr = node.search(item)?;
                    if !sr.exact {
                        return Err(IndexError::corrupt("delete redo found no exact match"));
                    }
                    sr.slot.expect("exact match has a slot")
                };
                let mut node = NodeMut::new(page, &self.codec);
                node.purge(slot);
                let mut header = node.header()?;
                header.key_count -= 1;
                node.set_header(header);
            }
            UndoDelete { slot, item, .. } => {
                let mut node = NodeMut::new(page, &self.codec);
                node.insert_item(usize::from(*slot), item);
                let mut header = node.header()?;
                header.key_count += 1;
                node.set_header(header);
            }
            AllocatePage { page: target } => {
                self.redo_space_map_bit(page, *target, true);
            }
            FreePage { page: target } => {
                self.redo_space_map_bit(page, *target, false);
            }
        }
        Ok(())
    }

    /// Applies a space-map bit change, formatting the bitmap page on
    /// first touch (reserved pages 0 and 1 marked allocated).
    fn redo_space_map_bit(&self, page: &mut Page, target: PageNumber, allocated: bool) {
        if page.page_type() != PageType::SpaceMap {
            page.format(PageNumber::new(SPACE_MAP_PAGE_NUMBER), PageType::SpaceMap);
            let mut smp = SpaceMapPage::new(page);
            smp.set_allocated(0, true);
            smp.set_allocated(SPACE_MAP_PAGE_NUMBER, true);
        }
        let mut smp = SpaceMapPage::new(page);
        smp.set_allocated(target.as_u32(), allocated);
    }

    // -----------------------------------------------------------------
    // Space map cursor
    // -----------------------------------------------------------------

    /// Allocates a page: finds a free bit and logs the flip undoably.
    /// Returns the page and its space map page.
    fn allocate_page(
        &self,
        txn: &mut Transaction,
        container_id: u32,
    ) -> IndexResult<(PageNumber, PageNumber)> {
        let smp_id = self.page_id(container_id, PageNumber::new(SPACE_MAP_PAGE_NUMBER));
        let mut fix = self.pool.fix_exclusive(smp_id, false, PageType::SpaceMap)?;
        let page_no = {
            let smp = SpaceMapPage::new(fix.page_mut());
            smp.first_free(ROOT_PAGE_NUMBER + 1)
                .ok_or(larch_storage::StorageError::NoFreePages { container_id })?
        };
        let payload: Payload<C, D> = IndexLogPayload::AllocatePage {
            page: PageNumber::new(page_no),
        };
        self.log_and_apply(txn, &mut fix, &payload, Lsn::NULL)?;
        trace!(container_id, page_no, "allocated tree page");
        Ok((PageNumber::new(page_no), PageNumber::new(SPACE_MAP_PAGE_NUMBER)))
    }

    /// Clears a page's allocation bit as a discrete redo-only action,
    /// so no space-map latch is held across an SMO. If the record does
    /// not survive a crash the page merely stays marked allocated; its
    /// deallocated flag identifies it as reclaimable.
    fn free_page(
        &self,
        txn: &mut Transaction,
        container_id: u32,
        space_map_page: PageNumber,
        page: PageNumber,
    ) -> IndexResult<()> {
        let smp_id = self.page_id(container_id, space_map_page);
        let mut fix = self.pool.fix_exclusive(smp_id, false, PageType::SpaceMap)?;
        let payload: Payload<C, D> = IndexLogPayload::FreePage { page };
        self.log_and_apply(txn, &mut fix, &payload, Lsn::NULL)?;
        Ok(())
    }

    /// Physical undo of a page allocation: clears the bit through a
    /// compensation record.
    fn undo_allocate(
        &self,
        txn: &mut Transaction,
        record: &TxRecord,
        page: PageNumber,
    ) -> IndexResult<()> {
        let mut fix = self
            .pool
            .fix_exclusive(record.page_id, false, PageType::SpaceMap)?;
        let payload: Payload<C, D> = IndexLogPayload::FreePage { page };
        let mut clr = TxRecord::new(
            INDEX_MODULE_ID,
            RecordFlags::REDO | RecordFlags::CLR,
            record.page_id,
            payload.encode(&self.codec),
        );
        clr.undo_next_lsn = record.prev_lsn;
        let lsn = txn.log_insert(Some(&mut fix), &mut clr)?;
        self.apply(record.page_id, fix.page_mut(), record.page_id, &payload)?;
        fix.set_dirty(lsn);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Logical undo
    // -----------------------------------------------------------------

    /// Undoes an insert. The key may have moved: if the original page
    /// no longer holds it (or would underflow), re-traverse for it.
    fn undo_insert(
        &self,
        txn: &mut Transaction,
        record: &TxRecord,
        unique: bool,
        item: Item<C, D>,
    ) -> IndexResult<()> {
        let mut cursor: BTreeCursor<C, D> = BTreeCursor::new(item.clone());
        cursor.set_p(self.pool.fix_exclusive(record.page_id, false, PageType::Slotted)?);

        let mut slot = {
            let node = Node::new(cursor.p_ref().page(), &self.codec);
            if node.is_leaf() && !node.is_deallocated() {
                let sr = node.search(&item)?;
                if sr.exact && node.key_count()? > node.minimum_keys() {
                    sr.slot
                } else {
                    None
                }
            } else {
                None
            }
        };

        if slot.is_none() {
            cursor.unfix_p();
            let btree = BTree {
                mgr: self.clone(),
                container_id: record.page_id.container_id(),
                unique,
            };
            btree.update_mode_traverse(txn, &mut cursor)?;
            cursor.p_mut().upgrade_update_latch();
            let node = Node::new(cursor.p_ref().page(), &self.codec);
            let sr = node.search(&item)?;
            if !sr.exact {
                return Err(IndexError::corrupt("undo-insert key not found"));
            }
            slot = sr.slot;
        }

        let payload: Payload<C, D> = IndexLogPayload::UndoInsert {
            unique,
            slot: slot.expect("exact match has a slot") as u16,
            item,
        };
        let mut fix = cursor.p.take().expect("cursor slot P is empty");
        self.log_clr(txn, &mut fix, &payload, record.prev_lsn)?;
        Ok(())
    }

    /// Undoes a delete: reinserts the key, retraversing (and splitting)
    /// when the original page no longer covers it or cannot fit it.
    fn undo_delete(
        &self,
        txn: &mut Transaction,
        record: &TxRecord,
        unique: bool,
        item: Item<C, D>,
    ) -> IndexResult<()> {
        let btree = BTree {
            mgr: self.clone(),
            container_id: record.page_id.container_id(),
            unique,
        };
        let mut cursor: BTreeCursor<C, D> = BTreeCursor::new(item.clone());
        cursor.set_p(self.pool.fix_exclusive(record.page_id, false, PageType::Slotted)?);

        let in_place = {
            let fix = cursor.p_ref();
            let node = Node::new(fix.page(), &self.codec);
            let still_bound = fix.page_lsn() == record.lsn
                || (!node.is_deallocated() && node.is_leaf() && node.covers(&item)?);
            still_bound && node.can_accommodate(&item)
        };

        if !in_place {
            cursor.unfix_p();
            btree.update_mode_traverse(txn, &mut cursor)?;
            let fits = {
                let node = Node::new(cursor.p_ref().page(), &self.codec);
                node.can_accommodate(&item)
            };
            if !fits {
                cursor.q = cursor.p.take();
                btree.do_split(txn, &mut cursor)?;
                cursor.p = cursor.q.take();
            }
            cursor.p_mut().upgrade_update_latch();
        }

        let slot = {
            let node = Node::new(cursor.p_ref().page(), &self.codec);
            let sr = node.search(&item)?;
            if sr.exact {
                return Err(IndexError::corrupt("undo-delete found the key present"));
            }
            match sr.slot {
                Some(slot) => slot,
                // Greater than every real key: reinsert just below the
                // high key.
                None => node.physical_key_count()?,
            }
        };

        let payload: Payload<C, D> = IndexLogPayload::UndoDelete {
            unique,
            slot: slot as u16,
            item,
        };
        let mut fix = cursor.p.take().expect("cursor slot P is empty");
        self.log_clr(txn, &mut fix, &payload, record.prev_lsn)?;
        Ok(())
    }

    /// Logs a compensation payload against `fix` and applies it.
    fn log_clr(
        &self,
        txn: &mut Transaction,
        fix: &mut FixHandle,
        payload: &Payload<C, D>,
        undo_next: Lsn,
    ) -> IndexResult<Lsn> {
        self.log_and_apply(txn, fix, payload, undo_next)
    }
}

impl<C: KeyCodec, D: LocationCodec> TransactionalModule for BTreeIndexManager<C, D> {
    fn redo(&self, page_id: PageId, page: &mut Page, record: &TxRecord) -> TxnResult<()> {
        let payload = IndexLogPayload::decode(&self.codec, &record.payload)
            .map_err(|e| TxnError::bad_record(e.to_string()))?;
        self.apply(page_id, page, record.page_id, &payload)
            .map_err(|e| TxnError::bad_record(e.to_string()))
    }

    fn undo(&self, txn: &mut Transaction, record: &TxRecord) -> TxnResult<()> {
        let payload = IndexLogPayload::decode(&self.codec, &record.payload)
            .map_err(|e| TxnError::bad_record(e.to_string()))?;
        let result = match payload {
            IndexLogPayload::Insert { unique, item } => {
                self.undo_insert(txn, record, unique, item)
            }
            IndexLogPayload::Delete { unique, item } => {
                self.undo_delete(txn, record, unique, item)
            }
            IndexLogPayload::AllocatePage { page } => self.undo_allocate(txn, record, page),
            _ => Ok(()),
        };
        result.map_err(|e| match e {
            IndexError::Txn { source } => source,
            other => TxnError::bad_record(other.to_string()),
        })
    }

    fn page_ids(&self, record: &TxRecord) -> TxnResult<Vec<PageId>> {
        let payload = IndexLogPayload::decode(&self.codec, &record.payload)
            .map_err(|e| TxnError::bad_record(e.to_string()))?;
        Ok(payload.page_ids(record.page_id))
    }
}

/// Handle to one tree within a container.
#[derive(Clone)]
pub struct BTree<C: KeyCodec, D: LocationCodec> {
    pub(crate) mgr: BTreeIndexManager<C, D>,
    pub(crate) container_id: u32,
    pub(crate) unique: bool,
}

impl<C: KeyCodec, D: LocationCodec> BTree<C, D> {
    /// Whether this is a unique index.
    pub fn is_unique(&self) -> bool {
        self.unique
    }

    /// The owning container.
    pub fn container_id(&self) -> u32 {
        self.container_id
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        self.mgr.pool()
    }

    pub(crate) fn codec(&self) -> &ItemCodec<C, D> {
        &self.mgr.codec
    }

    pub(crate) fn page_id(&self, page: PageNumber) -> PageId {
        PageId::new(self.container_id, page)
    }

    pub(crate) fn node<'h>(&'h self, fix: &'h FixHandle) -> Node<'h, C, D> {
        Node::new(fix.page(), &self.mgr.codec)
    }

    // -----------------------------------------------------------------
    // Structure modifications
    // -----------------------------------------------------------------

    /// Splits Q. Requires `cursor.q` update-latched; afterwards the
    /// page covering the search key remains latched as Q in update
    /// mode.
    ///
    /// The SMO is a nested top action: the page allocation is logged
    /// undoably, and the split record is a compensation whose undo-next
    /// points before the allocation.
    pub(crate) fn do_split(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<()> {
        let undo_next = txn.last_lsn();
        let (new_page, space_map_page) = self.mgr.allocate_page(txn, self.container_id)?;

        cursor.q_mut().upgrade_update_latch();
        let (payload, high_key) = {
            let node = self.node(cursor.q_ref());
            let header = node.header()?;
            let split = node.split_slot()?;
            let leaf = node.is_leaf();
            let mut items = Vec::new();
            for slot in split..=usize::from(header.key_count) {
                items.push(node.item(slot)?);
            }
            // In a leaf the split key is copied into both pages: the
            // left page's new high key is the right page's first item.
            let (high_key, new_key_count) = if leaf {
                (Some(node.item(split)?), split as u16)
            } else {
                (None, (split - 1) as u16)
            };
            let payload: Payload<C, D> = IndexLogPayload::Split {
                leaf,
                unique: self.unique,
                new_sibling: new_page,
                right_sibling: header.right_sibling,
                space_map_page,
                high_key: high_key.clone(),
                new_key_count,
                items,
            };
            let hk = match &high_key {
                Some(hk) => hk.clone(),
                None => node.item(split - 1)?,
            };
            (payload, hk)
        };

        cursor.set_r(
            self.pool()
                .fix_exclusive(self.page_id(new_page), true, PageType::Slotted)?,
        );
        let q_id = cursor.q_ref().page_id();
        let lsn = {
            let fix = cursor.q_mut();
            self.mgr.log_and_apply(txn, fix, &payload, undo_next)?
        };
        self.mgr
            .apply_secondary(cursor.r_mut(), q_id, &payload, lsn)?;
        debug!(page = %q_id, new_sibling = %new_page, "split");

        if high_key.compare(&cursor.search_key) != Ordering::Less {
            // Search key stays in the left page.
            cursor.q_mut().downgrade_exclusive_latch();
            cursor.unfix_r();
        } else {
            cursor.r_mut().downgrade_exclusive_latch();
            cursor.unfix_q();
            cursor.q = cursor.r.take();
        }
        Ok(())
    }

    /// Merges R (an indirect child of the parent) into Q. Requires Q
    /// and R update-latched; afterwards Q remains latched in update
    /// mode. The space map bit is cleared as a separate redo-only
    /// action.
    pub(crate) fn do_merge(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<()> {
        cursor.q_mut().upgrade_update_latch();
        cursor.r_mut().upgrade_update_latch();

        let payload = {
            let q = self.node(cursor.q_ref());
            let r = self.node(cursor.r_ref());
            let q_header = q.header()?;
            let r_header = r.header()?;
            debug_assert_eq!(
                q_header.right_sibling,
                cursor.r_ref().page_id().page_number()
            );
            let mut items = Vec::new();
            for slot in 1..=usize::from(r_header.key_count) {
                items.push(r.item(slot)?);
            }
            let payload: Payload<C, D> = IndexLogPayload::Merge {
                leaf: q.is_leaf(),
                unique: self.unique,
                right_sibling: q_header.right_sibling,
                right_space_map_page: r.page().space_map_page(),
                right_right_sibling: r_header.right_sibling,
                items,
            };
            payload
        };

        let q_id = cursor.q_ref().page_id();
        let (right_page, right_smp) = match &payload {
            IndexLogPayload::Merge {
                right_sibling,
                right_space_map_page,
                ..
            } => (*right_sibling, *right_space_map_page),
            _ => unreachable!(),
        };
        let lsn = {
            let fix = cursor.q_mut();
            self.mgr.log_and_apply(txn, fix, &payload, Lsn::NULL)?
        };
        self.mgr
            .apply_secondary(cursor.r_mut(), q_id, &payload, lsn)?;
        debug!(page = %q_id, absorbed = %right_page, "merge");

        cursor.unfix_r();
        cursor.q_mut().downgrade_exclusive_latch();

        self.mgr
            .free_page(txn, self.container_id, right_smp, right_page)?;
        Ok(())
    }

    /// Links Q's indirect right sibling into the parent P: rewrites
    /// P's entry `(v, Q)` to `(v, R)` and inserts `(Q.highkey, Q)`
    /// before it. Requires P and Q update-latched; both remain so.
    pub(crate) fn do_link(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<()> {
        cursor.p_mut().upgrade_update_latch();
        let payload = {
            let q = self.node(cursor.q_ref());
            let q_header = q.header()?;
            let mut high_key = q.high_key()?;
            high_key.child_page = cursor.q_ref().page_id().page_number();
            high_key.leaf = false;
            let payload: Payload<C, D> = IndexLogPayload::Link {
                unique: self.unique,
                left_sibling: cursor.q_ref().page_id().page_number(),
                right_sibling: q_header.right_sibling,
                left_child_high_key: high_key,
            };
            payload
        };
        {
            let fix = cursor.p_mut();
            self.mgr.log_and_apply(txn, fix, &payload, Lsn::NULL)?;
        }
        cursor.p_mut().downgrade_exclusive_latch();
        Ok(())
    }

    /// Unlinks R from the parent P: drops P's entry for Q and rewires
    /// P's entry for R to Q's page number. Requires P, Q, R
    /// update-latched; P is released.
    pub(crate) fn do_unlink(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<()> {
        cursor.p_mut().upgrade_update_latch();
        let payload: Payload<C, D> = IndexLogPayload::Unlink {
            unique: self.unique,
            left_sibling: cursor.q_ref().page_id().page_number(),
            right_sibling: cursor.r_ref().page_id().page_number(),
        };
        {
            let fix = cursor.p_mut();
            self.mgr.log_and_apply(txn, fix, &payload, Lsn::NULL)?;
        }
        cursor.unfix_p();
        Ok(())
    }

    /// Moves exactly one key between Q and R, from the denser page to
    /// the less dense one. Requires Q and R update-latched; afterwards
    /// the page covering the search key remains latched as Q.
    pub(crate) fn do_redistribute(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<()> {
        cursor.q_mut().upgrade_update_latch();
        cursor.r_mut().upgrade_update_latch();

        let payload = {
            let q = self.node(cursor.q_ref());
            let r = self.node(cursor.r_ref());
            let left = cursor.q_ref().page_id().page_number();
            let right = cursor.r_ref().page_id().page_number();
            let (key, target) = if q.page().free_space() > r.page().free_space() {
                // Key moves left: the right page's first real key.
                (r.item(1)?, left)
            } else {
                // Key moves right: the left page's last real key.
                (q.last_key()?, right)
            };
            let payload: Payload<C, D> = IndexLogPayload::Redistribute {
                leaf: q.is_leaf(),
                unique: self.unique,
                left_sibling: left,
                right_sibling: right,
                target_sibling: target,
                key,
            };
            payload
        };

        let q_id = cursor.q_ref().page_id();
        let lsn = {
            let fix = cursor.q_mut();
            self.mgr.log_and_apply(txn, fix, &payload, Lsn::NULL)?
        };
        self.mgr
            .apply_secondary(cursor.r_mut(), q_id, &payload, lsn)?;

        let covers = {
            let node = self.node(cursor.q_ref());
            node.high_key()?.compare(&cursor.search_key) != Ordering::Less
        };
        if covers {
            cursor.q_mut().downgrade_exclusive_latch();
            cursor.unfix_r();
        } else {
            cursor.r_mut().downgrade_exclusive_latch();
            cursor.unfix_q();
            cursor.q = cursor.r.take();
        }
        Ok(())
    }

    /// Grows the tree: the root's contents move into a newly allocated
    /// page; the root becomes a two-entry index over that page and the
    /// root's old right sibling. Requires Q = root and R = its sibling,
    /// update-latched; afterwards the child covering the search key is
    /// latched as Q.
    pub(crate) fn do_increase_tree_height(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<()> {
        let undo_next = txn.last_lsn();
        let (new_page, space_map_page) = self.mgr.allocate_page(txn, self.container_id)?;

        cursor.p = cursor.q.take();
        cursor.p_mut().upgrade_update_latch();

        let (payload, left_child_high_key) = {
            let root = self.node(cursor.p_ref());
            let header = root.header()?;
            let mut items = Vec::new();
            for slot in 1..=usize::from(header.key_count) {
                items.push(root.item(slot)?);
            }
            let mut left_high = root.item(usize::from(header.key_count))?;
            left_high.leaf = false;
            left_high.child_page = new_page;
            let mut right_high = self.codec().infinity_item(false, self.unique);
            right_high.child_page = header.right_sibling;
            let payload: Payload<C, D> = IndexLogPayload::IncreaseTreeHeight {
                leaf: root.is_leaf(),
                unique: self.unique,
                left_child: new_page,
                right_child: header.right_sibling,
                space_map_page,
                items,
                root_items: vec![left_high.clone(), right_high],
            };
            (payload, left_high)
        };

        cursor.set_q(
            self.pool()
                .fix_exclusive(self.page_id(new_page), true, PageType::Slotted)?,
        );
        let root_id = cursor.p_ref().page_id();
        let lsn = {
            let fix = cursor.p_mut();
            self.mgr.log_and_apply(txn, fix, &payload, undo_next)?
        };
        self.mgr
            .apply_secondary(cursor.q_mut(), root_id, &payload, lsn)?;
        debug!(new_child = %new_page, "increase tree height");
        cursor.unfix_p();

        if left_child_high_key.compare(&cursor.search_key) != Ordering::Less {
            cursor.q_mut().downgrade_exclusive_latch();
            cursor.unfix_r();
        } else {
            cursor.unfix_q();
            cursor.q = cursor.r.take();
        }
        Ok(())
    }

    /// Shrinks the tree: the root absorbs its only child. Requires
    /// P = root and Q = the child, update-latched; afterwards the root
    /// remains latched as P. The child's space map bit is cleared as a
    /// separate redo-only action.
    pub(crate) fn do_decrease_tree_height(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<()> {
        cursor.p_mut().upgrade_update_latch();
        cursor.q_mut().upgrade_update_latch();

        let payload = {
            let child = self.node(cursor.q_ref());
            let header = child.header()?;
            let mut items = Vec::new();
            for slot in 1..=usize::from(header.key_count) {
                items.push(child.item(slot)?);
            }
            let payload: Payload<C, D> = IndexLogPayload::DecreaseTreeHeight {
                leaf: child.is_leaf(),
                unique: self.unique,
                child_page: cursor.q_ref().page_id().page_number(),
                child_space_map_page: child.page().space_map_page(),
                items,
            };
            payload
        };

        let root_id = cursor.p_ref().page_id();
        let (child_page, child_smp) = match &payload {
            IndexLogPayload::DecreaseTreeHeight {
                child_page,
                child_space_map_page,
                ..
            } => (*child_page, *child_space_map_page),
            _ => unreachable!(),
        };
        let lsn = {
            let fix = cursor.p_mut();
            self.mgr.log_and_apply(txn, fix, &payload, Lsn::NULL)?
        };
        self.mgr
            .apply_secondary(cursor.q_mut(), root_id, &payload, lsn)?;
        debug!(absorbed = %child_page, "decrease tree height");

        cursor.unfix_q();
        cursor.p_mut().downgrade_exclusive_latch();

        self.mgr
            .free_page(txn, self.container_id, child_smp, child_page)?;
        Ok(())
    }

    /// Splits the parent P. Q and R (if latched) are undisturbed;
    /// whichever of the parent or its new sibling covers the search key
    /// remains latched as P.
    pub(crate) fn do_split_parent(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<()> {
        let saved_q = cursor.q.take();
        let saved_r = cursor.r.take();
        cursor.q = cursor.p.take();
        let result = self.do_split(txn, cursor);
        cursor.p = cursor.q.take();
        cursor.q = saved_q;
        cursor.r = saved_r;
        result
    }

    /// One round of underflow repair for Q under parent P (both
    /// update-latched). Returns true when the situation changed under
    /// us and the caller must retry. On a false return, P is released
    /// and the child covering the search key is latched as Q.
    fn do_repair_page_underflow(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<bool> {
        let q_page = cursor.q_ref().page_id().page_number();

        let (u, high_key_p) = {
            let q = self.node(cursor.q_ref());
            let p = self.node(cursor.p_ref());
            (q.high_key()?, p.high_key()?)
        };

        if u.compare(&high_key_p) == Ordering::Less {
            // Q is not the rightmost child of P. Either R is an
            // indirect child of P, or R is a direct child whose own
            // sibling S may be indirect.
            let (v, r_page) = {
                let p = self.node(cursor.p_ref());
                let q = self.node(cursor.q_ref());
                let v = p
                    .find_index_item(q_page)?
                    .ok_or_else(|| IndexError::corrupt("child missing from parent"))?
                    .1;
                (v, q.header()?.right_sibling)
            };
            if !r_page.is_valid() {
                return Err(IndexError::corrupt("non-rightmost page has no sibling"));
            }
            cursor.set_r(self.pool().fix_for_update(self.page_id(r_page))?);

            if u.compare(&v) == Ordering::Less {
                // R is an indirect child: merge (or redistribute) right
                // into Q directly.
                cursor.unfix_p();
                let can_merge = {
                    let q = self.node(cursor.q_ref());
                    let r = self.node(cursor.r_ref());
                    q.can_merge_with(&r)?
                };
                if can_merge {
                    self.do_merge(txn, cursor)?;
                } else {
                    self.do_redistribute(txn, cursor)?;
                }
            } else {
                // R is a direct child of P. If R itself has an indirect
                // sibling S, S must be linked to P before R can be
                // unlinked.
                let (w, r_high) = {
                    let p = self.node(cursor.p_ref());
                    let r = self.node(cursor.r_ref());
                    let w = p
                        .find_index_item(r_page)?
                        .ok_or_else(|| IndexError::corrupt("sibling missing from parent"))?
                        .1;
                    (w, r.high_key()?)
                };
                if r_high.compare(&w) == Ordering::Less {
                    let fits = {
                        let p = self.node(cursor.p_ref());
                        p.can_accommodate(&r_high)
                    };
                    if !fits {
                        self.do_split_parent(txn, cursor)?;
                        let r_still_child = {
                            let p = self.node(cursor.p_ref());
                            p.find_index_item(r_page)?.is_some()
                        };
                        if !r_still_child {
                            // R moved to the parent's new sibling;
                            // restart the repair.
                            cursor.unfix_r();
                            return Ok(true);
                        }
                    }
                    // Link S to P, with R standing in as the cursor's Q.
                    let saved_q = cursor.q.take();
                    cursor.q = cursor.r.take();
                    let link_result = self.do_link(txn, cursor);
                    cursor.r = cursor.q.take();
                    cursor.q = saved_q;
                    link_result?;
                }
                // Every sibling of R is now linked to P; unlink R and
                // fold it into Q.
                self.do_unlink(txn, cursor)?;
                let can_merge = {
                    let q = self.node(cursor.q_ref());
                    let r = self.node(cursor.r_ref());
                    q.can_merge_with(&r)?
                };
                if can_merge {
                    self.do_merge(txn, cursor)?;
                } else {
                    self.do_redistribute(txn, cursor)?;
                }
            }
        } else {
            // Q is the rightmost child of P: work with its left
            // neighbour L instead. L is guaranteed to exist because
            // every page holds at least two entries.
            let v = {
                let p = self.node(cursor.p_ref());
                p.find_prev_index_item(q_page)?
                    .ok_or_else(|| IndexError::corrupt("rightmost child has no left sibling"))?
            };
            let l_page = v.child_page;
            cursor.unfix_q();
            cursor.set_q(self.pool().fix_for_update(self.page_id(l_page))?);
            let n_page = {
                let l = self.node(cursor.q_ref());
                l.header()?.right_sibling
            };
            if !n_page.is_valid() {
                return Err(IndexError::corrupt("left sibling chain broken"));
            }
            cursor.set_r(self.pool().fix_for_update(self.page_id(n_page))?);

            let l_high = {
                let l = self.node(cursor.q_ref());
                l.high_key()?
            };
            if l_high.compare(&v) == Ordering::Equal {
                // L is a direct child and its right sibling is Q.
                let still_underflowing = {
                    let r = self.node(cursor.r_ref());
                    r.is_about_to_underflow()?
                };
                if !still_underflowing {
                    cursor.unfix_p();
                    cursor.unfix_q();
                    cursor.q = cursor.r.take();
                } else {
                    self.do_unlink(txn, cursor)?;
                    let can_merge = {
                        let q = self.node(cursor.q_ref());
                        let r = self.node(cursor.r_ref());
                        q.can_merge_with(&r)?
                    };
                    if can_merge {
                        self.do_merge(txn, cursor)?;
                    } else {
                        self.do_redistribute(txn, cursor)?;
                    }
                }
            } else {
                // L has an indirect sibling N between it and Q: link N
                // into P, then deal with N and Q.
                let fits = {
                    let p = self.node(cursor.p_ref());
                    p.can_accommodate(&l_high)
                };
                if !fits {
                    self.do_split_parent(txn, cursor)?;
                }
                self.do_link(txn, cursor)?;
                cursor.unfix_q();
                cursor.q = cursor.r.take();
                let q_right = {
                    let n = self.node(cursor.q_ref());
                    n.header()?.right_sibling
                };
                debug_assert_eq!(q_right, q_page);
                cursor.set_r(self.pool().fix_for_update(self.page_id(q_page))?);
                let still_underflowing = {
                    let r = self.node(cursor.r_ref());
                    r.is_about_to_underflow()?
                };
                if !still_underflowing {
                    cursor.unfix_p();
                    cursor.unfix_q();
                    cursor.q = cursor.r.take();
                } else {
                    self.do_unlink(txn, cursor)?;
                    let can_merge = {
                        let q = self.node(cursor.q_ref());
                        let r = self.node(cursor.r_ref());
                        q.can_merge_with(&r)?
                    };
                    if can_merge {
                        self.do_merge(txn, cursor)?;
                    } else {
                        self.do_redistribute(txn, cursor)?;
                    }
                }
            }
        }
        Ok(false)
    }

    /// Repairs an about-to-underflow child during update-mode descent.
    fn repair_page_underflow(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<()> {
        while self.do_repair_page_underflow(txn, cursor)? {}
        Ok(())
    }

    // -----------------------------------------------------------------
    // Traversals
    // -----------------------------------------------------------------

    /// Walks root → leaf in update mode, applying prophylactic repairs
    /// on the way down: tree height changes at the root, underflow
    /// repair, and linking of indirect children. On return `cursor.p`
    /// holds the leaf covering the search key, update-latched.
    pub(crate) fn update_mode_traverse(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<()> {
        cursor.set_p(
            self.pool()
                .fix_for_update(self.page_id(PageNumber::new(ROOT_PAGE_NUMBER)))?,
        );

        // A root with a right sibling means a root split completed but
        // the tree has not grown yet.
        let root_right = {
            let p = self.node(cursor.p_ref());
            p.header()?.right_sibling
        };
        if root_right.is_valid() {
            cursor.q = cursor.p.take();
            cursor.set_r(self.pool().fix_for_update(self.page_id(root_right))?);
            self.do_increase_tree_height(txn, cursor)?;
            cursor.p = cursor.q.take();
        }

        if self.node(cursor.p_ref()).is_leaf() {
            return Ok(());
        }

        let child = {
            let p = self.node(cursor.p_ref());
            p.find_child_page(&cursor.search_key)?
        };
        if !child.is_valid() {
            return Err(IndexError::corrupt("no child covers the search key"));
        }
        cursor.set_q(self.pool().fix_for_update(self.page_id(child))?);
        let mut child_latched = true;

        // A root with a single child that has no sibling shrinks the
        // tree by one level.
        let shrink = {
            let p = self.node(cursor.p_ref());
            let q = self.node(cursor.q_ref());
            p.is_root() && p.key_count()? == 1 && !q.header()?.right_sibling.is_valid()
        };
        if shrink {
            self.do_decrease_tree_height(txn, cursor)?;
            child_latched = false;
        }

        loop {
            if self.node(cursor.p_ref()).is_leaf() {
                return Ok(());
            }
            if !child_latched {
                let child = {
                    let p = self.node(cursor.p_ref());
                    p.find_child_page(&cursor.search_key)?
                };
                if !child.is_valid() {
                    return Err(IndexError::corrupt("no child covers the search key"));
                }
                cursor.set_q(self.pool().fix_for_update(self.page_id(child))?);
            } else {
                child_latched = false;
            }

            let underflowing = {
                let q = self.node(cursor.q_ref());
                q.is_about_to_underflow()?
            };
            if underflowing {
                self.repair_page_underflow(txn, cursor)?;
                cursor.p = cursor.q.take();
                continue;
            }

            let q_page = cursor.q_ref().page_id().page_number();
            let (u, v) = {
                let p = self.node(cursor.p_ref());
                let q = self.node(cursor.q_ref());
                let v = p
                    .find_index_item(q_page)?
                    .ok_or_else(|| IndexError::corrupt("child missing from parent"))?
                    .1;
                (q.high_key()?, v)
            };
            if u.compare(&v) == Ordering::Less {
                // Q has an indirect right sibling; link it in first.
                let fits = {
                    let p = self.node(cursor.p_ref());
                    p.can_accommodate(&u)
                };
                if !fits {
                    self.do_split_parent(txn, cursor)?;
                }
                self.do_link(txn, cursor)?;
            }

            let covers = {
                let q = self.node(cursor.q_ref());
                q.high_key()?.compare(&cursor.search_key) != Ordering::Less
            };
            if covers {
                cursor.unfix_p();
                cursor.p = cursor.q.take();
            } else {
                // Move right within the level.
                let right = {
                    let q = self.node(cursor.q_ref());
                    q.header()?.right_sibling
                };
                if !right.is_valid() {
                    return Err(IndexError::corrupt("search key beyond rightmost page"));
                }
                cursor.unfix_p();
                cursor.set_p(self.pool().fix_for_update(self.page_id(right))?);
                cursor.unfix_q();
            }
        }
    }

    /// Walks root → leaf with shared latches and latch coupling,
    /// tolerating in-progress SMOs by moving right whenever the page's
    /// high key is below the search key. On return `cursor.p` holds the
    /// leaf, shared-latched.
    pub(crate) fn read_mode_traverse(&self, cursor: &mut BTreeCursor<C, D>) -> IndexResult<()> {
        cursor.set_p(
            self.pool()
                .fix_shared(self.page_id(PageNumber::new(ROOT_PAGE_NUMBER)))?,
        );
        loop {
            // Move right past pages that no longer cover the key.
            loop {
                let (covered, right) = {
                    let p = self.node(cursor.p_ref());
                    let covered =
                        p.high_key()?.compare(&cursor.search_key) != Ordering::Less;
                    (covered, p.header()?.right_sibling)
                };
                if covered {
                    break;
                }
                if !right.is_valid() {
                    return Err(IndexError::corrupt("search key beyond rightmost page"));
                }
                cursor.set_q(self.pool().fix_shared(self.page_id(right))?);
                cursor.unfix_p();
                cursor.p = cursor.q.take();
            }
            if self.node(cursor.p_ref()).is_leaf() {
                return Ok(());
            }
            let child = {
                let p = self.node(cursor.p_ref());
                p.find_child_page(&cursor.search_key)?
            };
            if !child.is_valid() {
                return Err(IndexError::corrupt("no child covers the search key"));
            }
            cursor.set_q(self.pool().fix_shared(self.page_id(child))?);
            cursor.unfix_p();
            cursor.p = cursor.q.take();
        }
    }

    // -----------------------------------------------------------------
    // Insert
    // -----------------------------------------------------------------

    /// Update-mode traverse to the leaf, splitting it when the new key
    /// does not fit, then upgrade and locate the insertion slot.
    fn do_insert_traverse(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
    ) -> IndexResult<SearchResult<C::Key, D::Location>> {
        self.update_mode_traverse(txn, cursor)?;
        let fits = {
            let node = self.node(cursor.p_ref());
            debug_assert!(node.is_leaf() && !node.is_deallocated());
            node.can_accommodate(&cursor.search_key)
        };
        if !fits {
            cursor.q = cursor.p.take();
            self.do_split(txn, cursor)?;
            cursor.p = cursor.q.take();
        }
        cursor.p_mut().upgrade_update_latch();
        let node = self.node(cursor.p_ref());
        node.search(&cursor.search_key)
    }

    /// Locks the next key after the insertion/deletion point. The next
    /// key is at `next_slot` of the current page, the first key of
    /// `next_page`, or the current page's high key (the INFINITY
    /// sentinel on the rightmost page).
    ///
    /// Returns false when the caller must restart: the conditional lock
    /// failed, and after the unconditional wait the page LSNs had
    /// changed.
    fn do_next_key_lock(
        &self,
        txn: &mut Transaction,
        cursor: &mut BTreeCursor<C, D>,
        next_page: PageNumber,
        next_slot: Option<usize>,
        mode: LockMode,
        duration: LockDuration,
    ) -> IndexResult<bool> {
        let current_id = cursor.p_ref().page_id();
        let current_lsn = cursor.p_ref().page_lsn();

        let (location, next_page_lsn) = if next_page.is_valid() {
            cursor.set_r(self.pool().fix_shared(self.page_id(next_page))?);
            let fix = cursor.r_ref();
            let node = Node::new(fix.page(), &self.mgr.codec);
            (node.item(1)?.location, Some(fix.page_lsn()))
        } else {
            let node = self.node(cursor.p_ref());
            let item = match next_slot {
                Some(slot) => node.item(slot)?,
                None => node.high_key()?,
            };
            (item.location, None)
        };

        let name = self.codec().locations.lock_name(&location);
        if txn.try_acquire_lock(&name, mode, duration) {
            return Ok(true);
        }
        trace!(%name, "next-key lock busy; waiting unconditionally");

        // Another transaction is active in this key range: release the
        // latches and wait for it.
        cursor.unfix_p();
        cursor.unfix_r();
        txn.acquire_lock(&name, mode, duration)?;

        // Re-latch and check whether anything moved meanwhile.
        cursor.set_p(
            self.pool()
                .fix_exclusive(current_id, false, PageType::Slotted)?,
        );
        if next_page.is_valid() {
            cursor.set_r(self.pool().fix_shared(self.page_id(next_page))?);
        }
        if cursor.p_ref().page_lsn() == current_lsn {
            match next_page_lsn {
                None => return Ok(true),
                Some(lsn) if cursor.r_ref().page_lsn() == lsn => return Ok(true),
                _ => {}
            }
        }
        cursor.unfix_r();
        cursor.unfix_p();
        Ok(false)
    }

    /// One insert attempt; false means restart from the top.
    fn do_insert(
        &self,
        txn: &mut Transaction,
        key: &C::Key,
        location: &D::Location,
    ) -> IndexResult<bool> {
        let search_key = IndexItem {
            key: key.clone(),
            location: location.clone(),
            child_page: PageNumber::NULL,
            leaf: true,
            unique: self.unique,
        };
        let mut cursor: BTreeCursor<C, D> = BTreeCursor::new(search_key);

        let mut sr = self.do_insert_traverse(txn, &mut cursor)?;

        let mut next_page = PageNumber::NULL;
        let mut next_slot: Option<usize> = None;
        match sr.slot {
            None => {
                // Past every real key: the next key lives in the right
                // sibling, or is this page's INFINITY high key.
                let right = {
                    let node = self.node(cursor.p_ref());
                    node.header()?.right_sibling
                };
                next_page = right;
                if right.is_valid() {
                    next_slot = Some(1);
                }
            }
            Some(slot) if !sr.exact => {
                next_slot = Some(slot);
            }
            Some(_) => {
                // Exact match: a duplicate exists. Probe its location
                // with a shared lock to distinguish a committed
                // duplicate from one still being rolled back.
                let savepoint = txn.create_savepoint();
                let existing = sr.item.as_ref().expect("exact match has an item");
                let name = self.codec().locations.lock_name(&existing.location);
                if !txn.try_acquire_lock(&name, LockMode::Shared, LockDuration::Manual) {
                    cursor.unfix_p();
                    txn.acquire_lock(&name, LockMode::Shared, LockDuration::Manual)?;
                    // The other transaction finished; look again.
                    sr = self.do_insert_traverse(txn, &mut cursor)?;
                }
                if sr.exact {
                    return Err(IndexError::UniqueConstraintViolation {
                        key: format!("{:?}", key),
                    });
                }
                // The duplicate vanished (deleted or rolled back):
                // drop the probe lock and restart.
                txn.rollback_to(&savepoint)?;
                return Ok(false);
            }
        }

        if !self.do_next_key_lock(
            txn,
            &mut cursor,
            next_page,
            next_slot,
            LockMode::Exclusive,
            LockDuration::Instant,
        )? {
            return Ok(false);
        }

        let payload: Payload<C, D> = IndexLogPayload::Insert {
            unique: self.unique,
            item: cursor.search_key.clone(),
        };
        let mut fix = cursor.p.take().expect("cursor slot P is empty");
        self.mgr.log_and_apply(txn, &mut fix, &payload, Lsn::NULL)?;
        Ok(true)
    }

    /// Inserts a key/location pair.
    ///
    /// Fails with [`IndexError::UniqueConstraintViolation`] when the
    /// pair (or, in a unique tree, the key) is already present and
    /// committed.
    pub fn insert(
        &self,
        txn: &mut Transaction,
        key: &C::Key,
        location: &D::Location,
    ) -> IndexResult<()> {
        while !self.do_insert(txn, key, location)? {}
        Ok(())
    }

    // -----------------------------------------------------------------
    // Delete
    // -----------------------------------------------------------------

    /// One delete attempt; false means restart.
    fn do_delete(
        &self,
        txn: &mut Transaction,
        key: &C::Key,
        location: &D::Location,
    ) -> IndexResult<bool> {
        let search_key = IndexItem {
            key: key.clone(),
            location: location.clone(),
            child_page: PageNumber::NULL,
            leaf: true,
            unique: self.unique,
        };
        let mut cursor: BTreeCursor<C, D> = BTreeCursor::new(search_key);

        self.update_mode_traverse(txn, &mut cursor)?;
        cursor.p_mut().upgrade_update_latch();

        let (next_page, next_slot) = {
            let node = self.node(cursor.p_ref());
            debug_assert!(node.is_leaf() && !node.is_deallocated());
            let sr = node.search(&cursor.search_key)?;
            if !sr.exact {
                return Err(IndexError::KeyNotFound {
                    key: format!("{:?}", key),
                });
            }
            let slot = sr.slot.expect("exact match has a slot");
            if slot == node.key_count()? {
                // Deleting the last key of the page: the next key is in
                // the right sibling, or the INFINITY high key here.
                let right = node.header()?.right_sibling;
                if right.is_valid() {
                    (right, Some(1))
                } else {
                    (PageNumber::NULL, None)
                }
            } else {
                (PageNumber::NULL, Some(slot + 1))
            }
        };

        // The next-key lock is held to end of transaction; it is what
        // serialises an insert into the gap this delete opens.
        if !self.do_next_key_lock(
            txn,
            &mut cursor,
            next_page,
            next_slot,
            LockMode::Exclusive,
            LockDuration::Manual,
        )? {
            return Ok(false);
        }

        let payload: Payload<C, D> = IndexLogPayload::Delete {
            unique: self.unique,
            item: cursor.search_key.clone(),
        };
        let mut fix = cursor.p.take().expect("cursor slot P is empty");
        self.mgr.log_and_apply(txn, &mut fix, &payload, Lsn::NULL)?;
        Ok(true)
    }

    /// Deletes a key/location pair; the caller is expected to hold an
    /// exclusive lock on the location already.
    ///
    /// Fails with [`IndexError::KeyNotFound`] when the pair is absent.
    pub fn delete(
        &self,
        txn: &mut Transaction,
        key: &C::Key,
        location: &D::Location,
    ) -> IndexResult<()> {
        while !self.do_delete(txn, key, location)? {}
        Ok(())
    }

    /// Opens a scan positioned before the first key ≥ the given
    /// key/location; fetched locations are locked in `mode`.
    pub fn open_scan(
        &self,
        key: &C::Key,
        location: &D::Location,
        mode: LockMode,
    ) -> IndexScan<C, D> {
        IndexScan::new(self.clone(), key.clone(), location.clone(), mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{RowLocation, RowLocationCodec, StringKeyCodec};
    use larch_storage::{BufferPoolConfig, ContainerManager};
    use larch_txn::{LockManager, TransactionManager, TransactionManagerConfig};
    use larch_wal::{LogConfig, LogManager};
    use std::time::Duration;
    use tempfile::TempDir;

    type Mgr = BTreeIndexManager<StringKeyCodec, RowLocationCodec>;

    struct Harness {
        log: Arc<LogManager>,
        txns: Arc<TransactionManager>,
        index: Arc<Mgr>,
    }

    fn open(dir: &std::path::Path, page_size: usize) -> Harness {
        let log = LogManager::open(
            LogConfig::within(dir.join("log"))
                .with_file_size(512 * 1024)
                .with_buffer_size(32 * 1024)
                .with_flush_interval(Duration::from_secs(60)),
        )
        .unwrap();
        let containers =
            Arc::new(ContainerManager::open(dir.join("data"), page_size).unwrap());
        let pool = Arc::new(BufferPool::new(
            BufferPoolConfig {
                num_frames: 64,
                page_size,
            },
            containers,
            Arc::clone(&log),
        ));
        let txns = TransactionManager::new(
            Arc::clone(&log),
            Arc::clone(&pool),
            Arc::new(LockManager::new()),
            TransactionManagerConfig::default(),
        );
        let index = Arc::new(Mgr::new(pool, StringKeyCodec, RowLocationCodec));
        txns.register_module(INDEX_MODULE_ID, Arc::clone(&index) as _);
        Harness { log, txns, index }
    }

    fn create_tree(h: &Harness, unique: bool) -> BTree<StringKeyCodec, RowLocationCodec> {
        let mut txn = h.txns.begin();
        h.index.create_index(&mut txn, 1, "idx", unique).unwrap();
        txn.commit().unwrap();
        h.index.index(1).unwrap()
    }

    #[test]
    fn test_create_index_root_has_sentinel() {
        let tmp = TempDir::new().unwrap();
        let h = open(tmp.path(), 8192);
        let tree = create_tree(&h, true);
        assert!(tree.is_unique());

        let root = h
            .index
            .pool()
            .fix_shared(PageId::new(1, PageNumber::new(ROOT_PAGE_NUMBER)))
            .unwrap();
        let node = Node::new(root.page(), h.index.codec());
        assert!(node.is_leaf());
        assert_eq!(node.physical_key_count().unwrap(), 1);
        let sentinel = node.item(1).unwrap();
        assert_eq!(sentinel.key, StringKeyCodec.max_key());
        drop(root);
        h.log.shutdown();
    }

    #[test]
    fn test_insert_and_delete_single_key() {
        let tmp = TempDir::new().unwrap();
        let h = open(tmp.path(), 8192);
        let tree = create_tree(&h, true);

        let mut txn = h.txns.begin();
        tree.insert(&mut txn, &"a1".to_string(), &RowLocation(10))
            .unwrap();
        txn.commit().unwrap();

        let mut txn = h.txns.begin();
        tree.delete(&mut txn, &"a1".to_string(), &RowLocation(10))
            .unwrap();
        txn.commit().unwrap();

        let mut txn = h.txns.begin();
        let err = tree
            .delete(&mut txn, &"a1".to_string(), &RowLocation(10))
            .unwrap_err();
        assert!(matches!(err, IndexError::KeyNotFound { .. }));
        txn.abort().unwrap();
        h.log.shutdown();
    }

    #[test]
    fn test_inserts_split_pages() {
        let tmp = TempDir::new().unwrap();
        // Small pages so a handful of keys forces splits.
        let h = open(tmp.path(), 512);
        let tree = create_tree(&h, true);

        for i in 0..40u32 {
            let mut txn = h.txns.begin();
            tree.insert(
                &mut txn,
                &format!("key{:03}", i),
                &RowLocation(u64::from(i) + 1),
            )
            .unwrap();
            txn.commit().unwrap();
        }

        // The root must have become an index page.
        let root = h
            .index
            .pool()
            .fix_shared(PageId::new(1, PageNumber::new(ROOT_PAGE_NUMBER)))
            .unwrap();
        let node = Node::new(root.page(), h.index.codec());
        assert!(!node.is_leaf());
        drop(root);
        h.log.shutdown();
    }

    #[test]
    fn test_unique_violation() {
        let tmp = TempDir::new().unwrap();
        let h = open(tmp.path(), 8192);
        let tree = create_tree(&h, true);

        let mut txn = h.txns.begin();
        tree.insert(&mut txn, &"dup".to_string(), &RowLocation(1))
            .unwrap();
        txn.commit().unwrap();

        let mut txn = h.txns.begin();
        let err = tree
            .insert(&mut txn, &"dup".to_string(), &RowLocation(1))
            .unwrap_err();
        assert!(matches!(err, IndexError::UniqueConstraintViolation { .. }));
        txn.abort().unwrap();
        h.log.shutdown();
    }

    #[test]
    fn test_abort_undoes_insert() {
        let tmp = TempDir::new().unwrap();
        let h = open(tmp.path(), 8192);
        let tree = create_tree(&h, true);

        let mut txn = h.txns.begin();
        tree.insert(&mut txn, &"gone".to_string(), &RowLocation(9))
            .unwrap();
        txn.abort().unwrap();

        // Retrying in a new transaction must succeed: the key is gone.
        let mut txn = h.txns.begin();
        tree.insert(&mut txn, &"gone".to_string(), &RowLocation(9))
            .unwrap();
        txn.commit().unwrap();
        h.log.shutdown();
    }

    #[test]
    fn test_abort_undoes_delete() {
        let tmp = TempDir::new().unwrap();
        let h = open(tmp.path(), 8192);
        let tree = create_tree(&h, true);

        let mut txn = h.txns.begin();
        tree.insert(&mut txn, &"kept".to_string(), &RowLocation(5))
            .unwrap();
        txn.commit().unwrap();

        let mut txn = h.txns.begin();
        tree.delete(&mut txn, &"kept".to_string(), &RowLocation(5))
            .unwrap();
        txn.abort().unwrap();

        // The delete rolled back; deleting again must succeed.
        let mut txn = h.txns.begin();
        tree.delete(&mut txn, &"kept".to_string(), &RowLocation(5))
            .unwrap();
        txn.commit().unwrap();
        h.log.shutdown();
    }

    #[test]
    fn test_deletes_shrink_tree() {
        let tmp = TempDir::new().unwrap();
        let h = open(tmp.path(), 512);
        let tree = create_tree(&h, true);

        for i in 0..40u32 {
            let mut txn = h.txns.begin();
            tree.insert(
                &mut txn,
                &format!("key{:03}", i),
                &RowLocation(u64::from(i) + 1),
            )
            .unwrap();
            txn.commit().unwrap();
        }
        for i in 0..40u32 {
            let mut txn = h.txns.begin();
            tree.delete(
                &mut txn,
                &format!("key{:03}", i),
                &RowLocation(u64::from(i) + 1),
            )
            .unwrap();
            txn.commit().unwrap();
        }

        // Only the sentinel remains reachable.
        let mut scan = tree.open_scan(&"a".to_string(), &RowLocation(0), LockMode::Shared);
        let mut txn = h.txns.begin();
        assert!(scan.fetch_next(&mut txn).unwrap());
        assert_eq!(scan.current_key().unwrap(), &StringKeyCodec.max_key());
        assert!(scan.is_eof());
        txn.commit().unwrap();
        h.log.shutdown();
    }
}
