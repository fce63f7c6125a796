//! Index scans.
//!
//! A scan remembers the page and page LSN of its last fetch; as long as
//! the page is still a live leaf bound to the current key, the next
//! fetch resumes there without a traversal. Each candidate's location
//! is locked in the scan's declared mode before it is returned, so a
//! scan blocks behind a transaction that has deleted (but not yet
//! committed) a key in its path.

use std::cmp::Ordering;

use larch_common::{Lsn, PageId};
use larch_txn::{LockDuration, LockMode, Transaction};

use crate::error::IndexResult;
use crate::item::{IndexItem, KeyCodec, LocationCodec};
use crate::node::Node;
use crate::tree::{BTree, BTreeCursor, Item};

/// A forward scan over one tree.
pub struct IndexScan<C: KeyCodec, D: LocationCodec> {
    btree: BTree<C, D>,
    current_key: Item<C, D>,
    lock_mode: LockMode,
    page_id: Option<PageId>,
    page_lsn: Lsn,
    fetch_count: u64,
    eof: bool,
}

impl<C: KeyCodec, D: LocationCodec> IndexScan<C, D> {
    pub(crate) fn new(
        btree: BTree<C, D>,
        key: C::Key,
        location: D::Location,
        lock_mode: LockMode,
    ) -> Self {
        let unique = btree.is_unique();
        Self {
            btree,
            current_key: IndexItem {
                key,
                location,
                child_page: larch_common::PageNumber::NULL,
                leaf: true,
                unique,
            },
            lock_mode,
            page_id: None,
            page_lsn: Lsn::NULL,
            fetch_count: 0,
            eof: false,
        }
    }

    /// Key of the last fetched entry.
    pub fn current_key(&self) -> Option<&C::Key> {
        (self.fetch_count > 0).then_some(&self.current_key.key)
    }

    /// Location of the last fetched entry.
    pub fn current_location(&self) -> Option<&D::Location> {
        (self.fetch_count > 0).then_some(&self.current_key.location)
    }

    /// True once the INFINITY sentinel has been reached.
    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Advances to the next key, locking its location in the scan's
    /// mode. Returns false once the scan has already delivered the
    /// sentinel.
    pub fn fetch_next(&mut self, txn: &mut Transaction) -> IndexResult<bool> {
        if self.eof {
            return Ok(false);
        }
        while !self.do_fetch(txn)? {}
        Ok(true)
    }

    /// One fetch attempt; false means the candidate moved while we
    /// waited for its lock and the attempt restarts.
    fn do_fetch(&mut self, txn: &mut Transaction) -> IndexResult<bool> {
        let mut cursor: BTreeCursor<C, D> = BTreeCursor::new(self.current_key.clone());

        // Resume on the remembered page when it is still a live leaf
        // bound to the current key; otherwise retraverse.
        let mut positioned = false;
        if self.fetch_count > 0 {
            if let Some(page_id) = self.page_id {
                let fix = self.btree.pool().fix_shared(page_id)?;
                let still_bound = {
                    let node = Node::new(fix.page(), self.btree.codec());
                    if node.is_deallocated() || !node.is_leaf() {
                        false
                    } else {
                        fix.page_lsn() == self.page_lsn || node.covers(&self.current_key)?
                    }
                };
                if still_bound {
                    cursor.set_p(fix);
                    positioned = true;
                }
            }
        }
        if !positioned {
            self.btree.read_mode_traverse(&mut cursor)?;
        }

        let candidate = self.position(&mut cursor)?;
        let savepoint = txn.create_savepoint();
        let name = self
            .btree
            .codec()
            .locations
            .lock_name(&candidate.location);

        if txn.try_acquire_lock(&name, self.lock_mode, LockDuration::Manual) {
            self.accept(&cursor, candidate);
            return Ok(true);
        }

        // The location is locked by another transaction: release the
        // latch, wait it out, then verify the candidate is unchanged.
        cursor.unfix_p();
        txn.acquire_lock(&name, self.lock_mode, LockDuration::Manual)?;

        let mut retry: BTreeCursor<C, D> = BTreeCursor::new(self.current_key.clone());
        self.btree.read_mode_traverse(&mut retry)?;
        let rechecked = self.position(&mut retry)?;
        if rechecked.compare(&candidate) == Ordering::Equal {
            self.accept(&retry, rechecked);
            return Ok(true);
        }
        // Someone changed the key range meanwhile: give the lock back
        // and try again.
        txn.rollback_to(&savepoint)?;
        Ok(false)
    }

    /// Finds the next key after `current_key` starting from the leaf in
    /// `cursor.p`, crossing to right siblings as needed. Flags EOF when
    /// the next key is the INFINITY sentinel.
    fn position(&mut self, cursor: &mut BTreeCursor<C, D>) -> IndexResult<Item<C, D>> {
        self.eof = false;
        loop {
            let outcome = {
                let node = self.btree.node(cursor.p_ref());
                // An empty tree holds nothing but the sentinel.
                if node.is_leaf() && node.physical_key_count()? == 1 {
                    self.eof = true;
                    PositionOutcome::Found(node.item(1)?)
                } else {
                    let sr = node.search(&self.current_key)?;
                    match sr.slot {
                        Some(slot) if sr.exact && self.fetch_count > 0 => {
                            if slot == node.key_count()? {
                                let right = node.header()?.right_sibling;
                                if right.is_valid() {
                                    PositionOutcome::MoveRight(right)
                                } else {
                                    self.eof = true;
                                    PositionOutcome::Found(node.item(slot + 1)?)
                                }
                            } else {
                                PositionOutcome::Found(node.item(slot + 1)?)
                            }
                        }
                        Some(_) => {
                            PositionOutcome::Found(sr.item.expect("search hit has an item"))
                        }
                        None => {
                            // Every real key is below the current key.
                            let right = node.header()?.right_sibling;
                            if right.is_valid() {
                                PositionOutcome::MoveRight(right)
                            } else {
                                self.eof = true;
                                PositionOutcome::Found(
                                    node.item(node.physical_key_count()?)?,
                                )
                            }
                        }
                    }
                }
            };
            match outcome {
                PositionOutcome::Found(item) => return Ok(item),
                PositionOutcome::MoveRight(right) => {
                    cursor.set_q(self.btree.pool().fix_shared(self.btree.page_id(right))?);
                    cursor.unfix_p();
                    cursor.p = cursor.q.take();
                }
            }
        }
    }

    fn accept(&mut self, cursor: &BTreeCursor<C, D>, item: Item<C, D>) {
        let fix = cursor.p_ref();
        self.current_key = item;
        self.page_id = Some(fix.page_id());
        self.page_lsn = fix.page_lsn();
        self.fetch_count += 1;
    }
}

enum PositionOutcome<I> {
    Found(I),
    MoveRight(larch_common::PageNumber),
}
