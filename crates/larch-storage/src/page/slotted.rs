//! Slotted page operations.
//!
//! The slot directory lives right after the page header and grows down;
//! slot data grows up from the end of the page. Directory entries are
//! `{offset: u16, length: u16}`; a deleted slot keeps its directory
//! entry with a sentinel offset so slot numbers stay stable until the
//! slot is purged.

use larch_common::constants::PAGE_HEADER_SIZE;

use super::Page;

/// Bytes per slot directory entry.
pub const SLOT_OVERHEAD: usize = 4;

/// Directory offset marking a deleted slot.
const SLOT_DELETED: u16 = u16::MAX;

impl Page {
    fn slot_entry_offset(&self, slot: usize) -> usize {
        PAGE_HEADER_SIZE + slot * SLOT_OVERHEAD
    }

    fn read_slot(&self, slot: usize) -> (u16, u16) {
        let off = self.slot_entry_offset(slot);
        let bytes = self.bytes();
        (
            u16::from_be_bytes([bytes[off], bytes[off + 1]]),
            u16::from_be_bytes([bytes[off + 2], bytes[off + 3]]),
        )
    }

    fn write_slot(&mut self, slot: usize, offset: u16, length: u16) {
        let off = self.slot_entry_offset(slot);
        let bytes = self.bytes_mut();
        bytes[off..off + 2].copy_from_slice(&offset.to_be_bytes());
        bytes[off + 2..off + 4].copy_from_slice(&length.to_be_bytes());
    }

    /// True if the slot exists but has been deleted.
    pub fn is_slot_deleted(&self, slot: usize) -> bool {
        slot < self.slot_count() && self.read_slot(slot).0 == SLOT_DELETED
    }

    /// Returns the data of a live slot.
    pub fn slot(&self, slot: usize) -> Option<&[u8]> {
        if slot >= self.slot_count() {
            return None;
        }
        let (offset, length) = self.read_slot(slot);
        if offset == SLOT_DELETED {
            return None;
        }
        Some(&self.bytes()[offset as usize..offset as usize + length as usize])
    }

    /// Length of a slot's data.
    pub fn slot_data_length(&self, slot: usize) -> usize {
        self.slot(slot).map_or(0, <[u8]>::len)
    }

    /// Total footprint of a slot: data plus its directory entry.
    pub fn slot_length(&self, slot: usize) -> usize {
        self.slot_data_length(slot) + SLOT_OVERHEAD
    }

    /// Overhead of one slot directory entry.
    pub fn slot_overhead(&self) -> usize {
        SLOT_OVERHEAD
    }

    /// Total space available to slots and their data.
    pub fn space(&self) -> usize {
        self.size() - PAGE_HEADER_SIZE
    }

    /// Free bytes, counting holes left by deleted and purged slots.
    pub fn free_space(&self) -> usize {
        let mut used = self.slot_count() * SLOT_OVERHEAD;
        for slot in 0..self.slot_count() {
            used += self.slot_data_length(slot);
        }
        self.space() - used
    }

    fn directory_end(&self, slot_count: usize) -> usize {
        PAGE_HEADER_SIZE + slot_count * SLOT_OVERHEAD
    }

    fn contiguous_free(&self, slot_count: usize) -> usize {
        self.data_start().saturating_sub(self.directory_end(slot_count))
    }

    /// Inserts slot data at `slot`. With `replace` set, an existing
    /// entry at that position is overwritten (or appended when `slot`
    /// equals the slot count); otherwise existing entries shift right.
    ///
    /// Returns false when the page cannot hold the data.
    pub fn insert_at(&mut self, slot: usize, data: &[u8], replace: bool) -> bool {
        let count = self.slot_count();
        let appending = slot >= count;
        let new_count = if appending {
            slot + 1
        } else if replace {
            count
        } else {
            count + 1
        };

        // Free the replaced slot's data up front so its bytes count as
        // reclaimable space.
        if replace && !appending {
            let (offset, _) = self.read_slot(slot);
            if offset != SLOT_DELETED {
                self.write_slot(slot, SLOT_DELETED, 0);
            }
        }

        let entry_growth = (new_count - count) * SLOT_OVERHEAD;
        let mut free = self.space();
        for s in 0..count {
            free = free.saturating_sub(self.slot_length(s));
        }
        if free < data.len() + entry_growth {
            return false;
        }

        if self.contiguous_free(new_count) < data.len() {
            self.compact();
        }

        // Make room in the directory.
        if appending {
            for s in count..new_count - 1 {
                self.write_slot(s, SLOT_DELETED, 0);
            }
        } else if !replace {
            for s in (slot..count).rev() {
                let (o, l) = self.read_slot(s);
                self.write_slot(s + 1, o, l);
            }
        }
        self.set_slot_count(new_count);

        let new_start = self.data_start() - data.len();
        self.bytes_mut()[new_start..new_start + data.len()].copy_from_slice(data);
        self.set_data_start(new_start as u16);
        self.write_slot(slot, new_start as u16, data.len() as u16);
        true
    }

    /// Marks a slot deleted, freeing its data but keeping its directory
    /// entry so later slot numbers are unchanged.
    pub fn delete_slot(&mut self, slot: usize) {
        if slot < self.slot_count() {
            self.write_slot(slot, SLOT_DELETED, 0);
        }
    }

    /// Physically removes a slot: data and directory entry both go, and
    /// later slots shift left.
    pub fn purge(&mut self, slot: usize) {
        let count = self.slot_count();
        if slot >= count {
            return;
        }
        for s in slot + 1..count {
            let (o, l) = self.read_slot(s);
            self.write_slot(s - 1, o, l);
        }
        self.set_slot_count(count - 1);
    }

    /// Rewrites the data area contiguously at the end of the page.
    fn compact(&mut self) {
        let count = self.slot_count();
        let mut live: Vec<(usize, Vec<u8>)> = Vec::with_capacity(count);
        for slot in 0..count {
            if let Some(data) = self.slot(slot) {
                live.push((slot, data.to_vec()));
            }
        }
        let mut start = self.size();
        for (slot, data) in live {
            start -= data.len();
            self.bytes_mut()[start..start + data.len()].copy_from_slice(&data);
            self.write_slot(slot, start as u16, data.len() as u16);
        }
        self.set_data_start(start as u16);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::PageType;
    use larch_common::PageNumber;

    fn fresh_page() -> Page {
        let mut page = Page::new(512);
        page.format(PageNumber::new(5), PageType::Slotted);
        page
    }

    #[test]
    fn test_append_and_read() {
        let mut page = fresh_page();
        assert!(page.insert_at(0, b"alpha", false));
        assert!(page.insert_at(1, b"beta", false));
        assert_eq!(page.slot(0).unwrap(), b"alpha");
        assert_eq!(page.slot(1).unwrap(), b"beta");
        assert_eq!(page.slot_count(), 2);
        assert!(page.slot(2).is_none());
    }

    #[test]
    fn test_insert_shifts_right() {
        let mut page = fresh_page();
        page.insert_at(0, b"a", false);
        page.insert_at(1, b"c", false);
        page.insert_at(1, b"b", false);
        assert_eq!(page.slot(0).unwrap(), b"a");
        assert_eq!(page.slot(1).unwrap(), b"b");
        assert_eq!(page.slot(2).unwrap(), b"c");
    }

    #[test]
    fn test_replace_keeps_count() {
        let mut page = fresh_page();
        page.insert_at(0, b"old", false);
        page.insert_at(1, b"next", false);
        assert!(page.insert_at(0, b"replacement", true));
        assert_eq!(page.slot(0).unwrap(), b"replacement");
        assert_eq!(page.slot(1).unwrap(), b"next");
        assert_eq!(page.slot_count(), 2);
    }

    #[test]
    fn test_purge_shifts_left() {
        let mut page = fresh_page();
        page.insert_at(0, b"a", false);
        page.insert_at(1, b"b", false);
        page.insert_at(2, b"c", false);
        page.purge(1);
        assert_eq!(page.slot_count(), 2);
        assert_eq!(page.slot(0).unwrap(), b"a");
        assert_eq!(page.slot(1).unwrap(), b"c");
    }

    #[test]
    fn test_delete_keeps_slot_numbers() {
        let mut page = fresh_page();
        page.insert_at(0, b"a", false);
        page.insert_at(1, b"b", false);
        page.delete_slot(0);
        assert!(page.is_slot_deleted(0));
        assert!(page.slot(0).is_none());
        assert_eq!(page.slot(1).unwrap(), b"b");
        assert_eq!(page.slot_count(), 2);
    }

    #[test]
    fn test_replace_on_deleted_slot() {
        let mut page = fresh_page();
        page.insert_at(0, b"a", false);
        page.insert_at(1, b"b", false);
        page.delete_slot(1);
        assert!(page.insert_at(1, b"b2", true));
        assert_eq!(page.slot(1).unwrap(), b"b2");
    }

    #[test]
    fn test_free_space_accounting() {
        let mut page = fresh_page();
        let before = page.free_space();
        page.insert_at(0, b"12345678", false);
        assert_eq!(before - page.free_space(), 8 + SLOT_OVERHEAD);
        page.purge(0);
        assert_eq!(page.free_space(), before);
    }

    #[test]
    fn test_page_fills_up() {
        let mut page = fresh_page();
        let data = [0u8; 32];
        let mut n = 0;
        while page.insert_at(n, &data, false) {
            n += 1;
        }
        assert!(n > 0);
        // Exactly the free space accounting should have predicted.
        assert!(page.free_space() < data.len() + SLOT_OVERHEAD);
    }

    #[test]
    fn test_compaction_reclaims_holes() {
        let mut page = fresh_page();
        let chunk = [7u8; 40];
        let mut n = 0;
        while page.insert_at(n, &chunk, false) {
            n += 1;
        }
        // Free every other slot, leaving fragmented holes.
        for s in (0..n).step_by(2) {
            page.delete_slot(s);
        }
        // A large insert now only fits after compaction.
        let big = vec![9u8; 40 * (n / 2)];
        if page.free_space() >= big.len() {
            assert!(page.insert_at(n, &big, false));
            assert_eq!(page.slot(n).unwrap(), &big[..]);
        }
    }
}
