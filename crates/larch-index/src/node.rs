//! B-link tree node layout over a slotted page.
//!
//! Slot 0 of every tree page holds the node header; slots `1..=key_count`
//! hold index items in strictly ascending order. In a leaf page the item
//! at `key_count` is the *high key*, an extra item that bounds the page
//! and may differ from the last real key. In a non-leaf page the last
//! item doubles as the high key and points at the rightmost child. The
//! rightmost page on every level ends in the INFINITY sentinel.

use std::cmp::Ordering;

use bytes::{Buf, BufMut};

use larch_common::constants::ROOT_PAGE_NUMBER;
use larch_common::PageNumber;
use larch_storage::Page;

use crate::error::{IndexError, IndexResult};
use crate::item::{IndexItem, ItemCodec, KeyCodec, LocationCodec};

/// Page flag: leaf page.
pub const FLAG_LEAF: u16 = 0x1;
/// Page flag: page belongs to a unique index.
pub const FLAG_UNIQUE: u16 = 0x2;
/// Page flag: page has been deallocated by a merge or height decrease.
pub const FLAG_DEALLOCATED: u16 = 0x4;

/// Node header stored at slot 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    /// Left sibling hint; maintained opportunistically, never trusted.
    pub left_sibling: PageNumber,
    /// Right sibling; `NULL` iff this is the rightmost page of a level.
    pub right_sibling: PageNumber,
    /// Number of physical items, including the leaf high key.
    pub key_count: u16,
}

impl NodeHeader {
    /// Serialized size.
    pub const SIZE: usize = 10;

    /// Encodes the header.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.put_u32(self.left_sibling.as_u32());
        buf.put_u32(self.right_sibling.as_u32());
        buf.put_u16(self.key_count);
        buf
    }

    /// Decodes a header.
    pub fn decode(mut data: &[u8]) -> IndexResult<Self> {
        if data.remaining() < Self::SIZE {
            return Err(IndexError::corrupt("node header truncated"));
        }
        Ok(Self {
            left_sibling: PageNumber::new(data.get_u32()),
            right_sibling: PageNumber::new(data.get_u32()),
            key_count: data.get_u16(),
        })
    }
}

/// Result of a key search within one node.
#[derive(Debug, Clone)]
pub struct SearchResult<K, L> {
    /// Slot of the first item ≥ the search key; `None` when every real
    /// key in the page is smaller.
    pub slot: Option<usize>,
    /// The item at `slot`.
    pub item: Option<IndexItem<K, L>>,
    /// Whether the item equals the search key exactly.
    pub exact: bool,
}

/// Formats a fresh tree page: flags plus an empty header at slot 0.
pub fn format_node(page: &mut Page, leaf: bool, unique: bool) {
    let mut flags = 0;
    if leaf {
        flags |= FLAG_LEAF;
    }
    if unique {
        flags |= FLAG_UNIQUE;
    }
    page.set_flags(flags);
    let header = NodeHeader {
        left_sibling: PageNumber::NULL,
        right_sibling: PageNumber::NULL,
        key_count: 0,
    };
    page.insert_at(0, &header.encode(), true);
}

/// Read view of a tree node.
pub struct Node<'a, C: KeyCodec, D: LocationCodec> {
    page: &'a Page,
    codec: &'a ItemCodec<C, D>,
}

impl<'a, C: KeyCodec, D: LocationCodec> Node<'a, C, D> {
    /// Wraps a page.
    pub fn new(page: &'a Page, codec: &'a ItemCodec<C, D>) -> Self {
        Self { page, codec }
    }

    /// The underlying page.
    pub fn page(&self) -> &Page {
        self.page
    }

    /// The node header.
    pub fn header(&self) -> IndexResult<NodeHeader> {
        let raw = self
            .page
            .slot(0)
            .ok_or_else(|| IndexError::corrupt("missing node header"))?;
        NodeHeader::decode(raw)
    }

    /// Whether this is a leaf page.
    pub fn is_leaf(&self) -> bool {
        self.page.flags() & FLAG_LEAF != 0
    }

    /// Whether the page belongs to a unique index.
    pub fn is_unique(&self) -> bool {
        self.page.flags() & FLAG_UNIQUE != 0
    }

    /// Whether the page has been deallocated.
    pub fn is_deallocated(&self) -> bool {
        self.page.flags() & FLAG_DEALLOCATED != 0
    }

    /// Whether this page is the tree's root.
    pub fn is_root(&self) -> bool {
        self.page.page_number() == PageNumber::new(ROOT_PAGE_NUMBER)
    }

    /// Number of physical items, including the leaf high key.
    pub fn physical_key_count(&self) -> IndexResult<usize> {
        Ok(usize::from(self.header()?.key_count))
    }

    /// Number of real keys: the leaf high key is excluded.
    pub fn key_count(&self) -> IndexResult<usize> {
        let physical = self.physical_key_count()?;
        Ok(if self.is_leaf() {
            physical.saturating_sub(1)
        } else {
            physical
        })
    }

    /// Decodes the item at a slot.
    pub fn item(&self, slot: usize) -> IndexResult<IndexItem<C::Key, D::Location>> {
        let raw = self
            .page
            .slot(slot)
            .ok_or_else(|| IndexError::corrupt(format!("missing item at slot {}", slot)))?;
        self.codec
            .decode_item(&mut &raw[..], self.is_leaf(), self.is_unique())
    }

    /// The page's high key: always the last physical item.
    pub fn high_key(&self) -> IndexResult<IndexItem<C::Key, D::Location>> {
        self.item(self.physical_key_count()?)
    }

    /// The largest real key.
    pub fn last_key(&self) -> IndexResult<IndexItem<C::Key, D::Location>> {
        self.item(self.key_count()?)
    }

    /// Finds the first real key ≥ `key`. The leaf high key is not
    /// consulted.
    pub fn search(
        &self,
        key: &IndexItem<C::Key, D::Location>,
    ) -> IndexResult<SearchResult<C::Key, D::Location>> {
        let count = self.key_count()?;
        let mut lo = 1usize;
        let mut hi = count + 1;
        // First slot whose item is >= key.
        while lo < hi {
            let mid = (lo + hi) / 2;
            let item = self.item(mid)?;
            if item.compare(key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo > count {
            return Ok(SearchResult {
                slot: None,
                item: None,
                exact: false,
            });
        }
        let item = self.item(lo)?;
        let exact = item.compare(key) == Ordering::Equal;
        Ok(SearchResult {
            slot: Some(lo),
            item: Some(item),
            exact,
        })
    }

    /// The child covering `key` (non-leaf pages).
    pub fn find_child_page(
        &self,
        key: &IndexItem<C::Key, D::Location>,
    ) -> IndexResult<PageNumber> {
        for slot in 1..=self.key_count()? {
            let item = self.item(slot)?;
            if item.compare(key) != Ordering::Less {
                return Ok(item.child_page);
            }
        }
        Ok(PageNumber::NULL)
    }

    /// The index item pointing at `child_page`, with its slot.
    pub fn find_index_item(
        &self,
        child_page: PageNumber,
    ) -> IndexResult<Option<(usize, IndexItem<C::Key, D::Location>)>> {
        for slot in 1..=self.key_count()? {
            let item = self.item(slot)?;
            if item.child_page == child_page {
                return Ok(Some((slot, item)));
            }
        }
        Ok(None)
    }

    /// The index item just before the one pointing at `child_page`.
    pub fn find_prev_index_item(
        &self,
        child_page: PageNumber,
    ) -> IndexResult<Option<IndexItem<C::Key, D::Location>>> {
        let mut prev = None;
        for slot in 1..=self.key_count()? {
            let item = self.item(slot)?;
            if item.child_page == child_page {
                return Ok(prev);
            }
            prev = Some(item);
        }
        Ok(None)
    }

    /// Whether `item` fits in this page.
    pub fn can_accommodate(&self, item: &IndexItem<C::Key, D::Location>) -> bool {
        let required = self.codec.encoded_len(item) + self.page.slot_overhead();
        required <= self.page.free_space()
    }

    /// Whether this page can absorb its right sibling's items.
    pub fn can_merge_with(&self, right: &Node<'_, C, D>) -> IndexResult<bool> {
        let mut required = 0isize;
        if self.is_leaf() {
            // The left high key is dropped first.
            required -= self.page.slot_length(self.physical_key_count()?) as isize;
        }
        for slot in 1..=right.physical_key_count()? {
            required += right.page.slot_length(slot) as isize;
        }
        Ok(required < self.page.free_space() as isize)
    }

    /// Whether `item` lies between this page's first and last real keys.
    pub fn covers(&self, item: &IndexItem<C::Key, D::Location>) -> IndexResult<bool> {
        let count = self.key_count()?;
        if count == 0 {
            return Ok(false);
        }
        let first = self.item(1)?;
        let last = self.item(count)?;
        Ok(first.compare(item) != Ordering::Greater && last.compare(item) != Ordering::Less)
    }

    /// The fewest real keys a page may hold.
    pub fn minimum_keys(&self) -> usize {
        if self.is_root() {
            1
        } else {
            2
        }
    }

    /// Whether the page is at its minimum legal key count.
    pub fn is_about_to_underflow(&self) -> IndexResult<bool> {
        Ok(self.key_count()? == self.minimum_keys())
    }

    /// The split point: the first slot where the running byte size
    /// passes half the page's space.
    pub fn split_slot(&self) -> IndexResult<usize> {
        let half = self.page.space() / 2;
        let mut used = 0;
        for slot in 1..=self.physical_key_count()? {
            used += self.page.slot_length(slot);
            if used > half {
                return Ok(slot);
            }
        }
        Err(IndexError::corrupt("no split point in page"))
    }
}

/// Write view of a tree node.
pub struct NodeMut<'a, C: KeyCodec, D: LocationCodec> {
    page: &'a mut Page,
    codec: &'a ItemCodec<C, D>,
}

impl<'a, C: KeyCodec, D: LocationCodec> NodeMut<'a, C, D> {
    /// Wraps a page for mutation.
    pub fn new(page: &'a mut Page, codec: &'a ItemCodec<C, D>) -> Self {
        Self { page, codec }
    }

    /// Read view of the same node.
    pub fn as_node(&self) -> Node<'_, C, D> {
        Node::new(self.page, self.codec)
    }

    /// The node header.
    pub fn header(&self) -> IndexResult<NodeHeader> {
        self.as_node().header()
    }

    /// Rewrites the header at slot 0.
    pub fn set_header(&mut self, header: NodeHeader) {
        self.page.insert_at(0, &header.encode(), true);
    }

    /// Inserts an item at `slot`, shifting later items right.
    pub fn insert_item(&mut self, slot: usize, item: &IndexItem<C::Key, D::Location>) -> bool {
        let mut buf = Vec::new();
        self.codec.encode_item(item, &mut buf);
        self.page.insert_at(slot, &buf, false)
    }

    /// Replaces (or appends) the item at `slot`.
    pub fn replace_item(&mut self, slot: usize, item: &IndexItem<C::Key, D::Location>) -> bool {
        let mut buf = Vec::new();
        self.codec.encode_item(item, &mut buf);
        self.page.insert_at(slot, &buf, true)
    }

    /// Physically removes the item at `slot`.
    pub fn purge(&mut self, slot: usize) {
        self.page.purge(slot);
    }

    /// Marks the item at `slot` deleted, keeping slot numbers stable.
    pub fn delete_slot(&mut self, slot: usize) {
        self.page.delete_slot(slot);
    }

    /// Marks the page deallocated.
    pub fn set_deallocated(&mut self) {
        let flags = self.page.flags();
        self.page.set_flags(flags | FLAG_DEALLOCATED);
    }

    /// The underlying page.
    pub fn page_mut(&mut self) -> &mut Page {
        self.page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{RowLocation, RowLocationCodec, StringKeyCodec};
    use larch_storage::PageType;

    type Codec = ItemCodec<StringKeyCodec, RowLocationCodec>;

    fn codec() -> Codec {
        ItemCodec::new(StringKeyCodec, RowLocationCodec)
    }

    fn item(key: &str, loc: u64) -> IndexItem<String, RowLocation> {
        IndexItem::leaf_item(key.to_string(), RowLocation(loc), true)
    }

    /// A leaf with keys a1, b1, c1 and high key c1.
    fn leaf_page(codec: &Codec) -> Page {
        let mut page = Page::new(512);
        page.format(PageNumber::new(5), PageType::Slotted);
        format_node(&mut page, true, true);
        let mut node = NodeMut::new(&mut page, codec);
        node.insert_item(1, &item("a1", 10));
        node.insert_item(2, &item("b1", 20));
        node.insert_item(3, &item("c1", 30));
        node.insert_item(4, &item("c1", 30)); // high key copy
        node.set_header(NodeHeader {
            left_sibling: PageNumber::NULL,
            right_sibling: PageNumber::NULL,
            key_count: 4,
        });
        page
    }

    #[test]
    fn test_header_roundtrip() {
        let header = NodeHeader {
            left_sibling: PageNumber::new(3),
            right_sibling: PageNumber::new(7),
            key_count: 12,
        };
        let decoded = NodeHeader::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_leaf_key_count_excludes_high_key() {
        let codec = codec();
        let page = leaf_page(&codec);
        let node = Node::new(&page, &codec);
        assert_eq!(node.physical_key_count().unwrap(), 4);
        assert_eq!(node.key_count().unwrap(), 3);
        assert_eq!(node.high_key().unwrap().key, "c1");
        assert_eq!(node.last_key().unwrap().key, "c1");
    }

    #[test]
    fn test_search_exact_and_between() {
        let codec = codec();
        let page = leaf_page(&codec);
        let node = Node::new(&page, &codec);

        let sr = node.search(&item("b1", 20)).unwrap();
        assert_eq!(sr.slot, Some(2));
        assert!(sr.exact);

        let sr = node.search(&item("a2", 0)).unwrap();
        assert_eq!(sr.slot, Some(2));
        assert!(!sr.exact);
        assert_eq!(sr.item.unwrap().key, "b1");

        let sr = node.search(&item("zz", 0)).unwrap();
        assert!(sr.slot.is_none());
    }

    #[test]
    fn test_covers() {
        let codec = codec();
        let page = leaf_page(&codec);
        let node = Node::new(&page, &codec);
        assert!(node.covers(&item("a1", 10)).unwrap());
        assert!(node.covers(&item("b5", 0)).unwrap());
        assert!(!node.covers(&item("zz", 0)).unwrap());
        assert!(!node.covers(&item("a0", 0)).unwrap());
    }

    #[test]
    fn test_find_child_page() {
        let codec = codec();
        let mut page = Page::new(512);
        page.format(PageNumber::new(2), PageType::Slotted);
        format_node(&mut page, false, true);
        {
            let mut node = NodeMut::new(&mut page, &codec);
            let mut left = item("g", 0);
            left.leaf = false;
            left.child_page = PageNumber::new(10);
            let mut right = codec.infinity_item(false, true);
            right.child_page = PageNumber::new(11);
            node.insert_item(1, &left);
            node.insert_item(2, &right);
            node.set_header(NodeHeader {
                left_sibling: PageNumber::NULL,
                right_sibling: PageNumber::NULL,
                key_count: 2,
            });
        }
        let node = Node::new(&page, &codec);
        assert_eq!(
            node.find_child_page(&item("a", 0)).unwrap(),
            PageNumber::new(10)
        );
        assert_eq!(
            node.find_child_page(&item("x", 0)).unwrap(),
            PageNumber::new(11)
        );
        assert_eq!(
            node.find_index_item(PageNumber::new(11)).unwrap().unwrap().0,
            2
        );
        assert_eq!(
            node.find_prev_index_item(PageNumber::new(11))
                .unwrap()
                .unwrap()
                .child_page,
            PageNumber::new(10)
        );
    }

    #[test]
    fn test_split_slot_near_middle() {
        let codec = codec();
        let mut page = Page::new(512);
        page.format(PageNumber::new(5), PageType::Slotted);
        format_node(&mut page, true, true);
        let mut node = NodeMut::new(&mut page, &codec);
        for i in 1..=10usize {
            node.insert_item(i, &item(&format!("k{:02}", i), i as u64));
        }
        node.set_header(NodeHeader {
            left_sibling: PageNumber::NULL,
            right_sibling: PageNumber::NULL,
            key_count: 10,
        });
        let split = Node::new(&page, &codec).split_slot().unwrap();
        assert!(split > 1 && split <= 10);
    }

    #[test]
    fn test_minimum_keys_and_underflow() {
        let codec = codec();
        let page = leaf_page(&codec);
        let node = Node::new(&page, &codec);
        assert_eq!(node.minimum_keys(), 2);
        assert!(!node.is_about_to_underflow().unwrap());
    }
}
