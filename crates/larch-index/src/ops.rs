//! Logged B-link tree operations.
//!
//! Every change to a tree page is described by one of these payloads,
//! carried inside the transactional record envelope. Serialisation is
//! an explicit match over the variants; items are encoded through the
//! index's codecs.

use bytes::{Buf, BufMut, Bytes};

use larch_common::{PageId, PageNumber};
use larch_txn::RecordFlags;

use crate::error::{IndexError, IndexResult};
use crate::item::{IndexItem, ItemCodec, KeyCodec, LocationCodec};

/// Tree operation payloads.
#[derive(Debug, Clone)]
pub enum IndexLogPayload<K, L> {
    /// Installs a fully described page and its space-map bit. Used by
    /// index bootstrap and the test page loader.
    LoadPage {
        leaf: bool,
        unique: bool,
        space_map_page: PageNumber,
        left_sibling: PageNumber,
        right_sibling: PageNumber,
        items: Vec<IndexItem<K, L>>,
    },
    /// Splits the logged page, moving `items` into a new right sibling.
    Split {
        leaf: bool,
        unique: bool,
        new_sibling: PageNumber,
        /// The split page's old right sibling, inherited by the new one.
        right_sibling: PageNumber,
        space_map_page: PageNumber,
        /// New high key of the left page (leaf splits only).
        high_key: Option<IndexItem<K, L>>,
        /// Physical key count of the left page after the split.
        new_key_count: u16,
        items: Vec<IndexItem<K, L>>,
    },
    /// Absorbs the right sibling's items into the logged page.
    Merge {
        leaf: bool,
        unique: bool,
        right_sibling: PageNumber,
        right_space_map_page: PageNumber,
        /// The right sibling's own right sibling.
        right_right_sibling: PageNumber,
        items: Vec<IndexItem<K, L>>,
    },
    /// Links an indirect child into the parent (the logged page).
    Link {
        unique: bool,
        left_sibling: PageNumber,
        right_sibling: PageNumber,
        /// New parent entry `(leftChildHighKey, leftSibling)`.
        left_child_high_key: IndexItem<K, L>,
    },
    /// Unlinks the right child from the parent (the logged page).
    Unlink {
        unique: bool,
        left_sibling: PageNumber,
        right_sibling: PageNumber,
    },
    /// Moves one key between siblings.
    Redistribute {
        leaf: bool,
        unique: bool,
        left_sibling: PageNumber,
        right_sibling: PageNumber,
        /// Recipient of the key.
        target_sibling: PageNumber,
        key: IndexItem<K, L>,
    },
    /// Moves the root's contents into a new child; the root becomes a
    /// two-entry index page over the child and its right sibling.
    IncreaseTreeHeight {
        leaf: bool,
        unique: bool,
        left_child: PageNumber,
        right_child: PageNumber,
        space_map_page: PageNumber,
        items: Vec<IndexItem<K, L>>,
        root_items: Vec<IndexItem<K, L>>,
    },
    /// Absorbs the root's sole child back into the root.
    DecreaseTreeHeight {
        leaf: bool,
        unique: bool,
        child_page: PageNumber,
        child_space_map_page: PageNumber,
        items: Vec<IndexItem<K, L>>,
    },
    /// Inserts a key into a leaf.
    Insert { unique: bool, item: IndexItem<K, L> },
    /// Compensation for an insert: removes the key at `slot`.
    UndoInsert {
        unique: bool,
        slot: u16,
        item: IndexItem<K, L>,
    },
    /// Deletes a key from a leaf.
    Delete { unique: bool, item: IndexItem<K, L> },
    /// Compensation for a delete: reinserts the key at `slot`.
    UndoDelete {
        unique: bool,
        slot: u16,
        item: IndexItem<K, L>,
    },
    /// Sets a page's allocation bit (applied to the space map page).
    AllocatePage { page: PageNumber },
    /// Clears a page's allocation bit (applied to the space map page).
    FreePage { page: PageNumber },
}

const TAG_LOAD_PAGE: u8 = 1;
const TAG_SPLIT: u8 = 2;
const TAG_MERGE: u8 = 3;
const TAG_LINK: u8 = 4;
const TAG_UNLINK: u8 = 5;
const TAG_REDISTRIBUTE: u8 = 6;
const TAG_INCREASE_HEIGHT: u8 = 7;
const TAG_DECREASE_HEIGHT: u8 = 8;
const TAG_INSERT: u8 = 9;
const TAG_UNDO_INSERT: u8 = 10;
const TAG_DELETE: u8 = 11;
const TAG_UNDO_DELETE: u8 = 12;
const TAG_ALLOCATE_PAGE: u8 = 13;
const TAG_FREE_PAGE: u8 = 14;

fn put_page(buf: &mut Vec<u8>, page: PageNumber) {
    buf.put_u32(page.as_u32());
}

fn get_page(buf: &mut &[u8]) -> IndexResult<PageNumber> {
    if buf.remaining() < 4 {
        return Err(IndexError::bad_encoding("payload truncated"));
    }
    Ok(PageNumber::new(buf.get_u32()))
}

fn put_bool(buf: &mut Vec<u8>, v: bool) {
    buf.put_u8(u8::from(v));
}

fn get_bool(buf: &mut &[u8]) -> IndexResult<bool> {
    if buf.remaining() < 1 {
        return Err(IndexError::bad_encoding("payload truncated"));
    }
    Ok(buf.get_u8() != 0)
}

impl<C: KeyCodec, D: LocationCodec> ItemCodec<C, D> {
    fn encode_items(&self, items: &[IndexItem<C::Key, D::Location>], buf: &mut Vec<u8>) {
        buf.put_u16(items.len() as u16);
        for item in items {
            self.encode_item(item, buf);
        }
    }

    fn decode_items(
        &self,
        buf: &mut &[u8],
        leaf: bool,
        unique: bool,
    ) -> IndexResult<Vec<IndexItem<C::Key, D::Location>>> {
        if buf.remaining() < 2 {
            return Err(IndexError::bad_encoding("item list truncated"));
        }
        let n = buf.get_u16() as usize;
        let mut items = Vec::with_capacity(n);
        for _ in 0..n {
            items.push(self.decode_item(buf, leaf, unique)?);
        }
        Ok(items)
    }
}

impl<K, L> IndexLogPayload<K, L> {
    /// Record flags for this operation.
    pub fn flags(&self) -> RecordFlags {
        use IndexLogPayload::*;
        match self {
            LoadPage { .. } => RecordFlags::REDO | RecordFlags::MULTI_PAGE,
            Split { .. } => RecordFlags::REDO | RecordFlags::CLR | RecordFlags::MULTI_PAGE,
            Merge { .. } => RecordFlags::REDO | RecordFlags::MULTI_PAGE,
            Link { .. } | Unlink { .. } => RecordFlags::REDO,
            Redistribute { .. } => RecordFlags::REDO | RecordFlags::MULTI_PAGE,
            IncreaseTreeHeight { .. } => {
                RecordFlags::REDO | RecordFlags::CLR | RecordFlags::MULTI_PAGE
            }
            DecreaseTreeHeight { .. } => RecordFlags::REDO | RecordFlags::MULTI_PAGE,
            Insert { .. } | Delete { .. } => {
                RecordFlags::REDO | RecordFlags::UNDO | RecordFlags::LOGICAL_UNDO
            }
            UndoInsert { .. } | UndoDelete { .. } => RecordFlags::REDO | RecordFlags::CLR,
            AllocatePage { .. } => RecordFlags::REDO | RecordFlags::UNDO,
            FreePage { .. } => RecordFlags::REDO,
        }
    }

    /// Pages this operation's redo applies to, given the primary page.
    pub fn page_ids(&self, primary: PageId) -> Vec<PageId> {
        use IndexLogPayload::*;
        let container = primary.container_id();
        match self {
            LoadPage { space_map_page, .. } => {
                vec![primary, PageId::new(container, *space_map_page)]
            }
            Split { new_sibling, .. } => vec![primary, PageId::new(container, *new_sibling)],
            Merge { right_sibling, .. } => {
                vec![primary, PageId::new(container, *right_sibling)]
            }
            Redistribute { right_sibling, .. } => {
                vec![primary, PageId::new(container, *right_sibling)]
            }
            IncreaseTreeHeight { left_child, .. } => {
                vec![primary, PageId::new(container, *left_child)]
            }
            DecreaseTreeHeight { child_page, .. } => {
                vec![primary, PageId::new(container, *child_page)]
            }
            _ => vec![primary],
        }
    }
}

impl<K, L> IndexLogPayload<K, L>
where
    K: Clone + Ord + std::fmt::Debug + Send + Sync + 'static,
    L: Clone + Ord + std::fmt::Debug + Send + Sync + 'static,
{
    /// Serialises the payload.
    pub fn encode<C, D>(&self, codec: &ItemCodec<C, D>) -> Bytes
    where
        C: KeyCodec<Key = K>,
        D: LocationCodec<Location = L>,
    {
        use IndexLogPayload::*;
        let mut buf = Vec::new();
        match self {
            LoadPage {
                leaf,
                unique,
                space_map_page,
                left_sibling,
                right_sibling,
                items,
            } => {
                buf.put_u8(TAG_LOAD_PAGE);
                put_bool(&mut buf, *leaf);
                put_bool(&mut buf, *unique);
                put_page(&mut buf, *space_map_page);
                put_page(&mut buf, *left_sibling);
                put_page(&mut buf, *right_sibling);
                codec.encode_items(items, &mut buf);
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
                buf.put_u8(TAG_SPLIT);
                put_bool(&mut buf, *leaf);
                put_bool(&mut buf, *unique);
                put_page(&mut buf, *new_sibling);
                put_page(&mut buf, *right_sibling);
                put_page(&mut buf, *space_map_page);
                buf.put_u16(*new_key_count);
                put_bool(&mut buf, high_key.is_some());
                if let Some(hk) = high_key {
                    codec.encode_item(hk, &mut buf);
                }
                codec.encode_items(items, &mut buf);
            }
            Merge {
                leaf,
                unique,
                right_sibling,
                right_space_map_page,
                right_right_sibling,
                items,
            } => {
                buf.put_u8(TAG_MERGE);
                put_bool(&mut buf, *leaf);
                put_bool(&mut buf, *unique);
                put_page(&mut buf, *right_sibling);
                put_page(&mut buf, *right_space_map_page);
                put_page(&mut buf, *right_right_sibling);
                codec.encode_items(items, &mut buf);
            }
            Link {
                unique,
                left_sibling,
                right_sibling,
                left_child_high_key,
            } => {
                buf.put_u8(TAG_LINK);
                put_bool(&mut buf, *unique);
                put_page(&mut buf, *left_sibling);
                put_page(&mut buf, *right_sibling);
                codec.encode_item(left_child_high_key, &mut buf);
            }
            Unlink {
                unique,
                left_sibling,
                right_sibling,
            } => {
                buf.put_u8(TAG_UNLINK);
                put_bool(&mut buf, *unique);
                put_page(&mut buf, *left_sibling);
                put_page(&mut buf, *right_sibling);
            }
            Redistribute {
                leaf,
                unique,
                left_sibling,
                right_sibling,
                target_sibling,
                key,
            } => {
                buf.put_u8(TAG_REDISTRIBUTE);
                put_bool(&mut buf, *leaf);
                put_bool(&mut buf, *unique);
                put_page(&mut buf, *left_sibling);
                put_page(&mut buf, *right_sibling);
                put_page(&mut buf, *target_sibling);
                codec.encode_item(key, &mut buf);
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
                buf.put_u8(TAG_INCREASE_HEIGHT);
                put_bool(&mut buf, *leaf);
                put_bool(&mut buf, *unique);
                put_page(&mut buf, *left_child);
                put_page(&mut buf, *right_child);
                put_page(&mut buf, *space_map_page);
                codec.encode_items(items, &mut buf);
                codec.encode_items(root_items, &mut buf);
            }
            DecreaseTreeHeight {
                leaf,
                unique,
                child_page,
                child_space_map_page,
                items,
            } => {
                buf.put_u8(TAG_DECREASE_HEIGHT);
                put_bool(&mut buf, *leaf);
                put_bool(&mut buf, *unique);
                put_page(&mut buf, *child_page);
                put_page(&mut buf, *child_space_map_page);
                codec.encode_items(items, &mut buf);
            }
            Insert { unique, item } => {
                buf.put_u8(TAG_INSERT);
                put_bool(&mut buf, *unique);
                codec.encode_item(item, &mut buf);
            }
            UndoInsert { unique, slot, item } => {
                buf.put_u8(TAG_UNDO_INSERT);
                put_bool(&mut buf, *unique);
                buf.put_u16(*slot);
                codec.encode_item(item, &mut buf);
            }
            Delete { unique, item } => {
                buf.put_u8(TAG_DELETE);
                put_bool(&mut buf, *unique);
                codec.encode_item(item, &mut buf);
            }
            UndoDelete { unique, slot, item } => {
                buf.put_u8(TAG_UNDO_DELETE);
                put_bool(&mut buf, *unique);
                buf.put_u16(*slot);
                codec.encode_item(item, &mut buf);
            }
            AllocatePage { page } => {
                buf.put_u8(TAG_ALLOCATE_PAGE);
                put_page(&mut buf, *page);
            }
            FreePage { page } => {
                buf.put_u8(TAG_FREE_PAGE);
                put_page(&mut buf, *page);
            }
        }
        Bytes::from(buf)
    }

    /// Parses a payload.
    pub fn decode<C, D>(codec: &ItemCodec<C, D>, mut data: &[u8]) -> IndexResult<Self>
    where
        C: KeyCodec<Key = K>,
        D: LocationCodec<Location = L>,
    {
        use IndexLogPayload::*;
        if data.is_empty() {
            return Err(IndexError::bad_encoding("empty index payload"));
        }
        let tag = data.get_u8();
        let buf = &mut data;
        Ok(match tag {
            TAG_LOAD_PAGE => {
                let leaf = get_bool(buf)?;
                let unique = get_bool(buf)?;
                let space_map_page = get_page(buf)?;
                let left_sibling = get_page(buf)?;
                let right_sibling = get_page(buf)?;
                let items = codec.decode_items(buf, leaf, unique)?;
                LoadPage {
                    leaf,
                    unique,
                    space_map_page,
                    left_sibling,
                    right_sibling,
                    items,
                }
            }
            TAG_SPLIT => {
                let leaf = get_bool(buf)?;
                let unique = get_bool(buf)?;
                let new_sibling = get_page(buf)?;
                let right_sibling = get_page(buf)?;
                let space_map_page = get_page(buf)?;
                let new_key_count = buf.get_u16();
                let high_key = if get_bool(buf)? {
                    Some(codec.decode_item(buf, leaf, unique)?)
                } else {
                    None
                };
                let items = codec.decode_items(buf, leaf, unique)?;
                Split {
                    leaf,
                    unique,
                    new_sibling,
                    right_sibling,
                    space_map_page,
                    high_key,
                    new_key_count,
                    items,
                }
            }
            TAG_MERGE => {
                let leaf = get_bool(buf)?;
                let unique = get_bool(buf)?;
                let right_sibling = get_page(buf)?;
                let right_space_map_page = get_page(buf)?;
                let right_right_sibling = get_page(buf)?;
                let items = codec.decode_items(buf, leaf, unique)?;
                Merge {
                    leaf,
                    unique,
                    right_sibling,
                    right_space_map_page,
                    right_right_sibling,
                    items,
                }
            }
            TAG_LINK => {
                let unique = get_bool(buf)?;
                let left_sibling = get_page(buf)?;
                let right_sibling = get_page(buf)?;
                let left_child_high_key = codec.decode_item(buf, false, unique)?;
                Link {
                    unique,
                    left_sibling,
                    right_sibling,
                    left_child_high_key,
                }
            }
            TAG_UNLINK => {
                let unique = get_bool(buf)?;
                let left_sibling = get_page(buf)?;
                let right_sibling = get_page(buf)?;
                Unlink {
                    unique,
                    left_sibling,
                    right_sibling,
                }
            }
            TAG_REDISTRIBUTE => {
                let leaf = get_bool(buf)?;
                let unique = get_bool(buf)?;
                let left_sibling = get_page(buf)?;
                let right_sibling = get_page(buf)?;
                let target_sibling = get_page(buf)?;
                let key = codec.decode_item(buf, leaf, unique)?;
                Redistribute {
                    leaf,
                    unique,
                    left_sibling,
                    right_sibling,
                    target_sibling,
                    key,
                }
            }
            TAG_INCREASE_HEIGHT => {
                let leaf = get_bool(buf)?;
                let unique = get_bool(buf)?;
                let left_child = get_page(buf)?;
                let right_child = get_page(buf)?;
                let space_map_page = get_page(buf)?;
                let items = codec.decode_items(buf, leaf, unique)?;
                let root_items = codec.decode_items(buf, false, unique)?;
                IncreaseTreeHeight {
                    leaf,
                    unique,
                    left_child,
                    right_child,
                    space_map_page,
                    items,
                    root_items,
                }
            }
            TAG_DECREASE_HEIGHT => {
                let leaf = get_bool(buf)?;
                let unique = get_bool(buf)?;
                let child_page = get_page(buf)?;
                let child_space_map_page = get_page(buf)?;
                let items = codec.decode_items(buf, leaf, unique)?;
                DecreaseTreeHeight {
                    leaf,
                    unique,
                    child_page,
                    child_space_map_page,
                    items,
                }
            }
            TAG_INSERT => {
                let unique = get_bool(buf)?;
                let item = codec.decode_item(buf, true, unique)?;
                Insert { unique, item }
            }
            TAG_UNDO_INSERT => {
                let unique = get_bool(buf)?;
                let slot = buf.get_u16();
                let item = codec.decode_item(buf, true, unique)?;
                UndoInsert { unique, slot, item }
            }
            TAG_DELETE => {
                let unique = get_bool(buf)?;
                let item = codec.decode_item(buf, true, unique)?;
                Delete { unique, item }
            }
            TAG_UNDO_DELETE => {
                let unique = get_bool(buf)?;
                let slot = buf.get_u16();
                let item = codec.decode_item(buf, true, unique)?;
                UndoDelete { unique, slot, item }
            }
            TAG_ALLOCATE_PAGE => AllocatePage {
                page: get_page(buf)?,
            },
            TAG_FREE_PAGE => FreePage {
                page: get_page(buf)?,
            },
            other => {
                return Err(IndexError::bad_encoding(format!(
                    "unknown index payload tag {}",
                    other
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{RowLocation, RowLocationCodec, StringKeyCodec};

    type Payload = IndexLogPayload<String, RowLocation>;

    fn codec() -> ItemCodec<StringKeyCodec, RowLocationCodec> {
        ItemCodec::new(StringKeyCodec, RowLocationCodec)
    }

    fn leaf_item(key: &str, loc: u64) -> IndexItem<String, RowLocation> {
        IndexItem::leaf_item(key.to_string(), RowLocation(loc), true)
    }

    #[test]
    fn test_insert_roundtrip() {
        let codec = codec();
        let payload = Payload::Insert {
            unique: true,
            item: leaf_item("d1", 41),
        };
        let bytes = payload.encode(&codec);
        match Payload::decode(&codec, &bytes).unwrap() {
            IndexLogPayload::Insert { unique, item } => {
                assert!(unique);
                assert_eq!(item.key, "d1");
                assert_eq!(item.location, RowLocation(41));
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_split_roundtrip() {
        let codec = codec();
        let payload = Payload::Split {
            leaf: true,
            unique: true,
            new_sibling: PageNumber::new(9),
            right_sibling: PageNumber::NULL,
            space_map_page: PageNumber::new(1),
            high_key: Some(leaf_item("f1", 61)),
            new_key_count: 4,
            items: vec![leaf_item("g1", 71), leaf_item("h1", 81)],
        };
        let bytes = payload.encode(&codec);
        match Payload::decode(&codec, &bytes).unwrap() {
            IndexLogPayload::Split {
                new_sibling,
                right_sibling,
                high_key,
                new_key_count,
                items,
                ..
            } => {
                assert_eq!(new_sibling, PageNumber::new(9));
                assert_eq!(right_sibling, PageNumber::NULL);
                assert_eq!(high_key.unwrap().key, "f1");
                assert_eq!(new_key_count, 4);
                assert_eq!(items.len(), 2);
                assert_eq!(items[1].key, "h1");
            }
            other => panic!("wrong variant: {:?}", other),
        }
    }

    #[test]
    fn test_flags_by_category() {
        let split: Payload = IndexLogPayload::Split {
            leaf: false,
            unique: false,
            new_sibling: PageNumber::new(3),
            right_sibling: PageNumber::NULL,
            space_map_page: PageNumber::new(1),
            high_key: None,
            new_key_count: 2,
            items: vec![],
        };
        assert!(split.flags().contains(RecordFlags::CLR));
        assert!(split.flags().contains(RecordFlags::MULTI_PAGE));

        let insert: Payload = IndexLogPayload::Insert {
            unique: true,
            item: leaf_item("a", 1),
        };
        assert!(insert.flags().contains(RecordFlags::UNDO));
        assert!(insert.flags().contains(RecordFlags::LOGICAL_UNDO));
        assert!(!insert.flags().contains(RecordFlags::CLR));

        let free: Payload = IndexLogPayload::FreePage {
            page: PageNumber::new(5),
        };
        assert!(free.flags().contains(RecordFlags::REDO));
        assert!(!free.flags().contains(RecordFlags::UNDO));
    }

    #[test]
    fn test_page_ids_multi_page() {
        let primary = PageId::new(1, PageNumber::new(5));
        let merge: Payload = IndexLogPayload::Merge {
            leaf: true,
            unique: true,
            right_sibling: PageNumber::new(6),
            right_space_map_page: PageNumber::new(1),
            right_right_sibling: PageNumber::NULL,
            items: vec![],
        };
        assert_eq!(
            merge.page_ids(primary),
            vec![primary, PageId::new(1, PageNumber::new(6))]
        );

        let unlink: Payload = IndexLogPayload::Unlink {
            unique: true,
            left_sibling: PageNumber::new(5),
            right_sibling: PageNumber::new(6),
        };
        assert_eq!(unlink.page_ids(primary), vec![primary]);
    }
}
