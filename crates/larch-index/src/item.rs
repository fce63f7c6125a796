//! Index items and the key/location capabilities.
//!
//! An index item couples a key with either a row location (leaf pages,
//! and non-leaf pages of non-unique trees) or a child page pointer
//! (non-leaf pages). The index is generic over how keys and locations
//! are encoded, compared, and bounded, expressed as the [`KeyCodec`]
//! and [`LocationCodec`] capabilities held by the index instance.

use std::cmp::Ordering;
use std::fmt;

use bytes::{Buf, BufMut};

use larch_common::PageNumber;
use larch_txn::LockName;

use crate::error::{IndexError, IndexResult};

/// Encoding, comparison, and bounds for index keys.
pub trait KeyCodec: Clone + Send + Sync + 'static {
    /// The key type.
    type Key: Clone + Ord + fmt::Debug + Send + Sync + 'static;

    /// Appends the encoded key.
    fn encode(&self, key: &Self::Key, buf: &mut Vec<u8>);

    /// Decodes a key, consuming its bytes.
    fn decode(&self, buf: &mut &[u8]) -> IndexResult<Self::Key>;

    /// The logical INFINITY key: compares above every real key and can
    /// never be inserted or deleted.
    fn max_key(&self) -> Self::Key;

    /// Parses a key from text.
    fn parse(&self, text: &str) -> IndexResult<Self::Key>;
}

/// Encoding and identity for row locations.
pub trait LocationCodec: Clone + Send + Sync + 'static {
    /// The location type.
    type Location: Clone + Ord + fmt::Debug + Send + Sync + 'static;

    /// Appends the encoded location.
    fn encode(&self, loc: &Self::Location, buf: &mut Vec<u8>);

    /// Decodes a location, consuming its bytes.
    fn decode(&self, buf: &mut &[u8]) -> IndexResult<Self::Location>;

    /// The null location carried by sentinel items.
    fn null(&self) -> Self::Location;

    /// The lock name identifying this location in the lock manager.
    fn lock_name(&self, loc: &Self::Location) -> LockName;
}

/// A key or pointer entry within a tree page.
///
/// The `leaf` and `unique` flags are not persisted per item; they
/// describe the owning page and drive which optional fields the encoded
/// form carries. The location is present in leaf items and in non-leaf
/// items of non-unique trees (where it disambiguates equal keys); the
/// child page pointer is present only in non-leaf items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexItem<K, L> {
    /// The sortable key.
    pub key: K,
    /// Row identifier.
    pub location: L,
    /// Child subtree holding keys ≤ this item's key.
    pub child_page: PageNumber,
    /// Whether the owning page is a leaf.
    pub leaf: bool,
    /// Whether the tree is a unique index.
    pub unique: bool,
}

impl<K: Ord + Clone, L: Ord + Clone> IndexItem<K, L> {
    /// Creates a leaf item.
    pub fn leaf_item(key: K, location: L, unique: bool) -> Self {
        Self {
            key,
            location,
            child_page: PageNumber::NULL,
            leaf: true,
            unique,
        }
    }

    /// Whether the encoded form carries the location.
    pub fn location_required(&self) -> bool {
        self.leaf || !self.unique
    }

    /// Key-first ordering; equal keys order by location where the
    /// location is significant.
    pub fn compare(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal if self.location_required() => self.location.cmp(&other.location),
            ord => ord,
        }
    }

    /// Ordering by key alone.
    pub fn compare_ignoring_location(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key)
    }
}

/// The pair of codecs an index instance operates with.
#[derive(Debug, Clone)]
pub struct ItemCodec<C, D> {
    /// Key capability.
    pub keys: C,
    /// Location capability.
    pub locations: D,
}

impl<C: KeyCodec, D: LocationCodec> ItemCodec<C, D> {
    /// Creates the codec pair.
    pub fn new(keys: C, locations: D) -> Self {
        Self { keys, locations }
    }

    /// The sentinel INFINITY item for a page of the given shape.
    pub fn infinity_item(&self, leaf: bool, unique: bool) -> IndexItem<C::Key, D::Location> {
        IndexItem {
            key: self.keys.max_key(),
            location: self.locations.null(),
            child_page: PageNumber::NULL,
            leaf,
            unique,
        }
    }

    /// Encodes an item for storage in a page of the given shape.
    pub fn encode_item(&self, item: &IndexItem<C::Key, D::Location>, buf: &mut Vec<u8>) {
        self.keys.encode(&item.key, buf);
        if item.location_required() {
            self.locations.encode(&item.location, buf);
        }
        if !item.leaf {
            buf.put_u32(item.child_page.as_u32());
        }
    }

    /// Length of the encoded form.
    pub fn encoded_len(&self, item: &IndexItem<C::Key, D::Location>) -> usize {
        let mut buf = Vec::new();
        self.encode_item(item, &mut buf);
        buf.len()
    }

    /// Decodes an item from a page of the given shape.
    pub fn decode_item(
        &self,
        buf: &mut &[u8],
        leaf: bool,
        unique: bool,
    ) -> IndexResult<IndexItem<C::Key, D::Location>> {
        let key = self.keys.decode(buf)?;
        let location = if leaf || !unique {
            self.locations.decode(buf)?
        } else {
            self.locations.null()
        };
        let child_page = if !leaf {
            if buf.remaining() < 4 {
                return Err(IndexError::bad_encoding("item truncated"));
            }
            PageNumber::new(buf.get_u32())
        } else {
            PageNumber::NULL
        };
        Ok(IndexItem {
            key,
            location,
            child_page,
            leaf,
            unique,
        })
    }
}

// ---------------------------------------------------------------------
// Provided key and location types
// ---------------------------------------------------------------------

/// Variable-length string keys.
pub type StringKey = String;

/// Codec for [`StringKey`].
#[derive(Debug, Clone, Default)]
pub struct StringKeyCodec;

/// The INFINITY marker for string keys: a prefix no parsed key may
/// carry.
const STRING_MAX: &str = "\u{10FFFF}\u{10FFFF}\u{10FFFF}\u{10FFFF}";

impl KeyCodec for StringKeyCodec {
    type Key = StringKey;

    fn encode(&self, key: &StringKey, buf: &mut Vec<u8>) {
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
    }

    fn decode(&self, buf: &mut &[u8]) -> IndexResult<StringKey> {
        if buf.remaining() < 2 {
            return Err(IndexError::bad_encoding("string key truncated"));
        }
        let n = buf.get_u16() as usize;
        if buf.remaining() < n {
            return Err(IndexError::bad_encoding("string key body truncated"));
        }
        let mut raw = vec![0u8; n];
        buf.copy_to_slice(&mut raw);
        String::from_utf8(raw).map_err(|_| IndexError::bad_encoding("string key is not utf-8"))
    }

    fn max_key(&self) -> StringKey {
        STRING_MAX.to_string()
    }

    fn parse(&self, text: &str) -> IndexResult<StringKey> {
        if text.starts_with('\u{10FFFF}') {
            return Err(IndexError::bad_encoding("key collides with the sentinel"));
        }
        Ok(text.to_string())
    }
}

/// A row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowLocation(pub u64);

impl fmt::Display for RowLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Codec for [`RowLocation`].
#[derive(Debug, Clone, Default)]
pub struct RowLocationCodec;

impl LocationCodec for RowLocationCodec {
    type Location = RowLocation;

    fn encode(&self, loc: &RowLocation, buf: &mut Vec<u8>) {
        buf.put_u64(loc.0);
    }

    fn decode(&self, buf: &mut &[u8]) -> IndexResult<RowLocation> {
        if buf.remaining() < 8 {
            return Err(IndexError::bad_encoding("location truncated"));
        }
        Ok(RowLocation(buf.get_u64()))
    }

    fn null(&self) -> RowLocation {
        RowLocation(0)
    }

    fn lock_name(&self, loc: &RowLocation) -> LockName {
        LockName::from_bytes(loc.0.to_be_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> ItemCodec<StringKeyCodec, RowLocationCodec> {
        ItemCodec::new(StringKeyCodec, RowLocationCodec)
    }

    #[test]
    fn test_leaf_item_roundtrip() {
        let codec = codec();
        let item = IndexItem::leaf_item("b1".to_string(), RowLocation(21), true);
        let mut buf = Vec::new();
        codec.encode_item(&item, &mut buf);
        let decoded = codec.decode_item(&mut buf.as_slice(), true, true).unwrap();
        assert_eq!(decoded, item);
    }

    #[test]
    fn test_index_item_roundtrip() {
        let codec = codec();
        // Unique non-leaf items omit the location.
        let item = IndexItem {
            key: "m".to_string(),
            location: RowLocation(0),
            child_page: PageNumber::new(9),
            leaf: false,
            unique: true,
        };
        let mut buf = Vec::new();
        codec.encode_item(&item, &mut buf);
        let decoded = codec.decode_item(&mut buf.as_slice(), false, true).unwrap();
        assert_eq!(decoded.child_page, PageNumber::new(9));
        assert_eq!(decoded.location, RowLocation(0));

        // Non-unique non-leaf items carry the location.
        let item = IndexItem {
            key: "m".to_string(),
            location: RowLocation(77),
            child_page: PageNumber::new(9),
            leaf: false,
            unique: false,
        };
        let mut buf = Vec::new();
        codec.encode_item(&item, &mut buf);
        let decoded = codec.decode_item(&mut buf.as_slice(), false, false).unwrap();
        assert_eq!(decoded.location, RowLocation(77));
    }

    #[test]
    fn test_ordering_key_then_location() {
        let a = IndexItem::leaf_item("a".to_string(), RowLocation(1), false);
        let b = IndexItem::leaf_item("a".to_string(), RowLocation(2), false);
        let c = IndexItem::leaf_item("b".to_string(), RowLocation(0), false);
        assert_eq!(a.compare(&b), Ordering::Less);
        assert_eq!(b.compare(&c), Ordering::Less);
        assert_eq!(a.compare_ignoring_location(&b), Ordering::Equal);
    }

    #[test]
    fn test_infinity_sorts_above_real_keys() {
        let codec = codec();
        let inf = codec.infinity_item(true, true);
        let real = IndexItem::leaf_item("zzzzzz".to_string(), RowLocation(1), true);
        assert_eq!(inf.compare(&real), Ordering::Greater);
    }

    #[test]
    fn test_parse_rejects_sentinel() {
        let keys = StringKeyCodec;
        assert!(keys.parse("hello").is_ok());
        assert!(keys.parse(STRING_MAX).is_err());
    }
}
