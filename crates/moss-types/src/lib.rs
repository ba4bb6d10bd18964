#![forbid(unsafe_code)]
//! Core value types for the MossFS metadata tree.
//!
//! Everything in this crate is plain data: the 3-field tree key and its
//! total order, id newtypes that keep byte addresses, tree ids, and
//! transaction ids from mixing, the fixed tree-block layout constants,
//! and bounds-checked little-endian read helpers used by the on-disk
//! layer. No I/O, no locking.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Tree-block layout constants ─────────────────────────────────────────────

/// Size of the tree-block header in bytes.
///
/// csum(32) + fsid(16) + bytenr(8) + flags(8) + tree uuid(16) +
/// generation(8) + owner(8) + nritems(4) + level(1).
pub const HEADER_SIZE: usize = 101;

/// Serialized key size: objectid u64 + kind u8 + 7 pad bytes + offset u64.
pub const KEY_SIZE: usize = 24;

/// Node entry size: key + child bytenr u64 + child generation u64.
pub const KEY_PTR_SIZE: usize = KEY_SIZE + 8 + 8;

/// Leaf item header size: key + data offset u32 + data size u32.
pub const ITEM_SIZE: usize = KEY_SIZE + 4 + 4;

/// Hard bound on tree height (levels 0..MAX_LEVEL).
pub const MAX_LEVEL: usize = 8;

/// Header flag: the block has been flushed to its home location this
/// transaction; further mutation must go through a fresh copy.
pub const HEADER_FLAG_WRITTEN: u64 = 1 << 0;

/// Header flag: the block belongs to a reference-shared relocation
/// context; trees that do not own it must copy before writing.
pub const HEADER_FLAG_RELOC: u64 = 1 << 1;

/// Byte offsets of header fields.
pub const HEADER_OFF_CSUM: usize = 0x00;
pub const HEADER_OFF_FSID: usize = 0x20;
pub const HEADER_OFF_BYTENR: usize = 0x30;
pub const HEADER_OFF_FLAGS: usize = 0x38;
pub const HEADER_OFF_TREE_UUID: usize = 0x40;
pub const HEADER_OFF_GENERATION: usize = 0x50;
pub const HEADER_OFF_OWNER: usize = 0x58;
pub const HEADER_OFF_NRITEMS: usize = 0x60;
pub const HEADER_OFF_LEVEL: usize = 0x64;

// ── Id newtypes ─────────────────────────────────────────────────────────────

/// Byte address of a tree block within the store's address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bytenr(pub u64);

/// Identity of a tree (the `owner` stamped into every block's header).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TreeId(pub u64);

/// Transaction id; every block written in a transaction carries it as
/// its generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TransId(pub u64);

/// Object id, the major component of a tree key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl Bytenr {
    pub const ZERO: Self = Self(0);

    /// Add a byte count, returning `None` on overflow.
    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::Display for Bytenr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TreeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TransId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Validated tree-block size (power of two in 512..=65536).
///
/// The lower bound guarantees a node can hold at least eight key
/// pointers, which the balancing engine's occupancy thresholds assume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    /// Create a `BlockSize` if `value` is a power of two in [512, 65536].
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(512..=65536).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Usable bytes past the header.
    #[must_use]
    pub fn data_area(self) -> usize {
        self.0 as usize - HEADER_SIZE
    }

    /// Maximum number of key pointers a node of this size can hold.
    #[must_use]
    pub fn node_capacity(self) -> usize {
        self.data_area() / KEY_PTR_SIZE
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Tree key ────────────────────────────────────────────────────────────────

/// A tree key: `(objectid, kind, offset)`, compared lexicographically in
/// that order. Keys are unique within a tree.
///
/// The derived `Ord` gives exactly the on-disk comparison because the
/// fields are declared major-to-minor.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Key {
    pub objectid: u64,
    pub kind: u8,
    pub offset: u64,
}

impl Key {
    pub const MIN: Self = Self {
        objectid: 0,
        kind: 0,
        offset: 0,
    };
    pub const MAX: Self = Self {
        objectid: u64::MAX,
        kind: u8::MAX,
        offset: u64::MAX,
    };

    #[must_use]
    pub fn new(objectid: u64, kind: u8, offset: u64) -> Self {
        Self {
            objectid,
            kind,
            offset,
        }
    }

    /// The smallest key strictly greater than `self`, or `None` if
    /// `self` is the maximum key.
    #[must_use]
    pub fn successor(self) -> Option<Self> {
        if let Some(offset) = self.offset.checked_add(1) {
            return Some(Self { offset, ..self });
        }
        if let Some(kind) = self.kind.checked_add(1) {
            return Some(Self {
                objectid: self.objectid,
                kind,
                offset: 0,
            });
        }
        self.objectid.checked_add(1).map(|objectid| Self {
            objectid,
            kind: 0,
            offset: 0,
        })
    }

    /// Parse a key from its 24-byte serialized form.
    pub fn parse(data: &[u8], offset: usize) -> Result<Self, ParseError> {
        let bytes = ensure_slice(data, offset, KEY_SIZE)?;
        Ok(Self {
            objectid: read_le_u64(bytes, 0)?,
            kind: bytes[8],
            offset: read_le_u64(bytes, 16)?,
        })
    }

    /// Serialize into a 24-byte buffer (pad bytes zeroed).
    #[must_use]
    pub fn to_bytes(self) -> [u8; KEY_SIZE] {
        let mut out = [0_u8; KEY_SIZE];
        out[0..8].copy_from_slice(&self.objectid.to_le_bytes());
        out[8] = self.kind;
        out[16..24].copy_from_slice(&self.offset.to_le_bytes());
        out
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({} {} {})", self.objectid, self.kind, self.offset)
    }
}

// ── Parse errors and byte helpers ───────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// Narrow a `u64` to `usize` with an explicit error path.
pub fn u64_to_usize(value: u64, field: &'static str) -> Result<usize, ParseError> {
    usize::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

/// Narrow a `usize` to `u32` with an explicit error path.
pub fn usize_to_u32(value: usize, field: &'static str) -> Result<u32, ParseError> {
    u32::try_from(value).map_err(|_| ParseError::IntegerConversion { field })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn key_order_is_objectid_then_kind_then_offset() {
        let a = Key::new(1, 200, 500);
        let b = Key::new(2, 0, 0);
        assert!(a < b, "objectid dominates kind and offset");

        let c = Key::new(1, 3, u64::MAX);
        let d = Key::new(1, 4, 0);
        assert!(c < d, "kind dominates offset");

        let e = Key::new(1, 4, 7);
        let f = Key::new(1, 4, 8);
        assert!(e < f);
        assert_eq!(e, Key::new(1, 4, 7));
    }

    #[test]
    fn key_round_trip() {
        let key = Key::new(0xDEAD_BEEF, 0x84, 0x1234_5678_9ABC);
        let bytes = key.to_bytes();
        assert_eq!(Key::parse(&bytes, 0), Ok(key));
        // pad bytes stay zero
        assert_eq!(&bytes[9..16], &[0; 7]);
    }

    #[test]
    fn key_parse_rejects_short_input() {
        let bytes = [0_u8; KEY_SIZE - 1];
        assert!(Key::parse(&bytes, 0).is_err());
    }

    #[test]
    fn key_successor_carries() {
        assert_eq!(
            Key::new(1, 2, 3).successor(),
            Some(Key::new(1, 2, 4))
        );
        assert_eq!(
            Key::new(1, 2, u64::MAX).successor(),
            Some(Key::new(1, 3, 0))
        );
        assert_eq!(
            Key::new(1, u8::MAX, u64::MAX).successor(),
            Some(Key::new(2, 0, 0))
        );
        assert_eq!(Key::MAX.successor(), None);
    }

    #[test]
    fn block_size_validation() {
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(65536).is_ok());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new(3000).is_err());
        assert!(BlockSize::new(131_072).is_err());
        assert!(BlockSize::new(0).is_err());
    }

    #[test]
    fn block_size_capacities() {
        let bs = BlockSize::new(512).expect("valid");
        assert_eq!(bs.data_area(), 512 - HEADER_SIZE);
        assert!(bs.node_capacity() >= 8);

        let bs = BlockSize::new(4096).expect("valid");
        assert_eq!(bs.node_capacity(), (4096 - HEADER_SIZE) / KEY_PTR_SIZE);
    }

    #[test]
    fn read_helpers() {
        let bytes = [0x34_u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert_eq!(read_le_u64(&bytes, 0).expect("u64"), 0x90AB_CDEF_5678_1234);
        assert!(read_le_u64(&bytes, 1).is_err());
        assert!(ensure_slice(&bytes, usize::MAX, 2).is_err());
    }

    proptest! {
        #[test]
        fn key_serialization_preserves_order(
            a_obj in any::<u64>(), a_kind in any::<u8>(), a_off in any::<u64>(),
            b_obj in any::<u64>(), b_kind in any::<u8>(), b_off in any::<u64>(),
        ) {
            let a = Key::new(a_obj, a_kind, a_off);
            let b = Key::new(b_obj, b_kind, b_off);
            let ra = Key::parse(&a.to_bytes(), 0).expect("parse a");
            let rb = Key::parse(&b.to_bytes(), 0).expect("parse b");
            prop_assert_eq!(a.cmp(&b), ra.cmp(&rb));
        }

        #[test]
        fn key_successor_is_strictly_greater(
            obj in any::<u64>(), kind in any::<u8>(), off in any::<u64>(),
        ) {
            let key = Key::new(obj, kind, off);
            if let Some(next) = key.successor() {
                prop_assert!(next > key);
            } else {
                prop_assert_eq!(key, Key::MAX);
            }
        }
    }
}
