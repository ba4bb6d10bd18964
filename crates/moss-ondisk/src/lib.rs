#![forbid(unsafe_code)]
//! Bit-exact tree-block layout for MossFS.
//!
//! A tree block is a fixed-size byte buffer: a 101-byte header followed
//! by the data area. Internal nodes fill the data area with a packed
//! table of 40-byte key pointers. Leaves grow a table of 32-byte item
//! headers from the front of the data area while item payloads pack from
//! the block's end toward the front; the gap between the two is the
//! leaf's free space. Payload offsets are relative to the start of the
//! data area and payloads are always kept contiguous (no holes), so
//! `offset[i] + size[i] == offset[i-1]` for every item after the first.
//!
//! [`TreeBlock`] owns the buffer and provides typed, bounds-checked
//! accessors plus the byte-movement primitives the balancing engine is
//! built from. Nothing in this crate locks or does I/O.

use moss_types::{
    ensure_slice, read_fixed, read_le_u32, read_le_u64, usize_to_u32, BlockSize, Bytenr, Key,
    ParseError, TransId, TreeId, HEADER_OFF_BYTENR, HEADER_OFF_CSUM, HEADER_OFF_FLAGS,
    HEADER_OFF_FSID, HEADER_OFF_GENERATION, HEADER_OFF_LEVEL, HEADER_OFF_NRITEMS,
    HEADER_OFF_OWNER, HEADER_OFF_TREE_UUID, HEADER_SIZE, ITEM_SIZE, KEY_PTR_SIZE, KEY_SIZE,
    MAX_LEVEL,
};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Parsed view of a tree-block header, for validation and debug dumps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub bytenr: Bytenr,
    pub flags: u64,
    pub generation: TransId,
    pub owner: TreeId,
    pub nritems: u32,
    pub level: u8,
    pub fsid: [u8; 16],
    pub tree_uuid: [u8; 16],
}

impl BlockHeader {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        ensure_slice(data, 0, HEADER_SIZE)?;
        let level = data[HEADER_OFF_LEVEL];
        if usize::from(level) >= MAX_LEVEL {
            return Err(ParseError::InvalidField {
                field: "level",
                reason: "exceeds maximum tree height",
            });
        }
        Ok(Self {
            bytenr: Bytenr(read_le_u64(data, HEADER_OFF_BYTENR)?),
            flags: read_le_u64(data, HEADER_OFF_FLAGS)?,
            generation: TransId(read_le_u64(data, HEADER_OFF_GENERATION)?),
            owner: TreeId(read_le_u64(data, HEADER_OFF_OWNER)?),
            nritems: read_le_u32(data, HEADER_OFF_NRITEMS)?,
            level,
            fsid: read_fixed::<16>(data, HEADER_OFF_FSID)?,
            tree_uuid: read_fixed::<16>(data, HEADER_OFF_TREE_UUID)?,
        })
    }
}

/// An owned, block-size tree block with typed accessors and the byte
/// movement primitives used by the balancing engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeBlock {
    bytes: Vec<u8>,
}

impl TreeBlock {
    /// A zeroed block of the given size.
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            bytes: vec![0_u8; block_size.get() as usize],
        }
    }

    /// Adopt a raw buffer; the length must be a valid block size.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self, ParseError> {
        let len = usize_to_u32(bytes.len(), "block_len")?;
        BlockSize::new(len)?;
        Ok(Self { bytes })
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Total block size in bytes.
    #[must_use]
    pub fn block_size(&self) -> usize {
        self.bytes.len()
    }

    /// Usable bytes past the header.
    #[must_use]
    pub fn data_area(&self) -> usize {
        self.bytes.len() - HEADER_SIZE
    }

    /// Maximum number of key pointers this block can hold as a node.
    #[must_use]
    pub fn node_capacity(&self) -> usize {
        self.data_area() / KEY_PTR_SIZE
    }

    /// Parse the header.
    pub fn header(&self) -> Result<BlockHeader, ParseError> {
        BlockHeader::parse(&self.bytes)
    }

    // ── Header accessors ────────────────────────────────────────────────────

    fn get_u64(&self, offset: usize) -> u64 {
        // Header offsets are compile-time constants well inside the
        // minimum block size; unwrap-free via the checked reader.
        read_le_u64(&self.bytes, offset).unwrap_or(0)
    }

    fn put_u64(&mut self, offset: usize, value: u64) {
        self.bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    #[must_use]
    pub fn bytenr(&self) -> Bytenr {
        Bytenr(self.get_u64(HEADER_OFF_BYTENR))
    }

    pub fn set_bytenr(&mut self, bytenr: Bytenr) {
        self.put_u64(HEADER_OFF_BYTENR, bytenr.0);
    }

    #[must_use]
    pub fn flags(&self) -> u64 {
        self.get_u64(HEADER_OFF_FLAGS)
    }

    pub fn set_flags(&mut self, flags: u64) {
        self.put_u64(HEADER_OFF_FLAGS, flags);
    }

    #[must_use]
    pub fn has_flag(&self, flag: u64) -> bool {
        self.flags() & flag != 0
    }

    pub fn set_flag(&mut self, flag: u64, on: bool) {
        let flags = if on {
            self.flags() | flag
        } else {
            self.flags() & !flag
        };
        self.set_flags(flags);
    }

    #[must_use]
    pub fn generation(&self) -> TransId {
        TransId(self.get_u64(HEADER_OFF_GENERATION))
    }

    pub fn set_generation(&mut self, generation: TransId) {
        self.put_u64(HEADER_OFF_GENERATION, generation.0);
    }

    #[must_use]
    pub fn owner(&self) -> TreeId {
        TreeId(self.get_u64(HEADER_OFF_OWNER))
    }

    pub fn set_owner(&mut self, owner: TreeId) {
        self.put_u64(HEADER_OFF_OWNER, owner.0);
    }

    #[must_use]
    pub fn nritems(&self) -> usize {
        read_le_u32(&self.bytes, HEADER_OFF_NRITEMS).unwrap_or(0) as usize
    }

    pub fn set_nritems(&mut self, nritems: usize) -> Result<(), ParseError> {
        let value = usize_to_u32(nritems, "nritems")?;
        self.put_u32(HEADER_OFF_NRITEMS, value);
        Ok(())
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.bytes[HEADER_OFF_LEVEL]
    }

    pub fn set_level(&mut self, level: u8) {
        self.bytes[HEADER_OFF_LEVEL] = level;
    }

    #[must_use]
    pub fn is_leaf(&self) -> bool {
        self.level() == 0
    }

    pub fn fsid(&self) -> Result<[u8; 16], ParseError> {
        read_fixed::<16>(&self.bytes, HEADER_OFF_FSID)
    }

    pub fn set_fsid(&mut self, fsid: [u8; 16]) {
        self.bytes[HEADER_OFF_FSID..HEADER_OFF_FSID + 16].copy_from_slice(&fsid);
    }

    pub fn tree_uuid(&self) -> Result<[u8; 16], ParseError> {
        read_fixed::<16>(&self.bytes, HEADER_OFF_TREE_UUID)
    }

    pub fn set_tree_uuid(&mut self, uuid: [u8; 16]) {
        self.bytes[HEADER_OFF_TREE_UUID..HEADER_OFF_TREE_UUID + 16].copy_from_slice(&uuid);
    }

    pub fn csum(&self) -> Result<[u8; 32], ParseError> {
        read_fixed::<32>(&self.bytes, HEADER_OFF_CSUM)
    }

    pub fn set_csum(&mut self, csum: [u8; 32]) {
        self.bytes[HEADER_OFF_CSUM..HEADER_OFF_CSUM + 32].copy_from_slice(&csum);
    }

    /// Copy another block's entire contents into this one. The caller is
    /// responsible for re-stamping bytenr, generation, owner, and flags.
    pub fn copy_block_body(&mut self, src: &TreeBlock) -> Result<(), ParseError> {
        if src.bytes.len() != self.bytes.len() {
            return Err(ParseError::InvalidField {
                field: "block_len",
                reason: "source and destination block sizes differ",
            });
        }
        self.bytes.copy_from_slice(&src.bytes);
        Ok(())
    }

    // ── Internal range helpers ──────────────────────────────────────────────

    fn abs(&self, rel: usize) -> Result<usize, ParseError> {
        let abs = HEADER_SIZE
            .checked_add(rel)
            .ok_or(ParseError::InvalidField {
                field: "data_offset",
                reason: "overflow",
            })?;
        if abs > self.bytes.len() {
            return Err(ParseError::InsufficientData {
                needed: rel,
                offset: HEADER_SIZE,
                actual: self.data_area(),
            });
        }
        Ok(abs)
    }

    /// Move the data-area byte range `[src_start, src_end)` (relative
    /// offsets) to start at relative `dest_start`. Ranges may overlap.
    fn move_data(
        &mut self,
        src_start: usize,
        src_end: usize,
        dest_start: usize,
    ) -> Result<(), ParseError> {
        if src_end < src_start {
            return Err(ParseError::InvalidField {
                field: "data_range",
                reason: "end precedes start",
            });
        }
        let len = src_end - src_start;
        let src = self.abs(src_start)?;
        self.abs(src_end)?;
        let dest = self.abs(dest_start)?;
        self.abs(dest_start.checked_add(len).ok_or(ParseError::InvalidField {
            field: "data_range",
            reason: "overflow",
        })?)?;
        self.bytes.copy_within(src..src + len, dest);
        Ok(())
    }

    // ── Node key-pointer table ──────────────────────────────────────────────

    fn node_entry_off(&self, slot: usize) -> Result<usize, ParseError> {
        let rel = slot
            .checked_mul(KEY_PTR_SIZE)
            .ok_or(ParseError::InvalidField {
                field: "slot",
                reason: "overflow",
            })?;
        let abs = self.abs(rel)?;
        self.abs(rel + KEY_PTR_SIZE)?;
        Ok(abs)
    }

    pub fn node_key(&self, slot: usize) -> Result<Key, ParseError> {
        let off = self.node_entry_off(slot)?;
        Key::parse(&self.bytes, off)
    }

    pub fn set_node_key(&mut self, slot: usize, key: Key) -> Result<(), ParseError> {
        let off = self.node_entry_off(slot)?;
        self.bytes[off..off + KEY_SIZE].copy_from_slice(&key.to_bytes());
        Ok(())
    }

    pub fn node_blockptr(&self, slot: usize) -> Result<Bytenr, ParseError> {
        let off = self.node_entry_off(slot)?;
        Ok(Bytenr(read_le_u64(&self.bytes, off + KEY_SIZE)?))
    }

    pub fn set_node_blockptr(&mut self, slot: usize, bytenr: Bytenr) -> Result<(), ParseError> {
        let off = self.node_entry_off(slot)?;
        self.put_u64(off + KEY_SIZE, bytenr.0);
        Ok(())
    }

    pub fn node_ptr_generation(&self, slot: usize) -> Result<TransId, ParseError> {
        let off = self.node_entry_off(slot)?;
        Ok(TransId(read_le_u64(&self.bytes, off + KEY_SIZE + 8)?))
    }

    pub fn set_node_ptr_generation(
        &mut self,
        slot: usize,
        generation: TransId,
    ) -> Result<(), ParseError> {
        let off = self.node_entry_off(slot)?;
        self.put_u64(off + KEY_SIZE + 8, generation.0);
        Ok(())
    }

    /// Insert a key pointer at `slot`, shifting later entries right.
    pub fn node_insert_ptr(
        &mut self,
        slot: usize,
        key: Key,
        bytenr: Bytenr,
        generation: TransId,
    ) -> Result<(), ParseError> {
        let nritems = self.nritems();
        if slot > nritems {
            return Err(ParseError::InvalidField {
                field: "slot",
                reason: "beyond node entry count",
            });
        }
        if nritems >= self.node_capacity() {
            return Err(ParseError::InvalidField {
                field: "node",
                reason: "key pointer table full",
            });
        }
        if slot < nritems {
            self.move_data(
                slot * KEY_PTR_SIZE,
                nritems * KEY_PTR_SIZE,
                (slot + 1) * KEY_PTR_SIZE,
            )?;
        }
        self.set_nritems(nritems + 1)?;
        self.set_node_key(slot, key)?;
        self.set_node_blockptr(slot, bytenr)?;
        self.set_node_ptr_generation(slot, generation)?;
        trace!(
            target: "moss::ondisk",
            slot,
            child = bytenr.0,
            nritems = nritems + 1,
            "node_insert_ptr"
        );
        Ok(())
    }

    /// Remove `count` key pointers starting at `slot`, shifting later
    /// entries left.
    pub fn node_remove_ptrs(&mut self, slot: usize, count: usize) -> Result<(), ParseError> {
        let nritems = self.nritems();
        let end = slot.checked_add(count).ok_or(ParseError::InvalidField {
            field: "count",
            reason: "overflow",
        })?;
        if count == 0 || end > nritems {
            return Err(ParseError::InvalidField {
                field: "slot",
                reason: "remove range beyond node entry count",
            });
        }
        if end < nritems {
            self.move_data(
                end * KEY_PTR_SIZE,
                nritems * KEY_PTR_SIZE,
                slot * KEY_PTR_SIZE,
            )?;
        }
        self.set_nritems(nritems - count)?;
        Ok(())
    }

    /// Append `count` key pointers copied from `src[src_start..]`.
    pub fn node_append_ptrs(
        &mut self,
        src: &TreeBlock,
        src_start: usize,
        count: usize,
    ) -> Result<(), ParseError> {
        let nritems = self.nritems();
        if nritems + count > self.node_capacity() {
            return Err(ParseError::InvalidField {
                field: "node",
                reason: "append exceeds key pointer capacity",
            });
        }
        if src_start + count > src.nritems() {
            return Err(ParseError::InvalidField {
                field: "src_start",
                reason: "copy range beyond source entry count",
            });
        }
        let src_off = src.node_entry_off(src_start)?;
        let len = count * KEY_PTR_SIZE;
        let dst_off = self.abs(nritems * KEY_PTR_SIZE)?;
        self.abs(nritems * KEY_PTR_SIZE + len)?;
        self.bytes[dst_off..dst_off + len].copy_from_slice(&src.bytes[src_off..src_off + len]);
        self.set_nritems(nritems + count)?;
        Ok(())
    }

    /// Insert `count` key pointers copied from `src[src_start..]` at the
    /// front of this node, shifting existing entries right.
    pub fn node_prepend_ptrs(
        &mut self,
        src: &TreeBlock,
        src_start: usize,
        count: usize,
    ) -> Result<(), ParseError> {
        let nritems = self.nritems();
        if nritems + count > self.node_capacity() {
            return Err(ParseError::InvalidField {
                field: "node",
                reason: "prepend exceeds key pointer capacity",
            });
        }
        if src_start + count > src.nritems() {
            return Err(ParseError::InvalidField {
                field: "src_start",
                reason: "copy range beyond source entry count",
            });
        }
        if nritems > 0 {
            self.move_data(0, nritems * KEY_PTR_SIZE, count * KEY_PTR_SIZE)?;
        }
        let src_off = src.node_entry_off(src_start)?;
        let len = count * KEY_PTR_SIZE;
        let dst_off = self.abs(0)?;
        self.bytes[dst_off..dst_off + len].copy_from_slice(&src.bytes[src_off..src_off + len]);
        self.set_nritems(nritems + count)?;
        Ok(())
    }

    // ── Leaf item table and payload arena ───────────────────────────────────

    fn item_header_off(&self, slot: usize) -> Result<usize, ParseError> {
        let rel = slot.checked_mul(ITEM_SIZE).ok_or(ParseError::InvalidField {
            field: "slot",
            reason: "overflow",
        })?;
        let abs = self.abs(rel)?;
        self.abs(rel + ITEM_SIZE)?;
        Ok(abs)
    }

    pub fn item_key(&self, slot: usize) -> Result<Key, ParseError> {
        let off = self.item_header_off(slot)?;
        Key::parse(&self.bytes, off)
    }

    pub fn set_item_key(&mut self, slot: usize, key: Key) -> Result<(), ParseError> {
        let off = self.item_header_off(slot)?;
        self.bytes[off..off + KEY_SIZE].copy_from_slice(&key.to_bytes());
        Ok(())
    }

    /// Payload offset of item `slot`, relative to the data area start.
    pub fn item_offset(&self, slot: usize) -> Result<usize, ParseError> {
        let off = self.item_header_off(slot)?;
        Ok(read_le_u32(&self.bytes, off + KEY_SIZE)? as usize)
    }

    pub fn set_item_offset(&mut self, slot: usize, data_offset: usize) -> Result<(), ParseError> {
        let off = self.item_header_off(slot)?;
        let value = usize_to_u32(data_offset, "item_offset")?;
        self.put_u32(off + KEY_SIZE, value);
        Ok(())
    }

    /// Payload size of item `slot` in bytes.
    pub fn item_size(&self, slot: usize) -> Result<usize, ParseError> {
        let off = self.item_header_off(slot)?;
        Ok(read_le_u32(&self.bytes, off + KEY_SIZE + 4)? as usize)
    }

    pub fn set_item_size(&mut self, slot: usize, size: usize) -> Result<(), ParseError> {
        let off = self.item_header_off(slot)?;
        let value = usize_to_u32(size, "item_size")?;
        self.put_u32(off + KEY_SIZE + 4, value);
        Ok(())
    }

    fn item_data_range(&self, slot: usize) -> Result<(usize, usize), ParseError> {
        if slot >= self.nritems() {
            return Err(ParseError::InvalidField {
                field: "slot",
                reason: "beyond leaf item count",
            });
        }
        let rel = self.item_offset(slot)?;
        let size = self.item_size(slot)?;
        let start = self.abs(rel)?;
        let end_rel = rel.checked_add(size).ok_or(ParseError::InvalidField {
            field: "item_size",
            reason: "overflow",
        })?;
        self.abs(end_rel)?;
        Ok((start, start + size))
    }

    pub fn item_data(&self, slot: usize) -> Result<&[u8], ParseError> {
        let (start, end) = self.item_data_range(slot)?;
        Ok(&self.bytes[start..end])
    }

    pub fn item_data_mut(&mut self, slot: usize) -> Result<&mut [u8], ParseError> {
        let (start, end) = self.item_data_range(slot)?;
        Ok(&mut self.bytes[start..end])
    }

    /// Relative offset of the lowest payload byte; the data area length
    /// when the leaf is empty.
    pub fn leaf_data_end(&self) -> Result<usize, ParseError> {
        let nritems = self.nritems();
        if nritems == 0 {
            Ok(self.data_area())
        } else {
            self.item_offset(nritems - 1)
        }
    }

    /// Bytes occupied by item headers plus payloads.
    pub fn leaf_used(&self) -> Result<usize, ParseError> {
        let table = self.nritems().checked_mul(ITEM_SIZE).ok_or(
            ParseError::InvalidField {
                field: "nritems",
                reason: "overflow",
            },
        )?;
        let payload = self.data_area().checked_sub(self.leaf_data_end()?).ok_or(
            ParseError::InvalidField {
                field: "item_offset",
                reason: "data end beyond data area",
            },
        )?;
        Ok(table + payload)
    }

    /// Gap between the item table and the payload region.
    pub fn leaf_free_space(&self) -> Result<usize, ParseError> {
        let data_end = self.leaf_data_end()?;
        let table = self.nritems() * ITEM_SIZE;
        data_end.checked_sub(table).ok_or(ParseError::InvalidField {
            field: "leaf",
            reason: "item table overlaps payload region",
        })
    }

    /// Insert an item at `slot` with a zeroed payload of `data_size`
    /// bytes, shifting later items toward the front of the data area.
    pub fn leaf_insert_item(
        &mut self,
        slot: usize,
        key: Key,
        data_size: usize,
    ) -> Result<(), ParseError> {
        let nritems = self.nritems();
        if slot > nritems {
            return Err(ParseError::InvalidField {
                field: "slot",
                reason: "beyond leaf item count",
            });
        }
        let needed = ITEM_SIZE.checked_add(data_size).ok_or(
            ParseError::InvalidField {
                field: "data_size",
                reason: "overflow",
            },
        )?;
        if self.leaf_free_space()? < needed {
            return Err(ParseError::InvalidField {
                field: "leaf",
                reason: "insufficient free space",
            });
        }
        let data_end = self.leaf_data_end()?;
        let boundary = if slot == 0 {
            self.data_area()
        } else {
            self.item_offset(slot - 1)?
        };

        if slot < nritems {
            // Shift the payloads of items at and after `slot` toward the
            // front to open the new payload's gap.
            self.move_data(data_end, boundary, data_end - data_size)?;
            for i in slot..nritems {
                let off = self.item_offset(i)?;
                self.set_item_offset(i, off - data_size)?;
            }
            // Shift their headers right by one.
            self.move_data(slot * ITEM_SIZE, nritems * ITEM_SIZE, (slot + 1) * ITEM_SIZE)?;
        }

        self.set_nritems(nritems + 1)?;
        self.set_item_key(slot, key)?;
        self.set_item_offset(slot, boundary - data_size)?;
        self.set_item_size(slot, data_size)?;
        let start = self.abs(boundary - data_size)?;
        self.bytes[start..start + data_size].fill(0);
        trace!(
            target: "moss::ondisk",
            slot,
            data_size,
            nritems = nritems + 1,
            "leaf_insert_item"
        );
        Ok(())
    }

    /// Remove `count` items starting at `slot`, repacking payloads.
    pub fn leaf_delete_items(&mut self, slot: usize, count: usize) -> Result<(), ParseError> {
        let nritems = self.nritems();
        let end = slot.checked_add(count).ok_or(ParseError::InvalidField {
            field: "count",
            reason: "overflow",
        })?;
        if count == 0 || end > nritems {
            return Err(ParseError::InvalidField {
                field: "slot",
                reason: "delete range beyond leaf item count",
            });
        }
        let mut freed = 0_usize;
        for i in slot..end {
            freed = freed
                .checked_add(self.item_size(i)?)
                .ok_or(ParseError::InvalidField {
                    field: "item_size",
                    reason: "overflow",
                })?;
        }
        let data_end = self.leaf_data_end()?;

        if end < nritems {
            let removed_low = self.item_offset(end - 1)?;
            self.move_data(data_end, removed_low, data_end + freed)?;
            for i in end..nritems {
                let off = self.item_offset(i)?;
                self.set_item_offset(i, off + freed)?;
            }
            self.move_data(end * ITEM_SIZE, nritems * ITEM_SIZE, slot * ITEM_SIZE)?;
        }
        self.set_nritems(nritems - count)?;
        trace!(
            target: "moss::ondisk",
            slot,
            count,
            freed,
            nritems = nritems - count,
            "leaf_delete_items"
        );
        Ok(())
    }

    /// Grow item `slot`'s payload by `extra` zeroed bytes at its logical
    /// end.
    pub fn leaf_extend_item(&mut self, slot: usize, extra: usize) -> Result<(), ParseError> {
        let nritems = self.nritems();
        if slot >= nritems {
            return Err(ParseError::InvalidField {
                field: "slot",
                reason: "beyond leaf item count",
            });
        }
        if extra == 0 {
            return Ok(());
        }
        if self.leaf_free_space()? < extra {
            return Err(ParseError::InvalidField {
                field: "leaf",
                reason: "insufficient free space",
            });
        }
        let data_end = self.leaf_data_end()?;
        let off = self.item_offset(slot)?;
        let size = self.item_size(slot)?;
        let item_end = off + size;

        // Shift this item's payload and everything below it toward the
        // front, leaving the new bytes at the item's logical end.
        self.move_data(data_end, item_end, data_end - extra)?;
        for i in slot..nritems {
            let o = self.item_offset(i)?;
            self.set_item_offset(i, o - extra)?;
        }
        self.set_item_size(slot, size + extra)?;
        let zero_start = self.abs(item_end - extra)?;
        self.bytes[zero_start..zero_start + extra].fill(0);
        Ok(())
    }

    /// Shrink item `slot`'s payload to `new_size` bytes. With
    /// `from_end`, the trailing bytes are discarded; otherwise the
    /// leading bytes are.
    pub fn leaf_truncate_item(
        &mut self,
        slot: usize,
        new_size: usize,
        from_end: bool,
    ) -> Result<(), ParseError> {
        let nritems = self.nritems();
        if slot >= nritems {
            return Err(ParseError::InvalidField {
                field: "slot",
                reason: "beyond leaf item count",
            });
        }
        let size = self.item_size(slot)?;
        if new_size > size {
            return Err(ParseError::InvalidField {
                field: "new_size",
                reason: "larger than current item size",
            });
        }
        let delta = size - new_size;
        if delta == 0 {
            return Ok(());
        }
        let data_end = self.leaf_data_end()?;
        let off = self.item_offset(slot)?;

        if from_end {
            // Keep the leading bytes: shift them and everything below
            // toward the back to close the gap.
            self.move_data(data_end, off + new_size, data_end + delta)?;
            for i in slot..nritems {
                let o = self.item_offset(i)?;
                self.set_item_offset(i, o + delta)?;
            }
        } else {
            // Keep the trailing bytes in place; repack the items below.
            self.move_data(data_end, off, data_end + delta)?;
            for i in slot + 1..nritems {
                let o = self.item_offset(i)?;
                self.set_item_offset(i, o + delta)?;
            }
            self.set_item_offset(slot, off + delta)?;
        }
        self.set_item_size(slot, new_size)?;
        Ok(())
    }

    /// Append `count` items copied from `src[src_start..]` (headers,
    /// keys, and payloads) to the end of this leaf.
    pub fn leaf_append_items(
        &mut self,
        src: &TreeBlock,
        src_start: usize,
        count: usize,
    ) -> Result<(), ParseError> {
        if src_start + count > src.nritems() {
            return Err(ParseError::InvalidField {
                field: "src_start",
                reason: "copy range beyond source item count",
            });
        }
        let mut total = 0_usize;
        for i in src_start..src_start + count {
            total += src.item_size(i)?;
        }
        if self.leaf_free_space()? < count * ITEM_SIZE + total {
            return Err(ParseError::InvalidField {
                field: "leaf",
                reason: "insufficient free space",
            });
        }

        let mut nritems = self.nritems();
        let mut boundary = self.leaf_data_end()?;
        for i in src_start..src_start + count {
            let key = src.item_key(i)?;
            let size = src.item_size(i)?;
            let (s, e) = src.item_data_range(i)?;
            boundary -= size;
            self.set_nritems(nritems + 1)?;
            self.set_item_key(nritems, key)?;
            self.set_item_offset(nritems, boundary)?;
            self.set_item_size(nritems, size)?;
            let dst = self.abs(boundary)?;
            self.bytes[dst..dst + size].copy_from_slice(&src.bytes[s..e]);
            nritems += 1;
        }
        Ok(())
    }

    /// Insert `count` items copied from `src[src_start..]` at the front
    /// of this leaf, shifting existing items toward the data area's
    /// front.
    pub fn leaf_prepend_items(
        &mut self,
        src: &TreeBlock,
        src_start: usize,
        count: usize,
    ) -> Result<(), ParseError> {
        if src_start + count > src.nritems() {
            return Err(ParseError::InvalidField {
                field: "src_start",
                reason: "copy range beyond source item count",
            });
        }
        let mut total = 0_usize;
        for i in src_start..src_start + count {
            total += src.item_size(i)?;
        }
        let nritems = self.nritems();
        if self.leaf_free_space()? < count * ITEM_SIZE + total {
            return Err(ParseError::InvalidField {
                field: "leaf",
                reason: "insufficient free space",
            });
        }

        if nritems > 0 {
            let data_end = self.leaf_data_end()?;
            self.move_data(data_end, self.data_area(), data_end - total)?;
            for i in 0..nritems {
                let o = self.item_offset(i)?;
                self.set_item_offset(i, o - total)?;
            }
            self.move_data(0, nritems * ITEM_SIZE, count * ITEM_SIZE)?;
        }
        self.set_nritems(nritems + count)?;

        let mut boundary = self.data_area();
        for i in 0..count {
            let s_idx = src_start + i;
            let key = src.item_key(s_idx)?;
            let size = src.item_size(s_idx)?;
            let (s, e) = src.item_data_range(s_idx)?;
            boundary -= size;
            self.set_item_key(i, key)?;
            self.set_item_offset(i, boundary)?;
            self.set_item_size(i, size)?;
            let dst = self.abs(boundary)?;
            self.bytes[dst..dst + size].copy_from_slice(&src.bytes[s..e]);
        }
        Ok(())
    }

    /// Drop the last `count` items; their payloads are implicitly freed.
    pub fn leaf_truncate_tail_items(&mut self, count: usize) -> Result<(), ParseError> {
        let nritems = self.nritems();
        if count > nritems {
            return Err(ParseError::InvalidField {
                field: "count",
                reason: "beyond leaf item count",
            });
        }
        self.set_nritems(nritems - count)
    }
}

// ── Structural invariant checks ─────────────────────────────────────────────

/// Verify the layout invariants of a leaf: strictly increasing keys,
/// tightly packed payloads, and non-negative free space.
pub fn check_leaf(block: &TreeBlock) -> Result<(), ParseError> {
    if block.level() != 0 {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "leaf check on non-leaf block",
        });
    }
    let nritems = block.nritems();
    block.leaf_free_space()?;
    let mut expected_end = block.data_area();
    let mut prev_key: Option<Key> = None;
    for i in 0..nritems {
        let key = block.item_key(i)?;
        if let Some(prev) = prev_key {
            if key <= prev {
                return Err(ParseError::InvalidField {
                    field: "item_key",
                    reason: "leaf keys not strictly increasing",
                });
            }
        }
        prev_key = Some(key);
        let off = block.item_offset(i)?;
        let size = block.item_size(i)?;
        let end = off.checked_add(size).ok_or(ParseError::InvalidField {
            field: "item_size",
            reason: "overflow",
        })?;
        if end != expected_end {
            return Err(ParseError::InvalidField {
                field: "item_offset",
                reason: "payloads not tightly packed",
            });
        }
        expected_end = off;
    }
    Ok(())
}

/// Verify the layout invariants of an internal node: valid level,
/// strictly increasing keys, non-zero child pointers, capacity respected.
pub fn check_node(block: &TreeBlock) -> Result<(), ParseError> {
    let level = block.level();
    if level == 0 || usize::from(level) >= MAX_LEVEL {
        return Err(ParseError::InvalidField {
            field: "level",
            reason: "node level out of range",
        });
    }
    let nritems = block.nritems();
    if nritems == 0 {
        return Err(ParseError::InvalidField {
            field: "nritems",
            reason: "empty internal node",
        });
    }
    if nritems > block.node_capacity() {
        return Err(ParseError::InvalidField {
            field: "nritems",
            reason: "exceeds key pointer capacity",
        });
    }
    let mut prev_key: Option<Key> = None;
    for i in 0..nritems {
        let key = block.node_key(i)?;
        if let Some(prev) = prev_key {
            if key <= prev {
                return Err(ParseError::InvalidField {
                    field: "node_key",
                    reason: "node keys not strictly increasing",
                });
            }
        }
        prev_key = Some(key);
        if block.node_blockptr(i)? == Bytenr::ZERO {
            return Err(ParseError::InvalidField {
                field: "blockptr",
                reason: "zero child pointer",
            });
        }
    }
    Ok(())
}
