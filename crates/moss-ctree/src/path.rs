//! Traversal paths.
//!
//! A [`Path`] records one block per tree level, root down to the target
//! level, together with the slot chosen at that level and the lock held
//! on the block. Guards are owned (`Arc`-backed), so a path can be
//! passed across call frames while its locks stay pinned; dropping the
//! path releases everything it still holds.

use moss_block::{BlockReadGuard, BlockWriteGuard, BufferRef};
use moss_error::{MossError, Result};
use moss_ondisk::TreeBlock;
use moss_types::MAX_LEVEL;

/// Lock held on one path level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    None,
    Read,
    Write,
}

pub(crate) enum Held {
    Unlocked,
    Read(BlockReadGuard),
    Write(BlockWriteGuard),
}

/// One level of a traversal path: the block, the slot the search chose
/// in it, and the lock currently held.
pub struct PathSlot {
    pub(crate) buffer: BufferRef,
    pub(crate) slot: usize,
    pub(crate) held: Held,
}

impl PathSlot {
    #[must_use]
    pub fn buffer(&self) -> &BufferRef {
        &self.buffer
    }

    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    #[must_use]
    pub fn lock_mode(&self) -> LockMode {
        match self.held {
            Held::Unlocked => LockMode::None,
            Held::Read(_) => LockMode::Read,
            Held::Write(_) => LockMode::Write,
        }
    }

    pub(crate) fn is_locked(&self) -> bool {
        !matches!(self.held, Held::Unlocked)
    }

    pub(crate) fn is_write_locked(&self) -> bool {
        matches!(self.held, Held::Write(_))
    }

    pub(crate) fn contents(&self) -> Option<&TreeBlock> {
        match &self.held {
            Held::Unlocked => None,
            Held::Read(guard) => Some(guard),
            Held::Write(guard) => Some(guard),
        }
    }

    pub(crate) fn contents_mut(&mut self) -> Option<&mut TreeBlock> {
        match &mut self.held {
            Held::Write(guard) => Some(guard),
            _ => None,
        }
    }

    pub(crate) fn unlock(&mut self) {
        self.held = Held::Unlocked;
    }
}

/// A root-to-target traversal with lock coupling.
pub struct Path {
    slots: Vec<Option<PathSlot>>,
    pub(crate) lowest_level: usize,
    pub(crate) keep_locks: bool,
    // First key of the subtree to the right of this path, recorded
    // during descent. Drives forward iteration without re-walking
    // ancestors after their locks are gone.
    pub(crate) next_key_hint: Option<moss_types::Key>,
}

impl Default for Path {
    fn default() -> Self {
        Self::new()
    }
}

impl Path {
    #[must_use]
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(MAX_LEVEL);
        slots.resize_with(MAX_LEVEL, || None);
        Self {
            slots,
            lowest_level: 0,
            keep_locks: false,
            next_key_hint: None,
        }
    }

    #[must_use]
    pub fn level(&self, level: usize) -> Option<&PathSlot> {
        self.slots.get(level).and_then(Option::as_ref)
    }

    pub(crate) fn level_mut(&mut self, level: usize) -> Option<&mut PathSlot> {
        self.slots.get_mut(level).and_then(Option::as_mut)
    }

    pub(crate) fn set_level(&mut self, level: usize, slot: PathSlot) {
        self.slots[level] = Some(slot);
    }

    /// The slot index chosen at the leaf level.
    #[must_use]
    pub fn leaf_slot(&self) -> Option<usize> {
        self.level(0).map(PathSlot::slot)
    }

    /// Read access to the leaf block, if the path holds a lock on it.
    #[must_use]
    pub fn leaf(&self) -> Option<&TreeBlock> {
        self.level(0).and_then(PathSlot::contents)
    }

    /// Locked contents at `level`; corruption if the path does not
    /// cover the level. Internal invariant, not caller error.
    pub(crate) fn block(&self, level: usize) -> Result<&TreeBlock> {
        self.level(level)
            .and_then(PathSlot::contents)
            .ok_or_else(|| path_gap(level))
    }

    /// Write-locked contents at `level`.
    pub(crate) fn block_mut(&mut self, level: usize) -> Result<&mut TreeBlock> {
        self.level_mut(level)
            .and_then(PathSlot::contents_mut)
            .ok_or_else(|| path_gap(level))
    }

    pub(crate) fn buffer(&self, level: usize) -> Result<BufferRef> {
        self.level(level)
            .map(|slot| slot.buffer.clone())
            .ok_or_else(|| path_gap(level))
    }

    pub(crate) fn slot_index(&self, level: usize) -> Result<usize> {
        self.level(level)
            .map(PathSlot::slot)
            .ok_or_else(|| path_gap(level))
    }

    pub(crate) fn set_slot_index(&mut self, level: usize, index: usize) -> Result<()> {
        self.level_mut(level)
            .map(|slot| slot.slot = index)
            .ok_or_else(|| path_gap(level))
    }

    /// Highest level the path currently covers.
    #[must_use]
    pub fn top_level(&self) -> Option<usize> {
        (0..MAX_LEVEL).rev().find(|&level| self.level(level).is_some())
    }

    pub(crate) fn unlock_level(&mut self, level: usize) {
        if let Some(slot) = self.level_mut(level) {
            slot.unlock();
        }
    }

    pub(crate) fn drop_level(&mut self, level: usize) {
        self.slots[level] = None;
    }

    /// Drop every level: unlock and forget all buffers.
    pub fn release_all(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.next_key_hint = None;
    }
}

fn path_gap(level: usize) -> MossError {
    MossError::Corruption {
        block: 0,
        detail: format!("traversal path missing a locked block at level {level}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moss_block::{BlockStore, MemBlockStore, Transaction};
    use moss_types::{BlockSize, Bytenr, TransId, TreeId};

    fn buffer() -> BufferRef {
        let store = MemBlockStore::new(BlockSize::new(512).expect("block size"));
        let trans = Transaction::new(TransId(1));
        store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 0)
            .expect("alloc")
    }

    #[test]
    fn path_tracks_levels_and_lock_modes() {
        let buf = buffer();
        let mut path = Path::new();
        assert!(path.top_level().is_none());

        let guard = buf.write();
        path.set_level(
            0,
            PathSlot {
                buffer: buf.clone(),
                slot: 3,
                held: Held::Write(guard),
            },
        );
        assert_eq!(path.top_level(), Some(0));
        assert_eq!(path.leaf_slot(), Some(3));
        assert_eq!(
            path.level(0).map(PathSlot::lock_mode),
            Some(LockMode::Write)
        );
        assert!(path.block_mut(0).is_ok());

        path.unlock_level(0);
        assert_eq!(path.level(0).map(PathSlot::lock_mode), Some(LockMode::None));
        assert!(path.block(0).is_err());
        // Unlocked slot releases the rwlock.
        assert!(buf.try_read().is_some());
    }

    #[test]
    fn release_all_frees_locks() {
        let buf = buffer();
        let mut path = Path::new();
        path.set_level(
            1,
            PathSlot {
                buffer: buf.clone(),
                slot: 0,
                held: Held::Read(buf.read()),
            },
        );
        assert!(buf.try_read().is_some());
        path.release_all();
        assert!(path.top_level().is_none());
        assert!(buf.write().nritems() == 0);
    }

    #[test]
    fn missing_level_is_reported_as_corruption() {
        let mut path = Path::new();
        assert!(matches!(
            path.block(2),
            Err(MossError::Corruption { .. })
        ));
        assert!(matches!(
            path.block_mut(2),
            Err(MossError::Corruption { .. })
        ));
    }
}
