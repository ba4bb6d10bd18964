#![forbid(unsafe_code)]
//! Buffer lifetime and collaborator interfaces for the MossFS tree.
//!
//! The tree engine never talks to a device. It sees blocks through
//! [`BufferHandle`] (a per-block rwlock around a [`TreeBlock`], shared as
//! `Arc` so traversal paths can hold owned guards across call frames) and
//! obtains them through the [`BlockStore`] trait. Reference counts for
//! shared COW blocks go through [`RefAccounting`]; fatal corruption is
//! reported through [`FatalEscalation`], implemented by [`StoreHealth`].
//!
//! [`MemBlockStore`] is a complete in-memory implementation of the
//! collaborator traits: monotonic bytenr assignment, a resident map,
//! a dirty set, per-block reference counts, and a pending-free list
//! drained at [`MemBlockStore::commit`]. It is enough to run the full
//! engine without a device and it keeps allocation statistics for tests.

use moss_error::{MossError, Result};
use moss_ondisk::TreeBlock;
use moss_types::{BlockSize, Bytenr, TransId, TreeId, HEADER_FLAG_WRITTEN};
use parking_lot::{lock_api, Mutex, RawRwLock, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Owned read guard over a block's contents.
pub type BlockReadGuard = lock_api::ArcRwLockReadGuard<RawRwLock, TreeBlock>;
/// Owned write guard over a block's contents.
pub type BlockWriteGuard = lock_api::ArcRwLockWriteGuard<RawRwLock, TreeBlock>;

/// A resident tree block: its stable byte address plus the rwlock the
/// traversal discipline couples on.
///
/// Handles are shared as [`BufferRef`]; dropping the last reference
/// returns the buffer to the store's bookkeeping (the store itself keeps
/// a reference while the block stays resident).
#[derive(Debug)]
pub struct BufferHandle {
    bytenr: Bytenr,
    lock: Arc<RwLock<TreeBlock>>,
}

/// Shared reference to a resident block.
pub type BufferRef = Arc<BufferHandle>;

impl BufferHandle {
    #[must_use]
    pub fn new(bytenr: Bytenr, block: TreeBlock) -> BufferRef {
        Arc::new(Self {
            bytenr,
            lock: Arc::new(RwLock::new(block)),
        })
    }

    #[must_use]
    pub fn bytenr(&self) -> Bytenr {
        self.bytenr
    }

    /// Take an owned read lock; blocks until no writer holds the block.
    #[must_use]
    pub fn read(&self) -> BlockReadGuard {
        RwLock::read_arc(&self.lock)
    }

    /// Take an owned write lock; blocks until the block is unshared.
    #[must_use]
    pub fn write(&self) -> BlockWriteGuard {
        RwLock::write_arc(&self.lock)
    }

    /// Non-blocking read attempt.
    #[must_use]
    pub fn try_read(&self) -> Option<BlockReadGuard> {
        RwLock::try_read_arc(&self.lock)
    }
}

/// Transaction context. The engine stamps every block it writes with the
/// transaction's id; commit policy itself lives with the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    transid: TransId,
}

impl Transaction {
    #[must_use]
    pub fn new(transid: TransId) -> Self {
        Self { transid }
    }

    #[must_use]
    pub fn transid(&self) -> TransId {
        self.transid
    }
}

// ── Collaborator traits ─────────────────────────────────────────────────────

/// Block allocation, lookup, and dirty tracking.
pub trait BlockStore: Send + Sync {
    /// Fetch a resident block, verifying its stamped generation against
    /// the parent pointer's expectation.
    fn read_block(&self, bytenr: Bytenr, expected_generation: TransId) -> Result<BufferRef>;

    /// Allocate a fresh zeroed block stamped with the transaction's
    /// generation, the owning tree, and the level. `hint` is a locality
    /// hint only.
    fn alloc_block(
        &self,
        trans: &Transaction,
        hint: Bytenr,
        owner: TreeId,
        level: u8,
    ) -> Result<BufferRef>;

    /// Release a block. With `last_ref` the block's space may be reused
    /// once the transaction commits; until then concurrent readers that
    /// still hold the buffer see stable contents.
    fn free_block(&self, trans: &Transaction, bytenr: Bytenr, last_ref: bool) -> Result<()>;

    /// Record that a resident block was mutated this transaction.
    fn mark_dirty(&self, buffer: &BufferRef) -> Result<()>;

    fn block_size(&self) -> BlockSize;
}

/// Reference accounting for shared COW blocks.
///
/// `inc_ref`/`dec_ref` adjust the reference counts of the given block's
/// children as a group (backref bookkeeping when a shared node is
/// copied or dropped); `block_refs` reports how many trees reference the
/// block itself.
pub trait RefAccounting: Send + Sync {
    fn inc_ref(&self, block: &TreeBlock, full_backref: bool) -> Result<()>;
    fn dec_ref(&self, block: &TreeBlock, full_backref: bool) -> Result<()>;
    fn block_refs(&self, bytenr: Bytenr) -> Result<u64>;
}

/// Store-wide poisoning. Once corruption is observed the store goes
/// read-only and stays read-only.
pub trait FatalEscalation: Send + Sync {
    fn mark_store_read_only(&self, errno: i32);
    fn is_read_only(&self) -> bool;
}

/// Healthy-until-poisoned store state.
///
/// The state only ever escalates; there is no reset short of remounting.
#[derive(Debug, Default)]
pub struct StoreHealth {
    // 0 = healthy, otherwise the errno recorded at poisoning time.
    errno: AtomicI32,
}

impl StoreHealth {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Errno recorded at poisoning time, if any.
    #[must_use]
    pub fn errno(&self) -> Option<i32> {
        match self.errno.load(Ordering::Acquire) {
            0 => None,
            errno => Some(errno),
        }
    }

    /// Gate for mutation entry points.
    pub fn ensure_writable(&self) -> Result<()> {
        if self.is_read_only() {
            return Err(MossError::ReadOnly);
        }
        Ok(())
    }
}

impl FatalEscalation for StoreHealth {
    fn mark_store_read_only(&self, errno: i32) {
        // First poisoning wins; later reports keep the original errno.
        let previous = self
            .errno
            .compare_exchange(0, errno, Ordering::AcqRel, Ordering::Acquire);
        if previous.is_ok() {
            warn!(target: "moss::block", errno, "store_marked_read_only");
        }
    }

    fn is_read_only(&self) -> bool {
        self.errno.load(Ordering::Acquire) != 0
    }
}

// ── In-memory store ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MemState {
    next_bytenr: u64,
    resident: HashMap<u64, BufferRef>,
    dirty: HashSet<u64>,
    refs: HashMap<u64, u64>,
    pending_free: Vec<u64>,
}

/// In-memory [`BlockStore`] + [`RefAccounting`] implementation.
///
/// Bytenr assignment is monotonic and block-size aligned, starting past
/// byte 0 so a zero pointer always means corruption. Freed blocks stay
/// resident on a pending-free list until [`commit`](Self::commit) so
/// concurrent readers holding stale buffers keep seeing stable bytes.
#[derive(Debug)]
pub struct MemBlockStore {
    block_size: BlockSize,
    fsid: [u8; 16],
    capacity_blocks: Option<u64>,
    state: Mutex<MemState>,
    allocations: AtomicU64,
}

impl MemBlockStore {
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self::with_fsid(block_size, [0; 16])
    }

    #[must_use]
    pub fn with_fsid(block_size: BlockSize, fsid: [u8; 16]) -> Self {
        Self {
            block_size,
            fsid,
            capacity_blocks: None,
            state: Mutex::new(MemState {
                next_bytenr: u64::from(block_size.get()),
                ..MemState::default()
            }),
            allocations: AtomicU64::new(0),
        }
    }

    /// Cap the number of live blocks; further allocations fail with
    /// `NoSpace`. Used by tests exercising the allocation failure path.
    #[must_use]
    pub fn with_capacity_blocks(mut self, capacity: u64) -> Self {
        self.capacity_blocks = Some(capacity);
        self
    }

    /// Total blocks ever allocated.
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.state.lock().resident.len()
    }

    #[must_use]
    pub fn dirty_count(&self) -> usize {
        self.state.lock().dirty.len()
    }

    #[must_use]
    pub fn pending_free_count(&self) -> usize {
        self.state.lock().pending_free.len()
    }

    #[must_use]
    pub fn contains(&self, bytenr: Bytenr) -> bool {
        self.state.lock().resident.contains_key(&bytenr.0)
    }

    /// Model the flush collaborator: stamp every dirty block WRITTEN and
    /// clear the dirty set. Further mutation of those blocks must go
    /// through a fresh copy.
    pub fn write_out(&self) -> Result<()> {
        let (dirty, handles): (Vec<u64>, Vec<BufferRef>) = {
            let state = self.state.lock();
            let dirty: Vec<u64> = state.dirty.iter().copied().collect();
            let handles = dirty
                .iter()
                .filter_map(|bytenr| state.resident.get(bytenr).cloned())
                .collect();
            (dirty, handles)
        };
        for handle in handles {
            let mut block = handle.write();
            block.set_flag(HEADER_FLAG_WRITTEN, true);
        }
        let mut state = self.state.lock();
        for bytenr in dirty {
            state.dirty.remove(&bytenr);
        }
        Ok(())
    }

    /// End the transaction: flush dirty blocks (stamping WRITTEN) and
    /// drop everything on the pending-free list.
    pub fn commit(&self) -> Result<()> {
        self.write_out()?;
        let mut state = self.state.lock();
        let pending = std::mem::take(&mut state.pending_free);
        for bytenr in &pending {
            state.resident.remove(bytenr);
            state.refs.remove(bytenr);
            state.dirty.remove(bytenr);
        }
        debug!(target: "moss::block", freed = pending.len(), "mem_store_commit");
        Ok(())
    }
}

impl BlockStore for MemBlockStore {
    fn read_block(&self, bytenr: Bytenr, expected_generation: TransId) -> Result<BufferRef> {
        let handle = {
            let state = self.state.lock();
            state.resident.get(&bytenr.0).cloned()
        };
        let Some(handle) = handle else {
            return Err(MossError::Corruption {
                block: bytenr.0,
                detail: "read of unknown block".into(),
            });
        };
        let generation = handle.read().generation();
        if generation != expected_generation {
            return Err(MossError::Corruption {
                block: bytenr.0,
                detail: format!(
                    "generation mismatch: expected {expected_generation}, found {generation}"
                ),
            });
        }
        Ok(handle)
    }

    fn alloc_block(
        &self,
        trans: &Transaction,
        hint: Bytenr,
        owner: TreeId,
        level: u8,
    ) -> Result<BufferRef> {
        let mut state = self.state.lock();
        if let Some(capacity) = self.capacity_blocks {
            let live = state.resident.len() as u64;
            if live >= capacity {
                return Err(MossError::NoSpace);
            }
        }
        let bytenr = Bytenr(state.next_bytenr);
        state.next_bytenr = state
            .next_bytenr
            .checked_add(u64::from(self.block_size.get()))
            .ok_or(MossError::NoSpace)?;

        let mut block = TreeBlock::new(self.block_size);
        block.set_bytenr(bytenr);
        block.set_fsid(self.fsid);
        block.set_generation(trans.transid());
        block.set_owner(owner);
        block.set_level(level);

        let handle = BufferHandle::new(bytenr, block);
        state.resident.insert(bytenr.0, handle.clone());
        state.refs.insert(bytenr.0, 1);
        state.dirty.insert(bytenr.0);
        self.allocations.fetch_add(1, Ordering::Relaxed);
        trace!(
            target: "moss::block",
            bytenr = bytenr.0,
            hint = hint.0,
            owner = owner.0,
            level,
            "mem_block_alloc"
        );
        Ok(handle)
    }

    fn free_block(&self, _trans: &Transaction, bytenr: Bytenr, last_ref: bool) -> Result<()> {
        let mut state = self.state.lock();
        let Some(refs) = state.refs.get_mut(&bytenr.0) else {
            return Err(MossError::Corruption {
                block: bytenr.0,
                detail: "free of unknown block".into(),
            });
        };
        if last_ref {
            if *refs != 1 {
                return Err(MossError::Corruption {
                    block: bytenr.0,
                    detail: format!("last-ref free with {refs} references", refs = *refs),
                });
            }
            state.refs.remove(&bytenr.0);
            state.dirty.remove(&bytenr.0);
            state.pending_free.push(bytenr.0);
        } else {
            if *refs < 2 {
                return Err(MossError::Corruption {
                    block: bytenr.0,
                    detail: "shared free of unshared block".into(),
                });
            }
            *refs -= 1;
        }
        trace!(target: "moss::block", bytenr = bytenr.0, last_ref, "mem_block_free");
        Ok(())
    }

    fn mark_dirty(&self, buffer: &BufferRef) -> Result<()> {
        let mut state = self.state.lock();
        let bytenr = buffer.bytenr();
        if !state.resident.contains_key(&bytenr.0) {
            return Err(MossError::Corruption {
                block: bytenr.0,
                detail: "dirty mark on non-resident block".into(),
            });
        }
        state.dirty.insert(bytenr.0);
        Ok(())
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }
}

impl RefAccounting for MemBlockStore {
    fn inc_ref(&self, block: &TreeBlock, _full_backref: bool) -> Result<()> {
        if block.is_leaf() {
            // Leaf payload references are owned by higher layers.
            return Ok(());
        }
        let mut state = self.state.lock();
        for slot in 0..block.nritems() {
            let child = block.node_blockptr(slot).map_err(|err| MossError::Corruption {
                block: block.bytenr().0,
                detail: err.to_string(),
            })?;
            *state.refs.entry(child.0).or_insert(0) += 1;
        }
        Ok(())
    }

    fn dec_ref(&self, block: &TreeBlock, _full_backref: bool) -> Result<()> {
        if block.is_leaf() {
            return Ok(());
        }
        let mut state = self.state.lock();
        for slot in 0..block.nritems() {
            let child = block.node_blockptr(slot).map_err(|err| MossError::Corruption {
                block: block.bytenr().0,
                detail: err.to_string(),
            })?;
            let Some(refs) = state.refs.get_mut(&child.0) else {
                return Err(MossError::Corruption {
                    block: child.0,
                    detail: "ref drop on untracked block".into(),
                });
            };
            if *refs == 0 {
                return Err(MossError::Corruption {
                    block: child.0,
                    detail: "ref drop below zero".into(),
                });
            }
            *refs -= 1;
        }
        Ok(())
    }

    fn block_refs(&self, bytenr: Bytenr) -> Result<u64> {
        let state = self.state.lock();
        state.refs.get(&bytenr.0).copied().ok_or_else(|| {
            MossError::Corruption {
                block: bytenr.0,
                detail: "ref query for untracked block".into(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use moss_types::Key;

    fn store() -> MemBlockStore {
        MemBlockStore::new(BlockSize::new(512).expect("valid block size"))
    }

    #[test]
    fn alloc_stamps_header_and_counts() {
        let store = store();
        let trans = Transaction::new(TransId(7));
        let buf = store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(3), 1)
            .expect("alloc");
        let block = buf.read();
        assert_eq!(block.bytenr(), buf.bytenr());
        assert_eq!(block.generation(), TransId(7));
        assert_eq!(block.owner(), TreeId(3));
        assert_eq!(block.level(), 1);
        assert!(!block.has_flag(HEADER_FLAG_WRITTEN));
        drop(block);

        assert_eq!(store.allocations(), 1);
        assert_eq!(store.dirty_count(), 1);
        assert!(store.contains(buf.bytenr()));
    }

    #[test]
    fn read_checks_generation() {
        let store = store();
        let trans = Transaction::new(TransId(7));
        let buf = store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(3), 0)
            .expect("alloc");
        assert!(store.read_block(buf.bytenr(), TransId(7)).is_ok());
        let err = store
            .read_block(buf.bytenr(), TransId(8))
            .expect_err("generation mismatch");
        assert!(matches!(err, MossError::Corruption { .. }));

        let err = store
            .read_block(Bytenr(999_999), TransId(7))
            .expect_err("unknown block");
        assert!(matches!(err, MossError::Corruption { .. }));
    }

    #[test]
    fn free_is_deferred_until_commit() {
        let store = store();
        let trans = Transaction::new(TransId(1));
        let buf = store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 0)
            .expect("alloc");
        let bytenr = buf.bytenr();

        store.free_block(&trans, bytenr, true).expect("free");
        assert!(store.contains(bytenr), "still resident before commit");
        assert_eq!(store.pending_free_count(), 1);

        store.commit().expect("commit");
        assert!(!store.contains(bytenr));
        assert_eq!(store.pending_free_count(), 0);
    }

    #[test]
    fn write_out_sets_written_flag() {
        let store = store();
        let trans = Transaction::new(TransId(1));
        let buf = store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 0)
            .expect("alloc");
        store.write_out().expect("write out");
        assert!(buf.read().has_flag(HEADER_FLAG_WRITTEN));
        assert_eq!(store.dirty_count(), 0);

        // Re-dirty after flush.
        store.mark_dirty(&buf).expect("mark dirty");
        assert_eq!(store.dirty_count(), 1);
    }

    #[test]
    fn capacity_limit_reports_no_space() {
        let store = store().with_capacity_blocks(2);
        let trans = Transaction::new(TransId(1));
        store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 0)
            .expect("alloc 1");
        store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 0)
            .expect("alloc 2");
        let err = store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 0)
            .expect_err("over capacity");
        assert!(matches!(err, MossError::NoSpace));
    }

    #[test]
    fn ref_accounting_tracks_node_children() {
        let store = store();
        let trans = Transaction::new(TransId(1));
        let child_a = store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 0)
            .expect("alloc");
        let child_b = store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 0)
            .expect("alloc");
        let node = store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 1)
            .expect("alloc");
        {
            let mut block = node.write();
            block
                .node_insert_ptr(0, Key::new(1, 0, 0), child_a.bytenr(), TransId(1))
                .expect("ptr");
            block
                .node_insert_ptr(1, Key::new(2, 0, 0), child_b.bytenr(), TransId(1))
                .expect("ptr");
        }

        let block = node.read();
        store.inc_ref(&block, true).expect("inc");
        assert_eq!(store.block_refs(child_a.bytenr()).expect("refs"), 2);
        assert_eq!(store.block_refs(child_b.bytenr()).expect("refs"), 2);

        store.dec_ref(&block, true).expect("dec");
        assert_eq!(store.block_refs(child_a.bytenr()).expect("refs"), 1);

        // Dropping below zero is corruption.
        store.dec_ref(&block, true).expect("dec to zero ok");
        assert!(store.dec_ref(&block, true).is_err());
    }

    #[test]
    fn shared_free_decrements() {
        let store = store();
        let trans = Transaction::new(TransId(1));
        let child = store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 0)
            .expect("alloc");
        let node = store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 1)
            .expect("alloc");
        {
            let mut block = node.write();
            block
                .node_insert_ptr(0, Key::new(1, 0, 0), child.bytenr(), TransId(1))
                .expect("ptr");
        }
        store.inc_ref(&node.read(), true).expect("inc");

        // Two references: a non-last free decrements, a premature
        // last-ref free is rejected.
        assert!(store.free_block(&trans, child.bytenr(), true).is_err());
        store
            .free_block(&trans, child.bytenr(), false)
            .expect("shared free");
        assert_eq!(store.block_refs(child.bytenr()).expect("refs"), 1);
        store
            .free_block(&trans, child.bytenr(), true)
            .expect("last free");
    }

    #[test]
    fn store_health_poisons_once() {
        let health = StoreHealth::new();
        assert!(!health.is_read_only());
        assert!(health.ensure_writable().is_ok());

        health.mark_store_read_only(libc::EIO);
        assert!(health.is_read_only());
        assert_eq!(health.errno(), Some(libc::EIO));
        assert!(matches!(
            health.ensure_writable(),
            Err(MossError::ReadOnly)
        ));

        // First errno wins.
        health.mark_store_read_only(libc::EROFS);
        assert_eq!(health.errno(), Some(libc::EIO));
    }

    #[test]
    fn buffer_handle_guards_are_owned() {
        let store = store();
        let trans = Transaction::new(TransId(1));
        let buf = store
            .alloc_block(&trans, Bytenr::ZERO, TreeId(1), 0)
            .expect("alloc");

        let guard = buf.read();
        assert!(buf.try_read().is_some(), "readers share");
        drop(guard);

        let write = buf.write();
        assert!(buf.try_read().is_none(), "writer excludes readers");
        drop(write);
    }
}
