#![forbid(unsafe_code)]
//! Copy-on-write B+tree over fixed-size tree blocks.
//!
//! Items live in leaves as `(key, payload)` pairs; internal nodes hold
//! key pointers whose key is the exact first key of the child. All
//! mutations run under a transaction and copy shared or already-written
//! blocks before touching them, so readers never observe a partially
//! updated tree and committed generations stay intact for snapshots.
//!
//! The public surface is [`Ctree`] (the engine, generic over a
//! [`BlockStore`]) plus per-tree [`TreeRoot`] handles. Searches produce
//! a [`Path`] holding one locked block per level; mutations reuse the
//! path so the edit happens under the same locks the descent took.

mod balance;
mod check;
mod cow;
mod ops;
mod path;
mod search;

pub use check::TreeStats;
pub use path::{LockMode, Path, PathSlot};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use moss_block::{
    BlockReadGuard, BlockStore, BufferRef, FatalEscalation, RefAccounting, StoreHealth,
    Transaction,
};
use moss_error::{MossError, Result};
use moss_ondisk::TreeBlock;
use moss_types::{BlockSize, Bytenr, Key, TransId, TreeId};
use tracing::error;

/// Result of a point search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOutcome {
    /// The key exists; the path points at its slot.
    Found,
    /// The key is absent; the path points at its insertion slot.
    Missing,
}

/// An immutable snapshot of where a tree's root lives. Replaced
/// wholesale on every root COW or height change; holders of a stale
/// pointer detect the swap and reload.
pub struct RootPointer {
    buffer: BufferRef,
    level: u8,
    generation: TransId,
}

impl RootPointer {
    #[must_use]
    pub fn new(buffer: BufferRef, level: u8, generation: TransId) -> Self {
        Self {
            buffer,
            level,
            generation,
        }
    }

    #[must_use]
    pub fn buffer(&self) -> &BufferRef {
        &self.buffer
    }

    #[must_use]
    pub fn level(&self) -> u8 {
        self.level
    }

    #[must_use]
    pub fn generation(&self) -> TransId {
        self.generation
    }
}

/// Creation-time behavior flags for a tree.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeFlags {
    /// Committed generations stay referenced after COW (snapshot
    /// support). Without it, superseded blocks are freed immediately.
    pub ref_cows: bool,
    /// COW every touched block even when the in-place rule would allow
    /// direct mutation. Used during relocation.
    pub force_cow: bool,
}

/// Handle to one tree: identity, COW policy, and the swappable root.
pub struct TreeRoot {
    id: TreeId,
    ref_cows: bool,
    force_cow: AtomicBool,
    root: ArcSwap<RootPointer>,
}

impl TreeRoot {
    #[must_use]
    pub fn id(&self) -> TreeId {
        self.id
    }

    #[must_use]
    pub fn ref_cows(&self) -> bool {
        self.ref_cows
    }

    #[must_use]
    pub fn force_cow(&self) -> bool {
        self.force_cow.load(Ordering::Acquire)
    }

    pub fn set_force_cow(&self, value: bool) {
        self.force_cow.store(value, Ordering::Release);
    }

    /// Current root pointer. May be superseded immediately; callers
    /// lock the root block and re-check with [`root_is_current`]
    /// before trusting it.
    ///
    /// [`root_is_current`]: TreeRoot::root_is_current
    #[must_use]
    pub fn root_pointer(&self) -> Arc<RootPointer> {
        self.root.load_full()
    }

    #[must_use]
    pub fn root_is_current(&self, ptr: &Arc<RootPointer>) -> bool {
        Arc::ptr_eq(&self.root.load_full(), ptr)
    }

    pub(crate) fn swap_root(&self, ptr: RootPointer) {
        self.root.store(Arc::new(ptr));
    }

    /// Current tree height minus one (a lone leaf is level 0).
    #[must_use]
    pub fn level(&self) -> u8 {
        self.root.load().level
    }
}

/// The tree engine: block store, reference accounting, and the health
/// latch that takes the store read-only on corruption.
pub struct Ctree {
    store: Arc<dyn BlockStore>,
    refs: Arc<dyn RefAccounting>,
    health: Arc<StoreHealth>,
}

impl Ctree {
    #[must_use]
    pub fn new(
        store: Arc<dyn BlockStore>,
        refs: Arc<dyn RefAccounting>,
        health: Arc<StoreHealth>,
    ) -> Self {
        Self {
            store,
            refs,
            health,
        }
    }

    /// Engine over a fresh in-memory store. The store is returned as
    /// well so callers can drive allocation and write-out directly.
    #[must_use]
    pub fn in_memory(block_size: BlockSize) -> (Self, Arc<moss_block::MemBlockStore>) {
        let store = Arc::new(moss_block::MemBlockStore::new(block_size));
        let engine = Self::new(store.clone(), store.clone(), Arc::new(StoreHealth::new()));
        (engine, store)
    }

    pub(crate) fn store(&self) -> &dyn BlockStore {
        &*self.store
    }

    pub(crate) fn refs(&self) -> &dyn RefAccounting {
        &*self.refs
    }

    #[must_use]
    pub fn health(&self) -> &StoreHealth {
        &self.health
    }

    /// Run an operation, latching the store read-only if it fails with
    /// a fatal error. Every public entry point goes through here.
    fn run<T>(&self, op: impl FnOnce() -> Result<T>) -> Result<T> {
        let result = op();
        if let Err(err) = &result {
            if err.is_fatal() {
                error!(target: "moss::ctree", error = %err, "fatal_tree_error");
                self.health.mark_store_read_only(err.to_errno());
            }
        }
        result
    }

    /// Create an empty tree with default flags.
    pub fn create_tree(&self, trans: &Transaction, id: TreeId) -> Result<TreeRoot> {
        self.create_tree_with(trans, id, TreeFlags::default())
    }

    pub fn create_tree_with(
        &self,
        trans: &Transaction,
        id: TreeId,
        flags: TreeFlags,
    ) -> Result<TreeRoot> {
        self.health.ensure_writable()?;
        self.run(|| {
            let buffer = self.store.alloc_block(trans, Bytenr::ZERO, id, 0)?;
            self.store.mark_dirty(&buffer)?;
            Ok(TreeRoot {
                id,
                ref_cows: flags.ref_cows,
                force_cow: AtomicBool::new(flags.force_cow),
                root: ArcSwap::from_pointee(RootPointer::new(buffer, 0, trans.transid())),
            })
        })
    }

    /// Insert a new item. Fails with [`MossError::Exists`] if the key
    /// is already present.
    pub fn insert_item(
        &self,
        trans: &Transaction,
        tree: &TreeRoot,
        key: Key,
        data: &[u8],
    ) -> Result<()> {
        self.health.ensure_writable()?;
        self.run(|| ops::insert_item(self, trans, tree, key, data))
    }

    /// Insert a zero-filled item of `size` bytes, to be filled in by a
    /// later search while the space stays reserved.
    pub fn insert_empty_item(
        &self,
        trans: &Transaction,
        tree: &TreeRoot,
        key: Key,
        size: usize,
    ) -> Result<()> {
        self.health.ensure_writable()?;
        self.run(|| ops::insert_empty_item(self, trans, tree, key, size))
    }

    /// Delete one item by key.
    pub fn delete_item(&self, trans: &Transaction, tree: &TreeRoot, key: &Key) -> Result<()> {
        self.health.ensure_writable()?;
        self.run(|| ops::delete_item(self, trans, tree, key))
    }

    /// Delete `count` contiguous items starting at `slot` of the leaf a
    /// [`search_for_delete`](Ctree::search_for_delete) path points at.
    pub fn delete_items(
        &self,
        trans: &Transaction,
        tree: &TreeRoot,
        path: &mut Path,
        slot: usize,
        count: usize,
    ) -> Result<()> {
        self.health.ensure_writable()?;
        self.run(|| ops::del_items(self, trans, tree, path, slot, count))
    }

    /// Grow an item's payload by `extra` zeroed bytes.
    pub fn extend_item(
        &self,
        trans: &Transaction,
        tree: &TreeRoot,
        key: &Key,
        extra: usize,
    ) -> Result<()> {
        self.health.ensure_writable()?;
        self.run(|| ops::extend_item(self, trans, tree, key, extra))
    }

    /// Shrink an item's payload to `new_size` bytes, dropping the tail
    /// (`from_end`) or the head.
    pub fn truncate_item(
        &self,
        trans: &Transaction,
        tree: &TreeRoot,
        key: &Key,
        new_size: usize,
        from_end: bool,
    ) -> Result<()> {
        self.health.ensure_writable()?;
        self.run(|| ops::truncate_item(self, trans, tree, key, new_size, from_end))
    }

    /// Split an item at `split_offset`, moving the tail under
    /// `new_key`.
    pub fn split_item(
        &self,
        trans: &Transaction,
        tree: &TreeRoot,
        key: &Key,
        new_key: Key,
        split_offset: usize,
    ) -> Result<()> {
        self.health.ensure_writable()?;
        self.run(|| ops::split_item(self, trans, tree, key, new_key, split_offset))
    }

    /// Rewrite an item's key in place, keeping order against its
    /// neighbors.
    pub fn set_item_key_safe(
        &self,
        trans: &Transaction,
        tree: &TreeRoot,
        key: &Key,
        new_key: Key,
    ) -> Result<()> {
        self.health.ensure_writable()?;
        self.run(|| ops::set_item_key_safe(self, trans, tree, key, new_key))
    }

    /// Copy out one item's payload, or `None` if the key is absent.
    pub fn lookup(&self, tree: &TreeRoot, key: &Key) -> Result<Option<Vec<u8>>> {
        self.run(|| {
            let mut path = Path::new();
            let outcome =
                search::search_core(self, None, tree, key, &search::SearchConfig::read(), &mut path)?;
            if outcome == SearchOutcome::Missing {
                return Ok(None);
            }
            let slot = path.slot_index(0)?;
            let leaf = path.block(0)?;
            let data = leaf
                .item_data(slot)
                .map_err(|err| corrupt(leaf.bytenr(), err))?
                .to_vec();
            Ok(Some(data))
        })
    }

    /// Read-only search; the returned path holds a read lock on the
    /// leaf.
    pub fn search(&self, tree: &TreeRoot, key: &Key) -> Result<(Path, SearchOutcome)> {
        self.run(|| {
            let mut path = Path::new();
            let outcome =
                search::search_core(self, None, tree, key, &search::SearchConfig::read(), &mut path)?;
            Ok((path, outcome))
        })
    }

    /// COW search positioned for deletion; the path feeds
    /// [`delete_items`](Ctree::delete_items).
    pub fn search_for_delete(
        &self,
        trans: &Transaction,
        tree: &TreeRoot,
        key: &Key,
    ) -> Result<(Path, SearchOutcome)> {
        self.health.ensure_writable()?;
        self.run(|| {
            let cfg = search::SearchConfig {
                ins_len: -1,
                cow: true,
                extend: false,
                keep_locks: false,
                lowest_level: 0,
            };
            let mut path = Path::new();
            let outcome = search::search_core(self, Some(trans), tree, key, &cfg, &mut path)?;
            Ok((path, outcome))
        })
    }

    /// Visit items in key order starting at `start` until `visitor`
    /// returns `false`. Returns the number of items visited.
    pub fn search_forward(
        &self,
        tree: &TreeRoot,
        start: &Key,
        visitor: &mut dyn FnMut(Key, &[u8]) -> bool,
    ) -> Result<u64> {
        self.run(|| search::search_forward(self, tree, start, visitor))
    }

    /// Advance a read path to the first slot of the next leaf. Returns
    /// `false` at the end of the tree.
    pub fn next_leaf(&self, tree: &TreeRoot, path: &mut Path) -> Result<bool> {
        self.run(|| search::next_leaf(self, tree, path))
    }

    /// Verify every structural invariant of the tree.
    pub fn check_tree(&self, tree: &TreeRoot) -> Result<TreeStats> {
        self.run(|| check::check_tree(self, tree))
    }
}

pub(crate) fn corrupt(block: Bytenr, err: impl std::fmt::Display) -> MossError {
    MossError::Corruption {
        block: block.0,
        detail: err.to_string(),
    }
}

/// Load the child block a node's key pointer names, validating the
/// stamped generation against the pointer.
pub(crate) fn read_child(ctree: &Ctree, node: &TreeBlock, slot: usize) -> Result<BufferRef> {
    let bytenr = node
        .node_blockptr(slot)
        .map_err(|err| corrupt(node.bytenr(), err))?;
    let generation = node
        .node_ptr_generation(slot)
        .map_err(|err| corrupt(node.bytenr(), err))?;
    if bytenr == Bytenr::ZERO {
        return Err(corrupt(node.bytenr(), "key pointer to block zero"));
    }
    ctree.store().read_block(bytenr, generation)
}

/// Read-lock the current root, retrying while the pointer moves
/// underneath us.
pub(crate) fn lock_root_read(tree: &TreeRoot) -> Result<(Arc<RootPointer>, BlockReadGuard)> {
    loop {
        let ptr = tree.root_pointer();
        let guard = ptr.buffer().read();
        if !tree.root_is_current(&ptr) {
            continue;
        }
        if usize::from(guard.level()) != usize::from(ptr.level())
            || guard.bytenr() != ptr.buffer().bytenr()
        {
            return Err(corrupt(
                ptr.buffer().bytenr(),
                "root block header disagrees with the root pointer",
            ));
        }
        return Ok((ptr, guard));
    }
}
