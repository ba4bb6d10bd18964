//! Copy-on-write of tree blocks.
//!
//! A block may be mutated in place only when all of these hold: it was
//! allocated in the current transaction, it has not been written out,
//! its relocation marking matches the owning tree, and the tree does
//! not force COW. Otherwise the block is copied into a freshly
//! allocated buffer, the copy is restamped and hooked into the parent
//! (or swapped in as the new root), and the original is released. The
//! parent pointer rewrite is the point of no return; until then the old
//! block is untouched and concurrent readers descending through it see
//! a consistent tree.

use crate::path::{Held, PathSlot};
use crate::{corrupt, Ctree, Path, RootPointer, TreeRoot};
use moss_block::{BlockWriteGuard, BufferRef, Transaction};
use moss_error::Result;
use moss_ondisk::TreeBlock;
use moss_types::{Bytenr, TransId, HEADER_FLAG_RELOC, HEADER_FLAG_WRITTEN};
use tracing::debug;

/// The in-place mutation rule.
pub(crate) fn should_cow_block(trans: &Transaction, tree: &TreeRoot, block: &TreeBlock) -> bool {
    block.generation() != trans.transid()
        || block.has_flag(HEADER_FLAG_WRITTEN)
        || (block.has_flag(HEADER_FLAG_RELOC) && block.owner() != tree.id())
        || tree.force_cow()
}

pub(crate) struct CowCopy {
    pub(crate) new: BufferRef,
    pub(crate) guard: BlockWriteGuard,
    pub(crate) old_bytenr: Bytenr,
    pub(crate) old_generation: TransId,
    pub(crate) old_refs: u64,
}

/// Allocate and stamp the copy, adjusting child reference counts.
/// Does not touch the parent; the caller rewires and then releases the
/// original through [`release_cowed_block`].
pub(crate) fn cow_copy(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    old: &TreeBlock,
) -> Result<CowCopy> {
    let old_bytenr = old.bytenr();
    let old_generation = old.generation();
    let old_refs = ctree.refs().block_refs(old_bytenr)?;

    let new = ctree
        .store()
        .alloc_block(trans, old_bytenr, tree.id(), old.level())?;
    let mut guard = new.write();
    guard
        .copy_block_body(old)
        .map_err(|err| corrupt(old_bytenr, err))?;
    guard.set_bytenr(new.bytenr());
    guard.set_generation(trans.transid());
    guard.set_owner(tree.id());
    guard.set_flag(HEADER_FLAG_WRITTEN, false);
    guard.set_flag(HEADER_FLAG_RELOC, false);

    if old_refs > 1 {
        // The original stays reachable from another tree; the copy adds
        // a second claim on every child.
        ctree.refs().inc_ref(&guard, true)?;
    } else if tree.ref_cows() && old_generation != trans.transid() {
        // The committed version of this tree keeps the original block,
        // so its children gain a claim from the copy as well.
        ctree.refs().inc_ref(&guard, false)?;
    }
    ctree.store().mark_dirty(&new)?;

    debug!(
        target: "moss::ctree",
        old = old_bytenr.0,
        new = new.bytenr().0,
        level = old.level(),
        refs = old_refs,
        "cow_block"
    );
    Ok(CowCopy {
        new,
        guard,
        old_bytenr,
        old_generation,
        old_refs,
    })
}

/// Release the original block after its replacement has been wired in.
pub(crate) fn release_cowed_block(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    old_bytenr: Bytenr,
    old_generation: TransId,
    old_refs: u64,
) -> Result<()> {
    if old_refs > 1 {
        ctree.store().free_block(trans, old_bytenr, false)
    } else if tree.ref_cows() && old_generation != trans.transid() {
        // Owned solely by the committed tree version; it stays live
        // until that version is dropped.
        Ok(())
    } else {
        ctree.store().free_block(trans, old_bytenr, true)
    }
}

/// COW the block at `level` of the path, rewiring the parent pointer or
/// swapping the tree root. Requires write locks on this level and (when
/// present) the parent; the search loop's escalation guarantees both.
pub(crate) fn cow_block_at(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    path: &mut Path,
    level: usize,
) -> Result<()> {
    let copy = {
        let block = path.block(level)?;
        cow_copy(ctree, trans, tree, block)?
    };
    let slot_index = path.slot_index(level)?;

    if path.level(level + 1).is_some() {
        let parent_buf = path.buffer(level + 1)?;
        let pslot = path.slot_index(level + 1)?;
        {
            let parent = path.block_mut(level + 1)?;
            parent
                .set_node_blockptr(pslot, copy.new.bytenr())
                .map_err(|err| corrupt(parent_buf.bytenr(), err))?;
            parent
                .set_node_ptr_generation(pslot, trans.transid())
                .map_err(|err| corrupt(parent_buf.bytenr(), err))?;
        }
        ctree.store().mark_dirty(&parent_buf)?;
    } else {
        // Root swap happens under the old root's write lock (held in
        // the path), so concurrent root lockers retry against the new
        // pointer.
        tree.swap_root(RootPointer::new(
            copy.new.clone(),
            level as u8,
            trans.transid(),
        ));
    }

    release_cowed_block(
        ctree,
        trans,
        tree,
        copy.old_bytenr,
        copy.old_generation,
        copy.old_refs,
    )?;
    path.set_level(
        level,
        PathSlot {
            buffer: copy.new,
            slot: slot_index,
            held: Held::Write(copy.guard),
        },
    );
    Ok(())
}

/// COW a sibling block that is not on the path. The caller holds write
/// locks on both the sibling and the parent and passes the parent's
/// contents directly.
pub(crate) fn cow_sibling(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    parent: &mut TreeBlock,
    parent_buf: &BufferRef,
    pslot: usize,
    sibling: BufferRef,
    guard: BlockWriteGuard,
) -> Result<(BufferRef, BlockWriteGuard)> {
    if !should_cow_block(trans, tree, &guard) {
        return Ok((sibling, guard));
    }
    let copy = cow_copy(ctree, trans, tree, &guard)?;
    parent
        .set_node_blockptr(pslot, copy.new.bytenr())
        .map_err(|err| corrupt(parent_buf.bytenr(), err))?;
    parent
        .set_node_ptr_generation(pslot, trans.transid())
        .map_err(|err| corrupt(parent_buf.bytenr(), err))?;
    ctree.store().mark_dirty(parent_buf)?;
    release_cowed_block(
        ctree,
        trans,
        tree,
        copy.old_bytenr,
        copy.old_generation,
        copy.old_refs,
    )?;
    drop(guard);
    Ok((copy.new, copy.guard))
}
