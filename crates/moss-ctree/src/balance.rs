//! Structural maintenance: splits, pushes, merges, and root changes.
//!
//! Inserts split on the way down so an ancestor never has to change
//! after the leaf is reached; deletes merge on the way down for the
//! same reason. A full leaf first tries to shed items into an adjacent
//! sibling (COWing it through the shared, write-locked parent) and only
//! splits when neither side can absorb enough. A leaf split picks a
//! byte-balanced split point, falls back to cutting at the insertion
//! point, and needs at most one follow-up split.

use crate::path::{Held, PathSlot};
use crate::{corrupt, cow, read_child, Ctree, Path, RootPointer, TreeRoot};
use moss_block::{BlockWriteGuard, BufferRef, Transaction};
use moss_error::{MossError, Result};
use moss_ondisk::TreeBlock;
use moss_types::{Key, ITEM_SIZE, MAX_LEVEL};
use tracing::debug;

/// Lock a sibling under the write-locked parent at `parent_level` and
/// COW it if its generation requires.
fn cow_locked_sibling(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    path: &mut Path,
    parent_level: usize,
    pslot: usize,
) -> Result<(BufferRef, BlockWriteGuard)> {
    let sibling = {
        let parent = path.block(parent_level)?;
        read_child(ctree, parent, pslot)?
    };
    let guard = sibling.write();
    let parent_buf = path.buffer(parent_level)?;
    let parent = path.block_mut(parent_level)?;
    cow::cow_sibling(ctree, trans, tree, parent, &parent_buf, pslot, sibling, guard)
}

/// Grow the tree by one level: a fresh root node pointing at the block
/// currently at `level`. The old root's write lock (held in the path)
/// covers the swap.
pub(crate) fn insert_new_root(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    path: &mut Path,
    level: usize,
) -> Result<()> {
    let (old_bytenr, old_generation, first_key, old_level) = {
        let block = path.block(level)?;
        let key = if block.nritems() == 0 {
            Key::MIN
        } else if block.is_leaf() {
            block
                .item_key(0)
                .map_err(|err| corrupt(block.bytenr(), err))?
        } else {
            block
                .node_key(0)
                .map_err(|err| corrupt(block.bytenr(), err))?
        };
        (block.bytenr(), block.generation(), key, block.level())
    };
    if usize::from(old_level) + 1 >= MAX_LEVEL {
        return Err(corrupt(old_bytenr, "tree height limit reached"));
    }

    let new_ref = ctree
        .store()
        .alloc_block(trans, old_bytenr, tree.id(), old_level + 1)?;
    let mut guard = new_ref.write();
    guard
        .node_insert_ptr(0, first_key, old_bytenr, old_generation)
        .map_err(|err| corrupt(new_ref.bytenr(), err))?;
    ctree.store().mark_dirty(&new_ref)?;

    tree.swap_root(RootPointer::new(
        new_ref.clone(),
        old_level + 1,
        trans.transid(),
    ));
    path.set_level(
        level + 1,
        PathSlot {
            buffer: new_ref,
            slot: 0,
            held: Held::Write(guard),
        },
    );
    debug!(
        target: "moss::ctree",
        tree = tree.id().0,
        level = old_level + 1,
        "tree_height_grow"
    );
    Ok(())
}

/// Split the node at `level` in half, hooking the upper half into the
/// parent (growing the root first if there is none). The path follows
/// whichever half holds its slot.
pub(crate) fn split_node(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    path: &mut Path,
    level: usize,
) -> Result<()> {
    if path.level(level + 1).is_none() {
        insert_new_root(ctree, trans, tree, path, level)?;
    }
    let (nritems, block_level, bytenr) = {
        let block = path.block(level)?;
        (block.nritems(), block.level(), block.bytenr())
    };
    let mid = nritems / 2;

    let new_ref = ctree
        .store()
        .alloc_block(trans, bytenr, tree.id(), block_level)?;
    let mut new_guard = new_ref.write();
    {
        let block = path.block(level)?;
        new_guard
            .node_append_ptrs(block, mid, nritems - mid)
            .map_err(|err| corrupt(new_ref.bytenr(), err))?;
    }
    path.block_mut(level)?
        .set_nritems(mid)
        .map_err(|err| corrupt(bytenr, err))?;
    let split_key = new_guard
        .node_key(0)
        .map_err(|err| corrupt(new_ref.bytenr(), err))?;

    let pslot = path.slot_index(level + 1)?;
    let parent_buf = path.buffer(level + 1)?;
    path.block_mut(level + 1)?
        .node_insert_ptr(pslot + 1, split_key, new_ref.bytenr(), trans.transid())
        .map_err(|err| corrupt(parent_buf.bytenr(), err))?;
    ctree.store().mark_dirty(&parent_buf)?;
    ctree.store().mark_dirty(&path.buffer(level)?)?;

    let slot = path.slot_index(level)?;
    debug!(
        target: "moss::ctree",
        bytenr = bytenr.0,
        new = new_ref.bytenr().0,
        level,
        mid,
        "node_split"
    );
    if slot >= mid {
        path.set_level(
            level,
            PathSlot {
                buffer: new_ref,
                slot: slot - mid,
                held: Held::Write(new_guard),
            },
        );
        path.set_slot_index(level + 1, pslot + 1)?;
    }
    Ok(())
}

/// Remove one key pointer from the node at `level`, propagating the new
/// low key upward when the first entry was removed.
pub(crate) fn del_ptr(
    ctree: &Ctree,
    path: &mut Path,
    level: usize,
    slot: usize,
) -> Result<()> {
    let bytenr = path.buffer(level)?.bytenr();
    path.block_mut(level)?
        .node_remove_ptrs(slot, 1)
        .map_err(|err| corrupt(bytenr, err))?;
    ctree.store().mark_dirty(&path.buffer(level)?)?;

    let nritems = path.block(level)?.nritems();
    if nritems == 0 {
        // Descent-time balancing guarantees at least two entries before
        // a removal; an emptied node means the tree is inconsistent.
        return Err(corrupt(bytenr, "internal node emptied by pointer removal"));
    }
    if slot == 0 {
        let first = {
            let block = path.block(level)?;
            block
                .node_key(0)
                .map_err(|err| corrupt(block.bytenr(), err))?
        };
        fixup_low_keys(ctree, path, level + 1, first)?;
    }
    Ok(())
}

/// Write `key` into each ancestor at its path slot, walking up while
/// the slot is the leftmost one.
pub(crate) fn fixup_low_keys(
    ctree: &Ctree,
    path: &mut Path,
    start_level: usize,
    key: Key,
) -> Result<()> {
    for i in start_level..MAX_LEVEL {
        let Some(slot) = path.level(i) else { break };
        let index = slot.slot();
        let bytenr = slot.buffer().bytenr();
        let Some(block) = path.level_mut(i).and_then(crate::path::PathSlot::contents_mut)
        else {
            return Err(corrupt(
                bytenr,
                "low key rewrite reached an ancestor without a write lock",
            ));
        };
        block
            .set_node_key(index, key)
            .map_err(|err| corrupt(bytenr, err))?;
        ctree.store().mark_dirty(&path.buffer(i)?)?;
        if index != 0 {
            break;
        }
    }
    Ok(())
}

/// Rebalance the node at `level` during a delete descent. Returns the
/// level the search should continue at (lower after a root collapse).
pub(crate) fn balance_level(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    path: &mut Path,
    level: usize,
) -> Result<usize> {
    if path.level(level + 1).is_none() {
        return collapse_root(ctree, trans, tree, path, level);
    }

    let (nritems, capacity, bytenr) = {
        let block = path.block(level)?;
        (block.nritems(), block.node_capacity(), block.bytenr())
    };
    if nritems > capacity / 4 {
        return Ok(level);
    }
    let pslot = path.slot_index(level + 1)?;
    let parent_nritems = path.block(level + 1)?.nritems();
    let orig_slot = path.slot_index(level)?;

    if pslot > 0 {
        let (left_ref, mut left_guard) =
            cow_locked_sibling(ctree, trans, tree, path, level + 1, pslot - 1)?;
        let left_n = left_guard.nritems();

        if capacity - left_n >= nritems {
            // The whole block fits into its left sibling.
            {
                let block = path.block(level)?;
                left_guard
                    .node_append_ptrs(block, 0, nritems)
                    .map_err(|err| corrupt(left_ref.bytenr(), err))?;
            }
            ctree.store().mark_dirty(&left_ref)?;
            del_ptr(ctree, path, level + 1, pslot)?;
            ctree.store().free_block(trans, bytenr, true)?;
            path.set_level(
                level,
                PathSlot {
                    buffer: left_ref,
                    slot: left_n + orig_slot,
                    held: Held::Write(left_guard),
                },
            );
            path.set_slot_index(level + 1, pslot - 1)?;
            debug!(target: "moss::ctree", bytenr = bytenr.0, level, "node_merge_left");
            return Ok(level);
        }

        if left_n > nritems + 1 {
            let steal = (left_n - nritems) / 2;
            {
                let left: &TreeBlock = &left_guard;
                path.block_mut(level)?
                    .node_prepend_ptrs(left, left_n - steal, steal)
                    .map_err(|err| corrupt(bytenr, err))?;
            }
            left_guard
                .set_nritems(left_n - steal)
                .map_err(|err| corrupt(left_ref.bytenr(), err))?;
            ctree.store().mark_dirty(&left_ref)?;
            ctree.store().mark_dirty(&path.buffer(level)?)?;
            let new_first = {
                let block = path.block(level)?;
                block
                    .node_key(0)
                    .map_err(|err| corrupt(block.bytenr(), err))?
            };
            path.block_mut(level + 1)?
                .set_node_key(pslot, new_first)
                .map_err(|err| corrupt(bytenr, err))?;
            ctree.store().mark_dirty(&path.buffer(level + 1)?)?;
            path.set_slot_index(level, orig_slot + steal)?;
            debug!(target: "moss::ctree", bytenr = bytenr.0, level, steal, "node_steal_left");
            return Ok(level);
        }
    }

    if pslot + 1 < parent_nritems {
        let (right_ref, mut right_guard) =
            cow_locked_sibling(ctree, trans, tree, path, level + 1, pslot + 1)?;
        let right_n = right_guard.nritems();

        if capacity - nritems >= right_n {
            // Absorb the right sibling; separators above stay valid.
            {
                let right: &TreeBlock = &right_guard;
                path.block_mut(level)?
                    .node_append_ptrs(right, 0, right_n)
                    .map_err(|err| corrupt(bytenr, err))?;
            }
            ctree.store().mark_dirty(&path.buffer(level)?)?;
            del_ptr(ctree, path, level + 1, pslot + 1)?;
            ctree.store().free_block(trans, right_ref.bytenr(), true)?;
            debug!(
                target: "moss::ctree",
                bytenr = bytenr.0,
                absorbed = right_ref.bytenr().0,
                level,
                "node_merge_right"
            );
            return Ok(level);
        }

        if right_n > nritems + 1 {
            let steal = (right_n - nritems) / 2;
            {
                let right: &TreeBlock = &right_guard;
                path.block_mut(level)?
                    .node_append_ptrs(right, 0, steal)
                    .map_err(|err| corrupt(bytenr, err))?;
            }
            right_guard
                .node_remove_ptrs(0, steal)
                .map_err(|err| corrupt(right_ref.bytenr(), err))?;
            ctree.store().mark_dirty(&right_ref)?;
            ctree.store().mark_dirty(&path.buffer(level)?)?;
            let right_first = right_guard
                .node_key(0)
                .map_err(|err| corrupt(right_ref.bytenr(), err))?;
            path.block_mut(level + 1)?
                .set_node_key(pslot + 1, right_first)
                .map_err(|err| corrupt(bytenr, err))?;
            ctree.store().mark_dirty(&path.buffer(level + 1)?)?;
            debug!(target: "moss::ctree", bytenr = bytenr.0, level, steal, "node_steal_right");
            return Ok(level);
        }
    }

    Ok(level)
}

/// Root with a single child: the child becomes the root and the tree
/// loses a level.
fn collapse_root(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    path: &mut Path,
    level: usize,
) -> Result<usize> {
    let (nritems, block_level, root_bytenr) = {
        let block = path.block(level)?;
        (block.nritems(), block.level(), block.bytenr())
    };
    if block_level == 0 || nritems != 1 {
        return Ok(level);
    }

    let child_ref = {
        let block = path.block(level)?;
        read_child(ctree, block, 0)?
    };
    let child_guard = child_ref.write();
    let child_level = usize::from(child_guard.level());

    let (new_root, new_guard) = if cow::should_cow_block(trans, tree, &child_guard) {
        let copy = cow::cow_copy(ctree, trans, tree, &child_guard)?;
        tree.swap_root(RootPointer::new(
            copy.new.clone(),
            child_level as u8,
            trans.transid(),
        ));
        cow::release_cowed_block(
            ctree,
            trans,
            tree,
            copy.old_bytenr,
            copy.old_generation,
            copy.old_refs,
        )?;
        drop(child_guard);
        (copy.new, copy.guard)
    } else {
        tree.swap_root(RootPointer::new(
            child_ref.clone(),
            child_level as u8,
            child_guard.generation(),
        ));
        (child_ref, child_guard)
    };

    ctree.store().free_block(trans, root_bytenr, true)?;
    path.drop_level(level);
    path.set_level(
        child_level,
        PathSlot {
            buffer: new_root,
            slot: 0,
            held: Held::Write(new_guard),
        },
    );
    debug!(
        target: "moss::ctree",
        tree = tree.id().0,
        old_root = root_bytenr.0,
        level = child_level,
        "tree_height_shrink"
    );
    Ok(child_level)
}

// ── Leaf splitting ──────────────────────────────────────────────────────────

/// Pick the split index for a full leaf: items `[mid..)` move to the
/// new right sibling. Prefers a byte-balanced point, falls back to the
/// insertion position, and for a leftmost insert empties the leaf so
/// the new item has it to itself.
fn leaf_split_point(
    leaf: &TreeBlock,
    slot: usize,
    data_size: usize,
    extend: bool,
) -> Result<usize> {
    let nritems = leaf.nritems();
    let dal = leaf.data_area();
    let weight = |i: usize| -> Result<usize> {
        let size = leaf.item_size(i).map_err(|err| corrupt(leaf.bytenr(), err))?;
        let mut w = ITEM_SIZE + size;
        if extend && i == slot {
            w += data_size;
        }
        Ok(w)
    };

    if !extend && slot == nritems {
        // Append past the last item: the new item opens a fresh leaf.
        return Ok(nritems);
    }

    let used = leaf
        .leaf_used()
        .map_err(|err| corrupt(leaf.bytenr(), err))?;
    let half = (used + data_size) / 2;
    let mut acc = 0_usize;
    let mut mid = nritems;
    for i in 0..nritems {
        if !extend && i == slot {
            acc += data_size;
        }
        acc += weight(i)?;
        if acc >= half {
            mid = i + 1;
            break;
        }
    }

    let pending_fits = |mid: usize| -> Result<bool> {
        let pending_left = slot < mid || (!extend && mid == 0 && slot == 0);
        let mut side = if extend { 0 } else { data_size };
        if pending_left {
            for i in 0..mid {
                side += weight(i)?;
            }
        } else {
            for i in mid..nritems {
                side += weight(i)?;
            }
        }
        Ok(side <= dal)
    };

    if mid >= 1 && pending_fits(mid)? {
        return Ok(mid);
    }
    if slot >= 1 {
        // Cut at the insertion point; if even that half overflows, the
        // follow-up split resolves it.
        return Ok(slot);
    }
    // Leftmost insert that no balanced cut can host.
    if extend {
        Ok(1)
    } else {
        Ok(0)
    }
}

fn do_leaf_split(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    key: &Key,
    path: &mut Path,
    data_size: usize,
    extend: bool,
) -> Result<()> {
    let slot = path.slot_index(0)?;
    let (nritems, mid, bytenr) = {
        let leaf = path.block(0)?;
        let mid = leaf_split_point(leaf, slot, data_size, extend)?;
        (leaf.nritems(), mid, leaf.bytenr())
    };

    let new_ref = ctree.store().alloc_block(trans, bytenr, tree.id(), 0)?;
    let mut new_guard = new_ref.write();
    if mid < nritems {
        let leaf = path.block(0)?;
        new_guard
            .leaf_append_items(leaf, mid, nritems - mid)
            .map_err(|err| corrupt(new_ref.bytenr(), err))?;
    }
    path.block_mut(0)?
        .leaf_truncate_tail_items(nritems - mid)
        .map_err(|err| corrupt(bytenr, err))?;

    // An empty right sibling is keyed by the item about to arrive.
    let separator = if mid < nritems {
        new_guard
            .item_key(0)
            .map_err(|err| corrupt(new_ref.bytenr(), err))?
    } else {
        *key
    };
    let pslot = path.slot_index(1)?;
    let parent_buf = path.buffer(1)?;
    path.block_mut(1)?
        .node_insert_ptr(pslot + 1, separator, new_ref.bytenr(), trans.transid())
        .map_err(|err| corrupt(parent_buf.bytenr(), err))?;
    ctree.store().mark_dirty(&parent_buf)?;
    ctree.store().mark_dirty(&path.buffer(0)?)?;

    debug!(
        target: "moss::ctree",
        bytenr = bytenr.0,
        new = new_ref.bytenr().0,
        mid,
        nritems,
        "leaf_split"
    );
    let pending_right = if extend { slot >= mid } else { slot >= mid && mid > 0 };
    if pending_right {
        path.set_level(
            0,
            PathSlot {
                buffer: new_ref,
                slot: slot - mid,
                held: Held::Write(new_guard),
            },
        );
        path.set_slot_index(1, pslot + 1)?;
    }
    Ok(())
}

/// Make room in the leaf for `data_size` pending bytes: push into the
/// siblings first, then split (at most twice).
pub(crate) fn split_leaf(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    key: &Key,
    path: &mut Path,
    data_size: usize,
    extend: bool,
) -> Result<()> {
    let dal = ctree.store().block_size().data_area();
    let current = if extend {
        let leaf = path.block(0)?;
        let slot = path.slot_index(0)?;
        if slot < leaf.nritems() {
            ITEM_SIZE
                + leaf
                    .item_size(slot)
                    .map_err(|err| corrupt(leaf.bytenr(), err))?
        } else {
            ITEM_SIZE
        }
    } else {
        0
    };
    if current + data_size > dal {
        return Err(MossError::InvalidArgument(
            "item would exceed leaf capacity".into(),
        ));
    }

    if path.level(1).is_some() {
        if push_leaf_right(ctree, trans, tree, path, data_size)? {
            return Ok(());
        }
        if push_leaf_left(ctree, trans, tree, path, data_size)? {
            return Ok(());
        }
    } else {
        insert_new_root(ctree, trans, tree, path, 0)?;
    }

    for _ in 0..2 {
        let free = {
            let leaf = path.block(0)?;
            leaf.leaf_free_space()
                .map_err(|err| corrupt(leaf.bytenr(), err))?
        };
        if free >= data_size {
            return Ok(());
        }
        do_leaf_split(ctree, trans, tree, key, path, data_size, extend)?;
    }
    let free = {
        let leaf = path.block(0)?;
        leaf.leaf_free_space()
            .map_err(|err| corrupt(leaf.bytenr(), err))?
    };
    if free >= data_size {
        Ok(())
    } else {
        Err(MossError::Corruption {
            block: path.buffer(0)?.bytenr().0,
            detail: "leaf split failed to make room".into(),
        })
    }
}

/// Shed tail items into the right sibling. Returns whether the leaf
/// now holding the path has room for the pending bytes.
fn push_leaf_right(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    path: &mut Path,
    data_size: usize,
) -> Result<bool> {
    let pslot = path.slot_index(1)?;
    let parent_nritems = path.block(1)?.nritems();
    if pslot + 1 >= parent_nritems {
        return Ok(false);
    }
    let (right_ref, mut right_guard) =
        cow_locked_sibling(ctree, trans, tree, path, 1, pslot + 1)?;
    let right_free = right_guard
        .leaf_free_space()
        .map_err(|err| corrupt(right_ref.bytenr(), err))?;
    let slot = path.slot_index(0)?;

    let (count, boundary) = {
        let leaf = path.block(0)?;
        let n = leaf.nritems();
        if n < 2 {
            return Ok(false);
        }
        let mut bytes = 0_usize;
        let mut count = 0_usize;
        for i in (1..n).rev() {
            let w = ITEM_SIZE
                + leaf
                    .item_size(i)
                    .map_err(|err| corrupt(leaf.bytenr(), err))?;
            if bytes + w > right_free {
                break;
            }
            bytes += w;
            count += 1;
        }
        (count, n - count)
    };
    if count == 0 {
        return Ok(false);
    }

    {
        let leaf = path.block(0)?;
        right_guard
            .leaf_prepend_items(leaf, boundary, count)
            .map_err(|err| corrupt(right_ref.bytenr(), err))?;
    }
    let leaf_buf = path.buffer(0)?;
    path.block_mut(0)?
        .leaf_truncate_tail_items(count)
        .map_err(|err| corrupt(leaf_buf.bytenr(), err))?;
    let separator = right_guard
        .item_key(0)
        .map_err(|err| corrupt(right_ref.bytenr(), err))?;
    let parent_buf = path.buffer(1)?;
    path.block_mut(1)?
        .set_node_key(pslot + 1, separator)
        .map_err(|err| corrupt(parent_buf.bytenr(), err))?;
    ctree.store().mark_dirty(&leaf_buf)?;
    ctree.store().mark_dirty(&right_ref)?;
    ctree.store().mark_dirty(&parent_buf)?;
    debug!(
        target: "moss::ctree",
        bytenr = leaf_buf.bytenr().0,
        moved = count,
        "push_leaf_right"
    );

    if slot >= boundary {
        path.set_level(
            0,
            PathSlot {
                buffer: right_ref,
                slot: slot - boundary,
                held: Held::Write(right_guard),
            },
        );
        path.set_slot_index(1, pslot + 1)?;
    }
    let free = {
        let leaf = path.block(0)?;
        leaf.leaf_free_space()
            .map_err(|err| corrupt(leaf.bytenr(), err))?
    };
    Ok(free >= data_size)
}

/// Shed leading items into the left sibling.
fn push_leaf_left(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    path: &mut Path,
    data_size: usize,
) -> Result<bool> {
    let pslot = path.slot_index(1)?;
    if pslot == 0 {
        return Ok(false);
    }
    let (left_ref, mut left_guard) =
        cow_locked_sibling(ctree, trans, tree, path, 1, pslot - 1)?;
    let left_free = left_guard
        .leaf_free_space()
        .map_err(|err| corrupt(left_ref.bytenr(), err))?;
    let left_old = left_guard.nritems();
    let slot = path.slot_index(0)?;

    let count = {
        let leaf = path.block(0)?;
        let n = leaf.nritems();
        if n < 2 {
            return Ok(false);
        }
        let mut bytes = 0_usize;
        let mut count = 0_usize;
        for i in 0..n - 1 {
            let w = ITEM_SIZE
                + leaf
                    .item_size(i)
                    .map_err(|err| corrupt(leaf.bytenr(), err))?;
            if bytes + w > left_free {
                break;
            }
            bytes += w;
            count += 1;
        }
        count
    };
    if count == 0 {
        return Ok(false);
    }

    {
        let leaf = path.block(0)?;
        left_guard
            .leaf_append_items(leaf, 0, count)
            .map_err(|err| corrupt(left_ref.bytenr(), err))?;
    }
    let leaf_buf = path.buffer(0)?;
    path.block_mut(0)?
        .leaf_delete_items(0, count)
        .map_err(|err| corrupt(leaf_buf.bytenr(), err))?;
    let new_first = {
        let leaf = path.block(0)?;
        leaf.item_key(0)
            .map_err(|err| corrupt(leaf.bytenr(), err))?
    };
    let parent_buf = path.buffer(1)?;
    path.block_mut(1)?
        .set_node_key(pslot, new_first)
        .map_err(|err| corrupt(parent_buf.bytenr(), err))?;
    ctree.store().mark_dirty(&leaf_buf)?;
    ctree.store().mark_dirty(&left_ref)?;
    ctree.store().mark_dirty(&parent_buf)?;
    debug!(
        target: "moss::ctree",
        bytenr = leaf_buf.bytenr().0,
        moved = count,
        "push_leaf_left"
    );

    if slot < count {
        path.set_level(
            0,
            PathSlot {
                buffer: left_ref,
                slot: left_old + slot,
                held: Held::Write(left_guard),
            },
        );
        path.set_slot_index(1, pslot - 1)?;
    } else {
        path.set_slot_index(0, slot - count)?;
    }
    let free = {
        let leaf = path.block(0)?;
        leaf.leaf_free_space()
            .map_err(|err| corrupt(leaf.bytenr(), err))?
    };
    Ok(free >= data_size)
}

/// After a delete left the leaf sparse, fold it into a neighbor when
/// one has room: the leaf merges into its left sibling, or absorbs its
/// right sibling. Either way no low key above the parent changes.
pub(crate) fn try_merge_leaf(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    path: &mut Path,
) -> Result<()> {
    let pslot = path.slot_index(1)?;
    let parent_nritems = path.block(1)?.nritems();
    let (n, used, bytenr) = {
        let leaf = path.block(0)?;
        (
            leaf.nritems(),
            leaf.leaf_used()
                .map_err(|err| corrupt(leaf.bytenr(), err))?,
            leaf.bytenr(),
        )
    };

    if pslot > 0 {
        let (left_ref, mut left_guard) =
            cow_locked_sibling(ctree, trans, tree, path, 1, pslot - 1)?;
        let left_free = left_guard
            .leaf_free_space()
            .map_err(|err| corrupt(left_ref.bytenr(), err))?;
        if left_free >= used {
            let left_old = left_guard.nritems();
            {
                let leaf = path.block(0)?;
                left_guard
                    .leaf_append_items(leaf, 0, n)
                    .map_err(|err| corrupt(left_ref.bytenr(), err))?;
            }
            ctree.store().mark_dirty(&left_ref)?;
            del_ptr(ctree, path, 1, pslot)?;
            ctree.store().free_block(trans, bytenr, true)?;
            path.set_level(
                0,
                PathSlot {
                    buffer: left_ref,
                    slot: left_old,
                    held: Held::Write(left_guard),
                },
            );
            path.set_slot_index(1, pslot - 1)?;
            debug!(target: "moss::ctree", bytenr = bytenr.0, "leaf_merge_left");
            return Ok(());
        }
    }

    if pslot + 1 < parent_nritems {
        let (right_ref, right_guard) =
            cow_locked_sibling(ctree, trans, tree, path, 1, pslot + 1)?;
        let right_n = right_guard.nritems();
        let right_used = right_guard
            .leaf_used()
            .map_err(|err| corrupt(right_ref.bytenr(), err))?;
        let leaf_free = {
            let leaf = path.block(0)?;
            leaf.leaf_free_space()
                .map_err(|err| corrupt(leaf.bytenr(), err))?
        };
        if leaf_free >= right_used {
            {
                let right: &TreeBlock = &right_guard;
                path.block_mut(0)?
                    .leaf_append_items(right, 0, right_n)
                    .map_err(|err| corrupt(bytenr, err))?;
            }
            ctree.store().mark_dirty(&path.buffer(0)?)?;
            del_ptr(ctree, path, 1, pslot + 1)?;
            ctree.store().free_block(trans, right_ref.bytenr(), true)?;
            debug!(
                target: "moss::ctree",
                bytenr = bytenr.0,
                absorbed = right_ref.bytenr().0,
                "leaf_merge_right"
            );
        }
    }
    Ok(())
}
