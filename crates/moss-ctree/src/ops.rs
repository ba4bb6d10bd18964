//! Item-level mutations.
//!
//! Every operation searches with COW enabled, so by the time the leaf
//! is reached it is a current-generation block with enough room (the
//! search pre-split it) and the locked region covers everything the
//! mutation can touch. The leaf edit itself is then a plain byte-table
//! operation.

use crate::search::{search_core, SearchConfig};
use crate::{balance, corrupt, Ctree, Path, SearchOutcome, TreeRoot};
use moss_block::Transaction;
use moss_error::{MossError, Result};
use moss_types::{Key, ITEM_SIZE};
use tracing::debug;

fn mutation_config(ins_len: i64, extend: bool) -> SearchConfig {
    SearchConfig {
        ins_len,
        cow: true,
        extend,
        keep_locks: false,
        lowest_level: 0,
    }
}

// Under debug assertions every leaf edit re-validates the block, so a
// balancing bug trips at the mutation that introduced it instead of at
// the next full check.
fn debug_verify_leaf(path: &Path) {
    #[cfg(debug_assertions)]
    if let Ok(leaf) = path.block(0) {
        debug_assert!(
            moss_ondisk::check_leaf(leaf).is_ok(),
            "leaf {} failed validation after mutation",
            leaf.bytenr().0
        );
    }
    #[cfg(not(debug_assertions))]
    let _ = path;
}

fn insert_sized(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    key: Key,
    data: Option<&[u8]>,
    size: usize,
) -> Result<()> {
    let needed = ITEM_SIZE + size;
    if needed > ctree.store().block_size().data_area() {
        return Err(MossError::InvalidArgument(
            "item larger than a leaf can hold".into(),
        ));
    }
    let ins_len = i64::try_from(needed)
        .map_err(|_| MossError::InvalidArgument("item size out of range".into()))?;

    let mut path = Path::new();
    let outcome = search_core(
        ctree,
        Some(trans),
        tree,
        &key,
        &mutation_config(ins_len, false),
        &mut path,
    )?;
    if outcome == SearchOutcome::Found {
        return Err(MossError::Exists);
    }

    let slot = path.slot_index(0)?;
    let leaf_buf = path.buffer(0)?;
    {
        let leaf = path.block_mut(0)?;
        leaf.leaf_insert_item(slot, key, size)
            .map_err(|err| corrupt(leaf_buf.bytenr(), err))?;
        if let Some(data) = data {
            leaf.item_data_mut(slot)
                .map_err(|err| corrupt(leaf_buf.bytenr(), err))?
                .copy_from_slice(data);
        }
    }
    ctree.store().mark_dirty(&leaf_buf)?;
    if slot == 0 {
        balance::fixup_low_keys(ctree, &mut path, 1, key)?;
    }
    debug_verify_leaf(&path);
    debug!(
        target: "moss::ctree",
        tree = tree.id().0,
        key = %key,
        bytes = size,
        "insert_item"
    );
    Ok(())
}

pub(crate) fn insert_item(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    key: Key,
    data: &[u8],
) -> Result<()> {
    insert_sized(ctree, trans, tree, key, Some(data), data.len())
}

/// Insert an item whose payload starts zeroed; the caller fills it in
/// through a follow-up search while the space stays reserved.
pub(crate) fn insert_empty_item(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    key: Key,
    size: usize,
) -> Result<()> {
    insert_sized(ctree, trans, tree, key, None, size)
}

pub(crate) fn delete_item(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    key: &Key,
) -> Result<()> {
    let mut path = Path::new();
    let outcome = search_core(
        ctree,
        Some(trans),
        tree,
        key,
        &mutation_config(-1, false),
        &mut path,
    )?;
    if outcome == SearchOutcome::Missing {
        return Err(MossError::NotFound(key.to_string()));
    }
    let slot = path.slot_index(0)?;
    del_items(ctree, trans, tree, &mut path, slot, 1)
}

/// Remove `count` contiguous items starting at `slot`. The path must
/// come from a delete search whose key was the first removed item.
pub(crate) fn del_items(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    path: &mut Path,
    slot: usize,
    count: usize,
) -> Result<()> {
    let leaf_buf = path.buffer(0)?;
    path.block_mut(0)?
        .leaf_delete_items(slot, count)
        .map_err(|err| corrupt(leaf_buf.bytenr(), err))?;
    ctree.store().mark_dirty(&leaf_buf)?;
    debug_verify_leaf(path);

    let nritems = path.block(0)?.nritems();
    let has_parent = path.level(1).is_some();
    debug!(
        target: "moss::ctree",
        tree = tree.id().0,
        slot,
        count,
        remaining = nritems,
        "delete_items"
    );

    if nritems == 0 {
        if !has_parent {
            // An empty root leaf is the empty tree.
            return Ok(());
        }
        let pslot = path.slot_index(1)?;
        balance::del_ptr(ctree, path, 1, pslot)?;
        ctree.store().free_block(trans, leaf_buf.bytenr(), true)?;
        path.drop_level(0);
        return Ok(());
    }

    if slot == 0 {
        let first = {
            let leaf = path.block(0)?;
            leaf.item_key(0)
                .map_err(|err| corrupt(leaf.bytenr(), err))?
        };
        balance::fixup_low_keys(ctree, path, 1, first)?;
    }

    if has_parent {
        let used = {
            let leaf = path.block(0)?;
            leaf.leaf_used()
                .map_err(|err| corrupt(leaf.bytenr(), err))?
        };
        if used < ctree.store().block_size().data_area() / 4 {
            balance::try_merge_leaf(ctree, trans, tree, path)?;
        }
    }
    Ok(())
}

/// Grow an item's payload by `extra` zeroed bytes at its logical end.
pub(crate) fn extend_item(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    key: &Key,
    extra: usize,
) -> Result<()> {
    if extra == 0 {
        return Ok(());
    }
    let ins_len = i64::try_from(extra)
        .map_err(|_| MossError::InvalidArgument("extension size out of range".into()))?;
    let mut path = Path::new();
    let outcome = search_core(
        ctree,
        Some(trans),
        tree,
        key,
        &mutation_config(ins_len, true),
        &mut path,
    )?;
    if outcome == SearchOutcome::Missing {
        return Err(MossError::NotFound(key.to_string()));
    }

    let slot = path.slot_index(0)?;
    let leaf_buf = path.buffer(0)?;
    path.block_mut(0)?
        .leaf_extend_item(slot, extra)
        .map_err(|err| corrupt(leaf_buf.bytenr(), err))?;
    ctree.store().mark_dirty(&leaf_buf)?;
    debug_verify_leaf(&path);
    debug!(
        target: "moss::ctree",
        tree = tree.id().0,
        key = %key,
        extra,
        "extend_item"
    );
    Ok(())
}

/// Shrink an item's payload to `new_size` bytes, discarding the tail or
/// the head.
pub(crate) fn truncate_item(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    key: &Key,
    new_size: usize,
    from_end: bool,
) -> Result<()> {
    let mut path = Path::new();
    let outcome = search_core(
        ctree,
        Some(trans),
        tree,
        key,
        &mutation_config(0, false),
        &mut path,
    )?;
    if outcome == SearchOutcome::Missing {
        return Err(MossError::NotFound(key.to_string()));
    }

    let slot = path.slot_index(0)?;
    let current = {
        let leaf = path.block(0)?;
        leaf.item_size(slot)
            .map_err(|err| corrupt(leaf.bytenr(), err))?
    };
    if new_size > current {
        return Err(MossError::InvalidArgument(
            "truncation size exceeds the item".into(),
        ));
    }
    if new_size == current {
        return Ok(());
    }
    let leaf_buf = path.buffer(0)?;
    path.block_mut(0)?
        .leaf_truncate_item(slot, new_size, from_end)
        .map_err(|err| corrupt(leaf_buf.bytenr(), err))?;
    ctree.store().mark_dirty(&leaf_buf)?;
    debug_verify_leaf(&path);
    debug!(
        target: "moss::ctree",
        tree = tree.id().0,
        key = %key,
        new_size,
        from_end,
        "truncate_item"
    );
    Ok(())
}

/// Split an item in two at `split_offset`: the original keeps the
/// leading bytes, a new item under `new_key` receives the tail. The
/// new key must sort between the original and its successor.
pub(crate) fn split_item(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    key: &Key,
    new_key: Key,
    split_offset: usize,
) -> Result<()> {
    let ins_len = i64::try_from(ITEM_SIZE)
        .map_err(|_| MossError::InvalidArgument("item header size out of range".into()))?;
    let mut path = Path::new();
    // Extension-style search: room for one more header, item kept whole.
    let outcome = search_core(
        ctree,
        Some(trans),
        tree,
        key,
        &mutation_config(ins_len, true),
        &mut path,
    )?;
    if outcome == SearchOutcome::Missing {
        return Err(MossError::NotFound(key.to_string()));
    }

    let slot = path.slot_index(0)?;
    let (size, nritems) = {
        let leaf = path.block(0)?;
        (
            leaf.item_size(slot)
                .map_err(|err| corrupt(leaf.bytenr(), err))?,
            leaf.nritems(),
        )
    };
    if split_offset == 0 || split_offset >= size {
        return Err(MossError::InvalidArgument(
            "split offset outside the item".into(),
        ));
    }
    if new_key <= *key {
        return Err(MossError::InvalidArgument(
            "split key does not sort after the original".into(),
        ));
    }
    if slot + 1 < nritems {
        let next = {
            let leaf = path.block(0)?;
            leaf.item_key(slot + 1)
                .map_err(|err| corrupt(leaf.bytenr(), err))?
        };
        if new_key >= next {
            return Err(MossError::InvalidArgument(
                "split key collides with the next item".into(),
            ));
        }
    } else if let Some(hint) = path.next_key_hint {
        if new_key >= hint {
            return Err(MossError::InvalidArgument(
                "split key crosses into the next leaf".into(),
            ));
        }
    }

    let tail = {
        let leaf = path.block(0)?;
        leaf.item_data(slot)
            .map_err(|err| corrupt(leaf.bytenr(), err))?[split_offset..]
            .to_vec()
    };
    let leaf_buf = path.buffer(0)?;
    {
        let leaf = path.block_mut(0)?;
        leaf.leaf_truncate_item(slot, split_offset, true)
            .map_err(|err| corrupt(leaf_buf.bytenr(), err))?;
        leaf.leaf_insert_item(slot + 1, new_key, tail.len())
            .map_err(|err| corrupt(leaf_buf.bytenr(), err))?;
        leaf.item_data_mut(slot + 1)
            .map_err(|err| corrupt(leaf_buf.bytenr(), err))?
            .copy_from_slice(&tail);
    }
    ctree.store().mark_dirty(&leaf_buf)?;
    debug_verify_leaf(&path);
    debug!(
        target: "moss::ctree",
        tree = tree.id().0,
        key = %key,
        new_key = %new_key,
        split_offset,
        "split_item"
    );
    Ok(())
}

/// Rewrite an item's key in place. The new key must preserve the order
/// against both in-leaf neighbors; ordering against other leaves is the
/// caller's contract (a lowered leftmost key propagates upward).
pub(crate) fn set_item_key_safe(
    ctree: &Ctree,
    trans: &Transaction,
    tree: &TreeRoot,
    key: &Key,
    new_key: Key,
) -> Result<()> {
    if new_key == *key {
        return Ok(());
    }
    let mut path = Path::new();
    let outcome = search_core(
        ctree,
        Some(trans),
        tree,
        key,
        &mutation_config(0, false),
        &mut path,
    )?;
    if outcome == SearchOutcome::Missing {
        return Err(MossError::NotFound(key.to_string()));
    }

    let slot = path.slot_index(0)?;
    let nritems = path.block(0)?.nritems();
    if slot > 0 {
        let prev = {
            let leaf = path.block(0)?;
            leaf.item_key(slot - 1)
                .map_err(|err| corrupt(leaf.bytenr(), err))?
        };
        if new_key <= prev {
            return Err(MossError::InvalidArgument(
                "new key does not sort after the previous item".into(),
            ));
        }
    }
    if slot + 1 < nritems {
        let next = {
            let leaf = path.block(0)?;
            leaf.item_key(slot + 1)
                .map_err(|err| corrupt(leaf.bytenr(), err))?
        };
        if new_key >= next {
            return Err(MossError::InvalidArgument(
                "new key does not sort before the next item".into(),
            ));
        }
    } else if let Some(hint) = path.next_key_hint {
        if new_key >= hint {
            return Err(MossError::InvalidArgument(
                "new key crosses into the next leaf".into(),
            ));
        }
    }

    let leaf_buf = path.buffer(0)?;
    path.block_mut(0)?
        .set_item_key(slot, new_key)
        .map_err(|err| corrupt(leaf_buf.bytenr(), err))?;
    ctree.store().mark_dirty(&leaf_buf)?;
    if slot == 0 {
        balance::fixup_low_keys(ctree, &mut path, 1, new_key)?;
    }
    debug_verify_leaf(&path);
    debug!(
        target: "moss::ctree",
        tree = tree.id().0,
        key = %key,
        new_key = %new_key,
        "set_item_key"
    );
    Ok(())
}
