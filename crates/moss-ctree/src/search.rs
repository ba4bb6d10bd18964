//! Lock-coupled descent.
//!
//! `search_core` walks root to target level, holding at most a rolling
//! window of locks: a block stays locked while its child is fetched and
//! locked, then `unlock_up` releases every ancestor that can no longer
//! be affected by the pending mutation. Mutating descents COW each
//! visited block and run structural maintenance on the way down
//! (pre-emptive node splits for inserts, merges for deletes), so by the
//! time the leaf is reached no change can propagate above the locked
//! region.
//!
//! Lock escalation is speculative: the walk starts by write-locking
//! only the target level and its parent, and restarts with a wider
//! write-locked region whenever COW, a split, a merge, or a low-key
//! rewrite turns out to reach higher. Restarts strictly widen the
//! region, so the number of retries is bounded by the tree height.

use crate::path::{Held, PathSlot};
use crate::{balance, corrupt, cow, read_child, Ctree, Path, SearchOutcome, TreeRoot};
use moss_block::Transaction;
use moss_error::{MossError, Result};
use moss_ondisk::TreeBlock;
use moss_types::{Key, MAX_LEVEL};
use tracing::trace;

/// Node split threshold: leave headroom for one pointer insert per
/// descent level below.
const NODE_SPLIT_HEADROOM: usize = 3;

pub(crate) struct SearchConfig {
    /// Positive: bytes the pending insert or extension needs in the
    /// leaf. Negative: a delete follows. Zero: read or key rewrite.
    pub ins_len: i64,
    pub cow: bool,
    /// The pending bytes grow the existing item at the found slot
    /// instead of adding a new item.
    pub extend: bool,
    pub keep_locks: bool,
    pub lowest_level: usize,
}

impl SearchConfig {
    pub(crate) fn read() -> Self {
        Self {
            ins_len: 0,
            cow: false,
            extend: false,
            keep_locks: false,
            lowest_level: 0,
        }
    }
}

/// Binary search one block. Returns the exact slot, or the insertion
/// slot when the key is absent.
pub(crate) fn bin_search(block: &TreeBlock, key: &Key) -> Result<(bool, usize)> {
    let nritems = block.nritems();
    let leaf = block.is_leaf();
    let mut low = 0_usize;
    let mut high = nritems;
    while low < high {
        let mid = low + (high - low) / 2;
        let probe = if leaf {
            block.item_key(mid)
        } else {
            block.node_key(mid)
        }
        .map_err(|err| corrupt(block.bytenr(), err))?;
        match probe.cmp(key) {
            std::cmp::Ordering::Less => low = mid + 1,
            std::cmp::Ordering::Greater => high = mid,
            std::cmp::Ordering::Equal => return Ok((true, mid)),
        }
    }
    Ok((false, low))
}

/// Release ancestors the pending operation can no longer touch.
///
/// A chain of slot-0 ancestors stays locked: deleting or inserting the
/// leftmost key rewrites the low key up exactly that chain. With
/// `keep_locks`, last-slot levels are kept as well.
pub(crate) fn unlock_up(path: &mut Path, level: usize, lowest_unlock: usize) {
    let mut skip_level = level;
    let mut no_skips = false;
    for i in level..MAX_LEVEL {
        let Some(slot) = path.level(i) else { break };
        if !slot.is_locked() {
            break;
        }
        let slot_index = slot.slot();
        if !no_skips {
            if slot_index == 0 {
                skip_level = i + 1;
            } else if path.keep_locks {
                let last = slot
                    .contents()
                    .map(|block| {
                        let nritems = block.nritems();
                        nritems < 1 || slot_index >= nritems - 1
                    })
                    .unwrap_or(false);
                if last {
                    skip_level = i + 1;
                }
            }
        }
        if skip_level < i && i >= lowest_unlock {
            no_skips = true;
        }
        if i >= lowest_unlock && i > skip_level {
            path.unlock_level(i);
        }
    }
}

/// Lowest ancestor a low-key rewrite from the leaf would stop at: the
/// first level above the leaf whose slot is non-zero, or the root.
fn fixup_reach(path: &Path) -> usize {
    let top = path.top_level().unwrap_or(0);
    for i in 1..=top {
        let nonzero = path.level(i).map(|slot| slot.slot() != 0).unwrap_or(false);
        if nonzero {
            return i;
        }
    }
    top
}

#[allow(clippy::too_many_lines)]
pub(crate) fn search_core(
    ctree: &Ctree,
    trans: Option<&Transaction>,
    tree: &TreeRoot,
    key: &Key,
    cfg: &SearchConfig,
    path: &mut Path,
) -> Result<SearchOutcome> {
    if cfg.cow && trans.is_none() {
        return Err(MossError::InvalidArgument(
            "copy-on-write search requires a transaction".into(),
        ));
    }
    let mutation = cfg.cow || cfg.ins_len != 0;
    let lowest_unlock = if mutation { 2 } else { 1 };
    // Levels strictly below this bound are write-locked during the
    // descent. Mutations start with the target level and its parent.
    let mut write_below = if cfg.cow { cfg.lowest_level + 2 } else { 0 };
    let mut restarts = 0_usize;

    'restart: loop {
        restarts += 1;
        if restarts > MAX_LEVEL + 2 {
            return Err(MossError::Corruption {
                block: 0,
                detail: "lock escalation did not converge".into(),
            });
        }
        path.release_all();
        path.lowest_level = cfg.lowest_level;
        path.keep_locks = cfg.keep_locks;

        // Lock the root. The pointer may move between loading it and
        // acquiring the lock; reload and retry until it holds still.
        let mut level = loop {
            let ptr = tree.root_pointer();
            let root_level = usize::from(ptr.level());
            let want_write = cfg.cow && root_level < write_below;
            let held = if want_write {
                Held::Write(ptr.buffer().write())
            } else {
                Held::Read(ptr.buffer().read())
            };
            if !tree.root_is_current(&ptr) {
                continue;
            }
            let stamped = match &held {
                Held::Read(guard) => (usize::from(guard.level()), guard.bytenr()),
                Held::Write(guard) => (usize::from(guard.level()), guard.bytenr()),
                Held::Unlocked => unreachable!("root lock just taken"),
            };
            if stamped.0 != root_level || stamped.1 != ptr.buffer().bytenr() {
                return Err(corrupt(
                    ptr.buffer().bytenr(),
                    "root block header disagrees with the root pointer",
                ));
            }
            path.set_level(
                root_level,
                PathSlot {
                    buffer: ptr.buffer().clone(),
                    slot: 0,
                    held,
                },
            );
            break root_level;
        };
        if cfg.lowest_level > level {
            path.release_all();
            return Err(MossError::InvalidArgument(
                "search level above the tree root".into(),
            ));
        }
        // Levels already balanced this pass; a second visit would redo
        // the same work without progress.
        let mut balanced: u32 = 0;

        loop {
            if cfg.cow {
                let trans = trans.ok_or_else(|| MossError::InvalidArgument(
                    "copy-on-write search requires a transaction".into(),
                ))?;
                let needs_cow = cow::should_cow_block(trans, tree, path.block(level)?);
                if needs_cow {
                    let has_parent = path.level(level + 1).is_some();
                    let needed = if has_parent { level + 2 } else { level + 1 };
                    if write_below < needed {
                        write_below = needed;
                        trace!(
                            target: "moss::ctree",
                            level,
                            write_below,
                            "search_restart_for_cow"
                        );
                        continue 'restart;
                    }
                    cow::cow_block_at(ctree, trans, tree, path, level)?;
                }
            }

            let (exact, mut slot) = bin_search(path.block(level)?, key)?;

            if level > 0 {
                if !exact && slot > 0 {
                    // Rightmost separator not exceeding the key.
                    slot -= 1;
                }
                path.set_slot_index(level, slot)?;

                if level == cfg.lowest_level {
                    unlock_up(path, level, lowest_unlock);
                    return Ok(if exact {
                        SearchOutcome::Found
                    } else {
                        SearchOutcome::Missing
                    });
                }

                let (nritems, capacity) = {
                    let block = path.block(level)?;
                    (block.nritems(), block.node_capacity())
                };
                if cfg.ins_len > 0 && nritems + NODE_SPLIT_HEADROOM >= capacity {
                    let has_parent = path.level(level + 1).is_some();
                    let needed = if has_parent { level + 2 } else { level + 1 };
                    if write_below < needed {
                        write_below = needed;
                        trace!(
                            target: "moss::ctree",
                            level,
                            write_below,
                            "search_restart_for_split"
                        );
                        continue 'restart;
                    }
                    let trans = trans.ok_or_else(|| MossError::InvalidArgument(
                        "structural change requires a transaction".into(),
                    ))?;
                    balance::split_node(ctree, trans, tree, path, level)?;
                    // Re-search this level; the path may now point at
                    // the new sibling.
                    continue;
                }
                if cfg.ins_len < 0 && balanced & (1 << level) == 0 {
                    let has_parent = path.level(level + 1).is_some();
                    let sparse = nritems < capacity / 2;
                    let single_child_root = !has_parent && nritems == 1;
                    if sparse || single_child_root {
                        let needed = if has_parent { level + 2 } else { level + 1 };
                        if write_below < needed {
                            write_below = needed;
                            trace!(
                                target: "moss::ctree",
                                level,
                                write_below,
                                "search_restart_for_balance"
                            );
                            continue 'restart;
                        }
                        let trans = trans.ok_or_else(|| MossError::InvalidArgument(
                            "structural change requires a transaction".into(),
                        ))?;
                        balanced |= 1 << level;
                        let new_level = balance::balance_level(ctree, trans, tree, path, level)?;
                        level = new_level;
                        continue;
                    }
                }

                // Forward hint for iteration, taken while the node is
                // still locked.
                let hint = {
                    let block = path.block(level)?;
                    if slot + 1 < block.nritems() {
                        Some(
                            block
                                .node_key(slot + 1)
                                .map_err(|err| corrupt(block.bytenr(), err))?,
                        )
                    } else {
                        None
                    }
                };
                if hint.is_some() {
                    path.next_key_hint = hint;
                }

                unlock_up(path, level, lowest_unlock);

                let child = {
                    let block = path.block(level)?;
                    read_child(ctree, block, slot)?
                };
                let child_level = level - 1;
                let held = if cfg.cow && child_level < write_below {
                    Held::Write(child.write())
                } else {
                    Held::Read(child.read())
                };
                {
                    let block = match &held {
                        Held::Read(guard) => &**guard,
                        Held::Write(guard) => &**guard,
                        Held::Unlocked => unreachable!("child lock just taken"),
                    };
                    if usize::from(block.level()) != child_level {
                        return Err(corrupt(
                            child.bytenr(),
                            "child level disagrees with its parent",
                        ));
                    }
                }
                path.set_level(
                    child_level,
                    PathSlot {
                        buffer: child,
                        slot: 0,
                        held,
                    },
                );
                level = child_level;
            } else {
                path.set_slot_index(0, slot)?;

                if cfg.cow && slot == 0 {
                    // A leftmost insert or delete rewrites the low key
                    // up the slot-0 chain; those ancestors must be
                    // write-locked before anything mutates.
                    let reach = fixup_reach(path);
                    if write_below < reach + 1 {
                        write_below = reach + 1;
                        trace!(
                            target: "moss::ctree",
                            reach,
                            write_below,
                            "search_restart_for_low_key"
                        );
                        continue 'restart;
                    }
                }

                // An exact hit on a plain insert is a duplicate; the
                // caller reports it, so no space gets reserved for it.
                if cfg.ins_len > 0 && (cfg.extend || !exact) {
                    let needed_space = usize::try_from(cfg.ins_len).map_err(|_| {
                        MossError::InvalidArgument("insert length out of range".into())
                    })?;
                    let free = {
                        let leaf = path.block(0)?;
                        leaf.leaf_free_space()
                            .map_err(|err| corrupt(leaf.bytenr(), err))?
                    };
                    if free < needed_space {
                        let trans = trans.ok_or_else(|| MossError::InvalidArgument(
                            "structural change requires a transaction".into(),
                        ))?;
                        balance::split_leaf(
                            ctree,
                            trans,
                            tree,
                            key,
                            path,
                            needed_space,
                            cfg.extend,
                        )?;
                    }
                }

                unlock_up(path, 0, lowest_unlock);
                return Ok(if exact {
                    SearchOutcome::Found
                } else {
                    SearchOutcome::Missing
                });
            }
        }
    }
}

/// Advance the path to the next leaf in key order.
///
/// The current path is fully released before re-descending, so no lock
/// is held while acquiring a non-ancestor block. Returns `false` at the
/// end of the tree.
pub(crate) fn next_leaf(ctree: &Ctree, tree: &TreeRoot, path: &mut Path) -> Result<bool> {
    loop {
        let Some(hint) = path.next_key_hint else {
            path.release_all();
            return Ok(false);
        };
        path.release_all();
        let cfg = SearchConfig::read();
        search_core(ctree, None, tree, &hint, &cfg, path)?;
        let (slot, nritems) = {
            let leaf = path.block(0)?;
            (path.slot_index(0)?, leaf.nritems())
        };
        if slot < nritems {
            return Ok(true);
        }
        // The hinted separator went stale under a concurrent delete;
        // follow the fresh hint.
    }
}

/// Visit items in key order starting at `start`, until the visitor
/// declines or the tree ends. Returns the number of items visited.
pub(crate) fn search_forward(
    ctree: &Ctree,
    tree: &TreeRoot,
    start: &Key,
    visitor: &mut dyn FnMut(Key, &[u8]) -> bool,
) -> Result<u64> {
    let mut path = Path::new();
    let cfg = SearchConfig::read();
    search_core(ctree, None, tree, start, &cfg, &mut path)?;
    let mut visited = 0_u64;
    loop {
        let mut stop = false;
        {
            let leaf = path.block(0)?;
            let nritems = leaf.nritems();
            let mut slot = path.slot_index(0)?;
            while slot < nritems {
                let key = leaf
                    .item_key(slot)
                    .map_err(|err| corrupt(leaf.bytenr(), err))?;
                let data = leaf
                    .item_data(slot)
                    .map_err(|err| corrupt(leaf.bytenr(), err))?;
                visited += 1;
                if !visitor(key, data) {
                    stop = true;
                    break;
                }
                slot += 1;
            }
        }
        if stop || !next_leaf(ctree, tree, &mut path)? {
            return Ok(visited);
        }
    }
}
