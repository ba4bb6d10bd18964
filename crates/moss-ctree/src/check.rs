//! Full-tree verification.
//!
//! Walks the tree under read locks, held parent-to-child, and checks
//! every structural invariant the mutation paths maintain: per-block
//! layout, key order, level stamps, and separator keys matching the
//! first key of the child they point at.

use crate::{corrupt, read_child, Ctree, TreeRoot};
use moss_error::{MossError, Result};
use moss_ondisk::{check_leaf, check_node, TreeBlock};
use moss_types::Key;

/// Counters from a [`check_tree`](crate::Ctree::check_tree) walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    pub height: u8,
    pub blocks: u64,
    pub items: u64,
}

pub(crate) fn check_tree(ctree: &Ctree, tree: &TreeRoot) -> Result<TreeStats> {
    let (root, guard) = crate::lock_root_read(tree)?;
    let mut stats = TreeStats {
        height: root.level().saturating_add(1),
        blocks: 0,
        items: 0,
    };
    check_block(ctree, &guard, None, true, &mut stats)?;
    Ok(stats)
}

fn check_block(
    ctree: &Ctree,
    block: &TreeBlock,
    expected_first: Option<Key>,
    is_root: bool,
    stats: &mut TreeStats,
) -> Result<()> {
    stats.blocks += 1;
    let bytenr = block.bytenr();

    if block.is_leaf() {
        check_leaf(block).map_err(|err| corrupt(bytenr, err))?;
        if block.nritems() == 0 && !is_root {
            return Err(MossError::Corruption {
                block: bytenr.0,
                detail: "empty leaf below the root".into(),
            });
        }
        stats.items += block.nritems() as u64;
        if let Some(expected) = expected_first {
            let first = block.item_key(0).map_err(|err| corrupt(bytenr, err))?;
            if first != expected {
                return Err(MossError::Corruption {
                    block: bytenr.0,
                    detail: format!(
                        "leaf first key {first} does not match its separator {expected}"
                    ),
                });
            }
        }
        return Ok(());
    }

    check_node(block).map_err(|err| corrupt(bytenr, err))?;
    if block.nritems() == 0 {
        return Err(MossError::Corruption {
            block: bytenr.0,
            detail: "internal node with no key pointers".into(),
        });
    }
    if let Some(expected) = expected_first {
        let first = block.node_key(0).map_err(|err| corrupt(bytenr, err))?;
        if first != expected {
            return Err(MossError::Corruption {
                block: bytenr.0,
                detail: format!(
                    "node first key {first} does not match its separator {expected}"
                ),
            });
        }
    }

    for slot in 0..block.nritems() {
        let separator = block.node_key(slot).map_err(|err| corrupt(bytenr, err))?;
        let child_buf = read_child(ctree, block, slot)?;
        let child = child_buf.read();
        if usize::from(child.level()) + 1 != usize::from(block.level()) {
            return Err(MossError::Corruption {
                block: child.bytenr().0,
                detail: format!(
                    "child stamped level {} under a level {} node",
                    child.level(),
                    block.level()
                ),
            });
        }
        check_block(ctree, &child, Some(separator), false, stats)?;
    }
    Ok(())
}
