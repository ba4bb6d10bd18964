//! End-to-end properties of the tree engine over the in-memory store.
//!
//! Small blocks (512 bytes) keep fan-out low so a few thousand items
//! exercise multi-level descent, splits, merges, and height changes.

use std::collections::BTreeMap;
use std::sync::Arc;

use moss_block::{BlockStore, FatalEscalation, MemBlockStore, Transaction};
use moss_ctree::{Ctree, Path, SearchOutcome, TreeFlags, TreeRoot};
use moss_error::MossError;
use moss_types::{BlockSize, Key, TransId, TreeId};
use proptest::prelude::*;
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn engine() -> (Ctree, Arc<MemBlockStore>) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    Ctree::in_memory(BlockSize::new(512).expect("valid block size"))
}

fn key(n: u64) -> Key {
    Key::new(n, 8, 0)
}

fn payload(n: u64) -> Vec<u8> {
    n.to_le_bytes().repeat(2)
}

fn tree_with(engine: &Ctree, trans: &Transaction, flags: TreeFlags) -> TreeRoot {
    engine
        .create_tree_with(trans, TreeId(5), flags)
        .expect("create tree")
}

#[test]
fn shuffled_inserts_build_an_ordered_multilevel_tree() {
    let (engine, _store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());

    let mut keys: Vec<u64> = (0..2000).collect();
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(42);
    keys.shuffle(&mut rng);
    for &n in &keys {
        engine
            .insert_item(&trans, &tree, key(n), &payload(n))
            .expect("insert");
    }

    assert!(tree.level() >= 2, "2000 items should stack several levels");
    for &n in &keys {
        let data = engine.lookup(&tree, &key(n)).expect("lookup");
        assert_eq!(data.as_deref(), Some(payload(n).as_slice()));
    }

    let stats = engine.check_tree(&tree).expect("verify");
    assert_eq!(stats.items, 2000);
    assert_eq!(u64::from(stats.height), u64::from(tree.level()) + 1);

    // Forward iteration sees every key exactly once, in order.
    let mut seen = Vec::new();
    let visited = engine
        .search_forward(&tree, &Key::MIN, &mut |k, data| {
            assert_eq!(data, payload(k.objectid).as_slice());
            seen.push(k);
            true
        })
        .expect("iterate");
    assert_eq!(visited, 2000);
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
}

#[test]
fn sequential_offsets_split_and_survive() {
    let (engine, store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());

    for offset in 0..2000 {
        engine
            .insert_item(&trans, &tree, Key::new(1, 0, offset), &payload(offset))
            .expect("insert");
    }
    assert!(store.allocations() > 2, "appends must have split leaves");
    assert!(tree.level() >= 2);
    let data = engine
        .lookup(&tree, &Key::new(1, 0, 1000))
        .expect("lookup")
        .expect("present");
    assert_eq!(data, payload(1000));
    engine.check_tree(&tree).expect("verify");
}

#[test]
fn same_transaction_mutations_stay_in_place() {
    let (engine, store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());
    assert_eq!(store.allocations(), 1);

    for n in 0..4 {
        engine
            .insert_item(&trans, &tree, key(n), &payload(n))
            .expect("insert");
    }
    // Root leaf allocated this transaction, never written out: every
    // insert edits it directly.
    assert_eq!(store.allocations(), 1);
}

#[test]
fn written_blocks_are_copied_in_the_next_transaction() {
    let (engine, store) = engine();
    let trans1 = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans1, TreeFlags::default());
    for n in 0..4 {
        engine
            .insert_item(&trans1, &tree, key(n), &payload(n))
            .expect("insert");
    }
    store.write_out().expect("write out");

    let before = store.allocations();
    let trans2 = Transaction::new(TransId(2));
    engine
        .insert_item(&trans2, &tree, key(100), &payload(100))
        .expect("insert after flush");

    // One level, so exactly one copy; the superseded root is queued for
    // release at commit.
    assert_eq!(store.allocations(), before + 1);
    assert_eq!(store.pending_free_count(), 1);
    for n in [0, 1, 2, 3, 100] {
        assert!(engine.lookup(&tree, &key(n)).expect("lookup").is_some());
    }
    engine.check_tree(&tree).expect("verify");
}

#[test]
fn snapshot_trees_keep_committed_blocks_alive() {
    let (engine, store) = engine();
    let trans1 = Transaction::new(TransId(1));
    let tree = tree_with(
        &engine,
        &trans1,
        TreeFlags {
            ref_cows: true,
            force_cow: false,
        },
    );
    for n in 0..4 {
        engine
            .insert_item(&trans1, &tree, key(n), &payload(n))
            .expect("insert");
    }
    store.write_out().expect("write out");

    let trans2 = Transaction::new(TransId(2));
    engine
        .insert_item(&trans2, &tree, key(100), &payload(100))
        .expect("insert after flush");
    // The committed generation still owns the old root.
    assert_eq!(store.pending_free_count(), 0);
}

#[test]
fn deleting_everything_collapses_the_tree() {
    let (engine, store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());

    for n in 0..1500 {
        engine
            .insert_item(&trans, &tree, key(n), &payload(n))
            .expect("insert");
    }
    assert!(tree.level() >= 2);

    let mut keys: Vec<u64> = (0..1500).collect();
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(7);
    keys.shuffle(&mut rng);
    for &n in &keys {
        engine.delete_item(&trans, &tree, &key(n)).expect("delete");
    }

    assert_eq!(tree.level(), 0, "empty tree is a single leaf");
    let stats = engine.check_tree(&tree).expect("verify");
    assert_eq!(stats.items, 0);
    assert_eq!(stats.blocks, 1);
    // Merges and collapses release their blocks.
    assert!(store.pending_free_count() > 0);
}

#[test]
fn sparse_leaf_merges_into_its_left_sibling_and_is_freed_once() {
    let (engine, store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());
    for n in 0..16 {
        engine
            .insert_item(&trans, &tree, key(n), &payload(n))
            .expect("insert");
    }
    assert_eq!(tree.level(), 1);

    // Record which keys landed in which leaf.
    let mut leaves: Vec<Vec<u64>> = Vec::new();
    let (mut path, _) = engine.search(&tree, &Key::MIN).expect("search");
    loop {
        let leaf = path.leaf().expect("locked leaf");
        let mut keys = Vec::new();
        for i in 0..leaf.nritems() {
            keys.push(leaf.item_key(i).expect("key").objectid);
        }
        leaves.push(keys);
        if !engine.next_leaf(&tree, &mut path).expect("next leaf") {
            break;
        }
    }
    drop(path);
    assert_eq!(leaves.len(), 2);
    let (left, right) = (leaves[0].clone(), leaves[1].clone());

    // Thin the left leaf so it has room for its neighbor's survivors.
    for &n in &left[2..] {
        engine.delete_item(&trans, &tree, &key(n)).expect("delete");
    }
    let before = store.pending_free_count();

    // Shrinking the right leaf below the merge threshold folds it into
    // the left sibling; exactly that one block gets released.
    for &n in right[2..].iter().rev() {
        engine.delete_item(&trans, &tree, &key(n)).expect("delete");
    }
    assert_eq!(store.pending_free_count(), before + 1);

    let stats = engine.check_tree(&tree).expect("verify");
    assert_eq!(stats.items, 4);
    assert_eq!(stats.blocks, 2, "one node and the merged leaf remain");
    for n in [left[0], left[1], right[0], right[1]] {
        assert!(engine.lookup(&tree, &key(n)).expect("lookup").is_some());
    }
}

#[test]
fn duplicate_and_missing_keys_are_reported() {
    let (engine, _store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());

    engine
        .insert_item(&trans, &tree, key(1), b"one")
        .expect("insert");
    assert!(matches!(
        engine.insert_item(&trans, &tree, key(1), b"again"),
        Err(MossError::Exists)
    ));
    assert!(matches!(
        engine.delete_item(&trans, &tree, &key(9)),
        Err(MossError::NotFound(_))
    ));
    assert!(engine.lookup(&tree, &key(9)).expect("lookup").is_none());
}

#[test]
fn duplicate_insert_is_exists_even_when_the_payload_would_not_fit() {
    let (engine, store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());

    engine
        .insert_item(&trans, &tree, key(1), &[0x5a; 200])
        .expect("insert");
    let before = store.allocations();

    // The duplicate's payload would overflow the leaf next to the
    // existing item; that must surface as a duplicate, not a capacity
    // error, and must not split anything on the way.
    assert!(matches!(
        engine.insert_item(&trans, &tree, key(1), &[0x5a; 224]),
        Err(MossError::Exists)
    ));
    assert_eq!(store.allocations(), before);

    let data = engine.lookup(&tree, &key(1)).expect("lookup").expect("present");
    assert_eq!(data.len(), 200);
    let stats = engine.check_tree(&tree).expect("verify");
    assert_eq!(stats.blocks, 1);
}

#[test]
fn batched_deletes_through_a_positioned_path() {
    let (engine, _store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());
    for n in 0..6 {
        engine
            .insert_item(&trans, &tree, key(n), &payload(n))
            .expect("insert");
    }

    let (mut path, outcome) = engine
        .search_for_delete(&trans, &tree, &key(1))
        .expect("position");
    assert_eq!(outcome, SearchOutcome::Found);
    let slot = path.leaf_slot().expect("leaf slot");
    engine
        .delete_items(&trans, &tree, &mut path, slot, 3)
        .expect("batched delete");
    drop(path);

    for n in 0..6 {
        let present = engine.lookup(&tree, &key(n)).expect("lookup").is_some();
        assert_eq!(present, !(1..=3).contains(&n), "key {n}");
    }
    engine.check_tree(&tree).expect("verify");
}

#[test]
fn extend_truncate_and_split_reshape_items() {
    let (engine, _store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());

    engine
        .insert_item(&trans, &tree, key(1), b"abcdef")
        .expect("insert");

    engine
        .extend_item(&trans, &tree, &key(1), 4)
        .expect("extend");
    let data = engine.lookup(&tree, &key(1)).expect("lookup").expect("present");
    assert_eq!(&data, b"abcdef\0\0\0\0");

    engine
        .truncate_item(&trans, &tree, &key(1), 6, true)
        .expect("truncate tail");
    let data = engine.lookup(&tree, &key(1)).expect("lookup").expect("present");
    assert_eq!(&data, b"abcdef");

    engine
        .split_item(&trans, &tree, &key(1), Key::new(1, 8, 2), 2)
        .expect("split");
    let head = engine.lookup(&tree, &key(1)).expect("lookup").expect("head");
    let tail = engine
        .lookup(&tree, &Key::new(1, 8, 2))
        .expect("lookup")
        .expect("tail");
    assert_eq!(&head, b"ab");
    assert_eq!(&tail, b"cdef");

    engine
        .truncate_item(&trans, &tree, &Key::new(1, 8, 2), 2, false)
        .expect("truncate head");
    let tail = engine
        .lookup(&tree, &Key::new(1, 8, 2))
        .expect("lookup")
        .expect("tail");
    assert_eq!(&tail, b"ef");

    // A split key that sorts past the next item is refused.
    engine
        .insert_item(&trans, &tree, Key::new(1, 8, 10), b"wxyz")
        .expect("insert");
    assert!(matches!(
        engine.split_item(&trans, &tree, &key(1), Key::new(1, 8, 11), 1),
        Err(MossError::InvalidArgument(_))
    ));
    engine.check_tree(&tree).expect("verify");
}

#[test]
fn extending_past_leaf_space_splits_the_leaf() {
    let (engine, _store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());

    engine
        .insert_item(&trans, &tree, key(1), &[0xaa; 200])
        .expect("insert large");
    engine
        .insert_item(&trans, &tree, key(2), &[0xbb; 120])
        .expect("insert second");

    engine
        .extend_item(&trans, &tree, &key(1), 100)
        .expect("extend forces split");
    let data = engine.lookup(&tree, &key(1)).expect("lookup").expect("present");
    assert_eq!(data.len(), 300);
    assert!(data[..200].iter().all(|&b| b == 0xaa));
    assert!(data[200..].iter().all(|&b| b == 0));
    let stats = engine.check_tree(&tree).expect("verify");
    assert_eq!(stats.items, 2);
    assert!(stats.blocks >= 2, "extension no longer fits one leaf");
}

#[test]
fn key_rewrites_keep_order_and_reject_collisions() {
    let (engine, _store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());
    for n in [10, 20, 30] {
        engine
            .insert_item(&trans, &tree, key(n), &payload(n))
            .expect("insert");
    }

    engine
        .set_item_key_safe(&trans, &tree, &key(20), key(25))
        .expect("rewrite");
    assert!(engine.lookup(&tree, &key(20)).expect("lookup").is_none());
    assert_eq!(
        engine.lookup(&tree, &key(25)).expect("lookup").as_deref(),
        Some(payload(20).as_slice())
    );

    // Rewriting the leftmost key propagates to the separators above.
    engine
        .set_item_key_safe(&trans, &tree, &key(10), key(5))
        .expect("rewrite leftmost");
    engine.check_tree(&tree).expect("verify");

    assert!(matches!(
        engine.set_item_key_safe(&trans, &tree, &key(5), key(30)),
        Err(MossError::InvalidArgument(_))
    ));
}

#[test]
fn leaf_iteration_via_next_leaf_covers_every_item() {
    let (engine, _store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());
    for n in 0..300 {
        engine
            .insert_item(&trans, &tree, key(n), &payload(n))
            .expect("insert");
    }

    let (mut path, _) = engine.search(&tree, &Key::MIN).expect("search");
    let mut count = 0u64;
    loop {
        {
            let leaf = path.leaf().expect("locked leaf");
            count += leaf.nritems() as u64;
        }
        if !engine.next_leaf(&tree, &mut path).expect("next leaf") {
            break;
        }
    }
    assert_eq!(count, 300);
}

#[test]
fn corruption_latches_the_store_read_only() {
    let (engine, store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());
    for n in 0..200 {
        engine
            .insert_item(&trans, &tree, key(n), &payload(n))
            .expect("insert");
    }
    assert!(tree.level() >= 1);

    // Find a leaf and destroy it behind the engine's back.
    let leaf_bytenr = {
        let (path, _) = engine.search(&tree, &key(0)).expect("search");
        let buf = path.level(0).expect("leaf level").buffer().clone();
        buf.bytenr()
    };
    store
        .free_block(&trans, leaf_bytenr, true)
        .expect("free leaf");
    store.commit().expect("commit");

    assert!(matches!(
        engine.lookup(&tree, &key(0)),
        Err(MossError::Corruption { .. })
    ));
    assert!(engine.health().is_read_only());
    assert!(engine.health().errno().is_some());
    assert!(matches!(
        engine.insert_item(&trans, &tree, key(999), b"x"),
        Err(MossError::ReadOnly)
    ));
}

#[test]
fn readers_run_concurrently_with_a_writer() {
    let (engine, _store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());
    for n in 0..500 {
        engine
            .insert_item(&trans, &tree, key(n), &payload(n))
            .expect("insert");
    }

    std::thread::scope(|scope| {
        let engine_ref = &engine;
        let tree_ref = &tree;
        let reader = scope.spawn(move || {
            for round in 0..20 {
                for n in (0..500).step_by(17) {
                    let data = engine_ref.lookup(tree_ref, &key(n)).expect("lookup");
                    assert_eq!(data.as_deref(), Some(payload(n).as_slice()));
                }
                if round % 5 == 0 {
                    let stats = engine_ref.check_tree(tree_ref).expect("verify");
                    assert!(stats.items >= 500);
                }
            }
        });

        for n in 500..900 {
            engine
                .insert_item(&trans, &tree, key(n), &payload(n))
                .expect("concurrent insert");
        }
        reader.join().expect("reader thread");
    });

    let stats = engine.check_tree(&tree).expect("verify");
    assert_eq!(stats.items, 900);
}

fn run_model_ops(ops: &[(u8, u64)]) {
    let (engine, store) = engine();
    let mut transid = 1;
    let mut trans = Transaction::new(TransId(transid));
    let tree = tree_with(&engine, &trans, TreeFlags::default());
    let mut model: BTreeMap<u64, Vec<u8>> = BTreeMap::new();

    for &(op, n) in ops {
        match op {
            0 => {
                let result = engine.insert_item(&trans, &tree, key(n), &payload(n));
                if model.contains_key(&n) {
                    assert!(matches!(result, Err(MossError::Exists)));
                } else {
                    result.expect("insert");
                    model.insert(n, payload(n));
                }
            }
            1 => {
                let result = engine.delete_item(&trans, &tree, &key(n));
                if model.remove(&n).is_some() {
                    result.expect("delete");
                } else {
                    assert!(matches!(result, Err(MossError::NotFound(_))));
                }
            }
            2 => {
                let found = engine.lookup(&tree, &key(n)).expect("lookup");
                assert_eq!(found.as_deref(), model.get(&n).map(Vec::as_slice));
            }
            _ => {
                // Transaction boundary: flush, then keep mutating so the
                // next op copies before writing.
                store.write_out().expect("write out");
                transid += 1;
                trans = Transaction::new(TransId(transid));
            }
        }
    }

    let stats = engine.check_tree(&tree).expect("verify");
    assert_eq!(stats.items, model.len() as u64);
    let mut walked = Vec::new();
    engine
        .search_forward(&tree, &Key::MIN, &mut |k, data| {
            walked.push((k.objectid, data.to_vec()));
            true
        })
        .expect("iterate");
    let expected: Vec<(u64, Vec<u8>)> = model.iter().map(|(k, v)| (*k, v.clone())).collect();
    assert_eq!(walked, expected);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn random_operations_match_an_ordered_map(
        ops in proptest::collection::vec((0u8..4, 0u64..48), 1..160)
    ) {
        run_model_ops(&ops);
    }
}

#[test]
fn regression_interleaved_boundaries_and_deletes() {
    // Flush between every mutation so each one exercises the COW path.
    let mut ops = Vec::new();
    for n in 0..40 {
        ops.push((0, n));
        ops.push((3, 0));
    }
    for n in (0..40).rev() {
        ops.push((1, n));
        ops.push((3, 0));
    }
    run_model_ops(&ops);
}

#[test]
fn empty_items_reserve_zeroed_space() {
    let (engine, _store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());

    engine
        .insert_empty_item(&trans, &tree, key(3), 12)
        .expect("insert empty");
    let data = engine.lookup(&tree, &key(3)).expect("lookup").expect("present");
    assert_eq!(data, vec![0u8; 12]);
    assert!(matches!(
        engine.insert_empty_item(&trans, &tree, key(3), 4),
        Err(MossError::Exists)
    ));
}

#[test]
fn oversized_items_are_refused() {
    let (engine, _store) = engine();
    let trans = Transaction::new(TransId(1));
    let tree = tree_with(&engine, &trans, TreeFlags::default());

    // 512-byte blocks cannot host this payload even alone in a leaf.
    assert!(matches!(
        engine.insert_item(&trans, &tree, key(1), &[0u8; 500]),
        Err(MossError::InvalidArgument(_))
    ));

    let path = Path::new();
    assert!(path.leaf().is_none());
    assert!(path.leaf_slot().is_none());
}
