//! Invariant properties checked against `std::collections::BTreeMap` as the
//! reference model.

use cobtree::{store::MemoryStore, Tree, TreeOptions};
use quickcheck::{Arbitrary, Gen};
use quickcheck_macros::quickcheck;
use std::{collections::BTreeMap, ops::ControlFlow, sync::Arc};

#[derive(Debug, Clone)]
enum Op {
    Set(i8, i16, bool),
    Delete(i8),
    DeleteRange(i8, i8, bool),
}

impl Arbitrary for Op {
    fn arbitrary(g: &mut Gen) -> Self {
        match u8::arbitrary(g) % 4 {
            0 | 1 => Op::Set(i8::arbitrary(g), i16::arbitrary(g), bool::arbitrary(g)),
            2 => Op::Delete(i8::arbitrary(g)),
            _ => Op::DeleteRange(i8::arbitrary(g), i8::arbitrary(g), bool::arbitrary(g)),
        }
    }
}

fn apply(tree: &mut Tree<i8, i16>, model: &mut BTreeMap<i8, i16>, op: &Op) {
    match *op {
        Op::Set(k, v, overwrite) => {
            let added = tree.set(k, v, overwrite).unwrap();
            let existed = model.contains_key(&k);
            if overwrite || !existed {
                model.insert(k, v);
            }
            assert_eq!(added, !existed);
        }
        Op::Delete(k) => {
            let removed = tree.delete(&k).unwrap();
            assert_eq!(removed, model.remove(&k).is_some());
        }
        Op::DeleteRange(lo, hi, include_hi) => {
            let removed = tree.delete_range(Some(&lo), Some(&hi), include_hi).unwrap();
            let doomed: Vec<i8> = model
                .range(lo..)
                .map(|(k, _)| *k)
                .filter(|k| if include_hi { *k <= hi } else { *k < hi })
                .collect();
            for k in &doomed {
                model.remove(k);
            }
            assert_eq!(removed, doomed.len());
        }
    }
}

fn build(ops: &[Op]) -> (Tree<i8, i16>, BTreeMap<i8, i16>) {
    let mut tree = TreeOptions::new().fanout(4).build();
    let mut model = BTreeMap::new();
    for op in ops {
        apply(&mut tree, &mut model, op);
    }
    (tree, model)
}

fn model_pairs(model: &BTreeMap<i8, i16>) -> Vec<(i8, i16)> {
    model.iter().map(|(k, v)| (*k, *v)).collect()
}

#[quickcheck]
fn matches_reference_model(ops: Vec<Op>) {
    let (tree, model) = build(&ops);
    assert_eq!(tree.pairs().unwrap(), model_pairs(&model));
    assert_eq!(tree.size().unwrap(), model.len());
    tree.check_valid().unwrap();
}

#[quickcheck]
fn size_matches_enumeration(ops: Vec<Op>) {
    let (tree, _) = build(&ops);
    let counted = match tree
        .for_range::<(), _>(None, None, true, |_, _, _| ControlFlow::Continue(()))
        .unwrap()
    {
        ControlFlow::Continue(count) => count,
        ControlFlow::Break(()) => unreachable!(),
    };
    assert_eq!(tree.size().unwrap(), counted);
}

#[quickcheck]
fn clone_is_unaffected_by_later_edits(before: Vec<Op>, after: Vec<Op>) {
    let (mut tree, mut model) = build(&before);
    let snapshot = tree.clone();
    let frozen_model = model.clone();
    for op in &after {
        apply(&mut tree, &mut model, op);
    }
    assert_eq!(snapshot.pairs().unwrap(), model_pairs(&frozen_model));
    assert_eq!(tree.pairs().unwrap(), model_pairs(&model));
    snapshot.check_valid().unwrap();
    tree.check_valid().unwrap();
}

#[quickcheck]
fn equal_histories_commit_to_equal_roots(ops: Vec<Op>) {
    let store_a = Arc::new(MemoryStore::new());
    let store_b = Arc::new(MemoryStore::new());
    let (mut a, _) = build(&ops);
    let (mut b, _) = build(&ops);
    a.attach_store(store_a);
    b.attach_store(store_b);
    assert_eq!(a.commit().unwrap(), b.commit().unwrap());
}

#[quickcheck]
fn commit_load_round_trips(ops: Vec<Op>) {
    let store = Arc::new(MemoryStore::new());
    let (mut tree, model) = build(&ops);
    tree.attach_store(store.clone());
    let root_id = tree.commit().unwrap();

    let reopened: Tree<i8, i16> = Tree::open(TreeOptions::new().fanout(4), store, root_id);
    assert_eq!(reopened.pairs().unwrap(), model_pairs(&model));
    assert_eq!(reopened.size().unwrap(), model.len());
    reopened.check_valid().unwrap();
}

#[quickcheck]
fn repeated_commit_writes_nothing(ops: Vec<Op>) {
    let store = Arc::new(MemoryStore::new());
    let (mut tree, _) = build(&ops);
    tree.attach_store(store.clone());
    let first = tree.commit().unwrap();
    let blobs = store.len();
    let second = tree.commit().unwrap();
    assert_eq!(first, second);
    assert_eq!(store.len(), blobs);
}

#[quickcheck]
fn diff_partitions_the_key_union(ops_a: Vec<Op>, ops_b: Vec<Op>) {
    let (a, model_a) = build(&ops_a);
    let (b, model_b) = build(&ops_b);

    let mut only_a = Vec::new();
    let mut only_b = Vec::new();
    let mut differing = Vec::new();
    a.diff_against::<(), _, _, _>(
        &b,
        |k, v| {
            only_a.push((*k, *v));
            ControlFlow::Continue(())
        },
        |k, v| {
            only_b.push((*k, *v));
            ControlFlow::Continue(())
        },
        |k, va, vb| {
            differing.push((*k, *va, *vb));
            ControlFlow::Continue(())
        },
    )
    .unwrap();

    only_a.sort_unstable();
    only_b.sort_unstable();
    differing.sort_unstable();

    let mut expect_only_a = Vec::new();
    let mut expect_only_b = Vec::new();
    let mut expect_diff = Vec::new();
    for (k, va) in &model_a {
        match model_b.get(k) {
            None => expect_only_a.push((*k, *va)),
            Some(vb) if vb != va => expect_diff.push((*k, *va, *vb)),
            Some(_) => {}
        }
    }
    for (k, vb) in &model_b {
        if !model_a.contains_key(k) {
            expect_only_b.push((*k, *vb));
        }
    }

    assert_eq!(only_a, expect_only_a);
    assert_eq!(only_b, expect_only_b);
    assert_eq!(differing, expect_diff);
}

#[quickcheck]
fn diff_of_a_clone_is_empty(ops: Vec<Op>) {
    let (tree, _) = build(&ops);
    let clone = tree.clone();
    let emissions = std::cell::Cell::new(0usize);
    tree.diff_against::<(), _, _, _>(
        &clone,
        |_, _| {
            emissions.set(emissions.get() + 1);
            ControlFlow::Continue(())
        },
        |_, _| {
            emissions.set(emissions.get() + 1);
            ControlFlow::Continue(())
        },
        |_, _, _| {
            emissions.set(emissions.get() + 1);
            ControlFlow::Continue(())
        },
    )
    .unwrap();
    assert_eq!(emissions.get(), 0);
}
