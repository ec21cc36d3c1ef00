//! Leaf nodes: parallel key/value arrays at the bottom of the tree.

use super::{
    handle::NodeRef,
    node::{search, Node, SetResult},
    OpCtx,
};
use crate::{error::Result, KeyType, ValueType};
use std::sync::Arc;

/// Value storage of a leaf.
///
/// `Empty` is the all-absent sentinel: every slot logically holds
/// `V::default()` without any allocation. The first explicit value write
/// materializes a concrete vector. The distinction is a storage detail and
/// never observable through the public API.
#[derive(Debug, Clone)]
pub(crate) enum LeafValues<V> {
    Empty,
    Materialized(Vec<V>),
}

impl<V: Clone + Default> LeafValues<V> {
    pub fn materialized(&self) -> Option<&[V]> {
        match self {
            LeafValues::Empty => None,
            LeafValues::Materialized(values) => Some(values),
        }
    }

    fn reify(&mut self, len: usize) -> &mut Vec<V> {
        if let LeafValues::Empty = self {
            *self = LeafValues::Materialized(vec![V::default(); len]);
        }
        match self {
            LeafValues::Materialized(values) => values,
            LeafValues::Empty => unreachable!(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct LeafNode<K, V> {
    pub keys: Vec<K>,
    pub values: LeafValues<V>,
}

impl<K, V> LeafNode<K, V> {
    pub fn new() -> Self {
        LeafNode {
            keys: Vec::new(),
            values: LeafValues::Empty,
        }
    }

    /// Reconstructs a leaf from its stored form; `values` is `None` for a
    /// keys-only blob.
    pub fn from_stored(keys: Vec<K>, values: Option<Vec<V>>) -> Self {
        LeafNode {
            keys,
            values: match values {
                None => LeafValues::Empty,
                Some(values) => LeafValues::Materialized(values),
            },
        }
    }
}

impl<K: KeyType, V: ValueType> LeafNode<K, V> {
    /// The logical value at `i`.
    pub fn value_at(&self, i: usize) -> V {
        match &self.values {
            LeafValues::Empty => V::default(),
            LeafValues::Materialized(values) => values[i].clone(),
        }
    }

    pub fn pair_at(&self, i: usize) -> Option<(K, V)> {
        self.keys.get(i).map(|k| (k.clone(), self.value_at(i)))
    }

    pub fn set_value(&mut self, i: usize, value: V) {
        let len = self.keys.len();
        self.values.reify(len)[i] = value;
    }

    /// Inserts a pair; `None` stands for the absent value, which keeps a
    /// keys-only leaf in its unmaterialized form.
    pub fn insert_at(&mut self, i: usize, key: K, value: Option<V>) {
        let len = self.keys.len();
        match (&mut self.values, value) {
            (LeafValues::Empty, None) => {}
            (values, None) => values.reify(len).insert(i, V::default()),
            (values, Some(value)) => values.reify(len).insert(i, value),
        }
        self.keys.insert(i, key);
    }

    pub fn remove_at(&mut self, i: usize) {
        self.keys.remove(i);
        if let LeafValues::Materialized(values) = &mut self.values {
            values.remove(i);
        }
    }

    /// `value: None` is the absent value; it reads as the default and keeps
    /// keys-only leaves unmaterialized.
    pub fn set(
        &mut self,
        key: K,
        value: Option<V>,
        overwrite: bool,
        ctx: &OpCtx<'_, K>,
    ) -> Result<SetResult<K, V>> {
        match search(&self.keys, &key, ctx)? {
            Ok(i) => {
                if !overwrite {
                    return Ok(SetResult::Ignored);
                }
                // Replacing the stored key as well permits key edits that
                // preserve the sort order.
                self.keys[i] = key;
                if let Some(value) = value {
                    self.set_value(i, value);
                } else if self.values.materialized().is_some() {
                    self.set_value(i, V::default());
                }
                Ok(SetResult::Updated)
            }
            Err(i) => {
                if self.keys.len() < ctx.fanout {
                    self.insert_at(i, key, value);
                    return Ok(SetResult::Added);
                }
                let mut right = self.split_off_right();
                if i > self.keys.len() {
                    right.insert_at(i - self.keys.len(), key, value);
                } else {
                    self.insert_at(i, key, value);
                }
                debug!("split leaf, sizes {}/{}", self.keys.len(), right.keys.len());
                Ok(SetResult::Split {
                    right: Arc::new(NodeRef::from_node(Node::Leaf(right))),
                })
            }
        }
    }

    /// Splits off the upper half: a leaf of length L leaves `⌊L/2⌋` behind
    /// and hands `⌈L/2⌉` entries to the new right sibling.
    pub fn split_off_right(&mut self) -> LeafNode<K, V> {
        let half = self.keys.len() / 2;
        LeafNode {
            keys: self.keys.split_off(half),
            values: match &mut self.values {
                LeafValues::Empty => LeafValues::Empty,
                LeafValues::Materialized(values) => LeafValues::Materialized(values.split_off(half)),
            },
        }
    }

    /// Sibling rebalance: move the right sibling's first entry here.
    pub fn take_from_right(&mut self, rhs: &mut LeafNode<K, V>) {
        match &mut rhs.values {
            LeafValues::Empty => {
                if let LeafValues::Materialized(values) = &mut self.values {
                    values.push(V::default());
                }
            }
            LeafValues::Materialized(rhs_values) => {
                let len = self.keys.len();
                self.values.reify(len).push(rhs_values.remove(0));
            }
        }
        self.keys.push(rhs.keys.remove(0));
    }

    /// Sibling rebalance: move the left sibling's last entry here.
    pub fn take_from_left(&mut self, lhs: &mut LeafNode<K, V>) {
        match &mut lhs.values {
            LeafValues::Empty => {
                if let LeafValues::Materialized(values) = &mut self.values {
                    values.insert(0, V::default());
                }
            }
            LeafValues::Materialized(lhs_values) => {
                let len = self.keys.len();
                let moved = lhs_values.pop().expect("left sibling is never empty here");
                self.values.reify(len).insert(0, moved);
            }
        }
        self.keys
            .insert(0, lhs.keys.pop().expect("left sibling is never empty here"));
    }

    /// Appends all of the right sibling's entries.
    pub fn merge_sibling(&mut self, mut rhs: LeafNode<K, V>) {
        match (&mut self.values, rhs.values) {
            (LeafValues::Empty, LeafValues::Empty) => {}
            (LeafValues::Empty, LeafValues::Materialized(mut rhs_values)) => {
                let mut values = vec![V::default(); self.keys.len()];
                values.append(&mut rhs_values);
                self.values = LeafValues::Materialized(values);
            }
            (LeafValues::Materialized(values), LeafValues::Empty) => {
                values.extend(std::iter::repeat_with(V::default).take(rhs.keys.len()));
            }
            (LeafValues::Materialized(values), LeafValues::Materialized(mut rhs_values)) => {
                values.append(&mut rhs_values);
            }
        }
        self.keys.append(&mut rhs.keys);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{compare::OrdComparator, tree::imp::OpCtx};
    use quickcheck::{Arbitrary, Gen, TestResult};
    use quickcheck_macros::quickcheck;

    fn ctx(fanout: usize) -> OpCtx<'static, i32> {
        OpCtx {
            cmp: &OrdComparator,
            store: None,
            fanout,
        }
    }

    impl Arbitrary for LeafNode<i32, i32> {
        fn arbitrary(g: &mut Gen) -> Self {
            let len = usize::arbitrary(g) % 16;
            let mut keys: Vec<i32> = (0..len).map(|_| i32::arbitrary(g)).collect();
            keys.sort_unstable();
            keys.dedup();
            if bool::arbitrary(g) {
                LeafNode::from_stored(keys, None)
            } else {
                let values = keys.iter().map(|k| k.wrapping_mul(3)).collect();
                LeafNode::from_stored(keys.clone(), Some(values))
            }
        }
    }

    fn pairs(leaf: &LeafNode<i32, i32>) -> Vec<(i32, i32)> {
        (0..leaf.keys.len()).map(|i| leaf.pair_at(i).unwrap()).collect()
    }

    #[test]
    fn empty_values_read_default() {
        let leaf: LeafNode<i32, i32> = LeafNode::from_stored(vec![1, 2, 3], None);
        assert_eq!(leaf.value_at(1), 0);
        assert_eq!(leaf.pair_at(2), Some((3, 0)));
    }

    #[test]
    fn absent_inserts_keep_the_sentinel() {
        let c = ctx(8);
        let mut leaf: LeafNode<i32, i32> = LeafNode::new();
        leaf.set(2, None, true, &c).unwrap();
        leaf.set(1, None, true, &c).unwrap();
        assert!(leaf.values.materialized().is_none());
        assert_eq!(leaf.pair_at(0), Some((1, 0)));
        // One concrete write materializes every slot.
        leaf.set(3, Some(7), true, &c).unwrap();
        assert_eq!(leaf.values.materialized().unwrap(), &[0, 0, 7]);
    }

    #[test]
    fn first_write_materializes() {
        let mut leaf: LeafNode<i32, i32> = LeafNode::from_stored(vec![1, 2, 3], None);
        leaf.set_value(1, 7);
        assert_eq!(leaf.values.materialized().unwrap(), &[0, 7, 0]);
    }

    #[quickcheck]
    fn split_preserves_order_and_balance(mut leaf: LeafNode<i32, i32>) -> TestResult {
        if leaf.keys.len() < 2 {
            return TestResult::discard();
        }
        let before = pairs(&leaf);
        let right = leaf.split_off_right();
        assert_eq!(leaf.keys.len(), before.len() / 2);
        assert_eq!(right.keys.len(), before.len() - before.len() / 2);
        let mut after = pairs(&leaf);
        after.extend(pairs(&right));
        assert_eq!(after, before);
        TestResult::passed()
    }

    #[quickcheck]
    fn split_then_merge_round_trips(mut leaf: LeafNode<i32, i32>) -> TestResult {
        if leaf.keys.len() < 2 {
            return TestResult::discard();
        }
        let before = pairs(&leaf);
        let right = leaf.split_off_right();
        leaf.merge_sibling(right);
        assert_eq!(pairs(&leaf), before);
        TestResult::passed()
    }

    #[test]
    fn take_from_right_moves_lowest() {
        let mut left: LeafNode<i32, i32> = LeafNode::from_stored(vec![1], Some(vec![10]));
        let mut right: LeafNode<i32, i32> = LeafNode::from_stored(vec![2, 3], Some(vec![20, 30]));
        left.take_from_right(&mut right);
        assert_eq!(pairs(&left), vec![(1, 10), (2, 20)]);
        assert_eq!(pairs(&right), vec![(3, 30)]);
    }

    #[test]
    fn take_from_left_moves_highest() {
        let mut right: LeafNode<i32, i32> = LeafNode::from_stored(vec![5], None);
        let mut left: LeafNode<i32, i32> = LeafNode::from_stored(vec![1, 2], None);
        right.take_from_left(&mut left);
        assert_eq!(right.keys, vec![2, 5]);
        assert_eq!(left.keys, vec![1]);
    }

    #[test]
    fn set_updates_in_place_and_respects_overwrite() {
        let c = ctx(4);
        let mut leaf: LeafNode<i32, i32> = LeafNode::from_stored(vec![1, 3], Some(vec![10, 30]));
        assert!(matches!(
            leaf.set(3, Some(31), true, &c).unwrap(),
            SetResult::Updated
        ));
        assert!(matches!(
            leaf.set(3, Some(99), false, &c).unwrap(),
            SetResult::Ignored
        ));
        assert!(matches!(
            leaf.set(2, Some(20), true, &c).unwrap(),
            SetResult::Added
        ));
        assert_eq!(pairs(&leaf), vec![(1, 10), (2, 20), (3, 31)]);
    }

    #[test]
    fn full_leaf_splits_on_insert() {
        let c = ctx(4);
        let mut leaf: LeafNode<i32, i32> =
            LeafNode::from_stored(vec![1, 2, 3, 4], Some(vec![1, 2, 3, 4]));
        match leaf.set(5, Some(5), true, &c).unwrap() {
            SetResult::Split { right } => {
                let right = right.read(&c).unwrap();
                assert_eq!(leaf.keys, vec![1, 2]);
                assert_eq!(right.max_key(), Some(&5));
            }
            _ => panic!("expected a split"),
        }
    }
}
