//! The node variant and the operations shared by both kinds.
//!
//! Leaf and internal nodes are a closed pair, so they live in one enum and
//! dispatch by `match`; the per-variant logic is in `leaf.rs`/`internal.rs`.

use super::{
    handle::NodeRef,
    internal::InternalNode,
    leaf::LeafNode,
    OpCtx,
};
use crate::{
    error::{Result, TreeError},
    KeyType, ValueType,
};
use std::{cmp::Ordering, sync::Arc};

#[derive(Debug, Clone)]
pub(crate) enum Node<K, V> {
    Leaf(LeafNode<K, V>),
    Internal(InternalNode<K, V>),
}

/// Outcome of a recursive `set`.
pub(crate) enum SetResult<K, V> {
    /// A new pair was added.
    Added,
    /// The key existed; value (and stored key) were replaced.
    Updated,
    /// The key existed and `overwrite` was false.
    Ignored,
    /// A new pair was added and this node split; the caller inserts the new
    /// right sibling next to it.
    Split { right: Arc<NodeRef<K, V>> },
}

impl<K, V> SetResult<K, V> {
    pub fn added(&self) -> bool {
        matches!(self, SetResult::Added | SetResult::Split { .. })
    }
}

/// Binary search over an ordered key slice.
///
/// `Ok(i)` is a hit, `Err(i)` the insertion index; the comparator decides the
/// order and an unorderable pair aborts the whole operation.
pub(crate) fn search<K>(keys: &[K], key: &K, ctx: &OpCtx<'_, K>) -> Result<std::result::Result<usize, usize>> {
    let mut lo = 0;
    let mut hi = keys.len();
    while lo < hi {
        let mid = (lo + hi) / 2;
        match ctx.cmp_keys(&keys[mid], key)? {
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid,
            Ordering::Equal => return Ok(Ok(mid)),
        }
    }
    Ok(Err(lo))
}

impl<K, V> Node<K, V> {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Node::Leaf(_) => "leaf",
            Node::Internal(_) => "branch",
        }
    }

    /// Number of keys (for internal nodes: cached max-keys, one per child).
    pub fn key_count(&self) -> usize {
        match self {
            Node::Leaf(leaf) => leaf.keys.len(),
            Node::Internal(branch) => branch.max_keys.len(),
        }
    }

    pub fn first_key(&self) -> Option<&K> {
        match self {
            Node::Leaf(leaf) => leaf.keys.first(),
            Node::Internal(branch) => branch.max_keys.first(),
        }
    }

    /// Largest key in this subtree; O(1) through the cached max-keys.
    pub fn max_key(&self) -> Option<&K> {
        match self {
            Node::Leaf(leaf) => leaf.keys.last(),
            Node::Internal(branch) => branch.max_keys.last(),
        }
    }

    /// Second-to-last key: the upper bound of what remains when this node's
    /// last entry (or last subtree) shifts to a right sibling.
    pub fn penultimate_key(&self) -> Option<&K> {
        let keys = match self {
            Node::Leaf(leaf) => &leaf.keys,
            Node::Internal(branch) => &branch.max_keys,
        };
        keys.len().checked_sub(2).map(|i| &keys[i])
    }
}

impl<K: KeyType, V: ValueType> Node<K, V> {
    /// `value: None` is the absent value (reads as the default).
    pub fn set(
        &mut self,
        key: K,
        value: Option<V>,
        overwrite: bool,
        ctx: &OpCtx<'_, K>,
    ) -> Result<SetResult<K, V>> {
        match self {
            Node::Leaf(leaf) => leaf.set(key, value, overwrite, ctx),
            Node::Internal(branch) => branch.set(key, value, overwrite, ctx),
        }
    }

    /// Moves the right sibling's lowest entry into this node.
    /// The caller must refresh its cached max-key for this node.
    pub fn take_from_right(&mut self, rhs: &mut Node<K, V>) {
        match (self, rhs) {
            (Node::Leaf(a), Node::Leaf(b)) => a.take_from_right(b),
            (Node::Internal(a), Node::Internal(b)) => a.take_from_right(b),
            _ => unreachable!("siblings are always the same variant"),
        }
    }

    /// Moves the left sibling's highest entry into this node.
    pub fn take_from_left(&mut self, lhs: &mut Node<K, V>) {
        match (self, lhs) {
            (Node::Leaf(a), Node::Leaf(b)) => a.take_from_left(b),
            (Node::Internal(a), Node::Internal(b)) => a.take_from_left(b),
            _ => unreachable!("siblings are always the same variant"),
        }
    }

    /// Appends all entries of `rhs`. `rhs_shared` records whether the right
    /// sibling's handle was shared, in which case its children migrate under
    /// this node as explicitly shared.
    pub fn merge_sibling(&mut self, rhs: Node<K, V>, rhs_shared: bool, ctx: &OpCtx<'_, K>) -> Result<()> {
        match (self, rhs) {
            (Node::Leaf(a), Node::Leaf(b)) => {
                a.merge_sibling(b);
                Ok(())
            }
            (Node::Internal(a), Node::Internal(b)) => a.merge_sibling(b, rhs_shared, ctx),
            _ => unreachable!("siblings are always the same variant"),
        }
    }

    /// Copy for clone-on-write: the copy owns fresh arrays, and for internal
    /// nodes every child handle is marked shared since it is now reachable
    /// from both the original and the copy.
    pub fn clone_for_write(&self) -> Node<K, V> {
        match self {
            Node::Leaf(leaf) => Node::Leaf(leaf.clone()),
            Node::Internal(branch) => {
                for child in &branch.children {
                    child.mark_shared();
                }
                Node::Internal(branch.clone())
            }
        }
    }

    /// Smallest pair in this subtree.
    pub fn min_pair(&self, ctx: &OpCtx<'_, K>) -> Result<Option<(K, V)>> {
        match self {
            Node::Leaf(leaf) => Ok(leaf.pair_at(0)),
            Node::Internal(branch) => match branch.children.first() {
                Some(child) => child.read(ctx)?.min_pair(ctx),
                None => Ok(None),
            },
        }
    }

    /// Largest pair in this subtree.
    pub fn max_pair(&self, ctx: &OpCtx<'_, K>) -> Result<Option<(K, V)>> {
        match self {
            Node::Leaf(leaf) => Ok(leaf.keys.len().checked_sub(1).and_then(|i| leaf.pair_at(i))),
            Node::Internal(branch) => match branch.children.last() {
                Some(child) => child.read(ctx)?.max_pair(ctx),
                None => Ok(None),
            },
        }
    }

    /// Verifies the per-node invariants of this subtree and returns its pair
    /// count. Whole-tree key sortedness is intentionally not re-derived here;
    /// the per-node checks plus the max-key cache checks cover it.
    pub fn check(&self, ctx: &OpCtx<'_, K>, is_root: bool) -> Result<usize> {
        let fail = |reason: String| Err(TreeError::InvariantViolation(reason));
        if !is_root && self.key_count() == 0 {
            return fail("non-root node is empty".into());
        }
        if self.key_count() > ctx.fanout {
            return fail(format!(
                "{} holds {} keys, fanout is {}",
                self.kind(),
                self.key_count(),
                ctx.fanout
            ));
        }
        match self {
            Node::Leaf(leaf) => {
                for pair in leaf.keys.windows(2) {
                    if ctx.cmp_keys(&pair[0], &pair[1])? != Ordering::Less {
                        return fail("leaf keys are not strictly increasing".into());
                    }
                }
                if let Some(values) = leaf.values.materialized() {
                    if values.len() != leaf.keys.len() {
                        return fail("leaf values do not parallel its keys".into());
                    }
                }
                Ok(leaf.keys.len())
            }
            Node::Internal(branch) => {
                if branch.children.len() != branch.max_keys.len() {
                    return fail("child and max-key arrays diverge".into());
                }
                if is_root && branch.children.len() < 2 {
                    return fail("single-child root was not collapsed".into());
                }
                for pair in branch.max_keys.windows(2) {
                    if ctx.cmp_keys(&pair[0], &pair[1])? != Ordering::Less {
                        return fail("max-keys are not strictly increasing".into());
                    }
                }
                let mut count = 0;
                let mut child_is_leaf = None;
                for (i, child) in branch.children.iter().enumerate() {
                    let node = child.read(ctx)?;
                    match node.max_key() {
                        Some(max) if ctx.cmp_keys(max, &branch.max_keys[i])? == Ordering::Equal => {}
                        _ => return fail(format!("stale max-key cache at slot {}", i)),
                    }
                    match child_is_leaf {
                        None => child_is_leaf = Some(node.is_leaf()),
                        Some(leafness) if leafness != node.is_leaf() => {
                            return fail("sibling variants differ".into())
                        }
                        Some(_) => {}
                    }
                    count += node.check(ctx, false)?;
                }
                Ok(count)
            }
        }
    }
}
