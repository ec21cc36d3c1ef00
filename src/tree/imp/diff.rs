//! Pair-level set difference between two trees that exploits node sharing.
//!
//! Two cursors walk both trees in *descending* key order. Each cursor keeps
//! an explicit spine of child arrays plus per-level indices, so comparing
//! two positions is O(1) via the cached max-keys. When both cursors land on
//! the same node (by handle identity or by equal content id) the whole
//! subtree is skipped, which is what makes diffing a tree against its clone
//! O(shared-boundary) instead of O(n).

use super::{handle::NodeRef, node::Node, OpCtx, Tree};
use crate::{
    compare::same_order,
    error::{Result, TreeError},
    KeyType, ValueType,
};
use std::{cmp::Ordering, ops::ControlFlow, sync::Arc};

pub(crate) struct DiffCursor<K, V> {
    height: usize,
    /// Stack of child arrays entered so far; level 0 is `[root]`.
    spine: Vec<Vec<Arc<NodeRef<K, V>>>>,
    /// Index into each spine level, plus the value index while in a leaf.
    indices: Vec<usize>,
    leaf: Option<Arc<NodeRef<K, V>>>,
    /// Largest key reachable at the cursor's position.
    current_key: K,
}

impl<K: KeyType, V: ValueType> DiffCursor<K, V> {
    /// Positions a cursor on the root of a non-empty tree.
    fn new(tree: &Tree<K, V>, ctx: &OpCtx<'_, K>) -> Result<Self> {
        let current_key = tree
            .root
            .read(ctx)?
            .max_key()
            .expect("diff cursors are only built for non-empty trees")
            .clone();
        Ok(DiffCursor {
            height: tree.height()?,
            spine: vec![vec![tree.root.clone()]],
            indices: vec![0],
            leaf: None,
            current_key,
        })
    }

    fn at_leaf(&self) -> bool {
        self.leaf.is_some()
    }

    /// The node the cursor points at; only meaningful at a node position.
    fn current_node(&self) -> &Arc<NodeRef<K, V>> {
        let level = self.spine.len() - 1;
        &self.spine[level][self.indices[level]]
    }

    fn current_value(&self, ctx: &OpCtx<'_, K>) -> Result<V> {
        let leaf = self.leaf.as_ref().expect("cursor is at a leaf position");
        let node = leaf.read(ctx)?;
        match &*node {
            Node::Leaf(leaf) => Ok(leaf.value_at(*self.indices.last().unwrap())),
            Node::Internal(_) => unreachable!("leaf position points at a leaf"),
        }
    }

    /// Advances to the previous position in key order. With `to_node` the
    /// cursor skips value positions and moves whole nodes, used when both
    /// sides detected an identical node. Returns false when the walk is done.
    fn step(&mut self, to_node: bool, ctx: &OpCtx<'_, K>) -> Result<bool> {
        if to_node || self.at_leaf() {
            let last = self.indices.len() - 1;
            if to_node || self.indices[last] == 0 {
                // Walk back up to the deepest level with a left sibling and
                // step onto it.
                let mut lvl = self.spine.len();
                while lvl > 0 {
                    let l = lvl - 1;
                    if self.indices[l] > 0 {
                        self.leaf = None;
                        self.indices.truncate(l + 1);
                        self.spine.truncate(l + 1);
                        self.indices[l] -= 1;
                        self.current_key = self.spine[l][self.indices[l]]
                            .read(ctx)?
                            .max_key()
                            .expect("non-root nodes are never empty")
                            .clone();
                        return Ok(true);
                    }
                    lvl -= 1;
                }
                // Far left of the tree, nothing to step to.
                Ok(false)
            } else {
                let leaf = self.leaf.clone().expect("value positions carry a leaf");
                self.indices[last] -= 1;
                let node = leaf.read(ctx)?;
                match &*node {
                    Node::Leaf(leaf) => self.current_key = leaf.keys[self.indices[last]].clone(),
                    Node::Internal(_) => unreachable!("leaf position points at a leaf"),
                }
                Ok(true)
            }
        } else {
            // At a node position: descend into the rightmost child, or into
            // the last value when the node is a leaf.
            let cur = self.current_node().clone();
            let node = cur.read(ctx)?;
            match &*node {
                Node::Leaf(leaf) => {
                    let value_index = leaf.keys.len() - 1;
                    self.current_key = leaf.keys[value_index].clone();
                    drop(node);
                    self.indices.push(value_index);
                    self.leaf = Some(cur);
                }
                Node::Internal(branch) => {
                    let children = branch.children.clone();
                    let child_index = children.len() - 1;
                    self.current_key = branch.max_keys[child_index].clone();
                    drop(node);
                    self.spine.push(children);
                    self.indices.push(child_index);
                }
            }
            Ok(true)
        }
    }
}

/// Reverse key comparison (the walk is descending), with depths normalized
/// against the shallower tree so that cursors of different heights land on
/// shared nodes simultaneously. The "behind" cursor compares `Less` and is
/// always the one advanced.
fn cursor_cmp<K: KeyType, V: ValueType>(
    a: &DiffCursor<K, V>,
    b: &DiffCursor<K, V>,
    ctx: &OpCtx<'_, K>,
) -> Result<Ordering> {
    let by_key = ctx.cmp_keys(&b.current_key, &a.current_key)?;
    if by_key != Ordering::Equal {
        return Ok(by_key);
    }
    let height_min = a.height.min(b.height);
    let depth_a = a.indices.len() as isize - (a.height as isize - height_min as isize);
    let depth_b = b.indices.len() as isize - (b.height as isize - height_min as isize);
    Ok(depth_a.cmp(&depth_b))
}

/// Node identity for the subtree-skip rule: the same handle, or two handles
/// whose content ids agree (content-addressing makes equal ids equal
/// subtrees, which also lets a reloaded tree skip against its original).
fn same_node<K, V>(a: &Arc<NodeRef<K, V>>, b: &Arc<NodeRef<K, V>>) -> bool {
    if Arc::ptr_eq(a, b) {
        return true;
    }
    match (a.saved_id(), b.saved_id()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Emits every remaining pair of `cursor`, descending.
fn sweep<K: KeyType, V: ValueType, R>(
    mut cursor: DiffCursor<K, V>,
    ctx: &OpCtx<'_, K>,
    only: &mut dyn FnMut(&K, &V) -> ControlFlow<R>,
) -> Result<Option<R>> {
    loop {
        if cursor.at_leaf() {
            let value = cursor.current_value(ctx)?;
            if let ControlFlow::Break(r) = only(&cursor.current_key, &value) {
                return Ok(Some(r));
            }
        }
        if !cursor.step(false, ctx)? {
            return Ok(None);
        }
    }
}

/// One cursor ran out; the other first steps off a tied position (already
/// reported) and then sweeps to completion.
fn finish<K: KeyType, V: ValueType, R>(
    mut cursor: DiffCursor<K, V>,
    finished: &DiffCursor<K, V>,
    ctx: &OpCtx<'_, K>,
    only: &mut dyn FnMut(&K, &V) -> ControlFlow<R>,
) -> Result<Option<R>> {
    if cursor_cmp(&cursor, finished, ctx)? == Ordering::Equal && !cursor.step(false, ctx)? {
        return Ok(None);
    }
    sweep(cursor, ctx, only)
}

pub(crate) fn diff_trees<K, V, R>(
    this: &Tree<K, V>,
    other: &Tree<K, V>,
    only_this: &mut dyn FnMut(&K, &V) -> ControlFlow<R>,
    only_other: &mut dyn FnMut(&K, &V) -> ControlFlow<R>,
    different: &mut dyn FnMut(&K, &V, &V) -> ControlFlow<R>,
) -> Result<Option<R>>
where
    K: KeyType,
    V: ValueType + PartialEq,
{
    if !same_order(&this.cmp, &other.cmp) {
        return Err(TreeError::ComparatorMismatch);
    }
    let ctx_this = this.op_ctx();
    let ctx_other = other.op_ctx();

    match (this.is_empty()?, other.is_empty()?) {
        (true, true) => return Ok(None),
        (true, false) => {
            return sweep(DiffCursor::new(other, &ctx_other)?, &ctx_other, only_other)
        }
        (false, true) => return sweep(DiffCursor::new(this, &ctx_this)?, &ctx_this, only_this),
        (false, false) => {}
    }

    let mut cursor_this = DiffCursor::new(this, &ctx_this)?;
    let mut cursor_other = DiffCursor::new(other, &ctx_other)?;
    let mut this_alive = true;
    let mut other_alive = true;
    let mut prev_order = cursor_cmp(&cursor_this, &cursor_other, &ctx_this)?;

    while this_alive && other_alive {
        let order = cursor_cmp(&cursor_this, &cursor_other, &ctx_this)?;
        if cursor_this.at_leaf() || cursor_other.at_leaf() {
            // A tie in the previous pass means this position was already
            // reported; skipping it avoids duplicate emissions when one side
            // merely caught up.
            if prev_order != Ordering::Equal {
                match order {
                    Ordering::Equal => {
                        if cursor_this.at_leaf() && cursor_other.at_leaf() {
                            let value_this = cursor_this.current_value(&ctx_this)?;
                            let value_other = cursor_other.current_value(&ctx_other)?;
                            if value_this != value_other {
                                if let ControlFlow::Break(r) =
                                    different(&cursor_this.current_key, &value_this, &value_other)
                                {
                                    return Ok(Some(r));
                                }
                            }
                        }
                    }
                    Ordering::Greater => {
                        // The other cursor is the one that advanced.
                        if cursor_other.at_leaf() {
                            let value = cursor_other.current_value(&ctx_other)?;
                            if let ControlFlow::Break(r) = only_other(&cursor_other.current_key, &value) {
                                return Ok(Some(r));
                            }
                        }
                    }
                    Ordering::Less => {
                        if cursor_this.at_leaf() {
                            let value = cursor_this.current_value(&ctx_this)?;
                            if let ControlFlow::Break(r) = only_this(&cursor_this.current_key, &value) {
                                return Ok(Some(r));
                            }
                        }
                    }
                }
            }
        } else if order == Ordering::Equal {
            // Both cursors sit on nodes with the same max-key at the same
            // normalized depth; identical nodes are skipped whole.
            if same_node(cursor_this.current_node(), cursor_other.current_node()) {
                prev_order = Ordering::Equal;
                this_alive = cursor_this.step(true, &ctx_this)?;
                other_alive = cursor_other.step(true, &ctx_other)?;
                continue;
            }
        }
        prev_order = order;
        if order == Ordering::Less {
            this_alive = cursor_this.step(false, &ctx_this)?;
        } else {
            other_alive = cursor_other.step(false, &ctx_other)?;
        }
    }

    if this_alive {
        return finish(cursor_this, &cursor_other, &ctx_this, only_this);
    }
    if other_alive {
        return finish(cursor_other, &cursor_this, &ctx_other, only_other);
    }
    Ok(None)
}
