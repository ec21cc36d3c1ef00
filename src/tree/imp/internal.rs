//! Internal nodes: child handles plus a parallel cache of each child's
//! largest key.

use super::{
    handle::{make_exclusive, NodeRef},
    node::{search, Node, SetResult},
    OpCtx,
};
use crate::{error::Result, KeyType, ValueType};
use std::{cmp::Ordering, sync::Arc};

#[derive(Debug, Clone)]
pub(crate) struct InternalNode<K, V> {
    pub children: Vec<Arc<NodeRef<K, V>>>,
    /// `max_keys[i]` caches `children[i].max_key()`.
    pub max_keys: Vec<K>,
}

impl<K, V> InternalNode<K, V> {
    pub fn from_stored(children: Vec<Arc<NodeRef<K, V>>>, max_keys: Vec<K>) -> Self {
        InternalNode { children, max_keys }
    }
}

impl<K: KeyType, V: ValueType> InternalNode<K, V> {
    /// The child responsible for `key`, clamped to the last child so lookups
    /// beyond the largest cached max-key still find the next-higher slot.
    pub fn child_index(&self, key: &K, ctx: &OpCtx<'_, K>) -> Result<usize> {
        Ok(match search(&self.max_keys, key, ctx)? {
            Ok(i) => i,
            Err(i) => i.min(self.children.len().saturating_sub(1)),
        })
    }

    pub fn insert_child(&mut self, i: usize, child: Arc<NodeRef<K, V>>, max_key: K) {
        self.children.insert(i, child);
        self.max_keys.insert(i, max_key);
    }

    pub fn refresh_max_key(&mut self, i: usize, ctx: &OpCtx<'_, K>) -> Result<()> {
        if let Some(max) = self.children[i].read(ctx)?.max_key() {
            self.max_keys[i] = max.clone();
        }
        Ok(())
    }

    pub fn set(
        &mut self,
        key: K,
        value: Option<V>,
        overwrite: bool,
        ctx: &OpCtx<'_, K>,
    ) -> Result<SetResult<K, V>> {
        let i = self.child_index(&key, ctx)?;
        make_exclusive(&mut self.children[i], ctx)?;

        // A full child would split; shifting one entry to a non-full sibling
        // avoids that when the incoming key stays routable to the same child.
        if self.children[i].read(ctx)?.key_count() >= ctx.fanout {
            self.try_shift_for(i, &key, ctx)?;
        }

        let result = {
            let mut child = self.children[i].write(ctx)?;
            child.set(key, value, overwrite, ctx)?
        };
        self.refresh_max_key(i, ctx)?;

        let right = match result {
            SetResult::Split { right } => right,
            done => return Ok(done),
        };
        let right_max = right
            .read(ctx)?
            .max_key()
            .expect("split siblings are never empty")
            .clone();
        if self.children.len() < ctx.fanout {
            self.insert_child(i + 1, right, right_max);
            return Ok(SetResult::Added);
        }
        let mut sibling = self.split_off_right();
        let half = self.children.len();
        if i >= half {
            sibling.insert_child(i - half + 1, right, right_max);
        } else {
            self.insert_child(i + 1, right, right_max);
        }
        debug!("split branch, fanouts {}/{}", self.children.len(), sibling.children.len());
        Ok(SetResult::Split {
            right: Arc::new(NodeRef::from_node(Node::Internal(sibling))),
        })
    }

    /// Shifts one entry out of the full child at `i` into a sibling with
    /// room, provided the pending `key` stays routable to the entries the
    /// child keeps.
    fn try_shift_for(&mut self, i: usize, key: &K, ctx: &OpCtx<'_, K>) -> Result<()> {
        if i > 0 {
            let room = self.children[i - 1].read(ctx)?.key_count() < ctx.fanout;
            let child_first = self.children[i].read(ctx)?.first_key().cloned();
            if let (true, Some(first)) = (room, child_first) {
                // The child's first entry departs left; the key must sort
                // strictly after it.
                if ctx.cmp_keys(&first, key)? == Ordering::Less {
                    make_exclusive(&mut self.children[i - 1], ctx)?;
                    let (head, tail) = self.children.split_at_mut(i);
                    {
                        let mut left = head[i - 1].write(ctx)?;
                        let mut child = tail[0].write(ctx)?;
                        left.take_from_right(&mut child);
                    }
                    self.refresh_max_key(i - 1, ctx)?;
                    return Ok(());
                }
            }
        }
        if i + 1 < self.children.len() {
            let room = self.children[i + 1].read(ctx)?.key_count() < ctx.fanout;
            let keep_max = self.children[i].read(ctx)?.penultimate_key().cloned();
            if let (true, Some(keep_max)) = (room, keep_max) {
                // The child's last entry departs right; everything above the
                // penultimate key goes with it, so the key must not sort
                // past that bound.
                if ctx.cmp_keys(key, &keep_max)? != Ordering::Greater {
                    make_exclusive(&mut self.children[i + 1], ctx)?;
                    let (head, tail) = self.children.split_at_mut(i + 1);
                    {
                        let mut right = tail[0].write(ctx)?;
                        let mut child = head[i].write(ctx)?;
                        right.take_from_left(&mut child);
                    }
                    self.refresh_max_key(i, ctx)?;
                }
            }
        }
        Ok(())
    }

    /// Splits off the upper half of the child array.
    pub fn split_off_right(&mut self) -> InternalNode<K, V> {
        let half = self.children.len() / 2;
        InternalNode {
            children: self.children.split_off(half),
            max_keys: self.max_keys.split_off(half),
        }
    }

    pub fn take_from_right(&mut self, rhs: &mut InternalNode<K, V>) {
        self.children.push(rhs.children.remove(0));
        self.max_keys.push(rhs.max_keys.remove(0));
    }

    pub fn take_from_left(&mut self, lhs: &mut InternalNode<K, V>) {
        self.children
            .insert(0, lhs.children.pop().expect("left sibling is never empty here"));
        self.max_keys
            .insert(0, lhs.max_keys.pop().expect("left sibling is never empty here"));
    }

    /// Appends the right sibling's children. A shared right sibling shares
    /// its children implicitly; once they migrate under this (non-shared)
    /// node each one is marked shared explicitly. The two touching children
    /// at the seam may themselves have become merge candidates.
    pub fn merge_sibling(&mut self, mut rhs: InternalNode<K, V>, rhs_shared: bool, ctx: &OpCtx<'_, K>) -> Result<()> {
        let old_len = self.children.len();
        if rhs_shared {
            for child in &rhs.children {
                child.mark_shared();
            }
        }
        self.children.append(&mut rhs.children);
        self.max_keys.append(&mut rhs.max_keys);
        if old_len > 0 {
            self.try_merge(old_len - 1, ctx)?;
        }
        Ok(())
    }

    /// Merges `children[i]` with `children[i+1]` when their combined key
    /// count fits in one node.
    pub fn try_merge(&mut self, i: usize, ctx: &OpCtx<'_, K>) -> Result<bool> {
        if i + 1 >= self.children.len() {
            return Ok(false);
        }
        let left_count = self.children[i].read(ctx)?.key_count();
        let right_count = self.children[i + 1].read(ctx)?.key_count();
        if left_count + right_count > ctx.fanout {
            return Ok(false);
        }
        // The left target may sit outside an edit scan's cloned range.
        make_exclusive(&mut self.children[i], ctx)?;
        let rhs_arc = self.children.remove(i + 1);
        self.max_keys.remove(i + 1);
        let rhs_shared = rhs_arc.is_shared();
        let rhs_node = rhs_arc.take_or_clone_node(ctx)?;
        {
            let mut left = self.children[i].write(ctx)?;
            left.merge_sibling(rhs_node, rhs_shared, ctx)?;
        }
        self.refresh_max_key(i, ctx)?;
        trace!("merged children at slot {}", i);
        Ok(true)
    }
}
