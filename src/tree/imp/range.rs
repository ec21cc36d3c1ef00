//! Range traversal: one recursive walk serves read scans, edit scans, and
//! range deletion.
//!
//! Bounds are `Option<&K>` with `None` meaning unbounded on that side. The
//! read scan threads a visitor over `[lo, hi]` in ascending key order; the
//! edit scan additionally applies per-pair directives, clones shared children
//! before descending, and finishes with a merge sweep over the touched child
//! range.

use super::{
    handle::{make_exclusive, NodeRef},
    internal::InternalNode,
    leaf::LeafNode,
    node::{search, Node},
    OpCtx,
};
use crate::{error::Result, KeyType, ValueType};
use std::{ops::ControlFlow, sync::Arc};

/// What an edit-scan visitor wants done with the pair it was shown.
#[derive(Debug)]
pub enum EditDirective<V, R> {
    /// Leave the pair as is.
    NoOp,
    /// Bind a new value to the current key.
    Replace(V),
    /// Remove the pair.
    Delete,
    /// Stop the scan and surface `R`.
    Break(R),
    /// Replace, then stop.
    ReplaceAndBreak(V, R),
    /// Delete, then stop.
    DeleteAndBreak(R),
}

/// Index window `[i_low, i_high)` of a leaf covered by the bounds.
fn leaf_window<K: KeyType, V>(
    leaf: &LeafNode<K, V>,
    lo: Option<&K>,
    hi: Option<&K>,
    include_hi: bool,
    ctx: &OpCtx<'_, K>,
) -> Result<(usize, usize)> {
    let i_low = match lo {
        None => 0,
        Some(key) => match search(&leaf.keys, key, ctx)? {
            Ok(i) | Err(i) => i,
        },
    };
    let i_high = match hi {
        None => leaf.keys.len(),
        Some(key) => match search(&leaf.keys, key, ctx)? {
            Ok(i) => {
                if include_hi {
                    i + 1
                } else {
                    i
                }
            }
            Err(i) => i,
        },
    };
    Ok((i_low, i_high))
}

/// Inclusive child window `[i_low, i_high]` of an internal node. The window
/// is empty when `i_low > i_high` or `i_low` runs off the child array.
fn branch_window<K: KeyType, V>(
    branch: &InternalNode<K, V>,
    lo: Option<&K>,
    hi: Option<&K>,
    ctx: &OpCtx<'_, K>,
) -> Result<(usize, usize)> {
    let last = branch.children.len().saturating_sub(1);
    let i_low = match lo {
        None => 0,
        Some(key) => match search(&branch.max_keys, key, ctx)? {
            Ok(i) | Err(i) => i,
        },
    };
    let i_high = match hi {
        None => last,
        Some(key) => match search(&branch.max_keys, key, ctx)? {
            Ok(i) | Err(i) => i.min(last),
        },
    };
    Ok((i_low, i_high))
}

pub(crate) fn scan_node<K, V, R, F>(
    nref: &Arc<NodeRef<K, V>>,
    lo: Option<&K>,
    hi: Option<&K>,
    include_hi: bool,
    ctx: &OpCtx<'_, K>,
    count: &mut usize,
    visit: &mut F,
) -> Result<ControlFlow<R>>
where
    K: KeyType,
    V: ValueType,
    F: FnMut(&K, &V, usize) -> ControlFlow<R>,
{
    let node = nref.read(ctx)?;
    match &*node {
        Node::Leaf(leaf) => {
            let (i_low, i_high) = leaf_window(leaf, lo, hi, include_hi, ctx)?;
            for i in i_low..i_high {
                let flow = match leaf.values.materialized() {
                    Some(values) => visit(&leaf.keys[i], &values[i], *count),
                    None => visit(&leaf.keys[i], &V::default(), *count),
                };
                *count += 1;
                if let ControlFlow::Break(r) = flow {
                    return Ok(ControlFlow::Break(r));
                }
            }
            Ok(ControlFlow::Continue(()))
        }
        Node::Internal(branch) => {
            let (i_low, i_high) = branch_window(branch, lo, hi, ctx)?;
            if branch.children.is_empty() || i_low > i_high || i_low >= branch.children.len() {
                return Ok(ControlFlow::Continue(()));
            }
            for i in i_low..=i_high {
                if let ControlFlow::Break(r) =
                    scan_node(&branch.children[i], lo, hi, include_hi, ctx, count, visit)?
                {
                    return Ok(ControlFlow::Break(r));
                }
            }
            Ok(ControlFlow::Continue(()))
        }
    }
}

pub(crate) fn edit_node<K, V, R, F>(
    slot: &mut Arc<NodeRef<K, V>>,
    lo: Option<&K>,
    hi: Option<&K>,
    include_hi: bool,
    ctx: &OpCtx<'_, K>,
    count: &mut usize,
    removed: &mut usize,
    edit: &mut F,
) -> Result<ControlFlow<R>>
where
    K: KeyType,
    V: ValueType,
    F: FnMut(&K, &V, usize) -> EditDirective<V, R>,
{
    make_exclusive(slot, ctx)?;
    let mut node = slot.write(ctx)?;
    match &mut *node {
        Node::Leaf(leaf) => {
            let (i_low, mut i_high) = leaf_window(leaf, lo, hi, include_hi, ctx)?;
            let mut i = i_low;
            while i < i_high {
                let directive = match leaf.values.materialized() {
                    Some(values) => edit(&leaf.keys[i], &values[i], *count),
                    None => edit(&leaf.keys[i], &V::default(), *count),
                };
                *count += 1;
                match directive {
                    EditDirective::NoOp => i += 1,
                    EditDirective::Replace(value) => {
                        leaf.set_value(i, value);
                        i += 1;
                    }
                    EditDirective::Delete => {
                        leaf.remove_at(i);
                        *removed += 1;
                        i_high -= 1;
                    }
                    EditDirective::Break(r) => return Ok(ControlFlow::Break(r)),
                    EditDirective::ReplaceAndBreak(value, r) => {
                        leaf.set_value(i, value);
                        return Ok(ControlFlow::Break(r));
                    }
                    EditDirective::DeleteAndBreak(r) => {
                        leaf.remove_at(i);
                        *removed += 1;
                        return Ok(ControlFlow::Break(r));
                    }
                }
            }
            Ok(ControlFlow::Continue(()))
        }
        Node::Internal(branch) => {
            let (i_low, i_high) = branch_window(branch, lo, hi, ctx)?;
            if branch.children.is_empty() || i_low > i_high || i_low >= branch.children.len() {
                return Ok(ControlFlow::Continue(()));
            }
            let mut flow = ControlFlow::Continue(());
            let mut i = i_low;
            while i <= i_high && i < branch.children.len() {
                let child_flow =
                    edit_node(&mut branch.children[i], lo, hi, include_hi, ctx, count, removed, edit)?;
                // An emptied child leaves the cache stale; the sweep below
                // drops the child before anyone reads through it.
                branch.refresh_max_key(i, ctx)?;
                if child_flow.is_break() {
                    flow = child_flow;
                    break;
                }
                i += 1;
            }
            // Deletions may have hollowed out children; merge or drop them.
            // The sweep also covers the left neighbor of the window since a
            // boundary child can become a merge candidate.
            let mut j = i_high.min(branch.children.len() - 1);
            let j_end = i_low.saturating_sub(1);
            loop {
                let child_count = branch.children[j].read(ctx)?.key_count();
                if child_count == 0 {
                    branch.children.remove(j);
                    branch.max_keys.remove(j);
                } else if child_count <= ctx.fanout / 2 {
                    branch.try_merge(j, ctx)?;
                }
                if j == j_end || j == 0 {
                    break;
                }
                j -= 1;
            }
            Ok(flow)
        }
    }
}
