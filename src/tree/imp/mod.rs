//! Implementation of the tree engine.

use self::{
    handle::{make_exclusive, NodeRef},
    internal::InternalNode,
    leaf::LeafNode,
    node::{Node, SetResult},
};
use crate::{
    compare::{Comparator, OrdComparator},
    error::{Result, TreeError},
    store::{BlobId, BlobStore},
    KeyType, ValueType,
};
use parking_lot::RwLock;
use std::{cmp::Ordering, convert::Infallible, mem, ops::ControlFlow, sync::Arc};

mod diff;
mod handle;
mod internal;
mod leaf;
mod node;
mod packed;
mod range;

pub use self::range::EditDirective;

const MIN_FANOUT: usize = 4;
const MAX_FANOUT: usize = 256;
const DEFAULT_FANOUT: usize = 32;

/// Per-operation context: the comparator, the optional blob store for lazy
/// loads, and the fanout bound. Carried by reference through every recursion
/// so the store stays an explicit collaborator.
pub(crate) struct OpCtx<'a, K> {
    pub cmp: &'a dyn Comparator<K>,
    pub store: Option<&'a dyn BlobStore>,
    pub fanout: usize,
}

impl<'a, K> OpCtx<'a, K> {
    pub fn cmp_keys(&self, a: &K, b: &K) -> Result<Ordering> {
        self.cmp.try_cmp(a, b).ok_or(TreeError::UnorderableKey)
    }
}

/// Construction options: comparator, fanout, and an optional blob store.
pub struct TreeOptions<K> {
    fanout: usize,
    comparator: Arc<dyn Comparator<K>>,
    store: Option<Arc<dyn BlobStore>>,
}

impl<K: Ord + 'static> TreeOptions<K> {
    /// Options with the key type's own total order.
    pub fn new() -> Self {
        Self::with_comparator(Arc::new(OrdComparator))
    }
}

impl<K: Ord + 'static> Default for TreeOptions<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> TreeOptions<K> {
    pub fn with_comparator(comparator: Arc<dyn Comparator<K>>) -> Self {
        TreeOptions {
            fanout: DEFAULT_FANOUT,
            comparator,
            store: None,
        }
    }

    /// Maximum keys per node, clamped to `[4, 256]`.
    pub fn fanout(mut self, fanout: usize) -> Self {
        self.fanout = fanout.clamp(MIN_FANOUT, MAX_FANOUT);
        self
    }

    pub fn store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build<V>(self) -> Tree<K, V> {
        Tree {
            root: empty_root(),
            len: RwLock::new(Some(0)),
            fanout: self.fanout,
            cmp: self.comparator,
            store: self.store,
            frozen: false,
        }
    }
}

fn empty_root<K, V>() -> Arc<NodeRef<K, V>> {
    Arc::new(NodeRef::from_node(Node::Leaf(LeafNode::new())))
}

/// An ordered key-value container: a B+ tree with copy-on-write clones and
/// content-addressed lazy persistence.
///
/// A tree is owned by one logical task at a time; `clone` yields an
/// independent tree in O(1) by sharing nodes, and subsequent mutations copy
/// only the touched paths.
pub struct Tree<K, V> {
    root: Arc<NodeRef<K, V>>,
    /// Pair count; `None` after `load` until somebody asks, since the blob
    /// format does not persist it.
    len: RwLock<Option<usize>>,
    fanout: usize,
    cmp: Arc<dyn Comparator<K>>,
    store: Option<Arc<dyn BlobStore>>,
    frozen: bool,
}

/// The O(1) copy-on-write clone: marks the shared root and hands out a new
/// tree referencing it. Clones are born unfrozen.
impl<K, V> Clone for Tree<K, V> {
    fn clone(&self) -> Self {
        self.root.mark_shared();
        Tree {
            root: self.root.clone(),
            len: RwLock::new(*self.len.read()),
            fanout: self.fanout,
            cmp: self.cmp.clone(),
            store: self.store.clone(),
            frozen: false,
        }
    }
}

impl<K: KeyType + Ord, V: ValueType> Tree<K, V> {
    /// An empty tree over the key type's own order.
    pub fn new() -> Self {
        TreeOptions::new().build()
    }

    /// Builds a tree from initial pairs, last write winning on duplicates.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (K, V)>) -> Result<Self> {
        let mut tree = Self::new();
        tree.set_pairs(pairs, true)?;
        Ok(tree)
    }
}

impl<K: KeyType + Ord, V: ValueType> Default for Tree<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: KeyType, V: ValueType> Tree<K, V> {
    pub fn with_options(options: TreeOptions<K>) -> Self {
        options.build()
    }

    /// Attaches directly to a committed root without fetching anything.
    pub fn open(options: TreeOptions<K>, store: Arc<dyn BlobStore>, root_id: BlobId) -> Self {
        let TreeOptions {
            fanout, comparator, ..
        } = options;
        Tree {
            root: Arc::new(NodeRef::from_id(root_id)),
            len: RwLock::new(None),
            fanout,
            cmp: comparator,
            store: Some(store),
            frozen: false,
        }
    }

    pub(crate) fn op_ctx(&self) -> OpCtx<'_, K> {
        OpCtx {
            cmp: &*self.cmp,
            store: self.store.as_deref(),
            fanout: self.fanout,
        }
    }

    /// Splits the borrow so mutators can hold the context and the root slot
    /// at the same time.
    fn parts(&mut self) -> (&mut Arc<NodeRef<K, V>>, OpCtx<'_, K>) {
        let Tree {
            root,
            cmp,
            store,
            fanout,
            ..
        } = self;
        (
            root,
            OpCtx {
                cmp: &**cmp,
                store: store.as_deref(),
                fanout: *fanout,
            },
        )
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.frozen {
            return Err(TreeError::FrozenTree);
        }
        Ok(())
    }

    // --- queries ---------------------------------------------------------

    fn lookup<T>(
        &self,
        key: &K,
        found: impl FnOnce(&LeafNode<K, V>, usize) -> T,
    ) -> Result<Option<T>> {
        let ctx = self.op_ctx();
        let mut cur = self.root.clone();
        loop {
            let next = {
                let node = cur.read(&ctx)?;
                match &*node {
                    Node::Leaf(leaf) => {
                        return Ok(match node::search(&leaf.keys, key, &ctx)? {
                            Ok(i) => Some(found(leaf, i)),
                            Err(_) => None,
                        })
                    }
                    Node::Internal(branch) => match node::search(&branch.max_keys, key, &ctx)? {
                        Ok(i) => branch.children[i].clone(),
                        Err(i) if i < branch.children.len() => branch.children[i].clone(),
                        Err(_) => return Ok(None),
                    },
                }
            };
            cur = next;
        }
    }

    /// The value bound to `key`, if any.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        self.lookup(key, |leaf, i| leaf.value_at(i))
    }

    /// The stored pair for `key`, if any.
    pub fn get_pair(&self, key: &K) -> Result<Option<(K, V)>> {
        self.lookup(key, |leaf, i| (leaf.keys[i].clone(), leaf.value_at(i)))
    }

    pub fn has(&self, key: &K) -> Result<bool> {
        Ok(self.lookup(key, |_, _| ())?.is_some())
    }

    pub fn min_key(&self) -> Result<Option<K>> {
        let ctx = self.op_ctx();
        Ok(self.root.read(&ctx)?.min_pair(&ctx)?.map(|(k, _)| k))
    }

    /// O(1) through the root's cached max-key.
    pub fn max_key(&self) -> Result<Option<K>> {
        let ctx = self.op_ctx();
        Ok(self.root.read(&ctx)?.max_key().cloned())
    }

    /// The pair at `key` or the closest lower one; a `None` bound returns
    /// the maximum pair.
    pub fn get_pair_or_next_lower(&self, key: Option<&K>) -> Result<Option<(K, V)>> {
        pair_le(&self.root, key, true, &self.op_ctx())
    }

    /// The pair strictly below `key`; a `None` bound returns the maximum
    /// pair.
    pub fn next_lower_pair(&self, key: Option<&K>) -> Result<Option<(K, V)>> {
        pair_le(&self.root, key, false, &self.op_ctx())
    }

    /// The pair at `key` or the closest higher one; a `None` bound returns
    /// the minimum pair.
    pub fn get_pair_or_next_higher(&self, key: Option<&K>) -> Result<Option<(K, V)>> {
        pair_ge(&self.root, key, true, &self.op_ctx())
    }

    /// The pair strictly above `key`; a `None` bound returns the minimum
    /// pair.
    pub fn next_higher_pair(&self, key: Option<&K>) -> Result<Option<(K, V)>> {
        pair_ge(&self.root, key, false, &self.op_ctx())
    }

    /// Ascending visit of every pair in `[lo, hi]` (`None` = unbounded).
    /// The visitor sees the running pair counter and may break early with an
    /// arbitrary value; the counter is returned otherwise.
    pub fn for_range<R, F>(
        &self,
        lo: Option<&K>,
        hi: Option<&K>,
        include_hi: bool,
        mut visit: F,
    ) -> Result<ControlFlow<R, usize>>
    where
        F: FnMut(&K, &V, usize) -> ControlFlow<R>,
    {
        let ctx = self.op_ctx();
        if let (Some(l), Some(h)) = (lo, hi) {
            if ctx.cmp_keys(l, h)? == Ordering::Greater {
                return Ok(ControlFlow::Continue(0));
            }
        }
        let mut count = 0;
        Ok(
            match range::scan_node(&self.root, lo, hi, include_hi, &ctx, &mut count, &mut visit)? {
                ControlFlow::Continue(()) => ControlFlow::Continue(count),
                ControlFlow::Break(r) => ControlFlow::Break(r),
            },
        )
    }

    /// Ascending list of the pairs in `[lo, hi]`, capped at `max_len`.
    pub fn get_range(
        &self,
        lo: Option<&K>,
        hi: Option<&K>,
        include_hi: bool,
        max_len: Option<usize>,
    ) -> Result<Vec<(K, V)>> {
        if max_len == Some(0) {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        self.for_range(lo, hi, include_hi, |k, v, _| {
            out.push((k.clone(), v.clone()));
            match max_len {
                Some(max) if out.len() >= max => ControlFlow::Break(()),
                _ => ControlFlow::Continue(()),
            }
        })?;
        Ok(out)
    }

    /// All keys, ascending.
    pub fn keys(&self) -> Result<Vec<K>> {
        let mut out = Vec::new();
        self.for_range::<Infallible, _>(None, None, true, |k, _, _| {
            out.push(k.clone());
            ControlFlow::Continue(())
        })?;
        Ok(out)
    }

    /// All pairs, ascending.
    pub fn pairs(&self) -> Result<Vec<(K, V)>> {
        self.get_range(None, None, true, None)
    }

    /// Number of pairs. Cheap normally; after `load` the first call runs one
    /// full scan because the pair count is not persisted.
    pub fn size(&self) -> Result<usize> {
        if let Some(len) = *self.len.read() {
            return Ok(len);
        }
        let counted = match self.for_range::<Infallible, _>(None, None, true, |_, _, _| {
            ControlFlow::Continue(())
        })? {
            ControlFlow::Continue(count) => count,
            ControlFlow::Break(i) => match i {},
        };
        *self.len.write() = Some(counted);
        Ok(counted)
    }

    pub fn is_empty(&self) -> Result<bool> {
        let ctx = self.op_ctx();
        Ok(self.root.read(&ctx)?.key_count() == 0)
    }

    /// Number of internal levels above the leaves.
    pub fn height(&self) -> Result<usize> {
        let ctx = self.op_ctx();
        let mut height = 0;
        let mut cur = self.root.clone();
        loop {
            let next = {
                let node = cur.read(&ctx)?;
                match &*node {
                    Node::Leaf(_) => return Ok(height),
                    Node::Internal(branch) => match branch.children.first() {
                        Some(child) => child.clone(),
                        None => return Ok(height),
                    },
                }
            };
            height += 1;
            cur = next;
        }
    }

    /// Verifies the structural invariants of every reachable node and that
    /// the reachable pair count matches `size()`.
    pub fn check_valid(&self) -> Result<()> {
        let counted = {
            let ctx = self.op_ctx();
            self.root.read(&ctx)?.check(&ctx, true)?
        };
        let size = self.size()?;
        if counted != size {
            return Err(TreeError::InvariantViolation(format!(
                "size() reports {} but {} pairs are reachable",
                size, counted
            )));
        }
        Ok(())
    }

    // --- mutation --------------------------------------------------------

    /// Inserts or updates `key`. Returns true iff a new pair was added. With
    /// `overwrite` false an existing pair is left untouched; with it true
    /// both the value and the stored key are replaced, permitting key edits
    /// that preserve the sort order.
    pub fn set(&mut self, key: K, value: V, overwrite: bool) -> Result<bool> {
        self.set_impl(key, Some(value), overwrite)
    }

    /// `value: None` inserts the absent value, keeping keys-only leaves in
    /// their unmaterialized form.
    fn set_impl(&mut self, key: K, value: Option<V>, overwrite: bool) -> Result<bool> {
        self.ensure_mutable()?;
        // A key the comparator cannot even place against itself would be
        // silently mis-inserted; reject it up front.
        if self.cmp.try_cmp(&key, &key) != Some(Ordering::Equal) {
            return Err(TreeError::UnorderableKey);
        }
        let added = {
            let (root, ctx) = self.parts();
            make_exclusive(root, &ctx)?;
            let result = {
                let mut node = root.write(&ctx)?;
                node.set(key, value, overwrite, &ctx)?
            };
            match result {
                SetResult::Split { right } => {
                    // The root split; grow the tree upward.
                    let left = mem::replace(root, empty_root());
                    let left_max = left
                        .read(&ctx)?
                        .max_key()
                        .expect("split halves are never empty")
                        .clone();
                    let right_max = right
                        .read(&ctx)?
                        .max_key()
                        .expect("split halves are never empty")
                        .clone();
                    *root = Arc::new(NodeRef::from_node(Node::Internal(
                        InternalNode::from_stored(vec![left, right], vec![left_max, right_max]),
                    )));
                    true
                }
                done => done.added(),
            }
        };
        if added {
            if let Some(len) = self.len.get_mut() {
                *len += 1;
            }
        }
        Ok(added)
    }

    /// Sets every pair; returns how many were newly added.
    pub fn set_pairs(
        &mut self,
        pairs: impl IntoIterator<Item = (K, V)>,
        overwrite: bool,
    ) -> Result<usize> {
        let mut added = 0;
        for (key, value) in pairs {
            if self.set(key, value, overwrite)? {
                added += 1;
            }
        }
        Ok(added)
    }

    /// Removes `key`; returns true iff a pair was removed.
    pub fn delete(&mut self, key: &K) -> Result<bool> {
        match self.edit_range::<Infallible, _>(Some(key), Some(key), true, |_, _, _| {
            EditDirective::Delete
        })? {
            ControlFlow::Continue(count) => Ok(count > 0),
            ControlFlow::Break(i) => match i {},
        }
    }

    /// Removes every pair in `[lo, hi]`; returns how many.
    pub fn delete_range(
        &mut self,
        lo: Option<&K>,
        hi: Option<&K>,
        include_hi: bool,
    ) -> Result<usize> {
        match self.edit_range::<Infallible, _>(lo, hi, include_hi, |_, _, _| EditDirective::Delete)?
        {
            ControlFlow::Continue(count) => Ok(count),
            ControlFlow::Break(i) => match i {},
        }
    }

    /// Ascending traversal of `[lo, hi]` where the visitor directs, per
    /// pair, whether to keep, replace, delete, or stop (see
    /// [`EditDirective`]). Returns the visited count, or the break value.
    ///
    /// The visitor holds no reference to the tree (which is mutably borrowed
    /// for the whole scan), so it cannot mutate or clone it out-of-band. If
    /// the scan stops early or fails, pairs visited up to that point keep
    /// their applied directives.
    pub fn edit_range<R, F>(
        &mut self,
        lo: Option<&K>,
        hi: Option<&K>,
        include_hi: bool,
        mut edit: F,
    ) -> Result<ControlFlow<R, usize>>
    where
        F: FnMut(&K, &V, usize) -> EditDirective<V, R>,
    {
        self.ensure_mutable()?;
        {
            let ctx = self.op_ctx();
            if let (Some(l), Some(h)) = (lo, hi) {
                if ctx.cmp_keys(l, h)? == Ordering::Greater {
                    return Ok(ControlFlow::Continue(0));
                }
            }
        }
        let mut count = 0;
        let mut removed = 0;
        let (flow, collapsed) = {
            let (root, ctx) = self.parts();
            let flow = range::edit_node(
                root,
                lo,
                hi,
                include_hi,
                &ctx,
                &mut count,
                &mut removed,
                &mut edit,
            );
            // The root collapse runs even when the scan broke early.
            let collapsed = collapse_root(root, &ctx);
            (flow, collapsed)
        };
        if removed > 0 {
            if let Some(len) = self.len.get_mut() {
                *len -= removed;
            }
        }
        let flow = flow?;
        collapsed?;
        Ok(match flow {
            ControlFlow::Continue(()) => ControlFlow::Continue(count),
            ControlFlow::Break(r) => ControlFlow::Break(r),
        })
    }

    /// Resets to the empty tree.
    pub fn clear(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        self.root = empty_root();
        *self.len.get_mut() = Some(0);
        Ok(())
    }

    // --- clones and persistent variants ----------------------------------

    /// Eager clone: duplicates every node that is not already shared (all of
    /// them with `force`), so no shared-ness propagates into the copy.
    pub fn greedy_clone(&self, force: bool) -> Self {
        Tree {
            root: handle::greedy_clone_ref(&self.root, force),
            len: RwLock::new(*self.len.read()),
            fanout: self.fanout,
            cmp: self.cmp.clone(),
            store: self.store.clone(),
            frozen: false,
        }
    }

    /// A clone with `key` bound to `value`.
    pub fn with(&self, key: K, value: V, overwrite: bool) -> Result<Self> {
        let mut tree = self.clone();
        tree.set(key, value, overwrite)?;
        Ok(tree)
    }

    /// A clone without `key`.
    pub fn without(&self, key: &K) -> Result<Self> {
        let mut tree = self.clone();
        tree.delete(key)?;
        Ok(tree)
    }

    /// A clone with every key present; new keys read the default value
    /// without materializing value storage.
    pub fn with_keys(&self, keys: impl IntoIterator<Item = K>) -> Result<Self> {
        let mut tree = self.clone();
        for key in keys {
            tree.set_impl(key, None, false)?;
        }
        Ok(tree)
    }

    pub fn without_keys<'a>(&self, keys: impl IntoIterator<Item = &'a K>) -> Result<Self>
    where
        K: 'a,
    {
        let mut tree = self.clone();
        for key in keys {
            tree.delete(key)?;
        }
        Ok(tree)
    }

    pub fn without_range(&self, lo: Option<&K>, hi: Option<&K>, include_hi: bool) -> Result<Self> {
        let mut tree = self.clone();
        tree.delete_range(lo, hi, include_hi)?;
        Ok(tree)
    }

    pub fn with_pairs(
        &self,
        pairs: impl IntoIterator<Item = (K, V)>,
        overwrite: bool,
    ) -> Result<Self> {
        let mut tree = self.clone();
        tree.set_pairs(pairs, overwrite)?;
        Ok(tree)
    }

    /// A clone keeping only the pairs the predicate accepts.
    pub fn filter(&self, mut pred: impl FnMut(&K, &V) -> bool) -> Result<Self> {
        let mut tree = self.clone();
        tree.edit_range::<Infallible, _>(None, None, true, |k, v, _| {
            if pred(k, v) {
                EditDirective::NoOp
            } else {
                EditDirective::Delete
            }
        })?;
        Ok(tree)
    }

    /// A clone with every value rewritten.
    pub fn map_values(&self, mut f: impl FnMut(&K, &V) -> V) -> Result<Self> {
        let mut tree = self.clone();
        tree.edit_range::<Infallible, _>(None, None, true, |k, v, _| {
            EditDirective::Replace(f(k, v))
        })?;
        Ok(tree)
    }

    // --- diff -------------------------------------------------------------

    /// Reports the pair-level difference against `other` without descending
    /// into shared subtrees. `only_this`/`only_other` fire for keys present
    /// on one side only, `different` for equal keys with unequal values. Any
    /// callback may break early with a value, which is then returned.
    ///
    /// Errors with [`TreeError::ComparatorMismatch`] before any callback
    /// fires when the trees' comparators are neither the same instance nor
    /// carry the same [order token](crate::Comparator::order_token).
    pub fn diff_against<R, FT, FO, FD>(
        &self,
        other: &Self,
        mut only_this: FT,
        mut only_other: FO,
        mut different: FD,
    ) -> Result<Option<R>>
    where
        V: PartialEq,
        FT: FnMut(&K, &V) -> ControlFlow<R>,
        FO: FnMut(&K, &V) -> ControlFlow<R>,
        FD: FnMut(&K, &V, &V) -> ControlFlow<R>,
    {
        diff::diff_trees(self, other, &mut only_this, &mut only_other, &mut different)
    }

    // --- freeze -----------------------------------------------------------

    /// Makes every mutating operation fail with [`TreeError::FrozenTree`]
    /// until [`Tree::unfreeze`].
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn unfreeze(&mut self) {
        self.frozen = false;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    // --- persistence ------------------------------------------------------

    /// Gives the tree a blob store to load from and commit to.
    pub fn attach_store(&mut self, store: Arc<dyn BlobStore>) {
        self.store = Some(store);
    }

    /// Walks the tree depth-first, writes every loaded node whose content id
    /// is not already in the store, and returns the root id. Unloaded nodes
    /// are saved by identity and skipped. Idempotent: an immediately
    /// repeated commit writes nothing.
    pub fn commit(&self) -> Result<BlobId> {
        let store = self.store.as_deref().ok_or(TreeError::NoStore)?;
        let ctx = self.op_ctx();
        let id = self.root.commit_into(store, &ctx)?;
        debug!("committed tree under root {}", id);
        Ok(id)
    }

    /// Replaces the tree's content with the committed tree under `root_id`.
    /// Nothing is fetched until nodes are touched; the pair count is
    /// recomputed on first use.
    pub fn load(&mut self, root_id: BlobId) -> Result<()> {
        self.ensure_mutable()?;
        if self.store.is_none() {
            return Err(TreeError::NoStore);
        }
        debug!("attached tree root {}", root_id);
        self.root = Arc::new(NodeRef::from_id(root_id));
        *self.len.get_mut() = None;
        Ok(())
    }
}

/// While the root is an internal node with at most one child, replace it by
/// that child (or the empty leaf). A shared ancestor collapsed away leaves
/// the new root marked shared.
fn collapse_root<K: KeyType, V: ValueType>(
    root: &mut Arc<NodeRef<K, V>>,
    ctx: &OpCtx<'_, K>,
) -> Result<()> {
    let mut was_shared = false;
    loop {
        was_shared |= root.is_shared();
        let action = {
            let node = root.read(ctx)?;
            match &*node {
                Node::Internal(branch) if branch.children.len() <= 1 => {
                    Some(branch.children.first().cloned())
                }
                _ => None,
            }
        };
        match action {
            None => break,
            Some(Some(child)) => {
                trace!("collapsing single-child root");
                *root = child;
            }
            Some(None) => {
                *root = empty_root();
                break;
            }
        }
    }
    if was_shared {
        root.mark_shared();
    }
    Ok(())
}

/// The pair at or below `key` (`inclusive` decides which); an unbounded key
/// yields the maximum pair.
fn pair_le<K: KeyType, V: ValueType>(
    nref: &Arc<NodeRef<K, V>>,
    key: Option<&K>,
    inclusive: bool,
    ctx: &OpCtx<'_, K>,
) -> Result<Option<(K, V)>> {
    let node = nref.read(ctx)?;
    match &*node {
        Node::Leaf(leaf) => {
            let index = match key {
                None => leaf.keys.len().checked_sub(1),
                Some(key) => match node::search(&leaf.keys, key, ctx)? {
                    Ok(i) => {
                        if inclusive {
                            Some(i)
                        } else {
                            i.checked_sub(1)
                        }
                    }
                    Err(i) => i.checked_sub(1),
                },
            };
            Ok(index.and_then(|i| leaf.pair_at(i)))
        }
        Node::Internal(branch) => {
            if branch.children.is_empty() {
                return Ok(None);
            }
            let start = match key {
                None => branch.children.len() - 1,
                Some(key) => match node::search(&branch.max_keys, key, ctx)? {
                    Ok(i) | Err(i) => i.min(branch.children.len() - 1),
                },
            };
            if let Some(pair) = pair_le(&branch.children[start], key, inclusive, ctx)? {
                return Ok(Some(pair));
            }
            // Everything under the left neighbor is strictly lower.
            if start > 0 {
                return branch.children[start - 1].read(ctx)?.max_pair(ctx);
            }
            Ok(None)
        }
    }
}

/// The pair at or above `key`; an unbounded key yields the minimum pair.
fn pair_ge<K: KeyType, V: ValueType>(
    nref: &Arc<NodeRef<K, V>>,
    key: Option<&K>,
    inclusive: bool,
    ctx: &OpCtx<'_, K>,
) -> Result<Option<(K, V)>> {
    let node = nref.read(ctx)?;
    match &*node {
        Node::Leaf(leaf) => {
            let index = match key {
                None => 0,
                Some(key) => match node::search(&leaf.keys, key, ctx)? {
                    Ok(i) => {
                        if inclusive {
                            i
                        } else {
                            i + 1
                        }
                    }
                    Err(i) => i,
                },
            };
            Ok(leaf.pair_at(index))
        }
        Node::Internal(branch) => {
            let start = match key {
                None => 0,
                Some(key) => match node::search(&branch.max_keys, key, ctx)? {
                    Ok(i) | Err(i) => i,
                },
            };
            if start >= branch.children.len() {
                return Ok(None);
            }
            if let Some(pair) = pair_ge(&branch.children[start], key, inclusive, ctx)? {
                return Ok(Some(pair));
            }
            // Everything under the right neighbor is strictly higher.
            if start + 1 < branch.children.len() {
                return branch.children[start + 1].read(ctx)?.min_pair(ctx);
            }
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_tree(fanout: usize, n: i32) -> Tree<i32, i32> {
        let mut tree = TreeOptions::new().fanout(fanout).build();
        for i in 0..n {
            tree.set(i, i * 10, true).unwrap();
        }
        tree
    }

    #[test]
    fn set_get_delete_round_trip() {
        let mut tree = small_tree(4, 50);
        tree.check_valid().unwrap();
        assert_eq!(tree.size().unwrap(), 50);
        assert_eq!(tree.get(&17).unwrap(), Some(170));
        assert!(tree.delete(&17).unwrap());
        assert!(!tree.delete(&17).unwrap());
        assert_eq!(tree.get(&17).unwrap(), None);
        assert_eq!(tree.size().unwrap(), 49);
        tree.check_valid().unwrap();
    }

    #[test]
    fn set_without_overwrite_is_a_noop() {
        let mut tree = small_tree(4, 4);
        assert!(!tree.set(2, 99, false).unwrap());
        assert_eq!(tree.get(&2).unwrap(), Some(20));
        assert!(!tree.set(2, 99, true).unwrap());
        assert_eq!(tree.get(&2).unwrap(), Some(99));
    }

    #[test]
    fn unorderable_key_is_rejected_without_damage() {
        let mut tree: Tree<f64, i32> =
            TreeOptions::with_comparator(Arc::new(crate::compare::PartialOrdComparator)).build();
        tree.set(1.0, 1, true).unwrap();
        assert!(matches!(
            tree.set(f64::NAN, 2, true),
            Err(TreeError::UnorderableKey)
        ));
        assert_eq!(tree.size().unwrap(), 1);
        tree.check_valid().unwrap();
    }

    #[test]
    fn frozen_tree_rejects_mutation() {
        let mut tree = small_tree(4, 4);
        tree.freeze();
        assert!(matches!(tree.set(9, 9, true), Err(TreeError::FrozenTree)));
        assert!(matches!(tree.delete(&1), Err(TreeError::FrozenTree)));
        assert!(tree.is_frozen());
        // Persistent variants still work from a frozen tree.
        let bigger = tree.with(9, 90, true).unwrap();
        assert_eq!(bigger.get(&9).unwrap(), Some(90));
        tree.unfreeze();
        assert!(tree.set(9, 9, true).unwrap());
    }

    #[test]
    fn height_grows_with_splits() {
        let tree = small_tree(4, 64);
        assert!(tree.height().unwrap() >= 2);
        tree.check_valid().unwrap();
    }

    #[test]
    fn descending_inserts_pack_via_right_shifts() {
        // Keys arriving in descending order always hit the first child, so
        // only the shift toward the right sibling can keep nodes full.
        let mut tree: Tree<i32, i32> = TreeOptions::new().fanout(4).build();
        for i in (0..64).rev() {
            tree.set(i, i * 10, true).unwrap();
        }
        assert_eq!(tree.size().unwrap(), 64);
        assert_eq!(tree.keys().unwrap(), (0..64).collect::<Vec<_>>());
        // Mirrors the ascending case: packed nodes keep the tree shallow.
        assert_eq!(tree.height().unwrap(), 2);
        tree.check_valid().unwrap();
    }

    #[test]
    fn shifts_do_not_displace_an_updated_key() {
        // Updating a full child's own max must not shift that entry away.
        let mut tree: Tree<i32, i32> = TreeOptions::new().fanout(4).build();
        for i in 0..32 {
            tree.set(i, i, true).unwrap();
        }
        for i in 0..32 {
            assert!(!tree.set(i, -i, true).unwrap());
        }
        assert_eq!(tree.size().unwrap(), 32);
        for i in 0..32 {
            assert_eq!(tree.get(&i).unwrap(), Some(-i), "key {}", i);
        }
        tree.check_valid().unwrap();
    }

    #[test]
    fn root_collapses_after_mass_delete() {
        let mut tree = small_tree(4, 64);
        assert_eq!(tree.delete_range(Some(&0), Some(&62), true).unwrap(), 63);
        assert_eq!(tree.height().unwrap(), 0);
        assert_eq!(tree.pairs().unwrap(), vec![(63, 630)]);
        tree.check_valid().unwrap();
    }

    #[test]
    fn edit_range_directives_combine() {
        let mut tree = small_tree(4, 10);
        let flow = tree
            .edit_range(Some(&2), Some(&8), true, |k, _, _| {
                if *k == 5 {
                    EditDirective::ReplaceAndBreak(-1, "stopped")
                } else if *k % 2 == 0 {
                    EditDirective::Delete
                } else {
                    EditDirective::NoOp
                }
            })
            .unwrap();
        assert_eq!(flow, ControlFlow::Break("stopped"));
        assert_eq!(tree.get(&5).unwrap(), Some(-1));
        assert_eq!(tree.get(&2).unwrap(), None);
        assert_eq!(tree.get(&4).unwrap(), None);
        // Pairs past the break point were never visited.
        assert_eq!(tree.get(&6).unwrap(), Some(60));
        tree.check_valid().unwrap();
    }

    #[test]
    fn neighbor_lookups() {
        let tree: Tree<i32, i32> = Tree::from_pairs(vec![(10, 1), (20, 2), (30, 3)]).unwrap();
        assert_eq!(
            tree.get_pair_or_next_lower(Some(&25)).unwrap(),
            Some((20, 2))
        );
        assert_eq!(
            tree.get_pair_or_next_lower(Some(&20)).unwrap(),
            Some((20, 2))
        );
        assert_eq!(tree.next_lower_pair(Some(&20)).unwrap(), Some((10, 1)));
        assert_eq!(
            tree.get_pair_or_next_higher(Some(&25)).unwrap(),
            Some((30, 3))
        );
        assert_eq!(tree.next_higher_pair(Some(&30)).unwrap(), None);
        assert_eq!(tree.next_lower_pair(None).unwrap(), Some((30, 3)));
        assert_eq!(tree.next_higher_pair(None).unwrap(), Some((10, 1)));
    }

    #[test]
    fn clone_is_independent() {
        let mut tree = small_tree(4, 32);
        let snapshot = tree.clone();
        tree.delete_range(Some(&0), Some(&15), true).unwrap();
        tree.set(100, 1000, true).unwrap();
        assert_eq!(snapshot.size().unwrap(), 32);
        assert_eq!(snapshot.get(&3).unwrap(), Some(30));
        assert_eq!(snapshot.get(&100).unwrap(), None);
        snapshot.check_valid().unwrap();
        tree.check_valid().unwrap();
    }

    #[test]
    fn greedy_clone_is_independent() {
        let mut tree = small_tree(4, 32);
        let eager = tree.greedy_clone(false);
        tree.delete_range(None, None, true).unwrap();
        assert_eq!(eager.size().unwrap(), 32);
        eager.check_valid().unwrap();
    }

    #[test]
    fn map_values_and_filter() {
        let tree = small_tree(4, 10);
        let doubled = tree.map_values(|_, v| v * 2).unwrap();
        assert_eq!(doubled.get(&3).unwrap(), Some(60));
        let evens = tree.filter(|k, _| k % 2 == 0).unwrap();
        assert_eq!(evens.keys().unwrap(), vec![0, 2, 4, 6, 8]);
        // The source tree is untouched.
        assert_eq!(tree.size().unwrap(), 10);
    }
}
