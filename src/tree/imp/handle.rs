//! The node handle: the indirection point between in-memory nodes and their
//! content-addressed blobs.
//!
//! A handle is in one of three states: loaded and never saved, loaded with a
//! known content id (`saved`), or unloaded with only the id. Every access to
//! an unloaded handle fetches the blob, parses it, and upgrades the handle in
//! place; the shared flag lives on the handle so a node referenced by two
//! trees clones-before-mutate even if it was unloaded when the trees split.

use super::{internal::InternalNode, node::Node, packed, OpCtx};
use crate::{
    error::{Result, StoreError, TreeError},
    store::{BlobId, BlobStore},
    KeyType, ValueType,
};
use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::sync::{
    atomic::{AtomicBool, Ordering as AtomicOrdering},
    Arc,
};

pub(crate) struct NodeRef<K, V> {
    shared: AtomicBool,
    state: RwLock<NodeState<K, V>>,
}

pub(crate) enum NodeState<K, V> {
    Loaded {
        node: Node<K, V>,
        /// Content id of the node as of the last load or commit; `None` once
        /// the node has been mutated since.
        saved: Option<BlobId>,
    },
    Unloaded(BlobId),
}

impl<K, V> NodeRef<K, V> {
    /// Wraps a freshly constructed node.
    pub fn from_node(node: Node<K, V>) -> Self {
        Self::from_node_saved(node, None)
    }

    pub fn from_node_saved(node: Node<K, V>, saved: Option<BlobId>) -> Self {
        NodeRef {
            shared: AtomicBool::new(false),
            state: RwLock::new(NodeState::Loaded { node, saved }),
        }
    }

    /// Wraps a known content id without fetching anything.
    pub fn from_id(id: BlobId) -> Self {
        NodeRef {
            shared: AtomicBool::new(false),
            state: RwLock::new(NodeState::Unloaded(id)),
        }
    }

    pub fn is_shared(&self) -> bool {
        self.shared.load(AtomicOrdering::Acquire)
    }

    pub fn mark_shared(&self) {
        self.shared.store(true, AtomicOrdering::Release);
    }

    /// The content id under which this handle's current bytes are stored, if
    /// it has not been mutated since the last load or commit.
    pub fn saved_id(&self) -> Option<BlobId> {
        match &*self.state.read() {
            NodeState::Loaded { saved, .. } => saved.clone(),
            NodeState::Unloaded(id) => Some(id.clone()),
        }
    }

}

impl<K: KeyType, V: ValueType> NodeRef<K, V> {
    /// Upgrades an unloaded handle by fetching and parsing its blob.
    ///
    /// Once loaded a handle never goes back to unloaded, so the fast path is
    /// a read lock; the write lock is only taken for the actual transition.
    pub fn ensure_loaded(&self, ctx: &OpCtx<'_, K>) -> Result<()> {
        if matches!(&*self.state.read(), NodeState::Loaded { .. }) {
            return Ok(());
        }
        let mut state = self.state.write();
        if let NodeState::Unloaded(id) = &*state {
            let store = ctx.store.ok_or(TreeError::NoStore)?;
            let bytes = store
                .get(id)?
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            let node = packed::unpack(&bytes, ctx.cmp)?;
            trace!("loaded node {}", id);
            *state = NodeState::Loaded {
                node,
                saved: Some(id.clone()),
            };
        }
        Ok(())
    }

    /// Read access to the node, loading it first if necessary.
    pub fn read(&self, ctx: &OpCtx<'_, K>) -> Result<MappedRwLockReadGuard<'_, Node<K, V>>> {
        self.ensure_loaded(ctx)?;
        Ok(RwLockReadGuard::map(self.state.read(), |s| match s {
            NodeState::Loaded { node, .. } => node,
            NodeState::Unloaded(_) => unreachable!("loaded handles never unload"),
        }))
    }

    /// Write access for mutation; forgets the saved id since the content is
    /// about to diverge from it.
    pub fn write(&self, ctx: &OpCtx<'_, K>) -> Result<MappedRwLockWriteGuard<'_, Node<K, V>>> {
        self.ensure_loaded(ctx)?;
        Ok(RwLockWriteGuard::map(self.state.write(), |s| match s {
            NodeState::Loaded { node, saved } => {
                *saved = None;
                node
            }
            NodeState::Unloaded(_) => unreachable!("loaded handles never unload"),
        }))
    }

    /// Takes the node out of a handle that is about to be discarded, cloning
    /// it when the handle is still referenced elsewhere.
    pub fn take_or_clone_node(self: Arc<Self>, ctx: &OpCtx<'_, K>) -> Result<Node<K, V>> {
        self.ensure_loaded(ctx)?;
        match Arc::try_unwrap(self) {
            Ok(this) => match this.state.into_inner() {
                NodeState::Loaded { node, .. } => Ok(node),
                NodeState::Unloaded(_) => unreachable!("loaded handles never unload"),
            },
            Err(shared) => Ok(shared.read(ctx)?.clone()),
        }
    }

    /// Depth-first commit: children first, then this node's bytes.
    ///
    /// A handle whose recomputed id equals its saved id is skipped without
    /// touching the store; otherwise the blob is written only when the store
    /// does not already contain it. Unloaded handles are saved by identity.
    pub fn commit_into(&self, store: &dyn BlobStore, ctx: &OpCtx<'_, K>) -> Result<BlobId> {
        let children = {
            let state = self.state.read();
            match &*state {
                NodeState::Unloaded(id) => return Ok(id.clone()),
                NodeState::Loaded { node, .. } => match node {
                    Node::Leaf(_) => None,
                    Node::Internal(branch) => Some(branch.children.clone()),
                },
            }
        };
        let child_ids = match children {
            None => Vec::new(),
            Some(children) => children
                .iter()
                .map(|c| c.commit_into(store, ctx))
                .collect::<Result<Vec<_>>>()?,
        };

        let mut state = self.state.write();
        match &mut *state {
            NodeState::Unloaded(id) => Ok(id.clone()),
            NodeState::Loaded { node, saved } => {
                let bytes = packed::pack(node, &child_ids)?;
                let id = BlobId::of(&bytes);
                if saved.as_ref() != Some(&id) {
                    if !store.contains(&id)? {
                        store.put(&id, &bytes)?;
                        trace!("wrote node {}", id);
                    }
                    *saved = Some(id.clone());
                }
                Ok(id)
            }
        }
    }
}

/// Clone-on-write: if `slot` is shared, replace it with a private copy whose
/// children are marked shared (they stay reachable from the other tree).
///
/// The copy keeps the original's saved id; equal content hashes identically.
pub(crate) fn make_exclusive<K: KeyType, V: ValueType>(
    slot: &mut Arc<NodeRef<K, V>>,
    ctx: &OpCtx<'_, K>,
) -> Result<()> {
    if !slot.is_shared() {
        return Ok(());
    }
    slot.ensure_loaded(ctx)?;
    let (node, saved) = {
        let state = slot.state.read();
        match &*state {
            NodeState::Loaded { node, saved } => (node.clone_for_write(), saved.clone()),
            NodeState::Unloaded(_) => unreachable!("loaded handles never unload"),
        }
    };
    *slot = Arc::new(NodeRef::from_node_saved(node, saved));
    Ok(())
}

/// Eager clone of a subtree. Handles that are already shared stay shared
/// references (unless `force`); everything else is duplicated, so the copy
/// propagates no new shared-ness into the source tree. Unloaded handles get
/// a fresh handle onto the same blob, which shares storage but no memory.
pub(crate) fn greedy_clone_ref<K: Clone, V: Clone>(
    nref: &Arc<NodeRef<K, V>>,
    force: bool,
) -> Arc<NodeRef<K, V>> {
    if nref.is_shared() && !force {
        return nref.clone();
    }
    let state = nref.state.read();
    match &*state {
        NodeState::Unloaded(id) => Arc::new(NodeRef::from_id(id.clone())),
        NodeState::Loaded { node, saved } => {
            let copy = match node {
                Node::Leaf(leaf) => Node::Leaf(leaf.clone()),
                Node::Internal(branch) => Node::Internal(InternalNode::from_stored(
                    branch
                        .children
                        .iter()
                        .map(|child| greedy_clone_ref(child, force))
                        .collect(),
                    branch.max_keys.clone(),
                )),
            };
            Arc::new(NodeRef::from_node_saved(copy, saved.clone()))
        }
    }
}

impl<K, V> std::fmt::Debug for NodeRef<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = match &*self.state.read() {
            NodeState::Loaded { saved: Some(_), .. } => "loaded+saved",
            NodeState::Loaded { saved: None, .. } => "loaded",
            NodeState::Unloaded(_) => "unloaded",
        };
        write!(f, "NodeRef({}, shared={})", state, self.is_shared())
    }
}
