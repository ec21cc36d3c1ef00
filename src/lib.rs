//! An ordered key-value container backed by an in-memory B+ tree with two
//! extra capabilities layered on top:
//!
//! * **O(1) copy-on-write clones.** [`Tree::clone`] shares every node with
//!   the original; either side may keep mutating and only the touched paths
//!   are copied.
//! * **Content-addressed persistence.** [`Tree::commit`] serializes each
//!   dirty node, hashes it, and writes it to a [`BlobStore`] under its
//!   content id; [`Tree::load`] attaches a committed root id and rehydrates
//!   nodes lazily as they are touched, so reopening a large tree does not
//!   materialize unused subtrees.
//!
//! Keys are opaque to the engine apart from the [`Comparator`] supplied at
//! construction. A single tree instance is owned by one logical task at a
//! time; clones are independent once `clone` returns.
//!
//! ```
//! use cobtree::Tree;
//!
//! let mut tree: Tree<i32, String> = Tree::new();
//! tree.set(1, "one".into(), true).unwrap();
//! let snapshot = tree.clone();
//! tree.delete(&1).unwrap();
//! assert_eq!(snapshot.get(&1).unwrap().as_deref(), Some("one"));
//! ```

#[macro_use]
extern crate log;

use serde::{de::DeserializeOwned, Serialize};

mod compare;
mod error;
pub mod store;
mod tree;

pub use crate::{
    compare::{Comparator, OrdComparator, PartialOrdComparator, Reverse},
    error::{Result, StoreError, TreeError},
    store::{BlobId, BlobStore, FsStore, MemoryStore},
    tree::{EditDirective, Tree, TreeOptions},
};

/// Marker trait for key types.
///
/// The serde bounds exist because any node may round-trip through the blob
/// store; they cost nothing for trees that never persist.
pub trait KeyType: Clone + Serialize + DeserializeOwned + 'static {}
impl<T: Clone + Serialize + DeserializeOwned + 'static> KeyType for T {}

/// Marker trait for value types.
///
/// `Default` supplies the logical content of value slots that were stored in
/// keys-only form.
pub trait ValueType: Clone + Default + Serialize + DeserializeOwned + 'static {}
impl<T: Clone + Default + Serialize + DeserializeOwned + 'static> ValueType for T {}

#[cfg(feature = "init_env_logger")]
/// Initializes `env_logger` once; convenient for demos and tests.
pub fn init_env_logger() {
    let _ = env_logger::builder().is_test(false).try_init();
}
