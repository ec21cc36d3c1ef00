//! The on-blob node format.
//!
//! A node serializes to `{"type": "leaf"|"branch", "keys": [...],
//! "values": [...]?, "children": [id, ...]?}` in JSON. serde emits struct
//! fields in declaration order, so the encoding is canonical and two nodes
//! with equal logical content hash identically.

use super::{handle::NodeRef, internal::InternalNode, leaf::LeafNode, node::Node};
use crate::{
    compare::Comparator,
    error::{Result, StoreError, TreeError},
    store::BlobId,
    KeyType, ValueType,
};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, sync::Arc};

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum RecordRef<'a, K, V> {
    Leaf {
        keys: &'a [K],
        #[serde(skip_serializing_if = "Option::is_none")]
        values: Option<&'a [V]>,
    },
    Branch {
        keys: &'a [K],
        children: &'a [BlobId],
    },
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum Record<K, V> {
    Leaf {
        keys: Vec<K>,
        #[serde(default = "Option::default")]
        values: Option<Vec<V>>,
    },
    Branch {
        keys: Vec<K>,
        children: Vec<BlobId>,
    },
}

/// Serializes a node to its canonical bytes. For internal nodes the caller
/// supplies the already-committed child ids in slot order.
pub(crate) fn pack<K: KeyType, V: ValueType>(node: &Node<K, V>, child_ids: &[BlobId]) -> Result<Vec<u8>> {
    let record = match node {
        Node::Leaf(leaf) => RecordRef::Leaf {
            keys: &leaf.keys,
            values: leaf.values.materialized(),
        },
        Node::Internal(branch) => {
            debug_assert_eq!(child_ids.len(), branch.children.len());
            RecordRef::Branch {
                keys: &branch.max_keys,
                children: child_ids,
            }
        }
    };
    Ok(serde_json::to_vec(&record).map_err(StoreError::Codec)?)
}

/// Parses a blob back into a node, validating the structural invariants; a
/// record that violates them aborts the load as corrupt.
pub(crate) fn unpack<K: KeyType, V: ValueType>(
    bytes: &[u8],
    cmp: &dyn Comparator<K>,
) -> Result<Node<K, V>> {
    let corrupt = |reason: &str| TreeError::CorruptNode {
        reason: reason.to_string(),
    };
    let record: Record<K, V> = serde_json::from_slice(bytes).map_err(|e| TreeError::CorruptNode {
        reason: e.to_string(),
    })?;
    let check_sorted = |keys: &[K]| -> Result<()> {
        for pair in keys.windows(2) {
            match cmp.try_cmp(&pair[0], &pair[1]) {
                Some(Ordering::Less) => {}
                Some(_) => return Err(corrupt("keys out of order")),
                None => return Err(corrupt("unorderable key")),
            }
        }
        Ok(())
    };
    match record {
        Record::Leaf { keys, values } => {
            if let Some(values) = &values {
                if values.len() != keys.len() {
                    return Err(corrupt("value count does not match key count"));
                }
            }
            check_sorted(&keys)?;
            Ok(Node::Leaf(LeafNode::from_stored(keys, values)))
        }
        Record::Branch { keys, children } => {
            if children.is_empty() {
                return Err(corrupt("branch without children"));
            }
            if children.len() != keys.len() {
                return Err(corrupt("child count does not match key count"));
            }
            check_sorted(&keys)?;
            let children = children
                .into_iter()
                .map(|id| Arc::new(NodeRef::from_id(id)))
                .collect();
            Ok(Node::Internal(InternalNode::from_stored(children, keys)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::OrdComparator;

    type N = Node<String, i64>;

    #[test]
    fn leaf_blob_shape() {
        let leaf: N = Node::Leaf(LeafNode::from_stored(
            vec!["a".into(), "b".into()],
            Some(vec![1, 2]),
        ));
        let bytes = pack(&leaf, &[]).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"type":"leaf","keys":["a","b"],"values":[1,2]}"#
        );
    }

    #[test]
    fn keys_only_leaf_omits_values() {
        let leaf: N = Node::Leaf(LeafNode::from_stored(vec!["a".into()], None));
        let bytes = pack(&leaf, &[]).unwrap();
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"{"type":"leaf","keys":["a"]}"#
        );
    }

    #[test]
    fn round_trip_and_determinism() {
        let leaf: N = Node::Leaf(LeafNode::from_stored(
            vec!["k1".into(), "k2".into()],
            Some(vec![7, 8]),
        ));
        let bytes = pack(&leaf, &[]).unwrap();
        let again = pack(&unpack::<String, i64>(&bytes, &OrdComparator).unwrap(), &[]).unwrap();
        assert_eq!(bytes, again);
        assert_eq!(BlobId::of(&bytes), BlobId::of(&again));
    }

    #[test]
    fn branch_round_trip() {
        let ids = vec![BlobId::of(b"left"), BlobId::of(b"right")];
        let json = format!(
            r#"{{"type":"branch","keys":["m","z"],"children":["{}","{}"]}}"#,
            ids[0], ids[1]
        );
        match unpack::<String, i64>(json.as_bytes(), &OrdComparator).unwrap() {
            Node::Internal(branch) => {
                assert_eq!(branch.max_keys, vec!["m".to_string(), "z".to_string()]);
                assert_eq!(branch.children[1].saved_id(), Some(ids[1].clone()));
            }
            _ => panic!("expected a branch"),
        }
    }

    #[test]
    fn rejects_unsorted_keys() {
        let json = r#"{"type":"leaf","keys":["b","a"]}"#;
        assert!(matches!(
            unpack::<String, i64>(json.as_bytes(), &OrdComparator),
            Err(TreeError::CorruptNode { .. })
        ));
    }

    #[test]
    fn rejects_length_mismatch() {
        let json = r#"{"type":"leaf","keys":["a","b"],"values":[1]}"#;
        assert!(matches!(
            unpack::<String, i64>(json.as_bytes(), &OrdComparator),
            Err(TreeError::CorruptNode { .. })
        ));
    }
}
