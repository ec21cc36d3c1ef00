//! Content-addressed blob stores.
//!
//! The tree persists nodes as opaque byte blobs keyed by the lowercase-hex
//! rendering of a 256-bit content hash. Any byte-addressed key/value store
//! satisfying [`BlobStore`] works; this module ships an in-memory store and a
//! filesystem-backed one ([`FsStore`]).

use crate::error::StoreError;
use parking_lot::RwLock;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{collections::HashMap, fmt};

mod fs;

pub use fs::FsStore;

/// The identifier of a stored node blob: a 256-bit cryptographic hash of its
/// canonical serialization, rendered as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BlobId([u8; 32]);

impl BlobId {
    /// Computes the content id of `bytes`.
    pub fn of(bytes: &[u8]) -> Self {
        BlobId(*blake3::hash(bytes).as_bytes())
    }

    /// Parses a lowercase-hex id string.
    pub fn from_hex(s: &str) -> Result<Self, StoreError> {
        let mut raw = [0u8; 32];
        if s.len() != 64 || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(StoreError::MalformedId(s.to_string()));
        }
        hex::decode_to_slice(s, &mut raw)
            .map_err(|_| StoreError::MalformedId(s.to_string()))?;
        Ok(BlobId(raw))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub(crate) fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for BlobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobId({})", self.to_hex())
    }
}

impl Serialize for BlobId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlobId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlobId::from_hex(&s).map_err(de::Error::custom)
    }
}

/// A byte-addressed content store.
///
/// `put` must be idempotent for a given id, and `get` must return exactly the
/// bytes previously written. The store is shared across trees and must be
/// safe for the host's chosen concurrency; nothing beyond that is assumed.
pub trait BlobStore: Send + Sync {
    fn get(&self, id: &BlobId) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, id: &BlobId, bytes: &[u8]) -> Result<(), StoreError>;
    fn contains(&self, id: &BlobId) -> Result<bool, StoreError>;
}

/// A heap-backed store, mainly for tests and ephemeral hosts.
#[derive(Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<BlobId, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs currently held.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobStore for MemoryStore {
    fn get(&self, id: &BlobId) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.blobs.read().get(id).cloned())
    }

    fn put(&self, id: &BlobId, bytes: &[u8]) -> Result<(), StoreError> {
        self.blobs.write().insert(id.clone(), bytes.to_vec());
        Ok(())
    }

    fn contains(&self, id: &BlobId) -> Result<bool, StoreError> {
        Ok(self.blobs.read().contains_key(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_hex_round_trip() {
        let id = BlobId::of(b"hello");
        let hexed = id.to_hex();
        assert_eq!(hexed.len(), 64);
        assert_eq!(BlobId::from_hex(&hexed).unwrap(), id);
    }

    #[test]
    fn id_rejects_uppercase_and_bad_lengths() {
        assert!(BlobId::from_hex(&"AB".repeat(32)).is_err());
        assert!(BlobId::from_hex(&"zz".repeat(32)).is_err());
        assert!(BlobId::from_hex("abcd").is_err());
    }

    #[test]
    fn memory_store_round_trip() {
        let store = MemoryStore::new();
        let id = BlobId::of(b"payload");
        assert!(!store.contains(&id).unwrap());
        store.put(&id, b"payload").unwrap();
        store.put(&id, b"payload").unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&id).unwrap().unwrap(), b"payload");
    }
}
