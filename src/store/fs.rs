//! Filesystem-backed blob store.

use super::{BlobId, BlobStore};
use crate::error::StoreError;
use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

/// Stores each blob as a file below a root directory.
///
/// The layout shards by the first four hex nibbles of the id read as a 16-bit
/// integer, split into three mod-256 components (low byte, next byte, next
/// byte), giving `<root>/<dir1>/<dir2>/<dir3>/<id>.json`.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Opens a store rooted at `root`, creating the directory if needed.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(FsStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, id: &BlobId) -> PathBuf {
        let bytes = id.bytes();
        let v = u32::from(bytes[0]) << 8 | u32::from(bytes[1]);
        let dir1 = v & 0xff;
        let dir2 = (v >> 8) & 0xff;
        let dir3 = (v >> 16) & 0xff;
        self.root
            .join(dir1.to_string())
            .join(dir2.to_string())
            .join(dir3.to_string())
            .join(format!("{}.json", id))
    }
}

impl BlobStore for FsStore {
    fn get(&self, id: &BlobId) -> Result<Option<Vec<u8>>, StoreError> {
        match fs::read(self.blob_path(id)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, id: &BlobId, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.blob_path(id);
        if path.exists() {
            // Ids are content hashes, an existing blob is already correct.
            return Ok(());
        }
        fs::create_dir_all(path.parent().expect("blob path has a parent"))?;
        fs::write(path, bytes)?;
        Ok(())
    }

    fn contains(&self, id: &BlobId) -> Result<bool, StoreError> {
        Ok(self.blob_path(id).exists())
    }
}
