//! CAR file-backed block storage

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::car::CarMode;
use crate::error::Result;
use crate::storage::{BlockMap, BlockStore, check_block};
use atrepo_common::IpldCid;
use atrepo_common::cid::cid_for_cbor;

/// CAR file-backed block storage
///
/// Loads the entire CAR file into memory on construction and writes it
/// back on [`flush`](Self::flush). The CAR roots hold the current commit.
#[derive(Debug, Clone)]
pub struct FileBlockStore {
    path: PathBuf,
    blocks: Arc<RwLock<BlockMap>>,
    roots: Arc<RwLock<Vec<IpldCid>>>,
    dirty: Arc<AtomicBool>,
}

impl FileBlockStore {
    /// Load from an existing CAR file
    ///
    /// Blocks are CID-checked on the way in; `mode` decides whether a bad
    /// block fails the load or is left out.
    pub async fn load(path: impl Into<PathBuf>, mode: CarMode) -> Result<Self> {
        let path = path.into();
        let parsed = crate::car::read_car(&path, mode).await?;

        Ok(Self {
            path,
            blocks: Arc::new(RwLock::new(parsed.blocks)),
            roots: Arc::new(RwLock::new(parsed.roots)),
            dirty: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Create new, empty CAR file storage
    ///
    /// The file is not created until the first flush.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            blocks: Arc::new(RwLock::new(BlockMap::new())),
            roots: Arc::new(RwLock::new(Vec::new())),
            dirty: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Get the CAR file roots
    pub fn roots(&self) -> Vec<IpldCid> {
        self.roots.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Set the CAR file roots
    ///
    /// Marks the storage dirty; call `flush()` to persist the change.
    pub fn set_roots(&self, new_roots: Vec<IpldCid>) {
        *self.roots.write().unwrap_or_else(|e| e.into_inner()) = new_roots;
        self.dirty.store(true, Ordering::Release);
    }

    /// Write blocks back to the CAR file if anything changed
    pub async fn flush(&self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }

        let blocks = self.blocks.read().unwrap_or_else(|e| e.into_inner()).clone();
        let roots = self.roots();
        crate::car::write_car(&self.path, roots, blocks).await?;

        self.dirty.store(false, Ordering::Release);
        Ok(())
    }

    /// Check if store has unflushed changes
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Get the path to the CAR file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn insert(&self, cid: IpldCid, data: Bytes) {
        let mut store = self.blocks.write().unwrap_or_else(|e| e.into_inner());
        if !store.contains_key(&cid) {
            store.insert(cid, data);
            self.dirty.store(true, Ordering::Release);
        }
    }
}

impl BlockStore for FileBlockStore {
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        Ok(self
            .blocks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(cid)
            .cloned())
    }

    async fn put(&self, data: &[u8]) -> Result<IpldCid> {
        let cid = cid_for_cbor(data)?;
        self.insert(cid, Bytes::copy_from_slice(data));
        Ok(cid)
    }

    async fn put_block(&self, cid: IpldCid, data: Bytes) -> Result<()> {
        check_block(&cid, &data)?;
        self.insert(cid, data);
        Ok(())
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self
            .blocks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(cid))
    }

    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()> {
        let blocks: Vec<_> = blocks.into_iter().collect();
        for (cid, data) in &blocks {
            check_block(cid, data)?;
        }
        for (cid, data) in blocks {
            self.insert(cid, data);
        }
        Ok(())
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let store = self.blocks.read().unwrap_or_else(|e| e.into_inner());
        Ok(cids.iter().map(|cid| store.get(cid).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[tokio::test]
    async fn test_new_empty_store() {
        let temp_file = NamedTempFile::new().unwrap();
        let storage = FileBlockStore::new(temp_file.path());

        assert!(storage.roots().is_empty());
        assert!(!storage.is_dirty());
        assert_eq!(storage.path(), temp_file.path());
    }

    #[tokio::test]
    async fn test_put_marks_dirty_once() {
        let temp_file = NamedTempFile::new().unwrap();
        let storage = FileBlockStore::new(temp_file.path());

        let cid = storage.put(b"\x01").await.unwrap();
        assert!(storage.is_dirty());
        storage.flush().await.unwrap();
        assert!(!storage.is_dirty());

        // same block again changes nothing
        assert_eq!(storage.put(b"\x01").await.unwrap(), cid);
        assert!(!storage.is_dirty());
    }

    #[tokio::test]
    async fn test_flush_and_reload() {
        let temp_file = NamedTempFile::new().unwrap();

        let storage = FileBlockStore::new(temp_file.path());
        let cid1 = storage.put(b"\x63one").await.unwrap();
        let cid2 = storage.put(b"\x63two").await.unwrap();

        storage.set_roots(vec![cid1]);
        storage.flush().await.unwrap();

        let storage2 = FileBlockStore::load(temp_file.path(), CarMode::Strict)
            .await
            .unwrap();

        assert_eq!(storage2.roots(), vec![cid1]);
        assert_eq!(storage2.get(&cid1).await.unwrap().unwrap().as_ref(), b"\x63one");
        assert_eq!(storage2.get(&cid2).await.unwrap().unwrap().as_ref(), b"\x63two");
        assert!(!storage2.is_dirty());
    }

    #[tokio::test]
    async fn test_put_many_checks_cids() {
        let temp_file = NamedTempFile::new().unwrap();
        let storage = FileBlockStore::new(temp_file.path());

        let cid1 = cid_for_cbor(b"data 1").unwrap();
        let wrong = cid_for_cbor(b"data 3").unwrap();

        assert!(
            storage
                .put_many(vec![(wrong, Bytes::from_static(b"data 2"))])
                .await
                .is_err()
        );
        assert!(!storage.is_dirty());

        storage
            .put_many(vec![(cid1, Bytes::from_static(b"data 1"))])
            .await
            .unwrap();
        assert!(storage.is_dirty());

        let results = storage.get_many(&[cid1, wrong]).await.unwrap();
        assert_eq!(results[0].as_deref(), Some(&b"data 1"[..]));
        assert!(results[1].is_none());
    }
}
