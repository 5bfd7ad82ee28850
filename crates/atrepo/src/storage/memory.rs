//! In-memory block storage implementation

use crate::error::Result;
use crate::storage::{BlockMap, BlockStore, check_block};
use atrepo_common::IpldCid;
use atrepo_common::cid::cid_for_cbor;
use bytes::Bytes;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// In-memory block storage
///
/// Backs tests, proof verification scratch space, and small repositories
/// that fit in memory. Clones share the same map.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    blocks: Arc<RwLock<BlockMap>>,
}

impl MemoryBlockStore {
    /// Create new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a memory store holding exactly these blocks
    ///
    /// Blocks are taken as given; callers that did not produce them should
    /// go through [`BlockStore::put_many`] instead.
    pub fn new_from_blocks(blocks: BlockMap) -> Self {
        Self {
            blocks: Arc::new(RwLock::new(blocks)),
        }
    }

    // A panic while holding the lock cannot leave a half-written entry, so
    // a poisoned lock is still usable.
    fn read(&self) -> RwLockReadGuard<'_, BlockMap> {
        self.blocks.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BlockMap> {
        self.blocks.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Get number of blocks stored
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Check if store is empty
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Snapshot of every block
    pub fn blocks(&self) -> BlockMap {
        self.read().clone()
    }

    /// Overwrite a block without checking its CID
    #[cfg(test)]
    pub(crate) fn put_unchecked(&self, cid: IpldCid, data: impl Into<Bytes>) {
        self.write().insert(cid, data.into());
    }
}

impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        Ok(self.read().get(cid).cloned())
    }

    async fn put(&self, data: &[u8]) -> Result<IpldCid> {
        let cid = cid_for_cbor(data)?;
        self.write()
            .entry(cid)
            .or_insert_with(|| Bytes::copy_from_slice(data));
        Ok(cid)
    }

    async fn put_block(&self, cid: IpldCid, data: Bytes) -> Result<()> {
        check_block(&cid, &data)?;
        self.write().entry(cid).or_insert(data);
        Ok(())
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self.read().contains_key(cid))
    }

    async fn put_many(&self, blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send) -> Result<()> {
        let blocks: Vec<_> = blocks.into_iter().collect();
        for (cid, data) in &blocks {
            check_block(cid, data)?;
        }
        let mut store = self.write();
        for (cid, data) in blocks {
            store.entry(cid).or_insert(data);
        }
        Ok(())
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let store = self.read();
        Ok(cids.iter().map(|cid| store.get(cid).cloned()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepoErrorKind;

    #[tokio::test]
    async fn test_put_and_get() {
        let store = MemoryBlockStore::new();
        let data = b"test data";

        let cid = store.put(data).await.unwrap();
        let retrieved = store.get(&cid).await.unwrap();

        assert_eq!(retrieved.as_deref(), Some(&data[..]));
    }

    #[tokio::test]
    async fn test_has() {
        let store = MemoryBlockStore::new();
        let cid = store.put(b"test data").await.unwrap();
        assert!(store.has(&cid).await.unwrap());

        let other = cid_for_cbor(b"not stored").unwrap();
        assert!(!store.has(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let store = MemoryBlockStore::new();
        let a = store.put(b"same").await.unwrap();
        let b = store.put(b"same").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_put_many_rejects_mismatch() {
        let store = MemoryBlockStore::new();

        let cid1 = cid_for_cbor(b"data1").unwrap();
        let cid2 = cid_for_cbor(b"data2").unwrap();

        let err = store
            .put_many(vec![
                (cid1, Bytes::from_static(b"data1")),
                (cid2, Bytes::from_static(b"data3")),
            ])
            .await
            .unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::CidMismatch);
        assert!(store.is_empty());

        store
            .put_many(vec![
                (cid1, Bytes::from_static(b"data1")),
                (cid2, Bytes::from_static(b"data2")),
            ])
            .await
            .unwrap();
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_put_block_checks_cid() {
        let store = MemoryBlockStore::new();
        let cid = cid_for_cbor(b"one").unwrap();
        assert!(store.put_block(cid, Bytes::from_static(b"two")).await.is_err());
        store.put_block(cid, Bytes::from_static(b"one")).await.unwrap();
        assert!(store.has(&cid).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_many() {
        let store = MemoryBlockStore::new();

        let cid1 = store.put(b"data1").await.unwrap();
        let cid2 = store.put(b"data2").await.unwrap();
        let missing = cid_for_cbor(b"missing").unwrap();

        let results = store.get_many(&[cid1, missing, cid2]).await.unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].as_deref(), Some(&b"data1"[..]));
        assert_eq!(results[1], None);
        assert_eq!(results[2].as_deref(), Some(&b"data2"[..]));
    }

    #[tokio::test]
    async fn test_clone_shares_storage() {
        let store1 = MemoryBlockStore::new();
        let store2 = store1.clone();

        let cid = store1.put(b"test").await.unwrap();
        assert!(store2.has(&cid).await.unwrap());
    }
}
