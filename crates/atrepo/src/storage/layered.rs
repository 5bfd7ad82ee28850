//! Staging area for blocks from an archive under check
//!
//! Archive imports and diff-archive catch-ups read the incoming blocks and
//! the repository's existing blocks as one store, while every write lands
//! in the staging layer. The repository store is only written once the
//! incoming commits have been verified.

use std::sync::Arc;

use crate::error::Result;
use crate::storage::BlockStore;
use atrepo_common::IpldCid;
use bytes::Bytes;

/// Incoming blocks stacked on a repository's committed blocks
///
/// `staged` is searched first and takes every write; `committed` is only
/// read. A tree loaded over the pair sees the new head's nodes from the
/// archive and the untouched subtrees from the existing store.
///
/// ```rust,ignore
/// let staged = MemoryBlockStore::new_from_blocks(parsed.blocks);
/// let view = LayeredBlockStore::new(staged.clone(), repo_storage.clone());
/// Mst::load(Arc::new(view), new_root, None).walk_nodes().await?;
/// repo_storage.put_many(staged.blocks()).await?;
/// ```
#[derive(Clone)]
pub struct LayeredBlockStore<W: BlockStore, B: BlockStore> {
    staged: W,
    committed: Arc<B>,
}

impl<W: BlockStore, B: BlockStore> LayeredBlockStore<W, B> {
    /// Stack `staged` over `committed`
    pub fn new(staged: W, committed: Arc<B>) -> Self {
        Self { staged, committed }
    }

    /// Layer holding incoming and newly written blocks
    pub fn staged(&self) -> &W {
        &self.staged
    }

    /// Store the staged blocks are checked against
    pub fn committed(&self) -> &Arc<B> {
        &self.committed
    }
}

impl<W: BlockStore + Sync + 'static, B: BlockStore + Sync + 'static> BlockStore
    for LayeredBlockStore<W, B>
{
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>> {
        match self.staged.get(cid).await? {
            Some(block) => Ok(Some(block)),
            None => self.committed.get(cid).await,
        }
    }

    async fn put(&self, data: &[u8]) -> Result<IpldCid> {
        self.staged.put(data).await
    }

    async fn put_block(&self, cid: IpldCid, data: Bytes) -> Result<()> {
        self.staged.put_block(cid, data).await
    }

    async fn has(&self, cid: &IpldCid) -> Result<bool> {
        Ok(self.staged.has(cid).await? || self.committed.has(cid).await?)
    }

    async fn put_many(&self, blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send) -> Result<()> {
        self.staged.put_many(blocks).await
    }

    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>> {
        let mut found = self.staged.get_many(cids).await?;
        let absent: Vec<IpldCid> = cids
            .iter()
            .zip(&found)
            .filter_map(|(cid, block)| block.is_none().then_some(*cid))
            .collect();
        if absent.is_empty() {
            return Ok(found);
        }

        let mut fallback = self.committed.get_many(&absent).await?.into_iter();
        for slot in found.iter_mut().filter(|block| block.is_none()) {
            *slot = fallback.next().flatten();
        }
        Ok(found)
    }
}
