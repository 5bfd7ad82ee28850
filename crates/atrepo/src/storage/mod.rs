//! Block storage abstraction for MST nodes, commits and records

use std::collections::BTreeMap;

use crate::error::Result;
use atrepo_common::IpldCid;
use atrepo_common::cid::verify_cid;
use bytes::Bytes;

/// Blocks keyed by CID, ordered so block sets and archives are deterministic
pub type BlockMap = BTreeMap<IpldCid, Bytes>;

/// Total payload bytes in a block map
pub fn block_map_size(blocks: &BlockMap) -> usize {
    blocks.values().map(|b| b.len()).sum()
}

/// Check that `data` hashes to `cid` before it is stored.
pub(crate) fn check_block(cid: &IpldCid, data: &[u8]) -> Result<()> {
    verify_cid(cid, data)?;
    Ok(())
}

/// Content-addressed store behind trees, commits and archives
///
/// Every block is DAG-CBOR keyed by its CID. Shipped backends:
/// [`MemoryBlockStore`] for tests and scratch proofs, [`FileBlockStore`]
/// over a single CAR file, and [`LayeredBlockStore`] for staging archive
/// imports. Hosts plug in their own database by implementing the trait.
///
/// Stores only ever add blocks. Writing a block that is already present is
/// a no-op, and nothing here deletes; reclaiming unreachable blocks is left
/// to the host. Handles are cheap to clone and share one underlying store.
///
/// ```rust,ignore
/// let store = MemoryBlockStore::new();
/// let (cid, bytes) = encode_block(&record)?;
/// store.put_block(cid, bytes.into()).await?;
/// assert!(store.has(&cid).await?);
/// ```
#[trait_variant::make(Send)]
pub trait BlockStore: Clone {
    /// Block stored under `cid`, if any
    async fn get(&self, cid: &IpldCid) -> Result<Option<Bytes>>;

    /// Store DAG-CBOR bytes under the CID computed from them
    async fn put(&self, data: &[u8]) -> Result<IpldCid>;

    /// Store a block under a CID the caller already has
    ///
    /// Fails with `CidMismatch` if the bytes do not hash to `cid`.
    async fn put_block(&self, cid: IpldCid, data: Bytes) -> Result<()>;

    /// Whether `cid` is stored
    async fn has(&self, cid: &IpldCid) -> Result<bool>;

    /// Store a batch, all or nothing
    ///
    /// Every block is checked against its CID before any is written; one bad
    /// block rejects the whole batch.
    async fn put_many(
        &self,
        blocks: impl IntoIterator<Item = (IpldCid, Bytes)> + Send,
    ) -> Result<()>;

    /// Look up several CIDs, answering in input order with `None` for gaps
    async fn get_many(&self, cids: &[IpldCid]) -> Result<Vec<Option<Bytes>>>;
}

pub mod file;
pub mod layered;
pub mod memory;

pub use file::FileBlockStore;
pub use layered::LayeredBlockStore;
pub use memory::MemoryBlockStore;
