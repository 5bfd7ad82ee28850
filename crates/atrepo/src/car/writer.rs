//! CAR file writing utilities

use crate::error::{CarError, RepoError, Result};
use crate::mst::Mst;
use crate::storage::{BlockMap, BlockStore};
use atrepo_common::IpldCid;
use bytes::Bytes;
use iroh_car::CarWriter;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncWrite, AsyncWriteExt};

pub(crate) fn write_err(e: iroh_car::Error) -> RepoError {
    CarError::Write(e.to_string()).into()
}

/// Header first, so a CAR with no blocks still parses
async fn write_blocks<W: AsyncWrite + Send + Unpin>(
    writer: &mut CarWriter<W>,
    blocks: impl IntoIterator<Item = (IpldCid, Bytes)>,
) -> Result<()> {
    writer.write_header().await.map_err(write_err)?;
    for (cid, data) in blocks {
        writer.write(cid, data.as_ref()).await.map_err(write_err)?;
    }
    Ok(())
}

/// Write blocks to a CAR file
///
/// Blocks are written in sorted CID order (BTreeMap) for determinism.
pub async fn write_car(
    path: impl AsRef<Path>,
    roots: Vec<IpldCid>,
    blocks: BlockMap,
) -> Result<()> {
    let file = File::create(path).await?;

    let header = iroh_car::CarHeader::new_v1(roots);
    let mut writer = CarWriter::new(header, file);
    write_blocks(&mut writer, blocks).await?;

    writer.finish().await.map_err(write_err)?;
    Ok(())
}

/// Write a single-root CAR to memory, blocks in CID order
pub async fn write_car_bytes(root: IpldCid, blocks: BlockMap) -> Result<Vec<u8>> {
    write_ordered_car_bytes(root, blocks).await
}

/// Write a single-root CAR to memory, blocks in the order given
///
/// Archives lead with their commit block so streaming readers see it first.
pub async fn write_ordered_car_bytes(
    root: IpldCid,
    blocks: impl IntoIterator<Item = (IpldCid, Bytes)>,
) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let header = iroh_car::CarHeader::new_v1(vec![root]);
    let mut writer = CarWriter::new(header, &mut buffer);

    write_blocks(&mut writer, blocks).await?;
    writer.finish().await.map_err(write_err)?;
    buffer.flush().await?;

    Ok(buffer)
}

/// Write MST + commit to CAR file
///
/// Streams blocks directly to the file:
/// - Commit block (from storage)
/// - All MST node blocks, root first
/// - All record blocks
pub async fn export_repo_car<S: BlockStore + Sync + 'static>(
    path: impl AsRef<Path>,
    commit_cid: IpldCid,
    mst: &Mst<S>,
) -> Result<()> {
    let file = File::create(path).await?;

    let header = iroh_car::CarHeader::new_v1(vec![commit_cid]);
    let mut writer = CarWriter::new(header, file);

    let commit_data = mst
        .storage()
        .get(&commit_cid)
        .await?
        .ok_or_else(|| RepoError::block_not_found(&commit_cid))?;

    writer
        .write(commit_cid, &commit_data)
        .await
        .map_err(write_err)?;

    mst.write_blocks_to_car(&mut writer).await?;

    writer.finish().await.map_err(write_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::{CarMode, parse_car_bytes, read_car};
    use crate::storage::MemoryBlockStore;
    use atrepo_common::codec::encode_block;
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn record(n: u8) -> (IpldCid, Bytes) {
        let (cid, bytes) = encode_block(&vec![n; 4]).unwrap();
        (cid, Bytes::from(bytes))
    }

    #[tokio::test]
    async fn test_write_car_with_blocks() {
        let temp_file = NamedTempFile::new().unwrap();

        let (cid1, data1) = record(1);
        let (cid2, data2) = record(2);

        let mut blocks = BlockMap::new();
        blocks.insert(cid1, data1.clone());
        blocks.insert(cid2, data2.clone());

        write_car(temp_file.path(), vec![cid1], blocks).await.unwrap();

        let parsed = read_car(temp_file.path(), CarMode::Strict).await.unwrap();
        assert_eq!(parsed.blocks.len(), 2);
        assert_eq!(parsed.blocks.get(&cid1).unwrap(), &data1);
        assert_eq!(parsed.blocks.get(&cid2).unwrap(), &data2);
    }

    #[tokio::test]
    async fn test_car_bytes_are_deterministic() {
        let (cid1, data1) = record(1);
        let (cid2, data2) = record(2);

        let mut a = BlockMap::new();
        a.insert(cid1, data1.clone());
        a.insert(cid2, data2.clone());
        let mut b = BlockMap::new();
        b.insert(cid2, data2);
        b.insert(cid1, data1);

        let first = write_car_bytes(cid1, a).await.unwrap();
        let second = write_car_bytes(cid1, b).await.unwrap();
        assert_eq!(first, second);

        let parsed = parse_car_bytes(&first, CarMode::Strict).await.unwrap();
        assert_eq!(parsed.root().unwrap(), cid1);
    }

    #[tokio::test]
    async fn test_car_without_blocks_parses() {
        let (root, _) = record(1);

        let bytes = write_car_bytes(root, BlockMap::new()).await.unwrap();
        assert!(!bytes.is_empty());

        let parsed = parse_car_bytes(&bytes, CarMode::Strict).await.unwrap();
        assert_eq!(parsed.root().unwrap(), root);
        assert!(parsed.blocks.is_empty());

        let temp_file = NamedTempFile::new().unwrap();
        write_car(temp_file.path(), vec![root], BlockMap::new()).await.unwrap();
        let parsed = read_car(temp_file.path(), CarMode::Strict).await.unwrap();
        assert_eq!(parsed.roots, vec![root]);
        assert!(parsed.blocks.is_empty());
    }

    #[tokio::test]
    async fn test_export_mst_to_car() {
        let storage = Arc::new(MemoryBlockStore::new());
        let mst = Mst::new(storage.clone());

        let (cid1, data1) = record(1);
        let (cid2, data2) = record(2);

        let mst = mst.add("app.bsky.feed.post/abc123", cid1).await.unwrap();
        let mst = mst.add("app.bsky.feed.post/def456", cid2).await.unwrap();
        mst.persist().await.unwrap();

        storage.put_block(cid1, data1).await.unwrap();
        storage.put_block(cid2, data2).await.unwrap();

        // stand-in commit block
        let (commit_cid, commit_data) = record(99);
        storage.put_block(commit_cid, commit_data.clone()).await.unwrap();

        let temp_file = NamedTempFile::new().unwrap();
        export_repo_car(temp_file.path(), commit_cid, &mst)
            .await
            .unwrap();

        let parsed = read_car(temp_file.path(), CarMode::Strict).await.unwrap();
        assert_eq!(parsed.root().unwrap(), commit_cid);
        assert_eq!(parsed.blocks.get(&commit_cid).unwrap(), &commit_data);

        let root_cid = mst.root().await.unwrap();
        assert!(parsed.blocks.contains_key(&root_cid));
        assert!(parsed.blocks.contains_key(&cid1));
        assert!(parsed.blocks.contains_key(&cid2));
    }
}
