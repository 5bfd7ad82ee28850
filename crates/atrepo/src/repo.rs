//! High-level repository operations
//!
//! Convenience layer over MST primitives. Provides record writes as signed
//! commits, full and incremental CAR archives, archive import and proof
//! generation.

use std::collections::BTreeSet;
use std::fmt::{self, Display, Formatter};
use std::path::Path;
use std::sync::Arc;

use crate::car::{parse_car_bytes, write_car_bytes, write_ordered_car_bytes};
use crate::car::writer::write_err;
use crate::commit::{Commit, KeyResolver, SigningKey, UnsignedCommit};
use crate::config::RepoConfig;
use crate::error::{RepoError, Result};
use crate::mst::{Mst, RepoOp};
use crate::mst::util::validate_key;
#[cfg(feature = "tracing")]
use crate::storage::block_map_size;
use crate::storage::{BlockMap, BlockStore, LayeredBlockStore, MemoryBlockStore};
use atrepo_common::cid::cid_string;
use atrepo_common::codec::{decode_block, encode_block, from_dag_cbor};
use atrepo_common::types::Ticker;
use atrepo_common::{Did, IpldCid, Nsid, Rkey, Tid};
use bytes::Bytes;
use ipld_core::ipld::Ipld;
use smol_str::{SmolStr, format_smolstr};

/// Check a repository path is exactly `collection/rkey`
///
/// Stricter than the MST's own key check: exactly one `/`, both halves
/// non-empty, and only the characters the MST accepts.
pub fn validate_record_path(path: &str) -> Result<()> {
    validate_key(path)?;
    match path.split_once('/') {
        Some((collection, rkey))
            if !collection.is_empty() && !rkey.is_empty() && !rkey.contains('/') =>
        {
            Ok(())
        }
        _ => Err(RepoError::invalid_key(path).with_help("repository paths are `collection/rkey`")),
    }
}

/// Record write operation
#[derive(Debug, Clone, PartialEq)]
pub enum RecordWriteOp {
    /// Create a record that must not exist yet
    Create {
        /// Collection NSID
        collection: Nsid,
        /// Record key
        rkey: Rkey,
        /// Record value
        record: Ipld,
    },
    /// Replace an existing record
    Update {
        /// Collection NSID
        collection: Nsid,
        /// Record key
        rkey: Rkey,
        /// New record value
        record: Ipld,
        /// Value being replaced, checked when given
        prev: Option<IpldCid>,
    },
    /// Remove an existing record
    Delete {
        /// Collection NSID
        collection: Nsid,
        /// Record key
        rkey: Rkey,
        /// Value being removed, checked when given
        prev: Option<IpldCid>,
    },
}

impl RecordWriteOp {
    /// Collection the record lives in
    pub fn collection(&self) -> &Nsid {
        match self {
            RecordWriteOp::Create { collection, .. }
            | RecordWriteOp::Update { collection, .. }
            | RecordWriteOp::Delete { collection, .. } => collection,
        }
    }

    /// Key of the record within its collection
    pub fn rkey(&self) -> &Rkey {
        match self {
            RecordWriteOp::Create { rkey, .. }
            | RecordWriteOp::Update { rkey, .. }
            | RecordWriteOp::Delete { rkey, .. } => rkey,
        }
    }

    /// MST key, `collection/rkey`
    pub fn path(&self) -> Result<SmolStr> {
        let path = format_smolstr!("{}/{}", self.collection(), self.rkey());
        validate_record_path(&path)?;
        Ok(path)
    }
}

/// Commit data for repository updates
///
/// Contains signed commit and all blocks needed for persistence.
/// Formatting a commit and applying it are separate steps so a host can
/// persist or broadcast in between.
#[derive(Debug, Clone)]
pub struct CommitData {
    /// Commit CID
    pub cid: IpldCid,

    /// New revision TID
    pub rev: Tid,

    /// Previous revision TID (None for initial commit)
    pub since: Option<Tid>,

    /// Previous commit CID (None for initial commit)
    pub prev: Option<IpldCid>,

    /// New MST root CID
    pub data: IpldCid,

    /// Previous MST root CID
    pub prev_data: Option<IpldCid>,

    /// New blocks to persist (MST nodes + record data + commit block)
    pub blocks: BlockMap,

    /// Blocks a receiver needs to check this commit on its own
    ///
    /// - Commit block
    /// - MST node blocks along the paths of all changed keys, in both the
    ///   old and new trees, minus nodes the new tree dropped
    /// - The facing edges of subtrees next to changed leaves, which deletes
    ///   merge and creates split
    /// - New record blocks
    ///
    /// Some of these nodes were already stored before the commit, so this
    /// is not a subset of `blocks`.
    pub relevant_blocks: BlockMap,

    /// Blocks the new head no longer references (old MST nodes and records)
    pub removed_cids: Vec<IpldCid>,

    /// Record changes, sorted by path
    pub ops: Vec<RepoOp>,
}

impl CommitData {
    /// CAR of `relevant_blocks`, rooted at the commit
    pub async fn relevant_archive(&self) -> Result<Vec<u8>> {
        write_car_bytes(self.cid, self.relevant_blocks.clone()).await
    }

    /// CAR of `blocks`, rooted at the commit
    pub async fn blocks_archive(&self) -> Result<Vec<u8>> {
        write_car_bytes(self.cid, self.blocks.clone()).await
    }
}

/// High-level repository operations
///
/// Holds the current head (commit + tree) of one account's repository.
/// Mutating methods take `&mut self`; a host serving several writers puts
/// the repository behind its own lock.
///
/// # Example
///
/// ```rust,ignore
/// use atrepo::{MemoryBlockStore, RecordWriteOp, RepoConfig, Repository};
///
/// let storage = Arc::new(MemoryBlockStore::new());
/// let key = k256::ecdsa::SigningKey::random(&mut OsRng);
/// let mut repo = Repository::create_empty(storage, key.did()?, &key, RepoConfig::default()).await?;
///
/// let commit = repo
///     .apply_writes(&[RecordWriteOp::Create { collection, rkey, record }], &key)
///     .await?;
///
/// let car = repo.diff_archive(commit.prev).await?;
/// ```
pub struct Repository<S: BlockStore> {
    storage: Arc<S>,
    mst: Mst<S>,
    commit: Commit,
    commit_cid: IpldCid,
    ticker: Ticker,
    config: RepoConfig,
}

impl<S: BlockStore + Sync + 'static> Repository<S> {
    fn from_parts(storage: Arc<S>, commit: Commit, commit_cid: IpldCid, config: RepoConfig) -> Self {
        let mst = Mst::load(storage.clone(), *commit.data(), None).with_verified_reads(config.verify_reads);
        Self {
            storage,
            mst,
            commit,
            commit_cid,
            ticker: Ticker::new(),
            config,
        }
    }

    async fn load_commit<B: BlockStore + Sync>(storage: &B, cid: &IpldCid) -> Result<Commit> {
        let bytes = storage
            .get(cid)
            .await?
            .ok_or_else(|| RepoError::block_not_found(cid).with_context("loading commit"))?;
        Commit::from_cbor(&bytes)
    }

    /// Load repository from a commit already in storage
    pub async fn from_commit(storage: Arc<S>, commit_cid: &IpldCid, config: RepoConfig) -> Result<Self> {
        let commit = Self::load_commit(storage.as_ref(), commit_cid).await.map_err(|e| {
            e.with_help("Commit must be persisted before loading the repository - use apply_commit()")
        })?;
        Ok(Self::from_parts(storage, commit, *commit_cid, config))
    }

    /// Create a new, empty repository
    ///
    /// Persists the empty tree node and a first commit (no `prev`) signed
    /// by `signing_key`.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(did = %did)))]
    pub async fn create_empty<K: SigningKey>(
        storage: Arc<S>,
        did: Did,
        signing_key: &K,
        config: RepoConfig,
    ) -> Result<Self> {
        let mst = Mst::new(storage.clone());
        let data = mst.persist().await?;

        let mut ticker = Ticker::new();
        let rev = ticker.next(None);
        let commit = UnsignedCommit::new(did, data, rev, None).sign(signing_key)?;
        let (commit_cid, commit_bytes) = commit.to_block()?;
        storage.put_block(commit_cid, commit_bytes).await?;

        #[cfg(feature = "tracing")]
        tracing::debug!(commit = %commit_cid, "created empty repository");

        let mut repo = Self::from_parts(storage, commit, commit_cid, config);
        repo.ticker = ticker;
        Ok(repo)
    }

    /// Load a repository from a full CAR archive
    ///
    /// The commit at the archive root is checked against `expected_did`
    /// when given, and otherwise against its own DID; either way its
    /// signature must verify with the key `resolver` returns. Every MST node
    /// reachable from the commit must be in the archive or already in
    /// `storage`. Only then are the archive's blocks written to `storage`.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(bytes = car_bytes.len())))]
    pub async fn load_from_archive(
        car_bytes: &[u8],
        storage: Arc<S>,
        expected_did: Option<&Did>,
        resolver: &impl KeyResolver,
        config: RepoConfig,
    ) -> Result<Self> {
        let parsed = parse_car_bytes(car_bytes, config.car_mode).await?;
        let commit_cid = parsed.root()?;
        let commit_bytes = parsed
            .blocks
            .get(&commit_cid)
            .ok_or_else(|| RepoError::block_not_found(&commit_cid).with_context("archive root"))?;
        let commit = Commit::from_cbor(commit_bytes)?;

        let owner = expected_did.unwrap_or(commit.did());
        commit.verify_for(owner, resolver).await?;

        let staging = MemoryBlockStore::new_from_blocks(parsed.blocks);
        let layered = Arc::new(LayeredBlockStore::new(staging.clone(), storage.clone()));
        Mst::load(layered, *commit.data(), None)
            .walk_nodes()
            .await
            .map_err(|e| e.with_context("archive does not hold the whole tree"))?;

        let blocks = staging.blocks();
        #[cfg(feature = "tracing")]
        tracing::debug!(commit = %commit_cid, blocks = blocks.len(), "importing archive");
        storage.put_many(blocks).await?;

        Ok(Self::from_parts(storage, commit, commit_cid, config))
    }

    /// Get a record CID by collection and rkey
    pub async fn get_record(&self, collection: &Nsid, rkey: &Rkey) -> Result<Option<IpldCid>> {
        let path = format_smolstr!("{}/{}", collection, rkey);
        validate_record_path(&path)?;
        self.mst.get(&path).await
    }

    /// Get and decode a record
    ///
    /// `BlockNotFound` if the tree names a record the store does not hold.
    pub async fn get_record_value(&self, collection: &Nsid, rkey: &Rkey) -> Result<Option<Ipld>> {
        let Some(cid) = self.get_record(collection, rkey).await? else {
            return Ok(None);
        };
        let bytes = self
            .storage
            .get(&cid)
            .await?
            .ok_or_else(|| RepoError::block_not_found(&cid).with_context("loading record"))?;
        let value = if self.config.verify_reads {
            decode_block(&cid, &bytes)?
        } else {
            from_dag_cbor(&bytes)?
        };
        Ok(Some(value))
    }

    /// All records in a collection, in rkey order
    pub async fn list_collection(&self, collection: &Nsid) -> Result<Vec<(Rkey, IpldCid)>> {
        let prefix = format!("{}/", collection);
        self.mst
            .list_with_prefix(&prefix, None)
            .await?
            .into_iter()
            .map(|(key, cid)| Ok((Rkey::new(&key[prefix.len()..])?, cid)))
            .collect()
    }

    /// Collections that hold at least one record, in order
    pub async fn collections(&self) -> Result<Vec<Nsid>> {
        let mut out: Vec<Nsid> = Vec::new();
        for (key, _) in self.mst.leaves().await? {
            let collection = key.split_once('/').map_or(key.as_str(), |(c, _)| c);
            if out.last().map(|last| last.as_str()) != Some(collection) {
                out.push(Nsid::new(collection)?);
            }
        }
        Ok(out)
    }

    /// Format a commit from record write operations, without persisting
    ///
    /// Applies the writes to a copy of the tree, signs a commit over the
    /// result and collects:
    /// - `blocks`: new MST nodes, new records and the commit
    /// - `relevant_blocks`: what a receiver needs to verify the commit with
    ///   no other state
    ///
    /// The repository is unchanged until [`Repository::apply_commit`].
    ///
    /// # Errors
    ///
    /// - `TooLarge` for more than `max_ops_per_commit` operations
    /// - `DuplicateKey` / `KeyNotFound` for creates of existing and
    ///   updates or deletes of missing records
    /// - `PrevMismatch` when a given `prev` is not the current value
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(did = %self.did(), ops = ops.len())))]
    pub async fn format_commit<K: SigningKey>(
        &mut self,
        ops: &[RecordWriteOp],
        signing_key: &K,
    ) -> Result<CommitData> {
        let max = self.config.max_ops_per_commit;
        if ops.len() > max {
            return Err(RepoError::too_large("write batch", ops.len(), max));
        }

        let mut updated_tree = self.mst.clone();
        let mut record_blocks = BlockMap::new();
        let mut paths = Vec::with_capacity(ops.len());

        for op in ops {
            let path = op.path()?;
            updated_tree = match op {
                RecordWriteOp::Create { record, .. } => {
                    let cid = Self::encode_record(record, &path, &mut record_blocks)?;
                    updated_tree.add(&path, cid).await?
                }
                RecordWriteOp::Update { record, prev, .. } => {
                    Self::check_current(&updated_tree, &path, prev.as_ref()).await?;
                    let cid = Self::encode_record(record, &path, &mut record_blocks)?;
                    updated_tree.update(&path, cid).await?
                }
                RecordWriteOp::Delete { prev, .. } => {
                    Self::check_current(&updated_tree, &path, prev.as_ref()).await?;
                    updated_tree.delete(&path).await?
                }
            };
            paths.push(path);
        }

        let data = updated_tree.root().await?;
        let prev_data = *self.commit.data();
        let diff = self.mst.diff(&updated_tree).await?;
        diff.validate_limits(max)?;

        // records written and then dropped within the batch are left out
        let referenced: BTreeSet<IpldCid> = diff
            .creates
            .iter()
            .map(|(_, cid)| *cid)
            .chain(diff.updates.iter().map(|(_, cid, _)| *cid))
            .collect();
        record_blocks.retain(|cid, _| referenced.contains(cid));

        let mut blocks = diff.new_mst_blocks.clone();
        blocks.extend(record_blocks.clone());

        let mut relevant_blocks = record_blocks;
        for path in &paths {
            updated_tree.blocks_for_path(path, &mut relevant_blocks).await?;
            self.mst.blocks_for_path(path, &mut relevant_blocks).await?;
        }
        let dropped: BTreeSet<IpldCid> = diff.removed_mst_blocks.iter().copied().collect();
        relevant_blocks.retain(|cid, _| !dropped.contains(cid));
        let removed_cids: Vec<IpldCid> = diff
            .removed_mst_blocks
            .iter()
            .chain(&diff.removed_cids)
            .copied()
            .collect();

        let rev = self.ticker.next(Some(self.commit.rev.clone()));
        let commit = UnsignedCommit::new(self.did().clone(), data, rev.clone(), Some(self.commit_cid))
            .sign(signing_key)?;
        let (commit_cid, commit_bytes) = commit.to_block()?;
        blocks.insert(commit_cid, commit_bytes.clone());
        relevant_blocks.insert(commit_cid, commit_bytes);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            commit = %commit_cid,
            rev = %rev,
            blocks = blocks.len(),
            bytes = block_map_size(&blocks),
            relevant = relevant_blocks.len(),
            "formatted commit"
        );

        Ok(CommitData {
            cid: commit_cid,
            rev,
            since: Some(self.commit.rev.clone()),
            prev: Some(self.commit_cid),
            data,
            prev_data: Some(prev_data),
            blocks,
            relevant_blocks,
            removed_cids,
            ops: diff.to_repo_ops(),
        })
    }

    fn encode_record(record: &Ipld, path: &str, blocks: &mut BlockMap) -> Result<IpldCid> {
        let (cid, bytes) = encode_block(record)
            .map_err(|e| RepoError::from(e).with_context(format!("encoding record {}", path)))?;
        blocks.insert(cid, Bytes::from(bytes));
        Ok(cid)
    }

    async fn check_current(tree: &Mst<S>, path: &str, prev: Option<&IpldCid>) -> Result<()> {
        let current = tree
            .get(path)
            .await?
            .ok_or_else(|| RepoError::key_not_found(path))?;
        match prev {
            Some(prev) if *prev != current => Err(RepoError::prev_mismatch(path, Some(*prev), Some(current))),
            _ => Ok(()),
        }
    }

    /// Apply a formatted commit
    ///
    /// Persists the commit's blocks and moves the head to it. The commit
    /// must have been formatted against the current head.
    pub async fn apply_commit(&mut self, commit_data: &CommitData) -> Result<IpldCid> {
        if commit_data.prev != Some(self.commit_cid) {
            return Err(RepoError::invalid_commit(format!(
                "commit {} does not extend head {}",
                cid_string(&commit_data.cid),
                cid_string(&self.commit_cid)
            ))
            .with_help("format the commit again against the current head"));
        }

        let commit_bytes = commit_data
            .blocks
            .get(&commit_data.cid)
            .ok_or_else(|| RepoError::block_not_found(&commit_data.cid).with_context("commit data"))?;
        let commit = Commit::from_cbor(commit_bytes)?;

        self.storage.put_many(commit_data.blocks.clone()).await?;
        self.set_head(commit, commit_data.cid);
        Ok(commit_data.cid)
    }

    fn set_head(&mut self, commit: Commit, commit_cid: IpldCid) {
        self.mst = Mst::load(self.storage.clone(), *commit.data(), None)
            .with_verified_reads(self.config.verify_reads);
        self.commit = commit;
        self.commit_cid = commit_cid;
    }

    /// Format, sign and apply record writes in one step
    pub async fn apply_writes<K: SigningKey>(
        &mut self,
        ops: &[RecordWriteOp],
        signing_key: &K,
    ) -> Result<CommitData> {
        let commit_data = self.format_commit(ops, signing_key).await?;
        self.apply_commit(&commit_data).await?;
        Ok(commit_data)
    }

    /// Commit CIDs after `since` up to the head, oldest first
    ///
    /// `None` walks back to the first commit. A `since` that is not an
    /// ancestor of the head is an error.
    pub async fn commit_path(&self, since: Option<IpldCid>) -> Result<Vec<IpldCid>> {
        let mut path = Vec::new();
        let mut cursor = Some(self.commit_cid);
        let mut commit = self.commit.clone();

        while let Some(cid) = cursor {
            if Some(cid) == since {
                path.reverse();
                return Ok(path);
            }
            path.push(cid);
            cursor = commit.prev;
            if let Some(prev) = cursor {
                commit = Self::load_commit(self.storage.as_ref(), &prev).await?;
            }
        }

        match since {
            None => {
                path.reverse();
                Ok(path)
            }
            Some(since) => Err(RepoError::invalid_commit(format!(
                "{} is not an ancestor of the head",
                cid_string(&since)
            ))),
        }
    }

    /// Full CAR archive of the head
    ///
    /// Root and first block is the commit, followed by every MST node and
    /// every record block the store holds.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(did = %self.did())))]
    pub async fn full_archive(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        let header = iroh_car::CarHeader::new_v1(vec![self.commit_cid]);
        let mut writer = iroh_car::CarWriter::new(header, &mut buffer);

        let (_, commit_bytes) = self.commit.to_block()?;
        writer
            .write(self.commit_cid, &commit_bytes)
            .await
            .map_err(write_err)?;
        self.mst.write_blocks_to_car(&mut writer).await?;
        writer.finish().await.map_err(write_err)?;

        Ok(buffer)
    }

    /// CAR archive of every commit after `since`
    ///
    /// For each commit on the path from `since` to the head it carries the
    /// commit block, the MST nodes new relative to its predecessor and the
    /// records those nodes newly reference. `None` covers the whole
    /// history. The archive is rooted at the head commit.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(did = %self.did())))]
    pub async fn diff_archive(&self, since: Option<IpldCid>) -> Result<Vec<u8>> {
        let path = self.commit_path(since).await?;

        let mut previous = match since {
            Some(cid) => {
                let commit = Self::load_commit(self.storage.as_ref(), &cid).await?;
                Mst::load(self.storage.clone(), *commit.data(), None)
            }
            None => Mst::new(self.storage.clone()),
        };

        let mut blocks = BlockMap::new();
        for cid in &path {
            let commit = Self::load_commit(self.storage.as_ref(), cid).await?;
            let (_, commit_bytes) = commit.to_block()?;
            blocks.insert(*cid, commit_bytes);

            let tree = Mst::load(self.storage.clone(), *commit.data(), None);
            let diff = previous.diff(&tree).await?;
            blocks.extend(diff.fetch_new_blocks(self.storage.as_ref()).await?);
            blocks.extend(diff.new_mst_blocks);
            previous = tree;
        }

        #[cfg(feature = "tracing")]
        tracing::debug!(
            commits = path.len(),
            blocks = blocks.len(),
            bytes = block_map_size(&blocks),
            "built diff archive"
        );

        // head commit leads, even when nothing follows `since`
        let (_, head_bytes) = self.commit.to_block()?;
        blocks.remove(&self.commit_cid);
        let ordered = std::iter::once((self.commit_cid, head_bytes)).chain(blocks);
        write_ordered_car_bytes(self.commit_cid, ordered).await
    }

    /// Apply a diff archive from the repository's owner
    ///
    /// The archive's blocks are staged over the repository store. The
    /// commits from the archive root back to the current head must all be
    /// for this DID, signed by the key `resolver` returns, and carry strictly
    /// increasing revisions; the new head tree must be complete. Only then
    /// are the staged blocks persisted and the head advanced.
    ///
    /// Returns the newly applied commit CIDs, oldest first.
    #[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(did = %self.did(), bytes = car_bytes.len())))]
    pub async fn apply_diff_archive(
        &mut self,
        car_bytes: &[u8],
        resolver: &impl KeyResolver,
    ) -> Result<Vec<IpldCid>> {
        let parsed = parse_car_bytes(car_bytes, self.config.car_mode).await?;
        let head = parsed.root()?;
        let staging = MemoryBlockStore::new_from_blocks(parsed.blocks);
        let layered = Arc::new(LayeredBlockStore::new(staging.clone(), self.storage.clone()));

        let mut chain = Vec::new();
        let mut cursor = head;
        while cursor != self.commit_cid {
            let commit = Self::load_commit(layered.as_ref(), &cursor).await?;
            let prev = commit.prev.ok_or_else(|| {
                RepoError::invalid_commit(format!(
                    "archive history does not reach head {}",
                    cid_string(&self.commit_cid)
                ))
            })?;
            chain.push((cursor, commit));
            cursor = prev;
        }
        chain.reverse();

        let Some((head_cid, head_commit)) = chain.last().cloned() else {
            return Ok(Vec::new());
        };

        let mut rev = self.commit.rev.clone();
        for (_, commit) in &chain {
            commit.verify_for(self.did(), resolver).await?;
            if commit.rev <= rev {
                return Err(RepoError::invalid_commit(format!(
                    "revision {} does not follow {}",
                    commit.rev, rev
                )));
            }
            rev = commit.rev.clone();
        }

        Mst::load(layered, *head_commit.data(), None)
            .walk_nodes()
            .await
            .map_err(|e| e.with_context("archive does not complete the new tree"))?;

        self.storage.put_many(staging.blocks()).await?;
        self.set_head(head_commit, head_cid);

        #[cfg(feature = "tracing")]
        tracing::debug!(commits = chain.len(), head = %head_cid, "applied diff archive");

        Ok(chain.into_iter().map(|(cid, _)| cid).collect())
    }

    /// Move the head back `count` commits
    ///
    /// Blocks stay in the store; only the head changes.
    pub async fn revert(&mut self, count: usize) -> Result<()> {
        let mut commit = self.commit.clone();
        let mut cid = self.commit_cid;
        for _ in 0..count {
            let prev = commit
                .prev
                .ok_or_else(|| RepoError::invalid_commit("cannot revert past the first commit"))?;
            commit = Self::load_commit(self.storage.as_ref(), &prev).await?;
            cid = prev;
        }
        self.set_head(commit, cid);
        Ok(())
    }

    /// CAR proving the current value (or absence) of each path
    ///
    /// Holds the commit, the covering blocks for every path and the record
    /// blocks of present keys. Checked with
    /// [`verify_proofs`](crate::commit::proof::verify_proofs).
    pub async fn proof_archive<P: AsRef<str>>(&self, paths: &[P]) -> Result<Vec<u8>> {
        let (_, commit_bytes) = self.commit.to_block()?;
        let mut blocks = BlockMap::new();
        for path in paths {
            validate_record_path(path.as_ref())?;
            self.mst.blocks_for_path(path.as_ref(), &mut blocks).await?;
        }

        let ordered = std::iter::once((self.commit_cid, commit_bytes)).chain(blocks);
        write_ordered_car_bytes(self.commit_cid, ordered).await
    }

    /// Export the full archive to a CAR file
    pub async fn export_car(&self, path: impl AsRef<Path>) -> Result<()> {
        crate::car::export_repo_car(path, self.commit_cid, &self.mst).await
    }

    /// Get the underlying MST
    pub fn mst(&self) -> &Mst<S> {
        &self.mst
    }

    /// Get reference to the storage
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Repository options
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Get the current commit
    pub fn current_commit(&self) -> &Commit {
        &self.commit
    }

    /// Get the current commit CID
    pub fn current_commit_cid(&self) -> &IpldCid {
        &self.commit_cid
    }

    /// MST root of the current commit
    pub fn data(&self) -> &IpldCid {
        self.commit.data()
    }

    /// Revision of the current commit
    pub fn rev(&self) -> &Tid {
        self.commit.rev()
    }

    /// Get the DID from the current commit
    pub fn did(&self) -> &Did {
        self.commit.did()
    }
}

impl<S: BlockStore> Display for Repository<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Repository {{")?;
        writeln!(f, "  DID: {}", self.commit.did())?;
        writeln!(f, "  Commit: {}", cid_string(&self.commit_cid))?;
        writeln!(f, "  Rev: {}", self.commit.rev)?;
        writeln!(f, "  Data: {}", cid_string(self.commit.data()))?;
        write!(f, "}}")
    }
}
