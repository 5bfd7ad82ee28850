//! Immutable Merkle Search Tree operations

use std::fmt;
use std::future::Future;
use std::ops::Bound;
use std::pin::Pin;
use std::sync::Arc;

use atrepo_common::IpldCid;
use atrepo_common::cid::verify_cid;
use atrepo_common::codec::{encode_block, from_dag_cbor};
use bytes::Bytes;
use smol_str::SmolStr;
use tokio::io::AsyncWrite;
use tokio::sync::OnceCell;

use super::node::{NodeData, NodeEntry};
use super::util;
use crate::car::writer::write_err;
use crate::error::{RepoError, Result};
use crate::storage::{BlockMap, BlockStore};

/// Boxed future returned by the recursive tree walks
pub(crate) type MstFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Write operation with the value it expects to replace
///
/// `prev` is the CID currently stored under the key; [`Mst::batch`] checks
/// it before applying the change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifiedWriteOp {
    /// Create new record (error if exists)
    Create {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Record CID
        cid: IpldCid,
    },

    /// Update existing record
    Update {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// New record CID
        cid: IpldCid,
        /// Value being replaced
        prev: IpldCid,
    },

    /// Delete record
    Delete {
        /// Record key (collection/rkey)
        key: SmolStr,
        /// Value being removed
        prev: IpldCid,
    },
}

impl VerifiedWriteOp {
    /// Key this operation touches
    pub fn key(&self) -> &str {
        match self {
            VerifiedWriteOp::Create { key, .. }
            | VerifiedWriteOp::Update { key, .. }
            | VerifiedWriteOp::Delete { key, .. } => key.as_str(),
        }
    }

    /// The operation that undoes this one
    pub fn invert(&self) -> VerifiedWriteOp {
        match self {
            VerifiedWriteOp::Create { key, cid } => VerifiedWriteOp::Delete {
                key: key.clone(),
                prev: *cid,
            },
            VerifiedWriteOp::Update { key, cid, prev } => VerifiedWriteOp::Update {
                key: key.clone(),
                cid: *prev,
                prev: *cid,
            },
            VerifiedWriteOp::Delete { key, prev } => VerifiedWriteOp::Create {
                key: key.clone(),
                cid: *prev,
            },
        }
    }
}

#[derive(Clone, Copy)]
enum Edge {
    Left,
    Right,
}

/// Key window for [`Mst::list`] and [`Mst::list_with_prefix`]
struct KeyRange<'k> {
    start: Bound<&'k str>,
    end: Bound<&'k str>,
    prefix: Option<&'k str>,
    limit: usize,
}

impl KeyRange<'_> {
    fn before_start(&self, key: &str) -> bool {
        match self.start {
            Bound::Included(s) => key < s,
            Bound::Excluded(s) => key <= s,
            Bound::Unbounded => false,
        }
    }

    /// A subtree whose keys all sort below `upper` lies before the window
    fn skips_below(&self, upper: &str) -> bool {
        match self.start {
            Bound::Included(s) | Bound::Excluded(s) => upper <= s,
            Bound::Unbounded => false,
        }
    }

    fn past_end(&self, key: &str) -> bool {
        let beyond = match self.end {
            Bound::Included(e) => key > e,
            Bound::Excluded(e) => key >= e,
            Bound::Unbounded => false,
        };
        beyond || self.prefix.is_some_and(|p| !key.starts_with(p) && key > p)
    }
}

/// Immutable Merkle Search Tree
///
/// MST operations return new tree instances, leaving the original unchanged.
/// This enables versioning and safe concurrent access to different tree versions.
///
/// # Architecture
///
/// The tree uses a flat `Vec<NodeEntry>` representation in memory, where
/// `NodeEntry` is an enum of `Tree` (subtree) and `Leaf` (key-value pair).
///
/// Entries are interleaved: `[Tree, Leaf, Tree, Leaf, Leaf, Tree]` etc.
/// This representation makes operations simple (Vec slicing, splicing).
///
/// The wire format (CBOR) uses prefix compression and pointers (left/tree).
/// See `NodeData` and `TreeEntry` in node.rs for serialization format.
///
/// # Lazy state
///
/// A node loaded by CID fetches its entries on first access; a node built
/// in memory computes its CID on first access. Both caches are
/// `OnceCell`s, so concurrent readers load or encode a node at most once and
/// never see partial state. A handle never shares its cells with a modified
/// copy.
///
/// # Layer-based structure
///
/// Keys are hashed (SHA-256) and leading zero bits determine layer:
/// - More leading zeros = higher layer (closer to the root)
/// - Layer = floor(leading_zeros / 2) for ~4 fanout
/// - Deterministic and insertion-order independent
#[derive(Clone)]
pub struct Mst<S> {
    /// Block storage for loading/saving nodes (shared via Arc)
    storage: Arc<S>,

    /// Flat list of entries, filled from storage on first access
    entries: Arc<OnceCell<Vec<NodeEntry<S>>>>,

    /// CID of this node, computed from entries on first access
    pointer: Arc<OnceCell<IpldCid>>,

    /// Layer hint for this node
    ///
    /// `None` means layer unknown (will be computed from entries).
    layer: Option<usize>,

    /// Re-hash node blocks returned by storage
    verify_reads: bool,
}

impl<S> fmt::Debug for Mst<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mst")
            .field("pointer", &self.pointer.get())
            .field("layer", &self.layer)
            .field("loaded", &self.entries.initialized())
            .finish()
    }
}

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Create empty MST
    pub fn new(storage: Arc<S>) -> Self {
        Self::create(storage, Vec::new(), Some(0))
    }

    /// Create MST with existing entries
    ///
    /// The CID is computed when first asked for; nothing is persisted.
    pub(crate) fn create(storage: Arc<S>, entries: Vec<NodeEntry<S>>, layer: Option<usize>) -> Self {
        Self {
            storage,
            entries: Arc::new(OnceCell::from(entries)),
            pointer: Arc::new(OnceCell::new()),
            layer,
            verify_reads: false,
        }
    }

    /// Load MST from CID (lazy)
    ///
    /// Doesn't actually load from storage until entries are accessed.
    pub fn load(storage: Arc<S>, cid: IpldCid, layer: Option<usize>) -> Self {
        Self::from_pointer(storage, cid, layer, false)
    }

    pub(crate) fn from_pointer(
        storage: Arc<S>,
        cid: IpldCid,
        layer: Option<usize>,
        verify_reads: bool,
    ) -> Self {
        Self {
            storage,
            entries: Arc::new(OnceCell::new()),
            pointer: Arc::new(OnceCell::from(cid)),
            layer,
            verify_reads,
        }
    }

    /// Re-hash every node block read from storage
    ///
    /// Applies to this node and to every node loaded beneath it, so set it
    /// before the first read.
    pub fn with_verified_reads(mut self, verify: bool) -> Self {
        self.verify_reads = verify;
        self
    }

    fn with_entries(&self, entries: Vec<NodeEntry<S>>, layer: Option<usize>) -> Self {
        Self {
            storage: self.storage.clone(),
            entries: Arc::new(OnceCell::from(entries)),
            pointer: Arc::new(OnceCell::new()),
            layer,
            verify_reads: self.verify_reads,
        }
    }

    /// Create new tree with modified entries, at this node's layer
    async fn new_tree(&self, entries: Vec<NodeEntry<S>>) -> Result<Self> {
        let layer = self.get_layer().await?;
        Ok(self.with_entries(entries, Some(layer)))
    }

    /// Get entries (lazy load if needed)
    pub(crate) async fn get_entries(&self) -> Result<&Vec<NodeEntry<S>>> {
        self.entries.get_or_try_init(|| self.load_entries()).await
    }

    async fn load_entries(&self) -> Result<Vec<NodeEntry<S>>> {
        let pointer = *self
            .pointer
            .get()
            .ok_or_else(|| RepoError::invalid_mst("node has neither entries nor a CID"))?;
        let node_bytes = self
            .storage
            .get(&pointer)
            .await?
            .ok_or_else(|| RepoError::block_not_found(&pointer))?;
        if self.verify_reads {
            verify_cid(&pointer, &node_bytes)?;
        }

        let node_data: NodeData = from_dag_cbor(&node_bytes)?;
        util::deserialize_node_data(&self.storage, &node_data, self.layer, self.verify_reads)
            .map_err(|e| e.with_context(format!("MST node {}", pointer)))
    }

    /// Encode this node to DAG-CBOR
    async fn encode(&self) -> Result<(IpldCid, Vec<u8>)> {
        let entries = self.get_entries().await?;
        let node_data = util::serialize_node_data(entries).await?;
        Ok(encode_block(&node_data)?)
    }

    /// Get CID pointer (computing it if this node was built in memory)
    ///
    /// Computes CID from current entries but doesn't persist to storage.
    /// Use `collect_blocks()` to gather blocks for persistence.
    pub async fn get_pointer(&self) -> Result<IpldCid> {
        self.pointer
            .get_or_try_init(|| async { Ok::<_, RepoError>(self.encode().await?.0) })
            .await
            .copied()
    }

    /// Get root CID (alias for get_pointer)
    pub async fn root(&self) -> Result<IpldCid> {
        self.get_pointer().await
    }

    /// This node's block, read from storage when present, encoded otherwise
    pub async fn node_block(&self) -> Result<(IpldCid, Bytes)> {
        if let Some(cid) = self.pointer.get() {
            if let Some(bytes) = self.storage.get(cid).await? {
                return Ok((*cid, bytes));
            }
        }
        let (cid, bytes) = self.encode().await?;
        Ok((cid, Bytes::from(bytes)))
    }

    /// Get shared reference to the block storage
    ///
    /// Useful for CAR export and other operations that need direct storage access.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Check if the tree holds no entries
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.get_entries().await?.is_empty())
    }

    /// Get the layer of this node
    ///
    /// Layer is the layer of any leaf key in this node.
    /// For nodes with no leaves, recursively checks subtrees.
    pub(crate) fn get_layer(&self) -> MstFuture<'_, usize> {
        Box::pin(async move {
            if let Some(layer) = self.layer {
                return Ok(layer);
            }

            let entries = self.get_entries().await?;
            if let Some(key) = entries.iter().find_map(|e| e.leaf_key()) {
                return Ok(util::layer_for_key(key));
            }

            for entry in entries {
                if let NodeEntry::Tree(subtree) = entry {
                    return Ok(subtree.get_layer().await? + 1);
                }
            }

            Ok(0)
        })
    }

    /// Find index of first leaf >= key
    ///
    /// Returns `entries.len()` if all leaves are < key.
    fn find_gt_or_equal_leaf_index_in(entries: &[NodeEntry<S>], key: &str) -> usize {
        entries
            .iter()
            .position(|e| e.leaf_key().is_some_and(|k| k >= key))
            .unwrap_or(entries.len())
    }

    /// Get a value by key
    pub async fn get(&self, key: &str) -> Result<Option<IpldCid>> {
        util::validate_key(key)?;
        self.find(key).await
    }

    fn find<'a>(&'a self, key: &'a str) -> MstFuture<'a, Option<IpldCid>> {
        Box::pin(async move {
            let entries = self.get_entries().await?;
            let index = Self::find_gt_or_equal_leaf_index_in(entries, key);

            if let Some(NodeEntry::Leaf {
                key: leaf_key,
                value,
            }) = entries.get(index)
            {
                if leaf_key == key {
                    return Ok(Some(*value));
                }
            }

            // Not found at this level - check subtree before this index
            if index > 0 {
                if let NodeEntry::Tree(subtree) = &entries[index - 1] {
                    return subtree.find(key).await;
                }
            }

            Ok(None)
        })
    }

    /// Add a key-value pair (returns new tree)
    ///
    /// Fails with `DuplicateKey` if the key is already present.
    pub async fn add(&self, key: &str, cid: IpldCid) -> Result<Mst<S>> {
        util::validate_key(key)?;
        self.insert(key, cid).await
    }

    fn insert<'a>(&'a self, key: &'a str, cid: IpldCid) -> MstFuture<'a, Mst<S>> {
        Box::pin(async move {
            let key_layer = util::layer_for_key(key);
            let node_layer = self.get_layer().await?;
            let entries = self.get_entries().await?;
            let leaf = NodeEntry::Leaf {
                key: SmolStr::new(key),
                value: cid,
            };

            if key_layer == node_layer {
                // Key belongs at this layer - insert here
                let index = Self::find_gt_or_equal_leaf_index_in(entries, key);

                if entries.get(index).and_then(|e| e.leaf_key()) == Some(key) {
                    return Err(RepoError::duplicate_key(key));
                }

                match index.checked_sub(1).map(|i| &entries[i]) {
                    Some(NodeEntry::Tree(subtree)) => {
                        // Prev is Tree - split it around key
                        let (left, right) = subtree.split_around(key).await?;
                        self.replace_with_split(index - 1, left, leaf, right).await
                    }
                    _ => self.splice_in(leaf, index).await,
                }
            } else if key_layer < node_layer {
                // Key belongs on lower layer - recurse into subtree
                let index = Self::find_gt_or_equal_leaf_index_in(entries, key);

                if index > 0 {
                    if let NodeEntry::Tree(prev_tree) = &entries[index - 1] {
                        let new_subtree = prev_tree.insert(key, cid).await?;
                        return self
                            .update_entry(index - 1, NodeEntry::Tree(new_subtree))
                            .await;
                    }
                }

                // No prev tree - create child and add to it
                let child = self.create_child().await?;
                let new_subtree = child.insert(key, cid).await?;
                self.splice_in(NodeEntry::Tree(new_subtree), index).await
            } else {
                // Key belongs on higher layer - create parent layers
                let extra_layers = key_layer - node_layer;

                let (mut left, mut right) = self.split_around(key).await?;

                for _ in 1..extra_layers {
                    if let Some(l) = left {
                        left = Some(l.create_parent().await?);
                    }
                    if let Some(r) = right {
                        right = Some(r.create_parent().await?);
                    }
                }

                let mut new_entries = Vec::with_capacity(3);
                if let Some(l) = left {
                    new_entries.push(NodeEntry::Tree(l));
                }
                new_entries.push(leaf);
                if let Some(r) = right {
                    new_entries.push(NodeEntry::Tree(r));
                }

                Ok(self.with_entries(new_entries, Some(key_layer)))
            }
        })
    }

    /// Delete a key (returns new tree)
    ///
    /// Fails with `KeyNotFound` if the key is absent. Deleting the last key
    /// yields the canonical empty tree.
    pub async fn delete(&self, key: &str) -> Result<Mst<S>> {
        util::validate_key(key)?;

        let altered = self.delete_recurse(key).await?;
        let trimmed = altered.trim_top().await?;
        if trimmed.is_empty().await? {
            return Ok(self.with_entries(Vec::new(), Some(0)));
        }
        Ok(trimmed)
    }

    /// Recursively delete a key
    fn delete_recurse<'a>(&'a self, key: &'a str) -> MstFuture<'a, Mst<S>> {
        Box::pin(async move {
            let entries = self.get_entries().await?;
            let index = Self::find_gt_or_equal_leaf_index_in(entries, key);

            if entries.get(index).and_then(|e| e.leaf_key()) == Some(key) {
                let prev = index.checked_sub(1).map(|i| &entries[i]);
                let next = entries.get(index + 1);

                // Subtrees on both sides become adjacent - merge them
                if let (Some(NodeEntry::Tree(prev_tree)), Some(NodeEntry::Tree(next_tree))) =
                    (prev, next)
                {
                    let merged = prev_tree.append_merge(next_tree).await?;

                    let mut new_entries = entries[..index - 1].to_vec();
                    new_entries.push(NodeEntry::Tree(merged));
                    new_entries.extend_from_slice(&entries[index + 2..]);

                    return self.new_tree(new_entries).await;
                }

                return self.remove_entry(index).await;
            }

            // Not found at this level - recurse into prev Tree
            if index > 0 {
                if let NodeEntry::Tree(prev_tree) = &entries[index - 1] {
                    let subtree = prev_tree.delete_recurse(key).await?;

                    return if subtree.is_empty().await? {
                        self.remove_entry(index - 1).await
                    } else {
                        self.update_entry(index - 1, NodeEntry::Tree(subtree)).await
                    };
                }
            }

            Err(RepoError::key_not_found(key))
        })
    }

    /// Update an existing key (returns new tree)
    ///
    /// Only the nodes on the key's path change; the shape of the tree does
    /// not. Fails with `KeyNotFound` if the key is absent.
    pub async fn update(&self, key: &str, cid: IpldCid) -> Result<Mst<S>> {
        util::validate_key(key)?;
        self.replace_value(key, cid).await
    }

    fn replace_value<'a>(&'a self, key: &'a str, cid: IpldCid) -> MstFuture<'a, Mst<S>> {
        Box::pin(async move {
            let entries = self.get_entries().await?;
            let index = Self::find_gt_or_equal_leaf_index_in(entries, key);

            if let Some(NodeEntry::Leaf { key: leaf_key, .. }) = entries.get(index) {
                if leaf_key == key {
                    let leaf = NodeEntry::Leaf {
                        key: leaf_key.clone(),
                        value: cid,
                    };
                    return self.update_entry(index, leaf).await;
                }
            }

            if index > 0 {
                if let NodeEntry::Tree(prev_tree) = &entries[index - 1] {
                    let subtree = prev_tree.replace_value(key, cid).await?;
                    return self.update_entry(index - 1, NodeEntry::Tree(subtree)).await;
                }
            }

            Err(RepoError::key_not_found(key))
        })
    }

    /// Update entry at index
    async fn update_entry(&self, index: usize, entry: NodeEntry<S>) -> Result<Mst<S>> {
        let mut entries = self.get_entries().await?.clone();
        entries[index] = entry;
        self.new_tree(entries).await
    }

    /// Remove entry at index
    async fn remove_entry(&self, index: usize) -> Result<Mst<S>> {
        let mut entries = self.get_entries().await?.clone();
        entries.remove(index);
        self.new_tree(entries).await
    }

    /// Append entry to end
    async fn append(&self, entry: NodeEntry<S>) -> Result<Mst<S>> {
        let mut entries = self.get_entries().await?.clone();
        entries.push(entry);
        self.new_tree(entries).await
    }

    /// Prepend entry to start
    async fn prepend(&self, entry: NodeEntry<S>) -> Result<Mst<S>> {
        let mut entries = self.get_entries().await?.clone();
        entries.insert(0, entry);
        self.new_tree(entries).await
    }

    /// Splice in entry at index
    async fn splice_in(&self, entry: NodeEntry<S>, index: usize) -> Result<Mst<S>> {
        let mut entries = self.get_entries().await?.clone();
        entries.insert(index, entry);
        self.new_tree(entries).await
    }

    /// Trim top node if it only contains one subtree
    fn trim_top(self) -> MstFuture<'static, Mst<S>> {
        Box::pin(async move {
            let entries = self.get_entries().await?;

            if let [NodeEntry::Tree(subtree)] = entries.as_slice() {
                return subtree.clone().trim_top().await;
            }

            Ok(self)
        })
    }

    /// Split tree around a key into left and right subtrees
    ///
    /// Returns (left, right) where:
    /// - left contains all entries < key
    /// - right contains all entries >= key
    ///
    /// Either side can be None if empty.
    pub fn split_around<'a>(
        &'a self,
        key: &'a str,
    ) -> MstFuture<'a, (Option<Mst<S>>, Option<Mst<S>>)> {
        Box::pin(async move {
            let entries = self.get_entries().await?;
            let index = Self::find_gt_or_equal_leaf_index_in(entries, key);

            let left_data = entries[..index].to_vec();
            let right_data = entries[index..].to_vec();

            let mut left = self.new_tree(left_data).await?;
            let mut right = self.new_tree(right_data).await?;

            // If last entry in left is a Tree, recursively split it
            if let Some(NodeEntry::Tree(last_tree)) = entries[..index].last() {
                left = left.remove_entry(index - 1).await?;

                let (split_left, split_right) = last_tree.split_around(key).await?;

                if let Some(sl) = split_left {
                    left = left.append(NodeEntry::Tree(sl)).await?;
                }
                if let Some(sr) = split_right {
                    right = right.prepend(NodeEntry::Tree(sr)).await?;
                }
            }

            let left_out = if left.is_empty().await? { None } else { Some(left) };
            let right_out = if right.is_empty().await? { None } else { Some(right) };

            Ok((left_out, right_out))
        })
    }

    /// Merge two adjacent subtrees
    ///
    /// All keys in `to_merge` must be > all keys in `self`.
    /// Used primarily for delete operations.
    pub fn append_merge<'a>(&'a self, to_merge: &'a Mst<S>) -> MstFuture<'a, Mst<S>> {
        Box::pin(async move {
            let self_layer = self.get_layer().await?;
            let merge_layer = to_merge.get_layer().await?;

            if self_layer != merge_layer {
                return Err(RepoError::invalid_mst(format!(
                    "cannot merge MST nodes from layers {} and {}",
                    self_layer, merge_layer
                )));
            }

            let self_entries = self.get_entries().await?;
            let merge_entries = to_merge.get_entries().await?;

            // Touching edges are both subtrees - merge them recursively
            if let (Some(NodeEntry::Tree(left_tree)), Some(NodeEntry::Tree(right_tree))) =
                (self_entries.last(), merge_entries.first())
            {
                let merged = left_tree.append_merge(right_tree).await?;

                let mut new_entries = self_entries[..self_entries.len() - 1].to_vec();
                new_entries.push(NodeEntry::Tree(merged));
                new_entries.extend_from_slice(&merge_entries[1..]);

                return self.new_tree(new_entries).await;
            }

            let mut new_entries = self_entries.clone();
            new_entries.extend_from_slice(merge_entries);
            self.new_tree(new_entries).await
        })
    }

    /// Create empty child tree at layer-1
    pub async fn create_child(&self) -> Result<Mst<S>> {
        let layer = self.get_layer().await?;
        Ok(self.with_entries(Vec::new(), Some(layer.saturating_sub(1))))
    }

    /// Create parent tree at layer+1 containing self
    pub async fn create_parent(self) -> Result<Mst<S>> {
        let layer = self.get_layer().await?;
        let parent = self.with_entries(Vec::new(), Some(layer + 1));
        parent.splice_in(NodeEntry::Tree(self), 0).await
    }

    /// Replace entry at index with [left?, leaf, right?]
    async fn replace_with_split(
        &self,
        index: usize,
        left: Option<Mst<S>>,
        leaf: NodeEntry<S>,
        right: Option<Mst<S>>,
    ) -> Result<Mst<S>> {
        let entries = self.get_entries().await?;

        let mut new_entries = entries[..index].to_vec();
        if let Some(l) = left {
            new_entries.push(NodeEntry::Tree(l));
        }
        new_entries.push(leaf);
        if let Some(r) = right {
            new_entries.push(NodeEntry::Tree(r));
        }
        new_entries.extend_from_slice(&entries[index + 1..]);

        self.new_tree(new_entries).await
    }

    /// Get all leaf entries (key-CID pairs) in lexicographic order
    pub async fn leaves(&self) -> Result<Vec<(SmolStr, IpldCid)>> {
        let mut result = Vec::new();
        self.collect_leaves(&mut result).await?;
        Ok(result)
    }

    /// Recursively collect all leaves into the result vector
    fn collect_leaves<'a>(&'a self, result: &'a mut Vec<(SmolStr, IpldCid)>) -> MstFuture<'a, ()> {
        Box::pin(async move {
            for entry in self.get_entries().await? {
                match entry {
                    NodeEntry::Tree(subtree) => subtree.collect_leaves(result).await?,
                    NodeEntry::Leaf { key, value } => result.push((key.clone(), *value)),
                }
            }
            Ok(())
        })
    }

    /// Number of leaves in the tree
    pub fn leaf_count(&self) -> MstFuture<'_, usize> {
        Box::pin(async move {
            let mut count = 0;
            for entry in self.get_entries().await? {
                count += match entry {
                    NodeEntry::Tree(subtree) => subtree.leaf_count().await?,
                    NodeEntry::Leaf { .. } => 1,
                };
            }
            Ok(count)
        })
    }

    /// List leaves in key order
    ///
    /// `after` and `before` are exclusive bounds; `count` caps the result.
    pub async fn list(
        &self,
        count: Option<usize>,
        after: Option<&str>,
        before: Option<&str>,
    ) -> Result<Vec<(SmolStr, IpldCid)>> {
        let range = KeyRange {
            start: after.map_or(Bound::Unbounded, Bound::Excluded),
            end: before.map_or(Bound::Unbounded, Bound::Excluded),
            prefix: None,
            limit: count.unwrap_or(usize::MAX),
        };
        let mut out = Vec::new();
        self.walk_range(&range, &mut out).await?;
        Ok(out)
    }

    /// List leaves whose keys start with `prefix`, in key order
    pub async fn list_with_prefix(
        &self,
        prefix: &str,
        count: Option<usize>,
    ) -> Result<Vec<(SmolStr, IpldCid)>> {
        let range = KeyRange {
            start: Bound::Included(prefix),
            end: Bound::Unbounded,
            prefix: Some(prefix),
            limit: count.unwrap_or(usize::MAX),
        };
        let mut out = Vec::new();
        self.walk_range(&range, &mut out).await?;
        Ok(out)
    }

    /// Collect leaves inside `range`; `Ok(false)` once the walk is past it
    fn walk_range<'a>(
        &'a self,
        range: &'a KeyRange<'a>,
        out: &'a mut Vec<(SmolStr, IpldCid)>,
    ) -> MstFuture<'a, bool> {
        Box::pin(async move {
            let entries = self.get_entries().await?;
            for (i, entry) in entries.iter().enumerate() {
                if out.len() >= range.limit {
                    return Ok(false);
                }
                match entry {
                    NodeEntry::Leaf { key, value } => {
                        if range.past_end(key) {
                            return Ok(false);
                        }
                        if !range.before_start(key) {
                            out.push((key.clone(), *value));
                        }
                    }
                    NodeEntry::Tree(subtree) => {
                        // every key in the subtree sorts below the next leaf
                        let upper = entries.get(i + 1).and_then(|e| e.leaf_key());
                        if upper.is_some_and(|u| range.skips_below(u)) {
                            continue;
                        }
                        if !subtree.walk_range(range, out).await? {
                            return Ok(false);
                        }
                    }
                }
            }
            Ok(true)
        })
    }

    /// CIDs of every node in the tree, parents before children
    pub async fn walk_nodes(&self) -> Result<Vec<IpldCid>> {
        let mut cids = Vec::new();
        self.collect_node_cids(&mut cids).await?;
        Ok(cids)
    }

    fn collect_node_cids<'a>(&'a self, cids: &'a mut Vec<IpldCid>) -> MstFuture<'a, ()> {
        Box::pin(async move {
            cids.push(self.get_pointer().await?);
            for entry in self.get_entries().await? {
                if let NodeEntry::Tree(subtree) = entry {
                    subtree.collect_node_cids(cids).await?;
                }
            }
            Ok(())
        })
    }

    /// Every node block in the tree, whether or not it is persisted
    pub async fn all_blocks(&self) -> Result<BlockMap> {
        let mut blocks = BlockMap::new();
        self.collect_all_blocks(&mut blocks).await?;
        Ok(blocks)
    }

    fn collect_all_blocks<'a>(&'a self, blocks: &'a mut BlockMap) -> MstFuture<'a, ()> {
        Box::pin(async move {
            let (cid, bytes) = self.node_block().await?;
            blocks.insert(cid, bytes);
            for entry in self.get_entries().await? {
                if let NodeEntry::Tree(subtree) = entry {
                    subtree.collect_all_blocks(blocks).await?;
                }
            }
            Ok(())
        })
    }

    /// Apply batch of verified write operations (returns new tree)
    ///
    /// Operations are applied in order, each against the tree left by the
    /// one before.
    ///
    /// # Validation
    ///
    /// - Create: `DuplicateKey` if key already exists
    /// - Update / Delete: `KeyNotFound` if the key is absent, `PrevMismatch`
    ///   if the stored value is not `prev`
    pub async fn batch(&self, ops: &[VerifiedWriteOp]) -> Result<Mst<S>> {
        let mut tree = self.clone();

        for op in ops {
            tree = match op {
                VerifiedWriteOp::Create { key, cid } => tree.add(key, *cid).await?,
                VerifiedWriteOp::Update { key, cid, prev } => {
                    tree.check_prev(key, prev).await?;
                    tree.update(key, *cid).await?
                }
                VerifiedWriteOp::Delete { key, prev } => {
                    tree.check_prev(key, prev).await?;
                    tree.delete(key).await?
                }
            };
        }

        Ok(tree)
    }

    async fn check_prev(&self, key: &str, prev: &IpldCid) -> Result<()> {
        let current = self
            .get(key)
            .await?
            .ok_or_else(|| RepoError::key_not_found(key))?;
        if &current != prev {
            return Err(RepoError::prev_mismatch(key, Some(*prev), Some(current)));
        }
        Ok(())
    }

    /// Collect all blocks that need persisting
    ///
    /// Recursively walks the tree, serializing nodes and collecting blocks
    /// that aren't already in storage. A node already in storage is skipped
    /// along with everything beneath it.
    ///
    /// Returns (root_cid, blocks) where blocks is a map of CID → bytes.
    pub fn collect_blocks(&self) -> MstFuture<'_, (IpldCid, BlockMap)> {
        Box::pin(async move {
            let mut blocks = BlockMap::new();
            let pointer = self.get_pointer().await?;

            if self.storage.has(&pointer).await? {
                return Ok((pointer, blocks));
            }

            let (cid, cbor) = self.encode().await?;
            blocks.insert(cid, Bytes::from(cbor));

            for entry in self.get_entries().await? {
                if let NodeEntry::Tree(subtree) = entry {
                    let (_, subtree_blocks) = subtree.collect_blocks().await?;
                    blocks.extend(subtree_blocks);
                }
            }

            Ok((pointer, blocks))
        })
    }

    /// Persist all unstored blocks to storage
    ///
    /// Returns the root CID after persisting.
    pub async fn persist(&self) -> Result<IpldCid> {
        let (root_cid, blocks) = self.collect_blocks().await?;

        if !blocks.is_empty() {
            self.storage.put_many(blocks).await?;
        }

        Ok(root_cid)
    }

    /// Get all CIDs in the merkle path to a key
    ///
    /// - Always includes the root CID (this node's pointer)
    /// - Includes all intermediate MST node CIDs in the path
    /// - If key exists, ends with the record CID
    ///
    /// For a key that doesn't exist the path still runs down to where the
    /// key would sit, which is what proves its absence.
    pub async fn cids_for_path(&self, key: &str) -> Result<Vec<IpldCid>> {
        util::validate_key(key)?;
        let mut cids = Vec::new();
        self.collect_path_cids(key, &mut cids).await?;
        Ok(cids)
    }

    fn collect_path_cids<'a>(&'a self, key: &'a str, cids: &'a mut Vec<IpldCid>) -> MstFuture<'a, ()> {
        Box::pin(async move {
            cids.push(self.get_pointer().await?);
            let entries = self.get_entries().await?;
            let index = Self::find_gt_or_equal_leaf_index_in(entries, key);

            if let Some(NodeEntry::Leaf {
                key: leaf_key,
                value,
            }) = entries.get(index)
            {
                if leaf_key == key {
                    cids.push(*value);
                    return Ok(());
                }
            }

            if index > 0 {
                if let NodeEntry::Tree(subtree) = &entries[index - 1] {
                    return subtree.collect_path_cids(key, cids).await;
                }
            }

            Ok(())
        })
    }

    /// Add the covering proof for `key` to `blocks`
    ///
    /// Covers every node from the root down to the key's position, whether
    /// or not the key is present. For a present key it also covers the
    /// facing edges of the subtrees either side of the leaf, since removing
    /// the leaf merges them, and the record block when storage has it.
    /// These blocks alone are enough to look the key up, or to add or
    /// remove it and recompute the root.
    pub async fn blocks_for_path(&self, key: &str, blocks: &mut BlockMap) -> Result<()> {
        util::validate_key(key)?;
        self.collect_path_blocks(key, blocks).await
    }

    fn collect_path_blocks<'a>(&'a self, key: &'a str, blocks: &'a mut BlockMap) -> MstFuture<'a, ()> {
        Box::pin(async move {
            let (cid, bytes) = self.node_block().await?;
            blocks.insert(cid, bytes);

            let entries = self.get_entries().await?;
            let index = Self::find_gt_or_equal_leaf_index_in(entries, key);

            if let Some(NodeEntry::Leaf {
                key: leaf_key,
                value,
            }) = entries.get(index)
            {
                if leaf_key == key {
                    if let Some(record) = self.storage.get(value).await? {
                        blocks.insert(*value, record);
                    }
                    if let Some(NodeEntry::Tree(left)) = index.checked_sub(1).map(|i| &entries[i]) {
                        left.collect_edge_blocks(Edge::Right, blocks).await?;
                    }
                    if let Some(NodeEntry::Tree(right)) = entries.get(index + 1) {
                        right.collect_edge_blocks(Edge::Left, blocks).await?;
                    }
                    return Ok(());
                }
            }

            if index > 0 {
                if let NodeEntry::Tree(subtree) = &entries[index - 1] {
                    return subtree.collect_path_blocks(key, blocks).await;
                }
            }

            Ok(())
        })
    }

    /// Nodes down one edge of this subtree, stopping at the first leaf
    fn collect_edge_blocks<'a>(&'a self, edge: Edge, blocks: &'a mut BlockMap) -> MstFuture<'a, ()> {
        Box::pin(async move {
            let (cid, bytes) = self.node_block().await?;
            blocks.insert(cid, bytes);

            let entries = self.get_entries().await?;
            let outer = match edge {
                Edge::Left => entries.first(),
                Edge::Right => entries.last(),
            };
            if let Some(NodeEntry::Tree(subtree)) = outer {
                subtree.collect_edge_blocks(edge, blocks).await?;
            }
            Ok(())
        })
    }

    /// Write all MST and record blocks to CAR writer
    ///
    /// Streams blocks directly to the writer as the tree is walked:
    /// - All MST node blocks, root first (read from storage)
    /// - All leaf record blocks (read from storage)
    ///
    /// Record blocks missing from storage are left out.
    pub async fn write_blocks_to_car<W: AsyncWrite + Send + Unpin>(
        &self,
        writer: &mut iroh_car::CarWriter<W>,
    ) -> Result<()> {
        let mut leaf_cids = Vec::new();

        self.write_mst_nodes_to_car(writer, &mut leaf_cids).await?;

        let leaf_blocks = self.storage.get_many(&leaf_cids).await?;
        for (cid, maybe_data) in leaf_cids.iter().zip(leaf_blocks) {
            if let Some(data) = maybe_data {
                writer.write(*cid, &data).await.map_err(write_err)?;
            }
        }

        Ok(())
    }

    /// Recursively write MST nodes to CAR and collect leaf CIDs
    fn write_mst_nodes_to_car<'a, W: AsyncWrite + Send + Unpin>(
        &'a self,
        writer: &'a mut iroh_car::CarWriter<W>,
        leaf_cids: &'a mut Vec<IpldCid>,
    ) -> MstFuture<'a, ()> {
        Box::pin(async move {
            let pointer = self.get_pointer().await?;

            let node_bytes = self
                .storage
                .get(&pointer)
                .await?
                .ok_or_else(|| RepoError::block_not_found(&pointer))?;

            writer.write(pointer, &node_bytes).await.map_err(write_err)?;

            for entry in self.get_entries().await? {
                match entry {
                    NodeEntry::Leaf { value, .. } => leaf_cids.push(*value),
                    NodeEntry::Tree(subtree) => {
                        subtree.write_mst_nodes_to_car(writer, leaf_cids).await?;
                    }
                }
            }

            Ok(())
        })
    }
}
