//! MST diff calculation

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use super::cursor::{CursorPosition, MstCursor};
use super::tree::{Mst, VerifiedWriteOp};
use crate::error::{DiffError, Result};
use crate::storage::{BlockMap, BlockStore};
use atrepo_common::IpldCid;
use smol_str::SmolStr;

/// Kind of change a [`RepoOp`] describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpAction {
    /// Record created
    Create,
    /// Record replaced
    Update,
    /// Record removed
    Delete,
}

impl OpAction {
    /// Wire name of the action
    pub fn as_str(&self) -> &'static str {
        match self {
            OpAction::Create => "create",
            OpAction::Update => "update",
            OpAction::Delete => "delete",
        }
    }
}

impl fmt::Display for OpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One record change, as carried in sync messages
///
/// `cid` is the new value (absent for deletes); `prev` the value it
/// replaced (absent for creates).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoOp {
    /// What happened to the record
    pub action: OpAction,
    /// Record path (`collection/rkey`)
    pub path: SmolStr,
    /// New record CID
    pub cid: Option<IpldCid>,
    /// Previous record CID
    pub prev: Option<IpldCid>,
}

impl RepoOp {
    /// The tree operation this describes
    ///
    /// Returns `None` when a required CID is missing for the action.
    pub fn to_verified_op(&self) -> Option<VerifiedWriteOp> {
        let key = self.path.clone();
        match (self.action, self.cid, self.prev) {
            (OpAction::Create, Some(cid), _) => Some(VerifiedWriteOp::Create { key, cid }),
            (OpAction::Update, Some(cid), Some(prev)) => {
                Some(VerifiedWriteOp::Update { key, cid, prev })
            }
            (OpAction::Delete, _, Some(prev)) => Some(VerifiedWriteOp::Delete { key, prev }),
            _ => None,
        }
    }
}

/// Diff between two MST states
///
/// Represents the changes needed to transform one tree into another, plus
/// the blocks that come and go with them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MstDiff {
    /// New records created (key, new CID), in key order
    pub creates: Vec<(SmolStr, IpldCid)>,

    /// Records updated (key, new CID, old CID), in key order
    pub updates: Vec<(SmolStr, IpldCid, IpldCid)>,

    /// Records deleted (key, old CID), in key order
    pub deletes: Vec<(SmolStr, IpldCid)>,

    /// Record CIDs that are newly referenced (from creates + updates)
    ///
    /// These need to be available in storage for the new tree.
    pub new_leaf_cids: Vec<IpldCid>,

    /// Record CIDs that are no longer referenced (from deletes + updates)
    pub removed_cids: Vec<IpldCid>,

    /// MST node blocks reachable from the new tree and not from the old
    pub new_mst_blocks: BlockMap,

    /// MST nodes reachable from the old tree and not from the new
    pub removed_mst_blocks: Vec<IpldCid>,
}

impl MstDiff {
    /// Create empty diff
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if diff is empty (no changes)
    pub fn is_empty(&self) -> bool {
        self.creates.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }

    /// Count total operations
    pub fn op_count(&self) -> usize {
        self.creates.len() + self.updates.len() + self.deletes.len()
    }

    /// Reject a diff with more than `max_ops` operations
    pub fn validate_limits(&self, max_ops: usize) -> Result<()> {
        if self.op_count() > max_ops {
            return Err(DiffError::TooManyOps {
                count: self.op_count(),
                max: max_ops,
            }
            .into());
        }
        Ok(())
    }

    /// Convert diff to verified write operations
    ///
    /// Returns operations that can be safely applied with `batch()`.
    /// All update/delete operations include verified prev CIDs.
    pub fn to_verified_ops(&self) -> Vec<VerifiedWriteOp> {
        let mut ops = Vec::with_capacity(self.op_count());

        for (key, cid) in &self.creates {
            ops.push(VerifiedWriteOp::Create {
                key: key.clone(),
                cid: *cid,
            });
        }

        for (key, new_cid, old_cid) in &self.updates {
            ops.push(VerifiedWriteOp::Update {
                key: key.clone(),
                cid: *new_cid,
                prev: *old_cid,
            });
        }

        for (key, old_cid) in &self.deletes {
            ops.push(VerifiedWriteOp::Delete {
                key: key.clone(),
                prev: *old_cid,
            });
        }

        ops
    }

    /// Fetch new record data blocks from storage
    ///
    /// Returns a map of CID → bytes for all new record data (creates +
    /// updates) that storage holds.
    pub async fn fetch_new_blocks<S: BlockStore + Sync>(&self, storage: &S) -> Result<BlockMap> {
        let mut blocks = BlockMap::new();
        let found = storage.get_many(&self.new_leaf_cids).await?;
        for (cid, block) in self.new_leaf_cids.iter().zip(found) {
            if let Some(block) = block {
                blocks.insert(*cid, block);
            }
        }
        Ok(blocks)
    }

    /// Convert diff to sync operations, sorted by path
    ///
    /// All update/delete operations include prev CIDs.
    pub fn to_repo_ops(&self) -> Vec<RepoOp> {
        let mut ops = Vec::with_capacity(self.op_count());

        for (key, cid) in &self.creates {
            ops.push(RepoOp {
                action: OpAction::Create,
                path: key.clone(),
                cid: Some(*cid),
                prev: None,
            });
        }

        for (key, new_cid, old_cid) in &self.updates {
            ops.push(RepoOp {
                action: OpAction::Update,
                path: key.clone(),
                cid: Some(*new_cid),
                prev: Some(*old_cid),
            });
        }

        for (key, old_cid) in &self.deletes {
            ops.push(RepoOp {
                action: OpAction::Delete,
                path: key.clone(),
                cid: None,
                prev: Some(*old_cid),
            });
        }

        ops.sort_by(|a, b| a.path.cmp(&b.path));
        ops
    }
}

/// Accumulates walk events, cancelling anything seen on both sides
#[derive(Default)]
struct DiffBuilder {
    adds: BTreeMap<SmolStr, IpldCid>,
    updates: BTreeMap<SmolStr, (IpldCid, IpldCid)>,
    deletes: BTreeMap<SmolStr, IpldCid>,
    new_nodes: BlockMap,
    removed_nodes: BTreeSet<IpldCid>,
}

impl DiffBuilder {
    fn leaf_add(&mut self, key: &SmolStr, cid: IpldCid) {
        match self.deletes.remove(key) {
            Some(old) if old != cid => {
                self.updates.insert(key.clone(), (cid, old));
            }
            Some(_) => {}
            None => {
                self.adds.insert(key.clone(), cid);
            }
        }
    }

    fn leaf_update(&mut self, key: &SmolStr, new: IpldCid, old: IpldCid) {
        if new != old {
            self.updates.insert(key.clone(), (new, old));
        }
    }

    fn leaf_delete(&mut self, key: &SmolStr, cid: IpldCid) {
        match self.adds.remove(key) {
            Some(new) if new != cid => {
                self.updates.insert(key.clone(), (new, cid));
            }
            Some(_) => {}
            None => {
                self.deletes.insert(key.clone(), cid);
            }
        }
    }

    async fn tree_add<S: BlockStore + Sync + 'static>(&mut self, tree: &Mst<S>) -> Result<()> {
        let cid = tree.get_pointer().await?;
        if !self.removed_nodes.remove(&cid) {
            let (cid, bytes) = tree.node_block().await?;
            self.new_nodes.insert(cid, bytes);
        }
        Ok(())
    }

    async fn tree_delete<S: BlockStore + Sync + 'static>(&mut self, tree: &Mst<S>) -> Result<()> {
        let cid = tree.get_pointer().await?;
        if self.new_nodes.remove(&cid).is_none() {
            self.removed_nodes.insert(cid);
        }
        Ok(())
    }

    async fn record<S: BlockStore + Sync + 'static>(
        &mut self,
        position: &CursorPosition<S>,
        added: bool,
    ) -> Result<()> {
        match (position, added) {
            (CursorPosition::Leaf { key, cid }, true) => self.leaf_add(key, *cid),
            (CursorPosition::Leaf { key, cid }, false) => self.leaf_delete(key, *cid),
            (CursorPosition::Tree { mst }, true) => self.tree_add(mst).await?,
            (CursorPosition::Tree { mst }, false) => self.tree_delete(mst).await?,
            (CursorPosition::End, _) => {}
        }
        Ok(())
    }

    fn finish(self) -> MstDiff {
        let added: BTreeSet<IpldCid> = self
            .adds
            .values()
            .chain(self.updates.values().map(|(new, _)| new))
            .copied()
            .collect();
        let removed: BTreeSet<IpldCid> = self
            .deletes
            .values()
            .chain(self.updates.values().map(|(_, old)| old))
            .copied()
            .collect();

        MstDiff {
            new_leaf_cids: added.difference(&removed).copied().collect(),
            removed_cids: removed.difference(&added).copied().collect(),
            creates: self.adds.into_iter().collect(),
            updates: self
                .updates
                .into_iter()
                .map(|(key, (new, old))| (key, new, old))
                .collect(),
            deletes: self.deletes.into_iter().collect(),
            new_mst_blocks: self.new_nodes,
            removed_mst_blocks: self.removed_nodes.into_iter().collect(),
        }
    }
}

impl<S: BlockStore + Sync + 'static> Mst<S> {
    /// Compute diff from this tree to another
    ///
    /// Returns operations needed to transform `self` into `other`.
    /// - Creates: keys in `other` but not in `self`
    /// - Updates: keys in both but with different CIDs
    /// - Deletes: keys in `self` but not in `other`
    ///
    /// Both trees are walked in lockstep. Subtrees with the same CID at the
    /// same layer are skipped whole, so the cost follows the size of the
    /// change rather than the size of the trees.
    pub async fn diff(&self, other: &Mst<S>) -> Result<MstDiff> {
        let mut builder = DiffBuilder::default();
        let mut old = MstCursor::new(self.clone());
        let mut new = MstCursor::new(other.clone());

        loop {
            match (old.is_end(), new.is_end()) {
                (true, true) => break,
                // Only new entries remain - all adds
                (true, false) => {
                    builder.record(new.current(), true).await?;
                    new.advance().await?;
                    continue;
                }
                // Only old entries remain - all deletes
                (false, true) => {
                    builder.record(old.current(), false).await?;
                    old.advance().await?;
                    continue;
                }
                (false, false) => {}
            }

            // Two leaves: key comparison decides, whatever the layers
            if let (
                CursorPosition::Leaf {
                    key: old_key,
                    cid: old_cid,
                },
                CursorPosition::Leaf {
                    key: new_key,
                    cid: new_cid,
                },
            ) = (old.current(), new.current())
            {
                match old_key.cmp(new_key) {
                    std::cmp::Ordering::Equal => {
                        builder.leaf_update(old_key, *new_cid, *old_cid);
                        old.advance().await?;
                        new.advance().await?;
                    }
                    std::cmp::Ordering::Less => {
                        builder.leaf_delete(old_key, *old_cid);
                        old.advance().await?;
                    }
                    std::cmp::Ordering::Greater => {
                        builder.leaf_add(new_key, *new_cid);
                        new.advance().await?;
                    }
                }
                continue;
            }

            let old_layer = old.layer().await?;
            let new_layer = new.layer().await?;

            if old_layer > new_layer {
                // A higher leaf waits for the lower side to catch up; a
                // higher tree is opened
                if matches!(old.current(), CursorPosition::Leaf { .. }) {
                    builder.record(new.current(), true).await?;
                    new.advance().await?;
                } else {
                    builder.record(old.current(), false).await?;
                    old.advance().await?;
                }
                continue;
            }

            if old_layer < new_layer {
                if matches!(new.current(), CursorPosition::Leaf { .. }) {
                    builder.record(old.current(), false).await?;
                    old.advance().await?;
                } else {
                    builder.record(new.current(), true).await?;
                    new.advance().await?;
                }
                continue;
            }

            match (old.current(), new.current()) {
                (CursorPosition::Tree { mst: old_tree }, CursorPosition::Tree { mst: new_tree }) => {
                    if old_tree.get_pointer().await? == new_tree.get_pointer().await? {
                        old.skip_subtree().await?;
                        new.skip_subtree().await?;
                    } else {
                        builder.tree_add(new_tree).await?;
                        builder.tree_delete(old_tree).await?;
                        old.advance().await?;
                        new.advance().await?;
                    }
                }
                (CursorPosition::Leaf { .. }, CursorPosition::Tree { mst }) => {
                    builder.tree_add(mst).await?;
                    new.advance().await?;
                }
                (CursorPosition::Tree { mst }, CursorPosition::Leaf { .. }) => {
                    builder.tree_delete(mst).await?;
                    old.advance().await?;
                }
                _ => unreachable!("leaf pairs and ended cursors are handled above"),
            }
        }

        let diff = builder.finish();

        #[cfg(feature = "tracing")]
        tracing::trace!(
            creates = diff.creates.len(),
            updates = diff.updates.len(),
            deletes = diff.deletes.len(),
            new_nodes = diff.new_mst_blocks.len(),
            removed_nodes = diff.removed_mst_blocks.len(),
            "computed MST diff"
        );

        Ok(diff)
    }

    /// Diff from nothing to this tree: every leaf a create, every node new
    pub async fn diff_from_empty(&self) -> Result<MstDiff> {
        let empty = Mst::new(self.storage().clone());
        empty.diff(self).await
    }

    /// Diff from this tree to nothing: every leaf a delete
    pub async fn diff_to_empty(&self) -> Result<MstDiff> {
        let empty = Mst::new(self.storage().clone());
        self.diff(&empty).await
    }
}
