//! MST cursor for in-order traversal

use super::node::NodeEntry;
use super::tree::{Mst, MstFuture};
use crate::error::Result;
use crate::storage::BlockStore;
use atrepo_common::IpldCid;
use smol_str::SmolStr;

/// Position within an MST traversal
#[derive(Debug, Clone)]
pub enum CursorPosition<S> {
    /// Pointing at a leaf entry
    Leaf {
        /// Leaf key
        key: SmolStr,
        /// Leaf CID (record value)
        cid: IpldCid,
    },

    /// Pointing at a tree (subtree root)
    Tree {
        /// Subtree MST
        mst: Mst<S>,
    },

    /// Past the end of traversal
    End,
}

impl<S> CursorPosition<S> {
    fn from_entry(entry: &NodeEntry<S>) -> Self
    where
        S: Clone,
    {
        match entry {
            NodeEntry::Leaf { key, value } => CursorPosition::Leaf {
                key: key.clone(),
                cid: *value,
            },
            NodeEntry::Tree(tree) => CursorPosition::Tree { mst: tree.clone() },
        }
    }
}

/// Cursor for navigating an MST in sorted order
///
/// Maintains a position in the tree and supports:
/// - `advance()`: Move to next item in sorted order, stepping into subtrees
/// - `skip_subtree()`: Skip entire subtree at current position
/// - `current()`: Get current position without moving
///
/// Subtrees are visited before the leaf that follows them, so leaves come
/// out in key order.
///
/// # Example traversal
///
/// ```ignore
/// let mut cursor = MstCursor::new(tree);
///
/// while !cursor.is_end() {
///     if let CursorPosition::Leaf { key, cid } = cursor.current() {
///         println!("{} -> {}", key, cid);
///     }
///     cursor.advance().await?;
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MstCursor<S> {
    /// Stack of (node, entries, index) tracking the path from the root
    path: Vec<(Mst<S>, Vec<NodeEntry<S>>, usize)>,

    /// Current position in traversal
    current: CursorPosition<S>,
}

impl<S: BlockStore + Sync + 'static> MstCursor<S> {
    /// Create new cursor at the start of a tree
    ///
    /// Initial position is the root of the tree (which is a Tree position).
    /// Call `advance()` to move to the first entry.
    pub fn new(root: Mst<S>) -> Self {
        Self {
            path: Vec::new(),
            current: CursorPosition::Tree { mst: root },
        }
    }

    /// Get current position without advancing
    pub fn current(&self) -> &CursorPosition<S> {
        &self.current
    }

    /// Check if cursor is at end
    pub fn is_end(&self) -> bool {
        matches!(self.current, CursorPosition::End)
    }

    /// Get key at current position (if pointing at leaf)
    pub fn key(&self) -> Option<&str> {
        match &self.current {
            CursorPosition::Leaf { key, .. } => Some(key.as_str()),
            _ => None,
        }
    }

    /// Get the layer we're currently walking at
    ///
    /// This is the layer of the node holding the current entry. Before the
    /// root has been entered it is the root's layer + 1.
    pub async fn layer(&self) -> Result<usize> {
        if let Some((walking_node, _, _)) = self.path.last() {
            return walking_node.get_layer().await;
        }

        match &self.current {
            CursorPosition::Tree { mst } => Ok(mst.get_layer().await? + 1),
            CursorPosition::Leaf { .. } | CursorPosition::End => Ok(0),
        }
    }

    /// Advance to next position in sorted order
    ///
    /// - If at Leaf: move to next sibling or pop up
    /// - If at Tree: descend into it (step into first entry)
    /// - If at End: stay at End
    pub async fn advance(&mut self) -> Result<()> {
        match &self.current {
            CursorPosition::End => Ok(()),
            CursorPosition::Leaf { .. } => self.step_over().await,
            CursorPosition::Tree { mst } => {
                let mst = mst.clone();
                self.step_into(mst).await
            }
        }
    }

    /// Skip entire subtree at current position
    ///
    /// If pointing at a Tree, skips all its contents.
    /// If pointing at a Leaf, equivalent to `advance()`.
    pub async fn skip_subtree(&mut self) -> Result<()> {
        self.step_over().await
    }

    /// Move to next sibling or pop up
    fn step_over(&mut self) -> MstFuture<'_, ()> {
        Box::pin(async move {
            let Some((_, entries, index)) = self.path.last_mut() else {
                self.current = CursorPosition::End;
                return Ok(());
            };

            *index += 1;
            if let Some(entry) = entries.get(*index) {
                self.current = CursorPosition::from_entry(entry);
                Ok(())
            } else {
                self.path.pop();
                self.step_over().await
            }
        })
    }

    /// Descend into a tree node
    async fn step_into(&mut self, mst: Mst<S>) -> Result<()> {
        let entries = mst.get_entries().await?.clone();

        match entries.first() {
            // empty tree - nothing to visit
            None => self.step_over().await,
            Some(first) => {
                self.current = CursorPosition::from_entry(first);
                self.path.push((mst, entries, 0));
                Ok(())
            }
        }
    }
}
