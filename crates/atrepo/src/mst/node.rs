//! MST node data structures

use std::fmt;

use atrepo_common::IpldCid;
use bytes::Bytes;
use smol_str::SmolStr;

use crate::mst::Mst;

/// Entry in an MST node - either a subtree or a leaf
///
/// This is the in-memory representation used for tree operations.
/// MST operations work on flat `Vec<NodeEntry>` where entries are interleaved:
/// `[Tree, Leaf, Tree, Leaf, Leaf, Tree]` etc. Two trees are never adjacent.
///
/// The wire format (CBOR) is different - see `NodeData` and `TreeEntry`.
#[derive(Clone)]
pub enum NodeEntry<S> {
    /// Subtree reference, loaded from storage on first access
    Tree(Mst<S>),

    /// Leaf node with key-value pair
    Leaf {
        /// Full key (not prefix-compressed in memory)
        key: SmolStr,
        /// CID of the record value
        value: IpldCid,
    },
}

impl<S> fmt::Debug for NodeEntry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEntry::Tree(t) => write!(f, "{:?}", t),
            NodeEntry::Leaf { key, value } => {
                write!(f, "Leaf {{ key: {}, value: {} }}", key, value)
            }
        }
    }
}

impl<S> NodeEntry<S> {
    /// Check if this is a tree entry
    pub fn is_tree(&self) -> bool {
        matches!(self, NodeEntry::Tree(_))
    }

    /// Check if this is a leaf entry
    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeEntry::Leaf { .. })
    }

    /// Get the key if this is a leaf
    pub fn leaf_key(&self) -> Option<&str> {
        match self {
            NodeEntry::Leaf { key, .. } => Some(key.as_str()),
            NodeEntry::Tree(_) => None,
        }
    }
}

// Wire format. serde_ipld_dagcbor writes struct fields in declaration
// order, so fields are declared in DAG-CBOR canonical key order.

/// Wire format entry (prefix-compressed leaf with optional subtree pointer)
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TreeEntry {
    /// Key suffix after the shared prefix, as a CBOR byte string
    #[serde(rename = "k", with = "crate::commit::serde_bytes_helper")]
    pub key_suffix: Bytes,

    /// Number of leading bytes shared with the previous key in the node
    #[serde(rename = "p")]
    pub prefix_len: u8,

    /// Subtree to the right of this leaf; explicit `null` when absent
    #[serde(rename = "t")]
    pub tree: Option<IpldCid>,

    /// CID of the record value
    #[serde(rename = "v")]
    pub value: IpldCid,
}

/// Wire format node data (serialized as DAG-CBOR)
///
/// # Conversion rules
///
/// **Serialization (flat → wire):**
/// - First entry if `Tree` → becomes `left` pointer
/// - Each `Leaf` → becomes entry in `entries`
/// - `Tree` after `Leaf` → becomes that leaf's `tree` pointer
///
/// **Deserialization (wire → flat):**
/// - `left` if present → prepend `Tree` entry
/// - Each entry → append `Leaf`
/// - Each `tree` if present → append `Tree` entry
///
/// `Option` fields always serialize as explicit `null`; skipping them would
/// change the bytes and so the CID.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct NodeData {
    /// Entries in this node (sorted by full key, prefix-compressed)
    #[serde(rename = "e")]
    pub entries: Vec<TreeEntry>,

    /// Left-most subtree pointer
    #[serde(rename = "l")]
    pub left: Option<IpldCid>,
}

impl NodeData {
    /// The node with no entries and no subtree, the root of an empty repository
    pub fn empty() -> Self {
        Self {
            entries: Vec::new(),
            left: None,
        }
    }
}
