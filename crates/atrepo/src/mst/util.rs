//! MST utility functions

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use super::node::{NodeData, NodeEntry, TreeEntry};
use crate::error::{MstError, Result};
use crate::mst::Mst;
use crate::storage::BlockStore;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use smol_str::SmolStr;

/// Longest key the tree accepts, in bytes
pub const MAX_KEY_LEN: usize = 256;

/// Calculate layer (depth) for a key based on its hash
///
/// depth = floor(leading_zero_bits(SHA-256(key)) / 2), counting bits from
/// the most significant end. This gives an expected fanout of 4.
pub fn layer_for_key(key: &str) -> usize {
    let hash = Sha256::digest(key.as_bytes());
    leading_zeros(&hash) / 2
}

/// Count leading zero bits in hash
pub(crate) fn leading_zeros(hash: &[u8]) -> usize {
    let mut count = 0;
    for byte in hash {
        if *byte == 0 {
            count += 8;
        } else {
            count += byte.leading_zeros() as usize;
            break;
        }
    }
    count
}

/// Validate MST key format
///
/// Keys must match `[a-zA-Z0-9._:~/-]+` and be at most 256 bytes. The
/// stricter `collection/rkey` shape is checked by the repository layer.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(MstError::EmptyKey.into());
    }

    if key.len() > MAX_KEY_LEN {
        return Err(MstError::KeyTooLong {
            len: key.len(),
            max: MAX_KEY_LEN,
        }
        .into());
    }

    if !key
        .bytes()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'.' | b'_' | b':' | b'~' | b'-' | b'/'))
    {
        return Err(MstError::InvalidKeyChars {
            key: key.to_string(),
        }
        .into());
    }

    Ok(())
}

/// Count shared prefix length between two keys, in bytes
pub fn common_prefix_len(a: &str, b: &str) -> usize {
    a.bytes()
        .zip(b.bytes())
        .take_while(|(x, y)| x == y)
        .count()
}

/// Serialize flat entries to wire format (with prefix compression)
///
/// Converts in-memory `Vec<NodeEntry>` to DAG-CBOR `NodeData`.
/// - First `Tree` entry → `left` pointer
/// - Each `Leaf` → entry with prefix compression
/// - `Tree` after `Leaf` → that leaf's `tree` pointer
pub fn serialize_node_data<'a, S: BlockStore + Sync + 'static>(
    entries: &'a [NodeEntry<S>],
) -> Pin<Box<dyn Future<Output = Result<NodeData>> + Send + 'a>> {
    Box::pin(async move {
        let mut data = NodeData::empty();
        let mut i = 0;

        if let Some(NodeEntry::Tree(tree)) = entries.first() {
            data.left = Some(tree.get_pointer().await?);
            i += 1;
        }

        let mut last_key: &str = "";
        while i < entries.len() {
            let NodeEntry::Leaf { key, value } = &entries[i] else {
                return Err(MstError::InvalidNode("two subtrees adjacent in node".into()).into());
            };
            i += 1;

            let prefix_len = common_prefix_len(last_key, key);
            let key_suffix = &key.as_bytes()[prefix_len..];

            let tree = if let Some(NodeEntry::Tree(tree)) = entries.get(i) {
                i += 1;
                Some(tree.get_pointer().await?)
            } else {
                None
            };

            data.entries.push(TreeEntry {
                key_suffix: Bytes::copy_from_slice(key_suffix),
                prefix_len: prefix_len.try_into().map_err(|_| {
                    MstError::InvalidNode(format!("prefix length {} exceeds u8::MAX", prefix_len))
                })?,
                tree,
                value: *value,
            });

            last_key = key.as_str();
        }

        Ok(data)
    })
}

/// Deserialize wire format to flat entries
///
/// Converts DAG-CBOR `NodeData` to in-memory `Vec<NodeEntry>`, checking that
/// keys decompress to valid, strictly ascending keys.
///
/// `layer` is the node's layer if the caller knows it. Otherwise it comes
/// from the first leaf, so child layers are known without loading children.
pub fn deserialize_node_data<S: BlockStore + Sync + 'static>(
    storage: &Arc<S>,
    data: &NodeData,
    layer: Option<usize>,
    verify_reads: bool,
) -> Result<Vec<NodeEntry<S>>> {
    let mut leaves = Vec::with_capacity(data.entries.len());
    let mut last_key: Vec<u8> = Vec::new();
    for entry in &data.entries {
        let prefix_len = entry.prefix_len as usize;
        if prefix_len > last_key.len() {
            return Err(MstError::InvalidNode(format!(
                "prefix length {} longer than previous key ({} bytes)",
                prefix_len,
                last_key.len()
            ))
            .into());
        }

        let mut full = last_key[..prefix_len].to_vec();
        full.extend_from_slice(&entry.key_suffix);
        let key = std::str::from_utf8(&full)
            .map_err(|e| MstError::InvalidNode(format!("key is not UTF-8: {}", e)))?;
        validate_key(key)?;
        if !last_key.is_empty() && full.as_slice() <= last_key.as_slice() {
            return Err(MstError::InvalidNode(format!("keys out of order at {}", key)).into());
        }

        leaves.push(SmolStr::new(key));
        last_key = full;
    }

    let layer = layer.or_else(|| leaves.first().map(|k| layer_for_key(k)));
    let child_layer = match layer {
        Some(0) if data.left.is_some() || data.entries.iter().any(|e| e.tree.is_some()) => {
            return Err(MstError::InvalidNode("subtree below layer 0".into()).into());
        }
        Some(l) => Some(l.saturating_sub(1)),
        None => None,
    };
    let child = |cid| NodeEntry::Tree(Mst::from_pointer(storage.clone(), cid, child_layer, verify_reads));

    let mut entries = Vec::with_capacity(leaves.len() * 2 + 1);
    if let Some(left) = data.left {
        entries.push(child(left));
    }
    for (key, entry) in leaves.into_iter().zip(&data.entries) {
        entries.push(NodeEntry::Leaf {
            key,
            value: entry.value,
        });
        if let Some(tree) = entry.tree {
            entries.push(child(tree));
        }
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RepoErrorKind;
    use crate::storage::MemoryBlockStore;
    use atrepo_common::cid::cid_for_cbor;

    #[test]
    fn test_validate_key_valid() {
        assert!(validate_key("app.bsky.feed.post/abc123").is_ok());
        assert!(validate_key("foo.bar/test-key_2024").is_ok());
        assert!(validate_key("a").is_ok());
        assert!(validate_key(&"a".repeat(256)).is_ok());
    }

    #[test]
    fn test_validate_key_rejects() {
        assert!(validate_key("").is_err());
        assert!(validate_key(&"a".repeat(257)).is_err());
        assert!(validate_key("key with spaces").is_err());
        assert!(validate_key("key@invalid").is_err());
        assert!(validate_key("key#hash").is_err());
        assert!(validate_key("coll/ké").is_err());
    }

    #[test]
    fn test_common_prefix_len() {
        assert_eq!(common_prefix_len("abc", "abc"), 3);
        assert_eq!(common_prefix_len("", "abc"), 0);
        assert_eq!(common_prefix_len("abc", ""), 0);
        assert_eq!(common_prefix_len("ab", "abc"), 2);
        assert_eq!(common_prefix_len("abc", "ab"), 2);
        assert_eq!(common_prefix_len("abcde", "abc"), 3);
        assert_eq!(common_prefix_len("abcde", "abb"), 2);
        assert_eq!(common_prefix_len("abc", "abc\x00"), 3);
        assert_eq!(common_prefix_len("hello", "help"), 3);
    }

    #[test]
    fn test_layer_for_key() {
        assert_eq!(layer_for_key(""), 0);
        assert_eq!(layer_for_key("asdf"), 0);
        assert_eq!(layer_for_key("blue"), 1);
        assert_eq!(layer_for_key("2653ae71"), 0);
        assert_eq!(layer_for_key("88bfafc7"), 2);
        assert_eq!(layer_for_key("2a92d355"), 4);
        assert_eq!(layer_for_key("884976f5"), 6);
        assert_eq!(layer_for_key("app.bsky.feed.post/454397e440ec"), 4);
        assert_eq!(layer_for_key("app.bsky.feed.post/9adeb165882c"), 8);
    }

    #[test]
    fn test_layer_for_record_keys() {
        let layer = |c: char| layer_for_key(&format!("com.example.record/3jqfcqzm3f{}2j", c));
        for c in ['n', 'o', 'p', 'r', 't', 'u', 'z'] {
            assert_eq!(layer(c), 0, "{}", c);
        }
        assert_eq!(layer('q'), 1);
        assert_eq!(layer('s'), 1);
        assert_eq!(layer('x'), 2);
    }

    #[test]
    fn test_leading_zeros() {
        assert_eq!(leading_zeros(&[0, 0, 0, 1]), 31);
        assert_eq!(leading_zeros(&[0xFF, 0, 0]), 0);
        assert_eq!(leading_zeros(&[0, 0x80]), 8);
        assert_eq!(leading_zeros(&[0, 0x01]), 15);
    }

    fn leaf(suffix: &str, prefix_len: u8) -> TreeEntry {
        TreeEntry {
            key_suffix: Bytes::copy_from_slice(suffix.as_bytes()),
            prefix_len,
            tree: None,
            value: cid_for_cbor(b"\xa0").unwrap(),
        }
    }

    #[test]
    fn test_deserialize_rebuilds_prefixed_keys() {
        let storage = Arc::new(MemoryBlockStore::new());
        let data = NodeData {
            entries: vec![leaf("com.example/aa", 0), leaf("b", 13)],
            left: None,
        };
        let entries = deserialize_node_data(&storage, &data, None, false).unwrap();
        let keys: Vec<_> = entries.iter().filter_map(|e| e.leaf_key()).collect();
        assert_eq!(keys, vec!["com.example/aa", "com.example/ab"]);
    }

    #[test]
    fn test_deserialize_rejects_bad_prefix() {
        let storage = Arc::new(MemoryBlockStore::new());
        let data = NodeData {
            entries: vec![leaf("a", 3)],
            left: None,
        };
        let err = deserialize_node_data(&storage, &data, None, false).unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::InvalidMst);
    }

    #[test]
    fn test_deserialize_rejects_unsorted_keys() {
        let storage = Arc::new(MemoryBlockStore::new());
        let data = NodeData {
            entries: vec![leaf("b", 0), leaf("a", 0)],
            left: None,
        };
        let err = deserialize_node_data(&storage, &data, None, false).unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::InvalidMst);

        let dup = NodeData {
            entries: vec![leaf("a", 0), leaf("", 1)],
            left: None,
        };
        assert!(deserialize_node_data(&storage, &dup, None, false).is_err());
    }
}
