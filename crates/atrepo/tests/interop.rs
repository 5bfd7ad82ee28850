//! Interoperability tests using vectors from atproto-interop-tests
//!
//! See: https://github.com/bluesky-social/atproto-interop-tests/tree/main/mst
//!
//! Every leaf in these trees maps to the same record CID, so the root CIDs
//! depend only on the key set.

use std::sync::Arc;

use atrepo::mst::util::{common_prefix_len, layer_for_key};
use atrepo::storage::BlockStore;
use atrepo::{MemoryBlockStore, Mst};
use atrepo_common::IpldCid;
use atrepo_common::cid::cid_string;
use serde::Deserialize;

const LEAF_CID: &str = "bafyreie5cvv4h45feadgeuwhbcutmh6t2ceseocckahdoe6uat64zmz454";
const EMPTY_ROOT: &str = "bafyreie5737gdxlw5i64vzichcalba3z2v5n6icifvx5xytvske7mr3hpm";

fn leaf_cid() -> IpldCid {
    LEAF_CID.parse().unwrap()
}

/// `com.example.record/3jqfcqzm<suffix>2j`
fn key(suffix: &str) -> String {
    format!("com.example.record/3jqfcqzm{}2j", suffix)
}

async fn tree_of(suffixes: &[&str]) -> Mst<MemoryBlockStore> {
    let mut mst = Mst::new(Arc::new(MemoryBlockStore::new()));
    for suffix in suffixes {
        mst = mst.add(&key(suffix), leaf_cid()).await.unwrap();
    }
    mst
}

async fn root_of(mst: &Mst<MemoryBlockStore>) -> String {
    cid_string(&mst.root().await.unwrap())
}

#[derive(Debug, Deserialize)]
struct KeyHeightTest {
    key: String,
    height: usize,
}

#[derive(Debug, Deserialize)]
struct CommonPrefixTest {
    left: String,
    right: String,
    len: usize,
}

const KEY_HEIGHTS: &str = r#"[
    {"key": "asdf", "height": 0},
    {"key": "blue", "height": 1},
    {"key": "2653ae71", "height": 0},
    {"key": "88bfafc7", "height": 2},
    {"key": "2a92d355", "height": 4},
    {"key": "884976f5", "height": 6},
    {"key": "app.bsky.feed.post/454397e440ec", "height": 4},
    {"key": "app.bsky.feed.post/9adeb165882c", "height": 8}
]"#;

const COMMON_PREFIX: &str = r#"[
    {"left": "", "right": "", "len": 0},
    {"left": "abc", "right": "abc", "len": 3},
    {"left": "", "right": "abc", "len": 0},
    {"left": "abc", "right": "", "len": 0},
    {"left": "ab", "right": "abc", "len": 2},
    {"left": "abc", "right": "ab", "len": 2},
    {"left": "abcde", "right": "abc", "len": 3},
    {"left": "abc", "right": "abcde", "len": 3},
    {"left": "abcde", "right": "abc1", "len": 3},
    {"left": "abcde", "right": "abb", "len": 2},
    {"left": "abcde", "right": "qbb", "len": 0},
    {"left": "abc", "right": "abc\u0000", "len": 3},
    {"left": "abc\u0000", "right": "abc", "len": 3}
]"#;

#[test]
fn test_layer_for_key_interop() {
    let tests: Vec<KeyHeightTest> = serde_ipld_dagjson::from_slice(KEY_HEIGHTS.as_bytes()).unwrap();

    for test in tests {
        let result = layer_for_key(&test.key);
        assert_eq!(
            result, test.height,
            "layer_for_key({:?}) = {}, expected {}",
            test.key, result, test.height
        );
    }
}

#[test]
fn test_record_key_layers() {
    for c in ["3fn", "3fo", "3fp", "3fr", "3ft", "3fu", "3fz"] {
        assert_eq!(layer_for_key(&key(c)), 0, "{}", c);
    }
    assert_eq!(layer_for_key(&key("3fq")), 1);
    assert_eq!(layer_for_key(&key("3fs")), 1);
    assert_eq!(layer_for_key(&key("3fx")), 2);
}

#[test]
fn test_common_prefix_interop() {
    let tests: Vec<CommonPrefixTest> =
        serde_ipld_dagjson::from_slice(COMMON_PREFIX.as_bytes()).unwrap();

    for test in tests {
        let result = common_prefix_len(&test.left, &test.right);
        assert_eq!(
            result, test.len,
            "common_prefix_len({:?}, {:?}) = {}, expected {}",
            test.left, test.right, result, test.len
        );
    }
}

#[tokio::test]
async fn test_empty_tree_root() {
    let mst = tree_of(&[]).await;
    assert_eq!(root_of(&mst).await, EMPTY_ROOT);
    assert_eq!(mst.leaf_count().await.unwrap(), 0);
}

#[tokio::test]
async fn test_trivial_tree_root() {
    let mst = tree_of(&["3fo"]).await;
    assert_eq!(
        root_of(&mst).await,
        "bafyreibj4lsc3aqnrvphp5xmrnfoorvru4wynt6lwidqbm2623a6tatzdu"
    );
    assert_eq!(mst.leaf_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_single_layer2_tree_root() {
    let mst = tree_of(&["3fx"]).await;
    assert_eq!(
        root_of(&mst).await,
        "bafyreih7wfei65pxzhauoibu3ls7jgmkju4bspy4t2ha2qdjnzqvoy33ai"
    );
}

#[tokio::test]
async fn test_simple_tree_root() {
    let mst = tree_of(&["3fp", "3fr", "3fs", "3ft", "4fc"]).await;
    assert_eq!(
        root_of(&mst).await,
        "bafyreicmahysq4n6wfuxo522m6dpiy7z7qzym3dzs756t5n7nfdgccwq7m"
    );
    assert_eq!(mst.leaf_count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_simple_tree_survives_storage() {
    let mst = tree_of(&["3fp", "3fr", "3fs", "3ft", "4fc"]).await;
    let root = mst.persist().await.unwrap();

    let reloaded = Mst::load(mst.storage().clone(), root, None);
    for suffix in ["3fp", "3fr", "3fs", "3ft", "4fc"] {
        assert_eq!(reloaded.get(&key(suffix)).await.unwrap(), Some(leaf_cid()));
    }
    assert_eq!(reloaded.get(&key("3fq")).await.unwrap(), None);
    assert_eq!(root_of(&reloaded).await, root_of(&mst).await);
    assert!(mst.storage().has(&root).await.unwrap());
}

#[tokio::test]
async fn test_trim_top_on_delete() {
    let mst = tree_of(&["3fn", "3fo", "3fp", "3fs", "3ft", "3fu"]).await;
    assert_eq!(
        root_of(&mst).await,
        "bafyreifnqrwbk6ffmyaz5qtujqrzf5qmxf7cbxvgzktl4e3gabuxbtatv4"
    );

    // removing the only layer 1 key drops the root a level
    let trimmed = mst.delete(&key("3fs")).await.unwrap();
    assert_eq!(
        root_of(&trimmed).await,
        "bafyreie4kjuxbwkhzg2i5dljaswcroeih4dgiqq6pazcmunwt2byd725vi"
    );
    assert_eq!(trimmed.leaf_count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_insertion_splits_two_layers_down() {
    let initial = [
        "3fo", "3fp", "3fr", "3fs", "3ft", "3fz", "4fc", "4fd", "4ff", "4fg", "4fh",
    ];
    let mst = tree_of(&initial).await;
    let original = "bafyreiettyludka6fpgp33stwxfuwhkzlur6chs4d2v4nkmq2j3ogpdjem";
    assert_eq!(root_of(&mst).await, original);

    let split = mst.add(&key("3fx"), leaf_cid()).await.unwrap();
    assert_eq!(
        root_of(&split).await,
        "bafyreid2x5eqs4w4qxvc5jiwda4cien3gw2q6cshofxwnvv7iucrmfohpm"
    );

    let merged = split.delete(&key("3fx")).await.unwrap();
    assert_eq!(root_of(&merged).await, original);
}

#[tokio::test]
async fn test_new_layers_two_higher_than_existing() {
    let mst = tree_of(&["3ft", "3fz"]).await;
    let two = "bafyreidfcktqnfmykz2ps3dbul35pepleq7kvv526g47xahuz3rqtptmky";
    assert_eq!(root_of(&mst).await, two);

    let with_b = mst.add(&key("3fx"), leaf_cid()).await.unwrap();
    let three = "bafyreiavxaxdz7o7rbvr3zg2liox2yww46t7g6hkehx4i4h3lwudly7dhy";
    assert_eq!(root_of(&with_b).await, three);

    let without_b = with_b.delete(&key("3fx")).await.unwrap();
    assert_eq!(root_of(&without_b).await, two);

    let with_d = with_b.add(&key("4fd"), leaf_cid()).await.unwrap();
    assert_eq!(
        root_of(&with_d).await,
        "bafyreig4jv3vuajbsybhyvb7gggvpwh2zszwfyttjrj6qwvcsp24h6popu"
    );

    let without_d = with_d.delete(&key("4fd")).await.unwrap();
    assert_eq!(root_of(&without_d).await, three);
}

#[tokio::test]
async fn test_vectors_independent_of_insertion_order() {
    let forward = tree_of(&["3fp", "3fr", "3fs", "3ft", "4fc"]).await;
    let backward = tree_of(&["4fc", "3ft", "3fs", "3fr", "3fp"]).await;
    let mixed = tree_of(&["3fs", "4fc", "3fp", "3ft", "3fr"]).await;

    let root = root_of(&forward).await;
    assert_eq!(root_of(&backward).await, root);
    assert_eq!(root_of(&mixed).await, root);
}
