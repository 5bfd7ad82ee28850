//! Record proof verification
//!
//! Verifies merkle proofs for individual record existence/non-existence.
//!
//! **Proof structure:**
//! - CAR file rooted at the commit, containing:
//!   - Commit block (with signature)
//!   - MST node blocks along the path to the record(s)
//!   - Record blocks (if proving existence)
//!
//! **Verification:**
//! 1. Parse CAR blocks into temporary storage
//! 2. Load and verify commit (DID + signature)
//! 3. Load MST using ONLY blocks from CAR
//! 4. For each claim, walk to the key and compare what is there
//!
//! A walk that needs a block the proof does not carry puts that claim in
//! [`ProofReport::unverified`]; it never counts as proof of absence.
//!
//! [`verify_commit_proof`] checks a whole commit instead: the proof blocks
//! must be enough to undo the commit's operations and land on the previous
//! data root.

use std::sync::Arc;

use super::{Commit, KeyResolver};
use crate::car::{CarMode, parse_car_bytes};
use crate::error::{ProofError, RepoError, RepoErrorKind, Result};
use crate::mst::{Mst, RepoOp, VerifiedWriteOp};
use crate::storage::{BlockStore, MemoryBlockStore};
use atrepo_common::cid::cid_string;
use atrepo_common::{Did, IpldCid, Nsid, Rkey};
use smol_str::{SmolStr, format_smolstr};

/// Something a proof can be asked about: a key and the value expected there
pub trait Claim {
    /// MST key the claim is about
    fn key(&self) -> SmolStr;

    /// Expected value; `None` claims the key is absent
    fn expected(&self) -> Option<IpldCid>;
}

/// A claim about a record's CID at a specific path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordClaim {
    /// Collection NSID (e.g., "app.bsky.feed.post")
    pub collection: Nsid,

    /// Record key (TID or other identifier)
    pub rkey: Rkey,

    /// Expected CID of the record
    /// - Some(cid): claiming record exists with this CID
    /// - None: claiming record does not exist
    pub cid: Option<IpldCid>,
}

impl RecordClaim {
    /// Claim that a record exists with `cid`, or is absent for `None`
    pub fn new(collection: Nsid, rkey: Rkey, cid: Option<IpldCid>) -> Self {
        Self {
            collection,
            rkey,
            cid,
        }
    }
}

impl Claim for RecordClaim {
    fn key(&self) -> SmolStr {
        format_smolstr!("{}/{}", self.collection, self.rkey)
    }

    fn expected(&self) -> Option<IpldCid> {
        self.cid
    }
}

/// A claim about a raw MST key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyClaim {
    /// MST key
    pub key: SmolStr,
    /// Expected value, `None` for absence
    pub cid: Option<IpldCid>,
}

impl Claim for KeyClaim {
    fn key(&self) -> SmolStr {
        self.key.clone()
    }

    fn expected(&self) -> Option<IpldCid> {
        self.cid
    }
}

/// A claim whose walk completed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedClaim<C> {
    /// The claim as given
    pub claim: C,
    /// What the tree actually holds under the key
    pub found: Option<IpldCid>,
    /// Whether `found` agrees with the claim
    pub matches: bool,
}

/// A claim the proof could not settle
#[derive(Debug)]
pub struct UnverifiedClaim<C> {
    /// The claim as given
    pub claim: C,
    /// Why the walk stopped (`IncompleteProof` when a block was missing)
    pub error: RepoError,
}

/// Result of proof verification
#[derive(Debug)]
pub struct ProofReport<C = RecordClaim> {
    /// Signed commit the proof is rooted at
    pub commit: Commit,
    /// Claims whose walk completed, matching or not
    pub verified: Vec<VerifiedClaim<C>>,
    /// Claims the supplied blocks could not settle
    pub unverified: Vec<UnverifiedClaim<C>>,
}

impl<C> ProofReport<C> {
    /// True when every claim was settled and holds
    pub fn all_hold(&self) -> bool {
        self.unverified.is_empty() && self.verified.iter().all(|v| v.matches)
    }
}

/// Parse a proof CAR into a scratch store holding only its blocks
///
/// Returns the store and the decoded commit at the CAR root.
async fn load_proof(car_bytes: &[u8]) -> Result<(Arc<MemoryBlockStore>, Commit)> {
    let parsed = parse_car_bytes(car_bytes, CarMode::Strict).await?;
    let commit_cid = parsed.root()?;
    let storage = Arc::new(MemoryBlockStore::new_from_blocks(parsed.blocks));

    let commit_bytes = storage
        .get(&commit_cid)
        .await?
        .ok_or_else(|| ProofError::CommitNotFound {
            cid: cid_string(&commit_cid),
        })?;
    let commit = Commit::from_cbor(&commit_bytes)?;

    Ok((storage, commit))
}

/// Verify record proofs from a CAR file
///
/// **Inputs:**
/// - `car_bytes`: CAR file containing commit + MST blocks + record blocks
/// - `claims`: Records to verify (existence or non-existence)
/// - `owner`: DID the repository must belong to
/// - `resolver`: Looks up the owner's signing key
///
/// **Returns** a [`ProofReport`]:
/// - `verified`: Claims whose walk completed, with `matches` telling whether
///   the tree agrees
/// - `unverified`: Claims that could not be walked with the supplied blocks
///
/// **Security:**
/// - Fails with `WrongSigner` if the commit is for another DID
/// - Fails with `InvalidSignature` if the owner's key did not sign it
/// - Uses ONLY blocks from CAR (merkle proof property)
///
/// # Example
///
/// ```rust,ignore
/// let claims = vec![
///     RecordClaim::new(posts.clone(), Rkey::new("3l4qpz7ajrc2a")?, Some(record_cid)),
///     RecordClaim::new(posts, Rkey::new("nonexistent")?, None),
/// ];
///
/// let report = verify_proofs(&car_bytes, claims, &did, &DidKeyResolver).await?;
/// assert!(report.all_hold());
/// ```
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(owner = %owner, claims = claims.len())))]
pub async fn verify_proofs<C: Claim>(
    car_bytes: &[u8],
    claims: Vec<C>,
    owner: &Did,
    resolver: &impl KeyResolver,
) -> Result<ProofReport<C>> {
    let (storage, commit) = load_proof(car_bytes).await?;
    commit.verify_for(owner, resolver).await?;

    let mst = Mst::load(storage, *commit.data(), None);

    let mut verified = Vec::new();
    let mut unverified = Vec::new();

    for claim in claims {
        match mst.get(&claim.key()).await {
            Ok(found) => {
                let matches = found == claim.expected();
                verified.push(VerifiedClaim {
                    claim,
                    found,
                    matches,
                });
            }
            Err(e) if *e.kind() == RepoErrorKind::BlockNotFound => {
                unverified.push(UnverifiedClaim {
                    claim,
                    error: RepoError::incomplete_proof(e),
                });
            }
            Err(e) if *e.kind() == RepoErrorKind::InvalidKey => {
                unverified.push(UnverifiedClaim { claim, error: e });
            }
            Err(e) => return Err(e),
        }
    }

    #[cfg(feature = "tracing")]
    tracing::debug!(
        verified = verified.len(),
        unverified = unverified.len(),
        "checked proof claims"
    );

    Ok(ProofReport {
        commit,
        verified,
        unverified,
    })
}

/// Verify a commit against its operations using only the proof blocks
///
/// Loads the tree at the commit's data root from `car_bytes` alone, applies
/// the inverse of every op in reverse order (create becomes delete, update
/// restores `prev`, delete re-adds `prev`) and requires the result to be
/// `prev_data`. This is how a receiver checks a sync 1.1 commit without
/// holding the repository.
///
/// Fails with `IncompleteProof` when the blocks do not reach every node the
/// inversion touches, and with `InvalidCommit` when the ops do not explain
/// the change between the two roots.
#[cfg_attr(feature = "tracing", tracing::instrument(skip_all, fields(owner = %owner, ops = ops.len())))]
pub async fn verify_commit_proof(
    car_bytes: &[u8],
    ops: &[RepoOp],
    prev_data: IpldCid,
    owner: &Did,
    resolver: &impl KeyResolver,
) -> Result<Commit> {
    let (storage, commit) = load_proof(car_bytes).await?;
    commit.verify_for(owner, resolver).await?;

    let inverse = ops
        .iter()
        .rev()
        .map(|op| {
            op.to_verified_op()
                .map(|op| op.invert())
                .ok_or_else(|| ProofError::InvalidPath(format!("{} {} lacks a CID", op.action, op.path)))
        })
        .collect::<std::result::Result<Vec<VerifiedWriteOp>, _>>()?;

    let mst = Mst::load(storage, *commit.data(), None);
    let inverted = mst.batch(&inverse).await.map_err(|e| match e.kind() {
        RepoErrorKind::BlockNotFound => RepoError::incomplete_proof(e),
        _ => e,
    })?;
    let actual = inverted.root().await.map_err(|e| match e.kind() {
        RepoErrorKind::BlockNotFound => RepoError::incomplete_proof(e),
        _ => e,
    })?;

    if actual != prev_data {
        return Err(ProofError::InversionMismatch {
            expected: cid_string(&prev_data),
            actual: cid_string(&actual),
        }
        .into());
    }

    Ok(commit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::write_car_bytes;
    use crate::commit::{DidKeyResolver, SigningKey, StaticKeyResolver, UnsignedCommit};
    use crate::mst::OpAction;
    use crate::storage::BlockMap;
    use atrepo_common::cid::cid_for_cbor;
    use atrepo_common::types::Ticker;
    use rand::rngs::OsRng;

    fn test_signing_key() -> k256::ecdsa::SigningKey {
        k256::ecdsa::SigningKey::random(&mut OsRng)
    }

    fn posts() -> Nsid {
        Nsid::new("app.bsky.feed.post").unwrap()
    }

    fn claim(rkey: &str, cid: Option<IpldCid>) -> RecordClaim {
        RecordClaim::new(posts(), Rkey::new(rkey).unwrap(), cid)
    }

    /// Record block holding `n`
    async fn put_record(storage: &MemoryBlockStore, n: u8) -> IpldCid {
        storage.put(&[0x18, n]).await.unwrap()
    }

    /// Sign a commit over `mst` and wrap it with `blocks` in a CAR
    async fn proof_car(
        mst: &Mst<MemoryBlockStore>,
        key: &k256::ecdsa::SigningKey,
        did: &Did,
        mut blocks: BlockMap,
    ) -> Vec<u8> {
        let data = mst.persist().await.unwrap();
        let commit = UnsignedCommit::new(did.clone(), data, Ticker::new().next(None), None)
            .sign(key)
            .unwrap();
        let (commit_cid, commit_bytes) = commit.to_block().unwrap();
        blocks.insert(commit_cid, commit_bytes);
        write_car_bytes(commit_cid, blocks).await.unwrap()
    }

    async fn two_record_tree() -> (Arc<MemoryBlockStore>, Mst<MemoryBlockStore>, IpldCid, IpldCid) {
        let storage = Arc::new(MemoryBlockStore::new());
        let cid1 = put_record(&storage, 1).await;
        let cid2 = put_record(&storage, 2).await;
        let mst = Mst::new(storage.clone())
            .add("app.bsky.feed.post/abc123", cid1)
            .await
            .unwrap()
            .add("app.bsky.feed.post/def456", cid2)
            .await
            .unwrap();
        mst.persist().await.unwrap();
        (storage, mst, cid1, cid2)
    }

    #[tokio::test]
    async fn test_verify_proofs_record_exists() {
        let (_, mst, cid1, _) = two_record_tree().await;
        let sk = test_signing_key();
        let did = sk.did().unwrap();

        let mut blocks = BlockMap::new();
        mst.blocks_for_path("app.bsky.feed.post/abc123", &mut blocks)
            .await
            .unwrap();
        assert!(blocks.contains_key(&cid1));
        let car = proof_car(&mst, &sk, &did, blocks).await;

        let report = verify_proofs(&car, vec![claim("abc123", Some(cid1))], &did, &DidKeyResolver)
            .await
            .unwrap();

        assert_eq!(report.verified.len(), 1);
        assert!(report.verified[0].matches);
        assert_eq!(report.verified[0].found, Some(cid1));
        assert!(report.unverified.is_empty());
        assert!(report.all_hold());
    }

    #[tokio::test]
    async fn test_verify_proofs_record_not_exists() {
        let (_, mst, _, _) = two_record_tree().await;
        let sk = test_signing_key();
        let did = sk.did().unwrap();

        let mut blocks = BlockMap::new();
        mst.blocks_for_path("app.bsky.feed.post/xyz789", &mut blocks)
            .await
            .unwrap();
        let car = proof_car(&mst, &sk, &did, blocks).await;

        let report = verify_proofs(&car, vec![claim("xyz789", None)], &did, &DidKeyResolver)
            .await
            .unwrap();

        assert!(report.all_hold());
        assert_eq!(report.verified[0].found, None);
    }

    #[tokio::test]
    async fn test_verify_proofs_multiple_claims_mixed() {
        let (_, mst, cid1, cid2) = two_record_tree().await;
        let sk = test_signing_key();
        let did = sk.did().unwrap();

        let mut blocks = BlockMap::new();
        for key in ["abc123", "def456", "xyz789"] {
            mst.blocks_for_path(&format!("app.bsky.feed.post/{}", key), &mut blocks)
                .await
                .unwrap();
        }
        let car = proof_car(&mst, &sk, &did, blocks).await;

        let claims = vec![
            claim("abc123", Some(cid1)),
            claim("def456", Some(cid_for_cbor(&[0x18, 99]).unwrap())),
            claim("xyz789", None),
            claim("abc123", None),
        ];
        let report = verify_proofs(&car, claims, &did, &DidKeyResolver).await.unwrap();

        let outcomes: Vec<_> = report
            .verified
            .iter()
            .map(|v| (v.claim.rkey.as_str(), v.matches))
            .collect();
        assert_eq!(
            outcomes,
            vec![("abc123", true), ("def456", false), ("xyz789", true), ("abc123", false)]
        );
        assert_eq!(report.verified[1].found, Some(cid2));
        assert!(!report.all_hold());
    }

    #[tokio::test]
    async fn test_missing_block_is_unverified_not_absent() {
        let (storage, _, _, _) = two_record_tree().await;
        // enough records that the tree has more than one node
        let mut mst = Mst::new(storage.clone());
        for i in 0..40u8 {
            let cid = put_record(&storage, i).await;
            mst = mst.add(&format!("app.bsky.feed.post/k{}", i), cid).await.unwrap();
        }
        assert!(mst.walk_nodes().await.unwrap().len() > 1);

        let sk = test_signing_key();
        let did = sk.did().unwrap();
        // root node only
        let mut blocks = BlockMap::new();
        let (root, root_bytes) = mst.node_block().await.unwrap();
        blocks.insert(root, root_bytes);
        let car = proof_car(&mst, &sk, &did, blocks).await;

        let claims: Vec<_> = (0..40).map(|i| claim(&format!("k{}", i), None)).collect();
        let report = verify_proofs(&car, claims, &did, &DidKeyResolver).await.unwrap();

        assert!(!report.unverified.is_empty());
        for u in &report.unverified {
            assert_eq!(*u.error.kind(), RepoErrorKind::IncompleteProof);
        }
        // keys sitting in the root node are still settled, and present
        assert!(report.verified.iter().all(|v| !v.matches));
    }

    #[tokio::test]
    async fn test_verify_proofs_wrong_did() {
        let (_, mst, cid1, _) = two_record_tree().await;
        let sk = test_signing_key();
        let did = sk.did().unwrap();

        let mut blocks = BlockMap::new();
        mst.blocks_for_path("app.bsky.feed.post/abc123", &mut blocks)
            .await
            .unwrap();
        let car = proof_car(&mst, &sk, &did, blocks).await;

        let wrong_did = Did::new("did:plc:wrong").unwrap();
        let err = verify_proofs(&car, vec![claim("abc123", Some(cid1))], &wrong_did, &DidKeyResolver)
            .await
            .unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::WrongSigner);
    }

    #[tokio::test]
    async fn test_verify_proofs_bad_signature() {
        let (_, mst, cid1, _) = two_record_tree().await;
        let sk = test_signing_key();
        let did = Did::new("did:plc:test").unwrap();

        let mut blocks = BlockMap::new();
        mst.blocks_for_path("app.bsky.feed.post/abc123", &mut blocks)
            .await
            .unwrap();
        let car = proof_car(&mst, &sk, &did, blocks).await;

        // resolver hands back some other key for the DID
        let resolver = StaticKeyResolver::new().with_key(did.clone(), test_signing_key().public_key());
        let err = verify_proofs(&car, vec![claim("abc123", Some(cid1))], &did, &resolver)
            .await
            .unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::InvalidSignature);
    }

    #[tokio::test]
    async fn test_tampered_block_is_rejected() {
        let (_, mst, cid1, _) = two_record_tree().await;
        let sk = test_signing_key();
        let did = sk.did().unwrap();

        let mut blocks = BlockMap::new();
        mst.blocks_for_path("app.bsky.feed.post/abc123", &mut blocks)
            .await
            .unwrap();
        let mut car = proof_car(&mst, &sk, &did, blocks).await;
        let last = car.len() - 1;
        car[last] ^= 0x01;

        let result = verify_proofs(&car, vec![claim("abc123", Some(cid1))], &did, &DidKeyResolver).await;
        match result {
            Ok(report) => assert!(!report.all_hold()),
            Err(e) => assert!(matches!(
                e.kind(),
                RepoErrorKind::CidMismatch | RepoErrorKind::Car | RepoErrorKind::Decode
            )),
        }
    }

    #[tokio::test]
    async fn test_commit_proof_inverts_ops() {
        let (storage, before, _, cid2) = two_record_tree().await;
        let prev_data = before.persist().await.unwrap();
        let cid3 = put_record(&storage, 3).await;

        let after = before
            .add("app.bsky.feed.post/ghi789", cid3)
            .await
            .unwrap()
            .delete("app.bsky.feed.post/def456")
            .await
            .unwrap();

        let ops = vec![
            RepoOp {
                action: OpAction::Create,
                path: "app.bsky.feed.post/ghi789".into(),
                cid: Some(cid3),
                prev: None,
            },
            RepoOp {
                action: OpAction::Delete,
                path: "app.bsky.feed.post/def456".into(),
                cid: None,
                prev: Some(cid2),
            },
        ];

        let mut blocks = BlockMap::new();
        for op in &ops {
            after.blocks_for_path(&op.path, &mut blocks).await.unwrap();
        }
        let sk = test_signing_key();
        let did = sk.did().unwrap();
        let car = proof_car(&after, &sk, &did, blocks).await;

        let commit = verify_commit_proof(&car, &ops, prev_data, &did, &DidKeyResolver)
            .await
            .unwrap();
        assert_eq!(commit.data, after.root().await.unwrap());

        // claiming a different starting point is caught
        let other = cid_for_cbor(&[0xa0]).unwrap();
        let err = verify_commit_proof(&car, &ops, other, &did, &DidKeyResolver)
            .await
            .unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::InvalidCommit);

        // dropping an op leaves a tree the ops don't explain
        let err = verify_commit_proof(&car, &ops[..1], prev_data, &did, &DidKeyResolver)
            .await
            .unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::InvalidCommit);
    }

    #[tokio::test]
    async fn test_commit_proof_rejects_op_without_cid() {
        let (_, mst, _, _) = two_record_tree().await;
        let sk = test_signing_key();
        let did = sk.did().unwrap();
        let car = proof_car(&mst, &sk, &did, BlockMap::new()).await;

        let ops = vec![RepoOp {
            action: OpAction::Create,
            path: "app.bsky.feed.post/abc123".into(),
            cid: None,
            prev: None,
        }];
        let prev = mst.root().await.unwrap();
        assert!(verify_commit_proof(&car, &ops, prev, &did, &DidKeyResolver).await.is_err());
    }

    #[tokio::test]
    async fn test_commit_proof_without_blocks_is_incomplete() {
        let (storage, before, _, _) = two_record_tree().await;
        let prev_data = before.root().await.unwrap();
        let cid3 = put_record(&storage, 3).await;
        let after = before.add("app.bsky.feed.post/ghi789", cid3).await.unwrap();

        let sk = test_signing_key();
        let did = sk.did().unwrap();
        let car = proof_car(&after, &sk, &did, BlockMap::new()).await;

        let ops = vec![RepoOp {
            action: OpAction::Create,
            path: "app.bsky.feed.post/ghi789".into(),
            cid: Some(cid3),
            prev: None,
        }];
        let err = verify_commit_proof(&car, &ops, prev_data, &did, &DidKeyResolver)
            .await
            .unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::IncompleteProof);
    }
}
