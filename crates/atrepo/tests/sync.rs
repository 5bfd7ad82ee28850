//! Moving a repository between stores through CAR archives
//!
//! Full archives bootstrap a replica, diff archives catch it up, and
//! anything the owner did not sign, or that leaves the tree incomplete, is
//! refused without touching the replica's head.

use std::collections::BTreeMap;
use std::sync::Arc;

use atrepo::car::{CarMode, parse_car_bytes};
use atrepo::storage::BlockStore;
use atrepo::{
    CommitData, DidKeyResolver, FileBlockStore, MemoryBlockStore, RecordWriteOp, RepoConfig,
    RepoErrorKind, Repository, SigningKey, StaticKeyResolver,
};
use atrepo_common::{Did, Nsid, Rkey};
use ipld_core::ipld::Ipld;
use rand::rngs::OsRng;

fn post(n: u32) -> Ipld {
    let mut record = BTreeMap::new();
    record.insert("$type".to_string(), Ipld::String("app.bsky.feed.post".into()));
    record.insert("text".to_string(), Ipld::String(format!("post number {}", n)));
    Ipld::Map(record)
}

fn posts() -> Nsid {
    Nsid::new("app.bsky.feed.post").unwrap()
}

fn create(n: u32) -> RecordWriteOp {
    RecordWriteOp::Create {
        collection: posts(),
        rkey: Rkey::new(format!("3kpost{:04}", n)).unwrap(),
        record: post(n),
    }
}

async fn writer(key: &ed25519_dalek::SigningKey) -> Repository<MemoryBlockStore> {
    Repository::create_empty(
        Arc::new(MemoryBlockStore::new()),
        key.did().unwrap(),
        key,
        RepoConfig::default(),
    )
    .await
    .unwrap()
}

fn ed25519_key() -> ed25519_dalek::SigningKey {
    ed25519_dalek::SigningKey::generate(&mut OsRng)
}

async fn write_batches(
    repo: &mut Repository<MemoryBlockStore>,
    key: &ed25519_dalek::SigningKey,
    range: std::ops::Range<u32>,
) -> Vec<CommitData> {
    let mut commits = Vec::new();
    for chunk in range.collect::<Vec<_>>().chunks(10) {
        let ops: Vec<_> = chunk.iter().map(|n| create(*n)).collect();
        commits.push(repo.apply_writes(&ops, key).await.unwrap());
    }
    commits
}

async fn replica_of(
    repo: &Repository<MemoryBlockStore>,
) -> Repository<MemoryBlockStore> {
    let car = repo.full_archive().await.unwrap();
    Repository::load_from_archive(
        &car,
        Arc::new(MemoryBlockStore::new()),
        Some(repo.did()),
        &DidKeyResolver,
        RepoConfig::default(),
    )
    .await
    .unwrap()
}

async fn assert_same_contents(a: &Repository<MemoryBlockStore>, b: &Repository<MemoryBlockStore>) {
    assert_eq!(a.current_commit_cid(), b.current_commit_cid());
    assert_eq!(a.data(), b.data());
    assert_eq!(
        a.mst().leaves().await.unwrap(),
        b.mst().leaves().await.unwrap()
    );
}

#[tokio::test]
async fn test_full_archive_roundtrip() {
    let key = ed25519_key();
    let mut repo = writer(&key).await;
    write_batches(&mut repo, &key, 0..45).await;

    let car = repo.full_archive().await.unwrap();
    let parsed = parse_car_bytes(&car, CarMode::Strict).await.unwrap();
    assert_eq!(parsed.roots, vec![*repo.current_commit_cid()]);
    assert!(parsed.blocks.contains_key(repo.current_commit_cid()));

    let replica = replica_of(&repo).await;
    assert_same_contents(&repo, &replica).await;
    assert_eq!(replica.rev(), repo.rev());
    assert_eq!(
        replica
            .get_record_value(&posts(), &Rkey::new("3kpost0007").unwrap())
            .await
            .unwrap(),
        Some(post(7))
    );
}

#[tokio::test]
async fn test_load_rejects_other_owner() {
    let key = ed25519_key();
    let mut repo = writer(&key).await;
    write_batches(&mut repo, &key, 0..5).await;
    let car = repo.full_archive().await.unwrap();

    let someone_else = Did::new("did:plc:ewvi7nxzyoun6zhxrhs64oiz").unwrap();
    let err = Repository::load_from_archive(
        &car,
        Arc::new(MemoryBlockStore::new()),
        Some(&someone_else),
        &DidKeyResolver,
        RepoConfig::default(),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(*err.kind(), RepoErrorKind::WrongSigner);

    // resolver hands back a key that did not sign the commit
    let resolver = StaticKeyResolver::new().with_key(repo.did().clone(), ed25519_key().public_key());
    let storage = Arc::new(MemoryBlockStore::new());
    let err = Repository::load_from_archive(&car, storage.clone(), None, &resolver, RepoConfig::default())
        .await
        .err()
        .unwrap();
    assert_eq!(*err.kind(), RepoErrorKind::InvalidSignature);
    assert!(storage.is_empty());
}

#[tokio::test]
async fn test_load_rejects_incomplete_archive() {
    let key = ed25519_key();
    let mut repo = writer(&key).await;
    let commits = write_batches(&mut repo, &key, 0..40).await;

    // the last commit's blocks alone do not hold the untouched subtrees
    let partial = commits.last().unwrap().blocks_archive().await.unwrap();
    let storage = Arc::new(MemoryBlockStore::new());
    let err = Repository::load_from_archive(
        &partial,
        storage.clone(),
        None,
        &DidKeyResolver,
        RepoConfig::default(),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(*err.kind(), RepoErrorKind::BlockNotFound);
    assert!(storage.is_empty());
}

#[tokio::test]
async fn test_tampered_archive_fails_strict_parse() {
    let key = ed25519_key();
    let mut repo = writer(&key).await;
    write_batches(&mut repo, &key, 0..3).await;

    let mut car = repo.full_archive().await.unwrap();
    let last = car.len() - 1;
    car[last] ^= 0x01;

    let err = Repository::load_from_archive(
        &car,
        Arc::new(MemoryBlockStore::new()),
        None,
        &DidKeyResolver,
        RepoConfig::default(),
    )
    .await
    .err()
    .unwrap();
    assert_eq!(*err.kind(), RepoErrorKind::CidMismatch);
}

#[tokio::test]
async fn test_diff_archive_catches_up_replica() {
    let key = ed25519_key();
    let mut repo = writer(&key).await;
    write_batches(&mut repo, &key, 0..20).await;

    let mut replica = replica_of(&repo).await;
    let since = *repo.current_commit_cid();

    let mut commits = write_batches(&mut repo, &key, 20..50).await;
    let delete = RecordWriteOp::Delete {
        collection: posts(),
        rkey: Rkey::new("3kpost0003").unwrap(),
        prev: None,
    };
    commits.push(repo.apply_writes(&[delete], &key).await.unwrap());

    let car = repo.diff_archive(Some(since)).await.unwrap();
    let applied = replica.apply_diff_archive(&car, &DidKeyResolver).await.unwrap();

    let expected: Vec<_> = commits.iter().map(|c| c.cid).collect();
    assert_eq!(applied, expected);
    assert_same_contents(&repo, &replica).await;
    assert_eq!(
        replica
            .get_record(&posts(), &Rkey::new("3kpost0003").unwrap())
            .await
            .unwrap(),
        None
    );

    // nothing new
    let car = repo.diff_archive(Some(*repo.current_commit_cid())).await.unwrap();
    assert!(replica.apply_diff_archive(&car, &DidKeyResolver).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_diff_archive_smaller_than_full() {
    let key = ed25519_key();
    let mut repo = writer(&key).await;
    write_batches(&mut repo, &key, 0..100).await;
    let since = *repo.current_commit_cid();
    repo.apply_writes(&[create(500)], &key).await.unwrap();

    let diff = repo.diff_archive(Some(since)).await.unwrap();
    let full = repo.full_archive().await.unwrap();
    assert!(diff.len() < full.len());

    let parsed = parse_car_bytes(&diff, CarMode::Strict).await.unwrap();
    assert_eq!(parsed.roots, vec![*repo.current_commit_cid()]);
    let new_record = repo
        .get_record(&posts(), &Rkey::new("3kpost0500").unwrap())
        .await
        .unwrap()
        .unwrap();
    assert!(parsed.blocks.contains_key(&new_record));
}

#[tokio::test]
async fn test_whole_history_loads_as_full_archive() {
    let key = ed25519_key();
    let mut repo = writer(&key).await;
    write_batches(&mut repo, &key, 0..30).await;
    let delete = RecordWriteOp::Delete {
        collection: posts(),
        rkey: Rkey::new("3kpost0011").unwrap(),
        prev: None,
    };
    repo.apply_writes(&[delete], &key).await.unwrap();

    let history = repo.diff_archive(None).await.unwrap();
    let parsed = parse_car_bytes(&history, CarMode::Strict).await.unwrap();
    for cid in repo.commit_path(None).await.unwrap() {
        assert!(parsed.blocks.contains_key(&cid));
    }

    let copy = Repository::load_from_archive(
        &history,
        Arc::new(MemoryBlockStore::new()),
        Some(repo.did()),
        &DidKeyResolver,
        RepoConfig::default(),
    )
    .await
    .unwrap();
    assert_same_contents(&repo, &copy).await;
}

#[tokio::test]
async fn test_diff_from_another_signer_rejected() {
    let key = ed25519_key();
    let mut repo = writer(&key).await;
    write_batches(&mut repo, &key, 0..10).await;
    let mut replica = replica_of(&repo).await;
    let head = *replica.current_commit_cid();

    // same DID on the commits, but signed with a key the resolver does not know
    let impostor = ed25519_key();
    let did = repo.did().clone();
    let mut forged = Repository::from_commit(
        repo.storage().clone(),
        repo.current_commit_cid(),
        RepoConfig::default(),
    )
    .await
    .unwrap();
    forged.apply_writes(&[create(99)], &impostor).await.unwrap();
    let car = forged.diff_archive(Some(head)).await.unwrap();

    let resolver = StaticKeyResolver::new().with_key(did, key.public_key());
    let err = replica.apply_diff_archive(&car, &resolver).await.unwrap_err();
    assert_eq!(*err.kind(), RepoErrorKind::InvalidSignature);
    assert_eq!(replica.current_commit_cid(), &head);
}

#[tokio::test]
async fn test_diff_not_reaching_head_rejected() {
    let key = ed25519_key();
    let mut repo = writer(&key).await;
    write_batches(&mut repo, &key, 0..10).await;
    let mut replica = replica_of(&repo).await;
    let head = *replica.current_commit_cid();

    write_batches(&mut repo, &key, 10..20).await;
    let skip_from = *repo.current_commit_cid();
    write_batches(&mut repo, &key, 20..30).await;

    // starts after commits the replica has never seen
    let car = repo.diff_archive(Some(skip_from)).await.unwrap();
    assert!(replica.apply_diff_archive(&car, &DidKeyResolver).await.is_err());
    assert_eq!(replica.current_commit_cid(), &head);
    for cid in repo.commit_path(Some(head)).await.unwrap() {
        assert!(!replica.storage().has(&cid).await.unwrap());
    }
}

#[tokio::test]
async fn test_export_to_file_store() {
    let key = ed25519_key();
    let mut repo = writer(&key).await;
    write_batches(&mut repo, &key, 0..25).await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("repo.car");
    repo.export_car(&path).await.unwrap();

    let store = Arc::new(FileBlockStore::load(&path, CarMode::Strict).await.unwrap());
    assert_eq!(store.roots(), vec![*repo.current_commit_cid()]);

    let reopened = Repository::from_commit(store, repo.current_commit_cid(), RepoConfig::default())
        .await
        .unwrap();
    assert_eq!(reopened.data(), repo.data());
    assert_eq!(
        reopened.list_collection(&posts()).await.unwrap().len(),
        25
    );
}
