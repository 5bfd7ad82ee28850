//! AT Protocol repository core
//!
//! Building blocks for storing, signing and syncing an account's
//! repository:
//!
//! - **MST (Merkle Search Tree)**: Immutable key/CID map whose shape depends only on its contents
//! - **Commits**: Signed version 3 commits over the tree root, verified against a [`KeyResolver`]
//! - **Diffs**: Record operations and block sets between two trees
//! - **CAR I/O**: Full and incremental archives in CAR v1 format
//! - **Proofs**: Check record claims against a small CAR holding only the covering blocks
//! - **Storage**: Pluggable block storage with in-memory, file-backed and layered implementations
//!
//! Resolving DIDs over the network and speaking the sync protocol are left
//! to the host.
//!
//! # Example
//!
//! ```rust,ignore
//! use atrepo::{DidKeyResolver, MemoryBlockStore, RecordWriteOp, RepoConfig, Repository, SigningKey};
//!
//! # async fn example() -> atrepo::Result<()> {
//! let key = k256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
//! let storage = Arc::new(MemoryBlockStore::new());
//! let mut repo = Repository::create_empty(storage, key.did()?, &key, RepoConfig::default()).await?;
//!
//! let commit = repo
//!     .apply_writes(&[RecordWriteOp::Create { collection, rkey, record }], &key)
//!     .await?;
//!
//! // Ship the change, then load it elsewhere
//! let car = repo.full_archive().await?;
//! let copy = Repository::load_from_archive(
//!     &car,
//!     Arc::new(MemoryBlockStore::new()),
//!     Some(repo.did()),
//!     &DidKeyResolver,
//!     RepoConfig::default(),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

/// CAR (Content Addressable aRchive) utilities
pub mod car;
/// Commit structures, signing and proof verification
pub mod commit;
pub mod config;
pub mod error;
/// Merkle Search Tree implementation
pub mod mst;
/// High-level repository operations
pub mod repo;
/// Block storage abstraction
pub mod storage;

pub use commit::proof::{Claim, KeyClaim, ProofReport, RecordClaim, verify_commit_proof, verify_proofs};
pub use commit::{Commit, DidKeyResolver, KeyResolver, SigningKey, StaticKeyResolver, UnsignedCommit};
pub use config::RepoConfig;
pub use error::{RepoError, RepoErrorKind, Result};
pub use mst::{Mst, MstDiff, OpAction, RepoOp, VerifiedWriteOp};
pub use repo::{CommitData, RecordWriteOp, Repository, validate_record_path};
pub use storage::{BlockMap, BlockStore, FileBlockStore, LayeredBlockStore, MemoryBlockStore};
