//! Commit structures and signature verification for AT Protocol repositories.
//!
//! A commit binds a repository DID to an MST root at a revision, signed by
//! the account's signing key. Only version 3 commits are produced or
//! accepted.

pub mod proof;
pub mod resolver;
pub(crate) mod serde_bytes_helper;

use crate::error::{CommitError, RepoError, Result};
use atrepo_common::codec::{from_dag_cbor, to_dag_cbor};
use atrepo_common::cid::cid_for_cbor;
use atrepo_common::types::{CryptoError, KeyCodec};
use atrepo_common::{Did, IpldCid, PublicKey, Tid};
use bytes::Bytes;

pub use resolver::{DidKeyResolver, KeyResolver, StaticKeyResolver};

/// The only commit version this crate reads or writes
pub const COMMIT_VERSION: i64 = 3;

/// Commit fields covered by the signature
///
/// Fields are declared in DAG-CBOR canonical key order (length first, then
/// bytewise) so the encoding is the same whichever way the encoder orders
/// struct fields.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct UnsignedCommit {
    /// Repository DID
    pub did: Did,
    /// Revision TID
    pub rev: Tid,
    /// MST root CID
    pub data: IpldCid,
    /// Previous commit CID (None for initial commit)
    pub prev: Option<IpldCid>,
    /// Commit version (always 3)
    pub version: i64,
}

impl UnsignedCommit {
    /// Create a version 3 commit body
    pub fn new(did: Did, data: IpldCid, rev: Tid, prev: Option<IpldCid>) -> Self {
        Self {
            did,
            rev,
            data,
            prev,
            version: COMMIT_VERSION,
        }
    }

    /// Bytes the signature is computed over
    pub fn signing_bytes(&self) -> Result<Vec<u8>> {
        Ok(to_dag_cbor(self)?)
    }

    /// Sign this commit with a key
    pub fn sign(self, key: &impl SigningKey) -> Result<Commit> {
        let sig = key.sign_bytes(&self.signing_bytes()?)?;
        Ok(Commit {
            did: self.did,
            rev: self.rev,
            sig,
            data: self.data,
            prev: self.prev,
            version: self.version,
        })
    }
}

/// Repository commit object
///
/// Stored as a block in CAR files, identified by the CID of its full
/// encoding (signature included). `prev` is always encoded, as null for the
/// first commit.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Commit {
    /// Repository DID
    pub did: Did,

    /// Revision TID
    pub rev: Tid,

    /// Signature bytes
    #[serde(with = "serde_bytes_helper")]
    pub sig: Bytes,

    /// MST root CID
    pub data: IpldCid,

    /// Previous commit CID (None for initial commit)
    pub prev: Option<IpldCid>,

    /// Commit version
    pub version: i64,
}

impl Commit {
    /// Get the repository DID
    pub fn did(&self) -> &Did {
        &self.did
    }

    /// Get the MST root CID
    pub fn data(&self) -> &IpldCid {
        &self.data
    }

    /// Get the revision TID
    pub fn rev(&self) -> &Tid {
        &self.rev
    }

    /// Get the previous commit CID
    pub fn prev(&self) -> Option<&IpldCid> {
        self.prev.as_ref()
    }

    /// Get the signature bytes
    pub fn sig(&self) -> &Bytes {
        &self.sig
    }

    /// The signed fields, without the signature
    pub fn unsigned(&self) -> UnsignedCommit {
        UnsignedCommit {
            did: self.did.clone(),
            rev: self.rev.clone(),
            data: self.data,
            prev: self.prev,
            version: self.version,
        }
    }

    /// Serialize to DAG-CBOR
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        Ok(to_dag_cbor(self)?)
    }

    /// Deserialize from DAG-CBOR, rejecting anything but version 3
    ///
    /// DID and revision syntax are checked by their own deserializers.
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        let commit: Commit = from_dag_cbor(data)
            .map_err(|e| RepoError::from(e).with_context("decoding commit"))?;
        if commit.version != COMMIT_VERSION {
            return Err(CommitError::InvalidVersion(commit.version).into());
        }
        Ok(commit)
    }

    /// Compute CID of this commit
    pub fn to_cid(&self) -> Result<IpldCid> {
        Ok(self.to_block()?.0)
    }

    /// Encode into a `(cid, bytes)` block
    pub fn to_block(&self) -> Result<(IpldCid, Bytes)> {
        let bytes = self.to_cbor()?;
        let cid = cid_for_cbor(&bytes)?;
        Ok((cid, Bytes::from(bytes)))
    }

    /// Verify the signature against a public key.
    ///
    /// The key type is taken from the key's codec.
    pub fn verify(&self, pubkey: &PublicKey) -> Result<()> {
        let unsigned = self.unsigned().signing_bytes()?;
        pubkey.verify(&unsigned, &self.sig).map_err(|e| match e {
            CryptoError::VerificationFailed | CryptoError::MalformedSignature(_) => {
                CommitError::SignatureVerificationFailed(e).into()
            }
            other => RepoError::from(other),
        })
    }

    /// Check the commit belongs to `expected` and is signed by its key
    ///
    /// The signing key is looked up through `resolver`.
    pub async fn verify_for(&self, expected: &Did, resolver: &impl KeyResolver) -> Result<()> {
        if &self.did != expected {
            return Err(CommitError::WrongSigner {
                expected: expected.to_string(),
                actual: self.did.to_string(),
            }
            .into());
        }
        let pubkey = resolver.resolve(expected).await?;
        self.verify(&pubkey)
    }
}

/// Trait for signing keys.
///
/// Implemented for ed25519_dalek::SigningKey, k256::ecdsa::SigningKey, and p256::ecdsa::SigningKey.
/// ECDSA signatures are 64-byte compact `r || s` with `s` normalized to the
/// lower half of the curve order.
pub trait SigningKey {
    /// Sign the given data and return signature as Bytes
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes>;

    /// Get the public key
    fn public_key(&self) -> PublicKey;

    /// The `did:key` identifier of this key
    fn did(&self) -> Result<Did> {
        Ok(Did::new(self.public_key().to_did_key())?)
    }
}

// Ed25519 implementation
impl SigningKey for ed25519_dalek::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use ed25519_dalek::Signer;
        let sig = self
            .try_sign(data)
            .map_err(|e| CommitError::Signing(e.to_string()))?;
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> PublicKey {
        PublicKey::from_parts(KeyCodec::Ed25519, self.verifying_key().to_bytes().to_vec())
    }
}

// K-256 (secp256k1) implementation
impl SigningKey for k256::ecdsa::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use k256::ecdsa::signature::Signer;
        let sig: k256::ecdsa::Signature = self
            .try_sign(data)
            .map_err(|e| CommitError::Signing(e.to_string()))?;
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> PublicKey {
        let point = self.verifying_key().to_encoded_point(true);
        PublicKey::from_parts(KeyCodec::Secp256k1, point.as_bytes().to_vec())
    }
}

// P-256 implementation
impl SigningKey for p256::ecdsa::SigningKey {
    fn sign_bytes(&self, data: &[u8]) -> Result<Bytes> {
        use p256::ecdsa::signature::Signer;
        let sig: p256::ecdsa::Signature = self
            .try_sign(data)
            .map_err(|e| CommitError::Signing(e.to_string()))?;
        let sig = sig.normalize_s().unwrap_or(sig);
        Ok(Bytes::copy_from_slice(&sig.to_bytes()))
    }

    fn public_key(&self) -> PublicKey {
        let point = self.verifying_key().to_encoded_point(true);
        PublicKey::from_parts(KeyCodec::P256, point.as_bytes().to_vec())
    }
}
