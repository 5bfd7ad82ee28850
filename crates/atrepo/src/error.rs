//! Error types for repository operations

use std::error::Error;
use std::fmt;

use atrepo_common::IpldCid;
use atrepo_common::cid::{CidError, cid_string};
use atrepo_common::codec::CodecError;
use atrepo_common::error::IdentError;
use atrepo_common::types::CryptoError;

/// Boxed error type for error sources
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Result type alias for repository operations
pub type Result<T> = std::result::Result<T, RepoError>;

/// Repository operation error with rich diagnostics
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub struct RepoError {
    kind: RepoErrorKind,
    #[source]
    source: Option<BoxError>,
    #[help]
    help: Option<String>,
    context: Option<String>,
}

/// Error categories for repository operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoErrorKind {
    /// Storage operation failed
    Storage,
    /// Bytes are not valid DAG-CBOR for the expected shape
    Decode,
    /// Block bytes do not hash to their CID
    CidMismatch,
    /// A referenced block is not available
    BlockNotFound,
    /// Key already present in the tree
    DuplicateKey,
    /// Key absent from the tree
    KeyNotFound,
    /// Commit signature does not verify
    InvalidSignature,
    /// Commit was issued for a different DID
    WrongSigner,
    /// Proof is missing blocks needed to reach a conclusion
    IncompleteProof,
    /// Invalid MST structure
    InvalidMst,
    /// Invalid commit structure
    InvalidCommit,
    /// Invalid key format
    InvalidKey,
    /// Write precondition on the current value failed
    PrevMismatch,
    /// Cryptographic operation failed
    Crypto,
    /// Data too large (exceeds protocol limits)
    TooLarge,
    /// CAR file operation failed
    Car,
    /// I/O error
    Io,
}

impl RepoError {
    /// Create a new error with the given kind and optional source
    pub fn new(kind: RepoErrorKind, source: Option<BoxError>) -> Self {
        Self {
            kind,
            source,
            help: None,
            context: None,
        }
    }

    /// Add a help message to the error
    pub fn with_help(mut self, help: impl Into<String>) -> Self {
        self.help = Some(help.into());
        self
    }

    /// Add context information to the error
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Get the error kind
    pub fn kind(&self) -> &RepoErrorKind {
        &self.kind
    }

    /// Re-tag an error, keeping it as the source
    pub fn wrap(self, kind: RepoErrorKind) -> Self {
        Self::new(kind, Some(Box::new(self)))
    }

    /// Create a storage error
    pub fn storage(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Storage, Some(Box::new(source)))
    }

    /// Create a decode error
    pub fn decode(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Decode, Some(Box::new(source)))
    }

    /// Create a CID mismatch error
    pub fn cid_mismatch(expected: &IpldCid, actual: &IpldCid) -> Self {
        Self::new(RepoErrorKind::CidMismatch, None)
            .with_context(format!(
                "expected {}, computed {}",
                cid_string(expected),
                cid_string(actual)
            ))
            .with_help("the block was corrupted or mislabeled")
    }

    /// Create a missing block error
    pub fn block_not_found(cid: &IpldCid) -> Self {
        Self::new(RepoErrorKind::BlockNotFound, None)
            .with_context(format!("block not found: {}", cid_string(cid)))
    }

    /// Create a duplicate key error
    pub fn duplicate_key(key: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::DuplicateKey, None).with_context(format!("key exists: {}", key))
    }

    /// Create a key not found error
    pub fn key_not_found(key: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::KeyNotFound, None).with_context(format!("key not found: {}", key))
    }

    /// Create an invalid signature error
    pub fn invalid_signature(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::InvalidSignature, Some(Box::new(source)))
    }

    /// Create a wrong signer error
    pub fn wrong_signer(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self::new(RepoErrorKind::WrongSigner, None)
            .with_context(format!("expected {}, commit is for {}", expected, actual))
    }

    /// Create an incomplete proof error
    pub fn incomplete_proof(source: RepoError) -> Self {
        source
            .wrap(RepoErrorKind::IncompleteProof)
            .with_help("proofs must carry every node on the path from the root to the key")
    }

    /// Create an invalid MST error
    pub fn invalid_mst(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidMst, Some(msg.into().into()))
            .with_help("MST nodes must follow protocol structure")
    }

    /// Create an invalid commit error
    pub fn invalid_commit(msg: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidCommit, Some(msg.into().into()))
    }

    /// Create an invalid key error
    pub fn invalid_key(key: impl Into<String>) -> Self {
        Self::new(RepoErrorKind::InvalidKey, None)
            .with_help("MST keys must match [a-zA-Z0-9._:~/-]+, max 256 bytes")
            .with_context(format!("key: {}", key.into()))
    }

    /// Create a prev mismatch error
    pub fn prev_mismatch(key: impl fmt::Display, expected: Option<IpldCid>, actual: Option<IpldCid>) -> Self {
        let show = |c: Option<IpldCid>| c.map(|c| cid_string(&c)).unwrap_or_else(|| "none".into());
        Self::new(RepoErrorKind::PrevMismatch, None).with_context(format!(
            "{}: expected {}, found {}",
            key,
            show(expected),
            show(actual)
        ))
    }

    /// Create a crypto error
    pub fn crypto(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Crypto, Some(Box::new(source)))
    }

    /// Create a too large error
    pub fn too_large(what: &str, size: usize, max: usize) -> Self {
        Self::new(RepoErrorKind::TooLarge, None)
            .with_context(format!("{} is {}, max {}", what, size, max))
            .with_help("See sync v1.1 protocol limits")
    }

    /// Create a CAR file error
    pub fn car(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Car, Some(Box::new(source)))
    }

    /// Create an I/O error
    pub fn io(source: impl Error + Send + Sync + 'static) -> Self {
        Self::new(RepoErrorKind::Io, Some(Box::new(source)))
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;

        if let Some(ctx) = &self.context {
            write!(f, ": {}", ctx)?;
        }

        if let Some(src) = &self.source {
            write!(f, ": {}", src)?;
        }

        Ok(())
    }
}

impl From<CidError> for RepoError {
    fn from(e: CidError) -> Self {
        match e {
            CidError::Mismatch { expected, actual } => RepoError::cid_mismatch(&expected, &actual),
            other => RepoError::decode(other),
        }
    }
}

impl From<CodecError> for RepoError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::Cid(c) => c.into(),
            CodecError::Decode(_) => RepoError::decode(e),
            CodecError::Encode(_) => RepoError::new(RepoErrorKind::InvalidMst, Some(Box::new(e)))
                .with_context("encoding failed"),
        }
    }
}

impl From<CryptoError> for RepoError {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::VerificationFailed | CryptoError::MalformedSignature(_) => {
                RepoError::invalid_signature(e)
            }
            other => RepoError::crypto(other),
        }
    }
}

impl From<IdentError> for RepoError {
    fn from(e: IdentError) -> Self {
        RepoError::new(RepoErrorKind::InvalidKey, Some(Box::new(e)))
    }
}

impl From<std::io::Error> for RepoError {
    fn from(e: std::io::Error) -> Self {
        RepoError::io(e)
    }
}

// Internal granular errors

/// MST-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum MstError {
    /// Empty key not allowed
    #[error("Empty key not allowed")]
    EmptyKey,

    /// Key too long
    #[error("Key too long: {len} bytes (max {max})")]
    KeyTooLong {
        /// Actual key length
        len: usize,
        /// Maximum allowed length
        max: usize,
    },

    /// Invalid key characters
    #[error("Invalid key characters: {key}")]
    InvalidKeyChars {
        /// The invalid key
        key: String,
    },

    /// Node structure invalid
    #[error("Node structure invalid: {0}")]
    InvalidNode(String),
}

impl From<MstError> for RepoError {
    fn from(e: MstError) -> Self {
        match e {
            MstError::EmptyKey => RepoError::invalid_key(""),
            MstError::KeyTooLong { len, max } => {
                RepoError::invalid_key(format!("length {}/{}", len, max))
            }
            MstError::InvalidKeyChars { key } => RepoError::invalid_key(key),
            MstError::InvalidNode(msg) => RepoError::invalid_mst(msg),
        }
    }
}

/// Commit-specific errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CommitError {
    /// Invalid commit version
    #[error("Invalid commit version: {0}")]
    #[diagnostic(help("only version 3 commits are produced or accepted"))]
    InvalidVersion(i64),

    /// Signature does not verify under the resolved key
    #[error("Signature verification failed")]
    SignatureVerificationFailed(#[source] CryptoError),

    /// Commit's DID is not the one the caller expected
    #[error("Commit is for {actual}, expected {expected}")]
    WrongSigner {
        /// DID the caller expected
        expected: String,
        /// DID in the commit
        actual: String,
    },

    /// Signing failed
    #[error("Signing failed: {0}")]
    Signing(String),

    /// Signing key for the DID could not be found
    #[error("No signing key for {0}")]
    #[diagnostic(help("the key resolver has no entry for this DID"))]
    UnresolvedKey(String),
}

impl From<CommitError> for RepoError {
    fn from(e: CommitError) -> Self {
        match e {
            CommitError::InvalidVersion(v) => {
                RepoError::invalid_commit(format!("unsupported version {}", v))
            }
            CommitError::SignatureVerificationFailed(_) => RepoError::invalid_signature(e),
            CommitError::WrongSigner { ref expected, ref actual } => {
                RepoError::wrong_signer(expected, actual)
            }
            CommitError::Signing(_) => RepoError::crypto(e),
            CommitError::UnresolvedKey(_) => RepoError::crypto(e),
        }
    }
}

/// Diff-specific errors
#[derive(Debug, thiserror::Error)]
pub enum DiffError {
    /// Too many operations
    #[error("Too many operations: {count} (max {max})")]
    TooManyOps {
        /// Actual operation count
        count: usize,
        /// Maximum allowed operations
        max: usize,
    },
}

impl From<DiffError> for RepoError {
    fn from(e: DiffError) -> Self {
        match e {
            DiffError::TooManyOps { count, max } => {
                RepoError::too_large("diff operation count", count, max)
            }
        }
    }
}

/// CAR codec errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CarError {
    /// Header or block framing is malformed
    #[error("CAR parse failed: {0}")]
    #[diagnostic(code(car::parse))]
    Parse(String),

    /// Write to the output sink failed
    #[error("CAR write failed: {0}")]
    #[diagnostic(code(car::write))]
    Write(String),

    /// Repository archives carry exactly one root
    #[error("expected exactly one root, found {0}")]
    #[diagnostic(
        code(car::roots),
        help("repository archives are rooted at the commit block")
    )]
    RootCount(usize),
}

impl From<CarError> for RepoError {
    fn from(e: CarError) -> Self {
        RepoError::car(e)
    }
}

/// Proof verification errors
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ProofError {
    /// Commit block not found in CAR
    #[error("Commit block not found in CAR: {cid}")]
    #[diagnostic(
        code(proof::commit_not_found),
        help("The CAR root CID must point to a valid commit block")
    )]
    CommitNotFound {
        /// Root CID named by the CAR header
        cid: String,
    },

    /// Applying the inverse of the commit's ops did not reproduce the prior root
    #[error("Inverted tree root {actual} does not match previous data {expected}")]
    #[diagnostic(
        code(proof::inversion_mismatch),
        help("the ops do not describe the change between the two roots")
    )]
    InversionMismatch {
        /// Prior data root carried by the event
        expected: String,
        /// Root computed by inverting the ops
        actual: String,
    },

    /// Operation path could not be split into collection and rkey
    #[error("Invalid operation path: {0}")]
    #[diagnostic(code(proof::invalid_path))]
    InvalidPath(String),
}

impl From<ProofError> for RepoError {
    fn from(e: ProofError) -> Self {
        match &e {
            ProofError::CommitNotFound { .. } => {
                RepoError::new(RepoErrorKind::IncompleteProof, Some(Box::new(e)))
            }
            ProofError::InversionMismatch { .. } => {
                RepoError::new(RepoErrorKind::InvalidCommit, Some(Box::new(e)))
            }
            ProofError::InvalidPath(_) => RepoError::new(RepoErrorKind::InvalidKey, Some(Box::new(e))),
        }
    }
}
