//! Content identifiers for repository blocks.
//!
//! Every block in a repository is addressed by a CIDv1 with a SHA-256
//! multihash. Structured data (MST nodes, commits, records) uses the
//! DAG-CBOR codec; opaque bytes use the raw codec.

use sha2::{Digest, Sha256};

pub use cid::Cid as IpldCid;

/// raw
pub const RAW_CODEC: u64 = 0x55;

/// dag-cbor
pub const DAG_CBOR_CODEC: u64 = 0x71;

/// SHA-256
pub const SHA2_256: u64 = 0x12;

/// base 32, the canonical string form
pub const ATP_CID_BASE: multibase::Base = multibase::Base::Base32Lower;

/// Errors from building or checking CIDs
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
pub enum CidError {
    /// Multihash could not be constructed
    #[error("failed to wrap digest in multihash: {0}")]
    Multihash(String),
    /// Bytes did not hash to the expected CID
    #[error("block content does not match {expected} (computed {actual})")]
    #[diagnostic(
        code(atrepo::cid::mismatch),
        help("the block was corrupted or mislabeled in transit")
    )]
    Mismatch {
        /// CID the block was labeled with
        expected: IpldCid,
        /// CID computed from the bytes
        actual: IpldCid,
    },
    /// Hash function is not SHA-256
    #[error("unsupported multihash code 0x{0:x}")]
    UnsupportedHash(u64),
}

fn sha256_cid(codec: u64, data: &[u8]) -> Result<IpldCid, CidError> {
    let digest = Sha256::digest(data);
    let mh = multihash::Multihash::<64>::wrap(SHA2_256, &digest)
        .map_err(|e| CidError::Multihash(e.to_string()))?;
    Ok(IpldCid::new_v1(codec, mh))
}

/// CID of DAG-CBOR encoded bytes
pub fn cid_for_cbor(data: &[u8]) -> Result<IpldCid, CidError> {
    sha256_cid(DAG_CBOR_CODEC, data)
}

/// CID of raw bytes
pub fn cid_for_raw(data: &[u8]) -> Result<IpldCid, CidError> {
    sha256_cid(RAW_CODEC, data)
}

/// Recompute the CID of `data` under `expected`'s codec and compare.
pub fn verify_cid(expected: &IpldCid, data: &[u8]) -> Result<(), CidError> {
    let code = expected.hash().code();
    if code != SHA2_256 {
        return Err(CidError::UnsupportedHash(code));
    }
    let actual = sha256_cid(expected.codec(), data)?;
    if actual != *expected {
        return Err(CidError::Mismatch {
            expected: *expected,
            actual,
        });
    }
    Ok(())
}

/// Canonical base32 string form of a CID
pub fn cid_string(cid: &IpldCid) -> String {
    cid.to_string_of_base(ATP_CID_BASE)
        .unwrap_or_else(|_| cid.to_string())
}
