//! Canonical DAG-CBOR encoding.
//!
//! `serde_ipld_dagcbor` emits map keys in canonical order (length first,
//! then bytewise) and rejects floats that are not representable, so the
//! same value always encodes to the same bytes.

use serde::{Serialize, de::DeserializeOwned};

use crate::cid::{CidError, IpldCid, cid_for_cbor, verify_cid};

/// Errors encoding or decoding DAG-CBOR
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum CodecError {
    /// Value could not be encoded
    #[error("DAG-CBOR encode failed: {0}")]
    #[diagnostic(code(atrepo::codec::encode))]
    Encode(String),
    /// Bytes are not valid DAG-CBOR for the target type
    #[error("DAG-CBOR decode failed: {0}")]
    #[diagnostic(code(atrepo::codec::decode))]
    Decode(String),
    /// Content-address check failed
    #[error(transparent)]
    #[diagnostic(transparent)]
    Cid(#[from] CidError),
}

/// Encode a value to canonical DAG-CBOR bytes
pub fn to_dag_cbor<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_ipld_dagcbor::to_vec(value).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode DAG-CBOR bytes
pub fn from_dag_cbor<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CodecError> {
    serde_ipld_dagcbor::from_slice(bytes).map_err(|e| CodecError::Decode(e.to_string()))
}

/// Encode a value and compute its CID in one step
pub fn encode_block<T: Serialize + ?Sized>(value: &T) -> Result<(IpldCid, Vec<u8>), CodecError> {
    let bytes = to_dag_cbor(value)?;
    let cid = cid_for_cbor(&bytes)?;
    Ok((cid, bytes))
}

/// Check `bytes` against `cid`, then decode
pub fn decode_block<T: DeserializeOwned>(cid: &IpldCid, bytes: &[u8]) -> Result<T, CodecError> {
    verify_cid(cid, bytes)?;
    from_dag_cbor(bytes)
}
