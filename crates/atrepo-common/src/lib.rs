//! Common types for atrepo: identifiers, keys, CIDs and canonical DAG-CBOR.

#![warn(missing_docs)]
pub use smol_str;

pub mod cid;
pub mod codec;
pub mod error;
/// Baseline AT Protocol identifier and key types.
pub mod types;

pub use cid::IpldCid;
pub use error::IdentError;
pub use types::{Did, Nsid, PublicKey, Rkey, Tid};
