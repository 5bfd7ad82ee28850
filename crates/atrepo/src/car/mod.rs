//! CAR (Content Addressable aRchive) file I/O
//!
//! CAR v1 is the transport format for repositories: a header naming the
//! root CIDs followed by length-prefixed `(cid, bytes)` blocks. Repository
//! archives carry a single root, the commit.
//!
//! Every block read is re-hashed against its CID. [`CarMode`] decides what
//! happens to a block that fails the check.
//!
//! # Examples
//!
//! ```ignore
//! use atrepo::car::{CarMode, parse_car_bytes, write_car_bytes};
//!
//! let bytes = write_car_bytes(commit_cid, blocks).await?;
//! let parsed = parse_car_bytes(&bytes, CarMode::Strict).await?;
//! assert_eq!(parsed.root()?, commit_cid);
//! ```

use crate::error::{CarError, Result};
use crate::storage::BlockMap;
use atrepo_common::IpldCid;

pub mod reader;
pub mod writer;

pub use reader::{CarBlockStream, parse_car_bytes, read_car, read_car_header, stream_car};
pub use writer::{export_repo_car, write_car, write_car_bytes, write_ordered_car_bytes};

/// Policy for blocks whose bytes do not hash to their CID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CarMode {
    /// Abort decoding with `CidMismatch`
    #[default]
    Strict,
    /// Drop the block, note it in [`ParsedCar::corrupt`], keep going
    Lenient,
}

/// Parsed CAR file data
#[derive(Debug, Clone, Default)]
pub struct ParsedCar {
    /// Root CIDs from the CAR header
    pub roots: Vec<IpldCid>,
    /// All blocks that passed the CID check
    pub blocks: BlockMap,
    /// CIDs of blocks dropped in lenient mode
    pub corrupt: Vec<IpldCid>,
}

impl ParsedCar {
    /// The single root of a repository archive
    pub fn root(&self) -> Result<IpldCid> {
        match self.roots.as_slice() {
            [root] => Ok(*root),
            other => Err(CarError::RootCount(other.len()).into()),
        }
    }
}
