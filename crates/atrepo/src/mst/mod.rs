//! Merkle Search Tree implementation

pub mod cursor;
pub mod diff;
pub mod node;
pub mod tree;
pub mod util;

pub use cursor::{CursorPosition, MstCursor};
pub use diff::{MstDiff, OpAction, RepoOp};
pub use node::{NodeData, NodeEntry, TreeEntry};
pub use tree::{Mst, VerifiedWriteOp};
pub use util::{layer_for_key, validate_key};
