//! Validated identifier types and public keys.

pub mod crypto;
pub mod did;
pub mod nsid;
pub mod recordkey;
pub mod tid;

pub use crypto::{CryptoError, KeyCodec, PublicKey};
pub use did::Did;
pub use nsid::Nsid;
pub use recordkey::Rkey;
pub use tid::{Ticker, Tid};
