//! Signing key lookup for commit verification
//!
//! Resolving a DID to its current signing key (PLC directory, `did:web`
//! documents, caching) belongs to the host. The [`KeyResolver`] seam lets the
//! host plug that in; two resolvers that need no network are provided.

use std::collections::HashMap;

use crate::error::{CommitError, Result};
use atrepo_common::{Did, PublicKey};

/// Maps a repository DID to the key its commits must be signed with
#[trait_variant::make(Send)]
pub trait KeyResolver {
    /// Current signing key for `did`
    async fn resolve(&self, did: &Did) -> Result<PublicKey>;
}

/// Resolves `did:key` DIDs by decoding the key embedded in the identifier
#[derive(Debug, Clone, Copy, Default)]
pub struct DidKeyResolver;

impl KeyResolver for DidKeyResolver {
    async fn resolve(&self, did: &Did) -> Result<PublicKey> {
        Ok(PublicKey::from_did_key(did.as_str())?)
    }
}

/// Fixed table of DID to key, for hosts that already hold the keys
#[derive(Debug, Clone, Default)]
pub struct StaticKeyResolver {
    keys: HashMap<Did, PublicKey>,
}

impl StaticKeyResolver {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the key for `did`
    pub fn with_key(mut self, did: Did, key: PublicKey) -> Self {
        self.keys.insert(did, key);
        self
    }

    /// Add or replace the key for `did` in place
    pub fn insert(&mut self, did: Did, key: PublicKey) {
        self.keys.insert(did, key);
    }
}

impl KeyResolver for StaticKeyResolver {
    async fn resolve(&self, did: &Did) -> Result<PublicKey> {
        self.keys
            .get(did)
            .cloned()
            .ok_or_else(|| CommitError::UnresolvedKey(did.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::SigningKey;
    use crate::error::RepoErrorKind;
    use rand::rngs::OsRng;

    #[tokio::test]
    async fn test_did_key_resolver() {
        let key = k256::ecdsa::SigningKey::random(&mut OsRng);
        let did = key.did().unwrap();

        let resolved = DidKeyResolver.resolve(&did).await.unwrap();
        assert_eq!(resolved, key.public_key());

        let plc = Did::new("did:plc:ewvi7nxzyoun6zhxrhs64oiz").unwrap();
        let err = DidKeyResolver.resolve(&plc).await.unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::Crypto);
    }

    #[tokio::test]
    async fn test_static_resolver() {
        let key = p256::ecdsa::SigningKey::random(&mut OsRng);
        let did = Did::new("did:plc:ewvi7nxzyoun6zhxrhs64oiz").unwrap();
        let resolver = StaticKeyResolver::new().with_key(did.clone(), key.public_key());

        assert_eq!(resolver.resolve(&did).await.unwrap(), key.public_key());

        let missing = Did::new("did:web:example.com").unwrap();
        let err = resolver.resolve(&missing).await.unwrap_err();
        assert_eq!(*err.kind(), RepoErrorKind::Crypto);
    }
}
