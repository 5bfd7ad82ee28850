//! Multikey public keys, `did:key` identifiers and signature verification.
//!
//! A [`PublicKey`] is decoded from a Multikey `publicKeyMultibase` string or
//! a `did:key:` DID into raw bytes plus a [`KeyCodec`]. Feature-gated helpers
//! convert to the curve crates (ed25519_dalek, k256, p256) and verify
//! signatures over arbitrary bytes.
//!
//! ```
//! use atrepo_common::types::crypto::{KeyCodec, PublicKey};
//! let key = [0u8; 32];
//! let encoded = PublicKey::from_parts(KeyCodec::Ed25519, key.to_vec()).encode_multibase();
//! let pk = PublicKey::decode(&encoded).unwrap();
//! assert_eq!(pk.codec, KeyCodec::Ed25519);
//! assert_eq!(pk.bytes, key);
//! ```

/// Prefix of a `did:key` DID
pub const DID_KEY_PREFIX: &str = "did:key:";

/// Known multicodec key codecs for Multikey public keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCodec {
    /// Ed25519
    Ed25519,
    /// Secp256k1 (k256)
    Secp256k1,
    /// NIST P-256
    P256,
    /// Unknown codec
    Unknown(u64),
}

impl KeyCodec {
    /// Multicodec code for this key type
    pub fn code(self) -> u64 {
        match self {
            KeyCodec::Ed25519 => 0xED,
            KeyCodec::Secp256k1 => 0xE7,
            KeyCodec::P256 => 0x1200,
            KeyCodec::Unknown(c) => c,
        }
    }

    fn from_code(code: u64) -> Self {
        match code {
            0xED => KeyCodec::Ed25519,
            0xE7 => KeyCodec::Secp256k1,
            0x1200 => KeyCodec::P256,
            other => KeyCodec::Unknown(other),
        }
    }
}

/// Public key decoded from a Multikey string or `did:key`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    /// Codec used to encode the public key
    pub codec: KeyCodec,
    /// Bytes of the public key (compressed SEC1 for the ECDSA curves)
    pub bytes: Vec<u8>,
}

/// Errors from decoding, converting or verifying with public keys
#[derive(Debug, Clone, thiserror::Error, miette::Diagnostic, PartialEq, Eq)]
pub enum CryptoError {
    /// Multibase decode error
    #[error("failed to decode multibase")]
    MultibaseDecode,
    /// Multicodec decode error
    #[error("failed to decode multicodec varint")]
    MulticodecDecode,
    /// Unsupported key codec error
    #[error("unsupported key codec: 0x{0:x}")]
    UnsupportedCodec(u64),
    /// Invalid key length error
    #[error("invalid key length: expected {expected}, got {got}")]
    InvalidLength {
        /// Expected length of the key
        expected: usize,
        /// Actual length of the key
        got: usize,
    },
    /// Invalid key format error
    #[error("invalid key format")]
    InvalidFormat,
    /// The DID is not a `did:key`
    #[error("not a did:key identifier: {0}")]
    #[diagnostic(help("only did:key identifiers carry their key inline; resolve other methods first"))]
    NotDidKey(String),
    /// Signature bytes could not be parsed
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    /// Signature does not verify
    #[error("signature verification failed")]
    VerificationFailed,
    /// Conversion error
    #[error("conversion error: {0}")]
    Conversion(String),
}

impl PublicKey {
    /// Build a key from a codec and raw key bytes without validation
    pub fn from_parts(codec: KeyCodec, bytes: Vec<u8>) -> Self {
        Self { codec, bytes }
    }

    /// Decode a Multikey public key from a multibase-encoded string
    pub fn decode(multibase_str: &str) -> Result<PublicKey, CryptoError> {
        let (_base, data) =
            multibase::decode(multibase_str).map_err(|_| CryptoError::MultibaseDecode)?;
        let (code, offset) = decode_uvarint(&data).ok_or(CryptoError::MulticodecDecode)?;
        let bytes = &data[offset..];
        let codec = KeyCodec::from_code(code);
        match codec {
            KeyCodec::Ed25519 => {
                if bytes.len() != 32 {
                    return Err(CryptoError::InvalidLength {
                        expected: 32,
                        got: bytes.len(),
                    });
                }
            }
            KeyCodec::Secp256k1 | KeyCodec::P256 => {
                if !(bytes.len() == 33 || bytes.len() == 65) {
                    return Err(CryptoError::InvalidLength {
                        expected: 33,
                        got: bytes.len(),
                    });
                }
                // 0x02/0x03 compressed, 0x04 uncompressed
                let first = *bytes.first().ok_or(CryptoError::InvalidFormat)?;
                if first != 0x02 && first != 0x03 && first != 0x04 {
                    return Err(CryptoError::InvalidFormat);
                }
            }
            KeyCodec::Unknown(code) => return Err(CryptoError::UnsupportedCodec(code)),
        }
        Ok(PublicKey {
            codec,
            bytes: bytes.to_vec(),
        })
    }

    /// Parse a `did:key:z...` DID
    pub fn from_did_key(did: &str) -> Result<PublicKey, CryptoError> {
        let multibase = did
            .strip_prefix(DID_KEY_PREFIX)
            .ok_or_else(|| CryptoError::NotDidKey(did.to_string()))?;
        Self::decode(multibase)
    }

    /// Encode as a base58btc Multikey string (`z...`)
    pub fn encode_multibase(&self) -> String {
        let mut buf = encode_uvarint(self.codec.code());
        buf.extend_from_slice(&self.bytes);
        multibase::encode(multibase::Base::Base58Btc, buf)
    }

    /// Encode as a `did:key` DID
    pub fn to_did_key(&self) -> String {
        format!("{}{}", DID_KEY_PREFIX, self.encode_multibase())
    }

    /// Convert to ed25519_dalek verifying key (feature crypto-ed25519)
    #[cfg(feature = "crypto-ed25519")]
    pub fn to_ed25519(&self) -> Result<ed25519_dalek::VerifyingKey, CryptoError> {
        if self.codec != KeyCodec::Ed25519 {
            return Err(CryptoError::UnsupportedCodec(self.codec.code()));
        }
        let raw: &[u8; 32] = self
            .bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidLength {
                expected: 32,
                got: self.bytes.len(),
            })?;
        ed25519_dalek::VerifyingKey::from_bytes(raw)
            .map_err(|e| CryptoError::Conversion(e.to_string()))
    }

    /// Convert to k256 public key (feature crypto-k256)
    #[cfg(feature = "crypto-k256")]
    pub fn to_k256(&self) -> Result<k256::PublicKey, CryptoError> {
        if self.codec != KeyCodec::Secp256k1 {
            return Err(CryptoError::UnsupportedCodec(self.codec.code()));
        }
        k256::PublicKey::from_sec1_bytes(&self.bytes)
            .map_err(|e| CryptoError::Conversion(e.to_string()))
    }

    /// Convert to p256 public key (feature crypto-p256)
    #[cfg(feature = "crypto-p256")]
    pub fn to_p256(&self) -> Result<p256::PublicKey, CryptoError> {
        if self.codec != KeyCodec::P256 {
            return Err(CryptoError::UnsupportedCodec(self.codec.code()));
        }
        p256::PublicKey::from_sec1_bytes(&self.bytes)
            .map_err(|e| CryptoError::Conversion(e.to_string()))
    }

    /// Verify `sig` over `data` with this key.
    ///
    /// ECDSA signatures must be 64-byte compact `r || s` with a low `s`;
    /// ed25519 uses strict verification.
    #[cfg(feature = "crypto")]
    pub fn verify(&self, data: &[u8], sig: &[u8]) -> Result<(), CryptoError> {
        match self.codec {
            #[cfg(feature = "crypto-ed25519")]
            KeyCodec::Ed25519 => {
                let vk = self.to_ed25519()?;
                let sig = ed25519_dalek::Signature::from_slice(sig)
                    .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
                vk.verify_strict(data, &sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            #[cfg(feature = "crypto-k256")]
            KeyCodec::Secp256k1 => {
                use k256::ecdsa::{Signature, VerifyingKey, signature::Verifier};
                let vk = VerifyingKey::from(&self.to_k256()?);
                let sig = Signature::from_slice(sig)
                    .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
                if sig.normalize_s().is_some() {
                    return Err(CryptoError::MalformedSignature("high-S signature".into()));
                }
                vk.verify(data, &sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            #[cfg(feature = "crypto-p256")]
            KeyCodec::P256 => {
                use p256::ecdsa::{Signature, VerifyingKey, signature::Verifier};
                let vk = VerifyingKey::from(&self.to_p256()?);
                let sig = Signature::from_slice(sig)
                    .map_err(|e| CryptoError::MalformedSignature(e.to_string()))?;
                if sig.normalize_s().is_some() {
                    return Err(CryptoError::MalformedSignature("high-S signature".into()));
                }
                vk.verify(data, &sig)
                    .map_err(|_| CryptoError::VerificationFailed)
            }
            other => Err(CryptoError::UnsupportedCodec(other.code())),
        }
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_did_key())
    }
}

impl std::str::FromStr for PublicKey {
    type Err = CryptoError;

    /// Accepts either a `did:key` or a bare Multikey string
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with(DID_KEY_PREFIX) {
            Self::from_did_key(s)
        } else {
            Self::decode(s)
        }
    }
}

fn encode_uvarint(mut x: u64) -> Vec<u8> {
    let mut out = Vec::new();
    while x >= 0x80 {
        out.push(((x as u8) & 0x7F) | 0x80);
        x >>= 7;
    }
    out.push(x as u8);
    out
}

fn decode_uvarint(data: &[u8]) -> Option<(u64, usize)> {
    let mut x: u64 = 0;
    let mut s: u32 = 0;
    for (i, b) in data.iter().copied().enumerate() {
        if b < 0x80 {
            if i > 9 || (i == 9 && b > 1) {
                return None;
            }
            return Some((x | ((b as u64) << s), i + 1));
        }
        x |= ((b & 0x7F) as u64) << s;
        s += 7;
    }
    None
}
