use crate::error::IdentError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;
use std::fmt;
use std::sync::LazyLock;
use std::{ops::Deref, str::FromStr};

/// Decentralized identifier of a repository owner.
///
/// Only the syntax is validated here; resolving a DID to its document and
/// signing key is the host's job (see `KeyResolver` in the repo crate).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Did(SmolStr);

/// Regex for DID syntax.
///
/// Allows `%` inside the identifier but forbids a trailing `:` or `%`.
/// Percent-escapes are not checked for well-formedness.
pub static DID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^did:[a-z]+:[a-zA-Z0-9._:%-]*[a-zA-Z0-9._-]$").expect("static DID regex")
});

/// Longest DID accepted
pub const DID_MAX_LEN: usize = 2048;

impl Did {
    /// Fallible constructor, validates the input
    pub fn new(did: impl AsRef<str>) -> Result<Self, IdentError> {
        let did = did.as_ref();
        let did = did.strip_prefix("at://").unwrap_or(did);
        if did.len() > DID_MAX_LEN {
            Err(IdentError::too_long("did", did, DID_MAX_LEN))
        } else if !DID_REGEX.is_match(did) {
            Err(IdentError::format("did", did, "did:<method>:<identifier>"))
        } else {
            Ok(Self(SmolStr::new(did)))
        }
    }

    /// The DID method, e.g. `plc` for `did:plc:abc`
    pub fn method(&self) -> &str {
        self.0.split(':').nth(1).unwrap_or_default()
    }

    /// The method-specific identifier
    pub fn identifier(&self) -> &str {
        let method_end = 4 + self.method().len() + 1;
        &self.0[method_end..]
    }

    /// Returns the DID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Did {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Did {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Did {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Did({})", self.0)
    }
}

impl From<Did> for String {
    fn from(value: Did) -> Self {
        value.0.to_string()
    }
}

impl TryFrom<&str> for Did {
    type Error = IdentError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl AsRef<str> for Did {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Did {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}
