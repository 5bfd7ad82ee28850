use crate::error::IdentError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;
use std::fmt;
use std::sync::LazyLock;
use std::{ops::Deref, str::FromStr};

/// Key of a record within its collection.
///
/// Combined with the collection NSID it forms the repository path
/// `collection/rkey`, which is the key stored in the MST.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Rkey(SmolStr);

/// Regex for record key validation
pub static RKEY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9.\-_:~]{1,512}$").expect("static rkey regex"));

impl Rkey {
    /// Fallible constructor, validates the input
    pub fn new(rkey: impl AsRef<str>) -> Result<Self, IdentError> {
        let rkey = rkey.as_ref();
        if rkey == "." || rkey == ".." {
            Err(IdentError::reserved("record-key", rkey))
        } else if rkey.len() > 512 {
            Err(IdentError::too_long("record-key", rkey, 512))
        } else if !RKEY_REGEX.is_match(rkey) {
            Err(IdentError::format("record-key", rkey, "[a-zA-Z0-9.-_:~]{1,512}"))
        } else {
            Ok(Self(SmolStr::new(rkey)))
        }
    }

    /// Returns the record key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Rkey {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Rkey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Rkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Rkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Rkey({})", self.0)
    }
}

impl AsRef<str> for Rkey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Rkey {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}
