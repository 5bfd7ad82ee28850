use crate::error::IdentError;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::SmolStr;
use std::fmt;
use std::sync::LazyLock;
use std::{ops::Deref, str::FromStr};

/// Namespaced identifier naming a record collection, e.g. `app.bsky.feed.post`.
///
/// Stored as SmolStr since most NSIDs are short enough to inline.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Nsid(SmolStr);

/// Regex for NSID validation: reversed domain authority plus a name segment.
pub static NSID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+(\.[a-zA-Z][a-zA-Z0-9]{0,62})$")
        .expect("static NSID regex")
});

impl Nsid {
    /// Fallible constructor, validates the input
    pub fn new(nsid: impl AsRef<str>) -> Result<Self, IdentError> {
        let nsid = nsid.as_ref();
        if nsid.len() > 317 {
            Err(IdentError::too_long("nsid", nsid, 317))
        } else if !NSID_REGEX.is_match(nsid) {
            Err(IdentError::format("nsid", nsid, "reverse-DNS authority plus name"))
        } else {
            Ok(Self(SmolStr::new(nsid)))
        }
    }

    /// The trailing name segment
    pub fn name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or_default()
    }

    /// Returns the NSID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Nsid {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Nsid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Nsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Nsid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Nsid({})", self.0)
    }
}

impl AsRef<str> for Nsid {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Nsid {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}
