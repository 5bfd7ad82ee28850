use serde::{Deserialize, Deserializer, Serialize, de::Error};
use smol_str::{SmolStr, SmolStrBuilder};
use std::fmt;
use std::sync::LazyLock;
use std::{ops::Deref, str::FromStr};

use crate::error::IdentError;
use regex::Regex;

const S32_CHAR: &[u8] = b"234567abcdefghijklmnopqrstuvwxyz";

fn s32_encode(mut i: u64) -> SmolStr {
    let mut chars = [0u8; 13];
    for slot in chars.iter_mut().rev() {
        *slot = S32_CHAR[(i & 0x1F) as usize];
        i >>= 5;
    }

    let mut builder = SmolStrBuilder::new();
    for c in chars {
        builder.push(c as char);
    }
    builder.finish()
}

fn s32_decode(s: &str) -> u64 {
    s.bytes().fold(0u64, |acc, c| {
        let digit = S32_CHAR.iter().position(|&x| x == c).unwrap_or(0) as u64;
        (acc << 5) | digit
    })
}

static TID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[234567abcdefghij][234567abcdefghijklmnopqrstuvwxyz]{12}$")
        .expect("static TID regex")
});

/// A [Timestamp Identifier], used as the commit revision.
///
/// TIDs sort lexically in the same order as the timestamps they encode, so
/// string comparison is revision comparison.
///
/// [Timestamp Identifier]: https://atproto.com/specs/tid
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Hash)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Tid(SmolStr);

impl Tid {
    /// Parses a `TID` from the given string.
    pub fn new(tid: impl AsRef<str>) -> Result<Self, IdentError> {
        let tid = tid.as_ref();
        if tid.len() > 13 {
            Err(IdentError::too_long("tid", tid, 13))
        } else if tid.len() < 13 {
            Err(IdentError::too_short("tid", tid, 13))
        } else if !TID_REGEX.is_match(tid) {
            Err(IdentError::format("tid", tid, "13 base32-sortable characters"))
        } else {
            Ok(Self(SmolStr::new_inline(tid)))
        }
    }

    /// Construct a TID from a microsecond timestamp and a clock id.
    ///
    /// Only the low 10 bits of `clock_id` are used.
    pub fn from_parts(micros: u64, clock_id: u16) -> Self {
        // 0TTTTTTTTTTTTTTT TTTTTTTTTTTTTTTT TTTTTTTTTTTTTTTT TTTTTTCCCCCCCCCC
        let tid = ((micros << 10) & 0x7FFF_FFFF_FFFF_FC00) | (clock_id as u64 & 0x3FF);
        Self(s32_encode(tid))
    }

    /// Construct a TID for the given wall-clock time.
    pub fn from_datetime(clock_id: u16, time: chrono::DateTime<chrono::Utc>) -> Self {
        Self::from_parts(time.timestamp_micros().max(0) as u64, clock_id)
    }

    /// Microsecond timestamp portion
    pub fn timestamp_micros(&self) -> u64 {
        s32_decode(&self.0) >> 10
    }

    /// Clock id portion
    pub fn clock_id(&self) -> u16 {
        (s32_decode(&self.0) & 0x3FF) as u16
    }

    /// Returns the TID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Monotonic TID source.
///
/// Successive calls to [`Ticker::next`] never return the same or a smaller
/// value, even if the wall clock stalls or steps backwards.
#[derive(Debug, Clone)]
pub struct Ticker {
    last_micros: u64,
    clock_id: u16,
}

impl Ticker {
    /// New ticker with a clock id derived from the current sub-second time
    pub fn new() -> Self {
        let clock_id = (chrono::Utc::now().timestamp_subsec_nanos() & 0x3FF) as u16;
        Self::with_clock_id(clock_id)
    }

    /// New ticker with an explicit clock id
    pub fn with_clock_id(clock_id: u16) -> Self {
        Self {
            last_micros: 0,
            clock_id: clock_id & 0x3FF,
        }
    }

    /// Next revision, strictly greater than `prev` if one is given
    pub fn next(&mut self, prev: Option<Tid>) -> Tid {
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        let mut micros = now.max(self.last_micros + 1);
        if let Some(prev) = prev {
            if micros <= prev.timestamp_micros() {
                micros = prev.timestamp_micros() + 1;
            }
        }
        self.last_micros = micros;
        Tid::from_parts(micros, self.clock_id)
    }
}

impl Default for Ticker {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for Tid {
    type Err = IdentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl<'de> Deserialize<'de> for Tid {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: SmolStr = Deserialize::deserialize(deserializer)?;
        Self::new(value).map_err(D::Error::custom)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Tid> for String {
    fn from(value: Tid) -> Self {
        value.0.to_string()
    }
}

impl From<Tid> for SmolStr {
    fn from(value: Tid) -> Self {
        value.0
    }
}

impl AsRef<str> for Tid {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Deref for Tid {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}
