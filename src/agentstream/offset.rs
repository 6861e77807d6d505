//! Offsets: totally ordered event identifiers within a stream path.
//!
//! On the wire an offset is a zero-padded decimal string of width 16
//! (`"0000000000000042"`), assigned by the storage layer. Lexicographic
//! comparison of the strings matches numeric order by construction, so
//! clients may treat offsets as opaque sortable strings. The reserved
//! string `"-1"` means "before any event" and is accepted wherever a lower
//! bound is expected.
//!
//! Offsets are dense and monotonic per path. They are not comparable across
//! paths.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::agentstream::error::StreamError;

/// Width of the zero-padded decimal representation.
pub const OFFSET_WIDTH: usize = 16;

/// A totally ordered identifier within a single stream path.
///
/// ```rust
/// use agentstream::Offset;
///
/// let first = Offset::new(0);
/// assert_eq!(first.to_string(), "0000000000000000");
/// assert!(first < first.next());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(u64);

impl Offset {
    /// Wrap a raw sequence number.
    pub fn new(value: u64) -> Self {
        Offset(value)
    }

    /// The raw sequence number.
    pub fn value(&self) -> u64 {
        self.0
    }

    /// The offset that immediately follows this one.
    pub fn next(&self) -> Offset {
        Offset(self.0 + 1)
    }

    /// Parse a zero-padded decimal offset string.
    pub fn parse(s: &str) -> Result<Offset, StreamError> {
        s.trim_start_matches('0')
            .parse::<u64>()
            .or_else(|e| {
                // A fully zero-padded string trims to "".
                if !s.is_empty() && s.chars().all(|c| c == '0') {
                    Ok(0)
                } else {
                    Err(e)
                }
            })
            .map(Offset)
            .map_err(|_| StreamError::InvalidOffset(s.to_string()))
    }

    /// Parse a client-supplied lower bound. `"-1"` (and the empty string)
    /// mean "before any event" and map to `None`.
    pub fn parse_lower_bound(s: &str) -> Result<Option<Offset>, StreamError> {
        match s {
            "-1" | "" => Ok(None),
            other => Offset::parse(other).map(Some),
        }
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$}", self.0, width = OFFSET_WIDTH)
    }
}

impl Serialize for Offset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Offset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Offset::parse(&s).map_err(D::Error::custom)
    }
}
