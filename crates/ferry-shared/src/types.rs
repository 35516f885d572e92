use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};
use serde_json::Value;

use crate::error::RecordError;

/// Identifier assigned to a record by the upstream source.
///
/// Upstream ids are unbounded non-negative integers and regularly exceed the
/// range of `u64` and the 53-bit safe range of JSON doubles, so they are kept
/// as canonical decimal strings (no sign, no leading zeros) and compared
/// numerically: a shorter string is always the smaller number, and strings of
/// equal length compare lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExternalId(String);

impl ExternalId {
    /// Parse a decimal digit string, tolerating surrounding whitespace and
    /// leading zeros.
    pub fn parse(raw: &str) -> Result<Self, RecordError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RecordError::InvalidId(raw.to_string()));
        }

        let canonical = trimmed.trim_start_matches('0');
        if canonical.is_empty() {
            Ok(Self("0".to_string()))
        } else {
            Ok(Self(canonical.to_string()))
        }
    }

    /// Read an id from a loosely typed JSON value (number or digit string).
    ///
    /// Numbers are taken from their exact textual representation, so values
    /// far beyond `u64::MAX` survive untouched.
    pub fn from_json(value: &Value) -> Result<Self, RecordError> {
        match value {
            Value::Number(n) => Self::parse(&n.to_string()),
            Value::String(s) => Self::parse(s),
            other => Err(RecordError::InvalidId(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Ord for ExternalId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for ExternalId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl FromStr for ExternalId {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for ExternalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ExternalId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}
