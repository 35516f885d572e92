//! The canonical record shape and the mapping from loosely typed upstream
//! JSON into it.

use serde::Serialize;
use serde_json::{Map, Value};

use crate::constants::MILLIS_THRESHOLD;
use crate::error::RecordError;
use crate::types::ExternalId;

// ---------------------------------------------------------------------------
// Field aliases
// ---------------------------------------------------------------------------

const ID_FIELDS: &[&str] = &["id", "message_id"];
const AUTHOR_FIELDS: &[&str] = &["user_id", "uid", "author_id"];
const NAME_FIELDS: &[&str] = &["nickname", "display_name", "name"];
const AVATAR_FIELDS: &[&str] = &["avatar", "avatar_url"];
const COLOR_FIELDS: &[&str] = &["color", "colour"];
const TIMESTAMP_FIELDS: &[&str] = &["timestamp", "time", "created_at"];
const BODY_FIELDS: &[&str] = &["message", "body", "content"];
const KIND_FIELDS: &[&str] = &["type", "kind"];
const REPLY_FIELDS: &[&str] = &["reply_to", "reply_to_id"];

const DEFAULT_KIND: &str = "message";

// ---------------------------------------------------------------------------
// NormalizedRecord
// ---------------------------------------------------------------------------

/// One upstream chat record after parsing and field mapping.
///
/// Records are never mutated in place; the clock-anomaly clamp builds a new
/// value through [`NormalizedRecord::with_timestamp`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedRecord {
    /// Upstream id, compared as an arbitrary-precision integer.
    pub id: ExternalId,
    pub author_id: String,
    pub display_name: String,
    pub avatar: Option<String>,
    pub color: Option<String>,
    /// Epoch seconds.
    pub timestamp: i64,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to_id: Option<ExternalId>,
}

impl NormalizedRecord {
    /// Map one upstream JSON record into the canonical shape.
    ///
    /// The id, author and timestamp are mandatory; every other field has a
    /// lenient fallback because the source omits them for some record types.
    pub fn from_value(value: &Value) -> Result<Self, RecordError> {
        let obj = value.as_object().ok_or(RecordError::NotAnObject)?;

        let id = pick(obj, ID_FIELDS)
            .ok_or(RecordError::MissingField("id"))
            .and_then(ExternalId::from_json)?;

        let author_id = pick(obj, AUTHOR_FIELDS)
            .and_then(loose_text)
            .filter(|s| !s.is_empty())
            .ok_or(RecordError::MissingField("author_id"))?;

        let timestamp = pick(obj, TIMESTAMP_FIELDS)
            .ok_or(RecordError::MissingField("timestamp"))
            .and_then(epoch_seconds)?;

        let display_name = pick(obj, NAME_FIELDS)
            .and_then(loose_text)
            .unwrap_or_else(|| author_id.clone());

        // An unparseable reply target is dropped rather than failing the record.
        let reply_to_id = pick(obj, REPLY_FIELDS)
            .filter(|v| !v.is_null())
            .and_then(|v| ExternalId::from_json(v).ok());

        Ok(Self {
            id,
            author_id,
            display_name,
            avatar: pick(obj, AVATAR_FIELDS).and_then(loose_text).filter(|s| !s.is_empty()),
            color: pick(obj, COLOR_FIELDS).and_then(loose_text).filter(|s| !s.is_empty()),
            timestamp,
            body: pick(obj, BODY_FIELDS).and_then(loose_text).unwrap_or_default(),
            kind: pick(obj, KIND_FIELDS)
                .and_then(loose_text)
                .unwrap_or_else(|| DEFAULT_KIND.to_string()),
            reply_to_id,
        })
    }

    /// A copy of this record with its timestamp replaced.
    pub fn with_timestamp(&self, timestamp: i64) -> Self {
        Self {
            timestamp,
            ..self.clone()
        }
    }

    /// Ordering key used everywhere records are sorted: timestamp first,
    /// then the external id as a big integer.
    pub fn order_key(&self) -> (i64, &ExternalId) {
        (self.timestamp, &self.id)
    }
}

fn pick<'a>(obj: &'a Map<String, Value>, names: &[&str]) -> Option<&'a Value> {
    names
        .iter()
        .filter_map(|name| obj.get(*name))
        .find(|v| !v.is_null())
}

/// Strings pass through; numbers and booleans are rendered as text.
fn loose_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn epoch_seconds(value: &Value) -> Result<i64, RecordError> {
    let raw = match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| RecordError::InvalidTimestamp(n.to_string()))?,
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .map_err(|_| RecordError::InvalidTimestamp(s.clone()))?,
        other => return Err(RecordError::InvalidTimestamp(other.to_string())),
    };

    if raw < 0 {
        return Err(RecordError::InvalidTimestamp(raw.to_string()));
    }

    Ok(if raw > MILLIS_THRESHOLD { raw / 1000 } else { raw })
}
