//! Push-connection wire protocol.
//!
//! Both directions carry one JSON object per frame, discriminated by a
//! snake_case `type` field. Frames are decoded through an explicit dispatch
//! table instead of a derived tagged enum: upstream-sized numbers force
//! `serde_json`'s `arbitrary_precision` mode, which does not mix with
//! buffered (internally tagged) deserialization.

use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::constants::MAX_TEMP_ID_LEN;
use crate::error::ProtocolError;
use crate::record::NormalizedRecord;
use crate::types::ExternalId;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// A control frame sent by a client over its push connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientFrame {
    /// Associate the connection with a user id.
    Identify { uid: String },
    /// Associate and register presence metadata.
    Join {
        uid: String,
        name: Option<String>,
        avatar: Option<String>,
    },
    /// Foreground/background toggle.
    Presence { open: bool },
    PresenceSubscribe { uids: Vec<String> },
    PresenceUnsubscribe,
    PresenceQuery { uids: Vec<String> },
    TypingStart,
    TypingStop,
    Ack { ack_id: u64 },
    PendingMessage { temp_id: String, content: String },
    Ping,
}

impl ClientFrame {
    /// Decode one raw text frame.
    ///
    /// Returns `None` for anything that is not a well-formed, known frame:
    /// invalid JSON, a missing `type`, an unknown `type`, or a missing or
    /// mistyped required field. Callers drop such frames without replying.
    pub fn parse(text: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(text).ok()?;
        let obj = value.as_object()?;
        let tag = obj.get("type")?.as_str()?;

        let frame = match tag {
            "identify" => Self::Identify {
                uid: loose_id(obj.get("uid")?)?,
            },
            "join" => {
                let user = obj.get("user")?.as_object()?;
                Self::Join {
                    uid: loose_id(user.get("id")?)?,
                    name: optional_text(user.get("name")),
                    avatar: optional_text(user.get("avatar")),
                }
            }
            "presence" => Self::Presence {
                open: obj.get("open")?.as_bool()?,
            },
            "presence_subscribe" => Self::PresenceSubscribe {
                uids: uid_list(obj.get("uids")?)?,
            },
            "presence_unsubscribe" => Self::PresenceUnsubscribe,
            "presence_query" => Self::PresenceQuery {
                uids: uid_list(obj.get("uids")?)?,
            },
            "typing_start" => Self::TypingStart,
            "typing_stop" => Self::TypingStop,
            "ack" => Self::Ack {
                ack_id: obj.get("ackId")?.as_u64()?,
            },
            "pending_message" => {
                let temp_id = loose_id(obj.get("tempId")?)?;
                if temp_id.len() > MAX_TEMP_ID_LEN {
                    return None;
                }
                Self::PendingMessage {
                    temp_id,
                    content: obj.get("content")?.as_str()?.to_string(),
                }
            }
            "ping" => Self::Ping,
            _ => return None,
        };

        Some(frame)
    }
}

/// Ids arrive as strings or numbers depending on the client.
fn loose_id(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn optional_text(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::to_string)
        .filter(|s| !s.is_empty())
}

/// Non-id entries are skipped; a non-array is malformed.
fn uid_list(value: &Value) -> Option<Vec<String>> {
    Some(value.as_array()?.iter().filter_map(loose_id).collect())
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Closed set of event types pushed to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewMessages,
    ReactionAdd,
    ReactionRemove,
    MessageEdit,
    MessageDelete,
    PresenceUpdate,
    OnlineCountUpdate,
    PresenceResult,
    TypingStart,
    TypingStop,
    Pong,
    Notification,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::NewMessages,
        EventKind::ReactionAdd,
        EventKind::ReactionRemove,
        EventKind::MessageEdit,
        EventKind::MessageDelete,
        EventKind::PresenceUpdate,
        EventKind::OnlineCountUpdate,
        EventKind::PresenceResult,
        EventKind::TypingStart,
        EventKind::TypingStop,
        EventKind::Pong,
        EventKind::Notification,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            EventKind::NewMessages => "new_messages",
            EventKind::ReactionAdd => "reaction_add",
            EventKind::ReactionRemove => "reaction_remove",
            EventKind::MessageEdit => "message_edit",
            EventKind::MessageDelete => "message_delete",
            EventKind::PresenceUpdate => "presence_update",
            EventKind::OnlineCountUpdate => "online_count_update",
            EventKind::PresenceResult => "presence_result",
            EventKind::TypingStart => "typing_start",
            EventKind::TypingStop => "typing_stop",
            EventKind::Pong => "pong",
            EventKind::Notification => "notification",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Reliable events carry an `ackId` and are retried until acknowledged.
    pub fn is_reliable(self) -> bool {
        match self {
            EventKind::NewMessages
            | EventKind::ReactionAdd
            | EventKind::ReactionRemove
            | EventKind::MessageEdit
            | EventKind::MessageDelete => true,
            EventKind::PresenceUpdate
            | EventKind::OnlineCountUpdate
            | EventKind::PresenceResult
            | EventKind::TypingStart
            | EventKind::TypingStop
            | EventKind::Pong
            | EventKind::Notification => false,
        }
    }
}

/// One user's presence as reported to watchers. `name` and `avatar` come
/// from the user's latest `join` and are left out when never supplied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceInfo {
    pub uid: String,
    pub active: bool,
    pub last_seen: Option<i64>,
    pub name: Option<String>,
    pub avatar: Option<String>,
}

impl PresenceInfo {
    /// A user id nobody has connected with.
    pub fn unknown(uid: &str) -> Self {
        Self {
            uid: uid.to_string(),
            ..Default::default()
        }
    }

    fn to_fields(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("uid".into(), Value::from(self.uid.as_str()));
        fields.insert("active".into(), Value::from(self.active));
        fields.insert("lastSeen".into(), self.last_seen.map_or(Value::Null, Value::from));
        if let Some(name) = &self.name {
            fields.insert("name".into(), Value::from(name.as_str()));
        }
        if let Some(avatar) = &self.avatar {
            fields.insert("avatar".into(), Value::from(avatar.as_str()));
        }
        fields
    }
}

/// An event ready to be pushed to one or more connections.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerEvent {
    kind: EventKind,
    fields: Map<String, Value>,
}

impl ServerEvent {
    /// Build an event from its kind and body. Any `type` or `ackId` keys in
    /// `fields` are discarded; both are owned by the encoder.
    pub fn new(kind: EventKind, mut fields: Map<String, Value>) -> Self {
        fields.remove("type");
        fields.remove("ackId");
        Self { kind, fields }
    }

    /// Decode an event handed over by a collaborator.
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        let Value::Object(fields) = value else {
            return Err(ProtocolError::NotAnObject);
        };
        let tag = fields
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;
        let kind =
            EventKind::from_tag(tag).ok_or_else(|| ProtocolError::UnknownType(tag.to_string()))?;
        Ok(Self::new(kind, fields))
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn is_reliable(&self) -> bool {
        self.kind.is_reliable()
    }

    /// Serialize to the wire form, stamping `ackId` when given.
    pub fn encode(&self, ack_id: Option<u64>) -> String {
        let mut obj = Map::with_capacity(self.fields.len() + 2);
        obj.insert("type".into(), Value::from(self.kind.tag()));
        if let Some(id) = ack_id {
            obj.insert("ackId".into(), Value::from(id));
        }
        for (key, value) in &self.fields {
            obj.insert(key.clone(), value.clone());
        }
        Value::Object(obj).to_string()
    }

    pub fn new_messages(records: &[EnrichedRecord]) -> Result<Self, ProtocolError> {
        let messages = serde_json::to_value(records)?;
        Ok(Self::with(EventKind::NewMessages, json!({ "messages": messages })))
    }

    pub fn presence_update(info: &PresenceInfo) -> Self {
        Self::new(EventKind::PresenceUpdate, info.to_fields())
    }

    pub fn presence_result(entries: &[PresenceInfo]) -> Self {
        let users: Vec<Value> = entries
            .iter()
            .map(|info| Value::Object(info.to_fields()))
            .collect();
        Self::with(EventKind::PresenceResult, json!({ "users": users }))
    }

    pub fn online_count(count: usize) -> Self {
        Self::with(EventKind::OnlineCountUpdate, json!({ "count": count }))
    }

    pub fn typing(start: bool, uid: &str) -> Self {
        let kind = if start {
            EventKind::TypingStart
        } else {
            EventKind::TypingStop
        };
        Self::with(kind, json!({ "uid": uid }))
    }

    pub fn pong() -> Self {
        Self::new(EventKind::Pong, Map::new())
    }

    pub fn notification(notice: &Notice) -> Self {
        Self::with(
            EventKind::Notification,
            json!({
                "kind": notice.kind.as_str(),
                "recordId": notice.record_id,
                "fromUid": notice.from_uid,
                "fromName": notice.from_name,
            }),
        )
    }

    fn with(kind: EventKind, body: Value) -> Self {
        match body {
            Value::Object(fields) => Self::new(kind, fields),
            _ => Self::new(kind, Map::new()),
        }
    }
}

// ---------------------------------------------------------------------------
// Fan-out payloads
// ---------------------------------------------------------------------------

/// Short excerpt of the record a message replies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplyPreview {
    pub id: ExternalId,
    pub author_id: String,
    pub display_name: String,
    pub body: String,
}

/// A newly ingested record as fanned out to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedRecord {
    #[serde(flatten)]
    pub record: NormalizedRecord,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyPreview>,
    /// Set when the record matched a client's optimistic draft.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

impl From<NormalizedRecord> for EnrichedRecord {
    fn from(record: NormalizedRecord) -> Self {
        Self {
            record,
            reply_to: None,
            temp_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    Reply,
    Mention,
}

impl NoticeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeKind::Reply => "reply",
            NoticeKind::Mention => "mention",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "reply" => Some(NoticeKind::Reply),
            "mention" => Some(NoticeKind::Mention),
            _ => None,
        }
    }
}

/// A direct alert for one user, raised while a batch is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub target_uid: String,
    pub kind: NoticeKind,
    pub record_id: ExternalId,
    pub from_uid: String,
    pub from_name: String,
}
