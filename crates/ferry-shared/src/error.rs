use thiserror::Error;

/// Reasons an upstream record cannot be normalized.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("Record is not a JSON object")]
    NotAnObject,

    #[error("Missing or unusable field: {0}")]
    MissingField(&'static str),

    #[error("Invalid external id: {0:?}")]
    InvalidId(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// Errors raised while decoding a server event handed in by a collaborator.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Event is not a JSON object")]
    NotAnObject,

    #[error("Missing event type")]
    MissingType,

    #[error("Unknown event type: {0}")]
    UnknownType(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
