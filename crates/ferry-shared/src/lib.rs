//! # ferry-shared
//!
//! Types shared between the relay's storage layer and its server: the
//! canonical [`NormalizedRecord`] that every upstream chat record is mapped
//! into, the arbitrary-precision [`ExternalId`], and the push-connection wire
//! protocol (client control frames and server events).

pub mod constants;
pub mod error;
pub mod fingerprint;
pub mod protocol;
pub mod record;
pub mod types;

pub use error::{ProtocolError, RecordError};
pub use fingerprint::content_fingerprint;
pub use protocol::{
    ClientFrame, EnrichedRecord, EventKind, Notice, NoticeKind, PresenceInfo, ReplyPreview,
    ServerEvent,
};
pub use record::NormalizedRecord;
pub use types::ExternalId;
