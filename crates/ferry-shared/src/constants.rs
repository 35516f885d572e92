/// Upstream timestamps above this are milliseconds, not seconds.
pub const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Maximum characters of a reply target's body copied into a preview
pub const REPLY_PREVIEW_CHARS: usize = 120;

/// Maximum characters of a malformed upstream payload echoed into logs
pub const PAYLOAD_PREVIEW_CHARS: usize = 200;

/// Maximum number of uids a single connection may watch for presence
pub const MAX_PRESENCE_SUBSCRIPTIONS: usize = 500;

/// Maximum uids answered by one `presence_query`
pub const MAX_PRESENCE_QUERY: usize = 200;

/// Maximum accepted client frame size in bytes (64 KiB)
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Maximum length of an optimistic-send temp id
pub const MAX_TEMP_ID_LEN: usize = 128;

/// Maximum outstanding optimistic drafts remembered per user
pub const MAX_PENDING_PER_USER: usize = 32;
