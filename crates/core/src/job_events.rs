//! WebSocket message type constants.
//!
//! These are the `type` discriminators of the JSON envelopes exchanged with
//! browser clients. The serde tags on the API crate's message enums must
//! stay in sync with them.

/// Handshake sent once right after the upgrade.
pub const MSG_TYPE_CONNECTED: &str = "connected";

/// Acknowledges a successful `subscribe` command.
pub const MSG_TYPE_SUBSCRIBED: &str = "subscribed";

/// Acknowledges an `unsubscribe` command.
pub const MSG_TYPE_UNSUBSCRIBED: &str = "unsubscribed";

/// Job snapshot on progress and on reaching a terminal status.
pub const MSG_TYPE_JOB_PROGRESS: &str = "job:progress";

/// Chat message pushed to a `chat:<id>` channel.
pub const MSG_TYPE_CHAT_MESSAGE: &str = "chat:message";

/// Document upload progress pushed to an `upload:<id>` channel.
pub const MSG_TYPE_UPLOAD_PROGRESS: &str = "upload:progress";

/// Client command: start receiving a channel.
pub const CMD_SUBSCRIBE: &str = "subscribe";

/// Client command: stop receiving a channel.
pub const CMD_UNSUBSCRIBE: &str = "unsubscribe";
