//! WebSocket message protocol.
//!
//! Every frame is a JSON object discriminated by `type`. The tag strings
//! mirror the constants in [`lectern_core::job_events`].

use chrono::Utc;
use lectern_core::channels::ChannelName;
use lectern_core::types::{DbId, Timestamp};
use lectern_db::models::job::JobSnapshot;
use serde::{Deserialize, Serialize};

// =============================================================================
// Client -> Server
// =============================================================================

/// Commands sent by the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientCommand {
    /// Start receiving messages for a channel. The raw name is parsed by the
    /// session so malformed names can be logged and ignored.
    Subscribe { channel: String },
    Unsubscribe { channel: String },
}

// =============================================================================
// Server -> Client
// =============================================================================

/// Messages pushed to the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Handshake, sent once after the upgrade.
    #[serde(rename = "connected")]
    Connected {
        timestamp: Timestamp,
        server_version: String,
    },

    #[serde(rename = "subscribed")]
    Subscribed {
        channel: ChannelName,
        timestamp: Timestamp,
    },

    #[serde(rename = "unsubscribed")]
    Unsubscribed {
        channel: ChannelName,
        timestamp: Timestamp,
    },

    /// Job progress and terminal state; the payload carries the status.
    #[serde(rename = "job:progress")]
    JobProgress {
        channel: ChannelName,
        payload: JobSnapshot,
        timestamp: Timestamp,
    },

    #[serde(rename = "chat:message")]
    ChatMessage {
        channel: ChannelName,
        payload: ChatMessagePayload,
        timestamp: Timestamp,
    },

    #[serde(rename = "upload:progress")]
    UploadProgress {
        channel: ChannelName,
        payload: UploadProgressPayload,
        timestamp: Timestamp,
    },
}

impl ServerMessage {
    pub fn connected(server_version: impl Into<String>) -> Self {
        ServerMessage::Connected {
            timestamp: Utc::now(),
            server_version: server_version.into(),
        }
    }

    pub fn subscribed(channel: ChannelName) -> Self {
        ServerMessage::Subscribed {
            channel,
            timestamp: Utc::now(),
        }
    }

    pub fn unsubscribed(channel: ChannelName) -> Self {
        ServerMessage::Unsubscribed {
            channel,
            timestamp: Utc::now(),
        }
    }

    pub fn job_progress(snapshot: JobSnapshot) -> Self {
        ServerMessage::JobProgress {
            channel: ChannelName::job(snapshot.id),
            payload: snapshot,
            timestamp: Utc::now(),
        }
    }

    pub fn chat_message(channel: ChannelName, payload: ChatMessagePayload) -> Self {
        ServerMessage::ChatMessage {
            channel,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn upload_progress(channel: ChannelName, payload: UploadProgressPayload) -> Self {
        ServerMessage::UploadProgress {
            channel,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// The channel a message is published on, if it belongs to one.
    pub fn channel(&self) -> Option<&ChannelName> {
        match self {
            ServerMessage::Connected { .. } => None,
            ServerMessage::Subscribed { channel, .. }
            | ServerMessage::Unsubscribed { channel, .. }
            | ServerMessage::JobProgress { channel, .. }
            | ServerMessage::ChatMessage { channel, .. }
            | ServerMessage::UploadProgress { channel, .. } => Some(channel),
        }
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// A message appended to a chat session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessagePayload {
    pub message_id: DbId,
    pub session_id: DbId,
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
    pub created_at: Timestamp,
}

/// Processing progress of an uploaded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadProgressPayload {
    pub document_id: DbId,
    pub filename: String,
    /// 0-100.
    pub progress: u8,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use lectern_core::job_events::{
        CMD_SUBSCRIBE, MSG_TYPE_CHAT_MESSAGE, MSG_TYPE_CONNECTED, MSG_TYPE_JOB_PROGRESS,
        MSG_TYPE_SUBSCRIBED, MSG_TYPE_UNSUBSCRIBED, MSG_TYPE_UPLOAD_PROGRESS,
    };
    use lectern_core::channels::ChannelKind;
    use lectern_db::models::job::JobMetrics;
    use lectern_db::models::status::JobStatus;
    use serde_json::json;

    use super::*;

    fn snapshot() -> JobSnapshot {
        JobSnapshot {
            id: uuid::Uuid::new_v4(),
            job_type: "export".into(),
            status: JobStatus::Running,
            owner_id: 7,
            exam_id: Some(3),
            lecture_id: None,
            payload: json!({"format": "pdf"}),
            progress: 40,
            progress_message: "rendering".into(),
            result: None,
            error: None,
            metrics: JobMetrics::new(),
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    fn type_of(msg: &ServerMessage) -> String {
        serde_json::to_value(msg).unwrap()["type"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn tags_match_wire_constants() {
        let chat = ChannelName::new(ChannelKind::Chat, "9");
        let upload = ChannelName::new(ChannelKind::Upload, "4");

        assert_eq!(type_of(&ServerMessage::connected("1.0.0")), MSG_TYPE_CONNECTED);
        assert_eq!(type_of(&ServerMessage::subscribed(chat.clone())), MSG_TYPE_SUBSCRIBED);
        assert_eq!(type_of(&ServerMessage::unsubscribed(chat.clone())), MSG_TYPE_UNSUBSCRIBED);
        assert_eq!(type_of(&ServerMessage::job_progress(snapshot())), MSG_TYPE_JOB_PROGRESS);
        assert_eq!(
            type_of(&ServerMessage::chat_message(
                chat,
                ChatMessagePayload {
                    message_id: 1,
                    session_id: 9,
                    role: "assistant".into(),
                    content: "hi".into(),
                    created_at: Utc::now(),
                }
            )),
            MSG_TYPE_CHAT_MESSAGE
        );
        assert_eq!(
            type_of(&ServerMessage::upload_progress(
                upload,
                UploadProgressPayload {
                    document_id: 4,
                    filename: "notes.pdf".into(),
                    progress: 10,
                    status: "processing".into(),
                    message: None,
                }
            )),
            MSG_TYPE_UPLOAD_PROGRESS
        );
    }

    #[test]
    fn job_progress_envelope_shape() {
        let snapshot = snapshot();
        let value = serde_json::to_value(ServerMessage::job_progress(snapshot.clone())).unwrap();

        assert_eq!(value["channel"], format!("job:{}", snapshot.id));
        assert_eq!(value["payload"]["status"], "RUNNING");
        assert_eq!(value["payload"]["progress"], 40);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn handshake_carries_server_version() {
        let value = serde_json::to_value(ServerMessage::connected("2.3.1")).unwrap();
        assert_eq!(value["server_version"], "2.3.1");
        assert!(value.get("channel").is_none());
    }

    #[test]
    fn parses_client_commands() {
        let cmd: ClientCommand =
            serde_json::from_str(&format!(r#"{{"type":"{CMD_SUBSCRIBE}","channel":"job:1"}}"#))
                .unwrap();
        assert_eq!(cmd, ClientCommand::Subscribe { channel: "job:1".into() });

        let cmd: ClientCommand =
            serde_json::from_str(r#"{"type":"unsubscribe","channel":"chat:2"}"#).unwrap();
        assert_eq!(cmd, ClientCommand::Unsubscribe { channel: "chat:2".into() });

        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"ping"}"#).is_err());
        assert!(serde_json::from_str::<ClientCommand>(r#"{"type":"subscribe"}"#).is_err());
    }
}
