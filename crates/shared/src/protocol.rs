use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChatId, ChatKind, MediaKind, MessageId, UserId},
    error::ApiError,
};

/// Requests a client may issue over a live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientRequest {
    JoinConversation {
        chat_id: ChatId,
    },
    LeaveConversation {
        chat_id: ChatId,
    },
    Send {
        chat_id: ChatId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media: Option<MediaRef>,
    },
    MarkRead {
        chat_id: ChatId,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub url: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub chat_id: ChatId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media: Option<MediaRef>,
    pub is_system: bool,
    pub read_by: Vec<UserId>,
    pub sent_at: DateTime<Utc>,
}

/// The "other side" of a direct chat, resolved for the viewing user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipientSummary {
    pub user_id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_image: Option<String>,
}

/// Per-viewer projection of a conversation. Clients treat this as an
/// idempotent overwrite keyed by `chat_id`, never as a delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub kind: ChatKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub participant_ids: Vec<UserId>,
    pub admin_ids: Vec<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<RecipientSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    pub unread: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageReceived {
        message: MessagePayload,
    },
    ConversationCreated {
        chat: ChatSummary,
    },
    ConversationUpdated {
        chat: ChatSummary,
    },
    ConversationRemoved {
        chat_id: ChatId,
    },
    ReadStateChanged {
        chat_id: ChatId,
    },
    SendFailed {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chat_id: Option<ChatId>,
        error: ApiError,
    },
}
