use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::MessageType;

/// Body of a send, shared by `POST /messages` and the `send_message` socket
/// event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub conversation_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size: Option<i64>,
}

impl SendMessageRequest {
    pub fn text(conversation_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            content: content.into(),
            message_type: MessageType::Text,
            reply_to: None,
            media_url: None,
            file_name: None,
            file_size: None,
        }
    }
}

/// Payload of the events that only name a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRef {
    pub conversation_id: Uuid,
}

/// Events a connected client may send over the realtime socket.
///
/// Framed as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinConversation(ConversationRef),
    LeaveConversation(ConversationRef),
    TypingStart(ConversationRef),
    TypingStop(ConversationRef),
    SendMessage(SendMessageRequest),
    MarkMessagesRead(ConversationRef),
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JoinConversation(_) => "join_conversation",
            Self::LeaveConversation(_) => "leave_conversation",
            Self::TypingStart(_) => "typing_start",
            Self::TypingStop(_) => "typing_stop",
            Self::SendMessage(_) => "send_message",
            Self::MarkMessagesRead(_) => "mark_messages_read",
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
