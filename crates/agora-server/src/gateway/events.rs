use agora_store::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ServerError;
use crate::presence::OnlineUser;

/// Events pushed to connected clients, framed as
/// `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    NewMessage(Message),
    NewMessageNotification {
        conversation_id: Uuid,
        message: Message,
    },
    MessagesRead {
        conversation_id: Uuid,
        user_id: Uuid,
        count: usize,
    },
    MessageDeleted {
        conversation_id: Uuid,
        message_id: Uuid,
    },
    MessageEdited(Message),
    /// Sent to the originating connection only.
    MessageError {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
    UsersOnline(Vec<OnlineUser>),
    UserTyping {
        conversation_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    UserStopTyping {
        conversation_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    UserBlocked {
        blocker_id: Uuid,
        blocker_username: String,
    },
}

impl ServerEvent {
    pub fn error(err: &ServerError, event: Option<&str>) -> Self {
        ServerEvent::MessageError {
            kind: err.kind().to_string(),
            message: err.public_message(),
            event: event.map(str::to_string),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::NewMessageNotification { .. } => "new_message_notification",
            ServerEvent::MessagesRead { .. } => "messages_read",
            ServerEvent::MessageDeleted { .. } => "message_deleted",
            ServerEvent::MessageEdited(_) => "message_edited",
            ServerEvent::MessageError { .. } => "message_error",
            ServerEvent::UsersOnline(_) => "users_online",
            ServerEvent::UserTyping { .. } => "user_typing",
            ServerEvent::UserStopTyping { .. } => "user_stop_typing",
            ServerEvent::UserBlocked { .. } => "user_blocked",
        }
    }
}
