use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{
    CONVERSATION_ROOM_PREFIX, DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT, USER_ROOM_PREFIX,
};
use crate::error::ValidationError;

/// Kind of payload carried by a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    #[default]
    Text,
    Image,
    File,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "file" => Some(Self::File),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A realtime broadcast group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Room {
    /// Personal channel of one user, used for out-of-conversation notifications.
    User(Uuid),
    /// Everyone currently viewing one conversation.
    Conversation(Uuid),
}

impl Room {
    pub fn to_topic(&self) -> String {
        match self {
            Self::User(id) => format!("{USER_ROOM_PREFIX}{id}"),
            Self::Conversation(id) => format!("{CONVERSATION_ROOM_PREFIX}{id}"),
        }
    }
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_topic())
    }
}

/// Validated offset pagination parameters. Pages are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub page: u32,
    pub limit: u32,
}

impl PageRequest {
    /// Build a page request from optional client input, applying defaults.
    pub fn new(page: Option<u32>, limit: Option<u32>) -> Result<Self, ValidationError> {
        let page = page.unwrap_or(1);
        let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);

        if page == 0 {
            return Err(ValidationError::new("page must be at least 1"));
        }
        if limit == 0 || limit > MAX_PAGE_LIMIT {
            return Err(ValidationError::new(format!(
                "limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }

        Ok(Self { page, limit })
    }

    pub fn offset(&self) -> u64 {
        u64::from(self.page - 1) * u64::from(self.limit)
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            limit: DEFAULT_PAGE_LIMIT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_round_trip_through_str() {
        for kind in [MessageType::Text, MessageType::Image, MessageType::File] {
            assert_eq!(MessageType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(MessageType::parse("video"), None);
    }

    #[test]
    fn test_message_type_serializes_lowercase() {
        let json = serde_json::to_string(&MessageType::Image).unwrap();
        assert_eq!(json, "\"image\"");
    }

    #[test]
    fn test_room_topics() {
        let id = Uuid::nil();
        assert_eq!(
            Room::User(id).to_topic(),
            "user:00000000-0000-0000-0000-000000000000"
        );
        assert!(Room::Conversation(id).to_topic().starts_with("conversation:"));
    }

    #[test]
    fn test_page_request_defaults() {
        let page = PageRequest::new(None, None).unwrap();
        assert_eq!(page, PageRequest::default());
        assert_eq!(page.offset(), 0);
    }

    #[test]
    fn test_page_request_offset() {
        let page = PageRequest::new(Some(3), Some(20)).unwrap();
        assert_eq!(page.offset(), 40);
    }

    #[test]
    fn test_page_request_rejects_bad_input() {
        assert!(PageRequest::new(Some(0), None).is_err());
        assert!(PageRequest::new(None, Some(0)).is_err());
        assert!(PageRequest::new(None, Some(MAX_PAGE_LIMIT + 1)).is_err());
    }
}
