//! Domain model structs persisted in the SQLite database.
//!
//! Every struct derives `Serialize` and `Deserialize` so it can be handed
//! directly to the REST and realtime layers.

use std::collections::{BTreeMap, BTreeSet};

use agora_shared::types::{MessageType, PageRequest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// User
// ---------------------------------------------------------------------------

/// A user known to the external directory. Only the public profile fields
/// are mirrored here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: Option<String>,
    pub avatar_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Block
// ---------------------------------------------------------------------------

/// A directional block. Inactive rows are kept as history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Block {
    pub id: Uuid,
    pub blocker: Uuid,
    pub blocked: Uuid,
    pub blocker_username: String,
    pub blocked_username: String,
    pub reason: String,
    pub is_active: bool,
    pub unblocked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Both directions of the block relation between the caller and another user.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BlockStatus {
    /// The caller blocked the other user.
    pub is_blocked: bool,
    /// The other user blocked the caller.
    pub is_blocked_by: bool,
}

// ---------------------------------------------------------------------------
// Conversation
// ---------------------------------------------------------------------------

/// A two-party conversation with its denormalized summary fields.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Conversation {
    pub id: Uuid,
    pub participants: [Uuid; 2],
    /// Same order as `participants`.
    pub participant_usernames: [String; 2],
    pub last_message: Option<Message>,
    pub last_message_at: Option<DateTime<Utc>>,
    /// Sparse: a missing entry means zero.
    pub unread_counts: BTreeMap<Uuid, u32>,
    pub archived_by: BTreeSet<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.participants.contains(&user_id)
    }

    /// The participant that is not `user_id`, if `user_id` is a participant.
    pub fn other_participant(&self, user_id: Uuid) -> Option<Uuid> {
        match self.participants {
            [a, b] if a == user_id => Some(b),
            [a, b] if b == user_id => Some(a),
            _ => None,
        }
    }

    pub fn unread_for(&self, user_id: Uuid) -> u32 {
        self.unread_counts.get(&user_id).copied().unwrap_or(0)
    }
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReadReceipt {
    pub user_id: Uuid,
    pub read_at: DateTime<Utc>,
}

/// A single direct message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub content: String,
    pub message_type: MessageType,
    pub media_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub is_read: bool,
    pub read_by: Vec<ReadReceipt>,
    pub is_edited: bool,
    pub edited_at: Option<DateTime<Utc>>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub reply_to: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Input for [`Database::create_message`](crate::Database::create_message).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub sender_username: String,
    pub content: String,
    pub message_type: MessageType,
    pub media_url: Option<String>,
    pub file_name: Option<String>,
    pub file_size: Option<i64>,
    pub reply_to: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Pagination
// ---------------------------------------------------------------------------

/// One page of an offset-paginated listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
    /// Total number of matching rows, when the listing computes it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl<T> Page<T> {
    pub(crate) fn new(items: Vec<T>, request: PageRequest, has_more: bool, total: Option<u64>) -> Self {
        Self {
            items,
            page: request.page,
            limit: request.limit,
            has_more,
            total,
        }
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> Page<U> {
        Page {
            items: self.items.into_iter().map(f).collect(),
            page: self.page,
            limit: self.limit,
            has_more: self.has_more,
            total: self.total,
        }
    }
}

/// Unread totals for one user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct UnreadSummary {
    pub total: u64,
    pub by_conversation: BTreeMap<Uuid, u32>,
}
