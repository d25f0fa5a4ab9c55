//! Messaging operations shared by the REST API and the realtime gateway.
//!
//! Every operation runs its store work in one [`SharedDatabase::call`] and
//! then fans events out through the [`Hub`]. Fan-out happens after the write
//! has committed and never fails the request.

use std::sync::Arc;

use agora_shared::constants::MIN_SEARCH_QUERY_LENGTH;
use agora_shared::protocol::SendMessageRequest;
use agora_shared::types::{PageRequest, Room};
use agora_store::messages::validate_content;
use agora_store::{
    Block, BlockStatus, Conversation, Database, Message, NewMessage, Page, SharedDatabase,
    StoreError, UnreadSummary, User,
};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::gateway::events::ServerEvent;
use crate::gateway::Hub;
use crate::rate_limit::RateLimiter;

/// A conversation with the public profiles of both participants.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationView {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub participant_profiles: Vec<User>,
}

#[derive(Clone)]
pub struct Messenger {
    db: SharedDatabase,
    hub: Hub,
    send_limiter: RateLimiter<Uuid>,
    config: Arc<ServerConfig>,
}

impl Messenger {
    pub fn new(db: SharedDatabase, hub: Hub, config: Arc<ServerConfig>) -> Self {
        let send_limiter = RateLimiter::new(config.message_rate_per_sec, config.message_burst);
        Self {
            db,
            hub,
            send_limiter,
            config,
        }
    }

    pub fn send_limiter(&self) -> &RateLimiter<Uuid> {
        &self.send_limiter
    }

    // ------------------------------------------------------------------
    // Conversations
    // ------------------------------------------------------------------

    /// Get or create the conversation between the requester and
    /// `recipient_username`. The boolean is `true` when it was created.
    pub async fn start_conversation(
        &self,
        requester: &AuthUser,
        recipient_username: &str,
    ) -> ServerResult<(ConversationView, bool)> {
        let requester = requester.clone();
        let recipient_username = recipient_username.trim().to_string();
        if recipient_username.is_empty() {
            return Err(ServerError::Validation("Recipient username is required".into()));
        }

        let (view, created) = self
            .db
            .call(move |db| {
                db.ensure_user(requester.id, &requester.username)?;
                let recipient = db
                    .find_user_by_username(&recipient_username)?
                    .ok_or(StoreError::NotFound("User"))?;
                if recipient.id == requester.id {
                    return Err(StoreError::validation(
                        "Cannot start a conversation with yourself",
                    ));
                }
                if db.are_blocked(requester.id, recipient.id)? {
                    return Err(StoreError::Forbidden(
                        "Cannot start a conversation with this user",
                    ));
                }
                let me = db.get_user(requester.id)?;
                let (conversation, created) = db.get_or_create_conversation(&me, &recipient)?;
                Ok((view_on(db, conversation)?, created))
            })
            .await?;

        if created {
            info!(conversation = %view.conversation.id, "Conversation started");
        }
        Ok((view, created))
    }

    pub async fn list_conversations(
        &self,
        requester: &AuthUser,
        page: PageRequest,
    ) -> ServerResult<Page<ConversationView>> {
        let user_id = requester.id;
        let page = self
            .db
            .call(move |db| {
                let page = db.list_conversations_for_user(user_id, page)?;
                let Page {
                    items,
                    page: number,
                    limit,
                    has_more,
                    total,
                } = page;
                let mut views = Vec::with_capacity(items.len());
                for conversation in items {
                    views.push(view_on(db, conversation)?);
                }
                Ok(Page {
                    items: views,
                    page: number,
                    limit,
                    has_more,
                    total,
                })
            })
            .await?;
        Ok(page)
    }

    pub async fn get_conversation(
        &self,
        requester: &AuthUser,
        conversation_id: Uuid,
    ) -> ServerResult<ConversationView> {
        let user_id = requester.id;
        let view = self
            .db
            .call(move |db| {
                let conversation = participant_conversation(db, conversation_id, user_id)?;
                view_on(db, conversation)
            })
            .await?;
        Ok(view)
    }

    /// Load a conversation and check that `requester` takes part in it.
    pub async fn ensure_participant(
        &self,
        requester: &AuthUser,
        conversation_id: Uuid,
    ) -> ServerResult<Conversation> {
        let user_id = requester.id;
        Ok(self
            .db
            .call(move |db| participant_conversation(db, conversation_id, user_id))
            .await?)
    }

    pub async fn archive_conversation(
        &self,
        requester: &AuthUser,
        conversation_id: Uuid,
        archive: bool,
    ) -> ServerResult<ConversationView> {
        let user_id = requester.id;
        let view = self
            .db
            .call(move |db| {
                participant_conversation(db, conversation_id, user_id)?;
                db.set_archived(conversation_id, user_id, archive)?;
                let conversation = db.get_conversation(conversation_id)?;
                view_on(db, conversation)
            })
            .await?;
        debug!(conversation = %conversation_id, user = %user_id, archive, "Archive toggled");
        Ok(view)
    }

    pub async fn unread_count(&self, requester: &AuthUser) -> ServerResult<UnreadSummary> {
        let user_id = requester.id;
        Ok(self.db.call(move |db| db.unread_summary(user_id)).await?)
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// The single send path behind `POST /messages` and the `send_message`
    /// socket event: conversation exists, requester participates, neither
    /// side blocked the other, persist, then fan out.
    ///
    /// The per-user send budget is only spent by requests that pass those
    /// checks. They run again in the write call, so a block landing in
    /// between still wins.
    pub async fn send_message(
        &self,
        requester: &AuthUser,
        request: SendMessageRequest,
    ) -> ServerResult<Message> {
        validate_content(&request.content)?;
        let (conversation_id, sender_id) = (request.conversation_id, requester.id);
        self.db
            .call(move |db| authorize_send(db, conversation_id, sender_id).map(|_| ()))
            .await?;

        if !self.send_limiter.check(requester.id).await {
            debug!(user = %requester.id, "Send rate limit exceeded");
            return Err(ServerError::RateLimited);
        }

        let sender = requester.clone();
        let (message, recipient) = self
            .db
            .call(move |db| {
                let recipient = authorize_send(db, request.conversation_id, sender.id)?;
                let message = db.create_message(NewMessage {
                    conversation_id: request.conversation_id,
                    sender_id: sender.id,
                    sender_username: sender.username,
                    content: request.content,
                    message_type: request.message_type,
                    media_url: request.media_url,
                    file_name: request.file_name,
                    file_size: request.file_size,
                    reply_to: request.reply_to,
                })?;
                Ok((message, recipient))
            })
            .await?;

        self.hub
            .emit_to_room(
                Room::Conversation(message.conversation_id),
                ServerEvent::NewMessage(message.clone()),
                None,
            )
            .await;
        self.hub
            .emit_to_room(
                Room::User(recipient),
                ServerEvent::NewMessageNotification {
                    conversation_id: message.conversation_id,
                    message: message.clone(),
                },
                None,
            )
            .await;

        Ok(message)
    }

    /// A page of history. Fetching marks the other side's messages read and
    /// resets the requester's unread counter.
    pub async fn get_messages(
        &self,
        requester: &AuthUser,
        conversation_id: Uuid,
        page: PageRequest,
    ) -> ServerResult<Page<Message>> {
        let user_id = requester.id;
        let include_deleted = self.config.show_deleted_messages;
        let (page, marked) = self
            .db
            .call(move |db| {
                participant_conversation(db, conversation_id, user_id)?;
                let page = db.list_messages(conversation_id, page, include_deleted)?;
                let marked = mark_read_on(db, conversation_id, user_id)?;
                Ok((page, marked))
            })
            .await?;

        self.emit_read(conversation_id, user_id, marked).await;
        Ok(page)
    }

    /// Same read side effect as [`Messenger::get_messages`] without a fetch.
    pub async fn mark_messages_read(
        &self,
        requester: &AuthUser,
        conversation_id: Uuid,
    ) -> ServerResult<usize> {
        let user_id = requester.id;
        let marked = self
            .db
            .call(move |db| {
                participant_conversation(db, conversation_id, user_id)?;
                mark_read_on(db, conversation_id, user_id)
            })
            .await?;

        self.emit_read(conversation_id, user_id, marked).await;
        Ok(marked)
    }

    pub async fn delete_message(&self, requester: &AuthUser, message_id: Uuid) -> ServerResult<Message> {
        let user_id = requester.id;
        let message = self
            .db
            .call(move |db| db.soft_delete_message(message_id, user_id))
            .await?;

        info!(message = %message_id, conversation = %message.conversation_id, "Message deleted");
        self.hub
            .emit_to_room(
                Room::Conversation(message.conversation_id),
                ServerEvent::MessageDeleted {
                    conversation_id: message.conversation_id,
                    message_id,
                },
                None,
            )
            .await;
        Ok(message)
    }

    pub async fn edit_message(
        &self,
        requester: &AuthUser,
        message_id: Uuid,
        content: String,
    ) -> ServerResult<Message> {
        let user_id = requester.id;
        let message = self
            .db
            .call(move |db| db.edit_message(message_id, user_id, &content))
            .await?;

        self.hub
            .emit_to_room(
                Room::Conversation(message.conversation_id),
                ServerEvent::MessageEdited(message.clone()),
                None,
            )
            .await;
        Ok(message)
    }

    async fn emit_read(&self, conversation_id: Uuid, user_id: Uuid, count: usize) {
        self.hub
            .emit_to_room(
                Room::Conversation(conversation_id),
                ServerEvent::MessagesRead {
                    conversation_id,
                    user_id,
                    count,
                },
                None,
            )
            .await;
    }

    // ------------------------------------------------------------------
    // Blocks
    // ------------------------------------------------------------------

    pub async fn block_user(
        &self,
        requester: &AuthUser,
        username: &str,
        reason: Option<String>,
    ) -> ServerResult<Block> {
        let me = requester.clone();
        let username = username.trim().to_string();
        let block = self
            .db
            .call(move |db| {
                db.ensure_user(me.id, &me.username)?;
                let target = resolve_username(db, &username)?;
                db.block(me.id, target.id, reason.as_deref().unwrap_or(""))
            })
            .await?;

        info!(blocker = %block.blocker, blocked = %block.blocked, "User blocked");
        self.hub
            .emit_to_room(
                Room::User(block.blocked),
                ServerEvent::UserBlocked {
                    blocker_id: block.blocker,
                    blocker_username: block.blocker_username.clone(),
                },
                None,
            )
            .await;
        Ok(block)
    }

    pub async fn unblock_user(&self, requester: &AuthUser, username: &str) -> ServerResult<Block> {
        let user_id = requester.id;
        let username = username.trim().to_string();
        let block = self
            .db
            .call(move |db| {
                let target = resolve_username(db, &username)?;
                db.unblock(user_id, target.id)
            })
            .await?;

        info!(blocker = %block.blocker, blocked = %block.blocked, "User unblocked");
        Ok(block)
    }

    pub async fn blocked_users(&self, requester: &AuthUser) -> ServerResult<Vec<Block>> {
        let user_id = requester.id;
        Ok(self.db.call(move |db| db.list_blocked(user_id)).await?)
    }

    pub async fn block_status(&self, requester: &AuthUser, username: &str) -> ServerResult<BlockStatus> {
        let user_id = requester.id;
        let username = username.trim().to_string();
        Ok(self
            .db
            .call(move |db| {
                let target = resolve_username(db, &username)?;
                db.block_status(user_id, target.id)
            })
            .await?)
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub async fn search_users(&self, requester: &AuthUser, query: &str) -> ServerResult<Vec<User>> {
        let query = query.trim().to_string();
        if query.chars().count() < MIN_SEARCH_QUERY_LENGTH {
            return Err(ServerError::Validation(format!(
                "Search query must be at least {MIN_SEARCH_QUERY_LENGTH} characters"
            )));
        }

        let user_id = requester.id;
        let limit = self.config.search_result_limit;
        Ok(self
            .db
            .call(move |db| db.search_users(user_id, &query, limit))
            .await?)
    }

    /// Record the session identity in the local directory.
    pub async fn ensure_user(&self, user: &AuthUser) -> ServerResult<()> {
        let user = user.clone();
        Ok(self
            .db
            .call(move |db| db.ensure_user(user.id, &user.username))
            .await?)
    }
}

fn participant_conversation(
    db: &Database,
    conversation_id: Uuid,
    user_id: Uuid,
) -> Result<Conversation, StoreError> {
    let conversation = db.get_conversation(conversation_id)?;
    if !conversation.is_participant(user_id) {
        return Err(StoreError::Forbidden("Not a participant in this conversation"));
    }
    Ok(conversation)
}

/// Returns the recipient when `sender` may write to the conversation.
fn authorize_send(db: &Database, conversation_id: Uuid, sender: Uuid) -> Result<Uuid, StoreError> {
    let conversation = participant_conversation(db, conversation_id, sender)?;
    let recipient = conversation
        .other_participant(sender)
        .ok_or(StoreError::Forbidden("Not a participant in this conversation"))?;
    if db.are_blocked(sender, recipient)? {
        return Err(StoreError::Forbidden("Cannot send messages to this user"));
    }
    Ok(recipient)
}

fn mark_read_on(db: &mut Database, conversation_id: Uuid, user_id: Uuid) -> Result<usize, StoreError> {
    let marked = db.mark_read_for_conversation(conversation_id, user_id)?;
    db.reset_unread(conversation_id, user_id)?;
    Ok(marked)
}

fn resolve_username(db: &Database, username: &str) -> Result<User, StoreError> {
    db.find_user_by_username(username)?
        .ok_or(StoreError::NotFound("User"))
}

fn view_on(db: &Database, conversation: Conversation) -> Result<ConversationView, StoreError> {
    let mut participant_profiles = Vec::with_capacity(2);
    for id in conversation.participants {
        match db.get_user(id) {
            Ok(user) => participant_profiles.push(user),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(ConversationView {
        conversation,
        participant_profiles,
    })
}
