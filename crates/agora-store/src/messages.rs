use agora_shared::constants::{DELETED_MESSAGE_TOMBSTONE, MAX_MESSAGE_LENGTH};
use agora_shared::types::{MessageType, PageRequest};
use rusqlite::types::{FromSqlError, Type};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::conversations::record_new_message_on;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Message, NewMessage, Page, ReadReceipt};
use crate::sql::{fmt_ts, now, parse_opt_ts, parse_opt_uuid, parse_ts, parse_uuid};

const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, sender_username, content, \
                               message_type, media_url, file_name, file_size, is_read, \
                               is_edited, edited_at, is_deleted, deleted_at, reply_to, created_at";

impl Database {
    /// Persist a message and update its conversation's summary in one
    /// transaction.
    pub fn create_message(&mut self, new: NewMessage) -> Result<Message> {
        let content = validate_content(&new.content)?;
        if matches!(new.file_size, Some(size) if size < 0) {
            return Err(StoreError::validation("File size cannot be negative"));
        }

        let tx = self.conn_mut().transaction()?;

        let exists: bool = tx.query_row(
            "SELECT EXISTS (SELECT 1 FROM conversations WHERE id = ?1)",
            params![new.conversation_id.to_string()],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(StoreError::NotFound("Conversation"));
        }

        if let Some(parent) = new.reply_to {
            let parent_conversation: Option<String> = tx
                .query_row(
                    "SELECT conversation_id FROM messages WHERE id = ?1",
                    params![parent.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            if parent_conversation.as_deref() != Some(new.conversation_id.to_string().as_str()) {
                return Err(StoreError::validation(
                    "Replied-to message does not belong to this conversation",
                ));
            }
        }

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: new.conversation_id,
            sender_id: new.sender_id,
            sender_username: new.sender_username,
            content,
            message_type: new.message_type,
            media_url: new.media_url,
            file_name: new.file_name,
            file_size: new.file_size,
            is_read: false,
            read_by: Vec::new(),
            is_edited: false,
            edited_at: None,
            is_deleted: false,
            deleted_at: None,
            reply_to: new.reply_to,
            created_at: now(),
        };

        tx.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, sender_username, content,
                                   message_type, media_url, file_name, file_size, reply_to,
                                   created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id.to_string(),
                message.conversation_id.to_string(),
                message.sender_id.to_string(),
                message.sender_username,
                message.content,
                message.message_type.as_str(),
                message.media_url,
                message.file_name,
                message.file_size,
                message.reply_to.map(|id| id.to_string()),
                fmt_ts(&message.created_at),
            ],
        )?;
        record_new_message_on(&tx, &message)?;
        tx.commit()?;

        tracing::debug!(
            message = %message.id,
            conversation = %message.conversation_id,
            kind = %message.message_type,
            "message stored"
        );
        Ok(message)
    }

    pub fn get_message(&self, id: Uuid) -> Result<Message> {
        message_on(self.conn(), id)?.ok_or(StoreError::NotFound("Message"))
    }

    /// One page of a conversation's history, oldest first within the page.
    ///
    /// Pages are cut from the newest end: page 1 holds the most recent
    /// `limit` messages. `has_more` is a heuristic (`len == limit`).
    pub fn list_messages(
        &self,
        conversation_id: Uuid,
        request: PageRequest,
        include_deleted: bool,
    ) -> Result<Page<Message>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE conversation_id = ?1 AND (?2 OR is_deleted = 0)
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?3 OFFSET ?4"
        ))?;
        let rows = stmt.query_map(
            params![
                conversation_id.to_string(),
                include_deleted,
                i64::from(request.limit),
                request.offset() as i64,
            ],
            row_to_message,
        )?;

        let mut messages = Vec::new();
        for row in rows {
            let mut message = row?;
            message.read_by = read_receipts_on(self.conn(), message.id)?;
            messages.push(message);
        }
        messages.reverse();

        let has_more = messages.len() == request.limit as usize;
        Ok(Page::new(messages, request, has_more, None))
    }

    /// Mark every unread message not sent by `reader` as read and record a
    /// receipt for it. Returns the number of messages marked.
    pub fn mark_read_for_conversation(&mut self, conversation_id: Uuid, reader: Uuid) -> Result<usize> {
        let conversation = conversation_id.to_string();
        let reader = reader.to_string();

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT OR IGNORE INTO message_reads (message_id, user_id, read_at)
             SELECT id, ?2, ?3 FROM messages
             WHERE conversation_id = ?1 AND sender_id <> ?2 AND is_read = 0",
            params![conversation, reader, fmt_ts(&now())],
        )?;
        let marked = tx.execute(
            "UPDATE messages SET is_read = 1
             WHERE conversation_id = ?1 AND sender_id <> ?2 AND is_read = 0",
            params![conversation, reader],
        )?;
        tx.commit()?;

        Ok(marked)
    }

    /// Replace the content with the tombstone and flag the message deleted.
    /// Only the sender may do this, and only once.
    pub fn soft_delete_message(&self, id: Uuid, requester: Uuid) -> Result<Message> {
        let message = self.get_message(id)?;
        if message.sender_id != requester {
            return Err(StoreError::Forbidden("Only the sender can delete this message"));
        }
        if message.is_deleted {
            return Err(StoreError::AlreadyDeleted);
        }

        let affected = self.conn().execute(
            "UPDATE messages SET is_deleted = 1, deleted_at = ?2, content = ?3
             WHERE id = ?1 AND is_deleted = 0",
            params![id.to_string(), fmt_ts(&now()), DELETED_MESSAGE_TOMBSTONE],
        )?;
        if affected == 0 {
            return Err(StoreError::AlreadyDeleted);
        }

        tracing::debug!(message = %id, "message soft-deleted");
        self.get_message(id)
    }

    pub fn edit_message(&self, id: Uuid, requester: Uuid, content: &str) -> Result<Message> {
        let content = validate_content(content)?;
        let message = self.get_message(id)?;
        if message.sender_id != requester {
            return Err(StoreError::Forbidden("Only the sender can edit this message"));
        }
        if message.is_deleted {
            return Err(StoreError::AlreadyDeleted);
        }

        let affected = self.conn().execute(
            "UPDATE messages SET content = ?2, is_edited = 1, edited_at = ?3
             WHERE id = ?1 AND is_deleted = 0",
            params![id.to_string(), content, fmt_ts(&now())],
        )?;
        if affected == 0 {
            return Err(StoreError::AlreadyDeleted);
        }

        self.get_message(id)
    }
}

/// Trimmed, non-empty, at most [`MAX_MESSAGE_LENGTH`] characters.
/// Trim `content` and check it against the length bounds.
pub fn validate_content(content: &str) -> Result<String> {
    let content = content.trim();
    if content.is_empty() {
        return Err(StoreError::validation("Message content cannot be empty"));
    }
    if content.chars().count() > MAX_MESSAGE_LENGTH {
        return Err(StoreError::validation(format!(
            "Message content cannot exceed {MAX_MESSAGE_LENGTH} characters"
        )));
    }
    Ok(content.to_string())
}

pub(crate) fn message_on(conn: &Connection, id: Uuid) -> Result<Option<Message>> {
    let message = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id.to_string()],
            row_to_message,
        )
        .optional()?;

    match message {
        Some(mut message) => {
            message.read_by = read_receipts_on(conn, message.id)?;
            Ok(Some(message))
        }
        None => Ok(None),
    }
}

fn read_receipts_on(conn: &Connection, message_id: Uuid) -> Result<Vec<ReadReceipt>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, read_at FROM message_reads WHERE message_id = ?1 ORDER BY read_at ASC",
    )?;
    let rows = stmt.query_map(params![message_id.to_string()], |row| {
        let user: String = row.get(0)?;
        let read_at: String = row.get(1)?;
        Ok(ReadReceipt {
            user_id: parse_uuid(0, &user)?,
            read_at: parse_ts(1, &read_at)?,
        })
    })?;
    rows.collect::<std::result::Result<Vec<_>, _>>()
        .map_err(StoreError::Sqlite)
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    let id: String = row.get(0)?;
    let conversation_id: String = row.get(1)?;
    let sender_id: String = row.get(2)?;
    let message_type: String = row.get(5)?;
    let created_at: String = row.get(15)?;

    let message_type = MessageType::parse(&message_type).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(FromSqlError::InvalidType))
    })?;

    Ok(Message {
        id: parse_uuid(0, &id)?,
        conversation_id: parse_uuid(1, &conversation_id)?,
        sender_id: parse_uuid(2, &sender_id)?,
        sender_username: row.get(3)?,
        content: row.get(4)?,
        message_type,
        media_url: row.get(6)?,
        file_name: row.get(7)?,
        file_size: row.get(8)?,
        is_read: row.get(9)?,
        read_by: Vec::new(),
        is_edited: row.get(10)?,
        edited_at: parse_opt_ts(11, row.get(11)?)?,
        is_deleted: row.get(12)?,
        deleted_at: parse_opt_ts(13, row.get(13)?)?,
        reply_to: parse_opt_uuid(14, row.get(14)?)?,
        created_at: parse_ts(15, &created_at)?,
    })
}
