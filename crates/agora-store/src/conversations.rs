//! Conversation store.
//!
//! One row per unordered participant pair, enforced by the unique `pair_key`
//! column. `last_message_*` and the `conversation_unread` rows are a cache
//! maintained by the message write path; [`Database::repair_conversation`]
//! rebuilds them from the messages table.

use std::collections::{BTreeMap, BTreeSet};

use agora_shared::types::PageRequest;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::messages::message_on;
use crate::models::{Conversation, Message, Page, UnreadSummary, User};
use crate::sql::{fmt_ts, is_unique_violation, now, pair_key, parse_opt_uuid, parse_ts, parse_uuid};

const CONVERSATION_COLUMNS: &str = "id, participant_a, participant_b, username_a, username_b, \
                                    last_message_id, last_message_at, created_at, updated_at";

impl Database {
    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// The conversation between two users, in either order.
    pub fn find_conversation_between(&self, a: Uuid, b: Uuid) -> Result<Option<Conversation>> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE pair_key = ?1"),
                params![pair_key(a, b)],
                row_to_conversation,
            )
            .optional()?;
        row.map(|c| hydrate(self.conn(), c)).transpose()
    }

    pub fn get_conversation(&self, id: Uuid) -> Result<Conversation> {
        conversation_on(self.conn(), id)?.ok_or(StoreError::NotFound("Conversation"))
    }

    /// Inbox of `user_id`: conversations they did not archive, most recent
    /// activity first, ties broken by conversation id.
    pub fn list_conversations_for_user(
        &self,
        user_id: Uuid,
        request: PageRequest,
    ) -> Result<Page<Conversation>> {
        let user = user_id.to_string();

        let total: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM conversations c
             WHERE (c.participant_a = ?1 OR c.participant_b = ?1)
               AND NOT EXISTS (SELECT 1 FROM conversation_archives ar
                               WHERE ar.conversation_id = c.id AND ar.user_id = ?1)",
            params![user],
            |row| row.get(0),
        )?;

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations c
             WHERE (c.participant_a = ?1 OR c.participant_b = ?1)
               AND NOT EXISTS (SELECT 1 FROM conversation_archives ar
                               WHERE ar.conversation_id = c.id AND ar.user_id = ?1)
             ORDER BY c.last_message_at DESC, c.id ASC
             LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![user, i64::from(request.limit), request.offset() as i64],
            row_to_conversation,
        )?;

        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(hydrate(self.conn(), row?)?);
        }

        let total = total.max(0) as u64;
        let has_more = request.offset() + (conversations.len() as u64) < total;
        Ok(Page::new(conversations, request, has_more, Some(total)))
    }

    /// Sum of unread counters of `user_id` across all their conversations.
    pub fn unread_summary(&self, user_id: Uuid) -> Result<UnreadSummary> {
        let mut stmt = self.conn().prepare(
            "SELECT conversation_id, count FROM conversation_unread
             WHERE user_id = ?1 AND count > 0",
        )?;
        let rows = stmt.query_map(params![user_id.to_string()], |row| {
            let id: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            Ok((parse_uuid(0, &id)?, count.max(0) as u32))
        })?;

        let mut summary = UnreadSummary::default();
        for row in rows {
            let (conversation_id, count) = row?;
            summary.total += u64::from(count);
            summary.by_conversation.insert(conversation_id, count);
        }
        Ok(summary)
    }

    // ------------------------------------------------------------------
    // Write
    // ------------------------------------------------------------------

    /// Return the conversation between `a` and `b`, creating it if needed.
    ///
    /// Creation races are settled by the unique `pair_key`: the loser of an
    /// insert race gets a constraint violation and re-reads the winner's row.
    /// The boolean is `true` when this call created the conversation.
    pub fn get_or_create_conversation(&self, a: &User, b: &User) -> Result<(Conversation, bool)> {
        if a.id == b.id {
            return Err(StoreError::validation(
                "Cannot start a conversation with yourself",
            ));
        }

        if let Some(existing) = self.find_conversation_between(a.id, b.id)? {
            return Ok((existing, false));
        }

        let id = Uuid::new_v4();
        let created_at = fmt_ts(&now());
        let inserted = self.conn().execute(
            "INSERT INTO conversations (id, participant_a, participant_b, username_a, username_b,
                                        pair_key, last_message_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7, ?7)",
            params![
                id.to_string(),
                a.id.to_string(),
                b.id.to_string(),
                a.username,
                b.username,
                pair_key(a.id, b.id),
                created_at,
            ],
        );

        match inserted {
            Ok(_) => {
                tracing::debug!(conversation = %id, a = %a.id, b = %b.id, "conversation created");
                Ok((self.get_conversation(id)?, true))
            }
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!(a = %a.id, b = %b.id, "conversation insert lost race, re-reading");
                let existing = self
                    .find_conversation_between(a.id, b.id)?
                    .ok_or(StoreError::NotFound("Conversation"))?;
                Ok((existing, false))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Point the conversation at `message` and bump the unread counter of
    /// every participant other than the sender.
    pub fn record_new_message(&self, message: &Message) -> Result<()> {
        record_new_message_on(self.conn(), message)
    }

    pub fn reset_unread(&self, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
        reset_unread_on(self.conn(), conversation_id, user_id)
    }

    /// Add or remove `user_id` from the conversation's `archived_by` set.
    /// Idempotent in both directions.
    pub fn set_archived(&self, conversation_id: Uuid, user_id: Uuid, archived: bool) -> Result<()> {
        if archived {
            self.conn().execute(
                "INSERT OR IGNORE INTO conversation_archives (conversation_id, user_id, archived_at)
                 VALUES (?1, ?2, ?3)",
                params![conversation_id.to_string(), user_id.to_string(), fmt_ts(&now())],
            )?;
        } else {
            self.conn().execute(
                "DELETE FROM conversation_archives WHERE conversation_id = ?1 AND user_id = ?2",
                params![conversation_id.to_string(), user_id.to_string()],
            )?;
        }
        Ok(())
    }

    /// Rebuild `last_message`, `last_message_at` and the unread counters from
    /// the messages table.
    pub fn repair_conversation(&mut self, conversation_id: Uuid) -> Result<Conversation> {
        let conversation = self.get_conversation(conversation_id)?;
        let id = conversation_id.to_string();

        let tx = self.conn_mut().transaction()?;

        let latest: Option<(String, String)> = tx
            .query_row(
                "SELECT id, created_at FROM messages WHERE conversation_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (last_id, last_at) = match latest {
            Some((message_id, created_at)) => (Some(message_id), created_at),
            None => (None, fmt_ts(&conversation.created_at)),
        };
        tx.execute(
            "UPDATE conversations SET last_message_id = ?2, last_message_at = ?3 WHERE id = ?1",
            params![id, last_id, last_at],
        )?;

        tx.execute(
            "DELETE FROM conversation_unread WHERE conversation_id = ?1",
            params![id],
        )?;
        for participant in conversation.participants {
            tx.execute(
                "INSERT INTO conversation_unread (conversation_id, user_id, count)
                 SELECT ?1, ?2, COUNT(*) FROM messages
                 WHERE conversation_id = ?1 AND sender_id <> ?2 AND is_read = 0
                 HAVING COUNT(*) > 0",
                params![id, participant.to_string()],
            )?;
        }

        tx.commit()?;

        tracing::info!(conversation = %conversation_id, "conversation summary rebuilt");
        self.get_conversation(conversation_id)
    }
}

// ---------------------------------------------------------------------------
// Connection-level helpers (usable inside a transaction)
// ---------------------------------------------------------------------------

pub(crate) fn conversation_on(conn: &Connection, id: Uuid) -> Result<Option<Conversation>> {
    let row = conn
        .query_row(
            &format!("SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = ?1"),
            params![id.to_string()],
            row_to_conversation,
        )
        .optional()?;
    row.map(|c| hydrate(conn, c)).transpose()
}

pub(crate) fn record_new_message_on(conn: &Connection, message: &Message) -> Result<()> {
    let id = message.conversation_id.to_string();
    let at = fmt_ts(&message.created_at);

    let updated = conn.execute(
        "UPDATE conversations SET last_message_id = ?2, last_message_at = ?3, updated_at = ?3
         WHERE id = ?1",
        params![id, message.id.to_string(), at],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound("Conversation"));
    }

    let (a, b): (String, String) = conn.query_row(
        "SELECT participant_a, participant_b FROM conversations WHERE id = ?1",
        params![id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let sender = message.sender_id.to_string();
    for participant in [a, b].into_iter().filter(|p| *p != sender) {
        conn.execute(
            "INSERT INTO conversation_unread (conversation_id, user_id, count)
             VALUES (?1, ?2, 1)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET count = count + 1",
            params![id, participant],
        )?;
    }
    Ok(())
}

pub(crate) fn reset_unread_on(conn: &Connection, conversation_id: Uuid, user_id: Uuid) -> Result<()> {
    conn.execute(
        "INSERT INTO conversation_unread (conversation_id, user_id, count)
         VALUES (?1, ?2, 0)
         ON CONFLICT(conversation_id, user_id) DO UPDATE SET count = 0",
        params![conversation_id.to_string(), user_id.to_string()],
    )?;
    Ok(())
}

/// Conversation row before the side tables are attached.
struct ConversationRow {
    conversation: Conversation,
    last_message_id: Option<Uuid>,
}

fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationRow> {
    let id: String = row.get(0)?;
    let a: String = row.get(1)?;
    let b: String = row.get(2)?;
    let last_message_at: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(ConversationRow {
        conversation: Conversation {
            id: parse_uuid(0, &id)?,
            participants: [parse_uuid(1, &a)?, parse_uuid(2, &b)?],
            participant_usernames: [row.get(3)?, row.get(4)?],
            last_message: None,
            last_message_at: Some(parse_ts(6, &last_message_at)?),
            unread_counts: BTreeMap::new(),
            archived_by: BTreeSet::new(),
            created_at: parse_ts(7, &created_at)?,
            updated_at: parse_ts(8, &updated_at)?,
        },
        last_message_id: parse_opt_uuid(5, row.get(5)?)?,
    })
}

fn hydrate(conn: &Connection, row: ConversationRow) -> Result<Conversation> {
    let ConversationRow {
        mut conversation,
        last_message_id,
    } = row;
    let id = conversation.id.to_string();

    let mut stmt = conn.prepare(
        "SELECT user_id, count FROM conversation_unread WHERE conversation_id = ?1",
    )?;
    let unread = stmt.query_map(params![id], |row| {
        let user: String = row.get(0)?;
        let count: i64 = row.get(1)?;
        Ok((parse_uuid(0, &user)?, count.max(0) as u32))
    })?;
    for entry in unread {
        let (user, count) = entry?;
        conversation.unread_counts.insert(user, count);
    }

    let mut stmt =
        conn.prepare("SELECT user_id FROM conversation_archives WHERE conversation_id = ?1")?;
    let archived = stmt.query_map(params![id], |row| {
        let user: String = row.get(0)?;
        parse_uuid(0, &user)
    })?;
    for user in archived {
        conversation.archived_by.insert(user?);
    }

    if let Some(message_id) = last_message_id {
        conversation.last_message = message_on(conn, message_id)?;
    }

    Ok(conversation)
}
