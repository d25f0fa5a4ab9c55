//! Block registry: who may not contact whom.
//!
//! Records are directional and unique per ordered `(blocker, blocked)` pair.
//! Re-blocking reactivates the existing row instead of inserting a new one.
//! Nothing here is cached; every messaging operation asks again.

use agora_shared::constants::MAX_BLOCK_REASON_LENGTH;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{Block, BlockStatus};
use crate::sql::{fmt_ts, now, parse_opt_ts, parse_ts, parse_uuid};

const BLOCK_COLUMNS: &str = "id, blocker_id, blocked_id, blocker_username, blocked_username, \
                             reason, is_active, unblocked_at, created_at";

impl Database {
    /// `true` iff an active block exists in exactly this direction.
    pub fn is_blocked(&self, blocker: Uuid, blocked: Uuid) -> Result<bool> {
        is_blocked_on(self.conn(), blocker, blocked)
    }

    /// `true` iff either user has an active block against the other.
    pub fn are_blocked(&self, a: Uuid, b: Uuid) -> Result<bool> {
        let blocked: bool = self.conn().query_row(
            "SELECT EXISTS (
                 SELECT 1 FROM blocks
                 WHERE is_active = 1
                   AND ((blocker_id = ?1 AND blocked_id = ?2)
                     OR (blocker_id = ?2 AND blocked_id = ?1))
             )",
            params![a.to_string(), b.to_string()],
            |row| row.get(0),
        )?;
        Ok(blocked)
    }

    pub fn block_status(&self, me: Uuid, other: Uuid) -> Result<BlockStatus> {
        Ok(BlockStatus {
            is_blocked: self.is_blocked(me, other)?,
            is_blocked_by: self.is_blocked(other, me)?,
        })
    }

    /// Create an active block, or reactivate an inactive one with a new reason.
    pub fn block(&self, blocker: Uuid, blocked: Uuid, reason: &str) -> Result<Block> {
        if blocker == blocked {
            return Err(StoreError::SelfBlock);
        }
        let reason = reason.trim();
        if reason.chars().count() > MAX_BLOCK_REASON_LENGTH {
            return Err(StoreError::validation(format!(
                "Block reason cannot exceed {MAX_BLOCK_REASON_LENGTH} characters"
            )));
        }

        let blocker_user = self.get_user(blocker)?;
        let blocked_user = self.get_user(blocked)?;

        match self.find_block(blocker, blocked)? {
            Some(existing) if existing.is_active => Err(StoreError::AlreadyBlocked),
            Some(existing) => {
                self.conn().execute(
                    "UPDATE blocks
                     SET is_active = 1, unblocked_at = NULL, reason = ?2,
                         blocker_username = ?3, blocked_username = ?4
                     WHERE id = ?1",
                    params![
                        existing.id.to_string(),
                        reason,
                        blocker_user.username,
                        blocked_user.username,
                    ],
                )?;
                tracing::debug!(%blocker, %blocked, "block reactivated");
                self.get_block(existing.id)
            }
            None => {
                let block = Block {
                    id: Uuid::new_v4(),
                    blocker,
                    blocked,
                    blocker_username: blocker_user.username,
                    blocked_username: blocked_user.username,
                    reason: reason.to_string(),
                    is_active: true,
                    unblocked_at: None,
                    created_at: now(),
                };
                self.conn().execute(
                    "INSERT INTO blocks (id, blocker_id, blocked_id, blocker_username,
                                         blocked_username, reason, is_active, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
                    params![
                        block.id.to_string(),
                        blocker.to_string(),
                        blocked.to_string(),
                        block.blocker_username,
                        block.blocked_username,
                        block.reason,
                        fmt_ts(&block.created_at),
                    ],
                )?;
                tracing::debug!(%blocker, %blocked, "block created");
                Ok(block)
            }
        }
    }

    /// Deactivate the active block in this exact direction.
    pub fn unblock(&self, blocker: Uuid, blocked: Uuid) -> Result<Block> {
        let affected = self.conn().execute(
            "UPDATE blocks SET is_active = 0, unblocked_at = ?3
             WHERE blocker_id = ?1 AND blocked_id = ?2 AND is_active = 1",
            params![blocker.to_string(), blocked.to_string(), fmt_ts(&now())],
        )?;
        if affected == 0 {
            return Err(StoreError::NotBlocked);
        }
        self.find_block(blocker, blocked)?
            .ok_or(StoreError::NotFound("Block"))
    }

    /// Active blocks made by `blocker`, most recent first.
    pub fn list_blocked(&self, blocker: Uuid) -> Result<Vec<Block>> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks
             WHERE blocker_id = ?1 AND is_active = 1
             ORDER BY created_at DESC"
        ))?;
        let rows = stmt.query_map(params![blocker.to_string()], row_to_block)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }

    /// The record for this ordered pair, active or not.
    pub fn find_block(&self, blocker: Uuid, blocked: Uuid) -> Result<Option<Block>> {
        let block = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {BLOCK_COLUMNS} FROM blocks WHERE blocker_id = ?1 AND blocked_id = ?2"
                ),
                params![blocker.to_string(), blocked.to_string()],
                row_to_block,
            )
            .optional()?;
        Ok(block)
    }

    fn get_block(&self, id: Uuid) -> Result<Block> {
        self.conn()
            .query_row(
                &format!("SELECT {BLOCK_COLUMNS} FROM blocks WHERE id = ?1"),
                params![id.to_string()],
                row_to_block,
            )
            .optional()?
            .ok_or(StoreError::NotFound("Block"))
    }
}

pub(crate) fn is_blocked_on(conn: &Connection, blocker: Uuid, blocked: Uuid) -> Result<bool> {
    let blocked: bool = conn.query_row(
        "SELECT EXISTS (
             SELECT 1 FROM blocks
             WHERE blocker_id = ?1 AND blocked_id = ?2 AND is_active = 1
         )",
        params![blocker.to_string(), blocked.to_string()],
        |row| row.get(0),
    )?;
    Ok(blocked)
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<Block> {
    let id: String = row.get(0)?;
    let blocker: String = row.get(1)?;
    let blocked: String = row.get(2)?;
    let created_at: String = row.get(8)?;

    Ok(Block {
        id: parse_uuid(0, &id)?,
        blocker: parse_uuid(1, &blocker)?,
        blocked: parse_uuid(2, &blocked)?,
        blocker_username: row.get(3)?,
        blocked_username: row.get(4)?,
        reason: row.get(5)?,
        is_active: row.get(6)?,
        unblocked_at: parse_opt_ts(7, row.get(7)?)?,
        created_at: parse_ts(8, &created_at)?,
    })
}
