//! v001 -- Initial schema creation.
//!
//! Creates the user directory mirror, the block registry, conversations with
//! their denormalized unread/archive side tables, and messages.

use rusqlite::Connection;

/// SQL executed when upgrading from version 0 to version 1.
const UP_SQL: &str = r#"
-- ----------------------------------------------------------------
-- Users (mirror of the external user directory)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS users (
    id           TEXT PRIMARY KEY NOT NULL,   -- UUID
    username     TEXT NOT NULL UNIQUE COLLATE NOCASE,
    display_name TEXT,
    avatar_url   TEXT,
    created_at   TEXT NOT NULL                -- RFC-3339, microseconds, UTC
);

-- ----------------------------------------------------------------
-- Blocks (directional, one row per ordered pair)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS blocks (
    id               TEXT PRIMARY KEY NOT NULL,
    blocker_id       TEXT NOT NULL,
    blocked_id       TEXT NOT NULL,
    blocker_username TEXT NOT NULL,
    blocked_username TEXT NOT NULL,
    reason           TEXT NOT NULL DEFAULT '',
    is_active        INTEGER NOT NULL DEFAULT 1,  -- boolean 0/1
    unblocked_at     TEXT,
    created_at       TEXT NOT NULL,

    UNIQUE (blocker_id, blocked_id)
);

CREATE INDEX IF NOT EXISTS idx_blocks_blocked ON blocks(blocked_id, is_active);

-- ----------------------------------------------------------------
-- Conversations (exactly two participants)
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS conversations (
    id              TEXT PRIMARY KEY NOT NULL,
    participant_a   TEXT NOT NULL,
    participant_b   TEXT NOT NULL,
    username_a      TEXT NOT NULL,
    username_b      TEXT NOT NULL,
    pair_key        TEXT NOT NULL UNIQUE,      -- sorted "low:high" participant ids
    last_message_id TEXT,
    last_message_at TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_conversations_a ON conversations(participant_a, last_message_at DESC);
CREATE INDEX IF NOT EXISTS idx_conversations_b ON conversations(participant_b, last_message_at DESC);

CREATE TABLE IF NOT EXISTS conversation_unread (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    count           INTEGER NOT NULL DEFAULT 0,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS conversation_archives (
    conversation_id TEXT NOT NULL,
    user_id         TEXT NOT NULL,
    archived_at     TEXT NOT NULL,

    PRIMARY KEY (conversation_id, user_id),
    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

-- ----------------------------------------------------------------
-- Messages
-- ----------------------------------------------------------------
CREATE TABLE IF NOT EXISTS messages (
    id              TEXT PRIMARY KEY NOT NULL,
    conversation_id TEXT NOT NULL,
    sender_id       TEXT NOT NULL,
    sender_username TEXT NOT NULL,
    content         TEXT NOT NULL,
    message_type    TEXT NOT NULL DEFAULT 'text',
    media_url       TEXT,
    file_name       TEXT,
    file_size       INTEGER,
    is_read         INTEGER NOT NULL DEFAULT 0,
    is_deleted      INTEGER NOT NULL DEFAULT 0,
    deleted_at      TEXT,
    reply_to        TEXT,
    created_at      TEXT NOT NULL,

    FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation_ts
    ON messages(conversation_id, created_at DESC);
"#;

/// Apply the initial migration.
pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
