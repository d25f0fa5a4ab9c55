use rusqlite::Connection;

const UP_SQL: &str = r#"
-- Per-reader receipts behind Message.read_by
CREATE TABLE IF NOT EXISTS message_reads (
    message_id TEXT NOT NULL,                 -- FK -> messages(id)
    user_id    TEXT NOT NULL,
    read_at    TEXT NOT NULL,                 -- RFC-3339

    PRIMARY KEY (message_id, user_id),
    FOREIGN KEY (message_id) REFERENCES messages(id) ON DELETE CASCADE
);

-- Editing support
ALTER TABLE messages ADD COLUMN is_edited INTEGER NOT NULL DEFAULT 0;
ALTER TABLE messages ADD COLUMN edited_at TEXT;
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)
}
