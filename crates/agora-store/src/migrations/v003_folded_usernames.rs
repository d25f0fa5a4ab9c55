use rusqlite::{params, Connection};

// SQLite's NOCASE and lower() only fold ASCII, so lookups and search go
// through columns lowercased in Rust.
const UP_SQL: &str = r#"
ALTER TABLE users ADD COLUMN username_lower TEXT NOT NULL DEFAULT '';
ALTER TABLE users ADD COLUMN display_name_lower TEXT;

CREATE INDEX IF NOT EXISTS idx_users_username_lower ON users(username_lower);
"#;

pub fn up(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(UP_SQL)?;

    let rows = {
        let mut stmt = conn.prepare("SELECT id, username, display_name FROM users")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;
        rows.collect::<Result<Vec<_>, _>>()?
    };

    for (id, username, display_name) in rows {
        conn.execute(
            "UPDATE users SET username_lower = ?2, display_name_lower = ?3 WHERE id = ?1",
            params![id, username.to_lowercase(), display_name.map(|d| d.to_lowercase())],
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::{v001_initial, v002_read_receipts};

    #[test]
    fn backfills_folded_columns() {
        let conn = Connection::open_in_memory().unwrap();
        v001_initial::up(&conn).unwrap();
        v002_read_receipts::up(&conn).unwrap();
        conn.execute(
            "INSERT INTO users (id, username, display_name, created_at)
             VALUES ('u1', 'Ørsted', 'Hans ØRSTED', '2024-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();

        up(&conn).unwrap();

        let (username, display): (String, Option<String>) = conn
            .query_row(
                "SELECT username_lower, display_name_lower FROM users WHERE id = 'u1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(username, "ørsted");
        assert_eq!(display.as_deref(), Some("hans ørsted"));
    }
}
