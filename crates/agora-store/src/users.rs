//! Local mirror of the external user directory.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::User;
use crate::sql::{escape_like, fmt_ts, now, parse_ts, parse_uuid};

const USER_COLUMNS: &str = "id, username, display_name, avatar_url, created_at";

/// Username given to a mirror row whose name was taken by another user.
const STALE_USERNAME_PREFIX: &str = "former-user-";

impl Database {
    /// Insert or refresh a directory entry. `created_at` of an existing row is
    /// preserved.
    pub fn upsert_user(
        &self,
        id: Uuid,
        username: &str,
        display_name: Option<&str>,
        avatar_url: Option<&str>,
    ) -> Result<User> {
        let tx = self.conn().unchecked_transaction()?;
        release_username_on(&tx, id, username)?;
        tx.execute(
            "INSERT INTO users (id, username, username_lower, display_name,
                                display_name_lower, avatar_url, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                 username = excluded.username,
                 username_lower = excluded.username_lower,
                 display_name = COALESCE(excluded.display_name, users.display_name),
                 display_name_lower = COALESCE(excluded.display_name_lower, users.display_name_lower),
                 avatar_url = COALESCE(excluded.avatar_url, users.avatar_url)",
            params![
                id.to_string(),
                username,
                username.to_lowercase(),
                display_name,
                display_name.map(str::to_lowercase),
                avatar_url,
                fmt_ts(&now()),
            ],
        )?;
        tx.commit()?;
        self.get_user(id)
    }

    /// Make sure a user from a verified session exists, without touching the
    /// profile fields of an existing row. The session wins over any stale row
    /// still holding the same username.
    pub fn ensure_user(&self, id: Uuid, username: &str) -> Result<()> {
        let tx = self.conn().unchecked_transaction()?;
        release_username_on(&tx, id, username)?;
        tx.execute(
            "INSERT INTO users (id, username, username_lower, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 username = excluded.username,
                 username_lower = excluded.username_lower
             WHERE users.username <> excluded.username",
            params![id.to_string(), username, username.to_lowercase(), fmt_ts(&now())],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_user(&self, id: Uuid) -> Result<User> {
        self.conn()
            .query_row(
                &format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
                params![id.to_string()],
                row_to_user,
            )
            .optional()?
            .ok_or(StoreError::NotFound("User"))
    }

    /// Resolve a username (case-insensitive) to a user.
    pub fn find_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = self
            .conn()
            .query_row(
                &format!(
                    "SELECT {USER_COLUMNS} FROM users WHERE username_lower = ?1
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![username.trim().to_lowercase()],
                row_to_user,
            )
            .optional()?;
        Ok(user)
    }

    /// Case-insensitive substring search over username and display name.
    ///
    /// Excludes `requester` and every user with an active block in either
    /// direction with `requester`.
    pub fn search_users(&self, requester: Uuid, query: &str, limit: u32) -> Result<Vec<User>> {
        let pattern = format!("%{}%", escape_like(&query.trim().to_lowercase()));

        let mut stmt = self.conn().prepare(&format!(
            "SELECT {USER_COLUMNS}
             FROM users u
             WHERE u.id <> ?1
               AND (u.username_lower LIKE ?2 ESCAPE '\\'
                    OR COALESCE(u.display_name_lower, '') LIKE ?2 ESCAPE '\\')
               AND NOT EXISTS (
                   SELECT 1 FROM blocks b
                   WHERE b.is_active = 1
                     AND ((b.blocker_id = ?1 AND b.blocked_id = u.id)
                       OR (b.blocker_id = u.id AND b.blocked_id = ?1))
               )
             ORDER BY u.username_lower ASC
             LIMIT ?3"
        ))?;

        let rows = stmt.query_map(
            params![requester.to_string(), pattern, i64::from(limit)],
            row_to_user,
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StoreError::Sqlite)
    }
}

/// Rename any other row holding `username` to a placeholder so the caller
/// can take the name. Happens when a user was renamed upstream and someone
/// else picked up the old name before our mirror caught up.
fn release_username_on(conn: &Connection, owner: Uuid, username: &str) -> Result<()> {
    let stale = {
        let mut stmt = conn.prepare(
            "SELECT id FROM users
             WHERE id <> ?1 AND (username_lower = ?2 OR username = ?3 COLLATE NOCASE)",
        )?;
        let rows = stmt.query_map(
            params![owner.to_string(), username.to_lowercase(), username],
            |row| row.get::<_, String>(0),
        )?;
        rows.collect::<std::result::Result<Vec<_>, _>>()?
    };

    for id in stale {
        let placeholder = format!("{STALE_USERNAME_PREFIX}{id}");
        warn!(user = %id, username, "Releasing username held by a stale directory entry");
        conn.execute(
            "UPDATE users SET username = ?2, username_lower = ?2 WHERE id = ?1",
            params![id, placeholder],
        )?;
    }
    Ok(())
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    let id: String = row.get(0)?;
    let created_at: String = row.get(4)?;

    Ok(User {
        id: parse_uuid(0, &id)?,
        username: row.get(1)?,
        display_name: row.get(2)?,
        avatar_url: row.get(3)?,
        created_at: parse_ts(4, &created_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn db() -> Database {
        Database::open_in_memory().unwrap()
    }

    #[test]
    fn upsert_and_lookup_case_insensitive() {
        let db = db();
        let id = Uuid::new_v4();
        db.upsert_user(id, "Alice", Some("Alice Liddell"), None).unwrap();

        let found = db.find_user_by_username("alice").unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.display_name.as_deref(), Some("Alice Liddell"));
        assert!(db.find_user_by_username("nobody").unwrap().is_none());
    }

    #[test]
    fn upsert_keeps_profile_fields_when_absent() {
        let db = db();
        let id = Uuid::new_v4();
        let first = db
            .upsert_user(id, "alice", Some("Alice"), Some("https://cdn/a.png"))
            .unwrap();
        let second = db.upsert_user(id, "alice2", None, None).unwrap();

        assert_eq!(second.username, "alice2");
        assert_eq!(second.display_name.as_deref(), Some("Alice"));
        assert_eq!(second.avatar_url.as_deref(), Some("https://cdn/a.png"));
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn ensure_user_does_not_clobber_profile() {
        let db = db();
        let id = Uuid::new_v4();
        db.upsert_user(id, "carol", Some("Carol"), None).unwrap();
        db.ensure_user(id, "carol").unwrap();
        assert_eq!(db.get_user(id).unwrap().display_name.as_deref(), Some("Carol"));

        let fresh = Uuid::new_v4();
        db.ensure_user(fresh, "dave").unwrap();
        assert_eq!(db.get_user(fresh).unwrap().username, "dave");
    }

    #[test]
    fn search_excludes_self_and_blocked_both_directions() {
        let db = db();
        let me = db.upsert_user(Uuid::new_v4(), "debater", None, None).unwrap();
        let friend = db.upsert_user(Uuid::new_v4(), "debate_fan", None, None).unwrap();
        let blocked = db.upsert_user(Uuid::new_v4(), "debate_troll", None, None).unwrap();
        let blocker = db.upsert_user(Uuid::new_v4(), "debate_grump", None, None).unwrap();
        db.upsert_user(Uuid::new_v4(), "unrelated", Some("Someone Else"), None)
            .unwrap();

        db.block(me.id, blocked.id, "").unwrap();
        db.block(blocker.id, me.id, "").unwrap();

        let results = db.search_users(me.id, "DEBATE", 10).unwrap();
        let names: Vec<_> = results.iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, vec!["debate_fan"]);
        assert_eq!(results[0].id, friend.id);
    }

    #[test]
    fn search_matches_display_name_and_honors_limit() {
        let db = db();
        let me = Uuid::new_v4();
        for i in 0..5 {
            db.upsert_user(Uuid::new_v4(), &format!("user{i}"), Some("Socrates Fan"), None)
                .unwrap();
        }
        assert_eq!(db.search_users(me, "socrates", 3).unwrap().len(), 3);
    }

    #[test]
    fn search_treats_wildcards_literally() {
        let db = db();
        let me = Uuid::new_v4();
        db.upsert_user(Uuid::new_v4(), "percent", None, None).unwrap();
        assert!(db.search_users(me, "%%", 10).unwrap().is_empty());
    }

    #[test]
    fn lookup_and_search_fold_non_ascii_case() {
        let db = db();
        let me = Uuid::new_v4();
        let emile = db
            .upsert_user(Uuid::new_v4(), "Émile", Some("Émile Zola"), None)
            .unwrap();

        let found = db.find_user_by_username("émile").unwrap().unwrap();
        assert_eq!(found.id, emile.id);
        assert_eq!(found.username, "Émile");

        let hits = db.search_users(me, "émile", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(db.search_users(me, "ZOLA", 10).unwrap().len(), 1);
    }

    #[test]
    fn session_username_wins_over_stale_row() {
        let db = db();
        let old_bob = db.upsert_user(Uuid::new_v4(), "bob", Some("Old Bob"), None).unwrap();
        let new_bob = Uuid::new_v4();

        db.ensure_user(new_bob, "Bob").unwrap();

        let found = db.find_user_by_username("bob").unwrap().unwrap();
        assert_eq!(found.id, new_bob);
        assert_eq!(found.username, "Bob");

        let stale = db.get_user(old_bob.id).unwrap();
        assert_eq!(stale.username, format!("{STALE_USERNAME_PREFIX}{}", old_bob.id));
        assert_eq!(stale.display_name.as_deref(), Some("Old Bob"));
    }

    #[test]
    fn directory_upsert_takes_name_from_stale_row() {
        let db = db();
        let first = db.upsert_user(Uuid::new_v4(), "Ève", None, None).unwrap();
        let second = db.upsert_user(Uuid::new_v4(), "ève", None, None).unwrap();

        assert_eq!(db.find_user_by_username("ÈVE").unwrap().unwrap().id, second.id);
        assert_ne!(db.get_user(first.id).unwrap().username, "Ève");

        // Re-asserting the current name is a no-op.
        db.ensure_user(second.id, "ève").unwrap();
        assert_eq!(db.get_user(second.id).unwrap().username, "ève");
    }
}
