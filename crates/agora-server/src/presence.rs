//! Process-local registry of who is online.
//!
//! A user is online while they hold at least one live socket. Nothing here
//! is persisted; a restart starts with everyone offline.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnlineUser {
    pub user_id: Uuid,
    pub username: String,
}

#[derive(Debug)]
struct Entry {
    username: String,
    connections: usize,
}

#[derive(Clone, Default)]
pub struct Presence {
    users: Arc<RwLock<HashMap<Uuid, Entry>>>,
}

impl Presence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection. Returns `true` if the user just came online.
    pub async fn connect(&self, user_id: Uuid, username: &str) -> bool {
        let mut users = self.users.write().await;
        let entry = users.entry(user_id).or_insert_with(|| Entry {
            username: username.to_string(),
            connections: 0,
        });
        entry.username = username.to_string();
        entry.connections += 1;
        entry.connections == 1
    }

    /// Drop a connection. Returns `true` if that was the user's last one.
    pub async fn disconnect(&self, user_id: Uuid) -> bool {
        let mut users = self.users.write().await;
        let Some(entry) = users.get_mut(&user_id) else {
            return false;
        };
        entry.connections = entry.connections.saturating_sub(1);
        if entry.connections == 0 {
            users.remove(&user_id);
            true
        } else {
            false
        }
    }

    pub async fn is_online(&self, user_id: Uuid) -> bool {
        self.users.read().await.contains_key(&user_id)
    }

    pub async fn online_count(&self) -> usize {
        self.users.read().await.len()
    }

    /// Everyone online, ordered by username then id.
    pub async fn snapshot(&self) -> Vec<OnlineUser> {
        let users = self.users.read().await;
        let mut online: Vec<OnlineUser> = users
            .iter()
            .map(|(id, entry)| OnlineUser {
                user_id: *id,
                username: entry.username.clone(),
            })
            .collect();
        online.sort_by(|a, b| {
            a.username
                .to_lowercase()
                .cmp(&b.username.to_lowercase())
                .then(a.user_id.cmp(&b.user_id))
        });
        online
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multiple_connections_keep_user_online() {
        let presence = Presence::new();
        let alice = Uuid::new_v4();

        assert!(presence.connect(alice, "alice").await);
        assert!(!presence.connect(alice, "alice").await);

        assert!(!presence.disconnect(alice).await);
        assert!(presence.is_online(alice).await);

        assert!(presence.disconnect(alice).await);
        assert!(!presence.is_online(alice).await);
        assert!(!presence.disconnect(alice).await);
    }

    #[tokio::test]
    async fn snapshot_is_sorted() {
        let presence = Presence::new();
        presence.connect(Uuid::new_v4(), "carol").await;
        presence.connect(Uuid::new_v4(), "Alice").await;
        presence.connect(Uuid::new_v4(), "bob").await;

        let names: Vec<_> = presence
            .snapshot()
            .await
            .into_iter()
            .map(|u| u.username)
            .collect();
        assert_eq!(names, vec!["Alice", "bob", "carol"]);
        assert_eq!(presence.online_count().await, 3);
    }
}
