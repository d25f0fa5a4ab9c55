//! Realtime gateway: socket connections, rooms and fan-out.
//!
//! Every connection gets a bounded outbound queue. Fan-out uses `try_send`,
//! so a slow consumer loses events instead of stalling the sender. Rooms
//! are process-local.

pub mod events;
pub mod socket;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use agora_shared::types::Room;
use tokio::sync::{mpsc, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info};
use uuid::Uuid;

use self::events::ServerEvent;

pub use socket::ws_handler;

/// Outbound queue depth per connection.
const CONNECTION_QUEUE: usize = 256;

pub type ConnectionId = u64;

struct Connection {
    user_id: Uuid,
    tx: mpsc::Sender<ServerEvent>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct HubState {
    connections: HashMap<ConnectionId, Connection>,
    rooms: HashMap<Room, HashSet<ConnectionId>>,
}

impl HubState {
    fn join(&mut self, conn_id: ConnectionId, room: Room) -> bool {
        let Some(conn) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        conn.rooms.insert(room);
        self.rooms.entry(room).or_default().insert(conn_id)
    }

    fn leave(&mut self, conn_id: ConnectionId, room: &Room) -> bool {
        if let Some(conn) = self.connections.get_mut(&conn_id) {
            conn.rooms.remove(room);
        }
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let removed = members.remove(&conn_id);
        if members.is_empty() {
            self.rooms.remove(room);
        }
        removed
    }

    fn deliver(&self, conn_id: ConnectionId, event: &ServerEvent) {
        let Some(conn) = self.connections.get(&conn_id) else {
            return;
        };
        if conn.tx.try_send(event.clone()).is_err() {
            debug!(
                conn = conn_id,
                user = %conn.user_id,
                event = event.name(),
                "Dropping event for slow connection"
            );
        }
    }
}

/// Connection and room registry shared by all sockets and the messaging
/// service.
#[derive(Clone)]
pub struct Hub {
    state: Arc<RwLock<HubState>>,
    next_id: Arc<AtomicU64>,
    slots: Arc<Semaphore>,
}

impl Hub {
    pub fn new(max_connections: usize) -> Self {
        Self {
            state: Arc::new(RwLock::new(HubState::default())),
            next_id: Arc::new(AtomicU64::new(1)),
            slots: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Reserve a connection slot, or `None` when the server is full.
    pub fn try_reserve(&self) -> Option<OwnedSemaphorePermit> {
        Arc::clone(&self.slots).try_acquire_owned().ok()
    }

    /// Register a connection and join it to the user's personal room.
    pub async fn register(&self, user_id: Uuid) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
        let conn_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);

        let mut state = self.state.write().await;
        state.connections.insert(
            conn_id,
            Connection {
                user_id,
                tx,
                rooms: HashSet::new(),
            },
        );
        state.join(conn_id, Room::User(user_id));

        info!(
            conn = conn_id,
            user = %user_id,
            connections = state.connections.len(),
            "Connection registered"
        );
        (conn_id, rx)
    }

    /// Remove a connection from every room it joined.
    pub async fn unregister(&self, conn_id: ConnectionId) {
        let mut state = self.state.write().await;
        let Some(conn) = state.connections.get(&conn_id) else {
            return;
        };
        let rooms: Vec<Room> = conn.rooms.iter().copied().collect();
        let user_id = conn.user_id;
        for room in &rooms {
            state.leave(conn_id, room);
        }
        state.connections.remove(&conn_id);

        info!(
            conn = conn_id,
            user = %user_id,
            connections = state.connections.len(),
            "Connection unregistered"
        );
    }

    pub async fn join(&self, conn_id: ConnectionId, room: Room) -> bool {
        let joined = self.state.write().await.join(conn_id, room);
        if joined {
            debug!(conn = conn_id, room = %room, "Joined room");
        }
        joined
    }

    pub async fn leave(&self, conn_id: ConnectionId, room: Room) -> bool {
        let left = self.state.write().await.leave(conn_id, &room);
        if left {
            debug!(conn = conn_id, room = %room, "Left room");
        }
        left
    }

    pub async fn is_member(&self, conn_id: ConnectionId, room: Room) -> bool {
        self.state
            .read()
            .await
            .rooms
            .get(&room)
            .is_some_and(|members| members.contains(&conn_id))
    }

    /// Send to every connection in `room`, optionally skipping one.
    pub async fn emit_to_room(&self, room: Room, event: ServerEvent, except: Option<ConnectionId>) {
        let state = self.state.read().await;
        let Some(members) = state.rooms.get(&room) else {
            return;
        };
        for conn_id in members {
            if Some(*conn_id) != except {
                state.deliver(*conn_id, &event);
            }
        }
    }

    pub async fn emit_to_connection(&self, conn_id: ConnectionId, event: ServerEvent) {
        self.state.read().await.deliver(conn_id, &event);
    }

    pub async fn broadcast(&self, event: ServerEvent) {
        let state = self.state.read().await;
        for conn_id in state.connections.keys() {
            state.deliver(*conn_id, &event);
        }
    }

    pub async fn connection_count(&self) -> usize {
        self.state.read().await.connections.len()
    }

    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    pub async fn room_size(&self, room: Room) -> usize {
        self.state
            .read()
            .await
            .rooms
            .get(&room)
            .map(HashSet::len)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing(conversation_id: Uuid) -> ServerEvent {
        ServerEvent::UserTyping {
            conversation_id,
            user_id: Uuid::new_v4(),
            username: "alice".into(),
        }
    }

    #[tokio::test]
    async fn register_joins_personal_room_and_unregister_cleans_up() {
        let hub = Hub::new(8);
        let alice = Uuid::new_v4();
        let conversation = Room::Conversation(Uuid::new_v4());

        let (conn, _rx) = hub.register(alice).await;
        assert!(hub.is_member(conn, Room::User(alice)).await);

        assert!(hub.join(conn, conversation).await);
        assert!(!hub.join(conn, conversation).await);
        assert_eq!(hub.room_size(conversation).await, 1);

        hub.unregister(conn).await;
        assert_eq!(hub.connection_count().await, 0);
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn room_fan_out_respects_membership_and_except() {
        let hub = Hub::new(8);
        let conversation_id = Uuid::new_v4();
        let room = Room::Conversation(conversation_id);

        let (a, mut a_rx) = hub.register(Uuid::new_v4()).await;
        let (b, mut b_rx) = hub.register(Uuid::new_v4()).await;
        let (_c, mut c_rx) = hub.register(Uuid::new_v4()).await;
        hub.join(a, room).await;
        hub.join(b, room).await;

        hub.emit_to_room(room, typing(conversation_id), Some(a)).await;

        assert!(a_rx.try_recv().is_err());
        assert_eq!(b_rx.try_recv().unwrap().name(), "user_typing");
        assert!(c_rx.try_recv().is_err());

        hub.leave(b, room).await;
        hub.emit_to_room(room, typing(conversation_id), None).await;
        assert!(b_rx.try_recv().is_err());
        assert!(a_rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn personal_room_reaches_every_tab() {
        let hub = Hub::new(8);
        let bob = Uuid::new_v4();
        let (_t1, mut rx1) = hub.register(bob).await;
        let (_t2, mut rx2) = hub.register(bob).await;

        hub.emit_to_room(
            Room::User(bob),
            ServerEvent::UserBlocked {
                blocker_id: Uuid::new_v4(),
                blocker_username: "carol".into(),
            },
            None,
        )
        .await;

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[tokio::test]
    async fn slow_consumer_drops_instead_of_blocking() {
        let hub = Hub::new(8);
        let (conn, mut rx) = hub.register(Uuid::new_v4()).await;

        for _ in 0..CONNECTION_QUEUE + 10 {
            hub.emit_to_connection(conn, typing(Uuid::new_v4())).await;
        }

        let mut received = 0;
        while rx.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, CONNECTION_QUEUE);
    }

    #[tokio::test]
    async fn connection_slots_are_capped() {
        let hub = Hub::new(1);
        let first = hub.try_reserve();
        assert!(first.is_some());
        assert!(hub.try_reserve().is_none());
        drop(first);
        assert!(hub.try_reserve().is_some());
    }
}
