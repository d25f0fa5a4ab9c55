//! WebSocket upgrade and per-connection event loop.

use agora_shared::protocol::ClientEvent;
use agora_shared::types::Room;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::ServerEvent;
use super::ConnectionId;
use crate::api::AppState;
use crate::auth::AuthUser;
use crate::error::{ServerError, ServerResult};

/// Authenticates during the handshake: the [`AuthUser`] extractor rejects
/// with 401 before any upgrade happens.
pub async fn ws_handler(
    user: AuthUser,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> ServerResult<Response> {
    let Some(permit) = state.hub.try_reserve() else {
        warn!(user = %user.id, "Rejecting WebSocket, connection limit reached");
        return Err(ServerError::Unavailable(format!(
            "Too many WebSocket connections (max {})",
            state.config.max_ws_connections
        )));
    };

    Ok(ws.on_upgrade(move |socket| run_connection(socket, state, user, permit)))
}

async fn run_connection(
    mut socket: WebSocket,
    state: AppState,
    user: AuthUser,
    _permit: OwnedSemaphorePermit,
) {
    let (conn_id, mut outbound) = on_connect(&state, &user).await;

    loop {
        tokio::select! {
            event = outbound.recv() => {
                let Some(event) = event else { break };
                if !send_event(&mut socket, &event).await {
                    break;
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        handle_text(&state, conn_id, &user, &text).await;
                    }
                    Some(Ok(WsMessage::Ping(data))) => {
                        if socket.send(WsMessage::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(conn = conn_id, error = %e, "WebSocket receive failed");
                        break;
                    }
                }
            }
        }
    }

    on_disconnect(&state, conn_id, &user).await;
}

/// Register a live connection: personal room, presence entry and a fresh
/// `users_online` snapshot for everyone.
pub(crate) async fn on_connect(
    state: &AppState,
    user: &AuthUser,
) -> (ConnectionId, mpsc::Receiver<ServerEvent>) {
    if let Err(e) = state.messenger.ensure_user(user).await {
        warn!(user = %user.id, error = %e, "Could not record session user");
    }

    let (conn_id, outbound) = state.hub.register(user.id).await;
    state.presence.connect(user.id, &user.username).await;
    broadcast_presence(state).await;
    info!(conn = conn_id, user = %user.id, "WebSocket connected");
    (conn_id, outbound)
}

/// Leave every room, drop the presence entry and rebroadcast.
pub(crate) async fn on_disconnect(state: &AppState, conn_id: ConnectionId, user: &AuthUser) {
    state.hub.unregister(conn_id).await;
    state.presence.disconnect(user.id).await;
    broadcast_presence(state).await;
    info!(conn = conn_id, user = %user.id, "WebSocket closed");
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(json) => socket.send(WsMessage::Text(json)).await.is_ok(),
        Err(e) => {
            warn!(event = event.name(), error = %e, "Failed to encode event");
            true
        }
    }
}

async fn broadcast_presence(state: &AppState) {
    let snapshot = state.presence.snapshot().await;
    state.hub.broadcast(ServerEvent::UsersOnline(snapshot)).await;
}

/// Decode one client frame and dispatch it. Failures go back to this
/// connection only, as `message_error`.
async fn handle_text(state: &AppState, conn_id: ConnectionId, user: &AuthUser, text: &str) {
    let event = match ClientEvent::from_json(text) {
        Ok(event) => event,
        Err(e) => {
            let err = ServerError::Validation(format!("Malformed event: {e}"));
            state
                .hub
                .emit_to_connection(conn_id, ServerEvent::error(&err, None))
                .await;
            return;
        }
    };

    let name = event.name();
    if let Err(err) = dispatch(state, conn_id, user, event).await {
        debug!(conn = conn_id, event = name, kind = err.kind(), "Client event failed");
        state
            .hub
            .emit_to_connection(conn_id, ServerEvent::error(&err, Some(name)))
            .await;
    }
}

pub(crate) async fn dispatch(
    state: &AppState,
    conn_id: ConnectionId,
    user: &AuthUser,
    event: ClientEvent,
) -> ServerResult<()> {
    match event {
        ClientEvent::JoinConversation(r) => {
            state.messenger.ensure_participant(user, r.conversation_id).await?;
            state.hub.join(conn_id, Room::Conversation(r.conversation_id)).await;
        }
        ClientEvent::LeaveConversation(r) => {
            state.hub.leave(conn_id, Room::Conversation(r.conversation_id)).await;
        }
        ClientEvent::TypingStart(r) => {
            relay_typing(state, conn_id, user, r.conversation_id, true).await;
        }
        ClientEvent::TypingStop(r) => {
            relay_typing(state, conn_id, user, r.conversation_id, false).await;
        }
        ClientEvent::SendMessage(request) => {
            state.messenger.send_message(user, request).await?;
        }
        ClientEvent::MarkMessagesRead(r) => {
            state.messenger.mark_messages_read(user, r.conversation_id).await?;
        }
    }
    Ok(())
}

/// Typing indicators only flow from connections that joined the room, and
/// never back to the typist.
async fn relay_typing(
    state: &AppState,
    conn_id: ConnectionId,
    user: &AuthUser,
    conversation_id: Uuid,
    typing: bool,
) {
    let room = Room::Conversation(conversation_id);
    if !state.hub.is_member(conn_id, room).await {
        return;
    }

    let event = if typing {
        ServerEvent::UserTyping {
            conversation_id,
            user_id: user.id,
            username: user.username.clone(),
        }
    } else {
        ServerEvent::UserStopTyping {
            conversation_id,
            user_id: user.id,
            username: user.username.clone(),
        }
    };
    state.hub.emit_to_room(room, event, Some(conn_id)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestApp;
    use agora_shared::protocol::{ConversationRef, SendMessageRequest};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use crate::presence::OnlineUser;
    use tower::ServiceExt;

    fn drain(rx: &mut mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn upgrade_without_session_is_unauthorized() {
        let app = TestApp::new().await;
        let response = app
            .router()
            .oneshot(
                Request::get("/ws")
                    .header("connection", "upgrade")
                    .header("upgrade", "websocket")
                    .header("sec-websocket-version", "13")
                    .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn join_requires_participation() {
        let app = TestApp::new().await;
        let alice = app.user("alice").await;
        app.user("bob").await;
        let eve = app.user("eve").await;
        let id = app.conversation(&alice, "bob").await;

        let (eve_conn, _rx) = app.hub.register(eve.id).await;
        let err = dispatch(
            &app.state,
            eve_conn,
            &eve,
            ClientEvent::JoinConversation(ConversationRef { conversation_id: id }),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "forbidden");
        assert!(!app.hub.is_member(eve_conn, Room::Conversation(id)).await);

        let (alice_conn, _rx) = app.hub.register(alice.id).await;
        dispatch(
            &app.state,
            alice_conn,
            &alice,
            ClientEvent::JoinConversation(ConversationRef { conversation_id: id }),
        )
        .await
        .unwrap();
        assert!(app.hub.is_member(alice_conn, Room::Conversation(id)).await);
    }

    #[tokio::test]
    async fn typing_relays_to_other_members_only() {
        let app = TestApp::new().await;
        let alice = app.user("alice").await;
        let bob = app.user("bob").await;
        let id = app.conversation(&alice, "bob").await;
        let join = ClientEvent::JoinConversation(ConversationRef { conversation_id: id });
        let typing = ClientEvent::TypingStart(ConversationRef { conversation_id: id });

        let (alice_conn, mut alice_rx) = app.hub.register(alice.id).await;
        let (bob_conn, mut bob_rx) = app.hub.register(bob.id).await;

        // Not joined yet: nothing is relayed.
        dispatch(&app.state, alice_conn, &alice, typing.clone()).await.unwrap();
        assert!(drain(&mut bob_rx).is_empty());

        dispatch(&app.state, alice_conn, &alice, join.clone()).await.unwrap();
        dispatch(&app.state, bob_conn, &bob, join).await.unwrap();
        dispatch(&app.state, alice_conn, &alice, typing).await.unwrap();

        let events = drain(&mut bob_rx);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0],
            ServerEvent::UserTyping {
                conversation_id: id,
                user_id: alice.id,
                username: "alice".into(),
            }
        );
        assert!(drain(&mut alice_rx).is_empty());

        dispatch(
            &app.state,
            alice_conn,
            &alice,
            ClientEvent::TypingStop(ConversationRef { conversation_id: id }),
        )
        .await
        .unwrap();
        assert_eq!(drain(&mut bob_rx)[0].name(), "user_stop_typing");
    }

    #[tokio::test]
    async fn socket_send_matches_rest_rules() {
        let app = TestApp::new().await;
        let alice = app.user("alice").await;
        let bob = app.user("bob").await;
        let id = app.conversation(&alice, "bob").await;

        let (alice_conn, mut alice_rx) = app.hub.register(alice.id).await;
        let (_bob_conn, mut bob_rx) = app.hub.register(bob.id).await;
        app.hub.join(alice_conn, Room::Conversation(id)).await;

        dispatch(
            &app.state,
            alice_conn,
            &alice,
            ClientEvent::SendMessage(SendMessageRequest::text(id, "via socket")),
        )
        .await
        .unwrap();

        let alice_events = drain(&mut alice_rx);
        assert!(matches!(&alice_events[..], [ServerEvent::NewMessage(m)] if m.content == "via socket"));
        let bob_events = drain(&mut bob_rx);
        assert!(matches!(
            &bob_events[..],
            [ServerEvent::NewMessageNotification { conversation_id, .. }] if *conversation_id == id
        ));

        app.messenger.block_user(&bob, "alice", None).await.unwrap();
        let err = dispatch(
            &app.state,
            alice_conn,
            &alice,
            ClientEvent::SendMessage(SendMessageRequest::text(id, "still there?")),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "forbidden");
    }

    #[tokio::test]
    async fn errors_go_to_originating_connection_only() {
        let app = TestApp::new().await;
        let alice = app.user("alice").await;
        let bob = app.user("bob").await;
        let id = app.conversation(&alice, "bob").await;

        let (alice_conn, mut alice_rx) = app.hub.register(alice.id).await;
        let (bob_conn, mut bob_rx) = app.hub.register(bob.id).await;
        app.hub.join(alice_conn, Room::Conversation(id)).await;
        app.hub.join(bob_conn, Room::Conversation(id)).await;

        let frame = format!(
            r#"{{"event":"send_message","data":{{"conversationId":"{id}","content":"   "}}}}"#
        );
        handle_text(&app.state, alice_conn, &alice, &frame).await;
        handle_text(&app.state, alice_conn, &alice, "not json").await;

        let errors = drain(&mut alice_rx);
        assert_eq!(errors.len(), 2);
        assert!(matches!(
            &errors[0],
            ServerEvent::MessageError { kind, event: Some(event), .. }
                if kind == "validation" && event == "send_message"
        ));
        assert!(matches!(&errors[1], ServerEvent::MessageError { event: None, .. }));
        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn mark_read_event_broadcasts_messages_read() {
        let app = TestApp::new().await;
        let alice = app.user("alice").await;
        let bob = app.user("bob").await;
        let id = app.conversation(&alice, "bob").await;
        app.send(&alice, id, "unread").await;

        let (alice_conn, mut alice_rx) = app.hub.register(alice.id).await;
        let (bob_conn, _bob_rx) = app.hub.register(bob.id).await;
        app.hub.join(alice_conn, Room::Conversation(id)).await;

        dispatch(
            &app.state,
            bob_conn,
            &bob,
            ClientEvent::MarkMessagesRead(ConversationRef { conversation_id: id }),
        )
        .await
        .unwrap();

        assert_eq!(
            drain(&mut alice_rx),
            vec![ServerEvent::MessagesRead {
                conversation_id: id,
                user_id: bob.id,
                count: 1,
            }]
        );
    }

    fn online(users: &[&AuthUser]) -> ServerEvent {
        ServerEvent::UsersOnline(
            users
                .iter()
                .map(|u| OnlineUser {
                    user_id: u.id,
                    username: u.username.clone(),
                })
                .collect(),
        )
    }

    #[tokio::test]
    async fn connect_and_disconnect_rebroadcast_presence() {
        let app = TestApp::new().await;
        let alice = app.user("alice").await;
        let bob = app.user("bob").await;

        let (bob_conn, mut bob_rx) = on_connect(&app.state, &bob).await;
        assert!(app.hub.is_member(bob_conn, Room::User(bob.id)).await);
        assert_eq!(drain(&mut bob_rx), vec![online(&[&bob])]);

        let (first, mut alice_rx) = on_connect(&app.state, &alice).await;
        assert!(app.hub.is_member(first, Room::User(alice.id)).await);
        assert_eq!(drain(&mut bob_rx), vec![online(&[&alice, &bob])]);
        assert_eq!(drain(&mut alice_rx), vec![online(&[&alice, &bob])]);

        // A second tab keeps alice online when the first one closes.
        let (second, _second_rx) = on_connect(&app.state, &alice).await;
        on_disconnect(&app.state, first, &alice).await;
        assert!(app.state.presence.is_online(alice.id).await);
        let events = drain(&mut bob_rx);
        assert_eq!(events.last(), Some(&online(&[&alice, &bob])));

        on_disconnect(&app.state, second, &alice).await;
        assert!(!app.state.presence.is_online(alice.id).await);
        assert_eq!(drain(&mut bob_rx), vec![online(&[&bob])]);
        assert_eq!(app.hub.connection_count().await, 1);
        assert_eq!(app.hub.room_size(Room::User(alice.id)).await, 0);
    }
}
