//! Shared fixtures for the server's unit tests: an in-memory database, a
//! freshly generated auth service key and request builders.

use agora_shared::protocol::SendMessageRequest;
use agora_shared::session::create_session_token;
use agora_store::{Database, SharedDatabase};
use axum::body::Body;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use uuid::Uuid;

use crate::api::{build_router, AppState};
use crate::auth::AuthUser;
use crate::config::ServerConfig;
use crate::gateway::Hub;
use crate::service::Messenger;

pub const ADMIN_TOKEN: &str = "test-admin-token";

pub struct TestApp {
    pub state: AppState,
    pub messenger: Messenger,
    pub hub: Hub,
    auth_key: SigningKey,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(configure: impl FnOnce(&mut ServerConfig)) -> Self {
        let auth_key = SigningKey::generate(&mut OsRng);
        let mut config = ServerConfig {
            auth_service_pubkey: auth_key.verifying_key().to_bytes(),
            admin_token: Some(ADMIN_TOKEN.to_string()),
            ..ServerConfig::default()
        };
        configure(&mut config);

        let db = SharedDatabase::new(Database::open_in_memory().expect("in-memory database"));
        let state = AppState::new(config, db);
        Self {
            messenger: state.messenger.clone(),
            hub: state.hub.clone(),
            state,
            auth_key,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Add a user to the directory and return their session identity.
    pub async fn user(&self, username: &str) -> AuthUser {
        let id = Uuid::new_v4();
        let name = username.to_string();
        self.state
            .db
            .call(move |db| db.upsert_user(id, &name, None, None))
            .await
            .expect("upsert user");
        AuthUser {
            id,
            username: username.to_string(),
        }
    }

    pub fn token(&self, user: &AuthUser) -> String {
        create_session_token(
            user.id,
            &user.username,
            Utc::now() + Duration::hours(1),
            &self.auth_key,
        )
        .encode()
    }

    pub async fn conversation(&self, requester: &AuthUser, recipient: &str) -> Uuid {
        let (view, _) = self
            .messenger
            .start_conversation(requester, recipient)
            .await
            .expect("start conversation");
        view.conversation.id
    }

    pub async fn send(&self, sender: &AuthUser, conversation_id: Uuid, content: &str) -> Uuid {
        self.messenger
            .send_message(sender, SendMessageRequest::text(conversation_id, content))
            .await
            .expect("send message")
            .id
    }

    pub fn get(&self, user: &AuthUser, path: &str) -> Request<Body> {
        self.request("GET", user, path, None)
    }

    pub fn delete(&self, user: &AuthUser, path: &str) -> Request<Body> {
        self.request("DELETE", user, path, None)
    }

    pub fn post(&self, user: &AuthUser, path: &str, body: serde_json::Value) -> Request<Body> {
        self.request("POST", user, path, Some(body))
    }

    pub fn patch(&self, user: &AuthUser, path: &str, body: serde_json::Value) -> Request<Body> {
        self.request("PATCH", user, path, Some(body))
    }

    fn request(
        &self,
        method: &str,
        user: &AuthUser,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(path)
            .header("authorization", format!("Bearer {}", self.token(user)));
        match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("valid request")
    }
}

pub async fn body_json(response: Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}
