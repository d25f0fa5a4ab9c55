//! Operator endpoints, guarded by the `ADMIN_TOKEN` bearer token.

use agora_store::{Conversation, User};
use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::{json_body, path_value, AppState};
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

#[derive(Serialize)]
pub(super) struct AdminStatusResponse {
    name: String,
    version: &'static str,
    uptime_secs: u64,
    connections: usize,
    online_users: usize,
    rooms: usize,
    database_path: Option<String>,
}

/// A directory entry pushed by the user service.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct UpsertUserBody {
    id: Uuid,
    username: String,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    avatar_url: Option<String>,
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ServerError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ServerError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    // Constant-time comparison to prevent timing attacks on admin token.
    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ServerError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

pub(super) async fn status(
    headers: HeaderMap,
    State(state): State<AppState>,
) -> ServerResult<Json<AdminStatusResponse>> {
    verify_admin_token(&headers, &state.config)?;

    let database_path = state
        .db
        .call(|db| Ok(db.path().map(|p| p.display().to_string())))
        .await?;

    Ok(Json(AdminStatusResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: state.started_at.elapsed().as_secs(),
        connections: state.hub.connection_count().await,
        online_users: state.presence.online_count().await,
        rooms: state.hub.room_count().await,
        database_path,
    }))
}

pub(super) async fn upsert_user(
    headers: HeaderMap,
    State(state): State<AppState>,
    body: Result<Json<UpsertUserBody>, JsonRejection>,
) -> ServerResult<Json<User>> {
    verify_admin_token(&headers, &state.config)?;
    let body = json_body(body)?;

    let username = body.username.trim().to_string();
    if username.is_empty() {
        return Err(ServerError::Validation("Username is required".into()));
    }

    let user = state
        .db
        .call(move |db| {
            db.upsert_user(
                body.id,
                &username,
                body.display_name.as_deref(),
                body.avatar_url.as_deref(),
            )
        })
        .await?;

    info!(user = %user.id, username = %user.username, "Admin synced directory entry");
    Ok(Json(user))
}

pub(super) async fn repair_conversation(
    headers: HeaderMap,
    State(state): State<AppState>,
    id: Result<Path<Uuid>, PathRejection>,
) -> ServerResult<Json<Conversation>> {
    verify_admin_token(&headers, &state.config)?;
    let id = path_value(id)?;

    let conversation = state.db.call(move |db| db.repair_conversation(id)).await?;

    info!(conversation = %id, "Admin repaired conversation summary");
    Ok(Json(conversation))
}
