use agora_shared::protocol::SendMessageRequest;
use agora_store::Message;
use axum::{
    extract::rejection::{JsonRejection, PathRejection},
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{json_body, path_value, AppState};
use crate::auth::AuthUser;
use crate::error::ServerResult;

#[derive(Deserialize)]
pub(super) struct EditMessageBody {
    content: String,
}

pub(super) async fn send(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<SendMessageRequest>, JsonRejection>,
) -> ServerResult<(StatusCode, Json<Message>)> {
    let request = json_body(body)?;
    let message = state.messenger.send_message(&user, request).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub(super) async fn edit(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<EditMessageBody>, JsonRejection>,
) -> ServerResult<Json<Message>> {
    let id = path_value(id)?;
    let body = json_body(body)?;
    Ok(Json(state.messenger.edit_message(&user, id, body.content).await?))
}

pub(super) async fn delete(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<Uuid>, PathRejection>,
) -> ServerResult<Json<Message>> {
    let id = path_value(id)?;
    Ok(Json(state.messenger.delete_message(&user, id).await?))
}
