use agora_store::{Message, Page};
use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{json_body, page_request, path_value, AppState, PageParams};
use crate::auth::AuthUser;
use crate::error::ServerResult;
use crate::service::ConversationView;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct StartConversationBody {
    recipient_username: String,
}

#[derive(Deserialize)]
pub(super) struct ArchiveBody {
    archive: bool,
}

#[derive(Serialize)]
pub(super) struct MarkReadResponse {
    conversation_id: Uuid,
    marked: usize,
}

pub(super) async fn list(
    State(state): State<AppState>,
    user: AuthUser,
    params: Result<Query<PageParams>, QueryRejection>,
) -> ServerResult<Json<Page<ConversationView>>> {
    let page = page_request(params)?;
    Ok(Json(state.messenger.list_conversations(&user, page).await?))
}

/// Get-or-create: 201 when the conversation is new, 200 otherwise.
pub(super) async fn start(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<StartConversationBody>, JsonRejection>,
) -> ServerResult<(StatusCode, Json<ConversationView>)> {
    let body = json_body(body)?;
    let (view, created) = state
        .messenger
        .start_conversation(&user, &body.recipient_username)
        .await?;
    let status = if created { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(view)))
}

pub(super) async fn show(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<Uuid>, PathRejection>,
) -> ServerResult<Json<ConversationView>> {
    let id = path_value(id)?;
    Ok(Json(state.messenger.get_conversation(&user, id).await?))
}

pub(super) async fn archive(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<Uuid>, PathRejection>,
    body: Result<Json<ArchiveBody>, JsonRejection>,
) -> ServerResult<Json<ConversationView>> {
    let id = path_value(id)?;
    let body = json_body(body)?;
    Ok(Json(
        state
            .messenger
            .archive_conversation(&user, id, body.archive)
            .await?,
    ))
}

/// History page. Also marks the page's conversation read for the caller.
pub(super) async fn messages(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<Uuid>, PathRejection>,
    params: Result<Query<PageParams>, QueryRejection>,
) -> ServerResult<Json<Page<Message>>> {
    let id = path_value(id)?;
    let page = page_request(params)?;
    Ok(Json(state.messenger.get_messages(&user, id, page).await?))
}

pub(super) async fn mark_read(
    State(state): State<AppState>,
    user: AuthUser,
    id: Result<Path<Uuid>, PathRejection>,
) -> ServerResult<Json<MarkReadResponse>> {
    let id = path_value(id)?;
    let marked = state.messenger.mark_messages_read(&user, id).await?;
    Ok(Json(MarkReadResponse {
        conversation_id: id,
        marked,
    }))
}
