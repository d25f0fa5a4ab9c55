use agora_store::{UnreadSummary, User};
use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use super::AppState;
use crate::auth::AuthUser;
use crate::error::ServerResult;

#[derive(Deserialize)]
pub(super) struct SearchParams {
    #[serde(default)]
    query: String,
}

pub(super) async fn search(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<SearchParams>,
) -> ServerResult<Json<Vec<User>>> {
    Ok(Json(state.messenger.search_users(&user, &params.query).await?))
}

pub(super) async fn unread_count(
    State(state): State<AppState>,
    user: AuthUser,
) -> ServerResult<Json<UnreadSummary>> {
    Ok(Json(state.messenger.unread_count(&user).await?))
}
