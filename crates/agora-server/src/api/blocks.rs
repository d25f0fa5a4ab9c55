use agora_store::{Block, BlockStatus};
use axum::{
    extract::rejection::JsonRejection,
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use super::{json_body, AppState};
use crate::auth::AuthUser;
use crate::error::ServerResult;

#[derive(Deserialize)]
pub(super) struct BlockBody {
    username: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
pub(super) struct UnblockBody {
    username: String,
}

pub(super) async fn block(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<BlockBody>, JsonRejection>,
) -> ServerResult<Json<Block>> {
    let body = json_body(body)?;
    Ok(Json(
        state
            .messenger
            .block_user(&user, &body.username, body.reason)
            .await?,
    ))
}

pub(super) async fn unblock(
    State(state): State<AppState>,
    user: AuthUser,
    body: Result<Json<UnblockBody>, JsonRejection>,
) -> ServerResult<Json<Block>> {
    let body = json_body(body)?;
    Ok(Json(state.messenger.unblock_user(&user, &body.username).await?))
}

pub(super) async fn blocked(
    State(state): State<AppState>,
    user: AuthUser,
) -> ServerResult<Json<Vec<Block>>> {
    Ok(Json(state.messenger.blocked_users(&user).await?))
}

pub(super) async fn status(
    State(state): State<AppState>,
    user: AuthUser,
    Path(username): Path<String>,
) -> ServerResult<Json<BlockStatus>> {
    Ok(Json(state.messenger.block_status(&user, &username).await?))
}

#[cfg(test)]
mod tests {
    use crate::testing::{body_json, TestApp};
    use axum::http::StatusCode;
    use serde_json::json;
    use tower::ServiceExt;

    #[tokio::test]
    async fn block_registry_over_http() {
        let app = TestApp::new().await;
        let alice = app.user("alice").await;
        let bob = app.user("bob").await;

        let response = app
            .router()
            .oneshot(app.post(&alice, "/block", json!({ "username": "bob", "reason": "trolling" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let block = body_json(response).await;
        assert_eq!(block["blocked_username"], "bob");
        assert_eq!(block["is_active"], true);

        let response = app
            .router()
            .oneshot(app.post(&alice, "/block", json!({ "username": "bob" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = app.router().oneshot(app.get(&alice, "/blocked")).await.unwrap();
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

        let response = app
            .router()
            .oneshot(app.get(&bob, "/block-status/alice"))
            .await
            .unwrap();
        assert_eq!(
            body_json(response).await,
            json!({ "is_blocked": false, "is_blocked_by": true })
        );

        let response = app
            .router()
            .oneshot(app.post(&bob, "/unblock", json!({ "username": "alice" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn self_block_is_forbidden() {
        let app = TestApp::new().await;
        let alice = app.user("alice").await;
        let response = app
            .router()
            .oneshot(app.post(&alice, "/block", json!({ "username": "alice" })))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn unknown_user_is_not_found() {
        let app = TestApp::new().await;
        let alice = app.user("alice").await;
        let response = app
            .router()
            .oneshot(app.get(&alice, "/block-status/ghost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
