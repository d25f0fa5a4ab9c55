//! HTTP surface: REST routes, the WebSocket upgrade and the admin API.

mod admin;
mod blocks;
mod conversations;
mod messages;
mod users;

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use agora_shared::types::PageRequest;
use agora_store::SharedDatabase;
use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    extract::{Path, Query, State},
    http::Method,
    middleware,
    routing::{get, patch, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::SessionVerifier;
use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::gateway::{self, Hub};
use crate::presence::Presence;
use crate::rate_limit::{rate_limit_middleware, RateLimiter};
use crate::service::Messenger;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub db: SharedDatabase,
    pub messenger: Messenger,
    pub hub: Hub,
    pub presence: Presence,
    pub verifier: SessionVerifier,
    pub rate_limiter: RateLimiter<IpAddr>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig, db: SharedDatabase) -> Self {
        let config = Arc::new(config);
        let hub = Hub::new(config.max_ws_connections);
        let messenger = Messenger::new(db.clone(), hub.clone(), Arc::clone(&config));

        Self {
            verifier: SessionVerifier::new(config.auth_service_pubkey),
            rate_limiter: RateLimiter::default(),
            presence: Presence::new(),
            started_at: Instant::now(),
            config,
            db,
            messenger,
            hub,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/info", get(server_info))
        .route(
            "/conversations",
            get(conversations::list).post(conversations::start),
        )
        .route("/conversations/:id", get(conversations::show))
        .route("/conversations/:id/archive", patch(conversations::archive))
        .route("/conversations/:id/messages", get(conversations::messages))
        .route("/conversations/:id/read", post(conversations::mark_read))
        .route("/messages", post(messages::send))
        .route(
            "/messages/:id",
            patch(messages::edit).delete(messages::delete),
        )
        .route("/search", get(users::search))
        .route("/unread-count", get(users::unread_count))
        .route("/block", post(blocks::block))
        .route("/unblock", post(blocks::unblock))
        .route("/blocked", get(blocks::blocked))
        .route("/block-status/:username", get(blocks::status))
        .route("/ws", get(gateway::ws_handler))
        .route("/admin/status", get(admin::status))
        .route("/admin/users", post(admin::upsert_user))
        .route(
            "/admin/conversations/:id/repair",
            post(admin::repair_conversation),
        )
        .layer(TimeoutLayer::new(state.config.request_timeout))
        .layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ServerInfoResponse {
    name: String,
    version: &'static str,
    auth_configured: bool,
    max_ws_connections: usize,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn server_info(State(state): State<AppState>) -> Json<ServerInfoResponse> {
    Json(ServerInfoResponse {
        name: state.config.instance_name.clone(),
        version: env!("CARGO_PKG_VERSION"),
        auth_configured: state.config.auth_key_configured(),
        max_ws_connections: state.config.max_ws_connections,
    })
}

// ─── Extractor helpers ───
//
// Rejections are folded into `ServerError` so every failure carries the same
// `{error, kind}` body.

#[derive(Debug, Default, Deserialize)]
struct PageParams {
    page: Option<u32>,
    limit: Option<u32>,
}

fn page_request(params: Result<Query<PageParams>, QueryRejection>) -> ServerResult<PageRequest> {
    let Query(params) = params.map_err(|e| ServerError::Validation(e.body_text()))?;
    Ok(PageRequest::new(params.page, params.limit)?)
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> ServerResult<T> {
    body.map(|Json(value)| value)
        .map_err(|e| ServerError::Validation(e.body_text()))
}

fn path_value<T>(path: Result<Path<T>, PathRejection>) -> ServerResult<T> {
    path.map(|Path(value)| value)
        .map_err(|e| ServerError::Validation(e.body_text()))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{body_json, TestApp};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_is_public() {
        let app = TestApp::new().await;
        let response = app
            .router()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn info_reports_instance() {
        let app = TestApp::new().await;
        let response = app
            .router()
            .oneshot(Request::get("/info").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["auth_configured"], true);
    }

    #[tokio::test]
    async fn missing_session_is_unauthorized() {
        let app = TestApp::new().await;
        let response = app
            .router()
            .oneshot(Request::get("/conversations").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["kind"], "unauthorized");
    }

    #[tokio::test]
    async fn bad_pagination_is_validation() {
        let app = TestApp::new().await;
        let alice = app.user("alice").await;
        let response = app
            .router()
            .oneshot(app.get(&alice, "/conversations?page=0"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["kind"], "validation");

        let response = app
            .router()
            .oneshot(app.get(&alice, "/conversations?limit=500"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
