//! Session verification.
//!
//! Verifies [`SessionToken`]s issued by the external auth service using
//! ed25519-dalek and resolves them to an [`AuthUser`]. The same extractor
//! guards REST handlers and the WebSocket upgrade.

use agora_shared::constants::SESSION_COOKIE;
use agora_shared::session::SessionToken;
use agora_shared::SessionError;
use axum::extract::FromRequestParts;
use axum::http::header::{AUTHORIZATION, COOKIE};
use axum::http::request::Parts;
use tracing::debug;
use uuid::Uuid;

use crate::api::AppState;
use crate::error::ServerError;

/// The identity the auth service vouched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub id: Uuid,
    pub username: String,
}

/// Checks session tokens against the auth service public key.
#[derive(Clone)]
pub struct SessionVerifier {
    service_pubkey: [u8; 32],
}

impl SessionVerifier {
    pub fn new(service_pubkey: [u8; 32]) -> Self {
        Self { service_pubkey }
    }

    /// Decode and verify a wire-form token.
    ///
    /// The all-zero development key rejects everything.
    pub fn verify(&self, encoded: &str) -> Result<AuthUser, SessionError> {
        if self.service_pubkey == [0u8; 32] {
            return Err(SessionError::InvalidServiceKey);
        }

        let token = SessionToken::decode(encoded)?;
        token.verify_with_key(&self.service_pubkey)?;

        debug!(user = %token.user_id, "session verified");
        Ok(AuthUser {
            id: token.user_id,
            username: token.username,
        })
    }
}

/// Pull the session token out of the request: `Authorization: Bearer`, then
/// the session cookie, then a `token` query parameter (browsers cannot set
/// headers on a WebSocket handshake).
pub fn session_token_from_parts(parts: &Parts) -> Option<String> {
    if let Some(bearer) = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
    {
        return Some(bearer.trim().to_string());
    }

    let cookie = parts
        .headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string());
    if cookie.is_some() {
        return cookie;
    }

    parts
        .uri
        .query()?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == "token")
        .map(|(_, value)| value.to_string())
}

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = session_token_from_parts(parts)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| ServerError::Unauthorized("Missing session token".into()))?;

        state.verifier.verify(&token).map_err(|e| {
            debug!(error = %e, "session rejected");
            ServerError::from(e)
        })
    }
}
