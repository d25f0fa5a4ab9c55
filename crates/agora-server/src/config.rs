//! Server configuration loaded from environment variables.
//!
//! All settings have sensible defaults so the server can start with zero
//! configuration for local development.

use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use agora_shared::constants::{APP_NAME, DEFAULT_HTTP_PORT, DEFAULT_SEARCH_RESULT_LIMIT};
use agora_shared::session::parse_service_pubkey;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Socket address for the HTTP (axum) API server.
    /// Env: `HTTP_ADDR`
    /// Default: `0.0.0.0:8080`
    pub http_addr: SocketAddr,

    /// SQLite database file.
    /// Env: `DATABASE_PATH`
    /// Default: `None` (platform data directory).
    pub database_path: Option<PathBuf>,

    /// Ed25519 public key of the auth service (hex-encoded, 64 chars).
    /// Env: `AUTH_SERVICE_PUBKEY`
    /// Default: all-zeros, which rejects every session (development only).
    pub auth_service_pubkey: [u8; 32],

    /// Admin API bearer token. Required to access /admin/* endpoints.
    /// Env: `ADMIN_TOKEN`
    /// Default: empty (admin API disabled).
    pub admin_token: Option<String>,

    /// Human-readable name for this server instance.
    /// Env: `INSTANCE_NAME`
    pub instance_name: String,

    /// Upper bound on the time spent serving one HTTP request.
    /// Env: `REQUEST_TIMEOUT_SECS`
    /// Default: 15 seconds
    pub request_timeout: Duration,

    /// Maximum number of concurrent WebSocket connections.
    /// Env: `MAX_WS_CONNECTIONS`
    /// Default: `1024`
    pub max_ws_connections: usize,

    /// Maximum number of users returned by a search.
    /// Env: `SEARCH_RESULT_LIMIT`
    /// Default: `10`
    pub search_result_limit: u32,

    /// Whether message history includes tombstoned (deleted) messages.
    /// Env: `SHOW_DELETED_MESSAGES` (true/false)
    /// Default: `true`
    pub show_deleted_messages: bool,

    /// Sustained per-user send rate, in messages per second.
    /// Env: `MESSAGE_RATE_PER_SEC`
    /// Default: `5`
    pub message_rate_per_sec: f64,

    /// Per-user send burst.
    /// Env: `MESSAGE_BURST`
    /// Default: `20`
    pub message_burst: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: ([0, 0, 0, 0], DEFAULT_HTTP_PORT).into(),
            database_path: None,
            auth_service_pubkey: [0u8; 32],
            admin_token: None,
            instance_name: format!("{APP_NAME} Messaging"),
            request_timeout: Duration::from_secs(15),
            max_ws_connections: 1024,
            search_result_limit: DEFAULT_SEARCH_RESULT_LIMIT,
            show_deleted_messages: true,
            message_rate_per_sec: 5.0,
            message_burst: 20.0,
        }
    }
}

// Hand-written so the admin token never reaches the logs.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("http_addr", &self.http_addr)
            .field("database_path", &self.database_path)
            .field("auth_service_pubkey", &hex::encode(self.auth_service_pubkey))
            .field("admin_token", &self.admin_token.as_ref().map(|_| "<redacted>"))
            .field("instance_name", &self.instance_name)
            .field("request_timeout", &self.request_timeout)
            .field("max_ws_connections", &self.max_ws_connections)
            .field("search_result_limit", &self.search_result_limit)
            .field("show_deleted_messages", &self.show_deleted_messages)
            .field("message_rate_per_sec", &self.message_rate_per_sec)
            .field("message_burst", &self.message_burst)
            .finish()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Malformed values
    /// are logged and replaced by the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(addr) = lookup("HTTP_ADDR") {
            match addr.parse::<SocketAddr>() {
                Ok(parsed) => config.http_addr = parsed,
                Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
            }
        }

        if let Some(path) = lookup("DATABASE_PATH").filter(|p| !p.is_empty()) {
            config.database_path = Some(PathBuf::from(path));
        }

        if let Some(hex_key) = lookup("AUTH_SERVICE_PUBKEY") {
            match parse_service_pubkey(&hex_key) {
                Ok(key) => config.auth_service_pubkey = key,
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        "Invalid AUTH_SERVICE_PUBKEY, using default (dev-only)"
                    );
                }
            }
        }

        if let Some(token) = lookup("ADMIN_TOKEN") {
            if !token.is_empty() {
                config.admin_token = Some(token);
            }
        }

        if let Some(name) = lookup("INSTANCE_NAME") {
            config.instance_name = name;
        }

        if let Some(secs) = parse_var::<u64>(&lookup, "REQUEST_TIMEOUT_SECS") {
            if secs > 0 {
                config.request_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(n) = parse_var::<usize>(&lookup, "MAX_WS_CONNECTIONS") {
            if n > 0 {
                config.max_ws_connections = n;
            }
        }

        if let Some(n) = parse_var::<u32>(&lookup, "SEARCH_RESULT_LIMIT") {
            if n > 0 {
                config.search_result_limit = n;
            }
        }

        if let Some(val) = lookup("SHOW_DELETED_MESSAGES") {
            config.show_deleted_messages = val != "false" && val != "0";
        }

        if let Some(rate) = parse_var::<f64>(&lookup, "MESSAGE_RATE_PER_SEC") {
            if rate > 0.0 {
                config.message_rate_per_sec = rate;
            }
        }

        if let Some(burst) = parse_var::<f64>(&lookup, "MESSAGE_BURST") {
            if burst >= 1.0 {
                config.message_burst = burst;
            }
        }

        // RUST_LOG is handled directly by tracing-subscriber's EnvFilter,
        // so we do not store it here.

        config
    }

    pub fn auth_key_configured(&self) -> bool {
        self.auth_service_pubkey != [0u8; 32]
    }
}

fn parse_var<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}
