use thiserror::Error;

/// Rejected client input (empty content, bad pagination, ...).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Malformed session token: {0}")]
    Malformed(String),

    #[error("Session token expired")]
    Expired,

    #[error("Invalid session token signature")]
    BadSignature,

    #[error("Invalid auth service key")]
    InvalidServiceKey,
}
