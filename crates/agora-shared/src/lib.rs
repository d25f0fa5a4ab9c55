//! # agora-shared
//!
//! Types shared by the Agora messaging crates: limits and constants, the
//! message type and room enums, pagination requests, inbound realtime
//! events, and the signed session tokens issued by the auth service.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod session;
pub mod types;

pub use error::{SessionError, ValidationError};
