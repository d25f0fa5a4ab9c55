//! # agora-store
//!
//! SQLite persistence for the Agora messaging core.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed helpers for the user directory mirror,
//! the block registry, conversations and messages, plus [`SharedDatabase`],
//! an async-friendly handle for use from the tokio server.

pub mod blocks;
pub mod conversations;
pub mod database;
pub mod handle;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod users;

mod error;
mod sql;

pub use database::Database;
pub use error::StoreError;
pub use handle::SharedDatabase;
pub use models::*;
