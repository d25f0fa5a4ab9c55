/// Application name
pub const APP_NAME: &str = "Agora";

/// Maximum message content length, counted in characters.
pub const MAX_MESSAGE_LENGTH: usize = 1000;

/// Content that replaces the body of a soft-deleted message.
pub const DELETED_MESSAGE_TOMBSTONE: &str = "This message was deleted";

/// Maximum length of a block reason, counted in characters.
pub const MAX_BLOCK_REASON_LENGTH: usize = 200;

/// Page size used when the client does not send `limit`.
pub const DEFAULT_PAGE_LIMIT: u32 = 50;

/// Largest page size a client may request.
pub const MAX_PAGE_LIMIT: u32 = 100;

/// Minimum number of characters in a user search query.
pub const MIN_SEARCH_QUERY_LENGTH: usize = 2;

/// Default cap on user search results.
pub const DEFAULT_SEARCH_RESULT_LIMIT: u32 = 10;

/// Prefix of the personal notification room of a user.
pub const USER_ROOM_PREFIX: &str = "user:";

/// Prefix of the room of a conversation.
pub const CONVERSATION_ROOM_PREFIX: &str = "conversation:";

/// Cookie carrying the session token on browser connections.
pub const SESSION_COOKIE: &str = "session";

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;
