/// Application name
pub const APP_NAME: &str = "Launchpad";

/// Prefix of the display name synthesized for ids missing from the directory
pub const PLACEHOLDER_NAME_PREFIX: &str = "User";

/// Maximum message body size in bytes (16 KiB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Default HTTP API port (server)
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// SSE event name carrying a newly inserted message
pub const SSE_EVENT_INSERT: &str = "insert";

/// Capacity of the in-process realtime insert feed
pub const DEFAULT_FEED_CAPACITY: usize = 256;
